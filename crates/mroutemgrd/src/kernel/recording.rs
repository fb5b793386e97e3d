//! Recording control channel
//!
//! Stands in for the kernel in tests and `--dry-run` mode: every operation
//! is captured in order, and kernel error codes can be injected per
//! operation type.

use mroute_common::{Family, Slot};
use nix::errno::Errno;
use tracing::debug;

use super::ControlChannel;
use crate::iface::Interface;
use crate::types::Route;

/// A captured control channel operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelOp<F: Family> {
    Init,
    Done,
    AddSlot {
        slot: Slot,
        ifindex: u32,
        name: String,
    },
    AddRoute(Route<F>),
    DelRoute {
        sender: F::Addr,
        group: F::Addr,
    },
}

/// Control channel that records instead of calling the kernel.
#[derive(Debug, Clone)]
pub struct RecordingChannel<F: Family> {
    open: bool,
    ops: Vec<KernelOp<F>>,
    open_error: Option<Errno>,
    add_slot_error: Option<Errno>,
    add_route_error: Option<Errno>,
    del_route_error: Option<Errno>,
}

impl<F: Family> RecordingChannel<F> {
    pub fn new() -> Self {
        Self {
            open: false,
            ops: Vec::new(),
            open_error: None,
            add_slot_error: None,
            add_route_error: None,
            del_route_error: None,
        }
    }

    /// Fails every open with `errno`.
    pub fn with_open_error(mut self, errno: Errno) -> Self {
        self.open_error = Some(errno);
        self
    }

    /// Fails every slot registration with `errno`.
    pub fn with_add_slot_error(mut self, errno: Errno) -> Self {
        self.add_slot_error = Some(errno);
        self
    }

    /// Fails every route install with `errno`.
    pub fn with_add_route_error(mut self, errno: Errno) -> Self {
        self.add_route_error = Some(errno);
        self
    }

    /// Fails every route removal with `errno`.
    pub fn with_del_route_error(mut self, errno: Errno) -> Self {
        self.del_route_error = Some(errno);
        self
    }

    /// Changes the injected route install error mid-run.
    pub fn set_add_route_error(&mut self, errno: Option<Errno>) {
        self.add_route_error = errno;
    }

    /// Changes the injected route removal error mid-run.
    pub fn set_del_route_error(&mut self, errno: Option<Errno>) {
        self.del_route_error = errno;
    }

    /// Captured operations, oldest first.
    pub fn ops(&self) -> &[KernelOp<F>] {
        &self.ops
    }

    /// Drains the captured operations.
    pub fn take_ops(&mut self) -> Vec<KernelOp<F>> {
        std::mem::take(&mut self.ops)
    }

    /// Routes installed so far.
    pub fn added_routes(&self) -> Vec<Route<F>> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                KernelOp::AddRoute(route) => Some(*route),
                _ => None,
            })
            .collect()
    }

    /// (sender, group) pairs removed so far.
    pub fn deleted_routes(&self) -> Vec<(F::Addr, F::Addr)> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                KernelOp::DelRoute { sender, group } => Some((*sender, *group)),
                _ => None,
            })
            .collect()
    }

    fn record(&mut self, op: KernelOp<F>, error: Option<Errno>) -> Result<(), Errno> {
        debug!("{} control channel: {:?}", F::NAME, op);
        self.ops.push(op);
        match error {
            Some(errno) => Err(errno),
            None => Ok(()),
        }
    }
}

impl<F: Family> Default for RecordingChannel<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: Family> ControlChannel<F> for RecordingChannel<F> {
    fn open(&mut self) -> Result<(), Errno> {
        let error = self.open_error;
        self.record(KernelOp::Init, error)?;
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> Result<(), Errno> {
        self.open = false;
        self.record(KernelOp::Done, None)
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn add_slot(&mut self, slot: Slot, iface: &Interface) -> Result<(), Errno> {
        let error = self.add_slot_error;
        self.record(
            KernelOp::AddSlot {
                slot,
                ifindex: iface.ifindex,
                name: iface.name.clone(),
            },
            error,
        )
    }

    fn add_route(&mut self, route: &Route<F>) -> Result<(), Errno> {
        let error = self.add_route_error;
        self.record(KernelOp::AddRoute(*route), error)
    }

    fn del_route(&mut self, sender: F::Addr, group: F::Addr) -> Result<(), Errno> {
        let error = self.del_route_error;
        self.record(KernelOp::DelRoute { sender, group }, error)
    }
}
