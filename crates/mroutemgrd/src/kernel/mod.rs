//! Kernel multicast routing API adapter
//!
//! [`ControlChannel`] is the raw per-family control socket: open/init,
//! done/close, register slot, add and delete forwarding entries, each
//! returning the kernel's error code. [`MrouteApi`] wraps a channel and
//! turns those codes into [`MrouteError`]s and log lines.

mod recording;
#[cfg(target_os = "linux")]
mod socket;
pub mod sys;

use std::marker::PhantomData;
use std::os::unix::io::RawFd;

use mroute_common::{AddressFamily, Family, MrouteError, MrouteResult, Slot};
use nix::errno::Errno;
use tracing::{error, info, warn};

use crate::iface::Interface;
use crate::types::Route;

pub use recording::{KernelOp, RecordingChannel};
#[cfg(target_os = "linux")]
pub use socket::SocketChannel;
pub use sys::KernelFamily;

/// Reads one message from a non-blocking control channel descriptor.
pub fn read_upcall(fd: RawFd, buf: &mut [u8]) -> std::io::Result<usize> {
    // SAFETY: buf is valid for writes of buf.len() bytes
    let rc = unsafe { libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), 0) };
    if rc < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(rc as usize)
    }
}

/// Log target for enable-time soft failures.
pub const INIT_TARGET: &str = "mroutemgrd::init";

/// A family's multicast routing control channel.
pub trait ControlChannel<F: Family> {
    /// Opens the channel and takes the kernel's multicast routing lock.
    fn open(&mut self) -> Result<(), Errno>;

    /// Releases the lock, flushing every kernel entry, and closes the
    /// channel. The channel is closed even if the release fails.
    fn close(&mut self) -> Result<(), Errno>;

    fn is_open(&self) -> bool;

    /// Registers `iface` in kernel slot `slot`.
    fn add_slot(&mut self, slot: Slot, iface: &Interface) -> Result<(), Errno>;

    /// Adds a forwarding cache entry.
    fn add_route(&mut self, route: &Route<F>) -> Result<(), Errno>;

    /// Deletes the forwarding cache entry for (sender, group).
    fn del_route(&mut self, sender: F::Addr, group: F::Addr) -> Result<(), Errno>;

    /// File descriptor the kernel delivers upcalls on.
    fn upcall_fd(&self) -> Option<RawFd> {
        None
    }
}

/// How an installed route came to be, for log context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    /// Configured with an explicit sender
    Concrete,
    /// Spawned from a (*,G) template by an upcall
    Dynamic,
}

/// Kernel API adapter for one family.
pub struct MrouteApi<F: Family, C: ControlChannel<F>> {
    channel: C,
    _family: PhantomData<F>,
}

impl<F: Family, C: ControlChannel<F>> MrouteApi<F, C> {
    pub fn new(channel: C) -> Self {
        Self {
            channel,
            _family: PhantomData,
        }
    }

    /// Opens the control channel.
    ///
    /// Every failure is soft: the family stays disabled and the caller
    /// carries on without it.
    pub fn enable(&mut self) -> MrouteResult<()> {
        if self.channel.is_open() {
            return Ok(());
        }

        match self.channel.open() {
            Ok(()) => {
                info!("{} multicast routing API enabled", F::NAME);
                Ok(())
            }
            Err(Errno::EADDRINUSE) => {
                warn!(target: INIT_TARGET, "{} multicast routing API already in use", F::NAME);
                Err(MrouteError::AddressInUse { family: F::FAMILY })
            }
            Err(errno @ (Errno::EOPNOTSUPP | Errno::ENOPROTOOPT)) => {
                warn!(
                    target: INIT_TARGET,
                    "Kernel does not support {} multicast routing ({}), skipping...",
                    F::NAME,
                    errno
                );
                Err(MrouteError::Unsupported { family: F::FAMILY })
            }
            Err(errno) => {
                warn!(
                    target: INIT_TARGET,
                    "Failed initializing {} multicast routing API: {}",
                    F::NAME,
                    errno
                );
                Err(MrouteError::ChannelOpen {
                    family: F::FAMILY,
                    errno,
                })
            }
        }
    }

    /// Releases the kernel lock and closes the channel. Failures are
    /// logged only.
    pub fn disable(&mut self) {
        if !self.channel.is_open() {
            return;
        }

        if let Err(errno) = self.channel.close() {
            error!("{}: {}", sys::opt_names(F::FAMILY).done, errno);
        }
        info!("{} multicast routing API disabled", F::NAME);
    }

    pub fn is_enabled(&self) -> bool {
        self.channel.is_open()
    }

    fn ensure_enabled(&self) -> MrouteResult<()> {
        if self.channel.is_open() {
            Ok(())
        } else {
            Err(MrouteError::Disabled { family: F::FAMILY })
        }
    }

    /// Registers an interface slot with the kernel.
    pub fn add_slot(&mut self, slot: Slot, iface: &Interface) -> MrouteResult<()> {
        self.ensure_enabled()?;

        match iface.inaddr {
            Some(addr) if F::FAMILY == AddressFamily::Ipv4 => info!(
                "Add {}: {} Ifindex: {} Flags: 0x0000 IP: {} Ifname: {}",
                F::SLOT_NAME,
                slot,
                iface.ifindex,
                addr,
                iface.name
            ),
            _ => info!(
                "Add {}: {} Ifindex: {} Flags: 0x0000 Ifname: {}",
                F::SLOT_NAME,
                slot,
                iface.ifindex,
                iface.name
            ),
        }

        self.channel.add_slot(slot, iface).map_err(|errno| {
            let op = sys::opt_names(F::FAMILY).add_slot;
            error!("{} {}: {}", op, iface.name, errno);
            MrouteError::kernel_reject(op, errno)
        })
    }

    /// Installs a forwarding entry.
    pub fn install(&mut self, route: &Route<F>, kind: RouteKind) -> MrouteResult<()> {
        self.ensure_enabled()?;

        info!(
            "Add MFC: {} -> {}, inbound {}: {} ({:?})",
            route.sender,
            route.group,
            F::SLOT_NAME,
            route.inbound,
            kind
        );

        self.channel.add_route(route).map_err(|errno| {
            let op = sys::opt_names(F::FAMILY).add_mfc;
            warn!("{} {} -> {}: {}", op, route.sender, route.group, errno);
            MrouteError::kernel_reject(op, errno)
        })
    }

    /// Removes the forwarding entry for (sender, group).
    pub fn remove(&mut self, sender: F::Addr, group: F::Addr) -> MrouteResult<()> {
        self.ensure_enabled()?;

        info!("Del MFC: {} -> {}", sender, group);

        self.channel.del_route(sender, group).map_err(|errno| {
            let op = sys::opt_names(F::FAMILY).del_mfc;
            warn!("{} {} -> {}: {}", op, sender, group, errno);
            MrouteError::kernel_reject(op, errno)
        })
    }

    pub fn upcall_fd(&self) -> Option<RawFd> {
        self.channel.upcall_fd()
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }
}
