//! Raw socket control channel (Linux)
//!
//! IPv4 uses a raw IGMP socket, IPv6 a raw ICMPv6 socket. The same socket
//! carries the kernel's upcall messages, so it is opened non-blocking for
//! the event loop.

use std::marker::PhantomData;
use std::mem;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;

use libc::{c_int, c_void, socklen_t};
use mroute_common::Slot;
use nix::errno::Errno;
use tracing::debug;

use super::sys::KernelFamily;
use super::ControlChannel;
use crate::iface::Interface;
use crate::types::Route;

/// Kernel control socket for one family.
#[derive(Debug)]
pub struct SocketChannel<F: KernelFamily> {
    /// Held for the enable/disable bracket; dropping it closes the socket
    fd: Option<OwnedFd>,
    _family: PhantomData<F>,
}

impl<F: KernelFamily> SocketChannel<F> {
    pub fn new() -> Self {
        Self {
            fd: None,
            _family: PhantomData,
        }
    }

    fn fd(&self) -> Result<&OwnedFd, Errno> {
        self.fd.as_ref().ok_or(Errno::EBADF)
    }
}

impl<F: KernelFamily> Default for SocketChannel<F> {
    fn default() -> Self {
        Self::new()
    }
}

/// `setsockopt(2)` with a fixed-layout record, or no payload.
fn set_opt<T>(fd: &OwnedFd, level: c_int, name: c_int, value: Option<&T>) -> Result<(), Errno> {
    let (ptr, len) = match value {
        Some(value) => (
            value as *const T as *const c_void,
            mem::size_of::<T>() as socklen_t,
        ),
        None => (ptr::null(), 0),
    };

    // SAFETY: ptr is null with len 0, or points at a live T of len bytes
    let rc = unsafe { libc::setsockopt(fd.as_raw_fd(), level, name, ptr, len) };
    if rc < 0 {
        Err(Errno::last())
    } else {
        Ok(())
    }
}

impl<F: KernelFamily> ControlChannel<F> for SocketChannel<F> {
    fn open(&mut self) -> Result<(), Errno> {
        if self.fd.is_some() {
            return Ok(());
        }

        // SAFETY: plain socket(2) call, result checked below
        let raw = unsafe {
            libc::socket(
                F::DOMAIN,
                libc::SOCK_RAW | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                F::PROTOCOL,
            )
        };
        if raw < 0 {
            return Err(Errno::last());
        }
        // SAFETY: raw is a freshly created descriptor owned by nobody else
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let on: c_int = 1;
        set_opt(&fd, F::LEVEL, F::OPTS.init, Some(&on))?;

        debug!("{} control socket open on fd {}", F::NAME, raw);
        self.fd = Some(fd);
        Ok(())
    }

    fn close(&mut self) -> Result<(), Errno> {
        let Some(fd) = self.fd.take() else {
            return Ok(());
        };
        set_opt::<c_int>(&fd, F::LEVEL, F::OPTS.done, None)
    }

    fn is_open(&self) -> bool {
        self.fd.is_some()
    }

    fn add_slot(&mut self, slot: Slot, iface: &Interface) -> Result<(), Errno> {
        let ctl = F::slot_ctl(slot, iface);
        set_opt(self.fd()?, F::LEVEL, F::OPTS.add_slot, Some(&ctl))
    }

    fn add_route(&mut self, route: &Route<F>) -> Result<(), Errno> {
        let ctl = F::mfc_ctl(route);
        set_opt(self.fd()?, F::LEVEL, F::OPTS.add_mfc, Some(&ctl))
    }

    fn del_route(&mut self, sender: F::Addr, group: F::Addr) -> Result<(), Errno> {
        let ctl = F::mfc_del_ctl(sender, group);
        set_opt(self.fd()?, F::LEVEL, F::OPTS.del_mfc, Some(&ctl))
    }

    fn upcall_fd(&self) -> Option<RawFd> {
        self.fd.as_ref().map(AsRawFd::as_raw_fd)
    }
}
