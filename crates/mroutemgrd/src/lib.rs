//! Static multicast routing daemon
//!
//! Programs the kernel's IPv4 and IPv6 multicast forwarding caches from a
//! static configuration. (*,G) routes are kept as templates and turned
//! into (S,G) kernel entries when the kernel reports traffic from a new
//! sender.

mod config;
mod daemon;
mod iface;
pub mod kernel;
mod mroute_mgr;
mod store;
mod types;
mod upcall;
mod vif;

pub use config::{DaemonConfig, MrouteConfig, MrouteEntry, OutboundSpec, DEFAULT_CONFIG_PATH};
pub use daemon::MrouteDaemon;
pub use iface::{Interface, InterfaceDirectory};
pub use kernel::{ControlChannel, KernelOp, MrouteApi, RecordingChannel, RouteKind};
#[cfg(target_os = "linux")]
pub use kernel::SocketChannel;
pub use mroute_mgr::MrouteMgr;
pub use store::{DynamicId, RouteStore};
pub use types::{ForwardingVector, Operation, Route, RouteKey, RouteRequest, DEFAULT_TTL};
pub use upcall::{Upcall, UpcallError, UpcallFamily, UpcallKind};
pub use vif::{SlotEntry, VifTable};
