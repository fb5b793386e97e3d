//! Common infrastructure for the static multicast routing daemon.
//!
//! This crate provides functionality shared by the multicast routing
//! components of `mroutemgrd`:
//!
//! - [`family`]: The forwarding family abstraction (IPv4/IPv6)
//! - [`error`]: Error types for multicast routing operations
//! - [`sysctl`]: Best-effort access to the kernel's `/proc/sys` knobs
//!
//! # Architecture
//!
//! The kernel exposes one multicast forwarding API per address family.
//! Both APIs share the same shape:
//!
//! 1. Open a raw control socket and lock the API with an "init" option
//! 2. Register interfaces in a small, fixed-size slot table (VIF/MIF)
//! 3. Add and delete (S,G) forwarding cache entries
//! 4. Release the lock with a "done" option, which flushes all entries
//!
//! Code that is generic over [`Family`] works for both APIs.
//!
//! # Example
//!
//! ```
//! use mroute_common::{Family, V4, V6};
//!
//! assert_eq!(V4::NAME, "IPv4");
//! assert!(V6::is_wildcard(&V6::WILDCARD));
//! ```

pub mod error;
pub mod family;
pub mod sysctl;

// Re-export commonly used items at crate root
pub use error::{MrouteError, MrouteResult};
pub use family::{AddressFamily, Family, Slot, MAX_SLOTS, V4, V6};
