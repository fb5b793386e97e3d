//! Error types for multicast routing operations.
//!
//! This module defines the error types used throughout the mroute crates.
//! All errors implement `std::error::Error` via `thiserror`.

use std::io;

use nix::errno::Errno;
use thiserror::Error;

use crate::family::AddressFamily;

/// Result type alias for multicast routing operations.
pub type MrouteResult<T> = Result<T, MrouteError>;

/// Errors that can occur during multicast routing operations.
#[derive(Debug, Error)]
pub enum MrouteError {
    /// Another process already holds the kernel multicast routing lock.
    #[error("{family} multicast routing API already in use")]
    AddressInUse {
        /// The family that could not be enabled.
        family: AddressFamily,
    },

    /// The kernel lacks multicast routing support for the family.
    #[error("Kernel does not support {family} multicast routing")]
    Unsupported {
        /// The family that could not be enabled.
        family: AddressFamily,
    },

    /// Opening or initializing the control channel failed.
    #[error("Failed initializing {family} multicast routing API: {errno}")]
    ChannelOpen {
        /// The family that could not be enabled.
        family: AddressFamily,
        /// The underlying kernel error code.
        errno: Errno,
    },

    /// The family has not been enabled (or failed to enable).
    #[error("{family} multicast routing is not enabled")]
    Disabled {
        /// The disabled family.
        family: AddressFamily,
    },

    /// No free interface slot left.
    #[error("Out of {family} interface slots for '{iface}'")]
    ResourceExhausted {
        /// The family whose slot table is full.
        family: AddressFamily,
        /// The interface left without a slot.
        iface: String,
    },

    /// The kernel rejected a control operation.
    #[error("Kernel rejected {op}: {errno}")]
    KernelReject {
        /// The socket option that failed (e.g. "MRT_ADD_MFC").
        op: &'static str,
        /// The underlying kernel error code.
        errno: Errno,
    },

    /// No (*,G) template matched an upcall.
    #[error("No (*,G) match for ({sender}, {group}) on slot {inbound}")]
    NoMatch {
        /// Sender address from the upcall.
        sender: String,
        /// Group address from the upcall.
        group: String,
        /// Inbound slot from the upcall.
        inbound: u16,
    },

    /// Interface name not present in the interface directory.
    #[error("Unknown interface '{name}'")]
    UnknownInterface {
        /// The interface name.
        name: String,
    },

    /// Interface exists but holds no slot for the family.
    #[error("Interface '{name}' has no {family} slot")]
    NoSlot {
        /// The interface name.
        name: String,
        /// The family queried.
        family: AddressFamily,
    },

    /// An address does not belong to the expected family.
    #[error("Address {addr} is not an {expected} address")]
    FamilyMismatch {
        /// The offending address.
        addr: String,
        /// The family the address should belong to.
        expected: AddressFamily,
    },

    /// Configuration validation error.
    #[error("Invalid configuration for {field}: {message}")]
    InvalidConfig {
        /// The field that failed validation.
        field: String,
        /// Error message.
        message: String,
    },

    /// Interface enumeration failed.
    #[error("Interface discovery failed: {0}")]
    Discovery(Errno),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl MrouteError {
    /// Creates a kernel rejection error.
    pub fn kernel_reject(op: &'static str, errno: Errno) -> Self {
        Self::KernelReject { op, errno }
    }

    /// Creates an invalid configuration error.
    pub fn invalid_config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Creates an unknown interface error.
    pub fn unknown_interface(name: impl Into<String>) -> Self {
        Self::UnknownInterface { name: name.into() }
    }

    /// Returns the kernel error code behind this error, if any.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            MrouteError::ChannelOpen { errno, .. } | MrouteError::KernelReject { errno, .. } => {
                Some(*errno)
            }
            MrouteError::AddressInUse { .. } => Some(Errno::EADDRINUSE),
            MrouteError::Unsupported { .. } => Some(Errno::EOPNOTSUPP),
            MrouteError::ResourceExhausted { .. } => Some(Errno::ENOMEM),
            MrouteError::NoMatch { .. } => Some(Errno::ENOENT),
            MrouteError::Discovery(errno) => Some(*errno),
            _ => None,
        }
    }

    /// Returns true if this error leaves a family disabled without
    /// affecting the rest of the daemon.
    pub fn is_soft_enable_failure(&self) -> bool {
        matches!(
            self,
            MrouteError::AddressInUse { .. }
                | MrouteError::Unsupported { .. }
                | MrouteError::ChannelOpen { .. }
        )
    }

    /// Returns true if an upcall matched no (*,G) template.
    pub fn is_no_match(&self) -> bool {
        matches!(self, MrouteError::NoMatch { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MrouteError::AddressInUse {
            family: AddressFamily::Ipv4,
        };
        assert_eq!(err.to_string(), "IPv4 multicast routing API already in use");
    }

    #[test]
    fn test_kernel_reject() {
        let err = MrouteError::kernel_reject("MRT_ADD_MFC", Errno::EINVAL);
        assert!(err.to_string().contains("MRT_ADD_MFC"));
        assert_eq!(err.errno(), Some(Errno::EINVAL));
    }

    #[test]
    fn test_no_match() {
        let err = MrouteError::NoMatch {
            sender: "10.0.0.5".to_string(),
            group: "239.1.1.1".to_string(),
            inbound: 0,
        };
        assert!(err.is_no_match());
        assert_eq!(err.errno(), Some(Errno::ENOENT));
        assert_eq!(
            err.to_string(),
            "No (*,G) match for (10.0.0.5, 239.1.1.1) on slot 0"
        );
    }

    #[test]
    fn test_is_soft_enable_failure() {
        assert!(MrouteError::Unsupported {
            family: AddressFamily::Ipv6
        }
        .is_soft_enable_failure());
        assert!(MrouteError::ChannelOpen {
            family: AddressFamily::Ipv4,
            errno: Errno::EPERM,
        }
        .is_soft_enable_failure());
        assert!(!MrouteError::kernel_reject("MRT_DEL_MFC", Errno::ENOENT).is_soft_enable_failure());
        assert!(!MrouteError::unknown_interface("eth9").is_soft_enable_failure());
    }

    #[test]
    fn test_resource_exhausted() {
        let err = MrouteError::ResourceExhausted {
            family: AddressFamily::Ipv4,
            iface: "eth32".to_string(),
        };
        assert_eq!(err.to_string(), "Out of IPv4 interface slots for 'eth32'");
        assert_eq!(err.errno(), Some(Errno::ENOMEM));
    }
}
