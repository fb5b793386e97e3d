//! Best-effort access to kernel `/proc/sys` knobs.
//!
//! Multicast routing needs a few system-wide switches flipped, for example
//! `net.ipv6.conf.all.mc_forwarding` on kernels that do not set it on
//! `MRT6_INIT`. Writes go straight to the proc file; callers decide which
//! failures matter.
//!
//! # Example
//!
//! ```no_run
//! use mroute_common::sysctl;
//!
//! sysctl::write_value(sysctl::IPV6_ALL_MC_FORWARDING, 1)?;
//! # Ok::<(), std::io::Error>(())
//! ```

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use tracing::debug;

/// Global IPv6 multicast forwarding switch.
pub const IPV6_ALL_MC_FORWARDING: &str = "/proc/sys/net/ipv6/conf/all/mc_forwarding";

/// Writes an integer value to a proc file.
///
/// The file is opened write-only and must already exist; proc files
/// cannot be created.
pub fn write_value(path: impl AsRef<Path>, value: i64) -> io::Result<()> {
    let path = path.as_ref();
    let mut file = OpenOptions::new().write(true).open(path)?;
    file.write_all(value.to_string().as_bytes())?;
    debug!("Wrote {} to {}", value, path.display());
    Ok(())
}

/// Reads an integer value from a proc file.
pub fn read_value(path: impl AsRef<Path>) -> io::Result<i64> {
    let content = fs::read_to_string(path)?;
    content
        .trim()
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Returns true if a write failure means we lack the privilege to change
/// the value, which callers treat as harmless.
pub fn is_permission_denied(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::PermissionDenied
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_write_and_read_value() {
        let file = NamedTempFile::new().unwrap();
        write_value(file.path(), 1).unwrap();
        assert_eq!(read_value(file.path()).unwrap(), 1);
    }

    #[test]
    fn test_write_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = write_value(dir.path().join("mc_forwarding"), 1).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(!is_permission_denied(&err));
    }

    #[test]
    fn test_read_garbage() {
        let file = NamedTempFile::new().unwrap();
        fs::write(file.path(), "yes\n").unwrap();
        let err = read_value(file.path()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_read_trims_newline() {
        let file = NamedTempFile::new().unwrap();
        fs::write(file.path(), "0\n").unwrap();
        assert_eq!(read_value(file.path()).unwrap(), 0);
    }
}
