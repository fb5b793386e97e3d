//! Forwarding family abstraction.
//!
//! The IPv4 and IPv6 multicast routing APIs differ only in address width,
//! record layout and a handful of names. Everything above the kernel
//! records is written once against [`Family`] and instantiated for the
//! [`V4`] and [`V6`] markers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hash;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::sysctl;

/// Kernel slot index (`vifi_t` / `mifi_t`).
pub type Slot = u16;

/// Number of slots in the kernel's interface table, for both families.
pub const MAX_SLOTS: usize = 32;

/// Runtime address family tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    /// Returns the family of an address.
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => AddressFamily::Ipv4,
            IpAddr::V6(_) => AddressFamily::Ipv6,
        }
    }

    /// Returns the human readable family name.
    pub fn as_str(&self) -> &'static str {
        match self {
            AddressFamily::Ipv4 => V4::NAME,
            AddressFamily::Ipv6 => V6::NAME,
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A multicast forwarding family.
pub trait Family: Copy + fmt::Debug + PartialEq + Eq + Hash + Send + Sync + 'static {
    /// Address type of senders and groups.
    type Addr: Copy + fmt::Debug + fmt::Display + PartialEq + Eq + Hash + Send + Sync + 'static;

    /// Runtime tag for this family.
    const FAMILY: AddressFamily;

    /// Family name used in log messages.
    const NAME: &'static str;

    /// Kernel name of an interface slot ("VIF" or "MIF").
    const SLOT_NAME: &'static str;

    /// The wildcard sender, marking a (*,G) route.
    const WILDCARD: Self::Addr;

    /// System-wide multicast forwarding switch, if the family needs it
    /// toggled by hand.
    const MC_FORWARDING_SYSCTL: Option<&'static str>;

    /// Narrows a generic address to this family.
    fn from_ip(addr: IpAddr) -> Option<Self::Addr>;

    /// Widens an address of this family.
    fn to_ip(addr: Self::Addr) -> IpAddr;

    /// Returns true if `addr` is the wildcard sender.
    fn is_wildcard(addr: &Self::Addr) -> bool {
        *addr == Self::WILDCARD
    }

    /// Returns true if `addr` is a multicast group address.
    fn is_multicast(addr: &Self::Addr) -> bool {
        Self::to_ip(*addr).is_multicast()
    }
}

/// IPv4 multicast routing (`MRT_*` socket options).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct V4;

/// IPv6 multicast routing (`MRT6_*` socket options).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct V6;

impl Family for V4 {
    type Addr = Ipv4Addr;

    const FAMILY: AddressFamily = AddressFamily::Ipv4;
    const NAME: &'static str = "IPv4";
    const SLOT_NAME: &'static str = "VIF";
    const WILDCARD: Ipv4Addr = Ipv4Addr::UNSPECIFIED;
    const MC_FORWARDING_SYSCTL: Option<&'static str> = None;

    fn from_ip(addr: IpAddr) -> Option<Ipv4Addr> {
        match addr {
            IpAddr::V4(addr) => Some(addr),
            IpAddr::V6(_) => None,
        }
    }

    fn to_ip(addr: Ipv4Addr) -> IpAddr {
        IpAddr::V4(addr)
    }
}

impl Family for V6 {
    type Addr = Ipv6Addr;

    const FAMILY: AddressFamily = AddressFamily::Ipv6;
    const NAME: &'static str = "IPv6";
    const SLOT_NAME: &'static str = "MIF";
    const WILDCARD: Ipv6Addr = Ipv6Addr::UNSPECIFIED;
    // Pre 2.6.29 kernels do not set this on MRT6_INIT
    const MC_FORWARDING_SYSCTL: Option<&'static str> = Some(sysctl::IPV6_ALL_MC_FORWARDING);

    fn from_ip(addr: IpAddr) -> Option<Ipv6Addr> {
        match addr {
            IpAddr::V6(addr) => Some(addr),
            IpAddr::V4(_) => None,
        }
    }

    fn to_ip(addr: Ipv6Addr) -> IpAddr {
        IpAddr::V6(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard() {
        assert!(V4::is_wildcard(&Ipv4Addr::UNSPECIFIED));
        assert!(!V4::is_wildcard(&Ipv4Addr::new(10, 0, 0, 5)));
        assert!(V6::is_wildcard(&Ipv6Addr::UNSPECIFIED));
        assert!(!V6::is_wildcard(&"fe80::1".parse().unwrap()));
    }

    #[test]
    fn test_from_ip_rejects_other_family() {
        let v4: IpAddr = "239.1.1.1".parse().unwrap();
        let v6: IpAddr = "ff05::114".parse().unwrap();

        assert_eq!(V4::from_ip(v4), Some(Ipv4Addr::new(239, 1, 1, 1)));
        assert_eq!(V4::from_ip(v6), None);
        assert_eq!(V6::from_ip(v4), None);
        assert!(V6::from_ip(v6).is_some());
    }

    #[test]
    fn test_is_multicast() {
        assert!(V4::is_multicast(&Ipv4Addr::new(239, 1, 1, 1)));
        assert!(!V4::is_multicast(&Ipv4Addr::new(10, 0, 0, 1)));
        assert!(V6::is_multicast(&"ff02::1".parse().unwrap()));
    }

    #[test]
    fn test_address_family() {
        assert_eq!(
            AddressFamily::of(&"239.1.1.1".parse().unwrap()),
            AddressFamily::Ipv4
        );
        assert_eq!(AddressFamily::Ipv6.to_string(), "IPv6");
        assert_eq!(V4::SLOT_NAME, "VIF");
        assert_eq!(V6::SLOT_NAME, "MIF");
        assert!(V4::MC_FORWARDING_SYSCTL.is_none());
        assert!(V6::MC_FORWARDING_SYSCTL.is_some());
    }
}
