//! Interface directory
//!
//! An ordered list of the system's interfaces as seen at startup or reload.
//! The slot tables write each interface's VIF/MIF number back here so that
//! name lookups during route resolution are direct.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use mroute_common::{AddressFamily, MrouteError, MrouteResult, Slot};
use nix::ifaddrs::getifaddrs;
use nix::net::if_::{if_nametoindex, InterfaceFlags};
use tracing::debug;

/// A network interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    /// Interface name (e.g. "eth0")
    pub name: String,
    /// Kernel interface index
    pub ifindex: u32,
    /// First IPv4 address, used as the VIF local address
    pub inaddr: Option<Ipv4Addr>,
    /// Interface carries at least one IPv6 address
    pub inet6: bool,
    pub loopback: bool,
    /// Interface is multicast capable
    pub multicast: bool,
    /// Assigned IPv4 VIF
    pub vif: Option<Slot>,
    /// Assigned IPv6 MIF
    pub mif: Option<Slot>,
}

impl Interface {
    /// Creates an interface with no addresses and no flags set.
    pub fn new(name: impl Into<String>, ifindex: u32) -> Self {
        Self {
            name: name.into(),
            ifindex,
            inaddr: None,
            inet6: false,
            loopback: false,
            multicast: true,
            vif: None,
            mif: None,
        }
    }

    /// Sets the IPv4 address.
    pub fn with_inaddr(mut self, addr: Ipv4Addr) -> Self {
        self.inaddr = Some(addr);
        self
    }

    /// Marks the interface as carrying IPv6.
    pub fn with_inet6(mut self) -> Self {
        self.inet6 = true;
        self
    }

    /// Marks the interface as loopback.
    pub fn with_loopback(mut self) -> Self {
        self.loopback = true;
        self
    }

    /// Returns true if the interface can hold a slot for the family.
    pub fn has_family(&self, family: AddressFamily) -> bool {
        match family {
            AddressFamily::Ipv4 => self.inaddr.is_some(),
            AddressFamily::Ipv6 => self.inet6,
        }
    }

    /// Returns the slot held for the family.
    pub fn slot(&self, family: AddressFamily) -> Option<Slot> {
        match family {
            AddressFamily::Ipv4 => self.vif,
            AddressFamily::Ipv6 => self.mif,
        }
    }

    /// Records the slot held for the family (`None` = no slot).
    pub fn set_slot(&mut self, family: AddressFamily, slot: Option<Slot>) {
        match family {
            AddressFamily::Ipv4 => self.vif = slot,
            AddressFamily::Ipv6 => self.mif = slot,
        }
    }
}

/// Ordered, indexable collection of interfaces.
#[derive(Debug, Clone, Default)]
pub struct InterfaceDirectory {
    ifaces: Vec<Interface>,
}

impl InterfaceDirectory {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enumerates the system's interfaces.
    pub fn discover() -> MrouteResult<Self> {
        let addrs = getifaddrs().map_err(MrouteError::Discovery)?;

        // getifaddrs yields one record per (interface, address)
        let mut by_name: BTreeMap<String, Interface> = BTreeMap::new();
        for ifaddr in addrs {
            let name = ifaddr.interface_name.clone();
            if !by_name.contains_key(&name) {
                let ifindex = if_nametoindex(name.as_str()).map_err(MrouteError::Discovery)?;
                by_name.insert(name.clone(), Interface::new(name.as_str(), ifindex));
            }
            let Some(iface) = by_name.get_mut(&name) else {
                continue;
            };

            iface.loopback = ifaddr.flags.contains(InterfaceFlags::IFF_LOOPBACK);
            iface.multicast = ifaddr.flags.contains(InterfaceFlags::IFF_MULTICAST);

            if let Some(address) = ifaddr.address.as_ref() {
                if let Some(sin) = address.as_sockaddr_in() {
                    if iface.inaddr.is_none() {
                        iface.inaddr = Some(Ipv4Addr::from(sin.ip()));
                    }
                } else if address.as_sockaddr_in6().is_some() {
                    iface.inet6 = true;
                }
            }
        }

        let mut ifaces: Vec<Interface> = by_name.into_values().collect();
        ifaces.sort_by_key(|iface| iface.ifindex);

        for iface in &ifaces {
            debug!(
                "Found interface {} ifindex {} inaddr {:?} inet6 {} loopback {}",
                iface.name, iface.ifindex, iface.inaddr, iface.inet6, iface.loopback
            );
        }

        Ok(Self { ifaces })
    }

    /// Appends an interface.
    pub fn push(&mut self, iface: Interface) {
        self.ifaces.push(iface);
    }

    /// Returns the interface at `index`.
    pub fn get(&self, index: usize) -> Option<&Interface> {
        self.ifaces.get(index)
    }

    /// Finds an interface by name.
    pub fn find_by_name(&self, name: &str) -> Option<&Interface> {
        self.ifaces.iter().find(|iface| iface.name == name)
    }

    /// Looks up the slot of a named interface.
    pub fn slot_of(&self, family: AddressFamily, name: &str) -> MrouteResult<Slot> {
        let iface = self
            .find_by_name(name)
            .ok_or_else(|| MrouteError::unknown_interface(name))?;
        iface.slot(family).ok_or_else(|| MrouteError::NoSlot {
            name: name.to_string(),
            family,
        })
    }

    /// Clears every interface's slot for the family.
    pub fn clear_slots(&mut self, family: AddressFamily) {
        for iface in &mut self.ifaces {
            iface.set_slot(family, None);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Interface> {
        self.ifaces.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Interface> {
        self.ifaces.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.ifaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ifaces.is_empty()
    }
}

impl FromIterator<Interface> for InterfaceDirectory {
    fn from_iter<I: IntoIterator<Item = Interface>>(iter: I) -> Self {
        Self {
            ifaces: iter.into_iter().collect(),
        }
    }
}
