//! Kernel multicast routing records
//!
//! Fixed-layout control records for the `MRT_*` (linux/mroute.h) and
//! `MRT6_*` (linux/mroute6.h) socket options. Field order, sizes and
//! padding must match the kernel's structs exactly.

use std::net::{Ipv4Addr, Ipv6Addr};

use libc::c_int;
use mroute_common::{AddressFamily, Family, Slot, MAX_SLOTS, V4, V6};

use crate::iface::Interface;
use crate::types::Route;

/// `MAXVIFS` from linux/mroute.h
pub const MAXVIFS: usize = 32;

/// `MAXMIFS` from linux/mroute6.h
pub const MAXMIFS: usize = 32;

/// `IF_SETSIZE` from linux/mroute6.h
const IF_SETSIZE: usize = 256;
const NIFBITS: usize = u32::BITS as usize;

// Forwarding vectors are copied into the kernel records verbatim
const _: () = assert!(MAX_SLOTS == MAXVIFS);
const _: () = assert!(MAX_SLOTS == MAXMIFS);
const _: () = assert!(MAX_SLOTS <= IF_SETSIZE);

/// Packet TTL must be at least 1 to pass a slot.
pub const SLOT_THRESHOLD: u8 = 1;

/// Socket option numbers, shared layout for both families.
#[derive(Debug, Clone, Copy)]
pub struct SockOpts {
    pub init: c_int,
    pub done: c_int,
    pub add_slot: c_int,
    pub add_mfc: c_int,
    pub del_mfc: c_int,
}

/// Socket option names, for log messages.
#[derive(Debug, Clone, Copy)]
pub struct OptNames {
    pub init: &'static str,
    pub done: &'static str,
    pub add_slot: &'static str,
    pub add_mfc: &'static str,
    pub del_mfc: &'static str,
}

const MRT_OPTS: SockOpts = SockOpts {
    init: 200,
    done: 201,
    add_slot: 202,
    add_mfc: 204,
    del_mfc: 205,
};

const MRT6_OPTS: SockOpts = SockOpts {
    init: 200,
    done: 201,
    add_slot: 202,
    add_mfc: 204,
    del_mfc: 205,
};

const MRT_NAMES: OptNames = OptNames {
    init: "MRT_INIT",
    done: "MRT_DONE",
    add_slot: "MRT_ADD_VIF",
    add_mfc: "MRT_ADD_MFC",
    del_mfc: "MRT_DEL_MFC",
};

const MRT6_NAMES: OptNames = OptNames {
    init: "MRT6_INIT",
    done: "MRT6_DONE",
    add_slot: "MRT6_ADD_MIF",
    add_mfc: "MRT6_ADD_MFC",
    del_mfc: "MRT6_DEL_MFC",
};

/// Returns the socket option names of a family.
pub const fn opt_names(family: AddressFamily) -> &'static OptNames {
    match family {
        AddressFamily::Ipv4 => &MRT_NAMES,
        AddressFamily::Ipv6 => &MRT6_NAMES,
    }
}

/// `struct vifctl`
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VifCtl {
    pub vifc_vifi: u16,
    pub vifc_flags: u8,
    pub vifc_threshold: u8,
    pub vifc_rate_limit: u32,
    /// `struct in_addr`, network byte order
    pub vifc_lcl_addr: u32,
    pub vifc_rmt_addr: u32,
}

/// `struct mfcctl`
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MfcCtl {
    pub mfcc_origin: u32,
    pub mfcc_mcastgrp: u32,
    pub mfcc_parent: u16,
    pub mfcc_ttls: [u8; MAXVIFS],
    pub mfcc_pkt_cnt: u32,
    pub mfcc_byte_cnt: u32,
    pub mfcc_wrong_if: u32,
    pub mfcc_expire: i32,
}

/// `struct mif6ctl`
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mif6Ctl {
    pub mif6c_mifi: u16,
    pub mif6c_flags: u8,
    pub vifc_threshold: u8,
    pub mif6c_pifi: u16,
    pub vifc_rate_limit: u32,
}

/// `struct sockaddr_in6`
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SockaddrIn6 {
    pub sin6_family: u16,
    pub sin6_port: u16,
    pub sin6_flowinfo: u32,
    pub sin6_addr: [u8; 16],
    pub sin6_scope_id: u32,
}

/// `struct if_set`
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IfSet {
    pub ifs_bits: [u32; IF_SETSIZE / NIFBITS],
}

impl IfSet {
    /// `IF_SET`
    pub fn set(&mut self, n: usize) {
        self.ifs_bits[n / NIFBITS] |= 1 << (n % NIFBITS);
    }

    /// `IF_ISSET`
    pub fn is_set(&self, n: usize) -> bool {
        self.ifs_bits[n / NIFBITS] & (1 << (n % NIFBITS)) != 0
    }
}

/// `struct mf6cctl`
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mf6cCtl {
    pub mf6cc_origin: SockaddrIn6,
    pub mf6cc_mcastgrp: SockaddrIn6,
    pub mf6cc_parent: u16,
    pub mf6cc_ifset: IfSet,
}

const _: () = assert!(std::mem::size_of::<VifCtl>() == 16);
const _: () = assert!(std::mem::size_of::<MfcCtl>() == 60);
const _: () = assert!(std::mem::size_of::<Mif6Ctl>() == 12);
const _: () = assert!(std::mem::size_of::<SockaddrIn6>() == 28);
const _: () = assert!(std::mem::size_of::<Mf6cCtl>() == 92);

fn in_addr(addr: Ipv4Addr) -> u32 {
    u32::from_ne_bytes(addr.octets())
}

fn sockaddr_in6(addr: Ipv6Addr) -> SockaddrIn6 {
    SockaddrIn6 {
        sin6_family: libc::AF_INET6 as u16,
        sin6_port: 0,
        sin6_flowinfo: 0,
        sin6_addr: addr.octets(),
        sin6_scope_id: 0,
    }
}

/// A family's raw socket parameters and record encoders.
pub trait KernelFamily: Family {
    /// Record registering an interface slot.
    type SlotCtl: Copy;
    /// Record adding or deleting a forwarding cache entry.
    type MfcCtl: Copy;

    const DOMAIN: c_int;
    const PROTOCOL: c_int;
    const LEVEL: c_int;
    const OPTS: SockOpts;

    fn slot_ctl(slot: Slot, iface: &Interface) -> Self::SlotCtl;

    fn mfc_ctl(route: &Route<Self>) -> Self::MfcCtl;

    /// Deletion only matches on (origin, group).
    fn mfc_del_ctl(sender: Self::Addr, group: Self::Addr) -> Self::MfcCtl;
}

impl KernelFamily for V4 {
    type SlotCtl = VifCtl;
    type MfcCtl = MfcCtl;

    const DOMAIN: c_int = libc::AF_INET;
    const PROTOCOL: c_int = libc::IPPROTO_IGMP;
    const LEVEL: c_int = libc::IPPROTO_IP;
    const OPTS: SockOpts = MRT_OPTS;

    fn slot_ctl(slot: Slot, iface: &Interface) -> VifCtl {
        VifCtl {
            vifc_vifi: slot,
            // no tunnel, no source routing, no register
            vifc_flags: 0,
            vifc_threshold: SLOT_THRESHOLD,
            vifc_rate_limit: 0,
            vifc_lcl_addr: in_addr(iface.inaddr.unwrap_or(Ipv4Addr::UNSPECIFIED)),
            vifc_rmt_addr: in_addr(Ipv4Addr::UNSPECIFIED),
        }
    }

    fn mfc_ctl(route: &Route<V4>) -> MfcCtl {
        MfcCtl {
            mfcc_origin: in_addr(route.sender),
            mfcc_mcastgrp: in_addr(route.group),
            mfcc_parent: route.inbound,
            mfcc_ttls: *route.ttl.as_array(),
            mfcc_pkt_cnt: 0,
            mfcc_byte_cnt: 0,
            mfcc_wrong_if: 0,
            mfcc_expire: 0,
        }
    }

    fn mfc_del_ctl(sender: Ipv4Addr, group: Ipv4Addr) -> MfcCtl {
        MfcCtl {
            mfcc_origin: in_addr(sender),
            mfcc_mcastgrp: in_addr(group),
            mfcc_parent: 0,
            mfcc_ttls: [0; MAXVIFS],
            mfcc_pkt_cnt: 0,
            mfcc_byte_cnt: 0,
            mfcc_wrong_if: 0,
            mfcc_expire: 0,
        }
    }
}

impl KernelFamily for V6 {
    type SlotCtl = Mif6Ctl;
    type MfcCtl = Mf6cCtl;

    const DOMAIN: c_int = libc::AF_INET6;
    const PROTOCOL: c_int = libc::IPPROTO_ICMPV6;
    const LEVEL: c_int = libc::IPPROTO_IPV6;
    const OPTS: SockOpts = MRT6_OPTS;

    fn slot_ctl(slot: Slot, iface: &Interface) -> Mif6Ctl {
        Mif6Ctl {
            mif6c_mifi: slot,
            mif6c_flags: 0,
            vifc_threshold: SLOT_THRESHOLD,
            // The kernel rejects pifi 0, so an index that does not fit
            // surfaces as an MRT6_ADD_MIF failure
            mif6c_pifi: u16::try_from(iface.ifindex).unwrap_or(0),
            vifc_rate_limit: 0,
        }
    }

    fn mfc_ctl(route: &Route<V6>) -> Mf6cCtl {
        let mut ifset = IfSet::default();
        for slot in route.ttl.outbound_slots() {
            ifset.set(usize::from(slot));
        }

        Mf6cCtl {
            mf6cc_origin: sockaddr_in6(route.sender),
            mf6cc_mcastgrp: sockaddr_in6(route.group),
            mf6cc_parent: route.inbound,
            mf6cc_ifset: ifset,
        }
    }

    fn mfc_del_ctl(sender: Ipv6Addr, group: Ipv6Addr) -> Mf6cCtl {
        Mf6cCtl {
            mf6cc_origin: sockaddr_in6(sender),
            mf6cc_mcastgrp: sockaddr_in6(group),
            mf6cc_parent: 0,
            mf6cc_ifset: IfSet::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ForwardingVector;
    use std::mem::offset_of;

    #[test]
    fn test_record_offsets() {
        assert_eq!(offset_of!(MfcCtl, mfcc_parent), 8);
        assert_eq!(offset_of!(MfcCtl, mfcc_ttls), 10);
        assert_eq!(offset_of!(MfcCtl, mfcc_pkt_cnt), 44);
        assert_eq!(offset_of!(VifCtl, vifc_lcl_addr), 8);
        assert_eq!(offset_of!(Mif6Ctl, vifc_rate_limit), 8);
        assert_eq!(offset_of!(Mf6cCtl, mf6cc_parent), 56);
        assert_eq!(offset_of!(Mf6cCtl, mf6cc_ifset), 60);
    }

    #[test]
    fn test_in_addr_network_order() {
        let raw = in_addr(Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(raw.to_ne_bytes(), [10, 0, 0, 5]);
    }

    #[test]
    fn test_vifctl() {
        let iface = Interface::new("eth0", 2).with_inaddr(Ipv4Addr::new(192, 168, 1, 1));
        let vc = V4::slot_ctl(3, &iface);
        assert_eq!(vc.vifc_vifi, 3);
        assert_eq!(vc.vifc_threshold, 1);
        assert_eq!(vc.vifc_rate_limit, 0);
        assert_eq!(vc.vifc_lcl_addr.to_ne_bytes(), [192, 168, 1, 1]);
        assert_eq!(vc.vifc_rmt_addr, 0);
    }

    #[test]
    fn test_mfcctl_copies_ttl_vector() {
        let route = Route::<V4>::new(
            Ipv4Addr::new(10, 0, 0, 5),
            Ipv4Addr::new(239, 1, 1, 1),
            0,
            ForwardingVector::from([(1, 1), (4, 8)]),
        );
        let mc = V4::mfc_ctl(&route);
        assert_eq!(mc.mfcc_parent, 0);
        assert_eq!(mc.mfcc_ttls[1], 1);
        assert_eq!(mc.mfcc_ttls[4], 8);
        assert_eq!(mc.mfcc_ttls.iter().filter(|t| **t > 0).count(), 2);
        assert_eq!(mc.mfcc_mcastgrp.to_ne_bytes(), [239, 1, 1, 1]);
    }

    #[test]
    fn test_mif6ctl() {
        let iface = Interface::new("eth1", 9).with_inet6();
        let mc = V6::slot_ctl(1, &iface);
        assert_eq!(mc.mif6c_mifi, 1);
        assert_eq!(mc.mif6c_pifi, 9);
        assert_eq!(mc.vifc_threshold, 1);

        let huge = Interface::new("veth", 70_000).with_inet6();
        assert_eq!(V6::slot_ctl(2, &huge).mif6c_pifi, 0);
    }

    #[test]
    fn test_mf6cctl_builds_ifset() {
        let route = Route::<V6>::new(
            "2001:db8::5".parse().unwrap(),
            "ff05::114".parse().unwrap(),
            2,
            ForwardingVector::from([(0, 1), (31, 64)]),
        );
        let mc = V6::mfc_ctl(&route);
        assert_eq!(mc.mf6cc_parent, 2);
        assert!(mc.mf6cc_ifset.is_set(0));
        assert!(mc.mf6cc_ifset.is_set(31));
        assert!(!mc.mf6cc_ifset.is_set(1));
        assert_eq!(mc.mf6cc_ifset.ifs_bits[0], 0x8000_0001);
        assert_eq!(mc.mf6cc_origin.sin6_family, libc::AF_INET6 as u16);
        assert_eq!(mc.mf6cc_mcastgrp.sin6_addr[0], 0xff);
    }

    #[test]
    fn test_del_ctl_ignores_vector() {
        let mc = V4::mfc_del_ctl(Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(239, 1, 1, 1));
        assert!(mc.mfcc_ttls.iter().all(|t| *t == 0));
        let mc6 = V6::mfc_del_ctl(Ipv6Addr::UNSPECIFIED, "ff05::1".parse().unwrap());
        assert_eq!(mc6.mf6cc_ifset, IfSet::default());
    }

    #[test]
    fn test_opt_names() {
        assert_eq!(opt_names(AddressFamily::Ipv4).add_slot, "MRT_ADD_VIF");
        assert_eq!(opt_names(AddressFamily::Ipv6).add_slot, "MRT6_ADD_MIF");
        assert_eq!(V4::OPTS.add_mfc, 204);
        assert_eq!(V6::OPTS.del_mfc, 205);
    }
}
