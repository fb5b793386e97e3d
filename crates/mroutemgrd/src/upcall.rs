//! Kernel upcall decoding
//!
//! The multicast routing socket delivers kernel messages for traffic
//! without a forwarding entry. They share the socket with ordinary
//! IGMP/ICMPv6 packets; upcalls are told apart by a zero "must be zero"
//! byte where a real packet has a non-zero one.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use mroute_common::{Family, Slot, V4, V6};
use thiserror::Error;

/// Size of the IPv4 `igmpmsg` upcall record.
pub const IGMPMSG_LEN: usize = 20;
/// Size of the IPv6 `mrt6msg` upcall record.
pub const MRT6MSG_LEN: usize = 40;

const MSG_NOCACHE: u8 = 1;
const MSG_WRONGVIF: u8 = 2;
const MSG_WHOLEPKT: u8 = 3;

/// Kernel upcall message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpcallKind {
    /// No forwarding entry for (S,G)
    NoCache,
    /// Traffic for (S,G) arrived on an unexpected slot
    WrongVif,
    /// Whole packet for a register interface
    WholePacket,
    Other(u8),
}

impl From<u8> for UpcallKind {
    fn from(value: u8) -> Self {
        match value {
            MSG_NOCACHE => UpcallKind::NoCache,
            MSG_WRONGVIF => UpcallKind::WrongVif,
            MSG_WHOLEPKT => UpcallKind::WholePacket,
            other => UpcallKind::Other(other),
        }
    }
}

impl fmt::Display for UpcallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpcallKind::NoCache => write!(f, "NOCACHE"),
            UpcallKind::WrongVif => write!(f, "WRONGVIF"),
            UpcallKind::WholePacket => write!(f, "WHOLEPKT"),
            UpcallKind::Other(n) => write!(f, "type {}", n),
        }
    }
}

/// A decoded kernel upcall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Upcall<F: Family> {
    pub kind: UpcallKind,
    pub sender: F::Addr,
    pub group: F::Addr,
    /// Slot the traffic arrived on
    pub inbound: Slot,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UpcallError {
    #[error("Short {family} upcall: {len} bytes, need {need}")]
    Truncated {
        family: &'static str,
        len: usize,
        need: usize,
    },
}

/// Families whose kernel upcalls can be decoded.
pub trait UpcallFamily: Family {
    /// Decodes one message read from the routing socket. `Ok(None)` means
    /// the message is an ordinary packet, not an upcall.
    fn decode_upcall(buf: &[u8]) -> Result<Option<Upcall<Self>>, UpcallError>;
}

fn check_len(family: &'static str, buf: &[u8], need: usize) -> Result<(), UpcallError> {
    if buf.len() < need {
        return Err(UpcallError::Truncated {
            family,
            len: buf.len(),
            need,
        });
    }
    Ok(())
}

fn octets<const N: usize>(buf: &[u8], at: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&buf[at..at + N]);
    out
}

impl UpcallFamily for V4 {
    fn decode_upcall(buf: &[u8]) -> Result<Option<Upcall<Self>>, UpcallError> {
        check_len(V4::NAME, buf, IGMPMSG_LEN)?;

        // Overlays the IP header's protocol byte
        if buf[9] != 0 {
            return Ok(None);
        }

        Ok(Some(Upcall {
            kind: UpcallKind::from(buf[8]),
            inbound: Slot::from(buf[10]) | (Slot::from(buf[11]) << 8),
            sender: Ipv4Addr::from(octets::<4>(buf, 12)),
            group: Ipv4Addr::from(octets::<4>(buf, 16)),
        }))
    }
}

impl UpcallFamily for V6 {
    fn decode_upcall(buf: &[u8]) -> Result<Option<Upcall<Self>>, UpcallError> {
        check_len(V6::NAME, buf, MRT6MSG_LEN)?;

        // Overlays the ICMPv6 type byte
        if buf[0] != 0 {
            return Ok(None);
        }

        Ok(Some(Upcall {
            kind: UpcallKind::from(buf[1]),
            inbound: u16::from_ne_bytes(octets::<2>(buf, 2)),
            sender: Ipv6Addr::from(octets::<16>(buf, 8)),
            group: Ipv6Addr::from(octets::<16>(buf, 24)),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn igmpmsg(msgtype: u8, mbz: u8, vif: u8, src: [u8; 4], dst: [u8; 4]) -> Vec<u8> {
        let mut buf = vec![0u8; IGMPMSG_LEN];
        buf[8] = msgtype;
        buf[9] = mbz;
        buf[10] = vif;
        buf[12..16].copy_from_slice(&src);
        buf[16..20].copy_from_slice(&dst);
        buf
    }

    #[test]
    fn test_decode_v4_nocache() {
        let buf = igmpmsg(1, 0, 3, [10, 0, 0, 5], [239, 1, 1, 1]);

        let upcall = V4::decode_upcall(&buf).unwrap().unwrap();

        assert_eq!(upcall.kind, UpcallKind::NoCache);
        assert_eq!(upcall.inbound, 3);
        assert_eq!(upcall.sender, Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(upcall.group, Ipv4Addr::new(239, 1, 1, 1));
    }

    #[test]
    fn test_decode_v4_ignores_packets() {
        // IGMP packet: protocol byte of the IP header is 2
        let buf = igmpmsg(64, 2, 0, [10, 0, 0, 5], [224, 0, 0, 1]);
        assert_eq!(V4::decode_upcall(&buf).unwrap(), None);
    }

    #[test]
    fn test_decode_v4_truncated() {
        let err = V4::decode_upcall(&[0u8; 12]).unwrap_err();
        assert_eq!(
            err,
            UpcallError::Truncated {
                family: "IPv4",
                len: 12,
                need: IGMPMSG_LEN
            }
        );
    }

    #[test]
    fn test_decode_v6_wrongvif() {
        let src: Ipv6Addr = "2001:db8::5".parse().unwrap();
        let dst: Ipv6Addr = "ff05::1".parse().unwrap();
        let mut buf = vec![0u8; MRT6MSG_LEN];
        buf[1] = 2;
        buf[2..4].copy_from_slice(&7u16.to_ne_bytes());
        buf[8..24].copy_from_slice(&src.octets());
        buf[24..40].copy_from_slice(&dst.octets());

        let upcall = V6::decode_upcall(&buf).unwrap().unwrap();

        assert_eq!(upcall.kind, UpcallKind::WrongVif);
        assert_eq!(upcall.inbound, 7);
        assert_eq!(upcall.sender, src);
        assert_eq!(upcall.group, dst);
    }

    #[test]
    fn test_decode_v6_ignores_icmp() {
        let mut buf = vec![0u8; MRT6MSG_LEN];
        buf[0] = 130; // MLD query
        assert_eq!(V6::decode_upcall(&buf).unwrap(), None);
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(UpcallKind::from(3).to_string(), "WHOLEPKT");
        assert_eq!(UpcallKind::from(9), UpcallKind::Other(9));
    }
}
