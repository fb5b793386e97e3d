//! Type definitions for mroutemgrd

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use mroute_common::{AddressFamily, Family, Slot, MAX_SLOTS};
use serde::{Deserialize, Serialize};

/// Default TTL threshold for an outbound slot.
pub const DEFAULT_TTL: u8 = 1;

/// Per-slot forwarding thresholds.
///
/// Entry `n` is the minimum TTL a packet needs to be forwarded on slot
/// `n`; 0 means "do not forward on this slot".
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ForwardingVector([u8; MAX_SLOTS]);

impl ForwardingVector {
    /// Creates an empty vector (forward nowhere).
    pub const fn new() -> Self {
        Self([0; MAX_SLOTS])
    }

    /// Sets the threshold for a slot. Out-of-range slots are ignored.
    pub fn set(&mut self, slot: Slot, ttl: u8) {
        if let Some(entry) = self.0.get_mut(usize::from(slot)) {
            *entry = ttl;
        }
    }

    /// Returns the threshold for a slot.
    pub fn get(&self, slot: Slot) -> u8 {
        self.0.get(usize::from(slot)).copied().unwrap_or(0)
    }

    /// Iterates the slots packets are forwarded on.
    pub fn outbound_slots(&self) -> impl Iterator<Item = Slot> + '_ {
        self.0
            .iter()
            .enumerate()
            .filter(|(_, ttl)| **ttl > 0)
            .map(|(slot, _)| slot as Slot)
    }

    /// Returns true if no slot is enabled.
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|ttl| *ttl == 0)
    }

    /// Raw thresholds, one per slot.
    pub fn as_array(&self) -> &[u8; MAX_SLOTS] {
        &self.0
    }
}

impl Default for ForwardingVector {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ForwardingVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.outbound_slots().map(|slot| (slot, self.get(slot))))
            .finish()
    }
}

impl<const N: usize> From<[(Slot, u8); N]> for ForwardingVector {
    fn from(entries: [(Slot, u8); N]) -> Self {
        let mut vector = Self::new();
        for (slot, ttl) in entries {
            vector.set(slot, ttl);
        }
        vector
    }
}

/// A multicast route: (sender, group) arriving on `inbound`, forwarded
/// according to `ttl`.
///
/// A route whose sender is the family's wildcard is a (*,G) template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Route<F: Family> {
    pub sender: F::Addr,
    pub group: F::Addr,
    pub inbound: Slot,
    pub ttl: ForwardingVector,
}

impl<F: Family> Route<F> {
    /// Creates a new route.
    pub fn new(sender: F::Addr, group: F::Addr, inbound: Slot, ttl: ForwardingVector) -> Self {
        Self {
            sender,
            group,
            inbound,
            ttl,
        }
    }

    /// Creates a (*,G) template.
    pub fn wildcard(group: F::Addr, inbound: Slot, ttl: ForwardingVector) -> Self {
        Self::new(F::WILDCARD, group, inbound, ttl)
    }

    /// Returns true if this is a (*,G) template.
    pub fn is_wildcard(&self) -> bool {
        F::is_wildcard(&self.sender)
    }

    /// Template matching key.
    pub fn key(&self) -> RouteKey<F> {
        RouteKey {
            group: self.group,
            inbound: self.inbound,
        }
    }

    /// Returns a copy of this route with a concrete sender.
    pub fn with_sender(&self, sender: F::Addr) -> Self {
        Self { sender, ..*self }
    }
}

impl<F: Family> fmt::Display for Route<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_wildcard() {
            write!(f, "(*, {}) iif {}", self.group, self.inbound)
        } else {
            write!(f, "({}, {}) iif {}", self.sender, self.group, self.inbound)
        }
    }
}

/// (group, inbound slot): the identity templates are matched on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RouteKey<F: Family> {
    pub group: F::Addr,
    pub inbound: Slot,
}

/// Route request operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Add,
    Remove,
}

/// A route request from the configuration front end, expressed in
/// interface names rather than slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRequest {
    pub op: Operation,
    /// `None` (or the family's unspecified address) means (*,G).
    pub source: Option<IpAddr>,
    pub group: IpAddr,
    pub inbound: String,
    /// Outbound interface name -> TTL threshold.
    pub outbound: BTreeMap<String, u8>,
}

impl RouteRequest {
    /// Creates an add request with no outbound interfaces.
    pub fn add(source: Option<IpAddr>, group: IpAddr, inbound: impl Into<String>) -> Self {
        Self {
            op: Operation::Add,
            source,
            group,
            inbound: inbound.into(),
            outbound: BTreeMap::new(),
        }
    }

    /// Creates a remove request.
    pub fn remove(source: Option<IpAddr>, group: IpAddr, inbound: impl Into<String>) -> Self {
        Self {
            op: Operation::Remove,
            ..Self::add(source, group, inbound)
        }
    }

    /// Adds an outbound interface with the default threshold.
    pub fn with_outbound(mut self, name: impl Into<String>) -> Self {
        self.outbound.insert(name.into(), DEFAULT_TTL);
        self
    }

    /// Adds an outbound interface with an explicit threshold.
    pub fn with_outbound_ttl(mut self, name: impl Into<String>, ttl: u8) -> Self {
        self.outbound.insert(name.into(), ttl);
        self
    }

    /// The address family, taken from the group.
    pub fn family(&self) -> AddressFamily {
        AddressFamily::of(&self.group)
    }
}
