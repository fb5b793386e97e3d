//! Interface slot table (VIF/MIF)
//!
//! The kernel addresses interfaces by a small slot index. Slots are handed
//! out lowest-first from a free bitmap; the index is what gets sent to the
//! kernel, so it stays stable for as long as the slot is held.

use std::marker::PhantomData;
use std::net::Ipv4Addr;

use mroute_common::{Family, MrouteError, MrouteResult, Slot, MAX_SLOTS};
use tracing::{debug, error};

use crate::iface::Interface;

// The free bitmap is a single u32
const _: () = assert!(MAX_SLOTS <= u32::BITS as usize);

const ALL_FREE: u32 = u32::MAX >> (u32::BITS as usize - MAX_SLOTS);

/// The interface bound to a slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotEntry {
    pub name: String,
    pub ifindex: u32,
    pub inaddr: Option<Ipv4Addr>,
}

impl From<&Interface> for SlotEntry {
    fn from(iface: &Interface) -> Self {
        Self {
            name: iface.name.clone(),
            ifindex: iface.ifindex,
            inaddr: iface.inaddr,
        }
    }
}

/// Fixed-capacity slot table for one family.
#[derive(Debug, Clone)]
pub struct VifTable<F: Family> {
    slots: [Option<SlotEntry>; MAX_SLOTS],
    /// Bit n set = slot n free
    free: u32,
    _family: PhantomData<F>,
}

impl<F: Family> VifTable<F> {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
            free: ALL_FREE,
            _family: PhantomData,
        }
    }

    /// Returns the lowest free slot.
    fn next_free(&self) -> Option<Slot> {
        if self.free == 0 {
            None
        } else {
            Some(self.free.trailing_zeros() as Slot)
        }
    }

    /// Binds `iface` to the lowest free slot.
    ///
    /// `register` is called with the chosen slot before anything is
    /// recorded; it performs the kernel registration. The slot is only
    /// taken, and written back to `iface`, if registration succeeds.
    pub fn assign<R>(&mut self, iface: &mut Interface, register: R) -> MrouteResult<Slot>
    where
        R: FnOnce(Slot, &Interface) -> MrouteResult<()>,
    {
        let Some(slot) = self.next_free() else {
            error!(
                "Out of {} space, cannot add {}",
                F::SLOT_NAME,
                iface.name
            );
            return Err(MrouteError::ResourceExhausted {
                family: F::FAMILY,
                iface: iface.name.clone(),
            });
        };

        register(slot, iface)?;

        self.slots[usize::from(slot)] = Some(SlotEntry::from(&*iface));
        self.free &= !(1 << slot);
        iface.set_slot(F::FAMILY, Some(slot));
        debug!("Bound {} {} to {}", F::SLOT_NAME, slot, iface.name);

        Ok(slot)
    }

    /// Returns the interface bound to `slot`.
    pub fn get(&self, slot: Slot) -> Option<&SlotEntry> {
        self.slots.get(usize::from(slot)).and_then(Option::as_ref)
    }

    /// Iterates occupied slots in index order.
    pub fn iter(&self) -> impl Iterator<Item = (Slot, &SlotEntry)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, entry)| entry.as_ref().map(|entry| (slot as Slot, entry)))
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        (ALL_FREE & !self.free).count_ones() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.free == ALL_FREE
    }

    /// Releases every slot.
    pub fn clear(&mut self) {
        self.slots = std::array::from_fn(|_| None);
        self.free = ALL_FREE;
    }
}

impl<F: Family> Default for VifTable<F> {
    fn default() -> Self {
        Self::new()
    }
}
