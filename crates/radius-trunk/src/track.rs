//! RADIUS ID allocation and reply matching
//!
//! Each connection owns one tracker. An 8-bit ID is reserved per in-flight
//! request, the signed request authenticator is recorded after encoding,
//! and incoming replies are matched purely by their ID byte. At most one
//! request is live per ID; the tracker must drain to zero before its
//! connection closes.

use crate::trunk::EntryId;
use crate::wire::AUTH_VECTOR_LENGTH;

const ID_SPACE: usize = 256;

/// One reserved ID slot
#[derive(Debug, Clone, Copy)]
pub struct IdSlot {
    /// The trunk entry that owns this ID
    pub entry: EntryId,
    /// Packet code sent under this ID
    pub code: u8,
    /// Request authenticator recorded after the packet was signed
    pub authenticator: [u8; AUTH_VECTOR_LENGTH],
}

/// Per-connection allocator for the 256 RADIUS IDs
#[derive(Debug)]
pub struct IdTracker {
    slots: Vec<Option<IdSlot>>,
    count: usize,
    /// Last ID handed out. Allocation continues from here so IDs are
    /// spread across the space rather than reusing 0 immediately, which
    /// matters when replicating to servers that dedup by ID.
    last_id: u8,
}

impl IdTracker {
    pub fn new() -> Self {
        IdTracker {
            slots: vec![None; ID_SPACE],
            count: 0,
            last_id: 255,
        }
    }

    /// Reserve the next free ID for `entry`.
    ///
    /// Selection is sequential from the last issued ID, skipping in-use
    /// slots. Returns `None` when all 256 IDs are in flight.
    pub fn reserve(&mut self, entry: EntryId, code: u8) -> Option<u8> {
        if self.count == ID_SPACE {
            return None;
        }

        for offset in 1..=ID_SPACE {
            let id = self.last_id.wrapping_add(offset as u8);
            if self.slots[id as usize].is_none() {
                self.slots[id as usize] = Some(IdSlot {
                    entry,
                    code,
                    authenticator: [0u8; AUTH_VECTOR_LENGTH],
                });
                self.count += 1;
                self.last_id = id;
                return Some(id);
            }
        }

        None
    }

    /// Record the authenticator of the signed packet sent under `id`
    pub fn update(&mut self, id: u8, authenticator: [u8; AUTH_VECTOR_LENGTH]) {
        match &mut self.slots[id as usize] {
            Some(slot) => slot.authenticator = authenticator,
            None => debug_assert!(false, "update of free ID {id}"),
        }
    }

    /// Look up the in-flight request for `id`
    pub fn find(&self, id: u8) -> Option<&IdSlot> {
        self.slots[id as usize].as_ref()
    }

    /// Release `id`, returning the entry that held it.
    ///
    /// Releasing a free ID is a programmer error.
    pub fn release(&mut self, id: u8) -> Option<EntryId> {
        let slot = self.slots[id as usize].take();
        debug_assert!(slot.is_some(), "release of free ID {id}");
        if slot.is_some() {
            self.count -= 1;
        }
        slot.map(|s| s.entry)
    }

    /// Number of IDs currently reserved
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_full(&self) -> bool {
        self.count == ID_SPACE
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Iterate over reserved IDs and their owning entries
    pub fn entries(&self) -> impl Iterator<Item = (u8, EntryId)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| slot.as_ref().map(|s| (id as u8, s.entry)))
    }
}

impl Default for IdTracker {
    fn default() -> Self {
        Self::new()
    }
}
