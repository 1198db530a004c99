//! Zone selection and block allocation across zones.
//!
//! The allocator holds the zone table, the preference table and a view of
//! the descriptor table. `get_zone` walks the circular ring of the
//! preferred zone's preference class and then descends class by class down
//! to the caller's base preference, probing every candidate under its own
//! lock; the selected zone is returned with the lock still held so the
//! caller can run the buddy allocation before releasing it.

#[cfg(feature = "log")]
use log::{debug, error, warn};

use crate::buddy::DescriptorTable;
use crate::sync::IrqSpinGuard;
use crate::{AllocError, AllocFlags, AllocResult, ZoneKind, MAX_ORDER, MAX_PREFERENCES, MAX_ZONES};

use super::{zone_action, zone_state, AllocAction, Zone, ZoneInner};

/// One preference class: head of the circular ring of its zones.
#[derive(Debug, Clone, Copy)]
pub struct ZonePreference {
    first_zone: Option<usize>,
    count: usize,
}

impl ZonePreference {
    const fn empty() -> Self {
        Self {
            first_zone: None,
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Zone-selecting allocator over the whole zone table.
pub struct ZoneAllocator {
    table: DescriptorTable,
    zones: [Zone; MAX_ZONES],
    zone_count: usize,
    prefs: [ZonePreference; MAX_PREFERENCES],
}

impl ZoneAllocator {
    pub const fn new() -> Self {
        Self {
            table: DescriptorTable::empty(),
            zones: [const { Zone::empty() }; MAX_ZONES],
            zone_count: 0,
            prefs: [ZonePreference::empty(); MAX_PREFERENCES],
        }
    }

    pub fn zone_count(&self) -> usize {
        self.zone_count
    }

    pub fn zone(&self, index: usize) -> &Zone {
        &self.zones[index]
    }

    pub fn preference(&self, index: usize) -> &ZonePreference {
        &self.prefs[index]
    }

    pub(crate) fn attach_table(&mut self, table: DescriptorTable) {
        self.table = table;
    }

    /// Installs one configured zone and links it into its preference ring.
    /// Returns the new zone's index.
    pub(crate) fn install_zone(
        &mut self,
        kind: ZoneKind,
        preference: usize,
        first_frame: u32,
        frame_count: u32,
        reserved: usize,
        highest_order: usize,
    ) -> AllocResult<usize> {
        if self.zone_count >= MAX_ZONES {
            error!(
                "zone allocator: cannot install zone, maximum ({}) reached",
                MAX_ZONES
            );
            return Err(AllocError::NoMemory);
        }
        if preference >= MAX_PREFERENCES {
            return Err(AllocError::InvalidParam);
        }

        let index = self.zone_count;

        {
            let zone = &mut self.zones[index];
            zone.kind = kind;
            zone.preference_index = preference;
            zone.first_frame = first_frame;

            let mut inner = zone.inner.lock();
            inner.memory_size = frame_count as usize;
            inner.memory_allocated = 0;
            inner.memory_reserved = reserved;
            inner
                .buddy
                .configure(self.table, first_frame, frame_count, highest_order);
            inner.buddy.seed();
        }

        // Append to the circular ring of its preference class.
        match self.prefs[preference].first_zone {
            None => {
                self.prefs[preference].first_zone = Some(index);
                self.zones[index].next_in_pref = index;
            }
            Some(head) => {
                let mut tail = head;
                while self.zones[tail].next_in_pref != head {
                    tail = self.zones[tail].next_in_pref;
                }
                self.zones[tail].next_in_pref = index;
                self.zones[index].next_in_pref = head;
            }
        }
        self.prefs[preference].count += 1;

        self.zone_count += 1;
        Ok(index)
    }

    /// Picks a zone able to satisfy `2^order` pages under `flags`.
    ///
    /// The walk starts at the preferred zone, goes once around its
    /// preference ring, then restarts at the head of each lower ring down
    /// to `base_pref`. The chosen zone is returned together with its held
    /// lock guard; the caller performs the buddy allocation and the guard
    /// release. `None` covers both exhaustion and a refused ZONE_REQUIRED
    /// request.
    pub fn get_zone(
        &self,
        required: usize,
        flags: AllocFlags,
        preferred: usize,
        base_pref: usize,
    ) -> Option<(usize, IrqSpinGuard<'_, ZoneInner>)> {
        let mut pref = self.zones[preferred].preference_index;
        if pref < base_pref {
            return None;
        }
        let mut trial = preferred;
        let mut ring_start = preferred;

        loop {
            loop {
                let guard = self.zones[trial].inner.lock();
                let state = zone_state(required, &guard);
                match zone_action(state, flags) {
                    AllocAction::Allocate => return Some((trial, guard)),
                    AllocAction::RetFail => return None,
                    AllocAction::GotoNext => drop(guard),
                }

                trial = self.zones[trial].next_in_pref;
                if trial == ring_start {
                    break;
                }
            }

            // Descend to the next non-empty preference ring, if any.
            loop {
                if pref == base_pref {
                    return None;
                }
                pref -= 1;
                if let Some(head) = self.prefs[pref].first_zone {
                    trial = head;
                    ring_start = head;
                    break;
                }
            }
        }
    }

    /// Allocates a `2^order`-page block, returning the global descriptor
    /// index of its first frame.
    pub fn allocate_block(
        &self,
        order: usize,
        base_pref: usize,
        preferred: usize,
        flags: AllocFlags,
    ) -> AllocResult<u32> {
        if order > MAX_ORDER || preferred >= self.zone_count {
            return Err(AllocError::InvalidParam);
        }

        let required = 1usize << order;
        let (_zone, mut guard) = self
            .get_zone(required, flags, preferred, base_pref)
            .ok_or(AllocError::NoMemory)?;

        match guard.buddy.allocate(order) {
            Some(frame) => {
                guard.memory_allocated += required;
                Ok(frame)
            }
            None => {
                // The watermark admitted the request but no contiguous
                // block of this order exists (fragmentation).
                warn!(
                    "zone allocator: zone {} passed watermarks but held no order-{} block",
                    _zone, order
                );
                Err(AllocError::NoMemory)
            }
        }
    }

    /// Returns a block to its owning zone. The zone is recovered from the
    /// descriptor's zone index; no search happens.
    pub fn free_block(&self, frame: u32) {
        let zone_index = self.table.get(frame).zone_index() as usize;
        if zone_index >= self.zone_count {
            debug_assert!(false, "free of frame {} with no owning zone", frame);
            error!(
                "zone allocator: frame {} carries invalid zone index {}",
                frame, zone_index
            );
            return;
        }

        let mut guard = self.zones[zone_index].inner.lock();
        let order = self.table.get(frame).order();
        let pages = 1usize << order;

        debug_assert!(guard.memory_allocated >= pages);
        guard.memory_allocated = guard.memory_allocated.saturating_sub(pages);
        guard.buddy.free(frame);
    }

    /// Zone counters: (total, allocated, reserved) pages.
    pub fn zone_usage(&self, index: usize) -> (usize, usize, usize) {
        let inner = self.zones[index].inner.lock();
        (
            inner.memory_size,
            inner.memory_allocated,
            inner.memory_reserved,
        )
    }

    /// Adjusts a zone's reserve watermark.
    pub fn set_zone_reserve(&self, index: usize, pages: usize) {
        let mut inner = self.zones[index].inner.lock();
        if pages > inner.memory_size {
            debug!(
                "zone allocator: clamping reserve {} to zone size {}",
                pages, inner.memory_size
            );
        }
        inner.memory_reserved = pages.min(inner.memory_size);
    }

    /// Snapshot of one zone's free-list lengths, taken under its lock.
    pub fn free_list_lengths(&self, index: usize) -> [usize; MAX_ORDER + 1] {
        let inner = self.zones[index].inner.lock();
        let mut lengths = [0; MAX_ORDER + 1];
        for (order, slot) in lengths.iter_mut().enumerate() {
            *slot = inner.buddy.list_len(order);
        }
        lengths
    }

    /// Free pages currently on one zone's buddy lists.
    pub fn zone_free_pages(&self, index: usize) -> usize {
        self.zones[index].inner.lock().buddy.free_pages()
    }
}

impl Default for ZoneAllocator {
    fn default() -> Self {
        Self::new()
    }
}
