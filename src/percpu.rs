//! Per-CPU object magazine (deferred).
//!
//! A magazine would serve order-0 allocations from a per-CPU depot and
//! refill in bulk from the owning zone, cutting zone-lock traffic on hot
//! paths. Only the shape ships today; `refill` soft-fails and callers fall
//! through to the regular zone path, which requests with `NO_CACHE` take
//! unconditionally.

use crate::list::FreeStack;
use crate::zone::ZoneAllocator;
use crate::{AllocError, AllocResult};

/// Number of frames a refill would pull from the zone at once.
pub const MAGAZINE_REFILL_ORDER: usize = 3;

/// Per-CPU depot of order-0 frames.
pub struct MagazineCache {
    depot: FreeStack,
    rounds: usize,
}

impl MagazineCache {
    pub const fn new() -> Self {
        Self {
            depot: FreeStack::new(),
            rounds: 0,
        }
    }

    pub fn rounds(&self) -> usize {
        self.rounds
    }

    /// Takes one frame address from the depot.
    pub fn take(&mut self) -> Option<usize> {
        let frame = self.depot.pop()?;
        self.rounds -= 1;
        Some(frame)
    }

    /// Returns one frame address to the depot.
    pub fn put(&mut self, frame: usize) {
        self.depot.push(frame);
        self.rounds += 1;
    }

    /// Bulk refill from a zone.
    ///
    /// Not implemented. A refill drops the cache lock while it allocates
    /// from the zone, so racing allocations may land in between.
    // TODO: re-check MAGAZINE_REFILL_ORDER against the depot level after
    // reacquiring the lock, and give back surplus frames.
    pub fn refill(&mut self, _zones: &ZoneAllocator) -> AllocResult {
        Err(AllocError::NoMemory)
    }
}

impl Default for MagazineCache {
    fn default() -> Self {
        Self::new()
    }
}
