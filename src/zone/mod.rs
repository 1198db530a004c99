//! Memory zones and the zone allocator.
//!
//! A zone is one contiguous range of page frames with its own buddy
//! allocator, watermark counters and spinlock. The zone allocator on top
//! picks a zone per request by walking preference rings and evaluating the
//! watermark state machine under each candidate's lock.

mod allocator;

pub use allocator::{ZoneAllocator, ZonePreference};

use crate::buddy::BuddyAllocator;
use crate::sync::IrqSpinLock;
use crate::{AllocFlags, ZoneKind};

/// Watermark status of a zone for one allocation case.
///
/// The reserve pool splits 7/8 for atomic callers and 1/8 for emergency
/// callers, so ordinary requests are refused early enough that interrupt
/// handlers and shutdown paths keep headroom.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneState {
    /// Request fits without touching the reserve.
    Allocable,
    /// Request fits only by dipping into the atomic band of the reserve.
    ReserveOverlap,
    /// Request fits only by draining into the emergency band.
    BarrierOverlap,
    /// Zone has fewer free pages than the request, reserve included.
    LowOnMemory,
}

/// What to do with a candidate zone, derived from its state and the
/// request flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocAction {
    /// Allocate from this zone now.
    Allocate,
    /// Try the next zone.
    GotoNext,
    /// Give up; the caller insisted on this zone.
    RetFail,
}

/// Counters and buddy state guarded by the zone lock.
pub struct ZoneInner {
    pub(crate) buddy: BuddyAllocator,
    /// Total pages in the zone.
    pub(crate) memory_size: usize,
    /// Pages currently handed out.
    pub(crate) memory_allocated: usize,
    /// Pages withheld for atomic and emergency callers.
    pub(crate) memory_reserved: usize,
}

impl ZoneInner {
    const fn empty() -> Self {
        Self {
            buddy: BuddyAllocator::empty(),
            memory_size: 0,
            memory_allocated: 0,
            memory_reserved: 0,
        }
    }
}

/// One memory zone. Configuration fields are written once at bootstrap;
/// everything else is behind the interrupt-safe lock.
pub struct Zone {
    pub(crate) kind: ZoneKind,
    pub(crate) preference_index: usize,
    /// Ring link to the next zone at the same preference (zone index).
    pub(crate) next_in_pref: usize,
    pub(crate) first_frame: u32,
    pub(crate) inner: IrqSpinLock<ZoneInner>,
}

impl Zone {
    pub(crate) const fn empty() -> Self {
        Self {
            kind: ZoneKind::Dma,
            preference_index: 0,
            next_in_pref: 0,
            first_frame: 0,
            inner: IrqSpinLock::new(ZoneInner::empty()),
        }
    }

    pub fn kind(&self) -> ZoneKind {
        self.kind
    }

    pub fn preference_index(&self) -> usize {
        self.preference_index
    }

    pub fn first_frame(&self) -> u32 {
        self.first_frame
    }

    /// Watermark status for a request of `required` pages.
    pub fn status(&self, required: usize) -> ZoneState {
        zone_state(required, &self.inner.lock())
    }
}

/// Computes the watermark state for `required` pages against the zone
/// counters. Subtraction of the reserve is clamped so a transiently
/// over-reserved zone degrades to the overlap bands instead of wrapping.
pub(crate) fn zone_state(required: usize, inner: &ZoneInner) -> ZoneState {
    let free = inner.memory_size - inner.memory_allocated;
    if required > free {
        return ZoneState::LowOnMemory;
    }

    let general = free.saturating_sub(inner.memory_reserved);
    if required <= general {
        ZoneState::Allocable
    } else if required <= general + (7 * inner.memory_reserved) / 8 {
        ZoneState::ReserveOverlap
    } else {
        ZoneState::BarrierOverlap
    }
}

/// Maps a zone state and the request flags to an action.
pub(crate) fn zone_action(state: ZoneState, flags: AllocFlags) -> AllocAction {
    match state {
        ZoneState::Allocable => return AllocAction::Allocate,
        ZoneState::ReserveOverlap => {
            if flags.intersects(AllocFlags::ATOMIC | AllocFlags::NO_FAILURE) {
                return AllocAction::Allocate;
            }
        }
        ZoneState::BarrierOverlap => {
            if flags.contains(AllocFlags::NO_FAILURE) {
                return AllocAction::Allocate;
            }
        }
        ZoneState::LowOnMemory => {}
    }

    if flags.contains(AllocFlags::ZONE_REQUIRED) {
        AllocAction::RetFail
    } else {
        AllocAction::GotoNext
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inner(size: usize, allocated: usize, reserved: usize) -> ZoneInner {
        ZoneInner {
            buddy: BuddyAllocator::empty(),
            memory_size: size,
            memory_allocated: allocated,
            memory_reserved: reserved,
        }
    }

    #[test]
    fn test_state_allocable() {
        let zone = inner(100, 40, 16);
        assert_eq!(zone_state(44, &zone), ZoneState::Allocable);
    }

    #[test]
    fn test_state_reserve_overlap() {
        // free = 20, reserved = 16: 17 pages exceed the general pool (4)
        // but fit inside the atomic band (4 + 14 = 18).
        let zone = inner(100, 80, 16);
        assert_eq!(zone_state(17, &zone), ZoneState::ReserveOverlap);
        assert_eq!(zone_state(18, &zone), ZoneState::ReserveOverlap);
    }

    #[test]
    fn test_state_barrier_overlap() {
        let zone = inner(100, 80, 16);
        assert_eq!(zone_state(19, &zone), ZoneState::BarrierOverlap);
        assert_eq!(zone_state(20, &zone), ZoneState::BarrierOverlap);
    }

    #[test]
    fn test_state_low_on_memory() {
        let zone = inner(100, 80, 16);
        assert_eq!(zone_state(21, &zone), ZoneState::LowOnMemory);
    }

    #[test]
    fn test_state_clamps_overcommitted_reserve() {
        // Reserve larger than what is free; the general pool clamps to 0.
        let zone = inner(100, 95, 16);
        assert_eq!(zone_state(1, &zone), ZoneState::ReserveOverlap);
        assert_eq!(zone_state(5, &zone), ZoneState::BarrierOverlap);
    }

    #[test]
    fn test_action_table() {
        let none = AllocFlags::empty();
        let atomic = AllocFlags::ATOMIC;
        let no_failure = AllocFlags::NO_FAILURE;
        let required = AllocFlags::ZONE_REQUIRED;

        assert_eq!(zone_action(ZoneState::Allocable, none), AllocAction::Allocate);
        assert_eq!(
            zone_action(ZoneState::ReserveOverlap, none),
            AllocAction::GotoNext
        );
        assert_eq!(
            zone_action(ZoneState::ReserveOverlap, atomic),
            AllocAction::Allocate
        );
        assert_eq!(
            zone_action(ZoneState::ReserveOverlap, no_failure),
            AllocAction::Allocate
        );
        assert_eq!(
            zone_action(ZoneState::BarrierOverlap, atomic),
            AllocAction::GotoNext
        );
        assert_eq!(
            zone_action(ZoneState::BarrierOverlap, no_failure),
            AllocAction::Allocate
        );
        assert_eq!(
            zone_action(ZoneState::LowOnMemory, no_failure),
            AllocAction::GotoNext
        );
        assert_eq!(
            zone_action(ZoneState::LowOnMemory, required),
            AllocAction::RetFail
        );
        assert_eq!(
            zone_action(ZoneState::ReserveOverlap, required),
            AllocAction::RetFail
        );
    }
}
