//! Physical memory allocation core for a small x86 kernel.
//!
//! Two subsystems are layered on top of each other:
//! - A zoned buddy allocator partitions the machine's page frames into named
//!   zones (DMA, kernel data, kernel object, user, ...). Each zone owns an
//!   independent binary buddy allocator over a shared frame-descriptor table,
//!   and a top-level zone allocator selects a zone per request honoring
//!   preference order, reserve watermarks and per-request flags.
//! - A slab object cache sits above the page layer and manages constant-size,
//!   optionally constructed, typed object allocations out of page-sized slabs
//!   with embedded metadata and intrusive free stacks.
//!
//! The whole core is a single [`AllocatorCore`] value created once at boot
//! and shared by reference; every mutable path is guarded by a per-zone or
//! per-cache interrupt-safe spinlock, so there is no global allocator lock.

#![no_std]

#[cfg(test)]
extern crate std;

// Logging support - conditionally import log crate
#[cfg(feature = "log")]
extern crate log;

// Stub macros when log is disabled - these become no-ops
#[cfg(not(feature = "log"))]
macro_rules! error {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! warn {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
#[allow(unused_macros)]
macro_rules! info {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! debug {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
#[allow(unused_macros)]
macro_rules! trace {
    ($($arg:tt)*) => {};
}

use bitflags::bitflags;

/// Default page size for the frame and slab layers.
pub const DEFAULT_PAGE_SIZE: usize = 0x1000;

/// Maximum number of memory zones supported.
pub const MAX_ZONES: usize = 8;

/// Maximum number of zone preference classes.
pub const MAX_PREFERENCES: usize = 4;

/// Highest block order any zone may be configured with
/// (order 15 = 32768 pages = 128 MiB with 4 KiB pages).
pub const MAX_ORDER: usize = 15;

/// The error type used for allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// Invalid request or configuration parameter.
    InvalidParam,
    /// A configured memory region overlaps an existing zone.
    MemoryOverlap,
    /// No memory satisfying the request and its flags.
    NoMemory,
    /// Free of memory this allocator does not manage.
    NotAllocated,
}

/// A [`Result`] type with [`AllocError`] as the error type.
pub type AllocResult<T = ()> = Result<T, AllocError>;

bitflags! {
    /// Per-request allocation control flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// Admit the request into the reserve band (interrupt context).
        const ATOMIC = 1 << 0;
        /// Admit the request into the emergency band as a last resort.
        const NO_FAILURE = 1 << 1;
        /// Fail rather than descend to a less preferred zone.
        const ZONE_REQUIRED = 1 << 2;
        /// Bypass the per-CPU object magazine.
        const NO_CACHE = 1 << 3;
        /// Caller already runs with local interrupts disabled.
        const NO_INTERRUPT = 1 << 4;
    }
}

/// Named zone classes a caller can request pages from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ZoneKind {
    /// DMA-capable low memory.
    Dma = 0,
    /// General kernel data pages.
    KernelData = 1,
    /// Loadable kernel module pages.
    KernelModule = 2,
    /// Slab-backed kernel object pages.
    KernelObject = 3,
    /// Kernel text pages.
    Code = 4,
    /// User-space frames.
    User = 5,
}

impl ZoneKind {
    /// Number of zone kinds.
    pub const COUNT: usize = 6;

    /// Default preference class for a zone of this kind. DMA-capable
    /// memory ranks below general-purpose memory so ordinary requests
    /// only fall into it when everything else is exhausted.
    pub const fn default_preference(self) -> usize {
        match self {
            ZoneKind::Dma => 0,
            ZoneKind::KernelData
            | ZoneKind::KernelModule
            | ZoneKind::KernelObject
            | ZoneKind::Code => 1,
            ZoneKind::User => 2,
        }
    }
}

#[inline]
pub(crate) const fn align_down(pos: usize, align: usize) -> usize {
    pos & !(align - 1)
}

#[inline]
pub(crate) const fn align_up(pos: usize, align: usize) -> usize {
    (pos + align - 1) & !(align - 1)
}

pub mod sync;

pub mod list;

pub mod buddy;
pub use buddy::{DescFlags, DescriptorTable, FrameDescriptor};

pub mod zone;
pub use zone::{AllocAction, Zone, ZoneAllocator, ZoneState};

pub mod frame;
pub use frame::{MemoryRegion, PageFrameManager};

pub mod slab;
pub use slab::{
    CacheHandle, CacheManager, ObjectCache, ObjectCtor, ObjectDtor, Slab, SlabPageSource,
};

pub mod allocator_core;
pub use allocator_core::AllocatorCore;

#[cfg(feature = "tracking")]
pub mod stats;
#[cfg(feature = "tracking")]
pub use stats::ZoneSnapshot;

#[cfg(feature = "percpu-cache")]
pub mod percpu;
