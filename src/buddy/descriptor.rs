//! Page-frame descriptors.
//!
//! One fixed-size descriptor exists per physical page frame, all of them in
//! a single contiguous table indexed by frame number. The table memory is
//! carved out of the managed region at bootstrap and never moves, so free
//! lists can link descriptors by index. Buddy arithmetic is pure index
//! math: the buddy of zone-relative frame `i` at order `k` is `i ^ (1 << k)`.

use core::sync::atomic::{AtomicUsize, Ordering};

use bitflags::bitflags;

use crate::list::{LinkArena, ListLink};

/// Zone index marking a frame no zone manages (descriptor-table pages,
/// alignment slack).
pub const NO_ZONE: u8 = u8::MAX;

bitflags! {
    /// Page-frame descriptor state bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DescFlags: u8 {
        /// Frame heads a free block of its recorded order.
        const FREE = 1 << 0;
        /// Block was produced as the lower half of a split.
        const LOWER_SPLIT = 1 << 1;
        /// Frame is outside every zone and never enters a free list.
        const RESERVED = 1 << 2;
    }
}

/// Descriptor of one physical page frame.
#[repr(C)]
pub struct FrameDescriptor {
    pub(crate) link: ListLink,
    order: u8,
    zone_index: u8,
    flags: DescFlags,
    owner: AtomicUsize,
}

impl FrameDescriptor {
    pub const fn new() -> Self {
        Self {
            link: ListLink::new(),
            order: 0,
            zone_index: NO_ZONE,
            flags: DescFlags::RESERVED,
            owner: AtomicUsize::new(0),
        }
    }

    /// Block order; meaningful for block heads only.
    pub fn order(&self) -> usize {
        self.order as usize
    }

    pub(crate) fn set_order(&mut self, order: usize) {
        self.order = order as u8;
    }

    /// Index of the owning zone, written once at configuration.
    pub fn zone_index(&self) -> u8 {
        self.zone_index
    }

    pub(crate) fn set_zone_index(&mut self, zone: u8) {
        self.zone_index = zone;
    }

    pub fn flags(&self) -> DescFlags {
        self.flags
    }

    pub fn is_free(&self) -> bool {
        self.flags.contains(DescFlags::FREE)
    }

    pub(crate) fn set_flags(&mut self, flags: DescFlags) {
        self.flags = flags;
    }

    pub(crate) fn remove_flags(&mut self, flags: DescFlags) {
        self.flags &= !flags;
    }

    /// Auxiliary owner tag; the slab layer stores the owning cache here so
    /// a page can be traced back to its cache.
    pub fn owner(&self) -> usize {
        self.owner.load(Ordering::Acquire)
    }

    pub fn set_owner(&self, owner: usize) {
        self.owner.store(owner, Ordering::Release);
    }
}

impl Default for FrameDescriptor {
    fn default() -> Self {
        Self::new()
    }
}

/// Borrowed view of the contiguous frame-descriptor table.
///
/// The table lives in externally provided memory, so this is a raw base
/// pointer plus a length; copies of the view are handed to each zone's
/// buddy allocator. Descriptor mutation is serialized by the owning zone's
/// lock, and the shared `owner` tag is atomic.
#[derive(Debug, Clone, Copy)]
pub struct DescriptorTable {
    base: *mut FrameDescriptor,
    len: usize,
}

unsafe impl Send for DescriptorTable {}
unsafe impl Sync for DescriptorTable {}

impl DescriptorTable {
    pub const fn empty() -> Self {
        Self {
            base: core::ptr::null_mut(),
            len: 0,
        }
    }

    /// Wraps an externally initialized descriptor array.
    ///
    /// The memory must hold `len` initialized descriptors and outlive every
    /// copy of this view.
    pub unsafe fn new(base: *mut FrameDescriptor, len: usize) -> Self {
        Self { base, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, index: u32) -> &FrameDescriptor {
        debug_assert!((index as usize) < self.len, "frame index out of table");
        unsafe { &*self.base.add(index as usize) }
    }

    pub fn get_mut(&mut self, index: u32) -> &mut FrameDescriptor {
        debug_assert!((index as usize) < self.len, "frame index out of table");
        unsafe { &mut *self.base.add(index as usize) }
    }
}

impl LinkArena for DescriptorTable {
    fn link(&self, index: u32) -> &ListLink {
        &self.get(index).link
    }

    fn link_mut(&mut self, index: u32) -> &mut ListLink {
        &mut self.get_mut(index).link
    }
}
