//! Top-level allocation core.
//!
//! One `AllocatorCore` exists per kernel. It is created empty at boot,
//! fed the bootloader memory map once, and then shared by reference with
//! every consumer; all runtime entry points take `&self` and synchronize
//! through the per-zone and per-cache locks underneath.

use core::ptr::NonNull;

use crate::frame::{MemoryRegion, PageFrameManager};
use crate::slab::{CacheHandle, CacheManager, ObjectCtor, ObjectDtor, SlabPageSource};
use crate::{AllocFlags, AllocResult, ZoneKind, DEFAULT_PAGE_SIZE};

/// The physical memory allocation core: zoned page frames below, slab
/// object caches above.
pub struct AllocatorCore<const PAGE_SIZE: usize = DEFAULT_PAGE_SIZE> {
    frames: PageFrameManager<PAGE_SIZE>,
    caches: CacheManager<PAGE_SIZE>,
}

impl<const PAGE_SIZE: usize> AllocatorCore<PAGE_SIZE> {
    pub const fn new() -> Self {
        Self {
            frames: PageFrameManager::new(),
            caches: CacheManager::new(),
        }
    }

    /// Populates zones from the boot memory map. Must run exactly once,
    /// before any allocation.
    pub fn bootstrap(&mut self, regions: &[MemoryRegion]) -> AllocResult {
        self.frames.bootstrap(regions)
    }

    /// The page-frame layer, for descriptor probes and zone introspection.
    pub fn frames(&self) -> &PageFrameManager<PAGE_SIZE> {
        &self.frames
    }

    /// Allocates `2^order` pages and returns their physical address.
    pub fn pages_allocate(
        &self,
        order: usize,
        kind: ZoneKind,
        flags: AllocFlags,
    ) -> AllocResult<usize> {
        self.frames.pages_allocate(order, kind, flags)
    }

    /// Frees a block previously returned by [`pages_allocate`].
    ///
    /// [`pages_allocate`]: AllocatorCore::pages_allocate
    pub fn pages_free(&self, addr: usize) {
        self.frames.pages_free(addr)
    }

    /// Frame descriptor of a managed physical address.
    pub fn frame_descriptor_of(&self, addr: usize) -> Option<&crate::FrameDescriptor> {
        self.frames.frame_descriptor_of(addr)
    }

    /// Creates a typed object cache.
    pub fn cache_create(
        &self,
        name: &'static str,
        raw_size: usize,
        align: usize,
        ctor: Option<ObjectCtor>,
        dtor: Option<ObjectDtor>,
    ) -> AllocResult<CacheHandle<PAGE_SIZE>> {
        self.caches
            .create(&self.frames, name, raw_size, align, ctor, dtor)
    }

    /// Destroys a cache; succeeds only when no object is in circulation.
    /// The handle is undefined after a successful destroy.
    pub fn cache_destroy(&self, handle: CacheHandle<PAGE_SIZE>) -> bool {
        self.caches.destroy(&self.frames, handle)
    }

    /// Allocates one object from a cache. `sleep` is advisory; interrupt
    /// context must pass `false`.
    pub fn alloc_object(
        &self,
        handle: CacheHandle<PAGE_SIZE>,
        sleep: bool,
    ) -> Option<NonNull<u8>> {
        handle.get().alloc_object(&self.frames, sleep)
    }

    /// Returns one object to its cache.
    pub fn dealloc_object(&self, handle: CacheHandle<PAGE_SIZE>, object: NonNull<u8>) {
        handle.get().dealloc_object(&self.frames, object)
    }

    /// Which cache owns a slab-backed page, per the descriptor owner tag.
    pub fn cache_of_page(&self, addr: usize) -> Option<CacheHandle<PAGE_SIZE>> {
        self.caches.resolve_owner(self.frames.slab_page_owner(addr))
    }
}

impl<const PAGE_SIZE: usize> Default for AllocatorCore<PAGE_SIZE> {
    fn default() -> Self {
        Self::new()
    }
}
