//! Cache creation, destruction and the live-cache registry.
//!
//! Cache descriptors are themselves slab objects: the manager embeds one
//! meta-cache describing `ObjectCache`, and every `create` call carves the
//! new descriptor out of it. All live caches hang off a registry ring so a
//! page's owner tag can be traced back to a known cache.

#[cfg(feature = "log")]
use log::error;

use core::mem;
use core::ptr::{self, NonNull};

use crate::list::CircularList;
use crate::sync::IrqSpinLock;
use crate::{AllocError, AllocResult, DEFAULT_PAGE_SIZE};

use super::cache::{ObjectCache, CACHE_LINE};
use super::{ObjectCtor, ObjectDtor, SlabPageSource};

/// Opaque, copyable reference to a live [`ObjectCache`].
#[derive(Debug)]
pub struct CacheHandle<const PAGE_SIZE: usize = DEFAULT_PAGE_SIZE> {
    cache: NonNull<ObjectCache<PAGE_SIZE>>,
}

impl<const PAGE_SIZE: usize> Clone for CacheHandle<PAGE_SIZE> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<const PAGE_SIZE: usize> Copy for CacheHandle<PAGE_SIZE> {}

impl<const PAGE_SIZE: usize> PartialEq for CacheHandle<PAGE_SIZE> {
    fn eq(&self, other: &Self) -> bool {
        self.cache == other.cache
    }
}

impl<const PAGE_SIZE: usize> Eq for CacheHandle<PAGE_SIZE> {}

// The cache behind the handle is internally locked.
unsafe impl<const PAGE_SIZE: usize> Send for CacheHandle<PAGE_SIZE> {}
unsafe impl<const PAGE_SIZE: usize> Sync for CacheHandle<PAGE_SIZE> {}

impl<const PAGE_SIZE: usize> CacheHandle<PAGE_SIZE> {
    pub(crate) fn new(cache: NonNull<ObjectCache<PAGE_SIZE>>) -> Self {
        Self { cache }
    }

    /// Borrows the cache. Undefined after the cache was destroyed.
    pub fn get(&self) -> &ObjectCache<PAGE_SIZE> {
        unsafe { self.cache.as_ref() }
    }

    pub(crate) fn addr(&self) -> usize {
        self.cache.as_ptr() as usize
    }

    /// Rebuilds a handle from a descriptor owner tag.
    ///
    /// The tag must have been written by the slab layer for a page of a
    /// still-live cache.
    pub(crate) unsafe fn from_addr(addr: usize) -> Option<Self> {
        NonNull::new(addr as *mut ObjectCache<PAGE_SIZE>).map(Self::new)
    }
}

/// Owner of the meta-cache and the registry of live caches.
pub struct CacheManager<const PAGE_SIZE: usize = DEFAULT_PAGE_SIZE> {
    /// Cache the cache descriptors themselves live in.
    meta: ObjectCache<PAGE_SIZE>,
    registry: IrqSpinLock<CircularList>,
}

impl<const PAGE_SIZE: usize> CacheManager<PAGE_SIZE> {
    pub const fn new() -> Self {
        Self {
            meta: ObjectCache::describe_unchecked(
                "object-cache",
                mem::size_of::<ObjectCache<PAGE_SIZE>>(),
                CACHE_LINE,
                None,
                None,
            ),
            registry: IrqSpinLock::new(CircularList::new()),
        }
    }

    /// Number of live caches, the meta-cache excluded.
    pub fn cache_count(&self) -> usize {
        self.registry.lock().len()
    }

    /// Whether a handle refers to a registered cache.
    pub fn contains(&self, handle: CacheHandle<PAGE_SIZE>) -> bool {
        self.registry.lock().iter().any(|addr| addr == handle.addr())
    }

    /// Resolves a page owner tag to a handle when it names the meta-cache
    /// or a registered cache.
    pub fn resolve_owner(&self, owner: usize) -> Option<CacheHandle<PAGE_SIZE>> {
        if owner == &self.meta as *const ObjectCache<PAGE_SIZE> as usize {
            return unsafe { CacheHandle::from_addr(owner) };
        }
        let handle = unsafe { CacheHandle::from_addr(owner)? };
        self.contains(handle).then_some(handle)
    }

    /// Creates a new object type: validates the layout, allocates a
    /// descriptor from the meta-cache and links it into the registry.
    pub fn create(
        &self,
        pages: &dyn SlabPageSource,
        name: &'static str,
        raw_size: usize,
        align: usize,
        ctor: Option<ObjectCtor>,
        dtor: Option<ObjectDtor>,
    ) -> AllocResult<CacheHandle<PAGE_SIZE>> {
        let descriptor = ObjectCache::<PAGE_SIZE>::describe(name, raw_size, align, ctor, dtor)?;

        let slot = self
            .meta
            .alloc_object(pages, true)
            .ok_or(AllocError::NoMemory)?;
        let cache = slot.as_ptr() as *mut ObjectCache<PAGE_SIZE>;
        unsafe {
            ptr::write(cache, descriptor);
        }

        self.registry.lock().add_last(cache as usize);
        Ok(CacheHandle::new(unsafe { NonNull::new_unchecked(cache) }))
    }

    /// Destroys a cache. Succeeds only when no object of the type is in
    /// circulation; the cached empty slab is torn down, the descriptor is
    /// unlinked and returned to the meta-cache. The handle is undefined
    /// afterwards.
    pub fn destroy(&self, pages: &dyn SlabPageSource, handle: CacheHandle<PAGE_SIZE>) -> bool {
        if !self.contains(handle) {
            error!("cache manager: destroy of unregistered cache {:#x}", handle.addr());
            return false;
        }

        if !handle.get().release_cached_empty(pages) {
            return false;
        }

        self.registry.lock().remove(handle.addr());

        let slot = unsafe { NonNull::new_unchecked(handle.addr() as *mut u8) };
        self.meta.dealloc_object(pages, slot);
        true
    }
}

impl<const PAGE_SIZE: usize> Default for CacheManager<PAGE_SIZE> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AllocFlags;
    use std::alloc::{alloc, dealloc, Layout};
    use std::vec::Vec;

    const PAGE_SIZE: usize = 0x1000;

    struct MockPageSource {
        allocated: IrqSpinLock<Vec<usize>>,
    }

    impl MockPageSource {
        fn new() -> Self {
            Self {
                allocated: IrqSpinLock::new(Vec::new()),
            }
        }

        fn live_pages(&self) -> usize {
            self.allocated.lock().len()
        }
    }

    impl Drop for MockPageSource {
        fn drop(&mut self) {
            let layout = Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap();
            for &page in self.allocated.lock().iter() {
                unsafe { dealloc(page as *mut u8, layout) };
            }
        }
    }

    impl SlabPageSource for MockPageSource {
        fn allocate_slab_page(&self, _flags: AllocFlags) -> AllocResult<usize> {
            let layout = Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap();
            let page = unsafe { alloc(layout) } as usize;
            if page == 0 {
                return Err(AllocError::NoMemory);
            }
            self.allocated.lock().push(page);
            Ok(page)
        }

        fn release_slab_page(&self, addr: usize) {
            let mut allocated = self.allocated.lock();
            let index = allocated
                .iter()
                .position(|&page| page == addr)
                .expect("release of unknown page");
            allocated.swap_remove(index);
            let layout = Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap();
            unsafe { dealloc(addr as *mut u8, layout) };
        }

        fn tag_slab_page(&self, _addr: usize, _owner: usize) {}

        fn slab_page_owner(&self, _addr: usize) -> usize {
            0
        }
    }

    #[test]
    fn test_create_registers_cache() {
        let pages = MockPageSource::new();
        let manager = CacheManager::<PAGE_SIZE>::new();

        let handle = manager
            .create(&pages, "widget", 96, CACHE_LINE, None, None)
            .unwrap();

        assert_eq!(manager.cache_count(), 1);
        assert!(manager.contains(handle));
        assert_eq!(handle.get().name(), "widget");
        assert_eq!(handle.get().buffer_size(), 128);
    }

    #[test]
    fn test_destroy_empty_cache() {
        let pages = MockPageSource::new();
        let manager = CacheManager::<PAGE_SIZE>::new();

        let handle = manager
            .create(&pages, "widget", 96, 0, None, None)
            .unwrap();
        assert!(manager.destroy(&pages, handle));
        assert_eq!(manager.cache_count(), 0);
    }

    #[test]
    fn test_destroy_refused_with_live_objects() {
        let pages = MockPageSource::new();
        let manager = CacheManager::<PAGE_SIZE>::new();

        let handle = manager
            .create(&pages, "widget", 96, 0, None, None)
            .unwrap();
        let object = handle.get().alloc_object(&pages, true).unwrap();

        assert!(!manager.destroy(&pages, handle));
        assert!(manager.contains(handle));

        handle.get().dealloc_object(&pages, object);
        assert!(manager.destroy(&pages, handle));
    }

    #[test]
    fn test_destroy_releases_cached_slab_page() {
        let pages = MockPageSource::new();
        let manager = CacheManager::<PAGE_SIZE>::new();

        let handle = manager
            .create(&pages, "widget", 96, 0, None, None)
            .unwrap();
        let object = handle.get().alloc_object(&pages, true).unwrap();
        handle.get().dealloc_object(&pages, object);

        // One page backs the meta slab, one backs the cached empty slab.
        assert_eq!(pages.live_pages(), 2);
        assert!(manager.destroy(&pages, handle));
        assert_eq!(pages.live_pages(), 1);
    }

    #[test]
    fn test_descriptors_share_meta_slab() {
        let pages = MockPageSource::new();
        let manager = CacheManager::<PAGE_SIZE>::new();

        let first = manager.create(&pages, "a", 32, 0, None, None).unwrap();
        let second = manager.create(&pages, "b", 48, 0, None, None).unwrap();

        assert_ne!(first, second);
        assert_eq!(pages.live_pages(), 1);
        assert_eq!(manager.cache_count(), 2);

        assert!(manager.destroy(&pages, second));
        assert!(manager.destroy(&pages, first));
    }
}
