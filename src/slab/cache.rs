//! Per-type object cache.
//!
//! An `ObjectCache` describes one object type and owns its slabs. Slabs
//! with free buffers sit on the partial ring, exhausted slabs on the full
//! ring, and at most one fully-free slab is cached aside so a tight
//! alloc/free loop does not bounce pages off the zone allocator. The cache
//! lock pairs with the local interrupt gate since both entry points may run
//! in interrupt context; backing pages are acquired and released with the
//! lock dropped so a thread never holds a cache lock and a zone lock at
//! once.

#[cfg(feature = "log")]
use log::{debug, error};

use core::mem;
use core::ptr::{self, NonNull};

use crate::list::{CircularLink, CircularList};
use crate::sync::IrqSpinLock;
use crate::{align_up, AllocError, AllocFlags, AllocResult, DEFAULT_PAGE_SIZE};

use super::slab::Slab;
use super::{ObjectCtor, ObjectDtor, SlabPageSource};

/// L1 cache-line granularity used for object alignment.
pub const CACHE_LINE: usize = 64;

/// Slab rings and the cached empty slab, guarded by the cache lock.
struct CacheState {
    /// Slabs with at least one free buffer.
    partial: CircularList,
    /// Slabs with no free buffer.
    full: CircularList,
    /// At most one fully-free slab kept aside; zero when absent.
    empty_slab: usize,
}

impl CacheState {
    const fn new() -> Self {
        Self {
            partial: CircularList::new(),
            full: CircularList::new(),
            empty_slab: 0,
        }
    }
}

/// Object-type descriptor and slab cache.
#[repr(C)]
pub struct ObjectCache<const PAGE_SIZE: usize = DEFAULT_PAGE_SIZE> {
    /// Membership in the cache manager's registry ring.
    pub(crate) registry_link: CircularLink,
    name: &'static str,
    raw_size: usize,
    align: usize,
    /// Raw size rounded up to the alignment, at least one word.
    buffer_size: usize,
    buffers_per_slab: usize,
    ctor: Option<ObjectCtor>,
    dtor: Option<ObjectDtor>,
    state: IrqSpinLock<CacheState>,
}

impl<const PAGE_SIZE: usize> ObjectCache<PAGE_SIZE> {
    /// Builds a cache descriptor, validating the object layout.
    ///
    /// Objects larger than an eighth of a page would break slab recovery
    /// by address masking and are refused.
    pub fn describe(
        name: &'static str,
        raw_size: usize,
        align: usize,
        ctor: Option<ObjectCtor>,
        dtor: Option<ObjectDtor>,
    ) -> AllocResult<Self> {
        if raw_size == 0 || raw_size > PAGE_SIZE / 8 {
            error!(
                "slab cache: object size {} out of range for {}-byte pages",
                raw_size, PAGE_SIZE
            );
            return Err(AllocError::InvalidParam);
        }
        if align != 0 && !align.is_power_of_two() {
            return Err(AllocError::InvalidParam);
        }

        let cache = Self::describe_unchecked(name, raw_size, align, ctor, dtor);
        if cache.buffers_per_slab == 0 {
            error!(
                "slab cache: {}-byte buffers at align {} leave no room in a slab",
                cache.buffer_size, cache.align
            );
            return Err(AllocError::InvalidParam);
        }
        Ok(cache)
    }

    /// Builds a cache descriptor without layout validation; used for the
    /// compile-time known meta-cache.
    pub(crate) const fn describe_unchecked(
        name: &'static str,
        raw_size: usize,
        align: usize,
        ctor: Option<ObjectCtor>,
        dtor: Option<ObjectDtor>,
    ) -> Self {
        // A free buffer stores the stack link in its first word.
        let min_align = mem::size_of::<usize>();
        let effective_align = if align < min_align { min_align } else { align };
        let padded = if raw_size < min_align {
            min_align
        } else {
            raw_size
        };
        let buffer_size = align_up(padded, effective_align);
        let buffers_per_slab = (PAGE_SIZE - mem::size_of::<Slab>()) / buffer_size;

        Self {
            registry_link: CircularLink::new(),
            name,
            raw_size,
            align: effective_align,
            buffer_size,
            buffers_per_slab,
            ctor,
            dtor,
            state: IrqSpinLock::new(CacheState::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn raw_size(&self) -> usize {
        self.raw_size
    }

    pub fn align(&self) -> usize {
        self.align
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn buffers_per_slab(&self) -> usize {
        self.buffers_per_slab
    }

    /// (partial slabs, full slabs, cached empty present).
    pub fn slab_counts(&self) -> (usize, usize, bool) {
        let state = self.state.lock();
        (
            state.partial.len(),
            state.full.len(),
            state.empty_slab != 0,
        )
    }

    /// Free buffers across the partial ring and the cached empty slab.
    pub fn free_buffers(&self) -> usize {
        let state = self.state.lock();
        let mut total = 0;
        for slab in state.partial.iter() {
            total += unsafe { Slab::at(slab) }.free_count;
        }
        if state.empty_slab != 0 {
            total += self.buffers_per_slab;
        }
        total
    }

    /// Allocates one object, constructing a fresh slab on a miss.
    ///
    /// `sleep` is advisory; there is no waiting path yet, but no-sleep
    /// requests let the backing-page allocation dip into the reserve band
    /// so interrupt-context refills keep working under pressure.
    pub fn alloc_object(
        &self,
        pages: &dyn SlabPageSource,
        sleep: bool,
    ) -> Option<NonNull<u8>> {
        let mut state = self.state.lock();

        let slab_addr = if let Some(partial) = state.partial.main() {
            partial
        } else if state.empty_slab != 0 {
            let promoted = state.empty_slab;
            state.empty_slab = 0;
            state.partial.add_last(promoted);
            promoted
        } else {
            drop(state);
            let fresh = self.construct_slab(pages, sleep)?;
            state = self.state.lock();
            state.partial.add_last(fresh);
            fresh
        };

        let slab = unsafe { Slab::at(slab_addr) };
        let buffer = match slab.free_stack.pop() {
            Some(buffer) => buffer,
            None => {
                debug_assert!(false, "partial slab with empty free stack");
                error!(
                    "slab cache {}: partial slab {:#x} holds no free buffer",
                    self.name, slab_addr
                );
                return None;
            }
        };
        slab.free_count -= 1;

        if slab.free_count == 0 {
            state.partial.remove(slab_addr);
            state.full.add_first(slab_addr);
        }

        NonNull::new(buffer as *mut u8)
    }

    /// Returns one object to its slab, repositioning the slab between the
    /// rings. When the slab becomes the second fully-free slab of the
    /// cache, the older cached empty slab is torn down.
    pub fn dealloc_object(&self, pages: &dyn SlabPageSource, object: NonNull<u8>) {
        let object_addr = object.as_ptr() as usize;
        let slab_addr = Slab::of_object::<PAGE_SIZE>(object_addr);

        let mut doomed = 0;
        {
            let mut state = self.state.lock();
            let slab = unsafe { Slab::at(slab_addr) };

            slab.free_stack.push(object_addr);
            slab.free_count += 1;

            if slab.free_count == 1 {
                // Came off the full ring.
                state.full.remove(slab_addr);
                state.partial.add_first(slab_addr);
            } else if slab.free_count == self.buffers_per_slab {
                state.partial.remove(slab_addr);
                doomed = state.empty_slab;
                state.empty_slab = slab_addr;
            }
        }

        if doomed != 0 {
            self.destroy_slab(pages, doomed);
        }
    }

    /// Tears down every slab the cache still holds, provided no object is
    /// in circulation. Used by cache destruction.
    pub(crate) fn release_cached_empty(&self, pages: &dyn SlabPageSource) -> bool {
        let doomed = {
            let mut state = self.state.lock();
            if !state.partial.is_empty() || !state.full.is_empty() {
                return false;
            }
            let doomed = state.empty_slab;
            state.empty_slab = 0;
            doomed
        };

        if doomed != 0 {
            self.destroy_slab(pages, doomed);
        }
        true
    }

    /// Creates a slab on a fresh kernel-object page: zero the page, place
    /// the header at the tail, construct and stack every buffer below the
    /// fence, and stamp the owner tag into the frame descriptor.
    fn construct_slab(&self, pages: &dyn SlabPageSource, sleep: bool) -> Option<usize> {
        let mut flags = AllocFlags::empty();
        if !sleep {
            flags |= AllocFlags::ATOMIC;
        }

        let page = match pages.allocate_slab_page(flags) {
            Ok(page) => page,
            Err(_) => {
                debug!("slab cache {}: backing page allocation failed", self.name);
                return None;
            }
        };

        unsafe {
            ptr::write_bytes(page as *mut u8, 0, PAGE_SIZE);
        }

        let slab_addr = page + Slab::header_offset::<PAGE_SIZE>();
        unsafe {
            ptr::write(slab_addr as *mut Slab, Slab::new(0));
        }

        let slab = unsafe { Slab::at(slab_addr) };
        let fence = slab_addr;
        let mut position = page + slab.coloring_offset;
        let mut stacked = 0;
        while position + self.buffer_size <= fence {
            if let Some(ctor) = self.ctor {
                ctor(position as *mut u8);
            }
            slab.free_stack.push(position);
            stacked += 1;
            position += self.buffer_size;
        }
        slab.free_count = stacked;
        debug_assert_eq!(stacked, self.buffers_per_slab);

        pages.tag_slab_page(page, self as *const Self as usize);
        Some(slab_addr)
    }

    /// Destroys a fully-free slab: run destructors over the stacked
    /// buffers, clear the owner tag and return the page.
    fn destroy_slab(&self, pages: &dyn SlabPageSource, slab_addr: usize) {
        let slab = unsafe { Slab::at(slab_addr) };
        debug_assert_eq!(slab.free_count, self.buffers_per_slab);

        if let Some(dtor) = self.dtor {
            for buffer in slab.free_stack.iter() {
                dtor(buffer as *mut u8);
            }
        }

        let page = Slab::page_base::<PAGE_SIZE>(slab_addr);
        pages.tag_slab_page(page, 0);
        pages.release_slab_page(page);
    }
}
