//! Page frame manager.
//!
//! Thin facade over the zone allocator: translates between physical
//! addresses and frame-descriptor indices and owns bootstrap, which turns
//! the bootloader's memory map into configured zones. The descriptor table
//! for the whole managed span is carved out of the front of the first
//! region before that region's remainder becomes a zone.

#[cfg(feature = "log")]
use log::{debug, error, info, warn};

use core::ptr;

use crate::buddy::{DescriptorTable, FrameDescriptor, NO_ZONE};
use crate::slab::SlabPageSource;
use crate::zone::ZoneAllocator;
use crate::{
    align_down, align_up, AllocError, AllocFlags, AllocResult, ZoneKind, DEFAULT_PAGE_SIZE,
    MAX_ORDER,
};

/// One entry of the bootloader memory map handed to [`bootstrap`].
///
/// [`bootstrap`]: PageFrameManager::bootstrap
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    /// Physical base address.
    pub base: usize,
    /// Length in bytes.
    pub size: usize,
    /// Zone class the region's frames belong to.
    pub kind: ZoneKind,
}

/// Fraction of a zone withheld as the reserve watermark by default.
const DEFAULT_RESERVE_DIVISOR: usize = 16;

/// Facade exporting physical addresses over the zoned buddy allocator.
pub struct PageFrameManager<const PAGE_SIZE: usize = DEFAULT_PAGE_SIZE> {
    zones: ZoneAllocator,
    table: DescriptorTable,
    /// Physical address of frame 0.
    span_base: usize,
    frame_count: usize,
    /// Preferred zone per zone kind.
    zone_for_kind: [Option<usize>; ZoneKind::COUNT],
}

impl<const PAGE_SIZE: usize> PageFrameManager<PAGE_SIZE> {
    pub const fn new() -> Self {
        Self {
            zones: ZoneAllocator::new(),
            table: DescriptorTable::empty(),
            span_base: 0,
            frame_count: 0,
            zone_for_kind: [None; ZoneKind::COUNT],
        }
    }

    pub fn zones(&self) -> &ZoneAllocator {
        &self.zones
    }

    pub fn zone_for_kind(&self, kind: ZoneKind) -> Option<usize> {
        self.zone_for_kind[kind as usize]
    }

    /// Populates zones from the boot memory map.
    ///
    /// The frame-descriptor table covering the whole span is placed at the
    /// start of the first region; the first region must be large enough to
    /// hold it plus at least one page. Regions must not overlap.
    pub fn bootstrap(&mut self, regions: &[MemoryRegion]) -> AllocResult {
        if regions.is_empty() || self.frame_count != 0 {
            return Err(AllocError::InvalidParam);
        }

        for (i, a) in regions.iter().enumerate() {
            if a.size < PAGE_SIZE {
                return Err(AllocError::InvalidParam);
            }
            for b in regions.iter().skip(i + 1) {
                if a.base < b.base + b.size && b.base < a.base + a.size {
                    error!(
                        "frame manager: regions [{:#x}, {:#x}) and [{:#x}, {:#x}) overlap",
                        a.base,
                        a.base + a.size,
                        b.base,
                        b.base + b.size
                    );
                    return Err(AllocError::MemoryOverlap);
                }
            }
        }

        let span_base = align_down(
            regions.iter().map(|r| r.base).min().unwrap_or(0),
            PAGE_SIZE,
        );
        let span_end = align_up(
            regions.iter().map(|r| r.base + r.size).max().unwrap_or(0),
            PAGE_SIZE,
        );
        let frame_count = (span_end - span_base) / PAGE_SIZE;

        // Carve the descriptor table from the front of the first region.
        let table_base = align_up(regions[0].base, PAGE_SIZE);
        let table_bytes = frame_count * core::mem::size_of::<FrameDescriptor>();
        let table_pages = align_up(table_bytes, PAGE_SIZE) / PAGE_SIZE;
        let first_usable = table_base + table_pages * PAGE_SIZE;
        if first_usable + PAGE_SIZE > regions[0].base + regions[0].size {
            error!(
                "frame manager: first region too small for {} descriptor pages",
                table_pages
            );
            return Err(AllocError::InvalidParam);
        }

        let descriptors = table_base as *mut FrameDescriptor;
        for index in 0..frame_count {
            unsafe {
                ptr::write(descriptors.add(index), FrameDescriptor::new());
            }
        }
        let table = unsafe { DescriptorTable::new(descriptors, frame_count) };

        self.table = table;
        self.span_base = span_base;
        self.frame_count = frame_count;
        self.zones.attach_table(table);

        for (region_index, region) in regions.iter().enumerate() {
            let mut zone_base = align_up(region.base, PAGE_SIZE);
            if region_index == 0 {
                zone_base = first_usable;
            }
            let zone_end = align_down(region.base + region.size, PAGE_SIZE);
            if zone_end <= zone_base {
                warn!(
                    "frame manager: region [{:#x}, {:#x}) leaves no usable pages",
                    region.base,
                    region.base + region.size
                );
                continue;
            }

            let first_frame = ((zone_base - span_base) / PAGE_SIZE) as u32;
            let zone_frames = ((zone_end - zone_base) / PAGE_SIZE) as u32;
            let highest_order = (zone_frames.ilog2() as usize).min(MAX_ORDER);
            let reserved = zone_frames as usize / DEFAULT_RESERVE_DIVISOR;

            // Stamp ownership before the buddy starts handing frames out.
            let index = self.zones.zone_count();
            for frame in first_frame..first_frame + zone_frames {
                let desc = self.table.get_mut(frame);
                desc.set_zone_index(index as u8);
                desc.set_flags(crate::buddy::DescFlags::empty());
            }

            self.zones.install_zone(
                region.kind,
                region.kind.default_preference(),
                first_frame,
                zone_frames,
                reserved,
                highest_order,
            )?;

            if self.zone_for_kind[region.kind as usize].is_none() {
                self.zone_for_kind[region.kind as usize] = Some(index);
            }

            info!(
                "frame manager: zone {} ({:?}) [{:#x}, {:#x}), {} pages, reserve {}",
                index, region.kind, zone_base, zone_end, zone_frames, reserved
            );
        }

        if self.zones.zone_count() == 0 {
            return Err(AllocError::InvalidParam);
        }
        Ok(())
    }

    /// Physical address of a frame by global descriptor index.
    pub fn frame_address(&self, frame: u32) -> usize {
        self.span_base + frame as usize * PAGE_SIZE
    }

    /// Global descriptor index of a managed, page-aligned address.
    pub fn frame_index_of(&self, addr: usize) -> Option<u32> {
        if addr < self.span_base || addr & (PAGE_SIZE - 1) != 0 {
            return None;
        }
        let index = (addr - self.span_base) / PAGE_SIZE;
        if index >= self.frame_count {
            return None;
        }
        Some(index as u32)
    }

    /// Frame descriptor of a managed physical address.
    pub fn frame_descriptor_of(&self, addr: usize) -> Option<&FrameDescriptor> {
        let index = self.frame_index_of(addr)?;
        Some(self.table.get(index))
    }

    /// Allocates `2^order` pages from the preferred zone of `kind`,
    /// descending through every preference class below it if needed.
    pub fn pages_allocate(
        &self,
        order: usize,
        kind: ZoneKind,
        flags: AllocFlags,
    ) -> AllocResult<usize> {
        let preferred = match self.zone_for_kind[kind as usize] {
            Some(zone) => zone,
            None => {
                if self.zones.zone_count() == 0 {
                    return Err(AllocError::NoMemory);
                }
                debug!(
                    "frame manager: no {:?} zone configured, starting at zone 0",
                    kind
                );
                0
            }
        };

        self.pages_allocate_from(order, preferred, 0, flags)
    }

    /// Allocates with explicit zone preference and base preference.
    pub fn pages_allocate_from(
        &self,
        order: usize,
        preferred: usize,
        base_pref: usize,
        flags: AllocFlags,
    ) -> AllocResult<usize> {
        let frame = self
            .zones
            .allocate_block(order, base_pref, preferred, flags)?;
        Ok(self.frame_address(frame))
    }

    /// Frees a block previously returned by [`pages_allocate`].
    ///
    /// [`pages_allocate`]: PageFrameManager::pages_allocate
    pub fn pages_free(&self, addr: usize) {
        let frame = match self.frame_index_of(addr) {
            Some(frame) => frame,
            None => {
                debug_assert!(false, "free of unmanaged address {:#x}", addr);
                error!("frame manager: free of unmanaged address {:#x}", addr);
                return;
            }
        };

        if self.table.get(frame).zone_index() == NO_ZONE {
            debug_assert!(false, "free of reserved frame at {:#x}", addr);
            error!("frame manager: free of reserved frame at {:#x}", addr);
            return;
        }

        self.zones.free_block(frame);
    }
}

impl<const PAGE_SIZE: usize> Default for PageFrameManager<PAGE_SIZE> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const PAGE_SIZE: usize> SlabPageSource for PageFrameManager<PAGE_SIZE> {
    fn allocate_slab_page(&self, flags: AllocFlags) -> AllocResult<usize> {
        self.pages_allocate(0, ZoneKind::KernelObject, flags)
    }

    fn release_slab_page(&self, addr: usize) {
        self.pages_free(addr);
    }

    fn tag_slab_page(&self, addr: usize, owner: usize) {
        match self.frame_descriptor_of(addr) {
            Some(desc) => desc.set_owner(owner),
            None => {
                error!("frame manager: tag of unmanaged address {:#x}", addr);
            }
        }
    }

    fn slab_page_owner(&self, addr: usize) -> usize {
        self.frame_descriptor_of(addr)
            .map(|desc| desc.owner())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::{alloc, dealloc, Layout};
    use std::vec::Vec;

    const PAGE_SIZE: usize = 0x1000;

    struct TestHeap {
        ptr: *mut u8,
        layout: Layout,
    }

    impl TestHeap {
        fn new(pages: usize) -> Self {
            let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
            let ptr = unsafe { alloc(layout) };
            assert!(!ptr.is_null());
            Self { ptr, layout }
        }

        fn base(&self) -> usize {
            self.ptr as usize
        }
    }

    impl Drop for TestHeap {
        fn drop(&mut self) {
            unsafe { dealloc(self.ptr, self.layout) };
        }
    }

    #[test]
    fn test_bootstrap_carves_descriptor_table() {
        let heap = TestHeap::new(17);
        let mut frames = PageFrameManager::<PAGE_SIZE>::new();

        frames
            .bootstrap(&[MemoryRegion {
                base: heap.base(),
                size: 17 * PAGE_SIZE,
                kind: ZoneKind::KernelData,
            }])
            .unwrap();

        // 17 descriptors fit one page; 16 managed pages remain.
        let (size, allocated, _) = frames.zones().zone_usage(0);
        assert_eq!(size, 16);
        assert_eq!(allocated, 0);

        // The table page itself is reserved and cannot be freed.
        let desc = frames.frame_descriptor_of(heap.base()).unwrap();
        assert_eq!(desc.zone_index(), NO_ZONE);
    }

    #[test]
    fn test_allocate_returns_managed_addresses() {
        let heap = TestHeap::new(32);
        let mut frames = PageFrameManager::<PAGE_SIZE>::new();
        frames
            .bootstrap(&[MemoryRegion {
                base: heap.base(),
                size: 32 * PAGE_SIZE,
                kind: ZoneKind::KernelObject,
            }])
            .unwrap();

        let addr = frames
            .pages_allocate(2, ZoneKind::KernelObject, AllocFlags::empty())
            .unwrap();
        assert!(addr >= heap.base() && addr < heap.base() + 32 * PAGE_SIZE);
        assert_eq!(addr & (PAGE_SIZE - 1), 0);

        let desc = frames.frame_descriptor_of(addr).unwrap();
        assert_eq!(desc.order(), 2);
        assert!(!desc.is_free());

        frames.pages_free(addr);
        let (_, allocated, _) = frames.zones().zone_usage(0);
        assert_eq!(allocated, 0);
    }

    #[test]
    fn test_two_regions_become_two_zones() {
        // One heap sliced into two adjacent regions keeps the descriptor
        // span small.
        let heap = TestHeap::new(36);
        let dma_base = heap.base() + 20 * PAGE_SIZE;
        let mut frames = PageFrameManager::<PAGE_SIZE>::new();

        frames
            .bootstrap(&[
                MemoryRegion {
                    base: heap.base(),
                    size: 20 * PAGE_SIZE,
                    kind: ZoneKind::KernelData,
                },
                MemoryRegion {
                    base: dma_base,
                    size: 16 * PAGE_SIZE,
                    kind: ZoneKind::Dma,
                },
            ])
            .unwrap();

        assert_eq!(frames.zones().zone_count(), 2);
        assert_eq!(frames.zone_for_kind(ZoneKind::KernelData), Some(0));
        assert_eq!(frames.zone_for_kind(ZoneKind::Dma), Some(1));

        let addr = frames
            .pages_allocate(0, ZoneKind::Dma, AllocFlags::empty())
            .unwrap();
        assert!(addr >= dma_base && addr < dma_base + 16 * PAGE_SIZE);
        frames.pages_free(addr);
    }

    #[test]
    fn test_overlapping_regions_rejected() {
        let heap = TestHeap::new(32);
        let mut frames = PageFrameManager::<PAGE_SIZE>::new();

        let result = frames.bootstrap(&[
            MemoryRegion {
                base: heap.base(),
                size: 32 * PAGE_SIZE,
                kind: ZoneKind::KernelData,
            },
            MemoryRegion {
                base: heap.base() + 8 * PAGE_SIZE,
                size: 8 * PAGE_SIZE,
                kind: ZoneKind::Dma,
            },
        ]);
        assert_eq!(result, Err(AllocError::MemoryOverlap));
    }

    #[test]
    fn test_slab_page_tagging() {
        let heap = TestHeap::new(32);
        let mut frames = PageFrameManager::<PAGE_SIZE>::new();
        frames
            .bootstrap(&[MemoryRegion {
                base: heap.base(),
                size: 32 * PAGE_SIZE,
                kind: ZoneKind::KernelObject,
            }])
            .unwrap();

        let page = frames.allocate_slab_page(AllocFlags::empty()).unwrap();
        frames.tag_slab_page(page, 0xfeed);
        assert_eq!(frames.slab_page_owner(page), 0xfeed);

        frames.tag_slab_page(page, 0);
        frames.release_slab_page(page);
    }

    #[test]
    fn test_allocation_spread_is_disjoint() {
        let heap = TestHeap::new(40);
        let mut frames = PageFrameManager::<PAGE_SIZE>::new();
        frames
            .bootstrap(&[MemoryRegion {
                base: heap.base(),
                size: 40 * PAGE_SIZE,
                kind: ZoneKind::KernelData,
            }])
            .unwrap();

        let mut held = Vec::new();
        while let Ok(addr) = frames.pages_allocate(0, ZoneKind::KernelData, AllocFlags::NO_FAILURE)
        {
            assert!(!held.contains(&addr));
            held.push(addr);
        }

        let (size, allocated, _) = frames.zones().zone_usage(0);
        assert_eq!(allocated, held.len());
        assert_eq!(allocated, size);

        for addr in held {
            frames.pages_free(addr);
        }
        assert_eq!(frames.zones().zone_usage(0).1, 0);
    }
}
