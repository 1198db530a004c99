//! Zone statistics and failure reporting.
//!
//! Snapshots are computed on demand under the zone lock instead of being
//! maintained as running counters, so the allocation paths stay free of
//! bookkeeping when nobody is looking.

#[cfg(feature = "log")]
use log::error;

use crate::zone::ZoneAllocator;
use crate::MAX_ORDER;

/// Point-in-time view of one zone's counters and free lists.
#[derive(Debug, Clone, Copy)]
pub struct ZoneSnapshot {
    pub total_pages: usize,
    pub allocated_pages: usize,
    pub reserved_pages: usize,
    pub free_pages: usize,
    pub free_blocks_by_order: [usize; MAX_ORDER + 1],
}

impl ZoneAllocator {
    /// Snapshot of one zone, taken under its lock.
    pub fn zone_snapshot(&self, index: usize) -> ZoneSnapshot {
        let (total_pages, allocated_pages, reserved_pages) = self.zone_usage(index);
        let free_blocks_by_order = self.free_list_lengths(index);

        let mut free_pages = 0;
        for (order, &count) in free_blocks_by_order.iter().enumerate() {
            free_pages += count << order;
        }

        ZoneSnapshot {
            total_pages,
            allocated_pages,
            reserved_pages,
            free_pages,
            free_blocks_by_order,
        }
    }

    /// Logs the state of every zone after a failed allocation.
    #[allow(unused_variables)]
    pub fn report_allocation_failure(&self, order: usize, flags: crate::AllocFlags) {
        error!("========================================");
        error!(
            "allocation failure: order {} ({} pages), flags {:?}",
            order,
            1usize << order,
            flags
        );
        for index in 0..self.zone_count() {
            let snapshot = self.zone_snapshot(index);
            error!(
                "zone {}: {} / {} pages allocated, {} reserved",
                index, snapshot.allocated_pages, snapshot.total_pages, snapshot.reserved_pages
            );
            for (ord, &count) in snapshot.free_blocks_by_order.iter().enumerate() {
                if count > 0 {
                    error!("  order {}: {} free blocks", ord, count);
                }
            }
        }
        error!("========================================");
    }
}
