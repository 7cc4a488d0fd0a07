//! Allocations larger than the largest bucket, each with its own mapping.
//!
//! ```text
//! reservation (super page aligned, rounded to the allocation granule)
//! | partition page (unused) | slot ............... | guard page | granule tail |
//! ```
//!
//! The slot starts one partition page into the reservation, so it shares its
//! super page base with the reservation and is found through the same owner
//! lookup as bucketed slots. At least one reserved, never committed system
//! page follows the largest size the slot can grow to, so running off the end
//! of a direct map faults.

use super::constants::{
    GENERIC_MIN_DIRECT_MAPPED_DOWNSIZE, PAGE_ALLOCATION_GRANULARITY_BASE_MASK,
    PAGE_ALLOCATION_GRANULARITY_OFFSET_MASK, PARTITION_PAGE_SIZE, SUPER_PAGE_BASE_MASK,
    SUPER_PAGE_SIZE, SYSTEM_PAGE_SIZE, round_up_to_system_page,
};
use super::error::AllocError;
use super::pages::{PageAccess, PageOps};
use super::partition::{Owner, PartitionCore, page_ptr};
use super::stats;

#[derive(Debug)]
pub(crate) struct DirectMapExtent {
    /// Start of the reservation.
    pub(crate) base: usize,
    /// Bytes reserved, released in one piece on unmap.
    pub(crate) reserved: usize,
    /// Largest slot size the reservation can grow to in place.
    pub(crate) map_size: usize,
    /// Committed slot bytes.
    pub(crate) slot_size: usize,
    /// Requested size, cookies included.
    pub(crate) raw_size: usize,
    prev: Option<u32>,
    next: Option<u32>,
}

impl DirectMapExtent {
    #[inline]
    pub(crate) fn slot(&self) -> usize {
        self.base + PARTITION_PAGE_SIZE
    }
}

/// Slab of live direct maps threaded into a doubly-linked list, newest first.
#[derive(Default)]
pub(crate) struct DirectMaps {
    slab: Vec<Option<DirectMapExtent>>,
    vacant: Vec<u32>,
    head: Option<u32>,
}

impl DirectMaps {
    fn insert(&mut self, mut extent: DirectMapExtent) -> u32 {
        extent.prev = None;
        extent.next = self.head;
        let index = match self.vacant.pop() {
            Some(index) => {
                self.slab[index as usize] = Some(extent);
                index
            }
            None => {
                #[allow(clippy::cast_possible_truncation)]
                let index = self.slab.len() as u32;
                self.slab.push(Some(extent));
                index
            }
        };
        if let Some(old_head) = self.head {
            if let Some(old) = self.slab[old_head as usize].as_mut() {
                old.prev = Some(index);
            }
        }
        self.head = Some(index);
        index
    }

    fn remove(&mut self, index: u32) -> Option<DirectMapExtent> {
        let extent = self.slab.get_mut(index as usize)?.take()?;
        match extent.prev {
            Some(prev) => {
                if let Some(p) = self.slab[prev as usize].as_mut() {
                    p.next = extent.next;
                }
            }
            None => self.head = extent.next,
        }
        if let Some(next) = extent.next {
            if let Some(n) = self.slab[next as usize].as_mut() {
                n.prev = extent.prev;
            }
        }
        self.vacant.push(index);
        Some(extent)
    }

    #[inline]
    pub(crate) fn get(&self, index: u32) -> Option<&DirectMapExtent> {
        self.slab.get(index as usize)?.as_ref()
    }

    #[inline]
    fn get_mut(&mut self, index: u32) -> Option<&mut DirectMapExtent> {
        self.slab.get_mut(index as usize)?.as_mut()
    }

    /// Live direct maps, newest first.
    pub(crate) fn iter(&self) -> impl Iterator<Item = &DirectMapExtent> {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let extent = self.get(cursor?)?;
            cursor = extent.next;
            Some(extent)
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.slab.len() - self.vacant.len()
    }
}

/// Committed size of a direct map serving `raw_size` bytes.
#[inline]
pub(crate) const fn direct_map_size(raw_size: usize) -> usize {
    round_up_to_system_page(raw_size)
}

/// Bytes reserved for a direct map of `size` committed bytes: the leading
/// partition page, the slot and a trailing guard page.
#[inline]
const fn direct_map_reservation(size: usize) -> usize {
    (size + PARTITION_PAGE_SIZE + SYSTEM_PAGE_SIZE + PAGE_ALLOCATION_GRANULARITY_OFFSET_MASK)
        & PAGE_ALLOCATION_GRANULARITY_BASE_MASK
}

impl<P: PageOps> PartitionCore<P> {
    /// Map a dedicated region for one allocation. Returns the slot address.
    pub(crate) fn direct_map(&mut self, raw_size: usize) -> Result<usize, AllocError> {
        let size = direct_map_size(raw_size);
        let reserved = direct_map_reservation(size);

        let hint = P::next_random_base() & SUPER_PAGE_BASE_MASK;
        // Safety: reserved is a granularity multiple; the alignment is a
        // power of two no smaller than the granularity.
        let ptr = unsafe { P::reserve(hint, reserved, SUPER_PAGE_SIZE) }
            .map_err(AllocError::out_of_memory(raw_size))?;
        let base = ptr.as_ptr() as usize;
        stats::TOTAL_RESERVED.add(reserved);

        let slot = base + PARTITION_PAGE_SIZE;
        self.counters.direct_mapped += size;
        if let Err(source) = self.commit_pages(slot, size) {
            self.counters.direct_mapped -= size;
            // Safety: nothing refers to the fresh reservation yet.
            if let Err(err) = unsafe { P::release(ptr, reserved) } {
                tracing::warn!(base = format_args!("{base:#x}"), %err, "direct map release failed");
            }
            stats::TOTAL_RESERVED.sub(reserved);
            return Err(AllocError::OutOfMemory {
                size: raw_size,
                source,
            });
        }

        let index = self.direct_maps.insert(DirectMapExtent {
            base,
            reserved,
            map_size: reserved - PARTITION_PAGE_SIZE - SYSTEM_PAGE_SIZE,
            slot_size: size,
            raw_size,
            prev: None,
            next: None,
        });
        self.owners.insert(base, Owner::DirectMap(index));

        tracing::debug!(
            base = format_args!("{base:#x}"),
            size,
            reserved,
            "direct mapped allocation"
        );
        Ok(slot)
    }

    /// Unlink and release a direct map.
    pub(crate) fn direct_unmap(&mut self, index: u32) {
        let Some(extent) = self.direct_maps.remove(index) else {
            return;
        };
        self.owners.remove(&extent.base);
        self.counters.decrease_committed(extent.slot_size);
        self.counters.direct_mapped -= extent.slot_size;

        // Safety: the extent was just unlinked; its only slot has been freed.
        if let Err(err) = unsafe { P::release(page_ptr(extent.base), extent.reserved) } {
            tracing::warn!(base = format_args!("{:#x}", extent.base), %err, "direct map release failed");
        }
        stats::TOTAL_RESERVED.sub(extent.reserved);
        tracing::debug!(
            base = format_args!("{:#x}", extent.base),
            size = extent.slot_size,
            "unmapped direct allocation"
        );
    }

    /// Resize a direct map without moving it.
    ///
    /// Shrinking decommits the tail, unless that would leave less than 80% of
    /// the reservation in use. Growing recommits up to the reservation size.
    /// Returns `Ok(false)` when the resize has to move instead.
    pub(crate) fn realloc_direct_mapped_in_place(
        &mut self,
        index: u32,
        raw_size: usize,
    ) -> Result<bool, AllocError> {
        // The new size may be a bucketed one; those always move.
        let new_size = direct_map_size(raw_size);
        if new_size < GENERIC_MIN_DIRECT_MAPPED_DOWNSIZE {
            return Ok(false);
        }
        let Some(extent) = self.direct_maps.get(index) else {
            return Ok(false);
        };
        let current = extent.slot_size;
        let map_size = extent.map_size;
        let slot = extent.slot();

        if new_size < current {
            if (new_size / SYSTEM_PAGE_SIZE) * 5 < (map_size / SYSTEM_PAGE_SIZE) * 4 {
                return Ok(false);
            }
            let shrink = current - new_size;
            self.decommit_pages(slot + new_size, shrink);
            // Safety: the tail lies inside the reservation and holds no data.
            if let Err(err) =
                unsafe { P::protect(page_ptr(slot + new_size), shrink, PageAccess::Inaccessible) }
            {
                tracing::warn!(%err, "direct map tail protect failed");
            }
            self.counters.direct_mapped -= shrink;
        } else if new_size > current {
            if new_size > map_size {
                return Ok(false);
            }
            let grow = new_size - current;
            // Safety: the range lies inside the reservation.
            unsafe { P::protect(page_ptr(slot + current), grow, PageAccess::ReadWrite) }
                .map_err(AllocError::out_of_memory(raw_size))?;
            self.counters.direct_mapped += grow;
            if let Err(source) = self.recommit_pages(slot + current, grow) {
                self.counters.direct_mapped -= grow;
                return Err(AllocError::OutOfMemory {
                    size: raw_size,
                    source,
                });
            }
        }

        if let Some(extent) = self.direct_maps.get_mut(index) {
            extent.slot_size = new_size;
            extent.raw_size = raw_size;
        }
        Ok(true)
    }

    /// Release every direct map.
    pub(crate) fn release_direct_maps(&mut self) {
        let live: Vec<u32> = (0..self.direct_maps.slab.len())
            .filter_map(|i| u32::try_from(i).ok())
            .filter(|&i| self.direct_maps.get(i).is_some())
            .collect();
        for index in live {
            self.direct_unmap(index);
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    fn extent(base: usize) -> DirectMapExtent {
        DirectMapExtent {
            base,
            reserved: SUPER_PAGE_SIZE,
            map_size: SUPER_PAGE_SIZE - PARTITION_PAGE_SIZE - SYSTEM_PAGE_SIZE,
            slot_size: SYSTEM_PAGE_SIZE,
            raw_size: SYSTEM_PAGE_SIZE,
            prev: None,
            next: None,
        }
    }

    #[test]
    fn test_list_links_newest_first() {
        let mut maps = DirectMaps::default();
        let a = maps.insert(extent(SUPER_PAGE_SIZE));
        let b = maps.insert(extent(2 * SUPER_PAGE_SIZE));
        let c = maps.insert(extent(3 * SUPER_PAGE_SIZE));
        let bases: Vec<usize> = maps.iter().map(|e| e.base).collect();
        assert_eq!(bases, vec![3 * SUPER_PAGE_SIZE, 2 * SUPER_PAGE_SIZE, SUPER_PAGE_SIZE]);

        // Unlink from the middle, then the head.
        assert!(maps.remove(b).is_some());
        assert!(maps.remove(c).is_some());
        assert!(maps.remove(c).is_none());
        let bases: Vec<usize> = maps.iter().map(|e| e.base).collect();
        assert_eq!(bases, vec![SUPER_PAGE_SIZE]);
        assert_eq!(maps.len(), 1);

        // Vacant slab entries are reused.
        let d = maps.insert(extent(4 * SUPER_PAGE_SIZE));
        assert!(d == b || d == c);
        assert_eq!(maps.get(a).map(|e| e.prev), Some(Some(d)));
    }

    #[test]
    fn test_direct_map_size_rounds_to_pages() {
        assert_eq!(direct_map_size(1), SYSTEM_PAGE_SIZE);
        assert_eq!(direct_map_size(GENERIC_MIN_DIRECT_MAPPED_DOWNSIZE), round_up_to_system_page(983_041));
        assert_eq!(extent(0).slot(), PARTITION_PAGE_SIZE);
    }

    #[test]
    fn test_guard_page_follows_largest_slot() {
        use crate::memory::bucket::SizeClasses;
        use crate::memory::config::HeapConfig;
        use crate::memory::constants::{GENERIC_MAX_BUCKETED, PAGE_ALLOCATION_GRANULARITY};
        use crate::memory::pages::PlatformPageOps;

        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let config = HeapConfig {
            cookies: false,
            poison: false,
            ..HeapConfig::default()
        };
        let mut core =
            PartitionCore::<PlatformPageOps>::new(SizeClasses::generic(), config).unwrap();

        // A page-multiple size leaves no rounding slack after the slot.
        let size = GENERIC_MAX_BUCKETED + 16 * SYSTEM_PAGE_SIZE;
        let ptr = core.alloc(size).unwrap();
        let extent = core.direct_maps.iter().next().unwrap();
        assert_eq!(extent.slot(), ptr.as_ptr() as usize);
        assert_eq!(extent.slot_size, size);
        assert!(extent.reserved >= PARTITION_PAGE_SIZE + size + SYSTEM_PAGE_SIZE);
        assert_eq!(extent.reserved % PAGE_ALLOCATION_GRANULARITY, 0);
        // Growing in place stops one system page short of the reservation.
        assert!(extent.slot() + extent.map_size + SYSTEM_PAGE_SIZE <= extent.base + extent.reserved);
        assert_eq!(core.counters.direct_mapped, size);

        // Safety: Test code.
        unsafe { core.free(ptr) };
        assert_eq!(core.direct_maps.len(), 0);
    }
}
