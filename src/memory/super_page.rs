//! Super page reservations and the arenas of span metadata inside them.
//!
//! Each super page is an arena. Slot spans are carved front to back from the
//! partition pages between the two guard pages, and a span's metadata lives
//! in its arena at a fixed index, found from any address inside the span by
//! the partition page it falls in.

use super::bucket::BucketIndex;
use super::constants::{
    NUM_PARTITION_PAGES_PER_SUPER_PAGE, PARTITION_PAGE_SHIFT, PARTITION_PAGE_SIZE,
    SUPER_PAGE_BASE_MASK, SUPER_PAGE_OFFSET_MASK, SUPER_PAGE_SIZE,
};
use super::error::AllocError;
use super::pages::PageOps;
use super::partition::{Owner, PartitionCore};
use super::slot_span::{SlotSpan, SpanRef};
use super::stats;

/// A contiguous run of super pages reserved one after another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuperPageExtent {
    pub base: usize,
    pub num_super_pages: usize,
}

impl SuperPageExtent {
    pub fn end(&self) -> usize {
        self.base + self.num_super_pages * SUPER_PAGE_SIZE
    }
}

pub(crate) struct Arena {
    pub(crate) base: usize,
    pub(crate) spans: Vec<SlotSpan>,
    /// Span index + 1 for every partition page a span covers, 0 for guard
    /// and not yet carved pages.
    page_owner: [u16; NUM_PARTITION_PAGES_PER_SUPER_PAGE],
}

impl Arena {
    fn new(base: usize) -> Self {
        Self {
            base,
            spans: Vec::new(),
            page_owner: [0; NUM_PARTITION_PAGES_PER_SUPER_PAGE],
        }
    }

    fn push_span(&mut self, span: SlotSpan, num_partition_pages: usize) -> u16 {
        let first_page = (span.base - self.base) >> PARTITION_PAGE_SHIFT;
        self.spans.push(span);
        #[allow(clippy::cast_possible_truncation)]
        let owner = self.spans.len() as u16;
        for page in &mut self.page_owner[first_page..first_page + num_partition_pages] {
            *page = owner;
        }
        owner - 1
    }

    /// Index of the span covering `addr`, if any.
    #[inline]
    fn span_index_at(&self, addr: usize) -> Option<u16> {
        let page = (addr & SUPER_PAGE_OFFSET_MASK) >> PARTITION_PAGE_SHIFT;
        match self.page_owner[page] {
            0 => None,
            owner => Some(owner - 1),
        }
    }
}

/// Every super page of a heap plus the carving cursor.
#[derive(Default)]
pub(crate) struct SuperPages {
    pub(crate) arenas: Vec<Arena>,
    pub(crate) extents: Vec<SuperPageExtent>,
    /// Preferred address of the next reservation, right after the last one.
    /// 0 asks for a fresh random base.
    next_super_page: usize,
    next_partition_page: usize,
    next_partition_page_end: usize,
}

impl SuperPages {
    #[inline]
    pub(crate) fn span(&self, r: SpanRef) -> &SlotSpan {
        &self.arenas[r.arena as usize].spans[usize::from(r.index)]
    }

    #[inline]
    pub(crate) fn span_mut(&mut self, r: SpanRef) -> &mut SlotSpan {
        &mut self.arenas[r.arena as usize].spans[usize::from(r.index)]
    }

    #[inline]
    pub(crate) fn span_at(&self, arena: u32, addr: usize) -> Option<SpanRef> {
        let index = self.arenas.get(arena as usize)?.span_index_at(addr)?;
        Some(SpanRef { arena, index })
    }

    pub(crate) fn spans(&self) -> impl Iterator<Item = (SpanRef, &SlotSpan)> {
        self.arenas.iter().enumerate().flat_map(|(a, arena)| {
            arena.spans.iter().enumerate().map(move |(i, span)| {
                #[allow(clippy::cast_possible_truncation)]
                let r = SpanRef {
                    arena: a as u32,
                    index: i as u16,
                };
                (r, span)
            })
        })
    }

    fn partition_pages_left(&self) -> usize {
        (self.next_partition_page_end - self.next_partition_page) >> PARTITION_PAGE_SHIFT
    }
}

impl<P: PageOps> PartitionCore<P> {
    /// Carve a new span for `index` from the current super page, reserving a
    /// new one if the current one lacks room. The span's pages are committed.
    pub(crate) fn alloc_new_span(&mut self, index: BucketIndex) -> Result<SpanRef, AllocError> {
        let bucket = self.classes.get(index);
        let num_partition_pages = bucket.partition_pages_per_span();
        let bytes = bucket.bytes_per_span();
        let slots = bucket.slots_per_span();
        debug_assert!(num_partition_pages <= NUM_PARTITION_PAGES_PER_SUPER_PAGE - 2);

        if self.super_pages.partition_pages_left() < num_partition_pages {
            self.map_new_super_page()?;
        }

        let base = self.super_pages.next_partition_page;
        debug_assert!(base.is_multiple_of(PARTITION_PAGE_SIZE));
        self.commit_pages(base, bytes)
            .map_err(AllocError::out_of_memory(bytes))?;
        self.super_pages.next_partition_page += num_partition_pages * PARTITION_PAGE_SIZE;

        let arena_index = self.super_pages.arenas.len() - 1;
        let arena = &mut self.super_pages.arenas[arena_index];
        debug_assert_eq!(arena.base, base & SUPER_PAGE_BASE_MASK);
        let span_index = arena.push_span(SlotSpan::new(base, index, slots), num_partition_pages);

        tracing::trace!(
            base = format_args!("{base:#x}"),
            slot_size = self.classes.get(index).slot_size,
            slots,
            "carved slot span"
        );
        #[allow(clippy::cast_possible_truncation)]
        Ok(SpanRef {
            arena: arena_index as u32,
            index: span_index,
        })
    }

    /// Reserve a super page, preferably right after the previous one so the
    /// heap's address range stays contiguous.
    fn map_new_super_page(&mut self) -> Result<(), AllocError> {
        let requested = self.super_pages.next_super_page;
        let hint = if requested != 0 {
            requested
        } else {
            P::next_random_base() & SUPER_PAGE_BASE_MASK
        };

        // Safety: super page size and alignment are granularity multiples.
        let ptr = unsafe { P::reserve(hint, SUPER_PAGE_SIZE, SUPER_PAGE_SIZE) }
            .map_err(AllocError::out_of_memory(SUPER_PAGE_SIZE))?;
        let super_page = ptr.as_ptr() as usize;
        debug_assert!(super_page.is_multiple_of(SUPER_PAGE_SIZE));

        self.counters.super_pages += SUPER_PAGE_SIZE;
        stats::TOTAL_RESERVED.add(SUPER_PAGE_SIZE);

        let sp = &mut self.super_pages;
        sp.next_super_page = super_page + SUPER_PAGE_SIZE;
        sp.next_partition_page = super_page + PARTITION_PAGE_SIZE;
        sp.next_partition_page_end = sp.next_super_page - PARTITION_PAGE_SIZE;
        // The OS ignored the hint; most pick the address right below the last
        // mapping, which is not random. Start over from a random base.
        if requested != 0 && requested != super_page {
            sp.next_super_page = 0;
        }

        match sp.extents.last_mut() {
            Some(extent) if super_page == requested => extent.num_super_pages += 1,
            _ => sp.extents.push(SuperPageExtent {
                base: super_page,
                num_super_pages: 1,
            }),
        }

        #[allow(clippy::cast_possible_truncation)]
        let arena = sp.arenas.len() as u32;
        sp.arenas.push(Arena::new(super_page));
        self.owners.insert(super_page, Owner::SuperPage(arena));

        tracing::debug!(
            base = format_args!("{super_page:#x}"),
            extents = sp.extents.len(),
            "reserved super page"
        );
        Ok(())
    }

    /// Give every super page back to the OS.
    pub(crate) fn release_super_pages(&mut self) {
        for arena in self.super_pages.arenas.drain(..) {
            self.owners.remove(&arena.base);
            let ptr = super::partition::page_ptr(arena.base);
            // Safety: the arena base is a whole super page reservation that no
            // live allocation refers to any more.
            if let Err(err) = unsafe { P::release(ptr, SUPER_PAGE_SIZE) } {
                tracing::warn!(base = format_args!("{:#x}", arena.base), %err, "super page release failed");
            }
            stats::TOTAL_RESERVED.sub(SUPER_PAGE_SIZE);
        }
        self.super_pages.extents.clear();
        self.super_pages.next_super_page = 0;
        self.super_pages.next_partition_page = 0;
        self.super_pages.next_partition_page_end = 0;
        self.counters.super_pages = 0;
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::memory::constants::SYSTEM_PAGE_SIZE;

    #[test]
    fn test_arena_maps_pages_to_spans() {
        let base = 64 * SUPER_PAGE_SIZE;
        let mut arena = Arena::new(base);
        let first = base + PARTITION_PAGE_SIZE;
        let second = first + 2 * PARTITION_PAGE_SIZE;
        assert_eq!(arena.push_span(SlotSpan::new(first, 0, 8), 2), 0);
        assert_eq!(arena.push_span(SlotSpan::new(second, 1, 8), 1), 1);

        assert_eq!(arena.span_index_at(base), None, "leading guard page");
        assert_eq!(arena.span_index_at(first), Some(0));
        assert_eq!(arena.span_index_at(first + PARTITION_PAGE_SIZE + SYSTEM_PAGE_SIZE), Some(0));
        assert_eq!(arena.span_index_at(second + 8), Some(1));
        assert_eq!(arena.span_index_at(second + PARTITION_PAGE_SIZE), None, "not carved yet");
        assert_eq!(arena.span_index_at(base + SUPER_PAGE_SIZE - 1), None, "trailing guard page");
    }

    #[test]
    fn test_extent_end() {
        let extent = SuperPageExtent {
            base: SUPER_PAGE_SIZE,
            num_super_pages: 3,
        };
        assert_eq!(extent.end(), 4 * SUPER_PAGE_SIZE);
    }
}
