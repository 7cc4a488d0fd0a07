//! Returning physical memory to the OS without giving up address space.

use std::ops::BitOr;

use super::bucket::BucketIndex;
use super::constants::{
    MAX_FREEABLE_SPANS, MAX_SYSTEM_PAGES_PER_SLOT_SPAN, SYSTEM_PAGE_SIZE,
    round_down_to_system_page, round_up_to_system_page,
};
use super::freelist;
use super::pages::PageOps;
use super::partition::PartitionCore;
use super::slot_span::SpanRef;

/// What [`purge_memory`](crate::GenericHeap::purge_memory) should reclaim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PurgeFlags(u8);

impl PurgeFlags {
    /// Decommit every span still queued in the empty-span ring.
    pub const DECOMMIT_EMPTY_SPANS: Self = Self(1);
    /// Discard whole system pages inside free slots of spans with slots of
    /// at least one system page.
    pub const DISCARD_UNUSED_SYSTEM_PAGES: Self = Self(2);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn all() -> Self {
        Self(Self::DECOMMIT_EMPTY_SPANS.0 | Self::DISCARD_UNUSED_SYSTEM_PAGES.0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for PurgeFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Whether a freelist terminator reads back unchanged from a discarded page
/// that refills with zeroes.
const ZERO_LINK_STORED_AS_ZERO: bool = freelist::FreelistCodec::encode(0) == 0;

impl<P: PageOps> PartitionCore<P> {
    pub(crate) fn purge_memory(&mut self, flags: PurgeFlags) {
        let committed_before = self.counters.committed;
        if flags.contains(PurgeFlags::DECOMMIT_EMPTY_SPANS) {
            self.decommit_empty_spans();
        }
        let mut discarded = 0;
        if flags.contains(PurgeFlags::DISCARD_UNUSED_SYSTEM_PAGES) {
            for index in 0..self.classes.buckets.len() {
                #[allow(clippy::cast_possible_truncation)]
                let index = index as BucketIndex;
                let bucket = self.classes.get(index);
                if bucket.enabled && bucket.slot_size >= SYSTEM_PAGE_SIZE {
                    discarded += self.purge_bucket(index);
                }
            }
        }
        tracing::debug!(
            decommitted = committed_before - self.counters.committed,
            discarded,
            "purged heap"
        );
    }

    /// Decommit every ring occupant that is still empty and clear the ring.
    pub(crate) fn decommit_empty_spans(&mut self) {
        for i in 0..MAX_FREEABLE_SPANS {
            if let Some(r) = self.ring.entries[i] {
                self.decommit_span_if_possible(r);
            }
            self.ring.entries[i] = None;
        }
    }

    fn purge_bucket(&mut self, index: BucketIndex) -> usize {
        let mut discarded = 0;
        let mut cursor = self.classes.get(index).active_head;
        while let Some(r) = cursor {
            cursor = self.super_pages.span(r).next;
            discarded += self.purge_span(r, true);
        }
        discarded
    }

    /// Bytes of whole system pages in `r` that hold no live data, discarding
    /// them too when `discard` is set.
    ///
    /// Trailing free slots are turned back into unprovisioned ones and the
    /// freelist is rebuilt without them. Within the remaining free slots the
    /// first word holds the freelist link and is kept, unless discarded pages
    /// are known to read back as zero and the stored link already is zero.
    pub(crate) fn purge_span(&mut self, r: SpanRef, discard: bool) -> usize {
        let span = self.super_pages.span(r);
        let bucket = self.classes.get(span.bucket);
        let slot_size = bucket.slot_size;
        if slot_size < SYSTEM_PAGE_SIZE || span.num_allocated_slots == 0 {
            return 0;
        }
        let base = span.base;

        if span.raw_size != 0 {
            let used = round_up_to_system_page(span.raw_size);
            let discardable = slot_size.saturating_sub(used);
            if discardable > 0 && discard {
                self.discard_pages(base + used, discardable);
            }
            return discardable;
        }

        let bucket_slots = bucket.slots_per_span();
        debug_assert!(bucket_slots <= MAX_SYSTEM_PAGES_PER_SLOT_SPAN);
        debug_assert!((span.num_unprovisioned_slots as usize) < bucket_slots);
        let mut num_slots = bucket_slots - span.num_unprovisioned_slots as usize;
        let zero_fills = self.config.discard_zero_fills && ZERO_LINK_STORED_AS_ZERO;

        // Slot usage, built by walking the freelist.
        let mut in_use = [true; MAX_SYSTEM_PAGES_PER_SLOT_SPAN];
        let mut last_slot = None;
        let mut entry = span.freelist_head;
        while entry != 0 {
            let slot_index = (entry - base) / slot_size;
            debug_assert!(slot_index < num_slots);
            in_use[slot_index] = false;
            // Safety: freelist entries are free slots of this committed span.
            let stored = unsafe { freelist::read_raw(entry) };
            // A stored link of zero reads back the same from a discarded
            // page, so that slot's header may be discarded too.
            if zero_fills && stored == 0 {
                last_slot = Some(slot_index);
            }
            entry = freelist::FreelistCodec::decode(stored);
        }

        // Free slots at the end are truncated back to unprovisioned.
        let mut truncated = 0;
        while !in_use[num_slots - 1] {
            truncated += 1;
            num_slots -= 1;
            debug_assert!(num_slots > 0);
        }

        let mut discardable = 0;
        if truncated > 0 {
            let begin = round_up_to_system_page(base + num_slots * slot_size);
            // The span owns up to the page boundary past its last slot.
            let end = round_up_to_system_page(base + (num_slots + truncated) * slot_size);
            let unprovisioned_bytes = end.saturating_sub(begin);
            discardable += unprovisioned_bytes;

            if unprovisioned_bytes > 0 && discard {
                let span = self.super_pages.span_mut(r);
                span.num_unprovisioned_slots += u32::try_from(truncated).unwrap_or(0);
                // Rebuild the freelist in slot order.
                let mut head = 0;
                let mut tail = 0;
                for slot_index in (0..num_slots).filter(|&i| !in_use[i]) {
                    let slot = base + slot_index * slot_size;
                    if tail == 0 {
                        head = slot;
                    } else {
                        // Safety: tail is a free slot of this span.
                        unsafe { freelist::write_next(tail, slot) };
                    }
                    tail = slot;
                    if zero_fills {
                        last_slot = Some(slot_index);
                    }
                }
                if tail != 0 {
                    // Safety: as above.
                    unsafe { freelist::write_next(tail, 0) };
                }
                span.freelist_head = head;
                self.discard_pages(begin, unprovisioned_bytes);
            }
        }

        // Whole pages strictly inside each remaining free slot.
        for slot_index in (0..num_slots).filter(|&i| !in_use[i]) {
            let mut begin = base + slot_index * slot_size;
            let end = round_down_to_system_page(begin + slot_size);
            if last_slot != Some(slot_index) {
                begin += std::mem::size_of::<usize>();
            }
            let begin = round_up_to_system_page(begin);
            if begin < end {
                discardable += end - begin;
                if discard {
                    self.discard_pages(begin, end - begin);
                }
            }
        }
        discardable
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_flags_combine() {
        let both = PurgeFlags::DECOMMIT_EMPTY_SPANS | PurgeFlags::DISCARD_UNUSED_SYSTEM_PAGES;
        assert_eq!(both, PurgeFlags::all());
        assert!(both.contains(PurgeFlags::DECOMMIT_EMPTY_SPANS));
        assert!(!PurgeFlags::DECOMMIT_EMPTY_SPANS.contains(PurgeFlags::DISCARD_UNUSED_SYSTEM_PAGES));
        assert!(PurgeFlags::empty().contains(PurgeFlags::empty()));
    }

    #[test]
    fn test_terminator_survives_zero_fill_only_when_stored_as_zero() {
        // Big-endian links are stored inverted, so a zeroed page would turn
        // the terminator into a wild pointer.
        assert_eq!(ZERO_LINK_STORED_AS_ZERO, cfg!(target_endian = "little"));
    }
}
