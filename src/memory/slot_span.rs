//! Slot spans: the unit a bucket carves, fills, empties and decommits.
//!
//! A span's state is never stored. It is derived from three fields:
//!
//! | state       | allocated          | freelist | unprovisioned |
//! |-------------|--------------------|----------|---------------|
//! | active      | > 0                | any      | any, but not both empty |
//! | full        | == slots (or < 0)  | empty    | 0             |
//! | empty       | 0                  | non-empty| any           |
//! | decommitted | 0                  | empty    | 0             |
//!
//! A full span that has been unlinked from the active list carries a negated
//! allocation count so a free can tell it must be relinked.

use super::bucket::BucketIndex;
use super::constants::{MAX_FREEABLE_SPANS, round_up_to_system_page};
use super::error::AllocError;
use super::freelist;
use super::pages::PageOps;
use super::partition::PartitionCore;

/// Address of a span's metadata: the super page arena and the span's index
/// inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SpanRef {
    pub(crate) arena: u32,
    pub(crate) index: u16,
}

/// Lifecycle state of a slot span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanState {
    Active,
    Full,
    Empty,
    Decommitted,
}

#[derive(Debug)]
pub(crate) struct SlotSpan {
    /// Address of slot 0.
    pub(crate) base: usize,
    pub(crate) bucket: BucketIndex,
    /// Decoded address of the first free slot, 0 if none.
    pub(crate) freelist_head: usize,
    pub(crate) num_allocated_slots: i32,
    pub(crate) num_unprovisioned_slots: u32,
    /// Exact requested size of the single slot, for spans whose bucket
    /// tracks it. 0 otherwise.
    pub(crate) raw_size: usize,
    /// Position in the empty-span ring, if registered there.
    pub(crate) empty_cache_index: Option<u8>,
    pub(crate) next: Option<SpanRef>,
}

impl SlotSpan {
    /// A freshly carved span: nothing allocated, every slot unprovisioned.
    pub(crate) fn new(base: usize, bucket: BucketIndex, slots_per_span: usize) -> Self {
        Self {
            base,
            bucket,
            freelist_head: 0,
            num_allocated_slots: 0,
            num_unprovisioned_slots: to_u32(slots_per_span),
            raw_size: 0,
            empty_cache_index: None,
            next: None,
        }
    }

    #[inline]
    pub(crate) fn is_active(&self) -> bool {
        self.num_allocated_slots > 0
            && (self.freelist_head != 0 || self.num_unprovisioned_slots > 0)
    }

    #[inline]
    pub(crate) fn is_full(&self, slots_per_span: usize) -> bool {
        let full = self.num_allocated_slots < 0
            || usize::try_from(self.num_allocated_slots).is_ok_and(|n| n == slots_per_span);
        if full {
            debug_assert_eq!(self.freelist_head, 0);
            debug_assert_eq!(self.num_unprovisioned_slots, 0);
        }
        full
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.num_allocated_slots == 0 && self.freelist_head != 0
    }

    #[inline]
    pub(crate) fn is_decommitted(&self) -> bool {
        let decommitted = self.num_allocated_slots == 0 && self.freelist_head == 0;
        if decommitted {
            debug_assert_eq!(self.num_unprovisioned_slots, 0);
        }
        decommitted
    }

    pub(crate) fn state(&self, slots_per_span: usize) -> SpanState {
        let state = if self.is_full(slots_per_span) {
            SpanState::Full
        } else if self.is_active() {
            SpanState::Active
        } else if self.is_empty() {
            SpanState::Empty
        } else {
            SpanState::Decommitted
        };
        debug_assert_eq!(
            usize::from(self.is_full(slots_per_span))
                + usize::from(self.is_active())
                + usize::from(self.is_empty())
                + usize::from(self.is_decommitted()),
            1,
            "span at {:#x} is in more than one state",
            self.base
        );
        state
    }

    /// Back to the freshly carved layout after a recommit.
    fn reset(&mut self, slots_per_span: usize) {
        debug_assert!(self.is_decommitted());
        self.num_unprovisioned_slots = to_u32(slots_per_span);
        self.next = None;
    }

    /// Pop the freelist head, if any.
    #[inline]
    pub(crate) fn pop_free(&mut self) -> Option<usize> {
        let slot = self.freelist_head;
        if slot == 0 {
            return None;
        }
        // Safety: the head of a committed span's freelist is a free slot
        // inside the span.
        self.freelist_head = unsafe { freelist::read_next(slot) };
        self.num_allocated_slots += 1;
        Some(slot)
    }

    /// Hand out the first unprovisioned slot and thread freelist entries
    /// through the remaining ones, stopping at the system page holding the
    /// end of the returned slot so no further page is faulted in.
    fn alloc_and_fill_freelist(&mut self, slot_size: usize, slots_per_span: usize) -> usize {
        let num_slots = self.num_unprovisioned_slots as usize;
        debug_assert!(num_slots > 0);
        debug_assert_eq!(self.freelist_head, 0);
        debug_assert!(self.num_allocated_slots >= 0);
        debug_assert_eq!(num_slots + self.num_allocated_slots as usize, slots_per_span);

        let allocated = self.num_allocated_slots as usize;
        let slot = self.base + slot_size * allocated;
        let first_entry = slot + slot_size;
        let first_entry_end = first_entry + std::mem::size_of::<usize>();
        let limit = round_up_to_system_page(first_entry).min(slot + slot_size * num_slots);

        let mut new_entries = 0;
        if first_entry_end <= limit {
            // Only slots that start inside the limit count; the tail of the
            // span past the last whole slot is never provisioned.
            new_entries = 1 + (limit - first_entry_end) / slot_size;
        }
        debug_assert!(new_entries < num_slots);
        self.num_unprovisioned_slots = to_u32(num_slots - new_entries - 1);
        self.num_allocated_slots += 1;

        if new_entries == 0 {
            self.freelist_head = 0;
            return slot;
        }
        self.freelist_head = first_entry;
        let mut entry = first_entry;
        for _ in 1..new_entries {
            let next = entry + slot_size;
            // Safety: every entry lies inside the committed span.
            unsafe { freelist::write_next(entry, next) };
            entry = next;
        }
        // Safety: as above.
        unsafe { freelist::write_next(entry, 0) };
        slot
    }
}

#[inline]
fn to_u32(value: usize) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

/// Fixed-capacity ring of spans that recently became empty.
///
/// Inserting into an occupied position decommits the occupant if it is
/// still empty by then.
#[derive(Debug, Default)]
pub(crate) struct EmptySpanRing {
    pub(crate) entries: [Option<SpanRef>; MAX_FREEABLE_SPANS],
    pub(crate) index: usize,
}

impl<P: PageOps> PartitionCore<P> {
    /// Walk the active list from its head, moving empty, decommitted and full
    /// spans off it, until an active span is found and made the head. Leaves
    /// the bucket with no active span if none is.
    pub(crate) fn set_new_active_span(&mut self, index: BucketIndex) -> Option<SpanRef> {
        let bucket = self.classes.get_mut(index);
        let slots = bucket.slots_per_span();
        let mut cursor = bucket.active_head;
        while let Some(r) = cursor {
            let span = self.super_pages.span_mut(r);
            cursor = span.next;
            debug_assert_eq!(span.bucket, index);
            debug_assert_ne!(bucket.empty_head, Some(r));
            debug_assert_ne!(bucket.decommitted_head, Some(r));

            match span.state(slots) {
                SpanState::Active => {
                    bucket.active_head = Some(r);
                    return Some(r);
                }
                SpanState::Empty => {
                    span.next = bucket.empty_head;
                    bucket.empty_head = Some(r);
                }
                SpanState::Decommitted => {
                    span.next = bucket.decommitted_head;
                    bucket.decommitted_head = Some(r);
                }
                SpanState::Full => {
                    // Tagged negative so the next free relinks it.
                    span.num_allocated_slots = -span.num_allocated_slots;
                    bucket.num_full_spans += 1;
                    span.next = None;
                }
            }
        }
        bucket.active_head = None;
        None
    }

    /// Allocate a slot from `index` when the active span's freelist is empty.
    ///
    /// Tries, in order: another span on the active list, an empty span, a
    /// decommitted span (recommitted), and a newly carved span.
    pub(crate) fn slow_path_alloc(
        &mut self,
        index: BucketIndex,
        raw_size: usize,
    ) -> Result<usize, AllocError> {
        // Sweeping the active list has side effects on the other two lists,
        // so it must run first.
        let r = if let Some(r) = self.set_new_active_span(index) {
            r
        } else if let Some(r) = self.take_empty_span(index) {
            r
        } else if let Some(r) = self.take_decommitted_span(index)? {
            r
        } else {
            self.alloc_new_span(index)?
        };

        let bucket = self.classes.get_mut(index);
        bucket.active_head = Some(r);
        let slot_size = bucket.slot_size;
        let slots = bucket.slots_per_span();
        let tracks_raw = bucket.has_raw_size();

        let span = self.super_pages.span_mut(r);
        if tracks_raw {
            span.raw_size = raw_size;
        }
        if let Some(slot) = span.pop_free() {
            return Ok(slot);
        }
        debug_assert!(span.num_unprovisioned_slots > 0);
        Ok(span.alloc_and_fill_freelist(slot_size, slots))
    }

    /// Pop the empty list, moving spans decommitted since they were queued
    /// onto the decommitted list.
    fn take_empty_span(&mut self, index: BucketIndex) -> Option<SpanRef> {
        let bucket = self.classes.get_mut(index);
        while let Some(r) = bucket.empty_head {
            let span = self.super_pages.span_mut(r);
            debug_assert!(span.is_empty() || span.is_decommitted());
            bucket.empty_head = span.next;
            if span.freelist_head != 0 {
                span.next = None;
                return Some(r);
            }
            span.next = bucket.decommitted_head;
            bucket.decommitted_head = Some(r);
        }
        None
    }

    fn take_decommitted_span(&mut self, index: BucketIndex) -> Result<Option<SpanRef>, AllocError> {
        let bucket = self.classes.get(index);
        let Some(r) = bucket.decommitted_head else {
            return Ok(None);
        };
        let bytes = bucket.bytes_per_span();
        let slots = bucket.slots_per_span();

        let span = self.super_pages.span(r);
        debug_assert!(span.is_decommitted());
        let base = span.base;
        let next = span.next;

        // On failure the span stays at the head of the decommitted list.
        self.recommit_pages(base, bytes).map_err(AllocError::out_of_memory(bytes))?;
        tracing::trace!(base = format_args!("{base:#x}"), bytes, "recommitted slot span");

        self.classes.get_mut(index).decommitted_head = next;
        self.super_pages.span_mut(r).reset(slots);
        Ok(Some(r))
    }

    /// Return a slot to its span.
    ///
    /// # Panics
    /// On an immediate double free, or a free into a span with nothing
    /// allocated.
    pub(crate) fn free_slot(&mut self, r: SpanRef, slot: usize) {
        let span = self.super_pages.span_mut(r);
        assert!(
            span.num_allocated_slots != 0,
            "free of {slot:#x} into a slot span with no live allocations"
        );
        assert!(slot != span.freelist_head, "double free of {slot:#x}");
        #[cfg(debug_assertions)]
        if span.freelist_head != 0 {
            // Safety: the head is a free slot of this committed span.
            let second = unsafe { freelist::read_next(span.freelist_head) };
            debug_assert_ne!(slot, second, "double free of {slot:#x}");
        }

        // Safety: the slot belongs to this span and is no longer live.
        unsafe { freelist::write_next(slot, span.freelist_head) };
        span.freelist_head = slot;
        span.num_allocated_slots -= 1;
        if span.num_allocated_slots <= 0 {
            self.free_slow_path(r);
        } else {
            debug_assert_eq!(span.raw_size, 0);
        }
    }

    fn free_slow_path(&mut self, r: SpanRef) {
        let span = self.super_pages.span_mut(r);
        let index = span.bucket;
        if span.num_allocated_slots == 0 {
            // Bounce the span off the head so the next allocation prefers a
            // fuller one.
            if self.classes.get(index).active_head == Some(r) {
                self.set_new_active_span(index);
            }
            debug_assert_ne!(self.classes.get(index).active_head, Some(r));
            self.super_pages.span_mut(r).raw_size = 0;
            self.register_empty_span(r);
            return;
        }

        // Only a detached full span gets here. 0 -> -1 is a double free.
        assert!(
            span.num_allocated_slots != -1,
            "double free in slot span at {:#x}",
            span.base
        );
        span.num_allocated_slots = -span.num_allocated_slots - 2;
        let bucket = self.classes.get_mut(index);
        debug_assert_eq!(
            span.num_allocated_slots as usize,
            bucket.slots_per_span() - 1
        );
        debug_assert!(span.next.is_none());
        span.next = bucket.active_head;
        bucket.active_head = Some(r);
        bucket.num_full_spans -= 1;
        // A single-slot span is now empty too.
        if span.num_allocated_slots == 0 {
            self.free_slow_path(r);
        }
    }

    /// Queue an empty span in the ring, evicting the occupant of the next
    /// ring position.
    fn register_empty_span(&mut self, r: SpanRef) {
        let span = self.super_pages.span_mut(r);
        debug_assert!(span.is_empty());

        // Already queued: give it another lap.
        if let Some(old) = span.empty_cache_index.take() {
            debug_assert_eq!(self.ring.entries[usize::from(old)], Some(r));
            self.ring.entries[usize::from(old)] = None;
        }

        let current = self.ring.index;
        if let Some(evicted) = self.ring.entries[current] {
            self.decommit_span_if_possible(evicted);
        }
        self.ring.entries[current] = Some(r);
        #[allow(clippy::cast_possible_truncation)]
        {
            self.super_pages.span_mut(r).empty_cache_index = Some(current as u8);
        }
        self.ring.index = (current + 1) % MAX_FREEABLE_SPANS;
    }

    /// Drop a ring entry, decommitting the span if it is still empty. It may
    /// have been reused since it was queued.
    pub(crate) fn decommit_span_if_possible(&mut self, r: SpanRef) {
        let span = self.super_pages.span_mut(r);
        debug_assert!(span.empty_cache_index.is_some());
        span.empty_cache_index = None;
        if span.is_empty() {
            self.decommit_span(r);
        }
    }

    /// Release the span's backing. The span stays on whatever list holds it
    /// and is swept to the decommitted list when that list is next walked.
    fn decommit_span(&mut self, r: SpanRef) {
        let span = self.super_pages.span(r);
        debug_assert!(span.is_empty());
        let base = span.base;
        let bytes = self.classes.get(span.bucket).bytes_per_span();
        self.decommit_pages(base, bytes);
        tracing::trace!(base = format_args!("{base:#x}"), bytes, "decommitted slot span");

        let span = self.super_pages.span_mut(r);
        span.freelist_head = 0;
        span.num_unprovisioned_slots = 0;
        debug_assert!(span.is_decommitted());
    }
}
