//! Freelist integrity walk.

use fixedbitset::FixedBitSet;
use thiserror::Error;

use super::freelist;
use super::pages::PageOps;
use super::partition::PartitionCore;

/// Counts gathered by a successful walk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntegrityReport {
    /// Slot spans that hold committed memory.
    pub spans: usize,
    /// Allocated slots across those spans.
    pub live_slots: usize,
    /// Slots reachable from the spans' freelists.
    pub free_slots: usize,
    pub direct_maps: usize,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("freelist entry {entry:#x} lies outside the slot span at {span:#x}")]
    OutsideSpan { span: usize, entry: usize },

    #[error("freelist entry {entry:#x} is not at a slot boundary of the span at {span:#x}")]
    Misaligned { span: usize, entry: usize },

    #[error("freelist of the span at {span:#x} reaches {entry:#x} twice")]
    Repeated { span: usize, entry: usize },

    #[error(
        "span at {span:#x}: {allocated} allocated + {free} free + {unprovisioned} unprovisioned != {capacity} slots"
    )]
    CountMismatch {
        span: usize,
        allocated: usize,
        free: usize,
        unprovisioned: usize,
        capacity: usize,
    },
}

impl<P: PageOps> PartitionCore<P> {
    pub(crate) fn check_integrity(&self) -> Result<IntegrityReport, IntegrityError> {
        let mut report = IntegrityReport {
            direct_maps: self.direct_maps.len(),
            ..IntegrityReport::default()
        };
        let mut seen = FixedBitSet::new();

        for (_, span) in self.super_pages.spans() {
            if span.is_decommitted() {
                continue;
            }
            let bucket = self.classes.get(span.bucket);
            let slot_size = bucket.slot_size;
            let capacity = bucket.slots_per_span();
            let end = span.base + capacity * slot_size;

            seen.clear();
            seen.grow(capacity);
            let mut free = 0;
            let mut entry = span.freelist_head;
            while entry != 0 {
                if entry < span.base || entry >= end {
                    return Err(IntegrityError::OutsideSpan { span: span.base, entry });
                }
                let offset = entry - span.base;
                if !offset.is_multiple_of(slot_size) {
                    return Err(IntegrityError::Misaligned { span: span.base, entry });
                }
                if seen.put(offset / slot_size) {
                    return Err(IntegrityError::Repeated { span: span.base, entry });
                }
                free += 1;
                // Safety: entry was just checked to be a slot of this
                // committed span.
                entry = unsafe { freelist::read_next(entry) };
            }

            // Full spans taken off the active list carry a negated count.
            let allocated = span.num_allocated_slots.unsigned_abs() as usize;
            let unprovisioned = span.num_unprovisioned_slots as usize;
            if allocated + free + unprovisioned != capacity {
                return Err(IntegrityError::CountMismatch {
                    span: span.base,
                    allocated,
                    free,
                    unprovisioned,
                    capacity,
                });
            }
            report.spans += 1;
            report.live_slots += allocated;
            report.free_slots += free;
        }
        Ok(report)
    }
}
