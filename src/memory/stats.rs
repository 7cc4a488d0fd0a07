//! Heap statistics.
//!
//! Per-heap numbers are exact: they are collected under the heap's lock (or
//! through `&mut` for a fixed heap). The process-wide gauges at the bottom
//! use `Relaxed` ordering and are eventually consistent across heaps; they
//! are for diagnostic display only. Do NOT use them for allocation
//! decisions.

use super::bucket::BucketIndex;
use super::constants::round_up_to_system_page;
use super::pages::PageOps;
use super::partition::PartitionCore;
use super::slot_span::SpanRef;
use crate::sync::atomic::{AtomicIsize, Ordering};

/// Usage of one bucket, or of one direct map reported as a bucket of its own.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BucketStats {
    pub is_direct_map: bool,
    pub slot_size: usize,
    /// Bytes per slot span (the mapping size for a direct map).
    pub allocated_span_size: usize,
    /// Bytes handed out to callers.
    pub active_bytes: usize,
    /// Bytes backed by physical memory.
    pub resident_bytes: usize,
    /// Resident bytes of empty spans, released by decommitting them.
    pub decommittable_bytes: usize,
    /// Resident bytes a discard purge would release.
    pub discardable_bytes: usize,
    pub num_full_spans: usize,
    pub num_active_spans: usize,
    pub num_empty_spans: usize,
    pub num_decommitted_spans: usize,
}

/// Totals across a heap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Address space reserved for super pages and direct maps.
    pub total_mmapped_bytes: usize,
    pub total_committed_bytes: usize,
    pub total_resident_bytes: usize,
    pub total_active_bytes: usize,
    pub total_decommittable_bytes: usize,
    pub total_discardable_bytes: usize,
}

/// Receives a heap's statistics. Called after the heap's lock is released,
/// so an implementation may allocate from the same heap.
pub trait StatsDumper {
    fn dump_totals(&mut self, heap_name: &str, totals: &HeapStats);
    fn dump_bucket(&mut self, heap_name: &str, bucket: &BucketStats);
}

/// A [`StatsDumper`] that keeps everything it is given.
#[derive(Debug, Clone, Default)]
pub struct HeapStatsSnapshot {
    pub totals: HeapStats,
    pub buckets: Vec<BucketStats>,
}

impl HeapStatsSnapshot {
    /// The bucket entry with exactly this slot size, skipping direct maps.
    pub fn bucket(&self, slot_size: usize) -> Option<&BucketStats> {
        self.buckets
            .iter()
            .find(|b| !b.is_direct_map && b.slot_size == slot_size)
    }

    pub fn direct_maps(&self) -> impl Iterator<Item = &BucketStats> {
        self.buckets.iter().filter(|b| b.is_direct_map)
    }
}

impl StatsDumper for HeapStatsSnapshot {
    fn dump_totals(&mut self, _heap_name: &str, totals: &HeapStats) {
        self.totals = totals.clone();
    }

    fn dump_bucket(&mut self, _heap_name: &str, bucket: &BucketStats) {
        self.buckets.push(bucket.clone());
    }
}

/// Committed and reserved byte counts of one heap.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct CommitCounters {
    pub(crate) committed: usize,
    pub(crate) super_pages: usize,
    pub(crate) direct_mapped: usize,
}

impl CommitCounters {
    pub(crate) fn increase_committed(&mut self, len: usize) {
        self.committed += len;
        TOTAL_COMMITTED.add(len);
        debug_assert!(self.committed <= self.super_pages + self.direct_mapped);
    }

    pub(crate) fn decrease_committed(&mut self, len: usize) {
        debug_assert!(self.committed >= len);
        self.committed -= len;
        TOTAL_COMMITTED.sub(len);
    }
}

impl<P: PageOps> PartitionCore<P> {
    /// Walk every bucket and direct map. With `light` only the totals are
    /// kept.
    pub(crate) fn collect_stats(&mut self, light: bool) -> HeapStatsSnapshot {
        let mut snapshot = HeapStatsSnapshot {
            totals: HeapStats {
                total_mmapped_bytes: self.counters.super_pages + self.counters.direct_mapped,
                total_committed_bytes: self.counters.committed,
                ..HeapStats::default()
            },
            buckets: Vec::new(),
        };

        for index in 0..self.classes.buckets.len() {
            #[allow(clippy::cast_possible_truncation)]
            let Some(stats) = self.bucket_stats(index as BucketIndex) else {
                continue;
            };
            let totals = &mut snapshot.totals;
            totals.total_resident_bytes += stats.resident_bytes;
            totals.total_active_bytes += stats.active_bytes;
            totals.total_decommittable_bytes += stats.decommittable_bytes;
            totals.total_discardable_bytes += stats.discardable_bytes;
            if !light {
                snapshot.buckets.push(stats);
            }
        }

        for extent in self.direct_maps.iter() {
            snapshot.totals.total_resident_bytes += extent.slot_size;
            snapshot.totals.total_active_bytes += extent.slot_size;
            if !light {
                snapshot.buckets.push(BucketStats {
                    is_direct_map: true,
                    slot_size: extent.slot_size,
                    allocated_span_size: extent.slot_size,
                    active_bytes: extent.slot_size,
                    resident_bytes: extent.slot_size,
                    num_full_spans: 1,
                    ..BucketStats::default()
                });
            }
        }
        snapshot
    }

    /// `None` for disabled buckets and buckets that never carved a span.
    fn bucket_stats(&mut self, index: BucketIndex) -> Option<BucketStats> {
        let bucket = self.classes.get(index);
        if !bucket.enabled || !bucket.has_spans() {
            return None;
        }
        let slots = bucket.slots_per_span();
        let full = bucket.num_full_spans as usize;
        let mut stats = BucketStats {
            is_direct_map: false,
            slot_size: bucket.slot_size,
            allocated_span_size: bucket.bytes_per_span(),
            active_bytes: full * slots * bucket.slot_size,
            resident_bytes: full * bucket.bytes_per_span(),
            num_full_spans: full,
            ..BucketStats::default()
        };

        let heads = [bucket.empty_head, bucket.decommitted_head, bucket.active_head];
        for head in heads {
            let mut cursor = head;
            while let Some(r) = cursor {
                cursor = self.super_pages.span(r).next;
                self.span_stats(&mut stats, r, slots);
            }
        }
        Some(stats)
    }

    fn span_stats(&mut self, stats: &mut BucketStats, r: SpanRef, slots: usize) {
        if self.super_pages.span(r).is_decommitted() {
            stats.num_decommitted_spans += 1;
            return;
        }
        stats.discardable_bytes += self.purge_span(r, false);

        let span = self.super_pages.span(r);
        stats.active_bytes += if span.raw_size != 0 {
            span.raw_size
        } else {
            span.num_allocated_slots.unsigned_abs() as usize * stats.slot_size
        };
        let resident =
            round_up_to_system_page((slots - span.num_unprovisioned_slots as usize) * stats.slot_size);
        stats.resident_bytes += resident;
        if span.is_empty() {
            stats.decommittable_bytes += resident;
            stats.num_empty_spans += 1;
        } else if span.is_full(slots) {
            stats.num_full_spans += 1;
        } else {
            debug_assert!(span.is_active());
            stats.num_active_spans += 1;
        }
    }
}

/// Diagnostic-only gauge counter.
///
/// Under contention, subtract-before-add races are tolerated and the raw value
/// may transiently dip below zero. Readers should always use `get()`, which
/// clamps negative values to zero.
pub struct Counter(AtomicIsize);

impl Counter {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    fn delta(val: usize) -> isize {
        // Diagnostic counters only: clamp absurd deltas instead of panicking.
        std::cmp::min(val, isize::MAX as usize).cast_signed()
    }

    #[inline]
    pub fn add(&self, val: usize) {
        self.0.fetch_add(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, val: usize) {
        self.0.fetch_sub(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed).max(0).cast_unsigned()
    }
}

// Address space reserved by every heap in the process
crate::sync::static_atomic! {
    pub static TOTAL_RESERVED: Counter = Counter::new();
}
// Physical memory committed by every heap in the process
crate::sync::static_atomic! {
    pub static TOTAL_COMMITTED: Counter = Counter::new();
}

/// Process-wide gauges summed over every heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessMemory {
    pub reserved_bytes: usize,
    pub committed_bytes: usize,
}

pub fn process_memory() -> ProcessMemory {
    ProcessMemory {
        reserved_bytes: TOTAL_RESERVED.get(),
        committed_bytes: TOTAL_COMMITTED.get(),
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_counter_clamps_at_zero() {
        let counter = Counter::new();
        counter.add(10);
        counter.sub(25);
        assert_eq!(counter.get(), 0);
        counter.add(20);
        assert_eq!(counter.get(), 5);
    }

    #[test]
    fn test_counter_clamps_huge_delta() {
        let counter = Counter::new();
        counter.add(usize::MAX);
        assert_eq!(counter.get(), isize::MAX as usize);
    }

    #[test]
    fn test_snapshot_collects_dump() {
        let mut snapshot = HeapStatsSnapshot::default();
        let totals = HeapStats {
            total_committed_bytes: 4096,
            ..HeapStats::default()
        };
        snapshot.dump_totals("test", &totals);
        snapshot.dump_bucket(
            "test",
            &BucketStats {
                slot_size: 64,
                ..BucketStats::default()
            },
        );
        snapshot.dump_bucket(
            "test",
            &BucketStats {
                is_direct_map: true,
                slot_size: 64,
                ..BucketStats::default()
            },
        );
        assert_eq!(snapshot.totals, totals);
        assert!(snapshot.bucket(64).is_some_and(|b| !b.is_direct_map));
        assert_eq!(snapshot.direct_maps().count(), 1);
    }
}
