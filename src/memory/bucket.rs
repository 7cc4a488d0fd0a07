//! Size classes and the per-bucket span lists.

use super::constants::{
    GENERIC_LOOKUP_LEN, GENERIC_MAX_BUCKETED, GENERIC_MAX_BUCKETED_ORDER,
    GENERIC_MIN_BUCKETED_ORDER, GENERIC_NUM_BUCKETED_ORDERS, GENERIC_NUM_BUCKETS,
    GENERIC_NUM_BUCKETS_PER_ORDER, GENERIC_NUM_BUCKETS_PER_ORDER_BITS, GENERIC_SMALLEST_BUCKET,
    BITS_PER_USIZE, MAX_SYSTEM_PAGES_PER_SLOT_SPAN, NUM_PARTITION_PAGES_PER_SUPER_PAGE,
    NUM_SYSTEM_PAGES_PER_PARTITION_PAGE, PARTITION_PAGE_SIZE, SYSTEM_PAGE_SIZE,
};
use super::error::AllocError;
use super::slot_span::SpanRef;

pub type BucketIndex = u16;

const SENTINEL: BucketIndex = BucketIndex::MAX;

/// A size class and the spans serving it.
///
/// Spans in the full state are not linked anywhere; only their count is
/// kept. The active list may also hold empty, decommitted and (briefly) full
/// spans, which are swept to the right place the next time it is walked.
#[derive(Debug)]
pub(crate) struct Bucket {
    pub(crate) slot_size: usize,
    pub(crate) num_system_pages_per_slot_span: usize,
    pub(crate) active_head: Option<SpanRef>,
    pub(crate) empty_head: Option<SpanRef>,
    pub(crate) decommitted_head: Option<SpanRef>,
    pub(crate) num_full_spans: u32,
    /// False for generic pseudo-buckets whose size is not a multiple of the
    /// smallest bucket. The size lookup never resolves to them.
    pub(crate) enabled: bool,
}

impl Bucket {
    fn new(slot_size: usize, enabled: bool) -> Self {
        Self {
            slot_size,
            num_system_pages_per_slot_span: num_system_pages_for_slot(slot_size),
            active_head: None,
            empty_head: None,
            decommitted_head: None,
            num_full_spans: 0,
            enabled,
        }
    }

    #[inline]
    pub(crate) fn bytes_per_span(&self) -> usize {
        self.num_system_pages_per_slot_span * SYSTEM_PAGE_SIZE
    }

    #[inline]
    pub(crate) fn slots_per_span(&self) -> usize {
        self.bytes_per_span() / self.slot_size
    }

    #[inline]
    pub(crate) fn partition_pages_per_span(&self) -> usize {
        self.num_system_pages_per_slot_span
            .div_ceil(NUM_SYSTEM_PAGES_PER_PARTITION_PAGE)
    }

    /// Single-slot spans too large for a multi-slot span remember the exact
    /// requested size so purging can discard the unused tail.
    #[inline]
    pub(crate) fn has_raw_size(&self) -> bool {
        self.slot_size > MAX_SYSTEM_PAGES_PER_SLOT_SPAN * SYSTEM_PAGE_SIZE
    }

    pub(crate) fn has_spans(&self) -> bool {
        self.active_head.is_some()
            || self.empty_head.is_some()
            || self.decommitted_head.is_some()
            || self.num_full_spans > 0
    }
}

/// System pages per slot span for a slot size.
///
/// Sizes above the multi-slot limit get exactly one slot. Otherwise the page
/// count between 3 and the limit with the smallest tail waste wins, where
/// each page left unfaulted in the last partition page is charged one word.
/// The first minimum wins.
pub fn num_system_pages_for_slot(slot_size: usize) -> usize {
    if slot_size > MAX_SYSTEM_PAGES_PER_SLOT_SPAN * SYSTEM_PAGE_SIZE {
        debug_assert!(slot_size.is_multiple_of(SYSTEM_PAGE_SIZE));
        return slot_size / SYSTEM_PAGE_SIZE;
    }

    let mut best_ratio = 1.0f64;
    let mut best_pages = 0;
    for pages in (NUM_SYSTEM_PAGES_PER_PARTITION_PAGE - 1)..=MAX_SYSTEM_PAGES_PER_SLOT_SPAN {
        let span_bytes = SYSTEM_PAGE_SIZE * pages;
        let mut waste = span_bytes % slot_size;
        let remainder = pages & (NUM_SYSTEM_PAGES_PER_PARTITION_PAGE - 1);
        let unfaulted = if remainder == 0 {
            0
        } else {
            NUM_SYSTEM_PAGES_PER_PARTITION_PAGE - remainder
        };
        waste += std::mem::size_of::<usize>() * unfaulted;
        #[allow(clippy::cast_precision_loss)]
        let ratio = waste as f64 / span_bytes as f64;
        if ratio < best_ratio {
            best_ratio = ratio;
            best_pages = pages;
        }
    }
    debug_assert!(best_pages > 0);
    best_pages
}

/// Shift/mask tables and the order-indexed lookup of the generic heap.
struct GenericLookup {
    shifts: [u8; BITS_PER_USIZE + 1],
    masks: [usize; BITS_PER_USIZE + 1],
    table: [BucketIndex; GENERIC_LOOKUP_LEN],
}

impl GenericLookup {
    fn build(buckets: &[Bucket]) -> Box<Self> {
        let mut lookup = Box::new(Self {
            shifts: [0; BITS_PER_USIZE + 1],
            masks: [0; BITS_PER_USIZE + 1],
            table: [SENTINEL; GENERIC_LOOKUP_LEN],
        });

        // Example: 41 = 0b101001. Order 6; the next three bits (010) pick the
        // sub-bucket; any remaining set bit (01) rounds up to the next one.
        let sub_bits = GENERIC_NUM_BUCKETS_PER_ORDER_BITS + 1;
        for order in 0..=BITS_PER_USIZE {
            #[allow(clippy::cast_possible_truncation)]
            {
                lookup.shifts[order] = order.saturating_sub(sub_bits) as u8;
            }
            lookup.masks[order] = if order == BITS_PER_USIZE {
                usize::MAX >> sub_bits
            } else {
                ((1usize << order) - 1) >> sub_bits
            };
        }

        let mut next = 0usize;
        let mut slot = 0usize;
        for order in 0..=BITS_PER_USIZE {
            for _ in 0..GENERIC_NUM_BUCKETS_PER_ORDER {
                lookup.table[slot] = if order < GENERIC_MIN_BUCKETED_ORDER {
                    0
                } else if order > GENERIC_MAX_BUCKETED_ORDER {
                    SENTINEL
                } else {
                    let mut valid = next;
                    while !buckets[valid].enabled {
                        valid += 1;
                    }
                    next += 1;
                    #[allow(clippy::cast_possible_truncation)]
                    {
                        valid as BucketIndex
                    }
                };
                slot += 1;
            }
        }
        debug_assert_eq!(next, GENERIC_NUM_BUCKETS);
        // The last entry catches sizes that overflow into a nonexistent order.
        lookup.table[slot] = SENTINEL;
        lookup
    }

    #[inline]
    fn index(&self, size: usize) -> usize {
        let order = (BITS_PER_USIZE as u32 - size.leading_zeros()) as usize;
        let sub_index = (size >> self.shifts[order]) & (GENERIC_NUM_BUCKETS_PER_ORDER - 1);
        let round_up = usize::from(size & self.masks[order] != 0);
        (order << GENERIC_NUM_BUCKETS_PER_ORDER_BITS) + sub_index + round_up
    }
}

enum Lookup {
    /// Sorted explicit slot sizes; the first one that fits wins.
    Fixed,
    Generic(Box<GenericLookup>),
}

/// The bucket table of a heap together with its size-to-bucket lookup.
pub(crate) struct SizeClasses {
    pub(crate) buckets: Vec<Bucket>,
    lookup: Lookup,
}

impl SizeClasses {
    /// Explicit slot sizes, strictly increasing.
    pub(crate) fn fixed(slot_sizes: &[usize]) -> Result<Self, AllocError> {
        if slot_sizes.is_empty() {
            return Err(AllocError::InitializationFailed(
                "fixed heap needs at least one slot size".into(),
            ));
        }
        if slot_sizes.len() >= usize::from(SENTINEL) {
            return Err(AllocError::InitializationFailed(format!(
                "too many slot sizes: {}",
                slot_sizes.len()
            )));
        }
        let usable = (NUM_PARTITION_PAGES_PER_SUPER_PAGE - 2) * PARTITION_PAGE_SIZE;
        let mut previous = 0;
        for &size in slot_sizes {
            if size == 0 || !size.is_multiple_of(GENERIC_SMALLEST_BUCKET) {
                return Err(AllocError::InitializationFailed(format!(
                    "slot size {size} is not a non-zero multiple of {GENERIC_SMALLEST_BUCKET}"
                )));
            }
            if size <= previous {
                return Err(AllocError::InitializationFailed(format!(
                    "slot sizes must be strictly increasing ({previous} then {size})"
                )));
            }
            if size > MAX_SYSTEM_PAGES_PER_SLOT_SPAN * SYSTEM_PAGE_SIZE
                && !size.is_multiple_of(SYSTEM_PAGE_SIZE)
            {
                return Err(AllocError::InitializationFailed(format!(
                    "single-slot size {size} is not a multiple of the system page"
                )));
            }
            if size > usable {
                return Err(AllocError::InitializationFailed(format!(
                    "slot size {size} does not fit in a super page"
                )));
            }
            previous = size;
        }

        Ok(Self {
            buckets: slot_sizes.iter().map(|&size| Bucket::new(size, true)).collect(),
            lookup: Lookup::Fixed,
        })
    }

    /// The logarithmic table: 8 buckets per power of two from 8 bytes up to
    /// the bucketed maximum.
    pub(crate) fn generic() -> Self {
        let mut buckets = Vec::with_capacity(GENERIC_NUM_BUCKETS);
        let mut size = GENERIC_SMALLEST_BUCKET;
        let mut increment = GENERIC_SMALLEST_BUCKET >> GENERIC_NUM_BUCKETS_PER_ORDER_BITS;
        for _ in 0..GENERIC_NUM_BUCKETED_ORDERS {
            for _ in 0..GENERIC_NUM_BUCKETS_PER_ORDER {
                buckets.push(Bucket::new(size, size.is_multiple_of(GENERIC_SMALLEST_BUCKET)));
                size += increment;
            }
            increment <<= 1;
        }
        debug_assert_eq!(size, 1 << GENERIC_MAX_BUCKETED_ORDER);

        let lookup = GenericLookup::build(&buckets);
        Self {
            buckets,
            lookup: Lookup::Generic(lookup),
        }
    }

    /// Bucket serving `size`, or `None` if it is larger than any bucket.
    #[inline]
    pub(crate) fn bucket_for_size(&self, size: usize) -> Option<BucketIndex> {
        match &self.lookup {
            Lookup::Generic(lookup) => {
                let index = lookup.table[lookup.index(size)];
                (index != SENTINEL).then_some(index)
            }
            Lookup::Fixed => {
                let index = self.buckets.partition_point(|b| b.slot_size < size);
                #[allow(clippy::cast_possible_truncation)]
                (index < self.buckets.len()).then_some(index as BucketIndex)
            }
        }
    }

    pub(crate) fn is_generic(&self) -> bool {
        matches!(self.lookup, Lookup::Generic(_))
    }

    /// Largest size served from a bucket.
    pub(crate) fn max_bucketed(&self) -> usize {
        match self.lookup {
            Lookup::Generic(_) => GENERIC_MAX_BUCKETED,
            Lookup::Fixed => self.buckets.last().map_or(0, |b| b.slot_size),
        }
    }

    #[inline]
    pub(crate) fn get(&self, index: BucketIndex) -> &Bucket {
        &self.buckets[usize::from(index)]
    }

    #[inline]
    pub(crate) fn get_mut(&mut self, index: BucketIndex) -> &mut Bucket {
        &mut self.buckets[usize::from(index)]
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_generic_table_layout() {
        let classes = SizeClasses::generic();
        assert_eq!(classes.buckets.len(), GENERIC_NUM_BUCKETS);
        assert_eq!(classes.buckets[0].slot_size, 8);
        assert_eq!(classes.buckets[8].slot_size, 16);
        assert!(!classes.buckets[1].enabled, "9-byte pseudo-bucket must be disabled");
        assert_eq!(classes.buckets[GENERIC_NUM_BUCKETS - 1].slot_size, GENERIC_MAX_BUCKETED);
    }

    #[test]
    fn test_generic_lookup_covers_every_size() {
        let classes = SizeClasses::generic();
        let mut previous: Option<BucketIndex> = None;
        for size in 1..=GENERIC_MAX_BUCKETED {
            let index = classes.bucket_for_size(size).expect("bucketed size must resolve");
            let bucket = classes.get(index);
            assert!(bucket.enabled, "size {size} resolved to a disabled bucket");
            assert!(bucket.slot_size >= size, "size {size} got slot {}", bucket.slot_size);
            if let Some(prev) = previous {
                let prev_bucket = classes.get(prev);
                if index != prev {
                    // A new bucket starts right after the previous one ends.
                    assert_eq!(prev_bucket.slot_size, size - 1, "gap or overlap at {size}");
                    assert!(index > prev);
                }
            }
            previous = Some(index);
        }
    }

    #[test]
    fn test_generic_lookup_edges() {
        let classes = SizeClasses::generic();
        assert_eq!(classes.bucket_for_size(0), Some(0));
        assert_eq!(classes.bucket_for_size(8), Some(0));
        assert_eq!(classes.get(classes.bucket_for_size(41).unwrap()).slot_size, 48);
        assert_eq!(classes.bucket_for_size(GENERIC_MAX_BUCKETED + 1), None);
        assert_eq!(classes.bucket_for_size(usize::MAX), None);
        assert_eq!(classes.bucket_for_size(1 << 40), None);
    }

    #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
    #[test]
    fn test_num_system_pages_for_slot() {
        assert_eq!(num_system_pages_for_slot(8), 4);
        assert_eq!(num_system_pages_for_slot(16), 4);
        assert_eq!(num_system_pages_for_slot(4096), 4);
        assert_eq!(num_system_pages_for_slot(65536), 16);
        assert_eq!(num_system_pages_for_slot(73728), 18);
        // 24 does not divide 4 pages evenly; 12 pages is the first perfect fit.
        assert_eq!(num_system_pages_for_slot(24), 12);
    }

    #[test]
    fn test_every_generic_span_fits_a_super_page() {
        let classes = SizeClasses::generic();
        for bucket in &classes.buckets {
            assert!(bucket.slots_per_span() >= 1);
            assert!(bucket.partition_pages_per_span() <= NUM_PARTITION_PAGES_PER_SUPER_PAGE - 2);
            assert_eq!(
                bucket.has_raw_size(),
                bucket.num_system_pages_per_slot_span > MAX_SYSTEM_PAGES_PER_SLOT_SPAN
            );
        }
    }

    #[test]
    fn test_fixed_lookup() {
        let classes = SizeClasses::fixed(&[16, 64, 256]).unwrap();
        assert!(!classes.is_generic());
        assert_eq!(classes.max_bucketed(), 256);
        assert_eq!(classes.bucket_for_size(0), Some(0));
        assert_eq!(classes.bucket_for_size(16), Some(0));
        assert_eq!(classes.bucket_for_size(17), Some(1));
        assert_eq!(classes.bucket_for_size(256), Some(2));
        assert_eq!(classes.bucket_for_size(257), None);
    }

    #[test]
    fn test_fixed_validation() {
        assert!(SizeClasses::fixed(&[]).is_err());
        assert!(SizeClasses::fixed(&[12]).is_err());
        assert!(SizeClasses::fixed(&[64, 32]).is_err());
        assert!(SizeClasses::fixed(&[MAX_SYSTEM_PAGES_PER_SLOT_SPAN * SYSTEM_PAGE_SIZE + 8]).is_err());
        assert!(SizeClasses::fixed(&[4 * 1024 * 1024]).is_err());
        assert!(SizeClasses::fixed(&[8, MAX_SYSTEM_PAGES_PER_SLOT_SPAN * SYSTEM_PAGE_SIZE * 2]).is_ok());
    }
}
