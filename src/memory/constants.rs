//! Address-space geometry shared by every heap.
//!
//! ```text
//! super page (2 MiB, aligned)
//! | guard | partition page | partition page | ... | guard |
//!           \__ 4 system pages each
//! ```
//!
//! Slot spans are carved from consecutive partition pages. The first and the
//! last partition page of every super page are never handed out.

/// log2 of the system page the allocator commits and discards in.
#[cfg(all(target_os = "macos", target_arch = "aarch64"))]
pub const SYSTEM_PAGE_SHIFT: usize = 14;
#[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
pub const SYSTEM_PAGE_SHIFT: usize = 12;
pub const SYSTEM_PAGE_SIZE: usize = 1 << SYSTEM_PAGE_SHIFT;
pub const SYSTEM_PAGE_OFFSET_MASK: usize = SYSTEM_PAGE_SIZE - 1;
pub const SYSTEM_PAGE_BASE_MASK: usize = !SYSTEM_PAGE_OFFSET_MASK;

/// Granularity of address-space reservations.
#[cfg(windows)]
pub const PAGE_ALLOCATION_GRANULARITY: usize = 64 * 1024;
#[cfg(not(windows))]
pub const PAGE_ALLOCATION_GRANULARITY: usize = SYSTEM_PAGE_SIZE;
pub const PAGE_ALLOCATION_GRANULARITY_OFFSET_MASK: usize = PAGE_ALLOCATION_GRANULARITY - 1;
pub const PAGE_ALLOCATION_GRANULARITY_BASE_MASK: usize = !PAGE_ALLOCATION_GRANULARITY_OFFSET_MASK;

pub const NUM_SYSTEM_PAGES_PER_PARTITION_PAGE: usize = 4;
pub const PARTITION_PAGE_SHIFT: usize = SYSTEM_PAGE_SHIFT + 2;
pub const PARTITION_PAGE_SIZE: usize = 1 << PARTITION_PAGE_SHIFT;

/// Multi-slot spans never exceed this many partition pages.
pub const MAX_PARTITION_PAGES_PER_SLOT_SPAN: usize = 4;
pub const MAX_SYSTEM_PAGES_PER_SLOT_SPAN: usize =
    MAX_PARTITION_PAGES_PER_SLOT_SPAN * NUM_SYSTEM_PAGES_PER_PARTITION_PAGE;

pub const SUPER_PAGE_SHIFT: usize = 21;
pub const SUPER_PAGE_SIZE: usize = 1 << SUPER_PAGE_SHIFT;
pub const SUPER_PAGE_OFFSET_MASK: usize = SUPER_PAGE_SIZE - 1;
pub const SUPER_PAGE_BASE_MASK: usize = !SUPER_PAGE_OFFSET_MASK;
pub const NUM_PARTITION_PAGES_PER_SUPER_PAGE: usize = SUPER_PAGE_SIZE / PARTITION_PAGE_SIZE;

/// Capacity of the ring of recently emptied spans awaiting decommit.
pub const MAX_FREEABLE_SPANS: usize = 16;

pub const BITS_PER_USIZE: usize = usize::BITS as usize;

// Generic (logarithmic) size classes.
pub const GENERIC_MIN_BUCKETED_ORDER: usize = 4;
pub const GENERIC_MAX_BUCKETED_ORDER: usize = 20;
pub const GENERIC_NUM_BUCKETED_ORDERS: usize =
    GENERIC_MAX_BUCKETED_ORDER - GENERIC_MIN_BUCKETED_ORDER + 1;
pub const GENERIC_NUM_BUCKETS_PER_ORDER_BITS: usize = 3;
pub const GENERIC_NUM_BUCKETS_PER_ORDER: usize = 1 << GENERIC_NUM_BUCKETS_PER_ORDER_BITS;
pub const GENERIC_NUM_BUCKETS: usize = GENERIC_NUM_BUCKETED_ORDERS * GENERIC_NUM_BUCKETS_PER_ORDER;
pub const GENERIC_SMALLEST_BUCKET: usize = 1 << (GENERIC_MIN_BUCKETED_ORDER - 1);
pub const GENERIC_MAX_BUCKET_SPACING: usize =
    1 << ((GENERIC_MAX_BUCKETED_ORDER - 1) - GENERIC_NUM_BUCKETS_PER_ORDER_BITS);
pub const GENERIC_MAX_BUCKETED: usize = (1 << (GENERIC_MAX_BUCKETED_ORDER - 1))
    + ((GENERIC_NUM_BUCKETS_PER_ORDER - 1) * GENERIC_MAX_BUCKET_SPACING);
pub const GENERIC_MIN_DIRECT_MAPPED_DOWNSIZE: usize = GENERIC_MAX_BUCKETED + 1;
/// 2 GiB plus one more allocation granule.
pub const GENERIC_MAX_DIRECT_MAPPED: usize = (1 << 31) + PAGE_ALLOCATION_GRANULARITY;
pub const GENERIC_LOOKUP_LEN: usize = ((BITS_PER_USIZE + 1) * GENERIC_NUM_BUCKETS_PER_ORDER) + 1;

// Debug hardening.
pub const COOKIE_SIZE: usize = 16;
pub const COOKIE_VALUE: [u8; COOKIE_SIZE] = [
    0xDE, 0xAD, 0xBE, 0xEF, 0xCA, 0xFE, 0xD0, 0x0D, 0x13, 0x37, 0xF0, 0x05, 0xBA, 0x11, 0xAB, 0x1E,
];
pub const UNINITIALIZED_BYTE: u8 = 0xAB;
pub const FREED_BYTE: u8 = 0xCD;

#[inline]
pub const fn round_up_to_system_page(value: usize) -> usize {
    (value + SYSTEM_PAGE_OFFSET_MASK) & SYSTEM_PAGE_BASE_MASK
}

#[inline]
pub const fn round_down_to_system_page(value: usize) -> usize {
    value & SYSTEM_PAGE_BASE_MASK
}

const _: () = assert!(NUM_PARTITION_PAGES_PER_SUPER_PAGE <= u16::MAX as usize);
const _: () = assert!(GENERIC_NUM_BUCKETS < u16::MAX as usize);

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_generic_limits() {
        assert_eq!(GENERIC_NUM_BUCKETS, 136);
        assert_eq!(GENERIC_SMALLEST_BUCKET, 8);
        assert_eq!(GENERIC_MAX_BUCKETED, 983_040);
        assert_eq!(GENERIC_MIN_DIRECT_MAPPED_DOWNSIZE, 983_041);
        assert_eq!(GENERIC_LOOKUP_LEN, 521);
    }

    #[test]
    fn test_page_geometry() {
        assert_eq!(PARTITION_PAGE_SIZE, SYSTEM_PAGE_SIZE * NUM_SYSTEM_PAGES_PER_PARTITION_PAGE);
        assert_eq!(SUPER_PAGE_SIZE % PARTITION_PAGE_SIZE, 0);
        assert!(NUM_PARTITION_PAGES_PER_SUPER_PAGE > 2);
        assert_eq!(round_up_to_system_page(1), SYSTEM_PAGE_SIZE);
        assert_eq!(round_up_to_system_page(SYSTEM_PAGE_SIZE), SYSTEM_PAGE_SIZE);
        assert_eq!(round_down_to_system_page(SYSTEM_PAGE_SIZE + 1), SYSTEM_PAGE_SIZE);
    }
}
