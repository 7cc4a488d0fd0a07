//! In-slot freelist links.
//!
//! A free slot stores the address of the next free slot in its first word.
//! Stored links are transformed so that a stray write of a small integer or
//! a plausible heap address does not turn into a usable pointer. The span
//! keeps its head decoded.

/// Reversible transform applied to every stored freelist link.
pub struct FreelistCodec;

impl FreelistCodec {
    #[cfg(target_endian = "little")]
    #[inline]
    const fn transform(value: usize) -> usize {
        value.swap_bytes()
    }

    #[cfg(target_endian = "big")]
    #[inline]
    const fn transform(value: usize) -> usize {
        !value
    }

    #[inline]
    pub const fn encode(next: usize) -> usize {
        Self::transform(next)
    }

    #[inline]
    pub const fn decode(stored: usize) -> usize {
        Self::transform(stored)
    }
}

/// Read the decoded link stored in a free slot.
///
/// # Safety
/// `slot` must be the address of a committed, word-aligned free slot.
#[inline]
pub(crate) unsafe fn read_next(slot: usize) -> usize {
    // Safety: caller guarantees slot is a live, aligned free slot.
    FreelistCodec::decode(unsafe { (slot as *const usize).read() })
}

/// Encode and store `next` into the first word of a free slot.
///
/// # Safety
/// `slot` must be the address of a committed, word-aligned slot that holds
/// no live data.
#[inline]
pub(crate) unsafe fn write_next(slot: usize, next: usize) {
    // Safety: caller guarantees slot is a committed, aligned, dead slot.
    unsafe { (slot as *mut usize).write(FreelistCodec::encode(next)) }
}

/// The raw stored word, without decoding.
///
/// # Safety
/// Same as [`read_next`].
#[inline]
pub(crate) unsafe fn read_raw(slot: usize) -> usize {
    // Safety: forwarded.
    unsafe { (slot as *const usize).read() }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_transform_is_involution() {
        for value in [0usize, 1, 0xDEAD_BEEF, usize::MAX, 0x7F00_1234_5000] {
            assert_eq!(FreelistCodec::decode(FreelistCodec::encode(value)), value);
        }
    }

    #[test]
    fn test_encoded_heap_address_is_not_a_heap_address() {
        let addr = 0x7F12_3456_7000usize;
        let stored = FreelistCodec::encode(addr);
        assert_ne!(stored, addr);
        // User-space pointers fit in 47 bits; the stored word does not, so
        // following it faults instead of landing in the heap.
        assert_ne!(stored >> 48, 0);
        assert!(stored > 0x0000_7FFF_FFFF_FFFF);
    }

    #[test]
    fn test_links_round_trip_through_memory() {
        let mut slots = [0usize; 4];
        let base = slots.as_mut_ptr() as usize;
        let word = std::mem::size_of::<usize>();

        // Safety: Test code. Every address is a slot of the local array.
        unsafe {
            write_next(base, base + word);
            write_next(base + word, base + 3 * word);
            write_next(base + 3 * word, 0);

            assert_eq!(read_next(base), base + word);
            assert_eq!(read_next(base + word), base + 3 * word);
            assert_eq!(read_next(base + 3 * word), 0);
            assert_eq!(read_raw(base + 3 * word), FreelistCodec::encode(0));
        }
    }
}
