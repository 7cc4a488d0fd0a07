//! State and operations shared by the fixed and the generic heap.
//!
//! Nothing in here locks. The generic heap wraps a `PartitionCore` in its
//! lock; the fixed heap hands out `&mut` access only.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::ptr::NonNull;

use super::bucket::{BucketIndex, SizeClasses};
use super::config::HeapConfig;
use super::constants::{
    COOKIE_SIZE, COOKIE_VALUE, FREED_BYTE, GENERIC_MAX_DIRECT_MAPPED, SUPER_PAGE_BASE_MASK,
    SYSTEM_PAGE_SIZE, UNINITIALIZED_BYTE,
};
use super::direct_map::{DirectMaps, direct_map_size};
use super::error::AllocError;
use super::pages::{PageError, PageOps, os_page_fits};
use super::slot_span::{EmptySpanRing, SpanRef, SpanState};
use super::stats::CommitCounters;
use super::super_page::SuperPages;

/// What a super page base in the owner table belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Owner {
    SuperPage(u32),
    DirectMap(u32),
}

/// Where a live slot's metadata lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Location {
    Span(SpanRef),
    DirectMap(u32),
}

#[inline]
pub(crate) fn page_ptr(addr: usize) -> NonNull<u8> {
    debug_assert_ne!(addr, 0);
    // Safety: every address the heap computes lies inside a reservation,
    // and reservations never start at 0.
    unsafe { NonNull::new_unchecked(addr as *mut u8) }
}

#[cold]
#[inline(never)]
fn invalid_pointer(addr: usize) -> ! {
    panic!("pointer {addr:#x} was not allocated by this heap")
}

pub(crate) struct PartitionCore<P: PageOps> {
    pub(crate) config: HeapConfig,
    pub(crate) classes: SizeClasses,
    pub(crate) super_pages: SuperPages,
    pub(crate) direct_maps: DirectMaps,
    pub(crate) ring: EmptySpanRing,
    pub(crate) counters: CommitCounters,
    /// Super page base to owner, for every super page and direct map.
    pub(crate) owners: HashMap<usize, Owner>,
    _ops: PhantomData<fn() -> P>,
}

impl<P: PageOps> PartitionCore<P> {
    pub(crate) fn new(classes: SizeClasses, config: HeapConfig) -> Result<Self, AllocError> {
        if !os_page_fits::<P>() {
            return Err(AllocError::InitializationFailed(format!(
                "OS page size {} exceeds the {SYSTEM_PAGE_SIZE}-byte system page",
                P::page_size()
            )));
        }
        tracing::debug!(
            buckets = classes.buckets.len(),
            generic = classes.is_generic(),
            cookies = config.cookies,
            "initialized partition heap"
        );
        Ok(Self {
            config,
            classes,
            super_pages: SuperPages::default(),
            direct_maps: DirectMaps::default(),
            ring: EmptySpanRing::default(),
            counters: CommitCounters::default(),
            owners: HashMap::new(),
            _ops: PhantomData,
        })
    }

    /// Largest request, cookies included, the heap can serve.
    pub(crate) fn max_allocation(&self) -> usize {
        if self.classes.is_generic() {
            GENERIC_MAX_DIRECT_MAPPED
        } else {
            self.classes.max_bucketed()
        }
    }

    #[inline]
    fn cookie_offset(&self) -> usize {
        if self.config.cookies { COOKIE_SIZE } else { 0 }
    }

    pub(crate) fn alloc(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let raw = size
            .checked_add(2 * self.cookie_offset())
            .ok_or(AllocError::ExcessiveSize {
                size,
                max: self.max_allocation(),
            })?;
        let slot = match self.classes.bucket_for_size(raw) {
            Some(index) => self.bucket_alloc(index, raw)?,
            None if self.classes.is_generic() && raw <= GENERIC_MAX_DIRECT_MAPPED => {
                self.direct_map(raw)?
            }
            None => {
                return Err(AllocError::ExcessiveSize {
                    size,
                    max: self.max_allocation(),
                });
            }
        };
        Ok(self.prepare_slot(slot))
    }

    #[inline]
    fn bucket_alloc(&mut self, index: BucketIndex, raw_size: usize) -> Result<usize, AllocError> {
        if let Some(head) = self.classes.get(index).active_head {
            if let Some(slot) = self.super_pages.span_mut(head).pop_free() {
                return Ok(slot);
            }
        }
        self.slow_path_alloc(index, raw_size)
    }

    /// Write cookies and the uninitialized pattern, as configured, and return
    /// the address handed to the caller.
    fn prepare_slot(&self, slot: usize) -> NonNull<u8> {
        if !self.config.cookies && !self.config.poison {
            return page_ptr(slot);
        }
        let usable = self.usable_size(self.locate(slot));
        let offset = self.cookie_offset();
        // Safety: `usable` bytes from `slot` are committed and owned by the
        // new allocation.
        unsafe {
            if self.config.cookies {
                write_cookie(slot);
                write_cookie(slot + usable - COOKIE_SIZE);
            }
            if self.config.poison {
                std::ptr::write_bytes((slot + offset) as *mut u8, UNINITIALIZED_BYTE, usable - 2 * offset);
            }
        }
        page_ptr(slot + offset)
    }

    /// Return an allocation.
    ///
    /// # Safety
    /// `ptr` must be a live allocation of this heap.
    ///
    /// # Panics
    /// If `ptr` does not belong to this heap, on a detected double free, and
    /// on corrupted cookies.
    pub(crate) unsafe fn free(&mut self, ptr: NonNull<u8>) {
        let slot = (ptr.as_ptr() as usize).wrapping_sub(self.cookie_offset());
        let location = self.locate(slot);
        if self.config.cookies || self.config.poison {
            let usable = self.usable_size(location);
            // Safety: the caller guarantees the allocation is live, so its
            // usable bytes are committed.
            unsafe {
                if self.config.cookies {
                    check_cookie(slot);
                    check_cookie(slot + usable - COOKIE_SIZE);
                }
                if self.config.poison && matches!(location, Location::Span(_)) {
                    std::ptr::write_bytes(slot as *mut u8, FREED_BYTE, usable);
                }
            }
        }
        match location {
            Location::Span(r) => self.free_slot(r, slot),
            Location::DirectMap(index) => self.direct_unmap(index),
        }
    }

    /// Resize an allocation. `None` in, allocates; size 0, frees and
    /// returns `None`.
    ///
    /// # Safety
    /// `ptr`, if present, must be a live allocation of this heap.
    pub(crate) unsafe fn realloc(
        &mut self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        let Some(ptr) = ptr else {
            return self.alloc(new_size).map(Some);
        };
        if new_size == 0 {
            // Safety: forwarded from the caller.
            unsafe { self.free(ptr) };
            return Ok(None);
        }
        if new_size > self.max_allocation() {
            return Err(AllocError::ExcessiveSize {
                size: new_size,
                max: self.max_allocation(),
            });
        }

        let offset = self.cookie_offset();
        let slot = (ptr.as_ptr() as usize).wrapping_sub(offset);
        let location = self.locate(slot);
        let raw = new_size + 2 * offset;

        if let Location::DirectMap(index) = location {
            if self.realloc_direct_mapped_in_place(index, raw)? {
                if self.config.cookies {
                    // Safety: the direct map now commits at least `raw` bytes.
                    unsafe { write_cookie(slot + raw - COOKIE_SIZE) };
                }
                return Ok(Some(ptr));
            }
        }

        let actual_old = self.allocation_size_at(location);
        if self.actual_size(new_size) == actual_old {
            // Same slot size: keep the allocation, but remember the new exact
            // size where the span tracks it.
            if let Location::Span(r) = location {
                let tracks_raw = self
                    .classes
                    .get(self.super_pages.span(r).bucket)
                    .has_raw_size();
                if tracks_raw {
                    self.super_pages.span_mut(r).raw_size = raw;
                    if self.config.cookies {
                        // Safety: raw fits in the slot, which is live.
                        unsafe { write_cookie(slot + raw - COOKIE_SIZE) };
                    }
                }
            }
            return Ok(Some(ptr));
        }

        let new = self.alloc(new_size)?;
        // Safety: both allocations are live and distinct; the copy stays
        // within the smaller of them.
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.as_ptr(), new.as_ptr(), actual_old.min(new_size));
            self.free(ptr);
        }
        Ok(Some(new))
    }

    /// Usable size an allocation of `size` bytes would get.
    pub(crate) fn actual_size(&self, size: usize) -> usize {
        let offset = self.cookie_offset();
        let Some(raw) = size.checked_add(2 * offset) else {
            return size;
        };
        let actual = match self.classes.bucket_for_size(raw) {
            Some(index) => self.classes.get(index).slot_size,
            None if self.classes.is_generic() && raw <= GENERIC_MAX_DIRECT_MAPPED => {
                direct_map_size(raw)
            }
            // Too large to allocate: unchanged.
            None => raw,
        };
        actual - 2 * offset
    }

    /// Usable size of a live allocation.
    pub(crate) fn allocation_size(&self, ptr: NonNull<u8>) -> usize {
        let slot = (ptr.as_ptr() as usize).wrapping_sub(self.cookie_offset());
        self.allocation_size_at(self.locate(slot))
    }

    fn allocation_size_at(&self, location: Location) -> usize {
        let slot_size = match location {
            Location::Span(r) => self.classes.get(self.super_pages.span(r).bucket).slot_size,
            Location::DirectMap(index) => self.direct_maps.get(index).map_or(0, |e| e.slot_size),
        };
        slot_size - 2 * self.cookie_offset()
    }

    /// Bytes between the slot start and the trailing cookie's end: the
    /// tracked raw size where there is one, else the slot size.
    fn usable_size(&self, location: Location) -> usize {
        match location {
            Location::Span(r) => {
                let span = self.super_pages.span(r);
                if span.raw_size != 0 {
                    span.raw_size
                } else {
                    self.classes.get(span.bucket).slot_size
                }
            }
            Location::DirectMap(index) => self.direct_maps.get(index).map_or(0, |e| e.raw_size),
        }
    }

    pub(crate) fn span_state(&self, ptr: NonNull<u8>) -> SpanState {
        let slot = (ptr.as_ptr() as usize).wrapping_sub(self.cookie_offset());
        match self.locate(slot) {
            Location::Span(r) => {
                let span = self.super_pages.span(r);
                span.state(self.classes.get(span.bucket).slots_per_span())
            }
            Location::DirectMap(_) => SpanState::Full,
        }
    }

    /// Find the metadata of the slot starting at `addr`.
    ///
    /// # Panics
    /// If `addr` is not inside a slot of this heap.
    pub(crate) fn locate(&self, addr: usize) -> Location {
        match self.owners.get(&(addr & SUPER_PAGE_BASE_MASK)) {
            Some(&Owner::SuperPage(arena)) => {
                let Some(r) = self.super_pages.span_at(arena, addr) else {
                    invalid_pointer(addr)
                };
                let span = self.super_pages.span(r);
                let bucket = self.classes.get(span.bucket);
                let offset = addr - span.base;
                if offset >= bucket.slots_per_span() * bucket.slot_size {
                    invalid_pointer(addr);
                }
                debug_assert!(
                    offset.is_multiple_of(bucket.slot_size),
                    "pointer {addr:#x} is inside a slot"
                );
                Location::Span(r)
            }
            Some(&Owner::DirectMap(index)) => match self.direct_maps.get(index) {
                Some(extent) if extent.slot() == addr => Location::DirectMap(index),
                _ => invalid_pointer(addr),
            },
            None => invalid_pointer(addr),
        }
    }

    pub(crate) fn commit_pages(&mut self, addr: usize, len: usize) -> Result<(), PageError> {
        // Safety: callers pass page-aligned ranges inside this heap's
        // reservations.
        unsafe { P::commit(page_ptr(addr), len) }?;
        self.counters.increase_committed(len);
        Ok(())
    }

    /// Commit pages that were decommitted before, poisoning them if
    /// configured.
    pub(crate) fn recommit_pages(&mut self, addr: usize, len: usize) -> Result<(), PageError> {
        self.commit_pages(addr, len)?;
        if self.config.poison {
            // Safety: just committed and not yet handed out.
            unsafe { std::ptr::write_bytes(addr as *mut u8, UNINITIALIZED_BYTE, len) };
        }
        Ok(())
    }

    /// Decommit a range. An OS failure is logged; the heap treats the range
    /// as decommitted either way.
    pub(crate) fn decommit_pages(&mut self, addr: usize, len: usize) {
        // Safety: callers pass page-aligned ranges holding no live data.
        if let Err(err) = unsafe { P::decommit(page_ptr(addr), len) } {
            tracing::warn!(addr = format_args!("{addr:#x}"), len, %err, "decommit failed");
        }
        self.counters.decrease_committed(len);
    }

    pub(crate) fn discard_pages(&self, addr: usize, len: usize) {
        // Safety: callers pass page-aligned ranges holding no live data.
        if let Err(err) = unsafe { P::discard(page_ptr(addr), len) } {
            tracing::warn!(addr = format_args!("{addr:#x}"), len, %err, "discard failed");
        }
    }
}

impl<P: PageOps> Drop for PartitionCore<P> {
    fn drop(&mut self) {
        self.release_direct_maps();
        let committed = self.counters.committed;
        self.counters.decrease_committed(committed);
        self.release_super_pages();
    }
}

/// # Safety
/// `addr` must point to `COOKIE_SIZE` writable bytes.
#[inline]
unsafe fn write_cookie(addr: usize) {
    // Safety: forwarded.
    unsafe { std::ptr::copy_nonoverlapping(COOKIE_VALUE.as_ptr(), addr as *mut u8, COOKIE_SIZE) };
}

/// # Safety
/// `addr` must point to `COOKIE_SIZE` readable bytes.
#[inline]
unsafe fn check_cookie(addr: usize) {
    // Safety: forwarded.
    let cookie = unsafe { std::slice::from_raw_parts(addr as *const u8, COOKIE_SIZE) };
    assert!(cookie == COOKIE_VALUE, "heap cookie at {addr:#x} is corrupted");
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::memory::bucket::SizeClasses;
    use crate::memory::constants::GENERIC_MAX_BUCKETED;
    use crate::memory::pages::PlatformPageOps;

    fn core(cookies: bool) -> PartitionCore<PlatformPageOps> {
        let config = HeapConfig {
            cookies,
            poison: cookies,
            ..HeapConfig::default()
        };
        PartitionCore::new(SizeClasses::generic(), config).unwrap()
    }

    #[test]
    fn test_actual_size() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let plain = core(false);
        assert_eq!(plain.actual_size(0), 8);
        assert_eq!(plain.actual_size(41), 48);
        assert_eq!(plain.actual_size(GENERIC_MAX_BUCKETED), GENERIC_MAX_BUCKETED);
        assert_eq!(
            plain.actual_size(GENERIC_MAX_BUCKETED + 1),
            direct_map_size(GENERIC_MAX_BUCKETED + 1)
        );
        assert_eq!(plain.actual_size(usize::MAX), usize::MAX);

        let hardened = core(true);
        // 41 + 32 bytes of cookies land in the 80-byte bucket.
        assert_eq!(hardened.actual_size(41), 80 - 2 * COOKIE_SIZE);
    }

    #[test]
    fn test_cookies_surround_allocation() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut heap = core(true);
        let ptr = heap.alloc(24).unwrap();
        // Safety: Test code; the allocation is live.
        unsafe {
            let before = std::slice::from_raw_parts(ptr.as_ptr().sub(COOKIE_SIZE), COOKIE_SIZE);
            assert_eq!(before, COOKIE_VALUE);
            let body = std::slice::from_raw_parts(ptr.as_ptr(), 24);
            assert!(body.iter().all(|&b| b == UNINITIALIZED_BYTE));
            heap.free(ptr);
        }
    }

    #[test]
    fn test_locate_rejects_foreign_pointer() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut heap = core(false);
        let ptr = heap.alloc(64).unwrap();
        let foreign = Box::new(0u64);
        let addr = std::ptr::from_ref(&*foreign) as usize;
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| heap.locate(addr)));
        assert!(result.is_err());
        // Safety: Test code.
        unsafe { heap.free(ptr) };
    }

    #[test]
    fn test_excessive_size() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut heap = core(false);
        assert!(matches!(
            heap.alloc(GENERIC_MAX_DIRECT_MAPPED + 1),
            Err(AllocError::ExcessiveSize { .. })
        ));
        assert!(matches!(heap.alloc(usize::MAX), Err(AllocError::ExcessiveSize { .. })));
    }

    #[test]
    fn test_drop_releases_counters() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut heap = core(false);
        let small = heap.alloc(100).unwrap();
        let large = heap.alloc(GENERIC_MAX_BUCKETED + 1).unwrap();
        assert!(heap.counters.committed > 0);
        assert_eq!(heap.direct_maps.len(), 1);
        let _ = (small, large);
        drop(heap);
    }
}
