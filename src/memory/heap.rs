//! The public heaps.
//!
//! [`FixedHeap`] serves a caller-chosen set of slot sizes and never locks:
//! every operation takes `&mut self`. [`GenericHeap`] serves any size up to
//! 2 GiB through logarithmic size classes plus direct maps, and serializes
//! every operation on one lock held for the whole call.
//!
//! # Reentrancy
//!
//! Nothing called while a heap's lock is held calls back into the heap.
//! Instrumentation hooks and [`StatsDumper`]s run after the lock is
//! released; a dumper may therefore allocate from the heap it is dumping.

use std::ptr::NonNull;

use super::bucket::SizeClasses;
use super::config::HeapConfig;
use super::error::AllocError;
use super::hooks;
use super::integrity::{IntegrityError, IntegrityReport};
use super::oom;
use super::pages::{PageOps, PlatformPageOps};
use super::partition::PartitionCore;
use super::purge::PurgeFlags;
use super::slot_span::SpanState;
use super::stats::{HeapStatsSnapshot, StatsDumper};
use super::super_page::SuperPageExtent;
use crate::sync::{OnceLock, SpinThenBlock};

fn dump(snapshot: &HeapStatsSnapshot, name: &str, dumper: &mut dyn StatsDumper) {
    for bucket in &snapshot.buckets {
        dumper.dump_bucket(name, bucket);
    }
    dumper.dump_totals(name, &snapshot.totals);
}

/// Fire the hooks of a successful realloc: the old pointer is reported
/// freed and the result allocated, even when the two are the same.
fn realloc_hooks(old: Option<NonNull<u8>>, new: Option<NonNull<u8>>, size: usize, tag: &str) {
    if let Some(old) = old {
        hooks::on_free(old);
    }
    if let Some(new) = new {
        hooks::on_allocation(new, size, tag);
    }
}

/// A heap over a fixed set of slot sizes, for single-threaded use.
pub struct FixedHeap<P: PageOps = PlatformPageOps> {
    core: PartitionCore<P>,
}

impl FixedHeap<PlatformPageOps> {
    /// Create a heap serving exactly `slot_sizes` (ascending, multiples of 8).
    ///
    /// # Errors
    ///
    /// Returns `AllocError::InitializationFailed` for invalid slot sizes.
    pub fn new(slot_sizes: &[usize]) -> Result<Self, AllocError> {
        Self::with_config(slot_sizes, HeapConfig::default())
    }

    /// # Errors
    ///
    /// As [`FixedHeap::new`].
    pub fn with_config(slot_sizes: &[usize], config: HeapConfig) -> Result<Self, AllocError> {
        Self::with_page_ops(slot_sizes, config)
    }
}

impl<P: PageOps> FixedHeap<P> {
    /// Create a heap whose pages come from `P` instead of the platform.
    ///
    /// # Errors
    ///
    /// Returns `AllocError::InitializationFailed` for invalid slot sizes or
    /// an OS page larger than the heap's system page.
    pub fn with_page_ops(slot_sizes: &[usize], config: HeapConfig) -> Result<Self, AllocError> {
        let classes = SizeClasses::fixed(slot_sizes)?;
        Ok(Self {
            core: PartitionCore::new(classes, config)?,
        })
    }

    /// # Errors
    ///
    /// `ExcessiveSize` above the largest slot size, `OutOfMemory` when the OS
    /// refuses address space or memory.
    pub fn try_alloc(&mut self, size: usize, tag: &str) -> Result<NonNull<u8>, AllocError> {
        let ptr = self.core.alloc(size)?;
        hooks::on_allocation(ptr, size, tag);
        Ok(ptr)
    }

    /// Like [`try_alloc`](Self::try_alloc), but failure goes to the
    /// out-of-memory handler and does not return.
    pub fn alloc(&mut self, size: usize, tag: &str) -> NonNull<u8> {
        self.try_alloc(size, tag)
            .unwrap_or_else(|err| oom::out_of_memory(&err))
    }

    /// # Safety
    /// `ptr` must be a live allocation of this heap.
    ///
    /// # Panics
    /// If `ptr` was not allocated by this heap or on a detected double free.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
        hooks::on_free(ptr);
        // Safety: forwarded from the caller.
        unsafe { self.core.free(ptr) };
    }

    /// # Safety
    /// `ptr`, if present, must be a live allocation of this heap.
    ///
    /// # Errors
    ///
    /// As [`try_alloc`](Self::try_alloc). The original allocation is left
    /// untouched on error.
    pub unsafe fn try_realloc(
        &mut self,
        ptr: Option<NonNull<u8>>,
        size: usize,
        tag: &str,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        // Safety: forwarded from the caller.
        let new = unsafe { self.core.realloc(ptr, size) }?;
        realloc_hooks(ptr, new, size, tag);
        Ok(new)
    }

    /// # Safety
    /// `ptr`, if present, must be a live allocation of this heap.
    pub unsafe fn realloc(&mut self, ptr: Option<NonNull<u8>>, size: usize, tag: &str) -> Option<NonNull<u8>> {
        // Safety: forwarded from the caller.
        unsafe { self.try_realloc(ptr, size, tag) }.unwrap_or_else(|err| oom::out_of_memory(&err))
    }

    /// Usable size an allocation of `size` bytes would get.
    pub fn actual_size(&self, size: usize) -> usize {
        self.core.actual_size(size)
    }

    /// Usable size of a live allocation.
    pub fn allocation_size(&self, ptr: NonNull<u8>) -> usize {
        self.core.allocation_size(ptr)
    }

    pub fn span_state(&self, ptr: NonNull<u8>) -> SpanState {
        self.core.span_state(ptr)
    }

    pub fn purge_memory(&mut self, flags: PurgeFlags) {
        self.core.purge_memory(flags);
    }

    pub fn dump_stats(&mut self, name: &str, light: bool, dumper: &mut dyn StatsDumper) {
        let snapshot = self.core.collect_stats(light);
        dump(&snapshot, name, dumper);
    }

    pub fn stats(&mut self) -> HeapStatsSnapshot {
        self.core.collect_stats(false)
    }

    /// Runs of contiguous super pages, in reservation order.
    pub fn super_page_extents(&self) -> Vec<SuperPageExtent> {
        self.core.super_pages.extents.clone()
    }

    /// # Errors
    ///
    /// Returns the first inconsistency the freelist walk finds.
    pub fn check_integrity(&self) -> Result<IntegrityReport, IntegrityError> {
        self.core.check_integrity()
    }
}

/// A thread-safe heap serving every size up to 2 GiB.
pub struct GenericHeap<P: PageOps = PlatformPageOps> {
    core: SpinThenBlock<PartitionCore<P>>,
}

impl GenericHeap<PlatformPageOps> {
    /// # Errors
    ///
    /// Returns `AllocError::InitializationFailed` if the OS page is larger
    /// than the heap's system page.
    pub fn new() -> Result<Self, AllocError> {
        Self::with_config(HeapConfig::default())
    }

    /// # Errors
    ///
    /// As [`GenericHeap::new`].
    pub fn with_config(config: HeapConfig) -> Result<Self, AllocError> {
        Self::with_page_ops(config)
    }
}

impl<P: PageOps> GenericHeap<P> {
    /// Create a heap whose pages come from `P` instead of the platform.
    ///
    /// # Errors
    ///
    /// As [`GenericHeap::new`].
    pub fn with_page_ops(config: HeapConfig) -> Result<Self, AllocError> {
        let spins = config.lock_spins;
        let core = PartitionCore::new(SizeClasses::generic(), config)?;
        Ok(Self {
            core: SpinThenBlock::new(core, spins),
        })
    }

    /// # Errors
    ///
    /// `ExcessiveSize` above 2 GiB plus one allocation granule, `OutOfMemory`
    /// when the OS refuses address space or memory.
    pub fn try_alloc(&self, size: usize, tag: &str) -> Result<NonNull<u8>, AllocError> {
        let ptr = self.core.lock().alloc(size)?;
        hooks::on_allocation(ptr, size, tag);
        Ok(ptr)
    }

    /// Like [`try_alloc`](Self::try_alloc), but failure goes to the
    /// out-of-memory handler and does not return.
    pub fn alloc(&self, size: usize, tag: &str) -> NonNull<u8> {
        self.try_alloc(size, tag)
            .unwrap_or_else(|err| oom::out_of_memory(&err))
    }

    /// # Safety
    /// `ptr` must be a live allocation of this heap.
    ///
    /// # Panics
    /// If `ptr` was not allocated by this heap or on a detected double free.
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        hooks::on_free(ptr);
        // Safety: forwarded from the caller.
        unsafe { self.core.lock().free(ptr) };
    }

    /// Resize an allocation in one critical section. `None` allocates;
    /// size 0 frees and returns `None`.
    ///
    /// # Safety
    /// `ptr`, if present, must be a live allocation of this heap.
    ///
    /// # Errors
    ///
    /// As [`try_alloc`](Self::try_alloc). The original allocation is left
    /// untouched on error.
    pub unsafe fn try_realloc(
        &self,
        ptr: Option<NonNull<u8>>,
        size: usize,
        tag: &str,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        // Safety: forwarded from the caller.
        let new = unsafe { self.core.lock().realloc(ptr, size) }?;
        realloc_hooks(ptr, new, size, tag);
        Ok(new)
    }

    /// # Safety
    /// `ptr`, if present, must be a live allocation of this heap.
    pub unsafe fn realloc(&self, ptr: Option<NonNull<u8>>, size: usize, tag: &str) -> Option<NonNull<u8>> {
        // Safety: forwarded from the caller.
        unsafe { self.try_realloc(ptr, size, tag) }.unwrap_or_else(|err| oom::out_of_memory(&err))
    }

    pub fn actual_size(&self, size: usize) -> usize {
        self.core.lock().actual_size(size)
    }

    pub fn allocation_size(&self, ptr: NonNull<u8>) -> usize {
        self.core.lock().allocation_size(ptr)
    }

    pub fn span_state(&self, ptr: NonNull<u8>) -> SpanState {
        self.core.lock().span_state(ptr)
    }

    pub fn purge_memory(&self, flags: PurgeFlags) {
        self.core.lock().purge_memory(flags);
    }

    /// Collect statistics under the lock, then hand them to `dumper` with the
    /// lock released.
    pub fn dump_stats(&self, name: &str, light: bool, dumper: &mut dyn StatsDumper) {
        let snapshot = self.core.lock().collect_stats(light);
        dump(&snapshot, name, dumper);
    }

    pub fn stats(&self) -> HeapStatsSnapshot {
        self.core.lock().collect_stats(false)
    }

    /// Runs of contiguous super pages, in reservation order.
    pub fn super_page_extents(&self) -> Vec<SuperPageExtent> {
        self.core.lock().super_pages.extents.clone()
    }

    /// # Errors
    ///
    /// Returns the first inconsistency the freelist walk finds.
    pub fn check_integrity(&self) -> Result<IntegrityReport, IntegrityError> {
        self.core.lock().check_integrity()
    }
}

static GLOBAL_HEAP: OnceLock<GenericHeap> = OnceLock::new();

/// A process-wide [`GenericHeap`], created on first use.
///
/// Heap metadata lives in ordinary collections, so this must not be
/// installed as the `#[global_allocator]`.
pub struct GlobalPartitionHeap;

impl GlobalPartitionHeap {
    /// The shared heap. Initialization failure is fatal.
    pub fn get() -> &'static GenericHeap {
        GLOBAL_HEAP.get_or_init(|| {
            GenericHeap::new().unwrap_or_else(|err| oom::out_of_memory(&err))
        })
    }

    pub fn alloc(size: usize, tag: &str) -> NonNull<u8> {
        Self::get().alloc(size, tag)
    }

    /// # Safety
    /// `ptr` must be a live allocation of the global heap.
    pub unsafe fn free(ptr: NonNull<u8>) {
        // Safety: forwarded from the caller.
        unsafe { Self::get().free(ptr) };
    }

    /// # Safety
    /// `ptr`, if present, must be a live allocation of the global heap.
    pub unsafe fn realloc(ptr: Option<NonNull<u8>>, size: usize, tag: &str) -> Option<NonNull<u8>> {
        // Safety: forwarded from the caller.
        unsafe { Self::get().realloc(ptr, size, tag) }
    }

    pub fn purge_memory(flags: PurgeFlags) {
        if let Some(heap) = GLOBAL_HEAP.get() {
            heap.purge_memory(flags);
        }
    }
}
