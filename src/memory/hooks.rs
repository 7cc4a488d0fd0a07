//! Process-wide allocation and free observers.
//!
//! With no hook installed, the heaps pay one relaxed load per call. Hooks
//! run after the heap lock is released and may allocate.

use std::ptr::NonNull;

use crate::sync::RwLock;
use crate::sync::atomic::{AtomicBool, Ordering};

pub type AllocationHook = fn(NonNull<u8>, usize, &str);
pub type FreeHook = fn(NonNull<u8>);

crate::sync::static_atomic! {
    static HOOKS_ENABLED: AtomicBool = AtomicBool::new(false);
}
crate::sync::static_rwlock! {
    static ALLOCATION_HOOK: RwLock<Option<AllocationHook>> = RwLock::new(None);
}
crate::sync::static_rwlock! {
    static FREE_HOOK: RwLock<Option<FreeHook>> = RwLock::new(None);
}

fn refresh_enabled() {
    let enabled = read(&ALLOCATION_HOOK).is_some() || read(&FREE_HOOK).is_some();
    HOOKS_ENABLED.store(enabled, Ordering::Release);
}

#[inline]
fn read<T: Copy>(slot: &RwLock<Option<T>>) -> Option<T> {
    *slot.read().unwrap_or_else(crate::sync::PoisonError::into_inner)
}

fn replace<T>(slot: &RwLock<Option<T>>, hook: Option<T>) -> Option<T> {
    let mut guard = slot.write().unwrap_or_else(crate::sync::PoisonError::into_inner);
    std::mem::replace(&mut *guard, hook)
}

/// Install (or with `None`, remove) the hook called after every
/// allocation with the pointer, the requested size and the caller's tag.
/// Returns the previous hook.
pub fn set_allocation_hook(hook: Option<AllocationHook>) -> Option<AllocationHook> {
    let previous = replace(&ALLOCATION_HOOK, hook);
    refresh_enabled();
    previous
}

/// Install (or remove) the hook called before every free.
pub fn set_free_hook(hook: Option<FreeHook>) -> Option<FreeHook> {
    let previous = replace(&FREE_HOOK, hook);
    refresh_enabled();
    previous
}

#[inline]
pub(crate) fn on_allocation(ptr: NonNull<u8>, size: usize, tag: &str) {
    if HOOKS_ENABLED.load(Ordering::Relaxed) {
        if let Some(hook) = read(&ALLOCATION_HOOK) {
            hook(ptr, size, tag);
        }
    }
}

#[inline]
pub(crate) fn on_free(ptr: NonNull<u8>) {
    if HOOKS_ENABLED.load(Ordering::Relaxed) {
        if let Some(hook) = read(&FREE_HOOK) {
            hook(ptr);
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::sync::atomic::AtomicUsize;

    static ALLOCATIONS: AtomicUsize = AtomicUsize::new(0);
    static FREES: AtomicUsize = AtomicUsize::new(0);

    fn count_allocation(_: NonNull<u8>, size: usize, tag: &str) {
        assert_eq!(tag, "hooks");
        ALLOCATIONS.fetch_add(size, Ordering::Relaxed);
    }

    fn count_free(_: NonNull<u8>) {
        FREES.fetch_add(1, Ordering::Relaxed);
    }

    #[test]
    fn test_hooks_fire_until_removed() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        ALLOCATIONS.store(0, Ordering::Relaxed);
        FREES.store(0, Ordering::Relaxed);
        let ptr = NonNull::<u8>::dangling();

        assert!(set_allocation_hook(Some(count_allocation)).is_none());
        set_free_hook(Some(count_free));
        on_allocation(ptr, 24, "hooks");
        on_free(ptr);
        assert_eq!(ALLOCATIONS.load(Ordering::Relaxed), 24);
        assert_eq!(FREES.load(Ordering::Relaxed), 1);

        assert!(set_allocation_hook(None).is_some());
        on_allocation(ptr, 24, "hooks");
        on_free(ptr);
        assert_eq!(ALLOCATIONS.load(Ordering::Relaxed), 24);
        assert_eq!(FREES.load(Ordering::Relaxed), 2);

        set_free_hook(None);
        assert!(!HOOKS_ENABLED.load(Ordering::Relaxed));
    }
}
