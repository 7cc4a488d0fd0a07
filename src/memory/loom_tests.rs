/// Loom-based concurrency tests.
///
/// Run w/ `RUSTFLAGS="--cfg loom" cargo test --lib --release`
///
/// # Design notes
///
/// Loom exhaustively enumerates thread interleavings, so:
///   - Thread counts kept to 2 (state space is exponential).
///   - Each thread does 1-2 heap operations.
///   - Every model iteration builds a fresh `GenericHeap`; under cfg(loom)
///     its pages come from the heap-backed `PageOps` mock.
///   - `GlobalPartitionHeap` is NOT tested: its OnceLock static does not
///     reset between iterations. Its locking is the `GenericHeap` lock.
///   - The lock spins before blocking; spinning multiplies the explored
///     states, so heap tests use `preemption_bound(2)` and zero spins.
#[cfg(loom)]
mod tests {
    use crate::memory::config::HeapConfig;
    use crate::memory::heap::GenericHeap;
    use crate::memory::purge::PurgeFlags;
    use crate::sync::Arc;

    fn bounded(preemption: usize) -> loom::model::Builder {
        let mut b = loom::model::Builder::new();
        b.preemption_bound = Some(preemption);
        b
    }

    fn heap() -> Arc<GenericHeap> {
        let config = HeapConfig {
            cookies: true,
            poison: true,
            lock_spins: 0,
            ..HeapConfig::default()
        };
        Arc::new(GenericHeap::with_config(config).unwrap())
    }

    // =====================================================================
    // 1. stats::Counter
    // =====================================================================

    #[test]
    fn loom_counter_concurrent_add_sub() {
        use crate::memory::stats::Counter;

        loom::model(|| {
            let counter = Arc::new(Counter::new());
            let c1 = counter.clone();
            let c2 = counter.clone();

            let t1 = loom::thread::spawn(move || {
                c1.add(10);
                c1.add(5);
            });

            let t2 = loom::thread::spawn(move || {
                c2.sub(3);
                c2.add(8);
            });

            t1.join().unwrap();
            t2.join().unwrap();

            // 10 + 5 - 3 + 8 = 20
            assert_eq!(counter.get(), 20);
        });
    }

    // =====================================================================
    // 2. GenericHeap lock
    // =====================================================================

    #[test]
    fn loom_heap_concurrent_alloc_free() {
        bounded(2).check(|| {
            let heap = heap();
            let h1 = heap.clone();
            let h2 = heap.clone();

            let t1 = loom::thread::spawn(move || {
                let ptr = h1.alloc(16, "loom");
                unsafe { h1.free(ptr) };
            });

            let t2 = loom::thread::spawn(move || {
                let ptr = h2.alloc(16, "loom");
                unsafe { h2.free(ptr) };
            });

            t1.join().unwrap();
            t2.join().unwrap();

            let report = heap.check_integrity().unwrap();
            assert_eq!(report.live_slots, 0);
        });
    }

    #[test]
    fn loom_heap_free_across_threads() {
        bounded(2).check(|| {
            let heap = heap();
            let shared = heap.alloc(100, "loom").as_ptr() as usize;
            let h1 = heap.clone();
            let h2 = heap.clone();

            // One thread frees what the main thread allocated while the
            // other allocates and purges.
            let t1 = loom::thread::spawn(move || {
                let ptr = std::ptr::NonNull::new(shared as *mut u8).unwrap();
                unsafe { h1.free(ptr) };
            });

            let t2 = loom::thread::spawn(move || {
                let ptr = h2.alloc(100, "loom");
                h2.purge_memory(PurgeFlags::all());
                ptr.as_ptr() as usize
            });

            t1.join().unwrap();
            let kept = t2.join().unwrap();

            assert_eq!(heap.check_integrity().unwrap().live_slots, 1);
            unsafe { heap.free(std::ptr::NonNull::new(kept as *mut u8).unwrap()) };
        });
    }

    #[test]
    fn loom_heap_concurrent_realloc() {
        bounded(2).check(|| {
            let heap = heap();
            let h1 = heap.clone();
            let h2 = heap.clone();

            let t1 = loom::thread::spawn(move || {
                let ptr = h1.alloc(24, "loom");
                unsafe {
                    ptr.as_ptr().write(7);
                    let grown = h1.realloc(Some(ptr), 2000, "loom").unwrap();
                    assert_eq!(grown.as_ptr().read(), 7);
                    h1.free(grown);
                }
            });

            let t2 = loom::thread::spawn(move || {
                let ptr = h2.alloc(2000, "loom");
                unsafe { h2.free(ptr) };
            });

            t1.join().unwrap();
            t2.join().unwrap();

            assert_eq!(heap.check_integrity().unwrap().live_slots, 0);
        });
    }
}
