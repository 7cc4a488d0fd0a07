#[cfg(not(target_pointer_width = "64"))]
compile_error!("partition-heap supports only 64-bit targets.");

pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod memory;

// heaps
pub use memory::heap::{FixedHeap, GenericHeap, GlobalPartitionHeap};
pub use memory::config::HeapConfig;
pub use memory::purge::PurgeFlags;
pub use memory::slot_span::SpanState;

// platform paging
pub use memory::pages::{PageAccess, PageError, PageOps, PlatformPageOps};

// hooks
pub use memory::hooks::{AllocationHook, FreeHook, set_allocation_hook, set_free_hook};
pub use memory::oom::{OomHandler, out_of_memory, set_oom_handler};

// stats/diagnostics
pub use memory::bucket::num_system_pages_for_slot;
pub use memory::freelist::FreelistCodec;
pub use memory::integrity::{IntegrityError, IntegrityReport};
pub use memory::stats::{
    BucketStats, HeapStats, HeapStatsSnapshot, ProcessMemory, StatsDumper, process_memory,
};
pub use memory::super_page::SuperPageExtent;

// errors
pub use memory::error::AllocError;

// geometry
pub use memory::constants::{
    GENERIC_MAX_BUCKETED, GENERIC_MAX_DIRECT_MAPPED, PARTITION_PAGE_SIZE, SUPER_PAGE_SIZE,
    SYSTEM_PAGE_SIZE,
};
