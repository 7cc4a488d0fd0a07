use super::pages::PageError;

/// Failure of an allocation request.
///
/// The infallible entry points never surface this: they route it to the
/// process-wide out-of-memory handler, which does not return.
#[derive(Debug, thiserror::Error)]
pub enum AllocError {
    #[error("allocation of {size} bytes exceeds the maximum of {max}")]
    ExcessiveSize { size: usize, max: usize },
    #[error("out of memory allocating {size} bytes: {source}")]
    OutOfMemory {
        size: usize,
        #[source]
        source: PageError,
    },
    #[error("heap initialization failed: {0}")]
    InitializationFailed(String),
}

impl AllocError {
    pub(crate) fn out_of_memory(size: usize) -> impl FnOnce(PageError) -> Self {
        move |source| Self::OutOfMemory { size, source }
    }
}
