//! The process-wide out-of-memory handler.

use super::error::AllocError;
use crate::sync::RwLock;

pub type OomHandler = fn(&AllocError);

crate::sync::static_rwlock! {
    static OOM_HANDLER: RwLock<Option<OomHandler>> = RwLock::new(None);
}

/// Install a handler run before the process aborts on an allocation failure.
/// Returns the previous handler.
pub fn set_oom_handler(handler: Option<OomHandler>) -> Option<OomHandler> {
    let mut guard = OOM_HANDLER
        .write()
        .unwrap_or_else(crate::sync::PoisonError::into_inner);
    std::mem::replace(&mut *guard, handler)
}

/// Report an unrecoverable allocation failure and abort.
///
/// The handler may unwind instead of returning; if it returns, the process
/// aborts.
#[cold]
#[inline(never)]
pub fn out_of_memory(err: &AllocError) -> ! {
    tracing::error!(%err, "allocation failed");
    let handler = *OOM_HANDLER
        .read()
        .unwrap_or_else(crate::sync::PoisonError::into_inner);
    if let Some(handler) = handler {
        handler(err);
    }
    std::process::abort()
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    fn panicking_handler(err: &AllocError) {
        panic!("oom: {err}");
    }

    #[test]
    fn test_handler_runs_before_abort() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        let previous = set_oom_handler(Some(panicking_handler));
        let result = std::panic::catch_unwind(|| {
            out_of_memory(&AllocError::ExcessiveSize { size: 10, max: 5 });
        });
        set_oom_handler(previous);

        let payload = result.unwrap_err();
        let message = payload.downcast_ref::<String>().unwrap();
        assert!(message.starts_with("oom: "), "{message}");
    }
}
