use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Lock a std mutex, recovering the data if a listener panicked while holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Spawn `fut` on the current tokio runtime.
///
/// Event listeners may fire outside a runtime (a transport driven from a
/// plain thread); the task is dropped with a warning instead of panicking.
pub(crate) fn spawn<F>(fut: F) -> Option<JoinHandle<()>>
where
    F: Future<Output = ()> + Send + 'static,
{
    match Handle::try_current() {
        Ok(handle) => Some(handle.spawn(fut)),
        Err(_) => {
            log::warn!(target: crate::logger::TARGET, "[cable-link] no tokio runtime, task dropped");
            None
        },
    }
}
