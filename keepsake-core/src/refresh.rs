//! Ambient lazy-refresh flag.
//!
//! [`with_lazy_refresh`] scopes a task-local boolean observed by
//! [`PersistentProperties::get_lazy`](crate::properties::PersistentProperties::get_lazy):
//! while the flag is set, memoized lazy values are discarded and their
//! computations re-invoked. The flag rides the task-local mechanism, so it
//! survives suspension points inside the block and is restored on every exit
//! path, including panics and cancellation.

use std::future::Future;

tokio::task_local! {
    static LAZY_REFRESH: bool;
}

/// Run `block` with the lazy-refresh flag set.
///
/// Every memoized lazy property read during the block is re-evaluated from
/// its originating computation. Code running outside the block, including
/// the continuation after it returns, observes the flag as unset.
pub async fn with_lazy_refresh<F: Future>(block: F) -> F::Output {
    LAZY_REFRESH.scope(true, block).await
}

/// Whether the current task is inside a [`with_lazy_refresh`] scope.
#[must_use]
pub fn is_lazy_refresh_active() -> bool {
    LAZY_REFRESH.try_with(|active| *active).unwrap_or(false)
}
