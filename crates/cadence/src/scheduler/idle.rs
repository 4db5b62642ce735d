//! Idle handlers: work run when the dispatch thread is about to sleep

/// Callback invoked when the queue has nothing due.
///
/// Called at most once per [`TaskQueue::fetch_next`](crate::TaskQueue::fetch_next)
/// invocation, on the dispatch thread, without the queue lock held. This
/// happens when the queue is empty or when the first pending task
/// (possibly a sync barrier) is scheduled in the future.
pub trait IdleHandler: Send + Sync {
    /// Return `true` to stay registered, `false` to be removed
    fn queue_idle(&self) -> bool;
}

impl<F> IdleHandler for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn queue_idle(&self) -> bool {
        self()
    }
}
