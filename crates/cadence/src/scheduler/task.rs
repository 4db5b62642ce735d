//! Task structure: the recyclable queue node

use crate::scheduler::TaskHandle;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Closure payload. Compared by pointer identity when cancelling.
pub type Runnable = Arc<dyn Fn() + Send + Sync + 'static>;

/// Opaque object carried by a task. Compared by pointer identity.
pub type TaskObject = Arc<dyn Any + Send + Sync + 'static>;

/// Set while the task is queued, executing or pooled. Cleared on obtain.
const FLAG_IN_USE: u8 = 1 << 0;

/// Exempt from sync barriers
const FLAG_ASYNCHRONOUS: u8 = 1 << 1;

/// A unit of deferred work.
///
/// A task carries either a closure ([`callback`](Self::callback)) or a routed
/// payload (`what`, `arg1`, `arg2`, `obj`) interpreted by the handle it was
/// sent through. Tasks are moved around as `Box<Task>`; at any time a task
/// is owned by exactly one of the pool, a queue, the dispatch loop, or the
/// caller that obtained it.
///
/// A task with no target is a sync barrier; its `arg1` is the barrier token.
pub struct Task {
    /// Due time in uptime milliseconds
    pub(crate) when: i64,

    /// In-use / asynchronous bits
    flags: u8,

    /// User-defined code identifying what this task is about
    what: i32,

    /// Cheap integer argument. Barrier token for barriers.
    arg1: i32,

    /// Second cheap integer argument
    arg2: i32,

    /// Arbitrary object for the recipient
    obj: Option<TaskObject>,

    /// Handle that sent the task and will dispatch it
    target: Option<TaskHandle>,

    /// Closure to run instead of routing to the handle
    callback: Option<Runnable>,

    /// Next node in the queue or the free list
    pub(crate) next: Option<Box<Task>>,
}

impl Task {
    /// Create a blank task outside of any pool
    pub fn new() -> Self {
        Self {
            when: 0,
            flags: 0,
            what: 0,
            arg1: 0,
            arg2: 0,
            obj: None,
            target: None,
            callback: None,
            next: None,
        }
    }

    /// Turn a blank task into a sync barrier carrying `token`
    pub(crate) fn make_barrier(&mut self, when: i64, token: i32) {
        self.target = None;
        self.callback = None;
        self.mark_in_use();
        self.when = when;
        self.arg1 = token;
    }

    /// Due time in uptime milliseconds (0 until enqueued)
    pub fn when(&self) -> i64 {
        self.when
    }

    /// User-defined code
    pub fn what(&self) -> i32 {
        self.what
    }

    /// Set the user-defined code
    pub fn set_what(&mut self, what: i32) {
        self.what = what;
    }

    /// First integer argument
    pub fn arg1(&self) -> i32 {
        self.arg1
    }

    /// Set the first integer argument
    pub fn set_arg1(&mut self, arg1: i32) {
        self.arg1 = arg1;
    }

    /// Second integer argument
    pub fn arg2(&self) -> i32 {
        self.arg2
    }

    /// Set the second integer argument
    pub fn set_arg2(&mut self, arg2: i32) {
        self.arg2 = arg2;
    }

    /// Object attached to the task
    pub fn obj(&self) -> Option<&TaskObject> {
        self.obj.as_ref()
    }

    /// Attach an object to the task
    pub fn set_obj(&mut self, obj: Option<TaskObject>) {
        self.obj = obj;
    }

    /// Closure payload, if any
    pub fn callback(&self) -> Option<&Runnable> {
        self.callback.as_ref()
    }

    /// Set the closure payload
    pub fn set_callback(&mut self, callback: Option<Runnable>) {
        self.callback = callback;
    }

    /// Handle that will dispatch this task
    pub fn target(&self) -> Option<&TaskHandle> {
        self.target.as_ref()
    }

    /// Set the handle that will dispatch this task
    pub fn set_target(&mut self, target: Option<TaskHandle>) {
        self.target = target;
    }

    /// Whether this task ignores sync barriers.
    ///
    /// Barriers themselves are never asynchronous.
    pub fn is_asynchronous(&self) -> bool {
        self.flags & FLAG_ASYNCHRONOUS != 0
    }

    /// Mark this task as exempt from sync barriers
    pub fn set_asynchronous(&mut self, asynchronous: bool) {
        if asynchronous {
            self.flags |= FLAG_ASYNCHRONOUS;
        } else {
            self.flags &= !FLAG_ASYNCHRONOUS;
        }
    }

    /// Whether this task is a sync barrier
    pub fn is_barrier(&self) -> bool {
        self.target.is_none()
    }

    /// Whether the task is queued, executing or pooled
    pub fn is_in_use(&self) -> bool {
        self.flags & FLAG_IN_USE == FLAG_IN_USE
    }

    pub(crate) fn mark_in_use(&mut self) {
        self.flags |= FLAG_IN_USE;
    }

    pub(crate) fn clear_flags(&mut self) {
        self.flags = 0;
    }

    /// Drop the payload and owner. Pooled tasks stay flagged in use.
    pub(crate) fn reset(&mut self) {
        self.flags = FLAG_IN_USE;
        self.when = 0;
        self.what = 0;
        self.arg1 = 0;
        self.arg2 = 0;
        self.obj = None;
        self.target = None;
        self.callback = None;
    }
}

impl Default for Task {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        // unlink iteratively so long chains don't recurse
        let mut next = self.next.take();
        while let Some(mut node) = next {
            next = node.next.take();
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Task");
        s.field("when", &self.when);
        if self.is_barrier() {
            s.field("barrier", &self.arg1);
        } else {
            if self.callback.is_some() {
                s.field("callback", &"<fn>");
            } else {
                s.field("what", &self.what);
            }
            if self.arg1 != 0 {
                s.field("arg1", &self.arg1);
            }
            if self.arg2 != 0 {
                s.field("arg2", &self.arg2);
            }
            s.field("asynchronous", &self.is_asynchronous());
        }
        s.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_task_is_free() {
        let task = Task::new();
        assert!(!task.is_in_use());
        assert!(!task.is_asynchronous());
        assert!(task.is_barrier());
        assert_eq!(task.when(), 0);
    }

    #[test]
    fn test_async_flag_is_independent_of_in_use() {
        let mut task = Task::new();
        task.set_asynchronous(true);
        task.mark_in_use();
        assert!(task.is_asynchronous());
        assert!(task.is_in_use());

        task.set_asynchronous(false);
        assert!(!task.is_asynchronous());
        assert!(task.is_in_use());
    }

    #[test]
    fn test_reset_keeps_in_use() {
        let mut task = Task::new();
        task.set_what(7);
        task.set_arg1(1);
        task.set_arg2(2);
        task.set_asynchronous(true);
        task.set_callback(Some(Arc::new(|| {})));
        task.set_obj(Some(Arc::new(5u32)));

        task.reset();

        assert!(task.is_in_use());
        assert!(!task.is_asynchronous());
        assert_eq!(task.what(), 0);
        assert_eq!(task.arg1(), 0);
        assert_eq!(task.arg2(), 0);
        assert!(task.callback().is_none());
        assert!(task.obj().is_none());
    }

    #[test]
    fn test_barrier_carries_token() {
        let mut barrier = Task::new();
        barrier.make_barrier(25, 3);
        assert!(barrier.is_barrier());
        assert!(barrier.is_in_use());
        assert!(!barrier.is_asynchronous());
        assert_eq!(barrier.arg1(), 3);
        assert_eq!(barrier.when(), 25);
    }

    #[test]
    fn test_long_chain_drops_without_recursion() {
        let mut head: Option<Box<Task>> = None;
        for _ in 0..200_000 {
            let mut node = Box::new(Task::new());
            node.next = head.take();
            head = Some(node);
        }
        drop(head);
    }
}
