//! Producer-side binding to a dispatcher's queue

use crate::error::DispatchResult;
use crate::scheduler::queue::same_arc;
use crate::scheduler::{Dispatcher, Runnable, Task, TaskObject, TaskQueue};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Fallback consulted before the handler for routed tasks.
///
/// Returning `true` marks the task as handled.
pub trait Callback: Send + Sync {
    /// Handle a routed task
    fn handle_task(&self, task: &Task) -> bool;
}

impl<F> Callback for F
where
    F: Fn(&Task) -> bool + Send + Sync,
{
    fn handle_task(&self, task: &Task) -> bool {
        self(task)
    }
}

/// Receiver for routed tasks that no callback handled
pub trait TaskHandler: Send + Sync {
    /// Handle a routed task
    fn handle_task(&self, task: &Task);
}

impl<F> TaskHandler for F
where
    F: Fn(&Task) + Send + Sync,
{
    fn handle_task(&self, task: &Task) {
        self(task)
    }
}

struct HandleInner {
    queue: Arc<TaskQueue>,
    callback: Option<Arc<dyn Callback>>,
    handler: Option<Arc<dyn TaskHandler>>,
    asynchronous: bool,
}

/// Handle for submitting and cancelling tasks on one dispatcher.
///
/// Any thread may use a handle. Tasks sent through it run on the
/// dispatcher's thread and are dispatched back to it. Clones share identity:
/// a task sent through one clone can be cancelled through another.
#[derive(Clone)]
pub struct TaskHandle {
    inner: Arc<HandleInner>,
}

impl TaskHandle {
    /// Handle bound to `dispatcher` with no routed-task receiver
    pub fn new(dispatcher: &Dispatcher) -> Self {
        Self::builder(dispatcher.queue()).build()
    }

    /// Handle bound to the calling thread's dispatcher
    pub fn current() -> DispatchResult<Self> {
        Dispatcher::current().map(|dispatcher| Self::new(&dispatcher))
    }

    /// Start building a handle for `queue`
    pub fn builder(queue: Arc<TaskQueue>) -> TaskHandleBuilder {
        TaskHandleBuilder {
            queue,
            callback: None,
            handler: None,
            asynchronous: false,
        }
    }

    /// Queue this handle submits to
    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.inner.queue
    }

    /// Whether tasks sent through this handle skip sync barriers
    pub fn is_asynchronous(&self) -> bool {
        self.inner.asynchronous
    }

    /// Whether `other` is this handle or a clone of it
    pub fn ptr_eq(&self, other: &TaskHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Blank task from the pool, already targeting this handle
    pub fn obtain_task(&self, what: i32) -> Box<Task> {
        let mut task = self.inner.queue.pool().acquire();
        task.set_target(Some(self.clone()));
        task.set_what(what);
        task
    }

    /// Run `runnable` as soon as possible
    pub fn post(&self, runnable: Runnable) -> DispatchResult<bool> {
        self.post_delayed(runnable, Duration::ZERO)
    }

    /// Run `runnable` after `delay`
    pub fn post_delayed(&self, runnable: Runnable, delay: Duration) -> DispatchResult<bool> {
        let task = self.callback_task(runnable, None);
        self.send_task_delayed(task, delay)
    }

    /// Run `runnable` at uptime `when` in milliseconds
    pub fn post_at_time(&self, runnable: Runnable, when: i64) -> DispatchResult<bool> {
        let task = self.callback_task(runnable, None);
        self.send_task_at_time(task, when)
    }

    /// Run `runnable` at uptime `when`, tagged with `obj` for cancellation
    pub fn post_at_time_with_obj(
        &self,
        runnable: Runnable,
        obj: TaskObject,
        when: i64,
    ) -> DispatchResult<bool> {
        let task = self.callback_task(runnable, Some(obj));
        self.send_task_at_time(task, when)
    }

    /// Run `runnable` before everything else queued
    pub fn post_at_front_of_queue(&self, runnable: Runnable) -> DispatchResult<bool> {
        let task = self.callback_task(runnable, None);
        self.send_task_at_front_of_queue(task)
    }

    /// Send a task to be dispatched as soon as possible
    pub fn send_task(&self, task: Box<Task>) -> DispatchResult<bool> {
        self.send_task_delayed(task, Duration::ZERO)
    }

    /// Send a task to be dispatched after `delay`
    pub fn send_task_delayed(&self, task: Box<Task>, delay: Duration) -> DispatchResult<bool> {
        let delay = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        let when = self.inner.queue.uptime_millis().saturating_add(delay);
        self.send_task_at_time(task, when)
    }

    /// Send a task to be dispatched at uptime `when` in milliseconds.
    ///
    /// Returns `Ok(false)` if the dispatcher is quitting.
    pub fn send_task_at_time(&self, mut task: Box<Task>, when: i64) -> DispatchResult<bool> {
        task.set_target(Some(self.clone()));
        if self.inner.asynchronous {
            task.set_asynchronous(true);
        }
        self.inner.queue.enqueue(task, when)
    }

    /// Send a task to be dispatched before everything else queued
    pub fn send_task_at_front_of_queue(&self, task: Box<Task>) -> DispatchResult<bool> {
        self.send_task_at_time(task, 0)
    }

    /// Send a task carrying only `what`
    pub fn send_empty_task(&self, what: i32) -> DispatchResult<bool> {
        self.send_empty_task_delayed(what, Duration::ZERO)
    }

    /// Send a task carrying only `what` after `delay`
    pub fn send_empty_task_delayed(&self, what: i32, delay: Duration) -> DispatchResult<bool> {
        let task = self.obtain_task(what);
        self.send_task_delayed(task, delay)
    }

    /// Cancel pending routed tasks with code `what`
    pub fn remove_tasks(&self, what: i32, obj: Option<&TaskObject>) -> usize {
        self.inner.queue.remove_tasks(self, what, obj)
    }

    /// Cancel pending posts of `runnable`
    pub fn remove_callbacks(&self, runnable: &Runnable, obj: Option<&TaskObject>) -> usize {
        self.inner.queue.remove_callbacks(self, runnable, obj)
    }

    /// Cancel everything pending from this handle, or only tasks carrying `obj`
    pub fn remove_callbacks_and_tasks(&self, obj: Option<&TaskObject>) -> usize {
        self.inner.queue.remove_callbacks_and_tasks(self, obj)
    }

    /// Whether a routed task with code `what` is pending
    pub fn has_tasks(&self, what: i32, obj: Option<&TaskObject>) -> bool {
        self.inner.queue.has_tasks(self, what, obj)
    }

    /// Whether `runnable` is pending
    pub fn has_callbacks(&self, runnable: &Runnable, obj: Option<&TaskObject>) -> bool {
        self.inner.queue.has_callbacks(self, runnable, obj)
    }

    /// Deliver a task on the dispatch thread.
    ///
    /// Closures run directly. Routed tasks go to the fallback callback first
    /// and reach the handler only if the callback did not handle them.
    pub fn dispatch(&self, task: &Task) {
        if let Some(runnable) = task.callback() {
            runnable();
            return;
        }
        if let Some(callback) = &self.inner.callback {
            if callback.handle_task(task) {
                return;
            }
        }
        if let Some(handler) = &self.inner.handler {
            handler.handle_task(task);
        }
    }

    fn callback_task(&self, runnable: Runnable, obj: Option<TaskObject>) -> Box<Task> {
        let mut task = self.inner.queue.pool().acquire();
        task.set_callback(Some(runnable));
        task.set_obj(obj);
        task
    }
}

impl PartialEq for TaskHandle {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for TaskHandle {}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &Arc::as_ptr(&self.inner))
            .field("asynchronous", &self.inner.asynchronous)
            .field("callback", &self.inner.callback.is_some())
            .field("handler", &self.inner.handler.is_some())
            .finish()
    }
}

/// Builder for [`TaskHandle`]
pub struct TaskHandleBuilder {
    queue: Arc<TaskQueue>,
    callback: Option<Arc<dyn Callback>>,
    handler: Option<Arc<dyn TaskHandler>>,
    asynchronous: bool,
}

impl TaskHandleBuilder {
    /// Fallback consulted before the handler
    pub fn callback(mut self, callback: Arc<dyn Callback>) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Receiver for routed tasks
    pub fn handler(mut self, handler: Arc<dyn TaskHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Mark every task sent through the handle as asynchronous
    pub fn asynchronous(mut self, asynchronous: bool) -> Self {
        self.asynchronous = asynchronous;
        self
    }

    /// Finish the handle
    pub fn build(self) -> TaskHandle {
        TaskHandle {
            inner: Arc::new(HandleInner {
                queue: self.queue,
                callback: self.callback,
                handler: self.handler,
                asynchronous: self.asynchronous,
            }),
        }
    }
}

/// Whether `a` and `b` are the same closure
pub fn same_runnable(a: &Runnable, b: &Runnable) -> bool {
    same_arc(a, b)
}
