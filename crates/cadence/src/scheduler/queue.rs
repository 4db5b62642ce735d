//! Time-ordered task queue
//!
//! Pending tasks form a singly-linked chain sorted by due time. A sync
//! barrier sitting at the head of the chain hides every synchronous task
//! behind it, so only asynchronous tasks can be fetched until the barrier is
//! removed. All state lives behind one mutex that is only held for short
//! sections; the dispatch thread sleeps in the [`Poller`] with the lock
//! released.

use crate::error::{DispatchError, DispatchResult};
use crate::scheduler::{IdleHandler, Runnable, Task, TaskHandle, TaskObject, TaskPool};
use crate::sys::{Clock, EventPoller, Poller, SystemClock};
use parking_lot::Mutex;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

/// State guarded by the queue lock
struct QueueState {
    /// Earliest pending task
    head: Option<Box<Task>>,

    /// Number of nodes in the chain, barriers included
    len: usize,

    /// Registered idle handlers
    idle_handlers: Vec<Arc<dyn IdleHandler>>,

    /// Set once by `quit`, never cleared
    quitting: bool,

    /// Dispatch thread is (about to be) waiting with no task ready
    blocked: bool,

    /// Poller released after the final `fetch_next`
    disposed: bool,

    /// Token handed out by the next `post_sync_barrier`
    next_barrier_token: i32,
}

/// Time-ordered queue of pending tasks for one dispatch thread.
///
/// Any thread may enqueue, cancel, post or remove barriers, and quit.
/// Only the owning dispatch thread may call [`fetch_next`](Self::fetch_next).
pub struct TaskQueue {
    state: Mutex<QueueState>,
    quit_allowed: bool,
    poller: Arc<dyn Poller>,
    clock: Arc<dyn Clock>,
    pool: Arc<TaskPool>,
}

impl TaskQueue {
    /// Create a queue on the system clock, sharing the process-wide pool
    pub fn new(quit_allowed: bool) -> Self {
        Self::with_parts(
            quit_allowed,
            Arc::new(SystemClock::new()),
            Arc::new(EventPoller::new()),
            TaskPool::shared(),
        )
    }

    /// Create a queue from explicit collaborators
    pub fn with_parts(
        quit_allowed: bool,
        clock: Arc<dyn Clock>,
        poller: Arc<dyn Poller>,
        pool: Arc<TaskPool>,
    ) -> Self {
        Self {
            state: Mutex::new(QueueState {
                head: None,
                len: 0,
                idle_handlers: Vec::new(),
                quitting: false,
                blocked: false,
                disposed: false,
                next_barrier_token: 0,
            }),
            quit_allowed,
            poller,
            clock,
            pool,
        }
    }

    /// Current uptime according to this queue's clock
    pub fn uptime_millis(&self) -> i64 {
        self.clock.uptime_millis()
    }

    /// Pool that retired tasks go back to
    pub fn pool(&self) -> &Arc<TaskPool> {
        &self.pool
    }

    /// Whether `quit` may be called on this queue
    pub fn is_quit_allowed(&self) -> bool {
        self.quit_allowed
    }

    /// Whether `quit` has been called
    pub fn is_quitting(&self) -> bool {
        self.state.lock().quitting
    }

    /// Number of pending tasks, barriers included
    pub fn len(&self) -> usize {
        self.state.lock().len
    }

    /// Whether nothing is pending
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the queue is empty or its first task (maybe a barrier) is not due yet
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock();
        let now = self.clock.uptime_millis();
        state.head.as_ref().map_or(true, |head| now < head.when)
    }

    /// Register a handler to run when the dispatch thread goes idle
    pub fn add_idle_handler(&self, handler: Arc<dyn IdleHandler>) {
        self.state.lock().idle_handlers.push(handler);
    }

    /// Unregister an idle handler. Unknown handlers are ignored.
    pub fn remove_idle_handler(&self, handler: &Arc<dyn IdleHandler>) {
        let mut state = self.state.lock();
        if let Some(index) = state
            .idle_handlers
            .iter()
            .position(|registered| same_arc(registered, handler))
        {
            state.idle_handlers.remove(index);
        }
    }

    /// Insert `task` to run at `when`.
    ///
    /// Returns `Ok(false)` when the queue is quitting; the task is recycled.
    /// A task equal in time to queued tasks runs after them, unless `when` is
    /// zero or earlier than the head, in which case it becomes the new head.
    pub fn enqueue(&self, mut task: Box<Task>, when: i64) -> DispatchResult<bool> {
        if task.target().is_none() {
            return Err(DispatchError::MissingTarget);
        }
        if task.is_in_use() {
            return Err(DispatchError::TaskInUse);
        }

        let mut state = self.state.lock();
        if state.quitting {
            drop(state);
            warn!(what = task.what(), "sending task to a dispatcher that is quitting");
            self.pool.release(task);
            return Ok(false);
        }

        task.mark_in_use();
        task.when = when;

        let becomes_head = match state.head.as_deref() {
            None => true,
            Some(head) => when == 0 || when < head.when,
        };

        let need_wake = if becomes_head {
            task.next = state.head.take();
            state.head = Some(task);
            state.blocked
        } else {
            // Only an async task behind a head barrier can change what the
            // dispatch thread will fetch, and only if no async task is ahead.
            let head_is_barrier = state.head.as_deref().map_or(false, Task::is_barrier);
            let mut wake = state.blocked && head_is_barrier && task.is_asynchronous();
            let mut index = 1;
            for queued in chain(&state.head).skip(1) {
                if when < queued.when {
                    break;
                }
                if wake && queued.is_asynchronous() {
                    wake = false;
                }
                index += 1;
            }
            insert_at(&mut state.head, index, task);
            wake
        };
        state.len += 1;
        drop(state);

        if need_wake {
            self.poller.wake();
        }
        Ok(true)
    }

    /// Block until a task is due and return it.
    ///
    /// Returns `None` once the queue has quit and nothing due remains; every
    /// later call also returns `None`. Tasks still queued at that point
    /// (sync tasks stuck behind a barrier) are dropped. Idle handlers run at
    /// most once per call, the first time nothing is ready.
    ///
    /// Only one thread may fetch from a queue. [`Dispatcher::run`] does so on
    /// the dispatcher's own thread; queues built with
    /// [`with_parts`](Self::with_parts) can be driven directly by whichever
    /// single thread owns them, without a prepared dispatcher.
    ///
    /// [`Dispatcher::run`]: crate::Dispatcher::run
    pub fn fetch_next(&self) -> Option<Box<Task>> {
        if self.state.lock().disposed {
            return None;
        }

        // None until idle handlers have been counted for this call
        let mut pending_idle_count: Option<usize> = None;
        let mut next_poll_timeout: i32 = 0;

        loop {
            self.poller.poll_once(next_poll_timeout);

            let idlers = {
                let mut state = self.state.lock();
                let now = self.clock.uptime_millis();

                match next_candidate(&state.head) {
                    Some((index, when)) if now >= when => {
                        if let Some(mut task) = unlink_at(&mut state.head, index) {
                            state.blocked = false;
                            state.len -= 1;
                            task.mark_in_use();
                            trace!(when, now, "fetched task");
                            return Some(task);
                        }
                    }
                    Some((_, when)) => next_poll_timeout = poll_timeout(when - now),
                    None => next_poll_timeout = -1,
                }

                if state.quitting {
                    // whatever is left is masked by a barrier and can never run
                    let leftover = Self::dispose_locked(&mut state);
                    drop(state);
                    self.poller.dispose();
                    let leftover = self.pool.release_chain(leftover);
                    debug!(leftover, "task queue drained after quit");
                    return None;
                }

                let head_in_future = state.head.as_ref().map_or(true, |head| now < head.when);
                if pending_idle_count.is_none() && head_in_future {
                    pending_idle_count = Some(state.idle_handlers.len());
                }
                let count = pending_idle_count.unwrap_or(0);
                if count == 0 {
                    state.blocked = true;
                    continue;
                }

                state.idle_handlers[..count].to_vec()
            };

            for idler in &idlers {
                let keep = match panic::catch_unwind(AssertUnwindSafe(|| idler.queue_idle())) {
                    Ok(keep) => keep,
                    Err(_) => {
                        error!("idle handler panicked; removing it");
                        false
                    }
                };
                if !keep {
                    self.remove_idle_handler(idler);
                }
            }

            // handlers ran; new tasks may be ready, so poll without waiting
            pending_idle_count = Some(0);
            next_poll_timeout = 0;
        }
    }

    /// Post a sync barrier at the current time, returning its token
    pub fn post_sync_barrier(&self) -> i32 {
        self.post_sync_barrier_at(self.clock.uptime_millis())
    }

    /// Post a sync barrier at `when`, returning its token.
    ///
    /// The barrier goes after every task due at or before `when`; a barrier
    /// at time zero always becomes the head. Never wakes the dispatch thread.
    pub fn post_sync_barrier_at(&self, when: i64) -> i32 {
        let mut barrier = self.pool.acquire();

        let mut state = self.state.lock();
        let token = state.next_barrier_token;
        state.next_barrier_token = state.next_barrier_token.wrapping_add(1);
        barrier.make_barrier(when, token);

        let index = if when != 0 {
            chain(&state.head).take_while(|queued| queued.when <= when).count()
        } else {
            0
        };
        insert_at(&mut state.head, index, barrier);
        state.len += 1;

        trace!(token, when, "posted sync barrier");
        token
    }

    /// Remove the sync barrier identified by `token`.
    ///
    /// Wakes the dispatch thread only if the barrier was the head and the new
    /// head is not another barrier.
    pub fn remove_sync_barrier(&self, token: i32) -> DispatchResult<()> {
        let mut state = self.state.lock();
        let index = chain(&state.head)
            .position(|queued| queued.is_barrier() && queued.arg1() == token)
            .ok_or(DispatchError::BarrierNotFound(token))?;

        let barrier = unlink_at(&mut state.head, index);
        state.len -= 1;
        let need_wake = index == 0
            && !state.quitting
            && state.head.as_deref().map_or(true, |head| !head.is_barrier());
        drop(state);

        if let Some(barrier) = barrier {
            self.pool.release(barrier);
        }
        if need_wake {
            self.poller.wake();
        }
        trace!(token, need_wake, "removed sync barrier");
        Ok(())
    }

    /// Remove every pending task sent by `owner` with code `what`.
    ///
    /// When `obj` is given, only tasks carrying that same object match.
    pub fn remove_tasks(&self, owner: &TaskHandle, what: i32, obj: Option<&TaskObject>) -> usize {
        self.remove_where(|task| {
            is_owned_by(task, owner) && task.callback().is_none() && task.what() == what && obj_matches(task, obj)
        })
    }

    /// Remove every pending closure `runnable` posted by `owner`
    pub fn remove_callbacks(
        &self,
        owner: &TaskHandle,
        runnable: &Runnable,
        obj: Option<&TaskObject>,
    ) -> usize {
        self.remove_where(|task| {
            is_owned_by(task, owner) && callback_matches(task, runnable) && obj_matches(task, obj)
        })
    }

    /// Remove every pending task and closure sent by `owner`
    pub fn remove_callbacks_and_tasks(&self, owner: &TaskHandle, obj: Option<&TaskObject>) -> usize {
        self.remove_where(|task| is_owned_by(task, owner) && obj_matches(task, obj))
    }

    /// Whether `owner` has a pending task with code `what`
    pub fn has_tasks(&self, owner: &TaskHandle, what: i32, obj: Option<&TaskObject>) -> bool {
        let state = self.state.lock();
        let found = chain(&state.head).any(|task| {
            is_owned_by(task, owner) && task.callback().is_none() && task.what() == what && obj_matches(task, obj)
        });
        found
    }

    /// Whether `owner` has `runnable` pending
    pub fn has_callbacks(&self, owner: &TaskHandle, runnable: &Runnable, obj: Option<&TaskObject>) -> bool {
        let state = self.state.lock();
        let found = chain(&state.head).any(|task| {
            is_owned_by(task, owner) && callback_matches(task, runnable) && obj_matches(task, obj)
        });
        found
    }

    /// Stop accepting tasks and wake the dispatch thread.
    ///
    /// With `safe`, tasks already due stay queued and are still delivered;
    /// everything due later is dropped. Otherwise all pending tasks are
    /// dropped. Calling it again has no effect.
    pub fn quit(&self, safe: bool) -> DispatchResult<()> {
        if !self.quit_allowed {
            return Err(DispatchError::QuitNotAllowed);
        }

        let dropped = {
            let mut state = self.state.lock();
            if state.quitting {
                return Ok(());
            }
            state.quitting = true;

            let dropped = if safe {
                let now = self.clock.uptime_millis();
                detach_future(&mut state.head, now)
            } else {
                state.head.take()
            };
            state.len = chain(&state.head).count();
            dropped
        };

        let dropped = self.pool.release_chain(dropped);
        debug!(safe, dropped, "task queue quitting");

        self.poller.wake();
        Ok(())
    }

    /// Shut the queue down for good after its dispatch thread went away.
    ///
    /// Pending tasks are dropped, later sends are rejected and the poller is
    /// disposed. Returns how many tasks were dropped.
    pub(crate) fn abandon(&self) -> usize {
        let leftover = {
            let mut state = self.state.lock();
            state.quitting = true;
            Self::dispose_locked(&mut state)
        };
        self.poller.dispose();
        self.pool.release_chain(leftover)
    }

    fn dispose_locked(state: &mut QueueState) -> Option<Box<Task>> {
        state.disposed = true;
        state.blocked = false;
        state.len = 0;
        state.head.take()
    }

    /// Return a dispatched task to the pool
    pub(crate) fn recycle(&self, task: Box<Task>) {
        self.pool.release(task);
    }

    fn remove_where<F>(&self, mut matches: F) -> usize
    where
        F: FnMut(&Task) -> bool,
    {
        let removed = {
            let mut state = self.state.lock();
            let removed = detach_where(&mut state.head, &mut matches);
            state.len -= removed.len();
            removed
        };

        // payload drops run without the queue lock
        let count = removed.len();
        for task in removed {
            self.pool.release(task);
        }
        count
    }
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TaskQueue")
            .field("len", &state.len)
            .field("quitting", &state.quitting)
            .field("blocked", &state.blocked)
            .field("idle_handlers", &state.idle_handlers.len())
            .finish()
    }
}

/// Iterate the chain from `head`
fn chain(head: &Option<Box<Task>>) -> impl Iterator<Item = &Task> {
    std::iter::successors(head.as_deref(), |task| task.next.as_deref())
}

/// Link slot at position `index` (or the tail slot if the chain is shorter)
fn link_at(head: &mut Option<Box<Task>>, index: usize) -> &mut Option<Box<Task>> {
    let mut link = head;
    for _ in 0..index {
        match link {
            Some(node) => link = &mut node.next,
            None => break,
        }
    }
    link
}

fn insert_at(head: &mut Option<Box<Task>>, index: usize, mut task: Box<Task>) {
    let link = link_at(head, index);
    task.next = link.take();
    *link = Some(task);
}

fn unlink_at(head: &mut Option<Box<Task>>, index: usize) -> Option<Box<Task>> {
    let link = link_at(head, index);
    let mut node = link.take()?;
    *link = node.next.take();
    Some(node)
}

/// Cut the chain before the first task due after `now`
fn detach_future(head: &mut Option<Box<Task>>, now: i64) -> Option<Box<Task>> {
    let index = chain(head).position(|task| task.when > now)?;
    link_at(head, index).take()
}

/// Unlink every task matching `matches`, keeping the others in order
fn detach_where<F>(head: &mut Option<Box<Task>>, matches: &mut F) -> Vec<Box<Task>>
where
    F: FnMut(&Task) -> bool,
{
    let mut removed = Vec::new();
    let mut link = head;
    loop {
        let hit = match link.as_deref() {
            Some(task) => matches(task),
            None => break,
        };
        if hit {
            if let Some(mut task) = link.take() {
                *link = task.next.take();
                removed.push(task);
            }
        } else if let Some(node) = link {
            link = &mut node.next;
        }
    }
    removed
}

/// Position and due time of the task the dispatch thread would run next.
///
/// With a barrier at the head that is the first asynchronous task behind it.
fn next_candidate(head: &Option<Box<Task>>) -> Option<(usize, i64)> {
    let first = head.as_deref()?;
    if first.is_barrier() {
        chain(head)
            .enumerate()
            .skip(1)
            .find(|(_, task)| task.is_asynchronous())
            .map(|(index, task)| (index, task.when))
    } else {
        Some((0, first.when))
    }
}

fn poll_timeout(millis: i64) -> i32 {
    millis.clamp(0, i64::from(i32::MAX)) as i32
}

fn is_owned_by(task: &Task, owner: &TaskHandle) -> bool {
    task.target().map_or(false, |target| target.ptr_eq(owner))
}

fn callback_matches(task: &Task, runnable: &Runnable) -> bool {
    task.callback().map_or(false, |callback| same_arc(callback, runnable))
}

fn obj_matches(task: &Task, obj: Option<&TaskObject>) -> bool {
    match obj {
        None => true,
        Some(obj) => task.obj().map_or(false, |carried| same_arc(carried, obj)),
    }
}

/// Pointer identity for trait-object `Arc`s, ignoring vtables
pub(crate) fn same_arc<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[derive(Default)]
    struct CountingPoller {
        inner: EventPoller,
        wakes: AtomicUsize,
    }

    impl CountingPoller {
        fn wakes(&self) -> usize {
            self.wakes.load(Ordering::SeqCst)
        }
    }

    impl Poller for CountingPoller {
        fn poll_once(&self, timeout_millis: i32) {
            self.inner.poll_once(timeout_millis);
        }

        fn wake(&self) {
            self.wakes.fetch_add(1, Ordering::SeqCst);
            self.inner.wake();
        }

        fn dispose(&self) {
            self.inner.dispose();
        }
    }

    struct Fixture {
        queue: Arc<TaskQueue>,
        clock: Arc<ManualClock>,
        poller: Arc<CountingPoller>,
        pool: Arc<TaskPool>,
        handle: TaskHandle,
    }

    fn fixture(now: i64) -> Fixture {
        let clock = Arc::new(ManualClock::new(now));
        let poller = Arc::new(CountingPoller::default());
        let pool = Arc::new(TaskPool::new(50));
        let queue = Arc::new(TaskQueue::with_parts(
            true,
            clock.clone(),
            poller.clone(),
            pool.clone(),
        ));
        let handle = TaskHandle::builder(queue.clone()).build();
        Fixture {
            queue,
            clock,
            poller,
            pool,
            handle,
        }
    }

    fn routed(handle: &TaskHandle, what: i32, asynchronous: bool) -> Box<Task> {
        let mut task = Box::new(Task::new());
        task.set_target(Some(handle.clone()));
        task.set_what(what);
        task.set_asynchronous(asynchronous);
        task
    }

    fn drain_whats(queue: &TaskQueue) -> Vec<i32> {
        let mut whats = Vec::new();
        while !queue.is_empty() {
            match queue.fetch_next() {
                Some(task) => whats.push(task.what()),
                None => break,
            }
        }
        whats
    }

    #[test]
    fn test_enqueue_keeps_time_order() {
        let f = fixture(100);
        f.queue.enqueue(routed(&f.handle, 1, false), 30).unwrap();
        f.queue.enqueue(routed(&f.handle, 2, false), 10).unwrap();
        f.queue.enqueue(routed(&f.handle, 3, false), 20).unwrap();
        f.queue.enqueue(routed(&f.handle, 4, false), 10).unwrap();

        assert_eq!(f.queue.len(), 4);
        assert_eq!(drain_whats(&f.queue), vec![2, 4, 3, 1]);
    }

    #[test]
    fn test_equal_times_keep_insertion_order() {
        let f = fixture(100);
        for what in 0..5 {
            f.queue.enqueue(routed(&f.handle, what, false), 50).unwrap();
        }
        assert_eq!(drain_whats(&f.queue), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_zero_time_goes_to_front() {
        let f = fixture(100);
        f.queue.enqueue(routed(&f.handle, 1, false), 0).unwrap();
        f.queue.enqueue(routed(&f.handle, 2, false), 5).unwrap();
        f.queue.enqueue(routed(&f.handle, 3, false), 0).unwrap();

        assert_eq!(drain_whats(&f.queue), vec![3, 1, 2]);
    }

    #[test]
    fn test_enqueue_rejects_contract_violations() {
        let f = fixture(0);
        let orphan = Box::new(Task::new());
        assert_eq!(f.queue.enqueue(orphan, 0), Err(DispatchError::MissingTarget));

        let mut busy = routed(&f.handle, 1, false);
        busy.mark_in_use();
        assert_eq!(f.queue.enqueue(busy, 0), Err(DispatchError::TaskInUse));
        assert!(f.queue.is_empty());
    }

    #[test]
    fn test_fetch_skips_sync_behind_barrier() {
        let f = fixture(100);
        let token = f.queue.post_sync_barrier_at(0);
        f.queue.enqueue(routed(&f.handle, 1, false), 50).unwrap();
        f.queue.enqueue(routed(&f.handle, 2, true), 50).unwrap();

        let first = f.queue.fetch_next().unwrap();
        assert_eq!(first.what(), 2);
        assert!(f.queue.has_tasks(&f.handle, 1, None));

        f.queue.remove_sync_barrier(token).unwrap();
        let second = f.queue.fetch_next().unwrap();
        assert_eq!(second.what(), 1);
        assert!(f.queue.is_empty());
    }

    #[test]
    fn test_barrier_placement() {
        let f = fixture(100);
        f.queue.enqueue(routed(&f.handle, 1, false), 10).unwrap();
        f.queue.enqueue(routed(&f.handle, 2, false), 20).unwrap();
        let token = f.queue.post_sync_barrier_at(10);

        // the task at 10 is ahead of the barrier, the one at 20 is masked
        assert_eq!(f.queue.fetch_next().unwrap().what(), 1);
        assert!(!f.queue.is_idle());
        f.queue.remove_sync_barrier(token).unwrap();
        assert_eq!(f.queue.fetch_next().unwrap().what(), 2);
    }

    #[test]
    fn test_barrier_tokens_increase() {
        let f = fixture(100);
        let a = f.queue.post_sync_barrier();
        let b = f.queue.post_sync_barrier();
        let c = f.queue.post_sync_barrier_at(0);
        assert!(a < b && b < c);

        f.queue.remove_sync_barrier(b).unwrap();
        assert_eq!(f.queue.remove_sync_barrier(b), Err(DispatchError::BarrierNotFound(b)));
        assert_eq!(f.queue.len(), 2);
    }

    #[test]
    fn test_posting_barrier_never_wakes() {
        let f = fixture(100);
        f.queue.state.lock().blocked = true;
        f.queue.post_sync_barrier();
        f.queue.post_sync_barrier_at(0);
        assert_eq!(f.poller.wakes(), 0);
    }

    #[test]
    fn test_head_insert_wakes_only_when_blocked() {
        let f = fixture(100);
        f.queue.enqueue(routed(&f.handle, 1, false), 50).unwrap();
        assert_eq!(f.poller.wakes(), 0);

        f.queue.state.lock().blocked = true;
        f.queue.enqueue(routed(&f.handle, 2, false), 40).unwrap();
        assert_eq!(f.poller.wakes(), 1);

        // behind the head, no barrier: no wake
        f.queue.enqueue(routed(&f.handle, 3, true), 60).unwrap();
        assert_eq!(f.poller.wakes(), 1);
    }

    #[test]
    fn test_async_behind_barrier_wakes_once() {
        let f = fixture(100);
        f.queue.post_sync_barrier_at(0);
        f.queue.state.lock().blocked = true;

        f.queue.enqueue(routed(&f.handle, 1, false), 10).unwrap();
        assert_eq!(f.poller.wakes(), 0);

        f.queue.enqueue(routed(&f.handle, 2, true), 20).unwrap();
        assert_eq!(f.poller.wakes(), 1);

        // an async task is already ahead of this one
        f.queue.enqueue(routed(&f.handle, 3, true), 30).unwrap();
        assert_eq!(f.poller.wakes(), 1);

        // but one placed before it still wakes
        f.queue.enqueue(routed(&f.handle, 4, true), 15).unwrap();
        assert_eq!(f.poller.wakes(), 2);
    }

    #[test]
    fn test_remove_barrier_wake_rules() {
        let f = fixture(100);
        let first = f.queue.post_sync_barrier_at(0);
        let second = f.queue.post_sync_barrier_at(5);
        f.queue.enqueue(routed(&f.handle, 1, false), 10).unwrap();
        let third = f.queue.post_sync_barrier_at(20);

        // mid-chain removal never wakes
        f.queue.remove_sync_barrier(third).unwrap();
        assert_eq!(f.poller.wakes(), 0);

        // head removal with another barrier behind it does not wake
        f.queue.remove_sync_barrier(first).unwrap();
        assert_eq!(f.poller.wakes(), 0);

        // head removal exposing a normal task wakes
        f.queue.remove_sync_barrier(second).unwrap();
        assert_eq!(f.poller.wakes(), 1);
        assert_eq!(f.queue.len(), 1);
    }

    #[test]
    fn test_remove_tasks_by_owner_and_what() {
        let f = fixture(100);
        let other = TaskHandle::builder(f.queue.clone()).build();

        f.queue.enqueue(routed(&f.handle, 42, false), 10).unwrap();
        f.queue.enqueue(routed(&f.handle, 7, false), 20).unwrap();
        f.queue.enqueue(routed(&other, 42, false), 30).unwrap();
        f.queue.enqueue(routed(&f.handle, 42, false), 40).unwrap();
        f.queue.enqueue(routed(&f.handle, 8, false), 50).unwrap();

        let removed = f.queue.remove_tasks(&f.handle, 42, None);
        assert_eq!(removed, 2);
        assert_eq!(f.queue.len(), 3);
        assert_eq!(f.pool.len(), 2);

        let remaining: Vec<(bool, i32)> = std::iter::from_fn(|| {
            if f.queue.is_empty() {
                None
            } else {
                f.queue.fetch_next()
            }
        })
        .map(|task| (task.target().unwrap().ptr_eq(&f.handle), task.what()))
        .collect();
        assert_eq!(remaining, vec![(true, 7), (false, 42), (true, 8)]);
    }

    #[test]
    fn test_remove_tasks_by_object() {
        let f = fixture(100);
        let marker: TaskObject = Arc::new("marker");
        let other: TaskObject = Arc::new("other");

        let mut with_marker = routed(&f.handle, 1, false);
        with_marker.set_obj(Some(marker.clone()));
        let mut with_other = routed(&f.handle, 1, false);
        with_other.set_obj(Some(other.clone()));
        f.queue.enqueue(with_marker, 10).unwrap();
        f.queue.enqueue(with_other, 20).unwrap();

        assert!(f.queue.has_tasks(&f.handle, 1, Some(&marker)));
        assert_eq!(f.queue.remove_tasks(&f.handle, 1, Some(&marker)), 1);
        assert!(!f.queue.has_tasks(&f.handle, 1, Some(&marker)));
        assert!(f.queue.has_tasks(&f.handle, 1, Some(&other)));
    }

    #[test]
    fn test_remove_callbacks_by_identity() {
        let f = fixture(100);
        let keep: Runnable = Arc::new(|| {});
        let cancel: Runnable = Arc::new(|| {});

        for (runnable, when) in [(&cancel, 10), (&keep, 20), (&cancel, 30)] {
            let mut task = routed(&f.handle, 0, false);
            task.set_callback(Some(runnable.clone()));
            f.queue.enqueue(task, when).unwrap();
        }
        // a routed task with the same what must survive
        f.queue.enqueue(routed(&f.handle, 0, false), 40).unwrap();

        assert!(f.queue.has_callbacks(&f.handle, &cancel, None));
        assert_eq!(f.queue.remove_callbacks(&f.handle, &cancel, None), 2);
        assert!(!f.queue.has_callbacks(&f.handle, &cancel, None));
        assert!(f.queue.has_callbacks(&f.handle, &keep, None));
        assert!(f.queue.has_tasks(&f.handle, 0, None));

        assert_eq!(f.queue.remove_callbacks_and_tasks(&f.handle, None), 2);
        assert!(f.queue.is_empty());
    }

    #[test]
    fn test_quit_not_allowed() {
        let queue = TaskQueue::with_parts(
            false,
            Arc::new(ManualClock::new(0)),
            Arc::new(EventPoller::new()),
            Arc::new(TaskPool::new(4)),
        );
        assert_eq!(queue.quit(false), Err(DispatchError::QuitNotAllowed));
        assert_eq!(queue.quit(true), Err(DispatchError::QuitNotAllowed));
        assert!(!queue.is_quitting());
    }

    #[test]
    fn test_quit_is_idempotent_and_rejects_new_tasks() {
        let f = fixture(100);
        f.queue.enqueue(routed(&f.handle, 1, false), 10).unwrap();

        f.queue.quit(false).unwrap();
        assert_eq!(f.poller.wakes(), 1);
        f.queue.quit(false).unwrap();
        assert_eq!(f.poller.wakes(), 1);
        assert!(f.queue.is_empty());
        assert_eq!(f.pool.len(), 1);

        assert_eq!(f.queue.enqueue(routed(&f.handle, 2, false), 10), Ok(false));
        assert!(f.queue.is_empty());
        assert_eq!(f.pool.len(), 2);

        assert!(f.queue.fetch_next().is_none());
        assert!(f.queue.fetch_next().is_none());
        assert!(f.poller.inner.is_disposed());
    }

    #[test]
    fn test_safe_quit_keeps_due_tasks() {
        let f = fixture(8);
        for when in [5, 10, 15] {
            f.queue.enqueue(routed(&f.handle, when as i32, false), when).unwrap();
        }

        f.queue.quit(true).unwrap();
        assert_eq!(f.queue.len(), 1);
        assert_eq!(f.pool.len(), 2);

        assert_eq!(f.queue.fetch_next().unwrap().what(), 5);
        assert!(f.queue.fetch_next().is_none());
    }

    #[test]
    fn test_safe_quit_releases_masked_tasks() {
        let f = fixture(100);
        f.queue.post_sync_barrier_at(50);
        f.queue.enqueue(routed(&f.handle, 1, false), 60).unwrap();

        // both are due, so a safe quit keeps them, but the barrier masks the task
        f.queue.quit(true).unwrap();
        assert_eq!(f.queue.len(), 2);

        assert!(f.queue.fetch_next().is_none());
        assert_eq!(f.queue.len(), 0);
        assert_eq!(f.pool.len(), 2);

        // no task holds a handle to the queue any more
        let Fixture { queue, handle, .. } = f;
        let weak = Arc::downgrade(&queue);
        drop(handle);
        drop(queue);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_abandon_drops_pending_and_rejects_sends() {
        let f = fixture(100);
        f.queue.post_sync_barrier();
        f.queue.enqueue(routed(&f.handle, 1, false), 500).unwrap();
        f.queue.enqueue(routed(&f.handle, 2, false), 90).unwrap();

        assert_eq!(f.queue.abandon(), 3);
        assert!(f.queue.is_empty());
        assert!(f.queue.is_quitting());
        assert!(f.poller.inner.is_disposed());
        assert_eq!(f.queue.enqueue(routed(&f.handle, 3, false), 0), Ok(false));
        assert!(f.queue.fetch_next().is_none());
    }

    #[test]
    fn test_safe_quit_at_time_zero_drops_future() {
        let f = fixture(0);
        f.queue.enqueue(routed(&f.handle, 0, false), 0).unwrap();
        for when in [5, 10, 15] {
            f.queue.enqueue(routed(&f.handle, when as i32, false), when).unwrap();
        }

        f.queue.quit(true).unwrap();
        assert_eq!(f.queue.len(), 1);
        assert_eq!(f.queue.fetch_next().unwrap().when(), 0);
        assert!(f.queue.fetch_next().is_none());
    }

    #[test]
    fn test_idle_handler_runs_once_and_can_produce_work() {
        let f = fixture(100);
        let calls = Arc::new(AtomicUsize::new(0));

        let handle = f.handle.clone();
        let queue = f.queue.clone();
        let counter = calls.clone();
        let idler: Arc<dyn IdleHandler> = Arc::new(move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                queue.enqueue(routed(&handle, 9, false), 100).unwrap();
            }
            true
        });
        f.queue.add_idle_handler(idler.clone());

        let task = f.queue.fetch_next().unwrap();
        assert_eq!(task.what(), 9);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        f.queue.remove_idle_handler(&idler);
        f.queue.quit(false).unwrap();
        assert!(f.queue.fetch_next().is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_idle_handler_once_per_fetch() {
        let f = fixture(100);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        f.queue.add_idle_handler(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        }));

        // due 20ms of manual time from now; the clock is moved by another thread
        f.queue.enqueue(routed(&f.handle, 1, false), 120).unwrap();
        let clock = f.clock.clone();
        let mover = thread::spawn(move || {
            thread::sleep(Duration::from_millis(80));
            clock.set(120);
        });

        let task = f.queue.fetch_next().unwrap();
        mover.join().unwrap();
        assert_eq!(task.what(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_idle_handler_returning_false_is_removed() {
        let f = fixture(100);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        f.queue.add_idle_handler(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            false
        }));
        f.queue.add_idle_handler(Arc::new(|| -> bool { panic!("idle handler failure") }));

        // the empty queue goes idle, then quits from another thread
        let queue = f.queue.clone();
        let quitter = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            queue.quit(false).unwrap();
        });
        assert!(f.queue.fetch_next().is_none());
        quitter.join().unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(f.queue.state.lock().idle_handlers.is_empty());
    }

    #[test]
    fn test_blocked_fetch_is_woken_by_enqueue() {
        let f = fixture(100);
        let queue = f.queue.clone();
        let handle = f.handle.clone();

        let producer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            queue.enqueue(routed(&handle, 5, false), 100).unwrap();
        });

        let task = f.queue.fetch_next().unwrap();
        producer.join().unwrap();
        assert_eq!(task.what(), 5);
        assert!(!f.queue.state.lock().blocked);
    }

    #[test]
    fn test_is_idle() {
        let f = fixture(100);
        assert!(f.queue.is_idle());

        f.queue.enqueue(routed(&f.handle, 1, false), 150).unwrap();
        assert!(f.queue.is_idle());

        f.clock.set(150);
        assert!(!f.queue.is_idle());
    }
}
