//! Thread-bound dispatch loop
//!
//! A thread becomes a dispatch thread by calling [`Dispatcher::prepare`] and
//! then [`Dispatcher::run`]. The loop pulls due tasks from the thread's
//! [`TaskQueue`] and hands each one to the handle that sent it, until the
//! queue quits.

use crate::config::DispatcherConfig;
use crate::error::{DispatchError, DispatchResult};
use crate::scheduler::{TaskPool, TaskQueue};
use crate::sys::{EventPoller, SystemClock};
use once_cell::sync::OnceCell;
use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, Thread, ThreadId};
use std::time::Instant;
use tracing::{debug, warn};

/// Per-thread registration. Dropping it at thread exit shuts the queue
/// down, since no thread is left to run what is pending.
struct ThreadSlot {
    dispatcher: RefCell<Option<Dispatcher>>,
}

impl Drop for ThreadSlot {
    fn drop(&mut self) {
        if let Some(dispatcher) = self.dispatcher.get_mut().take() {
            let dropped = dispatcher.inner.queue.abandon();
            debug!(name = dispatcher.name(), dropped, "dispatch thread exited");
        }
    }
}

thread_local! {
    static CURRENT: ThreadSlot = ThreadSlot {
        dispatcher: RefCell::new(None),
    };
}

static MAIN: OnceCell<Dispatcher> = OnceCell::new();

/// Dispatcher statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    /// Tasks handed to their target so far
    pub tasks_dispatched: u64,

    /// Dispatches that ran longer than the configured threshold
    pub slow_dispatches: u64,

    /// Tasks (barriers included) still queued
    pub pending: usize,
}

struct DispatcherInner {
    queue: Arc<TaskQueue>,
    thread: Thread,
    config: DispatcherConfig,
    in_loop: AtomicBool,
    terminated: AtomicBool,
    tasks_dispatched: AtomicU64,
    slow_dispatches: AtomicU64,
}

/// Owner of one thread's task queue.
///
/// Cloning is cheap; every clone refers to the same dispatcher. When the
/// owning thread exits, the queue is shut down as if by [`quit`](Self::quit):
/// pending tasks are dropped and later sends return `Ok(false)`. This also
/// applies to the main dispatcher, whose queue otherwise never quits.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    /// Give the calling thread a dispatcher with default settings
    pub fn prepare() -> DispatchResult<Dispatcher> {
        Self::prepare_with(DispatcherConfig::default())
    }

    /// Give the calling thread a dispatcher configured by `config`
    pub fn prepare_with(config: DispatcherConfig) -> DispatchResult<Dispatcher> {
        Self::install(config, true)
    }

    /// Give the calling thread the process-wide main dispatcher.
    ///
    /// The main dispatcher can never quit.
    pub fn prepare_main() -> DispatchResult<Dispatcher> {
        Self::prepare_main_with(DispatcherConfig::default())
    }

    /// Same as [`prepare_main`](Self::prepare_main) with explicit settings
    pub fn prepare_main_with(config: DispatcherConfig) -> DispatchResult<Dispatcher> {
        let dispatcher = Self::install(config, false)?;
        MAIN.set(dispatcher.clone())
            .map_err(|_| DispatchError::MainAlreadyPrepared)?;
        debug!(thread = ?dispatcher.thread_id(), "main dispatcher prepared");
        Ok(dispatcher)
    }

    /// Dispatcher of the calling thread
    pub fn current() -> DispatchResult<Dispatcher> {
        // the slot is already gone while the thread is being torn down
        CURRENT
            .try_with(|slot| slot.dispatcher.borrow().clone())
            .ok()
            .flatten()
            .ok_or(DispatchError::NotPrepared)
    }

    /// The main dispatcher, if one was prepared
    pub fn main() -> Option<Dispatcher> {
        MAIN.get().cloned()
    }

    /// Run the calling thread's dispatch loop until its queue quits
    pub fn run() -> DispatchResult<()> {
        Self::current()?.run_loop()
    }

    /// Stop the loop, dropping every pending task
    pub fn quit(&self) -> DispatchResult<()> {
        self.inner.queue.quit(false)
    }

    /// Stop the loop once the tasks already due have run
    pub fn quit_safely(&self) -> DispatchResult<()> {
        self.inner.queue.quit(true)
    }

    /// Queue owned by this dispatcher
    pub fn queue(&self) -> Arc<TaskQueue> {
        Arc::clone(&self.inner.queue)
    }

    /// Thread the dispatcher belongs to
    pub fn thread(&self) -> &Thread {
        &self.inner.thread
    }

    /// Id of the thread the dispatcher belongs to
    pub fn thread_id(&self) -> ThreadId {
        self.inner.thread.id()
    }

    /// Whether the caller runs on this dispatcher's thread
    pub fn is_current_thread(&self) -> bool {
        thread::current().id() == self.thread_id()
    }

    /// Settings this dispatcher was prepared with
    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    /// Snapshot of the dispatch counters
    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            tasks_dispatched: self.inner.tasks_dispatched.load(Ordering::Relaxed),
            slow_dispatches: self.inner.slow_dispatches.load(Ordering::Relaxed),
            pending: self.inner.queue.len(),
        }
    }

    /// Whether both values refer to the same dispatcher
    pub fn ptr_eq(&self, other: &Dispatcher) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn install(config: DispatcherConfig, quit_allowed: bool) -> DispatchResult<Dispatcher> {
        config.validate()?;

        CURRENT.with(|slot| {
            let mut current = slot.dispatcher.borrow_mut();
            if current.is_some() {
                return Err(DispatchError::AlreadyPrepared);
            }

            let pool = match config.pool_capacity {
                Some(capacity) => Arc::new(TaskPool::new(capacity)),
                None => TaskPool::shared(),
            };
            let queue = TaskQueue::with_parts(
                quit_allowed,
                Arc::new(SystemClock::new()),
                Arc::new(EventPoller::new()),
                pool,
            );

            let dispatcher = Dispatcher {
                inner: Arc::new(DispatcherInner {
                    queue: Arc::new(queue),
                    thread: thread::current(),
                    config,
                    in_loop: AtomicBool::new(false),
                    terminated: AtomicBool::new(false),
                    tasks_dispatched: AtomicU64::new(0),
                    slow_dispatches: AtomicU64::new(0),
                }),
            };
            debug!(
                name = dispatcher.name(),
                quit_allowed,
                thread = ?dispatcher.thread_id(),
                "dispatcher prepared"
            );

            *current = Some(dispatcher.clone());
            Ok(dispatcher)
        })
    }

    fn run_loop(&self) -> DispatchResult<()> {
        if self.inner.terminated.load(Ordering::Acquire) {
            return Err(DispatchError::LoopTerminated);
        }

        let was_looping = self.inner.in_loop.swap(true, Ordering::AcqRel);
        if was_looping {
            warn!(
                name = self.name(),
                "entering the dispatch loop again; queued tasks will run before the current one completes"
            );
        }
        let _guard = LoopGuard {
            flag: &self.inner.in_loop,
            restore: was_looping,
        };

        debug!(name = self.name(), "dispatch loop entered");
        let slow_threshold = self.inner.config.slow_dispatch_threshold();

        while let Some(task) = self.inner.queue.fetch_next() {
            let started = Instant::now();
            if let Some(target) = task.target() {
                target.dispatch(&task);
            }
            let elapsed = started.elapsed();

            self.inner.tasks_dispatched.fetch_add(1, Ordering::Relaxed);
            if let Some(threshold) = slow_threshold {
                if elapsed > threshold {
                    self.inner.slow_dispatches.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        name = self.name(),
                        what = task.what(),
                        callback = task.callback().is_some(),
                        elapsed_ms = elapsed.as_millis() as u64,
                        "slow dispatch"
                    );
                }
            }

            self.inner.queue.recycle(task);
        }

        self.inner.terminated.store(true, Ordering::Release);
        debug!(
            name = self.name(),
            dispatched = self.inner.tasks_dispatched.load(Ordering::Relaxed),
            "dispatch loop exited"
        );
        Ok(())
    }

    fn name(&self) -> &str {
        self.inner.config.name.as_deref().unwrap_or("unnamed")
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("name", &self.name())
            .field("thread", &self.thread_id())
            .field("quit_allowed", &self.inner.queue.is_quit_allowed())
            .field("queue", &self.inner.queue)
            .finish()
    }
}

/// Restores the in-loop flag when `run_loop` returns or unwinds
struct LoopGuard<'a> {
    flag: &'a AtomicBool,
    restore: bool,
}

impl Drop for LoopGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(self.restore, Ordering::Release);
    }
}
