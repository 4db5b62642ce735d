//! Task pool for reusing queue nodes across submissions.
//!
//! When a task has been dispatched or cancelled it is reset and pushed onto
//! a bounded free list. The next submission pops a recycled node instead of
//! allocating. Nodes beyond the capacity are simply dropped.

use crate::error::{DispatchError, DispatchResult};
use crate::scheduler::Task;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::warn;

/// Capacity of the process-wide pool
pub const DEFAULT_POOL_CAPACITY: usize = 50;

static SHARED_POOL: Lazy<Arc<TaskPool>> =
    Lazy::new(|| Arc::new(TaskPool::new(DEFAULT_POOL_CAPACITY)));

#[derive(Default)]
struct FreeList {
    /// Most recently released task
    head: Option<Box<Task>>,
    /// Number of nodes reachable from `head`
    size: usize,
}

/// Bounded free list of retired tasks
pub struct TaskPool {
    free: Mutex<FreeList>,
    capacity: usize,
}

impl TaskPool {
    /// Create a new pool that holds up to `capacity` tasks.
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Mutex::new(FreeList::default()),
            capacity,
        }
    }

    /// The process-wide pool used by dispatchers without a private one
    pub fn shared() -> Arc<TaskPool> {
        Arc::clone(&SHARED_POOL)
    }

    /// Maximum number of retained tasks
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of tasks currently available for reuse
    pub fn len(&self) -> usize {
        self.free.lock().size
    }

    /// Whether no tasks are available for reuse
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get a blank task from the pool, or allocate a new one.
    ///
    /// The returned task is not in use. If the free list turns out to be
    /// inconsistent it is thrown away and a fresh task is allocated.
    pub fn acquire(&self) -> Box<Task> {
        let mut free = self.free.lock();
        match free.head.take() {
            Some(mut task) if task.is_in_use() && free.size > 0 => {
                free.head = task.next.take();
                free.size -= 1;
                drop(free);
                task.clear_flags();
                task
            }
            Some(corrupted) => {
                let size = free.size;
                free.size = 0;
                drop(free);
                warn!(size, "task pool free list corrupted; discarding it");
                drop(corrupted);
                Box::new(Task::new())
            }
            None => {
                if free.size != 0 {
                    warn!(size = free.size, "task pool size out of sync; resetting");
                    free.size = 0;
                }
                Box::new(Task::new())
            }
        }
    }

    /// Return a task that is not in use.
    ///
    /// Fails with [`DispatchError::TaskInUse`] for tasks that are still queued
    /// or being dispatched.
    pub fn recycle(&self, task: Box<Task>) -> DispatchResult<()> {
        if task.is_in_use() {
            return Err(DispatchError::TaskInUse);
        }
        self.release(task);
        Ok(())
    }

    /// Reset a task and keep it if there is room
    pub(crate) fn release(&self, mut task: Box<Task>) {
        debug_assert!(task.next.is_none(), "released task still linked");
        // payload drops happen before taking the lock
        task.reset();

        let mut free = self.free.lock();
        if free.size < self.capacity {
            task.next = free.head.take();
            free.head = Some(task);
            free.size += 1;
        }
        // else: dropped, the pool is full
    }

    /// Release every node of a detached chain, returning how many there were
    pub(crate) fn release_chain(&self, mut chain: Option<Box<Task>>) -> usize {
        let mut count = 0;
        while let Some(mut task) = chain {
            chain = task.next.take();
            self.release(task);
            count += 1;
        }
        count
    }
}

impl Default for TaskPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY)
    }
}

impl std::fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskPool")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
