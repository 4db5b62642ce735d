//! Cadence: cooperative task dispatch for a single thread
//!
//! This crate provides:
//! - A time-ordered task queue with sync barriers and idle handlers
//! - A thread-bound dispatch loop with cross-thread wake-up
//! - Handles for posting closures and routed tasks, and cancelling them
//! - A bounded pool recycling queue nodes

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod error;
pub mod scheduler;
pub mod sys;

pub use config::DispatcherConfig;
pub use error::{ConfigError, DispatchError, DispatchResult};
pub use scheduler::{
    Callback, Dispatcher, DispatcherStats, IdleHandler, Runnable, Task, TaskHandle,
    TaskHandleBuilder, TaskHandler, TaskObject, TaskPool, TaskQueue, DEFAULT_POOL_CAPACITY,
};
pub use sys::{Clock, EventPoller, ManualClock, Poller, SystemClock};
