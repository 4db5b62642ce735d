//! Task Scheduler - Single-Thread Dispatch
//!
//! A dispatch thread owns one [`TaskQueue`] through its [`Dispatcher`] and
//! runs due tasks one at a time. Producers on any thread submit work through
//! a [`TaskHandle`]; retired queue nodes go back to a bounded [`TaskPool`].

mod dispatcher;
mod handle;
mod idle;
mod pool;
mod queue;
mod task;

pub use dispatcher::{Dispatcher, DispatcherStats};
pub use handle::{same_runnable, Callback, TaskHandle, TaskHandleBuilder, TaskHandler};
pub use idle::IdleHandler;
pub use pool::{TaskPool, DEFAULT_POOL_CAPACITY};
pub use queue::TaskQueue;
pub use task::{Runnable, Task, TaskObject};
