//! Wake/park primitive used by the queue to sleep between tasks.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Blocking wait with an explicit wake signal.
///
/// Implementations must be edge-triggered in the sense that a `wake()` that
/// lands before `poll_once()` starts makes that `poll_once()` return
/// immediately. A signal is consumed by the poll that observes it.
pub trait Poller: Send + Sync {
    /// Wait until woken or until `timeout_millis` elapses.
    ///
    /// `0` returns immediately, a negative value waits until woken.
    fn poll_once(&self, timeout_millis: i32);

    /// Wake the thread blocked in `poll_once`, or the next one to call it
    fn wake(&self);

    /// Release the primitive. Later polls return immediately.
    fn dispose(&self);
}

#[derive(Debug, Default)]
struct EventState {
    /// Wake requested and not yet consumed
    signaled: bool,
    /// Disposed by the owning queue
    disposed: bool,
}

/// Condvar-backed poller with a sticky wake flag
#[derive(Debug, Default)]
pub struct EventPoller {
    state: Mutex<EventState>,
    cond: Condvar,
}

impl EventPoller {
    /// Create a new poller with no pending wake
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `dispose` has been called
    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }
}

impl Poller for EventPoller {
    fn poll_once(&self, timeout_millis: i32) {
        let mut state = self.state.lock();
        if state.disposed {
            return;
        }

        if timeout_millis < 0 {
            while !state.signaled && !state.disposed {
                self.cond.wait(&mut state);
            }
        } else if timeout_millis > 0 {
            let deadline = Instant::now() + Duration::from_millis(timeout_millis as u64);
            while !state.signaled && !state.disposed {
                if self.cond.wait_until(&mut state, deadline).timed_out() {
                    break;
                }
            }
        }

        state.signaled = false;
    }

    fn wake(&self) {
        let mut state = self.state.lock();
        state.signaled = true;
        self.cond.notify_one();
    }

    fn dispose(&self) {
        let mut state = self.state.lock();
        state.disposed = true;
        self.cond.notify_all();
    }
}
