//! Host collaborators: time source and the park/wake primitive

mod clock;
mod poll;

pub use clock::{Clock, ManualClock, SystemClock};
pub use poll::{EventPoller, Poller};
