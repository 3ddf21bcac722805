//! Single-assignment deferred values.
//!
//! A [`Deferred`] starts pending and is settled exactly once, either
//! fulfilled with a value or rejected with a reason. Continuations attached
//! with [`Deferred::then`] always run on a later turn of the injected
//! [`Scheduler`], whether they were attached before or after settlement.
//!
//! ```
//! use deferred_out::{Deferred, Resolution, Runtime, TaskQueue};
//!
//! let queue = TaskQueue::new();
//! let runtime = Runtime::new(queue.clone());
//!
//! let answer = Deferred::<i32, String>::new(&runtime, |resolve, _reject| {
//!     resolve.resolve(42);
//!     resolve.resolve(100500); // ignored
//!     Ok(())
//! });
//! let doubled = answer.then_fulfilled(|v| Ok(Resolution::Value(v * 2)));
//!
//! assert!(doubled.is_pending());
//! queue.run_until_idle();
//! assert_eq!(doubled.state().fulfilled(), Some(84));
//! ```
use thiserror::Error;

pub mod cell;
pub mod channel;
pub mod deferred;
mod dispatch;
pub mod resolve;
pub mod scheduler;

pub use cell::{CellId, State};
pub use channel::ThreadScheduler;
pub use deferred::{Deferred, Settled};
pub use resolve::{Reject, Resolution, Resolve, ThenFn, Thenable};
pub use scheduler::{Config, Runtime, Scheduler, Task, TaskQueue};

/// Failures raised by the deferred machinery itself. They reach user code as
/// rejection reasons, so every reason type converts from this.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("{cell} was resolved with a value that waits on it")]
    CircularResolution { cell: CellId },
    #[error("adoption nested deeper than {limit} thenables")]
    AdoptionDepthExceeded { limit: usize },
    #[error("every settler of {cell} was dropped before it settled")]
    SettlerDropped { cell: CellId },
}

impl From<Error> for String {
    fn from(err: Error) -> Self {
        err.to_string()
    }
}

/// Fulfillment values. Each observer receives its own clone.
pub trait Value: Clone + Send + 'static {}

impl<T: Clone + Send + 'static> Value for T {}

/// Rejection reasons.
pub trait Reason: Clone + Send + From<Error> + 'static {}

impl<E: Clone + Send + From<Error> + 'static> Reason for E {}
