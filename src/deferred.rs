use crate::cell::{Cell, CellId, State};
use crate::resolve::{settlers, Reject, Resolution, Resolve, Thenable};
use crate::scheduler::Runtime;
use crate::{Reason, Value};
use std::fmt::{Debug, Formatter};
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::trace;

/// A value that is settled exactly once, now or later.
///
/// Clones share the same cell. Outside code can only read it; settling goes
/// through the [`Resolve`]/[`Reject`] pair handed to the initializer.
///
/// # Examples
///
/// ```
/// use deferred_out::{Deferred, Resolution, Runtime, State, TaskQueue};
///
/// let queue = TaskQueue::new();
/// let runtime = Runtime::new(queue.clone());
///
/// let failed = Deferred::<i32, String>::new(&runtime, |_resolve, reject| {
///     reject.reject("good rejection reason".into());
///     Err("damn!".into()) // ignored, already rejected
/// });
/// let recovered = failed.then_rejected(|reason| Ok(Resolution::Value(reason.len() as i32)));
///
/// queue.run_until_idle();
/// assert_eq!(failed.state(), State::Rejected("good rejection reason".into()));
/// assert_eq!(recovered.state(), State::Fulfilled(21));
/// ```
pub struct Deferred<T: Value, E: Reason> {
    cell: Arc<Cell<T, E>>,
    runtime: Runtime,
}

impl<T: Value, E: Reason> Clone for Deferred<T, E> {
    fn clone(&self) -> Self {
        Deferred {
            cell: self.cell.clone(),
            runtime: self.runtime.clone(),
        }
    }
}

impl<T: Value + Debug, E: Reason + Debug> Debug for Deferred<T, E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deferred")
            .field("id", &self.cell.id())
            .field("state", &self.cell.snapshot())
            .field("observers", &self.cell.pending_observers())
            .finish()
    }
}

impl<T: Value, E: Reason> Deferred<T, E> {
    /// Runs `initializer` right away with the only handles able to settle
    /// the new value. An `Err` from the initializer rejects, unless the
    /// handles were already used.
    pub fn new<F>(runtime: &Runtime, initializer: F) -> Self
    where
        F: FnOnce(Resolve<T, E>, Reject<T, E>) -> Result<(), E>,
    {
        let cell = Cell::new();
        let (resolve, reject) = settlers(&cell, runtime.config());
        if let Err(reason) = initializer(resolve, reject.clone()) {
            reject.reject(reason);
        }
        Deferred {
            cell,
            runtime: runtime.clone(),
        }
    }

    pub fn resolved(runtime: &Runtime, value: T) -> Self {
        Self::new(runtime, move |resolve, _| {
            resolve.resolve(value);
            Ok(())
        })
    }

    pub fn rejected(runtime: &Runtime, reason: E) -> Self {
        Self::new(runtime, move |_, reject| {
            reject.reject(reason);
            Ok(())
        })
    }

    pub fn id(&self) -> CellId {
        self.cell.id()
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> State<T, E> {
        self.cell.snapshot()
    }

    pub fn is_pending(&self) -> bool {
        self.cell.state_is(State::is_pending)
    }

    pub fn is_fulfilled(&self) -> bool {
        self.cell.state_is(State::is_fulfilled)
    }

    pub fn is_rejected(&self) -> bool {
        self.cell.state_is(State::is_rejected)
    }

    /// Chains a new deferred onto this one.
    ///
    /// Once this value settles, the matching handler runs as its own
    /// scheduled task, never inline, even if this value had already settled
    /// when `then` was called. `Ok` resolves the returned deferred (adopting
    /// it if it is a thenable), `Err` rejects it. Handlers chained on the same
    /// value run in the order they were chained.
    pub fn then<U, F, R>(&self, on_fulfilled: F, on_rejected: R) -> Deferred<U, E>
    where
        U: Value,
        F: FnOnce(T) -> Result<Resolution<U, E>, E> + Send + 'static,
        R: FnOnce(E) -> Result<Resolution<U, E>, E> + Send + 'static,
    {
        let cell = Cell::new();
        let (resolve, reject) = settlers(&cell, self.runtime.config());
        trace!(parent = %self.cell.id(), child = %cell.id(), "chained");

        let runtime = self.runtime.clone();
        self.cell.register(Box::new(move |outcome| {
            runtime.schedule(Box::new(move || {
                let next = match outcome {
                    Ok(value) => on_fulfilled(value),
                    Err(reason) => on_rejected(reason),
                };
                match next {
                    Ok(resolution) => resolve.resolve_with(resolution),
                    Err(reason) => reject.reject(reason),
                }
            }));
        }));

        Deferred {
            cell,
            runtime: self.runtime.clone(),
        }
    }

    /// `then` with rejections passed through unchanged.
    pub fn then_fulfilled<U, F>(&self, on_fulfilled: F) -> Deferred<U, E>
    where
        U: Value,
        F: FnOnce(T) -> Result<Resolution<U, E>, E> + Send + 'static,
    {
        self.then(on_fulfilled, Err)
    }

    /// `then` with fulfillments passed through unchanged.
    pub fn then_rejected<R>(&self, on_rejected: R) -> Deferred<T, E>
    where
        R: FnOnce(E) -> Result<Resolution<T, E>, E> + Send + 'static,
    {
        self.then(|value| Ok(Resolution::Value(value)), on_rejected)
    }

    /// `then` with no handlers: a new deferred mirroring this one a turn
    /// later.
    pub fn forward(&self) -> Deferred<T, E> {
        self.then(|value| Ok(Resolution::Value(value)), Err)
    }

    /// Waits for the outcome without scheduling anything.
    pub fn settled(&self) -> Settled<T, E> {
        Settled {
            cell: self.cell.clone(),
        }
    }
}

impl<T: Value, E: Reason> Thenable<T, E> for Deferred<T, E> {
    fn register_continuation(
        self: Box<Self>,
        resolve: Resolve<T, E>,
        reject: Reject<T, E>,
    ) -> Result<(), E> {
        resolve.follow(&self.cell);
        self.cell.register(Box::new(move |outcome| match outcome {
            Ok(value) => resolve.resolve(value),
            Err(reason) => reject.reject(reason),
        }));
        Ok(())
    }

    fn adoption_chain(&self, limit: usize) -> Vec<CellId> {
        self.cell.adoption_chain(limit)
    }
}

impl<T: Value, E: Reason> From<Deferred<T, E>> for Resolution<T, E> {
    fn from(deferred: Deferred<T, E>) -> Self {
        Resolution::adopt(deferred)
    }
}

/// Future returned by [`Deferred::settled`].
#[must_use = "futures do nothing unless polled"]
pub struct Settled<T, E> {
    cell: Arc<Cell<T, E>>,
}

impl<T: Value, E: Reason> Future for Settled<T, E> {
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.cell.poll_outcome(cx.waker())
    }
}

impl<T: Value, E: Reason> IntoFuture for Deferred<T, E> {
    type Output = Result<T, E>;
    type IntoFuture = Settled<T, E>;

    fn into_future(self) -> Self::IntoFuture {
        self.settled()
    }
}
