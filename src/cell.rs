//! The settlement cell: state, outcome and the guards that make both
//! write-once.
use crate::dispatch::{Observer, Observers};
use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Poll, Waker};
use tracing::{debug, trace};

/// Process-unique identity of a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CellId(u64);

impl CellId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        CellId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl Display for CellId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "deferred#{}", self.0)
    }
}

/// Where a deferred value is in its lifecycle. Only `Pending` ever changes,
/// and only once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State<T, E> {
    Pending,
    Fulfilled(T),
    Rejected(E),
}

impl<T, E> State<T, E> {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    pub fn is_fulfilled(&self) -> bool {
        matches!(self, Self::Fulfilled(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }

    /// The fulfillment value, if any.
    pub fn fulfilled(self) -> Option<T> {
        match self {
            Self::Fulfilled(value) => Some(value),
            _ => None,
        }
    }

    /// The rejection reason, if any.
    pub fn rejected(self) -> Option<E> {
        match self {
            Self::Rejected(reason) => Some(reason),
            _ => None,
        }
    }
}

impl<T: Clone, E: Clone> State<T, E> {
    /// `None` while pending.
    pub fn outcome(&self) -> Option<Result<T, E>> {
        match self {
            Self::Pending => None,
            Self::Fulfilled(value) => Some(Ok(value.clone())),
            Self::Rejected(reason) => Some(Err(reason.clone())),
        }
    }
}

impl<T, E> Display for State<T, E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::Fulfilled(_) => f.write_str("fulfilled"),
            Self::Rejected(_) => f.write_str("rejected"),
        }
    }
}

/// Shared storage behind a deferred value.
///
/// Two guards live here. `claimed` is taken by whoever gets to decide the
/// outcome (a settler, or the continuation of a `then`), possibly long
/// before the outcome is known because a thenable is being adopted. The
/// `Pending` check inside [`Cell::settle`] is the transition itself.
#[derive(Debug)]
pub(crate) struct Cell<T, E> {
    id: CellId,
    claimed: AtomicBool,
    inner: Mutex<Inner<T, E>>,
}

#[derive(Debug)]
struct Inner<T, E> {
    state: State<T, E>,
    observers: Observers<T, E>,
    // Set from the transition until the queue has been seen empty. While
    // set, late registrations queue behind the ones being flushed.
    flushing: bool,
    following: Option<Weak<Cell<T, E>>>,
}

impl<T, E> Cell<T, E> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Cell {
            id: CellId::next(),
            claimed: AtomicBool::new(false),
            inner: Mutex::new(Inner {
                state: State::Pending,
                observers: Observers::new(),
                flushing: false,
                following: None,
            }),
        })
    }

    pub(crate) fn id(&self) -> CellId {
        self.id
    }

    // Observers never run under this lock, so a poisoned lock still holds a
    // consistent state.
    fn lock(&self) -> MutexGuard<'_, Inner<T, E>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes the right to decide this cell's outcome. True exactly once.
    pub(crate) fn try_claim(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Records that this cell is waiting on `source`'s outcome.
    pub(crate) fn follow(&self, source: &Arc<Cell<T, E>>) {
        let mut inner = self.lock();
        if inner.state.is_pending() {
            inner.following = Some(Arc::downgrade(source));
        }
    }

    /// This cell followed by every pending cell it is transitively adopting.
    /// Stops after `limit` links.
    pub(crate) fn adoption_chain(&self, limit: usize) -> Vec<CellId> {
        let mut chain = vec![self.id];
        let mut next = self.lock().following.as_ref().and_then(Weak::upgrade);
        while let Some(cell) = next {
            if chain.len() > limit {
                break;
            }
            chain.push(cell.id);
            next = cell.lock().following.as_ref().and_then(Weak::upgrade);
        }
        chain
    }

    pub(crate) fn pending_observers(&self) -> usize {
        self.lock().observers.len()
    }

    /// Tests the current state without cloning the outcome.
    pub(crate) fn state_is(&self, check: fn(&State<T, E>) -> bool) -> bool {
        check(&self.lock().state)
    }
}

impl<T: Clone, E: Clone> Cell<T, E> {
    /// Moves the cell out of `Pending` and flushes its observers. Returns
    /// false, changing nothing, if the cell had already settled.
    pub(crate) fn settle(&self, outcome: Result<T, E>) -> bool {
        let mut flush = {
            let mut inner = self.lock();
            if !inner.state.is_pending() {
                debug!(cell = %self.id, state = %inner.state, "ignoring second settlement");
                return false;
            }
            inner.state = match &outcome {
                Ok(value) => State::Fulfilled(value.clone()),
                Err(reason) => State::Rejected(reason.clone()),
            };
            inner.following = None;
            inner.flushing = true;
            trace!(
                cell = %self.id,
                state = %inner.state,
                observers = inner.observers.len(),
                "settled"
            );
            inner.observers.drain(outcome)
        };
        loop {
            flush.run();
            let mut inner = self.lock();
            match inner.state.outcome() {
                Some(outcome) if !inner.observers.is_empty() => {
                    flush = inner.observers.drain(outcome);
                }
                _ => {
                    inner.flushing = false;
                    return true;
                }
            }
        }
    }

    /// Queues `observer` while pending or while the settling flush is still
    /// running; runs it right away otherwise.
    pub(crate) fn register(&self, observer: Observer<T, E>) {
        let outcome = {
            let mut inner = self.lock();
            match inner.state.outcome() {
                Some(outcome) if !inner.flushing => outcome,
                _ => {
                    inner.observers.push(observer);
                    trace!(cell = %self.id, queued = inner.observers.len(), "observer queued");
                    return;
                }
            }
        };
        observer(outcome);
    }

    pub(crate) fn snapshot(&self) -> State<T, E> {
        self.lock().state.clone()
    }

    pub(crate) fn poll_outcome(&self, waker: &Waker) -> Poll<Result<T, E>> {
        let mut inner = self.lock();
        match inner.state.outcome() {
            Some(outcome) => Poll::Ready(outcome),
            None => {
                inner.observers.park(waker);
                Poll::Pending
            }
        }
    }
}
