//! Pending continuations of a cell and the one-shot flush that runs them.
use std::fmt::{Debug, Formatter};
use std::mem;
use std::task::Waker;

pub(crate) type Observer<T, E> = Box<dyn FnOnce(Result<T, E>) + Send>;

pub(crate) struct Observers<T, E> {
    continuations: Vec<Observer<T, E>>,
    wakers: Vec<Waker>, // futures polling `Settled`, woken after the continuations
}

impl<T, E> Debug for Observers<T, E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observers")
            .field("continuations", &self.continuations.len())
            .field("wakers", &self.wakers.len())
            .finish()
    }
}

impl<T, E> Observers<T, E> {
    pub(crate) fn new() -> Self {
        Self {
            continuations: Vec::new(),
            wakers: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, observer: Observer<T, E>) {
        self.continuations.push(observer);
    }

    /// Remembers `waker` unless an equivalent one is already parked.
    ///
    /// Wakers of futures dropped before settlement stay here until the
    /// flush, so a cell that never settles keeps one per distinct polling
    /// task.
    pub(crate) fn park(&mut self, waker: &Waker) {
        if !self.wakers.iter().any(|parked| parked.will_wake(waker)) {
            self.wakers.push(waker.clone());
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.continuations.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.continuations.is_empty()
    }

    /// Empties the queue. The returned flush must run outside the cell lock
    /// so continuations may register on, or settle, other cells.
    pub(crate) fn drain(&mut self, outcome: Result<T, E>) -> Flush<T, E> {
        Flush {
            continuations: mem::take(&mut self.continuations),
            wakers: mem::take(&mut self.wakers),
            outcome,
        }
    }
}

#[must_use = "a flush does nothing until it is run"]
pub(crate) struct Flush<T, E> {
    continuations: Vec<Observer<T, E>>,
    wakers: Vec<Waker>,
    outcome: Result<T, E>,
}

impl<T: Clone, E: Clone> Flush<T, E> {
    pub(crate) fn run(self) {
        let Flush {
            continuations,
            wakers,
            outcome,
        } = self;
        for observer in continuations {
            observer(outcome.clone());
        }
        for waker in wakers {
            waker.wake();
        }
    }
}
