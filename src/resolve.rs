//! The resolution procedure.
//!
//! A proposed fulfillment is either a plain value, which settles the cell,
//! or a [`Thenable`], whose own eventual outcome the cell adopts. Adoption
//! hands the thenable a fresh [`Resolve`]/[`Reject`] pair guarded
//! independently of the cell, so a thenable firing its callbacks more than
//! once only ever counts the first call.
use crate::cell::{Cell, CellId};
use crate::scheduler::Config;
use crate::{Error, Reason, Value};
use std::fmt::{Debug, Formatter};
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

/// What a settler or a `then` handler proposes as the fulfillment.
pub enum Resolution<T: Value, E: Reason> {
    Value(T),
    Adopt(Box<dyn Thenable<T, E>>),
}

impl<T: Value, E: Reason> Resolution<T, E> {
    pub fn adopt(thenable: impl Thenable<T, E> + 'static) -> Self {
        Resolution::Adopt(Box::new(thenable))
    }
}

impl<T: Value + Debug, E: Reason> Debug for Resolution<T, E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Resolution::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Resolution::Adopt(_) => f.write_str("Adopt(..)"),
        }
    }
}

/// Anything that can report an outcome later through a resolve/reject pair.
///
/// `register_continuation` is called at most once. Returning `Err` rejects the
/// adopting cell, unless one of the callbacks already fired.
pub trait Thenable<T: Value, E: Reason>: Send {
    fn register_continuation(self: Box<Self>, resolve: Resolve<T, E>, reject: Reject<T, E>)
        -> Result<(), E>;

    /// The cells this value is, or is waiting on, nearest first, up to
    /// `limit` links. Adopting a thenable whose chain contains the adopting
    /// cell is refused with [`Error::CircularResolution`].
    fn adoption_chain(&self, _limit: usize) -> Vec<CellId> {
        Vec::new()
    }
}

/// Adapts a closure into a [`Thenable`].
///
/// ```
/// use deferred_out::{Deferred, Reject, Resolve, Runtime, TaskQueue, ThenFn};
///
/// let runtime = Runtime::new(TaskQueue::new());
/// let adopted = Deferred::<&str, String>::new(&runtime, |resolve, _| {
///     resolve.adopt(ThenFn(|inner: Resolve<&'static str, String>, _: Reject<_, _>| {
///         inner.resolve("V");
///         Ok::<(), String>(())
///     }));
///     Ok(())
/// });
/// assert_eq!(adopted.state().fulfilled(), Some("V"));
/// ```
pub struct ThenFn<F>(pub F);

impl<T, E, F> Thenable<T, E> for ThenFn<F>
where
    T: Value,
    E: Reason,
    F: FnOnce(Resolve<T, E>, Reject<T, E>) -> Result<(), E> + Send,
{
    fn register_continuation(
        self: Box<Self>,
        resolve: Resolve<T, E>,
        reject: Reject<T, E>,
    ) -> Result<(), E> {
        (self.0)(resolve, reject)
    }
}

enum Guard {
    /// The cell's own claim; used by initializers and `then` continuations.
    Cell,
    /// Local to one adoption.
    Adoption(AtomicBool),
}

enum Slot<T: Value, E: Reason> {
    Capturing(Option<Resolution<T, E>>),
    Released,
}

/// Turns a thenable that resolves synchronously, from inside
/// `register_continuation`, into another iteration of the adoption loop
/// instead of another stack frame.
struct Trampoline<T: Value, E: Reason> {
    slot: Mutex<Slot<T, E>>,
}

impl<T: Value, E: Reason> Trampoline<T, E> {
    fn new() -> Self {
        Trampoline {
            slot: Mutex::new(Slot::Capturing(None)),
        }
    }

    /// Holds `resolution` for the loop if it is still inside the thenable;
    /// hands it back to the caller otherwise.
    fn capture(&self, resolution: Resolution<T, E>) -> Option<Resolution<T, E>> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        match &mut *slot {
            Slot::Capturing(held) => {
                *held = Some(resolution);
                None
            }
            Slot::Released => Some(resolution),
        }
    }

    fn release(&self) -> Option<Resolution<T, E>> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        match mem::replace(&mut *slot, Slot::Released) {
            Slot::Capturing(held) => held,
            Slot::Released => None,
        }
    }
}

/// State shared by one resolve/reject pair.
struct Binding<T: Value, E: Reason> {
    cell: Arc<Cell<T, E>>,
    guard: Guard,
    depth: usize,
    limit: usize,
    trampoline: Option<Trampoline<T, E>>,
}

impl<T: Value, E: Reason> Binding<T, E> {
    fn claim(&self) -> bool {
        match &self.guard {
            Guard::Cell => self.cell.try_claim(),
            Guard::Adoption(claimed) => claimed
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok(),
        }
    }

    fn proceed(&self, resolution: Resolution<T, E>) {
        let resolution = match &self.trampoline {
            Some(trampoline) => match trampoline.capture(resolution) {
                Some(resolution) => resolution,
                None => return,
            },
            None => resolution,
        };
        run(&self.cell, resolution, self.depth, self.limit);
    }
}

impl<T: Value, E: Reason> Drop for Binding<T, E> {
    /// A pair dropped without firing would leave the cell pending forever.
    fn drop(&mut self) {
        if self.claim() {
            let cell = self.cell.id();
            warn!(cell = %cell, depth = self.depth, "settler dropped before settling");
            self.cell.settle(Err(Error::SettlerDropped { cell }.into()));
        }
    }
}

/// Settles `cell` with `resolution`, adopting thenables until a plain value,
/// a rejection, or a thenable that answers later.
fn run<T: Value, E: Reason>(
    cell: &Arc<Cell<T, E>>,
    mut resolution: Resolution<T, E>,
    mut depth: usize,
    limit: usize,
) {
    loop {
        let thenable = match resolution {
            Resolution::Value(value) => {
                cell.settle(Ok(value));
                return;
            }
            Resolution::Adopt(thenable) => thenable,
        };
        if thenable.adoption_chain(limit).contains(&cell.id()) {
            warn!(cell = %cell.id(), "refusing circular adoption");
            cell.settle(Err(Error::CircularResolution { cell: cell.id() }.into()));
            return;
        }
        if depth >= limit {
            warn!(cell = %cell.id(), limit, "adoption too deep");
            cell.settle(Err(Error::AdoptionDepthExceeded { limit }.into()));
            return;
        }
        depth += 1;
        debug!(cell = %cell.id(), depth, "adopting thenable");

        let binding = Arc::new(Binding {
            cell: cell.clone(),
            guard: Guard::Adoption(AtomicBool::new(false)),
            depth,
            limit,
            trampoline: Some(Trampoline::new()),
        });
        let registered = thenable.register_continuation(
            Resolve {
                binding: binding.clone(),
            },
            Reject {
                binding: binding.clone(),
            },
        );
        if let Err(reason) = registered {
            if binding.claim() {
                debug!(cell = %cell.id(), "thenable failed before answering");
                cell.settle(Err(reason));
            }
        }
        match binding.trampoline.as_ref().and_then(Trampoline::release) {
            Some(next) => resolution = next,
            None => return,
        }
    }
}

/// The pair handed to an initializer, or the continuation of a `then`.
/// Both halves share one run-once guard: the cell's claim.
pub(crate) fn settlers<T: Value, E: Reason>(
    cell: &Arc<Cell<T, E>>,
    config: &Config,
) -> (Resolve<T, E>, Reject<T, E>) {
    let binding = Arc::new(Binding {
        cell: cell.clone(),
        guard: Guard::Cell,
        depth: 0,
        limit: config.max_adoption_depth,
        trampoline: None,
    });
    (
        Resolve {
            binding: binding.clone(),
        },
        Reject { binding },
    )
}

/// Proposes a fulfillment. Only the first call on this handle, its clones,
/// or its paired [`Reject`] has any effect.
pub struct Resolve<T: Value, E: Reason> {
    binding: Arc<Binding<T, E>>,
}

impl<T: Value, E: Reason> Clone for Resolve<T, E> {
    fn clone(&self) -> Self {
        Resolve {
            binding: self.binding.clone(),
        }
    }
}

impl<T: Value, E: Reason> Debug for Resolve<T, E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Resolve").field(&self.binding.cell.id()).finish()
    }
}

impl<T: Value, E: Reason> Resolve<T, E> {
    pub fn resolve(&self, value: T) {
        self.resolve_with(Resolution::Value(value))
    }

    /// Settles with whatever `thenable` eventually reports.
    pub fn adopt(&self, thenable: impl Thenable<T, E> + 'static) {
        self.resolve_with(Resolution::adopt(thenable))
    }

    pub fn resolve_with(&self, resolution: Resolution<T, E>) {
        if !self.binding.claim() {
            debug!(cell = %self.binding.cell.id(), "resolve ignored, already claimed");
            return;
        }
        self.binding.proceed(resolution);
    }

    /// The cell this handle settles.
    pub fn cell(&self) -> CellId {
        self.binding.cell.id()
    }

    pub(crate) fn follow(&self, source: &Arc<Cell<T, E>>) {
        self.binding.cell.follow(source)
    }
}

/// Rejects with a reason, stored as is. Shares its guard with the paired
/// [`Resolve`].
pub struct Reject<T: Value, E: Reason> {
    binding: Arc<Binding<T, E>>,
}

impl<T: Value, E: Reason> Clone for Reject<T, E> {
    fn clone(&self) -> Self {
        Reject {
            binding: self.binding.clone(),
        }
    }
}

impl<T: Value, E: Reason> Debug for Reject<T, E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Reject").field(&self.binding.cell.id()).finish()
    }
}

impl<T: Value, E: Reason> Reject<T, E> {
    pub fn reject(&self, reason: E) {
        if !self.binding.claim() {
            debug!(cell = %self.binding.cell.id(), "reject ignored, already claimed");
            return;
        }
        self.binding.cell.settle(Err(reason));
    }

    pub fn cell(&self) -> CellId {
        self.binding.cell.id()
    }
}

#[cfg(test)]
mod tests {
    use super::{settlers, Reject, Resolution, Resolve, ThenFn};
    use crate::cell::{Cell, State};
    use crate::scheduler::Config;
    use crate::Error;
    use std::sync::{Arc, Mutex};

    type Pair = (Resolve<u32, String>, Reject<u32, String>);

    fn nested(levels: u32) -> Resolution<u32, String> {
        if levels == 0 {
            return Resolution::Value(levels);
        }
        Resolution::adopt(ThenFn(
            move |resolve: Resolve<u32, String>, _: Reject<u32, String>| -> Result<(), String> {
                resolve.resolve_with(nested(levels - 1));
                Ok(())
            },
        ))
    }

    #[test]
    fn plain_value_fulfills() {
        let cell = Cell::new();
        let (resolve, reject): Pair = settlers(&cell, &Config::default());
        resolve.resolve(7);
        reject.reject("late".into());
        assert_eq!(cell.snapshot(), State::Fulfilled(7));
    }

    #[test]
    fn misbehaving_thenable_only_counts_its_first_call() {
        let cell = Cell::new();
        let (resolve, _reject): Pair = settlers(&cell, &Config::default());
        resolve.adopt(ThenFn(
            |inner: Resolve<u32, String>, inner_reject: Reject<u32, String>| -> Result<(), String> {
                inner.resolve(1);
                inner.resolve(2);
                inner_reject.reject("three".into());
                Err("four".into())
            },
        ));
        assert_eq!(cell.snapshot(), State::Fulfilled(1));
    }

    #[test]
    fn thenable_error_before_answering_rejects() {
        let cell = Cell::new();
        let (resolve, _reject): Pair = settlers(&cell, &Config::default());
        resolve.adopt(ThenFn(
            |_: Resolve<u32, String>, _: Reject<u32, String>| -> Result<(), String> {
                Err("then blew up".into())
            },
        ));
        assert_eq!(cell.snapshot(), State::Rejected("then blew up".to_string()));
    }

    #[test]
    fn claimed_cell_ignores_later_proposals_while_adopting() {
        let cell = Cell::new();
        let (resolve, reject): Pair = settlers(&cell, &Config::default());
        let parked = Arc::new(Mutex::new(None));
        let slot = parked.clone();
        resolve.adopt(ThenFn(
            move |inner: Resolve<u32, String>, _: Reject<u32, String>| -> Result<(), String> {
                *slot.lock().unwrap() = Some(inner);
                Ok(())
            },
        ));

        resolve.resolve(5);
        reject.reject("nope".into());
        assert!(cell.snapshot().is_pending());

        let inner = parked.lock().unwrap().take().unwrap();
        inner.resolve(9);
        assert_eq!(cell.snapshot(), State::Fulfilled(9));
    }

    #[test]
    fn late_answer_may_itself_be_a_thenable() {
        let cell = Cell::new();
        let (resolve, _reject): Pair = settlers(&cell, &Config::default());
        let parked = Arc::new(Mutex::new(None));
        let slot = parked.clone();
        resolve.adopt(ThenFn(
            move |inner: Resolve<u32, String>, _: Reject<u32, String>| -> Result<(), String> {
                *slot.lock().unwrap() = Some(inner);
                Ok(())
            },
        ));

        let inner = parked.lock().unwrap().take().unwrap();
        inner.resolve_with(nested(3));
        assert_eq!(cell.snapshot(), State::Fulfilled(0));
    }

    #[test]
    fn deep_synchronous_chains_do_not_grow_the_stack() {
        let cell = Cell::new();
        let config = Config::default().with_max_adoption_depth(200_000);
        let (resolve, _reject): Pair = settlers(&cell, &config);
        resolve.resolve_with(nested(100_000));
        assert_eq!(cell.snapshot(), State::Fulfilled(0));
    }

    #[test]
    fn adoption_depth_is_bounded() {
        let cell = Cell::new();
        let config = Config::default().with_max_adoption_depth(16);
        let (resolve, _reject): Pair = settlers(&cell, &config);
        resolve.resolve_with(nested(17));
        assert_eq!(
            cell.snapshot(),
            State::Rejected(Error::AdoptionDepthExceeded { limit: 16 }.to_string())
        );
    }

    #[test]
    fn dropping_both_handles_rejects() {
        let cell = Cell::<u32, String>::new();
        let (resolve, reject) = settlers(&cell, &Config::default());
        drop(resolve);
        assert!(cell.snapshot().is_pending());
        drop(reject);
        assert_eq!(
            cell.snapshot(),
            State::Rejected(Error::SettlerDropped { cell: cell.id() }.to_string())
        );
    }

    #[test]
    fn thenable_that_drops_its_callbacks_rejects() {
        let cell = Cell::new();
        let (resolve, _reject): Pair = settlers(&cell, &Config::default());
        resolve.adopt(ThenFn(
            |_: Resolve<u32, String>, _: Reject<u32, String>| -> Result<(), String> { Ok(()) },
        ));
        assert_eq!(
            cell.snapshot(),
            State::Rejected(Error::SettlerDropped { cell: cell.id() }.to_string())
        );
    }
}
