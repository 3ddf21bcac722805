//! Deferred execution. Continuations never run in the turn that registered
//! them; they are handed to a [`Scheduler`] carried by the [`Runtime`].
use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::trace;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs tasks after the current synchronous turn. Tasks submitted through
/// one scheduler must run in submission order.
pub trait Scheduler: Send + Sync {
    fn schedule(&self, task: Task);
}

impl<S: Scheduler + ?Sized> Scheduler for Arc<S> {
    fn schedule(&self, task: Task) {
        (**self).schedule(task)
    }
}

/// A FIFO work queue that only runs when pumped.
///
/// Clones share the queue, so a test can hand one clone to a [`Runtime`]
/// and drive it with the other.
///
/// # Examples
///
/// ```
/// use deferred_out::{Scheduler, TaskQueue};
/// use std::sync::{Arc, Mutex};
///
/// let queue = TaskQueue::new();
/// let log = Arc::new(Mutex::new(Vec::new()));
/// for n in 0..3 {
///     let log = log.clone();
///     queue.schedule(Box::new(move || log.lock().unwrap().push(n)));
/// }
/// assert!(log.lock().unwrap().is_empty());
/// assert_eq!(queue.run_until_idle(), 3);
/// assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
/// ```
#[derive(Clone, Default)]
pub struct TaskQueue {
    tasks: Arc<Mutex<VecDeque<Task>>>,
}

impl Debug for TaskQueue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue").field("len", &self.len()).finish()
    }
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Task>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Runs the oldest task. False if there was none.
    pub fn run_next(&self) -> bool {
        // Pop before running: the task may schedule more work.
        let task = self.lock().pop_front();
        match task {
            Some(task) => {
                task();
                true
            }
            None => false,
        }
    }

    /// Runs tasks, including ones scheduled along the way, until the queue
    /// is empty. Returns how many ran.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        while self.run_next() {
            ran += 1;
        }
        trace!(ran, "task queue idle");
        ran
    }
}

impl Scheduler for TaskQueue {
    fn schedule(&self, task: Task) {
        self.lock().push_back(task);
    }
}

/// Tunables shared by every deferred created from one [`Runtime`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// How many thenables may be adopted one inside another before the
    /// resolving cell is rejected with [`crate::Error::AdoptionDepthExceeded`].
    pub max_adoption_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_adoption_depth: 1024,
        }
    }
}

impl Config {
    pub fn with_max_adoption_depth(mut self, depth: usize) -> Self {
        self.max_adoption_depth = depth;
        self
    }
}

/// Scheduler handle plus configuration. Every deferred keeps the runtime it
/// was created with and passes it to the deferreds chained from it.
#[derive(Clone)]
pub struct Runtime {
    scheduler: Arc<dyn Scheduler>,
    config: Config,
}

impl Debug for Runtime {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Runtime {
    pub fn new(scheduler: impl Scheduler + 'static) -> Self {
        Self::with_config(scheduler, Config::default())
    }

    pub fn with_config(scheduler: impl Scheduler + 'static, config: Config) -> Self {
        Runtime {
            scheduler: Arc::new(scheduler),
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn schedule(&self, task: Task) {
        self.scheduler.schedule(task)
    }
}

#[cfg(test)]
mod tests {
    use super::{Config, Runtime, Scheduler, TaskQueue};
    use std::sync::{Arc, Mutex};

    #[test]
    fn tasks_scheduled_while_pumping_run_in_the_same_pump() {
        let queue = TaskQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let inner_queue = queue.clone();
        let inner_log = log.clone();
        queue.schedule(Box::new(move || {
            inner_log.lock().unwrap().push("outer");
            let log = inner_log.clone();
            inner_queue.schedule(Box::new(move || log.lock().unwrap().push("inner")));
        }));

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.run_until_idle(), 2);
        assert!(queue.is_empty());
        assert_eq!(*log.lock().unwrap(), vec!["outer", "inner"]);
    }

    #[test]
    fn run_next_on_empty_queue() {
        assert!(!TaskQueue::new().run_next());
    }

    #[test]
    fn runtime_forwards_to_its_scheduler() {
        let queue = TaskQueue::new();
        let runtime = Runtime::with_config(
            queue.clone(),
            Config::default().with_max_adoption_depth(8),
        );
        runtime.schedule(Box::new(|| {}));

        assert_eq!(runtime.config().max_adoption_depth, 8);
        assert_eq!(queue.len(), 1);
    }
}
