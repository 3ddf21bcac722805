//! A scheduler backed by one worker thread. Tasks travel over a
//! multi-producer, single-consumer channel, so the scheduler can be cloned
//! freely while every task still runs on the same thread, in send order.
//!
use crate::scheduler::{Scheduler, Task};
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{channel, SendError, Sender};
use std::thread;
use tracing::{trace, warn};

/// Runs every task on one named worker thread.
///
/// # Examples
///
/// ```
/// use deferred_out::{Deferred, Resolution, Runtime, ThreadScheduler};
/// use futures::executor::block_on;
///
/// let runtime = Runtime::new(ThreadScheduler::spawn().unwrap());
/// let answer = Deferred::<i32, String>::resolved(&runtime, 41)
///     .then_fulfilled(|v| Ok(Resolution::Value(v + 1)));
/// assert_eq!(block_on(answer.settled()), Ok(42));
/// ```
#[derive(Debug, Clone)]
pub struct ThreadScheduler {
    sender: Sender<Task>,
}

impl ThreadScheduler {
    pub fn spawn() -> io::Result<Self> {
        Self::named("deferred-worker")
    }

    /// The worker exits once every clone of the scheduler is gone and the
    /// queue is drained.
    pub fn named(name: impl Into<String>) -> io::Result<Self> {
        let (sender, receiver) = channel::<Task>();
        thread::Builder::new().name(name.into()).spawn(move || {
            for task in receiver {
                if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                    warn!("scheduled task panicked");
                }
            }
            trace!("scheduler worker exiting");
        })?;
        Ok(ThreadScheduler { sender })
    }
}

impl Scheduler for ThreadScheduler {
    fn schedule(&self, task: Task) {
        if let Err(SendError(task)) = self.sender.send(task) {
            // Dropping the task drops its settlers, which rejects what it
            // would have settled.
            warn!("scheduler worker is gone, dropping task");
            drop(task);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ThreadScheduler;
    use crate::deferred::Deferred;
    use crate::resolve::Resolution;
    use crate::scheduler::{Runtime, Scheduler};
    use futures::executor::block_on;
    use std::sync::mpsc::channel;
    use std::thread;

    #[test]
    fn tasks_run_in_send_order_on_the_worker() {
        let scheduler = ThreadScheduler::named("order-test").unwrap();
        let (tx, rx) = channel();
        for n in 0..5 {
            let tx = tx.clone();
            scheduler.schedule(Box::new(move || {
                let name = thread::current().name().map(str::to_owned);
                tx.send((n, name)).unwrap();
            }));
        }
        drop(tx);

        let seen: Vec<_> = rx.iter().collect();
        let order: Vec<_> = seen.iter().map(|(n, _)| *n).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
        assert!(seen
            .iter()
            .all(|(_, name)| name.as_deref() == Some("order-test")));
    }

    #[test]
    fn panicking_task_does_not_stop_the_worker() {
        let scheduler = ThreadScheduler::spawn().unwrap();
        let (tx, rx) = channel();
        scheduler.schedule(Box::new(|| panic!("boom")));
        scheduler.schedule(Box::new(move || tx.send("still running").unwrap()));
        assert_eq!(rx.recv().unwrap(), "still running");
    }

    #[test]
    fn settled_from_another_thread() {
        let runtime = Runtime::new(ThreadScheduler::spawn().unwrap());
        let (tx, rx) = channel();
        let pending = Deferred::<String, String>::new(&runtime, move |resolve, _| {
            tx.send(resolve).unwrap();
            Ok(())
        });
        let shouted = pending.then_fulfilled(|s| Ok(Resolution::Value(s.to_uppercase())));

        let producer = thread::spawn(move || {
            let resolve = rx.recv().unwrap();
            resolve.resolve("🍓 hi".to_owned());
        });

        assert_eq!(block_on(shouted.settled()), Ok("🍓 HI".to_owned()));
        producer.join().expect("The producer thread has panicked");
    }
}
