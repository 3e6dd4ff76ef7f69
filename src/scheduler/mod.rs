//! The cooperative Scheduler: a small fixed group of worker threads that
//! only ever run short, non-blocking work and timer continuations.

mod executor;
mod timer;

pub use timer::DelayHandle;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::RwLock;
use std::{
    future::Future,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicUsize, Ordering::*},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crate::{
    context,
    deferred::DeferredResult,
    error::{panic_message, Failure, Outcome, SchedulingError},
};
use timer::TimerQueue;

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

pub(crate) enum Message {
    Run(Job),
    Shutdown,
}

/// Deadline used when `now + delay` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(u32::MAX as u64);

struct Shared {
    ready: Sender<Message>,
    // Held for reading across check-and-send, so no work lands on the queue
    // after shutdown has queued its `Shutdown` messages.
    closed: RwLock<bool>,
    timer: Arc<TimerQueue>,
    threads: usize,
    violations: Arc<AtomicUsize>,
}

/// Owns the Scheduler threads. Dropping it shuts them down.
pub struct Scheduler {
    handle: SchedulerHandle,
    ready: Receiver<Message>,
    workers: Vec<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
}

/// A cloneable reference to a running Scheduler, handed to tasks.
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<Shared>,
}

/// Fails the wrapped result if it is dropped before being resolved, so
/// work discarded during shutdown never leaves a result pending forever.
pub(crate) struct RejectOnDrop<T: Clone + Send + 'static>(pub(crate) DeferredResult<T>);

impl<T: Clone + Send + 'static> Drop for RejectOnDrop<T> {
    fn drop(&mut self) {
        self.0.fail(Failure::Rejected("scheduler"));
    }
}

impl Scheduler {
    pub fn new(threads: usize) -> Result<Self, SchedulingError> {
        if threads == 0 {
            return Err(SchedulingError::InvalidConfig(
                "scheduler needs at least one worker thread".to_string(),
            ));
        }

        let (sender, receiver) = unbounded();
        let shared = Arc::new(Shared {
            ready: sender,
            closed: RwLock::new(false),
            timer: Arc::new(TimerQueue::new()),
            threads,
            violations: Arc::new(AtomicUsize::new(0)),
        });
        let mut scheduler = Scheduler {
            handle: SchedulerHandle {
                shared: shared.clone(),
            },
            ready: receiver.clone(),
            workers: Vec::with_capacity(threads),
            timer: None,
        };

        for index in 0..threads {
            let name = format!("scheduler-{index}");
            let receiver = receiver.clone();
            let violations = shared.violations.clone();
            let worker = thread::Builder::new()
                .name(name.clone())
                .spawn(move || {
                    context::enter_scheduler(violations);
                    worker_loop(receiver);
                })
                .map_err(|source| SchedulingError::Spawn { name, source })?;
            scheduler.workers.push(worker);
        }

        let timer_shared = shared.clone();
        let timer = thread::Builder::new()
            .name("scheduler-timer".to_string())
            .spawn(move || timer_shared.timer.run(&timer_shared.ready))
            .map_err(|source| SchedulingError::Spawn {
                name: "scheduler-timer".to_string(),
                source,
            })?;
        scheduler.timer = Some(timer);

        tracing::debug!(threads, "scheduler started");
        Ok(scheduler)
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    /// Stops accepting work, cancels pending delayed items, runs what is
    /// already on the ready queue and joins every thread.
    pub fn shutdown(&mut self) -> Result<(), SchedulingError> {
        let shared = &self.handle.shared;
        *shared.closed.write() = true;
        shared.timer.stop();

        let mut result = Ok(());
        if let Some(timer) = self.timer.take() {
            if timer.join().is_err() {
                result = Err(SchedulingError::WorkerPanicked("scheduler-timer".to_string()));
            }
        }

        for _ in &self.workers {
            // Cannot fail: `self.ready` keeps the channel connected.
            let _ = shared.ready.send(Message::Shutdown);
        }
        for worker in self.workers.drain(..) {
            let name = worker.thread().name().unwrap_or("scheduler").to_string();
            if worker.join().is_err() && result.is_ok() {
                result = Err(SchedulingError::WorkerPanicked(name));
            }
        }

        // Work submitted while the workers were exiting. Dropping it breaks
        // reference cycles and rejects any results it was meant to resolve.
        let leftover = self.ready.try_iter().count();
        if leftover > 0 {
            tracing::debug!(leftover, "discarded work queued during shutdown");
        }
        result
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            tracing::error!(%err, "scheduler shutdown failed");
        }
    }
}

fn worker_loop(ready: Receiver<Message>) {
    while let Ok(Message::Run(job)) = ready.recv() {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
            tracing::error!(
                thread = ?thread::current().name(),
                "scheduler work panicked: {}",
                panic_message(payload)
            );
        }
    }
}

impl SchedulerHandle {
    /// Queues `work` for any Scheduler worker and returns immediately.
    pub fn submit(&self, work: impl FnOnce() + Send + 'static) -> Result<(), SchedulingError> {
        let closed = self.shared.closed.read();
        if *closed {
            return Err(SchedulingError::ShutDown("scheduler"));
        }
        self.shared
            .ready
            .send(Message::Run(Box::new(work)))
            .map_err(|_| SchedulingError::ShutDown("scheduler"))
    }

    /// Runs `work` no earlier than `delay` from now. Delays too large for
    /// an `Instant` are clamped to a deadline decades away.
    pub fn schedule_after(
        &self,
        delay: Duration,
        work: impl FnOnce() + Send + 'static,
    ) -> Result<DelayHandle, SchedulingError> {
        let closed = self.shared.closed.read();
        if *closed {
            return Err(SchedulingError::ShutDown("scheduler"));
        }
        let now = Instant::now();
        let due = now
            .checked_add(delay)
            .or_else(|| now.checked_add(FAR_FUTURE))
            .unwrap_or(now);
        self.shared
            .timer
            .push(due, Box::new(work))
            .ok_or(SchedulingError::ShutDown("scheduler"))
    }

    /// Runs a fallible computation on the Scheduler. Errors and panics fail
    /// the returned result.
    pub fn spawn<T, F>(&self, work: F) -> DeferredResult<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> Outcome<T> + Send + 'static,
    {
        let deferred = DeferredResult::new();
        let result = RejectOnDrop(deferred.clone());
        let submitted = self.submit(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(work))
                .unwrap_or_else(|payload| Err(Failure::Step(panic_message(payload))));
            result.0.resolve(outcome);
        });
        if let Err(err) = submitted {
            tracing::debug!(%err, "spawn rejected");
        }
        deferred
    }

    /// Completes after `delay`, or fails with `Failure::Rejected` if the
    /// Scheduler shuts down first.
    pub fn sleep(&self, delay: Duration) -> DeferredResult<()> {
        let deferred = DeferredResult::new();
        let guard = RejectOnDrop(deferred.clone());
        if let Err(err) = self.schedule_after(delay, move || {
            guard.0.complete(());
        }) {
            tracing::debug!(%err, "sleep rejected");
        }
        deferred
    }

    /// Drives `future` on the Scheduler workers.
    pub fn spawn_async<T, F>(&self, future: F) -> DeferredResult<T>
    where
        T: Clone + Send + 'static,
        F: Future<Output = Outcome<T>> + Send + 'static,
    {
        executor::spawn(self, future)
    }

    /// Number of times a blocking call was made on one of this Scheduler's
    /// worker threads.
    pub fn blocking_violations(&self) -> usize {
        self.shared.violations.load(Relaxed)
    }

    pub fn threads(&self) -> usize {
        self.shared.threads
    }

    /// Delayed items still waiting for their deadline. Cancelled items
    /// leave the count as soon as `DelayHandle::cancel` returns.
    pub fn pending_timers(&self) -> usize {
        self.shared.timer.pending()
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shared.closed.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{current_role, ThreadRole};
    use parking_lot::Mutex;

    #[test]
    fn test_zero_threads() {
        assert!(matches!(
            Scheduler::new(0),
            Err(SchedulingError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_submit_runs_on_scheduler_thread() {
        let scheduler = Scheduler::new(2).unwrap();
        let role = scheduler.handle().spawn(|| Ok(current_role()));
        assert_eq!(role.wait(), Ok(ThreadRole::Scheduler));
    }

    #[test]
    fn test_worker_survives_panic() {
        let scheduler = Scheduler::new(1).unwrap();
        let handle = scheduler.handle();

        handle.submit(|| panic!("first job explodes")).unwrap();
        let failed: DeferredResult<u32> = handle.spawn(|| panic!("second job explodes"));
        let ok = handle.spawn(|| Ok(7));

        assert_eq!(failed.wait(), Err(Failure::Step("second job explodes".into())));
        assert_eq!(ok.wait(), Ok(7));
    }

    #[test]
    fn test_schedule_after_respects_delay() {
        let scheduler = Scheduler::new(1).unwrap();
        let handle = scheduler.handle();
        let done = DeferredResult::new();
        let fired = done.clone();

        let start = Instant::now();
        handle
            .schedule_after(Duration::from_millis(100), move || {
                fired.complete(start.elapsed());
            })
            .unwrap();
        let elapsed = done.wait().unwrap();
        assert!(elapsed >= Duration::from_millis(100), "fired after {elapsed:?}");
    }

    #[test]
    fn test_random_delays_fire_in_due_order() {
        use rand::seq::SliceRandom;

        let scheduler = Scheduler::new(1).unwrap();
        let handle = scheduler.handle();
        let fired = Arc::new(Mutex::new(Vec::new()));

        let mut delays: Vec<u64> = (1..=20).map(|i| i * 10).collect();
        delays.shuffle(&mut rand::rng());
        let items: Vec<DeferredResult<()>> = delays
            .iter()
            .map(|&ms| {
                let fired = fired.clone();
                let done = DeferredResult::new();
                let signal = done.clone();
                handle
                    .schedule_after(Duration::from_millis(ms), move || {
                        fired.lock().push(ms);
                        signal.complete(());
                    })
                    .unwrap();
                done
            })
            .collect();
        crate::deferred::join_all(items).wait().unwrap();

        delays.sort();
        assert_eq!(*fired.lock(), delays);
    }

    #[test]
    fn test_cancel_before_due() {
        let scheduler = Scheduler::new(1).unwrap();
        let handle = scheduler.handle();
        let ran = Arc::new(AtomicUsize::new(0));

        let counter = ran.clone();
        let delayed = handle
            .schedule_after(Duration::from_millis(50), move || {
                counter.fetch_add(1, SeqCst);
            })
            .unwrap();
        assert!(delayed.cancel());

        handle.sleep(Duration::from_millis(120)).wait().unwrap();
        assert_eq!(ran.load(SeqCst), 0);
        assert!(!delayed.has_started());
    }

    #[test]
    fn test_cancel_after_start_has_no_effect() {
        let scheduler = Scheduler::new(1).unwrap();
        let handle = scheduler.handle();
        let started = DeferredResult::new();
        let signal = started.clone();
        let finished = DeferredResult::new();
        let done = finished.clone();

        let delayed = handle
            .schedule_after(Duration::from_millis(10), move || {
                signal.complete(());
                done.complete(());
            })
            .unwrap();
        started.wait().unwrap();
        finished.wait().unwrap();

        assert!(!delayed.cancel());
        assert!(delayed.has_started());
    }

    #[test]
    fn test_cancel_releases_captured_state() {
        let scheduler = Scheduler::new(1).unwrap();
        let handle = scheduler.handle();
        let captured = Arc::new(());
        let held = captured.clone();

        let delayed = handle
            .schedule_after(Duration::from_secs(60), move || drop(held))
            .unwrap();
        assert_eq!(handle.pending_timers(), 1);
        assert_eq!(Arc::strong_count(&captured), 2);

        assert!(delayed.cancel());
        assert_eq!(handle.pending_timers(), 0);
        assert_eq!(Arc::strong_count(&captured), 1);
    }

    #[test]
    fn test_huge_delay_is_clamped() {
        let mut scheduler = Scheduler::new(1).unwrap();
        let handle = scheduler.handle();

        let delayed = handle.schedule_after(Duration::MAX, || {}).unwrap();
        assert!(delayed.due() > Instant::now() + Duration::from_secs(3600));
        let asleep = handle.sleep(Duration::MAX);
        assert_eq!(handle.pending_timers(), 2);
        assert!(delayed.cancel());
        assert!(!asleep.is_resolved());

        scheduler.shutdown().unwrap();
        assert_eq!(asleep.wait(), Err(Failure::Rejected("scheduler")));
    }

    #[test]
    fn test_waiting_on_resolved_result_is_not_blocking() {
        let scheduler = Scheduler::new(1).unwrap();
        let handle = scheduler.handle();
        let resolved = DeferredResult::completed(7);

        let value = handle.spawn(move || resolved.wait());
        assert_eq!(value.wait(), Ok(7));
        assert_eq!(handle.blocking_violations(), 0);
    }

    #[test]
    fn test_shutdown_rejects_work() {
        let mut scheduler = Scheduler::new(1).unwrap();
        let handle = scheduler.handle();
        let pending = handle.sleep(Duration::from_secs(60));
        assert_eq!(handle.pending_timers(), 1);

        scheduler.shutdown().unwrap();
        assert!(handle.is_shut_down());
        assert_eq!(pending.wait(), Err(Failure::Rejected("scheduler")));
        assert!(matches!(
            handle.submit(|| {}),
            Err(SchedulingError::ShutDown(_))
        ));
        assert_eq!(
            handle.spawn(|| Ok(1)).wait(),
            Err(Failure::Rejected("scheduler"))
        );
        assert_eq!(
            handle.sleep(Duration::ZERO).wait(),
            Err(Failure::Rejected("scheduler"))
        );
    }

    #[test]
    fn test_shutdown_drains_ready_queue() {
        let mut scheduler = Scheduler::new(1).unwrap();
        let handle = scheduler.handle();
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let ran = ran.clone();
            handle
                .submit(move || {
                    ran.fetch_add(1, SeqCst);
                })
                .unwrap();
        }
        scheduler.shutdown().unwrap();
        assert_eq!(ran.load(SeqCst), 100);
    }
}
