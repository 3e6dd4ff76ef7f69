//! A pool of threads that are allowed to block.

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::RwLock;
use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicUsize, Ordering::*},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::{
    context::{self, ThreadRole},
    deferred::DeferredResult,
    error::{panic_message, Failure, Outcome, SchedulingError},
    scheduler::SchedulerHandle,
};

type Operation = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(Operation),
    Shutdown,
}

struct Shared {
    pending: Sender<Message>,
    // Read-locked across check-and-send in `run_blocking`.
    closed: RwLock<bool>,
    threads: usize,
    queued: AtomicUsize,
    busy: AtomicUsize,
    peak_busy: AtomicUsize,
}

/// Owns the IOPool threads. Dropping it shuts them down.
pub struct IoPool {
    handle: IoHandle,
    pending: Receiver<Message>,
    workers: Vec<JoinHandle<()>>,
}

#[derive(Clone)]
pub struct IoHandle {
    shared: Arc<Shared>,
}

impl IoPool {
    pub fn new(threads: usize) -> Result<Self, SchedulingError> {
        if threads == 0 {
            return Err(SchedulingError::InvalidConfig(
                "io pool needs at least one worker thread".to_string(),
            ));
        }

        let (sender, receiver) = unbounded();
        let shared = Arc::new(Shared {
            pending: sender,
            closed: RwLock::new(false),
            threads,
            queued: AtomicUsize::new(0),
            busy: AtomicUsize::new(0),
            peak_busy: AtomicUsize::new(0),
        });
        let mut pool = IoPool {
            handle: IoHandle {
                shared: shared.clone(),
            },
            pending: receiver.clone(),
            workers: Vec::with_capacity(threads),
        };

        for index in 0..threads {
            let name = format!("io-{index}");
            let receiver = receiver.clone();
            let shared = shared.clone();
            let worker = thread::Builder::new()
                .name(name.clone())
                .spawn(move || {
                    context::enter_io();
                    worker_loop(&shared, receiver);
                })
                .map_err(|source| SchedulingError::Spawn { name, source })?;
            pool.workers.push(worker);
        }

        tracing::debug!(threads, "io pool started");
        Ok(pool)
    }

    pub fn handle(&self) -> IoHandle {
        self.handle.clone()
    }

    /// Stops accepting work, lets every queued and running operation finish
    /// and joins the workers.
    pub fn shutdown(&mut self) -> Result<(), SchedulingError> {
        let shared = &self.handle.shared;
        *shared.closed.write() = true;
        for _ in &self.workers {
            let _ = shared.pending.send(Message::Shutdown);
        }

        let mut result = Ok(());
        for worker in self.workers.drain(..) {
            let name = worker.thread().name().unwrap_or("io").to_string();
            if worker.join().is_err() && result.is_ok() {
                result = Err(SchedulingError::WorkerPanicked(name));
            }
        }

        // Only left behind if a worker died early. Dropping an operation
        // rejects its result.
        let leftover = self.pending.try_iter().count();
        if leftover > 0 {
            tracing::warn!(leftover, "io operations dropped at shutdown");
        }
        result
    }
}

impl Drop for IoPool {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            tracing::error!(%err, "io pool shutdown failed");
        }
    }
}

fn worker_loop(shared: &Shared, pending: Receiver<Message>) {
    while let Ok(Message::Run(operation)) = pending.recv() {
        let busy = shared.busy.fetch_add(1, AcqRel) + 1;
        shared.peak_busy.fetch_max(busy, AcqRel);
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(operation)) {
            tracing::error!(
                thread = ?thread::current().name(),
                "io continuation panicked: {}",
                panic_message(payload)
            );
        }
        shared.busy.fetch_sub(1, AcqRel);
    }
}

/// Counts an operation as queued until a worker starts it. Dropped without
/// starting, it rejects the operation's result.
struct Queued<T: Clone + Send + 'static> {
    result: Option<DeferredResult<T>>,
    shared: Arc<Shared>,
}

impl<T: Clone + Send + 'static> Queued<T> {
    fn new(shared: &Arc<Shared>, result: DeferredResult<T>) -> Self {
        shared.queued.fetch_add(1, Relaxed);
        Queued {
            result: Some(result),
            shared: shared.clone(),
        }
    }

    fn start(mut self) -> Option<DeferredResult<T>> {
        self.shared.queued.fetch_sub(1, Relaxed);
        self.result.take()
    }
}

impl<T: Clone + Send + 'static> Drop for Queued<T> {
    fn drop(&mut self) {
        if let Some(result) = self.result.take() {
            self.shared.queued.fetch_sub(1, Relaxed);
            result.fail(Failure::Rejected("io pool"));
        }
    }
}

impl IoHandle {
    /// Runs `operation` on an IOPool worker. Never blocks the caller.
    ///
    /// Errors returned by the operation, and panics inside it, fail the
    /// returned result.
    pub fn run_blocking<T, F>(&self, operation: F) -> DeferredResult<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> Outcome<T> + Send + 'static,
    {
        let closed = self.shared.closed.read();
        if *closed {
            return DeferredResult::failed(Failure::Rejected("io pool"));
        }

        let deferred = DeferredResult::new();
        let ticket = Queued::new(&self.shared, deferred.clone());
        let job: Operation = Box::new(move || {
            let Some(result) = ticket.start() else {
                return;
            };
            let outcome = panic::catch_unwind(AssertUnwindSafe(operation))
                .unwrap_or_else(|payload| Err(Failure::Io(panic_message(payload))));
            result.resolve(outcome);
        });

        let sent = self.shared.pending.send(Message::Run(job));
        drop(closed);
        // An unsent job rejects its result when dropped, which may run
        // continuations, so the lock is released first.
        if let Err(err) = sent {
            tracing::debug!("io operation rejected");
            drop(err);
        }
        deferred
    }

    pub fn threads(&self) -> usize {
        self.shared.threads
    }

    /// Operations currently running.
    pub fn busy(&self) -> usize {
        self.shared.busy.load(Acquire)
    }

    /// Operations waiting for a free worker.
    pub fn queued(&self) -> usize {
        self.shared.queued.load(Relaxed)
    }

    /// Highest number of operations that ever ran at once.
    pub fn peak_busy(&self) -> usize {
        self.shared.peak_busy.load(Acquire)
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shared.closed.read()
    }
}

/// Simulated I/O latency: asks the Scheduler for a wake-up after `delay`
/// and parks the calling IOPool thread until it fires.
///
/// Refused on a Scheduler thread, where the wake-up could never run on a
/// single-threaded Scheduler.
pub fn simulate_latency(scheduler: &SchedulerHandle, delay: Duration) -> Outcome<()> {
    if context::current_role() == ThreadRole::Scheduler {
        context::mark_blocking("simulate_latency");
        return Err(Failure::Io(
            "simulated i/o must not run on a scheduler thread".to_string(),
        ));
    }

    tracing::debug!(thread = context::os_thread_id(), ?delay, "blocking thread to simulate i/o");
    scheduler
        .sleep(delay)
        .wait()
        .map_err(|failure| Failure::Io(failure.to_string()))
}
