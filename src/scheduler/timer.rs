//! Delayed work, ordered by due time and then by insertion order.

use crossbeam_channel::Sender;
use parking_lot::{Condvar, Mutex};
use std::{
    cmp::Ordering,
    collections::BinaryHeap,
    mem,
    sync::{
        atomic::{AtomicU8, Ordering::*},
        Arc, Weak,
    },
    time::Instant,
};

use super::{Job, Message};

const PENDING: u8 = 0;
const STARTED: u8 = 1;
const CANCELLED: u8 = 2;

/// Handle to an item queued with `schedule_after`.
#[derive(Clone)]
pub struct DelayHandle {
    state: Arc<AtomicU8>,
    due: Instant,
    seq: u64,
    queue: Weak<TimerQueue>,
}

impl DelayHandle {
    /// Best-effort cancellation. Returns `true` if the item is cancelled,
    /// `false` if it has already started running.
    ///
    /// A cancelled item that is still waiting for its deadline is removed
    /// from the queue right away, dropping its job.
    pub fn cancel(&self) -> bool {
        match self.state.compare_exchange(PENDING, CANCELLED, AcqRel, Acquire) {
            Ok(_) => {
                if let Some(queue) = self.queue.upgrade() {
                    queue.remove(self.seq);
                }
                true
            }
            Err(current) => current == CANCELLED,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Acquire) == CANCELLED
    }

    pub fn has_started(&self) -> bool {
        self.state.load(Acquire) == STARTED
    }

    pub fn due(&self) -> Instant {
        self.due
    }
}

struct Entry {
    due: Instant,
    seq: u64,
    job: Job,
    state: Arc<AtomicU8>,
}

impl Entry {
    /// Wraps the job so it only runs if nobody cancelled it first.
    fn into_job(self) -> Job {
        let Entry { job, state, .. } = self;
        Box::new(move || {
            if state.compare_exchange(PENDING, STARTED, AcqRel, Acquire).is_ok() {
                job();
            }
        })
    }
}

// Reverse ordering for a min-heap: earliest due first, then lowest seq.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Entry {}

struct TimerState {
    delayed: BinaryHeap<Entry>,
    next_seq: u64,
    shutdown: bool,
}

pub(crate) struct TimerQueue {
    state: Mutex<TimerState>,
    notify: Condvar,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(TimerState {
                delayed: BinaryHeap::new(),
                next_seq: 0,
                shutdown: false,
            }),
            notify: Condvar::new(),
        }
    }

    /// Returns `None` once the queue has been stopped.
    pub(crate) fn push(self: &Arc<Self>, due: Instant, job: Job) -> Option<DelayHandle> {
        let state_flag = Arc::new(AtomicU8::new(PENDING));
        let mut state = self.state.lock();
        if state.shutdown {
            return None;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.delayed.push(Entry {
            due,
            seq,
            job,
            state: state_flag.clone(),
        });
        // The timer thread may be sleeping until a later deadline.
        self.notify.notify_one();
        Some(DelayHandle {
            state: state_flag,
            due,
            seq,
            queue: Arc::downgrade(self),
        })
    }

    fn remove(&self, seq: u64) {
        let removed = {
            let mut state = self.state.lock();
            let (removed, kept): (Vec<Entry>, Vec<Entry>) = mem::take(&mut state.delayed)
                .into_iter()
                .partition(|entry| entry.seq == seq);
            state.delayed = BinaryHeap::from(kept);
            removed
        };
        // Dropped outside the lock: dropping a job may run continuations.
        drop(removed);
    }

    /// Items still waiting for their deadline. Cancelled items are not
    /// counted.
    pub(crate) fn pending(&self) -> usize {
        self.state.lock().delayed.len()
    }

    pub(crate) fn stop(&self) {
        self.state.lock().shutdown = true;
        self.notify.notify_all();
    }

    /// Timer thread main loop: moves due items onto the ready queue.
    pub(crate) fn run(&self, ready: &Sender<Message>) {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                break;
            }

            // Cancelled jobs are dropped after the lock is released, since
            // dropping one may resolve a result and run its continuations.
            let mut discarded = Vec::new();
            let now = Instant::now();
            while state.delayed.peek().is_some_and(|entry| entry.due <= now) {
                let Some(entry) = state.delayed.pop() else {
                    break;
                };
                if entry.state.load(Acquire) == CANCELLED {
                    discarded.push(entry.job);
                } else if let Err(err) = ready.send(Message::Run(entry.into_job())) {
                    if let Message::Run(job) = err.into_inner() {
                        discarded.push(job);
                    }
                }
            }
            if !discarded.is_empty() {
                drop(state);
                drop(discarded);
                state = self.state.lock();
                continue;
            }

            match state.delayed.peek().map(|entry| entry.due) {
                Some(due) => {
                    self.notify.wait_until(&mut state, due);
                }
                None => self.notify.wait(&mut state),
            }
        }

        let remaining: Vec<Entry> = state.delayed.drain().collect();
        drop(state);
        for entry in &remaining {
            let _ = entry
                .state
                .compare_exchange(PENDING, CANCELLED, AcqRel, Acquire);
        }
        tracing::debug!(cancelled = remaining.len(), "timer stopped");
    }
}
