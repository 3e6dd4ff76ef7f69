//! Single-assignment results shared between pools.

use futures::task::AtomicWaker;
use parking_lot::Mutex;
use std::{
    future::{Future, IntoFuture},
    mem,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use crate::{
    context,
    error::{Failure, Outcome},
    latch::Latch,
};

type Callback<T> = Box<dyn FnOnce(Outcome<T>) + Send>;

enum State<T> {
    Pending(Vec<Callback<T>>),
    Resolved(Outcome<T>),
}

struct Inner<T> {
    state: Mutex<State<T>>,
    resolved: Latch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferredState {
    Pending,
    Completed,
    Failed,
}

/// The eventual outcome of a step or a task.
///
/// Clones share the same cell. The first `resolve` wins; later ones return
/// `false` and change nothing. Registered continuations run exactly once,
/// on whichever thread resolves the result (or inline, if it is already
/// resolved when they are registered).
pub struct DeferredResult<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for DeferredResult<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Default for DeferredResult<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> DeferredResult<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Pending(Vec::new())),
                resolved: Latch::new(),
            }),
        }
    }

    pub fn completed(value: T) -> Self {
        let deferred = Self::new();
        deferred.complete(value);
        deferred
    }

    pub fn failed(failure: Failure) -> Self {
        let deferred = Self::new();
        deferred.fail(failure);
        deferred
    }

    pub fn complete(&self, value: T) -> bool {
        self.resolve(Ok(value))
    }

    pub fn fail(&self, failure: Failure) -> bool {
        self.resolve(Err(failure))
    }

    /// Returns `false` if the result was already resolved.
    pub fn resolve(&self, outcome: Outcome<T>) -> bool {
        let mut state = self.inner.state.lock();
        if let State::Resolved(_) = *state {
            return false;
        }
        let previous = mem::replace(&mut *state, State::Resolved(outcome.clone()));
        drop(state);

        self.inner.resolved.open();
        if let State::Pending(callbacks) = previous {
            for callback in callbacks {
                callback(outcome.clone());
            }
        }
        true
    }

    pub fn on_resolve(&self, callback: impl FnOnce(Outcome<T>) + Send + 'static) {
        let outcome = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                State::Pending(callbacks) => {
                    callbacks.push(Box::new(callback));
                    return;
                }
                State::Resolved(outcome) => outcome.clone(),
            }
        };
        callback(outcome);
    }

    pub fn state(&self) -> DeferredState {
        match &*self.inner.state.lock() {
            State::Pending(_) => DeferredState::Pending,
            State::Resolved(Ok(_)) => DeferredState::Completed,
            State::Resolved(Err(_)) => DeferredState::Failed,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.inner.resolved.is_open()
    }

    pub fn outcome(&self) -> Option<Outcome<T>> {
        match &*self.inner.state.lock() {
            State::Pending(_) => None,
            State::Resolved(outcome) => Some(outcome.clone()),
        }
    }

    /// Blocks the calling thread until the result resolves.
    ///
    /// Must not park a Scheduler worker; doing so is recorded as a blocking
    /// violation on that Scheduler. Returning an already-resolved outcome
    /// does not count.
    pub fn wait(&self) -> Outcome<T> {
        if let Some(outcome) = self.outcome() {
            return outcome;
        }
        context::mark_blocking("DeferredResult::wait");
        loop {
            if let Some(outcome) = self.outcome() {
                return outcome;
            }
            self.inner.resolved.wait();
        }
    }
}

/// Outcomes of a group of results, in the order they were given.
#[derive(Debug, Clone)]
pub struct Joined<T> {
    pub outcomes: Vec<Outcome<T>>,
    /// Index of the first result to fail, by resolution time.
    pub first_failure: Option<usize>,
}

struct JoinState<T> {
    slots: Vec<Option<Outcome<T>>>,
    remaining: usize,
    first_failure: Option<usize>,
}

/// Resolves once every item has resolved, successfully or not.
pub fn join_all<T: Clone + Send + 'static>(items: Vec<DeferredResult<T>>) -> DeferredResult<Joined<T>> {
    let all = DeferredResult::new();
    if items.is_empty() {
        all.complete(Joined {
            outcomes: Vec::new(),
            first_failure: None,
        });
        return all;
    }

    let state = Arc::new(Mutex::new(JoinState {
        slots: (0..items.len()).map(|_| None).collect(),
        remaining: items.len(),
        first_failure: None,
    }));

    for (index, item) in items.iter().enumerate() {
        let state = state.clone();
        let all = all.clone();
        item.on_resolve(move |outcome| {
            let joined = {
                let mut state = state.lock();
                if outcome.is_err() && state.first_failure.is_none() {
                    state.first_failure = Some(index);
                }
                state.slots[index] = Some(outcome);
                state.remaining -= 1;
                if state.remaining > 0 {
                    return;
                }
                Joined {
                    outcomes: state.slots.drain(..).flatten().collect(),
                    first_failure: state.first_failure,
                }
            };
            all.complete(joined);
        });
    }
    all
}

/// `.await` support for `DeferredResult`.
pub struct DeferredFuture<T> {
    deferred: DeferredResult<T>,
    waker: Arc<AtomicWaker>,
    registered: bool,
}

impl<T: Clone + Send + 'static> IntoFuture for DeferredResult<T> {
    type Output = Outcome<T>;
    type IntoFuture = DeferredFuture<T>;

    fn into_future(self) -> Self::IntoFuture {
        DeferredFuture {
            deferred: self,
            waker: Arc::new(AtomicWaker::new()),
            registered: false,
        }
    }
}

impl<T: Clone + Send + 'static> Future for DeferredFuture<T> {
    type Output = Outcome<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // quick check to avoid registration if already done.
        if let Some(outcome) = self.deferred.outcome() {
            return Poll::Ready(outcome);
        }

        self.waker.register(cx.waker());
        if !self.registered {
            self.registered = true;
            let waker = self.waker.clone();
            self.deferred.on_resolve(move |_| waker.wake());
        }

        // Need to check again **after** `register` to avoid a lost wake-up.
        match self.deferred.outcome() {
            Some(outcome) => Poll::Ready(outcome),
            None => Poll::Pending,
        }
    }
}
