use {
    futures::{
        future::{BoxFuture, FutureExt},
        task::{waker_ref, ArcWake},
    },
    parking_lot::Mutex,
    std::{
        future::Future,
        panic::AssertUnwindSafe,
        sync::Arc,
        task::{Context, Poll},
    },
};

use super::{RejectOnDrop, SchedulerHandle};
use crate::{
    deferred::DeferredResult,
    error::{panic_message, Failure, Outcome},
};

/// A spawned future. Waking it puts a poll job back on the Scheduler's
/// ready queue.
struct AsyncTask {
    future: Mutex<Option<BoxFuture<'static, ()>>>,
    scheduler: SchedulerHandle,
}

impl ArcWake for AsyncTask {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        let cloned = arc_self.clone();
        if let Err(err) = arc_self.scheduler.submit(move || cloned.poll()) {
            tracing::debug!(%err, "dropping wake-up");
            // Nobody will poll it again. Dropping the future rejects its
            // result and breaks the task -> future -> waker -> task cycle.
            // A poll in progress holds the slot, so only try.
            let future = arc_self.future.try_lock().and_then(|mut slot| slot.take());
            drop(future);
        }
    }
}

impl AsyncTask {
    fn poll(self: &Arc<Self>) {
        let mut future_slot = self.future.lock();
        if let Some(mut future) = future_slot.take() {
            let waker = waker_ref(self);
            let context = &mut Context::from_waker(&waker);
            if let Poll::Pending = future.as_mut().poll(context) {
                *future_slot = Some(future);
            }
        }
    }
}

pub(super) fn spawn<T, F>(scheduler: &SchedulerHandle, future: F) -> DeferredResult<T>
where
    T: Clone + Send + 'static,
    F: Future<Output = Outcome<T>> + Send + 'static,
{
    let deferred = DeferredResult::new();
    let result = RejectOnDrop(deferred.clone());
    let future = async move {
        let outcome = AssertUnwindSafe(future)
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(Failure::Step(panic_message(payload))));
        result.0.resolve(outcome);
    };
    let task = Arc::new(AsyncTask {
        future: Mutex::new(Some(future.boxed())),
        scheduler: scheduler.clone(),
    });
    ArcWake::wake_by_ref(&task);
    deferred
}
