//! Tasks: a chain of steps that runs on the Scheduler and hands blocking
//! work to the IOPool in between.
//!
//! A step either finishes the task (`Step::Done`) or hands back the task
//! state together with a pending I/O result and the step to run once it
//! resolves (`Step::Await`). Steps of one task are strictly sequential:
//! the next step is only submitted from the previous step's continuation.

use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU8, Ordering::*},
        Arc,
    },
};

use crate::{
    deferred::DeferredResult,
    error::{panic_message, Failure, Outcome, SchedulingError},
    io_pool::IoHandle,
    scheduler::SchedulerHandle,
};

pub type TaskId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskPhase {
    Created = 0,
    RunningOnScheduler = 1,
    AwaitingIo = 2,
    ResumedOnScheduler = 3,
    Completed = 4,
    Failed = 5,
}

impl TaskPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TaskPhase::Created,
            1 => TaskPhase::RunningOnScheduler,
            2 => TaskPhase::AwaitingIo,
            3 => TaskPhase::ResumedOnScheduler,
            4 => TaskPhase::Completed,
            _ => TaskPhase::Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskPhase::Completed | TaskPhase::Failed)
    }
}

/// What a task can reach while it runs: its id and both pools.
#[derive(Clone)]
pub struct TaskContext {
    id: TaskId,
    scheduler: SchedulerHandle,
    io: IoHandle,
    phase: Arc<AtomicU8>,
}

impl TaskContext {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn scheduler(&self) -> &SchedulerHandle {
        &self.scheduler
    }

    pub fn io(&self) -> &IoHandle {
        &self.io
    }

    pub fn phase(&self) -> TaskPhase {
        TaskPhase::from_u8(self.phase.load(Acquire))
    }

    fn enter(&self, phase: TaskPhase) {
        self.phase.store(phase as u8, Release);
    }

    /// Async counterpart of returning `Step::Await`: runs `operation` on the
    /// IOPool and resumes the calling future on the Scheduler.
    pub async fn run_blocking<I, F>(&self, operation: F) -> Outcome<I>
    where
        I: Clone + Send + 'static,
        F: FnOnce() -> Outcome<I> + Send + 'static,
    {
        self.enter(TaskPhase::AwaitingIo);
        let outcome = self.io.run_blocking(operation).await;
        self.enter(TaskPhase::ResumedOnScheduler);
        outcome
    }
}

pub type Next<S, I, T> = Box<dyn FnOnce(&TaskContext, S, I) -> Outcome<Step<S, I, T>> + Send>;

type First<S, I, T> = Box<dyn FnOnce(&TaskContext, S) -> Outcome<Step<S, I, T>> + Send>;

pub enum Step<S, I, T> {
    Done(T),
    Await(S, DeferredResult<I>, Next<S, I, T>),
}

impl<S, I, T> Step<S, I, T> {
    pub fn then(
        state: S,
        pending: DeferredResult<I>,
        next: impl FnOnce(&TaskContext, S, I) -> Outcome<Step<S, I, T>> + Send + 'static,
    ) -> Self {
        Step::Await(state, pending, Box::new(next))
    }
}

pub struct Task<S, I, T> {
    id: TaskId,
    state: S,
    first: First<S, I, T>,
}

impl<S, I, T> Task<S, I, T>
where
    S: Send + 'static,
    I: Clone + Send + 'static,
    T: Clone + Send + 'static,
{
    pub fn new(
        id: TaskId,
        state: S,
        first: impl FnOnce(&TaskContext, S) -> Outcome<Step<S, I, T>> + Send + 'static,
    ) -> Self {
        Self {
            id,
            state,
            first: Box::new(first),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Submits the first step to the Scheduler.
    pub fn start(
        self,
        scheduler: SchedulerHandle,
        io: IoHandle,
    ) -> Result<TaskHandle<T>, SchedulingError> {
        let handle = TaskHandle::new(self.id);
        let run = Run {
            ctx: TaskContext {
                id: self.id,
                scheduler: scheduler.clone(),
                io,
                phase: handle.phase.clone(),
            },
            result: handle.result.clone(),
        };
        let Task { state, first, .. } = self;
        scheduler.submit(move || {
            run.ctx.enter(TaskPhase::RunningOnScheduler);
            let outcome = guarded(|| first(&run.ctx, state));
            run.advance(outcome);
        })?;
        Ok(handle)
    }
}

/// Runs an async task on the Scheduler. `make` receives the task's context
/// and returns the future to drive.
pub fn start_async<T, F, Fut>(
    id: TaskId,
    scheduler: SchedulerHandle,
    io: IoHandle,
    make: F,
) -> TaskHandle<T>
where
    T: Clone + Send + 'static,
    F: FnOnce(TaskContext) -> Fut,
    Fut: std::future::Future<Output = Outcome<T>> + Send + 'static,
{
    let handle = TaskHandle::new(id);
    let ctx = TaskContext {
        id,
        scheduler: scheduler.clone(),
        io,
        phase: handle.phase.clone(),
    };
    let running = ctx.clone();
    let future = make(ctx);
    let finished = running.clone();
    let result = handle.result.clone();

    scheduler
        .spawn_async(async move {
            running.enter(TaskPhase::RunningOnScheduler);
            future.await
        })
        .on_resolve(move |outcome| {
            finished.enter(match outcome {
                Ok(_) => TaskPhase::Completed,
                Err(_) => TaskPhase::Failed,
            });
            result.resolve(outcome);
        });
    handle
}

/// A task between steps. Dropping it before the task finished (the
/// Scheduler shut down under it) fails the task.
struct Run<T: Clone + Send + 'static> {
    ctx: TaskContext,
    result: DeferredResult<T>,
}

impl<T: Clone + Send + 'static> Run<T> {
    fn advance<S, I>(self, outcome: Outcome<Step<S, I, T>>)
    where
        S: Send + 'static,
        I: Clone + Send + 'static,
    {
        match outcome {
            Ok(Step::Done(value)) => {
                self.ctx.enter(TaskPhase::Completed);
                self.result.complete(value);
            }
            Err(failure) => {
                tracing::debug!(task = self.ctx.id, %failure, "task failed");
                self.ctx.enter(TaskPhase::Failed);
                self.result.fail(failure);
            }
            Ok(Step::Await(state, pending, next)) => {
                self.ctx.enter(TaskPhase::AwaitingIo);
                pending.on_resolve(move |io_outcome| {
                    let scheduler = self.ctx.scheduler.clone();
                    let task = self.ctx.id;
                    let resumed = scheduler.submit(move || {
                        self.ctx.enter(TaskPhase::ResumedOnScheduler);
                        let outcome =
                            io_outcome.and_then(|value| guarded(|| next(&self.ctx, state, value)));
                        self.advance(outcome);
                    });
                    if let Err(err) = resumed {
                        tracing::debug!(task, %err, "could not resume task");
                    }
                });
            }
        }
    }
}

impl<T: Clone + Send + 'static> Drop for Run<T> {
    fn drop(&mut self) {
        if !self.ctx.phase().is_terminal() {
            self.ctx.enter(TaskPhase::Failed);
            self.result.fail(Failure::Rejected("scheduler"));
        }
    }
}

fn guarded<R>(step: impl FnOnce() -> Outcome<R>) -> Outcome<R> {
    panic::catch_unwind(AssertUnwindSafe(step))
        .unwrap_or_else(|payload| Err(Failure::Step(panic_message(payload))))
}

pub struct TaskHandle<T> {
    id: TaskId,
    phase: Arc<AtomicU8>,
    result: DeferredResult<T>,
}

impl<T> Clone for TaskHandle<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            phase: self.phase.clone(),
            result: self.result.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> TaskHandle<T> {
    fn new(id: TaskId) -> Self {
        Self {
            id,
            phase: Arc::new(AtomicU8::new(TaskPhase::Created as u8)),
            result: DeferredResult::new(),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn phase(&self) -> TaskPhase {
        TaskPhase::from_u8(self.phase.load(Acquire))
    }

    pub fn result(&self) -> &DeferredResult<T> {
        &self.result
    }

    pub fn wait(&self) -> Outcome<T> {
        self.result.wait()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        context::{current_role, ThreadRole},
        io_pool::IoPool,
        latch::Latch,
        scheduler::Scheduler,
    };
    use parking_lot::Mutex;

    struct Counter {
        steps: Vec<ThreadRole>,
    }

    fn pools() -> (Scheduler, IoPool) {
        (Scheduler::new(1).unwrap(), IoPool::new(2).unwrap())
    }

    #[test]
    fn test_task_runs_steps_in_order() {
        let (scheduler, io) = pools();
        let counter = Counter { steps: vec![] };
        let task: Task<Counter, u32, Vec<ThreadRole>> = Task::new(1, counter, |ctx, mut counter| {
            counter.steps.push(current_role());
            let pending = ctx.io().run_blocking(|| Ok(1));
            Ok(Step::then(counter, pending, |ctx, mut counter, _| {
                counter.steps.push(current_role());
                let pending = ctx.io().run_blocking(|| Ok(2));
                Ok(Step::then(counter, pending, |_, mut counter, two| {
                    assert_eq!(two, 2);
                    counter.steps.push(current_role());
                    Ok(Step::Done(counter.steps))
                }))
            }))
        });

        let handle = task.start(scheduler.handle(), io.handle()).unwrap();
        assert_eq!(
            handle.wait(),
            Ok(vec![ThreadRole::Scheduler, ThreadRole::Scheduler, ThreadRole::Scheduler])
        );
        assert_eq!(handle.phase(), TaskPhase::Completed);
        assert_eq!(scheduler.handle().blocking_violations(), 0);
    }

    #[test]
    fn test_phases() {
        let (scheduler, io) = pools();
        let gate = Arc::new(Latch::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let blocker = gate.clone();
        let first_seen = seen.clone();
        let task: Task<(), (), ()> = Task::new(7, (), move |ctx, state| {
            first_seen.lock().push(ctx.phase());
            let pending = ctx.io().run_blocking(move || {
                blocker.wait();
                Ok(())
            });
            let resumed_seen = first_seen.clone();
            Ok(Step::then(state, pending, move |ctx, _, _| {
                resumed_seen.lock().push(ctx.phase());
                Ok(Step::Done(()))
            }))
        });

        let handle = task.start(scheduler.handle(), io.handle()).unwrap();
        while handle.phase() != TaskPhase::AwaitingIo {
            std::thread::yield_now();
        }
        gate.open();
        handle.wait().unwrap();

        assert_eq!(handle.id(), 7);
        assert_eq!(handle.phase(), TaskPhase::Completed);
        assert_eq!(
            *seen.lock(),
            vec![TaskPhase::RunningOnScheduler, TaskPhase::ResumedOnScheduler]
        );
    }

    #[test]
    fn test_step_error_fails_task() {
        let (scheduler, io) = pools();
        let task: Task<(), (), u8> =
            Task::new(1, (), |_, _| Err(Failure::Step("bad input".into())));
        let handle = task.start(scheduler.handle(), io.handle()).unwrap();
        assert_eq!(handle.wait(), Err(Failure::Step("bad input".into())));
        assert_eq!(handle.phase(), TaskPhase::Failed);
    }

    #[test]
    fn test_step_panic_fails_task() {
        let (scheduler, io) = pools();
        let task: Task<(), (), u8> = Task::new(1, (), |ctx, state| {
            let pending = ctx.io().run_blocking(|| Ok(()));
            Ok(Step::then(state, pending, |_, _, _| panic!("resume exploded")))
        });
        let handle = task.start(scheduler.handle(), io.handle()).unwrap();
        assert_eq!(handle.wait(), Err(Failure::Step("resume exploded".into())));
        assert_eq!(handle.phase(), TaskPhase::Failed);
    }

    #[test]
    fn test_io_failure_fails_task() {
        let (scheduler, io) = pools();
        let task: Task<(), (), u8> = Task::new(1, (), |ctx, state| {
            let pending = ctx.io().run_blocking(|| Err(Failure::Io("reset by peer".into())));
            Ok(Step::then(state, pending, |_, _, _| -> Outcome<Step<(), (), u8>> {
                panic!("must not resume after a failed read")
            }))
        });
        let handle = task.start(scheduler.handle(), io.handle()).unwrap();
        assert_eq!(handle.wait(), Err(Failure::Io("reset by peer".into())));
    }

    #[test]
    fn test_start_after_shutdown() {
        let (mut scheduler, io) = pools();
        let handle = scheduler.handle();
        scheduler.shutdown().unwrap();

        let task: Task<(), (), ()> = Task::new(1, (), |_, _| Ok(Step::Done(())));
        assert!(matches!(
            task.start(handle, io.handle()),
            Err(SchedulingError::ShutDown(_))
        ));
    }

    #[test]
    fn test_start_async() {
        let (scheduler, io) = pools();
        let handle = start_async(3, scheduler.handle(), io.handle(), |ctx| async move {
            assert_eq!(ctx.phase(), TaskPhase::RunningOnScheduler);
            let role = ctx.run_blocking(|| Ok(current_role())).await?;
            assert_eq!(ctx.phase(), TaskPhase::ResumedOnScheduler);
            assert_eq!(current_role(), ThreadRole::Scheduler);
            Ok::<_, Failure>((ctx.id(), role))
        });
        assert_eq!(handle.wait(), Ok((3, ThreadRole::Io)));
        assert_eq!(handle.phase(), TaskPhase::Completed);
    }
}
