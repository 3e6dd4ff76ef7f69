//! Owns both pools, spawns tasks into them and waits for the lot.

use rand::Rng;
use std::{future::Future, time::Duration};

use crate::{
    config::{Config, Style},
    connection::Connection,
    deferred::{join_all, DeferredResult},
    error::{Failure, Outcome, SchedulingError},
    io_pool::{IoHandle, IoPool},
    scheduler::{Scheduler, SchedulerHandle},
    task::{self, Task, TaskContext, TaskHandle, TaskId},
};

pub struct Driver {
    config: Config,
    scheduler: Scheduler,
    io: IoPool,
}

impl Driver {
    pub fn new(config: Config) -> Result<Self, SchedulingError> {
        config.validate()?;
        let scheduler = Scheduler::new(config.scheduler_threads)?;
        let io = IoPool::new(config.io_threads)?;
        tracing::debug!(
            scheduler_threads = config.scheduler_threads,
            io_threads = config.io_threads,
            "driver ready"
        );
        Ok(Self {
            config,
            scheduler,
            io,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn scheduler(&self) -> SchedulerHandle {
        self.scheduler.handle()
    }

    pub fn io(&self) -> IoHandle {
        self.io.handle()
    }

    pub fn spawn<S, I, T>(&self, task: Task<S, I, T>) -> Result<TaskHandle<T>, SchedulingError>
    where
        S: Send + 'static,
        I: Clone + Send + 'static,
        T: Clone + Send + 'static,
    {
        task.start(self.scheduler.handle(), self.io.handle())
    }

    pub fn spawn_async<T, F, Fut>(&self, id: TaskId, make: F) -> TaskHandle<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce(TaskContext) -> Fut,
        Fut: Future<Output = Outcome<T>> + Send + 'static,
    {
        task::start_async(id, self.scheduler.handle(), self.io.handle(), make)
    }

    /// Spawns `config.tasks` connections with ids starting at 1.
    pub fn spawn_connections(&self) -> Result<Vec<TaskHandle<TaskId>>, SchedulingError> {
        let mut rng = rand::rng();
        let jitter_ms = self.config.jitter.as_millis() as u64;

        (1..=self.config.tasks as TaskId)
            .map(|id| {
                let latency = self.config.latency + Duration::from_millis(rng.random_range(0..=jitter_ms));
                let conn = Connection::new(id, latency, self.config.fail.contains(&id));
                match self.config.style {
                    Style::Continuations => self.spawn(conn.into_task()),
                    Style::Async => Ok(self.spawn_async(id, move |ctx| conn.serve(ctx))),
                }
            })
            .collect()
    }

    /// Runs every configured connection to a terminal state, then shuts
    /// both pools down.
    pub fn run(self) -> Result<Report<TaskId>, SchedulingError> {
        let handles = self.spawn_connections()?;
        let report = all_completed(&handles)
            .wait()
            .map_err(|_| SchedulingError::ShutDown("scheduler"))?;
        self.shutdown()?;
        Ok(report)
    }

    /// Shuts the Scheduler down first, so I/O parked on its timers is
    /// released, then the IOPool.
    pub fn shutdown(mut self) -> Result<(), SchedulingError> {
        let scheduler = self.scheduler.shutdown();
        let io = self.io.shutdown();
        scheduler.and(io)
    }
}

/// Every task's outcome, in submission order.
#[derive(Debug, Clone)]
pub struct Report<T> {
    pub outcomes: Vec<(TaskId, Outcome<T>)>,
    first_failure: Option<TaskId>,
}

impl<T> Report<T> {
    pub fn completed(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| o.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.completed()
    }

    /// The first task to fail, by the time it failed. Falls back to the
    /// first failed outcome in order if that task is no longer listed.
    pub fn first_failure(&self) -> Option<(TaskId, &Failure)> {
        self.first_failure
            .and_then(|first| {
                self.outcomes
                    .iter()
                    .filter(|(id, _)| *id == first)
                    .find_map(failure_of)
            })
            .or_else(|| self.outcomes.iter().find_map(failure_of))
    }

    /// All values, or the first failure.
    pub fn into_result(self) -> Result<Vec<T>, Failure> {
        if let Some((_, failure)) = self.first_failure() {
            return Err(failure.clone());
        }
        self.outcomes.into_iter().map(|(_, o)| o).collect()
    }
}

fn failure_of<T>((id, outcome): &(TaskId, Outcome<T>)) -> Option<(TaskId, &Failure)> {
    outcome.as_ref().err().map(|failure| (*id, failure))
}

/// Resolves once every task has completed or failed.
pub fn all_completed<T: Clone + Send + 'static>(handles: &[TaskHandle<T>]) -> DeferredResult<Report<T>> {
    let ids: Vec<TaskId> = handles.iter().map(TaskHandle::id).collect();
    let report = DeferredResult::new();
    let resolver = report.clone();

    join_all(handles.iter().map(|h| h.result().clone()).collect()).on_resolve(move |joined| {
        resolver.resolve(joined.map(|joined| Report {
            first_failure: joined
                .first_failure
                .and_then(|index| ids.get(index).copied()),
            outcomes: ids.into_iter().zip(joined.outcomes).collect(),
        }));
    });
    report
}
