//! The demo workload: a simulated connection that greets on the Scheduler,
//! waits on simulated I/O in the IOPool, then finishes on the Scheduler.

use std::time::Duration;

use crate::{
    context::os_thread_id,
    error::{Failure, Outcome},
    io_pool::simulate_latency,
    task::{Step, Task, TaskContext, TaskId},
};

/// State carried across a connection's steps.
pub struct Connection {
    id: TaskId,
    latency: Duration,
    refuse: bool,
    greeted_on: u64,
}

type ConnectionStep = Step<Connection, (), TaskId>;

impl Connection {
    pub fn new(id: TaskId, latency: Duration, refuse: bool) -> Self {
        Self {
            id,
            latency,
            refuse,
            greeted_on: 0,
        }
    }

    pub fn into_task(self) -> Task<Connection, (), TaskId> {
        Task::new(self.id, self, greet)
    }

    pub async fn serve(mut self, ctx: TaskContext) -> Outcome<TaskId> {
        self.hello()?;
        let scheduler = ctx.scheduler().clone();
        let latency = self.latency;
        ctx.run_blocking(move || simulate_latency(&scheduler, latency))
            .await?;
        self.resumed();
        Ok(self.id)
    }

    fn hello(&mut self) -> Outcome<()> {
        self.greeted_on = os_thread_id();
        tracing::info!(connection = self.id, thread = self.greeted_on, "hello");
        if self.refuse {
            return Err(Failure::Step(format!("connection {} refused", self.id)));
        }
        Ok(())
    }

    fn resumed(&self) {
        tracing::info!(
            connection = self.id,
            thread = os_thread_id(),
            greeted_on = self.greeted_on,
            "resumed after i/o"
        );
    }
}

fn greet(ctx: &TaskContext, mut conn: Connection) -> Outcome<ConnectionStep> {
    conn.hello()?;
    let scheduler = ctx.scheduler().clone();
    let latency = conn.latency;
    let pending = ctx
        .io()
        .run_blocking(move || simulate_latency(&scheduler, latency));
    Ok(Step::then(conn, pending, finish))
}

fn finish(_: &TaskContext, conn: Connection, _: ()) -> Outcome<ConnectionStep> {
    conn.resumed();
    Ok(Step::Done(conn.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{io_pool::IoPool, scheduler::Scheduler, task::start_async};

    #[test]
    fn test_connection_task() {
        let scheduler = Scheduler::new(1).unwrap();
        let io = IoPool::new(1).unwrap();

        let task = Connection::new(4, Duration::from_millis(20), false).into_task();
        assert_eq!(task.id(), 4);
        let handle = task.start(scheduler.handle(), io.handle()).unwrap();
        assert_eq!(handle.wait(), Ok(4));
    }

    #[test]
    fn test_refused_connection() {
        let scheduler = Scheduler::new(1).unwrap();
        let io = IoPool::new(1).unwrap();

        let task = Connection::new(5, Duration::from_millis(20), true).into_task();
        let handle = task.start(scheduler.handle(), io.handle()).unwrap();
        assert_eq!(
            handle.wait(),
            Err(Failure::Step("connection 5 refused".to_string()))
        );
        assert_eq!(io.handle().peak_busy(), 0);
    }

    #[test]
    fn test_async_connection() {
        let scheduler = Scheduler::new(1).unwrap();
        let io = IoPool::new(1).unwrap();

        let conn = Connection::new(6, Duration::from_millis(20), false);
        let handle = start_async(6, scheduler.handle(), io.handle(), move |ctx| conn.serve(ctx));
        assert_eq!(handle.wait(), Ok(6));
    }
}
