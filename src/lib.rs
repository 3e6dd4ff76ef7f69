pub mod config;
pub mod connection;
pub mod context;
pub mod deferred;
pub mod driver;
pub mod error;
pub mod io_pool;
pub mod latch;
pub mod scheduler;
pub mod task;

pub use deferred::{DeferredResult, DeferredState};
pub use driver::{all_completed, Driver, Report};
pub use error::{Failure, Outcome, SchedulingError};
pub use io_pool::{IoHandle, IoPool};
pub use scheduler::{DelayHandle, Scheduler, SchedulerHandle};
pub use task::{Step, Task, TaskContext, TaskHandle, TaskId, TaskPhase};
