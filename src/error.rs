use std::{any::Any, io};

/// A recoverable failure, captured into a `DeferredResult`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Failure {
    /// A task computation step returned an error or panicked.
    #[error("step failed: {0}")]
    Step(String),

    /// A blocking operation returned an error or panicked.
    #[error("i/o failed: {0}")]
    Io(String),

    /// The pool that should have run the work has shut down.
    #[error("rejected: {0} is shut down")]
    Rejected(&'static str),
}

/// Fatal errors while setting up or tearing down the pools.
#[derive(Debug, thiserror::Error)]
pub enum SchedulingError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to spawn thread {name}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("{0} is shut down")]
    ShutDown(&'static str),

    #[error("worker thread {0} panicked")]
    WorkerPanicked(String),
}

pub type Outcome<T> = Result<T, Failure>;

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
