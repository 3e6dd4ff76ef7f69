use std::time::Duration;

use crate::{error::SchedulingError, task::TaskId};

/// How connection tasks are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Style {
    /// Explicit `Step::Done` / `Step::Await` continuation passing.
    #[default]
    Continuations,
    /// `async` blocks driven by the Scheduler's executor.
    Async,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Number of simulated connections.
    pub tasks: usize,
    pub scheduler_threads: usize,
    pub io_threads: usize,
    /// Simulated I/O latency of each connection.
    pub latency: Duration,
    /// Upper bound of extra random latency added per connection.
    pub jitter: Duration,
    /// Connections whose first step fails.
    pub fail: Vec<TaskId>,
    pub style: Style,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tasks: 10,
            scheduler_threads: 1,
            io_threads: 20,
            latency: Duration::from_secs(2),
            jitter: Duration::ZERO,
            fail: Vec::new(),
            style: Style::Continuations,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), SchedulingError> {
        if self.scheduler_threads == 0 {
            return Err(SchedulingError::InvalidConfig(
                "scheduler_threads must be at least 1".to_string(),
            ));
        }
        if self.io_threads == 0 {
            return Err(SchedulingError::InvalidConfig(
                "io_threads must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.tasks, 10);
        assert_eq!(config.latency, Duration::from_secs(2));
    }

    #[test]
    fn test_zero_threads_rejected() {
        let config = Config {
            io_threads: 0,
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(SchedulingError::InvalidConfig(_))
        ));

        let config = Config {
            scheduler_threads: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
