use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, ValueEnum};
use coopio::{
    config::{Config, Style},
    context::os_thread_id,
    Driver,
};
use tracing_subscriber::EnvFilter;

/// Many simulated connections multiplexed over a small cooperative
/// scheduler, with their blocking I/O pushed onto a separate pool.
#[derive(Parser, Debug)]
#[command(name = "coopio", version)]
struct Args {
    /// Number of simulated connections.
    #[arg(long, default_value_t = 10)]
    tasks: usize,

    #[arg(long, default_value_t = 1)]
    scheduler_threads: usize,

    #[arg(long, default_value_t = 20)]
    io_threads: usize,

    /// Simulated I/O latency per connection.
    #[arg(long, default_value_t = 2000)]
    latency_ms: u64,

    /// Extra random latency, up to this many milliseconds.
    #[arg(long, default_value_t = 0)]
    jitter_ms: u64,

    /// Make the connection with this id fail. Repeatable.
    #[arg(long = "fail", value_name = "ID")]
    fail: Vec<u64>,

    #[arg(long, value_enum, default_value_t = StyleArg::Continuations)]
    style: StyleArg,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StyleArg {
    Continuations,
    Async,
}

impl From<Args> for Config {
    fn from(args: Args) -> Self {
        Config {
            tasks: args.tasks,
            scheduler_threads: args.scheduler_threads,
            io_threads: args.io_threads,
            latency: Duration::from_millis(args.latency_ms),
            jitter: Duration::from_millis(args.jitter_ms),
            fail: args.fail,
            style: match args.style {
                StyleArg::Continuations => Style::Continuations,
                StyleArg::Async => Style::Async,
            },
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_thread_names(true)
        .init();

    let config = Config::from(Args::parse());
    let driver = Driver::new(config).context("failed to start thread pools")?;

    let start = Instant::now();
    tracing::info!(thread = os_thread_id(), "starting await");
    let report = driver.run().context("failed to run connections")?;
    tracing::info!(
        thread = os_thread_id(),
        elapsed = ?start.elapsed(),
        completed = report.completed(),
        failed = report.failed(),
        "done"
    );
    if let Some((id, failure)) = report.first_failure() {
        tracing::warn!(connection = id, %failure, "first failure");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::from(Args::try_parse_from(["coopio"]).unwrap());
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_flags() {
        let args = Args::try_parse_from([
            "coopio",
            "--tasks",
            "3",
            "--io-threads",
            "1",
            "--latency-ms",
            "50",
            "--fail",
            "1",
            "--fail",
            "3",
            "--style",
            "async",
        ])
        .unwrap();
        let config = Config::from(args);
        assert_eq!(config.tasks, 3);
        assert_eq!(config.io_threads, 1);
        assert_eq!(config.latency, Duration::from_millis(50));
        assert_eq!(config.fail, vec![1, 3]);
        assert_eq!(config.style, Style::Async);
    }

    #[test]
    fn test_rejects_unknown_style() {
        assert!(Args::try_parse_from(["coopio", "--style", "threads"]).is_err());
    }
}
