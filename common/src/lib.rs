//! Buffered byte-stream copy engine
//!
//! Moves one byte stream from a source (file, accepted TCP connection or synthetic
//! zeros) to a sink (file, dialed TCP connection or discard) while reporting live
//! throughput and buffer occupancy.
//!
//! # Pipeline
//!
//! A reader task fills buffers taken from a bounded [`pool::BufferPool`] and hands them
//! through a bounded queue to a writer task, which writes them out and returns them to
//! the pool. The pool size caps memory at `max_buf_num × buf_size` and makes a fast
//! source wait for a slow sink. See [`pipeline`] for error and cancellation semantics.
//!
//! With `single_thread` set the pool and queue are skipped in favour of one read/write
//! loop.
//!
//! # Monitoring
//!
//! The reader and writer bump lock-free [`progress::Counters`]; a sampler turns them into
//! one [`progress::Metrics`] snapshot per second, and the [`dashboard`] renders those as
//! a terminal dashboard, plain text lines, or nothing at all.
//!
//! # Entry Points
//!
//! [`transfer::run`] performs one transfer inside an existing tokio runtime. Binaries
//! wrap it with [`run`], which sets up logging and the runtime and reports the outcome.

pub mod config;
pub mod dashboard;
pub mod pipeline;
pub mod pool;
pub mod progress;
pub mod streams;
pub mod transfer;

#[cfg(test)]
mod testutils;

pub use config::{OutputConfig, RuntimeConfig, ThrottleConfig, TracingConfig, TransferConfig};
pub use dashboard::{ProgressSettings, ProgressType};
pub use pipeline::{Error, Failure, Summary};
pub use streams::EndpointConfig;
pub use transfer::Settings;

fn log_level(output: &OutputConfig) -> &'static str {
    if output.quiet {
        return "off";
    }
    match output.verbose {
        0 => "error",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

fn init_tracing(output: &OutputConfig, tracing_config: TracingConfig) -> anyhow::Result<()> {
    use anyhow::Context;
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level(output)));
    let res = match tracing_config.debug_log_file {
        Some(path) => {
            let file = std::fs::File::create(&path)
                .with_context(|| format!("failed creating debug log file {path:?}"))?;
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .try_init()
        }
        None => tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .try_init(),
    };
    res.map_err(|err| anyhow::anyhow!("failed to initialize logging: {err}"))
}

fn build_runtime(runtime: RuntimeConfig) -> std::io::Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    builder.build()
}

/// The summary of a successful run is shown unless quiet mode asks for silence;
/// `print_summary` brings it back even then.
fn prints_summary(output: &OutputConfig) -> bool {
    output.print_summary || !output.quiet
}

/// Sets up logging and a tokio runtime, then drives `func` to completion.
///
/// Returns the summary on success. On failure the error chain is printed to stderr
/// (unless `quiet` is set) and `None` is returned, so the caller can exit non-zero.
pub fn run<Fut>(
    output: OutputConfig,
    runtime: RuntimeConfig,
    tracing_config: TracingConfig,
    func: impl FnOnce() -> Fut,
) -> Option<Summary>
where
    Fut: std::future::Future<Output = anyhow::Result<Summary>>,
{
    if let Err(error) = init_tracing(&output, tracing_config) {
        if !output.quiet {
            eprintln!("{error:#}");
        }
        return None;
    }
    let runtime = match build_runtime(runtime) {
        Ok(runtime) => runtime,
        Err(error) => {
            tracing::error!("failed to build tokio runtime: {}", &error);
            if !output.quiet {
                eprintln!("failed to build tokio runtime: {error:#}");
            }
            return None;
        }
    };
    let res = runtime.block_on(func());
    match res {
        Ok(summary) => {
            if prints_summary(&output) {
                println!("{summary}");
            }
            Some(summary)
        }
        Err(error) => {
            if !output.quiet {
                eprintln!("{error:#}");
            }
            None
        }
    }
}
