//! Reader/writer copy pipeline
//!
//! The buffered strategy runs two tasks joined by a bounded FIFO queue:
//!
//! ```text
//! source -> [reader] -> queue(max_buf_num) -> [writer] -> sink
//!              ^                                  |
//!              +------------ buffer pool <--------+
//! ```
//!
//! The reader fills pooled buffers and enqueues them, the writer drains the queue and
//! lets each buffer go back to the pool once written. Since a buffer must be acquired
//! before it can be queued, pool exhaustion is what throttles a fast reader down to the
//! writer's pace.
//!
//! Both tasks watch one cancellation token at every point where they can wait. A failed
//! writer fires the token itself; a failed reader only closes the queue so that
//! everything it already read still reaches the sink.
//!
//! The direct strategy skips the pool and the queue entirely and copies in a single loop.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, instrument};

use crate::config::{ConfigError, CopyStrategy};
use crate::pool::{Buffer, BufferPool};
use crate::progress::Counters;
use crate::streams::{BoxedRead, BoxedWrite};

#[derive(Debug, thiserror::Error)]
pub enum Failure {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed opening source {0}")]
    SourceOpen(String, #[source] std::io::Error),
    #[error("failed opening sink {0}")]
    SinkOpen(String, #[source] std::io::Error),
    #[error("failed reading from source")]
    Source(#[source] std::io::Error),
    #[error("failed writing to sink")]
    Sink(#[source] std::io::Error),
    #[error("transfer cancelled")]
    Cancelled,
    #[error("transfer task failed")]
    Task(#[from] tokio::task::JoinError),
}

impl Failure {
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Failure::Cancelled)
    }
}

/// Error type for transfers that preserves the partial summary on failure.
///
/// The Display implementation shows the full error chain, so it can be logged with any
/// format specifier.
#[derive(Debug)]
pub struct Error {
    pub failure: Failure,
    pub summary: Summary,
}

impl Error {
    #[must_use]
    pub fn new(failure: Failure, summary: Summary) -> Self {
        Error { failure, summary }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.failure)?;
        let mut source = std::error::Error::source(&self.failure);
        while let Some(error) = source {
            write!(f, ": {error}")?;
            source = error.source();
        }
        Ok(())
    }
}

impl std::error::Error for Error {}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    /// Bytes taken from the source
    pub bytes_read: u64,
    /// Bytes committed to the sink
    pub bytes_transferred: u64,
    pub elapsed: std::time::Duration,
}

impl Summary {
    /// Average bytes per second over the whole run.
    #[must_use]
    pub fn bytes_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.bytes_transferred as f64 / secs
        } else {
            0.0
        }
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let rate = self.bytes_per_sec();
        let mib = 1024.0 * 1024.0;
        let gib = mib * 1024.0;
        write!(
            f,
            "time:  {:?}\n\
            size:  {} ({})\n\
            {:.0} Byte/sec  ({:.0} bit/sec)\n\
            {:.4} MByte/sec ({:.4} Mbit/sec)\n\
            {:.4} GByte/sec ({:.4} Gbit/sec)",
            self.elapsed,
            self.bytes_transferred,
            bytesize::ByteSize(self.bytes_transferred),
            rate,
            rate * 8.0,
            rate / mib,
            rate * 8.0 / mib,
            rate / gib,
            rate * 8.0 / gib,
        )
    }
}

/// Everything one run of the pipeline shares between its tasks.
#[derive(Clone)]
pub struct Context {
    pub counters: Arc<Counters>,
    pub throttle: Option<Arc<throttle::Throttle>>,
    pub cancel: CancellationToken,
}

/// Outcome of a single pipeline task.
#[derive(Debug)]
struct TaskResult {
    bytes: u64,
    error: Option<Failure>,
}

impl TaskResult {
    fn ok(bytes: u64) -> Self {
        Self { bytes, error: None }
    }

    fn failed(bytes: u64, error: Failure) -> Self {
        Self {
            bytes,
            error: Some(error),
        }
    }

    fn cancelled(bytes: u64) -> Self {
        Self::failed(bytes, Failure::Cancelled)
    }
}

/// Copies `reader` into `writer` using the given strategy.
///
/// Returns once every task the strategy started has finished.
#[instrument(skip(reader, writer, ctx))]
pub async fn copy(
    strategy: CopyStrategy,
    reader: BoxedRead,
    writer: BoxedWrite,
    ctx: &Context,
) -> Result<Summary, Error> {
    let start_time = tokio::time::Instant::now();
    let (bytes_read, bytes_transferred, error) = match strategy {
        CopyStrategy::Buffered {
            max_buf_num,
            buf_size,
        } => buffered_copy(max_buf_num, buf_size, reader, writer, ctx).await,
        CopyStrategy::Direct { buf_size } => direct_copy(buf_size, reader, writer, ctx).await,
    };
    let summary = Summary {
        bytes_read,
        bytes_transferred,
        elapsed: start_time.elapsed(),
    };
    match error {
        Some(failure) => Err(Error::new(failure, summary)),
        None => Ok(summary),
    }
}

async fn buffered_copy(
    max_buf_num: usize,
    buf_size: usize,
    reader: BoxedRead,
    writer: BoxedWrite,
    ctx: &Context,
) -> (u64, u64, Option<Failure>) {
    let pool = BufferPool::new(max_buf_num, buf_size);
    let (queue_send, queue_recv) = tokio::sync::mpsc::channel(max_buf_num);
    let read_task = tokio::spawn(
        read_worker(reader, pool.clone(), queue_send, ctx.clone()).in_current_span(),
    );
    let write_task =
        tokio::spawn(write_worker(writer, pool, queue_recv, ctx.clone()).in_current_span());
    // both tasks are always joined, so no buffer outlives the run
    let (read_res, write_res) = tokio::join!(read_task, write_task);
    let read_res = read_res.unwrap_or_else(|err| TaskResult::failed(0, err.into()));
    let write_res = write_res.unwrap_or_else(|err| TaskResult::failed(0, err.into()));
    tracing::debug!(
        "reader finished: {:?}, writer finished: {:?}",
        &read_res,
        &write_res
    );
    let error = overall_error(read_res.error, write_res.error);
    (read_res.bytes, write_res.bytes, error)
}

/// Picks the error that describes the run: a real reader failure first, then a real
/// writer failure; cancellation only if neither task failed on its own.
fn overall_error(reader: Option<Failure>, writer: Option<Failure>) -> Option<Failure> {
    match (reader, writer) {
        (Some(read_err), _) if !read_err.is_cancelled() => Some(read_err),
        (_, Some(write_err)) if !write_err.is_cancelled() => Some(write_err),
        (Some(cancelled), _) | (None, Some(cancelled)) => Some(cancelled),
        (None, None) => None,
    }
}

/// Reads from the source, retrying reads that were merely interrupted.
async fn read_some(reader: &mut BoxedRead, buf: &mut [u8]) -> std::io::Result<usize> {
    loop {
        match reader.read(buf).await {
            Err(error) if error.kind() == std::io::ErrorKind::Interrupted => continue,
            res => return res,
        }
    }
}

async fn take_token(ctx: &Context) -> bool {
    match &ctx.throttle {
        None => true,
        Some(throttle) => tokio::select! {
            _ = ctx.cancel.cancelled() => false,
            _ = throttle.get_token() => true,
        },
    }
}

#[instrument(skip_all)]
async fn read_worker(
    mut reader: BoxedRead,
    pool: Arc<BufferPool>,
    queue: tokio::sync::mpsc::Sender<Buffer>,
    ctx: Context,
) -> TaskResult {
    let mut bytes = 0u64;
    // dropping `queue` on return closes it, on every path
    loop {
        let mut buffer = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return TaskResult::cancelled(bytes),
            buffer = pool.acquire() => match buffer {
                Ok(buffer) => buffer,
                Err(_) => return TaskResult::cancelled(bytes),
            },
        };
        if !take_token(&ctx).await {
            return TaskResult::cancelled(bytes);
        }
        let n = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return TaskResult::cancelled(bytes),
            res = read_some(&mut reader, buffer.space_mut()) => match res {
                Ok(n) => n,
                Err(error) => {
                    tracing::error!("read failed after {} bytes: {}", bytes, &error);
                    return TaskResult::failed(bytes, Failure::Source(error));
                }
            },
        };
        if n == 0 {
            tracing::debug!("end of stream after {} bytes", bytes);
            return TaskResult::ok(bytes);
        }
        buffer.set_len(n);
        bytes += n as u64;
        ctx.counters.add_input(n as u64);
        ctx.counters.buffer_queued();
        let sent = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => None,
            res = queue.send(buffer) => Some(res.is_ok()),
        };
        match sent {
            Some(true) => {}
            Some(false) => {
                ctx.counters.buffer_dequeued();
                tracing::debug!("writer is gone, stopping reader");
                return TaskResult::cancelled(bytes);
            }
            None => {
                ctx.counters.buffer_dequeued();
                return TaskResult::cancelled(bytes);
            }
        }
    }
}

#[instrument(skip_all)]
async fn write_worker(
    mut writer: BoxedWrite,
    pool: Arc<BufferPool>,
    mut queue: tokio::sync::mpsc::Receiver<Buffer>,
    ctx: Context,
) -> TaskResult {
    let mut bytes = 0u64;
    let abort = |bytes: u64, error: std::io::Error| {
        tracing::error!("write failed after {} bytes: {}", bytes, &error);
        // wake up a reader parked on the pool or the queue
        pool.close();
        ctx.cancel.cancel();
        TaskResult::failed(bytes, Failure::Sink(error))
    };
    loop {
        let buffer = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return TaskResult::cancelled(bytes),
            buffer = queue.recv() => buffer,
        };
        // closed and drained
        let Some(buffer) = buffer else { break };
        ctx.counters.buffer_dequeued();
        let res = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return TaskResult::cancelled(bytes),
            res = writer.write_all(&buffer) => res,
        };
        if let Err(error) = res {
            return abort(bytes, error);
        }
        let n = buffer.len() as u64;
        pool.release(buffer);
        bytes += n;
        ctx.counters.add_output(n);
    }
    let res = tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => return TaskResult::cancelled(bytes),
        res = writer.shutdown() => res,
    };
    if let Err(error) = res {
        return abort(bytes, error);
    }
    tracing::debug!("writer done after {} bytes", bytes);
    TaskResult::ok(bytes)
}

#[instrument(skip(reader, writer, ctx))]
async fn direct_copy(
    buf_size: usize,
    mut reader: BoxedRead,
    mut writer: BoxedWrite,
    ctx: &Context,
) -> (u64, u64, Option<Failure>) {
    let mut buf = vec![0u8; buf_size];
    let mut bytes_read = 0u64;
    let mut bytes_written = 0u64;
    let cancelled = |read: u64, written: u64| (read, written, Some(Failure::Cancelled));
    loop {
        if !take_token(ctx).await {
            return cancelled(bytes_read, bytes_written);
        }
        let n = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return cancelled(bytes_read, bytes_written),
            res = read_some(&mut reader, &mut buf) => match res {
                Ok(n) => n,
                Err(error) => return (bytes_read, bytes_written, Some(Failure::Source(error))),
            },
        };
        if n == 0 {
            break;
        }
        bytes_read += n as u64;
        ctx.counters.add_input(n as u64);
        let res = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return cancelled(bytes_read, bytes_written),
            res = writer.write_all(&buf[..n]) => res,
        };
        if let Err(error) = res {
            return (bytes_read, bytes_written, Some(Failure::Sink(error)));
        }
        bytes_written += n as u64;
        ctx.counters.add_output(n as u64);
    }
    let res = tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => return cancelled(bytes_read, bytes_written),
        res = writer.shutdown() => res,
    };
    match res {
        Ok(()) => (bytes_read, bytes_written, None),
        Err(error) => (bytes_read, bytes_written, Some(Failure::Sink(error))),
    }
}
