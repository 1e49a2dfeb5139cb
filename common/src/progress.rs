use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::Instant;
use tracing::instrument;

/// Lock-free counters shared by the reader, the writer and the sampler.
#[derive(Debug, Default)]
pub struct Counters {
    input_bytes: AtomicU64,
    output_bytes: AtomicU64,
    queued_buffers: AtomicU64,
}

impl Counters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_input(&self, bytes: u64) {
        self.input_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_output(&self, bytes: u64) {
        self.output_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn buffer_queued(&self) {
        self.queued_buffers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn buffer_dequeued(&self) {
        // saturate instead of wrapping if a dequeue is ever observed before its enqueue
        let _ = self
            .queued_buffers
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }

    #[must_use]
    pub fn input_bytes(&self) -> u64 {
        self.input_bytes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn output_bytes(&self) -> u64 {
        self.output_bytes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn queued_buffers(&self) -> u64 {
        self.queued_buffers.load(Ordering::Relaxed)
    }
}

/// One sampling tick worth of throughput and buffer statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Metrics {
    /// Bytes written to the sink so far
    pub size: u64,
    pub avg_byte_sec: u64,
    pub input_byte_sec: u64,
    pub input_max_byte_sec: u64,
    pub output_byte_sec: u64,
    pub output_max_byte_sec: u64,
    /// Bytes held by buffers waiting in the queue
    pub buffer_used: u64,
    pub buffer_max_used: u64,
}

/// Bytes per second for `bytes` moved over `elapsed`; zero for an empty interval.
#[must_use]
pub fn rate(bytes: u64, elapsed: std::time::Duration) -> u64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0;
    }
    (bytes as f64 / secs) as u64
}

/// Turns counter readings into [`Metrics`], remembering the previous tick.
#[derive(Debug)]
pub struct Sampler {
    counters: std::sync::Arc<Counters>,
    buf_size: u64,
    start_time: Instant,
    last_input: u64,
    last_output: u64,
    last_update: Instant,
    input_max: u64,
    output_max: u64,
    buffer_max: u64,
}

impl Sampler {
    #[must_use]
    pub fn new(counters: std::sync::Arc<Counters>, buf_size: usize, start_time: Instant) -> Self {
        Self {
            last_input: counters.input_bytes(),
            last_output: counters.output_bytes(),
            counters,
            buf_size: buf_size as u64,
            start_time,
            last_update: start_time,
            input_max: 0,
            output_max: 0,
            buffer_max: 0,
        }
    }

    pub fn sample(&mut self, time_now: Instant) -> Metrics {
        let input = self.counters.input_bytes();
        let output = self.counters.output_bytes();
        let curr_duration = time_now.saturating_duration_since(self.last_update);
        let total_duration = time_now.saturating_duration_since(self.start_time);
        let input_byte_sec = rate(input.saturating_sub(self.last_input), curr_duration);
        let output_byte_sec = rate(output.saturating_sub(self.last_output), curr_duration);
        let buffer_used = self.counters.queued_buffers() * self.buf_size;
        self.input_max = self.input_max.max(input_byte_sec);
        self.output_max = self.output_max.max(output_byte_sec);
        self.buffer_max = self.buffer_max.max(buffer_used);
        // update self
        self.last_input = input;
        self.last_output = output;
        self.last_update = time_now;
        Metrics {
            size: output,
            avg_byte_sec: rate(output, total_duration),
            input_byte_sec,
            input_max_byte_sec: self.input_max,
            output_byte_sec,
            output_max_byte_sec: self.output_max,
            buffer_used,
            buffer_max_used: self.buffer_max,
        }
    }
}

/// Emits one [`Metrics`] per `interval` until cancelled or until nobody listens.
///
/// The first sample is taken one full interval after start. A busy consumer misses the
/// tick rather than slowing the sampler down. Cancellation emits one last sample, waiting
/// for room in the channel, so the consumer always sees the final counters.
#[instrument(skip_all)]
pub async fn run_sampler(
    mut sampler: Sampler,
    interval: std::time::Duration,
    sender: tokio::sync::mpsc::Sender<Metrics>,
    cancel: tokio_util::sync::CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        let time_now = tokio::select! {
            _ = cancel.cancelled() => {
                let metrics = sampler.sample(Instant::now());
                tracing::trace!("final sample: {:?}", &metrics);
                if sender.send(metrics).await.is_err() {
                    tracing::debug!("metrics consumer gone before the final sample");
                }
                break;
            }
            time_now = ticker.tick() => time_now,
        };
        let metrics = sampler.sample(time_now);
        tracing::trace!("sampled: {:?}", &metrics);
        match sender.try_send(metrics) {
            Ok(()) => {}
            Err(tokio::sync::mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!("metrics consumer busy, dropping sample");
            }
            Err(tokio::sync::mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("metrics consumer gone, stopping sampler");
                break;
            }
        }
    }
}
