//! One complete transfer: endpoints, pipeline and monitoring under a single cancellation scope

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::config::{ThrottleConfig, TransferConfig};
use crate::dashboard::{self, DashboardState, ProgressSettings, ProgressType};
use crate::pipeline::{self, Error, Failure, Summary};
use crate::progress::{self, Counters};
use crate::streams::{EndpointConfig, OpenedSink, OpenedSource, Sink, Source};

/// How often counters are turned into a metrics snapshot
pub const SAMPLE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub transfer: TransferConfig,
    pub endpoints: EndpointConfig,
    /// Live dashboard; `None` disables it
    pub progress: Option<ProgressSettings>,
    pub throttle: ThrottleConfig,
}

fn failed_before_start(failure: Failure, start_time: tokio::time::Instant) -> Error {
    Error::new(
        failure,
        Summary {
            elapsed: start_time.elapsed(),
            ..Default::default()
        },
    )
}

async fn open_source(source: &Source, cancel: &CancellationToken) -> Result<OpenedSource, Failure> {
    tokio::select! {
        _ = cancel.cancelled() => Err(Failure::Cancelled),
        res = source.open() => res.map_err(|err| Failure::SourceOpen(source.to_string(), err)),
    }
}

async fn open_sink(sink: &Sink, cancel: &CancellationToken) -> Result<OpenedSink, Failure> {
    tokio::select! {
        _ = cancel.cancelled() => Err(Failure::Cancelled),
        res = sink.open() => res.map_err(|err| Failure::SinkOpen(sink.to_string(), err)),
    }
}

/// Runs one transfer to completion.
///
/// Endpoints are resolved and validated before any I/O happens, so configuration and
/// open failures report zero bytes. When the source is a listening socket the sink is
/// opened first, so an unusable output is reported before any peer is accepted. Every task started here is joined before returning.
/// Ctrl-C (or cancelling `cancel`) stops the transfer with [`Failure::Cancelled`].
#[instrument(skip(cancel))]
pub async fn run(settings: &Settings, cancel: CancellationToken) -> Result<Summary, Error> {
    let start_time = tokio::time::Instant::now();
    let (source, sink) = settings
        .endpoints
        .resolve()
        .map_err(|err| failed_before_start(err.into(), start_time))?;
    let strategy = settings
        .transfer
        .strategy()
        .map_err(|err| failed_before_start(err.into(), start_time))?;
    tracing::info!("transfer {} -> {} using {:?}", &source, &sink, &strategy);
    tracing::info!(
        "buffers hold at most {}",
        bytesize::ByteSize(settings.transfer.max_buffered_bytes())
    );
    let (opened_source, opened_sink) = if matches!(source, Source::Listen(_)) {
        // the output must be ready before a peer connects and starts sending
        let opened_sink = open_sink(&sink, &cancel)
            .await
            .map_err(|failure| failed_before_start(failure, start_time))?;
        let opened_source = open_source(&source, &cancel)
            .await
            .map_err(|failure| failed_before_start(failure, start_time))?;
        (opened_source, opened_sink)
    } else {
        let opened_source = open_source(&source, &cancel)
            .await
            .map_err(|failure| failed_before_start(failure, start_time))?;
        let opened_sink = open_sink(&sink, &cancel)
            .await
            .map_err(|failure| failed_before_start(failure, start_time))?;
        (opened_source, opened_sink)
    };
    let counters = Arc::new(Counters::new());
    // everything except the pipeline itself lives in this scope
    let monitor = cancel.child_token();
    let mut tasks = Vec::new();
    let throttle = throttle::Throttle::per_second(settings.throttle.iops_throttle).map(Arc::new);
    if let Some(throttle) = &throttle {
        tracing::info!("throttling reads to {:?}", throttle.schedule());
        let throttle = throttle.clone();
        let monitor = monitor.clone();
        tasks.push(tokio::spawn(async move {
            tokio::select! {
                _ = monitor.cancelled() => {},
                _ = throttle.run_replenish() => {},
            }
            throttle.close();
        }));
    }
    let (metrics_send, metrics_recv) = tokio::sync::mpsc::channel(1);
    let buf_size = settings.transfer.buf_size;
    // stopped ahead of the dashboard so its last sample gets drawn
    let sampler_cancel = monitor.child_token();
    let sampler = tokio::spawn(progress::run_sampler(
        progress::Sampler::new(counters.clone(), buf_size, tokio::time::Instant::now()),
        SAMPLE_INTERVAL,
        metrics_send,
        sampler_cancel.clone(),
    ));
    let (sink_impl, refresh, watch_resize): (Box<dyn dashboard::DashboardSink>, _, _) =
        match &settings.progress {
            Some(progress) => {
                let (progress_type, delay) = progress.resolve();
                (
                    dashboard::make_sink(progress_type),
                    delay,
                    progress_type == ProgressType::ProgressBar,
                )
            }
            None => (Box::new(dashboard::NullDashboard), SAMPLE_INTERVAL, false),
        };
    let width = if watch_resize {
        dashboard::terminal_width()
    } else {
        dashboard::DEFAULT_WIDTH
    };
    let state = DashboardState::new(
        &opened_source.name,
        &opened_sink.name,
        opened_source.size,
        width,
    );
    {
        let monitor = monitor.clone();
        tasks.push(tokio::spawn(async move {
            dashboard::run_dashboard(
                state,
                sink_impl,
                metrics_recv,
                refresh,
                watch_resize,
                monitor,
            )
            .await;
        }));
    }
    {
        let cancel = cancel.clone();
        let monitor = monitor.clone();
        tasks.push(tokio::spawn(async move {
            tokio::select! {
                _ = monitor.cancelled() => {},
                res = tokio::signal::ctrl_c() => match res {
                    Ok(()) => {
                        tracing::warn!("interrupted, stopping transfer");
                        cancel.cancel();
                    }
                    Err(error) => tracing::warn!("cannot listen for Ctrl-C: {}", &error),
                },
            }
        }));
    }
    let ctx = pipeline::Context {
        counters,
        throttle,
        cancel: cancel.child_token(),
    };
    let res = pipeline::copy(strategy, opened_source.reader, opened_sink.writer, &ctx).await;
    sampler_cancel.cancel();
    if let Err(error) = sampler.await {
        tracing::error!("metrics sampler failed: {}", &error);
    }
    // stops the throttle, dashboard and signal watcher but not the caller's token
    monitor.cancel();
    for task in tasks {
        if let Err(error) = task.await {
            tracing::error!("monitoring task failed: {}", &error);
        }
    }
    match &res {
        Ok(summary) => tracing::info!("transferred {} bytes", summary.bytes_transferred),
        Err(error) => tracing::error!(
            "transfer failed after {} bytes: {}",
            error.summary.bytes_transferred,
            error
        ),
    }
    res
}
