//! Live transfer dashboard
//!
//! [`run_dashboard`] keeps the latest [`Metrics`] it received and, on every refresh
//! tick, appends the current input rate, output rate and buffer occupancy to their
//! series before handing the whole [`DashboardState`] to a [`DashboardSink`]. Series
//! are trimmed to what fits between the two border columns of the terminal.

use std::collections::VecDeque;
use std::io::{IsTerminal, Write};

use tracing::instrument;

use crate::progress::Metrics;

const SPARK_GLYPHS: [char; 8] = ['▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];

/// Width used when the terminal size cannot be queried.
pub const DEFAULT_WIDTH: usize = 80;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ProgressType {
    /// Progress bar if stderr is a terminal, text updates otherwise
    #[default]
    #[value(name = "auto", alias = "Auto")]
    Auto,
    /// Interactive multi-line dashboard
    #[value(name = "ProgressBar", alias = "progress-bar")]
    ProgressBar,
    /// One line of text per update, for logs and pipes
    #[value(name = "TextUpdates", alias = "text-updates")]
    TextUpdates,
}

impl ProgressType {
    /// Resolves `Auto` against whether stderr is a terminal.
    #[must_use]
    pub fn resolve(self, stderr_is_terminal: bool) -> ProgressType {
        match self {
            ProgressType::Auto if stderr_is_terminal => ProgressType::ProgressBar,
            ProgressType::Auto => ProgressType::TextUpdates,
            other => other,
        }
    }

    #[must_use]
    pub fn default_delay(self) -> std::time::Duration {
        match self {
            ProgressType::TextUpdates => std::time::Duration::from_secs(10),
            _ => std::time::Duration::from_secs(1),
        }
    }
}

#[derive(Copy, Clone, Debug, Default)]
pub struct ProgressSettings {
    pub progress_type: ProgressType,
    pub progress_delay: Option<std::time::Duration>,
}

impl ProgressSettings {
    /// Concrete display type and refresh delay for this process.
    #[must_use]
    pub fn resolve(&self) -> (ProgressType, std::time::Duration) {
        let progress_type = self
            .progress_type
            .resolve(std::io::stderr().is_terminal());
        let delay = self
            .progress_delay
            .unwrap_or_else(|| progress_type.default_delay());
        (progress_type, delay)
    }
}

/// `1234567` -> `"1,234,567"`
#[must_use]
pub fn thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (idx, ch) in digits.chars().enumerate() {
        if idx > 0 && (digits.len() - idx) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// Renders `series` as one glyph per point, scaled to the series maximum.
#[must_use]
pub fn sparkline<'a>(series: impl IntoIterator<Item = &'a u64> + Clone) -> String {
    let max = series.clone().into_iter().copied().max().unwrap_or(0);
    series
        .into_iter()
        .map(|&value| {
            if max == 0 {
                return SPARK_GLYPHS[0];
            }
            let idx = (value as u128 * (SPARK_GLYPHS.len() as u128 - 1) / max as u128) as usize;
            SPARK_GLYPHS[idx]
        })
        .collect()
}

/// Everything a dashboard sink needs to draw one frame.
#[derive(Debug, Clone)]
pub struct DashboardState {
    input_name: String,
    output_name: String,
    total_size: Option<u64>,
    metrics: Metrics,
    input: VecDeque<u64>,
    output: VecDeque<u64>,
    buffer: VecDeque<u64>,
    width: usize,
}

impl DashboardState {
    #[must_use]
    pub fn new(input_name: &str, output_name: &str, total_size: Option<u64>, width: usize) -> Self {
        Self {
            input_name: input_name.to_string(),
            output_name: output_name.to_string(),
            total_size,
            metrics: Metrics::default(),
            input: VecDeque::from([0]),
            output: VecDeque::from([0]),
            buffer: VecDeque::from([0]),
            width,
        }
    }

    pub fn update_metrics(&mut self, metrics: Metrics) {
        self.metrics = metrics;
    }

    #[must_use]
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Appends the latest values to the series and trims them to the current width.
    pub fn update_data(&mut self) {
        self.input.push_back(self.metrics.input_byte_sec);
        self.output.push_back(self.metrics.output_byte_sec);
        self.buffer.push_back(self.metrics.buffer_used);
        self.trim();
    }

    pub fn resize(&mut self, width: usize) {
        self.width = width;
        self.trim();
    }

    #[must_use]
    pub fn width(&self) -> usize {
        self.width
    }

    /// Number of points that fit between the border columns.
    #[must_use]
    pub fn max_points(&self) -> usize {
        self.width.saturating_sub(2).max(1)
    }

    fn trim(&mut self) {
        let max_points = self.max_points();
        for series in [&mut self.input, &mut self.output, &mut self.buffer] {
            if series.len() > max_points {
                series.drain(..series.len() - max_points);
            }
        }
    }

    #[must_use]
    pub fn input_series(&self) -> &VecDeque<u64> {
        &self.input
    }

    #[must_use]
    pub fn output_series(&self) -> &VecDeque<u64> {
        &self.output
    }

    #[must_use]
    pub fn buffer_series(&self) -> &VecDeque<u64> {
        &self.buffer
    }

    /// Whole percent of the expected total written so far; 0 when the total is unknown.
    #[must_use]
    pub fn progress_percent(&self) -> u64 {
        match self.total_size {
            Some(total) if total > 0 => {
                (self.metrics.size as u128 * 100 / total as u128).min(100) as u64
            }
            _ => 0,
        }
    }

    #[must_use]
    pub fn progress_title(&self) -> String {
        format!(
            "Progress:[{} / {} Byte], Average speed:[{}/Sec]",
            thousands(self.metrics.size),
            thousands(self.total_size.unwrap_or(0)),
            bytesize::ByteSize(self.metrics.avg_byte_sec),
        )
    }

    #[must_use]
    pub fn input_title(&self) -> String {
        format!(
            "input [{}] {}/sec (max: {}/sec)",
            self.input_name,
            bytesize::ByteSize(self.metrics.input_byte_sec),
            bytesize::ByteSize(self.metrics.input_max_byte_sec),
        )
    }

    #[must_use]
    pub fn output_title(&self) -> String {
        format!(
            "output [{}] {}/sec (max: {}/sec)",
            self.output_name,
            bytesize::ByteSize(self.metrics.output_byte_sec),
            bytesize::ByteSize(self.metrics.output_max_byte_sec),
        )
    }

    #[must_use]
    pub fn buffer_title(&self) -> String {
        format!(
            "{} (max: {})",
            bytesize::ByteSize(self.metrics.buffer_used),
            bytesize::ByteSize(self.metrics.buffer_max_used),
        )
    }
}

/// Destination for dashboard frames.
pub trait DashboardSink: Send {
    fn render(&mut self, state: &DashboardState);

    /// Called once after the last frame.
    fn finish(&mut self, _state: &DashboardState) {}
}

/// Draws nothing.
#[derive(Debug, Default)]
pub struct NullDashboard;

impl DashboardSink for NullDashboard {
    fn render(&mut self, _state: &DashboardState) {}
}

/// Multi-line terminal dashboard drawn on stderr.
pub struct TerminalDashboard {
    multi: indicatif::MultiProgress,
    header: indicatif::ProgressBar,
    input: indicatif::ProgressBar,
    output: indicatif::ProgressBar,
    buffer: indicatif::ProgressBar,
    progress: indicatif::ProgressBar,
}

impl TerminalDashboard {
    pub fn new() -> Result<Self, indicatif::style::TemplateError> {
        Self::with_draw_target(indicatif::ProgressDrawTarget::stderr())
    }

    pub fn with_draw_target(
        target: indicatif::ProgressDrawTarget,
    ) -> Result<Self, indicatif::style::TemplateError> {
        let multi = indicatif::MultiProgress::with_draw_target(target);
        let line = |template: &str| -> Result<indicatif::ProgressBar, indicatif::style::TemplateError> {
            let bar = multi.add(indicatif::ProgressBar::new_spinner());
            bar.set_style(indicatif::ProgressStyle::with_template(template)?);
            Ok(bar)
        };
        let header = line("{msg:.white}")?;
        header.set_message("PRESS ctrl+[c] TO QUIT");
        let input = line("{prefix}\n{msg:.green}")?;
        let output = line("{prefix}\n{msg:.red}")?;
        let buffer = line("Buffer used: {prefix}\n{msg:.yellow}")?;
        let progress = multi.add(indicatif::ProgressBar::new(100));
        progress.set_style(
            indicatif::ProgressStyle::with_template("{prefix:.cyan}\n[{wide_bar:.green}] {pos:>3}%")?
                .progress_chars("=> "),
        );
        Ok(Self {
            multi,
            header,
            input,
            output,
            buffer,
            progress,
        })
    }
}

impl DashboardSink for TerminalDashboard {
    fn render(&mut self, state: &DashboardState) {
        self.input.set_prefix(state.input_title());
        self.input.set_message(sparkline(state.input_series()));
        self.output.set_prefix(state.output_title());
        self.output.set_message(sparkline(state.output_series()));
        self.buffer.set_prefix(state.buffer_title());
        self.buffer.set_message(sparkline(state.buffer_series()));
        self.progress.set_prefix(state.progress_title());
        self.progress.set_position(state.progress_percent());
    }

    /// Leaves the last frame on screen, minus the quit hint.
    fn finish(&mut self, state: &DashboardState) {
        self.render(state);
        self.header.finish_and_clear();
        for bar in [&self.input, &self.output, &self.buffer, &self.progress] {
            bar.finish();
        }
    }
}

/// One line of text per frame.
pub struct TextDashboard {
    out: Box<dyn std::io::Write + Send>,
}

impl TextDashboard {
    #[must_use]
    pub fn new(out: Box<dyn std::io::Write + Send>) -> Self {
        Self { out }
    }

    #[must_use]
    pub fn stderr() -> Self {
        Self::new(Box::new(std::io::stderr()))
    }

    fn line(state: &DashboardState) -> String {
        format!(
            "{} {}% | {} | {} | buffer {}",
            state.progress_title(),
            state.progress_percent(),
            state.input_title(),
            state.output_title(),
            state.buffer_title(),
        )
    }
}

impl DashboardSink for TextDashboard {
    fn render(&mut self, state: &DashboardState) {
        if let Err(error) = writeln!(self.out, "{}", Self::line(state)) {
            tracing::debug!("failed writing progress update: {}", &error);
        }
    }

    fn finish(&mut self, state: &DashboardState) {
        self.render(state);
        if let Err(error) = self.out.flush() {
            tracing::debug!("failed flushing progress updates: {}", &error);
        }
    }
}

/// Picks the sink for a resolved progress type, falling back to text output.
#[must_use]
pub fn make_sink(progress_type: ProgressType) -> Box<dyn DashboardSink> {
    match progress_type {
        ProgressType::TextUpdates => Box::new(TextDashboard::stderr()),
        ProgressType::Auto | ProgressType::ProgressBar => match TerminalDashboard::new() {
            Ok(dashboard) => Box::new(dashboard),
            Err(error) => {
                tracing::warn!("cannot draw progress bars ({}), using text updates", &error);
                Box::new(TextDashboard::stderr())
            }
        },
    }
}

/// Current width of the terminal attached to stderr.
#[must_use]
pub fn terminal_width() -> usize {
    width_or_default(indicatif::ProgressDrawTarget::stderr().width())
}

fn width_or_default(width: Option<u16>) -> usize {
    match width {
        Some(width) if width > 0 => usize::from(width),
        _ => DEFAULT_WIDTH,
    }
}

async fn window_changed(signal: &mut Option<tokio::signal::unix::Signal>) {
    match signal {
        Some(signal) => {
            if signal.recv().await.is_none() {
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending::<()>().await,
    }
}

/// Feeds the sink until `cancel` fires, then draws one last frame.
///
/// With `watch_resize` set the state is resized to the terminal width on SIGWINCH.
#[instrument(skip_all)]
pub async fn run_dashboard(
    mut state: DashboardState,
    mut sink: Box<dyn DashboardSink>,
    mut metrics: tokio::sync::mpsc::Receiver<Metrics>,
    refresh: std::time::Duration,
    watch_resize: bool,
    cancel: tokio_util::sync::CancellationToken,
) -> DashboardState {
    let mut resize = if watch_resize {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::window_change()) {
            Ok(signal) => Some(signal),
            Err(error) => {
                tracing::warn!("cannot watch terminal size: {}", &error);
                None
            }
        }
    } else {
        None
    };
    let mut ticker =
        tokio::time::interval_at(tokio::time::Instant::now() + refresh, refresh);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut metrics_open = true;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            update = metrics.recv(), if metrics_open => match update {
                Some(update) => state.update_metrics(update),
                None => metrics_open = false,
            },
            () = window_changed(&mut resize) => {
                let width = terminal_width();
                tracing::trace!("terminal resized to {} columns", width);
                state.resize(width);
                sink.render(&state);
            }
            _ = ticker.tick() => {
                state.update_data();
                sink.render(&state);
            }
        }
    }
    // pick up whatever the sampler sent last
    while let Ok(update) = metrics.try_recv() {
        state.update_metrics(update);
    }
    sink.finish(&state);
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    /// Collects the rendered frames.
    #[derive(Clone, Default)]
    struct RecordingDashboard {
        frames: Arc<parking_lot::Mutex<Vec<DashboardState>>>,
        finished: Arc<std::sync::atomic::AtomicBool>,
    }

    impl DashboardSink for RecordingDashboard {
        fn render(&mut self, state: &DashboardState) {
            self.frames.lock().push(state.clone());
        }

        fn finish(&mut self, _state: &DashboardState) {
            self.finished
                .store(true, std::sync::atomic::Ordering::Release);
        }
    }

    fn metrics(size: u64, input: u64, output: u64, buffer: u64) -> Metrics {
        Metrics {
            size,
            input_byte_sec: input,
            output_byte_sec: output,
            buffer_used: buffer,
            ..Default::default()
        }
    }

    #[test]
    fn formats_thousands() {
        assert_eq!(thousands(0), "0");
        assert_eq!(thousands(999), "999");
        assert_eq!(thousands(1000), "1,000");
        assert_eq!(thousands(10_485_760), "10,485,760");
    }

    #[test]
    fn sparkline_scales_to_max() {
        assert_eq!(sparkline(&[0, 0, 0]), "▁▁▁");
        assert_eq!(sparkline(&[0, 7, 14]), "▁▄█");
        assert_eq!(sparkline(&[] as &[u64]), "");
    }

    #[test]
    fn progress_percent_guards_zero_total() {
        let mut state = DashboardState::new("in", "out", None, 80);
        state.update_metrics(metrics(500, 0, 0, 0));
        assert_eq!(state.progress_percent(), 0);
        let mut state = DashboardState::new("in", "out", Some(0), 80);
        state.update_metrics(metrics(500, 0, 0, 0));
        assert_eq!(state.progress_percent(), 0);
        let mut state = DashboardState::new("in", "out", Some(1000), 80);
        state.update_metrics(metrics(500, 0, 0, 0));
        assert_eq!(state.progress_percent(), 50);
        state.update_metrics(metrics(5000, 0, 0, 0));
        assert_eq!(state.progress_percent(), 100);
    }

    #[test]
    fn series_are_trimmed_to_width() {
        let mut state = DashboardState::new("in", "out", None, 10);
        for i in 0..20 {
            state.update_metrics(metrics(0, i, i * 2, i * 3));
            state.update_data();
        }
        assert_eq!(state.input_series().len(), 8);
        assert_eq!(state.output_series().len(), 8);
        assert_eq!(state.buffer_series().len(), 8);
        // the newest points are kept
        assert_eq!(state.input_series().back(), Some(&19));
        assert_eq!(state.input_series().front(), Some(&12));
        state.resize(5);
        assert_eq!(state.input_series().len(), 3);
        assert_eq!(state.input_series().front(), Some(&17));
        // a degenerate terminal still shows the latest point
        state.resize(1);
        assert_eq!(state.buffer_series().len(), 1);
        assert_eq!(state.buffer_series().back(), Some(&57));
    }

    #[test]
    fn titles() {
        let mut state = DashboardState::new("/tmp/input", "127.0.0.1:1987", Some(2_000_000), 80);
        state.update_metrics(Metrics {
            size: 1_000_000,
            avg_byte_sec: 0,
            input_byte_sec: 0,
            input_max_byte_sec: 0,
            output_byte_sec: 0,
            output_max_byte_sec: 0,
            buffer_used: 0,
            buffer_max_used: 0,
        });
        assert_eq!(
            state.progress_title(),
            format!(
                "Progress:[1,000,000 / 2,000,000 Byte], Average speed:[{}/Sec]",
                bytesize::ByteSize(0)
            )
        );
        assert!(state.input_title().starts_with("input [/tmp/input] "));
        assert!(state.output_title().starts_with("output [127.0.0.1:1987] "));
        assert!(state.buffer_title().contains("(max: "));
    }

    #[test]
    fn text_dashboard_writes_one_line_per_frame() {
        #[derive(Clone, Default)]
        struct Shared(Arc<parking_lot::Mutex<Vec<u8>>>);
        impl std::io::Write for Shared {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }
        let out = Shared::default();
        let mut dashboard = TextDashboard::new(Box::new(out.clone()));
        let mut state = DashboardState::new("in", "out", Some(100), 80);
        state.update_metrics(metrics(25, 0, 0, 0));
        dashboard.render(&state);
        dashboard.finish(&state);
        let text = String::from_utf8(out.0.lock().clone()).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.lines().all(|line| line.contains(" 25% | input [in]")));
    }

    #[test]
    fn terminal_dashboard_keeps_last_frame() -> anyhow::Result<()> {
        let term = indicatif::InMemoryTerm::new(20, 100);
        let mut dashboard = TerminalDashboard::with_draw_target(
            indicatif::ProgressDrawTarget::term_like(Box::new(term.clone())),
        )?;
        let mut state = DashboardState::new("in", "out", Some(100), 98);
        state.update_metrics(metrics(100, 10, 10, 0));
        state.update_data();
        dashboard.render(&state);
        dashboard.finish(&state);
        let screen = term.contents();
        assert!(screen.contains("input [in]"));
        assert!(screen.contains("output [out]"));
        assert!(screen.contains("Progress:[100 / 100 Byte]"));
        assert!(screen.contains("100%"));
        Ok(())
    }

    #[test]
    #[tracing_test::traced_test]
    fn text_dashboard_logs_flush_errors() {
        struct Unflushable;
        impl std::io::Write for Unflushable {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Err(std::io::Error::from(std::io::ErrorKind::BrokenPipe))
            }
        }
        let mut dashboard = TextDashboard::new(Box::new(Unflushable));
        dashboard.finish(&DashboardState::new("in", "out", None, 80));
        assert!(logs_contain("failed flushing progress updates"));
    }

    #[test]
    fn unknown_width_falls_back() {
        assert_eq!(width_or_default(None), DEFAULT_WIDTH);
        assert_eq!(width_or_default(Some(0)), DEFAULT_WIDTH);
        assert_eq!(width_or_default(Some(132)), 132);
        assert!(terminal_width() > 0);
    }

    #[test]
    fn auto_resolves_by_terminal() {
        assert_eq!(ProgressType::Auto.resolve(true), ProgressType::ProgressBar);
        assert_eq!(ProgressType::Auto.resolve(false), ProgressType::TextUpdates);
        assert_eq!(
            ProgressType::TextUpdates.resolve(true),
            ProgressType::TextUpdates
        );
        assert_eq!(
            ProgressType::TextUpdates.default_delay(),
            Duration::from_secs(10)
        );
        assert_eq!(
            ProgressType::ProgressBar.default_delay(),
            Duration::from_secs(1)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn renders_on_every_tick_until_cancelled() {
        let (sender, receiver) = tokio::sync::mpsc::channel(4);
        let cancel = tokio_util::sync::CancellationToken::new();
        let sink = RecordingDashboard::default();
        let task = tokio::spawn(run_dashboard(
            DashboardState::new("in", "out", Some(4000), 80),
            Box::new(sink.clone()),
            receiver,
            Duration::from_secs(1),
            false,
            cancel.clone(),
        ));
        sender.send(metrics(1000, 1000, 1000, 0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        sender.send(metrics(3000, 2000, 2000, 0)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
        let state = task.await.unwrap();
        let frames = sink.frames.lock().clone();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].progress_percent(), 25);
        assert_eq!(frames[1].progress_percent(), 75);
        assert_eq!(
            frames[1].input_series().iter().copied().collect::<Vec<_>>(),
            vec![0, 1000, 2000]
        );
        assert_eq!(state.metrics().size, 3000);
        assert!(sink.finished.load(std::sync::atomic::Ordering::Acquire));
    }

    #[tokio::test(start_paused = true)]
    async fn closed_metrics_channel_keeps_dashboard_alive() {
        let (sender, receiver) = tokio::sync::mpsc::channel(4);
        let cancel = tokio_util::sync::CancellationToken::new();
        let sink = RecordingDashboard::default();
        let task = tokio::spawn(run_dashboard(
            DashboardState::new("in", "out", None, 80),
            Box::new(sink.clone()),
            receiver,
            Duration::from_secs(1),
            false,
            cancel.clone(),
        ));
        drop(sender);
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert!(!task.is_finished());
        cancel.cancel();
        task.await.unwrap();
        assert_eq!(sink.frames.lock().len(), 3);
    }
}
