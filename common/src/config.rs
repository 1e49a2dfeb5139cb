//! Configuration types for runtime, output and transfer settings

/// Default number of pooled buffers
pub const DEFAULT_MAX_BUF_NUM: usize = 100;
/// Default size of a single pooled buffer (10 MiB)
pub const DEFAULT_BUF_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no source specified, use an input file, a listen address or --dummy-input")]
    NoSource,
    #[error("multiple sources specified: {}", .0.join(", "))]
    MultipleSources(Vec<String>),
    #[error("no sink specified, use an output file, a dial address or --dummy-output")]
    NoSink,
    #[error("multiple sinks specified: {}", .0.join(", "))]
    MultipleSinks(Vec<String>),
    #[error("maximum number of buffers must be greater than 0")]
    ZeroBufNum,
    #[error("maximum number of buffers must not exceed {max}, got {0}", max = tokio::sync::Semaphore::MAX_PERMITS)]
    TooManyBuffers(usize),
    #[error("buffer size must be greater than 0")]
    ZeroBufSize,
}

/// Runtime configuration for tokio and thread pools
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = number of CPU cores)
    pub max_workers: usize,
    /// Number of blocking threads (0 = tokio default of 512)
    pub max_blocking_threads: usize,
}

/// Throttling configuration for resource control
#[derive(Debug, Clone, Copy, Default)]
pub struct ThrottleConfig {
    /// Buffer reads per second (0 = no throttle)
    pub iops_throttle: usize,
}

/// Output and logging configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Suppress error output
    pub quiet: bool,
    /// Verbosity level: 0=ERROR, 1=INFO, 2=DEBUG, 3=TRACE
    pub verbose: u8,
    /// Print summary statistics at the end, even in quiet mode
    pub print_summary: bool,
}

/// Tracing configuration for debugging
#[derive(Debug, Default)]
pub struct TracingConfig {
    /// Write logs to this file instead of stderr
    pub debug_log_file: Option<String>,
}

/// How bytes get from the source to the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyStrategy {
    /// Reader and writer tasks joined by a bounded queue of pooled buffers
    Buffered { max_buf_num: usize, buf_size: usize },
    /// A single read/write loop with one buffer, no pool and no queue
    Direct { buf_size: usize },
}

/// Buffering settings of a single transfer; built once and never mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferConfig {
    /// Maximum number of buffers in flight between the reader and the writer
    pub max_buf_num: usize,
    /// Size of each buffer (bytes)
    pub buf_size: usize,
    /// Bypass the pipeline and copy directly
    pub single_thread: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_buf_num: DEFAULT_MAX_BUF_NUM,
            buf_size: DEFAULT_BUF_SIZE,
            single_thread: false,
        }
    }
}

impl TransferConfig {
    /// Validate configuration and return errors if invalid
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buf_size == 0 {
            return Err(ConfigError::ZeroBufSize);
        }
        if !self.single_thread {
            if self.max_buf_num == 0 {
                return Err(ConfigError::ZeroBufNum);
            }
            // pool slots and queue capacity are both semaphore permits
            if self.max_buf_num > tokio::sync::Semaphore::MAX_PERMITS {
                return Err(ConfigError::TooManyBuffers(self.max_buf_num));
            }
        }
        Ok(())
    }

    pub fn strategy(&self) -> Result<CopyStrategy, ConfigError> {
        self.validate()?;
        if self.single_thread {
            Ok(CopyStrategy::Direct {
                buf_size: self.buf_size,
            })
        } else {
            Ok(CopyStrategy::Buffered {
                max_buf_num: self.max_buf_num,
                buf_size: self.buf_size,
            })
        }
    }

    /// Upper bound on memory held by buffers in flight.
    #[must_use]
    pub fn max_buffered_bytes(&self) -> u64 {
        if self.single_thread {
            self.buf_size as u64
        } else {
            self.max_buf_num as u64 * self.buf_size as u64
        }
    }
}
