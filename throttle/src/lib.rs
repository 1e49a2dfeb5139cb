//! Token-bucket throttling for the copy pipeline
//!
//! The reader side of a transfer takes one token before every buffer it fills, so
//! limiting tokens limits the number of read operations per second. With a fixed buffer
//! size this also caps throughput at roughly `ops_per_sec × buf_size`.
//!
//! # Usage
//!
//! ```rust,no_run
//! use throttle::Throttle;
//!
//! # async fn example() {
//! // 200 buffer reads per second
//! let throttle = std::sync::Arc::new(Throttle::per_second(200).unwrap());
//!
//! // replenishment runs next to the reader for the lifetime of the transfer
//! let replenish = {
//!     let throttle = throttle.clone();
//!     tokio::spawn(async move { throttle.run_replenish().await })
//! };
//!
//! // take a token before each read
//! throttle.get_token().await;
//! // read into a buffer here
//! # replenish.abort();
//! # }
//! ```
//!
//! # Replenishment Strategy
//!
//! Tokens are added by a background loop that tops the bucket up every interval. Rates
//! divisible by 10 are spread over 100ms intervals to smooth out bursts; anything else
//! is replenished once per second. The bucket never holds more than one interval's
//! worth of tokens, so an idle reader cannot build up a burst.
//!
//! Each [`Throttle`] belongs to one transfer. [`Throttle::close`] releases any waiter.

mod semaphore;

/// Number of tokens added per replenish interval and the interval length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub tokens_per_interval: usize,
    pub interval: std::time::Duration,
}

impl Schedule {
    /// Returns `None` when `ops_per_sec` is 0, meaning "no throttle".
    #[must_use]
    pub fn per_second(ops_per_sec: usize) -> Option<Self> {
        if ops_per_sec == 0 {
            return None;
        }
        if ops_per_sec % 10 == 0 {
            Some(Self {
                tokens_per_interval: ops_per_sec / 10,
                interval: std::time::Duration::from_millis(100),
            })
        } else {
            Some(Self {
                tokens_per_interval: ops_per_sec,
                interval: std::time::Duration::from_secs(1),
            })
        }
    }
}

pub struct Throttle {
    tokens: semaphore::Semaphore,
    schedule: Schedule,
}

impl Throttle {
    #[must_use]
    pub fn new(schedule: Schedule) -> Self {
        Self {
            tokens: semaphore::Semaphore::new(schedule.tokens_per_interval),
            schedule,
        }
    }

    /// Builds a throttle allowing `ops_per_sec` operations per second, `None` for 0.
    #[must_use]
    pub fn per_second(ops_per_sec: usize) -> Option<Self> {
        Schedule::per_second(ops_per_sec).map(Self::new)
    }

    #[must_use]
    pub fn schedule(&self) -> Schedule {
        self.schedule
    }

    /// Waits for a token. Returns immediately once the throttle is closed.
    pub async fn get_token(&self) {
        if !self.tokens.consume().await {
            tracing::trace!("throttle closed, token not required");
        }
    }

    /// Refills the bucket forever; callers run it in a task tied to the transfer.
    pub async fn run_replenish(&self) {
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.schedule.interval,
            self.schedule.interval,
        );
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.tokens.replenish(self.schedule.tokens_per_interval);
        }
    }

    /// Stops throttling: pending and future `get_token` calls return right away.
    pub fn close(&self) {
        self.tokens.close();
    }

    #[must_use]
    pub fn available_tokens(&self) -> usize {
        self.tokens.available()
    }
}
