//! Configuration options recognised by [`crate::Client`] and
//! [`crate::Consumer`].

use std::time::Duration;

/// `max_reconnect_attempts` sentinel meaning "retry forever".
pub const UNLIMITED_ATTEMPTS: i64 = -1;

/// `block_ms` sentinel meaning "block forever" on `XREADGROUP`. `0` is
/// non-blocking, not infinite, so a distinct sentinel is needed.
pub const BLOCK_FOREVER: u64 = u64::MAX;

/// Reconnection policy and transport tuning for [`crate::Client`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Connect timeout; zero means infinite.
    pub connect_timeout: Duration,
    /// `0` disables auto-reconnect; [`UNLIMITED_ATTEMPTS`] retries forever.
    pub max_reconnect_attempts: i64,
    /// Delay between reconnect attempts.
    pub retry_interval: Duration,
    /// Size hint for transport reads.
    pub read_buffer_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            connect_timeout: Duration::ZERO,
            max_reconnect_attempts: 0,
            retry_interval: Duration::from_millis(500),
            read_buffer_size: 4096,
        }
    }
}

impl ClientConfig {
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: i64) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    pub(crate) fn reconnect_allowed(&self) -> bool {
        self.max_reconnect_attempts != 0
    }

    pub(crate) fn attempt_exhausted(&self, attempts_made: i64) -> bool {
        self.max_reconnect_attempts != UNLIMITED_ATTEMPTS
            && attempts_made >= self.max_reconnect_attempts
    }
}

/// Configuration for a [`crate::Consumer`].
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub group_name: String,
    /// Random if left `None`.
    pub session_name: Option<String>,
    /// Worker pool size. Defaults to 1, a single in-order handler per
    /// stream.
    pub max_concurrency: usize,
    /// `BLOCK` argument to `XREADGROUP`. `0` is non-blocking;
    /// [`BLOCK_FOREVER`] blocks indefinitely.
    pub block_ms: u64,
    /// `COUNT` argument to `XREADGROUP`.
    pub count: usize,
    /// High-water mark for backpressure: the poll loop stops issuing reads
    /// once the pool's queue depth reaches this.
    pub high_water_mark: usize,
    /// Low-water mark: the poll loop resumes once depth drops back below
    /// this after hitting the high-water mark.
    pub low_water_mark: usize,
}

impl ConsumerConfig {
    pub fn new(group_name: impl Into<String>) -> Self {
        ConsumerConfig {
            group_name: group_name.into(),
            session_name: None,
            max_concurrency: 1,
            block_ms: 5_000,
            count: 10,
            high_water_mark: 64,
            low_water_mark: 16,
        }
    }

    pub fn with_session_name(mut self, name: impl Into<String>) -> Self {
        self.session_name = Some(name.into());
        self
    }

    pub fn with_max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n;
        self
    }

    pub fn with_block_ms(mut self, ms: u64) -> Self {
        self.block_ms = ms;
        self
    }
}
