//! Engine configuration.
//!
//! [`EngineConfig`] groups the knobs of a [`QueryEngine`](crate::QueryEngine). Every field has
//! a default suited to a local Cryo server; binaries override them from their command line.
//!
//! # Example
//! ```rust
//! use std::time::Duration;
//! use cryopool::EngineConfig;
//!
//! let config = EngineConfig::default()
//!     .with_max_queries(32)
//!     .with_keyspace("users")
//!     .with_retry_delay(Duration::from_millis(50));
//!
//! assert_eq!(config.max_queries, 32);
//! assert_eq!(config.keyspace.as_deref(), Some("users"));
//! ```
use std::time::Duration;

pub const DEFAULT_MAX_QUERIES: usize = 16;
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(10);
pub const DEFAULT_PUSH_TIMEOUT: Duration = Duration::from_millis(10);
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Upper bound on concurrently attached queries; also the ready queue capacity.
    pub max_queries: usize,
    /// Keyspace handed to the connection whenever a slot opens a query.
    pub keyspace: Option<String>,
    /// How long a waiting scheduler pass blocks on the ready queue.
    pub poll_timeout: Duration,
    /// Per-attempt timeout for a completion bridge pushing onto the ready queue.
    pub push_timeout: Duration,
    /// Relaxation delay between a transient failure and the restart.
    pub retry_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_queries: DEFAULT_MAX_QUERIES,
            keyspace: None,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            push_timeout: DEFAULT_PUSH_TIMEOUT,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl EngineConfig {
    pub fn with_max_queries(mut self, max_queries: usize) -> Self {
        self.max_queries = max_queries;
        self
    }

    pub fn with_keyspace(mut self, keyspace: impl Into<String>) -> Self {
        self.keyspace = Some(keyspace.into());
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_push_timeout(mut self, timeout: Duration) -> Self {
        self.push_timeout = timeout;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }
}
