use std::thread::ThreadId;

use thiserror::Error;

/// Failure reported by a query handle or its connection.
///
/// Only [`QueryError::Timeout`] and [`QueryError::Unavailable`] are retried by the
/// engine; every other variant is fatal for the unit of work that hit it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("query timed out: {0}")]
    Timeout(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("server rejected query: {0}")]
    Server(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl QueryError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, QueryError::Timeout(_) | QueryError::Unavailable(_))
    }
}

/// Errors surfaced by [`QueryEngine`](crate::QueryEngine) calls.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine is owned by thread {owner:?} but was called from {caller:?}")]
    WrongThread { owner: ThreadId, caller: ThreadId },

    #[error("re-entrant row processing on slot {0}")]
    ReentrantRead(usize),

    #[error("slot {0} is in use by a running callback")]
    SlotBusy(usize),

    #[error("{0} cannot be called from inside a consumer callback")]
    NestedCall(&'static str),

    #[error("slot {0} has no attached query")]
    InvalidSlot(usize),

    #[error("retry budget must be positive")]
    InvalidRetryBudget,

    #[error("[configuration] {0}")]
    Configuration(String),

    #[error("drain interrupted with {active} active and {pending} pending queries")]
    Interrupted { active: usize, pending: usize },

    #[error(transparent)]
    Query(#[from] QueryError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_errors_retry() {
        assert!(QueryError::Timeout("read".into()).is_retryable());
        assert!(QueryError::Unavailable("overloaded".into()).is_retryable());
        assert!(!QueryError::Server("syntax".into()).is_retryable());
        assert!(!QueryError::Transport("reset".into()).is_retryable());
        assert!(!QueryError::Cancelled("shutdown".into()).is_retryable());
    }

    #[test]
    fn query_error_converts_into_engine_error() {
        let err: EngineError = QueryError::Server("boom".into()).into();
        assert_eq!(err.to_string(), "server rejected query: boom");
    }
}
