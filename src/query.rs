//! Query handle contract consumed by the engine.
//!
//! The engine never speaks a wire protocol itself. It opens handles through a [`Connection`]
//! and drives them through [`QueryHandle`]; [`protocol::client`](crate::protocol::client)
//! provides the implementation used against a Cryo server.
//!
//! # Readiness
//!
//! A handle performs its I/O wherever it likes (typically on a driver thread). Whenever a row
//! becomes available or the query completes, it must call
//! [`CompletionBridge::notify`] on the bridge it was last given. The engine then calls
//! [`QueryHandle::next_row`] from its owning thread to find out what happened.
use std::time::Duration;

use crate::{CompletionBridge, QueryError};

/// Outcome of polling a handle for its next row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowStatus {
    /// The query completed and every row has been handed out.
    Done,
    /// Nothing new yet; a completion notification will follow.
    Wait,
    /// A row is available for the consumer to read.
    DataReady,
}

pub trait QueryHandle: Send {
    /// Registers the bridge to notify on readiness, replacing any previous one.
    fn set_completion_callback(&mut self, bridge: CompletionBridge);

    /// Whether the query is still executing on the backend.
    fn is_active(&self) -> bool;

    fn next_row(&mut self) -> Result<RowStatus, QueryError>;

    /// Blocks the calling thread for up to `timeout` waiting for the query to make progress.
    fn wait(&mut self, timeout: Duration) -> Result<RowStatus, QueryError>;

    /// Re-issues the last statement, discarding any buffered results.
    fn restart(&mut self) -> Result<(), QueryError>;

    /// Stops observing the query. Results arriving afterwards are discarded.
    fn close(&mut self);

    /// Short human readable description used by diagnostics.
    fn describe(&self) -> String;
}

/// Source of query handles.
pub trait Connection: Send {
    type Query: QueryHandle;

    fn new_query(&mut self, keyspace: Option<&str>) -> Result<Self::Query, QueryError>;
}
