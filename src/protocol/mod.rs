//! Client-server communication protocol.
//!
//! This module defines how the engine's query handles talk to a Cryo key/value server: the
//! message types, their binary encoding, a small threaded server and the
//! [`Connection`](crate::Connection) implementation the engine drives.
//!
//! # Key Components
//!
//! - [`Request`] / [`Response`]: messages exchanged over a connection.
//! - [`ProtocolTransport`]: encodes and decodes messages over any `Read + Write` stream.
//! - [`KeyspaceServer`]: in-memory server answering queries per keyspace.
//! - [`RemoteConnection`]: opens [`RemoteQuery`] handles against a server.
//! - [`Collector`]: consumer running a single [`Statement`](crate::Statement).
//!
//! # Binary Format
//!
//! Messages are serialized with `bincode` using big-endian, fixed-width integers. Each
//! message is written whole and flushed; there is no extra framing since every message is
//! self-delimiting.
//!
//! A client sends one [`Request::Query`] per connection, reads the response, then sends
//! [`Request::CloseConnection`] and waits for [`Response::ConnectionClosed`].
//!
//! # Errors
//!
//! Server-side failures come back as [`Response::Err`] carrying a [`ResponseError`] code.
//! `Unavailable` and `Timeout` map to retryable [`QueryError`](crate::QueryError)s, the rest
//! are fatal.
pub mod client;
mod request;
mod response;
mod server;
mod thread;
mod transport;

use thread::ThreadPool;

pub use client::{Collector, QueryOutcome, RemoteConnection, RemoteQuery};
pub use request::Request;
pub use response::{Response, ResponseError, Row};
pub use server::KeyspaceServer;
pub use transport::{ProtocolTransport, TransportError};
