use bincode::{Decode, Encode};

use crate::QueryError;

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct Row {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

#[derive(Debug, Encode, Decode, PartialEq, Eq)]
pub enum Response {
    Ok,
    Pong,
    Rows {
        rows: Vec<Row>,
    },
    Err {
        code: ResponseError,
        description: String,
    },
    ConnectionClosed,
}

#[derive(Debug, Clone, Copy, Encode, Decode, PartialEq, Eq)]
pub enum ResponseError {
    /// The server is overloaded or restarting; the query may be retried.
    Unavailable,
    /// The server gave up on the query; it may be retried.
    Timeout,
    Query,
    Read,
}

impl ResponseError {
    pub fn into_query_error(self, description: String) -> QueryError {
        match self {
            ResponseError::Unavailable => QueryError::Unavailable(description),
            ResponseError::Timeout => QueryError::Timeout(description),
            ResponseError::Query | ResponseError::Read => QueryError::Server(description),
        }
    }
}
