use bincode::{Decode, Encode};

use crate::Statement;

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub enum Request {
    Query {
        keyspace: String,
        statement: Statement,
    },
    Ping,
    CloseConnection,
}

impl Request {
    pub fn query(keyspace: impl Into<String>, statement: Statement) -> Self {
        Request::Query {
            keyspace: keyspace.into(),
            statement,
        }
    }
}
