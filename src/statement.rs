//! Statements understood by a Cryo key/value server.
//!
//! A [`Statement`] is what a consumer asks a query handle to run. Statements can be parsed
//! from the small text syntax used by the `cryopool_cli` binary:
//!
//! - `get <key>`
//! - `put <key> <value>`
//! - `delete <key>`
//! - `scan [prefix]`
//!
//! # Example
//! ```rust
//! use cryopool::Statement;
//!
//! let statement: Statement = "put user:1 alice".parse().unwrap();
//! assert_eq!(
//!     statement,
//!     Statement::Put { key: b"user:1".to_vec(), value: b"alice".to_vec() }
//! );
//! ```
use std::{fmt, str::FromStr};

use bincode::{Decode, Encode};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum Statement {
    Get { key: Vec<u8> },
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
    Scan { prefix: Vec<u8> },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StatementError {
    #[error("empty statement")]
    EmptyStatement,

    #[error("statement not supported: {0}")]
    Unsupported(String),

    #[error("invalid '{statement}' statement, {reason}")]
    InvalidArguments { statement: String, reason: String },
}

impl Statement {
    /// Whether the statement changes server state.
    pub fn is_write(&self) -> bool {
        matches!(self, Statement::Put { .. } | Statement::Delete { .. })
    }
}

impl FromStr for Statement {
    type Err = StatementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts = s.split_whitespace().collect::<Vec<&str>>();
        let Some(kind) = parts.first() else {
            return Err(StatementError::EmptyStatement);
        };

        let kind = kind.to_lowercase();
        let args = &parts[1..];
        let expect = |count: usize, usage: &str| {
            if args.len() == count {
                Ok(())
            } else {
                Err(StatementError::InvalidArguments {
                    statement: kind.clone(),
                    reason: format!("expected `{usage}`"),
                })
            }
        };

        match kind.as_str() {
            "get" => {
                expect(1, "get <key>")?;
                Ok(Statement::Get {
                    key: args[0].as_bytes().to_vec(),
                })
            }
            "put" => {
                expect(2, "put <key> <value>")?;
                Ok(Statement::Put {
                    key: args[0].as_bytes().to_vec(),
                    value: args[1].as_bytes().to_vec(),
                })
            }
            "delete" => {
                expect(1, "delete <key>")?;
                Ok(Statement::Delete {
                    key: args[0].as_bytes().to_vec(),
                })
            }
            "scan" => match args {
                [] => Ok(Statement::Scan { prefix: Vec::new() }),
                [prefix] => Ok(Statement::Scan {
                    prefix: prefix.as_bytes().to_vec(),
                }),
                _ => Err(StatementError::InvalidArguments {
                    statement: kind.clone(),
                    reason: "expected `scan [prefix]`".to_string(),
                }),
            },
            _ => Err(StatementError::Unsupported(s.trim().to_string())),
        }
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statement::Get { key } => write!(f, "get {}", String::from_utf8_lossy(key)),
            Statement::Put { key, value } => write!(
                f,
                "put {} {}",
                String::from_utf8_lossy(key),
                String::from_utf8_lossy(value)
            ),
            Statement::Delete { key } => write!(f, "delete {}", String::from_utf8_lossy(key)),
            Statement::Scan { prefix } => write!(f, "scan {}", String::from_utf8_lossy(prefix)),
        }
    }
}
