//! Prompt utilities for the `cryopool_cli` binary.
//!
//! Lines starting with `.` are meta commands; everything else is parsed as a [`Statement`].
use std::io::{self, BufRead, Write};

use thiserror::Error;

use crate::{Statement, StatementError};

/// Possible commands from a user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// `.exit`, or end of input. Drains outstanding queries first.
    Exit,
    /// `.flush`: wait for every submitted query to complete.
    Flush,
    /// `.status`: print the slot table.
    Status,
    Statement(Statement),
    /// Blank line.
    Empty,
}

#[derive(Error, Debug)]
pub enum PromptError {
    #[error("prompt IO error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Statement(#[from] StatementError),

    #[error("unrecognized command '{0}'")]
    Unrecognized(String),
}

/// Prompts for and reads the next command.
pub fn prompt<R, W>(mut reader: R, mut writer: W) -> Result<Command, PromptError>
where
    R: BufRead,
    W: Write,
{
    let mut s = String::default();
    write!(&mut writer, "> ")?;
    writer.flush()?;

    if reader.read_line(&mut s)? == 0 {
        return Ok(Command::Exit);
    }

    match s.trim() {
        "" => Ok(Command::Empty),
        ".exit" => Ok(Command::Exit),
        ".flush" => Ok(Command::Flush),
        ".status" => Ok(Command::Status),
        s if !s.starts_with('.') => Ok(Command::Statement(s.parse()?)),
        s => Err(PromptError::Unrecognized(s.to_string())),
    }
}
