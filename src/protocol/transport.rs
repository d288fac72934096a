use std::io::{self, ErrorKind, Read, Write};

use bincode::{
    config::{BigEndian, Configuration, Fixint},
    decode_from_std_read, encode_into_std_write,
};
use thiserror::Error;

use crate::QueryError;

use super::{Request, Response};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to encode message: {0}")]
    Serialize(#[from] bincode::error::EncodeError),
    #[error("failed to decode message: {0}")]
    Deserialize(#[from] bincode::error::DecodeError),
    #[error("Transport IO Error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Whether the peer closed the stream before a full message arrived.
    pub fn is_disconnect(&self) -> bool {
        match self {
            TransportError::Io(e) => e.kind() == ErrorKind::UnexpectedEof,
            TransportError::Deserialize(bincode::error::DecodeError::UnexpectedEnd { .. }) => true,
            TransportError::Deserialize(bincode::error::DecodeError::Io { inner, .. }) => {
                inner.kind() == ErrorKind::UnexpectedEof
            }
            _ => false,
        }
    }

    fn is_timeout(&self) -> bool {
        let kind = match self {
            TransportError::Io(e) => e.kind(),
            TransportError::Deserialize(bincode::error::DecodeError::Io { inner, .. }) => {
                inner.kind()
            }
            _ => return false,
        };
        matches!(kind, ErrorKind::TimedOut | ErrorKind::WouldBlock)
    }
}

impl From<TransportError> for QueryError {
    fn from(value: TransportError) -> Self {
        if value.is_timeout() {
            QueryError::Timeout(value.to_string())
        } else {
            QueryError::Transport(value.to_string())
        }
    }
}

pub struct ProtocolTransport<T: Read + Write> {
    stream: T,
    config: Configuration<BigEndian, Fixint>,
}

impl<T: Read + Write> ProtocolTransport<T> {
    pub fn new(stream: T) -> Self {
        let config = bincode::config::standard()
            .with_big_endian()
            .with_fixed_int_encoding();
        Self { stream, config }
    }

    pub fn write_request(&mut self, req: &Request) -> Result<(), TransportError> {
        encode_into_std_write(req, &mut self.stream, self.config)?;
        self.stream.flush()?;
        Ok(())
    }

    pub fn write_response(&mut self, resp: &Response) -> Result<(), TransportError> {
        encode_into_std_write(resp, &mut self.stream, self.config)?;
        self.stream.flush()?;
        Ok(())
    }

    pub fn read_response(&mut self) -> Result<Response, TransportError> {
        let resp: Response = decode_from_std_read(&mut self.stream, self.config)?;
        Ok(resp)
    }

    pub fn read_request(&mut self) -> Result<Request, TransportError> {
        let req: Request = decode_from_std_read(&mut self.stream, self.config)?;
        Ok(req)
    }
}
