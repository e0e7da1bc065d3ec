use std::fmt;
use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Handshake field that failed validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeField {
    Length,
    Fields,
    Key,
    Host,
    Port,
    KeepAlive,
}

impl fmt::Display for HandshakeField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Length => "length",
            Self::Fields => "fields",
            Self::Key => "key",
            Self::Host => "host",
            Self::Port => "port",
            Self::KeepAlive => "keep_alive",
        };
        f.write_str(name)
    }
}

/// Relay direction, used to tag mid-session I/O failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Source channel to destination socket
    Upstream,
    /// Destination socket to source channel
    Downstream,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upstream => f.write_str("source->destination"),
            Self::Downstream => f.write_str("destination->source"),
        }
    }
}

/// Error types for a pipe session
#[derive(Error, Debug)]
pub enum PipeError {
    #[error("Invalid handshake ({field}): {reason}")]
    HandshakeFormat {
        field: HandshakeField,
        reason: String,
    },

    #[error("Cannot resolve {0}")]
    Resolution(String),

    #[error("Connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Relay I/O error ({direction}): {source}")]
    RelayIo {
        direction: Direction,
        #[source]
        source: io::Error,
    },

    #[error("Source channel error: {0}")]
    Channel(#[source] io::Error),
}

impl PipeError {
    pub fn handshake(field: HandshakeField, reason: impl Into<String>) -> Self {
        Self::HandshakeFormat {
            field,
            reason: reason.into(),
        }
    }

    pub fn connect(addr: SocketAddr, source: io::Error) -> Self {
        Self::Connect {
            addr: addr.to_string(),
            source,
        }
    }

    pub fn relay(direction: Direction, source: io::Error) -> Self {
        Self::RelayIo { direction, source }
    }

    pub fn channel(kind: io::ErrorKind, message: impl Into<String>) -> Self {
        Self::Channel(io::Error::new(kind, message.into()))
    }

    /// Tag a source channel failure with the relay direction it broke
    ///
    /// Other errors are returned unchanged.
    pub fn in_direction(self, direction: Direction) -> Self {
        match self {
            Self::Channel(source) => Self::RelayIo { direction, source },
            other => other,
        }
    }
}

/// Type alias for Results using PipeError
pub type Result<T> = std::result::Result<T, PipeError>;
