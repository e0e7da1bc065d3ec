//! Common types for the ws-pipe tunnel server
//!
//! This crate holds the handshake model, the error types and the protocol
//! constants shared by the server's session and listener.

pub mod constants;
pub mod error;
pub mod protocol;

// Re-export commonly used types for convenience
pub use error::{Direction, HandshakeField, PipeError, Result};
pub use protocol::{CloseFrame, PipeInfo};
