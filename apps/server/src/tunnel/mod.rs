//! Per-connection tunnel: destination connector and session lifecycle

mod connector;
mod destination;
mod session;

#[cfg(test)]
mod tests;

pub use connector::DestinationConnector;
pub use destination::Destination;
pub use session::{PipeState, SessionSettings, TunnelSession};
