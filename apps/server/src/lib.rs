//! WebSocket to TCP tunnel server
//!
//! Each accepted WebSocket sends one handshake text message naming a TCP
//! destination. Once connected the server replies `OK` and relays raw bytes in
//! both directions until the client closes the WebSocket.

pub mod channel;
pub mod config;
pub mod server;
pub mod tunnel;
pub mod upgrade;

pub use channel::{ChannelReader, ChannelWriter, Inbound, SourceChannel, WsChannel};
pub use config::{Args, Config};
pub use tunnel::{Destination, DestinationConnector, PipeState, SessionSettings, TunnelSession};
