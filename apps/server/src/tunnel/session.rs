//! Tunnel session
//!
//! One session serves one accepted WebSocket: it reads the handshake, connects
//! the destination, acknowledges with `OK` and relays bytes both ways until
//! the source closes or either side fails. The destination socket is released
//! on every exit path; the WebSocket itself stays with the caller.

use std::convert::Infallible;
use std::io;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::{Instant, Interval, interval_at};
use tracing::{Instrument, Span, debug, error, info};
use ws_pipe_common::{
    CloseFrame, Direction, HandshakeField, PipeError, PipeInfo, Result,
    constants::{ACK_MESSAGE, HANDSHAKE_MAX_BYTES, RELAY_BUFFER_SIZE},
};

use super::{DestinationConnector, destination::Destination};
use crate::channel::{ChannelReader, ChannelWriter, Inbound, SourceChannel};

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeState {
    AwaitingHandshake,
    Connecting,
    Relaying,
    Closing,
    Closed,
    Failed,
}

/// Per-session tuning supplied by the listener
#[derive(Debug, Clone, Default)]
pub struct SessionSettings {
    /// Ping the source this often while relaying; `None` disables pings
    pub keep_alive_interval: Option<Duration>,
}

pub struct TunnelSession {
    peer: String,
    span: Span,
    settings: SessionSettings,
    connector: DestinationConnector,
    info: Option<PipeInfo>,
    state: PipeState,
}

impl TunnelSession {
    /// Create a session for the WebSocket accepted from `peer`
    ///
    /// Everything the session logs is recorded inside `span`.
    pub fn new(peer: impl Into<String>, span: Span) -> Self {
        Self {
            peer: peer.into(),
            span,
            settings: SessionSettings::default(),
            connector: DestinationConnector::new(),
            info: None,
            state: PipeState::AwaitingHandshake,
        }
    }

    pub fn with_settings(mut self, settings: SessionSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Display identity used to correlate log lines
    pub fn name(&self) -> String {
        match &self.info {
            Some(info) => format!("{} {}", self.peer, info),
            None => format!("{} unknown", self.peer),
        }
    }

    /// Run the session to completion over `channel`
    ///
    /// Never fails: errors and panics are logged and end the session. The
    /// returned state is `Closed` when the source closed the session and
    /// `Failed` otherwise.
    pub async fn handle<C: SourceChannel>(mut self, channel: &mut C) -> PipeState {
        let span = self.span.clone();

        async move {
            info!(peer = %self.peer, "New WebSocket connected");

            let mut destination: Option<Destination> = None;
            let outcome = AssertUnwindSafe(self.run(channel, &mut destination))
                .catch_unwind()
                .await;

            match outcome {
                Ok(Ok(())) => self.transition(PipeState::Closed),
                Ok(Err(e)) => {
                    error!(
                        name = %self.name(),
                        phase = ?self.state,
                        error = %e,
                        "Handle failed"
                    );
                    self.transition(PipeState::Failed);
                }
                Err(_) => {
                    error!(name = %self.name(), phase = ?self.state, "Handle panicked");
                    self.transition(PipeState::Failed);
                }
            }

            if let Some(mut destination) = destination
                && destination.release()
            {
                debug!(name = %self.name(), "Destination released");
            }

            info!(name = %self.name(), state = ?self.state, "Handle finished");
            self.state
        }
        .instrument(span)
        .await
    }

    async fn run<C: SourceChannel>(
        &mut self,
        channel: &mut C,
        destination: &mut Option<Destination>,
    ) -> Result<()> {
        let (reader, writer) = channel.split();
        let mut keep_alive = self
            .settings
            .keep_alive_interval
            .map(|period| interval_at(Instant::now() + period, period));

        let mut info = with_keep_alive(writer, &mut keep_alive, receive_handshake(reader)).await??;
        self.info = Some(info.clone());
        info!(name = %self.name(), "Handle started");

        self.transition(PipeState::Connecting);
        let connector = self.connector;
        let connected =
            with_keep_alive(writer, &mut keep_alive, connector.connect(&mut info)).await?;
        // Keep the resolved address for the session name
        self.info = Some(info);
        let stream = connected?;
        let destination = destination.insert(Destination::new(stream));
        info!(name = %self.name(), "Connected");

        writer.send_text(ACK_MESSAGE).await?;

        self.transition(PipeState::Relaying);
        let close = self
            .relay(reader, writer, destination, &mut keep_alive)
            .await?;

        self.transition(PipeState::Closing);
        match &close {
            Some(frame) => info!(name = %self.name(), close = %frame, "Source closed"),
            None => info!(name = %self.name(), "Source closed without status"),
        }
        writer.send_close(close).await
    }

    /// Run both relay directions until the source sends a close frame
    ///
    /// The destination reaching EOF only ends its reads; keep-alive pings and
    /// the source direction continue until the source closes. Any error ends
    /// both.
    async fn relay<R: ChannelReader, W: ChannelWriter>(
        &self,
        reader: &mut R,
        writer: &mut W,
        destination: &mut Destination,
        keep_alive: &mut Option<Interval>,
    ) -> Result<Option<CloseFrame>> {
        let name = self.name();
        let (dest_reader, dest_writer) = destination.halves().ok_or_else(|| {
            PipeError::relay(Direction::Upstream, io::ErrorKind::NotConnected.into())
        })?;

        tokio::select! {
            result = pump_upstream(&name, reader, dest_writer) => result,
            result = pump_downstream(&name, dest_reader, writer, keep_alive) => match result {
                Ok(never) => match never {},
                Err(e) => Err(e),
            },
        }
    }

    fn transition(&mut self, next: PipeState) {
        debug!(name = %self.name(), from = ?self.state, to = ?next, "State changed");
        self.state = next;
    }
}

async fn receive_handshake<R: ChannelReader>(reader: &mut R) -> Result<PipeInfo> {
    let payload = match reader.recv().await? {
        Inbound::Data(payload) => payload,
        Inbound::Close(frame) => {
            return Err(PipeError::channel(
                io::ErrorKind::ConnectionAborted,
                format!("closed before handshake ({:?})", frame),
            ));
        }
    };

    if payload.len() > HANDSHAKE_MAX_BYTES {
        return Err(PipeError::handshake(
            HandshakeField::Length,
            format!(
                "{} bytes exceeds the {} byte limit",
                payload.len(),
                HANDSHAKE_MAX_BYTES
            ),
        ));
    }

    PipeInfo::parse(&String::from_utf8_lossy(&payload))
}

/// Source -> destination: copy payloads verbatim until a close frame
async fn pump_upstream<R: ChannelReader>(
    name: &str,
    reader: &mut R,
    destination: &mut OwnedWriteHalf,
) -> Result<Option<CloseFrame>> {
    loop {
        let inbound = reader
            .recv()
            .await
            .map_err(|e| e.in_direction(Direction::Upstream))?;

        match inbound {
            Inbound::Data(payload) => destination
                .write_all(&payload)
                .await
                .map_err(|e| PipeError::relay(Direction::Upstream, e))?,
            Inbound::Close(frame) => {
                debug!(name = %name, "Close frame received");
                return Ok(frame);
            }
        }
    }
}

/// Destination -> source: forward each read as a non-final binary fragment
///
/// Only returns on error. After the destination reaches EOF the loop keeps
/// sending keep-alive pings until the relay is dropped.
async fn pump_downstream<W: ChannelWriter>(
    name: &str,
    destination: &mut OwnedReadHalf,
    writer: &mut W,
    keep_alive: &mut Option<Interval>,
) -> Result<Infallible> {
    debug!(name = %name, "DataReceive started");
    let mut buffer = vec![0u8; RELAY_BUFFER_SIZE];
    let mut readable = true;

    loop {
        tokio::select! {
            read = destination.read(&mut buffer), if readable => {
                let n = read.map_err(|e| PipeError::relay(Direction::Downstream, e))?;
                if n == 0 {
                    debug!(name = %name, "Destination reached end of stream");
                    readable = false;
                    continue;
                }
                writer
                    .send_binary(buffer[..n].to_vec(), false)
                    .await
                    .map_err(|e| e.in_direction(Direction::Downstream))?;
            }
            _ = next_keep_alive(keep_alive) => {
                writer
                    .send_ping()
                    .await
                    .map_err(|e| e.in_direction(Direction::Downstream))?;
            }
        }
    }
}

/// Drive `work` to completion, pinging the source on every keep-alive tick
async fn with_keep_alive<W, F>(
    writer: &mut W,
    keep_alive: &mut Option<Interval>,
    work: F,
) -> Result<F::Output>
where
    W: ChannelWriter,
    F: Future,
{
    tokio::pin!(work);

    loop {
        tokio::select! {
            output = &mut work => return Ok(output),
            _ = next_keep_alive(keep_alive) => writer.send_ping().await?,
        }
    }
}

async fn next_keep_alive(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
