//! Source channel abstraction
//!
//! A tunnel session only needs a handful of operations from the WebSocket it
//! serves: receive one message, send text, send binary with an explicit final
//! flag, send pings and echo a close frame. `SourceChannel` captures that
//! surface so the session can run over tungstenite in production and over an
//! in-memory channel in tests.

use async_trait::async_trait;
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{
    Error as WsError, Message as WsMessage,
    error::ProtocolError,
    protocol::CloseFrame as WsCloseFrame,
    protocol::frame::Frame,
    protocol::frame::coding::{CloseCode, Data as OpData, OpCode},
};
use std::io;

use ws_pipe_common::{CloseFrame, PipeError, Result};

/// A message received from the source channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Payload of a text or binary message; the message type is not kept
    Data(Vec<u8>),
    /// Close frame, with its status and reason when the peer sent one
    Close(Option<CloseFrame>),
}

/// Receiving half of a source channel
#[async_trait]
pub trait ChannelReader: Send {
    /// Receive the next data or close message, skipping control frames
    async fn recv(&mut self) -> Result<Inbound>;
}

/// Sending half of a source channel
#[async_trait]
pub trait ChannelWriter: Send {
    /// Send a complete text message
    async fn send_text(&mut self, text: &str) -> Result<()>;

    /// Send binary data; `is_final == false` leaves the message open so the
    /// next binary send continues it
    async fn send_binary(&mut self, data: Vec<u8>, is_final: bool) -> Result<()>;

    async fn send_ping(&mut self) -> Result<()>;

    /// Send a close frame, completing the closing handshake when the peer
    /// started it
    async fn send_close(&mut self, frame: Option<CloseFrame>) -> Result<()>;
}

/// A full-duplex message channel whose halves can be borrowed independently
pub trait SourceChannel: Send {
    type Reader: ChannelReader;
    type Writer: ChannelWriter;

    fn split(&mut self) -> (&mut Self::Reader, &mut Self::Writer);
}

/// `SourceChannel` over an upgraded tungstenite WebSocket
pub struct WsChannel<S> {
    reader: WsReader<S>,
    writer: WsWriter<S>,
}

pub struct WsReader<S> {
    stream: SplitStream<WebSocketStream<S>>,
}

pub struct WsWriter<S> {
    sink: SplitSink<WebSocketStream<S>, WsMessage>,
    // A non-final binary frame has been sent and the message is still open
    fragmenting: bool,
}

impl<S> WsChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(ws_stream: WebSocketStream<S>) -> Self {
        let (sink, stream) = ws_stream.split();
        Self {
            reader: WsReader { stream },
            writer: WsWriter {
                sink,
                fragmenting: false,
            },
        }
    }
}

impl<S> SourceChannel for WsChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    type Reader = WsReader<S>;
    type Writer = WsWriter<S>;

    fn split(&mut self) -> (&mut Self::Reader, &mut Self::Writer) {
        (&mut self.reader, &mut self.writer)
    }
}

#[async_trait]
impl<S> ChannelReader for WsReader<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn recv(&mut self) -> Result<Inbound> {
        while let Some(message) = self.stream.next().await {
            match message {
                Ok(WsMessage::Text(text)) => {
                    return Ok(Inbound::Data(text.as_str().as_bytes().to_vec()));
                }
                Ok(WsMessage::Binary(data)) => return Ok(Inbound::Data(data.to_vec())),
                Ok(WsMessage::Close(frame)) => {
                    return Ok(Inbound::Close(frame.map(|f| CloseFrame {
                        code: u16::from(f.code),
                        reason: f.reason.as_str().to_string(),
                    })));
                }
                // Pings are answered by tungstenite itself
                Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) | Ok(WsMessage::Frame(_)) => {}
                Err(e) => return Err(channel_error(e)),
            }
        }

        Err(PipeError::channel(
            io::ErrorKind::UnexpectedEof,
            "stream ended without a close frame",
        ))
    }
}

impl<S> WsWriter<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send_message(&mut self, message: WsMessage) -> Result<()> {
        self.sink
            .send(message)
            .await
            .map_err(channel_error)
    }
}

#[async_trait]
impl<S> ChannelWriter for WsWriter<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send_text(&mut self, text: &str) -> Result<()> {
        if self.fragmenting {
            return Err(PipeError::channel(
                io::ErrorKind::InvalidInput,
                "cannot send text inside an open binary message",
            ));
        }
        self.send_message(WsMessage::Text(text.to_string().into()))
            .await
    }

    async fn send_binary(&mut self, data: Vec<u8>, is_final: bool) -> Result<()> {
        let opcode = if self.fragmenting {
            OpData::Continue
        } else {
            OpData::Binary
        };
        let frame = Frame::message(data, OpCode::Data(opcode), is_final);

        self.send_message(WsMessage::Frame(frame)).await?;
        self.fragmenting = !is_final;
        Ok(())
    }

    async fn send_ping(&mut self) -> Result<()> {
        self.send_message(WsMessage::Ping(Default::default())).await
    }

    async fn send_close(&mut self, frame: Option<CloseFrame>) -> Result<()> {
        let frame = frame.map(|f| WsCloseFrame {
            code: CloseCode::from(f.code),
            reason: f.reason.into(),
        });

        // After the peer's close tungstenite has already queued the echo of
        // that frame and refuses a second one; flushing writes the queued reply
        let sent = match self.sink.send(WsMessage::Close(frame)).await {
            Err(WsError::Protocol(ProtocolError::SendAfterClosing)) => self.sink.flush().await,
            other => other,
        };

        match sent {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(channel_error(e)),
        }
    }
}

fn channel_error(e: WsError) -> PipeError {
    match e {
        WsError::Io(e) => PipeError::Channel(e),
        other => PipeError::Channel(io::Error::other(other)),
    }
}
