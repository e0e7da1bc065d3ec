//! End-to-end session tests
//!
//! Sessions run over the in-memory source channel against real loopback TCP
//! destinations.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::Role;
use tracing::Span;
use ws_pipe_common::{CloseFrame, Result};

use super::{PipeState, SessionSettings, TunnelSession};
use crate::channel::memory::{self, MemoryPeer, Outbound};
use crate::channel::{ChannelReader, ChannelWriter, Inbound, SourceChannel, WsChannel};

const KEY: &str = "11111111-1111-1111-1111-111111111111";
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

fn start(settings: SessionSettings) -> (JoinHandle<PipeState>, MemoryPeer) {
    let (mut channel, peer) = memory::pair();
    let handle = tokio::spawn(async move {
        TunnelSession::new("127.0.0.1:50000", Span::none())
            .with_settings(settings)
            .handle(&mut channel)
            .await
    });
    (handle, peer)
}

fn handshake(port: u16) -> Inbound {
    Inbound::Data(format!("{},127.0.0.1,{},false", KEY, port).into_bytes())
}

async fn next_outbound(peer: &mut MemoryPeer) -> Option<Outbound> {
    timeout(TEST_TIMEOUT, peer.rx.recv())
        .await
        .expect("timed out waiting for session output")
}

async fn finish(handle: JoinHandle<PipeState>) -> PipeState {
    timeout(TEST_TIMEOUT, handle)
        .await
        .expect("session did not finish")
        .expect("session task panicked")
}

async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a session, complete the handshake and return once `OK` arrived
async fn relaying_session(
    settings: SessionSettings,
) -> (JoinHandle<PipeState>, MemoryPeer, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let (handle, mut peer) = start(settings);
    peer.tx.send(handshake(port)).unwrap();

    let (destination, _) = timeout(TEST_TIMEOUT, listener.accept())
        .await
        .expect("session never connected")
        .unwrap();

    // Keep-alive may already have fired while connecting
    let mut first = next_outbound(&mut peer).await;
    while first == Some(Outbound::Ping) {
        first = next_outbound(&mut peer).await;
    }
    assert_eq!(first, Some(Outbound::Text("OK".to_string())));
    (handle, peer, destination)
}

/// Gather non-final binary fragments until `len` bytes arrived
async fn collect_binary(peer: &mut MemoryPeer, len: usize) -> Vec<u8> {
    let mut received = Vec::with_capacity(len);
    while received.len() < len {
        match next_outbound(peer).await {
            Some(Outbound::Binary { data, is_final }) => {
                assert!(!is_final, "relay chunks must not be marked final");
                assert!(!data.is_empty());
                received.extend_from_slice(&data);
            }
            other => panic!("Expected binary fragment, got {:?}", other),
        }
    }
    received
}

async fn assert_destination_closed(destination: &mut TcpStream) {
    let mut buf = [0u8; 16];
    let n = timeout(TEST_TIMEOUT, destination.read(&mut buf))
        .await
        .expect("destination was not released")
        .unwrap_or(0);
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_relays_both_directions() {
    let (handle, mut peer, mut destination) = relaying_session(SessionSettings::default()).await;

    peer.tx.send(Inbound::Data(b"hello ".to_vec())).unwrap();
    peer.tx.send(Inbound::Data(b"world".to_vec())).unwrap();

    let mut upstream = [0u8; 11];
    timeout(TEST_TIMEOUT, destination.read_exact(&mut upstream))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&upstream, b"hello world");

    destination.write_all(b"reply bytes").await.unwrap();
    assert_eq!(collect_binary(&mut peer, 11).await, b"reply bytes");

    peer.tx
        .send(Inbound::Close(Some(CloseFrame::new(1000, "bye"))))
        .unwrap();
    assert_eq!(
        next_outbound(&mut peer).await,
        Some(Outbound::Close(Some(CloseFrame::new(1000, "bye"))))
    );

    assert_eq!(finish(handle).await, PipeState::Closed);
    assert_destination_closed(&mut destination).await;
}

#[tokio::test]
async fn test_large_transfers_keep_order() {
    let (handle, mut peer, mut destination) = relaying_session(SessionSettings::default()).await;

    let pattern: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();

    for chunk in pattern.chunks(1000) {
        peer.tx.send(Inbound::Data(chunk.to_vec())).unwrap();
    }
    let mut upstream = vec![0u8; pattern.len()];
    timeout(TEST_TIMEOUT, destination.read_exact(&mut upstream))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(upstream, pattern);

    destination.write_all(&pattern).await.unwrap();
    assert_eq!(collect_binary(&mut peer, pattern.len()).await, pattern);

    peer.tx.send(Inbound::Close(None)).unwrap();
    assert_eq!(next_outbound(&mut peer).await, Some(Outbound::Close(None)));
    assert_eq!(finish(handle).await, PipeState::Closed);
}

#[tokio::test]
async fn test_connect_failure_sends_nothing() {
    let port = closed_port().await;
    let (handle, mut peer) = start(SessionSettings::default());

    peer.tx.send(handshake(port)).unwrap();

    assert_eq!(finish(handle).await, PipeState::Failed);
    // No acknowledgement and no close frame, only a dropped channel
    assert_eq!(next_outbound(&mut peer).await, None);
}

#[tokio::test]
async fn test_invalid_handshake_fails_before_connecting() {
    let (handle, mut peer) = start(SessionSettings::default());

    peer.tx
        .send(Inbound::Data(b"not-a-valid-handshake".to_vec()))
        .unwrap();

    assert_eq!(finish(handle).await, PipeState::Failed);
    assert_eq!(next_outbound(&mut peer).await, None);
}

#[tokio::test]
async fn test_oversized_handshake_is_rejected() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (handle, mut peer) = start(SessionSettings::default());

    // Valid fields, padded past the size limit
    let mut payload = format!("{},127.0.0.1,{},false", KEY, port).into_bytes();
    payload.resize(2048, b' ');
    peer.tx.send(Inbound::Data(payload)).unwrap();

    assert_eq!(finish(handle).await, PipeState::Failed);
    assert_eq!(next_outbound(&mut peer).await, None);
}

#[tokio::test]
async fn test_close_before_handshake_fails() {
    let (handle, mut peer) = start(SessionSettings::default());

    peer.tx
        .send(Inbound::Close(Some(CloseFrame::new(1001, "going away"))))
        .unwrap();

    assert_eq!(finish(handle).await, PipeState::Failed);
    assert_eq!(next_outbound(&mut peer).await, None);
}

#[tokio::test]
async fn test_close_is_echoed_then_destination_released() {
    let (handle, mut peer, mut destination) = relaying_session(SessionSettings::default()).await;

    peer.tx
        .send(Inbound::Close(Some(CloseFrame::new(1000, "bye"))))
        .unwrap();

    assert_eq!(
        next_outbound(&mut peer).await,
        Some(Outbound::Close(Some(CloseFrame::new(1000, "bye"))))
    );
    assert_eq!(finish(handle).await, PipeState::Closed);
    assert_destination_closed(&mut destination).await;
}

#[tokio::test]
async fn test_destination_eof_keeps_source_direction_open() {
    let (handle, mut peer, destination) = relaying_session(SessionSettings::default()).await;

    drop(destination);
    sleep(Duration::from_millis(100)).await;
    assert!(!handle.is_finished());

    peer.tx
        .send(Inbound::Close(Some(CloseFrame::new(1000, "done"))))
        .unwrap();
    assert_eq!(
        next_outbound(&mut peer).await,
        Some(Outbound::Close(Some(CloseFrame::new(1000, "done"))))
    );
    assert_eq!(finish(handle).await, PipeState::Closed);
}

#[tokio::test]
async fn test_source_loss_fails_and_releases_destination() {
    let (handle, peer, mut destination) = relaying_session(SessionSettings::default()).await;

    let MemoryPeer { tx, mut rx } = peer;
    drop(tx);

    assert_eq!(finish(handle).await, PipeState::Failed);
    assert_destination_closed(&mut destination).await;
    assert_eq!(rx.recv().await, None);
}

#[tokio::test]
async fn test_keep_alive_pings_while_relaying() {
    let settings = SessionSettings {
        keep_alive_interval: Some(Duration::from_millis(50)),
    };
    let (handle, mut peer, _destination) = relaying_session(settings).await;

    assert_eq!(next_outbound(&mut peer).await, Some(Outbound::Ping));
    assert_eq!(next_outbound(&mut peer).await, Some(Outbound::Ping));

    peer.tx.send(Inbound::Close(None)).unwrap();
    assert_eq!(finish(handle).await, PipeState::Closed);
}

#[tokio::test]
async fn test_keep_alive_pings_before_handshake() {
    let settings = SessionSettings {
        keep_alive_interval: Some(Duration::from_millis(50)),
    };
    let (handle, mut peer) = start(settings);

    assert_eq!(next_outbound(&mut peer).await, Some(Outbound::Ping));
    assert_eq!(next_outbound(&mut peer).await, Some(Outbound::Ping));

    peer.tx.send(Inbound::Close(None)).unwrap();
    assert_eq!(finish(handle).await, PipeState::Failed);
}

#[tokio::test]
async fn test_keep_alive_continues_after_destination_eof() {
    let settings = SessionSettings {
        keep_alive_interval: Some(Duration::from_millis(50)),
    };
    let (handle, mut peer, destination) = relaying_session(settings).await;

    drop(destination);
    sleep(Duration::from_millis(200)).await;
    while peer.rx.try_recv().is_ok() {}

    assert_eq!(next_outbound(&mut peer).await, Some(Outbound::Ping));
    assert!(!handle.is_finished());

    peer.tx.send(Inbound::Close(None)).unwrap();
    assert_eq!(finish(handle).await, PipeState::Closed);
}

#[tokio::test]
#[allow(deprecated)]
async fn test_destination_reset_fails_session() {
    let (handle, mut peer, destination) = relaying_session(SessionSettings::default()).await;

    // Zero linger turns the close into a RST
    destination.set_linger(Some(Duration::ZERO)).unwrap();
    drop(destination);

    assert_eq!(finish(handle).await, PipeState::Failed);
    // No close frame on a relay failure, the channel is just dropped
    assert_eq!(next_outbound(&mut peer).await, None);
}

/// Session input and output as raw WebSocket frames
struct FrameClient {
    io: DuplexStream,
}

impl FrameClient {
    /// Send a masked client frame; a zero mask leaves the payload as is
    async fn send(&mut self, opcode: u8, payload: &[u8]) {
        assert!(payload.len() < 126);
        let mut frame = vec![0x80 | opcode, 0x80 | payload.len() as u8, 0, 0, 0, 0];
        frame.extend_from_slice(payload);
        self.io.write_all(&frame).await.unwrap();
    }

    /// Read one server frame as (first header byte, payload)
    async fn recv(&mut self) -> (u8, Vec<u8>) {
        let mut header = [0u8; 2];
        timeout(TEST_TIMEOUT, self.io.read_exact(&mut header))
            .await
            .expect("timed out waiting for a frame")
            .unwrap();
        assert_eq!(header[1] & 0x80, 0, "server frames are not masked");

        let len = (header[1] & 0x7f) as usize;
        assert!(len < 126);
        let mut payload = vec![0u8; len];
        self.io.read_exact(&mut payload).await.unwrap();
        (header[0], payload)
    }
}

#[tokio::test]
async fn test_session_over_websocket_frames() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let (server_io, client_io) = tokio::io::duplex(64 * 1024);
    let handle = tokio::spawn(async move {
        let ws_stream = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let mut channel = WsChannel::new(ws_stream);
        TunnelSession::new("127.0.0.1:50001", Span::none())
            .handle(&mut channel)
            .await
    });
    let mut client = FrameClient { io: client_io };

    client
        .send(0x1, format!("{},127.0.0.1,{},false", KEY, port).as_bytes())
        .await;
    let (mut destination, _) = timeout(TEST_TIMEOUT, listener.accept())
        .await
        .unwrap()
        .unwrap();

    // FIN text "OK"
    assert_eq!(client.recv().await, (0x81, b"OK".to_vec()));

    // First fragment opens a binary message, later ones continue it, none final
    destination.write_all(b"abc").await.unwrap();
    assert_eq!(client.recv().await, (0x02, b"abc".to_vec()));
    destination.write_all(b"def").await.unwrap();
    assert_eq!(client.recv().await, (0x00, b"def".to_vec()));

    client.send(0x2, b"up").await;
    let mut upstream = [0u8; 2];
    timeout(TEST_TIMEOUT, destination.read_exact(&mut upstream))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&upstream, b"up");

    // 1000 "bye" comes back unchanged
    let mut close = 1000u16.to_be_bytes().to_vec();
    close.extend_from_slice(b"bye");
    client.send(0x8, &close).await;
    assert_eq!(client.recv().await, (0x88, close));

    assert_eq!(finish(handle).await, PipeState::Closed);
    assert_destination_closed(&mut destination).await;
}

struct PanickingChannel {
    reader: PanickingReader,
    writer: NullWriter,
}

struct PanickingReader;

struct NullWriter;

#[async_trait]
impl ChannelReader for PanickingReader {
    async fn recv(&mut self) -> Result<Inbound> {
        panic!("reader blew up")
    }
}

#[async_trait]
impl ChannelWriter for NullWriter {
    async fn send_text(&mut self, _text: &str) -> Result<()> {
        Ok(())
    }

    async fn send_binary(&mut self, _data: Vec<u8>, _is_final: bool) -> Result<()> {
        Ok(())
    }

    async fn send_ping(&mut self) -> Result<()> {
        Ok(())
    }

    async fn send_close(&mut self, _frame: Option<CloseFrame>) -> Result<()> {
        Ok(())
    }
}

impl SourceChannel for PanickingChannel {
    type Reader = PanickingReader;
    type Writer = NullWriter;

    fn split(&mut self) -> (&mut Self::Reader, &mut Self::Writer) {
        (&mut self.reader, &mut self.writer)
    }
}

#[tokio::test]
async fn test_panic_inside_session_ends_as_failed() {
    let mut channel = PanickingChannel {
        reader: PanickingReader,
        writer: NullWriter,
    };

    let state = TunnelSession::new("127.0.0.1:50002", Span::none())
        .handle(&mut channel)
        .await;
    assert_eq!(state, PipeState::Failed);
}
