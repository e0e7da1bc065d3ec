//! TCP listener
//!
//! Accepts connections, performs the WebSocket upgrade and runs one tunnel
//! session per upgraded socket. The listener owns each WebSocket and releases
//! it once the session is done.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use chrono::Local;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async;
use tracing::{debug, info, info_span, warn};

use crate::channel::WsChannel;
use crate::config::Config;
use crate::tunnel::{SessionSettings, TunnelSession};
use crate::upgrade::{Rewind, check_upgrade_path, plain_response, read_request_head};

/// Bind the configured address and serve until the task is dropped
pub async fn run(config: Config) -> Result<()> {
    let listener = TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("Failed to bind to address {}", config.bind))?;

    info!(
        listen_addr = %config.bind,
        keep_alive = ?config.keep_alive_interval,
        "WebSocket pipe listening"
    );

    serve(listener, config).await
}

/// Accept loop over an already bound listener
pub async fn serve(listener: TcpListener, config: Config) -> Result<()> {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "Failed to accept connection");
                continue;
            }
        };

        let settings = config.session_settings();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer, settings).await {
                debug!(peer = %peer, error = %e, "Connection dropped");
            }
        });
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    settings: SessionSettings,
) -> Result<()> {
    let (request, buffered) = read_request_head(&mut stream).await?;

    if !request.wants_websocket() {
        let response = plain_response(&request, Local::now());
        stream
            .write_all(response.as_bytes())
            .await
            .context("Failed to write response")?;
        let _ = stream.shutdown().await;
        info!("{}-{}-Http Handled", peer.ip(), request.method);
        return Ok(());
    }

    // tungstenite reads the request again from the replayed bytes
    let ws_stream = accept_hdr_async(Rewind::new(buffered, stream), check_upgrade_path)
        .await
        .context("Failed to perform WebSocket handshake")?;
    let mut channel = WsChannel::new(ws_stream);

    let span = info_span!("pipe", peer = %peer);
    let state = TunnelSession::new(peer.ip().to_string(), span)
        .with_settings(settings)
        .handle(&mut channel)
        .await;

    debug!(peer = %peer, state = ?state, "Releasing WebSocket");
    drop(channel);
    Ok(())
}
