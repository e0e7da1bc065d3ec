//! HTTP request head handling for the listener
//!
//! Every connection starts as HTTP/1.1. The head is read and parsed with
//! `httparse` to choose between the plaintext status reply and a WebSocket
//! upgrade. Upgrades replay the buffered bytes into tungstenite, which
//! validates the handshake itself.

use std::io;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Local};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use ws_pipe_common::constants::{MAX_REQUEST_HEADERS, MAX_REQUEST_HEAD_BYTES, PRODUCT_NAME};

/// Request line and headers of an incoming connection
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Parse a complete head from the start of `buf`
    ///
    /// Returns `None` while more bytes are needed, otherwise the head and
    /// its length in bytes.
    pub fn try_parse(buf: &[u8]) -> Result<Option<(usize, Self)>> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_REQUEST_HEADERS];
        let mut request = httparse::Request::new(&mut headers);

        let len = match request.parse(buf).context("Malformed request head")? {
            httparse::Status::Complete(len) => len,
            httparse::Status::Partial => return Ok(None),
        };

        let (Some(method), Some(path)) = (request.method, request.path) else {
            bail!("Request line is incomplete");
        };
        let headers = request
            .headers
            .iter()
            .map(|header| {
                (
                    header.name.to_ascii_lowercase(),
                    String::from_utf8_lossy(header.value).trim().to_string(),
                )
            })
            .collect();

        Ok(Some((
            len,
            Self {
                method: method.to_string(),
                path: path.to_string(),
                headers,
            },
        )))
    }

    /// First value of a header, matched case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(header, _)| *header == name)
            .map(|(_, value)| value.as_str())
    }

    /// The client asked for a WebSocket
    ///
    /// Only the intent is checked here; method, version, key and protocol
    /// version are validated by tungstenite during the upgrade.
    pub fn wants_websocket(&self) -> bool {
        self.header("upgrade")
            .is_some_and(|value| value.eq_ignore_ascii_case("websocket"))
    }
}

/// Read until a full request head has arrived
///
/// Returns the parsed head together with every byte read so far, including
/// any that followed the head.
pub async fn read_request_head<S>(stream: &mut S) -> Result<(RequestHead, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    let mut buffer = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        let n = stream
            .read(&mut chunk)
            .await
            .context("Failed to read request")?;
        if n == 0 {
            bail!("Connection closed before request head was complete");
        }
        buffer.extend_from_slice(&chunk[..n]);

        if let Some((_, head)) = RequestHead::try_parse(&buffer)? {
            return Ok((head, buffer));
        }

        if buffer.len() > MAX_REQUEST_HEAD_BYTES {
            bail!("Request head exceeds {} bytes", MAX_REQUEST_HEAD_BYTES);
        }
    }
}

/// Handshake callback: WebSockets are only served on `/`
pub fn check_upgrade_path(request: &Request, response: Response) -> Result<Response, ErrorResponse> {
    if request.uri().path() == "/" {
        Ok(response)
    } else {
        let mut not_found = ErrorResponse::new(Some("Not Found".to_string()));
        *not_found.status_mut() = StatusCode::NOT_FOUND;
        Err(not_found)
    }
}

/// Status line served to plain HTTP requests
pub fn status_text(now: DateTime<Local>) -> String {
    format!(
        "{} v{} {}",
        PRODUCT_NAME,
        env!("CARGO_PKG_VERSION"),
        now.format("%Y-%m-%d %H:%M:%S%.3f")
    )
}

/// Plain HTTP response for a non-upgrade request
///
/// `GET /` and `HEAD /` report the status line, every other request is
/// answered with 404.
pub fn plain_response(request: &RequestHead, now: DateTime<Local>) -> String {
    let (status, body) = match (request.method.as_str(), request.path.as_str()) {
        ("GET" | "HEAD", "/") => ("200 OK", status_text(now)),
        _ => ("404 Not Found", "Not Found".to_string()),
    };

    let mut response = format!(
        "HTTP/1.1 {}\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n",
        status,
        body.len()
    );
    if request.method != "HEAD" {
        response.push_str(&body);
    }
    response
}

/// A stream that yields already consumed bytes before reading on
pub struct Rewind<S> {
    prefix: Vec<u8>,
    pos: usize,
    inner: S,
}

impl<S> Rewind<S> {
    pub fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            pos: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.pos < this.prefix.len() {
            let remaining = &this.prefix[this.pos..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            this.pos += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
