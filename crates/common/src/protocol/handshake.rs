use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use tokio::net::lookup_host;
use tracing::debug;
use uuid::Uuid;

use crate::constants::HANDSHAKE_FIELD_COUNT;
use crate::error::{HandshakeField, PipeError, Result};

/// Destination requested by the first message of a pipe session
///
/// Wire form: `<uuid>,<host>,<port>,<keepAlive>`. Everything except the
/// resolved address is fixed at parse time; the address is looked up once
/// and cached for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeInfo {
    key: Uuid,
    host: String,
    port: u16,
    keep_alive: bool,
    resolved: Option<IpAddr>,
    text: String,
}

impl PipeInfo {
    /// Parse a handshake, validating fields in wire order
    ///
    /// # Examples
    ///
    /// ```
    /// use ws_pipe_common::PipeInfo;
    ///
    /// let info = PipeInfo::parse("11111111-1111-1111-1111-111111111111,127.0.0.1,9000,false").unwrap();
    /// assert_eq!(info.port(), 9000);
    /// assert!(PipeInfo::parse("not-a-valid-handshake").is_err());
    /// ```
    pub fn parse(input: &str) -> Result<Self> {
        let fields: Vec<&str> = input.split(',').collect();
        if fields.len() != HANDSHAKE_FIELD_COUNT {
            return Err(PipeError::handshake(
                HandshakeField::Fields,
                format!(
                    "expected {} fields, got {}",
                    HANDSHAKE_FIELD_COUNT,
                    fields.len()
                ),
            ));
        }

        let key = Uuid::parse_str(fields[0].trim())
            .map_err(|e| PipeError::handshake(HandshakeField::Key, e.to_string()))?;

        let host = fields[1];
        if host.trim().is_empty() {
            return Err(PipeError::handshake(HandshakeField::Host, "host is blank"));
        }

        let port = fields[2]
            .trim()
            .parse::<u16>()
            .map_err(|e| PipeError::handshake(HandshakeField::Port, e.to_string()))?;

        let keep_alive = parse_bool(fields[3]).ok_or_else(|| {
            PipeError::handshake(
                HandshakeField::KeepAlive,
                format!("expected true or false, got {:?}", fields[3]),
            )
        })?;

        let mut info = Self {
            key,
            host: host.to_string(),
            port,
            keep_alive,
            resolved: None,
            text: String::new(),
        };
        info.text = info.render();
        Ok(info)
    }

    pub fn key(&self) -> Uuid {
        self.key
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Address chosen by the last successful `resolve`, if any
    pub fn resolved(&self) -> Option<IpAddr> {
        self.resolved
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Resolve the host to a single address
    ///
    /// The first address returned by the resolver wins and is cached; later
    /// calls return it without another lookup.
    pub async fn resolve(&mut self) -> Result<IpAddr> {
        if let Some(addr) = self.resolved {
            return Ok(addr);
        }

        let mut addrs = lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| {
                debug!(host = %self.host, error = %e, "Host lookup failed");
                PipeError::Resolution(self.host.clone())
            })?;

        let addr = addrs
            .next()
            .map(|socket_addr| socket_addr.ip())
            .ok_or_else(|| PipeError::Resolution(self.host.clone()))?;

        self.resolved = Some(addr);
        self.text = self.render();
        Ok(addr)
    }

    fn render(&self) -> String {
        let host = match self.resolved {
            Some(addr) => format!("{}({})", self.host, addr),
            None => self.host.clone(),
        };
        format!(
            "[{:X}] {}:{}{}",
            self.key.simple(),
            host,
            self.port,
            if self.keep_alive { " (KeepAlive)" } else { "" }
        )
    }
}

impl FromStr for PipeInfo {
    type Err = PipeError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for PipeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

fn parse_bool(token: &str) -> Option<bool> {
    let token = token.trim();
    if token.eq_ignore_ascii_case("true") {
        Some(true)
    } else if token.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}
