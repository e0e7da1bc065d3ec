/// Largest handshake payload accepted from the source channel
pub const HANDSHAKE_MAX_BYTES: usize = 1024;

/// Read buffer for the destination->source direction (8 KiB)
pub const RELAY_BUFFER_SIZE: usize = 8192;

/// Acknowledgement sent once the destination is connected
pub const ACK_MESSAGE: &str = "OK";

/// Number of comma separated handshake fields
pub const HANDSHAKE_FIELD_COUNT: usize = 4;

/// Interval between WebSocket keep-alive pings (2 minutes)
pub const DEFAULT_KEEP_ALIVE_INTERVAL_SECS: u64 = 120;

/// Largest HTTP request head read before an upgrade (8 KiB)
pub const MAX_REQUEST_HEAD_BYTES: usize = 8192;

/// Largest number of headers parsed from a request head
pub const MAX_REQUEST_HEADERS: usize = 64;

/// Product name reported by the status response
pub const PRODUCT_NAME: &str = "WSPipe";
