use std::net::Shutdown;

use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

/// The session's connected destination socket
///
/// Split into halves so each relay direction can own its side. `release`
/// shuts the socket down and closes it; only the first call does anything,
/// later calls (and the drop) are no-ops.
#[derive(Debug)]
pub struct Destination {
    halves: Option<(OwnedReadHalf, OwnedWriteHalf)>,
}

impl Destination {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            halves: Some(stream.into_split()),
        }
    }

    /// Read and write halves, or `None` once released
    pub fn halves(&mut self) -> Option<(&mut OwnedReadHalf, &mut OwnedWriteHalf)> {
        self.halves.as_mut().map(|(reader, writer)| (reader, writer))
    }

    pub fn is_released(&self) -> bool {
        self.halves.is_none()
    }

    /// Shut down and close the socket, swallowing every error
    ///
    /// Returns `true` only for the call that actually released it.
    pub fn release(&mut self) -> bool {
        let Some((reader, writer)) = self.halves.take() else {
            return false;
        };

        if let Ok(stream) = reader.reunite(writer)
            && let Ok(stream) = stream.into_std()
        {
            let _ = stream.shutdown(Shutdown::Both);
        }
        true
    }
}

impl Drop for Destination {
    fn drop(&mut self) {
        self.release();
    }
}
