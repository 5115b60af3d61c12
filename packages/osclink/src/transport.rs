use crate::codec::{self, Direction};
use crate::error::LinkError;

/// Operations shared by the client-side transports, so the code that
/// dispatches commands does not care whether frames travel through a local
/// PTY or an SSH exec channel.
pub trait Transport {
    /// Bring the transport up and start its background reader.
    fn start(&mut self) -> Result<(), LinkError>;

    /// Encode `payload` as one frame and write it.
    ///
    /// Must not be called concurrently from several threads on one transport.
    fn send(&mut self, payload: &[u8]) -> Result<(), LinkError>;

    /// Pop the oldest received payload without blocking.
    fn try_pull(&self) -> Option<Vec<u8>>;

    /// Stop the reader and release every descriptor. Idempotent.
    fn finish(&mut self);

    /// True while the background reader is alive.
    fn is_running(&self) -> bool;
}

/// A client frame followed by a newline, so a line-buffered relay flushes it.
pub(crate) fn client_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = codec::encode(Direction::ClientToServer, payload);
    frame.push(b'\n');
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frame_ends_with_newline() {
        assert_eq!(client_frame(b""), b"\x1b]9999;\x07\n");
        assert_eq!(client_frame(b"SERVER-CONNECT"), b"\x1b]9999;U0VSVkVSLUNPTk5FQ1Q=\x07\n");
    }
}
