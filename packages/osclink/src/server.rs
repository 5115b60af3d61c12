//! Server counterpart: reads client frames from its own input and answers
//! on its own output.

use std::io::{self, Read, Stdin, Stdout, Write};

use tracing::{debug, info, trace, warn};

use crate::codec::{self, Direction, Scanner};
use crate::error::LinkError;
use crate::inbox::Inbox;
use crate::io::write_all_retrying;
use crate::signals;
use crate::terminal::TerminalGuard;

pub struct ServerLink<R = Stdin, W = Stdout> {
    input: R,
    output: W,
    scanner: Scanner,
    inbox: Inbox,
    guard: Option<TerminalGuard>,
}

impl ServerLink<Stdin, Stdout> {
    /// Server reading stdin and writing stdout.
    pub fn stdio() -> Self {
        Self::new(io::stdin(), io::stdout())
    }

    /// Install signal handlers and switch the controlling terminal, if any,
    /// to minimal raw mode. The terminal is restored by [`ServerLink::finish`]
    /// or on drop.
    pub fn start(&mut self) -> Result<(), LinkError> {
        signals::install()?;
        let guard = TerminalGuard::new();
        if guard.is_terminal() {
            guard.enter_minimal_mode();
            self.guard = Some(guard);
        }
        info!(terminal = self.guard.is_some(), "server link started");
        Ok(())
    }

    pub fn finish(&mut self) {
        self.guard = None;
    }
}

impl<R: Read, W: Write> ServerLink<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self {
            input,
            output,
            scanner: Scanner::new(Direction::ClientToServer),
            inbox: Inbox::new(),
            guard: None,
        }
    }

    /// Block until the next client payload arrives.
    ///
    /// Frames already decoded by an earlier read are returned before the
    /// input is touched again. Returns `None` once the input reaches EOF,
    /// fails, or termination is requested.
    pub fn pull_next(&mut self) -> Option<Vec<u8>> {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(payload) = self.inbox.try_pop() {
                return Some(payload);
            }
            if signals::termination_requested() {
                info!("termination requested");
                return None;
            }
            match self.input.read(&mut buf) {
                Ok(0) => {
                    info!("input closed");
                    self.scanner.reset();
                    return None;
                }
                Ok(n) => {
                    let feed = self.scanner.feed(&buf[..n]);
                    if !feed.passthrough.is_empty() {
                        trace!(bytes = feed.passthrough.len(), "ignoring non-frame input");
                    }
                    for payload in feed.frames {
                        debug!(bytes = payload.len(), "frame received");
                        self.inbox.push(payload);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => std::thread::yield_now(),
                Err(e) => {
                    warn!(error = %e, "input read failed");
                    return None;
                }
            }
        }
    }

    /// Write one server frame to the output.
    pub fn send(&mut self, payload: &[u8]) -> Result<(), LinkError> {
        let frame = codec::encode(Direction::ServerToClient, payload);
        write_all_retrying(&mut self.output, &frame).map_err(LinkError::WriteFailed)?;
        debug!(bytes = payload.len(), "frame sent");
        Ok(())
    }

    /// Decoded payloads waiting to be pulled.
    pub fn pending(&self) -> usize {
        self.inbox.len()
    }

    pub fn output(&self) -> &W {
        &self.output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io::Cursor;

    /// Hands out one scripted chunk per `read` call.
    struct Chunks {
        chunks: VecDeque<Vec<u8>>,
        reads: usize,
    }

    impl Chunks {
        fn new(chunks: &[&[u8]]) -> Self {
            Self {
                chunks: chunks.iter().map(|c| c.to_vec()).collect(),
                reads: 0,
            }
        }
    }

    impl Read for Chunks {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.reads += 1;
            match self.chunks.pop_front() {
                Some(chunk) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                None => Ok(0),
            }
        }
    }

    fn client(payload: &[u8]) -> Vec<u8> {
        let mut frame = codec::encode(Direction::ClientToServer, payload);
        frame.push(b'\n');
        frame
    }

    #[test]
    fn pulls_frames_in_order_then_none_at_eof() {
        let mut input = b"$ sudo osclink/build/server\r\n".to_vec();
        input.extend(client(b"REQUEST/TOPOLOGY"));
        input.extend(client(b"REQUEST/CONFIG"));
        let mut server = ServerLink::new(Cursor::new(input), Vec::new());

        assert_eq!(server.pull_next(), Some(b"REQUEST/TOPOLOGY".to_vec()));
        assert_eq!(server.pull_next(), Some(b"REQUEST/CONFIG".to_vec()));
        assert_eq!(server.pull_next(), None);
    }

    #[test]
    fn buffered_frames_are_served_before_reading_again() {
        let mut both = client(b"one");
        both.extend(client(b"two"));
        let mut server = ServerLink::new(Chunks::new(&[&both]), Vec::new());

        assert_eq!(server.pull_next(), Some(b"one".to_vec()));
        assert_eq!(server.pending(), 1);
        assert_eq!(server.pull_next(), Some(b"two".to_vec()));
        assert_eq!(server.input.reads, 1);
    }

    #[test]
    fn frame_split_across_reads() {
        let frame = client(b"REQUEST/HEATMAP-DATA");
        let (head, tail) = frame.split_at(9);
        let mut server = ServerLink::new(Chunks::new(&[head, tail]), Vec::new());
        assert_eq!(server.pull_next(), Some(b"REQUEST/HEATMAP-DATA".to_vec()));
    }

    #[test]
    fn malformed_frames_are_skipped() {
        let mut input = b"\x1b]9999;!!not base64!!\x07".to_vec();
        input.extend(client(b"REQUEST/CONFIG"));
        let mut server = ServerLink::new(Cursor::new(input), Vec::new());
        assert_eq!(server.pull_next(), Some(b"REQUEST/CONFIG".to_vec()));
        assert_eq!(server.pull_next(), None);
    }

    #[test]
    fn server_frames_on_input_are_not_requests() {
        let input = codec::encode(Direction::ServerToClient, b"SERVER-CONNECT");
        let mut server = ServerLink::new(Cursor::new(input), Vec::new());
        assert_eq!(server.pull_next(), None);
    }

    #[test]
    fn send_writes_a_server_frame() {
        let mut server = ServerLink::new(Cursor::new(Vec::new()), Vec::new());
        server.send(b"SERVER-CONNECT").unwrap();
        assert_eq!(server.output(), b"\x1b]9998;U0VSVkVSLUNPTk5FQ1Q=\x07");
    }
}
