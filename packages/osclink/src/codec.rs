//! Frame codec for messages carried inside a terminal byte stream.
//!
//! Wire format: `ESC ] 9999 ;` (client to server) or `ESC ] 9998 ;` (server to
//! client), then the payload as padded standard base64, then a single `BEL`.
//! Terminals and multiplexers ignore private OSC numbers, so frames travel
//! through an interactive session without disturbing it.
//!
//! [`Scanner`] is the incremental decoder. All of its state lives in the
//! struct, so a frame may be split across any number of [`Scanner::feed`]
//! calls, down to one byte at a time.

use data_encoding::BASE64;
use tracing::{debug, trace};

/// Start of a frame written by the client.
pub const CLIENT_PREFIX: &[u8] = b"\x1b]9999;";
/// Start of a frame written by the server.
pub const SERVER_PREFIX: &[u8] = b"\x1b]9998;";
/// End of every frame (`BEL`).
pub const TERMINATOR: u8 = 0x07;

/// Which side of the tunnel wrote a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl Direction {
    pub fn prefix(self) -> &'static [u8] {
        match self {
            Direction::ClientToServer => CLIENT_PREFIX,
            Direction::ServerToClient => SERVER_PREFIX,
        }
    }

    /// The direction of traffic flowing the other way.
    pub fn reverse(self) -> Self {
        match self {
            Direction::ClientToServer => Direction::ServerToClient,
            Direction::ServerToClient => Direction::ClientToServer,
        }
    }
}

/// Encode `payload` as one complete frame.
pub fn encode(direction: Direction, payload: &[u8]) -> Vec<u8> {
    let prefix = direction.prefix();
    let mut frame = Vec::with_capacity(prefix.len() + BASE64.encode_len(payload.len()) + 1);
    frame.extend_from_slice(prefix);
    frame.extend_from_slice(BASE64.encode(payload).as_bytes());
    frame.push(TERMINATOR);
    frame
}

/// Result of feeding one chunk of stream bytes to a [`Scanner`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Feed {
    /// Bytes that belong to no frame, in stream order.
    pub passthrough: Vec<u8>,
    /// Payloads whose terminator was seen in this chunk, in stream order.
    pub frames: Vec<Vec<u8>>,
}

#[derive(Debug)]
enum ScanState {
    /// Looking for the prefix; `matched` bytes of it have been seen and held back.
    Seeking { matched: usize },
    /// Prefix matched; collecting the base64 body until `BEL`.
    Body(Vec<u8>),
}

/// Incremental frame decoder for one inbound direction.
#[derive(Debug)]
pub struct Scanner {
    prefix: &'static [u8],
    state: ScanState,
}

impl Scanner {
    /// Scanner for frames arriving from the given direction.
    pub fn new(inbound: Direction) -> Self {
        Self {
            prefix: inbound.prefix(),
            state: ScanState::Seeking { matched: 0 },
        }
    }

    /// Consume one chunk, returning passthrough bytes and completed payloads.
    ///
    /// Bytes that partially match the prefix at the end of a chunk are held
    /// back until the next chunk decides whether they start a frame.
    pub fn feed(&mut self, chunk: &[u8]) -> Feed {
        let mut out = Feed::default();
        for &byte in chunk {
            self.step(byte, &mut out);
        }
        out
    }

    /// True while a frame body is being accumulated.
    pub fn in_frame(&self) -> bool {
        matches!(self.state, ScanState::Body(_))
    }

    /// Prefix bytes currently held back from the passthrough stream.
    pub fn held(&self) -> &[u8] {
        match self.state {
            ScanState::Seeking { matched } => &self.prefix[..matched],
            ScanState::Body(_) => &[],
        }
    }

    /// Drop any partial frame. Used when the underlying stream closes.
    pub fn reset(&mut self) {
        if let ScanState::Body(body) = &self.state {
            debug!(bytes = body.len(), "discarding incomplete frame");
        }
        self.state = ScanState::Seeking { matched: 0 };
    }

    /// End of stream: return the held prefix bytes, which can no longer
    /// start a frame, and reset.
    pub fn finish(&mut self) -> Vec<u8> {
        let tail = self.held().to_vec();
        self.reset();
        tail
    }

    fn step(&mut self, byte: u8, out: &mut Feed) {
        match &mut self.state {
            ScanState::Body(body) => {
                if byte != TERMINATOR {
                    body.push(byte);
                    return;
                }
                let body = std::mem::take(body);
                self.state = ScanState::Seeking { matched: 0 };
                match BASE64.decode(&body) {
                    Ok(payload) => {
                        trace!(bytes = payload.len(), "frame decoded");
                        out.frames.push(payload);
                    }
                    Err(e) => debug!(error = %e, bytes = body.len(), "dropping malformed frame"),
                }
            }
            ScanState::Seeking { matched } => {
                if byte == self.prefix[*matched] {
                    *matched += 1;
                    if *matched == self.prefix.len() {
                        self.state = ScanState::Body(Vec::new());
                    }
                    return;
                }
                // The prefix byte ESC occurs only at position 0, so restarting
                // the match at this byte is exact.
                out.passthrough.extend_from_slice(&self.prefix[..*matched]);
                if byte == self.prefix[0] {
                    *matched = 1;
                } else {
                    *matched = 0;
                    out.passthrough.push(byte);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_is_bit_exact() {
        assert_eq!(
            encode(Direction::ClientToServer, b"REQUEST/TOPOLOGY"),
            b"\x1b]9999;UkVRVUVTVC9UT1BPTE9HWQ==\x07".to_vec()
        );
        assert_eq!(
            encode(Direction::ServerToClient, b""),
            b"\x1b]9998;\x07".to_vec()
        );
    }

    #[test]
    fn decodes_frame_and_strips_it_from_passthrough() {
        let mut stream = b"$ ls\r\n".to_vec();
        stream.extend(encode(Direction::ServerToClient, b"SERVER-CONNECT"));
        stream.extend_from_slice(b"done\r\n");

        let mut scanner = Scanner::new(Direction::ServerToClient);
        let feed = scanner.feed(&stream);
        assert_eq!(feed.frames, vec![b"SERVER-CONNECT".to_vec()]);
        assert_eq!(feed.passthrough, b"$ ls\r\ndone\r\n".to_vec());
        assert!(!scanner.in_frame());
    }

    #[test]
    fn byte_at_a_time() {
        let frame = encode(Direction::ServerToClient, b"TOPOLOGY;XYZ");
        let mut scanner = Scanner::new(Direction::ServerToClient);
        let mut frames = Vec::new();
        for b in &frame {
            let feed = scanner.feed(std::slice::from_ref(b));
            assert!(feed.passthrough.is_empty());
            frames.extend(feed.frames);
        }
        assert_eq!(frames, vec![b"TOPOLOGY;XYZ".to_vec()]);
    }

    #[test]
    fn several_frames_in_one_chunk() {
        let mut stream = encode(Direction::ClientToServer, b"a");
        stream.push(b'\n');
        stream.extend(encode(Direction::ClientToServer, b"b"));
        stream.extend(encode(Direction::ClientToServer, b"c"));

        let feed = Scanner::new(Direction::ClientToServer).feed(&stream);
        assert_eq!(feed.frames, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        assert_eq!(feed.passthrough, b"\n".to_vec());
    }

    #[test]
    fn ansi_sequences_pass_through() {
        let stream = b"\x1b[31mred\x1b[0m \x1b]0;title\x07 \x1b]99;x\x07";
        let feed = Scanner::new(Direction::ServerToClient).feed(stream);
        assert!(feed.frames.is_empty());
        assert_eq!(feed.passthrough, stream.to_vec());
    }

    #[test]
    fn partial_prefix_is_held_until_resolved() {
        let mut scanner = Scanner::new(Direction::ServerToClient);
        let feed = scanner.feed(b"ok\x1b]99");
        assert_eq!(feed.passthrough, b"ok".to_vec());
        assert_eq!(scanner.held(), b"\x1b]99");

        let feed = scanner.feed(b"1;");
        assert_eq!(feed.passthrough, b"\x1b]991;".to_vec());
        assert!(scanner.held().is_empty());
    }

    #[test]
    fn mismatching_escape_restarts_match() {
        let mut stream = b"\x1b".to_vec();
        stream.extend(encode(Direction::ServerToClient, b"x"));
        let feed = Scanner::new(Direction::ServerToClient).feed(&stream);
        assert_eq!(feed.passthrough, b"\x1b".to_vec());
        assert_eq!(feed.frames, vec![b"x".to_vec()]);
    }

    #[test]
    fn malformed_body_is_dropped_and_scanning_recovers() {
        let mut stream = b"\x1b]9998;not base64!\x07".to_vec();
        stream.extend(encode(Direction::ServerToClient, b"after"));
        let feed = Scanner::new(Direction::ServerToClient).feed(&stream);
        assert_eq!(feed.frames, vec![b"after".to_vec()]);
        assert!(feed.passthrough.is_empty());
    }

    #[test]
    fn prefix_inside_body_is_taken_literally() {
        let mut stream = b"\x1b]9998;QUJD\x1b]9998;RA==\x07".to_vec();
        stream.extend(encode(Direction::ServerToClient, b"next"));
        let feed = Scanner::new(Direction::ServerToClient).feed(&stream);
        // The nested prefix is body text, so the first frame fails to decode.
        assert_eq!(feed.frames, vec![b"next".to_vec()]);
    }

    #[test]
    fn other_direction_is_passthrough() {
        let frame = encode(Direction::ClientToServer, b"echoed");
        let feed = Scanner::new(Direction::ServerToClient).feed(&frame);
        assert!(feed.frames.is_empty());
        assert_eq!(feed.passthrough, frame);
    }

    #[test]
    fn reset_discards_partial_frame() {
        let frame = encode(Direction::ServerToClient, b"lost");
        let mut scanner = Scanner::new(Direction::ServerToClient);
        scanner.feed(&frame[..frame.len() - 1]);
        assert!(scanner.in_frame());
        scanner.reset();
        let feed = scanner.feed(&[TERMINATOR]);
        assert!(feed.frames.is_empty());
        assert_eq!(feed.passthrough, vec![TERMINATOR]);
    }

    #[test]
    fn finish_releases_held_prefix() {
        let mut scanner = Scanner::new(Direction::ServerToClient);
        let feed = scanner.feed(b"$ \x1b]99");
        assert_eq!(feed.passthrough, b"$ ".to_vec());
        assert_eq!(scanner.finish(), b"\x1b]99".to_vec());
        assert!(scanner.held().is_empty());

        // Nothing is released from inside a frame body.
        scanner.feed(b"\x1b]9998;QUJD");
        assert!(scanner.finish().is_empty());
        assert!(!scanner.in_frame());
    }
}
