//! Length-prefixed framing over a byte stream.
//!
//! Every frame is an 8-byte header followed by `data_len` payload bytes:
//!
//! ```text
//! ┌──────────────┬──────────────┬────────────────────────┐
//! │ msg_type i32 │ data_len i32 │ payload (data_len)     │
//! └──────────────┴──────────────┴────────────────────────┘
//! ```
//!
//! Both header fields use native byte order; the peers always share a host.
//! Readers and writers loop over short transfers until the whole header
//! and the whole payload have moved.

use std::io::{self, ErrorKind, Read, Write};
use static_assertions::const_assert_eq;
use thiserror::Error;

use crate::consts::MAX_PAYLOAD_LEN;
use crate::message::Message;

/// On-wire frame header.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Event or signal id.
    pub msg_type: i32,
    /// Payload length in bytes.
    pub data_len: i32,
}

/// Header size in bytes.
pub const HEADER_LEN: usize = core::mem::size_of::<FrameHeader>();

const_assert_eq!(HEADER_LEN, 8);

impl FrameHeader {
    /// Serialize to native-endian bytes.
    pub fn to_bytes(self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..4].copy_from_slice(&self.msg_type.to_ne_bytes());
        out[4..].copy_from_slice(&self.data_len.to_ne_bytes());
        out
    }

    /// Deserialize from native-endian bytes.
    pub fn from_bytes(bytes: [u8; HEADER_LEN]) -> Self {
        let [a, b, c, d, e, f, g, h] = bytes;
        Self {
            msg_type: i32::from_ne_bytes([a, b, c, d]),
            data_len: i32::from_ne_bytes([e, f, g, h]),
        }
    }
}

/// Framing errors.
#[derive(Debug, Error)]
pub enum WireError {
    /// Peer closed the stream cleanly at a frame boundary.
    #[error("peer closed the connection")]
    Closed,

    /// Stream ended inside a frame.
    #[error("connection closed mid-frame ({got} of {want} bytes)")]
    Truncated {
        /// Bytes received.
        got: usize,
        /// Bytes expected.
        want: usize,
    },

    /// Header carries a negative length.
    #[error("invalid payload length {0}")]
    InvalidLength(i32),

    /// Payload exceeds [`MAX_PAYLOAD_LEN`].
    #[error("payload of {0} bytes exceeds the {MAX_PAYLOAD_LEN} byte limit")]
    PayloadTooLarge(usize),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl WireError {
    /// True when the error means the peer is gone (EOF, reset, broken pipe).
    pub fn is_disconnect(&self) -> bool {
        match self {
            WireError::Closed | WireError::Truncated { .. } => true,
            WireError::Io(e) => matches!(
                e.kind(),
                ErrorKind::BrokenPipe
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// Write one whole frame.
///
/// Oversized payloads are refused before anything reaches the stream.
pub fn write_message<W: Write>(writer: &mut W, msg: &Message) -> Result<(), WireError> {
    let len = msg.payload.len();
    if len > MAX_PAYLOAD_LEN {
        return Err(WireError::PayloadTooLarge(len));
    }
    let header = FrameHeader {
        msg_type: msg.msg_type,
        data_len: len as i32,
    };

    let mut frame = Vec::with_capacity(HEADER_LEN + len);
    frame.extend_from_slice(&header.to_bytes());
    frame.extend_from_slice(&msg.payload);
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Read one whole frame.
///
/// Returns [`WireError::Closed`] when the stream ends before the first
/// header byte, and [`WireError::Truncated`] when it ends anywhere later.
pub fn read_message<R: Read>(reader: &mut R) -> Result<Message, WireError> {
    let mut head = [0u8; HEADER_LEN];
    match read_full(reader, &mut head)? {
        0 => return Err(WireError::Closed),
        n if n < HEADER_LEN => {
            return Err(WireError::Truncated {
                got: n,
                want: HEADER_LEN,
            });
        }
        _ => {}
    }

    let header = FrameHeader::from_bytes(head);
    if header.data_len < 0 {
        return Err(WireError::InvalidLength(header.data_len));
    }
    let len = header.data_len as usize;
    if len > MAX_PAYLOAD_LEN {
        return Err(WireError::PayloadTooLarge(len));
    }

    let mut payload = vec![0u8; len];
    let got = read_full(reader, &mut payload)?;
    if got < len {
        return Err(WireError::Truncated {
            got: HEADER_LEN + got,
            want: HEADER_LEN + len,
        });
    }
    Ok(Message::new(header.msg_type, payload))
}

/// Fill `buf` unless EOF comes first; returns the number of bytes read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Event, Signal};
    use std::io::Cursor;

    // ─── Helpers ────────────────────────────────────────────────────

    /// Reader that hands out at most one byte per call and is interrupted
    /// every other call.
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        interrupt: bool,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.interrupt = !self.interrupt;
            if self.interrupt {
                return Err(io::Error::from(ErrorKind::Interrupted));
            }
            if self.pos >= self.data.len() || buf.is_empty() {
                return Ok(0);
            }
            buf[0] = self.data[self.pos];
            self.pos += 1;
            Ok(1)
        }
    }

    /// Writer that accepts at most three bytes per call.
    struct Choked(Vec<u8>);

    impl Write for Choked {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = buf.len().min(3);
            self.0.extend_from_slice(&buf[..n]);
            Ok(n)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn encode(msg: &Message) -> Vec<u8> {
        let mut out = Vec::new();
        write_message(&mut out, msg).expect("write");
        out
    }

    // ─── Layout ─────────────────────────────────────────────────────

    #[test]
    fn header_layout_is_type_then_length() {
        let bytes = encode(&Message::event(Event::Shutdown, b"now".to_vec()));
        assert_eq!(bytes.len(), HEADER_LEN + 3);
        assert_eq!(bytes[..4], Event::Shutdown.id().to_ne_bytes());
        assert_eq!(bytes[4..8], 3i32.to_ne_bytes());
        assert_eq!(&bytes[8..], b"now");
    }

    #[test]
    fn empty_payload_is_header_only() {
        let bytes = encode(&Message::event(Event::ClearStats, Vec::new()));
        assert_eq!(bytes.len(), HEADER_LEN);
        let msg = read_message(&mut Cursor::new(bytes)).expect("read");
        assert!(msg.payload.is_empty());
    }

    // ─── Partial transfers ──────────────────────────────────────────

    #[test]
    fn short_reads_are_reassembled() {
        let msg = Message::signal(Signal::ConfigError, b"bad rule on line 4".to_vec());
        let mut trickle = Trickle {
            data: encode(&msg),
            pos: 0,
            interrupt: false,
        };
        assert_eq!(read_message(&mut trickle).expect("read"), msg);
        assert!(matches!(read_message(&mut trickle), Err(WireError::Closed)));
    }

    #[test]
    fn short_writes_are_completed() {
        let msg = Message::with_i32(Signal::Pid.id(), 31337);
        let mut sink = Choked(Vec::new());
        write_message(&mut sink, &msg).expect("write");
        assert_eq!(sink.0, encode(&msg));
    }

    #[test]
    fn consecutive_frames_stay_aligned() {
        let mut stream = encode(&Message::event(Event::SyncKey, 7i32.to_ne_bytes().to_vec()));
        stream.extend(encode(&Message::event(Event::RollLogFiles, Vec::new())));
        let mut cursor = Cursor::new(stream);
        assert_eq!(read_message(&mut cursor).unwrap().as_i32(), Some(7));
        assert_eq!(
            read_message(&mut cursor).unwrap().as_event(),
            Some(Event::RollLogFiles)
        );
        assert!(matches!(read_message(&mut cursor), Err(WireError::Closed)));
    }

    // ─── Errors ─────────────────────────────────────────────────────

    #[test]
    fn eof_inside_header_is_truncation() {
        let bytes = encode(&Message::event(Event::Drain, Vec::new()));
        let err = read_message(&mut Cursor::new(bytes[..5].to_vec())).unwrap_err();
        assert!(matches!(err, WireError::Truncated { got: 5, want: 8 }));
        assert!(err.is_disconnect());
    }

    #[test]
    fn eof_inside_payload_is_truncation() {
        let bytes = encode(&Message::signal(Signal::SystemError, b"disk".to_vec()));
        let err = read_message(&mut Cursor::new(bytes[..10].to_vec())).unwrap_err();
        assert!(matches!(err, WireError::Truncated { got: 10, want: 12 }));
    }

    #[test]
    fn negative_length_is_rejected() {
        let header = FrameHeader {
            msg_type: 3,
            data_len: -1,
        };
        let err = read_message(&mut Cursor::new(header.to_bytes().to_vec())).unwrap_err();
        assert!(matches!(err, WireError::InvalidLength(-1)));
        assert!(!err.is_disconnect());
    }

    #[test]
    fn oversized_payload_is_refused_both_ways() {
        let big = Message::new(4, vec![0u8; MAX_PAYLOAD_LEN + 1]);
        let mut out = Vec::new();
        assert!(matches!(
            write_message(&mut out, &big),
            Err(WireError::PayloadTooLarge(_))
        ));
        assert!(out.is_empty());

        let header = FrameHeader {
            msg_type: 4,
            data_len: (MAX_PAYLOAD_LEN + 1) as i32,
        };
        assert!(matches!(
            read_message(&mut Cursor::new(header.to_bytes().to_vec())),
            Err(WireError::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn broken_pipe_counts_as_disconnect() {
        let err = WireError::from(io::Error::from(ErrorKind::BrokenPipe));
        assert!(err.is_disconnect());
        let err = WireError::from(io::Error::from(ErrorKind::PermissionDenied));
        assert!(!err.is_disconnect());
    }
}
