//! Dispatch framing between daemon and worker.
//!
//! Requests go daemon→worker as a 4-byte little-endian length followed by
//! the canonical message text. Replies come back worker→daemon as a fixed
//! [`WorkerPayload`] header (one flag byte plus a native-width content
//! length; both ends are the same build on the same machine) followed by
//! `content_length` payload bytes.

use std::io::{self, Read, Write};

pub(crate) const HTTP_RESPONSE_INLINE: u8 = 1;
pub(crate) const HTTP_RESPONSE_FILE: u8 = 2;
pub(crate) const HTTP_RESPONSE_FILE_DELETE: u8 = 4;
pub(crate) const HTTP_KEEP_ALIVE: u8 = 8;
pub(crate) const WEBSOCKET_UPGRADE: u8 = 16;
pub(crate) const DAEMON_SHUTDOWN: u8 = 32;
pub(crate) const DAEMON_SUSPEND: u8 = 64;

/// Byte a worker sends right after connecting its IPC socket.
pub(crate) const WORKER_HELLO: u8 = 0x55;

/// Byte a websocket child sends after receiving the client descriptor.
pub(crate) const HANDOFF_ACK: u8 = 0xaa;

pub(crate) const PAYLOAD_HEADER_SIZE: usize = 1 + std::mem::size_of::<usize>();

/// The fixed-layout header prepended to every worker reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WorkerPayload {
    pub(crate) flags: u8,
    pub(crate) content_length: usize,
}

impl WorkerPayload {
    pub(crate) fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    pub(crate) fn encode(&self) -> [u8; PAYLOAD_HEADER_SIZE] {
        let mut out = [0u8; PAYLOAD_HEADER_SIZE];
        out[0] = self.flags;
        out[1..].copy_from_slice(&self.content_length.to_ne_bytes());
        out
    }

    pub(crate) fn decode(raw: &[u8]) -> WorkerPayload {
        debug_assert!(raw.len() >= PAYLOAD_HEADER_SIZE);
        let mut len = [0u8; std::mem::size_of::<usize>()];
        len.copy_from_slice(&raw[1..PAYLOAD_HEADER_SIZE]);
        WorkerPayload {
            flags: raw[0],
            content_length: usize::from_ne_bytes(len),
        }
    }
}

/// Worker side: blocking read of one request frame. `Ok(None)` on a clean
/// EOF before the length prefix, which is how the daemon says goodbye.
pub(crate) fn read_request_frame(src: &mut impl Read) -> io::Result<Option<Vec<u8>>> {
    let mut prefix = [0u8; 4];
    let mut filled = 0;
    while filled < prefix.len() {
        match src.read(&mut prefix[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "eof inside frame prefix",
                ))
            }
            Ok(n) => filled += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    let len = u32::from_le_bytes(prefix) as usize;
    let mut payload = vec![0u8; len];
    src.read_exact(&mut payload)?;
    Ok(Some(payload))
}

/// Worker side: blocking write of one reply frame.
pub(crate) fn write_reply(
    dst: &mut impl Write,
    payload: WorkerPayload,
    body: &[u8],
) -> io::Result<()> {
    debug_assert_eq!(payload.content_length, body.len());
    dst.write_all(&payload.encode())?;
    dst.write_all(body)?;
    dst.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn payload_header_round_trip() {
        let payload = WorkerPayload {
            flags: HTTP_RESPONSE_INLINE | HTTP_KEEP_ALIVE,
            content_length: 12345,
        };
        let raw = payload.encode();
        assert_eq!(raw.len(), PAYLOAD_HEADER_SIZE);
        let back = WorkerPayload::decode(&raw);
        assert_eq!(back, payload);
        assert!(back.has(HTTP_KEEP_ALIVE));
        assert!(!back.has(HTTP_RESPONSE_FILE));
    }

    #[test]
    fn flags_are_distinct_bits() {
        let all = [
            HTTP_RESPONSE_INLINE,
            HTTP_RESPONSE_FILE,
            HTTP_RESPONSE_FILE_DELETE,
            HTTP_KEEP_ALIVE,
            WEBSOCKET_UPGRADE,
            DAEMON_SHUTDOWN,
            DAEMON_SUSPEND,
        ];
        let mut seen = 0u8;
        for flag in all {
            assert_eq!(flag.count_ones(), 1);
            assert_eq!(seen & flag, 0);
            seen |= flag;
        }
    }

    #[test]
    fn request_frame_round_trip() {
        let message = b"GET / HTTP/1.1\r\n\r\n";
        let mut wire = Vec::new();
        wire.extend_from_slice(&(message.len() as u32).to_le_bytes());
        wire.extend_from_slice(message);

        let mut src = Cursor::new(wire);
        let frame = read_request_frame(&mut src).unwrap().unwrap();
        assert_eq!(frame, message);
        assert!(read_request_frame(&mut src).unwrap().is_none(), "clean eof");
    }

    #[test]
    fn truncated_frame_is_an_error() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&100u32.to_le_bytes());
        wire.extend_from_slice(b"short");
        let mut src = Cursor::new(wire);
        assert!(read_request_frame(&mut src).is_err());
    }

    #[test]
    fn reply_frame_layout() {
        let mut wire = Vec::new();
        let payload = WorkerPayload {
            flags: HTTP_RESPONSE_INLINE,
            content_length: 2,
        };
        write_reply(&mut wire, payload, b"OK").unwrap();
        assert_eq!(wire.len(), PAYLOAD_HEADER_SIZE + 2);
        assert_eq!(WorkerPayload::decode(&wire), payload);
        assert_eq!(&wire[PAYLOAD_HEADER_SIZE..], b"OK");
    }
}
