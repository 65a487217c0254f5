//! Pieces pertaining to the HTTP message protocol and the daemon↔worker
//! dispatch framing.

use std::ops::Range;

use http::{Method, Version};

pub(crate) mod frame;
pub(crate) mod parse;

/// The end of headers must show up within this many bytes.
pub(crate) const MAX_HEADER_BLOCK: usize = 16 * 1024;

/// A full request head can't be shorter than `GET / HTTP/1.1\r\n\r\n`.
pub(crate) const MIN_HEAD_SIZE: usize = 18;

/// Bytes reserved at the front of [`ProtoRequest::data`] for the dispatch
/// length prefix.
pub(crate) const PREFIX_SIZE: usize = 4;

/// Disposition parsed from the `connection` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionHeader {
    Unknown,
    KeepAlive,
    Close,
    Upgrade,
}

/// Refusals the daemon answers without involving a worker: a minimal
/// `HTTP/1.0` status line, then the connection is reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Refusal {
    BadRequest,
    RequestTimeout,
    BodyTooLarge,
    HeadersTooLarge,
}

impl Refusal {
    pub(crate) fn status_line(self) -> &'static [u8] {
        match self {
            Refusal::BadRequest => b"HTTP/1.0 400 Bad Request\r\n\r\n",
            Refusal::RequestTimeout => b"HTTP/1.0 408 Request Timeout\r\n\r\n",
            Refusal::BodyTooLarge => b"HTTP/1.0 413 Request Entity Too Large\r\n\r\n",
            Refusal::HeadersTooLarge => b"HTTP/1.0 431 Request Header Fields Too Large\r\n\r\n",
        }
    }
}

/// One parsed-so-far HTTP request on a connection.
///
/// `data` holds the canonicalized message the worker will receive: four
/// prefix bytes (backfilled at dispatch), then the request line, the
/// lower-cased header block (with the synthetic `x-remote-ip` line first
/// when configured), a blank line, and the body as it accumulates.
#[derive(Debug)]
pub(crate) struct ProtoRequest {
    pub(crate) valid: bool,
    pub(crate) expect_100: bool,
    pub(crate) content_length: usize,
    /// Offset into `data` where the body begins (prefix included).
    pub(crate) headers_length: usize,
    pub(crate) method: Method,
    pub(crate) uri: Range<usize>,
    pub(crate) connection: ConnectionHeader,
    pub(crate) version: Version,
    pub(crate) data: Vec<u8>,
}

impl ProtoRequest {
    pub(crate) fn uri(&self) -> &str {
        // The span was validated as ASCII at parse time.
        std::str::from_utf8(&self.data[self.uri.clone()]).unwrap_or("/")
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.data.len() == self.headers_length + self.content_length
    }

    /// Body bytes still missing.
    pub(crate) fn missing(&self) -> usize {
        self.headers_length + self.content_length - self.data.len()
    }

    /// Headers plus body, the size the request-size limit applies to.
    pub(crate) fn total_size(&self) -> usize {
        self.headers_length - PREFIX_SIZE + self.content_length
    }

    /// Resolves `Unknown` by HTTP version, the disposition used at dispatch.
    pub(crate) fn effective_connection(&self) -> ConnectionHeader {
        match self.connection {
            ConnectionHeader::Unknown => {
                if self.version == Version::HTTP_11 {
                    ConnectionHeader::KeepAlive
                } else {
                    ConnectionHeader::Close
                }
            }
            other => other,
        }
    }

    /// Backfills the dispatch length prefix. Must be called exactly once,
    /// right before the payload goes onto a worker's IPC socket.
    pub(crate) fn fill_prefix(&mut self) {
        debug_assert!(self.valid && self.is_complete());
        let len = (self.data.len() - PREFIX_SIZE) as u32;
        self.data[..PREFIX_SIZE].copy_from_slice(&len.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_request() -> ProtoRequest {
        let head = b"\0\0\0\0GET /x HTTP/1.1\r\nhost: h\r\n\r\n";
        ProtoRequest {
            valid: true,
            expect_100: false,
            content_length: 0,
            headers_length: head.len(),
            method: Method::GET,
            uri: 8..10,
            connection: ConnectionHeader::Unknown,
            version: Version::HTTP_11,
            data: head.to_vec(),
        }
    }

    #[test]
    fn prefix_encodes_payload_length() {
        let mut req = small_request();
        req.fill_prefix();
        let expect = (req.data.len() - PREFIX_SIZE) as u32;
        assert_eq!(req.data[..4], expect.to_le_bytes());
    }

    #[test]
    fn unknown_connection_resolves_by_version() {
        let mut req = small_request();
        assert_eq!(req.effective_connection(), ConnectionHeader::KeepAlive);
        req.version = Version::HTTP_10;
        assert_eq!(req.effective_connection(), ConnectionHeader::Close);
        req.connection = ConnectionHeader::Close;
        req.version = Version::HTTP_11;
        assert_eq!(req.effective_connection(), ConnectionHeader::Close);
    }

    #[test]
    fn uri_span() {
        let req = small_request();
        assert_eq!(req.uri(), "/x");
    }
}
