//! The response builder handed to user handlers, and its conversion into
//! the framed reply the daemon expects.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{StatusCode, Version};
use tracing::warn;

use crate::proto::frame::{
    WorkerPayload, DAEMON_SHUTDOWN, DAEMON_SUSPEND, HTTP_KEEP_ALIVE, HTTP_RESPONSE_FILE,
    HTTP_RESPONSE_FILE_DELETE, HTTP_RESPONSE_INLINE, WEBSOCKET_UPGRADE,
};

#[derive(Debug)]
enum Kind {
    Inline,
    File { path: PathBuf, delete: bool },
    Websocket,
}

/// Response under construction. Handlers set a status, add headers, then
/// either write body bytes, point at a file to stream, or upgrade.
#[derive(Debug)]
pub struct Output {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    body: Vec<u8>,
    kind: Kind,
    control: u8,
    force_close: bool,
}

impl Output {
    pub(crate) fn new(version: Version) -> Output {
        Output {
            status: StatusCode::OK,
            version,
            headers: HeaderMap::new(),
            body: Vec::new(),
            kind: Kind::Inline,
            control: 0,
            force_close: false,
        }
    }

    /// Sets the response status.
    pub fn status(&mut self, code: StatusCode) -> &mut Output {
        self.status = code;
        self
    }

    /// Adds a header. Invalid names or values are dropped with a warning
    /// rather than poisoning the response.
    pub fn header(&mut self, name: &str, value: &str) -> &mut Output {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                self.headers.append(name, value);
            }
            _ => warn!(name, "dropping invalid response header"),
        }
        self
    }

    /// Appends body bytes.
    pub fn write(&mut self, bytes: impl AsRef<[u8]>) -> &mut Output {
        self.body.extend_from_slice(bytes.as_ref());
        self
    }

    /// Streams `path` to the client instead of an inline body. The daemon
    /// opens and sends the file; the worker is free immediately.
    pub fn serve_file(&mut self, path: impl AsRef<Path>) -> &mut Output {
        self.kind = Kind::File {
            path: path.as_ref().to_path_buf(),
            delete: false,
        };
        self
    }

    /// Like [`serve_file`](Output::serve_file), but the file is deleted once
    /// fully sent (or the connection dies).
    pub fn serve_file_and_delete(&mut self, path: impl AsRef<Path>) -> &mut Output {
        self.kind = Kind::File {
            path: path.as_ref().to_path_buf(),
            delete: true,
        };
        self
    }

    /// Upgrades this connection to a websocket: the accumulated status and
    /// headers become the `101` handshake and the client socket is handed
    /// to a websocket child process.
    pub fn upgrade_websocket(&mut self) -> &mut Output {
        self.status = StatusCode::SWITCHING_PROTOCOLS;
        self.kind = Kind::Websocket;
        self
    }

    /// Closes the connection after this response even if the client asked
    /// for keep-alive.
    pub fn close_connection(&mut self) -> &mut Output {
        self.force_close = true;
        self
    }

    /// Asks the daemon to shut down gracefully once this reply is framed.
    pub fn request_daemon_shutdown(&mut self) -> &mut Output {
        self.control |= DAEMON_SHUTDOWN;
        self
    }

    /// Asks the daemon to toggle accepting new connections.
    pub fn request_daemon_suspend(&mut self) -> &mut Output {
        self.control |= DAEMON_SUSPEND;
        self
    }

    fn head_bytes(&self, content_length: Option<u64>) -> Vec<u8> {
        let mut head = Vec::with_capacity(128 + self.headers.len() * 32);
        head.extend_from_slice(match self.version {
            Version::HTTP_10 => b"HTTP/1.0 ",
            _ => b"HTTP/1.1 ",
        });
        head.extend_from_slice(self.status.as_str().as_bytes());
        head.push(b' ');
        head.extend_from_slice(self.status.canonical_reason().unwrap_or("Unknown").as_bytes());
        head.extend_from_slice(b"\r\n");

        for (name, value) in self.headers.iter() {
            head.extend_from_slice(name.as_str().as_bytes());
            head.extend_from_slice(b": ");
            head.extend_from_slice(value.as_bytes());
            head.extend_from_slice(b"\r\n");
        }
        if !self.headers.contains_key(http::header::DATE) {
            head.extend_from_slice(b"date: ");
            head.extend_from_slice(httpdate::fmt_http_date(SystemTime::now()).as_bytes());
            head.extend_from_slice(b"\r\n");
        }
        if let Some(len) = content_length {
            if !self.headers.contains_key(http::header::CONTENT_LENGTH) {
                let mut itoa_buf = itoa::Buffer::new();
                head.extend_from_slice(b"content-length: ");
                head.extend_from_slice(itoa_buf.format(len).as_bytes());
                head.extend_from_slice(b"\r\n");
            }
        }
        head.extend_from_slice(b"\r\n");
        head
    }

    /// Builds the framed reply. `keep_alive` is what the request asked for;
    /// the handler can only downgrade it.
    pub(crate) fn into_reply(self, keep_alive: bool) -> (WorkerPayload, Vec<u8>) {
        let keep = keep_alive && !self.force_close;
        let mut flags = self.control;
        if keep {
            flags |= HTTP_KEEP_ALIVE;
        }

        let payload_body = match &self.kind {
            Kind::Inline => {
                flags |= HTTP_RESPONSE_INLINE;
                let mut bytes = self.head_bytes(Some(self.body.len() as u64));
                bytes.extend_from_slice(&self.body);
                bytes
            }
            Kind::File { path, delete } => {
                flags |= if *delete {
                    HTTP_RESPONSE_FILE_DELETE
                } else {
                    HTTP_RESPONSE_FILE
                };
                let file_len = std::fs::metadata(path).map(|m| m.len()).ok();
                let mut bytes = self.head_bytes(file_len);
                use std::os::unix::ffi::OsStrExt;
                bytes.extend_from_slice(path.as_os_str().as_bytes());
                bytes
            }
            Kind::Websocket => {
                flags |= WEBSOCKET_UPGRADE;
                self.head_bytes(None)
            }
        };

        (
            WorkerPayload {
                flags,
                content_length: payload_body.len(),
            },
            payload_body,
        )
    }
}

/// The framed `500` used when a handler fails or panics.
pub(crate) fn internal_error_reply(version: Version, keep_alive: bool) -> (WorkerPayload, Vec<u8>) {
    let mut out = Output::new(version);
    out.status(StatusCode::INTERNAL_SERVER_ERROR);
    out.into_reply(keep_alive)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_reply_has_status_line_and_length() {
        let mut out = Output::new(Version::HTTP_11);
        out.header("x-test", "1").write("hello");
        let (payload, body) = out.into_reply(true);

        assert!(payload.has(HTTP_RESPONSE_INLINE));
        assert!(payload.has(HTTP_KEEP_ALIVE));
        assert_eq!(payload.content_length, body.len());

        let text = String::from_utf8_lossy(&body);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{}", text);
        assert!(text.contains("x-test: 1\r\n"));
        assert!(text.contains("content-length: 5\r\n"));
        assert!(text.contains("date: "));
        assert!(text.ends_with("\r\n\r\nhello"));
    }

    #[test]
    fn explicit_content_length_is_not_duplicated() {
        let mut out = Output::new(Version::HTTP_11);
        out.header("content-length", "5").write("hello");
        let (_, body) = out.into_reply(true);
        let text = String::from_utf8_lossy(&body);
        assert_eq!(text.matches("content-length").count(), 1);
    }

    #[test]
    fn close_connection_drops_keep_alive() {
        let mut out = Output::new(Version::HTTP_11);
        out.close_connection();
        let (payload, _) = out.into_reply(true);
        assert!(!payload.has(HTTP_KEEP_ALIVE));
    }

    #[test]
    fn file_reply_appends_path_after_head() {
        let mut out = Output::new(Version::HTTP_11);
        out.serve_file_and_delete("/tmp/xfer.bin");
        let (payload, body) = out.into_reply(false);

        assert!(payload.has(HTTP_RESPONSE_FILE_DELETE));
        assert!(!payload.has(HTTP_RESPONSE_FILE));
        let text = String::from_utf8_lossy(&body);
        assert!(text.ends_with("\r\n\r\n/tmp/xfer.bin"), "{}", text);
    }

    #[test]
    fn websocket_reply_is_a_101_head() {
        let mut out = Output::new(Version::HTTP_11);
        out.header("upgrade", "websocket").upgrade_websocket();
        let (payload, body) = out.into_reply(true);

        assert!(payload.has(WEBSOCKET_UPGRADE));
        let text = String::from_utf8_lossy(&body);
        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn control_flags_ride_along() {
        let mut out = Output::new(Version::HTTP_11);
        out.request_daemon_shutdown();
        let (payload, _) = out.into_reply(true);
        assert!(payload.has(DAEMON_SHUTDOWN));
        assert!(!payload.has(DAEMON_SUSPEND));
    }

    #[test]
    fn error_reply_is_a_framed_500() {
        let (payload, body) = internal_error_reply(Version::HTTP_11, true);
        assert!(payload.has(HTTP_RESPONSE_INLINE));
        let text = String::from_utf8_lossy(&body);
        assert!(text.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(text.contains("content-length: 0\r\n"));
    }
}
