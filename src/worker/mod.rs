//! The worker process runtime.
//!
//! A worker connects back to the daemon over the socket address it was
//! spawned with, sends its handshake byte, then serves framed requests
//! serially: read a frame, rebuild the [`Request`], run the user handler
//! once, write one framed reply. Panics and handler errors become framed
//! `500`s; the killer thread enforces the wall-clock budgets.

use std::io::{Read, Write};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use http::Version;
use tracing::{debug, error, trace};

use crate::config::Config;
use crate::ipc;
use crate::proto::frame::{read_request_frame, write_reply, WORKER_HELLO};
use crate::Handler;

pub(crate) mod killer;
pub(crate) mod request;
pub(crate) mod response;

pub use self::request::Request;
pub use self::response::Output;

use self::killer::{Limits, Monitor};
use self::response::internal_error_reply;

/// Idle budget for workers spawned past `min_workers`.
const DYNAMIC_IDLE: Duration = Duration::from_secs(5);

/// Entry point of a worker child.
pub(crate) fn main<H: Handler>(handler: H, config: &Config) -> crate::Result<()> {
    let address = std::env::var(ipc::ENV_SOCKET)
        .map_err(|_| crate::Error::new_worker("missing socket address in environment"))?;

    let expected_build = std::env::var(ipc::ENV_BUILD).unwrap_or_default();
    if expected_build != ipc::build_id() {
        // A daemon from another build of the executable; don't serve it.
        return Err(crate::Error::new_worker("build mismatch, refusing daemon"));
    }

    let dynamic = std::env::var(ipc::ENV_DYNAMIC).map(|v| v == "1").unwrap_or(false);
    let daemon_pid: Option<i32> = std::env::var(ipc::ENV_DAEMON)
        .ok()
        .and_then(|v| v.parse().ok());

    unsafe {
        let _ = nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGPIPE,
            nix::sys::signal::SigHandler::SigIgn,
        );
    }

    let mut stream = ipc::connect_channel(&address).map_err(crate::Error::new_worker)?;
    stream
        .write_all(&[WORKER_HELLO])
        .map_err(crate::Error::new_io)?;
    debug!(dynamic, "worker connected");

    let monitor = Monitor::new();
    let max_idling = if dynamic {
        DYNAMIC_IDLE.min(config.max_worker_idling)
    } else {
        config.max_worker_idling
    };
    killer::spawn(
        monitor.clone(),
        Limits {
            max_request_time: config.max_request_time,
            max_lifetime: config.max_worker_lifetime,
            max_idling,
            daemon_pid,
        },
    );

    serve(&handler, &mut stream, &monitor)
}

/// Serves framed requests from `io` until the daemon closes the channel.
fn serve<H, S>(handler: &H, io: &mut S, monitor: &Monitor) -> crate::Result<()>
where
    H: Handler,
    S: Read + Write,
{
    loop {
        monitor.set_idle();
        let frame = match read_request_frame(io).map_err(crate::Error::new_io)? {
            Some(frame) => frame,
            None => {
                debug!("daemon closed the channel");
                return Ok(());
            }
        };
        monitor.set_busy();
        trace!(len = frame.len(), "request frame");

        let (payload, body) = handle_one(handler, frame);
        write_reply(io, payload, &body).map_err(crate::Error::new_io)?;
    }
}

fn handle_one<H: Handler>(
    handler: &H,
    frame: Vec<u8>,
) -> (crate::proto::frame::WorkerPayload, Vec<u8>) {
    let request = match Request::parse(frame) {
        Ok(request) => request,
        Err(err) => {
            error!(%err, "unparseable frame from daemon");
            return internal_error_reply(Version::HTTP_11, false);
        }
    };

    let keep_alive = wants_keep_alive(&request);
    let version = request.version();
    let mut output = Output::new(version);

    let outcome = catch_unwind(AssertUnwindSafe(|| handler.handle(&request, &mut output)));
    match outcome {
        Ok(Ok(())) => output.into_reply(keep_alive),
        Ok(Err(err)) => {
            error!(%err, path = request.path(), "handler failed");
            internal_error_reply(version, keep_alive)
        }
        Err(_panic) => {
            error!(path = request.path(), "handler panicked");
            internal_error_reply(version, keep_alive)
        }
    }
}

/// The connection disposition the request asked for; the daemon applies its
/// own policy on top.
fn wants_keep_alive(request: &Request) -> bool {
    match request.header("connection") {
        Some(value) if value.eq_ignore_ascii_case("close") => false,
        Some(value) if value.eq_ignore_ascii_case("keep-alive") => true,
        _ => request.version() == Version::HTTP_11,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::frame::{
        WorkerPayload, HTTP_KEEP_ALIVE, HTTP_RESPONSE_FILE_DELETE, HTTP_RESPONSE_INLINE,
        PAYLOAD_HEADER_SIZE,
    };
    use std::io::Cursor;

    fn framed(message: &[u8]) -> Vec<u8> {
        let mut wire = Vec::new();
        wire.extend_from_slice(&(message.len() as u32).to_le_bytes());
        wire.extend_from_slice(message);
        wire
    }

    struct Wire {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Read for Wire {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Wire {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.output.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn run_one<H: Handler>(handler: H, message: &[u8]) -> (WorkerPayload, Vec<u8>) {
        let mut wire = Wire {
            input: Cursor::new(framed(message)),
            output: Vec::new(),
        };
        let monitor = Monitor::new();
        serve(&handler, &mut wire, &monitor).unwrap();

        let payload = WorkerPayload::decode(&wire.output);
        let body = wire.output[PAYLOAD_HEADER_SIZE..].to_vec();
        assert_eq!(payload.content_length, body.len());
        (payload, body)
    }

    #[test]
    fn serves_one_request_and_returns_on_eof() {
        let handler = |req: &Request, out: &mut Output| -> crate::Result<()> {
            assert_eq!(req.path(), "/hello");
            out.write("hi there");
            Ok(())
        };
        let (payload, body) =
            run_one(handler, b"GET /hello HTTP/1.1\r\nhost: h\r\n\r\n");

        assert!(payload.has(HTTP_RESPONSE_INLINE));
        assert!(payload.has(HTTP_KEEP_ALIVE));
        let text = String::from_utf8_lossy(&body);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("hi there"));
    }

    #[test]
    fn handler_error_becomes_framed_500() {
        let handler = |_: &Request, _: &mut Output| -> crate::Result<()> {
            Err(crate::Error::handler("boom"))
        };
        let (payload, body) = run_one(handler, b"GET / HTTP/1.1\r\n\r\n");
        assert!(payload.has(HTTP_RESPONSE_INLINE));
        assert!(String::from_utf8_lossy(&body).starts_with("HTTP/1.1 500 "));
    }

    #[test]
    fn handler_panic_becomes_framed_500() {
        let handler = |_: &Request, _: &mut Output| -> crate::Result<()> {
            panic!("deliberate");
        };
        let prev_hook = std::panic::take_hook();
        std::panic::set_hook(Box::new(|_| {}));
        let (payload, body) = run_one(handler, b"GET / HTTP/1.1\r\n\r\n");
        std::panic::set_hook(prev_hook);

        assert!(payload.has(HTTP_RESPONSE_INLINE));
        assert!(String::from_utf8_lossy(&body).starts_with("HTTP/1.1 500 "));
    }

    #[test]
    fn connection_close_drops_keep_alive_flag() {
        let handler = |_: &Request, out: &mut Output| -> crate::Result<()> {
            out.write("x");
            Ok(())
        };
        let (payload, _) = run_one(
            handler,
            b"GET / HTTP/1.1\r\nconnection: close\r\n\r\n",
        );
        assert!(!payload.has(HTTP_KEEP_ALIVE));
    }

    #[test]
    fn http10_defaults_to_close() {
        let handler = |_: &Request, out: &mut Output| -> crate::Result<()> {
            out.write("x");
            Ok(())
        };
        let (payload, body) = run_one(handler, b"GET / HTTP/1.0\r\n\r\n");
        assert!(!payload.has(HTTP_KEEP_ALIVE));
        assert!(String::from_utf8_lossy(&body).starts_with("HTTP/1.0 200 OK\r\n"));
    }

    #[test]
    fn file_delete_reply_carries_the_path() {
        let handler = |_: &Request, out: &mut Output| -> crate::Result<()> {
            out.serve_file_and_delete("/tmp/payload.bin");
            Ok(())
        };
        let (payload, body) = run_one(handler, b"GET /dl HTTP/1.1\r\n\r\n");
        assert!(payload.has(HTTP_RESPONSE_FILE_DELETE));
        assert!(String::from_utf8_lossy(&body).ends_with("\r\n\r\n/tmp/payload.bin"));
    }

    #[test]
    fn body_reaches_the_handler() {
        let handler = |req: &Request, out: &mut Output| -> crate::Result<()> {
            out.write(req.body());
            Ok(())
        };
        let (_, body) = run_one(
            handler,
            b"POST /echo HTTP/1.1\r\ncontent-length: 6\r\n\r\nechoes",
        );
        assert!(String::from_utf8_lossy(&body).ends_with("echoes"));
    }
}
