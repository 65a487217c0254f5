//! Per-connection state machine.
//!
//! A `Communicator` owns one accepted client socket, parses its byte stream
//! into a queue of [`ProtoRequest`]s, and owns the outbound path: the send
//! buffer, the optional file being streamed, and the response accounting
//! that decides when a reply is done.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::path::{Path, PathBuf};

use http::Version;
use tracing::{debug, trace};

use super::arena::{CommId, NIL};
use crate::buffer::{ByteBuffer, CHUNK_SIZE};
use crate::config::Config;
use crate::poll::Interest;
use crate::proto::parse::{Assembler, Step};
use crate::proto::Refusal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CommState {
    /// Pooled; no socket attached.
    Ready,
    ReadingHeaders,
    ReadingBody,
    /// A worker is assigned and a response is flowing.
    Paired,
    /// Between requests on a persistent connection.
    KeepAlive,
    /// Socket handed off to a websocket child.
    Websocket,
}

/// What one read-ready event did to the connection.
#[derive(Debug, Default)]
pub(crate) struct ReadOutcome {
    pub(crate) got_bytes: bool,
    /// Peer closed or the socket failed; the connection must be reset.
    pub(crate) closed: bool,
}

/// What the parse step produced.
#[derive(Debug, Default)]
pub(crate) struct ParseActions {
    pub(crate) ready: usize,
    pub(crate) refusal: Option<Refusal>,
    /// Writing `100 continue` failed; the connection must be reset.
    pub(crate) io_failed: bool,
}

pub(crate) struct Communicator {
    pub(crate) id: CommId,
    pub(crate) state: CommState,
    pub(crate) socket: Option<TcpStream>,
    pub(crate) peer: Option<SocketAddr>,
    assembler: Option<Assembler>,
    pub(crate) queue: VecDeque<crate::proto::ProtoRequest>,
    /// Index of the paired worker slot.
    pub(crate) worker: Option<usize>,

    send_buffer: ByteBuffer,
    buffer_sent: usize,
    pub(crate) response_active: bool,
    pub(crate) response_length: usize,
    pub(crate) response_sent: usize,
    pub(crate) is_send_file: bool,
    file: Option<File>,
    pub(crate) file_to_delete: Option<PathBuf>,
    pub(crate) is_keep_alive: bool,

    pub(crate) last_recv: u64,
    pub(crate) last_request: u64,
    pub(crate) request_data_received: bool,

    // Intrusive links, managed by the arena.
    pub(in crate::daemon) alive: bool,
    pub(in crate::daemon) alive_prev: CommId,
    pub(in crate::daemon) alive_next: CommId,
    pub(in crate::daemon) in_wait: bool,
    pub(in crate::daemon) wait_prev: CommId,
    pub(in crate::daemon) wait_next: CommId,

    /// Interest currently registered with the poller, if any.
    pub(in crate::daemon) registered: Option<Interest>,
}

impl Communicator {
    pub(crate) fn new(id: CommId) -> Communicator {
        Communicator {
            id,
            state: CommState::Ready,
            socket: None,
            peer: None,
            assembler: None,
            queue: VecDeque::new(),
            worker: None,
            send_buffer: ByteBuffer::new(),
            buffer_sent: 0,
            response_active: false,
            response_length: 0,
            response_sent: 0,
            is_send_file: false,
            file: None,
            file_to_delete: None,
            is_keep_alive: false,
            last_recv: 0,
            last_request: 0,
            request_data_received: false,
            alive: false,
            alive_prev: NIL,
            alive_next: NIL,
            in_wait: false,
            wait_prev: NIL,
            wait_next: NIL,
            registered: None,
        }
    }

    /// Binds an accepted socket to this slot.
    pub(crate) fn attach(
        &mut self,
        socket: TcpStream,
        peer: SocketAddr,
        config: &Config,
        now: u64,
    ) {
        debug_assert_eq!(self.state, CommState::Ready);
        let remote_ip = config.with_remote_ip.then(|| peer.ip().to_string());
        self.assembler = Some(Assembler::new(config.max_request_size, remote_ip));
        self.socket = Some(socket);
        self.peer = Some(peer);
        self.state = CommState::ReadingHeaders;
        self.last_recv = now;
        self.last_request = now;
        self.request_data_received = false;
    }

    /// Returns the slot to its pooled state, dropping the socket (which
    /// closes it) and any queued requests. A file queued for deletion is
    /// deleted even when the stream did not finish.
    pub(crate) fn clear(&mut self) {
        if let Some(path) = self.file_to_delete.take() {
            let _ = std::fs::remove_file(&path);
        }
        self.state = CommState::Ready;
        self.socket = None;
        self.peer = None;
        self.assembler = None;
        self.queue.clear();
        self.worker = None;
        self.send_buffer.clear();
        self.buffer_sent = 0;
        self.response_active = false;
        self.response_length = 0;
        self.response_sent = 0;
        self.is_send_file = false;
        self.file = None;
        self.is_keep_alive = false;
        self.request_data_received = false;
        self.registered = None;
    }

    pub(crate) fn has_buffer(&self) -> bool {
        self.buffer_sent < self.send_buffer.len() || self.file.is_some()
    }

    pub(crate) fn desired_interest(&self) -> Interest {
        if self.has_buffer() {
            Interest::READ | Interest::WRITE
        } else {
            Interest::READ
        }
    }

    pub(crate) fn response_complete(&self) -> bool {
        self.response_active && !self.has_buffer() && self.response_sent >= self.response_length
    }

    /// One read-ready event: a single scratch-buffer read, EINTR retried,
    /// with the bytes pushed into the assembler.
    pub(crate) fn read_some(&mut self) -> ReadOutcome {
        let mut outcome = ReadOutcome::default();
        let sock = match self.socket.as_mut() {
            Some(s) => s,
            None => return outcome,
        };
        let mut scratch = [0u8; CHUNK_SIZE];
        loop {
            match sock.read(&mut scratch) {
                Ok(0) => {
                    trace!(id = self.id, "peer closed");
                    outcome.closed = true;
                    return outcome;
                }
                Ok(n) => {
                    trace!(id = self.id, n, "read from client");
                    if let Some(asm) = self.assembler.as_mut() {
                        asm.push(&scratch[..n]);
                    }
                    outcome.got_bytes = true;
                    return outcome;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return outcome,
                Err(e) => {
                    debug!(id = self.id, error = %e, "client socket error");
                    outcome.closed = true;
                    return outcome;
                }
            }
        }
    }

    /// Drains the assembler: queues completed requests, answers
    /// `Expect: 100-continue`, reports refusals.
    pub(crate) fn advance_parse(&mut self, now: u64) -> ParseActions {
        let mut actions = ParseActions::default();
        let mut asm = match self.assembler.take() {
            Some(asm) => asm,
            None => return actions,
        };
        loop {
            match asm.step() {
                Step::More => break,
                Step::Continue100(version) => {
                    let line: &[u8] = if version == Version::HTTP_10 {
                        b"HTTP/1.0 100 continue\r\n\r\n"
                    } else {
                        b"HTTP/1.1 100 continue\r\n\r\n"
                    };
                    if self.send_now(line).is_err() {
                        actions.io_failed = true;
                        break;
                    }
                }
                Step::Request(req) => {
                    debug!(id = self.id, uri = req.uri(), method = %req.method, "request complete");
                    self.queue.push_back(req);
                    self.last_request = now;
                    actions.ready += 1;
                }
                Step::Refused(refusal) => {
                    actions.refusal = Some(refusal);
                    break;
                }
            }
        }
        let reading_body = asm.reading_body();
        self.assembler = Some(asm);

        // KEEP_ALIVE flips to ReadingHeaders only when bytes actually
        // arrive; see the read path.
        if self.worker.is_none()
            && matches!(
                self.state,
                CommState::ReadingHeaders | CommState::ReadingBody
            )
        {
            self.state = if reading_body {
                CommState::ReadingBody
            } else {
                CommState::ReadingHeaders
            };
        }
        actions
    }

    /// Small out-of-band writes (`100 continue`, refusal status lines, the
    /// websocket 101 head) go out with a short blocking write so they never
    /// interleave with response accounting.
    pub(crate) fn send_now(&mut self, bytes: &[u8]) -> io::Result<()> {
        let sock = match self.socket.as_mut() {
            Some(s) => s,
            None => return Ok(()),
        };
        sock.set_nonblocking(false)?;
        let res = sock.write_all(bytes);
        let _ = sock.set_nonblocking(true);
        res
    }

    /// Starts an inline response of `content_length` bytes.
    pub(crate) fn start_inline(&mut self, content_length: usize) {
        self.response_active = true;
        self.response_length = content_length;
        self.response_sent = 0;
    }

    /// Starts a file-backed response: `headers` now, file contents streamed
    /// behind it, optional unlink when fully sent.
    pub(crate) fn start_file(
        &mut self,
        headers: &[u8],
        path: &Path,
        delete_after: bool,
    ) -> io::Result<()> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len() as usize;
        self.response_active = true;
        self.response_length = headers.len() + file_len;
        self.response_sent = 0;
        self.is_send_file = true;
        self.file = Some(file);
        self.file_to_delete = delete_after.then(|| path.to_path_buf());
        self.send_buffer.append(headers);
        Ok(())
    }

    /// Appends response bytes received from the worker.
    pub(crate) fn append_response(&mut self, bytes: &[u8]) {
        self.send_buffer.append(bytes);
    }

    /// One write-ready event: flush up to one buffer worth; when streaming a
    /// file and the buffer drains, refill one chunk from it.
    pub(crate) fn on_writable(&mut self) -> io::Result<()> {
        self.flush_some()?;
        if self.buffer_sent == self.send_buffer.len() {
            self.send_buffer.clear();
            self.buffer_sent = 0;
            if let Some(file) = self.file.as_mut() {
                match self.send_buffer.fill_from(file)? {
                    0 => {
                        self.file = None;
                        self.is_send_file = false;
                        if let Some(path) = self.file_to_delete.take() {
                            debug!(id = self.id, path = %path.display(), "removing served file");
                            let _ = std::fs::remove_file(&path);
                        }
                        // If the file shrank underneath us, close the ledger
                        // at what was actually streamed.
                        if self.response_sent < self.response_length {
                            self.response_length = self.response_sent;
                        }
                    }
                    _ => {
                        self.flush_some()?;
                        if self.buffer_sent == self.send_buffer.len() {
                            self.send_buffer.clear();
                            self.buffer_sent = 0;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn flush_some(&mut self) -> io::Result<()> {
        let sock = match self.socket.as_mut() {
            Some(s) => s,
            None => return Ok(()),
        };
        while self.buffer_sent < self.send_buffer.len() {
            let window = &self.send_buffer.as_slice()[self.buffer_sent..];
            let take = window.len().min(CHUNK_SIZE);
            match sock.write(&window[..take]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    trace!(id = self.id, n, "flushed to client");
                    self.buffer_sent += n;
                    self.response_sent += n;
                    if n < take {
                        return Ok(());
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Closes the response ledger after a completed reply, getting the slot
    /// ready for the next pipelined request.
    pub(crate) fn finish_response(&mut self, now: u64) {
        debug_assert!(self.response_complete());
        self.response_active = false;
        self.response_length = 0;
        self.response_sent = 0;
        self.is_send_file = false;
        self.last_request = now;
        self.request_data_received = false;
        self.state = CommState::KeepAlive;
    }

    /// Half-closes the write side; the reset that follows drops the socket.
    pub(crate) fn shutdown_write(&mut self) {
        if let Some(sock) = self.socket.as_ref() {
            let _ = sock.shutdown(Shutdown::Write);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::net::TcpListener;

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let a = TcpStream::connect(addr).unwrap();
        let (b, _) = listener.accept().unwrap();
        (a, b)
    }

    fn attached(config: &Config) -> (Communicator, TcpStream) {
        let (client, server) = pair();
        server.set_nonblocking(true).unwrap();
        let peer = server.peer_addr().unwrap();
        let mut comm = Communicator::new(0);
        comm.attach(server, peer, config, 1);
        (comm, client)
    }

    #[test]
    fn reads_and_queues_a_request() {
        let config = Config::new();
        let (mut comm, mut client) = attached(&config);

        client
            .write_all(b"GET /ping HTTP/1.1\r\nHost: h\r\n\r\n")
            .unwrap();
        // Wait for delivery; the socket is nonblocking.
        std::thread::sleep(std::time::Duration::from_millis(50));

        let outcome = comm.read_some();
        assert!(outcome.got_bytes);
        assert!(!outcome.closed);

        let actions = comm.advance_parse(2);
        assert_eq!(actions.ready, 1);
        assert!(actions.refusal.is_none());
        assert_eq!(comm.queue.len(), 1);
        assert_eq!(comm.queue[0].uri(), "/ping");
        assert_eq!(comm.state, CommState::ReadingHeaders);
    }

    #[test]
    fn inline_response_flushes_and_completes() {
        let config = Config::new();
        let (mut comm, mut client) = attached(&config);

        let body = b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nOK";
        comm.start_inline(body.len());
        comm.append_response(body);
        assert!(comm.has_buffer());
        assert!(comm.desired_interest().writable());

        comm.on_writable().unwrap();
        assert!(comm.response_complete());
        assert!(!comm.desired_interest().writable());

        let mut got = vec![0u8; body.len()];
        use std::io::Read as _;
        client.read_exact(&mut got).unwrap();
        assert_eq!(got, body);
    }

    #[test]
    fn file_response_streams_and_deletes() {
        let config = Config::new();
        let (mut comm, mut client) = attached(&config);

        let path = std::env::temp_dir().join(format!("serverino-test-{}.bin", std::process::id()));
        std::fs::write(&path, b"hello").unwrap();

        let headers = b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\n\r\n";
        comm.start_file(headers, &path, true).unwrap();
        assert_eq!(comm.response_length, headers.len() + 5);

        while !comm.response_complete() {
            comm.on_writable().unwrap();
        }

        let mut got = vec![0u8; headers.len() + 5];
        use std::io::Read as _;
        client.read_exact(&mut got).unwrap();
        assert!(got.ends_with(b"hello"));
        assert!(!path.exists(), "file should be gone after streaming");
    }

    #[test]
    fn clear_removes_pending_delete() {
        let config = Config::new();
        let (mut comm, _client) = attached(&config);

        let path = std::env::temp_dir().join(format!("serverino-clear-{}.bin", std::process::id()));
        std::fs::write(&path, b"tmp").unwrap();
        comm.start_file(b"HTTP/1.1 200 OK\r\n\r\n", &path, true).unwrap();

        comm.clear();
        assert_eq!(comm.state, CommState::Ready);
        assert!(!path.exists());
        assert!(!comm.has_buffer());
    }

    #[test]
    fn peer_close_reports_reset() {
        let config = Config::new();
        let (mut comm, client) = attached(&config);
        drop(client);
        std::thread::sleep(std::time::Duration::from_millis(50));

        let outcome = comm.read_some();
        assert!(outcome.closed);
    }
}
