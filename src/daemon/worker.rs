//! Daemon-side handle for one worker child process.

use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::process::{Child, Command};
use std::time::Duration;

use tracing::{debug, trace, warn};

use super::arena::CommId;
use crate::ipc;
use crate::proto::frame::{WorkerPayload, PAYLOAD_HEADER_SIZE, WORKER_HELLO};

/// How long a freshly spawned child gets to connect and shake hands.
const SPAWN_WINDOW: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerStatus {
    Idling,
    Processing,
    Stopped,
}

pub(crate) struct WorkerProc {
    pub(crate) id: usize,
    pub(crate) status: WorkerStatus,
    pub(crate) status_changed_at: u64,
    pub(crate) spawned_at: u64,
    pub(crate) reload_requested: bool,
    pub(crate) dynamic: bool,
    /// Paired connection while PROCESSING.
    pub(crate) communicator: Option<CommId>,
    /// The paired connection died; the in-flight reply is drained and
    /// dropped instead of being forwarded.
    pub(crate) orphaned: bool,

    pub(crate) ipc: Option<UnixStream>,
    child: Option<Child>,
    /// Whether the IPC socket is currently registered with the poller.
    pub(crate) registered: bool,

    // In-flight reply framing.
    pub(crate) in_reply: bool,
    /// The reply for the current request has been fully received.
    pub(crate) reply_done: bool,
    pub(crate) reply_flags: u8,
    pub(crate) ipc_remaining: usize,
    reply_header: Vec<u8>,
    /// Accumulates file and websocket payloads, which are acted on whole.
    pub(crate) reply_sidecar: Vec<u8>,
}

impl WorkerProc {
    pub(crate) fn new(id: usize) -> WorkerProc {
        WorkerProc {
            id,
            status: WorkerStatus::Stopped,
            status_changed_at: 0,
            spawned_at: 0,
            reload_requested: false,
            dynamic: false,
            communicator: None,
            orphaned: false,
            ipc: None,
            child: None,
            registered: false,
            in_reply: false,
            reply_done: false,
            reply_flags: 0,
            ipc_remaining: 0,
            reply_header: Vec::new(),
            reply_sidecar: Vec::new(),
        }
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.status != WorkerStatus::Stopped
    }

    pub(crate) fn is_idling(&self) -> bool {
        self.status == WorkerStatus::Idling
    }

    /// Spawns a child worker into this slot: bind a fresh IPC channel, exec
    /// the current binary with the worker environment, accept its connect
    /// and read the one-byte handshake.
    pub(crate) fn spawn(&mut self, dynamic: bool, now: u64) -> crate::Result<()> {
        debug_assert_eq!(self.status, WorkerStatus::Stopped);

        let exe = std::env::current_exe().map_err(crate::Error::new_worker)?;
        let channel = ipc::bind_channel("w").map_err(crate::Error::new_worker)?;

        let child = Command::new(&exe)
            .env(ipc::ENV_SOCKET, &channel.address)
            .env(ipc::ENV_DAEMON, std::process::id().to_string())
            .env(ipc::ENV_BUILD, ipc::build_id())
            .env(ipc::ENV_DYNAMIC, if dynamic { "1" } else { "0" })
            .spawn()
            .map_err(crate::Error::new_worker)?;
        let pid = child.id();
        self.child = Some(child);

        match self.handshake(&channel) {
            Ok(stream) => {
                if let Some(path) = channel.path {
                    let _ = std::fs::remove_file(path);
                }
                debug!(worker = self.id, pid, dynamic, "worker ready");
                self.ipc = Some(stream);
                self.status = WorkerStatus::Idling;
                self.status_changed_at = now;
                self.spawned_at = now;
                self.dynamic = dynamic;
                self.reload_requested = false;
                self.orphaned = false;
                self.reset_reply();
                Ok(())
            }
            Err(err) => {
                warn!(worker = self.id, pid, error = %err, "worker failed to start");
                self.kill(now);
                if let Some(path) = channel.path {
                    let _ = std::fs::remove_file(path);
                }
                Err(crate::Error::new_worker(err))
            }
        }
    }

    fn handshake(&mut self, channel: &ipc::IpcChannel) -> io::Result<UnixStream> {
        let mut stream = ipc::accept_timeout(&channel.listener, SPAWN_WINDOW)?;
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(SPAWN_WINDOW))?;
        let mut hello = [0u8; 1];
        stream.read_exact(&mut hello)?;
        if hello[0] != WORKER_HELLO {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "bad worker handshake",
            ));
        }
        stream.set_read_timeout(None)?;
        stream.set_nonblocking(true)?;
        Ok(stream)
    }

    /// Sends a framed request down the IPC socket. The socket is flipped to
    /// blocking for the write so the whole payload lands in one piece.
    pub(crate) fn dispatch(&mut self, payload: &[u8], comm: CommId, now: u64) -> io::Result<()> {
        let ipc = self
            .ipc
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "worker has no ipc"))?;
        ipc.set_nonblocking(false)?;
        let res = ipc.write_all(payload).and_then(|_| ipc.flush());
        let _ = ipc.set_nonblocking(true);
        res?;

        trace!(worker = self.id, comm, len = payload.len(), "dispatched request");
        self.status = WorkerStatus::Processing;
        self.status_changed_at = now;
        self.communicator = Some(comm);
        self.orphaned = false;
        self.reply_done = false;
        Ok(())
    }

    /// Reads one chunk from the IPC socket. `Ok(0)` means the worker went
    /// away; `WouldBlock` surfaces as the error kind.
    pub(crate) fn read_chunk(&mut self, scratch: &mut [u8]) -> io::Result<usize> {
        let ipc = self
            .ipc
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "worker has no ipc"))?;
        loop {
            match ipc.read(scratch) {
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => return other,
            }
        }
    }

    /// Consumes reply bytes from `chunk`, advancing the framing state.
    /// Returns the number consumed and the payload header when it just
    /// completed.
    pub(crate) fn absorb_header(&mut self, chunk: &[u8]) -> (usize, Option<WorkerPayload>) {
        debug_assert!(!self.in_reply);
        let need = PAYLOAD_HEADER_SIZE - self.reply_header.len();
        let take = need.min(chunk.len());
        self.reply_header.extend_from_slice(&chunk[..take]);
        if self.reply_header.len() < PAYLOAD_HEADER_SIZE {
            return (take, None);
        }
        let payload = WorkerPayload::decode(&self.reply_header);
        self.reply_header.clear();
        self.in_reply = true;
        self.reply_flags = payload.flags;
        self.ipc_remaining = payload.content_length;
        trace!(
            worker = self.id,
            flags = payload.flags,
            content_length = payload.content_length,
            "reply started"
        );
        (take, Some(payload))
    }

    pub(crate) fn back_to_idle(&mut self, now: u64) {
        self.status = WorkerStatus::Idling;
        self.status_changed_at = now;
        self.communicator = None;
        self.orphaned = false;
    }

    pub(crate) fn reset_reply(&mut self) {
        self.in_reply = false;
        self.reply_done = false;
        self.reply_flags = 0;
        self.ipc_remaining = 0;
        self.reply_header.clear();
        self.reply_sidecar.clear();
    }

    /// Kills the child (if any) and returns the slot to STOPPED.
    pub(crate) fn kill(&mut self, now: u64) {
        if let Some(mut child) = self.child.take() {
            let pid = child.id();
            let _ = child.kill();
            let _ = child.wait();
            debug!(worker = self.id, pid, "worker killed");
        }
        self.stopped(now);
    }

    /// Notes an already-exited child (EOF on IPC or reaped by the sweep).
    pub(crate) fn stopped(&mut self, now: u64) {
        if let Some(mut child) = self.child.take() {
            let _ = child.wait();
        }
        self.ipc = None;
        self.status = WorkerStatus::Stopped;
        self.status_changed_at = now;
        self.communicator = None;
        self.orphaned = false;
        self.reload_requested = false;
        self.reset_reply();
    }

    /// True when the child process has exited on its own.
    pub(crate) fn child_exited(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(Some(_))),
            None => false,
        }
    }
}
