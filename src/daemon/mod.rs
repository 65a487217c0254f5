//! The daemon process.
//!
//! One thread, one event loop. Every iteration: housekeeping (canary,
//! worker pool, timeouts), registration sync, a bounded poll, event
//! processing, then pairing of waiting connections with idle workers.

use std::io;
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::process::{Child, Command};
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::buffer::CHUNK_SIZE;
use crate::clock::coarse_now;
use crate::config::Config;
use crate::ipc;
use crate::poll::{Event, Interest, Poller, Token};
use crate::proto::frame::{
    WorkerPayload, DAEMON_SHUTDOWN, DAEMON_SUSPEND, HANDOFF_ACK, HTTP_KEEP_ALIVE,
    HTTP_RESPONSE_FILE, HTTP_RESPONSE_FILE_DELETE, WEBSOCKET_UPGRADE,
};
use crate::proto::{ConnectionHeader, Refusal};

pub(crate) mod arena;
pub(crate) mod communicator;
pub(crate) mod handoff;
pub(crate) mod listener;
pub(crate) mod worker;

use self::arena::{CommArena, CommId};
use self::communicator::CommState;
use self::worker::{WorkerProc, WorkerStatus};

/// Idle keep-alive connections are dropped after this many seconds.
const KEEP_ALIVE_TIMEOUT: u64 = 5;

/// How long a websocket child gets to connect back and take the socket.
const HANDOFF_WINDOW: Duration = Duration::from_secs(5);

const KIND_LISTENER: u64 = 0;
const KIND_WORKER: u64 = 1;
const KIND_COMM: u64 = 2;

fn token(kind: u64, idx: usize) -> Token {
    (kind << 32) | idx as u64
}

mod signals {
    use std::sync::atomic::{AtomicU32, Ordering};

    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

    static TERM_COUNT: AtomicU32 = AtomicU32::new(0);

    extern "C" fn on_terminate(_sig: libc::c_int) {
        // First signal asks for an ordered exit; a second one means now.
        if TERM_COUNT.fetch_add(1, Ordering::SeqCst) >= 1 {
            unsafe { libc::_exit(-1) };
        }
    }

    pub(super) fn install() {
        let action = SigAction::new(
            SigHandler::Handler(on_terminate),
            SaFlags::empty(),
            SigSet::empty(),
        );
        unsafe {
            let _ = sigaction(Signal::SIGINT, &action);
            let _ = sigaction(Signal::SIGTERM, &action);
            // Writes to reset sockets must surface as EPIPE, not kill us.
            let _ = nix::sys::signal::signal(Signal::SIGPIPE, SigHandler::SigIgn);
        }
    }

    pub(super) fn exit_requested() -> bool {
        TERM_COUNT.load(Ordering::SeqCst) > 0
    }
}

fn canary_path() -> PathBuf {
    std::env::temp_dir().join(format!(
        "serverino-{}-{}.canary",
        std::process::id(),
        ipc::build_id()
    ))
}

/// Runs the daemon until an ordered shutdown. `ws_enabled` says whether the
/// entry point can serve websocket children, so upgrades from handlers can
/// be refused early when it can't.
pub(crate) fn run(mut config: Config, ws_enabled: bool) -> crate::Result<()> {
    config.sanitize();
    signals::install();

    let poller = Poller::new().map_err(crate::Error::new_io)?;
    let mut listeners = Vec::with_capacity(config.listeners.len());
    for addr in &config.listeners {
        listeners.push(listener::bind(addr, config.listener_backlog)?);
    }

    let canary = canary_path();
    if let Err(err) = std::fs::write(&canary, format!("{}\n", std::process::id())) {
        warn!(path = %canary.display(), error = %err, "could not write canary");
    }

    let workers = (0..config.max_workers).map(WorkerProc::new).collect();
    let mut daemon = Daemon {
        config,
        ws_enabled,
        poller,
        listeners,
        listeners_registered: false,
        comms: CommArena::new(),
        workers,
        ws_children: Vec::new(),
        canary,
        suspended: false,
        exit_requested: false,
        reload_requested: false,
        last_sweep: coarse_now(),
    };

    daemon.check_workers(coarse_now());
    let result = daemon.event_loop();
    daemon.shutdown();
    result
}

struct Daemon {
    config: Config,
    ws_enabled: bool,
    poller: Poller,
    listeners: Vec<listener::Listener>,
    listeners_registered: bool,
    comms: CommArena,
    workers: Vec<WorkerProc>,
    /// Detached websocket children, kept only for zombie reaping.
    ws_children: Vec<Child>,
    canary: PathBuf,
    suspended: bool,
    exit_requested: bool,
    reload_requested: bool,
    last_sweep: u64,
}

impl Daemon {
    fn event_loop(&mut self) -> crate::Result<()> {
        let mut events: Vec<Event> = Vec::new();
        loop {
            if signals::exit_requested() {
                self.exit_requested = true;
            }
            if self.exit_requested {
                return Ok(());
            }

            let now = coarse_now();
            if now != self.last_sweep {
                self.last_sweep = now;
                self.check_canary();
                self.check_workers(now);
                self.check_timeouts(now);
            }

            if let Err(err) = self.sync_registrations() {
                return Err(crate::Error::new_io(err));
            }

            self.poller
                .poll(&mut events, Some(Duration::from_secs(1)))
                .map_err(crate::Error::new_io)?;

            let now = coarse_now();
            for ev in &events {
                let kind = ev.token >> 32;
                let idx = (ev.token & 0xffff_ffff) as usize;
                match kind {
                    KIND_LISTENER => self.accept_one(idx, now),
                    KIND_WORKER => self.worker_readable(idx, now),
                    KIND_COMM => {
                        let id = idx as CommId;
                        if ev.ready.is_readable() {
                            self.comm_readable(id, now);
                        }
                        if ev.ready.is_writable() {
                            self.comm_writable(id, now);
                        }
                    }
                    _ => {}
                }
            }

            self.pair_waiting(now);
        }
    }

    /// Brings the poller's view in line with reality: listeners (absent
    /// while suspended), worker IPC sockets, and client sockets whose
    /// interest follows whether they have something to write.
    fn sync_registrations(&mut self) -> io::Result<()> {
        let want_listeners = !self.suspended;
        if want_listeners != self.listeners_registered {
            for (idx, l) in self.listeners.iter().enumerate() {
                let fd = l.inner.as_raw_fd();
                if want_listeners {
                    self.poller
                        .register(fd, Interest::READ, token(KIND_LISTENER, idx))?;
                } else {
                    let _ = self.poller.unregister(fd);
                }
            }
            self.listeners_registered = want_listeners;
        }

        for wp in &mut self.workers {
            match (&wp.ipc, wp.registered) {
                (Some(ipc), false) => {
                    self.poller
                        .register(ipc.as_raw_fd(), Interest::READ, token(KIND_WORKER, wp.id))?;
                    wp.registered = true;
                }
                (None, true) => {
                    // The fd is gone with the socket; nothing to unregister.
                    wp.registered = false;
                }
                _ => {}
            }
        }

        for id in self.comms.alive_ids() {
            let (fd, desired, registered) = {
                let comm = self.comms.get(id);
                let fd = match comm.socket.as_ref() {
                    Some(s) => s.as_raw_fd(),
                    None => continue,
                };
                (fd, comm.desired_interest(), comm.registered)
            };
            match registered {
                None => {
                    self.poller.register(fd, desired, token(KIND_COMM, id as usize))?;
                    self.comms.slot_mut(id).registered = Some(desired);
                }
                Some(current) if current != desired => {
                    self.poller.modify(fd, desired, token(KIND_COMM, id as usize))?;
                    self.comms.slot_mut(id).registered = Some(desired);
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn accept_one(&mut self, lidx: usize, now: u64) {
        let (stream, peer) = match self.listeners[lidx].inner.accept() {
            Ok(accepted) => accepted,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                debug!(error = %e, "accept failed");
                return;
            }
        };
        if let Err(e) = stream.set_nonblocking(true) {
            debug!(error = %e, "could not make client socket non-blocking");
            return;
        }
        let _ = stream.set_nodelay(true);

        let id = self.comms.acquire();
        let comm = self.comms.slot_mut(id);
        comm.attach(stream, peer, &self.config, now);
        debug!(id, %peer, "accepted connection");
    }

    fn comm_readable(&mut self, id: CommId, now: u64) {
        {
            let comm = self.comms.get(id);
            if !comm.alive || comm.socket.is_none() {
                return;
            }
        }

        let comm = self.comms.slot_mut(id);
        let outcome = comm.read_some();
        if outcome.got_bytes {
            comm.last_recv = now;
            comm.request_data_received = true;
            if comm.state == CommState::KeepAlive {
                comm.state = CommState::ReadingHeaders;
            }
        }

        let actions = comm.advance_parse(now);
        if let Some(refusal) = actions.refusal {
            self.refuse(id, refusal);
            return;
        }
        if actions.io_failed || outcome.closed {
            self.reset_comm(id);
            return;
        }
        if actions.ready > 0 {
            let comm = self.comms.get(id);
            if comm.worker.is_none() && comm.queue.front().map(|r| r.valid).unwrap_or(false) {
                self.comms.wait_push_back(id);
            }
        }
    }

    fn comm_writable(&mut self, id: CommId, now: u64) {
        {
            let comm = self.comms.get(id);
            if !comm.alive || comm.socket.is_none() {
                return;
            }
        }
        if let Err(err) = self.comms.slot_mut(id).on_writable() {
            debug!(id, error = %err, "write failed");
            self.reset_comm(id);
            return;
        }
        self.try_complete(id, now);
    }

    /// Checks the response ledger; on completion detaches the worker,
    /// re-queues pipelined requests, and closes non-keep-alive connections.
    fn try_complete(&mut self, id: CommId, now: u64) {
        {
            let comm = self.comms.get(id);
            if !comm.alive || !comm.response_complete() {
                return;
            }
        }
        let (keep, widx, more) = {
            let comm = self.comms.slot_mut(id);
            let widx = comm.worker.take();
            let keep = comm.is_keep_alive;
            comm.finish_response(now);
            let more = comm.queue.front().map(|r| r.valid).unwrap_or(false);
            (keep, widx, more)
        };
        trace!(id, keep, "response complete");

        if let Some(widx) = widx {
            if self.workers[widx].communicator == Some(id) {
                self.finish_worker(widx, now);
            }
        }

        if !keep {
            self.comms.slot_mut(id).shutdown_write();
            self.reset_comm(id);
            return;
        }
        if more {
            self.comms.wait_push_back(id);
        }
    }

    /// Returns a PROCESSING worker to IDLING, or kills it if a reload was
    /// pending on it.
    fn finish_worker(&mut self, widx: usize, now: u64) {
        let busy_for = now.saturating_sub(self.workers[widx].status_changed_at);
        if self.workers[widx].reload_requested {
            debug!(worker = widx, busy_for, "deferred reload; recycling worker");
            self.retire_worker_fd(widx);
            self.workers[widx].kill(now);
        } else {
            trace!(worker = widx, busy_for, "worker back to idle");
            self.workers[widx].back_to_idle(now);
        }
    }

    fn retire_worker_fd(&mut self, widx: usize) {
        let wp = &mut self.workers[widx];
        if wp.registered {
            if let Some(ipc) = wp.ipc.as_ref() {
                let _ = self.poller.unregister(ipc.as_raw_fd());
            }
            wp.registered = false;
        }
    }

    fn refuse(&mut self, id: CommId, refusal: Refusal) {
        debug!(id, ?refusal, "refusing request");
        let _ = self.comms.slot_mut(id).send_now(refusal.status_line());
        self.reset_comm(id);
    }

    /// Drops a connection: detaches its worker unharmed, unregisters and
    /// closes the socket, discards queued requests, pools the slot.
    fn reset_comm(&mut self, id: CommId) {
        if !self.comms.get(id).alive {
            return;
        }
        let now = coarse_now();

        if let Some(widx) = self.comms.slot_mut(id).worker.take() {
            let wp = &mut self.workers[widx];
            if wp.communicator == Some(id) {
                wp.communicator = None;
                if wp.status == WorkerStatus::Processing {
                    if wp.reply_done {
                        self.finish_worker(widx, now);
                    } else {
                        // The reply is still coming; drain it into the void.
                        wp.orphaned = true;
                    }
                }
            }
        }

        {
            let comm = self.comms.slot_mut(id);
            if comm.registered.is_some() {
                if let Some(sock) = comm.socket.as_ref() {
                    let _ = self.poller.unregister(sock.as_raw_fd());
                }
            }
        }
        self.comms.release(id);
        trace!(id, "connection reset");
    }

    fn worker_readable(&mut self, widx: usize, now: u64) {
        if self.workers[widx].ipc.is_none() {
            return;
        }
        let mut scratch = [0u8; CHUNK_SIZE];
        loop {
            let n = match self.workers[widx].read_chunk(&mut scratch) {
                Ok(0) => {
                    self.worker_died(widx, now);
                    return;
                }
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    debug!(worker = widx, error = %e, "ipc read failed");
                    self.worker_died(widx, now);
                    return;
                }
            };

            let mut offset = 0;
            while offset < n {
                if !self.workers[widx].in_reply {
                    let (consumed, payload) =
                        self.workers[widx].absorb_header(&scratch[offset..n]);
                    offset += consumed;
                    if let Some(payload) = payload {
                        self.begin_reply(widx, payload);
                    }
                } else {
                    let take = self.workers[widx].ipc_remaining.min(n - offset);
                    self.route_reply_bytes(widx, &scratch[offset..offset + take]);
                    offset += take;
                }
                if self.workers[widx].in_reply && self.workers[widx].ipc_remaining == 0 {
                    self.workers[widx].in_reply = false;
                    self.workers[widx].reply_done = true;
                    self.reply_finished(widx, now);
                }
            }
        }

        // New bytes may have landed in a client buffer; push them out now
        // rather than waiting for the next write-ready event.
        if let Some(cid) = self.workers[widx].communicator {
            self.comm_writable(cid, now);
        }
    }

    fn begin_reply(&mut self, widx: usize, payload: WorkerPayload) {
        if payload.has(DAEMON_SHUTDOWN) {
            info!(worker = widx, "worker requested daemon shutdown");
            self.exit_requested = true;
        }
        if payload.has(DAEMON_SUSPEND) {
            self.suspended = !self.suspended;
            info!(suspended = self.suspended, "worker toggled accepting");
        }

        let sidecar = payload.flags
            & (HTTP_RESPONSE_FILE | HTTP_RESPONSE_FILE_DELETE | WEBSOCKET_UPGRADE)
            != 0;
        if sidecar {
            self.workers[widx].reply_sidecar.clear();
            return;
        }

        let wp = &self.workers[widx];
        if wp.orphaned {
            return;
        }
        if let Some(cid) = wp.communicator {
            let keep_flag = payload.has(HTTP_KEEP_ALIVE);
            let comm = self.comms.slot_mut(cid);
            comm.is_keep_alive = comm.is_keep_alive && keep_flag;
            comm.start_inline(payload.content_length);
        }
    }

    fn route_reply_bytes(&mut self, widx: usize, bytes: &[u8]) {
        let wp = &mut self.workers[widx];
        wp.ipc_remaining -= bytes.len();

        let sidecar = wp.reply_flags
            & (HTTP_RESPONSE_FILE | HTTP_RESPONSE_FILE_DELETE | WEBSOCKET_UPGRADE)
            != 0;
        if sidecar {
            wp.reply_sidecar.extend_from_slice(bytes);
            return;
        }
        if wp.orphaned {
            return;
        }
        if let Some(cid) = wp.communicator {
            self.comms.slot_mut(cid).append_response(bytes);
        }
    }

    fn reply_finished(&mut self, widx: usize, now: u64) {
        let flags = self.workers[widx].reply_flags;
        let orphaned = self.workers[widx].orphaned;
        let cid = self.workers[widx].communicator;

        if flags & (HTTP_RESPONSE_FILE | HTTP_RESPONSE_FILE_DELETE) != 0 {
            let sidecar = std::mem::take(&mut self.workers[widx].reply_sidecar);
            let delete = flags & HTTP_RESPONSE_FILE_DELETE != 0;
            match split_file_payload(&sidecar) {
                Some((headers, path)) => {
                    if orphaned || cid.is_none() {
                        if delete {
                            let _ = std::fs::remove_file(&path);
                        }
                    } else {
                        let cid = cid.expect("checked");
                        let keep_flag = flags & HTTP_KEEP_ALIVE != 0;
                        let comm = self.comms.slot_mut(cid);
                        comm.is_keep_alive = comm.is_keep_alive && keep_flag;
                        if let Err(err) = comm.start_file(headers, &path, delete) {
                            warn!(worker = widx, path = %path.display(), error = %err,
                                "could not open file for response");
                            self.reset_comm(cid);
                        }
                    }
                }
                None => {
                    warn!(worker = widx, "malformed file payload from worker");
                    if let Some(cid) = cid {
                        self.reset_comm(cid);
                    }
                }
            }
        } else if flags & WEBSOCKET_UPGRADE != 0 {
            let head = std::mem::take(&mut self.workers[widx].reply_sidecar);
            if let Some(cid) = cid.filter(|_| !orphaned) {
                self.websocket_handoff(cid, &head);
            }
            // The worker's part is over whether or not the handoff worked.
            if self.workers[widx].status == WorkerStatus::Processing {
                self.workers[widx].communicator = None;
                self.finish_worker(widx, now);
            }
            return;
        }

        if orphaned {
            // Reply drained with nobody to give it to.
            self.finish_worker(widx, now);
        }
    }

    fn websocket_handoff(&mut self, cid: CommId, head: &[u8]) {
        if !self.ws_enabled {
            warn!(id = cid, "handler upgraded but no websocket handler is installed");
            self.reset_comm(cid);
            return;
        }
        {
            let comm = self.comms.slot_mut(cid);
            if comm.send_now(head).is_err() {
                self.reset_comm(cid);
                return;
            }
            comm.state = CommState::Websocket;
        }
        if let Err(err) = self.spawn_websocket_child(cid) {
            warn!(id = cid, error = %err, "websocket handoff failed");
            self.reset_comm(cid);
        }
    }

    fn spawn_websocket_child(&mut self, cid: CommId) -> crate::Result<()> {
        let exe = std::env::current_exe().map_err(crate::Error::new_handoff)?;
        let channel = ipc::bind_channel("ws").map_err(crate::Error::new_handoff)?;

        let mut child = Command::new(&exe)
            .env(ipc::ENV_WEBSOCKET, &channel.address)
            .env(ipc::ENV_DAEMON, std::process::id().to_string())
            .env(ipc::ENV_BUILD, ipc::build_id())
            .spawn()
            .map_err(crate::Error::new_handoff)?;

        let outcome = (|| -> io::Result<()> {
            let stream = ipc::accept_timeout(&channel.listener, HANDOFF_WINDOW)?;
            stream.set_nonblocking(false)?;
            stream.set_read_timeout(Some(HANDOFF_WINDOW))?;

            let comm = self.comms.slot_mut(cid);
            let fd = comm
                .socket
                .as_ref()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no client socket"))?
                .as_raw_fd();
            handoff::send_fd(&stream, fd)?;

            let mut ack = [0u8; 1];
            use std::io::Read as _;
            (&stream).read_exact(&mut ack)?;
            if ack[0] != HANDOFF_ACK {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "bad handoff ack"));
            }
            Ok(())
        })();

        if let Some(path) = channel.path {
            let _ = std::fs::remove_file(path);
        }

        match outcome {
            Ok(()) => {
                info!(id = cid, pid = child.id(), "connection handed to websocket child");
                self.ws_children.push(child);
                // The child acked; closing our copy of the socket leaves
                // the duplicated descriptor as the only owner.
                {
                    let comm = self.comms.slot_mut(cid);
                    if comm.registered.is_some() {
                        if let Some(sock) = comm.socket.as_ref() {
                            let _ = self.poller.unregister(sock.as_raw_fd());
                        }
                    }
                }
                self.comms.release(cid);
                Ok(())
            }
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait();
                Err(crate::Error::new_handoff(err))
            }
        }
    }

    fn worker_died(&mut self, widx: usize, now: u64) {
        debug!(worker = widx, "worker gone");
        let cid = self.workers[widx].communicator;
        self.retire_worker_fd(widx);
        self.workers[widx].stopped(now);
        if let Some(cid) = cid {
            if self.comms.get(cid).alive {
                self.comms.slot_mut(cid).shutdown_write();
                self.reset_comm(cid);
            }
        }
    }

    /// Drains the exec-waiting FIFO, pairing each connection with an idle
    /// worker, spawning dynamic workers up to the cap when none is idle.
    fn pair_waiting(&mut self, now: u64) {
        loop {
            let cid = match self.comms.wait_front() {
                Some(cid) => cid,
                None => return,
            };
            {
                let comm = self.comms.get(cid);
                let front_valid = comm.queue.front().map(|r| r.valid).unwrap_or(false);
                if comm.worker.is_some() || !front_valid {
                    // Stale membership; drop it from the list.
                    self.comms.wait_pop_front();
                    continue;
                }
            }

            let widx = match self.find_idle_worker() {
                Some(widx) => widx,
                None => match self.spawn_dynamic(now) {
                    Some(widx) => widx,
                    None => return,
                },
            };

            self.comms.wait_pop_front();
            self.dispatch_to(cid, widx, now);
        }
    }

    fn find_idle_worker(&self) -> Option<usize> {
        self.workers.iter().position(|w| w.is_idling())
    }

    fn spawn_dynamic(&mut self, now: u64) -> Option<usize> {
        let alive = self.workers.iter().filter(|w| w.is_alive()).count();
        if alive >= self.config.max_workers {
            return None;
        }
        let widx = self
            .workers
            .iter()
            .position(|w| w.status == WorkerStatus::Stopped)?;
        match self.workers[widx].spawn(true, now) {
            Ok(()) => {
                debug!(worker = widx, "dynamic worker spawned");
                Some(widx)
            }
            Err(err) => {
                warn!(worker = widx, error = %err, "dynamic spawn failed");
                None
            }
        }
    }

    fn dispatch_to(&mut self, cid: CommId, widx: usize, now: u64) {
        let mut req = match self.comms.slot_mut(cid).queue.pop_front() {
            Some(req) => req,
            None => return,
        };
        req.fill_prefix();
        let keep =
            self.config.keep_alive && req.effective_connection() != ConnectionHeader::Close;

        match self.workers[widx].dispatch(&req.data, cid, now) {
            Ok(()) => {
                let comm = self.comms.slot_mut(cid);
                comm.worker = Some(widx);
                comm.is_keep_alive = keep;
                comm.state = CommState::Paired;
                // The waiting clock restarts once the request is in a
                // worker's hands.
                comm.last_recv = now;
            }
            Err(err) => {
                warn!(worker = widx, error = %err, "dispatch failed");
                self.retire_worker_fd(widx);
                self.workers[widx].kill(now);
                self.reset_comm(cid);
            }
        }
    }

    fn check_canary(&mut self) {
        if self.canary.exists() {
            return;
        }
        info!("canary file removed; reloading workers");
        self.reload_requested = true;
        if let Err(err) = std::fs::write(&self.canary, format!("{}\n", std::process::id())) {
            warn!(error = %err, "could not rewrite canary");
        }
    }

    fn check_workers(&mut self, now: u64) {
        if self.reload_requested {
            self.reload_requested = false;
            for widx in 0..self.workers.len() {
                match self.workers[widx].status {
                    WorkerStatus::Idling => {
                        self.retire_worker_fd(widx);
                        self.workers[widx].kill(now);
                    }
                    WorkerStatus::Processing => {
                        self.workers[widx].reload_requested = true;
                    }
                    WorkerStatus::Stopped => {}
                }
            }
        }

        let lifetime = self.config.max_worker_lifetime.as_secs();
        for widx in 0..self.workers.len() {
            if !self.workers[widx].is_alive() {
                continue;
            }
            if self.workers[widx].child_exited() {
                self.worker_died(widx, now);
                continue;
            }
            if now.saturating_sub(self.workers[widx].spawned_at) > lifetime {
                match self.workers[widx].status {
                    WorkerStatus::Idling => {
                        debug!(worker = widx, "lifetime exceeded");
                        self.retire_worker_fd(widx);
                        self.workers[widx].kill(now);
                    }
                    WorkerStatus::Processing => {
                        self.workers[widx].reload_requested = true;
                    }
                    WorkerStatus::Stopped => {}
                }
            }
        }

        let mut alive = self.workers.iter().filter(|w| w.is_alive()).count();
        while alive < self.config.min_workers {
            let widx = match self
                .workers
                .iter()
                .position(|w| w.status == WorkerStatus::Stopped)
            {
                Some(widx) => widx,
                None => break,
            };
            match self.workers[widx].spawn(false, now) {
                Ok(()) => alive += 1,
                Err(err) => {
                    // Retry on the next sweep.
                    warn!(worker = widx, error = %err, "spawn failed");
                    break;
                }
            }
        }

        self.ws_children
            .retain_mut(|child| !matches!(child.try_wait(), Ok(Some(_))));
    }

    fn check_timeouts(&mut self, now: u64) {
        let waiting = self.config.max_http_waiting.as_secs();
        let mut expired: Vec<(CommId, Option<Refusal>)> = Vec::new();

        for id in self.comms.alive_ids() {
            let comm = self.comms.get(id);
            match comm.state {
                CommState::KeepAlive => {
                    if comm.worker.is_none()
                        && now.saturating_sub(comm.last_request) > KEEP_ALIVE_TIMEOUT
                    {
                        expired.push((id, None));
                    }
                }
                CommState::Paired | CommState::ReadingHeaders | CommState::ReadingBody => {
                    if now.saturating_sub(comm.last_recv) > waiting {
                        let refusal = comm
                            .request_data_received
                            .then_some(Refusal::RequestTimeout);
                        expired.push((id, refusal));
                    }
                }
                _ => {}
            }
        }

        for (id, refusal) in expired {
            debug!(id, peer = ?self.comms.get(id).peer, ?refusal, "connection timed out");
            match refusal {
                Some(r) => self.refuse(id, r),
                None => self.reset_comm(id),
            }
        }
    }

    fn shutdown(&mut self) {
        info!("ordered shutdown");
        let now = coarse_now();
        for widx in 0..self.workers.len() {
            if self.workers[widx].is_alive() {
                self.retire_worker_fd(widx);
                self.workers[widx].kill(now);
            }
        }
        for id in self.comms.alive_ids() {
            self.reset_comm(id);
        }
        let _ = std::fs::remove_file(&self.canary);
    }
}

/// Splits a file-sentinel payload into its header block (terminator
/// included) and the path that follows it.
fn split_file_payload(payload: &[u8]) -> Option<(&[u8], PathBuf)> {
    let pos = payload.windows(4).position(|w| w == b"\r\n\r\n")?;
    let headers = &payload[..pos + 4];
    let raw_path = &payload[pos + 4..];
    if raw_path.is_empty() {
        return None;
    }
    use std::ffi::OsString;
    use std::os::unix::ffi::OsStringExt;
    Some((headers, PathBuf::from(OsString::from_vec(raw_path.to_vec()))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_payload_splits_on_first_terminator() {
        let payload = b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\n\r\n/tmp/test.bin";
        let (headers, path) = split_file_payload(payload).unwrap();
        assert!(headers.ends_with(b"\r\n\r\n"));
        assert_eq!(path, PathBuf::from("/tmp/test.bin"));
    }

    #[test]
    fn file_payload_without_path_is_rejected() {
        assert!(split_file_payload(b"HTTP/1.1 200 OK\r\n\r\n").is_none());
        assert!(split_file_payload(b"no terminator at all").is_none());
    }

    #[test]
    fn tokens_separate_kinds() {
        let a = token(KIND_LISTENER, 3);
        let b = token(KIND_WORKER, 3);
        let c = token(KIND_COMM, 3);
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_eq!((c & 0xffff_ffff) as usize, 3);
        assert_eq!(c >> 32, KIND_COMM);
    }
}
