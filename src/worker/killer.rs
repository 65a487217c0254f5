//! The worker's monitor thread.
//!
//! Three wall-clock budgets are watched from a side thread: handler
//! execution time, total worker lifetime, and idle time. Crossing any of
//! them ends the process cleanly; the daemon sees EOF on the IPC socket and
//! recycles the slot. The thread also watches the daemon itself so orphaned
//! workers don't linger after a daemon crash.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::kill;
use nix::unistd::Pid;
use tracing::{info, warn};

use crate::clock::coarse_now;

pub(crate) struct Monitor {
    busy: AtomicBool,
    since: AtomicU64,
    started: u64,
}

impl Monitor {
    pub(crate) fn new() -> Arc<Monitor> {
        Arc::new(Monitor {
            busy: AtomicBool::new(false),
            since: AtomicU64::new(coarse_now()),
            started: coarse_now(),
        })
    }

    pub(crate) fn set_busy(&self) {
        self.busy.store(true, Ordering::SeqCst);
        self.since.store(coarse_now(), Ordering::SeqCst);
    }

    pub(crate) fn set_idle(&self) {
        self.busy.store(false, Ordering::SeqCst);
        self.since.store(coarse_now(), Ordering::SeqCst);
    }
}

pub(crate) struct Limits {
    pub(crate) max_request_time: Duration,
    pub(crate) max_lifetime: Duration,
    pub(crate) max_idling: Duration,
    pub(crate) daemon_pid: Option<i32>,
}

pub(crate) fn spawn(monitor: Arc<Monitor>, limits: Limits) {
    std::thread::Builder::new()
        .name("killer".into())
        .spawn(move || watch(monitor, limits))
        .expect("spawning the monitor thread");
}

fn watch(monitor: Arc<Monitor>, limits: Limits) -> ! {
    loop {
        std::thread::sleep(Duration::from_millis(500));
        let now = coarse_now();
        let busy = monitor.busy.load(Ordering::SeqCst);
        let since = monitor.since.load(Ordering::SeqCst);

        if now.saturating_sub(monitor.started) > limits.max_lifetime.as_secs() {
            info!("worker lifetime over; exiting");
            std::process::exit(0);
        }
        if busy && now.saturating_sub(since) > limits.max_request_time.as_secs() {
            warn!("handler exceeded the request time budget; exiting");
            std::process::exit(0);
        }
        if !busy && now.saturating_sub(since) > limits.max_idling.as_secs() {
            info!("idle too long; exiting");
            std::process::exit(0);
        }
        if let Some(pid) = limits.daemon_pid {
            if kill(Pid::from_raw(pid), None).is_err() {
                info!("daemon is gone; exiting");
                std::process::exit(0);
            }
        }
    }
}
