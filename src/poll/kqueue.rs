//! BSD/macOS kqueue backend.
//!
//! Registrations accumulate into a pending change-list that is flushed with
//! the next `kevent` call, the same shape the syscall itself encourages.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use tracing::trace;

use super::{Event, Interest, Ready, Token};

const EVENT_CAPACITY: usize = 1024;

pub(crate) struct Poller {
    kq: RawFd,
    changes: Vec<libc::kevent>,
}

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn change(fd: RawFd, filter: i16, flags: u16, token: Token) -> libc::kevent {
    let mut kev: libc::kevent = unsafe { std::mem::zeroed() };
    kev.ident = fd as libc::uintptr_t;
    kev.filter = filter as _;
    kev.flags = flags as _;
    kev.udata = token as _;
    kev
}

impl Poller {
    pub(crate) fn new() -> io::Result<Poller> {
        let kq = cvt(unsafe { libc::kqueue() })?;
        cvt(unsafe { libc::fcntl(kq, libc::F_SETFD, libc::FD_CLOEXEC) })?;
        Ok(Poller {
            kq,
            changes: Vec::new(),
        })
    }

    fn push_interest(&mut self, fd: RawFd, interest: Interest, token: Token) {
        let read_flags = if interest.readable() {
            libc::EV_ADD | libc::EV_ENABLE
        } else {
            libc::EV_DELETE
        };
        let write_flags = if interest.writable() {
            libc::EV_ADD | libc::EV_ENABLE
        } else {
            libc::EV_DELETE
        };
        self.changes
            .push(change(fd, libc::EVFILT_READ as i16, read_flags as u16, token));
        self.changes
            .push(change(fd, libc::EVFILT_WRITE as i16, write_flags as u16, token));
    }

    pub(crate) fn register(&mut self, fd: RawFd, interest: Interest, token: Token) -> io::Result<()> {
        trace!(fd, token, "kqueue register");
        self.push_interest(fd, interest, token);
        Ok(())
    }

    pub(crate) fn modify(&mut self, fd: RawFd, interest: Interest, token: Token) -> io::Result<()> {
        self.push_interest(fd, interest, token);
        Ok(())
    }

    pub(crate) fn unregister(&mut self, fd: RawFd) -> io::Result<()> {
        trace!(fd, "kqueue unregister");
        self.changes
            .push(change(fd, libc::EVFILT_READ as i16, libc::EV_DELETE as u16, 0));
        self.changes
            .push(change(fd, libc::EVFILT_WRITE as i16, libc::EV_DELETE as u16, 0));
        Ok(())
    }

    pub(crate) fn poll(&mut self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<()> {
        events.clear();

        let ts;
        let ts_ptr = match timeout {
            Some(d) => {
                ts = libc::timespec {
                    tv_sec: d.as_secs() as libc::time_t,
                    tv_nsec: d.subsec_nanos() as _,
                };
                &ts as *const libc::timespec
            }
            None => std::ptr::null(),
        };

        let mut raw: [libc::kevent; EVENT_CAPACITY] = unsafe { std::mem::zeroed() };
        let count = unsafe {
            libc::kevent(
                self.kq,
                self.changes.as_ptr(),
                self.changes.len() as _,
                raw.as_mut_ptr(),
                EVENT_CAPACITY as _,
                ts_ptr,
            )
        };
        // The change-list is consumed whether or not the call succeeded;
        // deleting filters that were never added reports per-event ENOENT
        // which we drop below.
        self.changes.clear();
        if count < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }

        for kev in raw.iter().take(count as usize) {
            if kev.flags & libc::EV_ERROR as u16 != 0 {
                // ENOENT from a redundant EV_DELETE; anything else shows up
                // again on the fd itself.
                continue;
            }
            let mut ready = Ready::EMPTY;
            match kev.filter as i16 {
                f if f == libc::EVFILT_READ as i16 => ready.insert(Ready::READ),
                f if f == libc::EVFILT_WRITE as i16 => ready.insert(Ready::WRITE),
                _ => {}
            }
            if kev.flags & libc::EV_EOF as u16 != 0 {
                ready.insert(Ready::EOF);
            }
            if !ready.is_empty() {
                events.push(Event {
                    token: kev.udata as Token,
                    ready,
                });
            }
        }
        Ok(())
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.kq);
        }
    }
}
