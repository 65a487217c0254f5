//! Linux epoll backend. Level-triggered; the token rides in the event data.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use tracing::trace;

use super::{Event, Interest, Ready, Token};

const EVENT_CAPACITY: usize = 1024;

pub(crate) struct Poller {
    epfd: RawFd,
}

fn interest_bits(interest: Interest) -> u32 {
    let mut bits = 0;
    if interest.readable() {
        bits |= libc::EPOLLIN as u32;
    }
    if interest.writable() {
        bits |= libc::EPOLLOUT as u32;
    }
    // EPOLLRDHUP lets a half-closed peer surface as readable EOF instead of
    // hanging until the next timeout sweep.
    bits | libc::EPOLLRDHUP as u32
}

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

impl Poller {
    pub(crate) fn new() -> io::Result<Poller> {
        let epfd = cvt(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
        Ok(Poller { epfd })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, interest: Interest, token: Token) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: interest_bits(interest),
            u64: token,
        };
        cvt(unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) })?;
        Ok(())
    }

    pub(crate) fn register(&mut self, fd: RawFd, interest: Interest, token: Token) -> io::Result<()> {
        trace!(fd, token, "epoll register");
        self.ctl(libc::EPOLL_CTL_ADD, fd, interest, token)
    }

    pub(crate) fn modify(&mut self, fd: RawFd, interest: Interest, token: Token) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, interest, token)
    }

    pub(crate) fn unregister(&mut self, fd: RawFd) -> io::Result<()> {
        trace!(fd, "epoll unregister");
        let mut ev = libc::epoll_event { events: 0, u64: 0 };
        cvt(unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut ev) })?;
        Ok(())
    }

    /// Waits for events, replacing the contents of `events`. A `None`
    /// timeout blocks indefinitely. EINTR comes back as an empty set so the
    /// caller re-enters its loop and notices signal flags.
    pub(crate) fn poll(&mut self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<()> {
        events.clear();
        let timeout_ms = timeout
            .map(|d| i32::try_from(d.as_millis()).unwrap_or(i32::MAX))
            .unwrap_or(-1);

        let mut raw: [libc::epoll_event; EVENT_CAPACITY] =
            unsafe { std::mem::zeroed() };
        let count = unsafe {
            libc::epoll_wait(self.epfd, raw.as_mut_ptr(), EVENT_CAPACITY as i32, timeout_ms)
        };
        if count < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }

        for ev in raw.iter().take(count as usize) {
            let mut ready = Ready::EMPTY;
            if ev.events & libc::EPOLLIN as u32 != 0 || ev.events & libc::EPOLLPRI as u32 != 0 {
                ready.insert(Ready::READ);
            }
            if ev.events & libc::EPOLLOUT as u32 != 0 {
                ready.insert(Ready::WRITE);
            }
            if ev.events & (libc::EPOLLHUP as u32 | libc::EPOLLRDHUP as u32) != 0 {
                ready.insert(Ready::EOF);
            }
            if ev.events & libc::EPOLLERR as u32 != 0 {
                ready.insert(Ready::ERR);
            }
            if !ready.is_empty() {
                events.push(Event {
                    token: ev.u64,
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
            libc::close(self.epfd);
        }
    }
}
