//! Portable `select(2)` fallback.
//!
//! The fd sets are rebuilt from the registration table on every cycle, which
//! is exactly what select costs anyway. Only used on platforms without epoll
//! or kqueue.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use super::{Event, Interest, Ready, Token};

pub(crate) struct Poller {
    registered: HashMap<RawFd, (Interest, Token)>,
}

impl Poller {
    pub(crate) fn new() -> io::Result<Poller> {
        Ok(Poller {
            registered: HashMap::new(),
        })
    }

    pub(crate) fn register(&mut self, fd: RawFd, interest: Interest, token: Token) -> io::Result<()> {
        if fd as usize >= libc::FD_SETSIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "fd exceeds FD_SETSIZE",
            ));
        }
        self.registered.insert(fd, (interest, token));
        Ok(())
    }

    pub(crate) fn modify(&mut self, fd: RawFd, interest: Interest, token: Token) -> io::Result<()> {
        self.register(fd, interest, token)
    }

    pub(crate) fn unregister(&mut self, fd: RawFd) -> io::Result<()> {
        self.registered.remove(&fd);
        Ok(())
    }

    pub(crate) fn poll(&mut self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<()> {
        events.clear();

        let mut read_set: libc::fd_set = unsafe { std::mem::zeroed() };
        let mut write_set: libc::fd_set = unsafe { std::mem::zeroed() };
        let mut err_set: libc::fd_set = unsafe { std::mem::zeroed() };
        unsafe {
            libc::FD_ZERO(&mut read_set);
            libc::FD_ZERO(&mut write_set);
            libc::FD_ZERO(&mut err_set);
        }

        let mut nfds = 0;
        for (&fd, &(interest, _)) in &self.registered {
            unsafe {
                if interest.readable() {
                    libc::FD_SET(fd, &mut read_set);
                }
                if interest.writable() {
                    libc::FD_SET(fd, &mut write_set);
                }
                libc::FD_SET(fd, &mut err_set);
            }
            nfds = nfds.max(fd + 1);
        }

        let mut tv;
        let tv_ptr = match timeout {
            Some(d) => {
                tv = libc::timeval {
                    tv_sec: d.as_secs() as libc::time_t,
                    tv_usec: d.subsec_micros() as _,
                };
                &mut tv as *mut libc::timeval
            }
            None => std::ptr::null_mut(),
        };

        let count = unsafe {
            libc::select(
                nfds,
                &mut read_set,
                &mut write_set,
                &mut err_set,
                tv_ptr,
            )
        };
        if count < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }

        for (&fd, &(_, token)) in &self.registered {
            let mut ready = Ready::EMPTY;
            unsafe {
                if libc::FD_ISSET(fd, &read_set) {
                    ready.insert(Ready::READ);
                }
                if libc::FD_ISSET(fd, &write_set) {
                    ready.insert(Ready::WRITE);
                }
                if libc::FD_ISSET(fd, &err_set) {
                    ready.insert(Ready::ERR);
                }
            }
            if !ready.is_empty() {
                events.push(Event { token, ready });
            }
        }
        Ok(())
    }
}
