//! Readiness backend.
//!
//! One uniform surface over the platform notification facility: register a
//! file descriptor with an interest set, poll for events with a timeout,
//! mutate the interest, unregister. The backend is picked at build time:
//! epoll on Linux, kqueue on the BSDs and macOS, `select(2)` as the portable
//! fallback. All daemon suspension happens inside [`Poller::poll`].

use std::fmt;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod epoll;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) use self::epoll::Poller;

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly",
))]
mod kqueue;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly",
))]
pub(crate) use self::kqueue::Poller;

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly",
)))]
mod select;
#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly",
)))]
pub(crate) use self::select::Poller;

/// Opaque registration cookie, handed back with every event.
pub(crate) type Token = u64;

/// What the caller wants to hear about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Interest(u8);

impl Interest {
    pub(crate) const READ: Interest = Interest(0b01);
    pub(crate) const WRITE: Interest = Interest(0b10);

    pub(crate) fn readable(self) -> bool {
        self.0 & Interest::READ.0 != 0
    }

    pub(crate) fn writable(self) -> bool {
        self.0 & Interest::WRITE.0 != 0
    }
}

impl std::ops::BitOr for Interest {
    type Output = Interest;
    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

/// What actually happened on the descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Ready(u8);

impl Ready {
    pub(crate) const EMPTY: Ready = Ready(0);
    pub(crate) const READ: Ready = Ready(0b0001);
    pub(crate) const WRITE: Ready = Ready(0b0010);
    pub(crate) const EOF: Ready = Ready(0b0100);
    pub(crate) const ERR: Ready = Ready(0b1000);

    pub(crate) fn insert(&mut self, other: Ready) {
        self.0 |= other.0;
    }

    pub(crate) fn is_readable(self) -> bool {
        // Peer close and errors surface through a read attempt.
        self.0 & (Ready::READ.0 | Ready::EOF.0 | Ready::ERR.0) != 0
    }

    pub(crate) fn is_writable(self) -> bool {
        self.0 & Ready::WRITE.0 != 0
    }

    pub(crate) fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// A single readiness notification.
#[derive(Clone, Copy)]
pub(crate) struct Event {
    pub(crate) token: Token,
    pub(crate) ready: Ready,
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("token", &self.token)
            .field("ready", &self.ready)
            .finish()
    }
}
