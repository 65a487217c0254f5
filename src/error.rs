//! Error and Result module.

use std::error::Error as StdError;
use std::fmt;

/// Result type often returned from methods that can have serverino `Error`s.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// Represents errors that can occur while running the daemon or a worker.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
}

#[derive(Debug)]
pub(crate) enum Kind {
    /// A client sent something that is not the HTTP we accept.
    Parse(Parse),
    /// An `io::Error` on a client or IPC stream.
    Io,
    /// Error creating a listening socket.
    Listen,
    /// A worker child could not be spawned or refused the handshake.
    Worker,
    /// Passing a client socket to a websocket child failed.
    Handoff,
    /// The user handler returned an error.
    Handler,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Parse {
    Method,
    Version,
    Uri,
    Header,
}

impl Error {
    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(crate) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(crate) fn new_parse(parse: Parse) -> Error {
        Error::new(Kind::Parse(parse))
    }

    pub(crate) fn new_io(cause: std::io::Error) -> Error {
        Error::new(Kind::Io).with(cause)
    }

    pub(crate) fn new_listen(cause: std::io::Error) -> Error {
        Error::new(Kind::Listen).with(cause)
    }

    pub(crate) fn new_worker<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::Worker).with(cause)
    }

    pub(crate) fn new_handoff<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::Handoff).with(cause)
    }

    /// An error to return from a request handler.
    ///
    /// The worker answers the client with a `500 Internal Server Error`
    /// and logs the cause.
    pub fn handler<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::Handler).with(cause)
    }

    /// Returns true if this was an HTTP parse error.
    pub fn is_parse(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(_))
    }

    /// Returns true if this error came from creating a listener.
    pub fn is_listen(&self) -> bool {
        matches!(self.inner.kind, Kind::Listen)
    }

    /// Returns true if this error was caused by a worker child process.
    pub fn is_worker(&self) -> bool {
        matches!(self.inner.kind, Kind::Worker)
    }

    /// Returns true if this error was returned by the user handler.
    pub fn is_handler(&self) -> bool {
        matches!(self.inner.kind, Kind::Handler)
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::Parse(Parse::Method) => "invalid HTTP method parsed",
            Kind::Parse(Parse::Version) => "invalid HTTP version parsed",
            Kind::Parse(Parse::Uri) => "invalid URI",
            Kind::Parse(Parse::Header) => "invalid HTTP header parsed",
            Kind::Io => "connection error",
            Kind::Listen => "error creating server listener",
            Kind::Worker => "worker process error",
            Kind::Handoff => "socket handoff error",
            Kind::Handler => "handler error",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("serverino::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref cause) = self.inner.cause {
            write!(f, "{}: {}", self.description(), cause)
        } else {
            f.write_str(self.description())
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        Error::new_io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    #[test]
    fn error_size_of() {
        assert_eq!(mem::size_of::<Error>(), mem::size_of::<usize>());
    }

    #[test]
    fn predicates() {
        assert!(Error::new_parse(Parse::Header).is_parse());
        assert!(Error::new_listen(std::io::Error::from(std::io::ErrorKind::AddrInUse)).is_listen());
        assert!(!Error::new_io(std::io::Error::from(std::io::ErrorKind::Other)).is_parse());
    }

    #[test]
    fn display_includes_cause() {
        let err = Error::new_worker("handshake refused");
        assert_eq!(err.to_string(), "worker process error: handshake refused");
    }
}
