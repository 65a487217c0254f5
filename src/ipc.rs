//! Process-spawn plumbing shared by daemon, workers and websocket children:
//! the inherited environment, the per-child Unix-domain listening socket,
//! and the build identity used to refuse mismatched children.

use std::io;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::os::fd::AsFd;

pub(crate) const ENV_SOCKET: &str = "SERVERINO_SOCKET";
pub(crate) const ENV_DAEMON: &str = "SERVERINO_DAEMON";
pub(crate) const ENV_BUILD: &str = "SERVERINO_BUILD";
pub(crate) const ENV_DYNAMIC: &str = "SERVERINO_DYNAMIC_WORKER";
pub(crate) const ENV_WEBSOCKET: &str = "SERVERINO_WEBSOCKET";

static CHANNEL_SEQ: AtomicU64 = AtomicU64::new(0);

/// A bound per-child listening socket plus the address string the child
/// receives through its environment. `path` is set when a filesystem socket
/// needs unlinking once the child has connected.
pub(crate) struct IpcChannel {
    pub(crate) listener: UnixListener,
    pub(crate) address: String,
    pub(crate) path: Option<PathBuf>,
}

/// Binds a fresh channel for one child. Linux gets an abstract-namespace
/// address (encoded with a leading `@` in the environment); everywhere else
/// a socket file in the tempdir.
pub(crate) fn bind_channel(kind: &str) -> io::Result<IpcChannel> {
    let seq = CHANNEL_SEQ.fetch_add(1, Ordering::Relaxed);
    let tag = format!("{}-{}-{}", std::process::id(), kind, seq);

    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        use std::os::linux::net::SocketAddrExt;
        let name = format!("SERVERINO_SOCKET/{}", tag);
        let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
        let listener = UnixListener::bind_addr(&addr)?;
        Ok(IpcChannel {
            listener,
            address: format!("@{}", name),
            path: None,
        })
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        let path = std::env::temp_dir().join(format!("serverino-{}.sock", tag));
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path)?;
        Ok(IpcChannel {
            listener,
            address: path.to_string_lossy().into_owned(),
            path: Some(path),
        })
    }
}

/// Child side: connects to the address handed over in the environment.
pub(crate) fn connect_channel(address: &str) -> io::Result<UnixStream> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    if let Some(name) = address.strip_prefix('@') {
        use std::os::linux::net::SocketAddrExt;
        let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
        return UnixStream::connect_addr(&addr);
    }
    UnixStream::connect(address)
}

/// Accepts one child connection, bounded by `timeout`.
pub(crate) fn accept_timeout(listener: &UnixListener, timeout: Duration) -> io::Result<UnixStream> {
    listener.set_nonblocking(true)?;
    let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
    let mut fds = [PollFd::new(listener.as_fd(), PollFlags::POLLIN)];
    let n = poll(&mut fds, PollTimeout::from(millis)).map_err(io::Error::from)?;
    if n == 0 {
        return Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "child did not connect",
        ));
    }
    let (stream, _) = listener.accept()?;
    Ok(stream)
}

/// Identity of the running binary, exchanged at worker spawn so a daemon
/// never pairs with a worker from a different build of the executable.
pub(crate) fn build_id() -> &'static str {
    static BUILD: OnceLock<String> = OnceLock::new();
    BUILD.get_or_init(|| {
        let fingerprint = std::env::current_exe()
            .and_then(std::fs::metadata)
            .map(|meta| {
                let mtime = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| d.as_secs())
                    .unwrap_or(0);
                meta.len().wrapping_mul(0x9e37_79b9_7f4a_7c15) ^ mtime
            })
            .unwrap_or(0);
        format!("{:016x}", fingerprint)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn channel_round_trip() {
        let channel = bind_channel("test").unwrap();
        let address = channel.address.clone();

        let child = std::thread::spawn(move || {
            let mut stream = connect_channel(&address).unwrap();
            stream.write_all(b"hi").unwrap();
        });

        let mut accepted = accept_timeout(&channel.listener, Duration::from_secs(5)).unwrap();
        let mut buf = [0u8; 2];
        accepted.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hi");
        child.join().unwrap();

        if let Some(path) = channel.path {
            let _ = std::fs::remove_file(path);
        }
    }

    #[test]
    fn accept_timeout_expires() {
        let channel = bind_channel("idle").unwrap();
        let err =
            accept_timeout(&channel.listener, Duration::from_millis(50)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn build_id_is_stable_hex() {
        let a = build_id();
        let b = build_id();
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.bytes().all(|b| b.is_ascii_hexdigit()));
    }
}
