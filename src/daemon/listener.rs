//! Listening sockets.

use std::net::{SocketAddr, TcpListener};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::info;

#[derive(Debug)]
pub(crate) struct Listener {
    pub(crate) inner: TcpListener,
    pub(crate) addr: SocketAddr,
}

/// Binds one endpoint: reuse-addr on, configured backlog, non-blocking.
pub(crate) fn bind(addr: &SocketAddr, backlog: i32) -> crate::Result<Listener> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
        .map_err(crate::Error::new_listen)?;
    socket
        .set_reuse_address(true)
        .map_err(crate::Error::new_listen)?;
    socket
        .bind(&(*addr).into())
        .map_err(crate::Error::new_listen)?;
    socket.listen(backlog).map_err(crate::Error::new_listen)?;
    socket
        .set_nonblocking(true)
        .map_err(crate::Error::new_listen)?;

    let inner: TcpListener = socket.into();
    let addr = inner.local_addr().map_err(crate::Error::new_listen)?;
    info!(%addr, "listening");
    Ok(Listener { inner, addr })
}
