//! The websocket child process.
//!
//! Spawned by the daemon when a handler upgrades a connection. The child
//! connects to the address in its environment, receives the client socket
//! via `SCM_RIGHTS`, acknowledges, and runs the user's websocket handler on
//! the recovered stream for the rest of the connection's life.

use std::io::Write;
use std::net::TcpStream;

use tracing::debug;

use crate::daemon::handoff;
use crate::ipc;
use crate::proto::frame::HANDOFF_ACK;
use crate::WsHandler;

pub(crate) fn main<W: WsHandler>(handler: W) -> crate::Result<()> {
    let address = std::env::var(ipc::ENV_WEBSOCKET)
        .map_err(|_| crate::Error::new_handoff("missing handoff address in environment"))?;

    let mut channel = ipc::connect_channel(&address).map_err(crate::Error::new_handoff)?;
    let fd = handoff::recv_fd(&channel).map_err(crate::Error::new_handoff)?;
    channel
        .write_all(&[HANDOFF_ACK])
        .map_err(crate::Error::new_handoff)?;
    drop(channel);

    let stream = TcpStream::from(fd);
    stream.set_nonblocking(false).map_err(crate::Error::new_io)?;
    if let Ok(peer) = stream.peer_addr() {
        debug!(%peer, "websocket child took over connection");
    }
    handler.handle(stream)
}
