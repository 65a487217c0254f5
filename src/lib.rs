#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![cfg_attr(test, deny(rust_2018_idioms))]

//! # serverino
//!
//! A small and ready-to-go HTTP/1.x server built as a preforking daemon
//! with a process worker pool.
//!
//! One process, the *daemon*, accepts TCP connections and multiplexes
//! them over a single event loop: it parses request heads, frames complete
//! requests, and dispatches them over per-worker Unix-domain sockets to a
//! pool of *worker* processes that run your handler. Workers are reused
//! across requests, recycled on a lifetime budget, and replaced when they
//! die. A handler can also hand a connection off to a dedicated *websocket*
//! child process.
//!
//! The same binary plays all the roles: [`run`] inspects the environment it
//! was started with and becomes the daemon, a worker, or a websocket child
//! accordingly.
//!
//! ```no_run
//! use serverino::{Config, Output, Request};
//!
//! fn hello(_req: &Request, out: &mut Output) -> serverino::Result<()> {
//!     out.write("Hello, world!");
//!     Ok(())
//! }
//!
//! fn main() {
//!     let config = Config::new().listen("127.0.0.1:8080".parse().unwrap());
//!     if let Err(err) = serverino::run(config, hello) {
//!         eprintln!("serverino: {}", err);
//!         std::process::exit(1);
//!     }
//! }
//! ```

#[cfg(not(unix))]
compile_error!("serverino currently supports Unix platforms only");

use std::net::TcpStream;

#[doc(no_inline)]
pub use http::{HeaderMap, Method, StatusCode, Version};

pub use crate::config::{Config, LogLevel};
pub use crate::error::{Error, Result};
pub use crate::worker::{Output, Request};

mod buffer;
mod clock;
mod config;
mod daemon;
mod error;
mod ipc;
mod poll;
mod proto;
mod websocket;
mod worker;

/// A request handler, run inside worker processes.
///
/// Handlers are invoked once per request, serially within a worker,
/// in parallel across the pool. Returning an error (or panicking) turns
/// into a `500 Internal Server Error` for the client.
pub trait Handler {
    /// Handles one request, writing the response into `output`.
    fn handle(&self, request: &Request, output: &mut Output) -> Result<()>;
}

impl<F> Handler for F
where
    F: Fn(&Request, &mut Output) -> Result<()>,
{
    fn handle(&self, request: &Request, output: &mut Output) -> Result<()> {
        self(request, output)
    }
}

/// A websocket handler, run inside a dedicated child process after a
/// connection upgrade.
pub trait WsHandler {
    /// Takes over the upgraded client socket for the rest of its life.
    fn handle(&self, stream: TcpStream) -> Result<()>;
}

impl<F> WsHandler for F
where
    F: Fn(TcpStream) -> Result<()>,
{
    fn handle(&self, stream: TcpStream) -> Result<()> {
        self(stream)
    }
}

fn init_tracing(config: &Config) {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_filter()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Runs the server with the given configuration and handler.
///
/// Called from the daemon process this blocks until an ordered shutdown;
/// called from a spawned worker it serves requests until recycled. Handlers
/// that upgrade to websockets need [`run_with_websocket`] instead.
pub fn run<H>(config: Config, handler: H) -> Result<()>
where
    H: Handler,
{
    init_tracing(&config);
    if std::env::var(ipc::ENV_WEBSOCKET).is_ok() {
        return Err(Error::new_handoff(
            "websocket upgrade without a websocket handler; use run_with_websocket",
        ));
    }
    if std::env::var(ipc::ENV_SOCKET).is_ok() {
        return worker::main(handler, &config);
    }
    daemon::run(config, false)
}

/// Like [`run`], with a websocket handler for upgraded connections.
pub fn run_with_websocket<H, W>(config: Config, handler: H, ws_handler: W) -> Result<()>
where
    H: Handler,
    W: WsHandler,
{
    init_tracing(&config);
    if std::env::var(ipc::ENV_WEBSOCKET).is_ok() {
        return websocket::main(ws_handler);
    }
    if std::env::var(ipc::ENV_SOCKET).is_ok() {
        return worker::main(handler, &config);
    }
    daemon::run(config, true)
}
