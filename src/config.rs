//! Runtime configuration.

use std::net::SocketAddr;
use std::time::Duration;

/// Hard cap on the worker pool, whatever the user asks for.
const WORKER_POOL_CAP: usize = 1024;

/// Verbosity of the installed log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// No output at all.
    Off,
    /// Errors only.
    Error,
    /// Errors and warnings.
    Warn,
    /// The default.
    Info,
    /// Connection lifecycle and parse results.
    Debug,
    /// Per-chunk I/O accounting. Noisy.
    Trace,
}

impl LogLevel {
    pub(crate) fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Configuration for [`run`](crate::run).
///
/// Built with chained setters:
///
/// ```
/// use serverino::Config;
///
/// let config = Config::new()
///     .listen("127.0.0.1:8080".parse().unwrap())
///     .min_workers(2)
///     .max_workers(8);
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) listeners: Vec<SocketAddr>,
    pub(crate) listener_backlog: i32,
    pub(crate) min_workers: usize,
    pub(crate) max_workers: usize,
    pub(crate) max_worker_lifetime: Duration,
    pub(crate) max_worker_idling: Duration,
    pub(crate) max_request_time: Duration,
    pub(crate) max_http_waiting: Duration,
    pub(crate) max_request_size: usize,
    pub(crate) keep_alive: bool,
    pub(crate) with_remote_ip: bool,
    pub(crate) log_level: LogLevel,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            listeners: Vec::new(),
            listener_backlog: 128,
            min_workers: 3,
            max_workers: 12,
            max_worker_lifetime: Duration::from_secs(60 * 60),
            max_worker_idling: Duration::from_secs(5 * 60),
            max_request_time: Duration::from_secs(60),
            max_http_waiting: Duration::from_secs(10),
            max_request_size: 10 * 1024 * 1024,
            keep_alive: true,
            with_remote_ip: false,
            log_level: LogLevel::Info,
        }
    }
}

impl Config {
    /// A configuration with production-shaped defaults and no listeners.
    ///
    /// If no listener is added, the daemon binds `127.0.0.1:8080`.
    pub fn new() -> Config {
        Config::default()
    }

    /// Adds a bind endpoint. May be called multiple times.
    pub fn listen(mut self, addr: SocketAddr) -> Config {
        self.listeners.push(addr);
        self
    }

    /// Sets the listen backlog passed to `listen(2)`.
    pub fn listener_backlog(mut self, backlog: i32) -> Config {
        self.listener_backlog = backlog;
        self
    }

    /// Minimum number of worker processes kept alive.
    pub fn min_workers(mut self, count: usize) -> Config {
        self.min_workers = count;
        self
    }

    /// Maximum number of worker processes, including dynamic ones.
    pub fn max_workers(mut self, count: usize) -> Config {
        self.max_workers = count;
        self
    }

    /// How long a worker process may live before being recycled.
    pub fn max_worker_lifetime(mut self, d: Duration) -> Config {
        self.max_worker_lifetime = d;
        self
    }

    /// How long a worker process may sit idle before exiting.
    pub fn max_worker_idling(mut self, d: Duration) -> Config {
        self.max_worker_idling = d;
        self
    }

    /// Wall-clock budget for a single handler invocation, enforced inside
    /// the worker.
    pub fn max_request_time(mut self, d: Duration) -> Config {
        self.max_request_time = d;
        self
    }

    /// How long the daemon waits for a request to finish arriving before
    /// answering 408.
    pub fn max_http_waiting(mut self, d: Duration) -> Config {
        self.max_http_waiting = d;
        self
    }

    /// Upper bound on headers plus body, in bytes.
    pub fn max_request_size(mut self, bytes: usize) -> Config {
        self.max_request_size = bytes;
        self
    }

    /// Whether HTTP keep-alive is honored. When disabled every response
    /// closes the connection.
    pub fn keep_alive(mut self, enabled: bool) -> Config {
        self.keep_alive = enabled;
        self
    }

    /// Whether a synthetic `x-remote-ip` header carrying the peer address is
    /// prepended to every request delivered to workers.
    pub fn with_remote_ip(mut self, enabled: bool) -> Config {
        self.with_remote_ip = enabled;
        self
    }

    /// Log verbosity for the daemon and its children.
    pub fn log_level(mut self, level: LogLevel) -> Config {
        self.log_level = level;
        self
    }

    /// Brings worker bounds into a sane shape. `min >= 1`, `min <= max`,
    /// and the pool never exceeds the hard cap.
    pub(crate) fn sanitize(&mut self) {
        if self.listeners.is_empty() {
            self.listeners.push(([127, 0, 0, 1], 8080).into());
        }
        self.min_workers = self.min_workers.max(1).min(WORKER_POOL_CAP);
        self.max_workers = self.max_workers.max(self.min_workers).min(WORKER_POOL_CAP);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_gets_a_listener() {
        let mut config = Config::new();
        config.sanitize();
        assert_eq!(config.listeners.len(), 1);
    }

    #[test]
    fn worker_bounds_are_clamped() {
        let mut config = Config::new().min_workers(0).max_workers(0);
        config.sanitize();
        assert_eq!(config.min_workers, 1);
        assert_eq!(config.max_workers, 1);

        let mut config = Config::new().min_workers(10).max_workers(2);
        config.sanitize();
        assert!(config.min_workers <= config.max_workers);

        let mut config = Config::new().min_workers(1).max_workers(1 << 20);
        config.sanitize();
        assert_eq!(config.max_workers, 1024);
    }

    #[test]
    fn builder_chains() {
        let config = Config::new()
            .listen(([0, 0, 0, 0], 9000).into())
            .keep_alive(false)
            .with_remote_ip(true)
            .log_level(LogLevel::Debug);
        assert_eq!(config.listeners[0].port(), 9000);
        assert!(!config.keep_alive);
        assert!(config.with_remote_ip);
    }
}
