//! Checks of the public surface that don't need a running daemon.

use serverino::{Config, LogLevel};

#[test]
fn config_builder_composes() {
    let _config = Config::new()
        .listen("127.0.0.1:9090".parse().unwrap())
        .listen("[::1]:9091".parse().unwrap())
        .listener_backlog(256)
        .min_workers(2)
        .max_workers(4)
        .max_request_size(1024 * 1024)
        .keep_alive(true)
        .with_remote_ip(true)
        .log_level(LogLevel::Warn);
}

#[test]
fn handler_can_be_a_plain_fn() {
    fn handler(
        _req: &serverino::Request,
        out: &mut serverino::Output,
    ) -> serverino::Result<()> {
        out.status(serverino::StatusCode::NO_CONTENT);
        Ok(())
    }
    // Only has to typecheck against the Handler bound.
    fn assert_handler<H: serverino::Handler>(_h: H) {}
    assert_handler(handler);
}

#[test]
fn errors_are_displayable_and_sourced() {
    fn noop(_req: &serverino::Request, _out: &mut serverino::Output) -> serverino::Result<()> {
        Ok(())
    }
    let err = serverino::run(Config::new().listen("203.0.113.1:1".parse().unwrap()), noop)
        .unwrap_err();
    assert!(err.is_listen());
    assert!(!format!("{}", err).is_empty());
    assert!(std::error::Error::source(&err).is_some());
}
