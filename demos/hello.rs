//! Minimal server: one handler, default pool.
//!
//! Run with `cargo run --example hello`, then `curl localhost:8080/anything`.

use serverino::{Config, LogLevel, Output, Request};

fn hello(req: &Request, out: &mut Output) -> serverino::Result<()> {
    out.header("content-type", "text/plain");
    out.write(format!("Hello from {}!\n", req.path()));
    Ok(())
}

fn main() {
    let config = Config::new()
        .listen("127.0.0.1:8080".parse().unwrap())
        .min_workers(2)
        .max_workers(8)
        .with_remote_ip(true)
        .log_level(LogLevel::Debug);

    if let Err(err) = serverino::run(config, hello) {
        eprintln!("serverino: {}", err);
        std::process::exit(1);
    }
}
