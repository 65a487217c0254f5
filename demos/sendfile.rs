//! Streams a generated file to the client and deletes it afterwards.
//!
//! The handler writes a temporary file and answers with the file-then-delete
//! sentinel: the daemon streams the contents and unlinks the file once it is
//! fully sent, while the worker is already free for the next request.

use std::io::Write as _;

use serverino::{Config, Output, Request};

fn download(req: &Request, out: &mut Output) -> serverino::Result<()> {
    let path = std::env::temp_dir().join(format!(
        "serverino-dl-{}-{}.txt",
        std::process::id(),
        req.query()
    ));
    let mut file = std::fs::File::create(&path)?;
    for n in 0..1000 {
        writeln!(file, "line {}", n)?;
    }

    out.header("content-type", "text/plain");
    out.serve_file_and_delete(&path);
    Ok(())
}

fn main() {
    let config = Config::new().listen("127.0.0.1:8080".parse().unwrap());
    if let Err(err) = serverino::run(config, download) {
        eprintln!("serverino: {}", err);
        std::process::exit(1);
    }
}
