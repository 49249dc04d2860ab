use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use env_logger::{Env, Target};

// Sends every log line to stdout and to the log file.
struct Tee<A: Write, B: Write> {
    console: A,
    file: B,
}

impl<A: Write, B: Write> Write for Tee<A, B> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.console.write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.console.flush()?;
        self.file.flush()
    }
}

fn open_log_file(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Initialises env_logger at `info` (overridable through `RUST_LOG`). When
/// `log_file` is set, output is also appended to that file.
pub fn init(log_file: Option<&Path>) -> io::Result<()> {
    let mut builder = env_logger::Builder::from_env(Env::default().default_filter_or("info"));

    if let Some(path) = log_file {
        let file = open_log_file(path)?;
        builder.target(Target::Pipe(Box::new(Tee {
            console: io::stdout(),
            file,
        })));
    }

    // A logger may already be installed (tests, embedding).
    let _ = builder.try_init();
    Ok(())
}
