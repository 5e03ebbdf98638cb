//! Log output setup
//!
//! Installs an `env_logger` backend that stamps every record with an RFC 3339
//! timestamp and the `file:line` of the call site. Lines go to stderr and,
//! when configured, are appended to a log file. Both sinks share one lock.

use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Mutex;

use crate::config::LoggingConfig;

struct Sinks {
    stderr: io::Stderr,
    file: Option<File>,
}

/// Writer that fans each formatted line out to stderr and the optional file
pub struct TeeWriter {
    sinks: Mutex<Sinks>,
}

impl TeeWriter {
    pub fn new(file: Option<&Path>) -> io::Result<Self> {
        let file = match file {
            Some(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
                Some(OpenOptions::new().create(true).append(true).open(path)?)
            }
            None => None,
        };
        Ok(Self {
            sinks: Mutex::new(Sinks {
                stderr: io::stderr(),
                file,
            }),
        })
    }
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut sinks = self
            .sinks
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log sink lock poisoned"))?;
        sinks.stderr.write_all(buf)?;
        if let Some(f) = sinks.file.as_mut() {
            f.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut sinks = self
            .sinks
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log sink lock poisoned"))?;
        sinks.stderr.flush()?;
        if let Some(f) = sinks.file.as_mut() {
            f.flush()?;
        }
        Ok(())
    }
}

/// Install the global logger. `debug` forces the debug level.
///
/// Calling this twice is harmless; the second call leaves the first logger in place.
pub fn init(config: &LoggingConfig, debug: bool) -> io::Result<()> {
    let level = if debug { "debug" } else { config.level.as_str() };
    let env = env_logger::Env::default().default_filter_or(level);
    let mut builder = env_logger::Builder::from_env(env);
    if debug {
        builder.filter_level(log::LevelFilter::Debug);
    }

    let tee = TeeWriter::new(config.file.as_deref())?;
    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "{} {:<5} [{}:{}] {}: {}",
                Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
                record.level(),
                record.file().unwrap_or("?"),
                record.line().unwrap_or(0),
                record.target(),
                record.args()
            )
        })
        .target(env_logger::Target::Pipe(Box::new(tee)));

    if builder.try_init().is_err() {
        log::debug!("logger already initialized");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_tee_appends_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("engine.log");
        {
            let mut tee = TeeWriter::new(Some(&path)).unwrap();
            tee.write_all(b"first line\n").unwrap();
            tee.flush().unwrap();
        }
        {
            let mut tee = TeeWriter::new(Some(&path)).unwrap();
            tee.write_all(b"second line\n").unwrap();
        }
        let mut content = String::new();
        File::open(&path).unwrap().read_to_string(&mut content).unwrap();
        assert_eq!(content, "first line\nsecond line\n");
    }
}
