//! Log sink installation.
//!
//! The library itself only emits `tracing` events; this module turns a
//! connection's [`LogSink`] configuration into an installed subscriber.
//! Installation is best-effort: if the process already has a global
//! subscriber (an embedding application usually does), the existing one
//! wins and the configuration is ignored.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::sync::Arc;

use starling_core::{Config, GcsError, LogSink};
use tracing::Level;

/// Writer that appends to a shared file handle.
struct SharedFile(Arc<File>);

impl Write for SharedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&*self.0).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        (&*self.0).flush()
    }
}

/// Writer that hands each formatted record to an application callback.
struct CallbackWriter(Arc<dyn Fn(&str) + Send + Sync>);

impl Write for CallbackWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let line = String::from_utf8_lossy(buf);
        let line = line.trim_end_matches('\n');
        if !line.is_empty() {
            (self.0)(line);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Install the configured log sink, if the process does not have one yet.
pub(crate) fn install_log_sink(config: &Config) -> Result<(), GcsError> {
    let level = if config.debug {
        Level::DEBUG
    } else {
        Level::INFO
    };

    match &config.log {
        Some(LogSink::File(path)) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| {
                    GcsError::Protocol(format!("cannot open log file {}: {e}", path.display()))
                })?;
            let file = Arc::new(file);
            let builder = tracing_subscriber::fmt()
                .with_max_level(level)
                .with_ansi(false)
                .with_writer(move || SharedFile(Arc::clone(&file)));
            if config.self_tstamp {
                let _ = builder.try_init();
            } else {
                let _ = builder.without_time().try_init();
            }
        }
        Some(LogSink::Callback(callback)) => {
            let callback = Arc::clone(callback);
            let builder = tracing_subscriber::fmt()
                .with_max_level(level)
                .with_ansi(false)
                .with_writer(move || CallbackWriter(Arc::clone(&callback)));
            if config.self_tstamp {
                let _ = builder.try_init();
            } else {
                let _ = builder.without_time().try_init();
            }
        }
        None => {
            let builder = tracing_subscriber::fmt()
                .with_max_level(level)
                .with_writer(io::stderr);
            if config.self_tstamp {
                let _ = builder.try_init();
            } else {
                let _ = builder.without_time().try_init();
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn callback_writer_strips_newlines() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = Arc::clone(&seen);
            Arc::new(move |line: &str| seen.lock().unwrap().push(line.to_string()))
                as Arc<dyn Fn(&str) + Send + Sync>
        };
        let mut writer = CallbackWriter(sink);
        writer.write_all(b"hello world\n").unwrap();
        writer.write_all(b"\n").unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["hello world".to_string()]);
    }

    #[test]
    fn bad_log_file_is_reported() {
        let mut config = Config::default();
        config.log = Some(LogSink::File("/nonexistent-dir/starling.log".into()));
        assert!(matches!(
            install_log_sink(&config),
            Err(GcsError::Protocol(_))
        ));
    }
}
