//! env_logger setup with a sink that can be retargeted after a detach.

use crate::config::types::{DaemonError, LogTarget, Result};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub const ENV_LOG: &str = "AUDIOD_LOG";
pub const DETACHED_LOG_NAME: &str = "daemon.log";

/// Shared writer behind the logger; `retarget` swaps it in place.
#[derive(Clone)]
pub struct LogSink(Arc<Mutex<Box<dyn Write + Send>>>);

impl LogSink {
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self(Arc::new(Mutex::new(writer)))
    }

    pub fn retarget(&self, writer: Box<dyn Write + Send>) {
        if let Ok(mut current) = self.0.lock() {
            let _ = current.flush();
            *current = writer;
        }
    }
}

impl Write for LogSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.0.lock() {
            Ok(mut writer) => writer.write(buf),
            // A panicking writer must not take logging down with it
            Err(_) => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.0.lock() {
            Ok(mut writer) => writer.flush(),
            Err(_) => Ok(()),
        }
    }
}

/// File `auto` resolves to once detached
pub fn detached_log_path(runtime_dir: &Path) -> PathBuf {
    runtime_dir.join(DETACHED_LOG_NAME)
}

/// Writer for `target`. `auto` means stderr attached, the runtime log detached.
pub fn open_target(
    target: &LogTarget,
    detached: bool,
    runtime_dir: &Path,
) -> Result<Box<dyn Write + Send>> {
    let file = |path: &Path| -> Result<Box<dyn Write + Send>> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| {
                DaemonError::Config(format!("Failed to open log file {}: {}", path.display(), e))
            })?;
        Ok(Box::new(file))
    };

    match target {
        LogTarget::Auto if detached => file(&detached_log_path(runtime_dir)),
        LogTarget::Auto | LogTarget::Stderr => Ok(Box::new(std::io::stderr())),
        LogTarget::File(path) => file(path),
        LogTarget::Null => Ok(Box::new(std::io::sink())),
    }
}

/// Install the global logger. `level` uses env_logger filter syntax and is
/// overridden by `AUDIOD_LOG`.
pub fn init(level: &str, sink: LogSink, instance_tag: &str) -> Result<()> {
    let mut builder = env_logger::Builder::new();
    builder.parse_filters(level);
    if let Ok(filters) = std::env::var(ENV_LOG) {
        builder.parse_filters(&filters);
    }

    let tag = instance_tag.to_string();
    builder.format(move |buf, record| {
        writeln!(
            buf,
            "{} [{}] {:<5} {}: {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            tag,
            record.level(),
            record.target(),
            record.args()
        )
    });
    builder.target(env_logger::Target::Pipe(Box::new(sink)));
    builder
        .try_init()
        .map_err(|e| DaemonError::Config(format!("Failed to initialize logging: {}", e)))
}
