//! Structured logging setup: a file-backed `tracing` layer that can be
//! swapped out in place on SIGHUP (log rotation) via a `reload::Handle`.

use std::fs::OpenOptions;
use std::path::Path;

use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{fmt, prelude::*, reload, EnvFilter};

pub type FileFmtLayer = fmt::Layer<tracing_subscriber::Registry, fmt::format::DefaultFields, fmt::format::Format, BoxMakeWriter>;

pub type LogReloadHandle = reload::Handle<FileFmtLayer, tracing_subscriber::Registry>;

const DEFAULT_LOG_FILTER: &str = "info";

cfg_if::cfg_if! {
    if #[cfg(target_os = "macos")] {
        pub const DEFAULT_LOG_PATH: &str = "/Library/Logs/apctld/apctld.log";
    } else {
        pub const DEFAULT_LOG_PATH: &str = "/var/log/apctld.log";
    }
}

/// Builds a file-writing layer, or falls back to stdout for `-`.
pub fn make_file_fmt_layer(log_path: &Path) -> std::io::Result<FileFmtLayer> {
    let writer = if log_path == Path::new("-") {
        BoxMakeWriter::new(std::io::stdout)
    } else {
        let file = OpenOptions::new().create(true).append(true).open(log_path)?;
        BoxMakeWriter::new(file)
    };
    Ok(fmt::layer().with_writer(writer).with_ansi(false))
}

/// Initializes the global subscriber, returning a handle the caller can use
/// to swap the underlying writer on SIGHUP without restarting the process.
pub fn init(log_path: &Path) -> std::io::Result<LogReloadHandle> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let layer = make_file_fmt_layer(log_path)?;
    let (reload_layer, handle) = reload::Layer::new(layer);
    tracing_subscriber::registry().with(reload_layer).with(filter).init();
    Ok(handle)
}

/// Reopens the log file at `log_path` and swaps it into the running
/// subscriber. Called on SIGHUP after an external log rotator has moved the
/// old file aside.
pub fn reload(handle: &LogReloadHandle, log_path: &Path) -> std::io::Result<()> {
    let layer = make_file_fmt_layer(log_path)?;
    handle.reload(layer).map_err(std::io::Error::other)
}
