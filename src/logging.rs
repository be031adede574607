//! Logging setup and the in-memory operation log.
//!
//! Runtime diagnostics go through the `tracing` ecosystem: a console fmt
//! layer plus an optional non-blocking file appender whose background
//! writer thread is owned by the returned guard. Long-running batch
//! operations additionally record their lines into an [`OperationLog`] so
//! the overall outcome can be classified after the fact.

use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::settings::{keys, Settings};

/// Severity channel of one recorded line.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogChannel {
    Verbose,
    Info,
    Warning,
    Error,
}

/// One recorded line.
#[derive(Debug, Clone)]
pub struct LogElement {
    pub channel: LogChannel,
    pub text: String,
}

/// Installs the global tracing subscriber: console output filtered by the
/// `Verbosity` setting (overridable via `RUST_LOG`) and, when
/// `FileLoggerLocalDirectory` is configured, a non-blocking daily log file
/// drained by a background writer thread. The returned guard must be kept
/// alive for the file sink to flush.
pub fn init(settings: &Settings) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let verbosity = settings.get_str(keys::VERBOSITY);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbosity.is_empty() { "info" } else { &verbosity }));

    let console = tracing_subscriber::fmt::layer().with_target(false);

    let file_dir = settings.get_str(keys::FILE_LOGGER_LOCAL_DIRECTORY);
    match file_dir.is_empty() {
        false => {
            let appender = tracing_appender::rolling::daily(Path::new(&file_dir), "vdepot.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer);
            tracing_subscriber::registry().with(filter).with(console).with(file).init();
            Some(guard)
        }
        true => {
            tracing_subscriber::registry().with(filter).with(console).init();
            None
        }
    }
}

/// In-memory recorder for one batch operation. Lines are mirrored to the
/// tracing subscriber as they arrive and kept for outcome classification
/// and the warning/error summary.
#[derive(Debug, Default)]
pub struct OperationLog {
    elements: Mutex<Vec<LogElement>>,
}

impl OperationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&self, channel: LogChannel, text: impl Into<String>) {
        let text = text.into();
        match channel {
            LogChannel::Verbose => tracing::debug!("{text}"),
            LogChannel::Info => tracing::info!("{text}"),
            LogChannel::Warning => tracing::warn!("{text}"),
            LogChannel::Error => tracing::error!("{text}"),
        }
        self.elements.lock().unwrap().push(LogElement { channel, text });
    }

    pub fn verbose(&self, text: impl Into<String>) {
        self.write(LogChannel::Verbose, text);
    }

    pub fn info(&self, text: impl Into<String>) {
        self.write(LogChannel::Info, text);
    }

    pub fn warning(&self, text: impl Into<String>) {
        self.write(LogChannel::Warning, text);
    }

    pub fn error(&self, text: impl Into<String>) {
        self.write(LogChannel::Error, text);
    }

    /// Appends another recorder's lines, preserving order. Used when a
    /// nested operation buffers its output and flushes it all at once.
    pub fn append(&self, other: &OperationLog) {
        let mut mine = self.elements.lock().unwrap();
        mine.extend(other.elements.lock().unwrap().iter().cloned());
    }

    /// Highest severity recorded so far, if anything was recorded.
    pub fn max_channel(&self) -> Option<LogChannel> {
        self.elements.lock().unwrap().iter().map(|e| e.channel).max()
    }

    /// The warning and error lines, in arrival order.
    pub fn warning_error_lines(&self) -> Vec<LogElement> {
        self.elements
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.channel >= LogChannel::Warning)
            .cloned()
            .collect()
    }

    pub fn elements(&self) -> Vec<LogElement> {
        self.elements.lock().unwrap().clone()
    }
}
