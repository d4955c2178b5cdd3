//! The per-request logging channel.
//!
//! Every build run carries a [`RunLogger`] capability. On the controller
//! side it forwards to the engine's [`BuildLogger`]; inside a worker it is
//! rebuilt to post `log` replies tagged with the message id of the current
//! process-file call, which routes each record back to the exact
//! originating request.
//!
//! Debug records are suppressed at the source when the run's `debug` flag
//! is off, so they never cross the thread boundary.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ErrorRecord;
use crate::value::Value;

/// Severity of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Debug,
}

/// The payload of a log record: plain text or an error.
#[derive(Debug, Clone, PartialEq)]
pub enum LogMessage {
    Text(String),
    Error(ErrorRecord),
}

impl LogMessage {
    /// The human-readable text of this record.
    pub fn text(&self) -> &str {
        match self {
            LogMessage::Text(text) => text,
            LogMessage::Error(record) => &record.message,
        }
    }
}

impl fmt::Display for LogMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogMessage::Text(text) => f.write_str(text),
            LogMessage::Error(record) => write!(f, "{record}"),
        }
    }
}

impl From<&str> for LogMessage {
    fn from(text: &str) -> LogMessage {
        LogMessage::Text(text.to_string())
    }
}

impl From<String> for LogMessage {
    fn from(text: String) -> LogMessage {
        LogMessage::Text(text)
    }
}

impl From<ErrorRecord> for LogMessage {
    fn from(record: ErrorRecord) -> LogMessage {
        LogMessage::Error(record)
    }
}

/// The engine's logger, supplied at pool construction.
pub trait BuildLogger: Send + Sync {
    fn log(&self, level: LogLevel, message: &LogMessage, data: Option<&Value>);
}

type LogSink = Arc<dyn Fn(LogLevel, LogMessage, Option<Value>) + Send + Sync>;

/// The logging capability attached to a run.
///
/// Cheap to clone; clones share the same sink.
#[derive(Clone)]
pub struct RunLogger {
    debug_enabled: bool,
    sink: LogSink,
}

impl RunLogger {
    /// A logger that forwards every record to `logger` (controller side).
    pub fn forwarding(logger: Arc<dyn BuildLogger>, debug_enabled: bool) -> RunLogger {
        RunLogger {
            debug_enabled,
            sink: Arc::new(move |level, message, data| {
                logger.log(level, &message, data.as_ref());
            }),
        }
    }

    /// A logger over a raw sink (worker side posts replies through this).
    pub(crate) fn from_sink(sink: LogSink, debug_enabled: bool) -> RunLogger {
        RunLogger {
            debug_enabled,
            sink,
        }
    }

    /// A logger that drops everything. Useful as a placeholder.
    pub fn discard() -> RunLogger {
        RunLogger {
            debug_enabled: false,
            sink: Arc::new(|_, _, _| {}),
        }
    }

    pub(crate) fn with_debug(mut self, debug_enabled: bool) -> RunLogger {
        self.debug_enabled = debug_enabled;
        self
    }

    /// Logs a message at its natural level: errors at `error`, text at
    /// `info`.
    pub fn log(&self, message: impl Into<LogMessage>, data: Option<Value>) {
        let message = message.into();
        let level = match &message {
            LogMessage::Error(_) => LogLevel::Error,
            LogMessage::Text(_) => LogLevel::Info,
        };
        self.emit(level, message, data);
    }

    pub fn info(&self, message: impl Into<LogMessage>, data: Option<Value>) {
        self.emit(LogLevel::Info, message.into(), data);
    }

    pub fn warn(&self, message: impl Into<LogMessage>, data: Option<Value>) {
        self.emit(LogLevel::Warning, message.into(), data);
    }

    pub fn error(&self, message: impl Into<LogMessage>, data: Option<Value>) {
        self.emit(LogLevel::Error, message.into(), data);
    }

    /// Suppressed entirely when the run's `debug` flag is off.
    pub fn debug(&self, message: impl Into<LogMessage>, data: Option<Value>) {
        if !self.debug_enabled {
            return;
        }
        self.emit(LogLevel::Debug, message.into(), data);
    }

    pub fn debug_enabled(&self) -> bool {
        self.debug_enabled
    }

    /// Delivers an already-leveled record straight to the sink. Used when
    /// replaying records that arrive over the wire.
    pub(crate) fn emit(&self, level: LogLevel, message: LogMessage, data: Option<Value>) {
        let sink = self.sink.as_ref();
        sink(level, message, data);
    }
}

impl fmt::Debug for RunLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunLogger")
            .field("debug_enabled", &self.debug_enabled)
            .finish_non_exhaustive()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
