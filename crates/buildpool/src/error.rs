//! Error taxonomy for the worker pool, and the record form errors take when
//! they cross the worker boundary.
//!
//! Errors travel as data: an [`ErrorRecord`] carries `name`, `message`, an
//! optional `stack` (preserved verbatim), and arbitrary custom properties.
//! Custom properties survive the round trip; this is the record-based
//! transport strategy and the one this crate commits to. On receipt,
//! [`reconstruct`] maps the record's `name` back to the matching
//! [`PoolError`] kind; any unrecognized name reconstructs as the generic
//! [`PoolError::Plugin`] carrying the record untouched.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Receives out-of-band worker errors: `(worker_id, error)`.
///
/// Wired into every worker at pool construction. Fired for unexpected worker
/// exits and for protocol-level errors that are not tied to a pending call.
pub type ErrorSink = Arc<dyn Fn(usize, PoolError) + Send + Sync>;

// ── Error record (wire form) ─────────────────────────────────────────────────

/// An error as transported between threads and exposed to plugin code.
///
/// Serialized with the obvious JSON shape so the embedding engine can log
/// records directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// The error kind, e.g. `ModuleNotFound` or a plugin-defined name.
    pub name: String,
    /// Human-readable description.
    pub message: String,
    /// Stack text, if the producer attached one. Never rewritten in transit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    /// Custom properties attached by the producer.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub props: BTreeMap<String, Value>,
}

impl ErrorRecord {
    /// A record with the given kind name and message.
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> ErrorRecord {
        ErrorRecord {
            name: name.into(),
            message: message.into(),
            stack: None,
            props: BTreeMap::new(),
        }
    }

    /// A generic record (name `Error`) with the given message.
    pub fn msg(message: impl Into<String>) -> ErrorRecord {
        ErrorRecord::new("Error", message)
    }

    /// Attaches a custom property.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> ErrorRecord {
        self.props.insert(key.into(), value.into());
        self
    }

    /// Attaches stack text.
    pub fn with_stack(mut self, stack: impl Into<String>) -> ErrorRecord {
        self.stack = Some(stack.into());
        self
    }

    /// Reads a custom property.
    pub fn prop(&self, key: &str) -> Option<&Value> {
        self.props.get(key)
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for ErrorRecord {}

impl From<&str> for ErrorRecord {
    fn from(message: &str) -> ErrorRecord {
        ErrorRecord::msg(message)
    }
}

impl From<String> for ErrorRecord {
    fn from(message: String) -> ErrorRecord {
        ErrorRecord::msg(message)
    }
}

impl From<std::io::Error> for ErrorRecord {
    fn from(err: std::io::Error) -> ErrorRecord {
        ErrorRecord::new("IoError", err.to_string())
    }
}

// ── Pool error taxonomy ──────────────────────────────────────────────────────

/// Exit code reported when a worker thread dies by panicking.
pub const PANIC_EXIT_CODE: i32 = 101;

/// Everything that can go wrong in the pool.
///
/// All variants are cloneable because a single failure (worker exit,
/// termination) fans out to every pending caller on that worker.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PoolError {
    /// The pool was used after `dispose()`.
    #[error("the worker pool has been disposed")]
    PoolDisposed,

    /// Invalid construction parameters (cwd, concurrency).
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Module resolution failed on a worker.
    #[error("cannot find module \"{module_id}\" on worker {worker_id}")]
    ModuleNotFound { worker_id: usize, module_id: String },

    /// Wraps any error raised while resolving or importing a module.
    /// The inner error survives as `source()`.
    #[error("Error importing module: {module_id}: {source}")]
    ModuleImportFailed {
        module_id: String,
        #[source]
        source: Box<PoolError>,
    },

    /// The import succeeded but did not yield a file processor.
    #[error("{0}")]
    InvalidProcessor(String),

    /// A plugin produced an output that is not a valid file.
    #[error("{0}")]
    InvalidFile(String),

    /// An error raised by plugin code, carried verbatim.
    #[error("{0}")]
    Plugin(ErrorRecord),

    /// A worker thread exited without being asked to.
    #[error("worker thread exited unexpectedly with code {code}")]
    UnexpectedExit { code: i32 },

    /// The operation was cancelled because the worker is terminating.
    #[error("the worker is terminating")]
    Terminating,

    /// A reply referenced an unknown message id, or a message arrived out
    /// of contract.
    #[error("protocol error: {0}")]
    Protocol(String),
}

// ── Record conversion ────────────────────────────────────────────────────────

fn record_to_value(record: &ErrorRecord) -> Value {
    let mut entries: BTreeMap<String, Value> = BTreeMap::new();
    entries.insert("name".to_string(), Value::str(&record.name[..]));
    entries.insert("message".to_string(), Value::str(&record.message[..]));
    if let Some(stack) = &record.stack {
        entries.insert("stack".to_string(), Value::str(&stack[..]));
    }
    if !record.props.is_empty() {
        entries.insert(
            "props".to_string(),
            Value::Map(Arc::new(record.props.clone())),
        );
    }
    Value::Map(Arc::new(entries))
}

fn value_to_record(value: &Value) -> Option<ErrorRecord> {
    let name = value.get("name")?.as_str()?.to_string();
    let message = value.get("message")?.as_str()?.to_string();
    let stack = value
        .get("stack")
        .and_then(Value::as_str)
        .map(str::to_string);
    let props = match value.get("props") {
        Some(Value::Map(entries)) => entries.as_ref().clone(),
        _ => BTreeMap::new(),
    };
    Some(ErrorRecord {
        name,
        message,
        stack,
        props,
    })
}

impl From<&PoolError> for ErrorRecord {
    fn from(err: &PoolError) -> ErrorRecord {
        match err {
            PoolError::Plugin(record) => record.clone(),
            PoolError::PoolDisposed => ErrorRecord::new("PoolDisposed", err.to_string()),
            PoolError::InvalidConfig(message) => ErrorRecord::new("InvalidConfig", message.clone()),
            PoolError::ModuleNotFound {
                worker_id,
                module_id,
            } => ErrorRecord::new("ModuleNotFound", err.to_string())
                .with("workerId", *worker_id as i64)
                .with("moduleId", module_id.as_str()),
            PoolError::ModuleImportFailed { module_id, source } => {
                ErrorRecord::new("ModuleImportFailed", err.to_string())
                    .with("moduleId", module_id.as_str())
                    .with("cause", record_to_value(&ErrorRecord::from(source.as_ref())))
            }
            PoolError::InvalidProcessor(message) => {
                ErrorRecord::new("InvalidProcessor", message.clone())
            }
            PoolError::InvalidFile(message) => ErrorRecord::new("InvalidFile", message.clone()),
            PoolError::UnexpectedExit { code } => {
                ErrorRecord::new("UnexpectedExit", err.to_string()).with("code", i64::from(*code))
            }
            PoolError::Terminating => ErrorRecord::new("Terminating", err.to_string()),
            PoolError::Protocol(message) => ErrorRecord::new("Protocol", message.clone()),
        }
    }
}

/// Rebuilds a [`PoolError`] from its transported record.
///
/// Known kind names map back to their variants; anything else is a plugin
/// error and keeps the record as-is, stack and custom properties included.
pub fn reconstruct(record: ErrorRecord) -> PoolError {
    match record.name.as_str() {
        "PoolDisposed" => PoolError::PoolDisposed,
        "InvalidConfig" => PoolError::InvalidConfig(record.message),
        "ModuleNotFound" => PoolError::ModuleNotFound {
            worker_id: record
                .prop("workerId")
                .and_then(Value::as_int)
                .unwrap_or(0) as usize,
            module_id: record
                .prop("moduleId")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        },
        "ModuleImportFailed" => {
            let module_id = record
                .prop("moduleId")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let source = record
                .prop("cause")
                .and_then(value_to_record)
                .map(reconstruct)
                .unwrap_or_else(|| PoolError::Plugin(ErrorRecord::msg(record.message.clone())));
            PoolError::ModuleImportFailed {
                module_id,
                source: Box::new(source),
            }
        }
        "InvalidProcessor" => PoolError::InvalidProcessor(record.message),
        "InvalidFile" => PoolError::InvalidFile(record.message),
        "UnexpectedExit" => PoolError::UnexpectedExit {
            code: record.prop("code").and_then(Value::as_int).unwrap_or(-1) as i32,
        },
        "Terminating" => PoolError::Terminating,
        "Protocol" => PoolError::Protocol(record.message),
        _ => PoolError::Plugin(record),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_kinds_round_trip() {
        let originals = vec![
            PoolError::PoolDisposed,
            PoolError::InvalidConfig("concurrency must be a positive integer".to_string()),
            PoolError::ModuleNotFound {
                worker_id: 3,
                module_id: "style-plugin".to_string(),
            },
            PoolError::InvalidProcessor("The module exported 7".to_string()),
            PoolError::InvalidFile("Invalid output file: \"\"".to_string()),
            PoolError::UnexpectedExit { code: 101 },
            PoolError::Terminating,
            PoolError::Protocol("reply for unknown message id 9".to_string()),
        ];
        for original in originals {
            let record = ErrorRecord::from(&original);
            let rebuilt = reconstruct(record);
            assert_eq!(rebuilt, original, "kind must survive the round trip");
        }
    }

    #[test]
    fn test_import_failed_preserves_inner_kind() {
        let original = PoolError::ModuleImportFailed {
            module_id: "non-existent".to_string(),
            source: Box::new(PoolError::ModuleNotFound {
                worker_id: 1,
                module_id: "non-existent".to_string(),
            }),
        };
        assert!(
            original
                .to_string()
                .starts_with("Error importing module: non-existent"),
            "message must carry the import prefix: {original}"
        );

        let rebuilt = reconstruct(ErrorRecord::from(&original));
        assert_eq!(rebuilt, original);
        match rebuilt {
            PoolError::ModuleImportFailed { source, .. } => {
                assert!(matches!(*source, PoolError::ModuleNotFound { .. }));
            }
            other => panic!("expected ModuleImportFailed, got {other:?}"),
        }
    }

    #[test]
    fn test_plugin_record_preserves_custom_props_and_stack() {
        let record = ErrorRecord::new("DiskFull", "no space left")
            .with_stack("at write (disk.rs:10)")
            .with("device", "sda1")
            .with("freeBytes", 0i64);
        let original = PoolError::Plugin(record.clone());

        let rebuilt = reconstruct(ErrorRecord::from(&original));
        match rebuilt {
            PoolError::Plugin(r) => {
                assert_eq!(r, record);
                assert_eq!(r.stack.as_deref(), Some("at write (disk.rs:10)"));
                assert_eq!(r.prop("device"), Some(&Value::str("sda1")));
            }
            other => panic!("expected Plugin, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_name_reconstructs_as_plugin() {
        let record = ErrorRecord::new("SomethingElse", "boom");
        match reconstruct(record.clone()) {
            PoolError::Plugin(r) => assert_eq!(r, record),
            other => panic!("expected Plugin, got {other:?}"),
        }
    }

    #[test]
    fn test_record_serializes_without_empty_fields() {
        let record = ErrorRecord::msg("plain");
        let json = serde_json::to_string(&record).expect("serialize ErrorRecord");
        assert!(!json.contains("stack"), "empty stack must be omitted: {json}");
        assert!(!json.contains("props"), "empty props must be omitted: {json}");
        let back: ErrorRecord = serde_json::from_str(&json).expect("deserialize ErrorRecord");
        assert_eq!(back, record);
    }
}
