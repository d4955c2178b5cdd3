//! Per-build invocation data.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::thread;

use crate::file::ChangedFile;
use crate::logging::{BuildLogger, RunLogger};

/// Data describing one build run, shared with every processor call.
///
/// Exactly one of `full` / `partial()` holds: a partial build carries the
/// set of changed files, a full build rebuilds everything.
#[derive(Debug, Clone)]
pub struct BuildContext {
    /// Directory plugin modules are resolved against. Never blank.
    pub cwd: String,
    /// Number of worker threads. At least 1.
    pub concurrency: usize,
    pub dev: bool,
    pub debug: bool,
    pub full: bool,
    pub changed_files: Vec<ChangedFile>,
    /// The logging capability for this run.
    pub log: RunLogger,
}

impl BuildContext {
    /// A full-build context with default concurrency and the given logger.
    pub fn new(cwd: impl Into<String>, logger: Arc<dyn BuildLogger>) -> BuildContext {
        BuildContext {
            cwd: cwd.into(),
            concurrency: default_concurrency(),
            dev: false,
            debug: false,
            full: true,
            changed_files: Vec::new(),
            log: RunLogger::forwarding(logger, false),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> BuildContext {
        self.concurrency = concurrency;
        self
    }

    pub fn with_dev(mut self, dev: bool) -> BuildContext {
        self.dev = dev;
        self
    }

    /// Enables debug logging for the run (the logger's `debug` gate follows).
    pub fn with_debug(mut self, debug: bool) -> BuildContext {
        self.debug = debug;
        self.log = self.log.with_debug(debug);
        self
    }

    /// Marks this a partial build over the given change set.
    pub fn with_changed_files(mut self, changed_files: Vec<ChangedFile>) -> BuildContext {
        self.full = false;
        self.changed_files = changed_files;
        self
    }

    pub fn partial(&self) -> bool {
        !self.full
    }

    /// The form that crosses the worker boundary: the logging capability is
    /// dropped (reinstalled worker-side, bound to the message id) and change
    /// records lose their contents.
    pub(crate) fn to_message(&self) -> RunMessage {
        RunMessage {
            cwd: self.cwd.clone(),
            concurrency: self.concurrency,
            dev: self.dev,
            debug: self.debug,
            full: self.full,
            changed_files: self
                .changed_files
                .iter()
                .map(ChangedFile::without_contents)
                .collect(),
        }
    }

    /// Rebuilds the context on the worker side around a fresh logger.
    pub(crate) fn from_message(message: RunMessage, log: RunLogger) -> BuildContext {
        BuildContext {
            cwd: message.cwd,
            concurrency: message.concurrency,
            dev: message.dev,
            debug: message.debug,
            full: message.full,
            changed_files: message.changed_files,
            log,
        }
    }
}

/// The transported form of a [`BuildContext`].
#[derive(Debug, Clone)]
pub(crate) struct RunMessage {
    pub cwd: String,
    pub concurrency: usize,
    pub dev: bool,
    pub debug: bool,
    pub full: bool,
    pub changed_files: Vec<ChangedFile>,
}

/// Default worker count: one per available core.
pub fn default_concurrency() -> usize {
    thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(4)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
