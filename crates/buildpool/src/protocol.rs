//! Message framing between the controller and a worker.
//!
//! Every request is stamped with a process-wide monotonic id; every reply
//! carries `to`, the id of the request it answers. A request is answered by
//! zero or more non-terminal replies (`File`, `Log`) followed by exactly one
//! terminal reply (`FileProcessorImported`, `Finished`, or `Error`).

use std::sync::atomic::{AtomicU64, Ordering};

use crate::context::RunMessage;
use crate::error::ErrorRecord;
use crate::file::File;
use crate::logging::{LogLevel, LogMessage};
use crate::value::Value;

static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates the next process-wide message id.
pub(crate) fn next_message_id() -> u64 {
    NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed)
}

/// A request sent to a worker.
#[derive(Debug)]
pub(crate) enum Request {
    /// Import a module and register its processor under `module_uid`.
    ImportFileProcessor {
        module_uid: u64,
        module_id: String,
        cwd: String,
        data: Option<Value>,
    },
    /// Import a module for its side effects only.
    ImportModule {
        module_id: String,
        cwd: String,
        data: Option<Value>,
    },
    /// Run the registered processor over one file.
    ProcessFile {
        module_uid: u64,
        file: File,
        run: RunMessage,
    },
}

#[derive(Debug)]
pub(crate) struct RequestEnvelope {
    pub id: u64,
    pub request: Request,
}

/// A reply posted by a worker for a specific request.
#[derive(Debug, PartialEq)]
pub(crate) enum Reply {
    /// Terminal ack of `ImportFileProcessor`, carrying the processor's
    /// declared name (possibly empty).
    FileProcessorImported { name: String },
    /// Terminal: the request completed and the stream (if any) is done.
    Finished,
    /// One output file produced by a processor.
    File { file: File },
    /// A log record from plugin code, routed to the originating call.
    Log {
        level: LogLevel,
        message: LogMessage,
        data: Option<Value>,
    },
    /// Terminal: the request failed.
    Error { error: ErrorRecord },
}

impl Reply {
    /// Terminal replies settle the request and release its pending entry.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Reply::FileProcessorImported { .. } | Reply::Finished | Reply::Error { .. }
        )
    }
}

#[derive(Debug)]
pub(crate) struct ReplyEnvelope {
    pub to: u64,
    pub reply: Reply,
}

/// Everything a worker thread sends to the controller.
#[derive(Debug)]
pub(crate) enum WorkerMessage {
    /// The worker finished starting up and accepts requests.
    Online,
    Reply(ReplyEnvelope),
    /// The dispatch loop ended on purpose.
    Exiting { code: i32 },
}

// ── Tests ─────────────────────────────────────────────────────────────────────
