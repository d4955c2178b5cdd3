//! The per-worker runtime.
//!
//! Each worker thread runs one [`Executor`]: it announces itself online,
//! then blocks on its request queue and dispatches until the controller
//! closes the queue. The executor owns the worker's processor registry
//! (moduleUID to processor) and is the only code that invokes plugin
//! functions.
//!
//! Failures split two ways. An `Err` from plugin or registry code becomes
//! an `error` reply for the originating request. A panic is not caught: it
//! unwinds the thread, and the controller side observes the death as an
//! unexpected exit.

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::debug;

use crate::context::{BuildContext, RunMessage};
use crate::error::{reconstruct, ErrorRecord, PoolError};
use crate::file::{normalize_output, File};
use crate::logging::RunLogger;
use crate::protocol::{Reply, ReplyEnvelope, Request, RequestEnvelope, WorkerMessage};
use crate::registry;

/// Spawns the executor thread for worker `worker_id`.
pub(crate) fn spawn(
    worker_id: usize,
    requests: mpsc::Receiver<RequestEnvelope>,
    outbound: mpsc::Sender<WorkerMessage>,
) -> JoinHandle<i32> {
    thread::Builder::new()
        .name(format!("buildpool-worker-{worker_id}"))
        .spawn(move || Executor::new(worker_id, requests, outbound).run())
        .expect("failed to spawn worker thread")
}

struct Executor {
    worker_id: usize,
    requests: mpsc::Receiver<RequestEnvelope>,
    outbound: mpsc::Sender<WorkerMessage>,
    processors: HashMap<u64, registry::ProcessorFn>,
}

impl Executor {
    fn new(
        worker_id: usize,
        requests: mpsc::Receiver<RequestEnvelope>,
        outbound: mpsc::Sender<WorkerMessage>,
    ) -> Executor {
        Executor {
            worker_id,
            requests,
            outbound,
            processors: HashMap::new(),
        }
    }

    fn run(mut self) -> i32 {
        let _ = self.outbound.send(WorkerMessage::Online);
        debug!(worker = self.worker_id, "executor online");

        while let Ok(envelope) = self.requests.recv() {
            self.dispatch(envelope);
        }

        // The request queue closed: the controller asked us to shut down.
        debug!(worker = self.worker_id, "executor draining out");
        let _ = self.outbound.send(WorkerMessage::Exiting { code: 0 });
        0
    }

    fn dispatch(&mut self, envelope: RequestEnvelope) {
        let RequestEnvelope { id, request } = envelope;
        let result = match request {
            Request::ImportFileProcessor {
                module_uid,
                module_id,
                cwd,
                data,
            } => self.import_file_processor(module_uid, &module_id, &cwd, data),
            Request::ImportModule {
                module_id,
                cwd,
                data,
            } => registry::import_module(self.worker_id, &module_id, &cwd, data)
                .map(|()| Reply::Finished),
            Request::ProcessFile {
                module_uid,
                file,
                run,
            } => self.process_file(id, module_uid, file, run),
        };

        let reply = match result {
            Ok(reply) => reply,
            Err(err) => Reply::Error {
                error: ErrorRecord::from(&err),
            },
        };
        self.send_reply(id, reply);
    }

    fn send_reply(&self, to: u64, reply: Reply) {
        let _ = self
            .outbound
            .send(WorkerMessage::Reply(ReplyEnvelope { to, reply }));
    }

    fn import_file_processor(
        &mut self,
        module_uid: u64,
        module_id: &str,
        cwd: &str,
        data: Option<crate::value::Value>,
    ) -> Result<Reply, PoolError> {
        let processor = registry::import_file_processor(self.worker_id, module_id, cwd, data)?;
        let name = processor.name().to_string();
        self.processors.insert(module_uid, processor);
        debug!(
            worker = self.worker_id,
            module_uid, module_id, "processor registered"
        );
        Ok(Reply::FileProcessorImported { name })
    }

    /// Runs the processor over one file, streaming each output back as a
    /// `file` reply before the terminal `finished`.
    fn process_file(
        &mut self,
        id: u64,
        module_uid: u64,
        file: File,
        run: RunMessage,
    ) -> Result<Reply, PoolError> {
        let processor = self
            .processors
            .get(&module_uid)
            .ok_or_else(|| {
                PoolError::Protocol(format!("no processor registered for module UID {module_uid}"))
            })?
            .clone();

        // Rebuild the run around a logger that tunnels records back to
        // this exact request.
        let outbound = self.outbound.clone();
        let debug_enabled = run.debug;
        let log = RunLogger::from_sink(
            Arc::new(move |level, message, data| {
                let _ = outbound.send(WorkerMessage::Reply(ReplyEnvelope {
                    to: id,
                    reply: Reply::Log {
                        level,
                        message,
                        data,
                    },
                }));
            }),
            debug_enabled,
        );
        let run = BuildContext::from_message(run, log);

        let output = processor.call(file, &run).map_err(reconstruct)?;
        for produced in output.into_output_iter() {
            let file = normalize_output(produced.map_err(reconstruct)?)?;
            self.send_reply(id, Reply::File { file });
        }
        Ok(Reply::Finished)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
