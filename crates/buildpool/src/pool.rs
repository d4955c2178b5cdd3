//! The worker pool: a fixed set of worker threads, plugin registration
//! across all of them, and round-robin dispatch of file processing.
//!
//! ## Dispatch
//!
//! Processor imports broadcast to every worker (each worker holds its own
//! processor registry). Processing picks workers with a strict round-robin
//! cursor: deterministic, fair in dispatch, and sufficient because each
//! call is a single file. A failing call surfaces its error to the caller
//! and is never retried on another worker; plugin code may have side
//! effects, and silently re-running it would corrupt user expectations.
//!
//! ## Disposal
//!
//! `dispose()` is idempotent and absorbing: workers are detached, then
//! terminated in parallel. Every pending request anywhere in the pool is
//! rejected. Dropping the pool (and every proxy cloned from it) performs a
//! best-effort dispose.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::debug;

use crate::context::BuildContext;
use crate::error::{ErrorSink, PoolError};
use crate::file::File;
use crate::protocol::Reply;
use crate::value::Value;
use crate::worker::{FileStream, WorkerHandle};

// ── Module references ─────────────────────────────────────────────────────────

/// Names a plugin module to import, optionally with factory data.
#[derive(Debug, Clone)]
pub struct ModuleRef {
    pub module_id: String,
    pub data: Option<Value>,
}

impl ModuleRef {
    pub fn new(module_id: impl Into<String>) -> ModuleRef {
        ModuleRef {
            module_id: module_id.into(),
            data: None,
        }
    }

    /// Attaches data; the module's factory receives it at import time.
    pub fn with_data(mut self, data: impl Into<Value>) -> ModuleRef {
        self.data = Some(data.into());
        self
    }
}

impl From<&str> for ModuleRef {
    fn from(module_id: &str) -> ModuleRef {
        ModuleRef::new(module_id)
    }
}

impl From<String> for ModuleRef {
    fn from(module_id: String) -> ModuleRef {
        ModuleRef::new(module_id)
    }
}

// ── Pool ──────────────────────────────────────────────────────────────────────

struct PoolInner {
    cwd: String,
    workers: Mutex<Vec<Arc<WorkerHandle>>>,
    cursor: AtomicUsize,
    module_counter: AtomicU64,
    disposed: AtomicBool,
}

impl PoolInner {
    fn select_worker(&self) -> Result<Arc<WorkerHandle>, PoolError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(PoolError::PoolDisposed);
        }
        let workers = self.workers.lock().expect("worker list poisoned");
        if workers.is_empty() {
            return Err(PoolError::PoolDisposed);
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % workers.len();
        Ok(Arc::clone(&workers[index]))
    }

    fn snapshot(&self) -> Vec<Arc<WorkerHandle>> {
        self.workers.lock().expect("worker list poisoned").clone()
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let workers = {
            let mut guard = self.workers.lock().expect("worker list poisoned");
            std::mem::take(&mut *guard)
        };
        debug!(count = workers.len(), "disposing worker pool");
        thread::scope(|scope| {
            for worker in &workers {
                scope.spawn(move || {
                    worker.terminate();
                });
            }
        });
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// A fixed-size pool of file-processing workers.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Creates `context.concurrency` workers resolving modules against
    /// `context.cwd`. Worker errors with no awaiting caller are delivered
    /// to `error_sink` as `(worker_id, error)`.
    pub fn new(context: &BuildContext, error_sink: ErrorSink) -> Result<WorkerPool, PoolError> {
        if context.concurrency == 0 {
            return Err(PoolError::InvalidConfig(
                "concurrency must be a positive integer".to_string(),
            ));
        }
        if context.cwd.trim().is_empty() {
            return Err(PoolError::InvalidConfig(
                "cwd must be a non-empty string".to_string(),
            ));
        }

        let workers: Vec<Arc<WorkerHandle>> = (0..context.concurrency)
            .map(|id| Arc::new(WorkerHandle::spawn(id, Arc::clone(&error_sink))))
            .collect();
        debug!(concurrency = context.concurrency, cwd = %context.cwd, "worker pool created");

        Ok(WorkerPool {
            inner: Arc::new(PoolInner {
                cwd: context.cwd.clone(),
                workers: Mutex::new(workers),
                cursor: AtomicUsize::new(0),
                module_counter: AtomicU64::new(1),
                disposed: AtomicBool::new(false),
            }),
        })
    }

    /// The number of live workers (0 after dispose).
    pub fn size(&self) -> usize {
        self.inner.workers.lock().expect("worker list poisoned").len()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    fn ensure_not_disposed(&self) -> Result<(), PoolError> {
        if self.is_disposed() {
            return Err(PoolError::PoolDisposed);
        }
        Ok(())
    }

    /// Imports a file processor on every worker and returns a proxy that
    /// dispatches files round-robin.
    ///
    /// The proxy's name comes from the first worker's reply; all workers
    /// import the same module, so the names agree. The first worker to fail
    /// fails the whole call.
    pub fn import_file_processor(
        &self,
        module: impl Into<ModuleRef>,
    ) -> Result<ProcessorProxy, PoolError> {
        let ModuleRef { module_id, data } = module.into();
        self.ensure_not_disposed()?;
        let module_uid = self.inner.module_counter.fetch_add(1, Ordering::Relaxed);

        // Broadcast first, then await each reply; the workers import in
        // parallel.
        let workers = self.inner.snapshot();
        let pending: Vec<_> = workers
            .iter()
            .map(|worker| {
                worker.begin_import_file_processor(
                    module_uid,
                    &module_id,
                    &self.inner.cwd,
                    data.clone(),
                )
            })
            .collect::<Result<_, _>>()?;

        let mut name: Option<String> = None;
        for reply in pending {
            match reply.wait()? {
                Reply::FileProcessorImported { name: reported } => {
                    name.get_or_insert(reported);
                }
                other => {
                    return Err(PoolError::Protocol(format!(
                        "unexpected import reply: {other:?}"
                    )))
                }
            }
        }

        debug!(module_uid, module_id = %module_id, "processor imported on all workers");
        Ok(ProcessorProxy {
            name: name.unwrap_or_default(),
            module_uid,
            inner: Arc::clone(&self.inner),
        })
    }

    /// Imports a module on every worker for its side effects (setup hooks,
    /// global state). Returns once all workers acknowledge.
    pub fn import_module(&self, module: impl Into<ModuleRef>) -> Result<(), PoolError> {
        let ModuleRef { module_id, data } = module.into();
        self.ensure_not_disposed()?;

        let workers = self.inner.snapshot();
        let pending: Vec<_> = workers
            .iter()
            .map(|worker| worker.begin_import_module(&module_id, &self.inner.cwd, data.clone()))
            .collect::<Result<_, _>>()?;

        for reply in pending {
            match reply.wait()? {
                Reply::Finished => {}
                other => {
                    return Err(PoolError::Protocol(format!(
                        "unexpected import reply: {other:?}"
                    )))
                }
            }
        }
        Ok(())
    }

    /// Terminates every worker and rejects everything pending. Idempotent;
    /// later calls are no-ops.
    pub fn dispose(&self) {
        self.inner.dispose();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.size())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

// ── Processor proxy ───────────────────────────────────────────────────────────

/// A handle to a processor registered on every worker in the pool.
///
/// Each [`process`](ProcessorProxy::process) call picks the next worker
/// round-robin and streams that worker's outputs back.
#[derive(Clone)]
pub struct ProcessorProxy {
    name: String,
    module_uid: u64,
    inner: Arc<PoolInner>,
}

impl ProcessorProxy {
    /// The processor's declared name (from the first worker's reply; may be
    /// empty).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The pool-scoped id this processor is registered under.
    pub fn module_uid(&self) -> u64 {
        self.module_uid
    }

    /// Processes one file, returning the lazy stream of output files.
    ///
    /// The file is transport-prepared in place: exclusively-owned contents
    /// move to the worker and the caller's buffer is left empty; shared
    /// views are copied and left intact.
    pub fn process(&self, file: &mut File, run: &BuildContext) -> Result<FileStream, PoolError> {
        let worker = self.inner.select_worker()?;
        worker.process_file(self.module_uid, file, run)
    }
}

impl std::fmt::Debug for ProcessorProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorProxy")
            .field("name", &self.name)
            .field("module_uid", &self.module_uid)
            .finish()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
