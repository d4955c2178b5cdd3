//! Controller-side handle for one worker thread.
//!
//! Construction spawns two threads: the executor (the worker proper) and a
//! router that drains the worker's outbound messages, resolving the online
//! gate and feeding replies into the channel's pending table. Request
//! operations wait on the online gate first, so callers never race the
//! worker's startup.
//!
//! Termination is forceful: pending requests are rejected, the request
//! queue is closed, and the thread is joined for its exit code. A worker
//! that dies without being asked to (a panicking plugin) is detected by the
//! router when the outbound queue disconnects; every pending request on
//! that worker is rejected with `UnexpectedExit` and the pool's error sink
//! is notified.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, warn};

use crate::channel::{ChannelState, MessageChannel, PendingReply};
use crate::context::BuildContext;
use crate::error::{ErrorSink, PoolError, PANIC_EXIT_CODE};
use crate::executor;
use crate::file::File;
use crate::logging::RunLogger;
use crate::protocol::{Reply, Request, WorkerMessage};
use crate::value::Value;

// ── Online gate ───────────────────────────────────────────────────────────────

enum GateState {
    Waiting,
    Online,
    Failed(PoolError),
}

/// Blocks request operations until the worker reports readiness. Once
/// online, stays online; a worker that dies before coming online fails the
/// gate with the exit error instead.
struct OnlineGate {
    state: Mutex<GateState>,
    ready: Condvar,
}

impl OnlineGate {
    fn new() -> OnlineGate {
        OnlineGate {
            state: Mutex::new(GateState::Waiting),
            ready: Condvar::new(),
        }
    }

    fn set_online(&self) {
        let mut state = self.state.lock().expect("online gate poisoned");
        if matches!(*state, GateState::Waiting) {
            *state = GateState::Online;
            self.ready.notify_all();
        }
    }

    fn fail(&self, err: PoolError) {
        let mut state = self.state.lock().expect("online gate poisoned");
        if matches!(*state, GateState::Waiting) {
            *state = GateState::Failed(err);
            self.ready.notify_all();
        }
    }

    fn wait(&self) -> Result<(), PoolError> {
        let mut state = self.state.lock().expect("online gate poisoned");
        loop {
            match &*state {
                GateState::Waiting => {
                    state = self.ready.wait(state).expect("online gate poisoned");
                }
                GateState::Online => return Ok(()),
                GateState::Failed(err) => return Err(err.clone()),
            }
        }
    }
}

// ── Worker handle ─────────────────────────────────────────────────────────────

pub(crate) struct WorkerHandle {
    id: usize,
    channel: MessageChannel,
    gate: Arc<OnlineGate>,
    terminated: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<i32>>>,
    router: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerHandle {
    /// Spawns the worker and its router. Worker errors that have no waiting
    /// caller are forwarded to `error_sink`.
    pub fn spawn(id: usize, error_sink: ErrorSink) -> WorkerHandle {
        let (req_tx, req_rx) = mpsc::channel();
        let (msg_tx, msg_rx) = mpsc::channel();

        let channel = MessageChannel::new(req_tx);
        let gate = Arc::new(OnlineGate::new());
        let terminated = Arc::new(AtomicBool::new(false));

        let thread = executor::spawn(id, req_rx, msg_tx);
        let router = {
            let state = channel.state();
            let gate = Arc::clone(&gate);
            let terminated = Arc::clone(&terminated);
            thread::Builder::new()
                .name(format!("buildpool-router-{id}"))
                .spawn(move || run_router(id, msg_rx, state, gate, terminated, error_sink))
                .expect("failed to spawn router thread")
        };

        WorkerHandle {
            id,
            channel,
            gate,
            terminated,
            thread: Mutex::new(Some(thread)),
            router: Mutex::new(Some(router)),
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    fn await_online(&self) -> Result<(), PoolError> {
        self.gate.wait()
    }

    /// Posts an `ImportFileProcessor` request, returning the pending reply
    /// so the pool can broadcast to all workers before waiting on any.
    pub fn begin_import_file_processor(
        &self,
        module_uid: u64,
        module_id: &str,
        cwd: &str,
        data: Option<Value>,
    ) -> Result<PendingReply, PoolError> {
        self.await_online()?;
        self.channel.send(Request::ImportFileProcessor {
            module_uid,
            module_id: module_id.to_string(),
            cwd: cwd.to_string(),
            data,
        })
    }

    /// Posts an `ImportModule` request; the terminal reply is a bare ack.
    pub fn begin_import_module(
        &self,
        module_id: &str,
        cwd: &str,
        data: Option<Value>,
    ) -> Result<PendingReply, PoolError> {
        self.await_online()?;
        self.channel.send(Request::ImportModule {
            module_id: module_id.to_string(),
            cwd: cwd.to_string(),
            data,
        })
    }

    /// Sends one file to this worker's registered processor and returns the
    /// stream of output files.
    ///
    /// The file is transport-prepared in place: owned contents move to the
    /// worker (the caller's buffer is left empty), shared views are copied.
    pub fn process_file(
        &self,
        module_uid: u64,
        file: &mut File,
        run: &BuildContext,
    ) -> Result<FileStream, PoolError> {
        self.await_online()?;
        let transported = file.take_for_transport();
        let replies = self.channel.send_stream(Request::ProcessFile {
            module_uid,
            file: transported,
            run: run.to_message(),
        })?;
        Ok(FileStream {
            replies,
            log: run.log.clone(),
        })
    }

    /// Terminates the worker: rejects everything pending, closes the
    /// request queue, and joins the thread for its exit code. Idempotent;
    /// repeated calls return 0.
    pub fn terminate(&self) -> i32 {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return 0;
        }
        debug!(worker = self.id, "terminating worker");

        self.gate.fail(PoolError::Terminating);
        self.channel.state().reject_all_pending(&PoolError::Terminating);
        self.channel.close();

        let code = match self.thread.lock().expect("worker handle poisoned").take() {
            Some(handle) => handle.join().unwrap_or(PANIC_EXIT_CODE),
            None => 0,
        };
        if let Some(router) = self.router.lock().expect("worker handle poisoned").take() {
            let _ = router.join();
        }
        debug!(worker = self.id, code, "worker terminated");
        code
    }
}

/// Drains one worker's outbound messages until the worker goes away.
fn run_router(
    id: usize,
    messages: mpsc::Receiver<WorkerMessage>,
    state: Arc<ChannelState>,
    gate: Arc<OnlineGate>,
    terminated: Arc<AtomicBool>,
    error_sink: ErrorSink,
) {
    let mut clean_exit: Option<i32> = None;

    while let Ok(message) = messages.recv() {
        match message {
            WorkerMessage::Online => {
                debug!(worker = id, "worker online");
                gate.set_online();
            }
            WorkerMessage::Reply(envelope) => {
                if let Err(err) = state.route_reply(envelope) {
                    // Not tied to any caller; surface as an out-of-band
                    // channel error.
                    warn!(worker = id, %err, "reply could not be routed");
                    error_sink.as_ref()(id, err);
                }
            }
            WorkerMessage::Exiting { code } => {
                clean_exit = Some(code);
            }
        }
    }

    // The outbound queue disconnected: the worker thread is gone.
    if terminated.load(Ordering::Acquire) {
        // terminate() already rejected everything pending.
        return;
    }

    // Nobody asked this worker to die. A missing Exiting message means the
    // thread unwound (a panicking plugin).
    let code = clean_exit.unwrap_or(PANIC_EXIT_CODE);
    let err = PoolError::UnexpectedExit { code };
    terminated.store(true, Ordering::Release);
    gate.fail(err.clone());
    state.reject_all_pending(&err);
    error!(worker = id, code, "worker exited unexpectedly");
    error_sink.as_ref()(id, err);
}

// ── File stream ───────────────────────────────────────────────────────────────

/// The lazy sequence of output files from one `process_file` call.
///
/// Pulling the stream also delivers the plugin's log records into the run's
/// logger, interleaved exactly as the worker posted them.
pub struct FileStream {
    replies: crate::channel::ReplyStream,
    log: RunLogger,
}

impl Iterator for FileStream {
    type Item = Result<File, PoolError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.replies.next() {
                None => return None,
                Some(Err(err)) => return Some(Err(err)),
                Some(Ok(Reply::File { file })) => return Some(Ok(file)),
                Some(Ok(Reply::Log {
                    level,
                    message,
                    data,
                })) => {
                    self.log.emit(level, message, data);
                }
                Some(Ok(other)) => {
                    return Some(Err(PoolError::Protocol(format!(
                        "unexpected reply in file stream: {other:?}"
                    ))))
                }
            }
        }
    }
}

impl std::fmt::Debug for FileStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStream").finish_non_exhaustive()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
