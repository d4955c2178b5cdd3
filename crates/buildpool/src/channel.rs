//! Reply correlation between the controller and one worker.
//!
//! Outgoing requests are stamped with a process-wide id and recorded in a
//! pending table; the worker's replies carry `to` and are routed back to
//! the recorded waiter. Three request modes exist:
//!
//! - [`MessageChannel::post`]: fire and forget, returns the id.
//! - [`MessageChannel::send`]: registers a waiter and returns a
//!   [`PendingReply`] to block on. The registration happens before the
//!   request leaves, so the reply can never race past it.
//! - [`MessageChannel::send_stream`]: like `send`, but the waiter stays
//!   registered across non-terminal replies. Replies that arrive while the
//!   consumer is between pulls queue up in the waiter's channel; nothing is
//!   dropped.
//!
//! A bounded history remembers recently settled ids so that stragglers
//! (replies posted just before a termination or after a terminal reply was
//! routed) are recognized and ignored rather than reported as protocol
//! errors.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use lru::LruCache;

use crate::error::{reconstruct, PoolError};
use crate::protocol::{next_message_id, Reply, ReplyEnvelope, Request, RequestEnvelope};

/// How many settled message ids the channel remembers.
const COMPLETED_HISTORY: usize = 1024;

type WaiterTx = mpsc::Sender<Result<Reply, PoolError>>;
type WaiterRx = mpsc::Receiver<Result<Reply, PoolError>>;

/// The reply-routing half of a channel, shared with the router thread.
pub(crate) struct ChannelState {
    waiters: Mutex<HashMap<u64, WaiterTx>>,
    completed: Mutex<LruCache<u64, ()>>,
}

impl ChannelState {
    fn new() -> ChannelState {
        ChannelState {
            waiters: Mutex::new(HashMap::new()),
            completed: Mutex::new(LruCache::new(
                NonZeroUsize::new(COMPLETED_HISTORY).expect("history capacity >= 1"),
            )),
        }
    }

    /// Routes one reply to its waiter.
    ///
    /// Terminal replies release the pending entry and record the id as
    /// completed. A reply for an id that is neither pending nor recently
    /// completed is a protocol error, returned to the caller (the router
    /// surfaces it as a channel-level event).
    pub fn route_reply(&self, envelope: ReplyEnvelope) -> Result<(), PoolError> {
        let ReplyEnvelope { to, reply } = envelope;
        let waiter = {
            let mut waiters = self.waiters.lock().expect("pending table poisoned");
            if reply.is_terminal() {
                waiters.remove(&to)
            } else {
                waiters.get(&to).cloned()
            }
        };
        match waiter {
            Some(tx) => {
                if reply.is_terminal() {
                    self.mark_completed(to);
                }
                // The waiter may already have been dropped (a consumer that
                // stopped pulling its stream). Remaining replies are simply
                // discarded.
                let _ = tx.send(Ok(reply));
                Ok(())
            }
            None if self.was_completed(to) => Ok(()),
            None => Err(PoolError::Protocol(format!(
                "reply for unknown message id {to}"
            ))),
        }
    }

    /// Drains the pending table and rejects every waiter with `error`.
    /// The drained ids count as completed; replies that still arrive for
    /// them are ignored.
    pub fn reject_all_pending(&self, error: &PoolError) {
        let drained: Vec<(u64, WaiterTx)> = {
            let mut waiters = self.waiters.lock().expect("pending table poisoned");
            waiters.drain().collect()
        };
        for (id, tx) in drained {
            self.mark_completed(id);
            let _ = tx.send(Err(error.clone()));
        }
    }

    pub fn pending_count(&self) -> usize {
        self.waiters.lock().expect("pending table poisoned").len()
    }

    fn register(&self, id: u64, tx: WaiterTx) {
        let previous = self
            .waiters
            .lock()
            .expect("pending table poisoned")
            .insert(id, tx);
        debug_assert!(previous.is_none(), "duplicate waiter for message id {id}");
    }

    fn unregister(&self, id: u64) {
        self.waiters.lock().expect("pending table poisoned").remove(&id);
    }

    fn mark_completed(&self, id: u64) {
        self.completed
            .lock()
            .expect("completed history poisoned")
            .put(id, ());
    }

    fn was_completed(&self, id: u64) -> bool {
        self.completed
            .lock()
            .expect("completed history poisoned")
            .contains(&id)
    }
}

/// The controller-side endpoint for one worker.
pub(crate) struct MessageChannel {
    to_worker: Mutex<Option<mpsc::Sender<RequestEnvelope>>>,
    state: Arc<ChannelState>,
}

impl MessageChannel {
    pub fn new(to_worker: mpsc::Sender<RequestEnvelope>) -> MessageChannel {
        MessageChannel {
            to_worker: Mutex::new(Some(to_worker)),
            state: Arc::new(ChannelState::new()),
        }
    }

    /// The routing state, for the router thread.
    pub fn state(&self) -> Arc<ChannelState> {
        Arc::clone(&self.state)
    }

    /// Closes the outgoing direction. The worker's dispatch loop drains and
    /// exits once the queue empties.
    pub fn close(&self) {
        self.to_worker
            .lock()
            .expect("request sender poisoned")
            .take();
    }

    fn post_envelope(&self, envelope: RequestEnvelope) -> Result<(), PoolError> {
        let sender = {
            let guard = self.to_worker.lock().expect("request sender poisoned");
            guard.clone()
        };
        match sender {
            Some(tx) => tx.send(envelope).map_err(|_| PoolError::Terminating),
            None => Err(PoolError::Terminating),
        }
    }

    /// Sends a request expecting no reply. Returns the message id.
    #[allow(dead_code)]
    pub fn post(&self, request: Request) -> Result<u64, PoolError> {
        let id = next_message_id();
        self.post_envelope(RequestEnvelope { id, request })?;
        Ok(id)
    }

    /// Sends a request and registers a single-reply waiter.
    pub fn send(&self, request: Request) -> Result<PendingReply, PoolError> {
        let id = next_message_id();
        let (tx, rx) = mpsc::channel();
        self.state.register(id, tx);
        if let Err(err) = self.post_envelope(RequestEnvelope { id, request }) {
            self.state.unregister(id);
            return Err(err);
        }
        Ok(PendingReply { id, rx })
    }

    /// Sends a request whose replies stream until a terminal reply.
    pub fn send_stream(&self, request: Request) -> Result<ReplyStream, PoolError> {
        let pending = self.send(request)?;
        Ok(ReplyStream {
            id: pending.id,
            rx: pending.rx,
            done: false,
        })
    }
}

/// A registered single-reply waiter.
#[derive(Debug)]
pub(crate) struct PendingReply {
    id: u64,
    rx: WaiterRx,
}

impl PendingReply {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Blocks until the reply arrives. An `error` reply rejects with the
    /// reconstructed error; a forced rejection (termination, worker exit)
    /// rejects with the rejection error.
    pub fn wait(self) -> Result<Reply, PoolError> {
        match self.rx.recv() {
            Ok(Ok(Reply::Error { error })) => Err(reconstruct(error)),
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(err)) => Err(err),
            // The channel state itself went away without a rejection.
            Err(mpsc::RecvError) => Err(PoolError::Terminating),
        }
    }
}

/// Blocking iterator over the non-terminal replies to one request.
///
/// Ends on `Finished`; yields a single `Err` and ends on an `error` reply
/// or a forced rejection.
pub(crate) struct ReplyStream {
    id: u64,
    rx: WaiterRx,
    done: bool,
}

impl ReplyStream {
    #[allow(dead_code)]
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Iterator for ReplyStream {
    type Item = Result<Reply, PoolError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.rx.recv() {
            Ok(Ok(Reply::Finished)) => {
                self.done = true;
                None
            }
            Ok(Ok(Reply::Error { error })) => {
                self.done = true;
                Some(Err(reconstruct(error)))
            }
            Ok(Ok(reply)) => Some(Ok(reply)),
            Ok(Err(err)) => {
                self.done = true;
                Some(Err(err))
            }
            Err(mpsc::RecvError) => {
                self.done = true;
                Some(Err(PoolError::Terminating))
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorRecord;
    use crate::file::File;
    use crate::logging::{LogLevel, LogMessage};

    fn test_channel() -> (MessageChannel, mpsc::Receiver<RequestEnvelope>) {
        let (tx, rx) = mpsc::channel();
        (MessageChannel::new(tx), rx)
    }

    fn import_request() -> Request {
        Request::ImportModule {
            module_id: "m".to_string(),
            cwd: "/".to_string(),
            data: None,
        }
    }

    #[test]
    fn test_send_await_resolves_on_reply() {
        let (channel, outbox) = test_channel();
        let pending = channel.send(import_request()).expect("send");
        let sent = outbox.recv().expect("request reaches the worker side");
        assert_eq!(sent.id, pending.id());

        channel
            .state()
            .route_reply(ReplyEnvelope {
                to: sent.id,
                reply: Reply::Finished,
            })
            .expect("route");
        assert!(matches!(pending.wait(), Ok(Reply::Finished)));
        assert_eq!(channel.state().pending_count(), 0);
    }

    #[test]
    fn test_error_reply_rejects_with_reconstructed_error() {
        let (channel, outbox) = test_channel();
        let pending = channel.send(import_request()).expect("send");
        let sent = outbox.recv().expect("request");

        channel
            .state()
            .route_reply(ReplyEnvelope {
                to: sent.id,
                reply: Reply::Error {
                    error: ErrorRecord::new("Terminating", "going down"),
                },
            })
            .expect("route");
        assert_eq!(pending.wait(), Err(PoolError::Terminating));
    }

    #[test]
    fn test_unknown_id_is_a_protocol_error() {
        let (channel, _outbox) = test_channel();
        let err = channel
            .state()
            .route_reply(ReplyEnvelope {
                to: 0,
                reply: Reply::Finished,
            })
            .expect_err("unknown id must be reported");
        assert!(matches!(err, PoolError::Protocol(_)));
    }

    #[test]
    fn test_straggler_after_terminal_is_ignored() {
        let (channel, outbox) = test_channel();
        let pending = channel.send(import_request()).expect("send");
        let sent = outbox.recv().expect("request");
        let state = channel.state();

        state
            .route_reply(ReplyEnvelope {
                to: sent.id,
                reply: Reply::Finished,
            })
            .expect("terminal");
        let _ = pending.wait();

        // A second reply for the settled id is swallowed, not an error.
        state
            .route_reply(ReplyEnvelope {
                to: sent.id,
                reply: Reply::Finished,
            })
            .expect("straggler must be ignored");
    }

    #[test]
    fn test_reject_all_pending_rejects_and_absorbs_stragglers() {
        let (channel, outbox) = test_channel();
        let first = channel.send(import_request()).expect("send");
        let second = channel.send(import_request()).expect("send");
        let state = channel.state();
        assert_eq!(state.pending_count(), 2);

        state.reject_all_pending(&PoolError::Terminating);
        assert_eq!(state.pending_count(), 0);
        assert_eq!(first.wait(), Err(PoolError::Terminating));
        assert_eq!(second.wait(), Err(PoolError::Terminating));

        // Replies landing after the drain are treated as completed.
        for envelope in outbox.try_iter() {
            state
                .route_reply(ReplyEnvelope {
                    to: envelope.id,
                    reply: Reply::Finished,
                })
                .expect("post-drain replies must be absorbed");
        }
    }

    #[test]
    fn test_stream_buffers_replies_between_pulls() {
        let (channel, outbox) = test_channel();
        let mut stream = channel
            .send_stream(Request::ProcessFile {
                module_uid: 1,
                file: File::new("in.txt"),
                run: crate::context::RunMessage {
                    cwd: "/".to_string(),
                    concurrency: 1,
                    dev: false,
                    debug: false,
                    full: true,
                    changed_files: Vec::new(),
                },
            })
            .expect("send_stream");
        let sent = outbox.recv().expect("request");
        let state = channel.state();

        // All replies land before the consumer pulls anything.
        for path in ["a.txt", "b.txt"] {
            state
                .route_reply(ReplyEnvelope {
                    to: sent.id,
                    reply: Reply::File {
                        file: File::new(path),
                    },
                })
                .expect("route file");
        }
        state
            .route_reply(ReplyEnvelope {
                to: sent.id,
                reply: Reply::Log {
                    level: LogLevel::Info,
                    message: LogMessage::Text("between".to_string()),
                    data: None,
                },
            })
            .expect("route log");
        state
            .route_reply(ReplyEnvelope {
                to: sent.id,
                reply: Reply::Finished,
            })
            .expect("route finished");

        let items: Vec<_> = stream.by_ref().collect();
        assert_eq!(items.len(), 3, "two files and one log record");
        assert!(stream.next().is_none(), "stream stays finished");
        assert_eq!(state.pending_count(), 0);
    }

    #[test]
    fn test_stream_ends_with_error_reply() {
        let (channel, outbox) = test_channel();
        let mut stream = channel.send_stream(import_request()).expect("send_stream");
        let sent = outbox.recv().expect("request");

        channel
            .state()
            .route_reply(ReplyEnvelope {
                to: sent.id,
                reply: Reply::Error {
                    error: ErrorRecord::new("Boom", "plugin blew up"),
                },
            })
            .expect("route error");

        match stream.next() {
            Some(Err(PoolError::Plugin(record))) => {
                assert_eq!(record.name, "Boom");
                assert_eq!(record.message, "plugin blew up");
            }
            other => panic!("expected a plugin error, got {other:?}"),
        }
        assert!(stream.next().is_none());
    }

    #[test]
    fn test_send_after_close_fails_with_terminating() {
        let (channel, _outbox) = test_channel();
        channel.close();
        assert!(matches!(
            channel.send(import_request()),
            Err(PoolError::Terminating)
        ));
        assert_eq!(
            channel.state().pending_count(),
            0,
            "failed sends must not leak waiters"
        );
    }
}
