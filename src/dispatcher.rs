//! Command queue and dispatcher.
//!
//! Connection tasks on any thread [`CommandQueue::enqueue`] raw payloads and
//! await a [`PendingCompletion`]. Once per host tick,
//! [`CommandQueue::drain_and_execute`] claims every entry not yet executing
//! and runs it through the [`CommandHandler`] on the host thread. Each entry
//! is claimed at most once and leaves the queue when its result is delivered.

use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::FutureExt;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::host::{panic_message, HostHandle, IdleControl, MarshalError};
use crate::registry::CommandHandler;
use crate::sync::lock;
use crate::transport::protocol::{CommandEnvelope, CommandResponse};

/// Failure to obtain a command's result.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No result within the caller's deadline. The command was withdrawn.
    #[error("Command processing timed out after {} ms", .0.as_millis())]
    TimedOut(Duration),

    /// The queue dropped the command without answering.
    #[error("Command was dropped before completing")]
    Dropped,

    /// The command's token was cancelled before a result arrived.
    #[error("Command was cancelled")]
    Cancelled,
}

/// One queued command.
#[derive(Debug)]
pub struct PendingCommand {
    pub id: String,
    pub raw_payload: String,
    pub executing: bool,
    /// Execution deadline once claimed.
    pub timeout: Duration,
    /// Fired by `withdraw` or by the owner's token; the handler sees a child of it.
    cancel: CancellationToken,
    completion: Option<oneshot::Sender<String>>,
}

/// Receiving side of an enqueued command.
#[derive(Debug)]
pub struct PendingCompletion {
    id: String,
    rx: oneshot::Receiver<String>,
    cancel: CancellationToken,
    queue: CommandQueue,
}

impl PendingCompletion {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the serialized response.
    ///
    /// Past `deadline`, or once the command's token is cancelled, the
    /// command is withdrawn: if it has not started it never will, and a
    /// running handler sees its token fire.
    pub async fn wait(self, deadline: Duration) -> Result<String, DispatchError> {
        let Self {
            id,
            rx,
            cancel,
            queue,
        } = self;

        let received = tokio::select! {
            () = cancel.cancelled() => None,
            received = tokio::time::timeout(deadline, rx) => Some(received),
        };
        match received {
            Some(Ok(Ok(response))) => Ok(response),
            Some(Ok(Err(_))) => Err(DispatchError::Dropped),
            Some(Err(_)) => {
                queue.withdraw(&id);
                Err(DispatchError::TimedOut(deadline))
            }
            None => {
                queue.withdraw(&id);
                Err(DispatchError::Cancelled)
            }
        }
    }
}

struct QueueInner {
    pending: Mutex<HashMap<String, PendingCommand>>,
    draining: AtomicBool,
    next_id: AtomicU64,
    handler: Arc<dyn CommandHandler>,
    command_timeout: Duration,
}

/// Thread-safe queue shared by every transport. Cheap to clone.
#[derive(Clone)]
pub struct CommandQueue {
    inner: Arc<QueueInner>,
}

impl fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandQueue")
            .field("pending", &self.len())
            .field("command_timeout", &self.inner.command_timeout)
            .finish_non_exhaustive()
    }
}

/// Clears the re-entrancy flag when a drain ends, even by panic.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl CommandQueue {
    pub fn new(handler: Arc<dyn CommandHandler>, command_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                pending: Mutex::new(HashMap::new()),
                draining: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
                handler,
                command_timeout,
            }),
        }
    }

    pub fn handler(&self) -> Arc<dyn CommandHandler> {
        Arc::clone(&self.inner.handler)
    }

    /// Drain this queue on every tick of `host`.
    pub fn attach(&self, host: &HostHandle) -> Result<(), MarshalError> {
        let queue = self.clone();
        host.on_idle(move || {
            queue.drain_and_execute();
            IdleControl::Continue
        })
    }

    /// Queue a raw payload with the queue's default timeout. Callable from
    /// any thread.
    pub fn enqueue(&self, payload: String) -> PendingCompletion {
        self.enqueue_with(payload, self.inner.command_timeout, CancellationToken::new())
    }

    /// Queue a raw payload that runs for at most `timeout` once claimed.
    ///
    /// `cancel` is owned by the command: cancelling it (directly or through
    /// a parent such as a transport's lifecycle token) withdraws the command
    /// and cancels a running handler.
    pub fn enqueue_with(
        &self,
        payload: String,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> PendingCompletion {
        let seq = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let id = format!("cmd-{seq:x}");
        let (tx, rx) = oneshot::channel();

        lock(&self.inner.pending).insert(
            id.clone(),
            PendingCommand {
                id: id.clone(),
                raw_payload: payload,
                executing: false,
                timeout,
                cancel: cancel.clone(),
                completion: Some(tx),
            },
        );

        PendingCompletion {
            id,
            rx,
            cancel,
            queue: self.clone(),
        }
    }

    /// Remove a command and cancel its token. It will not start if it has
    /// not already; a running handler sees the cancellation.
    pub fn withdraw(&self, id: &str) {
        let removed = lock(&self.inner.pending).remove(id);
        if let Some(cmd) = removed {
            cmd.cancel.cancel();
            debug!(command = %id, executing = cmd.executing, "Withdrew command");
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Claim and start every command not yet executing.
    ///
    /// Runs on the host thread inside its `LocalSet`; a call made while
    /// another drain is in progress returns 0 without claiming anything.
    /// Returns the number of commands claimed.
    pub fn drain_and_execute(&self) -> usize {
        if self
            .inner
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return 0;
        }
        let _guard = DrainGuard(&self.inner.draining);

        let claimed: Vec<Claimed> = {
            let mut pending = lock(&self.inner.pending);
            pending
                .values_mut()
                .filter(|cmd| !cmd.executing)
                .filter_map(|cmd| {
                    cmd.executing = true;
                    cmd.completion.take().map(|completion| Claimed {
                        id: cmd.id.clone(),
                        payload: cmd.raw_payload.clone(),
                        timeout: cmd.timeout,
                        cancel: cmd.cancel.clone(),
                        completion,
                    })
                })
                .collect()
        };

        let count = claimed.len();
        for claim in claimed {
            self.execute_claimed(claim);
        }
        count
    }

    fn execute_claimed(&self, claim: Claimed) {
        let Claimed {
            id,
            payload,
            timeout,
            cancel,
            completion,
        } = claim;

        if cancel.is_cancelled() {
            self.finish(&id, completion, &CommandResponse::error(DispatchError::Cancelled.to_string()));
            return;
        }

        let envelope = match parse_envelope(&payload) {
            Ok(envelope) => envelope,
            Err(response) => {
                self.finish(&id, completion, &response);
                return;
            }
        };

        let queue = self.clone();
        let handler = Arc::clone(&self.inner.handler);

        tokio::task::spawn_local(async move {
            // Child so a dispatcher timeout does not look like a withdrawal to the waiter
            let cancel = cancel.child_token();
            let run = AssertUnwindSafe(handler.execute(
                &envelope.name,
                envelope.params.clone(),
                cancel.clone(),
            ))
            .catch_unwind();

            let response = match tokio::time::timeout(timeout, run).await {
                Ok(Ok(Ok(result))) => CommandResponse::success(result),
                Ok(Ok(Err(e))) => {
                    debug!(command = %envelope.name, error = %e, "Command failed");
                    CommandResponse::error(e.to_string())
                }
                Ok(Err(payload)) => {
                    let msg = panic_message(payload.as_ref());
                    warn!(command = %envelope.name, panic = %msg, "Command panicked");
                    CommandResponse::error(format!("Command '{}' panicked: {msg}", envelope.name))
                }
                Err(_) => {
                    cancel.cancel();
                    warn!(command = %envelope.name, timeout_ms = timeout.as_millis(), "Command timed out");
                    CommandResponse::timed_out(timeout)
                }
            };

            queue.finish(&id, completion, &response);
        });
    }

    fn finish(&self, id: &str, completion: oneshot::Sender<String>, response: &CommandResponse) {
        // Receiver gone means the caller already gave up
        let _ = completion.send(response.to_json());
        lock(&self.inner.pending).remove(id);
    }
}

/// A command taken out of the pending map for execution.
struct Claimed {
    id: String,
    payload: String,
    timeout: Duration,
    cancel: CancellationToken,
    completion: oneshot::Sender<String>,
}

/// Parse a raw payload, or produce the error response for it.
fn parse_envelope(payload: &str) -> Result<CommandEnvelope, CommandResponse> {
    if payload.trim().is_empty() {
        return Err(CommandResponse::error("Empty command payload"));
    }
    let envelope: CommandEnvelope = serde_json::from_str(payload)
        .map_err(|e| CommandResponse::error(format!("Invalid command payload: {e}")))?;
    if envelope.name.trim().is_empty() {
        return Err(CommandResponse::error("Command type cannot be empty"));
    }
    Ok(envelope)
}
