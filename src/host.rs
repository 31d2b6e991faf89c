//! Host cooperative thread.
//!
//! All host-owned state is touched from exactly one thread. This module runs
//! that thread: a current-thread tokio runtime inside a `LocalSet`, ticking
//! at a fixed interval. Each tick first runs work submitted from other
//! threads, then every registered idle callback.
//!
//! ```text
//! ┌──────────────┐         ┌──────────────────────────────────┐
//! │ connection   │──job───▶│          HOST THREAD             │
//! │ task         │◀─result─│                                  │
//! └──────────────┘         │  tick:                           │
//!                          │    run queued jobs               │
//! ┌──────────────┐         │    run idle callbacks            │
//! │ hub client   │──job───▶│      (dispatcher drain, status)  │
//! │ task         │◀─result─│  spawn_local'd command futures   │
//! └──────────────┘         └──────────────────────────────────┘
//! ```
//!
//! [`HostHandle::run`] is the only way other threads reach host state.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{JoinHandle, ThreadId};
use std::time::Duration;

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::sync::lock;

/// Name given to the host thread.
pub const HOST_THREAD_NAME: &str = "host-context";

/// Failure to run a call on the host thread.
#[derive(Debug, Error)]
pub enum MarshalError {
    /// The host did not get to the call in time. The call will not run.
    #[error("host context did not run the call within {} ms", .0.as_millis())]
    Timeout(Duration),

    /// The call panicked on the host thread.
    #[error("call panicked on the host context: {0}")]
    Panicked(String),

    /// The host thread has exited.
    #[error("host context is not running")]
    HostStopped,
}

/// Returned by idle callbacks to stay registered or drop out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleControl {
    Continue,
    Remove,
}

type HostJob = Box<dyn FnOnce() + Send>;
type IdleCallback = Box<dyn FnMut() -> IdleControl + Send>;

enum HostMessage {
    Run(HostJob),
    OnIdle(IdleCallback),
}

/// Cloneable, thread-safe handle to the host thread.
#[derive(Clone)]
pub struct HostHandle {
    tx: mpsc::UnboundedSender<HostMessage>,
    thread_id: ThreadId,
}

impl fmt::Debug for HostHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostHandle")
            .field("thread_id", &self.thread_id)
            .finish_non_exhaustive()
    }
}

impl HostHandle {
    /// Whether the caller is running on the host thread.
    pub fn is_host_thread(&self) -> bool {
        std::thread::current().id() == self.thread_id
    }

    /// Register a callback invoked once per tick until it returns
    /// [`IdleControl::Remove`]. A panicking callback is removed.
    pub fn on_idle<F>(&self, callback: F) -> Result<(), MarshalError>
    where
        F: FnMut() -> IdleControl + Send + 'static,
    {
        self.tx
            .send(HostMessage::OnIdle(Box::new(callback)))
            .map_err(|_| MarshalError::HostStopped)
    }

    /// Run `f` on the host thread and wait for its result.
    ///
    /// Called from the host thread itself, `f` runs synchronously. Otherwise
    /// it runs on the next tick; if that does not happen within `timeout` the
    /// call is abandoned and will not run later.
    pub async fn run<F, R>(&self, f: F, timeout: Duration) -> Result<R, MarshalError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_host_thread() {
            return invoke(f);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let abandoned = self.submit(f, move |result| {
            let _ = reply_tx.send(result);
        })?;

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(MarshalError::HostStopped),
            Err(_) => {
                abandoned.store(true, Ordering::Release);
                Err(MarshalError::Timeout(timeout))
            }
        }
    }

    /// Blocking variant of [`Self::run`] for plain OS threads.
    ///
    /// Must not be called from inside an async task on a shared runtime
    /// worker: it parks the calling thread.
    pub fn run_blocking<F, R>(&self, f: F, timeout: Duration) -> Result<R, MarshalError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_host_thread() {
            return invoke(f);
        }

        let (reply_tx, reply_rx) = std::sync::mpsc::sync_channel(1);
        let abandoned = self.submit(f, move |result| {
            let _ = reply_tx.send(result);
        })?;

        match reply_rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                abandoned.store(true, Ordering::Release);
                Err(MarshalError::Timeout(timeout))
            }
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => Err(MarshalError::HostStopped),
        }
    }

    /// Queue `f` for the next tick, delivering its outcome to `reply`.
    ///
    /// Returns the flag the caller sets when it stops waiting.
    fn submit<F, R, C>(&self, f: F, reply: C) -> Result<Arc<AtomicBool>, MarshalError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
        C: FnOnce(Result<R, MarshalError>) + Send + 'static,
    {
        let abandoned = Arc::new(AtomicBool::new(false));
        let job_abandoned = Arc::clone(&abandoned);
        let job: HostJob = Box::new(move || {
            if job_abandoned.load(Ordering::Acquire) {
                debug!("Skipping host call abandoned by its caller");
                return;
            }
            reply(invoke(f));
        });
        self.tx
            .send(HostMessage::Run(job))
            .map_err(|_| MarshalError::HostStopped)?;
        Ok(abandoned)
    }
}

/// Owner of the host thread.
///
/// Dropping the runtime shuts the thread down.
#[derive(Debug)]
pub struct HostRuntime {
    handle: HostHandle,
    shutdown: CancellationToken,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl HostRuntime {
    /// Start the host thread with the given tick interval.
    pub fn spawn(tick_interval: Duration) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("Failed to build host runtime")?;

        let loop_shutdown = shutdown.clone();
        let thread = std::thread::Builder::new()
            .name(HOST_THREAD_NAME.to_string())
            .spawn(move || {
                let local = tokio::task::LocalSet::new();
                local.block_on(&runtime, host_loop(rx, tick_interval, loop_shutdown));
            })
            .context("Failed to spawn host thread")?;

        let handle = HostHandle {
            tx,
            thread_id: thread.thread().id(),
        };

        info!(tick_ms = tick_interval.as_millis(), "Host context started");

        Ok(Self {
            handle,
            shutdown,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn handle(&self) -> HostHandle {
        self.handle.clone()
    }

    /// Stop the host loop and join its thread. Idempotent.
    pub fn shutdown(&self) {
        self.shutdown.cancel();

        let thread = lock(&self.thread).take();
        let Some(thread) = thread else {
            return;
        };
        // Joining ourselves would deadlock; the loop exits on its own.
        if thread.thread().id() == std::thread::current().id() {
            return;
        }
        if thread.join().is_err() {
            error!("Host thread panicked");
        } else {
            debug!("Host context stopped");
        }
    }
}

impl Drop for HostRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn host_loop(
    mut rx: mpsc::UnboundedReceiver<HostMessage>,
    tick_interval: Duration,
    shutdown: CancellationToken,
) {
    let mut idle: Vec<IdleCallback> = Vec::new();
    let mut ticker = tokio::time::interval(tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        // Queued work first, then idle callbacks
        loop {
            match rx.try_recv() {
                Ok(HostMessage::Run(job)) => job(),
                Ok(HostMessage::OnIdle(callback)) => idle.push(callback),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }

        idle.retain_mut(|callback| match catch_unwind(AssertUnwindSafe(|| callback())) {
            Ok(IdleControl::Continue) => true,
            Ok(IdleControl::Remove) => false,
            Err(payload) => {
                error!(panic = %panic_message(payload.as_ref()), "Idle callback panicked; removing it");
                false
            }
        });
    }

    debug!(callbacks = idle.len(), "Host loop exiting");
}

fn invoke<F, R>(f: F) -> Result<R, MarshalError>
where
    F: FnOnce() -> R,
{
    catch_unwind(AssertUnwindSafe(f))
        .map_err(|payload| MarshalError::Panicked(panic_message(payload.as_ref())))
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    const TICK: Duration = Duration::from_millis(5);
    const WAIT: Duration = Duration::from_secs(2);

    fn thread_name() -> Option<String> {
        std::thread::current().name().map(String::from)
    }

    #[tokio::test]
    async fn run_executes_on_host_thread() {
        let host = HostRuntime::spawn(TICK).unwrap();
        let handle = host.handle();

        assert!(!handle.is_host_thread());
        let name = handle.run(thread_name, WAIT).await.unwrap();
        assert_eq!(name.as_deref(), Some(HOST_THREAD_NAME));
    }

    #[test]
    fn run_blocking_from_plain_thread() {
        let host = HostRuntime::spawn(TICK).unwrap();
        let handle = host.handle();

        let value = std::thread::spawn(move || handle.run_blocking(|| 6 * 7, WAIT))
            .join()
            .unwrap()
            .unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn nested_call_on_host_thread_runs_inline() {
        let host = HostRuntime::spawn(TICK).unwrap();
        let handle = host.handle();
        let inner = handle.clone();

        // Would deadlock if the nested call were queued behind its caller
        let result = handle
            .run(move || inner.run_blocking(|| "inline", Duration::from_millis(1)), WAIT)
            .await
            .unwrap();
        assert_eq!(result.unwrap(), "inline");
    }

    #[tokio::test]
    async fn panic_is_captured_and_host_survives() {
        let host = HostRuntime::spawn(TICK).unwrap();
        let handle = host.handle();

        let err = handle
            .run(|| -> u32 { panic!("scene graph exploded") }, WAIT)
            .await
            .unwrap_err();
        match err {
            MarshalError::Panicked(msg) => assert!(msg.contains("scene graph exploded")),
            other => panic!("Expected Panicked, got: {other:?}"),
        }

        assert_eq!(handle.run(|| 1, WAIT).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn timed_out_call_is_never_run() {
        let host = HostRuntime::spawn(TICK).unwrap();
        let handle = host.handle();

        // Block the host thread for a while
        handle
            .on_idle(|| {
                std::thread::sleep(Duration::from_millis(200));
                IdleControl::Remove
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let err = handle
            .run(move || flag.store(true, Ordering::SeqCst), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, MarshalError::Timeout(_)));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn idle_callback_runs_until_removed() {
        let host = HostRuntime::spawn(TICK).unwrap();
        let handle = host.handle();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        handle
            .on_idle(move || {
                if counter.fetch_add(1, Ordering::SeqCst) + 1 >= 3 {
                    IdleControl::Remove
                } else {
                    IdleControl::Continue
                }
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn panicking_idle_callback_is_dropped() {
        let host = HostRuntime::spawn(TICK).unwrap();
        let handle = host.handle();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        handle
            .on_idle(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                panic!("bad callback");
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(handle.run(|| "alive", WAIT).await.unwrap(), "alive");
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_rejects_work() {
        let host = HostRuntime::spawn(TICK).unwrap();
        let handle = host.handle();

        host.shutdown();
        host.shutdown();

        let err = handle.run(|| (), WAIT).await.unwrap_err();
        assert!(matches!(err, MarshalError::HostStopped));
        assert!(matches!(
            handle.on_idle(|| IdleControl::Continue),
            Err(MarshalError::HostStopped)
        ));
    }
}
