//! Command scheduler: single-flight request/reply correlation over a
//! serial link.
//!
//! A [`CommandScheduler`] owns one transport. Callers submit
//! [`CommandRequest`]s on a priority [`Lane`]; a background dispatcher
//! task writes exactly one frame at a time, matches the reply by its
//! message counter, and resolves the caller's `send` future.
//!
//! The handle is cheap to clone. Dropping every handle shuts the
//! dispatcher down once it is idle; [`CommandScheduler::dispose`] does so
//! immediately.

mod dispatcher;
mod request;
mod state;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span};

use crate::error::Ev3Error;
use crate::orphan::{LoggingRecovery, OrphanRecovery};
use crate::packet::MAX_FRAME_SIZE;
use crate::transport::Transport;

use dispatcher::{Dispatcher, Submission};
pub use request::{CommandRequest, CommandResult, Lane};
pub use state::{SchedulerRuntimeSnapshot, SchedulerState};
use state::StateCell;

// ── SchedulerConfig ──────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Name used in log spans, usually the brick id.
    pub label: String,
    /// Applied to requests that carry no timeout of their own.
    pub default_timeout: Duration,
    /// Largest frame body the transport accepts.
    pub max_frame_size: usize,
    /// Upper bound on a single orphan recovery run.
    pub recovery_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            label: "brick".into(),
            default_timeout: Duration::from_secs(2),
            max_frame_size: MAX_FRAME_SIZE,
            recovery_timeout: Duration::from_secs(2),
        }
    }
}

impl SchedulerConfig {
    pub fn labeled(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Self::default()
        }
    }
}

// ── Shared ───────────────────────────────────────────────────────

/// State visible to both the handle and the dispatcher task.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) state: StateCell,
    /// Submitted but not yet dispatched, across both lanes.
    pub(crate) queued: AtomicUsize,
    /// Fired by `dispose()`.
    pub(crate) cancel: CancellationToken,
    /// Fired once the dispatcher has released the transport.
    pub(crate) terminated: CancellationToken,
}

// ── CommandScheduler ─────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CommandScheduler {
    shared: Arc<Shared>,
    tx: mpsc::UnboundedSender<Submission>,
    label: Arc<str>,
}

impl CommandScheduler {
    /// Spawn a dispatcher over `io` that logs orphans without reconciling.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn<T: Transport>(io: T, config: SchedulerConfig) -> Self {
        Self::spawn_with_recovery(io, config, Arc::new(LoggingRecovery))
    }

    /// Spawn a dispatcher over `io` with an explicit recovery strategy.
    pub fn spawn_with_recovery<T: Transport>(
        io: T,
        config: SchedulerConfig,
        recovery: Arc<dyn OrphanRecovery>,
    ) -> Self {
        let shared = Arc::new(Shared {
            state: StateCell::default(),
            queued: AtomicUsize::new(0),
            cancel: CancellationToken::new(),
            terminated: CancellationToken::new(),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let label: Arc<str> = Arc::from(config.label.as_str());

        let span = info_span!("scheduler", brick = %config.label);
        let dispatcher = Dispatcher::new(io, rx, Arc::clone(&shared), config, recovery);
        tokio::spawn(dispatcher.run().instrument(span));

        Self { shared, tx, label }
    }

    /// Submit a request and wait for its resolution.
    ///
    /// Resolves exactly once: with a [`CommandResult`] when a reply with
    /// the dispatched counter arrives (including brick-side rejections),
    /// or with `Encode`, `Transport`, `Orphaned` or `Disposed`.
    pub async fn send(&self, request: CommandRequest) -> Result<CommandResult, Ev3Error> {
        if self.shared.state.get().is_disposed() {
            return Err(Ev3Error::Disposed);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let submission = Submission {
            request,
            enqueued_at: Instant::now(),
            reply_tx,
        };

        self.shared.queued.fetch_add(1, Ordering::SeqCst);
        if let Err(rejected) = self.tx.send(submission) {
            self.shared.queued.fetch_sub(1, Ordering::SeqCst);
            debug!(request_id = %rejected.0.request.id, "send after dispatcher exit");
            return Err(Ev3Error::Disposed);
        }

        reply_rx.await?
    }

    /// Tear the scheduler down. Queued and in-flight requests fail with
    /// [`Ev3Error::Disposed`]. Calling it again is a no-op.
    pub fn dispose(&self) {
        if self.shared.state.dispose() {
            debug!(brick = %self.label, "scheduler disposed");
        }
        self.shared.cancel.cancel();
    }

    /// Wait until the dispatcher has exited and released the transport.
    pub async fn closed(&self) {
        self.shared.terminated.cancelled().await
    }

    pub fn state(&self) -> SchedulerState {
        self.shared.state.get()
    }

    /// Requests waiting in either lane, excluding the one on the wire.
    pub fn queue_size(&self) -> usize {
        self.shared.queued.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> SchedulerRuntimeSnapshot {
        SchedulerRuntimeSnapshot::new(self.state(), self.queue_size())
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}
