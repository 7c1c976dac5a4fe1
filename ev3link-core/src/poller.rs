//! Connection health poller.
//!
//! One background task probes every live session on a shared tick and
//! requests reconnection for bricks that lost their link.
//!
//! ```text
//!  tick ──► probe READY/CONNECTING idle sessions (concurrently)
//!       │      └─ failure ─► close session ─► UNAVAILABLE("Connection lost: ..")
//!       │                     ─► refresh ─► on_disconnected
//!       └─► reconnect UNAVAILABLE("Connection lost: ..") records
//!             (at most once per interval, never two at once per brick)
//!  sleep active_interval if any brick is live, else idle_interval
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, join_all};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, trace, warn};

use crate::bytecode::system_command;
use crate::error::Ev3Error;
use crate::message::{PROBE_COMMAND, ReplyKind, SystemReplyStatus};
use crate::registry::{BrickRegistry, LINK_LOSS_PREFIX, RuntimeMetrics};
use crate::scheduler::{CommandRequest, CommandResult, CommandScheduler};
use crate::session::{RefreshSink, SessionSource};

pub type DisconnectedHook = Arc<dyn Fn(&str, &str) + Send + Sync>;
pub type ReconnectHook =
    Arc<dyn Fn(String) -> BoxFuture<'static, Result<(), Ev3Error>> + Send + Sync>;

// ── PollerOptions ────────────────────────────────────────────────

#[derive(Clone)]
pub struct PollerOptions {
    /// Tick period while at least one brick is `READY`/`CONNECTING`.
    pub active_interval: Duration,
    /// Tick period otherwise.
    pub idle_interval: Duration,
    pub probe_timeout: Duration,
    /// `None` means `max(1s, 2 × active_interval)`.
    pub reconnect_interval: Option<Duration>,
    /// Called with `(brick_id, reason)` after a probe failure was handled.
    pub on_disconnected: Option<DisconnectedHook>,
    pub on_reconnect_requested: Option<ReconnectHook>,
}

impl Default for PollerOptions {
    fn default() -> Self {
        Self {
            active_interval: Duration::from_millis(500),
            idle_interval: Duration::from_millis(2000),
            probe_timeout: Duration::from_millis(700),
            reconnect_interval: None,
            on_disconnected: None,
            on_reconnect_requested: None,
        }
    }
}

impl PollerOptions {
    pub fn effective_reconnect_interval(&self) -> Duration {
        self.reconnect_interval
            .unwrap_or_else(|| Duration::from_millis(1000).max(self.active_interval * 2))
    }

    pub fn on_disconnected<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        self.on_disconnected = Some(Arc::new(f));
        self
    }

    pub fn on_reconnect_requested<F>(mut self, f: F) -> Self
    where
        F: Fn(String) -> BoxFuture<'static, Result<(), Ev3Error>> + Send + Sync + 'static,
    {
        self.on_reconnect_requested = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for PollerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollerOptions")
            .field("active_interval", &self.active_interval)
            .field("idle_interval", &self.idle_interval)
            .field("probe_timeout", &self.probe_timeout)
            .field("reconnect_interval", &self.effective_reconnect_interval())
            .field("on_disconnected", &self.on_disconnected.is_some())
            .field("on_reconnect_requested", &self.on_reconnect_requested.is_some())
            .finish()
    }
}

// ── PollerHandle ─────────────────────────────────────────────────

/// Stops the poller when disposed or dropped.
#[derive(Debug)]
pub struct PollerHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl PollerHandle {
    /// Stop ticking. In-flight reconnect attempts run to completion on
    /// their own; an in-flight tick is abandoned. Idempotent.
    pub fn dispose(&self) {
        self.cancel.cancel();
    }

    pub fn is_disposed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Dispose and wait for the tick loop to exit.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("health poller task failed: {e}");
            }
        }
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Start the poller on the current Tokio runtime.
pub fn create_connection_health_poller(
    registry: Arc<BrickRegistry>,
    sessions: Arc<dyn SessionSource>,
    refresh: Arc<dyn RefreshSink>,
    options: PollerOptions,
) -> PollerHandle {
    let cancel = CancellationToken::new();
    let poller = Poller {
        registry,
        sessions,
        refresh,
        reconnect_interval: options.effective_reconnect_interval(),
        options,
        probing: HashSet::new(),
        reconnecting: Arc::new(Mutex::new(HashSet::new())),
        last_reconnect: HashMap::new(),
    };
    let task = tokio::spawn(
        poller
            .run(cancel.clone())
            .instrument(info_span!("health_poller")),
    );
    PollerHandle {
        cancel,
        task: Some(task),
    }
}

// ── Poller ───────────────────────────────────────────────────────

struct Poller {
    registry: Arc<BrickRegistry>,
    sessions: Arc<dyn SessionSource>,
    refresh: Arc<dyn RefreshSink>,
    options: PollerOptions,
    reconnect_interval: Duration,
    /// Bricks with a probe on the wire.
    probing: HashSet<String>,
    /// Bricks with a reconnect attempt running; cleared by the attempt.
    reconnecting: Arc<Mutex<HashSet<String>>>,
    last_reconnect: HashMap<String, Instant>,
}

impl Poller {
    async fn run(mut self, cancel: CancellationToken) {
        debug!(options = ?self.options, "health poller started");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.tick() => {}
            }

            let interval = if self.registry.has_live_bricks() {
                self.options.active_interval
            } else {
                self.options.idle_interval
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        debug!("health poller stopped");
    }

    async fn tick(&mut self) {
        self.probe_sessions().await;
        self.request_reconnects();
    }

    // ── Probing ──────────────────────────────────────────────────

    fn eligible(&mut self) -> Vec<(String, CommandScheduler)> {
        let mut eligible = Vec::new();
        for brick_id in self.sessions.list_session_brick_ids() {
            let Some(snapshot) = self.registry.get_snapshot(&brick_id) else {
                continue;
            };
            if !snapshot.status.is_live() || self.probing.contains(&brick_id) {
                continue;
            }

            if let Some(runtime) = self.sessions.runtime_snapshot(&brick_id) {
                self.registry.update_runtime_metrics(
                    &brick_id,
                    RuntimeMetrics {
                        busy_command_count: Some(runtime.busy_command_count),
                        scheduler_state: Some(runtime.state),
                        last_seen_at_iso: None,
                    },
                );
                if runtime.busy_command_count > 0 {
                    trace!(%brick_id, busy = runtime.busy_command_count, "skipping busy brick");
                    continue;
                }
            }

            let Some(session) = self.sessions.get_session(&brick_id) else {
                continue;
            };
            eligible.push((brick_id, session.scheduler));
        }
        eligible
    }

    async fn probe_sessions(&mut self) {
        let eligible = self.eligible();
        if eligible.is_empty() {
            return;
        }

        let timeout = self.options.probe_timeout;
        let probes = eligible.into_iter().map(|(brick_id, scheduler)| {
            self.probing.insert(brick_id.clone());
            async move {
                let outcome = probe(&scheduler, &brick_id, timeout).await;
                (brick_id, outcome)
            }
        });
        let outcomes = join_all(probes.collect::<Vec<_>>()).await;

        for (brick_id, outcome) in outcomes {
            self.probing.remove(&brick_id);
            match outcome {
                Ok(()) => {
                    trace!(%brick_id, "probe ok");
                    self.registry.update_runtime_metrics(
                        &brick_id,
                        RuntimeMetrics {
                            last_seen_at_iso: Some(chrono::Utc::now().to_rfc3339()),
                            ..RuntimeMetrics::default()
                        },
                    );
                }
                Err(cause) => self.handle_link_loss(&brick_id, cause).await,
            }
        }
    }

    async fn handle_link_loss(&mut self, brick_id: &str, cause: Ev3Error) {
        let reason = format!("{LINK_LOSS_PREFIX} {cause}");
        warn!(%brick_id, %reason, "probe failed");

        self.sessions.close_session(brick_id).await;
        self.registry.mark_unavailable(brick_id, reason.as_str());
        self.refresh.refresh_brick(brick_id);
        if let Some(hook) = &self.options.on_disconnected {
            hook(brick_id, &reason);
        }
    }

    // ── Reconnection ─────────────────────────────────────────────

    fn request_reconnects(&mut self) {
        let Some(hook) = self.options.on_reconnect_requested.clone() else {
            return;
        };
        let now = Instant::now();

        for snapshot in self.registry.list_snapshots() {
            if !snapshot.lost_link() {
                continue;
            }
            let brick_id = snapshot.brick_id;

            if let Some(last) = self.last_reconnect.get(&brick_id) {
                if now.duration_since(*last) < self.reconnect_interval {
                    continue;
                }
            }
            {
                let mut running = self
                    .reconnecting
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                if !running.insert(brick_id.clone()) {
                    continue;
                }
            }
            self.last_reconnect.insert(brick_id.clone(), now);

            info!(%brick_id, "requesting reconnect");
            let attempt = hook(brick_id.clone());
            let reconnecting = Arc::clone(&self.reconnecting);
            tokio::spawn(async move {
                match attempt.await {
                    Ok(()) => info!(%brick_id, "reconnect succeeded"),
                    Err(e) => warn!(%brick_id, "reconnect failed: {e}"),
                }
                reconnecting
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&brick_id);
            });
        }

        // Forget bricks that recovered or were removed.
        let registry = &self.registry;
        self.last_reconnect.retain(|id, _| {
            registry.get_snapshot(id).is_some_and(|s| s.lost_link())
        });
    }
}

/// Send one probe and check that the brick answered it properly.
async fn probe(scheduler: &CommandScheduler, brick_id: &str, timeout: Duration) -> Result<(), Ev3Error> {
    let request = CommandRequest::system(system_command(PROBE_COMMAND, &[]))
        .with_id(format!("probe:{brick_id}"))
        .high()
        .idempotent()
        .timeout(timeout);
    let result = scheduler.send(request).await?;
    check_probe_reply(&result)
}

/// A healthy probe reply is a `SystemReply` echoing the probe command
/// with a success status.
pub fn check_probe_reply(result: &CommandResult) -> Result<(), Ev3Error> {
    let kind = result.reply.reply_kind();
    if kind != Some(ReplyKind::SystemReply) {
        let kind = kind.unwrap_or(ReplyKind::SystemReplyError);
        return Err(Ev3Error::Protocol {
            kind,
            detail: "probe rejected".into(),
        });
    }
    match result.reply.system_status() {
        Some((echo, SystemReplyStatus::Success)) if echo == PROBE_COMMAND as u8 => Ok(()),
        Some((echo, status)) => Err(Ev3Error::Protocol {
            kind: ReplyKind::SystemReply,
            detail: format!("probe answered with command {echo:#04x} status {status:?}"),
        }),
        None => Err(Ev3Error::Protocol {
            kind: ReplyKind::SystemReply,
            detail: "probe reply too short".into(),
        }),
    }
}
