//! Monitor core logic.
//!
//! Dials every configured brick, keeps one scheduler session per brick
//! and lets the health poller detect link loss and re-dial.

use std::collections::HashMap;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use ev3link_core::{
    BrickRegistry, CommandScheduler, Ev3Error, LINK_LOSS_PREFIX, PollerOptions, RefreshSink,
    SessionPool, SessionSource, USER_DISCONNECT_REASON, connect_tcp,
    create_connection_health_poller,
};

use crate::config::{BrickEntry, MonitorConfig};

// ── LinkHandle ───────────────────────────────────────────────────

/// Capability handle registered for a ready brick.
#[derive(Debug, Clone)]
pub struct LinkHandle {
    pub brick_id: String,
    pub scheduler: CommandScheduler,
}

// ── SnapshotReporter ─────────────────────────────────────────────

/// Reports a brick's snapshot whenever its status changes.
pub struct SnapshotReporter {
    registry: Arc<BrickRegistry>,
    json: bool,
}

impl SnapshotReporter {
    pub fn new(registry: Arc<BrickRegistry>, json: bool) -> Self {
        Self { registry, json }
    }
}

impl RefreshSink for SnapshotReporter {
    fn refresh_brick(&self, brick_id: &str) {
        let Some(snapshot) = self.registry.get_snapshot(brick_id) else {
            return;
        };
        if self.json {
            match serde_json::to_string(&snapshot) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!(%brick_id, "cannot serialize snapshot: {e}"),
            }
        } else {
            info!(
                %brick_id,
                status = %snapshot.status,
                active = snapshot.is_active,
                last_error = snapshot.last_error.as_deref().unwrap_or(""),
                "brick status"
            );
        }
    }
}

// ── Dialer ───────────────────────────────────────────────────────

/// Everything needed to (re)open a brick session; cheap to clone into
/// the poller's reconnect callback.
#[derive(Clone)]
struct Dialer {
    config: Arc<MonitorConfig>,
    bricks: Arc<HashMap<String, BrickEntry>>,
    registry: Arc<BrickRegistry>,
    sessions: Arc<SessionPool>,
    refresh: Arc<dyn RefreshSink>,
}

impl Dialer {
    fn entry(&self, brick_id: &str) -> Result<&BrickEntry, Ev3Error> {
        self.bricks
            .get(brick_id)
            .ok_or_else(|| Ev3Error::Other(format!("unknown brick {brick_id:?}")))
    }

    /// Open a session and mark the brick `READY`.
    async fn open(&self, entry: &BrickEntry) -> Result<(), Ev3Error> {
        let stream = connect_tcp(&entry.endpoint(), self.config.connect_timeout()).await?;
        let scheduler = CommandScheduler::spawn(stream, self.config.to_scheduler_config(&entry.id));
        let handle = Arc::new(LinkHandle {
            brick_id: entry.id.clone(),
            scheduler: scheduler.clone(),
        });

        self.sessions.insert(entry.id.clone(), scheduler);
        self.registry
            .upsert_ready(entry.identity(), handle.clone(), handle);
        self.refresh.refresh_brick(&entry.id);
        Ok(())
    }

    /// First connection: `CONNECTING`, then `READY` or `ERROR`.
    async fn connect(&self, entry: &BrickEntry) -> Result<(), Ev3Error> {
        self.registry.upsert_connecting(entry.identity());
        self.refresh.refresh_brick(&entry.id);

        if let Err(e) = self.open(entry).await {
            error!(brick_id = %entry.id, "connect failed: {e}");
            self.registry.mark_error(&entry.id, e.to_string());
            self.refresh.refresh_brick(&entry.id);
            return Err(e);
        }
        Ok(())
    }

    /// Re-dial after link loss. On failure the brick stays unavailable
    /// with a link-loss reason so the poller tries again.
    async fn reconnect(&self, brick_id: &str) -> Result<(), Ev3Error> {
        let entry = self.entry(brick_id)?;
        match self.open(entry).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.registry
                    .mark_unavailable(brick_id, format!("{LINK_LOSS_PREFIX} {e}"));
                self.refresh.refresh_brick(brick_id);
                Err(e)
            }
        }
    }
}

// ── BrickMonitor ─────────────────────────────────────────────────

/// The top-level monitor.
pub struct BrickMonitor {
    dialer: Dialer,
    shutdown: CancellationToken,
}

impl BrickMonitor {
    /// Create a monitor that logs status changes.
    pub fn new(config: MonitorConfig) -> Self {
        Self::with_reporting(config, false)
    }

    /// Create a monitor; with `json` set, status changes are printed to
    /// stdout as JSON lines.
    pub fn with_reporting(config: MonitorConfig, json: bool) -> Self {
        let registry = Arc::new(BrickRegistry::new());
        let refresh: Arc<dyn RefreshSink> = Arc::new(SnapshotReporter::new(registry.clone(), json));
        let bricks = config
            .bricks
            .iter()
            .map(|b| (b.id.clone(), b.clone()))
            .collect();
        Self {
            dialer: Dialer {
                config: Arc::new(config),
                bricks: Arc::new(bricks),
                registry,
                sessions: Arc::new(SessionPool::new()),
                refresh,
            },
            shutdown: CancellationToken::new(),
        }
    }

    pub fn registry(&self) -> &Arc<BrickRegistry> {
        &self.dialer.registry
    }

    pub fn sessions(&self) -> &Arc<SessionPool> {
        &self.dialer.sessions
    }

    /// Obtain a token that stops [`run`](Self::run) when cancelled.
    pub fn stop_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Dial every configured brick concurrently. Failures leave the
    /// brick in `ERROR`; the monitor keeps running.
    pub async fn connect_all(&self) {
        let dials = self
            .dialer
            .config
            .bricks
            .iter()
            .map(|entry| self.dialer.connect(entry));
        let failed = join_all(dials).await.into_iter().filter(Result::is_err).count();
        if failed > 0 {
            warn!(failed, "some bricks could not be reached");
        }
    }

    /// Dial one configured brick.
    pub async fn connect_brick(&self, brick_id: &str) -> Result<(), Ev3Error> {
        let entry = self.dialer.entry(brick_id)?.clone();
        self.dialer.connect(&entry).await
    }

    /// Close a brick's session on request. The brick is never
    /// reconnected automatically afterwards.
    pub async fn disconnect_by_user(&self, brick_id: &str) {
        self.dialer.sessions.close_session(brick_id).await;
        self.dialer
            .registry
            .mark_unavailable(brick_id, USER_DISCONNECT_REASON);
        self.dialer.refresh.refresh_brick(brick_id);
    }

    /// Poller options wired back into this monitor.
    pub fn poller_options(&self) -> PollerOptions {
        let dialer = self.dialer.clone();
        self.dialer
            .config
            .to_poller_options()
            .on_disconnected(|brick_id, reason| {
                warn!(%brick_id, %reason, "brick disconnected");
            })
            .on_reconnect_requested(move |brick_id| {
                let dialer = dialer.clone();
                async move { dialer.reconnect(&brick_id).await }.boxed()
            })
    }

    /// Connect, then supervise until stopped.
    pub async fn run(&self) {
        info!(bricks = self.dialer.bricks.len(), "monitor starting");
        self.connect_all().await;

        let poller = create_connection_health_poller(
            self.dialer.registry.clone(),
            self.dialer.sessions.clone(),
            self.dialer.refresh.clone(),
            self.poller_options(),
        );

        self.shutdown.cancelled().await;

        poller.shutdown().await;
        self.dialer.sessions.close_all().await;
        self.dialer.registry.mark_all_unavailable("Monitor stopped.");
        info!("monitor stopped");
    }
}

// ── Tests ────────────────────────────────────────────────────────
