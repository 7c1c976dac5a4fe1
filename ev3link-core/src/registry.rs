//! Per-brick identity, status and runtime records.
//!
//! ```text
//!  CONNECTING ──► READY
//!      │            │
//!      └────┬───────┘
//!           ▼
//!      UNAVAILABLE          any ──► ERROR
//! ```
//!
//! `UNAVAILABLE` and `ERROR` are not terminal: a later `upsert_*` for the
//! same id re-enters `CONNECTING`/`READY`.
//!
//! The registry owns both the record map and the active-brick id behind a
//! single lock, so "at most one active record" is re-established on every
//! mutation. Records are replaced whole, never patched in place while a
//! reader could observe them.

use std::any::Any;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::scheduler::SchedulerState;
use crate::transport::TransportKind;

/// Prefix of `last_error` for automatic link loss. Only records carrying
/// it are eligible for automatic reconnection.
pub const LINK_LOSS_PREFIX: &str = "Connection lost:";

/// `last_error` written when the user disconnects a brick.
pub const USER_DISCONNECT_REASON: &str = "Disconnected by user.";

/// Opaque capability handle (file system, motor/sensor control).
pub type Capability = Arc<dyn Any + Send + Sync>;

// ── Identity ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrickRole {
    #[default]
    Standalone,
    /// Head of a daisy chain.
    Master,
    /// Chained behind a master brick.
    Slave,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrickIdentity {
    pub brick_id: String,
    pub display_name: String,
    pub role: BrickRole,
    pub transport: TransportKind,
    pub root_path: String,
}

impl BrickIdentity {
    pub fn new(brick_id: impl Into<String>, display_name: impl Into<String>, transport: TransportKind) -> Self {
        Self {
            brick_id: brick_id.into(),
            display_name: display_name.into(),
            role: BrickRole::Standalone,
            transport,
            root_path: "/home/root/lms2012/prjs/".into(),
        }
    }
}

// ── Status ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BrickStatus {
    Connecting,
    Ready,
    Unavailable,
    Error,
}

impl BrickStatus {
    /// `true` while a session is expected to exist.
    pub fn is_live(&self) -> bool {
        matches!(self, BrickStatus::Connecting | BrickStatus::Ready)
    }
}

impl fmt::Display for BrickStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrickStatus::Connecting => write!(f, "CONNECTING"),
            BrickStatus::Ready => write!(f, "READY"),
            BrickStatus::Unavailable => write!(f, "UNAVAILABLE"),
            BrickStatus::Error => write!(f, "ERROR"),
        }
    }
}

// ── Records ──────────────────────────────────────────────────────

#[derive(Clone)]
struct BrickRecord {
    identity: BrickIdentity,
    status: BrickStatus,
    last_seen_at_iso: Option<String>,
    last_error: Option<String>,
    last_operation: Option<String>,
    last_operation_at_iso: Option<String>,
    busy_command_count: usize,
    scheduler_state: Option<SchedulerState>,
    fs_service: Option<Capability>,
    control_service: Option<Capability>,
}

impl BrickRecord {
    fn fresh(identity: BrickIdentity, status: BrickStatus) -> Self {
        Self {
            identity,
            status,
            last_seen_at_iso: None,
            last_error: None,
            last_operation: None,
            last_operation_at_iso: None,
            busy_command_count: 0,
            scheduler_state: None,
            fs_service: None,
            control_service: None,
        }
    }

    fn snapshot(&self, is_active: bool) -> BrickSnapshot {
        BrickSnapshot {
            brick_id: self.identity.brick_id.clone(),
            display_name: self.identity.display_name.clone(),
            role: self.identity.role,
            transport: self.identity.transport,
            root_path: self.identity.root_path.clone(),
            status: self.status,
            is_active,
            last_seen_at_iso: self.last_seen_at_iso.clone(),
            last_error: self.last_error.clone(),
            last_operation: self.last_operation.clone(),
            last_operation_at_iso: self.last_operation_at_iso.clone(),
            busy_command_count: self.busy_command_count,
            scheduler_state: self.scheduler_state,
        }
    }
}

/// Read-only copy of a record; capability handles are not included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrickSnapshot {
    pub brick_id: String,
    pub display_name: String,
    pub role: BrickRole,
    pub transport: TransportKind,
    pub root_path: String,
    pub status: BrickStatus,
    pub is_active: bool,
    pub last_seen_at_iso: Option<String>,
    pub last_error: Option<String>,
    pub last_operation: Option<String>,
    pub last_operation_at_iso: Option<String>,
    pub busy_command_count: usize,
    pub scheduler_state: Option<SchedulerState>,
}

impl BrickSnapshot {
    /// `true` for an unavailable brick whose link dropped on its own.
    pub fn lost_link(&self) -> bool {
        self.status == BrickStatus::Unavailable
            && self
                .last_error
                .as_deref()
                .is_some_and(|e| e.starts_with(LINK_LOSS_PREFIX))
    }
}

/// Fields of [`BrickRegistry::update_runtime_metrics`]; `None` leaves the
/// stored value alone.
#[derive(Debug, Clone, Default)]
pub struct RuntimeMetrics {
    pub busy_command_count: Option<usize>,
    pub scheduler_state: Option<SchedulerState>,
    pub last_seen_at_iso: Option<String>,
}

// ── BrickRegistry ────────────────────────────────────────────────

#[derive(Default)]
struct Inner {
    records: HashMap<String, BrickRecord>,
    active: Option<String>,
}

impl Inner {
    fn mark_unavailable(&mut self, brick_id: &str, reason: &str) {
        let Some(prev) = self.records.get(brick_id) else {
            debug!(%brick_id, "mark_unavailable on unknown brick");
            return;
        };
        let mut record = prev.clone();
        record.status = BrickStatus::Unavailable;
        record.last_error = Some(reason.to_string());
        record.fs_service = None;
        record.control_service = None;
        record.busy_command_count = 0;
        record.scheduler_state = None;
        info!(%brick_id, %reason, "brick unavailable");
        self.records.insert(brick_id.to_string(), record);
        if self.active.as_deref() == Some(brick_id) {
            self.active = None;
        }
    }
}

#[derive(Default)]
pub struct BrickRegistry {
    inner: Mutex<Inner>,
}

fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

impl BrickRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock cannot leave a half-written
        // record behind, so the poisoned state is still consistent.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Status transitions ───────────────────────────────────────

    /// Create or overwrite the record as `CONNECTING` and make it active.
    pub fn upsert_connecting(&self, identity: BrickIdentity) -> BrickSnapshot {
        let mut inner = self.lock();
        let id = identity.brick_id.clone();
        let mut record = BrickRecord::fresh(identity, BrickStatus::Connecting);
        if let Some(prev) = inner.records.get(&id) {
            record.last_seen_at_iso = prev.last_seen_at_iso.clone();
            record.last_operation = prev.last_operation.clone();
            record.last_operation_at_iso = prev.last_operation_at_iso.clone();
        }
        info!(brick_id = %id, "brick connecting");
        inner.records.insert(id.clone(), record);
        inner.active = Some(id.clone());
        inner.records[&id].snapshot(true)
    }

    /// Create or overwrite the record as `READY` with its capability
    /// handles, and make it active.
    pub fn upsert_ready(
        &self,
        identity: BrickIdentity,
        fs_service: Capability,
        control_service: Capability,
    ) -> BrickSnapshot {
        let mut inner = self.lock();
        let id = identity.brick_id.clone();
        let mut record = BrickRecord::fresh(identity, BrickStatus::Ready);
        if let Some(prev) = inner.records.get(&id) {
            record.last_operation = prev.last_operation.clone();
            record.last_operation_at_iso = prev.last_operation_at_iso.clone();
        }
        record.last_seen_at_iso = Some(now_iso());
        record.fs_service = Some(fs_service);
        record.control_service = Some(control_service);
        info!(brick_id = %id, "brick ready");
        inner.records.insert(id.clone(), record);
        inner.active = Some(id.clone());
        inner.records[&id].snapshot(true)
    }

    /// Drop capability handles, set `UNAVAILABLE` and clear the active
    /// pointer if it pointed here. Unknown ids are ignored.
    pub fn mark_unavailable(&self, brick_id: &str, reason: impl Into<String>) {
        self.lock().mark_unavailable(brick_id, &reason.into());
    }

    /// Set `ERROR`, synthesizing a placeholder record for unknown ids.
    pub fn mark_error(&self, brick_id: &str, reason: impl Into<String>) {
        let mut inner = self.lock();
        let reason = reason.into();
        let mut record = match inner.records.get(brick_id) {
            Some(prev) => prev.clone(),
            None => BrickRecord::fresh(
                BrickIdentity::new(brick_id, brick_id, TransportKind::Mock),
                BrickStatus::Error,
            ),
        };
        record.status = BrickStatus::Error;
        record.last_error = Some(reason.clone());
        record.fs_service = None;
        record.control_service = None;
        info!(%brick_id, %reason, "brick error");
        inner.records.insert(brick_id.to_string(), record);
    }

    /// Mark every live record `UNAVAILABLE` with the same reason, under
    /// a single lock.
    pub fn mark_all_unavailable(&self, reason: &str) {
        let mut inner = self.lock();
        let ids: Vec<String> = inner
            .records
            .values()
            .filter(|r| r.status.is_live())
            .map(|r| r.identity.brick_id.clone())
            .collect();
        for id in ids {
            inner.mark_unavailable(&id, reason);
        }
    }

    /// Remove a record entirely. Returns `false` for unknown ids.
    pub fn remove(&self, brick_id: &str) -> bool {
        let mut inner = self.lock();
        let removed = inner.records.remove(brick_id).is_some();
        if removed && inner.active.as_deref() == Some(brick_id) {
            inner.active = None;
        }
        removed
    }

    // ── Active pointer ───────────────────────────────────────────

    /// Move the active pointer. Returns `false` for unknown ids.
    pub fn set_active_brick(&self, brick_id: &str) -> bool {
        let mut inner = self.lock();
        if !inner.records.contains_key(brick_id) {
            return false;
        }
        inner.active = Some(brick_id.to_string());
        true
    }

    pub fn get_active_brick_id(&self) -> Option<String> {
        self.lock().active.clone()
    }

    // ── Runtime fields ───────────────────────────────────────────

    /// Shallow update of runtime fields; never changes status.
    pub fn update_runtime_metrics(&self, brick_id: &str, metrics: RuntimeMetrics) {
        let mut inner = self.lock();
        let Some(prev) = inner.records.get(brick_id) else {
            return;
        };
        let mut record = prev.clone();
        if let Some(busy) = metrics.busy_command_count {
            record.busy_command_count = busy;
        }
        if let Some(state) = metrics.scheduler_state {
            record.scheduler_state = Some(state);
        }
        if let Some(seen) = metrics.last_seen_at_iso {
            record.last_seen_at_iso = Some(seen);
        }
        inner.records.insert(brick_id.to_string(), record);
    }

    /// Record the last operation performed on a brick.
    pub fn note_operation(&self, brick_id: &str, operation: impl Into<String>) {
        let mut inner = self.lock();
        let Some(prev) = inner.records.get(brick_id) else {
            return;
        };
        let now = now_iso();
        let mut record = prev.clone();
        record.last_operation = Some(operation.into());
        record.last_operation_at_iso = Some(now.clone());
        record.last_seen_at_iso = Some(now);
        inner.records.insert(brick_id.to_string(), record);
    }

    // ── Queries ──────────────────────────────────────────────────

    pub fn get_snapshot(&self, brick_id: &str) -> Option<BrickSnapshot> {
        let inner = self.lock();
        let active = inner.active.as_deref() == Some(brick_id);
        inner.records.get(brick_id).map(|r| r.snapshot(active))
    }

    /// All records, active first, then by display name (then id).
    pub fn list_snapshots(&self) -> Vec<BrickSnapshot> {
        let inner = self.lock();
        let mut snapshots: Vec<BrickSnapshot> = inner
            .records
            .values()
            .map(|r| {
                let active = inner.active.as_deref() == Some(r.identity.brick_id.as_str());
                r.snapshot(active)
            })
            .collect();
        snapshots.sort_by(|a, b| match (a.is_active, b.is_active) {
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            _ => a
                .display_name
                .cmp(&b.display_name)
                .then_with(|| a.brick_id.cmp(&b.brick_id)),
        });
        snapshots
    }

    /// Downcast the brick's file-system capability to `T`.
    pub fn resolve_fs_service<T: Any + Send + Sync>(&self, brick_id: &str) -> Option<Arc<T>> {
        let handle = self.lock().records.get(brick_id)?.fs_service.clone()?;
        handle.downcast::<T>().ok()
    }

    /// Downcast the brick's control capability to `T`.
    pub fn resolve_control_service<T: Any + Send + Sync>(&self, brick_id: &str) -> Option<Arc<T>> {
        let handle = self.lock().records.get(brick_id)?.control_service.clone()?;
        handle.downcast::<T>().ok()
    }

    /// `true` if any record is `READY` or `CONNECTING`.
    pub fn has_live_bricks(&self) -> bool {
        self.lock().records.values().any(|r| r.status.is_live())
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }
}

impl fmt::Debug for BrickRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("BrickRegistry")
            .field("records", &inner.records.len())
            .field("active", &inner.active)
            .finish()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeFs {
        root: &'static str,
    }
    struct FakeControl;

    fn identity(id: &str, name: &str) -> BrickIdentity {
        BrickIdentity::new(id, name, TransportKind::Tcp)
    }

    fn ready(reg: &BrickRegistry, id: &str, name: &str) {
        reg.upsert_ready(
            identity(id, name),
            Arc::new(FakeFs { root: "/prjs" }),
            Arc::new(FakeControl),
        );
    }

    fn active_count(reg: &BrickRegistry) -> usize {
        reg.list_snapshots().iter().filter(|s| s.is_active).count()
    }

    #[test]
    fn upsert_connecting_then_ready() {
        let reg = BrickRegistry::new();
        let snap = reg.upsert_connecting(identity("a", "Alpha"));
        assert_eq!(snap.status, BrickStatus::Connecting);
        assert!(snap.is_active);

        ready(&reg, "a", "Alpha");
        let snap = reg.get_snapshot("a").unwrap();
        assert_eq!(snap.status, BrickStatus::Ready);
        assert!(snap.last_seen_at_iso.is_some());
    }

    #[test]
    fn at_most_one_active_record() {
        let reg = BrickRegistry::new();
        ready(&reg, "a", "Alpha");
        ready(&reg, "b", "Bravo");
        reg.upsert_connecting(identity("c", "Charlie"));
        assert_eq!(active_count(&reg), 1);
        assert_eq!(reg.get_active_brick_id().as_deref(), Some("c"));

        assert!(reg.set_active_brick("a"));
        assert_eq!(active_count(&reg), 1);
        assert!(reg.get_snapshot("a").unwrap().is_active);
        assert!(!reg.get_snapshot("c").unwrap().is_active);
    }

    #[test]
    fn mark_unavailable_clears_active_and_capabilities() {
        let reg = BrickRegistry::new();
        ready(&reg, "a", "Alpha");
        assert!(reg.resolve_fs_service::<FakeFs>("a").is_some());

        reg.mark_unavailable("a", "Connection lost: timeout");
        let snap = reg.get_snapshot("a").unwrap();
        assert_eq!(snap.status, BrickStatus::Unavailable);
        assert_eq!(snap.last_error.as_deref(), Some("Connection lost: timeout"));
        assert!(snap.lost_link());
        assert_ne!(reg.get_active_brick_id().as_deref(), Some("a"));
        assert!(reg.resolve_fs_service::<FakeFs>("a").is_none());
        assert_eq!(active_count(&reg), 0);
    }

    #[test]
    fn mark_unavailable_keeps_other_active() {
        let reg = BrickRegistry::new();
        ready(&reg, "a", "Alpha");
        ready(&reg, "b", "Bravo");
        reg.mark_unavailable("a", USER_DISCONNECT_REASON);
        assert_eq!(reg.get_active_brick_id().as_deref(), Some("b"));
        assert!(!reg.get_snapshot("a").unwrap().lost_link());
    }

    #[test]
    fn mark_unavailable_unknown_is_noop() {
        let reg = BrickRegistry::new();
        reg.mark_unavailable("ghost", "whatever");
        assert!(reg.get_snapshot("ghost").is_none());
        assert!(reg.is_empty());
    }

    #[test]
    fn mark_error_synthesizes_placeholder() {
        let reg = BrickRegistry::new();
        reg.mark_error("ghost", "dial failed");
        let snap = reg.get_snapshot("ghost").unwrap();
        assert_eq!(snap.status, BrickStatus::Error);
        assert_eq!(snap.display_name, "ghost");
        assert!(!snap.is_active);
    }

    #[test]
    fn error_is_not_terminal() {
        let reg = BrickRegistry::new();
        reg.mark_error("a", "boom");
        reg.upsert_connecting(identity("a", "Alpha"));
        let snap = reg.get_snapshot("a").unwrap();
        assert_eq!(snap.status, BrickStatus::Connecting);
        assert!(snap.last_error.is_none());
    }

    #[test]
    fn set_active_unknown_fails() {
        let reg = BrickRegistry::new();
        ready(&reg, "a", "Alpha");
        assert!(!reg.set_active_brick("nope"));
        assert_eq!(reg.get_active_brick_id().as_deref(), Some("a"));
    }

    #[test]
    fn list_sorts_active_first_then_name() {
        let reg = BrickRegistry::new();
        ready(&reg, "z", "Zulu");
        ready(&reg, "b", "Bravo");
        ready(&reg, "a", "Alpha");
        reg.set_active_brick("z");

        let names: Vec<String> = reg
            .list_snapshots()
            .into_iter()
            .map(|s| s.display_name)
            .collect();
        assert_eq!(names, vec!["Zulu", "Alpha", "Bravo"]);
    }

    #[test]
    fn metrics_do_not_change_status() {
        let reg = BrickRegistry::new();
        ready(&reg, "a", "Alpha");
        reg.update_runtime_metrics(
            "a",
            RuntimeMetrics {
                busy_command_count: Some(3),
                scheduler_state: Some(SchedulerState::Running),
                last_seen_at_iso: None,
            },
        );
        reg.note_operation("a", "motor.start");

        let snap = reg.get_snapshot("a").unwrap();
        assert_eq!(snap.status, BrickStatus::Ready);
        assert_eq!(snap.busy_command_count, 3);
        assert_eq!(snap.scheduler_state, Some(SchedulerState::Running));
        assert_eq!(snap.last_operation.as_deref(), Some("motor.start"));
        assert!(snap.last_operation_at_iso.is_some());
    }

    #[test]
    fn mark_all_unavailable_only_touches_live() {
        let reg = BrickRegistry::new();
        ready(&reg, "a", "Alpha");
        reg.upsert_connecting(identity("b", "Bravo"));
        reg.mark_error("c", "bad");

        reg.mark_all_unavailable("Shutting down.");
        assert_eq!(reg.get_snapshot("a").unwrap().status, BrickStatus::Unavailable);
        assert_eq!(reg.get_snapshot("b").unwrap().status, BrickStatus::Unavailable);
        assert_eq!(reg.get_snapshot("c").unwrap().status, BrickStatus::Error);
        assert!(reg.get_active_brick_id().is_none());
        assert!(!reg.has_live_bricks());
    }

    #[test]
    fn mark_all_unavailable_is_never_half_applied() {
        use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

        let reg = Arc::new(BrickRegistry::new());
        for round in 0..50 {
            for i in 0..16 {
                ready(&reg, &format!("b{i:02}"), "Brick");
            }

            let done = Arc::new(AtomicBool::new(false));
            let reader = std::thread::spawn({
                let reg = reg.clone();
                let done = done.clone();
                move || {
                    while !done.load(AtomicOrdering::SeqCst) {
                        let snaps = reg.list_snapshots();
                        let ready = snaps.iter().filter(|s| s.status == BrickStatus::Ready).count();
                        assert!(ready == 0 || ready == snaps.len(), "saw {ready}/{} ready", snaps.len());
                        assert!(ready > 0 || snaps.iter().all(|s| !s.is_active));
                    }
                }
            });

            reg.mark_all_unavailable(&format!("stop {round}"));
            done.store(true, AtomicOrdering::SeqCst);
            reader.join().unwrap();
            assert_eq!(reg.get_active_brick_id(), None);
        }
    }

    #[test]
    fn resolve_with_wrong_type_is_none() {
        let reg = BrickRegistry::new();
        ready(&reg, "a", "Alpha");
        assert!(reg.resolve_control_service::<FakeFs>("a").is_none());
        assert!(reg.resolve_control_service::<FakeControl>("a").is_some());
        assert_eq!(reg.resolve_fs_service::<FakeFs>("a").unwrap().root, "/prjs");
    }

    #[test]
    fn remove_clears_active() {
        let reg = BrickRegistry::new();
        ready(&reg, "a", "Alpha");
        assert!(reg.remove("a"));
        assert!(!reg.remove("a"));
        assert!(reg.get_active_brick_id().is_none());
    }

    #[test]
    fn snapshot_serializes_camel_case() {
        let reg = BrickRegistry::new();
        reg.upsert_connecting(identity("a", "Alpha"));
        let json = serde_json::to_string(&reg.get_snapshot("a").unwrap()).unwrap();
        assert!(json.contains("\"brickId\":\"a\""));
        assert!(json.contains("\"status\":\"CONNECTING\""));
        assert!(json.contains("\"isActive\":true"));
    }
}
