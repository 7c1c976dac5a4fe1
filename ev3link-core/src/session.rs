//! Live sessions: one scheduler per connected brick.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::scheduler::{CommandScheduler, SchedulerRuntimeSnapshot};

/// The pairing of one brick id with the scheduler that owns its link.
#[derive(Debug, Clone)]
pub struct Session {
    pub brick_id: String,
    pub scheduler: CommandScheduler,
}

/// Where the health poller finds live sessions.
#[async_trait]
pub trait SessionSource: Send + Sync {
    fn list_session_brick_ids(&self) -> Vec<String>;

    fn get_session(&self, brick_id: &str) -> Option<Session>;

    /// Tear down the session for `brick_id`. Unknown ids are ignored.
    async fn close_session(&self, brick_id: &str);

    fn runtime_snapshot(&self, brick_id: &str) -> Option<SchedulerRuntimeSnapshot>;
}

/// Notified after a brick's status changed.
pub trait RefreshSink: Send + Sync {
    fn refresh_brick(&self, brick_id: &str);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRefresh;

impl RefreshSink for NoopRefresh {
    fn refresh_brick(&self, _brick_id: &str) {}
}

impl<F> RefreshSink for F
where
    F: Fn(&str) + Send + Sync,
{
    fn refresh_brick(&self, brick_id: &str) {
        self(brick_id)
    }
}

// ── SessionPool ──────────────────────────────────────────────────

/// Concurrent map of brick id to [`Session`].
#[derive(Default)]
pub struct SessionPool {
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a scheduler for `brick_id`, disposing any previous one.
    pub fn insert(&self, brick_id: impl Into<String>, scheduler: CommandScheduler) {
        let brick_id = brick_id.into();
        let session = Session {
            brick_id: brick_id.clone(),
            scheduler,
        };
        let previous = self.lock().insert(brick_id.clone(), session);
        if let Some(previous) = previous {
            debug!(%brick_id, "replacing session");
            previous.scheduler.dispose();
        } else {
            info!(%brick_id, "session opened");
        }
    }

    /// Dispose every session and wait for the dispatchers to exit.
    pub async fn close_all(&self) {
        let sessions: Vec<Session> = self.lock().drain().map(|(_, s)| s).collect();
        for session in &sessions {
            session.scheduler.dispose();
        }
        for session in sessions {
            session.scheduler.closed().await;
            info!(brick_id = %session.brick_id, "session closed");
        }
    }

    pub fn contains(&self, brick_id: &str) -> bool {
        self.lock().contains_key(brick_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[async_trait]
impl SessionSource for SessionPool {
    fn list_session_brick_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn get_session(&self, brick_id: &str) -> Option<Session> {
        self.lock().get(brick_id).cloned()
    }

    async fn close_session(&self, brick_id: &str) {
        let Some(session) = self.lock().remove(brick_id) else {
            return;
        };
        session.scheduler.dispose();
        session.scheduler.closed().await;
        info!(%brick_id, "session closed");
    }

    fn runtime_snapshot(&self, brick_id: &str) -> Option<SchedulerRuntimeSnapshot> {
        self.lock().get(brick_id).map(|s| s.scheduler.snapshot())
    }
}

impl fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionPool")
            .field("sessions", &self.list_session_brick_ids())
            .finish()
    }
}
