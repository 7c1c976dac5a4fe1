//! Request and result types exchanged with the scheduler.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Serialize;

use crate::error::Ev3Error;
use crate::message::CommandKind;
use crate::packet::Packet;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

// ── Lane ─────────────────────────────────────────────────────────

/// Priority class of a queued request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Lane {
    #[default]
    Normal,
    /// Drained completely before any normal-lane request is dispatched.
    High,
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lane::Normal => write!(f, "normal"),
            Lane::High => write!(f, "high"),
        }
    }
}

// ── CommandRequest ───────────────────────────────────────────────

/// A logical command submitted to a [`CommandScheduler`].
///
/// [`CommandScheduler`]: crate::scheduler::CommandScheduler
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub id: String,
    pub lane: Lane,
    /// Re-issuing after an unknown outcome is safe; orphan recovery is
    /// skipped for idempotent requests.
    pub idempotent: bool,
    /// `None` falls back to the scheduler's default timeout.
    pub timeout: Option<Duration>,
    pub kind: CommandKind,
    pub payload: Bytes,
}

impl CommandRequest {
    /// A normal-lane, non-idempotent request with a generated id.
    pub fn new(kind: CommandKind, payload: impl Into<Bytes>) -> Self {
        let n = NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            id: format!("cmd-{n}"),
            lane: Lane::Normal,
            idempotent: false,
            timeout: None,
            kind,
            payload: payload.into(),
        }
    }

    pub fn direct(payload: impl Into<Bytes>) -> Self {
        Self::new(CommandKind::DirectReply, payload)
    }

    pub fn system(payload: impl Into<Bytes>) -> Self {
        Self::new(CommandKind::SystemReply, payload)
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn lane(mut self, lane: Lane) -> Self {
        self.lane = lane;
        self
    }

    pub fn high(self) -> Self {
        self.lane(Lane::High)
    }

    pub fn idempotent(mut self) -> Self {
        self.idempotent = true;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

// ── CommandResult ────────────────────────────────────────────────

/// The resolution of a request that received a matching reply.
///
/// Produced for success and for brick-side rejections alike; use
/// [`ensure_success`](Self::ensure_success) to turn the latter into an
/// error.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub request_id: String,
    pub message_counter: u16,
    pub reply: Packet,
    pub enqueued_at: Instant,
    pub started_at: Instant,
    pub finished_at: Instant,
    pub duration: Duration,
}

impl CommandResult {
    pub fn duration_ms(&self) -> u64 {
        self.duration.as_millis() as u64
    }

    /// Time spent waiting in a lane before dispatch.
    pub fn queue_wait(&self) -> Duration {
        self.started_at.saturating_duration_since(self.enqueued_at)
    }

    /// Fails with [`Ev3Error::Protocol`] if the brick rejected the command.
    pub fn ensure_success(self) -> Result<Self, Ev3Error> {
        let Some(kind) = self.reply.reply_kind() else {
            return Err(Ev3Error::Other("result carries a command packet".into()));
        };
        if kind.is_error() {
            let detail = match self.reply.system_status() {
                Some((echo, status)) => format!("command {echo:#04x} status {status:?}"),
                None => format!("request {}", self.request_id),
            };
            return Err(Ev3Error::Protocol { kind, detail });
        }
        Ok(self)
    }
}
