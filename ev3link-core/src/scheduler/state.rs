//! Scheduler lifecycle state and its monitoring projection.
//!
//! ```text
//!   Idle ──dispatch──► Running ──resolve──► Idle
//!     │                   │
//!     └──────dispose──────┴──────► Disposed (terminal)
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::Serialize;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerState {
    #[default]
    Idle = 0,
    Running = 1,
    Disposed = 2,
}

impl SchedulerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SchedulerState::Idle,
            1 => SchedulerState::Running,
            _ => SchedulerState::Disposed,
        }
    }

    pub fn is_disposed(&self) -> bool {
        matches!(self, SchedulerState::Disposed)
    }
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerState::Idle => write!(f, "idle"),
            SchedulerState::Running => write!(f, "running"),
            SchedulerState::Disposed => write!(f, "disposed"),
        }
    }
}

/// Lock-free cell holding a [`SchedulerState`].
///
/// `Disposed` is sticky: once stored, later transitions are ignored.
#[derive(Debug, Default)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn get(&self) -> SchedulerState {
        SchedulerState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Move between `Idle` and `Running`. Returns `false` if disposed.
    pub(crate) fn transition(&self, to: SchedulerState) -> bool {
        let disposed = SchedulerState::Disposed as u8;
        self.0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| {
                (cur != disposed).then_some(to as u8)
            })
            .is_ok()
    }

    /// Enter `Disposed`. Returns `true` only for the first call.
    pub(crate) fn dispose(&self) -> bool {
        self.0.swap(SchedulerState::Disposed as u8, Ordering::SeqCst)
            != SchedulerState::Disposed as u8
    }
}

/// Read-only projection of a live scheduler for monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerRuntimeSnapshot {
    pub state: SchedulerState,
    pub queued_commands: usize,
    /// `queued_commands` plus one while a command is on the wire.
    pub busy_command_count: usize,
}

impl SchedulerRuntimeSnapshot {
    pub fn new(state: SchedulerState, queued_commands: usize) -> Self {
        let running = usize::from(state == SchedulerState::Running);
        Self {
            state,
            queued_commands,
            busy_command_count: queued_commands + running,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_idle() {
        assert_eq!(StateCell::default().get(), SchedulerState::Idle);
    }

    #[test]
    fn idle_running_cycle() {
        let cell = StateCell::default();
        assert!(cell.transition(SchedulerState::Running));
        assert_eq!(cell.get(), SchedulerState::Running);
        assert!(cell.transition(SchedulerState::Idle));
        assert_eq!(cell.get(), SchedulerState::Idle);
    }

    #[test]
    fn disposed_is_terminal() {
        let cell = StateCell::default();
        assert!(cell.dispose());
        assert!(!cell.dispose());
        assert!(!cell.transition(SchedulerState::Idle));
        assert_eq!(cell.get(), SchedulerState::Disposed);
    }

    #[test]
    fn busy_count_includes_running_command() {
        let snap = SchedulerRuntimeSnapshot::new(SchedulerState::Running, 2);
        assert_eq!(snap.busy_command_count, 3);
        let snap = SchedulerRuntimeSnapshot::new(SchedulerState::Idle, 2);
        assert_eq!(snap.busy_command_count, 2);
    }

    #[test]
    fn display_format() {
        assert_eq!(SchedulerState::Running.to_string(), "running");
        assert_eq!(SchedulerState::Disposed.to_string(), "disposed");
    }
}
