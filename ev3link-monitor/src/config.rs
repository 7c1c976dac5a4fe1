//! Configuration for the brick monitor.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use ev3link_core::{
    BrickIdentity, DEFAULT_TCP_PORT, HEADER_SIZE, MAX_FRAME_SIZE, PollerOptions, SchedulerConfig,
    TcpEndpoint, TransportKind,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Shortest interval or timeout accepted from a config file.
const MIN_MILLIS: u64 = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid brick override {0:?}: expected id=host[:port]")]
    InvalidOverride(String),

    #[error("duplicate brick id {0:?}")]
    DuplicateBrick(String),

    #[error("brick {0:?} has no host")]
    MissingHost(String),
}

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Scheduler tuning shared by every brick.
    pub scheduler: SchedulerSection,
    /// Health poller tuning.
    pub health: HealthSection,
    /// Logging settings.
    pub logging: LoggingConfig,
    /// Bricks to connect to at startup.
    pub bricks: Vec<BrickEntry>,
}

/// One brick reachable over TCP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrickEntry {
    pub id: String,
    /// Display name; defaults to the id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Serial number for the unlock handshake, if the brick requires one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
}

fn default_port() -> u16 {
    DEFAULT_TCP_PORT
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    /// Timeout for commands that do not set their own.
    pub default_timeout_ms: u64,
    /// Upper bound on one orphan recovery run.
    pub recovery_timeout_ms: u64,
    /// Largest frame body accepted on the wire.
    pub max_frame_size: usize,
    /// TCP dial and unlock timeout.
    pub connect_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSection {
    pub active_interval_ms: u64,
    pub idle_interval_ms: u64,
    pub probe_timeout_ms: u64,
    /// Omit for `max(1000, 2 × active_interval_ms)`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnect_interval_ms: Option<u64>,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            default_timeout_ms: 2000,
            recovery_timeout_ms: 2000,
            max_frame_size: MAX_FRAME_SIZE,
            connect_timeout_ms: 3000,
        }
    }
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            active_interval_ms: 500,
            idle_interval_ms: 2000,
            probe_timeout_ms: 700,
            reconnect_interval_ms: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── BrickEntry ───────────────────────────────────────────────────

impl BrickEntry {
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            name: None,
            host: host.into(),
            port,
            serial: None,
        }
    }

    /// Parse a `--brick id=host[:port]` override.
    pub fn parse_override(arg: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidOverride(arg.to_string());
        let (id, addr) = arg.split_once('=').ok_or_else(invalid)?;
        if id.trim().is_empty() {
            return Err(invalid());
        }
        let endpoint = TcpEndpoint::parse(addr.trim()).map_err(|_| invalid())?;
        Ok(Self::new(id.trim(), endpoint.host, endpoint.port))
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    pub fn endpoint(&self) -> TcpEndpoint {
        let endpoint = TcpEndpoint::new(self.host.clone(), self.port);
        match &self.serial {
            Some(serial) => endpoint.with_serial(serial.clone()),
            None => endpoint,
        }
    }

    pub fn identity(&self) -> BrickIdentity {
        BrickIdentity::new(self.id.clone(), self.display_name(), TransportKind::Tcp)
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl MonitorConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Add or replace bricks from `--brick` overrides.
    pub fn apply_overrides(&mut self, overrides: &[String]) -> Result<(), ConfigError> {
        for arg in overrides {
            let entry = BrickEntry::parse_override(arg)?;
            match self.bricks.iter_mut().find(|b| b.id == entry.id) {
                Some(existing) => {
                    existing.host = entry.host;
                    existing.port = entry.port;
                }
                None => self.bricks.push(entry),
            }
        }
        Ok(())
    }

    /// Reject brick lists the monitor cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for brick in &self.bricks {
            if brick.host.trim().is_empty() {
                return Err(ConfigError::MissingHost(brick.id.clone()));
            }
            if !seen.insert(brick.id.as_str()) {
                return Err(ConfigError::DuplicateBrick(brick.id.clone()));
            }
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.scheduler.connect_timeout_ms.max(MIN_MILLIS))
    }

    /// Scheduler settings for one brick.
    pub fn to_scheduler_config(&self, label: &str) -> SchedulerConfig {
        let s = &self.scheduler;
        SchedulerConfig {
            label: label.to_string(),
            default_timeout: Duration::from_millis(s.default_timeout_ms.max(MIN_MILLIS)),
            max_frame_size: s.max_frame_size.clamp(HEADER_SIZE + 1, u16::MAX as usize),
            recovery_timeout: Duration::from_millis(s.recovery_timeout_ms.max(MIN_MILLIS)),
        }
    }

    /// Poller timings; callbacks are attached by the monitor.
    pub fn to_poller_options(&self) -> PollerOptions {
        let h = &self.health;
        let active = h.active_interval_ms.max(MIN_MILLIS);
        PollerOptions {
            active_interval: Duration::from_millis(active),
            idle_interval: Duration::from_millis(h.idle_interval_ms.max(active)),
            probe_timeout: Duration::from_millis(h.probe_timeout_ms.max(MIN_MILLIS)),
            reconnect_interval: h
                .reconnect_interval_ms
                .map(|ms| Duration::from_millis(ms.max(MIN_MILLIS))),
            ..PollerOptions::default()
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let cfg = MonitorConfig::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        assert!(text.contains("default_timeout_ms"));
        assert!(text.contains("probe_timeout_ms"));
        assert!(!text.contains("reconnect_interval_ms"));
    }

    #[test]
    fn parses_brick_list() {
        let text = r#"
            [health]
            active_interval_ms = 250

            [[bricks]]
            id = "left"
            host = "192.168.1.20"

            [[bricks]]
            id = "right"
            name = "Right arm"
            host = "192.168.1.21"
            port = 6000
            serial = "0016533F0C1E"
        "#;
        let cfg: MonitorConfig = toml::from_str(text).unwrap();
        assert_eq!(cfg.bricks.len(), 2);
        assert_eq!(cfg.bricks[0].port, DEFAULT_TCP_PORT);
        assert_eq!(cfg.bricks[0].display_name(), "left");
        assert_eq!(cfg.bricks[1].display_name(), "Right arm");
        assert_eq!(cfg.bricks[1].endpoint().serial.as_deref(), Some("0016533F0C1E"));
        assert_eq!(cfg.health.active_interval_ms, 250);
        assert_eq!(cfg.health.idle_interval_ms, 2000);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn overrides_add_and_replace() {
        let mut cfg = MonitorConfig::default();
        cfg.bricks.push(BrickEntry::new("a", "10.0.0.1", 5555));
        cfg.apply_overrides(&["a=10.0.0.9:7000".into(), "b=10.0.0.2".into()])
            .unwrap();
        assert_eq!(cfg.bricks.len(), 2);
        assert_eq!(cfg.bricks[0].host, "10.0.0.9");
        assert_eq!(cfg.bricks[0].port, 7000);
        assert_eq!(cfg.bricks[1].port, DEFAULT_TCP_PORT);
    }

    #[test]
    fn bad_override_is_rejected() {
        let mut cfg = MonitorConfig::default();
        assert!(matches!(
            cfg.apply_overrides(&["no-equals".into()]),
            Err(ConfigError::InvalidOverride(_))
        ));
        assert!(cfg.apply_overrides(&["=host".into()]).is_err());
        assert!(cfg.apply_overrides(&["x=host:notaport".into()]).is_err());
    }

    #[test]
    fn duplicate_ids_fail_validation() {
        let mut cfg = MonitorConfig::default();
        cfg.bricks.push(BrickEntry::new("a", "h1", 1));
        cfg.bricks.push(BrickEntry::new("a", "h2", 2));
        assert!(matches!(cfg.validate(), Err(ConfigError::DuplicateBrick(_))));
    }

    #[test]
    fn conversions_clamp() {
        let mut cfg = MonitorConfig::default();
        cfg.scheduler.default_timeout_ms = 0;
        cfg.scheduler.max_frame_size = 1;
        cfg.health.active_interval_ms = 800;
        cfg.health.idle_interval_ms = 100;

        let sched = cfg.to_scheduler_config("a");
        assert_eq!(sched.label, "a");
        assert_eq!(sched.default_timeout, Duration::from_millis(MIN_MILLIS));
        assert_eq!(sched.max_frame_size, HEADER_SIZE + 1);

        let poll = cfg.to_poller_options();
        assert_eq!(poll.idle_interval, Duration::from_millis(800));
        assert_eq!(poll.effective_reconnect_interval(), Duration::from_millis(1600));
    }
}
