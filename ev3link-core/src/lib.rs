//! # ev3link-core
//!
//! Command scheduling and link health for LEGO EV3 bricks.
//!
//! This crate contains:
//! - **Wire types**: `PacketHeader`, `Packet`, `CommandKind`, `ReplyKind`, `SystemCommand`
//! - **Bytecode**: operand encoders and the `DirectCommand` builder
//! - **Codec**: `Ev3FrameCodec` for length-prefixed stream I/O via `tokio_util`
//! - **Transport**: the `Transport` bound and TCP dialing with the unlock handshake
//! - **Scheduler**: `CommandScheduler`, single-flight request/reply correlation with priority lanes
//! - **Orphan recovery**: pluggable `OrphanRecovery` strategies
//! - **Registry**: `BrickRegistry`, per-brick status with a single active brick
//! - **Sessions**: `SessionPool` mapping brick ids to schedulers
//! - **Poller**: `create_connection_health_poller`, probing and automatic reconnection
//! - **Error**: `Ev3Error`, typed, `thiserror`-based error hierarchy

pub mod bytecode;
pub mod codec;
pub mod error;
pub mod header;
pub mod message;
pub mod orphan;
pub mod packet;
pub mod poller;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod transport;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use bytecode::{DirectCommand, system_command};
pub use codec::Ev3FrameCodec;
pub use error::{DecodeError, EncodeError, Ev3Error};
pub use header::{HEADER_SIZE, PacketHeader};
pub use message::{CommandKind, PROBE_COMMAND, ReplyKind, SystemCommand, SystemReplyStatus};
pub use orphan::{
    FnRecovery, LoggingRecovery, NoopRecovery, OrphanReason, OrphanRecovery, OrphanRecoveryContext,
};
pub use packet::{MAX_FRAME_SIZE, MAX_PAYLOAD_SIZE, Packet, PacketKind};
pub use poller::{PollerHandle, PollerOptions, create_connection_health_poller};
pub use registry::{
    BrickIdentity, BrickRegistry, BrickRole, BrickSnapshot, BrickStatus, Capability,
    LINK_LOSS_PREFIX, RuntimeMetrics, USER_DISCONNECT_REASON,
};
pub use scheduler::{
    CommandRequest, CommandResult, CommandScheduler, Lane, SchedulerConfig,
    SchedulerRuntimeSnapshot, SchedulerState,
};
pub use session::{NoopRefresh, RefreshSink, Session, SessionPool, SessionSource};
pub use transport::{DEFAULT_TCP_PORT, TcpEndpoint, Transport, TransportKind, connect_tcp};
