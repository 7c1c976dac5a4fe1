//! Orphan recovery: reconciling the brick after a lost reply.
//!
//! When a request is abandoned without a matched reply the scheduler
//! cannot tell whether the brick executed it. Before the failure is
//! reported to the caller, and before the next request is dispatched,
//! the scheduler hands an [`OrphanRecoveryContext`] to the configured
//! [`OrphanRecovery`] strategy.
//!
//! Recovery is bounded by the scheduler's `recovery_timeout`; errors
//! and timeouts are logged and swallowed.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Serialize;
use tracing::warn;

use crate::error::Ev3Error;
use crate::scheduler::Lane;

/// Why a request lost track of its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum OrphanReason {
    Timeout,
    TransportClosed,
}

impl fmt::Display for OrphanReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrphanReason::Timeout => write!(f, "timeout"),
            OrphanReason::TransportClosed => write!(f, "transport closed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanRecoveryContext {
    pub request_id: String,
    pub lane: Lane,
    pub reason: OrphanReason,
}

/// Strategy run by the scheduler for every orphaned, non-idempotent
/// request.
#[async_trait]
pub trait OrphanRecovery: Send + Sync {
    async fn recover(&self, context: &OrphanRecoveryContext) -> Result<(), Ev3Error>;
}

/// Does nothing. Valid when every command is idempotent.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRecovery;

#[async_trait]
impl OrphanRecovery for NoopRecovery {
    async fn recover(&self, _context: &OrphanRecoveryContext) -> Result<(), Ev3Error> {
        Ok(())
    }
}

/// Records every orphan at warn level and otherwise leaves the brick alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingRecovery;

#[async_trait]
impl OrphanRecovery for LoggingRecovery {
    async fn recover(&self, context: &OrphanRecoveryContext) -> Result<(), Ev3Error> {
        warn!(
            request_id = %context.request_id,
            lane = %context.lane,
            reason = %context.reason,
            "command outcome unknown; brick state not reconciled"
        );
        Ok(())
    }
}

type RecoverFn = dyn Fn(OrphanRecoveryContext) -> BoxFuture<'static, Result<(), Ev3Error>> + Send + Sync;

/// Adapts an async closure into a strategy.
///
/// ```ignore
/// let recovery = FnRecovery::new(|ctx| async move {
///     query_motor_state(&ctx.request_id).await
/// });
/// ```
#[derive(Clone)]
pub struct FnRecovery {
    f: Arc<RecoverFn>,
}

impl FnRecovery {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(OrphanRecoveryContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Ev3Error>> + Send + 'static,
    {
        Self {
            f: Arc::new(move |ctx| Box::pin(f(ctx))),
        }
    }
}

impl fmt::Debug for FnRecovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnRecovery").finish_non_exhaustive()
    }
}

#[async_trait]
impl OrphanRecovery for FnRecovery {
    async fn recover(&self, context: &OrphanRecoveryContext) -> Result<(), Ev3Error> {
        (self.f)(context.clone()).await
    }
}
