//! The task that owns the transport and serializes requests onto it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, trace, warn};

use super::{CommandRequest, CommandResult, Lane, SchedulerConfig, SchedulerState, Shared};
use crate::codec::Ev3FrameCodec;
use crate::error::Ev3Error;
use crate::orphan::{OrphanReason, OrphanRecovery, OrphanRecoveryContext};
use crate::packet::{decode_reply, encode_command_limited};
use crate::transport::Transport;

/// Upper bound on flushing and shutting down the write half on exit.
const CLOSE_TIMEOUT: Duration = Duration::from_millis(500);

pub(crate) struct Submission {
    pub(crate) request: CommandRequest,
    pub(crate) enqueued_at: Instant,
    pub(crate) reply_tx: oneshot::Sender<Result<CommandResult, Ev3Error>>,
}

impl Submission {
    fn resolve(self, outcome: Result<CommandResult, Ev3Error>) {
        // The caller may have stopped waiting; nothing to do then.
        let _ = self.reply_tx.send(outcome);
    }
}

/// Why the dispatcher stopped.
enum Exit {
    Disposed,
    /// Every handle was dropped.
    Abandoned,
    LinkClosed(String),
}

/// What happened to the inbound stream while waiting.
enum Inbound {
    Frame(Bytes),
    Closed(String),
}

pub(crate) struct Dispatcher<T: Transport> {
    reader: FramedRead<ReadHalf<T>, Ev3FrameCodec>,
    writer: FramedWrite<WriteHalf<T>, Ev3FrameCodec>,
    rx: mpsc::UnboundedReceiver<Submission>,
    rx_open: bool,
    shared: Arc<Shared>,
    config: SchedulerConfig,
    recovery: Arc<dyn OrphanRecovery>,
    high: VecDeque<Submission>,
    normal: VecDeque<Submission>,
    next_counter: u16,
}

impl<T: Transport> Dispatcher<T> {
    pub(crate) fn new(
        io: T,
        rx: mpsc::UnboundedReceiver<Submission>,
        shared: Arc<Shared>,
        config: SchedulerConfig,
        recovery: Arc<dyn OrphanRecovery>,
    ) -> Self {
        let (read_half, write_half) = tokio::io::split(io);
        let codec = Ev3FrameCodec::new(config.max_frame_size);
        Self {
            reader: FramedRead::new(read_half, codec.clone()),
            writer: FramedWrite::new(write_half, codec),
            rx,
            rx_open: true,
            shared,
            config,
            recovery,
            high: VecDeque::new(),
            normal: VecDeque::new(),
            next_counter: 0,
        }
    }

    pub(crate) async fn run(mut self) {
        let exit = loop {
            self.drain_submissions();

            if let Some(submission) = self.next_submission() {
                if let Err(exit) = self.dispatch(submission).await {
                    break exit;
                }
                continue;
            }

            if !self.rx_open {
                break Exit::Abandoned;
            }

            tokio::select! {
                biased;
                _ = self.shared.cancel.cancelled() => break Exit::Disposed,
                incoming = self.rx.recv() => match incoming {
                    Some(s) => self.enqueue(s),
                    None => self.rx_open = false,
                },
                inbound = next_inbound(&mut self.reader) => match inbound {
                    Inbound::Frame(frame) => {
                        debug!(len = frame.len(), "discarding unsolicited frame while idle");
                    }
                    Inbound::Closed(why) => break Exit::LinkClosed(why),
                },
            }
        };

        self.shutdown(exit).await;
    }

    // ── Queueing ─────────────────────────────────────────────────

    fn enqueue(&mut self, submission: Submission) {
        trace!(request_id = %submission.request.id, lane = %submission.request.lane, "queued");
        match submission.request.lane {
            Lane::High => self.high.push_back(submission),
            Lane::Normal => self.normal.push_back(submission),
        }
    }

    /// Move everything already submitted into the lanes so a high-lane
    /// request sent behind normal ones still overtakes them.
    fn drain_submissions(&mut self) {
        while let Ok(submission) = self.rx.try_recv() {
            self.enqueue(submission);
        }
    }

    fn next_submission(&mut self) -> Option<Submission> {
        let next = self.high.pop_front().or_else(|| self.normal.pop_front());
        if next.is_some() {
            self.shared.queued.fetch_sub(1, Ordering::SeqCst);
        }
        next
    }

    fn take_counter(&mut self) -> u16 {
        let counter = self.next_counter;
        self.next_counter = self.next_counter.wrapping_add(1);
        counter
    }

    // ── Dispatch ─────────────────────────────────────────────────

    /// Put one request on the wire and wait for its resolution.
    async fn dispatch(&mut self, submission: Submission) -> Result<(), Exit> {
        if !self.shared.state.transition(SchedulerState::Running) {
            submission.resolve(Err(Ev3Error::Disposed));
            return Err(Exit::Disposed);
        }

        let counter = self.take_counter();
        let request_id = submission.request.id.clone();
        let timeout = submission
            .request
            .timeout
            .unwrap_or(self.config.default_timeout);

        let frame = match encode_command_limited(
            counter,
            submission.request.kind,
            &submission.request.payload,
            self.config.max_frame_size,
        ) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(%request_id, "cannot encode command: {e}");
                self.shared.state.transition(SchedulerState::Idle);
                submission.resolve(Err(e.into()));
                return Ok(());
            }
        };

        let started_at = Instant::now();
        debug!(%request_id, counter, lane = %submission.request.lane, "dispatching");

        // The deadline covers the write too: a peer that stops reading
        // must not wedge the dispatcher.
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let written = tokio::select! {
            biased;
            _ = self.shared.cancel.cancelled() => {
                submission.resolve(Err(Ev3Error::Disposed));
                return Err(Exit::Disposed);
            }
            written = self.writer.send(frame) => written,
            _ = &mut deadline => {
                // Part of the frame may already be on the wire, so the
                // brick's framing is lost along with the outcome.
                warn!(%request_id, counter, ?timeout, "write stalled past deadline");
                self.orphan(submission, OrphanReason::Timeout).await;
                return Err(Exit::LinkClosed("write stalled".into()));
            }
        };

        if let Err(e) = written {
            warn!(%request_id, counter, "write failed: {e}");
            // Whatever part of the frame is still buffered must not be
            // flushed ahead of the next request.
            self.writer.write_buffer_mut().clear();
            let err = match e {
                Ev3Error::Transport(_) => e,
                other => Ev3Error::Transport(other.to_string()),
            };
            self.shared.state.transition(SchedulerState::Idle);
            submission.resolve(Err(err));
            return Ok(());
        }

        loop {
            tokio::select! {
                biased;
                _ = self.shared.cancel.cancelled() => {
                    submission.resolve(Err(Ev3Error::Disposed));
                    return Err(Exit::Disposed);
                }
                inbound = next_inbound(&mut self.reader) => match inbound {
                    Inbound::Frame(bytes) => match decode_reply(&bytes) {
                        Ok(reply) if reply.message_counter() == counter => {
                            let finished_at = Instant::now();
                            debug!(%request_id, counter, kind = ?reply.reply_kind(), "reply matched");
                            let result = CommandResult {
                                request_id,
                                message_counter: counter,
                                reply,
                                enqueued_at: submission.enqueued_at,
                                started_at,
                                finished_at,
                                duration: finished_at.duration_since(started_at),
                            };
                            self.shared.state.transition(SchedulerState::Idle);
                            submission.resolve(Ok(result));
                            return Ok(());
                        }
                        Ok(stale) => {
                            debug!(
                                expected = counter,
                                got = stale.message_counter(),
                                "discarding reply with retired counter"
                            );
                        }
                        Err(e) => warn!(counter, "discarding undecodable frame: {e}"),
                    },
                    Inbound::Closed(why) => {
                        self.orphan(submission, OrphanReason::TransportClosed).await;
                        return Err(Exit::LinkClosed(why));
                    }
                },
                _ = &mut deadline => {
                    warn!(%request_id, counter, ?timeout, "no reply before deadline");
                    self.orphan(submission, OrphanReason::Timeout).await;
                    return Ok(());
                }
                incoming = self.rx.recv(), if self.rx_open => match incoming {
                    Some(s) => self.enqueue(s),
                    None => self.rx_open = false,
                },
            }
        }
    }

    /// Run recovery (unless idempotent) and fail the request as orphaned.
    async fn orphan(&mut self, submission: Submission, reason: OrphanReason) {
        let context = OrphanRecoveryContext {
            request_id: submission.request.id.clone(),
            lane: submission.request.lane,
            reason,
        };

        if submission.request.idempotent {
            debug!(request_id = %context.request_id, %reason, "idempotent orphan; skipping recovery");
        } else {
            let recovery = Arc::clone(&self.recovery);
            run_recovery(recovery, self.config.recovery_timeout, context.clone()).await;
        }

        if reason == OrphanReason::Timeout {
            self.shared.state.transition(SchedulerState::Idle);
        }
        submission.resolve(Err(Ev3Error::Orphaned {
            request_id: context.request_id,
            reason,
        }));
    }

    // ── Shutdown ─────────────────────────────────────────────────

    async fn shutdown(mut self, exit: Exit) {
        self.shared.state.dispose();
        self.shared.cancel.cancel();

        self.rx.close();
        self.drain_submissions();

        let pending: Vec<Submission> = self.high.drain(..).chain(self.normal.drain(..)).collect();
        self.shared.queued.fetch_sub(pending.len(), Ordering::SeqCst);

        match &exit {
            Exit::Disposed => debug!(pending = pending.len(), "dispatcher stopping: disposed"),
            Exit::Abandoned => debug!("dispatcher stopping: all handles dropped"),
            Exit::LinkClosed(why) => {
                warn!(pending = pending.len(), "dispatcher stopping: link closed ({why})")
            }
        }

        for submission in pending {
            let err = match &exit {
                // Never written, so provably not executed.
                Exit::LinkClosed(why) => Ev3Error::Transport(format!("link closed: {why}")),
                Exit::Disposed | Exit::Abandoned => Ev3Error::Disposed,
            };
            submission.resolve(Err(err));
        }

        // A stalled or cancelled write can leave a partial frame behind.
        self.writer.write_buffer_mut().clear();
        match tokio::time::timeout(CLOSE_TIMEOUT, self.writer.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("closing transport: {e}"),
            Err(_) => debug!("closing transport timed out"),
        }
        self.shared.terminated.cancel();
    }
}

/// Recovery runs on its own task so a panicking strategy cannot take
/// the dispatcher down with it.
async fn run_recovery(
    recovery: Arc<dyn OrphanRecovery>,
    limit: Duration,
    context: OrphanRecoveryContext,
) {
    let request_id = context.request_id.clone();

    let task = tokio::spawn(async move {
        tokio::time::timeout(limit, recovery.recover(&context)).await
    });

    match task.await {
        Ok(Ok(Ok(()))) => debug!(%request_id, "orphan recovery completed"),
        Ok(Ok(Err(e))) => warn!(%request_id, "orphan recovery failed: {e}"),
        Ok(Err(_)) => warn!(%request_id, ?limit, "orphan recovery abandoned"),
        Err(e) => warn!(%request_id, "orphan recovery panicked: {e}"),
    }
}

async fn next_inbound<T: Transport>(reader: &mut FramedRead<ReadHalf<T>, Ev3FrameCodec>) -> Inbound {
    match reader.next().await {
        Some(Ok(frame)) => Inbound::Frame(frame),
        Some(Err(e)) => Inbound::Closed(e.to_string()),
        None => Inbound::Closed("end of stream".into()),
    }
}
