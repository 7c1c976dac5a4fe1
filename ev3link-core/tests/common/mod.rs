//! An in-process fake brick on the far end of a duplex pipe.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use ev3link_core::packet::{decode_command, encode_reply};
use ev3link_core::{
    CommandKind, CommandScheduler, Ev3FrameCodec, OrphanRecovery, Packet, PacketKind, ReplyKind,
    SchedulerConfig,
};
use futures::{SinkExt, StreamExt};
use tokio::io::DuplexStream;
use tokio_util::codec::Framed;

pub struct FakeBrick {
    framed: Framed<DuplexStream, Ev3FrameCodec>,
}

impl FakeBrick {
    /// Next command frame, or `None` once the scheduler hung up.
    pub async fn recv(&mut self) -> Option<Packet> {
        let frame = self.framed.next().await?.ok()?;
        Some(decode_command(&frame).expect("scheduler sent a malformed command"))
    }

    /// Like [`recv`](Self::recv) but gives up after `wait`.
    pub async fn try_recv(&mut self, wait: Duration) -> Option<Packet> {
        tokio::time::timeout(wait, self.recv()).await.ok().flatten()
    }

    pub async fn reply(&mut self, counter: u16, kind: ReplyKind, payload: &[u8]) {
        let frame = encode_reply(counter, kind, payload).unwrap();
        self.framed.send(frame).await.unwrap();
    }

    /// Write an arbitrary frame body, bypassing packet encoding.
    pub async fn send_raw(&mut self, body: &[u8]) {
        self.framed.send(Bytes::copy_from_slice(body)).await.unwrap();
    }

    /// Write bytes straight onto the pipe, bypassing framing.
    pub async fn send_unframed(&mut self, bytes: &[u8]) {
        use tokio::io::AsyncWriteExt;
        self.framed.get_mut().write_all(bytes).await.unwrap();
    }

    /// Answer every command with a success reply until the scheduler
    /// hangs up. System commands get their command byte echoed with a
    /// success status.
    pub fn spawn_echo(mut self, seen: Arc<AtomicUsize>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(cmd) = self.recv().await {
                seen.fetch_add(1, Ordering::SeqCst);
                let counter = cmd.message_counter();
                match (cmd.kind(), cmd.payload().first()) {
                    (PacketKind::Command(CommandKind::SystemReply), Some(&op)) => {
                        self.reply(counter, ReplyKind::SystemReply, &[op, 0x00]).await
                    }
                    _ => self.reply(counter, ReplyKind::DirectReply, &[]).await,
                }
            }
        })
    }
}

pub fn config(label: &str) -> SchedulerConfig {
    SchedulerConfig {
        default_timeout: Duration::from_secs(5),
        recovery_timeout: Duration::from_millis(500),
        ..SchedulerConfig::labeled(label)
    }
}

pub fn connect(label: &str) -> (CommandScheduler, FakeBrick) {
    let (ours, theirs) = tokio::io::duplex(4096);
    let scheduler = CommandScheduler::spawn(ours, config(label));
    (scheduler, FakeBrick { framed: Framed::new(theirs, Ev3FrameCodec::default()) })
}

pub fn connect_with_recovery(
    label: &str,
    recovery: Arc<dyn OrphanRecovery>,
) -> (CommandScheduler, FakeBrick) {
    let (ours, theirs) = tokio::io::duplex(4096);
    let scheduler = CommandScheduler::spawn_with_recovery(ours, config(label), recovery);
    (scheduler, FakeBrick { framed: Framed::new(theirs, Ev3FrameCodec::default()) })
}

/// Poll `cond` until it holds or `within` elapses.
pub async fn eventually(within: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
