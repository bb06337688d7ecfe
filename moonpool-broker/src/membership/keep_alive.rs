//! Liveness heartbeat for the local member.
//!
//! One task per directory republishes the local member's `i_am_alive_time`
//! every `heartbeat_interval`, under revision control:
//!
//! ```text
//!  tick ──► read cached record ──► stamp clock.now() ──► update_if_revision
//!                                                          │
//!            ok: cache advances to the new revision ◄──────┤
//!            conflict: warn, re-read the key, next tick ◄──┤
//!            other error: warn, next tick ◄────────────────┘
//! ```
//!
//! A failed tick only delays liveness visibility; nothing escapes the task.
//! The loop exits on its [`CancellationToken`] and is joined with a bounded
//! wait by the directory's shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::directory::{join_within, DirectoryCore};
use crate::address::MemberAddress;
use crate::error::MembershipError;

/// A running keep-alive loop.
#[derive(Debug)]
pub(crate) struct KeepAliveHandle {
    address: MemberAddress,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl KeepAliveHandle {
    pub(crate) fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal the loop to stop without waiting.
    pub(crate) fn cancel(&self) {
        self.token.cancel();
    }

    /// Signal the loop and wait at most `timeout` for it to exit.
    pub(crate) async fn stop(self, timeout: Duration) -> Result<(), MembershipError> {
        self.token.cancel();
        let result = join_within(self.task, timeout, "keep-alive").await;
        tracing::debug!(address = %self.address, "keep-alive stopped");
        result
    }
}

pub(crate) fn spawn(
    core: Arc<DirectoryCore>,
    address: MemberAddress,
    interval: Duration,
) -> KeepAliveHandle {
    let token = CancellationToken::new();
    let task = tokio::spawn(run(core, address, interval, token.clone()));
    tracing::info!(address = %address, ?interval, "keep-alive started");
    KeepAliveHandle {
        address,
        token,
        task,
    }
}

async fn run(
    core: Arc<DirectoryCore>,
    address: MemberAddress,
    interval: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => tick(&core, &address).await,
        }
    }
}

async fn tick(core: &DirectoryCore, address: &MemberAddress) {
    match core.update_i_am_alive(address).await {
        Ok(revision) => {
            tracing::debug!(address = %address, revision = %revision, "heartbeat published");
        }
        Err(e) if e.is_conflict() => {
            tracing::warn!(address = %address, error = %e, "heartbeat lost a revision race");
            if let Err(e) = core.reload_one(address).await {
                tracing::warn!(address = %address, error = %e, "re-reading member after conflict failed");
            }
        }
        Err(e) => {
            tracing::warn!(address = %address, error = %e, "heartbeat failed");
        }
    }
}
