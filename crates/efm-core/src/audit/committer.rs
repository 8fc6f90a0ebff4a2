//! The dedicated audit committer task.
//!
//! All writers in the process funnel audit events through a bounded channel
//! into a single committer task, which serializes appends onto the
//! [`AuditChain`]. A full channel surfaces as a typed
//! [`AuditError::Overloaded`] to the submitter; admission control upstream
//! turns that into request rejection and an incident-pressure bump.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::backend::AuditError;
use super::chain::AuditChain;
use super::entry::AuditEvent;
use crate::crypto::ContentHash;

/// Durability mode for the committer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Durability {
    /// Each append is acknowledged only after its durable commit.
    #[default]
    Sync,
    /// Appends are drained in groups; an acknowledgement covers the whole
    /// drained batch.
    Batch,
}

/// Default committer intake queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1_024;

/// Maximum number of requests drained per batch in [`Durability::Batch`].
const BATCH_DRAIN_LIMIT: usize = 64;

struct CommitRequest {
    event: AuditEvent,
    reply: oneshot::Sender<Result<(u64, ContentHash), AuditError>>,
}

/// Cloneable submitter side of the committer channel.
#[derive(Clone)]
pub struct AuditHandle {
    tx: mpsc::Sender<CommitRequest>,
}

impl AuditHandle {
    /// Submits an event and waits for its durable commit.
    ///
    /// # Errors
    ///
    /// - [`AuditError::Overloaded`] if the intake queue is full
    ///   (backpressure; the caller must reject its own admission).
    /// - [`AuditError::CommitterStopped`] if the committer has exited.
    /// - Any backend error from the commit itself.
    pub async fn append(&self, event: AuditEvent) -> Result<(u64, ContentHash), AuditError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .try_send(CommitRequest {
                event,
                reply: reply_tx,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => AuditError::Overloaded,
                mpsc::error::TrySendError::Closed(_) => AuditError::CommitterStopped,
            })?;
        reply_rx.await.map_err(|_| AuditError::CommitterStopped)?
    }

    /// Submits an event and waits even when the queue is momentarily full.
    ///
    /// Reserved for paths that must not drop their entry (override logging,
    /// halt commits); ordinary writers use [`AuditHandle::append`] so that
    /// overload surfaces as backpressure.
    ///
    /// # Errors
    ///
    /// - [`AuditError::CommitterStopped`] if the committer has exited.
    /// - Any backend error from the commit itself.
    pub async fn append_blocking(
        &self,
        event: AuditEvent,
    ) -> Result<(u64, ContentHash), AuditError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(CommitRequest {
                event,
                reply: reply_tx,
            })
            .await
            .map_err(|_| AuditError::CommitterStopped)?;
        reply_rx.await.map_err(|_| AuditError::CommitterStopped)?
    }
}

impl std::fmt::Debug for AuditHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditHandle")
            .field("capacity", &self.tx.capacity())
            .finish()
    }
}

/// Spawns the committer task.
///
/// Returns the submitter handle and the task join handle. The task exits
/// when every [`AuditHandle`] clone has been dropped.
#[must_use]
pub fn spawn_committer(
    chain: Arc<AuditChain>,
    durability: Durability,
    queue_capacity: usize,
) -> (AuditHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(queue_capacity.max(1));
    let task = tokio::spawn(run_committer(chain, durability, rx));
    (AuditHandle { tx }, task)
}

async fn run_committer(
    chain: Arc<AuditChain>,
    durability: Durability,
    mut rx: mpsc::Receiver<CommitRequest>,
) {
    info!(?durability, "audit committer started");

    match durability {
        Durability::Sync => {
            while let Some(request) = rx.recv().await {
                commit_one(&chain, request);
            }
        },
        Durability::Batch => {
            let mut buffer = Vec::with_capacity(BATCH_DRAIN_LIMIT);
            while rx.recv_many(&mut buffer, BATCH_DRAIN_LIMIT).await > 0 {
                for request in buffer.drain(..) {
                    commit_one(&chain, request);
                }
            }
        },
    }

    info!("audit committer stopped");
}

fn commit_one(chain: &AuditChain, request: CommitRequest) {
    let result = chain.append(request.event);
    if let Err(e) = &result {
        warn!(error = %e, "audit commit failed");
    }
    // A dropped reply receiver means the submitter gave up waiting; the
    // entry is committed regardless.
    let _ = request.reply.send(result);
}
