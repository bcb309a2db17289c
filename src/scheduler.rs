//! Commit scheduling
//!
//! A prepared transaction is committed in one of two modes:
//!
//! - **Blocking**: producer fences are waited on first, before the swap, so a
//!   stuck producer can still be cancelled. Then the new states are swapped
//!   in and the caller awaits the hardware phase on a spawned task.
//! - **NonBlocking**: the states are swapped immediately and the hardware
//!   phase is handed to the worker of the transaction's first output. The
//!   returned [`CommitTicket`] carries the final result.

use crate::display::Shared;
use crate::error::{CommitError, FenceError};
use crate::fence::FenceWaiter;
use crate::output::OutputId;
use crate::validator::PreparedTransaction;
use crate::worker::{self, CommitJob};
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// How `commit` waits for the hardware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    /// Return once the frame is on screen
    Blocking,
    /// Return after the swap; the worker programs the hardware
    NonBlocking,
}

#[derive(Debug)]
enum TicketState {
    Done,
    Pending {
        output: OutputId,
        rx: oneshot::Receiver<Result<(), CommitError>>,
    },
}

/// Result of a commit, available once its hardware phase finished
#[derive(Debug)]
#[must_use = "a ticket carries the result of a non-blocking commit"]
pub struct CommitTicket {
    state: TicketState,
}

impl CommitTicket {
    fn done() -> Self {
        Self {
            state: TicketState::Done,
        }
    }

    /// Whether the commit ran to completion already
    pub fn is_done(&self) -> bool {
        matches!(self.state, TicketState::Done)
    }

    /// Waits for the hardware phase and returns its outcome
    pub async fn wait(self) -> Result<(), CommitError> {
        match self.state {
            TicketState::Done => Ok(()),
            TicketState::Pending { output, rx } => {
                rx.await.unwrap_or(Err(CommitError::WorkerGone(output)))
            }
        }
    }
}

/// Swaps validated states in and drives the hardware phase
#[derive(Clone)]
pub struct CommitScheduler {
    shared: Arc<Shared>,
}

impl CommitScheduler {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Commits `prepared`.
    ///
    /// Errors before the swap (cancellation, pre-swap fence failure) roll the
    /// transaction back. Errors after the swap still return the freed
    /// windows to the pool.
    pub async fn commit(
        &self,
        mut prepared: PreparedTransaction,
        mode: CommitMode,
    ) -> Result<CommitTicket, CommitError> {
        if prepared.is_cancelled() {
            debug!("Transaction cancelled before commit");
            return Err(CommitError::Cancelled);
        }

        let Some(first) = prepared.first_slot().cloned() else {
            return Ok(CommitTicket::done());
        };

        match mode {
            CommitMode::Blocking => {
                let fences = prepared.take_fences();
                if !fences.is_empty() {
                    let waiter = FenceWaiter::for_output(&first.info, &self.shared.timing)
                        .interruptible_by(prepared.cancel_handle());
                    let deadline = self.shared.timing.fence_timeout().map(|t| Instant::now() + t);
                    match waiter.wait_all(fences, true, deadline).await {
                        Ok(()) => {}
                        Err(FenceError::Interrupted(_)) => return Err(CommitError::Cancelled),
                        Err(e) => {
                            warn!("⚠️ Pre-swap fence wait failed on {}: {}", first.info.name, e);
                            return Err(e.into());
                        }
                    }
                }
                if prepared.is_cancelled() {
                    return Err(CommitError::Cancelled);
                }

                let txn = prepared.swap();
                // Detached so the frame still retires if this future is dropped.
                worker::spawn_execute(self.shared.worker_context(), txn, false)
                    .await
                    .unwrap_or(Err(CommitError::WorkerGone(first.id())))?;
                info!("✅ Blocking commit on {} complete", first.info.name);
                Ok(CommitTicket::done())
            }
            CommitMode::NonBlocking => {
                let txn = prepared.swap();
                let (reply, rx) = oneshot::channel();

                if let Err(job) = first.worker.submit(CommitJob { txn, reply }) {
                    warn!("⚠️ Worker for {} unavailable, committing on a new task", first.info.name);
                    let ctx = self.shared.worker_context();
                    tokio::spawn(async move {
                        let result = worker::execute(&ctx, job.txn, true).await;
                        let _ = job.reply.send(result);
                    });
                }

                debug!("📨 Commit queued on worker for {}", first.info.name);
                Ok(CommitTicket {
                    state: TicketState::Pending {
                        output: first.id(),
                        rx,
                    },
                })
            }
        }
    }
}
