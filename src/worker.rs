//! Per-output commit worker
//!
//! Each registered output gets one tokio task that runs the hardware phase
//! of non-blocking commits: wait on producer fences, program the windows,
//! wait for the frame to retire, then return the freed windows to the pool.
//! Jobs arrive through a single-slot mailbox; the pending claim on the
//! output guarantees the slot is free when a job is sent.

use crate::config::TimingConfig;
use crate::error::{CommitError, HwError};
use crate::fence::{Fence, FenceWaiter};
use crate::hw::{Completion, DisplayHardware, FrameConfig};
use crate::output::{OutputId, OutputSlot, OutputState};
use crate::window_pool::WindowPool;
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Whether the worker is programming hardware right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Running,
}

/// Output of a swapped transaction, ready for the hardware phase
pub(crate) struct CommittedOutput {
    pub slot: Arc<OutputSlot>,
    pub state: OutputState,
    pub out_fence: Option<Fence>,
}

/// Transaction after the state swap.
///
/// Until it is retired it owns the pending claims and the freed windows of
/// its outputs; dropping it unretired retires it with an error.
pub(crate) struct CommittedTransaction {
    pub outputs: Vec<CommittedOutput>,
    /// Producer fences not yet waited on
    pub fences: Vec<Fence>,
    pool: Arc<WindowPool>,
}

impl CommittedTransaction {
    pub fn new(outputs: Vec<CommittedOutput>, fences: Vec<Fence>, pool: Arc<WindowPool>) -> Self {
        Self {
            outputs,
            fences,
            pool,
        }
    }

    /// Returns freed windows to the pool, signals the completion fences and
    /// drops the pending claims. `failure` is reported through the fences.
    fn retire(&mut self, failure: Option<String>) {
        for output in self.outputs.drain(..) {
            {
                let mut state = output.slot.state_mut();
                let freed = std::mem::take(&mut state.freed_pending);
                if !freed.is_empty() {
                    info!("♻️ Output {} returned windows {} to the pool", output.slot.id(), freed);
                    self.pool.release(freed);
                }
            }

            if let Some(fence) = output.out_fence {
                match &failure {
                    None => fence.signal(),
                    Some(reason) => fence.signal_error(reason.clone()),
                };
            }

            output.slot.release_claim();
        }
    }
}

impl Drop for CommittedTransaction {
    fn drop(&mut self) {
        if !self.outputs.is_empty() {
            warn!(
                "⚠️ Commit on output {} abandoned before retirement",
                self.outputs[0].slot.id()
            );
            self.retire(Some("commit abandoned before the frame retired".into()));
        }
    }
}

pub(crate) struct CommitJob {
    pub txn: CommittedTransaction,
    pub reply: oneshot::Sender<Result<(), CommitError>>,
}

/// What the worker needs from the core, without holding the registry
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub hardware: Arc<dyn DisplayHardware>,
    pub timing: TimingConfig,
}

/// Sending side of an output's worker
pub(crate) struct WorkerHandle {
    mailbox: mpsc::Sender<CommitJob>,
    running: Arc<AtomicBool>,
    _task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Spawns the worker task for `output` on the current runtime
    pub fn spawn(output: OutputId, ctx: WorkerContext) -> Self {
        let (mailbox, rx) = mpsc::channel(1);
        let running = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(run_worker(output, ctx, rx, running.clone()));
        Self {
            mailbox,
            running,
            _task: task,
        }
    }

    pub fn state(&self) -> WorkerState {
        if self.running.load(Ordering::Acquire) {
            WorkerState::Running
        } else {
            WorkerState::Idle
        }
    }

    /// Hands a job to the worker, giving it back if the mailbox is unusable
    pub fn submit(&self, job: CommitJob) -> Result<(), CommitJob> {
        self.mailbox.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(job) => job,
            mpsc::error::TrySendError::Closed(job) => job,
        })
    }
}

async fn run_worker(
    output: OutputId,
    ctx: WorkerContext,
    mut rx: mpsc::Receiver<CommitJob>,
    running: Arc<AtomicBool>,
) {
    debug!("👷 Worker for output {} started", output);

    while let Some(job) = rx.recv().await {
        running.store(true, Ordering::Release);
        let result = execute(&ctx, job.txn, true).await;
        running.store(false, Ordering::Release);

        if let Err(e) = &result {
            warn!("⚠️ Commit on output {} failed: {}", output, e);
        }
        // The caller may have dropped its ticket; the result is then only logged.
        let _ = job.reply.send(result);
    }

    debug!("👷 Worker for output {} stopped", output);
}

/// Runs the hardware phase of a swapped transaction, then retires it.
///
/// Retirement (freed windows back to the pool, completion fences, pending
/// claims) happens whether or not the hardware phase succeeded.
pub(crate) async fn execute(
    ctx: &WorkerContext,
    mut txn: CommittedTransaction,
    wait_fences: bool,
) -> Result<(), CommitError> {
    let fences = std::mem::take(&mut txn.fences);
    let result = program_and_wait(ctx, &txn, fences, wait_fences).await;
    txn.retire(result.as_ref().err().map(|e| e.to_string()));
    result
}

/// Runs [`execute`] on its own task.
///
/// The hardware phase and the retirement finish even if the caller stops
/// waiting on the returned handle.
pub(crate) fn spawn_execute(
    ctx: WorkerContext,
    txn: CommittedTransaction,
    wait_fences: bool,
) -> JoinHandle<Result<(), CommitError>> {
    tokio::spawn(async move { execute(&ctx, txn, wait_fences).await })
}

async fn program_and_wait(
    ctx: &WorkerContext,
    txn: &CommittedTransaction,
    fences: Vec<Fence>,
    wait_fences: bool,
) -> Result<(), CommitError> {
    let Some(first) = txn.outputs.first() else {
        return Ok(());
    };

    if wait_fences && !fences.is_empty() {
        let waiter = FenceWaiter::for_output(&first.slot.info, &ctx.timing);
        let deadline = ctx.timing.fence_timeout().map(|t| Instant::now() + t);
        waiter.wait_all(fences, false, deadline).await?;
    } else {
        drop(fences);
    }

    for output in &txn.outputs {
        let frame = FrameConfig::from_state(output.slot.id(), &output.state);
        ctx.hardware.program(&output.slot.info, &frame)?;
    }

    for output in &txn.outputs {
        let info = &output.slot.info;
        let limit = ctx.timing.frame_done_timeout();
        match tokio::time::timeout(limit, ctx.hardware.wait_completion(info)).await {
            Ok(Completion::FrameDone) => debug!("Frame done on {}", info.name),
            Ok(Completion::InstantOff) => debug!("{} switched off", info.name),
            Ok(Completion::DeadlockError) => {
                error!("❌ Deadlock reported on {}", info.name);
                return Err(HwError::Deadlock(info.id).into());
            }
            Err(_) => {
                return Err(HwError::CompletionTimeout {
                    output: info.id,
                    waited: limit,
                }
                .into())
            }
        }
    }

    Ok(())
}


#[cfg(test)]
mod tests {
    use crate::config::{CoreConfig, OutputConfig};
    use crate::display::DisplayCore;
    use crate::fence::Fence;
    use crate::hw::sim::SimulatedHardware;
    use crate::mask::WindowMask;
    use crate::output::OutputKind;
    use crate::transaction::{OutputUpdate, PlaneState, Transaction};
    use crate::{CommitMode, FenceError};
    use std::sync::Arc;

    fn core(windows: u8) -> DisplayCore {
        let mut config = CoreConfig::default();
        config.pool.windows = windows;
        config.outputs.clear();
        DisplayCore::new(config, Arc::new(SimulatedHardware::new()))
    }

    #[tokio::test]
    async fn test_dropped_commit_retires_outputs() {
        let core = core(4);
        let out = core.register_output(&OutputConfig::new("A", OutputKind::Panel, 4)).unwrap();
        let three = (0..3).fold(OutputUpdate::enable(out), |u, z| u.plane(PlaneState::new(z, z)));
        core.submit(Transaction::new().with(three), CommitMode::Blocking)
            .await
            .unwrap();

        let done = Fence::new();
        let one = OutputUpdate::enable(out)
            .plane(PlaneState::new(0, 0))
            .out_fence(done.clone());
        let prepared = core.validate(Transaction::new().with(one)).await.unwrap();
        let committed = prepared.swap();
        assert_eq!(
            core.output_state(out).unwrap().freed_pending,
            WindowMask::from_bits(0b0011)
        );

        drop(committed);
        assert!(!core.is_pending(out));
        assert!(core.output_state(out).unwrap().freed_pending.is_empty());
        assert_eq!(core.pool().available(), WindowMask::from_bits(0b1011));
        assert!(matches!(done.status(), Some(Err(FenceError::Failed { .. }))));
    }

    #[tokio::test]
    async fn test_spawned_execute_survives_dropped_handle() {
        let core = core(4);
        let out = core.register_output(&OutputConfig::new("A", OutputKind::Panel, 4)).unwrap();
        let prepared = core
            .validate(Transaction::new().with(OutputUpdate::enable(out).plane(PlaneState::new(0, 0))))
            .await
            .unwrap();

        let ctx = super::WorkerContext {
            hardware: Arc::new(SimulatedHardware::new()),
            timing: core.timing().clone(),
        };
        drop(super::spawn_execute(ctx, prepared.swap(), false));

        tokio::time::timeout(std::time::Duration::from_secs(1), core.wait_idle(out))
            .await
            .unwrap();
        assert_eq!(core.output_state(out).unwrap().visible.count(), 1);
        assert_eq!(core.pool().available().count(), 3);
    }
}
