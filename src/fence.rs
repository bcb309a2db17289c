//! Producer/consumer fences and the fence waiter
//!
//! A [`Fence`] is a cloneable, reference-counted completion handle. Producers
//! signal it once; any number of holders may wait on it.
//!
//! [`FenceWaiter`] waits on the fences of a transaction before hardware is
//! programmed. Each fence gets a soft timeout of a few frame intervals; when
//! it elapses a warning is logged and the wait continues, bounded only by the
//! overall deadline.

use crate::config::TimingConfig;
use crate::error::FenceError;
use crate::output::OutputInfo;
use crate::transaction::CancelHandle;
use log::{debug, trace, warn};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

static NEXT_FENCE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, PartialEq, Eq)]
enum FenceState {
    Pending,
    Signaled,
    Failed(String),
    Cancelled,
}

/// Outcome of a single [`Fence::wait`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FenceStatus {
    Ready,
    TimedOut,
    Error(FenceError),
}

struct FenceInner {
    id: u64,
    state: watch::Sender<FenceState>,
}

/// Completion handle shared between a producer and its consumers
#[derive(Clone)]
pub struct Fence {
    inner: Arc<FenceInner>,
}

impl Default for Fence {
    fn default() -> Self {
        Self::new()
    }
}

impl Fence {
    /// Creates an unsignalled fence
    pub fn new() -> Self {
        let (state, _rx) = watch::channel(FenceState::Pending);
        Self {
            inner: Arc::new(FenceInner {
                id: NEXT_FENCE_ID.fetch_add(1, Ordering::Relaxed),
                state,
            }),
        }
    }

    /// Creates a fence that is already signalled
    pub fn signaled() -> Self {
        let fence = Self::new();
        fence.signal();
        fence
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Number of live references to this fence
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Marks the fence ready; returns `false` if it was already signalled
    pub fn signal(&self) -> bool {
        self.complete(FenceState::Signaled)
    }

    /// Marks the fence failed with `reason`
    pub fn signal_error(&self, reason: impl Into<String>) -> bool {
        self.complete(FenceState::Failed(reason.into()))
    }

    pub fn cancel(&self) -> bool {
        self.complete(FenceState::Cancelled)
    }

    fn complete(&self, outcome: FenceState) -> bool {
        let changed = self.inner.state.send_if_modified(|state| {
            if *state == FenceState::Pending {
                *state = outcome;
                true
            } else {
                false
            }
        });
        if !changed {
            debug!("Fence {} already signalled, ignoring", self.id());
        }
        changed
    }

    pub fn is_signaled(&self) -> bool {
        *self.inner.state.borrow() != FenceState::Pending
    }

    /// Result of the fence, `None` while pending
    pub fn status(&self) -> Option<Result<(), FenceError>> {
        let state = self.inner.state.borrow().clone();
        self.resolve(state)
    }

    fn resolve(&self, state: FenceState) -> Option<Result<(), FenceError>> {
        match state {
            FenceState::Pending => None,
            FenceState::Signaled => Some(Ok(())),
            FenceState::Failed(reason) => Some(Err(FenceError::Failed {
                fence: self.id(),
                reason,
            })),
            FenceState::Cancelled => Some(Err(FenceError::Cancelled(self.id()))),
        }
    }

    async fn settled(&self) -> FenceState {
        let mut rx = self.inner.state.subscribe();
        let state = match rx.wait_for(|state| *state != FenceState::Pending).await {
            Ok(state) => (*state).clone(),
            // The sender lives as long as `self`
            Err(_) => FenceState::Cancelled,
        };
        state
    }

    /// Waits for the fence, giving up after `timeout` (`None` waits forever)
    pub async fn wait(&self, timeout: Option<Duration>) -> FenceStatus {
        let state = match timeout {
            Some(limit) => match tokio::time::timeout(limit, self.settled()).await {
                Ok(state) => state,
                Err(_) => return FenceStatus::TimedOut,
            },
            None => self.settled().await,
        };

        match self.resolve(state) {
            Some(Ok(())) => FenceStatus::Ready,
            Some(Err(e)) => FenceStatus::Error(e),
            None => FenceStatus::TimedOut,
        }
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fence")
            .field("id", &self.id())
            .field("state", &*self.inner.state.borrow())
            .finish()
    }
}

/// Waits on a transaction's producer fences before hardware is programmed
#[derive(Debug, Clone)]
pub struct FenceWaiter {
    refresh_hz: u32,
    soft_frames: u32,
    interrupt: Option<CancelHandle>,
}

impl FenceWaiter {
    pub fn new(refresh_hz: u32, soft_frames: u32) -> Self {
        Self {
            refresh_hz: refresh_hz.max(1),
            soft_frames,
            interrupt: None,
        }
    }

    /// Waiter using the output's refresh rate, or the configured default
    pub fn for_output(info: &OutputInfo, timing: &TimingConfig) -> Self {
        Self::new(
            info.refresh_hz.unwrap_or(timing.default_refresh_hz),
            timing.fence_soft_frames,
        )
    }

    /// Lets `handle` abort pre-swap waits
    pub fn interruptible_by(mut self, handle: CancelHandle) -> Self {
        self.interrupt = Some(handle);
        self
    }

    /// `soft_frames` frame intervals, rounded up to whole milliseconds
    pub fn soft_timeout(&self) -> Duration {
        let hz = self.refresh_hz as u64;
        let ms = (self.soft_frames as u64 * 1000 + hz - 1) / hz;
        Duration::from_millis(ms)
    }

    /// Waits for every fence in order.
    ///
    /// Each fence is dropped once consumed, whatever the outcome. The first
    /// fence that fails aborts the whole wait. `deadline` bounds the total
    /// wait; with `None` a silent producer blocks forever. Only `pre_swap`
    /// waits can be interrupted through the cancel handle.
    pub async fn wait_all(
        &self,
        fences: Vec<Fence>,
        pre_swap: bool,
        deadline: Option<Instant>,
    ) -> Result<(), FenceError> {
        let soft = self.soft_timeout();
        let started = Instant::now();
        trace!(
            "Waiting on {} fences (pre_swap={}, soft timeout {:?})",
            fences.len(),
            pre_swap,
            soft
        );

        for fence in fences {
            let first_limit = match deadline {
                Some(deadline) => soft.min(deadline.saturating_duration_since(Instant::now())),
                None => soft,
            };

            match self.wait_one(&fence, Some(first_limit), pre_swap).await {
                FenceStatus::Ready => continue,
                FenceStatus::Error(e) => return Err(e),
                FenceStatus::TimedOut => {}
            }

            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            if remaining == Some(Duration::ZERO) {
                return Err(FenceError::Timeout {
                    fence: fence.id(),
                    waited: started.elapsed(),
                });
            }

            warn!(
                "⏳ Fence {} not signalled after {:?} ({} frames at {} Hz), still waiting",
                fence.id(),
                first_limit,
                self.soft_frames,
                self.refresh_hz
            );

            match self.wait_one(&fence, remaining, pre_swap).await {
                FenceStatus::Ready => {
                    debug!("Fence {} signalled late after {:?}", fence.id(), started.elapsed());
                }
                FenceStatus::Error(e) => return Err(e),
                FenceStatus::TimedOut => {
                    return Err(FenceError::Timeout {
                        fence: fence.id(),
                        waited: started.elapsed(),
                    })
                }
            }
        }

        Ok(())
    }

    async fn wait_one(&self, fence: &Fence, limit: Option<Duration>, pre_swap: bool) -> FenceStatus {
        match (&self.interrupt, pre_swap) {
            (Some(handle), true) => {
                if handle.is_cancelled() {
                    return FenceStatus::Error(FenceError::Interrupted(fence.id()));
                }
                tokio::select! {
                    status = fence.wait(limit) => status,
                    _ = handle.cancelled() => FenceStatus::Error(FenceError::Interrupted(fence.id())),
                }
            }
            _ => fence.wait(limit).await,
        }
    }
}
