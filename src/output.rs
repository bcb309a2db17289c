//! Display outputs and their window state
//!
//! Every registered output owns an [`OutputSlot`]: its static description,
//! the committed [`OutputState`], and the pending flag that keeps a second
//! transaction out while one is in flight.

use crate::mask::{WindowId, WindowMask};
use crate::transaction::{BufferHandle, PlaneId};
use crate::worker::{WorkerHandle, WorkerState};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Identifier handed out at registration; ids grow in registration order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OutputId(pub u32);

impl fmt::Display for OutputId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Type of display sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    /// Built-in panel
    Panel,
    /// External connector (DisplayPort, HDMI)
    External,
    /// Write-back capture of another output's composition
    Writeback,
}

/// Static description of a registered output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputInfo {
    pub id: OutputId,
    pub name: String,
    pub kind: OutputKind,
    /// Most windows this output can composite at once
    pub max_windows: u8,
    /// Current refresh rate, if known
    pub refresh_hz: Option<u32>,
}

/// Plane bound to a window for the current frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowAssignment {
    pub plane: PlaneId,
    pub window: WindowId,
    pub zpos: u32,
    pub buffer: Option<BufferHandle>,
}

/// Window bookkeeping of one output
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputState {
    /// Whether the output is driving a screen
    pub active: bool,
    /// Windows bound to this output
    pub reserved: WindowMask,
    /// Windows released by the last transaction, returned to the pool once
    /// the hardware retires the old frame
    pub freed_pending: WindowMask,
    /// Reserved windows carrying a plane this frame
    pub visible: WindowMask,
    /// Plane to window bindings, bottom to top
    pub assignments: Vec<WindowAssignment>,
    /// Source output captured by a write-back output
    pub writeback_source: Option<OutputId>,
}

impl OutputState {
    /// Windows counted against this output by the allocator
    pub fn window_count(&self) -> u32 {
        if self.active {
            self.reserved.count()
        } else {
            0
        }
    }

    /// Active with a placeholder window and no plane on it
    pub fn is_color_fill(&self) -> bool {
        self.active && self.visible.is_empty() && !self.reserved.is_empty()
    }
}

/// Registry entry for one output
pub(crate) struct OutputSlot {
    pub info: OutputInfo,
    state: RwLock<OutputState>,
    pending: AtomicBool,
    idle: Notify,
    pub worker: WorkerHandle,
}

impl OutputSlot {
    pub fn new(info: OutputInfo, worker: WorkerHandle) -> Self {
        Self {
            info,
            state: RwLock::new(OutputState::default()),
            pending: AtomicBool::new(false),
            idle: Notify::new(),
            worker,
        }
    }

    pub fn id(&self) -> OutputId {
        self.info.id
    }

    pub fn state(&self) -> RwLockReadGuard<'_, OutputState> {
        self.state.read()
    }

    pub fn state_mut(&self) -> RwLockWriteGuard<'_, OutputState> {
        self.state.write()
    }

    /// Marks a transaction in flight; fails if one already is
    pub fn try_claim(&self) -> bool {
        self.pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn release_claim(&self) {
        let was = self.pending.swap(false, Ordering::AcqRel);
        debug_assert!(was, "output {} released an unclaimed slot", self.info.id);
        self.idle.notify_waiters();
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    pub fn worker_state(&self) -> WorkerState {
        self.worker.state()
    }

    /// Resolves once no transaction is in flight for this output
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_pending() {
                return;
            }
            notified.await;
        }
    }
}

impl fmt::Debug for OutputSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputSlot")
            .field("info", &self.info)
            .field("pending", &self.is_pending())
            .finish_non_exhaustive()
    }
}

/// Registered outputs keyed by id, iterated in registration order
#[derive(Debug, Default)]
pub(crate) struct OutputRegistry {
    slots: RwLock<BTreeMap<OutputId, Arc<OutputSlot>>>,
    next_id: AtomicU32,
}

impl OutputRegistry {
    pub fn next_id(&self) -> OutputId {
        OutputId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn insert(&self, slot: Arc<OutputSlot>) {
        self.slots.write().insert(slot.id(), slot);
    }

    pub fn remove(&self, id: OutputId) -> Option<Arc<OutputSlot>> {
        self.slots.write().remove(&id)
    }

    pub fn get(&self, id: OutputId) -> Option<Arc<OutputSlot>> {
        self.slots.read().get(&id).cloned()
    }

    pub fn find_by_name(&self, name: &str) -> Option<Arc<OutputSlot>> {
        self.slots
            .read()
            .values()
            .find(|slot| slot.info.name == name)
            .cloned()
    }

    pub fn all(&self) -> Vec<Arc<OutputSlot>> {
        self.slots.read().values().cloned().collect()
    }

    /// Active write-back outputs whose committed state captures `source`
    pub fn capturers_of(&self, source: OutputId) -> Vec<Arc<OutputSlot>> {
        self.all()
            .into_iter()
            .filter(|slot| {
                let state = slot.state();
                state.active && state.writeback_source == Some(source)
            })
            .collect()
    }

    /// Whether any output holds freed windows of a transaction still in flight
    pub fn release_in_flight(&self) -> bool {
        self.all()
            .iter()
            .any(|slot| slot.is_pending() && !slot.state().freed_pending.is_empty())
    }
}
