//! Client-side transaction description
//!
//! A [`Transaction`] lists the configuration each output should switch to.
//! It is consumed by validation, which turns it into a
//! [`PreparedTransaction`](crate::validator::PreparedTransaction).
//!
//! ```
//! use overlay_commit::output::OutputId;
//! use overlay_commit::transaction::{OutputUpdate, PlaneState, Transaction};
//!
//! let txn = Transaction::new()
//!     .with(OutputUpdate::enable(OutputId(0))
//!         .plane(PlaneState::new(1, 0))
//!         .plane(PlaneState::new(2, 1)));
//! assert_eq!(txn.len(), 1);
//! ```

use crate::fence::Fence;
use crate::output::OutputId;
use std::sync::Arc;
use tokio::sync::watch;

/// Identifier of a plane as known to the client
pub type PlaneId = u32;

/// Opaque reference to a producer buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle {
    pub id: u64,
    /// DRM fourcc of the buffer's pixel format
    pub format: u32,
}

/// Requested state of one plane
#[derive(Debug, Clone)]
pub struct PlaneState {
    pub plane: PlaneId,
    /// Stacking position, lower is further back
    pub zpos: u32,
    /// Planes that are bound but not visible get no window
    pub visible: bool,
    pub buffer: Option<BufferHandle>,
    /// Signalled by the producer once `buffer` is ready to scan out
    pub fence: Option<Fence>,
}

impl PlaneState {
    pub fn new(plane: PlaneId, zpos: u32) -> Self {
        Self {
            plane,
            zpos,
            visible: true,
            buffer: None,
            fence: None,
        }
    }

    pub fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }

    pub fn buffer(mut self, buffer: BufferHandle) -> Self {
        self.buffer = Some(buffer);
        self
    }

    pub fn fence(mut self, fence: Fence) -> Self {
        self.fence = Some(fence);
        self
    }
}

/// Requested configuration of one output
#[derive(Debug, Clone)]
pub struct OutputUpdate {
    pub output: OutputId,
    pub active: bool,
    pub planes: Vec<PlaneState>,
    /// Output captured by a write-back output
    pub writeback_source: Option<OutputId>,
    /// Signalled once the new frame is on screen (or the commit failed)
    pub out_fence: Option<Fence>,
}

impl OutputUpdate {
    /// Turns the output on (or keeps it on) with the planes added afterwards
    pub fn enable(output: OutputId) -> Self {
        Self {
            output,
            active: true,
            planes: Vec::new(),
            writeback_source: None,
            out_fence: None,
        }
    }

    /// Turns the output off, releasing all of its windows
    pub fn disable(output: OutputId) -> Self {
        Self {
            active: false,
            ..Self::enable(output)
        }
    }

    pub fn plane(mut self, plane: PlaneState) -> Self {
        self.planes.push(plane);
        self
    }

    pub fn writeback_source(mut self, source: OutputId) -> Self {
        self.writeback_source = Some(source);
        self
    }

    pub fn out_fence(mut self, fence: Fence) -> Self {
        self.out_fence = Some(fence);
        self
    }

    pub(crate) fn visible_planes(&self) -> impl Iterator<Item = &PlaneState> {
        self.planes.iter().filter(|p| p.visible)
    }

    /// Windows this configuration needs: none when off, one per visible
    /// plane, and one color-fill window for an active output with no planes
    pub fn required_windows(&self) -> u32 {
        if !self.active {
            return 0;
        }
        (self.visible_planes().count() as u32).max(1)
    }
}

/// Cancels a transaction that has not started running yet
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `cancel` has been called
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// Set of output updates applied all together or not at all
#[derive(Debug)]
pub struct Transaction {
    updates: Vec<OutputUpdate>,
    cancel: CancelHandle,
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl Transaction {
    pub fn new() -> Self {
        Self {
            updates: Vec::new(),
            cancel: CancelHandle::new(),
        }
    }

    pub fn with(mut self, update: OutputUpdate) -> Self {
        self.updates.push(update);
        self
    }

    pub fn push(&mut self, update: OutputUpdate) {
        self.updates.push(update);
    }

    pub fn updates(&self) -> &[OutputUpdate] {
        &self.updates
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    /// Handle that can cancel this transaction until it starts running
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub(crate) fn into_parts(self) -> (Vec<OutputUpdate>, CancelHandle) {
        (self.updates, self.cancel)
    }
}
