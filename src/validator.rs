//! Transaction validation and window allocation
//!
//! Validation turns a [`Transaction`] into a [`PreparedTransaction`]:
//!
//! 1. Topology checks against the registry and the [`Capabilities`]
//!    collaborator.
//! 2. A pending claim on every output, rejecting outputs that still have a
//!    transaction in flight.
//! 3. Per output, in registration order, the window delta between the
//!    committed state and the requested one. Shrinking outputs move their
//!    surplus into `freed_pending`; growing outputs take windows from the
//!    pool, with one bounded retry when another output is about to release
//!    windows.
//! 4. Plane to window binding for the new state, lowest window at the back.
//!
//! Only growth touches the pool. If any output cannot grow, the windows
//! already taken for earlier outputs go back and every claim is dropped, so
//! a failed validation leaves no trace.
//!
//! [`Capabilities`]: crate::hw::Capabilities

use crate::display::Shared;
use crate::error::ValidationError;
use crate::fence::Fence;
use crate::mask::WindowMask;
use crate::output::{OutputId, OutputKind, OutputSlot, OutputState, WindowAssignment};
use crate::transaction::{CancelHandle, OutputUpdate, PlaneState, Transaction};
use crate::worker::{CommittedOutput, CommittedTransaction};
use log::{debug, info, trace};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// One output of a prepared transaction
pub(crate) struct PreparedOutput {
    pub slot: Arc<OutputSlot>,
    pub old: OutputState,
    pub new: OutputState,
    pub planes: Vec<PlaneState>,
    pub out_fence: Option<Fence>,
}

/// Validated transaction holding its windows and pending claims.
///
/// Dropping it (or calling [`cancel`](Self::cancel)) before commit returns
/// the windows taken from the pool and releases the claims.
pub struct PreparedTransaction {
    shared: Arc<Shared>,
    outputs: Vec<PreparedOutput>,
    /// Windows taken from the pool for growing outputs
    acquired: WindowMask,
    cancel: CancelHandle,
}

impl PreparedTransaction {
    fn new(shared: Arc<Shared>, cancel: CancelHandle) -> Self {
        Self {
            shared,
            outputs: Vec::new(),
            acquired: WindowMask::EMPTY,
            cancel,
        }
    }

    /// Outputs in registration order
    pub fn outputs(&self) -> impl Iterator<Item = OutputId> + '_ {
        self.outputs.iter().map(|o| o.slot.id())
    }

    /// Committed state of `output` when validation ran
    pub fn old_state(&self, output: OutputId) -> Option<&OutputState> {
        self.find(output).map(|o| &o.old)
    }

    /// State `output` switches to on commit
    pub fn new_state(&self, output: OutputId) -> Option<&OutputState> {
        self.find(output).map(|o| &o.new)
    }

    /// Windows this transaction took from the pool
    pub fn acquired(&self) -> WindowMask {
        self.acquired
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Abandons the transaction, undoing its allocations
    pub fn cancel(self) {
        self.cancel.cancel();
    }

    fn find(&self, output: OutputId) -> Option<&PreparedOutput> {
        self.outputs.iter().find(|o| o.slot.id() == output)
    }

    pub(crate) fn first_slot(&self) -> Option<&Arc<OutputSlot>> {
        self.outputs.first().map(|o| &o.slot)
    }

    /// Producer fences of every plane, in submission order
    pub(crate) fn take_fences(&mut self) -> Vec<Fence> {
        self.outputs
            .iter_mut()
            .flat_map(|o| o.planes.iter_mut())
            .filter_map(|p| p.fence.take())
            .collect()
    }

    /// Publishes the new states and hands ownership to the hardware phase
    pub(crate) fn swap(mut self) -> CommittedTransaction {
        let fences = self.take_fences();
        let outputs = std::mem::take(&mut self.outputs);
        // The acquired windows now belong to the new states.
        self.acquired = WindowMask::EMPTY;

        let outputs = outputs
            .into_iter()
            .map(|o| {
                *o.slot.state_mut() = o.new.clone();
                debug!(
                    "🔁 Output {} swapped: reserved {} -> {}, freed {}",
                    o.slot.id(),
                    o.old.reserved,
                    o.new.reserved,
                    o.new.freed_pending
                );
                CommittedOutput {
                    slot: o.slot,
                    state: o.new,
                    out_fence: o.out_fence,
                }
            })
            .collect();

        CommittedTransaction::new(outputs, fences, self.shared.pool.clone())
    }
}

impl Drop for PreparedTransaction {
    fn drop(&mut self) {
        if !self.acquired.is_empty() {
            debug!("↩️ Rolling back windows {}", self.acquired);
            self.shared.pool.release(self.acquired);
            self.acquired = WindowMask::EMPTY;
        }
        for output in self.outputs.drain(..) {
            output.slot.release_claim();
        }
    }
}

impl fmt::Debug for PreparedTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreparedTransaction")
            .field("outputs", &self.outputs().collect::<Vec<_>>())
            .field("acquired", &self.acquired)
            .finish()
    }
}

/// Validates transactions against the committed output states
#[derive(Clone)]
pub struct TransactionValidator {
    shared: Arc<Shared>,
}

impl TransactionValidator {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Checks `txn` and reserves the windows it needs.
    ///
    /// On error nothing is changed: no window left the pool and no output
    /// is marked pending.
    pub async fn validate(&self, txn: Transaction) -> Result<PreparedTransaction, ValidationError> {
        let (updates, cancel) = txn.into_parts();
        let resolved = self.check_topology(updates)?;

        let mut prepared = PreparedTransaction::new(self.shared.clone(), cancel);

        for (slot, update) in resolved {
            if !slot.try_claim() {
                debug!("Output {} busy, rejecting transaction", slot.id());
                return Err(ValidationError::AlreadyPending(slot.id()));
            }
            let old = slot.state().clone();
            let new = OutputState {
                active: update.active,
                writeback_source: update.writeback_source.filter(|_| update.active),
                ..old.clone()
            };
            prepared.outputs.push(PreparedOutput {
                slot,
                old,
                new,
                planes: update.planes,
                out_fence: update.out_fence,
            });
        }

        for index in 0..prepared.outputs.len() {
            self.settle_windows(&mut prepared, index).await?;
        }

        for output in &mut prepared.outputs {
            assign_windows(&mut output.new, &output.planes);
        }

        trace!("Transaction prepared: {:?}", prepared);
        Ok(prepared)
    }

    /// Adjusts the window count of one output
    async fn settle_windows(
        &self,
        prepared: &mut PreparedTransaction,
        index: usize,
    ) -> Result<(), ValidationError> {
        let output = &prepared.outputs[index];
        let id = output.slot.id();
        let old = &output.old;
        let old_count = old.window_count();
        let new_count = required_windows(output);

        if old_count == new_count {
            return Ok(());
        }

        if old_count > new_count {
            let surplus = old_count - new_count;
            let freed = old.reserved.take_lowest(surplus).unwrap_or(old.reserved);
            let output = &mut prepared.outputs[index];
            output.new.reserved = output.old.reserved - freed;
            output.new.freed_pending |= freed;
            debug!("📉 Output {} shrinks {} -> {}, freeing {}", id, old_count, new_count, freed);
            return Ok(());
        }

        let hint = old.reserved;
        let grown = self.acquire_with_retry(id, new_count - old_count, hint).await?;
        prepared.acquired |= grown;
        let output = &mut prepared.outputs[index];
        output.new.reserved = output.old.reserved | grown;
        debug!("📈 Output {} grows {} -> {}, got {}", id, old_count, new_count, grown);
        Ok(())
    }

    /// Takes `count` windows, waiting once for in-flight releases
    async fn acquire_with_retry(
        &self,
        output: OutputId,
        count: u32,
        hint: WindowMask,
    ) -> Result<WindowMask, ValidationError> {
        let pool = &self.shared.pool;

        if let Some(windows) = pool.try_acquire(count, hint) {
            return Ok(windows);
        }

        let exhausted = || ValidationError::ResourceExhausted {
            output,
            requested: count,
            available: pool.available().count(),
        };

        // Armed after the failed attempt. Releases before this point show up
        // in the pool check below, later ones wake the wait.
        let released = pool.released();
        tokio::pin!(released);
        released.as_mut().enable();

        if pool.available().count() < count {
            if !self.shared.outputs.release_in_flight() {
                return Err(exhausted());
            }

            let wait = self.shared.timing.retry_wait();
            info!(
                "⏳ Output {} waiting up to {:?} for {} windows to be released",
                output, wait, count
            );
            if tokio::time::timeout(wait, released).await.is_err() {
                debug!("No release within {:?}, retrying anyway", wait);
            }
        }

        pool.try_acquire(count, hint).ok_or_else(exhausted)
    }

    /// Resolves outputs and rejects impossible pairings.
    ///
    /// Returns the updates sorted in registration order.
    fn check_topology(
        &self,
        updates: Vec<OutputUpdate>,
    ) -> Result<Vec<(Arc<OutputSlot>, OutputUpdate)>, ValidationError> {
        let invalid = |msg: String| Err(ValidationError::InvalidTopology(msg));

        if updates.is_empty() {
            return invalid("transaction has no outputs".into());
        }

        let mut seen_outputs = HashSet::new();
        let mut seen_planes = HashSet::new();
        let mut resolved = Vec::with_capacity(updates.len());

        for update in updates {
            let slot = self
                .shared
                .outputs
                .get(update.output)
                .ok_or(ValidationError::UnknownOutput(update.output))?;
            let info = &slot.info;

            if !seen_outputs.insert(update.output) {
                return invalid(format!("output {} appears twice", info.name));
            }

            if !update.active && !update.planes.is_empty() {
                return invalid(format!("inactive output {} has planes", info.name));
            }

            let mut zpos = HashSet::new();
            for plane in &update.planes {
                if !seen_planes.insert(plane.plane) {
                    return invalid(format!("plane {} bound more than once", plane.plane));
                }
                if !self.shared.caps.supports_plane(info, plane.plane) {
                    return invalid(format!("plane {} not supported on {}", plane.plane, info.name));
                }
                if plane.visible && !zpos.insert(plane.zpos) {
                    return invalid(format!("two visible planes at zpos {} on {}", plane.zpos, info.name));
                }
            }

            let max = self.shared.caps.max_windows(info).min(self.shared.pool.capacity()) as u32;
            if update.required_windows() > max {
                return invalid(format!(
                    "{} needs {} windows but supports {}",
                    info.name,
                    update.required_windows(),
                    max
                ));
            }

            resolved.push((slot, update));
        }

        for (slot, update) in &resolved {
            self.check_writeback(slot, update, &resolved)?;
            if !update.active {
                self.check_not_captured(slot, &resolved)?;
            }
        }

        resolved.sort_by_key(|(slot, _)| slot.id());
        Ok(resolved)
    }

    fn check_writeback(
        &self,
        slot: &OutputSlot,
        update: &OutputUpdate,
        resolved: &[(Arc<OutputSlot>, OutputUpdate)],
    ) -> Result<(), ValidationError> {
        let info = &slot.info;
        let is_writeback = info.kind == OutputKind::Writeback;

        match (is_writeback, update.writeback_source) {
            (false, Some(_)) => Err(ValidationError::InvalidTopology(format!(
                "{} is not a write-back output",
                info.name
            ))),
            (true, None) if update.active => Err(ValidationError::InvalidTopology(format!(
                "write-back output {} has no source",
                info.name
            ))),
            (true, Some(source)) if update.active => {
                let source_slot = self
                    .shared
                    .outputs
                    .get(source)
                    .ok_or(ValidationError::UnknownOutput(source))?;

                if !self.shared.caps.supports_writeback_source(info, &source_slot.info) {
                    return Err(ValidationError::InvalidTopology(format!(
                        "{} cannot capture {}",
                        info.name, source_slot.info.name
                    )));
                }

                let source_active = resolved
                    .iter()
                    .find(|(s, _)| s.id() == source)
                    .map(|(_, u)| u.active)
                    .unwrap_or_else(|| source_slot.state().active);
                if !source_active {
                    return Err(ValidationError::InvalidTopology(format!(
                        "{} captures inactive output {}",
                        info.name, source_slot.info.name
                    )));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Rejects disabling `source` while a write-back keeps capturing it.
    ///
    /// A capturing write-back is fine if the same transaction disables it or
    /// points it elsewhere.
    fn check_not_captured(
        &self,
        source: &OutputSlot,
        resolved: &[(Arc<OutputSlot>, OutputUpdate)],
    ) -> Result<(), ValidationError> {
        for capturer in self.shared.outputs.capturers_of(source.id()) {
            let released = resolved
                .iter()
                .find(|(slot, _)| slot.id() == capturer.id())
                .map(|(_, update)| !update.active || update.writeback_source != Some(source.id()))
                .unwrap_or(false);
            if !released {
                return Err(ValidationError::InvalidTopology(format!(
                    "{} is still captured by {}",
                    source.info.name, capturer.info.name
                )));
            }
        }
        Ok(())
    }
}

fn required_windows(output: &PreparedOutput) -> u32 {
    if !output.new.active {
        return 0;
    }
    (output.planes.iter().filter(|p| p.visible).count() as u32).max(1)
}

/// Binds visible planes to reserved windows by ascending zpos
fn assign_windows(state: &mut OutputState, planes: &[PlaneState]) {
    let mut visible: Vec<&PlaneState> = planes.iter().filter(|p| p.visible).collect();
    visible.sort_by_key(|p| p.zpos);

    state.assignments = visible
        .iter()
        .zip(state.reserved.iter())
        .map(|(plane, window)| WindowAssignment {
            plane: plane.plane,
            window,
            zpos: plane.zpos,
            buffer: plane.buffer,
        })
        .collect();
    state.visible = state.assignments.iter().map(|a| a.window).collect();
}
