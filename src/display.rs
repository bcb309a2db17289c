//! Display core
//!
//! [`DisplayCore`] ties the window pool, the output registry, the validator
//! and the commit scheduler together. It is the entry point a compositor
//! talks to: register outputs, then validate and commit transactions.

use crate::config::{CoreConfig, OutputConfig, TimingConfig};
use crate::error::{CommitError, RegistryError, ValidationError};
use crate::hw::{Capabilities, DisplayHardware, StaticCapabilities};
use crate::mask::WindowMask;
use crate::output::{OutputId, OutputInfo, OutputRegistry, OutputSlot, OutputState};
use crate::scheduler::{CommitMode, CommitScheduler, CommitTicket};
use crate::transaction::Transaction;
use crate::validator::{PreparedTransaction, TransactionValidator};
use crate::window_pool::WindowPool;
use crate::worker::{WorkerContext, WorkerHandle, WorkerState};
use log::{debug, info, warn};
use std::sync::Arc;

/// State shared by the validator, the scheduler and registration
pub(crate) struct Shared {
    pub timing: TimingConfig,
    pub pool: Arc<WindowPool>,
    pub outputs: OutputRegistry,
    pub hardware: Arc<dyn DisplayHardware>,
    pub caps: Arc<dyn Capabilities>,
}

impl Shared {
    pub fn worker_context(&self) -> WorkerContext {
        WorkerContext {
            hardware: self.hardware.clone(),
            timing: self.timing.clone(),
        }
    }
}

/// Point-in-time view of the pool and every output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreSnapshot {
    pub universe: WindowMask,
    pub available: WindowMask,
    pub outputs: Vec<(OutputId, OutputState)>,
}

impl CoreSnapshot {
    /// Checks that reservations are disjoint and that every window is
    /// accounted for exactly once across the pool, the reservations and the
    /// pending releases.
    pub fn check_invariants(&self) -> Result<(), String> {
        let mut seen = self.available;
        let mut total = self.available.count();

        for (id, state) in &self.outputs {
            for (label, mask) in [("reserved", state.reserved), ("freed", state.freed_pending)] {
                let clash = seen & mask;
                if !clash.is_empty() {
                    return Err(format!("output {} {} windows {} counted twice", id, label, clash));
                }
                seen |= mask;
                total += mask.count();
            }
            if !state.visible.is_subset(state.reserved) {
                return Err(format!("output {} shows windows it does not reserve", id));
            }
        }

        if seen != self.universe || total != self.universe.count() {
            return Err(format!(
                "windows not conserved: accounted {} of {}",
                seen, self.universe
            ));
        }
        Ok(())
    }

    pub fn state(&self, output: OutputId) -> Option<&OutputState> {
        self.outputs
            .iter()
            .find(|(id, _)| *id == output)
            .map(|(_, state)| state)
    }
}

/// Window allocator and commit scheduler for a set of display outputs
pub struct DisplayCore {
    shared: Arc<Shared>,
    validator: TransactionValidator,
    scheduler: CommitScheduler,
}

impl DisplayCore {
    /// Creates a core whose capabilities come from registration data
    pub fn new(config: CoreConfig, hardware: Arc<dyn DisplayHardware>) -> Self {
        Self::with_capabilities(config, hardware, Arc::new(StaticCapabilities))
    }

    pub fn with_capabilities(
        config: CoreConfig,
        hardware: Arc<dyn DisplayHardware>,
        caps: Arc<dyn Capabilities>,
    ) -> Self {
        info!("🏗️ Initializing display core with {} windows", config.pool.windows);

        let shared = Arc::new(Shared {
            timing: config.timing,
            pool: Arc::new(WindowPool::new(config.pool.windows)),
            outputs: OutputRegistry::default(),
            hardware,
            caps,
        });

        Self {
            validator: TransactionValidator::new(shared.clone()),
            scheduler: CommitScheduler::new(shared.clone()),
            shared,
        }
    }

    /// Registers an output and spawns its worker.
    ///
    /// Must be called from within a tokio runtime.
    pub fn register_output(&self, output: &OutputConfig) -> Result<OutputId, RegistryError> {
        if self.shared.outputs.find_by_name(&output.name).is_some() {
            return Err(RegistryError::DuplicateName(output.name.clone()));
        }
        let capacity = self.shared.pool.capacity();
        if output.max_windows > capacity {
            return Err(RegistryError::PoolTooSmall {
                name: output.name.clone(),
                wanted: output.max_windows,
                capacity,
            });
        }

        let id = self.shared.outputs.next_id();
        let info = OutputInfo {
            id,
            name: output.name.clone(),
            kind: output.kind,
            max_windows: output.max_windows,
            refresh_hz: output.refresh_hz,
        };
        let worker = WorkerHandle::spawn(id, self.shared.worker_context());
        self.shared.outputs.insert(Arc::new(OutputSlot::new(info, worker)));

        info!("🖥️ Registered output {} ({:?}) as {}", output.name, output.kind, id);
        Ok(id)
    }

    /// Removes an idle output, returning its windows to the pool.
    ///
    /// Refused while an active write-back output captures it.
    pub fn unregister_output(&self, id: OutputId) -> Result<(), RegistryError> {
        let slot = self.shared.outputs.get(id).ok_or(RegistryError::Unknown(id))?;
        if let Some(writeback) = self.shared.outputs.capturers_of(id).first() {
            return Err(RegistryError::Captured {
                output: id,
                writeback: writeback.id(),
            });
        }
        if !slot.try_claim() {
            return Err(RegistryError::Busy(id));
        }

        self.shared.outputs.remove(id);
        let windows = {
            let mut state = slot.state_mut();
            let windows = state.reserved | state.freed_pending;
            *state = OutputState::default();
            windows
        };
        if !windows.is_empty() {
            warn!("Output {} removed while holding windows {}", slot.info.name, windows);
            self.shared.pool.release(windows);
        }

        info!("🔌 Unregistered output {}", slot.info.name);
        Ok(())
    }

    pub fn pool(&self) -> &WindowPool {
        &self.shared.pool
    }

    pub fn timing(&self) -> &TimingConfig {
        &self.shared.timing
    }

    pub fn outputs(&self) -> Vec<OutputInfo> {
        self.shared
            .outputs
            .all()
            .iter()
            .map(|slot| slot.info.clone())
            .collect()
    }

    /// Committed state of `output`
    pub fn output_state(&self, output: OutputId) -> Option<OutputState> {
        self.shared.outputs.get(output).map(|slot| slot.state().clone())
    }

    /// Whether a transaction is in flight on `output`
    pub fn is_pending(&self, output: OutputId) -> bool {
        self.shared
            .outputs
            .get(output)
            .map(|slot| slot.is_pending())
            .unwrap_or(false)
    }

    pub fn worker_state(&self, output: OutputId) -> Option<WorkerState> {
        self.shared.outputs.get(output).map(|slot| slot.worker_state())
    }

    /// Resolves once `output` has no transaction in flight
    pub async fn wait_idle(&self, output: OutputId) {
        if let Some(slot) = self.shared.outputs.get(output) {
            slot.wait_idle().await;
        }
    }

    pub fn validator(&self) -> &TransactionValidator {
        &self.validator
    }

    pub fn scheduler(&self) -> &CommitScheduler {
        &self.scheduler
    }

    pub async fn validate(&self, txn: Transaction) -> Result<PreparedTransaction, ValidationError> {
        self.validator.validate(txn).await
    }

    pub async fn commit(
        &self,
        prepared: PreparedTransaction,
        mode: CommitMode,
    ) -> Result<CommitTicket, CommitError> {
        self.scheduler.commit(prepared, mode).await
    }

    /// Validates and commits in one step
    pub async fn submit(&self, txn: Transaction, mode: CommitMode) -> Result<CommitTicket, CommitError> {
        let prepared = self.validate(txn).await?;
        self.commit(prepared, mode).await
    }

    /// Consistent view of the pool and every output.
    ///
    /// Windows held by a transaction that is still being validated are in
    /// neither the pool nor an output state and show up as missing.
    pub fn snapshot(&self) -> CoreSnapshot {
        let slots = self.shared.outputs.all();
        // Output states first, then the pool: a worker retiring a frame holds
        // its state lock while it returns windows.
        let states: Vec<_> = slots.iter().map(|slot| slot.state()).collect();
        let snapshot = CoreSnapshot {
            universe: self.shared.pool.universe(),
            available: self.shared.pool.available(),
            outputs: slots
                .iter()
                .zip(&states)
                .map(|(slot, state)| (slot.id(), (**state).clone()))
                .collect(),
        };
        drop(states);
        debug!("Snapshot: {} free", snapshot.available);
        snapshot
    }
}
