//! Simulated display controller
//!
//! Records every programmed frame and completes it after an optional
//! latency. Tests and the demo binary use it to hold completions, inject
//! programming failures, and report deadlocks.

use super::{Completion, DisplayHardware, FrameConfig};
use crate::error::HwError;
use crate::output::{OutputId, OutputInfo};
use async_trait::async_trait;
use log::debug;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct SimState {
    programmed: Vec<FrameConfig>,
    last_active: HashMap<OutputId, bool>,
    fail_next: HashMap<OutputId, String>,
    completion: HashMap<OutputId, Completion>,
    held: HashSet<OutputId>,
}

/// In-process stand-in for the display controller
#[derive(Debug, Default)]
pub struct SimulatedHardware {
    state: Mutex<SimState>,
    gate: Notify,
    latency: Duration,
}

impl SimulatedHardware {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay between programming and completion
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    /// Makes the next `program` call for `output` fail
    pub fn fail_next_program(&self, output: OutputId, reason: impl Into<String>) {
        self.state.lock().fail_next.insert(output, reason.into());
    }

    /// Overrides what completions on `output` report
    pub fn set_completion(&self, output: OutputId, completion: Completion) {
        self.state.lock().completion.insert(output, completion);
    }

    /// Keeps completions on `output` from resolving until released
    pub fn hold_completion(&self, output: OutputId) {
        self.state.lock().held.insert(output);
    }

    pub fn release_completion(&self, output: OutputId) {
        self.state.lock().held.remove(&output);
        self.gate.notify_waiters();
    }

    /// Every frame programmed so far, oldest first
    pub fn programmed(&self) -> Vec<FrameConfig> {
        self.state.lock().programmed.clone()
    }

    pub fn program_count(&self, output: OutputId) -> usize {
        self.state
            .lock()
            .programmed
            .iter()
            .filter(|frame| frame.output == output)
            .count()
    }

    pub fn last_frame(&self, output: OutputId) -> Option<FrameConfig> {
        self.state
            .lock()
            .programmed
            .iter()
            .rev()
            .find(|frame| frame.output == output)
            .cloned()
    }

    fn is_held(&self, output: OutputId) -> bool {
        self.state.lock().held.contains(&output)
    }
}

#[async_trait]
impl DisplayHardware for SimulatedHardware {
    fn program(&self, output: &OutputInfo, frame: &FrameConfig) -> Result<(), HwError> {
        let mut state = self.state.lock();
        if let Some(reason) = state.fail_next.remove(&output.id) {
            return Err(HwError::Program {
                output: output.id,
                reason,
            });
        }

        debug!(
            "🖥️ [sim] {} programmed: active={} reserved={} visible={}",
            output.name, frame.active, frame.reserved, frame.visible
        );
        state.last_active.insert(output.id, frame.active);
        state.programmed.push(frame.clone());
        Ok(())
    }

    async fn wait_completion(&self, output: &OutputInfo) -> Completion {
        loop {
            let notified = self.gate.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_held(output.id) {
                break;
            }
            notified.await;
        }

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let state = self.state.lock();
        if let Some(completion) = state.completion.get(&output.id) {
            return *completion;
        }
        match state.last_active.get(&output.id) {
            Some(false) => Completion::InstantOff,
            _ => Completion::FrameDone,
        }
    }
}
