//! Hardware collaborators
//!
//! The core never touches registers. It hands a [`FrameConfig`] to a
//! [`DisplayHardware`] implementation, then awaits the completion that the
//! interrupt path reports for the output. Topology questions go to a
//! [`Capabilities`] implementation.

pub mod sim;

use crate::error::HwError;
use crate::mask::{WindowId, WindowMask};
use crate::output::{OutputId, OutputInfo, OutputKind, OutputState, WindowAssignment};
use crate::transaction::PlaneId;
use async_trait::async_trait;

/// What the completion source reports after a frame was programmed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The new frame replaced the old one on screen
    FrameDone,
    /// The output was switched off without a frame
    InstantOff,
    /// The pipeline stalled and needs recovery
    DeadlockError,
}

/// Window programming for one output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameConfig {
    pub output: OutputId,
    pub active: bool,
    pub reserved: WindowMask,
    pub visible: WindowMask,
    /// Planes bound to windows, bottom to top
    pub assignments: Vec<WindowAssignment>,
    /// Window showing a solid color when no plane is visible
    pub color_fill: Option<WindowId>,
}

impl FrameConfig {
    pub fn from_state(output: OutputId, state: &OutputState) -> Self {
        Self {
            output,
            active: state.active,
            reserved: state.reserved,
            visible: state.visible,
            assignments: state.assignments.clone(),
            color_fill: if state.is_color_fill() {
                state.reserved.lowest()
            } else {
                None
            },
        }
    }
}

/// Register-level display controller
#[async_trait]
pub trait DisplayHardware: Send + Sync {
    /// Writes the window configuration of one output
    fn program(&self, output: &OutputInfo, frame: &FrameConfig) -> Result<(), HwError>;

    /// Resolves when the hardware retires the frame last programmed on `output`
    async fn wait_completion(&self, output: &OutputInfo) -> Completion;
}

/// Capability queries used by topology validation
#[cfg_attr(test, mockall::automock)]
pub trait Capabilities: Send + Sync {
    /// Most windows `output` can composite
    fn max_windows(&self, output: &OutputInfo) -> u8;

    /// Whether `plane` may be shown on `output`
    fn supports_plane(&self, output: &OutputInfo, plane: PlaneId) -> bool;

    /// Whether the write-back output may capture `source`
    fn supports_writeback_source(&self, writeback: &OutputInfo, source: &OutputInfo) -> bool;
}

/// Capabilities taken from the registration data alone
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticCapabilities;

impl Capabilities for StaticCapabilities {
    fn max_windows(&self, output: &OutputInfo) -> u8 {
        output.max_windows
    }

    fn supports_plane(&self, _output: &OutputInfo, _plane: PlaneId) -> bool {
        true
    }

    fn supports_writeback_source(&self, writeback: &OutputInfo, source: &OutputInfo) -> bool {
        writeback.id != source.id && source.kind != OutputKind::Writeback
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::BufferHandle;

    fn info(id: u32, kind: OutputKind) -> OutputInfo {
        OutputInfo {
            id: OutputId(id),
            name: format!("OUT-{}", id),
            kind,
            max_windows: 3,
            refresh_hz: None,
        }
    }

    #[test]
    fn test_frame_config_marks_color_fill() {
        let state = OutputState {
            active: true,
            reserved: WindowMask::from_bits(0b0100),
            ..OutputState::default()
        };
        let frame = FrameConfig::from_state(OutputId(1), &state);
        assert_eq!(frame.color_fill, Some(2));
        assert!(frame.assignments.is_empty());
    }

    #[test]
    fn test_frame_config_copies_assignments() {
        let state = OutputState {
            active: true,
            reserved: WindowMask::from_bits(0b0011),
            visible: WindowMask::from_bits(0b0011),
            assignments: vec![
                WindowAssignment {
                    plane: 10,
                    window: 0,
                    zpos: 0,
                    buffer: Some(BufferHandle { id: 1, format: 0x3432_5258 }),
                },
                WindowAssignment {
                    plane: 11,
                    window: 1,
                    zpos: 1,
                    buffer: None,
                },
            ],
            ..OutputState::default()
        };
        let frame = FrameConfig::from_state(OutputId(0), &state);
        assert_eq!(frame.color_fill, None);
        assert_eq!(frame.assignments.len(), 2);
    }

    #[test]
    fn test_static_capabilities_writeback_pairing() {
        let caps = StaticCapabilities;
        let panel = info(0, OutputKind::Panel);
        let wb = info(1, OutputKind::Writeback);
        let wb2 = info(2, OutputKind::Writeback);

        assert_eq!(caps.max_windows(&panel), 3);
        assert!(caps.supports_writeback_source(&wb, &panel));
        assert!(!caps.supports_writeback_source(&wb, &wb2));
        assert!(!caps.supports_writeback_source(&wb, &wb));
    }
}
