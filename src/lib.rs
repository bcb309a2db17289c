//! # Overlay Commit
//!
//! Hardware overlay window allocator with an atomic multi-output commit
//! scheduler.
//!
//! A display controller has a small pool of overlay windows shared by all of
//! its outputs. Clients describe the next frame of one or more outputs as a
//! [`Transaction`]; the core either applies all of it or none of it.
//!
//! ## Architecture
//!
//! - `mask`: window identifiers and bitmask sets
//! - `window_pool`: the shared pool of free windows
//! - `output`: output descriptions and committed state
//! - `transaction`: the client-facing update builder
//! - `fence`: producer and completion fences
//! - `hw`: the display hardware and capability seams, plus a simulator
//! - `validator`: topology checks and window allocation
//! - `scheduler`: blocking and non-blocking commits
//! - `worker`: per-output hardware programming tasks
//! - `display`: the `DisplayCore` facade tying the above together
//! - `config`: TOML configuration
//!
//! ## Usage
//!
//! ```rust,no_run
//! use overlay_commit::hw::sim::SimulatedHardware;
//! use overlay_commit::{CommitMode, CoreConfig, DisplayCore, OutputUpdate, PlaneState, Transaction};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = CoreConfig::default();
//!     let core = DisplayCore::new(config.clone(), Arc::new(SimulatedHardware::new()));
//!     let panel = core.register_output(&config.outputs[0])?;
//!
//!     let txn = Transaction::new().with(OutputUpdate::enable(panel).plane(PlaneState::new(0, 0)));
//!     core.submit(txn, CommitMode::Blocking).await?.wait().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod display;
pub mod error;
pub mod fence;
pub mod hw;
pub mod mask;
pub mod output;
pub mod scheduler;
pub mod transaction;
pub mod validator;
pub mod window_pool;
pub mod worker;

// Re-export main types for easy access
pub use display::{CoreSnapshot, DisplayCore};
pub use config::{CoreConfig, OutputConfig, TimingConfig};
pub use error::{CommitError, FenceError, HwError, RegistryError, ValidationError};
pub use fence::Fence;
pub use mask::{WindowId, WindowMask};
pub use output::{OutputId, OutputInfo, OutputKind, OutputState};
pub use scheduler::{CommitMode, CommitTicket};
pub use transaction::{BufferHandle, CancelHandle, OutputUpdate, PlaneState, Transaction};
pub use validator::PreparedTransaction;
pub use window_pool::{PoolStats, WindowPool};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
