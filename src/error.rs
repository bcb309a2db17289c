//! Error types for validation, fences, hardware and commit
//!
//! Validation errors are returned before any state is mutated. Fence and
//! hardware errors may surface after the state swap; by then the worker has
//! already returned the transaction's freed windows to the pool.

use crate::output::OutputId;
use std::time::Duration;
use thiserror::Error;

/// Rejections raised while validating a transaction
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Not enough free windows, even after the bounded retry
    #[error("output {output}: no windows available (needed {requested}, {available} free)")]
    ResourceExhausted {
        output: OutputId,
        requested: u32,
        available: u32,
    },

    /// The requested plane/output pairing is not supported
    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    /// A transaction for this output has not completed yet
    #[error("output {0} already has a transaction in flight")]
    AlreadyPending(OutputId),

    #[error("output {0} is not registered")]
    UnknownOutput(OutputId),
}

impl ValidationError {
    /// Whether resubmitting the same transaction later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ValidationError::ResourceExhausted { .. } | ValidationError::AlreadyPending(_)
        )
    }
}

/// Failures reported by a producer fence or by the wait on it
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FenceError {
    #[error("fence {fence} not signalled after {waited:?}")]
    Timeout { fence: u64, waited: Duration },

    /// The producer signalled an error
    #[error("fence {fence} failed: {reason}")]
    Failed { fence: u64, reason: String },

    /// The producer cancelled the fence
    #[error("fence {0} was cancelled")]
    Cancelled(u64),

    /// The waiter was interrupted by transaction cancellation
    #[error("wait on fence {0} interrupted")]
    Interrupted(u64),
}

/// Failures from the hardware collaborators
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HwError {
    #[error("output {output}: programming failed: {reason}")]
    Program { output: OutputId, reason: String },

    /// The completion source reported a pipeline deadlock
    #[error("output {0}: hardware deadlock")]
    Deadlock(OutputId),

    #[error("output {output}: no frame completion after {waited:?}")]
    CompletionTimeout { output: OutputId, waited: Duration },
}

/// Errors returned by the commit path
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommitError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Fence(#[from] FenceError),

    #[error(transparent)]
    Hardware(#[from] HwError),

    /// The transaction was cancelled before it started running
    #[error("transaction cancelled before it started")]
    Cancelled,

    /// The output's worker is gone (output unregistered mid-flight)
    #[error("worker for output {0} is not running")]
    WorkerGone(OutputId),
}

/// Errors from output registration
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("an output named '{0}' is already registered")]
    DuplicateName(String),

    #[error("output '{name}' wants {wanted} windows but the pool has {capacity}")]
    PoolTooSmall {
        name: String,
        wanted: u8,
        capacity: u8,
    },

    #[error("output {0} has a transaction in flight")]
    Busy(OutputId),

    /// An active write-back output still captures this output
    #[error("output {output} is captured by write-back output {writeback}")]
    Captured { output: OutputId, writeback: OutputId },

    #[error("output {0} is not registered")]
    Unknown(OutputId),
}
