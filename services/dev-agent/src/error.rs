//! Drain error types.

use devsync_events::DrainStage;
use devsync_instructions::FileInstruction;
use thiserror::Error;

use crate::config::{ConfigError, RestartMode};
use crate::state::StateStoreError;

/// A single instruction that could not be applied.
///
/// Failures are collected per cycle; they never abort the rest of the batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{instruction} failed: {reason}")]
pub struct InstructionFailure {
    pub instruction: FileInstruction,
    pub reason: String,
}

/// Errors surfaced by a device manager.
///
/// Reasons are carried as strings so the error can be cloned into status
/// snapshots and handed to every waiter of a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DrainError {
    /// Stopping the running program failed or timed out. Nothing was applied
    /// and the queue was kept.
    #[error("failed to stop program on {device}: {reason}")]
    StopFailed { device: String, reason: String },

    #[error(transparent)]
    InstructionFailed(InstructionFailure),

    #[error("{mode} failed on {device}: {reason}")]
    RestartFailed {
        device: String,
        mode: RestartMode,
        reason: String,
    },

    #[error("invalid project configuration: {reason}")]
    ConfigInvalid { reason: String },

    #[error("device {0} is no longer registered")]
    DeviceGone(String),

    #[error("device manager for {0} has stopped")]
    ManagerStopped(String),

    #[error("state store error: {0}")]
    StateStore(String),
}

impl DrainError {
    /// The cycle stage this error aborts, if it aborts one.
    pub fn stage(&self) -> Option<DrainStage> {
        match self {
            DrainError::StopFailed { .. } => Some(DrainStage::Stop),
            DrainError::RestartFailed { .. } => Some(DrainStage::Restart),
            DrainError::ConfigInvalid { .. } => Some(DrainStage::Config),
            DrainError::DeviceGone(_) => Some(DrainStage::Device),
            DrainError::InstructionFailed(_)
            | DrainError::ManagerStopped(_)
            | DrainError::StateStore(_) => None,
        }
    }
}

impl From<ConfigError> for DrainError {
    fn from(err: ConfigError) -> Self {
        DrainError::ConfigInvalid {
            reason: err.to_string(),
        }
    }
}

impl From<StateStoreError> for DrainError {
    fn from(err: StateStoreError) -> Self {
        DrainError::StateStore(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_maps_to_config_stage() {
        let err: DrainError = ConfigError::InvalidValue {
            key: "dev.onUpdate",
            value: "nope".to_string(),
            expected: "restartScript",
        }
        .into();

        assert_eq!(err.stage(), Some(DrainStage::Config));
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn test_instruction_failure_display() {
        let failure = InstructionFailure {
            instruction: FileInstruction::change("/proj/lib/util.py"),
            reason: "device busy".to_string(),
        };
        assert_eq!(
            failure.to_string(),
            "change /proj/lib/util.py failed: device busy"
        );
        assert_eq!(DrainError::InstructionFailed(failure).stage(), None);
    }
}
