//! Event type definitions for dev-mode events.

use devsync_instructions::FileAction;
use serde::{Deserialize, Serialize};

// =============================================================================
// Event Type Constants
// =============================================================================

/// All event type names as constants.
pub mod event_types {
    // Drain
    pub const DRAIN_STARTED: &str = "drain.started";
    pub const DRAIN_COMPLETED: &str = "drain.completed";
    pub const DRAIN_FAILED: &str = "drain.failed";

    // Instruction
    pub const INSTRUCTION_APPLIED: &str = "instruction.applied";
    pub const INSTRUCTION_FAILED: &str = "instruction.failed";

    // Device
    pub const DEVICE_RESTARTED: &str = "device.restarted";

    // Project
    pub const PROJECT_UPLOADED: &str = "project.uploaded";
}

// =============================================================================
// Status Enums
// =============================================================================

/// The drain stage at which a cycle failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainStage {
    /// Resolving project configuration.
    Config,
    /// Stopping the running program.
    Stop,
    /// Restarting the device or script.
    Restart,
    /// The device was unregistered mid-cycle.
    Device,
}

// =============================================================================
// Events
// =============================================================================

/// A dev-mode event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DevEvent {
    #[serde(rename = "drain.started")]
    DrainStarted { cycle: u64 },

    #[serde(rename = "instruction.applied")]
    InstructionApplied {
        action: FileAction,
        file: String,
        remote: String,
    },

    #[serde(rename = "instruction.failed")]
    InstructionFailed {
        action: FileAction,
        file: String,
        reason: String,
    },

    #[serde(rename = "device.restarted")]
    DeviceRestarted {
        /// Configured `onUpdate` strategy name.
        strategy: String,
        /// Remote paths touched during the cycle.
        touched: Vec<String>,
    },

    #[serde(rename = "drain.completed")]
    DrainCompleted {
        cycle: u64,
        applied: usize,
        failed: usize,
        duration_ms: u64,
    },

    #[serde(rename = "drain.failed")]
    DrainFailed {
        cycle: u64,
        stage: DrainStage,
        reason: String,
    },

    #[serde(rename = "project.uploaded")]
    ProjectUploaded {
        /// Project change timestamp recorded as the device's upload time.
        changed_at: Option<i64>,
    },
}

impl DevEvent {
    /// The dotted event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            DevEvent::DrainStarted { .. } => event_types::DRAIN_STARTED,
            DevEvent::InstructionApplied { .. } => event_types::INSTRUCTION_APPLIED,
            DevEvent::InstructionFailed { .. } => event_types::INSTRUCTION_FAILED,
            DevEvent::DeviceRestarted { .. } => event_types::DEVICE_RESTARTED,
            DevEvent::DrainCompleted { .. } => event_types::DRAIN_COMPLETED,
            DevEvent::DrainFailed { .. } => event_types::DRAIN_FAILED,
            DevEvent::ProjectUploaded { .. } => event_types::PROJECT_UPLOADED,
        }
    }

    /// Returns true for events an operator should be told about.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            DevEvent::InstructionFailed { .. } | DevEvent::DrainFailed { .. }
        )
    }
}
