//! Event envelope - the common wrapper for all dev-mode events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{DevEvent, EventError};

/// The event envelope - common metadata for all events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Monotonic sequence within the emitting device manager.
    pub seq: u64,

    /// When the event occurred.
    pub occurred_at: DateTime<Utc>,

    /// Project name.
    pub project: String,

    /// Device name.
    pub device: String,

    /// Event-specific payload.
    pub event: DevEvent,
}

impl EventEnvelope {
    /// Wrap an event, stamping it with the current time.
    pub fn new(
        seq: u64,
        project: impl Into<String>,
        device: impl Into<String>,
        event: DevEvent,
    ) -> Self {
        Self {
            seq,
            occurred_at: Utc::now(),
            project: project.into(),
            device: device.into(),
            event,
        }
    }

    /// The dotted event type name of the payload.
    pub fn event_type(&self) -> &'static str {
        self.event.event_type()
    }

    /// Serialize to a single JSON line.
    pub fn to_json(&self) -> Result<String, EventError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse from JSON.
    pub fn from_json(json: &str) -> Result<Self, EventError> {
        Ok(serde_json::from_str(json)?)
    }
}

impl std::fmt::Display for EventEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "#{} {} {}/{}",
            self.seq,
            self.event_type(),
            self.project,
            self.device
        )
    }
}
