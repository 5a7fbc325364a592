//! # devsync-events
//!
//! Operator-facing event definitions for dev mode.
//!
//! ## Design Principles
//!
//! - Events describe what a device manager did, never what it intends to do
//! - Every event belongs to exactly one (project, device) pairing
//! - Sequence numbers are monotonic per device manager
//!
//! ## Event Types
//!
//! - Drain events (`drain.*`)
//! - Instruction events (`instruction.*`)
//! - Device events (`device.*`)
//! - Project events (`project.*`)

mod envelope;
mod error;
mod types;

pub use envelope::*;
pub use error::EventError;
pub use types::*;
