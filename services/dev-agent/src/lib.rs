//! devsync Dev Agent Library
//!
//! Keeps one or more attached microcontrollers in sync with a local project
//! while the user edits it. File events become instructions; each device has a
//! manager that applies them in drain cycles and restarts the device program
//! afterwards.
//!
//! ## Architecture
//!
//! ```text
//! DevSession
//! ├── DeviceManagerActor(esp32)   (queue, drain cycles, restarts)
//! └── DeviceManagerActor(pico)
//! ```
//!
//! ## Modules
//!
//! - `actors`: Actor framework, device managers and the session registry
//! - `device`: Device transport trait and a mock for tests
//! - `event_log`: Logs session events
//! - `mirror`: Directory-backed device for running without hardware
//! - `restart`: Restart strategies and the REPL restart script
//! - `state`: Local SQLite state persistence
//! - `sync_state`: Out-of-sync detection on dev start

pub mod actors;
pub mod config;
pub mod device;
pub mod error;
pub mod event_log;
pub mod mirror;
pub mod project;
pub mod restart;
pub mod state;
pub mod sync_state;

// Re-export commonly used types
pub use actors::{DevSession, DeviceManager, DeviceStatus, DrainPhase, DrainReport};
pub use config::{AgentConfig, DevConfig, DrainSettings, RestartMode, UploadWhen};
pub use device::{Device, DeviceCall, MockDevice};
pub use error::{DrainError, InstructionFailure};
pub use project::{MemoryProject, Project, ProjectDir};
pub use sync_state::{NeverPrompt, SyncState, UploadOutcome, UploadPrompt};
