//! Actor framework for the dev agent.
//!
//! ## Design Principles
//!
//! - **One actor per device**: each device manager owns the instruction queue
//!   and all device I/O for a single board
//! - **Message coalescing**: instructions that arrive while a drain is running
//!   are folded into that drain
//! - **Crash isolation**: a failing device never blocks its siblings
//!
//! ## Actor Types
//!
//! - `DeviceManagerActor`: drains one device's queue
//! - `DevSession`: registry that owns devices and supervises their managers

mod device;
mod framework;
mod manager;
mod session;

pub use device::{DeviceManagerActor, DeviceMessage, DeviceStatus, DrainPhase, DrainReport};
pub use framework::{
    Actor, ActorContext, ActorError, ActorHandle, ActorRef, ActorState, Message, Supervisor,
};
pub use manager::DeviceManager;
pub use session::{DevSession, SessionContext};
