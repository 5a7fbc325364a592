//! Local state persistence for the dev agent.
//!
//! Records, per device, the project change time that was last uploaded in
//! full. Comparing it with the project's current change time tells whether a
//! device is out of sync when dev mode starts.

mod store;

pub use store::{DeviceSyncRecord, StateStore, StateStoreError};
