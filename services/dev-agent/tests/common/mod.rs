//! Shared fixtures for dev agent integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use devsync_agent::state::StateStore;
use devsync_agent::{
    DevSession, Device, DeviceCall, DeviceManager, DrainSettings, MemoryProject, MockDevice,
    Project,
};
use devsync_events::EventEnvelope;
use tokio::sync::broadcast;

/// Project root used by every fixture.
pub const ROOT: &str = "/proj";

pub const SETTLE: Duration = Duration::from_millis(500);
pub const TIMEOUT: Duration = Duration::from_secs(15);

pub fn settings() -> DrainSettings {
    DrainSettings {
        settle_delay: SETTLE,
        command_timeout: TIMEOUT,
    }
}

/// Absolute local path of a project file.
pub fn file(relative: &str) -> PathBuf {
    Path::new(ROOT).join(relative)
}

pub fn project() -> Arc<MemoryProject> {
    Arc::new(MemoryProject::new("blinky", ROOT))
}

/// A session over an in-memory project and store.
pub struct Harness {
    pub session: DevSession,
    pub project: Arc<MemoryProject>,
    pub store: Arc<StateStore>,
}

impl Harness {
    pub fn new() -> Self {
        let project = project();
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let dyn_project: Arc<dyn Project> = project.clone();
        let session = DevSession::new(dyn_project, Arc::clone(&store), settings());

        Self {
            session,
            project,
            store,
        }
    }

    /// Register a mock device and return its manager.
    pub async fn add(&mut self, device: &Arc<MockDevice>) -> DeviceManager {
        let device: Arc<dyn Device> = device.clone();
        self.session.add_device(device).await.unwrap()
    }
}

/// A session with one mock device named `esp32`.
pub async fn single(device: MockDevice) -> (Harness, Arc<MockDevice>, DeviceManager) {
    let mut harness = Harness::new();
    let device = Arc::new(device);
    let manager = harness.add(&device).await;
    (harness, device, manager)
}

pub fn count(calls: &[DeviceCall], wanted: &DeviceCall) -> usize {
    calls.iter().filter(|c| *c == wanted).count()
}

pub fn commands(calls: &[DeviceCall]) -> Vec<String> {
    calls
        .iter()
        .filter_map(|c| match c {
            DeviceCall::Command { text } => Some(text.clone()),
            _ => None,
        })
        .collect()
}

/// Collect events already sent, in order.
pub fn drain_events(rx: &mut broadcast::Receiver<EventEnvelope>) -> Vec<EventEnvelope> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
