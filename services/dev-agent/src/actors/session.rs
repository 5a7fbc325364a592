//! Dev session - registry of attached devices and their managers.
//!
//! The session owns every registered device. Managers hold weak references,
//! so removing a device from the session is what lets it go.

use std::collections::HashMap;
use std::sync::Arc;

use devsync_events::EventEnvelope;
use devsync_instructions::FileInstruction;
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::device::DrainReport;
use super::framework::Supervisor;
use super::manager::DeviceManager;
use crate::config::DrainSettings;
use crate::device::Device;
use crate::error::DrainError;
use crate::project::Project;
use crate::state::StateStore;
use crate::sync_state::{NeverPrompt, UploadPrompt};

/// Capacity of the session event channel.
const EVENT_CAPACITY: usize = 256;

/// Everything a device manager shares with its session.
#[derive(Clone)]
pub struct SessionContext {
    pub project: Arc<dyn Project>,
    pub store: Arc<StateStore>,
    pub settings: DrainSettings,
    pub events: broadcast::Sender<EventEnvelope>,
    pub prompt: Arc<dyn UploadPrompt>,
}

struct Registration {
    device: Arc<dyn Device>,
    manager: DeviceManager,
}

/// One project in dev mode across any number of devices.
pub struct DevSession {
    ctx: SessionContext,
    supervisor: Supervisor,
    devices: HashMap<String, Registration>,
}

impl DevSession {
    /// Create a session with no devices.
    pub fn new(project: Arc<dyn Project>, store: Arc<StateStore>, settings: DrainSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            ctx: SessionContext {
                project,
                store,
                settings,
                events,
                prompt: Arc::new(NeverPrompt),
            },
            supervisor: Supervisor::new(),
            devices: HashMap::new(),
        }
    }

    /// Use `prompt` to offer manual uploads on dev start. Applies to devices
    /// added afterwards.
    pub fn with_prompt(mut self, prompt: Arc<dyn UploadPrompt>) -> Self {
        self.ctx.prompt = prompt;
        self
    }

    pub fn project(&self) -> &Arc<dyn Project> {
        &self.ctx.project
    }

    /// Register a device and start its manager.
    ///
    /// Fails if the project settings are invalid. Adding a name that is
    /// already registered returns the existing manager.
    pub async fn add_device(
        &mut self,
        device: Arc<dyn Device>,
    ) -> Result<DeviceManager, DrainError> {
        self.ctx.project.dev_config().await?;

        let name = device.name().to_string();
        if let Some(existing) = self.devices.get(&name) {
            warn!(device = %name, "Device already registered");
            return Ok(existing.manager.clone());
        }

        let manager = DeviceManager::spawn(&mut self.supervisor, &device, &self.ctx);
        info!(device = %name, project = %self.ctx.project.name(), "Device added to session");

        self.devices.insert(
            name,
            Registration {
                device,
                manager: manager.clone(),
            },
        );
        Ok(manager)
    }

    /// Stop a device's manager and release the device.
    ///
    /// Instructions still queued for it are discarded. Returns false if the
    /// name is not registered.
    pub async fn remove_device(&mut self, name: &str) -> bool {
        let Some(registration) = self.devices.remove(name) else {
            return false;
        };

        self.supervisor
            .stop(registration.manager.actor_id())
            .await;
        drop(registration.device);

        info!(device = %name, "Device removed from session");
        true
    }

    /// Push an instruction to every device. Returns how many accepted it.
    pub fn push(&self, instruction: FileInstruction) -> usize {
        let mut accepted = 0;
        for (name, registration) in &self.devices {
            match registration.manager.push(instruction.clone()) {
                Ok(()) => accepted += 1,
                Err(e) => warn!(device = %name, error = %e, "Dropped instruction"),
            }
        }
        accepted
    }

    pub fn manager(&self, name: &str) -> Option<&DeviceManager> {
        self.devices.get(name).map(|r| &r.manager)
    }

    pub fn device(&self, name: &str) -> Option<&Arc<dyn Device>> {
        self.devices.get(name).map(|r| &r.device)
    }

    /// Registered device names, sorted.
    pub fn device_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.devices.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// True if any device is draining or has instructions waiting.
    pub fn is_busy(&self) -> bool {
        self.devices.values().any(|r| r.manager.is_busy())
    }

    /// Wait until every device is idle.
    pub async fn wait_idle(&self) {
        for registration in self.devices.values() {
            registration.manager.wait_idle().await;
        }
    }

    /// Subscribe to events from every device in the session.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.ctx.events.subscribe()
    }

    /// Upload the whole project to one device.
    pub async fn upload_project(&self, name: &str) -> Result<DrainReport, DrainError> {
        let manager = self
            .manager(name)
            .ok_or_else(|| DrainError::DeviceGone(name.to_string()))?;
        manager.upload_project().await
    }

    /// Stop every manager and release every device.
    pub async fn stop(&mut self) {
        info!(devices = self.devices.len(), "Stopping dev session");
        self.supervisor.stop_all().await;
        self.devices.clear();
    }
}
