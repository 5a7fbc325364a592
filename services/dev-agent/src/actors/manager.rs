//! Handle to a running device manager.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use devsync_instructions::FileInstruction;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info};

use super::device::{DeviceManagerActor, DeviceMessage, DeviceStatus, DrainPhase, DrainReport};
use super::framework::{ActorHandle, Supervisor};
use super::session::SessionContext;
use crate::device::Device;
use crate::error::DrainError;
use crate::project::Project;
use crate::state::StateStore;
use crate::sync_state::{SyncState, UploadOutcome, UploadPrompt};

/// Cheap, cloneable handle to one device's manager actor.
///
/// [`push`](Self::push) never waits on the device: it only enqueues, and the
/// actor drains in the background.
#[derive(Clone)]
pub struct DeviceManager {
    device_name: String,
    handle: ActorHandle<DeviceMessage>,
    device: Weak<dyn Device>,
    project: Arc<dyn Project>,
    store: Arc<StateStore>,
    prompt: Arc<dyn UploadPrompt>,
    queued: Arc<AtomicUsize>,
    status: watch::Receiver<DeviceStatus>,
}

impl DeviceManager {
    /// Spawn a manager actor for `device` under `supervisor`.
    ///
    /// The manager keeps only a weak reference; whoever registered the device
    /// owns it.
    pub fn spawn(
        supervisor: &mut Supervisor,
        device: &Arc<dyn Device>,
        ctx: &SessionContext,
    ) -> Self {
        let queued = Arc::new(AtomicUsize::new(0));
        let (status_tx, status) = watch::channel(DeviceStatus::default());

        let actor = DeviceManagerActor::new(device, ctx, Arc::clone(&queued), status_tx);
        let handle = supervisor.spawn(actor);

        Self {
            device_name: device.name().to_string(),
            handle,
            device: Arc::downgrade(device),
            project: Arc::clone(&ctx.project),
            store: Arc::clone(&ctx.store),
            prompt: Arc::clone(&ctx.prompt),
            queued,
            status,
        }
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub(crate) fn actor_id(&self) -> &str {
        self.handle.actor_id()
    }

    /// Queue an instruction. Returns immediately.
    pub fn push(&self, instruction: FileInstruction) -> Result<(), DrainError> {
        debug!(device = %self.device_name, instruction = %instruction, "Pushing instruction");
        self.send(DeviceMessage::Push(instruction))
    }

    fn send(&self, msg: DeviceMessage) -> Result<(), DrainError> {
        // Counted before sending so the message is never invisible to is_busy
        self.queued.fetch_add(1, Ordering::SeqCst);
        self.handle.send(msg).map_err(|_| {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            DrainError::ManagerStopped(self.device_name.clone())
        })
    }

    /// True while a drain is running or instructions are waiting for one.
    pub fn is_busy(&self) -> bool {
        if self.handle.is_closed() {
            return false;
        }
        // Counter first: a zero here means the actor already published Draining
        self.queued.load(Ordering::SeqCst) > 0 || self.status.borrow().phase == DrainPhase::Draining
    }

    /// Latest status snapshot.
    pub fn status(&self) -> DeviceStatus {
        self.status.borrow().clone()
    }

    /// Wait until the manager is idle with nothing queued, or has stopped.
    pub async fn wait_idle(&self) {
        let mut status = self.status.clone();
        loop {
            let queued = self.queued.load(Ordering::SeqCst);
            let draining = status.borrow_and_update().phase == DrainPhase::Draining;
            if queued == 0 && !draining {
                return;
            }
            if status.changed().await.is_err() {
                return;
            }
        }
    }

    /// Current sync state of this device against the project.
    pub async fn sync_state(&self) -> Result<SyncState, DrainError> {
        let last_uploaded_at = self.store.last_uploaded_at(&self.device_name).await?;
        Ok(SyncState::new(
            last_uploaded_at,
            self.project.last_changed_at().await,
        ))
    }

    /// Upload the whole project and wait for the cycle that applies it.
    ///
    /// The project change time is captured before anything is queued, so
    /// edits made while the upload runs leave the device out of sync.
    pub async fn upload_project(&self) -> Result<DrainReport, DrainError> {
        let changed_at = self.project.last_changed_at().await;
        let (reply_to, reply) = oneshot::channel();
        self.send(DeviceMessage::UploadProject {
            changed_at,
            reply_to,
        })?;

        reply
            .await
            .map_err(|_| DrainError::ManagerStopped(self.device_name.clone()))?
    }

    /// Upload the project if the device needs it, as dev mode starts.
    ///
    /// Uploads without asking when `uploadOnDevStart` says so; otherwise the
    /// prompt may still request one.
    pub async fn upload_if_needed(&self) -> Result<UploadOutcome, DrainError> {
        let device = self
            .device
            .upgrade()
            .ok_or_else(|| DrainError::DeviceGone(self.device_name.clone()))?;
        if !device.is_connected() {
            info!(device = %self.device_name, "Device offline, skipping upload check");
            return Ok(UploadOutcome::SkippedOffline);
        }
        drop(device);

        let config = self.project.dev_config().await?;
        let state = self.sync_state().await?;

        let upload = state.should_upload_on_dev_start(config.upload_on_dev_start)
            || self.prompt.confirm_upload(&self.device_name, &state).await;

        if !upload {
            info!(device = %self.device_name, "Device in sync, skipping project upload");
            return Ok(UploadOutcome::SkippedInSync);
        }

        info!(
            device = %self.device_name,
            last_uploaded_at = ?state.last_uploaded_at,
            last_changed_at = ?state.last_changed_at,
            "Uploading project"
        );
        self.upload_project().await.map(UploadOutcome::Uploaded)
    }
}

impl std::fmt::Debug for DeviceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceManager")
            .field("device_name", &self.device_name)
            .field("actor_id", &self.handle.actor_id())
            .finish_non_exhaustive()
    }
}
