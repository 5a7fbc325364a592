//! Device manager actor - drains one device's instruction queue.
//!
//! The actor is the only consumer of its mailbox, so at most one drain runs
//! per device and device operations never interleave. Pushes that land while
//! a drain is running wait in the mailbox and are folded into the running
//! drain instead of starting another one.
//!
//! ## State Machine
//!
//! ```text
//! idle --push--> draining --mailbox and queue empty--> idle
//!                   |
//!                   +--stop/restart/config failure--> idle (queue kept)
//! ```
//!
//! One drain cycle is: stop the program, apply coalesced passes until no new
//! instruction arrives, restart with the configured strategy, wait the settle
//! delay.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use devsync_events::{DevEvent, EventEnvelope};
use devsync_instructions::{coalesce, FileInstruction};
use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, error, info, warn};

use super::framework::{Actor, ActorContext};
use super::session::SessionContext;
use crate::config::{DrainSettings, RestartMode};
use crate::device::Device;
use crate::error::{DrainError, InstructionFailure};
use crate::project::Project;
use crate::restart::TouchedModules;
use crate::state::StateStore;

// =============================================================================
// Messages
// =============================================================================

/// Messages handled by DeviceManagerActor.
#[derive(Debug)]
pub enum DeviceMessage {
    /// Queue one file instruction.
    Push(FileInstruction),

    /// Queue a full project upload and report when it has been applied.
    UploadProject {
        /// Project change time captured before the upload was requested.
        changed_at: Option<i64>,
        reply_to: oneshot::Sender<Result<DrainReport, DrainError>>,
    },
}

// =============================================================================
// Status
// =============================================================================

/// Whether a drain is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainPhase {
    Idle,
    Draining,
}

/// Snapshot of a device manager, published after every transition.
#[derive(Debug, Clone)]
pub struct DeviceStatus {
    pub phase: DrainPhase,

    /// Cycles that reached the end of their settle delay.
    pub cycles_completed: u64,

    /// Instructions kept queued after a failed cycle.
    pub pending: usize,

    pub last_report: Option<DrainReport>,

    /// Error of the most recent cycle, cleared by the next successful one.
    pub last_error: Option<DrainError>,
}

impl Default for DeviceStatus {
    fn default() -> Self {
        Self {
            phase: DrainPhase::Idle,
            cycles_completed: 0,
            pending: 0,
            last_report: None,
            last_error: None,
        }
    }
}

/// Outcome of one completed drain cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct DrainReport {
    pub cycle: u64,
    pub strategy: RestartMode,
    /// Instructions applied successfully, in execution order.
    pub applied: Vec<FileInstruction>,
    pub touched: TouchedModules,
    pub failures: Vec<InstructionFailure>,
    pub duration: Duration,
}

impl DrainReport {
    fn new(cycle: u64, strategy: RestartMode) -> Self {
        Self {
            cycle,
            strategy,
            applied: Vec::new(),
            touched: TouchedModules::new(),
            failures: Vec::new(),
            duration: Duration::ZERO,
        }
    }

    /// True if every instruction in the cycle was applied.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

// =============================================================================
// Events
// =============================================================================

/// Stamps events with this manager's project, device and sequence number.
pub(crate) struct EventSink {
    tx: broadcast::Sender<EventEnvelope>,
    project: String,
    device: String,
    seq: u64,
}

impl EventSink {
    pub(crate) fn new(
        tx: broadcast::Sender<EventEnvelope>,
        project: impl Into<String>,
        device: impl Into<String>,
    ) -> Self {
        Self {
            tx,
            project: project.into(),
            device: device.into(),
            seq: 0,
        }
    }

    fn emit(&mut self, event: DevEvent) {
        self.seq += 1;
        let envelope = EventEnvelope::new(self.seq, &self.project, &self.device, event);
        debug!(seq = envelope.seq, event_type = envelope.event_type(), "Emitting event");

        // No subscribers is fine
        let _ = self.tx.send(envelope);
    }
}

// =============================================================================
// Actor
// =============================================================================

struct PendingUpload {
    changed_at: Option<i64>,
    reply_to: oneshot::Sender<Result<DrainReport, DrainError>>,
}

/// Actor owning the instruction queue of one device.
pub struct DeviceManagerActor {
    device_name: String,
    device: Weak<dyn Device>,
    project: Arc<dyn Project>,
    store: Arc<StateStore>,
    settings: DrainSettings,

    /// Instructions absorbed from the mailbox but not yet applied.
    queue: Vec<FileInstruction>,

    /// Upload requests waiting for the cycle that applies their root upload.
    uploads: Vec<PendingUpload>,

    /// Messages sent by handles but not yet absorbed.
    queued: Arc<AtomicUsize>,

    status: watch::Sender<DeviceStatus>,
    events: EventSink,
    cycle: u64,
}

impl DeviceManagerActor {
    pub(crate) fn new(
        device: &Arc<dyn Device>,
        ctx: &SessionContext,
        queued: Arc<AtomicUsize>,
        status: watch::Sender<DeviceStatus>,
    ) -> Self {
        let device_name = device.name().to_string();
        Self {
            events: EventSink::new(ctx.events.clone(), ctx.project.name(), &device_name),
            device_name,
            device: Arc::downgrade(device),
            project: Arc::clone(&ctx.project),
            store: Arc::clone(&ctx.store),
            settings: ctx.settings,
            queue: Vec::new(),
            uploads: Vec::new(),
            queued,
            status,
            cycle: 0,
        }
    }

    /// Move one mailbox message into the queue.
    fn absorb(&mut self, msg: DeviceMessage) {
        // Publish Draining before the counter drops so observers never see
        // both idle and nothing queued while work is pending
        self.set_phase(DrainPhase::Draining);
        self.queued.fetch_sub(1, Ordering::SeqCst);

        match msg {
            DeviceMessage::Push(instruction) => {
                debug!(device = %self.device_name, instruction = %instruction, "Queued instruction");
                self.queue.push(instruction);
            }
            DeviceMessage::UploadProject {
                changed_at,
                reply_to,
            } => {
                info!(device = %self.device_name, "Queued full project upload");
                self.queue
                    .push(FileInstruction::create(self.project.root_dir()));
                self.uploads.push(PendingUpload {
                    changed_at,
                    reply_to,
                });
            }
        }
    }

    fn absorb_ready(&mut self, ctx: &mut ActorContext<DeviceMessage>) {
        while let Some(msg) = ctx.try_next() {
            self.absorb(msg);
        }
    }

    fn set_phase(&self, phase: DrainPhase) {
        self.status.send_if_modified(|status| {
            if status.phase == phase {
                return false;
            }
            status.phase = phase;
            true
        });
    }

    /// Run cycles until nothing is queued or a cycle fails.
    async fn drain(&mut self, ctx: &mut ActorContext<DeviceMessage>) {
        loop {
            self.absorb_ready(ctx);
            if self.queue.is_empty() {
                break;
            }

            match self.run_cycle(ctx).await {
                Ok(report) => {
                    self.finish_uploads(Ok(&report)).await;
                    self.status.send_modify(|status| {
                        status.cycles_completed += 1;
                        status.last_error = None;
                        status.last_report = Some(report);
                    });
                }
                Err(err) => {
                    error!(
                        device = %self.device_name,
                        cycle = self.cycle,
                        pending = self.queue.len(),
                        error = %err,
                        "Drain cycle failed"
                    );
                    if let Some(stage) = err.stage() {
                        self.events.emit(DevEvent::DrainFailed {
                            cycle: self.cycle,
                            stage,
                            reason: err.to_string(),
                        });
                    }
                    self.finish_uploads(Err(&err)).await;
                    self.status
                        .send_modify(|status| status.last_error = Some(err));
                    break;
                }
            }
        }

        let pending = self.queue.len();
        self.status.send_modify(|status| {
            status.phase = DrainPhase::Idle;
            status.pending = pending;
        });
    }

    async fn run_cycle(
        &mut self,
        ctx: &mut ActorContext<DeviceMessage>,
    ) -> Result<DrainReport, DrainError> {
        self.cycle += 1;
        let cycle = self.cycle;
        let started = Instant::now();

        let device = self
            .device
            .upgrade()
            .ok_or_else(|| DrainError::DeviceGone(self.device_name.clone()))?;
        let config = self.project.dev_config().await?;

        info!(
            device = %self.device_name,
            cycle,
            pending = self.queue.len(),
            strategy = %config.on_update,
            "Starting drain cycle"
        );
        self.events.emit(DevEvent::DrainStarted { cycle });

        self.stop_program(device.as_ref()).await?;

        let mut report = DrainReport::new(cycle, config.on_update);
        loop {
            self.absorb_ready(ctx);
            if self.queue.is_empty() {
                break;
            }

            let batch = coalesce(std::mem::take(&mut self.queue));
            debug!(device = %self.device_name, batch = batch.len(), "Applying batch");

            for instruction in batch {
                match self.apply(device.as_ref(), &instruction).await {
                    Ok(remote) => {
                        self.events.emit(DevEvent::InstructionApplied {
                            action: instruction.action,
                            file: instruction.file.display().to_string(),
                            remote: remote.clone(),
                        });
                        report.touched.touch(remote);
                        report.applied.push(instruction);
                    }
                    Err(failure) => {
                        warn!(
                            device = %self.device_name,
                            instruction = %failure.instruction,
                            reason = %failure.reason,
                            "Instruction failed"
                        );
                        self.events.emit(DevEvent::InstructionFailed {
                            action: failure.instruction.action,
                            file: failure.instruction.file.display().to_string(),
                            reason: failure.reason.clone(),
                        });
                        report.failures.push(failure);
                    }
                }
            }
        }

        self.restart(device.as_ref(), config.on_update, &report.touched)
            .await?;
        self.events.emit(DevEvent::DeviceRestarted {
            strategy: config.on_update.to_string(),
            touched: report.touched.paths().to_vec(),
        });

        tokio::time::sleep(self.settings.settle_delay).await;

        report.duration = started.elapsed();
        info!(
            device = %self.device_name,
            cycle,
            applied = report.applied.len(),
            failed = report.failures.len(),
            duration_ms = report.duration.as_millis() as u64,
            "Drain cycle completed"
        );
        self.events.emit(DevEvent::DrainCompleted {
            cycle,
            applied: report.applied.len(),
            failed: report.failures.len(),
            duration_ms: u64::try_from(report.duration.as_millis()).unwrap_or(u64::MAX),
        });

        Ok(report)
    }

    async fn stop_program(&self, device: &dyn Device) -> Result<(), DrainError> {
        let timeout = self.settings.command_timeout;
        let reason = match tokio::time::timeout(timeout, device.stop_program()).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => format!("{e:#}"),
            Err(_) => format!("timed out after {}ms", timeout.as_millis()),
        };

        Err(DrainError::StopFailed {
            device: self.device_name.clone(),
            reason,
        })
    }

    async fn apply(
        &self,
        device: &dyn Device,
        instruction: &FileInstruction,
    ) -> Result<String, InstructionFailure> {
        let fail = |reason: String| InstructionFailure {
            instruction: instruction.clone(),
            reason,
        };

        let remote = instruction
            .remote_path(self.project.root_dir())
            .map_err(|e| fail(e.to_string()))?;

        let result = if instruction.action.uploads() {
            device.upload_file(&instruction.file, &remote).await
        } else {
            device.remove_file(&remote).await
        };
        result.map_err(|e| fail(format!("{e:#}")))?;

        debug!(device = %self.device_name, instruction = %instruction, remote = %remote, "Applied instruction");
        Ok(remote)
    }

    async fn restart(
        &self,
        device: &dyn Device,
        mode: RestartMode,
        touched: &TouchedModules,
    ) -> Result<(), DrainError> {
        let timeout = self.settings.command_timeout;
        let reason = match tokio::time::timeout(timeout, mode.restart(device, touched)).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => format!("{e:#}"),
            Err(_) => format!("timed out after {}ms", timeout.as_millis()),
        };

        Err(DrainError::RestartFailed {
            device: self.device_name.clone(),
            mode,
            reason,
        })
    }

    /// Answer every upload request absorbed before the cycle ended.
    async fn finish_uploads(&mut self, outcome: Result<&DrainReport, &DrainError>) {
        if self.uploads.is_empty() {
            return;
        }

        let root_upload = FileInstruction::create(self.project.root_dir());
        let outcome = match outcome {
            Ok(report) if report.applied.contains(&root_upload) => Ok(report),
            Ok(report) => {
                let failure = report
                    .failures
                    .iter()
                    .find(|f| f.instruction.file == root_upload.file)
                    .cloned()
                    .unwrap_or_else(|| InstructionFailure {
                        instruction: root_upload.clone(),
                        reason: "superseded by a later instruction".to_string(),
                    });
                Err(DrainError::InstructionFailed(failure))
            }
            Err(err) => {
                // Waiters are told the upload failed, so it must not run
                // unrecorded in a later cycle
                self.queue.retain(|instruction| *instruction != root_upload);
                Err(err.clone())
            }
        };

        for upload in std::mem::take(&mut self.uploads) {
            let result = match &outcome {
                Ok(report) => self
                    .record_upload(upload.changed_at)
                    .await
                    .map(|()| DrainReport::clone(report)),
                Err(err) => Err(err.clone()),
            };
            let _ = upload.reply_to.send(result);
        }
    }

    async fn record_upload(&mut self, changed_at: Option<i64>) -> Result<(), DrainError> {
        if let Err(e) = self
            .store
            .set_last_uploaded_at(&self.device_name, changed_at)
            .await
        {
            warn!(device = %self.device_name, error = %e, "Failed to record project upload");
            return Err(e.into());
        }

        info!(device = %self.device_name, changed_at = ?changed_at, "Project uploaded");
        self.events.emit(DevEvent::ProjectUploaded { changed_at });
        Ok(())
    }
}

#[async_trait]
impl Actor for DeviceManagerActor {
    type Message = DeviceMessage;

    fn name(&self) -> &str {
        "device_manager"
    }

    async fn handle(&mut self, msg: DeviceMessage, ctx: &mut ActorContext<DeviceMessage>) -> bool {
        self.absorb(msg);
        self.drain(ctx).await;
        true
    }

    async fn on_start(&mut self, _ctx: &mut ActorContext<DeviceMessage>) {
        info!(device = %self.device_name, project = %self.project.name(), "Device manager started");
    }

    async fn on_stop(&mut self, ctx: &mut ActorContext<DeviceMessage>) {
        self.absorb_ready(ctx);

        if !self.queue.is_empty() {
            warn!(
                device = %self.device_name,
                dropped = self.queue.len(),
                "Discarding queued instructions"
            );
            self.queue.clear();
        }
        for upload in std::mem::take(&mut self.uploads) {
            let _ = upload
                .reply_to
                .send(Err(DrainError::ManagerStopped(self.device_name.clone())));
        }

        self.status.send_modify(|status| {
            status.phase = DrainPhase::Idle;
            status.pending = 0;
        });
        info!(device = %self.device_name, cycles = self.cycle, "Device manager stopped");
    }
}
