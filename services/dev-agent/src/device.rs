//! Device transport abstraction.
//!
//! A [`Device`] is an attached board reachable over some serial or network
//! link. Device managers only ever talk to boards through this trait, and
//! never issue two operations on one device at the same time.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Transport to one attached board.
#[async_trait]
pub trait Device: Send + Sync {
    /// Stable device name, unique within a session.
    fn name(&self) -> &str;

    /// Whether the transport is currently connected.
    fn is_connected(&self) -> bool;

    /// Interrupt whatever program is running.
    async fn stop_program(&self) -> Result<()>;

    /// Upload a local file or directory to a device path.
    async fn upload_file(&self, local: &Path, remote: &str) -> Result<()>;

    /// Remove a device path.
    async fn remove_file(&self, remote: &str) -> Result<()>;

    /// Send text to the REPL. Returns once the text is written, not when the
    /// device finishes evaluating it.
    async fn send_interactive_command(&self, text: &str) -> Result<()>;

    /// Soft reset the interpreter.
    async fn soft_reset(&self) -> Result<()>;

    /// Hardware reset the board.
    async fn hard_reset(&self) -> Result<()>;
}

// =============================================================================
// Mock device (for testing)
// =============================================================================

/// A device operation as seen by [`MockDevice`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCall {
    StopProgram,
    Upload { local: PathBuf, remote: String },
    Remove { remote: String },
    Command { text: String },
    SoftReset,
    HardReset,
}

/// Mock device for testing.
///
/// Records every call in order and can be told to fail or stall specific
/// operations.
pub struct MockDevice {
    name: String,
    connected: AtomicBool,

    /// Simulated latency of every operation.
    latency: Duration,

    /// Remote paths whose upload or removal fails.
    failing_paths: HashSet<String>,

    fail_stop: AtomicBool,
    hang_stop: AtomicBool,
    fail_restart: AtomicBool,

    calls: Mutex<Vec<DeviceCall>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockDevice {
    /// Create a new mock device.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connected: AtomicBool::new(true),
            latency: Duration::ZERO,
            failing_paths: HashSet::new(),
            fail_stop: AtomicBool::new(false),
            hang_stop: AtomicBool::new(false),
            fail_restart: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Make every operation take `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make uploads and removals of `remote` fail.
    pub fn with_failing_path(mut self, remote: impl Into<String>) -> Self {
        self.failing_paths.insert(remote.into());
        self
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn set_fail_stop(&self, fail: bool) {
        self.fail_stop.store(fail, Ordering::SeqCst);
    }

    /// Make `stop_program` never return.
    pub fn set_hang_stop(&self, hang: bool) {
        self.hang_stop.store(hang, Ordering::SeqCst);
    }

    /// Make REPL commands and resets fail.
    pub fn set_fail_restart(&self, fail: bool) {
        self.fail_restart.store(fail, Ordering::SeqCst);
    }

    /// All calls so far, in order.
    pub async fn calls(&self) -> Vec<DeviceCall> {
        self.calls.lock().await.clone()
    }

    pub async fn clear_calls(&self) {
        self.calls.lock().await.clear();
    }

    /// Remote paths uploaded so far, in order.
    pub async fn uploads(&self) -> Vec<String> {
        self.calls
            .lock()
            .await
            .iter()
            .filter_map(|call| match call {
                DeviceCall::Upload { remote, .. } => Some(remote.clone()),
                _ => None,
            })
            .collect()
    }

    /// Highest number of operations ever observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn begin(&self, call: DeviceCall) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.calls.lock().await.push(call);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn end(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    async fn restart_op(&self, call: DeviceCall) -> Result<()> {
        self.begin(call).await;
        self.end();

        if self.fail_restart.load(Ordering::SeqCst) {
            anyhow::bail!("Mock device configured to fail restarts");
        }
        Ok(())
    }
}

#[async_trait]
impl Device for MockDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn stop_program(&self) -> Result<()> {
        info!(device = %self.name, "[MOCK] Stopping program");
        self.begin(DeviceCall::StopProgram).await;

        if self.hang_stop.load(Ordering::SeqCst) {
            // Held until the caller gives up; the in-flight slot is released
            // when the future is dropped by the caller's timeout.
            let _guard = InFlightGuard(&self.in_flight);
            std::future::pending::<()>().await;
        }
        self.end();

        if self.fail_stop.load(Ordering::SeqCst) {
            anyhow::bail!("Mock device configured to fail stops");
        }
        Ok(())
    }

    async fn upload_file(&self, local: &Path, remote: &str) -> Result<()> {
        debug!(device = %self.name, local = %local.display(), remote = %remote, "[MOCK] Uploading");
        self.begin(DeviceCall::Upload {
            local: local.to_path_buf(),
            remote: remote.to_string(),
        })
        .await;
        self.end();

        if self.failing_paths.contains(remote) {
            anyhow::bail!("Mock upload of {remote} failed");
        }
        Ok(())
    }

    async fn remove_file(&self, remote: &str) -> Result<()> {
        debug!(device = %self.name, remote = %remote, "[MOCK] Removing");
        self.begin(DeviceCall::Remove {
            remote: remote.to_string(),
        })
        .await;
        self.end();

        if self.failing_paths.contains(remote) {
            anyhow::bail!("Mock removal of {remote} failed");
        }
        Ok(())
    }

    async fn send_interactive_command(&self, text: &str) -> Result<()> {
        debug!(device = %self.name, bytes = text.len(), "[MOCK] Sending REPL command");
        self.restart_op(DeviceCall::Command {
            text: text.to_string(),
        })
        .await
    }

    async fn soft_reset(&self) -> Result<()> {
        info!(device = %self.name, "[MOCK] Soft reset");
        self.restart_op(DeviceCall::SoftReset).await
    }

    async fn hard_reset(&self) -> Result<()> {
        info!(device = %self.name, "[MOCK] Hard reset");
        self.restart_op(DeviceCall::HardReset).await
    }
}

/// Decrements the in-flight counter when a stalled operation is dropped.
struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
