//! Device sync state.
//!
//! Decides whether a device needs the whole project pushed when dev mode
//! starts, by comparing the project's last change time with the change time
//! recorded at the device's last full upload.

use async_trait::async_trait;

use crate::actors::DrainReport;
use crate::config::UploadWhen;

/// Change times for one device and the project it is synced with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncState {
    /// Project change time captured before the device's last full upload.
    pub last_uploaded_at: Option<i64>,
    /// The project's current change time.
    pub last_changed_at: Option<i64>,
}

impl SyncState {
    pub fn new(last_uploaded_at: Option<i64>, last_changed_at: Option<i64>) -> Self {
        Self {
            last_uploaded_at,
            last_changed_at,
        }
    }

    /// True when the two timestamps differ.
    ///
    /// Inequality rather than ordering, so a project rolled back to older
    /// content still counts as out of sync. A device never uploaded to with an
    /// empty project (both `None`) is in sync.
    pub fn is_out_of_sync(&self) -> bool {
        self.last_uploaded_at != self.last_changed_at
    }

    /// Whether to upload without asking when dev mode starts.
    pub fn should_upload_on_dev_start(&self, when: UploadWhen) -> bool {
        match when {
            UploadWhen::Always => true,
            UploadWhen::OutOfSync => self.is_out_of_sync(),
        }
    }
}

/// Offers a manual project upload when dev mode starts and no automatic
/// upload is indicated.
#[async_trait]
pub trait UploadPrompt: Send + Sync {
    async fn confirm_upload(&self, device: &str, state: &SyncState) -> bool;
}

/// Declines every upload.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverPrompt;

#[async_trait]
impl UploadPrompt for NeverPrompt {
    async fn confirm_upload(&self, _device: &str, _state: &SyncState) -> bool {
        false
    }
}

/// Result of checking a device when dev mode starts.
#[derive(Debug, Clone)]
pub enum UploadOutcome {
    /// The project was uploaded.
    Uploaded(DrainReport),
    /// The device is not connected.
    SkippedOffline,
    /// No upload was indicated and none was requested.
    SkippedInSync,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rollback_is_out_of_sync() {
        let state = SyncState::new(Some(2_000), Some(1_000));
        assert!(state.is_out_of_sync());
    }

    #[test]
    fn test_never_uploaded_empty_project_is_in_sync() {
        assert!(!SyncState::default().is_out_of_sync());
    }

    #[test]
    fn test_never_uploaded_is_out_of_sync() {
        assert!(SyncState::new(None, Some(1)).is_out_of_sync());
    }

    #[tokio::test]
    async fn test_never_prompt_declines() {
        let state = SyncState::new(Some(1), Some(2));
        assert!(!NeverPrompt.confirm_upload("esp32", &state).await);
    }
}
