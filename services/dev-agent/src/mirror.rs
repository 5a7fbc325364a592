//! Mirror device - a local directory standing in for a board.
//!
//! Uploads copy into the mirror root, removals delete from it, and REPL text
//! is logged. Useful for running dev mode without hardware attached.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use devsync_instructions::REMOTE_ROOT;
use tracing::{debug, info};

use crate::device::Device;

/// A device backed by a local directory.
pub struct MirrorDevice {
    name: String,
    root: PathBuf,
    running: AtomicBool,
}

impl MirrorDevice {
    /// Create a mirror device, creating its root directory if needed.
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("failed to create mirror root {}", root.display()))?;

        Ok(Self {
            name: name.into(),
            root,
            running: AtomicBool::new(false),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether a program was started and not stopped since.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn target(&self, remote: &str) -> PathBuf {
        if remote == REMOTE_ROOT {
            self.root.clone()
        } else {
            self.root.join(remote)
        }
    }

    async fn copy_dir(&self, from: &Path, to: &Path) -> Result<()> {
        let mut pending = vec![(from.to_path_buf(), to.to_path_buf())];

        while let Some((src, dst)) = pending.pop() {
            tokio::fs::create_dir_all(&dst)
                .await
                .with_context(|| format!("failed to create {}", dst.display()))?;

            let mut entries = tokio::fs::read_dir(&src)
                .await
                .with_context(|| format!("failed to read {}", src.display()))?;

            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                // A mirror nested inside the project must not copy itself
                if path == self.root {
                    continue;
                }

                let target = dst.join(entry.file_name());
                if entry.file_type().await?.is_dir() {
                    pending.push((path, target));
                } else {
                    tokio::fs::copy(&path, &target)
                        .await
                        .with_context(|| format!("failed to copy {}", path.display()))?;
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl Device for MirrorDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_connected(&self) -> bool {
        self.root.is_dir()
    }

    async fn stop_program(&self) -> Result<()> {
        if self.running.swap(false, Ordering::SeqCst) {
            info!(device = %self.name, "Stopped program");
        }
        Ok(())
    }

    async fn upload_file(&self, local: &Path, remote: &str) -> Result<()> {
        let target = self.target(remote);
        let meta = tokio::fs::metadata(local)
            .await
            .with_context(|| format!("failed to stat {}", local.display()))?;

        if meta.is_dir() {
            self.copy_dir(local, &target).await?;
        } else {
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::copy(local, &target)
                .await
                .with_context(|| format!("failed to copy {}", local.display()))?;
        }

        debug!(device = %self.name, remote = %remote, "Uploaded");
        Ok(())
    }

    async fn remove_file(&self, remote: &str) -> Result<()> {
        if remote == REMOTE_ROOT {
            anyhow::bail!("refusing to remove the device root");
        }

        let target = self.target(remote);
        let result = match tokio::fs::symlink_metadata(&target).await {
            Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(&target).await,
            Ok(_) => tokio::fs::remove_file(&target).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                debug!(device = %self.name, remote = %remote, "Removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(device = %self.name, remote = %remote, "Already absent");
                Ok(())
            }
            Err(e) => Err(e).with_context(|| format!("failed to remove {remote}")),
        }
    }

    async fn send_interactive_command(&self, text: &str) -> Result<()> {
        info!(device = %self.name, lines = text.lines().count(), "REPL command");
        for line in text.lines() {
            debug!(device = %self.name, line = %line, "REPL");
        }
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn soft_reset(&self) -> Result<()> {
        info!(device = %self.name, "Soft reset");
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn hard_reset(&self) -> Result<()> {
        info!(device = %self.name, "Hard reset");
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upload_and_remove_file() {
        let project = tempfile::tempdir().unwrap();
        let mirror = tempfile::tempdir().unwrap();
        let device = MirrorDevice::new("mirror", mirror.path()).unwrap();

        let local = project.path().join("main.py");
        std::fs::write(&local, "print('hi')").unwrap();

        device.upload_file(&local, "lib/main.py").await.unwrap();
        let copied = std::fs::read_to_string(mirror.path().join("lib/main.py")).unwrap();
        assert_eq!(copied, "print('hi')");

        device.remove_file("lib/main.py").await.unwrap();
        assert!(!mirror.path().join("lib/main.py").exists());

        // Removing again is not an error
        device.remove_file("lib/main.py").await.unwrap();
    }

    #[tokio::test]
    async fn test_upload_project_root() {
        let project = tempfile::tempdir().unwrap();
        std::fs::create_dir(project.path().join("lib")).unwrap();
        std::fs::write(project.path().join("main.py"), "import lib.util").unwrap();
        std::fs::write(project.path().join("lib/util.py"), "x = 1").unwrap();

        let mirror = tempfile::tempdir().unwrap();
        let device = MirrorDevice::new("mirror", mirror.path()).unwrap();

        device.upload_file(project.path(), REMOTE_ROOT).await.unwrap();

        assert!(mirror.path().join("main.py").is_file());
        assert!(mirror.path().join("lib/util.py").is_file());
    }

    #[tokio::test]
    async fn test_nested_mirror_is_not_copied_into_itself() {
        let project = tempfile::tempdir().unwrap();
        std::fs::write(project.path().join("main.py"), "").unwrap();
        let device = MirrorDevice::new("mirror", project.path().join(".mirror")).unwrap();

        device.upload_file(project.path(), REMOTE_ROOT).await.unwrap();

        assert!(project.path().join(".mirror/main.py").is_file());
        assert!(!project.path().join(".mirror/.mirror").exists());
    }

    #[tokio::test]
    async fn test_restart_marks_running() {
        let mirror = tempfile::tempdir().unwrap();
        let device = MirrorDevice::new("mirror", mirror.path()).unwrap();
        assert!(!device.is_running());

        device.send_interactive_command("import main").await.unwrap();
        assert!(device.is_running());

        device.stop_program().await.unwrap();
        assert!(!device.is_running());
    }
}
