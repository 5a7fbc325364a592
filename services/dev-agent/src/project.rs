//! The local project being synced.

use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::{ConfigError, DevConfig, ProjectConfigFile, RawDevConfig};

/// A local project directory.
#[async_trait]
pub trait Project: Send + Sync {
    /// Display name.
    fn name(&self) -> &str;

    /// Absolute project root. Instruction paths are resolved against it.
    fn root_dir(&self) -> &Path;

    /// Current dev settings. Called once per drain cycle.
    async fn dev_config(&self) -> Result<DevConfig, ConfigError>;

    /// When the project content last changed (Unix millis), or `None` for a
    /// project with nothing in it.
    async fn last_changed_at(&self) -> Option<i64>;
}

/// A project on the local filesystem.
#[derive(Debug, Clone)]
pub struct ProjectDir {
    name: String,
    root: PathBuf,
}

impl ProjectDir {
    /// Open a project directory.
    ///
    /// The name comes from `devsync.json` when set, otherwise from the
    /// directory name.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let root = root.as_ref();
        let root = tokio::fs::canonicalize(root)
            .await
            .map_err(|source| ConfigError::Io {
                path: root.to_path_buf(),
                source,
            })?;

        let file = ProjectConfigFile::load(&root).await?;
        // Surface bad settings at open time rather than on the first save
        file.dev.resolve()?;

        let name = file.name.unwrap_or_else(|| {
            root.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "project".to_string())
        });

        Ok(Self { name, root })
    }
}

#[async_trait]
impl Project for ProjectDir {
    fn name(&self) -> &str {
        &self.name
    }

    fn root_dir(&self) -> &Path {
        &self.root
    }

    async fn dev_config(&self) -> Result<DevConfig, ConfigError> {
        ProjectConfigFile::load(&self.root).await?.dev.resolve()
    }

    async fn last_changed_at(&self) -> Option<i64> {
        let root = self.root.clone();
        match tokio::task::spawn_blocking(move || newest_change(&root)).await {
            Ok(newest) => newest,
            Err(e) => match e.try_into_panic() {
                Ok(panic) => std::panic::resume_unwind(panic),
                Err(e) => {
                    warn!(root = %self.root.display(), error = %e, "Project scan cancelled");
                    None
                }
            },
        }
    }
}

/// Newest modification time under `root`, including `root` itself once it has
/// any entries. Removing a top-level file only touches the root's mtime.
fn newest_change(root: &Path) -> Option<i64> {
    let mut newest: Option<i64> = None;
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(dir = %dir.display(), error = %e, "Skipping unreadable directory");
                continue;
            }
        };

        for entry in entries.flatten() {
            // symlink_metadata so link cycles are never followed
            let Ok(meta) = entry.path().symlink_metadata() else {
                continue;
            };
            if meta.is_dir() {
                pending.push(entry.path());
            }
            newest = newer(newest, modified_millis(&meta));
        }
    }

    // An empty project stays None
    if newest.is_none() {
        return None;
    }
    let root_time = root.symlink_metadata().ok().and_then(|m| modified_millis(&m));
    newer(newest, root_time)
}

fn newer(current: Option<i64>, candidate: Option<i64>) -> Option<i64> {
    match (current, candidate) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

fn modified_millis(meta: &std::fs::Metadata) -> Option<i64> {
    let since = meta.modified().ok()?.duration_since(UNIX_EPOCH).ok()?;
    i64::try_from(since.as_millis()).ok()
}

// =============================================================================
// In-memory project (for testing)
// =============================================================================

/// A project whose settings and change time are set directly.
pub struct MemoryProject {
    name: String,
    root: PathBuf,
    dev: RwLock<RawDevConfig>,
    changed_at: RwLock<Option<i64>>,
}

impl MemoryProject {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            dev: RwLock::new(RawDevConfig::default()),
            changed_at: RwLock::new(None),
        }
    }

    /// Set `dev.onUpdate` as the user would write it.
    pub fn set_on_update(&self, value: Option<&str>) {
        let mut dev = self.dev.write().unwrap_or_else(|e| e.into_inner());
        dev.on_update = value.map(str::to_string);
    }

    /// Set `dev.uploadOnDevStart` as the user would write it.
    pub fn set_upload_on_dev_start(&self, value: Option<&str>) {
        let mut dev = self.dev.write().unwrap_or_else(|e| e.into_inner());
        dev.upload_on_dev_start = value.map(str::to_string);
    }

    pub fn set_changed_at(&self, changed_at: Option<i64>) {
        *self.changed_at.write().unwrap_or_else(|e| e.into_inner()) = changed_at;
    }
}

#[async_trait]
impl Project for MemoryProject {
    fn name(&self) -> &str {
        &self.name
    }

    fn root_dir(&self) -> &Path {
        &self.root
    }

    async fn dev_config(&self) -> Result<DevConfig, ConfigError> {
        self.dev.read().unwrap_or_else(|e| e.into_inner()).resolve()
    }

    async fn last_changed_at(&self) -> Option<i64> {
        *self.changed_at.read().unwrap_or_else(|e| e.into_inner())
    }
}
