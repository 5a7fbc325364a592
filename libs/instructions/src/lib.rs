//! # devsync-instructions
//!
//! File instruction types and coalescing primitives for devsync.
//!
//! A watcher turns local filesystem events into [`FileInstruction`]s. Device
//! managers queue them, reduce each drained batch with [`coalesce`], and apply
//! what survives to the device.
//!
//! # Invariants
//!
//! - Instructions are immutable once created
//! - Local paths are absolute; remote paths are POSIX and relative to the
//!   device root
//! - Coalescing is pure, deterministic and idempotent

mod coalesce;
mod error;

use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

pub use coalesce::coalesce;
pub use error::InstructionError;

/// Remote path used for the project root itself.
pub const REMOTE_ROOT: &str = "/";

/// What happened to a local file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileAction {
    Change,
    Create,
    Delete,
}

impl FileAction {
    /// Returns true if applying this action uploads local content.
    pub fn uploads(&self) -> bool {
        matches!(self, Self::Change | Self::Create)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Change => "change",
            Self::Create => "create",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for FileAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pending local filesystem event, pre-translated to an absolute path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileInstruction {
    pub action: FileAction,
    pub file: PathBuf,
}

impl FileInstruction {
    pub fn new(action: FileAction, file: impl Into<PathBuf>) -> Self {
        Self {
            action,
            file: file.into(),
        }
    }

    pub fn change(file: impl Into<PathBuf>) -> Self {
        Self::new(FileAction::Change, file)
    }

    pub fn create(file: impl Into<PathBuf>) -> Self {
        Self::new(FileAction::Create, file)
    }

    pub fn delete(file: impl Into<PathBuf>) -> Self {
        Self::new(FileAction::Delete, file)
    }

    /// Translate the local path into the device path it maps to.
    ///
    /// See [`remote_path`].
    pub fn remote_path(&self, project_root: &Path) -> Result<String, InstructionError> {
        remote_path(project_root, &self.file)
    }
}

impl fmt::Display for FileInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.action, self.file.display())
    }
}

/// Map an absolute local path to a POSIX path relative to the device root.
///
/// `/proj/lib/util.py` under `/proj` becomes `lib/util.py`. The project root
/// itself maps to [`REMOTE_ROOT`]. Paths outside the project, relative paths
/// and paths containing `..` are rejected.
pub fn remote_path(project_root: &Path, file: &Path) -> Result<String, InstructionError> {
    if !file.is_absolute() {
        return Err(InstructionError::NotAbsolute(file.to_path_buf()));
    }

    let relative = file
        .strip_prefix(project_root)
        .map_err(|_| InstructionError::OutsideProject {
            file: file.to_path_buf(),
            root: project_root.to_path_buf(),
        })?;

    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                let part = part
                    .to_str()
                    .ok_or_else(|| InstructionError::NonUtf8(file.to_path_buf()))?;
                parts.push(part);
            }
            Component::CurDir => {}
            _ => return Err(InstructionError::InvalidComponent(file.to_path_buf())),
        }
    }

    if parts.is_empty() {
        Ok(REMOTE_ROOT.to_string())
    } else {
        Ok(parts.join("/"))
    }
}
