//! Error types for instruction handling.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur when mapping an instruction onto the device.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InstructionError {
    /// The local path is not absolute.
    #[error("path is not absolute: {}", .0.display())]
    NotAbsolute(PathBuf),

    /// The local path does not live under the project root.
    #[error("{} is outside project root {}", file.display(), root.display())]
    OutsideProject { file: PathBuf, root: PathBuf },

    /// The path contains a `..`, prefix or root component after the project root.
    #[error("path has an invalid component: {}", .0.display())]
    InvalidComponent(PathBuf),

    /// The path cannot be represented on the device.
    #[error("path is not valid UTF-8: {}", .0.display())]
    NonUtf8(PathBuf),
}
