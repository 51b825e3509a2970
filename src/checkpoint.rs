//! Reads and writes the time of the last successful run.
//!
//! The file holds a single timestamp such as `2024-03-01T08:15:07Z`, it is
//! overwritten at the end of each successful run.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use log::{debug, trace, warn};
use thiserror::Error;

use crate::models::Checkpoint;

/// The errors related to the checkpoint file.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// The file exists but can't be read.
    #[error("unable to read the checkpoint file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The file can't be written.
    #[error("unable to write the checkpoint file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Reads the last checkpoint.
///
/// Returns None when no run completed yet. A file whose content is not a
/// valid timestamp is treated the same way, so the next run fetches everything.
pub fn read_checkpoint(path: &Path) -> Result<Option<Checkpoint>, CheckpointError> {
    trace!("Running read_checkpoint()");
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!("No checkpoint found at {}", path.display());
            return Ok(None);
        }
        Err(e) => {
            return Err(CheckpointError::Read {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };

    let checkpoint = Checkpoint::parse(&content);
    if checkpoint.is_none() {
        warn!(
            "Invalid checkpoint \"{}\" in {}, ignoring it",
            content.trim(),
            path.display()
        );
    }
    Ok(checkpoint)
}

/// Saves the checkpoint, replacing the previous one.
pub fn save_checkpoint(path: &Path, checkpoint: Checkpoint) -> Result<(), CheckpointError> {
    trace!("Running save_checkpoint()");
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| CheckpointError::Write {
                path: path.to_path_buf(),
                source: e,
            })?;
        }
    }
    fs::write(path, checkpoint.to_string()).map_err(|e| CheckpointError::Write {
        path: path.to_path_buf(),
        source: e,
    })?;
    debug!("Checkpoint {} saved in {}", checkpoint, path.display());
    Ok(())
}
