/// The module cache_managers defines the vulnerabilities cache managers.
pub mod files;

use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use thiserror::Error;

use crate::models::Record;

/// The reasons why a year file couldn't be reformatted.
#[derive(Debug, Error)]
pub enum ReformatError {
    /// There is no file for this year.
    #[error("no file at {0}")]
    Missing(PathBuf),
    /// The file is already a JSON array and nothing was appended since.
    #[error("{0} is already formatted")]
    AlreadyFormatted(PathBuf),
    /// A line is not a JSON value.
    #[error("invalid JSON at line {line} of {path}: {message}")]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },
    /// The file couldn't be read or written.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// The error returned when a record can't be stored.
#[derive(Debug, Error)]
#[error("unable to store a record in {path}: {source}")]
pub struct StoreError {
    pub path: PathBuf,
    pub source: std::io::Error,
}

/// A common interface between all cache managers.
pub trait CacheManager {
    /// Stores a record with the other records of the same year.
    fn append(&self, record: &Record, year: i32) -> Result<(), StoreError>;

    /// Rewrites the records of a year as a single JSON array.
    /// Returns the number of records in the array.
    fn reformat(&self, year: i32) -> Result<usize, ReformatError>;
}

/// Replaces the content of a file, through a temporary file of the same
/// directory synced then renamed over it.
pub fn replace_file(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut temp = NamedTempFile::new_in(dir)?;
    temp.write_all(data)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
