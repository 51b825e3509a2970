//! This module contains the FileCacheManager struct.

use std::fs::{self, create_dir_all, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use log::{debug, trace};
use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use serde_json::{Deserializer, Serializer, Value};

use crate::models::Record;
use crate::vulnerabilities::cache_managers::{
    replace_file, CacheManager, ReformatError, StoreError,
};

/// Represents a cache manager which stores the records in one file per year.
///
/// The files have the following structure:
/// data/nvd/
///   \__nvd_vulns_1999.json
///   \__...
///   \__nvd_vulns_2024.json
///
/// During a run the records are appended one per line. Once the run is
/// over each file is rewritten as a single JSON array indented with 4 spaces.
pub struct FileCacheManager {
    /// The directory containing the year files.
    root_dir: PathBuf,
}

impl FileCacheManager {
    /// Creates a new FileCacheManager writing in the given directory.
    pub fn new(root_dir: &Path) -> Self {
        Self {
            root_dir: root_dir.to_path_buf(),
        }
    }

    /// The path of the file holding the records of a year.
    pub fn year_path(&self, year: i32) -> PathBuf {
        self.root_dir.join(format!("nvd_vulns_{:04}.json", year))
    }
}

/// Reads the records out of a year file.
///
/// The file is made of an optional JSON array, left by a previous
/// reformat, followed by one JSON value per line.
fn parse_year_file(path: &Path, content: &str) -> Result<Vec<Value>, ReformatError> {
    let mut values = Vec::new();
    let mut rest = content;
    let mut first_line = 1;

    if content.trim_start().starts_with('[') {
        let mut stream = Deserializer::from_str(content).into_iter::<Value>();
        match stream.next() {
            Some(Ok(Value::Array(previous))) => values = previous,
            Some(Err(e)) => {
                return Err(ReformatError::Parse {
                    path: path.to_path_buf(),
                    line: e.line(),
                    message: e.to_string(),
                })
            }
            _ => {
                return Err(ReformatError::Parse {
                    path: path.to_path_buf(),
                    line: 1,
                    message: "expected an array".to_string(),
                })
            }
        }
        let offset = stream.byte_offset();
        rest = &content[offset..];
        if rest.trim().is_empty() {
            return Err(ReformatError::AlreadyFormatted(path.to_path_buf()));
        }
        first_line += content[..offset].matches('\n').count();
    }

    for (index, line) in rest.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let value = serde_json::from_str(line).map_err(|e| ReformatError::Parse {
            path: path.to_path_buf(),
            line: first_line + index,
            message: e.to_string(),
        })?;
        values.push(value);
    }
    Ok(values)
}

/// Serializes the records as a JSON array indented with 4 spaces.
fn to_pretty_array(values: &[Value]) -> Result<Vec<u8>, serde_json::Error> {
    let mut buffer = Vec::new();
    let formatter = PrettyFormatter::with_indent(b"    ");
    let mut serializer = Serializer::with_formatter(&mut buffer, formatter);
    values.serialize(&mut serializer)?;
    buffer.push(b'\n');
    Ok(buffer)
}

impl CacheManager for FileCacheManager {
    /// Appends the record on its own line at the end of the year file.
    /// The file is created if needed and closed right after.
    fn append(&self, record: &Record, year: i32) -> Result<(), StoreError> {
        trace!("Running FileCacheManager::append()");
        let filename = self.year_path(year);
        let to_store_error = |source| StoreError {
            path: filename.clone(),
            source,
        };

        if !self.root_dir.exists() {
            debug!("Creating the directory {}", self.root_dir.display());
            create_dir_all(&self.root_dir).map_err(to_store_error)?;
        }

        let mut line = serde_json::to_string(record.value())
            .map_err(|e| to_store_error(std::io::Error::new(ErrorKind::InvalidData, e)))?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&filename)
            .map_err(to_store_error)?;
        file.write_all(line.as_bytes()).map_err(to_store_error)?;
        Ok(())
    }

    /// Rewrites the year file as a JSON array.
    ///
    /// A file whose content can't be parsed is left untouched.
    fn reformat(&self, year: i32) -> Result<usize, ReformatError> {
        trace!("Running FileCacheManager::reformat()");
        let filename = self.year_path(year);
        let content = match fs::read_to_string(&filename) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(ReformatError::Missing(filename));
            }
            Err(e) => {
                return Err(ReformatError::Io {
                    path: filename,
                    source: e,
                })
            }
        };

        let values = parse_year_file(&filename, &content)?;
        let data = to_pretty_array(&values).map_err(|e| ReformatError::Io {
            path: filename.clone(),
            source: std::io::Error::new(ErrorKind::InvalidData, e),
        })?;
        replace_file(&filename, &data).map_err(|e| ReformatError::Io {
            path: filename.clone(),
            source: e,
        })?;
        debug!("{} reformatted with {} records", filename.display(), values.len());
        Ok(values.len())
    }
}
