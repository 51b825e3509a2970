//! Incremental downloader for the NVD CVE API.
//!
//! The records modified since the last successful run are fetched page by
//! page, stored in one file per year, and the time of the run is saved so the
//! next run only asks for what changed in between.

pub mod application;
pub mod checkpoint;
pub mod config;
pub mod models;
pub mod vulnerabilities;
