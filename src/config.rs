//! The configuration of a run.
//!
//! Everything the updater needs is gathered in a [`Config`] built once at
//! startup, then handed to the components that need it.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use log::trace;
use thiserror::Error;

/// The environment variable holding the NVD API key.
pub const API_KEY_VARIABLE: &str = "NVD_API_KEY";

/// The endpoint of the CVE API. Rejected CVEs are filtered out.
pub const DEFAULT_API_URL: &str = "https://services.nvd.nist.gov/rest/json/cves/2.0?noRejected";

/// The maximum value the API accepts for `resultsPerPage`.
pub const MAX_PAGE_SIZE: u32 = 2000;

/// The errors preventing the application from starting.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No API key was found.
    #[error("NVD API key is not set. Export it in the NVD_API_KEY environment variable.")]
    MissingApiKey,
    /// The page size is outside of what the API accepts.
    #[error("invalid page size {0}, it must be between 1 and 2000")]
    InvalidPageSize(u32),
}

/// Represents the configuration of a run.
#[derive(Clone, Debug)]
pub struct Config {
    /// The key sent to the API.
    pub api_key: String,
    /// The URL of the CVE endpoint.
    pub api_url: String,
    /// The directory where the year files are written.
    pub data_dir: PathBuf,
    /// The file holding the time of the last successful run.
    pub checkpoint_file: PathBuf,
    /// The number of records asked per page.
    pub page_size: u32,
    /// The pause between two successful pages.
    /// The NVD asks clients to wait 6 seconds between requests.
    pub page_delay: Duration,
    /// How many failed requests can be retried during a whole run.
    pub max_retries: u32,
    /// The pause before retrying a failed request.
    pub retry_delay: Duration,
    /// The oldest year whose file is reformatted at the end of a run.
    pub first_year: i32,
    /// Where to write the CVSS summary, if wanted.
    pub summary_csv: Option<PathBuf>,
}

impl Config {
    /// Creates a configuration with the default values.
    pub fn new(api_key: &str) -> Self {
        Config {
            api_key: api_key.to_string(),
            api_url: DEFAULT_API_URL.to_string(),
            data_dir: PathBuf::from("data/nvd"),
            checkpoint_file: PathBuf::from("last_run.txt"),
            page_size: 200,
            page_delay: Duration::from_secs(6),
            max_retries: 5,
            retry_delay: Duration::from_secs(10),
            first_year: 1999,
            summary_csv: None,
        }
    }

    /// Creates a configuration whose API key is read with the given lookup.
    ///
    /// The lookup receives the name of the variable and returns its value,
    /// if any. A blank value counts as missing.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        trace!("Running Config::from_lookup()");
        match lookup(API_KEY_VARIABLE) {
            Some(key) if !key.trim().is_empty() => Ok(Config::new(key.trim())),
            _ => Err(ConfigError::MissingApiKey),
        }
    }

    /// Creates a configuration whose API key is read in the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Config::from_lookup(|name| env::var(name).ok())
    }

    /// Checks the values that could have been overridden on the command line.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            return Err(ConfigError::InvalidPageSize(self.page_size));
        }
        Ok(())
    }
}
