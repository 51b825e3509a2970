//! This module contains the main structure and logic for the whole
//! application.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{builder::PossibleValue, Parser, ValueEnum};
use log::{debug, error, info, trace, warn, LevelFilter};
use simple_logger::SimpleLogger;

use crate::checkpoint::read_checkpoint;
use crate::config::{Config, ConfigError};
use crate::vulnerabilities::cache_managers::files::FileCacheManager;
use crate::vulnerabilities::enrichment::HttpFeedSource;
use crate::vulnerabilities::fetchers::nvd::NVDFetcher;
use crate::vulnerabilities::updater::{RunReport, SystemClock, Updater};

/// Represents the application
pub struct Application {
    /// The arguments given on the command line.
    argv: Option<Args>,
}

impl Default for Application {
    fn default() -> Self {
        Self::new()
    }
}

impl Application {
    /// Creates a new application
    pub fn new() -> Self {
        Application { argv: None }
    }

    /// Read argv to get the arguments before running the application
    pub fn read_argv(&mut self) {
        self.argv = Some(Args::parse());
    }

    /// Installs the logger with the level asked on the command line.
    pub fn init_logger(&self) {
        let level = self
            .argv
            .as_ref()
            .map(|a| a.log_level.to_level_filter())
            .unwrap_or(LevelFilter::Info);
        if let Err(e) = SimpleLogger::new().with_level(level).init() {
            eprintln!("Unable to initialize the logger: {}", e);
        }
    }

    /// Builds the configuration of the run from the command line and the
    /// API key given by the lookup.
    pub fn build_config<F>(&self, lookup: F) -> Result<Config, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        trace!("In Application::build_config()");
        let mut config = Config::from_lookup(lookup)?;
        if let Some(args) = self.argv.as_ref() {
            config.data_dir = args.data_dir.clone();
            config.checkpoint_file = args.checkpoint_file.clone();
            config.page_size = args.page_size;
            config.summary_csv = args.summary_csv.clone();
        }
        config.validate()?;
        debug!(
            "Data directory = {}, checkpoint = {}, page size = {}",
            config.data_dir.display(),
            config.checkpoint_file.display(),
            config.page_size
        );
        Ok(config)
    }

    /// Runs the global application
    /// read_argv() MUST have been called before
    pub fn run(&self) -> ExitCode {
        trace!("Running Application::run()");
        let config = match self.build_config(|name| std::env::var(name).ok()) {
            Ok(c) => c,
            Err(e) => {
                error!("Invalid configuration: {}", e);
                eprintln!("{}", e);
                return ExitCode::FAILURE;
            }
        };

        let reformat_only = self.argv.as_ref().is_some_and(|a| a.reformat_only);
        let cache = FileCacheManager::new(&config.data_dir);
        let clock = SystemClock;

        let fetcher = match NVDFetcher::new(&config) {
            Ok(f) => f,
            Err(e) => {
                error!("{}", e);
                return ExitCode::FAILURE;
            }
        };
        let feeds = if self.enrichment_enabled(&config) {
            match HttpFeedSource::new() {
                Ok(f) => Some(f),
                Err(e) => {
                    warn!("The summary won't be enriched: {}", e);
                    None
                }
            }
        } else {
            None
        };
        let mut updater = Updater::new(&fetcher, &cache, &clock, &config);
        if let Some(feeds) = feeds.as_ref() {
            updater = updater.with_feeds(feeds);
        }

        if reformat_only {
            info!("Reformatting the year files only");
            let failures = updater
                .reformat_all()
                .iter()
                .filter(|(_, result)| result.is_err())
                .count();
            debug!("{} year files not reformatted", failures);
            return ExitCode::SUCCESS;
        }

        let previous = match read_checkpoint(&config.checkpoint_file) {
            Ok(c) => c,
            Err(e) => {
                error!("{}", e);
                return ExitCode::FAILURE;
            }
        };

        match updater.run(previous) {
            Ok(report) => {
                self.log_report(&report);
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("Update failed: {}", e);
                eprintln!("Update failed: {}", e);
                ExitCode::FAILURE
            }
        }
    }

    /// Whether the summary is enriched with the exploitation feeds.
    /// There is nothing to enrich without summary.
    fn enrichment_enabled(&self, config: &Config) -> bool {
        config.summary_csv.is_some() && !self.argv.as_ref().is_some_and(|a| a.no_enrichment)
    }

    /// Logs what a run did.
    fn log_report(&self, report: &RunReport) {
        info!(
            "{} CVEs received in {} pages ({} requests, {} retries)",
            report.records, report.pages, report.requests, report.retries
        );
        for (year, count) in &report.records_per_year {
            debug!("{}: {} CVEs", year, count);
        }
        let reformatted = report
            .reformatted
            .iter()
            .filter(|(_, result)| result.is_ok())
            .count();
        info!("{} year files reformatted", reformatted);
        if let Some(checkpoint) = report.checkpoint {
            info!("Next run will fetch the updates since {}", checkpoint);
        }
    }
}

/// The verbosity of the logs.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// The matching level of the log crate.
    pub fn to_level_filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}

impl ValueEnum for LogLevel {
    /// Lists the variants available for clap
    fn value_variants<'a>() -> &'a [Self] {
        &[
            LogLevel::Error,
            LogLevel::Warn,
            LogLevel::Info,
            LogLevel::Debug,
            LogLevel::Trace,
        ]
    }

    /// Map each value to a possible value in clap
    fn to_possible_value(&self) -> Option<PossibleValue> {
        match &self {
            LogLevel::Error => Some(PossibleValue::new("error")),
            LogLevel::Warn => Some(PossibleValue::new("warn")),
            LogLevel::Info => Some(PossibleValue::new("info")),
            LogLevel::Debug => Some(PossibleValue::new("debug")),
            LogLevel::Trace => Some(PossibleValue::new("trace")),
        }
    }
}

/// Represents the CLI arguments accepted by nvd-updater
///
/// The API key is read in the NVD_API_KEY environment variable.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// The directory where the year files are written
    #[arg(short, long, value_name = "DIR", default_value = "data/nvd")]
    pub data_dir: PathBuf,
    /// The file holding the time of the last successful run
    #[arg(short, long, value_name = "FILE", default_value = "last_run.txt")]
    pub checkpoint_file: PathBuf,
    /// The number of CVEs asked per request
    #[arg(short, long, value_name = "SIZE", default_value_t = 200)]
    pub page_size: u32,
    /// Also write the CVSS summary of the fetched CVEs in this CSV file
    #[arg(short, long, value_name = "FILE")]
    pub summary_csv: Option<PathBuf>,
    /// Don't download the exploitation feeds (KEV, EPSS, ExploitDB, Metasploit, Nuclei)
    /// to rescore the summary
    #[arg(short, long)]
    pub no_enrichment: bool,
    /// Only reformat the year files, without fetching anything
    #[arg(short, long)]
    pub reformat_only: bool,
    /// The verbosity of the logs
    #[arg(short, long, value_name = "LEVEL", default_value = "info")]
    pub log_level: LogLevel,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn application(argv: &[&str]) -> Application {
        Application {
            argv: Some(Args::try_parse_from(argv).unwrap()),
        }
    }

    #[test]
    fn defaults_match_the_config() {
        let app = application(&["nvd-updater"]);
        let config = app.build_config(|_| Some("key".to_string())).unwrap();
        assert_eq!(PathBuf::from("data/nvd"), config.data_dir);
        assert_eq!(PathBuf::from("last_run.txt"), config.checkpoint_file);
        assert_eq!(200, config.page_size);
        assert!(config.summary_csv.is_none());
    }

    #[test]
    fn arguments_override_the_config() {
        let app = application(&[
            "nvd-updater",
            "--data-dir",
            "/tmp/nvd",
            "--checkpoint-file",
            "/tmp/last.txt",
            "--page-size",
            "2000",
            "--summary-csv",
            "cvss.csv",
            "--log-level",
            "debug",
        ]);
        let config = app.build_config(|_| Some("key".to_string())).unwrap();
        assert_eq!(PathBuf::from("/tmp/nvd"), config.data_dir);
        assert_eq!(PathBuf::from("/tmp/last.txt"), config.checkpoint_file);
        assert_eq!(2000, config.page_size);
        assert_eq!(Some(PathBuf::from("cvss.csv")), config.summary_csv);
        assert_eq!(
            LevelFilter::Debug,
            app.argv.as_ref().unwrap().log_level.to_level_filter()
        );
    }

    #[test]
    fn missing_key_refuses_to_start() {
        let app = application(&["nvd-updater"]);
        assert!(matches!(
            app.build_config(|_| None),
            Err(ConfigError::MissingApiKey)
        ));
    }

    #[test]
    fn oversized_page_is_rejected() {
        let app = application(&["nvd-updater", "--page-size", "5000"]);
        assert!(matches!(
            app.build_config(|_| Some("key".to_string())),
            Err(ConfigError::InvalidPageSize(5000))
        ));
    }

    #[test]
    fn enrichment_needs_a_summary() {
        let app = application(&["nvd-updater"]);
        let config = app.build_config(|_| Some("key".to_string())).unwrap();
        assert!(!app.enrichment_enabled(&config));

        let app = application(&["nvd-updater", "--summary-csv", "cvss-bt.csv"]);
        let config = app.build_config(|_| Some("key".to_string())).unwrap();
        assert!(app.enrichment_enabled(&config));

        let app = application(&[
            "nvd-updater",
            "--summary-csv",
            "cvss-bt.csv",
            "--no-enrichment",
        ]);
        let config = app.build_config(|_| Some("key".to_string())).unwrap();
        assert!(!app.enrichment_enabled(&config));
    }

    #[test]
    fn invalid_log_level_is_rejected() {
        assert!(Args::try_parse_from(["nvd-updater", "--log-level", "loud"]).is_err());
    }
}
