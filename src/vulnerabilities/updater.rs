//! The update loop.
//!
//! The [`Updater`] asks the fetcher for the records modified since the last
//! run, one page at a time, gives each record to the cache manager, then
//! reformats the year files and saves the new checkpoint.
//!
//! Failed requests are retried after a pause. The retries are counted for the
//! whole run, not per page: once the budget is spent the next failure stops
//! the run and the checkpoint is left as is, so the next run asks for the
//! same window again. Records appended before a failure stay on disk, and a
//! page fetched again after a failure may be appended twice.

use std::collections::BTreeMap;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Datelike, Utc};
use log::{debug, error, info, trace, warn};
use thiserror::Error;

use crate::checkpoint::{save_checkpoint, CheckpointError};
use crate::config::Config;
use crate::models::{Checkpoint, Page, QueryWindow};
use crate::vulnerabilities::cache_managers::{CacheManager, ReformatError, StoreError};
use crate::vulnerabilities::enrichment::{ExploitIntel, FeedSource};
use crate::vulnerabilities::fetchers::{FetchError, PageFetcher};
use crate::vulnerabilities::summary::{merge_into_csv, SummaryRow};

/// The errors stopping a run.
#[derive(Debug, Error)]
pub enum UpdateError {
    /// A request failed in a way that can't be fixed by retrying.
    #[error("unable to fetch the updates: {0}")]
    Fetch(FetchError),
    /// Too many requests failed during the run.
    #[error("maximum retries reached ({retries}), last error: {last}")]
    RetriesExhausted { retries: u32, last: FetchError },
    /// A record couldn't be written.
    #[error(transparent)]
    Storage(#[from] StoreError),
    /// The new checkpoint couldn't be saved.
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

/// Gives the time and waits. Lets the tests run without waiting.
pub trait Clock {
    /// The current time.
    fn now(&self) -> DateTime<Utc>;

    /// Blocks for the given duration.
    fn sleep(&self, duration: Duration);
}

/// The real clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// What happened during a run.
#[derive(Debug)]
pub struct RunReport {
    /// The window asked to the API.
    pub window: QueryWindow,
    /// The number of requests sent, failed ones included.
    pub requests: u32,
    /// The number of pages containing records.
    pub pages: u32,
    /// The number of records written.
    pub records: u64,
    /// The total announced by the API with the first page.
    pub total_results: Option<u64>,
    /// The number of retries used.
    pub retries: u32,
    /// The number of records written per year.
    pub records_per_year: BTreeMap<i32, u64>,
    /// The result of the reformat of each year file.
    pub reformatted: Vec<(i32, Result<usize, ReformatError>)>,
    /// The checkpoint saved at the end of the run.
    pub checkpoint: Option<Checkpoint>,
}

impl RunReport {
    fn new(window: QueryWindow) -> Self {
        RunReport {
            window,
            requests: 0,
            pages: 0,
            records: 0,
            total_results: None,
            retries: 0,
            records_per_year: BTreeMap::new(),
            reformatted: Vec::new(),
            checkpoint: None,
        }
    }
}

/// Fetches the updates and stores them.
pub struct Updater<'a> {
    /// Where the records come from.
    fetcher: &'a dyn PageFetcher,
    /// Where the records go.
    cache: &'a dyn CacheManager,
    /// Gives the time and waits between requests.
    clock: &'a dyn Clock,
    /// The configuration of the run.
    config: &'a Config,
    /// Where the exploitation data of the summary comes from, if any.
    feeds: Option<&'a dyn FeedSource>,
}

impl<'a> Updater<'a> {
    /// Creates a new Updater
    pub fn new(
        fetcher: &'a dyn PageFetcher,
        cache: &'a dyn CacheManager,
        clock: &'a dyn Clock,
        config: &'a Config,
    ) -> Self {
        Updater {
            fetcher,
            cache,
            clock,
            config,
            feeds: None,
        }
    }

    /// Enriches the summary with the exploitation data of the feeds.
    pub fn with_feeds(mut self, feeds: &'a dyn FeedSource) -> Self {
        self.feeds = Some(feeds);
        self
    }

    /// Fetches everything modified since the previous checkpoint, then
    /// reformats the year files and saves the new checkpoint.
    ///
    /// Without previous checkpoint, everything is fetched.
    pub fn run(&self, previous: Option<Checkpoint>) -> Result<RunReport, UpdateError> {
        trace!("Running Updater::run()");
        let window = QueryWindow::new(previous, Checkpoint::new(self.clock.now()));
        match previous {
            Some(start) => info!("Fetching updates from NVD API since last run at {}", start),
            None => info!("Fetching all data from NVD API. This may take a while."),
        }

        let mut report = RunReport::new(window.clone());
        let mut summary_rows = Vec::new();
        let mut start_index: u64 = 0;
        let mut retries_left = self.config.max_retries;

        loop {
            report.requests += 1;
            let (page, years) = match self.fetch_page(&window, start_index) {
                Ok(p) => p,
                Err(e) if e.is_retryable() => {
                    warn!("{}", e);
                    if retries_left == 0 {
                        error!("Maximum retries reached. Exiting.");
                        return Err(UpdateError::RetriesExhausted {
                            retries: self.config.max_retries,
                            last: e,
                        });
                    }
                    retries_left -= 1;
                    report.retries += 1;
                    info!(
                        "Retrying in {} seconds...",
                        self.config.retry_delay.as_secs()
                    );
                    self.clock.sleep(self.config.retry_delay);
                    continue;
                }
                Err(e) => {
                    error!("{}", e);
                    return Err(UpdateError::Fetch(e));
                }
            };

            if page.records.is_empty() {
                debug!("Empty page at index {}, nothing more to fetch", start_index);
                break;
            }

            report.pages += 1;
            if report.total_results.is_none() {
                info!("Total results: {}", page.total_results);
                report.total_results = Some(page.total_results);
            }

            for (record, year) in page.records.iter().zip(years) {
                self.cache.append(record, year)?;
                *report.records_per_year.entry(year).or_insert(0) += 1;
                if self.config.summary_csv.is_some() {
                    summary_rows.extend(SummaryRow::from_record(record));
                }
            }

            let received = page.records.len() as u64;
            report.records += received;
            start_index += received;
            info!("Page {} received {} CVEs", report.pages, received);
            info!("Total CVEs received so far: {}", start_index);

            if received < u64::from(self.config.page_size) {
                break;
            }

            self.clock.sleep(self.config.page_delay);
        }

        report.reformatted = self.reformat_all();

        if let Some(path) = &self.config.summary_csv {
            let intel = self
                .feeds
                .map(|feeds| ExploitIntel::collect(feeds, self.clock.now().date_naive()));
            match merge_into_csv(path, &summary_rows, intel.as_ref()) {
                Ok(total) => info!("{} CVEs in the summary {}", total, path.display()),
                Err(e) => error!("Unable to update the summary: {}", e),
            }
        }

        let checkpoint = Checkpoint::new(self.clock.now());
        save_checkpoint(&self.config.checkpoint_file, checkpoint)?;
        report.checkpoint = Some(checkpoint);
        Ok(report)
    }

    /// Fetches a page and finds the year of each record.
    ///
    /// A record without a valid identifier makes the whole page invalid,
    /// before anything is written.
    fn fetch_page(
        &self,
        window: &QueryWindow,
        start_index: u64,
    ) -> Result<(Page, Vec<i32>), FetchError> {
        let page = self
            .fetcher
            .fetch_page(window, start_index, self.config.page_size)?;
        let years = page
            .records
            .iter()
            .enumerate()
            .map(|(index, record)| {
                record.year().ok_or_else(|| {
                    FetchError::Payload(format!(
                        "record {} has no valid CVE identifier",
                        start_index + index as u64
                    ))
                })
            })
            .collect::<Result<Vec<i32>, FetchError>>()?;
        Ok((page, years))
    }

    /// Reformats the file of every year, from the first year to the
    /// current one. A failure is logged and doesn't stop the others.
    pub fn reformat_all(&self) -> Vec<(i32, Result<usize, ReformatError>)> {
        trace!("Running Updater::reformat_all()");
        let current_year = self.clock.now().year();
        (self.config.first_year..=current_year)
            .map(|year| {
                let result = self.cache.reformat(year);
                match &result {
                    Ok(count) => debug!("Year {} reformatted, {} CVEs", year, count),
                    Err(ReformatError::AlreadyFormatted(_)) => {
                        debug!("Nothing new for year {}", year)
                    }
                    Err(e @ ReformatError::Missing(_)) => warn!("Year {} skipped: {}", year, e),
                    Err(e) => error!("Error occurred while reformatting year {}: {}", year, e),
                }
                (year, result)
            })
            .collect()
    }
}
