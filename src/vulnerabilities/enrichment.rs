//! This module enriches the CVSS summary with the exploitation data of public
//! feeds and rescores each CVE with its exploit maturity.
//!
//! The feeds are:
//! - the CISA Known Exploited Vulnerabilities catalog,
//! - the EPSS scores of the day,
//! - the ExploitDB index,
//! - the Metasploit modules metadata,
//! - the Nuclei templates index.
//!
//! A feed which can't be downloaded or read is logged and considered empty.

use std::collections::{HashMap, HashSet};
use std::io::Read;

use chrono::NaiveDate;
use flate2::read::GzDecoder;
use log::{debug, info, trace, warn};
use regex::Regex;
use reqwest::blocking::Client;
use serde::Deserialize;
use thiserror::Error;

use crate::vulnerabilities::summary::SummaryRow;

/// The CISA Known Exploited Vulnerabilities catalog.
pub const KEV_URL: &str =
    "https://www.cisa.gov/sites/default/files/feeds/known_exploited_vulnerabilities.json";
/// The ExploitDB index, as CSV.
pub const EXPLOITDB_URL: &str =
    "https://gitlab.com/exploit-database/exploitdb/-/raw/main/files_exploits.csv";
/// The metadata of all the Metasploit modules.
pub const METASPLOIT_URL: &str = "https://raw.githubusercontent.com/rapid7/metasploit-framework/master/db/modules_metadata_base.json";
/// The index of the Nuclei templates, one JSON object per line.
pub const NUCLEI_URL: &str =
    "https://raw.githubusercontent.com/projectdiscovery/nuclei-templates/main/cves.json";

/// From this EPSS score, the CVE very likely has weaponized exploit code.
pub const EPSS_THRESHOLD: f64 = 0.36;

/// The pattern of a CVE identifier inside the ExploitDB codes.
const CVE_PATTERN: &str = r"CVE-\d{4}-\d{4,7}";

/// The EPSS scores published for a day.
/// Example: https://epss.cyentia.com/epss_scores-2024-06-01.csv.gz
pub fn epss_url(day: NaiveDate) -> String {
    format!(
        "https://epss.cyentia.com/epss_scores-{}.csv.gz",
        day.format("%Y-%m-%d")
    )
}

/// The errors which can happen while loading a feed.
#[derive(Debug, Error)]
pub enum FeedError {
    /// The feed couldn't be downloaded.
    #[error("network error: {0}")]
    Network(String),
    /// The server answered with an error status.
    #[error("HTTP status {0}")]
    Status(u16),
    /// The content of the feed is not what was expected.
    #[error("invalid feed: {0}")]
    Payload(String),
}

/// A common interface to download the feeds.
pub trait FeedSource {
    /// Downloads the raw content at the given URL.
    fn download(&self, url: &str) -> Result<Vec<u8>, FeedError>;
}

/// Downloads the feeds over HTTP.
pub struct HttpFeedSource {
    /// The HTTP client, reused between feeds.
    client: Client,
}

impl HttpFeedSource {
    /// Creates a new HttpFeedSource.
    pub fn new() -> Result<Self, FeedError> {
        trace!("Running HttpFeedSource::new()");
        let client = Client::builder()
            .user_agent(concat!("nvd-updater/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FeedError::Network(format!("unable to create a HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

impl FeedSource for HttpFeedSource {
    fn download(&self, url: &str) -> Result<Vec<u8>, FeedError> {
        trace!("Running HttpFeedSource::download()");
        debug!("Downloading {}", url);
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|e| FeedError::Network(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(FeedError::Status(status.as_u16()));
        }
        let body = response
            .bytes()
            .map_err(|e| FeedError::Network(e.to_string()))?;
        Ok(body.to_vec())
    }
}

/// The KEV catalog, only the identifiers are read.
#[derive(Debug, Deserialize)]
struct KEVCatalog {
    vulnerabilities: Vec<KEVEntry>,
}

#[derive(Debug, Deserialize)]
struct KEVEntry {
    #[serde(rename = "cveID")]
    cve_id: String,
}

/// One line of the EPSS scores.
#[derive(Debug, Deserialize)]
struct EPSSScore {
    cve: String,
    epss: f64,
}

/// A Metasploit module, only its references are read.
#[derive(Debug, Deserialize)]
struct MetasploitModule {
    #[serde(default)]
    references: Option<Vec<String>>,
}

/// One line of the Nuclei index.
#[derive(Debug, Deserialize)]
struct NucleiTemplate {
    #[serde(rename = "ID")]
    id: String,
}

/// Reads the CVE identifiers of the KEV catalog.
pub fn parse_kev(content: &[u8]) -> Result<HashSet<String>, FeedError> {
    let catalog: KEVCatalog =
        serde_json::from_slice(content).map_err(|e| FeedError::Payload(e.to_string()))?;
    Ok(catalog
        .vulnerabilities
        .into_iter()
        .map(|entry| entry.cve_id)
        .collect())
}

/// Reads the EPSS score of each CVE.
///
/// The content may be compressed with gzip. The lines starting with `#` are
/// comments.
pub fn parse_epss(content: &[u8]) -> Result<HashMap<String, f64>, FeedError> {
    let mut decompressed = Vec::new();
    let csv_content = if content.starts_with(&[0x1f, 0x8b]) {
        let mut decoder = GzDecoder::new(content);
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| FeedError::Payload(format!("invalid gzip data: {}", e)))?;
        decompressed.as_slice()
    } else {
        content
    };

    let mut reader = csv::ReaderBuilder::new()
        .comment(Some(b'#'))
        .from_reader(csv_content);
    let mut scores = HashMap::new();
    for row in reader.deserialize() {
        let row: EPSSScore = row.map_err(|e| FeedError::Payload(e.to_string()))?;
        scores.insert(row.cve, row.epss);
    }
    Ok(scores)
}

/// Reads the CVE identifiers out of the `codes` column of the ExploitDB
/// index. A line can reference several CVEs.
pub fn parse_exploitdb(content: &[u8]) -> Result<HashSet<String>, FeedError> {
    let pattern = Regex::new(CVE_PATTERN).map_err(|e| FeedError::Payload(e.to_string()))?;
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(content);
    let codes_index = reader
        .headers()
        .map_err(|e| FeedError::Payload(e.to_string()))?
        .iter()
        .position(|h| h == "codes")
        .ok_or_else(|| FeedError::Payload("no codes column".to_string()))?;

    let mut cves = HashSet::new();
    for record in reader.records() {
        let record = record.map_err(|e| FeedError::Payload(e.to_string()))?;
        if let Some(codes) = record.get(codes_index) {
            cves.extend(pattern.find_iter(codes).map(|m| m.as_str().to_string()));
        }
    }
    Ok(cves)
}

/// Reads the CVEs referenced by the Metasploit modules.
pub fn parse_metasploit(content: &[u8]) -> Result<HashSet<String>, FeedError> {
    let modules: HashMap<String, MetasploitModule> =
        serde_json::from_slice(content).map_err(|e| FeedError::Payload(e.to_string()))?;
    Ok(modules
        .into_values()
        .flat_map(|module| module.references.unwrap_or_default())
        .filter(|reference| reference.starts_with("CVE-"))
        .collect())
}

/// Reads the CVEs having a Nuclei template.
pub fn parse_nuclei(content: &[u8]) -> Result<HashSet<String>, FeedError> {
    let content = std::str::from_utf8(content).map_err(|e| FeedError::Payload(e.to_string()))?;
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str::<NucleiTemplate>(line)
                .map(|template| template.id)
                .map_err(|e| FeedError::Payload(e.to_string()))
        })
        .collect()
}

/// How mature the known exploits of a CVE are, as a CVSS temporal metric.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ExploitMaturity {
    /// E:H
    High,
    /// E:F
    Functional,
    /// E:P, or E:POC with CVSS 2
    ProofOfConcept,
    /// E:U
    Unproven,
}

impl ExploitMaturity {
    /// The metric to append to a vector of the given CVSS version.
    pub fn metric(self, cvss_version: &str) -> &'static str {
        match self {
            ExploitMaturity::High => "E:H",
            ExploitMaturity::Functional => "E:F",
            ExploitMaturity::ProofOfConcept if cvss_version == "2.0" => "E:POC",
            ExploitMaturity::ProofOfConcept => "E:P",
            ExploitMaturity::Unproven => "E:U",
        }
    }

    /// The weight of the metric in the CVSS 3 formula, in hundredths.
    fn cvss3_weight(self) -> u32 {
        match self {
            ExploitMaturity::High => 100,
            ExploitMaturity::Functional => 97,
            ExploitMaturity::ProofOfConcept => 94,
            ExploitMaturity::Unproven => 91,
        }
    }

    /// The weight of the metric in the CVSS 2 formula, in hundredths.
    fn cvss2_weight(self) -> u32 {
        match self {
            ExploitMaturity::High => 100,
            ExploitMaturity::Functional => 95,
            ExploitMaturity::ProofOfConcept => 90,
            ExploitMaturity::Unproven => 85,
        }
    }
}

/// Computes the temporal score and severity of a base score once the exploit
/// maturity is known. The other temporal metrics are not defined.
///
/// Returns None for the CVSS versions without temporal metrics.
pub fn temporal_score(
    cvss_version: &str,
    base_score: f64,
    maturity: ExploitMaturity,
) -> Option<(f64, &'static str)> {
    // Scores are handled in tenths to avoid float rounding errors.
    let base = (base_score * 10.0).round().max(0.0) as u32;
    if cvss_version.starts_with("3.") {
        // The temporal score is rounded up to one decimal.
        let tenths = (base * maturity.cvss3_weight()).div_ceil(100);
        let severity = match tenths {
            0 => "NONE",
            1..=39 => "LOW",
            40..=69 => "MEDIUM",
            70..=89 => "HIGH",
            _ => "CRITICAL",
        };
        Some((f64::from(tenths) / 10.0, severity))
    } else if cvss_version.starts_with("2.") {
        // The temporal score is rounded half up to one decimal.
        let tenths = (base * maturity.cvss2_weight() + 50) / 100;
        let severity = match tenths {
            0..=39 => "LOW",
            40..=69 => "MEDIUM",
            _ => "HIGH",
        };
        Some((f64::from(tenths) / 10.0, severity))
    } else {
        None
    }
}

/// What the feeds know about the exploitation of the CVEs.
#[derive(Debug, Default)]
pub struct ExploitIntel {
    /// The CVEs exploited in the wild.
    pub kev: HashSet<String>,
    /// The EPSS score of each CVE.
    pub epss: HashMap<String, f64>,
    /// The CVEs with an exploit in ExploitDB.
    pub exploitdb: HashSet<String>,
    /// The CVEs with a Metasploit module.
    pub metasploit: HashSet<String>,
    /// The CVEs with a Nuclei template.
    pub nuclei: HashSet<String>,
}

/// Downloads and parses a feed.
fn load<T, F>(source: &dyn FeedSource, name: &str, url: &str, parse: F) -> Result<T, FeedError>
where
    F: Fn(&[u8]) -> Result<T, FeedError>,
{
    let content = source.download(url)?;
    let parsed = parse(&content)?;
    debug!("{} feed loaded from {}", name, url);
    Ok(parsed)
}

/// Keeps the feed, or logs the failure and keeps an empty one.
fn or_empty<T: Default>(name: &str, result: Result<T, FeedError>) -> T {
    match result {
        Ok(feed) => feed,
        Err(e) => {
            warn!("Unable to load the {} feed: {}", name, e);
            T::default()
        }
    }
}

impl ExploitIntel {
    /// Loads all the feeds. The EPSS scores of the previous day are used
    /// when those of the day are not published yet.
    pub fn collect(source: &dyn FeedSource, today: NaiveDate) -> Self {
        trace!("Running ExploitIntel::collect()");
        let kev = or_empty("KEV", load(source, "KEV", KEV_URL, parse_kev));

        let epss = match load(source, "EPSS", &epss_url(today), parse_epss) {
            Ok(scores) => Ok(scores),
            Err(e) => {
                debug!("No EPSS scores for {}: {}", today, e);
                match today.pred_opt() {
                    Some(yesterday) => load(source, "EPSS", &epss_url(yesterday), parse_epss),
                    None => Err(e),
                }
            }
        };
        let epss = or_empty("EPSS", epss);

        let exploitdb = or_empty(
            "ExploitDB",
            load(source, "ExploitDB", EXPLOITDB_URL, parse_exploitdb),
        );
        let metasploit = or_empty(
            "Metasploit",
            load(source, "Metasploit", METASPLOIT_URL, parse_metasploit),
        );
        let nuclei = or_empty("Nuclei", load(source, "Nuclei", NUCLEI_URL, parse_nuclei));

        info!(
            "Exploitation data: {} KEV, {} EPSS, {} ExploitDB, {} Metasploit, {} Nuclei",
            kev.len(),
            epss.len(),
            exploitdb.len(),
            metasploit.len(),
            nuclei.len()
        );
        ExploitIntel {
            kev,
            epss,
            exploitdb,
            metasploit,
            nuclei,
        }
    }

    /// The exploit maturity of a CVE.
    ///
    /// Known exploitation, a high EPSS score or a Metasploit module make it
    /// high, then a Nuclei template makes it functional, then an ExploitDB
    /// entry makes it a proof of concept.
    pub fn maturity(&self, cve: &str) -> ExploitMaturity {
        let epss = self.epss.get(cve).copied().unwrap_or(0.0);
        if self.kev.contains(cve) || epss >= EPSS_THRESHOLD || self.metasploit.contains(cve) {
            ExploitMaturity::High
        } else if self.nuclei.contains(cve) {
            ExploitMaturity::Functional
        } else if self.exploitdb.contains(cve) {
            ExploitMaturity::ProofOfConcept
        } else {
            ExploitMaturity::Unproven
        }
    }

    /// Fills the exploitation columns of a row and rescores it.
    pub fn enrich(&self, row: &mut SummaryRow) {
        let maturity = self.maturity(&row.cve);
        row.epss = self.epss.get(&row.cve).copied();
        row.cisa_kev = self.kev.contains(&row.cve);
        row.exploitdb = self.exploitdb.contains(&row.cve);
        row.metasploit = self.metasploit.contains(&row.cve);
        row.nuclei = self.nuclei.contains(&row.cve);
        row.cvss_bt_vector = format!("{}/{}", row.base_vector, maturity.metric(&row.cvss_version));
        match temporal_score(&row.cvss_version, row.base_score, maturity) {
            Some((score, severity)) => {
                row.cvss_bt_score = format!("{:.1}", score);
                row.cvss_bt_severity = severity.to_string();
            }
            None => {
                row.cvss_bt_score = "UNKNOWN".to_string();
                row.cvss_bt_severity = "UNKNOWN".to_string();
            }
        }
    }
}
