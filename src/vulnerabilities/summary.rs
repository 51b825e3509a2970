//! The CVSS summary of the records.
//!
//! For each CVE, the most recent CVSS version available is kept with its base
//! score, severity and vector. The rows are merged in a CSV file, one row per
//! CVE. When exploitation data is available, every row of the file is
//! rescored with it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use log::{debug, trace};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::Record;
use crate::vulnerabilities::cache_managers::replace_file;
use crate::vulnerabilities::enrichment::ExploitIntel;

/// The errors which can happen while updating the summary.
#[derive(Debug, Error)]
pub enum SummaryError {
    /// The CSV file couldn't be read or written.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The existing CSV file is malformed.
    #[error("invalid CSV: {0}")]
    Csv(#[from] csv::Error),
}

/// Represents one line of the summary.
///
/// The exploitation columns are empty until the row is enriched.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct SummaryRow {
    /// The CVE identifier.
    pub cve: String,
    /// The score once the exploit maturity is known, or UNKNOWN.
    #[serde(rename = "cvss-bt_score", default)]
    pub cvss_bt_score: String,
    /// Example: CRITICAL
    #[serde(rename = "cvss-bt_severity", default)]
    pub cvss_bt_severity: String,
    /// The base vector followed by the exploit maturity.
    /// Example: CVSS:3.1/AV:N/AC:L/PR:N/UI:N/S:U/C:H/I:H/A:H/E:H
    #[serde(rename = "cvss-bt_vector", default)]
    pub cvss_bt_vector: String,
    /// The CVSS version.
    /// Example: 3.1
    pub cvss_version: String,
    /// The base score.
    pub base_score: f64,
    /// The base severity.
    /// Example: CRITICAL
    pub base_severity: String,
    /// The vector string.
    pub base_vector: String,
    /// When the CVE was modified for the last time in the NVD.
    /// Example: 2023-11-07T02:13:33.290
    pub nvd_last_updated: String,
    /// The EPSS score, if the CVE has one.
    #[serde(default)]
    pub epss: Option<f64>,
    /// Whether the CVE is in the CISA Known Exploited Vulnerabilities.
    #[serde(default)]
    pub cisa_kev: bool,
    /// Whether ExploitDB has an exploit.
    #[serde(default)]
    pub exploitdb: bool,
    /// Whether Metasploit has a module.
    #[serde(default)]
    pub metasploit: bool,
    /// Whether Nuclei has a template.
    #[serde(default)]
    pub nuclei: bool,
}

/// The part of a CVE read to build the summary.
#[derive(Debug, Deserialize)]
struct CVE {
    id: String,
    #[serde(rename = "lastModified", default)]
    last_modified: String,
    #[serde(default)]
    metrics: CVEMetrics,
}

/// Represents the metrics as part of a CVE.
#[derive(Debug, Default, Deserialize)]
struct CVEMetrics {
    /// The data about CVSS 4.0
    #[serde(rename = "cvssMetricV40")]
    cvss_metric_v40: Option<Vec<CVSSMetric>>,
    /// The data about CVSS 3.1
    #[serde(rename = "cvssMetricV31")]
    cvss_metric_v31: Option<Vec<CVSSMetric>>,
    /// The data about CVSS 3.0
    #[serde(rename = "cvssMetricV30")]
    cvss_metric_v30: Option<Vec<CVSSMetric>>,
    /// The data about CVSS 2
    #[serde(rename = "cvssMetricV2")]
    cvss_metric_v2: Option<Vec<CVSSMetric>>,
}

impl CVEMetrics {
    /// The metrics of the most recent CVSS version, if any.
    fn highest(&self) -> Option<&[CVSSMetric]> {
        [
            &self.cvss_metric_v40,
            &self.cvss_metric_v31,
            &self.cvss_metric_v30,
            &self.cvss_metric_v2,
        ]
        .into_iter()
        .flatten()
        .map(|metrics| metrics.as_slice())
        .find(|metrics| !metrics.is_empty())
    }
}

/// Represents a CVSS metric.
#[derive(Debug, Deserialize)]
struct CVSSMetric {
    /// The type of metric.
    /// Example: Primary
    #[serde(rename = "type")]
    metric_type: String,
    /// CVSS 2 gives the severity here, not in the CVSS data.
    #[serde(rename = "baseSeverity")]
    base_severity: Option<String>,
    /// The CVSS data
    #[serde(rename = "cvssData")]
    cvss_data: CVSSData,
}

/// Represents the CVSS data, common to all versions.
#[derive(Debug, Deserialize)]
struct CVSSData {
    version: String,
    #[serde(rename = "vectorString")]
    vector_string: String,
    #[serde(rename = "baseScore")]
    base_score: f64,
    #[serde(rename = "baseSeverity")]
    base_severity: Option<String>,
}

impl SummaryRow {
    /// Builds the summary of a record.
    ///
    /// The primary metric of the most recent CVSS version is used, or the
    /// first secondary one. Returns None when the record has no CVSS data.
    pub fn from_record(record: &Record) -> Option<Self> {
        let cve: CVE = serde_json::from_value(record.value().get("cve")?.clone()).ok()?;
        let metrics = cve.metrics.highest()?;
        let metric = metrics
            .iter()
            .find(|m| m.metric_type == "Primary")
            .or_else(|| metrics.iter().find(|m| m.metric_type == "Secondary"))?;

        let data = &metric.cvss_data;
        let severity = if data.version == "2.0" {
            metric.base_severity.clone()
        } else {
            data.base_severity.clone()
        };

        Some(SummaryRow {
            cve: cve.id,
            cvss_version: data.version.clone(),
            base_score: data.base_score,
            base_severity: severity.unwrap_or_default(),
            base_vector: data.vector_string.clone(),
            nvd_last_updated: cve.last_modified,
            ..SummaryRow::default()
        })
    }
}

/// Merges the rows in the CSV file.
///
/// A row replaces the existing row of the same CVE, the other existing rows
/// are kept. With exploitation data, all the rows are rescored. The file is
/// sorted by CVE identifier.
/// Returns the number of rows in the file.
pub fn merge_into_csv(
    path: &Path,
    rows: &[SummaryRow],
    intel: Option<&ExploitIntel>,
) -> Result<usize, SummaryError> {
    trace!("Running merge_into_csv()");
    let mut merged: BTreeMap<String, SummaryRow> = BTreeMap::new();
    if path.exists() {
        let mut reader = csv::Reader::from_path(path)?;
        for row in reader.deserialize() {
            let row: SummaryRow = row?;
            merged.insert(row.cve.clone(), row);
        }
        debug!("{} rows read from {}", merged.len(), path.display());
    }
    for row in rows {
        merged.insert(row.cve.clone(), row.clone());
    }
    if let Some(intel) = intel {
        debug!("Rescoring {} rows", merged.len());
        merged.values_mut().for_each(|row| intel.enrich(row));
    }

    let mut writer = csv::Writer::from_writer(Vec::new());
    for row in merged.values() {
        writer.serialize(row)?;
    }
    let data = writer
        .into_inner()
        .map_err(|e| SummaryError::Io {
            path: path.to_path_buf(),
            source: e.into_error(),
        })?;
    replace_file(path, &data).map_err(|source| SummaryError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(merged.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;

    fn record_with_metrics(id: &str, metrics: serde_json::Value) -> Record {
        Record::new(json!({
            "cve": {
                "id": id,
                "lastModified": "2024-01-02T03:04:05.678",
                "metrics": metrics
            }
        }))
    }

    #[test]
    fn most_recent_version_is_preferred() {
        let record = record_with_metrics(
            "CVE-2024-0001",
            json!({
                "cvssMetricV31": [{
                    "source": "nvd@nist.gov",
                    "type": "Primary",
                    "cvssData": {
                        "version": "3.1",
                        "vectorString": "CVSS:3.1/AV:N/AC:L/PR:N/UI:N/S:U/C:H/I:H/A:H",
                        "baseScore": 9.8,
                        "baseSeverity": "CRITICAL"
                    }
                }],
                "cvssMetricV2": [{
                    "source": "nvd@nist.gov",
                    "type": "Primary",
                    "baseSeverity": "HIGH",
                    "cvssData": {
                        "version": "2.0",
                        "vectorString": "AV:N/AC:L/Au:N/C:P/I:P/A:P",
                        "baseScore": 7.5
                    }
                }]
            }),
        );
        let row = SummaryRow::from_record(&record).unwrap();
        assert_eq!("CVE-2024-0001", row.cve);
        assert_eq!("3.1", row.cvss_version);
        assert_eq!(9.8, row.base_score);
        assert_eq!("CRITICAL", row.base_severity);
        assert_eq!("2024-01-02T03:04:05.678", row.nvd_last_updated);
    }

    #[test]
    fn cvss2_severity_comes_from_the_metric() {
        let record = record_with_metrics(
            "CVE-2005-0001",
            json!({
                "cvssMetricV2": [{
                    "type": "Primary",
                    "baseSeverity": "MEDIUM",
                    "cvssData": {
                        "version": "2.0",
                        "vectorString": "AV:N/AC:M/Au:N/C:P/I:N/A:N",
                        "baseScore": 4.3
                    }
                }]
            }),
        );
        let row = SummaryRow::from_record(&record).unwrap();
        assert_eq!("2.0", row.cvss_version);
        assert_eq!("MEDIUM", row.base_severity);
    }

    #[test]
    fn secondary_metric_is_a_fallback() {
        let record = record_with_metrics(
            "CVE-2024-0002",
            json!({
                "cvssMetricV31": [{
                    "source": "security@example.com",
                    "type": "Secondary",
                    "cvssData": {
                        "version": "3.1",
                        "vectorString": "CVSS:3.1/AV:L/AC:L/PR:L/UI:N/S:U/C:H/I:N/A:N",
                        "baseScore": 5.5,
                        "baseSeverity": "MEDIUM"
                    }
                }]
            }),
        );
        let row = SummaryRow::from_record(&record).unwrap();
        assert_eq!(5.5, row.base_score);
    }

    #[test]
    fn records_without_cvss_are_skipped() {
        let record = record_with_metrics("CVE-2024-0003", json!({}));
        assert!(SummaryRow::from_record(&record).is_none());
        let record = Record::new(json!({"cve": {"id": "CVE-2024-0004"}}));
        assert!(SummaryRow::from_record(&record).is_none());
    }

    fn row(cve: &str, score: f64) -> SummaryRow {
        SummaryRow {
            cve: cve.to_string(),
            cvss_version: "3.1".to_string(),
            base_score: score,
            base_severity: "HIGH".to_string(),
            base_vector: "CVSS:3.1/AV:N/AC:L/PR:N/UI:R/S:U/C:H/I:H/A:N".to_string(),
            nvd_last_updated: "2024-01-02T03:04:05.678".to_string(),
            ..SummaryRow::default()
        }
    }

    #[test]
    fn new_rows_replace_existing_ones() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.csv");
        assert_eq!(
            2,
            merge_into_csv(
                &path,
                &[row("CVE-2023-0002", 7.1), row("CVE-2023-0001", 8.1)],
                None
            )
            .unwrap()
        );
        assert_eq!(
            3,
            merge_into_csv(
                &path,
                &[row("CVE-2023-0002", 8.8), row("CVE-2024-0001", 6.5)],
                None
            )
            .unwrap()
        );

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let rows: Vec<SummaryRow> = reader.deserialize().map(|r| r.unwrap()).collect();
        let ids: Vec<&str> = rows.iter().map(|r| r.cve.as_str()).collect();
        assert_eq!(vec!["CVE-2023-0001", "CVE-2023-0002", "CVE-2024-0001"], ids);
        assert_eq!(8.8, rows[1].base_score);

        let header = fs::read_to_string(&path).unwrap();
        assert!(header.starts_with(
            "cve,cvss-bt_score,cvss-bt_severity,cvss-bt_vector,cvss_version,base_score,\
             base_severity,base_vector,nvd_last_updated,epss,cisa_kev,exploitdb,metasploit,nuclei\n"
        ));
        assert_eq!(1, fs::read_dir(dir.path()).unwrap().count());
    }

    #[test]
    fn files_without_exploitation_columns_are_still_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.csv");
        fs::write(
            &path,
            "cve,cvss_version,base_score,base_severity,base_vector,nvd_last_updated\n\
             CVE-2020-0001,3.1,7.5,HIGH,CVSS:3.1/AV:N/AC:L/PR:N/UI:N/S:U/C:H/I:N/A:N,2020-01-01T00:00:00.000\n",
        )
        .unwrap();

        assert_eq!(2, merge_into_csv(&path, &[row("CVE-2024-0001", 6.5)], None).unwrap());

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let rows: Vec<SummaryRow> = reader.deserialize().map(|r| r.unwrap()).collect();
        assert_eq!("CVE-2020-0001", rows[0].cve);
        assert_eq!(7.5, rows[0].base_score);
        assert!(!rows[0].cisa_kev);
        assert_eq!(None, rows[0].epss);
    }

    #[test]
    fn every_row_is_rescored_with_the_exploitation_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.csv");
        merge_into_csv(&path, &[row("CVE-2023-0001", 8.1)], None).unwrap();

        let intel = ExploitIntel {
            kev: ["CVE-2023-0001".to_string()].into_iter().collect(),
            ..ExploitIntel::default()
        };
        merge_into_csv(&path, &[row("CVE-2024-0001", 8.1)], Some(&intel)).unwrap();

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let rows: Vec<SummaryRow> = reader.deserialize().map(|r| r.unwrap()).collect();
        assert_eq!("8.1", rows[0].cvss_bt_score);
        assert!(rows[0].cvss_bt_vector.ends_with("/E:H"));
        assert!(rows[0].cisa_kev);
        // 8.1 x 0.91 = 7.371, rounded up
        assert_eq!("7.4", rows[1].cvss_bt_score);
        assert_eq!("HIGH", rows[1].cvss_bt_severity);
        assert!(rows[1].cvss_bt_vector.ends_with("/E:U"));
    }
}
