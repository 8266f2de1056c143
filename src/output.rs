use std::io::{self, Write};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::archive::ArchiveFormat;
use crate::manager::{BatchReport, BatchStatus, ResourceState};
use crate::progress::{ProgressEvent, ProgressSink};

#[derive(Debug, Serialize)]
pub struct BatchSummary {
    pub status: BatchStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub resources: Vec<ResourceSummary>,
}

#[derive(Debug, Serialize)]
pub struct ResourceSummary {
    pub key: String,
    pub state: ResourceState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<ArchiveFormat>,
    pub fetched: bool,
    pub extracted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BatchSummary {
    pub fn from_report<K: Ord + ToString>(report: &BatchReport<K>) -> Self {
        let resources = report
            .items()
            .iter()
            .map(|(key, result)| match result {
                Ok(resolved) => ResourceSummary {
                    key: key.to_string(),
                    state: ResourceState::Done,
                    path: Some(resolved.path.clone()),
                    md5: Some(resolved.md5.clone()),
                    format: resolved.format,
                    fetched: resolved.fetched,
                    extracted: resolved.extracted,
                    error: None,
                },
                Err(err) => ResourceSummary {
                    key: key.to_string(),
                    state: ResourceState::Failed,
                    path: None,
                    md5: None,
                    format: None,
                    fetched: false,
                    extracted: false,
                    error: Some(err.to_string()),
                },
            })
            .collect();
        Self {
            status: report.status(),
            started_at: report.started_at(),
            finished_at: report.finished_at(),
            resources,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ChecksumResult {
    pub uri: String,
    pub md5: String,
}

#[derive(Debug, Serialize)]
pub struct DetectResult {
    pub path: PathBuf,
    pub format: Option<ArchiveFormat>,
}

#[derive(Debug, Serialize)]
pub struct ClearResult {
    pub root: String,
    pub removed: bool,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_batch<K: Ord + ToString>(report: &BatchReport<K>) -> io::Result<()> {
        Self::print_json(&BatchSummary::from_report(report))
    }

    pub fn print_checksum(result: &ChecksumResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_detect(result: &DetectResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_clear(result: &ClearResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

/// Quiet mode: the JSON report is the only output.
impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}
