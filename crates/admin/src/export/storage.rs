//! Read side of the JSONL event files written by `mwt_core::JsonlEventSink`.

use async_trait::async_trait;
use chrono::{DateTime, Months, NaiveDate, Utc};
use mwt_core::EventKind;
use std::{path::PathBuf, pin::Pin};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::{wrappers::LinesStream, Stream, StreamExt};

use super::ExportWindow;
use crate::error::{AdminError, Result};

/// Non-empty lines of one partition, read incrementally.
pub type LineStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Partitioned, line-oriented interaction storage.
///
/// Partitions are listed in chronological order. A partition may hold events
/// outside the requested window; callers filter by timestamp.
#[async_trait]
pub trait InteractionStorage: Send + Sync {
    async fn partitions(&self, kind: EventKind, window: &ExportWindow) -> Result<Vec<String>>;
    async fn read_partition(&self, kind: EventKind, partition: &str) -> Result<LineStream>;
}

#[derive(Debug, Clone)]
pub struct JsonlInteractionStorage {
    dir: PathBuf,
}

impl JsonlInteractionStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

/// First instant of the month named by a `YYYY-MM` partition.
fn partition_start(name: &str) -> Option<DateTime<Utc>> {
    let (year, month) = name.split_once('-')?;
    let date = NaiveDate::from_ymd_opt(year.parse().ok()?, month.parse().ok()?, 1)?;
    Some(date.and_hms_opt(0, 0, 0)?.and_utc())
}

fn month_overlaps(start: DateTime<Utc>, window: &ExportWindow) -> bool {
    let Some(end) = start.checked_add_months(Months::new(1)) else {
        return false;
    };
    start < window.end && end > window.start
}

#[async_trait]
impl InteractionStorage for JsonlInteractionStorage {
    async fn partitions(&self, kind: EventKind, window: &ExportWindow) -> Result<Vec<String>> {
        let dir = self.dir.join(kind.as_str());
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(AdminError::StorageFault(format!(
                    "failed to list {}: {err}",
                    dir.display()
                )))
            }
        };

        let mut names = Vec::new();
        loop {
            let entry = entries
                .next_entry()
                .await
                .map_err(|err| AdminError::StorageFault(err.to_string()))?;
            let Some(entry) = entry else { break };
            let file_name = entry.file_name();
            let Some(stem) = file_name.to_str().and_then(|n| n.strip_suffix(".jsonl")) else {
                continue;
            };
            match partition_start(stem) {
                Some(start) if month_overlaps(start, window) => names.push(stem.to_string()),
                Some(_) => {}
                None => tracing::debug!(file = %stem, "ignoring non-partition file"),
            }
        }
        names.sort();
        Ok(names)
    }

    async fn read_partition(&self, kind: EventKind, partition: &str) -> Result<LineStream> {
        let path = self
            .dir
            .join(kind.as_str())
            .join(format!("{partition}.jsonl"));
        let file = tokio::fs::File::open(&path).await.map_err(|err| {
            AdminError::StorageFault(format!("failed to open {}: {err}", path.display()))
        })?;
        let shown = path.display().to_string();
        let lines = LinesStream::new(BufReader::new(file).lines()).filter_map(move |line| match line {
            Ok(line) if line.trim().is_empty() => None,
            Ok(line) => Some(Ok(line)),
            Err(err) => Some(Err(AdminError::StorageFault(format!(
                "failed to read {shown}: {err}"
            )))),
        });
        Ok(Box::pin(lines))
    }
}
