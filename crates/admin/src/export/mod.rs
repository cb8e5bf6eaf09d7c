//! Offline export of recorded decisions.
//!
//! A request is validated completely (format, then window) before storage is
//! touched. Output is pushed through an [`ExportSink`], which is closed exactly
//! once whether the export succeeds or fails.

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use chrono::{DateTime, NaiveDateTime, Utc};
use mwt_core::{
    events::EventEnvelope, metadata::EXTRA_SETTINGS_KEY, ApplicationClientMetadata,
    ApplicationExtraMetadata, Event, EventKind, MetadataStore, StoreError,
    LATEST_CLIENT_SETTINGS_KEY,
};
use serde::{Deserialize, Serialize};
use std::{
    io,
    str::FromStr,
    sync::{Arc, Mutex},
    time::Instant,
};
use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use utoipa::IntoParams;

mod storage;
mod training;

pub use storage::{InteractionStorage, JsonlInteractionStorage, LineStream};
pub use training::{RewardIndex, TrainingEncoder};

use crate::{
    error::{AdminError, Result},
    telemetry::trace_best_effort,
    AppState,
};

const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M";
const EXPORT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DataFormat {
    /// Stored interaction lines, verbatim.
    Raw,
    /// Contextual-bandit training examples.
    Training,
}

impl DataFormat {
    fn content_type(&self) -> &'static str {
        match self {
            DataFormat::Raw => "application/x-ndjson",
            DataFormat::Training => "text/plain; charset=utf-8",
        }
    }
}

impl FromStr for DataFormat {
    type Err = AdminError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "raw" | "json" => Ok(DataFormat::Raw),
            "training" | "vw" => Ok(DataFormat::Training),
            _ => Err(AdminError::InvalidFormat(s.to_string())),
        }
    }
}

/// Half-open UTC interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl ExportWindow {
    pub fn parse(start_inclusive: &str, end_exclusive: &str) -> Result<Self> {
        Ok(Self {
            start: parse_timestamp("startTimeInclusive", start_inclusive)?,
            end: parse_timestamp("endTimeExclusive", end_exclusive)?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }

    fn extended_by(&self, extra: chrono::Duration) -> Self {
        Self {
            start: self.start,
            end: self.end + extra,
        }
    }
}

/// Parses a `yyyyMMddHHmm` timestamp as UTC.
pub fn parse_timestamp(field: &'static str, value: &str) -> Result<DateTime<Utc>> {
    let invalid = || AdminError::InvalidTimestamp {
        field,
        value: value.to_string(),
    };
    if value.len() != 12 || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT)
        .map(|ts| ts.and_utc())
        .map_err(|_| invalid())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportRequest {
    pub format: DataFormat,
    pub window: ExportWindow,
}

impl ExportRequest {
    /// The format is checked first so an unknown format never reaches storage.
    pub fn parse(start_inclusive: &str, end_exclusive: &str, format: &str) -> Result<Self> {
        let format = format.parse()?;
        let window = ExportWindow::parse(start_inclusive, end_exclusive)?;
        Ok(Self { format, window })
    }
}

/// Encoding chosen for an export, with whatever metadata it needs.
#[derive(Debug, Clone, PartialEq)]
pub enum ExportPlan {
    Raw,
    Training(TrainingEncoder),
}

/// Resolves the metadata a format depends on.
pub async fn prepare(store: &dyn MetadataStore, format: DataFormat) -> Result<ExportPlan> {
    match format {
        DataFormat::Raw => Ok(ExportPlan::Raw),
        DataFormat::Training => {
            let meta = match store.download(LATEST_CLIENT_SETTINGS_KEY).await {
                Ok(bytes) => ApplicationClientMetadata::from_slice(&bytes).map_err(|err| {
                    AdminError::MetadataUnavailable(format!("malformed client settings: {err}"))
                })?,
                Err(StoreError::NotFound(_)) => {
                    return Err(AdminError::MetadataUnavailable(
                        "application settings record not found".into(),
                    ))
                }
                Err(err) => return Err(err.into()),
            };
            let extra = match store.download(EXTRA_SETTINGS_KEY).await {
                Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|err| {
                    warn!(error = %err, "malformed extra settings, using defaults");
                    ApplicationExtraMetadata::default()
                }),
                Err(StoreError::NotFound(_)) => ApplicationExtraMetadata::default(),
                Err(err) => return Err(err.into()),
            };
            Ok(ExportPlan::Training(TrainingEncoder::new(&meta, &extra)))
        }
    }
}

/// Destination of export bytes.
#[async_trait]
pub trait ExportSink: Send {
    async fn write(&mut self, chunk: Bytes) -> Result<()>;
    /// Signals that the export stopped early. Output written so far is incomplete.
    async fn fail(&mut self, error: &AdminError);
    async fn close(self);
}

/// Feeds an HTTP response body.
///
/// A failure is forwarded as a stream error so the client sees an aborted
/// body instead of a silently truncated one.
pub struct ChannelSink {
    tx: mpsc::Sender<std::result::Result<Bytes, io::Error>>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<std::result::Result<Bytes, io::Error>>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl ExportSink for ChannelSink {
    async fn write(&mut self, chunk: Bytes) -> Result<()> {
        // A closed channel means the client went away.
        self.tx.send(Ok(chunk)).await.map_err(|_| AdminError::Cancelled)
    }

    async fn fail(&mut self, error: &AdminError) {
        let _ = self.tx.send(Err(io::Error::other(error.to_string()))).await;
    }

    async fn close(self) {}
}

#[derive(Debug, Default)]
struct Buffered {
    bytes: Vec<u8>,
    error: Option<String>,
    closes: usize,
}

/// In-memory sink. Clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct BufferSink {
    inner: Arc<Mutex<Buffered>>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut Buffered) -> T) -> T {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.with(|b| b.bytes.clone())
    }

    pub fn error(&self) -> Option<String> {
        self.with(|b| b.error.clone())
    }

    pub fn close_count(&self) -> usize {
        self.with(|b| b.closes)
    }
}

#[async_trait]
impl ExportSink for BufferSink {
    async fn write(&mut self, chunk: Bytes) -> Result<()> {
        self.with(|b| b.bytes.extend_from_slice(&chunk));
        Ok(())
    }

    async fn fail(&mut self, error: &AdminError) {
        let message = error.to_string();
        self.with(|b| b.error = Some(message));
    }

    async fn close(self) {
        self.with(|b| b.closes += 1);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportSummary {
    pub records: usize,
    /// Lines that were malformed or not usable in the requested format.
    pub skipped: usize,
}

/// Streams the interactions in `window` through `plan` into `sink`.
pub async fn stream_export<S: ExportSink>(
    storage: &dyn InteractionStorage,
    plan: &ExportPlan,
    window: &ExportWindow,
    mut sink: S,
    cancel: &CancellationToken,
) -> Result<ExportSummary> {
    let outcome = write_records(storage, plan, window, &mut sink, cancel).await;
    if let Err(err) = &outcome {
        sink.fail(err).await;
    }
    sink.close().await;
    outcome
}

/// Resolves metadata and streams the export into `sink`.
pub async fn export<S: ExportSink>(
    storage: &dyn InteractionStorage,
    store: &dyn MetadataStore,
    request: &ExportRequest,
    mut sink: S,
    cancel: &CancellationToken,
) -> Result<ExportSummary> {
    match prepare(store, request.format).await {
        Ok(plan) => stream_export(storage, &plan, &request.window, sink, cancel).await,
        Err(err) => {
            sink.fail(&err).await;
            sink.close().await;
            Err(err)
        }
    }
}

fn decode(line: &str) -> Option<Event> {
    let parsed = serde_json::from_str::<EventEnvelope>(line).and_then(EventEnvelope::into_event);
    match parsed {
        Ok(event) => Some(event),
        Err(err) => {
            warn!(error = %err, "skipping malformed event line");
            None
        }
    }
}

async fn write_records<S: ExportSink>(
    storage: &dyn InteractionStorage,
    plan: &ExportPlan,
    window: &ExportWindow,
    sink: &mut S,
    cancel: &CancellationToken,
) -> Result<ExportSummary> {
    let mut summary = ExportSummary::default();
    if window.is_empty() {
        return Ok(summary);
    }

    let rewards = match plan {
        ExportPlan::Raw => RewardIndex::default(),
        ExportPlan::Training(encoder) => {
            let observed = window.extended_by(encoder.experimental_unit());
            let mut rewards = RewardIndex::default();
            // Only the rewards themselves are kept, never whole partitions.
            for partition in storage.partitions(EventKind::Observation, &observed).await? {
                let mut lines = storage
                    .read_partition(EventKind::Observation, &partition)
                    .await?;
                while let Some(line) = lines.next().await {
                    if cancel.is_cancelled() {
                        return Err(AdminError::Cancelled);
                    }
                    match decode(&line?) {
                        Some(Event::Observation(obs)) if observed.contains(obs.timestamp) => {
                            rewards.insert(&obs)
                        }
                        Some(_) => {}
                        None => summary.skipped += 1,
                    }
                }
            }
            rewards
        }
    };

    for partition in storage.partitions(EventKind::Interaction, window).await? {
        if cancel.is_cancelled() {
            return Err(AdminError::Cancelled);
        }
        let mut lines = storage
            .read_partition(EventKind::Interaction, &partition)
            .await?;
        while let Some(line) = lines.next().await {
            if cancel.is_cancelled() {
                return Err(AdminError::Cancelled);
            }
            let line = line?;
            let Some(Event::Interaction(interaction)) = decode(&line) else {
                summary.skipped += 1;
                continue;
            };
            if !window.contains(interaction.timestamp) {
                continue;
            }
            let chunk = match plan {
                ExportPlan::Raw => Some(format!("{line}\n")),
                ExportPlan::Training(encoder) => {
                    let reward = rewards.reward_for(&interaction, encoder.experimental_unit());
                    encoder.encode(&interaction, reward)
                }
            };
            match chunk {
                Some(chunk) => {
                    sink.write(Bytes::from(chunk)).await?;
                    summary.records += 1;
                }
                None => summary.skipped += 1,
            }
        }
    }
    Ok(summary)
}

fn default_data_format() -> String {
    "raw".to_string()
}

#[derive(Debug, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct OfflineQuery {
    /// `yyyyMMddHHmm`, UTC.
    pub start_time_inclusive: String,
    /// `yyyyMMddHHmm`, UTC.
    pub end_time_exclusive: String,
    /// `raw` (alias `json`) or `training` (alias `vw`).
    #[serde(default = "default_data_format")]
    pub data_format: String,
}

#[utoipa::path(
    get,
    path = "/automation/offline",
    params(OfflineQuery),
    responses(
        (status = 200, description = "Export stream"),
        (status = 400, description = "Unknown format or malformed timestamp"),
        (status = 401, description = "Missing or wrong auth header"),
        (status = 500, description = "Settings or storage unavailable")
    ),
    tag = "automation"
)]
pub async fn offline_handler(
    State(state): State<AppState>,
    Query(query): Query<OfflineQuery>,
) -> Response {
    let started = Instant::now();
    let prepared = async {
        let request = ExportRequest::parse(
            &query.start_time_inclusive,
            &query.end_time_exclusive,
            &query.data_format,
        )?;
        let plan = prepare(state.store().as_ref(), request.format).await?;
        Ok::<_, AdminError>((request, plan))
    }
    .await;

    let (request, plan) = match prepared {
        Ok(prepared) => prepared,
        Err(err) => {
            state.record_http_observation(Method::GET, "/automation/offline", err.status(), started);
            return err.into_response();
        }
    };

    trace_best_effort(
        state.telemetry().as_ref(),
        &format!(
            "offline export {:?} [{}, {})",
            request.format, query.start_time_inclusive, query.end_time_exclusive
        ),
    );

    let (tx, rx) = mpsc::channel(EXPORT_CHANNEL_CAPACITY);
    let storage = state.interactions();
    let cancel = state.shutdown_token().child_token();
    tokio::spawn(async move {
        let sink = ChannelSink::new(tx);
        match stream_export(storage.as_ref(), &plan, &request.window, sink, &cancel).await {
            Ok(summary) => info!(
                records = summary.records,
                skipped = summary.skipped,
                format = ?request.format,
                "offline export finished"
            ),
            Err(AdminError::Cancelled) => info!("offline export cancelled"),
            Err(err) => warn!(error = %err, "offline export aborted"),
        }
    });

    state.record_http_observation(Method::GET, "/automation/offline", StatusCode::OK, started);
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, request.format.content_type())],
        Body::from_stream(ReceiverStream::new(rx)),
    )
        .into_response()
}
