//! Interaction and observation events.
//!
//! A decision emits an [`InteractionEvent`], a reward an [`ObservationEvent`];
//! both carry the caller's event id so they can be joined downstream. The JSONL
//! sink writes one envelope per line to `<dir>/<kind>/YYYY-MM.jsonl`.

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    fs::{create_dir_all, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::Mutex,
};
use tracing::warn;

use crate::{
    error::{DecisionServiceError, Result},
    mapper::ActionProbability,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Interaction,
    Observation,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Interaction => "interaction",
            EventKind::Observation => "observation",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionEvent {
    pub event_id: String,
    pub application_id: String,
    pub timestamp: DateTime<Utc>,
    pub context: Value,
    /// Chosen action first, carrying the probability it was chosen with.
    pub ranking: Vec<ActionProbability>,
    /// `false` when exploration was disabled and the ranking was collapsed.
    pub explored: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationEvent {
    pub event_id: String,
    pub application_id: String,
    pub timestamp: DateTime<Utc>,
    pub reward: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Interaction(InteractionEvent),
    Observation(ObservationEvent),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Interaction(_) => EventKind::Interaction,
            Event::Observation(_) => EventKind::Observation,
        }
    }

    pub fn event_id(&self) -> &str {
        match self {
            Event::Interaction(e) => &e.event_id,
            Event::Observation(e) => &e.event_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Event::Interaction(e) => e.timestamp,
            Event::Observation(e) => e.timestamp,
        }
    }

    fn payload(&self) -> serde_json::Result<Value> {
        match self {
            Event::Interaction(e) => serde_json::to_value(e),
            Event::Observation(e) => serde_json::to_value(e),
        }
    }
}

/// One line of a JSONL event file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: String,
    pub node_id: String,
    /// Event timestamp in epoch milliseconds.
    pub ts: i64,
    pub kind: EventKind,
    pub payload: Value,
}

impl EventEnvelope {
    pub fn into_event(self) -> serde_json::Result<Event> {
        Ok(match self.kind {
            EventKind::Interaction => Event::Interaction(serde_json::from_value(self.payload)?),
            EventKind::Observation => Event::Observation(serde_json::from_value(self.payload)?),
        })
    }
}

/// Destination for decision and reward events.
///
/// `destination` is the connection string the bound metadata names for the
/// event's kind. Emission is synchronous; decisions never suspend.
pub trait EventSink: Send + Sync {
    fn emit(&self, destination: &str, event: &Event) -> Result<()>;
}

/// File name of the monthly partition holding events at `ts`.
pub fn partition_file_name(ts: DateTime<Utc>) -> String {
    format!("{:04}-{:02}.jsonl", ts.year(), ts.month())
}

pub fn default_events_dir() -> PathBuf {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    let base: PathBuf = std::env::var("MWT_DATA").map_or_else(|_| home.join(".mwt"), PathBuf::from);
    base.join("events")
}

/// Appends event envelopes to monthly JSONL files, one directory per kind.
///
/// Connection strings are not persisted.
#[derive(Debug)]
pub struct JsonlEventSink {
    dir: PathBuf,
    node_id: String,
    write_lock: Mutex<()>,
}

impl JsonlEventSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let node_id = hostname::get()
            .map(|v| v.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            dir: dir.into(),
            node_id,
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl EventSink for JsonlEventSink {
    fn emit(&self, _destination: &str, event: &Event) -> Result<()> {
        let dir = self.dir.join(event.kind().as_str());
        create_dir_all(&dir).map_err(|err| {
            warn!(error = %err, "failed to create event directory");
            DecisionServiceError::EventSink(err.to_string())
        })?;

        let ts = event.timestamp();
        let file_path = dir.join(partition_file_name(ts));
        let envelope = EventEnvelope {
            id: ulid::Ulid::new().to_string(),
            node_id: self.node_id.clone(),
            ts: ts.timestamp_millis(),
            kind: event.kind(),
            payload: event.payload()?,
        };
        let line = serde_json::to_string(&envelope).map_err(|err| {
            warn!(error = %err, "failed to serialize event payload");
            DecisionServiceError::Json(err)
        })?;

        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        append_line(&file_path, &line).map_err(|err| {
            warn!(
                path = %file_path.display(),
                error = %err,
                "failed to write event line"
            );
            DecisionServiceError::EventSink(err.to_string())
        })
    }
}

fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")?;
    Ok(())
}

/// Keeps events in memory, tagged with their destination.
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<(String, Event)>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(String, Event)> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl EventSink for MemoryEventSink {
    fn emit(&self, destination: &str, event: &Event) -> Result<()> {
        self.events
            .lock()
            .map_err(|_| DecisionServiceError::EventSink("event buffer poisoned".into()))?
            .push((destination.to_string(), event.clone()));
        Ok(())
    }
}
