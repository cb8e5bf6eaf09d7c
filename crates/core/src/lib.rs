//! Client side of the multi-world testing decision service.
//!
//! A [`DecisionServiceClient`] is bound to one application's metadata snapshot
//! and one policy mapper. It ranks actions for contexts and records
//! interaction and observation events that share an event id, so rewards can
//! be joined to decisions downstream.

pub mod client;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod events;
pub mod explore;
pub mod mapper;
pub mod metadata;
pub mod service;
pub mod store;
pub mod sync;
pub mod train_args;

pub use client::{Decision, DecisionServiceClient, RewardReporter};
pub use config::{load_config, DecisionServiceConfiguration, StoreSettings};
pub use diagnostics::{DiagnosticsSink, NoDiagnostics, TracingDiagnostics};
pub use error::{DecisionServiceError, Result};
pub use events::{Event, EventKind, EventSink, JsonlEventSink, MemoryEventSink};
pub use mapper::{ActionProbability, ContextMapper, ModelStream, TypeInspector};
pub use metadata::{
    ApplicationClientMetadata, ApplicationExtraMetadata, DecisionType, SettingsUpdate,
    TrainFrequency, EXTRA_SETTINGS_KEY, LATEST_CLIENT_SETTINGS_KEY,
};
pub use service::{BuildOptions, DecisionService};
pub use store::{MetadataStore, StoreError};
pub use sync::resolve_metadata;
