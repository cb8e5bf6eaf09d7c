//! Client construction.
//!
//! Building a client resolves metadata, constructs the mapper from the model
//! stream and binds both; if either step fails no client is returned.
//! Custom mappers are plugged in through the `*_byom` constructors.

use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::{
    client::{DecisionServiceClient, RewardReporter},
    config::DecisionServiceConfiguration,
    diagnostics::{DiagnosticsSink, TracingDiagnostics},
    error::{DecisionServiceError, Result},
    events::{default_events_dir, EventSink, JsonlEventSink},
    mapper::{
        BinaryModelMapper, ContextMapper, JsonContextMapper, ModelStream, SerdeInspector,
        TypeInspector,
    },
    metadata::ApplicationClientMetadata,
    store::MetadataStore,
    sync::resolve_metadata,
};

/// Per-construction inputs besides configuration and model.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Metadata to reuse in offline mode.
    pub cached: Option<ApplicationClientMetadata>,
    pub cancel: CancellationToken,
}

impl BuildOptions {
    pub fn cached(metadata: ApplicationClientMetadata) -> Self {
        Self {
            cached: Some(metadata),
            ..Self::default()
        }
    }
}

/// Shared collaborators for building clients: metadata store, diagnostics
/// handle and event sink.
#[derive(Clone)]
pub struct DecisionService {
    store: Arc<dyn MetadataStore>,
    diagnostics: Arc<dyn DiagnosticsSink>,
    events: Arc<dyn EventSink>,
}

impl DecisionService {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        diagnostics: Arc<dyn DiagnosticsSink>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store,
            diagnostics,
            events,
        }
    }

    /// Store from `config.store`, tracing diagnostics and a JSONL sink under
    /// `config.events_dir`.
    pub fn from_config(config: &DecisionServiceConfiguration) -> Result<Self> {
        let store = config.store.build()?;
        let dir = config.events_dir.clone().unwrap_or_else(default_events_dir);
        Ok(Self::new(
            store,
            Arc::new(TracingDiagnostics::new()),
            Arc::new(JsonlEventSink::new(dir)),
        ))
    }

    /// Builds a client around a caller-supplied mapper constructor.
    pub async fn create_byom<C, M, F>(
        &self,
        config: &DecisionServiceConfiguration,
        model: ModelStream,
        type_inspector: Option<Arc<dyn TypeInspector<C>>>,
        options: BuildOptions,
        create: F,
    ) -> Result<DecisionServiceClient<C>>
    where
        C: 'static,
        M: ContextMapper<C> + 'static,
        F: FnOnce(ModelStream, Option<Arc<dyn TypeInspector<C>>>, bool) -> Result<M>,
    {
        let metadata = self.resolve(config, options).await?;
        let mapper = create(model, type_inspector, config.development_mode).map_err(as_mapper_error)?;
        DecisionServiceClient::new(metadata, Box::new(mapper), self.events.clone())
    }

    /// Client backed by the binary-model mapper. Without an inspector the
    /// context is reflected through its `Serialize` implementation.
    pub async fn create<C>(
        &self,
        config: &DecisionServiceConfiguration,
        model: ModelStream,
        type_inspector: Option<Arc<dyn TypeInspector<C>>>,
        options: BuildOptions,
    ) -> Result<DecisionServiceClient<C>>
    where
        C: Serialize + 'static,
    {
        self.create_byom(config, model, type_inspector, options, |stream, inspector, dev| {
            let inspector = inspector.unwrap_or_else(|| Arc::new(SerdeInspector));
            BinaryModelMapper::new(stream, inspector, dev)
        })
        .await
    }

    /// Builds a string-context client around a caller-supplied mapper constructor.
    pub async fn create_byom_json<M, F>(
        &self,
        config: &DecisionServiceConfiguration,
        model: ModelStream,
        options: BuildOptions,
        create: F,
    ) -> Result<DecisionServiceClient<String>>
    where
        M: ContextMapper<String> + 'static,
        F: FnOnce(ModelStream, bool) -> Result<M>,
    {
        let metadata = self.resolve(config, options).await?;
        let mapper = create(model, config.development_mode).map_err(as_mapper_error)?;
        DecisionServiceClient::new(metadata, Box::new(mapper), self.events.clone())
    }

    /// Client backed by the JSON-context mapper.
    pub async fn create_json(
        &self,
        config: &DecisionServiceConfiguration,
        model: ModelStream,
        options: BuildOptions,
    ) -> Result<DecisionServiceClient<String>> {
        self.create_byom_json(config, model, options, JsonContextMapper::new)
            .await
    }

    /// Resolves metadata only, for callers that report rewards without
    /// serving decisions.
    pub async fn create_reporter(
        &self,
        config: &DecisionServiceConfiguration,
        options: BuildOptions,
    ) -> Result<RewardReporter> {
        let metadata = self.resolve(config, options).await?;
        Ok(RewardReporter::new(metadata, self.events.clone()))
    }

    async fn resolve(
        &self,
        config: &DecisionServiceConfiguration,
        options: BuildOptions,
    ) -> Result<ApplicationClientMetadata> {
        resolve_metadata(
            config,
            options.cached,
            self.store.as_ref(),
            self.diagnostics.as_ref(),
            &options.cancel,
        )
        .await
    }
}

fn as_mapper_error(err: DecisionServiceError) -> DecisionServiceError {
    match err {
        err @ DecisionServiceError::MapperConstructionFailed(_) => err,
        other => DecisionServiceError::mapper(other),
    }
}
