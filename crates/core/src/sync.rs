//! Metadata synchronization: cached snapshot in offline mode, remote fetch otherwise.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::DecisionServiceConfiguration,
    diagnostics::DiagnosticsSink,
    error::{DecisionServiceError, Result},
    metadata::ApplicationClientMetadata,
    store::MetadataStore,
};

/// Resolves the metadata a client is bound to.
///
/// Offline mode with a cached record returns it untouched and never touches
/// the store. Every other combination performs exactly one download. Failures
/// are not retried. A cancelled fetch returns [`DecisionServiceError::Cancelled`]
/// before any diagnostics are attached.
pub async fn resolve_metadata(
    config: &DecisionServiceConfiguration,
    cached: Option<ApplicationClientMetadata>,
    store: &dyn MetadataStore,
    diagnostics: &dyn DiagnosticsSink,
    cancel: &CancellationToken,
) -> Result<ApplicationClientMetadata> {
    if let (true, Some(meta)) = (config.offline_mode, cached.as_ref()) {
        debug!(
            application_id = %meta.application_id,
            "offline mode: using cached metadata"
        );
        return Ok(meta.clone());
    }

    let uri = config.settings_uri.as_str();
    let bytes = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(DecisionServiceError::Cancelled),
        res = store.download(uri) => res.map_err(|err| {
            warn!(%uri, error = %err, "metadata download failed");
            DecisionServiceError::metadata_unavailable(uri, err)
        })?,
    };

    let meta = ApplicationClientMetadata::from_slice(&bytes).map_err(|err| {
        warn!(%uri, error = %err, "metadata record is not valid JSON");
        DecisionServiceError::metadata_unavailable(uri, err)
    })?;

    if cancel.is_cancelled() {
        return Err(DecisionServiceError::Cancelled);
    }

    if config.log_diagnostics {
        diagnostics.attach(&meta.app_insights_key);
    }

    info!(
        application_id = %meta.application_id,
        exploration = meta.is_exploration_enabled,
        "metadata resolved"
    );
    Ok(meta)
}
