use axum::{
    extract::{Query, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use mwt_core::{
    ApplicationClientMetadata, MetadataStore, SettingsUpdate, StoreError,
    LATEST_CLIENT_SETTINGS_KEY,
};
use std::{collections::BTreeMap, time::Instant};
use utoipa::IntoParams;

use crate::{
    error::{AdminError, Result},
    telemetry::{exception_best_effort, trace_best_effort, Telemetry},
    AppState,
};

/// Read-modify-write of the client record.
///
/// Fields absent from `update` keep their stored value; a missing record starts
/// from defaults. Concurrent updates race and the last upload wins.
pub async fn update_settings(
    store: &dyn MetadataStore,
    telemetry: &dyn Telemetry,
    update: &SettingsUpdate,
) -> Result<ApplicationClientMetadata> {
    trace_best_effort(telemetry, &format!("settings update requested: {update:?}"));

    let outcome = read_modify_write(store, update).await;
    if let Err(err) = &outcome {
        exception_best_effort(telemetry, err);
    }
    outcome
}

async fn read_modify_write(
    store: &dyn MetadataStore,
    update: &SettingsUpdate,
) -> Result<ApplicationClientMetadata> {
    let mut meta = match store.download(LATEST_CLIENT_SETTINGS_KEY).await {
        Ok(bytes) => ApplicationClientMetadata::from_slice(&bytes)?,
        Err(StoreError::NotFound(_)) => {
            tracing::info!("no client settings stored yet, starting from defaults");
            ApplicationClientMetadata::default()
        }
        Err(err) => return Err(err.into()),
    };
    update.apply_to(&mut meta);
    store.upload(LATEST_CLIENT_SETTINGS_KEY, meta.to_vec()?).await?;
    Ok(meta)
}

#[derive(Debug, serde::Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
#[allow(dead_code)]
struct UpdateSettingsParams {
    train_arguments: Option<String>,
    byom_train_arguments: Option<String>,
    initial_exploration_epsilon: Option<f32>,
    is_exploration_enabled: Option<bool>,
}

#[utoipa::path(
    post,
    path = "/automation/update-settings",
    params(UpdateSettingsParams),
    responses(
        (status = 204, description = "Settings stored"),
        (status = 401, description = "Missing or wrong auth header"),
        (status = 500, description = "Metadata store failure")
    ),
    tag = "automation"
)]
pub async fn update_settings_handler(
    State(state): State<AppState>,
    method: Method,
    Query(update): Query<SettingsUpdate>,
) -> Response {
    let started = Instant::now();
    let result = update_settings(state.store().as_ref(), state.telemetry().as_ref(), &update).await;
    let response = match result {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => err.into_response(),
    };
    state.record_http_observation(method, "/automation/update-settings", response.status(), started);
    response
}

#[utoipa::path(
    get,
    path = "/automation/app-settings",
    responses(
        (status = 200, description = "Non-secret server settings", body = BTreeMap<String, String>),
        (status = 401, description = "Missing or wrong auth header")
    ),
    tag = "automation"
)]
pub async fn app_settings_handler(State(state): State<AppState>) -> Json<BTreeMap<String, String>> {
    let started = Instant::now();
    let settings = state.config().app_settings();
    state.record_http_observation(Method::GET, "/automation/app-settings", StatusCode::OK, started);
    Json(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::TelemetryError;
    use async_trait::async_trait;
    use mwt_core::{store::MemoryMetadataStore, store::StoreResult};

    struct BrokenTelemetry;

    impl Telemetry for BrokenTelemetry {
        fn track_trace(&self, _message: &str) -> std::result::Result<(), TelemetryError> {
            Err(TelemetryError("collector offline".into()))
        }

        fn track_exception(&self, _error: &dyn std::error::Error) -> std::result::Result<(), TelemetryError> {
            Err(TelemetryError("collector offline".into()))
        }
    }

    struct ReadOnlyStore(MemoryMetadataStore);

    #[async_trait]
    impl MetadataStore for ReadOnlyStore {
        async fn download(&self, uri: &str) -> StoreResult<Vec<u8>> {
            self.0.download(uri).await
        }

        async fn exists(&self, key: &str) -> StoreResult<bool> {
            self.0.exists(key).await
        }

        async fn upload(&self, _key: &str, _bytes: Vec<u8>) -> StoreResult<()> {
            Err(StoreError::Backend("read-only".into()))
        }
    }

    #[tokio::test]
    async fn missing_record_starts_from_defaults() {
        let store = MemoryMetadataStore::new();
        let update = SettingsUpdate {
            train_arguments: Some("--cb_explore 4".into()),
            ..Default::default()
        };
        let meta = update_settings(&store, &BrokenTelemetry, &update).await.unwrap();
        assert_eq!(meta.train_arguments, "--cb_explore 4");

        let stored = store.get(LATEST_CLIENT_SETTINGS_KEY).unwrap();
        assert_eq!(ApplicationClientMetadata::from_slice(&stored).unwrap(), meta);
    }

    #[tokio::test]
    async fn storage_failures_surface_even_when_telemetry_is_down() {
        let store = ReadOnlyStore(MemoryMetadataStore::new());
        let update = SettingsUpdate {
            is_exploration_enabled: Some(true),
            ..Default::default()
        };
        let err = update_settings(&store, &BrokenTelemetry, &update)
            .await
            .unwrap_err();
        assert!(matches!(err, AdminError::Store(StoreError::Backend(_))));
    }
}
