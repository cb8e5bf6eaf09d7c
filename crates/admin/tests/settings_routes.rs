use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use mwt_admin::{
    build_app_with_state, AdminConfig, JsonlInteractionStorage, Telemetry, TelemetryError,
    AUTH_HEADER,
};
use mwt_core::{
    store::{MemoryMetadataStore, StoreResult},
    ApplicationClientMetadata, MetadataStore, LATEST_CLIENT_SETTINGS_KEY,
};
use serde_json::Value;
use tower::ServiceExt;

const PASSWORD: &str = "correct horse";

/// Counts every store call so tests can assert that nothing was touched.
#[derive(Default)]
struct CountingStore {
    inner: MemoryMetadataStore,
    calls: AtomicUsize,
}

impl CountingStore {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetadataStore for CountingStore {
    async fn download(&self, uri: &str) -> StoreResult<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.download(uri).await
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.exists(key).await
    }

    async fn upload(&self, key: &str, bytes: Vec<u8>) -> StoreResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.upload(key, bytes).await
    }
}

struct OfflineTelemetry;

impl Telemetry for OfflineTelemetry {
    fn track_trace(&self, _message: &str) -> Result<(), TelemetryError> {
        Err(TelemetryError("no collector".into()))
    }

    fn track_exception(&self, _error: &dyn std::error::Error) -> Result<(), TelemetryError> {
        Err(TelemetryError("no collector".into()))
    }
}

fn app_with(store: Arc<CountingStore>, password: Option<&str>) -> Router {
    let temp_dir = tempfile::tempdir().expect("failed to create temp dir");
    let config = AdminConfig {
        password: password.map(str::to_string),
        events_dir: temp_dir.path().to_path_buf(),
        ..AdminConfig::default()
    };
    let (app, _state) = build_app_with_state(
        config,
        store,
        Arc::new(JsonlInteractionStorage::new(temp_dir.path())),
        Arc::new(OfflineTelemetry),
    );
    app
}

fn seeded_store() -> Arc<CountingStore> {
    let store = Arc::new(CountingStore::default());
    let meta = ApplicationClientMetadata {
        application_id: "news-ranker".into(),
        train_arguments: "--cb_explore 4 --epsilon 0.1".into(),
        byom_train_arguments: Some(r#"{"numActions":4}"#.into()),
        initial_exploration_epsilon: 0.1,
        event_hub_interaction_connection_string: "interactions".into(),
        ..Default::default()
    };
    store
        .inner
        .insert(LATEST_CLIENT_SETTINGS_KEY, meta.to_vec().unwrap());
    store
}

fn stored(store: &CountingStore) -> ApplicationClientMetadata {
    ApplicationClientMetadata::from_slice(&store.inner.get(LATEST_CLIENT_SETTINGS_KEY).unwrap())
        .unwrap()
}

#[tokio::test]
async fn exploration_toggle_leaves_other_fields_intact() {
    let store = seeded_store();
    let before = stored(&store);
    let app = app_with(store.clone(), Some(PASSWORD));

    let response = app
        .oneshot(
            Request::post("/automation/update-settings?isExplorationEnabled=true")
                .header(AUTH_HEADER, PASSWORD)
                .body(Body::empty())
                .expect("failed to build request"),
        )
        .await
        .expect("request failed");
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let after = stored(&store);
    assert!(after.is_exploration_enabled);
    assert_eq!(
        ApplicationClientMetadata {
            is_exploration_enabled: false,
            ..after
        },
        before
    );
}

#[tokio::test]
async fn get_updates_every_supplied_field() {
    let store = seeded_store();
    let app = app_with(store.clone(), Some(PASSWORD));

    let response = app
        .oneshot(
            Request::get(
                "/automation/update-settings?trainArguments=--cb_explore%206&byomtrainArguments=%7B%7D&initialExplorationEpsilon=0.3",
            )
            .header(AUTH_HEADER, PASSWORD)
            .body(Body::empty())
            .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let after = stored(&store);
    assert_eq!(after.train_arguments, "--cb_explore 6");
    assert_eq!(after.byom_train_arguments.as_deref(), Some("{}"));
    assert!((after.initial_exploration_epsilon - 0.3).abs() < 1e-6);
    assert_eq!(after.training_number_of_actions(), None);
    assert_eq!(after.application_id, "news-ranker");
}

#[tokio::test]
async fn wrong_or_missing_secret_is_rejected_before_any_io() {
    let store = seeded_store();
    let before = stored(&store);

    for (password, header) in [
        (Some(PASSWORD), Some("wrong")),
        (Some(PASSWORD), None),
        (None, Some(PASSWORD)),
    ] {
        let app = app_with(store.clone(), password);
        let mut request = Request::post("/automation/update-settings?isExplorationEnabled=true");
        if let Some(header) = header {
            request = request.header(AUTH_HEADER, header);
        }
        let response = app
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    assert_eq!(store.calls(), 0);
    assert_eq!(stored(&store), before);
}

#[tokio::test]
async fn app_settings_never_expose_the_secret() {
    let app = app_with(seeded_store(), Some(PASSWORD));
    let response = app
        .oneshot(
            Request::get("/automation/app-settings")
                .header(AUTH_HEADER, PASSWORD)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert!(!String::from_utf8_lossy(&body).contains(PASSWORD));
    let settings: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(settings["auth_configured"], "true");
}
