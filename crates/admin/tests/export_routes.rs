use std::{path::Path, sync::Arc};

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use chrono::{Duration, TimeZone, Utc};
use http_body_util::BodyExt;
use mwt_admin::{build_app_with_state, AdminConfig, JsonlInteractionStorage, TracingTelemetry, AUTH_HEADER};
use mwt_core::{
    events::{InteractionEvent, ObservationEvent},
    store::MemoryMetadataStore,
    ActionProbability, ApplicationClientMetadata, ApplicationExtraMetadata, Event, EventSink,
    JsonlEventSink, EXTRA_SETTINGS_KEY, LATEST_CLIENT_SETTINGS_KEY,
};
use serde_json::json;
use tower::ServiceExt;

const PASSWORD: &str = "export-secret";

fn app(events_dir: &Path, store: MemoryMetadataStore) -> Router {
    let config = AdminConfig {
        password: Some(PASSWORD.into()),
        events_dir: events_dir.to_path_buf(),
        ..AdminConfig::default()
    };
    let (app, state) = build_app_with_state(
        config,
        Arc::new(store),
        Arc::new(JsonlInteractionStorage::new(events_dir)),
        Arc::new(TracingTelemetry),
    );
    state.set_ready();
    app
}

fn settings_store(train_arguments: &str) -> MemoryMetadataStore {
    let meta = ApplicationClientMetadata {
        application_id: "news-ranker".into(),
        train_arguments: train_arguments.into(),
        ..Default::default()
    };
    let store = MemoryMetadataStore::with_blob(LATEST_CLIENT_SETTINGS_KEY, meta.to_vec().unwrap());
    let extra = ApplicationExtraMetadata {
        experimental_unit_duration: 600,
        ..Default::default()
    };
    store.insert(EXTRA_SETTINGS_KEY, serde_json::to_vec(&extra).unwrap());
    store
}

/// Three decisions on 2024-06-10; the first two get rewards, the second one too late.
fn seed_events(dir: &Path) {
    let sink = JsonlEventSink::new(dir);
    let base = Utc.with_ymd_and_hms(2024, 6, 10, 9, 0, 0).unwrap();
    for (i, action) in [2_u32, 1, 3].into_iter().enumerate() {
        sink.emit(
            "Endpoint=sb://interactions",
            &Event::Interaction(InteractionEvent {
                event_id: format!("evt-{i}"),
                application_id: "news-ranker".into(),
                timestamp: base + Duration::minutes(i as i64 * 30),
                context: json!({"device": "mobile"}),
                ranking: vec![ActionProbability {
                    action,
                    probability: 0.5,
                }],
                explored: true,
            }),
        )
        .unwrap();
    }
    for (event_id, delay_minutes, reward) in [("evt-0", 2, 1.0_f32), ("evt-1", 45, 1.0)] {
        let offset = if event_id == "evt-0" { 0 } else { 30 };
        sink.emit(
            "Endpoint=sb://observations",
            &Event::Observation(ObservationEvent {
                event_id: event_id.into(),
                application_id: "news-ranker".into(),
                timestamp: base + Duration::minutes(offset + delay_minutes),
                reward,
            }),
        )
        .unwrap();
    }
}

async fn get(app: Router, uri: &str) -> (StatusCode, Option<String>, String) {
    let response = app
        .oneshot(
            Request::get(uri)
                .header(AUTH_HEADER, PASSWORD)
                .body(Body::empty())
                .expect("failed to build request"),
        )
        .await
        .expect("request failed");
    let status = response.status();
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, content_type, String::from_utf8(body.to_vec()).unwrap())
}

#[tokio::test]
async fn unknown_format_is_rejected_without_output() {
    let temp_dir = tempfile::tempdir().unwrap();
    seed_events(temp_dir.path());
    let (status, _, body) = get(
        app(temp_dir.path(), MemoryMetadataStore::new()),
        "/automation/offline?startTimeInclusive=202406100000&endTimeExclusive=202406110000&dataFormat=bogus",
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(!body.contains("evt-"));
    assert!(body.contains("bogus"));
}

#[tokio::test]
async fn malformed_timestamp_is_a_bad_request() {
    let temp_dir = tempfile::tempdir().unwrap();
    let (status, _, body) = get(
        app(temp_dir.path(), MemoryMetadataStore::new()),
        "/automation/offline?startTimeInclusive=2024-06-10&endTimeExclusive=202406110000",
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("startTimeInclusive"));
}

#[tokio::test]
async fn empty_range_yields_empty_output() {
    let temp_dir = tempfile::tempdir().unwrap();
    seed_events(temp_dir.path());
    for format in ["raw", "training"] {
        let uri = format!(
            "/automation/offline?startTimeInclusive=202406101200&endTimeExclusive=202406101200&dataFormat={format}"
        );
        let (status, _, body) = get(app(temp_dir.path(), settings_store("--cb_explore 3")), &uri).await;
        assert_eq!(status, StatusCode::OK, "{format}");
        assert!(body.is_empty(), "{format}: {body}");
    }
}

#[tokio::test]
async fn raw_export_streams_stored_lines_without_destinations() {
    let temp_dir = tempfile::tempdir().unwrap();
    seed_events(temp_dir.path());
    let (status, content_type, body) = get(
        app(temp_dir.path(), MemoryMetadataStore::new()),
        "/automation/offline?startTimeInclusive=202406100900&endTimeExclusive=202406101000",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type.as_deref(), Some("application/x-ndjson"));

    let lines: Vec<&str> = body.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].contains("evt-0") && lines[1].contains("evt-1"));
    assert!(!body.contains("Endpoint="));
}

#[tokio::test]
async fn training_export_joins_rewards_within_the_unit() {
    let temp_dir = tempfile::tempdir().unwrap();
    seed_events(temp_dir.path());
    let (status, _, body) = get(
        app(temp_dir.path(), settings_store("--cb_explore 3 --epsilon 0.1")),
        "/automation/offline?startTimeInclusive=202406100000&endTimeExclusive=202406110000&dataFormat=vw",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        "2:-1:0.5 |f device=mobile\n|f device=mobile\n|f device=mobile\n"
    );
}

#[tokio::test]
async fn training_export_requires_client_settings() {
    let temp_dir = tempfile::tempdir().unwrap();
    seed_events(temp_dir.path());
    let (status, _, body) = get(
        app(temp_dir.path(), MemoryMetadataStore::new()),
        "/automation/offline?startTimeInclusive=202406100000&endTimeExclusive=202406110000&dataFormat=training",
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body.contains("settings"));
}
