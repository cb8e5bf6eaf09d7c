use axum::error_handling::HandleErrorLayer;
use axum::{
    body::Body,
    extract::State,
    http::{header, Method, Request, StatusCode},
    middleware::{from_fn_with_state, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use mwt_core::{MetadataStore, StoreSettings};
use prometheus_client::{
    encoding::{text::encode, EncodeLabel, EncodeLabelSet},
    metrics::{counter::Counter, family::Family, gauge::Gauge, histogram::Histogram},
    registry::Registry,
};
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;
use tower::{limit::ConcurrencyLimitLayer, timeout::TimeoutLayer, BoxError, ServiceBuilder};
use utoipa::OpenApi;

mod config;
pub mod error;
pub mod export;
pub mod settings;
pub mod telemetry;

pub use config::AdminConfig;
pub use error::AdminError;
pub use export::{InteractionStorage, JsonlInteractionStorage};
pub use settings::update_settings;
pub use telemetry::{Telemetry, TelemetryError, TracingTelemetry};

/// Header carrying the shared administrative secret.
pub const AUTH_HEADER: &str = "auth";

const LATENCY_BUCKETS: [f64; 8] = [0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0];
const SERVICE_NAME: &str = "mwt-admin";

#[derive(OpenApi)]
#[openapi(
    paths(
        health, ready,
        settings::update_settings_handler,
        settings::app_settings_handler,
        export::offline_handler
    ),
    tags(
        (name = "core", description = "Liveness and readiness"),
        (name = "automation", description = "Authenticated control-plane operations")
    )
)]
pub struct ApiDoc;

fn create_latency_histogram() -> Histogram {
    Histogram::new(LATENCY_BUCKETS)
}

#[derive(Clone)]
pub struct AppState(Arc<AppStateInner>);

struct AppStateInner {
    config: AdminConfig,
    store: Arc<dyn MetadataStore>,
    interactions: Arc<dyn InteractionStorage>,
    telemetry: Arc<dyn Telemetry>,
    http_requests: Family<HttpLabels, Counter<u64>>,
    http_latency: Family<HttpDurationLabels, Histogram>,
    auth_rejections: Counter<u64>,
    registry: Mutex<Registry>,
    ready: AtomicBool,
    shutdown: CancellationToken,
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct BuildInfoLabels {
    service: &'static str,
}

impl EncodeLabelSet for BuildInfoLabels {
    fn encode(
        &self,
        encoder: &mut prometheus_client::encoding::LabelSetEncoder<'_>,
    ) -> Result<(), fmt::Error> {
        ("service", self.service).encode(encoder.encode_label())?;
        Ok(())
    }
}

impl AppState {
    fn new(
        config: AdminConfig,
        store: Arc<dyn MetadataStore>,
        interactions: Arc<dyn InteractionStorage>,
        telemetry: Arc<dyn Telemetry>,
    ) -> Self {
        let mut registry = Registry::default();

        let build_info = Family::<BuildInfoLabels, Gauge>::default();
        build_info
            .get_or_create(&BuildInfoLabels {
                service: SERVICE_NAME,
            })
            .set(1);
        registry.register("build_info", "Build info per service", build_info);

        let http_requests: Family<HttpLabels, Counter<u64>> = Family::default();
        registry.register(
            "http_requests",
            "Total number of HTTP requests received",
            http_requests.clone(),
        );

        let http_latency: Family<HttpDurationLabels, Histogram> =
            Family::new_with_constructor(create_latency_histogram);
        registry.register(
            "http_request_duration_seconds",
            "HTTP request duration",
            http_latency.clone(),
        );

        let auth_rejections = Counter::<u64>::default();
        registry.register(
            "auth_rejections",
            "Automation requests rejected before any I/O",
            auth_rejections.clone(),
        );

        Self(Arc::new(AppStateInner {
            config,
            store,
            interactions,
            telemetry,
            http_requests,
            http_latency,
            auth_rejections,
            registry: Mutex::new(registry),
            ready: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }))
    }

    pub fn config(&self) -> &AdminConfig {
        &self.0.config
    }

    pub fn store(&self) -> Arc<dyn MetadataStore> {
        self.0.store.clone()
    }

    pub fn interactions(&self) -> Arc<dyn InteractionStorage> {
        self.0.interactions.clone()
    }

    pub fn telemetry(&self) -> Arc<dyn Telemetry> {
        self.0.telemetry.clone()
    }

    /// Cancelled on shutdown; running exports observe it through child tokens.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.0.shutdown.clone()
    }

    fn encode_metrics(&self) -> Result<String, std::fmt::Error> {
        let mut body = String::new();
        let registry = self.0.registry.lock().unwrap_or_else(|e| e.into_inner());
        encode(&mut body, &registry)?;
        Ok(body)
    }

    pub fn record_http_observation(
        &self,
        method: Method,
        path: &'static str,
        status: StatusCode,
        started: Instant,
    ) {
        let counter_labels = HttpLabels::new(method.clone(), path, status);
        let duration_labels = HttpDurationLabels::new(method, path);
        self.0.http_requests.get_or_create(&counter_labels).inc();
        self.0
            .http_latency
            .get_or_create(&duration_labels)
            .observe(started.elapsed().as_secs_f64());
    }

    pub fn set_ready(&self) {
        self.0.ready.store(true, Ordering::Release);
    }

    fn is_ready(&self) -> bool {
        self.0.ready.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct HttpDurationLabels {
    method: Method,
    path: &'static str,
}

impl HttpDurationLabels {
    fn new(method: Method, path: &'static str) -> Self {
        Self { method, path }
    }
}

impl EncodeLabelSet for HttpDurationLabels {
    fn encode(
        &self,
        encoder: &mut prometheus_client::encoding::LabelSetEncoder<'_>,
    ) -> Result<(), fmt::Error> {
        ("method", self.method.as_str()).encode(encoder.encode_label())?;
        ("path", self.path).encode(encoder.encode_label())?;
        Ok(())
    }
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct HttpLabels {
    method: Method,
    path: &'static str,
    status: StatusCode,
}

impl HttpLabels {
    fn new(method: Method, path: &'static str, status: StatusCode) -> Self {
        Self {
            method,
            path,
            status,
        }
    }
}

impl EncodeLabelSet for HttpLabels {
    fn encode(
        &self,
        encoder: &mut prometheus_client::encoding::LabelSetEncoder<'_>,
    ) -> Result<(), fmt::Error> {
        ("method", self.method.as_str()).encode(encoder.encode_label())?;
        ("path", self.path).encode(encoder.encode_label())?;
        ("status", self.status.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service healthy")),
    tag = "core"
)]
async fn health(State(state): State<AppState>) -> &'static str {
    let started = Instant::now();
    state.record_http_observation(Method::GET, "/health", StatusCode::OK, started);
    "ok"
}

#[utoipa::path(
    get,
    path = "/ready",
    responses(
        (status = 200, description = "Service ready"),
        (status = 503, description = "Service starting")
    ),
    tag = "core"
)]
async fn ready(State(state): State<AppState>) -> (StatusCode, &'static str) {
    let started = Instant::now();
    let (status, body) = if state.is_ready() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "starting")
    };
    state.record_http_observation(Method::GET, "/ready", status, started);
    (status, body)
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let started = Instant::now();
    let encoded_metrics = state.encode_metrics();
    let status = if encoded_metrics.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };

    state.record_http_observation(Method::GET, "/metrics", status, started);

    match encoded_metrics {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            "Internal server error".to_string(),
        )
            .into_response(),
    }
}

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

fn automation_path(path: &str) -> &'static str {
    match path {
        "/automation/update-settings" => "/automation/update-settings",
        "/automation/offline" => "/automation/offline",
        "/automation/app-settings" => "/automation/app-settings",
        _ => "/automation",
    }
}

/// Rejects automation calls whose `auth` header does not match the configured
/// password. An unconfigured password rejects everything.
async fn require_auth(State(state): State<AppState>, req: Request<Body>, next: Next) -> Response {
    let started = Instant::now();
    let presented = req
        .headers()
        .get(AUTH_HEADER)
        .and_then(|value| value.to_str().ok());

    let authorized = match (state.config().password.as_deref(), presented) {
        (None, _) => {
            tracing::warn!("automation call rejected: MWT_ADMIN_PASSWORD is not configured");
            false
        }
        (Some(_), None) => {
            tracing::warn!("automation call rejected: missing auth header");
            false
        }
        (Some(expected), Some(presented)) => {
            let ok = constant_time_eq(expected.as_bytes(), presented.as_bytes());
            if !ok {
                tracing::warn!("automation call rejected: auth header mismatch");
            }
            ok
        }
    };

    if !authorized {
        state.0.auth_rejections.inc();
        let path = automation_path(req.uri().path());
        state.record_http_observation(req.method().clone(), path, StatusCode::UNAUTHORIZED, started);
        return AdminError::Unauthorized.into_response();
    }
    next.run(req).await
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Builds the router with stores taken from `config`.
pub fn build_app(config: AdminConfig) -> anyhow::Result<(Router, AppState)> {
    let store = config
        .store
        .build()
        .map_err(|e| anyhow::anyhow!("failed to open metadata store: {e}"))?;
    if let StoreSettings::Sqlite { path } = &config.store {
        tracing::info!(path = ?path, "using SQLite metadata store");
    }
    let interactions: Arc<dyn InteractionStorage> =
        Arc::new(JsonlInteractionStorage::new(config.events_dir.clone()));
    Ok(build_app_with_state(
        config,
        store,
        interactions,
        Arc::new(TracingTelemetry),
    ))
}

pub fn build_app_with_state(
    config: AdminConfig,
    store: Arc<dyn MetadataStore>,
    interactions: Arc<dyn InteractionStorage>,
    telemetry: Arc<dyn Telemetry>,
) -> (Router, AppState) {
    let timeout_ms = config.timeout_ms;
    let concurrency = config.concurrency;
    let state = AppState::new(config, store, interactions, telemetry);

    let automation = automation_routes().route_layer(from_fn_with_state(state.clone(), require_auth));
    let app = Router::new().merge(core_routes()).merge(automation);

    let timeout_layer = if timeout_ms > 0 {
        Some(TimeoutLayer::new(Duration::from_millis(timeout_ms)))
    } else {
        tracing::info!("MWT_HTTP_TIMEOUT_MS=0 → request timeout disabled");
        None
    };
    let concurrency_layer = if concurrency > 0 {
        let c = std::cmp::min(concurrency, usize::MAX as u64) as usize;
        Some(ConcurrencyLimitLayer::new(c))
    } else {
        tracing::info!("MWT_HTTP_CONCURRENCY=0 → concurrency limit disabled");
        None
    };

    let request_guards = ServiceBuilder::new()
        .layer(HandleErrorLayer::new(|err: BoxError| async move {
            if err.is::<tower::timeout::error::Elapsed>() {
                (StatusCode::REQUEST_TIMEOUT, "request timed out")
            } else {
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "service temporarily unavailable",
                )
            }
        }))
        .option_layer(timeout_layer)
        .option_layer(concurrency_layer)
        // `option_layer` needs both branches to share an error type.
        .layer(tower::util::MapErrLayer::new(
            |e: std::convert::Infallible| -> BoxError { match e {} },
        ));

    // The readiness flag is set by the caller once the listener is bound.
    let app = app.with_state(state.clone()).layer(request_guards);
    (app, state)
}

fn core_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .route("/api-docs/openapi.json", get(openapi_json))
}

fn automation_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/automation/update-settings",
            get(settings::update_settings_handler).post(settings::update_settings_handler),
        )
        .route("/automation/offline", get(export::offline_handler))
        .route("/automation/app-settings", get(settings::app_settings_handler))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use mwt_core::store::MemoryMetadataStore;
    use tower::ServiceExt;

    fn demo_app(password: Option<&str>) -> (Router, AppState) {
        let temp_dir = std::env::temp_dir().join("mwt-admin-lib-tests");
        let config = AdminConfig {
            password: password.map(str::to_string),
            events_dir: temp_dir.clone(),
            ..AdminConfig::default()
        };
        build_app_with_state(
            config,
            Arc::new(MemoryMetadataStore::new()),
            Arc::new(JsonlInteractionStorage::new(temp_dir)),
            Arc::new(TracingTelemetry),
        )
    }

    #[tokio::test]
    async fn health_ok_and_metrics_increment() {
        let (app, _state) = demo_app(None);

        let res = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let res = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = res.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        let expected = r#"http_requests_total{method="GET",path="/health",status="200"} 1"#;
        assert!(text.contains(expected), "metrics missing health counter:\n{text}");
        assert!(text.contains(r#"build_info{service="mwt-admin"} 1"#));
    }

    #[tokio::test]
    async fn readiness_follows_the_flag() {
        let (app, state) = demo_app(None);
        let res = app
            .clone()
            .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);

        state.set_ready();
        let res = app
            .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unconfigured_password_rejects_everything() {
        let (app, _state) = demo_app(None);
        let res = app
            .clone()
            .oneshot(
                Request::get("/automation/app-settings")
                    .header(AUTH_HEADER, "")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        let res = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = res.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("auth_rejections_total 1"), "{text}");
    }

    #[tokio::test]
    async fn openapi_lists_automation_paths() {
        let (app, _state) = demo_app(None);
        let res = app
            .oneshot(
                Request::get("/api-docs/openapi.json")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body = res.into_body().collect().await.unwrap().to_bytes();
        let doc: serde_json::Value = serde_json::from_slice(&body).unwrap();
        for path in [
            "/automation/update-settings",
            "/automation/offline",
            "/automation/app-settings",
        ] {
            assert!(doc["paths"].get(path).is_some(), "missing {path}");
        }
    }

    #[test]
    fn constant_time_comparison() {
        assert!(constant_time_eq(b"s3cret", b"s3cret"));
        assert!(!constant_time_eq(b"s3cret", b"s3creT"));
        assert!(!constant_time_eq(b"s3cret", b"s3cre"));
    }
}
