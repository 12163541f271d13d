//! Outlier Gatekeeper: HTTP front end for online detection
//!
//! Features:
//! - SIMD-JSON parsing of incoming access log events
//! - Per-entity window cache with background TTL eviction
//! - Hot model reload without dropping in-flight requests
//! - On-demand batch feature recomputation
//! - Prometheus metrics

use axum::{
    Json, Router,
    body::Bytes,
    extract::{FromRequest, Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use once_cell::sync::Lazy;
use prometheus::{Counter, CounterVec, Encoder, Gauge, Histogram, Opts, TextEncoder};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use outlier_core::{
    Aggregator, BatchPipeline, DetectError, DetectionOutcome, DetectorConfig, Event,
    FeatureVector, ModelRegistry, ModelVerdict, Orchestrator, SqliteStore, SystemClock,
    WindowStats, WindowStore, models::JsonModelProvider,
};

// ============================================================================
// METRICS
// ============================================================================

pub static DETECTIONS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    let c = Counter::new("outlier_detections_total", "Total detection requests").unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static ANOMALIES_TOTAL: Lazy<Counter> = Lazy::new(|| {
    let c = Counter::new("outlier_anomalies_total", "Total events decided anomalous").unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static DETECT_FAILURES: Lazy<CounterVec> = Lazy::new(|| {
    let c = CounterVec::new(
        Opts::new("outlier_detect_failures_total", "Failed detections by kind"),
        &["kind"],
    )
    .unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static DETECT_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    let h = Histogram::with_opts(prometheus::HistogramOpts::new(
        "outlier_detect_duration_seconds",
        "Histogram of end-to-end detection latency",
    ))
    .unwrap();
    prometheus::register(Box::new(h.clone())).unwrap();
    h
});

pub static MODEL_RELOADS: Lazy<CounterVec> = Lazy::new(|| {
    let c = CounterVec::new(
        Opts::new("outlier_model_reloads_total", "Model reloads by result"),
        &["result"],
    )
    .unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static MODEL_GENERATION: Lazy<Gauge> = Lazy::new(|| {
    let g = Gauge::new("outlier_model_generation", "Active model set generation").unwrap();
    prometheus::register(Box::new(g.clone())).unwrap();
    g
});

pub static ACTIVE_WINDOWS: Lazy<Gauge> = Lazy::new(|| {
    let g = Gauge::new("outlier_active_windows", "Number of cached entity windows").unwrap();
    prometheus::register(Box::new(g.clone())).unwrap();
    g
});

pub static EVICTIONS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    let c = Counter::new("outlier_evictions_total", "Total idle windows evicted").unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

// ============================================================================
// DATA TYPES
// ============================================================================

#[derive(Debug, Serialize)]
struct FinalDecision {
    is_anomaly: bool,
    reason: String,
}

/// Response body of `POST /outlier/detect`
#[derive(Debug, Serialize)]
struct DetectResponse {
    status: &'static str,
    log_entry: Event,
    final_decision: FinalDecision,
    model_predictions: BTreeMap<String, ModelVerdict>,
    features_calculated: FeatureVector,
    generation: u64,
}

impl From<DetectionOutcome> for DetectResponse {
    fn from(outcome: DetectionOutcome) -> Self {
        let reason = outcome.reason();
        Self {
            status: "success",
            final_decision: FinalDecision {
                is_anomaly: outcome.decision.is_anomaly,
                reason,
            },
            generation: outcome.decision.generation,
            model_predictions: outcome.decision.per_model,
            features_calculated: outcome.features,
            log_entry: outcome.event,
        }
    }
}

struct ApiError(DetectError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            DetectError::NoModelsAvailable | DetectError::TimedOut(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            DetectError::Storage(_) | DetectError::Scoring(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({ "error": self.0.to_string(), "kind": self.0.kind() });
        (status, Json(body)).into_response()
    }
}

/// Application state
#[derive(Clone)]
struct AppState {
    orchestrator: Arc<Orchestrator>,
    batch: Arc<BatchPipeline>,
    model_ids: Arc<Vec<String>>,
}

// ============================================================================
// SIMD-JSON EXTRACTOR
// ============================================================================

struct SimdJson<T>(T);

impl<T, S> FromRequest<S> for SimdJson<T>
where
    T: for<'de> Deserialize<'de> + Send,
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let bytes = Bytes::from_request(req, state)
            .await
            .map_err(|e| e.into_response())?;
        let mut buf = bytes.to_vec();

        let val = simd_json::from_slice::<T>(&mut buf).map_err(|e| {
            let body = json!({ "error": format!("invalid event: {e}"), "kind": "invalid_input" });
            (StatusCode::UNPROCESSABLE_ENTITY, Json(body)).into_response()
        })?;

        Ok(SimdJson(val))
    }
}

// ============================================================================
// HANDLERS
// ============================================================================

async fn detect_handler(
    State(state): State<AppState>,
    SimdJson(event): SimdJson<Event>,
) -> Result<Json<DetectResponse>, ApiError> {
    DETECTIONS_TOTAL.inc();
    let timer = DETECT_LATENCY.start_timer();

    let result = state.orchestrator.detect(event).await;
    timer.observe_duration();

    match result {
        Ok(outcome) => {
            if outcome.decision.is_anomaly {
                ANOMALIES_TOTAL.inc();
                warn!(
                    entity = %outcome.event.entity_key,
                    endpoint = %outcome.event.endpoint,
                    votes_for = outcome.decision.votes_for,
                    votes_total = outcome.decision.votes_total,
                    "ANOMALY: {}",
                    outcome.reason()
                );
            }
            Ok(Json(outcome.into()))
        }
        Err(e) => {
            DETECT_FAILURES.with_label_values(&[e.kind()]).inc();
            Err(ApiError(e))
        }
    }
}

async fn reload_handler(State(state): State<AppState>) -> Response {
    let registry = state.orchestrator.models();
    match registry.reload(&state.model_ids).await {
        Ok(set) => {
            MODEL_RELOADS.with_label_values(&["success"]).inc();
            MODEL_GENERATION.set(set.generation() as f64);
            let body = json!({
                "status": "success",
                "generation": set.generation(),
                "models": set.model_ids(),
            });
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(failure) => {
            MODEL_RELOADS.with_label_values(&["failure"]).inc();
            let failures: Vec<String> = failure.failures.iter().map(|f| f.to_string()).collect();
            let body = json!({
                "error": failure.to_string(),
                "kind": "reload_failed",
                "failures": failures,
                "active_generation": registry.generation(),
            });
            (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
        }
    }
}

async fn generate_features_handler(State(state): State<AppState>) -> Response {
    match state.batch.recompute().await {
        Ok(report) => {
            let body = json!({
                "status": "success",
                "entities": report.entities,
                "vectors": report.vectors,
                "elapsed_ms": report.elapsed.as_millis() as u64,
            });
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(e) => {
            let body = json!({ "status": "error", "error": e.to_string(), "kind": "storage" });
            (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
        }
    }
}

async fn metrics_handler() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }
    (StatusCode::OK, String::from_utf8_lossy(&buffer).into_owned()).into_response()
}

async fn health_handler() -> &'static str {
    "OK"
}

#[derive(Serialize)]
struct StatsResponse {
    version: &'static str,
    status: &'static str,
    generation: u64,
    models: Vec<String>,
    rollback_generations: Vec<u64>,
    windows: WindowStats,
}

async fn stats_handler(State(state): State<AppState>) -> Json<StatsResponse> {
    let registry = state.orchestrator.models();
    let current = registry.current();
    Json(StatsResponse {
        version: env!("CARGO_PKG_VERSION"),
        status: if current.is_empty() { "not_ready" } else { "operational" },
        generation: current.generation(),
        models: current.model_ids(),
        rollback_generations: registry.history_generations(),
        windows: state.orchestrator.windows().stats(),
    })
}

// ============================================================================
// BACKGROUND EVICTION
// ============================================================================

fn spawn_eviction(windows: Arc<WindowStore>, every: std::time::Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let removed = windows.evict_stale(chrono::Utc::now());
            if removed > 0 {
                EVICTIONS_TOTAL.inc_by(removed as f64);
            }
            ACTIVE_WINDOWS.set(windows.len() as f64);
        }
    });
}

// ============================================================================
// MAIN
// ============================================================================

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Initializing Outlier Gatekeeper");

    // Initialize metrics
    let _ = &*DETECTIONS_TOTAL;
    let _ = &*ANOMALIES_TOTAL;
    let _ = &*DETECT_FAILURES;
    let _ = &*DETECT_LATENCY;
    let _ = &*MODEL_RELOADS;
    let _ = &*MODEL_GENERATION;
    let _ = &*ACTIVE_WINDOWS;
    let _ = &*EVICTIONS_TOTAL;

    let config = match DetectorConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            std::process::exit(2);
        }
    };
    info!(
        db = %config.db_path.display(),
        window_secs = config.window_length.num_seconds(),
        grace_secs = config.grace_period.num_seconds(),
        models = ?config.model_ids,
        max_entities = config.max_entities,
        "Configuration loaded."
    );

    let store = match SqliteStore::open(&config.db_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(error = %e, db = %config.db_path.display(), "Failed to open database");
            std::process::exit(1);
        }
    };

    let provider = Arc::new(JsonModelProvider::new(&config.model_dir));
    let registry = Arc::new(ModelRegistry::new(provider));
    match registry.reload(&config.model_ids).await {
        Ok(set) => {
            MODEL_RELOADS.with_label_values(&["success"]).inc();
            MODEL_GENERATION.set(set.generation() as f64);
        }
        Err(e) => {
            MODEL_RELOADS.with_label_values(&["failure"]).inc();
            warn!(error = %e, "Starting without models; detections fail until a reload succeeds");
        }
    }

    let windows = Arc::new(WindowStore::new(config.window_config()));
    spawn_eviction(Arc::clone(&windows), config.eviction_interval);

    let orchestrator = Orchestrator::new(store.clone(), windows, registry, Arc::new(SystemClock))
        .with_timeout(config.detect_timeout);
    let batch = BatchPipeline::new(
        store.clone(),
        store,
        Aggregator::new(config.window_length),
    );

    let state = AppState {
        orchestrator: Arc::new(orchestrator),
        batch: Arc::new(batch),
        model_ids: Arc::new(config.model_ids.clone()),
    };

    let app = Router::new()
        .route("/outlier/detect", post(detect_handler))
        .route("/outlier/reload_models", post(reload_handler))
        .route("/features/generate_features", post(generate_features_handler))
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .with_state(state);

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .expect("Failed to bind port");

    info!(addr = %config.listen_addr, "Gatekeeper listening.");
    info!("Endpoints:");
    info!("  POST /outlier/detect            - Score one access log event");
    info!("  POST /outlier/reload_models     - Reload the configured models");
    info!("  POST /features/generate_features - Recompute the feature table");
    info!("  GET  /metrics                   - Prometheus metrics");
    info!("  GET  /health                    - Health check");
    info!("  GET  /stats                     - Window and model stats");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to install CTRL+C handler");
            }
            info!("Shutting down...");
        })
        .await
        .expect("Server crash");

    info!("Goodbye.");
}
