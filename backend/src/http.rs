//! HTTP Ingest Edge (§4.E) — the ingest endpoint, the read API, and the
//! health/time-sync probes expected of an axum service in this stack.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use telemetry_types::{DetectorTag, Location, PageParams, PointInput};
use uuid::Uuid;

use crate::auth::check_ingest_auth;
use crate::error::{ClientError, PipelineError};
use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/ingest", post(ingest))
        .route("/api/devices", get(list_devices).post(create_device))
        .route("/api/devices/:id", get(get_device))
        .route("/api/metrics", get(list_metrics))
        .route("/api/anomalies", get(list_anomalies))
        .route("/api/health", get(health))
        .route("/sync", get(sync))
        .with_state(state)
}

// ─── /api/ingest ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct IngestRequest {
    #[serde(rename = "deviceId")]
    device_id: String,
    metrics: Vec<PointInput>,
}

#[derive(Debug, Serialize)]
struct IngestResponse {
    success: bool,
    #[serde(rename = "metricsInserted")]
    metrics_inserted: usize,
    #[serde(rename = "anomaliesDetected")]
    anomalies_detected: usize,
    #[serde(rename = "deviceId")]
    device_id: String,
}

async fn ingest(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<IngestRequest>,
) -> Result<(StatusCode, Json<IngestResponse>), PipelineError> {
    check_ingest_auth(state.config.ingest_api_key.as_deref(), &headers)?;

    if !state.rate_limiter.check(&body.device_id) {
        return Err(ClientError::RateLimited.into());
    }

    if body.metrics.is_empty() {
        return Err(ClientError::Schema("metrics must contain at least one point".to_string()).into());
    }

    let outcome = state.pipeline.submit_http_batch(&body.device_id, body.metrics).await?;

    Ok((
        StatusCode::CREATED,
        Json(IngestResponse {
            success: true,
            metrics_inserted: outcome.metrics_inserted,
            anomalies_detected: outcome.anomalies_detected,
            device_id: body.device_id,
        }),
    ))
}

// ─── /api/devices ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CreateDeviceRequest {
    id: Option<String>,
    name: String,
    location: Option<Location>,
}

async fn create_device(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateDeviceRequest>,
) -> Result<(StatusCode, Json<telemetry_types::Device>), PipelineError> {
    let id = body.id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let device = state.store.insert_device(&id, &body.name, body.location).await?;
    Ok((StatusCode::CREATED, Json(device)))
}

async fn list_devices(
    State(state): State<Arc<AppState>>,
    Query(page): Query<PageParams>,
) -> Result<Json<serde_json::Value>, PipelineError> {
    let (devices, pagination) = state.store.list_devices(page).await?;
    Ok(Json(json!({ "devices": devices, "count": pagination.total, "pagination": pagination })))
}

async fn get_device(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<telemetry_types::Device>, PipelineError> {
    match state.store.get_device(&id).await? {
        Some(device) => Ok(Json(device)),
        None => Err(ClientError::UnknownDevice(id).into()),
    }
}

// ─── /api/metrics ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct MetricsQuery {
    #[serde(rename = "deviceId")]
    device_id: Option<String>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    #[serde(flatten)]
    page: PageParams,
}

async fn list_metrics(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MetricsQuery>,
) -> Result<Json<serde_json::Value>, PipelineError> {
    let (points, pagination) = state
        .store
        .list_points(query.device_id.as_deref(), query.from, query.to, query.page)
        .await?;
    Ok(Json(json!({ "metrics": points, "pagination": pagination })))
}

// ─── /api/anomalies ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct AnomaliesQuery {
    #[serde(rename = "deviceId")]
    device_id: Option<String>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    #[serde(rename = "type")]
    detector: Option<String>,
    flagged: Option<bool>,
    #[serde(flatten)]
    page: PageParams,
}

async fn list_anomalies(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AnomaliesQuery>,
) -> Result<Json<serde_json::Value>, PipelineError> {
    let detector = match query.detector.as_deref() {
        Some(raw) => Some(
            DetectorTag::parse(raw)
                .ok_or_else(|| ClientError::Schema("unknown anomaly type filter".to_string()))?,
        ),
        None => None,
    };

    let (anomalies, pagination) = state
        .store
        .list_anomalies(query.device_id.as_deref(), query.from, query.to, detector, query.flagged, query.page)
        .await?;
    Ok(Json(json!({ "anomalies": anomalies, "pagination": pagination })))
}

// ─── /api/health & /sync ────────────────────────────────────────────────────

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let (connected, latency_ms) = match state.store.ping().await {
        Ok(latency) => (true, Some(latency.as_secs_f64() * 1000.0)),
        Err(_) => (false, None),
    };

    Json(json!({
        "status": if connected { "ok" } else { "degraded" },
        "timestamp": Utc::now(),
        "database": { "connected": connected, "stats": { "latencyMs": latency_ms } },
        "anomalyEngine": {
            "engine": format!("{:?}", state.config.anomaly_engine).to_lowercase(),
            "degraded": state.detectors.is_degraded(),
        },
        "activeDeviceWorkers": state.pipeline.active_worker_count(),
    }))
}

async fn sync() -> Json<serde_json::Value> {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis();
    Json(json!({ "serverTime": now }))
}
