use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::clock;
use crate::model::{Event, Sample, Severity};
use crate::pipeline::{IngestError, Pipeline};
use crate::registry::TargetConfig;

/// HTTP surface: telemetry ingestion, configuration push and diagnostics.
pub struct Server {
    addr: String,
    pipeline: Arc<Pipeline>,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    pub fn new(addr: &str, pipeline: Arc<Pipeline>) -> Self {
        Self {
            addr: addr.to_string(),
            pipeline,
            shutdown: parking_lot::Mutex::new(None),
            task: parking_lot::Mutex::new(None),
        }
    }

    /// Binds the listener and serves in the background. Returns the bound
    /// address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let addr = if self.addr.is_empty() {
            ":8242"
        } else {
            self.addr.as_str()
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app = router(Arc::clone(&self.pipeline));

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        let handle = tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "ingestion server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "ingestion server error");
            }
        });
        *self.task.lock() = Some(handle);

        Ok(local_addr)
    }

    /// Gracefully shuts down the server and waits until in-flight requests
    /// have finished, so nothing is appended after this returns.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            handle.await.context("joining ingestion server task")?;
        }

        Ok(())
    }
}

/// Builds the router over a shared pipeline.
pub fn router(pipeline: Arc<Pipeline>) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/ceilometer", get(versions_handler))
        .route("/ceilometer/v1/samples/{target}", post(samples_handler))
        .route("/ceilometer/v1/events/{target}", post(events_handler))
        .route(
            "/config/{target}",
            put(put_config_handler).delete(delete_config_handler),
        )
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .route("/status", get(status_handler))
        .with_state(pipeline)
}

// --- Rejections ---

/// A refused ingestion request.
#[derive(Debug)]
struct Rejection {
    status: StatusCode,
    message: String,
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

fn reject(pipeline: &Pipeline, status: StatusCode, reason: &str, message: String) -> Rejection {
    pipeline
        .health()
        .ingest_rejected
        .with_label_values(&[reason])
        .inc();
    tracing::debug!(status = %status, reason, message = %message, "rejected request");
    Rejection { status, message }
}

fn ingest_rejection(pipeline: &Pipeline, err: IngestError) -> Rejection {
    match err {
        IngestError::UnknownTarget(target) => reject(
            pipeline,
            StatusCode::NOT_FOUND,
            "unknown_target",
            format!("Unrecognized device '{target}'"),
        ),
        err @ IngestError::MalformedSample { .. } => reject(
            pipeline,
            StatusCode::UNPROCESSABLE_ENTITY,
            "malformed",
            format!("Error processing data: {err}"),
        ),
        IngestError::Pipeline(e) => reject(
            pipeline,
            StatusCode::UNPROCESSABLE_ENTITY,
            "malformed",
            e.to_string(),
        ),
    }
}

/// Checks target, content type and JSON syntax, in that order.
fn parse_ingest_body(
    pipeline: &Pipeline,
    target: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Value, Rejection> {
    if !pipeline.has_target(target) {
        return Err(ingest_rejection(
            pipeline,
            IngestError::UnknownTarget(target.to_string()),
        ));
    }

    if !is_json_content_type(headers) {
        return Err(reject(
            pipeline,
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "unsupported_media_type",
            "Unsupported Media Type".to_string(),
        ));
    }

    serde_json::from_slice(body).map_err(|e| {
        reject(
            pipeline,
            StatusCode::BAD_REQUEST,
            "bad_json",
            format!("Error parsing JSON data: {e}"),
        )
    })
}

fn is_json_content_type(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("application/json"))
}

// --- Discovery documents ---

/// GET / - API discovery links.
async fn root_handler() -> Json<Value> {
    Json(json!({
        "links": [
            {"href": "/ceilometer", "rel": "related"}
        ]
    }))
}

/// GET /ceilometer - Supported API versions.
async fn versions_handler() -> Json<Value> {
    Json(json!({
        "versions": [
            {
                "id": "v1.0",
                "links": [
                    {"href": "/ceilometer/v1/", "rel": "self"}
                ],
                "status": "SUPPORTED",
                "version": "1.0",
                "updated": "2018-10-23T00:00:00Z"
            }
        ]
    }))
}

// --- Samples ---

#[derive(Debug, Deserialize)]
struct SampleJson {
    resource_id: String,
    name: String,
    volume: f64,
    timestamp: Value,
}

/// Converts a JSON payload into samples. Any malformed entry rejects the
/// whole payload.
fn parse_samples(payload: Value) -> Result<Vec<Sample>, IngestError> {
    let Value::Array(items) = payload else {
        return Err(IngestError::MalformedSample {
            index: 0,
            reason: "payload is not a list".to_string(),
        });
    };

    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            let raw: SampleJson =
                serde_json::from_value(item).map_err(|e| IngestError::MalformedSample {
                    index,
                    reason: e.to_string(),
                })?;
            let timestamp =
                parse_timestamp(&raw.timestamp).ok_or_else(|| IngestError::MalformedSample {
                    index,
                    reason: format!("invalid timestamp {}", raw.timestamp),
                })?;
            Ok(Sample {
                resource_id: raw.resource_id,
                meter: raw.name,
                volume: raw.volume,
                timestamp,
            })
        })
        .collect()
}

/// POST /ceilometer/v1/samples/{target}
async fn samples_handler(
    State(pipeline): State<Arc<Pipeline>>,
    Path(target): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, Rejection> {
    let payload = parse_ingest_body(&pipeline, &target, &headers, &body)?;
    let samples = parse_samples(payload).map_err(|e| ingest_rejection(&pipeline, e))?;

    let summary = pipeline
        .ingest_samples(&target, samples)
        .map_err(|e| ingest_rejection(&pipeline, e))?;

    tracing::debug!(
        target_system = %target,
        accepted = summary.accepted,
        writes = summary.writes,
        unmonitored = summary.unmonitored,
        "ingested samples",
    );

    Ok(StatusCode::OK)
}

// --- Events ---

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TraitJson {
    Named { name: String, value: Value },
    /// `[name, dtype, value]`
    Tuple(String, Value, Value),
}

impl TraitJson {
    fn into_pair(self) -> (String, Value) {
        match self {
            Self::Named { name, value } => (name, value),
            Self::Tuple(name, _, value) => (name, value),
        }
    }
}

#[derive(Debug, Deserialize)]
struct EventJson {
    event_type: String,
    #[serde(default)]
    generated: Option<Value>,
    #[serde(default)]
    message_id: Option<String>,
    #[serde(default)]
    traits: Vec<TraitJson>,
}

/// Converts a JSON payload into events for `target`.
fn parse_events(target: &str, payload: Value, now: SystemTime) -> Result<Vec<Event>, IngestError> {
    let Value::Array(items) = payload else {
        return Err(IngestError::MalformedSample {
            index: 0,
            reason: "payload is not a list".to_string(),
        });
    };

    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            let raw: EventJson =
                serde_json::from_value(item).map_err(|e| IngestError::MalformedSample {
                    index,
                    reason: e.to_string(),
                })?;

            let generated = match &raw.generated {
                None | Some(Value::Null) => now,
                Some(v) => parse_timestamp(v).ok_or_else(|| IngestError::MalformedSample {
                    index,
                    reason: format!("invalid generated time {v}"),
                })?,
            };

            let mut event = Event::new(target, raw.event_type, clock::unix_secs(generated));
            for t in raw.traits {
                let (name, value) = t.into_pair();
                event.traits.insert(name, value);
            }
            if let Some(message_id) = raw.message_id {
                event.traits.insert("message_id".to_string(), Value::String(message_id));
            }
            event.severity = match event.trait_str("priority").as_deref() {
                Some("WARN") => Severity::Warning,
                Some("ERROR") => Severity::Error,
                _ => Severity::Info,
            };
            Ok(event)
        })
        .collect()
}

/// POST /ceilometer/v1/events/{target}
async fn events_handler(
    State(pipeline): State<Arc<Pipeline>>,
    Path(target): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, Rejection> {
    let payload = parse_ingest_body(&pipeline, &target, &headers, &body)?;
    let now = pipeline.clock().now();
    let events = parse_events(&target, payload, now).map_err(|e| ingest_rejection(&pipeline, e))?;

    let count = events.len();
    let mut records = 0;
    for event in events {
        records += pipeline
            .ingest_event(&target, event)
            .map_err(|e| ingest_rejection(&pipeline, e))?;
    }

    tracing::debug!(
        target_system = %target,
        events = count,
        records,
        "ingested events",
    );

    Ok(StatusCode::OK)
}

// --- Configuration push ---

/// PUT /config/{target} - Replaces the configuration of one target.
async fn put_config_handler(
    State(pipeline): State<Arc<Pipeline>>,
    Path(target): Path<String>,
    Json(config): Json<TargetConfig>,
) -> Response {
    match pipeline.apply_config(&target, &config) {
        Ok(()) => {
            tracing::info!(
                target_system = %target,
                datasources = config.datasources.len(),
                "configuration pushed",
            );
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()).into_response(),
    }
}

/// DELETE /config/{target} - Drops every trace of one target.
async fn delete_config_handler(
    State(pipeline): State<Arc<Pipeline>>,
    Path(target): Path<String>,
) -> StatusCode {
    if pipeline.remove_target_system(&target) {
        tracing::info!(target_system = %target, "target system removed");
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

// --- Diagnostics ---

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(pipeline): State<Arc<Pipeline>>) -> impl IntoResponse {
    match pipeline.health().encode_text() {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

/// GET /status - Queue and task diagnostics.
async fn status_handler(State(pipeline): State<Arc<Pipeline>>) -> impl IntoResponse {
    Json(pipeline.snapshot())
}

// --- Timestamps ---

/// Parses an ISO 8601 timestamp. A missing zone means UTC. Numbers are
/// taken as Unix seconds.
fn parse_timestamp(value: &Value) -> Option<SystemTime> {
    match value {
        Value::String(s) => parse_timestamp_str(s),
        Value::Number(n) => n.as_f64().and_then(clock::from_unix_secs),
        _ => None,
    }
}

fn parse_timestamp_str(s: &str) -> Option<SystemTime> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc).into());
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc().into())
}
