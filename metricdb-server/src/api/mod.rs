//! HTTP API endpoints

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use metricdb_core::compaction::CompactionReport;
use metricdb_core::storage::{MetricStore, StoreStats};
use metricdb_core::{MetricError, Sample, Timestamp};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state
pub type AppState = Arc<MetricStore>;

/// Create the API router
pub fn create_router(store: Arc<MetricStore>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/health", get(health))

        // Samples
        .route("/metrics", get(list_metrics))
        .route(
            "/metrics/:key/samples",
            get(query_samples).post(write_samples),
        )

        // Maintenance
        .route("/metrics/:key/flush", post(flush))
        .route("/metrics/:key/compact", post(compact))

        // Stats
        .route("/stats", get(stats))

        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(store)
}

// ============================================================================
// Request/Response types
// ============================================================================

/// One sample or a batch
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum WriteBody {
    One(Sample),
    Many(Vec<Sample>),
}

#[derive(Debug, Deserialize)]
pub struct RangeParams {
    from: Option<Timestamp>,
    to: Option<Timestamp>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct WriteResponse {
    pub written: usize,
}

#[derive(Debug, Serialize)]
pub struct QueryResponse {
    pub metric: String,
    pub samples: Vec<Sample>,
}

#[derive(Debug, Serialize)]
pub struct FlushResponse {
    pub tables_written: usize,
}

#[derive(Debug, Serialize)]
pub struct CompactResponse {
    pub compacted: bool,
    pub inputs: usize,
    pub outputs: usize,
    pub samples_written: u64,
    pub duplicates_resolved: u64,
}

impl From<Option<CompactionReport>> for CompactResponse {
    fn from(report: Option<CompactionReport>) -> Self {
        match report {
            Some(r) => Self {
                compacted: true,
                inputs: r.inputs,
                outputs: r.outputs,
                samples_written: r.samples_written,
                duplicates_resolved: r.duplicates_resolved,
            },
            None => Self {
                compacted: false,
                inputs: 0,
                outputs: 0,
                samples_written: 0,
                duplicates_resolved: 0,
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Store error mapped to an HTTP status
pub struct ApiError(MetricError);

impl From<MetricError> for ApiError {
    fn from(e: MetricError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            MetricError::InvalidSample(_) | MetricError::InvalidKey(_) => StatusCode::BAD_REQUEST,
            MetricError::NotFound(_) => StatusCode::NOT_FOUND,
            // Client closed request
            MetricError::Cancelled => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self.0);
        }
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: metricdb_core::VERSION.to_string(),
    })
}

async fn list_metrics(State(store): State<AppState>) -> Result<Json<Vec<String>>, ApiError> {
    Ok(Json(store.list_metrics()?))
}

async fn write_samples(
    State(store): State<AppState>,
    Path(key): Path<String>,
    Json(body): Json<WriteBody>,
) -> Result<(StatusCode, Json<WriteResponse>), ApiError> {
    let written = match body {
        WriteBody::One(sample) => {
            store.add_sample(&key, sample.timestamp, sample.value)?;
            1
        }
        WriteBody::Many(samples) => {
            store.add_samples(&key, &samples)?;
            samples.len()
        }
    };
    Ok((StatusCode::CREATED, Json(WriteResponse { written })))
}

async fn query_samples(
    State(store): State<AppState>,
    Path(key): Path<String>,
    Query(params): Query<RangeParams>,
) -> Result<Json<QueryResponse>, ApiError> {
    let lo = params.from.unwrap_or(0);
    let hi = params.to.unwrap_or(Timestamp::MAX);

    // Dropping this handler (client gone) cancels the scan at its next table
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let metric = key.clone();
    let samples = tokio::task::spawn_blocking(move || {
        store.query_with_cancel(&metric, lo, hi, &cancel)
    })
    .await
    .map_err(|e| MetricError::Internal(e.to_string()))??;

    Ok(Json(QueryResponse {
        metric: key,
        samples,
    }))
}

async fn flush(
    State(store): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<FlushResponse>, ApiError> {
    let tables_written = store.flush(&key)?;
    Ok(Json(FlushResponse { tables_written }))
}

async fn compact(
    State(store): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<CompactResponse>, ApiError> {
    Ok(Json(store.compact(&key)?.into()))
}

async fn stats(State(store): State<AppState>) -> Json<StoreStats> {
    Json(store.stats())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use metricdb_core::repository::MemoryFileRepository;
    use metricdb_core::storage::StoreConfig;
    use tower::ServiceExt;

    fn router() -> Router {
        let config = StoreConfig {
            background_worker: false,
            ..Default::default()
        };
        let store = MetricStore::open(Arc::new(MemoryFileRepository::new()), config).unwrap();
        create_router(Arc::new(store))
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_write_and_query() {
        let app = router();

        let (status, _) = send(
            &app,
            post_json("/metrics/temp/samples", r#"{"timestamp":100,"value":3.14}"#),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, body) = send(
            &app,
            post_json(
                "/metrics/temp/samples",
                r#"[{"timestamp":200,"value":2.71},{"timestamp":50,"value":1.41}]"#,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["written"], 2);

        let request = Request::get("/metrics/temp/samples?from=0&to=1000")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        let timestamps: Vec<u64> = body["samples"]
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["timestamp"].as_u64().unwrap())
            .collect();
        assert_eq!(timestamps, vec![50, 100, 200]);

        let (status, body) = send(&app, post_json("/metrics/temp/flush", "")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["tables_written"], 1);

        let request = Request::get("/metrics").body(Body::empty()).unwrap();
        let (_, body) = send(&app, request).await;
        assert_eq!(body, serde_json::json!(["temp"]));
    }

    #[tokio::test]
    async fn test_health() {
        let app = router();
        let request = Request::get("/health").body(Body::empty()).unwrap();
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[test]
    fn test_error_status_mapping() {
        let status = |e: MetricError| ApiError(e).into_response().status();
        assert_eq!(
            status(MetricError::InvalidSample("nan".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status(MetricError::NotFound("t".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(status(MetricError::Cancelled).as_u16(), 499);
        assert_eq!(
            status(MetricError::Internal("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
