//! HTTP API for direct stream writes, stream stats and Prometheus metrics.
//!
//! Producers outside the pipeline (the embeddings producer, operators) write to
//! streams here; the analysis stage writes to them in-process.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;

use super::{StreamRegistry, StreamStats};
use crate::PipelineError;

#[derive(Clone)]
struct ApiState {
    streams: Arc<StreamRegistry>,
    metrics: Option<PrometheusHandle>,
}

/// Response body of a flush request.
#[derive(Debug, Serialize)]
struct FlushResponse {
    path: Option<String>,
}

/// Build the stream API router.
///
/// `/metrics` is only served when a Prometheus handle is supplied.
pub fn stream_api_router(
    streams: Arc<StreamRegistry>,
    metrics: Option<PrometheusHandle>,
) -> Router {
    let max_record = streams
        .iter()
        .map(|s| s.config().max_record_bytes)
        .max()
        .unwrap_or(crate::config::DEFAULT_MAX_RECORD_BYTES);

    Router::new()
        .route("/streams", get(list_streams))
        .route("/streams/:name", get(stream_stats))
        .route("/streams/:name/records", post(put_record))
        .route("/streams/:name/flush", post(flush_stream))
        .route("/metrics", get(render_metrics))
        .layer(DefaultBodyLimit::max(max_record))
        .with_state(ApiState { streams, metrics })
}

/// Handle GET /streams
async fn list_streams(State(state): State<ApiState>) -> Json<Vec<StreamStats>> {
    Json(state.streams.stats())
}

/// Handle GET /streams/:name
async fn stream_stats(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<Json<StreamStats>, ApiError> {
    Ok(Json(state.streams.require(&name)?.stats()))
}

/// Handle POST /streams/:name/records
#[tracing::instrument(skip(state, body), fields(body_bytes = body.len()))]
async fn put_record(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let stream = state.streams.require(&name)?;
    serde_json::from_slice::<serde_json::Value>(&body)
        .map_err(|e| PipelineError::JsonDecode { source: e })?;
    stream.put_record(body).await?;
    Ok(StatusCode::ACCEPTED)
}

/// Handle POST /streams/:name/flush
#[tracing::instrument(skip(state))]
async fn flush_stream(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<Json<FlushResponse>, ApiError> {
    let created = state.streams.require(&name)?.flush().await?;
    Ok(Json(FlushResponse {
        path: created.map(|c| c.path.to_string()),
    }))
}

/// Handle GET /metrics
async fn render_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    match state.metrics {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed".to_owned()),
    }
}

/// Error response for the stream API.
struct ApiError(PipelineError);

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self.0 {
            PipelineError::UnknownStream { .. } => StatusCode::NOT_FOUND,
            PipelineError::JsonDecode { .. } => StatusCode::BAD_REQUEST,
            PipelineError::StreamRejected { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.0.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use rstest::rstest;
    use tower::ServiceExt;

    use crate::sink::ObjectSink;
    use crate::test_fixtures::{objects, streams};

    fn post(uri: &str, body: &'static str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::from(body))
            .unwrap()
    }

    #[rstest]
    #[tokio::test]
    async fn direct_put_buffers_record(streams: Arc<StreamRegistry>) {
        let router = stream_api_router(streams.clone(), None);

        let response = router
            .oneshot(post(
                "/streams/embeddings/records",
                r#"{"id":"doc-1","vector":[0.1,0.2]}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(streams.get("embeddings").unwrap().buffered_records(), 1);
    }

    #[rstest]
    #[tokio::test]
    async fn unknown_stream_returns_404(streams: Arc<StreamRegistry>) {
        let router = stream_api_router(streams, None);
        let response = router
            .oneshot(post("/streams/nope/records", "{}"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[rstest]
    #[tokio::test]
    async fn non_json_record_returns_400(streams: Arc<StreamRegistry>) {
        let router = stream_api_router(streams.clone(), None);
        let response = router
            .oneshot(post("/streams/embeddings/records", "not json"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(streams.get("embeddings").unwrap().buffered_records(), 0);
    }

    #[rstest]
    #[tokio::test]
    async fn flush_endpoint_writes_object(objects: Arc<ObjectSink>) {
        let router = stream_api_router(streams(objects.clone()), None);

        router
            .clone()
            .oneshot(post("/streams/ground-truth/records", r#"{"feedback":"good"}"#))
            .await
            .unwrap();
        let response = router
            .oneshot(post("/streams/ground-truth/flush", ""))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(objects.list("gtarchive/app1/").await.unwrap().len(), 1);
    }

    #[rstest]
    #[tokio::test]
    async fn stats_list_every_stream(streams: Arc<StreamRegistry>) {
        let router = stream_api_router(streams, None);
        let request = Request::builder()
            .uri("/streams")
            .body(Body::empty())
            .unwrap();

        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let stats: Vec<serde_json::Value> = serde_json::from_slice(&body).unwrap();
        assert_eq!(stats.len(), 4);
        assert_eq!(stats[3]["compression"], "uncompressed");
    }
}
