//! axum HTTP OTLP trace receiver.
//!
//! Supports both protobuf (`application/x-protobuf`) and JSON
//! (`application/json`) bodies as per the OTLP specification. Gzip-compressed
//! request bodies are decompressed by tower-http middleware.

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use opentelemetry_proto::tonic::collector::trace::v1::{
    ExportTraceServiceRequest, ExportTraceServiceResponse,
};
use prost::Message;
use tower_http::decompression::RequestDecompressionLayer;

use super::{
    build_partial_success, validate_request, BatchSender, WireProtocol, DEFAULT_MAX_BODY_SIZE,
};
use crate::PipelineError;

/// Content type for OTLP requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContentType {
    Protobuf,
    Json,
}

impl ContentType {
    fn from_headers(headers: &HeaderMap) -> Result<Self, PipelineError> {
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/x-protobuf");

        if content_type.starts_with("application/x-protobuf") {
            Ok(Self::Protobuf)
        } else if content_type.starts_with("application/json") {
            Ok(Self::Json)
        } else {
            Err(PipelineError::InvalidContentType {
                content_type: content_type.to_owned(),
            })
        }
    }

    const fn protocol(self) -> WireProtocol {
        match self {
            Self::Protobuf => WireProtocol::HttpProtobuf,
            Self::Json => WireProtocol::HttpJson,
        }
    }
}

/// Create the OTLP HTTP router with the default body size limit.
pub fn otlp_http_router(batches: BatchSender) -> Router {
    otlp_http_router_with_limit(batches, DEFAULT_MAX_BODY_SIZE)
}

/// Create the OTLP HTTP router with a custom body size limit.
///
/// The limit applies after decompression, which also guards against
/// decompression bombs.
pub fn otlp_http_router_with_limit(batches: BatchSender, max_body_size: usize) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/v1/traces", post(handle_traces))
        .layer(RequestDecompressionLayer::new())
        .layer(DefaultBodyLimit::max(max_body_size))
        .with_state(batches)
}

/// Handle GET /health
#[tracing::instrument]
async fn handle_health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Handle POST /v1/traces
#[tracing::instrument(skip(batches, headers, body), fields(body_bytes = body.len()))]
async fn handle_traces(
    State(batches): State<BatchSender>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, HttpError> {
    let content_type = ContentType::from_headers(&headers)?;
    let request = decode_request(content_type, &body)?;

    let validated = validate_request(request);
    let partial_success = build_partial_success(&validated);
    batches.submit(validated.request, content_type.protocol())?;

    let response = ExportTraceServiceResponse { partial_success };
    encode_response(content_type, &response)
}

fn decode_request(
    content_type: ContentType,
    body: &[u8],
) -> Result<ExportTraceServiceRequest, PipelineError> {
    match content_type {
        ContentType::Protobuf => ExportTraceServiceRequest::decode(body)
            .map_err(|e| PipelineError::ProtoDecode { source: e }),
        ContentType::Json => {
            serde_json::from_slice(body).map_err(|e| PipelineError::JsonDecode { source: e })
        }
    }
}

fn encode_response(
    content_type: ContentType,
    response: &ExportTraceServiceResponse,
) -> Result<impl IntoResponse, HttpError> {
    match content_type {
        ContentType::Protobuf => Ok((
            StatusCode::OK,
            [(CONTENT_TYPE, "application/x-protobuf")],
            response.encode_to_vec(),
        )),
        ContentType::Json => {
            let body = serde_json::to_vec(response)
                .map_err(|e| PipelineError::JsonEncode { source: e })?;
            Ok((StatusCode::OK, [(CONTENT_TYPE, "application/json")], body))
        }
    }
}

/// HTTP error response wrapper.
pub struct HttpError(PipelineError);

impl From<PipelineError> for HttpError {
    fn from(err: PipelineError) -> Self {
        Self(err)
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self.0 {
            // OTLP/HTTP clients retry 503 with backoff.
            PipelineError::QueueFull { .. } | PipelineError::Closed { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            PipelineError::InvalidContentType { .. } => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            PipelineError::ProtoDecode { .. }
            | PipelineError::JsonDecode { .. }
            | PipelineError::InvalidOtlp(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, self.0.to_string()).into_response()
    }
}
