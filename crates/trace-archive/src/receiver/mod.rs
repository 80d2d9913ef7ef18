//! OTLP trace receiver.
//!
//! Accepts OTLP traces over gRPC and HTTP (protobuf or JSON, optionally
//! gzip-compressed), batches them and exports each batch to the raw object
//! sink and the trace index.
//!
//! ```text
//! OTLP gRPC ─┐                       ┌─► RawTraceSink ─► otel-traces/…
//!            ├─► BatchSender ─► Exporter
//! OTLP HTTP ─┘                       └─► OtlpIndexSink ─► tracing backend
//! ```

mod batch;
pub mod grpc;
pub mod http;

pub use batch::{
    count_spans, start_batch_processor, validate_request, BatchProcessorHandle, BatchSender,
    TraceBatch, ValidatedRequest, WireProtocol, OTLP_TRACE_PROTOCOL_VERSION,
};
pub use grpc::{OtlpGrpcReceiver, TraceServiceServer};
pub use http::{otlp_http_router, otlp_http_router_with_limit};

use opentelemetry_proto::tonic::collector::trace::v1::ExportTracePartialSuccess;

/// Default maximum request body size (16 MiB).
///
/// Telemetry batches larger than this should be split by the client.
pub const DEFAULT_MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

/// Build a `partial_success` only when spans were rejected.
fn build_partial_success(validated: &ValidatedRequest) -> Option<ExportTracePartialSuccess> {
    if validated.rejected_count == 0 && validated.error_message.is_none() {
        return None;
    }
    Some(ExportTracePartialSuccess {
        rejected_spans: validated.rejected_count,
        error_message: validated.error_message.clone().unwrap_or_default(),
    })
}
