//! Error types for the archive pipeline.

use std::io;
use std::time::Duration;

/// Errors that can occur anywhere in the capture and archival pipeline.
///
/// Large foreign error types are boxed to keep `Result<T, PipelineError>` small.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Object store error (boxed - large type).
    #[error("object store error: {0}")]
    ObjectStore(Box<object_store::Error>),

    /// An object already exists at the path; the sink never overwrites.
    #[error("object already exists: {path}")]
    ObjectExists { path: String },

    /// Invalid OTLP data.
    #[error("invalid OTLP data: {0}")]
    InvalidOtlp(String),

    /// Invalid content type in HTTP request.
    #[error("unsupported content type: {content_type}")]
    InvalidContentType { content_type: String },

    /// Protobuf decoding error.
    #[error("protobuf decode error: {source}")]
    ProtoDecode { source: prost::DecodeError },

    /// JSON decoding error.
    #[error("JSON decode error: {source}")]
    JsonDecode { source: serde_json::Error },

    /// JSON encoding error.
    #[error("JSON encode error: {source}")]
    JsonEncode { source: serde_json::Error },

    /// The receiver queue is full - backpressure.
    #[error("receiver queue full: {message}")]
    QueueFull { message: String },

    /// A stage or component has shut down and no longer accepts work.
    #[error("{component} is shut down")]
    Closed { component: &'static str },

    /// Export to a sink failed.
    #[error("export to sink '{sink}' failed: {message}")]
    Export { sink: String, message: String },

    /// No delivery stream is registered under the name.
    #[error("unknown delivery stream: {name}")]
    UnknownStream { name: String },

    /// A delivery stream rejected a record.
    #[error("delivery stream '{stream}' rejected record: {reason}")]
    StreamRejected { stream: String, reason: String },

    /// An invocation exceeded its time limit.
    #[error("{stage} invocation timed out after {duration:?}")]
    Timeout {
        /// Stage that timed out.
        stage: &'static str,
        /// The configured limit.
        duration: Duration,
    },

    /// gRPC status returned by a remote endpoint.
    #[error("gRPC error: {0}")]
    Grpc(Box<tonic::Status>),

    /// gRPC transport error.
    #[error("gRPC transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
}

impl From<object_store::Error> for PipelineError {
    fn from(err: object_store::Error) -> Self {
        match err {
            object_store::Error::AlreadyExists { path, .. } => Self::ObjectExists { path },
            other => Self::ObjectStore(Box::new(other)),
        }
    }
}

impl From<tonic::Status> for PipelineError {
    fn from(status: tonic::Status) -> Self {
        Self::Grpc(Box::new(status))
    }
}

impl From<PipelineError> for tonic::Status {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::QueueFull { message } => Self::unavailable(message),
            PipelineError::Closed { .. } => Self::unavailable(err.to_string()),
            PipelineError::InvalidOtlp(msg) => Self::invalid_argument(msg),
            PipelineError::ProtoDecode { .. } | PipelineError::JsonDecode { .. } => {
                Self::invalid_argument(err.to_string())
            }
            _ => Self::internal(err.to_string()),
        }
    }
}
