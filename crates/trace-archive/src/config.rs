//! Configuration types for the archive service.

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::PipelineError;

// ============================================================================
// Default configuration constants
// ============================================================================

/// Default OTLP gRPC port (OpenTelemetry standard).
pub const DEFAULT_GRPC_PORT: u16 = 4317;

/// Default OTLP HTTP port (OpenTelemetry standard).
pub const DEFAULT_HTTP_PORT: u16 = 4318;

/// Default stream API port.
pub const DEFAULT_API_PORT: u16 = 3100;

/// Default spans per exported batch.
pub const DEFAULT_SEND_BATCH_SIZE: usize = 8192;

/// Default batching window in milliseconds.
pub const DEFAULT_BATCH_TIMEOUT_MS: u64 = 200;

/// Default number of requests queued ahead of the batch processor.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Default per-sink export timeout in seconds.
pub const DEFAULT_EXPORT_TIMEOUT_SECS: u64 = 5;

/// Default per-sink export retries.
pub const DEFAULT_EXPORT_MAX_RETRIES: u32 = 3;

/// Default number of batches exported at once.
pub const DEFAULT_EXPORT_CONCURRENCY: usize = 4;

/// Prefix under which raw trace batches are persisted.
pub const RAW_TRACE_PREFIX: &str = "otel-traces/";

/// Default instrumentation scope whose task spans are extracted.
pub const DEFAULT_TASK_SCOPE: &str = "traceloop.tracer";

/// Default concurrent invocations per stage.
pub const DEFAULT_STAGE_CONCURRENCY: usize = 16;

/// Default invocation timeout in seconds.
pub const DEFAULT_INVOCATION_TIMEOUT_SECS: u64 = 30;

/// Default retries after a failed invocation (asynchronous-invoke semantics).
pub const DEFAULT_INVOCATION_MAX_RETRIES: u32 = 2;

/// Default flush interval in seconds.
pub const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 60;

/// Default flush size threshold (5 MiB).
pub const DEFAULT_FLUSH_SIZE_BYTES: usize = 5 * 1024 * 1024;

/// Default largest accepted single record (1000 KiB).
pub const DEFAULT_MAX_RECORD_BYTES: usize = 1000 * 1024;

/// Default hard cap on buffered bytes before submissions are rejected (64 MiB).
pub const DEFAULT_MAX_BUFFER_BYTES: usize = 64 * 1024 * 1024;

/// Default maximum flush retry attempts.
pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 3;

/// Default initial retry delay in milliseconds.
pub const DEFAULT_RETRY_INITIAL_DELAY_MS: u64 = 100;

/// Default maximum retry delay in milliseconds.
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 10_000;

/// Default local storage path.
pub const DEFAULT_STORAGE_PATH: &str = "./archive-data";

/// Service configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Listener addresses.
    pub server: ServerConfig,
    /// Trace receiver batching and export.
    pub receiver: ReceiverConfig,
    /// Optional tracing backend receiving the same batches.
    pub index: IndexConfig,
    /// Object storage backend.
    pub storage: StorageConfig,
    /// Trigger and invocation stages.
    pub pipeline: PipelineConfig,
    /// Buffered delivery streams.
    pub streams: StreamsConfig,
    /// Log output.
    pub log: LogConfig,
}

impl ArchiveConfig {
    /// Load configuration from files and environment.
    ///
    /// Configuration is loaded in order (later sources override earlier):
    /// 1. Default values
    /// 2. `trace-archive.toml` in current directory (or the file named by
    ///    `TRACE_ARCHIVE_CONFIG`)
    /// 3. Environment variables prefixed with `TRACE_ARCHIVE_`, with `__`
    ///    separating nested keys (`TRACE_ARCHIVE_SERVER__GRPC_ADDR`)
    pub fn load() -> Result<Self, PipelineError> {
        let path = std::env::var("TRACE_ARCHIVE_CONFIG")
            .unwrap_or_else(|_| "trace-archive.toml".to_owned());
        Self::load_from(&path)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &str) -> Result<Self, PipelineError> {
        let config: Self = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("TRACE_ARCHIVE_").ignore(&["CONFIG"]).split("__"))
            .extract()
            .map_err(|e| PipelineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.receiver.send_batch_size == 0 {
            return Err(PipelineError::Config(
                "receiver.send_batch_size must be greater than zero".to_owned(),
            ));
        }
        if self.pipeline.concurrency == 0 {
            return Err(PipelineError::Config(
                "pipeline.concurrency must be greater than zero".to_owned(),
            ));
        }
        if !self.pipeline.trigger_prefix.ends_with('/') {
            return Err(PipelineError::Config(format!(
                "pipeline.trigger_prefix '{}' must end with '/'",
                self.pipeline.trigger_prefix
            )));
        }
        if !RAW_TRACE_PREFIX.starts_with(&self.pipeline.trigger_prefix) {
            return Err(PipelineError::Config(format!(
                "pipeline.trigger_prefix '{}' does not cover raw trace objects under '{}'",
                self.pipeline.trigger_prefix, RAW_TRACE_PREFIX
            )));
        }
        for required in [
            stream_names::PROMPTS,
            stream_names::GROUND_TRUTH,
            stream_names::TRACE_ANALYSIS,
        ] {
            if !self.streams.streams.iter().any(|s| s.name == required) {
                return Err(PipelineError::Config(format!(
                    "analysis output stream '{required}' is not configured"
                )));
            }
        }
        let mut seen = std::collections::HashSet::new();
        for stream in &self.streams.streams {
            if !seen.insert(stream.name.as_str()) {
                return Err(PipelineError::Config(format!(
                    "duplicate stream name '{}'",
                    stream.name
                )));
            }
            if stream.prefix.starts_with(&self.pipeline.trigger_prefix) {
                return Err(PipelineError::Config(format!(
                    "stream '{}' prefix '{}' overlaps the extraction trigger prefix",
                    stream.name, stream.prefix
                )));
            }
            if stream.interval_secs == 0 || stream.size_bytes == 0 {
                return Err(PipelineError::Config(format!(
                    "stream '{}' needs a non-zero interval and size threshold",
                    stream.name
                )));
            }
        }
        Ok(())
    }
}

/// Server address configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// OTLP gRPC address (default: 0.0.0.0:4317).
    pub grpc_addr: SocketAddr,
    /// OTLP HTTP address (default: 0.0.0.0:4318).
    pub http_addr: SocketAddr,
    /// Stream API and metrics address (default: 0.0.0.0:3100).
    pub api_addr: SocketAddr,
    /// Maximum OTLP/HTTP request body in bytes.
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            grpc_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_GRPC_PORT)),
            http_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_HTTP_PORT)),
            api_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_API_PORT)),
            max_body_bytes: crate::receiver::DEFAULT_MAX_BODY_SIZE,
        }
    }
}

/// Batching processor and exporter settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    /// Spans that close a batch window early.
    pub send_batch_size: usize,
    /// Longest a batch window stays open, in milliseconds.
    pub timeout_ms: u64,
    /// Requests queued ahead of the batch processor before clients see backpressure.
    pub queue_capacity: usize,
    /// Per-sink export timeout in seconds.
    pub export_timeout_secs: u64,
    /// Retries per sink after a failed export.
    pub export_max_retries: u32,
    /// Backoff between export retries.
    pub export_retry: RetryConfig,
    /// Batches exported concurrently.
    pub export_concurrency: usize,
}

impl ReceiverConfig {
    /// Batch window as a duration.
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Per-sink export timeout as a duration.
    pub const fn export_timeout(&self) -> Duration {
        Duration::from_secs(self.export_timeout_secs)
    }
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            send_batch_size: DEFAULT_SEND_BATCH_SIZE,
            timeout_ms: DEFAULT_BATCH_TIMEOUT_MS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            export_timeout_secs: DEFAULT_EXPORT_TIMEOUT_SECS,
            export_max_retries: DEFAULT_EXPORT_MAX_RETRIES,
            export_retry: RetryConfig::default(),
            export_concurrency: DEFAULT_EXPORT_CONCURRENCY,
        }
    }
}

/// Trace index sink (an OTLP/gRPC tracing backend).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Backend endpoint, e.g. `http://jaeger:4317`. The sink is disabled when unset.
    pub endpoint: Option<String>,
}

/// Storage backend configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage.
    Local {
        /// Path to storage directory.
        path: PathBuf,
    },
    /// AWS S3 or S3-compatible storage (MinIO, Garage, etc.).
    S3 {
        /// S3 bucket name.
        bucket: String,
        /// AWS region or custom region for S3-compatible services.
        region: Option<String>,
        /// Custom endpoint URL for S3-compatible services.
        endpoint: Option<String>,
        /// Allow HTTP (non-TLS) connections (for local development).
        #[serde(default)]
        allow_http: bool,
    },
    /// In-memory storage (for testing).
    Memory,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Local {
            path: PathBuf::from(DEFAULT_STORAGE_PATH),
        }
    }
}

/// Extraction trigger and invocation stage settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Object prefix whose creations trigger extraction.
    pub trigger_prefix: String,
    /// Instrumentation scope whose task spans are extracted.
    pub task_scope: String,
    /// Concurrent invocations per stage.
    pub concurrency: usize,
    /// Invocation time limit in seconds, for both extraction and analysis.
    pub invocation_timeout_secs: u64,
    /// Retries after an invocation error.
    pub invocation_max_retries: u32,
    /// Backoff between invocation retries.
    pub invocation_retry: RetryConfig,
}

impl PipelineConfig {
    /// Invocation time limit as a duration.
    pub const fn invocation_timeout(&self) -> Duration {
        Duration::from_secs(self.invocation_timeout_secs)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            trigger_prefix: RAW_TRACE_PREFIX.to_owned(),
            task_scope: DEFAULT_TASK_SCOPE.to_owned(),
            concurrency: DEFAULT_STAGE_CONCURRENCY,
            invocation_timeout_secs: DEFAULT_INVOCATION_TIMEOUT_SECS,
            invocation_max_retries: DEFAULT_INVOCATION_MAX_RETRIES,
            invocation_retry: RetryConfig::default(),
        }
    }
}

/// Exponential backoff settings shared by every retrying component.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Initial retry delay in milliseconds.
    ///
    /// The delay doubles after each failed attempt, up to `max_delay_ms`.
    pub initial_delay_ms: u64,
    /// Maximum retry delay in milliseconds.
    pub max_delay_ms: u64,
}

impl RetryConfig {
    /// Delay before retry number `attempt` (zero-based).
    ///
    /// The delay doubles with each attempt (2^attempt * initial_delay), capped at max_delay.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let initial = Duration::from_millis(self.initial_delay_ms);
        let max = Duration::from_millis(self.max_delay_ms);
        let multiplier = 2u32.saturating_pow(attempt);
        initial.saturating_mul(multiplier).min(max)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: DEFAULT_RETRY_INITIAL_DELAY_MS,
            max_delay_ms: DEFAULT_RETRY_MAX_DELAY_MS,
        }
    }
}

/// Output compression of a delivery stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// Gzip, objects get a `.gz` suffix.
    Gzip,
    /// Plain newline-delimited JSON.
    Uncompressed,
}

/// A single buffered delivery stream.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// Logical stream name, also used in archived object names.
    pub name: String,
    /// Destination prefix in the object sink, e.g. `promptarchive/app1/`.
    pub prefix: String,
    /// Flush once the oldest buffered record is this many seconds old.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Flush once this many bytes are buffered.
    #[serde(default = "default_size_bytes")]
    pub size_bytes: usize,
    /// Output compression.
    pub compression: Compression,
    /// Largest single record accepted.
    #[serde(default = "default_max_record_bytes")]
    pub max_record_bytes: usize,
    /// Buffered bytes beyond which submissions are rejected.
    #[serde(default = "default_max_buffer_bytes")]
    pub max_buffer_bytes: usize,
    /// Flush retries before the buffer is retained and an alarm raised.
    #[serde(default = "default_retry_max_attempts")]
    pub max_retries: u32,
    /// Backoff between flush retries.
    #[serde(default)]
    pub retry: RetryConfig,
}

const fn default_interval_secs() -> u64 {
    DEFAULT_FLUSH_INTERVAL_SECS
}

const fn default_size_bytes() -> usize {
    DEFAULT_FLUSH_SIZE_BYTES
}

const fn default_max_record_bytes() -> usize {
    DEFAULT_MAX_RECORD_BYTES
}

const fn default_max_buffer_bytes() -> usize {
    DEFAULT_MAX_BUFFER_BYTES
}

const fn default_retry_max_attempts() -> u32 {
    DEFAULT_RETRY_MAX_ATTEMPTS
}

impl StreamConfig {
    /// A stream with the default 60 s / 5 MiB thresholds.
    pub fn new(name: &str, prefix: &str, compression: Compression) -> Self {
        Self {
            name: name.to_owned(),
            prefix: prefix.to_owned(),
            interval_secs: DEFAULT_FLUSH_INTERVAL_SECS,
            size_bytes: DEFAULT_FLUSH_SIZE_BYTES,
            compression,
            max_record_bytes: DEFAULT_MAX_RECORD_BYTES,
            max_buffer_bytes: DEFAULT_MAX_BUFFER_BYTES,
            max_retries: DEFAULT_RETRY_MAX_ATTEMPTS,
            retry: RetryConfig::default(),
        }
    }

    /// Flush interval as a duration.
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Stream names used by the analysis stage.
pub mod stream_names {
    pub const EMBEDDINGS: &str = "embeddings";
    pub const PROMPTS: &str = "prompts";
    pub const GROUND_TRUTH: &str = "ground-truth";
    pub const TRACE_ANALYSIS: &str = "trace-analysis";
}

/// The set of delivery streams.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamsConfig {
    pub streams: Vec<StreamConfig>,
}

impl Default for StreamsConfig {
    fn default() -> Self {
        Self {
            streams: vec![
                StreamConfig::new(
                    stream_names::EMBEDDINGS,
                    "embeddingarchive/app1/",
                    Compression::Gzip,
                ),
                StreamConfig::new(
                    stream_names::PROMPTS,
                    "promptarchive/app1/",
                    Compression::Gzip,
                ),
                StreamConfig::new(
                    stream_names::GROUND_TRUTH,
                    "gtarchive/app1/",
                    Compression::Gzip,
                ),
                StreamConfig::new(
                    stream_names::TRACE_ANALYSIS,
                    "otel-trace-analysis/",
                    Compression::Uncompressed,
                ),
            ],
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ArchiveConfig::default();
        assert_eq!(config.server.grpc_addr.port(), DEFAULT_GRPC_PORT);
        assert_eq!(config.server.http_addr.port(), DEFAULT_HTTP_PORT);
        assert_eq!(config.server.api_addr.port(), DEFAULT_API_PORT);
        assert!(config.index.endpoint.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn default_streams_match_archive_layout() {
        let streams = StreamsConfig::default().streams;
        let layout: Vec<_> = streams
            .iter()
            .map(|s| (s.prefix.as_str(), s.compression))
            .collect();
        assert_eq!(
            layout,
            vec![
                ("embeddingarchive/app1/", Compression::Gzip),
                ("promptarchive/app1/", Compression::Gzip),
                ("gtarchive/app1/", Compression::Gzip),
                ("otel-trace-analysis/", Compression::Uncompressed),
            ]
        );
        for stream in &streams {
            assert_eq!(stream.interval_secs, 60);
            assert_eq!(stream.size_bytes, 5 * 1024 * 1024);
        }
    }

    #[test]
    fn backoff_delay_calculation() {
        let retry = RetryConfig {
            initial_delay_ms: 100,
            max_delay_ms: 10_000,
        };
        assert_eq!(retry.backoff(0), Duration::from_millis(100));
        assert_eq!(retry.backoff(1), Duration::from_millis(200));
        assert_eq!(retry.backoff(3), Duration::from_millis(800));
        assert_eq!(retry.backoff(10), Duration::from_millis(10_000));
        assert_eq!(retry.backoff(40), Duration::from_millis(10_000));
    }

    #[test]
    fn overlapping_stream_prefix_rejected() {
        let mut config = ArchiveConfig::default();
        config.streams.streams.push(StreamConfig::new(
            "loop",
            "otel-traces/analysis/",
            Compression::Uncompressed,
        ));
        assert!(matches!(config.validate(), Err(PipelineError::Config(_))));
    }

    #[test]
    fn duplicate_stream_name_rejected() {
        let mut config = ArchiveConfig::default();
        config.streams.streams.push(StreamConfig::new(
            stream_names::PROMPTS,
            "elsewhere/",
            Compression::Gzip,
        ));
        assert!(matches!(config.validate(), Err(PipelineError::Config(_))));
    }

    #[test]
    fn missing_analysis_stream_rejected() {
        let mut config = ArchiveConfig::default();
        config
            .streams
            .streams
            .retain(|s| s.name == stream_names::EMBEDDINGS);
        let Err(PipelineError::Config(message)) = config.validate() else {
            panic!("config without analysis streams should be rejected");
        };
        assert!(message.contains(stream_names::PROMPTS), "{message}");
    }

    #[test]
    fn embeddings_stream_is_optional() {
        let mut config = ArchiveConfig::default();
        config
            .streams
            .streams
            .retain(|s| s.name != stream_names::EMBEDDINGS);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn trigger_prefix_must_cover_raw_traces() {
        let mut config = ArchiveConfig::default();
        config.pipeline.trigger_prefix = "traces/".to_owned();
        assert!(matches!(config.validate(), Err(PipelineError::Config(_))));

        config.pipeline.trigger_prefix = "otel-traces/2024/".to_owned();
        assert!(matches!(config.validate(), Err(PipelineError::Config(_))));
    }

    #[test]
    fn storage_defaults_to_local() {
        match StorageConfig::default() {
            StorageConfig::Local { path } => {
                assert_eq!(path, PathBuf::from(DEFAULT_STORAGE_PATH));
            }
            other => panic!("expected local storage as default, got {other:?}"),
        }
    }

    #[test]
    fn load_from_toml_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace-archive.toml");
        std::fs::write(
            &path,
            r#"
[receiver]
send_batch_size = 10

[storage]
type = "memory"

[index]
endpoint = "http://tempo:4317"
"#,
        )
        .unwrap();

        let config = ArchiveConfig::load_from(path.to_str().unwrap()).unwrap();
        assert_eq!(config.receiver.send_batch_size, 10);
        assert_eq!(config.receiver.timeout_ms, DEFAULT_BATCH_TIMEOUT_MS);
        assert!(matches!(config.storage, StorageConfig::Memory));
        assert_eq!(config.index.endpoint.as_deref(), Some("http://tempo:4317"));
        assert_eq!(config.streams.streams.len(), 4);
    }
}
