//! Trace Archive - telemetry capture and archival pipeline.
//!
//! This crate receives OTLP traces from instrumented LLM applications and
//! turns them into durable, analysed archives:
//! - Receives standard OTLP traces over gRPC and HTTP (protobuf or JSON)
//! - Batches spans and exports each batch to a raw object sink and a trace index
//! - Extracts task spans from every raw trace object as it lands
//! - Analyses extracted tasks into prompt, ground-truth and trace-analysis records
//! - Buffers records in delivery streams that write compressed NDJSON archives
//!
//! ## Architecture
//!
//! ```text
//! OTLP gRPC/HTTP → Batcher → Exporter ─┬─► otel-traces/<minute>/<batch>.json
//!                                      └─► trace index (OTLP gRPC)
//!                                                 │ object created
//!                                                 ▼
//!                          ExtractionTrigger → Extractor → Analyzer
//!                                                             │
//!                              DeliveryStream (buffer, interval/size flush)
//!                                                             ▼
//!                               promptarchive/ gtarchive/ otel-trace-analysis/
//! ```

pub mod config;
pub mod error;
pub mod pipeline;
pub mod receiver;
pub mod service;
pub mod sink;
pub mod storage;
pub mod stream;
pub mod trigger;

#[cfg(test)]
pub mod test_fixtures;

pub use config::ArchiveConfig;
pub use error::PipelineError;
pub use service::ArchiveService;
