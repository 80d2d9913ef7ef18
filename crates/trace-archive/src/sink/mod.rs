//! Export sinks for trace batches.
//!
//! Every batch leaves the receiver through an [`Exporter`], which fans it out
//! to each configured [`ExportSink`] independently: a slow or failing sink
//! costs only its own timeout and retries and never prevents delivery to the
//! others.

pub mod index;
pub mod object;
pub mod raw;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ulid::Ulid;

use crate::config::{ReceiverConfig, RetryConfig};
use crate::receiver::TraceBatch;
use crate::PipelineError;

pub use index::OtlpIndexSink;
pub use object::{ObjectCreated, ObjectNotifications, ObjectSink};
pub use raw::RawTraceSink;

/// A destination for exported trace batches.
#[async_trait]
pub trait ExportSink: Send + Sync {
    /// Name used in logs, metrics and export reports.
    fn name(&self) -> &str;

    /// Deliver one batch.
    ///
    /// Implementations must tolerate the same batch being delivered again
    /// after a timeout or failure.
    async fn export(&self, batch: &TraceBatch) -> Result<(), PipelineError>;
}

/// Per-sink result of exporting one batch.
#[derive(Debug, Clone)]
pub struct SinkOutcome {
    pub sink: String,
    pub attempts: u32,
    pub error: Option<String>,
}

impl SinkOutcome {
    pub const fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Result of exporting one batch to every sink.
#[derive(Debug, Clone)]
pub struct ExportReport {
    pub batch_id: Ulid,
    pub outcomes: Vec<SinkOutcome>,
}

impl ExportReport {
    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(SinkOutcome::succeeded)
    }

    /// Names of sinks that exhausted their retries.
    pub fn failed_sinks(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|o| !o.succeeded())
            .map(|o| o.sink.as_str())
            .collect()
    }

    pub fn outcome(&self, sink: &str) -> Option<&SinkOutcome> {
        self.outcomes.iter().find(|o| o.sink == sink)
    }
}

/// Fans batches out to every sink with per-sink timeout and retries.
pub struct Exporter {
    sinks: Vec<Arc<dyn ExportSink>>,
    timeout: Duration,
    max_retries: u32,
    retry: RetryConfig,
}

impl Exporter {
    pub fn new(sinks: Vec<Arc<dyn ExportSink>>, config: &ReceiverConfig) -> Self {
        Self {
            sinks,
            timeout: config.export_timeout(),
            max_retries: config.export_max_retries,
            retry: config.export_retry.clone(),
        }
    }

    pub fn sink_names(&self) -> Vec<&str> {
        self.sinks.iter().map(|s| s.name()).collect()
    }

    /// Export a batch to all sinks concurrently and wait for each to finish.
    pub async fn export(&self, batch: &TraceBatch) -> ExportReport {
        let exports = self
            .sinks
            .iter()
            .map(|sink| self.export_to(sink.as_ref(), batch));
        let outcomes = futures::future::join_all(exports).await;

        metrics::histogram!("trace_archive.export.batch_spans").record(batch.span_count() as f64);
        ExportReport {
            batch_id: *batch.id(),
            outcomes,
        }
    }

    async fn export_to(&self, sink: &dyn ExportSink, batch: &TraceBatch) -> SinkOutcome {
        let mut last_error = String::new();

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = self.retry.backoff(attempt - 1);
                tracing::warn!(
                    sink = sink.name(),
                    batch_id = %batch.id(),
                    attempt,
                    max_retries = self.max_retries,
                    delay_ms = delay.as_millis(),
                    error = %last_error,
                    "Export failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }

            match tokio::time::timeout(self.timeout, sink.export(batch)).await {
                Ok(Ok(())) => {
                    metrics::counter!(
                        "trace_archive.export.batches",
                        "sink" => sink.name().to_owned(),
                        "status" => "ok"
                    )
                    .increment(1);
                    tracing::debug!(
                        sink = sink.name(),
                        batch_id = %batch.id(),
                        spans = batch.span_count(),
                        "Batch exported"
                    );
                    return SinkOutcome {
                        sink: sink.name().to_owned(),
                        attempts: attempt + 1,
                        error: None,
                    };
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => {
                    last_error = PipelineError::Timeout {
                        stage: "export",
                        duration: self.timeout,
                    }
                    .to_string();
                }
            }
        }

        metrics::counter!(
            "trace_archive.export.batches",
            "sink" => sink.name().to_owned(),
            "status" => "failed"
        )
        .increment(1);
        tracing::error!(
            sink = sink.name(),
            batch_id = %batch.id(),
            spans = batch.span_count(),
            attempts = self.max_retries + 1,
            error = %last_error,
            "Export failed after all retries, batch dropped for this sink"
        );
        SinkOutcome {
            sink: sink.name().to_owned(),
            attempts: self.max_retries + 1,
            error: Some(last_error),
        }
    }
}
