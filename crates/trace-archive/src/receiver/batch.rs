//! Batching processor between the OTLP receivers and the exporter.
//!
//! Receivers validate each request and hand it to a [`BatchSender`]. A single
//! processor task merges requests into one [`TraceBatch`] until either
//! `send_batch_size` spans have accumulated or `timeout` has passed since the
//! first request of the window, then exports the batch to every sink.
//! Clients are acknowledged once their request is queued; export results never
//! flow back to them.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use opentelemetry_proto::tonic::trace::v1::ResourceSpans;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use crate::config::ReceiverConfig;
use crate::sink::Exporter;
use crate::PipelineError;

/// OTLP trace protocol version carried by every batch.
pub const OTLP_TRACE_PROTOCOL_VERSION: &str = "v1";

/// Length of a valid trace id in bytes.
const TRACE_ID_LEN: usize = 16;

/// Length of a valid span id in bytes.
const SPAN_ID_LEN: usize = 8;

/// Which wire form a request arrived over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireProtocol {
    /// OTLP/gRPC.
    Grpc,
    /// OTLP/HTTP with protobuf body.
    HttpProtobuf,
    /// OTLP/HTTP with JSON body.
    HttpJson,
}

impl WireProtocol {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Grpc => "grpc",
            Self::HttpProtobuf => "http/protobuf",
            Self::HttpJson => "http/json",
        }
    }
}

impl std::fmt::Display for WireProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Spans received in one batching window, ready for export.
///
/// Immutable once formed. The payload is the OTLP/JSON encoding of the merged
/// request and is what the raw object sink persists.
#[derive(Debug, Clone)]
pub struct TraceBatch {
    id: Ulid,
    received_at: DateTime<Utc>,
    span_count: usize,
    request: Arc<ExportTraceServiceRequest>,
    payload: Bytes,
}

impl TraceBatch {
    /// Merge requests, in receipt order, into one batch.
    pub fn from_requests(
        requests: Vec<ExportTraceServiceRequest>,
        received_at: DateTime<Utc>,
    ) -> Result<Self, PipelineError> {
        let resource_spans: Vec<ResourceSpans> = requests
            .into_iter()
            .flat_map(|r| r.resource_spans)
            .collect();
        let request = ExportTraceServiceRequest { resource_spans };
        let span_count = count_spans(&request);
        let payload = serde_json::to_vec(&request)
            .map_err(|e| PipelineError::JsonEncode { source: e })?;

        Ok(Self {
            id: Ulid::new(),
            received_at,
            span_count,
            request: Arc::new(request),
            payload: Bytes::from(payload),
        })
    }

    pub const fn id(&self) -> &Ulid {
        &self.id
    }

    pub const fn protocol_version(&self) -> &'static str {
        OTLP_TRACE_PROTOCOL_VERSION
    }

    pub const fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    pub const fn span_count(&self) -> usize {
        self.span_count
    }

    pub fn request(&self) -> &ExportTraceServiceRequest {
        &self.request
    }

    pub const fn payload(&self) -> &Bytes {
        &self.payload
    }
}

/// Total spans in a request.
pub fn count_spans(request: &ExportTraceServiceRequest) -> usize {
    request
        .resource_spans
        .iter()
        .flat_map(|rs| &rs.scope_spans)
        .map(|ss| ss.spans.len())
        .sum()
}

/// Outcome of validating one incoming request.
///
/// Tracks accepted and rejected spans so receivers can answer with an OTLP
/// `partial_success`.
#[derive(Debug)]
pub struct ValidatedRequest {
    /// The request with malformed spans removed.
    pub request: ExportTraceServiceRequest,
    /// Spans kept.
    pub accepted: usize,
    /// Spans dropped as malformed.
    pub rejected_count: i64,
    /// Human-readable reason if any spans were dropped.
    pub error_message: Option<String>,
}

/// Drop spans whose trace or span id has the wrong length.
pub fn validate_request(mut request: ExportTraceServiceRequest) -> ValidatedRequest {
    let mut rejected = 0usize;
    for resource_spans in &mut request.resource_spans {
        for scope_spans in &mut resource_spans.scope_spans {
            let before = scope_spans.spans.len();
            scope_spans
                .spans
                .retain(|s| s.trace_id.len() == TRACE_ID_LEN && s.span_id.len() == SPAN_ID_LEN);
            rejected += before - scope_spans.spans.len();
        }
        resource_spans.scope_spans.retain(|ss| !ss.spans.is_empty());
    }
    request
        .resource_spans
        .retain(|rs| !rs.scope_spans.is_empty());

    let accepted = count_spans(&request);
    let error_message = (rejected > 0).then(|| {
        format!("{rejected} spans rejected: trace_id must be 16 bytes and span_id 8 bytes")
    });

    ValidatedRequest {
        request,
        accepted,
        rejected_count: i64::try_from(rejected).unwrap_or(i64::MAX),
        error_message,
    }
}

struct Submission {
    request: ExportTraceServiceRequest,
    spans: usize,
    received_at: DateTime<Utc>,
}

/// Cloneable handle receivers use to queue requests for batching.
#[derive(Clone)]
pub struct BatchSender {
    tx: mpsc::Sender<Submission>,
}

impl BatchSender {
    /// Queue a validated request.
    ///
    /// Requests without spans are acknowledged and never exported.
    ///
    /// # Errors
    ///
    /// [`PipelineError::QueueFull`] when the processor is saturated and
    /// [`PipelineError::Closed`] after shutdown.
    pub fn submit(
        &self,
        request: ExportTraceServiceRequest,
        protocol: WireProtocol,
    ) -> Result<(), PipelineError> {
        let spans = count_spans(&request);
        if spans == 0 {
            tracing::debug!(protocol = %protocol, "Empty trace request acknowledged");
            return Ok(());
        }

        let submission = Submission {
            request,
            spans,
            received_at: Utc::now(),
        };
        match self.tx.try_send(submission) {
            Ok(()) => {
                metrics::counter!("trace_archive.receiver.spans", "protocol" => protocol.as_str())
                    .increment(spans as u64);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(PipelineError::QueueFull {
                message: format!("batch queue full, {spans} spans refused"),
            }),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(PipelineError::Closed {
                component: "batch processor",
            }),
        }
    }
}

/// Handle for the running batch processor.
pub struct BatchProcessorHandle {
    cancel: CancellationToken,
    join_handle: JoinHandle<()>,
}

impl BatchProcessorHandle {
    /// Stop accepting requests, export everything queued and wait for
    /// in-flight exports.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.join_handle.await;
    }
}

/// Start the batch processor task.
pub fn start_batch_processor(
    config: &ReceiverConfig,
    exporter: Arc<Exporter>,
) -> (BatchSender, BatchProcessorHandle) {
    let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
    let cancel = CancellationToken::new();
    let processor = BatchProcessor {
        rx,
        exporter,
        send_batch_size: config.send_batch_size.max(1),
        timeout: config.timeout(),
        export_permits: Arc::new(Semaphore::new(config.export_concurrency.max(1))),
        exports: JoinSet::new(),
        window: Window::default(),
    };
    let join_handle = tokio::spawn(processor.run(cancel.clone()));

    (
        BatchSender { tx },
        BatchProcessorHandle {
            cancel,
            join_handle,
        },
    )
}

#[derive(Default)]
struct Window {
    requests: Vec<ExportTraceServiceRequest>,
    spans: usize,
    opened: Option<(Instant, DateTime<Utc>)>,
}

struct BatchProcessor {
    rx: mpsc::Receiver<Submission>,
    exporter: Arc<Exporter>,
    send_batch_size: usize,
    timeout: std::time::Duration,
    export_permits: Arc<Semaphore>,
    exports: JoinSet<()>,
    window: Window,
}

impl BatchProcessor {
    async fn run(mut self, cancel: CancellationToken) {
        tracing::info!(
            send_batch_size = self.send_batch_size,
            timeout_ms = self.timeout.as_millis(),
            "Starting batch processor"
        );

        loop {
            let deadline = self.window.opened.map(|(at, _)| at + self.timeout);
            tokio::select! {
                maybe = self.rx.recv() => match maybe {
                    Some(submission) => self.add(submission).await,
                    None => break,
                },
                () = sleep_until_opt(deadline) => self.seal().await,
                () = cancel.cancelled() => {
                    self.rx.close();
                    while let Some(submission) = self.rx.recv().await {
                        self.add(submission).await;
                    }
                    break;
                }
            }
            while self.exports.try_join_next().is_some() {}
        }

        self.seal().await;
        while self.exports.join_next().await.is_some() {}
        tracing::info!("Batch processor stopped");
    }

    async fn add(&mut self, submission: Submission) {
        if self.window.opened.is_none() {
            self.window.opened = Some((Instant::now(), submission.received_at));
        }
        self.window.spans += submission.spans;
        self.window.requests.push(submission.request);

        if self.window.spans >= self.send_batch_size {
            self.seal().await;
        }
    }

    /// Close the current window and hand its batch to an export task.
    async fn seal(&mut self) {
        let window = std::mem::take(&mut self.window);
        let Some((_, received_at)) = window.opened else {
            return;
        };

        let batch = match TraceBatch::from_requests(window.requests, received_at) {
            Ok(batch) => batch,
            Err(e) => {
                tracing::error!(error = %e, spans = window.spans, "Failed to encode trace batch");
                return;
            }
        };

        let Ok(permit) = self.export_permits.clone().acquire_owned().await else {
            return;
        };
        let exporter = self.exporter.clone();
        self.exports.spawn(async move {
            let report = exporter.export(&batch).await;
            if !report.all_succeeded() {
                tracing::warn!(
                    batch_id = %batch.id(),
                    failed = ?report.failed_sinks(),
                    "Trace batch not delivered to every sink"
                );
            }
            drop(permit);
        });
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::{span, trace_request, RecordingSink};
    use std::time::Duration;

    fn receiver_config(send_batch_size: usize, timeout_ms: u64) -> ReceiverConfig {
        ReceiverConfig {
            send_batch_size,
            timeout_ms,
            queue_capacity: 4,
            ..ReceiverConfig::default()
        }
    }

    fn exporter_with(sink: Arc<RecordingSink>) -> Arc<Exporter> {
        Arc::new(Exporter::new(vec![sink], &ReceiverConfig::default()))
    }

    #[test]
    fn batch_merges_requests_in_order() {
        let first = trace_request("svc-a", vec![span(1, "a")]);
        let second = trace_request("svc-b", vec![span(2, "b"), span(3, "c")]);

        let batch = TraceBatch::from_requests(vec![first, second], Utc::now()).unwrap();

        assert_eq!(batch.span_count(), 3);
        assert_eq!(batch.protocol_version(), "v1");
        let names: Vec<&str> = batch
            .request()
            .resource_spans
            .iter()
            .flat_map(|rs| &rs.scope_spans)
            .flat_map(|ss| &ss.spans)
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);

        let decoded: ExportTraceServiceRequest = serde_json::from_slice(batch.payload()).unwrap();
        assert_eq!(&decoded, batch.request());
    }

    #[test]
    fn validation_drops_malformed_spans() {
        let mut bad = span(9, "bad");
        bad.trace_id = vec![1, 2, 3];
        let request = trace_request("svc", vec![span(1, "good"), bad]);

        let validated = validate_request(request);

        assert_eq!(validated.accepted, 1);
        assert_eq!(validated.rejected_count, 1);
        assert!(validated.error_message.is_some());
    }

    #[test]
    fn validation_removes_emptied_resources() {
        let mut bad = span(9, "bad");
        bad.span_id = vec![];
        let validated = validate_request(trace_request("svc", vec![bad]));

        assert_eq!(validated.accepted, 0);
        assert!(validated.request.resource_spans.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn window_closes_on_timeout() {
        let sink = Arc::new(RecordingSink::new("index"));
        let (sender, handle) =
            start_batch_processor(&receiver_config(100, 200), exporter_with(sink.clone()));

        sender
            .submit(trace_request("svc", vec![span(1, "a")]), WireProtocol::Grpc)
            .unwrap();
        sender
            .submit(trace_request("svc", vec![span(2, "b")]), WireProtocol::HttpJson)
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sink.batches().len(), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let batches = sink.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].span_count(), 2);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn window_closes_on_size() {
        let sink = Arc::new(RecordingSink::new("index"));
        let (sender, handle) =
            start_batch_processor(&receiver_config(2, 60_000), exporter_with(sink.clone()));

        for i in 0..4 {
            sender
                .submit(trace_request("svc", vec![span(i, "s")]), WireProtocol::Grpc)
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        let batches = sink.batches();
        assert_eq!(batches.len(), 2);
        assert!(batches.iter().all(|b| b.span_count() == 2));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn empty_request_is_never_exported() {
        let sink = Arc::new(RecordingSink::new("index"));
        let (sender, handle) =
            start_batch_processor(&receiver_config(1, 10), exporter_with(sink.clone()));

        sender
            .submit(ExportTraceServiceRequest::default(), WireProtocol::HttpProtobuf)
            .unwrap();
        handle.shutdown().await;

        assert!(sink.batches().is_empty());
    }

    #[tokio::test]
    async fn shutdown_exports_partial_window() {
        let sink = Arc::new(RecordingSink::new("index"));
        let (sender, handle) =
            start_batch_processor(&receiver_config(100, 60_000), exporter_with(sink.clone()));

        sender
            .submit(trace_request("svc", vec![span(1, "a")]), WireProtocol::Grpc)
            .unwrap();
        handle.shutdown().await;

        assert_eq!(sink.batches().len(), 1);
        assert!(matches!(
            sender.submit(trace_request("svc", vec![span(2, "b")]), WireProtocol::Grpc),
            Err(PipelineError::Closed { .. })
        ));
    }

    #[tokio::test]
    async fn full_queue_applies_backpressure() {
        let (tx, _rx) = mpsc::channel(1);
        let sender = BatchSender { tx };

        sender
            .submit(trace_request("svc", vec![span(1, "a")]), WireProtocol::Grpc)
            .unwrap();
        let result = sender.submit(trace_request("svc", vec![span(2, "b")]), WireProtocol::Grpc);

        assert!(matches!(result, Err(PipelineError::QueueFull { .. })));
    }
}
