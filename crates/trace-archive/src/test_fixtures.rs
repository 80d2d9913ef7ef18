//! Shared builders, fixtures and fake sinks for unit tests.
//!
//! ```text
//! objects ──► streams ──► analyzer
//!    │
//!    └──► raw_object_bytes / task spans (extraction input)
//! ```

use std::io::Read;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use object_store::memory::InMemory;
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use opentelemetry_proto::tonic::common::v1::{any_value, AnyValue, InstrumentationScope, KeyValue};
use opentelemetry_proto::tonic::resource::v1::Resource;
use opentelemetry_proto::tonic::trace::v1::{ResourceSpans, ScopeSpans, Span};
use rstest::fixture;
use serde_json::json;
use tempfile::TempDir;

use crate::config::StreamsConfig;
use crate::pipeline::{TaskKind, TaskRecord};
use crate::receiver::TraceBatch;
use crate::sink::{ExportSink, ObjectSink};
use crate::stream::StreamRegistry;
use crate::PipelineError;

/// Model id used by every task span builder.
pub const TEST_MODEL: &str = "anthropic.claude-v2";

/// In-memory object sink.
#[fixture]
pub fn objects() -> Arc<ObjectSink> {
    Arc::new(ObjectSink::new(Arc::new(InMemory::new())))
}

/// The default four streams over `objects`.
#[fixture]
pub fn streams(objects: Arc<ObjectSink>) -> Arc<StreamRegistry> {
    Arc::new(StreamRegistry::new(&StreamsConfig::default().streams, objects))
}

/// A local object sink whose `blocked` top-level directory is a regular file,
/// so every write under `blocked/` fails.
pub fn blocked_prefix_sink(blocked: &str) -> (TempDir, Arc<ObjectSink>) {
    let dir = tempfile::tempdir().expect("failed to create temp directory");
    std::fs::write(dir.path().join(blocked), b"not a directory").expect("failed to block prefix");
    let store = object_store::local::LocalFileSystem::new_with_prefix(dir.path())
        .expect("failed to create local store");
    (dir, Arc::new(ObjectSink::new(Arc::new(store))))
}

pub fn string_value(value: &str) -> AnyValue {
    AnyValue {
        value: Some(any_value::Value::StringValue(value.to_owned())),
    }
}

fn kv(key: &str, value: &str) -> KeyValue {
    KeyValue {
        key: key.to_owned(),
        value: Some(string_value(value)),
    }
}

/// A plain span with ids derived from `seed`.
pub fn span(seed: u8, name: &str) -> Span {
    Span {
        trace_id: vec![seed; 16],
        span_id: vec![seed; 8],
        name: name.to_owned(),
        start_time_unix_nano: 1_700_000_000_000_000_000,
        end_time_unix_nano: 1_700_000_001_000_000_000,
        ..Default::default()
    }
}

/// A request with one resource and one scope holding `spans`.
pub fn trace_request(service: &str, spans: Vec<Span>) -> ExportTraceServiceRequest {
    ExportTraceServiceRequest {
        resource_spans: vec![ResourceSpans {
            resource: Some(Resource {
                attributes: vec![kv("service.name", service)],
                ..Default::default()
            }),
            scope_spans: vec![ScopeSpans {
                spans,
                ..Default::default()
            }],
            ..Default::default()
        }],
    }
}

/// A batch of `spans` plain spans.
pub fn sample_batch(spans: u8) -> TraceBatch {
    let spans = (0..spans).map(|i| span(i, "work")).collect();
    TraceBatch::from_requests(vec![trace_request("svc", spans)], Utc::now())
        .expect("batch should encode")
}

fn task_span(seed: u8, task: &str, input: &serde_json::Value, output: &serde_json::Value) -> Span {
    let mut span = span(seed, &format!("{task}.task"));
    span.attributes = vec![
        kv("traceloop.workflow.name", "cfn_chat"),
        kv("traceloop.entity.name", task),
        kv("traceloop.entity.input", &input.to_string()),
        kv("traceloop.entity.output", &output.to_string()),
    ];
    span
}

pub fn llm_call_span(seed: u8, prompt: &str, completion: &str) -> Span {
    task_span(
        seed,
        "llm_call",
        &json!({ "args": [prompt, TEST_MODEL], "kwargs": {} }),
        &json!(completion),
    )
}

pub fn feedback_span(seed: u8, feedback: &str) -> Span {
    task_span(
        seed,
        "cfn_user_feedback",
        &json!({ "args": [feedback] }),
        &json!({
            "model_id": TEST_MODEL,
            "messages": [
                { "role": "user", "content": "make a bucket" },
                { "role": "assistant", "content": "here it is" },
            ],
            "user_feedback": 1,
        }),
    )
}

pub fn toxicity_span(seed: u8, input: &str, verdict: bool) -> Span {
    task_span(seed, "toxicity_check", &json!({ "args": [input] }), &json!([verdict]))
}

/// Scope spans under the task instrumentation scope.
pub fn task_scope_spans(spans: Vec<Span>) -> ScopeSpans {
    ScopeSpans {
        scope: Some(InstrumentationScope {
            name: "traceloop.tracer".to_owned(),
            ..Default::default()
        }),
        spans,
        ..Default::default()
    }
}

/// OTLP/JSON bytes of a raw trace object for `app`.
pub fn raw_object_bytes(app: &str, scope_spans: Vec<ScopeSpans>) -> Vec<u8> {
    let request = ExportTraceServiceRequest {
        resource_spans: vec![ResourceSpans {
            resource: Some(Resource {
                attributes: vec![kv("service.name", app)],
                ..Default::default()
            }),
            scope_spans,
            ..Default::default()
        }],
    };
    serde_json::to_vec(&request).expect("request should encode")
}

/// A task record with only identity fields set.
pub fn task_record(kind: TaskKind) -> TaskRecord {
    let task = match kind {
        TaskKind::LlmCall => "llm_call",
        TaskKind::Toxicity => "toxicity_check",
        TaskKind::Feedback => "cfn_user_feedback",
        TaskKind::Other => "retrieve",
    };
    TaskRecord {
        app: "app1".to_owned(),
        trace_id: hex::encode([7u8; 16]),
        span_id: hex::encode([7u8; 8]),
        start_time: 1,
        end_time: 2,
        workflow: Some("cfn_chat".to_owned()),
        task: task.to_owned(),
        kind,
        user_input: None,
        toxicity_detected: None,
        full_prompt: None,
        model: Some(TEST_MODEL.to_owned()),
        completion: None,
        feedback: None,
        conversation: None,
    }
}

/// Decompress a gzip object into its lines.
pub fn gunzip_lines(data: &[u8]) -> Vec<String> {
    let mut text = String::new();
    flate2::read::GzDecoder::new(data)
        .read_to_string(&mut text)
        .expect("object should be gzip");
    text.lines().map(str::to_owned).collect()
}

/// Sink that records every batch it receives.
pub struct RecordingSink {
    name: String,
    batches: Mutex<Vec<TraceBatch>>,
}

impl RecordingSink {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            batches: Mutex::new(Vec::new()),
        }
    }

    pub fn batches(&self) -> Vec<TraceBatch> {
        self.batches.lock().expect("lock poisoned").clone()
    }
}

#[async_trait]
impl ExportSink for RecordingSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn export(&self, batch: &TraceBatch) -> Result<(), PipelineError> {
        self.batches.lock().expect("lock poisoned").push(batch.clone());
        Ok(())
    }
}

/// Sink that never answers.
pub struct HangingSink {
    name: String,
}

impl HangingSink {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
        }
    }
}

#[async_trait]
impl ExportSink for HangingSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn export(&self, _: &TraceBatch) -> Result<(), PipelineError> {
        std::future::pending().await
    }
}

/// Sink that fails a fixed number of times before succeeding.
pub struct FlakySink {
    name: String,
    failures: u32,
    calls: AtomicU32,
    delivered: AtomicU32,
}

impl FlakySink {
    pub fn new(name: &str, failures: u32) -> Self {
        Self {
            name: name.to_owned(),
            failures,
            calls: AtomicU32::new(0),
            delivered: AtomicU32::new(0),
        }
    }

    pub fn delivered(&self) -> u32 {
        self.delivered.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExportSink for FlakySink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn export(&self, _: &TraceBatch) -> Result<(), PipelineError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
            return Err(PipelineError::Export {
                sink: self.name.clone(),
                message: "injected failure".to_owned(),
            });
        }
        self.delivered.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn fixtures_compose(streams: Arc<StreamRegistry>) {
        assert_eq!(streams.stats().len(), 4);
    }

    #[rstest]
    #[tokio::test]
    async fn blocked_prefix_rejects_writes() {
        let (_dir, objects) = blocked_prefix_sink("promptarchive");
        let path = object_store::path::Path::from("promptarchive/app1/x");
        assert!(objects.put(&path, bytes::Bytes::new()).await.is_err());
        let ok = object_store::path::Path::from("gtarchive/app1/x");
        assert!(objects.put(&ok, bytes::Bytes::new()).await.is_ok());
    }
}
