//! Extraction: turns one raw trace object into a normalised task record set.
//!
//! Only spans under the task instrumentation scope whose name contains `task`
//! are kept. Workflow and task names come from the `traceloop.workflow.name`
//! and `traceloop.entity.name` attributes; the task's input and output are JSON
//! documents in `traceloop.entity.input` and `traceloop.entity.output`, read
//! according to the task kind:
//!
//! | kind       | input                          | output                              |
//! |------------|--------------------------------|-------------------------------------|
//! | `llm_call` | `args[0]` prompt, `args[1]` model | completion                       |
//! | `toxicity` | `args[0]` user input           | `[0]` toxicity verdict              |
//! | `feedback` | `args[0]` feedback             | `model_id`, `messages` conversation |
//!
//! Extraction is a pure function of the object bytes, so re-running it on the
//! same object always yields the same result.

use std::sync::Arc;

use async_trait::async_trait;
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use opentelemetry_proto::tonic::common::v1::{any_value, KeyValue};
use opentelemetry_proto::tonic::trace::v1::Span;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::invoke::Invocable;
use crate::sink::{ObjectCreated, ObjectSink};
use crate::PipelineError;

const WORKFLOW_NAME: &str = "traceloop.workflow.name";
const ENTITY_NAME: &str = "traceloop.entity.name";
const ENTITY_INPUT: &str = "traceloop.entity.input";
const ENTITY_OUTPUT: &str = "traceloop.entity.output";
const SERVICE_NAME: &str = "service.name";

/// What an instrumented task did, derived from its task name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    LlmCall,
    Toxicity,
    Feedback,
    Other,
}

impl TaskKind {
    pub fn classify(task_name: &str) -> Self {
        if task_name.contains("feedback") {
            Self::Feedback
        } else if task_name.contains("toxicity") {
            Self::Toxicity
        } else if task_name.contains("llm_call") {
            Self::LlmCall
        } else {
            Self::Other
        }
    }
}

/// One instrumented task span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub app: String,
    pub trace_id: String,
    pub span_id: String,
    pub start_time: u64,
    pub end_time: u64,
    pub workflow: Option<String>,
    pub task: String,
    pub kind: TaskKind,
    pub user_input: Option<Value>,
    pub toxicity_detected: Option<Value>,
    pub full_prompt: Option<String>,
    pub model: Option<String>,
    pub completion: Option<String>,
    pub feedback: Option<Value>,
    pub conversation: Option<String>,
}

/// Task records of one raw trace object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionRecord {
    /// Path of the raw trace object.
    pub source: String,
    /// App of the first resource in the object.
    pub app: String,
    pub tasks: Vec<TaskRecord>,
}

/// Outcome of extracting one object. Only `Success` travels downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExtractionResult {
    Success(ExtractionRecord),
    Failure { error: String },
}

impl ExtractionResult {
    fn failure(error: impl Into<String>) -> Self {
        Self::Failure {
            error: error.into(),
        }
    }

    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

/// Extract task records from the OTLP/JSON bytes of a raw trace object.
pub fn extract(source: &str, bytes: &[u8], task_scope: &str) -> ExtractionResult {
    let request: ExportTraceServiceRequest = match serde_json::from_slice(bytes) {
        Ok(request) => request,
        Err(e) => return ExtractionResult::failure(format!("invalid OTLP/JSON trace object: {e}")),
    };
    if request.resource_spans.is_empty() {
        return ExtractionResult::failure("trace object contains no resource spans");
    }

    let mut first_app = None;
    let mut tasks = Vec::new();
    for resource_spans in &request.resource_spans {
        let attributes = resource_spans
            .resource
            .as_ref()
            .map(|r| r.attributes.as_slice())
            .unwrap_or_default();
        let app = app_name(attributes);
        if first_app.is_none() {
            first_app.clone_from(&app);
        }

        let mut task_spans = resource_spans
            .scope_spans
            .iter()
            .filter(|ss| ss.scope.as_ref().is_some_and(|s| s.name == task_scope))
            .flat_map(|ss| &ss.spans)
            .filter(|span| span.name.contains("task"))
            .peekable();
        if task_spans.peek().is_none() {
            continue;
        }
        let Some(app) = app else {
            tracing::warn!(
                source,
                spans = task_spans.count(),
                "Skipping task spans from a resource with no attribute naming the app"
            );
            continue;
        };
        for span in task_spans {
            match task_record(&app, span) {
                Ok(record) => tasks.push(record),
                Err(error) => return ExtractionResult::failure(error),
            }
        }
    }

    ExtractionResult::Success(ExtractionRecord {
        source: source.to_owned(),
        app: first_app.unwrap_or_default(),
        tasks,
    })
}

/// `service.name` if present, otherwise the first string resource attribute.
fn app_name(attributes: &[KeyValue]) -> Option<String> {
    attributes
        .iter()
        .find(|kv| kv.key == SERVICE_NAME)
        .and_then(string_value)
        .or_else(|| attributes.iter().find_map(string_value))
        .map(str::to_owned)
}

fn string_value(kv: &KeyValue) -> Option<&str> {
    match kv.value.as_ref()?.value.as_ref()? {
        any_value::Value::StringValue(s) => Some(s.as_str()),
        _ => None,
    }
}

fn attribute<'a>(span: &'a Span, key: &str) -> Option<&'a str> {
    span.attributes
        .iter()
        .find(|kv| kv.key == key)
        .and_then(string_value)
}

fn json_attribute(span: &Span, key: &str) -> Result<Option<Value>, String> {
    attribute(span, key)
        .map(|raw| {
            serde_json::from_str(raw).map_err(|e| {
                format!("span {}: {key} is not valid JSON: {e}", hex::encode(&span.span_id))
            })
        })
        .transpose()
}

/// Render a JSON value as text, unquoting plain strings.
fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Turn chat messages into a `Human:` / `Assistant:` transcript.
pub fn format_history(messages: &[Value]) -> String {
    messages
        .iter()
        .map(|message| {
            let content = message.get("content").map(as_text).unwrap_or_default();
            let speaker = match message.get("role").and_then(Value::as_str) {
                Some("assistant") => "Assistant",
                _ => "Human",
            };
            format!("{speaker}:\n{content}\n\n")
        })
        .collect()
}

fn task_record(app: &str, span: &Span) -> Result<TaskRecord, String> {
    let task = attribute(span, ENTITY_NAME)
        .unwrap_or(span.name.as_str())
        .to_owned();
    let kind = TaskKind::classify(&task);
    let input = json_attribute(span, ENTITY_INPUT)?;
    let output = json_attribute(span, ENTITY_OUTPUT)?;
    let arg = |i: usize| input.as_ref().and_then(|v| v.get("args")).and_then(|a| a.get(i));

    let mut record = TaskRecord {
        app: app.to_owned(),
        trace_id: hex::encode(&span.trace_id),
        span_id: hex::encode(&span.span_id),
        start_time: span.start_time_unix_nano,
        end_time: span.end_time_unix_nano,
        workflow: attribute(span, WORKFLOW_NAME).map(str::to_owned),
        task,
        kind,
        user_input: None,
        toxicity_detected: None,
        full_prompt: None,
        model: None,
        completion: None,
        feedback: None,
        conversation: None,
    };

    match kind {
        TaskKind::Feedback => {
            record.feedback = arg(0).cloned();
            if let Some(output) = &output {
                record.model = output.get("model_id").map(as_text);
                record.conversation = output
                    .get("messages")
                    .and_then(Value::as_array)
                    .map(|m| format_history(m));
            }
        }
        TaskKind::Toxicity => {
            record.user_input = arg(0).cloned();
            record.toxicity_detected = output.as_ref().and_then(|o| o.get(0)).cloned();
        }
        TaskKind::LlmCall => {
            record.full_prompt = arg(0).map(as_text);
            record.model = arg(1).map(as_text);
            record.completion = output.as_ref().map(as_text);
        }
        TaskKind::Other => {}
    }

    Ok(record)
}

/// The extraction function: reads a raw trace object and extracts it.
pub struct Extractor {
    objects: Arc<ObjectSink>,
    task_scope: String,
}

impl Extractor {
    pub fn new(objects: Arc<ObjectSink>, task_scope: impl Into<String>) -> Self {
        Self {
            objects,
            task_scope: task_scope.into(),
        }
    }
}

#[async_trait]
impl Invocable for Extractor {
    type Input = ObjectCreated;
    type Output = ExtractionResult;

    fn stage(&self) -> &'static str {
        "extraction"
    }

    async fn invoke(&self, input: &ObjectCreated) -> Result<ExtractionResult, PipelineError> {
        let bytes = self.objects.get(&input.path).await?;
        Ok(extract(input.path.as_ref(), &bytes, &self.task_scope))
    }
}
