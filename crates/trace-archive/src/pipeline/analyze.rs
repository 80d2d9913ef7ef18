//! Analysis: turns one extraction record into archival records.
//!
//! Every task yields a trace-analysis record. `llm_call` tasks also yield a
//! prompt record, and feedback tasks carrying a feedback value yield a
//! ground-truth record. Each record is submitted to the stream of its class;
//! any rejection fails the whole invocation.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;

use super::extract::{ExtractionRecord, TaskKind, TaskRecord};
use super::invoke::Invocable;
use crate::config::stream_names;
use crate::stream::StreamRegistry;
use crate::PipelineError;

/// Which stream an analysis record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordClass {
    TraceAnalysis,
    Prompt,
    GroundTruth,
}

impl RecordClass {
    pub const fn stream_name(self) -> &'static str {
        match self {
            Self::TraceAnalysis => stream_names::TRACE_ANALYSIS,
            Self::Prompt => stream_names::PROMPTS,
            Self::GroundTruth => stream_names::GROUND_TRUTH,
        }
    }
}

/// A task record with the analysis verdicts attached.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceAnalysisRecord {
    pub source: String,
    #[serde(flatten)]
    pub task: TaskRecord,
    pub dialogue_turns: Option<usize>,
    pub valid_template: Option<bool>,
    pub llm_security_issue_found: Option<bool>,
    pub llm_answered_question: Option<bool>,
}

/// One prompt/completion pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromptRecord {
    pub trace_id: String,
    pub span_id: String,
    pub app: String,
    pub workflow: Option<String>,
    pub model: Option<String>,
    pub prompt: Option<String>,
    pub completion: Option<String>,
    pub start_time: u64,
    pub end_time: u64,
}

/// User feedback on a conversation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroundTruthRecord {
    pub trace_id: String,
    pub app: String,
    pub model: Option<String>,
    pub conversation: Option<String>,
    pub feedback: Value,
    pub recorded_at: u64,
}

/// Output of analysis, one per archived line.
#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisRecord {
    TraceAnalysis(TraceAnalysisRecord),
    Prompt(PromptRecord),
    GroundTruth(GroundTruthRecord),
}

impl AnalysisRecord {
    pub const fn class(&self) -> RecordClass {
        match self {
            Self::TraceAnalysis(_) => RecordClass::TraceAnalysis,
            Self::Prompt(_) => RecordClass::Prompt,
            Self::GroundTruth(_) => RecordClass::GroundTruth,
        }
    }

    pub fn to_json(&self) -> Result<Bytes, PipelineError> {
        let encoded = match self {
            Self::TraceAnalysis(r) => serde_json::to_vec(r),
            Self::Prompt(r) => serde_json::to_vec(r),
            Self::GroundTruth(r) => serde_json::to_vec(r),
        };
        encoded
            .map(Bytes::from)
            .map_err(|e| PipelineError::JsonEncode { source: e })
    }
}

/// Checks an infrastructure template found in a completion.
pub trait TemplateValidator: Send + Sync {
    fn validate(&self, template: &str) -> bool;
}

/// Accepts templates with a top-level `Resources:` section holding at least
/// one indented entry.
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuralTemplateValidator;

impl TemplateValidator for StructuralTemplateValidator {
    fn validate(&self, template: &str) -> bool {
        let mut lines = template.lines().skip_while(|l| l.trim_end() != "Resources:");
        if lines.next().is_none() {
            return false;
        }
        lines
            .filter(|l| !l.trim().is_empty())
            .take_while(|l| l.starts_with(' ') || l.starts_with('\t'))
            .any(|l| l.trim_end().ends_with(':'))
    }
}

/// Verdicts from reviewing a template against its conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evaluation {
    pub security_issue_found: bool,
    pub answered_question: bool,
}

/// Reviews a generated template, typically by asking another model.
#[async_trait]
pub trait ResponseEvaluator: Send + Sync {
    /// `None` means no verdict; the record keeps null fields.
    async fn evaluate(
        &self,
        conversation: &str,
        template: &str,
    ) -> Result<Option<Evaluation>, PipelineError>;
}

/// Evaluator that never produces a verdict.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoEvaluator;

#[async_trait]
impl ResponseEvaluator for NoEvaluator {
    async fn evaluate(&self, _: &str, _: &str) -> Result<Option<Evaluation>, PipelineError> {
        Ok(None)
    }
}

/// Number of user turns before the current one.
pub fn dialogue_turns(prompt: &str) -> usize {
    prompt.matches("Human:").count().saturating_sub(1)
}

/// Body of the last ```` ```yaml ```` block in a completion.
pub fn yaml_block(completion: &str) -> Option<&str> {
    let (_, after) = completion.rsplit_once("```yaml")?;
    Some(after.split("```").next().unwrap_or(after))
}

/// The analysis function.
pub struct Analyzer {
    streams: Arc<StreamRegistry>,
    validator: Arc<dyn TemplateValidator>,
    evaluator: Arc<dyn ResponseEvaluator>,
}

impl Analyzer {
    pub fn new(streams: Arc<StreamRegistry>) -> Self {
        Self {
            streams,
            validator: Arc::new(StructuralTemplateValidator),
            evaluator: Arc::new(NoEvaluator),
        }
    }

    #[must_use]
    pub fn with_validator(mut self, validator: Arc<dyn TemplateValidator>) -> Self {
        self.validator = validator;
        self
    }

    #[must_use]
    pub fn with_evaluator(mut self, evaluator: Arc<dyn ResponseEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    /// Derive every archival record for an extraction record.
    pub async fn analyze(&self, record: &ExtractionRecord) -> Vec<AnalysisRecord> {
        let mut records = Vec::new();
        for task in &record.tasks {
            let mut analysis = TraceAnalysisRecord {
                source: record.source.clone(),
                task: task.clone(),
                dialogue_turns: None,
                valid_template: None,
                llm_security_issue_found: None,
                llm_answered_question: None,
            };

            match task.kind {
                TaskKind::LlmCall => {
                    self.analyze_llm_call(task, &mut analysis).await;
                    records.push(AnalysisRecord::Prompt(PromptRecord {
                        trace_id: task.trace_id.clone(),
                        span_id: task.span_id.clone(),
                        app: task.app.clone(),
                        workflow: task.workflow.clone(),
                        model: task.model.clone(),
                        prompt: task.full_prompt.clone(),
                        completion: task.completion.clone(),
                        start_time: task.start_time,
                        end_time: task.end_time,
                    }));
                }
                TaskKind::Feedback => {
                    if let Some(feedback) = task.feedback.clone().filter(|f| !f.is_null()) {
                        records.push(AnalysisRecord::GroundTruth(GroundTruthRecord {
                            trace_id: task.trace_id.clone(),
                            app: task.app.clone(),
                            model: task.model.clone(),
                            conversation: task.conversation.clone(),
                            feedback,
                            recorded_at: task.end_time,
                        }));
                    }
                }
                TaskKind::Toxicity | TaskKind::Other => {}
            }

            records.push(AnalysisRecord::TraceAnalysis(analysis));
        }
        records
    }

    async fn analyze_llm_call(&self, task: &TaskRecord, analysis: &mut TraceAnalysisRecord) {
        let prompt = task.full_prompt.as_deref().unwrap_or_default();
        analysis.dialogue_turns = Some(dialogue_turns(prompt));

        let Some(template) = task.completion.as_deref().and_then(yaml_block) else {
            return;
        };
        analysis.valid_template = Some(self.validator.validate(template));

        let conversation = prompt.replace("Human:", "H:").replace("Assistant:", "A:");
        match self.evaluator.evaluate(&conversation, template).await {
            Ok(Some(evaluation)) => {
                analysis.llm_security_issue_found = Some(evaluation.security_issue_found);
                analysis.llm_answered_question = Some(evaluation.answered_question);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(trace_id = %task.trace_id, error = %e, "Template evaluation failed");
            }
        }
    }

    /// Submit records to their streams, one batch per stream.
    async fn submit(&self, records: &[AnalysisRecord]) -> Result<usize, PipelineError> {
        for class in [RecordClass::TraceAnalysis, RecordClass::Prompt, RecordClass::GroundTruth] {
            let lines = records
                .iter()
                .filter(|r| r.class() == class)
                .map(AnalysisRecord::to_json)
                .collect::<Result<Vec<_>, _>>()?;
            if lines.is_empty() {
                continue;
            }
            self.streams
                .require(class.stream_name())?
                .put_record_batch(lines)
                .await?;
        }
        Ok(records.len())
    }
}

#[async_trait]
impl Invocable for Analyzer {
    type Input = ExtractionRecord;
    type Output = usize;

    fn stage(&self) -> &'static str {
        "analysis"
    }

    async fn invoke(&self, input: &ExtractionRecord) -> Result<usize, PipelineError> {
        let records = self.analyze(input).await;
        self.submit(&records).await
    }
}
