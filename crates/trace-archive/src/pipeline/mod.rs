//! Extraction and analysis stages.
//!
//! ```text
//! ObjectSink ─► ExtractionTrigger ─► extraction stage ─► analysis stage ─► streams
//!                  (otel-traces/)      Success only         fail loud
//! ```
//!
//! Stages are tokio tasks joined by channels. Each runs up to `concurrency`
//! invocations at once under the invocation policy. Shutdown cascades: the
//! trigger stops on cancellation, and each stage drains its queue and waits
//! for its invocations before closing the next stage's channel.

pub mod analyze;
pub mod extract;
pub mod invoke;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

pub use analyze::{
    AnalysisRecord, Analyzer, Evaluation, NoEvaluator, RecordClass, ResponseEvaluator,
    StructuralTemplateValidator, TemplateValidator,
};
pub use extract::{extract, ExtractionRecord, ExtractionResult, Extractor, TaskKind, TaskRecord};
pub use invoke::{invoke_with_policy, Invocable, InvocationPolicy};

use crate::config::PipelineConfig;
use crate::sink::{ObjectCreated, ObjectSink};
use crate::trigger::ExtractionTrigger;
use crate::PipelineError;

/// Counters across both stages.
#[derive(Debug, Default)]
pub struct PipelineStats {
    extraction_invocations: AtomicU64,
    extraction_failures: AtomicU64,
    extraction_errors: AtomicU64,
    analysis_invocations: AtomicU64,
    analysis_errors: AtomicU64,
    records_submitted: AtomicU64,
}

/// Plain copy of [`PipelineStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PipelineSnapshot {
    /// Objects extracted, whatever the result.
    pub extraction_invocations: u64,
    /// Extractions that returned `Failure`.
    pub extraction_failures: u64,
    /// Extractions that could not run after every retry.
    pub extraction_errors: u64,
    pub analysis_invocations: u64,
    pub analysis_errors: u64,
    pub records_submitted: u64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> PipelineSnapshot {
        PipelineSnapshot {
            extraction_invocations: self.extraction_invocations.load(Ordering::SeqCst),
            extraction_failures: self.extraction_failures.load(Ordering::SeqCst),
            extraction_errors: self.extraction_errors.load(Ordering::SeqCst),
            analysis_invocations: self.analysis_invocations.load(Ordering::SeqCst),
            analysis_errors: self.analysis_errors.load(Ordering::SeqCst),
            records_submitted: self.records_submitted.load(Ordering::SeqCst),
        }
    }
}

/// Handle for the running trigger and stages.
pub struct PipelineHandle {
    cancel: CancellationToken,
    stats: Arc<PipelineStats>,
    tasks: Vec<JoinHandle<()>>,
}

impl PipelineHandle {
    pub fn stats(&self) -> PipelineSnapshot {
        self.stats.snapshot()
    }

    /// Stop the trigger and wait until every triggered object has been
    /// extracted and analysed.
    pub async fn shutdown(self) -> PipelineSnapshot {
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
        self.stats.snapshot()
    }
}

/// Subscribe the trigger and start both stages.
pub fn start_pipeline(
    config: &PipelineConfig,
    objects: Arc<ObjectSink>,
    analyzer: Analyzer,
) -> PipelineHandle {
    let cancel = CancellationToken::new();
    let stats = Arc::new(PipelineStats::default());
    let policy = InvocationPolicy::from_config(config);
    let concurrency = config.concurrency.max(1);

    let trigger = ExtractionTrigger::subscribe(&objects, &config.trigger_prefix);
    let extractor = Arc::new(Extractor::new(objects, config.task_scope.clone()));
    let analyzer = Arc::new(analyzer);

    let (extract_tx, extract_rx) = mpsc::unbounded_channel();
    let (analyze_tx, analyze_rx) = mpsc::unbounded_channel();

    let trigger_task = tokio::spawn(trigger.run(extract_tx, cancel.clone()));

    let extraction_stats = stats.clone();
    let extraction_task = tokio::spawn(run_stage(
        extractor,
        extract_rx,
        policy.clone(),
        concurrency,
        move |event: &ObjectCreated, outcome: Result<ExtractionResult, PipelineError>| {
            extraction_stats
                .extraction_invocations
                .fetch_add(1, Ordering::SeqCst);
            match outcome {
                Ok(ExtractionResult::Success(record)) => {
                    tracing::debug!(
                        path = %event.path,
                        tasks = record.tasks.len(),
                        "Extraction succeeded"
                    );
                    if analyze_tx.send(record).is_err() {
                        tracing::warn!(
                            path = %event.path,
                            "Analysis stage is gone, dropping record"
                        );
                    }
                }
                Ok(ExtractionResult::Failure { error }) => {
                    extraction_stats
                        .extraction_failures
                        .fetch_add(1, Ordering::SeqCst);
                    metrics::counter!("trace_archive.extraction.failures").increment(1);
                    tracing::warn!(
                        path = %event.path,
                        error = %error,
                        "Extraction failed, object skipped"
                    );
                }
                Err(e) => {
                    extraction_stats
                        .extraction_errors
                        .fetch_add(1, Ordering::SeqCst);
                    tracing::error!(
                        path = %event.path,
                        error = %e,
                        "Extraction invocation failed after all retries"
                    );
                }
            }
        },
    ));

    let analysis_stats = stats.clone();
    let analysis_task = tokio::spawn(run_stage(
        analyzer,
        analyze_rx,
        policy,
        concurrency,
        move |record: &ExtractionRecord, outcome: Result<usize, PipelineError>| {
            analysis_stats
                .analysis_invocations
                .fetch_add(1, Ordering::SeqCst);
            match outcome {
                Ok(submitted) => {
                    analysis_stats
                        .records_submitted
                        .fetch_add(submitted as u64, Ordering::SeqCst);
                    tracing::debug!(source = %record.source, submitted, "Analysis complete");
                }
                Err(e) => {
                    analysis_stats.analysis_errors.fetch_add(1, Ordering::SeqCst);
                    tracing::error!(
                        source = %record.source,
                        error = %e,
                        "Analysis invocation failed after all retries"
                    );
                }
            }
        },
    ));

    PipelineHandle {
        cancel,
        stats,
        tasks: vec![trigger_task, extraction_task, analysis_task],
    }
}

/// Run `function` on every input, at most `concurrency` at a time, until the
/// input channel closes and every invocation has finished.
async fn run_stage<F, H>(
    function: Arc<F>,
    mut inputs: mpsc::UnboundedReceiver<F::Input>,
    policy: InvocationPolicy,
    concurrency: usize,
    on_complete: H,
) where
    F: Invocable,
    H: Fn(&F::Input, Result<F::Output, PipelineError>) + Clone + Send + Sync + 'static,
{
    let stage = function.stage();
    let permits = Arc::new(Semaphore::new(concurrency));
    let mut invocations = JoinSet::new();
    tracing::info!(stage, concurrency, "Stage started");

    while let Some(input) = inputs.recv().await {
        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        let function = function.clone();
        let policy = policy.clone();
        let on_complete = on_complete.clone();
        invocations.spawn(async move {
            let outcome = invoke_with_policy(function.as_ref(), &input, &policy).await;
            on_complete(&input, outcome);
            drop(permit);
        });
        while invocations.try_join_next().is_some() {}
    }

    while invocations.join_next().await.is_some() {}
    tracing::info!(stage, "Stage stopped");
}
