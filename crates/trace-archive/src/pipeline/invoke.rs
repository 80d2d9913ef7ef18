//! Asynchronous invocation semantics for pipeline functions.
//!
//! Each invocation runs under a time limit. An invocation that returns an
//! error or times out is retried with exponential backoff up to
//! `max_retries` times; the function itself must be safe to re-run on the
//! same input.

use std::time::Duration;

use async_trait::async_trait;

use crate::config::{PipelineConfig, RetryConfig};
use crate::PipelineError;

/// A stateless function invoked once per input.
#[async_trait]
pub trait Invocable: Send + Sync + 'static {
    type Input: Send + Sync + 'static;
    type Output: Send + 'static;

    /// Stage name for logs and metrics.
    fn stage(&self) -> &'static str;

    async fn invoke(&self, input: &Self::Input) -> Result<Self::Output, PipelineError>;
}

/// Time limit and retry budget applied to every invocation of a stage.
#[derive(Debug, Clone)]
pub struct InvocationPolicy {
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry: RetryConfig,
}

impl InvocationPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            timeout: config.invocation_timeout(),
            max_retries: config.invocation_max_retries,
            retry: config.invocation_retry.clone(),
        }
    }
}

/// Invoke `function` until it succeeds or the retry budget is spent.
///
/// Returns the last error once every attempt has failed.
pub async fn invoke_with_policy<F: Invocable + ?Sized>(
    function: &F,
    input: &F::Input,
    policy: &InvocationPolicy,
) -> Result<F::Output, PipelineError> {
    let stage = function.stage();
    let mut last_error = None;

    for attempt in 0..=policy.max_retries {
        if attempt > 0 {
            let delay = policy.retry.backoff(attempt - 1);
            tracing::warn!(
                stage,
                attempt,
                max_retries = policy.max_retries,
                delay_ms = delay.as_millis(),
                "Retrying invocation"
            );
            tokio::time::sleep(delay).await;
        }

        metrics::counter!("trace_archive.invocations", "stage" => stage).increment(1);
        let outcome = tokio::time::timeout(policy.timeout, function.invoke(input))
            .await
            .unwrap_or(Err(PipelineError::Timeout {
                stage,
                duration: policy.timeout,
            }));

        match outcome {
            Ok(output) => return Ok(output),
            Err(e) => {
                tracing::warn!(stage, attempt, error = %e, "Invocation failed");
                last_error = Some(e);
            }
        }
    }

    metrics::counter!("trace_archive.invocations.exhausted", "stage" => stage).increment(1);
    Err(last_error.unwrap_or(PipelineError::Closed { component: stage }))
}
