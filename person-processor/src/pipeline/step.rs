use std::future::Future;
use std::time::{Duration, Instant};

use tracing::warn;
use uuid::Uuid;

use crate::error::StepError;
use crate::metrics_consts::{STEP_DURATION_HISTOGRAM, STEP_RETRIES_COUNTER};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineStep {
    Deduplicate,
    PreTransform,
    Resolve,
    UpdateProperties,
    Emit,
    PostCommit,
    Overflow,
}

impl PipelineStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStep::Deduplicate => "deduplicate",
            PipelineStep::PreTransform => "pre_transform",
            PipelineStep::Resolve => "resolve",
            PipelineStep::UpdateProperties => "update_properties",
            PipelineStep::Emit => "emit",
            PipelineStep::PostCommit => "post_commit",
            PipelineStep::Overflow => "overflow",
        }
    }
}

/// A step that failed permanently or ran out of attempts.
#[derive(Debug)]
pub struct StepFailure {
    pub step: PipelineStep,
    pub attempts: u32,
    pub error: StepError,
}

pub(crate) fn record_duration(step: PipelineStep, started: Instant) {
    metrics::histogram!(STEP_DURATION_HISTOGRAM, "step" => step.as_str())
        .record(started.elapsed().as_secs_f64());
}

/// Run one step under `timeout`, retrying transient failures according to `policy`.
pub async fn run_step<T, F, Fut>(
    step: PipelineStep,
    event_uuid: Uuid,
    policy: &RetryPolicy,
    timeout: Duration,
    mut operation: F,
) -> Result<T, StepFailure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StepError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let started = Instant::now();
        let result = match tokio::time::timeout(timeout, operation()).await {
            Ok(result) => result,
            Err(_) => Err(StepError::Timeout(timeout)),
        };
        record_duration(step, started);

        let error = match result {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        if !error.is_transient() || !policy.should_retry(attempt) {
            return Err(StepFailure {
                step,
                attempts: attempt,
                error,
            });
        }

        let interval = policy.retry_interval(attempt);
        warn!(
            event_uuid = %event_uuid,
            step = step.as_str(),
            attempt,
            retry_in_ms = interval.as_millis() as u64,
            error = %error,
            "pipeline step failed, retrying"
        );
        metrics::counter!(STEP_RETRIES_COUNTER, "step" => step.as_str()).increment(1);
        tokio::time::sleep(interval).await;
    }
}
