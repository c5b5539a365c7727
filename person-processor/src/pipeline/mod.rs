//! # EventPipeline
//!
//! Drives one event from intake to the sink:
//! dedup → pre-transform hook → identity resolution → property update → emit →
//! post-commit hook.
//!
//! Store and sink steps run under a timeout and are retried with backoff while their
//! failures are transient. An event whose step cannot complete is handed to the
//! overflow sink together with the step and reason, and can later be fed back through
//! [`EventPipeline::reprocess`]. Hook failures never fail an event.
pub mod state;
pub mod step;

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::dedup::{Admission, Deduplicator};
use crate::error::{HookError, PipelineError, SinkError, StepError};
use crate::hooks::{restore_identity, HookDecision, PassthroughHook, PostCommitHook, PreTransformHook};
use crate::metrics_consts::{
    DEDUP_STORE_ERRORS_COUNTER, EVENTS_COMPLETED_COUNTER, EVENTS_DROPPED_COUNTER,
    EVENTS_OVERFLOWED_COUNTER, EVENTS_RECEIVED_COUNTER, HOOK_FAILURES_COUNTER,
    HOOK_IDENTITY_REWRITES_COUNTER, OVERFLOW_FAILURES_COUNTER,
};
use crate::resolver::IdentityResolver;
use crate::retry::RetryPolicy;
use crate::sink::{EventSink, OverflowRecord, OverflowSink};
use crate::types::{Event, FinalizedEvent, MergeRecord};

pub use state::{EventProgress, PipelineState};
pub use step::{run_step, PipelineStep, StepFailure};

use step::record_duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Duplicate,
    Vetoed,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::Duplicate => "duplicate",
            DropReason::Vetoed => "vetoed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    Completed {
        person_id: Uuid,
        merge: Option<MergeRecord>,
    },
    Dropped(DropReason),
    Overflowed {
        step: PipelineStep,
        reason: String,
    },
}

impl PipelineOutcome {
    pub fn state(&self) -> PipelineState {
        match self {
            PipelineOutcome::Completed { .. } => PipelineState::Done,
            PipelineOutcome::Dropped(_) => PipelineState::Dropped,
            PipelineOutcome::Overflowed { .. } => PipelineState::Overflowed,
        }
    }
}

pub struct EventPipeline {
    dedup: Deduplicator,
    resolver: IdentityResolver,
    pre_hook: Arc<dyn PreTransformHook>,
    post_hook: Arc<dyn PostCommitHook>,
    sink: Arc<dyn EventSink>,
    overflow: Arc<dyn OverflowSink>,
    retry_policy: RetryPolicy,
    step_timeout: Duration,
}

impl EventPipeline {
    pub fn new(
        dedup: Deduplicator,
        resolver: IdentityResolver,
        sink: Arc<dyn EventSink>,
        overflow: Arc<dyn OverflowSink>,
    ) -> Self {
        Self {
            dedup,
            resolver,
            pre_hook: Arc::new(PassthroughHook),
            post_hook: Arc::new(PassthroughHook),
            sink,
            overflow,
            retry_policy: RetryPolicy::default(),
            step_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_pre_hook(mut self, hook: Arc<dyn PreTransformHook>) -> Self {
        self.pre_hook = hook;
        self
    }

    pub fn with_post_hook(mut self, hook: Arc<dyn PostCommitHook>) -> Self {
        self.post_hook = hook;
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_step_timeout(mut self, step_timeout: Duration) -> Self {
        self.step_timeout = step_timeout;
        self
    }

    /// Process a freshly received event.
    pub async fn process(&self, event: Event) -> Result<PipelineOutcome, PipelineError> {
        metrics::counter!(EVENTS_RECEIVED_COUNTER).increment(1);
        let mut progress = EventProgress::new(event.uuid);

        if self.admit(&event).await == Admission::Drop {
            return Ok(self.drop_event(&event, DropReason::Duplicate, &mut progress));
        }
        progress.advance(PipelineState::Deduplicated);

        self.process_admitted(event, progress).await
    }

    /// Process an event taken back from the overflow path.
    ///
    /// The event was admitted by the dedup gate when it was first received, so the gate
    /// is skipped: checking again would drop it as its own duplicate.
    pub async fn reprocess(&self, event: Event) -> Result<PipelineOutcome, PipelineError> {
        metrics::counter!(EVENTS_RECEIVED_COUNTER, "source" => "overflow").increment(1);
        let mut progress = EventProgress::new(event.uuid);
        debug!(event_uuid = %event.uuid, "reprocessing overflowed event, skipping dedup");
        progress.advance(PipelineState::Deduplicated);

        self.process_admitted(event, progress).await
    }

    async fn admit(&self, event: &Event) -> Admission {
        let started = Instant::now();
        let admission = match tokio::time::timeout(self.step_timeout, self.dedup.admit(event)).await
        {
            Ok(admission) => admission,
            Err(_) => {
                warn!(
                    event_uuid = %event.uuid,
                    step = PipelineStep::Deduplicate.as_str(),
                    "dedup check timed out, admitting event"
                );
                metrics::counter!(DEDUP_STORE_ERRORS_COUNTER).increment(1);
                Admission::Keep
            }
        };
        record_duration(PipelineStep::Deduplicate, started);
        admission
    }

    /// Run a hook call under the step timeout. Overrunning it is a [`HookError::Timeout`].
    async fn run_hook<T>(
        &self,
        step: PipelineStep,
        hook: &'static str,
        call: impl Future<Output = Result<T, HookError>>,
    ) -> Result<T, HookError> {
        let started = Instant::now();
        let result = match tokio::time::timeout(self.step_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(HookError::Timeout(hook)),
        };
        record_duration(step, started);
        result
    }

    async fn process_admitted(
        &self,
        original: Event,
        mut progress: EventProgress,
    ) -> Result<PipelineOutcome, PipelineError> {
        let transformed = self.pre_transform(&original).await;
        progress.advance(PipelineState::PreHooked);
        let event = match transformed {
            Some(event) => event,
            None => return Ok(self.drop_event(&original, DropReason::Vetoed, &mut progress)),
        };

        let resolver = &self.resolver;
        let event_ref = &event;
        let resolution = match run_step(
            PipelineStep::Resolve,
            event.uuid,
            &self.retry_policy,
            self.step_timeout,
            move || async move { resolver.resolve(event_ref).await.map_err(StepError::from) },
        )
        .await
        {
            Ok(resolution) => resolution,
            Err(failure) => return self.overflow(original, failure, &mut progress).await,
        };
        progress.advance(PipelineState::Resolved);
        if resolution.merge.is_some() {
            progress.advance(PipelineState::Merging);
        }

        let ops = event.effective_property_ops();
        let person = if ops.is_empty() {
            resolution.person
        } else {
            let person_id = resolution.person.id;
            let ops_ref = &ops;
            match run_step(
                PipelineStep::UpdateProperties,
                event.uuid,
                &self.retry_policy,
                self.step_timeout,
                move || async move {
                    resolver
                        .update_properties(person_id, ops_ref)
                        .await
                        .map_err(StepError::from)
                },
            )
            .await
            {
                Ok(person) => person,
                Err(failure) => return self.overflow(original, failure, &mut progress).await,
            }
        };
        progress.advance(PipelineState::PropertiesUpdated);

        let finalized = FinalizedEvent { event, person };
        let sink = &self.sink;
        let finalized_ref = &finalized;
        if let Err(failure) = run_step(
            PipelineStep::Emit,
            finalized.event.uuid,
            &self.retry_policy,
            self.step_timeout,
            move || async move { sink.emit(finalized_ref).await.map_err(StepError::from) },
        )
        .await
        {
            return self.overflow(original, failure, &mut progress).await;
        }
        progress.advance(PipelineState::Emitted);

        self.post_commit(&finalized).await;
        progress.advance(PipelineState::PostHooked);
        progress.advance(PipelineState::Done);

        debug!(
            event_uuid = %finalized.event.uuid,
            person_id = %finalized.person.id,
            "event processed"
        );
        metrics::counter!(EVENTS_COMPLETED_COUNTER).increment(1);
        Ok(PipelineOutcome::Completed {
            person_id: finalized.person.id,
            merge: resolution.merge,
        })
    }

    /// Run the pre-transform hook. `None` means the hook vetoed the event.
    ///
    /// A failing or slow hook leaves the event untransformed.
    async fn pre_transform(&self, original: &Event) -> Option<Event> {
        let hook = self.pre_hook.name();
        let result = self
            .run_hook(
                PipelineStep::PreTransform,
                hook,
                self.pre_hook.pre_transform(original.clone()),
            )
            .await;

        match result {
            Ok(HookDecision::Keep(mut event)) => {
                let restored = restore_identity(original, &mut event);
                if !restored.is_empty() {
                    warn!(
                        event_uuid = %original.uuid,
                        hook,
                        fields = ?restored,
                        "pre-transform hook changed identity fields, restoring them"
                    );
                    metrics::counter!(HOOK_IDENTITY_REWRITES_COUNTER, "hook" => hook)
                        .increment(1);
                }
                Some(event)
            }
            Ok(HookDecision::Exclude) => None,
            Err(error) => {
                warn!(event_uuid = %original.uuid, hook, error = %error, "pre-transform hook failed, keeping event");
                metrics::counter!(HOOK_FAILURES_COUNTER, "hook" => hook, "reason" => error.reason())
                    .increment(1);
                Some(original.clone())
            }
        }
    }

    async fn post_commit(&self, finalized: &FinalizedEvent) {
        let hook = self.post_hook.name();
        let result = self
            .run_hook(
                PipelineStep::PostCommit,
                hook,
                self.post_hook.post_commit(finalized),
            )
            .await;

        if let Err(error) = result {
            warn!(event_uuid = %finalized.event.uuid, hook, error = %error, "post-commit hook failed");
            metrics::counter!(HOOK_FAILURES_COUNTER, "hook" => hook, "reason" => error.reason())
                .increment(1);
        }
    }

    fn drop_event(
        &self,
        event: &Event,
        reason: DropReason,
        progress: &mut EventProgress,
    ) -> PipelineOutcome {
        progress.advance(PipelineState::Dropped);
        debug!(event_uuid = %event.uuid, reason = reason.as_str(), "event dropped");
        metrics::counter!(EVENTS_DROPPED_COUNTER, "reason" => reason.as_str()).increment(1);
        PipelineOutcome::Dropped(reason)
    }

    async fn overflow(
        &self,
        event: Event,
        failure: StepFailure,
        progress: &mut EventProgress,
    ) -> Result<PipelineOutcome, PipelineError> {
        let step = failure.step;
        let uuid = event.uuid;
        let record = OverflowRecord {
            event,
            step: step.as_str(),
            reason: failure.error.to_string(),
            attempts: failure.attempts,
            overflowed_at: Utc::now(),
        };

        let overflow = &self.overflow;
        let record_ref = &record;
        let result = run_step(
            PipelineStep::Overflow,
            uuid,
            &self.retry_policy,
            self.step_timeout,
            move || async move { overflow.overflow(record_ref).await.map_err(StepError::from) },
        )
        .await;

        match result {
            Ok(()) => {
                progress.advance(PipelineState::Overflowed);
                info!(
                    event_uuid = %uuid,
                    step = step.as_str(),
                    attempts = failure.attempts,
                    reason = %record.reason,
                    "event routed to overflow"
                );
                metrics::counter!(EVENTS_OVERFLOWED_COUNTER, "step" => step.as_str()).increment(1);
                Ok(PipelineOutcome::Overflowed {
                    step,
                    reason: record.reason,
                })
            }
            Err(overflow_failure) => {
                error!(
                    event_uuid = %uuid,
                    step = step.as_str(),
                    error = %overflow_failure.error,
                    "failed to route event to overflow"
                );
                metrics::counter!(OVERFLOW_FAILURES_COUNTER).increment(1);
                let source = match overflow_failure.error {
                    StepError::Sink(error) => error,
                    other => SinkError::Unavailable(other.to_string()),
                };
                Err(PipelineError::OverflowFailed {
                    uuid,
                    step: step.as_str(),
                    source,
                })
            }
        }
    }
}
