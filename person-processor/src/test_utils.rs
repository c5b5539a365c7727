//! Shared test utilities for the person-processor crate.
//!
//! Event builders, fault-injecting store wrappers and recording sinks used by the unit
//! tests and by the integration tests under `tests/`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::dedup::{DedupStore, DedupStoreError, InsertOutcome};
use crate::error::{HookError, SinkError};
use crate::hooks::{HookDecision, PostCommitHook, PreTransformHook};
use crate::sink::{EventSink, OverflowRecord, OverflowSink};
use crate::store::{
    MemoryPersonStore, MergeRequest, NewPerson, PersonStore, StoreError, StoreResult,
};
use crate::types::{
    Event, FinalizedEvent, MergeRecord, Person, Properties, PropertyOps, ALIAS_PROPERTY,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Builder for test events with a fresh uuid and the current timestamp.
pub struct EventBuilder {
    event: Event,
}

impl EventBuilder {
    pub fn new(name: &str, distinct_id: &str) -> Self {
        Self {
            event: Event {
                uuid: Uuid::now_v7(),
                event: name.to_owned(),
                timestamp: Utc::now(),
                distinct_id: distinct_id.to_owned(),
                anon_distinct_id: None,
                properties: Properties::new(),
                property_ops: PropertyOps::default(),
                groups: HashMap::new(),
            },
        }
    }

    pub fn anon(mut self, anon_distinct_id: &str) -> Self {
        self.event.anon_distinct_id = Some(anon_distinct_id.to_owned());
        self
    }

    pub fn alias(mut self, alias: &str) -> Self {
        self.event
            .properties
            .insert(ALIAS_PROPERTY.to_owned(), json!(alias));
        self
    }

    pub fn property(mut self, key: &str, value: Value) -> Self {
        self.event.properties.insert(key.to_owned(), value);
        self
    }

    pub fn set(mut self, key: &str, value: Value) -> Self {
        self.event.property_ops.set.insert(key.to_owned(), value);
        self
    }

    pub fn set_once(mut self, key: &str, value: Value) -> Self {
        self.event
            .property_ops
            .set_once
            .insert(key.to_owned(), value);
        self
    }

    pub fn unset(mut self, key: &str) -> Self {
        self.event.property_ops.unset.push(key.to_owned());
        self
    }

    pub fn uuid(mut self, uuid: Uuid) -> Self {
        self.event.uuid = uuid;
        self
    }

    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.event.timestamp = timestamp;
        self
    }

    pub fn build(self) -> Event {
        self.event
    }
}

/// Dedup store whose backend is always down.
pub struct UnavailableDedupStore;

#[async_trait]
impl DedupStore for UnavailableDedupStore {
    async fn insert_if_absent(
        &self,
        _key: &str,
        _ttl: Duration,
    ) -> Result<InsertOutcome, DedupStoreError> {
        Err(DedupStoreError::Unavailable("connection refused".to_owned()))
    }
}

/// Failure injected into a `FaultyPersonStore` operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Unavailable,
    Timeout,
    VersionConflict,
    IdentifierTaken,
}

impl Fault {
    fn into_error(self) -> StoreError {
        match self {
            Fault::Unavailable => StoreError::Unavailable("injected".to_owned()),
            Fault::Timeout => StoreError::Timeout,
            Fault::VersionConflict => StoreError::VersionConflict {
                person_id: Uuid::nil(),
                expected: -1,
            },
            Fault::IdentifierTaken => StoreError::IdentifierTaken("injected".to_owned()),
        }
    }
}

/// A pause point placed before a store operation.
///
/// The paused call notifies `reached` and waits until `release` is called.
#[derive(Default)]
pub struct Pause {
    reached: Notify,
    release: Notify,
}

impl Pause {
    /// Wait until a call has arrived at the pause point.
    pub async fn reached(&self) {
        self.reached.notified().await;
    }

    /// Let the paused call proceed.
    pub fn release(&self) {
        self.release.notify_one();
    }
}

/// `PersonStore` wrapper that injects failures and pauses before named operations.
///
/// Operation names match the trait method names, e.g. `"merge_transaction"`.
pub struct FaultyPersonStore {
    inner: Arc<MemoryPersonStore>,
    faults: Mutex<HashMap<&'static str, VecDeque<Option<Fault>>>>,
    pauses: Mutex<HashMap<&'static str, VecDeque<Arc<Pause>>>>,
    calls: Mutex<HashMap<&'static str, usize>>,
}

impl FaultyPersonStore {
    pub fn new(inner: Arc<MemoryPersonStore>) -> Self {
        Self {
            inner,
            faults: Mutex::new(HashMap::new()),
            pauses: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn inner(&self) -> &Arc<MemoryPersonStore> {
        &self.inner
    }

    /// Fail the next `times` calls of `operation` with `fault`.
    pub fn inject(&self, operation: &'static str, fault: Fault, times: usize) {
        lock(&self.faults)
            .entry(operation)
            .or_default()
            .extend(std::iter::repeat(Some(fault)).take(times));
    }

    /// Let the next `skip` calls of `operation` through, then fail one with `fault`.
    pub fn inject_after(&self, operation: &'static str, skip: usize, fault: Fault) {
        let mut faults = lock(&self.faults);
        let queue = faults.entry(operation).or_default();
        queue.extend(std::iter::repeat(None).take(skip));
        queue.push_back(Some(fault));
    }

    /// Pause the next call of `operation` until the returned handle is released.
    pub fn pause_before(&self, operation: &'static str) -> Arc<Pause> {
        let pause = Arc::new(Pause::default());
        lock(&self.pauses)
            .entry(operation)
            .or_default()
            .push_back(pause.clone());
        pause
    }

    /// How many times `operation` has been called, failed calls included.
    pub fn calls(&self, operation: &'static str) -> usize {
        lock(&self.calls).get(operation).copied().unwrap_or(0)
    }

    async fn before(&self, operation: &'static str) -> StoreResult<()> {
        *lock(&self.calls).entry(operation).or_default() += 1;

        let pause = lock(&self.pauses)
            .get_mut(operation)
            .and_then(VecDeque::pop_front);
        if let Some(pause) = pause {
            pause.reached.notify_one();
            pause.release.notified().await;
        }

        let fault = lock(&self.faults)
            .get_mut(operation)
            .and_then(VecDeque::pop_front)
            .flatten();
        match fault {
            Some(fault) => Err(fault.into_error()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl PersonStore for FaultyPersonStore {
    async fn get_by_identifier(&self, distinct_id: &str) -> StoreResult<Option<Person>> {
        self.before("get_by_identifier").await?;
        self.inner.get_by_identifier(distinct_id).await
    }

    async fn get_person(&self, person_id: Uuid) -> StoreResult<Option<Person>> {
        self.before("get_person").await?;
        self.inner.get_person(person_id).await
    }

    async fn distinct_ids_for(&self, person_id: Uuid) -> StoreResult<Vec<String>> {
        self.before("distinct_ids_for").await?;
        self.inner.distinct_ids_for(person_id).await
    }

    async fn create(&self, new: NewPerson) -> StoreResult<Person> {
        self.before("create").await?;
        self.inner.create(new).await
    }

    async fn add_identifier_mapping(
        &self,
        distinct_id: &str,
        person_id: Uuid,
        expected_version: i64,
        mark_identified: bool,
    ) -> StoreResult<Person> {
        self.before("add_identifier_mapping").await?;
        self.inner
            .add_identifier_mapping(distinct_id, person_id, expected_version, mark_identified)
            .await
    }

    async fn mark_identified(&self, person_id: Uuid, expected_version: i64) -> StoreResult<Person> {
        self.before("mark_identified").await?;
        self.inner.mark_identified(person_id, expected_version).await
    }

    async fn update_properties(
        &self,
        person_id: Uuid,
        properties: Properties,
        expected_version: i64,
    ) -> StoreResult<Person> {
        self.before("update_properties").await?;
        self.inner
            .update_properties(person_id, properties, expected_version)
            .await
    }

    async fn merge_transaction(&self, request: MergeRequest) -> StoreResult<MergeRecord> {
        self.before("merge_transaction").await?;
        self.inner.merge_transaction(request).await
    }

    async fn record_blocked_merge(&self, record: &MergeRecord) -> StoreResult<()> {
        self.before("record_blocked_merge").await?;
        self.inner.record_blocked_merge(record).await
    }

    async fn merge_history(&self, person_id: Uuid) -> StoreResult<Vec<MergeRecord>> {
        self.before("merge_history").await?;
        self.inner.merge_history(person_id).await
    }
}

/// Event sink that records what it receives and can fail on demand.
#[derive(Default)]
pub struct RecordingSink {
    emitted: Mutex<Vec<FinalizedEvent>>,
    failures: AtomicUsize,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` emits.
    pub fn fail_next(&self, times: usize) {
        self.failures.store(times, Ordering::SeqCst);
    }

    pub fn emitted(&self) -> Vec<FinalizedEvent> {
        lock(&self.emitted).clone()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn emit(&self, finalized: &FinalizedEvent) -> Result<(), SinkError> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SinkError::Unavailable("injected".to_owned()));
        }
        lock(&self.emitted).push(finalized.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingOverflow {
    records: Mutex<Vec<OverflowRecord>>,
    failing: AtomicBool,
}

impl RecordingOverflow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_always(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<OverflowRecord> {
        lock(&self.records).clone()
    }
}

#[async_trait]
impl OverflowSink for RecordingOverflow {
    async fn overflow(&self, record: &OverflowRecord) -> Result<(), SinkError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SinkError::Unavailable("injected".to_owned()));
        }
        lock(&self.records).push(record.clone());
        Ok(())
    }
}

type Rewrite = Box<dyn Fn(Event) -> Event + Send + Sync>;

enum Script {
    Exclude,
    Fail,
    Hang(Duration),
    Rewrite(Rewrite),
}

/// Pre-transform hook with fixed behaviour.
pub struct ScriptedPreHook {
    script: Script,
}

impl ScriptedPreHook {
    pub fn exclude() -> Self {
        Self {
            script: Script::Exclude,
        }
    }

    pub fn failing() -> Self {
        Self {
            script: Script::Fail,
        }
    }

    pub fn hanging(duration: Duration) -> Self {
        Self {
            script: Script::Hang(duration),
        }
    }

    pub fn rewriting(rewrite: impl Fn(Event) -> Event + Send + Sync + 'static) -> Self {
        Self {
            script: Script::Rewrite(Box::new(rewrite)),
        }
    }
}

#[async_trait]
impl PreTransformHook for ScriptedPreHook {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn pre_transform(&self, event: Event) -> Result<HookDecision, HookError> {
        match &self.script {
            Script::Exclude => Ok(HookDecision::Exclude),
            Script::Fail => Err(HookError::Failed {
                hook: "scripted",
                message: "injected".to_owned(),
            }),
            Script::Hang(duration) => {
                tokio::time::sleep(*duration).await;
                Ok(HookDecision::Keep(event))
            }
            Script::Rewrite(rewrite) => Ok(HookDecision::Keep(rewrite(event))),
        }
    }
}

/// Post-commit hook counting its invocations.
#[derive(Default)]
pub struct CountingPostHook {
    count: AtomicUsize,
    fail: bool,
}

impl CountingPostHook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            count: AtomicUsize::new(0),
            fail: true,
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PostCommitHook for CountingPostHook {
    async fn post_commit(&self, _finalized: &FinalizedEvent) -> Result<(), HookError> {
        self.count.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(HookError::Failed {
                hook: "counting",
                message: "injected".to_owned(),
            });
        }
        Ok(())
    }
}
