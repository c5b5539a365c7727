//! Extension points around the identity pipeline.
//!
//! Hooks observe or filter events but cannot steer identity resolution: identity fields
//! rewritten by a pre-transform hook are restored before the event is resolved.
use async_trait::async_trait;
use serde_json::Value;

use crate::error::HookError;
use crate::types::{
    Event, FinalizedEvent, ALIAS_PROPERTY, ANON_DISTINCT_ID_PROPERTY, CREATE_ALIAS_EVENT,
    IDENTIFY_EVENT, MERGE_DANGEROUSLY_EVENT,
};

#[derive(Debug, Clone, PartialEq)]
pub enum HookDecision {
    Keep(Event),
    Exclude,
}

#[async_trait]
pub trait PreTransformHook: Send + Sync {
    fn name(&self) -> &'static str {
        "pre_transform"
    }

    async fn pre_transform(&self, event: Event) -> Result<HookDecision, HookError>;
}

#[async_trait]
pub trait PostCommitHook: Send + Sync {
    fn name(&self) -> &'static str {
        "post_commit"
    }

    async fn post_commit(&self, finalized: &FinalizedEvent) -> Result<(), HookError>;
}

/// Hook that keeps every event as is.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughHook;

#[async_trait]
impl PreTransformHook for PassthroughHook {
    async fn pre_transform(&self, event: Event) -> Result<HookDecision, HookError> {
        Ok(HookDecision::Keep(event))
    }
}

#[async_trait]
impl PostCommitHook for PassthroughHook {
    async fn post_commit(&self, _finalized: &FinalizedEvent) -> Result<(), HookError> {
        Ok(())
    }
}

fn is_identity_event(name: &str) -> bool {
    matches!(
        name,
        IDENTIFY_EVENT | CREATE_ALIAS_EVENT | MERGE_DANGEROUSLY_EVENT
    )
}

fn restore_property(original: &Event, transformed: &mut Event, key: &str) -> bool {
    let before: Option<&Value> = original.properties.get(key);
    if transformed.properties.get(key) == before {
        return false;
    }
    match before {
        Some(value) => {
            transformed.properties.insert(key.to_owned(), value.clone());
        }
        None => {
            transformed.properties.remove(key);
        }
    }
    true
}

/// Undo changes to fields that decide how an event is resolved to a person.
///
/// Returns the names of the fields that had to be restored.
pub fn restore_identity(original: &Event, transformed: &mut Event) -> Vec<&'static str> {
    let mut restored = Vec::new();

    if transformed.uuid != original.uuid {
        transformed.uuid = original.uuid;
        restored.push("uuid");
    }
    if transformed.distinct_id != original.distinct_id {
        transformed.distinct_id = original.distinct_id.clone();
        restored.push("distinct_id");
    }
    if transformed.anon_distinct_id != original.anon_distinct_id {
        transformed.anon_distinct_id = original.anon_distinct_id.clone();
        restored.push("anon_distinct_id");
    }
    if restore_property(original, transformed, ANON_DISTINCT_ID_PROPERTY) {
        restored.push(ANON_DISTINCT_ID_PROPERTY);
    }
    if restore_property(original, transformed, ALIAS_PROPERTY) {
        restored.push(ALIAS_PROPERTY);
    }
    // Renaming into or out of an identity event would change the merge decision.
    if transformed.event != original.event
        && (is_identity_event(&original.event) || is_identity_event(&transformed.event))
    {
        transformed.event = original.event.clone();
        restored.push("event");
    }

    restored
}
