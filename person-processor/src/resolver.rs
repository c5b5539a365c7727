//! Maps an event's identifiers to a live person.
//!
//! Resolution never trusts a previous read: every attempt starts from fresh lookups, and
//! every write it issues is guarded by a version or by identifier absence. When a guard
//! fails the whole attempt is recomputed, so concurrent events touching the same
//! identifiers converge on the same mapping regardless of interleaving.
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::merge::{MergeCoordinator, MergeKind};
use crate::metrics_consts::{
    IDENTIFIERS_LINKED_COUNTER, PERSONS_CREATED_COUNTER, PERSON_PROPERTY_UPDATES_COUNTER,
    VERSION_CONFLICTS_COUNTER,
};
use crate::properties;
use crate::store::{NewPerson, PersonStore, StoreError, StoreResult};
use crate::types::{Event, EventKind, MergeRecord, Person, Properties, PropertyOps};

/// Which person survives when an alias event joins two existing persons.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AliasPrecedence {
    /// The person of the event's `distinct_id` always survives.
    #[default]
    Positional,
    /// When exactly one side is identified, that side survives.
    PreferIdentified,
}

impl FromStr for AliasPrecedence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "positional" => Ok(AliasPrecedence::Positional),
            "prefer_identified" | "prefer-identified" => Ok(AliasPrecedence::PreferIdentified),
            invalid => Err(format!("{invalid} is not a valid alias precedence")),
        }
    }
}

impl fmt::Display for AliasPrecedence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AliasPrecedence::Positional => write!(f, "positional"),
            AliasPrecedence::PreferIdentified => write!(f, "prefer_identified"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub person: Person,
    /// Set when the event triggered a merge attempt, completed or blocked.
    pub merge: Option<MergeRecord>,
    pub created: bool,
}

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("gave up resolving {distinct_id} after {attempts} conflicting attempts")]
    ConflictRetriesExhausted { distinct_id: String, attempts: u32 },
}

impl ResolveError {
    pub fn is_transient(&self) -> bool {
        match self {
            ResolveError::Store(error) => error.is_transient(),
            ResolveError::ConflictRetriesExhausted { .. } => true,
        }
    }
}

pub struct IdentityResolver {
    store: Arc<dyn PersonStore>,
    merger: MergeCoordinator,
    alias_precedence: AliasPrecedence,
    max_conflict_retries: u32,
}

impl IdentityResolver {
    pub fn new(
        store: Arc<dyn PersonStore>,
        alias_precedence: AliasPrecedence,
        max_conflict_retries: u32,
    ) -> Self {
        Self {
            merger: MergeCoordinator::new(store.clone()),
            store,
            alias_precedence,
            max_conflict_retries: max_conflict_retries.max(1),
        }
    }

    pub async fn resolve(&self, event: &Event) -> Result<Resolution, ResolveError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match event.kind() {
                EventKind::Identify {
                    distinct_id,
                    anon_distinct_id,
                } => {
                    self.link(distinct_id, anon_distinct_id, MergeKind::Identify, event.timestamp)
                        .await
                }
                EventKind::Alias {
                    primary,
                    alias,
                    dangerous,
                } => {
                    let kind = if dangerous {
                        MergeKind::Dangerous
                    } else {
                        MergeKind::Alias
                    };
                    self.link(primary, alias, kind, event.timestamp).await
                }
                EventKind::Anonymous { distinct_id } => {
                    self.get_or_create(distinct_id, event.timestamp).await
                }
            };

            match result {
                Err(error) if error.is_conflict() => {
                    metrics::counter!(VERSION_CONFLICTS_COUNTER, "operation" => "resolve")
                        .increment(1);
                    if attempt >= self.max_conflict_retries {
                        return Err(ResolveError::ConflictRetriesExhausted {
                            distinct_id: event.distinct_id.clone(),
                            attempts: attempt,
                        });
                    }
                    debug!(
                        event_uuid = %event.uuid,
                        distinct_id = %event.distinct_id,
                        attempt,
                        error = %error,
                        "conflict while resolving person, re-reading"
                    );
                }
                other => return other.map_err(ResolveError::from),
            }
        }
    }

    async fn get_or_create(
        &self,
        distinct_id: &str,
        created_at: DateTime<Utc>,
    ) -> StoreResult<Resolution> {
        if let Some(person) = self.store.get_by_identifier(distinct_id).await? {
            return Ok(Resolution {
                person,
                merge: None,
                created: false,
            });
        }

        let person = self
            .store
            .create(NewPerson {
                distinct_ids: vec![distinct_id.to_owned()],
                properties: Properties::new(),
                created_at,
                is_identified: false,
            })
            .await?;
        metrics::counter!(PERSONS_CREATED_COUNTER).increment(1);

        Ok(Resolution {
            person,
            merge: None,
            created: true,
        })
    }

    /// Join `primary` and `secondary` into one identified person.
    async fn link(
        &self,
        primary: &str,
        secondary: &str,
        kind: MergeKind,
        created_at: DateTime<Utc>,
    ) -> StoreResult<Resolution> {
        let primary_person = self.store.get_by_identifier(primary).await?;
        let secondary_person = self.store.get_by_identifier(secondary).await?;

        let (person, merge, created) = match (primary_person, secondary_person) {
            (None, None) => {
                let person = self
                    .store
                    .create(NewPerson {
                        distinct_ids: vec![primary.to_owned(), secondary.to_owned()],
                        properties: Properties::new(),
                        created_at,
                        is_identified: true,
                    })
                    .await?;
                metrics::counter!(PERSONS_CREATED_COUNTER).increment(1);
                (person, None, true)
            }
            (Some(existing), None) => (self.attach(secondary, existing, kind).await?, None, false),
            (None, Some(existing)) => (self.attach(primary, existing, kind).await?, None, false),
            (Some(first), Some(second)) if first.id == second.id => {
                let person = if first.is_identified {
                    first
                } else {
                    self.store.mark_identified(first.id, first.version).await?
                };
                (person, None, false)
            }
            (Some(primary_person), Some(secondary_person)) => {
                let (survivor, absorbed) =
                    self.choose_survivor(kind, primary_person.clone(), secondary_person);
                let record = self.merger.merge(survivor.id, absorbed.id, kind).await?;

                // A blocked merge is already recorded, so nothing after it may fail and
                // restart the attempt. It continues with the person of the event's own id
                // as read above.
                let person = if record.is_completed() {
                    self.store
                        .get_person(record.surviving_person_id)
                        .await?
                        .ok_or(StoreError::PersonNotFound(survivor.id))?
                } else {
                    primary_person
                };
                (person, Some(record), false)
            }
        };

        Ok(Resolution {
            person,
            merge,
            created,
        })
    }

    async fn attach(&self, distinct_id: &str, person: Person, kind: MergeKind) -> StoreResult<Person> {
        let person = self
            .store
            .add_identifier_mapping(distinct_id, person.id, person.version, true)
            .await?;
        metrics::counter!(IDENTIFIERS_LINKED_COUNTER, "kind" => kind.as_str()).increment(1);
        Ok(person)
    }

    fn choose_survivor(&self, kind: MergeKind, primary: Person, secondary: Person) -> (Person, Person) {
        let prefer_secondary = kind != MergeKind::Identify
            && self.alias_precedence == AliasPrecedence::PreferIdentified
            && secondary.is_identified
            && !primary.is_identified;

        if prefer_secondary {
            (secondary, primary)
        } else {
            (primary, secondary)
        }
    }

    /// Apply property operations to a person, re-reading on conflict.
    ///
    /// The person is re-read by id, so operations land on the survivor if the person was
    /// merged since it was resolved. No write is issued when nothing changes.
    pub async fn update_properties(
        &self,
        person_id: Uuid,
        ops: &PropertyOps,
    ) -> Result<Person, ResolveError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let person = self
                .store
                .get_person(person_id)
                .await?
                .ok_or(StoreError::PersonNotFound(person_id))?;

            let applied = properties::apply(&person.properties, ops);
            if !applied.changed {
                return Ok(person);
            }

            match self
                .store
                .update_properties(person.id, applied.properties, person.version)
                .await
            {
                Ok(updated) => {
                    metrics::counter!(PERSON_PROPERTY_UPDATES_COUNTER).increment(1);
                    return Ok(updated);
                }
                Err(error) if error.is_conflict() => {
                    metrics::counter!(VERSION_CONFLICTS_COUNTER, "operation" => "update_properties")
                        .increment(1);
                    if attempt >= self.max_conflict_retries {
                        return Err(ResolveError::ConflictRetriesExhausted {
                            distinct_id: person_id.to_string(),
                            attempts: attempt,
                        });
                    }
                }
                Err(error) => return Err(error.into()),
            }
        }
    }
}
