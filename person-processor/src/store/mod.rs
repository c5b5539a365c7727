//! Durable storage for persons and their identifier mappings.
//!
//! Every mutating operation is guarded: writes to a person carry the version the caller
//! read, and new identifier mappings are inserted only if the identifier is unmapped.
//! A failed guard leaves the store untouched and reports a conflict, and callers are
//! expected to re-read and recompute.
//!
//! Merged persons are tombstoned rather than deleted. A tombstone redirects to its
//! survivor, and reads by person id follow redirects to the live person.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::types::{MergeRecord, Person, Properties};

pub use memory::MemoryPersonStore;
pub use postgres::PgPersonStore;

/// Upper bound on tombstone redirects followed by a single read.
///
/// A merge repoints every tombstone of the absorbed person to the survivor, so a
/// tombstone is at most one hop away from a live person. Hitting this limit indicates a
/// broken store.
pub const MAX_REDIRECT_DEPTH: usize = 16;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("person {person_id} changed since version {expected}")]
    VersionConflict { person_id: Uuid, expected: i64 },
    #[error("distinct id {0} is already mapped to a person")]
    IdentifierTaken(String),
    #[error("person {0} was merged and no longer accepts writes")]
    PersonMerged(Uuid),
    #[error("person {0} not found")]
    PersonNotFound(Uuid),
    #[error("redirects from person {0} did not reach a live person within {MAX_REDIRECT_DEPTH} hops")]
    RedirectLimit(Uuid),
    #[error("store operation timed out")]
    Timeout,
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("{command} query failed with: {error}")]
    QueryError {
        command: String,
        #[source]
        error: sqlx::Error,
    },
}

impl StoreError {
    /// Conflicts are resolved by re-reading and recomputing, never surfaced.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StoreError::VersionConflict { .. }
                | StoreError::IdentifierTaken(_)
                | StoreError::PersonMerged(_)
        )
    }

    /// Failures that may succeed when the same operation is attempted later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Timeout | StoreError::Unavailable(_) | StoreError::QueryError { .. }
        )
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::VersionConflict { .. } => "version_conflict",
            StoreError::IdentifierTaken(_) => "identifier_taken",
            StoreError::PersonMerged(_) => "person_merged",
            StoreError::PersonNotFound(_) => "person_not_found",
            StoreError::RedirectLimit(_) => "redirect_limit",
            StoreError::Timeout => "timeout",
            StoreError::Unavailable(_) => "unavailable",
            StoreError::QueryError { .. } => "query_error",
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A person to create together with its first identifiers.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPerson {
    pub distinct_ids: Vec<String>,
    pub properties: Properties,
    pub created_at: DateTime<Utc>,
    pub is_identified: bool,
}

/// Everything a merge writes, computed by the caller from versioned reads.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeRequest {
    pub survivor_id: Uuid,
    pub survivor_version: i64,
    pub absorbed_id: Uuid,
    pub absorbed_version: i64,
    /// Properties the survivor ends up with.
    pub properties: Properties,
    /// Creation time the survivor ends up with.
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait PersonStore: Send + Sync {
    /// Resolve an identifier to its live person.
    async fn get_by_identifier(&self, distinct_id: &str) -> StoreResult<Option<Person>>;

    /// Fetch a person, following tombstone redirects to the live survivor.
    async fn get_person(&self, person_id: Uuid) -> StoreResult<Option<Person>>;

    /// Every identifier currently mapped to the person.
    async fn distinct_ids_for(&self, person_id: Uuid) -> StoreResult<Vec<String>>;

    /// Create a person mapped to all of `new.distinct_ids`.
    ///
    /// Fails with `IdentifierTaken` without writing anything if any identifier is mapped.
    async fn create(&self, new: NewPerson) -> StoreResult<Person>;

    /// Map an unmapped identifier to a live person, bumping its version.
    async fn add_identifier_mapping(
        &self,
        distinct_id: &str,
        person_id: Uuid,
        expected_version: i64,
        mark_identified: bool,
    ) -> StoreResult<Person>;

    async fn mark_identified(&self, person_id: Uuid, expected_version: i64) -> StoreResult<Person>;

    async fn update_properties(
        &self,
        person_id: Uuid,
        properties: Properties,
        expected_version: i64,
    ) -> StoreResult<Person>;

    /// Atomically repoint every identifier of the absorbed person to the survivor, write
    /// the survivor's merged state, tombstone the absorbed person and record the merge.
    ///
    /// Nothing is written if either version changed or either person is no longer live.
    async fn merge_transaction(&self, request: MergeRequest) -> StoreResult<MergeRecord>;

    async fn record_blocked_merge(&self, record: &MergeRecord) -> StoreResult<()>;

    /// Merge records in which the person took part, oldest first.
    async fn merge_history(&self, person_id: Uuid) -> StoreResult<Vec<MergeRecord>>;
}
