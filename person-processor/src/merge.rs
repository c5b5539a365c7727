use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::metrics_consts::{PERSON_MERGES_BLOCKED_COUNTER, PERSON_MERGES_COUNTER};
use crate::properties::merge_for_survivor;
use crate::store::{MergeRequest, PersonStore, StoreError, StoreResult};
use crate::types::{BlockReason, MergeRecord};

/// What triggered a merge. Only `Dangerous` merges bypass merge protections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeKind {
    Identify,
    Alias,
    Dangerous,
}

impl MergeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeKind::Identify => "identify",
            MergeKind::Alias => "alias",
            MergeKind::Dangerous => "dangerous",
        }
    }
}

/// Consolidates two persons into one survivor.
///
/// A merge either commits completely or writes nothing. Conflicts are returned to the
/// caller, which owns the decision of re-reading and trying again.
pub struct MergeCoordinator {
    store: Arc<dyn PersonStore>,
}

impl MergeCoordinator {
    pub fn new(store: Arc<dyn PersonStore>) -> Self {
        Self { store }
    }

    pub async fn merge(
        &self,
        survivor_id: Uuid,
        absorbed_id: Uuid,
        kind: MergeKind,
    ) -> StoreResult<MergeRecord> {
        let survivor = self
            .store
            .get_person(survivor_id)
            .await?
            .ok_or(StoreError::PersonNotFound(survivor_id))?;
        let absorbed = self
            .store
            .get_person(absorbed_id)
            .await?
            .ok_or(StoreError::PersonNotFound(absorbed_id))?;

        if survivor.id == absorbed.id {
            // Already merged, possibly by a concurrent event.
            return Ok(MergeRecord::completed(survivor.id, absorbed_id));
        }

        if absorbed.is_identified && kind != MergeKind::Dangerous {
            let record = MergeRecord::blocked(
                survivor.id,
                absorbed.id,
                BlockReason::AbsorbedAlreadyIdentified,
            );
            self.store.record_blocked_merge(&record).await?;

            warn!(
                survivor_id = %survivor.id,
                absorbed_id = %absorbed.id,
                kind = kind.as_str(),
                "refusing to merge a person that is already identified"
            );
            metrics::counter!(PERSON_MERGES_COUNTER, "outcome" => "blocked").increment(1);
            metrics::counter!(
                PERSON_MERGES_BLOCKED_COUNTER,
                "reason" => BlockReason::AbsorbedAlreadyIdentified.as_str()
            )
            .increment(1);
            return Ok(record);
        }

        let request = MergeRequest {
            survivor_id: survivor.id,
            survivor_version: survivor.version,
            absorbed_id: absorbed.id,
            absorbed_version: absorbed.version,
            properties: merge_for_survivor(&survivor.properties, &absorbed.properties),
            created_at: survivor.created_at.min(absorbed.created_at),
        };
        let record = self.store.merge_transaction(request).await?;

        info!(
            survivor_id = %record.surviving_person_id,
            absorbed_id = %record.absorbed_person_id,
            kind = kind.as_str(),
            "merged persons"
        );
        metrics::counter!(PERSON_MERGES_COUNTER, "outcome" => "completed").increment(1);
        Ok(record)
    }
}
