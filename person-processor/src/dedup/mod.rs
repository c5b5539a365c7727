//! Event deduplication gate.
//!
//! Every event is reduced to a [`DedupKey`] and recorded in a [`DedupStore`] with a
//! bounded retention window. The store's atomic insert-if-absent decides which of
//! several concurrent submissions is admitted.
//!
//! The gate fails open: if the store cannot be reached the event is admitted and
//! `dedup_store_errors_total` is incremented. Duplicate suppression is an
//! optimisation, downstream consumers deduplicate again at query time.

pub mod keys;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use crate::metrics_consts::{DEDUP_RESULT_COUNTER, DEDUP_STORE_ERRORS_COUNTER};
use crate::types::Event;

pub use keys::DedupKey;
pub use store::{DedupStore, DedupStoreError, InsertOutcome, MemoryDedupStore, PgDedupStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Keep,
    Drop,
}

pub struct Deduplicator {
    store: Arc<dyn DedupStore>,
    window: Duration,
}

impl Deduplicator {
    pub fn new(store: Arc<dyn DedupStore>, window: Duration) -> Self {
        Self { store, window }
    }

    pub async fn admit(&self, event: &Event) -> Admission {
        let age = Utc::now().signed_duration_since(event.timestamp);
        if age.to_std().is_ok_and(|age| age > self.window) {
            // Events older than the window are considered settled and are not tracked.
            metrics::counter!(DEDUP_RESULT_COUNTER, "result" => "skipped_stale").increment(1);
            return Admission::Keep;
        }

        let key = DedupKey::from(event);
        match self.store.insert_if_absent(&key.digest(), self.window).await {
            Ok(InsertOutcome::Inserted) => {
                metrics::counter!(DEDUP_RESULT_COUNTER, "result" => "new").increment(1);
                Admission::Keep
            }
            Ok(InsertOutcome::AlreadyPresent) => {
                debug!(event_uuid = %event.uuid, key = %key, "dropping duplicate event");
                metrics::counter!(DEDUP_RESULT_COUNTER, "result" => "duplicate").increment(1);
                Admission::Drop
            }
            Err(error) => {
                warn!(event_uuid = %event.uuid, error = ?error, "dedup store failed, admitting event");
                metrics::counter!(DEDUP_RESULT_COUNTER, "result" => "store_error").increment(1);
                metrics::counter!(DEDUP_STORE_ERRORS_COUNTER).increment(1);
                Admission::Keep
            }
        }
    }
}
