// ==== Pipeline ====
/// Counter for events handed to the pipeline
pub const EVENTS_RECEIVED_COUNTER: &str = "events_received_total";

/// Counter for events that finished every pipeline step
pub const EVENTS_COMPLETED_COUNTER: &str = "events_completed_total";

/// Counter for dropped events, labelled by reason (duplicate/vetoed)
pub const EVENTS_DROPPED_COUNTER: &str = "events_dropped_total";

/// Counter for events routed to the overflow sink, labelled by the failing step
pub const EVENTS_OVERFLOWED_COUNTER: &str = "events_overflowed_total";

/// Counter for events lost because the overflow sink itself failed
pub const OVERFLOW_FAILURES_COUNTER: &str = "overflow_failures_total";

/// Counter for step retries after a transient failure, labelled by step
pub const STEP_RETRIES_COUNTER: &str = "pipeline_step_retries_total";

/// Histogram for the duration of a single step attempt, labelled by step
pub const STEP_DURATION_HISTOGRAM: &str = "pipeline_step_duration_seconds";

/// Counter for hook invocations that errored or timed out, labelled by hook
pub const HOOK_FAILURES_COUNTER: &str = "hook_failures_total";

/// Counter for pre-transform results that tried to rewrite identity fields
pub const HOOK_IDENTITY_REWRITES_COUNTER: &str = "hook_identity_rewrites_total";

// ==== Deduplication ====
/// Counter for dedup decisions, labelled by result (new/duplicate/skipped_stale/store_error)
pub const DEDUP_RESULT_COUNTER: &str = "dedup_result_total";

/// Counter for dedup store failures that were admitted fail-open
pub const DEDUP_STORE_ERRORS_COUNTER: &str = "dedup_store_errors_total";

// ==== Persons ====
/// Counter for persons created on first sighting of an identifier
pub const PERSONS_CREATED_COUNTER: &str = "persons_created_total";

/// Counter for identifiers linked to an existing person
pub const IDENTIFIERS_LINKED_COUNTER: &str = "person_identifiers_linked_total";

/// Counter for merge attempts, labelled by outcome
pub const PERSON_MERGES_COUNTER: &str = "person_merges_total";

/// Counter for merges refused by merge protections
pub const PERSON_MERGES_BLOCKED_COUNTER: &str = "person_merges_blocked_total";

/// Counter for optimistic concurrency conflicts, labelled by operation
pub const VERSION_CONFLICTS_COUNTER: &str = "version_conflicts_total";

/// Counter for person property writes
pub const PERSON_PROPERTY_UPDATES_COUNTER: &str = "person_property_updates_total";

// ==== Worker ====
/// Gauge for how full a lane's queue is, labelled by lane
pub const LANE_SATURATION_GAUGE: &str = "lane_saturation_percent";

/// Counter for events refused at intake because the lane was full
pub const INTAKE_REJECTED_COUNTER: &str = "intake_rejected_total";

/// Counter for events that failed without reaching any sink
pub const WORKER_EVENT_FAILURES_COUNTER: &str = "worker_event_failures_total";
