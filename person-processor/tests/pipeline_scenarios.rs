use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use uuid::Uuid;

use person_processor::dedup::{Deduplicator, MemoryDedupStore};
use person_processor::merge::{MergeCoordinator, MergeKind};
use person_processor::pipeline::{DropReason, EventPipeline, PipelineOutcome};
use person_processor::resolver::{AliasPrecedence, IdentityResolver};
use person_processor::store::{MemoryPersonStore, PersonStore, MAX_REDIRECT_DEPTH};
use person_processor::test_utils::{
    EventBuilder, FaultyPersonStore, RecordingOverflow, RecordingSink,
};
use person_processor::types::{
    BlockReason, Event, MergeOutcome, CREATE_ALIAS_EVENT, IDENTIFY_EVENT,
    MERGE_DANGEROUSLY_EVENT,
};

struct Harness {
    store: Arc<MemoryPersonStore>,
    sink: Arc<RecordingSink>,
    pipeline: Arc<EventPipeline>,
}

impl Harness {
    fn new() -> Self {
        let store = Arc::new(MemoryPersonStore::new());
        Self::with_store(store.clone(), store)
    }

    fn with_store(store: Arc<MemoryPersonStore>, resolver_store: Arc<dyn PersonStore>) -> Self {
        let sink = Arc::new(RecordingSink::new());
        let pipeline = EventPipeline::new(
            Deduplicator::new(
                Arc::new(MemoryDedupStore::default()),
                Duration::from_secs(3600),
            ),
            IdentityResolver::new(resolver_store, AliasPrecedence::Positional, 10),
            sink.clone(),
            Arc::new(RecordingOverflow::new()),
        );
        Self {
            store,
            sink,
            pipeline: Arc::new(pipeline),
        }
    }

    async fn process(&self, event: Event) -> PipelineOutcome {
        self.pipeline.process(event).await.unwrap()
    }

    async fn person_of(&self, distinct_id: &str) -> Uuid {
        self.store
            .get_by_identifier(distinct_id)
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("{distinct_id} is not mapped"))
            .id
    }

    fn live_persons(&self) -> usize {
        self.store
            .all_persons()
            .iter()
            .filter(|p| p.is_live())
            .count()
    }

    /// Every mapping must point at a live person.
    fn assert_mappings_live(&self) {
        for (distinct_id, person_id) in self.store.mappings() {
            let person = self.store.raw_person(person_id).unwrap();
            assert!(person.is_live(), "{distinct_id} maps to a tombstone");
        }
    }
}

fn completed_person(outcome: &PipelineOutcome) -> Uuid {
    match outcome {
        PipelineOutcome::Completed { person_id, .. } => *person_id,
        other => panic!("expected a completed outcome, got {other:?}"),
    }
}

fn permutations<T: Clone>(items: &[T]) -> Vec<Vec<T>> {
    if items.len() <= 1 {
        return vec![items.to_vec()];
    }
    let mut result = Vec::new();
    for i in 0..items.len() {
        let mut rest = items.to_vec();
        let head = rest.remove(i);
        for mut tail in permutations(&rest) {
            tail.insert(0, head.clone());
            result.push(tail);
        }
    }
    result
}

#[tokio::test]
async fn test_anonymous_then_identified_across_devices() {
    let harness = Harness::new();

    let first = harness
        .process(EventBuilder::new("$pageview", "anon-1").build())
        .await;
    let p1 = completed_person(&first);
    assert_eq!(harness.person_of("anon-1").await, p1);

    let second = harness
        .process(EventBuilder::new(IDENTIFY_EVENT, "user-7").anon("anon-1").build())
        .await;
    assert_eq!(completed_person(&second), p1);
    assert_eq!(harness.person_of("user-7").await, p1);

    let third = harness
        .process(EventBuilder::new(IDENTIFY_EVENT, "user-7").anon("anon-9").build())
        .await;
    assert_eq!(completed_person(&third), p1);
    assert_eq!(harness.person_of("anon-9").await, p1);

    let fourth = harness
        .process(EventBuilder::new(IDENTIFY_EVENT, "user-7").anon("anon-1").build())
        .await;
    assert_eq!(
        fourth,
        PipelineOutcome::Completed {
            person_id: p1,
            merge: None
        }
    );

    assert_eq!(harness.live_persons(), 1);
    assert!(harness.store.merge_history(p1).await.unwrap().is_empty());
    assert_eq!(
        harness.store.distinct_ids_for(p1).await.unwrap(),
        vec!["anon-1", "anon-9", "user-7"]
    );
    let person = harness.store.raw_person(p1).unwrap();
    assert!(person.is_identified);
    assert_eq!(harness.sink.emitted().len(), 4);
}

#[tokio::test]
async fn test_alias_between_identified_persons_is_blocked() {
    let harness = Harness::new();

    harness
        .process(
            EventBuilder::new(IDENTIFY_EVENT, "user-a")
                .anon("anon-a")
                .set("name", json!("A"))
                .build(),
        )
        .await;
    harness
        .process(
            EventBuilder::new(IDENTIFY_EVENT, "user-b")
                .anon("anon-b")
                .set("name", json!("B"))
                .build(),
        )
        .await;
    let person_a = harness.person_of("user-a").await;
    let person_b = harness.person_of("user-b").await;

    let outcome = harness
        .process(EventBuilder::new(CREATE_ALIAS_EVENT, "user-a").alias("user-b").build())
        .await;

    let PipelineOutcome::Completed {
        person_id,
        merge: Some(record),
    } = outcome
    else {
        panic!("expected a completed outcome with a merge record, got {outcome:?}");
    };
    assert_eq!(person_id, person_a);
    assert_eq!(
        record.outcome,
        MergeOutcome::Blocked(BlockReason::AbsorbedAlreadyIdentified)
    );

    assert_eq!(harness.live_persons(), 2);
    assert_eq!(harness.person_of("user-b").await, person_b);
    let a = harness.store.raw_person(person_a).unwrap();
    let b = harness.store.raw_person(person_b).unwrap();
    assert_eq!(a.properties.get("name"), Some(&json!("A")));
    assert_eq!(b.properties.get("name"), Some(&json!("B")));
}

#[tokio::test]
async fn test_dangerous_merge_joins_identified_persons() {
    let harness = Harness::new();

    harness
        .process(
            EventBuilder::new(IDENTIFY_EVENT, "user-a")
                .anon("anon-a")
                .set("name", json!("A"))
                .build(),
        )
        .await;
    harness
        .process(
            EventBuilder::new(IDENTIFY_EVENT, "user-b")
                .anon("anon-b")
                .set("plan", json!("pro"))
                .build(),
        )
        .await;
    let person_a = harness.person_of("user-a").await;
    let person_b = harness.person_of("user-b").await;

    let outcome = harness
        .process(
            EventBuilder::new(MERGE_DANGEROUSLY_EVENT, "user-a")
                .alias("user-b")
                .build(),
        )
        .await;
    assert_eq!(completed_person(&outcome), person_a);

    assert_eq!(harness.live_persons(), 1);
    for id in ["user-a", "anon-a", "user-b", "anon-b"] {
        assert_eq!(harness.person_of(id).await, person_a);
    }
    let survivor = harness.store.raw_person(person_a).unwrap();
    assert_eq!(survivor.properties.get("name"), Some(&json!("A")));
    assert_eq!(survivor.properties.get("plan"), Some(&json!("pro")));
    assert_eq!(
        harness.store.raw_person(person_b).unwrap().merged_into,
        Some(person_a)
    );
    harness.assert_mappings_live();
}

#[tokio::test]
async fn test_identify_order_does_not_change_final_mapping() {
    let events = [
        EventBuilder::new("$pageview", "anon-1").build(),
        EventBuilder::new("$pageview", "anon-2").build(),
        EventBuilder::new(IDENTIFY_EVENT, "user-1").anon("anon-1").build(),
        EventBuilder::new(IDENTIFY_EVENT, "user-1").anon("anon-2").build(),
    ];

    for order in permutations(&events) {
        let harness = Harness::new();
        for event in order {
            harness.process(event).await;
        }

        let person = harness.person_of("user-1").await;
        assert_eq!(harness.person_of("anon-1").await, person);
        assert_eq!(harness.person_of("anon-2").await, person);
        assert_eq!(harness.live_persons(), 1);
        assert!(harness.store.raw_person(person).unwrap().is_identified);
        harness.assert_mappings_live();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_interleaved_identify_events_converge() {
    let store = Arc::new(MemoryPersonStore::new());
    let faulty = Arc::new(FaultyPersonStore::new(store.clone()));
    let harness = Harness::with_store(store, faulty.clone());

    let anon_1 = completed_person(
        &harness
            .process(EventBuilder::new("$pageview", "anon-1").build())
            .await,
    );
    let anon_2 = completed_person(
        &harness
            .process(EventBuilder::new("$pageview", "anon-2").build())
            .await,
    );

    // The first identify stalls right before linking user-1 to anon-1's person.
    let pause = faulty.pause_before("add_identifier_mapping");
    let pipeline = harness.pipeline.clone();
    let stalled = tokio::spawn(async move {
        pipeline
            .process(EventBuilder::new(IDENTIFY_EVENT, "user-1").anon("anon-1").build())
            .await
    });
    pause.reached().await;

    // Meanwhile user-1 is linked to anon-2's person.
    let racing = harness
        .process(EventBuilder::new(IDENTIFY_EVENT, "user-1").anon("anon-2").build())
        .await;
    assert_eq!(completed_person(&racing), anon_2);

    pause.release();
    let outcome = stalled.await.unwrap().unwrap();

    // The stalled event lost the race, re-read and merged anon-1's person into the winner.
    let PipelineOutcome::Completed {
        person_id,
        merge: Some(record),
    } = outcome
    else {
        panic!("expected a merge, got {outcome:?}");
    };
    assert_eq!(person_id, anon_2);
    assert!(record.is_completed());
    assert_eq!(record.absorbed_person_id, anon_1);

    for id in ["user-1", "anon-1", "anon-2"] {
        assert_eq!(harness.person_of(id).await, anon_2);
    }
    assert_eq!(harness.live_persons(), 1);
    harness.assert_mappings_live();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_identify_events_converge() {
    for _ in 0..20 {
        let harness = Harness::new();
        let mut tasks = Vec::new();
        for anon in ["anon-1", "anon-2", "anon-3", "anon-4"] {
            for event in [
                EventBuilder::new("$pageview", anon).build(),
                EventBuilder::new(IDENTIFY_EVENT, "user-1").anon(anon).build(),
            ] {
                let pipeline = harness.pipeline.clone();
                tasks.push(tokio::spawn(async move { pipeline.process(event).await }));
            }
        }
        for task in tasks {
            let outcome = task.await.unwrap().unwrap();
            assert!(matches!(outcome, PipelineOutcome::Completed { .. }));
        }

        let person = harness.person_of("user-1").await;
        for anon in ["anon-1", "anon-2", "anon-3", "anon-4"] {
            assert_eq!(harness.person_of(anon).await, person);
        }
        assert_eq!(harness.live_persons(), 1);
        harness.assert_mappings_live();
    }
}

#[tokio::test]
async fn test_tombstone_chains_resolve_without_cycles() {
    let harness = Harness::new();

    for user in ["user-x", "user-y", "user-z"] {
        harness
            .process(
                EventBuilder::new(IDENTIFY_EVENT, user)
                    .anon(&format!("anon-{user}"))
                    .build(),
            )
            .await;
    }
    let x = harness.person_of("user-x").await;
    let y = harness.person_of("user-y").await;
    let z = harness.person_of("user-z").await;

    // y is absorbed by x, then x by z.
    harness
        .process(
            EventBuilder::new(MERGE_DANGEROUSLY_EVENT, "user-x")
                .alias("user-y")
                .build(),
        )
        .await;
    harness
        .process(
            EventBuilder::new(MERGE_DANGEROUSLY_EVENT, "user-z")
                .alias("user-x")
                .build(),
        )
        .await;

    // A stale reference to y resolves to z; its tombstone was repointed when x was absorbed.
    let resolved = harness.store.get_person(y).await.unwrap().unwrap();
    assert_eq!(resolved.id, z);
    assert_eq!(harness.store.raw_person(y).unwrap().merged_into, Some(z));
    assert_eq!(harness.store.raw_person(x).unwrap().merged_into, Some(z));

    for person in harness.store.all_persons() {
        let mut seen = HashSet::from([person.id]);
        let mut current = person;
        while let Some(next) = current.merged_into {
            assert!(seen.insert(next), "redirect cycle through {next}");
            assert!(seen.len() <= MAX_REDIRECT_DEPTH + 1);
            current = harness.store.raw_person(next).unwrap();
        }
        assert!(current.is_live());
        assert_eq!(current.id, z);
    }
    harness.assert_mappings_live();
}

#[tokio::test]
async fn test_long_dangerous_merge_chain_resolves_stale_ids() {
    let harness = Harness::new();
    let users: Vec<String> = (0..=MAX_REDIRECT_DEPTH + 4)
        .map(|i| format!("user-{i}"))
        .collect();

    for user in &users {
        harness
            .process(
                EventBuilder::new(IDENTIFY_EVENT, user)
                    .anon(&format!("anon-{user}"))
                    .build(),
            )
            .await;
    }
    let first = harness.person_of(&users[0]).await;

    // Every user absorbs the previous one, which has already absorbed all earlier users.
    for pair in users.windows(2) {
        harness
            .process(
                EventBuilder::new(MERGE_DANGEROUSLY_EVENT, &pair[1])
                    .alias(&pair[0])
                    .build(),
            )
            .await;
    }

    let last = harness.person_of(&users[users.len() - 1]).await;
    assert_eq!(harness.person_of(&users[0]).await, last);
    assert_eq!(harness.live_persons(), 1);

    let resolved = harness.store.get_person(first).await.unwrap().unwrap();
    assert_eq!(resolved.id, last);
    for person in harness.store.all_persons() {
        if let Some(next) = person.merged_into {
            assert_eq!(next, last);
        }
    }

    // Later events for the oldest identifier land on the survivor.
    let updated = harness
        .process(
            EventBuilder::new("$pageview", &users[0])
                .set("plan", json!("pro"))
                .build(),
        )
        .await;
    assert_eq!(completed_person(&updated), last);
    harness.assert_mappings_live();
}

#[tokio::test]
async fn test_repeated_merge_changes_nothing() {
    let store = Arc::new(MemoryPersonStore::new());
    let harness = Harness::with_store(store.clone(), store.clone());
    harness
        .process(EventBuilder::new("$pageview", "anon-1").build())
        .await;
    harness
        .process(EventBuilder::new("$pageview", "user-1").build())
        .await;
    let survivor = harness.person_of("user-1").await;
    let absorbed = harness.person_of("anon-1").await;

    let coordinator = MergeCoordinator::new(store.clone());
    let first = coordinator
        .merge(survivor, absorbed, MergeKind::Identify)
        .await
        .unwrap();
    assert!(first.is_completed());
    let after_first = store.all_persons();

    let second = coordinator
        .merge(survivor, absorbed, MergeKind::Identify)
        .await
        .unwrap();
    assert!(second.is_completed());
    assert_eq!(second.surviving_person_id, survivor);

    let mut after_second = store.all_persons();
    let mut after_first = after_first;
    after_first.sort_by_key(|p| p.id);
    after_second.sort_by_key(|p| p.id);
    assert_eq!(after_first, after_second);
    assert_eq!(store.merge_history(survivor).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_duplicate_event_is_processed_once() {
    let harness = Harness::new();
    let event = EventBuilder::new("$pageview", "anon-1")
        .set("visits", json!(1))
        .build();

    let first = harness.process(event.clone()).await;
    assert!(matches!(first, PipelineOutcome::Completed { .. }));

    let second = harness.process(event).await;
    assert_eq!(second, PipelineOutcome::Dropped(DropReason::Duplicate));

    assert_eq!(harness.sink.emitted().len(), 1);
    let person = harness.person_of("anon-1").await;
    // Created, then one property write.
    assert_eq!(harness.store.raw_person(person).unwrap().version, 1);
}
