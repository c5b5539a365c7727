use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use uuid::Uuid;

use crate::store::{
    MergeRequest, NewPerson, PersonStore, StoreError, StoreResult, MAX_REDIRECT_DEPTH,
};
use crate::types::{MergeRecord, Person, Properties};

#[derive(Default)]
struct State {
    persons: HashMap<Uuid, Person>,
    distinct_ids: HashMap<String, Uuid>,
    merges: Vec<MergeRecord>,
}

impl State {
    fn resolve(&self, person_id: Uuid) -> StoreResult<Option<&Person>> {
        let mut current = person_id;
        for _ in 0..=MAX_REDIRECT_DEPTH {
            match self.persons.get(&current) {
                None => return Ok(None),
                Some(person) => match person.merged_into {
                    None => return Ok(Some(person)),
                    Some(survivor) => current = survivor,
                },
            }
        }
        Err(StoreError::RedirectLimit(person_id))
    }

    /// Borrow a person for writing after checking it is live and unchanged.
    fn guarded(&mut self, person_id: Uuid, expected_version: i64) -> StoreResult<&mut Person> {
        let person = self
            .persons
            .get_mut(&person_id)
            .ok_or(StoreError::PersonNotFound(person_id))?;
        if !person.is_live() {
            return Err(StoreError::PersonMerged(person_id));
        }
        if person.version != expected_version {
            return Err(StoreError::VersionConflict {
                person_id,
                expected: expected_version,
            });
        }
        Ok(person)
    }
}

/// In-process `PersonStore`.
///
/// A single mutex guards all state, which makes every operation trivially atomic. The
/// lock is never held across an await point.
#[derive(Default)]
pub struct MemoryPersonStore {
    state: Mutex<State>,
}

impl MemoryPersonStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("poisoned person store mutex".to_owned()))
    }

    /// Raw read without following redirects, for inspecting tombstones.
    pub fn raw_person(&self, person_id: Uuid) -> Option<Person> {
        self.lock()
            .ok()
            .and_then(|state| state.persons.get(&person_id).cloned())
    }

    /// All persons, live and tombstoned.
    pub fn all_persons(&self) -> Vec<Person> {
        self.lock()
            .map(|state| state.persons.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of the identifier mapping table.
    pub fn mappings(&self) -> HashMap<String, Uuid> {
        self.lock()
            .map(|state| state.distinct_ids.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl PersonStore for MemoryPersonStore {
    async fn get_by_identifier(&self, distinct_id: &str) -> StoreResult<Option<Person>> {
        let state = self.lock()?;
        match state.distinct_ids.get(distinct_id) {
            None => Ok(None),
            Some(person_id) => Ok(state.resolve(*person_id)?.cloned()),
        }
    }

    async fn get_person(&self, person_id: Uuid) -> StoreResult<Option<Person>> {
        let state = self.lock()?;
        Ok(state.resolve(person_id)?.cloned())
    }

    async fn distinct_ids_for(&self, person_id: Uuid) -> StoreResult<Vec<String>> {
        let state = self.lock()?;
        let mut ids: Vec<String> = state
            .distinct_ids
            .iter()
            .filter(|(_, mapped)| **mapped == person_id)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn create(&self, new: NewPerson) -> StoreResult<Person> {
        let mut state = self.lock()?;
        if let Some(taken) = new
            .distinct_ids
            .iter()
            .find(|id| state.distinct_ids.contains_key(id.as_str()))
        {
            return Err(StoreError::IdentifierTaken(taken.clone()));
        }

        let person = Person {
            id: Uuid::now_v7(),
            properties: new.properties,
            created_at: new.created_at,
            version: 0,
            is_identified: new.is_identified,
            merged_into: None,
        };
        for distinct_id in new.distinct_ids {
            state.distinct_ids.insert(distinct_id, person.id);
        }
        state.persons.insert(person.id, person.clone());
        Ok(person)
    }

    async fn add_identifier_mapping(
        &self,
        distinct_id: &str,
        person_id: Uuid,
        expected_version: i64,
        mark_identified: bool,
    ) -> StoreResult<Person> {
        let mut state = self.lock()?;
        if state.distinct_ids.contains_key(distinct_id) {
            return Err(StoreError::IdentifierTaken(distinct_id.to_owned()));
        }

        let person = state.guarded(person_id, expected_version)?;
        person.version += 1;
        person.is_identified |= mark_identified;
        let updated = person.clone();

        state.distinct_ids.insert(distinct_id.to_owned(), person_id);
        Ok(updated)
    }

    async fn mark_identified(&self, person_id: Uuid, expected_version: i64) -> StoreResult<Person> {
        let mut state = self.lock()?;
        let person = state.guarded(person_id, expected_version)?;
        person.version += 1;
        person.is_identified = true;
        Ok(person.clone())
    }

    async fn update_properties(
        &self,
        person_id: Uuid,
        properties: Properties,
        expected_version: i64,
    ) -> StoreResult<Person> {
        let mut state = self.lock()?;
        let person = state.guarded(person_id, expected_version)?;
        person.version += 1;
        person.properties = properties;
        Ok(person.clone())
    }

    async fn merge_transaction(&self, request: MergeRequest) -> StoreResult<MergeRecord> {
        let mut state = self.lock()?;

        // Validate both guards before touching anything.
        state.guarded(request.survivor_id, request.survivor_version)?;
        state.guarded(request.absorbed_id, request.absorbed_version)?;

        for person_id in state.distinct_ids.values_mut() {
            if *person_id == request.absorbed_id {
                *person_id = request.survivor_id;
            }
        }

        let survivor = state.guarded(request.survivor_id, request.survivor_version)?;
        survivor.version += 1;
        survivor.properties = request.properties;
        survivor.created_at = request.created_at;
        survivor.is_identified = true;

        let absorbed = state.guarded(request.absorbed_id, request.absorbed_version)?;
        absorbed.version += 1;
        absorbed.merged_into = Some(request.survivor_id);

        // Earlier tombstones of the absorbed person now point straight at the survivor.
        for person in state.persons.values_mut() {
            if person.merged_into == Some(request.absorbed_id) {
                person.merged_into = Some(request.survivor_id);
            }
        }

        let record = MergeRecord::completed(request.survivor_id, request.absorbed_id);
        state.merges.push(record.clone());
        Ok(record)
    }

    async fn record_blocked_merge(&self, record: &MergeRecord) -> StoreResult<()> {
        self.lock()?.merges.push(record.clone());
        Ok(())
    }

    async fn merge_history(&self, person_id: Uuid) -> StoreResult<Vec<MergeRecord>> {
        let state = self.lock()?;
        Ok(state
            .merges
            .iter()
            .filter(|r| r.surviving_person_id == person_id || r.absorbed_person_id == person_id)
            .cloned()
            .collect())
    }
}
