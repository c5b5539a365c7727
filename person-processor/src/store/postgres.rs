//! # PgPersonStore
//!
//! A `PersonStore` backed by PostgreSQL. Version guards are enforced in the `WHERE`
//! clause of every update, and merges lock both person rows in id order before
//! checking them so that two concurrent merges cannot deadlock or both commit.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::store::{
    MergeRequest, NewPerson, PersonStore, StoreError, StoreResult, MAX_REDIRECT_DEPTH,
};
use crate::types::{MergeOutcome, MergeRecord, Person, Properties};

const PERSON_COLUMNS: &str = "id, properties, created_at, version, is_identified, merged_into";

#[derive(sqlx::FromRow)]
struct PersonRow {
    id: Uuid,
    properties: Json<Properties>,
    created_at: DateTime<Utc>,
    version: i64,
    is_identified: bool,
    merged_into: Option<Uuid>,
}

impl From<PersonRow> for Person {
    fn from(row: PersonRow) -> Self {
        Person {
            id: row.id,
            properties: row.properties.0,
            created_at: row.created_at,
            version: row.version,
            is_identified: row.is_identified,
            merged_into: row.merged_into,
        }
    }
}

#[derive(sqlx::FromRow)]
struct MergeRow {
    surviving_person_id: Uuid,
    absorbed_person_id: Uuid,
    merged_at: DateTime<Utc>,
    outcome: String,
}

fn query_error(command: &'static str) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |error| match error {
        sqlx::Error::PoolTimedOut => StoreError::Timeout,
        sqlx::Error::PoolClosed => StoreError::Unavailable("connection pool closed".to_owned()),
        error => StoreError::QueryError {
            command: command.to_owned(),
            error,
        },
    }
}

pub struct PgPersonStore {
    pool: PgPool,
}

impl PgPersonStore {
    pub async fn new(url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|error| StoreError::Unavailable(error.to_string()))?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the schema migrations bundled with this crate.
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|error| StoreError::Unavailable(format!("migration failed: {error}")))
    }

    async fn begin(&self) -> StoreResult<Transaction<'static, Postgres>> {
        self.pool.begin().await.map_err(query_error("BEGIN"))
    }

    async fn fetch_raw(&self, person_id: Uuid) -> StoreResult<Option<Person>> {
        let query = format!("SELECT {PERSON_COLUMNS} FROM persons WHERE id = $1");
        let row: Option<PersonRow> = sqlx::query_as(&query)
            .bind(person_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_error("SELECT"))?;
        Ok(row.map(Person::from))
    }
}

/// Explain why a guarded update matched no row.
async fn guard_failure(
    tx: &mut Transaction<'static, Postgres>,
    person_id: Uuid,
    expected_version: i64,
) -> StoreError {
    let row: Result<Option<(i64, Option<Uuid>)>, _> =
        sqlx::query_as("SELECT version, merged_into FROM persons WHERE id = $1")
            .bind(person_id)
            .fetch_optional(&mut **tx)
            .await;

    match row {
        Err(error) => query_error("SELECT")(error),
        Ok(None) => StoreError::PersonNotFound(person_id),
        Ok(Some((_, Some(_)))) => StoreError::PersonMerged(person_id),
        Ok(Some(_)) => StoreError::VersionConflict {
            person_id,
            expected: expected_version,
        },
    }
}

/// Insert a mapping unless the identifier is already taken.
async fn insert_mapping(
    tx: &mut Transaction<'static, Postgres>,
    distinct_id: &str,
    person_id: Uuid,
) -> StoreResult<()> {
    let result = sqlx::query(
        r#"
INSERT INTO person_distinct_ids (distinct_id, person_id)
VALUES ($1, $2)
ON CONFLICT (distinct_id) DO NOTHING
        "#,
    )
    .bind(distinct_id)
    .bind(person_id)
    .execute(&mut **tx)
    .await
    .map_err(query_error("INSERT"))?;

    if result.rows_affected() == 0 {
        return Err(StoreError::IdentifierTaken(distinct_id.to_owned()));
    }
    Ok(())
}

async fn insert_merge(
    tx: &mut Transaction<'static, Postgres>,
    record: &MergeRecord,
) -> StoreResult<()> {
    sqlx::query(
        r#"
INSERT INTO person_merges (surviving_person_id, absorbed_person_id, merged_at, outcome)
VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(record.surviving_person_id)
    .bind(record.absorbed_person_id)
    .bind(record.merged_at)
    .bind(record.outcome.to_string())
    .execute(&mut **tx)
    .await
    .map_err(query_error("INSERT"))?;
    Ok(())
}

#[async_trait]
impl PersonStore for PgPersonStore {
    async fn get_by_identifier(&self, distinct_id: &str) -> StoreResult<Option<Person>> {
        let person_id: Option<(Uuid,)> =
            sqlx::query_as("SELECT person_id FROM person_distinct_ids WHERE distinct_id = $1")
                .bind(distinct_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(query_error("SELECT"))?;

        match person_id {
            None => Ok(None),
            Some((person_id,)) => self.get_person(person_id).await,
        }
    }

    async fn get_person(&self, person_id: Uuid) -> StoreResult<Option<Person>> {
        let mut current = person_id;
        for _ in 0..=MAX_REDIRECT_DEPTH {
            match self.fetch_raw(current).await? {
                None => return Ok(None),
                Some(person) => match person.merged_into {
                    None => return Ok(Some(person)),
                    Some(survivor) => current = survivor,
                },
            }
        }
        Err(StoreError::RedirectLimit(person_id))
    }

    async fn distinct_ids_for(&self, person_id: Uuid) -> StoreResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT distinct_id FROM person_distinct_ids WHERE person_id = $1 ORDER BY distinct_id",
        )
        .bind(person_id)
        .fetch_all(&self.pool)
        .await
        .map_err(query_error("SELECT"))?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn create(&self, new: NewPerson) -> StoreResult<Person> {
        let mut tx = self.begin().await?;

        let query = format!(
            r#"
INSERT INTO persons (id, properties, created_at, version, is_identified)
VALUES ($1, $2, $3, 0, $4)
RETURNING {PERSON_COLUMNS}
            "#
        );
        let row: PersonRow = sqlx::query_as(&query)
            .bind(Uuid::now_v7())
            .bind(Json(&new.properties))
            .bind(new.created_at)
            .bind(new.is_identified)
            .fetch_one(&mut *tx)
            .await
            .map_err(query_error("INSERT"))?;

        for distinct_id in &new.distinct_ids {
            // Dropping the transaction on error rolls back the person insert.
            insert_mapping(&mut tx, distinct_id, row.id).await?;
        }

        tx.commit().await.map_err(query_error("COMMIT"))?;
        Ok(row.into())
    }

    async fn add_identifier_mapping(
        &self,
        distinct_id: &str,
        person_id: Uuid,
        expected_version: i64,
        mark_identified: bool,
    ) -> StoreResult<Person> {
        let mut tx = self.begin().await?;

        let query = format!(
            r#"
UPDATE persons
SET version = version + 1, is_identified = is_identified OR $3
WHERE id = $1 AND version = $2 AND merged_into IS NULL
RETURNING {PERSON_COLUMNS}
            "#
        );
        let row: Option<PersonRow> = sqlx::query_as(&query)
            .bind(person_id)
            .bind(expected_version)
            .bind(mark_identified)
            .fetch_optional(&mut *tx)
            .await
            .map_err(query_error("UPDATE"))?;

        let Some(row) = row else {
            return Err(guard_failure(&mut tx, person_id, expected_version).await);
        };

        insert_mapping(&mut tx, distinct_id, person_id).await?;
        tx.commit().await.map_err(query_error("COMMIT"))?;
        Ok(row.into())
    }

    async fn mark_identified(&self, person_id: Uuid, expected_version: i64) -> StoreResult<Person> {
        let mut tx = self.begin().await?;

        let query = format!(
            r#"
UPDATE persons
SET version = version + 1, is_identified = TRUE
WHERE id = $1 AND version = $2 AND merged_into IS NULL
RETURNING {PERSON_COLUMNS}
            "#
        );
        let row: Option<PersonRow> = sqlx::query_as(&query)
            .bind(person_id)
            .bind(expected_version)
            .fetch_optional(&mut *tx)
            .await
            .map_err(query_error("UPDATE"))?;

        let Some(row) = row else {
            return Err(guard_failure(&mut tx, person_id, expected_version).await);
        };

        tx.commit().await.map_err(query_error("COMMIT"))?;
        Ok(row.into())
    }

    async fn update_properties(
        &self,
        person_id: Uuid,
        properties: Properties,
        expected_version: i64,
    ) -> StoreResult<Person> {
        let mut tx = self.begin().await?;

        let query = format!(
            r#"
UPDATE persons
SET version = version + 1, properties = $3
WHERE id = $1 AND version = $2 AND merged_into IS NULL
RETURNING {PERSON_COLUMNS}
            "#
        );
        let row: Option<PersonRow> = sqlx::query_as(&query)
            .bind(person_id)
            .bind(expected_version)
            .bind(Json(&properties))
            .fetch_optional(&mut *tx)
            .await
            .map_err(query_error("UPDATE"))?;

        let Some(row) = row else {
            return Err(guard_failure(&mut tx, person_id, expected_version).await);
        };

        tx.commit().await.map_err(query_error("COMMIT"))?;
        Ok(row.into())
    }

    async fn merge_transaction(&self, request: MergeRequest) -> StoreResult<MergeRecord> {
        let mut tx = self.begin().await?;

        let locked: Vec<(Uuid, i64, Option<Uuid>)> = sqlx::query_as(
            r#"
SELECT id, version, merged_into FROM persons
WHERE id = ANY($1)
ORDER BY id
FOR UPDATE
            "#,
        )
        .bind(vec![request.survivor_id, request.absorbed_id])
        .fetch_all(&mut *tx)
        .await
        .map_err(query_error("SELECT"))?;

        for (person_id, expected) in [
            (request.survivor_id, request.survivor_version),
            (request.absorbed_id, request.absorbed_version),
        ] {
            match locked.iter().find(|(id, _, _)| *id == person_id) {
                None => return Err(StoreError::PersonNotFound(person_id)),
                Some((_, _, Some(_))) => return Err(StoreError::PersonMerged(person_id)),
                Some((_, version, None)) if *version != expected => {
                    return Err(StoreError::VersionConflict {
                        person_id,
                        expected,
                    })
                }
                Some(_) => {}
            }
        }

        sqlx::query("UPDATE person_distinct_ids SET person_id = $1 WHERE person_id = $2")
            .bind(request.survivor_id)
            .bind(request.absorbed_id)
            .execute(&mut *tx)
            .await
            .map_err(query_error("UPDATE"))?;

        sqlx::query(
            r#"
UPDATE persons
SET version = version + 1, properties = $2, created_at = $3, is_identified = TRUE
WHERE id = $1
            "#,
        )
        .bind(request.survivor_id)
        .bind(Json(&request.properties))
        .bind(request.created_at)
        .execute(&mut *tx)
        .await
        .map_err(query_error("UPDATE"))?;

        sqlx::query("UPDATE persons SET version = version + 1, merged_into = $2 WHERE id = $1")
            .bind(request.absorbed_id)
            .bind(request.survivor_id)
            .execute(&mut *tx)
            .await
            .map_err(query_error("UPDATE"))?;

        // Keep tombstones one hop away from a live person.
        sqlx::query("UPDATE persons SET merged_into = $1 WHERE merged_into = $2")
            .bind(request.survivor_id)
            .bind(request.absorbed_id)
            .execute(&mut *tx)
            .await
            .map_err(query_error("UPDATE"))?;

        let record = MergeRecord::completed(request.survivor_id, request.absorbed_id);
        insert_merge(&mut tx, &record).await?;

        tx.commit().await.map_err(query_error("COMMIT"))?;
        Ok(record)
    }

    async fn record_blocked_merge(&self, record: &MergeRecord) -> StoreResult<()> {
        let mut tx = self.begin().await?;
        insert_merge(&mut tx, record).await?;
        tx.commit().await.map_err(query_error("COMMIT"))
    }

    async fn merge_history(&self, person_id: Uuid) -> StoreResult<Vec<MergeRecord>> {
        let rows: Vec<MergeRow> = sqlx::query_as(
            r#"
SELECT surviving_person_id, absorbed_person_id, merged_at, outcome
FROM person_merges
WHERE surviving_person_id = $1 OR absorbed_person_id = $1
ORDER BY id
            "#,
        )
        .bind(person_id)
        .fetch_all(&self.pool)
        .await
        .map_err(query_error("SELECT"))?;

        rows.into_iter()
            .map(|row| {
                let outcome: MergeOutcome = row
                    .outcome
                    .parse()
                    .map_err(|e: crate::types::ParseMergeOutcomeError| {
                        StoreError::Unavailable(e.to_string())
                    })?;
                Ok(MergeRecord {
                    surviving_person_id: row.surviving_person_id,
                    absorbed_person_id: row.absorbed_person_id,
                    merged_at: row.merged_at,
                    outcome,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn new_person(distinct_ids: &[&str]) -> NewPerson {
        NewPerson {
            distinct_ids: distinct_ids.iter().map(|id| id.to_string()).collect(),
            properties: Properties::new(),
            created_at: Utc::now(),
            is_identified: true,
        }
    }

    fn merge_request(survivor: &Person, absorbed: &Person) -> MergeRequest {
        let mut properties = Properties::new();
        properties.insert("merged".to_string(), json!(true));
        MergeRequest {
            survivor_id: survivor.id,
            survivor_version: survivor.version,
            absorbed_id: absorbed.id,
            absorbed_version: absorbed.version,
            properties,
            created_at: survivor.created_at,
        }
    }

    async fn person_count(db: &PgPool) -> i64 {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM persons")
            .fetch_one(db)
            .await
            .unwrap();
        count
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn test_merge_repoints_identifiers_and_tombstones(db: PgPool) {
        let store = PgPersonStore::from_pool(db);
        let survivor = store.create(new_person(&["user-1"])).await.unwrap();
        let absorbed = store.create(new_person(&["user-2", "anon-2"])).await.unwrap();

        let record = store
            .merge_transaction(merge_request(&survivor, &absorbed))
            .await
            .unwrap();

        assert!(record.is_completed());
        for id in ["user-1", "user-2", "anon-2"] {
            let person = store.get_by_identifier(id).await.unwrap().unwrap();
            assert_eq!(person.id, survivor.id);
            assert_eq!(person.properties.get("merged"), Some(&json!(true)));
        }
        assert_eq!(
            store.distinct_ids_for(survivor.id).await.unwrap(),
            vec!["anon-2", "user-1", "user-2"]
        );

        let tombstone = store.fetch_raw(absorbed.id).await.unwrap().unwrap();
        assert_eq!(tombstone.merged_into, Some(survivor.id));
        let history = store.merge_history(absorbed.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].surviving_person_id, survivor.id);
        assert_eq!(history[0].outcome, MergeOutcome::Completed);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn test_merge_with_stale_version_writes_nothing(db: PgPool) {
        let store = PgPersonStore::from_pool(db);
        let survivor = store.create(new_person(&["user-1"])).await.unwrap();
        let absorbed = store.create(new_person(&["user-2"])).await.unwrap();
        let request = merge_request(&survivor, &absorbed);
        store
            .update_properties(survivor.id, Properties::new(), survivor.version)
            .await
            .unwrap();

        let error = store.merge_transaction(request).await.unwrap_err();

        assert!(matches!(
            error,
            StoreError::VersionConflict { person_id, .. } if person_id == survivor.id
        ));
        let still_absorbed = store.get_by_identifier("user-2").await.unwrap().unwrap();
        assert_eq!(still_absorbed.id, absorbed.id);
        assert_eq!(still_absorbed.merged_into, None);
        assert!(store.merge_history(absorbed.id).await.unwrap().is_empty());
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn test_merge_repoints_earlier_tombstones(db: PgPool) {
        let store = PgPersonStore::from_pool(db);
        let first = store.create(new_person(&["user-1"])).await.unwrap();
        let second = store.create(new_person(&["user-2"])).await.unwrap();
        let third = store.create(new_person(&["user-3"])).await.unwrap();

        store
            .merge_transaction(merge_request(&second, &first))
            .await
            .unwrap();
        let second = store.get_person(second.id).await.unwrap().unwrap();
        store
            .merge_transaction(merge_request(&third, &second))
            .await
            .unwrap();

        for tombstone in [first.id, second.id] {
            let raw = store.fetch_raw(tombstone).await.unwrap().unwrap();
            assert_eq!(raw.merged_into, Some(third.id));
        }
        let resolved = store.get_by_identifier("user-1").await.unwrap().unwrap();
        assert_eq!(resolved.id, third.id);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn test_create_with_taken_identifier_rolls_back(db: PgPool) {
        let store = PgPersonStore::from_pool(db.clone());
        let existing = store.create(new_person(&["user-1"])).await.unwrap();

        let error = store
            .create(new_person(&["user-2", "user-1"]))
            .await
            .unwrap_err();

        assert!(matches!(error, StoreError::IdentifierTaken(id) if id == "user-1"));
        assert_eq!(person_count(&db).await, 1);
        assert_eq!(store.get_by_identifier("user-2").await.unwrap(), None);
        let owner = store.get_by_identifier("user-1").await.unwrap().unwrap();
        assert_eq!(owner.id, existing.id);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn test_writes_to_a_merged_person_are_refused(db: PgPool) {
        let store = PgPersonStore::from_pool(db);
        let survivor = store.create(new_person(&["user-1"])).await.unwrap();
        let absorbed = store.create(new_person(&["user-2"])).await.unwrap();
        store
            .merge_transaction(merge_request(&survivor, &absorbed))
            .await
            .unwrap();

        let error = store
            .add_identifier_mapping("anon-2", absorbed.id, absorbed.version + 1, false)
            .await
            .unwrap_err();

        assert!(matches!(error, StoreError::PersonMerged(id) if id == absorbed.id));
        assert_eq!(store.get_by_identifier("anon-2").await.unwrap(), None);
    }
}
