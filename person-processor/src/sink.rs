use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::postgres::PgPool;
use sqlx::types::Json;
use tokio::io::{AsyncWriteExt, Stdout};
use tokio::sync::Mutex;

use crate::error::SinkError;
use crate::types::{Event, FinalizedEvent};

/// An event that could not complete the pipeline, with the reason it was deferred.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverflowRecord {
    pub event: Event,
    pub step: &'static str,
    pub reason: String,
    pub attempts: u32,
    pub overflowed_at: DateTime<Utc>,
}

/// Destination of finalized events, the analytical store's write path.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, finalized: &FinalizedEvent) -> Result<(), SinkError>;
}

/// Destination of events deferred for later reprocessing.
#[async_trait]
pub trait OverflowSink: Send + Sync {
    async fn overflow(&self, record: &OverflowRecord) -> Result<(), SinkError>;
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum StdoutLine<'a> {
    Finalized(&'a FinalizedEvent),
    Overflow(&'a OverflowRecord),
}

/// Writes one JSON document per line to stdout, tagged with its kind.
pub struct StdoutSink {
    stdout: Mutex<Stdout>,
}

impl StdoutSink {
    pub fn new() -> Self {
        Self {
            stdout: Mutex::new(tokio::io::stdout()),
        }
    }

    async fn write_line(&self, line: &StdoutLine<'_>) -> Result<(), SinkError> {
        let mut payload = serde_json::to_vec(line)?;
        payload.push(b'\n');

        let mut stdout = self.stdout.lock().await;
        stdout.write_all(&payload).await?;
        stdout.flush().await?;
        Ok(())
    }
}

impl Default for StdoutSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventSink for StdoutSink {
    async fn emit(&self, finalized: &FinalizedEvent) -> Result<(), SinkError> {
        self.write_line(&StdoutLine::Finalized(finalized)).await
    }
}

#[async_trait]
impl OverflowSink for StdoutSink {
    async fn overflow(&self, record: &OverflowRecord) -> Result<(), SinkError> {
        self.write_line(&StdoutLine::Overflow(record)).await
    }
}

/// Keeps overflowed events in the `event_overflow` table.
pub struct PgOverflowSink {
    pool: PgPool,
}

impl PgOverflowSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OverflowSink for PgOverflowSink {
    async fn overflow(&self, record: &OverflowRecord) -> Result<(), SinkError> {
        let attempts = i32::try_from(record.attempts).unwrap_or(i32::MAX);
        sqlx::query(
            r#"
INSERT INTO event_overflow (event_uuid, step, reason, attempts, event, overflowed_at)
VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(record.event.uuid)
        .bind(record.step)
        .bind(&record.reason)
        .bind(attempts)
        .bind(Json(&record.event))
        .bind(record.overflowed_at)
        .execute(&self.pool)
        .await
        .map_err(|error| match error {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                SinkError::Unavailable(error.to_string())
            }
            error => SinkError::QueryError {
                command: "INSERT".to_owned(),
                error,
            },
        })?;
        Ok(())
    }
}
