//! SQLite-backed persistence implementation.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use crate::continuation::{Response, WaitMode, WaitOutcome};
use crate::error::{EngineError, Result};
use crate::migrations::SQLITE as MIGRATOR;

use super::{
    Completion, EventRecord, InstanceFilter, InstanceRecord, InstanceState, NewInstance,
    Persistence, StoredContinuation, WaitRecord,
};

const INSTANCE_COLUMNS: &str = "instance_id, alias, version, state, priority, pool_id, \
     enqueue_seq, wait_deadline, cancel_requested, result, error, termination_reason, \
     created_at, updated_at, finished_at";

const NEXT_ENQUEUE_SEQ: &str = "(SELECT COALESCE(MAX(enqueue_seq), 0) + 1 FROM instances)";

/// Responses another pending wait may still need are kept: recovery replays
/// them to rebuild partially received ALL sets.
const UNREFERENCED_RESPONSE: &str = "NOT EXISTS (SELECT 1 FROM wait_conditions w, json_each(w.correlation_ids) j WHERE j.value = responses.correlation_id)";

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing, migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to a database URL and run migrations.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .map_err(|e| EngineError::Storage {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {}: {}", url, e),
            })?;
        Self::migrated(pool).await
    }

    /// Create and initialize a new SQLite persistence from a file path.
    ///
    /// Creates parent directories and the database file if needed, then runs
    /// all migrations.
    ///
    /// ```ignore
    /// let persistence = SqlitePersistence::from_path(".data/waypoint.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| EngineError::Storage {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        Self::connect(&url).await
    }

    async fn migrated(pool: SqlitePool) -> Result<Self> {
        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| EngineError::Storage {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })?;
        Ok(Self { pool })
    }
}

#[derive(sqlx::FromRow)]
struct WaitRow {
    instance_id: String,
    mode: String,
    correlation_ids: String,
    deadline: Option<DateTime<Utc>>,
}

impl TryFrom<WaitRow> for WaitRecord {
    type Error = EngineError;

    fn try_from(row: WaitRow) -> Result<Self> {
        let mode = WaitMode::parse(&row.mode).ok_or_else(|| {
            EngineError::serialization("wait mode", format!("unknown mode '{}'", row.mode))
        })?;
        let correlation_ids = serde_json::from_str(&row.correlation_ids)
            .map_err(|e| EngineError::serialization("correlation ids", e))?;
        Ok(Self {
            instance_id: row.instance_id,
            mode,
            correlation_ids,
            deadline: row.deadline,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ResponseRow {
    correlation_id: String,
    payload: String,
    received_at: DateTime<Utc>,
}

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    async fn create_instance(&self, instance: &NewInstance) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            r#"
            INSERT INTO instances (instance_id, alias, version, state, priority, pool_id,
                                   enqueue_seq, created_at, updated_at)
            VALUES (?1, ?2, ?3, 'ENQUEUED', ?4, ?5, {}, ?6, ?6)
            "#,
            NEXT_ENQUEUE_SEQ
        ))
        .bind(&instance.instance_id)
        .bind(&instance.alias)
        .bind(&instance.version)
        .bind(instance.priority)
        .bind(&instance.pool_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO continuations (instance_id, version, data, wait_outcome, updated_at)
            VALUES (?1, ?2, ?3, NULL, ?4)
            "#,
        )
        .bind(&instance.instance_id)
        .bind(&instance.version)
        .bind(&instance.continuation)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        insert_event(&mut tx, &instance.instance_id, "started", None).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_instance(&self, instance_id: &str) -> Result<Option<InstanceRecord>> {
        let query = format!(
            "SELECT {} FROM instances WHERE instance_id = ?",
            INSTANCE_COLUMNS
        );
        let record = sqlx::query_as::<_, InstanceRecord>(&query)
            .bind(instance_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(record)
    }

    async fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<InstanceRecord>> {
        let query = format!(
            r#"
            SELECT {}
            FROM instances
            WHERE (?1 IS NULL OR state = ?1)
              AND (?2 IS NULL OR pool_id = ?2)
              AND (?3 IS NULL OR alias = ?3)
            ORDER BY priority DESC, enqueue_seq ASC, created_at ASC
            LIMIT ?4 OFFSET ?5
            "#,
            INSTANCE_COLUMNS
        );

        let records = sqlx::query_as::<_, InstanceRecord>(&query)
            .bind(filter.state.map(|s| s.as_str()))
            .bind(&filter.pool_id)
            .bind(&filter.alias)
            // Negative LIMIT means no limit in SQLite
            .bind(filter.limit.unwrap_or(-1))
            .bind(filter.offset)
            .fetch_all(&self.pool)
            .await?;

        Ok(records)
    }

    async fn count_by_state(&self) -> Result<Vec<(InstanceState, i64)>> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            r#"
            SELECT state, COUNT(*)
            FROM instances
            GROUP BY state
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = rows
            .into_iter()
            .map(|(state, count)| Ok((state.parse::<InstanceState>()?, count)))
            .collect::<Result<Vec<_>>>()?;
        counts.sort();
        Ok(counts)
    }

    async fn transition_state(
        &self,
        instance_id: &str,
        from: InstanceState,
        to: InstanceState,
    ) -> Result<bool> {
        let seq = if to == InstanceState::Enqueued {
            NEXT_ENQUEUE_SEQ
        } else {
            "enqueue_seq"
        };
        let result = sqlx::query(&format!(
            r#"
            UPDATE instances
            SET state = ?1,
                enqueue_seq = {},
                updated_at = ?2
            WHERE instance_id = ?3
              AND state = ?4
            "#,
            seq
        ))
        .bind(to.as_str())
        .bind(Utc::now())
        .bind(instance_id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn load_continuation(&self, instance_id: &str) -> Result<Option<StoredContinuation>> {
        let row = sqlx::query_as::<_, (String, Vec<u8>, Option<String>)>(
            r#"
            SELECT version, data, wait_outcome
            FROM continuations
            WHERE instance_id = ?
            "#,
        )
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(version, data, outcome)| {
            let wait_outcome = outcome
                .map(|o| serde_json::from_str::<WaitOutcome>(&o))
                .transpose()
                .map_err(|e| EngineError::serialization("wait outcome", e))?;
            Ok(StoredContinuation {
                version,
                data,
                wait_outcome,
            })
        })
        .transpose()
    }

    async fn update_version(&self, instance_id: &str, version: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE instances SET version = ?1, updated_at = ?2 WHERE instance_id = ?3")
            .bind(version)
            .bind(Utc::now())
            .bind(instance_id)
            .execute(&mut *tx)
            .await?;

        insert_event(&mut tx, instance_id, "upgraded", Some(version)).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn suspend(
        &self,
        instance_id: &str,
        version: &str,
        continuation: &[u8],
        wait: &WaitRecord,
    ) -> Result<bool> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE instances
            SET state = 'WAITING',
                version = ?1,
                wait_deadline = ?2,
                updated_at = ?3
            WHERE instance_id = ?4
              AND state = 'RUNNING'
            "#,
        )
        .bind(version)
        .bind(wait.deadline)
        .bind(now)
        .bind(instance_id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO continuations (instance_id, version, data, wait_outcome, updated_at)
            VALUES (?1, ?2, ?3, NULL, ?4)
            ON CONFLICT(instance_id) DO UPDATE SET
                version = excluded.version,
                data = excluded.data,
                wait_outcome = NULL,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(instance_id)
        .bind(version)
        .bind(continuation)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let ids = serde_json::to_string(&wait.correlation_ids)?;
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO wait_conditions
                (instance_id, mode, correlation_ids, deadline, registered_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(instance_id)
        .bind(wait.mode.as_str())
        .bind(&ids)
        .bind(wait.deadline)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let detail = format!("{} {}", wait.mode.as_str(), ids);
        insert_event(&mut tx, instance_id, "waiting", Some(&detail)).await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn resolve_wait(
        &self,
        instance_id: &str,
        outcome: &WaitOutcome,
        consumed: &BTreeMap<String, DateTime<Utc>>,
    ) -> Result<bool> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let removed = sqlx::query("DELETE FROM wait_conditions WHERE instance_id = ?")
            .bind(instance_id)
            .execute(&mut *tx)
            .await?;

        let requeued = sqlx::query(&format!(
            r#"
            UPDATE instances
            SET state = 'ENQUEUED',
                enqueue_seq = {},
                wait_deadline = NULL,
                updated_at = ?1
            WHERE instance_id = ?2
              AND state = 'WAITING'
            "#,
            NEXT_ENQUEUE_SEQ
        ))
        .bind(now)
        .bind(instance_id)
        .execute(&mut *tx)
        .await?;

        if removed.rows_affected() == 0 || requeued.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query("UPDATE continuations SET wait_outcome = ?1, updated_at = ?2 WHERE instance_id = ?3")
            .bind(serde_json::to_string(outcome)?)
            .bind(now)
            .bind(instance_id)
            .execute(&mut *tx)
            .await?;

        // This instance's own wait row is already gone.
        for (correlation_id, until) in consumed {
            sqlx::query(&format!(
                "DELETE FROM responses WHERE correlation_id = ?1 AND received_at <= ?2 AND {}",
                UNREFERENCED_RESPONSE
            ))
            .bind(correlation_id)
            .bind(until)
            .execute(&mut *tx)
            .await?;
        }

        let detail = serde_json::to_value(outcome.kind)?;
        insert_event(&mut tx, instance_id, "resumed", detail.as_str()).await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn complete(
        &self,
        instance_id: &str,
        from: InstanceState,
        completion: &Completion,
    ) -> Result<bool> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE instances
            SET state = ?1,
                result = ?2,
                error = ?3,
                termination_reason = ?4,
                wait_deadline = NULL,
                finished_at = ?5,
                updated_at = ?5
            WHERE instance_id = ?6
              AND state = ?7
            "#,
        )
        .bind(completion.state.as_str())
        .bind(completion.result.as_ref().map(|v| v.to_string()))
        .bind(&completion.error)
        .bind(&completion.reason)
        .bind(now)
        .bind(instance_id)
        .bind(from.as_str())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query("DELETE FROM wait_conditions WHERE instance_id = ?")
            .bind(instance_id)
            .execute(&mut *tx)
            .await?;

        // ERROR and INVALID keep their continuation for diagnosis.
        if completion.state == InstanceState::Finished {
            sqlx::query("DELETE FROM continuations WHERE instance_id = ?")
                .bind(instance_id)
                .execute(&mut *tx)
                .await?;
        }

        insert_event(
            &mut tx,
            instance_id,
            completion.event_type(),
            completion.error.as_deref(),
        )
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn request_cancel(&self, instance_id: &str) -> Result<Option<InstanceState>> {
        let mut tx = self.pool.begin().await?;

        let flagged = sqlx::query(
            r#"
            UPDATE instances
            SET cancel_requested = 1,
                updated_at = ?1
            WHERE instance_id = ?2
              AND cancel_requested = 0
              AND state NOT IN ('FINISHED', 'ERROR', 'INVALID')
            "#,
        )
        .bind(Utc::now())
        .bind(instance_id)
        .execute(&mut *tx)
        .await?;

        if flagged.rows_affected() > 0 {
            insert_event(&mut tx, instance_id, "cancel_requested", None).await?;
        }

        let state = sqlx::query_scalar::<_, String>("SELECT state FROM instances WHERE instance_id = ?")
            .bind(instance_id)
            .fetch_optional(&mut *tx)
            .await?;

        tx.commit().await?;
        state.map(|s| s.parse()).transpose()
    }

    async fn list_waits(&self) -> Result<Vec<WaitRecord>> {
        let rows = sqlx::query_as::<_, WaitRow>(
            r#"
            SELECT instance_id, mode, correlation_ids, deadline
            FROM wait_conditions
            ORDER BY registered_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(WaitRecord::try_from).collect()
    }

    async fn save_response(&self, response: &Response) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO responses (correlation_id, payload, received_at)
            VALUES (?1, ?2, ?3)
            "#,
        )
        .bind(&response.correlation_id)
        .bind(response.payload.to_string())
        .bind(response.received_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn pending_responses(&self) -> Result<Vec<Response>> {
        let rows = sqlx::query_as::<_, ResponseRow>(
            r#"
            SELECT correlation_id, payload, received_at
            FROM responses
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(Response {
                    payload: serde_json::from_str(&row.payload)
                        .map_err(|e| EngineError::serialization("response payload", e))?,
                    correlation_id: row.correlation_id,
                    received_at: row.received_at,
                })
            })
            .collect()
    }

    async fn delete_responses_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(&format!(
            "DELETE FROM responses WHERE received_at < ?1 AND {}",
            UNREFERENCED_RESPONSE
        ))
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn append_event(
        &self,
        instance_id: &str,
        event_type: &str,
        detail: Option<&str>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        insert_event(&mut tx, instance_id, event_type, detail).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_events(&self, instance_id: &str) -> Result<Vec<EventRecord>> {
        let records = sqlx::query_as::<_, EventRecord>(
            r#"
            SELECT id, instance_id, event_type, detail, created_at
            FROM instance_events
            WHERE instance_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }
}

async fn insert_event(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    instance_id: &str,
    event_type: &str,
    detail: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO instance_events (instance_id, event_type, detail, created_at)
        VALUES (?1, ?2, ?3, ?4)
        "#,
    )
    .bind(instance_id)
    .bind(event_type)
    .bind(detail)
    .bind(Utc::now())
    .execute(&mut **tx)
    .await?;

    Ok(())
}
