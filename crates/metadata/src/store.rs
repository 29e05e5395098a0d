//! Metadata store trait and SQLite implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::repos::{
    AccessRequestRepo, ArchiveReferentialRepo, ObjectReferentialRepo, QueueRepo, TapeCatalogRepo,
};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, QueryBuilder, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tapevault_core::{QueryCriteria, QueryOperator};

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore:
    TapeCatalogRepo
    + QueueRepo
    + ArchiveReferentialRepo
    + ObjectReferentialRepo
    + AccessRequestRepo
    + Send
    + Sync
{
    /// Run database migrations.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;
}

/// SQLite-based metadata store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open (creating if needed) and migrate the database at `path`.
    pub async fn new(
        path: impl AsRef<Path>,
        busy_timeout: Duration,
        max_connections: u32,
    ) -> MetadataResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        tracing::debug!(path = %path.display(), "opened sqlite metadata store");

        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

// =============================================================================
// Dynamic criteria
// =============================================================================

/// Append ` AND <criterion>` for each criterion.
///
/// `columns` maps field names stored as real columns; every other field is
/// read from the JSON `document_column`.
fn push_criteria(
    qb: &mut QueryBuilder<'_, Sqlite>,
    document_column: &'static str,
    columns: &[(&str, &'static str)],
    criteria: &[QueryCriteria],
) -> MetadataResult<()> {
    for criterion in criteria {
        qb.push(" AND ");
        match columns.iter().find(|(field, _)| *field == criterion.field) {
            Some((_, column)) => {
                qb.push(*column);
            }
            None => {
                let path = criterion.json_path()?;
                qb.push("json_extract(");
                qb.push(document_column);
                qb.push(", ");
                qb.push_bind(path);
                qb.push(")");
            }
        }

        match (criterion.operator, &criterion.value) {
            (QueryOperator::Exists, Value::Bool(true)) => {
                qb.push(" IS NOT NULL");
            }
            (QueryOperator::Exists, Value::Bool(false)) => {
                qb.push(" IS NULL");
            }
            (QueryOperator::Exists, other) => {
                return Err(MetadataError::InvalidArgument(format!(
                    "exists criterion on {} expects a boolean, got {other}",
                    criterion.field
                )));
            }
            (QueryOperator::Eq, Value::Null) => {
                qb.push(" IS NULL");
            }
            (QueryOperator::Ne, Value::Null) => {
                qb.push(" IS NOT NULL");
            }
            (operator, value) => {
                // Only `Exists` has no SQL operator and it is handled above.
                let op = operator.sql().unwrap_or("=");
                qb.push(" ");
                qb.push(op);
                qb.push(" ");
                push_value(qb, &criterion.field, value)?;
            }
        }
    }
    Ok(())
}

/// Bind a scalar JSON value with the SQL type `json_extract` yields for it.
fn push_value(qb: &mut QueryBuilder<'_, Sqlite>, field: &str, value: &Value) -> MetadataResult<()> {
    match value {
        Value::String(s) => {
            qb.push_bind(s.clone());
        }
        Value::Bool(b) => {
            qb.push_bind(i64::from(*b));
        }
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                qb.push_bind(i);
            } else if let Some(f) = n.as_f64() {
                qb.push_bind(f);
            } else {
                return Err(MetadataError::InvalidArgument(format!(
                    "number out of range for {field}: {n}"
                )));
            }
        }
        Value::Null | Value::Array(_) | Value::Object(_) => {
            return Err(MetadataError::InvalidArgument(format!(
                "criterion on {field} needs a scalar value"
            )));
        }
    }
    Ok(())
}

/// Append `json_set(<column>, ?, json(?), ...)` for the given field updates.
fn push_json_set(
    qb: &mut QueryBuilder<'_, Sqlite>,
    document_column: &'static str,
    fields: &[(String, &Value)],
) -> MetadataResult<()> {
    qb.push("json_set(");
    qb.push(document_column);
    for (field, value) in fields {
        let path = tapevault_core::criteria::json_path(field)?;
        qb.push(", ");
        qb.push_bind(path);
        qb.push(", json(");
        qb.push_bind(serde_json::to_string(value)?);
        qb.push(")");
    }
    qb.push(")");
    Ok(())
}

// Implement all the repository traits for SqliteStore
mod sqlite_impl {
    use super::*;
    use crate::error::map_unique_violation;
    use crate::models::*;
    use serde_json::Map;
    use std::collections::{HashMap, HashSet};
    use tapevault_core::{
        ArchiveLocationType, QueueMessage, QueueMessageType, QueueState, QueueUpdate,
        TapeCatalog, TapeLocation, TapeState, TarEntryDescription,
    };
    use time::OffsetDateTime;
    use uuid::Uuid;

    /// Top-level tape fields accepted by partial updates.
    const TAPE_FIELDS: &[&str] = &[
        "code",
        "alternative_code",
        "label",
        "library",
        "tape_type",
        "capacity",
        "remaining_size",
        "written_bytes",
        "file_count",
        "state",
        "current_location",
        "previous_location",
        "bucket",
        "compressed",
    ];

    const TAPE_COLUMNS: &[(&str, &str)] = &[
        ("id", "id"),
        ("code", "code"),
        ("state", "state"),
        ("version", "version"),
    ];

    const QUEUE_COLUMNS: &[(&str, &str)] = &[("priority", "priority")];

    impl SqliteStore {
        /// Move a tape to `to` if it currently sits in drive `from_drive`, or
        /// in no drive at all when `from_drive` is `None`.
        async fn relocate_tape(
            &self,
            code: &str,
            to: TapeLocation,
            from_drive: Option<u32>,
        ) -> MetadataResult<Option<TapeCatalog>> {
            let mut qb = QueryBuilder::<Sqlite>::new(
                "UPDATE tapes SET document = json_set(document, \
                 '$.previous_location', json(json_extract(document, '$.current_location')), \
                 '$.current_location', json(",
            );
            qb.push_bind(serde_json::to_string(&to)?);
            qb.push(")), version = version + 1 WHERE code = ");
            qb.push_bind(code.to_string());
            match from_drive {
                Some(drive) => {
                    qb.push(" AND json_extract(document, '$.current_location.type') = 'drive'");
                    qb.push(" AND json_extract(document, '$.current_location.index') = ");
                    qb.push_bind(i64::from(drive));
                }
                None => {
                    qb.push(" AND json_extract(document, '$.current_location.type') <> 'drive'");
                }
            }
            qb.push(" RETURNING id, code, state, version, document");

            let row = qb
                .build_query_as::<TapeRow>()
                .fetch_optional(&self.pool)
                .await?;
            row.map(TapeRow::into_tape).transpose()
        }
    }

    #[async_trait]
    impl TapeCatalogRepo for SqliteStore {
        async fn create_tape(&self, tape: &TapeCatalog) -> MetadataResult<()> {
            let mut tape = tape.clone();
            tape.version = 0;
            let row = TapeRow::from_tape(&tape)?;

            sqlx::query(
                "INSERT INTO tapes (id, code, state, version, document) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&row.id)
            .bind(&row.code)
            .bind(&row.state)
            .bind(row.version)
            .bind(&row.document)
            .execute(&self.pool)
            .await
            .map_err(|e| map_unique_violation(e, "tapes", format!("tape {}", tape.code)))?;
            Ok(())
        }

        async fn replace_tape(&self, tape: &TapeCatalog) -> MetadataResult<bool> {
            let row = TapeRow::from_tape(tape)?;
            let result = sqlx::query(
                r#"
                UPDATE tapes SET code = ?, state = ?, document = ?, version = version + 1
                WHERE id = ?
                "#,
            )
            .bind(&row.code)
            .bind(&row.state)
            .bind(&row.document)
            .bind(&row.id)
            .execute(&self.pool)
            .await
            .map_err(|e| map_unique_violation(e, "tapes", format!("tape {}", tape.code)))?;
            Ok(result.rows_affected() == 1)
        }

        async fn update_tape(
            &self,
            id: &str,
            fields: &Map<String, Value>,
        ) -> MetadataResult<bool> {
            if id.is_empty() || fields.is_empty() {
                return Err(MetadataError::InvalidArgument(
                    "All params are required".to_string(),
                ));
            }

            let mut state_column = None;
            let mut code_column = None;
            for (field, value) in fields {
                let top = field.split('.').next().unwrap_or_default();
                if !TAPE_FIELDS.contains(&top) {
                    return Err(MetadataError::InvalidArgument(format!(
                        "unknown or read-only tape field: {field}"
                    )));
                }
                match field.as_str() {
                    "state" => {
                        let state = value
                            .as_str()
                            .ok_or_else(|| {
                                MetadataError::InvalidArgument("state must be a string".into())
                            })?
                            .parse::<TapeState>()?;
                        state_column = Some(state.as_str().to_string());
                    }
                    "code" => {
                        let code = value.as_str().ok_or_else(|| {
                            MetadataError::InvalidArgument("code must be a string".into())
                        })?;
                        code_column = Some(code.to_string());
                    }
                    _ => {}
                }
            }

            let updates: Vec<(String, &Value)> =
                fields.iter().map(|(k, v)| (k.clone(), v)).collect();

            let mut qb = QueryBuilder::<Sqlite>::new("UPDATE tapes SET document = ");
            push_json_set(&mut qb, "document", &updates)?;
            qb.push(", version = version + 1");
            if let Some(state) = state_column {
                qb.push(", state = ");
                qb.push_bind(state);
            }
            if let Some(code) = code_column {
                qb.push(", code = ");
                qb.push_bind(code);
            }
            qb.push(" WHERE id = ");
            qb.push_bind(id.to_string());

            let result = qb
                .build()
                .execute(&self.pool)
                .await
                .map_err(|e| map_unique_violation(e, "tapes", format!("tape {id}")))?;
            Ok(result.rows_affected() == 1)
        }

        async fn find_tapes(
            &self,
            criteria: &[QueryCriteria],
        ) -> MetadataResult<Vec<TapeCatalog>> {
            if criteria.is_empty() {
                return Err(MetadataError::InvalidArgument(
                    "All params are required".to_string(),
                ));
            }

            let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM tapes WHERE 1 = 1");
            push_criteria(&mut qb, "document", TAPE_COLUMNS, criteria)?;
            qb.push(" ORDER BY code");

            let rows = qb
                .build_query_as::<TapeRow>()
                .fetch_all(&self.pool)
                .await?;
            rows.into_iter().map(TapeRow::into_tape).collect()
        }

        async fn find_tape_by_id(&self, id: &str) -> MetadataResult<Option<TapeCatalog>> {
            let row = sqlx::query_as::<_, TapeRow>("SELECT * FROM tapes WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            row.map(TapeRow::into_tape).transpose()
        }

        async fn find_tape_by_code(&self, code: &str) -> MetadataResult<Option<TapeCatalog>> {
            let row = sqlx::query_as::<_, TapeRow>("SELECT * FROM tapes WHERE code = ?")
                .bind(code)
                .fetch_optional(&self.pool)
                .await?;
            row.map(TapeRow::into_tape).transpose()
        }

        async fn claim_tape_for_drive(
            &self,
            code: &str,
            drive: u32,
        ) -> MetadataResult<Option<TapeCatalog>> {
            let claimed = self.relocate_tape(code, TapeLocation::Drive(drive), None).await?;
            if claimed.is_none() && self.find_tape_by_code(code).await?.is_none() {
                return Err(MetadataError::NotFound(format!("tape {code}")));
            }
            Ok(claimed)
        }

        async fn release_tape_to_slot(
            &self,
            code: &str,
            drive: u32,
            slot: u32,
        ) -> MetadataResult<TapeCatalog> {
            let to = TapeLocation::Slot(slot);
            if let Some(tape) = self.relocate_tape(code, to, Some(drive)).await? {
                return Ok(tape);
            }
            match self.find_tape_by_code(code).await? {
                Some(tape) => Err(MetadataError::InvalidStateTransition {
                    from: tape.current_location.to_string(),
                    to: to.to_string(),
                }),
                None => Err(MetadataError::NotFound(format!("tape {code}"))),
            }
        }

        async fn count_by_state(&self) -> MetadataResult<HashMap<TapeState, u64>> {
            let rows: Vec<(String, i64)> =
                sqlx::query_as("SELECT state, COUNT(*) FROM tapes GROUP BY state")
                    .fetch_all(&self.pool)
                    .await?;

            let mut counts = HashMap::with_capacity(rows.len());
            for (state, count) in rows {
                counts.insert(state.parse::<TapeState>()?, count.max(0) as u64);
            }
            Ok(counts)
        }
    }

    #[async_trait]
    impl QueueRepo for SqliteStore {
        async fn add(&self, message: &QueueMessage) -> MetadataResult<()> {
            sqlx::query(
                r#"
                INSERT INTO queue_messages (id, message_type, state, priority, created_at, payload)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(message.id)
            .bind(message.message_type().as_str())
            .bind(message.state.as_str())
            .bind(i64::from(message.priority))
            .bind(message.created_at)
            .bind(serde_json::to_string(&message.order)?)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                map_unique_violation(e, "queue_messages", format!("message {}", message.id))
            })?;
            Ok(())
        }

        async fn add_if_absent(
            &self,
            natural_key: &[QueryCriteria],
            message: &QueueMessage,
        ) -> MetadataResult<bool> {
            if natural_key.is_empty() {
                return Err(MetadataError::InvalidArgument(
                    "natural key cannot be empty".to_string(),
                ));
            }

            // One statement: the existence check and the insert cannot interleave
            // with another writer.
            let mut qb = QueryBuilder::<Sqlite>::new(
                "INSERT INTO queue_messages \
                 (id, message_type, state, priority, created_at, payload) SELECT ",
            );
            let mut values = qb.separated(", ");
            values.push_bind(message.id);
            values.push_bind(message.message_type().as_str());
            values.push_bind(message.state.as_str());
            values.push_bind(i64::from(message.priority));
            values.push_bind(message.created_at);
            values.push_bind(serde_json::to_string(&message.order)?);
            qb.push(" WHERE NOT EXISTS (SELECT 1 FROM queue_messages WHERE message_type = ");
            qb.push_bind(message.message_type().as_str());
            push_criteria(&mut qb, "payload", QUEUE_COLUMNS, natural_key)?;
            qb.push(")");

            let result = qb.build().execute(&self.pool).await?;
            let inserted = result.rows_affected() == 1;
            if !inserted {
                tracing::debug!(
                    message_type = %message.message_type(),
                    "queue message with same natural key already present"
                );
            }
            Ok(inserted)
        }

        async fn receive_with(
            &self,
            filter: &[QueryCriteria],
            update: &[QueueUpdate],
            message_type: QueueMessageType,
            use_priority: bool,
        ) -> MetadataResult<Option<QueueMessage>> {
            let mut priority = None;
            let mut fields = Vec::new();
            for patch in update {
                match patch {
                    QueueUpdate::SetPriority(p) => priority = Some(*p),
                    QueueUpdate::SetField { field, value } => {
                        if field == "type" {
                            return Err(MetadataError::InvalidArgument(
                                "the message type tag cannot be updated".to_string(),
                            ));
                        }
                        fields.push((field.clone(), value));
                    }
                }
            }

            let mut qb = QueryBuilder::<Sqlite>::new("UPDATE queue_messages SET state = ");
            qb.push_bind(QueueState::Running.as_str());
            if let Some(priority) = priority {
                qb.push(", priority = ");
                qb.push_bind(i64::from(priority));
            }
            if !fields.is_empty() {
                qb.push(", payload = ");
                push_json_set(&mut qb, "payload", &fields)?;
            }

            // The candidate is chosen and flipped in the same statement; the outer
            // state check makes the flip conditional on the message still being READY.
            qb.push(" WHERE seq = (SELECT seq FROM queue_messages WHERE state = ");
            qb.push_bind(QueueState::Ready.as_str());
            qb.push(" AND message_type = ");
            qb.push_bind(message_type.as_str());
            push_criteria(&mut qb, "payload", QUEUE_COLUMNS, filter)?;
            if use_priority {
                qb.push(" ORDER BY priority ASC, seq ASC");
            } else {
                qb.push(" ORDER BY seq ASC");
            }
            qb.push(" LIMIT 1) AND state = ");
            qb.push_bind(QueueState::Ready.as_str());
            qb.push(" RETURNING seq, id, message_type, state, priority, created_at, payload");

            let row = qb
                .build_query_as::<QueueMessageRow>()
                .fetch_optional(&self.pool)
                .await?;

            match row {
                Some(row) => {
                    let message = row.into_message()?;
                    tracing::debug!(
                        message_id = %message.id,
                        message_type = %message_type,
                        priority = message.priority,
                        "claimed queue message"
                    );
                    Ok(Some(message))
                }
                None => Ok(None),
            }
        }

        async fn complete(&self, id: Uuid) -> MetadataResult<bool> {
            let result = sqlx::query("DELETE FROM queue_messages WHERE id = ? AND state = ?")
                .bind(id)
                .bind(QueueState::Running.as_str())
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() == 1)
        }

        async fn remove(&self, id: Uuid) -> MetadataResult<bool> {
            let result = sqlx::query("DELETE FROM queue_messages WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() == 1)
        }

        async fn mark_ready(&self, id: Uuid) -> MetadataResult<bool> {
            let result =
                sqlx::query("UPDATE queue_messages SET state = ? WHERE id = ? AND state = ?")
                    .bind(QueueState::Ready.as_str())
                    .bind(id)
                    .bind(QueueState::Running.as_str())
                    .execute(&self.pool)
                    .await?;
            Ok(result.rows_affected() == 1)
        }

        async fn get_message(&self, id: Uuid) -> MetadataResult<Option<QueueMessage>> {
            let row = sqlx::query_as::<_, QueueMessageRow>(
                r#"
                SELECT seq, id, message_type, state, priority, created_at, payload
                FROM queue_messages WHERE id = ?
                "#,
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
            row.map(QueueMessageRow::into_message).transpose()
        }

        async fn count_messages(
            &self,
            message_type: QueueMessageType,
            state: Option<QueueState>,
        ) -> MetadataResult<u64> {
            let count: i64 = match state {
                Some(state) => {
                    sqlx::query_scalar(
                        "SELECT COUNT(*) FROM queue_messages WHERE message_type = ? AND state = ?",
                    )
                    .bind(message_type.as_str())
                    .bind(state.as_str())
                    .fetch_one(&self.pool)
                    .await?
                }
                None => {
                    sqlx::query_scalar("SELECT COUNT(*) FROM queue_messages WHERE message_type = ?")
                        .bind(message_type.as_str())
                        .fetch_one(&self.pool)
                        .await?
                }
            };
            Ok(count.max(0) as u64)
        }

        async fn requeue_running(&self) -> MetadataResult<u64> {
            let result = sqlx::query("UPDATE queue_messages SET state = ? WHERE state = ?")
                .bind(QueueState::Ready.as_str())
                .bind(QueueState::Running.as_str())
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected())
        }
    }

    #[async_trait]
    impl ArchiveReferentialRepo for SqliteStore {
        async fn insert_archive(&self, archive: &ArchiveRow) -> MetadataResult<()> {
            sqlx::query(
                r#"
                INSERT INTO archives (
                    archive_id, bucket, file_bucket_id, location, tape_code,
                    file_position, size, digest, created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&archive.archive_id)
            .bind(&archive.bucket)
            .bind(&archive.file_bucket_id)
            .bind(&archive.location)
            .bind(&archive.tape_code)
            .bind(archive.file_position)
            .bind(archive.size)
            .bind(&archive.digest)
            .bind(archive.created_at)
            .bind(archive.updated_at)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                map_unique_violation(e, "archives", format!("archive {}", archive.archive_id))
            })?;
            Ok(())
        }

        async fn find_archive(&self, archive_id: &str) -> MetadataResult<Option<ArchiveRow>> {
            let row = sqlx::query_as::<_, ArchiveRow>("SELECT * FROM archives WHERE archive_id = ?")
                .bind(archive_id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn find_archives(&self, archive_ids: &[String]) -> MetadataResult<Vec<ArchiveRow>> {
            if archive_ids.is_empty() {
                return Ok(Vec::new());
            }
            let mut qb =
                QueryBuilder::<Sqlite>::new("SELECT * FROM archives WHERE archive_id IN (");
            let mut ids = qb.separated(", ");
            for id in archive_ids {
                ids.push_bind(id.clone());
            }
            ids.push_unseparated(")");
            let rows = qb
                .build_query_as::<ArchiveRow>()
                .fetch_all(&self.pool)
                .await?;
            Ok(rows)
        }

        async fn update_location_to_ready_on_disk(
            &self,
            archive_id: &str,
            size: u64,
            digest: &str,
        ) -> MetadataResult<bool> {
            let result = sqlx::query(
                r#"
                UPDATE archives SET location = ?, size = ?, digest = ?, updated_at = ?
                WHERE archive_id = ? AND location <> ?
                "#,
            )
            .bind(ArchiveLocationType::ReadyOnDisk.as_str())
            .bind(to_i64(size)?)
            .bind(digest)
            .bind(OffsetDateTime::now_utc())
            .bind(archive_id)
            .bind(ArchiveLocationType::OnTape.as_str())
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        }

        async fn update_location_to_on_tape(
            &self,
            archive_id: &str,
            tape_code: &str,
            file_position: u32,
        ) -> MetadataResult<bool> {
            let result = sqlx::query(
                r#"
                UPDATE archives SET location = ?, tape_code = ?, file_position = ?, updated_at = ?
                WHERE archive_id = ?
                "#,
            )
            .bind(ArchiveLocationType::OnTape.as_str())
            .bind(tape_code)
            .bind(i64::from(file_position))
            .bind(OffsetDateTime::now_utc())
            .bind(archive_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        }

        async fn list_archives_by_location(
            &self,
            location: ArchiveLocationType,
        ) -> MetadataResult<Vec<ArchiveRow>> {
            let rows = sqlx::query_as::<_, ArchiveRow>(
                "SELECT * FROM archives WHERE location = ? ORDER BY created_at, archive_id",
            )
            .bind(location.as_str())
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn delete_archive(&self, archive_id: &str) -> MetadataResult<bool> {
            let result = sqlx::query("DELETE FROM archives WHERE archive_id = ?")
                .bind(archive_id)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() == 1)
        }
    }

    #[async_trait]
    impl ObjectReferentialRepo for SqliteStore {
        async fn upsert_object(&self, object: &ObjectRow) -> MetadataResult<()> {
            sqlx::query(
                r#"
                INSERT INTO objects (
                    container, object_name, storage_id, size, digest, digest_type,
                    location, created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (container, object_name) DO UPDATE SET
                    storage_id = excluded.storage_id,
                    size = excluded.size,
                    digest = excluded.digest,
                    digest_type = excluded.digest_type,
                    location = excluded.location,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&object.container)
            .bind(&object.object_name)
            .bind(&object.storage_id)
            .bind(object.size)
            .bind(&object.digest)
            .bind(&object.digest_type)
            .bind(&object.location)
            .bind(object.created_at)
            .bind(object.updated_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn find_object(
            &self,
            container: &str,
            object_name: &str,
        ) -> MetadataResult<Option<ObjectRow>> {
            let row = sqlx::query_as::<_, ObjectRow>(
                "SELECT * FROM objects WHERE container = ? AND object_name = ?",
            )
            .bind(container)
            .bind(object_name)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn find_objects(
            &self,
            container: &str,
            object_names: &[String],
        ) -> MetadataResult<Vec<ObjectRow>> {
            if object_names.is_empty() {
                return Ok(Vec::new());
            }
            let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM objects WHERE container = ");
            qb.push_bind(container.to_string());
            qb.push(" AND object_name IN (");
            let mut names = qb.separated(", ");
            for name in object_names {
                names.push_bind(name.clone());
            }
            names.push_unseparated(")");
            let rows = qb
                .build_query_as::<ObjectRow>()
                .fetch_all(&self.pool)
                .await?;
            Ok(rows)
        }

        async fn update_to_tar_location(
            &self,
            container: &str,
            object_name: &str,
            storage_id: &str,
            entries: &[TarEntryDescription],
        ) -> MetadataResult<bool> {
            let location = tapevault_core::ObjectLocation::Tar {
                entries: entries.to_vec(),
            };
            let result = sqlx::query(
                r#"
                UPDATE objects SET location = ?, updated_at = ?
                WHERE container = ? AND object_name = ? AND storage_id = ?
                "#,
            )
            .bind(serde_json::to_string(&location)?)
            .bind(OffsetDateTime::now_utc())
            .bind(container)
            .bind(object_name)
            .bind(storage_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        }

        async fn delete_object(&self, container: &str, object_name: &str) -> MetadataResult<bool> {
            let result = sqlx::query("DELETE FROM objects WHERE container = ? AND object_name = ?")
                .bind(container)
                .bind(object_name)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() == 1)
        }

        async fn list_input_file_objects(&self) -> MetadataResult<Vec<ObjectRow>> {
            let rows = sqlx::query_as::<_, ObjectRow>(
                r#"
                SELECT * FROM objects WHERE json_extract(location, '$.type') = 'INPUT_FILE'
                ORDER BY updated_at, container, object_name
                "#,
            )
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }
    }

    #[async_trait]
    impl AccessRequestRepo for SqliteStore {
        async fn insert_access_request(
            &self,
            request: &AccessRequestRow,
            archives: &[RequestedArchive],
        ) -> MetadataResult<()> {
            let mut tx = self.pool.begin().await?;

            sqlx::query(
                r#"
                INSERT INTO access_requests (
                    request_id, container, object_names, creation_date,
                    ready_date, expiration_date, purge_date
                ) VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(request.request_id)
            .bind(&request.container)
            .bind(&request.object_names)
            .bind(request.creation_date)
            .bind(request.ready_date)
            .bind(request.expiration_date)
            .bind(request.purge_date)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                map_unique_violation(
                    e,
                    "access_requests",
                    format!("access request {}", request.request_id),
                )
            })?;

            for archive in archives {
                sqlx::query(
                    r#"
                    INSERT INTO access_request_archives (request_id, archive_id, staged)
                    VALUES (?, ?, ?)
                    ON CONFLICT (request_id, archive_id) DO NOTHING
                    "#,
                )
                .bind(request.request_id)
                .bind(&archive.archive_id)
                .bind(archive.staged)
                .execute(&mut *tx)
                .await?;
            }

            tx.commit().await?;
            Ok(())
        }

        async fn find_access_requests(
            &self,
            request_ids: &[Uuid],
        ) -> MetadataResult<Vec<AccessRequestRecord>> {
            let mut records = Vec::with_capacity(request_ids.len());
            for request_id in request_ids {
                let Some(row) = sqlx::query_as::<_, AccessRequestRow>(
                    "SELECT * FROM access_requests WHERE request_id = ?",
                )
                .bind(request_id)
                .fetch_optional(&self.pool)
                .await?
                else {
                    continue;
                };

                let archives: Vec<(String, bool)> = sqlx::query_as(
                    r#"
                    SELECT archive_id, staged FROM access_request_archives
                    WHERE request_id = ? ORDER BY archive_id
                    "#,
                )
                .bind(request_id)
                .fetch_all(&self.pool)
                .await?;

                let (staged, unavailable): (Vec<_>, Vec<_>) =
                    archives.into_iter().partition(|(_, staged)| *staged);
                records.push(AccessRequestRecord {
                    row,
                    unavailable_archive_ids: unavailable.into_iter().map(|(id, _)| id).collect(),
                    staged_archive_ids: staged.into_iter().map(|(id, _)| id).collect(),
                });
            }
            Ok(records)
        }

        async fn delete_access_request(&self, request_id: Uuid) -> MetadataResult<bool> {
            let result = sqlx::query("DELETE FROM access_requests WHERE request_id = ?")
                .bind(request_id)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() == 1)
        }

        async fn mark_archive_staged(
            &self,
            archive_id: &str,
            now: OffsetDateTime,
            expiration_delay: time::Duration,
            purge_delay: time::Duration,
        ) -> MetadataResult<Vec<Uuid>> {
            let mut tx = self.pool.begin().await?;

            let waiting: Vec<Uuid> = sqlx::query_scalar(
                r#"
                UPDATE access_request_archives SET staged = 1
                WHERE archive_id = ? AND staged = 0
                RETURNING request_id
                "#,
            )
            .bind(archive_id)
            .fetch_all(&mut *tx)
            .await?;

            let mut ready = Vec::new();
            for request_id in waiting.into_iter().collect::<HashSet<_>>() {
                let result = sqlx::query(
                    r#"
                    UPDATE access_requests
                    SET ready_date = ?, expiration_date = ?, purge_date = ?
                    WHERE request_id = ? AND ready_date IS NULL
                      AND NOT EXISTS (
                        SELECT 1 FROM access_request_archives
                        WHERE request_id = ? AND staged = 0
                      )
                    "#,
                )
                .bind(now)
                .bind(now + expiration_delay)
                .bind(now + purge_delay)
                .bind(request_id)
                .bind(request_id)
                .execute(&mut *tx)
                .await?;
                if result.rows_affected() == 1 {
                    ready.push(request_id);
                }
            }

            tx.commit().await?;
            Ok(ready)
        }

        async fn abort_archive_staging(
            &self,
            archive_id: &str,
            now: OffsetDateTime,
            purge_delay: time::Duration,
        ) -> MetadataResult<Vec<Uuid>> {
            let aborted: Vec<Uuid> = sqlx::query_scalar(
                r#"
                UPDATE access_requests SET expiration_date = ?, purge_date = ?
                WHERE ready_date IS NULL AND expiration_date IS NULL
                  AND request_id IN (
                    SELECT request_id FROM access_request_archives
                    WHERE archive_id = ? AND staged = 0
                  )
                RETURNING request_id
                "#,
            )
            .bind(now)
            .bind(now + purge_delay)
            .bind(archive_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(aborted)
        }

        async fn locked_archive_ids(&self, now: OffsetDateTime) -> MetadataResult<HashSet<String>> {
            let rows: Vec<(String, Option<OffsetDateTime>)> = sqlx::query_as(
                r#"
                SELECT a.archive_id, r.expiration_date
                FROM access_request_archives a
                JOIN access_requests r ON r.request_id = a.request_id
                WHERE a.staged = 1
                "#,
            )
            .fetch_all(&self.pool)
            .await?;

            Ok(rows
                .into_iter()
                .filter(|(_, expiration)| expiration.is_none_or(|expiration| expiration > now))
                .map(|(archive_id, _)| archive_id)
                .collect())
        }

        async fn pending_archive_ids(&self) -> MetadataResult<HashSet<String>> {
            let ids: Vec<String> = sqlx::query_scalar(
                "SELECT DISTINCT archive_id FROM access_request_archives WHERE staged = 0",
            )
            .fetch_all(&self.pool)
            .await?;
            Ok(ids.into_iter().collect())
        }

        async fn purge_access_requests(&self, now: OffsetDateTime) -> MetadataResult<u64> {
            let candidates: Vec<(Uuid, OffsetDateTime)> = sqlx::query_as(
                "SELECT request_id, purge_date FROM access_requests WHERE purge_date IS NOT NULL",
            )
            .fetch_all(&self.pool)
            .await?;

            let mut purged = 0;
            for (request_id, purge_date) in candidates {
                if purge_date <= now && self.delete_access_request(request_id).await? {
                    purged += 1;
                }
            }
            Ok(purged)
        }
    }
}

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS tapes (
    id TEXT PRIMARY KEY,
    code TEXT NOT NULL UNIQUE,
    state TEXT NOT NULL,
    version INTEGER NOT NULL DEFAULT 0,
    document TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tapes_state ON tapes (state);

CREATE TABLE IF NOT EXISTS queue_messages (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id BLOB NOT NULL UNIQUE,
    message_type TEXT NOT NULL,
    state TEXT NOT NULL CHECK (state IN ('READY', 'RUNNING')),
    priority INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    payload TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_queue_messages_claim
    ON queue_messages (message_type, state, priority, seq);

CREATE TABLE IF NOT EXISTS archives (
    archive_id TEXT PRIMARY KEY,
    bucket TEXT NOT NULL,
    file_bucket_id TEXT NOT NULL,
    location TEXT NOT NULL,
    tape_code TEXT,
    file_position INTEGER,
    size INTEGER,
    digest TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_archives_location ON archives (location);

CREATE TABLE IF NOT EXISTS objects (
    container TEXT NOT NULL,
    object_name TEXT NOT NULL,
    storage_id TEXT NOT NULL,
    size INTEGER NOT NULL,
    digest TEXT NOT NULL,
    digest_type TEXT NOT NULL,
    location TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (container, object_name)
);

CREATE TABLE IF NOT EXISTS access_requests (
    request_id BLOB PRIMARY KEY,
    container TEXT NOT NULL,
    object_names TEXT NOT NULL,
    creation_date TEXT NOT NULL,
    ready_date TEXT,
    expiration_date TEXT,
    purge_date TEXT
);

CREATE TABLE IF NOT EXISTS access_request_archives (
    request_id BLOB NOT NULL REFERENCES access_requests (request_id) ON DELETE CASCADE,
    archive_id TEXT NOT NULL,
    staged INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (request_id, archive_id)
);

CREATE INDEX IF NOT EXISTS idx_access_request_archives_archive
    ON access_request_archives (archive_id, staged);
"#;
