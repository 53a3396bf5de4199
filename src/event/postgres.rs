use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use super::store::{expired_message, EventStore};
use super::{EventData, EventError, Filter, Kind, LogEntry, Target};
use crate::database::DatabaseError;

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS events (
        id UUID PRIMARY KEY,
        start_time TIMESTAMPTZ NOT NULL,
        running BOOLEAN NOT NULL,
        target_type TEXT NOT NULL,
        target_value TEXT NOT NULL,
        kind_name TEXT NOT NULL,
        data JSONB NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS events_start_time_idx ON events (start_time DESC)",
    "CREATE INDEX IF NOT EXISTS events_target_idx ON events (target_type, target_value)",
    "CREATE INDEX IF NOT EXISTS events_running_idx ON events (running) WHERE running",
    r#"CREATE TABLE IF NOT EXISTS event_locks (
        target TEXT PRIMARY KEY,
        event_id UUID NOT NULL
    )"#,
];

impl From<sqlx::Error> for EventError {
    fn from(err: sqlx::Error) -> Self {
        EventError::Store(err.to_string())
    }
}

impl From<DatabaseError> for EventError {
    fn from(err: DatabaseError) -> Self {
        EventError::Store(err.to_string())
    }
}

fn lock_key(target: &Target) -> String {
    format!("{}/{}", target.target_type, target.value)
}

/// Rows fetched per round trip while scanning for filter matches.
const SCAN_BATCH: i64 = 500;

/// Build the row selection for `filter`.
///
/// Target predicates also look into the extra targets, so the result is a
/// superset that still goes through [`Filter::matches`].
fn select(filter: &Filter) -> QueryBuilder<'static, Postgres> {
    let mut query = QueryBuilder::<Postgres>::new("SELECT data FROM events WHERE TRUE");
    if let Some(running) = filter.running {
        query.push(" AND running = ").push_bind(running);
    }
    if let Some(since) = filter.since {
        query.push(" AND start_time >= ").push_bind(since);
    }
    if let Some(until) = filter.until {
        query.push(" AND start_time <= ").push_bind(until);
    }
    if !filter.kind_names.is_empty() {
        query
            .push(" AND kind_name = ANY(")
            .push_bind(filter.kind_names.clone())
            .push(")");
    }
    if let Some(target_type) = filter.target_type {
        let extra = serde_json::json!([{ "Target": { "Type": target_type.as_str() } }]);
        query
            .push(" AND (target_type = ")
            .push_bind(target_type.as_str())
            .push(" OR data->'ExtraTargets' @> ")
            .push_bind(Json(extra))
            .push(")");
    }
    if let Some(value) = &filter.target_value {
        let extra = serde_json::json!([{ "Target": { "Value": value } }]);
        query
            .push(" AND (target_value = ")
            .push_bind(value.clone())
            .push(" OR data->'ExtraTargets' @> ")
            .push_bind(Json(extra))
            .push(")");
    }
    if let Some(owner) = &filter.owner_name {
        query
            .push(" AND data->'Owner'->>'Name' = ")
            .push_bind(owner.clone());
    }
    if filter.oldest_first {
        query.push(" ORDER BY start_time ASC, id");
    } else {
        query.push(" ORDER BY start_time DESC, id");
    }
    query
}

/// Event store backed by PostgreSQL.
///
/// Records live as JSONB documents; `event_locks` holds one row per locked
/// target so that concurrent inserts serialize on its primary key.
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    pub async fn connect(pool: PgPool) -> Result<Self, EventError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        info!("event store schema ready");
        Ok(Self { pool })
    }

    async fn load_for_update(
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
    ) -> Result<Option<EventData>, EventError> {
        let row = sqlx::query("SELECT data FROM events WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut **tx)
            .await?;
        Ok(row
            .map(|r| r.try_get::<Json<EventData>, _>("data"))
            .transpose()?
            .map(|Json(evt)| evt))
    }

    async fn save(tx: &mut Transaction<'_, Postgres>, evt: &EventData) -> Result<(), EventError> {
        sqlx::query("UPDATE events SET running = $2, data = $3 WHERE id = $1")
            .bind(evt.unique_id)
            .bind(evt.running)
            .bind(Json(evt))
            .execute(&mut **tx)
            .await?;
        if !evt.running {
            sqlx::query("DELETE FROM event_locks WHERE event_id = $1")
                .bind(evt.unique_id)
                .execute(&mut **tx)
                .await?;
        }
        Ok(())
    }

    /// Load, mutate and store one event in a single transaction.
    async fn modify<T: Send>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut EventData) -> Result<T, EventError> + Send,
    ) -> Result<T, EventError> {
        let mut tx = self.pool.begin().await?;
        let mut evt = Self::load_for_update(&mut tx, id)
            .await?
            .ok_or(EventError::NotFound)?;
        let out = f(&mut evt)?;
        Self::save(&mut tx, &evt).await?;
        tx.commit().await?;
        Ok(out)
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn insert(
        &self,
        evt: EventData,
        lock_expire: Duration,
    ) -> Result<Vec<EventData>, EventError> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();
        let mut released = Vec::new();

        for target in evt.lock_targets() {
            let key = lock_key(target);
            let claimed = sqlx::query(
                "INSERT INTO event_locks (target, event_id) VALUES ($1, $2) \
                 ON CONFLICT (target) DO NOTHING RETURNING target",
            )
            .bind(&key)
            .bind(evt.unique_id)
            .fetch_optional(&mut *tx)
            .await?;
            if claimed.is_some() {
                continue;
            }

            let holder_id: Uuid =
                sqlx::query_scalar("SELECT event_id FROM event_locks WHERE target = $1 FOR UPDATE")
                    .bind(&key)
                    .fetch_one(&mut *tx)
                    .await?;
            if let Some(mut holder) = Self::load_for_update(&mut tx, holder_id).await? {
                if holder.running {
                    if !holder.lock_expired(now, lock_expire) {
                        return Err(EventError::Locked(holder.to_string()));
                    }
                    warn!("releasing expired lock held by event {}", holder.unique_id);
                    holder.finalize(Some(expired_message(lock_expire)), None);
                    Self::save(&mut tx, &holder).await?;
                    released.push(holder);
                }
            }
            sqlx::query(
                "INSERT INTO event_locks (target, event_id) VALUES ($1, $2) \
                 ON CONFLICT (target) DO UPDATE SET event_id = EXCLUDED.event_id",
            )
            .bind(&key)
            .bind(evt.unique_id)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "INSERT INTO events (id, start_time, running, target_type, target_value, kind_name, data) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(evt.unique_id)
        .bind(evt.start_time)
        .bind(evt.running)
        .bind(evt.target.target_type.as_str())
        .bind(&evt.target.value)
        .bind(&evt.kind.name)
        .bind(Json(&evt))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(released)
    }

    async fn get(&self, id: Uuid) -> Result<Option<EventData>, EventError> {
        let row: Option<Json<EventData>> =
            sqlx::query_scalar("SELECT data FROM events WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|Json(evt)| evt))
    }

    async fn list(&self, filter: &Filter) -> Result<Vec<EventData>, EventError> {
        let wanted = filter.limit.map(|limit| filter.skip + limit);
        let mut matched = Vec::new();
        let mut offset: i64 = 0;
        loop {
            let mut query = select(filter);
            query
                .push(" LIMIT ")
                .push_bind(SCAN_BATCH)
                .push(" OFFSET ")
                .push_bind(offset);
            let rows: Vec<Json<EventData>> =
                query.build_query_scalar().fetch_all(&self.pool).await?;
            let fetched = rows.len() as i64;
            offset += fetched;
            matched.extend(
                rows.into_iter()
                    .map(|Json(evt)| evt)
                    .filter(|evt| filter.matches(evt)),
            );
            if fetched < SCAN_BATCH || wanted.is_some_and(|w| matched.len() >= w) {
                break;
            }
        }
        Ok(filter.paginate(matched))
    }

    async fn append_log(&self, id: Uuid, entries: Vec<LogEntry>) -> Result<(), EventError> {
        self.modify(id, move |evt| {
            evt.structured_log.extend(entries);
            evt.log = evt.render_log();
            if evt.running {
                evt.lock_update_time = Utc::now();
            }
            Ok(())
        })
        .await
    }

    async fn touch(&self, id: Uuid) -> Result<(), EventError> {
        self.modify(id, |evt| {
            if evt.running {
                evt.lock_update_time = Utc::now();
            }
            Ok(())
        })
        .await
    }

    async fn request_cancel(
        &self,
        id: Uuid,
        owner: &str,
        reason: &str,
    ) -> Result<EventData, EventError> {
        let (owner, reason) = (owner.to_string(), reason.to_string());
        self.modify(id, move |evt| {
            evt.request_cancel(&owner, &reason)?;
            Ok(evt.clone())
        })
        .await
    }

    async fn ack_cancel(&self, id: Uuid) -> Result<bool, EventError> {
        self.modify(id, |evt| Ok(evt.ack_cancel())).await
    }

    async fn finish(
        &self,
        id: Uuid,
        error: Option<String>,
        end_data: Option<Value>,
    ) -> Result<Option<EventData>, EventError> {
        self.modify(id, move |evt| Ok(evt.finalize(error, end_data).then(|| evt.clone())))
            .await
    }

    async fn set_other_data(&self, id: Uuid, data: Value) -> Result<(), EventError> {
        self.modify(id, move |evt| {
            evt.other_custom_data = Some(data);
            Ok(())
        })
        .await
    }

    async fn remove(&self, id: Uuid) -> Result<(), EventError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM event_locks WHERE event_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM events WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if deleted == 0 {
            return Err(EventError::NotFound);
        }
        tx.commit().await?;
        Ok(())
    }

    async fn kinds(&self) -> Result<Vec<Kind>, EventError> {
        let rows: Vec<Json<Kind>> = sqlx::query_scalar(
            "SELECT DISTINCT ON (kind_name) data->'Kind' FROM events ORDER BY kind_name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|Json(kind)| kind).collect())
    }

    async fn health_check(&self) -> Result<(), EventError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::TargetType;

    #[test]
    fn test_select_pushes_filter_into_sql() {
        let filter = Filter {
            target_type: Some(TargetType::App),
            target_value: Some("myapp".into()),
            running: Some(true),
            kind_names: vec!["app.update".into()],
            oldest_first: true,
            ..Default::default()
        };
        let query = select(&filter);
        let sql = query.sql();
        assert!(sql.contains("running = $1"), "{sql}");
        assert!(sql.contains("kind_name = ANY($2)"), "{sql}");
        assert!(sql.contains("target_type = $3"), "{sql}");
        assert!(sql.contains("target_value = $5"), "{sql}");
        assert!(sql.ends_with("ORDER BY start_time ASC, id"), "{sql}");

        let query = select(&Filter::default());
        assert_eq!(query.sql(), "SELECT data FROM events WHERE TRUE ORDER BY start_time DESC, id");
    }

    #[test]
    fn test_lock_key_is_type_and_value() {
        assert_eq!(lock_key(&Target::app("myapp")), "app/myapp");
        assert_eq!(
            lock_key(&Target::new(TargetType::ServiceInstance, "mysql/db1")),
            "service-instance/mysql/db1"
        );
    }
}
