use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rumbo_core::repository::{HistoryStore, StoreError, StoreResult};
use rumbo_shared::ReservationHistoryEntry;
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

use crate::database::{parse_label, store_err};

pub struct PgHistoryStore {
    pool: PgPool,
}

impl PgHistoryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct HistoryRow {
    sequence: i64,
    id: Uuid,
    reservation_id: Uuid,
    trip_id: Uuid,
    driver_id: Uuid,
    traveler_id: Uuid,
    actor_id: Uuid,
    occurred_at: DateTime<Utc>,
    prior_state: Option<String>,
    new_state: String,
}

impl TryFrom<HistoryRow> for ReservationHistoryEntry {
    type Error = StoreError;

    fn try_from(row: HistoryRow) -> Result<Self, Self::Error> {
        Ok(ReservationHistoryEntry {
            id: row.id,
            sequence: row.sequence,
            reservation_id: row.reservation_id,
            trip_id: row.trip_id,
            driver_id: row.driver_id,
            traveler_id: row.traveler_id,
            actor_id: row.actor_id,
            occurred_at: row.occurred_at,
            prior_state: row.prior_state.as_deref().map(parse_label).transpose()?,
            new_state: parse_label(&row.new_state)?,
        })
    }
}

/// Append one entry and return the sequence Postgres assigned
pub(crate) async fn insert_entry<'e, E>(executor: E, entry: &ReservationHistoryEntry) -> StoreResult<i64>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    sqlx::query_scalar(
        r#"
        INSERT INTO reservation_history (id, reservation_id, trip_id, driver_id, traveler_id,
            actor_id, occurred_at, prior_state, new_state)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        RETURNING sequence
        "#,
    )
    .bind(entry.id)
    .bind(entry.reservation_id)
    .bind(entry.trip_id)
    .bind(entry.driver_id)
    .bind(entry.traveler_id)
    .bind(entry.actor_id)
    .bind(entry.occurred_at)
    .bind(entry.prior_state.map(|s| s.as_str()))
    .bind(entry.new_state.as_str())
    .fetch_one(executor)
    .await
    .map_err(store_err)
}

#[async_trait]
impl HistoryStore for PgHistoryStore {
    async fn append(&self, entry: &ReservationHistoryEntry) -> StoreResult<i64> {
        insert_entry(&self.pool, entry).await
    }

    async fn find_by_trip(&self, trip_id: Uuid) -> StoreResult<Vec<ReservationHistoryEntry>> {
        let rows: Vec<HistoryRow> = sqlx::query_as(
            r#"
            SELECT sequence, id, reservation_id, trip_id, driver_id, traveler_id, actor_id,
                occurred_at, prior_state, new_state
            FROM reservation_history
            WHERE trip_id = $1
            ORDER BY occurred_at, sequence
            "#,
        )
        .bind(trip_id)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        rows.into_iter().map(ReservationHistoryEntry::try_from).collect()
    }
}
