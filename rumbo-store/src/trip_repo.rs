use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rumbo_core::repository::{StoreError, StoreResult, TripStore};
use rumbo_shared::{Route, Trip, TripState};
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

use crate::database::{parse_label, store_err, to_count, to_db_count};

const TRIP_COLUMNS: &str = "id, driver_id, vehicle_id, origin_id, destination_id, stop_ids, \
    departure_at, price_cents, total_seats, seats_remaining, state, created_at, started_at, \
    finished_at, closed_automatically, version";

pub struct PgTripStore {
    pool: PgPool,
}

impl PgTripStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct TripRow {
    id: Uuid,
    driver_id: Uuid,
    vehicle_id: Uuid,
    origin_id: Uuid,
    destination_id: Uuid,
    stop_ids: Vec<Uuid>,
    departure_at: DateTime<Utc>,
    price_cents: i64,
    total_seats: i32,
    seats_remaining: i32,
    state: String,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    closed_automatically: bool,
    version: i64,
}

impl TryFrom<TripRow> for Trip {
    type Error = StoreError;

    fn try_from(row: TripRow) -> Result<Self, Self::Error> {
        Ok(Trip {
            id: row.id,
            driver_id: row.driver_id,
            vehicle_id: row.vehicle_id,
            route: Route::new(row.origin_id, row.destination_id).with_stops(row.stop_ids),
            departure_at: row.departure_at,
            price_cents: row.price_cents,
            total_seats: to_count(row.total_seats, "total_seats")?,
            seats_remaining: to_count(row.seats_remaining, "seats_remaining")?,
            state: parse_label(&row.state)?,
            created_at: row.created_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            closed_automatically: row.closed_automatically,
            version: row.version,
        })
    }
}

fn into_trips(rows: Vec<TripRow>) -> StoreResult<Vec<Trip>> {
    rows.into_iter().map(Trip::try_from).collect()
}

/// Version-checked trip update shared by [`PgTripStore::save`] and the ledger transaction
pub(crate) async fn update_trip<'e, E>(executor: E, trip: &Trip, expected_version: i64) -> StoreResult<i64>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let version: Option<i64> = sqlx::query_scalar(
        r#"
        UPDATE trips
        SET departure_at = $3, seats_remaining = $4, state = $5, started_at = $6,
            finished_at = $7, closed_automatically = $8, version = version + 1
        WHERE id = $1 AND version = $2
        RETURNING version
        "#,
    )
    .bind(trip.id)
    .bind(expected_version)
    .bind(trip.departure_at)
    .bind(to_db_count(trip.seats_remaining, "seats_remaining")?)
    .bind(trip.state.as_str())
    .bind(trip.started_at)
    .bind(trip.finished_at)
    .bind(trip.closed_automatically)
    .fetch_optional(executor)
    .await
    .map_err(store_err)?;

    version.ok_or(StoreError::VersionConflict {
        entity: "trip",
        id: trip.id,
        expected: expected_version,
    })
}

#[async_trait]
impl TripStore for PgTripStore {
    async fn insert(&self, trip: &Trip) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO trips (id, driver_id, vehicle_id, origin_id, destination_id, stop_ids,
                departure_at, price_cents, total_seats, seats_remaining, state, created_at,
                started_at, finished_at, closed_automatically, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(trip.id)
        .bind(trip.driver_id)
        .bind(trip.vehicle_id)
        .bind(trip.route.origin_id)
        .bind(trip.route.destination_id)
        .bind(trip.route.stop_ids.as_slice())
        .bind(trip.departure_at)
        .bind(trip.price_cents)
        .bind(to_db_count(trip.total_seats, "total_seats")?)
        .bind(to_db_count(trip.seats_remaining, "seats_remaining")?)
        .bind(trip.state.as_str())
        .bind(trip.created_at)
        .bind(trip.started_at)
        .bind(trip.finished_at)
        .bind(trip.closed_automatically)
        .bind(trip.version)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(())
    }

    async fn load(&self, id: Uuid) -> StoreResult<Option<Trip>> {
        let row: Option<TripRow> =
            sqlx::query_as(&format!("SELECT {} FROM trips WHERE id = $1", TRIP_COLUMNS))
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(store_err)?;

        row.map(Trip::try_from).transpose()
    }

    async fn save(&self, trip: &Trip, expected_version: i64) -> StoreResult<i64> {
        update_trip(&self.pool, trip, expected_version).await
    }

    async fn find_by_vehicle_and_state_in(
        &self,
        vehicle_id: Uuid,
        states: &[TripState],
    ) -> StoreResult<Vec<Trip>> {
        let labels: Vec<&str> = states.iter().map(TripState::as_str).collect();
        let rows: Vec<TripRow> = sqlx::query_as(&format!(
            "SELECT {} FROM trips WHERE vehicle_id = $1 AND state = ANY($2)",
            TRIP_COLUMNS
        ))
        .bind(vehicle_id)
        .bind(labels)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        into_trips(rows)
    }

    async fn find_by_driver(&self, driver_id: Uuid) -> StoreResult<Vec<Trip>> {
        let rows: Vec<TripRow> = sqlx::query_as(&format!(
            "SELECT {} FROM trips WHERE driver_id = $1 ORDER BY departure_at",
            TRIP_COLUMNS
        ))
        .bind(driver_id)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        into_trips(rows)
    }

    async fn find_not_started_before(&self, deadline: DateTime<Utc>) -> StoreResult<Vec<Trip>> {
        let rows: Vec<TripRow> = sqlx::query_as(&format!(
            "SELECT {} FROM trips \
             WHERE state IN ('AVAILABLE', 'FULL') AND started_at IS NULL AND departure_at < $1 \
             ORDER BY departure_at",
            TRIP_COLUMNS
        ))
        .bind(deadline)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        into_trips(rows)
    }

    async fn find_in_progress_started_before(
        &self,
        limit: DateTime<Utc>,
    ) -> StoreResult<Vec<Trip>> {
        let rows: Vec<TripRow> = sqlx::query_as(&format!(
            "SELECT {} FROM trips \
             WHERE state = 'IN_PROGRESS' AND COALESCE(started_at, departure_at) < $1 \
             ORDER BY started_at",
            TRIP_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        into_trips(rows)
    }

    async fn count_auto_closed_by_driver(&self, driver_id: Uuid) -> StoreResult<u32> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM trips WHERE driver_id = $1 AND closed_automatically",
        )
        .bind(driver_id)
        .fetch_one(&self.pool)
        .await
        .map_err(store_err)?;

        u32::try_from(count).map_err(|_| StoreError::Backend(format!("closure count out of range: {}", count)))
    }
}
