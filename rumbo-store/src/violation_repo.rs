use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rumbo_core::repository::{StoreError, StoreResult, ViolationStore};
use rumbo_shared::ConductorViolation;
use sqlx::PgPool;
use uuid::Uuid;

use crate::database::{parse_label, store_err, to_count, to_db_count};

const VIOLATION_COLUMNS: &str = "id, driver_id, trip_id, kind, weight, occurred_at, minutes_late, \
    active, expires_at, description";

pub struct PgViolationStore {
    pool: PgPool,
}

impl PgViolationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn select<T>(&self, filter: &str, arg: T) -> StoreResult<Vec<ConductorViolation>>
    where
        T: for<'q> sqlx::Encode<'q, sqlx::Postgres> + sqlx::Type<sqlx::Postgres> + Send + 'static,
    {
        let sql = format!("SELECT {} FROM conductor_violations WHERE {}", VIOLATION_COLUMNS, filter);
        let rows: Vec<ViolationRow> = sqlx::query_as(&sql)
            .bind(arg)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;

        rows.into_iter().map(ConductorViolation::try_from).collect()
    }
}

#[derive(sqlx::FromRow)]
struct ViolationRow {
    id: Uuid,
    driver_id: Uuid,
    trip_id: Option<Uuid>,
    kind: String,
    weight: i32,
    occurred_at: DateTime<Utc>,
    minutes_late: Option<i64>,
    active: bool,
    expires_at: DateTime<Utc>,
    description: String,
}

impl TryFrom<ViolationRow> for ConductorViolation {
    type Error = StoreError;

    fn try_from(row: ViolationRow) -> Result<Self, Self::Error> {
        Ok(ConductorViolation {
            id: row.id,
            driver_id: row.driver_id,
            trip_id: row.trip_id,
            kind: parse_label(&row.kind)?,
            weight: to_count(row.weight, "weight")?,
            occurred_at: row.occurred_at,
            minutes_late: row.minutes_late,
            active: row.active,
            expires_at: row.expires_at,
            description: row.description,
        })
    }
}

#[async_trait]
impl ViolationStore for PgViolationStore {
    async fn save(&self, violation: &ConductorViolation) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO conductor_violations (id, driver_id, trip_id, kind, weight, occurred_at,
                minutes_late, active, expires_at, description)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO UPDATE SET active = EXCLUDED.active
            "#,
        )
        .bind(violation.id)
        .bind(violation.driver_id)
        .bind(violation.trip_id)
        .bind(violation.kind.as_str())
        .bind(to_db_count(violation.weight, "weight")?)
        .bind(violation.occurred_at)
        .bind(violation.minutes_late)
        .bind(violation.active)
        .bind(violation.expires_at)
        .bind(&violation.description)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(())
    }

    async fn load(&self, id: Uuid) -> StoreResult<Option<ConductorViolation>> {
        Ok(self.select("id = $1", id).await?.into_iter().next())
    }

    async fn find_active_by_driver(&self, driver_id: Uuid) -> StoreResult<Vec<ConductorViolation>> {
        self.select("driver_id = $1 AND active", driver_id).await
    }

    async fn find_expired_as_of(&self, at: DateTime<Utc>) -> StoreResult<Vec<ConductorViolation>> {
        self.select("active AND expires_at < $1", at).await
    }

    async fn find_by_driver(&self, driver_id: Uuid) -> StoreResult<Vec<ConductorViolation>> {
        self.select("driver_id = $1 ORDER BY occurred_at DESC", driver_id).await
    }
}
