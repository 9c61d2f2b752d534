use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rumbo_core::repository::{ReservationStore, StoreError, StoreResult};
use rumbo_shared::{Attendance, PaymentStatus, Reservation};
use sqlx::PgPool;
use uuid::Uuid;

use crate::database::{parse_label, store_err};

pub(crate) const RESERVATION_COLUMNS: &str = "id, trip_id, traveler_id, state, requested_at, \
    rejection_reason, payment_status, attendance, rating_eligible";

pub struct PgReservationStore {
    pool: PgPool,
}

impl PgReservationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn select(&self, filter: &str, ids: &[Uuid]) -> StoreResult<Vec<Reservation>> {
        let sql = format!(
            "SELECT {} FROM reservations WHERE {} ORDER BY requested_at",
            RESERVATION_COLUMNS, filter
        );
        let mut query = sqlx::query_as::<_, ReservationRow>(&sql);
        for id in ids {
            query = query.bind(*id);
        }

        let rows = query.fetch_all(&self.pool).await.map_err(store_err)?;
        rows.into_iter().map(Reservation::try_from).collect()
    }

    /// Run a single-field UPDATE guarded on `state = 'CONFIRMED'` plus `guard`
    async fn update_confirmed(
        &self,
        id: Uuid,
        assignment: &str,
        guard: &str,
        binds: &[&str],
    ) -> StoreResult<Reservation> {
        let sql = format!(
            "UPDATE reservations SET {} WHERE id = $1 AND state = 'CONFIRMED'{} RETURNING {}",
            assignment, guard, RESERVATION_COLUMNS
        );
        let mut query = sqlx::query_as::<_, ReservationRow>(&sql).bind(id);
        for value in binds {
            query = query.bind(*value);
        }

        match query.fetch_optional(&self.pool).await.map_err(store_err)? {
            Some(row) => Reservation::try_from(row),
            None => match self.load(id).await? {
                Some(_) => Err(StoreError::VersionConflict {
                    entity: "reservation",
                    id,
                    expected: 0,
                }),
                None => Err(StoreError::Missing {
                    entity: "reservation",
                    id,
                }),
            },
        }
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct ReservationRow {
    id: Uuid,
    trip_id: Uuid,
    traveler_id: Uuid,
    state: String,
    requested_at: DateTime<Utc>,
    rejection_reason: Option<String>,
    payment_status: String,
    attendance: String,
    rating_eligible: bool,
}

impl TryFrom<ReservationRow> for Reservation {
    type Error = StoreError;

    fn try_from(row: ReservationRow) -> Result<Self, Self::Error> {
        Ok(Reservation {
            id: row.id,
            trip_id: row.trip_id,
            traveler_id: row.traveler_id,
            state: parse_label(&row.state)?,
            requested_at: row.requested_at,
            rejection_reason: row.rejection_reason,
            payment_status: parse_label(&row.payment_status)?,
            attendance: parse_label(&row.attendance)?,
            rating_eligible: row.rating_eligible,
        })
    }
}

#[async_trait]
impl ReservationStore for PgReservationStore {
    async fn load(&self, id: Uuid) -> StoreResult<Option<Reservation>> {
        Ok(self.select("id = $1", &[id]).await?.into_iter().next())
    }

    async fn set_attendance(&self, id: Uuid, attendance: Attendance) -> StoreResult<Reservation> {
        self.update_confirmed(id, "attendance = $2", "", &[attendance.as_str()])
            .await
    }

    async fn set_payment_status(
        &self,
        id: Uuid,
        expected: PaymentStatus,
        new: PaymentStatus,
    ) -> StoreResult<Reservation> {
        self.update_confirmed(
            id,
            "payment_status = $2",
            " AND payment_status = $3",
            &[new.as_str(), expected.as_str()],
        )
        .await
    }

    async fn set_rating_eligible(&self, id: Uuid) -> StoreResult<Reservation> {
        self.update_confirmed(id, "rating_eligible = TRUE", "", &[]).await
    }

    async fn find_by_trip_and_traveler(
        &self,
        trip_id: Uuid,
        traveler_id: Uuid,
    ) -> StoreResult<Vec<Reservation>> {
        self.select("trip_id = $1 AND traveler_id = $2", &[trip_id, traveler_id])
            .await
    }

    async fn find_by_trip(&self, trip_id: Uuid) -> StoreResult<Vec<Reservation>> {
        self.select("trip_id = $1", &[trip_id]).await
    }

    async fn find_by_traveler(&self, traveler_id: Uuid) -> StoreResult<Vec<Reservation>> {
        self.select("traveler_id = $1", &[traveler_id]).await
    }
}
