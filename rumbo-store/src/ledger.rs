use async_trait::async_trait;
use rumbo_core::repository::{
    CommittedChange, ReservationChange, ReservationLedger, StoreError, StoreResult,
};
use rumbo_shared::Reservation;
use sqlx::PgPool;
use tracing::debug;

use crate::database::store_err;
use crate::history_repo::insert_entry;
use crate::reservation_repo::{ReservationRow, RESERVATION_COLUMNS};
use crate::trip_repo::update_trip;

/// Commits a reservation transition in one Postgres transaction.
///
/// Dropping the transaction on any early return rolls everything back.
pub struct PgReservationLedger {
    pool: PgPool,
}

impl PgReservationLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReservationLedger for PgReservationLedger {
    async fn commit(&self, change: ReservationChange) -> StoreResult<CommittedChange> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        let reservation = &change.reservation;

        // 1. Trip
        let trip_version = match &change.trip_update {
            Some(update) => Some(update_trip(&mut *tx, &update.trip, update.expected_version).await?),
            None => None,
        };

        // 2. Reservation
        let stored = match change.expected_state {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO reservations (id, trip_id, traveler_id, state, requested_at,
                        rejection_reason, payment_status, attendance, rating_eligible)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                    "#,
                )
                .bind(reservation.id)
                .bind(reservation.trip_id)
                .bind(reservation.traveler_id)
                .bind(reservation.state.as_str())
                .bind(reservation.requested_at)
                .bind(reservation.rejection_reason.as_deref())
                .bind(reservation.payment_status.as_str())
                .bind(reservation.attendance.as_str())
                .bind(reservation.rating_eligible)
                .execute(&mut *tx)
                .await
                .map_err(store_err)?;
                reservation.clone()
            }
            Some(expected) => {
                // Payment is refunded from the stored value, never copied from the caller
                let sql = format!(
                    r#"
                    UPDATE reservations
                    SET state = $3,
                        rejection_reason = $4,
                        payment_status = CASE
                            WHEN $5 AND payment_status = 'PAID' THEN 'REFUND_PENDING'
                            ELSE payment_status
                        END
                    WHERE id = $1 AND state = $2
                    RETURNING {}
                    "#,
                    RESERVATION_COLUMNS
                );
                let row = sqlx::query_as::<_, ReservationRow>(&sql)
                    .bind(reservation.id)
                    .bind(expected.as_str())
                    .bind(reservation.state.as_str())
                    .bind(reservation.rejection_reason.as_deref())
                    .bind(change.refund_if_paid)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(store_err)?;

                match row {
                    Some(row) => Reservation::try_from(row)?,
                    None => {
                        return Err(StoreError::VersionConflict {
                            entity: "reservation",
                            id: reservation.id,
                            expected: 0,
                        });
                    }
                }
            }
        };

        // 3. History
        let history_sequence = insert_entry(&mut *tx, &change.history).await?;

        tx.commit().await.map_err(store_err)?;
        debug!(
            "Committed reservation {} as {} (history #{})",
            reservation.id, reservation.state, history_sequence
        );

        Ok(CommittedChange {
            reservation: stored,
            trip_version,
            history_sequence,
        })
    }
}
