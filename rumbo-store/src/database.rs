use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use rumbo_core::repository::StoreError;
use rumbo_core::rules::EngineRules;
use rumbo_shared::{UnknownVariant, ViolationType};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};
use tracing::{info, warn};

#[derive(Clone)]
pub struct DbClient {
    pub pool: Pool<Postgres>,
}

impl DbClient {
    pub async fn new(connection_string: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(3))
            .connect(connection_string)
            .await?;

        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        info!("Running database migrations...");
        sqlx::migrate!("../migrations").run(&self.pool).await?;
        info!("Migrations completed successfully.");
        Ok(())
    }

    /// Layer the rows of `engine_rules` over the configured rules.
    ///
    /// Rows look like `("major_delay_minutes", {"value": 20})`. Unknown keys and values
    /// of the wrong shape are skipped.
    pub async fn fetch_engine_rules(&self, defaults: EngineRules) -> Result<EngineRules, sqlx::Error> {
        #[derive(sqlx::FromRow)]
        struct RuleRow {
            rule_key: String,
            rule_value: Value,
        }

        let rows: Vec<RuleRow> = sqlx::query_as("SELECT rule_key, rule_value FROM engine_rules")
            .fetch_all(&self.pool)
            .await?;

        let mut rules = defaults;

        for row in rows {
            let Some(v) = row.rule_value.get("value") else {
                warn!("Engine rule {} has no value", row.rule_key);
                continue;
            };

            match row.rule_key.as_str() {
                "start_grace_minutes" => set_i64(&mut rules.start_grace_minutes, v),
                "minor_delay_minutes" => set_i64(&mut rules.minor_delay_minutes, v),
                "major_delay_minutes" => set_i64(&mut rules.major_delay_minutes, v),
                "no_show_deadline_minutes" => set_i64(&mut rules.no_show_deadline_minutes, v),
                "max_trip_duration_hours" => set_i64(&mut rules.max_trip_duration_hours, v),
                "violation_retention_days" => set_i64(&mut rules.violation_retention_days, v),
                "attendance_window_minutes" => set_i64(&mut rules.attendance_window_minutes, v),
                "forgotten_closure_threshold" => set_u32(&mut rules.forgotten_closure_threshold, v),
                "version_retry_limit" => set_u32(&mut rules.version_retry_limit, v),
                "strike_weights" => match serde_json::from_value::<BTreeMap<ViolationType, u32>>(v.clone()) {
                    Ok(overrides) => rules.strike_weights.merge(overrides),
                    Err(e) => warn!("Ignoring malformed strike_weights override: {}", e),
                },
                other => warn!("Ignoring unknown engine rule {}", other),
            }
        }

        Ok(rules)
    }
}

fn set_i64(field: &mut i64, v: &Value) {
    if let Some(n) = v.as_i64() {
        *field = n;
    }
}

fn set_u32(field: &mut u32, v: &Value) {
    if let Some(n) = v.as_u64().and_then(|n| u32::try_from(n).ok()) {
        *field = n;
    }
}

/// Unique-index hits become [`StoreError::UniqueViolation`]; everything else is a backend failure
pub(crate) fn store_err(e: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db_err) = &e {
        if db_err.is_unique_violation() {
            return StoreError::UniqueViolation(db_err.message().to_string());
        }
    }
    StoreError::Backend(e.to_string())
}

pub(crate) fn parse_label<T>(value: &str) -> Result<T, StoreError>
where
    T: FromStr<Err = UnknownVariant>,
{
    value
        .parse()
        .map_err(|e: UnknownVariant| StoreError::Backend(e.to_string()))
}

pub(crate) fn to_count(value: i32, column: &str) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Backend(format!("negative {}: {}", column, value)))
}

pub(crate) fn to_db_count(value: u32, column: &str) -> Result<i32, StoreError> {
    i32::try_from(value).map_err(|_| StoreError::Backend(format!("{} out of range: {}", column, value)))
}
