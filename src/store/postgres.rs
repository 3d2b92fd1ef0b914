use async_trait::async_trait;
use deadpool_postgres::{Config, Pool, PoolConfig, Runtime};
use tokio_postgres::NoTls;
use tracing::{debug, info};

use super::{PositionStore, UpsertOutcome};
use crate::error::{ConfigError, StoreError};
use crate::model::StoredRecord;

const SCHEMA_SQL: &str = include_str!("../../sql/schema.sql");

const UPSERT_POSITION: &str = "
INSERT INTO vehicle_positions (
    vehicle_id, trip_id, recorded_at, route_id, latitude, longitude,
    bearing, speed, current_stop_sequence, current_status, stop_id,
    vehicle_label, license_plate, wheelchair_accessible, ingested_at,
    source_sequence
) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
ON CONFLICT (vehicle_id, trip_id, recorded_at) DO UPDATE SET
    route_id = EXCLUDED.route_id,
    latitude = EXCLUDED.latitude,
    longitude = EXCLUDED.longitude,
    bearing = EXCLUDED.bearing,
    speed = EXCLUDED.speed,
    current_stop_sequence = EXCLUDED.current_stop_sequence,
    current_status = EXCLUDED.current_status,
    stop_id = EXCLUDED.stop_id,
    vehicle_label = EXCLUDED.vehicle_label,
    license_plate = EXCLUDED.license_plate,
    wheelchair_accessible = EXCLUDED.wheelchair_accessible,
    ingested_at = EXCLUDED.ingested_at,
    source_sequence = EXCLUDED.source_sequence,
    updated_at = now()
WHERE vehicle_positions.ingested_at <= EXCLUDED.ingested_at
RETURNING (xmax::text = '0') AS inserted";

const UPSERT_ROUTE: &str = "
INSERT INTO routes (route_id, first_seen, last_seen) VALUES ($1, $2, $2)
ON CONFLICT (route_id) DO UPDATE SET
    first_seen = LEAST(routes.first_seen, EXCLUDED.first_seen),
    last_seen = GREATEST(routes.last_seen, EXCLUDED.last_seen)";

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub dsn: String,
    pub pool_size: usize,
}

/// Create a connection pool from a PostgreSQL connection string.
pub fn create_pool(config: &StoreConfig) -> Result<Pool, ConfigError> {
    let invalid = |reason: String| ConfigError::Invalid {
        name: "store-dsn",
        reason,
    };

    let pg_config: tokio_postgres::Config = config
        .dsn
        .parse()
        .map_err(|e: tokio_postgres::Error| invalid(e.to_string()))?;

    let mut cfg = Config::new();
    if let Some(host) = pg_config.get_hosts().first() {
        match host {
            tokio_postgres::config::Host::Tcp(h) => cfg.host = Some(h.clone()),
            #[cfg(unix)]
            tokio_postgres::config::Host::Unix(p) => {
                cfg.host = Some(p.to_string_lossy().to_string())
            }
        }
    }
    if let Some(port) = pg_config.get_ports().first() {
        cfg.port = Some(*port);
    }
    if let Some(user) = pg_config.get_user() {
        cfg.user = Some(user.to_string());
    }
    if let Some(password) = pg_config.get_password() {
        cfg.password = Some(String::from_utf8_lossy(password).to_string());
    }
    if let Some(dbname) = pg_config.get_dbname() {
        cfg.dbname = Some(dbname.to_string());
    }
    cfg.pool = Some(PoolConfig::new(config.pool_size.max(1)));

    cfg.create_pool(Some(Runtime::Tokio1), NoTls)
        .map_err(|e| invalid(format!("failed to create pool: {e}")))
}

/// [`PositionStore`] on PostgreSQL. Each upsert runs in its own
/// transaction on a pooled connection.
#[derive(Clone)]
pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Creates the tables and indexes if they are missing.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        let client = self.pool.get().await?;
        client.batch_execute(SCHEMA_SQL).await?;
        info!("Store schema ensured");
        Ok(())
    }
}

#[async_trait]
impl PositionStore for PgStore {
    #[tracing::instrument(skip(self, record), fields(key = %record.key()))]
    async fn upsert(&self, record: &StoredRecord) -> Result<UpsertOutcome, StoreError> {
        let p = &record.position;
        let current_stop_sequence = p.current_stop_sequence.map(i64::from);
        let current_status = p.current_status.map(|s| s.as_str());
        let source_sequence = record
            .source_sequence
            .map(|s| i64::try_from(s).unwrap_or(i64::MAX));

        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let row = tx
            .query_opt(
                UPSERT_POSITION,
                &[
                    &p.vehicle_id,
                    &p.trip_id,
                    &p.timestamp,
                    &p.route_id,
                    &p.latitude,
                    &p.longitude,
                    &p.bearing,
                    &p.speed,
                    &current_stop_sequence,
                    &current_status,
                    &p.stop_id,
                    &p.vehicle_label,
                    &p.license_plate,
                    &p.wheelchair_accessible,
                    &p.ingested_at,
                    &source_sequence,
                ],
            )
            .await?;

        tx.execute(UPSERT_ROUTE, &[&p.route_id, &p.timestamp])
            .await?;
        tx.commit().await?;

        let outcome = match row {
            Some(row) if row.get::<_, bool>("inserted") => UpsertOutcome::Inserted,
            Some(_) => UpsertOutcome::Updated,
            None => UpsertOutcome::Stale,
        };
        debug!(?outcome, "Upserted position");
        Ok(outcome)
    }
}
