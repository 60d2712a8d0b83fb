//! # Local Store
//!
//! Durable device-side state in SQLite:
//!
//! - `vehicle_snapshots`: last reconciled [`VehicleState`] per vehicle, as JSON
//! - `trip_state`: the geofence counting flag and trip accumulators per vehicle
//! - `markers`: named monotonically increasing timestamps
//!
//! The geofence handler may run in a different process from the dispatcher
//! (`buslink geofence ...`), so every trip-state transition is a single SQL
//! statement. WAL journaling plus a busy timeout lets both processes share the
//! file. Concurrent writers resolve last-writer-wins.

use crate::fleet::VehicleState;
use crate::protocol::VehicleId;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_CONNECTIONS: u32 = 4;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS vehicle_snapshots (
        vehicle_id  TEXT PRIMARY KEY NOT NULL,
        snapshot    TEXT NOT NULL,
        updated_at  INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS trip_state (
        vehicle_id       TEXT PRIMARY KEY NOT NULL,
        counting_active  INTEGER NOT NULL DEFAULT 0,
        started_at       INTEGER NOT NULL,
        entries          INTEGER NOT NULL DEFAULT 0,
        exits            INTEGER NOT NULL DEFAULT 0,
        inside           INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS markers (
        name   TEXT PRIMARY KEY NOT NULL,
        value  INTEGER NOT NULL
    )
    "#,
];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Snapshot encoding error: {0}")]
    Snapshot(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Counters read back from a trip when it closes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenTrip {
    pub started_at: DateTime<Utc>,
    pub entries: u32,
    pub exits: u32,
    pub inside: u32,
}

/// Full trip row, open or not
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TripState {
    pub counting_active: bool,
    pub trip: OpenTrip,
}

/// Handle over the SQLite pool; cheap to clone
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if needed) the store at `path`; `:memory:` gives an
    /// ephemeral store
    pub async fn open(path: &str) -> StoreResult<Self> {
        if path == ":memory:" {
            return Self::in_memory().await;
        }

        info!(path = %path, "Opening local store");

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .min_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.create_schema().await?;
        Ok(store)
    }

    /// Ephemeral store for tests; a single connection that is never recycled
    pub async fn in_memory() -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.create_schema().await?;
        Ok(store)
    }

    async fn create_schema(&self) -> StoreResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("Store schema ready");
        Ok(())
    }

    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    pub async fn close(&self) {
        info!("Closing local store");
        self.pool.close().await;
    }

    // ------------------------------------------------------------------
    // Vehicle snapshots
    // ------------------------------------------------------------------

    pub async fn save_snapshot(&self, state: &VehicleState) -> StoreResult<()> {
        let snapshot = serde_json::to_string(state)?;

        sqlx::query(
            r#"
            INSERT INTO vehicle_snapshots (vehicle_id, snapshot, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(vehicle_id) DO UPDATE SET
                snapshot = excluded.snapshot,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(state.id.as_str())
        .bind(snapshot)
        .bind(state.last_updated.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn load_snapshot(&self, vehicle: &VehicleId) -> StoreResult<Option<VehicleState>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT snapshot FROM vehicle_snapshots WHERE vehicle_id = ?1")
                .bind(vehicle.as_str())
                .fetch_optional(&self.pool)
                .await?;

        row.map(|(snapshot,)| serde_json::from_str(&snapshot))
            .transpose()
            .map_err(StoreError::from)
    }

    /// Every persisted snapshot, ordered by vehicle id
    pub async fn load_snapshots(&self) -> StoreResult<Vec<VehicleState>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT snapshot FROM vehicle_snapshots ORDER BY vehicle_id")
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter()
            .map(|(snapshot,)| serde_json::from_str(&snapshot).map_err(StoreError::from))
            .collect()
    }

    // ------------------------------------------------------------------
    // Trip state
    // ------------------------------------------------------------------

    /// Raise the counting flag and zero the accumulators
    pub async fn begin_trip(
        &self,
        vehicle: &VehicleId,
        started_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO trip_state (vehicle_id, counting_active, started_at, entries, exits, inside)
            VALUES (?1, 1, ?2, 0, 0, 0)
            ON CONFLICT(vehicle_id) DO UPDATE SET
                counting_active = 1,
                started_at = excluded.started_at,
                entries = 0,
                exits = 0,
                inside = 0
            "#,
        )
        .bind(vehicle.as_str())
        .bind(started_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Add a delta to an open trip; returns false when no trip is open
    pub async fn accumulate_trip(
        &self,
        vehicle: &VehicleId,
        entered: u32,
        exited: u32,
        total: Option<u32>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE trip_state SET
                entries = entries + ?2,
                exits = exits + ?3,
                inside = CASE
                    WHEN ?4 IS NULL THEN MAX(0, inside + ?2 - ?3)
                    ELSE ?4
                END
            WHERE vehicle_id = ?1 AND counting_active = 1
            "#,
        )
        .bind(vehicle.as_str())
        .bind(i64::from(entered))
        .bind(i64::from(exited))
        .bind(total.map(i64::from))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Lower the counting flag and read the accumulators in one statement.
    ///
    /// Returns `None` when no trip was open, so a repeated close yields at
    /// most one result.
    pub async fn close_trip(&self, vehicle: &VehicleId) -> StoreResult<Option<OpenTrip>> {
        let row: Option<(i64, i64, i64, i64)> = sqlx::query_as(
            r#"
            UPDATE trip_state SET counting_active = 0
            WHERE vehicle_id = ?1 AND counting_active = 1
            RETURNING started_at, entries, exits, inside
            "#,
        )
        .bind(vehicle.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(open_trip_from_row))
    }

    pub async fn trip_state(&self, vehicle: &VehicleId) -> StoreResult<Option<TripState>> {
        let row: Option<(i64, i64, i64, i64, i64)> = sqlx::query_as(
            r#"
            SELECT counting_active, started_at, entries, exits, inside
            FROM trip_state WHERE vehicle_id = ?1
            "#,
        )
        .bind(vehicle.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(active, started_at, entries, exits, inside)| TripState {
            counting_active: active != 0,
            trip: open_trip_from_row((started_at, entries, exits, inside)),
        }))
    }

    pub async fn is_counting(&self, vehicle: &VehicleId) -> StoreResult<bool> {
        Ok(self
            .trip_state(vehicle)
            .await?
            .is_some_and(|state| state.counting_active))
    }

    // ------------------------------------------------------------------
    // Markers
    // ------------------------------------------------------------------

    /// Move a marker forward; never moves it backward. Returns the stored value.
    pub async fn advance_marker(&self, name: &str, value: i64) -> StoreResult<i64> {
        let (stored,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO markers (name, value) VALUES (?1, ?2)
            ON CONFLICT(name) DO UPDATE SET value = MAX(value, excluded.value)
            RETURNING value
            "#,
        )
        .bind(name)
        .bind(value)
        .fetch_one(&self.pool)
        .await?;

        Ok(stored)
    }

    pub async fn marker(&self, name: &str) -> StoreResult<Option<i64>> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT value FROM markers WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(value,)| value))
    }
}

fn open_trip_from_row((started_at, entries, exits, inside): (i64, i64, i64, i64)) -> OpenTrip {
    OpenTrip {
        started_at: DateTime::from_timestamp_millis(started_at).unwrap_or_default(),
        entries: to_count(entries),
        exits: to_count(exits),
        inside: to_count(inside),
    }
}

fn to_count(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}
