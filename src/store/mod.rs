// Store (spec §3 DATA MODEL, §4.6 Bulk Persister, §6 persisted schema).
//
// Grounded on the teacher's pool-construction style for its own sqlite
// backend (`utils/db/src/pool.rs` / `forest/shared/src/cli/config.rs`'s
// `DbConfig`) generalized to `sqlx::PgPool` since this crate's backing
// store is Postgres.

pub mod models;
pub mod persister;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::config::DatabaseConfig;
use crate::error::Result;
use crate::store::models::{Metadata, METADATA_LAST_FULLY_SYNCED_HEIGHT};

pub async fn connect(config: &DatabaseConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.connect_timeout)
        .idle_timeout(config.idle_timeout)
        .connect(&config.url)
        .await?;
    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| crate::error::ObservatoryError::persistence(e.to_string()))?;
    Ok(())
}

/// Reads the sync cursor persisted by the last fully-completed window, if
/// any (spec §4.7's "resume from the stored progress marker").
pub async fn last_fully_synced_height(pool: &PgPool) -> Result<Option<i64>> {
    let row: Option<Metadata> =
        sqlx::query_as("SELECT key, value FROM metadata WHERE key = $1")
            .bind(METADATA_LAST_FULLY_SYNCED_HEIGHT)
            .fetch_optional(pool)
            .await?;
    Ok(row.and_then(|m| m.value.parse().ok()))
}

/// The highest round seen among persisted blocks, used as "now" for uptime
/// calculation (spec §4.9).
pub async fn latest_round(pool: &PgPool) -> Result<Option<i64>> {
    let round: Option<i64> = sqlx::query_scalar("SELECT MAX(round) FROM blocks")
        .fetch_one(pool)
        .await?;
    Ok(round)
}

pub async fn set_last_fully_synced_height(pool: &PgPool, height: i64) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO metadata (key, value) VALUES ($1, $2)
        ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value
        "#,
    )
    .bind(METADATA_LAST_FULLY_SYNCED_HEIGHT)
    .bind(height.to_string())
    .execute(pool)
    .await?;
    Ok(())
}
