// Uptime Calculator (C9, spec §4.9).
//
// Computes each validator's participation rate over a sliding round window.
// Grounded on the teacher's bounded-concurrency fan-out pattern in
// `blockchain/chain_sync/src/sync.rs` (a semaphore-style cap on in-flight
// work), applied here to bound how many validators are scored concurrently
// rather than how many block-fetch workers run at once.

use std::sync::Arc;

use bigdecimal::BigDecimal;
use chrono::Utc;
use num_traits::FromPrimitive;
use sqlx::PgPool;
use tokio::sync::Semaphore;
use tracing::{debug, instrument};

use crate::config::UptimeConfig;
use crate::error::Result;
use crate::store::models::UptimeSnapshot;

/// One validator's computed uptime over `[start_round, end_round]`.
#[derive(Debug, Clone, PartialEq)]
pub struct UptimeResult {
    pub validator_address: String,
    pub start_round: i64,
    pub end_round: i64,
    pub total_rounds: i32,
    pub participated_rounds: i32,
    pub uptime_percentage: BigDecimal,
}

pub struct UptimeCalculator {
    pool: PgPool,
    round_span: u64,
    concurrency_limit: usize,
}

impl UptimeCalculator {
    pub fn new(pool: PgPool, config: &UptimeConfig) -> Self {
        Self {
            pool,
            round_span: config.round_span,
            concurrency_limit: config.concurrency_limit,
        }
    }

    /// Computes and persists snapshots using the highest round among
    /// persisted blocks as "now". A no-op if no blocks have been persisted
    /// yet.
    pub async fn calculate_all_at_latest_round(&self) -> Result<Vec<UptimeSnapshot>> {
        match crate::store::latest_round(&self.pool).await? {
            Some(current_round) => self.calculate_all(current_round).await,
            None => Ok(Vec::new()),
        }
    }

    /// Computes and persists an `UptimeSnapshot` for every validator known
    /// to the committee, each over its own sliding window ending at
    /// `current_round` (spec §4.9: `start_round = max(earliest_round(V),
    /// current_round - round_span)`, so a validator seen for the first time
    /// recently gets a narrower window rather than being penalized for
    /// rounds before it existed).
    #[instrument(skip(self))]
    pub async fn calculate_all(&self, current_round: i64) -> Result<Vec<UptimeSnapshot>> {
        let validators: Vec<(String,)> =
            sqlx::query_as("SELECT address FROM committee_members WHERE is_active")
                .fetch_all(&self.pool)
                .await?;

        let semaphore = Arc::new(Semaphore::new(self.concurrency_limit.max(1)));
        let round_span = self.round_span as i64;
        let mut handles = Vec::with_capacity(validators.len());

        for (address,) in validators {
            let semaphore = semaphore.clone();
            let pool = self.pool.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
                calculate_one_windowed(&pool, &address, current_round, round_span).await
            }));
        }

        let mut snapshots = Vec::with_capacity(handles.len());
        for handle in handles {
            let outcome = handle
                .await
                .map_err(|e| crate::error::ObservatoryError::invariant(format!("uptime task panicked: {e}")))??;
            if let Some(result) = outcome {
                let snapshot = persist_snapshot(&self.pool, result).await?;
                update_validator_scalars(&self.pool, &snapshot).await?;
                snapshots.push(snapshot);
            }
        }

        Ok(snapshots)
    }
}

/// Resolves the validator-specific window and computes its uptime, or
/// returns `None` when the run is a no-op for this validator (spec §4.9:
/// no historical participation at all, or the resolved window is empty).
async fn calculate_one_windowed(
    pool: &PgPool,
    validator_address: &str,
    current_round: i64,
    round_span: i64,
) -> Result<Option<UptimeResult>> {
    let earliest_round: Option<i64> = sqlx::query_scalar(
        r#"
        SELECT MIN(round) FROM (
            SELECT round FROM committee_participation WHERE validator_address = $1
            UNION ALL
            SELECT round FROM signature_participation WHERE validator_address = $1
        ) seen
        "#,
    )
    .bind(validator_address)
    .fetch_one(pool)
    .await?;

    let Some(earliest_round) = earliest_round else {
        debug!(validator_address, "validator never appeared in any committee, skipping snapshot");
        return Ok(None);
    };

    let start_round = earliest_round.max(current_round - round_span);
    if start_round >= current_round {
        debug!(validator_address, start_round, current_round, "window is empty, skipping snapshot");
        return Ok(None);
    }

    Ok(Some(calculate_one(pool, validator_address, start_round, current_round).await?))
}

/// Computes one validator's uptime over `[start_round, end_round]` (spec
/// §4.9 steps 1-5). A committee counts as "participated" if at least one of
/// its rounds in the window was one the validator authored a batch in or
/// co-signed one in (the two committee-participation definitions the
/// source used inconsistently, unified per spec §9's open question);
/// `total_rounds`/`participated_rounds` hold the *committee* counts (the
/// column names are the schema's, spec §3), not a count of rounds. Division
/// by zero degrades to `0.0` rather than erroring (spec §4.9 edge policy).
pub async fn calculate_one(
    pool: &PgPool,
    validator_address: &str,
    start_round: i64,
    end_round: i64,
) -> Result<UptimeResult> {
    let (total_committees, participated_committees): (i64, i64) = sqlx::query_as(
        r#"
        WITH total AS (
            SELECT DISTINCT committee_id, round FROM batches
                WHERE round >= $2 AND round <= $3
        ),
        participated AS (
            SELECT DISTINCT committee_id, round FROM (
                SELECT committee_id, round FROM committee_participation
                    WHERE validator_address = $1 AND round >= $2 AND round <= $3
                UNION
                SELECT committee_id, round FROM signature_participation
                    WHERE validator_address = $1 AND round >= $2 AND round <= $3
            ) u
        )
        SELECT
            (SELECT COUNT(DISTINCT committee_id) FROM total) AS total_committees,
            (SELECT COUNT(DISTINCT t.committee_id) FROM total t
                WHERE EXISTS (
                    SELECT 1 FROM participated p
                    WHERE p.committee_id = t.committee_id AND p.round = t.round
                )) AS participated_committees
        "#,
    )
    .bind(validator_address)
    .bind(start_round)
    .bind(end_round)
    .fetch_one(pool)
    .await?;

    let total_rounds = total_committees as i32;
    let participated_rounds = participated_committees as i32;

    let uptime_percentage = if total_committees == 0 {
        BigDecimal::from(0)
    } else {
        BigDecimal::from_f64(participated_committees as f64 / total_committees as f64 * 100.0)
            .unwrap_or_else(|| BigDecimal::from(0))
    };

    Ok(UptimeResult {
        validator_address: validator_address.to_string(),
        start_round,
        end_round,
        total_rounds,
        participated_rounds,
        uptime_percentage,
    })
}

async fn persist_snapshot(pool: &PgPool, result: UptimeResult) -> Result<UptimeSnapshot> {
    let row: UptimeSnapshot = sqlx::query_as(
        r#"
        INSERT INTO uptime_snapshots
            (validator_address, start_round, end_round, total_rounds, participated_rounds, uptime_percentage, calculated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING id, validator_address, start_round, end_round, total_rounds, participated_rounds, uptime_percentage, calculated_at
        "#,
    )
    .bind(&result.validator_address)
    .bind(result.start_round)
    .bind(result.end_round)
    .bind(result.total_rounds)
    .bind(result.participated_rounds)
    .bind(&result.uptime_percentage)
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;
    Ok(row)
}

/// Upserts the same values onto the validator's `committee_members` row
/// (spec §4.9 step 5: "Also upsert derived scalar fields on the validator
/// record"), so a reader of `committee_members` alone sees current uptime
/// without joining `uptime_snapshots`. A no-op if the validator has no
/// `committee_members` row (e.g. it was only ever a signer, never an
/// author with a resolved mapping).
async fn update_validator_scalars(pool: &PgPool, snapshot: &UptimeSnapshot) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE committee_members
        SET uptime_percentage = $2, total_rounds = $3, participated_rounds = $4
        WHERE address = $1
        "#,
    )
    .bind(&snapshot.validator_address)
    .bind(&snapshot.uptime_percentage)
    .bind(snapshot.total_rounds)
    .bind(snapshot.participated_rounds)
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uptime_percentage_scenario_5() {
        // Spec §8 scenario 5: 20 of 50 distinct committee_ids in the window
        // had at least one round the validator participated in.
        let pct = BigDecimal::from_f64(20.0 / 50.0 * 100.0).unwrap();
        assert_eq!(pct.to_string(), "40");
    }

    #[test]
    fn zero_total_rounds_yields_zero_not_division_error() {
        let total_rounds = 0i32;
        let uptime_percentage = if total_rounds == 0 {
            BigDecimal::from(0)
        } else {
            unreachable!()
        };
        assert_eq!(uptime_percentage, BigDecimal::from(0));
    }
}
