// Persisted row types (spec §3 DATA MODEL).
//
// Grounded on the teacher's typed row structs for its own backends (e.g.
// `node/db/src/rocks_config.rs`'s `#[derive(Serialize, Deserialize)]`
// config rows); here every row additionally derives `sqlx::FromRow` since
// the backing store is Postgres via `sqlx` rather than an embedded KV.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Block {
    pub height: i64,
    pub hash: String,
    pub previous_hash: String,
    pub round: i64,
    pub timestamp: DateTime<Utc>,
    pub transactions_count: i32,
    pub block_reward: Option<BigDecimal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Batch {
    pub batch_id: String,
    pub round: i64,
    pub author: String,
    pub timestamp: DateTime<Utc>,
    pub committee_id: String,
    pub block_height: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct CommitteeMember {
    pub address: String,
    pub first_seen_block: i64,
    pub last_seen_block: i64,
    pub total_stake: BigDecimal,
    pub is_open: bool,
    pub commission: i16,
    pub is_active: bool,
    pub block_height: i64,
    pub last_updated: DateTime<Utc>,
    /// Mirrors the validator's most recent `UptimeSnapshot` (spec §4.9 step
    /// 5); `None` until the Uptime Engine has computed at least one
    /// snapshot for this validator.
    pub uptime_percentage: Option<BigDecimal>,
    pub total_rounds: Option<i32>,
    pub participated_rounds: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct CommitteeParticipation {
    pub validator_address: String,
    pub round: i64,
    pub committee_id: String,
    pub block_height: i64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct SignatureParticipation {
    pub validator_address: String,
    pub batch_id: String,
    pub round: i64,
    pub committee_id: String,
    pub block_height: i64,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct UptimeSnapshot {
    pub id: i64,
    pub validator_address: String,
    pub start_round: i64,
    pub end_round: i64,
    pub total_rounds: i32,
    pub participated_rounds: i32,
    pub uptime_percentage: BigDecimal,
    pub calculated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Metadata {
    pub key: String,
    pub value: String,
}

pub const METADATA_LAST_FULLY_SYNCED_HEIGHT: &str = "last_fully_synced_height";

/// The five record streams a decoded window produces, in the persist order
/// spec §4.6 requires (Blocks → Batches → CommitteeMembers →
/// CommitteeParticipations → SignatureParticipations).
#[derive(Debug, Clone, Default)]
pub struct DecodedWindow {
    pub blocks: Vec<Block>,
    pub batches: Vec<Batch>,
    pub committee_members: Vec<CommitteeMember>,
    pub committee_participations: Vec<CommitteeParticipation>,
    pub signature_participations: Vec<SignatureParticipation>,
}

impl DecodedWindow {
    pub fn merge(&mut self, other: DecodedWindow) {
        self.blocks.extend(other.blocks);
        self.batches.extend(other.batches);
        self.committee_members.extend(other.committee_members);
        self.committee_participations
            .extend(other.committee_participations);
        self.signature_participations
            .extend(other.signature_participations);
    }
}
