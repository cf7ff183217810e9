// Block Decoder (C5, spec §4.5).
//
// Converts one raw block into a `Block` row plus the DAG tuples extracted
// from its quorum authority. Grounded on `blockchain/chain_sync/src/sync.rs`
// `load_fts`/`validate_msg_meta` (pure per-block extraction reading from a
// mapping-resolving collaborator) and `compute_msg_meta` (building derived
// rows out of a block's constituent parts without touching the network
// itself — all network I/O here lives behind `MappingCache`).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::chain_client::RawBlock;
use crate::error::{ObservatoryError, Result};
use crate::mapping_cache::{self, MappingCache};
use crate::store::models::{
    Batch, CommitteeMember, CommitteeParticipation, DecodedWindow, SignatureParticipation,
};

/// Recovers a validator address from a raw signature. External and
/// deterministic per spec §4.5 ("The recovery function (external) must be
/// deterministic and collision-free across validators"); the chain's actual
/// signature scheme is out of this core's scope, so this is the seam an
/// integration would plug a real recoverer into.
pub trait SignatureRecovery: Send + Sync {
    fn recover_address(&self, signature: &str) -> Result<String>;
}

/// Default recoverer: a deterministic, collision-resistant digest of the
/// signature bytes. Stands in for the chain-specific recovery scheme, which
/// is outside this core's contract (spec §4.1).
pub struct DigestSignatureRecovery;

impl SignatureRecovery for DigestSignatureRecovery {
    fn recover_address(&self, signature: &str) -> Result<String> {
        if signature.is_empty() {
            return Err(ObservatoryError::decode(0, "empty signature"));
        }
        let digest = blake2b_simd::blake2b(signature.as_bytes());
        Ok(format!("obs1{}", hex::encode(&digest.as_bytes()[..20])))
    }
}

pub struct BlockDecoder {
    mapping_cache: Arc<MappingCache>,
    signature_recovery: Arc<dyn SignatureRecovery>,
}

impl BlockDecoder {
    pub fn new(mapping_cache: Arc<MappingCache>, signature_recovery: Arc<dyn SignatureRecovery>) -> Self {
        Self {
            mapping_cache,
            signature_recovery,
        }
    }

    /// Decodes one raw block into its constituent record streams. Pure
    /// apart from mapping resolution (spec §4.5): a mapping-cache miss for
    /// a given author degrades only that batch's `CommitteeMember` row, it
    /// never drops the batch/participation/signature rows.
    pub async fn decode(&self, raw: &RawBlock) -> Result<DecodedWindow> {
        let mut window = DecodedWindow::default();

        let height = raw.header.metadata.height as i64;
        let timestamp = unix_seconds(raw.header.metadata.timestamp);

        let block_reward = raw
            .ratifications
            .iter()
            .find(|r| r.kind == "block_reward")
            .and_then(|r| r.amount.as_deref())
            .and_then(|amount| amount.parse().ok());

        window.blocks.push(crate::store::models::Block {
            height,
            hash: raw.block_hash.clone(),
            previous_hash: raw.previous_hash.clone(),
            round: raw.header.metadata.round as i64,
            timestamp,
            transactions_count: raw.transactions_count as i32,
            block_reward,
        });

        for (round_key, batches) in &raw.authority.subdag.subdag {
            let round: i64 = round_key.parse().map_err(|_| {
                ObservatoryError::decode(
                    raw.header.metadata.height,
                    format!("unparseable round key {round_key:?}"),
                )
            })?;

            for batch in batches {
                self.decode_batch(raw.header.metadata.height, height, round, batch, &mut window)
                    .await?;
            }
        }

        Ok(window)
    }

    async fn decode_batch(
        &self,
        raw_height: u64,
        height: i64,
        round: i64,
        batch: &crate::chain_client::SubdagBatch,
        window: &mut DecodedWindow,
    ) -> Result<()> {
        let header = &batch.batch_header;
        let author = header.author.clone();
        let committee_id = header
            .committee_id
            .clone()
            .unwrap_or_else(|| "unknown".to_string());
        let batch_timestamp = unix_seconds(header.timestamp);

        let mapping = self.mapping_cache.get(&author).await;
        if let (Some(committee), Some(bonded)) = (&mapping.committee, &mapping.bonded) {
            let committee_value: crate::chain_client::MappingValue = committee.clone().into();
            let bonded_value: crate::chain_client::MappingValue = bonded.clone().into();

            let bonded_microcredits = mapping_cache::record_field(&bonded_value, "microcredits")
                .and_then(mapping_cache::parse_microcredits);
            let delegated_microcredits = mapping
                .delegated
                .as_ref()
                .map(|d| d.clone().into())
                .and_then(|v: crate::chain_client::MappingValue| {
                    mapping_cache::record_field(&v, "microcredits")
                        .and_then(mapping_cache::parse_microcredits)
                });

            match bonded_microcredits {
                Some(bonded_stake) => {
                    let total_stake = match delegated_microcredits {
                        Some(delegated_stake) => bonded_stake + delegated_stake,
                        None => bonded_stake,
                    };
                    let is_open = mapping_cache::record_field(&committee_value, "is_open")
                        .map(mapping_cache::parse_is_open)
                        .unwrap_or(false);
                    let commission = mapping_cache::record_field(&committee_value, "commission")
                        .and_then(mapping_cache::parse_commission);

                    if let Some(commission) = commission {
                        window.committee_members.push(CommitteeMember {
                            address: author.clone(),
                            first_seen_block: height,
                            last_seen_block: height,
                            total_stake,
                            is_open,
                            commission: i16::from(commission),
                            is_active: true,
                            block_height: height,
                            last_updated: Utc::now(),
                            uptime_percentage: None,
                            total_rounds: None,
                            participated_rounds: None,
                        });
                    } else {
                        warn!(validator_address = %author, "commission out of range, skipping committee member row");
                    }
                }
                None => {
                    warn!(validator_address = %author, "bonded mapping did not yield microcredits, skipping committee member row");
                }
            }
        }

        window.batches.push(Batch {
            batch_id: header.batch_id.clone(),
            round,
            author: author.clone(),
            timestamp: batch_timestamp,
            committee_id: committee_id.clone(),
            block_height: height,
        });

        window.committee_participations.push(CommitteeParticipation {
            validator_address: author.clone(),
            round,
            committee_id: committee_id.clone(),
            block_height: height,
            timestamp: batch_timestamp,
        });

        // Self-sign: the author's own signature over the batch header.
        let self_signer = self.signature_recovery.recover_address(&header.signature).map_err(|_| {
            ObservatoryError::decode(raw_height, format!("failed to recover author signer for batch {}", header.batch_id))
        })?;
        window.signature_participations.push(SignatureParticipation {
            validator_address: self_signer,
            batch_id: header.batch_id.clone(),
            round,
            committee_id: committee_id.clone(),
            block_height: height,
            timestamp: batch_timestamp,
            success: true,
        });

        for signature in &batch.signatures {
            let signer = self.signature_recovery.recover_address(signature).map_err(|_| {
                ObservatoryError::decode(raw_height, format!("failed to recover signer for batch {}", header.batch_id))
            })?;
            window.signature_participations.push(SignatureParticipation {
                validator_address: signer,
                batch_id: header.batch_id.clone(),
                round,
                committee_id: committee_id.clone(),
                block_height: height,
                timestamp: batch_timestamp,
                success: true,
            });
        }

        Ok(())
    }
}

fn unix_seconds(seconds: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(seconds, 0).unwrap_or_else(|| DateTime::from_timestamp(0, 0).unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain_client::{
        Authority, BatchHeader, BlockHeader, BlockMetadata, ChainClient, MappingValue, RawBlock,
        Subdag, SubdagBatch,
    };
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct NullChainClient;

    #[async_trait]
    impl ChainClient for NullChainClient {
        async fn latest_height(&self) -> Result<u64> {
            Ok(0)
        }
        async fn block_range(&self, _start: u64, _end: u64) -> Result<Vec<RawBlock>> {
            Ok(Vec::new())
        }
        async fn mapping_value(&self, _p: &str, mapping: &str, _k: &str) -> Result<MappingValue> {
            match mapping {
                "members" => Ok(MappingValue::Record(HashMap::from([
                    ("is_open".to_string(), MappingValue::Bool(true)),
                    ("commission".to_string(), MappingValue::Text("5u8".to_string())),
                ]))),
                "bonded" => Ok(MappingValue::Record(HashMap::from([(
                    "microcredits".to_string(),
                    MappingValue::Text("1000u64".to_string()),
                )]))),
                _ => Ok(MappingValue::Null),
            }
        }
    }

    fn sample_block() -> RawBlock {
        let mut subdag = HashMap::new();
        subdag.insert(
            "42".to_string(),
            vec![SubdagBatch {
                batch_header: BatchHeader {
                    batch_id: "batch-1".to_string(),
                    author: "VA".to_string(),
                    timestamp: 1_700_000_000,
                    committee_id: Some("committee-a".to_string()),
                    signature: "sig-author".to_string(),
                },
                signatures: vec!["sig-x".to_string(), "sig-y".to_string()],
            }],
        );

        RawBlock {
            block_hash: "0xhash".to_string(),
            previous_hash: "0xprev".to_string(),
            header: BlockHeader {
                metadata: BlockMetadata {
                    height: 7,
                    round: 42,
                    timestamp: 1_700_000_000,
                    extra: HashMap::new(),
                },
            },
            ratifications: vec![],
            authority: Authority {
                subdag: Subdag { subdag },
            },
            transactions_count: 1,
        }
    }

    #[tokio::test]
    async fn decodes_one_block_with_three_signature_rows() {
        let cache = Arc::new(MappingCache::new(
            Arc::new(NullChainClient),
            std::time::Duration::from_secs(7200),
        ));
        let decoder = BlockDecoder::new(cache, Arc::new(DigestSignatureRecovery));

        let window = decoder.decode(&sample_block()).await.unwrap();

        assert_eq!(window.blocks.len(), 1);
        assert_eq!(window.blocks[0].height, 7);
        assert_eq!(window.batches.len(), 1);
        assert_eq!(window.committee_participations.len(), 1);
        assert_eq!(window.committee_participations[0].validator_address, "VA");
        assert_eq!(window.committee_participations[0].round, 42);
        assert_eq!(window.signature_participations.len(), 3);
        assert_eq!(window.committee_members.len(), 1);
        assert_eq!(window.committee_members[0].total_stake.to_string(), "1000");
        assert_eq!(window.committee_members[0].commission, 5);
        assert!(window.committee_members[0].is_open);

        let distinct: std::collections::HashSet<_> = window
            .signature_participations
            .iter()
            .map(|s| s.validator_address.clone())
            .collect();
        assert_eq!(distinct.len(), 3);
    }

    #[tokio::test]
    async fn missing_committee_mapping_skips_member_row_but_not_others() {
        struct NoCommitteeClient;
        #[async_trait]
        impl ChainClient for NoCommitteeClient {
            async fn latest_height(&self) -> Result<u64> {
                Ok(0)
            }
            async fn block_range(&self, _s: u64, _e: u64) -> Result<Vec<RawBlock>> {
                Ok(Vec::new())
            }
            async fn mapping_value(&self, _p: &str, _m: &str, _k: &str) -> Result<MappingValue> {
                Ok(MappingValue::Null)
            }
        }

        let cache = Arc::new(MappingCache::new(
            Arc::new(NoCommitteeClient),
            std::time::Duration::from_secs(7200),
        ));
        let decoder = BlockDecoder::new(cache, Arc::new(DigestSignatureRecovery));

        let window = decoder.decode(&sample_block()).await.unwrap();
        assert!(window.committee_members.is_empty());
        assert_eq!(window.batches.len(), 1);
        assert_eq!(window.signature_participations.len(), 3);
    }
}
