// Mapping Cache (C2, spec §4.2).
//
// Two-tier memoization of per-validator {committeeMapping, bondedMapping,
// delegatedMapping}: a process-local hot tier, and an optional shared tier
// (Redis) that degrades gracefully to local-only when `REDIS_URL` is unset.
// Grounded on the teacher's multi-backend `Store` abstraction
// (`node/db/src/lib.rs`) generalized from "durable KV with a few backend
// choices" to "hot tier + shared tier, first hit wins, write-through both".

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bigdecimal::BigDecimal;
use futures::future::join_all;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::chain_client::{ChainClient, MappingValue};
use crate::error::Result;

const COMMITTEE_PROGRAM: &str = "committee.aleo";
const COMMITTEE_MAPPING: &str = "members";
const BONDED_PROGRAM: &str = "credits.aleo";
const BONDED_MAPPING: &str = "bonded";
const DELEGATED_MAPPING: &str = "delegated";

/// The three sub-mappings tracked per validator. Each is independently
/// `None` if resolution or parsing failed (spec §4.2 "any failure to parse
/// a given sub-mapping yields `null` for that sub-mapping").
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ValidatorMapping {
    pub committee: Option<SerializableMappingValue>,
    pub bonded: Option<SerializableMappingValue>,
    pub delegated: Option<SerializableMappingValue>,
}

/// `MappingValue` does not round-trip through `serde_json` directly because
/// it is hand-built from an untyped `Value`; this wrapper gives it a stable
/// wire form for the shared (Redis) tier only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SerializableMappingValue {
    Scalar(String),
    Bool(bool),
    Text(String),
    Record(HashMap<String, SerializableMappingValue>),
    Null,
}

impl From<MappingValue> for SerializableMappingValue {
    fn from(value: MappingValue) -> Self {
        match value {
            MappingValue::Scalar(s) => Self::Scalar(s),
            MappingValue::Bool(b) => Self::Bool(b),
            MappingValue::Text(s) => Self::Text(s),
            MappingValue::Record(map) => {
                Self::Record(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
            MappingValue::Null => Self::Null,
        }
    }
}

impl From<SerializableMappingValue> for MappingValue {
    fn from(value: SerializableMappingValue) -> Self {
        match value {
            SerializableMappingValue::Scalar(s) => Self::Scalar(s),
            SerializableMappingValue::Bool(b) => Self::Bool(b),
            SerializableMappingValue::Text(s) => Self::Text(s),
            SerializableMappingValue::Record(map) => {
                Self::Record(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
            SerializableMappingValue::Null => Self::Null,
        }
    }
}

struct Entry {
    value: ValidatorMapping,
    inserted_at: Instant,
}

/// Process-local + (optional) shared-KV cache, write-through on both tiers.
pub struct MappingCache {
    chain_client: Arc<dyn ChainClient>,
    local: RwLock<HashMap<String, Entry>>,
    ttl: Duration,
    #[cfg(feature = "redis-cache")]
    shared: Option<redis::aio::ConnectionManager>,
}

impl MappingCache {
    pub fn new(chain_client: Arc<dyn ChainClient>, ttl: Duration) -> Self {
        Self {
            chain_client,
            local: RwLock::new(HashMap::new()),
            ttl,
            #[cfg(feature = "redis-cache")]
            shared: None,
        }
    }

    #[cfg(feature = "redis-cache")]
    pub async fn with_redis(
        chain_client: Arc<dyn ChainClient>,
        ttl: Duration,
        redis_url: &str,
    ) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let shared = redis::aio::ConnectionManager::new(client).await?;
        Ok(Self {
            chain_client,
            local: RwLock::new(HashMap::new()),
            ttl,
            shared: Some(shared),
        })
    }

    /// Returns the resolved mapping set for `address`, fetching and
    /// populating both tiers on a miss. Never returns an error: a chain
    /// client failure for one sub-mapping degrades that sub-mapping to
    /// `None` (spec §4.2, §4.5 "The decoder is pure apart from the mapping
    /// resolution").
    #[instrument(skip(self), fields(validator_address = %address))]
    pub async fn get(&self, address: &str) -> ValidatorMapping {
        if let Some(hit) = self.local_get(address) {
            return hit;
        }

        if let Some(hit) = self.shared_get(address).await {
            self.local_put(address, hit.clone());
            return hit;
        }

        let value = self.fetch(address).await;
        self.local_put(address, value.clone());
        self.shared_put(address, &value).await;
        value
    }

    fn local_get(&self, address: &str) -> Option<ValidatorMapping> {
        let guard = self.local.read();
        let entry = guard.get(address)?;
        if entry.inserted_at.elapsed() > self.ttl {
            return None;
        }
        Some(entry.value.clone())
    }

    fn local_put(&self, address: &str, value: ValidatorMapping) {
        self.local.write().insert(
            address.to_string(),
            Entry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    #[cfg(feature = "redis-cache")]
    async fn shared_get(&self, address: &str) -> Option<ValidatorMapping> {
        let mut conn = self.shared.clone()?;
        let raw: Option<String> = redis::AsyncCommands::get(&mut conn, redis_key(address))
            .await
            .ok()?;
        raw.and_then(|s| serde_json::from_str(&s).ok())
    }

    #[cfg(not(feature = "redis-cache"))]
    async fn shared_get(&self, _address: &str) -> Option<ValidatorMapping> {
        None
    }

    #[cfg(feature = "redis-cache")]
    async fn shared_put(&self, address: &str, value: &ValidatorMapping) {
        let Some(mut conn) = self.shared.clone() else {
            return;
        };
        if let Ok(serialized) = serde_json::to_string(value) {
            let _: Result<(), _> = redis::AsyncCommands::set_ex(
                &mut conn,
                redis_key(address),
                serialized,
                self.ttl.as_secs(),
            )
            .await;
        }
    }

    #[cfg(not(feature = "redis-cache"))]
    async fn shared_put(&self, _address: &str, _value: &ValidatorMapping) {}

    /// Three parallel fetches, one per sub-mapping (spec §4.2 "misses
    /// trigger three parallel fetches").
    async fn fetch(&self, address: &str) -> ValidatorMapping {
        let (committee, bonded, delegated) = {
            let mut futures = join_all([
                self.fetch_one(COMMITTEE_PROGRAM, COMMITTEE_MAPPING, address),
                self.fetch_one(BONDED_PROGRAM, BONDED_MAPPING, address),
                self.fetch_one(BONDED_PROGRAM, DELEGATED_MAPPING, address),
            ])
            .await;
            (futures.remove(0), futures.remove(0), futures.remove(0))
        };

        ValidatorMapping {
            committee,
            bonded,
            delegated,
        }
    }

    async fn fetch_one(
        &self,
        program: &str,
        mapping: &str,
        address: &str,
    ) -> Option<SerializableMappingValue> {
        match self.chain_client.mapping_value(program, mapping, address).await {
            Ok(MappingValue::Null) => None,
            Ok(value) => Some(value.into()),
            Err(err) => {
                warn!(
                    program, mapping, validator_address = address,
                    error = %err, "failed to resolve mapping sub-value"
                );
                None
            }
        }
    }
}

#[cfg(feature = "redis-cache")]
fn redis_key(address: &str) -> String {
    format!("observatory:mapping:{address}")
}

/// Strips a trailing numeric type suffix (`/u(8|16|32|64|128)$/`) before
/// integer conversion (spec §4.2 "bit-exact" parsing rules).
fn strip_numeric_suffix(raw: &str) -> &str {
    static SUFFIX: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    let re = SUFFIX.get_or_init(|| Regex::new(r"u(8|16|32|64|128)$").unwrap());
    match re.find(raw) {
        Some(m) if m.end() == raw.len() => &raw[..m.start()],
        _ => raw,
    }
}

fn scalar_text(value: &MappingValue) -> Option<&str> {
    match value {
        MappingValue::Scalar(s) | MappingValue::Text(s) => Some(s.as_str()),
        _ => None,
    }
}

/// `is_open` is truthy if the raw value is the boolean `true` or the string
/// `"true"` (spec §4.2).
pub fn parse_is_open(value: &MappingValue) -> bool {
    match value {
        MappingValue::Bool(b) => *b,
        MappingValue::Scalar(s) | MappingValue::Text(s) => s == "true",
        _ => false,
    }
}

/// `commission` is an integer in 0..100; out-of-range values leave the
/// record unrecorded (spec §4.2). Resolves the integer-percent
/// interpretation fixed by the Open Question in spec §9.
pub fn parse_commission(value: &MappingValue) -> Option<u8> {
    let raw = scalar_text(value)?;
    let stripped = strip_numeric_suffix(raw);
    let parsed: i64 = stripped.parse().ok()?;
    if (0..=100).contains(&parsed) {
        Some(parsed as u8)
    } else {
        debug!(raw, "commission out of 0..100 range, dropping");
        None
    }
}

/// `microcredits` is parsed as an unbounded non-negative integer (spec
/// §4.2).
pub fn parse_microcredits(value: &MappingValue) -> Option<BigDecimal> {
    let raw = scalar_text(value)?;
    let stripped = strip_numeric_suffix(raw);
    let parsed: BigDecimal = stripped.parse().ok()?;
    if parsed < BigDecimal::from(0) {
        return None;
    }
    Some(parsed)
}

/// Extracts a named field out of a `Record` mapping value, if present.
pub fn record_field<'a>(value: &'a MappingValue, field: &str) -> Option<&'a MappingValue> {
    match value {
        MappingValue::Record(map) => map.get(field),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_known_suffixes() {
        assert_eq!(strip_numeric_suffix("1234u64"), "1234");
        assert_eq!(strip_numeric_suffix("5u8"), "5");
        assert_eq!(strip_numeric_suffix("aleo1abc"), "aleo1abc");
    }

    #[test]
    fn is_open_truthy_variants() {
        assert!(parse_is_open(&MappingValue::Bool(true)));
        assert!(parse_is_open(&MappingValue::Text("true".into())));
        assert!(!parse_is_open(&MappingValue::Text("false".into())));
        assert!(!parse_is_open(&MappingValue::Null));
    }

    #[test]
    fn commission_out_of_range_is_dropped() {
        assert_eq!(parse_commission(&MappingValue::Text("101u8".into())), None);
        assert_eq!(parse_commission(&MappingValue::Text("5u8".into())), Some(5));
        assert_eq!(parse_commission(&MappingValue::Text("0u8".into())), Some(0));
        assert_eq!(parse_commission(&MappingValue::Text("100u8".into())), Some(100));
    }

    #[test]
    fn microcredits_parses_unbounded_integer() {
        let big = "340282366920938463463374607431768211456u128"; // > u128::MAX
        let parsed = parse_microcredits(&MappingValue::Text(big.into())).unwrap();
        assert_eq!(parsed.to_string(), "340282366920938463463374607431768211456");
    }

    #[test]
    fn microcredits_rejects_negative() {
        assert_eq!(parse_microcredits(&MappingValue::Text("-1".into())), None);
    }
}
