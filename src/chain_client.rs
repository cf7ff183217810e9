// External contract for the chain SDK collaborator (spec §4.1, §6).
//
// The chain-SDK transport itself is out of scope (spec §1): this module only
// defines the contract the rest of the pipeline depends on, plus one
// concrete REST+JSON implementation against `CHAIN_SDK_URL`. Grounded on the
// shape of the teacher's old `node/rpc-client` (a thin typed wrapper over an
// HTTP transport) generalized from JSON-RPC framing to the plain REST+JSON
// shape spec §6 describes for this chain.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ObservatoryError, Result};

/// A mapping value as returned by `mapping_value`. The provider's return
/// shape is heterogeneous (spec §4.1): a native scalar, a JSON-like
/// structure, or a stringified record with typed numeric suffixes. Parsing
/// happens once here so downstream code (the Mapping Cache, the Decoder)
/// works against one tagged representation.
#[derive(Debug, Clone, PartialEq)]
pub enum MappingValue {
    Scalar(String),
    Bool(bool),
    Text(String),
    Record(HashMap<String, MappingValue>),
    Null,
}

impl From<Value> for MappingValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => MappingValue::Null,
            Value::Bool(b) => MappingValue::Bool(b),
            Value::Number(n) => MappingValue::Scalar(n.to_string()),
            Value::String(s) => MappingValue::Text(s),
            Value::Object(map) => MappingValue::Record(
                map.into_iter()
                    .map(|(k, v)| (k, MappingValue::from(v)))
                    .collect(),
            ),
            // Arrays do not occur in practice for these mappings; treat
            // conservatively as an unparseable record rather than panic.
            Value::Array(_) => MappingValue::Null,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BlockMetadata {
    pub height: u64,
    pub round: u64,
    pub timestamp: i64,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BlockHeader {
    pub metadata: BlockMetadata,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Ratification {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub amount: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BatchHeader {
    pub batch_id: String,
    pub author: String,
    pub timestamp: i64,
    #[serde(default)]
    pub committee_id: Option<String>,
    pub signature: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SubdagBatch {
    pub batch_header: BatchHeader,
    #[serde(default)]
    pub signatures: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Subdag {
    pub subdag: HashMap<String, Vec<SubdagBatch>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Authority {
    pub subdag: Subdag,
}

/// Raw wire shape of a block (spec §6 "Inbound wire shape of a block").
/// Fields outside this set are ignored by serde's default behavior.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawBlock {
    pub block_hash: String,
    pub previous_hash: String,
    pub header: BlockHeader,
    #[serde(default)]
    pub ratifications: Vec<Ratification>,
    pub authority: Authority,
    #[serde(default)]
    pub transactions_count: u32,
}

/// The chain SDK contract consumed by the core (spec §4.1). Implementations
/// must be safe to call concurrently from the bounded worker pool in
/// `range_fetcher`.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn latest_height(&self) -> Result<u64>;

    /// Inclusive range. The provider may cap the returned length below
    /// `end - start + 1`; callers must not assume the full range comes back.
    async fn block_range(&self, start: u64, end: u64) -> Result<Vec<RawBlock>>;

    async fn mapping_value(&self, program: &str, mapping: &str, key: &str) -> Result<MappingValue>;
}

/// REST+JSON implementation against a chain SDK REST endpoint.
pub struct HttpChainClient {
    http: reqwest::Client,
    base_url: url::Url,
}

impl HttpChainClient {
    pub fn new(base_url: url::Url) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
        }
    }

    fn url(&self, path: &str) -> url::Url {
        self.base_url
            .join(path)
            .unwrap_or_else(|_| self.base_url.clone())
    }
}

#[async_trait]
impl ChainClient for HttpChainClient {
    async fn latest_height(&self) -> Result<u64> {
        let response = self.http.get(self.url("latest/height")).send().await?;
        let response = check_status(response).await?;
        let height: u64 = response.json().await?;
        Ok(height)
    }

    async fn block_range(&self, start: u64, end: u64) -> Result<Vec<RawBlock>> {
        let response = self
            .http
            .get(self.url(&format!("blocks?start={start}&end={end}")))
            .send()
            .await?;
        let response = check_status(response).await?;
        let blocks: Vec<RawBlock> = response.json().await?;
        Ok(blocks)
    }

    async fn mapping_value(&self, program: &str, mapping: &str, key: &str) -> Result<MappingValue> {
        let response = self
            .http
            .get(self.url(&format!("program/{program}/mapping/{mapping}/{key}")))
            .send()
            .await?;
        let response = check_status(response).await?;
        let value: Value = response.json().await?;
        Ok(MappingValue::from(value))
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    if response.status().as_u16() == 429 {
        return Err(ObservatoryError::RateLimited { retry_after: None });
    }
    if response.status().is_server_error() {
        return Err(ObservatoryError::transient(format!(
            "chain client returned {}",
            response.status()
        )));
    }
    if !response.status().is_success() {
        return Err(ObservatoryError::transient(format!(
            "chain client returned {}",
            response.status()
        )));
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_value_from_json_scalar() {
        let v: MappingValue = serde_json::json!("1234u64").into();
        assert_eq!(v, MappingValue::Text("1234u64".to_string()));
    }

    #[test]
    fn mapping_value_from_json_bool() {
        let v: MappingValue = serde_json::json!(true).into();
        assert_eq!(v, MappingValue::Bool(true));
    }

    #[test]
    fn mapping_value_from_json_record() {
        let v: MappingValue = serde_json::json!({"microcredits": "1000u64"}).into();
        match v {
            MappingValue::Record(map) => {
                assert_eq!(
                    map.get("microcredits"),
                    Some(&MappingValue::Text("1000u64".to_string()))
                );
            }
            _ => panic!("expected record"),
        }
    }
}
