use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::deserialize_quantity_opt;

/// Block header exactly as the node sends it. Every field is optional so a partial header
/// still parses and can be rejected with a precise reason.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawBlockHeader {
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default, deserialize_with = "deserialize_quantity_opt")]
    pub number: Option<u64>,
    #[serde(default)]
    pub parent_hash: Option<String>,
    #[serde(default, deserialize_with = "deserialize_quantity_opt")]
    pub timestamp: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_quantity_opt")]
    pub gas_used: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_quantity_opt")]
    pub gas_limit: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_quantity_opt")]
    pub base_fee_per_gas: Option<u64>,
    #[serde(default)]
    pub miner: Option<String>,
    #[serde(default)]
    pub transactions: Option<Vec<Value>>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidHeader {
    #[error("block header has no hash")]
    MissingHash,
    #[error("block header has no number")]
    MissingNumber,
    #[error("malformed block header: {0}")]
    Malformed(String),
}

/// A validated block header as kept in the block buffer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockHeader {
    pub hash: String,
    pub number: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_hash: Option<String>,
    pub timestamp: u64,
    pub gas_used: u64,
    pub gas_limit: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_fee_per_gas: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub miner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transactions: Option<Vec<Value>>,
}

impl BlockHeader {
    /// Number of transactions carried by the header, when the node included them.
    pub fn transaction_count(&self) -> Option<usize> {
        self.transactions.as_ref().map(Vec::len)
    }

    /// Gas used as a percentage of the gas limit.
    pub fn gas_utilization(&self) -> f64 {
        if self.gas_limit == 0 {
            return 0.0;
        }
        self.gas_used as f64 / self.gas_limit as f64 * 100.0
    }
}

impl TryFrom<RawBlockHeader> for BlockHeader {
    type Error = InvalidHeader;

    fn try_from(raw: RawBlockHeader) -> Result<Self, Self::Error> {
        let hash = raw
            .hash
            .filter(|hash| !hash.is_empty())
            .ok_or(InvalidHeader::MissingHash)?;
        let number = raw.number.ok_or(InvalidHeader::MissingNumber)?;

        Ok(Self {
            hash,
            number,
            parent_hash: raw.parent_hash,
            timestamp: raw.timestamp.unwrap_or_default(),
            gas_used: raw.gas_used.unwrap_or(0),
            gas_limit: raw.gas_limit.unwrap_or(1),
            base_fee_per_gas: raw.base_fee_per_gas,
            miner: raw.miner,
            transactions: raw.transactions,
        })
    }
}
