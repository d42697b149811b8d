use std::collections::HashMap;
use std::fmt;

use alloy_primitives::{Address, B256, Bytes, U256};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::parse_quantity;

/// Gas charged by a plain value transfer, used to estimate gas when the feed reports none.
pub const TRANSFER_GAS: u64 = 21_000;

/// Fields fixed for the whole block, sent with the first flashblock of a block.
#[derive(Clone, Debug, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct FlashblockBase {
    #[serde(default, deserialize_with = "lenient")]
    pub parent_hash: Option<B256>,
    #[serde(default, deserialize_with = "lenient")]
    pub fee_recipient: Option<Address>,
    #[serde(default, deserialize_with = "lenient_quantity")]
    pub block_number: Option<u64>,
    #[serde(default, deserialize_with = "lenient_quantity")]
    pub gas_limit: Option<u64>,
    #[serde(default, deserialize_with = "lenient_quantity")]
    pub timestamp: Option<u64>,
    #[serde(default, deserialize_with = "lenient")]
    pub base_fee_per_gas: Option<U256>,
}

/// A transaction as carried in a diff: normally an encoded envelope, but object-shaped
/// entries are kept as sent.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum FlashblockTransaction {
    Encoded(Bytes),
    Object(Map<String, Value>),
    Other(Value),
}

impl FlashblockTransaction {
    /// Gas declared by an object-shaped transaction.
    pub fn gas(&self) -> Option<u64> {
        match self {
            FlashblockTransaction::Object(fields) => fields.get("gas").and_then(quantity_of),
            _ => None,
        }
    }
}

/// The portion of the block produced by one flashblock.
#[derive(Clone, Debug, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct FlashblockDiff {
    /// Kept as sent; see [`FlashblockDiff::block_hash_b256`] for the typed view.
    #[serde(default, deserialize_with = "lenient")]
    pub block_hash: Option<String>,
    #[serde(default, deserialize_with = "lenient_quantity")]
    pub gas_used: Option<u64>,
    #[serde(default, deserialize_with = "lenient")]
    pub state_root: Option<B256>,
    #[serde(default, deserialize_with = "lenient")]
    pub receipts_root: Option<B256>,
    #[serde(default, deserialize_with = "lenient_or_default")]
    pub transactions: Vec<FlashblockTransaction>,
    #[serde(default, deserialize_with = "lenient_or_default")]
    pub withdrawals: Vec<Value>,
}

impl FlashblockDiff {
    pub fn block_hash_b256(&self) -> Option<B256> {
        self.block_hash.as_deref()?.parse().ok()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct FlashblockMetadata {
    /// Plain JSON number on the production feed, hex strings are accepted as well.
    #[serde(default, deserialize_with = "lenient_quantity")]
    pub block_number: Option<u64>,
    #[serde(default, deserialize_with = "lenient_or_default")]
    pub new_account_balances: HashMap<String, Value>,
    /// Receipts keyed by transaction hash.
    #[serde(default, deserialize_with = "lenient_or_default")]
    pub receipts: HashMap<String, Value>,
}

impl FlashblockMetadata {
    /// Balances whose address and amount both parse; other entries are skipped.
    pub fn balances(&self) -> HashMap<Address, U256> {
        self.new_account_balances
            .iter()
            .filter_map(|(address, balance)| {
                let address = address.parse().ok()?;
                let balance = serde_json::from_value(balance.clone()).ok()?;
                Some((address, balance))
            })
            .collect()
    }

    pub fn receipt(&self, tx_hash: &B256) -> Option<&Value> {
        self.receipts
            .iter()
            .find(|(hash, _)| hash.parse::<B256>().ok().as_ref() == Some(tx_hash))
            .map(|(_, receipt)| receipt)
    }
}

/// One flashblock as delivered by the feed.
///
/// Fields are taken as sent. A field in an unexpected shape reads as absent instead of
/// rejecting the payload, so only `index` is mandatory.
#[derive(Clone, Debug, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct FlashblockPayload {
    #[serde(default, deserialize_with = "lenient_or_default")]
    pub payload_id: String,
    pub index: u64,
    #[serde(
        default,
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub base: Option<FlashblockBase>,
    #[serde(default, deserialize_with = "lenient_or_default")]
    pub diff: FlashblockDiff,
    #[serde(default, deserialize_with = "lenient_or_default")]
    pub metadata: FlashblockMetadata,
}

fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|value| serde_json::from_value(value).ok()))
}

fn lenient_or_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    Ok(lenient(deserializer)?.unwrap_or_default())
}

fn lenient_quantity<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(quantity_of))
}

fn quantity_of(value: &Value) -> Option<u64> {
    match value {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => parse_quantity(text),
        _ => None,
    }
}

/// Identity of a flashblock: the same `(block_number, index, block_hash)` is the same flashblock.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FlashblockKey {
    pub block_number: Option<u64>,
    pub index: u64,
    pub block_hash: String,
}

impl fmt::Display for FlashblockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.block_number {
            Some(number) => write!(f, "{number}-{}-{}", self.index, self.block_hash),
            None => write!(f, "?-{}-{}", self.index, self.block_hash),
        }
    }
}

/// Gas used by a flashblock, either as reported or estimated from its transaction count.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "gas", rename_all = "lowercase")]
pub enum GasUsage {
    Reported(u64),
    Estimated(u64),
}

impl GasUsage {
    pub fn is_estimate(self) -> bool {
        matches!(self, GasUsage::Estimated(_))
    }
}

impl fmt::Display for GasUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GasUsage::Reported(gas) => write!(f, "{gas}"),
            GasUsage::Estimated(gas) => write!(f, "~{gas} (estimated)"),
        }
    }
}

impl FlashblockPayload {
    /// `None` when the diff carries no block hash; such payloads are not tracked.
    pub fn key(&self) -> Option<FlashblockKey> {
        let block_hash = self.diff.block_hash.as_deref().filter(|hash| !hash.is_empty())?;
        Some(FlashblockKey {
            block_number: self.metadata.block_number,
            index: self.index,
            block_hash: block_hash.to_string(),
        })
    }

    pub fn block_number(&self) -> Option<u64> {
        self.metadata.block_number
    }

    pub fn transaction_count(&self) -> usize {
        self.diff.transactions.len()
    }

    /// Reported gas, or an estimate when the feed reports zero for a non-empty flashblock:
    /// the declared gas of object-shaped transactions, 21000 for every other one.
    pub fn gas_usage(&self) -> GasUsage {
        let reported = self.diff.gas_used.unwrap_or(0);
        if reported == 0 && !self.diff.transactions.is_empty() {
            let estimate = self
                .diff
                .transactions
                .iter()
                .map(|tx| tx.gas().unwrap_or(TRANSFER_GAS))
                .fold(0u64, u64::saturating_add);
            GasUsage::Estimated(estimate)
        } else {
            GasUsage::Reported(reported)
        }
    }
}
