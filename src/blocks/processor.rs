use std::collections::VecDeque;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

use super::{BlockHeader, InvalidHeader, RawBlockHeader};
use crate::rpc::{self, Incoming, JsonRpcRequest};
use crate::{RecentBuffer, RollingLog};

#[derive(Clone, Debug)]
pub struct BlockFeedConfig {
    pub max_blocks: usize,
    /// Number of inter-block gaps averaged into the block time.
    pub block_time_samples: usize,
    pub error_log_size: usize,
    /// Delay between the socket opening and the first subscription request.
    pub subscribe_delay: Duration,
    /// Delay before the bare `newHeads` request when nothing acknowledged the first one.
    pub fallback_delay: Duration,
}

impl Default for BlockFeedConfig {
    fn default() -> Self {
        Self {
            max_blocks: 20,
            block_time_samples: 5,
            error_log_size: 5,
            subscribe_delay: Duration::from_millis(500),
            fallback_delay: Duration::from_secs(1),
        }
    }
}

/// What a single inbound message did to the feed.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockMessage {
    Inserted { number: u64, hash: String },
    Duplicate { number: u64, hash: String },
    Invalid(InvalidHeader),
    Subscribed(String),
    Heartbeat,
    RpcError(String),
    ParseError(String),
    Ignored(Value),
}

#[derive(Debug, Default)]
struct SubscriptionTracker {
    id: Option<String>,
    next_request_id: u64,
}

impl SubscriptionTracker {
    fn next_id(&mut self) -> u64 {
        self.next_request_id += 1;
        self.next_request_id
    }

    fn reset(&mut self) {
        // request ids keep increasing across sessions
        self.id = None;
    }
}

/// Synchronous state of the block feed: buffer, block time, error log and subscription.
///
/// Message handling never fails; every outcome is reported as a [`BlockMessage`].
#[derive(Debug)]
pub struct BlockFeed {
    config: BlockFeedConfig,
    blocks: RecentBuffer<BlockHeader>,
    last_block_at: Option<Instant>,
    block_times: VecDeque<Duration>,
    block_time_ms: Option<u64>,
    errors: RollingLog,
    subscription: SubscriptionTracker,
}

impl BlockFeed {
    pub fn new(config: BlockFeedConfig) -> Self {
        Self {
            blocks: RecentBuffer::new(config.max_blocks),
            last_block_at: None,
            block_times: VecDeque::with_capacity(config.block_time_samples),
            block_time_ms: None,
            errors: RollingLog::new(config.error_log_size),
            subscription: SubscriptionTracker::default(),
            config,
        }
    }

    pub fn config(&self) -> &BlockFeedConfig {
        &self.config
    }

    pub fn handle_text(&mut self, text: &str, now: Instant) -> BlockMessage {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                let detail = e.to_string();
                self.record_parse_error(&detail);
                return BlockMessage::ParseError(detail);
            }
        };

        match rpc::classify(value) {
            Incoming::Notification {
                subscription,
                result,
            } => {
                if self.subscription.id.is_none() {
                    self.subscription.id = subscription;
                }
                let header = serde_json::from_value::<RawBlockHeader>(result)
                    .map_err(|e| InvalidHeader::Malformed(e.to_string()))
                    .and_then(BlockHeader::try_from);
                match header {
                    Ok(header) => self.insert(header, now),
                    Err(e) => BlockMessage::Invalid(e),
                }
            }
            Incoming::Heartbeat => BlockMessage::Heartbeat,
            Incoming::Response { result, .. } => {
                let id = rpc::id_to_string(&result);
                self.subscription.id = Some(id.clone());
                BlockMessage::Subscribed(id)
            }
            Incoming::Error { message } => {
                let entry = format!("Error: {}", message.as_deref().unwrap_or("Unknown error"));
                self.errors.push(entry.clone());
                BlockMessage::RpcError(entry)
            }
            Incoming::Other(value) => BlockMessage::Ignored(value),
        }
    }

    /// Inserts a validated header unless one with the same hash is already buffered.
    pub fn insert(&mut self, header: BlockHeader, now: Instant) -> BlockMessage {
        if self.blocks.contains_by(|block| block.hash == header.hash) {
            return BlockMessage::Duplicate {
                number: header.number,
                hash: header.hash,
            };
        }

        self.record_block_time(now);

        let message = BlockMessage::Inserted {
            number: header.number,
            hash: header.hash.clone(),
        };
        self.blocks.push_front(header);
        message
    }

    fn record_block_time(&mut self, now: Instant) {
        if let Some(last) = self.last_block_at {
            if self.config.block_time_samples > 0 {
                if self.block_times.len() == self.config.block_time_samples {
                    self.block_times.pop_front();
                }
                self.block_times
                    .push_back(now.saturating_duration_since(last));

                let total_ms: f64 = self
                    .block_times
                    .iter()
                    .map(|gap| gap.as_nanos() as f64 / 1_000_000.0)
                    .sum();
                let mean = total_ms / self.block_times.len() as f64;
                self.block_time_ms = Some(mean.round() as u64);
            }
        }
        self.last_block_at = Some(now);
    }

    /// A new session started: the error log and the subscription start over.
    pub fn on_open(&mut self) {
        self.errors.clear();
        self.subscription.reset();
    }

    pub fn on_close(&mut self) {
        self.subscription.reset();
    }

    pub fn record_parse_error(&mut self, detail: &str) {
        self.errors.push(format!("Parse error: {detail}"));
    }

    pub fn on_transport_error(&mut self, detail: &str) {
        let detail = if detail.is_empty() {
            "Unknown error"
        } else {
            detail
        };
        self.errors.push(format!("WebSocket error: {detail}"));
    }

    /// The primary subscription request, asking for full transactions.
    pub fn begin_subscription(&mut self) -> JsonRpcRequest {
        let id = self.subscription.next_id();
        rpc::new_heads_subscription(id, true)
    }

    /// The bare `newHeads` request, only while no subscription was acknowledged.
    pub fn fallback_subscription(&mut self) -> Option<JsonRpcRequest> {
        if self.subscription.id.is_some() {
            return None;
        }
        let id = self.subscription.next_id();
        Some(rpc::new_heads_subscription(id, false))
    }

    /// Empties the buffer and the block time history and forgets the subscription.
    pub fn reset(&mut self) {
        self.blocks.clear();
        self.block_times.clear();
        self.block_time_ms = None;
        self.last_block_at = None;
        self.subscription.reset();
    }

    pub fn blocks(&self) -> Vec<BlockHeader> {
        self.blocks.to_vec()
    }

    pub fn latest(&self) -> Option<&BlockHeader> {
        self.blocks.newest()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn block_time_ms(&self) -> Option<u64> {
        self.block_time_ms
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.entries()
    }

    pub fn subscription_id(&self) -> Option<&str> {
        self.subscription.id.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn notification(hash: &str, number: u64) -> String {
        json!({
            "jsonrpc": "2.0",
            "method": "eth_subscription",
            "params": {
                "subscription": "0x1",
                "result": {
                    "hash": hash,
                    "number": format!("{number:#x}"),
                    "timestamp": "0x64000000"
                }
            }
        })
        .to_string()
    }

    #[test]
    fn test_sample_notification() {
        let mut feed = BlockFeed::new(BlockFeedConfig::default());
        let message = r#"{"method":"eth_subscription","params":{"subscription":"0x1","result":{"hash":"0xabc","number":"0x5","timestamp":"0x64000000"}}}"#;

        let outcome = feed.handle_text(message, Instant::now());
        assert_eq!(
            outcome,
            BlockMessage::Inserted {
                number: 5,
                hash: "0xabc".to_string()
            }
        );

        let blocks = feed.blocks();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].number, 5);
        assert_eq!(blocks[0].gas_used, 0);
        assert_eq!(blocks[0].gas_limit, 1);
        assert_eq!(feed.subscription_id(), Some("0x1"));
    }

    #[test]
    fn test_duplicate_hash_is_dropped() {
        let mut feed = BlockFeed::new(BlockFeedConfig::default());
        let now = Instant::now();

        feed.handle_text(&notification("0xaa", 1), now);
        let before = feed.blocks();

        let outcome = feed.handle_text(&notification("0xaa", 1), now + Duration::from_secs(2));
        assert!(matches!(outcome, BlockMessage::Duplicate { number: 1, .. }));
        assert_eq!(feed.blocks(), before);
        // a re-delivery does not count as a block interval
        assert_eq!(feed.block_time_ms(), None);
    }

    #[test]
    fn test_capacity_keeps_newest_first() {
        let mut feed = BlockFeed::new(BlockFeedConfig::default());
        let now = Instant::now();

        for number in 1..=25u64 {
            feed.handle_text(&notification(&format!("0x{number:02x}"), number), now);
        }

        let numbers: Vec<u64> = feed.blocks().iter().map(|block| block.number).collect();
        assert_eq!(numbers, (6..=25).rev().collect::<Vec<_>>());
    }

    #[test]
    fn test_invalid_headers_are_not_inserted() {
        let mut feed = BlockFeed::new(BlockFeedConfig::default());
        let now = Instant::now();

        let no_hash = json!({
            "method": "eth_subscription",
            "params": {"subscription": "0x1", "result": {"number": "0x1"}}
        });
        assert_eq!(
            feed.handle_text(&no_hash.to_string(), now),
            BlockMessage::Invalid(InvalidHeader::MissingHash)
        );

        let bad_number = json!({
            "method": "eth_subscription",
            "params": {"subscription": "0x1", "result": {"hash": "0xaa", "number": "0xzz"}}
        });
        assert!(matches!(
            feed.handle_text(&bad_number.to_string(), now),
            BlockMessage::Invalid(InvalidHeader::Malformed(_))
        ));
        assert!(feed.is_empty());
    }

    #[test]
    fn test_block_time_average() {
        let mut feed = BlockFeed::new(BlockFeedConfig::default());
        let start = Instant::now();

        feed.handle_text(&notification("0x01", 1), start);
        assert_eq!(feed.block_time_ms(), None);

        feed.handle_text(&notification("0x02", 2), start + Duration::from_millis(2000));
        feed.handle_text(&notification("0x03", 3), start + Duration::from_millis(3001));
        // gaps of 2000ms and 1001ms
        assert_eq!(feed.block_time_ms(), Some(1501));

        for i in 4..=10u64 {
            let at = start + Duration::from_millis(3001 + (i - 3) * 200);
            feed.handle_text(&notification(&format!("0x{i:02x}"), i), at);
        }
        // only the last five gaps count
        assert_eq!(feed.block_time_ms(), Some(200));
    }

    #[test]
    fn test_subscription_confirmation_and_fallback() {
        let mut feed = BlockFeed::new(BlockFeedConfig::default());
        feed.on_open();

        let first = feed.begin_subscription();
        assert_eq!(first.params.len(), 2);
        let fallback = feed.fallback_subscription().unwrap();
        assert_eq!(fallback.params, vec![json!("newHeads")]);
        assert!(fallback.id.as_u64() > first.id.as_u64());

        let ack = json!({"jsonrpc": "2.0", "id": 1, "result": "0xsub"}).to_string();
        assert_eq!(
            feed.handle_text(&ack, Instant::now()),
            BlockMessage::Subscribed("0xsub".to_string())
        );
        assert_eq!(feed.subscription_id(), Some("0xsub"));
        assert!(feed.fallback_subscription().is_none());

        feed.on_close();
        assert_eq!(feed.subscription_id(), None);
    }

    #[test]
    fn test_error_log() {
        let mut feed = BlockFeed::new(BlockFeedConfig::default());
        let now = Instant::now();

        let error = json!({"jsonrpc": "2.0", "id": 1, "error": {"code": -32000, "message": "rate limited"}});
        feed.handle_text(&error.to_string(), now);
        feed.handle_text(&json!({"error": {"code": 1}}).to_string(), now);
        feed.handle_text("{not json", now);
        feed.on_transport_error("connection reset");

        let errors = feed.errors();
        assert_eq!(errors.len(), 4);
        assert_eq!(errors[0], "Error: rate limited");
        assert_eq!(errors[1], "Error: Unknown error");
        assert!(errors[2].starts_with("Parse error: "));
        assert_eq!(errors[3], "WebSocket error: connection reset");

        for i in 0..10 {
            feed.on_transport_error(&format!("e{i}"));
        }
        assert_eq!(feed.errors().len(), 5);
        assert_eq!(feed.errors()[4], "WebSocket error: e9");

        feed.on_open();
        assert!(feed.errors().is_empty());
    }

    #[test]
    fn test_heartbeat_reply_is_not_an_error() {
        let mut feed = BlockFeed::new(BlockFeedConfig::default());
        let reply = json!({"jsonrpc": "2.0", "id": "heartbeat", "error": {"message": "method not found"}});

        assert_eq!(
            feed.handle_text(&reply.to_string(), Instant::now()),
            BlockMessage::Heartbeat
        );
        assert!(feed.errors().is_empty());
        assert_eq!(feed.subscription_id(), None);
    }

    #[test]
    fn test_reset() {
        let mut feed = BlockFeed::new(BlockFeedConfig::default());
        let start = Instant::now();
        feed.handle_text(&notification("0x01", 1), start);
        feed.handle_text(&notification("0x02", 2), start + Duration::from_secs(2));
        assert!(feed.block_time_ms().is_some());

        feed.reset();
        assert!(feed.is_empty());
        assert_eq!(feed.block_time_ms(), None);
        assert_eq!(feed.subscription_id(), None);

        // after a reset the same block is accepted again
        assert!(matches!(
            feed.handle_text(&notification("0x01", 1), start + Duration::from_secs(4)),
            BlockMessage::Inserted { .. }
        ));
        assert_eq!(feed.block_time_ms(), None);
    }
}
