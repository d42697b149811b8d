use std::sync::Arc;

use super::{FlashblockKey, FlashblockPayload, decode_frame};
use crate::connection::Frame;
use crate::{RecentBuffer, SeenSet, TransactionCountSink};

#[derive(Clone, Debug)]
pub struct FlashblockFeedConfig {
    pub max_blocks: usize,
    /// How many flashblock identities are remembered for deduplication.
    pub seen_capacity: usize,
}

impl Default for FlashblockFeedConfig {
    fn default() -> Self {
        Self {
            max_blocks: 20,
            seen_capacity: 4096,
        }
    }
}

/// What a single frame did to the feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlashblockMessage {
    Inserted {
        key: FlashblockKey,
        transactions: usize,
        /// Running total reported by the sink, `None` when the payload has no block number.
        block_total: Option<u64>,
    },
    Duplicate(FlashblockKey),
    MissingBlockHash {
        index: u64,
    },
    DecodeError(String),
}

/// Synchronous state of the flashblock feed.
///
/// Each distinct flashblock is buffered once and its transaction count is handed to the sink
/// exactly once.
pub struct FlashblockFeed {
    blocks: RecentBuffer<FlashblockPayload>,
    seen: SeenSet<FlashblockKey>,
    sink: Arc<dyn TransactionCountSink>,
}

impl FlashblockFeed {
    pub fn new(config: FlashblockFeedConfig, sink: Arc<dyn TransactionCountSink>) -> Self {
        Self {
            blocks: RecentBuffer::new(config.max_blocks),
            seen: SeenSet::new(config.seen_capacity),
            sink,
        }
    }

    pub fn handle_frame(&mut self, frame: Frame) -> FlashblockMessage {
        match decode_frame(frame) {
            Ok(payload) => self.insert(payload),
            Err(e) => FlashblockMessage::DecodeError(e.to_string()),
        }
    }

    pub fn insert(&mut self, payload: FlashblockPayload) -> FlashblockMessage {
        let Some(key) = payload.key() else {
            return FlashblockMessage::MissingBlockHash {
                index: payload.index,
            };
        };

        if !self.seen.insert(key.clone()) {
            return FlashblockMessage::Duplicate(key);
        }

        let transactions = payload.transaction_count();
        let block_total = payload
            .block_number()
            .map(|number| self.sink.add(number, transactions as u64));

        self.blocks.push_front(payload);
        FlashblockMessage::Inserted {
            key,
            transactions,
            block_total,
        }
    }

    /// Forgets buffered flashblocks and their identities. Counts already handed to the sink
    /// are kept.
    pub fn clear(&mut self) {
        self.blocks.clear();
        self.seen.clear();
    }

    pub fn blocks(&self) -> Vec<FlashblockPayload> {
        self.blocks.to_vec()
    }

    pub fn latest(&self) -> Option<&FlashblockPayload> {
        self.blocks.newest()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn seen(&self) -> usize {
        self.seen.len()
    }
}
