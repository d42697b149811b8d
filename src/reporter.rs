use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::TransactionCountIndex;
use crate::blocks::{BlockHeader, BlockStream};
use crate::flashblocks::{FlashblockPayload, FlashblockStream, GasUsage};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CountSource {
    /// Counted from the transactions carried by the header.
    Header,
    /// Accumulated from the flashblocks of the block.
    Flashblocks,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockReport {
    pub number: u64,
    pub hash: String,
    pub timestamp: u64,
    pub transactions: Option<u64>,
    pub transactions_source: Option<CountSource>,
    pub gas_used: u64,
    pub gas_limit: u64,
    pub gas_utilization: f64,
}

impl BlockReport {
    /// Builds the report, taking the transaction count from the flashblock index when the
    /// header does not carry transactions.
    pub fn new(header: &BlockHeader, tx_counts: &TransactionCountIndex) -> Self {
        let (transactions, transactions_source) = match header.transaction_count() {
            Some(count) => (Some(count as u64), Some(CountSource::Header)),
            None => match tx_counts.get(header.number) {
                Some(count) => (Some(count), Some(CountSource::Flashblocks)),
                None => (None, None),
            },
        };

        Self {
            number: header.number,
            hash: header.hash.clone(),
            timestamp: header.timestamp,
            transactions,
            transactions_source,
            gas_used: header.gas_used,
            gas_limit: header.gas_limit,
            gas_utilization: header.gas_utilization(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlashblockReport {
    pub block_number: Option<u64>,
    pub index: u64,
    pub block_hash: Option<String>,
    pub transactions: usize,
    pub gas: GasUsage,
}

impl From<&FlashblockPayload> for FlashblockReport {
    fn from(payload: &FlashblockPayload) -> Self {
        Self {
            block_number: payload.block_number(),
            index: payload.index,
            block_hash: payload.diff.block_hash.clone(),
            transactions: payload.transaction_count(),
            gas: payload.gas_usage(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedStatus {
    pub status: &'static str,
    pub is_stable: bool,
    pub buffered: usize,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub blocks: FeedStatus,
    pub block_time_ms: Option<u64>,
    pub connection_errors: Vec<String>,
    pub flashblocks: FeedStatus,
    pub latest_flashblock: Option<FlashblockReport>,
    pub tracked_blocks: usize,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Line<'a> {
    Block(&'a BlockReport),
    Status(&'a StatusReport),
}

/// Periodically reports new blocks and the state of both feeds, either as log events or as
/// JSON lines on stdout.
pub struct Reporter {
    blocks: BlockStream,
    flashblocks: FlashblockStream,
    tx_counts: Arc<TransactionCountIndex>,
    interval: Duration,
    json: bool,
    last_reported: Option<u64>,
}

impl Reporter {
    pub fn new(
        blocks: BlockStream,
        flashblocks: FlashblockStream,
        tx_counts: Arc<TransactionCountIndex>,
        interval: Duration,
        json: bool,
    ) -> Self {
        Self {
            blocks,
            flashblocks,
            tx_counts,
            interval,
            json,
            last_reported: None,
        }
    }

    pub async fn run(mut self, token: CancellationToken) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => self.report(),
            }
        }
    }

    fn report(&mut self) {
        let blocks = self.blocks.snapshot();
        let flashblocks = self.flashblocks.snapshot();

        let fresh = unreported(&blocks.blocks, self.last_reported);
        for header in &fresh {
            let report = BlockReport::new(header, &self.tx_counts);
            self.emit_block(&report);
            self.last_reported = Some(report.number);
        }

        let status = StatusReport {
            blocks: FeedStatus {
                status: blocks.connection_status,
                is_stable: blocks.is_stable,
                buffered: blocks.blocks.len(),
            },
            block_time_ms: blocks.block_time_ms,
            connection_errors: blocks.connection_errors,
            flashblocks: FeedStatus {
                status: flashblocks.connection_status,
                is_stable: flashblocks.is_stable,
                buffered: flashblocks.blocks.len(),
            },
            latest_flashblock: flashblocks.blocks.first().map(FlashblockReport::from),
            tracked_blocks: self.tx_counts.len(),
        };
        self.emit_status(&status);
    }

    fn emit_block(&self, report: &BlockReport) {
        if self.json {
            print_line(&Line::Block(report));
            return;
        }
        info!(
            message = "block",
            number = report.number,
            hash = report.hash.as_str(),
            transactions = ?report.transactions,
            source = ?report.transactions_source,
            gas_used = report.gas_used,
            gas_utilization = report.gas_utilization
        );
    }

    fn emit_status(&self, status: &StatusReport) {
        if self.json {
            print_line(&Line::Status(status));
            return;
        }
        info!(
            message = "status",
            blocks = status.blocks.status,
            blocks_stable = status.blocks.is_stable,
            block_time_ms = ?status.block_time_ms,
            flashblocks = status.flashblocks.status,
            flashblocks_stable = status.flashblocks.is_stable,
            latest_flashblock = ?status
                .latest_flashblock
                .as_ref()
                .map(|fb| (fb.block_number, fb.index)),
            latest_flashblock_gas = ?status
                .latest_flashblock
                .as_ref()
                .map(|fb| fb.gas.to_string()),
            tracked_blocks = status.tracked_blocks
        );
        for error in &status.connection_errors {
            warn!(message = "recent block feed error", error = error.as_str());
        }
    }
}

/// Headers newer than `last_reported`, oldest first. The newest header is reported when
/// nothing has been reported yet.
fn unreported(blocks: &[BlockHeader], last_reported: Option<u64>) -> Vec<BlockHeader> {
    match last_reported {
        None => blocks.first().cloned().into_iter().collect(),
        Some(last) => {
            let mut fresh: Vec<BlockHeader> = blocks
                .iter()
                .filter(|block| block.number > last)
                .cloned()
                .collect();
            fresh.reverse();
            fresh
        }
    }
}

fn print_line(line: &Line<'_>) {
    match serde_json::to_string(line) {
        Ok(json) => println!("{json}"),
        Err(e) => warn!(message = "failed to encode report", error = %e),
    }
}
