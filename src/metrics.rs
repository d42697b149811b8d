use std::net::SocketAddr;

use metrics::{Counter, Gauge, Histogram};
use metrics_derive::Metrics;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

use crate::Error;

#[derive(Metrics, Clone)]
#[metrics(scope = "flashblocks_monitor.connection")]
pub struct ConnectionMetrics {
    #[metric(describe = "Number of connection attempts")]
    pub connection_attempts: Counter,

    #[metric(describe = "Number of successful connections")]
    pub connection_successes: Counter,

    #[metric(describe = "Number of failed connection attempts")]
    pub connection_failures: Counter,

    /// 1 while the socket is open, 0 otherwise
    #[metric(describe = "Current connection status")]
    pub connection_open: Gauge,

    #[metric(describe = "Number of reconnects scheduled after a disconnect")]
    pub reconnects_scheduled: Counter,

    #[metric(describe = "Delay in seconds before a scheduled reconnect")]
    pub reconnect_delay: Histogram,

    #[metric(describe = "Number of times the reconnect budget ran out")]
    pub reconnects_exhausted: Counter,

    #[metric(describe = "Number of connections dropped for a missing heartbeat response")]
    pub heartbeat_timeouts: Counter,

    #[metric(describe = "Frames received from the upstream")]
    pub messages_received: Counter,

    #[metric(describe = "Total bytes received from the upstream")]
    pub bytes_received: Counter,

    #[metric(describe = "Frames sent to the upstream")]
    pub messages_sent: Counter,
}

#[derive(Metrics, Clone)]
#[metrics(scope = "flashblocks_monitor.blocks")]
pub struct BlockFeedMetrics {
    #[metric(describe = "Block headers inserted into the buffer")]
    pub blocks_inserted: Counter,

    #[metric(describe = "Block headers dropped as re-deliveries")]
    pub duplicate_blocks: Counter,

    #[metric(describe = "Block headers dropped for missing hash or number")]
    pub invalid_blocks: Counter,

    #[metric(describe = "JSON-RPC error responses received")]
    pub rpc_errors: Counter,

    #[metric(describe = "Messages that could not be parsed")]
    pub parse_errors: Counter,

    #[metric(describe = "Subscription requests sent")]
    pub subscription_requests: Counter,

    #[metric(describe = "Rolling average block time in milliseconds")]
    pub block_time_ms: Gauge,
}

#[derive(Metrics, Clone)]
#[metrics(scope = "flashblocks_monitor.flashblocks")]
pub struct FlashblockFeedMetrics {
    #[metric(describe = "Flashblocks inserted into the buffer")]
    pub flashblocks_inserted: Counter,

    #[metric(describe = "Flashblocks dropped as already processed")]
    pub duplicate_flashblocks: Counter,

    #[metric(describe = "Flashblocks dropped for a missing block hash")]
    pub missing_block_hash: Counter,

    #[metric(describe = "Frames that could not be decoded")]
    pub decode_errors: Counter,

    #[metric(describe = "Transactions forwarded to the transaction count index")]
    pub transactions_forwarded: Counter,

    #[metric(describe = "Transactions per flashblock")]
    pub transactions_per_flashblock: Histogram,
}

#[derive(Metrics, Clone)]
#[metrics(scope = "flashblocks_monitor.tx_counts")]
pub struct TransactionCountMetrics {
    #[metric(describe = "Block numbers tracked by the transaction count index")]
    pub tracked_blocks: Gauge,

    #[metric(describe = "Failed writes of the transaction count file")]
    pub persist_failures: Counter,

    #[metric(describe = "Block numbers evicted to respect the entry limit")]
    pub evicted_blocks: Counter,
}

/// Installs the global Prometheus recorder and serves `/metrics` on `addr`.
pub(crate) fn init_metrics(addr: SocketAddr) -> Result<(), Error> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| Error::InitMetrics(e.to_string()))?;
    info!(message = "metrics server running", addr = %addr);
    Ok(())
}
