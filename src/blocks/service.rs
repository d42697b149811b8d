use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use super::{BlockFeed, BlockFeedConfig, BlockHeader, BlockMessage};
use crate::connection::{
    ConnectionConfig, ConnectionEvent, ConnectionHandle, ConnectionManager, Frame,
};
use crate::rpc::JsonRpcRequest;
use crate::{BlockFeedMetrics, DEFAULT_RECONNECT_COOLDOWN, ReconnectError, ReconnectGate};

const FEED: &str = "blocks";

#[derive(Clone, Debug)]
pub struct BlockStreamConfig {
    pub connection: ConnectionConfig,
    pub feed: BlockFeedConfig,
    pub reconnect_cooldown: Duration,
}

impl BlockStreamConfig {
    pub fn new(connection: ConnectionConfig) -> Self {
        Self {
            connection,
            feed: BlockFeedConfig::default(),
            reconnect_cooldown: DEFAULT_RECONNECT_COOLDOWN,
        }
    }
}

/// Point-in-time view of the block feed.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockStreamSnapshot {
    pub blocks: Vec<BlockHeader>,
    pub is_connected: bool,
    pub connection_status: &'static str,
    pub block_time_ms: Option<u64>,
    pub is_stable: bool,
    pub connection_errors: Vec<String>,
    pub subscription_id: Option<String>,
}

/// Live `newHeads` feed. Cheap to clone; every clone observes the same state.
#[derive(Clone, Debug)]
pub struct BlockStream {
    feed: Arc<RwLock<BlockFeed>>,
    connection: ConnectionHandle,
    gate: Arc<ReconnectGate>,
}

impl BlockStream {
    pub fn spawn(config: BlockStreamConfig, token: CancellationToken) -> (Self, JoinHandle<()>) {
        let feed = Arc::new(RwLock::new(BlockFeed::new(config.feed.clone())));
        let (connection, events, manager) =
            ConnectionManager::spawn(FEED, config.connection, token.clone());

        let task = BlockStreamTask {
            feed: feed.clone(),
            connection: connection.clone(),
            metrics: BlockFeedMetrics::new_with_labels(&[("feed", FEED)]),
            subscribe_delay: config.feed.subscribe_delay,
            fallback_delay: config.feed.fallback_delay,
        };
        let handle = tokio::spawn(async move {
            task.run(events, token).await;
            if let Err(e) = manager.await {
                warn!(message = "connection manager task failed", feed = FEED, error = %e);
            }
        });

        let stream = Self {
            feed,
            connection,
            gate: Arc::new(ReconnectGate::new(config.reconnect_cooldown)),
        };
        (stream, handle)
    }

    pub fn snapshot(&self) -> BlockStreamSnapshot {
        let connection = self.connection.snapshot();
        let feed = self.feed.read();
        BlockStreamSnapshot {
            blocks: feed.blocks(),
            is_connected: connection.is_connected(),
            connection_status: connection.status_label(),
            block_time_ms: feed.block_time_ms(),
            is_stable: connection.is_stable,
            connection_errors: feed.errors(),
            subscription_id: feed.subscription_id().map(str::to_string),
        }
    }

    pub fn latest(&self) -> Option<BlockHeader> {
        self.feed.read().latest().cloned()
    }

    /// Drops buffered blocks and subscription tracking, then reconnects. Accepted at most once
    /// per cooldown window.
    pub fn reconnect(&self) -> Result<(), ReconnectError> {
        self.gate.try_acquire(Instant::now())?;
        info!(message = "manual reconnect", feed = FEED);
        self.feed.write().reset();
        self.connection.reconnect()?;
        Ok(())
    }

    pub fn clear(&self) {
        self.feed.write().reset();
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }
}

struct BlockStreamTask {
    feed: Arc<RwLock<BlockFeed>>,
    connection: ConnectionHandle,
    metrics: BlockFeedMetrics,
    subscribe_delay: Duration,
    fallback_delay: Duration,
}

impl BlockStreamTask {
    async fn run(self, mut events: mpsc::Receiver<ConnectionEvent>, token: CancellationToken) {
        let subscribe = sleep(Duration::ZERO);
        tokio::pin!(subscribe);
        let mut subscribe_pending = false;

        let fallback = sleep(Duration::ZERO);
        tokio::pin!(fallback);
        let mut fallback_pending = false;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                event = events.recv() => match event {
                    Some(ConnectionEvent::Opened) => {
                        info!(message = "websocket opened, subscribing to newHeads", feed = FEED);
                        self.feed.write().on_open();
                        subscribe.as_mut().reset(Instant::now() + self.subscribe_delay);
                        subscribe_pending = true;
                        fallback_pending = false;
                    }
                    Some(ConnectionEvent::Message(Frame::Text(text))) => self.on_text(&text),
                    Some(ConnectionEvent::Message(Frame::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => self.on_text(&text),
                        Err(e) => {
                            warn!(message = "binary frame is not valid UTF-8", feed = FEED, error = %e);
                            self.metrics.parse_errors.increment(1);
                            self.feed.write().record_parse_error(&e.to_string());
                        }
                    },
                    Some(ConnectionEvent::Closed(close)) => {
                        info!(
                            message = "websocket closed",
                            feed = FEED,
                            code = ?close.code,
                            reason = close.reason.as_str(),
                            clean = close.clean
                        );
                        self.feed.write().on_close();
                        subscribe_pending = false;
                        fallback_pending = false;
                    }
                    Some(ConnectionEvent::Error(detail)) => {
                        self.feed.write().on_transport_error(&detail);
                    }
                    None => break,
                },
                _ = &mut subscribe, if subscribe_pending => {
                    subscribe_pending = false;
                    let request = self.feed.write().begin_subscription();
                    info!(message = "subscribing to newHeads", feed = FEED, id = %request.id);
                    self.send(&request);
                    fallback.as_mut().reset(Instant::now() + self.fallback_delay);
                    fallback_pending = true;
                }
                _ = &mut fallback, if fallback_pending => {
                    fallback_pending = false;
                    let request = self.feed.write().fallback_subscription();
                    if let Some(request) = request {
                        info!(message = "trying standard subscription format", feed = FEED, id = %request.id);
                        self.send(&request);
                    }
                }
            }
        }

        debug!(message = "block stream stopped", feed = FEED);
    }

    #[instrument(level = "debug", skip_all, fields(feed = FEED, size = text.len()))]
    fn on_text(&self, text: &str) {
        let outcome = self.feed.write().handle_text(text, Instant::now());

        match outcome {
            BlockMessage::Inserted { number, hash } => {
                self.metrics.blocks_inserted.increment(1);
                if let Some(block_time_ms) = self.feed.read().block_time_ms() {
                    self.metrics.block_time_ms.set(block_time_ms as f64);
                }
                debug!(
                    message = "new block",
                    feed = FEED,
                    number,
                    hash = hash.as_str()
                );
            }
            BlockMessage::Duplicate { number, hash } => {
                self.metrics.duplicate_blocks.increment(1);
                debug!(
                    message = "block already buffered, skipping",
                    feed = FEED,
                    number,
                    hash = hash.as_str()
                );
            }
            BlockMessage::Invalid(reason) => {
                self.metrics.invalid_blocks.increment(1);
                warn!(message = "received invalid block header", feed = FEED, reason = %reason);
            }
            BlockMessage::Subscribed(id) => {
                info!(
                    message = "subscription confirmed",
                    feed = FEED,
                    subscription_id = id.as_str()
                );
            }
            BlockMessage::Heartbeat => {
                trace!(message = "heartbeat reply", feed = FEED);
            }
            BlockMessage::RpcError(entry) => {
                self.metrics.rpc_errors.increment(1);
                warn!(message = "json-rpc error response", feed = FEED, error = entry.as_str());
            }
            BlockMessage::ParseError(detail) => {
                self.metrics.parse_errors.increment(1);
                warn!(message = "failed to parse message", feed = FEED, error = detail.as_str());
            }
            BlockMessage::Ignored(value) => {
                debug!(message = "other message type", feed = FEED, payload = %value);
            }
        }
    }

    fn send(&self, request: &JsonRpcRequest) {
        match self.connection.send_json(request) {
            Ok(()) => self.metrics.subscription_requests.increment(1),
            Err(e) => warn!(
                message = "failed to send subscription request",
                feed = FEED,
                error = %e
            ),
        }
    }
}
