use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::{FlashblockFeed, FlashblockFeedConfig, FlashblockMessage, FlashblockPayload};
use crate::connection::{ConnectionConfig, ConnectionEvent, ConnectionHandle, ConnectionManager};
use crate::{
    ConnectionError, DEFAULT_RECONNECT_COOLDOWN, FlashblockFeedMetrics, ReconnectError,
    ReconnectGate, TransactionCountSink,
};

const FEED: &str = "flashblocks";

#[derive(Clone, Debug)]
pub struct FlashblockStreamConfig {
    pub connection: ConnectionConfig,
    pub feed: FlashblockFeedConfig,
    pub reconnect_cooldown: Duration,
}

impl FlashblockStreamConfig {
    pub fn new(connection: ConnectionConfig) -> Self {
        Self {
            connection,
            feed: FlashblockFeedConfig::default(),
            reconnect_cooldown: DEFAULT_RECONNECT_COOLDOWN,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlashblockStreamSnapshot {
    pub blocks: Vec<FlashblockPayload>,
    pub is_connected: bool,
    pub connection_status: &'static str,
    pub is_stable: bool,
}

/// Live flashblock feed. Cheap to clone; every clone observes the same state.
#[derive(Clone)]
pub struct FlashblockStream {
    feed: Arc<RwLock<FlashblockFeed>>,
    connection: ConnectionHandle,
    gate: Arc<ReconnectGate>,
}

impl FlashblockStream {
    pub fn spawn(
        config: FlashblockStreamConfig,
        sink: Arc<dyn TransactionCountSink>,
        token: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let feed = Arc::new(RwLock::new(FlashblockFeed::new(config.feed, sink)));
        let (connection, events, manager) =
            ConnectionManager::spawn(FEED, config.connection, token.clone());

        let task = FlashblockStreamTask {
            feed: feed.clone(),
            metrics: FlashblockFeedMetrics::new_with_labels(&[("feed", FEED)]),
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

    pub fn snapshot(&self) -> FlashblockStreamSnapshot {
        let connection = self.connection.snapshot();
        FlashblockStreamSnapshot {
            blocks: self.feed.read().blocks(),
            is_connected: connection.is_connected(),
            connection_status: connection.status_label(),
            is_stable: connection.is_stable,
        }
    }

    pub fn latest(&self) -> Option<FlashblockPayload> {
        self.feed.read().latest().cloned()
    }

    /// Manual (re)connect, accepted at most once per cooldown window.
    pub fn connect(&self) -> Result<(), ReconnectError> {
        self.gate.try_acquire(Instant::now())?;
        info!(message = "manual reconnect", feed = FEED);
        self.connection.reconnect()?;
        Ok(())
    }

    /// Closes the connection and drops buffered flashblocks. Transaction counts already
    /// forwarded stay in the index.
    pub fn disconnect(&self) -> Result<(), ConnectionError> {
        self.connection.disconnect()?;
        self.feed.write().clear();
        Ok(())
    }

    pub fn clear_blocks(&self) {
        self.feed.write().clear();
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }
}

struct FlashblockStreamTask {
    feed: Arc<RwLock<FlashblockFeed>>,
    metrics: FlashblockFeedMetrics,
}

impl FlashblockStreamTask {
    async fn run(self, mut events: mpsc::Receiver<ConnectionEvent>, token: CancellationToken) {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                event = events.recv() => match event {
                    Some(ConnectionEvent::Opened) => {
                        info!(message = "connected to flashblocks feed", feed = FEED);
                    }
                    Some(ConnectionEvent::Message(frame)) => self.on_frame(frame),
                    Some(ConnectionEvent::Closed(close)) => {
                        info!(
                            message = "flashblocks feed closed",
                            feed = FEED,
                            code = ?close.code,
                            reason = close.reason.as_str(),
                            clean = close.clean
                        );
                    }
                    Some(ConnectionEvent::Error(detail)) => {
                        warn!(
                            message = "flashblocks feed error",
                            feed = FEED,
                            error = detail.as_str()
                        );
                    }
                    None => break,
                },
            }
        }

        self.feed.write().clear();
        debug!(message = "flashblock stream stopped", feed = FEED);
    }

    #[instrument(level = "debug", skip_all, fields(feed = FEED, size = frame.len()))]
    fn on_frame(&self, frame: crate::connection::Frame) {
        let outcome = self.feed.write().handle_frame(frame);

        match outcome {
            FlashblockMessage::Inserted {
                key,
                transactions,
                block_total,
            } => {
                self.metrics.flashblocks_inserted.increment(1);
                self.metrics
                    .transactions_per_flashblock
                    .record(transactions as f64);
                if block_total.is_some() {
                    self.metrics
                        .transactions_forwarded
                        .increment(transactions as u64);
                }
                debug!(
                    message = "new flashblock",
                    feed = FEED,
                    key = %key,
                    transactions,
                    block_total = ?block_total
                );
            }
            FlashblockMessage::Duplicate(key) => {
                self.metrics.duplicate_flashblocks.increment(1);
                debug!(message = "flashblock already processed, skipping", feed = FEED, key = %key);
            }
            FlashblockMessage::MissingBlockHash { index } => {
                self.metrics.missing_block_hash.increment(1);
                warn!(message = "flashblock without block hash", feed = FEED, index);
            }
            FlashblockMessage::DecodeError(detail) => {
                self.metrics.decode_errors.increment(1);
                warn!(
                    message = "failed to decode flashblock",
                    feed = FEED,
                    error = detail.as_str()
                );
            }
        }
    }
}
