use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use eyre::Context as _;
use tokio_util::sync::CancellationToken;
use tracing::{Level, info, warn};
use url::Url;

use crate::blocks::{BlockFeedConfig, BlockStream, BlockStreamConfig};
use crate::connection::{ConnectionConfig, HeartbeatConfig, ReconnectPolicy};
use crate::flashblocks::{FlashblockFeedConfig, FlashblockStream, FlashblockStreamConfig};
use crate::{Error, Reporter, TransactionCountIndex, init_metrics, init_tracing};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
pub struct Args {
    /// Block feed WebSocket URL (JSON-RPC `newHeads`)
    #[arg(long, env, default_value = "wss://base-sepolia.drpc.org")]
    pub block_ws_url: Url,

    /// Flashblocks WebSocket URL
    #[arg(long, env, default_value = "wss://sepolia.flashblocks.base.org/ws")]
    pub flashblocks_ws_url: Url,

    /// Maximum number of recent items kept per feed
    #[arg(long, env, default_value = "20")]
    pub max_blocks: usize,

    /// Start the flashblocks feed disconnected
    #[arg(long, env, default_value = "false")]
    pub flashblocks_disconnected: bool,

    #[clap(flatten)]
    pub reconnect: ReconnectArgs,

    /// File holding transaction counts per block number
    #[arg(long, env, default_value = "transaction-counts-storage.json")]
    pub tx_counts_path: PathBuf,

    /// Maximum number of block numbers kept in the transaction count file
    #[arg(long, env, default_value = "1024")]
    pub tx_counts_max_entries: usize,

    /// Interval between reports in milliseconds
    #[arg(long, env, default_value = "2000")]
    pub report_interval_ms: u64,

    /// Print reports as JSON lines on stdout
    #[arg(long, env, default_value = "false")]
    pub json: bool,

    // Enable tracing
    #[arg(long, env, default_value = "false")]
    pub tracing: bool,

    // Enable Prometheus metrics
    #[arg(long, env, default_value = "false")]
    pub metrics: bool,

    /// Host to run the metrics server on
    #[arg(long, env, default_value = "0.0.0.0")]
    pub metrics_host: String,

    /// Port to run the metrics server on
    #[arg(long, env, default_value = "9090")]
    pub metrics_port: u16,

    /// OTLP endpoint
    #[arg(long, env, default_value = "http://localhost:4317")]
    pub otlp_endpoint: String,

    /// Log level
    #[arg(long, env, default_value = "info")]
    pub log_level: Level,

    /// Log format
    #[arg(long, env, default_value = "text")]
    pub log_format: LogFormat,
}

#[derive(Parser, Debug, Clone)]
pub struct ReconnectArgs {
    /// Reconnect attempts before giving up until a manual reconnect
    #[arg(long, env, default_value = "10")]
    pub reconnect_attempts: u32,

    /// Disable automatic reconnection
    #[arg(long, env, default_value = "false")]
    pub no_auto_reconnect: bool,

    /// Delay before the first reconnect in milliseconds
    #[arg(long, env, default_value = "1000")]
    pub initial_reconnect_delay_ms: u64,

    /// Upper bound for the reconnect delay in milliseconds, before jitter
    #[arg(long, env, default_value = "30000")]
    pub max_reconnect_delay_ms: u64,

    /// Backoff multiplier of the block feed
    #[arg(long, env, default_value = "1.5")]
    pub block_backoff_multiplier: f64,

    /// Backoff multiplier of the flashblocks feed
    #[arg(long, env, default_value = "2.0")]
    pub flashblocks_backoff_multiplier: f64,

    /// Random jitter applied to every reconnect delay, 0.2 means +/-20%
    #[arg(long, env, default_value = "0.2")]
    pub reconnect_jitter: f64,

    /// Timeout of a single connect attempt in milliseconds
    #[arg(long, env, default_value = "5000")]
    pub connect_timeout_ms: u64,

    /// Interval between heartbeat messages in milliseconds
    #[arg(long, env, default_value = "30000")]
    pub heartbeat_interval_ms: u64,

    /// Time to wait for any frame after a heartbeat message in milliseconds
    #[arg(long, env, default_value = "10000")]
    pub heartbeat_timeout_ms: u64,

    /// Time a connection must stay open to be considered stable in milliseconds
    #[arg(long, env, default_value = "10000")]
    pub stability_window_ms: u64,

    /// Minimum time between manual reconnects in milliseconds
    #[arg(long, env, default_value = "10000")]
    pub reconnect_cooldown_ms: u64,
}

impl ReconnectArgs {
    fn policy(&self, multiplier: f64) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.reconnect_attempts,
            auto_reconnect: !self.no_auto_reconnect,
            initial_delay: Duration::from_millis(self.initial_reconnect_delay_ms),
            max_delay: Duration::from_millis(self.max_reconnect_delay_ms),
            multiplier,
            jitter: self.reconnect_jitter,
        }
    }

    fn connection(&self, url: Url, multiplier: f64) -> ConnectionConfig {
        ConnectionConfig {
            policy: self.policy(multiplier),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            heartbeat: HeartbeatConfig {
                interval: Duration::from_millis(self.heartbeat_interval_ms),
                timeout: Duration::from_millis(self.heartbeat_timeout_ms),
                ..HeartbeatConfig::default()
            },
            stability_window: Duration::from_millis(self.stability_window_ms),
            ..ConnectionConfig::new(url)
        }
    }
}

impl Args {
    pub async fn run(self) -> eyre::Result<()> {
        self.validate()?;
        init_tracing(&self)?;

        if self.metrics {
            let addr = format!("{}:{}", self.metrics_host, self.metrics_port)
                .parse::<SocketAddr>()
                .context("Invalid metrics address")?;
            init_metrics(addr)?;
        }

        let token = CancellationToken::new();
        let tx_counts = Arc::new(TransactionCountIndex::open(
            &self.tx_counts_path,
            self.tx_counts_max_entries,
        ));

        let (blocks, blocks_task) = BlockStream::spawn(self.block_stream_config(), token.clone());
        let (flashblocks, flashblocks_task) = FlashblockStream::spawn(
            self.flashblock_stream_config(),
            tx_counts.clone(),
            token.clone(),
        );

        let reporter = Reporter::new(
            blocks,
            flashblocks,
            tx_counts.clone(),
            Duration::from_millis(self.report_interval_ms),
            self.json,
        );
        let reporter_task = tokio::spawn(reporter.run(token.clone()));

        info!(
            message = "flashblocks monitor started",
            block_ws_url = %self.block_ws_url,
            flashblocks_ws_url = %self.flashblocks_ws_url
        );

        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for shutdown signal")?;
        info!("Received SIGINT, shutting down gracefully...");
        token.cancel();

        let (blocks, flashblocks, reporter) =
            tokio::join!(blocks_task, flashblocks_task, reporter_task);
        for (task, result) in [
            ("blocks", blocks),
            ("flashblocks", flashblocks),
            ("reporter", reporter),
        ] {
            if let Err(e) = result {
                warn!(message = "task failed during shutdown", task, error = %e);
            }
        }

        if let Err(e) = tokio::task::spawn_blocking(move || tx_counts.flush()).await {
            warn!(message = "failed to flush transaction counts", error = %e);
        }

        Ok(())
    }

    fn validate(&self) -> Result<(), Error> {
        if self.max_blocks == 0 {
            return Err(Error::InvalidArgs("--max-blocks must be at least 1".into()));
        }
        if self.report_interval_ms == 0 {
            return Err(Error::InvalidArgs(
                "--report-interval-ms must be positive".into(),
            ));
        }
        let reconnect = &self.reconnect;
        if !(0.0..1.0).contains(&reconnect.reconnect_jitter) {
            return Err(Error::InvalidArgs(
                "--reconnect-jitter must be in [0, 1)".into(),
            ));
        }
        if reconnect.block_backoff_multiplier < 1.0
            || reconnect.flashblocks_backoff_multiplier < 1.0
        {
            return Err(Error::InvalidArgs(
                "backoff multipliers must be at least 1".into(),
            ));
        }
        if reconnect.initial_reconnect_delay_ms > reconnect.max_reconnect_delay_ms {
            return Err(Error::InvalidArgs(
                "--initial-reconnect-delay-ms exceeds --max-reconnect-delay-ms".into(),
            ));
        }
        if reconnect.heartbeat_interval_ms == 0 {
            return Err(Error::InvalidArgs(
                "--heartbeat-interval-ms must be positive".into(),
            ));
        }
        Ok(())
    }

    fn block_stream_config(&self) -> BlockStreamConfig {
        BlockStreamConfig {
            connection: self.reconnect.connection(
                self.block_ws_url.clone(),
                self.reconnect.block_backoff_multiplier,
            ),
            feed: BlockFeedConfig {
                max_blocks: self.max_blocks,
                ..BlockFeedConfig::default()
            },
            reconnect_cooldown: Duration::from_millis(self.reconnect.reconnect_cooldown_ms),
        }
    }

    fn flashblock_stream_config(&self) -> FlashblockStreamConfig {
        let mut connection = self.reconnect.connection(
            self.flashblocks_ws_url.clone(),
            self.reconnect.flashblocks_backoff_multiplier,
        );
        connection.auto_connect = !self.flashblocks_disconnected;

        FlashblockStreamConfig {
            connection,
            feed: FlashblockFeedConfig {
                max_blocks: self.max_blocks,
                ..FlashblockFeedConfig::default()
            },
            reconnect_cooldown: Duration::from_millis(self.reconnect.reconnect_cooldown_ms),
        }
    }
}

#[derive(Clone, Debug)]
pub enum LogFormat {
    Json,
    Text,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "text" => Ok(LogFormat::Text),
            _ => Err("Invalid log format".into()),
        }
    }
}
