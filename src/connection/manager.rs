use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep, sleep_until};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};
use url::Url;

use super::{CloseDecision, ConnectionSnapshot, ConnectionState, ReconnectPolicy};
use crate::{ConnectionError, ConnectionMetrics, rpc};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A data frame received from the upstream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Why a session ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: Option<u16>,
    pub reason: String,
    /// `true` when the session ended with a close handshake.
    pub clean: bool,
}

impl CloseInfo {
    fn clean(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            reason: reason.into(),
            clean: true,
        }
    }

    fn unclean(reason: impl Into<String>) -> Self {
        Self {
            code: None,
            reason: reason.into(),
            clean: false,
        }
    }

    fn from_frame(frame: Option<&CloseFrame>) -> Self {
        match frame {
            Some(frame) => Self::clean(u16::from(frame.code), frame.reason.to_string()),
            None => Self {
                code: None,
                reason: String::new(),
                clean: true,
            },
        }
    }
}

/// Everything the manager reports to its consumer, in the order it happened.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    Opened,
    Message(Frame),
    Closed(CloseInfo),
    Error(String),
}

#[derive(Clone, Debug)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    pub timeout: Duration,
    pub message: String,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
            message: rpc::heartbeat_message(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    pub url: Url,
    pub policy: ReconnectPolicy,
    pub connect_timeout: Duration,
    pub heartbeat: HeartbeatConfig,
    pub stability_window: Duration,
    /// Capacity of the event channel handed to the consumer.
    pub event_buffer: usize,
    /// Connect as soon as the manager starts. When `false` the manager waits for
    /// [`ConnectionHandle::reconnect`].
    pub auto_connect: bool,
}

impl ConnectionConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            policy: ReconnectPolicy::default(),
            connect_timeout: Duration::from_secs(5),
            heartbeat: HeartbeatConfig::default(),
            stability_window: Duration::from_secs(10),
            event_buffer: 100,
            auto_connect: true,
        }
    }
}

#[derive(Debug)]
enum Command {
    Send(String),
    Reconnect,
    Disconnect,
}

/// Cloneable handle to a running [`ConnectionManager`].
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionSnapshot>,
}

impl ConnectionHandle {
    /// Queues a text frame. Frames queued while the socket is not open are dropped.
    pub fn send_text(&self, text: impl Into<String>) -> Result<(), ConnectionError> {
        self.command(Command::Send(text.into()))
    }

    pub fn send_json<T: Serialize>(&self, value: &T) -> Result<(), ConnectionError> {
        let text = serde_json::to_string(value)?;
        self.send_text(text)
    }

    /// Force-closes the socket, resets the attempt budget and connects again right away.
    pub fn reconnect(&self) -> Result<(), ConnectionError> {
        self.command(Command::Reconnect)
    }

    /// Closes the socket and stays closed until [`ConnectionHandle::reconnect`].
    pub fn disconnect(&self) -> Result<(), ConnectionError> {
        self.command(Command::Disconnect)
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.state.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.borrow().is_connected()
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.state.clone()
    }

    fn command(&self, command: Command) -> Result<(), ConnectionError> {
        self.commands
            .send(command)
            .map_err(|_| ConnectionError::Closed)
    }
}

enum SessionEnd {
    Lost,
    ManualReconnect,
    Disconnected,
    Cancelled,
}

enum BackoffWait {
    Elapsed,
    Reconnect,
    Disconnect,
    Cancelled,
}

pub struct ConnectionManager {
    feed: &'static str,
    config: ConnectionConfig,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionSnapshot>,
    events: mpsc::Sender<ConnectionEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    metrics: ConnectionMetrics,
}

impl ConnectionManager {
    /// Starts supervising a connection on the current runtime.
    ///
    /// Returns the handle, the ordered event stream and the task running the manager. The task
    /// ends when `token` is cancelled.
    pub fn spawn(
        feed: &'static str,
        config: ConnectionConfig,
        token: CancellationToken,
    ) -> (
        ConnectionHandle,
        mpsc::Receiver<ConnectionEvent>,
        JoinHandle<()>,
    ) {
        let (events_tx, events_rx) = mpsc::channel(config.event_buffer.max(1));
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let state = ConnectionState::new(
            config.url.as_str(),
            config.policy.clone(),
            config.stability_window,
        );
        let (state_tx, state_rx) = watch::channel(state.snapshot());

        let manager = Self {
            feed,
            config,
            state,
            state_tx,
            events: events_tx,
            commands: commands_rx,
            metrics: ConnectionMetrics::new_with_labels(&[("feed", feed)]),
        };
        let task = tokio::spawn(manager.run(token));

        let handle = ConnectionHandle {
            commands: commands_tx,
            state: state_rx,
        };
        (handle, events_rx, task)
    }

    async fn run(mut self, token: CancellationToken) {
        info!(
            message = "starting connection manager",
            feed = self.feed,
            url = %self.config.url
        );
        let mut connect_now = self.config.auto_connect;

        loop {
            if !connect_now {
                if !self.wait_for_reconnect(&token).await {
                    break;
                }
                self.state.reset_budget();
            }

            match self.connect_and_listen(&token).await {
                SessionEnd::Cancelled => break,
                SessionEnd::ManualReconnect => {
                    self.state.on_disconnect();
                    self.state.reset_budget();
                    self.publish();
                    connect_now = true;
                    continue;
                }
                SessionEnd::Disconnected => {
                    self.state.on_disconnect();
                    self.publish();
                    connect_now = false;
                    continue;
                }
                SessionEnd::Lost => {}
            }

            let decision = self.state.on_close();
            self.publish();

            connect_now = match decision {
                CloseDecision::Reconnect { attempt, delay } => {
                    warn!(
                        message = "reconnecting",
                        feed = self.feed,
                        url = %self.config.url,
                        attempt,
                        max_attempts = self.state.policy().max_attempts,
                        delay_ms = delay.as_millis() as u64
                    );
                    self.metrics.reconnects_scheduled.increment(1);
                    self.metrics.reconnect_delay.record(delay.as_secs_f64());

                    match self.wait_backoff(delay, &token).await {
                        BackoffWait::Cancelled => break,
                        BackoffWait::Elapsed => true,
                        BackoffWait::Reconnect => {
                            self.state.reset_budget();
                            self.publish();
                            true
                        }
                        BackoffWait::Disconnect => false,
                    }
                }
                CloseDecision::Exhausted => {
                    warn!(
                        message = "reconnection failed, giving up until a manual reconnect",
                        feed = self.feed,
                        url = %self.config.url,
                        attempts = self.state.policy().max_attempts
                    );
                    self.metrics.reconnects_exhausted.increment(1);
                    false
                }
                CloseDecision::Disabled => {
                    info!(
                        message = "auto reconnect disabled, staying disconnected",
                        feed = self.feed,
                        url = %self.config.url
                    );
                    false
                }
            };
        }

        self.state.on_disconnect();
        self.publish();
        self.metrics.connection_open.set(0.0);
        info!(
            message = "connection manager stopped",
            feed = self.feed,
            url = %self.config.url
        );
    }

    #[instrument(skip_all, fields(feed = self.feed, url = %self.config.url))]
    async fn connect_and_listen(&mut self, token: &CancellationToken) -> SessionEnd {
        self.state.begin_connect();
        self.publish();
        self.metrics.connection_attempts.increment(1);

        info!(
            message = "connecting to websocket",
            feed = self.feed,
            url = %self.config.url
        );

        let url = self.config.url.to_string();
        let connect_timeout = self.config.connect_timeout;
        let connect = tokio::time::timeout(connect_timeout, connect_async(url));

        let ws_stream = tokio::select! {
            _ = token.cancelled() => return SessionEnd::Cancelled,
            result = connect => match result {
                Ok(Ok((ws_stream, _))) => ws_stream,
                Ok(Err(e)) => {
                    self.metrics.connection_failures.increment(1);
                    self.report_error(ConnectionError::from(e)).await;
                    return SessionEnd::Lost;
                }
                Err(_) => {
                    self.metrics.connection_failures.increment(1);
                    self.report_error(ConnectionError::ConnectTimeout(connect_timeout)).await;
                    return SessionEnd::Lost;
                }
            }
        };

        let opened_at = Instant::now();
        self.state.on_open(opened_at);
        self.publish();
        self.metrics.connection_successes.increment(1);
        self.metrics.connection_open.set(1.0);

        info!(
            message = "websocket connection established",
            feed = self.feed,
            url = %self.config.url
        );
        self.emit(ConnectionEvent::Opened).await;

        let end = self.listen(ws_stream, opened_at, token).await;
        self.metrics.connection_open.set(0.0);
        end
    }

    async fn listen(
        &mut self,
        ws_stream: WsStream,
        opened_at: Instant,
        token: &CancellationToken,
    ) -> SessionEnd {
        let (mut write, mut read) = ws_stream.split();

        let heartbeat_interval = self.config.heartbeat.interval;
        let heartbeat_timeout = self.config.heartbeat.timeout;
        let heartbeat_message = self.config.heartbeat.message.clone();

        let mut heartbeat = interval_at(opened_at + heartbeat_interval, heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let heartbeat_deadline = sleep_until(opened_at + heartbeat_interval + heartbeat_timeout);
        tokio::pin!(heartbeat_deadline);
        let mut awaiting_response = false;

        let stable_at = self
            .state
            .stable_at()
            .unwrap_or(opened_at + self.config.stability_window);
        let stability = sleep_until(stable_at);
        tokio::pin!(stability);
        let mut stability_checked = false;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    self.state.begin_close();
                    self.publish();
                    let _ = write.send(Message::Close(None)).await;
                    return SessionEnd::Cancelled;
                }
                Some(command) = self.commands.recv() => match command {
                    Command::Send(text) => {
                        trace!(message = "sending message", feed = self.feed, payload = text.as_str());
                        if let Err(e) = write.send(Message::Text(text.into())).await {
                            return self.lost(ConnectionError::from(e)).await;
                        }
                        self.metrics.messages_sent.increment(1);
                    }
                    Command::Reconnect => {
                        info!(message = "manual reconnect requested", feed = self.feed);
                        self.close_session(&mut write, "manual reconnect").await;
                        return SessionEnd::ManualReconnect;
                    }
                    Command::Disconnect => {
                        info!(message = "disconnect requested", feed = self.feed);
                        self.close_session(&mut write, "disconnect requested").await;
                        return SessionEnd::Disconnected;
                    }
                },
                message = read.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        awaiting_response = false;
                        self.record_received(text.len());
                        self.emit(ConnectionEvent::Message(Frame::Text(text.to_string()))).await;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        awaiting_response = false;
                        self.record_received(data.len());
                        self.emit(ConnectionEvent::Message(Frame::Binary(data.to_vec()))).await;
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                        awaiting_response = false;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let info = CloseInfo::from_frame(frame.as_ref());
                        info!(
                            message = "received close frame",
                            feed = self.feed,
                            code = ?info.code,
                            reason = info.reason.as_str()
                        );
                        self.emit(ConnectionEvent::Closed(info)).await;
                        return SessionEnd::Lost;
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => return self.lost(ConnectionError::from(e)).await,
                    None => {
                        info!(message = "websocket stream ended", feed = self.feed);
                        self.emit(ConnectionEvent::Closed(CloseInfo::unclean("stream ended"))).await;
                        return SessionEnd::Lost;
                    }
                },
                _ = heartbeat.tick() => {
                    trace!(message = "sending heartbeat", feed = self.feed);
                    if let Err(e) = write.send(Message::Text(heartbeat_message.clone().into())).await {
                        return self.lost(ConnectionError::from(e)).await;
                    }
                    if !awaiting_response {
                        awaiting_response = true;
                        heartbeat_deadline.as_mut().reset(Instant::now() + heartbeat_timeout);
                    }
                }
                _ = &mut heartbeat_deadline, if awaiting_response => {
                    warn!(
                        message = "no heartbeat response, reconnecting",
                        feed = self.feed,
                        timeout_ms = heartbeat_timeout.as_millis() as u64
                    );
                    self.metrics.heartbeat_timeouts.increment(1);
                    self.emit(ConnectionEvent::Closed(CloseInfo::unclean("heartbeat timeout"))).await;
                    return SessionEnd::Lost;
                }
                _ = &mut stability, if !stability_checked => {
                    stability_checked = true;
                    if self.state.mark_stable(Instant::now()) {
                        info!(message = "connection is now stable", feed = self.feed, url = %self.config.url);
                        self.publish();
                    }
                }
            }
        }
    }

    async fn wait_for_reconnect(&mut self, token: &CancellationToken) -> bool {
        loop {
            tokio::select! {
                _ = token.cancelled() => return false,
                command = self.commands.recv() => match command {
                    Some(Command::Reconnect) => {
                        info!(message = "manual reconnect requested", feed = self.feed);
                        return true;
                    }
                    Some(Command::Send(_)) => {
                        debug!(message = "dropping outbound message, connection closed", feed = self.feed);
                    }
                    Some(Command::Disconnect) => {}
                    None => {
                        token.cancelled().await;
                        return false;
                    }
                }
            }
        }
    }

    async fn wait_backoff(&mut self, delay: Duration, token: &CancellationToken) -> BackoffWait {
        let deadline = sleep(delay);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = token.cancelled() => return BackoffWait::Cancelled,
                _ = &mut deadline => return BackoffWait::Elapsed,
                Some(command) = self.commands.recv() => match command {
                    Command::Reconnect => return BackoffWait::Reconnect,
                    Command::Disconnect => return BackoffWait::Disconnect,
                    Command::Send(_) => {
                        debug!(message = "dropping outbound message, reconnect pending", feed = self.feed);
                    }
                }
            }
        }
    }

    async fn close_session(&mut self, write: &mut SplitSink<WsStream, Message>, reason: &str) {
        self.state.begin_close();
        self.publish();
        let _ = write.send(Message::Close(None)).await;
        self.emit(ConnectionEvent::Closed(CloseInfo::clean(1000, reason)))
            .await;
    }

    async fn lost(&mut self, error: ConnectionError) -> SessionEnd {
        let reason = error.to_string();
        self.report_error(error).await;
        self.emit(ConnectionEvent::Closed(CloseInfo::unclean(reason)))
            .await;
        SessionEnd::Lost
    }

    async fn report_error(&self, error: ConnectionError) {
        error!(
            message = "websocket error",
            feed = self.feed,
            url = %self.config.url,
            error = %error
        );
        self.emit(ConnectionEvent::Error(error.to_string())).await;
    }

    async fn emit(&self, event: ConnectionEvent) {
        if self.events.send(event).await.is_err() {
            trace!(message = "event receiver dropped", feed = self.feed);
        }
    }

    fn record_received(&self, size: usize) {
        self.metrics.messages_received.increment(1);
        self.metrics.bytes_received.increment(size as u64);
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.state.snapshot());
    }
}
