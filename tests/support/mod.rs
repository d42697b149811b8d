#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use flashblocks_monitor::connection::{ConnectionConfig, ConnectionEvent, ReconnectPolicy};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use url::Url;

#[derive(Clone, Debug)]
pub enum ServerFrame {
    Text(String),
    Binary(Vec<u8>),
    /// Sends a close frame and drops the connection.
    Close,
}

/// Local WebSocket endpoint that records what clients send and pushes frames on demand.
pub struct MockServer {
    addr: SocketAddr,
    frames: broadcast::Sender<ServerFrame>,
    received: Arc<Mutex<Vec<String>>>,
    connections: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl MockServer {
    pub async fn new() -> Self {
        Self::start(false).await
    }

    /// A server that answers every `eth_ping` heartbeat.
    pub async fn answering_heartbeats() -> Self {
        Self::start(true).await
    }

    async fn start(answer_heartbeats: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (frames, _) = broadcast::channel::<ServerFrame>(100);
        let received = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();

        let server = Self {
            addr,
            frames: frames.clone(),
            received: received.clone(),
            connections: connections.clone(),
            shutdown: shutdown.clone(),
        };

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    accept_result = listener.accept() => match accept_result {
                        Ok((stream, _)) => {
                            connections.fetch_add(1, Ordering::SeqCst);
                            let frames = frames.subscribe();
                            let received = received.clone();
                            let shutdown = shutdown.clone();
                            tokio::spawn(async move {
                                Self::handle_connection(
                                    stream,
                                    frames,
                                    received,
                                    shutdown,
                                    answer_heartbeats,
                                )
                                .await;
                            });
                        }
                        Err(e) => {
                            eprintln!("Failed to accept: {e}");
                            break;
                        }
                    }
                }
            }
        });

        server
    }

    async fn handle_connection(
        stream: TcpStream,
        mut frames: broadcast::Receiver<ServerFrame>,
        received: Arc<Mutex<Vec<String>>>,
        shutdown: CancellationToken,
        answer_heartbeats: bool,
    ) {
        let ws_stream = match accept_async(stream).await {
            Ok(ws_stream) => ws_stream,
            Err(e) => {
                eprintln!("Failed to accept websocket: {e}");
                return;
            }
        };
        let (mut sink, mut stream) = ws_stream.split();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                frame = frames.recv() => match frame {
                    Ok(ServerFrame::Text(text)) => {
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Ok(ServerFrame::Binary(data)) => {
                        if sink.send(Message::Binary(data.into())).await.is_err() {
                            break;
                        }
                    }
                    Ok(ServerFrame::Close) => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                    Err(_) => break,
                },
                message = stream.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        let is_heartbeat = text.contains("eth_ping");
                        received.lock().push(text.to_string());
                        if answer_heartbeats && is_heartbeat {
                            let reply = r#"{"jsonrpc":"2.0","id":"heartbeat","result":true}"#;
                            if sink.send(Message::Text(reply.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(_)) => {}
                    _ => break,
                },
            }
        }
    }

    pub fn send(&self, frame: ServerFrame) {
        let _ = self.frames.send(frame);
    }

    pub fn send_text(&self, text: impl Into<String>) {
        self.send(ServerFrame::Text(text.into()));
    }

    pub fn received(&self) -> Vec<String> {
        self.received.lock().clone()
    }

    /// Received messages that are `eth_subscribe` requests.
    pub fn subscribe_requests(&self) -> Vec<serde_json::Value> {
        self.received()
            .iter()
            .filter_map(|text| serde_json::from_str::<serde_json::Value>(text).ok())
            .filter(|value| value["method"] == "eth_subscribe")
            .collect()
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn url(&self) -> Url {
        Url::parse(&format!("ws://{}", self.addr)).unwrap()
    }

    /// Number of heartbeat messages received so far.
    pub fn heartbeats(&self) -> usize {
        self.received().iter().filter(|m| m.contains("eth_ping")).count()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Connection settings scaled down so tests run in milliseconds.
pub fn fast_config(url: Url) -> ConnectionConfig {
    let mut config = ConnectionConfig::new(url);
    config.policy = ReconnectPolicy {
        initial_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(50),
        ..ReconnectPolicy::default()
    };
    config.connect_timeout = Duration::from_secs(2);
    config
}

/// Polls `condition` until it holds or five seconds pass.
pub async fn eventually(condition: impl Fn() -> bool) -> bool {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}

/// Skips events until one matches `predicate`.
pub async fn wait_for_event(
    events: &mut mpsc::Receiver<ConnectionEvent>,
    predicate: impl Fn(&ConnectionEvent) -> bool,
) -> ConnectionEvent {
    timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Some(event) if predicate(&event) => return event,
                Some(_) => continue,
                None => panic!("event stream ended"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}
