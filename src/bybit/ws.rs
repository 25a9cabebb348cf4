// =============================================================================
// Bybit public WebSocket — subscribe, listen, reconnect forever
// =============================================================================
//
// `StreamClient` owns one logical connection to the public kline stream:
//
//   connect()  ->  subscribe(topics)  ->  listen()
//                                           |            | universe change
//                                           | read error v
//                                           |      swap_connection()
//                                           v            | failure
//                      sleep(retry_delay) -> reconnect / swap
//                           ^                        | failure
//                           +------------------------+
//
// A universe change opens and subscribes the new connection while the old
// one is still being read, so no confirmed candle falls into the gap.
// `connect` fails fast and is the only place errors reach the caller.  Once
// `listen` runs, every failure is logged and retried with the same fixed
// delay until the cancellation token fires.  Payloads are handed to the
// handler inline, so a slow handler slows the reader down.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::market_data::SymbolRegistry;

// ---------------------------------------------------------------------------
// Transport seam
// ---------------------------------------------------------------------------

/// One open stream connection.
///
/// `recv` must be cancel-safe: the listen loop drops a pending `recv` when a
/// heartbeat or universe change wins the race.
#[async_trait]
pub trait StreamConnection: Send {
    async fn send_text(&mut self, text: String) -> Result<()>;

    /// Next text payload. A closed or ended stream is an error.
    async fn recv(&mut self) -> Result<String>;

    /// Best-effort close; errors are swallowed.
    async fn close(&mut self);
}

/// Opens stream connections.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    type Conn: StreamConnection + 'static;

    async fn connect(&self, url: &str) -> Result<Self::Conn>;
}

/// Receives every inbound payload, in arrival order.
#[async_trait]
pub trait PayloadHandler: Send + Sync {
    async fn handle(&self, payload: &str);
}

// ---------------------------------------------------------------------------
// tokio-tungstenite transport
// ---------------------------------------------------------------------------

/// Connector backed by `tokio_tungstenite::connect_async`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

pub struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl StreamConnector for WsConnector {
    type Conn = WsConnection;

    async fn connect(&self, url: &str) -> Result<WsConnection> {
        let (stream, _response) = connect_async(url)
            .await
            .with_context(|| format!("failed to connect to {url}"))?;
        Ok(WsConnection { stream })
    }
}

#[async_trait]
impl StreamConnection for WsConnection {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.stream
            .send(Message::Text(text))
            .await
            .context("WebSocket send failed")
    }

    async fn recv(&mut self) -> Result<String> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(text),
                Some(Ok(Message::Binary(bytes))) => {
                    return String::from_utf8(bytes).context("binary frame is not UTF-8");
                }
                Some(Ok(Message::Close(frame))) => bail!("WebSocket closed by peer: {frame:?}"),
                // tungstenite answers pings itself.
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e).context("WebSocket read error"),
                None => bail!("WebSocket stream ended"),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!(error = %e, "ignoring error while closing WebSocket");
        }
    }
}

// ---------------------------------------------------------------------------
// Control messages
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ControlMessage<'a> {
    op: &'a str,
    args: &'a [String],
}

fn subscribe_message(topics: &[String]) -> Result<String> {
    serde_json::to_string(&ControlMessage {
        op: "subscribe",
        args: topics,
    })
    .context("failed to encode subscribe message")
}

const PING_MESSAGE: &str = r#"{"op":"ping"}"#;

/// Longest a replaced connection is kept reading while its successor is
/// silent.
const SWAP_DRAIN_LIMIT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// StreamClient
// ---------------------------------------------------------------------------

enum ListenEvent {
    Payload(String),
    Failed(anyhow::Error),
    Heartbeat,
    UniverseChanged,
    Cancelled,
}

/// Long-lived kline stream client.
pub struct StreamClient<C: StreamConnector> {
    url: String,
    connector: C,
    registry: Arc<SymbolRegistry>,
    conn: Option<C::Conn>,
    topics: Arc<Vec<String>>,
    handler: Option<Arc<dyn PayloadHandler>>,
    retry_delay: Duration,
    ping_interval: Option<Duration>,
    changes: watch::Receiver<u64>,
}

impl<C: StreamConnector> StreamClient<C> {
    pub fn new(
        url: impl Into<String>,
        connector: C,
        registry: Arc<SymbolRegistry>,
        retry_delay: Duration,
    ) -> Self {
        let changes = registry.subscribe_changes();
        Self {
            url: url.into(),
            connector,
            registry,
            conn: None,
            topics: Arc::new(Vec::new()),
            handler: None,
            retry_delay,
            ping_interval: None,
            changes,
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn PayloadHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Send `{"op":"ping"}` every `interval` while listening.
    pub fn with_ping_interval(mut self, interval: Option<Duration>) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Topics of the last successful subscribe.
    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    #[cfg(test)]
    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Open the connection and subscribe to the registry's current topics.
    ///
    /// Does not retry; the caller treats a failure here as fatal.
    pub async fn connect(&mut self) -> Result<()> {
        info!(url = %self.url, "connecting to kline stream");
        let mut conn = self.connector.connect(&self.url).await?;

        self.changes.borrow_and_update();
        let topics = self.registry.topics(self.registry.interval());
        if let Err(e) = subscribe(&mut conn, &topics).await {
            conn.close().await;
            return Err(e.context("initial subscribe failed"));
        }

        info!(topics = topics.len(), "kline stream subscribed");
        self.conn = Some(conn);
        self.topics = topics;
        Ok(())
    }

    /// Read until `cancel` fires, recovering from every failure.
    pub async fn listen(&mut self, cancel: CancellationToken) {
        let mut heartbeat = self.ping_interval.map(|period| {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        loop {
            let event = match self.conn.as_mut() {
                None => ListenEvent::Failed(anyhow!("no open connection")),
                Some(conn) => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => ListenEvent::Cancelled,
                        read = conn.recv() => match read {
                            Ok(payload) => ListenEvent::Payload(payload),
                            Err(e) => ListenEvent::Failed(e),
                        },
                        _ = next_tick(&mut heartbeat) => ListenEvent::Heartbeat,
                        Ok(()) = self.changes.changed() => ListenEvent::UniverseChanged,
                    }
                }
            };

            match event {
                ListenEvent::Payload(payload) => deliver(&self.handler, &payload).await,
                ListenEvent::Heartbeat => {
                    let sent = match self.conn.as_mut() {
                        Some(conn) => conn.send_text(PING_MESSAGE.to_string()).await,
                        None => Err(anyhow!("no open connection")),
                    };
                    if let Err(e) = sent {
                        warn!(error = %e, "heartbeat failed -- reconnecting");
                        self.drop_connection().await;
                        if !self.recover(&cancel).await {
                            break;
                        }
                    }
                }
                ListenEvent::UniverseChanged => {
                    info!(
                        generation = *self.changes.borrow(),
                        "symbol universe changed -- resubscribing"
                    );
                    match self.swap_connection(&cancel).await {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(e) => {
                            warn!(error = %e, "resubscribe after universe change failed");
                            if !self.recover(&cancel).await {
                                break;
                            }
                        }
                    }
                }
                ListenEvent::Failed(e) => {
                    error!(error = %e, "kline stream failed -- reconnecting");
                    self.drop_connection().await;
                    if !self.recover(&cancel).await {
                        break;
                    }
                }
                ListenEvent::Cancelled => break,
            }
        }

        self.drop_connection().await;
        info!("kline stream stopped");
    }

    /// Fixed-delay retry loop; returns false if cancelled first.
    ///
    /// A still-open connection keeps feeding the handler until its
    /// replacement is live.
    async fn recover(&mut self, cancel: &CancellationToken) -> bool {
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(self.retry_delay) => {}
            }

            let result = if self.conn.is_some() {
                self.swap_connection(cancel).await
            } else {
                tokio::select! {
                    _ = cancel.cancelled() => return false,
                    r = self.reconnect_and_resubscribe() => r.map(|()| true),
                }
            };

            match result {
                Ok(true) => {
                    info!(attempt, topics = self.topics.len(), "kline stream recovered");
                    return true;
                }
                Ok(false) => return false,
                Err(e) => {
                    warn!(
                        attempt,
                        retry_in_ms = self.retry_delay.as_millis() as u64,
                        error = %e,
                        "reconnect failed"
                    );
                }
            }
        }
    }

    /// Open a fresh connection, drop the old one and subscribe to freshly
    /// built topics.
    async fn reconnect_and_resubscribe(&mut self) -> Result<()> {
        let mut conn = self.connector.connect(&self.url).await?;

        self.drop_connection().await;

        self.changes.borrow_and_update();
        let topics = self.registry.refresh_topics(self.registry.interval());
        if let Err(e) = subscribe(&mut conn, &topics).await {
            conn.close().await;
            return Err(e.context("resubscribe failed"));
        }

        debug!(topics = topics.len(), "resubscribed on new connection");
        self.conn = Some(conn);
        self.topics = topics;
        Ok(())
    }

    /// Replace a live connection without a gap in delivery.
    ///
    /// The current connection is read while the new one opens and subscribes,
    /// and until the new one yields its first payload (or `SWAP_DRAIN_LIMIT`
    /// passes).  On error the current connection stays installed.  Returns
    /// false if cancelled.
    async fn swap_connection(&mut self, cancel: &CancellationToken) -> Result<bool> {
        let mut conn = {
            let connect = self.connector.connect(&self.url);
            tokio::pin!(connect);
            loop {
                let event: SwapEvent<C::Conn> = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => SwapEvent::Cancelled,
                    read = recv_from(self.conn.as_mut()) => SwapEvent::Current(read),
                    opened = &mut connect => SwapEvent::Opened(opened),
                };
                match event {
                    SwapEvent::Cancelled => return Ok(false),
                    SwapEvent::Current(Ok(payload)) => deliver(&self.handler, &payload).await,
                    SwapEvent::Current(Err(e)) => {
                        warn!(error = %e, "previous connection failed during swap");
                        // `connect` still borrows the connector.
                        if let Some(mut old) = self.conn.take() {
                            old.close().await;
                        }
                    }
                    SwapEvent::Opened(opened) => break opened?,
                    SwapEvent::Replacement(_) | SwapEvent::DrainLimit => {}
                }
            }
        };

        self.changes.borrow_and_update();
        let topics = self.registry.refresh_topics(self.registry.interval());
        if let Err(e) = subscribe(&mut conn, &topics).await {
            conn.close().await;
            return Err(e.context("resubscribe failed"));
        }

        let drain_limit = tokio::time::sleep(SWAP_DRAIN_LIMIT);
        tokio::pin!(drain_limit);
        let first = loop {
            let event: SwapEvent<C::Conn> = tokio::select! {
                biased;
                _ = cancel.cancelled() => SwapEvent::Cancelled,
                read = recv_from(self.conn.as_mut()) => SwapEvent::Current(read),
                read = conn.recv() => SwapEvent::Replacement(read),
                _ = &mut drain_limit => SwapEvent::DrainLimit,
            };
            match event {
                SwapEvent::Cancelled => {
                    conn.close().await;
                    return Ok(false);
                }
                SwapEvent::Current(Ok(payload)) => deliver(&self.handler, &payload).await,
                SwapEvent::Current(Err(e)) => {
                    warn!(error = %e, "previous connection failed during swap");
                    self.drop_connection().await;
                }
                SwapEvent::Replacement(Ok(payload)) => break Some(payload),
                SwapEvent::Replacement(Err(e)) => {
                    conn.close().await;
                    return Err(e.context("new connection failed before its first payload"));
                }
                SwapEvent::DrainLimit => break None,
                SwapEvent::Opened(_) => {}
            }
        };

        self.drop_connection().await;
        debug!(topics = topics.len(), "swapped to new connection");
        self.conn = Some(conn);
        self.topics = topics;
        if let Some(payload) = first {
            deliver(&self.handler, &payload).await;
        }
        Ok(true)
    }

    async fn drop_connection(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.close().await;
        }
    }
}

enum SwapEvent<T> {
    Cancelled,
    Current(Result<String>),
    Opened(Result<T>),
    Replacement(Result<String>),
    DrainLimit,
}

async fn deliver(handler: &Option<Arc<dyn PayloadHandler>>, payload: &str) {
    if let Some(handler) = handler {
        handler.handle(payload).await;
    }
}

/// `recv` on the connection if there is one; pending forever otherwise.
async fn recv_from<T: StreamConnection>(conn: Option<&mut T>) -> Result<String> {
    match conn {
        Some(conn) => conn.recv().await,
        None => std::future::pending().await,
    }
}

async fn subscribe<T: StreamConnection>(conn: &mut T, topics: &[String]) -> Result<()> {
    if topics.is_empty() {
        warn!("subscribing with an empty topic list");
    }
    conn.send_text(subscribe_message(topics)?).await
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
