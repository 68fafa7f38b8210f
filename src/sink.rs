use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::{Result, anyhow};
use futures_util::{SinkExt, StreamExt};
use rand::random_range;
use tokio::sync::{Notify, mpsc};
use tokio::time::{Duration, interval, sleep};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::config::MasterConfig;
use crate::handler::StreamHandler;
use crate::metrics::METRICS;
use crate::schema::{OutboundMessage, TickerSnapshot};
use crate::snapshot::OrderbookSnapshot;

const RECONNECT_DELAY: Duration = Duration::from_secs(30);
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// ============================================================
/// MasterSender
/// ============================================================
///
/// One persistent WebSocket connection to the master service.
///
/// Responsibilities:
/// - Perform the login handshake
/// - Drain its queue onto the socket
/// - Send periodic JSON pings
/// - Reconnect after connection loss
///
/// The queue outlives individual connections: records enqueued
/// while disconnected are sent after the next login, up to the
/// queue bound.
struct MasterSender {
    queue: mpsc::Sender<OutboundMessage>,
}

impl MasterSender {
    /// Spawns the reconnect loop. Never fails; connection errors
    /// are logged and retried.
    fn spawn(url: String, login: String, debug: bool, queue_size: usize) -> Self {
        let (tx, mut rx) = mpsc::channel(queue_size.max(1));

        tokio::spawn(async move {
            loop {
                match Self::run_connection(&url, &login, debug, &mut rx).await {
                    Ok(()) => {
                        log::debug!("master sender queue closed, exiting");
                        return;
                    }
                    Err(e) => log::warn!("master connection lost: {e:#}"),
                }
                sleep(RECONNECT_DELAY).await;
            }
        });

        Self { queue: tx }
    }

    /// Runs one connection until it fails (`Err`) or the queue is
    /// closed because the sink was dropped (`Ok`).
    async fn run_connection(
        url: &str,
        login: &str,
        debug: bool,
        rx: &mut mpsc::Receiver<OutboundMessage>,
    ) -> Result<()> {
        let (ws, _) = connect_async(url).await?;
        let (mut write, mut read) = ws.split();
        let closed = Arc::new(Notify::new());

        write.send(Message::Text(login.to_string().into())).await?;
        log::info!("logged in to master at {url}");

        // Incoming frames are only watched for EOF
        let reader = tokio::spawn({
            let closed = closed.clone();
            async move {
                while let Some(Ok(msg)) = read.next().await {
                    if debug {
                        if let Message::Text(text) = msg {
                            log::debug!("[master recv] {text}");
                        }
                    }
                }
                closed.notify_one();
            }
        });

        let mut ping = interval(PING_INTERVAL);

        let outcome: Result<()> = loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(msg) = msg else {
                        let _ = write.close().await;
                        break Ok(());
                    };
                    let json = serde_json::to_string(&msg)?;
                    if debug {
                        log::debug!("[master send] {json}");
                    }
                    if let Err(e) = write.send(Message::Text(json.into())).await {
                        break Err(e.into());
                    }
                    METRICS.records_forwarded.fetch_add(1, Ordering::Relaxed);
                }

                _ = ping.tick() => {
                    if let Err(e) = write.send(Message::Text(r#"{"op":"ping"}"#.into())).await {
                        break Err(e.into());
                    }
                }

                _ = closed.notified() => {
                    break Err(anyhow!("master closed connection"));
                }
            }
        };

        reader.abort();
        outcome
    }

    /// Non-blocking enqueue. Returns false when the record was
    /// dropped because the queue is full.
    fn try_enqueue(&self, msg: OutboundMessage) -> Result<bool> {
        match self.queue.try_send(msg) {
            Ok(()) => Ok(true),
            Err(mpsc::error::TrySendError::Full(_)) => Ok(false),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(anyhow!("master sender stopped")),
        }
    }
}

/// ============================================================
/// ForwardingSink
/// ============================================================
///
/// Consumer that pushes every snapshot as a tagged JSON record to
/// a pool of master connections.
///
/// Attach it as the collector's handler. It never blocks the
/// supervisor: a full queue drops the record and counts it.
///
/// DEMO MODE:
/// - No network connections
/// - Records are logged instead of sent
pub struct ForwardingSink {
    senders: Vec<MasterSender>,
    demo: bool,
}

impl ForwardingSink {
    /// Opens `config.connections` master connections.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// LOGIN FORMAT:
    /// - key=<API_KEY>&role=collector
    pub fn new(config: &MasterConfig, debug: bool) -> Result<Self> {
        let demo = config.demo.unwrap_or(false);
        if demo {
            log::warn!("forwarding sink running in DEMO mode");
            return Ok(Self {
                senders: Vec::new(),
                demo,
            });
        }

        if config.connections == 0 {
            return Err(anyhow!("master.connections must be at least 1"));
        }

        let login = format!("key={}&role=collector", config.key);
        let senders = (0..config.connections)
            .map(|_| MasterSender::spawn(config.url.clone(), login.clone(), debug, config.queue_size))
            .collect();

        Ok(Self { senders, demo })
    }

    pub fn is_demo(&self) -> bool {
        self.demo
    }

    /// Hands one record to a randomly chosen connection.
    pub fn forward(&self, msg: OutboundMessage) -> Result<()> {
        if self.demo {
            log::info!("DEMO -> {}", serde_json::to_string(&msg)?);
            return Ok(());
        }

        let idx = random_range(0..self.senders.len());
        if !self.senders[idx].try_enqueue(msg)? {
            METRICS.records_dropped.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    pub fn forward_ticker(&self, ticker: &TickerSnapshot) -> Result<()> {
        self.forward(OutboundMessage::Ticker(ticker.to_record()))
    }
}

#[async_trait::async_trait]
impl StreamHandler for ForwardingSink {
    async fn on_orderbook_update(&self, snapshot: &OrderbookSnapshot) -> Result<()> {
        self.forward(OutboundMessage::Book(snapshot.to_record()))
    }
}
