/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! One relay connection: the socket loop, its reconnect loop and the
//! consumer that drains the hand-off queue.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite;
use tracing::{debug, info, warn};
use vine_protocol::{ClientMessage, Event, Filter, RelayMessage};

use crate::backoff::Backoff;
use crate::config::RelayConfig;
use crate::handoff::HandoffQueue;
use crate::net_metrics::RelayMetrics;
use crate::signer::{auth_event, Signer};
use crate::subscription_registry::SubscriptionId;

const AUTH_REQUIRED_PREFIX: &str = "auth-required:";
const CONSUMER_BATCH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Authenticated,
}

impl ConnectionState {
    pub fn is_open(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Authenticated)
    }
}

/// Frames handed from the socket loop to the consumer, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Event {
        subscription_id: SubscriptionId,
        event: Event,
    },
    Eose {
        subscription_id: SubscriptionId,
    },
    /// The relay ended the subscription on its side.
    Closed {
        subscription_id: SubscriptionId,
        message: String,
    },
}

impl Inbound {
    fn is_event(&self) -> bool {
        matches!(self, Inbound::Event { .. })
    }
}

/// Receives what relays deliver. `on_inbound` runs on the connection's
/// consumer task, never on its socket loop.
#[async_trait]
pub trait RelayListener: Send + Sync {
    async fn on_inbound(&self, relay_url: &str, batch: Vec<Inbound>);

    /// The request for `subscription_id` was written to `relay_url`.
    fn on_forwarded(&self, relay_url: &str, subscription_id: &str);

    fn on_state(&self, relay_url: &str, state: ConnectionState);
}

pub(crate) enum RelayCommand {
    Forward(SubscriptionId),
    Close(SubscriptionId),
}

/// State shared by the pool and every connection task.
pub(crate) struct PoolShared {
    pub active: RwLock<HashMap<SubscriptionId, Vec<Filter>>>,
    pub listener: Arc<dyn RelayListener>,
    pub signer: Option<Arc<dyn Signer>>,
    pub cfg: RelayConfig,
}

impl PoolShared {
    fn filters_of(&self, id: &str) -> Option<Vec<Filter>> {
        self.active.read().unwrap().get(id).cloned()
    }
}

/// Per-connection state readable from outside the task.
pub(crate) struct ConnShared {
    pub url: String,
    pub state: watch::Sender<ConnectionState>,
    pub metrics: Arc<RelayMetrics>,
    pub pending: Mutex<HashSet<SubscriptionId>>,
    pub last_eose_ms: Mutex<HashMap<SubscriptionId, u64>>,
    pub queue: Arc<HandoffQueue<Inbound>>,
}

impl ConnShared {
    pub fn new(url: String, cfg: &RelayConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            url,
            state,
            metrics: Arc::new(RelayMetrics::new()),
            pending: Mutex::new(HashSet::new()),
            last_eose_ms: Mutex::new(HashMap::new()),
            queue: Arc::new(HandoffQueue::new(cfg.handoff_capacity(), Inbound::is_event)),
        }
    }

    fn set_state(&self, shared: &PoolShared, state: ConnectionState) {
        let changed = self.state.send_if_modified(|s| {
            if *s == state {
                false
            } else {
                *s = state;
                true
            }
        });
        if changed {
            debug!(relay = %self.url, ?state, "relay state");
            shared.listener.on_state(&self.url, state);
        }
    }
}

enum SessionEnd {
    Shutdown,
    Failed(String),
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
type WsSink = futures_util::stream::SplitSink<WsStream, tungstenite::Message>;

pub(crate) fn spawn_connection(
    conn: Arc<ConnShared>,
    shared: Arc<PoolShared>,
    cmd_rx: mpsc::UnboundedReceiver<RelayCommand>,
    shutdown: watch::Receiver<bool>,
) {
    let consumer_conn = conn.clone();
    let listener = shared.listener.clone();
    tokio::spawn(async move {
        while let Some(batch) = consumer_conn.queue.pop_batch(CONSUMER_BATCH).await {
            listener.on_inbound(&consumer_conn.url, batch).await;
        }
        debug!(relay = %consumer_conn.url, "relay consumer stopped");
    });
    tokio::spawn(run_connection(conn, shared, cmd_rx, shutdown));
}

async fn run_connection(
    conn: Arc<ConnShared>,
    shared: Arc<PoolShared>,
    mut cmd_rx: mpsc::UnboundedReceiver<RelayCommand>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::new(shared.cfg.backoff_initial(), shared.cfg.backoff_max());
    'outer: loop {
        if *shutdown.borrow() {
            break;
        }
        conn.set_state(&shared, ConnectionState::Connecting);
        let attempt = tokio::time::timeout(
            shared.cfg.connect_timeout(),
            tokio_tungstenite::connect_async(conn.url.as_str()),
        )
        .await;
        let err = match attempt {
            Ok(Ok((mut ws, _))) => {
                // Removed while the handshake was in flight.
                if *shutdown.borrow() {
                    let _ = ws.close(None).await;
                    debug!(relay = %conn.url, "relay removed during connect");
                    break 'outer;
                }
                backoff.reset();
                info!(relay = %conn.url, "relay connected");
                let end = run_session(ws, &conn, &shared, &mut cmd_rx, &mut shutdown).await;
                conn.pending.lock().unwrap().clear();
                match end {
                    SessionEnd::Shutdown => {
                        conn.metrics.disconnected(None);
                        break 'outer;
                    }
                    SessionEnd::Failed(e) => e,
                }
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => "connect timeout".to_string(),
        };
        warn!(relay = %conn.url, "relay connection lost: {err}");
        conn.metrics.disconnected(Some(err));
        conn.set_state(&shared, ConnectionState::Disconnected);

        // Commands are dropped while offline; the next session re-forwards
        // everything still active.
        let sleep = tokio::time::sleep(backoff.next_delay());
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() { break 'outer; }
                }
                cmd = cmd_rx.recv() => {
                    if cmd.is_none() { break 'outer; }
                }
            }
        }
    }
    conn.set_state(&shared, ConnectionState::Disconnected);
    conn.queue.close();
    debug!(relay = %conn.url, "relay task stopped");
}

struct Session<'a> {
    conn: &'a ConnShared,
    shared: &'a PoolShared,
    tx: WsSink,
    auth_event_id: Option<String>,
    auth_failed: bool,
    awaiting_auth: HashSet<SubscriptionId>,
}

async fn run_session(
    ws: WsStream,
    conn: &ConnShared,
    shared: &PoolShared,
    cmd_rx: &mut mpsc::UnboundedReceiver<RelayCommand>,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let (tx, mut rx) = ws.split();
    let mut s = Session {
        conn,
        shared,
        tx,
        auth_event_id: None,
        auth_failed: false,
        awaiting_auth: HashSet::new(),
    };
    conn.pending.lock().unwrap().clear();
    conn.metrics.connected();
    conn.set_state(shared, ConnectionState::Connected);

    let active: Vec<SubscriptionId> = shared.active.read().unwrap().keys().cloned().collect();
    for id in active {
        if let Err(e) = s.forward(&id).await {
            return SessionEnd::Failed(e.to_string());
        }
    }

    let mut ping = tokio::time::interval(shared.cfg.ping_interval());
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping.tick().await;

    loop {
        let step: Result<()> = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    let _ = s.tx.send(tungstenite::Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                }
                Ok(())
            }
            cmd = cmd_rx.recv() => match cmd {
                Some(RelayCommand::Forward(id)) => s.forward(&id).await,
                Some(RelayCommand::Close(id)) => s.close(&id).await,
                None => return SessionEnd::Shutdown,
            },
            _ = ping.tick() => {
                let payload = now_ms().to_be_bytes().to_vec();
                s.tx.send(tungstenite::Message::Ping(payload)).await.map_err(Into::into)
            }
            msg = rx.next() => {
                let Some(msg) = msg else {
                    return SessionEnd::Failed("closed by relay".to_string());
                };
                match msg {
                    Ok(tungstenite::Message::Text(text)) => {
                        conn.metrics.rx_add(text.len() as u64);
                        s.handle_frame(&text).await
                    }
                    Ok(tungstenite::Message::Pong(p)) => {
                        if p.len() == 8 {
                            let mut a = [0u8; 8];
                            a.copy_from_slice(&p);
                            conn.metrics.rtt_update(now_ms().saturating_sub(u64::from_be_bytes(a)));
                        }
                        Ok(())
                    }
                    Ok(tungstenite::Message::Ping(p)) => {
                        s.tx.send(tungstenite::Message::Pong(p)).await.map_err(Into::into)
                    }
                    Ok(tungstenite::Message::Close(_)) => {
                        return SessionEnd::Failed("closed by relay".to_string());
                    }
                    Ok(_) => Ok(()),
                    Err(e) => Err(e.into()),
                }
            }
        };
        if let Err(e) = step {
            return SessionEnd::Failed(format!("{e:#}"));
        }
    }
}

impl Session<'_> {
    async fn send(&mut self, msg: ClientMessage) -> Result<()> {
        let json = msg.to_json();
        self.conn.metrics.tx_add(json.len() as u64);
        self.tx.send(tungstenite::Message::Text(json)).await?;
        Ok(())
    }

    /// Sends REQ unless this connection already carries the subscription or
    /// it was closed in the meantime.
    async fn forward(&mut self, id: &str) -> Result<()> {
        let Some(filters) = self.shared.filters_of(id) else {
            return Ok(());
        };
        if !self.conn.pending.lock().unwrap().insert(id.to_string()) {
            return Ok(());
        }
        self.send(ClientMessage::Req {
            subscription_id: id.to_string(),
            filters,
        })
        .await?;
        self.shared.listener.on_forwarded(&self.conn.url, id);
        Ok(())
    }

    async fn close(&mut self, id: &str) -> Result<()> {
        self.awaiting_auth.remove(id);
        self.conn.last_eose_ms.lock().unwrap().remove(id);
        if !self.conn.pending.lock().unwrap().remove(id) {
            return Ok(());
        }
        self.send(ClientMessage::Close {
            subscription_id: id.to_string(),
        })
        .await
    }

    fn hand_off(&self, item: Inbound) {
        if self.conn.queue.push(item) {
            self.conn.metrics.dropped();
            let dropped = self.conn.queue.dropped();
            if dropped == 1 || dropped % 500 == 0 {
                warn!(relay = %self.conn.url, dropped, "hand-off queue full, dropping oldest events");
            }
        }
    }

    async fn handle_frame(&mut self, text: &str) -> Result<()> {
        let msg = match RelayMessage::from_json(text) {
            Ok(m) => m,
            Err(e) => {
                self.conn.metrics.malformed();
                warn!(relay = %self.conn.url, "discarding malformed frame: {e:#}");
                return Ok(());
            }
        };
        match msg {
            RelayMessage::Event {
                subscription_id,
                event,
            } => {
                if !self.conn.pending.lock().unwrap().contains(&subscription_id) {
                    debug!(relay = %self.conn.url, sub = %subscription_id, "event for unknown subscription");
                    return Ok(());
                }
                self.conn.metrics.event_rx();
                self.hand_off(Inbound::Event {
                    subscription_id,
                    event,
                });
            }
            RelayMessage::Eose { subscription_id } => {
                self.conn
                    .last_eose_ms
                    .lock()
                    .unwrap()
                    .insert(subscription_id.clone(), now_ms());
                self.hand_off(Inbound::Eose { subscription_id });
            }
            RelayMessage::Notice { message } => {
                info!(relay = %self.conn.url, "relay notice: {message}");
            }
            RelayMessage::Auth { challenge } => self.authenticate(&challenge).await?,
            RelayMessage::Ok {
                event_id,
                accepted,
                message,
            } => {
                if self.auth_event_id.as_deref() == Some(event_id.as_str()) {
                    self.auth_event_id = None;
                    if accepted {
                        info!(relay = %self.conn.url, "relay authenticated");
                        self.conn.set_state(self.shared, ConnectionState::Authenticated);
                        let retry: Vec<SubscriptionId> = self.awaiting_auth.drain().collect();
                        for id in retry {
                            self.forward(&id).await?;
                        }
                    } else {
                        warn!(relay = %self.conn.url, "relay rejected auth: {message}");
                        self.auth_failed = true;
                        if !self.awaiting_auth.is_empty() {
                            return Err(anyhow!("relay requires auth and rejected ours"));
                        }
                    }
                }
            }
            RelayMessage::Closed {
                subscription_id,
                message,
            } => {
                self.conn.pending.lock().unwrap().remove(&subscription_id);
                if message.starts_with(AUTH_REQUIRED_PREFIX) {
                    if self.shared.signer.is_none() || self.auth_failed {
                        return Err(anyhow!("relay requires auth: {message}"));
                    }
                    if self.shared.filters_of(&subscription_id).is_some() {
                        self.awaiting_auth.insert(subscription_id);
                    }
                    return Ok(());
                }
                debug!(relay = %self.conn.url, sub = %subscription_id, "relay closed subscription: {message}");
                self.hand_off(Inbound::Closed {
                    subscription_id,
                    message,
                });
            }
        }
        Ok(())
    }

    async fn authenticate(&mut self, challenge: &str) -> Result<()> {
        let Some(signer) = self.shared.signer.clone() else {
            debug!(relay = %self.conn.url, "auth challenge ignored: no signer");
            return Ok(());
        };
        let unsigned = auth_event(&signer.public_key(), &self.conn.url, challenge);
        let signed = match tokio::time::timeout(Duration::from_secs(5), signer.sign(unsigned)).await {
            Ok(Ok(ev)) => ev,
            Ok(Err(e)) => {
                warn!(relay = %self.conn.url, "signing auth challenge failed: {e:#}");
                self.auth_failed = true;
                return Ok(());
            }
            Err(_) => {
                warn!(relay = %self.conn.url, "signing auth challenge timed out");
                self.auth_failed = true;
                return Ok(());
            }
        };
        self.auth_event_id = Some(signed.id.clone());
        self.send(ClientMessage::Auth { event: signed }).await
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
