/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

#![allow(dead_code)]

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::{net::TcpListener, sync::broadcast};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use vine_protocol::{ClientMessage, Event, Filter, GatewayEnvelope, RelayMessage, KIND_SHORT_VIDEO};
use vine_sync::{FeedSubscription, SubscriptionItem, SyncConfig};

pub fn video(id: &str, author: &str, created_at: u64) -> Event {
    Event {
        id: id.to_string(),
        pubkey: author.to_string(),
        created_at,
        kind: KIND_SHORT_VIDEO,
        tags: vec![vec!["t".to_string(), "dance".to_string()]],
        content: format!("video {id}"),
        sig: "00".repeat(64),
    }
}

/// Config pointing at a temp data dir with short timeouts and no gateway.
pub fn test_config(data_dir: &std::path::Path, relays: &[&str]) -> SyncConfig {
    let mut cfg = SyncConfig::default();
    cfg.data_dir = Some(data_dir.display().to_string());
    cfg.relays = relays.iter().map(|s| s.to_string()).collect();
    cfg.deprecated_relays = Vec::new();
    cfg.registry.eose_timeout_ms = 500;
    cfg.relay.backoff_initial_ms = 50;
    cfg.relay.backoff_max_ms = 200;
    cfg.relay.connect_timeout_secs = 2;
    cfg.gateway.enabled = false;
    cfg
}

/// Collects events until the backlog marker or `timeout`.
pub async fn collect_backlog(feed: &mut FeedSubscription, timeout: Duration) -> (Vec<Event>, bool) {
    let mut events = Vec::new();
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match tokio::time::timeout_at(deadline, feed.recv()).await {
            Ok(Some(SubscriptionItem::Event(ev))) => events.push(ev),
            Ok(Some(SubscriptionItem::BacklogComplete)) => return (events, true),
            Ok(None) | Err(_) => return (events, false),
        }
    }
}

pub async fn next_event(feed: &mut FeedSubscription, timeout: Duration) -> Option<Event> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match tokio::time::timeout_at(deadline, feed.recv()).await {
            Ok(Some(SubscriptionItem::Event(ev))) => return Some(ev),
            Ok(Some(SubscriptionItem::BacklogComplete)) => continue,
            Ok(None) | Err(_) => return None,
        }
    }
}

pub async fn eventually(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}

#[derive(Clone, Default)]
pub struct RelayOptions {
    pub no_eose: bool,
    pub garbage_before_events: bool,
    /// Sends an AUTH challenge and refuses REQs until it is answered.
    pub require_auth: bool,
    /// Holds the websocket handshake open this long after the TCP accept.
    pub handshake_delay: Option<Duration>,
}

struct RelayState {
    opts: RelayOptions,
    events: Mutex<Vec<Event>>,
    reqs: Mutex<Vec<(usize, String)>>,
    closes: Mutex<Vec<String>>,
    connections: AtomicUsize,
    live: broadcast::Sender<Event>,
    kick: broadcast::Sender<()>,
}

/// In-process relay speaking the REQ/EVENT/EOSE/CLOSE protocol.
pub struct MockRelay {
    pub url: String,
    state: Arc<RelayState>,
}

impl MockRelay {
    pub async fn spawn(events: Vec<Event>, opts: RelayOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (live, _) = broadcast::channel(256);
        let (kick, _) = broadcast::channel(4);
        let state = Arc::new(RelayState {
            opts,
            events: Mutex::new(events),
            reqs: Mutex::new(Vec::new()),
            closes: Mutex::new(Vec::new()),
            connections: AtomicUsize::new(0),
            live,
            kick,
        });
        let accept_state = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_conn(accept_state.clone(), stream));
            }
        });
        Self { url, state }
    }

    /// Stores the event and pushes it to every matching open subscription.
    pub fn publish(&self, ev: Event) {
        self.state.events.lock().unwrap().push(ev.clone());
        let _ = self.state.live.send(ev);
    }

    /// Drops every open socket without a close frame.
    pub fn kick(&self) {
        let _ = self.state.kick.send(());
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// `(connection number, subscription id)` for every REQ received.
    pub fn reqs(&self) -> Vec<(usize, String)> {
        self.state.reqs.lock().unwrap().clone()
    }

    pub fn closes(&self) -> Vec<String> {
        self.state.closes.lock().unwrap().clone()
    }
}

async fn send(tx: &mut (impl futures_util::Sink<Message> + Unpin), msg: RelayMessage) -> bool {
    tx.send(Message::Text(msg.to_json())).await.is_ok()
}

async fn serve_conn(state: Arc<RelayState>, stream: tokio::net::TcpStream) {
    if let Some(delay) = state.opts.handshake_delay {
        tokio::time::sleep(delay).await;
    }
    let Ok(ws) = accept_async(stream).await else {
        return;
    };
    let conn_no = state.connections.fetch_add(1, Ordering::SeqCst) + 1;
    let (mut tx, mut rx) = ws.split();
    let mut live = state.live.subscribe();
    let mut kick = state.kick.subscribe();
    let mut subs: HashMap<String, Vec<Filter>> = HashMap::new();
    let challenge = format!("challenge-{conn_no}");
    let mut authed = !state.opts.require_auth;
    if !authed {
        let msg = RelayMessage::Auth { challenge: challenge.clone() };
        if !send(&mut tx, msg).await {
            return;
        }
    }
    loop {
        tokio::select! {
            _ = kick.recv() => return,
            ev = live.recv() => {
                let Ok(ev) = ev else { continue };
                for (id, filters) in &subs {
                    if Filter::matches_any(filters, &ev) {
                        let msg = RelayMessage::Event { subscription_id: id.clone(), event: ev.clone() };
                        if !send(&mut tx, msg).await { return; }
                    }
                }
            }
            msg = rx.next() => {
                let Some(Ok(msg)) = msg else { return };
                let Message::Text(text) = msg else { continue };
                match ClientMessage::from_json(&text) {
                    Ok(ClientMessage::Req { subscription_id, filters }) => {
                        if !authed {
                            let msg = RelayMessage::Closed {
                                subscription_id,
                                message: "auth-required: sign in first".to_string(),
                            };
                            if !send(&mut tx, msg).await { return; }
                            continue;
                        }
                        state.reqs.lock().unwrap().push((conn_no, subscription_id.clone()));
                        if state.opts.garbage_before_events {
                            let _ = tx.send(Message::Text("not json".to_string())).await;
                            let _ = tx.send(Message::Text(r#"["EVENT"]"#.to_string())).await;
                        }
                        let stored: Vec<Event> = state
                            .events
                            .lock()
                            .unwrap()
                            .iter()
                            .filter(|e| Filter::matches_any(&filters, e))
                            .cloned()
                            .collect();
                        for ev in stored {
                            let msg = RelayMessage::Event { subscription_id: subscription_id.clone(), event: ev };
                            if !send(&mut tx, msg).await { return; }
                        }
                        if !state.opts.no_eose {
                            let msg = RelayMessage::Eose { subscription_id: subscription_id.clone() };
                            if !send(&mut tx, msg).await { return; }
                        }
                        subs.insert(subscription_id, filters);
                    }
                    Ok(ClientMessage::Close { subscription_id }) => {
                        subs.remove(&subscription_id);
                        state.closes.lock().unwrap().push(subscription_id);
                    }
                    Ok(ClientMessage::Auth { event }) => {
                        let ok = event.kind == vine_protocol::KIND_CLIENT_AUTH
                            && event.has_tag("challenge", &challenge);
                        authed |= ok;
                        let msg = RelayMessage::Ok {
                            event_id: event.id,
                            accepted: ok,
                            message: String::new(),
                        };
                        if !send(&mut tx, msg).await { return; }
                    }
                    Err(_) => {}
                }
            }
        }
    }
}

#[derive(Clone)]
struct GatewayState {
    events: Arc<Vec<Event>>,
    fail: bool,
    delay: Duration,
    hits: Arc<AtomicUsize>,
    bad_param: Arc<AtomicBool>,
}

pub struct MockGateway {
    pub url: String,
    hits: Arc<AtomicUsize>,
    bad_param: Arc<AtomicBool>,
}

impl MockGateway {
    pub async fn spawn(events: Vec<Event>, fail: bool, delay: Duration) -> Self {
        let hits = Arc::new(AtomicUsize::new(0));
        let bad_param = Arc::new(AtomicBool::new(false));
        let state = GatewayState {
            events: Arc::new(events),
            fail,
            delay,
            hits: hits.clone(),
            bad_param: bad_param.clone(),
        };
        let app = Router::new()
            .route("/query", get(query))
            .route("/event/:id", get(event_by_id))
            .route("/profile/:pubkey", get(profile))
            .with_state(state);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self {
            url,
            hits,
            bad_param,
        }
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn saw_bad_param(&self) -> bool {
        self.bad_param.load(Ordering::SeqCst)
    }
}

fn envelope(events: Vec<Event>) -> Json<GatewayEnvelope> {
    Json(GatewayEnvelope {
        events,
        eose: true,
        complete: true,
        cached: true,
        cache_age_seconds: Some(3),
    })
}

async fn enter(st: &GatewayState) -> Result<(), StatusCode> {
    st.hits.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(st.delay).await;
    if st.fail {
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }
    Ok(())
}

async fn query(
    State(st): State<GatewayState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<GatewayEnvelope>, StatusCode> {
    enter(&st).await?;
    let raw = params.get("filter").cloned().unwrap_or_default();
    let filter = match vine_sync::gateway::decode_filter_param(&raw) {
        Ok(f) => f,
        Err(_) => {
            st.bad_param.store(true, Ordering::SeqCst);
            return Err(StatusCode::BAD_REQUEST);
        }
    };
    let events = st.events.iter().filter(|e| filter.matches(e)).cloned().collect();
    Ok(envelope(events))
}

async fn event_by_id(
    State(st): State<GatewayState>,
    Path(id): Path<String>,
) -> Result<Json<GatewayEnvelope>, StatusCode> {
    enter(&st).await?;
    Ok(envelope(st.events.iter().filter(|e| e.id == id).cloned().collect()))
}

async fn profile(
    State(st): State<GatewayState>,
    Path(pubkey): Path<String>,
) -> Result<Json<GatewayEnvelope>, StatusCode> {
    enter(&st).await?;
    Ok(envelope(
        st.events
            .iter()
            .filter(|e| e.pubkey == pubkey && e.kind == vine_protocol::KIND_METADATA)
            .cloned()
            .collect(),
    ))
}
