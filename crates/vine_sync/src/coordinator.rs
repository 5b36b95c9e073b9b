/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Owns every component and wires them together. One instance per process
//! (or per test); nothing here is global.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, RwLock, Weak,
    },
};
use tokio::sync::{watch, Mutex as TokioMutex};
use tracing::{debug, info, warn};
use vine_protocol::{Event, Filter, KIND_METADATA};

use crate::blocklist::{BlockEntry, Blocklist, BlocklistSynchronizer, SubscriptionHost};
use crate::config::{SubscriptionType, SyncConfig};
use crate::event_store::EventStore;
use crate::gateway::{EventImporter, GatewayAccelerator};
use crate::handoff::HandoffQueue;
use crate::relay_conn::{ConnectionState, Inbound, RelayListener};
use crate::relay_migration;
use crate::relay_pool::{RelayPool, RelayStatus};
use crate::signer::Signer;
use crate::subscription_registry::{
    DeliveryGate, EventCallback, SubscriptionId, SubscriptionItem, SubscriptionRegistry,
};

const PRUNE_EVERY: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedState {
    Created,
    AwaitingGateway,
    LiveStreaming,
    Closed,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncMetrics {
    pub degraded: bool,
    pub events_received: u64,
    pub events_stored: u64,
    pub events_imported: u64,
    pub events_filtered: u64,
    pub feed_events_dropped: u64,
    pub stored_total: Option<u64>,
    pub active_subscriptions: usize,
    pub blockers: usize,
    pub relays: Vec<RelayStatus>,
}

struct CoreInner {
    cfg: SyncConfig,
    store: Option<EventStore>,
    degraded: AtomicBool,
    stopped: AtomicBool,
    registry: SubscriptionRegistry,
    pool: Arc<RelayPool>,
    gateway: Option<GatewayAccelerator>,
    blocklist: Arc<RwLock<Option<Arc<Blocklist>>>>,
    relay_set_lock: TokioMutex<()>,
    since_prune: AtomicU64,
    events_received: AtomicU64,
    events_stored: AtomicU64,
    events_imported: AtomicU64,
    events_filtered: Arc<AtomicU64>,
    feed_events_dropped: Arc<AtomicU64>,
}

/// Result of a store write.
struct Persisted {
    /// Events to fan out: the new ones, or the whole batch without a store.
    fanout: Vec<Event>,
    /// Events actually inserted.
    stored: usize,
}

/// Relay-side view of the core; weak so the pool does not keep it alive.
struct RelayIngest {
    core: Weak<CoreInner>,
}

#[async_trait]
impl RelayListener for RelayIngest {
    async fn on_inbound(&self, relay_url: &str, batch: Vec<Inbound>) {
        if let Some(core) = self.core.upgrade() {
            core.handle_inbound(relay_url, batch).await;
        }
    }

    fn on_forwarded(&self, relay_url: &str, subscription_id: &str) {
        if let Some(core) = self.core.upgrade() {
            core.registry.expect_eose(subscription_id, relay_url);
        }
    }

    fn on_state(&self, relay_url: &str, state: ConnectionState) {
        if state != ConnectionState::Disconnected {
            return;
        }
        if let Some(core) = self.core.upgrade() {
            core.registry.relay_lost(relay_url);
        }
    }
}

impl CoreInner {
    /// Stores what is new. Without a usable store the whole batch is still
    /// fanned out (per-subscription dedup applies) but nothing counts as
    /// stored.
    async fn persist(&self, events: Vec<Event>) -> Persisted {
        let Some(store) = self.store.as_ref() else {
            return Persisted {
                fanout: events,
                stored: 0,
            };
        };
        match store.store_new(events.clone()).await {
            Ok(new) => {
                if self.degraded.swap(false, Ordering::Relaxed) {
                    info!("event store writable again");
                }
                self.events_stored.fetch_add(new.len() as u64, Ordering::Relaxed);
                self.maybe_prune(new.len() as u64);
                Persisted {
                    stored: new.len(),
                    fanout: new,
                }
            }
            Err(e) => {
                if !self.degraded.swap(true, Ordering::Relaxed) {
                    warn!("event store write failed, delivering without persistence: {e:#}");
                }
                Persisted {
                    fanout: events,
                    stored: 0,
                }
            }
        }
    }

    fn maybe_prune(&self, added: u64) {
        let (Some(store), Some(max)) = (self.store.clone(), self.cfg.store.max_events) else {
            return;
        };
        let total = self.since_prune.fetch_add(added, Ordering::Relaxed) + added;
        if total < PRUNE_EVERY {
            return;
        }
        self.since_prune.store(0, Ordering::Relaxed);
        tokio::spawn(async move {
            if let Err(e) = store.prune_to_max(max).await {
                warn!("prune failed: {e:#}");
            }
        });
    }

    async fn handle_inbound(&self, relay_url: &str, batch: Vec<Inbound>) {
        let mut addressed: Vec<(SubscriptionId, Event)> = Vec::new();
        let mut fresh: Vec<Event> = Vec::new();
        let mut ids: HashSet<String> = HashSet::new();
        let mut finished: Vec<SubscriptionId> = Vec::new();
        for item in batch {
            match item {
                Inbound::Event {
                    subscription_id,
                    event,
                } => {
                    if ids.insert(event.id.clone()) {
                        fresh.push(event.clone());
                    }
                    addressed.push((subscription_id, event));
                }
                Inbound::Eose { subscription_id } | Inbound::Closed { subscription_id, .. } => {
                    finished.push(subscription_id)
                }
            }
        }

        if !fresh.is_empty() {
            self.events_received
                .fetch_add(addressed.len() as u64, Ordering::Relaxed);
            for ev in &self.persist(fresh).await.fanout {
                self.registry.dispatch(ev);
            }
        }
        // Already-stored events still reach the subscription that asked for them.
        for (id, ev) in &addressed {
            self.registry.deliver_to(id, ev);
        }
        for id in finished {
            debug!(relay = %relay_url, sub = %id, "eose");
            self.registry.mark_eose(&id, relay_url);
        }
    }

    async fn import(&self, events: Vec<Event>) -> usize {
        let mut ids = HashSet::new();
        let events: Vec<Event> = events
            .into_iter()
            .filter(|e| ids.insert(e.id.clone()))
            .collect();
        if events.is_empty() {
            return 0;
        }
        let persisted = self.persist(events).await;
        self.events_imported
            .fetch_add(persisted.stored as u64, Ordering::Relaxed);
        for ev in &persisted.fanout {
            self.registry.dispatch(ev);
        }
        persisted.stored
    }

    async fn query_store(&self, filters: Vec<Filter>) -> Result<Vec<Event>> {
        match self.store.as_ref() {
            Some(store) => store.query(filters).await,
            None => Ok(Vec::new()),
        }
    }

    fn open_live(
        &self,
        filters: Vec<Filter>,
        gate: Option<DeliveryGate>,
        cb: EventCallback,
    ) -> Result<SubscriptionId> {
        if self.stopped.load(Ordering::Acquire) {
            bail!("sync coordinator is shut down");
        }
        let id = self.registry.open_gated(filters.clone(), gate, cb);
        self.pool.forward(&id, filters);
        Ok(id)
    }

    fn close_live(&self, id: &str) {
        self.pool.close_subscription(id);
        self.registry.close(id);
    }

    async fn persist_relay_set(&self) {
        let Some(store) = self.store.as_ref() else {
            return;
        };
        let _guard = self.relay_set_lock.lock().await;
        if let Err(e) = relay_migration::save_relay_set(store, &self.pool.relay_urls()) {
            warn!("{e:#}");
        }
    }
}

#[async_trait]
impl EventImporter for CoreInner {
    async fn import_events(&self, events: Vec<Event>) -> usize {
        self.import(events).await
    }
}

#[async_trait]
impl SubscriptionHost for CoreInner {
    fn open_raw(&self, filters: Vec<Filter>, on_event: EventCallback) -> Result<SubscriptionId> {
        self.open_live(filters, None, on_event)
    }

    fn close_raw(&self, id: &str) {
        self.close_live(id);
    }

    async fn query_local(&self, filters: Vec<Filter>) -> Result<Vec<Event>> {
        self.query_store(filters).await
    }
}

pub struct SyncCoordinator {
    core: Arc<CoreInner>,
    blocklist: Option<BlocklistSynchronizer>,
}

impl SyncCoordinator {
    /// Opens the store (falling back to in-memory delivery if it cannot),
    /// connects to the relay set and starts the blocklist when the local
    /// identity is known. Relay and gateway availability never fail startup.
    pub async fn start(cfg: SyncConfig, signer: Option<Arc<dyn Signer>>) -> Result<Self> {
        let data_dir = cfg.data_dir()?;
        let store = match EventStore::open(data_dir.join("events.db")) {
            Ok(store) => Some(store),
            Err(e) => {
                warn!("event store unavailable, running without persistence: {e:#}");
                None
            }
        };
        let degraded = store.is_none();

        let core = Arc::new_cyclic(|weak: &Weak<CoreInner>| {
            let listener = Arc::new(RelayIngest { core: weak.clone() });
            let pool = Arc::new(RelayPool::new(cfg.relay.clone(), listener, signer));
            let gateway = match GatewayAccelerator::new(&cfg, pool.clone()) {
                Ok(gw) => Some(gw),
                Err(e) => {
                    warn!("gateway disabled: {e:#}");
                    None
                }
            };
            CoreInner {
                registry: SubscriptionRegistry::new(&cfg.registry),
                cfg,
                store,
                degraded: AtomicBool::new(degraded),
                stopped: AtomicBool::new(false),
                pool,
                gateway,
                blocklist: Arc::new(RwLock::new(None)),
                relay_set_lock: TokioMutex::new(()),
                since_prune: AtomicU64::new(0),
                events_received: AtomicU64::new(0),
                events_stored: AtomicU64::new(0),
                events_imported: AtomicU64::new(0),
                events_filtered: Arc::new(AtomicU64::new(0)),
                feed_events_dropped: Arc::new(AtomicU64::new(0)),
            }
        });

        let relays = match relay_migration::load_relay_set(core.store.as_ref(), &core.cfg) {
            Ok(relays) => relays,
            Err(e) => {
                warn!("relay set unavailable from store, using config: {e:#}");
                relay_migration::migrate_relays(
                    &core.cfg.relays,
                    &core.cfg.default_relay,
                    &core.cfg.deprecated_relays,
                )
                .0
            }
        };
        for url in &relays {
            if let Err(e) = core.pool.add_relay(url) {
                warn!(relay = %url, "skipping relay: {e:#}");
            }
        }

        let blocklist = match core.cfg.local_pubkey.clone().filter(|p| !p.is_empty()) {
            Some(pk) => {
                let host: Arc<dyn SubscriptionHost> = core.clone();
                let sync = BlocklistSynchronizer::start(&pk, host).await;
                *core.blocklist.write().unwrap() = Some(sync.blocklist());
                Some(sync)
            }
            None => None,
        };

        info!(relays = relays.len(), degraded, "sync coordinator started");
        Ok(Self { core, blocklist })
    }

    /// Opens a feed. Local results are delivered before this returns; the
    /// cache (if eligible) and the relays fill in afterwards.
    pub async fn subscribe(
        &self,
        filters: Vec<Filter>,
        ty: SubscriptionType,
    ) -> Result<FeedSubscription> {
        if filters.is_empty() {
            bail!("subscription needs at least one filter");
        }
        let queue = Arc::new(HandoffQueue::new(
            self.core.cfg.registry.feed_buffer(),
            |i: &SubscriptionItem| matches!(i, SubscriptionItem::Event(_)),
        ));
        let (state_tx, _) = watch::channel(FeedState::Created);
        let state = Arc::new(state_tx);

        // Blocked authors are rejected before dedup, so their events can
        // still arrive after an unmute.
        let blocklist = self.core.blocklist.clone();
        let filtered = self.core.events_filtered.clone();
        let gate: DeliveryGate = Box::new(move |ev: &Event| {
            let blocked = blocklist
                .read()
                .unwrap()
                .as_ref()
                .map(|b| b.should_filter(&ev.pubkey))
                .unwrap_or(false);
            if blocked {
                filtered.fetch_add(1, Ordering::Relaxed);
            }
            !blocked
        });

        let sink = FeedSink {
            queue: queue.clone(),
            dropped: self.core.feed_events_dropped.clone(),
        };
        let cb: EventCallback = Box::new(move |item| sink.push(item));

        let id = self.core.open_live(filters.clone(), Some(gate), cb)?;
        debug!(sub = %id, ?ty, "feed opened");

        match self.core.query_store(filters.clone()).await {
            Ok(local) => {
                for ev in &local {
                    self.core.registry.deliver_to(&id, ev);
                }
            }
            Err(e) => warn!(sub = %id, "local backlog unavailable: {e:#}"),
        }

        let eligible = self
            .core
            .gateway
            .as_ref()
            .map(|g| g.is_eligible(ty))
            .unwrap_or(false);
        if eligible {
            advance(&state, FeedState::AwaitingGateway);
            let core = self.core.clone();
            let state = state.clone();
            let timeout = core.cfg.gateway.timeout();
            tokio::spawn(async move {
                if let Some(gw) = core.gateway.as_ref() {
                    let run = gw.maybe_accelerate(ty, &filters, &*core);
                    match tokio::time::timeout(timeout, run).await {
                        Ok(n) => debug!(imported = n, "gateway accelerate"),
                        Err(_) => debug!("gateway accelerate timed out"),
                    }
                }
                advance(&state, FeedState::LiveStreaming);
            });
        } else {
            advance(&state, FeedState::LiveStreaming);
        }

        Ok(FeedSubscription {
            id,
            queue,
            state,
            core: Arc::downgrade(&self.core),
            closed: false,
        })
    }

    /// Bulk-load entry point: stores then fans out what was new.
    pub async fn import_events(&self, events: Vec<Event>) -> usize {
        self.core.import(events).await
    }

    /// Local store first, then the gateway.
    pub async fn fetch_event(&self, id: &str) -> Option<Event> {
        let local = self
            .core
            .query_store(vec![Filter::new().ids([id])])
            .await
            .ok()
            .and_then(|v| v.into_iter().next());
        if local.is_some() {
            return local;
        }
        self.core.gateway.as_ref()?.fetch_event(id, &*self.core).await
    }

    pub async fn fetch_profile(&self, pubkey: &str) -> Option<Event> {
        let filter = Filter::new().authors([pubkey]).kinds([KIND_METADATA]).limit(1);
        let local = self
            .core
            .query_store(vec![filter])
            .await
            .ok()
            .and_then(|v| v.into_iter().next());
        if local.is_some() {
            return local;
        }
        self.core
            .gateway
            .as_ref()?
            .fetch_profile(pubkey, &*self.core)
            .await
    }

    pub async fn query_local(&self, filters: Vec<Filter>) -> Result<Vec<Event>> {
        match self.core.store.as_ref() {
            Some(store) => store.query(filters).await,
            None => bail!("event store unavailable"),
        }
    }

    /// Adds a relay and persists the new set. Returns `false` if it was
    /// already present.
    pub async fn add_relay(&self, url: &str) -> Result<bool> {
        let added = self.core.pool.add_relay(url).context("add relay")?.is_some();
        if added {
            self.core.persist_relay_set().await;
        }
        Ok(added)
    }

    pub async fn remove_relay(&self, url: &str) -> bool {
        let removed = self.core.pool.remove_relay(url);
        if removed {
            if let Ok(url) = crate::relay_pool::normalize_relay_url(url) {
                self.core.registry.relay_lost(&url);
            }
            self.core.persist_relay_set().await;
        }
        removed
    }

    pub fn relay_urls(&self) -> Vec<String> {
        self.core.pool.relay_urls()
    }

    pub fn relay_status(&self) -> Vec<RelayStatus> {
        self.core.pool.status()
    }

    pub async fn wait_relay_connected(&self, url: &str, timeout: std::time::Duration) -> bool {
        self.core.pool.wait_connected(url, timeout).await
    }

    pub fn is_degraded(&self) -> bool {
        self.core.degraded.load(Ordering::Relaxed)
    }

    pub fn should_filter(&self, author: &str) -> bool {
        self.blocklist
            .as_ref()
            .map(|b| b.should_filter(author))
            .unwrap_or(false)
    }

    pub fn block_entries(&self) -> Vec<BlockEntry> {
        self.blocklist
            .as_ref()
            .map(|b| b.blocklist().entries())
            .unwrap_or_default()
    }

    pub async fn metrics_snapshot(&self) -> SyncMetrics {
        let stored_total = match self.core.store.as_ref() {
            Some(store) => store.count().await.ok(),
            None => None,
        };
        SyncMetrics {
            degraded: self.is_degraded(),
            events_received: self.core.events_received.load(Ordering::Relaxed),
            events_stored: self.core.events_stored.load(Ordering::Relaxed),
            events_imported: self.core.events_imported.load(Ordering::Relaxed),
            events_filtered: self.core.events_filtered.load(Ordering::Relaxed),
            feed_events_dropped: self.core.feed_events_dropped.load(Ordering::Relaxed),
            stored_total,
            active_subscriptions: self.core.registry.len(),
            blockers: self
                .blocklist
                .as_ref()
                .map(|b| b.blocklist().blockers().len())
                .unwrap_or(0),
            relays: self.core.pool.status(),
        }
    }

    pub fn shutdown(&self) {
        if self.core.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(b) = self.blocklist.as_ref() {
            b.stop();
        }
        self.core.pool.shutdown();
        for id in self.core.registry.active_ids() {
            self.core.registry.close(&id);
        }
        info!("sync coordinator stopped");
    }
}

impl Drop for SyncCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Moves forward only; `Closed` is terminal.
fn advance(state: &watch::Sender<FeedState>, next: FeedState) {
    state.send_if_modified(|s| {
        let ok = match (*s, next) {
            (FeedState::Closed, _) => false,
            (FeedState::LiveStreaming, FeedState::AwaitingGateway) => false,
            (cur, next) => cur != next,
        };
        if ok {
            *s = next;
        }
        ok
    });
}

/// Producer side of a feed buffer, owned by the registry callback. Dropping
/// it (feed closed or coordinator stopped) ends the feed once drained.
struct FeedSink {
    queue: Arc<HandoffQueue<SubscriptionItem>>,
    dropped: Arc<AtomicU64>,
}

impl FeedSink {
    fn push(&self, item: SubscriptionItem) {
        if self.queue.push(item) {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            let dropped = self.queue.dropped();
            if dropped == 1 || dropped % 500 == 0 {
                warn!(dropped, total, "feed buffer full, dropping oldest events");
            }
        }
    }
}

impl Drop for FeedSink {
    fn drop(&mut self) {
        self.queue.close();
    }
}

/// Handle for one open feed. Dropping it closes the feed.
pub struct FeedSubscription {
    id: SubscriptionId,
    queue: Arc<HandoffQueue<SubscriptionItem>>,
    state: Arc<watch::Sender<FeedState>>,
    core: Weak<CoreInner>,
    closed: bool,
}

impl FeedSubscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> FeedState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<FeedState> {
        self.state.subscribe()
    }

    /// Next event or backlog marker; `None` once closed and drained. A
    /// caller that falls more than `registry.feed_buffer` items behind loses
    /// the oldest events, never the backlog marker.
    pub async fn recv(&mut self) -> Option<SubscriptionItem> {
        self.queue.pop_batch(1).await?.pop()
    }

    pub fn try_recv(&mut self) -> Option<SubscriptionItem> {
        self.queue.try_pop()
    }

    /// Items waiting to be received.
    pub fn buffered(&self) -> usize {
        self.queue.len()
    }

    /// After this returns nothing new is queued for this feed. The CLOSE to
    /// relays is sent in the background.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        advance(&self.state, FeedState::Closed);
        if let Some(core) = self.core.upgrade() {
            core.close_live(&self.id);
        }
        debug!(sub = %self.id, "feed closed");
    }
}

impl Drop for FeedSubscription {
    fn drop(&mut self) {
        self.close();
    }
}
