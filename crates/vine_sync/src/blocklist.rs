/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Reciprocal blocking: authors whose latest mute list names the local
//! identity are hidden from every feed.

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::{Arc, RwLock},
    time::Duration,
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use vine_protocol::{Event, Filter, KIND_MUTE_LIST};

use crate::backoff::Backoff;
use crate::signer::now_secs;
use crate::subscription_registry::{EventCallback, SubscriptionId, SubscriptionItem};

/// Where the synchronizer gets its events from. Implemented by the coordinator.
#[async_trait]
pub trait SubscriptionHost: Send + Sync {
    fn open_raw(&self, filters: Vec<Filter>, on_event: EventCallback) -> Result<SubscriptionId>;

    fn close_raw(&self, id: &str);

    async fn query_local(&self, filters: Vec<Filter>) -> Result<Vec<Event>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockEntry {
    pub blocked_author: String,
    pub source_author: String,
    pub observed_at: u64,
}

struct MuteList {
    created_at: u64,
    event_id: String,
    observed_at: u64,
    muted: HashSet<String>,
}

/// Latest mute list per author, reduced to what matters for filtering.
pub struct Blocklist {
    local_pubkey: String,
    lists: RwLock<HashMap<String, MuteList>>,
}

impl Blocklist {
    pub fn new(local_pubkey: impl Into<String>) -> Self {
        Self {
            local_pubkey: local_pubkey.into(),
            lists: RwLock::new(HashMap::new()),
        }
    }

    pub fn local_pubkey(&self) -> &str {
        &self.local_pubkey
    }

    /// Applies a mute-list event if it is newer than the one held for its
    /// author. Returns whether that author's blocking status changed.
    pub fn apply(&self, event: &Event) -> bool {
        if event.kind != KIND_MUTE_LIST {
            return false;
        }
        let mut lists = self.lists.write().unwrap();
        if let Some(cur) = lists.get(&event.pubkey) {
            // Same second: the lowest id is the one relays keep.
            let newer = event.created_at > cur.created_at
                || (event.created_at == cur.created_at && event.id < cur.event_id);
            if !newer {
                return false;
            }
        }
        let was = lists
            .get(&event.pubkey)
            .map(|l| l.muted.contains(&self.local_pubkey))
            .unwrap_or(false);
        let muted: HashSet<String> = event.tag_values("p").map(str::to_string).collect();
        let now = muted.contains(&self.local_pubkey);
        lists.insert(
            event.pubkey.clone(),
            MuteList {
                created_at: event.created_at,
                event_id: event.id.clone(),
                observed_at: now_secs(),
                muted,
            },
        );
        if was != now {
            info!(author = %event.pubkey, blocked = now, "reciprocal block updated");
        }
        was != now
    }

    pub fn should_filter(&self, author: &str) -> bool {
        if author == self.local_pubkey {
            return false;
        }
        self.lists
            .read()
            .unwrap()
            .get(author)
            .map(|l| l.muted.contains(&self.local_pubkey))
            .unwrap_or(false)
    }

    /// Authors currently blocking the local identity, sorted.
    pub fn blockers(&self) -> BTreeSet<String> {
        self.lists
            .read()
            .unwrap()
            .iter()
            .filter(|(_, l)| l.muted.contains(&self.local_pubkey))
            .map(|(a, _)| a.clone())
            .collect()
    }

    pub fn entries(&self) -> Vec<BlockEntry> {
        let lists = self.lists.read().unwrap();
        let mut out: Vec<BlockEntry> = lists
            .iter()
            .filter(|(_, l)| l.muted.contains(&self.local_pubkey))
            .map(|(source, l)| BlockEntry {
                blocked_author: self.local_pubkey.clone(),
                source_author: source.clone(),
                observed_at: l.observed_at,
            })
            .collect();
        out.sort_by(|a, b| a.source_author.cmp(&b.source_author));
        out
    }

    /// Lists naming us, plus the current lists of known blockers so that a
    /// republished list without our tag is seen.
    pub fn filters(&self) -> Vec<Filter> {
        let mut filters = vec![Filter::new()
            .kinds([KIND_MUTE_LIST])
            .tag('p', [self.local_pubkey.clone()])];
        let blockers = self.blockers();
        if !blockers.is_empty() {
            filters.push(Filter::new().kinds([KIND_MUTE_LIST]).authors(blockers));
        }
        filters
    }
}

pub struct BlocklistSynchronizer {
    blocklist: Arc<Blocklist>,
    shutdown_tx: watch::Sender<bool>,
}

impl BlocklistSynchronizer {
    /// Seeds from the local store, then keeps the mute-list subscription
    /// open in the background until `stop`.
    pub async fn start(local_pubkey: &str, host: Arc<dyn SubscriptionHost>) -> Self {
        let blocklist = Arc::new(Blocklist::new(local_pubkey));
        match host.query_local(blocklist.filters()).await {
            Ok(events) => {
                for ev in &events {
                    blocklist.apply(ev);
                }
                // Lists of blockers found above may have been superseded.
                if let Ok(events) = host.query_local(blocklist.filters()).await {
                    for ev in &events {
                        blocklist.apply(ev);
                    }
                }
                debug!(blockers = blocklist.blockers().len(), "blocklist seeded");
            }
            Err(e) => warn!("blocklist seed from store failed: {e:#}"),
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(run_loop(blocklist.clone(), host, shutdown_rx));
        Self {
            blocklist,
            shutdown_tx,
        }
    }

    pub fn blocklist(&self) -> Arc<Blocklist> {
        self.blocklist.clone()
    }

    pub fn should_filter(&self, author: &str) -> bool {
        self.blocklist.should_filter(author)
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for BlocklistSynchronizer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_loop(
    blocklist: Arc<Blocklist>,
    host: Arc<dyn SubscriptionHost>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
    let mut current: Option<(SubscriptionId, BTreeSet<String>)> = None;
    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();

    loop {
        if current.is_none() {
            let blockers = blocklist.blockers();
            let sender = tx.clone();
            let cb: EventCallback = Box::new(move |item| {
                if let SubscriptionItem::Event(ev) = item {
                    let _ = sender.send(ev);
                }
            });
            match host.open_raw(blocklist.filters(), cb) {
                Ok(id) => {
                    debug!(sub = %id, blockers = blockers.len(), "mute-list subscription open");
                    backoff.reset();
                    current = Some((id, blockers));
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!("mute-list subscription failed, retry in {delay:?}: {e:#}");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => continue,
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() { break; }
                            continue;
                        }
                    }
                }
            }
        }

        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() { break; }
            }
            ev = rx.recv() => {
                let Some(ev) = ev else { break };
                blocklist.apply(&ev);
                let blockers = blocklist.blockers();
                let stale = current.as_ref().map(|(_, b)| *b != blockers).unwrap_or(true);
                if stale {
                    if let Some((id, _)) = current.take() {
                        host.close_raw(&id);
                    }
                }
            }
        }
    }

    if let Some((id, _)) = current.take() {
        host.close_raw(&id);
    }
    debug!("blocklist synchronizer stopped");
}
