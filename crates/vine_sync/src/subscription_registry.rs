/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Open subscriptions, their filters, per-subscription dedup and
//! backlog-complete tracking.
//!
//! Locks here are plain `std::sync` locks and are only ever held for
//! in-memory work; nothing in this module touches disk or network.

use rand::{rngs::OsRng, RngCore};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, RwLock, Weak},
    time::{Duration, Instant},
};
use tokio::task::JoinHandle;
use tracing::debug;
use vine_protocol::{Event, Filter};

use crate::config::RegistryConfig;

pub type SubscriptionId = String;

#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionItem {
    Event(Event),
    /// Historical backlog finished: every relay sent EOSE or the deadline passed.
    BacklogComplete,
}

/// Owner callback. Runs while the subscription's delivery lock is held, so it
/// must be quick and must not call back into `close` for the same id.
pub type EventCallback = Box<dyn Fn(SubscriptionItem) + Send + Sync>;

/// Checked before an event counts as delivered. A rejected event is not
/// remembered, so it can still be delivered once the gate lets it through.
pub type DeliveryGate = Box<dyn Fn(&Event) -> bool + Send + Sync>;

pub struct SubscriptionRegistry {
    subs: RwLock<HashMap<SubscriptionId, Arc<Entry>>>,
    eose_timeout: Duration,
    seen_capacity: usize,
}

struct Entry {
    id: SubscriptionId,
    filters: Vec<Filter>,
    created_at: Instant,
    delivery: Mutex<Delivery>,
    backlog: Mutex<Backlog>,
    deadline: Mutex<Option<JoinHandle<()>>>,
}

struct Delivery {
    callback: Option<EventCallback>,
    gate: Option<DeliveryGate>,
    seen: SeenSet,
}

#[derive(Default)]
struct Backlog {
    relays: HashSet<String>,
    eose: HashSet<String>,
    complete: bool,
}

/// FIFO-bounded set of delivered ids.
struct SeenSet {
    ids: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl SeenSet {
    fn new(capacity: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
        self.ids.insert(id.to_string());
        self.order.push_back(id.to_string());
        true
    }
}

impl Entry {
    fn deliver(&self, event: &Event) -> bool {
        let mut d = self.delivery.lock().unwrap();
        if d.callback.is_none() {
            return false;
        }
        if let Some(gate) = d.gate.as_ref() {
            if !gate(event) {
                return false;
            }
        }
        if !d.seen.insert(&event.id) {
            return false;
        }
        if let Some(cb) = d.callback.as_ref() {
            cb(SubscriptionItem::Event(event.clone()));
        }
        true
    }

    fn finish_backlog(&self, reason: &str) {
        {
            let mut b = self.backlog.lock().unwrap();
            if b.complete {
                return;
            }
            b.complete = true;
        }
        debug!(sub = %self.id, reason, elapsed_ms = self.created_at.elapsed().as_millis() as u64, "backlog complete");
        let d = self.delivery.lock().unwrap();
        if let Some(cb) = d.callback.as_ref() {
            cb(SubscriptionItem::BacklogComplete);
        }
    }

    /// Completes when every relay that got the request has sent EOSE.
    fn check_all_eose(&self) {
        let done = {
            let b = self.backlog.lock().unwrap();
            !b.complete && !b.relays.is_empty() && b.relays.iter().all(|r| b.eose.contains(r))
        };
        if done {
            self.finish_backlog("eose");
        }
    }
}

impl SubscriptionRegistry {
    pub fn new(cfg: &RegistryConfig) -> Self {
        Self {
            subs: RwLock::new(HashMap::new()),
            eose_timeout: cfg.eose_timeout(),
            seen_capacity: cfg.seen_capacity,
        }
    }

    /// Registers a subscription and arms its backlog deadline. Must be called
    /// from within a tokio runtime.
    pub fn open(&self, filters: Vec<Filter>, on_event: EventCallback) -> SubscriptionId {
        self.open_gated(filters, None, on_event)
    }

    /// Like `open`, with events passed through `gate` before dedup.
    pub fn open_gated(
        &self,
        filters: Vec<Filter>,
        gate: Option<DeliveryGate>,
        on_event: EventCallback,
    ) -> SubscriptionId {
        let id = new_subscription_id();
        let entry = Arc::new(Entry {
            id: id.clone(),
            filters,
            created_at: Instant::now(),
            delivery: Mutex::new(Delivery {
                callback: Some(on_event),
                gate,
                seen: SeenSet::new(self.seen_capacity),
            }),
            backlog: Mutex::new(Backlog::default()),
            deadline: Mutex::new(None),
        });

        let weak: Weak<Entry> = Arc::downgrade(&entry);
        let timeout = self.eose_timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(entry) = weak.upgrade() {
                entry.finish_backlog("timeout");
            }
        });
        *entry.deadline.lock().unwrap() = Some(timer);

        self.subs.write().unwrap().insert(id.clone(), entry);
        id
    }

    /// After this returns no callback for `id` runs again; an in-flight
    /// callback is waited for.
    pub fn close(&self, id: &str) -> bool {
        let entry = self.subs.write().unwrap().remove(id);
        let Some(entry) = entry else {
            return false;
        };
        if let Some(timer) = entry.deadline.lock().unwrap().take() {
            timer.abort();
        }
        let mut d = entry.delivery.lock().unwrap();
        d.callback = None;
        d.gate = None;
        true
    }

    /// Fans a newly stored event out to every matching subscription; returns
    /// how many subscriptions received it.
    pub fn dispatch(&self, event: &Event) -> usize {
        let matching: Vec<Arc<Entry>> = {
            let subs = self.subs.read().unwrap();
            subs.values()
                .filter(|e| Filter::matches_any(&e.filters, event))
                .cloned()
                .collect()
        };
        matching.iter().filter(|e| e.deliver(event)).count()
    }

    /// Delivers to one subscription only, still honoring its filters and dedup.
    pub fn deliver_to(&self, id: &str, event: &Event) -> bool {
        let Some(entry) = self.get(id) else {
            return false;
        };
        if !Filter::matches_any(&entry.filters, event) {
            return false;
        }
        entry.deliver(event)
    }

    /// A relay was sent the request for `id`; its EOSE is now awaited.
    pub fn expect_eose(&self, id: &str, relay_url: &str) {
        if let Some(entry) = self.get(id) {
            let mut b = entry.backlog.lock().unwrap();
            if !b.complete {
                b.relays.insert(relay_url.to_string());
            }
        }
    }

    pub fn mark_eose(&self, id: &str, relay_url: &str) {
        if let Some(entry) = self.get(id) {
            {
                let mut b = entry.backlog.lock().unwrap();
                b.relays.insert(relay_url.to_string());
                b.eose.insert(relay_url.to_string());
            }
            entry.check_all_eose();
        }
    }

    /// A relay went away; stop waiting for its EOSE on every subscription.
    pub fn relay_lost(&self, relay_url: &str) {
        let entries: Vec<Arc<Entry>> = self.subs.read().unwrap().values().cloned().collect();
        for entry in entries {
            {
                let mut b = entry.backlog.lock().unwrap();
                if b.complete || !b.relays.remove(relay_url) {
                    continue;
                }
                b.eose.remove(relay_url);
            }
            entry.check_all_eose();
        }
    }

    pub fn is_backlog_complete(&self, id: &str) -> bool {
        self.get(id)
            .map(|e| e.backlog.lock().unwrap().complete)
            .unwrap_or(false)
    }

    pub fn filters_of(&self, id: &str) -> Option<Vec<Filter>> {
        self.get(id).map(|e| e.filters.clone())
    }

    pub fn active_ids(&self) -> Vec<SubscriptionId> {
        self.subs.read().unwrap().keys().cloned().collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.subs.read().unwrap().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.subs.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, id: &str) -> Option<Arc<Entry>> {
        self.subs.read().unwrap().get(id).cloned()
    }
}

fn new_subscription_id() -> SubscriptionId {
    // 8 random bytes -> 16 hex chars
    let mut b = [0u8; 8];
    OsRng.fill_bytes(&mut b);
    hex::encode(b)
}
