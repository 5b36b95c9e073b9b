/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{bail, Result};
use serde::Serialize;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};
use vine_protocol::Filter;

use crate::config::RelayConfig;
use crate::net_metrics::RelayMetricsSnapshot;
use crate::relay_conn::{
    spawn_connection, ConnShared, ConnectionState, PoolShared, RelayCommand, RelayListener,
};
use crate::signer::Signer;
use crate::subscription_registry::SubscriptionId;

#[derive(Debug, Clone, Serialize)]
pub struct RelayStatus {
    pub url: String,
    pub state: ConnectionState,
    pub pending_subscriptions: usize,
    pub queued_frames: usize,
    pub metrics: RelayMetricsSnapshot,
}

struct RelayHandle {
    conn: Arc<ConnShared>,
    cmd_tx: mpsc::UnboundedSender<RelayCommand>,
    shutdown_tx: watch::Sender<bool>,
}

/// Set of relay connections sharing one set of open subscriptions.
pub struct RelayPool {
    shared: Arc<PoolShared>,
    relays: Mutex<HashMap<String, RelayHandle>>,
}

impl RelayPool {
    pub fn new(
        cfg: RelayConfig,
        listener: Arc<dyn RelayListener>,
        signer: Option<Arc<dyn Signer>>,
    ) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                active: RwLock::new(HashMap::new()),
                listener,
                signer,
                cfg,
            }),
            relays: Mutex::new(HashMap::new()),
        }
    }

    /// Starts a connection task for `url`. Returns the normalized url, or
    /// `None` if it was already in the pool.
    pub fn add_relay(&self, url: &str) -> Result<Option<String>> {
        let url = normalize_relay_url(url)?;
        let mut relays = self.relays.lock().unwrap();
        if relays.contains_key(&url) {
            return Ok(None);
        }
        let conn = Arc::new(ConnShared::new(url.clone(), &self.shared.cfg));
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        spawn_connection(conn.clone(), self.shared.clone(), cmd_rx, shutdown_rx);
        relays.insert(
            url.clone(),
            RelayHandle {
                conn,
                cmd_tx,
                shutdown_tx,
            },
        );
        info!(relay = %url, "relay added");
        Ok(Some(url))
    }

    pub fn remove_relay(&self, url: &str) -> bool {
        let Ok(url) = normalize_relay_url(url) else {
            return false;
        };
        let handle = self.relays.lock().unwrap().remove(&url);
        match handle {
            Some(h) => {
                let _ = h.shutdown_tx.send(true);
                info!(relay = %url, "relay removed");
                true
            }
            None => false,
        }
    }

    /// Records the subscription as open and sends it to every relay that is
    /// currently connected; the others pick it up when they (re)connect.
    pub fn forward(&self, id: &str, filters: Vec<Filter>) {
        self.shared
            .active
            .write()
            .unwrap()
            .insert(id.to_string(), filters);
        let relays = self.relays.lock().unwrap();
        for h in relays.values() {
            let _ = h.cmd_tx.send(RelayCommand::Forward(id.to_string()));
        }
    }

    /// Forgets the subscription and queues CLOSE for every relay carrying it.
    pub fn close_subscription(&self, id: &str) -> bool {
        let removed = self.shared.active.write().unwrap().remove(id).is_some();
        if removed {
            let relays = self.relays.lock().unwrap();
            for h in relays.values() {
                let _ = h.cmd_tx.send(RelayCommand::Close(id.to_string()));
            }
            debug!(sub = %id, "subscription closed on relays");
        }
        removed
    }

    pub fn active_subscriptions(&self) -> Vec<SubscriptionId> {
        self.shared.active.read().unwrap().keys().cloned().collect()
    }

    pub fn relay_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = self.relays.lock().unwrap().keys().cloned().collect();
        urls.sort();
        urls
    }

    pub fn contains(&self, url: &str) -> bool {
        match normalize_relay_url(url) {
            Ok(url) => self.relays.lock().unwrap().contains_key(&url),
            Err(_) => false,
        }
    }

    pub fn status(&self) -> Vec<RelayStatus> {
        let relays = self.relays.lock().unwrap();
        let mut out: Vec<RelayStatus> = relays
            .values()
            .map(|h| RelayStatus {
                url: h.conn.url.clone(),
                state: *h.conn.state.borrow(),
                pending_subscriptions: h.conn.pending.lock().unwrap().len(),
                queued_frames: h.conn.queue.len(),
                metrics: h.conn.metrics.snapshot(),
            })
            .collect();
        out.sort_by(|a, b| a.url.cmp(&b.url));
        out
    }

    pub fn state_of(&self, url: &str) -> Option<ConnectionState> {
        let url = normalize_relay_url(url).ok()?;
        let relays = self.relays.lock().unwrap();
        relays.get(&url).map(|h| *h.conn.state.borrow())
    }

    /// Waits until `url` reports an open connection, up to `timeout`.
    pub async fn wait_connected(&self, url: &str, timeout: Duration) -> bool {
        let Ok(url) = normalize_relay_url(url) else {
            return false;
        };
        let mut rx = {
            let relays = self.relays.lock().unwrap();
            match relays.get(&url) {
                Some(h) => h.conn.state.subscribe(),
                None => return false,
            }
        };
        tokio::time::timeout(timeout, rx.wait_for(|s| s.is_open()))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    pub fn shutdown(&self) {
        let handles: Vec<(String, RelayHandle)> =
            self.relays.lock().unwrap().drain().collect();
        for (url, h) in handles {
            let _ = h.shutdown_tx.send(true);
            debug!(relay = %url, "relay shutdown requested");
        }
        self.shared.active.write().unwrap().clear();
    }
}

impl Drop for RelayPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub fn normalize_relay_url(url: &str) -> Result<String> {
    let url = url.trim().trim_end_matches('/');
    let lower = url.to_ascii_lowercase();
    let Some(rest) = lower
        .strip_prefix("wss://")
        .or_else(|| lower.strip_prefix("ws://"))
    else {
        bail!("relay url must start with ws:// or wss://: {url}");
    };
    if rest.is_empty() {
        bail!("relay url has no host: {url}");
    }
    let scheme_len = lower.len() - rest.len();
    Ok(format!("{}{}", &lower[..scheme_len], &url[scheme_len..]))
}
