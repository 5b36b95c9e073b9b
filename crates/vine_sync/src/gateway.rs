/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Read-through HTTP cache in front of the operator relay.
//!
//! Everything here is best effort: any failure is logged at debug level and
//! the caller carries on with relay delivery alone.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use futures_util::future::join_all;
use std::{collections::HashSet, sync::Arc};
use tracing::debug;
use vine_protocol::{Event, Filter, GatewayEnvelope};

use crate::config::{GatewayConfig, SubscriptionType, SyncConfig};
use crate::relay_pool::{normalize_relay_url, RelayPool};

/// Destination for gateway results.
#[async_trait]
pub trait EventImporter: Send + Sync {
    async fn import_events(&self, events: Vec<Event>) -> usize;
}

pub struct GatewayAccelerator {
    cfg: GatewayConfig,
    cacheable_types: HashSet<SubscriptionType>,
    accelerator_relay: Option<String>,
    base_url: String,
    http: reqwest::Client,
    pool: Arc<RelayPool>,
}

impl GatewayAccelerator {
    pub fn new(cfg: &SyncConfig, pool: Arc<RelayPool>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(cfg.gateway.timeout())
            .connect_timeout(cfg.gateway.timeout())
            .user_agent(concat!("vine_sync/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("build gateway http client")?;
        Ok(Self {
            accelerator_relay: normalize_relay_url(&cfg.gateway.accelerator_relay).ok(),
            base_url: cfg.gateway.url.trim().trim_end_matches('/').to_string(),
            cfg: cfg.gateway.clone(),
            cacheable_types: cfg.cacheable_types.clone(),
            http,
            pool,
        })
    }

    /// Enabled, fronting a relay that is actually in use, and the feed is a
    /// shared one.
    pub fn is_eligible(&self, ty: SubscriptionType) -> bool {
        if !self.cfg.enabled || self.base_url.is_empty() {
            return false;
        }
        if ty.is_personalized() || !self.cacheable_types.contains(&ty) {
            return false;
        }
        match self.accelerator_relay.as_deref() {
            Some(url) => self.pool.contains(url),
            None => false,
        }
    }

    /// Fetches every filter from the cache and imports the results. Returns
    /// how many new events were imported; 0 when ineligible or on any failure.
    pub async fn maybe_accelerate(
        &self,
        ty: SubscriptionType,
        filters: &[Filter],
        sink: &dyn EventImporter,
    ) -> usize {
        if filters.is_empty() || !self.is_eligible(ty) {
            return 0;
        }
        let results = join_all(filters.iter().map(|f| self.query(f))).await;
        let mut events = Vec::new();
        for (filter, res) in filters.iter().zip(results) {
            match res {
                Ok(env) => {
                    debug!(
                        count = env.events.len(),
                        cached = env.cached,
                        age = ?env.cache_age_seconds,
                        "gateway query"
                    );
                    events.extend(env.events.into_iter().filter(|e| filter.matches(e)));
                }
                Err(e) => debug!(?ty, "gateway query failed: {e:#}"),
            }
        }
        if events.is_empty() {
            return 0;
        }
        sink.import_events(events).await
    }

    pub async fn fetch_profile(&self, pubkey: &str, sink: &dyn EventImporter) -> Option<Event> {
        self.fetch_single(&format!("profile/{pubkey}"), sink, |e| {
            e.pubkey == pubkey && e.kind == vine_protocol::KIND_METADATA
        })
        .await
    }

    pub async fn fetch_event(&self, id: &str, sink: &dyn EventImporter) -> Option<Event> {
        self.fetch_single(&format!("event/{id}"), sink, |e| e.id == id)
            .await
    }

    async fn fetch_single(
        &self,
        path: &str,
        sink: &dyn EventImporter,
        want: impl Fn(&Event) -> bool,
    ) -> Option<Event> {
        if !self.cfg.enabled || self.base_url.is_empty() {
            return None;
        }
        let env = match self.get(&format!("{}/{path}", self.base_url)).await {
            Ok(env) => env,
            Err(e) => {
                debug!(path, "gateway fetch failed: {e:#}");
                return None;
            }
        };
        let event = env
            .events
            .into_iter()
            .filter(|e| want(e))
            .max_by_key(|e| e.created_at)?;
        sink.import_events(vec![event.clone()]).await;
        Some(event)
    }

    async fn query(&self, filter: &Filter) -> Result<GatewayEnvelope> {
        let json = serde_json::to_vec(filter)?;
        let encoded = URL_SAFE_NO_PAD.encode(json);
        self.get(&format!("{}/query?filter={encoded}", self.base_url))
            .await
    }

    async fn get(&self, url: &str) -> Result<GatewayEnvelope> {
        let resp = self.http.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            bail!("gateway status {status}");
        }
        let env: GatewayEnvelope = resp.json().await.context("decode gateway envelope")?;
        Ok(env)
    }
}

/// Inverse of the query encoding, for servers and tests.
pub fn decode_filter_param(param: &str) -> Result<Filter> {
    let raw = URL_SAFE_NO_PAD
        .decode(param.trim_end_matches('='))
        .context("filter param is not base64url")?;
    Ok(serde_json::from_slice(&raw)?)
}
