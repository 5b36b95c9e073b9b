/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::Deserialize;
use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_RELAY: &str = "wss://relay.divine.video";
/// Defaults shipped by earlier releases, migrated away from once.
pub const DEPRECATED_DEFAULT_RELAYS: &[&str] = &["wss://relay3.openvine.co", "wss://vine.hol.is"];

/// Kind of logical subscription, used to decide gateway eligibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionType {
    Discovery,
    Trending,
    Hashtag,
    Profile,
    VideoDetail,
    HomeFeed,
    Notifications,
    MuteList,
}

impl SubscriptionType {
    /// Personalized feeds are never served from the shared cache.
    pub fn is_personalized(self) -> bool {
        matches!(
            self,
            SubscriptionType::HomeFeed
                | SubscriptionType::Notifications
                | SubscriptionType::MuteList
        )
    }
}

fn default_cacheable_types() -> HashSet<SubscriptionType> {
    [
        SubscriptionType::Discovery,
        SubscriptionType::Trending,
        SubscriptionType::Hashtag,
        SubscriptionType::Profile,
        SubscriptionType::VideoDetail,
    ]
    .into_iter()
    .collect()
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub relays: Vec<String>,
    pub default_relay: String,
    pub deprecated_relays: Vec<String>,
    /// Hex pubkey of the signed-in identity; enables the reciprocal blocklist.
    pub local_pubkey: Option<String>,
    pub data_dir: Option<String>,
    pub store: StoreConfig,
    pub registry: RegistryConfig,
    pub relay: RelayConfig,
    pub gateway: GatewayConfig,
    pub cacheable_types: HashSet<SubscriptionType>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            relays: vec![DEFAULT_RELAY.to_string()],
            default_relay: DEFAULT_RELAY.to_string(),
            deprecated_relays: DEPRECATED_DEFAULT_RELAYS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            local_pubkey: None,
            data_dir: None,
            store: StoreConfig::default(),
            registry: RegistryConfig::default(),
            relay: RelayConfig::default(),
            gateway: GatewayConfig::default(),
            cacheable_types: default_cacheable_types(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Retention cap; `None` keeps everything.
    pub max_events: Option<u64>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub eose_timeout_ms: u64,
    pub seen_capacity: usize,
    /// Items buffered per feed for a caller that is not reading; the oldest
    /// events are dropped past this.
    pub feed_buffer: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            eose_timeout_ms: 4_000,
            seen_capacity: 10_000,
            feed_buffer: 2_048,
        }
    }
}

impl RegistryConfig {
    pub fn eose_timeout(&self) -> Duration {
        Duration::from_millis(self.eose_timeout_ms.clamp(50, 30_000))
    }

    pub fn feed_buffer(&self) -> usize {
        self.feed_buffer.clamp(16, 65_536)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub connect_timeout_secs: u64,
    pub ping_interval_secs: u64,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub handoff_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            ping_interval_secs: 30,
            backoff_initial_ms: 1_000,
            backoff_max_ms: 30_000,
            handoff_capacity: 1_024,
        }
    }
}

impl RelayConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.clamp(1, 120))
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.clamp(5, 600))
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms.clamp(10, 60_000))
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms.max(self.backoff_initial_ms).clamp(10, 600_000))
    }

    pub fn handoff_capacity(&self) -> usize {
        self.handoff_capacity.clamp(16, 65_536)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub enabled: bool,
    pub url: String,
    /// The operator relay the gateway fronts; acceleration only applies while it is in the relay set.
    pub accelerator_relay: String,
    pub timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: "https://gateway.divine.video".to_string(),
            accelerator_relay: DEFAULT_RELAY.to_string(),
            timeout_ms: 1_500,
        }
    }
}

impl GatewayConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.clamp(100, 30_000))
    }
}

impl SyncConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config: {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("parse config: {}", path.display()))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let cfg: SyncConfig = serde_json::from_str(raw)?;
        Ok(cfg)
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        match self.data_dir.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(dir) => Ok(PathBuf::from(dir)),
            None => default_data_dir(),
        }
    }

    pub fn is_cacheable(&self, ty: SubscriptionType) -> bool {
        !ty.is_personalized() && self.cacheable_types.contains(&ty)
    }
}

pub fn default_data_dir() -> Result<PathBuf> {
    if let Ok(v) = std::env::var("VINE_SYNC_DATA_DIR") {
        return Ok(PathBuf::from(v));
    }
    let proj = ProjectDirs::from("video", "divine", "VineSync")
        .context("unable to determine platform data dir")?;
    Ok(proj.data_local_dir().to_path_buf())
}

pub fn default_config_path() -> Result<PathBuf> {
    let proj = ProjectDirs::from("video", "divine", "VineSync")
        .context("unable to determine platform config dir")?;
    Ok(proj.config_dir().join("config.json"))
}
