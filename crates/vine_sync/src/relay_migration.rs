/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Persisted relay set and the one-time move off retired default relays.

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::SyncConfig;
use crate::event_store::EventStore;
use crate::relay_pool::normalize_relay_url;

const META_RELAY_SET: &str = "relay_set";
const META_DEFAULT_MIGRATED: &str = "relay_default_migration_v1";

/// Replaces retired defaults with `default_relay`. Order is kept, the
/// replacement takes the slot of the first retired entry, and duplicates are
/// dropped. Returns whether anything changed.
pub fn migrate_relays(
    relays: &[String],
    default_relay: &str,
    deprecated: &[String],
) -> (Vec<String>, bool) {
    let is_deprecated = |u: &str| {
        deprecated
            .iter()
            .any(|d| normalize(d).as_deref() == Some(u))
    };
    let default_relay = normalize(default_relay).unwrap_or_else(|| default_relay.to_string());

    let mut out: Vec<String> = Vec::with_capacity(relays.len());
    let mut changed = false;
    for raw in relays {
        let Some(url) = normalize(raw) else {
            warn!(relay = %raw, "dropping invalid relay url");
            changed = true;
            continue;
        };
        let url = if is_deprecated(&url) {
            changed = true;
            default_relay.clone()
        } else {
            url
        };
        if out.contains(&url) {
            changed = true;
            continue;
        }
        out.push(url);
    }
    (out, changed)
}

fn normalize(url: &str) -> Option<String> {
    normalize_relay_url(url).ok()
}

/// Resolves the relay set to connect to at startup. The persisted set wins
/// over the configured one; the retired-default migration runs at most once
/// per data dir.
pub fn load_relay_set(store: Option<&EventStore>, cfg: &SyncConfig) -> Result<Vec<String>> {
    let Some(store) = store else {
        let (relays, _) = migrate_relays(&cfg.relays, &cfg.default_relay, &cfg.deprecated_relays);
        return Ok(relays);
    };

    let persisted: Option<Vec<String>> = match store.get_meta(META_RELAY_SET)? {
        Some(raw) => match serde_json::from_str(&raw) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("ignoring unreadable persisted relay set: {e}");
                None
            }
        },
        None => None,
    };
    let mut relays = persisted.unwrap_or_else(|| cfg.relays.clone());

    if store.get_meta(META_DEFAULT_MIGRATED)?.is_none() {
        let (migrated, changed) =
            migrate_relays(&relays, &cfg.default_relay, &cfg.deprecated_relays);
        if changed {
            info!(before = ?relays, after = ?migrated, "migrated relay set");
        }
        relays = migrated;
        save_relay_set(store, &relays)?;
        store
            .set_meta(META_DEFAULT_MIGRATED, "1")
            .context("persist relay migration flag")?;
    }
    Ok(relays)
}

pub fn save_relay_set(store: &EventStore, relays: &[String]) -> Result<()> {
    let raw = serde_json::to_string(relays)?;
    store
        .set_meta(META_RELAY_SET, &raw)
        .context("persist relay set")
}
