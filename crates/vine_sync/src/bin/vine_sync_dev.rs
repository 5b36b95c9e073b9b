/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::time::Duration;
use tracing::{info, warn};
use vine_protocol::KIND_SHORT_VIDEO;
use vine_sync::config::default_config_path;
use vine_sync::{Filter, SubscriptionItem, SubscriptionType, SyncConfig, SyncCoordinator};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    vine_sync::init_tracing();

    let cfg = match std::env::args().nth(1) {
        Some(path) => SyncConfig::load(&path)?,
        None => {
            let path = default_config_path()?;
            if path.exists() {
                SyncConfig::load(&path)?
            } else {
                info!("no config at {}, using defaults", path.display());
                SyncConfig::default()
            }
        }
    };
    let limit: usize = std::env::var("VINE_SYNC_LIMIT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(20);

    let coordinator = SyncCoordinator::start(cfg, None).await?;
    let filter = Filter::new().kinds([KIND_SHORT_VIDEO]).limit(limit);
    let mut feed = coordinator
        .subscribe(vec![filter], SubscriptionType::Discovery)
        .await?;
    info!(sub = %feed.id(), "discovery feed open");

    let mut status = tokio::time::interval(Duration::from_secs(30));
    status.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = status.tick() => {
                let m = coordinator.metrics_snapshot().await;
                info!("{}", serde_json::to_string(&m)?);
            }
            item = feed.recv() => match item {
                Some(SubscriptionItem::Event(ev)) => println!("{}", serde_json::to_string(&ev)?),
                Some(SubscriptionItem::BacklogComplete) => info!("backlog complete"),
                None => {
                    warn!("feed ended");
                    break;
                }
            },
        }
    }

    feed.close();
    coordinator.shutdown();
    Ok(())
}
