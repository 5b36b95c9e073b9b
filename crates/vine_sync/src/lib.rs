/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

pub mod backoff;
pub mod blocklist;
pub mod config;
pub mod coordinator;
pub mod event_store;
pub mod gateway;
pub mod handoff;
pub mod net_metrics;
pub mod relay_conn;
pub mod relay_migration;
pub mod relay_pool;
pub mod signer;
pub mod subscription_registry;

pub use config::{SubscriptionType, SyncConfig};
pub use coordinator::{FeedState, FeedSubscription, SyncCoordinator, SyncMetrics};
pub use subscription_registry::SubscriptionItem;
pub use vine_protocol::{Event, Filter};

/// Installs the fmt subscriber with `RUST_LOG` support; later calls are no-ops.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().unwrap()),
        )
        .try_init()
        .ok();
}
