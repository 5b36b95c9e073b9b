/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::Result;
use async_trait::async_trait;
use vine_protocol::{Event, KIND_CLIENT_AUTH};

/// Event body handed to a [`Signer`]; the signer fills in `id` and `sig`.
#[derive(Debug, Clone, PartialEq)]
pub struct UnsignedEvent {
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

/// "Sign this" capability supplied by the key holder. Relays that send an
/// auth challenge are only answered when one is configured.
#[async_trait]
pub trait Signer: Send + Sync {
    fn public_key(&self) -> String;

    async fn sign(&self, unsigned: UnsignedEvent) -> Result<Event>;
}

/// Challenge-response body for relay authentication.
pub fn auth_event(pubkey: &str, relay_url: &str, challenge: &str) -> UnsignedEvent {
    UnsignedEvent {
        pubkey: pubkey.to_string(),
        created_at: now_secs(),
        kind: KIND_CLIENT_AUTH,
        tags: vec![
            vec!["relay".to_string(), relay_url.to_string()],
            vec!["challenge".to_string(), challenge.to_string()],
        ],
        content: String::new(),
    }
}

pub(crate) fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
