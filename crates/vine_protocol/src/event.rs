/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde::{Deserialize, Serialize};

/// Signed, immutable event as carried on the wire.
///
/// `id` is the content hash and the only identity; the engine never checks
/// signatures, it stores and forwards what relays hand it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u16,
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub sig: String,
}

impl Event {
    /// First values of every tag named `key` (`["p", "<pubkey>", ...]` yields `<pubkey>`).
    pub fn tag_values<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |t| t.len() >= 2 && t[0] == key)
            .map(|t| t[1].as_str())
    }

    pub fn has_tag(&self, key: &str, value: &str) -> bool {
        self.tag_values(key).any(|v| v == value)
    }
}
