/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Wire and data types shared by the sync engine: signed events, filters,
//! relay frames and the HTTP gateway envelope.

mod event;
mod filter;
mod message;

pub use event::Event;
pub use filter::Filter;
pub use message::{ClientMessage, RelayMessage};

use serde::{Deserialize, Serialize};

pub const KIND_METADATA: u16 = 0;
pub const KIND_TEXT_NOTE: u16 = 1;
pub const KIND_CONTACTS: u16 = 3;
pub const KIND_REPOST: u16 = 6;
pub const KIND_REACTION: u16 = 7;
pub const KIND_MUTE_LIST: u16 = 10000;
pub const KIND_CLIENT_AUTH: u16 = 22242;
/// Addressable short-form video.
pub const KIND_SHORT_VIDEO: u16 = 34236;

/// Response body of every gateway endpoint (`/query`, `/profile/{pubkey}`, `/event/{id}`).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GatewayEnvelope {
    #[serde(default)]
    pub events: Vec<Event>,
    #[serde(default)]
    pub eose: bool,
    #[serde(default)]
    pub complete: bool,
    #[serde(default)]
    pub cached: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_age_seconds: Option<u64>,
}
