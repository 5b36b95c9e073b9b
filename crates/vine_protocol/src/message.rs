/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};

use crate::{Event, Filter};

/// Frames sent from the client to a relay.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// `["REQ", subscription_id, filter...]`
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },
    /// `["CLOSE", subscription_id]`
    Close { subscription_id: String },
    /// `["AUTH", signed_event]`
    Auth { event: Event },
}

impl ClientMessage {
    pub fn to_json(&self) -> String {
        let v = match self {
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                let mut arr = vec![json!("REQ"), json!(subscription_id)];
                arr.extend(filters.iter().map(|f| json!(f)));
                Value::Array(arr)
            }
            ClientMessage::Close { subscription_id } => json!(["CLOSE", subscription_id]),
            ClientMessage::Auth { event } => json!(["AUTH", event]),
        };
        v.to_string()
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let arr = parse_array(text)?;
        match frame_tag(&arr)? {
            "REQ" => {
                let subscription_id = str_at(&arr, 1)?;
                let filters = arr[2..]
                    .iter()
                    .map(|v| serde_json::from_value(v.clone()).context("bad filter"))
                    .collect::<Result<Vec<Filter>>>()?;
                Ok(ClientMessage::Req {
                    subscription_id,
                    filters,
                })
            }
            "CLOSE" => Ok(ClientMessage::Close {
                subscription_id: str_at(&arr, 1)?,
            }),
            "AUTH" => Ok(ClientMessage::Auth {
                event: event_at(&arr, 1)?,
            }),
            other => bail!("unknown client frame: {other}"),
        }
    }
}

/// Frames received from a relay.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    /// `["EVENT", subscription_id, event]`
    Event {
        subscription_id: String,
        event: Event,
    },
    /// `["EOSE", subscription_id]`
    Eose { subscription_id: String },
    /// `["NOTICE", message]`
    Notice { message: String },
    /// `["AUTH", challenge]`
    Auth { challenge: String },
    /// `["OK", event_id, accepted, message]`
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    /// `["CLOSED", subscription_id, message]`
    Closed {
        subscription_id: String,
        message: String,
    },
}

impl RelayMessage {
    pub fn from_json(text: &str) -> Result<Self> {
        let arr = parse_array(text)?;
        match frame_tag(&arr)? {
            "EVENT" => Ok(RelayMessage::Event {
                subscription_id: str_at(&arr, 1)?,
                event: event_at(&arr, 2)?,
            }),
            "EOSE" => Ok(RelayMessage::Eose {
                subscription_id: str_at(&arr, 1)?,
            }),
            "NOTICE" => Ok(RelayMessage::Notice {
                message: str_at(&arr, 1)?,
            }),
            "AUTH" => Ok(RelayMessage::Auth {
                challenge: str_at(&arr, 1)?,
            }),
            "OK" => Ok(RelayMessage::Ok {
                event_id: str_at(&arr, 1)?,
                accepted: arr
                    .get(2)
                    .and_then(Value::as_bool)
                    .context("OK frame without status")?,
                message: str_at(&arr, 3).unwrap_or_default(),
            }),
            "CLOSED" => Ok(RelayMessage::Closed {
                subscription_id: str_at(&arr, 1)?,
                message: str_at(&arr, 2).unwrap_or_default(),
            }),
            other => bail!("unknown relay frame: {other}"),
        }
    }

    pub fn to_json(&self) -> String {
        let v = match self {
            RelayMessage::Event {
                subscription_id,
                event,
            } => json!(["EVENT", subscription_id, event]),
            RelayMessage::Eose { subscription_id } => json!(["EOSE", subscription_id]),
            RelayMessage::Notice { message } => json!(["NOTICE", message]),
            RelayMessage::Auth { challenge } => json!(["AUTH", challenge]),
            RelayMessage::Ok {
                event_id,
                accepted,
                message,
            } => json!(["OK", event_id, accepted, message]),
            RelayMessage::Closed {
                subscription_id,
                message,
            } => json!(["CLOSED", subscription_id, message]),
        };
        v.to_string()
    }
}

fn parse_array(text: &str) -> Result<Vec<Value>> {
    let v: Value = serde_json::from_str(text).context("frame is not json")?;
    match v {
        Value::Array(arr) => Ok(arr),
        _ => bail!("frame is not a json array"),
    }
}

fn frame_tag(arr: &[Value]) -> Result<&str> {
    arr.first()
        .and_then(Value::as_str)
        .context("frame without type tag")
}

fn str_at(arr: &[Value], idx: usize) -> Result<String> {
    arr.get(idx)
        .and_then(Value::as_str)
        .map(str::to_string)
        .with_context(|| format!("frame field {idx} is not a string"))
}

fn event_at(arr: &[Value], idx: usize) -> Result<Event> {
    let v = arr
        .get(idx)
        .cloned()
        .with_context(|| format!("frame field {idx} missing"))?;
    serde_json::from_value(v).context("bad event json")
}
