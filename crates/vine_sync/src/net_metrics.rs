/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Counters for one relay connection; shared between its socket loop and `status()`.
#[derive(Default)]
pub struct RelayMetrics {
    pub rx_bytes: AtomicU64,
    pub tx_bytes: AtomicU64,
    pub events_rx: AtomicU64,
    pub frames_malformed: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub connects: AtomicU64,
    pub disconnects: AtomicU64,
    pub rtt_ema_ms: AtomicU64,
    pub last_change_ms: AtomicU64,
    last_error: Mutex<Option<String>>,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct RelayMetricsSnapshot {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub events_rx: u64,
    pub frames_malformed: u64,
    pub frames_dropped: u64,
    pub connects: u64,
    pub disconnects: u64,
    pub rtt_ms: u64,
    pub last_change_ms: u64,
    pub last_error: Option<String>,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connected(&self) {
        self.connects.fetch_add(1, Ordering::Relaxed);
        self.last_change_ms.store(now_ms(), Ordering::Relaxed);
        let mut g = self.last_error.lock().unwrap();
        *g = None;
    }

    pub fn disconnected(&self, err: Option<String>) {
        self.disconnects.fetch_add(1, Ordering::Relaxed);
        self.last_change_ms.store(now_ms(), Ordering::Relaxed);
        if let Some(err) = err {
            let mut g = self.last_error.lock().unwrap();
            *g = Some(err);
        }
    }

    pub fn rx_add(&self, n: u64) {
        self.rx_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn tx_add(&self, n: u64) {
        self.tx_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn event_rx(&self) {
        self.events_rx.fetch_add(1, Ordering::Relaxed);
    }

    pub fn malformed(&self) {
        self.frames_malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rtt_update(&self, ms: u64) {
        if ms == 0 {
            return;
        }
        let prev = self.rtt_ema_ms.load(Ordering::Relaxed);
        let next = if prev == 0 {
            ms
        } else {
            (prev.saturating_mul(7).saturating_add(ms)) / 8
        };
        self.rtt_ema_ms.store(next, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RelayMetricsSnapshot {
        RelayMetricsSnapshot {
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            events_rx: self.events_rx.load(Ordering::Relaxed),
            frames_malformed: self.frames_malformed.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            connects: self.connects.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
            rtt_ms: self.rtt_ema_ms.load(Ordering::Relaxed),
            last_change_ms: self.last_change_ms.load(Ordering::Relaxed),
            last_error: self.last_error.lock().unwrap().clone(),
        }
    }
}
