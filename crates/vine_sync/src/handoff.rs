/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::Notify;

/// Bounded queue between a socket loop and its consumer.
///
/// `push` never waits: when full it evicts the oldest droppable item (or the
/// oldest item if none is droppable), so a slow consumer can never stall the
/// producer.
pub struct HandoffQueue<T> {
    items: Mutex<VecDeque<T>>,
    notify: Notify,
    capacity: usize,
    droppable: fn(&T) -> bool,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl<T> HandoffQueue<T> {
    pub fn new(capacity: usize, droppable: fn(&T) -> bool) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            notify: Notify::new(),
            capacity,
            droppable,
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Returns `true` if an older item had to be evicted.
    pub fn push(&self, item: T) -> bool {
        let evicted = {
            let mut q = self.items.lock().unwrap();
            let evicted = if q.len() >= self.capacity {
                match q.iter().position(|i| (self.droppable)(i)) {
                    Some(idx) => {
                        q.remove(idx);
                    }
                    None => {
                        q.pop_front();
                    }
                }
                true
            } else {
                false
            };
            q.push_back(item);
            evicted
        };
        if evicted {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        evicted
    }

    /// Waits for at least one item and returns up to `max` of them, oldest
    /// first. `None` once the queue is closed and drained.
    pub async fn pop_batch(&self, max: usize) -> Option<Vec<T>> {
        loop {
            {
                let mut q = self.items.lock().unwrap();
                if !q.is_empty() {
                    let n = q.len().min(max.max(1));
                    return Some(q.drain(..n).collect());
                }
                if self.closed.load(Ordering::Acquire) {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Oldest item without waiting.
    pub fn try_pop(&self) -> Option<T> {
        self.items.lock().unwrap().pop_front()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
