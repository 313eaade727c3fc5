// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Bounded-capacity publish/subscribe event bus for swarm lifecycle and
//! network events.
//!
//! The UI must never backpressure the orchestrator: publishing is always
//! non-blocking, and a subscriber that falls behind simply loses the oldest
//! events it hasn't read yet. Closed-channel reads are the UI's termination
//! signal.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::warn;

/// How often (in dropped events) to log a warning, to avoid log storms
/// under sustained subscriber lag.
const DROP_LOG_INTERVAL: u64 = 100;

/// The kind of lifecycle/network event published on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    StateChanged,
    TurnStarted,
    TurnCompleted,
    NetworkBusy,
    NetworkIdle,
    ToolCalled,
    ToolResult,
    Error,
    Shutdown,
}

/// One published event.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub mysis_id: Option<String>,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(kind: EventKind, mysis_id: Option<String>, data: Value) -> Self {
        Self {
            kind,
            mysis_id,
            data,
            timestamp: Utc::now(),
        }
    }
}

/// Fan-out publish/subscribe bus. Cheaply `Clone`-able; all clones share the
/// same underlying channel and drop counter.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    dropped: Arc<AtomicU64>,
}

impl EventBus {
    /// `capacity` is the per-subscriber buffer size before the oldest
    /// unread event for that subscriber is dropped.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Subscribe, obtaining a receiver that observes every event published
    /// from this point forward.
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            rx: self.tx.subscribe(),
            dropped: self.dropped.clone(),
        }
    }

    /// Publish an event to all current subscribers. Never blocks: a
    /// subscriber with a full buffer loses its oldest unread event instead.
    pub fn publish(&self, event: Event) {
        // send() only errs when there are zero receivers, which is not an
        // error condition for a bus nobody is currently listening to.
        let _ = self.tx.send(event);
    }

    /// Total events dropped across all subscribers so far.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Closing the bus is implicit: once every `EventBus`/`EventReceiver`
    /// clone is dropped, the channel closes and subscriber reads return
    /// `None`. Exposed as an explicit no-op for callers that model an
    /// explicit close step (idempotent, safe to call from multiple places).
    pub fn close(&self) {}
}

/// A single subscriber's read handle.
pub struct EventReceiver {
    rx: broadcast::Receiver<Event>,
    dropped: Arc<AtomicU64>,
}

impl EventReceiver {
    /// Await the next event. Returns `None` once the bus has no more
    /// publishers and the buffered backlog is drained (bus closed).
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    let total = self.dropped.fetch_add(n, Ordering::Relaxed) + n;
                    if total % DROP_LOG_INTERVAL < n {
                        warn!(dropped = total, "event bus subscriber lagging, events dropped");
                    }
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
