//! Presence channel contract and the in-process reference broker.
//!
//! A channel is a broadcast group keyed by (group, key): every subscriber
//! on the same pair receives every published frame, including its own.
//! Frames are raw JSON values; the protocol layer validates them into
//! typed messages, so alternative backends stay payload-agnostic.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::PresenceError;

// ═══════════════════════════════════════════════════════════════
// Contract
// ═══════════════════════════════════════════════════════════════

/// A broker of presence broadcast groups.
///
/// Implementations must tolerate concurrent join/publish/receive/leave
/// from arbitrarily many sessions on the same key.
pub trait PresenceChannel: Send + Sync {
    type Subscription: Subscription;

    /// Register a new subscriber under (group, key). The returned handle
    /// is good for exactly this caller.
    fn join(
        &self,
        group: &str,
        key: &str,
    ) -> impl Future<Output = Result<Self::Subscription, PresenceError>> + Send;
}

/// One subscriber's handle on a broadcast group.
pub trait Subscription: Send {
    /// Deliver `frame` to every subscriber on the same (group, key),
    /// including this one. No acknowledgement.
    fn publish(&self, frame: Value) -> impl Future<Output = Result<(), PresenceError>> + Send;

    /// Next frame addressed to this subscriber, FIFO. `None` means the
    /// broker is gone and no further frames will arrive.
    fn receive(&mut self) -> impl Future<Output = Option<Value>> + Send;

    /// Deregister. Subsequent publishes to the group no longer reach
    /// this subscriber.
    fn leave(self) -> impl Future<Output = ()> + Send;
}

// ═══════════════════════════════════════════════════════════════
// In-process broker
// ═══════════════════════════════════════════════════════════════

type GroupKey = (String, String);

/// In-process fan-out broker: one FIFO queue per (group, key, subscriber).
///
/// Explicitly constructed and cloneable; clones share one registry, and
/// the registry lives exactly as long as its handles. A production
/// deployment would put an external-broker implementation of
/// [`PresenceChannel`] in its place.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Shared>,
}

#[derive(Debug, Default)]
struct Shared {
    groups: DashMap<GroupKey, HashMap<u64, mpsc::UnboundedSender<Value>>>,
    next_subscriber: AtomicU64,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PresenceChannel for MemoryBroker {
    type Subscription = MemorySubscription;

    async fn join(&self, group: &str, key: &str) -> Result<MemorySubscription, PresenceError> {
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let group_key = (group.to_string(), key.to_string());
        self.inner
            .groups
            .entry(group_key.clone())
            .or_default()
            .insert(id, tx);
        Ok(MemorySubscription {
            shared: Arc::clone(&self.inner),
            group_key,
            id,
            rx,
        })
    }
}

pub struct MemorySubscription {
    shared: Arc<Shared>,
    group_key: GroupKey,
    id: u64,
    rx: mpsc::UnboundedReceiver<Value>,
}

impl Subscription for MemorySubscription {
    async fn publish(&self, frame: Value) -> Result<(), PresenceError> {
        if let Some(subscribers) = self.shared.groups.get(&self.group_key) {
            for tx in subscribers.values() {
                // A closed queue means that subscriber is mid-leave.
                let _ = tx.send(frame.clone());
            }
        }
        Ok(())
    }

    async fn receive(&mut self) -> Option<Value> {
        self.rx.recv().await
    }

    async fn leave(self) {
        if let Some(mut subscribers) = self.shared.groups.get_mut(&self.group_key) {
            subscribers.remove(&self.id);
        }
        self.shared
            .groups
            .remove_if(&self.group_key, |_, subscribers| subscribers.is_empty());
    }
}

// ═══════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════
