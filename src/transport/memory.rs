//! In-process transport that records traffic instead of sending it.

use super::{Payload, Transport};
use crate::error::Result;
use parking_lot::Mutex;

/// Transport that keeps every publish and subscription in memory.
///
/// Nothing is delivered back to subscribers; inbound traffic is injected
/// with [`Router::dispatch`](crate::router::Router::dispatch).
#[derive(Debug, Default)]
pub struct MemoryTransport {
    published: Mutex<Vec<(String, Payload)>>,
    subscriptions: Mutex<Vec<String>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// All publishes so far, in order.
    pub fn published(&self) -> Vec<(String, Payload)> {
        self.published.lock().clone()
    }

    /// Payloads published on one topic, in order.
    pub fn messages(&self, topic: &str) -> Vec<Payload> {
        self.published
            .lock()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, p)| p.clone())
            .collect()
    }

    /// Topics the broker was asked to deliver.
    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().clone()
    }

    /// Forget recorded publishes.
    pub fn clear(&self) {
        self.published.lock().clear();
    }
}

impl Transport for MemoryTransport {
    fn publish(&self, topic: &str, payload: &Payload) -> Result<()> {
        self.published
            .lock()
            .push((topic.to_string(), payload.clone()));
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> Result<()> {
        self.subscriptions.lock().push(topic.to_string());
        Ok(())
    }
}
