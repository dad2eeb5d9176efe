//! Subscription dispatcher between the transport and the entities.
//!
//! The router is created before any entity and handed to each of them, so
//! the topic → handler table lives in one owned place instead of on the
//! transport. Inbound messages are fed in through [`Router::dispatch`].

use crate::error::Result;
use crate::transport::{Payload, Transport};
use log::{debug, warn};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Callback invoked with the payload of a message on a subscribed topic.
pub type Handler = Arc<dyn Fn(&str) + Send + Sync>;

pub struct Router {
    transport: Arc<dyn Transport>,
    handlers: RwLock<HashMap<String, Vec<Handler>>>,
}

impl Router {
    pub fn new(transport: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            handlers: RwLock::new(HashMap::new()),
        })
    }

    /// Register a handler for `topic`.
    ///
    /// Only the first handler for a topic results in a transport
    /// subscription; later ones fan out from it in registration order.
    pub fn subscribe(&self, topic: &str, handler: Handler) -> Result<()> {
        let first = {
            let mut handlers = self.handlers.write();
            let entry = handlers.entry(topic.to_string()).or_default();
            entry.push(handler);
            entry.len() == 1
        };

        if first {
            debug!("[MQTT] Subscribing to {}", topic);
            self.transport.subscribe(topic)?;
        }
        Ok(())
    }

    pub fn publish(&self, topic: &str, payload: &Payload) -> Result<()> {
        debug!("[MQTT] Message sent on topic {}: {:?}", topic, payload);
        self.transport.publish(topic, payload)
    }

    /// Deliver an inbound message to every handler registered for `topic`.
    ///
    /// Returns the number of handlers invoked.
    pub fn dispatch(&self, topic: &str, payload: &str) -> usize {
        // Handlers may publish or subscribe, so release the lock first.
        let handlers = match self.handlers.read().get(topic) {
            Some(handlers) => handlers.clone(),
            None => {
                warn!("[MQTT] No handler for message on topic {}", topic);
                return 0;
            }
        };

        debug!("[MQTT] Message received on topic {}: {}", topic, payload);
        for handler in &handlers {
            handler(payload);
        }
        handlers.len()
    }

    /// All topics with at least one handler, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.handlers.read().keys().cloned().collect();
        topics.sort();
        topics
    }
}
