//! Named MQTT topics.
//!
//! A [`Topic`] has a single owner and carries whatever that owner publishes.
//! A [`SharedTopic`] is a write-only aggregation point: many entities
//! register a named [`ValueSource`] on it and a single `publish` sends all
//! current values as one JSON object.

use crate::error::{HaMqttError, Result};
use crate::router::{Handler, Router};
use crate::transport::Payload;
use log::debug;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Something that can report its current value for a shared topic entry.
pub trait ValueSource: Send + Sync {
    /// Current wire value, or `None` when the owner no longer exists.
    fn current_value(&self) -> Option<String>;
}

/// Topic with a single publisher.
#[derive(Clone)]
pub struct Topic {
    router: Arc<Router>,
    name: String,
}

impl Topic {
    pub fn new(router: &Arc<Router>, name: impl Into<String>) -> Self {
        Self {
            router: router.clone(),
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Publish `message` on this topic. A message is required.
    pub fn publish(&self, message: Option<Payload>) -> Result<()> {
        let message = message.ok_or_else(|| HaMqttError::MissingMessage(self.name.clone()))?;
        self.router.publish(&self.name, &message)
    }

    pub fn subscribe(&self, handler: Handler) -> Result<()> {
        self.router.subscribe(&self.name, handler)
    }
}

/// Topic whose payload is assembled from the entries of many entities.
pub struct SharedTopic {
    topic: Topic,
    entries: RwLock<Vec<(String, Arc<dyn ValueSource>)>>,
}

impl SharedTopic {
    pub fn new(router: &Arc<Router>, name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            topic: Topic::new(router, name),
            entries: RwLock::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        self.topic.name()
    }

    /// Register `source` under `key` and return the Home Assistant template
    /// that extracts it from the combined payload.
    ///
    /// Keys are claimed once; a second producer for the same key is
    /// rejected.
    pub fn add_entry(&self, key: &str, source: Arc<dyn ValueSource>) -> Result<String> {
        let mut templates = self.add_entries(vec![(key.to_string(), source)])?;
        Ok(templates.remove(0))
    }

    /// Register several entries at once. Either all keys are free and every
    /// entry is added, or nothing is.
    pub fn add_entries(
        &self,
        new_entries: Vec<(String, Arc<dyn ValueSource>)>,
    ) -> Result<Vec<String>> {
        let mut entries = self.entries.write();
        for (index, (key, _)) in new_entries.iter().enumerate() {
            let taken = entries.iter().any(|(k, _)| k == key)
                || new_entries[..index].iter().any(|(k, _)| k == key);
            if taken {
                return Err(HaMqttError::DuplicateEntry {
                    topic: self.name().to_string(),
                    key: key.clone(),
                });
            }
        }

        let templates: Vec<String> = new_entries
            .iter()
            .map(|(key, _)| Self::template(key))
            .collect();
        entries.extend(new_entries);
        Ok(templates)
    }

    /// Value template reading `key` from the combined payload.
    pub fn template(key: &str) -> String {
        format!("{{{{ value_json.{} }}}}", key)
    }

    /// Number of registered entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Evaluate every entry now and publish the combined object.
    ///
    /// An explicit message is ignored: values only ever come from the
    /// registered entries.
    pub fn publish(&self, message: Option<Payload>) -> Result<()> {
        if message.is_some() {
            debug!(
                "[MQTT] Ignoring direct message on shared topic {}",
                self.name()
            );
            return Ok(());
        }

        let payload = {
            let entries = self.entries.read();
            let mut values = Map::with_capacity(entries.len());
            for (key, source) in entries.iter() {
                let value = source.current_value().map_or(Value::Null, Value::String);
                values.insert(key.clone(), value);
            }
            Value::Object(values)
        };

        self.topic.publish(Some(Payload::Json(payload)))
    }

    /// Shared topics are write-only; commands need their own topic.
    pub fn subscribe(&self, _handler: Handler) -> Result<()> {
        Err(HaMqttError::SharedTopicSubscribe(self.name().to_string()))
    }
}

/// Where an entity publishes its state.
#[derive(Clone)]
pub enum StateTopic {
    /// Dedicated topic carrying only this entity's state.
    Owned(Topic),
    /// Entry on a topic shared with other entities.
    Shared(Arc<SharedTopic>),
}

impl StateTopic {
    pub fn name(&self) -> &str {
        match self {
            StateTopic::Owned(topic) => topic.name(),
            StateTopic::Shared(shared) => shared.name(),
        }
    }

    /// Publish `message` on an owned topic. On a shared topic this is a
    /// no-op; the value goes out with the next shared flush instead.
    pub fn publish(&self, message: Option<Payload>) -> Result<()> {
        match self {
            StateTopic::Owned(topic) => topic.publish(message),
            StateTopic::Shared(shared) => shared.publish(message),
        }
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, StateTopic::Shared(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Counter(AtomicU32);

    impl ValueSource for Counter {
        fn current_value(&self) -> Option<String> {
            Some(self.0.load(Ordering::SeqCst).to_string())
        }
    }

    struct Gone;

    impl ValueSource for Gone {
        fn current_value(&self) -> Option<String> {
            None
        }
    }

    fn setup() -> (Arc<MemoryTransport>, Arc<Router>) {
        let transport = Arc::new(MemoryTransport::new());
        let router = Router::new(transport.clone());
        (transport, router)
    }

    #[test]
    fn test_plain_topic_requires_message() {
        let (transport, router) = setup();
        let topic = Topic::new(&router, "a/state");

        assert!(matches!(
            topic.publish(None),
            Err(HaMqttError::MissingMessage(name)) if name == "a/state"
        ));
        topic.publish(Some(Payload::from("1"))).unwrap();
        assert_eq!(transport.messages("a/state"), vec![Payload::from("1")]);
    }

    #[test]
    fn test_add_entry_returns_template() {
        let (_, router) = setup();
        let shared = SharedTopic::new(&router, "/my/topic");
        let template = shared.add_entry("temp_1", Arc::new(Gone)).unwrap();
        assert_eq!(template, "{{ value_json.temp_1 }}");
    }

    #[test]
    fn test_publish_reads_values_at_call_time() {
        let (transport, router) = setup();
        let shared = SharedTopic::new(&router, "/my/topic");
        let a = Arc::new(Counter(AtomicU32::new(1)));
        let b = Arc::new(Counter(AtomicU32::new(2)));
        shared.add_entry("a", a.clone()).unwrap();
        shared.add_entry("b", b.clone()).unwrap();

        a.0.store(10, Ordering::SeqCst);
        b.0.store(20, Ordering::SeqCst);
        shared.publish(None).unwrap();

        assert_eq!(
            transport.messages("/my/topic"),
            vec![Payload::Json(json!({"a": "10", "b": "20"}))]
        );
    }

    #[test]
    fn test_publish_with_message_is_noop() {
        let (transport, router) = setup();
        let shared = SharedTopic::new(&router, "/my/topic");
        shared.add_entry("a", Arc::new(Counter(AtomicU32::new(1)))).unwrap();

        shared.publish(Some(Payload::from("ignored"))).unwrap();
        assert!(transport.messages("/my/topic").is_empty());
    }

    #[test]
    fn test_dropped_owner_is_null() {
        let (transport, router) = setup();
        let shared = SharedTopic::new(&router, "/my/topic");
        shared.add_entry("gone", Arc::new(Gone)).unwrap();
        shared.publish(None).unwrap();

        assert_eq!(
            transport.messages("/my/topic"),
            vec![Payload::Json(json!({ "gone": null }))]
        );
    }

    #[test]
    fn test_subscribe_rejected() {
        let (transport, router) = setup();
        let shared = SharedTopic::new(&router, "/my/topic");
        let result = shared.subscribe(Arc::new(|_: &str| {}));
        assert!(matches!(result, Err(HaMqttError::SharedTopicSubscribe(_))));
        assert!(transport.subscriptions().is_empty());
    }

    #[test]
    fn test_entries_only_grow() {
        let (transport, router) = setup();
        let shared = SharedTopic::new(&router, "/my/topic");
        assert!(shared.is_empty());
        shared.add_entry("a", Arc::new(Counter(AtomicU32::new(1)))).unwrap();
        shared.add_entry("b", Arc::new(Gone)).unwrap();

        let result = shared.add_entry("a", Arc::new(Counter(AtomicU32::new(2))));
        assert!(matches!(
            result,
            Err(HaMqttError::DuplicateEntry { ref key, .. }) if key == "a"
        ));
        assert_eq!(shared.len(), 2);

        shared.publish(None).unwrap();
        assert_eq!(
            transport.messages("/my/topic"),
            vec![Payload::Json(json!({"a": "1", "b": null}))]
        );
    }

    #[test]
    fn test_add_entries_is_all_or_nothing() {
        let (_, router) = setup();
        let shared = SharedTopic::new(&router, "/my/topic");
        shared.add_entry("x_mode", Arc::new(Gone)).unwrap();

        let entries: Vec<(String, Arc<dyn ValueSource>)> = vec![
            ("x_curr_temp".to_string(), Arc::new(Gone)),
            ("x_mode".to_string(), Arc::new(Gone)),
        ];
        let result = shared.add_entries(entries);
        assert!(result.is_err());
        assert_eq!(shared.len(), 1);

        let entries: Vec<(String, Arc<dyn ValueSource>)> = vec![
            ("y".to_string(), Arc::new(Gone)),
            ("y".to_string(), Arc::new(Gone)),
        ];
        let result = shared.add_entries(entries);
        assert!(result.is_err());
        assert_eq!(shared.len(), 1);
    }
}
