//! Common behaviour of every discoverable Home Assistant component.
//!
//! An [`Entity`] owns the identity of a component, derives its topic names,
//! accumulates the discovery document while the concrete variant is being
//! built, and publishes/removes that document on `start`/`stop`.

use crate::error::{HaMqttError, Result};
use crate::router::Router;
use crate::topic::{SharedTopic, StateTopic, Topic, ValueSource};
use crate::transport::Payload;
use log::info;
use serde_json::{Map, Value, json};
use std::sync::{Arc, OnceLock, Weak};
use strum::{AsRefStr, Display, EnumString};

/// Root of every discovery topic.
pub const DISCOVERY_PREFIX: &str = "homeassistant";

pub const PAYLOAD_AVAILABLE: &str = "online";
pub const PAYLOAD_NOT_AVAILABLE: &str = "offline";

/// Component types Home Assistant accepts via MQTT discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ComponentType {
    AlarmControlPanel,
    BinarySensor,
    Camera,
    Cover,
    DeviceAutomation,
    Fan,
    Climate,
    Light,
    Lock,
    Sensor,
    Switch,
    Vacuum,
}

impl ComponentType {
    /// Parse a discovery component type such as `"binary_sensor"`.
    pub fn from_name(name: &str) -> Result<Self> {
        name.parse()
            .map_err(|_| HaMqttError::UnknownComponentType(name.to_string()))
    }
}

/// Derive a component id from its human name: `"Temp 1"` → `"temp_1"`.
pub fn id_from_name(name: &str) -> String {
    name.replace(' ', "_").to_lowercase()
}

/// `<prefix>/<type>/[<node_id>/]<id>/<suffix>`
pub fn topic_name(
    component_type: ComponentType,
    node_id: Option<&str>,
    component_id: &str,
    suffix: &str,
) -> String {
    match node_id {
        Some(node_id) => format!(
            "{}/{}/{}/{}/{}",
            DISCOVERY_PREFIX, component_type, node_id, component_id, suffix
        ),
        None => format!(
            "{}/{}/{}/{}",
            DISCOVERY_PREFIX, component_type, component_id, suffix
        ),
    }
}

fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() || id.contains(['/', '+', '#']) {
        return Err(HaMqttError::InvalidId(id.to_string()));
    }
    Ok(())
}

/// Options shared by every entity variant.
#[derive(Clone)]
pub struct EntityConfig {
    pub name: String,
    pub id: Option<String>,
    pub node_id: Option<String>,
    pub icon: Option<String>,
    pub device_class: Option<String>,
    /// Allocate an availability topic and announce `online`/`offline`.
    pub availability: bool,
    /// Publish discovery documents on start/stop. Disable when the hub is
    /// configured by hand (see `Registry::create_config`).
    pub auto_discovery: bool,
    /// Publish state as an entry of this topic instead of an own one.
    pub shared_state: Option<Arc<SharedTopic>>,
}

impl EntityConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: None,
            node_id: None,
            icon: None,
            device_class: None,
            availability: false,
            auto_discovery: true,
            shared_state: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = Some(icon.into());
        self
    }

    pub fn with_device_class(mut self, device_class: impl Into<String>) -> Self {
        self.device_class = Some(device_class.into());
        self
    }

    pub fn with_availability(mut self, availability: bool) -> Self {
        self.availability = availability;
        self
    }

    pub fn with_auto_discovery(mut self, auto_discovery: bool) -> Self {
        self.auto_discovery = auto_discovery;
        self
    }

    pub fn with_shared_state(mut self, shared: &Arc<SharedTopic>) -> Self {
        self.shared_state = Some(shared.clone());
        self
    }

    /// Component id: the explicit one, or derived from the name.
    pub fn component_id(&self) -> String {
        self.id
            .clone()
            .unwrap_or_else(|| id_from_name(&self.name))
    }
}

/// Identity, topics and discovery document of one component.
pub struct Entity {
    router: Arc<Router>,
    component_type: ComponentType,
    id: String,
    name: String,
    node_id: Option<String>,
    icon: Option<String>,
    auto_discovery: bool,
    config: Map<String, Value>,
    availability: Option<Topic>,
}

impl Entity {
    pub fn new(
        router: &Arc<Router>,
        component_type: ComponentType,
        options: &EntityConfig,
    ) -> Result<Self> {
        let id = options.component_id();
        validate_id(&id)?;
        if let Some(node_id) = &options.node_id {
            validate_id(node_id)?;
        }

        let mut entity = Self {
            router: router.clone(),
            component_type,
            id,
            name: options.name.clone(),
            node_id: options.node_id.clone(),
            icon: options.icon.clone(),
            auto_discovery: options.auto_discovery,
            config: Map::new(),
            availability: None,
        };

        entity.add_to_config([
            ("unique_id", json!(entity.id)),
            ("name", json!(entity.name)),
        ]);
        if let Some(icon) = &options.icon {
            entity.add_to_config([("icon", json!(icon))]);
        }
        if let Some(device_class) = &options.device_class {
            entity.add_to_config([("device_class", json!(device_class))]);
        }

        if options.availability {
            let topic = entity.topic("available");
            entity.add_to_config([
                ("availability_topic", json!(topic.name())),
                ("payload_available", json!(PAYLOAD_AVAILABLE)),
                ("payload_not_available", json!(PAYLOAD_NOT_AVAILABLE)),
            ]);
            entity.availability = Some(topic);
        }

        Ok(entity)
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn component_type(&self) -> ComponentType {
        self.component_type
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node_id(&self) -> Option<&str> {
        self.node_id.as_deref()
    }

    pub fn icon(&self) -> Option<&str> {
        self.icon.as_deref()
    }

    pub fn auto_discovery(&self) -> bool {
        self.auto_discovery
    }

    /// Discovery document as accumulated during construction.
    pub fn config(&self) -> &Map<String, Value> {
        &self.config
    }

    pub fn topic_name(&self, suffix: &str) -> String {
        topic_name(
            self.component_type,
            self.node_id.as_deref(),
            &self.id,
            suffix,
        )
    }

    /// Owned topic below this entity's topic root.
    pub fn topic(&self, suffix: &str) -> Topic {
        Topic::new(&self.router, self.topic_name(suffix))
    }

    /// Merge entries into the discovery document; later values win.
    pub fn add_to_config<'a>(&mut self, entries: impl IntoIterator<Item = (&'a str, Value)>) {
        for (key, value) in entries {
            self.config.insert(key.to_string(), value);
        }
    }

    /// Allocate the state topic and add the matching discovery fields.
    ///
    /// Without `shared` the entity gets its own `.../state` topic; with it,
    /// `source` is registered under the entity id and the discovery
    /// document points at the shared payload through a value template.
    /// Fails when the shared topic already carries an entry for that id.
    pub(crate) fn attach_state_topic(
        &mut self,
        shared: Option<&Arc<SharedTopic>>,
        source: Arc<dyn ValueSource>,
    ) -> Result<StateTopic> {
        match shared {
            Some(shared) => {
                let template = shared.add_entry(&self.id, source)?;
                self.add_to_config([
                    ("state_topic", json!(shared.name())),
                    ("value_template", json!(template)),
                ]);
                Ok(StateTopic::Shared(shared.clone()))
            }
            None => {
                let topic = self.topic("state");
                self.add_to_config([("state_topic", json!(topic.name()))]);
                Ok(StateTopic::Owned(topic))
            }
        }
    }

    pub fn has_availability(&self) -> bool {
        self.availability.is_some()
    }

    /// Announce availability. Does nothing when availability is disabled.
    pub fn available_set(&self, available: bool) -> Result<()> {
        match &self.availability {
            Some(topic) => {
                let payload = if available {
                    PAYLOAD_AVAILABLE
                } else {
                    PAYLOAD_NOT_AVAILABLE
                };
                topic.publish(Some(Payload::from(payload)))
            }
            None => Ok(()),
        }
    }

    /// Publish the discovery document.
    pub fn start(&self) -> Result<()> {
        if !self.auto_discovery {
            return Ok(());
        }
        info!(
            "[HASS] Adding component {}.{}",
            self.component_type, self.id
        );
        self.router.publish(
            &self.topic_name("config"),
            &Payload::Json(Value::Object(self.config.clone())),
        )
    }

    /// Remove the component from the hub by clearing its discovery document.
    pub fn stop(&self) -> Result<()> {
        if !self.auto_discovery {
            return Ok(());
        }
        info!(
            "[HASS] Removing component {}.{}",
            self.component_type, self.id
        );
        self.router
            .publish(&self.topic_name("config"), &Payload::Empty)
    }
}

/// Shared-topic entry reading a value through a weak reference to its
/// owning entity, so the topic never keeps the entity alive.
///
/// The entry is registered before its owner exists and bound once the
/// owner is built; until then it reports no value.
pub(crate) struct EntityValue<T> {
    owner: OnceLock<Weak<T>>,
    read: fn(&T) -> String,
}

impl<T: Send + Sync + 'static> EntityValue<T> {
    pub(crate) fn new(read: fn(&T) -> String) -> Arc<Self> {
        Arc::new(Self {
            owner: OnceLock::new(),
            read,
        })
    }

    /// Point the entry at its owner. Only the first call has an effect.
    pub(crate) fn bind(&self, owner: &Arc<T>) {
        let _ = self.owner.set(Arc::downgrade(owner));
    }
}

impl<T: Send + Sync> ValueSource for EntityValue<T> {
    fn current_value(&self) -> Option<String> {
        let owner = self.owner.get()?.upgrade()?;
        Some((self.read)(&owner))
    }
}
