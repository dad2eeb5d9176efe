//! Two-state switch controllable from Home Assistant.

use crate::entity::{ComponentType, Entity, EntityConfig, EntityValue};
use crate::error::{HaMqttError, Result};
use crate::router::Router;
use crate::topic::{StateTopic, Topic};
use crate::transport::Payload;
use log::{error, info, warn};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub const PAYLOAD_ON: &str = "on";
pub const PAYLOAD_OFF: &str = "off";

pub type SwitchChangeFn = Arc<dyn Fn(bool) + Send + Sync>;

fn state_payload(on: bool) -> &'static str {
    if on { PAYLOAD_ON } else { PAYLOAD_OFF }
}

pub struct Switch {
    entity: Entity,
    state_topic: StateTopic,
    command_topic: Topic,
    state: AtomicBool,
    on_change: SwitchChangeFn,
}

impl Switch {
    pub fn builder(options: EntityConfig) -> SwitchBuilder {
        SwitchBuilder {
            options,
            on_change: None,
        }
    }

    pub fn entity(&self) -> &Entity {
        &self.entity
    }

    pub fn is_on(&self) -> bool {
        self.state.load(Ordering::SeqCst)
    }

    pub fn state_topic(&self) -> &StateTopic {
        &self.state_topic
    }

    pub fn command_topic_name(&self) -> &str {
        self.command_topic.name()
    }

    /// Switch on or off: store the state, notify the owner, republish.
    pub fn set(&self, on: bool) -> Result<()> {
        self.state.store(on, Ordering::SeqCst);
        (self.on_change)(on);
        self.send_update()
    }

    pub fn send_update(&self) -> Result<()> {
        self.state_topic
            .publish(Some(Payload::from(state_payload(self.is_on()))))
    }

    fn receive_command(&self, payload: &str) {
        let on = match payload {
            PAYLOAD_ON => true,
            PAYLOAD_OFF => false,
            other => {
                warn!(
                    "[HASS] Ignoring unknown command for switch {}: {:?}",
                    self.entity.id(),
                    other
                );
                return;
            }
        };

        info!("[HASS] Switch {} turned {}", self.entity.id(), payload);
        if let Err(e) = self.set(on) {
            error!(
                "[HASS] Failed to publish state of {}: {}",
                self.entity.id(),
                e
            );
        }
    }
}

pub struct SwitchBuilder {
    options: EntityConfig,
    on_change: Option<SwitchChangeFn>,
}

impl SwitchBuilder {
    /// Called with the new state whenever the switch is set. Required.
    pub fn on_change<F>(mut self, f: F) -> Self
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.on_change = Some(Arc::new(f));
        self
    }

    pub fn build(self, router: &Arc<Router>) -> Result<Arc<Switch>> {
        let on_change = self
            .on_change
            .ok_or(HaMqttError::MissingField("on_change"))?;
        let mut entity = Entity::new(router, ComponentType::Switch, &self.options)?;
        let command_topic = entity.topic("cmd");
        entity.add_to_config([
            ("payload_on", json!(PAYLOAD_ON)),
            ("payload_off", json!(PAYLOAD_OFF)),
            ("state_on", json!(PAYLOAD_ON)),
            ("state_off", json!(PAYLOAD_OFF)),
            ("command_topic", json!(command_topic.name())),
        ]);

        let source = EntityValue::<Switch>::new(|s| state_payload(s.is_on()).to_string());
        let state_topic =
            entity.attach_state_topic(self.options.shared_state.as_ref(), source.clone())?;
        let switch = Arc::new(Switch {
            entity,
            state_topic,
            command_topic,
            state: AtomicBool::new(false),
            on_change,
        });
        source.bind(&switch);

        let weak = Arc::downgrade(&switch);
        switch.command_topic.subscribe(Arc::new(move |payload: &str| {
            if let Some(switch) = weak.upgrade() {
                switch.receive_command(payload);
            }
        }))?;

        Ok(switch)
    }
}
