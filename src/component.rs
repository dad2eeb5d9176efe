//! Closed set of entity kinds the registry manages.

use crate::climate::Climate;
use crate::entity::Entity;
use crate::error::Result;
use crate::sensor::{ErrorSensor, Sensor, SettableSensor};
use crate::switch::Switch;
use std::sync::Arc;

#[derive(Clone)]
pub enum Component {
    Sensor(Arc<Sensor>),
    SettableSensor(Arc<SettableSensor>),
    ErrorSensor(Arc<ErrorSensor>),
    Switch(Arc<Switch>),
    Climate(Arc<Climate>),
}

impl Component {
    pub fn entity(&self) -> &Entity {
        match self {
            Component::Sensor(c) => c.entity(),
            Component::SettableSensor(c) => c.entity(),
            Component::ErrorSensor(c) => c.entity(),
            Component::Switch(c) => c.entity(),
            Component::Climate(c) => c.entity(),
        }
    }

    pub fn send_update(&self) -> Result<()> {
        match self {
            Component::Sensor(c) => c.send_update(),
            Component::SettableSensor(c) => c.send_update(),
            Component::ErrorSensor(c) => c.send_update(),
            Component::Switch(c) => c.send_update(),
            Component::Climate(c) => c.send_update(),
        }
    }

    pub fn start(&self) -> Result<()> {
        self.entity().start()
    }

    pub fn stop(&self) -> Result<()> {
        self.entity().stop()
    }

    pub fn available_set(&self, available: bool) -> Result<()> {
        self.entity().available_set(available)
    }
}

impl From<Arc<Sensor>> for Component {
    fn from(c: Arc<Sensor>) -> Self {
        Component::Sensor(c)
    }
}

impl From<Arc<SettableSensor>> for Component {
    fn from(c: Arc<SettableSensor>) -> Self {
        Component::SettableSensor(c)
    }
}

impl From<Arc<ErrorSensor>> for Component {
    fn from(c: Arc<ErrorSensor>) -> Self {
        Component::ErrorSensor(c)
    }
}

impl From<Arc<Switch>> for Component {
    fn from(c: Arc<Switch>) -> Self {
        Component::Switch(c)
    }
}

impl From<Arc<Climate>> for Component {
    fn from(c: Arc<Climate>) -> Self {
        Component::Climate(c)
    }
}
