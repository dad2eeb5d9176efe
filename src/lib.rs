//! Home Assistant MQTT discovery library.
//!
//! Exposes sensors, settable sensors, switches and climate controllers to
//! Home Assistant. Entities publish their discovery documents under the
//! `homeassistant/` prefix, push state on their own or on a shared JSON
//! topic, and receive commands through a [`router::Router`].

pub mod climate;
pub mod component;
pub mod config;
pub mod discovery;
pub mod entity;
pub mod error;
pub mod helpers;
pub mod registry;
pub mod router;
pub mod runtime;
pub mod sensor;
pub mod switch;
pub mod topic;
pub mod transport;

pub use component::Component;
pub use entity::EntityConfig;
pub use error::{HaMqttError, Result};
pub use registry::Registry;
pub use router::Router;
