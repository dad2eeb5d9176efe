//! Hub-side configuration for setups without MQTT auto-discovery.
//!
//! The exported YAML can be pasted into the Home Assistant configuration.
//! Settable sensors additionally get an `input_number` helper plus two
//! automations keeping the helper and the MQTT state in sync.

use crate::component::Component;
use crate::error::Result;
use crate::sensor::SettableSensor;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;

/// Keys are emitted in alphabetical order, matching field order here.
#[derive(Debug, Default, Serialize)]
pub struct HubConfig {
    pub automation: Vec<Automation>,
    pub climate: Vec<Value>,
    pub input_number: BTreeMap<String, InputNumber>,
    pub sensor: Vec<Value>,
    pub switch: Vec<Value>,
}

#[derive(Debug, Serialize)]
pub struct InputNumber {
    pub icon: Option<String>,
    pub initial: f64,
    pub max: f64,
    pub min: f64,
    pub name: String,
    pub step: f64,
    pub unit_of_measurement: Value,
}

#[derive(Debug, Serialize)]
pub struct Automation {
    pub action: AutomationAction,
    pub alias: String,
    pub trigger: AutomationTrigger,
}

#[derive(Debug, Serialize)]
pub struct AutomationAction {
    pub data_template: BTreeMap<String, String>,
    pub service: String,
}

#[derive(Debug, Serialize)]
pub struct AutomationTrigger {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    pub platform: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
}

impl HubConfig {
    pub fn from_components<'a>(components: impl IntoIterator<Item = &'a Component>) -> Self {
        let mut config = HubConfig::default();

        for component in components {
            let mut document = component.entity().config().clone();
            document.insert("platform".to_string(), json!("mqtt"));
            let document = Value::Object(document);

            match component {
                Component::Sensor(_) | Component::ErrorSensor(_) => config.sensor.push(document),
                Component::SettableSensor(sensor) => {
                    config.add_input_number(sensor, &document);
                    config.sensor.push(document);
                }
                Component::Switch(_) => config.switch.push(document),
                Component::Climate(_) => config.climate.push(document),
            }
        }

        config
    }

    fn add_input_number(&mut self, sensor: &SettableSensor, document: &Value) {
        let entity = sensor.entity();
        let id = entity.id();
        let helper = format!("input_number.{}", id);
        let range = sensor.range();

        self.input_number.insert(
            id.to_string(),
            InputNumber {
                icon: entity.icon().map(str::to_string),
                initial: sensor.state(),
                max: range.max,
                min: range.min,
                name: entity.name().to_string(),
                step: range.step,
                unit_of_measurement: document["unit_of_measurement"].clone(),
            },
        );

        self.automation.push(Automation {
            action: AutomationAction {
                data_template: BTreeMap::from([
                    ("entity_id".to_string(), helper.clone()),
                    ("value".to_string(), "{{ trigger.payload }}".to_string()),
                ]),
                service: "input_number.set_value".to_string(),
            },
            alias: format!("{}_1", id),
            trigger: AutomationTrigger {
                entity_id: None,
                platform: "mqtt".to_string(),
                topic: Some(sensor.state_topic_name().to_string()),
            },
        });

        self.automation.push(Automation {
            action: AutomationAction {
                data_template: BTreeMap::from([
                    (
                        "payload".to_string(),
                        format!("{{{{ states('{}') | int }}}}", helper),
                    ),
                    ("topic".to_string(), sensor.command_topic_name().to_string()),
                ]),
                service: "mqtt.publish".to_string(),
            },
            alias: format!("{}_2", id),
            trigger: AutomationTrigger {
                entity_id: Some(helper),
                platform: "state".to_string(),
                topic: None,
            },
        });
    }

    /// Render as a YAML document with an explicit `---` start marker.
    pub fn to_yaml(&self) -> Result<String> {
        let body = serde_yaml::to_string(self)?;
        Ok(format!("---\n{}", body))
    }
}
