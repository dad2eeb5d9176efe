//! Thermostat-style climate controller.
//!
//! The current temperature comes from a thermometer function; mode and
//! target temperature are set from Home Assistant via `cmdMode` and
//! `cmdTargetTemp`.

use crate::entity::{ComponentType, Entity, EntityConfig, EntityValue};
use crate::error::{HaMqttError, Result};
use crate::router::Router;
use crate::sensor::parse_float;
use crate::topic::{StateTopic, Topic, ValueSource};
use crate::transport::Payload;
use log::{error, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use std::str::FromStr;
use std::sync::Arc;
use strum::{AsRefStr, Display, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, AsRefStr, Serialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ClimateMode {
    Off,
    Heat,
    Cool,
}

pub type ThermometerFn = Arc<dyn Fn() -> f64 + Send + Sync>;
pub type ClimateChangeFn = Arc<dyn Fn(ClimateMode, f64) + Send + Sync>;
pub type TempFormatter = Arc<dyn Fn(f64) -> String + Send + Sync>;

/// Targets closer than this are considered unchanged.
const TARGET_TOLERANCE: f64 = 1e-1;

pub fn format_temperature(temp: f64) -> String {
    format!("{:.2}", temp)
}

struct ClimateState {
    mode: ClimateMode,
    target: f64,
}

struct StateTopics {
    mode: StateTopic,
    current_temp: StateTopic,
    target_temp: StateTopic,
}

pub struct Climate {
    entity: Entity,
    modes: Vec<ClimateMode>,
    state: Mutex<ClimateState>,
    thermometer: ThermometerFn,
    on_change: ClimateChangeFn,
    formatter: TempFormatter,
    topics: StateTopics,
    mode_command_topic: Topic,
    target_command_topic: Topic,
}

impl Climate {
    pub fn builder(options: EntityConfig) -> ClimateBuilder {
        ClimateBuilder {
            options,
            heat: true,
            cool: false,
            thermometer: None,
            on_change: Arc::new(|_, _| {}),
            temp_min: 0.0,
            temp_max: 100.0,
            temp_step: 1.0,
            formatter: Arc::new(format_temperature),
        }
    }

    pub fn entity(&self) -> &Entity {
        &self.entity
    }

    /// Modes offered to the hub, `off` first.
    pub fn modes(&self) -> &[ClimateMode] {
        &self.modes
    }

    pub fn mode(&self) -> ClimateMode {
        self.state.lock().mode
    }

    pub fn target(&self) -> f64 {
        self.state.lock().target
    }

    pub fn is_on(&self) -> bool {
        self.mode() != ClimateMode::Off
    }

    pub fn mode_command_topic_name(&self) -> &str {
        self.mode_command_topic.name()
    }

    pub fn target_command_topic_name(&self) -> &str {
        self.target_command_topic.name()
    }

    fn current_temp_formatted(&self) -> String {
        (self.formatter)((self.thermometer)())
    }

    fn target_formatted(&self) -> String {
        (self.formatter)(self.target())
    }

    fn mode_formatted(&self) -> String {
        self.mode().to_string()
    }

    pub fn set_mode(&self, mode: ClimateMode) -> Result<()> {
        if !self.modes.contains(&mode) {
            return Err(HaMqttError::UnsupportedMode(mode.to_string()));
        }

        {
            let mut state = self.state.lock();
            if state.mode == mode {
                return Ok(());
            }
            state.mode = mode;
        }

        self.topics
            .mode
            .publish(Some(Payload::Text(mode.to_string())))?;
        self.handle_state_change()
    }

    pub fn set_target(&self, target: f64) -> Result<()> {
        {
            let mut state = self.state.lock();
            if (state.target - target).abs() <= TARGET_TOLERANCE {
                return Ok(());
            }
            state.target = target;
        }

        self.topics
            .target_temp
            .publish(Some(Payload::Text((self.formatter)(target))))?;
        self.handle_state_change()
    }

    /// Publish the current temperature.
    pub fn send_update(&self) -> Result<()> {
        self.topics
            .current_temp
            .publish(Some(Payload::Text(self.current_temp_formatted())))
    }

    fn handle_state_change(&self) -> Result<()> {
        let (mode, target) = {
            let state = self.state.lock();
            (state.mode, state.target)
        };
        (self.on_change)(mode, target);
        self.send_update()
    }

    fn receive_mode(&self, payload: &str) {
        let result = ClimateMode::from_str(payload.trim())
            .map_err(|_| HaMqttError::UnsupportedMode(payload.to_string()))
            .and_then(|mode| self.set_mode(mode));
        match result {
            Ok(()) => info!("[HASS] Climate {} mode {}", self.entity.id(), self.mode()),
            Err(e) => warn!(
                "[HASS] Ignoring mode command for {}: {}",
                self.entity.id(),
                e
            ),
        }
    }

    fn receive_target(&self, payload: &str) {
        let Some(target) = parse_float(payload) else {
            warn!(
                "[HASS] Ignoring unparsable target for {}: {:?}",
                self.entity.id(),
                payload
            );
            return;
        };
        if let Err(e) = self.set_target(target) {
            error!(
                "[HASS] Failed to publish target of {}: {}",
                self.entity.id(),
                e
            );
        }
    }
}

pub struct ClimateBuilder {
    options: EntityConfig,
    heat: bool,
    cool: bool,
    thermometer: Option<ThermometerFn>,
    on_change: ClimateChangeFn,
    temp_min: f64,
    temp_max: f64,
    temp_step: f64,
    formatter: TempFormatter,
}

impl ClimateBuilder {
    pub fn heat(mut self, heat: bool) -> Self {
        self.heat = heat;
        self
    }

    pub fn cool(mut self, cool: bool) -> Self {
        self.cool = cool;
        self
    }

    /// Source of the current temperature. Required.
    pub fn thermometer<F>(mut self, f: F) -> Self
    where
        F: Fn() -> f64 + Send + Sync + 'static,
    {
        self.thermometer = Some(Arc::new(f));
        self
    }

    /// Called with `(mode, target)` after every effective change.
    pub fn on_change<F>(mut self, f: F) -> Self
    where
        F: Fn(ClimateMode, f64) + Send + Sync + 'static,
    {
        self.on_change = Arc::new(f);
        self
    }

    pub fn temp_range(mut self, min: f64, max: f64, step: f64) -> Self {
        self.temp_min = min;
        self.temp_max = max;
        self.temp_step = step;
        self
    }

    pub fn formatter<F>(mut self, f: F) -> Self
    where
        F: Fn(f64) -> String + Send + Sync + 'static,
    {
        self.formatter = Arc::new(f);
        self
    }

    pub fn build(self, router: &Arc<Router>) -> Result<Arc<Climate>> {
        let thermometer = self
            .thermometer
            .ok_or(HaMqttError::MissingField("thermometer"))?;
        let mut entity = Entity::new(router, ComponentType::Climate, &self.options)?;

        let mut modes = vec![ClimateMode::Off];
        if self.heat {
            modes.push(ClimateMode::Heat);
        }
        if self.cool {
            modes.push(ClimateMode::Cool);
        }

        let mode_command_topic = entity.topic("cmdMode");
        let target_command_topic = entity.topic("cmdTargetTemp");
        entity.add_to_config([
            ("min_temp", json!(number_string(self.temp_min))),
            ("max_temp", json!(number_string(self.temp_max))),
            ("temp_step", json!(number_string(self.temp_step))),
            ("modes", json!(modes)),
            ("mode_command_topic", json!(mode_command_topic.name())),
            ("temperature_command_topic", json!(target_command_topic.name())),
        ]);

        let state = ClimateState {
            mode: ClimateMode::Off,
            target: thermometer(),
        };

        let mut sources = Vec::new();
        let topics = match &self.options.shared_state {
            Some(shared) => {
                let id = entity.id().to_string();
                let mode = EntityValue::<Climate>::new(Climate::mode_formatted);
                let current_temp = EntityValue::<Climate>::new(Climate::current_temp_formatted);
                let target_temp = EntityValue::<Climate>::new(Climate::target_formatted);
                let entries: Vec<(String, Arc<dyn ValueSource>)> = vec![
                    (format!("{}_mode", id), mode.clone()),
                    (format!("{}_curr_temp", id), current_temp.clone()),
                    (format!("{}_target_temp", id), target_temp.clone()),
                ];
                let templates = shared.add_entries(entries)?;
                sources.extend([mode, current_temp, target_temp]);

                entity.add_to_config([
                    ("mode_state_topic", json!(shared.name())),
                    ("mode_state_template", json!(templates[0])),
                    ("current_temperature_topic", json!(shared.name())),
                    ("current_temperature_template", json!(templates[1])),
                    ("temperature_state_topic", json!(shared.name())),
                    ("temperature_state_template", json!(templates[2])),
                ]);
                StateTopics {
                    mode: StateTopic::Shared(shared.clone()),
                    current_temp: StateTopic::Shared(shared.clone()),
                    target_temp: StateTopic::Shared(shared.clone()),
                }
            }
            None => {
                let mode = entity.topic("stateMode");
                let current_temp = entity.topic("stateCurrTemp");
                let target_temp = entity.topic("stateTargetTemp");
                entity.add_to_config([
                    ("mode_state_topic", json!(mode.name())),
                    ("current_temperature_topic", json!(current_temp.name())),
                    ("temperature_state_topic", json!(target_temp.name())),
                ]);
                StateTopics {
                    mode: StateTopic::Owned(mode),
                    current_temp: StateTopic::Owned(current_temp),
                    target_temp: StateTopic::Owned(target_temp),
                }
            }
        };

        let climate = Arc::new(Climate {
            entity,
            modes,
            state: Mutex::new(state),
            thermometer,
            on_change: self.on_change,
            formatter: self.formatter,
            topics,
            mode_command_topic,
            target_command_topic,
        });
        for source in &sources {
            source.bind(&climate);
        }

        let weak = Arc::downgrade(&climate);
        climate
            .mode_command_topic
            .subscribe(Arc::new(move |payload: &str| {
                if let Some(climate) = weak.upgrade() {
                    climate.receive_mode(payload);
                }
            }))?;
        let weak = Arc::downgrade(&climate);
        climate
            .target_command_topic
            .subscribe(Arc::new(move |payload: &str| {
                if let Some(climate) = weak.upgrade() {
                    climate.receive_target(payload);
                }
            }))?;

        Ok(climate)
    }
}

/// `1.0` → `"1"`, `0.5` → `"0.5"`.
fn number_string(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::Sensor;
    use crate::topic::SharedTopic;
    use crate::transport::MemoryTransport;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn setup() -> (Arc<MemoryTransport>, Arc<Router>) {
        let transport = Arc::new(MemoryTransport::new());
        let router = Router::new(transport.clone());
        (transport, router)
    }

    /// Thermometer starting at `start` and rising one degree per reading.
    fn rising_thermometer(start: f64) -> impl Fn() -> f64 + Send + Sync + 'static {
        let readings = AtomicU32::new(0);
        move || start + 1.0 + readings.fetch_add(1, Ordering::SeqCst) as f64
    }

    fn send_command(router: &Router, topic: &str, payload: &str) {
        router.publish(topic, &Payload::from(payload)).unwrap();
        router.dispatch(topic, payload);
    }

    #[test]
    fn test_requires_thermometer() {
        let (_, router) = setup();
        let result = Climate::builder(EntityConfig::new("Test Name")).build(&router);
        assert!(matches!(
            result,
            Err(HaMqttError::MissingField("thermometer"))
        ));
    }

    #[test]
    fn test_simple() {
        let (transport, router) = setup();
        let climate = Climate::builder(EntityConfig::new("Test Name"))
            .thermometer(rising_thermometer(5.5))
            .build(&router)
            .unwrap();

        climate.entity().start().unwrap();
        climate.entity().available_set(true).unwrap();
        assert!(!climate.is_on());
        send_command(&router, "homeassistant/climate/test_name/cmdMode", "heat");
        assert!(climate.is_on());
        send_command(&router, "homeassistant/climate/test_name/cmdTargetTemp", "80");
        climate.send_update().unwrap();
        climate.entity().stop().unwrap();

        assert_eq!(
            transport.messages("homeassistant/climate/test_name/config"),
            vec![
                Payload::Json(json!({
                    "unique_id": "test_name",
                    "name": "Test Name",
                    "current_temperature_topic": "homeassistant/climate/test_name/stateCurrTemp",
                    "max_temp": "100",
                    "min_temp": "0",
                    "temp_step": "1",
                    "modes": ["off", "heat"],
                    "mode_command_topic": "homeassistant/climate/test_name/cmdMode",
                    "mode_state_topic": "homeassistant/climate/test_name/stateMode",
                    "temperature_command_topic": "homeassistant/climate/test_name/cmdTargetTemp",
                    "temperature_state_topic": "homeassistant/climate/test_name/stateTargetTemp",
                })),
                Payload::Empty,
            ]
        );
        assert_eq!(
            transport.messages("homeassistant/climate/test_name/stateCurrTemp"),
            vec![
                Payload::from("7.50"),
                Payload::from("8.50"),
                Payload::from("9.50")
            ]
        );
        assert_eq!(
            transport.messages("homeassistant/climate/test_name/stateMode"),
            vec![Payload::from("heat")]
        );
        assert_eq!(
            transport.messages("homeassistant/climate/test_name/stateTargetTemp"),
            vec![Payload::from("80.00")]
        );
        assert!(
            transport
                .messages("homeassistant/climate/test_name/available")
                .is_empty()
        );
    }

    #[test]
    fn test_shared_topic() {
        let (transport, router) = setup();
        let state = SharedTopic::new(&router, "/my/topic");
        let climate = Climate::builder(
            EntityConfig::new("Test Name")
                .with_shared_state(&state)
                .with_availability(true),
        )
        .thermometer(rising_thermometer(5.5))
        .build(&router)
        .unwrap();

        let config = climate.entity().config();
        assert_eq!(
            config["current_temperature_template"],
            "{{ value_json.test_name_curr_temp }}"
        );
        assert_eq!(config["mode_state_template"], "{{ value_json.test_name_mode }}");
        assert_eq!(
            config["temperature_state_template"],
            "{{ value_json.test_name_target_temp }}"
        );
        assert_eq!(config["temperature_state_topic"], "/my/topic");

        climate.entity().available_set(true).unwrap();
        state.publish(None).unwrap();
        send_command(&router, climate.mode_command_topic_name(), "heat");
        send_command(&router, climate.target_command_topic_name(), "80");
        state.publish(None).unwrap();

        assert_eq!(
            transport.messages("/my/topic"),
            vec![
                Payload::Json(json!({
                    "test_name_mode": "off",
                    "test_name_curr_temp": "7.50",
                    "test_name_target_temp": "6.50",
                })),
                Payload::Json(json!({
                    "test_name_mode": "heat",
                    "test_name_curr_temp": "10.50",
                    "test_name_target_temp": "80.00",
                })),
            ]
        );
    }

    #[test]
    fn test_idempotent_changes() {
        let (transport, router) = setup();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let log = calls.clone();
        let climate = Climate::builder(EntityConfig::new("Room"))
            .thermometer(|| 20.0)
            .cool(true)
            .on_change(move |mode, target| log.lock().push((mode, target)))
            .build(&router)
            .unwrap();

        assert_eq!(
            climate.modes(),
            &[ClimateMode::Off, ClimateMode::Heat, ClimateMode::Cool]
        );

        climate.set_mode(ClimateMode::Off).unwrap();
        climate.set_target(20.05).unwrap();
        assert!(calls.lock().is_empty());
        assert!(transport.published().is_empty());

        climate.set_mode(ClimateMode::Cool).unwrap();
        climate.set_target(18.0).unwrap();
        assert_eq!(
            *calls.lock(),
            vec![(ClimateMode::Cool, 20.0), (ClimateMode::Cool, 18.0)]
        );
    }

    #[test]
    fn test_rejects_disabled_and_unknown_modes() {
        let (_, router) = setup();
        let climate = Climate::builder(EntityConfig::new("Room"))
            .thermometer(|| 20.0)
            .build(&router)
            .unwrap();

        assert!(matches!(
            climate.set_mode(ClimateMode::Cool),
            Err(HaMqttError::UnsupportedMode(mode)) if mode == "cool"
        ));

        router.dispatch(climate.mode_command_topic_name(), "cool");
        router.dispatch(climate.mode_command_topic_name(), "auto");
        router.dispatch(climate.target_command_topic_name(), "warm");
        assert_eq!(climate.mode(), ClimateMode::Off);
        assert_eq!(climate.target(), 20.0);
    }

    #[test]
    fn test_non_finite_target_ignored() {
        let (transport, router) = setup();
        let climate = Climate::builder(EntityConfig::new("Room"))
            .thermometer(|| 20.0)
            .build(&router)
            .unwrap();

        for payload in ["nan", "inf", "-infinity"] {
            router.dispatch(climate.target_command_topic_name(), payload);
        }
        assert_eq!(climate.target(), 20.0);
        assert!(transport.published().is_empty());
    }

    #[test]
    fn test_shared_keys_must_be_free() {
        let (transport, router) = setup();
        let state = SharedTopic::new(&router, "/my/topic");
        let sensor = Sensor::builder(
            EntityConfig::new("Boiler Mode").with_shared_state(&state),
            "",
        )
        .state_fn(|| "eco")
        .build(&router)
        .unwrap();

        let result = Climate::builder(EntityConfig::new("Boiler").with_shared_state(&state))
            .thermometer(|| 20.0)
            .build(&router);
        assert!(matches!(
            result,
            Err(HaMqttError::DuplicateEntry { key, .. }) if key == "boiler_mode"
        ));
        assert_eq!(state.len(), 1);

        state.publish(None).unwrap();
        assert_eq!(
            transport.messages("/my/topic"),
            vec![Payload::Json(json!({"boiler_mode": "eco"}))]
        );
        drop(sensor);
    }

    #[test]
    fn test_temp_range_config() {
        let (_, router) = setup();
        let climate = Climate::builder(EntityConfig::new("Room"))
            .thermometer(|| 20.0)
            .temp_range(5.0, 30.0, 0.5)
            .build(&router)
            .unwrap();

        let config = climate.entity().config();
        assert_eq!(config["min_temp"], "5");
        assert_eq!(config["max_temp"], "30");
        assert_eq!(config["temp_step"], "0.5");
    }
}
