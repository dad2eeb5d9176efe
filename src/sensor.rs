//! Read-only and settable sensors.
//!
//! - [`Sensor`]: state produced on demand by a user function
//! - [`SettableSensor`]: numeric state that Home Assistant can change via a
//!   command topic, backed by an `input_number` on the hub side
//! - [`ErrorSensor`]: counts failures of the functions it wraps

use crate::entity::{ComponentType, Entity, EntityConfig, EntityValue};
use crate::error::{HaMqttError, Result};
use crate::router::Router;
use crate::topic::{SharedTopic, StateTopic, Topic, ValueSource};
use crate::transport::Payload;
use log::{error, info, warn};
use parking_lot::Mutex;
use serde_json::json;
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Icon used by [`ErrorSensor`].
pub const ERROR_SENSOR_ICON: &str = "mdi:alarm-light";

/// Raw state reported by a sensor before formatting.
#[derive(Debug, Clone, PartialEq)]
pub enum StateValue {
    Number(f64),
    Text(String),
    /// No reading available (e.g. a wrapped function failed with no
    /// earlier value to fall back to).
    Missing,
}

impl StateValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            StateValue::Number(n) => Some(*n),
            _ => None,
        }
    }
}

impl From<f64> for StateValue {
    fn from(n: f64) -> Self {
        StateValue::Number(n)
    }
}

impl From<f32> for StateValue {
    fn from(n: f32) -> Self {
        StateValue::Number(n as f64)
    }
}

impl From<i64> for StateValue {
    fn from(n: i64) -> Self {
        StateValue::Number(n as f64)
    }
}

impl From<u64> for StateValue {
    fn from(n: u64) -> Self {
        StateValue::Number(n as f64)
    }
}

impl From<String> for StateValue {
    fn from(text: String) -> Self {
        StateValue::Text(text)
    }
}

impl From<&str> for StateValue {
    fn from(text: &str) -> Self {
        StateValue::Text(text.to_string())
    }
}

impl<T: Into<StateValue>> From<Option<T>> for StateValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(StateValue::Missing, Into::into)
    }
}

pub type StateFn = Arc<dyn Fn() -> StateValue + Send + Sync>;
pub type Formatter = Arc<dyn Fn(&StateValue) -> String + Send + Sync>;
pub type ChangeFn = Arc<dyn Fn(f64) + Send + Sync>;
pub type ParserFn = Arc<dyn Fn(&str) -> Option<f64> + Send + Sync>;
pub type UpdateConditionFn = Arc<dyn Fn(f64, f64) -> bool + Send + Sync>;

/// Text rendered for [`StateValue::Missing`].
const MISSING_STATE: &str = "unknown";

/// Numbers with two decimals, text verbatim.
pub fn format_two_decimals(value: &StateValue) -> String {
    match value {
        StateValue::Number(n) => format!("{:.2}", n),
        StateValue::Text(text) => text.clone(),
        StateValue::Missing => MISSING_STATE.to_string(),
    }
}

/// Numbers rounded to integers, text verbatim.
pub fn format_no_decimals(value: &StateValue) -> String {
    match value {
        StateValue::Number(n) => format!("{:.0}", n),
        StateValue::Text(text) => text.clone(),
        StateValue::Missing => MISSING_STATE.to_string(),
    }
}

/// Any value as plain text, numbers without fixed precision.
pub fn format_verbatim(value: &StateValue) -> String {
    match value {
        StateValue::Number(n) => n.to_string(),
        StateValue::Text(text) => text.clone(),
        StateValue::Missing => MISSING_STATE.to_string(),
    }
}

/// Default command parser: a (whitespace-trimmed) finite float.
pub fn parse_float(payload: &str) -> Option<f64> {
    payload
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
}

/// Default debounce: republish only when the value moved by more than 0.1.
pub fn significant_change(old: f64, new: f64) -> bool {
    (old - new).abs() > 1e-1
}

/// Bounds, step and initial value of a settable number.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NumberRange {
    pub min: f64,
    pub max: f64,
    pub step: f64,
    pub initial: f64,
}

impl NumberRange {
    pub fn new(min: f64, max: f64, step: f64, initial: f64) -> Self {
        Self {
            min,
            max,
            step,
            initial,
        }
    }
}

/// Sensor whose state is read from a producer function on every update.
pub struct Sensor {
    entity: Entity,
    state_topic: StateTopic,
    state_fn: StateFn,
    formatter: Formatter,
}

impl Sensor {
    pub fn builder(options: EntityConfig, unit_of_measurement: impl Into<String>) -> SensorBuilder {
        SensorBuilder {
            options,
            unit_of_measurement: unit_of_measurement.into(),
            state_fn: None,
            formatter: Arc::new(format_two_decimals),
        }
    }

    /// Build the sensor part of any sensor-like entity.
    ///
    /// A shared-topic entry reports whatever `source` reads, so the
    /// enclosing type decides what the entry shows.
    fn assemble(
        mut entity: Entity,
        unit_of_measurement: &str,
        shared: Option<&Arc<SharedTopic>>,
        state_fn: StateFn,
        formatter: Formatter,
        source: Arc<dyn ValueSource>,
    ) -> Result<Self> {
        entity.add_to_config([("unit_of_measurement", json!(unit_of_measurement))]);
        let state_topic = entity.attach_state_topic(shared, source)?;

        Ok(Self {
            entity,
            state_topic,
            state_fn,
            formatter,
        })
    }

    pub fn entity(&self) -> &Entity {
        &self.entity
    }

    pub fn name(&self) -> &str {
        self.entity.name()
    }

    pub fn state_topic(&self) -> &StateTopic {
        &self.state_topic
    }

    /// Current raw state.
    pub fn state(&self) -> StateValue {
        (self.state_fn)()
    }

    /// Current state as sent on the wire.
    pub fn formatted_state(&self) -> String {
        (self.formatter)(&self.state())
    }

    /// Publish the current state. On a shared topic the value goes out with
    /// the next shared flush instead.
    pub fn send_update(&self) -> Result<()> {
        self.state_topic
            .publish(Some(Payload::Text(self.formatted_state())))
    }
}

pub struct SensorBuilder {
    options: EntityConfig,
    unit_of_measurement: String,
    state_fn: Option<StateFn>,
    formatter: Formatter,
}

impl SensorBuilder {
    /// Producer of the raw state. Required.
    pub fn state_fn<F, V>(mut self, f: F) -> Self
    where
        F: Fn() -> V + Send + Sync + 'static,
        V: Into<StateValue>,
    {
        self.state_fn = Some(Arc::new(move || f().into()));
        self
    }

    pub fn formatter<F>(mut self, f: F) -> Self
    where
        F: Fn(&StateValue) -> String + Send + Sync + 'static,
    {
        self.formatter = Arc::new(f);
        self
    }

    pub fn build(self, router: &Arc<Router>) -> Result<Arc<Sensor>> {
        let state_fn = self.state_fn.ok_or(HaMqttError::MissingField("state_fn"))?;
        let entity = Entity::new(router, ComponentType::Sensor, &self.options)?;
        let shared = self.options.shared_state.as_ref();

        let source = EntityValue::<Sensor>::new(Sensor::formatted_state);
        let sensor = Arc::new(Sensor::assemble(
            entity,
            &self.unit_of_measurement,
            shared,
            state_fn,
            self.formatter,
            source.clone(),
        )?);
        source.bind(&sensor);
        Ok(sensor)
    }
}

/// Numeric sensor whose value can be changed from Home Assistant.
///
/// Commands arrive on `.../cmd`. Every parsed command updates the state and
/// fires `on_change`; the state is only republished when the update
/// condition considers the change significant.
pub struct SettableSensor {
    sensor: Sensor,
    state: Arc<Mutex<f64>>,
    range: NumberRange,
    command_topic: Topic,
    on_change: ChangeFn,
    parser: ParserFn,
    update_condition: UpdateConditionFn,
}

impl SettableSensor {
    pub fn builder(
        options: EntityConfig,
        unit_of_measurement: impl Into<String>,
        range: NumberRange,
    ) -> SettableSensorBuilder {
        SettableSensorBuilder {
            options,
            unit_of_measurement: unit_of_measurement.into(),
            range,
            formatter: Arc::new(format_two_decimals),
            on_change: Arc::new(|_| {}),
            parser: Arc::new(parse_float),
            update_condition: Arc::new(significant_change),
        }
    }

    pub fn sensor(&self) -> &Sensor {
        &self.sensor
    }

    pub fn entity(&self) -> &Entity {
        self.sensor.entity()
    }

    pub fn state(&self) -> f64 {
        *self.state.lock()
    }

    pub fn range(&self) -> NumberRange {
        self.range
    }

    pub fn state_topic_name(&self) -> &str {
        self.sensor.state_topic().name()
    }

    pub fn command_topic_name(&self) -> &str {
        self.command_topic.name()
    }

    pub fn send_update(&self) -> Result<()> {
        self.sensor.send_update()
    }

    fn receive_command(&self, payload: &str) {
        let Some(new_state) = (self.parser)(payload) else {
            warn!(
                "[HASS] Ignoring unparsable command for {}: {:?}",
                self.entity().id(),
                payload
            );
            return;
        };

        let old_state = std::mem::replace(&mut *self.state.lock(), new_state);
        info!(
            "[HASS] {} set to {} (was {})",
            self.entity().id(),
            new_state,
            old_state
        );
        (self.on_change)(new_state);

        if (self.update_condition)(old_state, new_state)
            && let Err(e) = self.send_update()
        {
            error!(
                "[HASS] Failed to publish state of {}: {}",
                self.entity().id(),
                e
            );
        }
    }
}

pub struct SettableSensorBuilder {
    options: EntityConfig,
    unit_of_measurement: String,
    range: NumberRange,
    formatter: Formatter,
    on_change: ChangeFn,
    parser: ParserFn,
    update_condition: UpdateConditionFn,
}

impl SettableSensorBuilder {
    pub fn formatter<F>(mut self, f: F) -> Self
    where
        F: Fn(&StateValue) -> String + Send + Sync + 'static,
    {
        self.formatter = Arc::new(f);
        self
    }

    /// Called with the new value on every accepted command.
    pub fn on_change<F>(mut self, f: F) -> Self
    where
        F: Fn(f64) + Send + Sync + 'static,
    {
        self.on_change = Arc::new(f);
        self
    }

    pub fn parser<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) -> Option<f64> + Send + Sync + 'static,
    {
        self.parser = Arc::new(f);
        self
    }

    /// Decides from `(old, new)` whether a command triggers a republish.
    pub fn update_condition<F>(mut self, f: F) -> Self
    where
        F: Fn(f64, f64) -> bool + Send + Sync + 'static,
    {
        self.update_condition = Arc::new(f);
        self
    }

    pub fn build(self, router: &Arc<Router>) -> Result<Arc<SettableSensor>> {
        let entity = Entity::new(router, ComponentType::Sensor, &self.options)?;
        let command_topic = entity.topic("cmd");
        let shared = self.options.shared_state.as_ref();

        let state = Arc::new(Mutex::new(self.range.initial));
        let reader = state.clone();
        let state_fn: StateFn = Arc::new(move || StateValue::Number(*reader.lock()));

        let source = EntityValue::<SettableSensor>::new(|s| s.sensor.formatted_state());
        let sensor = Arc::new(SettableSensor {
            sensor: Sensor::assemble(
                entity,
                &self.unit_of_measurement,
                shared,
                state_fn,
                self.formatter,
                source.clone(),
            )?,
            state,
            range: self.range,
            command_topic,
            on_change: self.on_change,
            parser: self.parser,
            update_condition: self.update_condition,
        });
        source.bind(&sensor);

        let weak = Arc::downgrade(&sensor);
        sensor.command_topic.subscribe(Arc::new(move |payload: &str| {
            if let Some(sensor) = weak.upgrade() {
                sensor.receive_command(payload);
            }
        }))?;

        Ok(sensor)
    }
}

/// Sensor reporting how many wrapped function calls have failed.
pub struct ErrorSensor {
    sensor: Sensor,
    errors: Arc<AtomicU64>,
}

impl ErrorSensor {
    /// Create an error counter. Unit, icon and formatting are fixed.
    pub fn new(router: &Arc<Router>, options: EntityConfig) -> Result<Arc<Self>> {
        let options = options.with_icon(ERROR_SENSOR_ICON);
        let entity = Entity::new(router, ComponentType::Sensor, &options)?;
        let shared = options.shared_state.as_ref();

        let errors = Arc::new(AtomicU64::new(0));
        let reader = errors.clone();
        let state_fn: StateFn =
            Arc::new(move || StateValue::from(reader.load(Ordering::SeqCst)));

        let source = EntityValue::<ErrorSensor>::new(|s| s.sensor.formatted_state());
        let sensor = Arc::new(ErrorSensor {
            sensor: Sensor::assemble(
                entity,
                "errors",
                shared,
                state_fn,
                Arc::new(format_no_decimals),
                source.clone(),
            )?,
            errors,
        });
        source.bind(&sensor);
        Ok(sensor)
    }

    pub fn sensor(&self) -> &Sensor {
        &self.sensor
    }

    pub fn entity(&self) -> &Entity {
        self.sensor.entity()
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.errors.store(0, Ordering::SeqCst);
    }

    pub fn send_update(&self) -> Result<()> {
        self.sensor.send_update()
    }

    /// Contain failures of `f`.
    ///
    /// The returned function calls `f`; on `Err` it counts and logs the
    /// failure and returns the last successful value (`None` before the
    /// first success) instead of propagating the error.
    pub fn wrap_function<T, E, F>(&self, f: F) -> impl Fn() -> Option<T> + Send + Sync + 'static
    where
        F: Fn() -> std::result::Result<T, E> + Send + Sync + 'static,
        T: Clone + Send + 'static,
        E: Display + 'static,
    {
        let errors = self.errors.clone();
        let id = self.entity().id().to_string();
        let last = Mutex::new(None::<T>);

        move || match f() {
            Ok(value) => {
                *last.lock() = Some(value.clone());
                Some(value)
            }
            Err(e) => {
                errors.fetch_add(1, Ordering::SeqCst);
                error!("[HASS] Error in function wrapped by {}: {}", id, e);
                last.lock().clone()
            }
        }
    }
}
