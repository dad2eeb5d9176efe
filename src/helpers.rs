//! Ready-made sensors and function wrappers built on the core entities.

use crate::entity::EntityConfig;
use crate::error::Result;
use crate::router::Router;
use crate::sensor::{NumberRange, Sensor, SettableSensor, format_verbatim};
use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Sensor reporting the mean of the numeric states of `sensors`.
///
/// Inputs without a numeric reading are left out; with none left the
/// average is `0.0`.
pub fn average_sensor(
    router: &Arc<Router>,
    options: EntityConfig,
    unit_of_measurement: &str,
    sensors: &[Arc<Sensor>],
) -> Result<Arc<Sensor>> {
    let sensors = sensors.to_vec();
    Sensor::builder(options, unit_of_measurement)
        .state_fn(move || {
            let values: Vec<f64> = sensors.iter().filter_map(|s| s.state().as_f64()).collect();
            mean(&values)
        })
        .build(router)
}

/// Sensor reporting the weighted mean of `sensors`.
///
/// Every input gets a [`SettableSensor`] named `"<input name> weight"` so
/// the weights can be tuned from Home Assistant. The weights use their own
/// topics and share node, availability and discovery settings with
/// `options`. When all weights are zero the plain mean is reported.
pub fn weighted_average_sensor(
    router: &Arc<Router>,
    options: EntityConfig,
    unit_of_measurement: &str,
    weight_range: NumberRange,
    sensors: &[Arc<Sensor>],
) -> Result<(Arc<Sensor>, Vec<Arc<SettableSensor>>)> {
    let mut pairs = Vec::with_capacity(sensors.len());
    for sensor in sensors {
        let mut weight_options = EntityConfig::new(format!("{} weight", sensor.name()))
            .with_icon("mdi:weight")
            .with_availability(options.availability)
            .with_auto_discovery(options.auto_discovery);
        weight_options.node_id = options.node_id.clone();

        let weight = SettableSensor::builder(weight_options, "", weight_range).build(router)?;
        pairs.push((sensor.clone(), weight));
    }

    let weights: Vec<Arc<SettableSensor>> = pairs.iter().map(|(_, w)| w.clone()).collect();
    let aggregate = Sensor::builder(options, unit_of_measurement)
        .state_fn(move || {
            let readings: Vec<(f64, f64)> = pairs
                .iter()
                .filter_map(|(s, w)| Some((s.state().as_f64()?, w.state())))
                .collect();

            let sum_weights: f64 = readings.iter().map(|(_, w)| w).sum();
            if sum_weights == 0.0 {
                let values: Vec<f64> = readings.iter().map(|(v, _)| *v).collect();
                return mean(&values);
            }
            readings.iter().map(|(v, w)| v * w).sum::<f64>() / sum_weights
        })
        .build(router)?;

    Ok((aggregate, weights))
}

/// Sensor reporting the time of the last state push as an RFC 3339 UTC
/// timestamp.
pub fn last_update_sensor(router: &Arc<Router>, options: EntityConfig) -> Result<Arc<Sensor>> {
    Sensor::builder(
        options
            .with_icon("mdi:clock")
            .with_device_class("timestamp"),
        "",
    )
    .state_fn(|| Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false))
    .formatter(format_verbatim)
    .build(router)
}

/// Remember the last `Some` result of `f` and return it while `f` yields
/// `None`.
pub fn result_cache<T, F>(f: F) -> impl Fn() -> Option<T> + Send + Sync + 'static
where
    F: Fn() -> Option<T> + Send + Sync + 'static,
    T: Clone + Send + 'static,
{
    let last = Mutex::new(None::<T>);
    move || {
        let mut last = last.lock();
        if let Some(value) = f() {
            *last = Some(value);
        }
        last.clone()
    }
}

/// Limits wrapped functions to one real call per update cycle.
///
/// Results are memoized until [`FuncCallLimiter::clear`] starts the next
/// cycle, so several sensors can read one expensive source.
#[derive(Clone, Default)]
pub struct FuncCallLimiter {
    cycle: Arc<AtomicU64>,
}

impl FuncCallLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wrap<T, F>(&self, f: F) -> impl Fn() -> T + Send + Sync + 'static
    where
        F: Fn() -> T + Send + Sync + 'static,
        T: Clone + Send + 'static,
    {
        let cycle = self.cycle.clone();
        let memo = Mutex::new(None::<(u64, T)>);
        move || {
            let current = cycle.load(Ordering::SeqCst);
            let mut memo = memo.lock();
            match memo.as_ref() {
                Some((seen, value)) if *seen == current => value.clone(),
                _ => {
                    let value = f();
                    *memo = Some((current, value.clone()));
                    value
                }
            }
        }
    }

    /// Forget every memoized result.
    pub fn clear(&self) {
        self.cycle.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topic::SharedTopic;
    use crate::transport::{MemoryTransport, Payload};
    use std::sync::atomic::AtomicUsize;

    fn setup() -> (Arc<MemoryTransport>, Arc<Router>) {
        let transport = Arc::new(MemoryTransport::new());
        let router = Router::new(transport.clone());
        (transport, router)
    }

    fn fixed(router: &Arc<Router>, name: &str, value: f64) -> Arc<Sensor> {
        Sensor::builder(EntityConfig::new(name), "°C")
            .state_fn(move || value)
            .build(router)
            .unwrap()
    }

    #[test]
    fn test_average() {
        let (_, router) = setup();
        let inputs = [
            fixed(&router, "S 1", 1.0),
            fixed(&router, "S 2", 4.0),
            fixed(&router, "S 3", 7.0),
        ];
        let avg = average_sensor(&router, EntityConfig::new("Avg"), "°C", &inputs).unwrap();
        assert_eq!(avg.formatted_state(), "4.00");

        let empty = average_sensor(&router, EntityConfig::new("Empty"), "°C", &[]).unwrap();
        assert_eq!(empty.state().as_f64(), Some(0.0));
    }

    #[test]
    fn test_average_skips_missing() {
        let (_, router) = setup();
        let missing = Sensor::builder(EntityConfig::new("Broken"), "°C")
            .state_fn(|| None::<f64>)
            .build(&router)
            .unwrap();
        let inputs = [fixed(&router, "S 1", 3.0), missing];
        let avg = average_sensor(&router, EntityConfig::new("Avg"), "°C", &inputs).unwrap();
        assert_eq!(avg.state().as_f64(), Some(3.0));
    }

    #[test]
    fn test_weighted_average() {
        let (transport, router) = setup();
        let inputs = [
            fixed(&router, "S 1", 1.0),
            fixed(&router, "S 2", 4.0),
            fixed(&router, "S 3", 7.0),
        ];
        let (avg, weights) = weighted_average_sensor(
            &router,
            EntityConfig::new("Weighted"),
            "°C",
            NumberRange::new(0.0, 200.0, 1.0, 100.0),
            &inputs,
        )
        .unwrap();

        let names: Vec<&str> = weights.iter().map(|w| w.entity().name()).collect();
        assert_eq!(names, vec!["S 1 weight", "S 2 weight", "S 3 weight"]);
        assert_eq!(weights[0].entity().icon(), Some("mdi:weight"));
        assert_eq!(avg.formatted_state(), "4.00");

        for (weight, value) in weights.iter().zip(["20", "40", "80"]) {
            router.dispatch(weight.command_topic_name(), value);
        }
        assert_eq!(avg.formatted_state(), "5.29");

        assert_eq!(
            transport.messages("homeassistant/sensor/s_1_weight/state"),
            vec![Payload::from("20.00")]
        );
    }

    #[test]
    fn test_weighted_average_zero_weights() {
        let (_, router) = setup();
        let inputs = [fixed(&router, "S 1", 2.0), fixed(&router, "S 2", 4.0)];
        let (avg, _) = weighted_average_sensor(
            &router,
            EntityConfig::new("Weighted"),
            "°C",
            NumberRange::new(0.0, 200.0, 1.0, 0.0),
            &inputs,
        )
        .unwrap();
        assert_eq!(avg.state().as_f64(), Some(3.0));
    }

    #[test]
    fn test_weights_keep_own_topics() {
        let (_, router) = setup();
        let shared = SharedTopic::new(&router, "/my/topic");
        let inputs = [fixed(&router, "S 1", 2.0)];
        let (avg, weights) = weighted_average_sensor(
            &router,
            EntityConfig::new("Weighted")
                .with_shared_state(&shared)
                .with_icon("mdi:thermometer-lines")
                .with_availability(true),
            "°C",
            NumberRange::new(0.0, 200.0, 1.0, 100.0),
            &inputs,
        )
        .unwrap();

        assert_eq!(shared.len(), 1);
        assert_eq!(avg.entity().icon(), Some("mdi:thermometer-lines"));
        assert!(weights[0].entity().has_availability());
        assert_eq!(
            weights[0].state_topic_name(),
            "homeassistant/sensor/s_1_weight/state"
        );
    }

    #[test]
    fn test_last_update_sensor() {
        let (transport, router) = setup();
        let sensor = last_update_sensor(&router, EntityConfig::new("Last Update")).unwrap();
        let config = sensor.entity().config();
        assert_eq!(config["icon"], "mdi:clock");
        assert_eq!(config["device_class"], "timestamp");
        assert_eq!(config["unit_of_measurement"], "");

        sensor.send_update().unwrap();
        let messages = transport.messages("homeassistant/sensor/last_update/state");
        let Payload::Text(stamp) = &messages[0] else {
            panic!("expected a text payload, got {:?}", messages[0]);
        };
        assert!(chrono::DateTime::parse_from_rfc3339(stamp).is_ok());
        assert!(stamp.ends_with("+00:00"));
    }

    #[test]
    fn test_result_cache() {
        let calls = AtomicUsize::new(0);
        let cached = result_cache(move || match calls.fetch_add(1, Ordering::SeqCst) {
            0 => None,
            1 => Some(1),
            2 => None,
            n => Some(n),
        });
        assert_eq!(cached(), None);
        assert_eq!(cached(), Some(1));
        assert_eq!(cached(), Some(1));
        assert_eq!(cached(), Some(3));
    }

    #[test]
    fn test_call_limiter() {
        let limiter = FuncCallLimiter::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let limited = limiter.wrap(move || counter.fetch_add(1, Ordering::SeqCst));

        assert_eq!(limited(), 0);
        assert_eq!(limited(), 0);
        limiter.clear();
        assert_eq!(limited(), 1);
        assert_eq!(limited(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
