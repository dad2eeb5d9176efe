use clap::Parser;
use ha_mqtt::climate::{Climate, ClimateMode};
use ha_mqtt::config::{self, Cli, env_name, env_value};
use ha_mqtt::entity::{EntityConfig, id_from_name};
use ha_mqtt::helpers::{
    FuncCallLimiter, average_sensor, last_update_sensor, result_cache, weighted_average_sensor,
};
use ha_mqtt::runtime::run_update_loop;
use ha_mqtt::sensor::{ErrorSensor, NumberRange, Sensor};
use ha_mqtt::topic::SharedTopic;
use ha_mqtt::transport::{MemoryTransport, MqttTransport};
use ha_mqtt::{Registry, Result, Router};
use log::{error, info, warn};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Time for the event loop to flush the offline/teardown messages.
const FLUSH_DELAY: Duration = Duration::from_millis(500);
const SHARED_STATE_TOPIC: &str = "ha-mqtt/demo/state";

fn init_logger(level: &str) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_millis()
        .init();
}

struct Demo {
    registry: Registry,
    limiter: FuncCallLimiter,
}

/// Simulated thermometer failing on roughly one read in ten.
fn read_temperature() -> std::result::Result<f64, String> {
    let mut rng = rand::thread_rng();
    if rng.gen_bool(0.1) {
        return Err("simulated sensor failure".to_string());
    }
    Ok(rng.gen_range(0.0..100.0))
}

fn temperature_source(
    limiter: &FuncCallLimiter,
    errors: &ErrorSensor,
) -> impl Fn() -> Option<f64> + Send + Sync + 'static {
    limiter.wrap(result_cache(errors.wrap_function(read_temperature)))
}

fn build_components(router: &Arc<Router>, cli: &Cli) -> Result<Demo> {
    let state = SharedTopic::new(router, SHARED_STATE_TOPIC);
    let mut registry = Registry::new().with_settle_delay(cli.settle_delay());
    registry.add_shared_topic(&state);

    let options = |name: &str| {
        EntityConfig::new(env_name(name))
            .with_id(id_from_name(name))
            .with_availability(cli.availability)
            .with_auto_discovery(!cli.no_discovery)
    };
    let shared = |name: &str| options(name).with_shared_state(&state);

    let errors = ErrorSensor::new(router, shared("Errors"))?;
    registry.add_component(errors.clone(), true);

    let last_update = last_update_sensor(router, shared("Last Update"))?;
    registry.add_component(last_update, true);

    let limiter = FuncCallLimiter::new();
    let mut temperatures = Vec::new();
    for name in ["Temp 1", "Temp 2"] {
        let sensor = Sensor::builder(shared(name).with_device_class("temperature"), "°C")
            .state_fn(temperature_source(&limiter, &errors))
            .build(router)?;
        registry.add_component(sensor.clone(), true);
        temperatures.push(sensor);
    }

    let average = average_sensor(
        router,
        shared("Temp Average").with_icon("mdi:thermometer-lines"),
        "°C",
        &temperatures,
    )?;
    registry.add_component(average, true);

    let initial_weight = env_value("Temp Weight Average weight", 100.0);
    let (weighted, weights) = weighted_average_sensor(
        router,
        shared("Temp Weight Average").with_icon("mdi:thermometer-lines"),
        "°C",
        NumberRange::new(0.0, 200.0, 1.0, initial_weight),
        &temperatures,
    )?;
    registry.add_component(weighted.clone(), true);
    registry.add_components(weights, false);

    let boiler = Climate::builder(options("Boiler"))
        .thermometer(move || weighted.state().as_f64().unwrap_or_default())
        .on_change(|mode: ClimateMode, target| {
            info!("Boiler changed: mode {}, target {:.1}", mode, target);
        })
        .build(router)?;
    registry.add_component(boiler, true);

    if cli.no_discovery {
        info!("Hub configuration:\n{}", registry.create_config()?);
    }

    Ok(Demo { registry, limiter })
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }
}

fn print_config(cli: &Cli) -> Result<()> {
    let router = Router::new(Arc::new(MemoryTransport::new()));
    let demo = build_components(&router, cli)?;
    println!("{}", demo.registry.create_config()?);
    Ok(())
}

#[tokio::main]
async fn main() {
    config::load_dotenv();
    let cli = Cli::parse();
    init_logger(&cli.log_level);

    if cli.print_config {
        if let Err(e) = print_config(&cli) {
            error!("Failed to build configuration: {}", e);
            std::process::exit(1);
        }
        return;
    }

    info!("Starting ha-mqtt demo");
    let mqtt_config = cli.mqtt_config();
    info!(
        "Connecting to MQTT broker at {}:{} as {}",
        mqtt_config.broker_host, mqtt_config.broker_port, mqtt_config.client_id
    );

    let (transport, mut event_loop) = MqttTransport::new(&mqtt_config);
    if let Err(e) = event_loop.wait_connected(CONNECT_TIMEOUT).await {
        error!("{}", e);
        std::process::exit(1);
    }

    let transport = Arc::new(transport);
    let router = Router::new(transport.clone());
    let demo = match build_components(&router, &cli) {
        Ok(demo) => demo,
        Err(e) => {
            error!("Failed to create components: {}", e);
            std::process::exit(1);
        }
    };

    let (msg_tx, msg_rx) = mpsc::channel(100);
    let mqtt_handle = tokio::spawn(event_loop.run(router.clone(), msg_tx));

    let started = match demo.registry.start().await {
        Ok(started) => started,
        Err(e) => {
            error!("Failed to start components: {}", e);
            std::process::exit(1);
        }
    };
    info!("Demo running, press Ctrl+C to exit");

    run_update_loop(
        started.registry(),
        &router,
        msg_rx,
        cli.update_interval(),
        shutdown_signal(),
        || demo.limiter.clear(),
    )
    .await;

    started.stop();
    tokio::time::sleep(FLUSH_DELAY).await;
    if let Err(e) = transport.disconnect() {
        warn!("Failed to disconnect cleanly: {}", e);
    }
    if tokio::time::timeout(FLUSH_DELAY, mqtt_handle).await.is_err() {
        warn!("MQTT event loop did not stop in time");
    }

    info!("ha-mqtt demo stopped");
}
