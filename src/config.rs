use clap::Parser;
use log::warn;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

pub const DEFAULT_MQTT_HOST: &str = "homeassistant.local";
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// Load environment variables from a `.env` file in the working directory.
/// Values may contain spaces without quoting; variables already set win.
pub fn load_dotenv() {
    let env_path = Path::new(".env");
    let Ok(content) = fs::read_to_string(env_path) else {
        return;
    };

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let mut value = value.trim();
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            value = &value[1..value.len() - 1];
        }

        if std::env::var(key).is_err() {
            // SAFETY: called at startup before the runtime spawns threads
            unsafe { std::env::set_var(key, value) };
        }
    }
}

/// `"Temp 1"` → `"TEMP_1"`
fn override_suffix(name: &str) -> String {
    name.replace(' ', "_").to_uppercase()
}

/// Display name of an entity, overridable with `OVERRIDE_NAME_<NAME>`.
pub fn env_name(name: &str) -> String {
    std::env::var(format!("OVERRIDE_NAME_{}", override_suffix(name)))
        .unwrap_or_else(|_| name.to_string())
}

/// Value for the entity `name`, overridable with `OVERRIDE_VALUE_<NAME>`.
///
/// An override that does not parse is ignored with a warning.
pub fn env_value<T: FromStr>(name: &str, default: T) -> T {
    let key = format!("OVERRIDE_VALUE_{}", override_suffix(name));
    match std::env::var(&key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Ignoring unparsable override {}={:?}", key, raw);
            default
        }),
        Err(_) => default,
    }
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_host: DEFAULT_MQTT_HOST.to_string(),
            broker_port: DEFAULT_MQTT_PORT,
            client_id: default_client_id(),
            username: None,
            password: None,
        }
    }
}

fn default_client_id() -> String {
    format!("ha-mqtt-{}", Uuid::new_v4().simple())
}

#[derive(Debug, Parser)]
#[command(name = "ha-mqtt-demo")]
#[command(about = "Publish demo sensors, weights and a climate controller to Home Assistant")]
pub struct Cli {
    /// MQTT broker host
    #[arg(long, env = "MQTT_HOST", default_value = DEFAULT_MQTT_HOST)]
    pub mqtt_host: String,

    /// MQTT broker port
    #[arg(long, env = "MQTT_PORT", default_value_t = DEFAULT_MQTT_PORT)]
    pub mqtt_port: u16,

    /// MQTT client id (random when unset)
    #[arg(long, env = "MQTT_CLIENT_ID")]
    pub mqtt_client_id: Option<String>,

    /// MQTT username
    #[arg(long, env = "MQTT_USER")]
    pub mqtt_user: Option<String>,

    /// MQTT password
    #[arg(long, env = "MQTT_PASS", hide_env_values = true)]
    pub mqtt_pass: Option<String>,

    /// Log filter, e.g. `info` or `ha_mqtt=debug`
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Seconds between state pushes
    #[arg(long, env = "UPDATE_INTERVAL_SECS", default_value_t = 1)]
    pub update_interval_secs: u64,

    /// Seconds to wait between discovery and availability
    #[arg(long, env = "SETTLE_DELAY_SECS", default_value_t = 1)]
    pub settle_delay_secs: u64,

    /// Print the hub configuration as YAML and exit without connecting
    #[arg(long)]
    pub print_config: bool,

    /// Do not publish discovery documents (configure the hub by hand)
    #[arg(long)]
    pub no_discovery: bool,

    /// Announce availability of every entity
    #[arg(long)]
    pub availability: bool,
}

impl Cli {
    pub fn mqtt_config(&self) -> MqttConfig {
        MqttConfig {
            broker_host: self.mqtt_host.clone(),
            broker_port: self.mqtt_port,
            client_id: self
                .mqtt_client_id
                .clone()
                .unwrap_or_else(default_client_id),
            username: self.mqtt_user.clone(),
            password: self.mqtt_pass.clone(),
        }
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs.max(1))
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_delay_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["ha-mqtt-demo"]).unwrap();
        // Environment may override these on a developer machine.
        if std::env::var("MQTT_HOST").is_err() {
            assert_eq!(cli.mqtt_host, DEFAULT_MQTT_HOST);
        }
        assert!(!cli.print_config);
        assert!(!cli.no_discovery);

        let mqtt = cli.mqtt_config();
        if std::env::var("MQTT_CLIENT_ID").is_err() {
            assert!(mqtt.client_id.starts_with("ha-mqtt-"));
        }
    }

    #[test]
    fn test_cli_flags() {
        let cli = Cli::try_parse_from([
            "ha-mqtt-demo",
            "--mqtt-host",
            "broker.lan",
            "--mqtt-port",
            "1884",
            "--mqtt-client-id",
            "demo",
            "--settle-delay-secs",
            "0",
            "--print-config",
            "--availability",
        ])
        .unwrap();

        let mqtt = cli.mqtt_config();
        assert_eq!(mqtt.broker_host, "broker.lan");
        assert_eq!(mqtt.broker_port, 1884);
        assert_eq!(mqtt.client_id, "demo");
        assert_eq!(cli.settle_delay(), Duration::ZERO);
        assert!(cli.print_config);
        assert!(cli.availability);
    }

    #[test]
    fn test_overrides() {
        assert_eq!(override_suffix("Temp 1"), "TEMP_1");

        // SAFETY: test-only variables with names no other test touches
        unsafe {
            std::env::set_var("OVERRIDE_NAME_OVERRIDE_TEST_A", "Renamed");
            std::env::set_var("OVERRIDE_VALUE_OVERRIDE_TEST_A", "42.5");
            std::env::set_var("OVERRIDE_VALUE_OVERRIDE_TEST_B", "lots");
        }
        assert_eq!(env_name("override test a"), "Renamed");
        assert_eq!(env_name("override test c"), "override test c");
        assert_eq!(env_value("override test a", 1.0), 42.5);
        assert_eq!(env_value("override test b", 7u32), 7);
        assert_eq!(env_value("override test c", 3i64), 3);
    }
}
