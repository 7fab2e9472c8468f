//! Configuration management
//!
//! Two sources:
//! - service settings (`config.{toml,json,yaml}` in the config dir, then
//!   `MZC_*` environment variables)
//! - the amplifier layout file `amps.json`, which may still be in the legacy
//!   flat-key form and is migrated in place on load

pub mod amps;

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub use amps::{AmpConfig, AmpsConfig, ConfigError, Slot, StructuredConfig};

/// Amplifier layout file name (in the config dir)
pub const AMPS_CONFIG_FILE: &str = "amps.json";

const APP_DIR_NAME: &str = "mzc66-bridge";

#[derive(Debug, Deserialize)]
pub struct Config {
    /// HTTP API port
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Zones per simulated amplifier
    #[serde(default = "default_simulated_zones")]
    pub simulated_zones: usize,

    #[serde(default)]
    pub mqtt: Option<MqttConfig>,
}

fn default_port() -> u16 {
    8089
}

fn default_poll_interval_secs() -> u64 {
    10
}

fn default_simulated_zones() -> usize {
    6
}

#[derive(Debug, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic_prefix: Option<String>,
}

fn default_mqtt_port() -> u16 {
    1883
}

/// Get config directory (MZC_CONFIG_DIR or platform default)
pub fn get_config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("MZC_CONFIG_DIR") {
        return PathBuf::from(dir);
    }

    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library/Application Support")
                .join(APP_DIR_NAME);
        }
    }

    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            return PathBuf::from(xdg).join(APP_DIR_NAME);
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".config").join(APP_DIR_NAME);
        }
    }

    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join(APP_DIR_NAME);
        }
    }

    PathBuf::from(".")
}

pub fn get_config_file_path(filename: &str) -> PathBuf {
    get_config_dir().join(filename)
}

fn env_port() -> Option<u16> {
    std::env::var("PORT").ok()?.parse().ok()
}

pub fn load_config() -> Result<Config> {
    let config_dir = get_config_dir();

    let mut builder = ::config::Config::builder()
        .set_default("port", default_port() as i64)?
        .add_source(
            ::config::File::with_name(&config_dir.join("config").to_string_lossy()).required(false),
        )
        // MZC_POLL_INTERVAL_SECS, MZC_MQTT__HOST, ...
        .add_source(
            ::config::Environment::with_prefix("MZC")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    // Port precedence: MZC_PORT > PORT > config file > default.
    // An unparseable MZC_PORT is also seen by the env source, so it is
    // always overridden here.
    let mzc_port = std::env::var("MZC_PORT").ok();
    let port_override = match mzc_port.as_deref().map(str::parse::<u16>) {
        Some(Ok(port)) => Some(port),
        Some(Err(_)) => {
            tracing::warn!("Ignoring invalid MZC_PORT");
            Some(env_port().unwrap_or_else(default_port))
        }
        None => env_port(),
    };
    if let Some(port) = port_override {
        builder = builder.set_override("port", port as i64)?;
    }

    let config = builder.build()?;

    Ok(config.try_deserialize()?)
}

/// Load the amplifier layout from the config dir.
pub fn load_amps_config() -> Result<StructuredConfig> {
    load_amps_config_from(&get_config_file_path(AMPS_CONFIG_FILE))
}

/// Load an amplifier layout file, rewriting it in structured form if it was
/// still in the legacy layout. A missing file yields an empty layout.
pub fn load_amps_config_from(path: &Path) -> Result<StructuredConfig> {
    if !path.exists() {
        tracing::warn!(
            "No amplifier layout at {}, no zones will be created",
            path.display()
        );
        return Ok(StructuredConfig::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let parsed = AmpsConfig::from_json(&content)
        .with_context(|| format!("parsing {}", path.display()))?;

    let was_legacy = parsed.is_legacy();
    let structured = parsed.resolve()?;

    if was_legacy {
        match serde_json::to_string_pretty(&structured) {
            Ok(json) => match std::fs::write(path, json) {
                Ok(()) => tracing::info!(
                    "Migrated legacy amplifier layout to structured form: {}",
                    path.display()
                ),
                Err(e) => tracing::warn!("Failed to write migrated amplifier layout: {}", e),
            },
            Err(e) => tracing::warn!("Failed to serialize migrated amplifier layout: {}", e),
        }
    }

    Ok(structured)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    #[test]
    #[serial]
    fn test_defaults() {
        env::remove_var("MZC_PORT");
        env::remove_var("PORT");
        env::set_var("MZC_CONFIG_DIR", "/tmp/mzc-test-nonexistent");

        let config = load_config().expect("config should load");

        env::remove_var("MZC_CONFIG_DIR");

        assert_eq!(config.port, 8089);
        assert_eq!(config.poll_interval_secs, 10);
        assert_eq!(config.simulated_zones, 6);
        assert!(config.mqtt.is_none());
    }

    #[test]
    #[serial]
    fn test_port_env_fallback() {
        env::remove_var("MZC_PORT");
        env::remove_var("PORT");
        env::set_var("MZC_CONFIG_DIR", "/tmp/mzc-test-nonexistent");

        env::set_var("PORT", "3000");

        let config = load_config().expect("config should load");

        env::remove_var("PORT");
        env::remove_var("MZC_CONFIG_DIR");

        assert_eq!(config.port, 3000, "PORT env var should set config.port");
    }

    #[test]
    #[serial]
    fn test_mzc_port_takes_precedence_over_port() {
        env::remove_var("MZC_PORT");
        env::remove_var("PORT");
        env::set_var("MZC_CONFIG_DIR", "/tmp/mzc-test-nonexistent");

        env::set_var("MZC_PORT", "5000");
        env::set_var("PORT", "3000");

        let config = load_config().expect("config should load");

        env::remove_var("MZC_PORT");
        env::remove_var("PORT");
        env::remove_var("MZC_CONFIG_DIR");

        assert_eq!(
            config.port, 5000,
            "MZC_PORT should take precedence over PORT"
        );
    }

    #[test]
    #[serial]
    fn test_prefixed_env_vars_apply() {
        env::remove_var("MZC_PORT");
        env::remove_var("PORT");
        env::set_var("MZC_CONFIG_DIR", "/tmp/mzc-test-nonexistent");

        env::set_var("MZC_POLL_INTERVAL_SECS", "3");
        env::set_var("MZC_MQTT__HOST", "broker.local");

        let config = load_config();

        env::remove_var("MZC_POLL_INTERVAL_SECS");
        env::remove_var("MZC_MQTT__HOST");
        env::remove_var("MZC_CONFIG_DIR");

        let config = config.expect("config should load");
        assert_eq!(config.poll_interval_secs, 3);
        let mqtt = config.mqtt.expect("MZC_MQTT__HOST should configure MQTT");
        assert_eq!(mqtt.host, "broker.local");
        assert_eq!(mqtt.port, 1883);
    }

    #[test]
    #[serial]
    fn test_invalid_mzc_port_uses_default() {
        env::remove_var("MZC_PORT");
        env::remove_var("PORT");
        env::set_var("MZC_CONFIG_DIR", "/tmp/mzc-test-nonexistent");

        env::set_var("MZC_PORT", "not-a-number");

        let config = load_config();

        env::remove_var("MZC_PORT");
        env::remove_var("MZC_CONFIG_DIR");

        assert_eq!(config.expect("config should load").port, 8089);
    }

    #[test]
    #[serial]
    fn test_invalid_port_uses_default() {
        env::remove_var("MZC_PORT");
        env::remove_var("PORT");
        env::set_var("MZC_CONFIG_DIR", "/tmp/mzc-test-nonexistent");

        env::set_var("PORT", "not-a-number");

        let config = load_config().expect("config should load");

        env::remove_var("PORT");
        env::remove_var("MZC_CONFIG_DIR");

        assert_eq!(
            config.port, 8089,
            "Invalid PORT should fall back to default"
        );
    }

    #[test]
    #[serial]
    fn test_config_file_sets_mqtt() {
        env::remove_var("MZC_PORT");
        env::remove_var("PORT");
        let temp_dir = tempfile::tempdir().expect("create temp dir");
        std::fs::write(
            temp_dir.path().join("config.json"),
            r#"{"poll_interval_secs": 3, "mqtt": {"host": "broker.local"}}"#,
        )
        .expect("write config");
        env::set_var("MZC_CONFIG_DIR", temp_dir.path());

        let config = load_config().expect("config should load");

        env::remove_var("MZC_CONFIG_DIR");

        assert_eq!(config.poll_interval_secs, 3);
        let mqtt = config.mqtt.expect("mqtt configured");
        assert_eq!(mqtt.host, "broker.local");
        assert_eq!(mqtt.port, 1883);
        assert!(mqtt.topic_prefix.is_none());
    }

    #[test]
    fn test_missing_layout_is_empty() {
        let temp_dir = tempfile::tempdir().expect("create temp dir");
        let layout = load_amps_config_from(&temp_dir.path().join("amps.json"))
            .expect("missing file is not an error");
        assert!(layout.amps.is_empty());
    }

    #[test]
    fn test_legacy_layout_is_migrated_in_place() {
        let temp_dir = tempfile::tempdir().expect("create temp dir");
        let path = temp_dir.path().join("amps.json");
        std::fs::write(
            &path,
            r#"{"amp1_port": "/dev/ttyUSB0", "amp1_zone0": "Kitchen", "amp1_source0": "Tuner", "amp2_port": "/dev/ttyUSB1"}"#,
        )
        .expect("write layout");

        let first = load_amps_config_from(&path).expect("legacy layout loads");
        assert_eq!(first.amps.len(), 2);
        assert_eq!(first.amps[0].zones, vec![Slot::new(0, "Kitchen")]);

        let rewritten = std::fs::read_to_string(&path).expect("read layout");
        assert!(rewritten.contains("\"amps\""), "file should be structured now");

        // Second load reads the structured form and changes nothing
        let second = load_amps_config_from(&path).expect("structured layout loads");
        assert_eq!(second, first);
        assert_eq!(std::fs::read_to_string(&path).expect("read layout"), rewritten);
    }

    #[test]
    fn test_structured_layout_is_not_rewritten() {
        let temp_dir = tempfile::tempdir().expect("create temp dir");
        let path = temp_dir.path().join("amps.json");
        let original = r#"{"amps": [{"port": "/dev/ttyUSB0", "sources": ["CD"], "zones": ["Den"]}]}"#;
        std::fs::write(&path, original).expect("write layout");

        let layout = load_amps_config_from(&path).expect("layout loads");
        assert_eq!(layout.amps[0].zone_names(), vec!["Den"]);
        assert_eq!(std::fs::read_to_string(&path).expect("read layout"), original);
    }

    #[test]
    #[serial]
    fn test_config_dir_env_override() {
        let temp_dir = tempfile::tempdir().expect("create temp dir");
        env::set_var("MZC_CONFIG_DIR", temp_dir.path());

        let path = get_config_file_path(AMPS_CONFIG_FILE);

        env::remove_var("MZC_CONFIG_DIR");

        assert_eq!(path, temp_dir.path().join("amps.json"));
    }
}
