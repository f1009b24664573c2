use std::path::Path;
use std::time::Duration;

use serde_derive::Deserialize;
use serde_json::{Map, Value};

use crate::device::IeeeAddr;

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub advanced: AdvancedConfig,
    pub devices: Option<Vec<DeviceConfig>>,
}

impl AppConfig {
    pub fn from_toml(contents: &str) -> crate::Result<Self> {
        Ok(toml::de::from_str(contents)?)
    }

    pub fn load(path: &Path) -> crate::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub publisher_id: Option<String>,
    pub topic_path: Option<String>,
    pub keep_alive_seconds: Option<u64>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct AdvancedConfig {
    /// Annotate every publish with the milliseconds since the previous one.
    pub elapsed: bool,
    pub event_capacity: Option<usize>,
    /// Only these message types are processed. Everything is processed when unset.
    pub message_types: Option<Vec<String>>,
}

impl AdvancedConfig {
    pub fn accepts(&self, message_type: &str) -> bool {
        self.message_types
            .as_ref()
            .is_none_or(|types| types.iter().any(|t| t == message_type))
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct DeviceConfig {
    pub address: IeeeAddr,
    pub friendly_name: String,
    pub model: Option<String>,
    pub converters: Option<Vec<ConverterConfig>>,
    #[serde(flatten)]
    pub options: DeviceOptions,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ConverterConfig {
    pub cluster: String,
    pub types: Vec<String>,
}

/// Per-device publishing options.
///
/// Keys not recognised here (e.g. `temperature_precision`) are kept in `extra` and read by
/// the post-processing hooks.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct DeviceOptions {
    /// Quiet period in seconds.
    pub debounce: Option<f64>,
    pub debounce_ignore: Option<Vec<String>>,
    pub retain: Option<bool>,
    pub qos: Option<u8>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DeviceOptions {
    /// `None` when debouncing is off: unset, zero, negative or not a number.
    pub fn debounce_period(&self) -> Option<Duration> {
        self.debounce
            .filter(|seconds| seconds.is_finite() && *seconds > 0.0)
            .map(Duration::from_secs_f64)
    }

    pub fn debounce_ignore(&self) -> &[String] {
        self.debounce_ignore.as_deref().unwrap_or_default()
    }

    pub fn number(&self, key: &str) -> Option<f64> {
        self.extra.get(key).and_then(Value::as_f64)
    }
}
