//! Configuration document.
//!
//! Component sections are kept as raw YAML maps here; the registry parses
//! each one into typed settings once the component's type is known, so that
//! every problem in the document can be reported in one pass.

use crate::error::ConfigError;
use crate::record::SignalType;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Options of one component, before typed parsing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Options(pub Mapping);

impl<'de> Deserialize<'de> for Options {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // `batch:` with no body is an empty option map.
        match Option::<Mapping>::deserialize(deserializer)? {
            Some(mapping) => Ok(Self(mapping)),
            None => Ok(Self::default()),
        }
    }
}

impl Options {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(Value::from(key), value.into());
    }

    /// Removes `key`, returning its value.
    pub fn take(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    pub signal_type: SignalType,
    #[serde(default)]
    pub receivers: Vec<String>,
    #[serde(default)]
    pub processors: Vec<String>,
    #[serde(default)]
    pub exporters: Vec<String>,
    /// Capacity of the intake queue and of each inter-stage channel.
    #[serde(default)]
    pub queue_size: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceSettings {
    #[serde(default = "default_health_interval", with = "duration")]
    pub health_interval: Duration,
    #[serde(default = "default_shutdown_timeout", with = "duration")]
    pub shutdown_timeout: Duration,
}

fn default_health_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            health_interval: default_health_interval(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub receivers: BTreeMap<String, Options>,
    #[serde(default)]
    pub processors: BTreeMap<String, Options>,
    #[serde(default)]
    pub exporters: BTreeMap<String, Options>,
    #[serde(default)]
    pub pipelines: BTreeMap<String, PipelineConfig>,
    #[serde(default)]
    pub service: ServiceSettings,
}

impl Config {
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    /// Reads `path` and applies endpoint overrides from the process
    /// environment.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Self::from_path(path)?;
        config.apply_env_overrides(std::env::vars());
        Ok(config)
    }

    /// Applies `TPIPE_RECEIVER_<ID>_ENDPOINT` / `TPIPE_EXPORTER_<ID>_ENDPOINT`
    /// overrides. For `file` exporters the variable sets `path` instead.
    pub fn apply_env_overrides<I, K, V>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let vars: BTreeMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.as_ref().to_string(), v.into()))
            .collect();

        for (id, options) in &mut self.receivers {
            if let Some(value) = vars.get(&env_key("RECEIVER", id)) {
                tracing::info!(component = %id, "endpoint overridden from environment");
                options.set("endpoint", value.as_str());
            }
        }
        for (id, options) in &mut self.exporters {
            if let Some(value) = vars.get(&env_key("EXPORTER", id)) {
                let key = if id.split('/').next() == Some("file") {
                    "path"
                } else {
                    "endpoint"
                };
                tracing::info!(component = %id, key, "exporter option overridden from environment");
                options.set(key, value.as_str());
            }
        }
    }
}

/// `stream/in` -> `TPIPE_RECEIVER_STREAM_IN_ENDPOINT`.
pub fn env_key(section: &str, id: &str) -> String {
    let id: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("TPIPE_{section}_{id}_ENDPOINT")
}

/// Parses a raw option map into typed settings, rendering the serde error
/// as a human reason.
pub fn parse_options<T: DeserializeOwned>(options: &Options) -> Result<T, String> {
    serde_yaml::from_value(Value::Mapping(options.0.clone())).map_err(|e| e.to_string())
}

/// Human-readable durations (`200ms`, `5s`, `1m 30s`).
pub mod duration {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use serde::{Deserialize, Deserializer};
        use std::time::Duration;

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            match Option::<String>::deserialize(deserializer)? {
                Some(text) => humantime::parse_duration(&text)
                    .map(Some)
                    .map_err(serde::de::Error::custom),
                None => Ok(None),
            }
        }
    }
}
