use std::fmt;
use std::str::FromStr;

use envconfig::Envconfig;
use opentelemetry::KeyValue;
use thiserror::Error;

/// Raw service identity and sink settings, as read from the environment.
///
/// Every identity field is required; [`Config::try_from`] validates the values.
#[derive(Envconfig, Clone, Debug)]
pub struct EnvConfig {
    #[envconfig(from = "SERVICE_NAME")]
    pub name: String,

    #[envconfig(from = "SERVICE_NAMESPACE")]
    pub project: String,

    #[envconfig(from = "SERVICE_VERSION")]
    pub version: String,

    #[envconfig(from = "DEPLOYMENT_ENVIRONMENT")]
    pub env: String,

    #[envconfig(from = "SERVICE_INSTANCE_ID")]
    pub instance_id: String,

    #[envconfig(nested = true)]
    pub sinks: SinkConfig,
}

impl EnvConfig {
    /// Read the config from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::init_from_env().map_err(|e| ConfigError::Env(e.to_string()))
    }
}

/// Settings for the optional telemetry backends.
#[derive(Envconfig, Clone, Debug, PartialEq)]
pub struct SinkConfig {
    #[envconfig(from = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    pub otel_url: Option<String>,

    #[envconfig(from = "OTEL_SAMPLING_RATE", default = "1.0")]
    pub otel_sampling_rate: f64,

    #[envconfig(from = "OTEL_EXPORT_TIMEOUT_SECS", default = "3")]
    pub otel_export_timeout_secs: u64,

    #[envconfig(from = "ERROR_REPORTING_URL")]
    pub error_reporting_url: Option<String>,

    #[envconfig(from = "APM_LOGS_URL")]
    pub apm_logs_url: Option<String>,

    #[envconfig(from = "METRICS_ENABLED", default = "true")]
    pub metrics_enabled: bool,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            otel_url: None,
            otel_sampling_rate: 1.0,
            otel_export_timeout_secs: 3,
            error_reporting_url: None,
            apm_logs_url: None,
            metrics_enabled: true,
        }
    }
}

/// The environment in which the service runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Environment {
    Dev,
    Staging,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Dev => "dev",
            Environment::Staging => "staging",
            Environment::Production => "production",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dev" => Ok(Environment::Dev),
            "staging" => Ok(Environment::Staging),
            "production" => Ok(Environment::Production),
            other => Err(ConfigError::InvalidEnvironment(other.to_owned())),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is empty")]
    Empty(&'static str),
    #[error("invalid env: [{0}]")]
    InvalidEnvironment(String),
    #[error("could not read config from environment: {0}")]
    Env(String),
}

/// Validated config snapshot carried by every telemetry context.
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub name: String,
    pub project: String,
    pub version: String,
    pub env: Environment,
    pub instance_id: String,
    pub sinks: SinkConfig,
}

impl Config {
    /// OpenTelemetry resource attributes identifying this service instance.
    pub fn resource(&self) -> Vec<KeyValue> {
        vec![
            KeyValue::new("service.name", self.name.clone()),
            KeyValue::new("service.namespace", self.project.clone()),
            KeyValue::new("service.version", self.version.clone()),
            KeyValue::new("service.instance.id", self.instance_id.clone()),
            KeyValue::new("deployment.environment", self.env.as_str()),
            KeyValue::new("os.type", std::env::consts::OS),
        ]
    }
}

impl TryFrom<EnvConfig> for Config {
    type Error = ConfigError;

    fn try_from(raw: EnvConfig) -> Result<Self, Self::Error> {
        if raw.name.is_empty() {
            return Err(ConfigError::Empty("name"));
        }
        if raw.project.is_empty() {
            return Err(ConfigError::Empty("project"));
        }
        let env = raw.env.parse::<Environment>()?;
        if raw.version.is_empty() {
            return Err(ConfigError::Empty("version"));
        }
        if raw.instance_id.is_empty() {
            return Err(ConfigError::Empty("instance id"));
        }

        Ok(Config {
            name: raw.name,
            project: raw.project,
            version: raw.version,
            env,
            instance_id: raw.instance_id,
            sinks: raw.sinks,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn valid_env() -> HashMap<String, String> {
        env(&[
            ("SERVICE_NAME", "checkout"),
            ("SERVICE_NAMESPACE", "shop"),
            ("SERVICE_VERSION", "1.2.3"),
            ("DEPLOYMENT_ENVIRONMENT", "staging"),
            ("SERVICE_INSTANCE_ID", "pod-1"),
        ])
    }

    #[test]
    fn parses_valid_config_with_sink_defaults() {
        let raw = EnvConfig::init_from_hashmap(&valid_env()).unwrap();
        let config = Config::try_from(raw).unwrap();

        assert_eq!(config.name, "checkout");
        assert_eq!(config.env, Environment::Staging);
        assert_eq!(config.sinks, SinkConfig::default());
    }

    #[test]
    fn rejects_unknown_environment() {
        let mut vars = valid_env();
        vars.insert("DEPLOYMENT_ENVIRONMENT".to_string(), "qa".to_string());
        let raw = EnvConfig::init_from_hashmap(&vars).unwrap();

        assert_eq!(
            Config::try_from(raw),
            Err(ConfigError::InvalidEnvironment("qa".to_string()))
        );
    }

    #[test]
    fn rejects_empty_fields_in_order() {
        let mut vars = valid_env();
        vars.insert("SERVICE_VERSION".to_string(), "".to_string());
        vars.insert("SERVICE_INSTANCE_ID".to_string(), "".to_string());
        let raw = EnvConfig::init_from_hashmap(&vars).unwrap();

        assert_eq!(Config::try_from(raw), Err(ConfigError::Empty("version")));
    }

    #[test]
    fn missing_variable_is_an_error() {
        let mut vars = valid_env();
        vars.remove("SERVICE_NAME");

        assert!(EnvConfig::init_from_hashmap(&vars).is_err());
    }

    #[test]
    fn resource_carries_identity() {
        let raw = EnvConfig::init_from_hashmap(&valid_env()).unwrap();
        let resource = Config::try_from(raw).unwrap().resource();

        assert!(resource.contains(&KeyValue::new("service.name", "checkout")));
        assert!(resource.contains(&KeyValue::new("deployment.environment", "staging")));
    }
}
