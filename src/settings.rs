use config::{Config, ConfigError, Environment, File};
use std::time::Duration;

pub const DEFAULT_HOST: &str = "envoy";
pub const DEFAULT_PORT: u16 = 9101;
pub const DEFAULT_INTERVAL: u64 = 10;
pub const DEFAULT_TIMEOUT: u64 = 3;
pub const DEFAULT_ADDRESS: &str = "0.0.0.0";

const CONFIG_FILE: &str = "envoy-exporter";

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct Settings {
    /// Hostname or base URL of the Envoy.
    pub host: String,
    pub port: u16,
    pub address: String,
    /// Minimum seconds between two polls.
    pub interval: u64,
    /// Envoy request timeout in seconds.
    pub timeout: u64,
    pub debug: bool,
}

/// Values given on the command line; these win over file and environment.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub address: Option<String>,
    pub interval: Option<u64>,
    pub timeout: Option<u64>,
    pub debug: bool,
}

impl Settings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

fn defaults(settings: &mut Config) -> Result<(), ConfigError> {
    settings
        .set_default("host", DEFAULT_HOST)?
        .set_default("port", i64::from(DEFAULT_PORT))?
        .set_default("address", DEFAULT_ADDRESS)?
        .set_default("interval", DEFAULT_INTERVAL as i64)?
        .set_default("timeout", DEFAULT_TIMEOUT as i64)?
        .set_default("debug", false)?;
    Ok(())
}

fn apply(settings: &mut Config, overrides: &Overrides) -> Result<(), ConfigError> {
    if let Some(host) = &overrides.host {
        settings.set("host", host.as_str())?;
    }
    if let Some(port) = overrides.port {
        settings.set("port", i64::from(port))?;
    }
    if let Some(address) = &overrides.address {
        settings.set("address", address.as_str())?;
    }
    if let Some(interval) = overrides.interval {
        settings.set("interval", interval as i64)?;
    }
    if let Some(timeout) = overrides.timeout {
        settings.set("timeout", timeout as i64)?;
    }
    if overrides.debug {
        settings.set("debug", true)?;
    }
    Ok(())
}

fn validate(settings: Settings) -> Result<Settings, ConfigError> {
    if settings.interval == 0 {
        return Err(ConfigError::Message("interval must be at least 1 second".into()));
    }
    if settings.timeout == 0 {
        return Err(ConfigError::Message("timeout must be at least 1 second".into()));
    }
    Ok(settings)
}

/// Layer defaults, `envoy-exporter.toml` (optional), `ENVOY_*` variables and `overrides`.
pub fn read_settings(overrides: &Overrides) -> Result<Settings, ConfigError> {
    let mut settings = Config::default();
    defaults(&mut settings)?;
    settings
        .merge(File::with_name(CONFIG_FILE).required(false))?
        .merge(Environment::with_prefix("ENVOY"))?;
    apply(&mut settings, overrides)?;

    validate(settings.try_into()?)
}
