use chinv_lib::{bus::DEFAULT_INTERFACE, device::DeviceConfig};
use serde::Deserialize;
use std::fs::File;
use std::path::Path;
use std::time::Duration;

/// Settings read from the YAML configuration file.
///
/// ```yaml
/// interface: can1
/// poll_interval: 1s
/// device:
///   address: 0
///   desired_power: 1500.0
///   timing:
///     setpoint_cooldown: 5s
///   preset:
///     float_voltage: 54.6
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
    #[serde(default = "default_interface")]
    pub interface: String,
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(default)]
    pub device: DeviceConfig,
}

fn default_interface() -> String {
    String::from(DEFAULT_INTERFACE)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            poll_interval: default_poll_interval(),
            device: DeviceConfig::default(),
        }
    }
}

impl Config {
    /// Loads `path`, or returns the defaults if no file was given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        log::debug!("Loading config file from {path:?}");
        let config_file = File::open(path)?;
        let config: Config = serde_yaml::from_reader(&config_file)?;
        Ok(config)
    }
}
