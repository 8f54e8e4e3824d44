use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_yml;
use std::fs::File;
use std::io::prelude::*;
use thiserror::Error;

use crate::metering_p1::P1Config;

/// Config files tried in order when no path is given.
pub const CONFIG_PATHS: [&str; 2] = ["config/p1.yaml", "p1.yaml"];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unable to read the config on {0}")]
    NotFound(String),
    #[error("Unable to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Unable to parse config file: {0}")]
    Parse(#[from] serde_yml::Error),
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct SensorConfig {
    pub name: String,
    /// `A-B:C.D.E` or `C.D.E`
    pub obis: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct TextSensorConfig {
    pub name: String,
    /// Prefix of the telegram lines handed to this sensor
    pub identifier: String,
}

fn minimum_period_default() -> u64 { return 0 }
fn buffer_size_default() -> usize { return 3000 }
fn loop_interval_default() -> u64 { return 10 }
fn sensors_default() -> Vec<SensorConfig> { return Vec::new() }
fn text_sensors_default() -> Vec<TextSensorConfig> { return Vec::new() }

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct Config {
    #[serde(default="minimum_period_default")]
    pub minimum_period_ms: u64,
    #[serde(default="buffer_size_default")]
    pub buffer_size: usize,
    #[serde(default="loop_interval_default")]
    pub loop_interval_ms: u64,
    /// Read from `host:port` instead of stdin
    #[serde(default)]
    pub tcp: Option<String>,
    #[serde(default="sensors_default")]
    pub sensors: Vec<SensorConfig>,
    #[serde(default="text_sensors_default")]
    pub text_sensors: Vec<TextSensorConfig>,
}

impl Default for Config {
    fn default() -> Self {
        return Config {
            minimum_period_ms: minimum_period_default(),
            buffer_size: buffer_size_default(),
            loop_interval_ms: loop_interval_default(),
            tcp: None,
            sensors: sensors_default(),
            text_sensors: text_sensors_default(),
        };
    }
}

impl Config {
    /// Load `path`, or the first file of [`CONFIG_PATHS`] that can be opened.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let (mut file, used_path) = match path {
            Some(p) => (File::open(p).map_err(|_| ConfigError::NotFound(p.to_string()))?, p),
            None => {
                let found = CONFIG_PATHS.iter()
                    .find_map(|p| File::open(p).ok().map(|f| (f, *p)));
                match found {
                    Some(f) => f,
                    None => return Err(ConfigError::NotFound(CONFIG_PATHS.join(" or "))),
                }
            }
        };

        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        let config = Config::parse(&contents)?;
        info!("Config loaded from {} ({} sensors, {} text sensors)",
            used_path, config.sensors.len(), config.text_sensors.len());
        return Ok(config);
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yml::from_str(contents)?;
        debug!("Parsed config: {:?}", config);
        return Ok(config);
    }

    pub fn p1_config(&self) -> P1Config {
        return P1Config {
            minimum_period_ms: self.minimum_period_ms,
            buffer_size: self.buffer_size,
        };
    }
}
