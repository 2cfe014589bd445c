use serde_derive::Deserialize;
use thiserror::Error;

use crate::engine::{
    DEFAULT_DEBOUNCE_OCCUPIED_MS, DEFAULT_DEBOUNCE_VACANT_MS, DEFAULT_OCCUPIED_THRESHOLD,
    DEFAULT_VACANT_THRESHOLD, DebounceDurations, Thresholds,
};

pub const THRESHOLD_RANGE: std::ops::RangeInclusive<i32> = 0..=100;
const DEFAULT_TICK_INTERVAL_MS: u64 = 100;

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    pub mqtt: MqttConfig,
    pub engine: Option<EngineConfig>,
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

#[derive(Deserialize, Debug, Default, Clone)]
pub struct EngineConfig {
    pub occupied_threshold: Option<i32>,
    pub vacant_threshold: Option<i32>,
    pub debounce_occupied_ms: Option<u32>,
    pub debounce_vacant_ms: Option<u32>,
    pub tick_interval_ms: Option<u64>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} = {value} is out of range [{min}, {max}]")]
    ThresholdOutOfRange {
        name: &'static str,
        value: i32,
        min: i32,
        max: i32,
    },

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
}

impl EngineConfig {
    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            occupied: self.occupied_threshold.unwrap_or(DEFAULT_OCCUPIED_THRESHOLD),
            vacant: self.vacant_threshold.unwrap_or(DEFAULT_VACANT_THRESHOLD),
        }
    }

    pub fn debounce_durations(&self) -> DebounceDurations {
        DebounceDurations {
            occupied_ms: self
                .debounce_occupied_ms
                .unwrap_or(DEFAULT_DEBOUNCE_OCCUPIED_MS),
            vacant_ms: self.debounce_vacant_ms.unwrap_or(DEFAULT_DEBOUNCE_VACANT_MS),
        }
    }

    pub fn tick_interval_ms(&self) -> u64 {
        self.tick_interval_ms.unwrap_or(DEFAULT_TICK_INTERVAL_MS)
    }

    /// Range checks only. An inverted threshold pair is left to the caller.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let thresholds = self.thresholds();
        check_threshold("occupied_threshold", thresholds.occupied)?;
        check_threshold("vacant_threshold", thresholds.vacant)?;

        // Zero debounce is allowed: commit on the sample after arming.
        if self.tick_interval_ms() == 0 {
            return Err(ConfigError::ZeroDuration("tick_interval_ms"));
        }
        Ok(())
    }
}

fn check_threshold(name: &'static str, value: i32) -> Result<(), ConfigError> {
    if THRESHOLD_RANGE.contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::ThresholdOutOfRange {
            name,
            value,
            min: *THRESHOLD_RANGE.start(),
            max: *THRESHOLD_RANGE.end(),
        })
    }
}
