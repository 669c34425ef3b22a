// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, net::IpAddr, path::Path, time::Duration};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// Master connection parameters.
    pub master: MasterConfig,
    /// Change-log and metadata retention parameters.
    pub retention: RetentionConfig,
    /// Structured logging configuration.
    #[serde(default)]
    pub logger: LoggerConfig,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct MasterConfig {
    #[serde(rename = "MASTER_HOST")]
    pub host: String,

    #[serde(rename = "MASTER_PORT")]
    pub port: u16,

    #[serde(default, rename = "BIND_HOST")]
    pub bind_host: Option<IpAddr>,

    #[serde(rename = "MASTER_RECONNECTION_DELAY", with = "serde_secs")]
    pub reconnection_delay: Duration,

    #[serde(rename = "MASTER_TIMEOUT", with = "serde_secs")]
    pub timeout: Duration,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RetentionConfig {
    #[serde(rename = "BACK_LOGS")]
    pub back_logs_number: u32,

    #[serde(rename = "META_DOWNLOAD_FREQ")]
    pub meta_download_freq: u32,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub enum LogOutput {
    #[serde(rename = "stdout")]
    Stdout,
    #[serde(rename = "stderr")]
    Stderr,
    #[serde(rename = "file")]
    File,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub enum RotationFrequency {
    #[serde(rename = "minutely")]
    Minutely,
    #[serde(rename = "hourly")]
    Hourly,
    #[serde(rename = "daily")]
    Daily,
    #[serde(rename = "never")]
    Never,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct LoggerConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_output")]
    pub output: LogOutput,

    #[serde(default)]
    pub file: Option<String>,

    #[serde(default = "default_rotation")]
    pub rotation_frequency: RotationFrequency,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_output() -> LogOutput {
    LogOutput::Stdout
}

fn default_rotation() -> RotationFrequency {
    RotationFrequency::Daily
}

impl Default for LoggerConfig {
    fn default() -> Self {
        LoggerConfig {
            level: default_log_level(),
            output: default_log_output(),
            file: None,
            rotation_frequency: default_rotation(),
        }
    }
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: Config =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize();
        Ok(cfg)
    }

    /// Clamps out-of-range values to the bounds the master itself
    /// enforces, logging whenever a configured value actually changes.
    pub fn validate_and_normalize(&mut self) {
        let timeout_secs = self.master.timeout.as_secs().clamp(2, 65535);
        if Duration::from_secs(timeout_secs) != self.master.timeout {
            tracing::warn!(
                configured = self.master.timeout.as_secs(),
                clamped = timeout_secs,
                "MASTER_TIMEOUT out of range, clamping"
            );
            self.master.timeout = Duration::from_secs(timeout_secs);
        }

        let back_logs = self.retention.back_logs_number.clamp(5, 10000);
        if back_logs != self.retention.back_logs_number {
            tracing::warn!(
                configured = self.retention.back_logs_number,
                clamped = back_logs,
                "BACK_LOGS out of range, clamping"
            );
            self.retention.back_logs_number = back_logs;
        }

        let max_freq = self.retention.back_logs_number / 2;
        if self.retention.meta_download_freq > max_freq {
            tracing::warn!(
                configured = self.retention.meta_download_freq,
                clamped = max_freq,
                "META_DOWNLOAD_FREQ exceeds BACK_LOGS/2, clamping"
            );
            self.retention.meta_download_freq = max_freq;
        }
    }
}

/// Serde helper for `Duration` fields stored as plain seconds in YAML.
mod serde_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            master: MasterConfig {
                host: "master.example".to_string(),
                port: 9419,
                bind_host: None,
                reconnection_delay: Duration::from_secs(5),
                timeout: Duration::from_secs(10),
            },
            retention: RetentionConfig {
                back_logs_number: 50,
                meta_download_freq: 24,
            },
            logger: LoggerConfig::default(),
        }
    }

    #[test]
    fn timeout_below_minimum_is_clamped() {
        let mut cfg = base_config();
        cfg.master.timeout = Duration::from_secs(1);
        cfg.validate_and_normalize();
        assert_eq!(cfg.master.timeout, Duration::from_secs(2));
    }

    #[test]
    fn back_logs_number_is_clamped_to_bounds() {
        let mut cfg = base_config();
        cfg.retention.back_logs_number = 1;
        cfg.validate_and_normalize();
        assert_eq!(cfg.retention.back_logs_number, 5);
    }

    #[test]
    fn meta_download_freq_is_clamped_to_half_back_logs() {
        let mut cfg = base_config();
        cfg.retention.back_logs_number = 10;
        cfg.retention.meta_download_freq = 9;
        cfg.validate_and_normalize();
        assert_eq!(cfg.retention.meta_download_freq, 5);
    }

    #[test]
    fn in_range_values_are_left_untouched() {
        let mut cfg = base_config();
        let before = cfg.master.timeout;
        cfg.validate_and_normalize();
        assert_eq!(cfg.master.timeout, before);
    }
}
