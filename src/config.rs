use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the flowmon agent.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    #[allow(dead_code)]
    pub log_level: String,

    /// Compressed update stream configuration.
    #[serde(default)]
    pub update: UpdateConfig,

    /// Heavy-hitter report configuration.
    #[serde(default)]
    pub threshold: ThresholdConfig,

    /// IP anonymization configuration.
    #[serde(default)]
    pub anonymization: AnonymizationConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Capacity of the packet-record ingest channel. Default: 4096.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

/// Compressed update stream configuration.
#[derive(Debug, Deserialize)]
pub struct UpdateConfig {
    /// How often to rebase and write an update block. Default: 30s.
    #[serde(default = "default_update_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Path of the gzip update stream for this session.
    #[serde(default = "default_update_path")]
    pub path: PathBuf,
}

/// Heavy-hitter report configuration.
#[derive(Debug, Deserialize)]
pub struct ThresholdConfig {
    /// How often to snapshot thresholded flows. Default: 60s.
    #[serde(default = "default_threshold_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Path of the plaintext report, truncated on each snapshot.
    #[serde(default = "default_threshold_path")]
    pub path: PathBuf,
}

/// IP anonymization configuration.
#[derive(Debug, Default, Deserialize)]
pub struct AnonymizationConfig {
    /// File holding the per-deployment digest seed.
    #[serde(default)]
    pub seed_path: PathBuf,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_update_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_update_path() -> PathBuf {
    PathBuf::from("/var/lib/flowmon/updates.gz")
}

fn default_threshold_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_threshold_path() -> PathBuf {
    PathBuf::from("/tmp/flowmon-thresholded.log")
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

fn default_channel_capacity() -> usize {
    4096
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            update: UpdateConfig::default(),
            threshold: ThresholdConfig::default(),
            anonymization: AnonymizationConfig::default(),
            health: HealthConfig::default(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            interval: default_update_interval(),
            path: default_update_path(),
        }
    }
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            interval: default_threshold_interval(),
            path: default_threshold_path(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.update.path.as_os_str().is_empty() {
            bail!("update.path is required");
        }

        if self.update.interval.is_zero() {
            bail!("update.interval must be positive");
        }

        if self.channel_capacity == 0 {
            bail!("channel_capacity must be positive");
        }

        if cfg!(feature = "thresholding") {
            if self.threshold.path.as_os_str().is_empty() {
                bail!("threshold.path is required");
            }

            if self.threshold.interval.is_zero() {
                bail!("threshold.interval must be positive");
            }
        }

        if cfg!(feature = "anonymization") && self.anonymization.seed_path.as_os_str().is_empty() {
            bail!("anonymization.seed_path is required");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.update.interval, Duration::from_secs(30));
        assert_eq!(cfg.threshold.interval, Duration::from_secs(60));
        assert_eq!(cfg.health.addr, ":9090");
        assert_eq!(cfg.channel_capacity, 4096);
    }

    #[test]
    fn test_parse_yaml_with_humantime_intervals() {
        let yaml = r#"
log_level: debug
update:
  interval: 2m
  path: /tmp/u.gz
threshold:
  interval: 90s
  path: /tmp/t.log
anonymization:
  seed_path: /tmp/seed
health:
  addr: "127.0.0.1:9100"
"#;
        let cfg: Config = serde_yaml::from_str(yaml).expect("parse yaml");
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.update.interval, Duration::from_secs(120));
        assert_eq!(cfg.update.path, PathBuf::from("/tmp/u.gz"));
        assert_eq!(cfg.threshold.interval, Duration::from_secs(90));
        assert_eq!(cfg.health.addr, "127.0.0.1:9100");
        cfg.validate().expect("valid config");
    }

    #[test]
    fn test_validation_missing_update_path() {
        let cfg = Config {
            update: UpdateConfig {
                path: PathBuf::new(),
                ..Default::default()
            },
            ..valid_config()
        };
        let err = cfg.validate().expect_err("must fail");
        assert!(err.to_string().contains("update.path"));
    }

    #[test]
    fn test_validation_zero_channel_capacity() {
        let cfg = Config {
            channel_capacity: 0,
            ..valid_config()
        };
        let err = cfg.validate().expect_err("must fail");
        assert!(err.to_string().contains("channel_capacity"));
    }

    #[cfg(feature = "anonymization")]
    #[test]
    fn test_validation_requires_seed_path() {
        let cfg = Config {
            anonymization: AnonymizationConfig::default(),
            ..valid_config()
        };
        let err = cfg.validate().expect_err("must fail");
        assert!(err.to_string().contains("seed_path"));
    }

    fn valid_config() -> Config {
        Config {
            anonymization: AnonymizationConfig {
                seed_path: PathBuf::from("/tmp/seed"),
            },
            ..Default::default()
        }
    }
}
