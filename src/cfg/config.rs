// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path};

use anyhow::{Context, Result, bail, ensure};
use serde::{Deserialize, Serialize};

use crate::{
    cfg::enums::{LogLevel, LogOutput},
    tag::check_tag,
};

/// Default capacity for the entry/batch channels when `channel_size` is
/// absent, zero, or negative.
pub const DEFAULT_CHANNEL_SIZE: usize = 64;

/// Default interval before retrying a destination on transient failure.
pub const DEFAULT_RETRY: std::time::Duration = std::time::Duration::from_secs(10);

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct MuxerConfig {
    pub destinations: Destinations,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub channel_size: i64,
    #[serde(default)]
    pub enable_cache: bool,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    pub identification: Identification,
    #[serde(default)]
    pub rate_limit_bps: u64,
}

/// The destination list plus the "uniform shared secret" shorthand:
/// when every destination omits `secret`, `shared_secret` (if set)
/// is applied to all of them during [`MuxerConfig::validate_and_normalize`].
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct Destinations {
    pub targets: Vec<DestinationConfig>,
    #[serde(default)]
    pub shared_secret: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct DestinationConfig {
    pub address: String,
    #[serde(default)]
    pub secret: String,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default = "default_verify_cert")]
    pub verify_cert: bool,
}

fn default_verify_cert() -> bool {
    true
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct CacheConfig {
    #[serde(default)]
    pub file_backing_location: String,
}

impl CacheConfig {
    pub fn is_file_backed(&self) -> bool {
        !self.file_backing_location.is_empty()
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: LogLevel,
    #[serde(default = "default_log_output")]
    pub output: LogOutput,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub is_show_line: bool,
    #[serde(default)]
    pub is_show_module_path: bool,
    #[serde(default)]
    pub is_show_target: bool,
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

fn default_log_output() -> LogOutput {
    LogOutput::Stdout
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            output: default_log_output(),
            file_path: None,
            is_show_line: false,
            is_show_module_path: false,
            is_show_target: false,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Identification {
    pub ingester_name: String,
    #[serde(default = "default_version")]
    pub ingester_version: String,
    #[serde(default)]
    pub ingester_uuid: Option<String>,
}

fn default_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

impl MuxerConfig {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path.as_ref())
            .with_context(|| format!("reading config file {}", path.as_ref().display()))?;
        let mut cfg: MuxerConfig =
            serde_yaml::from_str(&s).context("parsing config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants and normalizes derived fields:
    /// coerces a non-positive `channel_size` to the default, rejects an
    /// empty destination list, applies a uniform shared secret, and checks
    /// every configured tag name.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        if self.channel_size <= 0 {
            self.channel_size = DEFAULT_CHANNEL_SIZE as i64;
        }

        ensure!(!self.destinations.targets.is_empty(), "no destinations configured");

        if let Some(shared) = self.destinations.shared_secret.clone() {
            for dest in &mut self.destinations.targets {
                if dest.secret.is_empty() {
                    dest.secret = shared.clone();
                }
            }
        }

        for dest in &self.destinations.targets {
            ensure!(
                !dest.address.is_empty(),
                "destination address must not be empty"
            );
            if dest.secret.is_empty() {
                bail!("destination {} has no authentication secret", dest.address);
            }
        }

        for tag in &self.tags {
            check_tag(tag).with_context(|| format!("invalid tag {tag:?}"))?;
        }

        if self.tls.enabled
            && let (Some(_), None) | (None, Some(_)) =
                (&self.tls.public_key, &self.tls.private_key)
        {
            bail!("tls.public_key and tls.private_key must both be set or both omitted");
        }

        if self.enable_cache && self.cache.is_file_backed() {
            fs::create_dir_all(&self.cache.file_backing_location).with_context(|| {
                format!(
                    "creating cache directory {}",
                    self.cache.file_backing_location
                )
            })?;
        }

        Ok(())
    }

    pub fn channel_size(&self) -> usize {
        usize::try_from(self.channel_size).unwrap_or(DEFAULT_CHANNEL_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> MuxerConfig {
        MuxerConfig {
            destinations: Destinations {
                targets: vec![DestinationConfig {
                    address: "127.0.0.1:9999".to_string(),
                    secret: "s3cret".to_string(),
                }],
                shared_secret: None,
            },
            tags: vec!["default".to_string()],
            tls: TlsConfig::default(),
            channel_size: 0,
            enable_cache: false,
            cache: CacheConfig::default(),
            logging: LoggingConfig::default(),
            identification: Identification {
                ingester_name: "test".to_string(),
                ingester_version: "0.0.0".to_string(),
                ingester_uuid: None,
            },
            rate_limit_bps: 0,
        }
    }

    #[test]
    fn coerces_nonpositive_channel_size() {
        let mut cfg = minimal();
        cfg.validate_and_normalize().unwrap();
        assert_eq!(cfg.channel_size, DEFAULT_CHANNEL_SIZE as i64);
    }

    #[test]
    fn rejects_empty_destinations() {
        let mut cfg = minimal();
        cfg.destinations.targets.clear();
        assert!(cfg.validate_and_normalize().is_err());
    }

    #[test]
    fn applies_shared_secret() {
        let mut cfg = minimal();
        cfg.destinations.targets[0].secret.clear();
        cfg.destinations.targets.push(DestinationConfig {
            address: "127.0.0.1:10000".to_string(),
            secret: String::new(),
        });
        cfg.destinations.shared_secret = Some("shared".to_string());
        cfg.validate_and_normalize().unwrap();
        assert!(cfg.destinations.targets.iter().all(|d| d.secret == "shared"));
    }

    #[test]
    fn rejects_bad_tag_name() {
        let mut cfg = minimal();
        cfg.tags.push("bad tag".to_string());
        assert!(cfg.validate_and_normalize().is_err());
    }
}
