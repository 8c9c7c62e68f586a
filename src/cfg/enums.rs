// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use core::fmt;

use serde::{Deserialize, Serialize};

/// Logging verbosity, matching the `log_level` configuration values.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    #[serde(rename = "OFF", alias = "off")]
    Off,
    #[serde(rename = "ERROR", alias = "error")]
    Error,
    #[serde(rename = "WARN", alias = "warn")]
    Warn,
    #[serde(rename = "INFO", alias = "info")]
    Info,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_filter_str())
    }
}

impl LogLevel {
    /// The `tracing_subscriber::EnvFilter` directive this level maps to.
    pub fn as_filter_str(self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
        }
    }
}

/// Where log output is written.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    Stdout,
    Stderr,
    File,
}
