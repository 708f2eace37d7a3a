// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration for the CPI's connection to the management server and for
/// the polling bounds the VM controller applies.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    pub vcenter: VcenterConfig,

    #[serde(default)]
    pub vm: VmConfig,

    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Constructs a configuration with default tunables for `host`.
    ///
    /// Typically, the configuration is parsed from a config file via
    /// [`parse`], but this method allows an alternative mechanism for
    /// initialization.
    pub fn new<S: Into<String>>(host: S) -> Config {
        Config {
            vcenter: VcenterConfig {
                host: host.into(),
                ca_cert_file: None,
                http_log: None,
                connect_timeout_secs: default_connect_timeout_secs(),
                request_timeout_secs: default_request_timeout_secs(),
            },
            vm: VmConfig::default(),
            log: LogConfig::default(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct VcenterConfig {
    /// Host name (optionally with port) of the management server.
    pub host: String,

    /// PEM bundle to trust. When absent, server certificates are not
    /// verified.
    #[serde(default)]
    pub ca_cert_file: Option<PathBuf>,

    /// When set, every request and response is appended to this file.
    #[serde(default)]
    pub http_log: Option<PathBuf>,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    // Long enough for image uploads.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl VcenterConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Polling bounds used by the VM controller's power operations.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// How long a graceful guest shutdown may take before the VM is powered
    /// off forcibly.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    /// Interval at which pending questions are checked during power-on.
    #[serde(default = "default_question_poll_secs")]
    pub question_poll_secs: u64,

    /// Attempts made by the coarse retry loops around power-off, detach and
    /// delete.
    #[serde(default = "default_retry_block_attempts")]
    pub retry_block_attempts: u32,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            question_poll_secs: default_question_poll_secs(),
            retry_block_attempts: default_retry_block_attempts(),
        }
    }
}

impl VmConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn question_poll_interval(&self) -> Duration {
        Duration::from_secs(self.question_poll_secs)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogConfig {
    #[serde(default)]
    pub format: LogFormat,

    #[serde(default)]
    pub level: LogLevel,
}

/// Specifies how log records should be structured.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain, hopefully human-readable output.
    #[default]
    Plain,

    /// Bunyan JSON, for machine processing.
    Bunyan,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl FromStr for LogLevel {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(ParseError::InvalidValue(s.to_string(), "log level")),
        }
    }
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_request_timeout_secs() -> u64 {
    14_400
}

fn default_shutdown_timeout_secs() -> u64 {
    60
}

fn default_question_poll_secs() -> u64 {
    15
}

fn default_retry_block_attempts() -> u32 {
    10
}

/// Errors which may be returned when parsing the CPI configuration.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Cannot parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid {1}: {0}")]
    InvalidValue(String, &'static str),
}

/// Parses a TOML file into a configuration object.
pub fn parse<P: AsRef<Path>>(path: P) -> Result<Config, ParseError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let cfg = toml::from_str::<Config>(&contents)?;
    Ok(cfg)
}
