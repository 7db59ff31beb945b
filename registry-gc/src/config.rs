//! Configuration loading and CLI argument parsing.
//!
//! The layered model follows the teacher's own `config::Options`: a YAML
//! file read with `serde_yaml` supplies the registry credentials and the
//! ambient tuning knobs, while `structopt` supplies the subcommand and the
//! handful of flags an operator is expected to override per invocation.

use crate::errors::GcError;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use structopt::StructOpt;

#[derive(Debug, Clone, Deserialize)]
pub struct FileConfig {
    pub registry: RegistryConfig,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_driver")]
    pub driver: String,
    pub bucket: String,
    pub path: String,
    pub access_key: String,
    pub secret_key: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Overrides the computed AWS host, for MinIO/LocalStack-style
    /// S3-compatible deployments.
    #[serde(default)]
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_step_secs")]
    pub backoff_step_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: default_max_attempts(),
            backoff_step_secs: default_backoff_step_secs(),
        }
    }
}

fn default_concurrency() -> usize {
    25
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_step_secs() -> u64 {
    2
}
fn default_driver() -> String {
    "s3".to_string()
}
fn default_region() -> String {
    "us-east-1".to_string()
}

impl FileConfig {
    pub fn from_yaml_str(s: &str) -> Result<Self, GcError> {
        serde_yaml::from_str(s).map_err(|err| GcError::Config(err.to_string()))
    }

    pub fn validate(&self) -> Result<(), GcError> {
        if self.registry.driver != "s3" {
            return Err(GcError::Config(format!(
                "unsupported registry driver '{}' (only 's3' is implemented)",
                self.registry.driver
            )));
        }
        if self.registry.bucket.is_empty() {
            return Err(GcError::Config("registry.bucket is required".to_string()));
        }
        if self.registry.access_key.is_empty() || self.registry.secret_key.is_empty() {
            return Err(GcError::Config(
                "registry.access_key and registry.secret_key are required".to_string(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn backoff_step(&self) -> Duration {
        Duration::from_secs(self.retry.backoff_step_secs)
    }
}

#[derive(Debug, StructOpt)]
#[structopt(name = "registry-gc", about = "Garbage collector for a v1 object-store-backed registry")]
pub struct Options {
    /// YAML configuration file.
    #[structopt(long = "config", parse(from_os_str))]
    pub config: PathBuf,

    /// Load a previously saved graph instead of scanning the registry.
    #[structopt(long = "graph", parse(from_os_str))]
    pub graph: Option<PathBuf>,

    /// Save the scanned (or loaded) graph to this path before proceeding.
    #[structopt(long = "save", parse(from_os_str))]
    pub save: Option<PathBuf>,

    /// Save an intermediate graph snapshot after pass 1, before tag import.
    #[structopt(long = "save-intermediate", parse(from_os_str))]
    pub save_intermediate: Option<PathBuf>,

    /// Verbosity; repeat for more (-v, -vv, -vvv).
    #[structopt(short = "v", long = "verbose", parse(from_occurrences))]
    pub verbosity: u8,

    #[structopt(subcommand)]
    pub command: Command,
}

#[derive(Debug, StructOpt)]
pub enum Command {
    /// Scan (or load) the registry graph and emit the delete candidate set.
    Sweep {
        /// Minimum sustained-unreferenced age before a layer is eligible for deletion.
        #[structopt(long = "age", default_value = "1d", parse(try_from_str = parse_duration))]
        age: Duration,

        /// Path to the sweep-state file tracking first-seen-unreferenced timestamps.
        #[structopt(long = "state", parse(from_os_str), default_value = "delete.json")]
        state: PathBuf,
    },
    /// Scan (or load) the registry graph and print an image's descendant history.
    History {
        /// Layer id to report history for.
        image: String,
    },
}

/// Parses durations of the form `^[0-9]+[smhdw]$`; a bare integer is
/// interpreted as seconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let bytes = s.as_bytes();
    if bytes.is_empty() {
        return Err("duration must not be empty".to_string());
    }
    let last = bytes[bytes.len() - 1];
    let (digits, multiplier) = match last {
        b's' => (&s[..s.len() - 1], 1u64),
        b'm' => (&s[..s.len() - 1], 60u64),
        b'h' => (&s[..s.len() - 1], 3600u64),
        b'd' => (&s[..s.len() - 1], 86_400u64),
        b'w' => (&s[..s.len() - 1], 604_800u64),
        b'0'..=b'9' => (s, 1u64),
        _ => return Err(format!("invalid duration unit in '{}'", s)),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration value in '{}'", s))?;
    Ok(Duration::from_secs(value * multiplier))
}
