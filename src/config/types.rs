use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::args::parse_duration;
use crate::error::ValidationError;

/// Contents of `testrelay.toml` / `testrelay.json`. Every field is
/// optional; command-line values win over anything set here.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub runner: RunnerConfig,
    pub archive: ArchiveConfig,
    pub farms: Vec<FarmConfig>,
    pub browsers: Vec<BrowserConfig>,
    pub run: RunConfig,
    pub parking: Option<ParkingConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub subject_page: Option<String>,
    pub sandbox: Option<bool>,
    pub message_chunk_size: Option<usize>,
    pub poll_timeout: Option<DurationValue>,
    pub lost_grace: Option<DurationValue>,
    pub local_relaunch_wait: Option<DurationValue>,
    pub remote_timeout: Option<DurationValue>,
    pub remote_retries: Option<u32>,
    pub terminate_local_agents: Option<bool>,
    pub auto_start_tunnel: Option<bool>,
    pub test_options: Option<Map<String, Value>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    pub enabled: Option<bool>,
    pub id: Option<String>,
    pub workdir: Option<String>,
    pub baselinedir: Option<String>,
    pub archive_path: Option<String>,
    pub scenario: Option<String>,
    pub server: Option<String>,
    pub storage_key: Option<String>,
    pub screenshots: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FarmConfig {
    pub name: String,
    /// `generic`, `saucelabs` or `browserstack`.
    pub kind: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub access_key: Option<String>,
    pub session_limit: Option<usize>,
    pub auto_start_tunnel: Option<bool>,
    pub tunnel_command: Option<String>,
    pub tunnel_args: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub name: String,
    /// Browser family; defaults to the name.
    pub kind: Option<String>,
    pub version: Option<String>,
    pub concurrency: Option<usize>,
    /// Executable of a local browser.
    pub command: Option<String>,
    pub args: Vec<String>,
    /// Farm a remote browser is requested from.
    pub farm: Option<String>,
    pub capabilities: Map<String, Value>,
    /// Page hosted by another application; never launched.
    pub embedded: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub files: Vec<String>,
    pub browsers: Vec<String>,
    pub test_ids: Vec<String>,
    pub test_options: Map<String, Value>,
    pub code_coverage: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ParkingConfig {
    pub port: Option<u16>,
    pub page: Option<String>,
}

/// A duration given as whole seconds or as text such as `250ms`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum DurationValue {
    Seconds(u64),
    Text(String),
}

impl DurationValue {
    pub(crate) fn to_duration(&self) -> Result<Duration, ValidationError> {
        match self {
            DurationValue::Seconds(secs) => {
                if *secs == 0 {
                    Err(ValidationError::DurationZero)
                } else {
                    Ok(Duration::from_secs(*secs))
                }
            }
            DurationValue::Text(text) => parse_duration(text),
        }
    }
}
