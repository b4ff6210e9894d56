use std::path::PathBuf;

use thiserror::Error;

use super::ValidationError;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config '{path}': {source}")]
    ReadConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse TOML config '{path}': {source}")]
    ParseToml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Failed to parse JSON config '{path}': {source}")]
    ParseJson {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Unsupported config extension '{ext}'. Use .toml or .json.")]
    UnsupportedExtension { ext: String },
    #[error("Config file must have .toml or .json extension.")]
    MissingExtension,
    #[error("Config '{field}' must be >= 1: {source}")]
    FieldMustBePositive {
        field: String,
        #[source]
        source: ValidationError,
    },
    #[error("Invalid duration for '{field}': {source}")]
    InvalidDuration {
        field: &'static str,
        #[source]
        source: ValidationError,
    },
    #[error("Browser '{browser}' references unknown farm '{farm}'.")]
    UnknownFarm { browser: String, farm: String },
    #[error("Browser '{browser}' must set either 'farm' or 'command'.")]
    BrowserWithoutTarget { browser: String },
    #[error("Browser '{browser}' cannot set both 'farm' and 'command'.")]
    BrowserTargetConflict { browser: String },
    #[error("Browser '{name}' is defined more than once.")]
    DuplicateBrowser { name: String },
    #[error("Farm '{name}' is defined more than once.")]
    DuplicateFarm { name: String },
    #[error("Run references unknown browser '{name}'.")]
    UnknownBrowser { name: String },
    #[error("Every {section} entry needs a non-empty 'name'.")]
    MissingName { section: &'static str },
    #[error("Farm '{farm}' has an invalid kind: {source}")]
    InvalidFarmKind {
        farm: String,
        #[source]
        source: ValidationError,
    },
    #[error("Farm '{farm}' sets an empty tunnel command.")]
    EmptyTunnelCommand { farm: String },
    #[error("Invalid archive server URL: {source}")]
    InvalidServerUrl {
        #[source]
        source: ValidationError,
    },
    #[cfg(test)]
    #[error("Test expectation failed: {message}")]
    TestExpectation { message: &'static str },
    #[cfg(test)]
    #[error("Test expectation failed: {message}: {value}")]
    TestExpectationValue {
        message: &'static str,
        value: String,
    },
}
