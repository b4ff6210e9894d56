use thiserror::Error;

use super::{
    ArchiveError, ConfigError, FarmError, MergeError, ProtocolError, RunnerError, ValidationError,
};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("CLI error: {source}")]
    Clap {
        #[from]
        source: clap::Error,
    },
    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
    #[error("TOML error: {source}")]
    Toml {
        #[from]
        source: toml::de::Error,
    },
    #[error("Join error: {source}")]
    Join {
        #[from]
        source: tokio::task::JoinError,
    },
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Runner error: {0}")]
    Runner(#[from] RunnerError),
    #[error("Farm error: {0}")]
    Farm(#[from] FarmError),
    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),
    #[error("Merge error: {0}")]
    Merge(#[from] MergeError),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn validation<E>(error: E) -> Self
    where
        E: Into<ValidationError>,
    {
        error.into().into()
    }

    pub fn config<E>(error: E) -> Self
    where
        E: Into<ConfigError>,
    {
        error.into().into()
    }

    pub fn protocol<E>(error: E) -> Self
    where
        E: Into<ProtocolError>,
    {
        error.into().into()
    }

    pub fn runner<E>(error: E) -> Self
    where
        E: Into<RunnerError>,
    {
        error.into().into()
    }

    pub fn farm<E>(error: E) -> Self
    where
        E: Into<FarmError>,
    {
        error.into().into()
    }

    pub fn archive<E>(error: E) -> Self
    where
        E: Into<ArchiveError>,
    {
        error.into().into()
    }

    pub fn merge<E>(error: E) -> Self
    where
        E: Into<MergeError>,
    {
        error.into().into()
    }
}
