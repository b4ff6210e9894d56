use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("I/O error during {context} '{path}': {source}")]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to serialize descriptor '{path}': {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Zip error: {source}")]
    Zip {
        #[from]
        source: zip::result::ZipError,
    },
    #[error("Failed to walk archive tree: {source}")]
    Walk {
        #[from]
        source: walkdir::Error,
    },
    #[error("Path '{path}' is outside of the archive base directory.")]
    OutsideBase { path: PathBuf },
    #[error("Image error for '{path}': {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("Archive server request failed during {context}: {source}")]
    Server {
        context: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("Archive server responded with status {status} during {context}.")]
    ServerStatus { context: &'static str, status: u16 },
    #[error("Context for agent {agent_id} failed: {message}")]
    ContextFailed { agent_id: u64, message: String },
    #[error("Context for agent {agent_id} stopped before the operation completed.")]
    ContextClosed { agent_id: u64 },
    #[error("Blocking archive task failed: {source}")]
    Join {
        #[from]
        source: tokio::task::JoinError,
    },
    #[cfg(test)]
    #[error("Test expectation failed: {message}")]
    TestExpectation { message: &'static str },
    #[cfg(test)]
    #[error("{message}: {value}")]
    TestExpectationValue {
        message: &'static str,
        value: String,
    },
}
