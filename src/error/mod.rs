mod app;
mod archive;
mod config;
mod farm;
mod merge;
mod protocol;
mod runner;
mod validation;

#[cfg(test)]
mod test_support;

pub use app::{AppError, AppResult};
pub use archive::ArchiveError;
pub use config::ConfigError;
pub use farm::FarmError;
pub use merge::MergeError;
pub use protocol::ProtocolError;
pub use runner::RunnerError;
pub use validation::ValidationError;
