//! Core library for the `testrelay` CLI.
//!
//! A [`runner::Runner`] coordinates browsers ("agents") that run test
//! suites and talk back over HTTP long-polling. Browsers are launched
//! locally or on WebDriver farms, their reports flow through a reporter
//! set, and the [`archive`] module turns them into a result archive that
//! can be zipped, uploaded and merged with other archives.
pub mod agent;
pub mod archive;
pub mod args;
pub mod browser;
pub mod config;
pub mod entry;
pub mod error;
pub mod farm;
pub mod logger;
pub mod parking;
pub mod protocol;
pub mod runner;
pub mod shutdown;
pub mod tasks;
pub mod transport;
