use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Args, Parser, Subcommand};

use crate::archive::DEFAULT_WORKDIR;
use crate::runner::DEFAULT_PORT;

use super::parsers::parse_duration_arg;

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Serve agents and run tests (default)
    Serve(ServeArgs),
    /// Merge one result archive into another
    Merge(MergeArgs),
}

#[derive(Debug, Args, Clone)]
pub struct MergeArgs {
    /// Archive directory that receives the merged results
    pub dest: PathBuf,

    /// Archive directory whose results are merged in
    pub source: PathBuf,
}

#[derive(Debug, Args, Clone)]
pub struct ServeArgs {
    /// Port the long-poll server listens on
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Host remote browsers use to reach this runner
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Test files to run (repeatable); nothing runs until files are given
    #[arg(long = "files", short = 'f')]
    pub files: Vec<String>,

    /// Configured browsers to run on (repeatable); defaults to all
    #[arg(long = "browser", short = 'b')]
    pub browsers: Vec<String>,

    /// Restrict the run to these test ids (repeatable)
    #[arg(long = "test-id")]
    pub test_ids: Vec<String>,

    /// Inbound messages processed per queue step (0 keeps batches whole)
    #[arg(long = "message-chunk-size", default_value_t = 0)]
    pub message_chunk_size: usize,

    /// How long a long-poll is held open (supports ms/s/m/h)
    #[arg(long = "agent-timeout", default_value = "25s", value_parser = parse_duration_arg)]
    pub agent_timeout: Duration,

    /// Run tests inside the sandbox host page
    #[arg(long)]
    pub sandbox: bool,

    /// Directory archives are written to
    #[arg(long, default_value = DEFAULT_WORKDIR)]
    pub workdir: String,

    /// Scenario name the results are filed under
    #[arg(long, default_value = "default")]
    pub scenario: String,

    /// Archive server receiving uploads and serving baselines
    #[arg(long = "archive-server")]
    pub archive_server: Option<String>,

    /// Compare screenshots taken by tests against baselines
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub screenshots: bool,

    /// Do not write a result archive
    #[arg(long = "no-archive")]
    pub no_archive: bool,

    /// Shut down once the first run has finished
    #[arg(long)]
    pub once: bool,
}

#[derive(Debug, Parser, Clone)]
#[clap(
    version,
    about = "Coordinates browser test runs over HTTP long-polling and collects the results into archives.",
    args_conflicts_with_subcommands = true
)]
pub struct TestrelayArgs {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Path to config file (TOML/JSON). Defaults to ./testrelay.toml or ./testrelay.json if present.
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// Enable verbose logging (sets log level to debug unless overridden by TESTRELAY_LOG/RUST_LOG)
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    /// Disable colored log output (also set by NO_COLOR)
    #[arg(long = "no-color", global = true)]
    pub no_color: bool,

    #[command(flatten)]
    pub serve: ServeArgs,
}
