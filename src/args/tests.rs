use std::time::Duration;

use clap::Parser;

use super::*;
use crate::error::{AppError, AppResult, ValidationError};

#[test]
fn serve_is_the_default_command() -> AppResult<()> {
    let args = TestrelayArgs::try_parse_from([
        "testrelay",
        "--port",
        "8080",
        "--files",
        "a.js",
        "-f",
        "b.js",
        "--browser",
        "chrome",
    ])?;
    if args.command.is_some() {
        return Err(AppError::validation("Expected no subcommand"));
    }
    if args.serve.port != 8080 {
        return Err(AppError::validation("Unexpected port"));
    }
    if args.serve.files != ["a.js", "b.js"] || args.serve.browsers != ["chrome"] {
        return Err(AppError::validation("Unexpected files or browsers"));
    }
    if !args.serve.screenshots || args.serve.agent_timeout != Duration::from_secs(25) {
        return Err(AppError::validation("Unexpected defaults"));
    }
    Ok(())
}

#[test]
fn serve_subcommand_takes_the_same_options() -> AppResult<()> {
    let args = TestrelayArgs::try_parse_from([
        "testrelay",
        "serve",
        "--agent-timeout",
        "500ms",
        "--screenshots",
        "false",
        "--verbose",
    ])?;
    let Some(Command::Serve(serve)) = args.command else {
        return Err(AppError::validation("Expected serve subcommand"));
    };
    if serve.agent_timeout != Duration::from_millis(500) || serve.screenshots {
        return Err(AppError::validation("Unexpected serve options"));
    }
    if !args.verbose {
        return Err(AppError::validation("Global flags apply to subcommands"));
    }
    Ok(())
}

#[test]
fn merge_takes_destination_then_source() -> AppResult<()> {
    let args = TestrelayArgs::try_parse_from(["testrelay", "merge", "out", "in"])?;
    let Some(Command::Merge(merge)) = args.command else {
        return Err(AppError::validation("Expected merge subcommand"));
    };
    if merge.dest.to_str() != Some("out") || merge.source.to_str() != Some("in") {
        return Err(AppError::validation("Unexpected merge paths"));
    }
    Ok(())
}

#[test]
fn zero_agent_timeout_is_rejected() -> AppResult<()> {
    if TestrelayArgs::try_parse_from(["testrelay", "--agent-timeout", "0"]).is_ok() {
        return Err(AppError::validation("Zero timeout should fail"));
    }
    Ok(())
}

#[test]
fn durations_accept_units() -> AppResult<()> {
    let cases = [
        ("250ms", Duration::from_millis(250)),
        ("3", Duration::from_secs(3)),
        ("2m", Duration::from_secs(120)),
        ("1h", Duration::from_secs(3600)),
    ];
    for (input, expected) in cases {
        if parse_duration(input)? != expected {
            return Err(AppError::validation(format!("Unexpected value for {}", input)));
        }
    }
    if !matches!(
        parse_duration("5d"),
        Err(ValidationError::InvalidDurationUnit { .. })
    ) {
        return Err(AppError::validation("Expected unit error"));
    }
    Ok(())
}

#[test]
fn boolean_env_values() -> AppResult<()> {
    if !parse_bool_env("Yes")? || parse_bool_env("0")? {
        return Err(AppError::validation("Unexpected boolean"));
    }
    if parse_bool_env("maybe").is_ok() {
        return Err(AppError::validation("Expected boolean error"));
    }
    Ok(())
}
