use std::sync::Arc;

use clap::{ArgMatches, CommandFactory, FromArgMatches};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use crate::archive::{ArchiveReporter, Merger};
use crate::args::{Command, MergeArgs, ServeArgs, TestrelayArgs, parse_bool_env};
use crate::browser::CommandLauncher;
use crate::config::{ServeSettings, apply_config, load_config};
use crate::error::{AppResult, FarmError};
use crate::farm::{Farm, WebDriverFarm};
use crate::parking::{InMemoryParkingLot, ParkingLot};
use crate::runner::{LogReporter, Runner, RunnerNotice, RunnerParts};
use crate::shutdown::{setup_signal_shutdown_handler, shutdown_channel};
use crate::tasks::TaskManager;
use crate::transport::LongPollServer;

enum RunPlan {
    Serve(Box<ServeSettings>),
    Merge(MergeArgs),
}

/// Parses the command line, sets up logging and runs the chosen command
/// on a multi-threaded runtime.
///
/// # Errors
///
/// Returns an error when the configuration is invalid or the command
/// fails.
pub fn run() -> AppResult<()> {
    let matches = TestrelayArgs::command().get_matches();
    let args = TestrelayArgs::from_arg_matches(&matches)?;

    crate::logger::init_logging(args.verbose, args.no_color || no_color_env());

    let plan = plan(args, &matches)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        match plan {
            RunPlan::Serve(settings) => serve(*settings).await,
            RunPlan::Merge(args) => merge(args).await,
        }
    })
}

fn no_color_env() -> bool {
    std::env::var("NO_COLOR")
        .ok()
        .filter(|value| !value.is_empty())
        .is_some_and(|value| parse_bool_env(&value).unwrap_or(true))
}

fn plan(args: TestrelayArgs, matches: &ArgMatches) -> AppResult<RunPlan> {
    match args.command {
        Some(Command::Merge(merge_args)) => Ok(RunPlan::Merge(merge_args)),
        Some(Command::Serve(serve_args)) => {
            let serve_matches = matches.subcommand_matches("serve").unwrap_or(matches);
            serve_plan(&serve_args, serve_matches, args.config.as_deref())
        }
        None => serve_plan(&args.serve, matches, args.config.as_deref()),
    }
}

fn serve_plan(args: &ServeArgs, matches: &ArgMatches, config: Option<&str>) -> AppResult<RunPlan> {
    let config = load_config(config)?.unwrap_or_default();
    let settings = apply_config(args, matches, config)?;
    Ok(RunPlan::Serve(Box::new(settings)))
}

/// Address the server binds to: loopback hosts stay local, anything else
/// listens on every interface so that farm browsers can reach it.
fn bind_host(host: &str) -> &'static str {
    let loopback = host == "localhost"
        || host
            .parse::<std::net::IpAddr>()
            .is_ok_and(|addr| addr.is_loopback());
    if loopback { "127.0.0.1" } else { "0.0.0.0" }
}

async fn serve(settings: ServeSettings) -> AppResult<()> {
    let tasks = Arc::new(TaskManager::new());
    let farms = settings
        .farms
        .into_iter()
        .map(|farm| {
            WebDriverFarm::new(farm, Arc::clone(&tasks))
                .map(|driver| Arc::new(driver) as Arc<dyn Farm>)
        })
        .collect::<Result<Vec<_>, FarmError>>()?;
    let archive = settings
        .archive
        .as_ref()
        .map(ArchiveReporter::new)
        .transpose()?
        .map(Arc::new);
    if let Some(archive) = &archive {
        info!(id = archive.id(), "Writing results to {}", archive.layout().basedir.display());
    }
    let parking = settings.parking.map(|parking| {
        Arc::new(InMemoryParkingLot::new(parking.port, parking.page)) as Arc<dyn ParkingLot>
    });
    let host = bind_host(&settings.runner.host);
    let port = settings.runner.port;

    let runner = Runner::start(
        settings.runner,
        RunnerParts {
            browsers: settings.browsers,
            farms,
            launcher: Arc::new(CommandLauncher::new(Arc::clone(&tasks))),
            parking,
            archive: archive.clone(),
            tasks,
        },
    );
    runner.add_reporter(Arc::new(LogReporter));

    let server = LongPollServer::bind(host, port, Arc::clone(&runner)).await?;
    let (shutdown_tx, mut shutdown_rx) = shutdown_channel();
    let signals = setup_signal_shutdown_handler(&shutdown_tx);
    let server_task = tokio::spawn(server.serve(shutdown_tx.subscribe()));

    let mut notices = runner.subscribe();
    if let Some(run) = settings.run {
        let run_id = runner.start_test_run(run)?;
        info!(run_id, "Test run started");
    }

    let mut unflushed = false;
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            notice = notices.recv() => match notice {
                Ok(RunnerNotice::RunStarted { .. }) => unflushed = true,
                Ok(RunnerNotice::RunFinished { run_id }) => {
                    info!(run_id, "Test run finished");
                    if let Some(archive) = &archive {
                        match archive.flush().await {
                            Ok(path) => info!("Archive written to {}", path.display()),
                            Err(err) => error!("Failed to write archive: {}", err),
                        }
                    }
                    unflushed = false;
                    if settings.once {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Missed runner notices"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    drop(shutdown_tx.send(()));
    runner.destroy().await;
    if let Err(err) = server_task.await {
        warn!("Long-poll server task failed: {}", err);
    }
    if let Err(err) = signals.await {
        warn!("Signal handler task failed: {}", err);
    }
    if unflushed && let Some(archive) = &archive {
        let path = archive.flush().await?;
        info!("Archive written to {}", path.display());
    }
    Ok(())
}

async fn merge(args: MergeArgs) -> AppResult<()> {
    let report =
        tokio::task::spawn_blocking(move || Merger::merge(&args.dest, &args.source)).await??;
    for (from, to) in &report.renamed_browsers {
        info!("Renamed browser {} to {}", from, to);
    }
    info!(
        max_id = report.max_id,
        directories = report.directories,
        "Merge complete"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_hosts_bind_locally() -> Result<(), String> {
        for (host, expected) in [
            ("127.0.0.1", "127.0.0.1"),
            ("localhost", "127.0.0.1"),
            ("::1", "127.0.0.1"),
            ("10.0.0.5", "0.0.0.0"),
            ("ci.example.com", "0.0.0.0"),
        ] {
            if bind_host(host) != expected {
                return Err(format!("Unexpected bind address for {}", host));
            }
        }
        Ok(())
    }
}
