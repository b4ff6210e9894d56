use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::ArgMatches;
use clap::parser::ValueSource;

use crate::archive::ArchiveSettings;
use crate::args::ServeArgs;
use crate::browser::{Browser, BrowserId, BrowserTarget};
use crate::error::{AppError, AppResult, ConfigError, ValidationError};
use crate::farm::{FarmKind, FarmSettings};
use crate::parking::DEFAULT_PARKING_PAGE;
use crate::runner::{RunOptions, RunnerSettings};

use super::types::{
    ArchiveConfig, BrowserConfig, ConfigFile, DurationValue, FarmConfig, ParkingConfig,
    RunnerConfig,
};

/// Where parked browsers are sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParkingSettings {
    pub port: Option<u16>,
    pub page: String,
}

/// Everything `serve` needs, resolved from the config file and the
/// command line.
#[derive(Debug, Clone)]
pub struct ServeSettings {
    pub runner: RunnerSettings,
    pub archive: Option<ArchiveSettings>,
    pub farms: Vec<FarmSettings>,
    pub browsers: Vec<Browser>,
    /// Run started right away; `None` when no files were given.
    pub run: Option<RunOptions>,
    pub parking: Option<ParkingSettings>,
    pub once: bool,
}

/// Merges `config` under the command-line values of `args`. Values typed
/// on the command line win; anything else falls back to the config file
/// and then to the built-in defaults.
///
/// # Errors
///
/// Returns an error when config values are invalid or reference unknown
/// farms or browsers.
pub fn apply_config(
    args: &ServeArgs,
    matches: &ArgMatches,
    config: ConfigFile,
) -> AppResult<ServeSettings> {
    let runner = runner_settings(args, matches, config.runner)?;
    let archive = archive_settings(args, matches, config.archive)?;
    let farms = farm_settings(config.farms)?;
    let browsers = browsers(config.browsers, &farms)?;

    let files = pick_list(matches, "files", &args.files, config.run.files);
    let names = pick_list(matches, "browsers", &args.browsers, config.run.browsers);
    let test_ids = pick_list(matches, "test_ids", &args.test_ids, config.run.test_ids);
    let run = if files.is_empty() {
        None
    } else {
        Some(RunOptions {
            files,
            browsers: select_browsers(&browsers, &names)?,
            groups: Vec::new(),
            test_ids: (!test_ids.is_empty()).then_some(test_ids),
            test_options: config.run.test_options,
            code_coverage: config.run.code_coverage,
        })
    };

    Ok(ServeSettings {
        runner,
        archive,
        farms,
        browsers,
        run,
        parking: config.parking.map(parking_settings),
        once: args.once,
    })
}

fn is_cli(matches: &ArgMatches, name: &str) -> bool {
    matches.value_source(name) == Some(ValueSource::CommandLine)
}

fn pick<T>(matches: &ArgMatches, name: &str, cli: T, config: Option<T>) -> T {
    if is_cli(matches, name) {
        cli
    } else {
        config.unwrap_or(cli)
    }
}

fn pick_list(matches: &ArgMatches, name: &str, cli: &[String], config: Vec<String>) -> Vec<String> {
    if is_cli(matches, name) {
        cli.to_vec()
    } else {
        config
    }
}

fn duration(
    value: Option<&DurationValue>,
    field: &'static str,
    default: Duration,
) -> AppResult<Duration> {
    value.map_or(Ok(default), |value| {
        value
            .to_duration()
            .map_err(|source| AppError::config(ConfigError::InvalidDuration { field, source }))
    })
}

fn ensure_positive(value: usize, field: String) -> AppResult<usize> {
    if value == 0 {
        return Err(AppError::config(ConfigError::FieldMustBePositive {
            field,
            source: ValidationError::ValueTooSmall { min: 1 },
        }));
    }
    Ok(value)
}

fn runner_settings(
    args: &ServeArgs,
    matches: &ArgMatches,
    config: RunnerConfig,
) -> AppResult<RunnerSettings> {
    let defaults = RunnerSettings::default();
    let poll_timeout = if is_cli(matches, "agent_timeout") {
        args.agent_timeout
    } else {
        duration(
            config.poll_timeout.as_ref(),
            "runner.poll_timeout",
            args.agent_timeout,
        )?
    };
    Ok(RunnerSettings {
        host: pick(matches, "host", args.host.clone(), config.host),
        port: pick(matches, "port", args.port, config.port),
        subject_page: config.subject_page.unwrap_or(defaults.subject_page),
        sandbox: args.sandbox || config.sandbox.unwrap_or(false),
        message_chunk_size: pick(
            matches,
            "message_chunk_size",
            args.message_chunk_size,
            config.message_chunk_size,
        ),
        poll_timeout,
        lost_grace: duration(
            config.lost_grace.as_ref(),
            "runner.lost_grace",
            defaults.lost_grace,
        )?,
        local_relaunch_wait: duration(
            config.local_relaunch_wait.as_ref(),
            "runner.local_relaunch_wait",
            defaults.local_relaunch_wait,
        )?,
        remote_timeout: duration(
            config.remote_timeout.as_ref(),
            "runner.remote_timeout",
            defaults.remote_timeout,
        )?,
        remote_retries: config.remote_retries.unwrap_or(defaults.remote_retries),
        terminate_local_agents: config
            .terminate_local_agents
            .unwrap_or(defaults.terminate_local_agents),
        auto_start_tunnel: config.auto_start_tunnel,
        test_options: config.test_options.unwrap_or_default(),
    })
}

fn archive_settings(
    args: &ServeArgs,
    matches: &ArgMatches,
    config: ArchiveConfig,
) -> AppResult<Option<ArchiveSettings>> {
    if args.no_archive || config.enabled == Some(false) {
        return Ok(None);
    }
    let server = if is_cli(matches, "archive_server") {
        args.archive_server.clone()
    } else {
        config.server.or_else(|| args.archive_server.clone())
    };
    if let Some(url) = server.as_deref() {
        url::Url::parse(url).map_err(|source| {
            AppError::config(ConfigError::InvalidServerUrl {
                source: ValidationError::InvalidUrl {
                    url: url.to_owned(),
                    source,
                },
            })
        })?;
    }
    let defaults = ArchiveSettings::default();
    Ok(Some(ArchiveSettings {
        id: config.id,
        workdir: PathBuf::from(pick(matches, "workdir", args.workdir.clone(), config.workdir)),
        baselinedir: config.baselinedir.map(PathBuf::from),
        archive_path: config.archive_path.unwrap_or(defaults.archive_path),
        scenario: pick(matches, "scenario", args.scenario.clone(), config.scenario),
        server,
        storage_key: config.storage_key,
        enable_screenshots: pick(matches, "screenshots", args.screenshots, config.screenshots),
    }))
}

fn farm_settings(configs: Vec<FarmConfig>) -> AppResult<Vec<FarmSettings>> {
    let mut names = HashSet::new();
    let mut farms = Vec::with_capacity(configs.len());
    for config in configs {
        let name = config.name.trim().to_owned();
        if name.is_empty() {
            return Err(AppError::config(ConfigError::MissingName { section: "farms" }));
        }
        if !names.insert(name.clone()) {
            return Err(AppError::config(ConfigError::DuplicateFarm { name }));
        }
        let kind = config
            .kind
            .as_deref()
            .map(FarmKind::from_str)
            .transpose()
            .map_err(|source| {
                AppError::config(ConfigError::InvalidFarmKind {
                    farm: name.clone(),
                    source,
                })
            })?
            .unwrap_or_default();

        let mut farm = FarmSettings::preset(&name, kind);
        if let Some(host) = config.host {
            farm.host = host;
        }
        if let Some(port) = config.port {
            farm.port = port;
        }
        farm.session_limit = ensure_positive(
            config.session_limit.unwrap_or(farm.session_limit),
            format!("farms.{name}.session_limit"),
        )?;
        farm.auto_start_tunnel = config.auto_start_tunnel.unwrap_or(farm.auto_start_tunnel);
        farm.tunnel = match config.tunnel_command {
            Some(command) if command.trim().is_empty() => {
                return Err(AppError::config(ConfigError::EmptyTunnelCommand { farm: name }));
            }
            Some(command) => Some((command, config.tunnel_args.unwrap_or_default())),
            None => kind.default_tunnel(config.username.as_deref(), config.access_key.as_deref()),
        };
        farm.username = config.username;
        farm.access_key = config.access_key;
        farms.push(farm);
    }
    Ok(farms)
}

fn browsers(configs: Vec<BrowserConfig>, farms: &[FarmSettings]) -> AppResult<Vec<Browser>> {
    let mut names = HashSet::new();
    let mut browsers = Vec::with_capacity(configs.len());
    let mut next_id: BrowserId = 0;
    for config in configs {
        let name = config.name.trim().to_owned();
        if name.is_empty() {
            return Err(AppError::config(ConfigError::MissingName {
                section: "browsers",
            }));
        }
        if !names.insert(name.clone()) {
            return Err(AppError::config(ConfigError::DuplicateBrowser { name }));
        }
        let target = match (config.command, config.farm) {
            (Some(_), Some(_)) => {
                return Err(AppError::config(ConfigError::BrowserTargetConflict {
                    browser: name,
                }));
            }
            (Some(command), None) => BrowserTarget::Local {
                command,
                args: config.args,
            },
            (None, Some(farm)) => {
                if !farms.iter().any(|known| known.name == farm) {
                    return Err(AppError::config(ConfigError::UnknownFarm {
                        browser: name,
                        farm,
                    }));
                }
                BrowserTarget::Farm {
                    farm,
                    capabilities: config.capabilities,
                }
            }
            (None, None) if config.embedded => BrowserTarget::Embedded,
            (None, None) => {
                return Err(AppError::config(ConfigError::BrowserWithoutTarget {
                    browser: name,
                }));
            }
        };
        let concurrency = ensure_positive(
            config.concurrency.unwrap_or(1),
            format!("browsers.{name}.concurrency"),
        )?;
        next_id = next_id.saturating_add(1);
        browsers.push(Browser {
            id: next_id,
            kind: config.kind.unwrap_or_else(|| name.clone()),
            name,
            version: config.version,
            concurrency,
            target,
            user_agent: None,
        });
    }
    Ok(browsers)
}

/// Ids of the named browsers; every configured browser when no names are
/// given.
fn select_browsers(browsers: &[Browser], names: &[String]) -> AppResult<Vec<BrowserId>> {
    if names.is_empty() {
        return Ok(browsers.iter().map(|browser| browser.id).collect());
    }
    names
        .iter()
        .map(|name| {
            browsers
                .iter()
                .find(|browser| browser.name == *name)
                .map(|browser| browser.id)
                .ok_or_else(|| {
                    AppError::config(ConfigError::UnknownBrowser { name: name.clone() })
                })
        })
        .collect()
}

fn parking_settings(config: ParkingConfig) -> ParkingSettings {
    ParkingSettings {
        port: config.port,
        page: config
            .page
            .unwrap_or_else(|| DEFAULT_PARKING_PAGE.to_owned()),
    }
}
