use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::agent::{Agent, AgentEvent, AgentGroup, AgentId, AgentKind, Chunk, GroupId, RemoteState};
use crate::browser::{Browser, BrowserId, BrowserSession, BrowserTarget};
use crate::error::RunnerError;
use crate::farm::Farm;

use super::state::RunnerState;
use super::{ReportEvent, Runner, RunnerNotice};

/// What to run and where.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub files: Vec<String>,
    /// Configured browsers to run on.
    pub browsers: Vec<BrowserId>,
    /// Groups of already connected browsers to run on.
    pub groups: Vec<GroupId>,
    pub test_ids: Option<Vec<String>>,
    pub test_options: Map<String, Value>,
    pub code_coverage: bool,
}

struct Launch {
    farm: Arc<dyn Farm>,
    capabilities: Map<String, Value>,
    url: String,
    registered: oneshot::Receiver<()>,
}

impl Runner {
    /// Starts a new test run and returns its id.
    ///
    /// # Errors
    ///
    /// Returns an error when `files` is empty or the runner was destroyed.
    pub fn start_test_run(self: &Arc<Self>, options: RunOptions) -> Result<u64, RunnerError> {
        let run_id = self.with_state(|state| self.start_locked(state, options))?;
        self.publish(RunnerNotice::RunStarted { run_id });
        Ok(run_id)
    }

    fn start_locked(
        self: &Arc<Self>,
        state: &mut RunnerState,
        options: RunOptions,
    ) -> Result<u64, RunnerError> {
        if state.destroyed {
            return Err(RunnerError::Destroyed);
        }
        state.drop_pending_chunks();
        state.running = 0;
        state.queued = 0;
        state.local_pending.clear();
        for slots in state.farm_slots.values_mut() {
            slots.waiting.clear();
        }
        state.run_id = state.run_id.saturating_add(1);
        state.reset_needed = state.code_coverage != options.code_coverage;
        state.code_coverage = options.code_coverage;
        if options.files.is_empty() {
            return Err(RunnerError::NoTestFiles);
        }

        let run_id = state.run_id;
        let mut run_options = self.settings.test_options.clone();
        run_options.extend(options.test_options);
        state.run_options = run_options;
        state.files.clone_from(&options.files);
        state.test_ids.clone_from(&options.test_ids);
        let browser_names = options
            .browsers
            .iter()
            .filter_map(|id| state.browsers.get(id))
            .map(|browser| browser.name.clone())
            .collect();
        state.report_runner(ReportEvent::RunStarted {
            run_id,
            files: options.files.clone(),
            browsers: browser_names,
            test_ids: options.test_ids.clone(),
        });

        let mut groups: Vec<GroupId> = Vec::new();
        for group_id in options.groups {
            let browser = state.groups.get(&group_id).and_then(|group| group.browser);
            let launchable = browser
                .and_then(|id| state.browsers.get(&id))
                .is_none_or(Browser::is_local);
            if launchable
                && let Some(launched) = self.launch_local_browser(state, browser, Some(group_id), None)
                && !groups.contains(&launched)
            {
                groups.push(launched);
            }
        }

        for browser_id in options.browsers {
            let Some(browser) = state.browsers.get(&browser_id).cloned() else {
                warn!(browser = browser_id, "Skipping unknown browser");
                continue;
            };
            let existing = state.groups_by_browser.get(&browser_id).copied();
            match &browser.target {
                BrowserTarget::Local { .. } => {
                    let group = existing
                        .or_else(|| self.launch_local_browser(state, Some(browser_id), None, None));
                    if let Some(group) = group
                        && !groups.contains(&group)
                    {
                        groups.push(group);
                    }
                }
                BrowserTarget::Embedded => match existing {
                    Some(group) if !groups.contains(&group) => groups.push(group),
                    Some(_) => {}
                    None => debug!(browser = %browser.name, "Waiting for embedded page to connect"),
                },
                BrowserTarget::Farm { farm, .. } => {
                    self.add_remote_agents(state, &browser, farm, existing, &options.files);
                }
            }
        }

        for group_id in &groups {
            let members = state.groups.get(group_id).map_or(0, AgentGroup::len);
            state.local_pending.insert(*group_id, members.max(1));
        }

        let reset = state.reset_needed;
        for group_id in groups {
            let members = state
                .groups
                .get(&group_id)
                .map(AgentGroup::agent_ids)
                .unwrap_or_default();
            for agent_id in members {
                state.report(agent_id, ReportEvent::AgentAdded);
                if let Some(agent) = state.agents.get_mut(&agent_id) {
                    agent.start_test_run(
                        run_id,
                        options.test_ids.clone(),
                        reset,
                        state.run_options.clone(),
                    );
                }
            }
        }
        info!(run_id, "Test run started");
        Ok(run_id)
    }

    /// Creates one chunked agent per concurrent session of a farm browser
    /// and schedules each of them.
    fn add_remote_agents(
        self: &Arc<Self>,
        state: &mut RunnerState,
        browser: &Browser,
        farm: &str,
        existing: Option<GroupId>,
        files: &[String],
    ) {
        if !self.farms.contains_key(farm) {
            state.report_runner(ReportEvent::SystemError {
                error: format!("Browser '{}' refers to unknown farm '{}'.", browser.name, farm),
            });
            return;
        }
        let group_id = existing.unwrap_or_else(|| state.create_group(Some(browser.id), false));
        let concurrency = browser.concurrency.max(1).min(files.len());
        let kind = if self.settings.sandbox {
            AgentKind::Sandbox
        } else {
            AgentKind::Remote
        };
        for index in 1..=concurrency {
            let agent_id = state.next_agent_id();
            let chunk = Chunk {
                index,
                total: concurrency,
            };
            let mut agent = Agent::new(agent_id, kind, self.new_link(agent_id));
            agent.terminate_on_finish = true;
            agent.group_id = Some(group_id);
            agent.browser = Some(browser.id);
            agent.test_ids.clone_from(&state.test_ids);
            agent.remote = Some(RemoteState {
                farm: farm.to_owned(),
                retries: self.settings.remote_retries,
                chunk: Some(chunk),
                url: self.contact_url(agent_id, Some(chunk), false),
            });
            state.insert_agent(agent);
            state.report(agent_id, ReportEvent::AgentAdded);
            self.schedule_agent(state, agent_id);
        }
    }

    /// Launches the agent when its farm has a free session, otherwise
    /// queues it until one is given back.
    pub(super) fn schedule_agent(self: &Arc<Self>, state: &mut RunnerState, agent_id: AgentId) {
        let Some(agent) = state.agents.get_mut(&agent_id) else {
            return;
        };
        let Some(farm_name) = agent.farm().map(str::to_owned) else {
            agent.start_test_run(
                state.run_id,
                None,
                state.reset_needed,
                state.run_options.clone(),
            );
            state.running = state.running.saturating_add(1);
            return;
        };
        let Some(farm) = self.farms.get(&farm_name).map(Arc::clone) else {
            state.report(
                agent_id,
                ReportEvent::SystemError {
                    error: format!("Unknown farm '{farm_name}'."),
                },
            );
            return;
        };

        let limit = farm.session_limit().max(1);
        let slots = state.farm_slots.entry(farm_name).or_default();
        if slots.sessions < limit {
            slots.sessions = slots.sessions.saturating_add(1);
            state.running = state.running.saturating_add(1);
            let auto_start = self
                .settings
                .auto_start_tunnel
                .unwrap_or_else(|| farm.auto_start_tunnel());
            let runner = Arc::clone(self);
            tokio::spawn(async move {
                if auto_start && let Err(err) = farm.start().await {
                    runner.fail(agent_id, err.to_string());
                    return;
                }
                runner.launch_agent(agent_id).await;
            });
        } else {
            debug!(agent = agent_id, farm = farm.name(), "Farm is busy, queueing agent");
            slots.waiting.push_back(agent_id);
            state.queued = state.queued.saturating_add(1);
        }
    }

    /// Opens a farm session for the agent and waits for its browser to
    /// register before telling it to run.
    async fn launch_agent(self: &Arc<Self>, agent_id: AgentId) {
        let launch = self.with_state(|state| self.prepare_launch(state, agent_id));
        let Some(launch) = launch else {
            debug!(agent = agent_id, "Agent went away before launch");
            return;
        };

        let session = match launch.farm.open_session(&launch.capabilities, &launch.url).await {
            Ok(session) => session,
            Err(err) => {
                self.fail(agent_id, err.to_string());
                return;
            }
        };
        let attached = self.with_state(|state| match state.agents.get_mut(&agent_id) {
            Some(agent) => {
                agent.session = Some(Arc::clone(&session));
                true
            }
            None => false,
        });
        if !attached {
            close_session(agent_id, session.as_ref()).await;
            return;
        }

        match tokio::time::timeout(self.settings.remote_timeout, launch.registered).await {
            Ok(Ok(())) => self.with_state(|state| {
                if let Some(agent) = state.agents.get_mut(&agent_id) {
                    agent.start_test_run(
                        state.run_id,
                        None,
                        state.reset_needed,
                        state.run_options.clone(),
                    );
                }
            }),
            Ok(Err(_)) => debug!(agent = agent_id, "Agent was removed before it registered"),
            Err(_) => {
                self.lock().register_waiters.remove(&agent_id);
                close_session(agent_id, session.as_ref()).await;
                self.fail(agent_id, RunnerError::RegisterTimeout.to_string());
            }
        }
    }

    fn prepare_launch(&self, state: &mut RunnerState, agent_id: AgentId) -> Option<Launch> {
        let agent = state.agents.get_mut(&agent_id)?;
        let url = agent.remote.as_ref()?.url.clone();
        let farm = agent
            .farm()
            .and_then(|name| self.farms.get(name))
            .map(Arc::clone)?;
        agent.session_id = None;
        agent.registered = false;
        agent.session = None;
        let capabilities = agent
            .browser
            .and_then(|id| state.browsers.get(&id))
            .and_then(|browser| match &browser.target {
                BrowserTarget::Farm { capabilities, .. } => Some(capabilities.clone()),
                BrowserTarget::Local { .. } | BrowserTarget::Embedded => None,
            })
            .unwrap_or_default();
        let (waiter, registered) = oneshot::channel();
        state.register_waiters.insert(agent_id, waiter);
        state.report(agent_id, ReportEvent::AgentLaunched);
        info!(agent = agent_id, farm = farm.name(), "Launching remote agent");
        Some(Launch {
            farm,
            capabilities,
            url,
            registered,
        })
    }

    fn fail(&self, agent_id: AgentId, error: String) {
        if self.events.send(AgentEvent::Failed { agent_id, error }).is_err() {
            debug!(agent = agent_id, "Event loop is gone");
        }
    }

    /// Retries a failed remote agent while its budget lasts; afterwards
    /// the failure is reported and the agent's slot is given back.
    pub(super) fn on_agent_failed(self: &Arc<Self>, agent_id: AgentId, error: String) {
        self.with_state(|state| {
            let Some(agent) = state.agents.get_mut(&agent_id) else {
                return;
            };
            let farm = agent.farm().map(str::to_owned);
            let Some(remote) = agent.remote.as_mut() else {
                state.report(agent_id, ReportEvent::SystemError { error });
                return;
            };
            let will_retry = remote.retries > 0;
            remote.retries = remote.retries.saturating_sub(1);
            state.report(
                agent_id,
                ReportEvent::AgentFailed {
                    error: error.clone(),
                    will_retry,
                },
            );
            if will_retry {
                let runner = Arc::clone(self);
                tokio::spawn(async move { runner.launch_agent(agent_id).await });
            } else {
                state.report(agent_id, ReportEvent::SystemError { error });
                self.on_remote_agent_terminated(state, agent_id, farm);
            }
        });
    }

    /// Gives back the farm session of a finished remote agent and starts
    /// the next queued one. Announces the end of the run once nothing is
    /// left running or queued.
    pub(super) fn on_remote_agent_terminated(
        self: &Arc<Self>,
        state: &mut RunnerState,
        agent_id: AgentId,
        farm: Option<String>,
    ) {
        if !state.settled.insert(agent_id) {
            return;
        }
        state.running = state.running.saturating_sub(1);
        if let Some(slots) = farm.and_then(|name| state.farm_slots.get_mut(&name)) {
            slots.sessions = slots.sessions.saturating_sub(1);
            if let Some(next) = slots.waiting.pop_front() {
                state.queued = state.queued.saturating_sub(1);
                self.schedule_agent(state, next);
            }
        }
        self.announce_if_finished(state);
    }

    /// Counts down a local group when one of its agents finishes the run.
    pub(super) fn on_local_run_finished(&self, state: &mut RunnerState, group_id: GroupId) {
        let Some(remaining) = state.local_pending.get_mut(&group_id) else {
            return;
        };
        *remaining = remaining.saturating_sub(1);
        if *remaining > 0 {
            return;
        }
        state.local_pending.remove(&group_id);
        debug!(group = group_id, "Local group finished its run");
        self.announce_if_finished(state);
    }

    fn announce_if_finished(&self, state: &RunnerState) {
        if state.run_complete() {
            info!(run_id = state.run_id, "All agents finished");
            self.publish(RunnerNotice::RunFinished {
                run_id: state.run_id,
            });
        }
    }

    /// Page and query an agent's browser is sent to.
    pub(super) fn contact_page(&self, agent_id: AgentId, chunk: Option<Chunk>) -> String {
        let page = self.settings.page();
        match chunk {
            Some(chunk) => format!("{page}?agentId={agent_id}&chunk={}", chunk.label()),
            None => format!("{page}?agentId={agent_id}"),
        }
    }

    pub(super) fn contact_url(&self, agent_id: AgentId, chunk: Option<Chunk>, local: bool) -> String {
        let host = if local {
            "127.0.0.1"
        } else {
            self.settings.host.as_str()
        };
        format!(
            "http://{host}:{}{}",
            self.settings.port,
            self.contact_page(agent_id, chunk)
        )
    }
}

async fn close_session(agent_id: AgentId, session: &dyn BrowserSession) {
    if let Err(err) = session.terminate().await {
        warn!(agent = agent_id, "Failed to close browser session: {}", err);
    }
}
