use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::agent::{Agent, AgentGroup, AgentId, AgentKind, GroupId};
use crate::browser::{BrowserId, UserAgent};
use crate::parking::ParkedAgent;
use crate::protocol::{OutboundBody, RedirectTarget};

use super::state::{QueueItem, RunnerState};
use super::{ReportEvent, Runner};

impl Runner {
    /// Hands the agent to the parking lot, or sends it to a blank page
    /// when it cannot be parked, then removes it.
    pub(super) fn park_agent(&self, state: &mut RunnerState, agent_id: AgentId) {
        let Some(agent) = state.agents.get(&agent_id) else {
            return;
        };
        if let Some(parking) = &self.parking
            && !agent.is_remote()
        {
            parking.park(ParkedAgent::new(
                agent_id,
                agent.user_agent.clone(),
                agent.address.clone(),
                Arc::clone(agent.link()),
            ));
        } else {
            agent.redirect_to(RedirectTarget::blank());
        }
        self.remove_agent(state, agent_id);
    }

    pub(super) fn unpark(&self, user_agent: &UserAgent) -> Option<ParkedAgent> {
        self.parking
            .as_ref()
            .and_then(|parking| parking.unpark(user_agent))
    }

    /// Removes the agent, waiting behind queued messages when there are
    /// any so they are still processed.
    pub(super) fn remove_agent(&self, state: &mut RunnerState, agent_id: AgentId) {
        if state.queue_busy() {
            debug!(agent = agent_id, "Deferring agent removal behind queued messages");
            state.queue.push_back(QueueItem::RemoveAgent(agent_id));
            self.pump.notify_one();
        } else {
            Self::remove_agent_now(state, agent_id);
        }
    }

    pub(super) fn remove_agent_now(state: &mut RunnerState, agent_id: AgentId) {
        if !state.agents.contains_key(&agent_id) {
            return;
        }
        state.report(agent_id, ReportEvent::AgentTerminated);
        let Some(mut agent) = state.agents.remove(&agent_id) else {
            return;
        };
        agent.removed = true;
        agent
            .link()
            .send_message(OutboundBody::Terminated, false, None);
        if let Some(group) = agent
            .group_id
            .and_then(|group_id| state.groups.get_mut(&group_id))
        {
            group.remove(agent_id);
        }
        state.register_waiters.remove(&agent_id);
        info!(agent = agent_id, "Removed agent");
    }

    /// Terminates agents flagged to terminate on finish and parks the
    /// remaining local ones.
    pub(super) fn cleanup_agents(&self, state: &mut RunnerState) {
        let mut ids: Vec<AgentId> = state.agents.keys().copied().collect();
        ids.sort_unstable();
        for agent_id in ids {
            let Some(agent) = state.agents.get_mut(&agent_id) else {
                continue;
            };
            if agent.terminate_on_finish {
                agent.terminate();
            } else if !agent.is_remote() {
                self.park_agent(state, agent_id);
            }
        }
    }

    /// Drops pending inbound messages and releases every agent.
    pub fn stop_test_run(&self) {
        self.with_state(|state| {
            state.drop_pending_chunks();
            self.cleanup_agents(state);
        });
        info!("Test run stopped");
    }

    /// Stops the run and the farms, silences reporters and kills child
    /// processes. The runner answers nothing meaningful afterwards.
    pub async fn destroy(&self) {
        self.stop_test_run();
        self.lock().destroyed = true;
        for farm in self.farms.values() {
            farm.stop().await;
        }
        self.reporters.destroy();
        self.tasks.cleanup().await;
        self.pump.notify_one();
        info!(runner = self.runner_id, "Runner destroyed");
    }

    pub(super) fn on_agent_terminated(self: &Arc<Self>, agent_id: AgentId) {
        self.with_state(|state| {
            let Some(agent) = state.agents.get(&agent_id) else {
                return;
            };
            let remote = agent.is_remote();
            let farm = agent.farm().map(str::to_owned);
            self.remove_agent(state, agent_id);
            if remote {
                self.on_remote_agent_terminated(state, agent_id, farm);
            }
        });
    }

    /// Makes sure a local browser serves `group` (or `browser`): reuses a
    /// connected agent, waits briefly for one that just closed its poll,
    /// takes a matching browser from the parking lot or launches a new
    /// one.
    pub(super) fn launch_local_browser(
        self: &Arc<Self>,
        state: &mut RunnerState,
        browser: Option<BrowserId>,
        group_id: Option<GroupId>,
        parked: Option<ParkedAgent>,
    ) -> Option<GroupId> {
        let wait = self.settings.local_relaunch_wait;

        if let Some(existing) = group_id
            && let Some(first) = state
                .groups
                .get(&existing)
                .and_then(AgentGroup::first_agent)
        {
            let closed = state
                .agents
                .get(&first)
                .and_then(|agent| agent.link().closed_for());
            match closed {
                None => return group_id,
                Some(elapsed) if elapsed > wait => {
                    debug!(agent = first, "Abandoning agent without heartbeat");
                    self.park_agent(state, first);
                }
                Some(elapsed) => {
                    let runner = Arc::clone(self);
                    let delay = wait.saturating_sub(elapsed);
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        runner.with_state(|state| {
                            runner.launch_local_browser(state, browser, Some(existing), None);
                        });
                    });
                    return group_id;
                }
            }
        }

        let mut parked = parked;
        if let Some(candidate) = parked.take() {
            let user_agent = candidate.user_agent.clone();
            if !candidate.destroyed() {
                parked = user_agent.as_ref().and_then(|agent| self.unpark(agent));
            } else if group_id
                .and_then(|id| state.groups.get(&id))
                .is_none_or(AgentGroup::is_empty)
                && browser.is_none()
            {
                parked = user_agent.as_ref().and_then(|agent| self.unpark(agent));
                if parked.is_none() {
                    let placeholder = group_id.unwrap_or_else(|| state.create_group(None, true));
                    if let Some(group) = state.groups.get_mut(&placeholder) {
                        group.address.clone_from(&candidate.address);
                    }
                    if let Some(user_agent) = &user_agent {
                        state.set_group_user_agent(placeholder, user_agent);
                    }
                    warn!(group = placeholder, "No live browser available to launch");
                    return Some(placeholder);
                }
            } else {
                debug!(agent = candidate.agent_id, "Parked agent is gone");
            }
        }

        if parked.is_none() {
            let known = group_id
                .and_then(|id| state.groups.get(&id))
                .and_then(|group| group.user_agent.clone())
                .or_else(|| {
                    browser
                        .and_then(|id| state.browsers.get(&id))
                        .and_then(|configured| configured.user_agent.clone())
                });
            if let Some(user_agent) = known {
                parked = self.unpark(&user_agent);
            }
        }

        if parked.is_none() && browser.is_none() {
            return group_id;
        }

        let agent_id = state.next_agent_id();
        let known_group = group_id.or_else(|| {
            browser.and_then(|id| state.groups_by_browser.get(&id).copied())
        });
        let target = match known_group {
            Some(found) => found,
            None => {
                let created = state.create_group(browser, true);
                if let Some(user_agent) = parked.as_ref().and_then(|agent| agent.user_agent.clone())
                {
                    state.set_group_user_agent(created, &user_agent);
                }
                created
            }
        };

        let kind = if self.settings.sandbox {
            AgentKind::Sandbox
        } else {
            AgentKind::Local
        };
        let mut agent = Agent::new(agent_id, kind, self.new_link(agent_id));
        agent.terminate_on_finish = self.settings.terminate_local_agents;
        agent.browser = browser;
        agent.group_id = Some(target);
        if let Some(parked) = &parked {
            agent.address.clone_from(&parked.address);
            agent.user_agent.clone_from(&parked.user_agent);
            if let Some(group) = state.groups.get_mut(&target) {
                group.address.clone_from(&parked.address);
                group.user_agent.clone_from(&parked.user_agent);
            }
        }
        state.insert_agent(agent);
        state.report(agent_id, ReportEvent::AgentAdded);

        if let Some(parked) = parked {
            info!(agent = agent_id, parked = parked.agent_id, "Reusing parked browser");
            parked.redirect_to(RedirectTarget::page(
                self.settings.port,
                self.contact_page(agent_id, None),
            ));
        } else if let Some(browser) = browser.and_then(|id| state.browsers.get(&id)).cloned() {
            let url = self.contact_url(agent_id, None, true);
            let runner = Arc::clone(self);
            tokio::spawn(async move {
                match runner.launcher.launch(&browser, &url).await {
                    Ok(session) => runner.with_state(|state| {
                        if let Some(agent) = state.agents.get_mut(&agent_id) {
                            agent.session = Some(session);
                        }
                    }),
                    Err(err) => runner.with_state(|state| {
                        state.report(
                            agent_id,
                            ReportEvent::SystemError {
                                error: err.to_string(),
                            },
                        );
                    }),
                }
            });
        } else {
            debug!(agent = agent_id, "Browser is not configured");
        }
        Some(target)
    }
}
