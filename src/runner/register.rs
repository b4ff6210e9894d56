use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::agent::{Agent, AgentGroup, AgentId, AgentKind, AgentLink, GroupId};
use crate::browser::UserAgent;
use crate::protocol::{OutboundBody, OutboundMessage, RedirectTarget, parse_batch};

use super::state::RunnerState;
use super::{ReportEvent, Runner};

pub const MISSING_SESSION: &str = "test agent must supply sessionId during registration";

/// Query and headers of a `register` request.
#[derive(Debug, Clone, Default)]
pub struct RegisterRequest {
    pub agent_id: Option<AgentId>,
    pub session_id: Option<String>,
    pub runner_id: Option<String>,
    pub user_agent: String,
    pub address: Option<String>,
    /// The request came from this machine.
    pub is_local: bool,
}

/// Query and body of a `messages` or `updates` request.
#[derive(Debug, Clone, Default)]
pub struct PollRequest {
    pub agent_id: Option<AgentId>,
    pub proxy_id: Option<String>,
    pub run_id: Option<u64>,
    pub body: Vec<u8>,
}

/// How a `messages` request is answered.
pub enum PollOutcome {
    /// Respond right away.
    Reply(Vec<OutboundMessage>),
    /// Hold the request on the agent's link until messages are ready.
    Hold(Arc<AgentLink>),
}

impl Runner {
    /// Registers a browser and answers with a handshake, or with the
    /// reload or error the browser has to act on.
    pub fn register(&self, request: RegisterRequest) -> Vec<OutboundMessage> {
        self.with_state(|state| self.register_locked(state, request))
    }

    fn register_locked(
        &self,
        state: &mut RunnerState,
        request: RegisterRequest,
    ) -> Vec<OutboundMessage> {
        let known = request
            .agent_id
            .filter(|agent_id| state.agents.contains_key(agent_id));
        if let Some(agent_id) = known
            && state
                .agents
                .get(&agent_id)
                .is_some_and(|agent| agent.link().take_armed_timer())
        {
            state.report(agent_id, ReportEvent::AgentLostConnection);
        }

        let runner_id = self.runner_id.to_string();
        if request.runner_id.as_deref() != Some(runner_id.as_str()) {
            info!(agent = ?request.agent_id, "Agent belongs to another runner, reloading");
            return vec![OutboundBody::Reload { forced: true }.into()];
        }
        let Some(session_id) = request.session_id else {
            warn!(agent = ?request.agent_id, "{}", MISSING_SESSION);
            return vec![
                OutboundBody::Error {
                    message: MISSING_SESSION.to_owned(),
                }
                .into(),
            ];
        };

        let user_agent = UserAgent::parse(&request.user_agent);
        let reused = known.filter(|agent_id| {
            state.agents.get(agent_id).is_some_and(|agent| {
                agent
                    .session_id
                    .as_deref()
                    .is_none_or(|existing| existing == session_id)
            })
        });
        let anonymous = reused.is_none();
        let agent_id = match reused {
            Some(agent_id) => agent_id,
            None => self.add_anonymous_agent(state, &user_agent, request.is_local),
        };

        let Some(group_id) = state.agents.get(&agent_id).and_then(|agent| agent.group_id) else {
            return Vec::new();
        };
        let group_browser = state.groups.get(&group_id).and_then(|group| group.browser);
        if let Some(browser) = group_browser.and_then(|id| state.browsers.get_mut(&id)) {
            browser.observe_user_agent(&user_agent);
        }
        let local_group = state.groups.get(&group_id).is_some_and(|group| group.local);
        if anonymous || local_group {
            state.set_group_user_agent(group_id, &user_agent);
            if let Some(group) = state.groups.get_mut(&group_id) {
                group.address.clone_from(&request.address);
            }
        }

        let Some(agent) = state.agents.get_mut(&agent_id) else {
            return Vec::new();
        };
        agent.user_agent = Some(user_agent);
        agent.address = request.address;
        agent.reset_sequence();
        agent.session_id = Some(session_id);
        agent.registered = true;
        agent.link().reset_lost();

        if anonymous {
            state.report(agent_id, ReportEvent::AgentAdded);
        }
        state.report(agent_id, ReportEvent::AgentRegistered);
        if let Some(waiter) = state.register_waiters.remove(&agent_id)
            && waiter.send(()).is_err()
        {
            debug!(agent = agent_id, "Launch stopped waiting for registration");
        }
        info!(agent = agent_id, group = group_id, "Agent registered");

        vec![
            OutboundBody::Handshake {
                agent_id,
                proxy_id: self.proxy_id.clone(),
            }
            .into(),
        ]
    }

    /// Creates an agent for a browser that connected without a known id.
    ///
    /// Earlier agents of the same user agent are parked first; a local
    /// browser is attributed to a configured browser when one matches.
    fn add_anonymous_agent(
        &self,
        state: &mut RunnerState,
        user_agent: &UserAgent,
        is_local: bool,
    ) -> AgentId {
        let mut group_id: Option<GroupId> = state.groups_by_user_agent.get(user_agent.raw()).copied();
        if let Some(existing) = group_id {
            let members = state
                .groups
                .get(&existing)
                .map(AgentGroup::agent_ids)
                .unwrap_or_default();
            for member in members {
                debug!(agent = member, "Parking agent replaced by a new connection");
                self.park_agent(state, member);
            }
        }

        let agent_id = state.next_agent_id();
        let kind = if self.settings.sandbox {
            AgentKind::Sandbox
        } else {
            AgentKind::Local
        };
        let mut agent = Agent::new(agent_id, kind, self.new_link(agent_id));
        agent.terminate_on_finish = self.settings.terminate_local_agents;

        if is_local
            && group_id.is_none()
            && let Some(browser) = self.local_pool.lookup_by_user_agent(user_agent)
        {
            agent.browser = Some(browser);
            group_id = Some(
                state
                    .groups_by_browser
                    .get(&browser)
                    .copied()
                    .unwrap_or_else(|| state.create_group(Some(browser), true)),
            );
        }
        let group_id = group_id.unwrap_or_else(|| state.create_group(None, is_local));
        agent.group_id = Some(group_id);
        state.insert_agent(agent);
        debug!(agent = agent_id, group = group_id, "Added anonymous agent");
        agent_id
    }

    /// Long-poll channel: queues the inbound batch and hands back the link
    /// to hold the request on.
    #[must_use]
    pub fn messages(&self, request: &PollRequest) -> PollOutcome {
        match self.resolve_poll(request) {
            Ok(link) => {
                self.queue_updates(request);
                link.on_connection_open();
                PollOutcome::Hold(link)
            }
            Err(reply) => PollOutcome::Reply(reply),
        }
    }

    /// Fire-and-forget channel: queues the inbound batch only.
    #[must_use]
    pub fn updates(&self, request: &PollRequest) -> Vec<OutboundMessage> {
        match self.resolve_poll(request) {
            Ok(_) => {
                self.queue_updates(request);
                Vec::new()
            }
            Err(reply) => reply,
        }
    }

    /// Link of a registered agent with a matching proxy id, or of a parked
    /// agent still waiting for its redirect.
    fn resolve_poll(&self, request: &PollRequest) -> Result<Arc<AgentLink>, Vec<OutboundMessage>> {
        let registered = request.agent_id.and_then(|agent_id| {
            let state = self.lock();
            let agent = state.agents.get(&agent_id)?;
            (request.proxy_id.as_deref() == Some(self.proxy_id.as_str()))
                .then(|| Arc::clone(agent.link()))
        });
        let parked = || {
            request.agent_id.and_then(|agent_id| {
                self.parking
                    .as_ref()
                    .and_then(|parking| parking.parked_link(agent_id))
            })
        };
        registered.or_else(parked).ok_or_else(|| {
            debug!(agent = ?request.agent_id, "Redirecting unknown agent");
            vec![OutboundBody::Redirect(self.unknown_agent_target()).into()]
        })
    }

    fn unknown_agent_target(&self) -> RedirectTarget {
        self.parking
            .as_ref()
            .and_then(|parking| parking.port())
            .map_or_else(RedirectTarget::blank, RedirectTarget::port)
    }

    fn queue_updates(&self, request: &PollRequest) {
        let Some(agent_id) = request.agent_id else {
            return;
        };
        let current = self.lock().run_id;
        if request.run_id.is_some_and(|run_id| run_id != current) {
            debug!(agent = agent_id, run = ?request.run_id, "Ignoring messages of a stale run");
            return;
        }
        match parse_batch(&request.body) {
            Ok(messages) if messages.is_empty() => {}
            Ok(messages) => {
                drop(self.queue_messages(agent_id, messages));
            }
            Err(err) => warn!(agent = agent_id, "Dropping message batch: {}", err),
        }
    }
}
