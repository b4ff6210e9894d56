use std::collections::{HashMap, HashSet, VecDeque};

use tokio::sync::oneshot;

use crate::agent::{Agent, AgentGroup, AgentId, GroupId};
use crate::browser::{Browser, BrowserId, UserAgent};
use crate::error::ProtocolError;
use crate::protocol::InboundMessage;

use super::{AgentInfo, BrowserInfo, ReportEvent, ReportMessage};

pub(super) type Validated = Result<InboundMessage, ProtocolError>;

/// One step of the sequential message queue.
pub(super) enum QueueItem {
    Chunk {
        agent_id: AgentId,
        messages: Vec<Validated>,
    },
    /// Resolves once every earlier item was processed.
    Done(oneshot::Sender<()>),
    /// Removal deferred until earlier chunks went through.
    RemoveAgent(AgentId),
}

/// Open session count and waiting agents of one farm.
#[derive(Default)]
pub(super) struct FarmSlots {
    pub(super) sessions: usize,
    pub(super) waiting: VecDeque<AgentId>,
}

pub(super) struct RunnerState {
    pub(super) agents: HashMap<AgentId, Agent>,
    pub(super) groups: HashMap<GroupId, AgentGroup>,
    pub(super) groups_by_browser: HashMap<BrowserId, GroupId>,
    /// Keyed by the raw user-agent string.
    pub(super) groups_by_user_agent: HashMap<String, GroupId>,
    pub(super) browsers: HashMap<BrowserId, Browser>,
    agent_seed: AgentId,
    group_seed: GroupId,
    pub(super) run_id: u64,
    pub(super) code_coverage: bool,
    pub(super) reset_needed: bool,
    pub(super) files: Vec<String>,
    pub(super) test_ids: Option<Vec<String>>,
    pub(super) run_options: serde_json::Map<String, serde_json::Value>,
    pub(super) queue: VecDeque<QueueItem>,
    /// Set while the pump works on a chunk it already took off the queue.
    pub(super) processing: bool,
    pub(super) running: usize,
    pub(super) queued: usize,
    pub(super) farm_slots: HashMap<String, FarmSlots>,
    /// Remote agents whose farm slot was already given back.
    pub(super) settled: HashSet<AgentId>,
    /// Local groups of the current run still owing `testRunFinished`, with
    /// the number of members yet to report.
    pub(super) local_pending: HashMap<GroupId, usize>,
    pub(super) register_waiters: HashMap<AgentId, oneshot::Sender<()>>,
    pub(super) destroyed: bool,
    pub(super) reports: Vec<ReportMessage>,
}

impl RunnerState {
    pub(super) fn new(browsers: HashMap<BrowserId, Browser>) -> Self {
        Self {
            agents: HashMap::new(),
            groups: HashMap::new(),
            groups_by_browser: HashMap::new(),
            groups_by_user_agent: HashMap::new(),
            browsers,
            agent_seed: 0,
            group_seed: 0,
            run_id: 0,
            code_coverage: false,
            reset_needed: false,
            files: Vec::new(),
            test_ids: None,
            run_options: serde_json::Map::new(),
            queue: VecDeque::new(),
            processing: false,
            running: 0,
            queued: 0,
            farm_slots: HashMap::new(),
            settled: HashSet::new(),
            local_pending: HashMap::new(),
            register_waiters: HashMap::new(),
            destroyed: false,
            reports: Vec::new(),
        }
    }

    /// Nothing remote is running or queued and every local group reported
    /// the end of its run.
    pub(super) fn run_complete(&self) -> bool {
        self.running == 0 && self.queued == 0 && self.local_pending.is_empty()
    }

    pub(super) const fn next_agent_id(&mut self) -> AgentId {
        self.agent_seed = self.agent_seed.saturating_add(1);
        self.agent_seed
    }

    /// Creates an empty group and indexes it by browser.
    pub(super) fn create_group(&mut self, browser: Option<BrowserId>, local: bool) -> GroupId {
        self.group_seed = self.group_seed.saturating_add(1);
        let id = self.group_seed;
        self.groups.insert(id, AgentGroup::new(id, browser, local));
        if let Some(browser) = browser {
            self.groups_by_browser.insert(browser, id);
        }
        id
    }

    pub(super) fn set_group_user_agent(&mut self, group_id: GroupId, user_agent: &UserAgent) {
        if let Some(group) = self.groups.get_mut(&group_id) {
            group.user_agent = Some(user_agent.clone());
        }
        self.groups_by_user_agent
            .insert(user_agent.raw().to_owned(), group_id);
    }

    /// Adds `agent` to its group and the registry.
    pub(super) fn insert_agent(&mut self, agent: Agent) {
        if let Some(group) = agent
            .group_id
            .and_then(|group_id| self.groups.get_mut(&group_id))
        {
            group.add(agent.id);
        }
        self.agents.insert(agent.id, agent);
    }

    pub(super) fn group_browser(&self, group_id: GroupId) -> Option<&Browser> {
        self.groups
            .get(&group_id)
            .and_then(|group| group.browser)
            .and_then(|browser| self.browsers.get(&browser))
    }

    /// Snapshot of an agent as reporters see it.
    pub(super) fn agent_info(&self, agent_id: AgentId) -> Option<AgentInfo> {
        let agent = self.agents.get(&agent_id)?;
        let browser = agent
            .group_id
            .and_then(|group_id| self.group_browser(group_id))
            .or_else(|| agent.browser.and_then(|id| self.browsers.get(&id)))
            .map(|browser| BrowserInfo {
                id: browser.id,
                name: browser.name.clone(),
                canonical: browser.canonical_name(),
                major: browser.major_version(),
            });
        Some(AgentInfo {
            id: agent.id,
            group_id: agent.group_id,
            kind: agent.kind,
            user_agent: agent.user_agent.clone(),
            browser,
            address: agent.address.clone(),
        })
    }

    /// Records a report about `agent_id` for dispatch once the lock is
    /// released.
    pub(super) fn report(&mut self, agent_id: AgentId, event: ReportEvent) {
        let agent = self.agent_info(agent_id);
        self.reports.push(ReportMessage::new(agent, event));
    }

    pub(super) fn report_runner(&mut self, event: ReportEvent) {
        self.reports.push(ReportMessage::new(None, event));
    }

    /// Whether a removal has to wait behind queued messages.
    pub(super) fn queue_busy(&self) -> bool {
        self.processing || !self.queue.is_empty()
    }

    /// Drops pending inbound chunks. Completion markers and deferred
    /// removals stay queued.
    pub(super) fn drop_pending_chunks(&mut self) {
        self.queue
            .retain(|item| !matches!(item, QueueItem::Chunk { .. }));
    }
}
