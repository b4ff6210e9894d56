use std::collections::BTreeSet;

use crate::browser::{BrowserId, UserAgent};

use super::{AgentId, GroupId};

/// Agents treated as the same logical browser within a run.
#[derive(Debug, Clone)]
pub struct AgentGroup {
    pub id: GroupId,
    pub browser: Option<BrowserId>,
    pub user_agent: Option<UserAgent>,
    pub address: Option<String>,
    /// Whether agents of this group run on this machine.
    pub local: bool,
    agents: BTreeSet<AgentId>,
}

impl AgentGroup {
    #[must_use]
    pub const fn new(id: GroupId, browser: Option<BrowserId>, local: bool) -> Self {
        Self {
            id,
            browser,
            user_agent: None,
            address: None,
            local,
            agents: BTreeSet::new(),
        }
    }

    pub fn add(&mut self, agent: AgentId) {
        self.agents.insert(agent);
    }

    pub fn remove(&mut self, agent: AgentId) -> bool {
        self.agents.remove(&agent)
    }

    #[must_use]
    pub fn first_agent(&self) -> Option<AgentId> {
        self.agents.first().copied()
    }

    #[must_use]
    pub fn agent_ids(&self) -> Vec<AgentId> {
        self.agents.iter().copied().collect()
    }

    #[must_use]
    pub fn contains(&self, agent: AgentId) -> bool {
        self.agents.contains(&agent)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}
