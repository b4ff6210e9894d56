//! Connected browsers: the [`Agent`] record kept by the runner, its
//! long-poll [`AgentLink`], per-variant message dispatch and
//! [`AgentGroup`]s of agents that share a browser identity.
mod dispatch;
mod group;
mod link;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::browser::{BrowserId, BrowserSession, UserAgent};
use crate::error::ProtocolError;
use crate::protocol::{OutboundBody, RedirectTarget};

pub use dispatch::{DispatchContext, HandlerValue, ResponseFuture, agent_level};
pub use group::AgentGroup;
pub use link::{AgentLink, DEFAULT_LOST_GRACE, DEFAULT_POLL_TIMEOUT, ResponseCallback};

pub type AgentId = u64;
pub type GroupId = u64;

/// Which handler table an agent dispatches through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentKind {
    /// A local or anonymously connected browser.
    Local,
    /// A browser session opened on a farm.
    Remote,
    /// A page embedded in a host application.
    Sandbox,
}

/// Events an agent raises towards the runner's event loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    LostConnection { agent_id: AgentId },
    Terminated { agent_id: AgentId },
    Failed { agent_id: AgentId, error: String },
}

/// Position of a chunked agent among its siblings (1-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub index: usize,
    pub total: usize,
}

impl Chunk {
    #[must_use]
    pub fn label(self) -> String {
        format!("{}/{}", self.index, self.total)
    }
}

/// Launch bookkeeping for agents whose browser lives on a farm.
#[derive(Debug, Clone)]
pub struct RemoteState {
    pub farm: String,
    pub retries: u32,
    pub chunk: Option<Chunk>,
    pub url: String,
}

pub struct Agent {
    pub id: AgentId,
    pub kind: AgentKind,
    pub group_id: Option<GroupId>,
    pub session_id: Option<String>,
    sequence: u64,
    pub user_agent: Option<UserAgent>,
    pub address: Option<String>,
    pub is_running: bool,
    pub terminate_on_finish: bool,
    pub removed: bool,
    pub registered: bool,
    pub test_ids: Option<Vec<String>>,
    pub browser: Option<BrowserId>,
    pub remote: Option<RemoteState>,
    pub session: Option<Arc<dyn BrowserSession>>,
    link: Arc<AgentLink>,
}

impl Agent {
    #[must_use]
    pub const fn new(id: AgentId, kind: AgentKind, link: Arc<AgentLink>) -> Self {
        Self {
            id,
            kind,
            group_id: None,
            session_id: None,
            sequence: 0,
            user_agent: None,
            address: None,
            is_running: false,
            terminate_on_finish: false,
            removed: false,
            registered: false,
            test_ids: None,
            browser: None,
            remote: None,
            session: None,
            link,
        }
    }

    #[must_use]
    pub const fn link(&self) -> &Arc<AgentLink> {
        &self.link
    }

    #[must_use]
    pub const fn is_remote(&self) -> bool {
        self.remote.is_some()
    }

    #[must_use]
    pub fn farm(&self) -> Option<&str> {
        self.remote.as_ref().map(|remote| remote.farm.as_str())
    }

    /// Restarts inbound sequence checking, as on a fresh registration.
    pub const fn reset_sequence(&mut self) {
        self.sequence = 0;
    }

    /// Inbound messages must arrive numbered `previous + 1`, where
    /// `previous` is the last accepted number. A rejected message leaves
    /// the counter untouched.
    ///
    /// # Errors
    ///
    /// Returns an error when `sequence` is not the next expected number.
    pub fn validate_sequence(&mut self, sequence: u64) -> Result<(), ProtocolError> {
        let expected = self.sequence.saturating_add(1);
        if sequence != expected {
            return Err(ProtocolError::UnexpectedSequence {
                actual: sequence,
                expected,
            });
        }
        self.sequence = expected;
        Ok(())
    }

    /// Options specific to this agent; merged last into `testOptions`.
    #[must_use]
    pub fn test_options(&self) -> Map<String, Value> {
        let mut options = Map::new();
        if let Some(chunk) = self.remote.as_ref().and_then(|remote| remote.chunk) {
            options.insert("chunk".to_owned(), Value::from(chunk.label()));
        }
        options
    }

    /// Tells the browser to run tests. Jumps the outbox queue so it lands
    /// before any pending reload.
    pub fn start_test_run(
        &mut self,
        run_id: u64,
        test_ids: Option<Vec<String>>,
        reload: bool,
        mut test_options: Map<String, Value>,
    ) {
        self.is_running = true;
        test_options.extend(self.test_options());
        let test_ids = test_ids.or_else(|| self.test_ids.clone());
        debug!(agent = self.id, run_id, reload, "Starting test run");
        self.link.send_message(
            OutboundBody::StartTestRun {
                run_id,
                reload,
                test_ids,
                test_options,
            },
            true,
            None,
        );
    }

    pub fn redirect_to(&self, target: RedirectTarget) {
        self.link
            .send_message(OutboundBody::Redirect(target), false, None);
    }

    pub fn reload(&self) {
        self.link
            .send_message(OutboundBody::Reload { forced: false }, false, None);
    }

    /// Closes the browser session, if any, and notifies the runner.
    pub fn terminate(&mut self) {
        self.link.mark_terminated();
        self.is_running = false;
        if let Some(session) = self.session.clone() {
            let agent_id = self.id;
            tokio::spawn(async move {
                if let Err(err) = session.terminate().await {
                    warn!(agent = agent_id, "Failed to close browser session: {}", err);
                }
            });
        }
        self.link.emit(AgentEvent::Terminated { agent_id: self.id });
    }
}
