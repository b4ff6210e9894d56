use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, error, info, warn};

use crate::agent::{AgentId, AgentKind, GroupId};
use crate::browser::{BrowserId, UserAgent};
use crate::protocol::{InboundBody, MessageKind};

/// Receives the dispatched message stream.
pub trait Reporter: Send + Sync {
    fn supports(&self, kind: MessageKind) -> bool;
    fn dispatch(&self, message: &ReportMessage);
}

/// Browser an agent was launched for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserInfo {
    pub id: BrowserId,
    pub name: String,
    pub canonical: Option<&'static str>,
    pub major: Option<u32>,
}

/// Snapshot of the agent a report message is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentInfo {
    pub id: AgentId,
    pub group_id: Option<GroupId>,
    pub kind: AgentKind,
    pub user_agent: Option<UserAgent>,
    pub browser: Option<BrowserInfo>,
    pub address: Option<String>,
}

impl AgentInfo {
    /// Browser name and major version used to label results, preferring
    /// the configured browser over the parsed user agent.
    #[must_use]
    pub fn browser_family(&self) -> (String, Option<u32>) {
        if let Some(browser) = &self.browser {
            let name = browser
                .canonical
                .map_or_else(|| browser.name.to_lowercase(), str::to_owned);
            let major = browser
                .major
                .or_else(|| self.user_agent.as_ref().and_then(UserAgent::major));
            return (name, major);
        }
        match &self.user_agent {
            Some(user_agent) => (
                user_agent
                    .canonical_name()
                    .map_or_else(|| user_agent.family().to_lowercase(), str::to_owned),
                user_agent.major(),
            ),
            None => (format!("agent{}", self.id), None),
        }
    }

    #[must_use]
    pub fn label(&self) -> String {
        match (&self.browser, &self.user_agent) {
            (_, Some(user_agent)) => user_agent.name(),
            (Some(browser), None) => browser.name.clone(),
            (None, None) => format!("agent {}", self.id),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReportEvent {
    Inbound(InboundBody),
    AgentAdded,
    AgentRegistered,
    AgentLostConnection,
    AgentTerminated,
    AgentFailed {
        error: String,
        will_retry: bool,
    },
    AgentLaunched,
    RunStarted {
        run_id: u64,
        files: Vec<String>,
        browsers: Vec<String>,
        test_ids: Option<Vec<String>>,
    },
    SystemError {
        error: String,
    },
}

impl ReportEvent {
    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        match self {
            ReportEvent::Inbound(body) => body.kind(),
            ReportEvent::AgentAdded => MessageKind::AgentAdded,
            ReportEvent::AgentRegistered => MessageKind::AgentRegistered,
            ReportEvent::AgentLostConnection => MessageKind::AgentLostConnection,
            ReportEvent::AgentTerminated => MessageKind::AgentTerminated,
            ReportEvent::AgentFailed { .. } => MessageKind::AgentFailed,
            ReportEvent::AgentLaunched => MessageKind::AgentLaunched,
            ReportEvent::RunStarted { .. } => MessageKind::RunStarted,
            ReportEvent::SystemError { .. } => MessageKind::SystemError,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReportMessage {
    pub agent: Option<AgentInfo>,
    pub event: ReportEvent,
}

impl ReportMessage {
    #[must_use]
    pub const fn new(agent: Option<AgentInfo>, event: ReportEvent) -> Self {
        Self { agent, event }
    }

    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        self.event.kind()
    }
}

/// Fan-out to every attached reporter. Silent once destroyed.
#[derive(Default)]
pub struct ReporterSet {
    reporters: Mutex<Vec<Arc<dyn Reporter>>>,
    destroyed: AtomicBool,
}

impl ReporterSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, reporter: Arc<dyn Reporter>) {
        self.reporters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(reporter);
    }

    pub fn dispatch(&self, message: &ReportMessage) {
        if self.is_destroyed() {
            return;
        }
        let kind = message.kind();
        let reporters = self
            .reporters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for reporter in reporters {
            if reporter.supports(kind) {
                reporter.dispatch(message);
            }
        }
    }

    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

/// Logs run progress and failures to the console.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn supports(&self, kind: MessageKind) -> bool {
        matches!(
            kind,
            MessageKind::TestFinished
                | MessageKind::TestRunFinished
                | MessageKind::AgentRegistered
                | MessageKind::AgentLostConnection
                | MessageKind::AgentTerminated
                | MessageKind::AgentFailed
                | MessageKind::RunStarted
                | MessageKind::SystemError
        )
    }

    fn dispatch(&self, message: &ReportMessage) {
        let agent = message
            .agent
            .as_ref()
            .map_or_else(|| "runner".to_owned(), AgentInfo::label);
        match &message.event {
            ReportEvent::Inbound(InboundBody::TestFinished(finished)) => {
                if finished.passed {
                    debug!("[{}] test {} passed", agent, finished.id);
                } else {
                    warn!("[{}] test {} failed", agent, finished.id);
                }
            }
            ReportEvent::Inbound(InboundBody::TestRunFinished(_)) => {
                info!("[{}] finished its test run", agent);
            }
            ReportEvent::AgentRegistered => info!("[{}] registered", agent),
            ReportEvent::AgentLostConnection => warn!("[{}] lost its connection", agent),
            ReportEvent::AgentTerminated => info!("[{}] terminated", agent),
            ReportEvent::AgentFailed { error, will_retry } => {
                if *will_retry {
                    warn!("[{}] failed, retrying: {}", agent, error);
                } else {
                    error!("[{}] failed: {}", agent, error);
                }
            }
            ReportEvent::RunStarted {
                run_id,
                files,
                browsers,
                ..
            } => info!(
                "Test run {} started with {} file(s) on {} browser(s)",
                run_id,
                files.len(),
                browsers.len()
            ),
            ReportEvent::SystemError { error } => error!("{}", error),
            ReportEvent::Inbound(_)
            | ReportEvent::AgentAdded
            | ReportEvent::AgentLaunched => {}
        }
    }
}
