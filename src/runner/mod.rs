//! The coordinator between connected browsers and reporters.
//!
//! A [`Runner`] owns the agent and group registries, answers the three
//! long-poll channels, pushes inbound batches through a sequential message
//! queue and schedules browsers on local machines and farms. All registry
//! mutation happens under one lock that is never held across an await;
//! report messages produced under the lock are dispatched after it is
//! released.
mod lifecycle;
mod queue;
mod register;
mod reporter;
mod schedule;
mod state;


use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use rand::Rng;
use serde_json::{Map, Value};
use tokio::sync::{Notify, broadcast, mpsc};
use tracing::{debug, info};

use crate::agent::{
    AgentEvent, AgentId, AgentLink, DEFAULT_LOST_GRACE, DEFAULT_POLL_TIMEOUT, DispatchContext,
    GroupId,
};
use crate::archive::ArchiveReporter;
use crate::browser::{Browser, BrowserId, BrowserLauncher, LocalPool};
use crate::farm::Farm;
use crate::parking::ParkingLot;
use crate::tasks::TaskManager;

pub use register::{PollOutcome, PollRequest, RegisterRequest};
pub use reporter::{
    AgentInfo, BrowserInfo, LogReporter, ReportEvent, ReportMessage, Reporter, ReporterSet,
};
pub use schedule::RunOptions;

use state::RunnerState;

pub const ROUTE_PREFIX: &str = "/~testrelay";
pub const DEFAULT_PORT: u16 = 7070;
pub const DEFAULT_SUBJECT_PAGE: &str = "/~testrelay/page.html";
pub const SANDBOX_PAGE: &str = "/~testrelay/sandbox/sandbox.html";
pub const DEFAULT_LOCAL_RELAUNCH_WAIT: Duration = Duration::from_millis(1_000);
pub const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_millis(60_000);
pub const DEFAULT_REMOTE_RETRIES: u32 = 2;

/// Tunables of a runner. Built from config and CLI by the entry point.
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    /// Host remote browsers use to reach this runner.
    pub host: String,
    pub port: u16,
    pub subject_page: String,
    pub sandbox: bool,
    /// Number of inbound messages processed per queue step; zero keeps a
    /// batch whole.
    pub message_chunk_size: usize,
    pub poll_timeout: Duration,
    pub lost_grace: Duration,
    pub local_relaunch_wait: Duration,
    pub remote_timeout: Duration,
    pub remote_retries: u32,
    /// Whether local agents terminate once their run finishes.
    pub terminate_local_agents: bool,
    /// Overrides every farm's own tunnel auto-start flag when set.
    pub auto_start_tunnel: Option<bool>,
    pub test_options: Map<String, Value>,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: DEFAULT_PORT,
            subject_page: DEFAULT_SUBJECT_PAGE.to_owned(),
            sandbox: false,
            message_chunk_size: 0,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            lost_grace: DEFAULT_LOST_GRACE,
            local_relaunch_wait: DEFAULT_LOCAL_RELAUNCH_WAIT,
            remote_timeout: DEFAULT_REMOTE_TIMEOUT,
            remote_retries: DEFAULT_REMOTE_RETRIES,
            terminate_local_agents: false,
            auto_start_tunnel: None,
            test_options: Map::new(),
        }
    }
}

impl RunnerSettings {
    /// Page agents load; sandbox mode has its own host page.
    #[must_use]
    pub fn page(&self) -> &str {
        if self.sandbox {
            SANDBOX_PAGE
        } else {
            &self.subject_page
        }
    }
}

/// Run lifecycle notifications for whoever drives the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerNotice {
    RunStarted { run_id: u64 },
    RunFinished { run_id: u64 },
}

/// Collaborators a runner is wired with.
pub struct RunnerParts {
    pub browsers: Vec<Browser>,
    pub farms: Vec<Arc<dyn Farm>>,
    pub launcher: Arc<dyn BrowserLauncher>,
    pub parking: Option<Arc<dyn ParkingLot>>,
    pub archive: Option<Arc<ArchiveReporter>>,
    pub tasks: Arc<TaskManager>,
}

pub struct Runner {
    settings: RunnerSettings,
    runner_id: u32,
    proxy_id: String,
    farms: HashMap<String, Arc<dyn Farm>>,
    launcher: Arc<dyn BrowserLauncher>,
    parking: Option<Arc<dyn ParkingLot>>,
    local_pool: LocalPool,
    dispatch: DispatchContext,
    reporters: ReporterSet,
    tasks: Arc<TaskManager>,
    events: mpsc::UnboundedSender<AgentEvent>,
    notices: broadcast::Sender<RunnerNotice>,
    pump: Arc<Notify>,
    state: Mutex<RunnerState>,
}

impl Runner {
    /// Builds a runner and starts its event loop and message pump.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn start(settings: RunnerSettings, parts: RunnerParts) -> Arc<Self> {
        let mut rng = rand::thread_rng();
        let runner_id: u32 = rng.gen_range(1..u32::MAX);
        let proxy_id = format!("{:08x}", rng.r#gen::<u32>());
        let (events, receiver) = mpsc::unbounded_channel();
        let (notices, _) = broadcast::channel(16);

        let local_pool = LocalPool::new(&parts.browsers);
        let farms = parts
            .farms
            .into_iter()
            .map(|farm| (farm.name().to_owned(), farm))
            .collect();
        let reporters = ReporterSet::new();
        if let Some(archive) = &parts.archive {
            reporters.add(Arc::clone(archive) as Arc<dyn Reporter>);
        }
        let screenshots = parts.archive.filter(|archive| archive.screenshots_enabled());
        let browsers = parts
            .browsers
            .into_iter()
            .map(|browser| (browser.id, browser))
            .collect();

        let runner = Arc::new(Self {
            settings,
            runner_id,
            proxy_id,
            farms,
            launcher: parts.launcher,
            parking: parts.parking,
            local_pool,
            dispatch: DispatchContext { screenshots },
            reporters,
            tasks: parts.tasks,
            events,
            notices,
            pump: Arc::new(Notify::new()),
            state: Mutex::new(RunnerState::new(browsers)),
        });
        info!(runner = runner_id, proxy = %runner.proxy_id, "Runner started");

        tokio::spawn(run_events(Arc::downgrade(&runner), receiver));
        tokio::spawn(queue::run_pump(Arc::downgrade(&runner), Arc::clone(&runner.pump)));
        runner
    }

    #[must_use]
    pub const fn runner_id(&self) -> u32 {
        self.runner_id
    }

    #[must_use]
    pub fn proxy_id(&self) -> &str {
        &self.proxy_id
    }

    #[must_use]
    pub const fn settings(&self) -> &RunnerSettings {
        &self.settings
    }

    #[must_use]
    pub const fn reporters(&self) -> &ReporterSet {
        &self.reporters
    }

    pub fn add_reporter(&self, reporter: Arc<dyn Reporter>) {
        self.reporters.add(reporter);
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RunnerNotice> {
        self.notices.subscribe()
    }

    #[must_use]
    pub fn run_id(&self) -> u64 {
        self.lock().run_id
    }

    #[must_use]
    pub fn agent_ids(&self) -> Vec<AgentId> {
        let mut ids: Vec<AgentId> = self.lock().agents.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    #[must_use]
    pub fn group_of(&self, agent_id: AgentId) -> Option<GroupId> {
        self.lock()
            .agents
            .get(&agent_id)
            .and_then(|agent| agent.group_id)
    }

    #[must_use]
    pub fn group_for_browser(&self, browser: BrowserId) -> Option<GroupId> {
        self.lock().groups_by_browser.get(&browser).copied()
    }

    /// Link of a registered or parked agent.
    #[must_use]
    pub fn link(&self, agent_id: AgentId) -> Option<Arc<AgentLink>> {
        let registered = self
            .lock()
            .agents
            .get(&agent_id)
            .map(|agent| Arc::clone(agent.link()));
        registered.or_else(|| {
            self.parking
                .as_ref()
                .and_then(|parking| parking.parked_link(agent_id))
        })
    }

    /// Counts of running and queued remote agents.
    #[must_use]
    pub fn schedule_counts(&self) -> (usize, usize) {
        let state = self.lock();
        (state.running, state.queued)
    }

    fn new_link(&self, agent_id: AgentId) -> Arc<AgentLink> {
        Arc::new(AgentLink::new(
            agent_id,
            self.settings.poll_timeout,
            self.settings.lost_grace,
            self.events.clone(),
        ))
    }

    fn publish(&self, notice: RunnerNotice) {
        if self.notices.send(notice).is_err() {
            debug!(?notice, "No one is listening for runner notices");
        }
    }

    fn lock(&self) -> MutexGuard<'_, RunnerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` under the state lock, then dispatches the report messages
    /// it produced.
    fn with_state<R>(&self, f: impl FnOnce(&mut RunnerState) -> R) -> R {
        let (result, reports) = {
            let mut state = self.lock();
            let result = f(&mut state);
            (result, std::mem::take(&mut state.reports))
        };
        for report in &reports {
            self.reporters.dispatch(report);
        }
        result
    }
}

async fn run_events(runner: Weak<Runner>, mut receiver: mpsc::UnboundedReceiver<AgentEvent>) {
    while let Some(event) = receiver.recv().await {
        let Some(runner) = runner.upgrade() else {
            break;
        };
        debug!(?event, "Agent event");
        match event {
            AgentEvent::LostConnection { agent_id } => {
                runner.with_state(|state| {
                    state.report(agent_id, ReportEvent::AgentLostConnection);
                });
            }
            AgentEvent::Terminated { agent_id } => runner.on_agent_terminated(agent_id),
            AgentEvent::Failed { agent_id, error } => runner.on_agent_failed(agent_id, error),
        }
    }
    debug!("Agent event loop stopped");
}
