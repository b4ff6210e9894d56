//! Browser entities, local launching and user-agent parsing.
mod canonical;
mod launcher;
mod pool;
mod user_agent;

use serde_json::{Map, Value};

pub use canonical::{canonical_name, canonical_platform, display_name};
pub use launcher::{BrowserLauncher, BrowserSession, CommandLauncher, LocalSession};
pub use pool::LocalPool;
pub use user_agent::UserAgent;

pub type BrowserId = u64;

/// How a browser is provisioned.
#[derive(Debug, Clone, PartialEq)]
pub enum BrowserTarget {
    /// A locally installed executable.
    Local { command: String, args: Vec<String> },
    /// A session requested from a named farm.
    Farm {
        farm: String,
        capabilities: Map<String, Value>,
    },
    /// A page hosted inside another application; never launched by us.
    Embedded,
}

#[derive(Debug, Clone)]
pub struct Browser {
    pub id: BrowserId,
    pub name: String,
    pub kind: String,
    pub version: Option<String>,
    pub concurrency: usize,
    pub target: BrowserTarget,
    /// Last user agent seen from an agent of this browser.
    pub user_agent: Option<UserAgent>,
}

impl Browser {
    #[must_use]
    pub fn canonical_name(&self) -> Option<&'static str> {
        canonical_name(&self.kind).or_else(|| canonical_name(&self.name))
    }

    #[must_use]
    pub fn display_name(&self) -> String {
        self.canonical_name()
            .and_then(display_name)
            .map_or_else(|| self.name.clone(), str::to_owned)
    }

    #[must_use]
    pub const fn is_local(&self) -> bool {
        matches!(self.target, BrowserTarget::Local { .. })
    }

    #[must_use]
    pub fn farm(&self) -> Option<&str> {
        match &self.target {
            BrowserTarget::Farm { farm, .. } => Some(farm),
            BrowserTarget::Local { .. } | BrowserTarget::Embedded => None,
        }
    }

    /// Configured major version, falling back to the last seen user agent.
    #[must_use]
    pub fn major_version(&self) -> Option<u32> {
        self.version
            .as_deref()
            .and_then(user_agent::major_of)
            .or_else(|| self.user_agent.as_ref().and_then(UserAgent::major))
    }

    /// Records the user agent of a registering agent; fills in the version
    /// when the configuration left it open.
    pub fn observe_user_agent(&mut self, user_agent: &UserAgent) {
        if self.version.is_none() {
            self.version = user_agent.version().map(str::to_owned);
        }
        self.user_agent = Some(user_agent.clone());
    }
}
