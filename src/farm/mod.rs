//! Remote browser farms: WebDriver hubs that open browser sessions on
//! demand, optionally behind a tunnel process.
mod tunnel;
mod webdriver;


use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::browser::BrowserSession;
use crate::error::{FarmError, ValidationError};

pub use tunnel::Tunnel;
pub use webdriver::{WebDriverFarm, WebDriverSession};

pub const DEFAULT_FARM_PORT: u16 = 4444;

/// A source of remote browser sessions.
#[async_trait]
pub trait Farm: Send + Sync {
    fn name(&self) -> &str;

    /// Maximum number of concurrently open sessions. Zero means one.
    fn session_limit(&self) -> usize;

    fn auto_start_tunnel(&self) -> bool;

    /// Brings up the farm's tunnel. Calling it again while the tunnel runs
    /// is a no-op.
    async fn start(&self) -> Result<(), FarmError>;

    async fn stop(&self);

    /// Opens a session with `capabilities` and navigates it to `url`.
    async fn open_session(
        &self,
        capabilities: &Map<String, Value>,
        url: &str,
    ) -> Result<Arc<dyn BrowserSession>, FarmError>;
}

/// Known farm flavours. Each one provides defaults for host, port and
/// tunnel command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FarmKind {
    #[default]
    Generic,
    SauceLabs,
    BrowserStack,
}

impl FarmKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Generic => "generic",
            Self::SauceLabs => "saucelabs",
            Self::BrowserStack => "browserstack",
        }
    }

    #[must_use]
    pub const fn default_host(self) -> &'static str {
        match self {
            Self::Generic => "localhost",
            Self::SauceLabs => "ondemand.saucelabs.com",
            Self::BrowserStack => "hub.browserstack.com",
        }
    }

    #[must_use]
    pub const fn default_port(self) -> u16 {
        match self {
            Self::Generic => DEFAULT_FARM_PORT,
            Self::SauceLabs | Self::BrowserStack => 80,
        }
    }

    /// Tunnel program and arguments used when the configuration does not
    /// name one.
    #[must_use]
    pub fn default_tunnel(
        self,
        username: Option<&str>,
        access_key: Option<&str>,
    ) -> Option<(String, Vec<String>)> {
        match self {
            Self::Generic => None,
            Self::SauceLabs => {
                let mut args = Vec::new();
                if let Some(user) = username {
                    args.push("--user".to_owned());
                    args.push(user.to_owned());
                }
                if let Some(key) = access_key {
                    args.push("--api-key".to_owned());
                    args.push(key.to_owned());
                }
                Some(("sc".to_owned(), args))
            }
            Self::BrowserStack => {
                let mut args = Vec::new();
                if let Some(key) = access_key {
                    args.push("--key".to_owned());
                    args.push(key.to_owned());
                }
                Some(("BrowserStackLocal".to_owned(), args))
            }
        }
    }
}

impl fmt::Display for FarmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FarmKind {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "generic" | "selenium" => Ok(Self::Generic),
            "saucelabs" | "sauce" => Ok(Self::SauceLabs),
            "browserstack" => Ok(Self::BrowserStack),
            _ => Err(ValidationError::InvalidFarmKind {
                value: value.to_owned(),
            }),
        }
    }
}

/// Resolved farm configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FarmSettings {
    pub name: String,
    pub kind: FarmKind,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub access_key: Option<String>,
    pub session_limit: usize,
    pub auto_start_tunnel: bool,
    pub tunnel: Option<(String, Vec<String>)>,
}

impl FarmSettings {
    /// Settings for `kind` with its preset host, port and tunnel.
    #[must_use]
    pub fn preset(name: &str, kind: FarmKind) -> Self {
        Self {
            name: name.to_owned(),
            kind,
            host: kind.default_host().to_owned(),
            port: kind.default_port(),
            username: None,
            access_key: None,
            session_limit: 1,
            auto_start_tunnel: false,
            tunnel: kind.default_tunnel(None, None),
        }
    }

    /// Base URL of the WebDriver hub.
    #[must_use]
    pub fn hub_url(&self) -> String {
        format!("http://{}:{}/wd/hub", self.host, self.port)
    }
}
