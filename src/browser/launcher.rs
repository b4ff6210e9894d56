use std::sync::Arc;

use async_trait::async_trait;

use crate::error::FarmError;
use crate::tasks::{TaskId, TaskManager};

use super::{Browser, BrowserTarget};

/// A running browser that an agent can drive outside the long-poll channel.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    /// Human readable description for logs.
    fn describe(&self) -> String;

    /// Captures the current page as base64 PNG data (optionally prefixed
    /// with a `data:image/png;base64,` header).
    async fn screenshot(&self) -> Result<Option<String>, FarmError>;

    async fn terminate(&self) -> Result<(), FarmError>;
}

/// Starts local browser processes pointed at an agent contact URL.
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self, browser: &Browser, url: &str)
    -> Result<Arc<dyn BrowserSession>, FarmError>;
}

/// Launches the configured command with the contact URL as last argument.
pub struct CommandLauncher {
    tasks: Arc<TaskManager>,
}

impl CommandLauncher {
    #[must_use]
    pub const fn new(tasks: Arc<TaskManager>) -> Self {
        Self { tasks }
    }
}

#[async_trait]
impl BrowserLauncher for CommandLauncher {
    async fn launch(
        &self,
        browser: &Browser,
        url: &str,
    ) -> Result<Arc<dyn BrowserSession>, FarmError> {
        let (command, args) = match &browser.target {
            BrowserTarget::Local { command, args } => (command.as_str(), args),
            BrowserTarget::Farm { .. } | BrowserTarget::Embedded => {
                return Err(FarmError::NotLaunchable {
                    browser: browser.name.clone(),
                });
            }
        };
        let mut full_args = args.clone();
        full_args.push(url.to_owned());
        let task = self.tasks.spawn(&browser.name, command, &full_args)?;
        Ok(Arc::new(LocalSession {
            name: browser.name.clone(),
            task,
            tasks: Arc::clone(&self.tasks),
        }))
    }
}

/// A local browser process tracked by the task manager.
pub struct LocalSession {
    name: String,
    task: TaskId,
    tasks: Arc<TaskManager>,
}

#[async_trait]
impl BrowserSession for LocalSession {
    fn describe(&self) -> String {
        format!("{} (task {})", self.name, self.task)
    }

    async fn screenshot(&self) -> Result<Option<String>, FarmError> {
        Err(FarmError::ScreenshotUnsupported {
            browser: self.name.clone(),
        })
    }

    async fn terminate(&self) -> Result<(), FarmError> {
        self.tasks.stop(self.task).await;
        Ok(())
    }
}
