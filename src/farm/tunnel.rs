use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::{info, warn};

use crate::error::FarmError;
use crate::tasks::{TaskId, TaskManager};

/// Delay before checking that a freshly spawned tunnel is still alive.
const SETTLE_DELAY: Duration = Duration::from_millis(250);

/// A tunnel process that exposes the local runner to a farm.
pub struct Tunnel {
    farm: String,
    command: Option<(String, Vec<String>)>,
    tasks: Arc<TaskManager>,
    task: Mutex<Option<TaskId>>,
}

impl Tunnel {
    #[must_use]
    pub const fn new(
        farm: String,
        command: Option<(String, Vec<String>)>,
        tasks: Arc<TaskManager>,
    ) -> Self {
        Self {
            farm,
            command,
            tasks,
            task: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.current()
            .is_some_and(|task| self.tasks.is_running(task))
    }

    /// Spawns the tunnel unless it is already up.
    ///
    /// # Errors
    ///
    /// Returns an error when no command is configured, when the process
    /// cannot be started, or when it exits right after starting.
    pub async fn start(&self) -> Result<(), FarmError> {
        if self.is_running() {
            return Ok(());
        }
        let Some((program, args)) = &self.command else {
            return Err(FarmError::MissingTunnelCommand {
                farm: self.farm.clone(),
            });
        };
        let task = self
            .tasks
            .spawn(&format!("{} tunnel", self.farm), program, args)?;
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);

        tokio::time::sleep(SETTLE_DELAY).await;
        if !self.tasks.is_running(task) {
            self.clear();
            return Err(FarmError::TunnelExited {
                command: program.clone(),
                status: "exited during startup".to_owned(),
            });
        }
        info!(farm = %self.farm, "Tunnel started");
        Ok(())
    }

    pub async fn stop(&self) {
        let Some(task) = self.clear() else {
            return;
        };
        if !self.tasks.stop(task).await {
            warn!(farm = %self.farm, "Tunnel was already gone");
        }
    }

    fn current(&self) -> Option<TaskId> {
        *self.task.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn clear(&self) -> Option<TaskId> {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}
