//! Registry of child processes started on behalf of a run (tunnels, local
//! browsers). Created once by the entry point and shared by reference.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

use crate::error::FarmError;

pub type TaskId = u64;

struct TaskEntry {
    name: String,
    child: Child,
}

#[derive(Default)]
pub struct TaskManager {
    next_id: AtomicU64,
    tasks: Mutex<HashMap<TaskId, TaskEntry>>,
}

impl TaskManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts `program` with `args`, forwarding its output to the log.
    ///
    /// # Errors
    ///
    /// Returns an error when the process cannot be spawned.
    pub fn spawn(&self, name: &str, program: &str, args: &[String]) -> Result<TaskId, FarmError> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| FarmError::Spawn {
                command: program.to_owned(),
                source,
            })?;

        if let Some(stdout) = child.stdout.take() {
            forward_output(name.to_owned(), stdout, false);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(name.to_owned(), stderr, true);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed).saturating_add(1);
        info!(task = name, id, "Started task");
        self.lock().insert(
            id,
            TaskEntry {
                name: name.to_owned(),
                child,
            },
        );
        Ok(id)
    }

    /// Whether the task exists and its process has not exited.
    #[must_use]
    pub fn is_running(&self, id: TaskId) -> bool {
        let mut tasks = self.lock();
        let Some(entry) = tasks.get_mut(&id) else {
            return false;
        };
        match entry.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!(task = %entry.name, %status, "Task exited");
                tasks.remove(&id);
                false
            }
            Err(err) => {
                warn!(task = %entry.name, "Failed to poll task: {}", err);
                false
            }
        }
    }

    /// Kills a task. Returns `false` when no such task was registered.
    pub async fn stop(&self, id: TaskId) -> bool {
        let entry = self.lock().remove(&id);
        let Some(mut entry) = entry else {
            return false;
        };
        if let Err(err) = entry.child.kill().await {
            warn!(task = %entry.name, "Failed to stop task: {}", err);
        } else {
            info!(task = %entry.name, id, "Stopped task");
        }
        true
    }

    /// Stops every registered task.
    pub async fn cleanup(&self) {
        let ids: Vec<TaskId> = self.lock().keys().copied().collect();
        for id in ids {
            self.stop(id).await;
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<TaskId, TaskEntry>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn forward_output<R>(name: String, stream: R, is_stderr: bool)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if is_stderr => error!(task = %name, "{}", line),
                Ok(Some(line)) => info!(task = %name, "{}", line),
                Ok(None) => break,
                Err(err) => {
                    debug!(task = %name, "Output stream closed: {}", err);
                    break;
                }
            }
        }
    });
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test(flavor = "current_thread")]
    async fn spawned_task_can_be_stopped() -> Result<(), String> {
        let manager = TaskManager::new();
        let id = manager
            .spawn("sleeper", "sleep", &["30".to_owned()])
            .map_err(|err| format!("spawn failed: {err}"))?;
        if !manager.is_running(id) {
            return Err("Expected task to be running".to_owned());
        }
        if !manager.stop(id).await {
            return Err("Expected stop to find the task".to_owned());
        }
        if manager.is_running(id) || !manager.is_empty() {
            return Err("Expected task to be gone after stop".to_owned());
        }
        Ok(())
    }

    #[tokio::test(flavor = "current_thread")]
    async fn missing_program_is_reported() -> Result<(), String> {
        let manager = TaskManager::new();
        match manager.spawn("nope", "/definitely/not/a/program", &[]) {
            Err(FarmError::Spawn { .. }) => Ok(()),
            other => Err(format!("Expected spawn error, got {:?}", other.map(|_| ()))),
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn cleanup_stops_everything() -> Result<(), String> {
        let manager = TaskManager::new();
        for _ in 0..2 {
            manager
                .spawn("sleeper", "sleep", &["30".to_owned()])
                .map_err(|err| format!("spawn failed: {err}"))?;
        }
        manager.cleanup().await;
        if !manager.is_empty() {
            return Err(format!("Expected no tasks, found {}", manager.len()));
        }
        Ok(())
    }
}
