//! Result archive built from the reporter stream.
//!
//! Each agent gets a [`context`] task that walks a tree of directories,
//! one per dir/file/suite, each described by a `data.json`. Failure counts
//! per browser roll up to every ancestor as tests finish. [`ArchiveReporter::flush`]
//! writes the descriptors, zips the tree and uploads it when a server is
//! configured. [`Merger`] folds one finished archive into another.
mod bundle;
mod context;
mod descriptor;
mod merge;
mod naming;
mod screenshot;
mod server;
mod store;

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tracing::{debug, info};

pub use bundle::{extract_zip, zip_dir};
pub use descriptor::{
    BrowserEntry, BrowserResult, ChildEntry, CoverageEntry, Descriptor, EntryKind,
    ScenarioEntry, TestDetails,
};
pub use merge::{MergeReport, Merger};
pub use naming::sanitize;
pub use screenshot::{ImageComparator, ImageDiff, PixelComparator, ScreenshotOutcome};
pub use server::ArchiveServer;
pub use store::{DESCRIPTOR_FILE, DescriptorStore};

use context::{Context, ContextHandle, DownEntry, Shared, Step};
use naming::{path_segments, slash_path};

use crate::agent::AgentId;
use crate::error::ArchiveError;
use crate::protocol::{InboundBody, MessageKind};
use crate::runner::{AgentInfo, ReportEvent, ReportMessage, Reporter};

pub const DEFAULT_WORKDIR: &str = "./archives";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSettings {
    /// Archive id; a fresh UUID when unset.
    pub id: Option<String>,
    pub workdir: PathBuf,
    /// Defaults to `<workdir>/baseline`.
    pub baselinedir: Option<PathBuf>,
    /// Project path inside the archive, e.g. `product/nightly`.
    pub archive_path: String,
    pub scenario: String,
    pub server: Option<String>,
    pub storage_key: Option<String>,
    pub enable_screenshots: bool,
}

impl Default for ArchiveSettings {
    fn default() -> Self {
        Self {
            id: None,
            workdir: PathBuf::from(DEFAULT_WORKDIR),
            baselinedir: None,
            archive_path: String::new(),
            scenario: "default".to_owned(),
            server: None,
            storage_key: None,
            enable_screenshots: true,
        }
    }
}

/// Directories of one archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveLayout {
    pub workdir: PathBuf,
    pub basedir: PathBuf,
    pub archivedir: PathBuf,
    pub scenariodir: PathBuf,
    pub baselinedir: PathBuf,
}

impl ArchiveLayout {
    #[must_use]
    pub fn new(settings: &ArchiveSettings, id: &str) -> Self {
        let workdir = settings.workdir.clone();
        let basedir = workdir.join(id);
        let archivedir = path_segments(&settings.archive_path)
            .iter()
            .fold(basedir.clone(), |dir, part| dir.join(part));
        let scenariodir = archivedir.join(sanitize(&settings.scenario));
        let baselinedir = settings
            .baselinedir
            .clone()
            .unwrap_or_else(|| workdir.join("baseline"));
        Self {
            workdir,
            basedir,
            archivedir,
            scenariodir,
            baselinedir,
        }
    }
}

/// Builds the archive from the reporter stream.
pub struct ArchiveReporter {
    id: String,
    archive_parts: Vec<String>,
    enable_screenshots: bool,
    shared: Arc<Shared>,
    contexts: Mutex<HashMap<AgentId, ContextHandle>>,
}

impl ArchiveReporter {
    /// # Errors
    ///
    /// Returns an error when the archive server client cannot be built.
    pub fn new(settings: &ArchiveSettings) -> Result<Self, ArchiveError> {
        Self::with_comparator(settings, Arc::new(PixelComparator::default()))
    }

    /// # Errors
    ///
    /// Returns an error when the archive server client cannot be built.
    pub fn with_comparator(
        settings: &ArchiveSettings,
        comparator: Arc<dyn ImageComparator>,
    ) -> Result<Self, ArchiveError> {
        let id = settings
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let layout = ArchiveLayout::new(settings, &id);
        let server = settings
            .server
            .as_deref()
            .map(|base| ArchiveServer::new(base, settings.storage_key.clone()))
            .transpose()?;
        let scenario_path = layout
            .scenariodir
            .strip_prefix(&layout.basedir)
            .map(slash_path)
            .unwrap_or_default();
        let shared = Arc::new(Shared::new(
            layout,
            settings.archive_path.clone(),
            comparator,
            server,
        ));
        shared.store().root_mut().scenarios = Some(vec![ScenarioEntry {
            path: scenario_path,
        }]);
        Ok(Self {
            id,
            archive_parts: path_segments(&settings.archive_path),
            enable_screenshots: settings.enable_screenshots,
            shared,
            contexts: Mutex::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn layout(&self) -> &ArchiveLayout {
        &self.shared.layout
    }

    #[must_use]
    pub const fn screenshots_enabled(&self) -> bool {
        self.enable_screenshots
    }

    fn contexts(&self) -> MutexGuard<'_, HashMap<AgentId, ContextHandle>> {
        self.contexts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn context_for(&self, agent: &AgentInfo) -> ContextHandle {
        let mut contexts = self.contexts();
        if let Some(handle) = contexts.get(&agent.id) {
            return handle.clone();
        }
        let group_key = agent.group_id.map_or_else(
            || format!("agent-{}", agent.id),
            |group| format!("group-{group}"),
        );
        let (family, major) = agent.browser_family();
        let raw = agent
            .user_agent
            .as_ref()
            .map(|user_agent| user_agent.raw().to_owned())
            .unwrap_or_default();
        let browser_id =
            self.shared
                .store()
                .browser_id(&group_key, &family, major, &agent.label(), &raw);
        debug!("Archiving results of agent {} as '{}'", agent.id, browser_id);
        let handle = Context::spawn(agent.id, browser_id, Arc::clone(&self.shared));
        contexts.insert(agent.id, handle.clone());
        handle
    }

    fn route(&self, agent: &AgentInfo, body: &InboundBody) {
        let context = self.context_for(agent);
        match body {
            InboundBody::TestRunStarted(_) => context.step(Step::Reset),
            InboundBody::TestSuiteEnter(enter) => {
                if let Some(file_name) = &enter.file_name {
                    context.step(Step::Reset);
                    for part in &self.archive_parts {
                        context.step(Step::Down(DownEntry::dir(part)));
                    }
                    let mut segments = vec![scenario_dirname(&self.shared.layout)];
                    segments.extend(path_segments(file_name));
                    if let Some((file, dirs)) = segments.split_last() {
                        for part in dirs {
                            context.step(Step::Down(DownEntry::dir(part)));
                        }
                        context.step(Step::Down(DownEntry {
                            name: file.clone(),
                            kind: EntryKind::File,
                            id: None,
                        }));
                    }
                }
                context.step(Step::Down(DownEntry {
                    name: enter.name.clone(),
                    kind: EntryKind::Suite,
                    id: Some(enter.id.clone()),
                }));
            }
            InboundBody::TestSuiteLeave(_) | InboundBody::TestSuiteFinished(_) => {
                context.step(Step::Up);
            }
            InboundBody::TestSuiteStarted(suite) => {
                if let Some(id) = &suite.id {
                    context.step(Step::Suite(id.clone()));
                }
            }
            InboundBody::TestAdded(added) => context.step(Step::AddTest {
                id: added.id.clone(),
                name: added.name.clone(),
                disabled: added.disabled,
            }),
            InboundBody::TestStarted(started) => context.step(Step::StartTest {
                id: started.id.clone(),
            }),
            InboundBody::TestFinished(finished) => context.step(Step::EndTest {
                id: finished.id.clone(),
                passed: finished.passed,
                expectations: finished.expectations.clone(),
            }),
            InboundBody::CodeCoverage(report) => context.step(Step::Coverage {
                name: report.name.clone(),
                results: report.results.clone(),
            }),
            InboundBody::CodeCoverageStructure(report) => {
                context.step(Step::CoverageStructure {
                    results: report.results.clone(),
                });
            }
            InboundBody::Log(_)
            | InboundBody::Response(_)
            | InboundBody::Screenshot(_)
            | InboundBody::TestRunFinished(_) => {}
        }
    }

    /// Saves a screenshot in the agent's current directory and compares it
    /// with the baseline when one exists.
    ///
    /// # Errors
    ///
    /// Returns an error when the agent has no context or the image cannot
    /// be written or compared.
    pub async fn save_screenshot(
        &self,
        agent_id: AgentId,
        name: &str,
        png: Vec<u8>,
    ) -> Result<Value, ArchiveError> {
        let handle = self
            .contexts()
            .get(&agent_id)
            .cloned()
            .ok_or(ArchiveError::ContextClosed { agent_id })?;
        handle.screenshot(name, png).await
    }

    /// Drains every context, writes all descriptors, zips the archive and
    /// uploads it when a server is configured. Returns the zip path.
    ///
    /// # Errors
    ///
    /// Returns the first context failure or any write, zip or upload error.
    pub async fn flush(&self) -> Result<PathBuf, ArchiveError> {
        info!("Flushing archive result queues");
        let handles: Vec<ContextHandle> = self.contexts().drain().map(|(_, handle)| handle).collect();
        let results =
            futures_util::future::join_all(handles.iter().map(ContextHandle::flush)).await;
        for result in results {
            result?;
        }

        let entries = {
            let mut store = self.shared.store();
            let max_id = store.max_id();
            store.root_mut().max_id = Some(max_id);
            store.take_all()
        };
        info!("Writing {} archive descriptors", entries.len());
        for (dir, descriptor) in &entries {
            store::write_descriptor(dir, descriptor).await?;
        }

        let layout = &self.shared.layout;
        let zip_path = layout.workdir.join(format!("{}.zip", self.id));
        let basedir = layout.basedir.clone();
        let target = zip_path.clone();
        let bytes = tokio::task::spawn_blocking(move || zip_dir(&basedir, &target)).await??;
        info!("Report archived to {} ({} bytes)", zip_path.display(), bytes);

        if let Some(server) = &self.shared.server {
            info!("Uploading results to {}", server.base());
            server.upload(&zip_path, &self.shared.archive_path).await?;
        }
        info!("Archive done");
        Ok(zip_path)
    }

    /// Removes the unzipped archive tree.
    ///
    /// # Errors
    ///
    /// Returns an error when the directory cannot be removed.
    pub async fn remove_directory(&self) -> Result<(), ArchiveError> {
        let basedir = &self.shared.layout.basedir;
        tokio::fs::remove_dir_all(basedir)
            .await
            .map_err(|source| ArchiveError::Io {
                context: "removing archive",
                path: basedir.clone(),
                source,
            })
    }
}

fn scenario_dirname(layout: &ArchiveLayout) -> String {
    layout
        .scenariodir
        .file_name()
        .map_or_else(|| "_".to_owned(), |name| name.to_string_lossy().into_owned())
}

impl Reporter for ArchiveReporter {
    fn supports(&self, kind: MessageKind) -> bool {
        matches!(
            kind,
            MessageKind::TestRunStarted
                | MessageKind::TestSuiteEnter
                | MessageKind::TestSuiteLeave
                | MessageKind::TestSuiteStarted
                | MessageKind::TestSuiteFinished
                | MessageKind::TestAdded
                | MessageKind::TestStarted
                | MessageKind::TestFinished
                | MessageKind::CodeCoverage
                | MessageKind::CodeCoverageStructure
        )
    }

    fn dispatch(&self, message: &ReportMessage) {
        let Some(agent) = &message.agent else {
            return;
        };
        if let ReportEvent::Inbound(body) = &message.event {
            self.route(agent, body);
        }
    }
}
