use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::{OnceCell, mpsc, oneshot};
use tracing::{debug, error, warn};

use super::ArchiveLayout;
use super::descriptor::{ChildEntry, CoverageEntry, EntryKind};
use super::naming::{sanitize, slash_path, unique_dir_name};
use super::screenshot::{ImageComparator, ScreenshotOutcome};
use super::server::ArchiveServer;
use super::store::DescriptorStore;
use crate::agent::AgentId;
use crate::error::ArchiveError;
use crate::protocol::HashId;

const INIT_COVERAGE: &str = "__init__";
const INIT_COVERAGE_TITLE: &str = "Page Initialization";

/// State shared by every context of one archive.
pub(super) struct Shared {
    pub layout: ArchiveLayout,
    pub archive_path: String,
    pub store: Mutex<DescriptorStore>,
    pub comparator: Arc<dyn ImageComparator>,
    pub server: Option<ArchiveServer>,
    baseline: OnceCell<bool>,
}

impl Shared {
    pub fn new(
        layout: ArchiveLayout,
        archive_path: String,
        comparator: Arc<dyn ImageComparator>,
        server: Option<ArchiveServer>,
    ) -> Self {
        let store = DescriptorStore::new(layout.basedir.clone());
        Self {
            layout,
            archive_path,
            store: Mutex::new(store),
            comparator,
            server,
            baseline: OnceCell::new(),
        }
    }

    pub fn store(&self) -> MutexGuard<'_, DescriptorStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fetches the baseline once per archive when a server is configured.
    async fn ensure_baseline(&self) -> Result<(), ArchiveError> {
        let Some(server) = &self.server else {
            return Ok(());
        };
        self.baseline
            .get_or_try_init(|| async {
                server
                    .download_baseline(&self.archive_path, &self.layout.baselinedir)
                    .await
            })
            .await
            .map(|_downloaded| ())
    }
}

/// A tree entry to descend into.
#[derive(Debug, Clone)]
pub(super) struct DownEntry {
    pub name: String,
    pub kind: EntryKind,
    pub id: Option<HashId>,
}

impl DownEntry {
    pub fn dir(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            kind: EntryKind::Dir,
            id: None,
        }
    }
}

/// Tree mutations applied in order by a context.
#[derive(Debug)]
pub(super) enum Step {
    Reset,
    Down(DownEntry),
    Up,
    Suite(HashId),
    AddTest {
        id: HashId,
        name: String,
        disabled: bool,
    },
    StartTest {
        id: HashId,
    },
    EndTest {
        id: HashId,
        passed: bool,
        expectations: Vec<Value>,
    },
    Coverage {
        name: Option<String>,
        results: Value,
    },
    CoverageStructure {
        results: Value,
    },
}

pub(super) enum ContextOp {
    Step(Step),
    Screenshot {
        name: String,
        png: Vec<u8>,
        reply: oneshot::Sender<Result<Value, ArchiveError>>,
    },
    Flush(oneshot::Sender<Result<(), ArchiveError>>),
}

#[derive(Debug, Clone)]
struct TestSlot {
    dir: PathBuf,
    name: String,
}

/// Sender side of a running context.
#[derive(Debug, Clone)]
pub(super) struct ContextHandle {
    agent_id: AgentId,
    ops: mpsc::UnboundedSender<ContextOp>,
}

impl ContextHandle {
    pub fn step(&self, step: Step) {
        if self.ops.send(ContextOp::Step(step)).is_err() {
            warn!("Archive context for agent {} is gone", self.agent_id);
        }
    }

    pub async fn screenshot(&self, name: &str, png: Vec<u8>) -> Result<Value, ArchiveError> {
        let (reply, response) = oneshot::channel();
        let op = ContextOp::Screenshot {
            name: name.to_owned(),
            png,
            reply,
        };
        self.ops
            .send(op)
            .map_err(|_err| ArchiveError::ContextClosed {
                agent_id: self.agent_id,
            })?;
        response.await.map_err(|_err| ArchiveError::ContextClosed {
            agent_id: self.agent_id,
        })?
    }

    /// Resolves once every operation queued before it has been applied.
    pub async fn flush(&self) -> Result<(), ArchiveError> {
        let (reply, response) = oneshot::channel();
        self.ops
            .send(ContextOp::Flush(reply))
            .map_err(|_err| ArchiveError::ContextClosed {
                agent_id: self.agent_id,
            })?;
        response.await.map_err(|_err| ArchiveError::ContextClosed {
            agent_id: self.agent_id,
        })?
    }
}

/// Cursor into the archive tree for one agent's message stream.
pub(super) struct Context {
    agent_id: AgentId,
    browser_id: String,
    shared: Arc<Shared>,
    dir: PathBuf,
    suites: HashMap<HashId, PathBuf>,
    tests: HashMap<HashId, TestSlot>,
    current_test: Option<TestSlot>,
    poisoned: Option<String>,
}

impl Context {
    pub fn spawn(agent_id: AgentId, browser_id: String, shared: Arc<Shared>) -> ContextHandle {
        let (ops, receiver) = mpsc::unbounded_channel();
        let context = Self {
            agent_id,
            browser_id,
            dir: shared.layout.basedir.clone(),
            shared,
            suites: HashMap::new(),
            tests: HashMap::new(),
            current_test: None,
            poisoned: None,
        };
        tokio::spawn(context.run(receiver));
        ContextHandle { agent_id, ops }
    }

    async fn run(mut self, mut receiver: mpsc::UnboundedReceiver<ContextOp>) {
        while let Some(op) = receiver.recv().await {
            match op {
                ContextOp::Step(step) => {
                    if self.poisoned.is_some() {
                        continue;
                    }
                    if let Err(err) = self.apply(step).await {
                        error!("Archive context for agent {} failed: {}", self.agent_id, err);
                        self.poisoned = Some(err.to_string());
                    }
                }
                ContextOp::Screenshot { name, png, reply } => {
                    let result = match self.failure() {
                        Some(err) => Err(err),
                        None => self.save_screenshot(&name, png).await,
                    };
                    if let Err(err) = &result {
                        error!(
                            "Failed to process screenshot '{}' from {}: {}",
                            name, self.browser_id, err
                        );
                    }
                    if reply.send(result).is_err() {
                        debug!("Screenshot requester for agent {} went away", self.agent_id);
                    }
                }
                ContextOp::Flush(reply) => {
                    let result = self.failure().map_or(Ok(()), Err);
                    if reply.send(result).is_err() {
                        debug!("Flush requester for agent {} went away", self.agent_id);
                    }
                }
            }
        }
    }

    fn failure(&self) -> Option<ArchiveError> {
        self.poisoned
            .as_ref()
            .map(|message| ArchiveError::ContextFailed {
                agent_id: self.agent_id,
                message: message.clone(),
            })
    }

    async fn apply(&mut self, step: Step) -> Result<(), ArchiveError> {
        match step {
            Step::Reset => {
                self.dir = self.shared.layout.basedir.clone();
                self.current_test = None;
                Ok(())
            }
            Step::Down(entry) => self.down(entry).await,
            Step::Up => {
                self.up();
                Ok(())
            }
            Step::Suite(id) => {
                match self.suites.get(&id) {
                    Some(dir) => self.dir = dir.clone(),
                    None => warn!("Unknown suite id '{}' from {}", id, self.browser_id),
                }
                Ok(())
            }
            Step::AddTest { id, name, disabled } => {
                self.add_test(id, name, disabled);
                Ok(())
            }
            Step::StartTest { id } => {
                self.start_test(&id);
                Ok(())
            }
            Step::EndTest {
                id,
                passed,
                expectations,
            } => {
                self.end_test(&id, passed, expectations);
                Ok(())
            }
            Step::Coverage { name, results } => {
                if name.as_deref() == Some(INIT_COVERAGE) {
                    self.save_init_coverage(&results).await
                } else {
                    self.save_coverage(&results, false).await
                }
            }
            Step::CoverageStructure { results } => self.save_coverage(&results, true).await,
        }
    }

    fn up(&mut self) {
        let basedir = &self.shared.layout.basedir;
        if self.dir == *basedir {
            return;
        }
        if let Some(parent) = self.dir.parent()
            && parent.starts_with(basedir)
        {
            self.dir = parent.to_path_buf();
        }
    }

    async fn down(&mut self, entry: DownEntry) -> Result<(), ArchiveError> {
        let path = {
            let mut store = self.shared.store();
            let parent = store.descriptor_mut(&self.dir);
            let existing = parent
                .child_named(&entry.name)
                .and_then(|child| child.dir.clone());
            let dirname = match existing {
                Some(dirname) => dirname,
                None => {
                    let dirname = unique_dir_name(&entry.name, &parent.children);
                    match parent.child_named_mut(&entry.name) {
                        Some(child) => child.dir = Some(dirname.clone()),
                        None => parent.children.push(ChildEntry::container(
                            &entry.name,
                            entry.kind,
                            dirname.clone(),
                        )),
                    }
                    dirname
                }
            };
            let path = self.dir.join(&dirname);
            let child = store.descriptor_mut(&path);
            if child.name.is_none() {
                child.name = Some(entry.name.clone());
                child.kind = Some(entry.kind);
            }
            let child_id = child.id;
            if let Some(stub) = store.descriptor_mut(&self.dir).child_named_mut(&entry.name) {
                stub.id = child_id;
            }
            path
        };

        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|source| ArchiveError::Io {
                context: "creating directory",
                path: path.clone(),
                source,
            })?;
        if let Some(id) = entry.id {
            self.suites.entry(id).or_insert_with(|| path.clone());
        }
        self.dir = path;
        Ok(())
    }

    fn add_test(&mut self, id: HashId, name: String, disabled: bool) {
        {
            let mut store = self.shared.store();
            let exists = store.descriptor_mut(&self.dir).child_named(&name).is_some();
            if !exists {
                let test_id = store.next_id();
                store
                    .descriptor_mut(&self.dir)
                    .children
                    .push(ChildEntry::test(test_id, &name, disabled));
            }
        }
        self.tests.insert(
            id,
            TestSlot {
                dir: self.dir.clone(),
                name,
            },
        );
    }

    fn start_test(&mut self, id: &HashId) {
        let Some(slot) = self.tests.get(id).cloned() else {
            warn!("Unknown test id '{}' from {}", id, self.browser_id);
            return;
        };
        {
            let mut store = self.shared.store();
            let descriptor = store.descriptor_mut(&slot.dir);
            descriptor.failures.entry(self.browser_id.clone()).or_insert(0);
            if let Some(test) = descriptor.child_named_mut(&slot.name) {
                test.record_outcome(&self.browser_id, true);
            }
            bubble_up(&mut store, &slot.dir, &self.browser_id, 0);
        }
        self.current_test = Some(slot);
    }

    fn end_test(&mut self, id: &HashId, passed: bool, expectations: Vec<Value>) {
        let slot = self.tests.remove(id).or_else(|| self.current_test.clone());
        self.current_test = None;
        let Some(slot) = slot else {
            warn!("Test id '{}' finished without being added", id);
            return;
        };
        let mut store = self.shared.store();
        let descriptor = store.descriptor_mut(&slot.dir);
        if let Some(test) = descriptor.child_named_mut(&slot.name) {
            test.record_outcome(&self.browser_id, passed);
            test.add_expectations(&self.browser_id, expectations);
        }
        let failures = u64::from(!passed);
        descriptor.add_failures(&self.browser_id, failures);
        if !passed {
            bubble_up(&mut store, &slot.dir, &self.browser_id, failures);
        }
    }

    fn coverage_file(&self, structure: bool) -> String {
        if structure {
            format!("coverage-{}-structure.json", self.browser_id)
        } else {
            format!("coverage-{}.json", self.browser_id)
        }
    }

    async fn save_coverage(&self, results: &Value, structure: bool) -> Result<(), ArchiveError> {
        let file_name = self.coverage_file(structure);
        {
            let mut store = self.shared.store();
            let coverages = store
                .descriptor_mut(&self.dir)
                .coverages
                .get_or_insert_with(Vec::new);
            if !coverages.iter().any(|coverage| coverage.path == file_name) {
                let entry = CoverageEntry {
                    browser_id: self.browser_id.clone(),
                    path: file_name.clone(),
                    structure,
                };
                if structure {
                    coverages.insert(0, entry);
                } else {
                    coverages.push(entry);
                }
            }
        }
        write_coverage(&self.dir.join(file_name), results).await
    }

    /// Coverage collected while the page loads belongs to the scenario, not
    /// to whatever suite the cursor is in.
    async fn save_init_coverage(&self, results: &Value) -> Result<(), ArchiveError> {
        let file_name = self.coverage_file(false);
        let scenariodir = self.shared.layout.scenariodir.clone();
        let dirname = sanitize(INIT_COVERAGE_TITLE);
        let init_dir = scenariodir.join(&dirname);
        {
            let mut store = self.shared.store();
            let init = store.descriptor_mut(&init_dir);
            init.name = Some(INIT_COVERAGE_TITLE.to_owned());
            init.kind = Some(EntryKind::File);
            let coverages = init.coverages.get_or_insert_with(Vec::new);
            if !coverages.iter().any(|coverage| coverage.path == file_name) {
                coverages.push(CoverageEntry {
                    browser_id: self.browser_id.clone(),
                    path: file_name.clone(),
                    structure: false,
                });
            }
            let init_id = init.id;
            let scenario = store.descriptor_mut(&scenariodir);
            if scenario.child_named(INIT_COVERAGE_TITLE).is_none() {
                scenario.children.push(ChildEntry::container(
                    INIT_COVERAGE_TITLE,
                    EntryKind::File,
                    dirname,
                ));
            }
            if let Some(stub) = scenario.child_named_mut(INIT_COVERAGE_TITLE) {
                stub.id = init_id;
            }
        }
        tokio::fs::create_dir_all(&init_dir)
            .await
            .map_err(|source| ArchiveError::Io {
                context: "creating directory",
                path: init_dir.clone(),
                source,
            })?;
        write_coverage(&init_dir.join(file_name), results).await
    }

    async fn save_screenshot(&self, name: &str, png: Vec<u8>) -> Result<Value, ArchiveError> {
        self.shared.ensure_baseline().await?;
        let layout = &self.shared.layout;
        let stem = format!("{}-{}", self.browser_id, sanitize(name));
        let absolute = self.dir.join(format!("{stem}.png"));
        let relative = relative_to(&layout.basedir, &absolute)?;
        tokio::fs::write(&absolute, &png)
            .await
            .map_err(|source| ArchiveError::Io {
                context: "writing screenshot",
                path: absolute.clone(),
                source,
            })?;

        let expected = layout.baselinedir.join(&relative);
        let has_baseline = tokio::fs::try_exists(&expected).await.unwrap_or(false);
        if !has_baseline {
            return outcome_value(&ScreenshotOutcome {
                passed: true,
                diff_count: None,
                path: slash_path(&relative),
                baseline: None,
                diff: None,
            });
        }

        let comparator = Arc::clone(&self.shared.comparator);
        let diff_path = self.dir.join(format!("{stem}-diff.png"));
        let compare_expected = expected.clone();
        let compare_actual = absolute.clone();
        let compare_diff = diff_path.clone();
        let diff_count = tokio::task::spawn_blocking(move || {
            let diff = comparator.compare(&compare_expected, &compare_actual)?;
            if diff.diff_count > 0 {
                diff.save(&compare_diff)?;
            }
            Ok::<u64, ArchiveError>(diff.diff_count)
        })
        .await??;

        let mut outcome = ScreenshotOutcome {
            passed: diff_count == 0,
            diff_count: Some(diff_count),
            path: slash_path(&relative),
            baseline: None,
            diff: None,
        };
        if diff_count > 0 {
            let baseline_path = self.dir.join(format!("{stem}-baseline.png"));
            tokio::fs::copy(&expected, &baseline_path)
                .await
                .map_err(|source| ArchiveError::Io {
                    context: "copying baseline",
                    path: expected.clone(),
                    source,
                })?;
            outcome.baseline = Some(slash_path(&relative_to(&layout.basedir, &baseline_path)?));
            outcome.diff = Some(slash_path(&relative_to(&layout.basedir, &diff_path)?));
        }
        outcome_value(&outcome)
    }
}

/// Adds `count` failures for `browser` to every ancestor of `from` up to the
/// archive root. The root loses its id once reached so consumers can
/// assign their own.
fn bubble_up(store: &mut DescriptorStore, from: &Path, browser: &str, count: u64) {
    let basedir = store.basedir().to_path_buf();
    let mut dir = from.to_path_buf();
    while dir != basedir {
        let Some(name) = dir.file_name().map(|name| name.to_string_lossy().into_owned()) else {
            break;
        };
        let Some(parent) = dir.parent().map(Path::to_path_buf) else {
            break;
        };
        if !parent.starts_with(&basedir) {
            break;
        }
        let descriptor = store.descriptor_mut(&parent);
        if let Some(entry) = descriptor.child_in_dir_mut(&name) {
            entry.add_failures(browser, count);
        }
        descriptor.add_failures(browser, count);
        dir = parent;
    }
    if dir == basedir {
        store.root_mut().id = None;
    }
}

fn relative_to(base: &Path, path: &Path) -> Result<PathBuf, ArchiveError> {
    path.strip_prefix(base)
        .map(Path::to_path_buf)
        .map_err(|_err| ArchiveError::OutsideBase {
            path: path.to_path_buf(),
        })
}

fn outcome_value(outcome: &ScreenshotOutcome) -> Result<Value, ArchiveError> {
    serde_json::to_value(outcome).map_err(|source| ArchiveError::Serialize {
        path: PathBuf::from(&outcome.path),
        source,
    })
}

async fn write_coverage(path: &Path, results: &Value) -> Result<(), ArchiveError> {
    let bytes = match results.as_str() {
        Some(text) => text.as_bytes().to_vec(),
        None => serde_json::to_vec(results).map_err(|source| ArchiveError::Serialize {
            path: path.to_path_buf(),
            source,
        })?,
    };
    tokio::fs::write(path, bytes)
        .await
        .map_err(|source| ArchiveError::Io {
            context: "writing coverage",
            path: path.to_path_buf(),
            source,
        })
}
