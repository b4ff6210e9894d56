use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use image::RgbaImage;
use serde_json::{Value, json};

use super::*;
use crate::agent::AgentKind;
use crate::browser::UserAgent;
use crate::protocol::{
    CoverageReport, HashId, RunMarker, SuiteEnter, SuiteRef, TestAdded, TestFinished, TestStarted,
};

const CHROME: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) \
                      Chrome/51.0.2704.63 Safari/537.36";
const FIREFOX: &str = "Mozilla/5.0 (X11; Linux x86_64; rv:47.0) Gecko/20100101 Firefox/47.0";

fn agent(id: AgentId, group: u64, user_agent: &str) -> AgentInfo {
    AgentInfo {
        id,
        group_id: Some(group),
        kind: AgentKind::Local,
        user_agent: Some(UserAgent::parse(user_agent)),
        browser: None,
        address: None,
    }
}

fn settings(workdir: &Path) -> ArchiveSettings {
    ArchiveSettings {
        id: Some("run".to_owned()),
        workdir: workdir.to_path_buf(),
        archive_path: "/product".to_owned(),
        scenario: "Smoke Tests".to_owned(),
        ..ArchiveSettings::default()
    }
}

fn send(reporter: &ArchiveReporter, agent: &AgentInfo, body: InboundBody) {
    let message = ReportMessage::new(Some(agent.clone()), ReportEvent::Inbound(body));
    if reporter.supports(message.kind()) {
        reporter.dispatch(&message);
    }
}

fn enter(reporter: &ArchiveReporter, agent: &AgentInfo, id: &str, name: &str, file: Option<&str>) {
    send(
        reporter,
        agent,
        InboundBody::TestSuiteEnter(SuiteEnter {
            id: HashId::new(id),
            name: name.to_owned(),
            file_name: file.map(str::to_owned),
        }),
    );
}

fn run_test(reporter: &ArchiveReporter, agent: &AgentInfo, id: &str, name: &str, passed: bool) {
    send(
        reporter,
        agent,
        InboundBody::TestAdded(TestAdded {
            id: HashId::new(id),
            name: name.to_owned(),
            disabled: false,
        }),
    );
    send(
        reporter,
        agent,
        InboundBody::TestStarted(TestStarted {
            id: HashId::new(id),
            name: None,
        }),
    );
    send(
        reporter,
        agent,
        InboundBody::TestFinished(TestFinished {
            id: HashId::new(id),
            passed,
            expectations: vec![json!({"passed": passed})],
        }),
    );
}

fn leave(reporter: &ArchiveReporter, agent: &AgentInfo) {
    send(
        reporter,
        agent,
        InboundBody::TestSuiteLeave(SuiteRef { id: None }),
    );
}

fn read(path: &Path) -> Result<Descriptor, String> {
    let text = std::fs::read_to_string(path.join(DESCRIPTOR_FILE))
        .map_err(|err| format!("{}: {err}", path.display()))?;
    serde_json::from_str(&text).map_err(|err| err.to_string())
}

#[tokio::test(flavor = "current_thread")]
async fn failures_bubble_to_every_ancestor() -> Result<(), String> {
    let workdir = tempfile::tempdir().map_err(|err| err.to_string())?;
    let reporter = ArchiveReporter::new(&settings(workdir.path())).map_err(|err| err.to_string())?;
    let chrome = agent(1, 1, CHROME);

    send(&reporter, &chrome, InboundBody::TestRunStarted(RunMarker::default()));
    enter(&reporter, &chrome, "s1", "Login", Some("specs/login.js"));
    run_test(&reporter, &chrome, "t1", "accepts valid users", true);
    run_test(&reporter, &chrome, "t2", "rejects bad passwords", false);
    leave(&reporter, &chrome);

    let zip = reporter.flush().await.map_err(|err| err.to_string())?;
    if zip != workdir.path().join("run.zip") || !zip.exists() {
        return Err(format!("Unexpected archive {}", zip.display()));
    }

    let basedir = workdir.path().join("run");
    let root = read(&basedir)?;
    if root.id.is_some() {
        return Err("Root id must be removed once failures reach it".to_owned());
    }
    if root.failures.get("chrome51") != Some(&1) {
        return Err(format!("Unexpected root failures {:?}", root.failures));
    }
    let scenarios = root.scenarios.clone().unwrap_or_default();
    if scenarios != [ScenarioEntry { path: "product/Smoke-Tests".to_owned() }] {
        return Err(format!("Unexpected scenarios {scenarios:?}"));
    }
    let browsers = root.browsers.clone().unwrap_or_default();
    if browsers.len() != 1 || browsers.first().map(|b| b.user_agent.as_str()) != Some(CHROME) {
        return Err(format!("Unexpected browsers {browsers:?}"));
    }

    let suite_dir = basedir.join("product/Smoke-Tests/specs/login.js/Login");
    let suite = read(&suite_dir)?;
    if suite.kind != Some(EntryKind::Suite) || suite.children.len() != 2 {
        return Err(format!("Unexpected suite {suite:?}"));
    }
    if suite.failures.get("chrome51") != Some(&1) {
        return Err(format!("Unexpected suite failures {:?}", suite.failures));
    }
    let failed = suite
        .child_named("rejects bad passwords")
        .ok_or("missing failed test")?;
    if failed.results.get("chrome51") != Some(&BrowserResult::Passed(false)) {
        return Err(format!("Unexpected test results {:?}", failed.results));
    }
    if failed.details.first().map(|details| details.expectations.len()) != Some(1) {
        return Err("Expectations must be recorded per browser".to_owned());
    }

    let file = read(&basedir.join("product/Smoke-Tests/specs/login.js"))?;
    let stub = file.child_named("Login").ok_or("missing suite stub")?;
    if stub.results.get("chrome51") != Some(&BrowserResult::Failures(1)) {
        return Err(format!("Unexpected stub results {:?}", stub.results));
    }
    if stub.id != suite.id {
        return Err("Child stubs must carry the child's id".to_owned());
    }

    let all_ids = [root.max_id, suite.id, file.id];
    if all_ids.iter().flatten().any(|id| Some(*id) > root.max_id) {
        return Err(format!("maxId must dominate every id: {all_ids:?}"));
    }
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn colliding_names_get_distinct_directories() -> Result<(), String> {
    let workdir = tempfile::tempdir().map_err(|err| err.to_string())?;
    let reporter = ArchiveReporter::new(&settings(workdir.path())).map_err(|err| err.to_string())?;
    let chrome = agent(1, 1, CHROME);
    let firefox = agent(2, 2, FIREFOX);

    for browser in [&chrome, &firefox] {
        send(&reporter, browser, InboundBody::TestRunStarted(RunMarker::default()));
        enter(&reporter, browser, "a", "Login", Some("login.js"));
        run_test(&reporter, browser, "t", "works", true);
        leave(&reporter, browser);
        enter(&reporter, browser, "b", "Login?", Some("login.js"));
        leave(&reporter, browser);
    }
    reporter.flush().await.map_err(|err| err.to_string())?;

    let file = read(&workdir.path().join("run/product/Smoke-Tests/login.js"))?;
    let dirs: Vec<Option<String>> = file.children.iter().map(|child| child.dir.clone()).collect();
    if dirs != [Some("Login".to_owned()), Some("Login~1".to_owned())] {
        return Err(format!("Unexpected dirs {dirs:?}"));
    }
    let suite = read(&workdir.path().join("run/product/Smoke-Tests/login.js/Login"))?;
    let test = suite.child_named("works").ok_or("missing test")?;
    let browsers: Vec<&String> = test.results.keys().collect();
    if browsers != ["chrome51", "firefox47"] || suite.children.len() != 1 {
        return Err(format!("Both browsers must share one test entry: {suite:?}"));
    }
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn init_coverage_belongs_to_the_scenario() -> Result<(), String> {
    let workdir = tempfile::tempdir().map_err(|err| err.to_string())?;
    let reporter = ArchiveReporter::new(&settings(workdir.path())).map_err(|err| err.to_string())?;
    let chrome = agent(1, 1, CHROME);

    send(&reporter, &chrome, InboundBody::TestRunStarted(RunMarker::default()));
    send(
        &reporter,
        &chrome,
        InboundBody::CodeCoverage(CoverageReport {
            name: Some("__init__".to_owned()),
            results: json!({"lines": 10}),
        }),
    );
    enter(&reporter, &chrome, "s", "Cart", Some("cart.js"));
    send(
        &reporter,
        &chrome,
        InboundBody::CodeCoverage(CoverageReport {
            name: None,
            results: json!({"lines": 3}),
        }),
    );
    send(
        &reporter,
        &chrome,
        InboundBody::CodeCoverageStructure(CoverageReport {
            name: None,
            results: json!({"files": []}),
        }),
    );
    reporter.flush().await.map_err(|err| err.to_string())?;

    let scenario = workdir.path().join("run/product/Smoke-Tests");
    let init = scenario.join("Page-Initialization");
    let written = std::fs::read_to_string(init.join("coverage-chrome51.json"))
        .map_err(|err| err.to_string())?;
    let value: Value = serde_json::from_str(&written).map_err(|err| err.to_string())?;
    if value != json!({"lines": 10}) {
        return Err(format!("Unexpected coverage {value}"));
    }
    let scenario_descriptor = read(&scenario)?;
    if scenario_descriptor.child_named("Page Initialization").map(|child| child.kind)
        != Some(EntryKind::File)
    {
        return Err("Init coverage must be listed under the scenario".to_owned());
    }

    let suite = read(&scenario.join("cart.js/Cart"))?;
    let coverages = suite.coverages.unwrap_or_default();
    let paths: Vec<(&str, bool)> = coverages
        .iter()
        .map(|coverage| (coverage.path.as_str(), coverage.structure))
        .collect();
    if paths
        != [
            ("coverage-chrome51-structure.json", true),
            ("coverage-chrome51.json", false),
        ]
    {
        return Err(format!("Unexpected coverages {paths:?}"));
    }
    Ok(())
}

struct FixedDiff {
    diff_count: u64,
    calls: Arc<Mutex<Vec<(PathBuf, PathBuf)>>>,
}

impl ImageComparator for FixedDiff {
    fn compare(&self, expected: &Path, actual: &Path) -> Result<ImageDiff, ArchiveError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((expected.to_path_buf(), actual.to_path_buf()));
        Ok(ImageDiff::new(self.diff_count, RgbaImage::new(1, 1)))
    }
}

#[tokio::test(flavor = "current_thread")]
async fn screenshots_are_compared_with_mirrored_baselines() -> Result<(), String> {
    let workdir = tempfile::tempdir().map_err(|err| err.to_string())?;
    let calls = Arc::new(Mutex::new(Vec::new()));
    let comparator = Arc::new(FixedDiff {
        diff_count: 5,
        calls: Arc::clone(&calls),
    });
    let reporter = ArchiveReporter::with_comparator(&settings(workdir.path()), comparator)
        .map_err(|err| err.to_string())?;
    let chrome = agent(1, 1, CHROME);
    send(&reporter, &chrome, InboundBody::TestRunStarted(RunMarker::default()));
    enter(&reporter, &chrome, "s", "Home", Some("home.js"));

    let first = reporter
        .save_screenshot(1, "landing", vec![1, 2, 3])
        .await
        .map_err(|err| err.to_string())?;
    let path = first
        .get("path")
        .and_then(Value::as_str)
        .ok_or("missing path")?
        .to_owned();
    if path != "product/Smoke-Tests/home.js/Home/chrome51-landing.png"
        || first.get("passed") != Some(&Value::Bool(true))
        || first.get("diffCount").is_some()
    {
        return Err(format!("Unexpected first result {first}"));
    }

    let baseline = reporter.layout().baselinedir.join(&path);
    if let Some(parent) = baseline.parent() {
        std::fs::create_dir_all(parent).map_err(|err| err.to_string())?;
    }
    std::fs::write(&baseline, [9, 9]).map_err(|err| err.to_string())?;

    let second = reporter
        .save_screenshot(1, "landing", vec![4, 5, 6])
        .await
        .map_err(|err| err.to_string())?;
    if second.get("passed") != Some(&Value::Bool(false))
        || second.get("diffCount") != Some(&json!(5))
        || second.get("baseline")
            != Some(&json!("product/Smoke-Tests/home.js/Home/chrome51-landing-baseline.png"))
    {
        return Err(format!("Unexpected second result {second}"));
    }
    let suite_dir = workdir.path().join("run/product/Smoke-Tests/home.js/Home");
    if !suite_dir.join("chrome51-landing-diff.png").exists()
        || !suite_dir.join("chrome51-landing-baseline.png").exists()
    {
        return Err("Diff and baseline copies must be written".to_owned());
    }
    let recorded = calls.lock().unwrap_or_else(PoisonError::into_inner).len();
    if recorded != 1 {
        return Err(format!("Comparator should run once, ran {recorded} times"));
    }
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn screenshots_need_a_context() -> Result<(), String> {
    let workdir = tempfile::tempdir().map_err(|err| err.to_string())?;
    let reporter = ArchiveReporter::new(&settings(workdir.path())).map_err(|err| err.to_string())?;
    let result = reporter.save_screenshot(7, "home", Vec::new()).await;
    if matches!(result, Err(ArchiveError::ContextClosed { agent_id: 7 })) {
        Ok(())
    } else {
        Err(format!("Unexpected result {result:?}"))
    }
}

#[tokio::test(flavor = "current_thread")]
async fn unknown_test_ids_are_skipped() -> Result<(), String> {
    let workdir = tempfile::tempdir().map_err(|err| err.to_string())?;
    let reporter = ArchiveReporter::new(&settings(workdir.path())).map_err(|err| err.to_string())?;
    let chrome = agent(1, 1, CHROME);
    send(&reporter, &chrome, InboundBody::TestRunStarted(RunMarker::default()));
    enter(&reporter, &chrome, "s", "Orphans", Some("orphans.js"));
    send(
        &reporter,
        &chrome,
        InboundBody::TestFinished(TestFinished {
            id: HashId::new("never-added"),
            passed: false,
            expectations: Vec::new(),
        }),
    );
    run_test(&reporter, &chrome, "t", "still recorded", true);
    reporter.flush().await.map_err(|err| err.to_string())?;

    let suite = read(&workdir.path().join("run/product/Smoke-Tests/orphans.js/Orphans"))?;
    if suite.child_named("still recorded").is_none() {
        return Err("Later messages must still be applied".to_owned());
    }
    Ok(())
}
