use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What a node of the archive tree stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Dir,
    File,
    Suite,
    Test,
}

/// Contents of one `data.json`.
///
/// Failure counts are stored as top-level keys named after browser ids,
/// which is why they are flattened into the object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<EntryKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
    #[serde(default)]
    pub children: Vec<ChildEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverages: Option<Vec<CoverageEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenarios: Option<Vec<ScenarioEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browsers: Option<Vec<BrowserEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_id: Option<u64>,
    #[serde(flatten)]
    pub failures: BTreeMap<String, u64>,
}

impl Descriptor {
    #[must_use]
    pub fn with_id(id: u64) -> Self {
        Self {
            id: Some(id),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn child_named(&self, name: &str) -> Option<&ChildEntry> {
        self.children.iter().find(|child| child.name == name)
    }

    pub fn child_named_mut(&mut self, name: &str) -> Option<&mut ChildEntry> {
        self.children.iter_mut().find(|child| child.name == name)
    }

    pub fn child_in_dir_mut(&mut self, dir: &str) -> Option<&mut ChildEntry> {
        self.children
            .iter_mut()
            .find(|child| child.dir.as_deref() == Some(dir))
    }

    pub fn add_failures(&mut self, browser: &str, count: u64) {
        let total = self.failures.entry(browser.to_owned()).or_insert(0);
        *total = total.saturating_add(count);
    }
}

/// Per-browser value on a child entry: a pass flag on tests, a failure
/// count on containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BrowserResult {
    Passed(bool),
    Failures(u64),
}

/// Stub of a child node kept in its parent's `children` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<TestDetails>,
    #[serde(flatten)]
    pub results: BTreeMap<String, BrowserResult>,
}

impl ChildEntry {
    #[must_use]
    pub fn container(name: &str, kind: EntryKind, dir: String) -> Self {
        Self {
            name: name.to_owned(),
            kind,
            dir: Some(dir),
            id: None,
            disabled: None,
            details: Vec::new(),
            results: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn test(id: u64, name: &str, disabled: bool) -> Self {
        Self {
            name: name.to_owned(),
            kind: EntryKind::Test,
            dir: None,
            id: Some(id),
            disabled: Some(disabled),
            details: Vec::new(),
            results: BTreeMap::new(),
        }
    }

    pub fn add_failures(&mut self, browser: &str, count: u64) {
        let current = match self.results.get(browser) {
            Some(BrowserResult::Failures(existing)) => *existing,
            Some(BrowserResult::Passed(_)) | None => 0,
        };
        self.results.insert(
            browser.to_owned(),
            BrowserResult::Failures(current.saturating_add(count)),
        );
    }

    /// Records a test outcome; once failed for a browser it stays failed.
    pub fn record_outcome(&mut self, browser: &str, passed: bool) {
        let outcome = match self.results.get(browser) {
            Some(BrowserResult::Passed(previous)) => passed && *previous,
            Some(BrowserResult::Failures(_)) | None => passed,
        };
        self.results
            .insert(browser.to_owned(), BrowserResult::Passed(outcome));
    }

    pub fn add_expectations(&mut self, browser: &str, expectations: Vec<Value>) {
        match self
            .details
            .iter_mut()
            .find(|details| details.browser == browser)
        {
            Some(details) => details.expectations.extend(expectations),
            None => self.details.push(TestDetails {
                browser: browser.to_owned(),
                expectations,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestDetails {
    pub browser: String,
    #[serde(default)]
    pub expectations: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoverageEntry {
    pub browser_id: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub structure: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioEntry {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserEntry {
    pub id: String,
    pub name: String,
    pub user_agent: String,
}
