use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::descriptor::{BrowserEntry, BrowserResult, ChildEntry, CoverageEntry, Descriptor};
use super::naming::free_dir_name;
use super::store::{DESCRIPTOR_FILE, render_descriptor};
use crate::error::MergeError;

/// Outcome of a merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeReport {
    pub max_id: u64,
    pub directories: usize,
    /// Source browser ids that had to be renamed, old to new.
    pub renamed_browsers: BTreeMap<String, String>,
}

/// Folds one archive tree (`source`) into another (`dest`).
///
/// Children are matched by name, new children get fresh ids above both
/// archives' `maxId`, and browser ids of the source that clash with a
/// different destination browser are renamed `<id>-1`, `<id>-2`, ...
/// Any I/O or parse failure aborts the merge.
#[derive(Debug)]
pub struct Merger {
    dictionary: HashMap<String, String>,
    max_id: u64,
    directories: usize,
}

impl Merger {
    /// # Errors
    ///
    /// Returns an error when a descriptor cannot be read, parsed or
    /// written, or a coverage file cannot be copied.
    pub fn merge(dest: &Path, source: &Path) -> Result<MergeReport, MergeError> {
        let dest_root = read_descriptor(&dest.join(DESCRIPTOR_FILE))?;
        let source_root = read_descriptor(&source.join(DESCRIPTOR_FILE))?;
        let dictionary = browser_dictionary(
            dest_root.browsers.as_deref().unwrap_or_default(),
            source_root.browsers.as_deref().unwrap_or_default(),
        );
        let mut merger = Self {
            dictionary,
            max_id: dest_root
                .max_id
                .unwrap_or(0)
                .max(source_root.max_id.unwrap_or(0)),
            directories: 0,
        };
        info!(
            "Merging archive {} into {}",
            source.display(),
            dest.display()
        );
        merger.merge_directory(dest, source, None)?;

        let root_path = dest.join(DESCRIPTOR_FILE);
        let mut root = read_descriptor(&root_path)?;
        root.max_id = Some(merger.max_id);
        write_descriptor(&root_path, &root)?;

        let renamed_browsers = merger
            .dictionary
            .iter()
            .filter(|(from, to)| from != to)
            .map(|(from, to)| (from.clone(), to.clone()))
            .collect();
        Ok(MergeReport {
            max_id: merger.max_id,
            directories: merger.directories,
            renamed_browsers,
        })
    }

    fn translate(&self, browser: &str) -> String {
        self.dictionary
            .get(browser)
            .cloned()
            .unwrap_or_else(|| browser.to_owned())
    }

    const fn next_id(&mut self) -> u64 {
        self.max_id = self.max_id.saturating_add(1);
        self.max_id
    }

    fn merge_directory(
        &mut self,
        dest_dir: &Path,
        source_dir: &Path,
        id: Option<u64>,
    ) -> Result<(), MergeError> {
        let source = read_descriptor(&source_dir.join(DESCRIPTOR_FILE))?;
        fs::create_dir_all(dest_dir).map_err(|source| MergeError::CreateDir {
            path: dest_dir.to_path_buf(),
            source,
        })?;
        let dest_path = dest_dir.join(DESCRIPTOR_FILE);
        let mut dest = if dest_path.exists() {
            read_descriptor(&dest_path)?
        } else {
            Descriptor {
                id,
                name: source.name.clone(),
                kind: source.kind,
                dir: source.dir.clone(),
                ..Descriptor::default()
            }
        };
        self.directories = self.directories.saturating_add(1);
        debug!("Merging {}", source_dir.display());

        for (browser, count) in &source.failures {
            dest.add_failures(&self.translate(browser), *count);
        }

        let mut recursions = Vec::new();
        for child in &source.children {
            let translated = self.translate_child(child);
            let target_dir = match dest.child_named_mut(&child.name) {
                Some(existing) => {
                    merge_child(existing, translated);
                    existing.dir.clone().map(|dir| (dir, existing.id))
                }
                None => {
                    let mut added = translated;
                    added.id = Some(self.next_id());
                    if let Some(dir) = &added.dir {
                        added.dir = Some(free_dir_name(dir, &dest.children));
                    }
                    let target = added.dir.clone().map(|dir| (dir, added.id));
                    dest.children.push(added);
                    target
                }
            };
            if let (Some(source_child_dir), Some((dest_child_dir, child_id))) =
                (&child.dir, target_dir)
            {
                recursions.push((dest_child_dir, source_child_dir.clone(), child_id));
            }
        }

        if let Some(scenarios) = &source.scenarios {
            let merged = dest.scenarios.get_or_insert_with(Vec::new);
            for scenario in scenarios {
                if !merged.iter().any(|existing| existing.path == scenario.path) {
                    merged.push(scenario.clone());
                }
            }
        }

        if let Some(browsers) = &source.browsers {
            let translated: Vec<BrowserEntry> = browsers
                .iter()
                .map(|browser| BrowserEntry {
                    id: self.translate(&browser.id),
                    ..browser.clone()
                })
                .collect();
            let merged = dest.browsers.get_or_insert_with(Vec::new);
            for browser in translated {
                if !merged.iter().any(|existing| existing.id == browser.id) {
                    merged.push(browser);
                }
            }
        }

        if let Some(coverages) = &source.coverages {
            let merged = dest.coverages.get_or_insert_with(Vec::new);
            for coverage in coverages {
                let browser_id = self.translate(&coverage.browser_id);
                let path = coverage_path(&coverage.path, &coverage.browser_id, &browser_id);
                copy_file(&source_dir.join(&coverage.path), &dest_dir.join(&path))?;
                if !merged.iter().any(|existing| existing.path == path) {
                    merged.push(CoverageEntry {
                        browser_id,
                        path,
                        structure: coverage.structure,
                    });
                }
            }
        }

        write_descriptor(&dest_path, &dest)?;

        for (dest_child_dir, source_child_dir, child_id) in recursions {
            self.merge_directory(
                &dest_dir.join(dest_child_dir),
                &source_dir.join(source_child_dir),
                child_id,
            )?;
        }
        Ok(())
    }

    fn translate_child(&self, child: &ChildEntry) -> ChildEntry {
        let mut translated = child.clone();
        translated.results = child
            .results
            .iter()
            .map(|(browser, result)| (self.translate(browser), *result))
            .collect();
        for details in &mut translated.details {
            details.browser = self.translate(&details.browser);
        }
        translated
    }
}

/// Per-browser values of a child present in both archives: failure counts
/// add up, pass flags only stay true when both passed.
fn merge_child(existing: &mut ChildEntry, incoming: ChildEntry) {
    for (browser, result) in incoming.results {
        let merged = match (existing.results.get(&browser), result) {
            (None, incoming) => incoming,
            (Some(BrowserResult::Failures(a)), BrowserResult::Failures(b)) => {
                BrowserResult::Failures(a.saturating_add(b))
            }
            (Some(BrowserResult::Passed(a)), BrowserResult::Passed(b)) => {
                BrowserResult::Passed(*a && b)
            }
            (Some(current), BrowserResult::Passed(_) | BrowserResult::Failures(_)) => *current,
        };
        existing.results.insert(browser, merged);
    }
    for details in incoming.details {
        existing.add_expectations(&details.browser, details.expectations);
    }
}

/// Maps every source browser id to the id it gets in the destination.
fn browser_dictionary(
    dest: &[BrowserEntry],
    source: &[BrowserEntry],
) -> HashMap<String, String> {
    let mut index: HashMap<String, &BrowserEntry> = dest
        .iter()
        .map(|browser| (browser.id.clone(), browser))
        .collect();
    let mut minted: HashSet<String> = HashSet::new();
    let mut dictionary = HashMap::new();
    for browser in source {
        let clashes = index.get(&browser.id).is_some_and(|existing| {
            existing.name != browser.name || existing.user_agent != browser.user_agent
        });
        if clashes {
            let renamed = (1_u64..)
                .map(|suffix| format!("{}-{}", browser.id, suffix))
                .find(|candidate| !index.contains_key(candidate) && !minted.contains(candidate))
                .unwrap_or_else(|| browser.id.clone());
            minted.insert(renamed.clone());
            dictionary.insert(browser.id.clone(), renamed);
        } else {
            index.insert(browser.id.clone(), browser);
            dictionary.insert(browser.id.clone(), browser.id.clone());
        }
    }
    dictionary
}

/// Moves a coverage file name over to the renamed browser, so
/// `coverage-chrome51.json` becomes `coverage-chrome51-1.json`.
fn coverage_path(path: &str, from: &str, to: &str) -> String {
    if from == to {
        return path.to_owned();
    }
    path.strip_prefix(&format!("coverage-{from}")).map_or_else(
        || format!("{to}-{path}"),
        |rest| format!("coverage-{to}{rest}"),
    )
}

fn read_descriptor(path: &Path) -> Result<Descriptor, MergeError> {
    let bytes = fs::read(path).map_err(|source| MergeError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| MergeError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn write_descriptor(path: &Path, descriptor: &Descriptor) -> Result<(), MergeError> {
    let bytes = render_descriptor(descriptor).map_err(|source| MergeError::Serialize {
        path: path.to_path_buf(),
        source,
    })?;
    fs::write(path, bytes).map_err(|source| MergeError::Write {
        path: path.to_path_buf(),
        source,
    })
}

fn copy_file(from: &Path, to: &Path) -> Result<(), MergeError> {
    fs::copy(from, to)
        .map(|_bytes| ())
        .map_err(|source| MergeError::CopyCoverage {
            from: from.to_path_buf(),
            to: PathBuf::from(to),
            source,
        })
}
