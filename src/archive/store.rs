use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::ser::{PrettyFormatter, Serializer};

use super::descriptor::{BrowserEntry, Descriptor};
use super::naming::unique_browser_id;
use crate::error::ArchiveError;

pub const DESCRIPTOR_FILE: &str = "data.json";

/// In-memory descriptors of one archive, keyed by absolute directory.
///
/// Every descriptor receives the next sequential id when first visited;
/// test entries draw from the same sequence.
#[derive(Debug)]
pub struct DescriptorStore {
    basedir: PathBuf,
    descriptors: HashMap<PathBuf, Descriptor>,
    id_seed: u64,
    browsers: HashMap<String, String>,
}

impl DescriptorStore {
    #[must_use]
    pub fn new(basedir: PathBuf) -> Self {
        Self {
            basedir,
            descriptors: HashMap::new(),
            id_seed: 0,
            browsers: HashMap::new(),
        }
    }

    #[must_use]
    pub fn basedir(&self) -> &Path {
        &self.basedir
    }

    #[must_use]
    pub const fn max_id(&self) -> u64 {
        self.id_seed
    }

    pub const fn next_id(&mut self) -> u64 {
        self.id_seed = self.id_seed.saturating_add(1);
        self.id_seed
    }

    #[must_use]
    pub fn descriptor(&self, dir: &Path) -> Option<&Descriptor> {
        self.descriptors.get(dir)
    }

    pub fn descriptor_mut(&mut self, dir: &Path) -> &mut Descriptor {
        let seed = &mut self.id_seed;
        self.descriptors
            .entry(dir.to_path_buf())
            .or_insert_with(|| {
                *seed = seed.saturating_add(1);
                Descriptor::with_id(*seed)
            })
    }

    pub fn root_mut(&mut self) -> &mut Descriptor {
        let basedir = self.basedir.clone();
        self.descriptor_mut(&basedir)
    }

    /// Browser id for an agent group, registering it on the root descriptor
    /// the first time the group key is seen.
    pub fn browser_id(
        &mut self,
        group: &str,
        family: &str,
        major: Option<u32>,
        name: &str,
        user_agent: &str,
    ) -> String {
        if let Some(existing) = self.browsers.get(group) {
            return existing.clone();
        }
        let id = unique_browser_id(family, major, |candidate| {
            self.browsers.values().any(|used| used == candidate)
        });
        self.root_mut()
            .browsers
            .get_or_insert_with(Vec::new)
            .push(BrowserEntry {
                id: id.clone(),
                name: name.to_owned(),
                user_agent: user_agent.to_owned(),
            });
        self.browsers.insert(group.to_owned(), id.clone());
        id
    }

    /// Removes every descriptor for writing; each one is written once.
    pub fn take_all(&mut self) -> Vec<(PathBuf, Descriptor)> {
        self.descriptors.drain().collect()
    }
}

/// Renders a descriptor the way archive consumers expect it: four space
/// indentation.
///
/// # Errors
///
/// Returns an error when the value cannot be encoded.
pub fn render_descriptor<T: Serialize>(value: &T) -> serde_json::Result<Vec<u8>> {
    let mut buffer = Vec::new();
    let formatter = PrettyFormatter::with_indent(b"    ");
    let mut serializer = Serializer::with_formatter(&mut buffer, formatter);
    value.serialize(&mut serializer)?;
    Ok(buffer)
}

/// Writes `dir/data.json`, creating `dir` when needed.
///
/// # Errors
///
/// Returns an error when the directory or file cannot be written.
pub async fn write_descriptor(dir: &Path, descriptor: &Descriptor) -> Result<(), ArchiveError> {
    let path = dir.join(DESCRIPTOR_FILE);
    let bytes = render_descriptor(descriptor).map_err(|source| ArchiveError::Serialize {
        path: path.clone(),
        source,
    })?;
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|source| ArchiveError::Io {
            context: "creating directory",
            path: dir.to_path_buf(),
            source,
        })?;
    tokio::fs::write(&path, bytes)
        .await
        .map_err(|source| ArchiveError::Io {
            context: "writing descriptor",
            path,
            source,
        })
}
