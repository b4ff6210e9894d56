use std::path::{Component, Path};

use super::descriptor::ChildEntry;

const MAX_NAME_CHARS: usize = 32;

/// Turns a suite, file or scenario name into a directory name.
///
/// Drops path separators, reserved and control characters, replaces
/// spaces with `-` and keeps at most 32 characters.
#[must_use]
pub fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| {
            !c.is_control() && !matches!(c, '/' | '\\' | '?' | '<' | '>' | ':' | '*' | '|' | '"')
        })
        .map(|c| if c == ' ' { '-' } else { c })
        .take(MAX_NAME_CHARS)
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "_".to_owned(),
        _ => cleaned,
    }
}

/// A directory name for `name` not yet used by any sibling: `name`,
/// `name~1`, `name~2`, ...
#[must_use]
pub fn unique_dir_name(name: &str, siblings: &[ChildEntry]) -> String {
    free_dir_name(&sanitize(name), siblings)
}

/// `dir` itself when no sibling uses it, otherwise the first free `dir~n`.
#[must_use]
pub fn free_dir_name(dir: &str, siblings: &[ChildEntry]) -> String {
    let taken = |candidate: &str| {
        siblings
            .iter()
            .any(|sibling| sibling.dir.as_deref() == Some(candidate))
    };
    if !taken(dir) {
        return dir.to_owned();
    }
    (1_u64..)
        .map(|suffix| format!("{dir}~{suffix}"))
        .find(|candidate| !taken(candidate))
        .unwrap_or_else(|| dir.to_owned())
}

/// Browser id such as `chrome51`; `chrome51-1`, `chrome51-2`, ... when
/// already in use.
#[must_use]
pub fn unique_browser_id<F>(name: &str, major: Option<u32>, taken: F) -> String
where
    F: Fn(&str) -> bool,
{
    let mut base: String = name
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_lowercase();
    if let Some(major) = major {
        base.push_str(&major.to_string());
    }
    if !taken(&base) {
        return base;
    }
    (1_u64..)
        .map(|suffix| format!("{base}-{suffix}"))
        .find(|candidate| !taken(candidate))
        .unwrap_or(base)
}

/// Relative path with `/` separators regardless of platform.
#[must_use]
pub fn slash_path(path: &Path) -> String {
    path.components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            Component::Prefix(_)
            | Component::RootDir
            | Component::CurDir
            | Component::ParentDir => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Splits a browser supplied file name into plain path segments, dropping
/// roots and `.`/`..`.
#[must_use]
pub fn path_segments(path: &str) -> Vec<String> {
    path.split(['/', '\\'])
        .filter(|segment| !segment.is_empty() && *segment != "." && *segment != "..")
        .map(str::to_owned)
        .collect()
}
