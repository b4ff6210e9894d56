use super::{Browser, BrowserId, UserAgent};

/// The locally installed browsers a runner may launch.
///
/// Used to attribute an anonymously connected local browser to a configured
/// browser entry.
#[derive(Debug, Default, Clone)]
pub struct LocalPool {
    browsers: Vec<(BrowserId, Option<&'static str>, Option<u32>)>,
}

impl LocalPool {
    #[must_use]
    pub fn new<'browser>(browsers: impl IntoIterator<Item = &'browser Browser>) -> Self {
        let browsers = browsers
            .into_iter()
            .filter(|browser| browser.is_local())
            .map(|browser| (browser.id, browser.canonical_name(), browser.major_version()))
            .collect();
        Self { browsers }
    }

    /// Finds a local browser with the same canonical name and, when both
    /// sides know it, the same major version.
    #[must_use]
    pub fn lookup_by_user_agent(&self, user_agent: &UserAgent) -> Option<BrowserId> {
        let canonical = user_agent.canonical_name()?;
        let major = user_agent.major();
        self.browsers
            .iter()
            .find(|(_, name, version)| {
                *name == Some(canonical)
                    && match (version, major) {
                        (Some(expected), Some(actual)) => *expected == actual,
                        (None, _) | (_, None) => true,
                    }
            })
            .map(|(id, _, _)| *id)
    }
}
