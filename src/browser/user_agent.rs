use std::fmt;

use serde::Serialize;

use super::canonical_name;

/// A parsed `User-Agent` header.
///
/// Equality and grouping use the raw string; the parsed parts only feed
/// display names, browser ids and local-pool matching.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct UserAgent {
    raw: String,
    family: String,
    version: Option<String>,
    os: Option<String>,
}

impl UserAgent {
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let (family, version) = detect_browser(raw);
        Self {
            raw: raw.to_owned(),
            family: family.to_owned(),
            version,
            os: detect_os(raw),
        }
    }

    #[must_use]
    pub fn raw(&self) -> &str {
        &self.raw
    }

    #[must_use]
    pub fn family(&self) -> &str {
        &self.family
    }

    #[must_use]
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    #[must_use]
    pub fn os(&self) -> Option<&str> {
        self.os.as_deref()
    }

    #[must_use]
    pub fn major(&self) -> Option<u32> {
        self.version.as_deref().and_then(major_of)
    }

    #[must_use]
    pub fn canonical_name(&self) -> Option<&'static str> {
        canonical_name(&self.family)
    }

    /// Browser family and version, e.g. `Chrome 51.0.2704.63`.
    #[must_use]
    pub fn full_name(&self) -> String {
        match &self.version {
            Some(version) => format!("{} {}", self.family, version),
            None => self.family.clone(),
        }
    }

    /// Display name, e.g. `Chrome 51.0.2704.63 / Mac OS X 10.11.5`.
    #[must_use]
    pub fn name(&self) -> String {
        match &self.os {
            Some(os) => format!("{} / {}", self.full_name(), os),
            None => self.full_name(),
        }
    }
}

impl fmt::Display for UserAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

pub(crate) fn major_of(version: &str) -> Option<u32> {
    version
        .split('.')
        .next()
        .and_then(|major| major.trim().parse().ok())
}

fn detect_browser(raw: &str) -> (&'static str, Option<String>) {
    if let Some(version) = version_after(raw, "Edge/").or_else(|| version_after(raw, "Edg/")) {
        return ("Edge", Some(version));
    }
    if let Some(version) = version_after(raw, "OPR/") {
        return ("Opera", Some(version));
    }
    if let Some(version) = version_after(raw, "MSIE ") {
        return ("IE", Some(version));
    }
    if raw.contains("Trident/")
        && let Some(version) = version_after(raw, "rv:")
    {
        return ("IE", Some(version));
    }
    if let Some(version) = version_after(raw, "Firefox/") {
        return ("Firefox", Some(version));
    }
    if let Some(version) = version_after(raw, "Chrome/").or_else(|| version_after(raw, "CriOS/")) {
        return ("Chrome", Some(version));
    }
    if raw.contains("Safari/")
        && let Some(version) = version_after(raw, "Version/")
    {
        return ("Safari", Some(version));
    }
    if let Some(version) = version_after(raw, "AppleWebKit/") {
        return ("WebKit", Some(version));
    }
    ("Unknown", None)
}

fn detect_os(raw: &str) -> Option<String> {
    let platform = raw
        .split_once('(')
        .and_then(|(_, rest)| rest.split_once(')'))
        .map_or(raw, |(inside, _)| inside);

    if let Some(nt) = version_after(platform, "Windows NT ") {
        let name = match nt.as_str() {
            "10.0" => "Windows 10.0".to_owned(),
            "6.3" => "Windows 8.1".to_owned(),
            "6.2" => "Windows 8".to_owned(),
            "6.1" => "Windows 7".to_owned(),
            "6.0" => "Windows Vista".to_owned(),
            "5.1" | "5.2" => "Windows XP".to_owned(),
            other => format!("Windows NT {other}"),
        };
        return Some(name);
    }
    if let Some(version) =
        version_after(platform, "iPhone OS ").or_else(|| version_after(platform, "CPU OS "))
    {
        return Some(format!("iOS {}", version.replace('_', ".")));
    }
    if let Some(version) = version_after(platform, "Mac OS X ") {
        return Some(format!("Mac OS X {}", version.replace('_', ".")));
    }
    if let Some(version) = version_after(platform, "Android ") {
        return Some(format!("Android {version}"));
    }
    let bits = if platform.contains("x86_64") || platform.contains("amd64") {
        " 64"
    } else {
        ""
    };
    if platform.contains("Ubuntu") {
        return Some(format!("Ubuntu{bits}"));
    }
    if platform.contains("Linux") {
        return Some(format!("Linux{bits}"));
    }
    None
}

fn version_after(haystack: &str, marker: &str) -> Option<String> {
    let start = haystack.find(marker)?.checked_add(marker.len())?;
    let version: String = haystack
        .get(start..)?
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == '_')
        .collect();
    let version = version.trim_end_matches(['.', '_']);
    (!version.is_empty()).then(|| version.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expect_name(raw: &str, expected: &str) -> Result<(), String> {
        let parsed = UserAgent::parse(raw);
        if parsed.name() != expected {
            return Err(format!("Expected '{}', got '{}'", expected, parsed.name()));
        }
        Ok(())
    }

    #[test]
    fn electron_chrome_on_os_x() -> Result<(), String> {
        let raw = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_11_5) AppleWebKit/537.36 (KHTML, like Gecko) Studio/1.0.0 Chrome/51.0.2704.63 Electron/1.2.0 Safari/537.36";
        expect_name(raw, "Chrome 51.0.2704.63 / Mac OS X 10.11.5")?;
        let parsed = UserAgent::parse(raw);
        if parsed.major() != Some(51) || parsed.canonical_name() != Some("chrome") {
            return Err(format!("Unexpected parsed parts: {parsed:?}"));
        }
        if parsed.raw() != raw {
            return Err("Expected the raw string to be preserved".to_owned());
        }
        Ok(())
    }

    #[test]
    fn chrome_on_linux_reports_bitness() -> Result<(), String> {
        expect_name(
            "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/51.0.2704.103 Safari/537.36",
            "Chrome 51.0.2704.103 / Linux 64",
        )
    }

    #[test]
    fn edge_wins_over_chrome_token() -> Result<(), String> {
        expect_name(
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/46.0.2486.0 Safari/537.36 Edge/13.10586",
            "Edge 13.10586 / Windows 10.0",
        )
    }

    #[test]
    fn internet_explorer_variants() -> Result<(), String> {
        expect_name(
            "Mozilla/4.0 (compatible; MSIE 8.0; Windows NT 6.1; Trident/4.0; SLCC2; .NET CLR 2.0.50727)",
            "IE 8.0 / Windows 7",
        )?;
        expect_name(
            "Mozilla/5.0 (Windows NT 6.1; Trident/7.0; rv:11.0) like Gecko",
            "IE 11.0 / Windows 7",
        )
    }

    #[test]
    fn firefox_variants() -> Result<(), String> {
        expect_name(
            "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.11; rv:47.0) Gecko/20100101 Firefox/47.0",
            "Firefox 47.0 / Mac OS X 10.11",
        )?;
        expect_name(
            "Mozilla/5.0 (X11; Ubuntu; Linux x86_64; rv:47.0) Gecko/20100101 Firefox/47.0",
            "Firefox 47.0 / Ubuntu 64",
        )
    }

    #[test]
    fn safari_and_bare_webkit() -> Result<(), String> {
        expect_name(
            "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_11_5) AppleWebKit/601.6.17 (KHTML, like Gecko) Version/9.1.1 Safari/601.6.17",
            "Safari 9.1.1 / Mac OS X 10.11.5",
        )?;
        expect_name(
            "Mozilla/5.0 (iPhone; CPU iPhone OS 9_3 like Mac OS X) AppleWebKit/601.1.46 (KHTML, like Gecko) Mobile/13E230 (2097626544)",
            "WebKit 601.1.46 / iOS 9.3",
        )
    }

    #[test]
    fn unknown_agents_still_have_a_name() -> Result<(), String> {
        expect_name("curl/8.0", "Unknown")
    }
}
