/// Maps a browser name or type to its canonical short form.
#[must_use]
pub fn canonical_name(name: &str) -> Option<&'static str> {
    let canonical = match name.trim().to_ascii_lowercase().as_str() {
        "android browser" | "android" => "android",
        "chrome" | "google chrome" => "chrome",
        "chromium" => "chromium",
        "edge" | "microsoft edge" | "microsoftedge" => "edge",
        "htmlunit" => "htmlunit",
        "ie" | "internet explorer" => "ie",
        "ie mobile" => "iemobile",
        "ipad" => "ipad",
        "iphone" => "iphone",
        "firefox" => "firefox",
        "opera" => "opera",
        "opera browser" => "operamobile",
        "safari" => "safari",
        "mobile safari" => "safarimobile",
        "yandex" => "yandex",
        _ => return None,
    };
    Some(canonical)
}

#[must_use]
pub fn display_name(canonical: &str) -> Option<&'static str> {
    let display = match canonical {
        "android" => "Android",
        "chrome" => "Google Chrome",
        "chromium" => "Chromium",
        "edge" => "Microsoft Edge",
        "htmlunit" => "HtmlUnit",
        "ie" => "Internet Explorer",
        "iemobile" => "Internet Explorer Mobile",
        "ipad" => "iPad",
        "iphone" => "iPhone",
        "firefox" => "Firefox",
        "opera" => "Opera",
        "operamobile" => "Opera Mobile",
        "safari" => "Safari",
        "safarimobile" => "Safari Mobile",
        "yandex" => "Yandex",
        _ => return None,
    };
    Some(display)
}

/// Maps a free-form platform string to a canonical platform.
#[must_use]
pub fn canonical_platform(platform: &str) -> Option<&'static str> {
    const PLATFORMS: [(&str, &str); 12] = [
        ("android", "android"),
        ("ios", "ios"),
        ("linux", "linux"),
        ("mac", "osx"),
        ("opera", "opera"),
        ("osx", "osx"),
        ("os x", "osx"),
        ("unix", "unix"),
        ("vista", "windows"),
        ("windows", "windows"),
        ("winphone", "windows"),
        ("xp", "windows"),
    ];
    let lowered = platform.to_ascii_lowercase();
    PLATFORMS
        .iter()
        .find(|(needle, _)| lowered.contains(needle))
        .map(|(_, canonical)| *canonical)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_case_insensitive() -> Result<(), String> {
        if canonical_name("Microsoft Edge") != Some("edge") {
            return Err("Expected Microsoft Edge to canonicalize to edge".to_owned());
        }
        if canonical_name("Internet Explorer") != Some("ie") {
            return Err("Expected Internet Explorer to canonicalize to ie".to_owned());
        }
        if canonical_name("netscape").is_some() {
            return Err("Expected unknown browsers to have no canonical name".to_owned());
        }
        Ok(())
    }

    #[test]
    fn platform_matches_first_substring() -> Result<(), String> {
        if canonical_platform("Mac OS X 10.11") != Some("osx") {
            return Err("Expected Mac OS X to map to osx".to_owned());
        }
        if canonical_platform("Windows XP") != Some("windows") {
            return Err("Expected Windows XP to map to windows".to_owned());
        }
        Ok(())
    }
}
