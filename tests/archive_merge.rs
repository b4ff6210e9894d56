use std::path::Path;

use serde_json::{Value, json};
use tempfile::tempdir;

use testrelay::archive::{BrowserResult, DESCRIPTOR_FILE, Descriptor, Merger};

fn write(dir: &Path, descriptor: &Value) -> Result<(), String> {
    std::fs::create_dir_all(dir).map_err(|err| format!("mkdir {}: {}", dir.display(), err))?;
    std::fs::write(dir.join(DESCRIPTOR_FILE), descriptor.to_string())
        .map_err(|err| format!("write {}: {}", dir.display(), err))
}

fn read(dir: &Path) -> Result<Descriptor, String> {
    let text = std::fs::read_to_string(dir.join(DESCRIPTOR_FILE))
        .map_err(|err| format!("read {}: {}", dir.display(), err))?;
    serde_json::from_str(&text).map_err(|err| format!("parse {}: {}", dir.display(), err))
}

#[test]
fn merging_two_archives_keeps_ids_unique_and_browsers_apart() -> Result<(), String> {
    let dest = tempdir().map_err(|err| err.to_string())?;
    let source = tempdir().map_err(|err| err.to_string())?;

    write(
        dest.path(),
        &json!({
            "maxId": 3,
            "browsers": [{"id": "chrome51", "name": "Chrome", "userAgent": "Chrome/51 linux"}],
            "children": [{"name": "login.js", "type": "file", "dir": "login.js", "id": 2}],
            "chrome51": 1
        }),
    )?;
    write(
        &dest.path().join("login.js"),
        &json!({
            "id": 2, "name": "login.js", "type": "file",
            "children": [{"name": "works", "type": "test", "id": 3, "chrome51": false}],
            "chrome51": 1
        }),
    )?;

    write(
        source.path(),
        &json!({
            "maxId": 2,
            "browsers": [{"id": "chrome51", "name": "Chrome", "userAgent": "Chrome/51 windows"}],
            "children": [
                {"name": "login.js", "type": "file", "dir": "login.js", "id": 1},
                {"name": "cart.js", "type": "file", "dir": "cart.js", "id": 2}
            ],
            "chrome51": 2
        }),
    )?;
    write(
        &source.path().join("login.js"),
        &json!({
            "id": 1, "name": "login.js", "type": "file",
            "children": [{"name": "works", "type": "test", "chrome51": true}],
            "chrome51": 1
        }),
    )?;
    write(
        &source.path().join("cart.js"),
        &json!({
            "id": 2, "name": "cart.js", "type": "file",
            "children": [{"name": "adds items", "type": "test", "chrome51": false}],
            "chrome51": 1
        }),
    )?;

    let report = Merger::merge(dest.path(), source.path()).map_err(|err| err.to_string())?;
    if report.max_id != 5 || report.directories != 3 {
        return Err(format!("Unexpected report {report:?}"));
    }
    if report.renamed_browsers.get("chrome51").map(String::as_str) != Some("chrome51-1") {
        return Err(format!("Clashing browser must be renamed: {report:?}"));
    }

    let root = read(dest.path())?;
    if root.max_id != Some(5) {
        return Err(format!("Root maxId not updated: {:?}", root.max_id));
    }
    if root.failures.get("chrome51") != Some(&1) || root.failures.get("chrome51-1") != Some(&2) {
        return Err(format!("Unexpected root failures {:?}", root.failures));
    }
    let browsers: Vec<String> = root
        .browsers
        .clone()
        .unwrap_or_default()
        .into_iter()
        .map(|browser| browser.id)
        .collect();
    if browsers != ["chrome51", "chrome51-1"] {
        return Err(format!("Unexpected browsers {browsers:?}"));
    }
    let cart_id = root.child_named("cart.js").and_then(|child| child.id);
    if cart_id != Some(4) {
        return Err(format!("New children get ids above both archives: {cart_id:?}"));
    }

    let login = read(&dest.path().join("login.js"))?;
    let works = login.child_named("works").ok_or("missing merged test")?;
    if works.results.get("chrome51") != Some(&BrowserResult::Passed(false))
        || works.results.get("chrome51-1") != Some(&BrowserResult::Passed(true))
    {
        return Err(format!("Unexpected merged results {:?}", works.results));
    }

    let cart = read(&dest.path().join("cart.js"))?;
    if cart.id != Some(4) || cart.child_named("adds items").and_then(|child| child.id) != Some(5) {
        return Err(format!("Unexpected copied directory {cart:?}"));
    }
    Ok(())
}

#[test]
fn missing_source_descriptor_aborts_the_merge() -> Result<(), String> {
    let dest = tempdir().map_err(|err| err.to_string())?;
    let source = tempdir().map_err(|err| err.to_string())?;
    write(dest.path(), &json!({"maxId": 1}))?;
    if Merger::merge(dest.path(), source.path()).is_ok() {
        return Err("Merging from an empty directory must fail".to_owned());
    }
    Ok(())
}

#[test]
fn coverage_of_a_renamed_browser_keeps_both_files() -> Result<(), String> {
    let dest = tempdir().map_err(|err| err.to_string())?;
    let source = tempdir().map_err(|err| err.to_string())?;
    let coverage = json!([{"browserId": "chrome51", "path": "coverage-chrome51.json"}]);

    write(
        dest.path(),
        &json!({
            "maxId": 0,
            "browsers": [{"id": "chrome51", "name": "Chrome", "userAgent": "Chrome/51 linux"}],
            "coverages": coverage
        }),
    )?;
    std::fs::write(dest.path().join("coverage-chrome51.json"), "linux")
        .map_err(|err| err.to_string())?;
    write(
        source.path(),
        &json!({
            "maxId": 0,
            "browsers": [{"id": "chrome51", "name": "Chrome", "userAgent": "Chrome/51 windows"}],
            "coverages": coverage
        }),
    )?;
    std::fs::write(source.path().join("coverage-chrome51.json"), "windows")
        .map_err(|err| err.to_string())?;

    Merger::merge(dest.path(), source.path()).map_err(|err| err.to_string())?;

    let kept = std::fs::read_to_string(dest.path().join("coverage-chrome51.json"))
        .map_err(|err| err.to_string())?;
    if kept != "linux" {
        return Err(format!("Destination coverage was overwritten with {kept:?}"));
    }
    let added = std::fs::read_to_string(dest.path().join("coverage-chrome51-1.json"))
        .map_err(|err| err.to_string())?;
    if added != "windows" {
        return Err(format!("Unexpected renamed coverage {added:?}"));
    }
    let entries: Vec<(String, String)> = read(dest.path())?
        .coverages
        .unwrap_or_default()
        .into_iter()
        .map(|entry| (entry.browser_id, entry.path))
        .collect();
    let expected = [
        ("chrome51".to_owned(), "coverage-chrome51.json".to_owned()),
        ("chrome51-1".to_owned(), "coverage-chrome51-1.json".to_owned()),
    ];
    if entries != expected {
        return Err(format!("Unexpected coverage entries {entries:?}"));
    }
    Ok(())
}
