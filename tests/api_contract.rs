//! Route table contract
//!
//! `tests/fixtures/api_routes.txt` lists every `METHOD /path` the bridge
//! serves. Home Assistant automations and scripts call these paths
//! directly, so the router in `src/api/mod.rs` must match the list exactly.

use std::collections::BTreeSet;
use std::fs;

const FIXTURE: &str = "tests/fixtures/api_routes.txt";
const ROUTER_SOURCE: &str = "src/api/mod.rs";

/// Non-comment, non-blank fixture lines, in file order
fn fixture_lines() -> Vec<String> {
    fs::read_to_string(FIXTURE)
        .unwrap()
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(String::from)
        .collect()
}

/// `METHOD /path` for each `.route("/path", method(handler))` in the router
fn declared_routes() -> BTreeSet<String> {
    let source = fs::read_to_string(ROUTER_SOURCE).unwrap();
    source
        .lines()
        .map(str::trim)
        .filter_map(|line| line.strip_prefix(".route(\""))
        .filter_map(|rest| {
            let (path, handler) = rest.split_once("\", ")?;
            let method = handler.split('(').next()?.to_uppercase();
            Some(format!("{} {}", method, path))
        })
        .collect()
}

#[test]
fn router_matches_fixture() {
    let expected: BTreeSet<String> = fixture_lines().into_iter().collect();
    let declared = declared_routes();

    let missing: Vec<_> = expected.difference(&declared).collect();
    let unlisted: Vec<_> = declared.difference(&expected).collect();
    assert!(
        missing.is_empty() && unlisted.is_empty(),
        "route table drifted from {FIXTURE}\n  missing from router: {missing:?}\n  not in fixture: {unlisted:?}"
    );
}

#[test]
fn router_serves_zone_routes() {
    let declared = declared_routes();
    for route in [
        "GET /zones",
        "GET /zones/{zone_id}",
        "POST /zones/{zone_id}/command",
        "POST /zones/{zone_id}/snapshot",
        "POST /zones/{zone_id}/restore",
    ] {
        assert!(declared.contains(route), "{route} not routed");
    }
}

#[test]
fn fixture_is_sorted_without_duplicates() {
    let lines = fixture_lines();
    let mut sorted = lines.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(lines, sorted, "{FIXTURE} must be sorted and duplicate-free");
}
