// Golden snapshot tests: captured upstream payloads -> normalized records.

use std::path::{Path, PathBuf};

use chrono::TimeZone;
use cosmic_adapters::{
    cosmic_api_adapter, lodestone_report_adapter, AdapterContext, FetchedPage, SourceAdapter,
};
use cosmic_core::{civil_offset, NormalizedRecord};
use uuid::Uuid;

fn fixture_path(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

fn read_expected(name: &str) -> Vec<NormalizedRecord> {
    let text = std::fs::read_to_string(fixture_path(name)).expect("read snapshot");
    serde_json::from_str(&text).expect("parse snapshot")
}

fn fixture_page(name: &str) -> FetchedPage {
    FetchedPage {
        url: format!("fixture://{name}"),
        body: std::fs::read(fixture_path(name)).expect("read fixture"),
    }
}

fn ctx() -> AdapterContext {
    AdapterContext::new(
        Uuid::new_v4(),
        civil_offset()
            .with_ymd_and_hms(2025, 7, 14, 14, 17, 45)
            .single()
            .expect("valid instant"),
    )
}

#[test]
fn golden_json_snapshot_test_cosmic_api() {
    let ctx = ctx();
    let adapter = cosmic_api_adapter();
    let page = fixture_page("cosmic_api.json");
    let actual = adapter.parse_page(&page, &ctx).expect("parse");
    assert_eq!(actual, read_expected("cosmic_api.expected.json"));
}

#[test]
fn golden_json_snapshot_test_lodestone_report() {
    let ctx = ctx();
    let adapter = lodestone_report_adapter();
    let page = fixture_page("lodestone_report.html");
    let actual = adapter.parse_page(&page, &ctx).expect("parse");
    assert_eq!(actual, read_expected("lodestone_report.expected.json"));
}

#[test]
fn fixture_identity_keys_are_unique() {
    let ctx = ctx();
    let mut keys = Vec::new();
    let api = cosmic_api_adapter()
        .parse_page(&fixture_page("cosmic_api.json"), &ctx)
        .expect("parse api");
    let report = lodestone_report_adapter()
        .parse_page(&fixture_page("lodestone_report.html"), &ctx)
        .expect("parse report");
    keys.extend(api.iter().chain(report.iter()).map(NormalizedRecord::identity_key));

    let total = keys.len();
    keys.sort();
    keys.dedup();
    assert_eq!(keys.len(), total);
}
