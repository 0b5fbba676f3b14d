use mfeed_adapters::{extract_rows, feed_spec, fixture_page_path, load_fixture_page};
use mfeed_core::FeedKind;

fn workspace_root() -> std::path::PathBuf {
    std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

#[test]
fn every_feed_has_a_sample_page_and_snapshot() {
    let root = workspace_root();
    for feed in FeedKind::ALL {
        let page = fixture_page_path(&root, feed);
        assert!(page.exists(), "{}", page.display());
        assert!(page.with_file_name("snapshot.json").exists(), "{feed}");
    }
}

#[test]
fn sample_pages_extract_with_fresh_timestamps() {
    let root = workspace_root();
    let started = chrono::Utc::now();
    for feed in FeedKind::ALL {
        let html = load_fixture_page(fixture_page_path(&root, feed)).unwrap();
        let extraction = extract_rows(&html, &feed_spec(feed)).unwrap();
        assert!(!extraction.records.is_empty(), "{feed}");
        for record in &extraction.records {
            assert_eq!(record.feed, feed);
            assert!(record.is_publishable());
            assert!(record.scraped_at >= started);
        }
    }
}

#[test]
fn missing_fixture_reports_its_path() {
    let err = load_fixture_page(workspace_root().join("fixtures/nope/sample/page.html")).unwrap_err();
    assert!(format!("{err:#}").contains("fixtures/nope/sample/page.html"));
}
