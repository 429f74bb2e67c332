use std::path::{Path, PathBuf};

use reqsync_adapters::{extract_records, normalize};
use reqsync_core::{CanonicalDocument, FactoryMap};

fn fixture_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/collaboflow")
}

fn read_json(name: &str) -> serde_json::Value {
    let text = std::fs::read_to_string(fixture_dir().join(name)).expect("read fixture");
    serde_json::from_str(&text).expect("parse fixture")
}

#[test]
fn search_fixture_normalizes_to_snapshot() {
    let factories: FactoryMap = [('N', "Nagatsu".to_string()), ('K', "Kumamoto".to_string())]
        .into_iter()
        .collect();

    let records = extract_records(read_json("search_response.json")).expect("records");
    let normalized = normalize(records, 40, &factories);
    assert!(normalized.rejected.is_empty(), "{:?}", normalized.rejected);

    let expected: Vec<CanonicalDocument> =
        serde_json::from_value(read_json("normalized_snapshot.json")).expect("snapshot");
    assert_eq!(normalized.documents, expected);
}
