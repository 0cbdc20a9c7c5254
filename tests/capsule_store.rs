// tests/capsule_store.rs
use capsule_mesh::capsule::{
    asset_id_for, Attribution, CapsuleFilter, CapsulePrice, CapsuleRecord, CapsuleStore,
};
use capsule_mesh::errors::MeshError;
use capsule_mesh::storage::{self, MeshDb};
use serde_json::json;
use uuid::Uuid;

fn test_db() -> MeshDb {
    let path = std::env::temp_dir().join(format!("mesh_capsule_{}", Uuid::new_v4()));
    storage::open_db(path.to_str().expect("utf8 path"))
}

fn record(content: serde_json::Value, tags: &[&str], confidence: f64) -> CapsuleRecord {
    CapsuleRecord {
        asset_id: String::new(),
        capsule_type: String::new(),
        confidence,
        attribution: Attribution {
            creator: "acct_creator00000000".into(),
        },
        tags: tags.iter().map(|t| t.to_string()).collect(),
        price: CapsulePrice {
            amount: 10,
            token: "MESH".into(),
            creator_share: 0.9,
        },
        status: String::new(),
        created_at: 0,
        content: Some(content),
        content_hash: None,
    }
}

#[test]
fn store_is_content_addressed_and_idempotent() {
    let store = CapsuleStore::new(test_db());
    let content = json!({"type": "skill", "steps": ["a", "b"]});
    let stored = store
        .store(record(content.clone(), &["skills"], 0.8))
        .expect("store");
    assert_eq!(stored.asset_id, asset_id_for(&content));
    assert_eq!(stored.capsule_type, "skill");
    assert_eq!(stored.status, "active");
    assert!(stored.content_hash.is_some());

    // Storing the same record again keeps one copy.
    store
        .store(record(content.clone(), &["skills"], 0.8))
        .expect("re-store");
    assert_eq!(store.count(), 1);

    // A metadata-only copy must not clobber the content we hold.
    let mut meta_only = CapsuleStore::public_view(&stored);
    meta_only.content = None;
    store.store(meta_only).expect("metadata copy");
    let held = store.get(&stored.asset_id).expect("get").expect("present");
    assert!(held.content.is_some());
}

#[test]
fn tampered_content_is_rejected() {
    let store = CapsuleStore::new(test_db());
    let mut capsule = record(json!({"steps": [1, 2, 3]}), &[], 0.5);
    capsule.asset_id = asset_id_for(&json!({"steps": [9, 9, 9]}));
    assert!(matches!(
        store.store(capsule),
        Err(MeshError::CapsuleTampered(_))
    ));
}

#[test]
fn query_filters_and_orders_by_confidence() {
    let store = CapsuleStore::new(test_db());
    store
        .store(record(json!({"topic": "rust parsing"}), &["rust"], 0.9))
        .expect("a");
    store
        .store(record(json!({"topic": "rust networking"}), &["rust", "net"], 0.6))
        .expect("b");
    store
        .store(record(json!({"topic": "go tooling"}), &["go"], 0.95))
        .expect("c");

    let rust_only = store
        .query(&CapsuleFilter {
            tags: vec!["rust".into()],
            ..Default::default()
        })
        .expect("query");
    assert_eq!(rust_only.len(), 2);
    assert!(rust_only[0].confidence >= rust_only[1].confidence);

    let confident = store
        .query(&CapsuleFilter {
            min_confidence: Some(0.9),
            ..Default::default()
        })
        .expect("query");
    assert_eq!(confident.len(), 2);

    let limited = store
        .query(&CapsuleFilter {
            limit: Some(1),
            ..Default::default()
        })
        .expect("query");
    assert_eq!(limited.len(), 1);
    assert_eq!(limited[0].confidence, 0.95);

    // Identical store contents yield an identical order.
    let first = store.query(&CapsuleFilter::default()).expect("q1");
    let second = store.query(&CapsuleFilter::default()).expect("q2");
    let ids1: Vec<_> = first.iter().map(|r| r.asset_id.clone()).collect();
    let ids2: Vec<_> = second.iter().map(|r| r.asset_id.clone()).collect();
    assert_eq!(ids1, ids2);
}

#[test]
fn search_matches_substrings_case_insensitively() {
    let store = CapsuleStore::new(test_db());
    store
        .store(record(json!({"note": "Tokenizer for Markdown"}), &[], 0.5))
        .expect("store");
    assert_eq!(store.search("markdown").expect("search").len(), 1);
    assert_eq!(store.search("MARKDOWN").expect("search").len(), 1);
    assert!(store.search("yaml").expect("search").is_empty());
}

#[test]
fn public_view_nulls_content_and_access_is_per_buyer() {
    let store = CapsuleStore::new(test_db());
    let stored = store
        .store(record(json!({"secret": "steps"}), &[], 0.5))
        .expect("store");
    let view = CapsuleStore::public_view(&stored);
    assert!(view.content.is_none());
    assert!(view.content_hash.is_some());

    assert!(!store.has_access(&stored.asset_id, "acct_buyer0000000000"));
    store
        .grant_access(&stored.asset_id, "acct_buyer0000000000")
        .expect("grant");
    assert!(store.has_access(&stored.asset_id, "acct_buyer0000000000"));
    assert!(!store.has_access(&stored.asset_id, "acct_other0000000000"));
}
