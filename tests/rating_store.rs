// tests/rating_store.rs
use capsule_mesh::rating::RatingStore;
use capsule_mesh::storage::{self, MeshDb};
use uuid::Uuid;

fn test_db() -> MeshDb {
    let path = std::env::temp_dir().join(format!("mesh_rating_{}", Uuid::new_v4()));
    storage::open_db(path.to_str().expect("utf8 path"))
}

const TARGET_MS: i64 = 30 * 60 * 1000;

#[test]
fn first_completion_seeds_the_ewma() {
    let store = RatingStore::new(test_db());
    let record = store
        .record_completion("node_a", TARGET_MS)
        .expect("completion");
    assert_eq!(record.completed, 1);
    assert_eq!(record.ewma, 10_000.0);
    // score = ewma + 2*completed
    assert_eq!(record.score, 10_002);
}

#[test]
fn later_completions_blend_with_alpha() {
    let store = RatingStore::new(test_db());
    store.record_completion("node_a", TARGET_MS).expect("first");
    // Second sample at half speed: 0.2 * 5000 + 0.8 * 10000 = 9000.
    let record = store
        .record_completion("node_a", TARGET_MS * 2)
        .expect("second");
    assert_eq!(record.completed, 2);
    assert!((record.ewma - 9_000.0).abs() < 1e-9);
}

#[test]
fn failures_pull_the_score_down() {
    let store = RatingStore::new(test_db());
    store.record_completion("node_a", TARGET_MS).expect("ok");
    let before = store.get("node_a").expect("get").score;
    let after = store.record_failure("node_a").expect("failure").score;
    assert_eq!(before - after, 10);
}

#[test]
fn likes_are_unique_per_task() {
    let store = RatingStore::new(test_db());
    assert!(store
        .add_like("task_1", "node_w", "node_a")
        .expect("first like"));
    // Second like for the same task is refused regardless of liker.
    assert!(!store
        .add_like("task_1", "node_w", "node_b")
        .expect("duplicate like"));
    assert_eq!(store.get("node_w").expect("get").likes, 1);

    assert!(store
        .add_like("task_2", "node_w", "node_a")
        .expect("other task"));
    assert_eq!(store.get("node_w").expect("get").likes, 2);
}

#[test]
fn disqualification_needs_history_and_low_score() {
    let store = RatingStore::new(test_db());
    // Fresh nodes are never disqualified.
    assert!(!store.is_disqualified("node_new"));

    // Ten completions with many failures: enough history, low score.
    for _ in 0..10 {
        store.record_completion("node_bad", TARGET_MS * 10_000).expect("slow");
    }
    for _ in 0..5 {
        store.record_failure("node_bad").expect("failure");
    }
    let record = store.get("node_bad").expect("get");
    assert!(record.completed >= 10);
    assert!(record.score < 10);
    assert!(store.is_disqualified("node_bad"));

    // A healthy node with the same history volume stays eligible.
    for _ in 0..10 {
        store.record_completion("node_good", TARGET_MS).expect("fast");
    }
    assert!(!store.is_disqualified("node_good"));
}
