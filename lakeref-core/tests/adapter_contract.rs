//! Behavior every backend must share
//!
//! Each check runs once against the in-memory adapter and once against a
//! SQLite database file.

use lakeref_core::{
    reconstruct_keys, AdapterConfig, CommitParams, ContentId, DatabaseAdapter, Hash,
    InMemoryAdapter, Key, KeyWithBytes, NamedRef, NamedRefsParams, ScanAcceleration,
    SqliteAdapter, StoreError,
};
use std::sync::{Arc, Barrier};
use std::thread;
use tempfile::TempDir;

struct Fixture {
    adapter: Arc<dyn DatabaseAdapter>,
    _dir: Option<TempDir>,
}

fn test_config() -> AdapterConfig {
    AdapterConfig::default()
        .with_key_list_distance(3)
        .with_parents_per_commit(4)
        .with_scan_page_size(2)
}

fn memory_fixture() -> Fixture {
    Fixture {
        adapter: Arc::new(InMemoryAdapter::new(test_config())),
        _dir: None,
    }
}

fn sqlite_fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let adapter = SqliteAdapter::open(&dir.path().join("repo.sqlite"), test_config()).unwrap();
    Fixture {
        adapter: Arc::new(adapter),
        _dir: Some(dir),
    }
}

fn put(name: &str, cid: &str) -> KeyWithBytes {
    KeyWithBytes::of(
        Key::of(["warehouse", name]),
        ContentId::of(cid),
        1,
        format!("state of {}", name).into_bytes(),
    )
}

fn commit_on(adapter: &dyn DatabaseAdapter, branch: &str, label: &str) -> Hash {
    adapter
        .commit(CommitParams::new(branch, label.as_bytes().to_vec()).with_put(put(label, label)))
        .unwrap()
}

fn check_initialize_and_erase(adapter: &dyn DatabaseAdapter) {
    adapter.initialize_repo("main").unwrap();
    let main = adapter.named_ref("main").unwrap();
    assert_eq!(main.named_ref, NamedRef::branch("main"));
    assert_eq!(main.hash, adapter.no_ancestor_hash());

    assert!(matches!(
        adapter.initialize_repo("main"),
        Err(StoreError::RepositoryAlreadyInitialized)
    ));

    commit_on(adapter, "main", "a");
    adapter.erase_repo().unwrap();
    assert_eq!(adapter.named_refs(&NamedRefsParams::default()).unwrap().count(), 0);
    assert_eq!(adapter.scan_all_commit_log_entries().unwrap().count(), 0);

    adapter.initialize_repo("trunk").unwrap();
    assert!(adapter.named_ref("trunk").is_ok());
}

fn check_create_and_delete(adapter: &dyn DatabaseAdapter) {
    adapter.initialize_repo("main").unwrap();
    let root = adapter.no_ancestor_hash();
    let head = commit_on(adapter, "main", "a");

    assert_eq!(adapter.create(&NamedRef::tag("v1"), head).unwrap(), head);
    adapter.create(&NamedRef::branch("dev"), root).unwrap();
    assert!(matches!(
        adapter.create(&NamedRef::branch("v1"), head),
        Err(StoreError::ReferenceAlreadyExists(_))
    ));
    assert!(matches!(
        adapter.create(&NamedRef::branch("ghost"), Hash::from_data(b"unknown")),
        Err(StoreError::ReferenceNotFound(_))
    ));
    assert!(matches!(
        adapter.create(&NamedRef::branch(""), root),
        Err(StoreError::InvalidReferenceName(_))
    ));

    match adapter.delete(&NamedRef::tag("v1"), Some(root)) {
        Err(StoreError::ReferenceConflict { actual, .. }) => assert_eq!(actual, head),
        other => panic!("expected conflict, got {:?}", other),
    }
    // kind must match
    assert!(matches!(
        adapter.delete(&NamedRef::branch("v1"), None),
        Err(StoreError::ReferenceNotFound(_))
    ));
    adapter.delete(&NamedRef::tag("v1"), Some(head)).unwrap();
    adapter.delete(&NamedRef::branch("dev"), None).unwrap();
    assert!(matches!(
        adapter.delete(&NamedRef::branch("dev"), None),
        Err(StoreError::ReferenceNotFound(_))
    ));
}

fn check_commit_chain(adapter: &dyn DatabaseAdapter) {
    adapter.initialize_repo("main").unwrap();
    let h1 = commit_on(adapter, "main", "a");
    let h2 = commit_on(adapter, "main", "b");
    let h3 = commit_on(adapter, "main", "c");

    let e3 = adapter.fetch_commit(&h3).unwrap().unwrap();
    assert_eq!(e3.parents, vec![h2]);
    assert_eq!(e3.commit_seq, 3);
    assert_eq!(
        e3.acceleration.ancestors,
        vec![h2, h1, adapter.no_ancestor_hash()]
    );
    assert!(e3.verify_hash());

    let scanned: Vec<Hash> = adapter
        .scan_all_commit_log_entries()
        .unwrap()
        .map(|e| e.unwrap().hash)
        .collect();
    let mut expected = vec![h1, h2, h3];
    expected.sort();
    assert_eq!(scanned, expected);

    adapter.create(&NamedRef::tag("v1"), h1).unwrap();
    adapter.create(&NamedRef::branch("release/1"), h2).unwrap();
    let names: Vec<String> = adapter
        .named_refs(&NamedRefsParams::default())
        .unwrap()
        .map(|r| r.unwrap().named_ref.name().to_string())
        .collect();
    assert_eq!(names, vec!["main", "release/1", "v1"]);

    let branches = adapter
        .named_refs(&NamedRefsParams::branches_only().with_prefix("release/"))
        .unwrap()
        .count();
    assert_eq!(branches, 1);
}

fn check_expected_head(adapter: &dyn DatabaseAdapter) {
    adapter.initialize_repo("main").unwrap();
    let root = adapter.no_ancestor_hash();
    let h1 = adapter
        .commit(
            CommitParams::new("main", b"first".to_vec())
                .with_expected_head(root)
                .with_put(put("a", "a")),
        )
        .unwrap();

    let stale = adapter.commit(
        CommitParams::new("main", b"stale".to_vec())
            .with_expected_head(root)
            .with_put(put("b", "b")),
    );
    match stale {
        Err(e @ StoreError::ReferenceConflict { .. }) => {
            assert!(e.is_retriable());
            if let StoreError::ReferenceConflict { actual, .. } = e {
                assert_eq!(actual, h1);
            }
        }
        other => panic!("expected conflict, got {:?}", other),
    }
    assert_eq!(adapter.named_ref("main").unwrap().hash, h1);
    assert_eq!(adapter.scan_all_commit_log_entries().unwrap().count(), 1);

    assert!(matches!(
        adapter.commit(CommitParams::new("nope", b"x".to_vec())),
        Err(StoreError::ReferenceNotFound(_))
    ));
}

fn check_identical_commits_deduplicate(adapter: &dyn DatabaseAdapter) {
    adapter.initialize_repo("main").unwrap();
    let base = commit_on(adapter, "main", "base");
    adapter.create(&NamedRef::branch("twin"), base).unwrap();

    let a = commit_on(adapter, "main", "same");
    let b = commit_on(adapter, "twin", "same");
    assert_eq!(a, b);
    assert_eq!(adapter.named_ref("twin").unwrap().hash, a);
    assert_eq!(adapter.scan_all_commit_log_entries().unwrap().count(), 2);
}

fn check_merge_and_duplicate_keys(adapter: &dyn DatabaseAdapter) {
    adapter.initialize_repo("main").unwrap();
    let base = commit_on(adapter, "main", "base");
    adapter.create(&NamedRef::branch("feature"), base).unwrap();
    let feature = commit_on(adapter, "feature", "f1");
    commit_on(adapter, "main", "m1");

    let merge = adapter
        .commit(CommitParams::new("main", b"merge".to_vec()).with_additional_parent(feature))
        .unwrap();
    let entry = adapter.fetch_commit(&merge).unwrap().unwrap();
    assert_eq!(entry.additional_parents(), &[feature]);
    assert_eq!(entry.commit_seq, 3);

    assert!(matches!(
        adapter.commit(
            CommitParams::new("main", b"bad merge".to_vec())
                .with_additional_parent(Hash::from_data(b"missing"))
        ),
        Err(StoreError::CommitNotFound(_))
    ));
    assert!(matches!(
        adapter.commit(
            CommitParams::new("main", b"dup".to_vec())
                .with_put(put("x", "1"))
                .with_put(put("x", "2"))
        ),
        Err(StoreError::DuplicateKeyConflict { .. })
    ));
    assert!(matches!(
        adapter.commit(
            CommitParams::new("main", b"double delete".to_vec())
                .with_delete(Key::of(["warehouse", "base"]))
                .with_delete(Key::of(["warehouse", "base"]))
        ),
        Err(StoreError::DuplicateKeyConflict { .. })
    ));
    assert_eq!(adapter.named_ref("main").unwrap().hash, merge);
}

fn check_key_lists(adapter: &dyn DatabaseAdapter) {
    adapter.initialize_repo("main").unwrap();
    let mut head = adapter.no_ancestor_hash();
    for i in 0..7 {
        let mut params = CommitParams::new("main", format!("c{}", i).into_bytes())
            .with_put(put(&format!("t{}", i), &format!("cid-{}", i)));
        if i == 4 {
            params = params.with_delete(Key::of(["warehouse", "t1"]));
        }
        head = adapter.commit(params).unwrap();
    }

    let entry = adapter.fetch_commit(&head).unwrap().unwrap();
    assert_eq!(entry.acceleration.key_list_distance, 1);

    let lookup = |h: &Hash| adapter.fetch_commit(h);
    let keys = reconstruct_keys(&lookup, head).unwrap();
    assert_eq!(keys.len(), 6);
    assert!(!keys.contains(&Key::of(["warehouse", "t1"])));
    assert_eq!(
        keys.get(&Key::of(["warehouse", "t6"])).unwrap().commit_id,
        head
    );
}

fn check_raw_writes_and_acceleration(adapter: &dyn DatabaseAdapter) {
    adapter.initialize_repo("main").unwrap();
    let h1 = commit_on(adapter, "main", "a");
    let original = adapter.fetch_commit(&h1).unwrap().unwrap();

    // existing hashes are left untouched
    adapter.write_commits(&[original.without_acceleration()]).unwrap();
    assert_eq!(adapter.fetch_commit(&h1).unwrap().unwrap(), original);

    let empty = ScanAcceleration::default();
    assert!(adapter
        .update_acceleration(&h1, &original.acceleration, &empty)
        .unwrap());
    assert!(!adapter
        .update_acceleration(&h1, &original.acceleration, &empty)
        .unwrap());
    let stored = adapter.fetch_commit(&h1).unwrap().unwrap();
    assert!(stored.acceleration.is_empty());
    assert_eq!(stored.hash, h1);

    // stale expectation
    assert!(matches!(
        adapter.update_acceleration(&h1, &original.acceleration, &ScanAcceleration {
            key_list_distance: 9,
            ..ScanAcceleration::default()
        }),
        Err(StoreError::ConcurrentAccelerationUpdate(_))
    ));
    assert!(adapter
        .update_acceleration(&h1, &empty, &original.acceleration)
        .unwrap());
    assert_eq!(adapter.fetch_commit(&h1).unwrap().unwrap(), original);
    assert!(matches!(
        adapter.update_acceleration(&Hash::from_data(b"missing"), &empty, &empty),
        Err(StoreError::CommitNotFound(_))
    ));
}

fn check_concurrent_commits(adapter: Arc<dyn DatabaseAdapter>) {
    adapter.initialize_repo("main").unwrap();
    let root = adapter.no_ancestor_hash();
    let writers = 8;
    let barrier = Arc::new(Barrier::new(writers));

    let handles: Vec<_> = (0..writers)
        .map(|i| {
            let adapter = Arc::clone(&adapter);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                adapter.commit(
                    CommitParams::new("main", format!("writer {}", i).into_bytes())
                        .with_expected_head(root)
                        .with_put(put(&format!("w{}", i), "w")),
                )
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let winners: Vec<Hash> = results.iter().filter_map(|r| r.as_ref().ok().copied()).collect();
    assert_eq!(winners.len(), 1);
    for result in &results {
        if let Err(e) = result {
            assert!(matches!(e, StoreError::ReferenceConflict { .. }));
        }
    }
    assert_eq!(adapter.named_ref("main").unwrap().hash, winners[0]);
    assert_eq!(adapter.scan_all_commit_log_entries().unwrap().count(), 1);
}

macro_rules! contract_tests {
    ($backend:ident, $fixture:ident) => {
        mod $backend {
            use super::*;

            #[test]
            fn initialize_and_erase() {
                check_initialize_and_erase($fixture().adapter.as_ref());
            }

            #[test]
            fn create_and_delete() {
                check_create_and_delete($fixture().adapter.as_ref());
            }

            #[test]
            fn commit_chain() {
                check_commit_chain($fixture().adapter.as_ref());
            }

            #[test]
            fn expected_head() {
                check_expected_head($fixture().adapter.as_ref());
            }

            #[test]
            fn identical_commits_deduplicate() {
                check_identical_commits_deduplicate($fixture().adapter.as_ref());
            }

            #[test]
            fn merge_and_duplicate_keys() {
                check_merge_and_duplicate_keys($fixture().adapter.as_ref());
            }

            #[test]
            fn key_lists() {
                check_key_lists($fixture().adapter.as_ref());
            }

            #[test]
            fn raw_writes_and_acceleration() {
                check_raw_writes_and_acceleration($fixture().adapter.as_ref());
            }

            #[test]
            fn concurrent_commits() {
                let fixture = $fixture();
                check_concurrent_commits(Arc::clone(&fixture.adapter));
            }
        }
    };
}

contract_tests!(memory, memory_fixture);
contract_tests!(sqlite, sqlite_fixture);
