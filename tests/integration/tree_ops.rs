//! Tree operations end to end: round-trips, large values, range scans,
//! multiple named trees, capacity limits.

use tempfile::tempdir;
use vellum::{Env, Options, VellumError};

fn env() -> Env {
    Env::open_memory(Options::default()).expect("open memory env")
}

#[test]
fn put_get_delete_roundtrip() {
    let env = env();
    let mut tx = env.begin_write().unwrap();
    let tree = tx.create_tree("docs").unwrap();

    assert_eq!(tx.get(&tree, b"k").unwrap(), None);
    tx.put(&tree, b"k", b"v1").unwrap();
    assert_eq!(tx.get(&tree, b"k").unwrap().unwrap().as_ref(), b"v1");

    tx.put(&tree, b"k", b"v2").unwrap();
    assert_eq!(tx.get(&tree, b"k").unwrap().unwrap().as_ref(), b"v2");

    assert!(tx.delete(&tree, b"k").unwrap());
    assert_eq!(tx.get(&tree, b"k").unwrap(), None);
    assert!(!tx.delete(&tree, b"k").unwrap());
}

#[test]
fn inserts_split_across_many_pages() {
    let env = env();
    let mut tx = env.begin_write().unwrap();
    let tree = tx.create_tree("docs").unwrap();

    // Enough entries to force several levels of splits.
    for i in 0..5000u32 {
        let key = format!("key-{i:06}");
        tx.put(&tree, key.as_bytes(), &i.to_be_bytes()).unwrap();
    }
    tx.commit().unwrap();

    let tx = env.begin_read().unwrap();
    let tree = tx.open_tree("docs").unwrap();
    assert_eq!(tx.len(&tree).unwrap(), 5000);
    for i in (0..5000u32).step_by(97) {
        let key = format!("key-{i:06}");
        assert_eq!(
            tx.get(&tree, key.as_bytes()).unwrap().unwrap().as_ref(),
            &i.to_be_bytes()
        );
    }
}

#[test]
fn full_scan_yields_strictly_increasing_keys() {
    let env = env();
    let mut tx = env.begin_write().unwrap();
    let tree = tx.create_tree("docs").unwrap();
    // Insert in descending order to exercise ordering on the way out.
    for i in (0..2000u32).rev() {
        tx.put(&tree, format!("{i:08}").as_bytes(), b"x").unwrap();
    }
    tx.commit().unwrap();

    let tx = env.begin_read().unwrap();
    let tree = tx.open_tree("docs").unwrap();
    let keys: Vec<_> = tx.scan(&tree).unwrap().map(|kv| kv.unwrap().0).collect();
    assert_eq!(keys.len(), 2000);
    assert!(keys.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn range_scan_bounds_are_inclusive() {
    let env = env();
    let mut tx = env.begin_write().unwrap();
    let tree = tx.create_tree("docs").unwrap();
    for key in [b"a", b"c", b"e", b"g", b"i"] {
        tx.put(&tree, key, b"v").unwrap();
    }

    let collect = |low: &[u8], high: &[u8]| -> Vec<Vec<u8>> {
        tx.scan_range(&tree, low, high)
            .unwrap()
            .map(|kv| kv.unwrap().0.to_vec())
            .collect()
    };
    assert_eq!(collect(b"c", b"g"), vec![b"c".to_vec(), b"e".to_vec(), b"g".to_vec()]);
    assert_eq!(collect(b"b", b"d"), vec![b"c".to_vec()]);
    assert_eq!(collect(b"j", b"z"), Vec::<Vec<u8>>::new());
    assert_eq!(collect(b"", b"a"), vec![b"a".to_vec()]);
}

#[test]
fn large_values_roundtrip_through_overflow_chains() {
    let env = env();
    let mut tx = env.begin_write().unwrap();
    let tree = tx.create_tree("blobs").unwrap();

    // Spans many overflow pages.
    let big: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
    tx.put(&tree, b"big", &big).unwrap();
    // Inline-threshold edge and just past it.
    let medium = vec![0x7E; Options::default().page_size as usize / 4 + 1];
    tx.put(&tree, b"medium", &medium).unwrap();
    tx.commit().unwrap();

    let tx = env.begin_read().unwrap();
    let tree = tx.open_tree("blobs").unwrap();
    assert_eq!(tx.get(&tree, b"big").unwrap().unwrap().as_ref(), &big[..]);
    assert_eq!(tx.get(&tree, b"medium").unwrap().unwrap().as_ref(), &medium[..]);

    // Overwriting a chained value frees the old chain and stores the new.
    let mut tx = env.begin_write().unwrap();
    let tree = tx.open_tree("blobs").unwrap();
    tx.put(&tree, b"big", b"tiny now").unwrap();
    tx.commit().unwrap();

    let tx = env.begin_read().unwrap();
    let tree = tx.open_tree("blobs").unwrap();
    assert_eq!(tx.get(&tree, b"big").unwrap().unwrap().as_ref(), b"tiny now");
    assert_eq!(tx.read_version(&tree, b"big").unwrap(), 2);
}

#[test]
fn named_trees_are_independent() {
    let env = env();
    let mut tx = env.begin_write().unwrap();
    let docs = tx.create_tree("docs").unwrap();
    let index = tx.create_tree("index").unwrap();

    tx.put(&docs, b"shared-key", b"from docs").unwrap();
    tx.put(&index, b"shared-key", b"from index").unwrap();
    tx.put(&index, b"shared-key", b"overwritten").unwrap();

    assert_eq!(tx.get(&docs, b"shared-key").unwrap().unwrap().as_ref(), b"from docs");
    assert_eq!(tx.read_version(&docs, b"shared-key").unwrap(), 1);
    assert_eq!(tx.read_version(&index, b"shared-key").unwrap(), 2);
    tx.commit().unwrap();

    let tx = env.begin_read().unwrap();
    assert_eq!(tx.open_tree("docs").is_some(), true);
    assert_eq!(tx.open_tree("missing").is_some(), false);
}

#[test]
fn deletes_shrink_the_tree_back_down() {
    let env = env();
    let mut tx = env.begin_write().unwrap();
    let tree = tx.create_tree("docs").unwrap();
    for i in 0..3000u32 {
        tx.put(&tree, format!("{i:08}").as_bytes(), &[0u8; 100]).unwrap();
    }
    tx.commit().unwrap();

    let mut tx = env.begin_write().unwrap();
    let tree = tx.open_tree("docs").unwrap();
    for i in 0..3000u32 {
        assert!(tx.delete(&tree, format!("{i:08}").as_bytes()).unwrap(), "{i}");
    }
    assert_eq!(tx.len(&tree).unwrap(), 0);
    assert_eq!(tx.scan(&tree).unwrap().count(), 0);
    tx.commit().unwrap();

    // The emptied tree accepts new writes starting from scratch.
    let mut tx = env.begin_write().unwrap();
    let tree = tx.open_tree("docs").unwrap();
    tx.put(&tree, b"again", b"fresh").unwrap();
    assert_eq!(tx.read_version(&tree, b"again").unwrap(), 1);
    tx.commit().unwrap();
}

#[test]
fn freed_pages_are_reused_after_readers_release() {
    let env = env();
    // Churn the same keys across commits; without reclamation the file would
    // grow by a full copy-on-write path per commit forever.
    for round in 0..20u32 {
        let mut tx = env.begin_write().unwrap();
        let tree = tx.create_tree("docs").unwrap();
        for i in 0..50u32 {
            tx.put(&tree, &i.to_be_bytes(), &round.to_be_bytes()).unwrap();
        }
        tx.commit().unwrap();
    }
    let tx = env.begin_read().unwrap();
    let tree = tx.open_tree("docs").unwrap();
    assert_eq!(tx.len(&tree).unwrap(), 50);
    for i in 0..50u32 {
        assert_eq!(
            tx.get(&tree, &i.to_be_bytes()).unwrap().unwrap().as_ref(),
            &19u32.to_be_bytes()
        );
    }
}

#[test]
fn capacity_exhaustion_aborts_but_env_stays_usable() {
    let options = Options {
        max_pages: Some(16),
        ..Options::default()
    };
    let env = Env::open_memory(options).unwrap();

    let mut tx = env.begin_write().unwrap();
    let tree = tx.create_tree("docs").unwrap();
    let mut filled = Err(VellumError::Invalid("never ran"));
    for i in 0..10_000u32 {
        filled = tx.put(&tree, format!("{i:08}").as_bytes(), &[0u8; 512]);
        if filled.is_err() {
            break;
        }
    }
    match filled {
        Err(VellumError::Capacity(_)) => {}
        other => panic!("expected capacity exhaustion, got {other:?}"),
    }
    drop(tx); // aborts

    // The failed transaction left no trace; small writes still work.
    let mut tx = env.begin_write().unwrap();
    let tree = tx.create_tree("docs").unwrap();
    tx.put(&tree, b"small", b"fits").unwrap();
    tx.commit().unwrap();

    let tx = env.begin_read().unwrap();
    let tree = tx.open_tree("docs").unwrap();
    assert_eq!(tx.len(&tree).unwrap(), 1);
}

#[test]
fn oversized_and_empty_keys_are_rejected() {
    let env = env();
    let mut tx = env.begin_write().unwrap();
    let tree = tx.create_tree("docs").unwrap();
    let too_long = vec![0u8; Options::default().page_size as usize / 16 + 1];
    assert!(matches!(
        tx.put(&tree, &too_long, b"v"),
        Err(VellumError::Invalid(_))
    ));
    assert!(matches!(
        tx.put(&tree, b"", b"v"),
        Err(VellumError::Invalid(_))
    ));
}

#[test]
fn data_persists_across_reopen_on_disk() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("persist.db");
    {
        let env = Env::open(&path, Options::default()).unwrap();
        let mut tx = env.begin_write().unwrap();
        let tree = tx.create_tree("docs").unwrap();
        for i in 0..500u32 {
            tx.put(&tree, &i.to_be_bytes(), format!("value-{i}").as_bytes())
                .unwrap();
        }
        tx.commit().unwrap();
    }
    {
        let env = Env::open(&path, Options::default()).unwrap();
        let mut tx = env.begin_write().unwrap();
        let tree = tx.open_tree("docs").expect("catalog persisted");
        tx.delete(&tree, &0u32.to_be_bytes()).unwrap();
        tx.commit().unwrap();
    }
    let env = Env::open(&path, Options::default()).unwrap();
    let tx = env.begin_read().unwrap();
    let tree = tx.open_tree("docs").unwrap();
    assert_eq!(tx.len(&tree).unwrap(), 499);
    assert_eq!(
        tx.get(&tree, &499u32.to_be_bytes()).unwrap().unwrap().as_ref(),
        b"value-499"
    );
}
