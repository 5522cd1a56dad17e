//! Snapshot isolation: readers pin the committed state they opened against
//! and never observe later or uncommitted writes.

use vellum::{Env, Options};

fn env_with_tree() -> Env {
    let env = Env::open_memory(Options::default()).expect("open memory env");
    let mut tx = env.begin_write().unwrap();
    tx.create_tree("docs").unwrap();
    tx.commit().unwrap();
    env
}

#[test]
fn reader_does_not_see_uncommitted_writes() {
    let env = env_with_tree();

    let mut writer = env.begin_write().unwrap();
    let tree = writer.open_tree("docs").unwrap();
    writer.put(&tree, b"a", b"uncommitted").unwrap();

    let reader = env.begin_read().unwrap();
    let rtree = reader.open_tree("docs").unwrap();
    assert_eq!(reader.get(&rtree, b"a").unwrap(), None);

    writer.commit().unwrap();

    // The reader's snapshot predates the commit and stays unchanged.
    assert_eq!(reader.get(&rtree, b"a").unwrap(), None);

    // A fresh reader sees the committed value.
    let fresh = env.begin_read().unwrap();
    let ftree = fresh.open_tree("docs").unwrap();
    assert_eq!(fresh.get(&ftree, b"a").unwrap().unwrap().as_ref(), b"uncommitted");
}

#[test]
fn reader_outlives_overwrites_of_its_snapshot() {
    let env = env_with_tree();
    {
        let mut tx = env.begin_write().unwrap();
        let tree = tx.open_tree("docs").unwrap();
        tx.put(&tree, b"k", b"v1").unwrap();
        tx.commit().unwrap();
    }

    let reader = env.begin_read().unwrap();
    let rtree = reader.open_tree("docs").unwrap();

    for generation in 2..=20u32 {
        let mut tx = env.begin_write().unwrap();
        let tree = tx.open_tree("docs").unwrap();
        tx.put(&tree, b"k", format!("v{generation}").as_bytes()).unwrap();
        tx.commit().unwrap();
    }

    // Twenty commits later the old snapshot still reads its own version.
    assert_eq!(reader.get(&rtree, b"k").unwrap().unwrap().as_ref(), b"v1");
    assert_eq!(reader.read_version(&rtree, b"k").unwrap(), 1);

    let fresh = env.begin_read().unwrap();
    let ftree = fresh.open_tree("docs").unwrap();
    assert_eq!(fresh.get(&ftree, b"k").unwrap().unwrap().as_ref(), b"v20");
    assert_eq!(fresh.read_version(&ftree, b"k").unwrap(), 20);
}

#[test]
fn reader_does_not_see_trees_created_later() {
    let env = env_with_tree();
    let reader = env.begin_read().unwrap();

    let mut tx = env.begin_write().unwrap();
    tx.create_tree("later").unwrap();
    tx.commit().unwrap();

    assert!(reader.open_tree("later").is_none());
    let fresh = env.begin_read().unwrap();
    assert!(fresh.open_tree("later").is_some());
}

#[test]
fn snapshot_scans_are_stable_across_commits() {
    let env = env_with_tree();
    {
        let mut tx = env.begin_write().unwrap();
        let tree = tx.open_tree("docs").unwrap();
        for i in 0..100u32 {
            tx.put(&tree, format!("key{i:04}").as_bytes(), &i.to_be_bytes())
                .unwrap();
        }
        tx.commit().unwrap();
    }

    let reader = env.begin_read().unwrap();
    let rtree = reader.open_tree("docs").unwrap();

    {
        let mut tx = env.begin_write().unwrap();
        let tree = tx.open_tree("docs").unwrap();
        for i in 0..100u32 {
            if i % 2 == 0 {
                tx.delete(&tree, format!("key{i:04}").as_bytes()).unwrap();
            }
        }
        tx.put(&tree, b"key9999", b"new").unwrap();
        tx.commit().unwrap();
    }

    let keys: Vec<_> = reader
        .scan(&rtree)
        .unwrap()
        .map(|kv| kv.unwrap().0)
        .collect();
    assert_eq!(keys.len(), 100, "old snapshot sees all 100 entries");
    assert!(keys.windows(2).all(|w| w[0] < w[1]), "strictly increasing");

    let fresh = env.begin_read().unwrap();
    let ftree = fresh.open_tree("docs").unwrap();
    assert_eq!(fresh.scan(&ftree).unwrap().count(), 51);
}

#[test]
fn rollback_leaves_no_trace() {
    let env = env_with_tree();
    let before = env.last_txid();
    {
        let mut tx = env.begin_write().unwrap();
        let tree = tx.open_tree("docs").unwrap();
        for i in 0..50u32 {
            tx.put(&tree, &i.to_be_bytes(), b"payload").unwrap();
        }
        // Dropped without commit.
    }
    assert_eq!(env.last_txid(), before);
    let reader = env.begin_read().unwrap();
    let tree = reader.open_tree("docs").unwrap();
    assert!(reader.is_empty(&tree).unwrap());
}
