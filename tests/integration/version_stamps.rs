//! Version stamp semantics: the per-key write counter used by callers for
//! optimistic concurrency control.

use vellum::{Env, Options};

fn env() -> Env {
    Env::open_memory(Options::default()).expect("open memory env")
}

#[test]
fn missing_entries_return_zero_version() {
    let env = env();
    let mut tx = env.begin_write().unwrap();
    let tree = tx.create_tree("root").unwrap();
    assert_eq!(tx.read_version(&tree, b"key/1").unwrap(), 0);
}

#[test]
fn simple_version() {
    let env = env();
    {
        let mut tx = env.begin_write().unwrap();
        let tree = tx.create_tree("root").unwrap();
        tx.put(&tree, b"key/1", b"123").unwrap();
        assert_eq!(tx.read_version(&tree, b"key/1").unwrap(), 1);
        tx.put(&tree, b"key/1", b"123").unwrap();
        assert_eq!(tx.read_version(&tree, b"key/1").unwrap(), 2);
        tx.commit().unwrap();
    }

    let tx = env.begin_read().unwrap();
    let tree = tx.open_tree("root").unwrap();
    assert_eq!(tx.read_version(&tree, b"key/1").unwrap(), 2);
}

#[test]
fn version_overflow_wraps_past_zero() {
    let env = env();
    let mut tx = env.begin_write().unwrap();
    let tree = tx.create_tree("root").unwrap();

    // 65537 successive writes: versions run 1..=65535, wrap to 1, then 2.
    // Zero is skipped forever once a key exists.
    for i in 1u32..=65537 {
        tx.put(&tree, b"key/1", b"123").unwrap();
        let expected = ((i - 1) % 65535 + 1) as u16;
        assert_eq!(
            tx.read_version(&tree, b"key/1").unwrap(),
            expected,
            "write #{i}"
        );
    }
    assert_eq!(tx.read_version(&tree, b"key/1").unwrap(), 2);
    tx.commit().unwrap();

    let tx = env.begin_read().unwrap();
    let tree = tx.open_tree("root").unwrap();
    assert_eq!(tx.read_version(&tree, b"key/1").unwrap(), 2);
}

#[test]
fn uncommitted_versions_are_private() {
    let env = env();
    {
        let mut setup = env.begin_write().unwrap();
        setup.create_tree("root").unwrap();
        setup.commit().unwrap();
    }

    let mut tx = env.begin_write().unwrap();
    let tree = tx.open_tree("root").unwrap();
    tx.put(&tree, b"key/1", b"123").unwrap();
    assert_eq!(tx.read_version(&tree, b"key/1").unwrap(), 1);
    tx.put(&tree, b"key/1", b"123").unwrap();
    assert_eq!(tx.read_version(&tree, b"key/1").unwrap(), 2);

    // A concurrently opened reader sees no trace of the uncommitted writes.
    let reader = env.begin_read().unwrap();
    let reader_tree = reader.open_tree("root").unwrap();
    assert_eq!(reader.read_version(&reader_tree, b"key/1").unwrap(), 0);

    // Rolling back leaves the key never-written.
    tx.rollback();
    let reader = env.begin_read().unwrap();
    let reader_tree = reader.open_tree("root").unwrap();
    assert_eq!(reader.read_version(&reader_tree, b"key/1").unwrap(), 0);
}

#[test]
fn delete_resets_version_to_zero() {
    let env = env();
    let mut tx = env.begin_write().unwrap();
    let tree = tx.create_tree("root").unwrap();

    tx.put(&tree, b"key/1", b"123").unwrap();
    assert_eq!(tx.read_version(&tree, b"key/1").unwrap(), 1);

    assert!(tx.delete(&tree, b"key/1").unwrap());
    assert_eq!(tx.read_version(&tree, b"key/1").unwrap(), 0);

    // Rewriting after a delete restarts the sequence; the deleted state is
    // indistinguishable from never-written.
    tx.put(&tree, b"key/1", b"456").unwrap();
    assert_eq!(tx.read_version(&tree, b"key/1").unwrap(), 1);
}

#[test]
fn committed_delete_resets_across_transactions() {
    let env = env();
    {
        let mut tx = env.begin_write().unwrap();
        let tree = tx.create_tree("root").unwrap();
        tx.put(&tree, b"key/1", b"123").unwrap();
        tx.put(&tree, b"key/1", b"123").unwrap();
        tx.put(&tree, b"key/1", b"123").unwrap();
        tx.commit().unwrap();
    }
    {
        let mut tx = env.begin_write().unwrap();
        let tree = tx.open_tree("root").unwrap();
        assert_eq!(tx.read_version(&tree, b"key/1").unwrap(), 3);
        assert!(tx.delete(&tree, b"key/1").unwrap());
        tx.commit().unwrap();
    }
    {
        let tx = env.begin_read().unwrap();
        let tree = tx.open_tree("root").unwrap();
        assert_eq!(tx.read_version(&tree, b"key/1").unwrap(), 0);
    }
    {
        let mut tx = env.begin_write().unwrap();
        let tree = tx.open_tree("root").unwrap();
        tx.put(&tree, b"key/1", b"fresh").unwrap();
        assert_eq!(tx.read_version(&tree, b"key/1").unwrap(), 1);
        tx.commit().unwrap();
    }
}

#[test]
fn versions_are_independent_per_key() {
    let env = env();
    let mut tx = env.begin_write().unwrap();
    let tree = tx.create_tree("root").unwrap();
    for _ in 0..3 {
        tx.put(&tree, b"hot", b"x").unwrap();
    }
    tx.put(&tree, b"cold", b"y").unwrap();
    assert_eq!(tx.read_version(&tree, b"hot").unwrap(), 3);
    assert_eq!(tx.read_version(&tree, b"cold").unwrap(), 1);
    assert_eq!(tx.read_version(&tree, b"missing").unwrap(), 0);
}
