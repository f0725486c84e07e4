use super::*;
use anyhow::Result;
use tempfile::tempdir;

#[test]
fn indexed_set_find_update_and_remove() -> Result<()> {
    let dir = tempdir()?;
    let store = Store::open(dir.path(), small_opts())?;

    store.set_with_index(b"KeyA", b"ValueA:1", &[("Idx", b"1")])?;
    store.set_with_index(b"KeyB", b"ValueB:2", &[("Idx", b"2")])?;
    store.set_with_index(b"KeyC", b"ValueC:3", &[("Idx", b"3")])?;

    let found = store.find("Idx", b"3")?;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].0, &b"KeyC"[..]);
    assert_eq!(found[0].1, &b"ValueC:3"[..]);

    // re-index KeyC under "4" and retire the stale "3" entry
    store.set_with_index(b"KeyC", b"ValueC:4", &[("Idx", b"4")])?;
    store.remove_from_index(b"KeyC", &[("Idx", b"3")])?;

    assert!(store.find("Idx", b"3")?.is_empty());
    let found = store.find("Idx", b"4")?;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].0, &b"KeyC"[..]);
    assert_eq!(found[0].1, &b"ValueC:4"[..]);
    store.close()?;
    Ok(())
}

#[test]
fn find_matches_exactly_not_by_prefix() -> Result<()> {
    let dir = tempdir()?;
    let store = Store::open(dir.path(), small_opts())?;

    store.set_with_index(b"short", b"v1", &[("Idx", b"3")])?;
    store.set_with_index(b"long", b"v2", &[("Idx", b"30")])?;

    let found = store.find("Idx", b"3")?;
    assert_eq!(found.len(), 1, "\"30\" must not match a find for \"3\"");
    assert_eq!(found[0].0, &b"short"[..]);

    let found = store.find("Idx", b"30")?;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].0, &b"long"[..]);
    store.close()?;
    Ok(())
}

#[test]
fn find_starts_with_spans_prefixes() -> Result<()> {
    let dir = tempdir()?;
    let store = Store::open(dir.path(), small_opts())?;

    store.set_with_index(b"a", b"1", &[("city", b"berlin")])?;
    store.set_with_index(b"b", b"2", &[("city", b"bern")])?;
    store.set_with_index(b"c", b"3", &[("city", b"boston")])?;

    let mut found: Vec<Vec<u8>> = store
        .find_starts_with("city", b"ber")?
        .into_iter()
        .map(|(k, _)| k.to_vec())
        .collect();
    found.sort();
    assert_eq!(found, vec![b"a".to_vec(), b"b".to_vec()]);

    assert_eq!(store.find_starts_with("city", b"b")?.len(), 3);
    assert!(store.find_starts_with("city", b"x")?.is_empty());
    store.close()?;
    Ok(())
}

#[test]
fn stale_entries_resolve_to_current_values_until_cleaned() -> Result<()> {
    let dir = tempdir()?;
    let store = Store::open(dir.path(), small_opts())?;

    store.set_with_index(b"k", b"old", &[("Idx", b"tag")])?;
    store.set(b"k", b"new")?; // plain overwrite leaves the index entry

    let found = store.find("Idx", b"tag")?;
    assert_eq!(found[0].1, &b"new"[..], "stale entry resolves through the main store");

    store.delete(b"k")?;
    assert!(store.find("Idx", b"tag")?.is_empty(), "dead keys drop out of results");

    assert_eq!(store.clean_index("Idx")?, 1, "one dangling entry removed");
    assert_eq!(store.clean_index("Idx")?, 0, "clean is idempotent");
    store.close()?;
    Ok(())
}

#[test]
fn indexes_persist_across_reopen() -> Result<()> {
    let dir = tempdir()?;
    {
        let store = Store::open(dir.path(), small_opts())?;
        store.set_with_index(b"KeyA", b"ValueA", &[("Idx", b"1")])?;
        store.close()?;
    }
    assert!(dir.path().join("Idx").is_dir(), "index lives in a nested store directory");

    let store = Store::open(dir.path(), small_opts())?;
    let found = store.find("Idx", b"1")?;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].0, &b"KeyA"[..]);
    store.close()?;
    Ok(())
}

#[test]
fn multiple_indexes_per_record() -> Result<()> {
    let dir = tempdir()?;
    let store = Store::open(dir.path(), small_opts())?;

    store.set_with_index(b"user1", b"alice", &[("city", b"berlin"), ("role", b"admin")])?;
    store.set_with_index(b"user2", b"bob", &[("city", b"berlin"), ("role", b"guest")])?;

    assert_eq!(store.find("city", b"berlin")?.len(), 2);
    assert_eq!(store.find("role", b"admin")?.len(), 1);
    assert_eq!(store.find("role", b"admin")?[0].1, &b"alice"[..]);
    store.close()?;
    Ok(())
}

#[test]
fn invalid_index_names_are_rejected() -> Result<()> {
    let dir = tempdir()?;
    let store = Store::open(dir.path(), small_opts())?;
    for bad in ["", "../escape", "a/b", "dot.dot"] {
        let err = store.set_with_index(b"k", b"v", &[(bad, b"x")]).unwrap_err();
        assert!(err.to_string().contains("invalid index name"), "{bad}: {err}");
    }
    store.close()?;
    Ok(())
}
