use super::*;
use crate::manifest::Manifest;
use anyhow::Result;
use blocktable::{Cache, ClosedTable, PageId, PageLocks, SortedBlockTableWriter};
use std::fs;
use std::path::Path;
use tempfile::tempdir;
use types::{Key, Value};

fn fixture(dir: &Path, opts: &StoreOptions) -> (Manifest, Arc<Cache>, Arc<PageLocks>) {
    let cache = Arc::new(Cache::new(
        opts.block_cache_capacity,
        opts.block_size,
        opts.index_cache_capacity,
    ));
    let locks = Arc::new(PageLocks::new(opts.read_lock_timeout, opts.write_lock_timeout));
    let manifest =
        Manifest::open(dir, opts, Arc::clone(&cache), Arc::clone(&locks)).unwrap();
    (manifest, cache, locks)
}

/// Writes a real (tiny) table file so reference-counted deletion has a
/// file to delete.
fn table(
    dir: &Path,
    level: u32,
    version: u64,
    first: &[u8],
    last: &[u8],
    locks: &PageLocks,
) -> ClosedTable {
    let id = PageId::new(level, version);
    let mut w = SortedBlockTableWriter::create(dir, id, 4096, locks).unwrap();
    w.add(&Key::primary(first), &Value::small(b"v")).unwrap();
    if last != first {
        w.add(&Key::primary(last), &Value::small(b"v")).unwrap();
    }
    w.close().unwrap()
}

#[test]
fn add_page_and_reload() -> Result<()> {
    let dir = tempdir()?;
    let opts = small_opts();
    {
        let (manifest, _, locks) = fixture(dir.path(), &opts);
        let v = manifest.next_version(0)?;
        manifest.add_page(&table(dir.path(), 0, v, b"aaa", b"mmm", &locks))?;
        let v = manifest.next_version(0)?;
        manifest.add_page(&table(dir.path(), 0, v, b"nnn", b"zzz", &locks))?;
    }

    let (manifest, _, _) = fixture(dir.path(), &opts);
    assert_eq!(manifest.current_version(0), 2);
    assert_eq!(manifest.page_count(0), 2);
    let current = manifest.current();
    let pages = current.pages(0);
    assert_eq!(pages[0].first_key(), &Key::primary(b"aaa"));
    assert_eq!(pages[1].last_key(), &Key::primary(b"zzz"));
    Ok(())
}

#[test]
fn next_version_is_monotonic_and_per_level() -> Result<()> {
    let dir = tempdir()?;
    let (manifest, _, _) = fixture(dir.path(), &small_opts());
    assert_eq!(manifest.next_version(0)?, 1);
    assert_eq!(manifest.next_version(0)?, 2);
    assert_eq!(manifest.next_version(1)?, 1);
    assert_eq!(manifest.current_version(0), 2);
    assert_eq!(manifest.current_version(1), 1);
    Ok(())
}

#[test]
fn find_page_uses_binary_search_on_ranges() -> Result<()> {
    let dir = tempdir()?;
    let (manifest, _, locks) = fixture(dir.path(), &small_opts());
    manifest.add_page(&table(dir.path(), 1, 1, b"bbb", b"ddd", &locks))?;
    manifest.add_page(&table(dir.path(), 1, 2, b"ggg", b"jjj", &locks))?;

    let current = manifest.current();
    assert_eq!(
        current.find_page(1, &Key::primary(b"ccc")).unwrap().version(),
        1
    );
    assert_eq!(
        current.find_page(1, &Key::primary(b"hhh")).unwrap().version(),
        2
    );
    assert!(current.find_page(1, &Key::primary(b"aaa")).is_none(), "below every range");
    assert!(current.find_page(1, &Key::primary(b"eee")).is_none(), "in the gap");
    assert!(current.find_page(1, &Key::primary(b"zzz")).is_none(), "past every range");
    Ok(())
}

// --------------------- Snapshot isolation ---------------------

#[test]
fn snapshot_is_isolated_from_modify_pages() -> Result<()> {
    let dir = tempdir()?;
    let (manifest, _, locks) = fixture(dir.path(), &small_opts());
    let old_a = table(dir.path(), 0, 1, b"a", b"m", &locks);
    let old_b = table(dir.path(), 0, 2, b"n", b"z", &locks);
    manifest.add_page(&old_a)?;
    manifest.add_page(&old_b)?;

    let before = manifest.latest();

    // one atomic transition: the merge output replaces both inputs
    let merged = table(dir.path(), 1, 1, b"a", b"z", &locks);
    manifest.modify_pages(&[merged], &[old_a.id, old_b.id])?;

    // the held snapshot still sees the pre-modification world
    assert_eq!(before.page_count(0), 2);
    assert_eq!(before.page_count(1), 0);

    // a fresh snapshot sees exactly the post-modification world
    let after = manifest.latest();
    assert_eq!(after.page_count(0), 0);
    assert_eq!(after.page_count(1), 1);
    assert_eq!(after.pages(1)[0].first_key(), &Key::primary(b"a"));
    Ok(())
}

#[test]
fn removal_of_absent_page_is_a_fatal_inconsistency() -> Result<()> {
    let dir = tempdir()?;
    let (manifest, _, _) = fixture(dir.path(), &small_opts());
    let err = manifest.modify_pages(&[], &[PageId::new(0, 99)]).unwrap_err();
    assert!(err.to_string().contains("manifest inconsistency"), "{err}");
    Ok(())
}

// --------------------- Reference-counted deletion ---------------------

#[test]
fn removed_page_survives_until_last_snapshot_drops() -> Result<()> {
    let dir = tempdir()?;
    let (manifest, _, locks) = fixture(dir.path(), &small_opts());
    let old = table(dir.path(), 0, 1, b"a", b"z", &locks);
    manifest.add_page(&old)?;
    let old_path = old.id.path(dir.path());
    assert!(old_path.exists());

    let snapshot = manifest.latest();
    let replacement = table(dir.path(), 1, 1, b"a", b"z", &locks);
    manifest.modify_pages(&[replacement], &[old.id])?;

    assert!(
        old_path.exists(),
        "file must stay while a snapshot references the removed page"
    );
    drop(snapshot);
    assert!(!old_path.exists(), "last release deletes the file");
    Ok(())
}

#[test]
fn unreferenced_removal_deletes_immediately() -> Result<()> {
    let dir = tempdir()?;
    let (manifest, _, locks) = fixture(dir.path(), &small_opts());
    let old = table(dir.path(), 0, 1, b"a", b"z", &locks);
    manifest.add_page(&old)?;
    let old_path = old.id.path(dir.path());

    manifest.modify_pages(&[], &[old.id])?;
    assert!(!old_path.exists());
    Ok(())
}

#[test]
fn two_snapshots_both_pin_a_page() -> Result<()> {
    let dir = tempdir()?;
    let (manifest, _, locks) = fixture(dir.path(), &small_opts());
    let old = table(dir.path(), 0, 1, b"a", b"z", &locks);
    manifest.add_page(&old)?;
    let old_path = old.id.path(dir.path());

    let one = manifest.latest();
    let two = manifest.latest();
    manifest.modify_pages(&[], &[old.id])?;

    drop(one);
    assert!(old_path.exists(), "second snapshot still holds the page");
    drop(two);
    assert!(!old_path.exists());
    Ok(())
}

// --------------------- Rollover ---------------------

#[test]
fn rollover_shrinks_file_and_preserves_state() -> Result<()> {
    let dir = tempdir()?;
    let opts = StoreOptions { manifest_version_count: 8, ..small_opts() };
    let path = dir.path().join(MANIFEST_FILE);

    let (manifest, _, locks) = fixture(dir.path(), &opts);
    manifest.add_page(&table(dir.path(), 1, 1, b"a", b"m", &locks))?;
    for _ in 0..6 {
        manifest.next_version(0)?;
    }
    let before_rollover = fs::metadata(&path)?.len();

    // the next commit crosses the rollover threshold
    manifest.next_version(0)?;
    let after_rollover = fs::metadata(&path)?.len();
    assert!(
        after_rollover < before_rollover,
        "rollover must shrink the manifest ({} -> {})",
        before_rollover,
        after_rollover
    );

    let version_before = manifest.current_version(0);
    drop(manifest);
    let (reopened, _, _) = fixture(dir.path(), &opts);
    assert_eq!(reopened.current_version(0), version_before);
    assert_eq!(reopened.page_count(1), 1);
    assert_eq!(reopened.current().pages(1)[0].first_key(), &Key::primary(b"a"));
    Ok(())
}

#[test]
fn torn_trailing_append_is_ignored() -> Result<()> {
    let dir = tempdir()?;
    let opts = small_opts();
    let path = dir.path().join(MANIFEST_FILE);
    {
        let (manifest, _, locks) = fixture(dir.path(), &opts);
        manifest.add_page(&table(dir.path(), 0, 1, b"a", b"z", &locks))?;
        manifest.next_version(0)?;
    }

    // simulate a crash mid-append: garbage after the last complete record
    let mut data = fs::read(&path)?;
    data.extend_from_slice(&[0x07, 0x33, 0x21]);
    fs::write(&path, &data)?;

    let (manifest, _, _) = fixture(dir.path(), &opts);
    assert_eq!(manifest.page_count(0), 1);
    assert_eq!(manifest.current_version(0), 1);
    Ok(())
}

// --------------------- Merge cursor ---------------------

#[test]
fn next_merge_page_round_robins_across_the_level() -> Result<()> {
    let dir = tempdir()?;
    let (manifest, _, locks) = fixture(dir.path(), &small_opts());
    manifest.add_page(&table(dir.path(), 1, 1, b"aaa", b"bbb", &locks))?;
    manifest.add_page(&table(dir.path(), 1, 2, b"ccc", b"ddd", &locks))?;
    manifest.add_page(&table(dir.path(), 1, 3, b"eee", b"fff", &locks))?;

    let picks: Vec<u64> = (0..4)
        .map(|_| manifest.next_merge_page(1).unwrap().unwrap().version())
        .collect();
    assert_eq!(picks, vec![1, 2, 3, 1], "cursor wraps around the level");

    assert!(manifest.next_merge_page(5).unwrap().is_none(), "empty level has no victim");
    Ok(())
}
