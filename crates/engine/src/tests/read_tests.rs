use super::*;
use anyhow::Result;
use tempfile::tempdir;

#[test]
fn enumeration_is_ordered_across_memtable_and_pages() -> Result<()> {
    let dir = tempdir()?;
    let store = Store::open(dir.path(), no_compaction_opts())?;

    // interleave three batches so data lives in two pages plus the memtable
    for i in (0..90u32).step_by(3) {
        store.set(format!("key{:03}", i).as_bytes(), b"a")?;
    }
    store.flush()?;
    for i in (1..90u32).step_by(3) {
        store.set(format!("key{:03}", i).as_bytes(), b"b")?;
    }
    store.flush()?;
    for i in (2..90u32).step_by(3) {
        store.set(format!("key{:03}", i).as_bytes(), b"c")?;
    }

    let keys = collect_keys(&store);
    assert_eq!(keys.len(), 90);
    for (i, key) in keys.iter().enumerate() {
        assert_eq!(key, format!("key{:03}", i).as_bytes());
    }
    for pair in keys.windows(2) {
        assert!(pair[0] < pair[1], "strictly ascending byte order");
    }
    store.close()?;
    Ok(())
}

#[test]
fn enumerate_from_starts_mid_range() -> Result<()> {
    let dir = tempdir()?;
    let store = Store::open(dir.path(), no_compaction_opts())?;
    for i in 0..50u32 {
        store.set(format!("key{:03}", i).as_bytes(), b"v")?;
    }
    store.flush()?;

    let from: Vec<Vec<u8>> = store
        .enumerate_from(b"key025")?
        .map(|e| e.map(|(k, _)| k.to_vec()))
        .collect::<Result<_>>()?;
    assert_eq!(from.len(), 25);
    assert_eq!(from[0], b"key025".to_vec());

    let none: Vec<_> = store.enumerate_from(b"zzz")?.collect::<Result<Vec<_>>>()?;
    assert!(none.is_empty());
    store.close()?;
    Ok(())
}

#[test]
fn tombstone_in_memtable_shadows_flushed_value() -> Result<()> {
    let dir = tempdir()?;
    let store = Store::open(dir.path(), no_compaction_opts())?;

    store.set(b"k", b"on-disk")?;
    store.flush()?;
    store.delete(b"k")?; // tombstone only in the memtable

    assert!(store.get(b"k")?.is_none(), "memtable tombstone wins over the page");
    assert!(collect_keys(&store).is_empty(), "enumeration hides the tombstoned key");
    store.close()?;
    Ok(())
}

#[test]
fn newest_level0_page_wins_over_older_ones() -> Result<()> {
    let dir = tempdir()?;
    let store = Store::open(dir.path(), no_compaction_opts())?;

    store.set(b"k", b"v1")?;
    store.flush()?;
    store.set(b"k", b"v2")?;
    store.flush()?;
    assert!(store.page_count(0) >= 2, "two overlapping level-0 pages");

    assert_eq!(store.get(b"k")?.unwrap(), &b"v2"[..]);
    store.close()?;
    Ok(())
}

#[test]
fn reads_fall_through_to_disk() -> Result<()> {
    let dir = tempdir()?;
    let store = Store::open(dir.path(), no_compaction_opts())?;
    for i in 0..30u32 {
        store.set(format!("key{:03}", i).as_bytes(), format!("value{}", i).as_bytes())?;
    }
    store.flush()?;
    assert_eq!(store.stats().memtable_entries, 0);

    for i in 0..30u32 {
        assert_eq!(
            store.get(format!("key{:03}", i).as_bytes())?.unwrap(),
            format!("value{}", i).as_bytes()
        );
    }
    store.close()?;
    Ok(())
}

#[test]
fn scan_check_passes_on_a_healthy_store() -> Result<()> {
    let dir = tempdir()?;
    let store = Store::open(dir.path(), no_compaction_opts())?;
    for i in 0..60u32 {
        store.set(format!("key{:03}", i).as_bytes(), b"v")?;
    }
    store.flush()?;
    for i in 0..30u32 {
        store.delete(format!("key{:03}", i).as_bytes())?;
    }
    store.flush()?;

    wait_until("flushes to settle", Duration::from_secs(5), || {
        !store.stats().rotation_pending
    });
    let report = store.scan_check()?;
    assert!(report.is_clean(), "problems: {:?}", report.problems);
    assert!(report.pages >= 2, "values and tombstones were flushed separately");
    assert_eq!(report.records, 90, "60 values + 30 tombstones");
    store.close()?;
    Ok(())
}

#[test]
fn stats_reflect_store_shape() -> Result<()> {
    let dir = tempdir()?;
    let store = Store::open(dir.path(), no_compaction_opts())?;
    store.set(b"a", b"1")?;
    store.set(b"b", b"2")?;

    let stats = store.stats();
    assert_eq!(stats.memtable_entries, 2);
    assert!(stats.memtable_size > 0);
    assert!(!stats.rotation_pending);

    store.flush()?;
    let stats = store.stats();
    assert_eq!(stats.memtable_entries, 0);
    assert_eq!(stats.levels.first(), Some(&(0, 1)));
    store.close()?;
    Ok(())
}
