use super::*;
use anyhow::Result;
use std::thread;
use tempfile::tempdir;

#[test]
fn set_get_delete_roundtrip() -> Result<()> {
    let dir = tempdir()?;
    let store = Store::open(dir.path(), small_opts())?;

    store.set(b"name", b"alice")?;
    assert_eq!(store.get(b"name")?.unwrap(), &b"alice"[..]);

    store.delete(b"name")?;
    assert!(store.get(b"name")?.is_none());

    assert!(store.get(b"never-written")?.is_none());
    store.close()?;
    Ok(())
}

#[test]
fn overwrites_keep_only_the_newest_value() -> Result<()> {
    let dir = tempdir()?;
    let store = Store::open(dir.path(), small_opts())?;

    store.set(b"k", b"v1")?;
    store.set(b"k", b"v2")?;
    store.set(b"k", b"v3")?;

    assert_eq!(store.get(b"k")?.unwrap(), &b"v3"[..]);

    let entries: Vec<(bytes::Bytes, bytes::Bytes)> =
        store.enumerate()?.collect::<Result<_>>()?;
    assert_eq!(entries.len(), 1, "exactly one entry per key");
    assert_eq!(entries[0].1, &b"v3"[..]);
    store.close()?;
    Ok(())
}

#[test]
fn overwrites_survive_flush_boundaries() -> Result<()> {
    let dir = tempdir()?;
    let store = Store::open(dir.path(), no_compaction_opts())?;

    store.set(b"k", b"old")?;
    store.flush()?;
    store.set(b"k", b"mid")?;
    store.flush()?;
    store.set(b"k", b"new")?;

    assert_eq!(store.get(b"k")?.unwrap(), &b"new"[..]);
    let entries: Vec<_> = store.enumerate()?.collect::<Result<Vec<_>>>()?;
    assert_eq!(entries.len(), 1);
    store.close()?;
    Ok(())
}

// --------------------- Validation ---------------------

#[test]
fn empty_and_oversized_keys_are_rejected() -> Result<()> {
    let dir = tempdir()?;
    let store = Store::open(dir.path(), small_opts())?;

    assert!(store.set(b"", b"v").unwrap_err().to_string().contains("empty"));
    let big_key = vec![b'k'; 300];
    let err = store.set(&big_key, b"v").unwrap_err();
    assert!(err.to_string().contains("key too large"), "{err}");
    assert!(store.get(&big_key).is_err());
    store.close()?;
    Ok(())
}

#[test]
fn value_over_the_large_ceiling_is_rejected_upfront() -> Result<()> {
    let dir = tempdir()?;
    let opts = small_opts();
    let max = opts.max_large_value_size();
    let store = Store::open(dir.path(), opts)?;

    let err = store.set(b"k", &vec![0u8; max + 1]).unwrap_err();
    assert!(err.to_string().contains("value too large"), "{err}");
    assert!(store.get(b"k")?.is_none(), "nothing was written");
    store.close()?;
    Ok(())
}

#[test]
fn writes_after_close_are_rejected() -> Result<()> {
    let dir = tempdir()?;
    let store = Store::open(dir.path(), small_opts())?;
    store.close()?;
    assert!(store.set(b"k", b"v").unwrap_err().to_string().contains("closed"));
    assert!(store.get(b"k").unwrap_err().to_string().contains("closed"));
    Ok(())
}

// --------------------- Large values ---------------------

#[test]
fn large_value_splits_and_reassembles() -> Result<()> {
    let dir = tempdir()?;
    let store = Store::open(dir.path(), small_opts())?;

    // 3 chunks of 1024 plus a remainder
    let value: Vec<u8> = (0..3500u32).map(|i| (i % 251) as u8).collect();
    store.set(b"big", &value)?;

    assert_eq!(store.get(b"big")?.unwrap(), &value[..]);

    // enumeration reassembles too, and surfaces only the logical key
    let entries: Vec<_> = store.enumerate()?.collect::<Result<Vec<_>>>()?;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].0, &b"big"[..]);
    assert_eq!(entries[0].1, &value[..]);
    store.close()?;
    Ok(())
}

#[test]
fn large_value_overwritten_by_small_value() -> Result<()> {
    let dir = tempdir()?;
    let store = Store::open(dir.path(), small_opts())?;

    store.set(b"k", &vec![7u8; 3000])?;
    store.set(b"k", b"tiny")?;

    assert_eq!(store.get(b"k")?.unwrap(), &b"tiny"[..]);
    let entries: Vec<_> = store.enumerate()?.collect::<Result<Vec<_>>>()?;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].1, &b"tiny"[..]);
    store.close()?;
    Ok(())
}

#[test]
fn large_value_survives_flush() -> Result<()> {
    let dir = tempdir()?;
    let store = Store::open(dir.path(), no_compaction_opts())?;
    let value = vec![0xabu8; 5000];
    store.set(b"big", &value)?;
    store.flush()?;
    assert_eq!(store.get(b"big")?.unwrap(), &value[..]);
    store.close()?;
    Ok(())
}

// --------------------- Rotation ---------------------

#[test]
fn filling_the_memtable_rotates_to_a_level0_page() -> Result<()> {
    let dir = tempdir()?;
    let store = Store::open(dir.path(), no_compaction_opts())?;

    // well past the 512-byte memtable threshold
    for i in 0..40u32 {
        store.set(format!("key{:03}", i).as_bytes(), &[b'v'; 32])?;
    }

    wait_until("background flush to produce a level-0 page", Duration::from_secs(5), || {
        store.page_count(0) >= 1 && !store.stats().rotation_pending
    });

    for i in 0..40u32 {
        assert!(
            store.get(format!("key{:03}", i).as_bytes())?.is_some(),
            "key{:03} must be readable across the rotation",
            i
        );
    }
    store.close()?;
    Ok(())
}

#[test]
fn explicit_flush_persists_the_memtable() -> Result<()> {
    let dir = tempdir()?;
    let store = Store::open(dir.path(), no_compaction_opts())?;
    store.set(b"k", b"v")?;
    store.flush()?;

    assert_eq!(store.page_count(0), 1);
    assert_eq!(store.stats().memtable_entries, 0, "fresh generation after flush");
    assert_eq!(store.get(b"k")?.unwrap(), &b"v"[..]);

    // flushing an empty memtable is a no-op
    store.flush()?;
    assert_eq!(store.page_count(0), 1);
    store.close()?;
    Ok(())
}

#[test]
fn concurrent_writers_share_the_store() -> Result<()> {
    let dir = tempdir()?;
    let store = Arc::new(Store::open(dir.path(), small_opts())?);

    let mut handles = Vec::new();
    for t in 0..4u32 {
        let store = Arc::clone(&store);
        handles.push(thread::spawn(move || {
            for i in 0..100u32 {
                let key = format!("t{}-key{:03}", t, i);
                store.set(key.as_bytes(), key.as_bytes()).unwrap();
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    for t in 0..4u32 {
        for i in 0..100u32 {
            let key = format!("t{}-key{:03}", t, i);
            assert_eq!(
                store.get(key.as_bytes())?.unwrap(),
                key.as_bytes(),
                "{} must survive concurrent writes and rotations",
                key
            );
        }
    }
    store.close()?;
    Ok(())
}
