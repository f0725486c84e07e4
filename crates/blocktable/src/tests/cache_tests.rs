use super::*;
use bytes::Bytes;
use tempfile::tempdir;

#[test]
fn block_cache_round_trips() {
    let cache = Cache::new(4 * 64, 64, 4);
    let id = PageId::new(0, 1);
    assert!(cache.get_block(id, 0).is_none());

    cache.put_block(id, 0, Bytes::from_static(b"block-zero"));
    assert_eq!(cache.get_block(id, 0).unwrap(), Bytes::from_static(b"block-zero"));

    let (hits, misses) = cache.stats();
    assert_eq!((hits, misses), (1, 1));
}

#[test]
fn block_cache_evicts_least_recently_used() {
    // capacity: 2 block slots
    let cache = Cache::new(2 * 64, 64, 4);
    let id = PageId::new(0, 1);

    cache.put_block(id, 0, Bytes::from_static(b"b0"));
    cache.put_block(id, 1, Bytes::from_static(b"b1"));
    // touch block 0 so block 1 becomes the eviction victim
    assert!(cache.get_block(id, 0).is_some());
    cache.put_block(id, 2, Bytes::from_static(b"b2"));

    assert!(cache.get_block(id, 0).is_some(), "recently used survives");
    assert!(cache.get_block(id, 1).is_none(), "LRU entry evicted");
    assert!(cache.get_block(id, 2).is_some());
}

#[test]
fn evict_page_drops_all_artifacts() {
    let cache = Cache::new(8 * 64, 64, 4);
    let keep = PageId::new(0, 1);
    let gone = PageId::new(0, 2);

    cache.put_block(keep, 0, Bytes::from_static(b"keep"));
    cache.put_block(gone, 0, Bytes::from_static(b"gone"));
    cache.put_block(gone, 1, Bytes::from_static(b"gone"));
    cache.put_index(gone, vec![Key::primary(b"k")].into());
    cache.put_meta(gone, crate::format::TableMeta { total_blocks: 3, data_blocks: 1, index_blocks: 1 });

    cache.evict_page(gone);

    assert!(cache.get_block(keep, 0).is_some());
    assert!(cache.get_block(gone, 0).is_none());
    assert!(cache.get_block(gone, 1).is_none());
    assert!(cache.get_index(gone).is_none());
    assert!(cache.get_meta(gone).is_none());
}

#[test]
fn reads_are_served_from_cache_after_first_miss() {
    let dir = tempdir().unwrap();
    let id = PageId::new(0, 1);
    let locks = test_locks();
    let cache = test_cache(512);
    let entries = numbered_entries(50);
    write_table(dir.path(), id, 512, &entries, &locks);

    let reader = open_reader(dir.path(), id, 512, cache.clone(), locks);
    reader.lookup(&entries[0].0).unwrap();
    let (_, misses_after_first) = cache.stats();
    reader.lookup(&entries[0].0).unwrap();
    let (hits, misses) = cache.stats();

    assert_eq!(misses, misses_after_first, "second lookup reads no blocks from disk");
    assert!(hits >= 1);
}

#[test]
fn eviction_only_costs_a_recompute() {
    let dir = tempdir().unwrap();
    let id = PageId::new(0, 1);
    let locks = test_locks();
    let cache = test_cache(512);
    let entries = numbered_entries(50);
    write_table(dir.path(), id, 512, &entries, &locks);
    let reader = open_reader(dir.path(), id, 512, cache.clone(), locks);

    reader.lookup(&entries[10].0).unwrap();
    cache.clear();
    // everything is derivable from the immutable file
    assert_eq!(reader.lookup(&entries[10].0).unwrap(), Some(entries[10].1.clone()));
}
