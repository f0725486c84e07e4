//! Secondary indexes: thin convenience layer over the core contract.
//!
//! Each index is a fully independent store of the same on-disk format,
//! living in a nested subdirectory named after the index. An index entry
//! maps `index-value ++ primary-key` to the primary key, so all keys
//! sharing an index value are one contiguous, ordered range — `find` is an
//! `enumerate_from` plus a prefix check.
//!
//! Index maintenance is write-time only; a value overwritten with a new
//! index value leaves the old entry stale until `remove_from_index` or
//! `clean_index` retires it. Stale entries still resolve through the main
//! store, so they return the key's *current* value, never stale data.

use anyhow::{bail, ensure, Result};
use bytes::Bytes;
use std::collections::HashSet;
use std::sync::Arc;

use crate::Store;

impl Store {
    /// Sets `key` to `value` and registers it under each `(index name,
    /// index value)` pair.
    pub fn set_with_index(
        &self,
        key: &[u8],
        value: &[u8],
        index_values: &[(&str, &[u8])],
    ) -> Result<()> {
        self.set(key, value)?;
        for (name, index_value) in index_values {
            ensure!(!index_value.is_empty(), "index value for {:?} must not be empty", name);
            let index = self.index_store(name)?;
            index.set(&index_entry_key(index_value, key), key)?;
        }
        Ok(())
    }

    /// All `(key, value)` pairs registered under exactly `value` in the
    /// named index.
    pub fn find(&self, index_name: &str, value: &[u8]) -> Result<Vec<(Bytes, Bytes)>> {
        let index = self.index_store(index_name)?;
        let mut results = Vec::new();
        for entry in index.enumerate_from(value)? {
            let (entry_key, primary) = entry?;
            if !entry_key.starts_with(value) {
                break;
            }
            // exact match: entry key must be value ++ primary, nothing else
            if entry_key.len() != value.len() + primary.len()
                || entry_key[value.len()..] != primary[..]
            {
                continue;
            }
            if let Some(live) = self.get(&primary)? {
                results.push((primary, live));
            }
        }
        Ok(results)
    }

    /// All `(key, value)` pairs whose index value starts with `prefix`,
    /// deduplicated by key.
    pub fn find_starts_with(
        &self,
        index_name: &str,
        prefix: &[u8],
    ) -> Result<Vec<(Bytes, Bytes)>> {
        let index = self.index_store(index_name)?;
        let mut seen: HashSet<Bytes> = HashSet::new();
        let mut results = Vec::new();
        for entry in index.enumerate_from(prefix)? {
            let (entry_key, primary) = entry?;
            if !entry_key.starts_with(prefix) {
                break;
            }
            if !seen.insert(primary.clone()) {
                continue;
            }
            if let Some(live) = self.get(&primary)? {
                results.push((primary, live));
            }
        }
        Ok(results)
    }

    /// Removes `key`'s entries for the given `(index name, index value)`
    /// pairs.
    pub fn remove_from_index(&self, key: &[u8], index_values: &[(&str, &[u8])]) -> Result<()> {
        for (name, index_value) in index_values {
            let index = self.index_store(name)?;
            index.delete(&index_entry_key(index_value, key))?;
        }
        Ok(())
    }

    /// Drops every entry of the named index whose primary key no longer
    /// exists in the main store. Returns the number of entries removed.
    pub fn clean_index(&self, index_name: &str) -> Result<usize> {
        let index = self.index_store(index_name)?;
        let mut stale: Vec<Bytes> = Vec::new();
        for entry in index.enumerate()? {
            let (entry_key, primary) = entry?;
            if self.get(&primary)?.is_none() {
                stale.push(entry_key);
            }
        }
        for entry_key in &stale {
            index.delete(entry_key)?;
        }
        Ok(stale.len())
    }

    /// The lazily created nested store backing one index.
    pub(crate) fn index_store(&self, name: &str) -> Result<Arc<Store>> {
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            bail!("invalid index name {:?}", name);
        }
        let mut indexes = self.indexes.lock().expect("index stores");
        if let Some(store) = indexes.get(name) {
            return Ok(Arc::clone(store));
        }
        let store = Arc::new(Store::open(
            self.shared.dir.join(name),
            self.shared.opts.clone(),
        )?);
        indexes.insert(name.to_string(), Arc::clone(&store));
        Ok(store)
    }
}

fn index_entry_key(index_value: &[u8], key: &[u8]) -> Vec<u8> {
    let mut entry = Vec::with_capacity(index_value.len() + key.len());
    entry.extend_from_slice(index_value);
    entry.extend_from_slice(key);
    entry
}
