//! Cold-start recovery.
//!
//! Two crash windows need closing before the store can accept traffic:
//!
//! 1. A table writer died mid-write, leaving a `.tmp` file. Temp files are
//!    never referenced by the manifest, so they are simply removed.
//! 2. A rotation began (the successor generation was committed to the
//!    manifest) but the frozen generation's flush never finished. Its
//!    journal is still on disk; it is replayed and flushed synchronously
//!    before the store opens. If the flush did finish and only the journal
//!    deletion was lost, the manifest already references the page and the
//!    journal is redundant — it is just deleted.

use anyhow::Result;
use std::path::Path;

use blocktable::PageLocks;
use config::StoreOptions;

use crate::journaled::JournaledMemTable;
use crate::manifest::Manifest;

/// Removes leftover `.tmp` files from interrupted table or manifest
/// writes.
pub(crate) fn cleanup_tmp_files(dir: &Path) {
    let Ok(entries) = std::fs::read_dir(dir) else { return };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().map_or(false, |e| e == "tmp") {
            log::warn!("removing leftover temp file {}", path.display());
            let _ = std::fs::remove_file(&path);
        }
    }
}

/// Closes the gap where a process died between "new generation assigned"
/// and "old generation durably flushed": if a journal exists for the
/// generation before the current one, replay and flush it now.
pub(crate) fn recover_incomplete_rotation(
    dir: &Path,
    opts: &StoreOptions,
    manifest: &Manifest,
    locks: &PageLocks,
) -> Result<()> {
    let current = manifest.current_version(0);
    if current == 0 {
        return Ok(());
    }
    let previous = current - 1;
    if !journal::journal_path(dir, previous).exists() {
        return Ok(());
    }

    let flushed_already = manifest
        .current()
        .pages(0)
        .iter()
        .any(|p| p.version() == previous);
    if flushed_already {
        // the flush completed; only the journal deletion was lost
        log::info!("dropping redundant journal of flushed generation {}", previous);
        journal::remove_journal(dir, previous)?;
        return Ok(());
    }

    log::info!("recovering interrupted rotation of generation {}", previous);
    let table = JournaledMemTable::create(dir, previous, opts)?;
    if let Some(closed) = table.write_to_table(dir, opts.block_size, locks)? {
        manifest.add_page(&closed)?;
        log::info!(
            "recovered generation {} into level-0 page {} ({} entries)",
            previous,
            closed.id,
            closed.entries
        );
    }
    journal::remove_journal(dir, previous)?;
    Ok(())
}
