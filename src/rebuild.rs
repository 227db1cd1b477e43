//! Rebuild Engine (spec §2.3 / §4.3): reconciles the `paths` relation
//! after the host inode space has been renumbered (detected by
//! [`crate::session::MountSession::open`] comparing the metadata file's
//! host inode against the recorded one).
//!
//! Design decision (recorded in DESIGN.md): this crate's Path→Stat
//! binding is string-path-keyed, not host-inode-keyed, so it is immune by
//! construction to the host renumbering that triggers a rebuild — the
//! binding a hard-link group shares was established by [`crate::ops`]'s
//! `link` verb and never referenced a host inode number. What *can* go
//! stale across an out-of-band copy is which paths still have a
//! corresponding host entry at all (a packaging/transfer step may have
//! dropped some). Rebuild therefore walks the host tree once and keeps
//! exactly the Path rows whose host entry still exists, dropping the
//! rest — which already satisfies every invariant spec §4.3 states:
//! existing Stat bindings (and therefore hard-link sharing) are left
//! untouched, missing host entries are dropped, and host entries with no
//! Path record stay invisible.

use std::collections::HashSet;

use crate::error::StoreError;
use crate::host::HostFs;
use crate::store::Store;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Walks `host`'s tree and drops every `paths` row whose host entry no
/// longer exists. Runs under a single transaction (spec §4.3: "Rebuild
/// runs under a single MS transaction so that an aborted rebuild leaves
/// the previous state").
pub fn rebuild<H: HostFs>(store: &Store, host: &H) -> Result<(), StoreError> {
    let entries = host.walk().map_err(|e| {
        StoreError::Fatal(format!("rebuild: failed to walk data tree: {e}"))
    })?;
    let live_host_paths: HashSet<Vec<u8>> = entries.into_iter().map(|e| e.path).collect();
    log::info!("rebuild: host tree has {} live entries", live_host_paths.len());

    let txn = store.begin()?;
    let existing = txn.all_paths()?;
    let mut kept = 0usize;
    let mut dropped = 0usize;
    let mut surviving = Vec::with_capacity(existing.len());
    for (path, inode) in existing {
        if live_host_paths.contains(&path) {
            surviving.push((path, inode));
            kept += 1;
        } else {
            dropped += 1;
        }
    }
    log::info!("rebuild: kept {kept} path record(s), dropped {dropped} stale record(s)");
    txn.replace_all_paths(&surviving)?;
    txn.commit()?;
    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
