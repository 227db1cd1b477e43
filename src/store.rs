//! Metadata Store (spec §2.1 / §4.1): the transactional relational sidecar
//! holding `paths`, `stats`, and the `meta` singleton.
//!
//! `Store` owns a single [`rusqlite::Connection`] behind a [`Mutex`]. Per
//! spec §5, `begin()` acquiring that mutex *is* the mount lock: the guard
//! returned by [`Store::begin`] is held for the lifetime of the
//! transaction, so host syscalls a verb performs between `begin` and
//! `commit`/`rollback` run serialized with every other mount transaction.

use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};

use crate::error::StoreError;
use crate::types::Stat;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Current schema version this crate understands. Bumped whenever
/// `migrate` gains a new forward step.
const SCHEMA_VERSION: i64 = 1;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

pub struct Store {
    conn: Mutex<Connection>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Store {
    /// Opens an existing metadata file read-write. The file must already
    /// exist and contain a valid sqlite database (spec §4.2 steps 1-3
    /// validate this before calling in); this does not create a database.
    pub fn open(path: &std::path::Path) -> Result<Self, StoreError> {
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_WRITE)
            .map_err(|e| StoreError::fatal("open metadata store", e))?;
        conn.pragma_update(None, "journal_mode", "wal")
            .map_err(|e| StoreError::fatal("set journal_mode=wal", e))?;
        let store = Store { conn: Mutex::new(conn) };
        store.migrate()?;
        Ok(store)
    }

    /// Applies forward-only schema migrations (spec §9 Open Question (b)).
    /// Version 0 (a database with none of this crate's own bookkeeping
    /// applied yet) gets the base three-relation schema of spec §4.1
    /// created if missing, and is raised to [`SCHEMA_VERSION`]. Anything
    /// newer than [`SCHEMA_VERSION`] is an unrecognized schema and is
    /// fatal — proceeding would risk silently misinterpreting row layouts.
    fn migrate(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let version: i64 = conn
            .query_row("pragma user_version", [], |row| row.get(0))
            .map_err(|e| StoreError::fatal("read user_version", e))?;

        if version > SCHEMA_VERSION {
            return Err(StoreError::Fatal(format!(
                "metadata store schema version {version} is newer than this build supports ({SCHEMA_VERSION})"
            )));
        }

        if version < 1 {
            log::info!("metadata store: applying base schema (user_version {version} -> 1)");
            conn.execute_batch(
                "create table if not exists paths (path blob primary key, inode integer not null);
                 create table if not exists stats (inode integer primary key autoincrement, stat blob not null);
                 create table if not exists meta (db_inode integer);
                 pragma user_version = 1;",
            )
            .map_err(|e| StoreError::fatal("apply base schema", e))?;

            let meta_rows: i64 = conn
                .query_row("select count(*) from meta", [], |row| row.get(0))
                .map_err(|e| StoreError::fatal("count meta rows", e))?;
            if meta_rows == 0 {
                conn.execute("insert into meta (db_inode) values (0)", [])
                    .map_err(|e| StoreError::fatal("seed meta singleton", e))?;
            }
        }

        Ok(())
    }

    /// Reads the recorded `meta.db_inode`.
    pub fn read_db_inode(&self) -> Result<u64, StoreError> {
        let conn = self.conn.lock().unwrap();
        let inode: i64 = conn
            .query_row("select db_inode from meta", [], |row| row.get(0))
            .map_err(|e| StoreError::fatal("read db_inode", e))?;
        Ok(inode as u64)
    }

    /// Overwrites the recorded `meta.db_inode`.
    pub fn write_db_inode(&self, inode: u64) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("update meta set db_inode = ?1", params![inode as i64])
            .map_err(|e| StoreError::fatal("write db_inode", e))?;
        Ok(())
    }

    /// One-shot orphan sweep (spec §4.2 step 8): deletes every Stat row no
    /// Path record references. Returns the number of rows removed, for
    /// diagnostics.
    pub fn sweep_orphan_stats(&self) -> Result<usize, StoreError> {
        let conn = self.conn.lock().unwrap();
        let removed = conn
            .execute(
                "delete from stats where not exists (select 1 from paths where paths.inode = stats.inode)",
                [],
            )
            .map_err(|e| StoreError::fatal("sweep orphan stats", e))?;
        if removed > 0 {
            log::debug!("metadata store: swept {removed} orphaned stat row(s)");
        }
        Ok(removed)
    }

    /// Begins a transaction, acquiring the mount lock for its duration.
    /// The returned guard rolls back on `Drop` unless `commit`/`rollback`
    /// was called explicitly — a panicking verb cannot leave the store
    /// mid-transaction.
    pub fn begin(&self) -> Result<StoreTxn<'_>, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("begin")
            .map_err(|e| StoreError::fatal("begin transaction", e))?;
        Ok(StoreTxn { conn, finished: false })
    }
}

/// An open Metadata Store transaction. Holds the mount lock until
/// [`StoreTxn::commit`] or [`StoreTxn::rollback`] consumes it (or it is
/// dropped, which rolls back).
pub struct StoreTxn<'s> {
    conn: MutexGuard<'s, Connection>,
    finished: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl<'s> StoreTxn<'s> {
    pub fn commit(mut self) -> Result<(), StoreError> {
        self.conn
            .execute_batch("commit")
            .map_err(|e| StoreError::fatal("commit transaction", e))?;
        self.finished = true;
        Ok(())
    }

    pub fn rollback(mut self) -> Result<(), StoreError> {
        self.conn
            .execute_batch("rollback")
            .map_err(|e| StoreError::fatal("rollback transaction", e))?;
        self.finished = true;
        Ok(())
    }

    /// `select inode from paths where path = ?`. Zero signals "not
    /// present" per spec §4.1.
    pub fn path_get_inode(&self, path: &[u8]) -> Result<u64, StoreError> {
        let inode: Option<i64> = self
            .conn
            .query_row("select inode from paths where path = ?1", params![path], |row| row.get(0))
            .optional()
            .map_err(|e| StoreError::fatal("path_get_inode", e))?;
        Ok(inode.unwrap_or(0) as u64)
    }

    /// `select inode, stat from stats natural join paths where path = ?`.
    pub fn path_read_stat(&self, path: &[u8]) -> Result<Option<(u64, Stat)>, StoreError> {
        let row: Option<(i64, Vec<u8>)> = self
            .conn
            .query_row(
                "select stats.inode, stats.stat from stats natural join paths where paths.path = ?1",
                params![path],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|e| StoreError::fatal("path_read_stat", e))?;

        match row {
            None => Ok(None),
            Some((inode, blob)) => {
                let stat = Stat::from_blob(&blob)
                    .ok_or_else(|| StoreError::Fatal("stat blob has unexpected length".into()))?;
                Ok(Some((inode as u64, stat)))
            }
        }
    }

    /// Inserts a Stat row, then a Path row bound to it. Fails fatally if
    /// either insert fails (spec §4.1 "fails with corrupt if either insert
    /// fails").
    pub fn path_create(&self, path: &[u8], stat: Stat) -> Result<u64, StoreError> {
        self.conn
            .execute("insert into stats (stat) values (?1)", params![stat.to_blob().to_vec()])
            .map_err(|e| StoreError::fatal("path_create: insert stat", e))?;
        let inode = self.conn.last_insert_rowid();
        self.conn
            .execute("insert into paths (path, inode) values (?1, ?2)", params![path, inode])
            .map_err(|e| StoreError::fatal("path_create: insert path", e))?;
        Ok(inode as u64)
    }

    /// `select stat from stats where inode = ?`. A missing inode violates
    /// I2 and is fatal per spec §4.1.
    pub fn inode_read_stat(&self, inode: u64) -> Result<Stat, StoreError> {
        let blob: Option<Vec<u8>> = self
            .conn
            .query_row("select stat from stats where inode = ?1", params![inode as i64], |row| row.get(0))
            .optional()
            .map_err(|e| StoreError::fatal("inode_read_stat", e))?;
        let blob = blob.ok_or_else(|| StoreError::Fatal(format!("inode_read_stat({inode}): missing inode")))?;
        Stat::from_blob(&blob).ok_or_else(|| StoreError::Fatal("stat blob has unexpected length".into()))
    }

    /// `update stats set stat = ? where inode = ?`.
    pub fn inode_write_stat(&self, inode: u64, stat: Stat) -> Result<(), StoreError> {
        self.conn
            .execute(
                "update stats set stat = ?1 where inode = ?2",
                params![stat.to_blob().to_vec(), inode as i64],
            )
            .map_err(|e| StoreError::fatal("inode_write_stat", e))?;
        Ok(())
    }

    /// Binds `dst` to the Stat `src` currently resolves to. Fatal if `src`
    /// is absent — callers must have ensured presence first (spec §4.1).
    pub fn path_link(&self, src: &[u8], dst: &[u8]) -> Result<(), StoreError> {
        let inode = self.path_get_inode(src)?;
        if inode == 0 {
            return Err(StoreError::Fatal(format!("path_link: nonexistent src path {src:?}")));
        }
        self.conn
            .execute("insert into paths (path, inode) values (?1, ?2)", params![dst, inode as i64])
            .map_err(|e| StoreError::fatal("path_link", e))?;
        Ok(())
    }

    /// `delete from paths where path = ?`. A no-op if absent is acceptable
    /// only when the caller already confirmed the host call succeeded.
    pub fn path_unlink(&self, path: &[u8]) -> Result<(), StoreError> {
        self.conn
            .execute("delete from paths where path = ?1", params![path])
            .map_err(|e| StoreError::fatal("path_unlink", e))?;
        Ok(())
    }

    /// `update or replace paths set path = ? [dst] where path = ? [src]`.
    /// If a Path for `dst` already exists, sqlite's `OR REPLACE` conflict
    /// resolution deletes it first, matching host `rename`'s atomic
    /// replace semantics (spec §4.1).
    pub fn path_rename(&self, src: &[u8], dst: &[u8]) -> Result<(), StoreError> {
        self.conn
            .execute("update or replace paths set path = ?1 where path = ?2", params![dst, src])
            .map_err(|e| StoreError::fatal("path_rename", e))?;
        Ok(())
    }

    /// Returns every (path, inode) row currently in `paths`, used only by
    /// the rebuild engine (spec §4.3) to compare against a host tree walk.
    pub fn all_paths(&self) -> Result<Vec<(Vec<u8>, u64)>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("select path, inode from paths")
            .map_err(|e| StoreError::fatal("all_paths: prepare", e))?;
        let rows = stmt
            .query_map([], |row| {
                let path: Vec<u8> = row.get(0)?;
                let inode: i64 = row.get(1)?;
                Ok((path, inode as u64))
            })
            .map_err(|e| StoreError::fatal("all_paths: query", e))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| StoreError::fatal("all_paths: row", e))?);
        }
        Ok(out)
    }

    /// Replaces the entire `paths` relation's membership with exactly the
    /// given set of (path, inode) rows, used only by the rebuild engine
    /// (spec §4.3), which already holds this transaction.
    pub fn replace_all_paths(&self, rows: &[(Vec<u8>, u64)]) -> Result<(), StoreError> {
        self.conn
            .execute("delete from paths", [])
            .map_err(|e| StoreError::fatal("rebuild: clear paths", e))?;
        for (path, inode) in rows {
            self.conn
                .execute("insert into paths (path, inode) values (?1, ?2)", params![path, *inode as i64])
                .map_err(|e| StoreError::fatal("rebuild: insert path", e))?;
        }
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Drop for StoreTxn<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.conn.execute_batch("rollback") {
                log::warn!("metadata store: rollback on drop failed: {e}");
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection as RawConnection;

    fn fresh_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("meta.db");
        // Bootstrap an empty sqlite file the way a provisioning tool would;
        // `Store::open` never creates the file itself (spec §4.2 step 1-3
        // treats a missing/invalid file as an error, not something to
        // initialize).
        RawConnection::open(&db_path).unwrap();
        let store = Store::open(&db_path).unwrap();
        (dir, store)
    }

    #[test]
    fn test_migrate_creates_base_schema_and_seeds_meta() {
        let (_dir, store) = fresh_store();
        assert_eq!(store.read_db_inode().unwrap(), 0);
    }

    #[test]
    fn test_path_get_inode_is_zero_when_absent() {
        let (_dir, store) = fresh_store();
        let txn = store.begin().unwrap();
        assert_eq!(txn.path_get_inode(b"/a").unwrap(), 0);
        txn.commit().unwrap();
    }

    #[test]
    fn test_create_then_read_round_trips_stat() {
        let (_dir, store) = fresh_store();
        let txn = store.begin().unwrap();
        let stat = Stat { mode: 0o100644, uid: 501, gid: 20, rdev: 0 };
        let inode = txn.path_create(b"/a", stat).unwrap();
        assert_ne!(inode, 0);
        let (read_inode, read_stat) = txn.path_read_stat(b"/a").unwrap().unwrap();
        assert_eq!(read_inode, inode);
        assert_eq!(read_stat, stat);
        txn.commit().unwrap();
    }

    #[test]
    fn test_link_shares_one_stat_between_two_paths() {
        let (_dir, store) = fresh_store();
        let txn = store.begin().unwrap();
        let stat = Stat { mode: 0o100644, uid: 0, gid: 0, rdev: 0 };
        let inode = txn.path_create(b"/a", stat).unwrap();
        txn.path_link(b"/a", b"/b").unwrap();
        assert_eq!(txn.path_get_inode(b"/b").unwrap(), inode);
        txn.commit().unwrap();
    }

    #[test]
    fn test_unlink_removes_path_but_not_stat() {
        let (_dir, store) = fresh_store();
        let txn = store.begin().unwrap();
        let stat = Stat { mode: 0o100644, uid: 0, gid: 0, rdev: 0 };
        let inode = txn.path_create(b"/a", stat).unwrap();
        txn.path_unlink(b"/a").unwrap();
        assert_eq!(txn.path_get_inode(b"/a").unwrap(), 0);
        // Stat still resolvable by inode until the next orphan sweep.
        assert_eq!(txn.inode_read_stat(inode).unwrap(), stat);
        txn.commit().unwrap();
    }

    #[test]
    fn test_rename_replaces_existing_destination() {
        let (_dir, store) = fresh_store();
        let txn = store.begin().unwrap();
        let stat_a = Stat { mode: 0o100644, uid: 1, gid: 1, rdev: 0 };
        let stat_b = Stat { mode: 0o100600, uid: 2, gid: 2, rdev: 0 };
        let inode_a = txn.path_create(b"/a", stat_a).unwrap();
        txn.path_create(b"/b", stat_b).unwrap();
        txn.path_rename(b"/a", b"/b").unwrap();
        assert_eq!(txn.path_get_inode(b"/a").unwrap(), 0);
        assert_eq!(txn.path_get_inode(b"/b").unwrap(), inode_a);
        txn.commit().unwrap();
    }

    #[test]
    fn test_rollback_on_drop_discards_uncommitted_mutations() {
        let (_dir, store) = fresh_store();
        {
            let txn = store.begin().unwrap();
            txn.path_create(b"/a", Stat::default()).unwrap();
            // dropped without commit/rollback -> auto rollback
        }
        let txn = store.begin().unwrap();
        assert_eq!(txn.path_get_inode(b"/a").unwrap(), 0);
        txn.commit().unwrap();
    }

    #[test]
    fn test_orphan_sweep_removes_unreferenced_stats() {
        let (_dir, store) = fresh_store();
        let txn = store.begin().unwrap();
        let stat = Stat { mode: 0o100644, uid: 0, gid: 0, rdev: 0 };
        let inode = txn.path_create(b"/a", stat).unwrap();
        txn.path_unlink(b"/a").unwrap();
        txn.commit().unwrap();

        let removed = store.sweep_orphan_stats().unwrap();
        assert_eq!(removed, 1);

        let txn = store.begin().unwrap();
        let err = txn.inode_read_stat(inode).unwrap_err();
        assert!(matches!(err, StoreError::Fatal(_)));
        txn.rollback().unwrap();
    }

    #[test]
    fn test_newer_schema_version_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("meta.db");
        {
            let conn = RawConnection::open(&db_path).unwrap();
            conn.execute_batch("pragma user_version = 99;").unwrap();
        }
        let err = Store::open(&db_path).unwrap_err();
        assert!(matches!(err, StoreError::Fatal(_)));
    }
}
