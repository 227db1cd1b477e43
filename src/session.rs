//! Mount Session (spec §2.2 / §4.2): owns the opened Metadata Store, the
//! host directory tree, and runs mount-time verification, migration, and
//! conditional rebuild.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::error::OverlayError;
use crate::host::{Credentials, HostFs};
use crate::rebuild;
use crate::store::Store;

const SQLITE_MAGIC: &[u8] = b"SQLite format 3";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Per-mount configuration. `lock_timeout` is not consumed by any code path
/// yet — spec §5 promises the mount lock never times out — but the field
/// exists so an embedder has somewhere to put one later without changing
/// [`MountSession::open`]'s signature, the way the teacher's own `Config`
/// in `overlayfs.rs` carries fields (`writeback`, `xattr`) not every code
/// path consumes.
#[derive(Debug, Clone, Default)]
pub struct MountConfig {
    /// Maximum time a verb waits to acquire the mount lock. `None` waits
    /// indefinitely (spec §5's "no timeouts" promise, and this crate's only
    /// supported behavior today).
    pub lock_timeout: Option<Duration>,
}

/// A mounted overlay: the Metadata Store plus the host collaborators
/// verbs operate against. `H` is the passthrough seam, `C` the
/// credential source (spec §1's external collaborators).
pub struct MountSession<H, C> {
    pub(crate) store: Store,
    pub(crate) host: H,
    pub(crate) creds: Arc<C>,
    pub(crate) config: MountConfig,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl<H: HostFs, C: Credentials> MountSession<H, C> {
    /// Mounts an overlay whose data tree and metadata sidecar are given by
    /// `data_dir` (must end in a `data` component) and `host` (already
    /// rooted at `data_dir` by the caller — host root opening is the
    /// passthrough layer's job, spec §4.2 step 4). Uses the default
    /// [`MountConfig`]; see [`MountSession::open_with_config`] to override it.
    pub fn open(data_dir: &Path, host: H, creds: C) -> Result<Self, OverlayError> {
        Self::open_with_config(data_dir, host, creds, MountConfig::default())
    }

    /// Same as [`MountSession::open`], with an explicit [`MountConfig`].
    pub fn open_with_config(data_dir: &Path, host: H, creds: C, config: MountConfig) -> Result<Self, OverlayError> {
        let db_path = meta_db_path(data_dir)?;

        verify_sqlite_magic(&db_path)?;

        if !host.root_exists() {
            return Err(OverlayError::Host(crate::error::errno::ENOENT));
        }

        let store = Store::open(&db_path)?;

        let db_inode = host_inode_of(&db_path)?;
        let recorded_inode = store.read_db_inode()?;
        if recorded_inode != 0 && recorded_inode != db_inode {
            log::info!(
                "mount: metadata file inode changed ({recorded_inode} -> {db_inode}), rebuilding paths relation"
            );
            rebuild::rebuild(&store, &host)?;
        } else if recorded_inode == 0 {
            log::info!("mount: first mount of this metadata store (db_inode {db_inode})");
        }
        store.write_db_inode(db_inode)?;

        let swept = store.sweep_orphan_stats()?;
        log::debug!("mount: swept {swept} orphaned stat row(s)");

        Ok(MountSession { store, host, creds: Arc::new(creds), config })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn credentials(&self) -> &C {
        &self.creds
    }

    pub fn config(&self) -> &MountConfig {
        &self.config
    }

    /// Closes the session. The data tree's host root descriptor is owned
    /// by `host`'s `Drop`, so dropping the session is sufficient (spec §9
    /// Open Question (c) — this crate decides to close the root handle on
    /// unmount rather than leak it to the caller).
    pub fn close(self) {
        drop(self);
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Replaces the trailing `data` path component with `meta.db` (spec §4.2
/// step 1). Fails fatally if the trailing component isn't literally
/// `data` — a malformed mount source is tier-3 per spec §7.
fn meta_db_path(data_dir: &Path) -> Result<PathBuf, OverlayError> {
    let file_name = data_dir
        .file_name()
        .ok_or_else(|| OverlayError::Fatal(format!("mount source {data_dir:?} has no final component")))?;
    if file_name != "data" {
        return Err(OverlayError::Fatal(format!(
            "mount source {data_dir:?} must end in a `data` component"
        )));
    }
    let parent = data_dir.parent().ok_or_else(|| {
        OverlayError::Fatal(format!("mount source {data_dir:?} has no parent directory"))
    })?;
    Ok(parent.join("meta.db"))
}

/// Spec §4.2 step 2: a fast-path sanity check before handing the file to
/// the store driver.
fn verify_sqlite_magic(db_path: &Path) -> Result<(), OverlayError> {
    let mut file = File::open(db_path).map_err(|_| OverlayError::Host(crate::error::errno::ENOENT))?;
    let mut buf = [0u8; 15];
    let read = file.read(&mut buf).map_err(|_| OverlayError::InvalidArgument)?;
    if read < buf.len() || buf != *SQLITE_MAGIC {
        return Err(OverlayError::InvalidArgument);
    }
    Ok(())
}

fn host_inode_of(path: &Path) -> Result<u64, OverlayError> {
    use std::os::unix::fs::MetadataExt;
    let meta = std::fs::metadata(path).map_err(|_| OverlayError::Fatal(format!("stat database file {path:?}")))?;
    Ok(meta.ino())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{ProcessCredentials, StdHostFs};
    use rusqlite::Connection;
    use std::fs;

    fn mount_fixture() -> (tempfile::TempDir, PathBuf) {
        let root = tempfile::tempdir().unwrap();
        let data_dir = root.path().join("data");
        fs::create_dir(&data_dir).unwrap();
        let db_path = root.path().join("meta.db");
        Connection::open(&db_path).unwrap();
        (root, data_dir)
    }

    #[test]
    fn test_mount_rejects_source_not_ending_in_data() {
        let root = tempfile::tempdir().unwrap();
        let bogus = root.path().join("notdata");
        fs::create_dir(&bogus).unwrap();
        let db_path = root.path().join("meta.db");
        Connection::open(&db_path).unwrap();

        let host = StdHostFs::new(&bogus);
        let err = MountSession::open(&bogus, host, ProcessCredentials).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_mount_rejects_non_sqlite_metadata_file() {
        let root = tempfile::tempdir().unwrap();
        let data_dir = root.path().join("data");
        fs::create_dir(&data_dir).unwrap();
        fs::write(root.path().join("meta.db"), b"not a database").unwrap();

        let host = StdHostFs::new(&data_dir);
        let err = MountSession::open(&data_dir, host, ProcessCredentials).unwrap_err();
        assert!(matches!(err, OverlayError::InvalidArgument));
    }

    #[test]
    fn test_mount_succeeds_on_fresh_pair() {
        let (root, data_dir) = mount_fixture();
        let host = StdHostFs::new(&data_dir);
        let session = MountSession::open(&data_dir, host, ProcessCredentials).unwrap();
        assert_eq!(session.store().read_db_inode().unwrap(), host_inode_of(&root.path().join("meta.db")).unwrap());
    }

    #[test]
    fn test_open_with_config_carries_the_configured_lock_timeout() {
        let (_root, data_dir) = mount_fixture();
        let host = StdHostFs::new(&data_dir);
        let config = MountConfig { lock_timeout: Some(Duration::from_secs(1)) };
        let session = MountSession::open_with_config(&data_dir, host, ProcessCredentials, config).unwrap();
        assert_eq!(session.config().lock_timeout, Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_remount_updates_recorded_inode_without_rebuild_when_unchanged() {
        let (_root, data_dir) = mount_fixture();
        let host = StdHostFs::new(&data_dir);
        let session = MountSession::open(&data_dir, host, ProcessCredentials).unwrap();
        session.close();

        let host = StdHostFs::new(&data_dir);
        let session = MountSession::open(&data_dir, host, ProcessCredentials).unwrap();
        drop(session);
    }
}
