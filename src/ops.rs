//! Overlay Operations (spec §2.4 / §4.4): the user-facing verbs. Every
//! mutating verb follows the wrap-transaction pattern —
//! `begin(); host-op; (rollback on host failure | ms-mutate then commit)`
//! — so a failed host operation always leaves the Metadata Store
//! untouched, and a failed MS mutation after a successful host operation
//! is the one case spec §7 calls out as fatal (see [`crate::error`]):
//! letting the host succeed with silent MS divergence would corrupt I4
//! for every future read. Each verb's public entry point routes its result
//! through [`check_fatal`] so a tier-3 error aborts the process at the
//! verb boundary instead of propagating to the caller as an ordinary `Err`.

use crate::attr;
use crate::error::{check_fatal, host_err, OverlayError};
use crate::host::{Credentials, HostFs};
use crate::session::MountSession;
use crate::types::{AttrChange, ProjectedStat, Stat};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A file descriptor surfaced by [`MountSession::open`]. Independent of any
/// transaction once returned (spec §5 "Descriptor ownership") — it carries
/// the overlay inode resolved at open time for later `fstat`/`fsetattr`.
pub struct FileHandle<F> {
    pub file: F,
    pub inode: u64,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl<H: HostFs, C: Credentials> MountSession<H, C> {
    /// `open(path, flags, mode)` (spec §4.4). The host always sees mode
    /// 0666 — the overlay's recorded mode is authoritative.
    pub fn open(&self, path: &[u8], flags: i32, mode: u32) -> Result<FileHandle<H::File>, OverlayError> {
        check_fatal(self.open_impl(path, flags, mode))
    }

    fn open_impl(&self, path: &[u8], flags: i32, mode: u32) -> Result<FileHandle<H::File>, OverlayError> {
        let file = self.host.open(path, flags).map_err(host_err)?;

        let txn = self.store.begin()?;
        let mut inode = txn.path_get_inode(path)?;
        if flags & libc::O_CREAT != 0 && inode == 0 {
            let stat = Stat {
                mode: mode | libc::S_IFREG,
                uid: self.creds.euid(),
                gid: self.creds.egid(),
                rdev: 0,
            };
            inode = txn.path_create(path, stat)?;
        }
        txn.commit()?;

        if inode == 0 {
            // Pre-existing host file with no overlay metadata at all; the
            // overlay treats it as non-existent.
            // TODO: unlink the orphan host file; left to the passthrough
            // layer, which owns host-side cleanup policy.
            drop(file);
            return Err(OverlayError::NotFound);
        }
        Ok(FileHandle { file, inode })
    }

    /// `link(src, dst)` (spec §4.4). Host-links first so a host-level
    /// failure (e.g. cross-device) is preserved verbatim.
    pub fn link(&self, src: &[u8], dst: &[u8]) -> Result<(), OverlayError> {
        check_fatal(self.link_impl(src, dst))
    }

    fn link_impl(&self, src: &[u8], dst: &[u8]) -> Result<(), OverlayError> {
        let txn = self.store.begin()?;
        if let Err(e) = self.host.link(src, dst) {
            txn.rollback()?;
            return Err(host_err(e));
        }
        txn.path_link(src, dst)?;
        txn.commit()?;
        Ok(())
    }

    /// `unlink(path)` (spec §4.4). The Stat is not deleted; it becomes
    /// orphaned and is collected at the next mount.
    pub fn unlink(&self, path: &[u8]) -> Result<(), OverlayError> {
        check_fatal(self.unlink_impl(path))
    }

    fn unlink_impl(&self, path: &[u8]) -> Result<(), OverlayError> {
        let txn = self.store.begin()?;
        if let Err(e) = self.host.unlink(path) {
            txn.rollback()?;
            return Err(host_err(e));
        }
        txn.path_unlink(path)?;
        txn.commit()?;
        Ok(())
    }

    /// `rmdir(path)` (spec §4.4). Same contract as `unlink`.
    pub fn rmdir(&self, path: &[u8]) -> Result<(), OverlayError> {
        check_fatal(self.rmdir_impl(path))
    }

    fn rmdir_impl(&self, path: &[u8]) -> Result<(), OverlayError> {
        let txn = self.store.begin()?;
        if let Err(e) = self.host.rmdir(path) {
            txn.rollback()?;
            return Err(host_err(e));
        }
        txn.path_unlink(path)?;
        txn.commit()?;
        Ok(())
    }

    /// `rename(src, dst)` (spec §4.4). Atomic replacement of an existing
    /// `dst` is permitted, matching host `rename`.
    pub fn rename(&self, src: &[u8], dst: &[u8]) -> Result<(), OverlayError> {
        check_fatal(self.rename_impl(src, dst))
    }

    fn rename_impl(&self, src: &[u8], dst: &[u8]) -> Result<(), OverlayError> {
        let txn = self.store.begin()?;
        if let Err(e) = self.host.rename(src, dst) {
            txn.rollback()?;
            return Err(host_err(e));
        }
        txn.path_rename(src, dst)?;
        txn.commit()?;
        Ok(())
    }

    /// `symlink(target, linkpath)` (spec §4.4). The host gets a regular
    /// file containing the literal target bytes, so that host tooling
    /// that refuses to package broken symlinks never sees one. Symlink
    /// permissions are always `0777` by convention.
    pub fn symlink(&self, target: &[u8], linkpath: &[u8]) -> Result<(), OverlayError> {
        check_fatal(self.symlink_impl(target, linkpath))
    }

    fn symlink_impl(&self, target: &[u8], linkpath: &[u8]) -> Result<(), OverlayError> {
        let txn = self.store.begin()?;

        let mut file = match self.host.create_exclusive(linkpath) {
            Ok(f) => f,
            Err(e) => {
                txn.rollback()?;
                return Err(host_err(e));
            }
        };
        if let Err(e) = self.host.write_all(&mut file, target) {
            drop(file);
            let _ = self.host.unlink(linkpath);
            txn.rollback()?;
            return Err(host_err(e));
        }
        drop(file);

        let stat = Stat {
            mode: libc::S_IFLNK | 0o777,
            uid: self.creds.euid(),
            gid: self.creds.egid(),
            rdev: 0,
        };
        txn.path_create(linkpath, stat)?;
        txn.commit()?;
        Ok(())
    }

    /// `mknod(path, mode, dev)` (spec §4.4). Char/block special files get
    /// a regular file on the host; anything else gets the real type bits.
    /// The overlay Stat always records the requested mode verbatim.
    pub fn mknod(&self, path: &[u8], mode: u32, dev: u32) -> Result<(), OverlayError> {
        check_fatal(self.mknod_impl(path, mode, dev))
    }

    fn mknod_impl(&self, path: &[u8], mode: u32, dev: u32) -> Result<(), OverlayError> {
        let is_special = Stat { mode, uid: 0, gid: 0, rdev: 0 }.is_chr_or_blk();
        let host_mode = if is_special { libc::S_IFREG | 0o666 } else { (mode & libc::S_IFMT) | 0o666 };

        let txn = self.store.begin()?;
        if let Err(e) = self.host.mknod(path, host_mode) {
            txn.rollback()?;
            return Err(host_err(e));
        }
        let stat = Stat {
            mode,
            uid: self.creds.euid(),
            gid: self.creds.egid(),
            rdev: if is_special { dev } else { 0 },
        };
        txn.path_create(path, stat)?;
        txn.commit()?;
        Ok(())
    }

    /// `mkdir(path, mode)` (spec §4.4). Host always gets mode `0777`.
    pub fn mkdir(&self, path: &[u8], mode: u32) -> Result<(), OverlayError> {
        check_fatal(self.mkdir_impl(path, mode))
    }

    fn mkdir_impl(&self, path: &[u8], mode: u32) -> Result<(), OverlayError> {
        let txn = self.store.begin()?;
        if let Err(e) = self.host.mkdir(path) {
            txn.rollback()?;
            return Err(host_err(e));
        }
        let stat = Stat {
            mode: mode | libc::S_IFDIR,
            uid: self.creds.euid(),
            gid: self.creds.egid(),
            rdev: 0,
        };
        txn.path_create(path, stat)?;
        txn.commit()?;
        Ok(())
    }

    /// `stat(path, follow_links)` (spec §4.4). The Path must exist in MS
    /// before the host is consulted.
    pub fn stat(&self, path: &[u8], follow_links: bool) -> Result<ProjectedStat, OverlayError> {
        check_fatal(self.stat_impl(path, follow_links))
    }

    fn stat_impl(&self, path: &[u8], follow_links: bool) -> Result<ProjectedStat, OverlayError> {
        let txn = self.store.begin()?;
        let Some((inode, stat)) = txn.path_read_stat(path)? else {
            txn.rollback()?;
            return Err(OverlayError::NotFound);
        };
        let host_stat = match self.host.stat(path, follow_links) {
            Ok(h) => h,
            Err(e) => {
                txn.rollback()?;
                return Err(host_err(e));
            }
        };
        txn.commit()?;
        Ok(attr::project(inode, stat, host_stat))
    }

    /// `fstat(descriptor)` (spec §4.4). Always keyed by the overlay inode
    /// the descriptor resolved at open time — never by path.
    pub fn fstat(&self, handle: &FileHandle<H::File>) -> Result<ProjectedStat, OverlayError> {
        check_fatal(self.fstat_impl(handle))
    }

    fn fstat_impl(&self, handle: &FileHandle<H::File>) -> Result<ProjectedStat, OverlayError> {
        let host_stat = self.host.fstat(&handle.file).map_err(host_err)?;
        let txn = self.store.begin()?;
        let stat = txn.inode_read_stat(handle.inode)?;
        txn.commit()?;
        Ok(attr::project(handle.inode, stat, host_stat))
    }

    /// `setattr(path, attr)` (spec §4.4). Size changes are content, not
    /// metadata, and are delegated straight to the host.
    pub fn setattr(&self, path: &[u8], change: AttrChange) -> Result<(), OverlayError> {
        check_fatal(self.setattr_impl(path, change))
    }

    fn setattr_impl(&self, path: &[u8], change: AttrChange) -> Result<(), OverlayError> {
        if let AttrChange::Size(size) = change {
            return self.host.truncate(path, size).map_err(host_err);
        }

        let txn = self.store.begin()?;
        let Some((inode, mut stat)) = txn.path_read_stat(path)? else {
            txn.rollback()?;
            return Err(OverlayError::NotFound);
        };
        apply_attr_change(&mut stat, change);
        txn.inode_write_stat(inode, stat)?;
        txn.commit()?;
        Ok(())
    }

    /// `fsetattr(descriptor, attr)` (spec §4.4). Same contract as
    /// `setattr`, keyed by overlay inode.
    pub fn fsetattr(&self, handle: &FileHandle<H::File>, change: AttrChange) -> Result<(), OverlayError> {
        check_fatal(self.fsetattr_impl(handle, change))
    }

    fn fsetattr_impl(&self, handle: &FileHandle<H::File>, change: AttrChange) -> Result<(), OverlayError> {
        if let AttrChange::Size(size) = change {
            return self.host.ftruncate(&handle.file, size).map_err(host_err);
        }

        let txn = self.store.begin()?;
        let mut stat = txn.inode_read_stat(handle.inode)?;
        apply_attr_change(&mut stat, change);
        txn.inode_write_stat(handle.inode, stat)?;
        txn.commit()?;
        Ok(())
    }

    /// `readlink(path)` (spec §4.4). Verifies the Path exists and is a
    /// symlink, then tries the real host `readlink` before falling back
    /// to reading the file's contents — the host stores overlay symlinks
    /// as regular files, so the real syscall is expected to fail with
    /// `EINVAL` in the common case.
    pub fn readlink(&self, path: &[u8]) -> Result<Vec<u8>, OverlayError> {
        check_fatal(self.readlink_impl(path))
    }

    fn readlink_impl(&self, path: &[u8]) -> Result<Vec<u8>, OverlayError> {
        let txn = self.store.begin()?;
        let Some((_, stat)) = txn.path_read_stat(path)? else {
            txn.rollback()?;
            return Err(OverlayError::NotFound);
        };
        if !stat.is_symlink() {
            txn.rollback()?;
            return Err(OverlayError::InvalidArgument);
        }

        let result = match self.host.readlink(path) {
            Ok(target) => Ok(target),
            Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {
                self.host.read_to_end(path).map_err(host_err)
            }
            Err(e) => Err(host_err(e)),
        };
        match &result {
            Ok(_) => txn.commit()?,
            Err(_) => txn.rollback()?,
        }
        result
    }

    // The following are re-exported unchanged (spec §6): no MS
    // involvement, thin forwards to the passthrough layer, so there is no
    // tier-3 path to route through `check_fatal`.

    pub fn statfs(&self) -> Result<nix::sys::statvfs::Statvfs, OverlayError> {
        self.host.statfs().map_err(host_err)
    }

    pub fn close(&self, handle: FileHandle<H::File>) -> Result<(), OverlayError> {
        drop(handle.file);
        Ok(())
    }

    pub fn flock(&self, handle: &FileHandle<H::File>, op: i32) -> Result<(), OverlayError> {
        self.host.flock(&handle.file, op).map_err(host_err)
    }

    pub fn getpath(&self, path: &[u8]) -> Result<std::path::PathBuf, OverlayError> {
        self.host.getpath(path).map_err(host_err)
    }

    pub fn utime(&self, path: &[u8], atime_secs: i64, mtime_secs: i64) -> Result<(), OverlayError> {
        self.host.utime(path, atime_secs, mtime_secs).map_err(host_err)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn apply_attr_change(stat: &mut Stat, change: AttrChange) {
    match change {
        AttrChange::Uid(uid) => stat.uid = uid,
        AttrChange::Gid(gid) => stat.gid = gid,
        AttrChange::Mode(mode) => stat.mode = (stat.mode & libc::S_IFMT) | (mode & !libc::S_IFMT),
        AttrChange::Size(_) => unreachable!("size is handled by the host before reaching the store"),
    }
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

    fn mount() -> (tempfile::TempDir, MountSession<StdHostFs, ProcessCredentials>) {
        let root = tempfile::tempdir().unwrap();
        let data_dir = root.path().join("data");
        fs::create_dir(&data_dir).unwrap();
        Connection::open(root.path().join("meta.db")).unwrap();
        let host = StdHostFs::new(&data_dir);
        let session = MountSession::open(&data_dir, host, ProcessCredentials).unwrap();
        (root, session)
    }

    #[test]
    fn test_create_then_stat_reports_requested_mode_and_caller_credentials() {
        let (_root, session) = mount();
        let handle = session.open(b"/a", libc::O_CREAT | libc::O_WRONLY, 0o644).unwrap();
        session.close(handle).unwrap();

        let stat = session.stat(b"/a", true).unwrap();
        assert_eq!(stat.mode, 0o100644);
        assert_eq!(stat.uid, unsafe { libc::geteuid() });
        assert_eq!(stat.gid, unsafe { libc::getegid() });
        assert_eq!(stat.rdev, 0);
    }

    #[test]
    fn test_second_open_with_o_creat_does_not_clobber_existing_record() {
        let (_root, session) = mount();
        let h1 = session.open(b"/a", libc::O_CREAT | libc::O_WRONLY, 0o644).unwrap();
        session.setattr(b"/a", AttrChange::Mode(0o600)).unwrap();
        session.close(h1).unwrap();

        let h2 = session.open(b"/a", libc::O_CREAT | libc::O_WRONLY, 0o644).unwrap();
        session.close(h2).unwrap();

        let stat = session.stat(b"/a", true).unwrap();
        assert_eq!(stat.mode, 0o100600);
    }

    #[test]
    fn test_stat_on_missing_path_is_not_found() {
        let (_root, session) = mount();
        let err = session.stat(b"/nope", true).unwrap_err();
        assert!(matches!(err, OverlayError::NotFound));
    }

    #[test]
    fn test_hard_link_divergence_is_blocked_setattr_affects_both_names() {
        let (_root, session) = mount();
        let h = session.open(b"/a", libc::O_CREAT | libc::O_WRONLY, 0o644).unwrap();
        session.close(h).unwrap();
        session.link(b"/a", b"/b").unwrap();

        session.setattr(b"/b", AttrChange::Mode(0o600)).unwrap();

        let stat_a = session.stat(b"/a", true).unwrap();
        assert_eq!(stat_a.mode, 0o100600);
    }

    #[test]
    fn test_setattr_uid_is_visible_to_every_hard_link_sibling() {
        let (_root, session) = mount();
        let h = session.open(b"/a", libc::O_CREAT | libc::O_WRONLY, 0o644).unwrap();
        session.close(h).unwrap();
        session.link(b"/a", b"/b").unwrap();

        session.setattr(b"/a", AttrChange::Uid(4242)).unwrap();

        assert_eq!(session.stat(b"/a", true).unwrap().uid, 4242);
        assert_eq!(session.stat(b"/b", true).unwrap().uid, 4242);
    }

    #[test]
    fn test_unlink_leaves_hard_link_sibling_intact() {
        let (_root, session) = mount();
        let h = session.open(b"/a", libc::O_CREAT | libc::O_WRONLY, 0o644).unwrap();
        session.close(h).unwrap();
        session.link(b"/a", b"/b").unwrap();

        session.unlink(b"/a").unwrap();

        assert!(matches!(session.stat(b"/a", true).unwrap_err(), OverlayError::NotFound));
        assert!(session.stat(b"/b", true).is_ok());
    }

    #[test]
    fn test_rename_replaces_existing_destination_and_preserves_inode() {
        let (_root, session) = mount();
        let h_a = session.open(b"/a", libc::O_CREAT | libc::O_WRONLY, 0o644).unwrap();
        let inode_a = h_a.inode;
        session.close(h_a).unwrap();
        let h_b = session.open(b"/b", libc::O_CREAT | libc::O_WRONLY, 0o644).unwrap();
        session.close(h_b).unwrap();

        session.rename(b"/a", b"/b").unwrap();

        assert!(matches!(session.stat(b"/a", true).unwrap_err(), OverlayError::NotFound));
        let stat_b = session.stat(b"/b", true).unwrap();
        assert_eq!(stat_b.inode, inode_a);
    }

    #[test]
    fn test_symlink_to_nonexistent_target_round_trips_through_readlink() {
        let (_root, session) = mount();
        session.symlink(b"/nonexistent/target", b"/s").unwrap();

        let target = session.readlink(b"/s").unwrap();
        assert_eq!(target, b"/nonexistent/target");

        let stat = session.stat(b"/s", false).unwrap();
        assert_eq!(stat.mode & libc::S_IFMT, libc::S_IFLNK);
        assert_eq!(stat.mode & 0o777, 0o777);
    }

    #[test]
    fn test_readlink_on_non_symlink_is_invalid_argument() {
        let (_root, session) = mount();
        let h = session.open(b"/a", libc::O_CREAT | libc::O_WRONLY, 0o644).unwrap();
        session.close(h).unwrap();

        let err = session.readlink(b"/a").unwrap_err();
        assert!(matches!(err, OverlayError::InvalidArgument));
    }

    #[test]
    fn test_mknod_block_device_reports_requested_rdev_but_host_sees_regular_file() {
        let (_root, session) = mount();
        let dev = libc::makedev(7, 3);
        session.mknod(b"/dev/x", libc::S_IFBLK | 0o600, dev as u32).unwrap();

        let stat = session.stat(b"/dev/x", true).unwrap();
        assert_eq!(stat.mode & libc::S_IFMT, libc::S_IFBLK);
        assert_eq!(stat.rdev, dev as u64);

        let host_stat = session.host().lstat(b"/dev/x").unwrap();
        assert_eq!(host_stat.mode as libc::mode_t & libc::S_IFMT, libc::S_IFREG);
    }

    #[test]
    fn test_mkdir_records_overlay_mode_with_dir_bit() {
        let (_root, session) = mount();
        session.mkdir(b"/d", 0o750).unwrap();
        let stat = session.stat(b"/d", true).unwrap();
        assert_eq!(stat.mode, libc::S_IFDIR as u32 | 0o750);
    }

    #[test]
    fn test_failed_host_link_leaves_no_dangling_metadata_for_the_destination() {
        let (_root, session) = mount();
        // `/a` has no host entry, so `link` fails at the host layer before
        // any MS mutation happens (spec §8 P8: rollback leaves MS at its
        // pre-call state).
        let err = session.link(b"/a", b"/b").unwrap_err();
        assert!(matches!(err, OverlayError::Host(_)));
        assert!(matches!(session.stat(b"/b", true).unwrap_err(), OverlayError::NotFound));
    }

    #[test]
    fn test_failed_host_mkdir_over_an_existing_path_leaves_metadata_untouched() {
        let (_root, session) = mount();
        session.mkdir(b"/d", 0o750).unwrap();
        // Host `mkdir` over an existing directory fails with EEXIST; the
        // original Stat (mode 0750) must survive untouched.
        let err = session.mkdir(b"/d", 0o700).unwrap_err();
        assert!(matches!(err, OverlayError::Host(_)));
        let stat = session.stat(b"/d", true).unwrap();
        assert_eq!(stat.mode, libc::S_IFDIR as u32 | 0o750);
    }
}
