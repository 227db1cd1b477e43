//! The passthrough / credential-source collaborators (spec §1, §6). These
//! are narrow seams the core depends on; a real deployment wires in a
//! passthrough filesystem layer that implements byte I/O, `readdir`,
//! `fsync`, `flock`, `utime`, and `statfs` on the host plus a
//! virtual-file-descriptor layer and a foreign-OS errno table. None of
//! that is re-specified here (spec §1 "Out of scope"). [`StdHostFs`] is a
//! reference implementation — just enough to run the tests in this crate
//! and to demonstrate the shape of the seam — not a production passthrough
//! layer.

use std::ffi::OsStr;
use std::fs;
use std::io;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt, PermissionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use crate::types::HostStat;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A single entry discovered while walking the host tree (used by the
/// rebuild engine).
#[derive(Debug, Clone)]
pub struct WalkEntry {
    /// Path relative to the data tree root, as raw bytes.
    pub path: Vec<u8>,
    pub stat: HostStat,
}

/// The passthrough collaborator OPS and the rebuild engine call into. Paths
/// are relative to the mounted data tree and are opaque byte strings (spec
/// §9 "Path as bytes, not string") — never assume they are valid UTF-8.
pub trait HostFs: Send + Sync {
    type File: io::Read + io::Write + Send;

    /// Opens (optionally creating) a file. The overlay always requests
    /// mode 0666 for newly created files — overlay-level permissions are
    /// recorded separately and are authoritative (spec §4.4 "open").
    fn open(&self, path: &[u8], flags: i32) -> io::Result<Self::File>;

    /// Creates a new regular file exclusively (`O_CREAT|O_EXCL`), used by
    /// `symlink` to write the link target as plain bytes.
    fn create_exclusive(&self, path: &[u8]) -> io::Result<Self::File>;

    fn link(&self, src: &[u8], dst: &[u8]) -> io::Result<()>;
    fn unlink(&self, path: &[u8]) -> io::Result<()>;
    fn rmdir(&self, path: &[u8]) -> io::Result<()>;
    fn rename(&self, src: &[u8], dst: &[u8]) -> io::Result<()>;

    /// Host `mkdir`, always with mode 0777 (spec §4.4 "mkdir" — the
    /// overlay's requested mode is recorded in the Stat row instead).
    fn mkdir(&self, path: &[u8]) -> io::Result<()>;

    /// Host `mknod` with the exact raw mode OPS computed (regular-file
    /// fallback for char/block special, or the real type bits otherwise).
    fn mknod(&self, path: &[u8], raw_mode: u32) -> io::Result<()>;

    fn lstat(&self, path: &[u8]) -> io::Result<HostStat>;
    fn stat(&self, path: &[u8], follow_links: bool) -> io::Result<HostStat>;
    fn fstat(&self, file: &Self::File) -> io::Result<HostStat>;

    /// Real host `readlink`. Host entries the overlay created are always
    /// regular files, so this is expected to fail with `EINVAL` for them;
    /// `readlink` (the verb) falls back to reading file contents in that
    /// case (spec §4.4 "readlink").
    fn readlink(&self, path: &[u8]) -> io::Result<Vec<u8>>;

    fn read_to_end(&self, path: &[u8]) -> io::Result<Vec<u8>>;
    fn write_all(&self, file: &mut Self::File, data: &[u8]) -> io::Result<()>;

    fn truncate(&self, path: &[u8], size: u64) -> io::Result<()>;
    fn ftruncate(&self, file: &Self::File, size: u64) -> io::Result<()>;

    fn statfs(&self) -> io::Result<nix::sys::statvfs::Statvfs>;
    fn flock(&self, file: &Self::File, op: i32) -> io::Result<()>;
    fn getpath(&self, path: &[u8]) -> io::Result<PathBuf>;
    fn utime(&self, path: &[u8], atime_secs: i64, mtime_secs: i64) -> io::Result<()>;

    /// Recursively lists every entry under the data tree root, used only by
    /// the rebuild engine (spec §4.3).
    fn walk(&self) -> io::Result<Vec<WalkEntry>>;

    /// The host inode of the mount source's root directory, used at mount
    /// time; not part of the FUSE-equivalent verb table but needed to
    /// distinguish "root exists" failures from ordinary I/O errors.
    fn root_exists(&self) -> bool;
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn bytes_to_path(bytes: &[u8]) -> &Path {
    Path::new(OsStr::from_bytes(bytes))
}

fn nix_to_io(err: nix::Error) -> io::Error {
    io::Error::from_raw_os_error(err as i32)
}

/// Maps the raw `flock(2)` `op` argument (`LOCK_SH`/`LOCK_EX`/`LOCK_UN`,
/// optionally `| LOCK_NB`) a verb passes through to nix's typed `FlockArg`.
fn flock_arg(op: i32) -> io::Result<nix::fcntl::FlockArg> {
    use nix::fcntl::FlockArg::*;
    let nonblock = op & libc::LOCK_NB != 0;
    match op & !libc::LOCK_NB {
        libc::LOCK_SH => Ok(if nonblock { LockSharedNonblock } else { LockShared }),
        libc::LOCK_EX => Ok(if nonblock { LockExclusiveNonblock } else { LockExclusive }),
        libc::LOCK_UN => Ok(if nonblock { UnlockNonblock } else { Unlock }),
        _ => Err(io::Error::from_raw_os_error(libc::EINVAL)),
    }
}

fn to_host_stat(meta: &fs::Metadata) -> HostStat {
    HostStat {
        dev: meta.dev(),
        ino: meta.ino(),
        mode: meta.mode(),
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev(),
        size: meta.size(),
        blocks: meta.blocks(),
        blksize: meta.blksize() as u32,
        nlink: meta.nlink(),
        atime: (meta.atime(), meta.atime_nsec()),
        mtime: (meta.mtime(), meta.mtime_nsec()),
        ctime: (meta.ctime(), meta.ctime_nsec()),
    }
}

/// A reference [`HostFs`] rooted at a plain host directory. Not a
/// hardened passthrough layer — no symlink-escape defenses, no per-call
/// `openat` relative to a held root descriptor. Good enough to exercise
/// the overlay's own logic in tests, where the root is always a
/// `tempfile::TempDir` under this crate's control.
pub struct StdHostFs {
    root: PathBuf,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl StdHostFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        StdHostFs { root: root.into() }
    }

    /// Overlay paths are stored with a leading `/` (matching the literal
    /// scenarios in spec §8, e.g. `"/a"`); strip it before joining so the
    /// result stays under `root` instead of replacing it (`Path::join`
    /// discards the base when given an absolute path).
    fn full_path(&self, path: &[u8]) -> PathBuf {
        let trimmed = path.strip_prefix(b"/").unwrap_or(path);
        self.root.join(bytes_to_path(trimmed))
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl HostFs for StdHostFs {
    type File = fs::File;

    fn open(&self, path: &[u8], flags: i32) -> io::Result<Self::File> {
        let mut opts = fs::OpenOptions::new();
        opts.read(flags & libc::O_WRONLY == 0);
        opts.write(flags & (libc::O_WRONLY | libc::O_RDWR) != 0);
        opts.create(flags & libc::O_CREAT != 0);
        opts.truncate(flags & libc::O_TRUNC != 0);
        opts.mode(0o666);
        opts.open(self.full_path(path))
    }

    fn create_exclusive(&self, path: &[u8]) -> io::Result<Self::File> {
        fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o666)
            .open(self.full_path(path))
    }

    fn link(&self, src: &[u8], dst: &[u8]) -> io::Result<()> {
        fs::hard_link(self.full_path(src), self.full_path(dst))
    }

    fn unlink(&self, path: &[u8]) -> io::Result<()> {
        fs::remove_file(self.full_path(path))
    }

    fn rmdir(&self, path: &[u8]) -> io::Result<()> {
        fs::remove_dir(self.full_path(path))
    }

    fn rename(&self, src: &[u8], dst: &[u8]) -> io::Result<()> {
        fs::rename(self.full_path(src), self.full_path(dst))
    }

    fn mkdir(&self, path: &[u8]) -> io::Result<()> {
        fs::create_dir(self.full_path(path))?;
        fs::set_permissions(self.full_path(path), fs::Permissions::from_mode(0o777))
    }

    fn mknod(&self, path: &[u8], raw_mode: u32) -> io::Result<()> {
        // `StdHostFs` has no portable mknod(2) binding for non-regular
        // types; since the overlay only ever asks the host for a regular
        // file here (char/block special are always stored as S_IFREG on
        // the host per spec §4.4), a plain create covers every real call.
        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(raw_mode & 0o777)
            .open(self.full_path(path))?;
        drop(file);
        Ok(())
    }

    fn lstat(&self, path: &[u8]) -> io::Result<HostStat> {
        fs::symlink_metadata(self.full_path(path)).map(|m| to_host_stat(&m))
    }

    fn stat(&self, path: &[u8], follow_links: bool) -> io::Result<HostStat> {
        let meta = if follow_links {
            fs::metadata(self.full_path(path))?
        } else {
            fs::symlink_metadata(self.full_path(path))?
        };
        Ok(to_host_stat(&meta))
    }

    fn fstat(&self, file: &Self::File) -> io::Result<HostStat> {
        file.metadata().map(|m| to_host_stat(&m))
    }

    fn readlink(&self, path: &[u8]) -> io::Result<Vec<u8>> {
        // The host never stores a real symlink for overlay entries, so
        // this always reports EINVAL in practice; kept for interface
        // completeness and for hosts where that assumption doesn't hold.
        match fs::read_link(self.full_path(path)) {
            Ok(target) => Ok(target.into_os_string().into_vec()),
            Err(_) => Err(io::Error::from_raw_os_error(libc::EINVAL)),
        }
    }

    fn read_to_end(&self, path: &[u8]) -> io::Result<Vec<u8>> {
        fs::read(self.full_path(path))
    }

    fn write_all(&self, file: &mut Self::File, data: &[u8]) -> io::Result<()> {
        use std::io::Write;
        file.write_all(data)
    }

    fn truncate(&self, path: &[u8], size: u64) -> io::Result<()> {
        let file = fs::OpenOptions::new().write(true).open(self.full_path(path))?;
        file.set_len(size)
    }

    fn ftruncate(&self, file: &Self::File, size: u64) -> io::Result<()> {
        file.set_len(size)
    }

    fn statfs(&self) -> io::Result<nix::sys::statvfs::Statvfs> {
        nix::sys::statvfs::statvfs(&self.root).map_err(nix_to_io)
    }

    fn flock(&self, file: &Self::File, op: i32) -> io::Result<()> {
        let arg = flock_arg(op)?;
        nix::fcntl::flock(file.as_raw_fd(), arg).map_err(nix_to_io)
    }

    fn getpath(&self, path: &[u8]) -> io::Result<PathBuf> {
        Ok(self.full_path(path))
    }

    fn utime(&self, path: &[u8], atime_secs: i64, mtime_secs: i64) -> io::Result<()> {
        let atime = nix::sys::time::TimeSpec::new(atime_secs, 0);
        let mtime = nix::sys::time::TimeSpec::new(mtime_secs, 0);
        nix::sys::stat::utimensat(
            None,
            &self.full_path(path),
            &atime,
            &mtime,
            nix::sys::stat::UtimensatFlags::FollowSymlink,
        )
        .map_err(nix_to_io)
    }

    fn walk(&self) -> io::Result<Vec<WalkEntry>> {
        let mut out = Vec::new();
        walk_dir(&self.root, &self.root, &mut out)?;
        Ok(out)
    }

    fn root_exists(&self) -> bool {
        self.root.is_dir()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn walk_dir(root: &Path, dir: &Path, out: &mut Vec<WalkEntry>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let meta = entry.metadata()?;
        let mut rel = Vec::from(*b"/");
        rel.extend_from_slice(
            path.strip_prefix(root)
                .expect("walked entry is under root")
                .as_os_str()
                .as_bytes(),
        );
        out.push(WalkEntry { path: rel, stat: to_host_stat(&meta) });
        if meta.is_dir() {
            walk_dir(root, &path, out)?;
        }
    }
    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The process credential source (spec §1 "process credential source of
/// the caller"). Narrow on purpose: overlay verbs only ever need the
/// effective uid/gid to stamp newly created Stat rows.
pub trait Credentials: Send + Sync {
    fn euid(&self) -> u32;
    fn egid(&self) -> u32;
}

/// Reads the real process's effective credentials.
pub struct ProcessCredentials;

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Credentials for ProcessCredentials {
    fn euid(&self) -> u32 {
        unsafe { libc::geteuid() }
    }

    fn egid(&self) -> u32 {
        unsafe { libc::getegid() }
    }
}
