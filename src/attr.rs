//! Attribute Projection (spec §4.5): merges the overlay-recorded [`Stat`]
//! over a host [`HostStat`] so callers observe foreign-OS semantics. Size,
//! times, block counts, and link count flow through from the host
//! unchanged; `inode`, `mode`, `uid`, `gid`, `rdev` are replaced.

use crate::types::{HostStat, ProjectedStat, Stat};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Produces the caller-visible attribute buffer.
pub fn project(inode: u64, stat: Stat, host: HostStat) -> ProjectedStat {
    ProjectedStat {
        inode,
        mode: stat.mode,
        uid: stat.uid,
        gid: stat.gid,
        rdev: stat.rdev as u64,
        size: host.size,
        blocks: host.blocks,
        blksize: host.blksize,
        nlink: host.nlink,
        atime: host.atime,
        mtime: host.mtime,
        ctime: host.ctime,
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlay_fields_replace_host_fields_others_pass_through() {
        let stat = Stat { mode: libc::S_IFBLK | 0o600, uid: 7, gid: 8, rdev: 0x0703 };
        let host = HostStat {
            dev: 1,
            ino: 42,
            mode: libc::S_IFREG | 0o666,
            uid: 0,
            gid: 0,
            rdev: 0,
            size: 2,
            blocks: 8,
            blksize: 4096,
            nlink: 1,
            atime: (100, 0),
            mtime: (200, 0),
            ctime: (300, 0),
        };
        let projected = project(99, stat, host);
        assert_eq!(projected.inode, 99);
        assert_eq!(projected.mode, stat.mode);
        assert_eq!(projected.uid, 7);
        assert_eq!(projected.gid, 8);
        assert_eq!(projected.rdev, 0x0703);
        assert_eq!(projected.size, 2);
        assert_eq!(projected.nlink, 1);
        assert_eq!(projected.mtime, (200, 0));
    }
}
