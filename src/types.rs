//! Wire types for the metadata store and the attributes it records.

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The fixed on-disk layout of a Stat row: four 32-bit little-endian fields,
/// in the order `mode, uid, gid, rdev`. This is a private format — callers
/// must not assume it matches the host's native `struct stat` layout or
/// endianness.
pub const STAT_BLOB_LEN: usize = 16;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// File-type and permission bits, plus the device-node and ownership fields
/// the overlay records independently of the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stat {
    /// `S_IFMT` file-type bits plus permission bits.
    pub mode: u32,
    /// Owning user id, as recorded by the overlay (not the host).
    pub uid: u32,
    /// Owning group id, as recorded by the overlay (not the host).
    pub gid: u32,
    /// Device number for character/block special files; zero otherwise.
    pub rdev: u32,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Stat {
    /// Serializes to the persisted 16-byte little-endian layout.
    pub fn to_blob(self) -> [u8; STAT_BLOB_LEN] {
        let mut buf = [0u8; STAT_BLOB_LEN];
        buf[0..4].copy_from_slice(&self.mode.to_le_bytes());
        buf[4..8].copy_from_slice(&self.uid.to_le_bytes());
        buf[8..12].copy_from_slice(&self.gid.to_le_bytes());
        buf[12..16].copy_from_slice(&self.rdev.to_le_bytes());
        buf
    }

    /// Deserializes from the persisted layout. Returns `None` if `bytes` is
    /// not exactly [`STAT_BLOB_LEN`] long — a store returning anything else
    /// indicates corruption, and callers should treat that as fatal rather
    /// than guess at a partial struct.
    pub fn from_blob(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != STAT_BLOB_LEN {
            return None;
        }
        let mode = u32::from_le_bytes(bytes[0..4].try_into().ok()?);
        let uid = u32::from_le_bytes(bytes[4..8].try_into().ok()?);
        let gid = u32::from_le_bytes(bytes[8..12].try_into().ok()?);
        let rdev = u32::from_le_bytes(bytes[12..16].try_into().ok()?);
        Some(Stat { mode, uid, gid, rdev })
    }

    /// `S_IFMT`-masked file-type bits.
    pub fn file_type(self) -> u32 {
        self.mode & libc::S_IFMT
    }

    pub fn is_symlink(self) -> bool {
        self.file_type() == libc::S_IFLNK
    }

    pub fn is_dir(self) -> bool {
        self.file_type() == libc::S_IFDIR
    }

    pub fn is_chr_or_blk(self) -> bool {
        self.file_type() == libc::S_IFCHR || self.file_type() == libc::S_IFBLK
    }
}

/// A single field mutation accepted by `setattr`/`fsetattr`. `Size` is
/// handled by the caller before reaching the store (spec: size is content,
/// not overlay metadata) and is only included here so callers have one enum
/// to dispatch on.
#[derive(Debug, Clone, Copy)]
pub enum AttrChange {
    Uid(u32),
    Gid(u32),
    /// Permission bits only; `S_IFMT` bits are preserved regardless of what
    /// is passed here.
    Mode(u32),
    Size(u64),
}

/// Host-observed attributes merged with overlay [`Stat`] fields by
/// [`crate::attr::project`] to produce what callers see.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostStat {
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: u64,
    pub blocks: u64,
    pub blksize: u32,
    pub nlink: u64,
    pub atime: (i64, i64),
    pub mtime: (i64, i64),
    pub ctime: (i64, i64),
}

/// The foreign-OS-visible attribute buffer: [`HostStat`] with `inode`,
/// `mode`, `uid`, `gid`, `rdev` replaced by the overlay's recorded values
/// (spec §4.5 — Attribute Projection).
#[derive(Debug, Clone, Copy, Default)]
pub struct ProjectedStat {
    pub inode: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: u64,
    pub blocks: u64,
    pub blksize: u32,
    pub nlink: u64,
    pub atime: (i64, i64),
    pub mtime: (i64, i64),
    pub ctime: (i64, i64),
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stat_round_trips_through_the_wire_layout() {
        let stat = Stat {
            mode: 0o100644,
            uid: 501,
            gid: 20,
            rdev: 0,
        };
        let blob = stat.to_blob();
        assert_eq!(blob.len(), STAT_BLOB_LEN);
        assert_eq!(Stat::from_blob(&blob), Some(stat));
    }

    #[test]
    fn test_from_blob_rejects_wrong_length() {
        assert_eq!(Stat::from_blob(&[0u8; 15]), None);
        assert_eq!(Stat::from_blob(&[0u8; 17]), None);
    }

    #[test]
    fn test_blob_layout_is_little_endian_regardless_of_host() {
        let stat = Stat {
            mode: 0x0102_0304,
            uid: 0,
            gid: 0,
            rdev: 0,
        };
        let blob = stat.to_blob();
        assert_eq!(&blob[0..4], &[0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn test_file_type_helpers() {
        let dir = Stat { mode: libc::S_IFDIR | 0o755, ..Default::default() };
        assert!(dir.is_dir());
        assert!(!dir.is_symlink());

        let link = Stat { mode: libc::S_IFLNK | 0o777, ..Default::default() };
        assert!(link.is_symlink());

        let blk = Stat { mode: libc::S_IFBLK | 0o600, ..Default::default() };
        assert!(blk.is_chr_or_blk());
    }
}
