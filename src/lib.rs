//! `fakefs` pairs a host directory tree with a SQLite sidecar so a host
//! filesystem that has no native concept of Unix ownership, permission
//! bits, device nodes, or stable inode numbers can still present them to
//! callers that need them.
//!
//! # Design
//!
//! - [`store`] — the Metadata Store: the `paths`/`stats`/`meta` relations
//!   and the transaction guard every mutating verb runs inside.
//! - [`host`] — the `HostFs`/`Credentials` seams a deployment wires to its
//!   own passthrough filesystem and process credential source.
//! - [`session`] — mounts a data tree against its metadata sidecar,
//!   running validation, migration, and conditional rebuild.
//! - [`rebuild`] — reconciles the `paths` relation after the host has
//!   renumbered inodes out from under a previously mounted store.
//! - [`ops`] — the verb table: `open`, `link`, `unlink`, `rename`,
//!   `symlink`, `mknod`, `mkdir`, `rmdir`, `stat`, `fstat`, `setattr`,
//!   `fsetattr`, `readlink`, plus thin passthrough forwards.
//! - [`attr`] — merges a recorded [`types::Stat`] over a host
//!   [`types::HostStat`] into the [`types::ProjectedStat`] callers see.
//!
//! # Errors
//!
//! [`error::OverlayError`] distinguishes three tiers (spec'd in
//! `error`'s module doc): ordinary host failures, semantic overlay
//! errors, and internal-consistency violations a caller must treat as
//! fatal — see [`error::OverlayError::is_fatal`] and
//! [`error::abort_process`].

//--------------------------------------------------------------------------------------------------
// Modules
//--------------------------------------------------------------------------------------------------

pub mod attr;
pub mod error;
pub mod host;
pub mod ops;
pub mod rebuild;
pub mod session;
pub mod store;
pub mod types;

//--------------------------------------------------------------------------------------------------
// Re-exports
//--------------------------------------------------------------------------------------------------

pub use error::OverlayError;
pub use host::{Credentials, HostFs, ProcessCredentials, StdHostFs};
pub use ops::FileHandle;
pub use session::{MountConfig, MountSession};
pub use types::{AttrChange, ProjectedStat, Stat};
