//! Error tiers for the overlay (spec §7): expected host failures, semantic
//! overlay errors, and fatal internal-consistency violations that abort the
//! process rather than risk silently diverging from I4.

use std::fmt;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Errors a Metadata Store operation can return. Only
/// [`StoreError::Fatal`] is ever allowed to reach a caller without the
/// overlay aborting — every non-fatal path is handled inline (missing row,
/// zero rows affected) by the call sites in [`crate::store`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The underlying sqlite error was anything other than ok/row/done. Per
    /// spec §4.1, this is always fatal — it indicates a logic bug or store
    /// corruption.
    #[error("fatal metadata store error: {0}")]
    Fatal(String),
}

/// The error surface every overlay verb returns.
#[derive(Debug, thiserror::Error)]
pub enum OverlayError {
    /// Tier 1 (spec §7): an expected host-side failure, carried as the
    /// negative foreign-OS error code the passthrough layer returned.
    #[error("host operation failed with errno {0}")]
    Host(i32),

    /// Tier 2: the path has no overlay Path record.
    #[error("not found")]
    NotFound,

    /// Tier 2: `readlink` was called on a non-symlink, or the mount source
    /// is malformed in a way spec §4.2 treats as invalid argument rather
    /// than fatal (e.g. the metadata file is not a recognizable store).
    #[error("invalid argument")]
    InvalidArgument,

    /// Tier 3 (spec §7): unrecoverable internal-consistency violation.
    /// Constructing this variant is meant to be followed by aborting the
    /// process; see [`abort_process`]. Every OPS verb routes its result
    /// through [`check_fatal`] at its boundary so this never reaches a
    /// caller as an ordinary `Err`.
    #[error("fatal overlay error: {0}")]
    Fatal(String),
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl StoreError {
    pub(crate) fn fatal(context: &str, err: rusqlite::Error) -> Self {
        log::error!("metadata store fatal error during {context}: {err}");
        StoreError::Fatal(format!("{context}: {err}"))
    }
}

impl OverlayError {
    /// True for the tier-3 errors that must abort the process per spec §7.
    pub fn is_fatal(&self) -> bool {
        matches!(self, OverlayError::Fatal(_))
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl From<StoreError> for OverlayError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Fatal(msg) => OverlayError::Fatal(msg),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Wraps a host `io::Error` as the negative-errno [`OverlayError::Host`]
/// tier-1 variant (spec §7). Used by every `ops` verb at the seam where a
/// passthrough call returns.
pub fn host_err(err: std::io::Error) -> OverlayError {
    OverlayError::Host(-err.raw_os_error().unwrap_or(libc::EIO))
}

/// Aborts the process with a diagnostic. Called after any [`OverlayError::Fatal`]
/// or [`StoreError::Fatal`] is observed at a verb boundary — per spec §7 the
/// overlay's entire value proposition is I4 (mutual consistency of the
/// data tree and the metadata store), and proceeding past unrecognized
/// corruption would silently lose that guarantee.
pub fn abort_process(diagnostic: impl fmt::Display) -> ! {
    log::error!("fakefs: aborting process: {diagnostic}");
    std::process::abort();
}

/// Every OPS verb's public entry point routes its result through this
/// before returning it to the caller. A tier-3 [`OverlayError::Fatal`]
/// never reaches a caller as an ordinary `Err` — it aborts the process
/// here, at the verb boundary, per spec §7.
pub(crate) fn check_fatal<T>(result: Result<T, OverlayError>) -> Result<T, OverlayError> {
    if let Err(err) = &result {
        if err.is_fatal() {
            abort_process(err);
        }
    }
    result
}

/// Negative foreign-OS error code constants used throughout `ops`/`session`.
/// These mirror the small, fixed subset of errno values the spec names
/// explicitly; the full translation table is an external collaborator
/// (spec §1) and is not reimplemented here.
pub mod errno {
    pub const ENOENT: i32 = -2;
    pub const EEXIST: i32 = -17;
    pub const EINVAL: i32 = -22;
    pub const ENOTEMPTY: i32 = -39;
}
