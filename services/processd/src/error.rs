//! Service Status Codes
//!
//! The status taxonomy shared by every operation in the service. Codes map
//! one-to-one onto the values returned over IPC, so variants are added at
//! the end and never renumbered.

use thiserror::Error;

/// Operation status for the process manager service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum OsError {
    /// Caller passed arguments that can never be valid.
    #[error("invalid parameters")]
    InvalidParameters,
    /// Path, export or module key does not exist.
    #[error("not found")]
    NotFound,
    /// The object already exists (cache insertion race, duplicate load).
    #[error("already exists")]
    Exists,
    /// Allocation failure in this service or a collaborator.
    #[error("out of memory")]
    OutOfMemory,
    /// A transfer ended before the requested amount was moved.
    #[error("incomplete transfer")]
    Incomplete,
    /// Malformed PE image: bad header, missing section, truncated directory.
    #[error("invalid image format")]
    InvalidFormat,
    /// Valid but unimplemented: forwarded export, bound import descriptor,
    /// unknown relocation type, architecture mismatch.
    #[error("not supported")]
    NotSupported,
    /// The operation is not permitted on this object.
    #[error("permission denied")]
    PermissionDenied,
    /// Internal assertion failed.
    #[error("unknown error")]
    Unknown,
}
