//! Filesystem and Ramdisk Interfaces
//!
//! The cache reads whole image files through [`FileSystemApi`]; the path
//! resolver probes candidate paths with `stat`. Paths under `/initfs/` are
//! instead served by the bootstrap ramdisk, which holds the modules needed
//! before the filesystem service is up.

use crate::error::OsError;

/// Blocking filesystem operations consumed by the loader.
pub trait FileSystemApi: Send + Sync {
    /// Read the entire file at `path`. A short read is reported as
    /// [`OsError::Incomplete`], never as a truncated buffer.
    fn read_file(&self, path: &str) -> Result<Vec<u8>, OsError>;

    /// Existence / attribute probe used by the path resolver.
    fn stat(&self, path: &str) -> Result<(), OsError>;
}

/// Bootstrap ramdisk lookup.
pub trait RamdiskApi: Send + Sync {
    /// Find a file in the ramdisk archive and return its contents.
    fn find_ramdisk_file(&self, path: &str) -> Result<Vec<u8>, OsError>;
}
