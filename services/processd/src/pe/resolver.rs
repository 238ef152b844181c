//! Path Resolver
//!
//! Turns the module names found in import descriptors into absolute paths.
//! Absolute paths pass through untouched; anything else is probed against
//! the context's semicolon-separated search path list, where ramdisk
//! directories are tested against the ramdisk index and everything else
//! with a filesystem stat.

use log::trace;

use crate::error::OsError;
use crate::pe::cache::RAMDISK_PREFIX;
use crate::pe::context::LoadContext;

/// Base name of a path: everything after the final separator.
pub fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn join(directory: &str, file: &str) -> String {
    if directory.ends_with('/') {
        format!("{}{}", directory, file)
    } else {
        format!("{}/{}", directory, file)
    }
}

/// Resolve `path` to an absolute path, or `NotFound` when no search-path
/// candidate exists.
pub fn resolve_path(ctx: &LoadContext, path: &str) -> Result<String, OsError> {
    trace!("resolve_path(path={})", path);

    if path.starts_with('/') {
        return Ok(path.to_string());
    }

    for directory in ctx.paths().split(';') {
        if directory.is_empty() {
            continue;
        }
        let candidate = join(directory, path);
        trace!("resolve_path testing {}", candidate);

        if candidate.starts_with(RAMDISK_PREFIX) {
            if ctx.cache.ramdisk().find_ramdisk_file(&candidate).is_ok() {
                return Ok(candidate);
            }
        } else if ctx.cache.fs().stat(&candidate).is_ok() {
            return Ok(candidate);
        }
    }
    Err(OsError::NotFound)
}
