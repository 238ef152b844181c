//! Kernel Memory Interface
//!
//! The loader consumes three kernel primitives: memory-space creation, the
//! creation of a mapping inside a target space (which also hands back a
//! writable *local* view of the same pages), and the release of such a
//! local view. The remote placement persists after the local view is
//! released; only the local window goes away.
//!
//! The trait exists so the subsystem can be driven both by the live kernel
//! client and by an in-process fake during tests.

use bitflags::bitflags;

use crate::error::OsError;
use crate::Uuid;

bitflags! {
    /// Page protection for a mapping, derived from PE section flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MappingFlags: u32 {
        const READ       = 0x1;
        const WRITE      = 0x2;
        const EXECUTABLE = 0x4;
    }
}

/// Parameters for creating a mapping inside a target memory space.
#[derive(Debug, Clone, Copy)]
pub struct MappingParameters {
    /// Absolute virtual address inside the target space.
    pub virtual_address: u64,
    /// Length of the mapping in bytes.
    pub length: usize,
    /// Protection of the remote mapping. The local view is always writable.
    pub flags: MappingFlags,
}

/// Kernel memory operations consumed by the loader.
pub trait MemoryApi: Send + Sync {
    /// Create a new, empty memory space for a process being started.
    fn create_memory_space(&self, flags: u32) -> Result<Uuid, OsError>;

    /// Create a mapping at `params.virtual_address` inside `memory_space`
    /// and return a writable local view of the same pages. The caller must
    /// release the view with [`MemoryApi::free_mapping`].
    fn create_mapping(
        &self,
        memory_space: Uuid,
        params: &MappingParameters,
    ) -> Result<*mut u8, OsError>;

    /// Release a local view previously returned by `create_mapping`. The
    /// remote mapping stays in place.
    fn free_mapping(&self, local_address: *mut u8, length: usize) -> Result<(), OsError>;

    /// The lowest virtual address at which process images are placed. Every
    /// load context starts its allocation watermark here.
    fn process_base_address(&self) -> u64;
}
