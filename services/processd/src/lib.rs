//! Process Manager Service (processd)
//!
//! Hosts the PE image loader and runtime linker used to start every process
//! in the system. Given a root executable path and a target memory space,
//! the subsystem:
//! - resolves and loads the binary plus, transitively, every DLL it imports,
//! - places each module's sections into a single growing virtual region,
//! - rewrites embedded pointers for the load-address delta,
//! - stitches import address tables to provider export tables,
//! - orders the loaded modules so initializers can run dependency-first.
//!
//! # Architecture
//!
//! ```text
//! request                 +-----------+
//!   load("root.app") ---> |  Linker   | --- recursion per import
//!                         +-----+-----+
//!                               |
//!              +----------------+----------------+
//!              v                v                v
//!        +-----------+   +-----------+    +-----------+
//!        |  Mapper   |   | Relocator |    |  Imports  |
//!        +-----+-----+   +-----------+    +-----------+
//!              v
//!        +-----------+   +--------------------+
//!        |  Parser   |<--| Parsed-module cache| (process-wide, shared)
//!        +-----------+   +--------------------+
//! ```
//!
//! The kernel (memory spaces and mappings), the filesystem client and the
//! ramdisk are external collaborators, consumed through the traits in
//! [`memory`] and [`vfs`].

pub mod error;
pub mod memory;
pub mod pe;
pub mod vfs;

pub use error::OsError;

/// Kernel object handle, as handed out by the system APIs.
pub type Uuid = u32;

/// Handle value that never names a live kernel object.
pub const UUID_INVALID: Uuid = 0;
