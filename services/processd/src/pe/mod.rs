//! PE Image Loader and Runtime Linker
//!
//! Four layers, leaves first:
//!
//! 1. [`cache`]: process-wide store of parsed modules keyed by content
//!    hash, so two processes loading the same DLL share one parse.
//! 2. [`parse`]: turns a raw file buffer into a [`module::Module`] view:
//!    headers, section records, data directories, export tables.
//! 3. [`mapper`]: places a module's sections into the target memory
//!    space with the right protections and initial contents.
//! 4. [`loader`]: the dependency walk: resolve path, fetch from cache,
//!    map, link imports (recursively), relocate, register in the
//!    [`context::LoadContext`]. Also serves the dynamic
//!    `load_library` / `find_export` / `unload` requests and, through
//!    [`depgraph`], the dependency-ordered initializer list.
//!
//! A fresh process start is `LoadContext::new` followed by
//! [`loader::load`] of the root image; the host then queries
//! [`depgraph::module_entry_points`] and jumps to each address in order.

pub mod cache;
pub mod context;
pub mod depgraph;
pub mod format;
pub mod imports;
pub mod loader;
pub mod mapper;
pub mod module;
pub mod parse;
pub mod relocs;
pub mod resolver;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::ModuleCache;
pub use context::{ImportRef, LoadContext, ModuleMapEntry};
pub use depgraph::{module_entry_points, module_keys};
pub use loader::{find_export, load, load_library, unload};
pub use mapper::{ModuleMapping, SectionMapping};
pub use module::{ExportedFunction, Module, ParsedImage, Section};
pub use resolver::resolve_path;
