//! Load Context
//!
//! The per-process collection of loaded modules: their placements inside
//! the process memory space, the free-address watermark used to place the
//! next module, and the bookkeeping the dynamic loader operations work
//! against. A context is owned by one process-management request at a time
//! and is not internally locked; the shared module cache it references has
//! its own locking.

use std::collections::HashMap;
use std::sync::Arc;

use log::{trace, warn};

use crate::error::OsError;
use crate::memory::MemoryApi;
use crate::pe::cache::ModuleCache;
use crate::pe::loader;
use crate::pe::module::Module;
use crate::Uuid;

/// Reference from a consumer module to one module it imports.
#[derive(Debug, Clone)]
pub struct ImportRef {
    /// Context-local ID of the imported module.
    pub id: u32,
    /// Base name of the imported module (its key in the module map).
    pub name: String,
}

/// One loaded module inside a context.
#[derive(Debug)]
pub struct ModuleMapEntry {
    /// Context-local ID; 0 is always the root module.
    pub id: u32,
    /// Base name, the key in the context's module map.
    pub name: String,
    /// Resolved absolute path the module was loaded from.
    pub path: String,
    /// Absolute base address of the placement.
    pub base_mapping: u64,
    /// The shared parsed module.
    pub module: Arc<Module>,
    /// Loaded as a dependency; such entries can only be unloaded when the
    /// whole context is torn down.
    pub dependency: bool,
    /// Modules this entry directly imports.
    pub imports: Vec<ImportRef>,
}

/// Per-process load context.
pub struct LoadContext {
    scope: Uuid,
    memory_space: Uuid,
    paths: String,
    pub(crate) load_address: u64,
    pub(crate) next_id: u32,
    pub(crate) module_map: HashMap<String, ModuleMapEntry>,
    pub(crate) root_module: Option<String>,
    pub(crate) cache: Arc<ModuleCache>,
    pub(crate) memory: Arc<dyn MemoryApi>,
}

impl LoadContext {
    /// Create a context for a process being started: a fresh memory space
    /// and an allocation watermark at the system load address.
    ///
    /// `scope` names the namespace used when resolving non-absolute paths;
    /// `paths` is the semicolon-separated search path list.
    pub fn new(
        cache: Arc<ModuleCache>,
        memory: Arc<dyn MemoryApi>,
        scope: Uuid,
        paths: &str,
    ) -> Result<Self, OsError> {
        trace!("LoadContext::new(scope={}, paths={})", scope, paths);
        let memory_space = memory.create_memory_space(0)?;
        let load_address = memory.process_base_address();
        Ok(Self {
            scope,
            memory_space,
            paths: paths.to_string(),
            load_address,
            next_id: 0,
            module_map: HashMap::new(),
            root_module: None,
            cache,
            memory,
        })
    }

    /// Namespace token for path resolution.
    pub fn scope(&self) -> Uuid {
        self.scope
    }

    /// Kernel handle of the target memory space.
    pub fn memory_space(&self) -> Uuid {
        self.memory_space
    }

    /// Semicolon-separated search path list.
    pub fn paths(&self) -> &str {
        &self.paths
    }

    /// Base name of the root module, once the first load completed.
    pub fn root_module(&self) -> Option<&str> {
        self.root_module.as_deref()
    }

    /// Number of modules currently loaded in this context.
    pub fn module_count(&self) -> usize {
        self.module_map.len()
    }

    pub(crate) fn allocate_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Look up a loaded module by its base name.
    pub fn entry(&self, name: &str) -> Option<&ModuleMapEntry> {
        self.module_map.get(name)
    }

    pub(crate) fn entry_by_id(&self, id: u32) -> Option<&ModuleMapEntry> {
        self.module_map.values().find(|entry| entry.id == id)
    }

    /// Resolved absolute path of a loaded module.
    pub fn module_path(&self, name: &str) -> Result<&str, OsError> {
        self.module_map
            .get(name)
            .map(|entry| entry.path.as_str())
            .ok_or(OsError::NotFound)
    }

    /// Absolute entry point address of a loaded module.
    pub fn module_entry_point(&self, name: &str) -> Result<u64, OsError> {
        let entry = self.module_map.get(name).ok_or(OsError::NotFound)?;
        let parsed = entry.module.parsed()?;
        Ok(entry.base_mapping + parsed.entry_point_rva as u64)
    }

    /// Find the module whose code segment contains `address` and return
    /// its base address and name. Used for crash symbolication.
    pub fn module_details_by_address(&self, address: u64) -> Result<(u64, &str), OsError> {
        for entry in self.module_map.values() {
            let parsed = entry.module.parsed()?;
            let start = entry.base_mapping + parsed.code_base_rva as u64;
            let end = start + parsed.code_size as u64;
            if address >= start && address < end {
                return Ok((entry.base_mapping, entry.name.as_str()));
            }
        }
        Err(OsError::NotFound)
    }

    /// Tear the context down: force-unload every module, root first.
    /// Failures are logged and skipped; teardown always makes progress.
    pub fn destroy(mut self) {
        trace!("LoadContext::destroy()");
        if let Some(root) = self.root_module.clone() {
            if let Err(err) = loader::unload(&mut self, &root, true) {
                warn!("LoadContext::destroy failed to unload {}: {}", root, err);
            }
        }
        // Anything the root never reached goes out the same way.
        while let Some(name) = self.module_map.keys().next().cloned() {
            if let Err(err) = loader::unload(&mut self, &name, true) {
                warn!("LoadContext::destroy failed to unload {}: {}", name, err);
                self.module_map.remove(&name);
            }
        }
    }
}
