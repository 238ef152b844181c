//! Parsed-Module Cache
//!
//! Process-wide store of every PE image the service has opened, keyed by
//! the image checksum, so two processes loading the same DLL share one
//! parse. A second table maps absolute paths to checksums so repeat loads
//! of a known path skip the file read entirely.
//!
//! Two independent mutexes protect the two tables; path insertion never
//! holds the module lock and vice versa. When two loaders race on the same
//! new image, the loser's freshly built module is discarded and the
//! winner's is returned.

use std::collections::HashMap;
use std::sync::Arc;

use log::{error, trace};
use spin::Mutex;

use crate::error::OsError;
use crate::pe::module::{validate_image_checksum, Module};
use crate::vfs::{FileSystemApi, RamdiskApi};

/// Paths with this prefix are served from the bootstrap ramdisk.
pub const RAMDISK_PREFIX: &str = "/initfs/";

struct ModuleEntry {
    references: u32,
    module: Arc<Module>,
}

/// Shared cache of parsed modules. One instance is created by the service
/// and handed to every load context at construction.
pub struct ModuleCache {
    fs: Arc<dyn FileSystemApi>,
    ramdisk: Arc<dyn RamdiskApi>,
    /// path -> image checksum
    paths: Mutex<HashMap<String, u32>>,
    /// image checksum -> refcounted module
    modules: Mutex<HashMap<u32, ModuleEntry>>,
}

impl ModuleCache {
    pub fn new(fs: Arc<dyn FileSystemApi>, ramdisk: Arc<dyn RamdiskApi>) -> Self {
        Self {
            fs,
            ramdisk,
            paths: Mutex::new(HashMap::new()),
            modules: Mutex::new(HashMap::new()),
        }
    }

    /// Filesystem client, shared with the path resolver.
    pub fn fs(&self) -> &dyn FileSystemApi {
        &*self.fs
    }

    /// Ramdisk client, shared with the path resolver.
    pub fn ramdisk(&self) -> &dyn RamdiskApi {
        &*self.ramdisk
    }

    /// Get the module for `path`, loading and caching it on first use.
    pub fn get(&self, path: &str) -> Result<Arc<Module>, OsError> {
        trace!("ModuleCache::get(path={})", path);

        let hash = match self.lookup_hash(path) {
            Some(hash) => hash,
            None => {
                trace!("ModuleCache::get path not seen before, loading");
                self.load_module(path).inspect_err(|err| {
                    error!("ModuleCache::get failed to load module: {}", err);
                })?
            }
        };

        // The module must exist now; a miss here is an internal fault.
        self.acquire_module(hash).ok_or_else(|| {
            error!("ModuleCache::get missing module for hash {:#x}", hash);
            OsError::Unknown
        })
    }

    /// Drop one reference previously taken by [`ModuleCache::get`]. The
    /// module itself stays cached until the cache is torn down.
    pub fn release(&self, module: &Module) {
        let mut modules = self.modules.lock();
        if let Some(entry) = modules.get_mut(&module.hash()) {
            entry.references = entry.references.saturating_sub(1);
        }
    }

    fn lookup_hash(&self, path: &str) -> Option<u32> {
        self.paths.lock().get(path).copied()
    }

    fn insert_hash(&self, path: &str, hash: u32) {
        self.paths.lock().insert(path.to_string(), hash);
    }

    fn acquire_module(&self, hash: u32) -> Option<Arc<Module>> {
        let mut modules = self.modules.lock();
        let entry = modules.get_mut(&hash)?;
        entry.references += 1;
        Some(entry.module.clone())
    }

    /// Insert a freshly built module unless a racing loader beat us to it.
    fn insert_module(&self, module: Module) -> Result<(), OsError> {
        let hash = module.hash();
        let mut modules = self.modules.lock();
        if modules.contains_key(&hash) {
            // Lost the insertion race; the caller's module is dropped and
            // the winner will be found by hash.
            return Err(OsError::Exists);
        }
        modules.insert(
            hash,
            ModuleEntry {
                references: 0,
                module: Arc::new(module),
            },
        );
        Ok(())
    }

    fn load_file(&self, path: &str) -> Result<Vec<u8>, OsError> {
        trace!("ModuleCache::load_file(path={})", path);
        if path.starts_with(RAMDISK_PREFIX) {
            return self.ramdisk.find_ramdisk_file(path);
        }
        self.fs.read_file(path)
    }

    /// Read, checksum and cache the image at `path`, returning its hash.
    fn load_module(&self, path: &str) -> Result<u32, OsError> {
        let buffer = self.load_file(path)?;
        let hash = validate_image_checksum(&buffer)?;

        // Remember the hash for this absolute path so future loads skip
        // the read. Failed checksums above never pollute either table.
        self.insert_hash(path, hash);

        match self.insert_module(Module::new(buffer, hash)) {
            Ok(()) => Ok(hash),
            // Already cached under another path; the hash lookup wins.
            Err(OsError::Exists) => Ok(hash),
            Err(err) => Err(err),
        }
    }

    #[cfg(test)]
    pub(crate) fn reference_count(&self, hash: u32) -> u32 {
        self.modules
            .lock()
            .get(&hash)
            .map(|entry| entry.references)
            .unwrap_or(0)
    }
}
