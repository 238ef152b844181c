//! Image Loader
//!
//! The central driver: resolve the path, fetch the parsed module from the
//! shared cache, map it into the target space, register it in the context,
//! then link it (imports, base relocations, runtime relocations). On any
//! linking failure the partially built state is unwound: local views are
//! released in reverse order, the entry leaves the context, and the cache
//! reference is dropped.
//!
//! Dynamic requests (`load_library`, `find_export`, `unload`) operate
//! against the same context after the initial process load.

use log::{error, trace};

use crate::error::OsError;
use crate::pe::context::{ImportRef, LoadContext, ModuleMapEntry};
use crate::pe::imports;
use crate::pe::mapper;
use crate::pe::relocs;
use crate::pe::resolver::{self, basename};

/// Load the image at `path` plus, recursively, everything it imports.
/// Returns the context-local ID of the new entry; the first load in a
/// context gets ID 0 and becomes the root module.
///
/// Entries pass through placement, import resolution and relocation in
/// that order, and are registered in the context before their imports are
/// walked so the recursion can see them.
pub fn load(ctx: &mut LoadContext, path: &str, dependency: bool) -> Result<u32, OsError> {
    trace!("load(path={}, dependency={})", path, dependency);

    let resolved_path = resolver::resolve_path(ctx, path)?;
    let module = ctx.cache.get(&resolved_path)?;

    let module_mapping = match mapper::map_module(
        module.clone(),
        &*ctx.memory,
        ctx.memory_space(),
        &mut ctx.load_address,
    ) {
        Ok(mapping) => mapping,
        Err(err) => {
            ctx.cache.release(&module);
            return Err(err);
        }
    };

    let name = basename(&resolved_path).to_string();
    if ctx.module_map.contains_key(&name) {
        error!("load module {} is already present in this context", name);
        module_mapping.delete(&*ctx.memory);
        ctx.cache.release(&module);
        return Err(OsError::Exists);
    }

    // Register the entry before touching imports so the recursion finds
    // it; the import list is filled in afterwards.
    let id = ctx.allocate_id();
    if id == 0 {
        ctx.root_module = Some(name.clone());
    }
    ctx.module_map.insert(
        name.clone(),
        ModuleMapEntry {
            id,
            name: name.clone(),
            path: resolved_path,
            base_mapping: module_mapping.mapping_base(),
            module: module.clone(),
            dependency,
            imports: Vec::new(),
        },
    );

    let mut import_refs = Vec::new();
    let linked = imports::process_imports(ctx, &module_mapping, &mut import_refs)
        .and_then(|()| {
            let image_delta = (module_mapping.mapping_base() as i64)
                .wrapping_sub(module_mapping.parsed().image_base as i64);
            relocs::process_base_relocations(&module_mapping, image_delta)
        })
        .and_then(|()| relocs::process_runtime_relocations(&module_mapping));

    if let Err(err) = linked {
        error!("load failed to link {}: {}", name, err);
        module_mapping.delete(&*ctx.memory);
        ctx.module_map.remove(&name);
        if ctx.root_module.as_deref() == Some(name.as_str()) {
            ctx.root_module = None;
        }
        ctx.cache.release(&module);
        return Err(err);
    }

    if let Some(entry) = ctx.module_map.get_mut(&name) {
        entry.imports = import_refs;
    }

    // The local views are done; the remote placement stays.
    module_mapping.delete(&*ctx.memory);
    Ok(id)
}

/// Dynamically load a library into an existing context. When the base name
/// is already loaded, the existing entry wins and is returned. A fresh
/// load is attached as a dependency of the root module so context teardown
/// unloads it even though it was user-requested.
///
/// Returns the module key and the library's entry point address.
pub fn load_library(ctx: &mut LoadContext, path: &str) -> Result<(String, u64), OsError> {
    trace!("load_library(path={})", path);

    let base_name = basename(path).to_string();
    if let Some(entry) = ctx.entry(&base_name) {
        let parsed = entry.module.parsed()?;
        return Ok((
            entry.name.clone(),
            entry.base_mapping + parsed.entry_point_rva as u64,
        ));
    }

    let id = load(ctx, path, false)?;
    let (name, entry_point) = {
        let entry = ctx.entry_by_id(id).ok_or(OsError::Unknown)?;
        let parsed = entry.module.parsed()?;
        (
            entry.name.clone(),
            entry.base_mapping + parsed.entry_point_rva as u64,
        )
    };

    let root = ctx.root_module.clone().ok_or(OsError::Unknown)?;
    let root_entry = ctx.module_map.get_mut(&root).ok_or(OsError::Unknown)?;
    if !root_entry.imports.iter().any(|import| import.id == id) {
        root_entry.imports.push(ImportRef {
            id,
            name: name.clone(),
        });
    }
    Ok((name, entry_point))
}

/// Absolute address of a named export of a loaded module.
pub fn find_export(
    ctx: &LoadContext,
    image_key: &str,
    function_name: &str,
) -> Result<u64, OsError> {
    trace!("find_export(key={}, function={})", image_key, function_name);

    let entry = ctx.entry(image_key).ok_or(OsError::NotFound)?;
    let parsed = entry.module.parsed()?;
    let function = parsed
        .exported_names
        .get(function_name)
        .ok_or(OsError::NotFound)?;
    if function.forward_name.is_some() {
        return Err(OsError::NotSupported);
    }
    Ok(entry.base_mapping + function.rva as u64)
}

/// Unload a module and, recursively, its imports. Dependencies refuse to
/// go unless `force` is set, which it only is when the whole context is
/// being torn down; failures in the recursion are skipped so teardown
/// always makes progress.
pub fn unload(ctx: &mut LoadContext, image_key: &str, force: bool) -> Result<(), OsError> {
    trace!("unload(key={}, force={})", image_key, force);

    {
        let entry = ctx
            .module_map
            .get(image_key)
            .ok_or(OsError::InvalidParameters)?;
        if entry.dependency && !force {
            return Err(OsError::PermissionDenied);
        }
    }
    let entry = match ctx.module_map.remove(image_key) {
        Some(entry) => entry,
        None => return Err(OsError::InvalidParameters),
    };
    ctx.cache.release(&entry.module);

    // Nothing may keep referring to the departed ID.
    for other in ctx.module_map.values_mut() {
        other.imports.retain(|import| import.id != entry.id);
    }

    for import in entry.imports {
        if let Err(err) = unload(ctx, &import.name, force) {
            trace!("unload skipping {}: {}", import.name, err);
        }
    }
    Ok(())
}
