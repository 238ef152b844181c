//! Import Resolver
//!
//! Walks a freshly mapped module's import descriptor table, loads every
//! provider module that is not already in the context (recursing through
//! the loader), and patches the consumer's import address table with the
//! absolute addresses of the provider's exports. Bound import descriptors
//! and forwarded exports are refused.

use std::sync::Arc;

use log::{error, trace};

use crate::error::OsError;
use crate::pe::context::{ImportRef, LoadContext};
use crate::pe::format::{
    directory, Architecture, PeImportDescriptor, IMPORT_NAMEMASK, IMPORT_ORDINAL_32,
    IMPORT_ORDINAL_64,
};
use crate::pe::loader;
use crate::pe::mapper::ModuleMapping;
use crate::pe::module::{ExportedFunction, ParsedImage};

/// A provider module resolved for one import descriptor.
struct ResolvedProvider {
    id: u32,
    base_mapping: u64,
    parsed: Arc<ParsedImage>,
}

/// Find the provider in the context, loading it as a dependency if this is
/// its first appearance.
fn resolve_import(
    ctx: &mut LoadContext,
    module_name: &str,
) -> Result<ResolvedProvider, OsError> {
    trace!("resolve_import(module={})", module_name);

    if ctx.entry(module_name).is_none() {
        loader::load(ctx, module_name, true)?;
    }
    let entry = ctx.entry(module_name).ok_or(OsError::Unknown)?;
    Ok(ResolvedProvider {
        id: entry.id,
        base_mapping: entry.base_mapping,
        parsed: entry.module.parsed()?,
    })
}

fn checked_function(function: &ExportedFunction) -> Result<u32, OsError> {
    if let Some(forward) = &function.forward_name {
        error!("checked_function encountered forwarded export: {}", forward);
        return Err(OsError::NotSupported);
    }
    Ok(function.rva)
}

fn function_by_ordinal(provider: &ParsedImage, ordinal: u32) -> Result<u32, OsError> {
    trace!("function_by_ordinal(ordinal={})", ordinal);
    let function = provider
        .exported_ordinals
        .get(&ordinal)
        .ok_or(OsError::NotFound)?;
    checked_function(function)
}

fn function_by_name(provider: &ParsedImage, name: &str) -> Result<u32, OsError> {
    trace!("function_by_name(name={})", name);
    let function = provider
        .exported_names
        .get(name)
        .ok_or(OsError::NotFound)?;
    checked_function(function)
}

/// Patch one import address table against a resolved provider. The table
/// is a NUL-terminated run of thunks whose width follows the consumer's
/// architecture; the high bit selects import-by-ordinal.
fn process_unbound_import_table(
    mapping: &ModuleMapping,
    provider: &ResolvedProvider,
    iat_rva: u32,
) -> Result<(), OsError> {
    let architecture = mapping.parsed().architecture;
    let stride = architecture.pointer_size() as u32;
    let mut slot_rva = iat_rva;

    loop {
        let (done, function_rva) = match architecture {
            Architecture::Bit32 => {
                let thunk: u32 = mapping.read_at(slot_rva).ok_or(OsError::InvalidFormat)?;
                if thunk == 0 {
                    (true, 0)
                } else if thunk & IMPORT_ORDINAL_32 != 0 {
                    (false, function_by_ordinal(&provider.parsed, thunk & 0xFFFF)?)
                } else {
                    let name_rva = thunk & IMPORT_NAMEMASK;
                    // Skip the 16-bit hint of the name descriptor.
                    let name = mapping.cstr_at(name_rva + 2).ok_or(OsError::InvalidFormat)?;
                    (false, function_by_name(&provider.parsed, &name)?)
                }
            }
            Architecture::Bit64 => {
                let thunk: u64 = mapping.read_at(slot_rva).ok_or(OsError::InvalidFormat)?;
                if thunk == 0 {
                    (true, 0)
                } else if thunk & IMPORT_ORDINAL_64 != 0 {
                    (false, function_by_ordinal(&provider.parsed, (thunk & 0xFFFF) as u32)?)
                } else {
                    let name_rva = (thunk as u32) & IMPORT_NAMEMASK;
                    let name = mapping.cstr_at(name_rva + 2).ok_or(OsError::InvalidFormat)?;
                    (false, function_by_name(&provider.parsed, &name)?)
                }
            }
        };
        if done {
            break;
        }

        let address = provider.base_mapping + function_rva as u64;
        trace!("process_unbound_import_table import address: {:#x}", address);
        let written = match architecture {
            Architecture::Bit32 => mapping.write_at(slot_rva, address as u32),
            Architecture::Bit64 => mapping.write_at(slot_rva, address),
        };
        if !written {
            return Err(OsError::InvalidFormat);
        }
        slot_rva += stride;
    }
    Ok(())
}

/// Process the import directory of a freshly mapped module, recording the
/// ID of every provider in `imports`. The consumer's entry must already be
/// in the context so recursion can see it.
pub fn process_imports(
    ctx: &mut LoadContext,
    mapping: &ModuleMapping,
    imports: &mut Vec<ImportRef>,
) -> Result<(), OsError> {
    let dir = mapping.parsed().data_directories[directory::IMPORT];
    if !dir.is_present() {
        return Ok(());
    }
    let dir_rva = dir.address_rva;
    let dir_size = dir.size;
    trace!("process_imports(rva={:#x}, size={:#x})", dir_rva, dir_size);

    // The descriptor table ends at an all-zero descriptor. Each entry
    // names one provider DLL and one import address table to patch.
    let mut descriptor_rva = dir_rva;
    loop {
        let descriptor: PeImportDescriptor = mapping
            .read_at(descriptor_rva)
            .ok_or(OsError::InvalidFormat)?;
        if descriptor.import_address_table == 0 {
            break;
        }
        if descriptor.time_stamp != 0 {
            error!("process_imports encountered bound import descriptor, not supported");
            return Err(OsError::NotSupported);
        }

        let module_name = mapping
            .cstr_at(descriptor.module_name)
            .ok_or(OsError::InvalidFormat)?;

        let provider = resolve_import(ctx, &module_name)?;
        process_unbound_import_table(mapping, &provider, descriptor.import_address_table)?;

        if !imports.iter().any(|import| import.id == provider.id) {
            imports.push(ImportRef {
                id: provider.id,
                name: module_name,
            });
        }
        descriptor_rva += core::mem::size_of::<PeImportDescriptor>() as u32;
    }
    Ok(())
}
