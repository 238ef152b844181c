//! Relocation Processing
//!
//! Two directory formats are handled: the standard base-relocation table
//! (applied for the delta between preferred and actual base) and the
//! toolchain's runtime-relocation list carried in the global-ptr
//! directory. Both patch the image through the writable local views held
//! by the [`ModuleMapping`], never through the remote mapping, which may
//! already be read-only for code sections.

use log::{error, trace};

use crate::error::OsError;
use crate::pe::format::{
    self, directory, relocation, Architecture, PeRelocationBlock, RuntimeRelocationEntryV1,
    RuntimeRelocationEntryV2, RuntimeRelocationHeader, RUNTIME_RELOCATION_V1,
    RUNTIME_RELOCATION_V2,
};
use crate::pe::mapper::ModuleMapping;

/// Read the pointer-sized word at `rva`.
fn read_word(mapping: &ModuleMapping, rva: u32) -> Option<u64> {
    match mapping.parsed().architecture {
        Architecture::Bit32 => mapping.read_at::<u32>(rva).map(u64::from),
        Architecture::Bit64 => mapping.read_at::<u64>(rva),
    }
}

/// Write the pointer-sized word at `rva`.
fn write_word(mapping: &ModuleMapping, rva: u32, value: u64) -> bool {
    match mapping.parsed().architecture {
        Architecture::Bit32 => mapping.write_at::<u32>(rva, value as u32),
        Architecture::Bit64 => mapping.write_at::<u64>(rva, value),
    }
}

fn process_base_relocation_entry(
    mapping: &ModuleMapping,
    image_delta: i64,
    page_rva: u32,
    entry: u16,
) -> Result<(), OsError> {
    let kind = entry >> 12;
    let target_rva = page_rva + (entry & 0x0FFF) as u32;

    match kind {
        relocation::ABSOLUTE => {}
        relocation::HIGHLOW => {
            let value: u32 = mapping.read_at(target_rva).ok_or(OsError::InvalidFormat)?;
            let fixed = (value as i64).wrapping_add(image_delta) as u32;
            if !mapping.write_at(target_rva, fixed) {
                return Err(OsError::InvalidFormat);
            }
        }
        relocation::DIR64 => {
            let value: u64 = mapping.read_at(target_rva).ok_or(OsError::InvalidFormat)?;
            let fixed = (value as i64).wrapping_add(image_delta) as u64;
            if !mapping.write_at(target_rva, fixed) {
                return Err(OsError::InvalidFormat);
            }
        }
        _ => {
            error!(
                "process_base_relocation_entry unsupported relocation type {}",
                kind
            );
            return Err(OsError::NotSupported);
        }
    }
    Ok(())
}

/// Walk the base-relocation directory, rewriting every targeted pointer by
/// `image_delta`. The table itself is read out of the file buffer; the
/// fixups go through the local views of this instance's mappings.
pub fn process_base_relocations(
    mapping: &ModuleMapping,
    image_delta: i64,
) -> Result<(), OsError> {
    let dir = mapping.parsed().data_directories[directory::BASE_RELOCATION];
    if !dir.is_present() {
        return Ok(());
    }
    if image_delta == 0 {
        // Loaded at the preferred base, nothing to rewrite.
        return Ok(());
    }
    let dir_rva = dir.address_rva;
    let size = dir.size as usize;
    trace!(
        "process_base_relocations(rva={:#x}, size={:#x}, delta={:#x})",
        dir_rva,
        size,
        image_delta
    );

    let buffer = mapping.module().buffer();
    let data = mapping
        .parsed()
        .rva_to_file_data(buffer, dir_rva)
        .ok_or(OsError::InvalidFormat)?;
    if data.len() < size {
        return Err(OsError::InvalidFormat);
    }

    let mut offset = 0usize;
    while offset < size {
        let block: PeRelocationBlock = format::read_pod(data, offset)?;
        let page_rva = block.page_rva;
        let block_length = block.block_length as usize;
        if page_rva == 0 && block_length == 0 {
            break;
        }
        if block_length < 8 || block_length > size - offset {
            error!("process_base_relocations invalid block length {}", block_length);
            return Err(OsError::InvalidFormat);
        }

        let entry_count = (block_length - 8) / 2;
        for i in 0..entry_count {
            let entry: u16 = format::read_pod(data, offset + 8 + i * 2)?;
            process_base_relocation_entry(mapping, image_delta, page_rva, entry)?;
        }
        offset += block_length;
    }
    Ok(())
}

fn process_runtime_relocations_v1(
    mapping: &ModuleMapping,
    rva: u32,
    size: u32,
) -> Result<(), OsError> {
    let count = size as usize / core::mem::size_of::<RuntimeRelocationEntryV1>();
    trace!("process_runtime_relocations_v1(count={})", count);

    for i in 0..count {
        let entry: RuntimeRelocationEntryV1 = mapping
            .read_at(rva + (i * 8) as u32)
            .ok_or(OsError::InvalidFormat)?;
        let target = entry.rva;
        let word = read_word(mapping, target).ok_or(OsError::NotFound)?;
        if !write_word(mapping, target, word.wrapping_add(entry.value as u64)) {
            return Err(OsError::NotFound);
        }
    }
    Ok(())
}

fn process_runtime_relocations_v2(
    mapping: &ModuleMapping,
    rva: u32,
    size: u32,
) -> Result<(), OsError> {
    let is_64bit = mapping.parsed().architecture == Architecture::Bit64;
    let count = size as usize / core::mem::size_of::<RuntimeRelocationEntryV2>();
    trace!("process_runtime_relocations_v2(count={})", count);

    for i in 0..count {
        let entry: RuntimeRelocationEntryV2 = mapping
            .read_at(rva + (i * 12) as u32)
            .ok_or(OsError::InvalidFormat)?;
        let symbol_rva = entry.symbol_rva;
        let offset_rva = entry.offset_rva;

        let symbol_value = read_word(mapping, symbol_rva).ok_or(OsError::NotFound)? as i64;
        let reloc_size = (entry.flags & 0xFF) as u8;

        // Sign-extend the stored bits into a full-width intermediate.
        let stored: i64 = match reloc_size {
            8 => {
                let v: u8 = mapping.read_at(offset_rva).ok_or(OsError::NotFound)?;
                v as i8 as i64
            }
            16 => {
                let v: u16 = mapping.read_at(offset_rva).ok_or(OsError::NotFound)?;
                v as i16 as i64
            }
            32 => {
                let v: u32 = mapping.read_at(offset_rva).ok_or(OsError::NotFound)?;
                if is_64bit {
                    v as i32 as i64
                } else {
                    v as i64
                }
            }
            64 if is_64bit => {
                let v: u64 = mapping.read_at(offset_rva).ok_or(OsError::NotFound)?;
                v as i64
            }
            _ => {
                error!(
                    "process_runtime_relocations_v2 invalid relocation size {}",
                    reloc_size
                );
                return Err(OsError::Unknown);
            }
        };

        let value = stored
            .wrapping_sub((mapping.mapping_base() as i64).wrapping_add(symbol_rva as i64))
            .wrapping_add(symbol_value);

        let written = match reloc_size {
            8 => mapping.write_at(offset_rva, value as u8),
            16 => mapping.write_at(offset_rva, value as u16),
            32 => mapping.write_at(offset_rva, value as u32),
            64 => mapping.write_at(offset_rva, value as u64),
            _ => false,
        };
        if !written {
            return Err(OsError::NotFound);
        }
    }
    Ok(())
}

/// Process the runtime-relocation (global-ptr) directory, if present. The
/// three-word header is only there when the first two words are zero;
/// otherwise the whole directory is a version-1 entry list.
pub fn process_runtime_relocations(mapping: &ModuleMapping) -> Result<(), OsError> {
    let dir = mapping.parsed().data_directories[directory::GLOBAL_PTR];
    if !dir.is_present() {
        return Ok(());
    }
    let dir_rva = dir.address_rva;
    let dir_size = dir.size;
    trace!(
        "process_runtime_relocations(rva={:#x}, size={:#x})",
        dir_rva,
        dir_size
    );

    if dir_size < 8 {
        return Err(OsError::InvalidFormat);
    }

    let header_size = core::mem::size_of::<RuntimeRelocationHeader>() as u32;
    if dir_size >= header_size {
        let header: RuntimeRelocationHeader = mapping
            .read_at(dir_rva)
            .ok_or(OsError::InvalidFormat)?;
        if header.magic0 == 0 && header.magic1 == 0 {
            let rva = dir_rva + header_size;
            let size = dir_size - header_size;
            let version = header.version;
            return match version {
                RUNTIME_RELOCATION_V1 => process_runtime_relocations_v1(mapping, rva, size),
                RUNTIME_RELOCATION_V2 => process_runtime_relocations_v2(mapping, rva, size),
                _ => {
                    error!(
                        "process_runtime_relocations unsupported version {}",
                        version
                    );
                    Err(OsError::NotSupported)
                }
            };
        }
    }
    process_runtime_relocations_v1(mapping, dir_rva, dir_size)
}
