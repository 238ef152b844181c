//! Image Mapper
//!
//! Places a parsed module into a target memory space: the header block
//! first, then every section at the next alignment granule, each with its
//! requested protection. Contents are copied in through temporary writable
//! local views; the header view is released immediately, while the section
//! views stay alive inside the returned [`ModuleMapping`] so the relocator
//! and import resolver can patch the image before the views are released.

use std::sync::Arc;

use bytemuck::{AnyBitPattern, NoUninit};
use log::trace;

use crate::error::OsError;
use crate::memory::{MappingFlags, MappingParameters, MemoryApi};
use crate::pe::module::{Module, ParsedImage, Section};
use crate::Uuid;

/// Round `value` up to the next multiple of `alignment` (a power of two).
pub fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

/// One mapped section: where it landed in the target space and the local
/// writable view used to fill and patch it.
#[derive(Debug)]
pub struct SectionMapping {
    /// Destination RVA of the section.
    pub rva: u32,
    /// Mapped length in bytes.
    pub length: usize,
    /// Remote page protection.
    pub flags: MappingFlags,
    /// Absolute address inside the target memory space.
    pub mapped_address: u64,
    /// Writable local view of the same pages.
    pub local_address: *mut u8,
}

/// Transient result of mapping one module, alive only while the module is
/// being linked. Dropping it without [`ModuleMapping::delete`] leaks the
/// local views, so the linker always releases it explicitly.
pub struct ModuleMapping {
    mapping_base: u64,
    module: Arc<Module>,
    parsed: Arc<ParsedImage>,
    mappings: Vec<SectionMapping>,
}

impl ModuleMapping {
    /// Absolute base address the module was placed at.
    pub fn mapping_base(&self) -> u64 {
        self.mapping_base
    }

    /// The shared module being mapped.
    pub fn module(&self) -> &Arc<Module> {
        &self.module
    }

    /// Parsed view of the module.
    pub fn parsed(&self) -> &ParsedImage {
        &self.parsed
    }

    fn mapping_for(&self, rva: u32, length: usize) -> Option<(&SectionMapping, usize)> {
        for mapping in &self.mappings {
            if rva < mapping.rva {
                continue;
            }
            let offset = (rva - mapping.rva) as usize;
            if offset + length <= mapping.length {
                return Some((mapping, offset));
            }
        }
        None
    }

    /// Read a value from the local view backing `rva`.
    pub fn read_at<T: AnyBitPattern>(&self, rva: u32) -> Option<T> {
        let (mapping, offset) = self.mapping_for(rva, core::mem::size_of::<T>())?;
        Some(unsafe { core::ptr::read_unaligned(mapping.local_address.add(offset) as *const T) })
    }

    /// Write a value through the local view backing `rva`.
    pub fn write_at<T: NoUninit>(&self, rva: u32, value: T) -> bool {
        match self.mapping_for(rva, core::mem::size_of::<T>()) {
            Some((mapping, offset)) => {
                unsafe {
                    core::ptr::write_unaligned(mapping.local_address.add(offset) as *mut T, value)
                };
                true
            }
            None => false,
        }
    }

    /// Read a NUL-terminated string from the local view backing `rva`. The
    /// terminator must appear before the end of the section.
    pub fn cstr_at(&self, rva: u32) -> Option<String> {
        let (mapping, start) = self.mapping_for(rva, 1)?;
        let mut bytes = Vec::new();
        for offset in start..mapping.length {
            let byte = unsafe { *mapping.local_address.add(offset) };
            if byte == 0 {
                return String::from_utf8(bytes).ok();
            }
            bytes.push(byte);
        }
        None
    }

    /// Release every local view. The remote placement remains.
    pub fn delete(self, memory: &dyn MemoryApi) {
        release_mappings(memory, self.mappings);
    }
}

fn release_mappings(memory: &dyn MemoryApi, mappings: Vec<SectionMapping>) {
    for mapping in mappings.into_iter().rev() {
        let _ = memory.free_mapping(mapping.local_address, mapping.length);
    }
}

/// Claim `size` bytes at the watermark, rounded up to the alignment
/// granule, and advance the watermark past them.
fn allocate_load_space(load_address: &mut u64, size: usize, alignment: u32) -> u64 {
    let address = align_up(*load_address, alignment as u64);
    *load_address = address + size as u64;
    address
}

/// Map the header block and copy it in. The local view is released right
/// away; nothing later patches the headers.
fn map_metadata(
    parsed: &ParsedImage,
    buffer: &[u8],
    memory: &dyn MemoryApi,
    memory_space: Uuid,
    load_address: &mut u64,
) -> Result<u64, OsError> {
    trace!("map_metadata(size={:#x})", parsed.metadata_size);

    let address = allocate_load_space(load_address, parsed.metadata_size, parsed.section_alignment);
    let params = MappingParameters {
        virtual_address: address,
        length: parsed.metadata_size,
        flags: MappingFlags::READ | MappingFlags::WRITE,
    };
    let local = memory.create_mapping(memory_space, &params)?;
    unsafe {
        core::ptr::copy_nonoverlapping(buffer.as_ptr(), local, parsed.metadata_size);
    }
    memory.free_mapping(local, parsed.metadata_size)?;
    Ok(address)
}

fn map_section(
    section: &Section,
    buffer: &[u8],
    alignment: u32,
    memory: &dyn MemoryApi,
    memory_space: Uuid,
    load_address: &mut u64,
) -> Result<SectionMapping, OsError> {
    let length = section.file_length.max(section.mapped_length);
    trace!(
        "map_section(name={}, size={:#x}, rva={:#x})",
        section.name_str(),
        length,
        section.rva
    );

    let address = allocate_load_space(load_address, length, alignment);
    let params = MappingParameters {
        virtual_address: address,
        length,
        flags: section.map_flags,
    };
    let local = memory.create_mapping(memory_space, &params)?;

    unsafe {
        if section.zero {
            core::ptr::write_bytes(local, 0, length);
        } else {
            if let Some(range) = &section.file_range {
                core::ptr::copy_nonoverlapping(
                    buffer[range.clone()].as_ptr(),
                    local,
                    section.file_length,
                );
            }
            if section.mapped_length > section.file_length {
                core::ptr::write_bytes(
                    local.add(section.file_length),
                    0,
                    section.mapped_length - section.file_length,
                );
            }
        }
    }

    Ok(SectionMapping {
        rva: section.rva,
        length,
        flags: section.map_flags,
        mapped_address: address,
        local_address: local,
    })
}

/// Map every section, appending to `mappings` as they are produced so the
/// caller can destroy the partial list deterministically on failure.
fn map_sections(
    parsed: &ParsedImage,
    buffer: &[u8],
    memory: &dyn MemoryApi,
    memory_space: Uuid,
    load_address: &mut u64,
    mappings: &mut Vec<SectionMapping>,
) -> Result<(), OsError> {
    for section in &parsed.sections {
        let mapping = map_section(
            section,
            buffer,
            parsed.section_alignment,
            memory,
            memory_space,
            load_address,
        )?;
        mappings.push(mapping);
    }
    Ok(())
}

/// Place `module` into the target memory space at the context's watermark.
///
/// On failure every mapping already produced is released in reverse order
/// and the watermark is restored, so the caller sees no partial placement.
pub fn map_module(
    module: Arc<Module>,
    memory: &dyn MemoryApi,
    memory_space: Uuid,
    load_address: &mut u64,
) -> Result<ModuleMapping, OsError> {
    trace!("map_module(load_address={:#x})", *load_address);

    // Parse lazily under the module mutex; repeat callers skip.
    let parsed = module.parsed()?;
    let saved_watermark = *load_address;

    let mapping_base = match map_metadata(
        &parsed,
        module.buffer(),
        memory,
        memory_space,
        load_address,
    ) {
        Ok(base) => base,
        Err(err) => {
            *load_address = saved_watermark;
            return Err(err);
        }
    };

    let mut mappings = Vec::with_capacity(parsed.sections.len());
    if let Err(err) = map_sections(
        &parsed,
        module.buffer(),
        memory,
        memory_space,
        load_address,
        &mut mappings,
    ) {
        release_mappings(memory, mappings);
        *load_address = saved_watermark;
        return Err(err);
    }

    Ok(ModuleMapping {
        mapping_base,
        module,
        parsed,
        mappings,
    })
}
