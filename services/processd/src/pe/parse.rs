//! Module Parser
//!
//! Turns the raw file buffer of a PE image into the [`ParsedImage`] view:
//! header fields, section records with their file ranges, the data
//! directory table, and the export tables keyed by ordinal and by name.
//! DOS/PE framing was already validated when the image was checksummed for
//! the cache, so this starts at the machine check.

use std::collections::HashMap;

use log::{error, trace};

use crate::error::OsError;
use crate::memory::MappingFlags;
use crate::pe::format::{
    self, directory, section_flags, Architecture, MzHeader, PeExportDirectory, PeHeader,
    PeOptionalHeader32, PeOptionalHeader64, PeSectionHeader,
};
use crate::pe::module::{ExportedFunction, ParsedImage, Section};

/// Page protection for a section, from its PE characteristics.
fn section_mapping_flags(flags: u32) -> MappingFlags {
    let mut mapped = MappingFlags::READ;
    if flags & section_flags::EXECUTE != 0 {
        mapped |= MappingFlags::EXECUTABLE;
    }
    if flags & section_flags::WRITE != 0 {
        mapped |= MappingFlags::WRITE;
    }
    mapped
}

fn parse_sections(
    buffer: &[u8],
    section_table_offset: usize,
    count: usize,
) -> Result<Vec<Section>, OsError> {
    let mut sections = Vec::with_capacity(count);
    for i in 0..count {
        let header: PeSectionHeader = format::read_pod(
            buffer,
            section_table_offset + i * core::mem::size_of::<PeSectionHeader>(),
        )?;
        let raw_size = header.raw_size as usize;
        let raw_address = header.raw_address as usize;
        let zero = raw_size == 0 || (header.flags & section_flags::BSS) != 0;

        let file_range = if raw_size == 0 {
            None
        } else {
            let end = raw_address
                .checked_add(raw_size)
                .filter(|&end| end <= buffer.len())
                .ok_or(OsError::InvalidFormat)?;
            Some(raw_address..end)
        };

        sections.push(Section {
            name: header.name,
            zero,
            file_range,
            rva: header.virtual_address,
            file_length: raw_size,
            mapped_length: header.virtual_size as usize,
            map_flags: section_mapping_flags(header.flags),
        });
    }
    Ok(sections)
}

fn read_pod_at_rva<T: bytemuck::AnyBitPattern>(
    image: &ParsedImage,
    buffer: &[u8],
    rva: u32,
) -> Result<T, OsError> {
    let data = image
        .rva_to_file_data(buffer, rva)
        .ok_or(OsError::InvalidFormat)?;
    format::read_pod(data, 0)
}

fn read_cstr_at_rva(image: &ParsedImage, buffer: &[u8], rva: u32) -> Result<String, OsError> {
    let data = image
        .rva_to_file_data(buffer, rva)
        .ok_or(OsError::InvalidFormat)?;
    Ok(format::read_cstr(data, 0)?.to_string())
}

/// Parse the export directory into the by-ordinal and by-name tables.
///
/// A function RVA that falls inside the export directory itself is a
/// forwarder; the string at that RVA names the real "Dll.Symbol" target.
fn parse_exported_functions(image: &mut ParsedImage, buffer: &[u8]) -> Result<(), OsError> {
    let dir = image.data_directories[directory::EXPORT];
    if !dir.is_present() {
        return Ok(());
    }
    let dir_rva = dir.address_rva;
    let dir_size = dir.size;

    let export: PeExportDirectory = read_pod_at_rva(image, buffer, dir_rva)?;
    let ordinal_base = export.ordinal_base;
    let number_of_functions = export.number_of_functions;

    let function_rva_at = |image: &ParsedImage, index: u32| -> Result<u32, OsError> {
        if index >= number_of_functions {
            return Err(OsError::InvalidFormat);
        }
        read_pod_at_rva::<u32>(image, buffer, export.address_of_functions + index * 4)
    };
    let forwarder_of = |image: &ParsedImage, fn_rva: u32| -> Result<Option<String>, OsError> {
        if fn_rva >= dir_rva && fn_rva < dir_rva + dir_size {
            Ok(Some(read_cstr_at_rva(image, buffer, fn_rva)?))
        } else {
            Ok(None)
        }
    };

    if export.address_of_names == 0 {
        // Exports by ordinal only; walk the address table directly.
        for index in 0..number_of_functions {
            let fn_rva = function_rva_at(image, index)?;
            if fn_rva == 0 {
                continue;
            }
            let forward_name = forwarder_of(image, fn_rva)?;
            let function = ExportedFunction {
                name: None,
                ordinal: ordinal_base + index,
                rva: if forward_name.is_some() { 0 } else { fn_rva },
                forward_name,
            };
            image.exported_ordinals.insert(function.ordinal, function);
        }
        return Ok(());
    }

    // Names and ordinals can exceed the number of exported addresses, as
    // modules may re-export symbols owned by other modules.
    for i in 0..export.number_of_names {
        let name_rva: u32 = read_pod_at_rva(image, buffer, export.address_of_names + i * 4)?;
        let name = read_cstr_at_rva(image, buffer, name_rva)?;
        let ordinal =
            read_pod_at_rva::<u16>(image, buffer, export.address_of_ordinals + i * 2)? as u32;
        let index = ordinal.wrapping_sub(ordinal_base);
        let fn_rva = function_rva_at(image, index)?;

        let forward_name = forwarder_of(image, fn_rva)?;
        let function = ExportedFunction {
            name: Some(name.clone()),
            ordinal,
            rva: if forward_name.is_some() { 0 } else { fn_rva },
            forward_name,
        };
        image.exported_ordinals.insert(ordinal, function.clone());
        image.exported_names.insert(name, function);
    }
    Ok(())
}

/// Parse `buffer` into a [`ParsedImage`].
pub fn parse_module(buffer: &[u8]) -> Result<ParsedImage, OsError> {
    trace!("parse_module(size={})", buffer.len());

    let mz: MzHeader = format::read_pod(buffer, 0)?;
    let pe_offset = mz.pe_header_address as usize;
    let pe: PeHeader = format::read_pod(buffer, pe_offset)?;

    let machine = pe.machine;
    if machine != format::MACHINE_CURRENT {
        error!(
            "parse_module image was built for machine type {:#x}, not the current machine",
            machine
        );
        return Err(OsError::NotSupported);
    }

    let optional_offset = pe_offset + core::mem::size_of::<PeHeader>();
    let magic: u16 = format::read_pod(buffer, optional_offset)?;
    let architecture =
        Architecture::from_optional_magic(magic).ok_or(OsError::InvalidFormat)?;
    if architecture != Architecture::current() {
        error!(
            "parse_module image architecture {:?} is not supported on this target",
            architecture
        );
        return Err(OsError::NotSupported);
    }

    let mut image = match architecture {
        Architecture::Bit32 => {
            let header: PeOptionalHeader32 = format::read_pod(buffer, optional_offset)?;
            ParsedImage {
                architecture,
                image_base: header.base_address as u64,
                metadata_size: header.size_of_headers as usize,
                section_alignment: header.section_alignment,
                entry_point_rva: header.entry_point_rva,
                code_base_rva: header.base_of_code,
                code_size: header.size_of_code,
                data_directories: header.directories,
                sections: Vec::new(),
                exported_ordinals: HashMap::new(),
                exported_names: HashMap::new(),
            }
        }
        Architecture::Bit64 => {
            let header: PeOptionalHeader64 = format::read_pod(buffer, optional_offset)?;
            ParsedImage {
                architecture,
                image_base: header.base_address,
                metadata_size: header.size_of_headers as usize,
                section_alignment: header.section_alignment,
                entry_point_rva: header.entry_point_rva,
                code_base_rva: header.base_of_code,
                code_size: header.size_of_code,
                data_directories: header.directories,
                sections: Vec::new(),
                exported_ordinals: HashMap::new(),
                exported_names: HashMap::new(),
            }
        }
    };

    if image.section_alignment == 0 || !image.section_alignment.is_power_of_two() {
        return Err(OsError::InvalidFormat);
    }
    if image.metadata_size == 0 || image.metadata_size > buffer.len() {
        return Err(OsError::InvalidFormat);
    }

    let section_table_offset = optional_offset
        + match architecture {
            Architecture::Bit32 => core::mem::size_of::<PeOptionalHeader32>(),
            Architecture::Bit64 => core::mem::size_of::<PeOptionalHeader64>(),
        };
    image.sections = parse_sections(buffer, section_table_offset, pe.num_sections as usize)?;

    parse_exported_functions(&mut image, buffer)?;
    Ok(image)
}
