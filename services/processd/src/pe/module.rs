//! Parsed Module Representation
//!
//! A [`Module`] owns the raw file buffer of one PE image and its parsed
//! view. Modules are shared between load contexts through the cache, so
//! everything here is immutable after parse; the parse itself is lazy and
//! guarded by a per-module mutex so concurrent mappers serialize on the
//! first access and skip on later ones.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;

use spin::Mutex;

use crate::error::OsError;
use crate::memory::MappingFlags;
use crate::pe::format::{
    self, MzHeader, PeDataDirectory, PeHeader, PE_NUM_DIRECTORIES, PE_SECTION_NAME_LENGTH,
};
use crate::pe::parse;

/// One function exported by a module. Either `rva` points at the local
/// implementation, or `forward_name` names a "Dll.Symbol" in another
/// module; never both.
#[derive(Debug, Clone)]
pub struct ExportedFunction {
    /// Export name; absent for ordinal-only exports.
    pub name: Option<String>,
    /// Biased ordinal, the value import thunks carry in their low 16 bits.
    pub ordinal: u32,
    /// RVA of the implementation; 0 when forwarded.
    pub rva: u32,
    /// Forwarder target ("Dll.Symbol") when the export lives elsewhere.
    pub forward_name: Option<String>,
}

/// One section of a parsed image.
#[derive(Debug, Clone)]
pub struct Section {
    /// Raw eight-byte section name.
    pub name: [u8; PE_SECTION_NAME_LENGTH],
    /// Section must be zero-initialized (BSS or no file data).
    pub zero: bool,
    /// Byte range of the section's contents inside the file buffer, absent
    /// for pure BSS sections.
    pub file_range: Option<Range<usize>>,
    /// Destination RVA.
    pub rva: u32,
    /// Bytes present in the file.
    pub file_length: usize,
    /// Bytes occupied once mapped (virtual size).
    pub mapped_length: usize,
    /// Page protection derived from the PE section flags.
    pub map_flags: MappingFlags,
}

impl Section {
    /// Section name, trimmed at the first NUL.
    pub fn name_str(&self) -> &str {
        let len = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(PE_SECTION_NAME_LENGTH);
        core::str::from_utf8(&self.name[..len]).unwrap_or("")
    }

    /// Does `rva` land inside this section's mapped range?
    pub fn contains_rva(&self, rva: u32) -> bool {
        rva >= self.rva && (rva as u64) < self.rva as u64 + self.mapped_length as u64
    }
}

/// The immutable result of parsing one image.
#[derive(Debug)]
pub struct ParsedImage {
    /// Word size of the image.
    pub architecture: format::Architecture,
    /// Preferred base address the image was linked for.
    pub image_base: u64,
    /// Size of the header block (DOS stub through section table).
    pub metadata_size: usize,
    /// Placement granule for sections.
    pub section_alignment: u32,
    /// Entry point RVA.
    pub entry_point_rva: u32,
    /// Start of the code segment, relative to base.
    pub code_base_rva: u32,
    /// Length of the code segment.
    pub code_size: u32,
    /// The sixteen standard data directories.
    pub data_directories: [PeDataDirectory; PE_NUM_DIRECTORIES],
    /// Section records in table order.
    pub sections: Vec<Section>,
    /// Exports keyed by biased ordinal.
    pub exported_ordinals: HashMap<u32, ExportedFunction>,
    /// Exports keyed by name.
    pub exported_names: HashMap<String, ExportedFunction>,
}

impl ParsedImage {
    /// Translate an RVA to the file bytes backing it: the containing
    /// section's data from that offset to the end of its file contents.
    pub fn rva_to_file_data<'a>(&self, buffer: &'a [u8], rva: u32) -> Option<&'a [u8]> {
        for section in &self.sections {
            if section.contains_rva(rva) {
                let range = section.file_range.clone()?;
                let offset = (rva - section.rva) as usize;
                if offset >= range.len() {
                    return None;
                }
                return buffer.get(range.start + offset..range.end);
            }
        }
        None
    }

    /// The section containing `rva`, if any.
    pub fn section_for_rva(&self, rva: u32) -> Option<&Section> {
        self.sections.iter().find(|s| s.contains_rva(rva))
    }
}

/// A cached PE image: the owned file buffer plus its lazily parsed view.
pub struct Module {
    hash: u32,
    buffer: Vec<u8>,
    parsed: Mutex<Option<Arc<ParsedImage>>>,
}

impl Module {
    /// Wrap an image buffer. Parsing happens on first use.
    pub fn new(buffer: Vec<u8>, hash: u32) -> Self {
        Self {
            hash,
            buffer,
            parsed: Mutex::new(None),
        }
    }

    /// Content hash this module is cached under.
    pub fn hash(&self) -> u32 {
        self.hash
    }

    /// The raw file buffer. Section data borrows from this for the whole
    /// lifetime of the module, so copy-in during mapping never outlives it.
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Parsed view of the image. The first caller parses under the module
    /// mutex; later callers get the shared result.
    pub fn parsed(&self) -> Result<Arc<ParsedImage>, OsError> {
        let mut guard = self.parsed.lock();
        if let Some(parsed) = guard.as_ref() {
            return Ok(parsed.clone());
        }
        let parsed = Arc::new(parse::parse_module(&self.buffer)?);
        *guard = Some(parsed.clone());
        Ok(parsed)
    }
}

impl core::fmt::Debug for Module {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Module")
            .field("hash", &self.hash)
            .field("size", &self.buffer.len())
            .finish()
    }
}

/// Validate the DOS/PE framing of `buffer` and compute the image checksum
/// used as the cache key. The stored `CheckSum` field is excluded from the
/// sum, so rewriting it does not change a module's identity.
pub fn validate_image_checksum(buffer: &[u8]) -> Result<u32, OsError> {
    let mz: MzHeader = format::read_pod(buffer, 0)?;
    if mz.magic != format::MZ_MAGIC {
        return Err(OsError::InvalidFormat);
    }
    let pe_offset = mz.pe_header_address as usize;
    let pe: PeHeader = format::read_pod(buffer, pe_offset)?;
    if pe.magic != format::PE_MAGIC {
        return Err(OsError::InvalidFormat);
    }

    // CheckSum lives 64 bytes into the optional header, for both flavors.
    let checksum_field = pe_offset + core::mem::size_of::<PeHeader>() + 64;

    let mut sum: u32 = 0;
    let mut offset = 0usize;
    while offset < buffer.len() {
        if offset >= checksum_field && offset < checksum_field + 4 {
            offset += 2;
            continue;
        }
        let low = buffer[offset] as u32;
        let high = if offset + 1 < buffer.len() {
            buffer[offset + 1] as u32
        } else {
            0
        };
        sum += (high << 8) | low;
        sum = (sum & 0xFFFF) + (sum >> 16);
        offset += 2;
    }
    sum = (sum & 0xFFFF) + (sum >> 16);
    Ok(sum.wrapping_add(buffer.len() as u32))
}
