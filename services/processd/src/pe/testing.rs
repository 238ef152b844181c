//! Shared Test Support
//!
//! Builds byte-exact PE images for the current machine type and provides
//! in-process stand-ins for the kernel memory interface, the filesystem
//! and the ramdisk. The fake memory backend keeps every mapping's buffer
//! alive after the local view is "released", so tests can read the target
//! memory space back and assert on what the loader actually placed there.

use std::collections::HashMap;
use std::sync::Arc;

use bytemuck::{NoUninit, Zeroable};
use spin::Mutex;

use crate::error::OsError;
use crate::memory::{MappingFlags, MappingParameters, MemoryApi};
use crate::pe::cache::ModuleCache;
use crate::pe::context::LoadContext;
use crate::pe::format::{
    directory, section_flags, Architecture, MzHeader, PeDataDirectory, PeExportDirectory,
    PeHeader, PeImportDescriptor, PeOptionalHeader32, PeOptionalHeader64, PeSectionHeader,
    IMPORT_ORDINAL_32, IMPORT_ORDINAL_64, MACHINE_CURRENT, MZ_MAGIC, PE_MAGIC,
    PE_NUM_DIRECTORIES, PE_OPTIONAL_MAGIC_32, PE_OPTIONAL_MAGIC_64,
};
use crate::vfs::{FileSystemApi, RamdiskApi};
use crate::Uuid;

const SIZE_OF_HEADERS: usize = 0x400;
const SECTION_ALIGNMENT: u32 = 0x1000;
const FILE_ALIGNMENT: u32 = 0x200;

fn put<T: NoUninit>(image: &mut [u8], offset: usize, value: &T) {
    let bytes = bytemuck::bytes_of(value);
    image[offset..offset + bytes.len()].copy_from_slice(bytes);
}

fn align_to(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

// ============================================================================
// Image builder
// ============================================================================

/// One export produced by [`ImageBuilder::export_section`].
pub struct ExportEntry {
    name: String,
    ordinal: u32,
    target: ExportTarget,
}

enum ExportTarget {
    Rva(u32),
    Forward(String),
}

impl ExportEntry {
    /// A locally implemented export.
    pub fn function(name: &str, ordinal: u32, rva: u32) -> Self {
        Self {
            name: name.to_string(),
            ordinal,
            target: ExportTarget::Rva(rva),
        }
    }

    /// A forwarder to "Dll.Symbol" in another module.
    pub fn forwarder(name: &str, ordinal: u32, target: &str) -> Self {
        Self {
            name: name.to_string(),
            ordinal,
            target: ExportTarget::Forward(target.to_string()),
        }
    }
}

/// One imported symbol inside an [`ImportSpec`].
pub enum ImportEntry {
    ByName(String),
    ByOrdinal(u16),
}

impl ImportEntry {
    pub fn by_name(name: &str) -> Self {
        ImportEntry::ByName(name.to_string())
    }

    pub fn by_ordinal(ordinal: u16) -> Self {
        ImportEntry::ByOrdinal(ordinal)
    }
}

/// Imports pulled from one provider DLL.
pub struct ImportSpec {
    dll: String,
    entries: Vec<ImportEntry>,
}

impl ImportSpec {
    pub fn new(dll: &str, entries: Vec<ImportEntry>) -> Self {
        Self {
            dll: dll.to_string(),
            entries,
        }
    }
}

/// Serialize an export directory chunk based at `section_rva`. Forwarder
/// strings land inside the directory's extent, which is what marks them as
/// forwarders.
pub fn build_export_section(
    section_rva: u32,
    ordinal_base: u32,
    entries: &[ExportEntry],
) -> Vec<u8> {
    let number_of_functions = entries
        .iter()
        .map(|entry| entry.ordinal - ordinal_base + 1)
        .max()
        .unwrap_or(0);
    let number_of_names = entries.len();

    let addr_off = core::mem::size_of::<PeExportDirectory>();
    let names_off = addr_off + 4 * number_of_functions as usize;
    let ords_off = names_off + 4 * number_of_names;
    let strings_off = ords_off + 2 * number_of_names;

    let mut strings: Vec<u8> = Vec::new();
    let mut name_rvas = Vec::with_capacity(number_of_names);
    let mut forward_rvas: Vec<Option<u32>> = Vec::with_capacity(number_of_names);
    for entry in entries {
        name_rvas.push(section_rva + (strings_off + strings.len()) as u32);
        strings.extend_from_slice(entry.name.as_bytes());
        strings.push(0);
        if let ExportTarget::Forward(target) = &entry.target {
            forward_rvas.push(Some(section_rva + (strings_off + strings.len()) as u32));
            strings.extend_from_slice(target.as_bytes());
            strings.push(0);
        } else {
            forward_rvas.push(None);
        }
    }

    let mut data = vec![0u8; strings_off + strings.len()];
    let export = PeExportDirectory {
        attributes: 0,
        time_stamp: 0,
        version_major: 0,
        version_minor: 0,
        dll_name_rva: 0,
        ordinal_base,
        number_of_functions,
        number_of_names: number_of_names as u32,
        address_of_functions: section_rva + addr_off as u32,
        address_of_names: section_rva + names_off as u32,
        address_of_ordinals: section_rva + ords_off as u32,
    };
    put(&mut data, 0, &export);

    for (i, entry) in entries.iter().enumerate() {
        let index = (entry.ordinal - ordinal_base) as usize;
        let value = match &entry.target {
            ExportTarget::Rva(rva) => *rva,
            ExportTarget::Forward(_) => forward_rvas[i].unwrap_or(0),
        };
        put(&mut data, addr_off + 4 * index, &value);
        put(&mut data, names_off + 4 * i, &name_rvas[i]);
        put(&mut data, ords_off + 2 * i, &(entry.ordinal as u16));
    }
    data[strings_off..].copy_from_slice(&strings);
    data
}

/// Serialize an import descriptor chunk based at `section_rva`. Returns
/// the bytes and the absolute RVA of each provider's import address
/// table, in `specs` order.
pub fn build_import_section(section_rva: u32, specs: &[ImportSpec]) -> (Vec<u8>, Vec<u32>) {
    let pointer_size = Architecture::current().pointer_size();
    let descriptors_len = (specs.len() + 1) * core::mem::size_of::<PeImportDescriptor>();

    let mut iat_offsets = Vec::with_capacity(specs.len());
    let mut cursor = descriptors_len;
    for spec in specs {
        iat_offsets.push(cursor);
        cursor += (spec.entries.len() + 1) * pointer_size;
    }

    // Hint/name descriptors for by-name imports.
    let names_base = cursor;
    let mut names_blob: Vec<u8> = Vec::new();
    let mut name_offsets: Vec<Vec<Option<usize>>> = Vec::with_capacity(specs.len());
    for spec in specs {
        let mut per_entry = Vec::with_capacity(spec.entries.len());
        for entry in &spec.entries {
            match entry {
                ImportEntry::ByName(name) => {
                    per_entry.push(Some(names_base + names_blob.len()));
                    names_blob.extend_from_slice(&0u16.to_le_bytes()); // hint
                    names_blob.extend_from_slice(name.as_bytes());
                    names_blob.push(0);
                    if names_blob.len() % 2 == 1 {
                        names_blob.push(0);
                    }
                }
                ImportEntry::ByOrdinal(_) => per_entry.push(None),
            }
        }
        name_offsets.push(per_entry);
    }

    let dll_base = names_base + names_blob.len();
    let mut dll_blob: Vec<u8> = Vec::new();
    let mut dll_offsets = Vec::with_capacity(specs.len());
    for spec in specs {
        dll_offsets.push(dll_base + dll_blob.len());
        dll_blob.extend_from_slice(spec.dll.as_bytes());
        dll_blob.push(0);
    }

    let mut data = vec![0u8; dll_base + dll_blob.len()];
    for (i, spec) in specs.iter().enumerate() {
        let descriptor = PeImportDescriptor {
            import_address_table: section_rva + iat_offsets[i] as u32,
            time_stamp: 0,
            forwarder_chain: 0,
            module_name: section_rva + dll_offsets[i] as u32,
            first_thunk: section_rva + iat_offsets[i] as u32,
        };
        put(
            &mut data,
            i * core::mem::size_of::<PeImportDescriptor>(),
            &descriptor,
        );

        for (j, entry) in spec.entries.iter().enumerate() {
            let thunk: u64 = match entry {
                ImportEntry::ByOrdinal(ordinal) => match Architecture::current() {
                    Architecture::Bit32 => IMPORT_ORDINAL_32 as u64 | *ordinal as u64,
                    Architecture::Bit64 => IMPORT_ORDINAL_64 | *ordinal as u64,
                },
                ImportEntry::ByName(_) => {
                    (section_rva as u64) + name_offsets[i][j].unwrap_or(0) as u64
                }
            };
            let offset = iat_offsets[i] + j * pointer_size;
            match Architecture::current() {
                Architecture::Bit32 => put(&mut data, offset, &(thunk as u32)),
                Architecture::Bit64 => put(&mut data, offset, &thunk),
            }
        }
    }
    data[names_base..names_base + names_blob.len()].copy_from_slice(&names_blob);
    data[dll_base..].copy_from_slice(&dll_blob);

    let iat_rvas = iat_offsets
        .into_iter()
        .map(|offset| section_rva + offset as u32)
        .collect();
    (data, iat_rvas)
}

struct BuilderSection {
    name: [u8; 8],
    rva: u32,
    data: Vec<u8>,
    virtual_size: u32,
    flags: u32,
}

/// Builds PE images for the current machine type. Section RVAs are chosen
/// by the caller and must follow the usual convention of sequential,
/// alignment-rounded offsets so that base-plus-RVA addressing holds.
pub struct ImageBuilder {
    pub image_base: u64,
    pub machine: u16,
    entry_point: u32,
    code_base: u32,
    code_size: u32,
    sections: Vec<BuilderSection>,
    directories: [PeDataDirectory; PE_NUM_DIRECTORIES],
}

impl ImageBuilder {
    pub fn new(image_base: u64) -> Self {
        Self {
            image_base,
            machine: MACHINE_CURRENT,
            entry_point: 0x1000,
            code_base: 0x1000,
            code_size: 0x1000,
            sections: Vec::new(),
            directories: [PeDataDirectory::default(); PE_NUM_DIRECTORIES],
        }
    }

    pub fn entry_point(mut self, rva: u32) -> Self {
        self.entry_point = rva;
        self
    }

    fn add_section(&mut self, name: &str, rva: u32, data: Vec<u8>, virtual_size: u32, flags: u32) {
        let mut name_bytes = [0u8; 8];
        let len = name.len().min(8);
        name_bytes[..len].copy_from_slice(&name.as_bytes()[..len]);
        self.sections.push(BuilderSection {
            name: name_bytes,
            rva,
            data,
            virtual_size,
            flags,
        });
    }

    pub fn text_section(mut self, rva: u32, data: Vec<u8>) -> Self {
        self.code_base = rva;
        self.code_size = data.len() as u32;
        let virtual_size = data.len() as u32;
        self.add_section(
            ".text",
            rva,
            data,
            virtual_size,
            section_flags::READ | section_flags::EXECUTE,
        );
        self
    }

    pub fn data_section(mut self, rva: u32, data: Vec<u8>) -> Self {
        let virtual_size = data.len() as u32;
        self.add_section(
            ".data",
            rva,
            data,
            virtual_size,
            section_flags::READ | section_flags::WRITE,
        );
        self
    }

    pub fn bss_section(mut self, rva: u32, size: u32) -> Self {
        self.add_section(
            ".bss",
            rva,
            Vec::new(),
            size,
            section_flags::READ | section_flags::WRITE | section_flags::BSS,
        );
        self
    }

    /// Add a section and point the given data directory at it.
    pub fn raw_directory_section(
        mut self,
        name: &str,
        rva: u32,
        data: Vec<u8>,
        directory_index: usize,
    ) -> Self {
        self.directories[directory_index] = PeDataDirectory {
            address_rva: rva,
            size: data.len() as u32,
        };
        let virtual_size = data.len() as u32;
        self.add_section(
            name,
            rva,
            data,
            virtual_size,
            section_flags::READ | section_flags::WRITE,
        );
        self
    }

    /// Add a base-relocation directory: per block a page RVA and its
    /// `(type, offset)` entries.
    pub fn base_relocations(self, rva: u32, blocks: &[(u32, Vec<(u16, u16)>)]) -> Self {
        let mut data = Vec::new();
        for (page_rva, entries) in blocks {
            let block_length = (8 + 2 * entries.len()) as u32;
            data.extend_from_slice(&page_rva.to_le_bytes());
            data.extend_from_slice(&block_length.to_le_bytes());
            for (kind, offset) in entries {
                let entry = (kind << 12) | (offset & 0x0FFF);
                data.extend_from_slice(&entry.to_le_bytes());
            }
        }
        self.raw_directory_section(".reloc", rva, data, directory::BASE_RELOCATION)
    }

    pub fn export_section(
        self,
        rva: u32,
        ordinal_base: u32,
        entries: &[ExportEntry],
    ) -> Self {
        let data = build_export_section(rva, ordinal_base, entries);
        self.raw_directory_section(".edata", rva, data, directory::EXPORT)
    }

    /// An export directory with no name table; `entries` are
    /// `(address-table index, function rva)` pairs.
    pub fn ordinal_only_exports(
        self,
        rva: u32,
        ordinal_base: u32,
        entries: &[(u32, u32)],
    ) -> Self {
        let number_of_functions = entries
            .iter()
            .map(|&(index, _)| index + 1)
            .max()
            .unwrap_or(0);
        let addr_off = core::mem::size_of::<PeExportDirectory>();
        let mut data = vec![0u8; addr_off + 4 * number_of_functions as usize];
        let export = PeExportDirectory {
            attributes: 0,
            time_stamp: 0,
            version_major: 0,
            version_minor: 0,
            dll_name_rva: 0,
            ordinal_base,
            number_of_functions,
            number_of_names: 0,
            address_of_functions: rva + addr_off as u32,
            address_of_names: 0,
            address_of_ordinals: 0,
        };
        put(&mut data, 0, &export);
        for &(index, fn_rva) in entries {
            put(&mut data, addr_off + 4 * index as usize, &fn_rva);
        }
        self.raw_directory_section(".edata", rva, data, directory::EXPORT)
    }

    pub fn import_section(self, rva: u32, specs: &[ImportSpec]) -> Self {
        let (data, _) = build_import_section(rva, specs);
        self.raw_directory_section(".idata", rva, data, directory::IMPORT)
    }

    pub fn build(self) -> Vec<u8> {
        let architecture = Architecture::current();

        let mut file_offsets = Vec::with_capacity(self.sections.len());
        let mut file_cursor = SIZE_OF_HEADERS;
        for section in &self.sections {
            if section.data.is_empty() {
                file_offsets.push(0);
            } else {
                file_offsets.push(file_cursor);
                file_cursor = align_to(file_cursor + section.data.len(), FILE_ALIGNMENT as usize);
            }
        }

        let mut image = vec![0u8; file_cursor];
        let mz = MzHeader {
            magic: MZ_MAGIC,
            pe_header_address: 0x40,
            ..Zeroable::zeroed()
        };
        put(&mut image, 0, &mz);

        let optional_size = match architecture {
            Architecture::Bit32 => core::mem::size_of::<PeOptionalHeader32>(),
            Architecture::Bit64 => core::mem::size_of::<PeOptionalHeader64>(),
        };
        let pe = PeHeader {
            magic: PE_MAGIC,
            machine: self.machine,
            num_sections: self.sections.len() as u16,
            time_stamp: 0,
            symbol_table: 0,
            num_symbols: 0,
            optional_header_size: optional_size as u16,
            attributes: 0x0102,
        };
        put(&mut image, 0x40, &pe);

        let size_of_image = self
            .sections
            .iter()
            .map(|section| {
                let end = section.rva as u64 + section.virtual_size.max(section.data.len() as u32) as u64;
                crate::pe::mapper::align_up(end, SECTION_ALIGNMENT as u64)
            })
            .max()
            .unwrap_or(SECTION_ALIGNMENT as u64) as u32;

        let optional_offset = 0x40 + core::mem::size_of::<PeHeader>();
        match architecture {
            Architecture::Bit64 => {
                let optional = PeOptionalHeader64 {
                    architecture: PE_OPTIONAL_MAGIC_64,
                    size_of_code: self.code_size,
                    entry_point_rva: self.entry_point,
                    base_of_code: self.code_base,
                    base_address: self.image_base,
                    section_alignment: SECTION_ALIGNMENT,
                    file_alignment: FILE_ALIGNMENT,
                    size_of_image,
                    size_of_headers: SIZE_OF_HEADERS as u32,
                    num_directories: PE_NUM_DIRECTORIES as u32,
                    directories: self.directories,
                    ..Zeroable::zeroed()
                };
                put(&mut image, optional_offset, &optional);
            }
            Architecture::Bit32 => {
                let optional = PeOptionalHeader32 {
                    architecture: PE_OPTIONAL_MAGIC_32,
                    size_of_code: self.code_size,
                    entry_point_rva: self.entry_point,
                    base_of_code: self.code_base,
                    base_address: self.image_base as u32,
                    section_alignment: SECTION_ALIGNMENT,
                    file_alignment: FILE_ALIGNMENT,
                    size_of_image,
                    size_of_headers: SIZE_OF_HEADERS as u32,
                    num_directories: PE_NUM_DIRECTORIES as u32,
                    directories: self.directories,
                    ..Zeroable::zeroed()
                };
                put(&mut image, optional_offset, &optional);
            }
        }

        let section_table = optional_offset + optional_size;
        for (i, section) in self.sections.iter().enumerate() {
            let header = PeSectionHeader {
                name: section.name,
                virtual_size: section.virtual_size,
                virtual_address: section.rva,
                raw_size: section.data.len() as u32,
                raw_address: file_offsets[i] as u32,
                relocations_address: 0,
                line_numbers_address: 0,
                num_relocations: 0,
                num_line_numbers: 0,
                flags: section.flags,
            };
            put(
                &mut image,
                section_table + i * core::mem::size_of::<PeSectionHeader>(),
                &header,
            );
            if !section.data.is_empty() {
                let offset = file_offsets[i];
                image[offset..offset + section.data.len()].copy_from_slice(&section.data);
            }
        }
        image
    }
}

// ============================================================================
// Fake collaborators
// ============================================================================

/// In-memory filesystem keyed by absolute path.
#[derive(Default)]
pub struct FakeFileSystem {
    files: Mutex<HashMap<String, Vec<u8>>>,
}

impl FakeFileSystem {
    pub fn insert(&self, path: &str, data: Vec<u8>) {
        self.files.lock().insert(path.to_string(), data);
    }
}

impl FileSystemApi for FakeFileSystem {
    fn read_file(&self, path: &str) -> Result<Vec<u8>, OsError> {
        self.files.lock().get(path).cloned().ok_or(OsError::NotFound)
    }

    fn stat(&self, path: &str) -> Result<(), OsError> {
        if self.files.lock().contains_key(path) {
            Ok(())
        } else {
            Err(OsError::NotFound)
        }
    }
}

/// In-memory ramdisk archive keyed by absolute path.
#[derive(Default)]
pub struct FakeRamdisk {
    files: Mutex<HashMap<String, Vec<u8>>>,
}

impl FakeRamdisk {
    pub fn insert(&self, path: &str, data: Vec<u8>) {
        self.files.lock().insert(path.to_string(), data);
    }
}

impl RamdiskApi for FakeRamdisk {
    fn find_ramdisk_file(&self, path: &str) -> Result<Vec<u8>, OsError> {
        self.files.lock().get(path).cloned().ok_or(OsError::NotFound)
    }
}

struct FakeMapping {
    space: Uuid,
    address: u64,
    data: Box<[u8]>,
    #[allow(dead_code)]
    flags: MappingFlags,
}

/// Fake kernel memory interface. Mappings are heap buffers that stay
/// alive after "release" so the remote contents remain observable.
pub struct FakeMemory {
    base_address: u64,
    next_space: Mutex<Uuid>,
    mappings: Mutex<Vec<FakeMapping>>,
}

impl FakeMemory {
    pub fn new(base_address: u64) -> Self {
        Self {
            base_address,
            next_space: Mutex::new(1),
            mappings: Mutex::new(Vec::new()),
        }
    }

    /// Read back remote memory, panicking when no single mapping covers
    /// the requested range.
    pub fn read(&self, space: Uuid, address: u64, length: usize) -> Vec<u8> {
        let mappings = self.mappings.lock();
        for mapping in mappings.iter() {
            let end = mapping.address + mapping.data.len() as u64;
            if mapping.space == space
                && address >= mapping.address
                && address + length as u64 <= end
            {
                let offset = (address - mapping.address) as usize;
                return mapping.data[offset..offset + length].to_vec();
            }
        }
        panic!("no mapping covers {:#x}..{:#x}", address, address + length as u64);
    }
}

impl MemoryApi for FakeMemory {
    fn create_memory_space(&self, _flags: u32) -> Result<Uuid, OsError> {
        let mut next = self.next_space.lock();
        let space = *next;
        *next += 1;
        Ok(space)
    }

    fn create_mapping(
        &self,
        memory_space: Uuid,
        params: &MappingParameters,
    ) -> Result<*mut u8, OsError> {
        let mut mappings = self.mappings.lock();
        // A second view of already-mapped pages aliases the same buffer.
        if let Some(existing) = mappings.iter_mut().find(|mapping| {
            mapping.space == memory_space
                && mapping.address == params.virtual_address
                && mapping.data.len() >= params.length
        }) {
            return Ok(existing.data.as_mut_ptr());
        }

        let mut mapping = FakeMapping {
            space: memory_space,
            address: params.virtual_address,
            data: vec![0u8; params.length].into_boxed_slice(),
            flags: params.flags,
        };
        let pointer = mapping.data.as_mut_ptr();
        mappings.push(mapping);
        Ok(pointer)
    }

    fn free_mapping(&self, _local_address: *mut u8, _length: usize) -> Result<(), OsError> {
        // The remote placement persists; keep the buffer for read-back.
        Ok(())
    }

    fn process_base_address(&self) -> u64 {
        self.base_address
    }
}

// ============================================================================
// Environment bundle
// ============================================================================

/// Everything a loader test needs, wired together.
pub struct TestEnv {
    pub fs: Arc<FakeFileSystem>,
    pub ramdisk: Arc<FakeRamdisk>,
    pub memory: Arc<FakeMemory>,
    pub cache: Arc<ModuleCache>,
}

impl TestEnv {
    pub fn new(base_address: u64) -> Self {
        let fs = Arc::new(FakeFileSystem::default());
        let ramdisk = Arc::new(FakeRamdisk::default());
        let memory = Arc::new(FakeMemory::new(base_address));
        let cache = Arc::new(ModuleCache::new(fs.clone(), ramdisk.clone()));
        Self {
            fs,
            ramdisk,
            memory,
            cache,
        }
    }

    pub fn add_file(&self, path: &str, data: Vec<u8>) {
        self.fs.insert(path, data);
    }

    pub fn add_ramdisk_file(&self, path: &str, data: Vec<u8>) {
        self.ramdisk.insert(path, data);
    }

    pub fn context(&self, paths: &str) -> LoadContext {
        let memory: Arc<dyn MemoryApi> = self.memory.clone();
        LoadContext::new(self.cache.clone(), memory, 1, paths).expect("load context")
    }

    /// Read remote memory of the context's target space.
    pub fn read(&self, ctx: &LoadContext, address: u64, length: usize) -> Vec<u8> {
        self.memory.read(ctx.memory_space(), address, length)
    }

    pub fn read_u64(&self, ctx: &LoadContext, address: u64) -> u64 {
        let bytes = self.read(ctx, address, 8);
        u64::from_le_bytes(bytes.try_into().expect("eight bytes"))
    }

    /// Read a pointer-sized word of the target architecture.
    pub fn read_word(&self, ctx: &LoadContext, address: u64) -> u64 {
        match Architecture::current() {
            Architecture::Bit32 => {
                let bytes = self.read(ctx, address, 4);
                u32::from_le_bytes(bytes.try_into().expect("four bytes")) as u64
            }
            Architecture::Bit64 => self.read_u64(ctx, address),
        }
    }
}
