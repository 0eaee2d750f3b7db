//! Portable Executable images: MZ, COFF, optional header, section table,
//! data directories and the resource tree.

mod headers;
mod directories;
mod resources;

use log::debug;

pub use headers::*;
pub use directories::*;
pub use resources::{ResourceDirectory, ResourceEntry, ResourceLeaf, ResourceName};

use crate::probe::{
    ascii_field, ByteSource, DisasmSection, DisasmSeeds, IssueLog, ProbeOptions, Reader, Stage,
};

pub const DOS_MAGIC: &[u8; 2] = b"MZ";
pub const PE_SIGNATURE: [u8; 4] = [0x50, 0x45, 0x00, 0x00];

/// Marks a byte range the parser accounted for. Regions may overlap and no
/// gap detection is performed.
#[derive(Debug, Clone)]
pub struct CoverageRegion {
    pub label: &'static str,
    pub file_offset: u64,
    pub length: u64,
}

#[derive(Debug)]
pub struct PeImage {
    pub e_lfanew: u32,
    pub coff: CoffHeader,
    pub optional: Option<OptionalHeader>,
    pub sections: Vec<SectionHeader>,
    pub imports: Vec<ImportedModule>,
    pub delay_imports: Vec<ImportedModule>,
    pub bound_imports: Vec<BoundImport>,
    pub exports: Option<ExportDirectory>,
    pub resources: Option<ResourceDirectory>,
    pub base_relocations: Option<RelocationSummary>,
    pub debug_entries: Vec<DebugEntry>,
    pub tls: Option<TlsDirectory>,
    pub exception: Option<ExceptionSummary>,
    pub load_config: Option<LoadConfig>,
    pub certificates: Vec<Certificate>,
    pub rich_header: Option<RichHeader>,
    pub coverage: Vec<CoverageRegion>,
    pub seeds: DisasmSeeds,
    pub issues: Vec<String>,
}

impl PeImage {
    /// Linear section scan: an RVA maps into the section whose
    /// `[VirtualAddress, VirtualAddress + max(VirtualSize, SizeOfRawData))`
    /// span contains it.
    pub fn rva_to_offset(&self, rva: u32) -> Option<u64> {
        rva_to_offset(&self.sections, rva)
    }

    pub fn is_dll(&self) -> bool {
        self.coff.characteristics.check_flag(FileCharacteristics::DLL)
    }
}

pub(super) fn rva_to_offset(sections: &[SectionHeader], rva: u32) -> Option<u64> {
    for section in sections {
        let span = section.virtual_span();
        if rva >= section.virtual_address && rva - section.virtual_address < span {
            return Some(section.pointer_to_raw_data as u64 + (rva - section.virtual_address) as u64);
        }
    }
    None
}

/// Shared view handed to the directory and resource walkers.
pub(super) struct PeContext<'a> {
    pub window: &'a [u8],
    pub sections: Vec<SectionHeader>,
    pub image_base: u64,
    pub is_plus: bool,
}

impl<'a> PeContext<'a> {
    pub fn rva_to_offset(&self, rva: u32) -> Option<usize> {
        rva_to_offset(&self.sections, rva)
            .filter(|&offset| offset < self.window.len() as u64)
            .map(|offset| offset as usize)
    }

    pub fn bytes_at_rva(&self, rva: u32, length: usize) -> Option<&'a [u8]> {
        let offset = self.rva_to_offset(rva)?;
        self.window.get(offset..offset.checked_add(length)?)
    }

    /// NUL-terminated ASCII at an RVA, bounded at 4096 bytes.
    pub fn cstring_at_rva(&self, rva: u32) -> Option<String> {
        let offset = self.rva_to_offset(rva)?;
        let bytes = self.window.get(offset..)?;
        let bytes = &bytes[..bytes.len().min(4096)];
        let end = bytes.iter().position(|&b| b == 0)?;
        Some(ascii_field(&bytes[..end], end))
    }

    /// Translates an absolute VA (as stored by TLS and VA-form delay
    /// descriptors) back through the image base.
    pub fn va_to_offset(&self, va: u64) -> Option<usize> {
        let rva = va.checked_sub(self.image_base)?;
        self.rva_to_offset(u32::try_from(rva).ok()?)
    }
}

pub fn analyze(source: &dyn ByteSource, options: &ProbeOptions<'_>) -> Option<PeImage> {
    debug!("pe: analyzing {} bytes", source.len());
    let mut issues = IssueLog::new();
    let mut coverage = Vec::new();

    let window = source.slice(0, source.len()).ok()?;
    if window.len() < 0x40 || &window[..2] != DOS_MAGIC {
        return None;
    }
    let reader = Reader::new(&window, 0);

    // At 0x3c the DOS header holds `e_lfanew`, the PE signature offset.
    let e_lfanew = reader.u32_le_at(0x3c)?;
    coverage.push(CoverageRegion { label: "dos header", file_offset: 0, length: 0x40 });
    let pe_at = e_lfanew as usize;
    if window.get(pe_at..pe_at + 4) != Some(&PE_SIGNATURE[..]) {
        issues.note(format!("PE signature missing at 0x{:08x}", e_lfanew));
        return None;
    }

    let rich_header = read_rich_header(&window[..pe_at.min(window.len())]);

    let coff_at = pe_at + 4;
    let coff_raw: &[u8; 20] = window.get(coff_at..coff_at + 20)?.try_into().ok()?;
    let coff = CoffHeader::from(coff_raw);
    coverage.push(CoverageRegion {
        label: "coff header",
        file_offset: pe_at as u64,
        length: 24,
    });

    let mut opt_reader = Reader::new(&window, 0);
    opt_reader.set_pos(coff_at + 20);
    let optional = if coff.optional_header_size >= 2 {
        OptionalHeader::read(&mut opt_reader, coff.optional_header_size, &mut issues)
    } else {
        issues.note("optional header is absent");
        None
    };
    if optional.is_some() {
        coverage.push(CoverageRegion {
            label: "optional header",
            file_offset: (coff_at + 20) as u64,
            length: coff.optional_header_size as u64,
        });
    }

    // Section table directly after the optional header.
    let mut sections = Vec::with_capacity(coff.number_of_sections as usize);
    let section_table_at = coff_at + 20 + coff.optional_header_size as usize;
    for index in 0..coff.number_of_sections as usize {
        let at = section_table_at + index * 40;
        let Some(raw) = window.get(at..at + 40) else {
            issues.note(format!("section table entry {} is truncated", index));
            break;
        };
        let raw: &[u8; 40] = raw.try_into().unwrap();
        sections.push(SectionHeader::from(raw));
    }
    coverage.push(CoverageRegion {
        label: "section table",
        file_offset: section_table_at as u64,
        length: sections.len() as u64 * 40,
    });

    let context = PeContext {
        window: &window,
        sections,
        image_base: optional.as_ref().map(|opt| opt.image_base).unwrap_or(0),
        is_plus: optional.as_ref().map(|opt| opt.is_plus).unwrap_or(false),
    };

    let mut image = PeImage {
        e_lfanew,
        coff,
        optional,
        sections: context.sections.clone(),
        imports: Vec::new(),
        delay_imports: Vec::new(),
        bound_imports: Vec::new(),
        exports: None,
        resources: None,
        base_relocations: None,
        debug_entries: Vec::new(),
        tls: None,
        exception: None,
        load_config: None,
        certificates: Vec::new(),
        rich_header,
        coverage,
        seeds: DisasmSeeds::default(),
        issues: Vec::new(),
    };

    if let Some(optional) = &image.optional {
        let directory = |index: DirectoryIndex| optional.data_directories[index as usize];

        let dir = directory(DirectoryIndex::Import);
        if dir.is_present() {
            image.imports = read_imports(&context, dir, options, &mut issues);
            push_rva_region(&mut image.coverage, &context, "import directory", dir);
        }
        let dir = directory(DirectoryIndex::DelayImport);
        if dir.is_present() {
            image.delay_imports = read_delay_imports(&context, dir, options, &mut issues);
            push_rva_region(&mut image.coverage, &context, "delay import directory", dir);
        }
        let dir = directory(DirectoryIndex::BoundImport);
        if dir.is_present() {
            image.bound_imports = read_bound_imports(&context, dir, &mut issues);
            push_rva_region(&mut image.coverage, &context, "bound import directory", dir);
        }
        let dir = directory(DirectoryIndex::Export);
        if dir.is_present() {
            image.exports = read_exports(&context, dir, options, &mut issues);
            push_rva_region(&mut image.coverage, &context, "export directory", dir);
        }
        let dir = directory(DirectoryIndex::Resource);
        if dir.is_present() {
            image.resources = resources::read_resources(&context, dir, options, &mut issues);
            push_rva_region(&mut image.coverage, &context, "resource directory", dir);
        }
        let dir = directory(DirectoryIndex::BaseRelocation);
        if dir.is_present() {
            image.base_relocations = Some(read_base_relocations(&context, dir, &mut issues));
            push_rva_region(&mut image.coverage, &context, "base relocations", dir);
        }
        let dir = directory(DirectoryIndex::Debug);
        if dir.is_present() {
            image.debug_entries = read_debug_directory(&context, dir, &mut issues);
            push_rva_region(&mut image.coverage, &context, "debug directory", dir);
        }
        let dir = directory(DirectoryIndex::Tls);
        if dir.is_present() {
            image.tls = read_tls(&context, dir, &mut issues);
            push_rva_region(&mut image.coverage, &context, "tls directory", dir);
        }
        let dir = directory(DirectoryIndex::Exception);
        if dir.is_present() {
            image.exception = Some(read_exception_directory(&context, dir, &mut issues));
            push_rva_region(&mut image.coverage, &context, "exception directory", dir);
        }
        let dir = directory(DirectoryIndex::LoadConfig);
        if dir.is_present() {
            image.load_config = read_load_config(&context, dir, &mut issues);
            push_rva_region(&mut image.coverage, &context, "load config", dir);
        }
        // The security directory's "RVA" is a plain file offset.
        let dir = directory(DirectoryIndex::Security);
        if dir.is_present() {
            image.certificates = read_certificates(&context, dir, &mut issues);
            image.coverage.push(CoverageRegion {
                label: "security directory",
                file_offset: dir.rva as u64,
                length: dir.size as u64,
            });
        }
    }

    image.seeds = collect_seeds(&context, &image, options, &mut issues);

    options.report(Stage::Headers, window.len() as u64, image.sections.len() as u64);
    image.issues = issues.into_entries();
    Some(image)
}

fn push_rva_region(
    coverage: &mut Vec<CoverageRegion>,
    context: &PeContext<'_>,
    label: &'static str,
    dir: DataDirectory,
) {
    if let Some(offset) = context.rva_to_offset(dir.rva) {
        coverage.push(CoverageRegion {
            label,
            file_offset: offset as u64,
            length: dir.size as u64,
        });
    }
}

/// Linker fingerprint between the DOS stub and the PE signature: the
/// `Rich` marker, then XOR-masked `DanS` and `comp.id` records.
#[derive(Debug)]
pub struct RichHeader {
    pub xor_key: u32,
    pub tool_records: u32,
}

fn read_rich_header(stub: &[u8]) -> Option<RichHeader> {
    let rich_at = stub.windows(4).position(|w| w == b"Rich")?;
    let key_raw = stub.get(rich_at + 4..rich_at + 8)?;
    let xor_key = u32::from_le_bytes(key_raw.try_into().ok()?);
    // Walk backwards counting masked comp.id/count pairs until `DanS`.
    let mut records = 0u32;
    let mut at = rich_at;
    while at >= 8 {
        at -= 8;
        let id = u32::from_le_bytes(stub[at..at + 4].try_into().ok()?) ^ xor_key;
        if id == u32::from_le_bytes(*b"DanS") {
            return Some(RichHeader { xor_key, tool_records: records });
        }
        records += 1;
    }
    None
}

/// Disassembly seeds: entry point, exported code addresses, TLS callbacks.
/// Seeds outside every executable section are dropped and counted.
fn collect_seeds(
    context: &PeContext<'_>,
    image: &PeImage,
    options: &ProbeOptions<'_>,
    issues: &mut IssueLog,
) -> DisasmSeeds {
    let mut seeds = DisasmSeeds {
        bitness: if context.is_plus { 64 } else { 32 },
        ..DisasmSeeds::default()
    };
    let executable: Vec<(u32, u32)> = context
        .sections
        .iter()
        .filter(|s| s.characteristics.check_flag(SectionCharacteristics::MEM_EXECUTE))
        .map(|s| (s.virtual_address, s.virtual_span()))
        .collect();
    let in_exec = |rva: u32| {
        executable
            .iter()
            .any(|&(start, span)| rva >= start && rva - start < span)
    };

    let mut groups: Vec<(&str, u32)> = Vec::new();
    let mut note_dropped = |groups: &mut Vec<(&str, u32)>, group: &'static str| {
        match groups.iter_mut().find(|(name, _)| *name == group) {
            Some((_, count)) => *count += 1,
            None => groups.push((group, 1)),
        }
    };

    if let Some(optional) = &image.optional {
        if optional.entry_point_rva != 0 {
            if in_exec(optional.entry_point_rva) {
                seeds.entrypoints.push(context.image_base + optional.entry_point_rva as u64);
            } else {
                note_dropped(&mut groups, "entry point");
            }
        }
    }
    if let Some(exports) = &image.exports {
        for export in &exports.entries {
            if export.forwarder.is_none() {
                if in_exec(export.rva) {
                    seeds.entrypoints.push(context.image_base + export.rva as u64);
                } else {
                    note_dropped(&mut groups, "exports");
                }
            }
        }
    }
    if let Some(tls) = &image.tls {
        for &callback_va in &tls.callbacks {
            let rva = callback_va.saturating_sub(context.image_base);
            if u32::try_from(rva).ok().is_some_and(in_exec) {
                seeds.entrypoints.push(callback_va);
            } else {
                note_dropped(&mut groups, "tls callbacks");
            }
        }
    }
    if let Some(exception) = &image.exception {
        for &begin in &exception.begin_rvas {
            if in_exec(begin) {
                seeds.entrypoints.push(context.image_base + begin as u64);
            } else {
                note_dropped(&mut groups, "unwind table");
            }
        }
    }
    if let Some(config) = &image.load_config {
        for &rva in &config.guard_functions {
            if in_exec(rva) {
                seeds.entrypoints.push(context.image_base + rva as u64);
            } else {
                note_dropped(&mut groups, "cf-guard functions");
            }
        }
        for &rva in &config.se_handlers {
            if in_exec(rva) {
                seeds.entrypoints.push(context.image_base + rva as u64);
            } else {
                note_dropped(&mut groups, "safeseh handlers");
            }
        }
    }
    seeds.entrypoints.sort_unstable();
    seeds.entrypoints.dedup();
    for (group, count) in groups {
        issues.note(format!(
            "{} seed(s) from {} lie outside executable sections",
            count, group
        ));
        seeds.dropped.push((group.to_string(), count));
    }

    match options.disassembler {
        Some(disassembler) => {
            let sections = context
                .sections
                .iter()
                .filter(|s| s.characteristics.check_flag(SectionCharacteristics::MEM_EXECUTE))
                .filter_map(|s| {
                    let start = s.pointer_to_raw_data as usize;
                    let end = start.checked_add(s.size_of_raw_data as usize)?;
                    Some(DisasmSection {
                        vaddr_start: context.image_base + s.virtual_address as u64,
                        bytes: context.window.get(start..end)?.to_vec(),
                    })
                })
                .collect();
            disassembler.decode(seeds.bitness, sections, &seeds.entrypoints);
        }
        None => issues.note("no disassembler provided; code regions not decoded"),
    }
    seeds
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::probe::MemorySource;

    /// Builds a PE32+ DLL with one `.text` section and no directories.
    pub(crate) fn minimal_pe32plus_dll() -> Vec<u8> {
        build_pe(true, FileCharacteristics::EXECUTABLE_IMAGE | FileCharacteristics::DLL)
    }

    pub(crate) fn build_pe(is_plus: bool, characteristics: u16) -> Vec<u8> {
        let mut data = vec![0u8; 0x40];
        data[..2].copy_from_slice(DOS_MAGIC);
        data[0x3c..0x40].copy_from_slice(&0x40u32.to_le_bytes());

        // PE signature + COFF header.
        data.extend_from_slice(&PE_SIGNATURE);
        let opt_size: u16 = if is_plus { 0xF0 } else { 0xE0 };
        data.extend_from_slice(&(if is_plus { 0x8664u16 } else { 0x014cu16 }).to_le_bytes());
        data.extend_from_slice(&1u16.to_le_bytes()); // one section
        data.extend_from_slice(&0x5f000000u32.to_le_bytes());
        data.extend_from_slice(&[0u8; 8]);
        data.extend_from_slice(&opt_size.to_le_bytes());
        data.extend_from_slice(&characteristics.to_le_bytes());

        // Optional header.
        let opt_at = data.len();
        data.extend_from_slice(&(if is_plus { 0x20bu16 } else { 0x10bu16 }).to_le_bytes());
        data.push(14);
        data.push(0);
        data.extend_from_slice(&0x200u32.to_le_bytes()); // size of code
        data.extend_from_slice(&[0u8; 8]);
        data.extend_from_slice(&0x1000u32.to_le_bytes()); // entry point
        data.extend_from_slice(&0x1000u32.to_le_bytes()); // base of code
        if is_plus {
            data.extend_from_slice(&0x1_8000_0000u64.to_le_bytes());
        } else {
            data.extend_from_slice(&0u32.to_le_bytes()); // base of data
            data.extend_from_slice(&0x40_0000u32.to_le_bytes());
        }
        data.extend_from_slice(&0x1000u32.to_le_bytes()); // section alignment
        data.extend_from_slice(&0x200u32.to_le_bytes()); // file alignment
        data.extend_from_slice(&6u16.to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes());
        data.extend_from_slice(&[0u8; 4]); // image version
        data.extend_from_slice(&6u16.to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes());
        data.extend_from_slice(&[0u8; 4]); // win32 version
        data.extend_from_slice(&0x2000u32.to_le_bytes()); // size of image
        data.extend_from_slice(&0x400u32.to_le_bytes()); // size of headers
        data.extend_from_slice(&0u32.to_le_bytes()); // checksum
        data.extend_from_slice(&2u16.to_le_bytes()); // GUI subsystem
        data.extend_from_slice(&0x8160u16.to_le_bytes()); // dll characteristics
        let pointer = if is_plus { 8 } else { 4 };
        data.extend_from_slice(&vec![0u8; 4 * pointer + 4]);
        data.extend_from_slice(&16u32.to_le_bytes()); // directory count
        data.extend_from_slice(&[0u8; 16 * 8]);
        assert_eq!(data.len() - opt_at, opt_size as usize);

        // .text section: vaddr 0x1000, raw 0x200 at 0x400.
        let mut section = [0u8; 40];
        section[..5].copy_from_slice(b".text");
        section[8..12].copy_from_slice(&0u32.to_le_bytes()); // virtual size
        section[12..16].copy_from_slice(&0x1000u32.to_le_bytes());
        section[16..20].copy_from_slice(&0x200u32.to_le_bytes());
        section[20..24].copy_from_slice(&0x400u32.to_le_bytes());
        section[36..40].copy_from_slice(&0x6000_0020u32.to_le_bytes());
        data.extend_from_slice(&section);

        data.resize(0x400, 0);
        data.resize(0x600, 0x90);
        data
    }

    #[test]
    fn pe32plus_dll_basics() {
        let image =
            analyze(&MemorySource::new(minimal_pe32plus_dll()), &ProbeOptions::default())
                .unwrap();
        assert_eq!(image.coff.machine, 0x8664);
        assert_eq!(image.coff.machine_label(), "x86-64");
        assert!(image.is_dll());
        let optional = image.optional.as_ref().unwrap();
        assert!(optional.is_plus);
        assert_eq!(optional.image_base, 0x1_8000_0000);
        assert_eq!(image.sections.len(), 1);
    }

    #[test]
    fn rva_translation_vectors() {
        // Section: vaddr 0x1000, raw size 0x200, raw pointer 0x400.
        let image =
            analyze(&MemorySource::new(build_pe(false, 0x0102)), &ProbeOptions::default())
                .unwrap();
        assert_eq!(image.rva_to_offset(0x1080), Some(0x480));
        assert_eq!(image.rva_to_offset(0x2000), None);
    }

    #[test]
    fn entry_point_seeds_executable_section() {
        let image =
            analyze(&MemorySource::new(minimal_pe32plus_dll()), &ProbeOptions::default())
                .unwrap();
        assert_eq!(image.seeds.bitness, 64);
        assert_eq!(image.seeds.entrypoints, vec![0x1_8000_1000]);
        assert!(image.seeds.dropped.is_empty());
    }

    #[test]
    fn truncated_signature_is_rejected_with_issue() {
        let mut data = vec![0u8; 0x40];
        data[..2].copy_from_slice(DOS_MAGIC);
        data[0x3c..0x40].copy_from_slice(&0x1000u32.to_le_bytes());
        assert!(analyze(&MemorySource::new(data), &ProbeOptions::default()).is_none());
    }
}
