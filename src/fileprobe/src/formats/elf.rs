//! ELF object files: identification, headers, dynamic symbols and
//! disassembly seeding.

use log::debug;

use crate::probe::{
    cstring_at, ByteSource, DisasmSection, DisasmSeeds, IssueLog, ProbeOptions, Reader, Stage,
};

pub const MAGIC: &[u8; 4] = b"\x7fELF";

const SHT_DYNSYM: u32 = 11;
const SHT_STRTAB: u32 = 3;
const SHF_EXECINSTR: u64 = 0x4;
const PT_INTERP: u32 = 3;
const PF_X: u32 = 0x1;

/// Caps before any allocation driven by declared counts.
const MAX_PROGRAM_HEADERS: u16 = 512;
const MAX_SECTION_HEADERS: u16 = 4096;
const MAX_SYMBOLS: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfClass {
    Elf32,
    Elf64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfData {
    Lsb,
    Msb,
}

/// # ELF identification (first 16 bytes)
///
/// | Offset | Size | Field |
/// | ------ | ---- | ----- |
/// | 0      | 4    | Magic `7F 45 4C 46` |
/// | 4      | 1    | Class: 1 = 32-bit, 2 = 64-bit |
/// | 5      | 1    | Data: 1 = little-endian, 2 = big-endian |
/// | 6      | 1    | Version |
/// | 7      | 1    | OS/ABI |
/// | 8      | 1    | ABI version |
#[derive(Debug)]
pub struct ElfIdent {
    pub class_byte: u8,
    pub data_byte: u8,
    pub class: ElfClass,
    pub data: ElfData,
    pub os_abi: u8,
    pub os_abi_label: &'static str,
}

/// Fixed header with 32/64-bit payloads widened to u64; field order is
/// identical across both classes.
#[derive(Debug)]
pub struct ElfHeader {
    pub elf_type: u16,
    pub type_label: &'static str,
    pub machine: u16,
    pub machine_label: &'static str,
    pub entry: u64,
    pub ph_offset: u64,
    pub sh_offset: u64,
    pub flags: u32,
    pub ph_entry_size: u16,
    pub ph_count: u16,
    pub sh_entry_size: u16,
    pub sh_count: u16,
    pub shstrndx: u16,
}

#[derive(Debug)]
pub struct ProgramHeader {
    pub p_type: u32,
    pub type_label: &'static str,
    pub offset: u64,
    pub vaddr: u64,
    pub file_size: u64,
    pub mem_size: u64,
    pub flags: u32,
    pub align: u64,
}

#[derive(Debug)]
pub struct SectionHeader {
    pub name: String,
    pub sh_type: u32,
    pub flags: u64,
    pub addr: u64,
    pub offset: u64,
    pub size: u64,
    pub link: u32,
    pub entry_size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Import,
    Export,
    Internal,
}

#[derive(Debug)]
pub struct DynamicSymbol {
    pub name: String,
    pub value: u64,
    pub size: u64,
    pub kind: SymbolKind,
    pub bind_label: &'static str,
    pub type_label: &'static str,
    pub visibility_label: &'static str,
}

#[derive(Debug)]
pub struct ElfImage {
    pub ident: ElfIdent,
    pub header: ElfHeader,
    pub program_headers: Vec<ProgramHeader>,
    pub sections: Vec<SectionHeader>,
    pub dynamic_symbols: Vec<DynamicSymbol>,
    pub interpreter: Option<String>,
    pub seeds: DisasmSeeds,
    pub issues: Vec<String>,
}

pub fn analyze(source: &dyn ByteSource, options: &ProbeOptions<'_>) -> Option<ElfImage> {
    debug!("elf: analyzing {} bytes", source.len());
    let mut issues = IssueLog::new();

    let window = source.slice(0, source.len()).ok()?;
    if window.len() < 16 || &window[..4] != MAGIC {
        return None;
    }

    let class = match window[4] {
        1 => ElfClass::Elf32,
        2 => ElfClass::Elf64,
        other => {
            issues.note(format!("unknown ELF class {}", other));
            ElfClass::Elf64
        }
    };
    let data = match window[5] {
        2 => ElfData::Msb,
        1 => ElfData::Lsb,
        other => {
            issues.note(format!("unknown ELF data encoding {}", other));
            ElfData::Lsb
        }
    };
    let ident = ElfIdent {
        class_byte: window[4],
        data_byte: window[5],
        class,
        data,
        os_abi: window[7],
        os_abi_label: os_abi_label(window[7]),
    };

    let reader = ElfReader { window: &window, class, data };
    let header = reader.read_header(&mut issues)?;
    let program_headers = reader.read_program_headers(&header, &mut issues);
    let sections = reader.read_sections(&header, &mut issues);
    let interpreter = program_headers
        .iter()
        .find(|ph| ph.p_type == PT_INTERP)
        .and_then(|ph| {
            let reader = Reader::new(&window, 0);
            cstring_at(&reader, ph.offset as usize, ph.file_size.min(4096) as usize)
        });
    let dynamic_symbols = reader.read_dynamic_symbols(&sections, options, &mut issues);
    let seeds = collect_seeds(
        &window,
        class,
        &header,
        &program_headers,
        &sections,
        &dynamic_symbols,
        options,
        &mut issues,
    );

    Some(ElfImage {
        ident,
        header,
        program_headers,
        sections,
        dynamic_symbols,
        interpreter,
        seeds,
        issues: issues.into_entries(),
    })
}

/// Endianness- and class-aware field access; all reads happen through the
/// already-decoded prefix window.
struct ElfReader<'a> {
    window: &'a [u8],
    class: ElfClass,
    data: ElfData,
}

impl<'a> ElfReader<'a> {
    fn u16_at(&self, offset: usize) -> Option<u16> {
        let reader = Reader::new(self.window, 0);
        match self.data {
            ElfData::Lsb => reader.u16_le_at(offset),
            ElfData::Msb => reader.u16_be_at(offset),
        }
    }

    fn u32_at(&self, offset: usize) -> Option<u32> {
        let reader = Reader::new(self.window, 0);
        match self.data {
            ElfData::Lsb => reader.u32_le_at(offset),
            ElfData::Msb => reader.u32_be_at(offset),
        }
    }

    fn u64_at(&self, offset: usize) -> Option<u64> {
        let reader = Reader::new(self.window, 0);
        match self.data {
            ElfData::Lsb => reader.u64_le_at(offset),
            ElfData::Msb => reader.u64_be_at(offset),
        }
    }

    /// Class-sized address field: u32 widened for ELF32.
    fn addr_at(&self, offset: usize) -> Option<u64> {
        match self.class {
            ElfClass::Elf32 => self.u32_at(offset).map(u64::from),
            ElfClass::Elf64 => self.u64_at(offset),
        }
    }

    fn addr_size(&self) -> usize {
        match self.class {
            ElfClass::Elf32 => 4,
            ElfClass::Elf64 => 8,
        }
    }

    fn read_header(&self, issues: &mut IssueLog) -> Option<ElfHeader> {
        let a = self.addr_size();
        if self.window.len() < 16 + 8 + 3 * a + 4 + 6 * 2 {
            issues.note("ELF header is truncated");
            return None;
        }
        let elf_type = self.u16_at(16)?;
        let machine = self.u16_at(18)?;
        let entry = self.addr_at(24)?;
        let ph_offset = self.addr_at(24 + a)?;
        let sh_offset = self.addr_at(24 + 2 * a)?;
        let tail = 24 + 3 * a;
        Some(ElfHeader {
            elf_type,
            type_label: type_label(elf_type),
            machine,
            machine_label: machine_label(machine),
            entry,
            ph_offset,
            sh_offset,
            flags: self.u32_at(tail)?,
            ph_entry_size: self.u16_at(tail + 6)?,
            ph_count: self.u16_at(tail + 8)?,
            sh_entry_size: self.u16_at(tail + 10)?,
            sh_count: self.u16_at(tail + 12)?,
            shstrndx: self.u16_at(tail + 14)?,
        })
    }

    fn read_program_headers(
        &self,
        header: &ElfHeader,
        issues: &mut IssueLog,
    ) -> Vec<ProgramHeader> {
        let mut headers = Vec::new();
        let count = header.ph_count.min(MAX_PROGRAM_HEADERS);
        if count != header.ph_count {
            issues.note(format!("program header count {} capped", header.ph_count));
        }
        let entry_size = header.ph_entry_size as usize;
        let minimum = match self.class {
            ElfClass::Elf32 => 32,
            ElfClass::Elf64 => 56,
        };
        if count > 0 && entry_size < minimum {
            issues.note(format!("program header entry size {} is too small", entry_size));
            return headers;
        }
        for index in 0..count as usize {
            let at = header.ph_offset as usize + index * entry_size;
            let Some(ph) = self.read_program_header(at) else {
                issues.note(format!(
                    "program header {} at 0x{:08x} is truncated",
                    index, at
                ));
                break;
            };
            headers.push(ph);
        }
        headers
    }

    fn read_program_header(&self, at: usize) -> Option<ProgramHeader> {
        let p_type = self.u32_at(at)?;
        let (offset, vaddr, file_size, mem_size, flags, align) = match self.class {
            // ELF32: type, offset, vaddr, paddr, filesz, memsz, flags, align.
            ElfClass::Elf32 => (
                self.u32_at(at + 4)? as u64,
                self.u32_at(at + 8)? as u64,
                self.u32_at(at + 16)? as u64,
                self.u32_at(at + 20)? as u64,
                self.u32_at(at + 24)?,
                self.u32_at(at + 28)? as u64,
            ),
            // ELF64: type, flags, offset, vaddr, paddr, filesz, memsz, align.
            ElfClass::Elf64 => (
                self.u64_at(at + 8)?,
                self.u64_at(at + 16)?,
                self.u64_at(at + 32)?,
                self.u64_at(at + 40)?,
                self.u32_at(at + 4)?,
                self.u64_at(at + 48)?,
            ),
        };
        Some(ProgramHeader {
            p_type,
            type_label: segment_label(p_type),
            offset,
            vaddr,
            file_size,
            mem_size,
            flags,
            align,
        })
    }

    fn read_sections(&self, header: &ElfHeader, issues: &mut IssueLog) -> Vec<SectionHeader> {
        let mut raw_sections = Vec::new();
        let count = header.sh_count.min(MAX_SECTION_HEADERS);
        if count != header.sh_count {
            issues.note(format!("section header count {} capped", header.sh_count));
        }
        let entry_size = header.sh_entry_size as usize;
        let minimum = match self.class {
            ElfClass::Elf32 => 40,
            ElfClass::Elf64 => 64,
        };
        if count > 0 && entry_size < minimum {
            issues.note(format!("section header entry size {} is too small", entry_size));
            return Vec::new();
        }
        let a = self.addr_size();
        for index in 0..count as usize {
            let at = header.sh_offset as usize + index * entry_size;
            let fields = (|| {
                // name, type, flags, addr, offset, size, link, info,
                // addralign, entsize; flags onward are class-sized.
                Some((
                    self.u32_at(at)?,
                    self.u32_at(at + 4)?,
                    self.addr_at(at + 8)?,
                    self.addr_at(at + 8 + a)?,
                    self.addr_at(at + 8 + 2 * a)?,
                    self.addr_at(at + 8 + 3 * a)?,
                    self.u32_at(at + 8 + 4 * a)?,
                    self.addr_at(at + 16 + 5 * a)?,
                ))
            })();
            let Some((name_off, sh_type, flags, addr, offset, size, link, entry)) = fields
            else {
                issues.note(format!("section header {} at 0x{:08x} is truncated", index, at));
                break;
            };
            raw_sections.push((name_off, SectionHeader {
                name: String::new(),
                sh_type,
                flags,
                addr,
                offset,
                size,
                link,
                entry_size: entry,
            }));
        }

        // Resolve names through the section-header string table.
        let strtab = raw_sections
            .get(header.shstrndx as usize)
            .map(|(_, section)| (section.offset as usize, section.size as usize));
        let mut sections = Vec::with_capacity(raw_sections.len());
        for (name_off, mut section) in raw_sections {
            if let Some((table_offset, table_size)) = strtab {
                let reader = Reader::new(self.window, 0);
                section.name = cstring_at(
                    &reader,
                    table_offset + name_off as usize,
                    table_size.saturating_sub(name_off as usize).min(256),
                )
                .unwrap_or_default();
            }
            sections.push(section);
        }
        sections
    }

    /// Dynamic symbols come from the `SHT_DYNSYM` section; `link` names the
    /// string-table section for `st_name` resolution.
    fn read_dynamic_symbols(
        &self,
        sections: &[SectionHeader],
        options: &ProbeOptions<'_>,
        issues: &mut IssueLog,
    ) -> Vec<DynamicSymbol> {
        let mut symbols = Vec::new();
        let Some(dynsym) = sections.iter().find(|s| s.sh_type == SHT_DYNSYM) else {
            return symbols;
        };
        let strtab = sections
            .get(dynsym.link as usize)
            .filter(|s| s.sh_type == SHT_STRTAB);
        if strtab.is_none() {
            issues.note("dynamic symbol string table is missing");
        }

        let entry_size = if dynsym.entry_size != 0 {
            dynsym.entry_size as usize
        } else {
            match self.class {
                ElfClass::Elf32 => 16,
                ElfClass::Elf64 => 24,
            }
        };
        let count = ((dynsym.size as usize) / entry_size.max(1)).min(MAX_SYMBOLS);
        for index in 0..count {
            if index % options.yield_interval as usize == 0 {
                options.report(Stage::Symbols, 0, index as u64);
                if options.cancelled() {
                    issues.note("cancelled");
                    break;
                }
            }
            let at = dynsym.offset as usize + index * entry_size;
            let Some(symbol) = self.read_symbol(at, strtab) else {
                issues.note(format!("dynamic symbol {} is truncated", index));
                break;
            };
            symbols.push(symbol);
        }
        symbols
    }

    fn read_symbol(
        &self,
        at: usize,
        strtab: Option<&SectionHeader>,
    ) -> Option<DynamicSymbol> {
        let (name_off, value, size, info, other, shndx) = match self.class {
            ElfClass::Elf32 => (
                self.u32_at(at)?,
                self.u32_at(at + 4)? as u64,
                self.u32_at(at + 8)? as u64,
                self.window.get(at + 12).copied()?,
                self.window.get(at + 13).copied()?,
                self.u16_at(at + 14)?,
            ),
            ElfClass::Elf64 => (
                self.u32_at(at)?,
                self.u64_at(at + 8)?,
                self.u64_at(at + 16)?,
                self.window.get(at + 4).copied()?,
                self.window.get(at + 5).copied()?,
                self.u16_at(at + 6)?,
            ),
        };
        let name = strtab
            .and_then(|table| {
                let reader = Reader::new(self.window, 0);
                cstring_at(
                    &reader,
                    table.offset as usize + name_off as usize,
                    (table.size as usize).saturating_sub(name_off as usize).min(512),
                )
            })
            .unwrap_or_default();

        let bind = info >> 4;
        let kind = if shndx == 0 && !name.is_empty() {
            SymbolKind::Import
        } else if bind != 0 && !name.is_empty() {
            SymbolKind::Export
        } else {
            SymbolKind::Internal
        };
        Some(DynamicSymbol {
            name,
            value,
            size,
            kind,
            bind_label: bind_label(bind),
            type_label: symbol_type_label(info & 0xf),
            visibility_label: visibility_label(other & 0x3),
        })
    }
}

/// Seeds for the external disassembler: the entry point plus every export
/// landing in an executable region; out-of-region seeds are dropped and
/// counted per source group.
#[allow(clippy::too_many_arguments)]
fn collect_seeds(
    window: &[u8],
    class: ElfClass,
    header: &ElfHeader,
    program_headers: &[ProgramHeader],
    sections: &[SectionHeader],
    symbols: &[DynamicSymbol],
    options: &ProbeOptions<'_>,
    issues: &mut IssueLog,
) -> DisasmSeeds {
    let mut seeds = DisasmSeeds {
        bitness: match class {
            ElfClass::Elf32 => 32,
            ElfClass::Elf64 => 64,
        },
        ..DisasmSeeds::default()
    };

    let executable: Vec<(u64, u64)> = if sections.iter().any(|s| s.flags & SHF_EXECINSTR != 0) {
        sections
            .iter()
            .filter(|s| s.flags & SHF_EXECINSTR != 0)
            .map(|s| (s.addr, s.size))
            .collect()
    } else {
        program_headers
            .iter()
            .filter(|ph| ph.flags & PF_X != 0)
            .map(|ph| (ph.vaddr, ph.mem_size))
            .collect()
    };
    let in_exec =
        |addr: u64| executable.iter().any(|&(start, size)| addr >= start && addr < start + size);

    let mut dropped_entry = 0u32;
    if header.entry != 0 {
        if in_exec(header.entry) {
            seeds.entrypoints.push(header.entry);
        } else {
            dropped_entry += 1;
        }
    }
    let mut dropped_exports = 0u32;
    for symbol in symbols {
        if symbol.kind == SymbolKind::Export && symbol.type_label == "function" {
            if in_exec(symbol.value) {
                seeds.entrypoints.push(symbol.value);
            } else {
                dropped_exports += 1;
            }
        }
    }
    if dropped_entry > 0 {
        seeds.dropped.push(("entry point".to_string(), dropped_entry));
        issues.note("entry point lies outside every executable region");
    }
    if dropped_exports > 0 {
        seeds
            .dropped
            .push(("exported functions".to_string(), dropped_exports));
        issues.note(format!(
            "{} exported functions lie outside every executable region",
            dropped_exports
        ));
    }

    match options.disassembler {
        Some(disassembler) => {
            let disasm_sections = sections
                .iter()
                .filter(|s| s.flags & SHF_EXECINSTR != 0)
                .filter_map(|s| {
                    let start = s.offset as usize;
                    let end = start.checked_add(s.size as usize)?;
                    Some(DisasmSection {
                        vaddr_start: s.addr,
                        bytes: window.get(start..end)?.to_vec(),
                    })
                })
                .collect();
            disassembler.decode(seeds.bitness, disasm_sections, &seeds.entrypoints);
        }
        None => issues.note("no disassembler provided; code regions not decoded"),
    }
    seeds
}

fn os_abi_label(abi: u8) -> &'static str {
    match abi {
        0 => "System V",
        1 => "HP-UX",
        2 => "NetBSD",
        3 => "Linux",
        6 => "Solaris",
        9 => "FreeBSD",
        12 => "OpenBSD",
        _ => "unknown",
    }
}

fn type_label(elf_type: u16) -> &'static str {
    match elf_type {
        1 => "relocatable",
        2 => "executable",
        3 => "shared object",
        4 => "core",
        _ => "unknown",
    }
}

fn machine_label(machine: u16) -> &'static str {
    match machine {
        0x02 => "SPARC",
        0x03 => "x86",
        0x08 => "MIPS",
        0x14 => "PowerPC",
        0x15 => "PowerPC64",
        0x16 => "S390",
        0x28 => "ARM",
        0x32 => "IA-64",
        0x3E => "x86-64",
        0xB7 => "AArch64",
        0xF3 => "RISC-V",
        _ => "unknown",
    }
}

fn segment_label(p_type: u32) -> &'static str {
    match p_type {
        0 => "NULL",
        1 => "LOAD",
        2 => "DYNAMIC",
        3 => "INTERP",
        4 => "NOTE",
        6 => "PHDR",
        7 => "TLS",
        0x6474_E550 => "GNU_EH_FRAME",
        0x6474_E551 => "GNU_STACK",
        0x6474_E552 => "GNU_RELRO",
        _ => "unknown",
    }
}

fn bind_label(bind: u8) -> &'static str {
    match bind {
        0 => "local",
        1 => "global",
        2 => "weak",
        _ => "unknown",
    }
}

fn symbol_type_label(symbol_type: u8) -> &'static str {
    match symbol_type {
        0 => "none",
        1 => "object",
        2 => "function",
        3 => "section",
        4 => "file",
        6 => "TLS object",
        10 => "indirect function",
        _ => "unknown",
    }
}

fn visibility_label(visibility: u8) -> &'static str {
    match visibility {
        0 => "default",
        1 => "internal",
        2 => "hidden",
        3 => "protected",
        _ => "unknown",
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::probe::MemorySource;

    /// A minimal ELF64 LSB shared object for x86-64 with no section table.
    pub(crate) fn minimal_elf64_so() -> Vec<u8> {
        let mut data = vec![0u8; 64];
        data[..4].copy_from_slice(MAGIC);
        data[4] = 2; // 64-bit
        data[5] = 1; // LSB
        data[6] = 1;
        data[16..18].copy_from_slice(&3u16.to_le_bytes()); // ET_DYN
        data[18..20].copy_from_slice(&0x3Eu16.to_le_bytes()); // x86-64
        data[20..24].copy_from_slice(&1u32.to_le_bytes());
        data[24..32].copy_from_slice(&0x1040u64.to_le_bytes()); // entry
        data[52..54].copy_from_slice(&64u16.to_le_bytes()); // ehsize
        data
    }

    #[test]
    fn elf64_shared_object_identification() {
        let image =
            analyze(&MemorySource::new(minimal_elf64_so()), &ProbeOptions::default()).unwrap();
        assert_eq!(image.ident.class_byte, 2);
        assert_eq!(image.ident.data_byte, 1);
        assert_eq!(image.header.elf_type, 3);
        assert_eq!(image.header.type_label, "shared object");
        assert_eq!(image.header.machine, 0x3E);
        assert_eq!(image.header.machine_label, "x86-64");
    }

    #[test]
    fn non_elf_is_rejected() {
        let data = b"\x7fELG not an elf".to_vec();
        assert!(analyze(&MemorySource::new(data), &ProbeOptions::default()).is_none());
    }

    #[test]
    fn sections_and_dynamic_symbols_resolve() {
        // ELF64 with: shstrtab (idx 1), dynstr (idx 2), dynsym (idx 3),
        // .text (idx 4). One import (puts) and one export (hello).
        let mut data = minimal_elf64_so();

        let shstrtab = b"\0.shstrtab\0.dynstr\0.dynsym\0.text\0";
        let dynstr = b"\0puts\0hello\0";
        let shstrtab_off = data.len();
        data.extend_from_slice(shstrtab);
        let dynstr_off = data.len();
        data.extend_from_slice(dynstr);

        // Two 24-byte symbols.
        let dynsym_off = data.len();
        let mut symbol = Vec::new();
        symbol.extend_from_slice(&1u32.to_le_bytes()); // name "puts"
        symbol.push(0x12); // global func
        symbol.push(0);
        symbol.extend_from_slice(&0u16.to_le_bytes()); // undefined
        symbol.extend_from_slice(&0u64.to_le_bytes());
        symbol.extend_from_slice(&0u64.to_le_bytes());
        data.extend_from_slice(&symbol);
        let mut symbol = Vec::new();
        symbol.extend_from_slice(&6u32.to_le_bytes()); // name "hello"
        symbol.push(0x12); // global func
        symbol.push(0);
        symbol.extend_from_slice(&4u16.to_le_bytes()); // defined in .text
        symbol.extend_from_slice(&0x1040u64.to_le_bytes());
        symbol.extend_from_slice(&16u64.to_le_bytes());
        data.extend_from_slice(&symbol);

        let text_off = data.len();
        data.extend_from_slice(&[0x90; 32]);

        // Section table: null, .shstrtab, .dynstr, .dynsym, .text.
        let sh_offset = data.len();
        let mut push_section = |name: u32,
                                sh_type: u32,
                                flags: u64,
                                addr: u64,
                                offset: u64,
                                size: u64,
                                link: u32,
                                entsize: u64,
                                data: &mut Vec<u8>| {
            data.extend_from_slice(&name.to_le_bytes());
            data.extend_from_slice(&sh_type.to_le_bytes());
            data.extend_from_slice(&flags.to_le_bytes());
            data.extend_from_slice(&addr.to_le_bytes());
            data.extend_from_slice(&offset.to_le_bytes());
            data.extend_from_slice(&size.to_le_bytes());
            data.extend_from_slice(&link.to_le_bytes());
            data.extend_from_slice(&0u32.to_le_bytes());
            data.extend_from_slice(&0u64.to_le_bytes());
            data.extend_from_slice(&entsize.to_le_bytes());
        };
        push_section(0, 0, 0, 0, 0, 0, 0, 0, &mut data);
        push_section(1, SHT_STRTAB, 0, 0, shstrtab_off as u64, shstrtab.len() as u64, 0, 0, &mut data);
        push_section(11, SHT_STRTAB, 0, 0, dynstr_off as u64, dynstr.len() as u64, 0, 0, &mut data);
        push_section(19, SHT_DYNSYM, 0, 0, dynsym_off as u64, 48, 2, 24, &mut data);
        push_section(27, 1, SHF_EXECINSTR | 0x2, 0x1040, text_off as u64, 32, 0, 0, &mut data);

        data[40..48].copy_from_slice(&(sh_offset as u64).to_le_bytes()); // shoff
        data[58..60].copy_from_slice(&64u16.to_le_bytes()); // shentsize
        data[60..62].copy_from_slice(&5u16.to_le_bytes()); // shnum
        data[62..64].copy_from_slice(&1u16.to_le_bytes()); // shstrndx

        let image = analyze(&MemorySource::new(data), &ProbeOptions::default()).unwrap();
        assert_eq!(image.sections.len(), 5);
        assert_eq!(image.sections[4].name, ".text");
        assert_eq!(image.dynamic_symbols.len(), 2);

        let puts = &image.dynamic_symbols[0];
        assert_eq!(puts.name, "puts");
        assert_eq!(puts.kind, SymbolKind::Import);

        let hello = &image.dynamic_symbols[1];
        assert_eq!(hello.name, "hello");
        assert_eq!(hello.kind, SymbolKind::Export);
        assert_eq!(hello.type_label, "function");

        // Entry 0x1040 and the export both land in .text.
        assert!(image.seeds.entrypoints.contains(&0x1040));
        assert!(image.seeds.dropped.is_empty());
    }
}
