//! Data-directory walkers: imports, exports, relocations, debug, TLS and
//! certificates.

use std::collections::HashMap;

use super::*;

/// Thunk-walk caps per descriptor.
const MAX_THUNKS_PE32: usize = 32 * 1024;
const MAX_THUNKS_PE32_PLUS: usize = 16 * 1024;
const MAX_IMPORT_DESCRIPTORS: usize = 4096;
const MAX_TLS_CALLBACKS: usize = 1024;
const MAX_CERTIFICATES: usize = 8;
const MAX_RELOCATION_BLOCKS: usize = 1 << 16;

/// A named or by-ordinal import.
#[derive(Debug)]
pub enum ImportedSymbol {
    Named { hint: u16, name: String },
    Ordinal(u16),
}

#[derive(Debug)]
pub struct ImportedModule {
    pub dll_name: String,
    pub symbols: Vec<ImportedSymbol>,
    /// Delay-import descriptors may store VAs instead of RVAs.
    pub via_va: bool,
}

/// # Import directory
///
/// An array of `IMAGE_IMPORT_DESCRIPTOR` (20 bytes) terminated by an
/// all-zero record:
///
/// | Offset | Size | Field |
/// | ------ | ---- | ----- |
/// | 0      | 4    | OriginalFirstThunk (ILT RVA) |
/// | 4      | 4    | TimeDateStamp |
/// | 8      | 4    | ForwarderChain |
/// | 12     | 4    | Name RVA |
/// | 16     | 4    | FirstThunk (IAT RVA) |
///
/// PE32 thunks are 32 bits, PE32+ thunks 64; the top bit marks import by
/// ordinal, otherwise the low 31 bits are a hint/name RVA.
pub(super) fn read_imports(
    context: &PeContext<'_>,
    dir: DataDirectory,
    options: &ProbeOptions<'_>,
    issues: &mut IssueLog,
) -> Vec<ImportedModule> {
    let mut modules = Vec::new();
    for index in 0..MAX_IMPORT_DESCRIPTORS {
        if options.cancelled() {
            issues.note("cancelled");
            break;
        }
        let rva = dir.rva.wrapping_add((index * 20) as u32);
        let Some(raw) = context.bytes_at_rva(rva, 20) else {
            issues.note(format!("import descriptor {} does not map to the file", index));
            break;
        };
        let ilt_rva = u32::from_le_bytes(raw[0..4].try_into().unwrap());
        let name_rva = u32::from_le_bytes(raw[12..16].try_into().unwrap());
        let iat_rva = u32::from_le_bytes(raw[16..20].try_into().unwrap());
        if ilt_rva == 0 && name_rva == 0 && iat_rva == 0 {
            break;
        }
        let dll_name = context.cstring_at_rva(name_rva).unwrap_or_else(|| {
            issues.note(format!("import descriptor {} has an unmapped name rva", index));
            String::new()
        });
        let thunks_rva = if ilt_rva != 0 { ilt_rva } else { iat_rva };
        let symbols = walk_thunks(context, thunks_rva, issues);
        modules.push(ImportedModule { dll_name, symbols, via_va: false });
    }
    modules
}

fn walk_thunks(
    context: &PeContext<'_>,
    thunks_rva: u32,
    issues: &mut IssueLog,
) -> Vec<ImportedSymbol> {
    let mut symbols = Vec::new();
    let (thunk_size, cap) = if context.is_plus {
        (8usize, MAX_THUNKS_PE32_PLUS)
    } else {
        (4usize, MAX_THUNKS_PE32)
    };
    for index in 0..cap {
        let rva = thunks_rva.wrapping_add((index * thunk_size) as u32);
        let Some(raw) = context.bytes_at_rva(rva, thunk_size) else {
            issues.note(format!("import thunk table at 0x{:08x} does not map", rva));
            break;
        };
        let value = if context.is_plus {
            u64::from_le_bytes(raw.try_into().unwrap())
        } else {
            u32::from_le_bytes(raw.try_into().unwrap()) as u64
        };
        if value == 0 {
            break;
        }
        let by_ordinal = if context.is_plus {
            value & (1 << 63) != 0
        } else {
            value & (1 << 31) != 0
        };
        if by_ordinal {
            symbols.push(ImportedSymbol::Ordinal(value as u16));
        } else {
            let hint_name_rva = value as u32 & 0x7fff_ffff;
            match context.bytes_at_rva(hint_name_rva, 2) {
                Some(hint_raw) => {
                    let hint = u16::from_le_bytes(hint_raw.try_into().unwrap());
                    let name = context
                        .cstring_at_rva(hint_name_rva.wrapping_add(2))
                        .unwrap_or_default();
                    symbols.push(ImportedSymbol::Named { hint, name });
                }
                None => {
                    issues.note(format!(
                        "hint/name entry at rva 0x{:08x} does not map",
                        hint_name_rva
                    ));
                }
            }
        }
    }
    symbols
}

/// # Delay-load import directory
///
/// `IMAGE_DELAYLOAD_DESCRIPTOR` (32 bytes): attributes, name, module
/// handle, IAT, INT, bound IAT, unload IAT, timestamp. Attribute bit 0 set
/// means the table fields are RVAs; clear means VAs that must be rebased.
pub(super) fn read_delay_imports(
    context: &PeContext<'_>,
    dir: DataDirectory,
    options: &ProbeOptions<'_>,
    issues: &mut IssueLog,
) -> Vec<ImportedModule> {
    let mut modules = Vec::new();
    for index in 0..MAX_IMPORT_DESCRIPTORS {
        if options.cancelled() {
            issues.note("cancelled");
            break;
        }
        let rva = dir.rva.wrapping_add((index * 32) as u32);
        let Some(raw) = context.bytes_at_rva(rva, 32) else {
            issues.note(format!(
                "delay import descriptor {} does not map to the file",
                index
            ));
            break;
        };
        let attributes = u32::from_le_bytes(raw[0..4].try_into().unwrap());
        let name_field = u32::from_le_bytes(raw[4..8].try_into().unwrap());
        let int_field = u32::from_le_bytes(raw[16..20].try_into().unwrap());
        if name_field == 0 && int_field == 0 {
            break;
        }
        let via_va = attributes & 0x1 == 0;
        let to_rva = |field: u32| -> u32 {
            if via_va {
                (field as u64).saturating_sub(context.image_base) as u32
            } else {
                field
            }
        };
        let dll_name = context.cstring_at_rva(to_rva(name_field)).unwrap_or_else(|| {
            issues.note(format!(
                "delay import descriptor {} has an unmapped name",
                index
            ));
            String::new()
        });
        let symbols = walk_thunks(context, to_rva(int_field), issues);
        modules.push(ImportedModule { dll_name, symbols, via_va });
    }
    modules
}

/// `IMAGE_BOUND_IMPORT_DESCRIPTOR`: timestamp, name offset (relative to
/// the directory start), forwarder-ref count; zero record terminates.
#[derive(Debug)]
pub struct BoundImport {
    pub module: String,
    pub time_date_stamp: u32,
    pub forwarder_refs: u16,
}

pub(super) fn read_bound_imports(
    context: &PeContext<'_>,
    dir: DataDirectory,
    issues: &mut IssueLog,
) -> Vec<BoundImport> {
    let mut imports = Vec::new();
    let Some(base_offset) = context.rva_to_offset(dir.rva) else {
        issues.note("bound import directory does not map to the file");
        return imports;
    };
    let mut at = base_offset;
    for _ in 0..MAX_IMPORT_DESCRIPTORS {
        let Some(raw) = context.window.get(at..at + 8) else { break };
        let time_date_stamp = u32::from_le_bytes(raw[0..4].try_into().unwrap());
        let name_offset = u16::from_le_bytes(raw[4..6].try_into().unwrap());
        let forwarder_refs = u16::from_le_bytes(raw[6..8].try_into().unwrap());
        if time_date_stamp == 0 && name_offset == 0 {
            break;
        }
        let name_at = base_offset + name_offset as usize;
        let module = context
            .window
            .get(name_at..)
            .map(|bytes| {
                let end = bytes.iter().position(|&b| b == 0).unwrap_or(0);
                ascii_field(&bytes[..end], end)
            })
            .unwrap_or_default();
        imports.push(BoundImport { module, time_date_stamp, forwarder_refs });
        // Each descriptor is followed by its forwarder refs (8 bytes each).
        at += 8 + forwarder_refs as usize * 8;
    }
    imports
}

#[derive(Debug)]
pub struct ExportedSymbol {
    pub ordinal: u32,
    pub rva: u32,
    pub name: Option<String>,
    /// Set when the address lands inside the export directory itself: the
    /// entry forwards to `DLL.Symbol` in another module.
    pub forwarder: Option<String>,
}

#[derive(Debug)]
pub struct ExportDirectory {
    pub dll_name: String,
    pub time_date_stamp: u32,
    pub ordinal_base: u32,
    pub number_of_functions: u32,
    pub number_of_names: u32,
    pub entries: Vec<ExportedSymbol>,
}

/// # Export directory
///
/// `IMAGE_EXPORT_DIRECTORY` (40 bytes):
///
/// | Offset | Size | Field |
/// | ------ | ---- | ----- |
/// | 4      | 4    | TimeDateStamp |
/// | 12     | 4    | Name RVA |
/// | 16     | 4    | OrdinalBase |
/// | 20     | 4    | NumberOfFunctions |
/// | 24     | 4    | NumberOfNames |
/// | 28     | 4    | AddressOfFunctions |
/// | 32     | 4    | AddressOfNames |
/// | 36     | 4    | AddressOfNameOrdinals |
pub(super) fn read_exports(
    context: &PeContext<'_>,
    dir: DataDirectory,
    options: &ProbeOptions<'_>,
    issues: &mut IssueLog,
) -> Option<ExportDirectory> {
    let raw = context.bytes_at_rva(dir.rva, 40).or_else(|| {
        issues.note("export directory does not map to the file");
        None
    })?;
    let time_date_stamp = u32::from_le_bytes(raw[4..8].try_into().unwrap());
    let name_rva = u32::from_le_bytes(raw[12..16].try_into().unwrap());
    let ordinal_base = u32::from_le_bytes(raw[16..20].try_into().unwrap());
    let number_of_functions = u32::from_le_bytes(raw[20..24].try_into().unwrap());
    let number_of_names = u32::from_le_bytes(raw[24..28].try_into().unwrap());
    let functions_rva = u32::from_le_bytes(raw[28..32].try_into().unwrap());
    let names_rva = u32::from_le_bytes(raw[32..36].try_into().unwrap());
    let ordinals_rva = u32::from_le_bytes(raw[36..40].try_into().unwrap());

    let function_count = number_of_functions.min(0x1_0000) as usize;
    if function_count as u32 != number_of_functions {
        issues.note(format!(
            "export directory declares {} functions; capped",
            number_of_functions
        ));
    }

    // Name table: parallel arrays of name RVAs and function ordinals.
    let mut names_by_index: HashMap<u32, String> = HashMap::new();
    let name_count = number_of_names.min(0x1_0000);
    for index in 0..name_count {
        if options.cancelled() {
            issues.note("cancelled");
            break;
        }
        let name_rva = context
            .bytes_at_rva(names_rva.wrapping_add(index * 4), 4)
            .map(|raw| u32::from_le_bytes(raw.try_into().unwrap()));
        let ordinal_index = context
            .bytes_at_rva(ordinals_rva.wrapping_add(index * 2), 2)
            .map(|raw| u16::from_le_bytes(raw.try_into().unwrap()));
        match (name_rva, ordinal_index) {
            (Some(name_rva), Some(ordinal_index)) => {
                if let Some(name) = context.cstring_at_rva(name_rva) {
                    names_by_index.insert(ordinal_index as u32, name);
                }
            }
            _ => {
                issues.note("export name tables do not map to the file");
                break;
            }
        }
    }

    let mut entries = Vec::with_capacity(function_count);
    for index in 0..function_count as u32 {
        let Some(raw) = context.bytes_at_rva(functions_rva.wrapping_add(index * 4), 4) else {
            issues.note("export address table does not map to the file");
            break;
        };
        let rva = u32::from_le_bytes(raw.try_into().unwrap());
        if rva == 0 {
            continue;
        }
        // An address inside the export directory is a forwarder string.
        let forwarder = if rva >= dir.rva && rva < dir.rva.wrapping_add(dir.size) {
            context.cstring_at_rva(rva)
        } else {
            None
        };
        entries.push(ExportedSymbol {
            ordinal: ordinal_base + index,
            rva,
            name: names_by_index.get(&index).cloned(),
            forwarder,
        });
    }

    Some(ExportDirectory {
        dll_name: context.cstring_at_rva(name_rva).unwrap_or_default(),
        time_date_stamp,
        ordinal_base,
        number_of_functions,
        number_of_names,
        entries,
    })
}

/// Per-type relocation counts over all `IMAGE_BASE_RELOCATION` blocks.
#[derive(Debug, Default)]
pub struct RelocationSummary {
    pub block_count: u32,
    pub entry_count: u64,
    pub counts_by_type: HashMap<u8, u64>,
}

pub(super) fn read_base_relocations(
    context: &PeContext<'_>,
    dir: DataDirectory,
    issues: &mut IssueLog,
) -> RelocationSummary {
    let mut summary = RelocationSummary::default();
    let mut consumed = 0u32;
    for _ in 0..MAX_RELOCATION_BLOCKS {
        if consumed + 8 > dir.size {
            break;
        }
        let rva = dir.rva.wrapping_add(consumed);
        let Some(raw) = context.bytes_at_rva(rva, 8) else {
            issues.note(format!(
                "relocation block at rva 0x{:08x} does not map",
                rva
            ));
            break;
        };
        let block_size = u32::from_le_bytes(raw[4..8].try_into().unwrap());
        if block_size < 8 {
            issues.note(format!(
                "relocation block at rva 0x{:08x} declares size {}",
                rva, block_size
            ));
            break;
        }
        let entry_bytes = (block_size - 8).min(dir.size - consumed - 8);
        if let Some(entries) = context.bytes_at_rva(rva.wrapping_add(8), entry_bytes as usize) {
            for pair in entries.chunks_exact(2) {
                let value = u16::from_le_bytes([pair[0], pair[1]]);
                let reloc_type = (value >> 12) as u8;
                summary.entry_count += 1;
                *summary.counts_by_type.entry(reloc_type).or_insert(0) += 1;
            }
        }
        summary.block_count += 1;
        consumed += block_size;
    }
    summary
}

#[derive(Debug)]
pub struct DebugEntry {
    pub debug_type: u32,
    pub type_label: &'static str,
    pub time_date_stamp: u32,
    pub size_of_data: u32,
    pub pointer_to_raw_data: u32,
    /// PDB path from an RSDS (CodeView 7) record.
    pub pdb_path: Option<String>,
    pub pdb_guid: Option<String>,
    pub pdb_age: Option<u32>,
}

/// `IMAGE_DEBUG_DIRECTORY` entries are 28 bytes; type 2 (CodeView) points
/// at an `RSDS` record holding the PDB GUID, age and path.
pub(super) fn read_debug_directory(
    context: &PeContext<'_>,
    dir: DataDirectory,
    issues: &mut IssueLog,
) -> Vec<DebugEntry> {
    let mut entries = Vec::new();
    let count = (dir.size / 28).min(64);
    for index in 0..count {
        let rva = dir.rva.wrapping_add(index * 28);
        let Some(raw) = context.bytes_at_rva(rva, 28) else {
            issues.note(format!("debug entry {} does not map to the file", index));
            break;
        };
        let time_date_stamp = u32::from_le_bytes(raw[4..8].try_into().unwrap());
        let debug_type = u32::from_le_bytes(raw[12..16].try_into().unwrap());
        let size_of_data = u32::from_le_bytes(raw[16..20].try_into().unwrap());
        let pointer_to_raw_data = u32::from_le_bytes(raw[24..28].try_into().unwrap());

        let mut entry = DebugEntry {
            debug_type,
            type_label: debug_type_label(debug_type),
            time_date_stamp,
            size_of_data,
            pointer_to_raw_data,
            pdb_path: None,
            pdb_guid: None,
            pdb_age: None,
        };
        if debug_type == 2 && size_of_data >= 24 {
            let at = pointer_to_raw_data as usize;
            if let Some(cv) = context.window.get(at..at + size_of_data.min(1024) as usize) {
                if cv.starts_with(b"RSDS") && cv.len() >= 24 {
                    entry.pdb_guid = Some(crate::formats::lnk::guid_string(&cv[4..20]));
                    entry.pdb_age =
                        Some(u32::from_le_bytes(cv[20..24].try_into().unwrap()));
                    let path = &cv[24..];
                    let end = path.iter().position(|&b| b == 0).unwrap_or(path.len());
                    entry.pdb_path = Some(ascii_field(&path[..end], end));
                }
            }
        }
        entries.push(entry);
    }
    entries
}

fn debug_type_label(debug_type: u32) -> &'static str {
    match debug_type {
        1 => "COFF",
        2 => "CodeView",
        3 => "FPO",
        4 => "misc",
        9 => "Borland",
        13 => "POGO",
        14 => "ILTCG",
        16 => "repro",
        20 => "extended dll characteristics",
        _ => "unknown",
    }
}

#[derive(Debug)]
pub struct TlsDirectory {
    pub raw_data_start_va: u64,
    pub raw_data_end_va: u64,
    pub address_of_index: u64,
    pub address_of_callbacks: u64,
    /// Callback VAs, walked through the image base until a NUL entry.
    pub callbacks: Vec<u64>,
}

/// TLS directory fields are absolute VAs sized by the image class; the
/// callback array is a pointer walk capped at [`MAX_TLS_CALLBACKS`].
pub(super) fn read_tls(
    context: &PeContext<'_>,
    dir: DataDirectory,
    issues: &mut IssueLog,
) -> Option<TlsDirectory> {
    let pointer = if context.is_plus { 8usize } else { 4 };
    let raw = context.bytes_at_rva(dir.rva, pointer * 4).or_else(|| {
        issues.note("tls directory does not map to the file");
        None
    })?;
    let read_pointer = |index: usize| -> u64 {
        let at = index * pointer;
        if context.is_plus {
            u64::from_le_bytes(raw[at..at + 8].try_into().unwrap())
        } else {
            u32::from_le_bytes(raw[at..at + 4].try_into().unwrap()) as u64
        }
    };
    let mut tls = TlsDirectory {
        raw_data_start_va: read_pointer(0),
        raw_data_end_va: read_pointer(1),
        address_of_index: read_pointer(2),
        address_of_callbacks: read_pointer(3),
        callbacks: Vec::new(),
    };

    if tls.address_of_callbacks != 0 {
        let Some(mut at) = context.va_to_offset(tls.address_of_callbacks) else {
            issues.note(format!(
                "tls callback table va 0x{:08x} does not map",
                tls.address_of_callbacks
            ));
            return Some(tls);
        };
        for _ in 0..MAX_TLS_CALLBACKS {
            let Some(raw) = context.window.get(at..at + pointer) else { break };
            let callback = if context.is_plus {
                u64::from_le_bytes(raw.try_into().unwrap())
            } else {
                u32::from_le_bytes(raw.try_into().unwrap()) as u64
            };
            if callback == 0 {
                break;
            }
            tls.callbacks.push(callback);
            at += pointer;
        }
    }
    Some(tls)
}


/// `.pdata` function table: `RUNTIME_FUNCTION` entries (begin RVA,
/// end RVA, unwind-info RVA on x64). Begin addresses seed the
/// disassembler.
#[derive(Debug, Default)]
pub struct ExceptionSummary {
    pub entry_count: u32,
    pub begin_rvas: Vec<u32>,
}

const MAX_EXCEPTION_SEEDS: usize = 16 * 1024;

pub(super) fn read_exception_directory(
    context: &PeContext<'_>,
    dir: DataDirectory,
    issues: &mut IssueLog,
) -> ExceptionSummary {
    let mut summary = ExceptionSummary::default();
    if !context.is_plus {
        // 32-bit x86 has no .pdata unwind table.
        return summary;
    }
    let count = (dir.size / 12) as usize;
    summary.entry_count = count as u32;
    for index in 0..count.min(MAX_EXCEPTION_SEEDS) {
        let rva = dir.rva.wrapping_add((index * 12) as u32);
        let Some(raw) = context.bytes_at_rva(rva, 12) else {
            issues.note(format!("runtime function {} does not map to the file", index));
            break;
        };
        let begin = u32::from_le_bytes(raw[0..4].try_into().unwrap());
        if begin != 0 {
            summary.begin_rvas.push(begin);
        }
    }
    if count > MAX_EXCEPTION_SEEDS {
        issues.note(format!(
            "exception directory holds {} entries; seed collection capped",
            count
        ));
    }
    summary
}

/// # Load configuration directory
///
/// Versioned structure; only fields inside the declared `Size` are read.
/// Of interest here: the SafeSEH handler table (PE32) and the CF-Guard
/// function table, both absolute VAs pointing at RVA arrays.
///
/// | Offset (32/64) | Field |
/// | -------------- | ----- |
/// | 0x3C / 0x58    | SecurityCookie |
/// | 0x40 / 0x60    | SEHandlerTable |
/// | 0x44 / 0x68    | SEHandlerCount |
/// | 0x50 / 0x80    | GuardCFFunctionTable |
/// | 0x54 / 0x88    | GuardCFFunctionCount |
/// | 0x58 / 0x90    | GuardFlags |
#[derive(Debug, Default)]
pub struct LoadConfig {
    pub size: u32,
    pub security_cookie: u64,
    pub guard_flags: u32,
    /// SafeSEH handler RVAs (PE32 only).
    pub se_handlers: Vec<u32>,
    /// CF-Guard function RVAs.
    pub guard_functions: Vec<u32>,
}

const MAX_GUARD_FUNCTIONS: u64 = 64 * 1024;

pub(super) fn read_load_config(
    context: &PeContext<'_>,
    dir: DataDirectory,
    issues: &mut IssueLog,
) -> Option<LoadConfig> {
    let raw = context.bytes_at_rva(dir.rva, dir.size.min(0x100) as usize).or_else(|| {
        issues.note("load config directory does not map to the file");
        None
    })?;
    let field_u32 = |at: usize| -> Option<u32> {
        raw.get(at..at + 4).map(|f| u32::from_le_bytes(f.try_into().unwrap()))
    };
    let field_ptr = |at: usize| -> Option<u64> {
        if context.is_plus {
            raw.get(at..at + 8).map(|f| u64::from_le_bytes(f.try_into().unwrap()))
        } else {
            field_u32(at).map(u64::from)
        }
    };
    let size = field_u32(0)?;
    let mut config = LoadConfig { size, ..LoadConfig::default() };

    let (cookie_at, seh_table_at, seh_count_at, guard_table_at, guard_count_at, flags_at) =
        if context.is_plus {
            (0x58, 0x60, 0x68, 0x80, 0x88, 0x90)
        } else {
            (0x3c, 0x40, 0x44, 0x50, 0x54, 0x58)
        };
    let within = |at: usize| (at as u32) < size;

    if within(cookie_at) {
        config.security_cookie = field_ptr(cookie_at).unwrap_or(0);
    }
    if within(flags_at) {
        config.guard_flags = field_u32(flags_at).unwrap_or(0);
    }

    // SafeSEH: a VA to a table of handler RVAs, PE32 only.
    if !context.is_plus && within(seh_count_at) {
        let table_va = field_ptr(seh_table_at).unwrap_or(0);
        let count = field_ptr(seh_count_at).unwrap_or(0).min(MAX_GUARD_FUNCTIONS);
        if table_va != 0 && count != 0 {
            match context.va_to_offset(table_va) {
                Some(at) => {
                    for index in 0..count as usize {
                        let Some(entry) = context.window.get(at + index * 4..at + index * 4 + 4)
                        else {
                            break;
                        };
                        config
                            .se_handlers
                            .push(u32::from_le_bytes(entry.try_into().unwrap()));
                    }
                }
                None => issues.note(format!(
                    "safeseh handler table va 0x{:08x} does not map",
                    table_va
                )),
            }
        }
    }

    // CF-Guard: each entry is an RVA plus `(GuardFlags >> 28)` extra bytes.
    if within(guard_count_at) {
        let table_va = field_ptr(guard_table_at).unwrap_or(0);
        let count = field_ptr(guard_count_at).unwrap_or(0).min(MAX_GUARD_FUNCTIONS);
        if table_va != 0 && count != 0 {
            let stride = 4 + ((config.guard_flags >> 28) & 0xf) as usize;
            match context.va_to_offset(table_va) {
                Some(at) => {
                    for index in 0..count as usize {
                        let entry_at = at + index * stride;
                        let Some(entry) = context.window.get(entry_at..entry_at + 4) else {
                            break;
                        };
                        config
                            .guard_functions
                            .push(u32::from_le_bytes(entry.try_into().unwrap()));
                    }
                }
                None => issues.note(format!(
                    "cf-guard function table va 0x{:08x} does not map",
                    table_va
                )),
            }
        }
    }
    Some(config)
}

#[derive(Debug)]
pub struct Certificate {
    pub length: u32,
    pub revision: u16,
    pub certificate_type: u16,
    pub type_label: &'static str,
}

/// # Security directory
///
/// `WIN_CERTIFICATE` blocks at a *file offset* (the directory's RVA field
/// is not virtual): `[length u32 | revision u16 | type u16 | data]`, each
/// padded to 8 bytes. At most [`MAX_CERTIFICATES`] blocks are read.
pub(super) fn read_certificates(
    context: &PeContext<'_>,
    dir: DataDirectory,
    issues: &mut IssueLog,
) -> Vec<Certificate> {
    let mut certificates = Vec::new();
    let mut at = dir.rva as usize;
    let end = (dir.rva as u64 + dir.size as u64).min(context.window.len() as u64) as usize;
    if dir.rva as u64 + dir.size as u64 > context.window.len() as u64 {
        issues.note("security directory extends past end of data");
    }
    for _ in 0..MAX_CERTIFICATES {
        if at + 8 > end {
            break;
        }
        let raw = &context.window[at..at + 8];
        let length = u32::from_le_bytes(raw[0..4].try_into().unwrap());
        let revision = u16::from_le_bytes(raw[4..6].try_into().unwrap());
        let certificate_type = u16::from_le_bytes(raw[6..8].try_into().unwrap());
        if length < 8 {
            issues.note(format!(
                "certificate at 0x{:08x} declares length {}",
                at, length
            ));
            break;
        }
        certificates.push(Certificate {
            length,
            revision,
            certificate_type,
            type_label: match certificate_type {
                1 => "X.509",
                2 => "PKCS#7 signed data",
                4 => "PKCS#1 signature",
                _ => "unknown",
            },
        });
        // Blocks are aligned to 8 bytes.
        at += ((length as usize) + 7) & !7;
    }
    certificates
}

#[cfg(test)]
mod tests {
    use super::super::tests::build_pe;
    use super::super::{analyze, DirectoryIndex};
    use super::*;
    use crate::probe::{MemorySource, ProbeOptions};

    /// Extends the minimal PE32 with an import directory describing
    /// `KERNEL32.dll!ExitProcess` plus one ordinal import.
    fn pe_with_imports() -> Vec<u8> {
        let mut data = build_pe(false, 0x0102);

        // Lay structures into the .text raw data (file 0x400..0x600,
        // rva 0x1000..0x1200).
        let file_base = 0x400usize;
        let rva_base = 0x1000u32;
        let place = |data: &mut Vec<u8>, at: usize, bytes: &[u8]| {
            data[file_base + at..file_base + at + bytes.len()].copy_from_slice(bytes);
        };

        // Hint/name at +0x80, dll name at +0xA0, ILT at +0xC0.
        place(&mut data, 0x80, &1u16.to_le_bytes());
        place(&mut data, 0x82, b"ExitProcess\0");
        place(&mut data, 0xA0, b"KERNEL32.dll\0");
        place(&mut data, 0xC0, &(rva_base + 0x80).to_le_bytes());
        place(&mut data, 0xC4, &0x8000_0005u32.to_le_bytes());
        place(&mut data, 0xC8, &0u32.to_le_bytes());

        // Import descriptor at +0x00, zero terminator at +0x14.
        place(&mut data, 0x00, &(rva_base + 0xC0).to_le_bytes()); // ILT
        place(&mut data, 0x0C, &(rva_base + 0xA0).to_le_bytes()); // name
        place(&mut data, 0x10, &(rva_base + 0xC0).to_le_bytes()); // IAT

        // Point the import data directory at it (directory 1).
        let opt_at = 0x40 + 4 + 20;
        let dirs_at = opt_at + 96 + DirectoryIndex::Import as usize * 8;
        data[dirs_at..dirs_at + 4].copy_from_slice(&rva_base.to_le_bytes());
        data[dirs_at + 4..dirs_at + 8].copy_from_slice(&40u32.to_le_bytes());
        data
    }

    #[test]
    fn imports_named_and_ordinal() {
        let image =
            analyze(&MemorySource::new(pe_with_imports()), &ProbeOptions::default()).unwrap();
        assert_eq!(image.imports.len(), 1);
        let module = &image.imports[0];
        assert_eq!(module.dll_name, "KERNEL32.dll");
        assert_eq!(module.symbols.len(), 2);
        match &module.symbols[0] {
            ImportedSymbol::Named { hint, name } => {
                assert_eq!(*hint, 1);
                assert_eq!(name, "ExitProcess");
            }
            other => panic!("expected named import, got {:?}", other),
        }
        match &module.symbols[1] {
            ImportedSymbol::Ordinal(ordinal) => assert_eq!(*ordinal, 5),
            other => panic!("expected ordinal import, got {:?}", other),
        }
        assert!(image.issues.iter().all(|issue| !issue.contains("import")));
    }

    #[test]
    fn relocation_blocks_are_tallied() {
        let mut data = build_pe(false, 0x0102);
        let file_base = 0x400usize;
        // One block: page rva 0x1000, size 12 (two entries).
        data[file_base..file_base + 4].copy_from_slice(&0x1000u32.to_le_bytes());
        data[file_base + 4..file_base + 8].copy_from_slice(&12u32.to_le_bytes());
        data[file_base + 8..file_base + 10]
            .copy_from_slice(&((3u16 << 12) | 0x10).to_le_bytes());
        data[file_base + 10..file_base + 12]
            .copy_from_slice(&((10u16 << 12) | 0x20).to_le_bytes());
        let opt_at = 0x40 + 4 + 20;
        let dirs_at = opt_at + 96 + DirectoryIndex::BaseRelocation as usize * 8;
        data[dirs_at..dirs_at + 4].copy_from_slice(&0x1000u32.to_le_bytes());
        data[dirs_at + 4..dirs_at + 8].copy_from_slice(&12u32.to_le_bytes());

        let image = analyze(&MemorySource::new(data), &ProbeOptions::default()).unwrap();
        let relocations = image.base_relocations.unwrap();
        assert_eq!(relocations.block_count, 1);
        assert_eq!(relocations.entry_count, 2);
        assert_eq!(relocations.counts_by_type.get(&3), Some(&1));
        assert_eq!(relocations.counts_by_type.get(&10), Some(&1));
    }

    #[test]
    fn exception_directory_seeds_unwind_begins() {
        let mut data = build_pe(true, 0x2002);
        let file_base = 0x400usize;
        // Two RUNTIME_FUNCTION entries inside .text.
        for (index, begin) in [0x1010u32, 0x1100u32].iter().enumerate() {
            let at = file_base + index * 12;
            data[at..at + 4].copy_from_slice(&begin.to_le_bytes());
            data[at + 4..at + 8].copy_from_slice(&(begin + 0x40).to_le_bytes());
            data[at + 8..at + 12].copy_from_slice(&0x1180u32.to_le_bytes());
        }
        let opt_at = 0x40 + 4 + 20;
        let dirs_at = opt_at + 112 + DirectoryIndex::Exception as usize * 8;
        data[dirs_at..dirs_at + 4].copy_from_slice(&0x1000u32.to_le_bytes());
        data[dirs_at + 4..dirs_at + 8].copy_from_slice(&24u32.to_le_bytes());

        let image = analyze(&MemorySource::new(data), &ProbeOptions::default()).unwrap();
        let exception = image.exception.as_ref().unwrap();
        assert_eq!(exception.entry_count, 2);
        assert_eq!(exception.begin_rvas, vec![0x1010, 0x1100]);
        // Both land in .text, plus the entry point itself.
        assert!(image.seeds.entrypoints.contains(&(0x1_8000_0000 + 0x1010)));
        assert!(image.seeds.dropped.is_empty());
    }

    #[test]
    fn certificates_respect_alignment_and_cap() {
        let mut data = build_pe(false, 0x0102);
        let cert_at = data.len();
        // Two 10-byte certificates, 8-byte aligned stride of 16.
        for _ in 0..2 {
            let start = data.len();
            data.extend_from_slice(&10u32.to_le_bytes());
            data.extend_from_slice(&0x0200u16.to_le_bytes());
            data.extend_from_slice(&2u16.to_le_bytes());
            data.extend_from_slice(&[0xAA, 0xBB]);
            data.resize(start + 16, 0);
        }
        let opt_at = 0x40 + 4 + 20;
        let dirs_at = opt_at + 96 + DirectoryIndex::Security as usize * 8;
        data[dirs_at..dirs_at + 4].copy_from_slice(&(cert_at as u32).to_le_bytes());
        data[dirs_at + 4..dirs_at + 8].copy_from_slice(&32u32.to_le_bytes());

        let image = analyze(&MemorySource::new(data), &ProbeOptions::default()).unwrap();
        assert_eq!(image.certificates.len(), 2);
        assert_eq!(image.certificates[0].type_label, "PKCS#7 signed data");
    }
}
