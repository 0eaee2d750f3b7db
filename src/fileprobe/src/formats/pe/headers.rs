//! Fixed PE/COFF header structures.

use super::*;

/// # COFF file header
///
/// Immediately after the `PE\0\0` signature
/// (<https://learn.microsoft.com/windows/win32/debug/pe-format#coff-file-header-object-and-image>):
///
/// | Offset | Size | Field                   | Description |
/// | ------ | ---- | ----------------------- | ----------- |
/// | 0x00   | 2    | Machine                 | Target architecture (`0x14c` x86, `0x8664` x86-64). |
/// | 0x02   | 2    | NumberOfSections        | Size of the section table. |
/// | 0x04   | 4    | TimeDateStamp           | Seconds since `January 1st 1970 00:00:00`. |
/// | 0x08   | 4    | PointerToSymbolTable    | COFF symbol table; 0 for images. |
/// | 0x0c   | 4    | NumberOfSymbols         | 0 for images. |
/// | 0x10   | 2    | SizeOfOptionalHeader    | Size of the optional header that follows. |
/// | 0x12   | 2    | Characteristics         | Flags, see [`FileCharacteristics`]. |
#[derive(Debug)]
pub struct CoffHeader {
    pub machine: u16,
    pub number_of_sections: u16,
    pub time_date_stamp: u32,
    pub pointer_to_symbol_table: u32,
    pub number_of_symbols: u32,
    pub optional_header_size: u16,
    pub characteristics: FileCharacteristics,
}

impl CoffHeader {
    pub fn from(slice: &[u8; 20]) -> CoffHeader {
        CoffHeader {
            machine: u16::from_le_bytes(slice[0..2].try_into().unwrap()),
            number_of_sections: u16::from_le_bytes(slice[2..4].try_into().unwrap()),
            time_date_stamp: u32::from_le_bytes(slice[4..8].try_into().unwrap()),
            pointer_to_symbol_table: u32::from_le_bytes(slice[8..12].try_into().unwrap()),
            number_of_symbols: u32::from_le_bytes(slice[12..16].try_into().unwrap()),
            optional_header_size: u16::from_le_bytes(slice[16..18].try_into().unwrap()),
            characteristics: FileCharacteristics::from(u16::from_le_bytes(
                slice[18..20].try_into().unwrap(),
            )),
        }
    }

    pub fn machine_label(&self) -> &'static str {
        match self.machine {
            0x014c => "x86",
            0x01c0 => "ARM",
            0x01c4 => "ARMNT",
            0x0200 => "IA-64",
            0x5032 => "RISC-V 32",
            0x5064 => "RISC-V 64",
            0x8664 => "x86-64",
            0xaa64 => "ARM64",
            _ => "unknown",
        }
    }
}

/// # COFF characteristics
///
/// | Flag                    | Value    |
/// | ----------------------- | -------- |
/// | `RelocsStripped`        | `0x0001` |
/// | `ExecutableImage`       | `0x0002` |
/// | `LargeAddressAware`     | `0x0020` |
/// | `Machine32Bit`          | `0x0100` |
/// | `DebugStripped`         | `0x0200` |
/// | `SystemFile`            | `0x1000` |
/// | `Dll`                   | `0x2000` |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileCharacteristics(pub u16);

impl From<u16> for FileCharacteristics {
    fn from(value: u16) -> Self {
        FileCharacteristics(value)
    }
}

impl FileCharacteristics {
    pub const RELOCS_STRIPPED: u16 = 0x0001;
    pub const EXECUTABLE_IMAGE: u16 = 0x0002;
    pub const LARGE_ADDRESS_AWARE: u16 = 0x0020;
    pub const MACHINE_32BIT: u16 = 0x0100;
    pub const DEBUG_STRIPPED: u16 = 0x0200;
    pub const SYSTEM_FILE: u16 = 0x1000;
    pub const DLL: u16 = 0x2000;

    pub fn check_flag(&self, flag: u16) -> bool {
        self.0 & flag == flag
    }
}

/// # Optional header
///
/// `Magic` selects the layout: `0x10B` (PE32, 32-bit fields, BaseOfData
/// present) or `0x20B` (PE32+, 64-bit ImageBase and stack/heap sizes, no
/// BaseOfData). Both end in the same data-directory array.
///
/// | Offset (32/64) | Size | Field |
/// | -------------- | ---- | ----- |
/// | 0              | 2    | Magic |
/// | 16             | 4    | AddressOfEntryPoint |
/// | 28 / 24        | 4/8  | ImageBase |
/// | 32             | 4    | SectionAlignment |
/// | 36             | 4    | FileAlignment |
/// | 56             | 4    | SizeOfImage |
/// | 60             | 4    | SizeOfHeaders |
/// | 68             | 2    | Subsystem |
/// | 70             | 2    | DllCharacteristics |
/// | 92 / 108       | 4    | NumberOfRvaAndSizes |
/// | 96 / 112       | 8×16 | Data directories |
#[derive(Debug)]
pub struct OptionalHeader {
    pub magic: u16,
    pub is_plus: bool,
    pub linker_major: u8,
    pub linker_minor: u8,
    pub size_of_code: u32,
    pub entry_point_rva: u32,
    pub image_base: u64,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub os_major: u16,
    pub os_minor: u16,
    pub subsystem_major: u16,
    pub subsystem_minor: u16,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub checksum: u32,
    pub subsystem: u16,
    pub dll_characteristics: u16,
    pub number_of_rva_and_sizes: u32,
    pub data_directories: Vec<DataDirectory>,
}

impl OptionalHeader {
    pub const MAGIC_PE32: u16 = 0x10b;
    pub const MAGIC_PE32_PLUS: u16 = 0x20b;

    pub fn read(reader: &mut Reader<'_>, size: u16, issues: &mut IssueLog) -> Option<OptionalHeader> {
        let start = reader.pos();
        let magic = reader.read_u16_le("optional header magic", issues)?;
        let is_plus = match magic {
            Self::MAGIC_PE32 => false,
            Self::MAGIC_PE32_PLUS => true,
            other => {
                issues.note(format!("optional header magic 0x{:04x} is unknown", other));
                return None;
            }
        };
        let linker_major = reader.read_u8("linker major", issues)?;
        let linker_minor = reader.read_u8("linker minor", issues)?;
        let size_of_code = reader.read_u32_le("size of code", issues)?;
        reader.skip(8, "initialized/uninitialized data sizes", issues)?;
        let entry_point_rva = reader.read_u32_le("entry point rva", issues)?;
        reader.skip(4, "base of code", issues)?;
        let image_base = if is_plus {
            reader.read_u64_le("image base", issues)?
        } else {
            reader.skip(4, "base of data", issues)?;
            reader.read_u32_le("image base", issues)? as u64
        };
        let section_alignment = reader.read_u32_le("section alignment", issues)?;
        let file_alignment = reader.read_u32_le("file alignment", issues)?;
        let os_major = reader.read_u16_le("os major", issues)?;
        let os_minor = reader.read_u16_le("os minor", issues)?;
        reader.skip(4, "image version", issues)?;
        let subsystem_major = reader.read_u16_le("subsystem major", issues)?;
        let subsystem_minor = reader.read_u16_le("subsystem minor", issues)?;
        reader.skip(4, "win32 version", issues)?;
        let size_of_image = reader.read_u32_le("size of image", issues)?;
        let size_of_headers = reader.read_u32_le("size of headers", issues)?;
        let checksum = reader.read_u32_le("checksum", issues)?;
        let subsystem = reader.read_u16_le("subsystem", issues)?;
        let dll_characteristics = reader.read_u16_le("dll characteristics", issues)?;
        // Stack and heap reserve/commit, then the loader flags.
        let pointer = if is_plus { 8 } else { 4 };
        reader.skip(4 * pointer + 4, "stack/heap sizes and loader flags", issues)?;
        let number_of_rva_and_sizes = reader.read_u32_le("directory count", issues)?;

        let mut data_directories = Vec::with_capacity(16);
        for _ in 0..number_of_rva_and_sizes.min(16) {
            let rva = reader.read_u32_le("directory rva", issues)?;
            let dir_size = reader.read_u32_le("directory size", issues)?;
            data_directories.push(DataDirectory::new(rva, dir_size));
        }
        while data_directories.len() < 16 {
            data_directories.push(DataDirectory::new(0, 0));
        }
        if number_of_rva_and_sizes != 16 {
            issues.note(format!(
                "optional header declares {} data directories",
                number_of_rva_and_sizes
            ));
        }

        // The declared size wins over how much we consumed.
        reader.set_pos(start + size as usize);
        Some(OptionalHeader {
            magic,
            is_plus,
            linker_major,
            linker_minor,
            size_of_code,
            entry_point_rva,
            image_base,
            section_alignment,
            file_alignment,
            os_major,
            os_minor,
            subsystem_major,
            subsystem_minor,
            size_of_image,
            size_of_headers,
            checksum,
            subsystem,
            dll_characteristics,
            number_of_rva_and_sizes,
            data_directories,
        })
    }

    pub fn subsystem_label(&self) -> &'static str {
        match self.subsystem {
            1 => "native",
            2 => "Windows GUI",
            3 => "Windows console",
            7 => "POSIX console",
            9 => "Windows CE GUI",
            10 => "EFI application",
            11 => "EFI boot service driver",
            12 => "EFI runtime driver",
            14 => "Xbox",
            16 => "Windows boot application",
            _ => "unknown",
        }
    }
}

/// Directory indices into [`OptionalHeader::data_directories`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryIndex {
    Export = 0,
    Import = 1,
    Resource = 2,
    Exception = 3,
    Security = 4,
    BaseRelocation = 5,
    Debug = 6,
    Architecture = 7,
    GlobalPtr = 8,
    Tls = 9,
    LoadConfig = 10,
    BoundImport = 11,
    Iat = 12,
    DelayImport = 13,
    ClrRuntime = 14,
    Reserved = 15,
}

#[derive(Debug, Clone, Copy)]
pub struct DataDirectory {
    pub rva: u32,
    pub size: u32,
}

impl DataDirectory {
    pub fn new(rva: u32, size: u32) -> DataDirectory {
        DataDirectory { rva, size }
    }

    pub fn is_present(&self) -> bool {
        self.rva != 0 && self.size != 0
    }
}

/// # Section header
///
/// 40 bytes each, immediately after the optional header:
///
/// | Offset | Size | Field |
/// | ------ | ---- | ----- |
/// | 0      | 8    | Name (null-padded ASCII) |
/// | 8      | 4    | VirtualSize |
/// | 12     | 4    | VirtualAddress |
/// | 16     | 4    | SizeOfRawData |
/// | 20     | 4    | PointerToRawData |
/// | 36     | 4    | Characteristics |
#[derive(Debug, Clone)]
pub struct SectionHeader {
    pub name: String,
    pub virtual_size: u32,
    pub virtual_address: u32,
    pub size_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
    pub characteristics: SectionCharacteristics,
}

impl SectionHeader {
    pub fn from(slice: &[u8; 40]) -> SectionHeader {
        SectionHeader {
            name: ascii_field(&slice[0..8], 8),
            virtual_size: u32::from_le_bytes(slice[8..12].try_into().unwrap()),
            virtual_address: u32::from_le_bytes(slice[12..16].try_into().unwrap()),
            size_of_raw_data: u32::from_le_bytes(slice[16..20].try_into().unwrap()),
            pointer_to_raw_data: u32::from_le_bytes(slice[20..24].try_into().unwrap()),
            characteristics: SectionCharacteristics(u32::from_le_bytes(
                slice[36..40].try_into().unwrap(),
            )),
        }
    }

    /// The section's RVA span uses the larger of virtual and raw size;
    /// packed sections routinely declare a zero virtual size.
    pub fn virtual_span(&self) -> u32 {
        self.virtual_size.max(self.size_of_raw_data)
    }
}

/// | Flag               | Value        |
/// | ------------------ | ------------ |
/// | `ContainsCode`     | `0x00000020` |
/// | `InitializedData`  | `0x00000040` |
/// | `MemDiscardable`   | `0x02000000` |
/// | `MemShared`        | `0x10000000` |
/// | `MemExecute`       | `0x20000000` |
/// | `MemRead`          | `0x40000000` |
/// | `MemWrite`         | `0x80000000` |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionCharacteristics(pub u32);

impl SectionCharacteristics {
    pub const CONTAINS_CODE: u32 = 0x0000_0020;
    pub const INITIALIZED_DATA: u32 = 0x0000_0040;
    pub const MEM_DISCARDABLE: u32 = 0x0200_0000;
    pub const MEM_SHARED: u32 = 0x1000_0000;
    pub const MEM_EXECUTE: u32 = 0x2000_0000;
    pub const MEM_READ: u32 = 0x4000_0000;
    pub const MEM_WRITE: u32 = 0x8000_0000;

    pub fn check_flag(&self, flag: u32) -> bool {
        self.0 & flag == flag
    }
}
