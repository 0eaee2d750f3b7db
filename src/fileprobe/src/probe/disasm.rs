/// An executable region handed to an external disassembler: the bytes of a
/// section and the virtual address they load at.
pub struct DisasmSection {
    pub vaddr_start: u64,
    pub bytes: Vec<u8>,
}

/// Seed material collected by the PE and ELF analyzers: entry point,
/// exported symbols, and (PE only) unwind/guard tables, filtered down to
/// addresses that land inside an executable region.
#[derive(Debug, Default)]
pub struct DisasmSeeds {
    pub bitness: u8,
    pub entrypoints: Vec<u64>,
    /// Per-source-group count of seeds dropped because they fell outside
    /// every executable region, mirrored into the issue log.
    pub dropped: Vec<(String, u32)>,
}

/// External disassembler seam. Absence is a recorded issue, never a parse
/// failure; decoding output is opaque to this crate.
pub trait Disassembler {
    fn decode(&self, bitness: u8, sections: Vec<DisasmSection>, seeds: &[u64]);
}
