mod source;
mod issues;
mod reader;
mod strings;
mod time;
mod options;
mod disasm;
mod dispatch;

pub use source::{ByteSource, FileSource, MemorySource, SourceError};
pub use issues::IssueLog;
pub use reader::{crc32, tar_numeric, Reader, VInt};
pub use strings::*;
pub use time::*;
pub use options::{CancelToken, ProbeOptions, ProgressFn, Stage};
pub use disasm::{DisasmSection, DisasmSeeds, Disassembler};
pub use dispatch::{probe, FormatKind, ParsedFormat, ProbeOutcome};
