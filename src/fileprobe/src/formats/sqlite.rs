//! SQLite 3 database header.

use log::debug;

use crate::probe::{ByteSource, IssueLog, ProbeOptions, Reader};

/// # SQLite database header
///
/// The first 100 bytes of every SQLite 3 database file
/// (<https://www.sqlite.org/fileformat2.html#the_database_header>):
///
/// | Offset | Size | Field |
/// | ------ | ---- | ----- |
/// | 0      | 16   | Magic string `"SQLite format 3\0"` |
/// | 16     | 2    | Page size in bytes, big-endian; the value 1 means 65536 |
/// | 18     | 1    | File-format write version |
/// | 19     | 1    | File-format read version |
/// | 20     | 1    | Reserved bytes per page |
/// | 24     | 4    | File change counter |
/// | 28     | 4    | Database size in pages |
/// | 40     | 4    | Schema cookie |
/// | 44     | 4    | Schema format number (1..4) |
/// | 52     | 4    | Largest root b-tree page (non-zero when vacuum-enabled) |
/// | 56     | 4    | Text encoding (1 UTF-8, 2 UTF-16LE, 3 UTF-16BE) |
/// | 64     | 4    | Incremental-vacuum mode flag |
/// | 68     | 4    | Application ID |
/// | 96     | 4    | SQLITE_VERSION_NUMBER of the writer |
#[derive(Debug)]
pub struct SqliteHeader {
    pub page_size: u32,
    pub page_size_valid: bool,
    pub write_version: u8,
    pub read_version: u8,
    pub reserved_per_page: u8,
    pub change_counter: u32,
    pub page_count: u32,
    pub schema_cookie: u32,
    pub schema_format: u32,
    pub schema_format_label: &'static str,
    pub text_encoding: u32,
    pub text_encoding_label: &'static str,
    pub auto_vacuum_label: &'static str,
    pub application_id: u32,
    pub version: String,
    pub issues: Vec<String>,
}

pub const MAGIC: &[u8; 16] = b"SQLite format 3\0";

pub fn analyze(source: &dyn ByteSource, _options: &ProbeOptions<'_>) -> SqliteHeader {
    debug!("sqlite: analyzing {} bytes", source.len());
    let mut issues = IssueLog::new();

    let window = match source.slice(0, source.len().min(100)) {
        Ok(window) => window,
        Err(error) => {
            issues.note(format!("parse aborted: {}", error));
            Vec::new()
        }
    };
    let reader = Reader::new(&window, 0);

    let page_size_raw = reader.u16_be_at(16).unwrap_or(0);
    let page_size = if page_size_raw == 1 { 65_536 } else { page_size_raw as u32 };
    let page_size_valid = (512..=65_536).contains(&page_size) && page_size.is_power_of_two();
    if !page_size_valid {
        issues.note(format!("page size {} is not a power of two in 512..65536", page_size));
    }

    let schema_format = reader.u32_be_at(44).unwrap_or(0);
    let text_encoding = reader.u32_be_at(56).unwrap_or(0);
    let largest_root_page = reader.u32_be_at(52).unwrap_or(0);
    let incremental_vacuum = reader.u32_be_at(64).unwrap_or(0);
    let raw_version = reader.u32_be_at(96).unwrap_or(0);

    if window.len() < 100 {
        issues.note("database header is truncated");
    }

    SqliteHeader {
        page_size,
        page_size_valid,
        write_version: reader.u8_at(18).unwrap_or(0),
        read_version: reader.u8_at(19).unwrap_or(0),
        reserved_per_page: reader.u8_at(20).unwrap_or(0),
        change_counter: reader.u32_be_at(24).unwrap_or(0),
        page_count: reader.u32_be_at(28).unwrap_or(0),
        schema_cookie: reader.u32_be_at(40).unwrap_or(0),
        schema_format,
        schema_format_label: schema_format_label(schema_format),
        text_encoding,
        text_encoding_label: text_encoding_label(text_encoding),
        auto_vacuum_label: auto_vacuum_label(largest_root_page, incremental_vacuum),
        application_id: reader.u32_be_at(68).unwrap_or(0),
        version: version_string(raw_version),
        issues: issues.into_entries(),
    }
}

/// `SQLITE_VERSION_NUMBER` is `major*1000000 + minor*1000 + patch`.
fn version_string(raw: u32) -> String {
    format!("{}.{}.{}", raw / 1_000_000, (raw / 1_000) % 1_000, raw % 1_000)
}

fn schema_format_label(format: u32) -> &'static str {
    match format {
        1 => "original (1)",
        2 => "ALTER TABLE ADD COLUMN (2)",
        3 => "non-NULL defaults (3)",
        4 => "DESC indexes and boolean literals (4)",
        _ => "unknown",
    }
}

fn text_encoding_label(code: u32) -> &'static str {
    match code {
        1 => "UTF-8",
        2 => "UTF-16LE",
        3 => "UTF-16BE",
        _ => "unknown",
    }
}

fn auto_vacuum_label(largest_root_page: u32, incremental: u32) -> &'static str {
    match (largest_root_page, incremental) {
        (0, _) => "none",
        (_, 0) => "full",
        _ => "incremental",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::MemorySource;

    fn header_bytes() -> Vec<u8> {
        let mut data = vec![0u8; 100];
        data[..16].copy_from_slice(MAGIC);
        data[16..18].copy_from_slice(&4096u16.to_be_bytes());
        data[18] = 2;
        data[19] = 2;
        data[44..48].copy_from_slice(&4u32.to_be_bytes());
        data[56..60].copy_from_slice(&1u32.to_be_bytes());
        data[96..100].copy_from_slice(&3_046_001u32.to_be_bytes());
        data
    }

    #[test]
    fn decodes_fixed_header() {
        let source = MemorySource::new(header_bytes());
        let header = analyze(&source, &ProbeOptions::default());
        assert_eq!(header.page_size, 4096);
        assert!(header.page_size_valid);
        assert_eq!(header.text_encoding_label, "UTF-8");
        assert_eq!(header.version, "3.46.1");
        assert!(header.issues.is_empty());
    }

    #[test]
    fn page_size_one_means_64k() {
        let mut data = header_bytes();
        data[16..18].copy_from_slice(&1u16.to_be_bytes());
        let header = analyze(&MemorySource::new(data), &ProbeOptions::default());
        assert_eq!(header.page_size, 65_536);
        assert!(header.page_size_valid);
    }

    #[test]
    fn bad_page_size_is_an_issue() {
        let mut data = header_bytes();
        data[16..18].copy_from_slice(&1000u16.to_be_bytes());
        let header = analyze(&MemorySource::new(data), &ProbeOptions::default());
        assert!(!header.page_size_valid);
        assert_eq!(header.issues.len(), 1);
    }
}
