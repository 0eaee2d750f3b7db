//! TAR archives: V7, ustar, GNU and PAX dialects.

use std::collections::HashMap;

use log::debug;

use crate::probe::{ascii_field, tar_numeric, unix_to_iso8601, ByteSource, IssueLog, ProbeOptions, Stage};

pub const BLOCK_SIZE: usize = 512;

/// Offsets inside the 512-byte header block
/// (<https://www.gnu.org/software/tar/manual/html_node/Standard.html>):
///
/// | Offset | Size | Field |
/// | ------ | ---- | ----- |
/// | 0      | 100  | Name |
/// | 100    | 8    | Mode (octal) |
/// | 108    | 8    | Owner uid (octal) |
/// | 116    | 8    | Owner gid (octal) |
/// | 124    | 12   | Size (octal or base-256) |
/// | 136    | 12   | Modification time (octal or base-256) |
/// | 148    | 8    | Header checksum |
/// | 156    | 1    | Type flag |
/// | 157    | 100  | Link name |
/// | 257    | 6    | Magic (`ustar\0` POSIX, `ustar ` GNU) |
/// | 263    | 2    | Version |
/// | 265    | 32   | Owner user name |
/// | 297    | 32   | Owner group name |
/// | 329    | 8    | Device major |
/// | 337    | 8    | Device minor |
/// | 345    | 155  | Name prefix (POSIX only) |
const NAME: usize = 0;
const MODE: usize = 100;
const UID: usize = 108;
const GID: usize = 116;
const SIZE: usize = 124;
const MTIME: usize = 136;
const CHKSUM: usize = 148;
const TYPEFLAG: usize = 156;
const LINKNAME: usize = 157;
const MAGIC: usize = 257;
const UNAME: usize = 265;
const GNAME: usize = 297;
const PREFIX: usize = 345;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TarDialect {
    V7,
    Ustar,
    Gnu,
    Pax,
}

#[derive(Debug)]
pub struct TarEntry {
    pub name: String,
    pub link_name: String,
    pub type_flag: u8,
    pub type_label: &'static str,
    pub size: u64,
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
    /// `"-"` when the header carries no usable timestamp.
    pub mtime_iso: String,
    pub checksum_valid: bool,
    pub uname: String,
    pub gname: String,
    pub dialect: TarDialect,
    /// Absolute offset of the entry's first data block.
    pub data_offset: u64,
    /// PAX keys that applied to this entry, in override order.
    pub pax_keys: Vec<String>,
}

#[derive(Debug)]
pub struct TarArchive {
    pub entries: Vec<TarEntry>,
    /// Number of trailing all-zero blocks seen (2 is the well-formed end).
    pub terminator_blocks: u32,
    pub issues: Vec<String>,
}

/// Name/link/PAX state accumulated from meta entries until the next regular
/// header consumes it.
#[derive(Default)]
struct Pending {
    gnu_long_name: Option<String>,
    gnu_long_link: Option<String>,
    pax_local: HashMap<String, String>,
}

pub fn analyze(source: &dyn ByteSource, options: &ProbeOptions<'_>) -> TarArchive {
    debug!("tar: analyzing {} bytes", source.len());
    let mut issues = IssueLog::new();
    let mut entries = Vec::new();
    let mut pending = Pending::default();
    let mut pax_global: HashMap<String, String> = HashMap::new();
    let mut saw_pax = false;

    let len = source.len();
    let mut offset: u64 = 0;
    let mut zero_blocks: u32 = 0;
    let mut blocks_walked: u64 = 0;

    while offset + BLOCK_SIZE as u64 <= len {
        if blocks_walked % options.yield_interval as u64 == 0 {
            options.report(Stage::Records, offset, entries.len() as u64);
            if options.cancelled() {
                issues.note("cancelled");
                break;
            }
        }
        blocks_walked += 1;

        let block = match source.slice(offset, offset + BLOCK_SIZE as u64) {
            Ok(block) => block,
            Err(error) => {
                issues.note(format!("parse aborted: {}", error));
                break;
            }
        };

        if block.iter().all(|&b| b == 0) {
            zero_blocks += 1;
            offset += BLOCK_SIZE as u64;
            if zero_blocks == 2 {
                break;
            }
            continue;
        }
        zero_blocks = 0;

        let type_flag = block[TYPEFLAG];
        let size = tar_numeric(&block[SIZE..SIZE + 12]).unwrap_or_else(|| {
            issues.note(format!("size field unreadable at 0x{:08x}", offset + SIZE as u64));
            0
        });
        let data_blocks = size.div_ceil(BLOCK_SIZE as u64);
        let data_offset = offset + BLOCK_SIZE as u64;
        let next_offset = match data_offset.checked_add(data_blocks.saturating_mul(BLOCK_SIZE as u64)) {
            Some(next) if next > offset => next,
            _ => {
                issues.note(format!("entry at 0x{:08x} does not advance", offset));
                break;
            }
        };

        let checksum_valid = verify_checksum(&block, offset, &mut issues);
        let dialect = detect_dialect(&block, saw_pax);

        match type_flag {
            // GNU long name / long link: the data blocks hold the string.
            b'L' | b'K' | b'N' => {
                let text = read_meta_text(source, data_offset, size, len, &mut issues);
                if type_flag == b'K' {
                    pending.gnu_long_link = Some(text);
                } else {
                    pending.gnu_long_name = Some(text);
                }
            }
            // PAX global / per-file overlays.
            b'g' | b'x' => {
                saw_pax = true;
                let text = read_meta_text(source, data_offset, size, len, &mut issues);
                let records = parse_pax_records(text.as_bytes(), offset, &mut issues);
                if type_flag == b'g' {
                    pax_global.extend(records);
                } else {
                    pending.pax_local.extend(records);
                }
            }
            _ => {
                let entry = build_entry(
                    &block,
                    type_flag,
                    size,
                    checksum_valid,
                    dialect,
                    data_offset,
                    &pax_global,
                    std::mem::take(&mut pending),
                );
                entries.push(entry);
            }
        }

        offset = next_offset;
    }

    if zero_blocks < 2 {
        issues.note("archive ends without the two terminating zero blocks");
    }

    TarArchive {
        entries,
        terminator_blocks: zero_blocks,
        issues: issues.into_entries(),
    }
}

/// Sum of all 512 header bytes with the checksum field replaced by eight
/// spaces, compared to the stored octal (or base-256) value. A mismatch is
/// a notice, not fatal.
fn verify_checksum(block: &[u8], offset: u64, issues: &mut IssueLog) -> bool {
    let stored = match tar_numeric(&block[CHKSUM..CHKSUM + 8]) {
        Some(stored) => stored,
        None => {
            issues.note(format!("checksum field unreadable at 0x{:08x}", offset + CHKSUM as u64));
            return false;
        }
    };
    let mut sum: u64 = 0;
    for (i, &byte) in block.iter().enumerate() {
        sum += if (CHKSUM..CHKSUM + 8).contains(&i) { 0x20 } else { byte as u64 };
    }
    if sum != stored {
        issues.note(format!(
            "header checksum mismatch at 0x{:08x}: stored {} computed {}",
            offset, stored, sum
        ));
    }
    sum == stored
}

fn detect_dialect(block: &[u8], saw_pax: bool) -> TarDialect {
    if saw_pax {
        return TarDialect::Pax;
    }
    match &block[MAGIC..MAGIC + 6] {
        b"ustar\0" => TarDialect::Ustar,
        b"ustar " => TarDialect::Gnu,
        _ => TarDialect::V7,
    }
}

fn read_meta_text(
    source: &dyn ByteSource,
    data_offset: u64,
    size: u64,
    len: u64,
    issues: &mut IssueLog,
) -> String {
    let end = data_offset.saturating_add(size).min(len);
    if data_offset.saturating_add(size) > len {
        issues.note(format!(
            "meta entry data at 0x{:08x} extends past end of data",
            data_offset
        ));
    }
    match source.slice(data_offset, end) {
        Ok(data) => {
            let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
            String::from_utf8_lossy(&data[..end]).into_owned()
        }
        Err(error) => {
            issues.note(format!("parse aborted: {}", error));
            String::new()
        }
    }
}

/// PAX bodies are a stream of `"length SP key=value\n"` records where
/// `length` counts the whole record including itself and the newline.
fn parse_pax_records(body: &[u8], at: u64, issues: &mut IssueLog) -> HashMap<String, String> {
    let mut records = HashMap::new();
    let mut pos = 0;
    while pos < body.len() {
        let space = match body[pos..].iter().position(|&b| b == b' ') {
            Some(space) => pos + space,
            None => {
                issues.note(format!("malformed pax record at 0x{:08x}", at));
                break;
            }
        };
        let length: usize = match std::str::from_utf8(&body[pos..space])
            .ok()
            .and_then(|digits| digits.parse().ok())
        {
            Some(length) if length > space - pos + 1 => length,
            _ => {
                issues.note(format!("malformed pax record length at 0x{:08x}", at));
                break;
            }
        };
        let record_end = match pos.checked_add(length) {
            Some(end) if end <= body.len() => end,
            _ => {
                issues.note(format!("pax record length overruns body at 0x{:08x}", at));
                break;
            }
        };
        let mut record = &body[space + 1..record_end];
        if record.last() == Some(&b'\n') {
            record = &record[..record.len() - 1];
        }
        match record.iter().position(|&b| b == b'=') {
            Some(eq) => {
                records.insert(
                    String::from_utf8_lossy(&record[..eq]).into_owned(),
                    String::from_utf8_lossy(&record[eq + 1..]).into_owned(),
                );
            }
            None => issues.note(format!("pax record without '=' at 0x{:08x}", at)),
        }
        pos = record_end;
    }
    records
}

#[allow(clippy::too_many_arguments)]
fn build_entry(
    block: &[u8],
    type_flag: u8,
    size: u64,
    checksum_valid: bool,
    dialect: TarDialect,
    data_offset: u64,
    pax_global: &HashMap<String, String>,
    pending: Pending,
) -> TarEntry {
    let mut name = ascii_field(&block[NAME..NAME + 100], 100);
    if dialect == TarDialect::Ustar || dialect == TarDialect::Pax {
        let prefix = ascii_field(&block[PREFIX..PREFIX + 155], 155);
        if !prefix.is_empty() {
            name = format!("{}/{}", prefix, name);
        }
    }
    let mut link_name = ascii_field(&block[LINKNAME..LINKNAME + 100], 100);
    let mut entry_size = size;
    let mut mtime = tar_numeric(&block[MTIME..MTIME + 12]).map(|t| t as i64);
    let mut uname = ascii_field(&block[UNAME..UNAME + 32], 32);
    let mut gname = ascii_field(&block[GNAME..GNAME + 32], 32);
    let mut uid = tar_numeric(&block[UID..UID + 8]).unwrap_or(0);
    let mut gid = tar_numeric(&block[GID..GID + 8]).unwrap_or(0);

    // Override order: global PAX, then per-file PAX, then GNU continuations.
    let mut pax_keys = Vec::new();
    for records in [pax_global, &pending.pax_local] {
        for (key, value) in records {
            pax_keys.push(key.clone());
            match key.as_str() {
                "path" => name = value.clone(),
                "linkpath" => link_name = value.clone(),
                "size" => entry_size = value.parse().unwrap_or(entry_size),
                "mtime" => {
                    mtime = value
                        .split('.')
                        .next()
                        .and_then(|s| s.parse().ok())
                        .or(mtime)
                }
                "uname" => uname = value.clone(),
                "gname" => gname = value.clone(),
                "uid" => uid = value.parse().unwrap_or(uid),
                "gid" => gid = value.parse().unwrap_or(gid),
                _ => {}
            }
        }
    }
    if let Some(long) = pending.gnu_long_name {
        name = long;
    }
    if let Some(long) = pending.gnu_long_link {
        link_name = long;
    }

    TarEntry {
        name,
        link_name,
        type_flag,
        type_label: type_label(type_flag),
        size: entry_size,
        mode: tar_numeric(&block[MODE..MODE + 8]).unwrap_or(0) as u32,
        uid,
        gid,
        mtime_iso: mtime
            .and_then(unix_to_iso8601)
            .unwrap_or_else(|| "-".to_string()),
        checksum_valid,
        uname,
        gname,
        dialect,
        data_offset,
        pax_keys,
    }
}

fn type_label(type_flag: u8) -> &'static str {
    match type_flag {
        0 | b'0' => "regular file",
        b'1' => "hard link",
        b'2' => "symbolic link",
        b'3' => "character device",
        b'4' => "block device",
        b'5' => "directory",
        b'6' => "fifo",
        b'7' => "contiguous file",
        b'D' => "GNU directory with entries",
        b'S' => "GNU sparse file",
        b'V' => "GNU volume label",
        _ => "unknown",
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::probe::MemorySource;

    /// Builds a well-formed header block with a canonical checksum.
    pub(crate) fn header_block(name: &str, size: u64, type_flag: u8, mtime: u64) -> [u8; 512] {
        let mut block = [0u8; 512];
        block[NAME..NAME + name.len()].copy_from_slice(name.as_bytes());
        block[MODE..MODE + 7].copy_from_slice(b"0000644");
        block[UID..UID + 7].copy_from_slice(b"0001750");
        block[GID..GID + 7].copy_from_slice(b"0001750");
        let octal = format!("{:011o}", size);
        block[SIZE..SIZE + 11].copy_from_slice(octal.as_bytes());
        let octal = format!("{:011o}", mtime);
        block[MTIME..MTIME + 11].copy_from_slice(octal.as_bytes());
        block[TYPEFLAG] = type_flag;
        block[MAGIC..MAGIC + 6].copy_from_slice(b"ustar\0");
        block[MAGIC + 6..MAGIC + 8].copy_from_slice(b"00");
        block[UNAME..UNAME + 4].copy_from_slice(b"root");
        block[GNAME..GNAME + 4].copy_from_slice(b"root");
        let sum: u64 = block
            .iter()
            .enumerate()
            .map(|(i, &b)| if (CHKSUM..CHKSUM + 8).contains(&i) { 0x20 } else { b as u64 })
            .sum();
        let octal = format!("{:06o}\0 ", sum);
        block[CHKSUM..CHKSUM + 8].copy_from_slice(octal.as_bytes());
        block
    }

    pub(crate) fn minimal_archive() -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&header_block("hello.txt", 2, b'0', 1_600_000_000));
        let mut body = [0u8; 512];
        body[..2].copy_from_slice(b"Hi");
        data.extend_from_slice(&body);
        data.extend_from_slice(&[0u8; 1024]);
        data
    }

    #[test]
    fn minimal_ustar_round_trip() {
        let archive = analyze(&MemorySource::new(minimal_archive()), &ProbeOptions::default());
        assert_eq!(archive.entries.len(), 1);
        let entry = &archive.entries[0];
        assert_eq!(entry.name, "hello.txt");
        assert_eq!(entry.size, 2);
        assert_ne!(entry.mtime_iso, "-");
        assert!(entry.checksum_valid);
        assert_eq!(entry.dialect, TarDialect::Ustar);
        assert_eq!(archive.terminator_blocks, 2);
        assert!(archive.issues.is_empty());
    }

    #[test]
    fn checksum_recompute_matches_canonical() {
        let block = header_block("x", 0, b'0', 0);
        let mut issues = IssueLog::new();
        assert!(verify_checksum(&block, 0, &mut issues));
        assert!(issues.is_empty());
    }

    #[test]
    fn gnu_long_name_applies_to_next_entry() {
        let long_name = "a/".repeat(80) + "file.txt";
        let mut data = Vec::new();
        data.extend_from_slice(&header_block("././@LongLink", long_name.len() as u64, b'L', 0));
        let mut body = vec![0u8; 512];
        body[..long_name.len()].copy_from_slice(long_name.as_bytes());
        data.extend_from_slice(&body);
        data.extend_from_slice(&header_block("truncated-name", 0, b'0', 1_000_000));
        data.extend_from_slice(&[0u8; 1024]);

        let archive = analyze(&MemorySource::new(data), &ProbeOptions::default());
        assert_eq!(archive.entries.len(), 1);
        assert_eq!(archive.entries[0].name, long_name);
    }

    #[test]
    fn pax_overrides_win_over_header_fields() {
        let pax = "31 path=override/long-name.bin\n";
        let mut data = Vec::new();
        data.extend_from_slice(&header_block("ignored", pax.len() as u64, b'x', 0));
        let mut body = vec![0u8; 512];
        body[..pax.len()].copy_from_slice(pax.as_bytes());
        data.extend_from_slice(&body);
        data.extend_from_slice(&header_block("short", 0, b'0', 1_000_000));
        data.extend_from_slice(&[0u8; 1024]);

        let archive = analyze(&MemorySource::new(data), &ProbeOptions::default());
        assert_eq!(archive.entries.len(), 1);
        assert_eq!(archive.entries[0].name, "override/long-name.bin");
        assert_eq!(archive.entries[0].dialect, TarDialect::Pax);
        assert!(archive.entries[0].pax_keys.contains(&"path".to_string()));
    }

    #[test]
    fn missing_terminator_is_an_issue() {
        let mut data = Vec::new();
        data.extend_from_slice(&header_block("a.txt", 0, b'0', 0));
        let archive = analyze(&MemorySource::new(data), &ProbeOptions::default());
        assert_eq!(archive.entries.len(), 1);
        assert!(archive
            .issues
            .iter()
            .any(|issue| issue.contains("terminating zero blocks")));
    }
}
