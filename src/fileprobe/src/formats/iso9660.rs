//! ISO-9660 / Joliet volume analysis.

use std::collections::HashSet;
use std::collections::VecDeque;

use log::debug;

use crate::probe::{
    ascii_field, ucs2be_string, ByteSource, IssueLog, ProbeOptions, Reader, Stage,
};

pub const SECTOR_SIZE: u64 = 2048;
/// Volume descriptors start at logical block 16.
pub const DESCRIPTOR_START: u64 = 16 * SECTOR_SIZE;
pub const STANDARD_ID: &[u8; 5] = b"CD001";

const MAX_DESCRIPTORS: u32 = 64;
const MAX_DIRECTORY_DEPTH: u32 = 16;
const MAX_TOTAL_ENTRIES: usize = 10_000;
const MAX_ENTRIES_PER_DIRECTORY: usize = 4096;
const MAX_PATH_TABLE_ENTRIES: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorKind {
    Boot,
    Primary,
    Supplementary,
    Partition,
    Terminator,
    Unknown(u8),
}

/// Joliet escape-sequence levels carried by a supplementary descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JolietLevel {
    Level1,
    Level2,
    Level3,
}

#[derive(Debug)]
pub struct VolumeDescriptor {
    pub kind: DescriptorKind,
    pub version: u8,
    pub joliet: Option<JolietLevel>,
}

/// # Primary volume descriptor (ECMA-119 8.4)
///
/// Fields of interest (all numeric fields are both-endian):
///
/// | Offset | Size | Field |
/// | ------ | ---- | ----- |
/// | 40     | 32   | Volume identifier |
/// | 80     | 8    | Volume space size (7.3.3) |
/// | 120    | 4    | Volume set size (7.2.3) |
/// | 128    | 4    | Logical block size (7.2.3) |
/// | 132    | 8    | Path table size (7.3.3) |
/// | 140    | 4    | Type-L path table location (7.3.1) |
/// | 156    | 34   | Root directory record |
/// | 318    | 128  | Publisher identifier |
/// | 813    | 17   | Creation date/time (8.4.26.1) |
#[derive(Debug)]
pub struct VolumeInfo {
    pub volume_id: String,
    pub volume_space_blocks: u32,
    pub logical_block_size: u16,
    pub path_table_size: u32,
    pub path_table_lba: u32,
    pub publisher: String,
    pub application: String,
    pub creation_date: Option<String>,
    pub root: DirectoryRecord,
}

/// # Directory record (ECMA-119 9.1)
///
/// | Offset | Size | Field |
/// | ------ | ---- | ----- |
/// | 0      | 1    | Record length |
/// | 1      | 1    | Extended-attribute length |
/// | 2      | 8    | Extent location (7.3.3) |
/// | 10     | 8    | Data length (7.3.3) |
/// | 18     | 7    | Recording date/time |
/// | 25     | 1    | File flags (bit 1 = directory) |
/// | 28     | 4    | Volume sequence number (7.2.3) |
/// | 32     | 1    | Identifier length |
/// | 33     | n    | Identifier |
#[derive(Debug, Clone)]
pub struct DirectoryRecord {
    pub extent_lba: u32,
    pub data_length: u32,
    pub recorded: Option<String>,
    pub is_directory: bool,
    pub identifier: String,
}

#[derive(Debug)]
pub struct PathTableEntry {
    pub extent_lba: u32,
    pub parent_index: u16,
    pub identifier: String,
}

/// A traversed entry with its path from the root.
#[derive(Debug)]
pub struct IsoEntry {
    pub path: String,
    pub record: DirectoryRecord,
    pub depth: u32,
}

#[derive(Debug)]
pub struct IsoVolume {
    pub descriptors: Vec<VolumeDescriptor>,
    pub primary: Option<VolumeInfo>,
    pub joliet: Option<VolumeInfo>,
    pub path_table: Vec<PathTableEntry>,
    pub entries: Vec<IsoEntry>,
    pub issues: Vec<String>,
}

pub fn analyze(source: &dyn ByteSource, options: &ProbeOptions<'_>) -> IsoVolume {
    debug!("iso9660: analyzing {} bytes", source.len());
    let mut issues = IssueLog::new();
    let mut volume = IsoVolume {
        descriptors: Vec::new(),
        primary: None,
        joliet: None,
        path_table: Vec::new(),
        entries: Vec::new(),
        issues: Vec::new(),
    };

    // Descriptor walk: one per sector from LBA 16 until the terminator.
    for index in 0..MAX_DESCRIPTORS {
        let at = DESCRIPTOR_START + index as u64 * SECTOR_SIZE;
        let sector = match source.slice(at, (at + SECTOR_SIZE).min(source.len())) {
            Ok(sector) if sector.len() == SECTOR_SIZE as usize => sector,
            Ok(_) | Err(_) => {
                issues.note(format!(
                    "volume descriptor set at 0x{:08x} ends without a terminator",
                    at
                ));
                break;
            }
        };
        if &sector[1..6] != STANDARD_ID {
            issues.note(format!("descriptor at 0x{:08x} lacks the CD001 identifier", at));
            break;
        }
        let type_code = sector[0];
        let kind = match type_code {
            0 => DescriptorKind::Boot,
            1 => DescriptorKind::Primary,
            2 => DescriptorKind::Supplementary,
            3 => DescriptorKind::Partition,
            255 => DescriptorKind::Terminator,
            other => DescriptorKind::Unknown(other),
        };
        let joliet = (kind == DescriptorKind::Supplementary)
            .then(|| joliet_level(&sector[88..120]))
            .flatten();
        volume.descriptors.push(VolumeDescriptor {
            kind,
            version: sector[6],
            joliet,
        });

        match kind {
            DescriptorKind::Primary if volume.primary.is_none() => {
                volume.primary = read_volume_info(&sector, at, false, &mut issues);
            }
            DescriptorKind::Supplementary if joliet.is_some() && volume.joliet.is_none() => {
                volume.joliet = read_volume_info(&sector, at, true, &mut issues);
            }
            DescriptorKind::Terminator => break,
            _ => {}
        }
    }

    // Joliet names are the richer tree when present; the path table always
    // comes from the primary descriptor.
    if let Some(primary) = &volume.primary {
        volume.path_table = read_path_table(source, primary, &mut issues);
    }
    let tree_info = volume.joliet.as_ref().or(volume.primary.as_ref());
    if let Some(info) = tree_info {
        let unicode = volume.joliet.is_some();
        volume.entries = walk_directories(source, info, unicode, options, &mut issues);
    }

    volume.issues = issues.into_entries();
    volume
}

/// Joliet is signalled by UCS-2 escape sequences `%/@`, `%/C`, `%/E`.
fn joliet_level(escapes: &[u8]) -> Option<JolietLevel> {
    match &escapes[..3] {
        b"%/@" => Some(JolietLevel::Level1),
        b"%/C" => Some(JolietLevel::Level2),
        b"%/E" => Some(JolietLevel::Level3),
        _ => None,
    }
}

fn read_volume_info(
    sector: &[u8],
    at: u64,
    unicode: bool,
    issues: &mut IssueLog,
) -> Option<VolumeInfo> {
    let mut reader = Reader::new(sector, at);

    reader.set_pos(80);
    let volume_space_blocks = reader.read_u32_both("volume space size", issues)?;
    reader.set_pos(120);
    reader.read_u16_both("volume set size", issues)?;
    reader.read_u16_both("volume sequence number", issues)?;
    let logical_block_size = reader.read_u16_both("logical block size", issues)?;
    let path_table_size = reader.read_u32_both("path table size", issues)?;
    let path_table_lba = reader.read_u32_le("type-l path table location", issues)?;

    let text = |range: std::ops::Range<usize>| {
        if unicode {
            ucs2be_string(&sector[range], 64)
        } else {
            ascii_field(&sector[range.clone()], range.len())
        }
    };

    let root = read_directory_record(&sector[156..190], at + 156, unicode, issues)?;
    Some(VolumeInfo {
        volume_id: text(40..72),
        volume_space_blocks,
        logical_block_size,
        path_table_size,
        path_table_lba,
        publisher: text(318..446),
        application: text(574..702),
        creation_date: decimal_datetime(&sector[813..830]),
        root,
    })
}

/// 17-byte "YYYYMMDDHHMMSScc" + timezone quarter-hours from GMT-48.
fn decimal_datetime(raw: &[u8]) -> Option<String> {
    let digits = std::str::from_utf8(&raw[..16]).ok()?;
    if digits.starts_with("0000") || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(format!(
        "{}-{}-{}T{}:{}:{}",
        &digits[0..4],
        &digits[4..6],
        &digits[6..8],
        &digits[8..10],
        &digits[10..12],
        &digits[12..14]
    ))
}

/// 7-byte binary date in directory records: years since 1900, month, day,
/// hour, minute, second, timezone.
fn binary_datetime(raw: &[u8]) -> Option<String> {
    if raw.len() < 7 || raw[1] == 0 || raw[2] == 0 {
        return None;
    }
    Some(format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}",
        1900 + raw[0] as u32,
        raw[1],
        raw[2],
        raw[3],
        raw[4],
        raw[5]
    ))
}

fn read_directory_record(
    raw: &[u8],
    at: u64,
    unicode: bool,
    issues: &mut IssueLog,
) -> Option<DirectoryRecord> {
    let mut reader = Reader::new(raw, at);
    let length = reader.read_u8("directory record length", issues)?;
    if length == 0 || length as usize > raw.len() {
        return None;
    }
    reader.read_u8("extended attribute length", issues)?;
    let extent_lba = reader.read_u32_both("extent location", issues)?;
    let data_length = reader.read_u32_both("data length", issues)?;
    let recorded = reader.take(7, "recording date", issues)?;
    let recorded = binary_datetime(recorded);
    let flags = reader.read_u8("file flags", issues)?;
    reader.skip(2, "interleave", issues)?;
    reader.read_u16_both("volume sequence number", issues)?;
    let id_len = reader.read_u8("identifier length", issues)? as usize;
    let id_raw = reader.take(id_len, "identifier", issues)?;

    let identifier = match id_raw {
        [0] => ".".to_string(),
        [1] => "..".to_string(),
        _ if unicode => ucs2be_string(id_raw, id_len / 2),
        _ => ascii_field(id_raw, id_len),
    };

    Some(DirectoryRecord {
        extent_lba,
        data_length,
        recorded,
        is_directory: flags & 0x02 != 0,
        identifier,
    })
}

/// Type-L path table: little-endian records, padded to even length.
fn read_path_table(
    source: &dyn ByteSource,
    info: &VolumeInfo,
    issues: &mut IssueLog,
) -> Vec<PathTableEntry> {
    let mut entries = Vec::new();
    let start = info.path_table_lba as u64 * info.logical_block_size.max(1) as u64;
    let end = (start + info.path_table_size as u64).min(source.len());
    if start >= source.len() || info.path_table_size == 0 {
        if info.path_table_size != 0 {
            issues.note(format!(
                "path table at 0x{:08x} lies past end of data",
                start
            ));
        }
        return entries;
    }
    let window = match source.slice(start, end) {
        Ok(window) => window,
        Err(error) => {
            issues.note(format!("parse aborted: {}", error));
            return entries;
        }
    };
    let mut reader = Reader::new(&window, start);
    while !reader.at_end() && entries.len() < MAX_PATH_TABLE_ENTRIES {
        let Some(name_len) = reader.read_u8("path table name length", issues) else { break };
        if name_len == 0 {
            break;
        }
        reader.read_u8("path table attribute length", issues);
        let Some(extent_lba) = reader.read_u32_le("path table extent", issues) else { break };
        let Some(parent_index) = reader.read_u16_le("path table parent", issues) else { break };
        let Some(id_raw) = reader.take(name_len as usize, "path table name", issues) else {
            break;
        };
        let identifier = match id_raw {
            [0] | [1] => "/".to_string(),
            _ => ascii_field(id_raw, name_len as usize),
        };
        if name_len % 2 == 1 {
            reader.skip(1, "path table padding", issues);
        }
        entries.push(PathTableEntry { extent_lba, parent_index, identifier });
    }
    entries
}

/// Bounded breadth-first traversal of the directory tree. Loops are broken
/// with a visited-extent set; depth, per-directory and total entry caps all
/// terminate the walk with an issue.
fn walk_directories(
    source: &dyn ByteSource,
    info: &VolumeInfo,
    unicode: bool,
    options: &ProbeOptions<'_>,
    issues: &mut IssueLog,
) -> Vec<IsoEntry> {
    let block = info.logical_block_size.max(1) as u64;
    let mut entries = Vec::new();
    let mut visited: HashSet<u32> = HashSet::new();
    let mut queue: VecDeque<(DirectoryRecord, String, u32)> = VecDeque::new();
    queue.push_back((info.root.clone(), String::new(), 0));
    visited.insert(info.root.extent_lba);

    while let Some((dir, path, depth)) = queue.pop_front() {
        options.report(Stage::Directory, entries.len() as u64, queue.len() as u64);
        if options.cancelled() {
            issues.note("cancelled");
            break;
        }
        if depth >= MAX_DIRECTORY_DEPTH {
            issues.note(format!("directory depth cap reached under /{}", path));
            continue;
        }
        let start = dir.extent_lba as u64 * block;
        let end = (start + dir.data_length as u64).min(source.len());
        if start >= source.len() {
            issues.note(format!(
                "directory extent at 0x{:08x} lies past end of data",
                start
            ));
            continue;
        }
        let window = match source.slice(start, end) {
            Ok(window) => window,
            Err(error) => {
                issues.note(format!("parse aborted: {}", error));
                break;
            }
        };

        let mut pos = 0usize;
        let mut in_directory = 0usize;
        while pos < window.len() && in_directory < MAX_ENTRIES_PER_DIRECTORY {
            let length = window[pos] as usize;
            if length == 0 {
                // Records never span sector boundaries; skip the pad.
                let next_sector = (pos / block as usize + 1) * block as usize;
                if next_sector <= pos {
                    break;
                }
                pos = next_sector;
                continue;
            }
            let Some(raw) = window.get(pos..pos + length) else {
                issues.note(format!(
                    "directory record at 0x{:08x} extends past its extent",
                    start + pos as u64
                ));
                break;
            };
            let record = read_directory_record(raw, start + pos as u64, unicode, issues);
            pos += length;
            in_directory += 1;
            let Some(record) = record else { continue };
            if record.identifier == "." || record.identifier == ".." {
                continue;
            }
            let child_path = if path.is_empty() {
                record.identifier.clone()
            } else {
                format!("{}/{}", path, record.identifier)
            };
            if record.is_directory {
                if visited.insert(record.extent_lba) {
                    queue.push_back((record.clone(), child_path.clone(), depth + 1));
                } else {
                    issues.note(format!(
                        "directory extent {} revisited at /{}; loop skipped",
                        record.extent_lba, child_path
                    ));
                }
            }
            entries.push(IsoEntry { path: child_path, record, depth });
            if entries.len() >= MAX_TOTAL_ENTRIES {
                issues.note("directory walk entry cap reached");
                return entries;
            }
        }
    }
    entries
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::probe::MemorySource;

    fn both_u16(value: u16) -> [u8; 4] {
        let mut raw = [0u8; 4];
        raw[..2].copy_from_slice(&value.to_le_bytes());
        raw[2..].copy_from_slice(&value.to_be_bytes());
        raw
    }

    fn both_u32(value: u32) -> [u8; 8] {
        let mut raw = [0u8; 8];
        raw[..4].copy_from_slice(&value.to_le_bytes());
        raw[4..].copy_from_slice(&value.to_be_bytes());
        raw
    }

    fn directory_record(name: &[u8], extent: u32, size: u32, directory: bool) -> Vec<u8> {
        let length = 33 + name.len() + (33 + name.len()) % 2;
        let mut record = vec![0u8; length];
        record[0] = length as u8;
        record[2..10].copy_from_slice(&both_u32(extent));
        record[10..18].copy_from_slice(&both_u32(size));
        record[18..25].copy_from_slice(&[120, 6, 15, 10, 30, 0, 0]);
        record[25] = if directory { 0x02 } else { 0 };
        record[28..32].copy_from_slice(&both_u16(1));
        record[32] = name.len() as u8;
        record[33..33 + name.len()].copy_from_slice(name);
        record
    }

    /// A 21-sector image: PVD at LBA 16, terminator at 17, path table at
    /// 18, root directory at 19, one file extent at 20.
    pub(crate) fn tiny_volume() -> Vec<u8> {
        let mut image = vec![0u8; 21 * SECTOR_SIZE as usize];

        let pvd_at = DESCRIPTOR_START as usize;
        image[pvd_at] = 1;
        image[pvd_at + 1..pvd_at + 6].copy_from_slice(STANDARD_ID);
        image[pvd_at + 6] = 1;
        let volume_id = b"TESTDISC";
        image[pvd_at + 40..pvd_at + 40 + volume_id.len()].copy_from_slice(volume_id);
        image[pvd_at + 80..pvd_at + 88].copy_from_slice(&both_u32(21));
        image[pvd_at + 120..pvd_at + 124].copy_from_slice(&both_u16(1));
        image[pvd_at + 124..pvd_at + 128].copy_from_slice(&both_u16(1));
        image[pvd_at + 128..pvd_at + 132].copy_from_slice(&both_u16(2048));
        image[pvd_at + 132..pvd_at + 140].copy_from_slice(&both_u32(10));
        image[pvd_at + 140..pvd_at + 144].copy_from_slice(&18u32.to_le_bytes());
        let root = directory_record(&[0], 19, 2048, true);
        image[pvd_at + 156..pvd_at + 156 + root.len()].copy_from_slice(&root);
        image[pvd_at + 813..pvd_at + 829].copy_from_slice(b"2021041512300000");

        let term_at = pvd_at + SECTOR_SIZE as usize;
        image[term_at] = 255;
        image[term_at + 1..term_at + 6].copy_from_slice(STANDARD_ID);
        image[term_at + 6] = 1;

        // Type-L path table: the root record.
        let pt_at = 18 * SECTOR_SIZE as usize;
        image[pt_at] = 1; // name length
        image[pt_at + 2..pt_at + 6].copy_from_slice(&19u32.to_le_bytes());
        image[pt_at + 6..pt_at + 8].copy_from_slice(&1u16.to_le_bytes());
        image[pt_at + 8] = 0;

        // Root directory: ".", "..", and README.TXT;1.
        let dir_at = 19 * SECTOR_SIZE as usize;
        let mut pos = dir_at;
        for record in [
            directory_record(&[0], 19, 2048, true),
            directory_record(&[1], 19, 2048, true),
            directory_record(b"README.TXT;1", 20, 5, false),
        ] {
            image[pos..pos + record.len()].copy_from_slice(&record);
            pos += record.len();
        }
        image[20 * SECTOR_SIZE as usize..20 * SECTOR_SIZE as usize + 5]
            .copy_from_slice(b"hello");
        image
    }

    #[test]
    fn walks_descriptors_and_root() {
        let volume = analyze(&MemorySource::new(tiny_volume()), &ProbeOptions::default());
        assert_eq!(volume.descriptors.len(), 2);
        assert_eq!(volume.descriptors[0].kind, DescriptorKind::Primary);
        assert_eq!(volume.descriptors[1].kind, DescriptorKind::Terminator);
        let primary = volume.primary.as_ref().unwrap();
        assert_eq!(primary.volume_id, "TESTDISC");
        assert_eq!(primary.logical_block_size, 2048);
        assert_eq!(primary.creation_date.as_deref(), Some("2021-04-15T12:30:00"));
        assert!(volume.issues.is_empty());

        assert_eq!(volume.path_table.len(), 1);
        assert_eq!(volume.entries.len(), 1);
        assert_eq!(volume.entries[0].path, "README.TXT;1");
        assert_eq!(volume.entries[0].record.data_length, 5);
    }

    #[test]
    fn both_endian_mismatch_is_one_issue() {
        let mut image = tiny_volume();
        let pvd_at = DESCRIPTOR_START as usize;
        // Corrupt the BE half of the logical block size.
        image[pvd_at + 130] = 0xaa;
        let volume = analyze(&MemorySource::new(image), &ProbeOptions::default());
        let mismatches: Vec<_> = volume
            .issues
            .iter()
            .filter(|issue| issue.contains("both-endian mismatch"))
            .collect();
        assert_eq!(mismatches.len(), 1);
        assert!(mismatches[0].contains("LE 2048"));
        // LE still wins.
        assert_eq!(volume.primary.unwrap().logical_block_size, 2048);
    }

    #[test]
    fn joliet_escape_detection() {
        assert_eq!(joliet_level(b"%/@..."), Some(JolietLevel::Level1));
        assert_eq!(joliet_level(b"%/E..."), Some(JolietLevel::Level3));
        assert_eq!(joliet_level(b"..."), None);
    }
}
