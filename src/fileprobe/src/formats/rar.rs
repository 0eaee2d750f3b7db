//! RAR archives, 4.x block format and 5.0 VInt format.

use log::debug;

use crate::probe::{
    crc32, dos_datetime_to_iso8601, latin1_string, unix_to_iso8601, ByteSource, IssueLog,
    ProbeOptions, Reader, Stage,
};

pub const SIGNATURE_V4: &[u8; 7] = b"Rar!\x1a\x07\x00";
pub const SIGNATURE_V5: &[u8; 8] = b"Rar!\x1a\x07\x01\x00";

/// Pathological block chains stop here.
const MAX_BLOCKS: u32 = 4096;

// 4.x header types.
const V4_MAIN: u8 = 0x73;
const V4_FILE: u8 = 0x74;
const V4_ENDARC: u8 = 0x7b;

// 4.x header flags.
const V4_LONG_BLOCK: u16 = 0x8000;
const LHD_LARGE: u16 = 0x0100;
const LHD_UNICODE: u16 = 0x0200;
const LHD_SALT: u16 = 0x0400;
const LHD_WINDOWMASK: u16 = 0x00e0;
const LHD_DIRECTORY: u16 = 0x00e0;
const MHD_PASSWORD: u16 = 0x0080;
const MHD_SOLID: u16 = 0x0008;
const MHD_VOLUME: u16 = 0x0001;

// 5.0 header types.
const V5_MAIN: u64 = 1;
const V5_FILE: u64 = 2;
const V5_SERVICE: u64 = 3;
const V5_ENCRYPTION: u64 = 4;
const V5_END: u64 = 5;

#[derive(Debug)]
pub struct RarEntry {
    pub name: String,
    pub pack_size: u64,
    pub unp_size: u64,
    pub crc32: Option<u32>,
    pub mtime_iso: Option<String>,
    pub method_label: &'static str,
    pub dict_size: Option<u64>,
    pub host_os: &'static str,
    pub is_directory: bool,
    pub has_salt: bool,
}

#[derive(Debug, Default)]
pub struct EndHeader {
    pub next_volume: bool,
}

#[derive(Debug)]
pub struct RarArchive {
    pub version: u8,
    pub entries: Vec<RarEntry>,
    pub is_volume: bool,
    pub is_solid: bool,
    pub headers_encrypted: bool,
    pub end_header: Option<EndHeader>,
    pub issues: Vec<String>,
}

pub fn analyze(source: &dyn ByteSource, options: &ProbeOptions<'_>) -> Option<RarArchive> {
    debug!("rar: analyzing {} bytes", source.len());
    let head = source.slice(0, source.len().min(8)).ok()?;
    if head.starts_with(SIGNATURE_V5) {
        Some(analyze_v5(source, options))
    } else if head.starts_with(SIGNATURE_V4) {
        Some(analyze_v4(source, options))
    } else {
        None
    }
}

/// # RAR 4.x block header
///
/// Every block starts with
/// (<https://codedread.github.io/bitjs/docs/unrar.html>):
///
/// | Offset | Size | Field |
/// | ------ | ---- | ----- |
/// | 0      | 2    | Header CRC16 (low half of CRC-32) |
/// | 2      | 1    | Header type |
/// | 3      | 2    | Header flags |
/// | 5      | 2    | Header size |
///
/// `LONG_BLOCK (0x8000)` appends a u32 data size; FILE blocks carry their
/// pack size instead.
fn analyze_v4(source: &dyn ByteSource, options: &ProbeOptions<'_>) -> RarArchive {
    let mut issues = IssueLog::new();
    let mut archive = RarArchive {
        version: 4,
        entries: Vec::new(),
        is_volume: false,
        is_solid: false,
        headers_encrypted: false,
        end_header: None,
        issues: Vec::new(),
    };

    let len = source.len();
    let mut offset: u64 = 7;
    for iteration in 0..MAX_BLOCKS {
        if iteration % options.yield_interval == 0 {
            options.report(Stage::Records, offset, archive.entries.len() as u64);
            if options.cancelled() {
                issues.note("cancelled");
                break;
            }
        }
        if offset + 7 > len {
            break;
        }
        let window = match source.slice(offset, (offset + 0x1_0000).min(len)) {
            Ok(window) => window,
            Err(error) => {
                issues.note(format!("parse aborted: {}", error));
                break;
            }
        };
        let mut reader = Reader::new(&window, offset);
        reader.skip(2, "block crc16", &mut issues);
        let Some(head_type) = reader.read_u8("block type", &mut issues) else { break };
        let Some(flags) = reader.read_u16_le("block flags", &mut issues) else { break };
        let Some(head_size) = reader.read_u16_le("block size", &mut issues) else { break };
        if head_size < 7 {
            issues.note(format!("block at 0x{:08x} declares size {} < 7", offset, head_size));
            break;
        }

        let mut data_size: u64 = 0;
        match head_type {
            V4_MAIN => {
                archive.is_volume = flags & MHD_VOLUME != 0;
                archive.is_solid = flags & MHD_SOLID != 0;
                archive.headers_encrypted = flags & MHD_PASSWORD != 0;
                if archive.headers_encrypted {
                    issues.note("archive headers are encrypted; further decoding not attempted");
                }
            }
            V4_FILE => {
                if let Some((entry, pack_size)) =
                    read_v4_file(&mut reader, flags, &mut issues)
                {
                    data_size = pack_size;
                    archive.entries.push(entry);
                } else {
                    break;
                }
            }
            V4_ENDARC => {
                archive.end_header = Some(EndHeader {
                    next_volume: flags & 0x0001 != 0,
                });
                break;
            }
            _ => {
                if flags & V4_LONG_BLOCK != 0 {
                    data_size = reader
                        .read_u32_le("block data size", &mut issues)
                        .unwrap_or(0) as u64;
                }
            }
        }
        if archive.headers_encrypted {
            break;
        }

        let next = offset.saturating_add(head_size as u64).saturating_add(data_size);
        if next <= offset {
            issues.note(format!("block at 0x{:08x} does not advance", offset));
            break;
        }
        offset = next;
    }

    archive.issues = issues.into_entries();
    archive
}

/// # RAR 4.x file header additions
///
/// | Offset | Size | Field |
/// | ------ | ---- | ----- |
/// | 7      | 4    | Packed size |
/// | 11     | 4    | Unpacked size |
/// | 15     | 1    | Host OS |
/// | 16     | 4    | File CRC-32 |
/// | 20     | 4    | Modification time (MS-DOS) |
/// | 24     | 1    | Version needed to unpack |
/// | 25     | 1    | Method (`0x30` + level) |
/// | 26     | 2    | Name size |
/// | 28     | 4    | File attributes |
///
/// `LHD_LARGE` prepends 32 high bits to both sizes; `LHD_SALT` appends an
/// 8-byte salt after the name.
fn read_v4_file(
    reader: &mut Reader<'_>,
    flags: u16,
    issues: &mut IssueLog,
) -> Option<(RarEntry, u64)> {
    let mut pack_size = reader.read_u32_le("packed size", issues)? as u64;
    let mut unp_size = reader.read_u32_le("unpacked size", issues)? as u64;
    let host_os = reader.read_u8("host os", issues)?;
    let file_crc = reader.read_u32_le("file crc", issues)?;
    let dos_time = reader.read_u32_le("file time", issues)?;
    reader.read_u8("unpack version", issues)?;
    let method = reader.read_u8("method", issues)?;
    let name_size = reader.read_u16_le("name size", issues)? as usize;
    let attributes = reader.read_u32_le("file attributes", issues)?;
    if flags & LHD_LARGE != 0 {
        let high_pack = reader.read_u32_le("high packed size", issues)? as u64;
        let high_unp = reader.read_u32_le("high unpacked size", issues)? as u64;
        pack_size |= high_pack << 32;
        unp_size |= high_unp << 32;
    }
    let name_raw = reader.take(name_size, "file name", issues)?;
    let name = if flags & LHD_UNICODE != 0 {
        // The name field holds "ansi\0encoded-unicode"; the ANSI half is
        // enough for identification.
        match name_raw.iter().position(|&b| b == 0) {
            Some(nul) => latin1_string(&name_raw[..nul]),
            None => String::from_utf8_lossy(name_raw).into_owned(),
        }
    } else {
        latin1_string(name_raw)
    };
    let has_salt = flags & LHD_SALT != 0;
    if has_salt {
        reader.skip(8, "salt", issues)?;
    }

    // Directory detection: window-mask says directory, or the DOS directory
    // attribute bit is set. Both signals are honored.
    let is_directory = (flags & LHD_WINDOWMASK) == LHD_DIRECTORY || attributes & 0x10 != 0;

    Some((
        RarEntry {
            name,
            pack_size,
            unp_size,
            crc32: Some(file_crc),
            mtime_iso: dos_datetime_to_iso8601((dos_time >> 16) as u16, dos_time as u16),
            method_label: v4_method_label(method),
            dict_size: None,
            host_os: v4_host_os_label(host_os),
            is_directory,
            has_salt,
        },
        pack_size,
    ))
}

fn v4_method_label(method: u8) -> &'static str {
    match method.wrapping_sub(0x30) {
        0 => "Store",
        1 => "Fastest",
        2 => "Fast",
        3 => "Normal",
        4 => "Good",
        5 => "Best",
        _ => "unknown",
    }
}

fn v4_host_os_label(host: u8) -> &'static str {
    match host {
        0 => "MS-DOS",
        1 => "OS/2",
        2 => "Windows",
        3 => "Unix",
        4 => "Mac OS",
        5 => "BeOS",
        _ => "unknown",
    }
}

/// # RAR 5.0 block layout
///
/// (<https://www.rarlab.com/technote.htm>):
///
/// ```text
/// [ header CRC32 (u32) | header size (vint) | header type (vint) |
///   header flags (vint) | extra size (vint, if flags & 0x0001) |
///   data size (vint, if flags & 0x0002) | type-specific body ]
/// ```
///
/// The CRC covers everything after the CRC field up to the end of the
/// declared header size.
fn analyze_v5(source: &dyn ByteSource, options: &ProbeOptions<'_>) -> RarArchive {
    let mut issues = IssueLog::new();
    let mut archive = RarArchive {
        version: 5,
        entries: Vec::new(),
        is_volume: false,
        is_solid: false,
        headers_encrypted: false,
        end_header: None,
        issues: Vec::new(),
    };

    let len = source.len();
    let mut offset: u64 = 8;
    for iteration in 0..MAX_BLOCKS {
        if iteration % options.yield_interval == 0 {
            options.report(Stage::Records, offset, archive.entries.len() as u64);
            if options.cancelled() {
                issues.note("cancelled");
                break;
            }
        }
        if offset + 7 > len {
            issues.note("archive ends without an END header");
            break;
        }
        let window = match source.slice(offset, (offset + 0x1_0000).min(len)) {
            Ok(window) => window,
            Err(error) => {
                issues.note(format!("parse aborted: {}", error));
                break;
            }
        };
        let mut reader = Reader::new(&window, offset);
        let Some(stored_crc) = reader.read_u32_le("header crc", &mut issues) else { break };
        let size_field_start = reader.pos();
        let Some(header_size) = reader.read_vint_rar5("header size", &mut issues) else { break };
        let body_start = reader.pos();
        let header_end = body_start + header_size as usize;
        match window.get(size_field_start..header_end) {
            Some(covered) => {
                let computed = crc32(covered);
                if computed != stored_crc {
                    issues.note(format!(
                        "header at 0x{:08x} CRC mismatch (stored 0x{:08x}, computed 0x{:08x})",
                        offset, stored_crc, computed
                    ));
                }
            }
            None => {
                issues.note(format!(
                    "header at 0x{:08x} declares size past end of data",
                    offset
                ));
                break;
            }
        }

        let Some(header_type) = reader.read_vint_rar5("header type", &mut issues) else { break };
        let Some(header_flags) = reader.read_vint_rar5("header flags", &mut issues) else { break };
        let mut data_size = 0u64;
        if header_flags & 0x0001 != 0 {
            // The extra area lies inside the declared header size.
            reader.read_vint_rar5("extra size", &mut issues);
        }
        if header_flags & 0x0002 != 0 {
            data_size = reader.read_vint_rar5("data size", &mut issues).unwrap_or(0);
        }

        match header_type {
            V5_MAIN => {
                let archive_flags = reader
                    .read_vint_rar5("archive flags", &mut issues)
                    .unwrap_or(0);
                archive.is_volume = archive_flags & 0x0001 != 0;
                archive.is_solid = archive_flags & 0x0004 != 0;
            }
            V5_FILE | V5_SERVICE => {
                if let Some(entry) =
                    read_v5_file(&mut reader, header_flags, data_size, &mut issues)
                {
                    if header_type == V5_FILE {
                        archive.entries.push(entry);
                    }
                }
            }
            V5_ENCRYPTION => {
                archive.headers_encrypted = true;
                issues.note("archive headers are encrypted; further decoding not attempted");
                break;
            }
            V5_END => {
                let end_flags = reader.read_vint_rar5("end flags", &mut issues).unwrap_or(0);
                archive.end_header = Some(EndHeader {
                    next_volume: end_flags & 0x0001 != 0,
                });
                break;
            }
            _ => {}
        }

        let next = offset.saturating_add(header_end as u64).saturating_add(data_size);
        if next <= offset {
            issues.note(format!("block at 0x{:08x} does not advance", offset));
            break;
        }
        offset = next;
    }

    archive.issues = issues.into_entries();
    archive
}

/// RAR 5.0 file header body: file flags, unpacked size, attributes,
/// optional mtime/CRC, compression info, host OS, then the UTF-8 name.
fn read_v5_file(
    reader: &mut Reader<'_>,
    _header_flags: u64,
    data_size: u64,
    issues: &mut IssueLog,
) -> Option<RarEntry> {
    let file_flags = reader.read_vint_rar5("file flags", issues)?;
    let unp_size = reader.read_vint_rar5("unpacked size", issues)?;
    let attributes = reader.read_vint_rar5("file attributes", issues)?;
    let mut mtime_iso = None;
    if file_flags & 0x0002 != 0 {
        let unix = reader.read_u32_le("modification time", issues)?;
        mtime_iso = unix_to_iso8601(unix as i64);
    }
    let mut data_crc = None;
    if file_flags & 0x0004 != 0 {
        data_crc = Some(reader.read_u32_le("data crc", issues)?);
    }
    let comp_info = reader.read_vint_rar5("compression info", issues)?;
    let host_os = reader.read_vint_rar5("host os", issues)?;
    let name_len = reader.read_vint_rar5("name length", issues)? as usize;
    let name_raw = reader.take(name_len, "file name", issues)?;

    // Compression info bits: 0..5 algorithm version, 6 solid, 7..9 method,
    // 10..14 dictionary size exponent; algorithm version 1 (RAR7) adds a
    // 5-bit fractional dictionary multiplier at 15..19.
    let algo_version = comp_info & 0x3f;
    let method = ((comp_info >> 7) & 0x07) as u8;
    let dict_exp = (comp_info >> 10) & 0x1f;
    let mut dict_size = 0x0002_0000u64 << dict_exp;
    if algo_version == 1 {
        let fraction = (comp_info >> 15) & 0x1f;
        dict_size += (dict_size / 32) * fraction;
    }

    let is_directory = file_flags & 0x0001 != 0 || attributes & 0x10 != 0;

    Some(RarEntry {
        name: String::from_utf8_lossy(name_raw).into_owned(),
        pack_size: data_size,
        unp_size,
        crc32: data_crc,
        mtime_iso,
        method_label: v5_method_label(method),
        dict_size: (!is_directory).then_some(dict_size),
        host_os: match host_os {
            0 => "Windows",
            1 => "Unix",
            _ => "unknown",
        },
        is_directory,
        has_salt: false,
    })
}

fn v5_method_label(method: u8) -> &'static str {
    match method {
        0 => "Store",
        1 => "Fastest",
        2 => "Fast",
        3 => "Normal",
        4 => "Good",
        5 => "Best",
        _ => "unknown",
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::probe::MemorySource;

    fn vint(mut value: u64) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let low = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                out.push(low);
                break;
            }
            out.push(low | 0x80);
        }
        out
    }

    fn v5_block(header_type: u64, flags: u64, body: &[u8], data: &[u8]) -> Vec<u8> {
        let mut inner = Vec::new();
        inner.extend_from_slice(&vint(header_type));
        inner.extend_from_slice(&vint(flags));
        if flags & 0x0002 != 0 {
            inner.extend_from_slice(&vint(data.len() as u64));
        }
        inner.extend_from_slice(body);

        let mut covered = vint(inner.len() as u64);
        covered.extend_from_slice(&inner);
        let mut block = crc32(&covered).to_le_bytes().to_vec();
        block.extend_from_slice(&covered);
        block.extend_from_slice(data);
        block
    }

    /// One stored file "note.txt" containing "Hi".
    pub(crate) fn stored_v5_archive() -> Vec<u8> {
        let mut data = SIGNATURE_V5.to_vec();
        data.extend_from_slice(&v5_block(V5_MAIN, 0, &vint(0), &[]));

        let mut file_body = Vec::new();
        file_body.extend_from_slice(&vint(0x0004)); // file flags: CRC present
        file_body.extend_from_slice(&vint(2)); // unpacked size
        file_body.extend_from_slice(&vint(0x20)); // attributes
        file_body.extend_from_slice(&crc32(b"Hi").to_le_bytes());
        file_body.extend_from_slice(&vint(0)); // compression info: store
        file_body.extend_from_slice(&vint(1)); // host os: unix
        file_body.extend_from_slice(&vint(8)); // name length
        file_body.extend_from_slice(b"note.txt");
        data.extend_from_slice(&v5_block(V5_FILE, 0x0002, &file_body, b"Hi"));

        data.extend_from_slice(&v5_block(V5_END, 0, &vint(0), &[]));
        data
    }

    #[test]
    fn v5_stored_file_round_trip() {
        let archive =
            analyze(&MemorySource::new(stored_v5_archive()), &ProbeOptions::default()).unwrap();
        assert_eq!(archive.version, 5);
        assert_eq!(archive.entries.len(), 1);
        let entry = &archive.entries[0];
        assert_eq!(entry.name, "note.txt");
        assert_eq!(entry.pack_size, 2);
        assert_eq!(entry.crc32, Some(0x91A4_B76D));
        assert_eq!(entry.method_label, "Store");
        assert!(!archive.end_header.as_ref().unwrap().next_volume);
        assert!(archive.issues.is_empty());
    }

    #[test]
    fn v5_header_crc_mismatch_is_nonfatal() {
        let mut data = stored_v5_archive();
        data[8] ^= 0xff; // corrupt the MAIN header CRC
        let archive = analyze(&MemorySource::new(data), &ProbeOptions::default()).unwrap();
        assert_eq!(archive.entries.len(), 1);
        assert!(archive.issues.iter().any(|issue| issue.contains("CRC mismatch")));
    }

    #[test]
    fn v4_file_block_walk() {
        let mut data = SIGNATURE_V4.to_vec();
        // MAIN header: crc16, type, flags, size (13 bytes incl. reserved).
        let main = [0u8, 0, V4_MAIN, 0, 0, 13, 0, 0, 0, 0, 0, 0, 0];
        data.extend_from_slice(&main);

        let name = b"doc.txt";
        let head_size = 7u16 + 25 + name.len() as u16;
        let mut file = Vec::new();
        file.extend_from_slice(&[0u8, 0]); // crc16
        file.push(V4_FILE);
        file.extend_from_slice(&0u16.to_le_bytes()); // flags
        file.extend_from_slice(&head_size.to_le_bytes());
        file.extend_from_slice(&2u32.to_le_bytes()); // packed
        file.extend_from_slice(&2u32.to_le_bytes()); // unpacked
        file.push(2); // host os: windows
        file.extend_from_slice(&crc32(b"Hi").to_le_bytes());
        file.extend_from_slice(&0x5021_6000u32.to_le_bytes()); // dos time
        file.push(29);
        file.push(0x30); // store
        file.extend_from_slice(&(name.len() as u16).to_le_bytes());
        file.extend_from_slice(&0u32.to_le_bytes()); // attributes
        file.extend_from_slice(name);
        data.extend_from_slice(&file);
        data.extend_from_slice(b"Hi");

        // ENDARC.
        data.extend_from_slice(&[0u8, 0, V4_ENDARC, 0, 0, 7, 0]);

        let archive = analyze(&MemorySource::new(data), &ProbeOptions::default()).unwrap();
        assert_eq!(archive.version, 4);
        assert_eq!(archive.entries.len(), 1);
        assert_eq!(archive.entries[0].name, "doc.txt");
        assert_eq!(archive.entries[0].method_label, "Store");
        assert_eq!(archive.entries[0].host_os, "Windows");
        assert!(!archive.entries[0].is_directory);
        assert!(archive.end_header.is_some());
    }

    #[test]
    fn v5_walker_terminates_on_signature_only() {
        let archive = analyze(
            &MemorySource::new(SIGNATURE_V5.to_vec()),
            &ProbeOptions::default(),
        )
        .unwrap();
        assert!(archive.entries.is_empty());
        assert!(archive.end_header.is_none());
        assert!(archive.issues.iter().any(|issue| issue.contains("END header")));
    }
}
