//! ZIP central-directory analysis with ZIP64 support.

use log::debug;

use crate::probe::{
    dos_datetime_to_iso8601, latin1_string, ByteSource, IssueLog, ProbeOptions, Reader, Stage,
};

pub const LOCAL_FILE_HEADER: u32 = 0x0403_4B50; // PK\x03\x04
pub const CENTRAL_DIR_HEADER: u32 = 0x0201_4B50; // PK\x01\x02
pub const EOCD_SIGNATURE: u32 = 0x0605_4B50; // PK\x05\x06
pub const ZIP64_LOCATOR_SIGNATURE: u32 = 0x0706_4B50; // PK\x06\x07
pub const ZIP64_EOCD_SIGNATURE: u32 = 0x0606_4B50; // PK\x06\x06

/// EOCD can sit at most `comment(65535) + record(22)` bytes from the end.
const EOCD_SEARCH_SPAN: u64 = 65_535 + 22;

/// # End of central directory record
///
/// APPNOTE.TXT 4.3.16:
///
/// | Offset | Size | Field |
/// | ------ | ---- | ----- |
/// | 0      | 4    | Signature `PK\x05\x06` |
/// | 4      | 2    | Number of this disk |
/// | 6      | 2    | Disk where the central directory starts |
/// | 8      | 2    | Central-directory entries on this disk |
/// | 10     | 2    | Total central-directory entries |
/// | 12     | 4    | Central-directory size |
/// | 16     | 4    | Central-directory offset |
/// | 20     | 2    | Comment length |
#[derive(Debug)]
pub struct EndOfCentralDirectory {
    pub disk_number: u16,
    pub cd_start_disk: u16,
    pub entries_this_disk: u64,
    pub total_entries: u64,
    pub cd_size: u64,
    pub cd_offset: u64,
    pub comment: String,
    pub zip64: bool,
}

#[derive(Debug)]
pub struct ZipEntry {
    pub name: String,
    pub method: u16,
    pub method_label: &'static str,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub crc32: u32,
    pub modified_iso: Option<String>,
    pub local_header_offset: u64,
    /// Absolute offset of the entry's payload, confirmed against the local
    /// file header; `None` when the local header could not be validated.
    pub data_offset: Option<u64>,
    pub is_encrypted: bool,
    pub is_directory: bool,
}

#[derive(Debug)]
pub struct ZipArchive {
    pub eocd: EndOfCentralDirectory,
    pub entries: Vec<ZipEntry>,
    pub issues: Vec<String>,
}

pub fn analyze(source: &dyn ByteSource, options: &ProbeOptions<'_>) -> Option<ZipArchive> {
    debug!("zip: analyzing {} bytes", source.len());
    let mut issues = IssueLog::new();

    let (eocd_offset, tail, tail_base) = locate_eocd(source, &mut issues)?;
    let mut reader = Reader::new(&tail, tail_base);
    reader.set_pos((eocd_offset - tail_base) as usize + 4);

    let disk_number = reader.read_u16_le("eocd disk number", &mut issues)?;
    let cd_start_disk = reader.read_u16_le("eocd directory disk", &mut issues)?;
    let entries_this_disk = reader.read_u16_le("eocd entries on disk", &mut issues)? as u64;
    let total_entries_16 = reader.read_u16_le("eocd total entries", &mut issues)?;
    let cd_size_32 = reader.read_u32_le("eocd directory size", &mut issues)?;
    let cd_offset_32 = reader.read_u32_le("eocd directory offset", &mut issues)?;
    let comment_len = reader.read_u16_le("eocd comment length", &mut issues)?;
    let comment = reader
        .take(comment_len as usize, "eocd comment", &mut issues)
        .map(latin1_string)
        .unwrap_or_default();

    let mut eocd = EndOfCentralDirectory {
        disk_number,
        cd_start_disk,
        entries_this_disk,
        total_entries: total_entries_16 as u64,
        cd_size: cd_size_32 as u64,
        cd_offset: cd_offset_32 as u64,
        comment,
        zip64: false,
    };

    // The 0xFFFF / 0xFFFFFFFF sentinels demand the ZIP64 records.
    if total_entries_16 == 0xFFFF || cd_offset_32 == 0xFFFF_FFFF || cd_size_32 == 0xFFFF_FFFF {
        read_zip64_eocd(source, eocd_offset, &mut eocd, &mut issues);
    }

    let entries = walk_central_directory(source, &eocd, options, &mut issues);

    Some(ZipArchive {
        eocd,
        entries,
        issues: issues.into_entries(),
    })
}

/// Reverse scan of the trailing `65535 + 22` bytes for `PK\x05\x06`.
/// Returns the absolute EOCD offset and the tail window it was found in.
pub fn locate_eocd(
    source: &dyn ByteSource,
    issues: &mut IssueLog,
) -> Option<(u64, Vec<u8>, u64)> {
    let len = source.len();
    if len < 22 {
        return None;
    }
    let tail_base = len.saturating_sub(EOCD_SEARCH_SPAN);
    let tail = match source.slice(tail_base, len) {
        Ok(tail) => tail,
        Err(error) => {
            issues.note(format!("parse aborted: {}", error));
            return None;
        }
    };
    let signature = EOCD_SIGNATURE.to_le_bytes();
    for pos in (0..=tail.len() - 22).rev() {
        if tail[pos..pos + 4] == signature {
            return Some((tail_base + pos as u64, tail, tail_base));
        }
    }
    None
}

/// ZIP64 locator (immediately before the EOCD) and the ZIP64 EOCD record it
/// points at; 64-bit totals replace the 16/32-bit sentinels.
fn read_zip64_eocd(
    source: &dyn ByteSource,
    eocd_offset: u64,
    eocd: &mut EndOfCentralDirectory,
    issues: &mut IssueLog,
) {
    let Some(locator_offset) = eocd_offset.checked_sub(20) else {
        issues.note("zip64 sentinels present but no room for the zip64 locator");
        return;
    };
    let locator = match source.slice(locator_offset, locator_offset + 20) {
        Ok(locator) => locator,
        Err(error) => {
            issues.note(format!("parse aborted: {}", error));
            return;
        }
    };
    let mut reader = Reader::new(&locator, locator_offset);
    if reader.read_u32_le("zip64 locator signature", issues) != Some(ZIP64_LOCATOR_SIGNATURE) {
        issues.note(format!(
            "zip64 locator signature missing at 0x{:08x}",
            locator_offset
        ));
        return;
    }
    reader.skip(4, "zip64 locator disk", issues);
    let Some(zip64_offset) = reader.read_u64_le("zip64 eocd offset", issues) else {
        return;
    };

    let record = match source.slice(zip64_offset, (zip64_offset + 56).min(source.len())) {
        Ok(record) => record,
        Err(error) => {
            issues.note(format!(
                "zip64 eocd at 0x{:08x} unreadable: {}",
                zip64_offset, error
            ));
            return;
        }
    };
    let mut reader = Reader::new(&record, zip64_offset);
    if reader.read_u32_le("zip64 eocd signature", issues) != Some(ZIP64_EOCD_SIGNATURE) {
        issues.note(format!(
            "zip64 eocd signature missing at 0x{:08x}",
            zip64_offset
        ));
        return;
    }
    reader.skip(8, "zip64 eocd size", issues);
    reader.skip(2 + 2 + 4 + 4, "zip64 eocd versions and disks", issues);
    let Some(entries_this_disk) = reader.read_u64_le("zip64 entries on disk", issues) else {
        return;
    };
    let Some(total_entries) = reader.read_u64_le("zip64 total entries", issues) else {
        return;
    };
    let Some(cd_size) = reader.read_u64_le("zip64 directory size", issues) else {
        return;
    };
    let Some(cd_offset) = reader.read_u64_le("zip64 directory offset", issues) else {
        return;
    };
    eocd.entries_this_disk = entries_this_disk;
    eocd.total_entries = total_entries;
    eocd.cd_size = cd_size;
    eocd.cd_offset = cd_offset;
    eocd.zip64 = true;
}

/// # Central directory file header
///
/// APPNOTE.TXT 4.3.12, 46 fixed bytes then name/extra/comment:
///
/// | Offset | Size | Field |
/// | ------ | ---- | ----- |
/// | 0      | 4    | Signature `PK\x01\x02` |
/// | 4      | 2    | Version made by |
/// | 6      | 2    | Version needed |
/// | 8      | 2    | General-purpose flags |
/// | 10     | 2    | Compression method |
/// | 12     | 2    | Modification time (MS-DOS) |
/// | 14     | 2    | Modification date (MS-DOS) |
/// | 16     | 4    | CRC-32 |
/// | 20     | 4    | Compressed size |
/// | 24     | 4    | Uncompressed size |
/// | 28     | 2    | Name length |
/// | 30     | 2    | Extra length |
/// | 32     | 2    | Comment length |
/// | 34     | 2    | Start disk |
/// | 36     | 2    | Internal attributes |
/// | 38     | 4    | External attributes |
/// | 42     | 4    | Local header offset |
fn walk_central_directory(
    source: &dyn ByteSource,
    eocd: &EndOfCentralDirectory,
    options: &ProbeOptions<'_>,
    issues: &mut IssueLog,
) -> Vec<ZipEntry> {
    let mut entries = Vec::new();
    if eocd.total_entries == 0 {
        return entries;
    }
    let cd_end = eocd.cd_offset.saturating_add(eocd.cd_size).min(source.len());
    if eocd.cd_offset.saturating_add(eocd.cd_size) > source.len() {
        issues.note(format!(
            "central directory at 0x{:08x} extends past end of data",
            eocd.cd_offset
        ));
    }
    let window = match source.slice(eocd.cd_offset, cd_end) {
        Ok(window) => window,
        Err(error) => {
            issues.note(format!("parse aborted: {}", error));
            return entries;
        }
    };
    let mut reader = Reader::new(&window, eocd.cd_offset);

    for index in 0..eocd.total_entries {
        if index % options.yield_interval as u64 == 0 {
            options.report(Stage::Directory, reader.pos() as u64, index);
            if options.cancelled() {
                issues.note("cancelled");
                break;
            }
        }
        let at = reader.absolute();
        let Some(signature) = reader.read_u32_le("central directory signature", issues) else {
            break;
        };
        if signature != CENTRAL_DIR_HEADER {
            issues.note(format!(
                "central directory entry {} at 0x{:08x} has bad signature 0x{:08x}",
                index, at, signature
            ));
            break;
        }
        let Some(entry) = read_central_entry(&mut reader, source, issues) else {
            break;
        };
        entries.push(entry);
    }
    if (entries.len() as u64) < eocd.total_entries {
        issues.note(format!(
            "central directory walk stopped after {} of {} entries",
            entries.len(),
            eocd.total_entries
        ));
    }
    entries
}

fn read_central_entry(
    reader: &mut Reader<'_>,
    source: &dyn ByteSource,
    issues: &mut IssueLog,
) -> Option<ZipEntry> {
    reader.skip(4, "central entry versions", issues)?;
    let flags = reader.read_u16_le("central entry flags", issues)?;
    let method = reader.read_u16_le("central entry method", issues)?;
    let mod_time = reader.read_u16_le("central entry time", issues)?;
    let mod_date = reader.read_u16_le("central entry date", issues)?;
    let crc32 = reader.read_u32_le("central entry crc", issues)?;
    let mut compressed = reader.read_u32_le("central entry compressed size", issues)? as u64;
    let mut uncompressed = reader.read_u32_le("central entry uncompressed size", issues)? as u64;
    let name_len = reader.read_u16_le("central entry name length", issues)? as usize;
    let extra_len = reader.read_u16_le("central entry extra length", issues)? as usize;
    let comment_len = reader.read_u16_le("central entry comment length", issues)? as usize;
    reader.skip(2 + 2 + 4, "central entry attributes", issues)?;
    let mut local_offset = reader.read_u32_le("central entry local offset", issues)? as u64;

    let name_raw = reader.take(name_len, "central entry name", issues)?;
    // Flag bit 11: the name is UTF-8; otherwise treat as Latin-1 (CP437 in
    // the wild, close enough for identification).
    let name = if flags & 0x0800 != 0 {
        String::from_utf8_lossy(name_raw).into_owned()
    } else {
        latin1_string(name_raw)
    };

    let extra = reader.take(extra_len, "central entry extra", issues)?;
    apply_zip64_extra(extra, &mut compressed, &mut uncompressed, &mut local_offset);
    reader.skip(comment_len, "central entry comment", issues)?;

    let data_offset = confirm_local_header(source, local_offset, issues);

    Some(ZipEntry {
        is_directory: name.ends_with('/') && uncompressed == 0,
        name,
        method,
        method_label: method_label(method),
        compressed_size: compressed,
        uncompressed_size: uncompressed,
        crc32,
        modified_iso: dos_datetime_to_iso8601(mod_date, mod_time),
        local_header_offset: local_offset,
        data_offset,
        is_encrypted: flags & 0x0001 != 0,
    })
}

/// Extra field 0x0001 (ZIP64): 64-bit values for exactly the header fields
/// that hold a 0xFFFFFFFF sentinel, in uncompressed/compressed/offset order.
fn apply_zip64_extra(extra: &[u8], compressed: &mut u64, uncompressed: &mut u64, offset: &mut u64) {
    let mut pos = 0;
    while pos + 4 <= extra.len() {
        let id = u16::from_le_bytes([extra[pos], extra[pos + 1]]);
        let size = u16::from_le_bytes([extra[pos + 2], extra[pos + 3]]) as usize;
        let Some(body) = extra.get(pos + 4..pos + 4 + size) else {
            return;
        };
        if id == 0x0001 {
            let mut body_pos = 0;
            let mut next_u64 = |target: &mut u64, sentinel: bool| {
                if sentinel && body_pos + 8 <= body.len() {
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(&body[body_pos..body_pos + 8]);
                    *target = u64::from_le_bytes(raw);
                    body_pos += 8;
                }
            };
            next_u64(uncompressed, *uncompressed == 0xFFFF_FFFF);
            next_u64(compressed, *compressed == 0xFFFF_FFFF);
            next_u64(offset, *offset == 0xFFFF_FFFF);
        }
        pos += 4 + size;
    }
}

/// Reads the corresponding local file header to confirm where the entry's
/// payload starts.
fn confirm_local_header(
    source: &dyn ByteSource,
    local_offset: u64,
    issues: &mut IssueLog,
) -> Option<u64> {
    let header = source
        .slice(local_offset, local_offset.saturating_add(30).min(source.len()))
        .ok()?;
    if header.len() < 30 {
        issues.note(format!(
            "local header at 0x{:08x} extends past end of data",
            local_offset
        ));
        return None;
    }
    let mut reader = Reader::new(&header, local_offset);
    if reader.u32_le_at(0) != Some(LOCAL_FILE_HEADER) {
        issues.note(format!(
            "local header signature missing at 0x{:08x}",
            local_offset
        ));
        return None;
    }
    let name_len = reader.u16_le_at(26)? as u64;
    let extra_len = reader.u16_le_at(28)? as u64;
    Some(local_offset.saturating_add(30 + name_len + extra_len))
}

fn method_label(method: u16) -> &'static str {
    match method {
        0 => "Stored",
        1 => "Shrunk",
        6 => "Imploded",
        8 => "Deflate",
        9 => "Deflate64",
        12 => "BZip2",
        14 => "LZMA",
        93 => "Zstandard",
        95 => "XZ",
        98 => "PPMd",
        99 => "AES encrypted",
        _ => "unknown",
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::probe::{crc32, MemorySource};

    /// One stored entry plus central directory and EOCD.
    pub(crate) fn stored_archive(name: &str, body: &[u8]) -> Vec<u8> {
        let mut data = Vec::new();
        // Local file header.
        data.extend_from_slice(&LOCAL_FILE_HEADER.to_le_bytes());
        data.extend_from_slice(&20u16.to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes());
        data.extend_from_slice(&0x6000u16.to_le_bytes()); // 12:00:00
        data.extend_from_slice(&0x5021u16.to_le_bytes()); // 2020-01-01
        data.extend_from_slice(&crc32(body).to_le_bytes());
        data.extend_from_slice(&(body.len() as u32).to_le_bytes());
        data.extend_from_slice(&(body.len() as u32).to_le_bytes());
        data.extend_from_slice(&(name.len() as u16).to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes());
        data.extend_from_slice(name.as_bytes());
        let data_offset = data.len() as u64;
        data.extend_from_slice(body);

        // Central directory.
        let cd_offset = data.len() as u32;
        data.extend_from_slice(&CENTRAL_DIR_HEADER.to_le_bytes());
        data.extend_from_slice(&20u16.to_le_bytes());
        data.extend_from_slice(&20u16.to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes());
        data.extend_from_slice(&0x6000u16.to_le_bytes());
        data.extend_from_slice(&0x5021u16.to_le_bytes());
        data.extend_from_slice(&crc32(body).to_le_bytes());
        data.extend_from_slice(&(body.len() as u32).to_le_bytes());
        data.extend_from_slice(&(body.len() as u32).to_le_bytes());
        data.extend_from_slice(&(name.len() as u16).to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(name.as_bytes());
        let cd_size = data.len() as u32 - cd_offset;

        // EOCD.
        data.extend_from_slice(&EOCD_SIGNATURE.to_le_bytes());
        data.extend_from_slice(&[0u8; 4]);
        data.extend_from_slice(&1u16.to_le_bytes());
        data.extend_from_slice(&1u16.to_le_bytes());
        data.extend_from_slice(&cd_size.to_le_bytes());
        data.extend_from_slice(&cd_offset.to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes());

        assert_eq!(data_offset, 30 + name.len() as u64);
        data
    }

    #[test]
    fn empty_zip_is_just_an_eocd() {
        let mut data = vec![];
        data.extend_from_slice(&EOCD_SIGNATURE.to_le_bytes());
        data.extend_from_slice(&[0u8; 18]);
        let archive = analyze(&MemorySource::new(data), &ProbeOptions::default()).unwrap();
        assert_eq!(archive.eocd.total_entries, 0);
        assert!(archive.entries.is_empty());
        assert!(archive.issues.is_empty());
    }

    #[test]
    fn stored_entry_round_trip() {
        let data = stored_archive("hello.txt", b"Hi");
        let archive = analyze(&MemorySource::new(data), &ProbeOptions::default()).unwrap();
        assert_eq!(archive.entries.len(), 1);
        let entry = &archive.entries[0];
        assert_eq!(entry.name, "hello.txt");
        assert_eq!(entry.method_label, "Stored");
        assert_eq!(entry.uncompressed_size, 2);
        assert_eq!(entry.crc32, crc32(b"Hi"));
        assert_eq!(entry.data_offset, Some(30 + 9));
        assert_eq!(entry.modified_iso.as_deref(), Some("2020-01-01T12:00:00"));
        assert!(archive.issues.is_empty());
    }

    #[test]
    fn eocd_found_behind_comment() {
        let mut data = stored_archive("a", b"x");
        let comment = b"trailing comment";
        let eocd_comment_len = data.len() - 2;
        data[eocd_comment_len..].copy_from_slice(&(comment.len() as u16).to_le_bytes());
        data.extend_from_slice(comment);
        let archive = analyze(&MemorySource::new(data), &ProbeOptions::default()).unwrap();
        assert_eq!(archive.eocd.comment, "trailing comment");
        assert_eq!(archive.entries.len(), 1);
    }

    #[test]
    fn zip64_extra_overrides_sentinels() {
        let mut compressed = 0xFFFF_FFFFu64;
        let mut uncompressed = 0xFFFF_FFFFu64;
        let mut offset = 5u64;
        let mut extra = Vec::new();
        extra.extend_from_slice(&1u16.to_le_bytes());
        extra.extend_from_slice(&16u16.to_le_bytes());
        extra.extend_from_slice(&(1u64 << 33).to_le_bytes());
        extra.extend_from_slice(&(1u64 << 32).to_le_bytes());
        apply_zip64_extra(&extra, &mut compressed, &mut uncompressed, &mut offset);
        assert_eq!(uncompressed, 1 << 33);
        assert_eq!(compressed, 1 << 32);
        assert_eq!(offset, 5);
    }
}
