//! 7z archives: start header, next-header TLV database, coder graphs and
//! the derived per-file view.

use log::debug;

use crate::probe::{
    crc32, filetime_to_iso8601, utf16le_string, ByteSource, IssueLog, ProbeOptions, Reader,
};

pub const SIGNATURE: &[u8; 6] = b"7z\xbc\xaf\x27\x1c";

// Next-header property ids.
const K_END: u64 = 0x00;
const K_HEADER: u64 = 0x01;
const K_ARCHIVE_PROPERTIES: u64 = 0x02;
const K_ADDITIONAL_STREAMS: u64 = 0x03;
const K_MAIN_STREAMS: u64 = 0x04;
const K_FILES_INFO: u64 = 0x05;
const K_PACK_INFO: u64 = 0x06;
const K_UNPACK_INFO: u64 = 0x07;
const K_SUBSTREAMS_INFO: u64 = 0x08;
const K_SIZE: u64 = 0x09;
const K_CRC: u64 = 0x0a;
const K_FOLDER: u64 = 0x0b;
const K_CODERS_UNPACK_SIZE: u64 = 0x0c;
const K_NUM_UNPACK_STREAM: u64 = 0x0d;
const K_EMPTY_STREAM: u64 = 0x0e;
const K_EMPTY_FILE: u64 = 0x0f;
const K_ANTI: u64 = 0x10;
const K_NAME: u64 = 0x11;
const K_MTIME: u64 = 0x14;
const K_WIN_ATTRIBUTES: u64 = 0x15;
const K_ENCODED_HEADER: u64 = 0x17;
const K_DUMMY: u64 = 0x19;

const AES_METHOD_ID: &str = "06f10701";

/// Guards against absurd declared counts before any allocation.
const MAX_COUNT: u64 = 1 << 20;

/// # Signature header
///
/// (<https://py7zr.readthedocs.io/en/latest/archive_format.html>):
///
/// | Offset | Size | Field |
/// | ------ | ---- | ----- |
/// | 0      | 6    | Signature `7z BC AF 27 1C` |
/// | 6      | 1    | Version major (0) |
/// | 7      | 1    | Version minor (4) |
/// | 8      | 4    | Start-header CRC-32 |
/// | 12     | 8    | Next-header offset (from byte 32) |
/// | 20     | 8    | Next-header size |
/// | 28     | 4    | Next-header CRC-32 |
#[derive(Debug)]
pub struct StartHeader {
    pub version_major: u8,
    pub version_minor: u8,
    pub next_header_offset: u64,
    pub next_header_size: u64,
    pub next_header_crc: u32,
    pub crc_valid: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextHeaderKind {
    /// Plain `kHeader` database.
    Header,
    /// `kEncodedHeader`: the database itself is compressed or encrypted.
    Encoded,
    Missing,
}

#[derive(Debug, Default)]
pub struct PackInfo {
    /// Absolute offset of the first packed stream (32 + pack position).
    pub pack_start: u64,
    pub sizes: Vec<u64>,
    pub crcs: Vec<Option<u32>>,
}

/// One stage of a folder's compression pipeline.
#[derive(Debug)]
pub struct Coder {
    /// Method id in lowercase hex, e.g. `030101`.
    pub method_id: String,
    pub method_label: Option<&'static str>,
    pub num_in_streams: u64,
    pub num_out_streams: u64,
    pub properties: Vec<u8>,
}

/// A folder is a connected coder graph, not a filesystem directory.
#[derive(Debug, Default)]
pub struct Folder {
    pub coders: Vec<Coder>,
    /// `(in_index, out_index)` connections; there are `total_out - 1`.
    pub bind_pairs: Vec<(u64, u64)>,
    pub packed_indices: Vec<u64>,
    pub unpack_sizes: Vec<u64>,
    pub crc: Option<u32>,
    pub num_unpack_streams: u64,
}

impl Folder {
    fn total_out(&self) -> u64 {
        self.coders.iter().map(|coder| coder.num_out_streams).sum()
    }

    /// The folder's final unpacked size is the size of the output stream
    /// that no bind pair consumes.
    pub fn unpack_size(&self) -> u64 {
        let mut out_index = 0u64;
        for coder in &self.coders {
            for _ in 0..coder.num_out_streams {
                if !self.bind_pairs.iter().any(|&(_, out)| out == out_index) {
                    return self
                        .unpack_sizes
                        .get(out_index as usize)
                        .copied()
                        .unwrap_or(0);
                }
                out_index += 1;
            }
        }
        self.unpack_sizes.last().copied().unwrap_or(0)
    }

    pub fn is_encrypted(&self) -> bool {
        self.coders.iter().any(|coder| coder.method_id == AES_METHOD_ID)
    }
}

#[derive(Debug, Default)]
pub struct SubStreamsInfo {
    pub num_unpack_streams: Vec<u64>,
    pub sizes: Vec<u64>,
    pub crcs: Vec<Option<u32>>,
}

#[derive(Debug, Default)]
pub struct FilesInfo {
    pub file_count: u64,
    pub names: Vec<String>,
    pub empty_stream: Vec<bool>,
    pub empty_file: Vec<bool>,
    pub anti: Vec<bool>,
    pub mtimes: Vec<Option<String>>,
    pub attributes: Vec<Option<u32>>,
}

/// Folded per-file view over folders, substreams and FilesInfo.
#[derive(Debug)]
pub struct FileSummary {
    pub name: String,
    pub size: u64,
    pub crc: Option<u32>,
    pub folder_index: Option<usize>,
    /// Meaningful only when the folder holds a single substream.
    pub packed_size: Option<u64>,
    pub encrypted: bool,
    pub compression_ratio: Option<f64>,
    pub is_directory: bool,
    pub is_anti: bool,
    pub mtime_iso: Option<String>,
}

#[derive(Debug, Default)]
pub struct ArchiveFlags {
    pub is_solid: bool,
    pub header_encrypted: bool,
    pub has_encrypted_content: bool,
}

#[derive(Debug)]
pub struct SevenZipArchive {
    pub start_header: StartHeader,
    pub next_header_kind: NextHeaderKind,
    pub pack_info: Option<PackInfo>,
    pub folders: Vec<Folder>,
    pub sub_streams: Option<SubStreamsInfo>,
    pub files_info: Option<FilesInfo>,
    pub files: Vec<FileSummary>,
    pub flags: ArchiveFlags,
    pub issues: Vec<String>,
}

pub fn analyze(source: &dyn ByteSource, _options: &ProbeOptions<'_>) -> Option<SevenZipArchive> {
    debug!("7z: analyzing {} bytes", source.len());
    let mut issues = IssueLog::new();

    let head = source.slice(0, source.len().min(32)).ok()?;
    if head.len() < 32 || !head.starts_with(SIGNATURE) {
        return None;
    }
    let mut reader = Reader::new(&head, 0);
    reader.set_pos(6);
    let version_major = reader.read_u8("version major", &mut issues)?;
    let version_minor = reader.read_u8("version minor", &mut issues)?;
    let stored_crc = reader.read_u32_le("start header crc", &mut issues)?;
    let crc_valid = crc32(&head[12..32]) == stored_crc;
    if !crc_valid {
        issues.note(format!(
            "start header CRC mismatch (stored 0x{:08x}, computed 0x{:08x})",
            stored_crc,
            crc32(&head[12..32])
        ));
    }
    let next_header_offset = reader.read_u64_le("next header offset", &mut issues)?;
    let next_header_size = reader.read_u64_le("next header size", &mut issues)?;
    let next_header_crc = reader.read_u32_le("next header crc", &mut issues)?;

    let start_header = StartHeader {
        version_major,
        version_minor,
        next_header_offset,
        next_header_size,
        next_header_crc,
        crc_valid,
    };

    let mut archive = SevenZipArchive {
        start_header,
        next_header_kind: NextHeaderKind::Missing,
        pack_info: None,
        folders: Vec::new(),
        sub_streams: None,
        files_info: None,
        files: Vec::new(),
        flags: ArchiveFlags::default(),
        issues: Vec::new(),
    };

    let next_at = 32u64.checked_add(next_header_offset);
    let next_end = next_at.and_then(|at| at.checked_add(next_header_size));
    match (next_at, next_end) {
        (Some(at), Some(end)) if end <= source.len() && next_header_size > 0 => {
            match source.slice(at, end) {
                Ok(next_header) => {
                    let computed = crc32(&next_header);
                    if computed != next_header_crc {
                        issues.note(format!(
                            "next header CRC mismatch (stored 0x{:08x}, computed 0x{:08x})",
                            next_header_crc, computed
                        ));
                    }
                    read_next_header(&next_header, at, &mut archive, &mut issues);
                }
                Err(error) => issues.note(format!("parse aborted: {}", error)),
            }
        }
        _ => issues.note(format!(
            "next header at 0x{:08x}+0x{:x} lies past end of data",
            32 + next_header_offset,
            next_header_size
        )),
    }

    if let Some(sub) = &archive.sub_streams {
        for (folder, &count) in archive.folders.iter_mut().zip(&sub.num_unpack_streams) {
            folder.num_unpack_streams = count;
        }
    }
    derive_files(&mut archive);
    archive.flags.header_encrypted = archive.next_header_kind == NextHeaderKind::Encoded;
    archive.flags.has_encrypted_content = archive.folders.iter().any(Folder::is_encrypted);

    archive.issues = issues.into_entries();
    Some(archive)
}

fn read_next_header(
    window: &[u8],
    base: u64,
    archive: &mut SevenZipArchive,
    issues: &mut IssueLog,
) {
    let mut reader = Reader::new(window, base);
    let Some(id) = reader.read_vint_7z("header id", issues) else { return };
    match id {
        K_HEADER => {
            archive.next_header_kind = NextHeaderKind::Header;
            read_header_sections(&mut reader, archive, issues);
        }
        K_ENCODED_HEADER => {
            archive.next_header_kind = NextHeaderKind::Encoded;
            issues.note("next header is encoded (compressed or encrypted); not decoded");
        }
        other => {
            issues.note(format!("unexpected next header id 0x{:02x}", other));
        }
    }
}

fn read_header_sections(
    reader: &mut Reader<'_>,
    archive: &mut SevenZipArchive,
    issues: &mut IssueLog,
) {
    loop {
        let before = reader.pos();
        let Some(id) = reader.read_vint_7z("section id", issues) else { return };
        match id {
            K_END => return,
            K_ARCHIVE_PROPERTIES => skip_archive_properties(reader, issues),
            K_ADDITIONAL_STREAMS | K_MAIN_STREAMS => {
                read_streams_info(reader, archive, issues, id == K_MAIN_STREAMS);
            }
            K_FILES_INFO => {
                archive.files_info = read_files_info(reader, issues);
            }
            other => {
                issues.note(format!(
                    "unknown header section 0x{:02x} at 0x{:08x}; walk stopped",
                    other,
                    reader.absolute()
                ));
                return;
            }
        }
        if reader.pos() <= before {
            issues.note("header section walk does not advance");
            return;
        }
    }
}

fn skip_archive_properties(reader: &mut Reader<'_>, issues: &mut IssueLog) {
    loop {
        let Some(prop_type) = reader.read_vint_7z("archive property type", issues) else {
            return;
        };
        if prop_type == K_END {
            return;
        }
        let Some(size) = reader.read_vint_7z("archive property size", issues) else { return };
        if reader.skip(size as usize, "archive property", issues).is_none() {
            return;
        }
    }
}

fn read_streams_info(
    reader: &mut Reader<'_>,
    archive: &mut SevenZipArchive,
    issues: &mut IssueLog,
    main: bool,
) {
    loop {
        let Some(id) = reader.read_vint_7z("streams info id", issues) else { return };
        match id {
            K_END => return,
            K_PACK_INFO => {
                let pack = read_pack_info(reader, issues);
                if main {
                    archive.pack_info = pack;
                }
            }
            K_UNPACK_INFO => {
                let folders = read_unpack_info(reader, issues);
                if main {
                    archive.folders = folders;
                }
            }
            K_SUBSTREAMS_INFO => {
                let sub = read_substreams_info(reader, &archive.folders, issues);
                if main {
                    archive.sub_streams = Some(sub);
                }
            }
            other => {
                issues.note(format!("unknown streams info section 0x{:02x}", other));
                return;
            }
        }
    }
}

fn read_pack_info(reader: &mut Reader<'_>, issues: &mut IssueLog) -> Option<PackInfo> {
    let pack_pos = reader.read_vint_7z("pack position", issues)?;
    let count = reader.read_vint_7z("pack stream count", issues)?;
    if count > MAX_COUNT {
        issues.note(format!("pack stream count {} is implausible", count));
        return None;
    }
    let mut info = PackInfo {
        pack_start: 32u64.saturating_add(pack_pos),
        sizes: Vec::new(),
        crcs: vec![None; count as usize],
    };
    loop {
        let id = reader.read_vint_7z("pack info id", issues)?;
        match id {
            K_END => break,
            K_SIZE => {
                for _ in 0..count {
                    info.sizes.push(reader.read_vint_7z("pack size", issues)?);
                }
            }
            K_CRC => {
                info.crcs = read_digests(reader, count as usize, issues)?;
            }
            other => {
                issues.note(format!("unknown pack info section 0x{:02x}", other));
                return Some(info);
            }
        }
    }
    Some(info)
}

/// Optional digest set: `all_defined u8`, else a defined bitmap, then a
/// u32 CRC per defined entry.
fn read_digests(
    reader: &mut Reader<'_>,
    count: usize,
    issues: &mut IssueLog,
) -> Option<Vec<Option<u32>>> {
    let all_defined = reader.read_u8("digests defined flag", issues)?;
    let defined = if all_defined != 0 {
        vec![true; count]
    } else {
        read_bit_vector(reader, count, issues)?
    };
    let mut digests = Vec::with_capacity(count);
    for &is_defined in &defined {
        if is_defined {
            digests.push(Some(reader.read_u32_le("digest", issues)?));
        } else {
            digests.push(None);
        }
    }
    Some(digests)
}

/// MSB-first bit vector of `count` bits.
fn read_bit_vector(
    reader: &mut Reader<'_>,
    count: usize,
    issues: &mut IssueLog,
) -> Option<Vec<bool>> {
    let bytes = reader.take(count.div_ceil(8), "bit vector", issues)?;
    let mut bits = Vec::with_capacity(count);
    for index in 0..count {
        bits.push(bytes[index / 8] & (0x80 >> (index % 8)) != 0);
    }
    Some(bits)
}

fn read_unpack_info(reader: &mut Reader<'_>, issues: &mut IssueLog) -> Vec<Folder> {
    let mut folders = Vec::new();
    let Some(id) = reader.read_vint_7z("unpack info id", issues) else { return folders };
    if id != K_FOLDER {
        issues.note(format!("unpack info starts with 0x{:02x}, expected kFolder", id));
        return folders;
    }
    let Some(count) = reader.read_vint_7z("folder count", issues) else { return folders };
    if count > MAX_COUNT {
        issues.note(format!("folder count {} is implausible", count));
        return folders;
    }
    let Some(external) = reader.read_u8("folders external flag", issues) else { return folders };
    if external != 0 {
        issues.note("external folder definitions are not supported");
        return folders;
    }
    for _ in 0..count {
        match read_folder(reader, issues) {
            Some(folder) => folders.push(folder),
            None => return folders,
        }
    }

    // kCodersUnpackSize: one size per coder output stream, per folder.
    loop {
        let Some(id) = reader.read_vint_7z("unpack info id", issues) else { return folders };
        match id {
            K_END => break,
            K_CODERS_UNPACK_SIZE => {
                for folder in folders.iter_mut() {
                    for _ in 0..folder.total_out() {
                        match reader.read_vint_7z("coder unpack size", issues) {
                            Some(size) => folder.unpack_sizes.push(size),
                            None => return folders,
                        }
                    }
                }
            }
            K_CRC => {
                if let Some(digests) = read_digests(reader, folders.len(), issues) {
                    for (folder, crc) in folders.iter_mut().zip(digests) {
                        folder.crc = crc;
                    }
                }
            }
            other => {
                issues.note(format!("unknown unpack info section 0x{:02x}", other));
                break;
            }
        }
    }
    folders
}

/// Coder flag byte: low nibble is the method-id length, 0x10 marks complex
/// (explicit stream counts), 0x20 marks attached properties.
fn read_folder(reader: &mut Reader<'_>, issues: &mut IssueLog) -> Option<Folder> {
    let num_coders = reader.read_vint_7z("coder count", issues)?;
    if num_coders == 0 || num_coders > 64 {
        issues.note(format!("folder declares {} coders", num_coders));
        return None;
    }
    let mut folder = Folder::default();
    let mut total_in = 0u64;
    for _ in 0..num_coders {
        let flags = reader.read_u8("coder flags", issues)?;
        let id_len = (flags & 0x0f) as usize;
        let id_raw = reader.take(id_len, "coder method id", issues)?;
        let method_id: String = id_raw.iter().map(|b| format!("{:02x}", b)).collect();
        let (num_in, num_out) = if flags & 0x10 != 0 {
            (
                reader.read_vint_7z("coder input count", issues)?,
                reader.read_vint_7z("coder output count", issues)?,
            )
        } else {
            (1, 1)
        };
        let properties = if flags & 0x20 != 0 {
            let size = reader.read_vint_7z("coder property size", issues)?;
            reader.take(size as usize, "coder properties", issues)?.to_vec()
        } else {
            Vec::new()
        };
        total_in += num_in;
        folder.coders.push(Coder {
            method_label: method_label(&method_id),
            method_id,
            num_in_streams: num_in,
            num_out_streams: num_out,
            properties,
        });
    }

    let total_out = folder.total_out();
    for _ in 1..total_out {
        let in_index = reader.read_vint_7z("bind pair input", issues)?;
        let out_index = reader.read_vint_7z("bind pair output", issues)?;
        folder.bind_pairs.push((in_index, out_index));
    }
    let num_packed = total_in - folder.bind_pairs.len() as u64;
    if num_packed == 1 {
        // The single packed stream is the input no bind pair feeds.
        let mut packed = 0u64;
        for in_index in 0..total_in {
            if !folder.bind_pairs.iter().any(|&(input, _)| input == in_index) {
                packed = in_index;
                break;
            }
        }
        folder.packed_indices.push(packed);
    } else {
        for _ in 0..num_packed {
            folder
                .packed_indices
                .push(reader.read_vint_7z("packed stream index", issues)?);
        }
    }
    folder.num_unpack_streams = 1;
    Some(folder)
}

fn read_substreams_info(
    reader: &mut Reader<'_>,
    folders: &[Folder],
    issues: &mut IssueLog,
) -> SubStreamsInfo {
    let mut info = SubStreamsInfo {
        num_unpack_streams: vec![1; folders.len()],
        sizes: Vec::new(),
        crcs: Vec::new(),
    };
    loop {
        let Some(id) = reader.read_vint_7z("substreams id", issues) else { return info };
        match id {
            K_END => break,
            K_NUM_UNPACK_STREAM => {
                info.num_unpack_streams.clear();
                for _ in 0..folders.len() {
                    match reader.read_vint_7z("substream count", issues) {
                        Some(count) => info.num_unpack_streams.push(count),
                        None => return info,
                    }
                }
            }
            K_SIZE => {
                // Sizes are stored for all but the last substream of each
                // folder; the last is the folder remainder.
                for (folder, &count) in folders.iter().zip(&info.num_unpack_streams) {
                    let mut consumed = 0u64;
                    for _ in 1..count {
                        let Some(size) = reader.read_vint_7z("substream size", issues) else {
                            return info;
                        };
                        consumed += size;
                        info.sizes.push(size);
                    }
                    if count > 0 {
                        info.sizes
                            .push(folder.unpack_size().saturating_sub(consumed));
                    }
                }
            }
            K_CRC => {
                // The digest bitmap covers every substream that lacks an
                // inherited folder CRC, sized by the total stream count.
                let total_streams: u64 = info.num_unpack_streams.iter().sum();
                let mut unknown = 0usize;
                for (folder, &count) in folders.iter().zip(&info.num_unpack_streams) {
                    if count != 1 || folder.crc.is_none() {
                        unknown += count as usize;
                    }
                }
                if unknown as u64 > total_streams {
                    issues.note("substream digest bitmap exceeds total stream count");
                }
                let Some(digests) = read_digests(reader, unknown, issues) else { return info };
                let mut digest_iter = digests.into_iter();
                for (folder, &count) in folders.iter().zip(&info.num_unpack_streams) {
                    if count == 1 && folder.crc.is_some() {
                        info.crcs.push(folder.crc);
                    } else {
                        for _ in 0..count {
                            info.crcs.push(digest_iter.next().flatten());
                        }
                    }
                }
            }
            other => {
                issues.note(format!("unknown substreams section 0x{:02x}", other));
                return info;
            }
        }
    }
    if info.sizes.is_empty() {
        // Single-substream folders default to the folder size.
        for (folder, &count) in folders.iter().zip(&info.num_unpack_streams) {
            if count == 1 {
                info.sizes.push(folder.unpack_size());
            }
        }
    }
    if info.crcs.is_empty() {
        for (folder, &count) in folders.iter().zip(&info.num_unpack_streams) {
            if count == 1 {
                info.crcs.push(folder.crc);
            }
        }
    }
    info
}

/// # FilesInfo (0x05)
///
/// `numFiles`, then `[property id | size | body]` records until `kEnd`:
/// empty-stream bits (0x0e), empty-file bits (0x0f), anti bits (0x10),
/// UTF-16LE names (0x11), FILETIME vectors (0x14), attributes (0x15).
fn read_files_info(reader: &mut Reader<'_>, issues: &mut IssueLog) -> Option<FilesInfo> {
    let file_count = reader.read_vint_7z("file count", issues)?;
    if file_count > MAX_COUNT {
        issues.note(format!("file count {} is implausible", file_count));
        return None;
    }
    let count = file_count as usize;
    let mut info = FilesInfo {
        file_count,
        names: Vec::new(),
        empty_stream: vec![false; count],
        empty_file: vec![false; count],
        anti: vec![false; count],
        mtimes: vec![None; count],
        attributes: vec![None; count],
    };

    loop {
        let prop = reader.read_vint_7z("files property id", issues)?;
        if prop == K_END {
            break;
        }
        let size = reader.read_vint_7z("files property size", issues)? as usize;
        let body = reader.take(size, "files property body", issues)?;
        let mut body_reader = Reader::new(body, 0);
        match prop {
            K_EMPTY_STREAM => {
                if let Some(bits) = read_bit_vector(&mut body_reader, count, issues) {
                    info.empty_stream = bits;
                }
            }
            K_EMPTY_FILE => {
                let empty_count = info.empty_stream.iter().filter(|&&b| b).count();
                if let Some(bits) = read_bit_vector(&mut body_reader, empty_count, issues) {
                    let mut bit_iter = bits.into_iter();
                    for (index, &empty) in info.empty_stream.iter().enumerate() {
                        if empty {
                            info.empty_file[index] = bit_iter.next().unwrap_or(false);
                        }
                    }
                }
            }
            K_ANTI => {
                let empty_count = info.empty_stream.iter().filter(|&&b| b).count();
                if let Some(bits) = read_bit_vector(&mut body_reader, empty_count, issues) {
                    let mut bit_iter = bits.into_iter();
                    for (index, &empty) in info.empty_stream.iter().enumerate() {
                        if empty {
                            info.anti[index] = bit_iter.next().unwrap_or(false);
                        }
                    }
                }
            }
            K_NAME => {
                let external = body_reader.read_u8("names external flag", issues)?;
                if external != 0 {
                    issues.note("external file names are not supported");
                } else {
                    info.names = split_utf16_names(body_reader.bytes().get(1..).unwrap_or(&[]));
                    if info.names.len() != count {
                        issues.note(format!(
                            "name table holds {} names for {} files",
                            info.names.len(),
                            count
                        ));
                    }
                }
            }
            K_MTIME => {
                read_time_vector(&mut body_reader, &mut info.mtimes, issues);
            }
            K_WIN_ATTRIBUTES => {
                let defined = read_defined_vector(&mut body_reader, count, issues);
                body_reader.read_u8("attributes external flag", issues);
                for (index, is_defined) in defined.into_iter().enumerate() {
                    if is_defined {
                        info.attributes[index] =
                            body_reader.read_u32_le("attribute", issues);
                    }
                }
            }
            K_DUMMY => {}
            other => {
                issues.note(format!("unknown files property 0x{:02x} skipped", other));
            }
        }
    }
    Some(info)
}

fn read_defined_vector(
    reader: &mut Reader<'_>,
    count: usize,
    issues: &mut IssueLog,
) -> Vec<bool> {
    let all_defined = reader.read_u8("defined flag", issues).unwrap_or(0);
    if all_defined != 0 {
        vec![true; count]
    } else {
        read_bit_vector(reader, count, issues).unwrap_or_else(|| vec![false; count])
    }
}

fn read_time_vector(
    reader: &mut Reader<'_>,
    out: &mut [Option<String>],
    issues: &mut IssueLog,
) {
    let defined = read_defined_vector(reader, out.len(), issues);
    let external = reader.read_u8("times external flag", issues).unwrap_or(0);
    if external != 0 {
        issues.note("external time vectors are not supported");
        return;
    }
    for (slot, is_defined) in out.iter_mut().zip(defined) {
        if is_defined {
            if let Some(filetime) = reader.read_u64_le("file time", issues) {
                *slot = filetime_to_iso8601(filetime);
            }
        }
    }
}

/// Names are UTF-16LE, NUL-separated, in file order.
fn split_utf16_names(raw: &[u8]) -> Vec<String> {
    let mut names = Vec::new();
    let mut start = 0;
    let mut index = 0;
    while index + 1 < raw.len() {
        if raw[index] == 0 && raw[index + 1] == 0 {
            names.push(utf16le_string(&raw[start..index], (index - start) / 2));
            start = index + 2;
        }
        index += 2;
    }
    if start < raw.len() {
        names.push(utf16le_string(&raw[start..], (raw.len() - start) / 2));
    }
    names
}

/// Folds folders, substreams and FilesInfo into per-file summaries and the
/// archive-level flags.
fn derive_files(archive: &mut SevenZipArchive) {
    let Some(files_info) = archive.files_info.take() else { return };
    let sub_taken = archive.sub_streams.take();
    let (files, is_solid) = {
        let mut files = Vec::new();
        let default_sub = SubStreamsInfo {
            num_unpack_streams: vec![1; archive.folders.len()],
            sizes: archive.folders.iter().map(Folder::unpack_size).collect(),
            crcs: archive.folders.iter().map(|folder| folder.crc).collect(),
        };
        let sub = sub_taken.as_ref().unwrap_or(&default_sub);

        // Map substream ordinal -> owning folder.
        let mut stream_folder = Vec::new();
        for (folder_index, &count) in sub.num_unpack_streams.iter().enumerate() {
            for _ in 0..count {
                stream_folder.push(folder_index);
            }
        }

        let files_with_streams = files_info
            .empty_stream
            .iter()
            .filter(|&&empty| !empty)
            .count();
        let is_solid = sub.num_unpack_streams.iter().any(|&count| count > 1)
            || files_with_streams > archive.folders.len().max(1);

        let mut stream_index = 0usize;
        for file_index in 0..files_info.file_count as usize {
            let name = files_info
                .names
                .get(file_index)
                .cloned()
                .unwrap_or_default();
            let empty_stream = *files_info.empty_stream.get(file_index).unwrap_or(&false);
            let is_anti = *files_info.anti.get(file_index).unwrap_or(&false);
            let mtime_iso = files_info.mtimes.get(file_index).cloned().flatten();

            if empty_stream {
                let empty_file = *files_info.empty_file.get(file_index).unwrap_or(&false);
                files.push(FileSummary {
                    name,
                    size: 0,
                    crc: None,
                    folder_index: None,
                    packed_size: None,
                    encrypted: false,
                    compression_ratio: None,
                    is_directory: !empty_file && !is_anti,
                    is_anti,
                    mtime_iso,
                });
                continue;
            }

            let folder_index = stream_folder.get(stream_index).copied();
            let size = sub.sizes.get(stream_index).copied().unwrap_or_else(|| {
                folder_index
                    .and_then(|index| archive.folders.get(index))
                    .map(Folder::unpack_size)
                    .unwrap_or(0)
            });
            let crc = sub.crcs.get(stream_index).copied().flatten();
            let folder = folder_index.and_then(|index| archive.folders.get(index));
            let single_stream = folder_index
                .and_then(|index| sub.num_unpack_streams.get(index))
                .is_some_and(|&count| count == 1);
            let packed_size = if single_stream {
                folder_index.and_then(|index| pack_size_of_folder(archive, index))
            } else {
                None
            };
            files.push(FileSummary {
                name,
                size,
                crc,
                folder_index,
                packed_size,
                encrypted: folder.is_some_and(Folder::is_encrypted),
                compression_ratio: packed_size
                    .filter(|_| size > 0)
                    .map(|packed| packed as f64 / size as f64),
                is_directory: false,
                is_anti,
                mtime_iso,
            });
            stream_index += 1;
        }
        (files, is_solid)
    };
    archive.files = files;
    archive.flags.is_solid = is_solid;
    archive.sub_streams = sub_taken;
    archive.files_info = Some(files_info);
}

/// Folders consume pack streams in declaration order.
fn pack_size_of_folder(archive: &SevenZipArchive, folder_index: usize) -> Option<u64> {
    let pack = archive.pack_info.as_ref()?;
    let mut cursor = 0usize;
    for (index, folder) in archive.folders.iter().enumerate() {
        let packed = folder.packed_indices.len().max(1);
        if index == folder_index {
            let sizes = pack.sizes.get(cursor..cursor + packed)?;
            return Some(sizes.iter().sum());
        }
        cursor += packed;
    }
    None
}

fn method_label(method_id: &str) -> Option<&'static str> {
    match method_id {
        "00" => Some("Copy"),
        "030101" => Some("LZMA"),
        "21" => Some("LZMA2"),
        "03030103" => Some("BCJ x86"),
        "0303011b" => Some("BCJ2 x86"),
        "03030106" => Some("ARM"),
        "04" => Some("BZip2"),
        "040108" => Some("Deflate"),
        "030401" => Some("PPMd"),
        AES_METHOD_ID => Some("AES-256"),
        _ => None,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::probe::MemorySource;

    fn vint(value: u64) -> Vec<u8> {
        // Single-byte form covers every test value.
        assert!(value < 0x80);
        vec![value as u8]
    }

    /// Builds a database for one stored file `readme.txt` of 2 bytes.
    fn next_header() -> Vec<u8> {
        let mut header = vint(K_HEADER);

        // MainStreamsInfo.
        header.extend_from_slice(&vint(K_MAIN_STREAMS));
        {
            header.extend_from_slice(&vint(K_PACK_INFO));
            header.extend_from_slice(&vint(0)); // pack position
            header.extend_from_slice(&vint(1)); // one pack stream
            header.extend_from_slice(&vint(K_SIZE));
            header.extend_from_slice(&vint(2));
            header.extend_from_slice(&vint(K_END));

            header.extend_from_slice(&vint(K_UNPACK_INFO));
            header.extend_from_slice(&vint(K_FOLDER));
            header.extend_from_slice(&vint(1)); // one folder
            header.push(0); // not external
            header.extend_from_slice(&vint(1)); // one coder
            header.push(0x01); // flags: 1-byte id, simple
            header.push(0x00); // Copy
            header.extend_from_slice(&vint(K_CODERS_UNPACK_SIZE));
            header.extend_from_slice(&vint(2));
            header.extend_from_slice(&vint(K_END));
            header.extend_from_slice(&vint(K_END));
        }

        // FilesInfo: one file, name only.
        header.extend_from_slice(&vint(K_FILES_INFO));
        header.extend_from_slice(&vint(1));
        header.extend_from_slice(&vint(K_NAME));
        let mut names = vec![0u8]; // not external
        for unit in "readme.txt".encode_utf16() {
            names.extend_from_slice(&unit.to_le_bytes());
        }
        names.extend_from_slice(&[0, 0]);
        header.extend_from_slice(&vint(names.len() as u64));
        header.extend_from_slice(&names);
        header.extend_from_slice(&vint(K_END));

        header.extend_from_slice(&vint(K_END));
        header
    }

    pub(crate) fn stored_archive() -> Vec<u8> {
        let payload = b"Hi";
        let header = next_header();

        let mut data = SIGNATURE.to_vec();
        data.push(0); // version major
        data.push(4); // version minor
        let next_offset = payload.len() as u64;
        let mut start = Vec::new();
        start.extend_from_slice(&next_offset.to_le_bytes());
        start.extend_from_slice(&(header.len() as u64).to_le_bytes());
        start.extend_from_slice(&crc32(&header).to_le_bytes());
        data.extend_from_slice(&crc32(&start).to_le_bytes());
        data.extend_from_slice(&start);
        data.extend_from_slice(payload);
        data.extend_from_slice(&header);
        data
    }

    #[test]
    fn stored_file_archive() {
        let archive =
            analyze(&MemorySource::new(stored_archive()), &ProbeOptions::default()).unwrap();
        assert_eq!(archive.start_header.version_major, 0);
        assert_eq!(archive.start_header.version_minor, 4);
        assert!(archive.start_header.crc_valid);
        assert_eq!(archive.next_header_kind, NextHeaderKind::Header);

        let files_info = archive.files_info.as_ref().unwrap();
        assert_eq!(files_info.file_count, 1);
        assert_eq!(files_info.names[0], "readme.txt");

        assert_eq!(archive.folders.len(), 1);
        assert_eq!(archive.folders[0].coders[0].method_label, Some("Copy"));
        assert_eq!(archive.folders[0].unpack_size(), 2);

        assert_eq!(archive.files.len(), 1);
        assert_eq!(archive.files[0].name, "readme.txt");
        assert_eq!(archive.files[0].size, 2);
        assert_eq!(archive.files[0].packed_size, Some(2));
        assert!(!archive.flags.is_solid);
        assert!(!archive.flags.has_encrypted_content);
        assert!(archive.issues.is_empty());
    }

    #[test]
    fn encoded_header_is_unsupported_not_fatal() {
        let header = vint(K_ENCODED_HEADER);
        let mut data = SIGNATURE.to_vec();
        data.push(0);
        data.push(4);
        let mut start = Vec::new();
        start.extend_from_slice(&0u64.to_le_bytes());
        start.extend_from_slice(&(header.len() as u64).to_le_bytes());
        start.extend_from_slice(&crc32(&header).to_le_bytes());
        data.extend_from_slice(&crc32(&start).to_le_bytes());
        data.extend_from_slice(&start);
        data.extend_from_slice(&header);

        let archive = analyze(&MemorySource::new(data), &ProbeOptions::default()).unwrap();
        assert_eq!(archive.next_header_kind, NextHeaderKind::Encoded);
        assert!(archive.flags.header_encrypted);
        assert!(archive.issues.iter().any(|issue| issue.contains("encoded")));
    }

    #[test]
    fn next_header_crc_mismatch_is_reported() {
        let mut data = stored_archive();
        let len = data.len();
        data[len - 1] ^= 0x55;
        let archive = analyze(&MemorySource::new(data), &ProbeOptions::default()).unwrap();
        assert!(archive
            .issues
            .iter()
            .any(|issue| issue.contains("next header CRC mismatch")));
    }

    #[test]
    fn bit_vector_is_msb_first() {
        let mut issues = IssueLog::new();
        let raw = [0b1010_0000u8];
        let mut reader = Reader::new(&raw, 0);
        let bits = read_bit_vector(&mut reader, 3, &mut issues).unwrap();
        assert_eq!(bits, vec![true, false, true]);
    }
}
