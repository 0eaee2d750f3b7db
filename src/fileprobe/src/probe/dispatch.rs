//! Magic-based dispatch: classify the input's first bytes (and, when
//! nothing matches, its tail) and hand it to exactly one analyzer.

use log::debug;

use super::{ByteSource, IssueLog, ProbeOptions, Reader};
use crate::formats::{ebml, elf, iso9660, lnk, pcap, pe, rar, sevenzip, sqlite, tar, zip};

/// Prefix window used for magic detection and ZIP label refinement.
const PREFIX_WINDOW: u64 = 65_536;
/// MP3 sync scan budget.
const MP3_SCAN: usize = 16_384;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatKind {
    Elf,
    Pe,
    Lnk,
    SevenZip,
    Rar,
    Tar,
    Zip,
    Iso9660,
    Webm,
    Pcap,
    Sqlite,
    Png,
    Gif,
    Jpeg,
    Webp,
    Pdf,
    Fb2,
    Mp3,
    MachO,
    Mz,
    Text,
    Unknown,
}

/// The parse tree of whichever analyzer ran. Label-only formats (images,
/// PDF, MP3, Mach-O, plain text) have no deep analyzer here.
#[derive(Debug)]
pub enum ParsedFormat {
    Pe(pe::PeImage),
    Elf(elf::ElfImage),
    Lnk(lnk::ShellLink),
    SevenZip(sevenzip::SevenZipArchive),
    Rar(rar::RarArchive),
    Tar(tar::TarArchive),
    Zip(zip::ZipArchive),
    Iso9660(iso9660::IsoVolume),
    Webm(ebml::EbmlDocument),
    Pcap(pcap::PcapCapture),
    Sqlite(sqlite::SqliteHeader),
}

#[derive(Debug)]
pub struct ProbeOutcome {
    pub format: FormatKind,
    pub label: String,
    pub parsed: Option<ParsedFormat>,
    /// Dispatcher-level notices; analyzer issues live on the parse tree.
    pub issues: Vec<String>,
}

impl ProbeOutcome {
    fn label_only(format: FormatKind, label: impl Into<String>, issues: IssueLog) -> ProbeOutcome {
        ProbeOutcome {
            format,
            label: label.into(),
            parsed: None,
            issues: issues.into_entries(),
        }
    }
}

/// Classifies and analyzes one input. Exactly one analyzer runs; the
/// priority order below resolves every ambiguity.
pub fn probe(source: &dyn ByteSource, options: &ProbeOptions<'_>) -> ProbeOutcome {
    let mut issues = IssueLog::new();
    let len = source.len();
    debug!("dispatch: probing {} bytes", len);
    let prefix = match source.slice(0, len.min(PREFIX_WINDOW)) {
        Ok(prefix) => prefix,
        Err(error) => {
            issues.note(format!("parse aborted: {}", error));
            return ProbeOutcome::label_only(FormatKind::Unknown, "unreadable input", issues);
        }
    };

    if prefix.starts_with(elf::MAGIC) {
        return dispatch_elf(source, options, issues);
    }
    if let Some(label) = macho_label(&prefix) {
        return ProbeOutcome::label_only(FormatKind::MachO, label, issues);
    }
    if prefix.len() >= 4 && prefix[..4] == zip::LOCAL_FILE_HEADER.to_le_bytes() {
        return dispatch_zip(source, &prefix, options, issues);
    }
    if prefix.starts_with(b"%PDF-") {
        let version: String = prefix[5..]
            .iter()
            .take_while(|&&b| b.is_ascii_digit() || b == b'.')
            .take(8)
            .map(|&b| b as char)
            .collect();
        let label = if version.is_empty() {
            "PDF document".to_string()
        } else {
            format!("PDF document (v{})", version)
        };
        return ProbeOutcome::label_only(FormatKind::Pdf, label, issues);
    }
    if prefix.starts_with(sevenzip::SIGNATURE) {
        return dispatch_sevenzip(source, options, issues);
    }
    if prefix.starts_with(rar::SIGNATURE_V5) || prefix.starts_with(rar::SIGNATURE_V4) {
        return dispatch_rar(source, options, issues);
    }
    if prefix.len() > 262 && (&prefix[257..262] == b"ustar" || tar_checksum_plausible(&prefix)) {
        return dispatch_tar(source, options, issues);
    }
    if prefix.starts_with(pe::DOS_MAGIC) {
        return dispatch_pe_or_mz(source, &prefix, options, issues);
    }
    if prefix.starts_with(b"\x89PNG\r\n\x1a\n") {
        return ProbeOutcome::label_only(FormatKind::Png, png_label(&prefix), issues);
    }
    if prefix.starts_with(b"GIF87a") || prefix.starts_with(b"GIF89a") {
        return ProbeOutcome::label_only(FormatKind::Gif, gif_label(&prefix), issues);
    }
    if prefix.starts_with(b"\xff\xd8\xff") {
        return ProbeOutcome::label_only(FormatKind::Jpeg, jpeg_label(&prefix), issues);
    }
    if prefix.len() >= 12 && &prefix[..4] == b"RIFF" && &prefix[8..12] == b"WEBP" {
        return ProbeOutcome::label_only(FormatKind::Webp, webp_label(&prefix), issues);
    }
    if prefix.len() >= 4 && u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) == ebml::ID_EBML
    {
        return dispatch_ebml(source, options, issues);
    }
    if is_lnk(&prefix) {
        return dispatch_lnk(source, options, issues);
    }
    if is_iso9660(source) {
        return dispatch_iso(source, options, issues);
    }
    if prefix.len() >= 4 {
        let magic = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);
        if matches!(
            magic,
            pcap::MAGIC_US | pcap::MAGIC_US_SWAPPED | pcap::MAGIC_NS | pcap::MAGIC_NS_SWAPPED
        ) {
            return dispatch_pcap(source, options, issues);
        }
    }
    if prefix.starts_with(sqlite::MAGIC) {
        return dispatch_sqlite(source, options, issues);
    }

    // No early magic: a ZIP with prepended data (SFX) still ends in an
    // EOCD; scan the tail for it.
    if len >= 22 {
        let mut tail_issues = IssueLog::new();
        if zip::locate_eocd(source, &mut tail_issues).is_some() {
            return dispatch_zip(source, &prefix, options, issues);
        }
    }

    if let Some(label) = mp3_label(&prefix, len, &mut issues) {
        return ProbeOutcome::label_only(FormatKind::Mp3, label, issues);
    }

    if let Some((kind, label)) = text_label(&prefix) {
        return ProbeOutcome::label_only(kind, label, issues);
    }

    ProbeOutcome::label_only(FormatKind::Unknown, "data", issues)
}

fn dispatch_elf(
    source: &dyn ByteSource,
    options: &ProbeOptions<'_>,
    issues: IssueLog,
) -> ProbeOutcome {
    match elf::analyze(source, options) {
        Some(image) => {
            let label = format!(
                "ELF {}-bit {} {}, {}",
                match image.ident.class {
                    elf::ElfClass::Elf32 => 32,
                    elf::ElfClass::Elf64 => 64,
                },
                match image.ident.data {
                    elf::ElfData::Lsb => "LSB",
                    elf::ElfData::Msb => "MSB",
                },
                image.header.type_label,
                image.header.machine_label
            );
            ProbeOutcome {
                format: FormatKind::Elf,
                label,
                parsed: Some(ParsedFormat::Elf(image)),
                issues: issues.into_entries(),
            }
        }
        None => ProbeOutcome::label_only(FormatKind::Elf, "ELF (truncated)", issues),
    }
}

fn dispatch_zip(
    source: &dyn ByteSource,
    prefix: &[u8],
    options: &ProbeOptions<'_>,
    issues: IssueLog,
) -> ProbeOutcome {
    match zip::analyze(source, options) {
        Some(archive) => {
            let label = refine_zip_label(prefix, &archive);
            ProbeOutcome {
                format: FormatKind::Zip,
                label,
                parsed: Some(ParsedFormat::Zip(archive)),
                issues: issues.into_entries(),
            }
        }
        None => ProbeOutcome::label_only(
            FormatKind::Zip,
            "ZIP archive (no end of central directory)",
            issues,
        ),
    }
}

/// Well-known entry names inside the prefix window refine the container
/// label (office documents, packages, e-books).
fn refine_zip_label(prefix: &[u8], archive: &zip::ZipArchive) -> String {
    let contains = |needle: &[u8]| prefix.windows(needle.len()).any(|window| window == needle);
    let refined = if contains(b"AndroidManifest.xml") {
        Some("APK Android package")
    } else if contains(b"META-INF/MANIFEST.MF") {
        Some("JAR Java archive")
    } else if contains(b"extension.vsixmanifest") {
        Some("VSIX Visual Studio extension")
    } else if contains(b"application/epub+zip") {
        Some("EPUB e-book")
    } else if contains(b"application/vnd.oasis.opendocument.text") {
        Some("ODT OpenDocument text")
    } else if contains(b"FixedDocSeq.fdseq") || contains(b"FixedDocumentSequence.fdseq") {
        Some("XPS document")
    } else if contains(b".fb2") {
        Some("FictionBook 2 in ZIP")
    } else if contains(b"[Content_Types].xml") {
        if contains(b"word/") {
            Some("DOCX Word document")
        } else if contains(b"xl/") {
            Some("XLSX Excel workbook")
        } else if contains(b"ppt/") {
            Some("PPTX PowerPoint presentation")
        } else {
            Some("Office Open XML document")
        }
    } else {
        None
    };
    match refined {
        Some(kind) => format!("{} ({} files)", kind, archive.eocd.total_entries),
        None => format!("ZIP archive ({} files)", archive.eocd.total_entries),
    }
}

fn dispatch_sevenzip(
    source: &dyn ByteSource,
    options: &ProbeOptions<'_>,
    issues: IssueLog,
) -> ProbeOutcome {
    match sevenzip::analyze(source, options) {
        Some(archive) => {
            let file_count = archive
                .files_info
                .as_ref()
                .map(|info| info.file_count)
                .unwrap_or(0);
            let label = format!(
                "7z archive v{}.{} ({} files)",
                archive.start_header.version_major,
                archive.start_header.version_minor,
                file_count
            );
            ProbeOutcome {
                format: FormatKind::SevenZip,
                label,
                parsed: Some(ParsedFormat::SevenZip(archive)),
                issues: issues.into_entries(),
            }
        }
        None => ProbeOutcome::label_only(FormatKind::SevenZip, "7z archive (truncated)", issues),
    }
}

fn dispatch_rar(
    source: &dyn ByteSource,
    options: &ProbeOptions<'_>,
    issues: IssueLog,
) -> ProbeOutcome {
    match rar::analyze(source, options) {
        Some(archive) => {
            let label = format!(
                "RAR archive (v{}, {} files{})",
                archive.version,
                archive.entries.len(),
                if archive.is_solid { ", solid" } else { "" }
            );
            ProbeOutcome {
                format: FormatKind::Rar,
                label,
                parsed: Some(ParsedFormat::Rar(archive)),
                issues: issues.into_entries(),
            }
        }
        None => ProbeOutcome::label_only(FormatKind::Rar, "RAR archive (truncated)", issues),
    }
}

/// Without the ustar magic a V7 tar is still recognizable by a valid
/// header checksum in the first block.
fn tar_checksum_plausible(prefix: &[u8]) -> bool {
    if prefix.len() < 512 || prefix[..512].iter().all(|&b| b == 0) {
        return false;
    }
    let Some(stored) = super::tar_numeric(&prefix[148..156]) else { return false };
    let sum: u64 = prefix[..512]
        .iter()
        .enumerate()
        .map(|(i, &b)| if (148..156).contains(&i) { 0x20 } else { b as u64 })
        .sum();
    stored == sum
}

fn dispatch_tar(
    source: &dyn ByteSource,
    options: &ProbeOptions<'_>,
    issues: IssueLog,
) -> ProbeOutcome {
    let archive = tar::analyze(source, options);
    let dialect = archive
        .entries
        .first()
        .map(|entry| match entry.dialect {
            tar::TarDialect::V7 => "V7",
            tar::TarDialect::Ustar => "ustar",
            tar::TarDialect::Gnu => "GNU",
            tar::TarDialect::Pax => "PAX",
        })
        .unwrap_or("empty");
    let label = format!("TAR archive ({} entries, {})", archive.entries.len(), dialect);
    ProbeOutcome {
        format: FormatKind::Tar,
        label,
        parsed: Some(ParsedFormat::Tar(archive)),
        issues: issues.into_entries(),
    }
}

fn dispatch_pe_or_mz(
    source: &dyn ByteSource,
    prefix: &[u8],
    options: &ProbeOptions<'_>,
    issues: IssueLog,
) -> ProbeOutcome {
    let reader = Reader::new(prefix, 0);
    let pe_plausible = reader
        .u32_le_at(0x3c)
        .and_then(|e_lfanew| reader.peek_at(e_lfanew as usize, 4))
        .map(|signature| signature == pe::PE_SIGNATURE)
        .unwrap_or(false);
    if pe_plausible {
        if let Some(image) = pe::analyze(source, options) {
            let label = pe_label(&image);
            return ProbeOutcome {
                format: FormatKind::Pe,
                label,
                parsed: Some(ParsedFormat::Pe(image)),
                issues: issues.into_entries(),
            };
        }
    }
    ProbeOutcome::label_only(FormatKind::Mz, "MS-DOS executable (MZ)", issues)
}

fn pe_label(image: &pe::PeImage) -> String {
    let is_plus = image.optional.as_ref().is_some_and(|opt| opt.is_plus);
    let role = if image.is_dll() {
        "DLL"
    } else if image
        .coff
        .characteristics
        .check_flag(pe::FileCharacteristics::SYSTEM_FILE)
    {
        "driver"
    } else {
        "executable"
    };
    format!(
        "PE32{} {} for {}",
        if is_plus { "+" } else { "" },
        role,
        image.coff.machine_label()
    )
}

fn dispatch_ebml(
    source: &dyn ByteSource,
    options: &ProbeOptions<'_>,
    issues: IssueLog,
) -> ProbeOutcome {
    match ebml::analyze(source, options) {
        Some(document) => {
            let container = if document.is_webm { "WebM" } else { "Matroska" };
            let codec = document
                .tracks
                .iter()
                .find(|track| track.video.is_some())
                .or_else(|| document.tracks.first())
                .map(|track| track.codec_id.clone())
                .filter(|codec| !codec.is_empty());
            let label = match (codec, document.duration_seconds) {
                (Some(codec), Some(duration)) => {
                    format!("{} media ({}, {:.1} s)", container, codec, duration)
                }
                (Some(codec), None) => format!("{} media ({})", container, codec),
                (None, Some(duration)) => format!("{} media ({:.1} s)", container, duration),
                (None, None) => format!("{} media", container),
            };
            ProbeOutcome {
                format: FormatKind::Webm,
                label,
                parsed: Some(ParsedFormat::Webm(document)),
                issues: issues.into_entries(),
            }
        }
        None => ProbeOutcome::label_only(FormatKind::Webm, "EBML container (truncated)", issues),
    }
}

/// Shell links start with HeaderSize 0x4C and the Shell Link CLSID.
fn is_lnk(prefix: &[u8]) -> bool {
    prefix.len() >= 20 && prefix[..4] == [0x4c, 0, 0, 0] && prefix[4..20] == lnk::LINK_CLSID
}

fn dispatch_lnk(
    source: &dyn ByteSource,
    options: &ProbeOptions<'_>,
    issues: IssueLog,
) -> ProbeOutcome {
    match lnk::analyze(source, options) {
        Some(link) => {
            let target = link
                .link_info
                .as_ref()
                .and_then(|info| info.local_base_path.clone())
                .or_else(|| link.relative_path.clone());
            let label = match target {
                Some(target) if !target.is_empty() => {
                    format!("Windows shortcut to {}", target)
                }
                _ => "Windows shortcut".to_string(),
            };
            ProbeOutcome {
                format: FormatKind::Lnk,
                label,
                parsed: Some(ParsedFormat::Lnk(link)),
                issues: issues.into_entries(),
            }
        }
        None => ProbeOutcome::label_only(FormatKind::Lnk, "Windows shortcut (truncated)", issues),
    }
}

fn is_iso9660(source: &dyn ByteSource) -> bool {
    let at = iso9660::DESCRIPTOR_START;
    source
        .slice(at, (at + 6).min(source.len()))
        .map(|head| head.len() == 6 && &head[1..6] == iso9660::STANDARD_ID)
        .unwrap_or(false)
}

fn dispatch_iso(
    source: &dyn ByteSource,
    options: &ProbeOptions<'_>,
    issues: IssueLog,
) -> ProbeOutcome {
    let volume = iso9660::analyze(source, options);
    let label = match (&volume.primary, &volume.joliet) {
        (Some(primary), Some(_)) => {
            format!("ISO 9660 volume '{}' (Joliet)", primary.volume_id)
        }
        (Some(primary), None) => format!("ISO 9660 volume '{}'", primary.volume_id),
        _ => "ISO 9660 volume".to_string(),
    };
    ProbeOutcome {
        format: FormatKind::Iso9660,
        label,
        parsed: Some(ParsedFormat::Iso9660(volume)),
        issues: issues.into_entries(),
    }
}

fn dispatch_pcap(
    source: &dyn ByteSource,
    options: &ProbeOptions<'_>,
    issues: IssueLog,
) -> ProbeOutcome {
    let capture = pcap::analyze(source, options);
    let label = format!(
        "pcap capture (linktype {}, {} records{})",
        capture.header.linktype,
        capture.records.count,
        if capture.header.nanosecond { ", ns" } else { "" }
    );
    ProbeOutcome {
        format: FormatKind::Pcap,
        label,
        parsed: Some(ParsedFormat::Pcap(capture)),
        issues: issues.into_entries(),
    }
}

fn dispatch_sqlite(
    source: &dyn ByteSource,
    options: &ProbeOptions<'_>,
    issues: IssueLog,
) -> ProbeOutcome {
    let header = sqlite::analyze(source, options);
    let label = format!(
        "SQLite 3 database (page size {}, {})",
        header.page_size, header.text_encoding_label
    );
    ProbeOutcome {
        format: FormatKind::Sqlite,
        label,
        parsed: Some(ParsedFormat::Sqlite(header)),
        issues: issues.into_entries(),
    }
}

fn macho_label(prefix: &[u8]) -> Option<&'static str> {
    if prefix.len() < 4 {
        return None;
    }
    let magic = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);
    match magic {
        0xFEED_FACE => Some("Mach-O 32-bit (big-endian)"),
        0xFEED_FACF => Some("Mach-O 64-bit (big-endian)"),
        0xCEFA_EDFE => Some("Mach-O 32-bit"),
        0xCFFA_EDFE => Some("Mach-O 64-bit"),
        0xCAFE_BABE if prefix.get(7).is_some_and(|&n| n < 0x20) => Some("Mach-O universal binary"),
        _ => None,
    }
}

/// PNG IHDR peek: width, height, color type.
fn png_label(prefix: &[u8]) -> String {
    let reader = Reader::new(prefix, 0);
    // IHDR payload starts at 16: length(4) + "IHDR"(4) after the magic.
    let (Some(width), Some(height), Some(color_type)) = (
        reader.u32_be_at(16),
        reader.u32_be_at(20),
        reader.u8_at(25),
    ) else {
        return "PNG image".to_string();
    };
    let (color, alpha) = match color_type {
        0 => ("grayscale", false),
        2 => ("RGB", false),
        3 => ("palette", false),
        4 => ("grayscale", true),
        6 => ("RGBA", true),
        _ => ("unknown color", false),
    };
    format!(
        "PNG image ({}x{}, {}{})",
        width,
        height,
        color,
        if alpha { ", alpha" } else { "" }
    )
}

fn gif_label(prefix: &[u8]) -> String {
    let reader = Reader::new(prefix, 0);
    match (reader.u16_le_at(6), reader.u16_le_at(8)) {
        (Some(width), Some(height)) => format!("GIF image ({}x{})", width, height),
        _ => "GIF image".to_string(),
    }
}

/// Scans JPEG markers for the first SOFn frame header.
fn jpeg_label(prefix: &[u8]) -> String {
    let reader = Reader::new(prefix, 0);
    let mut at = 2usize;
    for _ in 0..256 {
        let Some(0xff) = reader.u8_at(at) else { break };
        let Some(marker) = reader.u8_at(at + 1) else { break };
        match marker {
            // SOF0..SOF15, excluding DHT/JPG/DAC.
            0xc0..=0xcf if !matches!(marker, 0xc4 | 0xc8 | 0xcc) => {
                let (Some(height), Some(width)) =
                    (reader.u16_be_at(at + 5), reader.u16_be_at(at + 7))
                else {
                    break;
                };
                let progressive = matches!(marker, 0xc2 | 0xc6 | 0xca | 0xce);
                return format!(
                    "JPEG image ({}x{}{})",
                    width,
                    height,
                    if progressive { ", progressive" } else { "" }
                );
            }
            0xd8 | 0x01 | 0xd0..=0xd7 => at += 2,
            _ => {
                let Some(length) = reader.u16_be_at(at + 2) else { break };
                at += 2 + length as usize;
            }
        }
    }
    "JPEG image".to_string()
}

fn webp_label(prefix: &[u8]) -> String {
    match prefix.get(12..16) {
        Some(b"VP8 ") => "WebP image (lossy)".to_string(),
        Some(b"VP8L") => "WebP image (lossless)".to_string(),
        Some(b"VP8X") => "WebP image (extended)".to_string(),
        _ => "WebP image".to_string(),
    }
}

/// MPEG audio bitrates (kbit/s) for MPEG-1 layer III / MPEG-2 layer III.
const MP3_BITRATES_V1: [u32; 16] =
    [0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 0];
const MP3_BITRATES_V2: [u32; 16] =
    [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160, 0];
const MP3_SAMPLE_RATES: [[u32; 3]; 3] = [
    [44_100, 48_000, 32_000], // MPEG-1
    [22_050, 24_000, 16_000], // MPEG-2
    [11_025, 12_000, 8_000],  // MPEG-2.5
];

struct Mp3Frame {
    length: usize,
    bitrate_kbps: u32,
    sample_rate: u32,
    mpeg2: bool,
}

fn parse_mp3_frame(window: &[u8], at: usize) -> Option<Mp3Frame> {
    let header = window.get(at..at + 4)?;
    if header[0] != 0xff || header[1] & 0xe0 != 0xe0 {
        return None;
    }
    let version_bits = (header[1] >> 3) & 0x3;
    let layer_bits = (header[1] >> 1) & 0x3;
    // Layer III only; other layers are rare enough to skip validation.
    if layer_bits != 0b01 || version_bits == 0b01 {
        return None;
    }
    let (mpeg2, rate_row, bitrates) = match version_bits {
        0b11 => (false, 0usize, &MP3_BITRATES_V1),
        0b10 => (true, 1, &MP3_BITRATES_V2),
        _ => (true, 2, &MP3_BITRATES_V2),
    };
    let bitrate_index = (header[2] >> 4) as usize;
    let rate_index = ((header[2] >> 2) & 0x3) as usize;
    let bitrate_kbps = bitrates[bitrate_index];
    if bitrate_kbps == 0 || rate_index == 3 {
        return None;
    }
    let sample_rate = MP3_SAMPLE_RATES[rate_row][rate_index];
    let padding = ((header[2] >> 1) & 0x1) as usize;
    let factor = if mpeg2 { 72_000 } else { 144_000 };
    let length = (factor * bitrate_kbps / sample_rate) as usize + padding;
    (length >= 24).then_some(Mp3Frame { length, bitrate_kbps, sample_rate, mpeg2 })
}

/// Sync-word scan over the first 16 KiB; a hit is confirmed by a second
/// adjacent frame unless the input ends first.
fn mp3_label(prefix: &[u8], len: u64, issues: &mut IssueLog) -> Option<String> {
    let scan = &prefix[..prefix.len().min(MP3_SCAN)];
    for at in 0..scan.len().saturating_sub(4) {
        let Some(frame) = parse_mp3_frame(scan, at) else { continue };
        let second_at = at + frame.length;
        if second_at + 4 <= prefix.len() {
            if parse_mp3_frame(prefix, second_at).is_none() {
                continue;
            }
        } else if (second_at as u64) < len {
            // The second frame lies outside the prefix window; accept.
        } else {
            issues.note("single MP3 frame accepted; file too short to confirm a second");
        }
        return Some(format!(
            "MP3 audio ({} kbit/s, {} Hz{})",
            frame.bitrate_kbps,
            frame.sample_rate,
            if frame.mpeg2 { ", MPEG-2" } else { "" }
        ));
    }
    None
}

/// Plain-text probe: UTF-8 or ASCII with a low control-byte ratio; an FB2
/// document announces itself in the first kilobyte.
fn text_label(prefix: &[u8]) -> Option<(FormatKind, String)> {
    if prefix.is_empty() {
        return None;
    }
    let head = &prefix[..prefix.len().min(1024)];
    let is_utf8 = std::str::from_utf8(prefix).is_ok();
    let control_bytes = prefix
        .iter()
        .filter(|&&b| b < 0x20 && !matches!(b, b'\t' | b'\n' | b'\r' | 0x0c))
        .count();
    if control_bytes * 50 > prefix.len() {
        return None;
    }
    if is_utf8 {
        let text = String::from_utf8_lossy(head);
        if text.contains("<FictionBook") {
            return Some((FormatKind::Fb2, "FictionBook 2 document".to_string()));
        }
        if text.starts_with("<?xml") {
            return Some((FormatKind::Text, "XML text".to_string()));
        }
        if text.starts_with("#!") {
            return Some((FormatKind::Text, "script text".to_string()));
        }
        let label = if prefix.is_ascii() { "ASCII text" } else { "UTF-8 text" };
        return Some((FormatKind::Text, label.to_string()));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::MemorySource;

    fn probe_bytes(data: Vec<u8>) -> ProbeOutcome {
        probe(&MemorySource::new(data), &ProbeOptions::default())
    }

    #[test]
    fn empty_zip_dispatches_to_zip() {
        let mut data = vec![];
        data.extend_from_slice(&zip::EOCD_SIGNATURE.to_le_bytes());
        data.extend_from_slice(&[0u8; 18]);
        let outcome = probe_bytes(data);
        assert_eq!(outcome.format, FormatKind::Zip);
        let Some(ParsedFormat::Zip(archive)) = &outcome.parsed else {
            panic!("expected a zip parse");
        };
        assert_eq!(archive.eocd.total_entries, 0);
        assert!(archive.issues.is_empty());
    }

    #[test]
    fn pe32plus_dll_label() {
        let outcome = probe_bytes(crate::formats::pe::tests::minimal_pe32plus_dll());
        assert_eq!(outcome.format, FormatKind::Pe);
        assert_eq!(outcome.label, "PE32+ DLL for x86-64");
    }

    #[test]
    fn elf64_shared_object_label() {
        let outcome = probe_bytes(crate::formats::elf::tests::minimal_elf64_so());
        assert_eq!(outcome.format, FormatKind::Elf);
        assert_eq!(outcome.label, "ELF 64-bit LSB shared object, x86-64");
    }

    #[test]
    fn pdf_version_extraction() {
        let outcome = probe_bytes(b"%PDF-1.7\n%binary".to_vec());
        assert_eq!(outcome.format, FormatKind::Pdf);
        assert_eq!(outcome.label, "PDF document (v1.7)");
    }

    #[test]
    fn png_label_reads_ihdr() {
        let mut data = b"\x89PNG\r\n\x1a\n".to_vec();
        data.extend_from_slice(&13u32.to_be_bytes());
        data.extend_from_slice(b"IHDR");
        data.extend_from_slice(&1024u32.to_be_bytes());
        data.extend_from_slice(&768u32.to_be_bytes());
        data.push(8); // bit depth
        data.push(6); // RGBA
        data.extend_from_slice(&[0, 0, 0]);
        let outcome = probe_bytes(data);
        assert_eq!(outcome.format, FormatKind::Png);
        assert_eq!(outcome.label, "PNG image (1024x768, RGBA, alpha)");
    }

    #[test]
    fn rar5_label_counts_files() {
        let outcome = probe_bytes(crate::formats::rar::tests::stored_v5_archive());
        assert_eq!(outcome.format, FormatKind::Rar);
        assert_eq!(outcome.label, "RAR archive (v5, 1 files)");
    }

    #[test]
    fn sevenzip_label_counts_files() {
        let outcome = probe_bytes(crate::formats::sevenzip::tests::stored_archive());
        assert_eq!(outcome.format, FormatKind::SevenZip);
        assert_eq!(outcome.label, "7z archive v0.4 (1 files)");
    }

    #[test]
    fn tar_by_ustar_magic() {
        let outcome = probe_bytes(crate::formats::tar::tests::minimal_archive());
        assert_eq!(outcome.format, FormatKind::Tar);
        assert_eq!(outcome.label, "TAR archive (1 entries, ustar)");
    }

    #[test]
    fn plain_text_probe() {
        let outcome = probe_bytes(b"hello, world\nthis is text\n".to_vec());
        assert_eq!(outcome.format, FormatKind::Text);
        assert_eq!(outcome.label, "ASCII text");
    }

    #[test]
    fn only_one_analyzer_per_input() {
        // A tar whose first block would also pass the text probe must
        // still dispatch as tar, and exactly once.
        let outcome = probe_bytes(crate::formats::tar::tests::minimal_archive());
        assert_eq!(outcome.format, FormatKind::Tar);
        assert!(outcome.parsed.is_some());
    }

    #[test]
    fn unknown_binary_data() {
        let outcome = probe_bytes(vec![0x00, 0x01, 0x02, 0x03, 0x80, 0xfe]);
        assert_eq!(outcome.format, FormatKind::Unknown);
        assert!(outcome.parsed.is_none());
    }
}
