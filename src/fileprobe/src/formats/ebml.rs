//! EBML containers: Matroska and WebM.

use log::debug;

use crate::probe::{ByteSource, IssueLog, ProbeOptions, Reader, Stage, VInt};

// Top level.
pub const ID_EBML: u32 = 0x1A45_DFA3;
pub const ID_SEGMENT: u32 = 0x1853_8067;

// EBML header children.
const ID_EBML_VERSION: u32 = 0x4286;
const ID_EBML_READ_VERSION: u32 = 0x42F7;
const ID_DOC_TYPE: u32 = 0x4282;
const ID_DOC_TYPE_VERSION: u32 = 0x4287;

// Segment children.
const ID_SEEK_HEAD: u32 = 0x114D_9B74;
const ID_INFO: u32 = 0x1549_A966;
const ID_TRACKS: u32 = 0x1654_AE6B;
const ID_CUES: u32 = 0x1C53_BB6B;
const ID_ATTACHMENTS: u32 = 0x1941_A469;
const ID_CLUSTER: u32 = 0x1F43_B675;

// SeekHead.
const ID_SEEK: u32 = 0x4DBB;
const ID_SEEK_ID: u32 = 0x53AB;
const ID_SEEK_POSITION: u32 = 0x53AC;

// Info.
const ID_TIMECODE_SCALE: u32 = 0x2AD7B1;
const ID_DURATION: u32 = 0x4489;
const ID_DATE_UTC: u32 = 0x4461;
const ID_MUXING_APP: u32 = 0x4D80;
const ID_WRITING_APP: u32 = 0x5741;

// Tracks.
const ID_TRACK_ENTRY: u32 = 0xAE;
const ID_TRACK_NUMBER: u32 = 0xD7;
const ID_TRACK_TYPE: u32 = 0x83;
const ID_CODEC_ID: u32 = 0x86;
const ID_TRACK_NAME: u32 = 0x536E;
const ID_LANGUAGE: u32 = 0x22B59C;
const ID_VIDEO: u32 = 0xE0;
const ID_AUDIO: u32 = 0xE1;
const ID_PIXEL_WIDTH: u32 = 0xB0;
const ID_PIXEL_HEIGHT: u32 = 0xBA;
const ID_SAMPLING_FREQUENCY: u32 = 0xB5;
const ID_CHANNELS: u32 = 0x9F;
const ID_BIT_DEPTH: u32 = 0x6264;

// Cluster.
const ID_CLUSTER_TIMECODE: u32 = 0xE7;

/// Scan budget over a Segment with unknown size before falling back to the
/// SeekHead.
const SEGMENT_SCAN_BUDGET: u64 = 1 << 20;
/// Nested-element budget per container.
const MAX_CHILDREN: u32 = 10_000;

#[derive(Debug, Default)]
pub struct EbmlHeader {
    pub version: u64,
    pub read_version: u64,
    pub doc_type: String,
    pub doc_type_version: u64,
}

#[derive(Debug, Default)]
pub struct SegmentInfo {
    pub timecode_scale: u64,
    pub duration_raw: Option<f64>,
    pub date_utc: Option<i64>,
    pub muxing_app: String,
    pub writing_app: String,
}

#[derive(Debug, Default)]
pub struct VideoInfo {
    pub pixel_width: u64,
    pub pixel_height: u64,
}

#[derive(Debug, Default)]
pub struct AudioInfo {
    pub sampling_frequency: f64,
    pub channels: u64,
    pub bit_depth: Option<u64>,
}

#[derive(Debug, Default)]
pub struct Track {
    pub number: u64,
    pub track_type: u64,
    pub type_label: &'static str,
    pub codec_id: String,
    pub name: String,
    pub language: String,
    pub video: Option<VideoInfo>,
    pub audio: Option<AudioInfo>,
}

#[derive(Debug)]
pub struct EbmlDocument {
    pub header: EbmlHeader,
    pub is_webm: bool,
    /// SeekHead entries: target element id, absolute file offset.
    pub seeks: Vec<(u32, u64)>,
    pub info: Option<SegmentInfo>,
    pub tracks: Vec<Track>,
    pub has_cues: bool,
    pub has_attachments: bool,
    pub cluster_count: u32,
    /// `Duration × TimecodeScale / 1e9`, or the cluster-scan approximation.
    pub duration_seconds: Option<f64>,
    pub issues: Vec<String>,
}

struct ElementHeader {
    id: u32,
    size: VInt,
    header_len: u64,
}

/// Reads one element header (id + size) from the source at `offset`.
fn element_header(
    source: &dyn ByteSource,
    offset: u64,
    issues: &mut IssueLog,
) -> Option<ElementHeader> {
    let end = (offset + 12).min(source.len());
    if offset >= end {
        return None;
    }
    let window = source.slice(offset, end).ok()?;
    let mut reader = Reader::new(&window, offset);
    let id = reader.read_ebml_id("element id", issues)?;
    let size = reader.read_vint_ebml("element size", issues)?;
    Some(ElementHeader { id, size, header_len: reader.pos() as u64 })
}

pub fn analyze(source: &dyn ByteSource, options: &ProbeOptions<'_>) -> Option<EbmlDocument> {
    debug!("ebml: analyzing {} bytes", source.len());
    let mut issues = IssueLog::new();

    let head = element_header(source, 0, &mut issues)?;
    if head.id != ID_EBML {
        return None;
    }
    let header_end = head.header_len.saturating_add(head.size.value).min(source.len());
    let header_payload = source.slice(head.header_len, header_end).ok()?;
    let header = read_ebml_header(&header_payload, head.header_len, &mut issues);
    let is_webm = header.doc_type == "webm";

    let mut document = EbmlDocument {
        header,
        is_webm,
        seeks: Vec::new(),
        info: None,
        tracks: Vec::new(),
        has_cues: false,
        has_attachments: false,
        cluster_count: 0,
        duration_seconds: None,
        issues: Vec::new(),
    };

    // Locate the Segment after the EBML header.
    let segment_at = head.header_len.saturating_add(head.size.value);
    match element_header(source, segment_at, &mut issues) {
        Some(segment) if segment.id == ID_SEGMENT => {
            walk_segment(source, &segment, segment_at, &mut document, options, &mut issues);
        }
        _ => issues.note(format!("no Segment element at 0x{:08x}", segment_at)),
    }

    if let Some(info) = &document.info {
        if let Some(duration) = info.duration_raw {
            let scale = if info.timecode_scale == 0 { 1_000_000 } else { info.timecode_scale };
            document.duration_seconds = Some(duration * scale as f64 / 1e9);
        }
    }

    document.issues = issues.into_entries();
    Some(document)
}

fn read_ebml_header(payload: &[u8], base: u64, issues: &mut IssueLog) -> EbmlHeader {
    let mut header = EbmlHeader {
        version: 1,
        read_version: 1,
        doc_type: String::new(),
        doc_type_version: 1,
    };
    let mut reader = Reader::new(payload, base);
    let mut children = 0;
    while !reader.at_end() && children < MAX_CHILDREN {
        children += 1;
        let Some((id, body)) = next_child(&mut reader, issues) else { break };
        match id {
            ID_EBML_VERSION => header.version = unsigned(body),
            ID_EBML_READ_VERSION => header.read_version = unsigned(body),
            ID_DOC_TYPE => header.doc_type = String::from_utf8_lossy(body).into_owned(),
            ID_DOC_TYPE_VERSION => header.doc_type_version = unsigned(body),
            _ => {}
        }
    }
    header
}

/// Walks the Segment's top-level children through source-backed windows.
/// An unknown Segment size limits the scan to [`SEGMENT_SCAN_BUDGET`]; the
/// SeekHead then resolves Info and Tracks by absolute offset.
fn walk_segment(
    source: &dyn ByteSource,
    segment: &ElementHeader,
    segment_at: u64,
    document: &mut EbmlDocument,
    options: &ProbeOptions<'_>,
    issues: &mut IssueLog,
) {
    let data_start = segment_at + segment.header_len;
    let declared_end = if segment.size.unknown {
        issues.note("Segment size is unknown; scanning with a bounded budget");
        data_start.saturating_add(SEGMENT_SCAN_BUDGET).min(source.len())
    } else {
        data_start.saturating_add(segment.size.value).min(source.len())
    };

    let mut offset = data_start;
    let mut children = 0u32;
    let mut max_cluster_timecode: Option<u64> = None;
    while offset < declared_end && children < MAX_CHILDREN {
        children += 1;
        if children % options.yield_interval == 0 {
            options.report(Stage::Records, offset - data_start, children as u64);
            if options.cancelled() {
                issues.note("cancelled");
                break;
            }
        }
        let Some(child) = element_header(source, offset, issues) else { break };
        if child.size.unknown {
            issues.note(format!(
                "element 0x{:x} at 0x{:08x} has unknown size; child scan stopped",
                child.id, offset
            ));
            break;
        }
        let payload_at = offset + child.header_len;
        let payload_end = payload_at.saturating_add(child.size.value);
        if payload_end > source.len() {
            issues.note(format!(
                "element 0x{:x} at 0x{:08x} extends past end of data",
                child.id, offset
            ));
            break;
        }

        match child.id {
            ID_SEEK_HEAD | ID_INFO | ID_TRACKS => {
                if let Ok(payload) = source.slice(payload_at, payload_end) {
                    dispatch_child(child.id, &payload, payload_at, data_start, document, issues);
                }
            }
            ID_CUES => document.has_cues = true,
            ID_ATTACHMENTS => {
                document.has_attachments = true;
                if document.is_webm {
                    issues.note("Attachments element is not part of WebM");
                }
            }
            ID_CLUSTER => {
                document.cluster_count += 1;
                // Only the leading Timecode child is of interest.
                let probe_end = payload_end.min(payload_at + 64);
                if let Ok(payload) = source.slice(payload_at, probe_end) {
                    if let Some(timecode) = cluster_timecode(&payload, payload_at) {
                        max_cluster_timecode =
                            Some(max_cluster_timecode.unwrap_or(0).max(timecode));
                    }
                }
            }
            _ => {}
        }
        if payload_end <= offset {
            issues.note(format!("element at 0x{:08x} does not advance", offset));
            break;
        }
        offset = payload_end;
    }

    // SeekHead fallback for whatever the budgeted scan did not reach.
    if document.info.is_none() || document.tracks.is_empty() {
        for (target_id, target_at) in document.seeks.clone() {
            let wanted = (target_id == ID_INFO && document.info.is_none())
                || (target_id == ID_TRACKS && document.tracks.is_empty());
            if !wanted {
                continue;
            }
            if let Some(header) = element_header(source, target_at, issues) {
                if header.id != target_id || header.size.unknown {
                    issues.note(format!(
                        "SeekHead points at 0x{:08x} but element 0x{:x} was found",
                        target_at, header.id
                    ));
                    continue;
                }
                let payload_at = target_at + header.header_len;
                let payload_end = payload_at.saturating_add(header.size.value).min(source.len());
                if let Ok(payload) = source.slice(payload_at, payload_end) {
                    dispatch_child(header.id, &payload, payload_at, data_start, document, issues);
                }
            }
        }
    }

    // Cluster timecodes approximate the duration when Info lacks one.
    let info_duration = document.info.as_ref().and_then(|info| info.duration_raw);
    if info_duration.is_none() {
        if let Some(timecode) = max_cluster_timecode {
            let scale = document
                .info
                .as_ref()
                .map(|info| if info.timecode_scale == 0 { 1_000_000 } else { info.timecode_scale })
                .unwrap_or(1_000_000);
            document.duration_seconds = Some(timecode as f64 * scale as f64 / 1e9);
        }
    }
}

fn dispatch_child(
    id: u32,
    payload: &[u8],
    base: u64,
    segment_data_start: u64,
    document: &mut EbmlDocument,
    issues: &mut IssueLog,
) {
    match id {
        ID_SEEK_HEAD => read_seek_head(payload, base, segment_data_start, document, issues),
        ID_INFO => document.info = Some(read_info(payload, base, issues)),
        ID_TRACKS => read_tracks(payload, base, document, issues),
        _ => {}
    }
}

/// Reads one child element inside an in-memory master payload, returning
/// its id and body slice. Unknown-size children stop the scan.
fn next_child<'a>(reader: &mut Reader<'a>, issues: &mut IssueLog) -> Option<(u32, &'a [u8])> {
    let at = reader.pos();
    let id = reader.read_ebml_id("child id", issues)?;
    let size = reader.read_vint_ebml("child size", issues)?;
    if size.unknown {
        issues.note(format!("child 0x{:x} has unknown size; scan stopped", id));
        return None;
    }
    let body = reader.take(size.value as usize, "child body", issues)?;
    if reader.pos() <= at {
        return None;
    }
    Some((id, body))
}

/// EBML unsigned integer: 0..8 big-endian bytes.
fn unsigned(body: &[u8]) -> u64 {
    body.iter().take(8).fold(0u64, |acc, &b| (acc << 8) | b as u64)
}

/// EBML float: empty (0.0), 4 or 8 big-endian bytes.
fn float(body: &[u8]) -> Option<f64> {
    match body.len() {
        0 => Some(0.0),
        4 => Some(f32::from_be_bytes(body.try_into().ok()?) as f64),
        8 => Some(f64::from_be_bytes(body.try_into().ok()?)),
        _ => None,
    }
}

fn read_seek_head(
    payload: &[u8],
    base: u64,
    segment_data_start: u64,
    document: &mut EbmlDocument,
    issues: &mut IssueLog,
) {
    let mut reader = Reader::new(payload, base);
    let mut children = 0;
    while !reader.at_end() && children < MAX_CHILDREN {
        children += 1;
        let Some((id, body)) = next_child(&mut reader, issues) else { break };
        if id != ID_SEEK {
            continue;
        }
        let mut seek_reader = Reader::new(body, 0);
        let mut target_id = None;
        let mut position = None;
        while !seek_reader.at_end() {
            let Some((child_id, child_body)) = next_child(&mut seek_reader, issues) else {
                break;
            };
            match child_id {
                ID_SEEK_ID => target_id = Some(unsigned(child_body) as u32),
                ID_SEEK_POSITION => position = Some(unsigned(child_body)),
                _ => {}
            }
        }
        if let (Some(id), Some(position)) = (target_id, position) {
            // SeekPosition is relative to the start of the Segment data.
            document.seeks.push((id, segment_data_start + position));
        }
    }
}

fn read_info(payload: &[u8], base: u64, issues: &mut IssueLog) -> SegmentInfo {
    let mut info = SegmentInfo {
        timecode_scale: 1_000_000,
        ..SegmentInfo::default()
    };
    let mut reader = Reader::new(payload, base);
    let mut children = 0;
    while !reader.at_end() && children < MAX_CHILDREN {
        children += 1;
        let Some((id, body)) = next_child(&mut reader, issues) else { break };
        match id {
            ID_TIMECODE_SCALE => info.timecode_scale = unsigned(body),
            ID_DURATION => info.duration_raw = float(body),
            ID_DATE_UTC => info.date_utc = Some(unsigned(body) as i64),
            ID_MUXING_APP => info.muxing_app = String::from_utf8_lossy(body).into_owned(),
            ID_WRITING_APP => info.writing_app = String::from_utf8_lossy(body).into_owned(),
            _ => {}
        }
    }
    info
}

fn read_tracks(payload: &[u8], base: u64, document: &mut EbmlDocument, issues: &mut IssueLog) {
    let mut reader = Reader::new(payload, base);
    let mut children = 0;
    while !reader.at_end() && children < MAX_CHILDREN {
        children += 1;
        let Some((id, body)) = next_child(&mut reader, issues) else { break };
        if id == ID_TRACK_ENTRY {
            document.tracks.push(read_track_entry(body, issues));
        }
    }
}

fn read_track_entry(payload: &[u8], issues: &mut IssueLog) -> Track {
    let mut track = Track::default();
    let mut reader = Reader::new(payload, 0);
    let mut children = 0;
    while !reader.at_end() && children < MAX_CHILDREN {
        children += 1;
        let Some((id, body)) = next_child(&mut reader, issues) else { break };
        match id {
            ID_TRACK_NUMBER => track.number = unsigned(body),
            ID_TRACK_TYPE => {
                track.track_type = unsigned(body);
                track.type_label = track_type_label(track.track_type);
            }
            ID_CODEC_ID => track.codec_id = String::from_utf8_lossy(body).into_owned(),
            ID_TRACK_NAME => track.name = String::from_utf8_lossy(body).into_owned(),
            ID_LANGUAGE => track.language = String::from_utf8_lossy(body).into_owned(),
            ID_VIDEO => {
                let mut video = VideoInfo::default();
                let mut video_reader = Reader::new(body, 0);
                while !video_reader.at_end() {
                    let Some((child_id, child_body)) = next_child(&mut video_reader, issues)
                    else {
                        break;
                    };
                    match child_id {
                        ID_PIXEL_WIDTH => video.pixel_width = unsigned(child_body),
                        ID_PIXEL_HEIGHT => video.pixel_height = unsigned(child_body),
                        _ => {}
                    }
                }
                track.video = Some(video);
            }
            ID_AUDIO => {
                let mut audio = AudioInfo::default();
                let mut audio_reader = Reader::new(body, 0);
                while !audio_reader.at_end() {
                    let Some((child_id, child_body)) = next_child(&mut audio_reader, issues)
                    else {
                        break;
                    };
                    match child_id {
                        ID_SAMPLING_FREQUENCY => {
                            audio.sampling_frequency = float(child_body).unwrap_or(0.0)
                        }
                        ID_CHANNELS => audio.channels = unsigned(child_body),
                        ID_BIT_DEPTH => audio.bit_depth = Some(unsigned(child_body)),
                        _ => {}
                    }
                }
                track.audio = Some(audio);
            }
            _ => {}
        }
    }
    track
}

fn cluster_timecode(payload: &[u8], base: u64) -> Option<u64> {
    let mut reader = Reader::new(payload, base);
    let mut issues = IssueLog::new();
    while !reader.at_end() {
        let (id, body) = next_child(&mut reader, &mut issues)?;
        if id == ID_CLUSTER_TIMECODE {
            return Some(unsigned(body));
        }
    }
    None
}

fn track_type_label(track_type: u64) -> &'static str {
    match track_type {
        1 => "video",
        2 => "audio",
        3 => "complex",
        16 => "logo",
        17 => "subtitle",
        18 => "buttons",
        32 => "control",
        33 => "metadata",
        _ => "unknown",
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::probe::MemorySource;

    fn encode_size(value: u64) -> Vec<u8> {
        // Two-byte form is enough for test payloads.
        vec![0x40 | (value >> 8) as u8, value as u8]
    }

    fn element(id: u32, body: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let id_bytes = id.to_be_bytes();
        let skip = id_bytes.iter().take_while(|&&b| b == 0).count();
        out.extend_from_slice(&id_bytes[skip..]);
        out.extend_from_slice(&encode_size(body.len() as u64));
        out.extend_from_slice(body);
        out
    }

    fn uint(value: u64) -> Vec<u8> {
        let bytes = value.to_be_bytes();
        let skip = bytes.iter().take_while(|&&b| b == 0).count().min(7);
        bytes[skip..].to_vec()
    }

    pub(crate) fn tiny_webm() -> Vec<u8> {
        let mut ebml_body = Vec::new();
        ebml_body.extend_from_slice(&element(ID_EBML_VERSION, &uint(1)));
        ebml_body.extend_from_slice(&element(ID_DOC_TYPE, b"webm"));
        ebml_body.extend_from_slice(&element(ID_DOC_TYPE_VERSION, &uint(4)));

        let mut info_body = Vec::new();
        info_body.extend_from_slice(&element(ID_TIMECODE_SCALE, &uint(1_000_000)));
        info_body.extend_from_slice(&element(
            ID_DURATION,
            &(12_345.0f64).to_be_bytes(),
        ));
        info_body.extend_from_slice(&element(ID_WRITING_APP, b"fileprobe-test"));

        let mut video = Vec::new();
        video.extend_from_slice(&element(ID_PIXEL_WIDTH, &uint(1920)));
        video.extend_from_slice(&element(ID_PIXEL_HEIGHT, &uint(1080)));
        let mut track = Vec::new();
        track.extend_from_slice(&element(ID_TRACK_NUMBER, &uint(1)));
        track.extend_from_slice(&element(ID_TRACK_TYPE, &uint(1)));
        track.extend_from_slice(&element(ID_CODEC_ID, b"V_VP9"));
        track.extend_from_slice(&element(ID_VIDEO, &video));
        let tracks_body = element(ID_TRACK_ENTRY, &track);

        let mut segment_body = Vec::new();
        segment_body.extend_from_slice(&element(ID_INFO, &info_body));
        segment_body.extend_from_slice(&element(ID_TRACKS, &tracks_body));

        let mut data = element(ID_EBML, &ebml_body);
        data.extend_from_slice(&element(ID_SEGMENT, &segment_body));
        data
    }

    #[test]
    fn webm_header_info_and_tracks() {
        let document =
            analyze(&MemorySource::new(tiny_webm()), &ProbeOptions::default()).unwrap();
        assert!(document.is_webm);
        assert_eq!(document.header.doc_type, "webm");
        assert_eq!(document.header.doc_type_version, 4);
        let info = document.info.as_ref().unwrap();
        assert_eq!(info.timecode_scale, 1_000_000);
        assert_eq!(info.writing_app, "fileprobe-test");
        assert_eq!(document.tracks.len(), 1);
        let track = &document.tracks[0];
        assert_eq!(track.codec_id, "V_VP9");
        assert_eq!(track.type_label, "video");
        let video = track.video.as_ref().unwrap();
        assert_eq!((video.pixel_width, video.pixel_height), (1920, 1080));
        // 12345 ms at the default scale.
        assert!((document.duration_seconds.unwrap() - 12.345).abs() < 1e-9);
        assert!(document.issues.is_empty());
    }

    #[test]
    fn non_ebml_input_is_rejected() {
        let data = vec![0x00, 0x01, 0x02];
        assert!(analyze(&MemorySource::new(data), &ProbeOptions::default()).is_none());
    }

    #[test]
    fn attachments_in_webm_is_an_issue() {
        let mut ebml_body = Vec::new();
        ebml_body.extend_from_slice(&element(ID_DOC_TYPE, b"webm"));
        let segment_body = element(ID_ATTACHMENTS, &[]);
        let mut data = element(ID_EBML, &ebml_body);
        data.extend_from_slice(&element(ID_SEGMENT, &segment_body));

        let document = analyze(&MemorySource::new(data), &ProbeOptions::default()).unwrap();
        assert!(document.has_attachments);
        assert!(document
            .issues
            .iter()
            .any(|issue| issue.contains("not part of WebM")));
    }
}
