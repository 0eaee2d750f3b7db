//! Classic (pre-pcapng) packet capture files.

use std::collections::HashMap;

use log::debug;

use crate::probe::{ByteSource, IssueLog, ProbeOptions, Reader, Stage};

/// Microsecond-resolution magic, as written (`0xA1B2C3D4`) and byte-swapped.
pub const MAGIC_US: u32 = 0xA1B2_C3D4;
pub const MAGIC_US_SWAPPED: u32 = 0xD4C3_B2A1;
/// Nanosecond-resolution magic (`0xA1B23C4D`) and byte-swapped.
pub const MAGIC_NS: u32 = 0xA1B2_3C4D;
pub const MAGIC_NS_SWAPPED: u32 = 0x4D3C_B2A1;

/// How many leading payload bytes of each Ethernet frame are inspected for
/// the link-layer summary.
const ETHERNET_SAMPLE: usize = 128;

/// The issue log is capped; a flood of malformed records must not balloon
/// the report.
const ISSUE_CAP: usize = 200;

/// # PCAP global header
///
/// 24 bytes (<https://wiki.wireshark.org/Development/LibpcapFileFormat>):
///
/// | Offset | Size | Field |
/// | ------ | ---- | ----- |
/// | 0      | 4    | Magic (selects endianness and timestamp resolution) |
/// | 4      | 2    | Major version (2) |
/// | 6      | 2    | Minor version (4) |
/// | 8      | 4    | Timezone correction, seconds (usually 0) |
/// | 12     | 4    | Timestamp accuracy (usually 0) |
/// | 16     | 4    | Snapshot length |
/// | 20     | 4    | Link-layer type |
#[derive(Debug)]
pub struct PcapHeader {
    pub big_endian: bool,
    pub nanosecond: bool,
    pub version_major: u16,
    pub version_minor: u16,
    pub thiszone: i32,
    pub snaplen: u32,
    pub linktype: u32,
}

/// Per-record bookkeeping; payloads are sampled, never stored.
#[derive(Debug, Default)]
pub struct RecordStats {
    pub count: u64,
    pub total_captured: u64,
    pub total_original: u64,
    pub truncated_records: u64,
    pub over_snaplen: u64,
    pub captured_over_original: u64,
    pub backward_timestamps: u64,
    pub first_ts: Option<String>,
    pub last_ts: Option<String>,
}

/// EtherType / VLAN / IP next-header tallies over the first
/// [`ETHERNET_SAMPLE`] bytes of each frame. Only produced for link type 1.
#[derive(Debug, Default)]
pub struct EthernetSummary {
    pub ethertypes: HashMap<u16, u64>,
    pub vlan_tagged: u64,
    pub ipv4_protocols: HashMap<u8, u64>,
    pub ipv6_next_headers: HashMap<u8, u64>,
}

#[derive(Debug)]
pub struct PcapCapture {
    pub header: PcapHeader,
    pub records: RecordStats,
    pub ethernet: Option<EthernetSummary>,
    pub issues: Vec<String>,
}

pub fn analyze(source: &dyn ByteSource, options: &ProbeOptions<'_>) -> PcapCapture {
    debug!("pcap: analyzing {} bytes", source.len());
    let mut issues = IssueLog::with_cap(ISSUE_CAP);

    let window = match source.slice(0, source.len()) {
        Ok(window) => window,
        Err(error) => {
            issues.note(format!("parse aborted: {}", error));
            Vec::new()
        }
    };
    let mut reader = Reader::new(&window, 0);

    let magic = reader.u32_le_at(0).unwrap_or(0);
    let (big_endian, nanosecond) = match magic {
        MAGIC_US => (false, false),
        MAGIC_NS => (false, true),
        // The file stores the opposite byte order from ours.
        MAGIC_US_SWAPPED => (true, false),
        MAGIC_NS_SWAPPED => (true, true),
        _ => {
            issues.note(format!("unrecognized pcap magic 0x{:08x}", magic));
            (false, false)
        }
    };

    reader.set_pos(4);
    let mut header = PcapHeader {
        big_endian,
        nanosecond,
        version_major: 0,
        version_minor: 0,
        thiszone: 0,
        snaplen: 0,
        linktype: 0,
    };
    let header_complete =
        read_header_fields(&mut reader, &mut header, &mut issues).is_some();

    let mut records = RecordStats::default();
    let mut ethernet = (header.linktype == 1).then(EthernetSummary::default);

    if header_complete {
        let mut prev_ts: Option<(u32, u32)> = None;
        while !reader.at_end() {
            if records.count % options.yield_interval as u64 == 0 {
                options.report(Stage::Records, reader.pos() as u64, records.count);
                if options.cancelled() {
                    issues.note("cancelled");
                    break;
                }
            }

            let record_at = reader.absolute();
            let Some(ts_sec) = read_u32_endian(&mut reader, big_endian, "record timestamp", &mut issues) else {
                break;
            };
            let Some(ts_subsec) = read_u32_endian(&mut reader, big_endian, "record timestamp", &mut issues) else {
                break;
            };
            let Some(captured) = read_u32_endian(&mut reader, big_endian, "record captured length", &mut issues)
            else {
                break;
            };
            let Some(original) = read_u32_endian(&mut reader, big_endian, "record original length", &mut issues)
            else {
                break;
            };

            if captured > header.snaplen {
                records.over_snaplen += 1;
                issues.note(format!(
                    "record at 0x{:08x} captured length {} exceeds snaplen {}",
                    record_at, captured, header.snaplen
                ));
            }
            if captured > original {
                records.captured_over_original += 1;
                issues.note(format!(
                    "record at 0x{:08x} captured length {} exceeds original length {}",
                    record_at, captured, original
                ));
            }
            if let Some(prev) = prev_ts {
                if (ts_sec, ts_subsec) < prev {
                    records.backward_timestamps += 1;
                }
            }
            prev_ts = Some((ts_sec, ts_subsec));

            let iso = crate::probe::unix_to_iso8601(ts_sec as i64);
            if records.first_ts.is_none() {
                records.first_ts = iso.clone();
            }
            records.last_ts = iso;

            let payload_len = (captured as usize).min(reader.remaining());
            if payload_len < captured as usize {
                records.truncated_records += 1;
                issues.note(format!(
                    "record at 0x{:08x} payload extends past end of data",
                    record_at
                ));
            }
            let payload = reader
                .take(payload_len, "record payload", &mut issues)
                .unwrap_or(&[]);
            if let Some(summary) = ethernet.as_mut() {
                sample_ethernet(&payload[..payload.len().min(ETHERNET_SAMPLE)], summary);
            }

            records.count += 1;
            records.total_captured += captured as u64;
            records.total_original += original as u64;

            if payload_len < captured as usize {
                break;
            }
        }
    }

    PcapCapture {
        header,
        records,
        ethernet,
        issues: issues.into_entries(),
    }
}


fn read_u16_endian(
    reader: &mut Reader<'_>,
    big_endian: bool,
    label: &str,
    issues: &mut IssueLog,
) -> Option<u16> {
    if big_endian {
        reader.read_u16_be(label, issues)
    } else {
        reader.read_u16_le(label, issues)
    }
}

fn read_u32_endian(
    reader: &mut Reader<'_>,
    big_endian: bool,
    label: &str,
    issues: &mut IssueLog,
) -> Option<u32> {
    if big_endian {
        reader.read_u32_be(label, issues)
    } else {
        reader.read_u32_le(label, issues)
    }
}

fn read_header_fields(
    reader: &mut Reader<'_>,
    header: &mut PcapHeader,
    issues: &mut IssueLog,
) -> Option<()> {
    let big_endian = header.big_endian;
    header.version_major = read_u16_endian(reader, big_endian, "version major", issues)?;
    header.version_minor = read_u16_endian(reader, big_endian, "version minor", issues)?;
    header.thiszone = read_u32_endian(reader, big_endian, "thiszone", issues)? as i32;
    read_u32_endian(reader, big_endian, "sigfigs", issues)?;
    header.snaplen = read_u32_endian(reader, big_endian, "snaplen", issues)?;
    header.linktype = read_u32_endian(reader, big_endian, "linktype", issues)?;
    Some(())
}

/// Minimal Ethernet II / 802.1Q / IPv4 / IPv6 field picks. Anything that
/// does not decode is silently skipped; this is a survey, not a protocol
/// stack.
fn sample_ethernet(frame: &[u8], summary: &mut EthernetSummary) {
    if frame.len() < 14 {
        return;
    }
    let mut ethertype = u16::from_be_bytes([frame[12], frame[13]]);
    let mut header_len = 14;
    // Single 802.1Q tag.
    if ethertype == 0x8100 && frame.len() >= 18 {
        summary.vlan_tagged += 1;
        ethertype = u16::from_be_bytes([frame[16], frame[17]]);
        header_len = 18;
    }
    *summary.ethertypes.entry(ethertype).or_insert(0) += 1;

    let payload = &frame[header_len..];
    match ethertype {
        0x0800 if payload.len() >= 10 => {
            *summary.ipv4_protocols.entry(payload[9]).or_insert(0) += 1;
        }
        0x86dd if payload.len() >= 7 => {
            *summary.ipv6_next_headers.entry(payload[6]).or_insert(0) += 1;
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::MemorySource;

    fn capture(records: &[(u32, u32, &[u8], u32)]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&MAGIC_US.to_le_bytes());
        data.extend_from_slice(&2u16.to_le_bytes());
        data.extend_from_slice(&4u16.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&65_535u32.to_le_bytes());
        data.extend_from_slice(&1u32.to_le_bytes());
        for &(sec, subsec, payload, original) in records {
            data.extend_from_slice(&sec.to_le_bytes());
            data.extend_from_slice(&subsec.to_le_bytes());
            data.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            data.extend_from_slice(&original.to_le_bytes());
            data.extend_from_slice(payload);
        }
        data
    }

    fn ether_frame(ethertype: u16) -> Vec<u8> {
        let mut frame = vec![0u8; 14];
        frame[12..14].copy_from_slice(&ethertype.to_be_bytes());
        frame.extend_from_slice(&[0u8; 20]);
        frame
    }

    #[test]
    fn walks_records_and_counts() {
        let frame = ether_frame(0x0800);
        let data = capture(&[
            (100, 0, &frame, frame.len() as u32),
            (101, 0, &frame, frame.len() as u32),
        ]);
        let capture = analyze(&MemorySource::new(data), &ProbeOptions::default());
        assert_eq!(capture.records.count, 2);
        assert_eq!(capture.records.backward_timestamps, 0);
        assert!(capture.issues.is_empty());
        let ethernet = capture.ethernet.unwrap();
        assert_eq!(ethernet.ethertypes.get(&0x0800), Some(&2));
    }

    #[test]
    fn constraint_violations_are_counted_not_fatal() {
        let frame = ether_frame(0x86dd);
        // captured > original, and timestamps run backward.
        let data = capture(&[
            (200, 0, &frame, 1),
            (150, 0, &frame, frame.len() as u32),
        ]);
        let capture = analyze(&MemorySource::new(data), &ProbeOptions::default());
        assert_eq!(capture.records.count, 2);
        assert_eq!(capture.records.captured_over_original, 1);
        assert_eq!(capture.records.backward_timestamps, 1);
        assert_eq!(capture.issues.len(), 1);
    }

    #[test]
    fn swapped_magic_reads_big_endian() {
        let mut data = Vec::new();
        data.extend_from_slice(&MAGIC_US.to_be_bytes());
        data.extend_from_slice(&2u16.to_be_bytes());
        data.extend_from_slice(&4u16.to_be_bytes());
        data.extend_from_slice(&[0u8; 8]);
        data.extend_from_slice(&262_144u32.to_be_bytes());
        data.extend_from_slice(&1u32.to_be_bytes());
        let capture = analyze(&MemorySource::new(data), &ProbeOptions::default());
        assert!(capture.header.big_endian);
        assert_eq!(capture.header.snaplen, 262_144);
        assert_eq!(capture.records.count, 0);
    }
}
