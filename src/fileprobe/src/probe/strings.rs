use super::{IssueLog, Reader};

/// ASCII field of up to `max` bytes: stops at the first NUL, trims trailing
/// spaces, replaces non-ASCII bytes with `?`.
pub fn ascii_field(bytes: &[u8], max: usize) -> String {
    let bytes = &bytes[..bytes.len().min(max)];
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    let mut text: String = bytes[..end]
        .iter()
        .map(|&b| if b.is_ascii() && b >= 0x20 { b as char } else { '?' })
        .collect();
    while text.ends_with(' ') {
        text.pop();
    }
    text
}

/// NUL-terminated ASCII starting at `offset` within the window, capped at
/// `max` bytes. Returns `None` when the offset is outside the window.
pub fn cstring_at(reader: &Reader<'_>, offset: usize, max: usize) -> Option<String> {
    let bytes = reader.bytes().get(offset..)?;
    let bytes = &bytes[..bytes.len().min(max)];
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    Some(ascii_field(&bytes[..end], end))
}

/// Latin-1 (each byte is its own code point). RAR4 names without the
/// unicode flag use this.
pub fn latin1_string(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// UTF-16LE, up to `max_units` code units, stopping at NUL.
pub fn utf16le_string(bytes: &[u8], max_units: usize) -> String {
    let mut units = Vec::new();
    for pair in bytes.chunks_exact(2).take(max_units) {
        let unit = u16::from_le_bytes([pair[0], pair[1]]);
        if unit == 0 {
            break;
        }
        units.push(unit);
    }
    String::from_utf16_lossy(&units)
}

/// UCS-2BE (Joliet identifiers), stopping at NUL.
pub fn ucs2be_string(bytes: &[u8], max_units: usize) -> String {
    let mut units = Vec::new();
    for pair in bytes.chunks_exact(2).take(max_units) {
        let unit = u16::from_be_bytes([pair[0], pair[1]]);
        if unit == 0 {
            break;
        }
        units.push(unit);
    }
    String::from_utf16_lossy(&units)
}

/// Length-prefixed string whose character width follows the format's
/// unicode flag (LNK string data): the u16 count is in characters, not
/// bytes.
pub fn read_counted_string(
    reader: &mut Reader<'_>,
    unicode: bool,
    label: &str,
    issues: &mut IssueLog,
) -> Option<String> {
    let count = reader.read_u16_le(label, issues)? as usize;
    if unicode {
        let raw = reader.take(count * 2, label, issues)?;
        Some(utf16le_string(raw, count))
    } else {
        let raw = reader.take(count, label, issues)?;
        Some(latin1_string(raw))
    }
}

/// All maximal runs of printable bytes (`0x20..=0x7E`) of length >= `min`.
pub fn printable_runs(bytes: &[u8], min: usize) -> Vec<String> {
    let mut runs = Vec::new();
    let mut start = None;
    for (i, &b) in bytes.iter().enumerate() {
        let printable = (0x20..=0x7e).contains(&b);
        match (printable, start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                if i - s >= min {
                    runs.push(ascii_field(&bytes[s..i], i - s));
                }
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        if bytes.len() - s >= min {
            runs.push(ascii_field(&bytes[s..], bytes.len() - s));
        }
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_field_trims_and_stops() {
        assert_eq!(ascii_field(b"hello\0world", 11), "hello");
        assert_eq!(ascii_field(b"name    ", 8), "name");
    }

    #[test]
    fn utf16_stops_at_nul() {
        let raw = [b'H', 0, b'i', 0, 0, 0, b'x', 0];
        assert_eq!(utf16le_string(&raw, 4), "Hi");
    }

    #[test]
    fn printable_runs_min_length() {
        let data = b"\x00\x01abc\xff.hello world\x02x";
        assert_eq!(printable_runs(data, 4), vec![".hello world"]);
    }
}
