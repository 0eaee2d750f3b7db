//! Windows Shell Link (.lnk) files, per MS-SHLLINK.

use log::debug;

use crate::probe::{
    ascii_field, dos_datetime_to_iso8601, filetime_to_iso8601, latin1_string, read_counted_string,
    utf16le_string, ByteSource, IssueLog, ProbeOptions, Reader,
};

pub const HEADER_SIZE: u32 = 0x4C;
/// Shell Link class identifier `00021401-0000-0000-C000-000000000046`.
pub const LINK_CLSID: [u8; 16] = [
    0x01, 0x14, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0xC0, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x46,
];

/// # LinkFlags (MS-SHLLINK 2.1.1)
///
/// | Flag                   | Value  | Gates |
/// | ---------------------- | ------ | ----- |
/// | `HasLinkTargetIDList`  | 0x0001 | LinkTargetIDList section |
/// | `HasLinkInfo`          | 0x0002 | LinkInfo section |
/// | `HasName`              | 0x0004 | NAME_STRING |
/// | `HasRelativePath`      | 0x0008 | RELATIVE_PATH |
/// | `HasWorkingDir`        | 0x0010 | WORKING_DIR |
/// | `HasArguments`         | 0x0020 | COMMAND_LINE_ARGUMENTS |
/// | `HasIconLocation`      | 0x0040 | ICON_LOCATION |
/// | `IsUnicode`            | 0x0080 | string-data character width |
/// | `ForceNoLinkInfo`      | 0x0100 | suppresses LinkInfo |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkFlags(pub u32);

impl LinkFlags {
    pub const HAS_LINK_TARGET_ID_LIST: u32 = 0x0001;
    pub const HAS_LINK_INFO: u32 = 0x0002;
    pub const HAS_NAME: u32 = 0x0004;
    pub const HAS_RELATIVE_PATH: u32 = 0x0008;
    pub const HAS_WORKING_DIR: u32 = 0x0010;
    pub const HAS_ARGUMENTS: u32 = 0x0020;
    pub const HAS_ICON_LOCATION: u32 = 0x0040;
    pub const IS_UNICODE: u32 = 0x0080;
    pub const FORCE_NO_LINK_INFO: u32 = 0x0100;

    pub fn check_flag(&self, flag: u32) -> bool {
        self.0 & flag == flag
    }
}

/// # Shell link header (MS-SHLLINK 2.1)
///
/// | Offset | Size | Field |
/// | ------ | ---- | ----- |
/// | 0      | 4    | HeaderSize, always 0x4C |
/// | 4      | 16   | LinkCLSID |
/// | 20     | 4    | LinkFlags |
/// | 24     | 4    | FileAttributes |
/// | 28     | 8    | CreationTime |
/// | 36     | 8    | AccessTime |
/// | 44     | 8    | WriteTime |
/// | 52     | 4    | FileSize (target, low 32 bits) |
/// | 56     | 4    | IconIndex |
/// | 60     | 4    | ShowCommand |
/// | 64     | 2    | HotKey |
/// | 66     | 10   | Reserved |
#[derive(Debug)]
pub struct LnkHeader {
    pub link_flags: LinkFlags,
    pub file_attributes: u32,
    pub created_iso: Option<String>,
    pub accessed_iso: Option<String>,
    pub modified_iso: Option<String>,
    pub target_size: u32,
    pub icon_index: i32,
    pub show_command: u32,
    pub show_command_label: &'static str,
    pub hotkey: u16,
}

impl LnkHeader {
    pub fn from(slice: &[u8; 76]) -> LnkHeader {
        let show_command = u32::from_le_bytes(slice[60..64].try_into().unwrap());
        LnkHeader {
            link_flags: LinkFlags(u32::from_le_bytes(slice[20..24].try_into().unwrap())),
            file_attributes: u32::from_le_bytes(slice[24..28].try_into().unwrap()),
            created_iso: filetime_to_iso8601(u64::from_le_bytes(slice[28..36].try_into().unwrap())),
            accessed_iso: filetime_to_iso8601(u64::from_le_bytes(slice[36..44].try_into().unwrap())),
            modified_iso: filetime_to_iso8601(u64::from_le_bytes(slice[44..52].try_into().unwrap())),
            target_size: u32::from_le_bytes(slice[52..56].try_into().unwrap()),
            icon_index: i32::from_le_bytes(slice[56..60].try_into().unwrap()),
            show_command,
            show_command_label: match show_command {
                1 => "SW_SHOWNORMAL",
                3 => "SW_SHOWMAXIMIZED",
                7 => "SW_SHOWMINNOACTIVE",
                _ => "SW_SHOWNORMAL (fallback)",
            },
            hotkey: u16::from_le_bytes(slice[64..66].try_into().unwrap()),
        }
    }
}

/// One item of the LinkTargetIDList, classified by its leading type byte.
#[derive(Debug)]
pub enum PidlItem {
    /// 0x1F: a root folder identified by CLSID.
    RootClsid { clsid: String },
    /// 0x2F: a drive letter path like `C:\`.
    Drive { path: String },
    /// 0x31 (folder) / 0x32 (file) with DOS timestamps; the long UTF-16
    /// name comes from a 0xBEEF0004 extension block when present.
    Entry {
        is_directory: bool,
        short_name: String,
        long_name: Option<String>,
        file_size: u32,
        modified_iso: Option<String>,
    },
    Other { type_byte: u8, length: usize },
}

#[derive(Debug)]
pub struct VolumeId {
    pub drive_type: u32,
    pub drive_type_label: &'static str,
    pub serial_number: u32,
    pub label: String,
}

#[derive(Debug)]
pub struct NetworkLink {
    pub net_name: String,
    pub device_name: String,
    pub provider_type: u32,
}

#[derive(Debug, Default)]
pub struct LinkInfo {
    pub volume: Option<VolumeId>,
    pub network: Option<NetworkLink>,
    pub local_base_path: Option<String>,
    pub common_path_suffix: Option<String>,
    pub local_base_path_unicode: Option<String>,
}

/// VARIANT-style scalar inside a serialized property storage. Unknown
/// types are preserved as raw tags.
#[derive(Debug)]
pub enum PropertyValue {
    Str(String),
    U4(u32),
    I4(i32),
    Bool(bool),
    FileTime(Option<String>),
    Clsid(String),
    Other { vt: u16, length: usize },
}

#[derive(Debug)]
pub struct StoreProperty {
    pub pid: u32,
    pub value: PropertyValue,
}

#[derive(Debug)]
pub struct PropertyStorage {
    pub format_id: String,
    pub properties: Vec<StoreProperty>,
}

#[derive(Debug)]
pub enum ExtraBlock {
    /// 0xA0000001
    EnvironmentVariables { ansi: String, unicode: String },
    /// 0xA0000003
    Tracker { machine_id: String, droid: String },
    /// 0xA0000004
    ConsoleFe { code_page: u32 },
    /// 0xA0000005
    SpecialFolder { folder_id: u32, offset: u32 },
    /// 0xA0000009
    PropertyStore { storages: Vec<PropertyStorage> },
    /// 0xA000000B. The offset field's meaning shifted after Vista; it is
    /// carried through untouched.
    KnownFolder { known_folder_id: String, offset: u32 },
    /// 0xA000000C
    VistaIdList { items: usize },
    Other { signature: u32, size: u32 },
}

#[derive(Debug)]
pub struct ShellLink {
    pub header: LnkHeader,
    pub id_list: Vec<PidlItem>,
    pub link_info: Option<LinkInfo>,
    pub name: Option<String>,
    pub relative_path: Option<String>,
    pub working_dir: Option<String>,
    pub arguments: Option<String>,
    pub icon_location: Option<String>,
    pub extra_blocks: Vec<ExtraBlock>,
    pub issues: Vec<String>,
}

pub fn analyze(source: &dyn ByteSource, _options: &ProbeOptions<'_>) -> Option<ShellLink> {
    debug!("lnk: analyzing {} bytes", source.len());
    let mut issues = IssueLog::new();

    let window = source.slice(0, source.len()).ok()?;
    if window.len() < 76 {
        return None;
    }
    let mut reader = Reader::new(&window, 0);
    let raw = reader.take(76, "shell link header", &mut issues)?;
    let raw: &[u8; 76] = raw.try_into().ok()?;
    if u32::from_le_bytes(raw[0..4].try_into().ok()?) != HEADER_SIZE {
        return None;
    }
    if raw[4..20] != LINK_CLSID {
        issues.note("header CLSID is not the shell link CLSID");
        return None;
    }
    let header = LnkHeader::from(raw);
    let flags = header.link_flags;
    let unicode = flags.check_flag(LinkFlags::IS_UNICODE);

    let mut link = ShellLink {
        header,
        id_list: Vec::new(),
        link_info: None,
        name: None,
        relative_path: None,
        working_dir: None,
        arguments: None,
        icon_location: None,
        extra_blocks: Vec::new(),
        issues: Vec::new(),
    };

    if flags.check_flag(LinkFlags::HAS_LINK_TARGET_ID_LIST) {
        read_id_list(&mut reader, &mut link, &mut issues);
    }
    if flags.check_flag(LinkFlags::HAS_LINK_INFO)
        && !flags.check_flag(LinkFlags::FORCE_NO_LINK_INFO)
    {
        link.link_info = read_link_info(&mut reader, &mut issues);
    }

    // String data, in gate-bit order.
    for (bit, slot) in [
        (LinkFlags::HAS_NAME, 0usize),
        (LinkFlags::HAS_RELATIVE_PATH, 1),
        (LinkFlags::HAS_WORKING_DIR, 2),
        (LinkFlags::HAS_ARGUMENTS, 3),
        (LinkFlags::HAS_ICON_LOCATION, 4),
    ] {
        if !flags.check_flag(bit) {
            continue;
        }
        let value = read_counted_string(&mut reader, unicode, "string data", &mut issues);
        match slot {
            0 => link.name = value,
            1 => link.relative_path = value,
            2 => link.working_dir = value,
            3 => link.arguments = value,
            _ => link.icon_location = value,
        }
    }

    read_extra_blocks(&mut reader, &mut link, &mut issues);

    link.issues = issues.into_entries();
    Some(link)
}

/// LinkTargetIDList: u16 total size, then `[u16 item size | body]` items
/// terminated by a zero-size item.
fn read_id_list(reader: &mut Reader<'_>, link: &mut ShellLink, issues: &mut IssueLog) {
    let Some(list_size) = reader.read_u16_le("id list size", issues) else { return };
    let list_end = reader.pos() + list_size as usize;
    loop {
        if reader.pos() + 2 > list_end {
            issues.note(format!(
                "id list at 0x{:08x} ends without a terminator",
                reader.absolute()
            ));
            break;
        }
        let Some(item_size) = reader.read_u16_le("id list item size", issues) else { return };
        if item_size == 0 {
            break;
        }
        if item_size < 2 || reader.pos() + item_size as usize - 2 > list_end {
            issues.note(format!(
                "id list item at 0x{:08x} overruns the list",
                reader.absolute()
            ));
            reader.set_pos(list_end);
            break;
        }
        let Some(body) = reader.take(item_size as usize - 2, "id list item", issues) else {
            return;
        };
        link.id_list.push(classify_pidl(body));
    }
    reader.set_pos(list_end.min(reader.len()));
}

fn classify_pidl(body: &[u8]) -> PidlItem {
    let Some(&type_byte) = body.first() else {
        return PidlItem::Other { type_byte: 0, length: 0 };
    };
    match type_byte {
        0x1F if body.len() >= 18 => PidlItem::RootClsid { clsid: guid_string(&body[2..18]) },
        0x2F => PidlItem::Drive { path: ascii_field(&body[1..], body.len() - 1) },
        0x31 | 0x32 => {
            // [type, 0, file size u32, dos date u16, dos time u16,
            //  attributes u16, short name...], then extension blocks.
            if body.len() < 12 {
                return PidlItem::Other { type_byte, length: body.len() };
            }
            let file_size = u32::from_le_bytes(body[2..6].try_into().unwrap());
            let dos_date = u16::from_le_bytes(body[6..8].try_into().unwrap());
            let dos_time = u16::from_le_bytes(body[8..10].try_into().unwrap());
            let short_name = ascii_field(&body[12..], body.len() - 12);
            PidlItem::Entry {
                is_directory: type_byte == 0x31,
                long_name: beef0004_long_name(body),
                short_name,
                file_size,
                modified_iso: dos_datetime_to_iso8601(dos_date, dos_time),
            }
        }
        _ => PidlItem::Other { type_byte, length: body.len() },
    }
}

/// Scans an item body for the 0xBEEF0004 extension block and pulls its
/// UTF-16 long name (at offset 22 within the block for version >= 3).
fn beef0004_long_name(body: &[u8]) -> Option<String> {
    let signature = 0xBEEF_0004u32.to_le_bytes();
    let at = body.windows(4).position(|window| window == signature)?;
    let block = &body[at.checked_sub(4)?..];
    let name_at = 22;
    if block.len() <= name_at {
        return None;
    }
    let name = utf16le_string(&block[name_at..], 260);
    (!name.is_empty()).then_some(name)
}

/// # LinkInfo (MS-SHLLINK 2.3)
///
/// | Offset | Size | Field |
/// | ------ | ---- | ----- |
/// | 0      | 4    | LinkInfoSize |
/// | 4      | 4    | LinkInfoHeaderSize (>= 0x24 adds unicode offsets) |
/// | 8      | 4    | LinkInfoFlags |
/// | 12     | 4    | VolumeIDOffset |
/// | 16     | 4    | LocalBasePathOffset |
/// | 20     | 4    | CommonNetworkRelativeLinkOffset |
/// | 24     | 4    | CommonPathSuffixOffset |
fn read_link_info(reader: &mut Reader<'_>, issues: &mut IssueLog) -> Option<LinkInfo> {
    let info_at = reader.pos();
    let total_size = reader.read_u32_le("link info size", issues)? as usize;
    if total_size < 0x1c {
        issues.note(format!(
            "link info at 0x{:08x} declares impossible size {}",
            reader.absolute(),
            total_size
        ));
        return None;
    }
    let raw = reader
        .peek_at(info_at, total_size.min(reader.len() - info_at))
        .unwrap_or(&[]);
    reader.set_pos((info_at + total_size).min(reader.len()));
    if raw.len() < total_size {
        issues.note("link info extends past end of data");
    }
    if raw.len() < 0x1c {
        return None;
    }

    let info_reader = Reader::new(raw, info_at as u64);
    let header_size = info_reader.u32_le_at(4)? as usize;
    let info_flags = info_reader.u32_le_at(8)?;
    let volume_offset = info_reader.u32_le_at(12)? as usize;
    let base_path_offset = info_reader.u32_le_at(16)? as usize;
    let network_offset = info_reader.u32_le_at(20)? as usize;
    let suffix_offset = info_reader.u32_le_at(24)? as usize;

    let mut info = LinkInfo::default();

    // Flag 0x1: VolumeID + local base path.
    if info_flags & 0x1 != 0 {
        info.volume = read_volume_id(raw, volume_offset, issues);
        if base_path_offset > 0 && base_path_offset < raw.len() {
            info.local_base_path = cstring_from(raw, base_path_offset);
        }
        if header_size >= 0x24 {
            if let Some(unicode_offset) = info_reader.u32_le_at(28) {
                let unicode_offset = unicode_offset as usize;
                if unicode_offset > 0 && unicode_offset < raw.len() {
                    info.local_base_path_unicode =
                        Some(utf16le_string(&raw[unicode_offset..], 260));
                }
            }
        }
    }
    // Flag 0x2: common network relative link.
    if info_flags & 0x2 != 0 {
        info.network = read_network_link(raw, network_offset, issues);
    }
    if suffix_offset > 0 && suffix_offset < raw.len() {
        info.common_path_suffix = cstring_from(raw, suffix_offset).filter(|s| !s.is_empty());
    }
    Some(info)
}

fn cstring_from(raw: &[u8], offset: usize) -> Option<String> {
    let bytes = raw.get(offset..)?;
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    Some(latin1_string(&bytes[..end]))
}

fn read_volume_id(raw: &[u8], offset: usize, issues: &mut IssueLog) -> Option<VolumeId> {
    let body = raw.get(offset..)?;
    if body.len() < 0x10 {
        issues.note("volume id structure is truncated");
        return None;
    }
    let drive_type = u32::from_le_bytes(body[4..8].try_into().unwrap());
    let serial_number = u32::from_le_bytes(body[8..12].try_into().unwrap());
    let label_offset = u32::from_le_bytes(body[12..16].try_into().unwrap()) as usize;
    let label = cstring_from(body, label_offset).unwrap_or_default();
    Some(VolumeId {
        drive_type,
        drive_type_label: match drive_type {
            1 => "no root directory",
            2 => "removable",
            3 => "fixed",
            4 => "remote",
            5 => "CD-ROM",
            6 => "RAM disk",
            _ => "unknown",
        },
        serial_number,
        label,
    })
}

fn read_network_link(raw: &[u8], offset: usize, issues: &mut IssueLog) -> Option<NetworkLink> {
    let body = raw.get(offset..)?;
    if body.len() < 0x14 {
        issues.note("common network relative link is truncated");
        return None;
    }
    let net_name_offset = u32::from_le_bytes(body[8..12].try_into().unwrap()) as usize;
    let device_name_offset = u32::from_le_bytes(body[12..16].try_into().unwrap()) as usize;
    let provider_type = u32::from_le_bytes(body[16..20].try_into().unwrap());
    Some(NetworkLink {
        net_name: cstring_from(body, net_name_offset).unwrap_or_default(),
        device_name: cstring_from(body, device_name_offset).unwrap_or_default(),
        provider_type,
    })
}

/// ExtraData: `[u32 size | u32 signature | body]` blocks; a size below 4
/// terminates the chain.
fn read_extra_blocks(reader: &mut Reader<'_>, link: &mut ShellLink, issues: &mut IssueLog) {
    loop {
        if reader.remaining() < 4 {
            break;
        }
        let at = reader.absolute();
        let Some(size) = reader.read_u32_le("extra block size", issues) else { break };
        if size < 4 {
            break;
        }
        if size < 8 || size as usize - 4 > reader.remaining() {
            issues.note(format!("extra block at 0x{:08x} overruns the file", at));
            break;
        }
        let Some(signature) = reader.read_u32_le("extra block signature", issues) else { break };
        let Some(body) = reader.take(size as usize - 8, "extra block body", issues) else {
            break;
        };
        link.extra_blocks.push(decode_extra_block(signature, size, body, issues));
    }
}

fn decode_extra_block(
    signature: u32,
    size: u32,
    body: &[u8],
    issues: &mut IssueLog,
) -> ExtraBlock {
    match signature {
        0xA000_0001 if body.len() >= 260 => ExtraBlock::EnvironmentVariables {
            ansi: ascii_field(&body[..260], 260),
            unicode: if body.len() >= 260 + 520 {
                utf16le_string(&body[260..260 + 520], 260)
            } else {
                String::new()
            },
        },
        0xA000_0003 if body.len() >= 0x58 - 8 => ExtraBlock::Tracker {
            machine_id: ascii_field(&body[8..24], 16),
            droid: guid_string(&body[24..40]),
        },
        0xA000_0004 if body.len() >= 4 => ExtraBlock::ConsoleFe {
            code_page: u32::from_le_bytes(body[..4].try_into().unwrap()),
        },
        0xA000_0005 if body.len() >= 8 => ExtraBlock::SpecialFolder {
            folder_id: u32::from_le_bytes(body[..4].try_into().unwrap()),
            offset: u32::from_le_bytes(body[4..8].try_into().unwrap()),
        },
        0xA000_0009 => ExtraBlock::PropertyStore {
            storages: read_property_store(body, issues),
        },
        0xA000_000B if body.len() >= 20 => ExtraBlock::KnownFolder {
            known_folder_id: guid_string(&body[..16]),
            offset: u32::from_le_bytes(body[16..20].try_into().unwrap()),
        },
        0xA000_000C => ExtraBlock::VistaIdList {
            items: count_pidl_items(body),
        },
        _ => {
            issues.note(format!("unknown extra data block 0x{:08x}", signature));
            ExtraBlock::Other { signature, size }
        }
    }
}

fn count_pidl_items(body: &[u8]) -> usize {
    let mut count = 0;
    let mut pos = 0;
    while pos + 2 <= body.len() {
        let size = u16::from_le_bytes([body[pos], body[pos + 1]]) as usize;
        if size < 2 {
            break;
        }
        count += 1;
        pos += size;
    }
    count
}

/// # Serialized property store (MS-PROPSTORE)
///
/// Each storage is `[u32 size | u32 version "1SPS" | GUID fmtid |
/// properties]`; each property is `[u32 size | u32 id | u8 reserved |
/// TypedPropertyValue]` with `[u16 vt | u16 pad | value]`.
fn read_property_store(body: &[u8], issues: &mut IssueLog) -> Vec<PropertyStorage> {
    let mut storages = Vec::new();
    let mut pos = 0;
    while pos + 4 <= body.len() {
        let storage_size = u32::from_le_bytes(body[pos..pos + 4].try_into().unwrap()) as usize;
        if storage_size == 0 {
            break;
        }
        let Some(storage) = body.get(pos..pos + storage_size) else {
            issues.note("property storage overruns its block");
            break;
        };
        if storage.len() < 24 {
            break;
        }
        let version = &storage[4..8];
        if version != b"1SPS" && version != b"2SPS" {
            issues.note(format!(
                "unknown property storage version {:02x?}",
                version
            ));
            pos += storage_size;
            continue;
        }
        let format_id = guid_string(&storage[8..24]);
        let mut properties = Vec::new();
        let mut prop_pos = 24;
        while prop_pos + 4 <= storage.len() {
            let value_size =
                u32::from_le_bytes(storage[prop_pos..prop_pos + 4].try_into().unwrap()) as usize;
            if value_size == 0 {
                break;
            }
            let Some(entry) = storage.get(prop_pos..prop_pos + value_size) else { break };
            if entry.len() >= 13 {
                let pid = u32::from_le_bytes(entry[4..8].try_into().unwrap());
                let value = decode_typed_value(&entry[9..], issues);
                properties.push(StoreProperty { pid, value });
            }
            prop_pos += value_size;
        }
        storages.push(PropertyStorage { format_id, properties });
        pos += storage_size;
    }
    storages
}

fn decode_typed_value(raw: &[u8], issues: &mut IssueLog) -> PropertyValue {
    if raw.len() < 4 {
        return PropertyValue::Other { vt: 0, length: raw.len() };
    }
    let vt = u16::from_le_bytes(raw[..2].try_into().unwrap());
    let value = &raw[4..];
    match vt {
        // VT_I4
        0x0003 if value.len() >= 4 => {
            PropertyValue::I4(i32::from_le_bytes(value[..4].try_into().unwrap()))
        }
        // VT_BOOL
        0x000B if value.len() >= 2 => {
            PropertyValue::Bool(u16::from_le_bytes(value[..2].try_into().unwrap()) != 0)
        }
        // VT_UI4
        0x0013 if value.len() >= 4 => {
            PropertyValue::U4(u32::from_le_bytes(value[..4].try_into().unwrap()))
        }
        // VT_LPWSTR: u32 character count, then UTF-16LE.
        0x001F if value.len() >= 4 => {
            let count = u32::from_le_bytes(value[..4].try_into().unwrap()) as usize;
            PropertyValue::Str(utf16le_string(&value[4..], count))
        }
        // VT_FILETIME
        0x0040 if value.len() >= 8 => PropertyValue::FileTime(filetime_to_iso8601(
            u64::from_le_bytes(value[..8].try_into().unwrap()),
        )),
        // VT_CLSID
        0x0048 if value.len() >= 16 => PropertyValue::Clsid(guid_string(&value[..16])),
        _ => {
            issues.note(format!("property value type 0x{:04x} not decoded", vt));
            PropertyValue::Other { vt, length: value.len() }
        }
    }
}

/// Standard GUID text form from its packed little-endian layout.
pub fn guid_string(raw: &[u8]) -> String {
    if raw.len() < 16 {
        return String::new();
    }
    format!(
        "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
        u32::from_le_bytes(raw[0..4].try_into().unwrap()),
        u16::from_le_bytes(raw[4..6].try_into().unwrap()),
        u16::from_le_bytes(raw[6..8].try_into().unwrap()),
        raw[8], raw[9], raw[10], raw[11], raw[12], raw[13], raw[14], raw[15]
    )
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::probe::MemorySource;

    fn counted(text: &str) -> Vec<u8> {
        let mut out = (text.len() as u16).to_le_bytes().to_vec();
        out.extend_from_slice(text.as_bytes());
        out
    }

    pub(crate) fn minimal_lnk(flags: u32) -> Vec<u8> {
        let mut data = vec![0u8; 76];
        data[0..4].copy_from_slice(&HEADER_SIZE.to_le_bytes());
        data[4..20].copy_from_slice(&LINK_CLSID);
        data[20..24].copy_from_slice(&flags.to_le_bytes());
        data[60..64].copy_from_slice(&1u32.to_le_bytes());
        data
    }

    #[test]
    fn header_only_link() {
        let data = minimal_lnk(0);
        let link = analyze(&MemorySource::new(data), &ProbeOptions::default()).unwrap();
        assert_eq!(link.header.show_command_label, "SW_SHOWNORMAL");
        assert!(link.id_list.is_empty());
        assert!(link.link_info.is_none());
        assert!(link.issues.is_empty());
    }

    #[test]
    fn wrong_clsid_is_rejected() {
        let mut data = minimal_lnk(0);
        data[4] = 0xff;
        assert!(analyze(&MemorySource::new(data), &ProbeOptions::default()).is_none());
    }

    #[test]
    fn string_data_ansi() {
        let mut data = minimal_lnk(LinkFlags::HAS_NAME | LinkFlags::HAS_ARGUMENTS);
        data.extend_from_slice(&counted("a description"));
        data.extend_from_slice(&counted("--verbose"));
        let link = analyze(&MemorySource::new(data), &ProbeOptions::default()).unwrap();
        assert_eq!(link.name.as_deref(), Some("a description"));
        assert_eq!(link.arguments.as_deref(), Some("--verbose"));
        assert!(link.relative_path.is_none());
    }

    #[test]
    fn id_list_with_drive_item() {
        let mut data = minimal_lnk(LinkFlags::HAS_LINK_TARGET_ID_LIST);
        let item_body = b"\x2fC:\\\0";
        let item_size = (item_body.len() + 2) as u16;
        let list_size = item_size + 2;
        data.extend_from_slice(&list_size.to_le_bytes());
        data.extend_from_slice(&item_size.to_le_bytes());
        data.extend_from_slice(item_body);
        data.extend_from_slice(&0u16.to_le_bytes());
        let link = analyze(&MemorySource::new(data), &ProbeOptions::default()).unwrap();
        assert_eq!(link.id_list.len(), 1);
        match &link.id_list[0] {
            PidlItem::Drive { path } => assert_eq!(path, "C:\\"),
            other => panic!("expected drive item, got {:?}", other),
        }
    }

    #[test]
    fn known_folder_block_is_opaque() {
        let mut data = minimal_lnk(0);
        let mut body = vec![0u8; 20];
        body[..16].copy_from_slice(&LINK_CLSID);
        body[16..20].copy_from_slice(&7u32.to_le_bytes());
        data.extend_from_slice(&((body.len() + 8) as u32).to_le_bytes());
        data.extend_from_slice(&0xA000_000Bu32.to_le_bytes());
        data.extend_from_slice(&body);
        data.extend_from_slice(&0u32.to_le_bytes());

        let link = analyze(&MemorySource::new(data), &ProbeOptions::default()).unwrap();
        assert_eq!(link.extra_blocks.len(), 1);
        match &link.extra_blocks[0] {
            ExtraBlock::KnownFolder { known_folder_id, offset } => {
                assert_eq!(known_folder_id, "00021401-0000-0000-c000-000000000046");
                assert_eq!(*offset, 7);
            }
            other => panic!("expected known folder block, got {:?}", other),
        }
    }

    #[test]
    fn property_store_lpwstr() {
        // One storage with a single VT_LPWSTR property (pid 2).
        let mut value = Vec::new();
        value.extend_from_slice(&0x001Fu16.to_le_bytes());
        value.extend_from_slice(&0u16.to_le_bytes());
        value.extend_from_slice(&3u32.to_le_bytes());
        for unit in "abc".encode_utf16() {
            value.extend_from_slice(&unit.to_le_bytes());
        }

        let mut prop = Vec::new();
        let prop_size = 4 + 4 + 1 + value.len();
        prop.extend_from_slice(&(prop_size as u32).to_le_bytes());
        prop.extend_from_slice(&2u32.to_le_bytes());
        prop.push(0);
        prop.extend_from_slice(&value);

        let mut storage = Vec::new();
        let storage_size = 4 + 4 + 16 + prop.len() + 4;
        storage.extend_from_slice(&(storage_size as u32).to_le_bytes());
        storage.extend_from_slice(b"1SPS");
        storage.extend_from_slice(&LINK_CLSID);
        storage.extend_from_slice(&prop);
        storage.extend_from_slice(&0u32.to_le_bytes());

        let mut issues = IssueLog::new();
        let storages = read_property_store(&storage, &mut issues);
        assert_eq!(storages.len(), 1);
        assert_eq!(storages[0].properties.len(), 1);
        assert_eq!(storages[0].properties[0].pid, 2);
        match &storages[0].properties[0].value {
            PropertyValue::Str(text) => assert_eq!(text, "abc"),
            other => panic!("expected string property, got {:?}", other),
        }
    }
}
