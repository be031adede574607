//! Placeholder files: the reparse payload format and the lifecycle.
//!
//! A placeholder is a sparse, reparse-tagged file whose payload records
//! where its bytes live in the depot. Two payload layouts exist on disk:
//! v1 with fixed-width UTF-16LE string fields and a 16-bit revision, and
//! v2 with `{sizeBytes, offsetBytes}` string descriptors and a 32-bit
//! revision. Readers accept both (v1 upgrades to the v2 in-memory form);
//! writers emit v2. All integers are little-endian.

use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_traits::FromPrimitive;

use crate::fs::{FileAttrs, FileStore};
use crate::settings::{keys, Settings};
use crate::walker::{self, WalkFlags, WalkItem};

/// The reparse tag owned by this system.
pub const REPARSE_TAG: u32 = 0xBAC;

/// The reparse GUID `{3CA7BDAC-A3DC-4AB8-93CA-2C815E5EC15A}` in its
/// on-disk (little-endian struct) byte order.
pub const REPARSE_GUID_BYTES: [u8; 16] = [
    0xAC, 0xBD, 0xA7, 0x3C, 0xDC, 0xA3, 0xB8, 0x4A, 0x93, 0xCA, 0x2C, 0x81, 0x5E, 0x5E, 0xC1,
    0x5A,
];

pub const REPARSE_DATA_VERSION_1: u32 = 1;
pub const REPARSE_DATA_VERSION_2: u32 = 2;

/// Fixed-width string field lengths of the v1 layout, in UTF-16 units.
const V1_PATH_LEN: usize = 320;
const V1_NAME_LEN: usize = 128;
/// Byte size of the v2 fixed part, descriptors included.
const V2_FIXED_SIZE: u32 = 52;

/// What should happen when a placeholder is first accessed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, num_derive::FromPrimitive)]
#[repr(u8)]
pub enum ResidencyPolicy {
    Undefined = 0,
    Resident = 1,
    Symlink = 2,
    RemoveFile = 3,
}

/// Where the placeholder's bytes come from.
#[derive(Debug, Copy, Clone, PartialEq, Eq, num_derive::FromPrimitive)]
#[repr(u8)]
pub enum PopulatePolicy {
    Undefined = 0,
    Depot = 1,
    Share = 2,
}

/// Payload parse failures. Unknown or truncated payloads are integrity
/// errors; the caller treats the file as not ours.
#[derive(Debug)]
pub enum PayloadError {
    Io(std::io::Error),
    UnknownVersion(u32),
    Truncated,
}

impl std::fmt::Display for PayloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PayloadError::Io(e) => write!(f, "payload io: {e}"),
            PayloadError::UnknownVersion(v) => write!(f, "unknown payload version {v}"),
            PayloadError::Truncated => write!(f, "truncated payload"),
        }
    }
}

impl std::error::Error for PayloadError {}

impl From<std::io::Error> for PayloadError {
    fn from(e: std::io::Error) -> Self {
        PayloadError::Io(e)
    }
}

/// The in-memory (v2) form of a placeholder's reparse payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlaceholderInfo {
    pub major_version: u16,
    pub minor_version: u16,
    pub build_version: u16,
    pub residency_policy: u8,
    pub populate_policy: u8,
    pub file_revision: u32,
    pub depot_path: String,
    pub depot_server: String,
    pub depot_client: String,
    pub depot_user: String,
}

impl PlaceholderInfo {
    pub fn residency(&self) -> ResidencyPolicy {
        ResidencyPolicy::from_u8(self.residency_policy).unwrap_or(ResidencyPolicy::Undefined)
    }

    pub fn populate(&self) -> PopulatePolicy {
        PopulatePolicy::from_u8(self.populate_policy).unwrap_or(PopulatePolicy::Undefined)
    }

    /// Parses either payload layout into the v2 in-memory form.
    pub fn parse(payload: &[u8]) -> Result<PlaceholderInfo, PayloadError> {
        let mut src = Cursor::new(payload);
        let version = src.read_u32::<LittleEndian>().map_err(|_| PayloadError::Truncated)?;
        match version {
            REPARSE_DATA_VERSION_1 => parse_v1(&mut src),
            REPARSE_DATA_VERSION_2 => parse_v2(payload, &mut src),
            other => Err(PayloadError::UnknownVersion(other)),
        }
    }

    /// Serializes the v2 layout.
    pub fn encode_v2(&self) -> Vec<u8> {
        let strings =
            [&self.depot_path, &self.depot_server, &self.depot_client, &self.depot_user];

        let mut fixed = Vec::with_capacity(V2_FIXED_SIZE as usize);
        fixed.write_u32::<LittleEndian>(REPARSE_DATA_VERSION_2).unwrap();
        fixed.write_u32::<LittleEndian>(0).unwrap(); // dataSize, patched below
        fixed.write_u16::<LittleEndian>(self.major_version).unwrap();
        fixed.write_u16::<LittleEndian>(self.minor_version).unwrap();
        fixed.write_u16::<LittleEndian>(self.build_version).unwrap();
        fixed.write_u8(self.residency_policy).unwrap();
        fixed.write_u8(self.populate_policy).unwrap();
        fixed.write_u32::<LittleEndian>(self.file_revision).unwrap();

        let mut tail: Vec<u8> = Vec::new();
        let mut descriptors: Vec<(u32, i32)> = Vec::new();
        for (index, value) in strings.iter().enumerate() {
            let descriptor_offset = 20 + index as i32 * 8;
            if value.is_empty() {
                descriptors.push((0, 0));
            } else {
                let mut bytes: Vec<u8> = Vec::with_capacity((value.len() + 1) * 2);
                for unit in value.encode_utf16().chain(std::iter::once(0)) {
                    bytes.extend_from_slice(&unit.to_le_bytes());
                }
                let absolute = V2_FIXED_SIZE as i32 + tail.len() as i32;
                descriptors.push((bytes.len() as u32, absolute - descriptor_offset));
                tail.extend_from_slice(&bytes);
            }
        }
        for (size, offset) in descriptors {
            fixed.write_u32::<LittleEndian>(size).unwrap();
            fixed.write_i32::<LittleEndian>(offset).unwrap();
        }

        let total = (fixed.len() + tail.len()) as u32;
        fixed[4..8].copy_from_slice(&total.to_le_bytes());
        fixed.extend_from_slice(&tail);
        fixed
    }

    /// Serializes the legacy v1 layout. Kept for cross-version
    /// compatibility coverage; new placeholders always carry v2.
    pub fn encode_v1(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(14 + (V1_PATH_LEN + 3 * V1_NAME_LEN) * 2);
        out.write_u32::<LittleEndian>(REPARSE_DATA_VERSION_1).unwrap();
        out.write_u16::<LittleEndian>(self.major_version).unwrap();
        out.write_u16::<LittleEndian>(self.minor_version).unwrap();
        out.write_u16::<LittleEndian>(self.build_version).unwrap();
        out.write_u8(self.residency_policy).unwrap();
        out.write_u8(self.populate_policy).unwrap();
        out.write_u16::<LittleEndian>(self.file_revision as u16).unwrap();
        for (value, width) in [
            (&self.depot_path, V1_PATH_LEN),
            (&self.depot_server, V1_NAME_LEN),
            (&self.depot_client, V1_NAME_LEN),
            (&self.depot_user, V1_NAME_LEN),
        ] {
            let mut units: Vec<u16> = value.encode_utf16().take(width - 1).collect();
            units.resize(width, 0);
            for unit in units {
                out.extend_from_slice(&unit.to_le_bytes());
            }
        }
        out
    }
}

fn read_utf16_string(src: &mut impl Read, units: usize) -> Result<String, PayloadError> {
    let mut buffer = vec![0u16; units];
    for unit in buffer.iter_mut() {
        *unit = src.read_u16::<LittleEndian>().map_err(|_| PayloadError::Truncated)?;
    }
    let end = buffer.iter().position(|&u| u == 0).unwrap_or(buffer.len());
    Ok(String::from_utf16_lossy(&buffer[..end]))
}

fn parse_v1(src: &mut Cursor<&[u8]>) -> Result<PlaceholderInfo, PayloadError> {
    let mut info = PlaceholderInfo {
        major_version: src.read_u16::<LittleEndian>().map_err(|_| PayloadError::Truncated)?,
        minor_version: src.read_u16::<LittleEndian>().map_err(|_| PayloadError::Truncated)?,
        build_version: src.read_u16::<LittleEndian>().map_err(|_| PayloadError::Truncated)?,
        residency_policy: src.read_u8().map_err(|_| PayloadError::Truncated)?,
        populate_policy: src.read_u8().map_err(|_| PayloadError::Truncated)?,
        file_revision: src.read_u16::<LittleEndian>().map_err(|_| PayloadError::Truncated)? as u32,
        ..Default::default()
    };
    info.depot_path = read_utf16_string(src, V1_PATH_LEN)?;
    info.depot_server = read_utf16_string(src, V1_NAME_LEN)?;
    info.depot_client = read_utf16_string(src, V1_NAME_LEN)?;
    info.depot_user = read_utf16_string(src, V1_NAME_LEN)?;
    Ok(info)
}

fn parse_v2(payload: &[u8], src: &mut Cursor<&[u8]>) -> Result<PlaceholderInfo, PayloadError> {
    let data_size = src.read_u32::<LittleEndian>().map_err(|_| PayloadError::Truncated)?;
    if data_size < V2_FIXED_SIZE || payload.len() < data_size as usize {
        return Err(PayloadError::Truncated);
    }
    let mut info = PlaceholderInfo {
        major_version: src.read_u16::<LittleEndian>().map_err(|_| PayloadError::Truncated)?,
        minor_version: src.read_u16::<LittleEndian>().map_err(|_| PayloadError::Truncated)?,
        build_version: src.read_u16::<LittleEndian>().map_err(|_| PayloadError::Truncated)?,
        residency_policy: src.read_u8().map_err(|_| PayloadError::Truncated)?,
        populate_policy: src.read_u8().map_err(|_| PayloadError::Truncated)?,
        file_revision: src.read_u32::<LittleEndian>().map_err(|_| PayloadError::Truncated)?,
        ..Default::default()
    };

    let mut strings: [String; 4] = Default::default();
    for (index, slot) in strings.iter_mut().enumerate() {
        let descriptor_offset = 20 + index * 8;
        let size = src.read_u32::<LittleEndian>().map_err(|_| PayloadError::Truncated)? as usize;
        let offset = src.read_i32::<LittleEndian>().map_err(|_| PayloadError::Truncated)?;
        if size == 0 {
            continue;
        }
        let start = descriptor_offset as i64 + offset as i64;
        let end = start + size as i64;
        if start < 0 || end as usize > payload.len() || size % 2 != 0 {
            return Err(PayloadError::Truncated);
        }
        let mut cursor = Cursor::new(&payload[start as usize..end as usize]);
        *slot = read_utf16_string(&mut cursor, size / 2)?;
    }
    [info.depot_path, info.depot_server, info.depot_client, info.depot_user] = strings;
    Ok(info)
}

/// The crate's producer version triple, recorded in new payloads.
pub fn producer_version() -> (u16, u16, u16) {
    let mut parts = env!("CARGO_PKG_VERSION").split('.').map(|p| p.parse().unwrap_or(0));
    (
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
    )
}

/// Everything needed to install one placeholder.
#[derive(Debug, Clone, Default)]
pub struct InstallRequest {
    pub residency_policy: u8,
    pub file_revision: u32,
    pub file_size: i64,
    /// Final attributes; the offline bit is always added on top.
    pub attrs: FileAttrs,
    pub depot_path: String,
    pub depot_server: String,
    pub depot_client: String,
    pub depot_user: String,
}

/// Installs a reparse-point placeholder at `path`.
///
/// The file is never visible without its reparse point: the point is
/// attached and the sparse length set on the creating handle, the handle
/// closes, and only then do the final attributes (with the offline bit)
/// land. Any failure after the open deletes the partial file.
pub async fn install(
    store: &dyn FileStore,
    settings: &Settings,
    path: &Path,
    request: &InstallRequest,
) -> std::io::Result<()> {
    if ResidencyPolicy::from_u8(request.residency_policy).is_none() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("invalid residency policy {}", request.residency_policy),
        ));
    }

    if let Some(parent) = path.parent() {
        store.create_dir_all(parent).await?;
    }

    let existing = store.metadata(path).await?;
    let truncate = existing.is_some();
    if let Some(meta) = &existing {
        if meta.attrs.readonly {
            store.set_file_attrs(path, FileAttrs::NORMAL).await?;
        }
    }

    let retry_count = settings.get_i32(keys::CREATE_FILE_RETRY_COUNT).clamp(1, 20);
    let retry_wait = settings.get_i32(keys::CREATE_FILE_RETRY_WAIT_MS).clamp(0, 5000) as u64;

    let mut handle = None;
    for attempt in 0..retry_count {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_millis(retry_wait)).await;
        }
        match store.create_placeholder_file(path, truncate).await {
            Ok(h) => {
                handle = Some(h);
                break;
            }
            Err(e) if attempt + 1 == retry_count => {
                if let Some(meta) = &existing {
                    let _ = store.set_file_attrs(path, meta.attrs).await;
                }
                return Err(e);
            }
            Err(_) => {}
        }
    }
    let mut handle = handle.expect("retry loop yields a handle or returns");

    let outcome = async {
        handle.freeze_times().await?;

        let (major, minor, build) = producer_version();
        let info = PlaceholderInfo {
            major_version: major,
            minor_version: minor,
            build_version: build,
            residency_policy: request.residency_policy,
            populate_policy: PopulatePolicy::Depot as u8,
            file_revision: request.file_revision,
            depot_path: request.depot_path.clone(),
            depot_server: request.depot_server.clone(),
            depot_client: request.depot_client.clone(),
            depot_user: request.depot_user.clone(),
        };
        handle.set_reparse(&info.encode_v2()).await?;
        handle.set_sparse_len(request.file_size.max(0) as u64).await?;
        Ok::<(), std::io::Error>(())
    }
    .await;

    if let Err(e) = outcome {
        let _ = handle.close().await;
        let _ = store.remove_file(path).await;
        return Err(e);
    }
    if let Err(e) = handle.close().await {
        let _ = store.remove_file(path).await;
        return Err(e);
    }

    if let Err(e) = store.set_file_attrs(path, request.attrs.offline(true)).await {
        let _ = store.remove_file(path).await;
        return Err(e);
    }
    Ok(())
}

/// Deletes a placeholder and best-effort prunes now-empty parent
/// directories up to, but never including, `client_root`.
pub async fn uninstall(
    store: &dyn FileStore,
    path: &Path,
    client_root: &Path,
) -> std::io::Result<()> {
    match store.metadata(path).await? {
        // Already gone is success.
        None => return Ok(()),
        Some(meta) if meta.attrs.readonly => {
            store.set_file_attrs(path, FileAttrs::NORMAL).await?;
        }
        Some(_) => {}
    }
    store.remove_file(path).await?;
    if let Some(parent) = path.parent() {
        store.prune_empty_dirs(parent, client_root).await?;
    }
    Ok(())
}

/// Reads and parses the placeholder payload of `path`, `None` when the
/// file carries no payload of ours.
pub async fn read_info(
    store: &dyn FileStore,
    path: &Path,
) -> Result<Option<PlaceholderInfo>, PayloadError> {
    match store.read_reparse(path).await? {
        Some(payload) => PlaceholderInfo::parse(&payload).map(Some),
        None => Ok(None),
    }
}

/// True when `path` carries our reparse tag with a parseable payload.
pub async fn detect(store: &dyn FileStore, path: &Path) -> bool {
    matches!(read_info(store, path).await, Ok(Some(_)))
}

/// Scans a tree in parallel for placeholder files (offline bit set and a
/// parseable payload). Uses the parallel directory iterator for the walk.
pub async fn find_placeholders(
    store: Arc<dyn FileStore>,
    root: &Path,
    threads: usize,
) -> std::io::Result<Vec<PathBuf>> {
    let files = Arc::new(std::sync::Mutex::new(Vec::<PathBuf>::new()));
    let sink = files.clone();
    walker::iterate_parallel(
        root,
        threads,
        WalkFlags::default(),
        Arc::new(move |item: &WalkItem| {
            if !item.is_directory {
                sink.lock().unwrap().push(item.path.clone());
            }
            true
        }),
    )
    .await?;

    let candidates = std::mem::take(&mut *files.lock().unwrap());
    let mut placeholders = Vec::new();
    for path in candidates {
        if detect(store.as_ref(), &path).await {
            placeholders.push(path);
        }
    }
    Ok(placeholders)
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample_info() -> PlaceholderInfo {
        PlaceholderInfo {
            major_version: 1,
            minor_version: 27,
            build_version: 4,
            residency_policy: ResidencyPolicy::Resident as u8,
            populate_policy: PopulatePolicy::Depot as u8,
            file_revision: 3,
            depot_path: "//depot/src/a.cpp".to_string(),
            depot_server: "perforce:1666".to_string(),
            depot_client: "dev-ws".to_string(),
            depot_user: "alice".to_string(),
        }
    }

    #[test]
    fn test_v2_round_trip() {
        let info = sample_info();
        let payload = info.encode_v2();
        let parsed = PlaceholderInfo::parse(&payload).unwrap();
        assert_eq!(parsed, info);
    }

    #[test]
    fn test_v2_empty_strings() {
        let info = PlaceholderInfo {
            file_revision: 9,
            residency_policy: ResidencyPolicy::RemoveFile as u8,
            ..Default::default()
        };
        let payload = info.encode_v2();
        let parsed = PlaceholderInfo::parse(&payload).unwrap();
        assert_eq!(parsed.depot_path, "");
        assert_eq!(parsed.file_revision, 9);
        assert_eq!(parsed.residency(), ResidencyPolicy::RemoveFile);
    }

    #[test]
    fn test_v1_upgrades_to_v2_form() {
        let mut info = sample_info();
        let payload = info.encode_v1();
        let parsed = PlaceholderInfo::parse(&payload).unwrap();
        // v1 carries a 16-bit revision; everything else is preserved.
        info.file_revision &= 0xFFFF;
        assert_eq!(parsed, info);

        // Re-serializing the upgraded form keeps the fields identical.
        let again = PlaceholderInfo::parse(&parsed.encode_v2()).unwrap();
        assert_eq!(again, parsed);
    }

    #[test]
    fn test_unknown_version_is_integrity_error() {
        let mut payload = sample_info().encode_v2();
        payload[0] = 7;
        assert!(matches!(
            PlaceholderInfo::parse(&payload),
            Err(PayloadError::UnknownVersion(7))
        ));
    }

    #[test]
    fn test_truncated_payload() {
        let payload = sample_info().encode_v2();
        assert!(matches!(
            PlaceholderInfo::parse(&payload[..30]),
            Err(PayloadError::Truncated)
        ));
        assert!(matches!(PlaceholderInfo::parse(&[2, 0]), Err(PayloadError::Truncated)));
    }

    #[test]
    fn test_descriptor_offsets_are_self_relative() {
        let info = sample_info();
        let payload = info.encode_v2();
        // First descriptor sits at byte 20; its offset must land inside
        // the payload past the fixed part.
        let size = u32::from_le_bytes(payload[20..24].try_into().unwrap());
        let offset = i32::from_le_bytes(payload[24..28].try_into().unwrap());
        assert_eq!(size as usize, (info.depot_path.len() + 1) * 2);
        assert_eq!(20 + offset, V2_FIXED_SIZE as i32);
    }
}
