//! Native [`FileStore`] for Windows: real reparse points and sparse files.
//!
//! Issues `FSCTL_SET/GET/DELETE_REPARSE_POINT`, `FSCTL_SET_SPARSE` and
//! `FSCTL_SET_ZERO_DATA` against handles opened with
//! `FILE_FLAG_OPEN_REPARSE_POINT`, and freezes file times with the
//! restricted `SetFileTime` form. Blocking Win32 calls run on the blocking
//! pool.

use std::io::{self, SeekFrom};
use std::os::windows::ffi::OsStrExt;
use std::os::windows::fs::OpenOptionsExt;
use std::os::windows::io::AsRawHandle;
use std::path::Path;

use async_trait::async_trait;
use byteorder::{ByteOrder, LittleEndian};
use filetime::FileTime;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use windows_sys::Win32::Foundation::{GetLastError, ERROR_MORE_DATA, ERROR_NOT_A_REPARSE_POINT, HANDLE};
use windows_sys::Win32::Storage::FileSystem::{
    GetFileAttributesW, SetFileAttributesW, SetFileTime, FILE_ATTRIBUTE_NORMAL,
    FILE_ATTRIBUTE_OFFLINE, FILE_ATTRIBUTE_READONLY, FILE_ATTRIBUTE_SPARSE_FILE,
    FILE_FLAG_OPEN_REPARSE_POINT, INVALID_FILE_ATTRIBUTES,
};
use windows_sys::Win32::System::Ioctl::{
    FSCTL_DELETE_REPARSE_POINT, FSCTL_GET_REPARSE_POINT, FSCTL_SET_REPARSE_POINT,
    FSCTL_SET_SPARSE, FSCTL_SET_ZERO_DATA,
};
use windows_sys::Win32::System::IO::DeviceIoControl;

use super::{AccessMode, FileAttrs, FileStore, ShareMode, StoreHandle, StoreMetadata};
use crate::placeholder::{REPARSE_GUID_BYTES, REPARSE_TAG};
use crate::text;

const REPARSE_HEADER_SIZE: usize = 24;
const MAX_REPARSE_BUFFER: usize = 16 * 1024;

fn wide(path: &Path) -> Vec<u16> {
    let extended = text::extended_path(&path.to_string_lossy());
    std::ffi::OsStr::new(&extended).encode_wide().chain(std::iter::once(0)).collect()
}

fn last_error() -> io::Error {
    io::Error::from_raw_os_error(unsafe { GetLastError() } as i32)
}

fn ioctl(
    handle: HANDLE,
    code: u32,
    input: Option<&[u8]>,
    output: Option<&mut [u8]>,
) -> Result<u32, io::Error> {
    let mut returned = 0u32;
    let ok = unsafe {
        DeviceIoControl(
            handle,
            code,
            input.map_or(std::ptr::null(), |b| b.as_ptr().cast()),
            input.map_or(0, |b| b.len() as u32),
            output.as_ref().map_or(std::ptr::null_mut(), |b| b.as_ptr() as *mut _),
            output.map_or(0, |b| b.len() as u32),
            &mut returned,
            std::ptr::null_mut(),
        )
    };
    if ok == 0 {
        Err(last_error())
    } else {
        Ok(returned)
    }
}

/// Builds the `REPARSE_GUID_DATA_BUFFER` framing around a payload.
fn frame_reparse_buffer(payload: &[u8]) -> Vec<u8> {
    let mut buffer = vec![0u8; REPARSE_HEADER_SIZE + payload.len()];
    LittleEndian::write_u32(&mut buffer[0..4], REPARSE_TAG);
    LittleEndian::write_u16(&mut buffer[4..6], payload.len() as u16);
    buffer[8..24].copy_from_slice(&REPARSE_GUID_BYTES);
    buffer[REPARSE_HEADER_SIZE..].copy_from_slice(payload);
    buffer
}

/// Extracts the payload of our reparse buffer; `None` on a foreign tag/GUID.
fn unframe_reparse_buffer(buffer: &[u8]) -> Option<Vec<u8>> {
    if buffer.len() < REPARSE_HEADER_SIZE {
        return None;
    }
    let tag = LittleEndian::read_u32(&buffer[0..4]);
    let len = LittleEndian::read_u16(&buffer[4..6]) as usize;
    if tag != REPARSE_TAG || buffer[8..24] != REPARSE_GUID_BYTES {
        return None;
    }
    buffer.get(REPARSE_HEADER_SIZE..REPARSE_HEADER_SIZE + len).map(<[u8]>::to_vec)
}

/// Native Windows file store.
#[derive(Debug, Clone, Default)]
pub struct NativeStore;

impl NativeStore {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FileStore for NativeStore {
    async fn metadata(&self, path: &Path) -> io::Result<Option<StoreMetadata>> {
        let meta = match tokio::fs::symlink_metadata(path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let wide_path = wide(path);
        let attributes =
            tokio::task::spawn_blocking(move || unsafe { GetFileAttributesW(wide_path.as_ptr()) })
                .await
                .map_err(io::Error::other)?;
        if attributes == INVALID_FILE_ATTRIBUTES {
            return Ok(None);
        }
        let reparse = self.read_reparse(path).await.unwrap_or(None);
        Ok(Some(StoreMetadata {
            is_directory: meta.is_dir(),
            len: meta.len(),
            attrs: FileAttrs {
                readonly: attributes & FILE_ATTRIBUTE_READONLY != 0,
                offline: attributes & FILE_ATTRIBUTE_OFFLINE != 0,
            },
            is_reparse: reparse.is_some(),
            is_sparse: attributes & FILE_ATTRIBUTE_SPARSE_FILE != 0,
        }))
    }

    async fn set_file_attrs(&self, path: &Path, attrs: FileAttrs) -> io::Result<()> {
        let wide_path = wide(path);
        tokio::task::spawn_blocking(move || {
            let mut attributes = 0u32;
            if attrs.readonly {
                attributes |= FILE_ATTRIBUTE_READONLY;
            }
            if attrs.offline {
                attributes |= FILE_ATTRIBUTE_OFFLINE;
            }
            if attributes == 0 {
                attributes = FILE_ATTRIBUTE_NORMAL;
            }
            if unsafe { SetFileAttributesW(wide_path.as_ptr(), attributes) } == 0 {
                Err(last_error())
            } else {
                Ok(())
            }
        })
        .await
        .map_err(io::Error::other)?
    }

    async fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        tokio::fs::create_dir_all(path).await
    }

    async fn remove_file(&self, path: &Path) -> io::Result<()> {
        tokio::fs::remove_file(path).await
    }

    async fn prune_empty_dirs(&self, from: &Path, stop: &Path) -> io::Result<()> {
        let stop_key = text::fold(&stop.to_string_lossy());
        let mut current = Some(from.to_path_buf());
        while let Some(dir) = current {
            if text::fold(&dir.to_string_lossy()) == stop_key {
                break;
            }
            match tokio::fs::remove_dir(&dir).await {
                Ok(()) => current = dir.parent().map(Path::to_path_buf),
                Err(_) => break,
            }
        }
        Ok(())
    }

    async fn create_placeholder_file(
        &self,
        path: &Path,
        truncate: bool,
    ) -> io::Result<Box<dyn StoreHandle>> {
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(truncate)
            .share_mode(0)
            .custom_flags(FILE_FLAG_OPEN_REPARSE_POINT)
            .open(path)
            .await?;
        Ok(Box::new(NativeHandle { file: Some(file) }))
    }

    async fn open_by_file_id(
        &self,
        path: &Path,
        access: AccessMode,
        share: ShareMode,
    ) -> io::Result<Box<dyn StoreHandle>> {
        // Opening by path with the reparse flag and full sharing is the
        // user-mode fallback; the driver control channel performs the true
        // by-file-id open when a filter is attached.
        let mut share_mode = 0u32;
        if share.read {
            share_mode |= 0x1;
        }
        if share.write {
            share_mode |= 0x2;
        }
        if share.delete {
            share_mode |= 0x4;
        }
        let file = tokio::fs::OpenOptions::new()
            .read(access.read || !access.write)
            .write(access.write)
            .share_mode(share_mode)
            .custom_flags(FILE_FLAG_OPEN_REPARSE_POINT)
            .open(path)
            .await?;
        Ok(Box::new(NativeHandle { file: Some(file) }))
    }

    async fn read_reparse(&self, path: &Path) -> io::Result<Option<Vec<u8>>> {
        let mut handle = self.open_by_file_id(path, AccessMode::READ, ShareMode::ALL).await?;
        let payload = handle.get_reparse().await;
        handle.close().await?;
        payload
    }

    async fn file_times(&self, path: &Path) -> io::Result<(FileTime, FileTime)> {
        let meta = tokio::fs::symlink_metadata(path).await?;
        Ok((FileTime::from_last_access_time(&meta), FileTime::from_last_modification_time(&meta)))
    }

    async fn set_file_times(
        &self,
        path: &Path,
        accessed: FileTime,
        modified: FileTime,
    ) -> io::Result<()> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || filetime::set_file_times(&path, accessed, modified))
            .await
            .map_err(io::Error::other)?
    }

    async fn rename_replace(&self, src: &Path, dst: &Path) -> io::Result<()> {
        tokio::fs::rename(src, dst).await
    }

    async fn create_symlink(&self, path: &Path, target: &Path) -> io::Result<()> {
        if tokio::fs::symlink_metadata(path).await.is_ok() {
            tokio::fs::remove_file(path).await?;
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::symlink_file(target, path).await
    }
}

struct NativeHandle {
    file: Option<tokio::fs::File>,
}

impl NativeHandle {
    fn raw(&self) -> io::Result<HANDLE> {
        self.file
            .as_ref()
            .map(|f| f.as_raw_handle() as HANDLE)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "handle closed"))
    }

    fn file(&mut self) -> io::Result<&mut tokio::fs::File> {
        self.file.as_mut().ok_or_else(|| io::Error::new(io::ErrorKind::Other, "handle closed"))
    }

    async fn run_ioctl(
        &self,
        code: u32,
        input: Option<Vec<u8>>,
        output_len: usize,
    ) -> io::Result<Vec<u8>> {
        let handle = self.raw()?;
        tokio::task::spawn_blocking(move || {
            let mut output = vec![0u8; output_len];
            let returned = ioctl(
                handle,
                code,
                input.as_deref(),
                (output_len > 0).then_some(output.as_mut_slice()),
            )?;
            output.truncate(returned as usize);
            Ok(output)
        })
        .await
        .map_err(io::Error::other)?
    }
}

#[async_trait]
impl StoreHandle for NativeHandle {
    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.file()?.write_all(data).await
    }

    async fn truncate_at_position(&mut self) -> io::Result<()> {
        let file = self.file()?;
        let position = file.seek(SeekFrom::Current(0)).await?;
        file.set_len(position).await
    }

    async fn freeze_times(&mut self) -> io::Result<()> {
        let handle = self.raw()?;
        tokio::task::spawn_blocking(move || {
            // dwLowDateTime/dwHighDateTime both 0xFFFFFFFF: keep times
            // unchanged for the lifetime of this handle.
            let frozen = [0xFFFF_FFFFu32, 0xFFFF_FFFF];
            let ok = unsafe {
                SetFileTime(handle, std::ptr::null(), frozen.as_ptr().cast(), frozen.as_ptr().cast())
            };
            if ok == 0 {
                Err(last_error())
            } else {
                Ok(())
            }
        })
        .await
        .map_err(io::Error::other)?
    }

    async fn set_reparse(&mut self, payload: &[u8]) -> io::Result<()> {
        let buffer = frame_reparse_buffer(payload);
        self.run_ioctl(FSCTL_SET_REPARSE_POINT, Some(buffer), 0).await.map(|_| ())
    }

    async fn get_reparse(&mut self) -> io::Result<Option<Vec<u8>>> {
        match self.run_ioctl(FSCTL_GET_REPARSE_POINT, None, MAX_REPARSE_BUFFER).await {
            Ok(buffer) => Ok(unframe_reparse_buffer(&buffer)),
            Err(e)
                if e.raw_os_error() == Some(ERROR_NOT_A_REPARSE_POINT as i32)
                    || e.raw_os_error() == Some(ERROR_MORE_DATA as i32) =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn remove_reparse(&mut self) -> io::Result<()> {
        // Header-only buffer with zero data length deletes the point.
        let mut buffer = vec![0u8; REPARSE_HEADER_SIZE];
        LittleEndian::write_u32(&mut buffer[0..4], REPARSE_TAG);
        buffer[8..24].copy_from_slice(&REPARSE_GUID_BYTES);
        match self.run_ioctl(FSCTL_DELETE_REPARSE_POINT, Some(buffer), 0).await {
            Ok(_) => Ok(()),
            Err(e) if e.raw_os_error() == Some(ERROR_NOT_A_REPARSE_POINT as i32) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn set_sparse_len(&mut self, len: u64) -> io::Result<()> {
        if len == 0 {
            return Ok(());
        }
        self.run_ioctl(FSCTL_SET_SPARSE, None, 0).await?;
        let mut zero_info = [0u8; 16];
        LittleEndian::write_u64(&mut zero_info[8..16], len);
        self.run_ioctl(FSCTL_SET_ZERO_DATA, Some(zero_info.to_vec()), 0).await?;
        let file = self.file()?;
        file.seek(SeekFrom::Start(len)).await?;
        file.set_len(len).await
    }

    async fn clear_sparse(&mut self) -> io::Result<()> {
        // FILE_SET_SPARSE_BUFFER with SetSparse = FALSE.
        self.run_ioctl(FSCTL_SET_SPARSE, Some(vec![0u8]), 0).await.map(|_| ())
    }

    async fn close(mut self: Box<Self>) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        Ok(())
    }
}
