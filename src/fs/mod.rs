//! Privileged file operations behind the placeholder format.
//!
//! Everything the placeholder manager and the residency resolver do to a
//! file (creating it with a reparse point, sizing it sparse, opening it by
//! file id while the reparse point is still attached, freezing its times)
//! goes through the [`FileStore`] trait. [`local::LocalStore`] is the
//! portable implementation over real files plus an in-process metadata
//! overlay; on Windows [`windows::NativeStore`] issues the real FSCTLs.

pub mod local;
#[cfg(windows)]
pub mod windows;

use std::io;
use std::path::Path;

use async_trait::async_trait;

/// Attribute bits the core manipulates on workspace files.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct FileAttrs {
    pub readonly: bool,
    pub offline: bool,
}

impl FileAttrs {
    pub const NORMAL: FileAttrs = FileAttrs { readonly: false, offline: false };

    pub fn readonly(mut self, value: bool) -> Self {
        self.readonly = value;
        self
    }

    pub fn offline(mut self, value: bool) -> Self {
        self.offline = value;
        self
    }
}

/// Snapshot of a file's store-visible state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreMetadata {
    pub is_directory: bool,
    /// Logical length; equals the sparse size for placeholders.
    pub len: u64,
    pub attrs: FileAttrs,
    pub is_reparse: bool,
    pub is_sparse: bool,
}

/// Desired access for an open-by-file-id request.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct AccessMode {
    pub read: bool,
    pub write: bool,
    pub delete: bool,
}

impl AccessMode {
    pub const READ: AccessMode = AccessMode { read: true, write: false, delete: false };
    pub const WRITE: AccessMode = AccessMode { read: false, write: true, delete: false };
    pub const READ_WRITE: AccessMode = AccessMode { read: true, write: true, delete: false };
}

/// Share mode for an open-by-file-id request.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct ShareMode {
    pub read: bool,
    pub write: bool,
    pub delete: bool,
}

impl ShareMode {
    /// `FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE`, the only
    /// sanctioned mode while a reparse point is attached.
    pub const ALL: ShareMode = ShareMode { read: true, write: true, delete: true };
}

/// An open handle onto one file, with the reparse point (if any) attached.
///
/// The hydrate sequence is a strict order on one handle: freeze times,
/// write, truncate at position, remove reparse, clear sparse, close.
#[async_trait]
pub trait StoreHandle: Send {
    async fn write(&mut self, data: &[u8]) -> io::Result<()>;

    /// Truncates the file at the current write position.
    async fn truncate_at_position(&mut self) -> io::Result<()>;

    /// Prevents writes through this handle from changing the file's
    /// last-access and last-modified times.
    async fn freeze_times(&mut self) -> io::Result<()>;

    /// Attaches (or replaces) the placeholder reparse payload.
    async fn set_reparse(&mut self, payload: &[u8]) -> io::Result<()>;

    /// Reads the raw reparse payload, `None` when the file has none or the
    /// tag/GUID belong to someone else.
    async fn get_reparse(&mut self) -> io::Result<Option<Vec<u8>>>;

    /// Strips the reparse point. Removing an absent point is not an error.
    async fn remove_reparse(&mut self) -> io::Result<()>;

    /// Marks the file sparse with the given logical length.
    async fn set_sparse_len(&mut self, len: u64) -> io::Result<()>;

    /// Clears the sparse marker, leaving content as written.
    async fn clear_sparse(&mut self) -> io::Result<()>;

    async fn close(self: Box<Self>) -> io::Result<()>;
}

/// The privileged file-operation surface.
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Store-visible metadata, `None` for a missing file.
    async fn metadata(&self, path: &Path) -> io::Result<Option<StoreMetadata>>;

    async fn set_file_attrs(&self, path: &Path, attrs: FileAttrs) -> io::Result<()>;

    async fn create_dir_all(&self, path: &Path) -> io::Result<()>;

    async fn remove_file(&self, path: &Path) -> io::Result<()>;

    /// Removes now-empty directories walking up from `from`, stopping at
    /// `stop` without removing it. Best effort.
    async fn prune_empty_dirs(&self, from: &Path, stop: &Path) -> io::Result<()>;

    /// Opens (creating or truncating) a file for exclusive write with the
    /// reparse point visible. Used only by placeholder install.
    async fn create_placeholder_file(
        &self,
        path: &Path,
        truncate: bool,
    ) -> io::Result<Box<dyn StoreHandle>>;

    /// Opens an existing file by its unique file id, bypassing
    /// directory-level access checks, with the reparse point visible. The
    /// only sanctioned way to write a placeholder's data stream.
    async fn open_by_file_id(
        &self,
        path: &Path,
        access: AccessMode,
        share: ShareMode,
    ) -> io::Result<Box<dyn StoreHandle>>;

    /// Reads the reparse payload without keeping a handle open.
    async fn read_reparse(&self, path: &Path) -> io::Result<Option<Vec<u8>>>;

    /// The file's (accessed, modified) times, for the move populate path.
    async fn file_times(&self, path: &Path) -> io::Result<(filetime::FileTime, filetime::FileTime)>;

    async fn set_file_times(
        &self,
        path: &Path,
        accessed: filetime::FileTime,
        modified: filetime::FileTime,
    ) -> io::Result<()>;

    /// Atomically renames `src` over `dst`, replacing it.
    async fn rename_replace(&self, src: &Path, dst: &Path) -> io::Result<()>;

    /// Creates a symbolic link at `path` pointing at `target`, replacing
    /// any existing file.
    async fn create_symlink(&self, path: &Path, target: &Path) -> io::Result<()>;
}
