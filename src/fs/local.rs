//! Portable [`FileStore`] over real files.
//!
//! Content, lengths and read-only bits live on the real filesystem. The
//! reparse payload, sparse marker and offline bit can only be carried
//! natively by NTFS, so they live in an in-process overlay keyed by
//! case-folded path. The loopback driver shares the same store instance, so the
//! placeholder lifecycle behaves end to end on any platform. Used by the
//! demos and the test suite; production Windows deployments use
//! [`super::windows::NativeStore`].

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use filetime::FileTime;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use super::{AccessMode, FileAttrs, FileStore, ShareMode, StoreHandle, StoreMetadata};
use crate::text;

#[derive(Debug, Default, Clone)]
struct Overlay {
    reparse: Option<Vec<u8>>,
    sparse: bool,
    offline: bool,
}

#[derive(Debug, Default)]
struct Inner {
    overlay: DashMap<String, Overlay>,
}

/// Portable file store; cheap to clone, clones share the overlay.
#[derive(Debug, Clone, Default)]
pub struct LocalStore {
    inner: Arc<Inner>,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(path: &Path) -> String {
        text::fold(&path.to_string_lossy())
    }

    fn overlay(&self, path: &Path) -> Overlay {
        self.inner.overlay.get(&Self::key(path)).map(|o| o.clone()).unwrap_or_default()
    }

    fn update_overlay(&self, path: &Path, update: impl FnOnce(&mut Overlay)) {
        let mut entry = self.inner.overlay.entry(Self::key(path)).or_default();
        update(&mut entry);
    }

    fn clear_overlay(&self, path: &Path) {
        self.inner.overlay.remove(&Self::key(path));
    }
}

#[async_trait]
impl FileStore for LocalStore {
    async fn metadata(&self, path: &Path) -> io::Result<Option<StoreMetadata>> {
        let meta = match tokio::fs::metadata(path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let overlay = self.overlay(path);
        Ok(Some(StoreMetadata {
            is_directory: meta.is_dir(),
            len: meta.len(),
            attrs: FileAttrs {
                readonly: meta.permissions().readonly(),
                offline: overlay.offline,
            },
            is_reparse: overlay.reparse.is_some(),
            is_sparse: overlay.sparse,
        }))
    }

    async fn set_file_attrs(&self, path: &Path, attrs: FileAttrs) -> io::Result<()> {
        let meta = tokio::fs::metadata(path).await?;
        let mut permissions = meta.permissions();
        #[allow(clippy::permissions_set_readonly_false)]
        permissions.set_readonly(attrs.readonly);
        tokio::fs::set_permissions(path, permissions).await?;
        self.update_overlay(path, |o| o.offline = attrs.offline);
        Ok(())
    }

    async fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        tokio::fs::create_dir_all(path).await
    }

    async fn remove_file(&self, path: &Path) -> io::Result<()> {
        tokio::fs::remove_file(path).await?;
        self.clear_overlay(path);
        Ok(())
    }

    async fn prune_empty_dirs(&self, from: &Path, stop: &Path) -> io::Result<()> {
        let stop_key = Self::key(stop);
        let mut current = Some(from.to_path_buf());
        while let Some(dir) = current {
            if Self::key(&dir) == stop_key {
                break;
            }
            match tokio::fs::remove_dir(&dir).await {
                Ok(()) => current = dir.parent().map(Path::to_path_buf),
                // Non-empty or already gone ends the walk quietly.
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
            .open(path)
            .await?;
        Ok(Box::new(LocalHandle::new(self.clone(), path.to_path_buf(), file)))
    }

    async fn open_by_file_id(
        &self,
        path: &Path,
        access: AccessMode,
        _share: ShareMode,
    ) -> io::Result<Box<dyn StoreHandle>> {
        let file = tokio::fs::OpenOptions::new()
            .read(access.read || !access.write)
            .write(access.write)
            .open(path)
            .await?;
        Ok(Box::new(LocalHandle::new(self.clone(), path.to_path_buf(), file)))
    }

    async fn read_reparse(&self, path: &Path) -> io::Result<Option<Vec<u8>>> {
        if tokio::fs::metadata(path).await.is_err() {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such file"));
        }
        Ok(self.overlay(path).reparse)
    }

    async fn file_times(&self, path: &Path) -> io::Result<(FileTime, FileTime)> {
        let meta = tokio::fs::metadata(path).await?;
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
            .map_err(|e| io::Error::other(e))?
    }

    async fn rename_replace(&self, src: &Path, dst: &Path) -> io::Result<()> {
        tokio::fs::rename(src, dst).await?;
        self.clear_overlay(src);
        self.clear_overlay(dst);
        Ok(())
    }

    async fn create_symlink(&self, path: &Path, target: &Path) -> io::Result<()> {
        if tokio::fs::symlink_metadata(path).await.is_ok() {
            tokio::fs::remove_file(path).await?;
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        self.clear_overlay(path);
        #[cfg(unix)]
        {
            tokio::fs::symlink(target, path).await
        }
        #[cfg(windows)]
        {
            tokio::fs::symlink_file(target, path).await
        }
    }
}

struct LocalHandle {
    store: LocalStore,
    path: PathBuf,
    file: Option<tokio::fs::File>,
    restore_times: Option<(FileTime, FileTime)>,
}

impl LocalHandle {
    fn new(store: LocalStore, path: PathBuf, file: tokio::fs::File) -> Self {
        Self { store, path, file: Some(file), restore_times: None }
    }

    fn file(&mut self) -> io::Result<&mut tokio::fs::File> {
        self.file.as_mut().ok_or_else(|| io::Error::new(io::ErrorKind::Other, "handle closed"))
    }
}

#[async_trait]
impl StoreHandle for LocalHandle {
    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.file()?.write_all(data).await
    }

    async fn truncate_at_position(&mut self) -> io::Result<()> {
        let file = self.file()?;
        let position = file.seek(SeekFrom::Current(0)).await?;
        file.set_len(position).await
    }

    async fn freeze_times(&mut self) -> io::Result<()> {
        // The frozen times are reinstated when the handle closes, which is
        // the closest portable equivalent of the restricted SetFileTime.
        let (accessed, modified) = self.store.file_times(&self.path).await?;
        self.restore_times = Some((accessed, modified));
        Ok(())
    }

    async fn set_reparse(&mut self, payload: &[u8]) -> io::Result<()> {
        let payload = payload.to_vec();
        self.store.update_overlay(&self.path, |o| o.reparse = Some(payload));
        Ok(())
    }

    async fn get_reparse(&mut self) -> io::Result<Option<Vec<u8>>> {
        Ok(self.store.overlay(&self.path).reparse)
    }

    async fn remove_reparse(&mut self) -> io::Result<()> {
        self.store.update_overlay(&self.path, |o| o.reparse = None);
        Ok(())
    }

    async fn set_sparse_len(&mut self, len: u64) -> io::Result<()> {
        if len > 0 {
            self.file()?.set_len(len).await?;
            self.file()?.seek(SeekFrom::Start(len)).await?;
            self.store.update_overlay(&self.path, |o| o.sparse = true);
        }
        Ok(())
    }

    async fn clear_sparse(&mut self) -> io::Result<()> {
        self.store.update_overlay(&self.path, |o| o.sparse = false);
        Ok(())
    }

    async fn close(mut self: Box<Self>) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
            drop(file);
        }
        if let Some((accessed, modified)) = self.restore_times.take() {
            self.store.set_file_times(&self.path, accessed, modified).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_placeholder_state_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new();
        let path = dir.path().join("a.cpp");

        let mut handle = store.create_placeholder_file(&path, false).await.unwrap();
        handle.set_reparse(b"payload").await.unwrap();
        handle.set_sparse_len(1768).await.unwrap();
        handle.close().await.unwrap();

        let meta = store.metadata(&path).await.unwrap().unwrap();
        assert!(meta.is_reparse);
        assert!(meta.is_sparse);
        assert_eq!(meta.len, 1768);
        assert_eq!(store.read_reparse(&path).await.unwrap().unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_overlay_key_is_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new();
        let path = dir.path().join("File.bin");
        let mut handle = store.create_placeholder_file(&path, false).await.unwrap();
        handle.set_reparse(b"x").await.unwrap();
        handle.close().await.unwrap();

        let upper = dir.path().join("FILE.BIN");
        assert!(store.overlay(&upper).reparse.is_some());
    }

    #[tokio::test]
    async fn test_truncate_at_position() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new();
        let path = dir.path().join("t.bin");

        let mut handle = store.create_placeholder_file(&path, false).await.unwrap();
        handle.set_sparse_len(100).await.unwrap();
        handle.close().await.unwrap();

        let mut handle =
            store.open_by_file_id(&path, AccessMode::WRITE, ShareMode::ALL).await.unwrap();
        handle.write(b"hello").await.unwrap();
        handle.truncate_at_position().await.unwrap();
        handle.remove_reparse().await.unwrap();
        handle.clear_sparse().await.unwrap();
        handle.close().await.unwrap();

        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"hello");
        let meta = store.metadata(&path).await.unwrap().unwrap();
        assert!(!meta.is_sparse);
        assert!(!meta.is_reparse);
    }

    #[tokio::test]
    async fn test_prune_empty_dirs_stops_at_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new();
        let root = dir.path().join("client");
        let deep = root.join("a/b/c");
        store.create_dir_all(&deep).await.unwrap();

        store.prune_empty_dirs(&deep, &root).await.unwrap();
        assert!(!root.join("a").exists());
        assert!(root.exists());
    }
}
