//! 本地磁盘存储

use super::guard::{base_name, join_path, parent_path, PathGuard};
use super::{Capabilities, LinkMode, Obj, PutOptions, Storage, StorageError};
use crate::common::{BufferPool, DEFAULT_COPY_BUFFER_SIZE};
use crate::stream::{copy_with_buffer, Link, SeekableStream, StreamError};
use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// 以某个本地目录为根的存储
#[derive(Debug)]
pub struct LocalStorage {
    guard: PathGuard,
    link_mode: LinkMode,
    pool: Arc<BufferPool>,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>, link_mode: LinkMode) -> Self {
        Self {
            guard: PathGuard::new(root),
            link_mode,
            pool: BufferPool::new(DEFAULT_COPY_BUFFER_SIZE, 4),
        }
    }

    pub fn root(&self) -> &Path {
        self.guard.root()
    }

    fn obj_from_metadata(path: &str, meta: &Metadata) -> Obj {
        let modified = meta.modified().map(DateTime::<Utc>::from).unwrap_or_default();
        let created = meta.created().map(DateTime::<Utc>::from).unwrap_or(modified);
        Obj {
            path: path.to_string(),
            name: base_name(path),
            size: if meta.is_dir() { 0 } else { meta.len() as i64 },
            modified,
            created,
            is_dir: meta.is_dir(),
        }
    }

    /// 目标父目录必须存在且为目录
    async fn ensure_parent(&self, path: &str) -> Result<(), StorageError> {
        let parent = parent_path(path);
        let local = self.guard.resolve(&parent)?;
        match tokio::fs::metadata(&local).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            _ => Err(StorageError::ParentNotFound(parent)),
        }
    }

    async fn ensure_absent(&self, path: &str, local: &Path) -> Result<(), StorageError> {
        if tokio::fs::symlink_metadata(local).await.is_ok() {
            return Err(StorageError::AlreadyExists(path.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn resolve(&self, path: &str) -> Result<Obj, StorageError> {
        let local = self.guard.resolve(path)?;
        let meta = tokio::fs::metadata(&local)
            .await
            .map_err(|e| StorageError::from_io(e, path))?;
        Ok(Self::obj_from_metadata(path, &meta))
    }

    async fn list(&self, path: &str) -> Result<Vec<Obj>, StorageError> {
        let local = self.guard.resolve(path)?;
        let mut entries = tokio::fs::read_dir(&local)
            .await
            .map_err(|e| StorageError::from_io(e, path))?;

        let mut objs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            match tokio::fs::metadata(entry.path()).await {
                Ok(meta) => objs.push(Self::obj_from_metadata(&join_path(path, &name), &meta)),
                Err(e) => warn!("读取元数据失败，跳过 {:?}: {}", entry.path(), e),
            }
        }
        objs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(objs)
    }

    async fn create_collection(&self, path: &str) -> Result<(), StorageError> {
        let local = self.guard.resolve(path)?;
        self.ensure_parent(path).await?;
        self.ensure_absent(path, &local).await?;
        tokio::fs::create_dir(&local)
            .await
            .map_err(|e| StorageError::from_io(e, path))?;
        debug!("创建目录: {:?}", local);
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), StorageError> {
        let local = self.guard.resolve(path)?;
        if local == self.guard.root() || base_name(path).is_empty() {
            return Err(StorageError::PermissionDenied(path.to_string()));
        }
        let meta = tokio::fs::metadata(&local)
            .await
            .map_err(|e| StorageError::from_io(e, path))?;
        let result = if meta.is_dir() {
            tokio::fs::remove_dir_all(&local).await
        } else {
            tokio::fs::remove_file(&local).await
        };
        result.map_err(|e| StorageError::from_io(e, path))?;
        info!("已删除: {:?}", local);
        Ok(())
    }

    async fn rename(&self, src: &str, new_name: &str) -> Result<(), StorageError> {
        if new_name.is_empty() || new_name.contains('/') {
            return Err(StorageError::PermissionDenied(new_name.to_string()));
        }
        let from = self.guard.resolve(src)?;
        let dst = join_path(&parent_path(src), new_name);
        let to = self.guard.resolve(&dst)?;
        self.ensure_absent(&dst, &to).await?;
        tokio::fs::rename(&from, &to)
            .await
            .map_err(|e| StorageError::from_io(e, src))?;
        Ok(())
    }

    async fn move_to(&self, src: &str, dst_dir: &str) -> Result<(), StorageError> {
        let from = self.guard.resolve(src)?;
        let dst = join_path(dst_dir, &base_name(src));
        let to = self.guard.resolve(&dst)?;
        self.ensure_parent(&dst).await?;
        self.ensure_absent(&dst, &to).await?;
        tokio::fs::rename(&from, &to)
            .await
            .map_err(|e| StorageError::from_io(e, src))?;
        Ok(())
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<(), StorageError> {
        let from = self.guard.resolve(src)?;
        let to = self.guard.resolve(dst)?;
        let meta = tokio::fs::metadata(&from)
            .await
            .map_err(|e| StorageError::from_io(e, src))?;
        self.ensure_parent(dst).await?;
        self.ensure_absent(dst, &to).await?;

        if !meta.is_dir() {
            tokio::fs::copy(&from, &to).await?;
            return Ok(());
        }

        // 目录递归复制放到阻塞线程池
        tokio::task::spawn_blocking(move || copy_dir_all(&from, &to))
            .await
            .map_err(|e| StorageError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;
        Ok(())
    }

    async fn link(&self, path: &str, _headers: &HeaderMap) -> Result<Link, StorageError> {
        let local = self.guard.resolve(path)?;
        let file = tokio::fs::File::open(&local)
            .await
            .map_err(|e| StorageError::from_io(e, path))?;
        let file = file.into_std().await;
        if file.metadata()?.is_dir() {
            return Err(StorageError::NotSupported("目录没有数据链接"));
        }
        Ok(Link::File(Arc::new(file)))
    }

    async fn put_stream(
        &self,
        dst_dir: &str,
        mut stream: SeekableStream,
        options: PutOptions,
    ) -> Result<Obj, StorageError> {
        let dst = join_path(dst_dir, stream.name());
        if base_name(&dst).is_empty() {
            return Err(StorageError::PermissionDenied(dst));
        }
        let dir_local = self.guard.resolve(dst_dir)?;
        match tokio::fs::metadata(&dir_local).await {
            Ok(meta) if meta.is_dir() => {}
            _ => return Err(StorageError::ParentNotFound(dst_dir.to_string())),
        }
        let target = self.guard.resolve(&dst)?;

        // 先写同目录下的临时文件，完整写入后再重命名
        let temp = dir_local.join(format!(".{}.{}.upload", base_name(&dst), uuid::Uuid::new_v4()));
        let mut file = tokio::fs::File::create(&temp).await?;
        let declared = stream.size();
        let written = match copy_with_buffer(&mut stream, &mut file, self.pool.checkout()).await {
            Ok(n) => n,
            Err(e) => {
                drop(file);
                let _ = tokio::fs::remove_file(&temp).await;
                return Err(StreamError::from_io(e).into());
            }
        };
        drop(file);

        if declared > 0 && written < declared as u64 {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(StreamError::StreamIncomplete {
                expected: declared as u64,
                actual: written,
            }
            .into());
        }

        if let Some(modified) = options.modified {
            let std_file = std::fs::OpenOptions::new().write(true).open(&temp)?;
            std_file.set_modified(SystemTime::from(modified))?;
        }
        // 本地磁盘无法可移植地设置创建时间，options.created 忽略

        tokio::fs::rename(&temp, &target).await?;
        info!("上传完成: {} ({} bytes)", dst, written);
        self.resolve(&dst).await
    }

    fn capabilities(&self, _path: &str) -> Capabilities {
        Capabilities {
            link_mode: self.link_mode,
        }
    }
}

fn copy_dir_all(from: &Path, to: &Path) -> Result<(), StorageError> {
    for entry in walkdir::WalkDir::new(from).follow_links(false) {
        let entry = entry.map_err(|e| StorageError::Io(e.into()))?;
        let rel = entry
            .path()
            .strip_prefix(from)
            .map_err(|e| StorageError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        let target = to.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::BoxReader;
    use chrono::TimeZone;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn storage() -> (TempDir, LocalStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path(), LinkMode::Proxy);
        (dir, storage)
    }

    fn body(name: &str, data: &[u8]) -> SeekableStream {
        let reader: BoxReader = Box::pin(Cursor::new(data.to_vec()));
        SeekableStream::from_reader(name, data.len() as i64, reader)
    }

    #[tokio::test]
    async fn test_put_resolve_list() {
        let (_dir, storage) = storage();
        storage.create_collection("/docs").await.unwrap();
        let obj = storage
            .put_stream("/docs", body("a.txt", b"hello"), PutOptions::default())
            .await
            .unwrap();
        assert_eq!(obj.path, "/docs/a.txt");
        assert_eq!(obj.size, 5);
        assert!(!obj.is_dir);

        let list = storage.list("/docs").await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].name, "a.txt");

        let root = storage.resolve("/").await.unwrap();
        assert!(root.is_dir);
    }

    #[tokio::test]
    async fn test_put_honors_mtime() {
        let (_dir, storage) = storage();
        let mtime = Utc.timestamp_opt(1_600_000_000, 0).unwrap();
        let obj = storage
            .put_stream(
                "/",
                body("m.bin", b"x"),
                PutOptions {
                    modified: Some(mtime),
                    created: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(obj.modified, mtime);
    }

    #[tokio::test]
    async fn test_put_incomplete_body_rejected() {
        let (dir, storage) = storage();
        let reader: BoxReader = Box::pin(Cursor::new(vec![1u8; 3]));
        let stream = SeekableStream::from_reader("short.bin", 10, reader);
        let err = storage.put_stream("/", stream, PutOptions::default()).await.unwrap_err();
        assert!(matches!(err, StorageError::Stream(StreamError::StreamIncomplete { .. })));
        // 临时文件已清理
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_collection_errors() {
        let (_dir, storage) = storage();
        assert!(matches!(
            storage.create_collection("/a/b").await,
            Err(StorageError::ParentNotFound(_))
        ));
        storage.create_collection("/a").await.unwrap();
        assert!(matches!(
            storage.create_collection("/a").await,
            Err(StorageError::AlreadyExists(_))
        ));
        assert!(matches!(storage.remove("/missing").await, Err(StorageError::NotFound(_))));
        assert!(matches!(storage.remove("/").await, Err(StorageError::PermissionDenied(_))));
    }

    #[tokio::test]
    async fn test_rename_move_copy() {
        let (_dir, storage) = storage();
        storage.create_collection("/src").await.unwrap();
        storage.create_collection("/dst").await.unwrap();
        storage
            .put_stream("/src", body("f.txt", b"data"), PutOptions::default())
            .await
            .unwrap();

        storage.rename("/src/f.txt", "g.txt").await.unwrap();
        assert!(storage.resolve("/src/g.txt").await.is_ok());

        storage.copy("/src", "/copy").await.unwrap();
        assert_eq!(storage.resolve("/copy/g.txt").await.unwrap().size, 4);

        storage.move_to("/src/g.txt", "/dst").await.unwrap();
        assert!(matches!(storage.resolve("/src/g.txt").await, Err(StorageError::NotFound(_))));
        assert!(storage.resolve("/dst/g.txt").await.is_ok());

        assert!(matches!(
            storage.copy("/dst/g.txt", "/copy/g.txt").await,
            Err(StorageError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_link_is_local_file() {
        let (_dir, storage) = storage();
        storage
            .put_stream("/", body("f.txt", b"data"), PutOptions::default())
            .await
            .unwrap();
        let link = storage.link("/f.txt", &HeaderMap::new()).await.unwrap();
        assert!(matches!(link, Link::File(_)));
        assert!(storage.link("/", &HeaderMap::new()).await.is_err());
    }
}
