//! 挂载表
//!
//! 把多个存储后端按挂载路径聚合成一棵目录树：
//! - 路径按最长前缀匹配到挂载点，剩余部分交给对应后端
//! - 挂载点的祖先路径表现为只读的虚拟目录
//! - 跨挂载点的复制/移动通过 `Link → SeekableStream → put_stream` 流式完成
//! - 目录列表带 TTL 缓存，所有修改都会使相关缓存失效

use super::cache::ObjCache;
use super::guard::{base_name, clean_path, join_path, parent_path};
use super::{Capabilities, Obj, PutOptions, Storage, StorageError};
use crate::stream::{Link, LinkContext, SeekableStream};
use async_trait::async_trait;
use axum::http::HeaderMap;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// 挂载点
#[derive(Clone)]
pub struct Mount {
    /// 挂载路径（规范化的虚拟路径）
    pub path: String,
    pub storage: Arc<dyn Storage>,
}

impl std::fmt::Debug for Mount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mount").field("path", &self.path).finish()
    }
}

/// 聚合多个后端的挂载表
#[derive(Debug)]
pub struct MountTable {
    /// 按路径长度降序排列，保证最长前缀优先
    mounts: Vec<Mount>,
    cache: ObjCache,
    ctx: LinkContext,
    temp_dir: Option<PathBuf>,
}

impl MountTable {
    pub fn new(ctx: LinkContext, cache_ttl: Duration) -> Self {
        Self {
            mounts: Vec::new(),
            cache: ObjCache::new(cache_ttl),
            ctx,
            temp_dir: None,
        }
    }

    /// 跨挂载点复制时流物化使用的临时目录
    pub fn with_temp_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.temp_dir = dir;
        self
    }

    /// 添加挂载点
    pub fn mount(&mut self, path: &str, storage: Arc<dyn Storage>) {
        let path = clean_path(path);
        info!("挂载存储: {}", path);
        self.mounts.retain(|m| m.path != path);
        self.mounts.push(Mount { path, storage });
        self.mounts.sort_by(|a, b| b.path.len().cmp(&a.path.len()));
    }

    pub fn mounts(&self) -> &[Mount] {
        &self.mounts
    }

    /// 最长前缀匹配，返回挂载点与后端内路径
    fn locate(&self, path: &str) -> Option<(&Mount, String)> {
        let path = clean_path(path);
        self.mounts.iter().find_map(|m| {
            if m.path == "/" {
                return Some((m, path.clone()));
            }
            if path == m.path {
                return Some((m, "/".to_string()));
            }
            path.strip_prefix(&m.path)
                .filter(|rest| rest.starts_with('/'))
                .map(|rest| (m, rest.to_string()))
        })
    }

    /// 直接位于 `path` 之下的挂载点名称（虚拟子目录）
    fn virtual_children(&self, path: &str) -> BTreeSet<String> {
        let path = clean_path(path);
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        self.mounts
            .iter()
            .filter_map(|m| m.path.strip_prefix(&prefix))
            .filter(|rest| !rest.is_empty())
            .filter_map(|rest| rest.split('/').next().map(str::to_string))
            .collect()
    }

    fn is_mount_root(&self, path: &str) -> bool {
        let path = clean_path(path);
        self.mounts.iter().any(|m| m.path == path)
    }

    fn locate_or_denied(&self, path: &str) -> Result<(&Mount, String), StorageError> {
        self.locate(path)
            .ok_or_else(|| StorageError::PermissionDenied(format!("{} 不在任何挂载点下", path)))
    }

    fn rebase(obj: Obj, full_path: String) -> Obj {
        Obj {
            name: base_name(&full_path),
            path: full_path,
            ..obj
        }
    }

    /// 两个路径是否落在同一个挂载点
    fn same_mount(&self, a: &str, b: &str) -> Option<(Arc<dyn Storage>, String, String)> {
        let (ma, ia) = self.locate(a)?;
        let (mb, ib) = self.locate(b)?;
        (ma.path == mb.path).then(|| (Arc::clone(&ma.storage), ia, ib))
    }

    /// 跨挂载点复制：目录逐级创建，文件通过数据流传输
    async fn copy_across(&self, src: &str, dst: &str) -> Result<(), StorageError> {
        let mut pending = vec![(clean_path(src), clean_path(dst))];
        while let Some((src, dst)) = pending.pop() {
            let obj = self.resolve(&src).await?;
            if obj.is_dir {
                self.create_collection(&dst).await?;
                for child in self.list(&src).await?.iter() {
                    pending.push((child.path.clone(), join_path(&dst, &child.name)));
                }
                continue;
            }

            let (src_mount, src_inner) = self.locate_or_denied(&src)?;
            let link = src_mount.storage.link(&src_inner, &HeaderMap::new()).await?;
            let label = dst.clone();
            let stream = SeekableStream::from_link(base_name(&dst), obj.size, &link, &self.ctx)?
                .with_temp_dir(self.temp_dir.clone())
                .with_progress(Arc::new(move |done: u64, total: i64| {
                    debug!("跨挂载点复制进度 {}: {}/{}", label, done, total);
                }));
            let options = PutOptions {
                modified: Some(obj.modified),
                created: Some(obj.created),
            };
            debug!("跨挂载点复制: {} -> {}", src, dst);
            self.put_stream(&parent_path(&dst), stream, options).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for MountTable {
    async fn resolve(&self, path: &str) -> Result<Obj, StorageError> {
        let path = clean_path(path);
        if let Some((mount, inner)) = self.locate(&path) {
            match mount.storage.resolve(&inner).await {
                Ok(obj) => return Ok(Self::rebase(obj, path)),
                Err(StorageError::NotFound(_)) if !self.virtual_children(&path).is_empty() => {}
                Err(e) => return Err(e),
            }
        }
        if path == "/" || !self.virtual_children(&path).is_empty() {
            return Ok(Obj::dir(&path));
        }
        Err(StorageError::NotFound(path))
    }

    async fn list(&self, path: &str) -> Result<Vec<Obj>, StorageError> {
        let path = clean_path(path);
        if let Some(cached) = self.cache.get(&path) {
            return Ok(cached.as_ref().clone());
        }

        let virtual_children = self.virtual_children(&path);
        let mut objs = match self.locate(&path) {
            Some((mount, inner)) => match mount.storage.list(&inner).await {
                Ok(objs) => objs
                    .into_iter()
                    .map(|o| {
                        let full = join_path(&path, &o.name);
                        Self::rebase(o, full)
                    })
                    .collect(),
                Err(StorageError::NotFound(_)) if !virtual_children.is_empty() => Vec::new(),
                Err(e) => return Err(e),
            },
            None if path == "/" || !virtual_children.is_empty() => Vec::new(),
            None => return Err(StorageError::NotFound(path)),
        };

        for name in virtual_children {
            if !objs.iter().any(|o| o.name == name) {
                objs.push(Obj::dir(&join_path(&path, &name)));
            }
        }
        objs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(self.cache.put(&path, objs).as_ref().clone())
    }

    async fn create_collection(&self, path: &str) -> Result<(), StorageError> {
        if self.is_mount_root(path) || !self.virtual_children(path).is_empty() {
            return Err(StorageError::AlreadyExists(path.to_string()));
        }
        let (mount, inner) = self.locate_or_denied(path)?;
        mount.storage.create_collection(&inner).await?;
        self.invalidate(path);
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), StorageError> {
        if self.is_mount_root(path) {
            return Err(StorageError::PermissionDenied(path.to_string()));
        }
        if !self.virtual_children(path).is_empty() {
            return Err(StorageError::NotEmpty(path.to_string()));
        }
        let (mount, inner) = self.locate_or_denied(path)?;
        mount.storage.remove(&inner).await?;
        self.cache.invalidate_tree(&clean_path(path));
        Ok(())
    }

    async fn rename(&self, src: &str, new_name: &str) -> Result<(), StorageError> {
        if self.is_mount_root(src) {
            return Err(StorageError::PermissionDenied(src.to_string()));
        }
        let (mount, inner) = self.locate_or_denied(src)?;
        mount.storage.rename(&inner, new_name).await?;
        self.cache.invalidate_tree(&clean_path(src));
        self.invalidate(&join_path(&parent_path(src), new_name));
        Ok(())
    }

    async fn move_to(&self, src: &str, dst_dir: &str) -> Result<(), StorageError> {
        if self.is_mount_root(src) {
            return Err(StorageError::PermissionDenied(src.to_string()));
        }
        let dst = join_path(dst_dir, &base_name(src));
        match self.same_mount(src, dst_dir) {
            Some((storage, src_inner, dir_inner)) => {
                storage.move_to(&src_inner, &dir_inner).await?;
            }
            None => {
                if self.resolve(&dst).await.is_ok() {
                    return Err(StorageError::AlreadyExists(dst));
                }
                self.copy_across(src, &dst).await?;
                self.remove(src).await?;
            }
        }
        self.cache.invalidate_tree(&clean_path(src));
        self.invalidate(&dst);
        Ok(())
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<(), StorageError> {
        match self.same_mount(src, dst) {
            Some((storage, src_inner, dst_inner)) => {
                storage.copy(&src_inner, &dst_inner).await?;
            }
            None => {
                if self.resolve(dst).await.is_ok() {
                    return Err(StorageError::AlreadyExists(dst.to_string()));
                }
                self.copy_across(src, dst).await?;
            }
        }
        self.invalidate(dst);
        Ok(())
    }

    async fn link(&self, path: &str, headers: &HeaderMap) -> Result<Link, StorageError> {
        let (mount, inner) = self.locate_or_denied(path)?;
        mount.storage.link(&inner, headers).await
    }

    async fn put_stream(
        &self,
        dst_dir: &str,
        stream: SeekableStream,
        options: PutOptions,
    ) -> Result<Obj, StorageError> {
        let dst_dir = clean_path(dst_dir);
        let (mount, inner) = self.locate_or_denied(&dst_dir)?;
        let obj = mount.storage.put_stream(&inner, stream, options).await?;
        let full = join_path(&dst_dir, &obj.name);
        self.invalidate(&full);
        Ok(Self::rebase(obj, full))
    }

    fn capabilities(&self, path: &str) -> Capabilities {
        self.locate(path)
            .map(|(mount, inner)| mount.storage.capabilities(&inner))
            .unwrap_or_default()
    }

    fn invalidate(&self, path: &str) {
        let path = clean_path(path);
        self.cache.invalidate(&path);
        if let Some((mount, inner)) = self.locate(&path) {
            mount.storage.invalidate(&inner);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::BufferPool;
    use crate::downloader::DownloaderConfig;
    use crate::storage::{LinkMode, LocalStorage};
    use crate::stream::BoxReader;
    use reqwest::Client;
    use std::io::Cursor;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn context() -> LinkContext {
        LinkContext::new(
            Client::new(),
            BufferPool::new(1024, 2),
            DownloaderConfig::default(),
            CancellationToken::new(),
        )
    }

    fn body(name: &str, data: &[u8]) -> SeekableStream {
        let reader: BoxReader = Box::pin(Cursor::new(data.to_vec()));
        SeekableStream::from_reader(name, data.len() as i64, reader)
    }

    /// /local -> dir a, /cloud/drive -> dir b
    fn table() -> (TempDir, TempDir, MountTable) {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let mut table = MountTable::new(context(), Duration::from_secs(60));
        table.mount("/local", Arc::new(LocalStorage::new(a.path(), LinkMode::Proxy)));
        table.mount("/cloud/drive", Arc::new(LocalStorage::new(b.path(), LinkMode::Redirect)));
        (a, b, table)
    }

    #[tokio::test]
    async fn test_virtual_directories() {
        let (_a, _b, table) = table();
        let root = table.list("/").await.unwrap();
        let names: Vec<_> = root.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["cloud", "local"]);
        assert!(root.iter().all(|o| o.is_dir));

        assert!(table.resolve("/cloud").await.unwrap().is_dir);
        assert!(matches!(table.resolve("/nowhere").await, Err(StorageError::NotFound(_))));
        assert!(matches!(table.remove("/cloud").await, Err(StorageError::NotEmpty(_))));
        assert!(matches!(
            table.remove("/local").await,
            Err(StorageError::PermissionDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_longest_prefix_and_capabilities() {
        let (_a, _b, table) = table();
        table.put_stream("/cloud/drive", body("x.txt", b"x"), PutOptions::default()).await.unwrap();
        let obj = table.resolve("/cloud/drive/x.txt").await.unwrap();
        assert_eq!(obj.path, "/cloud/drive/x.txt");
        assert_eq!(table.capabilities("/cloud/drive/x.txt").link_mode, LinkMode::Redirect);
        assert_eq!(table.capabilities("/local").link_mode, LinkMode::Proxy);
    }

    #[tokio::test]
    async fn test_listing_cache_invalidated_on_put() {
        let (_a, _b, table) = table();
        assert!(table.list("/local").await.unwrap().is_empty());
        table.put_stream("/local", body("n.txt", b"1"), PutOptions::default()).await.unwrap();
        let names: Vec<_> = table
            .list("/local")
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.name)
            .collect();
        assert_eq!(names, vec!["n.txt".to_string()]);
    }

    #[tokio::test]
    async fn test_cross_mount_copy_and_move() {
        let (_a, b, table) = table();
        table.create_collection("/local/dir").await.unwrap();
        table
            .put_stream("/local/dir", body("f.bin", &[9u8; 4096]), PutOptions::default())
            .await
            .unwrap();

        table.copy("/local/dir", "/cloud/drive/dir2").await.unwrap();
        let copied = table.resolve("/cloud/drive/dir2/f.bin").await.unwrap();
        assert_eq!(copied.size, 4096);
        assert_eq!(std::fs::read(b.path().join("dir2/f.bin")).unwrap(), vec![9u8; 4096]);

        table.move_to("/local/dir/f.bin", "/cloud/drive").await.unwrap();
        assert!(matches!(
            table.resolve("/local/dir/f.bin").await,
            Err(StorageError::NotFound(_))
        ));
        assert!(table.resolve("/cloud/drive/f.bin").await.is_ok());
    }
}
