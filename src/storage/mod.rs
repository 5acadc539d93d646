//! 存储抽象层
//!
//! WebDAV 处理器只通过 [`Storage`] 访问后端：解析对象、列目录、增删改、
//! 获取数据来源 [`Link`] 以及上传。具体后端（本地磁盘、云盘驱动）实现该 trait，
//! [`MountTable`] 把多个后端按挂载路径聚合成一棵目录树。

pub mod cache;
pub mod guard;
pub mod local;
pub mod mount;

pub use cache::ObjCache;
pub use guard::{base_name, clean_path, join_jailed, join_path, parent_path, PathGuard};
pub use local::LocalStorage;
pub use mount::{Mount, MountTable};

use crate::stream::{Link, SeekableStream, StreamError};
use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;

/// 存储对象（文件或目录）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Obj {
    /// 完整虚拟路径
    pub path: String,
    pub name: String,
    /// 文件大小，目录为 0
    pub size: i64,
    pub modified: DateTime<Utc>,
    pub created: DateTime<Utc>,
    pub is_dir: bool,
}

impl Obj {
    /// 虚拟目录
    pub fn dir(path: &str) -> Self {
        let epoch = DateTime::<Utc>::UNIX_EPOCH;
        Self {
            path: clean_path(path),
            name: base_name(path),
            size: 0,
            modified: epoch,
            created: epoch,
            is_dir: true,
        }
    }

    /// 强 ETag: 修改时间（纳秒）与大小的十六进制拼接
    pub fn etag(&self) -> String {
        let nanos = self.modified.timestamp_nanos_opt().unwrap_or_default();
        format!("\"{:x}{:x}\"", nanos, self.size)
    }
}

/// 存储层错误
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("对象不存在: {0}")]
    NotFound(String),

    #[error("对象已存在: {0}")]
    AlreadyExists(String),

    #[error("目录非空: {0}")]
    NotEmpty(String),

    #[error("没有权限访问: {0}")]
    PermissionDenied(String),

    #[error("父目录不存在: {0}")]
    ParentNotFound(String),

    #[error("存储不支持该操作: {0}")]
    NotSupported(&'static str),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error("IO 错误: {0}")]
    Io(#[from] io::Error),
}

impl StorageError {
    /// 按错误类型映射 IO 错误
    pub fn from_io(err: io::Error, path: &str) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => StorageError::NotFound(path.to_string()),
            io::ErrorKind::PermissionDenied => StorageError::PermissionDenied(path.to_string()),
            io::ErrorKind::AlreadyExists => StorageError::AlreadyExists(path.to_string()),
            _ => StorageError::Io(err),
        }
    }
}

/// 读取文件内容时的链接模式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkMode {
    /// 服务端代理传输
    #[default]
    Proxy,
    /// 302 重定向到后端直链
    Redirect,
    /// 重定向到本服务的签名代理地址
    SignedProxy,
}

/// 后端能力声明
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub link_mode: LinkMode,
}

/// 上传附带的元数据
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    /// 客户端指定的修改时间（X-OC-Mtime）
    pub modified: Option<DateTime<Utc>>,
    /// 客户端指定的创建时间（X-OC-Ctime）
    pub created: Option<DateTime<Utc>>,
}

/// 存储后端
#[async_trait]
pub trait Storage: Send + Sync {
    /// 解析对象
    async fn resolve(&self, path: &str) -> Result<Obj, StorageError>;

    /// 列出目录的直接子项（递归由调用方完成）
    async fn list(&self, path: &str) -> Result<Vec<Obj>, StorageError>;

    /// 创建目录，父目录必须存在
    async fn create_collection(&self, path: &str) -> Result<(), StorageError>;

    /// 删除文件或整个目录
    async fn remove(&self, path: &str) -> Result<(), StorageError>;

    /// 同目录重命名
    async fn rename(&self, src: &str, new_name: &str) -> Result<(), StorageError>;

    /// 移动到另一个目录，保留名称
    async fn move_to(&self, src: &str, dst_dir: &str) -> Result<(), StorageError>;

    /// 复制到 `dst`（完整目标路径）
    async fn copy(&self, src: &str, dst: &str) -> Result<(), StorageError>;

    /// 文件的数据来源
    async fn link(&self, path: &str, headers: &HeaderMap) -> Result<Link, StorageError>;

    /// 把数据流写入 `dst_dir`，文件名取自流名称
    async fn put_stream(
        &self,
        dst_dir: &str,
        stream: SeekableStream,
        options: PutOptions,
    ) -> Result<Obj, StorageError>;

    /// 读取文件内容时使用的链接模式
    fn capabilities(&self, path: &str) -> Capabilities;

    /// 使缓存的对象信息失效
    fn invalidate(&self, _path: &str) {}
}
