//! NetDisk WebDAV Library
//! 网盘 WebDAV 网关核心库

// 公共模块（缓冲区池等）
pub mod common;

// 配置管理模块
pub mod config;

// 分块并发下载模块
pub mod downloader;

// 日志模块
pub mod logging;

// Web服务器模块
pub mod server;

// 代理链接签名模块
pub mod sign;

// 存储后端模块
pub mod storage;

// 可定位数据流模块
pub mod stream;

// WebDAV 协议模块
pub mod webdav;

// 导出常用类型
pub use config::AppConfig;
pub use server::AppState;
pub use sign::{LinkSigner, SignError};
pub use storage::{LinkMode, LocalStorage, MountTable, Obj, Storage, StorageError};
pub use stream::{Link, LinkContext, SeekableStream};
pub use webdav::{DavConfig, DavError, DavHandler, LockManager};
