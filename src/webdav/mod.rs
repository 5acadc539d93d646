//! WebDAV 协议层（RFC 4918）
//!
//! - [`DavHandler`]: 方法分发、锁确认、路径前缀与用户根目录处理
//! - [`LockManager`]: 内存层级锁表
//! - [`serve`]: 条件请求与范围请求
//! - [`xml`]: 请求体解析与 multistatus 输出
//! - [`MemPropertyStore`]: 死属性存储

pub mod error;
pub mod handler;
pub mod if_header;
pub mod lock;
pub mod prop;
mod propfind;
pub mod serve;
pub mod xml;

pub use error::{status_line, status_text, DavError};
pub use handler::{parse_depth, parse_timeout, DavConfig, DavHandler, Depth};
pub use if_header::{parse_if_header, Condition, IfHeader, IfList};
pub use lock::{ActiveLock, LockDetails, LockError, LockManager, LockRelease};
pub use prop::{MemPropertyStore, PropContext};
pub use serve::{serve_content, ContentMeta};
pub use xml::{PropName, Property};
