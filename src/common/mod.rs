//! 公共模块
//!
//! 提供跨模块使用的通用组件

mod buffer_pool;

pub use buffer_pool::{BufferPool, PooledBuffer, DEFAULT_COPY_BUFFER_SIZE};
