//! 缓冲区池
//!
//! 分片下载与流复制共用的缓冲区池，采用"借出 / 归还"模型：
//! - `checkout()` 借出一块缓冲区，返回 RAII 守卫 [`PooledBuffer`]
//! - 守卫 Drop 时自动清空并归还，任何返回路径（包括错误、取消）都不会泄漏
//!
//! 借出的缓冲区只能在借出它的那次操作内使用，不要跨操作持有。

use bytes::BytesMut;
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tracing::debug;

/// 复制操作默认缓冲区大小: 256KB
pub const DEFAULT_COPY_BUFFER_SIZE: usize = 256 * 1024;

/// 缓冲区池
#[derive(Debug)]
pub struct BufferPool {
    /// 空闲缓冲区
    idle: Mutex<Vec<BytesMut>>,
    /// 新建缓冲区的初始容量
    buf_capacity: usize,
    /// 最多保留的空闲缓冲区数量，超出的直接释放
    max_idle: usize,
}

impl BufferPool {
    /// 创建新的缓冲区池
    pub fn new(buf_capacity: usize, max_idle: usize) -> Arc<Self> {
        Arc::new(Self {
            idle: Mutex::new(Vec::with_capacity(max_idle)),
            buf_capacity,
            max_idle,
        })
    }

    /// 借出一块缓冲区（长度为 0，容量至少为 `buf_capacity`）
    pub fn checkout(self: &Arc<Self>) -> PooledBuffer {
        let buf = self
            .idle
            .lock()
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.buf_capacity));

        PooledBuffer {
            buf,
            pool: Arc::clone(self),
        }
    }

    /// 缓冲区容量
    pub fn buf_capacity(&self) -> usize {
        self.buf_capacity
    }

    /// 当前空闲缓冲区数量
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    fn give_back(&self, mut buf: BytesMut) {
        buf.clear();
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(buf);
        } else {
            debug!("缓冲区池已满（{}），丢弃归还的缓冲区", self.max_idle);
        }
    }
}

/// 借出的缓冲区（Drop 时自动归还）
#[derive(Debug)]
pub struct PooledBuffer {
    buf: BytesMut,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.give_back(std::mem::take(&mut self.buf));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkout_and_return() {
        let pool = BufferPool::new(1024, 2);
        assert_eq!(pool.idle_count(), 0);

        {
            let mut buf = pool.checkout();
            buf.extend_from_slice(b"hello");
            assert_eq!(&buf[..], b"hello");
            assert!(buf.capacity() >= 1024);
        }

        // 守卫释放后归还，且内容已清空
        assert_eq!(pool.idle_count(), 1);
        let buf = pool.checkout();
        assert!(buf.is_empty());
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn test_max_idle_limit() {
        let pool = BufferPool::new(16, 2);
        let bufs: Vec<_> = (0..4).map(|_| pool.checkout()).collect();
        drop(bufs);
        assert_eq!(pool.idle_count(), 2);
    }

    #[test]
    fn test_concurrent_checkout_no_sharing() {
        let pool = BufferPool::new(16, 8);
        let handles: Vec<_> = (0..8u8)
            .map(|i| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    let mut buf = pool.checkout();
                    buf.extend_from_slice(&[i; 16]);
                    std::thread::yield_now();
                    assert!(buf.iter().all(|&b| b == i));
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(pool.idle_count() <= 8);
    }
}
