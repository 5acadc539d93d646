//! 定位读取池（RangeReadReadAtSeeker）
//!
//! 在一个 [`SeekableStream`] 上维护若干个已打开的范围读取游标，
//! 服务任意偏移的 `read_at` / `seek`：
//! - 偏移正好等于某个游标的位置：直接复用
//! - 偏移在某个游标之后且距离不超过 `max_skip`：丢弃中间字节后复用
//! - 否则打开新的范围读取并记录为新游标
//!
//! 文件开头的少量字节（格式嗅探常用）由头部缓存单独服务，不会反复回源。

use super::reader::{read_full, BoxReader};
use super::seekable::SeekableStream;
use super::{HttpRange, StreamError};
use bytes::BytesMut;
use std::io::SeekFrom;
use tokio::io::AsyncReadExt;
use tracing::debug;

/// 游标复用时最多丢弃的字节数: 1MB
pub const DEFAULT_MAX_SKIP: u64 = 1024 * 1024;
/// 头部缓存大小: 64KB
pub const DEFAULT_HEAD_CACHE: usize = 64 * 1024;
/// 最多同时保留的游标数
pub const DEFAULT_MAX_CURSORS: usize = 8;

/// 定位读取池参数
#[derive(Debug, Clone)]
pub struct SeekerOptions {
    pub max_skip: u64,
    pub head_cache: usize,
    pub max_cursors: usize,
}

impl Default for SeekerOptions {
    fn default() -> Self {
        Self {
            max_skip: DEFAULT_MAX_SKIP,
            head_cache: DEFAULT_HEAD_CACHE,
            max_cursors: DEFAULT_MAX_CURSORS,
        }
    }
}

/// 已打开的范围读取游标
struct ReaderCursor {
    reader: BoxReader,
    /// 当前偏移，-1 表示已废弃
    cur: i64,
}

/// 基于范围读取的定位读取器
pub struct RangeReadReadAtSeeker {
    stream: SeekableStream,
    options: SeekerOptions,
    cursors: Vec<ReaderCursor>,
    head: BytesMut,
    head_reader: Option<BoxReader>,
    head_eof: bool,
    pos: u64,
}

impl RangeReadReadAtSeeker {
    pub fn new(stream: SeekableStream, options: SeekerOptions) -> Self {
        Self {
            stream,
            options,
            cursors: Vec::new(),
            head: BytesMut::new(),
            head_reader: None,
            head_eof: false,
            pos: 0,
        }
    }

    /// 已知大小，负数表示未知
    pub fn size(&self) -> i64 {
        self.stream.size()
    }

    pub fn cursor_count(&self) -> usize {
        self.cursors.len()
    }

    pub fn into_inner(self) -> SeekableStream {
        self.stream
    }

    /// 从 `off` 读取，尽量读满 `buf`；返回值小于 `buf.len()` 表示到达末尾
    pub async fn read_at(&mut self, buf: &mut [u8], off: u64) -> Result<usize, StreamError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let size = self.stream.size();
        if size >= 0 && off >= size as u64 {
            return Ok(0);
        }

        let end = off + buf.len() as u64;
        if end <= self.options.head_cache as u64 {
            return self.read_head(buf, off).await;
        }

        let index = self.cursor_at(off).await?;
        let cursor = &mut self.cursors[index];
        let result = read_full(&mut cursor.reader, buf).await;
        match result {
            Ok(n) => {
                cursor.cur = if n < buf.len() { -1 } else { cursor.cur + n as i64 };
                self.cursors.retain(|c| c.cur >= 0);
                Ok(n)
            }
            Err(e) => {
                cursor.cur = -1;
                self.cursors.retain(|c| c.cur >= 0);
                Err(StreamError::from_io(e))
            }
        }
    }

    async fn read_head(&mut self, buf: &mut [u8], off: u64) -> Result<usize, StreamError> {
        let need = off as usize + buf.len();
        if self.head.len() < need && !self.head_eof {
            if self.head_reader.is_none() {
                debug!("打开头部缓存读取器: {} bytes", self.options.head_cache);
                let range = HttpRange::new(0, self.options.head_cache as i64);
                self.head_reader = Some(self.stream.range_read(range).await?);
            }
            if let Some(reader) = self.head_reader.as_mut() {
                let old = self.head.len();
                self.head.resize(need, 0);
                let n = read_full(reader, &mut self.head[old..])
                    .await
                    .map_err(StreamError::from_io)?;
                self.head.truncate(old + n);
                if self.head.len() < need {
                    self.head_eof = true;
                    self.head_reader = None;
                }
            }
        }

        let start = (off as usize).min(self.head.len());
        let end = need.min(self.head.len());
        let n = end - start;
        buf[..n].copy_from_slice(&self.head[start..end]);
        Ok(n)
    }

    /// 找到（或打开）一个位于 `off` 的游标，返回其下标
    async fn cursor_at(&mut self, off: u64) -> Result<usize, StreamError> {
        for (index, cursor) in self.cursors.iter_mut().enumerate() {
            if cursor.cur < 0 {
                continue;
            }
            let cur = cursor.cur as u64;
            if cur == off {
                debug!("复用游标: off={}", off);
                return Ok(index);
            }
            if off > cur && off - cur <= self.options.max_skip {
                let skip = off - cur;
                let skipped = tokio::io::copy(
                    &mut (&mut cursor.reader).take(skip),
                    &mut tokio::io::sink(),
                )
                .await;
                match skipped {
                    Ok(n) if n == skip => {
                        debug!("复用游标: {} -> {}，丢弃 {} bytes", cur, off, skip);
                        cursor.cur = off as i64;
                        return Ok(index);
                    }
                    _ => cursor.cur = -1,
                }
            }
        }

        self.cursors.retain(|c| c.cur >= 0);
        if self.cursors.len() >= self.options.max_cursors.max(1) {
            self.cursors.remove(0);
        }

        debug!("打开新游标: off={}", off);
        let reader = self.stream.range_read(HttpRange::from_offset(off as i64)).await?;
        self.cursors.push(ReaderCursor {
            reader,
            cur: off as i64,
        });
        Ok(self.cursors.len() - 1)
    }

    /// 从当前位置顺序读取
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, StreamError> {
        let n = self.read_at(buf, self.pos).await?;
        self.pos += n as u64;
        Ok(n)
    }

    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64, StreamError> {
        let target = match pos {
            SeekFrom::Start(n) => n as i64,
            SeekFrom::Current(delta) => self.pos as i64 + delta,
            SeekFrom::End(delta) => {
                let size = self.stream.size();
                if size < 0 {
                    return Err(StreamError::InvalidStream);
                }
                size + delta
            }
        };
        if target < 0 {
            return Err(StreamError::InvalidRange {
                start: target,
                length: 0,
            });
        }
        self.pos = target as u64;
        Ok(self.pos)
    }
}
