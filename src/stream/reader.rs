//! RangeReader 能力与基础读取适配器
//!
//! - [`RangeReader`]: "从某个偏移读取一段字节，返回可读可关闭的流"
//! - [`FileRangeReader`] / [`SectionReader`]: 本地文件的有界视图（定位读，不移动共享游标）
//! - [`SkipLimitReader`]: 客户端先跳过再截断，用于不支持 Range 的上游

use super::{HttpRange, StreamError};
use crate::common::PooledBuffer;
use async_trait::async_trait;
use std::fs::File;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

/// 装箱的异步读取流（Drop 即关闭）
pub type BoxReader = Pin<Box<dyn AsyncRead + Send>>;

/// 范围读取能力
#[async_trait]
pub trait RangeReader: Send + Sync {
    /// 读取 `range` 覆盖的字节
    async fn range_read(&self, range: HttpRange) -> Result<BoxReader, StreamError>;

    /// 实际传输中观察到的资源总大小（用于修正声明大小）
    fn observed_size(&self) -> Option<i64> {
        None
    }
}

/// 本地文件的范围读取
#[derive(Debug, Clone)]
pub struct FileRangeReader {
    file: Arc<File>,
    size: i64,
}

impl FileRangeReader {
    pub fn new(file: Arc<File>, size: i64) -> Self {
        Self { file, size }
    }
}

#[async_trait]
impl RangeReader for FileRangeReader {
    async fn range_read(&self, range: HttpRange) -> Result<BoxReader, StreamError> {
        range.validate()?;
        let range = range.clamp(self.size);
        let start = range.start as u64;
        let end = match range.end() {
            Some(end) => end as u64,
            None => u64::MAX,
        };
        Ok(Box::pin(SectionReader::new(Arc::clone(&self.file), start, end)))
    }
}

/// 文件区间读取器：`[pos, end)`，使用定位读，多个 SectionReader 可以共享同一个句柄
#[derive(Debug)]
pub struct SectionReader {
    file: Arc<File>,
    pos: u64,
    end: u64,
}

impl SectionReader {
    pub fn new(file: Arc<File>, start: u64, end: u64) -> Self {
        Self {
            file,
            pos: start,
            end,
        }
    }
}

impl AsyncRead for SectionReader {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.pos >= this.end || buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        let want = (this.end - this.pos).min(buf.remaining() as u64) as usize;
        let dst = buf.initialize_unfilled_to(want);
        match read_at(&this.file, dst, this.pos) {
            Ok(n) => {
                this.pos += n as u64;
                buf.advance(n);
                Poll::Ready(Ok(()))
            }
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

/// 定位读，不移动文件游标
#[cfg(unix)]
pub(crate) fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(windows)]
pub(crate) fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}

/// 先丢弃 `skip` 个字节，再最多读取 `limit` 个字节
///
/// 跳过阶段提前到达末尾，或交付量少于 [`with_expected`](Self::with_expected)
/// 给出的字节数时，以 [`StreamError::StreamIncomplete`] 结束读取。
pub struct SkipLimitReader<R> {
    inner: R,
    skip: u64,
    skip_total: u64,
    /// None 表示不限制
    remaining: Option<u64>,
    /// 至少应交付的字节数
    expected: Option<u64>,
    delivered: u64,
    scratch: Box<[u8]>,
}

impl<R: AsyncRead + Unpin> SkipLimitReader<R> {
    pub fn new(inner: R, skip: u64, limit: Option<u64>) -> Self {
        Self {
            inner,
            skip,
            skip_total: skip,
            remaining: limit,
            expected: None,
            delivered: 0,
            scratch: vec![0u8; if skip > 0 { 32 * 1024 } else { 0 }].into_boxed_slice(),
        }
    }

    /// 上游承诺的字节数，少于该值时报错而不是静默截断
    pub fn with_expected(mut self, expected: Option<u64>) -> Self {
        self.expected = expected;
        self
    }

    fn finish(&self) -> io::Result<()> {
        match self.expected {
            Some(expected) if self.delivered < expected => Err(StreamError::StreamIncomplete {
                expected,
                actual: self.delivered,
            }
            .into()),
            _ => Ok(()),
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for SkipLimitReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        while this.skip > 0 {
            let n = (this.skip as usize).min(this.scratch.len());
            let mut scratch = ReadBuf::new(&mut this.scratch[..n]);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut scratch))?;
            let got = scratch.filled().len();
            if got == 0 {
                // 跳过阶段就到了末尾
                return Poll::Ready(Err(StreamError::StreamIncomplete {
                    expected: this.skip_total,
                    actual: this.skip_total - this.skip,
                }
                .into()));
            }
            this.skip -= got as u64;
        }

        let want = match this.remaining {
            Some(0) => return Poll::Ready(this.finish()),
            Some(remaining) => remaining.min(buf.remaining() as u64) as usize,
            None => buf.remaining(),
        };
        if want == 0 {
            return Poll::Ready(Ok(()));
        }

        let n = {
            let mut limited = ReadBuf::new(buf.initialize_unfilled_to(want));
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut limited))?;
            limited.filled().len()
        };
        if n == 0 {
            return Poll::Ready(this.finish());
        }
        buf.advance(n);
        this.delivered += n as u64;
        if let Some(remaining) = this.remaining.as_mut() {
            *remaining -= n as u64;
        }
        Poll::Ready(Ok(()))
    }
}

/// 尽量读满 `buf`，只有到达末尾时返回的字节数才会小于 `buf.len()`
pub async fn read_full<R: AsyncRead + Unpin + ?Sized>(
    reader: &mut R,
    buf: &mut [u8],
) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// 使用池化缓冲区复制数据，返回复制的字节数
pub async fn copy_with_buffer<R, W>(
    reader: &mut R,
    writer: &mut W,
    mut buf: PooledBuffer,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let cap = buf.capacity().max(8 * 1024);
    buf.resize(cap, 0);
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf[..]).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
    }
    writer.flush().await?;
    Ok(total)
}
