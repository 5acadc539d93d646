//! 可随机访问的数据流
//!
//! [`Link`] 描述存储后端给出的数据来源，[`SeekableStream`] 在其之上提供
//! 顺序读取（`AsyncRead`）与任意范围读取（[`SeekableStream::range_read`]）。
//!
//! 只能顺序读取的源按"预读 → 内存缓冲 → 临时文件"逐级升级：
//! - 请求窗口落在已有预读缓冲区内：直接切片
//! - 窗口末尾不超过预读上限（默认 10MB）：把预读缓冲区扩展到窗口末尾
//! - 否则把整个流物化到临时文件，之后所有读取都走临时文件
//!
//! 同一时刻只有一个数据源处于活动状态；临时文件随流一起释放。
//! 流只供单个消费者使用，所有读取接口都需要 `&mut self`。

use super::http::HttpRangeReader;
use super::progress::{ProgressCallback, ProgressTracker};
use super::reader::{read_at, read_full, BoxReader, FileRangeReader, RangeReader};
use super::{HttpRange, StreamError};
use crate::common::BufferPool;
use crate::downloader::{ChunkDownloader, DownloaderConfig, HttpPartFetcher};
use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use reqwest::header::HeaderMap;
use reqwest::Client;
use std::fmt;
use std::fs::File;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWriteExt, ReadBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// 预读缓冲区上限: 10MB
pub const DEFAULT_PEEK_LIMIT: usize = 10 * 1024 * 1024;

/// 并发分片提示
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyHint {
    pub concurrency: usize,
    pub part_size: u64,
}

/// 存储后端为文件给出的数据来源
#[derive(Clone)]
pub enum Link {
    /// 已打开的本地文件
    File(Arc<File>),
    /// 远程 URL
    Url {
        url: String,
        headers: HeaderMap,
        /// 存在时使用并发分片下载
        concurrency: Option<ConcurrencyHint>,
    },
    /// 调用方提供的范围读取器
    Custom(Arc<dyn RangeReader>),
}

impl Link {
    /// 不带额外请求头的 URL
    pub fn url(url: impl Into<String>) -> Self {
        Link::Url {
            url: url.into(),
            headers: HeaderMap::new(),
            concurrency: None,
        }
    }

    /// 可以直接重定向给客户端的 URL
    pub fn redirect_url(&self) -> Option<&str> {
        match self {
            Link::Url { url, .. } => Some(url),
            _ => None,
        }
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Link::File(file) => f.debug_tuple("File").field(file).finish(),
            Link::Url {
                url, concurrency, ..
            } => f
                .debug_struct("Url")
                .field("url", url)
                .field("concurrency", concurrency)
                .finish(),
            Link::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// 把 Link 转换为 RangeReader 所需的共享资源
#[derive(Debug, Clone)]
pub struct LinkContext {
    pub client: Client,
    pub pool: Arc<BufferPool>,
    pub downloader: DownloaderConfig,
    /// 请求级取消令牌
    pub cancel: CancellationToken,
}

impl LinkContext {
    pub fn new(
        client: Client,
        pool: Arc<BufferPool>,
        downloader: DownloaderConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            pool,
            downloader,
            cancel,
        }
    }

    /// 派生一个请求级上下文（取消令牌为子令牌）
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            ..self.clone()
        }
    }

    /// 为 Link 构造 RangeReader
    pub fn range_reader(&self, link: &Link, size: i64) -> Result<Arc<dyn RangeReader>, StreamError> {
        match link {
            Link::File(file) => {
                let size = if size >= 0 {
                    size
                } else {
                    file.metadata()?.len() as i64
                };
                Ok(Arc::new(FileRangeReader::new(Arc::clone(file), size)))
            }
            Link::Url {
                url,
                headers,
                concurrency: Some(hint),
            } if size > 0 => {
                let config = DownloaderConfig {
                    concurrency: hint.concurrency,
                    part_size: hint.part_size,
                    ..self.downloader.clone()
                };
                let fetcher = HttpPartFetcher::new(
                    self.client.clone(),
                    url.clone(),
                    headers.clone(),
                    config.part_timeout,
                );
                Ok(Arc::new(ChunkDownloader::new(
                    Arc::new(fetcher),
                    Arc::clone(&self.pool),
                    config,
                    size,
                    self.cancel.clone(),
                )))
            }
            Link::Url { url, headers, concurrency } => {
                if concurrency.is_some() {
                    debug!("文件大小未知，不使用分片下载: {}", url);
                }
                Ok(Arc::new(HttpRangeReader::new(
                    self.client.clone(),
                    url.clone(),
                    headers.clone(),
                )))
            }
            Link::Custom(reader) => Ok(Arc::clone(reader)),
        }
    }
}

/// 当前活动的数据源
enum Source {
    /// 本地文件
    File(FileRangeReader, Arc<File>),
    /// 物化后的临时文件
    Temp(FileRangeReader, Arc<File>),
    /// 具备范围读取能力的源
    Range(Arc<dyn RangeReader>),
    /// 只能顺序读取的源，位置位于预读缓冲区末尾之后
    Reader(BoxReader),
}

/// 可随机访问的数据流
pub struct SeekableStream {
    name: String,
    /// 声明大小，非正数时会被实际传输修正
    size: i64,
    source: Source,
    /// 流开头的预读缓冲区 `[0, peek.len())`
    peek: BytesMut,
    peek_limit: usize,
    /// 顺序读取位置
    pos: u64,
    /// Range 源上懒打开的顺序读取器
    seq: Option<BoxReader>,
    opening: Option<BoxFuture<'static, Result<BoxReader, StreamError>>>,
    temp_dir: Option<PathBuf>,
    progress: Option<ProgressTracker>,
    /// 请求级取消令牌，来自 LinkContext 时与分片下载共享
    cancel: CancellationToken,
}

impl SeekableStream {
    fn with_source(name: impl Into<String>, size: i64, source: Source) -> Self {
        Self {
            name: name.into(),
            size,
            source,
            peek: BytesMut::new(),
            peek_limit: DEFAULT_PEEK_LIMIT,
            pos: 0,
            seq: None,
            opening: None,
            temp_dir: None,
            progress: None,
            cancel: CancellationToken::new(),
        }
    }

    /// 由存储后端给出的 Link 构造
    pub fn from_link(
        name: impl Into<String>,
        size: i64,
        link: &Link,
        ctx: &LinkContext,
    ) -> Result<Self, StreamError> {
        match link {
            Link::File(file) => {
                let size = if size > 0 {
                    size
                } else {
                    file.metadata()?.len() as i64
                };
                let reader = FileRangeReader::new(Arc::clone(file), size);
                Ok(Self::with_source(name, size, Source::File(reader, Arc::clone(file))))
            }
            _ => {
                let reader = ctx.range_reader(link, size)?;
                let mut stream = Self::with_source(name, size, Source::Range(reader));
                stream.cancel = ctx.cancel.clone();
                Ok(stream)
            }
        }
    }

    pub fn from_range_reader(name: impl Into<String>, size: i64, reader: Arc<dyn RangeReader>) -> Self {
        Self::with_source(name, size, Source::Range(reader))
    }

    /// 只能顺序读取的流（例如上传的请求体）
    pub fn from_reader(name: impl Into<String>, size: i64, reader: BoxReader) -> Self {
        Self::with_source(name, size, Source::Reader(reader))
    }

    pub fn with_peek_limit(mut self, limit: usize) -> Self {
        self.peek_limit = limit;
        self
    }

    /// 临时文件所在目录，None 使用系统临时目录
    pub fn with_temp_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.temp_dir = dir;
        self
    }

    /// 顺序读取时上报进度
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(ProgressTracker::new(self.size, callback));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 取消后，基于该流的分片下载立即停止
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// 当前已知大小，负数表示未知
    pub fn size(&self) -> i64 {
        self.size
    }

    /// 顺序读取位置
    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn is_materialized(&self) -> bool {
        matches!(self.source, Source::Temp(..))
    }

    fn correct_size(&mut self, observed: Option<i64>) {
        if self.size <= 0 {
            if let Some(observed) = observed {
                debug!("修正流 {} 的大小: {} -> {}", self.name, self.size, observed);
                self.size = observed;
                if let Some(progress) = &mut self.progress {
                    progress.set_total(observed);
                }
            }
        }
    }

    /// 读取 `range` 覆盖的字节，返回恰好 `min(length, size-start)` 个字节
    pub async fn range_read(&mut self, range: HttpRange) -> Result<BoxReader, StreamError> {
        range.validate()?;
        let range = range.clamp(self.size);

        if matches!(self.source, Source::Reader(_)) {
            return self.range_read_from_reader(range).await;
        }
        let reader: Arc<dyn RangeReader> = match &self.source {
            Source::File(reader, _) | Source::Temp(reader, _) => Arc::new(reader.clone()),
            Source::Range(reader) => Arc::clone(reader),
            Source::Reader(_) => return Err(StreamError::InvalidStream),
        };
        let body = reader.range_read(range).await?;
        self.correct_size(reader.observed_size());
        Ok(body)
    }

    async fn range_read_from_reader(&mut self, range: HttpRange) -> Result<BoxReader, StreamError> {
        if let Some(end) = range.end() {
            let end = end as usize;
            if end <= self.peek.len() {
                return Ok(self.peek_slice(range.start as usize, end));
            }
            if end <= self.peek_limit {
                self.fill_peek(end).await?;
                let end = end.min(self.peek.len());
                return Ok(self.peek_slice(range.start as usize, end));
            }
        }

        debug!(
            "请求范围 {} 超出预读上限 {}，物化流 {}",
            range.header_value(),
            self.peek_limit,
            self.name
        );
        self.cache_full_to_temp().await?;
        let reader = match &self.source {
            Source::Temp(reader, _) => reader.clone(),
            _ => return Err(StreamError::InvalidStream),
        };
        reader.range_read(range.clamp(self.size)).await
    }

    fn peek_slice(&self, start: usize, end: usize) -> BoxReader {
        let start = start.min(end);
        let bytes = Bytes::copy_from_slice(&self.peek[start..end]);
        Box::pin(io::Cursor::new(bytes))
    }

    /// 把预读缓冲区扩展到 `target` 字节（或流末尾）
    async fn fill_peek(&mut self, target: usize) -> Result<(), StreamError> {
        if self.pos > self.peek.len() as u64 {
            return Err(StreamError::AlreadyConsumed { consumed: self.pos });
        }
        let Source::Reader(reader) = &mut self.source else {
            return Err(StreamError::InvalidStream);
        };

        let old = self.peek.len();
        self.peek.resize(target, 0);
        let n = read_full(reader, &mut self.peek[old..]).await?;
        self.peek.truncate(old + n);

        if self.peek.len() < target {
            // 提前到达末尾
            let actual = self.peek.len() as i64;
            if self.size > 0 && actual < self.size {
                return Err(StreamError::StreamIncomplete {
                    expected: self.size as u64,
                    actual: actual as u64,
                });
            }
            self.correct_size(Some(actual));
        }
        Ok(())
    }

    /// 把整个流物化到临时文件，返回文件句柄
    ///
    /// 重复调用返回同一个句柄；本地文件直接返回原句柄
    pub async fn cache_full_to_temp(&mut self) -> Result<Arc<File>, StreamError> {
        if let Source::File(_, file) | Source::Temp(_, file) = &self.source {
            return Ok(Arc::clone(file));
        }

        let temp = match &self.temp_dir {
            Some(dir) => tempfile::tempfile_in(dir)?,
            None => tempfile::tempfile()?,
        };
        let mut writer = tokio::fs::File::from_std(temp.try_clone()?);

        let (written, observed) = match &mut self.source {
            Source::Reader(reader) => {
                if self.pos > self.peek.len() as u64 {
                    return Err(StreamError::AlreadyConsumed { consumed: self.pos });
                }
                writer.write_all(&self.peek).await?;
                let tail = tokio::io::copy(reader, &mut writer).await?;
                (self.peek.len() as u64 + tail, None)
            }
            Source::Range(reader) => {
                let mut body = reader.range_read(HttpRange::full().clamp(self.size)).await?;
                let n = tokio::io::copy(&mut body, &mut writer).await?;
                (n, reader.observed_size())
            }
            _ => return Err(StreamError::InvalidStream),
        };
        writer.flush().await?;

        self.correct_size(observed);
        if self.size > 0 && written < self.size as u64 {
            return Err(StreamError::StreamIncomplete {
                expected: self.size as u64,
                actual: written,
            });
        }
        self.correct_size(Some(written as i64));

        info!("流 {} 已物化到临时文件: {} bytes", self.name, written);
        let file = Arc::new(temp);
        self.source = Source::Temp(FileRangeReader::new(Arc::clone(&file), self.size), Arc::clone(&file));
        self.peek = BytesMut::new();
        self.seq = None;
        self.opening = None;
        Ok(file)
    }

    fn poll_read_source(&mut self, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match &mut self.source {
            Source::File(_, file) | Source::Temp(_, file) => {
                let end = if self.size >= 0 { self.size as u64 } else { u64::MAX };
                if self.pos >= end {
                    return Poll::Ready(Ok(()));
                }
                let want = (end - self.pos).min(buf.remaining() as u64) as usize;
                let n = read_at(file, buf.initialize_unfilled_to(want), self.pos)?;
                buf.advance(n);
                Poll::Ready(Ok(()))
            }
            Source::Reader(reader) => {
                let pos = self.pos as usize;
                if pos < self.peek.len() {
                    let n = (self.peek.len() - pos).min(buf.remaining());
                    buf.put_slice(&self.peek[pos..pos + n]);
                    return Poll::Ready(Ok(()));
                }
                reader.as_mut().poll_read(cx, buf)
            }
            Source::Range(reader) => loop {
                if let Some(seq) = self.seq.as_mut() {
                    return seq.as_mut().poll_read(cx, buf);
                }
                let opening = self.opening.get_or_insert_with(|| {
                    let reader = Arc::clone(reader);
                    let range = HttpRange::from_offset(self.pos as i64).clamp(self.size);
                    Box::pin(async move { reader.range_read(range).await })
                });
                let result = ready!(opening.as_mut().poll(cx));
                self.opening = None;
                self.seq = Some(result?);
            },
        }
    }
}

impl AsyncRead for SeekableStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let before = buf.filled().len();
        ready!(this.poll_read_source(cx, buf))?;
        let n = (buf.filled().len() - before) as u64;
        this.pos += n;

        if n == 0 {
            this.correct_size(Some(this.pos as i64));
            if let Some(progress) = &mut this.progress {
                progress.flush();
            }
        } else if let Some(progress) = &mut this.progress {
            progress.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl fmt::Debug for SeekableStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let source = match self.source {
            Source::File(..) => "file",
            Source::Temp(..) => "temp",
            Source::Range(_) => "range",
            Source::Reader(_) => "reader",
        };
        f.debug_struct("SeekableStream")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("source", &source)
            .field("peek", &self.peek.len())
            .field("pos", &self.pos)
            .finish()
    }
}
