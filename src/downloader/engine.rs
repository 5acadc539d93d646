//! 并发分片下载引擎
//!
//! 把一次逻辑范围读取 `[start, start+length)` 拆成固定大小的分片并发拉取，
//! 再按偏移顺序重新拼成一条有背压的读取流：
//!
//! - 同时在途的分片最多 `concurrency` 个
//! - 第 i 片被消费者取走之后才会启动第 i+concurrency 片（滑动窗口）
//! - 网络错误在分片内重试，HTTP 状态码错误直接上抛
//! - 取消令牌触发后，所有在途分片立即中止，阻塞中的读取返回错误

use super::chunk::{Chunk, ChunkManager, DEFAULT_CHUNK_SIZE};
use crate::common::{BufferPool, PooledBuffer};
use crate::stream::{BoxReader, HttpRange, RangeReader, StreamError};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::header::HeaderMap;
use reqwest::Client;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

/// 最大重试次数
pub const MAX_RETRIES: u32 = 3;

/// 下载引擎参数
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// 同时在途的分片数
    pub concurrency: usize,
    /// 分片大小
    pub part_size: u64,
    /// 单个分片的最大重试次数
    pub max_retries: u32,
    /// 单个分片的请求超时（与整体取消相互独立）
    pub part_timeout: Duration,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            part_size: DEFAULT_CHUNK_SIZE,
            max_retries: MAX_RETRIES,
            part_timeout: Duration::from_secs(60),
        }
    }
}

/// 单个分片的拉取方式
#[async_trait]
pub trait PartFetcher: Send + Sync {
    async fn fetch(&self, chunk: &Chunk, buf: PooledBuffer) -> Result<PooledBuffer, StreamError>;
}

/// 基于 HTTP Range GET 的分片拉取
#[derive(Debug, Clone)]
pub struct HttpPartFetcher {
    client: Client,
    url: String,
    headers: HeaderMap,
    timeout: Duration,
}

impl HttpPartFetcher {
    pub fn new(client: Client, url: impl Into<String>, headers: HeaderMap, timeout: Duration) -> Self {
        Self {
            client,
            url: url.into(),
            headers,
            timeout,
        }
    }
}

#[async_trait]
impl PartFetcher for HttpPartFetcher {
    async fn fetch(&self, chunk: &Chunk, buf: PooledBuffer) -> Result<PooledBuffer, StreamError> {
        chunk
            .fetch(&self.client, &self.url, &self.headers, self.timeout, buf)
            .await
    }
}

/// 并发分片下载器
pub struct ChunkDownloader {
    fetcher: Arc<dyn PartFetcher>,
    pool: Arc<BufferPool>,
    config: DownloaderConfig,
    /// 资源总大小，负数表示未知
    size: i64,
    cancel: CancellationToken,
}

impl ChunkDownloader {
    pub fn new(
        fetcher: Arc<dyn PartFetcher>,
        pool: Arc<BufferPool>,
        config: DownloaderConfig,
        size: i64,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            fetcher,
            pool,
            config,
            size,
            cancel,
        }
    }

    /// 下载 `[start, start+length)`，返回按偏移顺序输出的读取流
    pub fn download(&self, start: u64, length: u64) -> ChunkedReader {
        let manager = ChunkManager::new(start, length, self.config.part_size);
        let concurrency = self.config.concurrency.max(1);
        debug!(
            "开始分片下载: start={}, length={}, 分片数={}, 并发={}",
            start,
            length,
            manager.chunk_count(),
            concurrency
        );

        // 每次下载使用独立的子令牌，读取流 Drop 时中止剩余分片
        let cancel = self.cancel.child_token();
        let fetcher = Arc::clone(&self.fetcher);
        let pool = Arc::clone(&self.pool);
        let max_retries = self.config.max_retries;
        let task_cancel = cancel.clone();

        let parts = stream::iter(manager.into_chunks())
            .map(move |chunk| {
                let fetcher = Arc::clone(&fetcher);
                let pool = Arc::clone(&pool);
                let cancel = task_cancel.clone();
                tokio::spawn(async move {
                    fetch_with_retry(fetcher.as_ref(), &pool, &chunk, max_retries, &cancel).await
                })
            })
            .buffered(concurrency)
            .map(|joined| match joined {
                Ok(result) => result,
                Err(e) => Err(StreamError::Io(io::Error::new(io::ErrorKind::Other, e))),
            })
            .boxed();

        ChunkedReader::new(parts, cancel)
    }
}

#[async_trait]
impl RangeReader for ChunkDownloader {
    async fn range_read(&self, range: HttpRange) -> Result<BoxReader, StreamError> {
        range.validate()?;
        if self.size < 0 && range.length < 0 {
            // 分片需要确定的终点
            return Err(StreamError::InvalidStream);
        }
        let range = range.clamp(self.size);
        Ok(Box::pin(self.download(range.start as u64, range.length as u64)))
    }

    fn observed_size(&self) -> Option<i64> {
        (self.size >= 0).then_some(self.size)
    }
}

/// 带重试的分片拉取，每次等待都响应取消
async fn fetch_with_retry(
    fetcher: &dyn PartFetcher,
    pool: &Arc<BufferPool>,
    chunk: &Chunk,
    max_retries: u32,
    cancel: &CancellationToken,
) -> Result<PooledBuffer, StreamError> {
    let mut retries = 0;
    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(StreamError::Cancelled),
            r = fetcher.fetch(chunk, pool.checkout()) => r,
        };

        match result {
            Ok(buf) => return Ok(buf),
            Err(e) if e.is_retryable() && retries < max_retries => {
                retries += 1;
                warn!(
                    "分片 #{} 下载失败，第 {}/{} 次重试: {}",
                    chunk.index, retries, max_retries, e
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(StreamError::Cancelled),
                    _ = tokio::time::sleep(Duration::from_millis(100 * retries as u64)) => {}
                }
            }
            Err(e) => return Err(e),
        }
    }
}

/// 按顺序拼接分片的读取流
pub struct ChunkedReader {
    parts: BoxStream<'static, Result<PooledBuffer, StreamError>>,
    current: Option<PooledBuffer>,
    offset: usize,
    cancel: CancellationToken,
    _guard: DropGuard,
}

impl ChunkedReader {
    fn new(parts: BoxStream<'static, Result<PooledBuffer, StreamError>>, cancel: CancellationToken) -> Self {
        Self {
            parts,
            current: None,
            offset: 0,
            _guard: cancel.clone().drop_guard(),
            cancel,
        }
    }
}

impl AsyncRead for ChunkedReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if let Some(current) = &this.current {
                if this.offset < current.len() {
                    let n = (current.len() - this.offset).min(buf.remaining());
                    buf.put_slice(&current[this.offset..this.offset + n]);
                    this.offset += n;
                    return Poll::Ready(Ok(()));
                }
                // 当前分片消费完毕，缓冲区归还到池中
                this.current = None;
            }

            if this.cancel.is_cancelled() {
                return Poll::Ready(Err(StreamError::Cancelled.into()));
            }

            match this.parts.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(part))) => {
                    this.current = Some(part);
                    this.offset = 0;
                }
                Poll::Ready(Some(Err(e))) => {
                    this.cancel.cancel();
                    return Poll::Ready(Err(e.into()));
                }
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::http::tests::spawn_upstream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncReadExt;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    /// 分片越靠前完成得越晚的模拟上游
    struct ReverseFetcher {
        data: Vec<u8>,
        parts: usize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    #[async_trait]
    impl PartFetcher for ReverseFetcher {
        async fn fetch(&self, chunk: &Chunk, mut buf: PooledBuffer) -> Result<PooledBuffer, StreamError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            let delay = (self.parts - chunk.index) as u64 * 5;
            tokio::time::sleep(Duration::from_millis(delay)).await;
            buf.extend_from_slice(&self.data[chunk.range.start as usize..chunk.range.end as usize]);

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(buf)
        }
    }

    /// 前几次失败的模拟上游
    struct FlakyFetcher {
        failures: AtomicUsize,
        status: Option<u16>,
    }

    #[async_trait]
    impl PartFetcher for FlakyFetcher {
        async fn fetch(&self, chunk: &Chunk, mut buf: PooledBuffer) -> Result<PooledBuffer, StreamError> {
            if let Some(status) = self.status {
                return Err(StreamError::HttpStatus(status));
            }
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(StreamError::StreamIncomplete {
                    expected: chunk.size(),
                    actual: 0,
                });
            }
            buf.resize(chunk.size() as usize, 7);
            Ok(buf)
        }
    }

    /// 永远不完成的上游
    struct StalledFetcher;

    #[async_trait]
    impl PartFetcher for StalledFetcher {
        async fn fetch(&self, _chunk: &Chunk, _buf: PooledBuffer) -> Result<PooledBuffer, StreamError> {
            futures::future::pending().await
        }
    }

    fn config(concurrency: usize, part_size: u64) -> DownloaderConfig {
        DownloaderConfig {
            concurrency,
            part_size,
            max_retries: 3,
            part_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_reverse_completion_delivered_in_order() {
        let data = sample(1000);
        let fetcher = Arc::new(ReverseFetcher {
            data: data.clone(),
            parts: 10,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        });
        let downloader = ChunkDownloader::new(
            fetcher.clone(),
            BufferPool::new(100, 4),
            config(3, 100),
            1000,
            CancellationToken::new(),
        );

        let mut out = Vec::new();
        downloader.download(0, 1000).read_to_end(&mut out).await.unwrap();
        assert_eq!(out, data);
        assert!(fetcher.max_in_flight.load(Ordering::SeqCst) <= 3);
        assert!(fetcher.max_in_flight.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_range_read_clamps_to_size() {
        let data = sample(1000);
        let fetcher = Arc::new(ReverseFetcher {
            data: data.clone(),
            parts: 10,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        });
        let downloader = ChunkDownloader::new(
            fetcher,
            BufferPool::new(100, 4),
            config(3, 64),
            1000,
            CancellationToken::new(),
        );

        let mut out = Vec::new();
        let mut r = downloader.range_read(HttpRange::new(900, 500)).await.unwrap();
        r.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, &data[900..]);

        let result = downloader.range_read(HttpRange::new(-5, 10)).await;
        assert!(matches!(result, Err(StreamError::InvalidRange { .. })));
    }

    #[tokio::test]
    async fn test_network_errors_retried() {
        let fetcher = Arc::new(FlakyFetcher {
            failures: AtomicUsize::new(2),
            status: None,
        });
        let downloader = ChunkDownloader::new(
            fetcher,
            BufferPool::new(16, 2),
            config(2, 10),
            30,
            CancellationToken::new(),
        );
        let mut out = Vec::new();
        downloader.download(0, 30).read_to_end(&mut out).await.unwrap();
        assert_eq!(out, vec![7u8; 30]);
    }

    #[tokio::test]
    async fn test_http_status_not_retried() {
        let fetcher = Arc::new(FlakyFetcher {
            failures: AtomicUsize::new(0),
            status: Some(403),
        });
        let downloader = ChunkDownloader::new(
            fetcher,
            BufferPool::new(16, 2),
            config(2, 10),
            30,
            CancellationToken::new(),
        );
        let mut out = Vec::new();
        let err = downloader
            .download(0, 30)
            .read_to_end(&mut out)
            .await
            .unwrap_err();
        assert_eq!(StreamError::from_io(err).status_code(), Some(403));
    }

    #[tokio::test]
    async fn test_cancel_unblocks_reader() {
        let cancel = CancellationToken::new();
        let downloader = ChunkDownloader::new(
            Arc::new(StalledFetcher),
            BufferPool::new(16, 2),
            config(2, 10),
            30,
            cancel.clone(),
        );
        let mut reader = downloader.download(0, 30);

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let mut out = Vec::new();
        let err = tokio::time::timeout(Duration::from_secs(5), reader.read_to_end(&mut out))
            .await
            .expect("取消后读取应立即返回")
            .unwrap_err();
        assert!(matches!(StreamError::from_io(err), StreamError::Cancelled));
        canceller.await.unwrap();
    }

    #[tokio::test]
    async fn test_http_chunked_download() {
        let data = sample(50_000);
        let base = spawn_upstream(data.clone(), true).await;
        let fetcher = Arc::new(HttpPartFetcher::new(
            Client::new(),
            format!("{}/file", base),
            HeaderMap::new(),
            Duration::from_secs(5),
        ));
        let downloader = ChunkDownloader::new(
            fetcher,
            BufferPool::new(4096, 4),
            config(4, 4096),
            data.len() as i64,
            CancellationToken::new(),
        );

        let mut out = Vec::new();
        let mut r = downloader.range_read(HttpRange::new(1234, 20_000)).await.unwrap();
        r.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, &data[1234..21_234]);
    }
}
