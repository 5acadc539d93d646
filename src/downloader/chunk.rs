use crate::common::PooledBuffer;
use crate::stream::StreamError;
use futures::StreamExt;
use reqwest::header::{HeaderMap, RANGE};
use reqwest::{Client, StatusCode};
use std::ops::Range;
use std::time::Duration;
use tracing::debug;

/// 默认分片大小: 5MB
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// 分片信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// 分片索引
    pub index: usize,
    /// 字节范围（绝对偏移）
    pub range: Range<u64>,
}

impl Chunk {
    pub fn new(index: usize, range: Range<u64>) -> Self {
        Self { index, range }
    }

    /// 分片大小
    pub fn size(&self) -> u64 {
        self.range.end - self.range.start
    }

    /// 下载分片到借出的缓冲区
    ///
    /// 上游必须返回 206，实际字节数少于分片大小视为 `StreamIncomplete`
    pub async fn fetch(
        &self,
        client: &Client,
        url: &str,
        headers: &HeaderMap,
        timeout: Duration,
        mut buf: PooledBuffer,
    ) -> Result<PooledBuffer, StreamError> {
        debug!(
            "下载分片 #{}: bytes={}-{}, timeout={:?}",
            self.index,
            self.range.start,
            self.range.end - 1,
            timeout
        );

        let resp = client
            .get(url)
            .headers(headers.clone())
            .header(RANGE, format!("bytes={}-{}", self.range.start, self.range.end - 1))
            .timeout(timeout)
            .send()
            .await?;

        let status = resp.status();
        if status != StatusCode::PARTIAL_CONTENT {
            return Err(StreamError::HttpStatus(status.as_u16()));
        }

        buf.clear();
        buf.reserve(self.size() as usize);
        let mut stream = resp.bytes_stream();
        while let Some(data) = stream.next().await {
            let data = data?;
            let room = self.size() as usize - buf.len();
            buf.extend_from_slice(&data[..data.len().min(room)]);
        }

        if (buf.len() as u64) < self.size() {
            return Err(StreamError::StreamIncomplete {
                expected: self.size(),
                actual: buf.len() as u64,
            });
        }

        debug!("分片 #{} 下载完成，大小: {} bytes", self.index, buf.len());
        Ok(buf)
    }
}

/// 分片管理器：把 `[start, start+length)` 切成固定大小的分片
#[derive(Debug)]
pub struct ChunkManager {
    chunks: Vec<Chunk>,
    total_size: u64,
}

impl ChunkManager {
    /// 创建新的分片管理器
    pub fn new(start: u64, length: u64, chunk_size: u64) -> Self {
        let chunks = Self::calculate_chunks(start, length, chunk_size.max(1));
        debug!(
            "创建分片管理器: 起点={}, 长度={} bytes, 分片数量={}",
            start,
            length,
            chunks.len()
        );
        Self {
            chunks,
            total_size: length,
        }
    }

    /// 计算分片: 第 i 片覆盖 `[start+i*size, start+min((i+1)*size, length))`
    fn calculate_chunks(start: u64, length: u64, chunk_size: u64) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        let mut offset = 0u64;
        let mut index = 0;

        while offset < length {
            let end = std::cmp::min(offset + chunk_size, length);
            chunks.push(Chunk::new(index, start + offset..start + end));
            offset = end;
            index += 1;
        }

        chunks
    }

    /// 获取所有分片
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// 取出所有分片
    pub fn into_chunks(self) -> Vec<Chunk> {
        self.chunks
    }

    /// 获取分片数量
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// 覆盖的总字节数
    pub fn total_size(&self) -> u64 {
        self.total_size
    }
}
