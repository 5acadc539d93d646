//! 单次 Range GET 的远程读取器

use super::range::parse_content_range;
use super::reader::{BoxReader, RangeReader, SkipLimitReader};
use super::{HttpRange, StreamError};
use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::header::{HeaderMap, CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode};
use std::io;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

/// 远程 URL 的范围读取器（每次 range_read 发起一次 GET）
#[derive(Debug)]
pub struct HttpRangeReader {
    client: Client,
    url: String,
    headers: HeaderMap,
    /// 从响应中观察到的资源总大小，-1 表示尚未观察到
    observed: AtomicI64,
}

impl HttpRangeReader {
    pub fn new(client: Client, url: impl Into<String>, headers: HeaderMap) -> Self {
        Self {
            client,
            url: url.into(),
            headers,
            observed: AtomicI64::new(-1),
        }
    }
}

#[async_trait]
impl RangeReader for HttpRangeReader {
    async fn range_read(&self, range: HttpRange) -> Result<BoxReader, StreamError> {
        range.validate()?;

        let mut request = self.client.get(&self.url).headers(self.headers.clone());
        if !range.is_full() {
            request = request.header(RANGE, range.header_value());
        }

        let resp = request.send().await?;
        let status = resp.status();
        if status.is_client_error() || status.is_server_error() {
            return Err(StreamError::HttpStatus(status.as_u16()));
        }

        let content_range = resp
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range);

        // 修正资源总大小
        let total = match (status, content_range) {
            (StatusCode::PARTIAL_CONTENT, Some(cr)) => cr.total,
            (StatusCode::OK, _) => resp.content_length().map(|len| len as i64),
            _ => None,
        };
        if let Some(total) = total {
            self.observed.store(total, Ordering::SeqCst);
        }

        debug!(
            "Range GET {}: {} -> status={}, content_range={:?}",
            self.url,
            range.header_value(),
            status,
            content_range
        );

        let body = StreamReader::new(Box::pin(
            resp.bytes_stream()
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e)),
        ));
        let limit = range.end().map(|end| (end - range.start) as u64);

        // 上游承诺的末尾（不含），据此发现被截断的响应体
        let promised_end = match (status, content_range) {
            (StatusCode::PARTIAL_CONTENT, Some(cr)) => Some(cr.end + 1),
            _ => total,
        };
        let expected = promised_end.map(|end| {
            let available = (end - range.start).max(0) as u64;
            limit.map_or(available, |limit| limit.min(available))
        });

        if range.is_full() {
            return Ok(Box::pin(SkipLimitReader::new(body, 0, None).with_expected(expected)));
        }

        // 上游忽略了 Range：200 整体返回，或 206 起点不一致
        let skip = match (status, content_range) {
            (StatusCode::PARTIAL_CONTENT, Some(cr)) if cr.start == range.start => 0,
            (StatusCode::PARTIAL_CONTENT, Some(cr)) if cr.start < range.start => {
                (range.start - cr.start) as u64
            }
            (StatusCode::PARTIAL_CONTENT, Some(cr)) => {
                // 起点在请求之后，缺失的字节无法补回
                warn!(
                    "上游返回的 Content-Range 起点 {} 晚于请求起点 {}: {}",
                    cr.start, range.start, self.url
                );
                return Err(StreamError::InvalidRange {
                    start: range.start,
                    length: range.length,
                });
            }
            (StatusCode::PARTIAL_CONTENT, None) => 0,
            _ => range.start as u64,
        };

        if skip > 0 || status != StatusCode::PARTIAL_CONTENT {
            warn!(
                "⚠️ 上游不支持 Range 请求（status={}），退化为客户端跳过 {} 字节，性能较差: {}",
                status, skip, self.url
            );
        }

        Ok(Box::pin(SkipLimitReader::new(body, skip, limit).with_expected(expected)))
    }

    fn observed_size(&self) -> Option<i64> {
        let size = self.observed.load(Ordering::SeqCst);
        (size >= 0).then_some(size)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::{HeaderMap as AxumHeaderMap, StatusCode as AxumStatus};
    use axum::response::{IntoResponse, Response};
    use axum::routing::get;
    use axum::Router;
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;

    /// 测试用上游服务器
    #[derive(Clone)]
    pub(crate) struct Upstream {
        pub data: Arc<Vec<u8>>,
        /// 是否支持 Range
        pub honor_range: bool,
    }

    async fn serve_file(State(up): State<Upstream>, headers: AxumHeaderMap) -> Response {
        let size = up.data.len() as i64;
        let range = headers
            .get("range")
            .and_then(|v| v.to_str().ok())
            .map(|v| crate::stream::parse_range(v, size));
        match (up.honor_range, range) {
            (true, Some(Ok(ranges))) if ranges.len() == 1 => {
                let r = ranges[0];
                let body = up.data[r.start as usize..(r.start + r.length) as usize].to_vec();
                (
                    AxumStatus::PARTIAL_CONTENT,
                    [("content-range", r.content_range(size))],
                    body,
                )
                    .into_response()
            }
            (true, Some(Err(_))) => AxumStatus::RANGE_NOT_SATISFIABLE.into_response(),
            _ => (AxumStatus::OK, up.data.to_vec()).into_response(),
        }
    }

    /// 声明完整的 Content-Range，但响应体只给出一半后就结束
    async fn serve_truncated(State(up): State<Upstream>, headers: AxumHeaderMap) -> Response {
        let size = up.data.len() as i64;
        let range = headers
            .get("range")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| crate::stream::parse_range(v, size).ok())
            .and_then(|ranges| ranges.first().copied())
            .unwrap_or_else(|| HttpRange::new(0, size));
        let start = range.start as usize;
        let half = up.data[start..start + range.length as usize / 2].to_vec();
        let body = axum::body::Body::from_stream(futures::stream::once(async move {
            Ok::<_, io::Error>(bytes::Bytes::from(half))
        }));
        (
            AxumStatus::PARTIAL_CONTENT,
            [("content-range", range.content_range(size))],
            body,
        )
            .into_response()
    }

    /// 启动上游服务器，返回 URL
    pub(crate) async fn spawn_upstream(data: Vec<u8>, honor_range: bool) -> String {
        let state = Upstream {
            data: Arc::new(data),
            honor_range,
        };
        let app = Router::new()
            .route("/file", get(serve_file))
            .route("/missing", get(|| async { AxumStatus::NOT_FOUND }))
            .route("/truncated", get(serve_truncated))
            .with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_range_read_honored() {
        let data = sample(10_000);
        let base = spawn_upstream(data.clone(), true).await;
        let reader = HttpRangeReader::new(Client::new(), format!("{}/file", base), HeaderMap::new());

        let mut out = Vec::new();
        let mut r = reader.range_read(HttpRange::new(100, 500)).await.unwrap();
        r.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, &data[100..600]);
        assert_eq!(reader.observed_size(), Some(10_000));
    }

    #[tokio::test]
    async fn test_range_read_degraded_server() {
        let data = sample(10_000);
        let base = spawn_upstream(data.clone(), false).await;
        let reader = HttpRangeReader::new(Client::new(), format!("{}/file", base), HeaderMap::new());

        let mut out = Vec::new();
        let mut r = reader.range_read(HttpRange::new(9_000, 2_000)).await.unwrap();
        r.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, &data[9_000..]);
    }

    #[tokio::test]
    async fn test_range_read_status_propagated() {
        let base = spawn_upstream(sample(10), true).await;
        let reader = HttpRangeReader::new(Client::new(), format!("{}/missing", base), HeaderMap::new());
        let err = reader.range_read(HttpRange::new(0, 5)).await.err().unwrap();
        assert_eq!(err.status_code(), Some(404));
    }

    #[tokio::test]
    async fn test_range_read_truncated_body_is_incomplete() {
        let data = sample(10_000);
        let base = spawn_upstream(data.clone(), true).await;
        let reader = HttpRangeReader::new(Client::new(), format!("{}/truncated", base), HeaderMap::new());

        let mut out = Vec::new();
        let mut r = reader.range_read(HttpRange::new(1_000, 4_000)).await.unwrap();
        let err = r.read_to_end(&mut out).await.unwrap_err();
        match StreamError::from_io(err) {
            StreamError::StreamIncomplete { expected, actual } => {
                assert_eq!(expected, 4_000);
                assert_eq!(actual, 2_000);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_range_read_degraded_start_past_end() {
        // 上游忽略 Range 且数据比请求起点还短
        let base = spawn_upstream(sample(100), false).await;
        let reader = HttpRangeReader::new(Client::new(), format!("{}/file", base), HeaderMap::new());

        let mut out = Vec::new();
        let mut r = reader.range_read(HttpRange::new(500, 10)).await.unwrap();
        let err = r.read_to_end(&mut out).await.unwrap_err();
        assert!(matches!(StreamError::from_io(err), StreamError::StreamIncomplete { .. }));
        assert!(out.is_empty());
    }
}
