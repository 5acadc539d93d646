//! 文件内容响应
//!
//! 条件请求按 RFC 7232 第 6 节的顺序求值：
//! `If-Match → If-Unmodified-Since → If-None-Match → If-Modified-Since`，
//! 然后 `If-Range` 决定是否保留 `Range`。多段范围以 `multipart/byteranges`
//! 输出，由后台任务经 [`RangeReadReadAtSeeker`] 逐段读取并通过 channel 交给响应体。
//!
//! 响应体被丢弃（客户端断开）时取消流的令牌，正在进行的上游读取随之停止。

use super::error::DavError;
use crate::storage::Obj;
use crate::stream::{
    parse_range, sum_ranges_size, HttpRange, RangeParseError, RangeReadReadAtSeeker, SeekableStream, SeekerOptions,
    StreamError,
};
use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::channel::mpsc;
use futures::{SinkExt, Stream};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::UNIX_EPOCH;
use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::io::ReaderStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

/// multipart 每次读取的块大小
const PART_BUF_SIZE: usize = 32 * 1024;

/// 响应所需的文件元数据
#[derive(Debug, Clone)]
pub struct ContentMeta {
    pub name: String,
    pub size: i64,
    /// None 表示修改时间未知
    pub modified: Option<DateTime<Utc>>,
    pub etag: Option<String>,
    pub content_type: String,
}

impl From<&Obj> for ContentMeta {
    fn from(obj: &Obj) -> Self {
        let modified = (obj.modified.timestamp() > 0).then_some(obj.modified);
        Self {
            name: obj.name.clone(),
            size: obj.size,
            modified,
            etag: Some(obj.etag()),
            content_type: mime_guess::from_path(&obj.name)
                .first_or_octet_stream()
                .to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cond {
    None,
    True,
    False,
}

/// 取出开头的一个 ETag，返回 (etag, 剩余部分)
fn scan_etag(s: &str) -> Option<(&str, &str)> {
    let s = s.trim();
    let start = if s.starts_with("W/") { 2 } else { 0 };
    let bytes = s.as_bytes();
    if bytes.len() < start + 2 || bytes[start] != b'"' {
        return None;
    }
    for (i, &c) in bytes.iter().enumerate().skip(start + 1) {
        match c {
            b'"' => return Some((&s[..=i], &s[i + 1..])),
            0x21 | 0x23..=0x7E | 0x80..=0xFF => {}
            _ => return None,
        }
    }
    None
}

fn strong_match(a: &str, b: &str) -> bool {
    a == b && !a.is_empty() && !a.starts_with("W/")
}

fn weak_match(a: &str, b: &str) -> bool {
    a.trim_start_matches("W/") == b.trim_start_matches("W/")
}

/// 在逗号分隔的 ETag 列表中查找，`*` 总是命中，格式错误时停止查找
fn etag_list_contains(list: &str, etag: &str, strong: bool) -> bool {
    let mut rest = list;
    loop {
        rest = rest.trim();
        if rest.is_empty() {
            return false;
        }
        if let Some(r) = rest.strip_prefix(',') {
            rest = r;
            continue;
        }
        if rest.starts_with('*') {
            return true;
        }
        let Some((tag, remain)) = scan_etag(rest) else {
            return false;
        };
        let hit = if strong {
            strong_match(tag, etag)
        } else {
            weak_match(tag, etag)
        };
        if hit {
            return true;
        }
        rest = remain;
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: header::HeaderName) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

fn parse_unix(value: &str) -> Option<i64> {
    let t = httpdate::parse_http_date(value).ok()?;
    t.duration_since(UNIX_EPOCH).ok().map(|d| d.as_secs() as i64)
}

fn check_if_match(headers: &HeaderMap, etag: &str) -> Cond {
    let value = header_str(headers, header::IF_MATCH);
    if value.is_empty() {
        return Cond::None;
    }
    if etag_list_contains(value, etag, true) {
        Cond::True
    } else {
        Cond::False
    }
}

fn check_if_unmodified_since(headers: &HeaderMap, modified: Option<i64>) -> Cond {
    let value = header_str(headers, header::IF_UNMODIFIED_SINCE);
    let (Some(modified), false) = (modified, value.is_empty()) else {
        return Cond::None;
    };
    match parse_unix(value) {
        Some(t) if modified <= t => Cond::True,
        Some(_) => Cond::False,
        None => Cond::None,
    }
}

fn check_if_none_match(headers: &HeaderMap, etag: &str) -> Cond {
    let value = header_str(headers, header::IF_NONE_MATCH);
    if value.is_empty() {
        return Cond::None;
    }
    if etag_list_contains(value, etag, false) {
        Cond::False
    } else {
        Cond::True
    }
}

fn check_if_modified_since(method: &Method, headers: &HeaderMap, modified: Option<i64>) -> Cond {
    if method != Method::GET && method != Method::HEAD {
        return Cond::None;
    }
    let value = header_str(headers, header::IF_MODIFIED_SINCE);
    let (Some(modified), false) = (modified, value.is_empty()) else {
        return Cond::None;
    };
    match parse_unix(value) {
        Some(t) if modified <= t => Cond::False,
        Some(_) => Cond::True,
        None => Cond::None,
    }
}

fn check_if_range(method: &Method, headers: &HeaderMap, etag: &str, modified: Option<i64>) -> Cond {
    if method != Method::GET && method != Method::HEAD {
        return Cond::None;
    }
    let value = header_str(headers, header::IF_RANGE);
    if value.is_empty() {
        return Cond::None;
    }
    if let Some((tag, _)) = scan_etag(value) {
        return if strong_match(tag, etag) {
            Cond::True
        } else {
            Cond::False
        };
    }
    // 也可能是日期
    match (modified, parse_unix(value)) {
        (Some(m), Some(t)) if m == t => Cond::True,
        _ => Cond::False,
    }
}

/// 条件求值结果
#[derive(Debug, PartialEq, Eq)]
pub enum Precondition {
    /// 继续处理，携带（可能被 If-Range 清空的）Range 头
    Proceed(String),
    NotModified,
    Failed,
}

/// 依次求值条件请求头
pub fn check_preconditions(method: &Method, headers: &HeaderMap, meta: &ContentMeta) -> Precondition {
    let etag = meta.etag.as_deref().unwrap_or_default();
    let modified = meta.modified.map(|m| m.timestamp());

    let mut ch = check_if_match(headers, etag);
    if ch == Cond::None {
        ch = check_if_unmodified_since(headers, modified);
    }
    if ch == Cond::False {
        return Precondition::Failed;
    }

    match check_if_none_match(headers, etag) {
        Cond::False => {
            if method == Method::GET || method == Method::HEAD {
                return Precondition::NotModified;
            }
            return Precondition::Failed;
        }
        Cond::None => {
            if check_if_modified_since(method, headers, modified) == Cond::False {
                return Precondition::NotModified;
            }
        }
        Cond::True => {}
    }

    let mut range = header_str(headers, header::RANGE).to_string();
    if !range.is_empty() && check_if_range(method, headers, etag, modified) == Cond::False {
        debug!("If-Range 不匹配，忽略 Range");
        range.clear();
    }
    Precondition::Proceed(range)
}

/// 把 SeekableStream 与从它取出的 reader 绑在一起，保证临时文件活得和响应体一样久
struct HeldReader<R> {
    reader: R,
    _stream: Box<SeekableStream>,
}

impl<R: AsyncRead + Unpin> AsyncRead for HeldReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().reader).poll_read(cx, buf)
    }
}

/// 响应体数据流，被丢弃时取消对应的请求令牌
struct CancelOnDrop<S> {
    inner: S,
    _guard: DropGuard,
}

impl<S> CancelOnDrop<S> {
    fn new(inner: S, cancel: &CancellationToken) -> Self {
        Self {
            inner,
            _guard: cancel.clone().drop_guard(),
        }
    }
}

impl<S: Stream + Unpin> Stream for CancelOnDrop<S> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().inner).poll_next(cx)
    }
}

fn multipart_header(boundary: &str, first: bool, range: &HttpRange, content_type: &str, size: i64) -> String {
    format!(
        "{}--{}\r\nContent-Range: {}\r\nContent-Type: {}\r\n\r\n",
        if first { "" } else { "\r\n" },
        boundary,
        range.content_range(size),
        content_type
    )
}

fn multipart_trailer(boundary: &str) -> String {
    format!("\r\n--{}--\r\n", boundary)
}

/// multipart 响应体的准确长度
fn multipart_size(ranges: &[HttpRange], boundary: &str, content_type: &str, size: i64) -> i64 {
    let headers: usize = ranges
        .iter()
        .enumerate()
        .map(|(i, r)| multipart_header(boundary, i == 0, r, content_type, size).len())
        .sum();
    headers as i64 + sum_ranges_size(ranges) + multipart_trailer(boundary).len() as i64
}

type Chunk = Result<Bytes, io::Error>;

async fn send(tx: &mut mpsc::Sender<Chunk>, chunk: Bytes) -> Result<(), StreamError> {
    tx.send(Ok(chunk)).await.map_err(|_| StreamError::Cancelled)
}

async fn write_parts(
    seeker: &mut RangeReadReadAtSeeker,
    ranges: &[HttpRange],
    boundary: &str,
    content_type: &str,
    cancel: &CancellationToken,
    tx: &mut mpsc::Sender<Chunk>,
) -> Result<(), StreamError> {
    let size = seeker.size();
    let mut buf = vec![0u8; PART_BUF_SIZE];
    for (i, range) in ranges.iter().enumerate() {
        let head = multipart_header(boundary, i == 0, range, content_type, size);
        send(tx, Bytes::from(head)).await?;

        let mut off = range.start as u64;
        let end = off + range.length as u64;
        while off < end {
            let want = ((end - off) as usize).min(buf.len());
            let n = tokio::select! {
                _ = cancel.cancelled() => return Err(StreamError::Cancelled),
                r = seeker.read_at(&mut buf[..want], off) => r?,
            };
            if n == 0 {
                break;
            }
            send(tx, Bytes::copy_from_slice(&buf[..n])).await?;
            off += n as u64;
        }
        if off != end {
            return Err(StreamError::StreamIncomplete {
                expected: range.length as u64,
                actual: off - range.start as u64,
            });
        }
    }
    send(tx, Bytes::from(multipart_trailer(boundary))).await
}

fn spawn_multipart(
    stream: SeekableStream,
    options: SeekerOptions,
    ranges: Vec<HttpRange>,
    boundary: String,
    content_type: String,
) -> Body {
    let cancel = stream.cancel_token().clone();
    let (mut tx, rx) = mpsc::channel::<Chunk>(4);
    let task_cancel = cancel.clone();
    tokio::spawn(async move {
        let mut seeker = RangeReadReadAtSeeker::new(stream, options);
        let result = write_parts(&mut seeker, &ranges, &boundary, &content_type, &task_cancel, &mut tx).await;
        match result {
            Ok(()) => debug!("multipart 输出完成，游标数: {}", seeker.cursor_count()),
            Err(StreamError::Cancelled) => debug!("客户端断开，停止输出 multipart"),
            Err(e) => {
                warn!("multipart 输出失败: {}", e);
                // 以错误结束响应体，客户端不会得到截断但“完整”的 multipart
                let _ = tx.send(Err(io::Error::from(e))).await;
            }
        }
    });
    Body::from_stream(CancelOnDrop::new(rx, &cancel))
}

fn response_builder(meta: &ContentMeta) -> axum::http::response::Builder {
    let mut builder = Response::builder();
    if let Some(modified) = meta.modified {
        builder = builder.header(
            header::LAST_MODIFIED,
            httpdate::fmt_http_date(std::time::SystemTime::from(modified)),
        );
    }
    if let Some(etag) = &meta.etag {
        builder = builder.header(header::ETAG, etag.as_str());
    }
    builder
}

pub(crate) fn build(builder: axum::http::response::Builder, body: Body) -> Result<Response, DavError> {
    builder
        .body(body)
        .map_err(|e| DavError::BadRequest(format!("无法构造响应: {}", e)))
}

/// 输出文件内容，处理条件请求与范围请求
///
/// `meta.size` 为负数（大小未知）时忽略 Range，以分块编码输出整个内容。
pub async fn serve_content(
    method: &Method,
    headers: &HeaderMap,
    meta: &ContentMeta,
    mut stream: SeekableStream,
    seeker: &SeekerOptions,
) -> Result<Response, DavError> {
    let range_header = match check_preconditions(method, headers, meta) {
        Precondition::Proceed(range) => range,
        Precondition::NotModified => {
            let mut builder = response_builder(meta).status(StatusCode::NOT_MODIFIED);
            if meta.etag.is_some() {
                // 有 ETag 时不再发送 Last-Modified
                if let Some(h) = builder.headers_mut() {
                    h.remove(header::LAST_MODIFIED);
                }
            }
            return build(builder, Body::empty());
        }
        Precondition::Failed => {
            return build(
                Response::builder().status(StatusCode::PRECONDITION_FAILED),
                Body::empty(),
            );
        }
    };

    let head = method == Method::HEAD;
    let cancel = stream.cancel_token().clone();

    if meta.size < 0 {
        if !range_header.is_empty() {
            debug!("文件大小未知，忽略 Range: {}", meta.name);
        }
        let builder = response_builder(meta)
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, meta.content_type.as_str());
        if head {
            return build(builder, Body::empty());
        }
        let body = CancelOnDrop::new(ReaderStream::new(stream), &cancel);
        return build(builder, Body::from_stream(body));
    }

    let size = meta.size;
    let mut ranges = match parse_range(&range_header, size) {
        Ok(ranges) => ranges,
        Err(RangeParseError::NoOverlap { bounded: true }) if size == 0 => {
            // 空文件上带上界的 Range 只是客户端在限制响应大小
            Vec::new()
        }
        Err(RangeParseError::NoOverlap { .. }) => {
            return build(
                Response::builder()
                    .status(StatusCode::RANGE_NOT_SATISFIABLE)
                    .header(header::CONTENT_RANGE, format!("bytes */{}", size)),
                Body::from("invalid range: failed to overlap"),
            );
        }
        Err(RangeParseError::Invalid) => {
            return build(
                Response::builder().status(StatusCode::RANGE_NOT_SATISFIABLE),
                Body::from("invalid range"),
            );
        }
    };
    if sum_ranges_size(&ranges) > size {
        // 范围总和超过文件大小，多半是攻击或客户端错误，直接返回整个文件
        ranges.clear();
    }

    let mut builder = response_builder(meta).header(header::ACCEPT_RANGES, "bytes");

    match ranges.len() {
        0 => {
            builder = builder
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, meta.content_type.as_str())
                .header(header::CONTENT_LENGTH, size);
            if head {
                return build(builder, Body::empty());
            }
            let body = CancelOnDrop::new(ReaderStream::new(stream), &cancel);
            build(builder, Body::from_stream(body))
        }
        1 => {
            let range = ranges[0];
            builder = builder
                .status(StatusCode::PARTIAL_CONTENT)
                .header(header::CONTENT_TYPE, meta.content_type.as_str())
                .header(header::CONTENT_RANGE, range.content_range(size))
                .header(header::CONTENT_LENGTH, range.length);
            if head {
                return build(builder, Body::empty());
            }
            let reader = stream.range_read(range).await?;
            let held = HeldReader {
                reader,
                _stream: Box::new(stream),
            };
            let body = CancelOnDrop::new(ReaderStream::new(held), &cancel);
            build(builder, Body::from_stream(body))
        }
        _ => {
            let boundary = uuid::Uuid::new_v4().simple().to_string();
            let send_size = multipart_size(&ranges, &boundary, &meta.content_type, size);
            let content_type = HeaderValue::from_str(&format!(
                "multipart/byteranges; boundary={}",
                boundary
            ))
            .map_err(|e| DavError::BadRequest(e.to_string()))?;
            builder = builder
                .status(StatusCode::PARTIAL_CONTENT)
                .header(header::CONTENT_TYPE, content_type)
                .header(header::CONTENT_LENGTH, send_size);
            if head {
                return build(builder, Body::empty());
            }
            let body = spawn_multipart(stream, seeker.clone(), ranges, boundary, meta.content_type.clone());
            build(builder, body)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{BoxReader, RangeReader};
    use async_trait::async_trait;
    use axum::body::to_bytes;
    use chrono::TimeZone;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    const DATA: &[u8] = b"0123456789abcdefghij";

    fn meta(size: i64) -> ContentMeta {
        ContentMeta {
            name: "a.txt".to_string(),
            size,
            modified: Some(Utc.timestamp_opt(1_700_000_000, 0).unwrap()),
            etag: Some("\"abc\"".to_string()),
            content_type: "text/plain".to_string(),
        }
    }

    fn stream(data: &'static [u8]) -> SeekableStream {
        SeekableStream::from_reader("a.txt", data.len() as i64, Box::pin(std::io::Cursor::new(data)))
    }

    fn headers(pairs: &[(header::HeaderName, &str)]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for (k, v) in pairs {
            h.insert(k.clone(), HeaderValue::from_str(v).unwrap());
        }
        h
    }

    async fn serve(method: Method, h: HeaderMap, data: &'static [u8]) -> Response {
        serve_content(&method, &h, &meta(data.len() as i64), stream(data), &SeekerOptions::default())
            .await
            .unwrap()
    }

    async fn body(resp: Response) -> Bytes {
        to_bytes(resp.into_body(), usize::MAX).await.unwrap()
    }

    #[test]
    fn test_scan_etag() {
        assert_eq!(scan_etag(" \"a\" , \"b\""), Some(("\"a\"", " , \"b\"")));
        assert_eq!(scan_etag("W/\"x\""), Some(("W/\"x\"", "")));
        assert_eq!(scan_etag("abc"), None);
        assert!(etag_list_contains("\"x\", \"abc\"", "\"abc\"", true));
        assert!(!etag_list_contains("W/\"abc\"", "\"abc\"", true));
        assert!(etag_list_contains("W/\"abc\"", "\"abc\"", false));
        assert!(etag_list_contains("*", "\"abc\"", true));
    }

    #[tokio::test]
    async fn test_full_content() {
        let resp = serve(Method::GET, HeaderMap::new(), DATA).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_LENGTH], "20");
        assert_eq!(resp.headers()[header::ETAG], "\"abc\"");
        assert_eq!(resp.headers()[header::ACCEPT_RANGES], "bytes");
        assert_eq!(
            resp.headers()[header::LAST_MODIFIED],
            "Tue, 14 Nov 2023 22:13:20 GMT"
        );
        assert_eq!(body(resp).await.as_ref(), DATA);
    }

    #[tokio::test]
    async fn test_head_has_no_body() {
        let resp = serve(Method::HEAD, HeaderMap::new(), DATA).await;
        assert_eq!(resp.headers()[header::CONTENT_LENGTH], "20");
        assert!(body(resp).await.is_empty());
    }

    #[tokio::test]
    async fn test_single_range() {
        let resp = serve(Method::GET, headers(&[(header::RANGE, "bytes=5-9")]), DATA).await;
        assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(resp.headers()[header::CONTENT_RANGE], "bytes 5-9/20");
        assert_eq!(body(resp).await.as_ref(), b"56789");

        let resp = serve(Method::GET, headers(&[(header::RANGE, "bytes=-3")]), DATA).await;
        assert_eq!(body(resp).await.as_ref(), b"hij");
    }

    #[tokio::test]
    async fn test_multi_range() {
        let resp = serve(Method::GET, headers(&[(header::RANGE, "bytes=0-1,10-12")]), DATA).await;
        assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
        let ctype = resp.headers()[header::CONTENT_TYPE].to_str().unwrap().to_string();
        let boundary = ctype
            .strip_prefix("multipart/byteranges; boundary=")
            .unwrap()
            .to_string();
        let length: usize = resp.headers()[header::CONTENT_LENGTH]
            .to_str()
            .unwrap()
            .parse()
            .unwrap();

        let bytes = body(resp).await;
        assert_eq!(bytes.len(), length);
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        let expected = format!(
            "--{b}\r\nContent-Range: bytes 0-1/20\r\nContent-Type: text/plain\r\n\r\n01\
             \r\n--{b}\r\nContent-Range: bytes 10-12/20\r\nContent-Type: text/plain\r\n\r\nabc\
             \r\n--{b}--\r\n",
            b = boundary
        );
        assert_eq!(text, expected);
    }

    #[tokio::test]
    async fn test_unsatisfiable_range() {
        let resp = serve(Method::GET, headers(&[(header::RANGE, "bytes=100-")]), DATA).await;
        assert_eq!(resp.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(resp.headers()[header::CONTENT_RANGE], "bytes */20");
    }

    #[tokio::test]
    async fn test_empty_file_ranges() {
        let resp = serve(Method::GET, headers(&[(header::RANGE, "bytes=0-")]), b"").await;
        assert_eq!(resp.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(resp.headers()[header::CONTENT_RANGE], "bytes */0");

        let resp = serve(Method::GET, headers(&[(header::RANGE, "bytes=0-1023")]), b"").await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(body(resp).await.is_empty());
    }

    #[tokio::test]
    async fn test_conditional_requests() {
        let resp = serve(Method::GET, headers(&[(header::IF_NONE_MATCH, "\"abc\"")]), DATA).await;
        assert_eq!(resp.status(), StatusCode::NOT_MODIFIED);
        assert!(resp.headers().get(header::CONTENT_TYPE).is_none());
        assert!(resp.headers().get(header::LAST_MODIFIED).is_none());

        let resp = serve(Method::GET, headers(&[(header::IF_MATCH, "\"other\"")]), DATA).await;
        assert_eq!(resp.status(), StatusCode::PRECONDITION_FAILED);

        let resp = serve(
            Method::GET,
            headers(&[(header::IF_MODIFIED_SINCE, "Tue, 14 Nov 2023 22:13:20 GMT")]),
            DATA,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_MODIFIED);

        let resp = serve(
            Method::GET,
            headers(&[(header::IF_UNMODIFIED_SINCE, "Mon, 13 Nov 2023 00:00:00 GMT")]),
            DATA,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::PRECONDITION_FAILED);
    }

    #[tokio::test]
    async fn test_if_range() {
        let h = headers(&[(header::RANGE, "bytes=0-1"), (header::IF_RANGE, "\"stale\"")]);
        let resp = serve(Method::GET, h, DATA).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let h = headers(&[(header::RANGE, "bytes=0-1"), (header::IF_RANGE, "\"abc\"")]);
        let resp = serve(Method::GET, h, DATA).await;
        assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
    }

    #[tokio::test]
    async fn test_unknown_size_streams_whole_body() {
        let stream = SeekableStream::from_reader("a.txt", -1, Box::pin(std::io::Cursor::new(DATA)));
        let h = headers(&[(header::RANGE, "bytes=0-1")]);
        let resp = serve_content(&Method::GET, &h, &meta(-1), stream, &SeekerOptions::default())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers().get(header::CONTENT_LENGTH).is_none());
        assert!(resp.headers().get(header::ACCEPT_RANGES).is_none());
        assert!(resp.headers().get(header::CONTENT_RANGE).is_none());
        assert_eq!(body(resp).await.as_ref(), DATA);
    }

    /// 从 0 开始的读取正常返回，其余偏移的读取永远挂起
    struct StallingReader {
        calls: AtomicUsize,
        dropped: Arc<AtomicBool>,
    }

    struct SetOnDrop(Arc<AtomicBool>);

    impl Drop for SetOnDrop {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl RangeReader for StallingReader {
        async fn range_read(&self, range: HttpRange) -> Result<BoxReader, StreamError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if range.start == 0 {
                let range = range.clamp(DATA.len() as i64);
                let end = (range.start + range.length) as usize;
                return Ok(Box::pin(std::io::Cursor::new(&DATA[..end])));
            }
            let _flag = SetOnDrop(Arc::clone(&self.dropped));
            futures::future::pending::<Result<BoxReader, StreamError>>().await
        }
    }

    fn stalling() -> (Arc<StallingReader>, SeekableStream) {
        let reader = Arc::new(StallingReader {
            calls: AtomicUsize::new(0),
            dropped: Arc::new(AtomicBool::new(false)),
        });
        let stream = SeekableStream::from_range_reader("a.txt", DATA.len() as i64, reader.clone());
        (reader, stream)
    }

    #[tokio::test]
    async fn test_dropping_multipart_body_cancels_upstream() {
        let (reader, stream) = stalling();
        let cancel = stream.cancel_token().clone();
        let options = SeekerOptions {
            max_skip: 0,
            head_cache: 0,
            max_cursors: 4,
        };
        let h = headers(&[(header::RANGE, "bytes=0-1,10-12")]);
        let resp = serve_content(&Method::GET, &h, &meta(20), stream, &options).await.unwrap();

        let mut data = resp.into_body().into_data_stream();
        let first = data.next().await.unwrap().unwrap();
        assert!(String::from_utf8_lossy(&first).contains("Content-Range: bytes 0-1/20"));
        assert!(!cancel.is_cancelled());

        // 第二段的上游读取挂起时客户端断开
        drop(data);
        tokio::time::timeout(Duration::from_secs(5), cancel.cancelled())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !reader.dropped.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_dropping_single_range_body_cancels() {
        let (_reader, stream) = stalling();
        let cancel = stream.cancel_token().clone();
        let h = headers(&[(header::RANGE, "bytes=0-4")]);
        let resp = serve_content(&Method::GET, &h, &meta(20), stream, &SeekerOptions::default())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
        drop(resp);
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_multi_range_reuses_cursor() {
        let (reader, stream) = stalling();
        let options = SeekerOptions {
            head_cache: 0,
            ..SeekerOptions::default()
        };
        let h = headers(&[(header::RANGE, "bytes=0-1,5-6,10-12")]);
        let resp = serve_content(&Method::GET, &h, &meta(20), stream, &options).await.unwrap();
        let text = String::from_utf8(body(resp).await.to_vec()).unwrap();
        assert!(text.contains("\r\n\r\n01\r\n"));
        assert!(text.contains("\r\n\r\n56\r\n"));
        assert!(text.contains("\r\n\r\nabc\r\n"));
        // 后两段都在前一个游标之后，跳过少量字节即可复用
        assert_eq!(reader.calls.load(Ordering::SeqCst), 1);
    }
}
