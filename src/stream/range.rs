//! HTTP 字节范围
//!
//! - [`HttpRange`]: `[start, start+length)` 读取窗口，length < 0 表示读到末尾
//! - [`parse_range`]: 解析请求头 `Range: bytes=...`（RFC 7233）
//! - [`parse_content_range`]: 解析响应头 `Content-Range: bytes s-e/total`

use super::StreamError;

/// 字节范围
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpRange {
    /// 起始偏移
    pub start: i64,
    /// 长度，负数表示读到流末尾
    pub length: i64,
}

impl HttpRange {
    pub fn new(start: i64, length: i64) -> Self {
        Self { start, length }
    }

    /// 整个流
    pub fn full() -> Self {
        Self { start: 0, length: -1 }
    }

    /// 从 start 读到末尾
    pub fn from_offset(start: i64) -> Self {
        Self { start, length: -1 }
    }

    pub fn validate(&self) -> Result<(), StreamError> {
        if self.start < 0 {
            return Err(StreamError::InvalidRange {
                start: self.start,
                length: self.length,
            });
        }
        Ok(())
    }

    /// 是否覆盖整个流
    pub fn is_full(&self) -> bool {
        self.start == 0 && self.length < 0
    }

    /// 按总大小修正长度: `min(length, size - start)`
    ///
    /// size < 0（未知）时保持原样
    pub fn clamp(&self, size: i64) -> HttpRange {
        if size < 0 {
            return *self;
        }
        let remain = (size - self.start).max(0);
        let length = if self.length < 0 {
            remain
        } else {
            self.length.min(remain)
        };
        HttpRange {
            start: self.start,
            length,
        }
    }

    /// 末尾（不含），长度未知时为 None
    pub fn end(&self) -> Option<i64> {
        (self.length >= 0).then(|| self.start + self.length)
    }

    /// 请求头 `Range` 的值
    pub fn header_value(&self) -> String {
        match self.end() {
            Some(end) if end > self.start => format!("bytes={}-{}", self.start, end - 1),
            _ => format!("bytes={}-", self.start),
        }
    }

    /// 响应头 `Content-Range` 的值
    pub fn content_range(&self, size: i64) -> String {
        format!(
            "bytes {}-{}/{}",
            self.start,
            self.start + self.length - 1,
            size
        )
    }
}

/// Range 请求头解析错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RangeParseError {
    #[error("无效的 Range 请求头")]
    Invalid,
    /// 所有范围都落在资源之外
    #[error("请求范围与资源没有交集")]
    NoOverlap {
        /// 是否全部为带上界的范围（客户端用来限制响应大小）
        bounded: bool,
    },
}

/// 解析 `Range: bytes=...` 请求头
///
/// 空字符串返回空列表；落在资源之外的单个范围被忽略，
/// 全部落在资源之外时返回 [`RangeParseError::NoOverlap`]
pub fn parse_range(header: &str, size: i64) -> Result<Vec<HttpRange>, RangeParseError> {
    if header.is_empty() {
        return Ok(Vec::new());
    }
    const PREFIX: &str = "bytes=";
    let specs = header
        .strip_prefix(PREFIX)
        .ok_or(RangeParseError::Invalid)?;

    let mut ranges = Vec::new();
    let mut no_overlap = false;
    let mut all_bounded = true;

    for spec in specs.split(',') {
        let spec = spec.trim();
        if spec.is_empty() {
            continue;
        }
        let (start, end) = spec.split_once('-').ok_or(RangeParseError::Invalid)?;
        let (start, end) = (start.trim(), end.trim());

        if start.is_empty() {
            // 后缀范围: -N 表示最后 N 个字节
            if end.is_empty() || end.starts_with('-') {
                return Err(RangeParseError::Invalid);
            }
            let mut n: i64 = end.parse().map_err(|_| RangeParseError::Invalid)?;
            if n > size {
                n = size;
            }
            if n == 0 {
                no_overlap = true;
                continue;
            }
            let start = size - n;
            ranges.push(HttpRange::new(start, size - start));
            continue;
        }

        let start: i64 = start.parse().map_err(|_| RangeParseError::Invalid)?;
        if start < 0 {
            return Err(RangeParseError::Invalid);
        }
        if end.is_empty() {
            all_bounded = false;
        }
        if start >= size {
            no_overlap = true;
            continue;
        }
        let length = if end.is_empty() {
            size - start
        } else {
            let mut end: i64 = end.parse().map_err(|_| RangeParseError::Invalid)?;
            if start > end {
                return Err(RangeParseError::Invalid);
            }
            if end >= size {
                end = size - 1;
            }
            end - start + 1
        };
        ranges.push(HttpRange::new(start, length));
    }

    if no_overlap && ranges.is_empty() {
        return Err(RangeParseError::NoOverlap {
            bounded: all_bounded,
        });
    }
    Ok(ranges)
}

/// 所有范围的总长度
pub fn sum_ranges_size(ranges: &[HttpRange]) -> i64 {
    ranges.iter().map(|r| r.length).sum()
}

/// 解析后的 `Content-Range`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: i64,
    pub end: i64,
    /// 资源总大小，`*` 时为 None
    pub total: Option<i64>,
}

/// 解析响应头 `Content-Range: bytes s-e/total`
pub fn parse_content_range(value: &str) -> Option<ContentRange> {
    let value = value.trim().strip_prefix("bytes")?.trim_start();
    let (span, total) = value.split_once('/')?;
    let (start, end) = span.split_once('-')?;
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse().ok()?),
    };
    Some(ContentRange {
        start: start.trim().parse().ok()?,
        end: end.trim().parse().ok()?,
        total,
    })
}
