//! 流层错误类型

use std::io;

/// 流层错误
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// 起始偏移非法（start < 0）
    #[error("无效的读取范围: start={start}, length={length}")]
    InvalidRange { start: i64, length: i64 },

    /// 实际收到的字节数少于承诺的字节数（网络或后端故障，不能静默截断）
    #[error("数据流不完整: 期望 {expected} 字节, 实际 {actual} 字节")]
    StreamIncomplete { expected: u64, actual: u64 },

    /// 既没有顺序 reader 也没有 RangeReader 可用
    #[error("无效的数据流: 没有可用的数据源")]
    InvalidStream,

    /// 顺序读取已越过预读缓冲区，只读流无法再回到更早的位置
    #[error("数据流已被顺序消费到 {consumed}，无法再随机访问")]
    AlreadyConsumed { consumed: u64 },

    /// 上游返回的具体 HTTP 状态码，用于透传
    #[error("上游返回 HTTP 状态码 {0}")]
    HttpStatus(u16),

    /// 操作被取消
    #[error("操作已取消")]
    Cancelled,

    #[error("HTTP 请求失败: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO 错误: {0}")]
    Io(#[from] io::Error),
}

impl StreamError {
    /// 携带的具体 HTTP 状态码（如果有）
    pub fn status_code(&self) -> Option<u16> {
        match self {
            StreamError::HttpStatus(code) => Some(*code),
            StreamError::InvalidRange { .. } => Some(416),
            StreamError::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// 网络类错误可以在分片层重试，HTTP 状态码错误与取消不重试
    pub fn is_retryable(&self) -> bool {
        match self {
            StreamError::Http(e) => e.status().is_none(),
            StreamError::StreamIncomplete { .. } => true,
            StreamError::Io(e) => !matches!(e.kind(), io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied),
            _ => false,
        }
    }

    /// 从 `io::Error` 还原（经过 AsyncRead 管道后保留原始错误与状态码）
    pub fn from_io(err: io::Error) -> Self {
        if !err.get_ref().map_or(false, |inner| inner.is::<StreamError>()) {
            return StreamError::Io(err);
        }
        let kind = err.kind();
        match err.into_inner().map(|inner| inner.downcast::<StreamError>()) {
            Some(Ok(inner)) => *inner,
            Some(Err(other)) => StreamError::Io(io::Error::new(kind, other)),
            None => StreamError::Io(io::Error::from(kind)),
        }
    }
}

impl From<StreamError> for io::Error {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::Io(e) => e,
            StreamError::Cancelled => io::Error::new(io::ErrorKind::ConnectionAborted, StreamError::Cancelled),
            other => io::Error::new(io::ErrorKind::Other, other),
        }
    }
}
