//! WebDAV 错误与状态码映射

use super::lock::LockError;
use crate::storage::StorageError;
use crate::stream::StreamError;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::{error, warn};

/// WebDAV 请求错误，每个变体对应一个响应状态码
#[derive(Debug, thiserror::Error)]
pub enum DavError {
    #[error("请求无效: {0}")]
    BadRequest(String),

    #[error("不支持: {0}")]
    NotImplemented(String),

    #[error("禁止操作: {0}")]
    Forbidden(String),

    #[error("方法不允许")]
    MethodNotAllowed,

    #[error("不支持的请求体")]
    UnsupportedMediaType,

    #[error("冲突: {0}")]
    Conflict(String),

    #[error("前置条件失败")]
    PreconditionFailed,

    #[error("目标地址不属于本服务")]
    BadGateway,

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Stream(#[from] StreamError),
}

impl DavError {
    pub fn status(&self) -> StatusCode {
        match self {
            DavError::BadRequest(_) => StatusCode::BAD_REQUEST,
            DavError::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            DavError::Forbidden(_) => StatusCode::FORBIDDEN,
            DavError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            DavError::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            DavError::Conflict(_) => StatusCode::CONFLICT,
            DavError::PreconditionFailed => StatusCode::PRECONDITION_FAILED,
            DavError::BadGateway => StatusCode::BAD_GATEWAY,
            DavError::Lock(e) => lock_status(*e),
            DavError::Storage(e) => storage_status(e),
            DavError::Stream(e) => stream_status(e),
        }
    }
}

pub(crate) fn lock_status(err: LockError) -> StatusCode {
    match err {
        LockError::Locked => StatusCode::LOCKED,
        LockError::NoSuchLock => StatusCode::CONFLICT,
        LockError::ConfirmationFailed => StatusCode::PRECONDITION_FAILED,
        LockError::Forbidden => StatusCode::FORBIDDEN,
    }
}

pub(crate) fn storage_status(err: &StorageError) -> StatusCode {
    match err {
        StorageError::NotFound(_) => StatusCode::NOT_FOUND,
        StorageError::AlreadyExists(_) => StatusCode::METHOD_NOT_ALLOWED,
        StorageError::NotEmpty(_) | StorageError::ParentNotFound(_) => StatusCode::CONFLICT,
        StorageError::PermissionDenied(_) => StatusCode::FORBIDDEN,
        StorageError::NotSupported(_) => StatusCode::NOT_IMPLEMENTED,
        StorageError::Stream(e) => stream_status(e),
        StorageError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub(crate) fn stream_status(err: &StreamError) -> StatusCode {
    if let Some(code) = err.status_code().and_then(|c| StatusCode::from_u16(c).ok()) {
        return code;
    }
    match err {
        StreamError::StreamIncomplete { .. } | StreamError::Http(_) => StatusCode::BAD_GATEWAY,
        StreamError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// 状态码的原因短语，包含 WebDAV 扩展状态码
pub fn status_text(status: StatusCode) -> &'static str {
    match status.as_u16() {
        207 => "Multi-Status",
        422 => "Unprocessable Entity",
        423 => "Locked",
        424 => "Failed Dependency",
        507 => "Insufficient Storage",
        _ => status.canonical_reason().unwrap_or(""),
    }
}

/// `HTTP/1.1 200 OK` 形式的状态行，用于 multistatus
pub fn status_line(status: StatusCode) -> String {
    format!("HTTP/1.1 {} {}", status.as_u16(), status_text(status))
}

/// 只带状态短语正文的响应
pub fn status_response(status: StatusCode) -> Response {
    if status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED {
        return status.into_response();
    }
    (
        status,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        status_text(status),
    )
        .into_response()
}

impl IntoResponse for DavError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("WebDAV 请求失败: {}", self);
        } else {
            warn!("WebDAV 请求被拒绝 ({}): {}", status.as_u16(), self);
        }
        status_response(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_mapping() {
        assert_eq!(DavError::from(LockError::Locked).status(), StatusCode::LOCKED);
        assert_eq!(DavError::from(LockError::NoSuchLock).status(), StatusCode::CONFLICT);
        assert_eq!(
            DavError::from(LockError::ConfirmationFailed).status(),
            StatusCode::PRECONDITION_FAILED
        );
        assert_eq!(DavError::from(LockError::Forbidden).status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_stream_status_passthrough() {
        let err = DavError::from(StorageError::Stream(StreamError::HttpStatus(403)));
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
        let err = DavError::from(StreamError::StreamIncomplete {
            expected: 10,
            actual: 1,
        });
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_status_text() {
        assert_eq!(status_text(StatusCode::MULTI_STATUS), "Multi-Status");
        assert_eq!(status_text(StatusCode::LOCKED), "Locked");
        assert_eq!(status_text(StatusCode::INSUFFICIENT_STORAGE), "Insufficient Storage");
        assert_eq!(status_line(StatusCode::NOT_FOUND), "HTTP/1.1 404 Not Found");
    }
}
