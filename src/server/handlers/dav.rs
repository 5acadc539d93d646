//! WebDAV 与签名代理入口

use crate::server::AppState;
use axum::body::Body;
use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderMap, Method};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::debug;

/// 签名代理查询参数
#[derive(Debug, Default, Deserialize)]
pub struct SignQuery {
    #[serde(default)]
    pub sign: String,
}

/// GET/HEAD {proxy_prefix}/*path?sign=...
pub async fn signed_proxy(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Query(query): Query<SignQuery>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    let path = format!("/{}", path);
    debug!("签名代理请求: {} {}", method, path);
    state
        .dav
        .serve_signed(&path, &query.sign, &method, &headers)
        .await
        .unwrap_or_else(IntoResponse::into_response)
}

/// 兜底路由：所有 WebDAV 方法
pub async fn webdav(State(state): State<AppState>, req: Request<Body>) -> Response {
    state.dav.handle(req).await
}
