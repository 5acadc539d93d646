//! HTTP 路由与处理器

pub mod dav;
pub mod health;

pub use dav::{signed_proxy, webdav, SignQuery};
pub use health::{health_check, HealthResponse};

use super::AppState;
use axum::routing::{any, get};
use axum::Router;

/// 组装路由：健康检查、签名代理，其余请求交给 WebDAV 处理器
pub fn build_router(state: AppState) -> Router {
    let proxy = format!("{}/*path", state.dav.config().proxy_prefix.trim_end_matches('/'));
    Router::new()
        .route("/health", get(health_check))
        .route(&proxy, any(signed_proxy))
        .fallback(webdav)
        .with_state(state)
}
