//! WebDAV 请求处理器
//!
//! 每个请求的处理流程：去掉 URL 前缀 → 限制在用户根目录内 → 确认锁 →
//! 通过 [`Storage`] 执行 → 写响应。除 GET/HEAD/POST 的文件内容外，响应都在
//! 完整构造后才返回，出错时仍可以改写状态码。

use super::error::{status_response, DavError};
use super::if_header::{parse_if_header, Condition};
use super::lock::{LockDetails, LockError, LockManager, LockRelease};
use super::prop::{href, MemPropertyStore, PropContext};
use super::serve::{build, serve_content, ContentMeta};
use super::xml::{lockdiscovery_xml, parse_lockinfo};
use crate::sign::LinkSigner;
use crate::storage::{
    base_name, clean_path, join_jailed, join_path, parent_path, LinkMode, PutOptions, Storage,
    StorageError,
};
use crate::stream::{BoxReader, LinkContext, SeekableStream, SeekerOptions, DEFAULT_PEEK_LIMIT};
use axum::body::Body;
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::io::StreamReader;
use tracing::{debug, info, warn};

/// LOCK / PROPFIND / PROPPATCH 请求体上限
const MAX_XML_BODY: usize = 1024 * 1024;

/// Timeout 头允许的最大秒数
const MAX_TIMEOUT_SECS: u64 = u32::MAX as u64;

/// WebDAV 服务配置
#[derive(Debug, Clone)]
pub struct DavConfig {
    /// 对外 URL 前缀，例如 `/dav`
    pub prefix: String,
    /// 用户根目录，所有请求路径都被限制在其下
    pub user_root: String,
    /// 锁的最长有效期，None 表示接受客户端的任意值
    pub max_lock_timeout: Option<Duration>,
    /// 代理传输时的预读上限
    pub peek_limit: usize,
    /// 物化临时文件所在目录，None 使用系统临时目录
    pub temp_dir: Option<PathBuf>,
    /// 签名代理路由前缀
    pub proxy_prefix: String,
    /// 多段范围输出使用的定位读取池参数
    pub seeker: SeekerOptions,
}

impl Default for DavConfig {
    fn default() -> Self {
        Self {
            prefix: "/dav".to_string(),
            user_root: "/".to_string(),
            max_lock_timeout: None,
            peek_limit: DEFAULT_PEEK_LIMIT,
            temp_dir: None,
            proxy_prefix: "/p".to_string(),
            seeker: SeekerOptions::default(),
        }
    }
}

/// Depth 请求头
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Depth {
    Zero,
    One,
    Infinity,
}

/// 解析 Depth 头，缺省时返回 `default`
pub fn parse_depth(headers: &HeaderMap, default: Depth) -> Result<Depth, DavError> {
    match header_value(headers, "depth") {
        "" => Ok(default),
        "0" => Ok(Depth::Zero),
        "1" => Ok(Depth::One),
        s if s.eq_ignore_ascii_case("infinity") => Ok(Depth::Infinity),
        s => Err(DavError::BadRequest(format!("无效的 Depth: {}", s))),
    }
}

/// 解析 Timeout 头，只取第一个值；None 表示永不过期
pub fn parse_timeout(value: &str) -> Result<Option<Duration>, DavError> {
    let invalid = || DavError::BadRequest(format!("无效的 Timeout: {}", value));
    let s = value.split(',').next().unwrap_or_default().trim();
    if s.is_empty() || s == "Infinite" {
        return Ok(None);
    }
    let secs = s.strip_prefix("Second-").ok_or_else(invalid)?;
    if !secs.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(invalid());
    }
    let n: u64 = secs.parse().map_err(|_| invalid())?;
    if n > MAX_TIMEOUT_SECS {
        return Err(invalid());
    }
    Ok(Some(Duration::from_secs(n)))
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .trim()
}

/// X-OC-Mtime / X-OC-Ctime: Unix 秒，允许小数
fn parse_unix_time(value: &str) -> Option<DateTime<Utc>> {
    if value.is_empty() {
        return None;
    }
    if let Ok(secs) = value.parse::<i64>() {
        return DateTime::from_timestamp(secs, 0);
    }
    let secs = value.parse::<f64>().ok().filter(|f| f.is_finite())?;
    DateTime::from_timestamp(secs.trunc() as i64, (secs.fract().abs() * 1e9) as u32)
}

fn trim_weak(etag: &str) -> &str {
    etag.strip_prefix("W/").unwrap_or(etag)
}

pub(super) struct DavInner {
    pub(super) config: DavConfig,
    pub(super) storage: Arc<dyn Storage>,
    pub(super) locks: LockManager,
    pub(super) props: MemPropertyStore,
    ctx: LinkContext,
    signer: Option<LinkSigner>,
}

/// WebDAV 处理器，可廉价克隆
#[derive(Clone)]
pub struct DavHandler {
    pub(super) inner: Arc<DavInner>,
}

impl std::fmt::Debug for DavHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DavHandler")
            .field("config", &self.inner.config)
            .field("dead_props", &self.inner.props.len())
            .finish_non_exhaustive()
    }
}

impl DavHandler {
    pub fn new(
        config: DavConfig,
        storage: Arc<dyn Storage>,
        locks: LockManager,
        ctx: LinkContext,
    ) -> Self {
        Self {
            inner: Arc::new(DavInner {
                config,
                storage,
                locks,
                props: MemPropertyStore::new(),
                ctx,
                signer: None,
            }),
        }
    }

    /// 启用签名代理链接，需在处理器被共享之前调用
    pub fn with_signer(mut self, signer: LinkSigner) -> Self {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => inner.signer = Some(signer),
            None => warn!("处理器已被共享，忽略签名配置"),
        }
        self
    }

    pub fn config(&self) -> &DavConfig {
        &self.inner.config
    }

    pub fn locks(&self) -> &LockManager {
        &self.inner.locks
    }

    /// 处理一个 WebDAV 请求
    pub async fn handle(&self, req: Request<Body>) -> Response {
        let (parts, body) = req.into_parts();
        debug!("WebDAV {} {}", parts.method, parts.uri.path());

        let result = match parts.method.as_str() {
            "OPTIONS" => self.handle_options(&parts).await,
            "GET" | "HEAD" | "POST" => self.handle_get_head_post(&parts).await,
            "DELETE" => self.handle_delete(&parts).await,
            "PUT" => self.handle_put(&parts, body).await,
            "MKCOL" => self.handle_mkcol(&parts).await,
            "COPY" | "MOVE" => self.handle_copy_move(&parts).await,
            "LOCK" => self.handle_lock(&parts, body).await,
            "UNLOCK" => self.handle_unlock(&parts).await,
            "PROPFIND" => self.handle_propfind(&parts, body).await,
            "PROPPATCH" => self.handle_proppatch(&parts, body).await,
            m => Err(DavError::BadRequest(format!("不支持的方法: {}", m))),
        };
        result.unwrap_or_else(IntoResponse::into_response)
    }

    /// URL 路径去掉前缀后的相对路径；前缀不匹配视为不存在
    fn strip_prefix(&self, raw: &str) -> Result<String, DavError> {
        let decoded = urlencoding::decode(raw)
            .map_err(|_| DavError::BadRequest(format!("路径编码无效: {}", raw)))?;
        let prefix = self.inner.config.prefix.trim_end_matches('/');
        if prefix.is_empty() {
            return Ok(clean_path(&decoded));
        }
        match decoded.strip_prefix(prefix) {
            Some(rest) if rest.is_empty() || rest.starts_with('/') => Ok(clean_path(rest)),
            _ => Err(StorageError::NotFound(decoded.to_string()).into()),
        }
    }

    fn jail(&self, rel: &str) -> String {
        join_jailed(&self.inner.config.user_root, rel)
    }

    /// 请求目标在存储中的路径
    pub(super) fn resolve_path(&self, parts: &Parts) -> Result<String, DavError> {
        Ok(self.jail(&self.strip_prefix(parts.uri.path())?))
    }

    pub(super) fn prop_ctx(&self) -> PropContext<'_> {
        PropContext {
            locks: &self.inner.locks,
            prefix: &self.inner.config.prefix,
            user_root: &self.inner.config.user_root,
        }
    }

    /// 绝对 URL 的主机必须与请求一致
    fn same_host(parts: &Parts, url: &reqwest::Url) -> bool {
        let request_host = match parts.headers.get(header::HOST).and_then(|v| v.to_str().ok()) {
            Some(h) => h.to_string(),
            None => parts
                .uri
                .authority()
                .map(|a| a.to_string())
                .unwrap_or_default(),
        };
        let host = match (url.host_str(), url.port()) {
            (Some(h), Some(p)) => format!("{}:{}", h, p),
            (Some(h), None) => h.to_string(),
            (None, _) => return false,
        };
        host.eq_ignore_ascii_case(&request_host)
    }

    /// 检查列表中的 ETag 条件与否定的令牌条件；肯定的令牌条件交给锁管理器
    async fn state_matches(&self, path: Option<&str>, conditions: &[Condition]) -> bool {
        let etag = match path {
            Some(p) if conditions.iter().any(|c| !c.etag.is_empty()) => {
                self.inner.storage.resolve(p).await.ok().map(|o| o.etag())
            }
            _ => None,
        };
        let active: Vec<String> = path
            .map(|p| {
                self.inner
                    .locks
                    .active_locks(Instant::now(), p)
                    .into_iter()
                    .map(|l| l.token)
                    .collect()
            })
            .unwrap_or_default();

        conditions.iter().all(|c| {
            let matched = if !c.etag.is_empty() {
                etag.as_deref()
                    .is_some_and(|e| trim_weak(e) == trim_weak(&c.etag))
            } else if c.not {
                active.contains(&c.token)
            } else {
                return true;
            };
            matched != c.not
        })
    }

    /// 确认请求可以修改 `src` / `dst`
    ///
    /// 没有 If 头时在目标上加临时锁；否则 If 头中任意一个列表成立即可，
    /// 全部失败返回 412。
    pub(super) async fn confirm_locks(
        &self,
        parts: &Parts,
        src: Option<&str>,
        dst: Option<&str>,
    ) -> Result<LockRelease, DavError> {
        let locks = &self.inner.locks;
        let value = header_value(&parts.headers, "if");
        if value.is_empty() {
            return Ok(locks.confirm(Instant::now(), src, dst, &[])?);
        }

        let ih = parse_if_header(value)
            .ok_or_else(|| DavError::BadRequest(format!("If 头格式错误: {}", value)))?;
        for list in &ih.lists {
            let target = if list.resource_tag.is_empty() {
                src.map(str::to_string)
            } else {
                let url = match reqwest::Url::parse(&list.resource_tag) {
                    Ok(url) => url,
                    Err(_) => continue,
                };
                if !Self::same_host(parts, &url) {
                    continue;
                }
                Some(self.jail(&self.strip_prefix(url.path())?))
            };

            if !self
                .state_matches(target.as_deref().or(dst), &list.conditions)
                .await
            {
                continue;
            }
            let tokens: Vec<Condition> = list
                .conditions
                .iter()
                .filter(|c| !c.not && !c.token.is_empty())
                .cloned()
                .collect();
            match locks.confirm(Instant::now(), target.as_deref(), dst, &tokens) {
                Ok(release) => return Ok(release),
                Err(LockError::ConfirmationFailed | LockError::Locked) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        debug!("If 头中所有条件列表均不成立: {}", value);
        Err(DavError::PreconditionFailed)
    }

    async fn handle_options(&self, parts: &Parts) -> Result<Response, DavError> {
        let path = self.resolve_path(parts)?;
        let allow = match self.inner.storage.resolve(&path).await {
            Ok(obj) if obj.is_dir => "OPTIONS, LOCK, DELETE, PROPPATCH, COPY, MOVE, UNLOCK, PROPFIND",
            Ok(_) => "OPTIONS, LOCK, GET, HEAD, POST, DELETE, PROPPATCH, COPY, MOVE, UNLOCK, PROPFIND, PUT",
            Err(_) => "OPTIONS, LOCK, PUT, MKCOL",
        };
        build(
            Response::builder()
                .status(StatusCode::OK)
                .header(header::ALLOW, allow)
                .header("DAV", "1, 2")
                .header("MS-Author-Via", "DAV"),
            Body::empty(),
        )
    }

    fn redirect(location: &str) -> Result<Response, DavError> {
        build(
            Response::builder()
                .status(StatusCode::FOUND)
                .header(header::LOCATION, location)
                .header(header::CACHE_CONTROL, "no-cache"),
            Body::empty(),
        )
    }

    async fn handle_get_head_post(&self, parts: &Parts) -> Result<Response, DavError> {
        let path = self.resolve_path(parts)?;
        let storage = &self.inner.storage;
        let obj = storage.resolve(&path).await?;
        if obj.is_dir {
            return Err(DavError::MethodNotAllowed);
        }
        let meta = ContentMeta::from(&obj);

        if parts.method == Method::HEAD {
            let empty: BoxReader = Box::pin(tokio::io::empty());
            let stream = SeekableStream::from_reader(obj.name.clone(), obj.size, empty);
            return serve_content(&parts.method, &parts.headers, &meta, stream, &self.inner.config.seeker).await;
        }

        let mode = storage.capabilities(&path).link_mode;
        if mode == LinkMode::SignedProxy {
            if let Some(signer) = &self.inner.signer {
                let location = format!(
                    "{}?sign={}",
                    href(&self.inner.config.proxy_prefix, &path, false),
                    urlencoding::encode(&signer.sign(&path))
                );
                debug!("签名代理重定向: {}", path);
                return Self::redirect(&location);
            }
            warn!("存储要求签名代理但未配置签名密钥，改为直接代理: {}", path);
        }

        let link = storage.link(&path, &parts.headers).await?;
        if mode == LinkMode::Redirect {
            if let Some(url) = link.redirect_url() {
                debug!("重定向到直链: {}", path);
                return Self::redirect(url);
            }
        }

        let stream = SeekableStream::from_link(obj.name.clone(), obj.size, &link, &self.inner.ctx.child())?
            .with_peek_limit(self.inner.config.peek_limit)
            .with_temp_dir(self.inner.config.temp_dir.clone());
        serve_content(&parts.method, &parts.headers, &meta, stream, &self.inner.config.seeker).await
    }

    async fn handle_delete(&self, parts: &Parts) -> Result<Response, DavError> {
        let rel = self.strip_prefix(parts.uri.path())?;
        if rel == "/" {
            return Err(DavError::Forbidden("不能删除根目录".to_string()));
        }
        let path = self.jail(&rel);
        let _release = self.confirm_locks(parts, Some(&path), None).await?;

        self.inner.storage.resolve(&path).await?;
        self.inner.storage.remove(&path).await?;
        self.inner.props.remove_tree(&path);
        info!("WebDAV 删除: {}", path);
        Ok(status_response(StatusCode::NO_CONTENT))
    }

    async fn handle_put(&self, parts: &Parts, body: Body) -> Result<Response, DavError> {
        let rel = self.strip_prefix(parts.uri.path())?;
        if rel == "/" {
            return Err(DavError::MethodNotAllowed);
        }
        let path = self.jail(&rel);
        let _release = self.confirm_locks(parts, Some(&path), None).await?;

        let storage = &self.inner.storage;
        if let Ok(existing) = storage.resolve(&path).await {
            if existing.is_dir {
                return Err(DavError::MethodNotAllowed);
            }
        }

        let size = header_value(&parts.headers, "content-length")
            .parse::<i64>()
            .unwrap_or(-1);
        let modified = parse_unix_time(header_value(&parts.headers, "x-oc-mtime"));
        let options = PutOptions {
            modified,
            created: parse_unix_time(header_value(&parts.headers, "x-oc-ctime")),
        };

        let data = body
            .into_data_stream()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e));
        let reader: BoxReader = Box::pin(StreamReader::new(data));
        let label = path.clone();
        let stream = SeekableStream::from_reader(base_name(&path), size, reader)
            .with_temp_dir(self.inner.config.temp_dir.clone())
            .with_progress(Arc::new(move |done: u64, total: i64| {
                debug!("上传进度 {}: {}/{}", label, done, total);
            }));

        let parent = parent_path(&path);
        let result = storage.put_stream(&parent, stream, options).await;
        storage.invalidate(&path);
        storage.invalidate(&parent);
        let obj = result?;
        info!("WebDAV 上传: {} ({} bytes)", path, obj.size);

        let mut builder = Response::builder()
            .status(StatusCode::CREATED)
            .header(header::ETAG, obj.etag());
        if modified.is_some() {
            builder = builder.header("X-OC-Mtime", "accepted");
        }
        build(builder, Body::from("Created"))
    }

    async fn handle_mkcol(&self, parts: &Parts) -> Result<Response, DavError> {
        let path = self.resolve_path(parts)?;
        let _release = self.confirm_locks(parts, Some(&path), None).await?;

        let has_body = header_value(&parts.headers, "content-length")
            .parse::<u64>()
            .is_ok_and(|n| n > 0);
        if has_body {
            return Err(DavError::UnsupportedMediaType);
        }

        let storage = &self.inner.storage;
        if storage.resolve(&path).await.is_ok() {
            return Err(DavError::MethodNotAllowed);
        }
        match storage.resolve(&parent_path(&path)).await {
            Ok(parent) if parent.is_dir => {}
            Ok(_) | Err(StorageError::NotFound(_)) => {
                return Err(DavError::Conflict(format!("父目录不存在: {}", path)));
            }
            Err(e) => return Err(e.into()),
        }
        storage.create_collection(&path).await?;
        Ok(status_response(StatusCode::CREATED))
    }

    /// 解析 Destination 头，返回存储路径
    fn destination(&self, parts: &Parts) -> Result<String, DavError> {
        let value = header_value(&parts.headers, "destination");
        if value.is_empty() {
            return Err(DavError::BadRequest("缺少 Destination".to_string()));
        }
        let raw_path = if value.starts_with('/') {
            value.split(['?', '#']).next().unwrap_or_default().to_string()
        } else {
            let url = reqwest::Url::parse(value)
                .map_err(|_| DavError::BadRequest(format!("无效的 Destination: {}", value)))?;
            if !Self::same_host(parts, &url) {
                return Err(DavError::BadGateway);
            }
            url.path().to_string()
        };
        match self.strip_prefix(&raw_path) {
            Ok(rel) => Ok(self.jail(&rel)),
            Err(DavError::Storage(StorageError::NotFound(_))) => Err(DavError::BadGateway),
            Err(e) => Err(e),
        }
    }

    async fn handle_copy_move(&self, parts: &Parts) -> Result<Response, DavError> {
        let src = self.resolve_path(parts)?;
        let dst = self.destination(parts)?;
        if src == dst {
            return Err(DavError::Forbidden("源与目标相同".to_string()));
        }
        if dst.starts_with(&format!("{}/", src.trim_end_matches('/'))) {
            return Err(DavError::Forbidden("目标位于源目录之内".to_string()));
        }
        let overwrite = !header_value(&parts.headers, "overwrite").eq_ignore_ascii_case("F");
        let is_copy = parts.method.as_str() == "COPY";

        let (_release, depth) = if is_copy {
            let release = self.confirm_locks(parts, None, Some(&dst)).await?;
            let depth = parse_depth(&parts.headers, Depth::Infinity)?;
            if depth == Depth::One {
                return Err(DavError::BadRequest("COPY 的 Depth 只能是 0 或 infinity".to_string()));
            }
            (release, depth)
        } else {
            let release = self.confirm_locks(parts, Some(&src), Some(&dst)).await?;
            if parse_depth(&parts.headers, Depth::Infinity)? != Depth::Infinity {
                return Err(DavError::BadRequest("MOVE 的 Depth 只能是 infinity".to_string()));
            }
            (release, Depth::Infinity)
        };

        let storage = &self.inner.storage;
        let src_obj = storage.resolve(&src).await?;
        let created = match storage.resolve(&dst).await {
            Err(StorageError::NotFound(_)) => true,
            Err(e) => return Err(e.into()),
            Ok(_) if !overwrite => return Err(DavError::PreconditionFailed),
            Ok(_) => {
                storage.remove(&dst).await?;
                self.inner.props.remove_tree(&dst);
                false
            }
        };
        let dst_parent = parent_path(&dst);
        match storage.resolve(&dst_parent).await {
            Ok(p) if p.is_dir => {}
            _ => return Err(DavError::Conflict(format!("目标父目录不存在: {}", dst_parent))),
        }

        if is_copy {
            if src_obj.is_dir && depth == Depth::Zero {
                storage.create_collection(&dst).await?;
                self.inner.props.copy_node(&src, &dst);
            } else {
                storage.copy(&src, &dst).await?;
                self.inner.props.copy_tree(&src, &dst);
            }
            info!("WebDAV 复制: {} -> {}", src, dst);
        } else {
            let new_name = base_name(&dst);
            if parent_path(&src) == dst_parent {
                storage.rename(&src, &new_name).await?;
            } else {
                storage.move_to(&src, &dst_parent).await?;
                if base_name(&src) != new_name {
                    storage
                        .rename(&join_path(&dst_parent, &base_name(&src)), &new_name)
                        .await?;
                }
            }
            self.inner.props.move_tree(&src, &dst);
            info!("WebDAV 移动: {} -> {}", src, dst);
        }
        storage.invalidate(&dst);

        let status = if created {
            StatusCode::CREATED
        } else {
            StatusCode::NO_CONTENT
        };
        Ok(status_response(status))
    }

    fn lock_timeout(&self, parts: &Parts) -> Result<Option<Duration>, DavError> {
        let requested = parse_timeout(header_value(&parts.headers, "timeout"))?;
        Ok(match (requested, self.inner.config.max_lock_timeout) {
            (_, None) => requested,
            (None, Some(max)) => Some(max),
            (Some(d), Some(max)) => Some(d.min(max)),
        })
    }

    fn lock_response(
        &self,
        status: StatusCode,
        token: &str,
        details: &LockDetails,
        with_token_header: bool,
    ) -> Result<Response, DavError> {
        let root_href = self.prop_ctx().href(&details.root, false);
        let mut builder = Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "application/xml; charset=utf-8");
        if with_token_header {
            builder = builder.header("Lock-Token", format!("<{}>", token));
        }
        build(builder, Body::from(lockdiscovery_xml(token, details, &root_href)))
    }

    async fn handle_lock(&self, parts: &Parts, body: Body) -> Result<Response, DavError> {
        let duration = self.lock_timeout(parts)?;
        let body = read_body(body).await?;
        let info = parse_lockinfo(&body)?;
        let now = Instant::now();
        let locks = &self.inner.locks;

        let Some(info) = info else {
            // 空请求体: 刷新 If 头中唯一的锁令牌
            let ih = parse_if_header(header_value(&parts.headers, "if"))
                .ok_or_else(|| DavError::BadRequest("刷新锁需要 If 头".to_string()))?;
            let token = match ih.lists.as_slice() {
                [list] if list.conditions.len() == 1 => list.conditions[0].token.clone(),
                _ => String::new(),
            };
            if token.is_empty() {
                return Err(DavError::BadRequest("刷新锁需要唯一的锁令牌".to_string()));
            }
            let details = match locks.refresh(now, &token, duration) {
                Ok(d) => d,
                Err(LockError::NoSuchLock) => return Err(DavError::PreconditionFailed),
                Err(e) => return Err(e.into()),
            };
            debug!("刷新锁: {}", token);
            return self.lock_response(StatusCode::OK, &token, &details, false);
        };

        let depth = parse_depth(&parts.headers, Depth::Infinity)?;
        if depth == Depth::One {
            return Err(DavError::BadRequest("LOCK 的 Depth 只能是 0 或 infinity".to_string()));
        }
        let path = self.resolve_path(parts)?;
        let details = LockDetails {
            root: path.clone(),
            duration,
            owner_xml: info.owner_xml,
            zero_depth: depth == Depth::Zero,
        };
        let token = locks.create(now, details.clone())?;

        let result = self.finish_lock(&path, &token, &details).await;
        if let Err(e) = &result {
            warn!("LOCK 后续处理失败，回滚锁 {}: {}", token, e);
            let _ = locks.unlock(now, &token);
        }
        result
    }

    /// 创建锁之后：目标不存在时创建空文件，然后写出锁信息
    async fn finish_lock(
        &self,
        path: &str,
        token: &str,
        details: &LockDetails,
    ) -> Result<Response, DavError> {
        let storage = &self.inner.storage;
        let created = match storage.resolve(path).await {
            Ok(_) => false,
            Err(StorageError::NotFound(_)) => {
                let empty: BoxReader = Box::pin(tokio::io::empty());
                let stream = SeekableStream::from_reader(base_name(path), 0, empty);
                let parent = parent_path(path);
                storage
                    .put_stream(&parent, stream, PutOptions::default())
                    .await?;
                storage.invalidate(path);
                storage.invalidate(&parent);
                true
            }
            Err(e) => return Err(e.into()),
        };
        let status = if created {
            StatusCode::CREATED
        } else {
            StatusCode::OK
        };
        info!("WebDAV 加锁: {} ({})", path, token);
        self.lock_response(status, token, details, true)
    }

    async fn handle_unlock(&self, parts: &Parts) -> Result<Response, DavError> {
        let value = header_value(&parts.headers, "lock-token");
        let token = value
            .strip_prefix('<')
            .and_then(|t| t.strip_suffix('>'))
            .ok_or_else(|| DavError::BadRequest(format!("无效的 Lock-Token: {}", value)))?;
        let path = self.resolve_path(parts)?;
        self.inner.locks.unlock_at(Instant::now(), token, &path)?;
        info!("WebDAV 解锁: {} ({})", path, token);
        Ok(status_response(StatusCode::NO_CONTENT))
    }

    /// 代理签名路由：校验签名后输出文件内容
    pub async fn serve_signed(
        &self,
        path: &str,
        sign: &str,
        method: &Method,
        headers: &HeaderMap,
    ) -> Result<Response, DavError> {
        let path = clean_path(path);
        let signer = self
            .inner
            .signer
            .as_ref()
            .ok_or_else(|| DavError::Forbidden("未启用签名代理".to_string()))?;
        signer
            .verify(&path, sign)
            .map_err(|e| DavError::Forbidden(e.to_string()))?;

        let storage = &self.inner.storage;
        let obj = storage.resolve(&path).await?;
        if obj.is_dir {
            return Err(DavError::MethodNotAllowed);
        }
        let meta = ContentMeta::from(&obj);
        let link = storage.link(&path, headers).await?;
        let stream = SeekableStream::from_link(obj.name.clone(), obj.size, &link, &self.inner.ctx.child())?
            .with_peek_limit(self.inner.config.peek_limit)
            .with_temp_dir(self.inner.config.temp_dir.clone());
        serve_content(method, headers, &meta, stream, &self.inner.config.seeker).await
    }

}

/// 读取 XML 请求体
pub(super) async fn read_body(body: Body) -> Result<String, DavError> {
    let bytes = axum::body::to_bytes(body, MAX_XML_BODY)
        .await
        .map_err(|e| DavError::BadRequest(format!("读取请求体失败: {}", e)))?;
    String::from_utf8(bytes.to_vec())
        .map_err(|_| DavError::BadRequest("请求体不是有效的 UTF-8".to_string()))
}
