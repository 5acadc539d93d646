//! 应用状态

use crate::common::{BufferPool, DEFAULT_COPY_BUFFER_SIZE};
use crate::config::AppConfig;
use crate::downloader::DownloaderConfig;
use crate::sign::LinkSigner;
use crate::storage::{LocalStorage, MountTable, Storage};
use crate::stream::LinkContext;
use crate::webdav::{DavHandler, LockManager};
use anyhow::Context;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// 配置文件路径
pub const CONFIG_PATH: &str = "config/app.toml";

/// 复用缓冲区个数上限
const POOL_MAX_IDLE: usize = 32;

/// 应用全局状态
#[derive(Clone)]
pub struct AppState {
    /// 应用配置（启动后只读）
    pub config: Arc<AppConfig>,
    /// WebDAV 处理器
    pub dav: DavHandler,
    /// 全局取消令牌，关闭时中止所有进行中的上游下载
    pub shutdown: CancellationToken,
}

impl AppState {
    /// 从默认配置文件创建应用状态
    pub async fn new() -> anyhow::Result<Self> {
        let config = AppConfig::load_or_default(CONFIG_PATH).await;
        Self::from_config(config)
    }

    /// 按给定配置组装存储、锁表和处理器
    pub fn from_config(config: AppConfig) -> anyhow::Result<Self> {
        config.validate()?;

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.download.connect_timeout_secs))
            .build()
            .context("创建 HTTP 客户端失败")?;
        let downloader = DownloaderConfig::from(&config.download);
        let pool = BufferPool::new(DEFAULT_COPY_BUFFER_SIZE, POOL_MAX_IDLE);
        let shutdown = CancellationToken::new();
        let ctx = LinkContext::new(client, pool, downloader, shutdown.clone());

        let mut table = MountTable::new(ctx.clone(), Duration::from_secs(config.stream.cache_ttl_secs))
            .with_temp_dir(config.stream.temp_dir.clone());
        for mount in &config.mounts {
            let storage: Arc<dyn Storage> = Arc::new(LocalStorage::new(&mount.root, mount.link_mode));
            table.mount(&mount.path, storage);
            info!("挂载 {} -> {:?} ({:?})", mount.path, mount.root, mount.link_mode);
        }

        let mut dav = DavHandler::new(config.dav_config(), Arc::new(table), LockManager::new(), ctx);
        if config.sign.enabled {
            dav = dav.with_signer(LinkSigner::new(
                config.sign.secret.clone(),
                Duration::from_secs(config.sign.expiry_secs),
            ));
        }

        Ok(Self {
            config: Arc::new(config),
            dav,
            shutdown,
        })
    }

    /// 优雅关闭：取消所有进行中的上游请求
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        info!("已取消所有进行中的上游请求");
    }
}
