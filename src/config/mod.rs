//! 配置管理模块

use crate::downloader::{DownloaderConfig, DEFAULT_CHUNK_SIZE};
use crate::storage::LinkMode;
use crate::stream::positioned::{DEFAULT_HEAD_CACHE, DEFAULT_MAX_CURSORS, DEFAULT_MAX_SKIP};
use crate::stream::{SeekerOptions, DEFAULT_PEEK_LIMIT};
use crate::webdav::DavConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

const MB: u64 = 1024 * 1024;

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// 服务器配置
    #[serde(default)]
    pub server: ServerConfig,
    /// WebDAV 配置
    #[serde(default)]
    pub webdav: WebDavConfig,
    /// 流层配置
    #[serde(default)]
    pub stream: StreamConfig,
    /// 分片下载配置
    #[serde(default)]
    pub download: DownloadConfig,
    /// 代理链接签名
    #[serde(default)]
    pub sign: SignConfig,
    /// 挂载的存储
    #[serde(default)]
    pub mounts: Vec<MountConfig>,
    /// 🔥 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 监听地址
    pub host: String,
    /// 监听端口
    pub port: u16,
    /// CORS允许的源，为空时允许任意来源
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5244,
            cors_origins: Vec::new(),
        }
    }
}

/// WebDAV 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebDavConfig {
    /// URL 前缀
    #[serde(default = "default_dav_prefix")]
    pub prefix: String,
    /// 用户根目录
    #[serde(default = "default_user_root")]
    pub user_root: String,
    /// 锁的最长有效期（秒），0 表示不限制
    #[serde(default)]
    pub max_lock_timeout_secs: u64,
}

fn default_dav_prefix() -> String {
    "/dav".to_string()
}

fn default_user_root() -> String {
    "/".to_string()
}

impl Default for WebDavConfig {
    fn default() -> Self {
        Self {
            prefix: default_dav_prefix(),
            user_root: default_user_root(),
            max_lock_timeout_secs: 0,
        }
    }
}

/// 流层配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// 预读缓冲区上限 (MB)
    #[serde(default = "default_peek_buffer_mb")]
    pub peek_buffer_mb: u64,
    /// 游标向前丢弃跳读的最大距离 (KB)
    #[serde(default = "default_max_skip_kb")]
    pub max_skip_kb: u64,
    /// 文件头缓存大小 (KB)
    #[serde(default = "default_head_cache_kb")]
    pub head_cache_kb: u64,
    /// 最多同时打开的范围读取游标
    #[serde(default = "default_max_cursors")]
    pub max_cursors: usize,
    /// 物化临时文件目录，不设置时使用系统临时目录
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,
    /// 目录列表缓存有效期（秒）
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

fn default_peek_buffer_mb() -> u64 {
    DEFAULT_PEEK_LIMIT as u64 / MB
}

fn default_max_skip_kb() -> u64 {
    DEFAULT_MAX_SKIP / 1024
}

fn default_head_cache_kb() -> u64 {
    DEFAULT_HEAD_CACHE as u64 / 1024
}

fn default_max_cursors() -> usize {
    DEFAULT_MAX_CURSORS
}

fn default_cache_ttl_secs() -> u64 {
    30
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            peek_buffer_mb: default_peek_buffer_mb(),
            max_skip_kb: default_max_skip_kb(),
            head_cache_kb: default_head_cache_kb(),
            max_cursors: default_max_cursors(),
            temp_dir: None,
            cache_ttl_secs: default_cache_ttl_secs(),
        }
    }
}

impl StreamConfig {
    pub fn peek_limit(&self) -> usize {
        (self.peek_buffer_mb * MB) as usize
    }

    pub fn seeker_options(&self) -> SeekerOptions {
        SeekerOptions {
            max_skip: self.max_skip_kb * 1024,
            head_cache: (self.head_cache_kb * 1024) as usize,
            max_cursors: self.max_cursors,
        }
    }
}

/// 分片下载配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// 同时在途的分片数
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// 分片大小 (MB)
    #[serde(default = "default_part_size_mb")]
    pub part_size_mb: u64,
    /// 单个分片的最大重试次数
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 单个分片超时（秒）
    #[serde(default = "default_part_timeout_secs")]
    pub part_timeout_secs: u64,
    /// HTTP 连接超时（秒）
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_concurrency() -> usize {
    DownloaderConfig::default().concurrency
}

fn default_part_size_mb() -> u64 {
    DEFAULT_CHUNK_SIZE / MB
}

fn default_max_retries() -> u32 {
    DownloaderConfig::default().max_retries
}

fn default_part_timeout_secs() -> u64 {
    DownloaderConfig::default().part_timeout.as_secs()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            part_size_mb: default_part_size_mb(),
            max_retries: default_max_retries(),
            part_timeout_secs: default_part_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl From<&DownloadConfig> for DownloaderConfig {
    fn from(config: &DownloadConfig) -> Self {
        Self {
            concurrency: config.concurrency,
            part_size: config.part_size_mb * MB,
            max_retries: config.max_retries,
            part_timeout: Duration::from_secs(config.part_timeout_secs),
        }
    }
}

/// 代理链接签名配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignConfig {
    /// 是否启用签名代理
    #[serde(default = "default_sign_enabled")]
    pub enabled: bool,
    /// 签名密钥，首次启动时随机生成
    #[serde(default = "default_sign_secret")]
    pub secret: String,
    /// 签名有效期（秒），0 表示永不过期
    #[serde(default = "default_sign_expiry_secs")]
    pub expiry_secs: u64,
}

fn default_sign_enabled() -> bool {
    true
}

fn default_sign_secret() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn default_sign_expiry_secs() -> u64 {
    3600
}

impl Default for SignConfig {
    fn default() -> Self {
        Self {
            enabled: default_sign_enabled(),
            secret: default_sign_secret(),
            expiry_secs: default_sign_expiry_secs(),
        }
    }
}

/// 一个本地目录挂载
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountConfig {
    /// 挂载到的虚拟路径
    pub path: String,
    /// 本地根目录
    pub root: PathBuf,
    /// 读取文件时的链接模式
    #[serde(default)]
    pub link_mode: LinkMode,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            webdav: WebDavConfig::default(),
            stream: StreamConfig::default(),
            download: DownloadConfig::default(),
            sign: SignConfig::default(),
            mounts: vec![MountConfig {
                path: "/".to_string(),
                root: PathBuf::from("data"),
                link_mode: LinkMode::Proxy,
            }],
            log: LogConfig::default(),
        }
    }
}

impl AppConfig {
    /// 校验配置的一致性
    pub fn validate(&self) -> Result<()> {
        if !self.webdav.prefix.is_empty() && !self.webdav.prefix.starts_with('/') {
            anyhow::bail!("webdav.prefix 必须以 / 开头: {}", self.webdav.prefix);
        }
        if !self.webdav.user_root.starts_with('/') {
            anyhow::bail!("webdav.user_root 必须以 / 开头: {}", self.webdav.user_root);
        }
        if self.download.concurrency == 0 {
            anyhow::bail!("download.concurrency 必须大于 0");
        }
        if self.download.part_size_mb == 0 {
            anyhow::bail!("download.part_size_mb 必须大于 0");
        }
        if self.stream.max_cursors == 0 {
            anyhow::bail!("stream.max_cursors 必须大于 0");
        }
        if self.sign.enabled && self.sign.secret.is_empty() {
            anyhow::bail!("启用签名代理时 sign.secret 不能为空");
        }
        if self.mounts.is_empty() {
            anyhow::bail!("至少需要配置一个挂载");
        }
        let mut seen = std::collections::HashSet::new();
        for mount in &self.mounts {
            if !mount.path.starts_with('/') {
                anyhow::bail!("挂载路径必须以 / 开头: {}", mount.path);
            }
            if !seen.insert(crate::storage::clean_path(&mount.path)) {
                anyhow::bail!("挂载路径重复: {}", mount.path);
            }
        }
        Ok(())
    }

    /// WebDAV 处理器配置
    pub fn dav_config(&self) -> DavConfig {
        DavConfig {
            prefix: self.webdav.prefix.clone(),
            user_root: self.webdav.user_root.clone(),
            max_lock_timeout: (self.webdav.max_lock_timeout_secs > 0)
                .then(|| Duration::from_secs(self.webdav.max_lock_timeout_secs)),
            peek_limit: self.stream.peek_limit(),
            temp_dir: self.stream.temp_dir.clone(),
            seeker: self.stream.seeker_options(),
            ..DavConfig::default()
        }
    }

    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;
        config.validate().context("配置文件校验失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.validate().context("保存配置失败")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);
        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                let default_config = Self::default();

                // 首次启动：自动创建默认挂载目录
                for mount in &default_config.mounts {
                    if mount.root.exists() {
                        continue;
                    }
                    match std::fs::create_dir_all(&mount.root) {
                        Ok(()) => tracing::info!("✓ 已创建挂载目录: {:?}", mount.root),
                        Err(e) => tracing::error!("无法创建挂载目录 {:?}: {}", mount.root, e),
                    }
                }

                // 配置文件已存在但无效时不覆盖
                if !std::path::Path::new(path).exists() {
                    if let Err(e) = default_config.save_to_file(path).await {
                        tracing::error!("保存默认配置失败: {}", e);
                    }
                }

                default_config
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 5244);
        assert_eq!(config.webdav.prefix, "/dav");
        assert_eq!(config.stream.peek_limit(), DEFAULT_PEEK_LIMIT);
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_str().unwrap();

        let mut config = AppConfig::default();
        config.download.concurrency = 7;
        config.mounts.push(MountConfig {
            path: "/cloud".to_string(),
            root: PathBuf::from("/srv/cloud"),
            link_mode: LinkMode::Redirect,
        });
        config.save_to_file(path).await.unwrap();

        let loaded = AppConfig::load_from_file(path).await.unwrap();
        assert_eq!(loaded.server.port, config.server.port);
        assert_eq!(loaded.download.concurrency, 7);
        assert_eq!(loaded.mounts.len(), 2);
        assert_eq!(loaded.mounts[1].link_mode, LinkMode::Redirect);
        assert_eq!(loaded.sign.secret, config.sign.secret);
    }

    #[tokio::test]
    async fn test_partial_file_uses_defaults() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_str().unwrap();
        std::fs::write(
            path,
            r#"
[server]
host = "127.0.0.1"
port = 8080

[[mounts]]
path = "/"
root = "/data"
link_mode = "signed_proxy"
"#,
        )
        .unwrap();

        let config = AppConfig::load_from_file(path).await.unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.webdav.user_root, "/");
        assert_eq!(config.stream.max_cursors, DEFAULT_MAX_CURSORS);
        assert_eq!(config.mounts[0].link_mode, LinkMode::SignedProxy);
        assert!(!config.sign.secret.is_empty());
    }

    #[tokio::test]
    async fn test_save_creates_parent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config").join("app.toml");
        let path = path.to_str().unwrap();

        let config = AppConfig::default();
        config.save_to_file(path).await.unwrap();
        let reloaded = AppConfig::load_from_file(path).await.unwrap();
        assert_eq!(reloaded.sign.secret, config.sign.secret);
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.webdav.prefix = "dav".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.download.concurrency = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.mounts.clear();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.mounts.push(MountConfig {
            path: "//".to_string(),
            root: PathBuf::from("x"),
            link_mode: LinkMode::Proxy,
        });
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.sign.secret.clear();
        assert!(config.validate().is_err());
        config.sign.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_conversions() {
        let mut config = AppConfig::default();
        config.download.part_size_mb = 2;
        config.download.part_timeout_secs = 5;
        let downloader = DownloaderConfig::from(&config.download);
        assert_eq!(downloader.part_size, 2 * MB);
        assert_eq!(downloader.part_timeout, Duration::from_secs(5));

        config.stream.head_cache_kb = 128;
        assert_eq!(config.stream.seeker_options().head_cache, 128 * 1024);

        config.webdav.max_lock_timeout_secs = 300;
        let dav = config.dav_config();
        assert_eq!(dav.max_lock_timeout, Some(Duration::from_secs(300)));
        assert_eq!(dav.proxy_prefix, "/p");
        assert_eq!(dav.seeker.head_cache, 128 * 1024);
    }
}
