//! 日志系统
//!
//! 控制台输出 + 文件持久化。文件按启动时间命名、按大小滚动，启动时清理过期文件：
//! `netdisk-dav.YYYY-MM-DD-HHMMSS.log`、`netdisk-dav.YYYY-MM-DD-HHMMSS_N.log`

use crate::config::LogConfig;
use chrono::{Local, NaiveDate};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// 日志文件名前缀
const LOG_PREFIX: &str = "netdisk-dav.";
const LOG_SUFFIX: &str = ".log";
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

struct RotatingState {
    /// 启动时间戳（YYYY-MM-DD-HHMMSS）
    stamp: String,
    dir: PathBuf,
    file: Option<File>,
    /// 0 为基础文件，之后递增
    index: u32,
    max_size: u64,
    written: u64,
}

impl RotatingState {
    fn file_path(&self) -> PathBuf {
        let name = match self.index {
            0 => format!("{}{}{}", LOG_PREFIX, self.stamp, LOG_SUFFIX),
            n => format!("{}{}_{}{}", LOG_PREFIX, self.stamp, n, LOG_SUFFIX),
        };
        self.dir.join(name)
    }

    fn open(&mut self) -> io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.file_path())?;
        self.written = file.metadata().map(|m| m.len()).unwrap_or(0);
        self.file = Some(file);
        Ok(())
    }

    fn rotate(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }
        self.index += 1;
        self.open()
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // 空文件不滚动，避免单条超大日志产生一串空文件
        if self.written > 0 && self.written + buf.len() as u64 > self.max_size {
            self.rotate()?;
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "日志文件未打开"))?;
        let n = file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }
}

/// 按大小滚动的日志文件写入器
///
/// 克隆共享同一个底层文件
#[derive(Clone)]
pub struct RotatingFile {
    state: Arc<Mutex<RotatingState>>,
}

impl RotatingFile {
    pub fn new(dir: impl Into<PathBuf>, max_size: u64) -> io::Result<Self> {
        Self::with_stamp(dir, max_size, Local::now().format("%Y-%m-%d-%H%M%S").to_string())
    }

    fn with_stamp(dir: impl Into<PathBuf>, max_size: u64, stamp: String) -> io::Result<Self> {
        let mut state = RotatingState {
            stamp,
            dir: dir.into(),
            file: None,
            index: 0,
            max_size: max_size.max(1),
            written: 0,
        };
        state.open()?;
        Ok(Self {
            state: Arc::new(Mutex::new(state)),
        })
    }

    /// 当前正在写入的文件
    pub fn current_path(&self) -> PathBuf {
        self.state.lock().file_path()
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.state.lock().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.state.lock().file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

/// 日志守卫，丢弃后后台写线程退出
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

fn console_only(filter: EnvFilter) -> LogGuard {
    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
                .with_ansi(true),
        )
        .init();
    LogGuard { _file_guard: None }
}

/// 初始化全局日志
///
/// `RUST_LOG` 优先于配置中的级别。文件层创建失败时回退到仅控制台输出。
pub fn init_logging(config: &LogConfig) -> LogGuard {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    if !config.enabled {
        let guard = console_only(filter);
        info!("日志系统初始化完成（仅控制台输出）");
        return guard;
    }

    let writer = fs::create_dir_all(&config.log_dir)
        .and_then(|_| RotatingFile::new(&config.log_dir, config.max_file_size));
    let writer = match writer {
        Ok(writer) => writer,
        Err(e) => {
            eprintln!("创建日志文件失败: {:?}, 错误: {}，回退到仅控制台输出", config.log_dir, e);
            return console_only(filter);
        }
    };
    let (non_blocking, guard) = tracing_appender::non_blocking(writer);

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
                .with_ansi(true),
        )
        .with(
            fmt::layer()
                .with_target(true)
                .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
                .with_ansi(false)
                .with_writer(non_blocking),
        )
        .init();

    info!(
        "日志系统初始化完成: 目录={:?}, 保留天数={}, 级别={}, 单文件最大={:.1}MB",
        config.log_dir,
        config.retention_days,
        config.level,
        config.max_file_size as f64 / 1024.0 / 1024.0
    );

    let removed = cleanup_old_logs(&config.log_dir, config.retention_days, Local::now().date_naive());
    if removed > 0 {
        info!("已清理 {} 个过期日志文件", removed);
    }

    LogGuard {
        _file_guard: Some(guard),
    }
}

/// 从日志文件名中取出日期，非本服务的日志返回 None
fn log_file_date(name: &str) -> Option<NaiveDate> {
    let stem = name.strip_prefix(LOG_PREFIX)?.strip_suffix(LOG_SUFFIX)?;
    let date = stem.get(..10)?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

fn modified_age_days(path: &Path) -> Option<i64> {
    let modified = fs::metadata(path).and_then(|m| m.modified()).ok()?;
    let age = SystemTime::now().duration_since(modified).ok()?;
    Some((age.as_secs() / 86_400) as i64)
}

/// 删除超过保留天数的日志文件，返回删除数量
///
/// 文件名里的日期解析失败时按修改时间判断
fn cleanup_old_logs(dir: &Path, retention_days: u32, today: NaiveDate) -> usize {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("读取日志目录失败: {:?}, 错误: {}", dir, e);
            return 0;
        }
    };

    let retention = retention_days as i64;
    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        if !name.starts_with(LOG_PREFIX) || !name.ends_with(LOG_SUFFIX) {
            continue;
        }

        let age = match log_file_date(name) {
            Some(date) => Some(today.signed_duration_since(date).num_days()),
            None => modified_age_days(&path),
        };
        if !matches!(age, Some(days) if days > retention) {
            continue;
        }

        match fs::remove_file(&path) {
            Ok(()) => {
                removed += 1;
                debug!("已删除过期日志文件: {:?}", path);
            }
            Err(e) => warn!("删除过期日志文件失败: {:?}, 错误: {}", path, e),
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_log_config() {
        let config = LogConfig::default();
        assert!(config.enabled);
        assert_eq!(config.log_dir, PathBuf::from("logs"));
        assert_eq!(config.retention_days, 7);
        assert_eq!(config.level, "info");
    }

    #[test]
    fn test_log_file_date() {
        let d = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        assert_eq!(log_file_date("netdisk-dav.2024-03-09.log"), Some(d));
        assert_eq!(log_file_date("netdisk-dav.2024-03-09-101500.log"), Some(d));
        assert_eq!(log_file_date("netdisk-dav.2024-03-09-101500_3.log"), Some(d));
        assert_eq!(log_file_date("netdisk-dav.garbage.log"), None);
        assert_eq!(log_file_date("other.2024-03-09.log"), None);
    }

    #[test]
    fn test_rotation_by_size() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = RotatingFile::with_stamp(dir.path(), 10, "2024-03-09-101500".into()).unwrap();
        file.write_all(b"12345678").unwrap();
        assert!(file.current_path().ends_with("netdisk-dav.2024-03-09-101500.log"));
        file.write_all(b"abcdef").unwrap();
        assert!(file.current_path().ends_with("netdisk-dav.2024-03-09-101500_1.log"));
        // 单条超过上限也写进当前空文件
        file.write_all(b"0123456789abcdef").unwrap();
        assert!(file.current_path().ends_with("netdisk-dav.2024-03-09-101500_2.log"));
        file.flush().unwrap();

        let base = fs::read(dir.path().join("netdisk-dav.2024-03-09-101500.log")).unwrap();
        assert_eq!(base, b"12345678");
        let first = fs::read(dir.path().join("netdisk-dav.2024-03-09-101500_1.log")).unwrap();
        assert_eq!(first, b"abcdef");
    }

    #[test]
    fn test_cleanup_old_logs() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "netdisk-dav.2024-01-01-000000.log",
            "netdisk-dav.2024-01-01-000000_1.log",
            "netdisk-dav.2024-03-08-120000.log",
            "unrelated.2024-01-01.log",
        ] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }
        let today = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        assert_eq!(cleanup_old_logs(dir.path(), 7, today), 2);
        assert!(dir.path().join("netdisk-dav.2024-03-08-120000.log").exists());
        assert!(dir.path().join("unrelated.2024-01-01.log").exists());
    }
}
