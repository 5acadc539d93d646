//! 传输进度上报

use std::sync::Arc;

/// 每累积 256KB 回调一次（减少回调方的锁竞争）
pub const PROGRESS_UPDATE_THRESHOLD: u64 = 256 * 1024;

/// 进度回调: (已传输字节数, 总大小)，总大小未知时为负数
pub type ProgressCallback = Arc<dyn Fn(u64, i64) + Send + Sync>;

/// 批量进度上报器
pub struct ProgressTracker {
    total: i64,
    transferred: u64,
    pending: u64,
    callback: ProgressCallback,
}

impl ProgressTracker {
    pub fn new(total: i64, callback: ProgressCallback) -> Self {
        Self {
            total,
            transferred: 0,
            pending: 0,
            callback,
        }
    }

    /// 记录新传输的字节数，累积到阈值或传输完毕时回调
    pub fn advance(&mut self, n: u64) {
        self.transferred += n;
        self.pending += n;
        let reached_end = self.total >= 0 && self.transferred >= self.total as u64;
        if self.pending >= PROGRESS_UPDATE_THRESHOLD || reached_end {
            self.flush();
        }
    }

    /// 上报剩余的进度
    pub fn flush(&mut self) {
        if self.pending > 0 {
            self.pending = 0;
            (self.callback)(self.transferred, self.total);
        }
    }

    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    /// 修正总大小
    pub fn set_total(&mut self, total: i64) {
        self.total = total;
    }
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("total", &self.total)
            .field("transferred", &self.transferred)
            .finish()
    }
}
