//! 写入路径健康状态
//!
//! 写入路径上的错误不会传播给代理，只在这里累计，供运维界面轮询。

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use super::model::now_millis;

#[derive(Debug, Clone)]
struct LastError {
    message: String,
    at: i64,
}

/// 健康状态计数器
#[derive(Debug, Default)]
pub struct HealthTracker {
    batches_committed: AtomicU64,
    records_written: AtomicU64,
    batches_failed: AtomicU64,
    /// 批量写入失败丢失的记录数
    records_lost: AtomicU64,
    /// 通道已满或已关闭时丢弃的记录数
    records_dropped: AtomicU64,
    checkpoint_failures: AtomicU64,
    cleanup_failures: AtomicU64,
    /// 连续失败的批次数，成功写入后归零
    consecutive_batch_failures: AtomicU64,
    last_flush_at: AtomicU64,
    last_error: Mutex<Option<LastError>>,
}

/// 健康状态快照
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub healthy: bool,
    pub batches_committed: u64,
    pub records_written: u64,
    pub batches_failed: u64,
    pub records_lost: u64,
    pub records_dropped: u64,
    pub checkpoint_failures: u64,
    pub cleanup_failures: u64,
    pub last_flush_at: Option<i64>,
    pub last_error: Option<String>,
    pub last_error_at: Option<i64>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batch_committed(&self, count: usize) {
        self.batches_committed.fetch_add(1, Ordering::Relaxed);
        self.records_written.fetch_add(count as u64, Ordering::Relaxed);
        self.consecutive_batch_failures.store(0, Ordering::Relaxed);
        self.last_flush_at.store(now_millis() as u64, Ordering::Relaxed);
    }

    pub fn batch_failed(&self, count: usize, error: &str) {
        self.batches_failed.fetch_add(1, Ordering::Relaxed);
        self.records_lost.fetch_add(count as u64, Ordering::Relaxed);
        self.consecutive_batch_failures.fetch_add(1, Ordering::Relaxed);
        self.set_error(format!("批量写入失败（丢弃 {} 条）: {}", count, error));
    }

    pub fn record_dropped(&self) {
        self.records_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn checkpoint_failed(&self, error: &str) {
        self.checkpoint_failures.fetch_add(1, Ordering::Relaxed);
        self.set_error(format!("WAL checkpoint 失败: {}", error));
    }

    pub fn cleanup_failed(&self, error: &str) {
        self.cleanup_failures.fetch_add(1, Ordering::Relaxed);
        self.set_error(format!("日志清理失败: {}", error));
    }

    fn set_error(&self, message: String) {
        *self.last_error.lock() = Some(LastError {
            message,
            at: now_millis(),
        });
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let last_error = self.last_error.lock().clone();
        let last_flush_at = self.last_flush_at.load(Ordering::Relaxed);
        HealthSnapshot {
            healthy: self.consecutive_batch_failures.load(Ordering::Relaxed) == 0,
            batches_committed: self.batches_committed.load(Ordering::Relaxed),
            records_written: self.records_written.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            records_lost: self.records_lost.load(Ordering::Relaxed),
            records_dropped: self.records_dropped.load(Ordering::Relaxed),
            checkpoint_failures: self.checkpoint_failures.load(Ordering::Relaxed),
            cleanup_failures: self.cleanup_failures.load(Ordering::Relaxed),
            last_flush_at: (last_flush_at > 0).then_some(last_flush_at as i64),
            last_error: last_error.as_ref().map(|e| e.message.clone()),
            last_error_at: last_error.map(|e| e.at),
        }
    }
}
