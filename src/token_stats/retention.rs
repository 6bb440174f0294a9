//! 日志保留策略与清理

use rusqlite::Transaction;
use serde::{Deserialize, Serialize};

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// 保留配置（随应用设置持久化）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionConfig {
    /// 保留天数，超过的日志会被删除
    #[serde(default)]
    pub retention_days: Option<u32>,
    /// 最大保留条数，超出时删除最旧的日志
    #[serde(default)]
    pub max_log_count: Option<u32>,
    /// 是否启用定期自动清理
    #[serde(default = "default_auto_cleanup")]
    pub auto_cleanup_enabled: bool,
}

fn default_auto_cleanup() -> bool {
    true
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            retention_days: Some(30),
            max_log_count: Some(100_000),
            auto_cleanup_enabled: default_auto_cleanup(),
        }
    }
}

impl RetentionConfig {
    pub fn policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            retention_days: self.retention_days,
            max_log_count: self.max_log_count,
        }
    }
}

/// 单次清理使用的限制
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetentionPolicy {
    pub retention_days: Option<u32>,
    pub max_log_count: Option<u32>,
}

impl RetentionPolicy {
    pub fn new(retention_days: Option<u32>, max_log_count: Option<u32>) -> Self {
        Self {
            retention_days,
            max_log_count,
        }
    }

    /// 两个限制都未设置
    pub fn is_unbounded(&self) -> bool {
        self.retention_days.is_none() && self.max_log_count.is_none()
    }
}

/// 配置来源（由应用设置实现）
///
/// 定时清理每次触发时重新读取，配置变更无需通知。
pub trait RetentionConfigProvider: Send + Sync {
    fn retention_config(&self) -> RetentionConfig;

    /// 替换保留配置（实现方负责持久化）
    fn update_retention_config(&self, config: RetentionConfig) -> anyhow::Result<()>;
}

impl RetentionConfigProvider for parking_lot::RwLock<RetentionConfig> {
    fn retention_config(&self) -> RetentionConfig {
        self.read().clone()
    }

    fn update_retention_config(&self, config: RetentionConfig) -> anyhow::Result<()> {
        *self.write() = config;
        Ok(())
    }
}

/// 在事务内执行清理，返回删除行数
///
/// 先按时间删除，再按数量删除最旧的记录（timestamp 升序，同时间按 id）。
pub(crate) fn purge(tx: &Transaction<'_>, policy: &RetentionPolicy, now_ms: i64) -> rusqlite::Result<usize> {
    let mut deleted = 0;

    if let Some(days) = policy.retention_days {
        let cutoff = now_ms.saturating_sub(days as i64 * DAY_MS);
        deleted += tx.execute("DELETE FROM token_logs WHERE timestamp < ?1", [cutoff])?;
    }

    if let Some(max_count) = policy.max_log_count {
        let count: i64 = tx.query_row("SELECT COUNT(*) FROM token_logs", [], |row| row.get(0))?;
        let excess = count - max_count as i64;
        if excess > 0 {
            deleted += tx.execute(
                "DELETE FROM token_logs WHERE id IN (
                    SELECT id FROM token_logs ORDER BY timestamp ASC, id ASC LIMIT ?1
                )",
                [excess],
            )?;
        }
    }

    Ok(deleted)
}
