//! WAL checkpoint 调度
//!
//! 不同触发点使用不同强度的 checkpoint：
//! - 每批写入后：PASSIVE（不阻塞读者）
//! - 清理后 / 定期维护 / 关闭：TRUNCATE（回收 WAL 文件空间）
//! - 手动：调用方指定

use std::str::FromStr;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use super::error::StatsError;

/// SQLite `wal_checkpoint` 模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointMode {
    Passive,
    Full,
    Restart,
    Truncate,
}

impl CheckpointMode {
    fn pragma_arg(&self) -> &'static str {
        match self {
            CheckpointMode::Passive => "PASSIVE",
            CheckpointMode::Full => "FULL",
            CheckpointMode::Restart => "RESTART",
            CheckpointMode::Truncate => "TRUNCATE",
        }
    }
}

impl FromStr for CheckpointMode {
    type Err = StatsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "passive" => Ok(CheckpointMode::Passive),
            "full" => Ok(CheckpointMode::Full),
            "restart" => Ok(CheckpointMode::Restart),
            "truncate" => Ok(CheckpointMode::Truncate),
            _ => Err(StatsError::InvalidQuery(format!("未知的 checkpoint 模式: {}", s))),
        }
    }
}

/// checkpoint 触发点
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointTrigger {
    /// 批量写入提交后
    AfterBatch,
    /// 清理删除了数据后
    AfterCleanup,
    /// 定期维护计时器
    Maintenance,
    /// 进程关闭
    Shutdown,
}

impl CheckpointTrigger {
    pub fn mode(&self) -> CheckpointMode {
        match self {
            CheckpointTrigger::AfterBatch => CheckpointMode::Passive,
            CheckpointTrigger::AfterCleanup
            | CheckpointTrigger::Maintenance
            | CheckpointTrigger::Shutdown => CheckpointMode::Truncate,
        }
    }
}

/// checkpoint 执行结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointReport {
    pub mode: CheckpointMode,
    /// 有读写者占用导致未能完成
    pub busy: bool,
    /// WAL 中的帧数
    pub log_frames: i64,
    /// 已回写到主文件的帧数
    pub checkpointed_frames: i64,
}

/// 在给定连接上执行 checkpoint
pub fn run_checkpoint(conn: &Connection, mode: CheckpointMode) -> rusqlite::Result<CheckpointReport> {
    let sql = format!("PRAGMA wal_checkpoint({})", mode.pragma_arg());
    let report = conn.query_row(&sql, [], |row| {
        Ok(CheckpointReport {
            mode,
            busy: row.get::<_, i64>(0)? != 0,
            log_frames: row.get(1)?,
            checkpointed_frames: row.get(2)?,
        })
    })?;

    if report.busy {
        tracing::warn!(
            mode = mode.pragma_arg(),
            log_frames = report.log_frames,
            checkpointed = report.checkpointed_frames,
            "WAL checkpoint 未完成（数据库忙）"
        );
    } else {
        tracing::debug!(
            mode = mode.pragma_arg(),
            log_frames = report.log_frames,
            checkpointed = report.checkpointed_frames,
            "WAL checkpoint 完成"
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_modes() {
        assert_eq!(CheckpointTrigger::AfterBatch.mode(), CheckpointMode::Passive);
        assert_eq!(CheckpointTrigger::AfterCleanup.mode(), CheckpointMode::Truncate);
        assert_eq!(CheckpointTrigger::Maintenance.mode(), CheckpointMode::Truncate);
        assert_eq!(CheckpointTrigger::Shutdown.mode(), CheckpointMode::Truncate);
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!("TRUNCATE".parse::<CheckpointMode>().unwrap(), CheckpointMode::Truncate);
        assert_eq!("passive".parse::<CheckpointMode>().unwrap(), CheckpointMode::Passive);
        assert!("vacuum".parse::<CheckpointMode>().is_err());
    }

    #[test]
    fn test_truncate_empties_wal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.db");
        let conn = Connection::open(&path).unwrap();
        conn.pragma_update(None, "journal_mode", "WAL").unwrap();
        conn.execute_batch(
            "CREATE TABLE t (v INTEGER);
             INSERT INTO t VALUES (1), (2), (3);",
        )
        .unwrap();

        let passive = run_checkpoint(&conn, CheckpointMode::Passive).unwrap();
        assert!(!passive.busy);
        assert!(passive.log_frames > 0);

        let truncate = run_checkpoint(&conn, CheckpointMode::Truncate).unwrap();
        assert!(!truncate.busy);
        assert_eq!(truncate.log_frames, 0);

        let wal_len = std::fs::metadata(dir.path().join("wal.db-wal"))
            .map(|m| m.len())
            .unwrap_or(0);
        assert_eq!(wal_len, 0);
    }
}
