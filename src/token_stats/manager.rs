//! Token 统计服务入口
//!
//! 代理侧只调用 [`TokenStats::record`]，该方法不阻塞、不返回错误。
//! 查询、清理、checkpoint 在阻塞线程池上执行，与写入任务通过 SQLite WAL 并发。

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{OnceCell, mpsc, oneshot};
use tokio::task::JoinHandle;

use super::checkpoint::{CheckpointMode, CheckpointReport, CheckpointTrigger};
use super::error::{Result, StatsError};
use super::health::{HealthSnapshot, HealthTracker};
use super::model::{LogRecord, ToolType, now_millis};
use super::retention::RetentionPolicy;
use super::session::{SessionActivity, SessionRegistry};
use super::store::TokenStatsStore;
use super::types::{
    CleanupReport, CostSummary, CostSummaryQuery, DatabaseSummary, LogPage, LogQuery,
    SessionStats, TrendBucket, TrendQuery,
};
use super::writer::{BatchOptions, BatchWriter, WriterCommand};

/// Token 统计服务
pub struct TokenStats {
    store: Arc<TokenStatsStore>,
    sender: mpsc::Sender<WriterCommand>,
    health: Arc<HealthTracker>,
    sessions: Arc<SessionRegistry>,
    accepting: AtomicBool,
    writer_task: Mutex<Option<JoinHandle<()>>>,
    shutdown_done: OnceCell<()>,
}

impl TokenStats {
    /// 打开数据库并启动批量写入任务（需在 tokio 运行时内调用）
    pub fn open(db_path: impl AsRef<Path>, options: BatchOptions) -> Result<Self> {
        let store = Arc::new(TokenStatsStore::open(db_path)?);
        let health = Arc::new(HealthTracker::new());
        let (sender, handle) = BatchWriter::spawn(store.clone(), health.clone(), options);

        Ok(Self {
            store,
            sender,
            health,
            sessions: Arc::new(SessionRegistry::new()),
            accepting: AtomicBool::new(true),
            writer_task: Mutex::new(Some(handle)),
            shutdown_done: OnceCell::new(),
        })
    }

    /// 记录一条日志（非阻塞）
    ///
    /// 队列已满或服务已关闭时丢弃并计数，不影响调用方。
    pub fn record(&self, record: LogRecord) {
        if !self.accepting.load(Ordering::Acquire) {
            self.health.record_dropped();
            tracing::warn!(session_id = %record.session_id, "Token 统计已关闭，丢弃记录");
            return;
        }

        match self.sender.try_reserve() {
            Ok(permit) => {
                self.sessions.observe(&record);
                permit.send(WriterCommand::Record(record));
            }
            Err(TrySendError::Full(())) => {
                self.health.record_dropped();
                tracing::warn!(session_id = %record.session_id, "Token 日志队列已满，丢弃记录");
            }
            Err(TrySendError::Closed(())) => {
                self.health.record_dropped();
                tracing::warn!(session_id = %record.session_id, "Token 写入任务已停止，丢弃记录");
            }
        }
    }

    /// 等待此前提交的记录全部写入
    pub async fn flush(&self) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.sender
            .send(WriterCommand::Flush(ack))
            .await
            .map_err(|_| StatsError::Closed)?;
        done.await.map_err(|_| StatsError::Closed)
    }

    pub async fn query_logs(&self, query: LogQuery) -> Result<LogPage> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.query_logs(&query)).await?
    }

    pub async fn session_stats(&self, tool_type: ToolType, session_id: String) -> Result<SessionStats> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.session_stats(tool_type, &session_id)).await?
    }

    pub async fn database_summary(&self) -> Result<DatabaseSummary> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.summary()).await?
    }

    pub async fn query_trends(&self, query: TrendQuery) -> Result<Vec<TrendBucket>> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.query_trends(&query)).await?
    }

    pub async fn query_cost_summary(&self, query: CostSummaryQuery) -> Result<CostSummary> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.query_cost_summary(&query)).await?
    }

    /// 按给定限制立即清理
    pub async fn cleanup_now(
        &self,
        retention_days: Option<u32>,
        max_log_count: Option<u32>,
    ) -> Result<CleanupReport> {
        self.cleanup(RetentionPolicy::new(retention_days, max_log_count))
            .await
    }

    /// 执行一次清理；有删除时紧接 TRUNCATE checkpoint 回收 WAL
    pub async fn cleanup(&self, policy: RetentionPolicy) -> Result<CleanupReport> {
        if policy.is_unbounded() {
            tracing::warn!("未配置保留天数或最大条数，跳过清理");
            return Ok(CleanupReport {
                rows_deleted: 0,
                no_bounds_configured: true,
                checkpoint: None,
            });
        }

        let store = self.store.clone();
        let health = self.health.clone();
        let result = tokio::task::spawn_blocking(move || {
            let deleted = store.cleanup(&policy, now_millis())?;
            let checkpoint = if deleted > 0 {
                match store.checkpoint(CheckpointTrigger::AfterCleanup.mode()) {
                    Ok(report) => Some(report),
                    Err(e) => {
                        tracing::error!(error = %e, "清理后 TRUNCATE checkpoint 失败");
                        health.checkpoint_failed(&e.to_string());
                        None
                    }
                }
            } else {
                None
            };
            Ok::<_, StatsError>((deleted, checkpoint))
        })
        .await?;

        match result {
            Ok((deleted, checkpoint)) => {
                tracing::info!(
                    rows_deleted = deleted,
                    retention_days = ?policy.retention_days,
                    max_log_count = ?policy.max_log_count,
                    "Token 日志清理完成"
                );
                Ok(CleanupReport {
                    rows_deleted: deleted,
                    no_bounds_configured: false,
                    checkpoint,
                })
            }
            Err(e) => {
                tracing::error!(error = %e, "Token 日志清理失败");
                self.health.cleanup_failed(&e.to_string());
                Err(e)
            }
        }
    }

    /// 手动 checkpoint（维护连接）
    pub async fn checkpoint(&self, mode: CheckpointMode) -> Result<CheckpointReport> {
        let store = self.store.clone();
        let result = tokio::task::spawn_blocking(move || store.checkpoint(mode)).await?;
        if let Err(e) = &result {
            if !matches!(e, StatsError::Closed) {
                self.health.checkpoint_failed(&e.to_string());
            }
        }
        result
    }

    pub fn health(&self) -> HealthSnapshot {
        self.health.snapshot()
    }

    pub fn active_sessions(&self, tool_type: Option<ToolType>) -> Vec<SessionActivity> {
        self.sessions.active_sessions(tool_type)
    }

    pub fn session_activity(&self, tool_type: ToolType, session_id: &str) -> Option<SessionActivity> {
        self.sessions.get(tool_type, session_id)
    }

    /// 移除长时间无活动的会话
    pub fn prune_sessions(&self, idle_ms: i64) -> usize {
        self.sessions.prune_idle(now_millis(), idle_ms)
    }

    pub fn is_closed(&self) -> bool {
        self.store.is_closed()
    }

    /// 关闭：停止接收 → 写入剩余记录 → TRUNCATE checkpoint → 关闭连接
    ///
    /// 可重复、可并发调用，每个调用方都等到关闭完成后才返回。
    pub async fn shutdown(&self) {
        self.accepting.store(false, Ordering::Release);
        self.shutdown_done.get_or_init(|| self.stop_writer()).await;
    }

    async fn stop_writer(&self) {
        let Some(handle) = self.writer_task.lock().take() else {
            return;
        };

        let (ack, done) = oneshot::channel();
        if self.sender.send(WriterCommand::Shutdown(ack)).await.is_ok() {
            let _ = done.await;
        }
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Token 批量写入任务异常退出");
        }
        tracing::info!("Token 统计已关闭");
    }
}
