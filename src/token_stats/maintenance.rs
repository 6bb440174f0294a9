//! 定期维护任务
//!
//! 两个互相独立的计时器：
//! - checkpoint：定期 TRUNCATE checkpoint，并清理空闲会话
//! - retention：按当前保留配置清理旧日志

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::checkpoint::CheckpointTrigger;
use super::manager::TokenStats;
use super::retention::RetentionConfigProvider;

/// 维护计时参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceOptions {
    #[serde(default = "default_checkpoint_interval_secs")]
    pub checkpoint_interval_secs: u64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// 会话无活动超过该时长后从登记表移除
    #[serde(default = "default_session_idle_secs")]
    pub session_idle_secs: u64,
}

fn default_checkpoint_interval_secs() -> u64 {
    300
}

fn default_cleanup_interval_secs() -> u64 {
    3600
}

fn default_session_idle_secs() -> u64 {
    1800
}

impl Default for MaintenanceOptions {
    fn default() -> Self {
        Self {
            checkpoint_interval_secs: default_checkpoint_interval_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            session_idle_secs: default_session_idle_secs(),
        }
    }
}

/// 维护任务句柄，`stop` 后等待任务退出
pub struct MaintenanceHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl MaintenanceHandle {
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "维护任务异常退出");
            }
        }
    }
}

/// 启动维护任务
pub fn spawn_maintenance(
    stats: Arc<TokenStats>,
    retention: Arc<dyn RetentionConfigProvider>,
    options: MaintenanceOptions,
) -> MaintenanceHandle {
    let (shutdown, receiver) = watch::channel(false);

    let checkpoint_task = tokio::spawn(checkpoint_loop(
        stats.clone(),
        Duration::from_secs(options.checkpoint_interval_secs.max(1)),
        options.session_idle_secs as i64 * 1000,
        receiver.clone(),
    ));
    let retention_task = tokio::spawn(retention_loop(
        stats,
        retention,
        Duration::from_secs(options.cleanup_interval_secs.max(1)),
        receiver,
    ));

    tracing::info!(
        checkpoint_interval_secs = options.checkpoint_interval_secs,
        cleanup_interval_secs = options.cleanup_interval_secs,
        "Token 统计维护任务已启动"
    );

    MaintenanceHandle {
        shutdown,
        tasks: vec![checkpoint_task, retention_task],
    }
}

async fn checkpoint_loop(
    stats: Arc<TokenStats>,
    period: Duration,
    session_idle_ms: i64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // 第一次 tick 立即完成，跳过
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }

        run_checkpoint_tick(&stats, session_idle_ms).await;
    }
}

async fn run_checkpoint_tick(stats: &TokenStats, session_idle_ms: i64) {
    match stats.checkpoint(CheckpointTrigger::Maintenance.mode()).await {
        Ok(report) => {
            tracing::debug!(
                busy = report.busy,
                log_frames = report.log_frames,
                checkpointed_frames = report.checkpointed_frames,
                "定期 checkpoint 完成"
            );
        }
        Err(e) => tracing::warn!(error = %e, "定期 checkpoint 失败"),
    }

    let pruned = stats.prune_sessions(session_idle_ms);
    if pruned > 0 {
        tracing::debug!(count = pruned, "已移除空闲会话");
    }
}

async fn retention_loop(
    stats: Arc<TokenStats>,
    retention: Arc<dyn RetentionConfigProvider>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }

        run_retention_tick(&stats, retention.as_ref()).await;
    }
}

/// 每次触发时重新读取配置
async fn run_retention_tick(stats: &TokenStats, retention: &dyn RetentionConfigProvider) {
    let config = retention.retention_config();
    if !config.auto_cleanup_enabled {
        tracing::debug!("自动清理未启用，跳过");
        return;
    }

    // 失败已在 cleanup 内记录并计入健康状态
    let _ = stats.cleanup(config.policy()).await;
}

#[cfg(test)]
mod tests {
    use parking_lot::RwLock;

    use super::*;
    use crate::token_stats::model::now_millis;
    use crate::token_stats::retention::RetentionConfig;
    use crate::token_stats::store::tests::sample;
    use crate::token_stats::writer::BatchOptions;

    const DAY_MS: i64 = 24 * 60 * 60 * 1000;

    fn open_stats() -> (tempfile::TempDir, Arc<TokenStats>) {
        let dir = tempfile::tempdir().unwrap();
        let stats = TokenStats::open(dir.path().join("token_stats.db"), BatchOptions::default())
            .unwrap();
        (dir, Arc::new(stats))
    }

    async fn seed(stats: &TokenStats) {
        let now = now_millis();
        stats.record(sample("old", now - 90 * DAY_MS));
        stats.record(sample("new", now));
        stats.flush().await.unwrap();
    }

    #[tokio::test]
    async fn test_retention_tick_reads_current_config() {
        let (_dir, stats) = open_stats();
        seed(&stats).await;

        let config = RwLock::new(RetentionConfig {
            auto_cleanup_enabled: false,
            ..Default::default()
        });
        run_retention_tick(&stats, &config).await;
        assert_eq!(stats.database_summary().await.unwrap().total_logs, 2);

        config.write().auto_cleanup_enabled = true;
        run_retention_tick(&stats, &config).await;
        assert_eq!(stats.database_summary().await.unwrap().total_logs, 1);
        stats.shutdown().await;
    }

    #[tokio::test]
    async fn test_unbounded_config_keeps_everything() {
        let (_dir, stats) = open_stats();
        seed(&stats).await;

        let config = RwLock::new(RetentionConfig {
            retention_days: None,
            max_log_count: None,
            auto_cleanup_enabled: true,
        });
        run_retention_tick(&stats, &config).await;
        assert_eq!(stats.database_summary().await.unwrap().total_logs, 2);
        stats.shutdown().await;
    }

    #[tokio::test]
    async fn test_checkpoint_tick_prunes_idle_sessions() {
        let (_dir, stats) = open_stats();
        seed(&stats).await;
        assert_eq!(stats.active_sessions(None).len(), 2);

        run_checkpoint_tick(&stats, DAY_MS).await;
        let active = stats.active_sessions(None);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].session_id, "new");
        assert_eq!(stats.health().checkpoint_failures, 0);
        stats.shutdown().await;
    }

    #[tokio::test]
    async fn test_scheduled_cleanup_runs_and_stops() {
        let (_dir, stats) = open_stats();
        seed(&stats).await;

        let config: Arc<dyn RetentionConfigProvider> =
            Arc::new(RwLock::new(RetentionConfig::default()));
        let handle = spawn_maintenance(stats.clone(), config, MaintenanceOptions::default());

        // retention 计时器首次 tick 立即执行
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while stats.database_summary().await.unwrap().total_logs != 1
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(stats.database_summary().await.unwrap().total_logs, 1);

        handle.stop().await;
        stats.shutdown().await;
    }
}
