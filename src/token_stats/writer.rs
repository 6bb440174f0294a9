//! 批量写入任务
//!
//! 唯一持有暂存缓冲区和写连接的后台任务。生产者只通过 channel 发送命令，
//! 暂存条数达到阈值或第一条暂存记录等待超过时限时整批写入。

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::checkpoint::CheckpointTrigger;
use super::health::HealthTracker;
use super::model::LogRecord;
use super::store::TokenStatsStore;

/// 批量写入参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOptions {
    /// 暂存条数达到该值立即写入
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// 第一条暂存记录的最长等待时间（毫秒）
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// 写入队列容量，队列满时丢弃新记录
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_max_batch_size() -> usize {
    10
}

fn default_flush_interval_ms() -> u64 {
    100
}

fn default_channel_capacity() -> usize {
    10_000
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl BatchOptions {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

/// 写入任务命令
pub(crate) enum WriterCommand {
    Record(LogRecord),
    /// 写入此前入队的全部记录后应答
    Flush(oneshot::Sender<()>),
    /// 写入剩余记录、TRUNCATE checkpoint、关闭存储后应答
    Shutdown(oneshot::Sender<()>),
}

pub(crate) struct BatchWriter {
    store: Arc<TokenStatsStore>,
    health: Arc<HealthTracker>,
    options: BatchOptions,
    staged: Vec<LogRecord>,
}

impl BatchWriter {
    /// 启动写入任务
    pub(crate) fn spawn(
        store: Arc<TokenStatsStore>,
        health: Arc<HealthTracker>,
        options: BatchOptions,
    ) -> (mpsc::Sender<WriterCommand>, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(options.channel_capacity.max(1));
        let writer = Self {
            store,
            health,
            staged: Vec::with_capacity(options.max_batch_size),
            options,
        };
        let handle = tokio::spawn(writer.run(receiver));
        (sender, handle)
    }

    async fn run(mut self, mut receiver: mpsc::Receiver<WriterCommand>) {
        let max_delay = self.options.flush_interval();
        let mut deadline: Option<Instant> = None;

        loop {
            let command = match deadline {
                Some(at) => tokio::select! {
                    command = receiver.recv() => command,
                    _ = tokio::time::sleep_until(at) => {
                        self.flush().await;
                        deadline = None;
                        continue;
                    }
                },
                None => receiver.recv().await,
            };

            match command {
                Some(WriterCommand::Record(record)) => {
                    if self.staged.is_empty() {
                        deadline = Some(Instant::now() + max_delay);
                    }
                    self.staged.push(record);
                    if self.staged.len() >= self.options.max_batch_size {
                        self.flush().await;
                        deadline = None;
                    }
                }
                Some(WriterCommand::Flush(ack)) => {
                    self.flush().await;
                    deadline = None;
                    let _ = ack.send(());
                }
                Some(WriterCommand::Shutdown(ack)) => {
                    receiver.close();
                    let mut acks = vec![ack];
                    while let Some(command) = receiver.recv().await {
                        match command {
                            WriterCommand::Record(record) => self.staged.push(record),
                            WriterCommand::Flush(ack) | WriterCommand::Shutdown(ack) => acks.push(ack),
                        }
                    }
                    self.finish().await;
                    for ack in acks {
                        let _ = ack.send(());
                    }
                    break;
                }
                None => {
                    // 所有发送端已释放
                    self.finish().await;
                    break;
                }
            }
        }

        tracing::info!("Token 批量写入任务已停止");
    }

    /// 整批写入暂存记录，失败时丢弃该批次
    async fn flush(&mut self) {
        if self.staged.is_empty() {
            return;
        }

        let batch = std::mem::replace(
            &mut self.staged,
            Vec::with_capacity(self.options.max_batch_size),
        );
        let count = batch.len();
        let store = self.store.clone();

        let result = tokio::task::spawn_blocking(move || {
            let inserted = store.insert_batch(&batch)?;
            let checkpoint = store.checkpoint_writer(CheckpointTrigger::AfterBatch.mode());
            Ok::<_, super::error::StatsError>((inserted, checkpoint))
        })
        .await;

        match result {
            Ok(Ok((inserted, checkpoint))) => {
                self.health.batch_committed(inserted);
                tracing::debug!(count = inserted, "Token 日志批量写入完成");
                if let Err(e) = checkpoint {
                    tracing::error!(error = %e, "批量写入后 PASSIVE checkpoint 失败");
                    self.health.checkpoint_failed(&e.to_string());
                }
            }
            Ok(Err(e)) => {
                tracing::error!(count = count, error = %e, "批量写入 Token 日志失败，丢弃该批次");
                self.health.batch_failed(count, &e.to_string());
            }
            Err(e) => {
                tracing::error!(count = count, error = %e, "批量写入任务异常，丢弃该批次");
                self.health.batch_failed(count, &e.to_string());
            }
        }
    }

    /// 关闭流程：写入剩余记录 → TRUNCATE checkpoint → 关闭连接
    async fn finish(&mut self) {
        let pending = self.staged.len();
        self.flush().await;
        if pending > 0 {
            tracing::info!(count = pending, "Token 日志已刷盘");
        }

        let store = self.store.clone();
        let health = self.health.clone();
        let result = tokio::task::spawn_blocking(move || {
            if let Err(e) = store.checkpoint_writer(CheckpointTrigger::Shutdown.mode()) {
                tracing::error!(error = %e, "关闭前 TRUNCATE checkpoint 失败");
                health.checkpoint_failed(&e.to_string());
            }
            store.close();
        })
        .await;

        if let Err(e) = result {
            tracing::error!(error = %e, "关闭 Token 统计存储失败");
        }
    }
}
