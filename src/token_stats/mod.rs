//! Token 用量统计
//!
//! 批量写入、WAL checkpoint、保留清理与查询，后端为单个 SQLite（WAL）文件。

mod analytics;
mod checkpoint;
mod error;
mod handlers;
mod health;
mod maintenance;
mod manager;
mod model;
mod retention;
mod router;
mod session;
mod store;
mod types;
mod writer;

pub use checkpoint::{CheckpointMode, CheckpointReport, CheckpointTrigger};
pub use error::{Result, StatsError};
pub use health::HealthSnapshot;
pub use maintenance::{MaintenanceHandle, MaintenanceOptions, spawn_maintenance};
pub use manager::TokenStats;
pub use model::{
    ErrorType, LogRecord, RequestOutcome, RequestStatus, ResponseType, ToolType, now_millis,
};
pub use retention::{RetentionConfig, RetentionConfigProvider, RetentionPolicy};
pub use router::{TokenStatsState, create_token_stats_router};
pub use session::SessionActivity;
pub use store::TokenStatsStore;
pub use types::{
    CleanupReport, CleanupRequest, CostGroup, CostGroupBy, CostSummary, CostSummaryQuery,
    DatabaseSummary, LogPage, LogQuery, SessionStats, TimeGranularity, TrendBucket, TrendQuery,
};
pub use writer::BatchOptions;
