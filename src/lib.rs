//! 本地 Token 用量统计服务
//!
//! 代理侧通过 [`recorder::LogRecorder`] 或 [`token_stats::TokenStats::record`] 提交记录，
//! 管理界面通过 `/api/token-stats` 查询。

pub mod common;
pub mod model;
pub mod recorder;
pub mod token_stats;
