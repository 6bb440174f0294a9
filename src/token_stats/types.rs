//! Token 统计 API 请求/响应类型

use serde::{Deserialize, Serialize};

use super::checkpoint::CheckpointReport;
use super::model::{LogRecord, ToolType};

/// 默认分页大小
pub const DEFAULT_PAGE_SIZE: u32 = 20;
/// 最大分页大小
pub const MAX_PAGE_SIZE: u32 = 200;

/// 日志分页查询过滤器
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogQuery {
    pub tool_type: Option<ToolType>,
    pub session_id: Option<String>,
    pub config_name: Option<String>,
    /// 起始时间（毫秒，包含）
    pub start_time: Option<i64>,
    /// 结束时间（毫秒，包含）
    pub end_time: Option<i64>,
    /// 页码，从 0 开始
    #[serde(default)]
    pub page: u32,
    pub page_size: Option<u32>,
}

impl LogQuery {
    pub fn effective_page_size(&self) -> u32 {
        self.page_size
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE)
    }
}

/// 分页响应
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogPage {
    /// 按时间倒序
    pub logs: Vec<LogRecord>,
    /// 匹配过滤条件的总数（忽略分页）
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}

/// 会话统计
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub tool_type: ToolType,
    pub session_id: String,
    pub total_input_tokens: i64,
    pub total_output_tokens: i64,
    pub total_cache_creation_tokens: i64,
    pub total_cache_read_tokens: i64,
    pub request_count: u64,
    pub total_cost: f64,
}

/// 数据库摘要
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSummary {
    pub total_logs: u64,
    pub oldest_timestamp: Option<i64>,
    pub newest_timestamp: Option<i64>,
    /// 主数据库文件大小
    pub db_size_bytes: u64,
    /// WAL 文件大小（不存在时为 0）
    pub wal_size_bytes: u64,
}

/// 趋势查询时间粒度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeGranularity {
    FifteenMinutes,
    ThirtyMinutes,
    #[default]
    Hour,
    TwelveHours,
    Day,
}

impl TimeGranularity {
    /// 桶宽度（毫秒）
    pub fn duration_ms(&self) -> i64 {
        const MINUTE: i64 = 60 * 1000;
        match self {
            TimeGranularity::FifteenMinutes => 15 * MINUTE,
            TimeGranularity::ThirtyMinutes => 30 * MINUTE,
            TimeGranularity::Hour => 60 * MINUTE,
            TimeGranularity::TwelveHours => 12 * 60 * MINUTE,
            TimeGranularity::Day => 24 * 60 * MINUTE,
        }
    }
}

/// 趋势查询参数
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendQuery {
    pub start_time: i64,
    pub end_time: i64,
    pub tool_type: Option<ToolType>,
    #[serde(default)]
    pub granularity: TimeGranularity,
}

/// 趋势数据点（一个时间桶）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendBucket {
    pub bucket_start: i64,
    /// 最后一个桶会被截断到查询的结束时间
    pub bucket_end: i64,
    pub tool_type: Option<ToolType>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_creation_tokens: i64,
    pub cache_read_tokens: i64,
    pub request_count: u64,
    pub success_count: u64,
    pub failed_count: u64,
    pub input_cost: f64,
    pub output_cost: f64,
    pub cache_write_cost: f64,
    pub cache_read_cost: f64,
    pub total_cost: f64,
    /// 没有响应时间数据时为 null，与 0 区分
    pub avg_response_time_ms: Option<f64>,
}

impl TrendBucket {
    pub(crate) fn empty(bucket_start: i64, bucket_end: i64, tool_type: Option<ToolType>) -> Self {
        Self {
            bucket_start,
            bucket_end,
            tool_type,
            input_tokens: 0,
            output_tokens: 0,
            cache_creation_tokens: 0,
            cache_read_tokens: 0,
            request_count: 0,
            success_count: 0,
            failed_count: 0,
            input_cost: 0.0,
            output_cost: 0.0,
            cache_write_cost: 0.0,
            cache_read_cost: 0.0,
            total_cost: 0.0,
            avg_response_time_ms: None,
        }
    }
}

/// 成本摘要的分组维度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostGroupBy {
    #[default]
    Model,
    Session,
    ConfigName,
    ToolType,
}

impl CostGroupBy {
    /// 对应的 `token_logs` 列名
    pub(crate) fn column(&self) -> &'static str {
        match self {
            CostGroupBy::Model => "model",
            CostGroupBy::Session => "session_id",
            CostGroupBy::ConfigName => "config_name",
            CostGroupBy::ToolType => "tool_type",
        }
    }
}

/// 成本摘要查询参数
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostSummaryQuery {
    pub start_time: i64,
    pub end_time: i64,
    pub tool_type: Option<ToolType>,
    #[serde(default)]
    pub group_by: CostGroupBy,
}

/// 单个分组的成本
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CostGroup {
    /// 分组键（模型名、会话 ID、配置名或工具类型）
    pub key: String,
    pub request_count: u64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_creation_tokens: i64,
    pub cache_read_tokens: i64,
    pub total_cost: f64,
}

/// 成本摘要
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CostSummary {
    pub start_time: i64,
    pub end_time: i64,
    pub tool_type: Option<ToolType>,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_creation_tokens: i64,
    pub cache_read_tokens: i64,
    pub input_cost: f64,
    pub output_cost: f64,
    pub cache_write_cost: f64,
    pub cache_read_cost: f64,
    pub total_cost: f64,
    pub avg_response_time_ms: Option<f64>,
    pub group_by: CostGroupBy,
    /// 按总成本倒序
    pub groups: Vec<CostGroup>,
}

/// 手动清理请求
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupRequest {
    pub retention_days: Option<u32>,
    pub max_log_count: Option<u32>,
}

/// 清理结果
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub rows_deleted: usize,
    /// 两个限制都未配置：清理为空操作
    pub no_bounds_configured: bool,
    /// 删除行数 > 0 时执行的 TRUNCATE checkpoint 结果
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<CheckpointReport>,
}
