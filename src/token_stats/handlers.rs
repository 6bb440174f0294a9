//! Token 统计 API 处理器

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;

use crate::recorder::RequestLogContext;

use super::checkpoint::CheckpointMode;
use super::error::StatsError;
use super::model::{LogRecord, ToolType};
use super::retention::RetentionConfig;
use super::router::TokenStatsState;
use super::types::{CleanupRequest, CostSummaryQuery, LogQuery, TrendQuery};

fn error_body(error_type: &str, message: impl Into<String>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "error": {"type": error_type, "message": message.into()}
    }))
}

fn error_response(e: StatsError) -> Response {
    match &e {
        StatsError::InvalidQuery(_) => {
            (StatusCode::BAD_REQUEST, error_body("invalid_request_error", e.to_string())).into_response()
        }
        StatsError::Closed => {
            (StatusCode::SERVICE_UNAVAILABLE, error_body("unavailable_error", e.to_string())).into_response()
        }
        _ => {
            tracing::error!(error = %e, "Token 统计请求失败");
            (StatusCode::INTERNAL_SERVER_ERROR, error_body("internal_error", e.to_string())).into_response()
        }
    }
}

fn json_or_error<T: serde::Serialize>(result: super::error::Result<T>) -> Response {
    match result {
        Ok(value) => Json(value).into_response(),
        Err(e) => error_response(e),
    }
}

fn accepted() -> Response {
    (StatusCode::ACCEPTED, Json(serde_json::json!({"accepted": true}))).into_response()
}

/// GET /logs
pub async fn get_logs(State(state): State<TokenStatsState>, Query(query): Query<LogQuery>) -> Response {
    json_or_error(state.stats.query_logs(query).await)
}

/// POST /records
pub async fn post_record(State(state): State<TokenStatsState>, Json(record): Json<LogRecord>) -> Response {
    if let Err(e) = record.validate() {
        return error_response(e);
    }
    if state.stats.is_closed() {
        return error_response(StatsError::Closed);
    }
    state.stats.record(record);
    accepted()
}

/// POST /capture 请求体：一次完整的代理往返
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureRequest {
    pub tool_type: ToolType,
    #[serde(default = "default_config_name")]
    pub config_name: String,
    #[serde(default)]
    pub client_ip: String,
    #[serde(default)]
    pub request_body: String,
    /// 0 表示没有收到响应
    #[serde(default)]
    pub response_status: u16,
    #[serde(default)]
    pub response_body: String,
    /// 未指定时按请求体的 `stream` 字段判断
    #[serde(default)]
    pub is_sse: Option<bool>,
    #[serde(default)]
    pub response_time_ms: Option<i64>,
    /// 客户端中途断开时的说明
    #[serde(default)]
    pub interrupted: Option<String>,
}

fn default_config_name() -> String {
    "default".to_string()
}

/// POST /capture
pub async fn post_capture(State(state): State<TokenStatsState>, Json(capture): Json<CaptureRequest>) -> Response {
    if state.stats.is_closed() {
        return error_response(StatsError::Closed);
    }

    let mut ctx = RequestLogContext::from_request(
        capture.tool_type,
        &capture.config_name,
        &capture.client_ip,
        capture.request_body.as_bytes(),
    );
    if let Some(ms) = capture.response_time_ms {
        ctx = ctx.with_response_time(ms);
    }

    match capture.interrupted {
        Some(detail) => state.recorder.record_interrupted(&ctx, &detail),
        None => {
            let is_sse = capture.is_sse.unwrap_or(ctx.is_stream);
            state.recorder.record_response(
                &ctx,
                capture.response_status,
                capture.response_body.as_bytes(),
                is_sse,
            );
        }
    }
    accepted()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSessionsQuery {
    pub tool_type: Option<ToolType>,
}

/// GET /sessions/active
pub async fn get_active_sessions(
    State(state): State<TokenStatsState>,
    Query(query): Query<ActiveSessionsQuery>,
) -> Response {
    Json(state.stats.active_sessions(query.tool_type)).into_response()
}

/// GET /sessions/{tool_type}/{session_id}
pub async fn get_session_stats(
    State(state): State<TokenStatsState>,
    Path((tool_type, session_id)): Path<(String, String)>,
) -> Response {
    let tool_type = match tool_type.parse::<ToolType>() {
        Ok(t) => t,
        Err(e) => return error_response(e),
    };
    json_or_error(state.stats.session_stats(tool_type, session_id).await)
}

/// GET /summary
pub async fn get_summary(State(state): State<TokenStatsState>) -> Response {
    json_or_error(state.stats.database_summary().await)
}

/// GET /retention
pub async fn get_retention(State(state): State<TokenStatsState>) -> Response {
    Json(state.retention.retention_config()).into_response()
}

/// PUT /retention
pub async fn put_retention(
    State(state): State<TokenStatsState>,
    Json(config): Json<RetentionConfig>,
) -> Response {
    match state.retention.update_retention_config(config.clone()) {
        Ok(()) => {
            tracing::info!(
                retention_days = ?config.retention_days,
                max_log_count = ?config.max_log_count,
                auto_cleanup_enabled = config.auto_cleanup_enabled,
                "保留配置已更新"
            );
            Json(config).into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "保存保留配置失败");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("internal_error", format!("保存失败: {:#}", e)),
            )
                .into_response()
        }
    }
}

/// POST /cleanup
pub async fn post_cleanup(
    State(state): State<TokenStatsState>,
    Json(request): Json<CleanupRequest>,
) -> Response {
    json_or_error(
        state
            .stats
            .cleanup_now(request.retention_days, request.max_log_count)
            .await,
    )
}

/// GET /trends
pub async fn get_trends(State(state): State<TokenStatsState>, Query(query): Query<TrendQuery>) -> Response {
    json_or_error(state.stats.query_trends(query).await)
}

/// GET /cost-summary
pub async fn get_cost_summary(
    State(state): State<TokenStatsState>,
    Query(query): Query<CostSummaryQuery>,
) -> Response {
    json_or_error(state.stats.query_cost_summary(query).await)
}

#[derive(Debug, Deserialize)]
pub struct CheckpointRequest {
    pub mode: CheckpointMode,
}

/// POST /checkpoint
pub async fn post_checkpoint(
    State(state): State<TokenStatsState>,
    Json(request): Json<CheckpointRequest>,
) -> Response {
    json_or_error(state.stats.checkpoint(request.mode).await)
}

/// GET /health
pub async fn get_health(State(state): State<TokenStatsState>) -> Response {
    let health = state.stats.health();
    let status = if state.stats.is_closed() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(health)).into_response()
}
