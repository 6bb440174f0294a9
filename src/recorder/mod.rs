//! 代理请求日志生成
//!
//! 把一次代理请求（请求体、状态码、响应体）转换为 [`LogRecord`] 并交给 [`TokenStats`]。
//! 所有失败场景都会生成一条失败记录，不向调用方返回错误。

mod context;
mod extractor;
mod parser;
mod pricing;

use std::sync::Arc;

use axum::http::StatusCode;

use crate::common::truncate_with_ellipsis;
use crate::token_stats::{ErrorType, LogRecord, ResponseType, TokenStats, now_millis};

pub use context::RequestLogContext;
pub use extractor::{TokenExtractor, TokenUsage, extractor_for};
pub use parser::{ParsedResponse, ResponseParser};
pub use pricing::{CostBreakdown, ModelPricing, PricingTable, default_pricing};

/// error_detail 最大字节数
const MAX_ERROR_DETAIL_BYTES: usize = 1024;

const UNKNOWN_MODEL: &str = "unknown";

pub struct LogRecorder {
    stats: Arc<TokenStats>,
    pricing: PricingTable,
}

impl LogRecorder {
    pub fn new(stats: Arc<TokenStats>, pricing: PricingTable) -> Self {
        Self { stats, pricing }
    }

    /// 记录一次完成的请求
    pub fn record_response(&self, ctx: &RequestLogContext, status: u16, body: &[u8], is_sse: bool) {
        let parsed = ResponseParser::parse(body, status, is_sse);
        let record = self.build_record(ctx, status, parsed);
        self.stats.record(record);
    }

    /// 客户端在响应完成前断开
    pub fn record_interrupted(&self, ctx: &RequestLogContext, detail: &str) {
        tracing::warn!(
            tool_type = %ctx.tool_type,
            session_id = %ctx.session_id,
            detail = detail,
            "请求被中断"
        );
        let record = self.failed(ctx, ErrorType::RequestInterrupted, detail);
        self.stats.record(record);
    }

    /// 上游连接失败，没有任何响应
    pub fn record_upstream_error(&self, ctx: &RequestLogContext, detail: &str) {
        tracing::warn!(
            tool_type = %ctx.tool_type,
            session_id = %ctx.session_id,
            detail = detail,
            is_stream = ctx.is_stream,
            "上游请求失败"
        );
        let record = self.failed(ctx, ErrorType::UpstreamError, detail);
        self.stats.record(record);
    }

    pub fn build_record(&self, ctx: &RequestLogContext, status: u16, parsed: ParsedResponse) -> LogRecord {
        if status >= 400 {
            let reason = StatusCode::from_u16(status)
                .ok()
                .and_then(|code| code.canonical_reason())
                .unwrap_or("Unknown");
            tracing::warn!(
                tool_type = %ctx.tool_type,
                session_id = %ctx.session_id,
                status = status,
                "上游返回错误状态码"
            );
            return self.failed(ctx, ErrorType::UpstreamError, &format!("HTTP {}: {}", status, reason));
        }

        let extractor = extractor_for(ctx.tool_type);
        let (response_type, usage) = match parsed {
            ParsedResponse::Sse { data_lines } => (ResponseType::Sse, extractor.extract_from_sse(&data_lines)),
            ParsedResponse::Json { data } => (ResponseType::Json, extractor.extract_from_json(&data)),
            ParsedResponse::Empty => {
                return self.failed(ctx, ErrorType::UpstreamError, "上游返回空响应体");
            }
            ParsedResponse::ParseError {
                error,
                response_type,
            } => {
                tracing::warn!(
                    tool_type = %ctx.tool_type,
                    session_id = %ctx.session_id,
                    response_type = response_type.as_str(),
                    error = %error,
                    "响应解析失败"
                );
                let mut record = self.failed(ctx, ErrorType::ParseError, &format!("响应解析失败: {}", error));
                record.response_type = response_type;
                return record;
            }
        };

        match usage {
            Ok(usage) => self.success(ctx, response_type, usage),
            Err(e) => {
                tracing::error!(
                    tool_type = %ctx.tool_type,
                    session_id = %ctx.session_id,
                    error = %e,
                    "Token 提取失败，记录为 parse_error"
                );
                let mut record = self.failed(ctx, ErrorType::ParseError, &format!("Token 提取失败: {:#}", e));
                record.response_type = response_type;
                record
            }
        }
    }

    fn success(&self, ctx: &RequestLogContext, response_type: ResponseType, usage: TokenUsage) -> LogRecord {
        let model = usage
            .model
            .filter(|m| !m.is_empty())
            .or_else(|| ctx.model.clone())
            .unwrap_or_else(|| UNKNOWN_MODEL.to_string());

        let mut record = LogRecord::success(
            ctx.tool_type,
            now_millis(),
            &ctx.session_id,
            &ctx.config_name,
            model,
            response_type,
        )
        .with_tokens(
            usage.input_tokens,
            usage.output_tokens,
            usage.cache_creation_tokens,
            usage.cache_read_tokens,
        )
        .with_client_ip(&ctx.client_ip)
        .with_response_time(ctx.elapsed_ms());
        record.message_id = usage.message_id;

        self.pricing.apply(&mut record);
        record
    }

    fn failed(&self, ctx: &RequestLogContext, error_type: ErrorType, detail: &str) -> LogRecord {
        let response_type = if ctx.is_stream {
            ResponseType::Sse
        } else {
            ResponseType::Json
        };
        LogRecord::failed(
            ctx.tool_type,
            now_millis(),
            &ctx.session_id,
            &ctx.config_name,
            ctx.model.as_deref().unwrap_or(UNKNOWN_MODEL),
            response_type,
            error_type,
            truncate_with_ellipsis(detail, MAX_ERROR_DETAIL_BYTES),
        )
        .with_client_ip(&ctx.client_ip)
        .with_response_time(ctx.elapsed_ms())
    }
}
