//! Token 日志数据模型

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::StatsError;

/// 当前时间（毫秒时间戳）
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// 被代理的 AI 工具类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ToolType {
    #[serde(rename = "claude-code", alias = "claude_code")]
    ClaudeCode,
    #[serde(rename = "codex")]
    Codex,
    #[serde(rename = "gemini-cli", alias = "gemini_cli")]
    GeminiCli,
}

impl ToolType {
    /// 数据库存储用字符串
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolType::ClaudeCode => "claude-code",
            ToolType::Codex => "codex",
            ToolType::GeminiCli => "gemini-cli",
        }
    }
}

impl FromStr for ToolType {
    type Err = StatsError;

    /// 同时接受破折号和下划线两种写法
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.replace('_', "-").as_str() {
            "claude-code" => Ok(ToolType::ClaudeCode),
            "codex" => Ok(ToolType::Codex),
            "gemini-cli" => Ok(ToolType::GeminiCli),
            _ => Err(StatsError::InvalidQuery(format!("未知的工具类型: {}", s))),
        }
    }
}

impl fmt::Display for ToolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 响应类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    /// SSE 流式响应
    Sse,
    /// JSON 响应
    Json,
    /// 未知类型
    Unknown,
}

impl ResponseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseType::Sse => "sse",
            ResponseType::Json => "json",
            ResponseType::Unknown => "unknown",
        }
    }

    /// 从数据库字符串解析，未知值回退为 Unknown
    pub fn from_db(s: &str) -> Self {
        match s {
            "sse" => ResponseType::Sse,
            "json" => ResponseType::Json,
            _ => ResponseType::Unknown,
        }
    }
}

/// 失败请求的错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    /// 响应解析或 Token 提取失败
    ParseError,
    /// 客户端中断请求
    RequestInterrupted,
    /// 上游返回错误或空响应
    UpstreamError,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::ParseError => "parse_error",
            ErrorType::RequestInterrupted => "request_interrupted",
            ErrorType::UpstreamError => "upstream_error",
        }
    }

    /// 从数据库字符串解析，未知值归为上游错误
    pub fn from_db(s: &str) -> Self {
        match s {
            "parse_error" => ErrorType::ParseError,
            "request_interrupted" => ErrorType::RequestInterrupted,
            _ => ErrorType::UpstreamError,
        }
    }
}

/// 请求状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Success,
    Failed,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Success => "success",
            RequestStatus::Failed => "failed",
        }
    }
}

/// 请求结果
///
/// 错误类型与错误详情只存在于 `Failed` 中，成功记录无法携带错误信息。
/// JSON 中展开为 `requestStatus` / `errorType` / `errorDetail` 三个字段。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "requestStatus",
    rename_all = "lowercase",
    rename_all_fields = "camelCase"
)]
pub enum RequestOutcome {
    Success,
    Failed {
        error_type: ErrorType,
        error_detail: String,
    },
}

impl RequestOutcome {
    pub fn status(&self) -> RequestStatus {
        match self {
            RequestOutcome::Success => RequestStatus::Success,
            RequestOutcome::Failed { .. } => RequestStatus::Failed,
        }
    }

    pub fn error_type(&self) -> Option<ErrorType> {
        match self {
            RequestOutcome::Success => None,
            RequestOutcome::Failed { error_type, .. } => Some(*error_type),
        }
    }

    pub fn error_detail(&self) -> Option<&str> {
        match self {
            RequestOutcome::Success => None,
            RequestOutcome::Failed { error_detail, .. } => Some(error_detail),
        }
    }
}

/// 单次代理请求的 Token 日志
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    /// 自增 ID，写入前为 0
    #[serde(default)]
    pub id: i64,
    pub tool_type: ToolType,
    /// 毫秒时间戳
    pub timestamp: i64,
    pub client_ip: String,
    pub session_id: String,
    /// 处理该请求的配置名称
    pub config_name: String,
    pub model: String,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub input_tokens: i64,
    #[serde(default)]
    pub output_tokens: i64,
    #[serde(default)]
    pub cache_creation_tokens: i64,
    #[serde(default)]
    pub cache_read_tokens: i64,
    pub response_type: ResponseType,
    #[serde(flatten)]
    pub outcome: RequestOutcome,
    #[serde(default)]
    pub response_time_ms: Option<i64>,
    #[serde(default)]
    pub input_price: Option<f64>,
    #[serde(default)]
    pub output_price: Option<f64>,
    #[serde(default)]
    pub cache_write_price: Option<f64>,
    #[serde(default)]
    pub cache_read_price: Option<f64>,
    #[serde(default)]
    pub total_cost: f64,
    #[serde(default)]
    pub pricing_template_id: Option<String>,
}

impl LogRecord {
    /// 创建一条成功记录（Token 与价格字段为 0 / 空，由调用方补充）
    pub fn success(
        tool_type: ToolType,
        timestamp: i64,
        session_id: impl Into<String>,
        config_name: impl Into<String>,
        model: impl Into<String>,
        response_type: ResponseType,
    ) -> Self {
        Self {
            id: 0,
            tool_type,
            timestamp,
            client_ip: String::new(),
            session_id: session_id.into(),
            config_name: config_name.into(),
            model: model.into(),
            message_id: None,
            input_tokens: 0,
            output_tokens: 0,
            cache_creation_tokens: 0,
            cache_read_tokens: 0,
            response_type,
            outcome: RequestOutcome::Success,
            response_time_ms: None,
            input_price: None,
            output_price: None,
            cache_write_price: None,
            cache_read_price: None,
            total_cost: 0.0,
            pricing_template_id: None,
        }
    }

    /// 创建一条失败记录
    #[allow(clippy::too_many_arguments)]
    pub fn failed(
        tool_type: ToolType,
        timestamp: i64,
        session_id: impl Into<String>,
        config_name: impl Into<String>,
        model: impl Into<String>,
        response_type: ResponseType,
        error_type: ErrorType,
        error_detail: impl Into<String>,
    ) -> Self {
        let mut record = Self::success(
            tool_type,
            timestamp,
            session_id,
            config_name,
            model,
            response_type,
        );
        record.outcome = RequestOutcome::Failed {
            error_type,
            error_detail: error_detail.into(),
        };
        record
    }

    pub fn with_tokens(mut self, input: i64, output: i64, cache_creation: i64, cache_read: i64) -> Self {
        self.input_tokens = input;
        self.output_tokens = output;
        self.cache_creation_tokens = cache_creation;
        self.cache_read_tokens = cache_read;
        self
    }

    pub fn with_client_ip(mut self, client_ip: impl Into<String>) -> Self {
        self.client_ip = client_ip.into();
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn with_response_time(mut self, response_time_ms: i64) -> Self {
        self.response_time_ms = Some(response_time_ms);
        self
    }

    pub fn status(&self) -> RequestStatus {
        self.outcome.status()
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, RequestOutcome::Failed { .. })
    }

    /// 外部写入前的字段校验
    pub fn validate(&self) -> Result<(), StatsError> {
        let tokens = [
            ("inputTokens", self.input_tokens),
            ("outputTokens", self.output_tokens),
            ("cacheCreationTokens", self.cache_creation_tokens),
            ("cacheReadTokens", self.cache_read_tokens),
        ];
        for (name, value) in tokens {
            if value < 0 {
                return Err(StatsError::InvalidQuery(format!("{} 不能为负数: {}", name, value)));
            }
        }
        if self.session_id.is_empty() {
            return Err(StatsError::InvalidQuery("sessionId 不能为空".to_string()));
        }
        if self.total_cost < 0.0 || !self.total_cost.is_finite() {
            return Err(StatsError::InvalidQuery(format!("totalCost 无效: {}", self.total_cost)));
        }
        Ok(())
    }
}
