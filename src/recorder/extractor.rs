//! 各工具响应的 Token 用量提取

use anyhow::{Context, Result, bail};
use serde_json::Value;

use crate::token_stats::ToolType;

/// 提取出的用量
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenUsage {
    /// 响应中的模型，缺失时由调用方回退到请求模型
    pub model: Option<String>,
    pub message_id: Option<String>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_creation_tokens: i64,
    pub cache_read_tokens: i64,
}

pub trait TokenExtractor: Send + Sync {
    /// 从 SSE data 行中提取最终用量
    fn extract_from_sse(&self, data_lines: &[String]) -> Result<TokenUsage>;

    fn extract_from_json(&self, json: &Value) -> Result<TokenUsage>;
}

pub fn extractor_for(tool_type: ToolType) -> &'static dyn TokenExtractor {
    match tool_type {
        ToolType::ClaudeCode => &ClaudeExtractor,
        ToolType::Codex => &CodexExtractor,
        ToolType::GeminiCli => &GeminiExtractor,
    }
}

fn int(value: &Value, key: &str) -> Option<i64> {
    value.get(key).and_then(Value::as_i64)
}

fn string(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(|s| s.to_string())
}

/// 逐行解析 SSE JSON，跳过无法解析的行
fn sse_events(data_lines: &[String]) -> impl Iterator<Item = Value> + '_ {
    data_lines.iter().filter_map(|line| match serde_json::from_str::<Value>(line) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::debug!(error = %e, "跳过无法解析的 SSE 行");
            None
        }
    })
}

fn event_type(event: &Value) -> &str {
    event.get("type").and_then(Value::as_str).unwrap_or("")
}

/// Claude Messages API
pub struct ClaudeExtractor;

impl ClaudeExtractor {
    /// 缓存创建：优先扁平字段，回退到 `cache_creation` 下 5m + 1h
    fn cache_creation(usage: &Value) -> Option<i64> {
        int(usage, "cache_creation_input_tokens").or_else(|| {
            usage.get("cache_creation").map(|nested| {
                int(nested, "ephemeral_5m_input_tokens").unwrap_or(0)
                    + int(nested, "ephemeral_1h_input_tokens").unwrap_or(0)
            })
        })
    }
}

impl TokenExtractor for ClaudeExtractor {
    fn extract_from_sse(&self, data_lines: &[String]) -> Result<TokenUsage> {
        let mut usage: Option<TokenUsage> = None;

        for event in sse_events(data_lines) {
            match event_type(&event) {
                "message_start" => {
                    let message = event.get("message").context("message_start 缺少 message")?;
                    let start = message.get("usage").context("message_start 缺少 usage")?;
                    usage = Some(TokenUsage {
                        model: string(message, "model"),
                        message_id: string(message, "id"),
                        input_tokens: int(start, "input_tokens").unwrap_or(0),
                        output_tokens: int(start, "output_tokens").unwrap_or(0),
                        cache_creation_tokens: Self::cache_creation(start).unwrap_or(0),
                        cache_read_tokens: int(start, "cache_read_input_tokens").unwrap_or(0),
                    });
                }
                "message_delta" => {
                    let Some(delta) = event.get("usage") else {
                        tracing::debug!("message_delta 不含 usage");
                        continue;
                    };
                    let current = usage
                        .as_mut()
                        .context("message_delta 出现在 message_start 之前")?;
                    // delta 中出现的字段覆盖 message_start 的初始值
                    if let Some(v) = int(delta, "input_tokens") {
                        current.input_tokens = v;
                    }
                    if let Some(v) = int(delta, "output_tokens") {
                        current.output_tokens = v;
                    }
                    if let Some(v) = Self::cache_creation(delta) {
                        current.cache_creation_tokens = v;
                    }
                    if let Some(v) = int(delta, "cache_read_input_tokens") {
                        current.cache_read_tokens = v;
                    }
                }
                _ => {}
            }
        }

        usage.context("SSE 流中没有 message_start 事件")
    }

    fn extract_from_json(&self, json: &Value) -> Result<TokenUsage> {
        let usage = json.get("usage").context("响应缺少 usage 字段")?;
        Ok(TokenUsage {
            model: string(json, "model"),
            message_id: string(json, "id"),
            input_tokens: int(usage, "input_tokens").unwrap_or(0),
            output_tokens: int(usage, "output_tokens").unwrap_or(0),
            cache_creation_tokens: Self::cache_creation(usage).unwrap_or(0),
            cache_read_tokens: int(usage, "cache_read_input_tokens").unwrap_or(0),
        })
    }
}

/// OpenAI Responses API（Codex）
pub struct CodexExtractor;

impl CodexExtractor {
    fn usage_of(response: &Value) -> Result<TokenUsage> {
        let usage = response.get("usage").context("响应缺少 usage 字段")?;
        Ok(TokenUsage {
            model: string(response, "model"),
            message_id: string(response, "id"),
            input_tokens: int(usage, "input_tokens").unwrap_or(0),
            output_tokens: int(usage, "output_tokens").unwrap_or(0),
            cache_creation_tokens: 0,
            cache_read_tokens: usage
                .get("input_tokens_details")
                .and_then(|d| int(d, "cached_tokens"))
                .unwrap_or(0),
        })
    }
}

impl TokenExtractor for CodexExtractor {
    fn extract_from_sse(&self, data_lines: &[String]) -> Result<TokenUsage> {
        let mut response_id = None;
        for event in sse_events(data_lines) {
            match event_type(&event) {
                "response.created" => {
                    response_id = event.get("response").and_then(|r| string(r, "id"));
                }
                "response.completed" => {
                    let response = event
                        .get("response")
                        .context("response.completed 缺少 response")?;
                    let mut usage = Self::usage_of(response)?;
                    if usage.message_id.is_none() {
                        usage.message_id = response_id;
                    }
                    return Ok(usage);
                }
                _ => {}
            }
        }
        bail!("SSE 流中没有 response.completed 事件")
    }

    fn extract_from_json(&self, json: &Value) -> Result<TokenUsage> {
        Self::usage_of(json)
    }
}

/// Gemini generateContent / streamGenerateContent
pub struct GeminiExtractor;

impl GeminiExtractor {
    fn usage_of(chunk: &Value) -> Option<TokenUsage> {
        let metadata = chunk.get("usageMetadata")?;
        Some(TokenUsage {
            model: string(chunk, "modelVersion"),
            message_id: string(chunk, "responseId"),
            input_tokens: int(metadata, "promptTokenCount").unwrap_or(0),
            output_tokens: int(metadata, "candidatesTokenCount").unwrap_or(0)
                + int(metadata, "thoughtsTokenCount").unwrap_or(0),
            cache_creation_tokens: 0,
            cache_read_tokens: int(metadata, "cachedContentTokenCount").unwrap_or(0),
        })
    }
}

impl TokenExtractor for GeminiExtractor {
    /// 每个分块都带累计用量，取最后一个
    fn extract_from_sse(&self, data_lines: &[String]) -> Result<TokenUsage> {
        sse_events(data_lines)
            .filter_map(|event| Self::usage_of(&event))
            .last()
            .context("SSE 流中没有 usageMetadata")
    }

    fn extract_from_json(&self, json: &Value) -> Result<TokenUsage> {
        // 非流式响应偶尔以数组形式返回
        let chunk = match json {
            Value::Array(items) => items.last().context("空的响应数组")?,
            other => other,
        };
        Self::usage_of(chunk).context("响应缺少 usageMetadata 字段")
    }
}
