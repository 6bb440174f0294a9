//! 请求上下文
//!
//! 在请求转发前一次性解析请求体，提取会话 ID、模型和是否流式。

use std::time::Instant;

use serde_json::Value;

use crate::token_stats::ToolType;

/// Claude Code 的 `metadata.user_id` 形如 `user_<hash>_account__session_<uuid>`
const SESSION_MARKER: &str = "_session_";

#[derive(Debug, Clone)]
pub struct RequestLogContext {
    pub tool_type: ToolType,
    pub session_id: String,
    pub config_name: String,
    pub client_ip: String,
    /// 请求体中的模型，响应中缺失模型时回退使用
    pub model: Option<String>,
    pub is_stream: bool,
    started_at: Instant,
    response_time_ms: Option<i64>,
}

impl RequestLogContext {
    pub fn from_request(tool_type: ToolType, config_name: &str, client_ip: &str, body: &[u8]) -> Self {
        let json = serde_json::from_slice::<Value>(body).ok();

        let session_id = json
            .as_ref()
            .and_then(|v| v["metadata"]["user_id"].as_str())
            .and_then(extract_session_id)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let model = json
            .as_ref()
            .and_then(|v| v["model"].as_str())
            .map(|s| s.to_string());
        let is_stream = json
            .as_ref()
            .and_then(|v| v["stream"].as_bool())
            .unwrap_or(false);

        Self {
            tool_type,
            session_id,
            config_name: config_name.to_string(),
            client_ip: client_ip.to_string(),
            model,
            is_stream,
            started_at: Instant::now(),
            response_time_ms: None,
        }
    }

    /// 使用外部测得的响应耗时
    pub fn with_response_time(mut self, response_time_ms: i64) -> Self {
        self.response_time_ms = Some(response_time_ms);
        self
    }

    pub fn elapsed_ms(&self) -> i64 {
        self.response_time_ms
            .unwrap_or_else(|| self.started_at.elapsed().as_millis() as i64)
    }
}

/// 取 `_session_` 之后的部分；没有标记时整个 user_id 作为会话 ID
fn extract_session_id(user_id: &str) -> Option<String> {
    let id = match user_id.rfind(SESSION_MARKER) {
        Some(pos) => &user_id[pos + SESSION_MARKER.len()..],
        None => user_id,
    };
    let id = id.trim();
    (!id.is_empty()).then(|| id.to_string())
}
