//! 活跃会话登记表
//!
//! 在记录进入写入队列时即时累加，包含尚未落盘的记录，用于界面近实时展示。
//! 精确统计以数据库聚合（`session_stats`）为准。

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::Serialize;

use super::model::{LogRecord, ToolType};

/// 单个会话的运行时累计
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionActivity {
    pub tool_type: ToolType,
    pub session_id: String,
    pub config_name: String,
    pub last_model: String,
    pub first_seen: i64,
    pub last_seen: i64,
    pub request_count: u64,
    pub failed_count: u64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_creation_tokens: i64,
    pub cache_read_tokens: i64,
    pub total_cost: f64,
}

type SessionKey = (ToolType, String);

/// 会话登记表
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionKey, SessionActivity>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 累加一条记录
    pub fn observe(&self, record: &LogRecord) {
        let mut sessions = self.sessions.write();
        let entry = sessions
            .entry((record.tool_type, record.session_id.clone()))
            .or_insert_with(|| SessionActivity {
                tool_type: record.tool_type,
                session_id: record.session_id.clone(),
                config_name: record.config_name.clone(),
                last_model: record.model.clone(),
                first_seen: record.timestamp,
                last_seen: record.timestamp,
                request_count: 0,
                failed_count: 0,
                input_tokens: 0,
                output_tokens: 0,
                cache_creation_tokens: 0,
                cache_read_tokens: 0,
                total_cost: 0.0,
            });

        entry.request_count += 1;
        if record.is_failed() {
            entry.failed_count += 1;
        }
        entry.input_tokens += record.input_tokens;
        entry.output_tokens += record.output_tokens;
        entry.cache_creation_tokens += record.cache_creation_tokens;
        entry.cache_read_tokens += record.cache_read_tokens;
        entry.total_cost += record.total_cost;
        entry.first_seen = entry.first_seen.min(record.timestamp);
        if record.timestamp >= entry.last_seen {
            entry.last_seen = record.timestamp;
            entry.last_model = record.model.clone();
            entry.config_name = record.config_name.clone();
        }
    }

    pub fn get(&self, tool_type: ToolType, session_id: &str) -> Option<SessionActivity> {
        self.sessions
            .read()
            .get(&(tool_type, session_id.to_string()))
            .cloned()
    }

    /// 活跃会话列表，按最后活跃时间倒序
    pub fn active_sessions(&self, tool_type: Option<ToolType>) -> Vec<SessionActivity> {
        let mut list: Vec<SessionActivity> = self
            .sessions
            .read()
            .values()
            .filter(|s| tool_type.is_none_or(|t| s.tool_type == t))
            .cloned()
            .collect();
        list.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        list
    }

    /// 移除 `idle_ms` 内无活动的会话，返回移除数量
    pub fn prune_idle(&self, now_ms: i64, idle_ms: i64) -> usize {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, s| now_ms.saturating_sub(s.last_seen) <= idle_ms);
        before - sessions.len()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.sessions.read().len()
    }
}
