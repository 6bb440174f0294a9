//! Token 日志 SQLite 存储（同步）
//!
//! 同一个数据库文件打开三条连接：
//! - writer：只由批量写入任务使用，批量插入后做 PASSIVE checkpoint
//! - reader：查询引擎使用，WAL 模式下与写入互不阻塞
//! - maintenance：清理与 TRUNCATE checkpoint 使用，依赖 SQLite 事务隔离与写入任务协调

use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::types::{ToSql, Type};
use rusqlite::{Connection, Row, TransactionBehavior};

use super::analytics;
use super::checkpoint::{self, CheckpointMode, CheckpointReport};
use super::error::{Result, StatsError};
use super::model::{ErrorType, LogRecord, RequestOutcome, ResponseType, ToolType};
use super::retention::{self, RetentionPolicy};
use super::types::{
    CostSummary, CostSummaryQuery, DatabaseSummary, LogPage, LogQuery, SessionStats, TrendBucket,
    TrendQuery,
};

/// 锁等待超时（瞬时 busy 由 SQLite 自行重试）
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS token_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tool_type TEXT NOT NULL,
        timestamp INTEGER NOT NULL,
        client_ip TEXT NOT NULL DEFAULT '',
        session_id TEXT NOT NULL,
        config_name TEXT NOT NULL,
        model TEXT NOT NULL,
        message_id TEXT,
        input_tokens INTEGER NOT NULL DEFAULT 0,
        output_tokens INTEGER NOT NULL DEFAULT 0,
        cache_creation_tokens INTEGER NOT NULL DEFAULT 0,
        cache_read_tokens INTEGER NOT NULL DEFAULT 0,
        request_status TEXT NOT NULL,
        response_type TEXT NOT NULL,
        error_type TEXT,
        error_detail TEXT,
        response_time_ms INTEGER,
        input_price REAL,
        output_price REAL,
        cache_write_price REAL,
        cache_read_price REAL,
        total_cost REAL NOT NULL DEFAULT 0,
        pricing_template_id TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_token_logs_session ON token_logs(tool_type, session_id);
    CREATE INDEX IF NOT EXISTS idx_token_logs_timestamp ON token_logs(timestamp);
    CREATE INDEX IF NOT EXISTS idx_token_logs_config ON token_logs(config_name);";

const SELECT_COLUMNS: &str = "id, tool_type, timestamp, client_ip, session_id, config_name, model, message_id,
    input_tokens, output_tokens, cache_creation_tokens, cache_read_tokens,
    request_status, response_type, error_type, error_detail, response_time_ms,
    input_price, output_price, cache_write_price, cache_read_price, total_cost, pricing_template_id";

type Slot = Mutex<Option<Connection>>;

/// 底层 SQLite 存储
pub struct TokenStatsStore {
    path: PathBuf,
    writer: Slot,
    reader: Slot,
    maintenance: Slot,
}

fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(conn)
}

fn with_conn<T>(slot: &Slot, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
    let mut guard = slot.lock();
    let conn = guard.as_mut().ok_or(StatsError::Closed)?;
    f(conn)
}

impl TokenStatsStore {
    /// 打开（或创建）数据库并初始化表结构
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let writer = open_connection(&path)?;
        writer.execute_batch(SCHEMA)?;
        let reader = open_connection(&path)?;
        let maintenance = open_connection(&path)?;

        tracing::info!(path = %path.display(), "Token 统计数据库已打开");

        Ok(Self {
            path,
            writer: Mutex::new(Some(writer)),
            reader: Mutex::new(Some(reader)),
            maintenance: Mutex::new(Some(maintenance)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 单事务批量插入，返回写入条数
    pub fn insert_batch(&self, records: &[LogRecord]) -> Result<usize> {
        with_conn(&self.writer, |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO token_logs (tool_type, timestamp, client_ip, session_id, config_name, model, message_id,
                        input_tokens, output_tokens, cache_creation_tokens, cache_read_tokens,
                        request_status, response_type, error_type, error_detail, response_time_ms,
                        input_price, output_price, cache_write_price, cache_read_price, total_cost, pricing_template_id)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22)",
                )?;
                for record in records {
                    stmt.execute(rusqlite::params![
                        record.tool_type.as_str(),
                        record.timestamp,
                        record.client_ip,
                        record.session_id,
                        record.config_name,
                        record.model,
                        record.message_id,
                        record.input_tokens,
                        record.output_tokens,
                        record.cache_creation_tokens,
                        record.cache_read_tokens,
                        record.status().as_str(),
                        record.response_type.as_str(),
                        record.outcome.error_type().map(|e| e.as_str()),
                        record.outcome.error_detail(),
                        record.response_time_ms,
                        record.input_price,
                        record.output_price,
                        record.cache_write_price,
                        record.cache_read_price,
                        record.total_cost,
                        record.pricing_template_id,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(records.len())
        })
    }

    /// 在写连接上执行 checkpoint（批量写入后、关闭时）
    pub fn checkpoint_writer(&self, mode: CheckpointMode) -> Result<CheckpointReport> {
        with_conn(&self.writer, |conn| Ok(checkpoint::run_checkpoint(conn, mode)?))
    }

    /// 在维护连接上执行 checkpoint（定期维护、清理后、手动）
    pub fn checkpoint(&self, mode: CheckpointMode) -> Result<CheckpointReport> {
        with_conn(&self.maintenance, |conn| Ok(checkpoint::run_checkpoint(conn, mode)?))
    }

    /// 按保留策略清理旧日志，返回删除行数
    ///
    /// 按时间与按数量两步在同一个 IMMEDIATE 事务内完成。
    pub fn cleanup(&self, policy: &RetentionPolicy, now_ms: i64) -> Result<usize> {
        if policy.is_unbounded() {
            return Ok(0);
        }
        with_conn(&self.maintenance, |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let deleted = retention::purge(&tx, policy, now_ms)?;
            tx.commit()?;
            Ok(deleted)
        })
    }

    /// 分页查询日志（按时间倒序）
    pub fn query_logs(&self, query: &LogQuery) -> Result<LogPage> {
        if let (Some(start), Some(end)) = (query.start_time, query.end_time) {
            if end < start {
                return Err(StatsError::InvalidQuery(format!(
                    "endTime ({}) 早于 startTime ({})",
                    end, start
                )));
            }
        }

        let page = query.page;
        let page_size = query.effective_page_size();
        let offset = page as i64 * page_size as i64;

        let mut where_clauses = Vec::new();
        let mut params: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(tool_type) = query.tool_type {
            where_clauses.push(format!("tool_type = ?{}", params.len() + 1));
            params.push(Box::new(tool_type.as_str()));
        }
        if let Some(ref session_id) = query.session_id {
            where_clauses.push(format!("session_id = ?{}", params.len() + 1));
            params.push(Box::new(session_id.clone()));
        }
        if let Some(ref config_name) = query.config_name {
            where_clauses.push(format!("config_name = ?{}", params.len() + 1));
            params.push(Box::new(config_name.clone()));
        }
        if let Some(start_time) = query.start_time {
            where_clauses.push(format!("timestamp >= ?{}", params.len() + 1));
            params.push(Box::new(start_time));
        }
        if let Some(end_time) = query.end_time {
            where_clauses.push(format!("timestamp <= ?{}", params.len() + 1));
            params.push(Box::new(end_time));
        }

        let where_sql = if where_clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", where_clauses.join(" AND "))
        };

        with_conn(&self.reader, |conn| {
            // 计数与分页共享同一快照
            let tx = conn.transaction()?;

            let count_sql = format!("SELECT COUNT(*) FROM token_logs {}", where_sql);
            let total: i64 = tx.query_row(
                &count_sql,
                rusqlite::params_from_iter(params.iter().map(|p| p.as_ref())),
                |row| row.get(0),
            )?;

            let query_sql = format!(
                "SELECT {} FROM token_logs {} ORDER BY timestamp DESC, id DESC LIMIT ?{} OFFSET ?{}",
                SELECT_COLUMNS,
                where_sql,
                params.len() + 1,
                params.len() + 2
            );
            params.push(Box::new(page_size as i64));
            params.push(Box::new(offset));

            let logs = {
                let mut stmt = tx.prepare(&query_sql)?;
                stmt.query_map(
                    rusqlite::params_from_iter(params.iter().map(|p| p.as_ref())),
                    row_to_record,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?
            };
            tx.commit()?;

            Ok(LogPage {
                logs,
                total: total as u64,
                page,
                page_size,
            })
        })
    }

    /// 会话实时统计（每次都重新聚合）
    pub fn session_stats(&self, tool_type: ToolType, session_id: &str) -> Result<SessionStats> {
        with_conn(&self.reader, |conn| {
            let stats = conn.query_row(
                "SELECT COALESCE(SUM(input_tokens), 0), COALESCE(SUM(output_tokens), 0),
                        COALESCE(SUM(cache_creation_tokens), 0), COALESCE(SUM(cache_read_tokens), 0),
                        COUNT(*), COALESCE(SUM(total_cost), 0.0)
                 FROM token_logs WHERE tool_type = ?1 AND session_id = ?2",
                rusqlite::params![tool_type.as_str(), session_id],
                |row| {
                    Ok(SessionStats {
                        tool_type,
                        session_id: session_id.to_string(),
                        total_input_tokens: row.get(0)?,
                        total_output_tokens: row.get(1)?,
                        total_cache_creation_tokens: row.get(2)?,
                        total_cache_read_tokens: row.get(3)?,
                        request_count: row.get::<_, i64>(4)? as u64,
                        total_cost: row.get(5)?,
                    })
                },
            )?;
            Ok(stats)
        })
    }

    /// 数据库摘要：总数、最早/最晚时间戳、文件大小
    pub fn summary(&self) -> Result<DatabaseSummary> {
        let (total, oldest, newest) = with_conn(&self.reader, |conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*), MIN(timestamp), MAX(timestamp) FROM token_logs",
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Option<i64>>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                    ))
                },
            )?)
        })?;

        let db_size_bytes = file_len(&self.path);
        let mut wal_path = self.path.clone().into_os_string();
        wal_path.push("-wal");
        let wal_size_bytes = file_len(Path::new(&wal_path));

        Ok(DatabaseSummary {
            total_logs: total as u64,
            oldest_timestamp: oldest,
            newest_timestamp: newest,
            db_size_bytes,
            wal_size_bytes,
        })
    }

    /// 时间分桶趋势
    pub fn query_trends(&self, query: &TrendQuery) -> Result<Vec<TrendBucket>> {
        with_conn(&self.reader, |conn| analytics::query_trends(conn, query))
    }

    /// 成本摘要
    pub fn query_cost_summary(&self, query: &CostSummaryQuery) -> Result<CostSummary> {
        with_conn(&self.reader, |conn| analytics::query_cost_summary(conn, query))
    }

    /// 关闭全部连接，之后所有操作返回 `StatsError::Closed`
    pub fn close(&self) {
        for (name, slot) in [
            ("writer", &self.writer),
            ("reader", &self.reader),
            ("maintenance", &self.maintenance),
        ] {
            if let Some(conn) = slot.lock().take() {
                if let Err((_, e)) = conn.close() {
                    tracing::warn!(connection = name, error = %e, "关闭数据库连接失败");
                }
            }
        }
        tracing::info!(path = %self.path.display(), "Token 统计数据库已关闭");
    }

    pub fn is_closed(&self) -> bool {
        self.writer.lock().is_none()
    }
}

fn file_len(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

fn conversion_error(index: usize, e: StatsError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(e))
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<LogRecord> {
    let tool_type = row
        .get::<_, String>(1)?
        .parse::<ToolType>()
        .map_err(|e| conversion_error(1, e))?;

    let request_status: String = row.get(12)?;
    let error_type: Option<String> = row.get(14)?;
    let error_detail: Option<String> = row.get(15)?;
    let outcome = if request_status == "failed" {
        RequestOutcome::Failed {
            error_type: error_type
                .as_deref()
                .map(ErrorType::from_db)
                .unwrap_or(ErrorType::UpstreamError),
            error_detail: error_detail.unwrap_or_default(),
        }
    } else {
        RequestOutcome::Success
    };

    Ok(LogRecord {
        id: row.get(0)?,
        tool_type,
        timestamp: row.get(2)?,
        client_ip: row.get(3)?,
        session_id: row.get(4)?,
        config_name: row.get(5)?,
        model: row.get(6)?,
        message_id: row.get(7)?,
        input_tokens: row.get(8)?,
        output_tokens: row.get(9)?,
        cache_creation_tokens: row.get(10)?,
        cache_read_tokens: row.get(11)?,
        response_type: ResponseType::from_db(&row.get::<_, String>(13)?),
        outcome,
        response_time_ms: row.get(16)?,
        input_price: row.get(17)?,
        output_price: row.get(18)?,
        cache_write_price: row.get(19)?,
        cache_read_price: row.get(20)?,
        total_cost: row.get(21)?,
        pricing_template_id: row.get(22)?,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn open_temp() -> (tempfile::TempDir, TokenStatsStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStatsStore::open(dir.path().join("token_stats.db")).unwrap();
        (dir, store)
    }

    pub(crate) fn sample(session: &str, timestamp: i64) -> LogRecord {
        LogRecord::success(
            ToolType::ClaudeCode,
            timestamp,
            session,
            "default",
            "claude-sonnet-4-5",
            ResponseType::Sse,
        )
        .with_tokens(100, 50, 10, 20)
        .with_client_ip("127.0.0.1")
    }

    #[test]
    fn test_round_trip_preserves_every_field() {
        let (_dir, store) = open_temp();

        let mut ok = sample("s1", 1_000)
            .with_message_id("msg_1")
            .with_response_time(321);
        ok.input_price = Some(0.0003);
        ok.output_price = Some(0.00075);
        ok.cache_write_price = Some(0.0000375);
        ok.cache_read_price = Some(0.000006);
        ok.total_cost = 0.0010935;
        ok.pricing_template_id = Some("builtin".to_string());

        let failed = LogRecord::failed(
            ToolType::Codex,
            2_000,
            "s2",
            "work",
            "gpt-5-codex",
            ResponseType::Sse,
            ErrorType::RequestInterrupted,
            "client disconnected",
        )
        .with_tokens(10, 3, 0, 0);

        store.insert_batch(&[ok.clone(), failed.clone()]).unwrap();

        let page = store.query_logs(&LogQuery::default()).unwrap();
        assert_eq!(page.total, 2);

        // 倒序：failed 在前
        let mut got_failed = page.logs[0].clone();
        let mut got_ok = page.logs[1].clone();
        assert!(got_failed.id > 0 && got_ok.id > 0);
        got_failed.id = 0;
        got_ok.id = 0;
        assert_eq!(got_failed, failed);
        assert_eq!(got_ok, ok);
    }

    #[test]
    fn test_pagination_total_matches_filter() {
        let (_dir, store) = open_temp();
        let mut batch = Vec::new();
        for i in 0..45 {
            let mut record = sample(if i % 3 == 0 { "a" } else { "b" }, 1_000 + i);
            if i % 5 == 0 {
                record.config_name = "alt".to_string();
            }
            batch.push(record);
        }
        store.insert_batch(&batch).unwrap();

        let query = LogQuery {
            session_id: Some("b".to_string()),
            page_size: Some(20),
            ..Default::default()
        };
        let first = store.query_logs(&query).unwrap();
        assert_eq!(first.total, 30);
        assert_eq!(first.logs.len(), 20);
        assert!(first.logs.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));

        let second = store
            .query_logs(&LogQuery {
                page: 1,
                ..query.clone()
            })
            .unwrap();
        assert_eq!(second.total, 30);
        assert_eq!(second.logs.len(), 10);

        let unpaged = store
            .query_logs(&LogQuery {
                page_size: Some(crate::token_stats::types::MAX_PAGE_SIZE),
                ..query
            })
            .unwrap();
        assert_eq!(unpaged.logs.len() as u64, first.total);

        let alt = store
            .query_logs(&LogQuery {
                config_name: Some("alt".to_string()),
                start_time: Some(1_010),
                end_time: Some(1_030),
                ..Default::default()
            })
            .unwrap();
        // 1010、1015、1020、1025、1030
        assert_eq!(alt.total, 5);
    }

    #[test]
    fn test_query_rejects_inverted_range() {
        let (_dir, store) = open_temp();
        let result = store.query_logs(&LogQuery {
            start_time: Some(10),
            end_time: Some(5),
            ..Default::default()
        });
        assert!(matches!(result, Err(StatsError::InvalidQuery(_))));
    }

    #[test]
    fn test_session_stats_sums() {
        let (_dir, store) = open_temp();
        let mut records = vec![
            sample("s1", 1).with_tokens(100, 1, 2, 3),
            sample("s1", 2).with_tokens(250, 4, 5, 6),
            sample("s2", 3).with_tokens(999, 9, 9, 9),
        ];
        let mut other_tool = sample("s1", 4).with_tokens(7, 7, 7, 7);
        other_tool.tool_type = ToolType::Codex;
        records.push(other_tool);
        store.insert_batch(&records).unwrap();

        let stats = store.session_stats(ToolType::ClaudeCode, "s1").unwrap();
        assert_eq!(stats.total_input_tokens, 350);
        assert_eq!(stats.total_output_tokens, 5);
        assert_eq!(stats.total_cache_creation_tokens, 7);
        assert_eq!(stats.total_cache_read_tokens, 9);
        assert_eq!(stats.request_count, 2);

        let empty = store.session_stats(ToolType::GeminiCli, "nope").unwrap();
        assert_eq!(empty.request_count, 0);
        assert_eq!(empty.total_input_tokens, 0);
    }

    #[test]
    fn test_summary() {
        let (_dir, store) = open_temp();
        let empty = store.summary().unwrap();
        assert_eq!(empty.total_logs, 0);
        assert_eq!(empty.oldest_timestamp, None);
        assert_eq!(empty.newest_timestamp, None);

        store
            .insert_batch(&[sample("s", 500), sample("s", 100), sample("s", 900)])
            .unwrap();
        let summary = store.summary().unwrap();
        assert_eq!(summary.total_logs, 3);
        assert_eq!(summary.oldest_timestamp, Some(100));
        assert_eq!(summary.newest_timestamp, Some(900));
        assert!(summary.db_size_bytes > 0);
    }

    #[test]
    fn test_closed_store_returns_typed_error() {
        let (_dir, store) = open_temp();
        store.close();
        assert!(store.is_closed());
        assert!(matches!(store.summary(), Err(StatsError::Closed)));
        assert!(matches!(
            store.insert_batch(&[sample("s", 1)]),
            Err(StatsError::Closed)
        ));
    }
}
