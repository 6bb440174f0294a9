//! Token 统计错误类型

use thiserror::Error;

/// 存储与查询错误
#[derive(Debug, Error)]
pub enum StatsError {
    /// 调用方传入的参数无效
    #[error("无效的查询参数: {0}")]
    InvalidQuery(String),

    /// 存储已关闭（进程正在退出）
    #[error("Token 统计存储已关闭")]
    Closed,

    #[error("数据库错误: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    /// 后台阻塞任务执行失败
    #[error("后台任务失败: {0}")]
    Task(String),
}

impl From<tokio::task::JoinError> for StatsError {
    fn from(e: tokio::task::JoinError) -> Self {
        StatsError::Task(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StatsError>;
