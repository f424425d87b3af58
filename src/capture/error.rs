//! 捕获错误类型

use std::path::PathBuf;

/// 单条流量捕获失败的原因
///
/// 只影响当前这条流量，由 [`CaptureAddon`](super::CaptureAddon) 记录日志后丢弃
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    /// 流量没有响应（请求未完成）
    MissingResponse,
    /// 必需字段为空
    MissingField(&'static str),
    /// 非法的 HTTP 方法
    InvalidMethod(String),
    /// 非法的状态码
    InvalidStatus(u16),
}

impl std::fmt::Display for CaptureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureError::MissingResponse => write!(f, "flow has no response"),
            CaptureError::MissingField(field) => write!(f, "missing field `{}`", field),
            CaptureError::InvalidMethod(method) => write!(f, "invalid HTTP method `{}`", method),
            CaptureError::InvalidStatus(status) => write!(f, "invalid status code {}", status),
        }
    }
}

impl std::error::Error for CaptureError {}

/// 持久化失败
///
/// 发生时该批次数据不会重新入队
#[derive(Debug)]
pub enum PersistError {
    /// 创建输出目录失败
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    /// 序列化失败
    Serialize {
        path: PathBuf,
        source: serde_json::Error,
    },
    /// 写入文件失败（磁盘满、权限不足等）
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl PersistError {
    /// 出错时尝试写入的路径
    pub fn path(&self) -> &std::path::Path {
        match self {
            PersistError::CreateDir { path, .. }
            | PersistError::Serialize { path, .. }
            | PersistError::Write { path, .. } => path,
        }
    }
}

impl std::fmt::Display for PersistError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PersistError::CreateDir { path, source } => {
                write!(f, "failed to create {}: {}", path.display(), source)
            }
            PersistError::Serialize { path, source } => {
                write!(f, "failed to serialize {}: {}", path.display(), source)
            }
            PersistError::Write { path, source } => {
                write!(f, "failed to write {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for PersistError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PersistError::CreateDir { source, .. } | PersistError::Write { source, .. } => {
                Some(source)
            }
            PersistError::Serialize { source, .. } => Some(source),
        }
    }
}
