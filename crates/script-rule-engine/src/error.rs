//! 规则引擎错误类型
//!
//! `RuleError` 是规则存储 CRUD 与服务层向调用方返回的错误；
//! `ScriptError` 描述单次脚本执行的失败，在评估路径上只作为执行记录中的数据存在。

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("参数验证失败: {field} - {message}")]
    Validation { field: String, message: String },

    #[error("记录未找到: {entity} id={id}")]
    NotFound { entity: &'static str, id: String },

    #[error("操作冲突: {0}")]
    Conflict(String),

    #[error("未授权访问")]
    Unauthorized,

    #[error("JSON 序列化错误: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("内部错误: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, RuleError>;

impl RuleError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// 脚本语法检查失败转换为字段级验证错误
    pub fn invalid_script(field: &str, err: ScriptError) -> Self {
        Self::validation(field, err.to_string())
    }

    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::JsonError(_) => "INVALID_JSON",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// 对应的 HTTP 状态码（供传输层映射）
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation { .. } | Self::JsonError(_) => 400,
            Self::Unauthorized => 401,
            Self::NotFound { .. } => 404,
            Self::Conflict(_) => 409,
            Self::Internal(_) => 500,
        }
    }
}

impl From<validator::ValidationErrors> for RuleError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let (field, message) = errors
            .field_errors()
            .into_iter()
            .next()
            .map(|(field, errs)| {
                let message = errs
                    .first()
                    .and_then(|e| e.message.as_ref().map(|m| m.to_string()))
                    .unwrap_or_else(|| "invalid value".to_string());
                (field.to_string(), message)
            })
            .unwrap_or_else(|| ("request".to_string(), errors.to_string()));

        Self::Validation { field, message }
    }
}

/// 脚本失败分类（用于分析统计）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScriptErrorKind {
    Syntax,
    Runtime,
    Timeout,
    ResourceExceeded,
    InvalidResult,
}

impl ScriptErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Syntax => "SYNTAX",
            Self::Runtime => "RUNTIME",
            Self::Timeout => "TIMEOUT",
            Self::ResourceExceeded => "RESOURCE_EXCEEDED",
            Self::InvalidResult => "INVALID_RESULT",
        }
    }
}

impl fmt::Display for ScriptErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单次脚本执行失败
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScriptError {
    #[error("脚本语法错误: {message}")]
    Syntax {
        message: String,
        line: Option<usize>,
    },

    #[error("脚本执行失败: {0}")]
    Runtime(String),

    #[error("脚本执行超时: 超过 {limit_ms}ms")]
    Timeout { limit_ms: u64 },

    #[error("脚本资源超限: {0}")]
    ResourceExceeded(String),

    #[error("脚本返回值无效: 期望 {expected}, 实际 {actual}")]
    InvalidResult { expected: String, actual: String },
}

impl ScriptError {
    pub fn kind(&self) -> ScriptErrorKind {
        match self {
            Self::Syntax { .. } => ScriptErrorKind::Syntax,
            Self::Runtime(_) => ScriptErrorKind::Runtime,
            Self::Timeout { .. } => ScriptErrorKind::Timeout,
            Self::ResourceExceeded(_) => ScriptErrorKind::ResourceExceeded,
            Self::InvalidResult { .. } => ScriptErrorKind::InvalidResult,
        }
    }
}
