//! 执行记录
//!
//! 每个 (事件, 规则) 评估产生一条不可变的 `ExecutionRecord`，
//! 包含谓词结果、触发器与动作的执行结果以及脚本失败信息。

use crate::error::{ScriptError, ScriptErrorKind};
use crate::models::TriggerKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 事件评估状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvaluationStatus {
    #[default]
    Completed,
    /// 评估截止时间已到，剩余规则被跳过
    PartiallyEvaluated,
}

impl EvaluationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "COMPLETED",
            Self::PartiallyEvaluated => "PARTIALLY_EVALUATED",
        }
    }
}

/// 记录在执行结果上的脚本失败
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptFailure {
    pub kind: ScriptErrorKind,
    pub message: String,
}

impl From<&ScriptError> for ScriptFailure {
    fn from(err: &ScriptError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerOutcome {
    pub trigger_id: Uuid,
    pub kind: TriggerKind,
    pub fired: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ScriptFailure>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub action_id: Uuid,
    pub trigger_id: Uuid,
    /// 因失败策略被跳过时为 false
    pub executed: bool,
    pub succeeded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ScriptFailure>,
    pub duration_ms: f64,
    /// 动作脚本通过 log_message 输出的日志
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<String>,
}

impl ActionOutcome {
    pub(crate) fn skipped(action_id: Uuid, trigger_id: Uuid) -> Self {
        Self {
            action_id,
            trigger_id,
            executed: false,
            succeeded: false,
            error: None,
            duration_ms: 0.0,
            logs: Vec::new(),
        }
    }
}

/// 单个 (事件, 规则) 的评估结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub event_id: Uuid,
    pub rule_id: Uuid,
    pub rule_name: String,
    pub matched: bool,
    /// 谓词脚本失败信息
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ScriptFailure>,
    pub triggers: Vec<TriggerOutcome>,
    pub actions: Vec<ActionOutcome>,
    pub duration_ms: f64,
    pub timestamp: DateTime<Utc>,
    pub status: EvaluationStatus,
}

impl ExecutionRecord {
    /// 本条记录中所有脚本失败
    pub fn failures(&self) -> impl Iterator<Item = &ScriptFailure> {
        self.error
            .iter()
            .chain(self.triggers.iter().filter_map(|t| t.error.as_ref()))
            .chain(self.actions.iter().filter_map(|a| a.error.as_ref()))
    }

    pub fn has_error(&self) -> bool {
        self.failures().next().is_some()
    }

    pub fn fired_triggers(&self) -> impl Iterator<Item = &TriggerOutcome> {
        self.triggers.iter().filter(|t| t.fired)
    }
}
