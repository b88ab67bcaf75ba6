//! 规则引擎领域模型
//!
//! Rule / Trigger / Action 三类实体及其创建、局部更新、查询过滤参数。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// 规则定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: Uuid,
    pub name: String,
    /// 谓词脚本，返回 true 表示匹配
    pub script: String,
    /// 优先级，数值越大越先评估
    pub priority: i32,
    pub enabled: bool,
    /// 按声明顺序排列的触发器 ID
    pub triggers: Vec<Uuid>,
    /// 直接挂在规则上的动作 ID
    pub actions: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// 创建序号，优先级相同时按此升序
    #[serde(skip)]
    pub(crate) sequence: u64,
}

impl Rule {
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

/// 触发器类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerKind {
    /// 所属规则匹配即触发
    Unconditional,
    /// 所属规则匹配且自身条件脚本为 true 时触发
    Conditional,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unconditional => "UNCONDITIONAL",
            Self::Conditional => "CONDITIONAL",
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 触发器定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub id: Uuid,
    /// 所属规则，创建后不可变
    pub rule_id: Uuid,
    #[serde(rename = "type")]
    pub kind: TriggerKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition_script: Option<String>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 动作定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub script: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 规则详情：触发器与动作已展开
#[derive(Debug, Clone, Serialize)]
pub struct RuleDetail {
    pub id: Uuid,
    pub name: String,
    pub script: String,
    pub priority: i32,
    pub enabled: bool,
    pub triggers: Vec<Trigger>,
    pub actions: Vec<Action>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_enabled() -> bool {
    true
}

/// 新建规则参数
#[derive(Debug, Clone, Deserialize)]
pub struct NewRule {
    pub name: String,
    pub script: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl NewRule {
    pub fn new(name: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: script.into(),
            priority: 0,
            enabled: true,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// 规则局部更新，缺省字段保持不变
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RulePatch {
    pub name: Option<String>,
    pub script: Option<String>,
    pub priority: Option<i32>,
    pub enabled: Option<bool>,
}

impl RulePatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.script.is_none() && self.priority.is_none() && self.enabled.is_none()
    }
}

/// 新建触发器参数
#[derive(Debug, Clone, Deserialize)]
pub struct NewTrigger {
    pub rule_id: Uuid,
    #[serde(rename = "type")]
    pub kind: TriggerKind,
    #[serde(default)]
    pub condition_script: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl NewTrigger {
    pub fn unconditional(rule_id: Uuid) -> Self {
        Self {
            rule_id,
            kind: TriggerKind::Unconditional,
            condition_script: None,
            enabled: true,
        }
    }

    pub fn conditional(rule_id: Uuid, condition_script: impl Into<String>) -> Self {
        Self {
            rule_id,
            kind: TriggerKind::Conditional,
            condition_script: Some(condition_script.into()),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TriggerPatch {
    pub condition_script: Option<String>,
    pub enabled: Option<bool>,
}

/// 新建动作参数
#[derive(Debug, Clone, Deserialize)]
pub struct NewAction {
    #[serde(default)]
    pub name: Option<String>,
    pub script: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl NewAction {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            name: None,
            script: script.into(),
            enabled: true,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ActionPatch {
    pub name: Option<String>,
    pub script: Option<String>,
    pub enabled: Option<bool>,
}

/// 规则列表过滤条件
#[derive(Debug, Clone, Default)]
pub struct RuleFilter {
    pub enabled: Option<bool>,
    pub limit: Option<usize>,
    pub offset: usize,
}

#[derive(Debug, Clone, Default)]
pub struct TriggerFilter {
    pub rule_id: Option<Uuid>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct ActionFilter {
    pub enabled: Option<bool>,
}

/// 规则删除结果（包含级联删除的实体）
#[derive(Debug, Clone, Default, Serialize)]
pub struct RuleDeletion {
    pub rule_id: Uuid,
    pub deleted_triggers: Vec<Uuid>,
    pub deleted_actions: Vec<Uuid>,
}

/// 待评估事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub payload: Value,
    pub received_at: DateTime<Utc>,
}

impl Event {
    pub fn new(payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            received_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    /// 获取字段值（支持点号分隔的路径，如 "sensor.reading.value" 或 "items.0.name"）
    pub fn get_field(&self, path: &str) -> Option<&Value> {
        let mut current = &self.payload;

        for part in path.split('.') {
            match current {
                Value::Object(map) => {
                    current = map.get(part)?;
                }
                Value::Array(arr) => {
                    let index: usize = part.parse().ok()?;
                    current = arr.get(index)?;
                }
                _ => return None,
            }
        }

        Some(current)
    }
}
