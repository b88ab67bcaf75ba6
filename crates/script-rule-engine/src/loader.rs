//! 规则种子文件加载
//!
//! 启动时从 JSON 文件批量创建动作、规则与触发器。文件中动作以 `key` 命名，
//! 规则与触发器通过 key 引用动作：
//!
//! ```json
//! {
//!   "actions": [{ "key": "alert", "script": "log_message(\"warn\", \"hot\")" }],
//!   "rules": [{
//!     "name": "高温告警",
//!     "script": "event.temperature > 25",
//!     "priority": 10,
//!     "actions": ["alert"],
//!     "triggers": [{ "type": "CONDITIONAL", "condition_script": "event.device_id == \"sensor_1\"", "actions": ["alert"] }]
//!   }]
//! }
//! ```

use crate::error::{Result, RuleError};
use crate::models::{NewAction, NewRule, NewTrigger, TriggerKind};
use crate::store::RuleStore;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, instrument};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
struct SeedFile {
    #[serde(default)]
    actions: Vec<SeedAction>,
    #[serde(default)]
    rules: Vec<SeedRule>,
}

#[derive(Debug, Deserialize)]
struct SeedAction {
    key: String,
    #[serde(default)]
    name: Option<String>,
    script: String,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

#[derive(Debug, Deserialize)]
struct SeedRule {
    name: String,
    script: String,
    #[serde(default)]
    priority: i32,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    actions: Vec<String>,
    #[serde(default)]
    triggers: Vec<SeedTrigger>,
}

#[derive(Debug, Deserialize)]
struct SeedTrigger {
    #[serde(rename = "type")]
    kind: TriggerKind,
    #[serde(default)]
    condition_script: Option<String>,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    actions: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

/// 加载结果统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub actions: usize,
    pub rules: usize,
    pub triggers: usize,
}

/// 从 JSON 文件加载种子数据
pub fn load_file(path: impl AsRef<Path>, store: &RuleStore) -> Result<LoadSummary> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .map_err(|e| RuleError::Internal(format!("无法读取规则文件 {}: {}", path.display(), e)))?;
    load_str(&content, store)
}

/// 从 JSON 字符串加载种子数据，遇到第一个错误即停止
#[instrument(skip(json, store))]
pub fn load_str(json: &str, store: &RuleStore) -> Result<LoadSummary> {
    let seed: SeedFile = serde_json::from_str(json)?;
    let mut summary = LoadSummary::default();
    let mut keys: HashMap<String, Uuid> = HashMap::new();

    for action in seed.actions {
        if keys.contains_key(&action.key) {
            return Err(RuleError::validation(
                "actions.key",
                format!("重复的动作 key: {}", action.key),
            ));
        }
        let created = store.create_action(NewAction {
            name: action.name.or_else(|| Some(action.key.clone())),
            script: action.script,
            enabled: action.enabled,
        })?;
        keys.insert(action.key, created.id);
        summary.actions += 1;
    }

    let resolve = |key: &str| {
        keys.get(key)
            .copied()
            .ok_or_else(|| RuleError::not_found("action", key))
    };

    for rule in seed.rules {
        let created = store.create_rule(NewRule {
            name: rule.name,
            script: rule.script,
            priority: rule.priority,
            enabled: rule.enabled,
        })?;
        summary.rules += 1;

        for key in &rule.actions {
            store.add_rule_action(&created.id, &resolve(key)?)?;
        }

        for trigger in rule.triggers {
            let new = NewTrigger {
                rule_id: created.id,
                kind: trigger.kind,
                condition_script: trigger.condition_script,
                enabled: trigger.enabled,
            };
            let trigger_id = store.create_trigger(new)?.id;
            summary.triggers += 1;

            for key in &trigger.actions {
                store.bind_action(&trigger_id, &resolve(key)?)?;
            }
        }
    }

    info!(
        actions = summary.actions,
        rules = summary.rules,
        triggers = summary.triggers,
        "规则种子数据已加载"
    );
    Ok(summary)
}
