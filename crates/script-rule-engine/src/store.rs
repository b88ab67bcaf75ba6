//! 规则存储管理
//!
//! 规则、触发器、动作及其绑定关系构成一张不可变的 `RuleGraph`，
//! 通过 `ArcSwap` 发布。读取方获取快照只需一次原子指针加载，永远不会被写入阻塞，
//! 也看不到未提交完的修改；写入方在互斥锁内复制当前图、修改并整体替换。

use crate::error::{Result, RuleError};
use crate::models::{
    Action, ActionFilter, ActionPatch, NewAction, NewRule, NewTrigger, Rule, RuleDeletion,
    RuleDetail, RuleFilter, RulePatch, Trigger, TriggerFilter, TriggerKind, TriggerPatch,
};
use crate::sandbox::ScriptSandbox;
use arc_swap::ArcSwap;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

pub const MAX_NAME_LENGTH: usize = 255;
pub const MAX_SCRIPT_LENGTH: usize = 10_000;
pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const MAX_PAGE_SIZE: usize = 1_000;

/// 规则图的一个不可变版本
#[derive(Debug, Clone, Default)]
pub struct RuleGraph {
    version: u64,
    next_sequence: u64,
    rules: HashMap<Uuid, Arc<Rule>>,
    triggers: HashMap<Uuid, Arc<Trigger>>,
    actions: HashMap<Uuid, Arc<Action>>,
    /// (trigger_id, action_id) -> 绑定序号
    bindings: BTreeMap<(Uuid, Uuid), u64>,
}

impl RuleGraph {
    /// 图版本号，每次成功写入递增
    pub fn version(&self) -> u64 {
        self.version
    }

    /// 按 ID 查找规则
    pub fn rule(&self, id: &Uuid) -> Option<&Arc<Rule>> {
        self.rules.get(id)
    }

    /// 按 ID 查找触发器
    pub fn trigger(&self, id: &Uuid) -> Option<&Arc<Trigger>> {
        self.triggers.get(id)
    }

    /// 按 ID 查找动作
    pub fn action(&self, id: &Uuid) -> Option<&Arc<Action>> {
        self.actions.get(id)
    }

    /// 按评估顺序排列的规则：优先级降序，创建序号升序
    pub fn rules_in_order(&self, enabled_only: bool) -> Vec<Arc<Rule>> {
        let mut rules: Vec<_> = self
            .rules
            .values()
            .filter(|r| !enabled_only || r.enabled)
            .cloned()
            .collect();
        rules.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.sequence.cmp(&b.sequence))
        });
        rules
    }

    /// 显式绑定到触发器的动作 ID（按绑定顺序）
    pub fn bound_action_ids(&self, trigger_id: &Uuid) -> Vec<Uuid> {
        let mut bound: Vec<(u64, Uuid)> = self
            .bindings
            .range((*trigger_id, Uuid::nil())..)
            .take_while(|((t, _), _)| t == trigger_id)
            .map(|((_, a), seq)| (*seq, *a))
            .collect();
        bound.sort_unstable();
        bound.into_iter().map(|(_, a)| a).collect()
    }

    /// 触发器触发时应执行的动作
    ///
    /// 有显式绑定时使用绑定的动作，否则使用所属规则的动作列表。
    pub fn actions_for_trigger(&self, trigger: &Trigger) -> Vec<Arc<Action>> {
        let bound = self.bound_action_ids(&trigger.id);
        let ids = if bound.is_empty() {
            self.rules
                .get(&trigger.rule_id)
                .map(|r| r.actions.clone())
                .unwrap_or_default()
        } else {
            bound
        };

        ids.iter()
            .filter_map(|id| self.actions.get(id).cloned())
            .collect()
    }

    /// 动作是否仍被任何触发器绑定或规则引用
    pub fn is_action_referenced(&self, action_id: &Uuid) -> bool {
        self.bindings.keys().any(|(_, a)| a == action_id)
            || self.rules.values().any(|r| r.actions.contains(action_id))
    }

    /// 当前版本中各类实体的数量
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            version: self.version,
            rules_count: self.rules.len(),
            enabled_rules: self.rules.values().filter(|r| r.enabled).count(),
            triggers_count: self.triggers.len(),
            actions_count: self.actions.len(),
            bindings_count: self.bindings.len(),
        }
    }

    fn next_sequence(&mut self) -> u64 {
        self.next_sequence += 1;
        self.next_sequence
    }

    fn rule_mut(&mut self, id: &Uuid) -> Result<&mut Rule> {
        self.rules
            .get_mut(id)
            .map(Arc::make_mut)
            .ok_or_else(|| RuleError::not_found("rule", id))
    }

    fn require_trigger(&self, id: &Uuid) -> Result<&Arc<Trigger>> {
        self.triggers
            .get(id)
            .ok_or_else(|| RuleError::not_found("trigger", id))
    }

    fn require_action(&self, id: &Uuid) -> Result<&Arc<Action>> {
        self.actions
            .get(id)
            .ok_or_else(|| RuleError::not_found("action", id))
    }
}

/// 规则存储统计信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStats {
    pub version: u64,
    pub rules_count: usize,
    pub enabled_rules: usize,
    pub triggers_count: usize,
    pub actions_count: usize,
    pub bindings_count: usize,
}

/// 规则存储
#[derive(Clone)]
pub struct RuleStore {
    current: Arc<ArcSwap<RuleGraph>>,
    /// 写入方之间串行化
    write_lock: Arc<Mutex<()>>,
    /// 用于提交前的脚本语法检查
    sandbox: Arc<dyn ScriptSandbox>,
}

impl RuleStore {
    /// 创建空存储，脚本写入前经 `sandbox` 做语法检查
    pub fn new(sandbox: Arc<dyn ScriptSandbox>) -> Self {
        Self {
            current: Arc::new(ArcSwap::from_pointee(RuleGraph::default())),
            write_lock: Arc::new(Mutex::new(())),
            sandbox,
        }
    }

    /// 获取当前一致性快照
    pub fn snapshot(&self) -> Arc<RuleGraph> {
        self.current.load_full()
    }

    /// 当前已发布的版本号
    pub fn version(&self) -> u64 {
        self.current.load().version
    }

    /// 当前快照的统计信息
    pub fn stats(&self) -> StoreStats {
        self.current.load().stats()
    }

    /// 在写锁内复制当前图并应用修改，成功后发布新版本
    fn mutate<T>(&self, apply: impl FnOnce(&mut RuleGraph) -> Result<T>) -> Result<T> {
        let _guard = self.write_lock.lock();

        let mut graph = RuleGraph::clone(&self.current.load());
        let out = apply(&mut graph)?;
        graph.version += 1;
        self.current.store(Arc::new(graph));

        Ok(out)
    }

    fn validate_name(field: &str, name: &str) -> Result<()> {
        let len = name.chars().count();
        if name.trim().is_empty() || len > MAX_NAME_LENGTH {
            return Err(RuleError::validation(
                field,
                format!("长度必须在 1 到 {} 个字符之间", MAX_NAME_LENGTH),
            ));
        }
        Ok(())
    }

    fn validate_script(&self, field: &str, script: &str) -> Result<()> {
        let len = script.chars().count();
        if script.trim().is_empty() || len > MAX_SCRIPT_LENGTH {
            return Err(RuleError::validation(
                field,
                format!("长度必须在 1 到 {} 个字符之间", MAX_SCRIPT_LENGTH),
            ));
        }
        self.sandbox
            .check(script)
            .map_err(|e| RuleError::invalid_script(field, e))
    }

    // ---- Rule ----

    /// 创建规则；谓词在提交前做语法检查
    #[instrument(skip(self, new), fields(rule_name = %new.name))]
    pub fn create_rule(&self, new: NewRule) -> Result<Rule> {
        Self::validate_name("name", &new.name)?;
        self.validate_script("script", &new.script)?;

        let rule = self.mutate(|graph| {
            let now = Utc::now();
            let rule = Rule {
                id: Uuid::new_v4(),
                name: new.name,
                script: new.script,
                priority: new.priority,
                enabled: new.enabled,
                triggers: Vec::new(),
                actions: Vec::new(),
                created_at: now,
                updated_at: now,
                sequence: graph.next_sequence(),
            };
            graph.rules.insert(rule.id, Arc::new(rule.clone()));
            Ok(rule)
        })?;

        info!(rule_id = %rule.id, priority = rule.priority, "规则已创建");
        Ok(rule)
    }

    /// 按 ID 读取规则，不存在时返回 NotFound
    pub fn get_rule(&self, id: &Uuid) -> Result<Rule> {
        self.current
            .load()
            .rule(id)
            .map(|r| Rule::clone(r))
            .ok_or_else(|| RuleError::not_found("rule", id))
    }

    /// 获取规则详情，展开触发器与动作
    pub fn get_rule_detail(&self, id: &Uuid) -> Result<RuleDetail> {
        let graph = self.snapshot();
        let rule = graph
            .rule(id)
            .ok_or_else(|| RuleError::not_found("rule", id))?;

        Ok(RuleDetail {
            id: rule.id,
            name: rule.name.clone(),
            script: rule.script.clone(),
            priority: rule.priority,
            enabled: rule.enabled,
            triggers: rule
                .triggers
                .iter()
                .filter_map(|t| graph.trigger(t).map(|t| Trigger::clone(t)))
                .collect(),
            actions: rule
                .actions
                .iter()
                .filter_map(|a| graph.action(a).map(|a| Action::clone(a)))
                .collect(),
            created_at: rule.created_at,
            updated_at: rule.updated_at,
        })
    }

    /// 按评估顺序列出规则
    pub fn list_rules(&self, filter: &RuleFilter) -> Vec<Rule> {
        let limit = filter.limit.unwrap_or(DEFAULT_PAGE_SIZE).min(MAX_PAGE_SIZE);

        self.current
            .load()
            .rules_in_order(false)
            .into_iter()
            .filter(|r| filter.enabled.is_none_or(|e| r.enabled == e))
            .skip(filter.offset)
            .take(limit)
            .map(|r| Rule::clone(&r))
            .collect()
    }

    /// 部分更新规则，仅修改补丁中出现的字段
    #[instrument(skip(self, patch), fields(rule_id = %id))]
    pub fn update_rule(&self, id: &Uuid, patch: RulePatch) -> Result<Rule> {
        if let Some(name) = &patch.name {
            Self::validate_name("name", name)?;
        }
        if let Some(script) = &patch.script {
            self.validate_script("script", script)?;
        }
        if patch.is_empty() {
            return self.get_rule(id);
        }

        let rule = self.mutate(|graph| {
            let rule = graph.rule_mut(id)?;
            if let Some(name) = patch.name {
                rule.name = name;
            }
            if let Some(script) = patch.script {
                rule.script = script;
            }
            if let Some(priority) = patch.priority {
                rule.priority = priority;
            }
            if let Some(enabled) = patch.enabled {
                rule.enabled = enabled;
            }
            rule.updated_at = Utc::now();
            Ok(rule.clone())
        })?;

        info!("规则已更新");
        Ok(rule)
    }

    /// 删除规则，级联删除其触发器、绑定以及不再被引用的动作
    #[instrument(skip(self), fields(rule_id = %id))]
    pub fn delete_rule(&self, id: &Uuid) -> Result<RuleDeletion> {
        let deletion = self.mutate(|graph| {
            let rule = graph
                .rules
                .remove(id)
                .ok_or_else(|| RuleError::not_found("rule", id))?;

            let mut candidates: Vec<Uuid> = rule.actions.clone();
            for trigger_id in &rule.triggers {
                graph.triggers.remove(trigger_id);
                candidates.extend(graph.bound_action_ids(trigger_id));
                graph.bindings.retain(|(t, _), _| t != trigger_id);
            }

            let mut seen = HashSet::new();
            let mut deleted_actions = Vec::new();
            for action_id in candidates {
                if seen.insert(action_id)
                    && !graph.is_action_referenced(&action_id)
                    && graph.actions.remove(&action_id).is_some()
                {
                    deleted_actions.push(action_id);
                }
            }

            Ok(RuleDeletion {
                rule_id: *id,
                deleted_triggers: rule.triggers.clone(),
                deleted_actions,
            })
        });

        match &deletion {
            Ok(d) => info!(
                triggers = d.deleted_triggers.len(),
                actions = d.deleted_actions.len(),
                "规则已删除"
            ),
            Err(_) => warn!("删除不存在的规则"),
        }
        deletion
    }

    // ---- Trigger ----

    /// 创建触发器，所属规则必须存在
    #[instrument(skip(self, new), fields(rule_id = %new.rule_id, kind = %new.kind))]
    pub fn create_trigger(&self, new: NewTrigger) -> Result<Trigger> {
        match (new.kind, &new.condition_script) {
            (TriggerKind::Conditional, Some(script)) => {
                self.validate_script("condition_script", script)?
            }
            (TriggerKind::Conditional, None) => {
                return Err(RuleError::validation(
                    "condition_script",
                    "CONDITIONAL 触发器必须提供条件脚本",
                ));
            }
            (TriggerKind::Unconditional, Some(_)) => {
                return Err(RuleError::validation(
                    "condition_script",
                    "UNCONDITIONAL 触发器不能包含条件脚本",
                ));
            }
            (TriggerKind::Unconditional, None) => {}
        }

        let trigger = self.mutate(|graph| {
            let now = Utc::now();
            let trigger = Trigger {
                id: Uuid::new_v4(),
                rule_id: new.rule_id,
                kind: new.kind,
                condition_script: new.condition_script,
                enabled: new.enabled,
                created_at: now,
                updated_at: now,
            };

            graph.rule_mut(&new.rule_id)?.triggers.push(trigger.id);
            graph.triggers.insert(trigger.id, Arc::new(trigger.clone()));
            Ok(trigger)
        })?;

        info!(trigger_id = %trigger.id, "触发器已创建");
        Ok(trigger)
    }

    /// 按 ID 读取触发器
    pub fn get_trigger(&self, id: &Uuid) -> Result<Trigger> {
        self.current
            .load()
            .require_trigger(id)
            .map(|t| Trigger::clone(t))
    }

    /// 按所属规则与启用状态过滤触发器
    pub fn list_triggers(&self, filter: &TriggerFilter) -> Vec<Trigger> {
        let graph = self.current.load();
        let mut triggers: Vec<Trigger> = graph
            .triggers
            .values()
            .filter(|t| filter.rule_id.is_none_or(|r| t.rule_id == r))
            .filter(|t| filter.enabled.is_none_or(|e| t.enabled == e))
            .map(|t| Trigger::clone(t))
            .collect();
        triggers.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        triggers
    }

    /// 部分更新触发器
    #[instrument(skip(self, patch), fields(trigger_id = %id))]
    pub fn update_trigger(&self, id: &Uuid, patch: TriggerPatch) -> Result<Trigger> {
        if let Some(script) = &patch.condition_script {
            self.validate_script("condition_script", script)?;
        }

        self.mutate(|graph| {
            let mut trigger = Trigger::clone(graph.require_trigger(id)?);

            if let Some(script) = patch.condition_script {
                if trigger.kind != TriggerKind::Conditional {
                    return Err(RuleError::validation(
                        "condition_script",
                        "UNCONDITIONAL 触发器不能包含条件脚本",
                    ));
                }
                trigger.condition_script = Some(script);
            }
            if let Some(enabled) = patch.enabled {
                trigger.enabled = enabled;
            }
            trigger.updated_at = Utc::now();

            graph.triggers.insert(trigger.id, Arc::new(trigger.clone()));
            Ok(trigger)
        })
    }

    /// 删除触发器及其绑定（绑定的动作保留）
    #[instrument(skip(self), fields(trigger_id = %id))]
    pub fn delete_trigger(&self, id: &Uuid) -> Result<()> {
        self.mutate(|graph| {
            let trigger = graph
                .triggers
                .remove(id)
                .ok_or_else(|| RuleError::not_found("trigger", id))?;

            if let Some(rule) = graph.rules.get_mut(&trigger.rule_id) {
                Arc::make_mut(rule).triggers.retain(|t| t != id);
            }
            graph.bindings.retain(|(t, _), _| t != id);
            Ok(())
        })?;

        info!("触发器已删除");
        Ok(())
    }

    // ---- Action ----

    /// 创建动作；脚本在提交前做语法检查
    #[instrument(skip(self, new))]
    pub fn create_action(&self, new: NewAction) -> Result<Action> {
        if let Some(name) = &new.name {
            Self::validate_name("name", name)?;
        }
        self.validate_script("script", &new.script)?;

        let action = self.mutate(|graph| {
            let now = Utc::now();
            let action = Action {
                id: Uuid::new_v4(),
                name: new.name,
                script: new.script,
                enabled: new.enabled,
                created_at: now,
                updated_at: now,
            };
            graph.actions.insert(action.id, Arc::new(action.clone()));
            Ok(action)
        })?;

        info!(action_id = %action.id, "动作已创建");
        Ok(action)
    }

    /// 按 ID 读取动作
    pub fn get_action(&self, id: &Uuid) -> Result<Action> {
        self.current
            .load()
            .require_action(id)
            .map(|a| Action::clone(a))
    }

    /// 按启用状态过滤动作
    pub fn list_actions(&self, filter: &ActionFilter) -> Vec<Action> {
        let graph = self.current.load();
        let mut actions: Vec<Action> = graph
            .actions
            .values()
            .filter(|a| filter.enabled.is_none_or(|e| a.enabled == e))
            .map(|a| Action::clone(a))
            .collect();
        actions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        actions
    }

    /// 部分更新动作
    #[instrument(skip(self, patch), fields(action_id = %id))]
    pub fn update_action(&self, id: &Uuid, patch: ActionPatch) -> Result<Action> {
        if let Some(name) = &patch.name {
            Self::validate_name("name", name)?;
        }
        if let Some(script) = &patch.script {
            self.validate_script("script", script)?;
        }

        self.mutate(|graph| {
            let mut action = Action::clone(graph.require_action(id)?);
            if let Some(name) = patch.name {
                action.name = Some(name);
            }
            if let Some(script) = patch.script {
                action.script = script;
            }
            if let Some(enabled) = patch.enabled {
                action.enabled = enabled;
            }
            action.updated_at = Utc::now();

            graph.actions.insert(action.id, Arc::new(action.clone()));
            Ok(action)
        })
    }

    /// 删除动作；仍被触发器绑定或规则引用时返回 Conflict
    #[instrument(skip(self), fields(action_id = %id))]
    pub fn delete_action(&self, id: &Uuid) -> Result<()> {
        self.mutate(|graph| {
            graph.require_action(id)?;
            if graph.is_action_referenced(id) {
                return Err(RuleError::Conflict(format!(
                    "动作 {} 仍被触发器或规则引用",
                    id
                )));
            }
            graph.actions.remove(id);
            Ok(())
        })?;

        info!("动作已删除");
        Ok(())
    }

    // ---- Bindings ----

    /// 将动作绑定到触发器
    #[instrument(skip(self))]
    pub fn bind_action(&self, trigger_id: &Uuid, action_id: &Uuid) -> Result<()> {
        self.mutate(|graph| {
            graph.require_trigger(trigger_id)?;
            graph.require_action(action_id)?;

            let key = (*trigger_id, *action_id);
            if graph.bindings.contains_key(&key) {
                return Err(RuleError::Conflict(format!(
                    "动作 {} 已绑定到触发器 {}",
                    action_id, trigger_id
                )));
            }
            let seq = graph.next_sequence();
            graph.bindings.insert(key, seq);
            Ok(())
        })
    }

    /// 解除触发器与动作的绑定，绑定不存在时返回 NotFound
    #[instrument(skip(self))]
    pub fn unbind_action(&self, trigger_id: &Uuid, action_id: &Uuid) -> Result<()> {
        self.mutate(|graph| {
            graph
                .bindings
                .remove(&(*trigger_id, *action_id))
                .map(|_| ())
                .ok_or_else(|| {
                    RuleError::not_found("binding", format!("{}/{}", trigger_id, action_id))
                })
        })
    }

    /// 将动作挂到规则的动作列表末尾
    #[instrument(skip(self))]
    pub fn add_rule_action(&self, rule_id: &Uuid, action_id: &Uuid) -> Result<Rule> {
        self.mutate(|graph| {
            graph.require_action(action_id)?;
            let rule = graph.rule_mut(rule_id)?;
            if rule.actions.contains(action_id) {
                return Err(RuleError::Conflict(format!(
                    "动作 {} 已在规则 {} 中",
                    action_id, rule_id
                )));
            }
            rule.actions.push(*action_id);
            rule.updated_at = Utc::now();
            Ok(rule.clone())
        })
    }

    /// 从规则的动作列表中移除动作
    #[instrument(skip(self))]
    pub fn remove_rule_action(&self, rule_id: &Uuid, action_id: &Uuid) -> Result<Rule> {
        self.mutate(|graph| {
            let rule = graph.rule_mut(rule_id)?;
            let before = rule.actions.len();
            rule.actions.retain(|a| a != action_id);
            if rule.actions.len() == before {
                return Err(RuleError::not_found(
                    "rule_action",
                    format!("{}/{}", rule_id, action_id),
                ));
            }
            rule.updated_at = Utc::now();
            Ok(rule.clone())
        })
    }
}
