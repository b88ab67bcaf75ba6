//! 规则引擎服务层
//!
//! 传输层之下的请求入口：先校验 `X-API-Key`，通过后才能拿到 `AuthorizedClient`，
//! 再由它校验请求 DTO 并调用引擎。

use crate::analytics::Dashboard;
use crate::dto::{
    AttachActionRequest, CreateActionRequest, CreateRuleRequest, CreateTriggerRequest,
    DashboardQuery, EvaluateRequest, EvaluateScriptRequest, ListActionsQuery, ListRulesQuery,
    ListTriggersQuery, UpdateActionRequest, UpdateRuleRequest, UpdateTriggerRequest,
};
use crate::engine::{RuleEngine, ScriptEvaluation};
use crate::error::{Result, RuleError};
use crate::models::{Action, Event, Rule, RuleDeletion, RuleDetail, Trigger};
use crate::record::ExecutionRecord;
use engine_shared::config::AuthConfig;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{instrument, warn};
use uuid::Uuid;
use validator::Validate;

pub const API_KEY_HEADER: &str = "X-API-Key";

/// 规则引擎服务
#[derive(Clone)]
pub struct RuleEngineService {
    engine: RuleEngine,
    /// 未配置时拒绝所有请求
    api_key: Option<Arc<str>>,
}

impl RuleEngineService {
    pub fn new(engine: RuleEngine, auth: &AuthConfig) -> Self {
        let api_key = auth
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .map(Arc::from);
        if api_key.is_none() {
            warn!("未配置 API Key，所有请求都将被拒绝");
        }
        Self { engine, api_key }
    }

    /// 底层引擎，供鉴权之外的内部调用使用
    pub fn engine(&self) -> &RuleEngine {
        &self.engine
    }

    /// 校验请求头中的 API Key
    pub fn authorize(&self, provided: Option<&str>) -> Result<AuthorizedClient<'_>> {
        match (&self.api_key, provided) {
            (Some(expected), Some(key)) if constant_time_key_eq(key, expected) => {
                Ok(AuthorizedClient {
                    engine: &self.engine,
                })
            }
            (_, None) => {
                warn!(header = API_KEY_HEADER, "请求缺少 API Key");
                Err(RuleError::Unauthorized)
            }
            _ => {
                warn!(header = API_KEY_HEADER, "API Key 无效");
                Err(RuleError::Unauthorized)
            }
        }
    }
}

/// 常数时间比较 API Key
///
/// 长度不同时仍做一次等长比较，使耗时与长度是否匹配无关。
fn constant_time_key_eq(provided: &str, expected: &str) -> bool {
    let provided = provided.as_bytes();
    let expected = expected.as_bytes();
    if provided.len() != expected.len() {
        let _ = expected.ct_eq(expected);
        return false;
    }
    provided.ct_eq(expected).into()
}

/// 已通过鉴权的调用方
pub struct AuthorizedClient<'a> {
    engine: &'a RuleEngine,
}

impl AuthorizedClient<'_> {
    // ---- /rules ----

    #[instrument(skip(self, req))]
    pub fn create_rule(&self, req: CreateRuleRequest) -> Result<Rule> {
        req.validate()?;
        self.engine.store().create_rule(req.into())
    }

    /// 按启用状态分页列出规则
    pub fn list_rules(&self, query: ListRulesQuery) -> Result<Vec<Rule>> {
        query.validate()?;
        Ok(self.engine.store().list_rules(&query.into()))
    }

    /// 规则详情，包含展开后的触发器与动作
    pub fn get_rule(&self, id: &Uuid) -> Result<RuleDetail> {
        self.engine.store().get_rule_detail(id)
    }

    #[instrument(skip(self, req))]
    pub fn update_rule(&self, id: &Uuid, req: UpdateRuleRequest) -> Result<Rule> {
        req.validate()?;
        self.engine.store().update_rule(id, req.into())
    }

    /// 删除规则，级联删除其触发器与不再被引用的动作
    pub fn delete_rule(&self, id: &Uuid) -> Result<RuleDeletion> {
        self.engine.store().delete_rule(id)
    }

    /// 将已有动作挂到规则上
    pub fn add_rule_action(&self, rule_id: &Uuid, req: AttachActionRequest) -> Result<Rule> {
        self.engine.store().add_rule_action(rule_id, &req.action_id)
    }

    /// 从规则上摘除动作
    pub fn remove_rule_action(&self, rule_id: &Uuid, action_id: &Uuid) -> Result<Rule> {
        self.engine.store().remove_rule_action(rule_id, action_id)
    }

    // ---- /actions ----

    #[instrument(skip(self, req))]
    pub fn create_action(&self, req: CreateActionRequest) -> Result<Action> {
        req.validate()?;
        self.engine.store().create_action(req.into())
    }

    /// 按启用状态列出动作
    pub fn list_actions(&self, query: ListActionsQuery) -> Result<Vec<Action>> {
        Ok(self.engine.store().list_actions(&query.into()))
    }

    /// 按 ID 读取动作
    pub fn get_action(&self, id: &Uuid) -> Result<Action> {
        self.engine.store().get_action(id)
    }

    pub fn update_action(&self, id: &Uuid, req: UpdateActionRequest) -> Result<Action> {
        req.validate()?;
        self.engine.store().update_action(id, req.into())
    }

    /// 删除动作，仍被引用时拒绝
    pub fn delete_action(&self, id: &Uuid) -> Result<()> {
        self.engine.store().delete_action(id)
    }

    // ---- /triggers ----

    #[instrument(skip(self, req))]
    pub fn create_trigger(&self, req: CreateTriggerRequest) -> Result<Trigger> {
        req.validate()?;
        self.engine.store().create_trigger(req.into())
    }

    /// 按所属规则与启用状态列出触发器
    pub fn list_triggers(&self, query: ListTriggersQuery) -> Result<Vec<Trigger>> {
        Ok(self.engine.store().list_triggers(&query.into()))
    }

    /// 按 ID 读取触发器
    pub fn get_trigger(&self, id: &Uuid) -> Result<Trigger> {
        self.engine.store().get_trigger(id)
    }

    pub fn update_trigger(&self, id: &Uuid, req: UpdateTriggerRequest) -> Result<Trigger> {
        req.validate()?;
        self.engine.store().update_trigger(id, req.into())
    }

    /// 删除触发器及其绑定
    pub fn delete_trigger(&self, id: &Uuid) -> Result<()> {
        self.engine.store().delete_trigger(id)
    }

    /// 绑定动作到触发器
    pub fn bind_trigger_action(&self, trigger_id: &Uuid, req: AttachActionRequest) -> Result<()> {
        self.engine.store().bind_action(trigger_id, &req.action_id)
    }

    /// 解除触发器与动作的绑定
    pub fn unbind_trigger_action(&self, trigger_id: &Uuid, action_id: &Uuid) -> Result<()> {
        self.engine.store().unbind_action(trigger_id, action_id)
    }

    // ---- /evaluate ----

    /// 对单个事件评估全部启用的规则
    pub async fn evaluate(&self, req: EvaluateRequest) -> Result<Vec<ExecutionRecord>> {
        let mut event = Event::new(req.event);
        if let Some(id) = req.event_id {
            event = event.with_id(id);
        }
        self.engine.evaluate_async(event).await
    }

    /// 在只读上下文中试运行脚本
    pub fn evaluate_script(&self, req: EvaluateScriptRequest) -> Result<ScriptEvaluation> {
        req.validate()?;
        self.engine.evaluate_script(&req.script, req.context)
    }

    // ---- /analytics ----

    /// 指定时间范围的执行统计
    pub fn dashboard(&self, query: DashboardQuery) -> Result<Dashboard> {
        self.engine.dashboard(&query.time_range)
    }
}
