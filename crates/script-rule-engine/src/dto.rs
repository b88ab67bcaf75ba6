//! 服务层请求/响应 DTO
//!
//! 与传输层约定的 JSON 结构，字段使用 snake_case。

use crate::error::{Result, RuleError};
use crate::models::{
    ActionFilter, ActionPatch, NewAction, NewRule, NewTrigger, RuleFilter, RulePatch,
    TriggerFilter, TriggerKind, TriggerPatch,
};
use crate::store::MAX_PAGE_SIZE;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;
use validator::Validate;

/// 创建规则请求
#[derive(Debug, Deserialize, Validate)]
pub struct CreateRuleRequest {
    #[validate(length(min = 1, max = 255, message = "规则名称长度必须在1-255个字符之间"))]
    pub name: String,
    #[validate(length(min = 1, max = 10000, message = "脚本长度必须在1-10000个字符之间"))]
    pub script: String,
    #[serde(default)]
    pub priority: i32,
    pub enabled: Option<bool>,
}

impl From<CreateRuleRequest> for NewRule {
    fn from(req: CreateRuleRequest) -> Self {
        Self {
            name: req.name,
            script: req.script,
            priority: req.priority,
            enabled: req.enabled.unwrap_or(true),
        }
    }
}

/// 更新规则请求（局部更新）
#[derive(Debug, Default, Deserialize, Validate)]
pub struct UpdateRuleRequest {
    #[validate(length(min = 1, max = 255, message = "规则名称长度必须在1-255个字符之间"))]
    pub name: Option<String>,
    #[validate(length(min = 1, max = 10000, message = "脚本长度必须在1-10000个字符之间"))]
    pub script: Option<String>,
    pub priority: Option<i32>,
    pub enabled: Option<bool>,
}

impl From<UpdateRuleRequest> for RulePatch {
    fn from(req: UpdateRuleRequest) -> Self {
        Self {
            name: req.name,
            script: req.script,
            priority: req.priority,
            enabled: req.enabled,
        }
    }
}

/// 规则列表查询参数
#[derive(Debug, Default, Deserialize, Validate)]
pub struct ListRulesQuery {
    pub enabled: Option<bool>,
    #[validate(range(min = 1, max = 1000, message = "limit 必须在1-1000之间"))]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
}

impl From<ListRulesQuery> for RuleFilter {
    fn from(query: ListRulesQuery) -> Self {
        Self {
            enabled: query.enabled,
            limit: query.limit.map(|l| l.min(MAX_PAGE_SIZE)),
            offset: query.offset,
        }
    }
}

/// 创建动作请求
#[derive(Debug, Deserialize, Validate)]
pub struct CreateActionRequest {
    #[validate(length(min = 1, max = 255, message = "动作名称长度必须在1-255个字符之间"))]
    pub name: Option<String>,
    #[validate(length(min = 1, max = 10000, message = "脚本长度必须在1-10000个字符之间"))]
    pub script: String,
    pub enabled: Option<bool>,
}

impl From<CreateActionRequest> for NewAction {
    fn from(req: CreateActionRequest) -> Self {
        Self {
            name: req.name,
            script: req.script,
            enabled: req.enabled.unwrap_or(true),
        }
    }
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct UpdateActionRequest {
    #[validate(length(min = 1, max = 255, message = "动作名称长度必须在1-255个字符之间"))]
    pub name: Option<String>,
    #[validate(length(min = 1, max = 10000, message = "脚本长度必须在1-10000个字符之间"))]
    pub script: Option<String>,
    pub enabled: Option<bool>,
}

impl From<UpdateActionRequest> for ActionPatch {
    fn from(req: UpdateActionRequest) -> Self {
        Self {
            name: req.name,
            script: req.script,
            enabled: req.enabled,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ListActionsQuery {
    pub enabled: Option<bool>,
}

impl From<ListActionsQuery> for ActionFilter {
    fn from(query: ListActionsQuery) -> Self {
        Self {
            enabled: query.enabled,
        }
    }
}

/// 创建触发器请求
///
/// `condition_script` 仅在 `type == CONDITIONAL` 时必填，由规则存储校验。
#[derive(Debug, Deserialize, Validate)]
pub struct CreateTriggerRequest {
    pub rule_id: Uuid,
    #[serde(rename = "type")]
    pub kind: TriggerKind,
    #[validate(length(min = 1, max = 10000, message = "条件脚本长度必须在1-10000个字符之间"))]
    pub condition_script: Option<String>,
    pub enabled: Option<bool>,
}

impl From<CreateTriggerRequest> for NewTrigger {
    fn from(req: CreateTriggerRequest) -> Self {
        Self {
            rule_id: req.rule_id,
            kind: req.kind,
            condition_script: req.condition_script,
            enabled: req.enabled.unwrap_or(true),
        }
    }
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct UpdateTriggerRequest {
    #[validate(length(min = 1, max = 10000, message = "条件脚本长度必须在1-10000个字符之间"))]
    pub condition_script: Option<String>,
    pub enabled: Option<bool>,
}

impl From<UpdateTriggerRequest> for TriggerPatch {
    fn from(req: UpdateTriggerRequest) -> Self {
        Self {
            condition_script: req.condition_script,
            enabled: req.enabled,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ListTriggersQuery {
    pub rule_id: Option<Uuid>,
    pub enabled: Option<bool>,
}

impl From<ListTriggersQuery> for TriggerFilter {
    fn from(query: ListTriggersQuery) -> Self {
        Self {
            rule_id: query.rule_id,
            enabled: query.enabled,
        }
    }
}

/// 规则/触发器挂载动作请求
#[derive(Debug, Deserialize)]
pub struct AttachActionRequest {
    pub action_id: Uuid,
}

/// 事件评估请求
#[derive(Debug, Deserialize)]
pub struct EvaluateRequest {
    /// 缺省时由引擎生成
    pub event_id: Option<Uuid>,
    pub event: Value,
}

/// 脚本试运行请求
#[derive(Debug, Deserialize, Validate)]
pub struct EvaluateScriptRequest {
    #[validate(length(min = 1, max = 10000, message = "脚本长度必须在1-10000个字符之间"))]
    pub script: String,
    #[serde(default)]
    pub context: Value,
}

/// 仪表盘查询参数
#[derive(Debug, Default, Deserialize)]
pub struct DashboardQuery {
    #[serde(default)]
    pub time_range: String,
}

/// API 统一响应
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            code: "SUCCESS".to_string(),
            message: "操作成功".to_string(),
            data: Some(data),
        }
    }

    /// 服务层结果转换为响应体与 HTTP 状态码
    pub fn from_result(result: Result<T>) -> (u16, Self) {
        match result {
            Ok(data) => (200, Self::success(data)),
            Err(e) => (
                e.http_status(),
                Self {
                    success: false,
                    code: e.code().to_string(),
                    message: e.to_string(),
                    data: None,
                },
            ),
        }
    }
}

/// 解析并校验 JSON 请求体
pub fn parse_request<T>(body: &str) -> Result<T>
where
    T: DeserializeOwned + Validate,
{
    let request: T = serde_json::from_str(body)
        .map_err(|e| RuleError::validation("body", format!("请求体格式错误: {}", e)))?;
    request.validate()?;
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_create_rule_request_validation() {
        let valid = CreateRuleRequest {
            name: "hot".to_string(),
            script: "return event.temperature > 25".to_string(),
            priority: 1,
            enabled: None,
        };
        assert!(valid.validate().is_ok());

        let invalid = CreateRuleRequest {
            name: "".to_string(),
            script: "true".to_string(),
            priority: 0,
            enabled: None,
        };
        let err = RuleError::from(invalid.validate().unwrap_err());
        match err {
            RuleError::Validation { field, .. } => assert_eq!(field, "name"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_parse_request_maps_errors() {
        let err = parse_request::<CreateRuleRequest>("{not json").unwrap_err();
        assert_eq!(err.http_status(), 400);

        let err = parse_request::<CreateRuleRequest>(r#"{"name": "x"}"#).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");

        let req = parse_request::<CreateRuleRequest>(
            &json!({"name": "hot", "script": "true", "priority": 3}).to_string(),
        )
        .unwrap();
        let rule = NewRule::from(req);
        assert_eq!(rule.priority, 3);
        assert!(rule.enabled);
    }

    #[test]
    fn test_create_trigger_request() {
        let rule_id = Uuid::new_v4();
        let req = parse_request::<CreateTriggerRequest>(
            &json!({
                "rule_id": rule_id,
                "type": "CONDITIONAL",
                "condition_script": "event.humidity > 40"
            })
            .to_string(),
        )
        .unwrap();

        let trigger = NewTrigger::from(req);
        assert_eq!(trigger.kind, TriggerKind::Conditional);
        assert_eq!(trigger.rule_id, rule_id);
    }

    #[test]
    fn test_list_rules_query_limit() {
        let query = ListRulesQuery {
            limit: Some(5000),
            ..Default::default()
        };
        assert!(query.validate().is_err());
        assert_eq!(RuleFilter::from(query).limit, Some(MAX_PAGE_SIZE));
    }

    #[test]
    fn test_api_response_from_error() {
        let (status, body) =
            ApiResponse::<()>::from_result(Err(RuleError::not_found("rule", "abc")));
        assert_eq!(status, 404);
        assert!(!body.success);
        assert_eq!(body.code, "NOT_FOUND");
    }
}
