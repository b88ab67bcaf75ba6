//! 脚本沙箱
//!
//! 引擎只依赖 `ScriptSandbox` 能力接口：语法检查与在受限上下文中执行脚本。
//! 默认实现 [`RhaiSandbox`] 基于 Rhai 解释器，每次调用使用独立的引擎实例与作用域。

pub mod host;
mod http;
mod rhai_sandbox;

pub use host::{DataStoreModule, ExecutionLog, HostCall, HostModule, LoggerModule, TimeModule};
pub use http::HttpModule;
pub use rhai_sandbox::RhaiSandbox;

use crate::error::ScriptError;
use engine_shared::config::EngineConfig;
use serde_json::{Map, Value};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// 单次脚本执行的资源限制
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptLimits {
    pub timeout: Duration,
    pub max_operations: u64,
    pub max_string_size: usize,
    pub max_array_size: usize,
    pub max_map_size: usize,
    pub max_call_levels: usize,
    pub max_expr_depth: usize,
}

impl Default for ScriptLimits {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl ScriptLimits {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            timeout: config.script_timeout(),
            max_operations: config.max_operations,
            max_string_size: config.max_string_size,
            max_array_size: config.max_array_size,
            max_map_size: config.max_map_size,
            max_call_levels: config.max_call_levels,
            max_expr_depth: config.max_expr_depth,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// 将超时收紧到评估截止时间之前
    pub fn clamp_to(&self, deadline: Instant) -> Self {
        let remaining = deadline.saturating_duration_since(Instant::now());
        self.clone().with_timeout(self.timeout.min(remaining))
    }
}

/// 脚本可见的宿主能力
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capabilities {
    /// 谓词与触发条件：只读辅助函数
    ReadOnly,
    /// 动作脚本：允许日志等副作用函数
    SideEffects,
}

/// 当前调用的归属信息，暴露给脚本与宿主函数
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Invocation {
    pub rule_id: Option<Uuid>,
    pub trigger_id: Option<Uuid>,
    pub action_id: Option<Uuid>,
}

/// 脚本执行上下文
///
/// 变量以常量形式注入脚本作用域，脚本无法修改。
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptContext {
    pub variables: Map<String, Value>,
    pub capabilities: Capabilities,
    pub invocation: Invocation,
}

impl ScriptContext {
    pub fn new(capabilities: Capabilities) -> Self {
        Self {
            variables: Map::new(),
            capabilities,
            invocation: Invocation::default(),
        }
    }

    /// 以事件数据构建只读上下文（脚本中通过 `event` 访问）
    pub fn for_event(payload: &Value) -> Self {
        Self::new(Capabilities::ReadOnly).with_variable("event", payload.clone())
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_rule(mut self, rule_id: Uuid) -> Self {
        self.invocation.rule_id = Some(rule_id);
        self.variables
            .insert("rule_id".into(), Value::String(rule_id.to_string()));
        self
    }

    pub fn with_trigger(mut self, trigger_id: Uuid) -> Self {
        self.invocation.trigger_id = Some(trigger_id);
        self.variables
            .insert("trigger_id".into(), Value::String(trigger_id.to_string()));
        self
    }

    pub fn with_action(mut self, action_id: Uuid) -> Self {
        self.invocation.action_id = Some(action_id);
        self.variables
            .insert("action_id".into(), Value::String(action_id.to_string()));
        self
    }
}

/// 脚本执行输出
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScriptOutput {
    /// 脚本返回值；无返回值时为 Null
    pub value: Value,
    /// 宿主日志函数收集的日志行
    pub logs: Vec<String>,
}

/// 脚本沙箱能力接口
#[cfg_attr(test, mockall::automock)]
pub trait ScriptSandbox: Send + Sync {
    /// 语法检查
    fn check(&self, script: &str) -> Result<(), ScriptError>;

    /// 在给定上下文与资源限制下执行脚本
    fn run(
        &self,
        script: &str,
        context: &ScriptContext,
        limits: &ScriptLimits,
    ) -> Result<ScriptOutput, ScriptError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_clamp_to_deadline() {
        let limits = ScriptLimits::default().with_timeout(Duration::from_secs(10));
        let clamped = limits.clamp_to(Instant::now() + Duration::from_millis(50));
        assert!(clamped.timeout <= Duration::from_millis(50));

        let expired = limits.clamp_to(Instant::now());
        assert_eq!(expired.timeout, Duration::ZERO);
    }

    #[test]
    fn test_context_builders() {
        let rule_id = Uuid::new_v4();
        let ctx = ScriptContext::for_event(&json!({"temperature": 30})).with_rule(rule_id);

        assert_eq!(ctx.capabilities, Capabilities::ReadOnly);
        assert_eq!(ctx.variables["event"]["temperature"], 30);
        assert_eq!(ctx.variables["rule_id"], rule_id.to_string());
        assert_eq!(ctx.invocation.rule_id, Some(rule_id));
    }
}
