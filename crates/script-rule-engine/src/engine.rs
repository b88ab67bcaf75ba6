//! 规则引擎入口
//!
//! 按配置装配沙箱、规则存储、评估器、动作执行器与分析聚合器。
//! `RuleEngine` 可克隆，所有克隆共享同一份规则存储与分析数据。

use crate::analytics::{AnalyticsAggregator, Dashboard, TimeRange};
use crate::error::{Result, RuleError};
use crate::evaluator::Evaluator;
use crate::executor::ActionExecutor;
use crate::models::Event;
use crate::record::{ExecutionRecord, ScriptFailure};
use crate::sandbox::{
    Capabilities, HttpModule, RhaiSandbox, ScriptContext, ScriptLimits, ScriptSandbox,
};
use crate::store::RuleStore;
use engine_shared::config::EngineConfig;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument};

/// 脚本试运行结果
#[derive(Debug, Clone, Serialize)]
pub struct ScriptEvaluation {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ScriptFailure>,
    pub duration_ms: f64,
}

/// 规则引擎
#[derive(Clone)]
pub struct RuleEngine {
    store: RuleStore,
    sandbox: Arc<dyn ScriptSandbox>,
    evaluator: Evaluator,
    analytics: AnalyticsAggregator,
    limits: ScriptLimits,
}

impl RuleEngine {
    /// 使用默认的 Rhai 沙箱创建引擎
    pub fn new(config: &EngineConfig) -> Self {
        let sandbox = RhaiSandbox::new()
            .with_cache_capacity(config.ast_cache_size)
            .with_expr_depth(config.max_expr_depth)
            .with_module(Arc::new(HttpModule::new(config.http_timeout())));
        Self::with_sandbox(config, Arc::new(sandbox))
    }

    /// 使用指定沙箱实现创建引擎
    pub fn with_sandbox(config: &EngineConfig, sandbox: Arc<dyn ScriptSandbox>) -> Self {
        let limits = ScriptLimits::from_config(config);
        let store = RuleStore::new(sandbox.clone());
        let executor = ActionExecutor::new(sandbox.clone(), limits.clone())
            .with_policy(config.action_failure_policy);
        let evaluator = Evaluator::new(store.clone(), sandbox.clone(), executor, limits.clone())
            .with_deadline(config.evaluation_deadline());

        info!(
            script_timeout_ms = config.script_timeout_ms,
            max_operations = config.max_operations,
            deadline_ms = config.evaluation_deadline_ms,
            policy = ?config.action_failure_policy,
            "规则引擎已初始化"
        );

        Self {
            store,
            sandbox,
            evaluator,
            analytics: AnalyticsAggregator::new(config.analytics_retention()),
            limits,
        }
    }

    pub fn store(&self) -> &RuleStore {
        &self.store
    }

    pub fn analytics(&self) -> &AnalyticsAggregator {
        &self.analytics
    }

    /// 不写入分析数据的评估器
    pub fn evaluator(&self) -> &Evaluator {
        &self.evaluator
    }

    /// 评估事件并写入分析数据
    pub fn evaluate(&self, event: &Event) -> Vec<ExecutionRecord> {
        let records = self.evaluator.evaluate(event);
        self.analytics.record_all(records.iter().cloned());
        records
    }

    /// 在阻塞线程池中评估事件
    pub async fn evaluate_async(&self, event: Event) -> Result<Vec<ExecutionRecord>> {
        let engine = self.clone();
        tokio::task::spawn_blocking(move || engine.evaluate(&event))
            .await
            .map_err(|e| RuleError::Internal(format!("评估任务失败: {}", e)))
    }

    /// 试运行脚本
    ///
    /// `context` 的每个顶层字段作为同名变量注入，整个对象同时作为 `event` 注入；
    /// 允许调用日志函数，日志随结果返回。
    #[instrument(skip(self, script, context))]
    pub fn evaluate_script(&self, script: &str, context: Value) -> Result<ScriptEvaluation> {
        let variables = match context {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            _ => {
                return Err(RuleError::validation("context", "必须是 JSON 对象"));
            }
        };

        let mut ctx = ScriptContext::new(Capabilities::SideEffects);
        for (name, value) in &variables {
            ctx = ctx.with_variable(name.clone(), value.clone());
        }
        if !variables.contains_key("event") {
            ctx = ctx.with_variable("event", Value::Object(variables));
        }

        let start = Instant::now();
        let result = self.sandbox.run(script.trim(), &ctx, &self.limits);
        let duration_ms = start.elapsed().as_secs_f64() * 1000.0;

        Ok(match result {
            Ok(output) => ScriptEvaluation {
                success: true,
                result: Some(output.value),
                logs: output.logs,
                error: None,
                duration_ms,
            },
            Err(e) => ScriptEvaluation {
                success: false,
                result: None,
                logs: Vec::new(),
                error: Some(ScriptFailure::from(&e)),
                duration_ms,
            },
        })
    }

    /// 按时间窗口聚合仪表盘数据
    pub fn dashboard(&self, time_range: &str) -> Result<Dashboard> {
        let range = TimeRange::parse(time_range)?;
        Ok(self.analytics.dashboard(&range))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewRule;
    use serde_json::json;

    #[test]
    fn test_evaluate_records_analytics() {
        let engine = RuleEngine::new(&EngineConfig::default());
        engine
            .store()
            .create_rule(NewRule::new("always", "true"))
            .unwrap();

        let records = engine.evaluate(&Event::new(json!({})));
        assert_eq!(records.len(), 1);
        assert_eq!(engine.analytics().len(), 1);

        let dashboard = engine.dashboard("1h").unwrap();
        assert_eq!(dashboard.overall_stats.total_executions, 1);
        assert!(engine.dashboard("nope").is_err());
    }

    #[test]
    fn test_expired_deadline_reaches_analytics() {
        let engine = RuleEngine::new(&EngineConfig {
            evaluation_deadline_ms: 0,
            ..EngineConfig::default()
        });
        engine.store().create_rule(NewRule::new("a", "true")).unwrap();
        engine.store().create_rule(NewRule::new("b", "true")).unwrap();

        let records = engine.evaluate(&Event::new(json!({})));
        assert_eq!(records.len(), 2);

        let overall = engine.dashboard("1h").unwrap().overall_stats;
        assert_eq!(overall.total_executions, 2);
        assert_eq!(overall.partial_evaluations, 2);
        assert_eq!(overall.matched_executions, 0);
    }

    #[test]
    fn test_evaluate_async() {
        let engine = RuleEngine::new(&EngineConfig::default());
        engine
            .store()
            .create_rule(NewRule::new("hot", "event.temperature > 25"))
            .unwrap();

        let records =
            tokio_test::block_on(engine.evaluate_async(Event::new(json!({"temperature": 30}))))
                .unwrap();
        assert!(records[0].matched);
    }

    #[test]
    fn test_evaluate_script() {
        let engine = RuleEngine::new(&EngineConfig::default());

        let ok = engine
            .evaluate_script(
                r#"log_info("checking"); temperature * 2"#,
                json!({"temperature": 21}),
            )
            .unwrap();
        assert!(ok.success);
        assert_eq!(ok.result, Some(json!(42)));
        assert_eq!(ok.logs, vec!["[info] checking"]);

        let via_event = engine
            .evaluate_script("event.temperature > 20", json!({"temperature": 21}))
            .unwrap();
        assert_eq!(via_event.result, Some(json!(true)));

        let failed = engine.evaluate_script("1 +", Value::Null).unwrap();
        assert!(!failed.success);
        assert!(failed.error.is_some());

        assert!(engine.evaluate_script("1", json!([1, 2])).is_err());
    }
}
