//! 事件评估器
//!
//! 对一个事件执行一次完整的评估：
//! 1. 从规则存储获取一致性快照，按优先级降序、创建序号升序排列已启用规则
//! 2. 依次运行谓词脚本；脚本失败视为不匹配并记录在执行记录上，继续评估后续规则
//! 3. 匹配的规则按声明顺序评估触发器，触发的触发器交给动作执行器
//!
//! 所有匹配的规则都会被评估，不做短路。整个评估受截止时间约束，
//! 超时后跳过剩余规则，本次产生的记录全部标记为 `PARTIALLY_EVALUATED`。

use crate::error::ScriptError;
use crate::executor::ActionExecutor;
use crate::models::{Event, Rule, TriggerKind};
use crate::record::{EvaluationStatus, ExecutionRecord, ScriptFailure, TriggerOutcome};
use crate::sandbox::{ScriptContext, ScriptLimits, ScriptSandbox};
use crate::store::{RuleGraph, RuleStore};
use chrono::Utc;
use engine_shared::observability::metrics;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// 事件评估器
#[derive(Clone)]
pub struct Evaluator {
    store: RuleStore,
    sandbox: Arc<dyn ScriptSandbox>,
    executor: ActionExecutor,
    limits: ScriptLimits,
    deadline: Duration,
}

impl Evaluator {
    pub fn new(
        store: RuleStore,
        sandbox: Arc<dyn ScriptSandbox>,
        executor: ActionExecutor,
        limits: ScriptLimits,
    ) -> Self {
        Self {
            store,
            sandbox,
            executor,
            limits,
            deadline: Duration::from_secs(2),
        }
    }

    /// 设置单次评估的总截止时间
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// 评估事件，每条已启用规则产生一条执行记录
    #[instrument(skip(self, event), fields(event_id = %event.id))]
    pub fn evaluate(&self, event: &Event) -> Vec<ExecutionRecord> {
        let graph = self.store.snapshot();
        self.evaluate_snapshot(&graph, event)
    }

    /// 在指定快照上评估事件
    ///
    /// 截止时间到达后剩余规则不再运行谓词，但仍各自产生一条未匹配的记录，
    /// 使分析数据能看到本次评估不完整。
    pub fn evaluate_snapshot(&self, graph: &RuleGraph, event: &Event) -> Vec<ExecutionRecord> {
        let started = Instant::now();
        let deadline = started + self.deadline;

        let rules = graph.rules_in_order(true);
        let mut records = Vec::with_capacity(rules.len());
        let mut skipped = 0usize;
        let mut cut_short = false;

        for rule in &rules {
            if Instant::now() >= deadline {
                skipped += 1;
                records.push(skipped_record(rule, event));
                continue;
            }
            let (record, interrupted) = self.evaluate_rule(graph, rule, event, deadline);
            cut_short |= interrupted;
            records.push(record);
        }

        let partial = skipped > 0 || cut_short;
        if partial {
            warn!(
                evaluated = records.len() - skipped,
                skipped,
                deadline_ms = self.deadline.as_millis() as u64,
                "评估超过截止时间，结果不完整"
            );
            for record in &mut records {
                record.status = EvaluationStatus::PartiallyEvaluated;
            }
        }

        let status = if partial {
            EvaluationStatus::PartiallyEvaluated
        } else {
            EvaluationStatus::Completed
        };
        metrics::record_event_evaluation(status.as_str());

        info!(
            version = graph.version(),
            rules = records.len(),
            matched = records.iter().filter(|r| r.matched).count(),
            duration_ms = started.elapsed().as_secs_f64() * 1000.0,
            "事件评估完成"
        );
        records
    }

    /// 评估单条规则；第二个返回值表示本规则的工作被截止时间打断
    fn evaluate_rule(
        &self,
        graph: &RuleGraph,
        rule: &Rule,
        event: &Event,
        deadline: Instant,
    ) -> (ExecutionRecord, bool) {
        let start = Instant::now();
        let context = ScriptContext::for_event(&event.payload).with_rule(rule.id);
        let mut interrupted = false;

        let (matched, error) = match self.run_predicate(&rule.script, &context, deadline) {
            Ok(matched) => (matched, None),
            Err(e) => {
                warn!(rule_id = %rule.id, error = %e, "规则谓词执行失败");
                metrics::record_script_error("predicate", e.kind().as_str());
                interrupted = is_deadline_timeout(&e, deadline);
                (false, Some(ScriptFailure::from(&e)))
            }
        };
        debug!(rule_id = %rule.id, matched, "规则谓词已评估");

        let mut triggers = Vec::new();
        let mut actions = Vec::new();

        if matched {
            for trigger_id in &rule.triggers {
                let Some(trigger) = graph.trigger(trigger_id) else {
                    continue;
                };
                if !trigger.enabled {
                    continue;
                }
                // 截止时间之后不再评估触发器，也不再执行动作
                if Instant::now() >= deadline {
                    debug!(rule_id = %rule.id, trigger_id = %trigger.id, "已过截止时间，跳过剩余触发器");
                    interrupted = true;
                    break;
                }

                let trigger_context = context.clone().with_trigger(trigger.id);
                let (fired, error) = match (trigger.kind, &trigger.condition_script) {
                    (TriggerKind::Unconditional, _) => (true, None),
                    (TriggerKind::Conditional, Some(script)) => {
                        match self.run_predicate(script, &trigger_context, deadline) {
                            Ok(fired) => (fired, None),
                            Err(e) => {
                                warn!(trigger_id = %trigger.id, error = %e, "触发条件执行失败");
                                metrics::record_script_error("trigger", e.kind().as_str());
                                interrupted |= is_deadline_timeout(&e, deadline);
                                (false, Some(ScriptFailure::from(&e)))
                            }
                        }
                    }
                    (TriggerKind::Conditional, None) => (false, None),
                };
                metrics::record_trigger_evaluation(trigger.kind.as_str(), fired);

                triggers.push(TriggerOutcome {
                    trigger_id: trigger.id,
                    kind: trigger.kind,
                    fired,
                    error,
                });

                if fired {
                    let bound = graph.actions_for_trigger(trigger);
                    let outcomes =
                        self.executor
                            .run_all(&bound, trigger.id, &trigger_context, deadline);
                    interrupted |= outcomes.deadline_reached;
                    actions.extend(outcomes.outcomes);
                }
            }
        }

        let elapsed = start.elapsed();
        metrics::record_rule_evaluation(matched, elapsed.as_secs_f64());

        let record = ExecutionRecord {
            id: Uuid::new_v4(),
            event_id: event.id,
            rule_id: rule.id,
            rule_name: rule.name.clone(),
            matched,
            error,
            triggers,
            actions,
            duration_ms: elapsed.as_secs_f64() * 1000.0,
            timestamp: Utc::now(),
            status: EvaluationStatus::Completed,
        };
        (record, interrupted)
    }

    /// 运行谓词脚本：true/false 原样返回，无返回值视为 false，其它类型为无效结果
    fn run_predicate(
        &self,
        script: &str,
        context: &ScriptContext,
        deadline: Instant,
    ) -> Result<bool, ScriptError> {
        let output = self
            .sandbox
            .run(script, context, &self.limits.clamp_to(deadline))?;

        match output.value {
            Value::Bool(b) => Ok(b),
            Value::Null => Ok(false),
            other => Err(ScriptError::InvalidResult {
                expected: "bool".to_string(),
                actual: json_type_name(&other).to_string(),
            }),
        }
    }
}

/// 截止时间之后未运行的规则
fn skipped_record(rule: &Rule, event: &Event) -> ExecutionRecord {
    ExecutionRecord {
        id: Uuid::new_v4(),
        event_id: event.id,
        rule_id: rule.id,
        rule_name: rule.name.clone(),
        matched: false,
        error: None,
        triggers: Vec::new(),
        actions: Vec::new(),
        duration_ms: 0.0,
        timestamp: Utc::now(),
        status: EvaluationStatus::PartiallyEvaluated,
    }
}

/// 脚本超时且总截止时间已到，说明超时来自截止时间收紧
fn is_deadline_timeout(err: &ScriptError, deadline: Instant) -> bool {
    matches!(err, ScriptError::Timeout { .. }) && Instant::now() >= deadline
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ScriptErrorKind;
    use crate::models::{NewAction, NewRule, NewTrigger};
    use crate::sandbox::{MockScriptSandbox, RhaiSandbox, ScriptOutput};
    use serde_json::json;

    fn setup() -> (RuleStore, Evaluator) {
        setup_with(ScriptLimits::default())
    }

    fn setup_with(limits: ScriptLimits) -> (RuleStore, Evaluator) {
        let sandbox: Arc<dyn ScriptSandbox> = Arc::new(RhaiSandbox::new());
        let store = RuleStore::new(sandbox.clone());
        let executor = ActionExecutor::new(sandbox.clone(), limits.clone());
        let evaluator = Evaluator::new(store.clone(), sandbox, executor, limits);
        (store, evaluator)
    }

    #[test]
    fn test_rules_evaluated_in_priority_order() {
        let (store, evaluator) = setup();
        let low = store
            .create_rule(NewRule::new("low", "true").with_priority(1))
            .unwrap();
        let high = store
            .create_rule(NewRule::new("high", "true").with_priority(10))
            .unwrap();
        let low_second = store
            .create_rule(NewRule::new("low-2", "true").with_priority(1))
            .unwrap();

        let records = evaluator.evaluate(&Event::new(json!({})));
        let ids: Vec<_> = records.iter().map(|r| r.rule_id).collect();
        assert_eq!(ids, vec![high.id, low.id, low_second.id]);
        assert!(records.iter().all(|r| r.matched));
    }

    #[test]
    fn test_disabled_rules_are_skipped() {
        let (store, evaluator) = setup();
        store
            .create_rule(NewRule::new("off", "true").disabled())
            .unwrap();

        assert!(evaluator.evaluate(&Event::new(json!({}))).is_empty());
    }

    #[test]
    fn test_predicate_error_is_isolated() {
        let (store, evaluator) = setup();
        store
            .create_rule(NewRule::new("broken", "missing_helper(event) > 1").with_priority(5))
            .unwrap();
        let ok = store.create_rule(NewRule::new("ok", "true")).unwrap();

        let records = evaluator.evaluate(&Event::new(json!({"temperature": 30})));
        assert_eq!(records.len(), 2);
        assert!(!records[0].matched);
        assert_eq!(records[0].error.as_ref().unwrap().kind, ScriptErrorKind::Runtime);
        assert_eq!(records[1].rule_id, ok.id);
        assert!(records[1].matched);
    }

    #[test]
    fn test_non_bool_result_is_invalid() {
        let (store, evaluator) = setup();
        store.create_rule(NewRule::new("number", "42")).unwrap();
        store.create_rule(NewRule::new("unit", "let x = 1;")).unwrap();

        let records = evaluator.evaluate(&Event::new(json!({})));
        let number = records.iter().find(|r| r.rule_name == "number").unwrap();
        assert_eq!(
            number.error.as_ref().unwrap().kind,
            ScriptErrorKind::InvalidResult
        );

        let unit = records.iter().find(|r| r.rule_name == "unit").unwrap();
        assert!(!unit.matched);
        assert!(unit.error.is_none());
    }

    #[test]
    fn test_triggers_and_actions() {
        let (store, evaluator) = setup();
        let rule = store
            .create_rule(NewRule::new("hot", "event.temperature > 25"))
            .unwrap();
        let always = store
            .create_trigger(NewTrigger::unconditional(rule.id))
            .unwrap();
        let conditional = store
            .create_trigger(NewTrigger::conditional(
                rule.id,
                r#"event.device_id == "sensor_1""#,
            ))
            .unwrap();
        let alert = store
            .create_action(NewAction::new(r#"log_message("warn", "hot")"#))
            .unwrap();
        store.bind_action(&always.id, &alert.id).unwrap();
        store.bind_action(&conditional.id, &alert.id).unwrap();

        let records = evaluator.evaluate(&Event::new(
            json!({"temperature": 30, "device_id": "sensor_2"}),
        ));
        let record = &records[0];
        assert!(record.matched);
        assert_eq!(record.triggers.len(), 2);
        assert!(record.triggers[0].fired);
        assert!(!record.triggers[1].fired);
        assert_eq!(record.actions.len(), 1);
        assert_eq!(record.actions[0].trigger_id, always.id);
        assert_eq!(record.actions[0].logs, vec!["[warn] hot"]);

        let records = evaluator.evaluate(&Event::new(
            json!({"temperature": 30, "device_id": "sensor_1"}),
        ));
        assert_eq!(records[0].fired_triggers().count(), 2);
        assert_eq!(records[0].actions.len(), 2);
    }

    #[test]
    fn test_unmatched_rule_skips_triggers() {
        let (store, evaluator) = setup();
        let rule = store
            .create_rule(NewRule::new("hot", "event.temperature > 25"))
            .unwrap();
        store
            .create_trigger(NewTrigger::unconditional(rule.id))
            .unwrap();

        let records = evaluator.evaluate(&Event::new(json!({"temperature": 10})));
        assert!(!records[0].matched);
        assert!(records[0].triggers.is_empty());
        assert!(records[0].actions.is_empty());
    }

    #[test]
    fn test_expired_deadline_records_skipped_rules() {
        let (store, evaluator) = setup();
        let evaluator = evaluator.with_deadline(Duration::ZERO);
        let a = store.create_rule(NewRule::new("a", "true")).unwrap();
        let b = store.create_rule(NewRule::new("b", "true")).unwrap();

        let records = evaluator.evaluate(&Event::new(json!({})));
        let ids: Vec<_> = records.iter().map(|r| r.rule_id).collect();
        assert_eq!(ids, vec![a.id, b.id]);
        assert!(records.iter().all(|r| {
            !r.matched
                && r.error.is_none()
                && r.triggers.is_empty()
                && r.status == EvaluationStatus::PartiallyEvaluated
        }));
    }

    #[test]
    fn test_deadline_marks_partial() {
        // 只依赖墙钟超时，不受操作数限制
        let (store, evaluator) = setup_with(ScriptLimits {
            max_operations: 0,
            ..ScriptLimits::default()
        });
        let evaluator = evaluator.with_deadline(Duration::from_millis(30));
        store
            .create_rule(NewRule::new("slow", "loop { }").with_priority(10))
            .unwrap();
        store.create_rule(NewRule::new("a", "true")).unwrap();

        let records = evaluator.evaluate(&Event::new(json!({})));
        assert_eq!(records.len(), 2);
        assert!(
            records
                .iter()
                .all(|r| r.status == EvaluationStatus::PartiallyEvaluated)
        );
        assert_eq!(records[0].error.as_ref().unwrap().kind, ScriptErrorKind::Timeout);
        assert!(!records[1].matched);
    }

    #[test]
    fn test_last_rule_timeout_at_deadline_is_partial() {
        let (store, evaluator) = setup_with(ScriptLimits {
            max_operations: 0,
            ..ScriptLimits::default()
        });
        let evaluator = evaluator.with_deadline(Duration::from_millis(30));
        store.create_rule(NewRule::new("slow", "loop { }")).unwrap();

        let records = evaluator.evaluate(&Event::new(json!({})));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, EvaluationStatus::PartiallyEvaluated);
    }

    #[test]
    fn test_completed_when_nothing_skipped() {
        let (store, evaluator) = setup();
        store.create_rule(NewRule::new("a", "true")).unwrap();
        store.create_rule(NewRule::new("b", "false")).unwrap();

        let records = evaluator.evaluate(&Event::new(json!({})));
        assert!(
            records
                .iter()
                .all(|r| r.status == EvaluationStatus::Completed)
        );
    }

    #[test]
    fn test_triggers_not_fired_after_deadline() {
        let mut mock = MockScriptSandbox::new();
        mock.expect_check().returning(|_| Ok(()));
        // 谓词本身耗尽了截止时间
        mock.expect_run()
            .withf(|script, _, _| script == "slow_predicate")
            .times(1)
            .returning(|_, _, _| {
                std::thread::sleep(Duration::from_millis(30));
                Ok(ScriptOutput {
                    value: json!(true),
                    logs: Vec::new(),
                })
            });
        mock.expect_run()
            .withf(|script, _, _| script == "side_effect")
            .times(0);

        let sandbox: Arc<dyn ScriptSandbox> = Arc::new(mock);
        let store = RuleStore::new(sandbox.clone());
        let executor = ActionExecutor::new(sandbox.clone(), ScriptLimits::default());
        let evaluator = Evaluator::new(store.clone(), sandbox, executor, ScriptLimits::default())
            .with_deadline(Duration::from_millis(10));

        let rule = store
            .create_rule(NewRule::new("slow", "slow_predicate"))
            .unwrap();
        let trigger = store
            .create_trigger(NewTrigger::unconditional(rule.id))
            .unwrap();
        let action = store.create_action(NewAction::new("side_effect")).unwrap();
        store.bind_action(&trigger.id, &action.id).unwrap();

        let records = evaluator.evaluate(&Event::new(json!({})));
        assert!(records[0].matched);
        assert!(records[0].triggers.is_empty());
        assert!(records[0].actions.is_empty());
        assert_eq!(records[0].status, EvaluationStatus::PartiallyEvaluated);
    }

    #[test]
    fn test_sandbox_is_only_seen_through_trait() {
        let mut mock = MockScriptSandbox::new();
        mock.expect_check().returning(|_| Ok(()));
        mock.expect_run()
            .withf(|script, ctx, _| script == "predicate" && ctx.variables.contains_key("event"))
            .times(1)
            .returning(|_, _, _| {
                Ok(ScriptOutput {
                    value: json!(true),
                    logs: Vec::new(),
                })
            });

        let sandbox: Arc<dyn ScriptSandbox> = Arc::new(mock);
        let store = RuleStore::new(sandbox.clone());
        let executor = ActionExecutor::new(sandbox.clone(), ScriptLimits::default());
        let evaluator = Evaluator::new(store.clone(), sandbox, executor, ScriptLimits::default());

        store.create_rule(NewRule::new("mocked", "predicate")).unwrap();
        let records = evaluator.evaluate(&Event::new(json!({"a": 1})));
        assert!(records[0].matched);
    }

    #[test]
    fn test_mocked_timeout_is_recorded() {
        let mut mock = MockScriptSandbox::new();
        mock.expect_check().returning(|_| Ok(()));
        mock.expect_run()
            .returning(|_, _, limits| {
                Err(ScriptError::Timeout {
                    limit_ms: limits.timeout.as_millis() as u64,
                })
            });

        let sandbox: Arc<dyn ScriptSandbox> = Arc::new(mock);
        let store = RuleStore::new(sandbox.clone());
        let executor = ActionExecutor::new(sandbox.clone(), ScriptLimits::default());
        let evaluator = Evaluator::new(store.clone(), sandbox, executor, ScriptLimits::default());

        store.create_rule(NewRule::new("slow", "x")).unwrap();
        let records = evaluator.evaluate(&Event::new(json!({})));
        assert!(!records[0].matched);
        assert_eq!(records[0].error.as_ref().unwrap().kind, ScriptErrorKind::Timeout);
    }
}
