//! 动作执行器
//!
//! 在允许副作用的沙箱上下文中运行触发器绑定的动作脚本，
//! 脚本失败记录为失败结果，不会向调用方传播。

use crate::error::ScriptErrorKind;
use crate::models::Action;
use crate::record::{ActionOutcome, ScriptFailure};
use crate::sandbox::{Capabilities, ScriptContext, ScriptLimits, ScriptSandbox};
use engine_shared::config::ActionFailurePolicy;
use engine_shared::observability::metrics;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// 动作执行器
#[derive(Clone)]
pub struct ActionExecutor {
    sandbox: Arc<dyn ScriptSandbox>,
    limits: ScriptLimits,
    policy: ActionFailurePolicy,
}

impl ActionExecutor {
    pub fn new(sandbox: Arc<dyn ScriptSandbox>, limits: ScriptLimits) -> Self {
        Self {
            sandbox,
            limits,
            policy: ActionFailurePolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: ActionFailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> ActionFailurePolicy {
        self.policy
    }

    /// 执行单个动作
    ///
    /// `context` 为触发器所在的事件上下文，执行时追加动作 ID 并开放副作用函数。
    pub fn run(
        &self,
        action: &Action,
        trigger_id: Uuid,
        context: &ScriptContext,
        deadline: Instant,
    ) -> ActionOutcome {
        let start = Instant::now();
        let ctx = context
            .clone()
            .with_action(action.id)
            .with_capabilities(Capabilities::SideEffects);

        let result = self
            .sandbox
            .run(&action.script, &ctx, &self.limits.clamp_to(deadline));
        let elapsed = start.elapsed();

        let outcome = match result {
            Ok(output) => {
                debug!(action_id = %action.id, "动作执行成功");
                ActionOutcome {
                    action_id: action.id,
                    trigger_id,
                    executed: true,
                    succeeded: true,
                    error: None,
                    duration_ms: elapsed.as_secs_f64() * 1000.0,
                    logs: output.logs,
                }
            }
            Err(e) => {
                warn!(action_id = %action.id, error = %e, "动作执行失败");
                metrics::record_script_error("action", e.kind().as_str());
                ActionOutcome {
                    action_id: action.id,
                    trigger_id,
                    executed: true,
                    succeeded: false,
                    error: Some(ScriptFailure::from(&e)),
                    duration_ms: elapsed.as_secs_f64() * 1000.0,
                    logs: Vec::new(),
                }
            }
        };

        metrics::record_action_execution(
            if outcome.succeeded { "success" } else { "failure" },
            elapsed.as_secs_f64(),
        );
        outcome
    }

    /// 依次执行触发器的动作，按失败策略决定是否跳过剩余动作
    ///
    /// 截止时间到达后剩余动作不再执行，记为未执行。
    pub fn run_all(
        &self,
        actions: &[Arc<Action>],
        trigger_id: Uuid,
        context: &ScriptContext,
        deadline: Instant,
    ) -> ActionBatch {
        let mut batch = ActionBatch {
            outcomes: Vec::with_capacity(actions.len()),
            deadline_reached: false,
        };
        let mut aborted = false;

        for action in actions.iter().filter(|a| a.enabled) {
            if !aborted && !batch.deadline_reached && Instant::now() >= deadline {
                debug!(%trigger_id, "已过截止时间，跳过剩余动作");
                batch.deadline_reached = true;
            }
            if aborted || batch.deadline_reached {
                batch.outcomes.push(ActionOutcome::skipped(action.id, trigger_id));
                continue;
            }

            let outcome = self.run(action, trigger_id, context, deadline);
            if !outcome.succeeded {
                if outcome.error.as_ref().map(|e| e.kind) == Some(ScriptErrorKind::Timeout)
                    && Instant::now() >= deadline
                {
                    batch.deadline_reached = true;
                }
                if self.policy == ActionFailurePolicy::AbortRemaining {
                    aborted = true;
                }
            }
            batch.outcomes.push(outcome);
        }

        batch
    }
}

/// 一个触发器下全部动作的执行结果
#[derive(Debug, Clone, Default)]
pub struct ActionBatch {
    pub outcomes: Vec<ActionOutcome>,
    /// 截止时间打断了本批动作
    pub deadline_reached: bool,
}
