//! 脚本规则引擎
//!
//! 对事件评估用户定义的规则，提供：
//! - 基于 Rhai 的受限脚本沙箱（谓词、触发条件、动作脚本）
//! - 版本化的规则/触发器/动作存储，写时复制快照
//! - 按优先级排序的多规则评估与动作执行
//! - 执行记录分析仪表盘
//! - 按行读取的事件流接入
//! - 带 API Key 鉴权的服务层

pub mod analytics;
pub mod dto;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod executor;
pub mod ingest;
pub mod loader;
pub mod models;
pub mod record;
pub mod sandbox;
pub mod service;
pub mod store;

pub use analytics::{AnalyticsAggregator, Dashboard, TimeRange};
pub use engine::{RuleEngine, ScriptEvaluation};
pub use error::{Result, RuleError, ScriptError, ScriptErrorKind};
pub use evaluator::Evaluator;
pub use executor::{ActionBatch, ActionExecutor};
pub use models::{
    Action, Event, NewAction, NewRule, NewTrigger, Rule, RuleDetail, Trigger, TriggerKind,
};
pub use record::{ActionOutcome, EvaluationStatus, ExecutionRecord, TriggerOutcome};
pub use sandbox::{
    DataStoreModule, HostModule, HttpModule, RhaiSandbox, ScriptContext, ScriptLimits,
    ScriptSandbox,
};
pub use service::{API_KEY_HEADER, AuthorizedClient, RuleEngineService};
pub use store::{RuleGraph, RuleStore};
