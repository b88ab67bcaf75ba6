//! 宿主函数模块
//!
//! 宿主环境通过 `HostModule` 向脚本暴露函数。只读模块对所有脚本可见，
//! 副作用模块只注册到动作脚本的引擎实例。

use super::{Capabilities, Invocation, ScriptLimits};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use rhai::{Dynamic, Engine, EvalAltResult};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// 单次调用的日志收集器
#[derive(Debug, Clone, Default)]
pub struct ExecutionLog {
    lines: Arc<Mutex<Vec<String>>>,
}

impl ExecutionLog {
    pub fn push(&self, line: String) {
        self.lines.lock().push(line);
    }

    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.lines.lock())
    }
}

/// 注册宿主函数时可用的单次调用信息
pub struct HostCall<'a> {
    pub invocation: &'a Invocation,
    pub log: &'a ExecutionLog,
    pub limits: &'a ScriptLimits,
    /// 本次脚本执行的墙钟截止时间
    pub deadline: Instant,
}

impl<'a> HostCall<'a> {
    pub fn new(invocation: &'a Invocation, log: &'a ExecutionLog, limits: &'a ScriptLimits) -> Self {
        Self {
            invocation,
            log,
            limits,
            deadline: Instant::now() + limits.timeout,
        }
    }
}

/// 宿主函数模块
pub trait HostModule: Send + Sync {
    fn name(&self) -> &'static str;

    /// 使用本模块所需的最低能力
    fn capabilities(&self) -> Capabilities;

    /// 将函数注册到本次调用的引擎实例
    fn register(&self, engine: &mut Engine, call: &HostCall<'_>);
}

/// 时间辅助函数：`now()` / `get_current_time()`（秒）与 `now_millis()`
pub struct TimeModule;

impl HostModule for TimeModule {
    fn name(&self) -> &'static str {
        "time"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::ReadOnly
    }

    fn register(&self, engine: &mut Engine, _call: &HostCall<'_>) {
        engine.register_fn("now", || Utc::now().timestamp());
        engine.register_fn("get_current_time", || Utc::now().timestamp());
        engine.register_fn("now_millis", || Utc::now().timestamp_millis());
    }
}

/// 日志函数：`log_message(level, message)` 与 `log_info(message)`
///
/// 日志同时写入 tracing 与本次调用的 `ExecutionLog`。
pub struct LoggerModule;

impl LoggerModule {
    fn emit(invocation: &Invocation, log: &ExecutionLog, level: &str, message: &str) {
        let rule_id = invocation.rule_id.map(|id| id.to_string()).unwrap_or_default();
        let action_id = invocation.action_id.map(|id| id.to_string()).unwrap_or_default();

        match level {
            "debug" => debug!(target: "script", %rule_id, %action_id, "{}", message),
            "warn" | "warning" => warn!(target: "script", %rule_id, %action_id, "{}", message),
            "error" => error!(target: "script", %rule_id, %action_id, "{}", message),
            _ => info!(target: "script", %rule_id, %action_id, script_level = level, "{}", message),
        }

        log.push(format!("[{}] {}", level, message));
    }
}

impl HostModule for LoggerModule {
    fn name(&self) -> &'static str {
        "logger"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::SideEffects
    }

    fn register(&self, engine: &mut Engine, call: &HostCall<'_>) {
        let (inv, sink) = (call.invocation.clone(), call.log.clone());
        engine.register_fn("log_message", move |level: &str, message: Dynamic| {
            Self::emit(&inv, &sink, level, &message.to_string());
        });

        let (inv, sink) = (call.invocation.clone(), call.log.clone());
        engine.register_fn("log_info", move |message: Dynamic| {
            Self::emit(&inv, &sink, "info", &message.to_string());
        });
    }
}

type DataScope = (Option<Uuid>, Option<Uuid>);

/// 执行数据存储：`store_data(key, value)` 与 `get_stored_data(key)`
///
/// 数据按 (规则, 触发器) 隔离并跨调用保留，同一触发器的动作可以借此累积状态。
/// 每个作用域的键数受 `max_map_size` 限制。
#[derive(Debug, Clone, Default)]
pub struct DataStoreModule {
    scopes: Arc<DashMap<DataScope, HashMap<String, Dynamic>>>,
}

impl DataStoreModule {
    pub fn new() -> Self {
        Self::default()
    }

    /// 读取某个作用域下保存的值
    pub fn get(&self, rule_id: Option<Uuid>, trigger_id: Option<Uuid>, key: &str) -> Option<Dynamic> {
        self.scopes
            .get(&(rule_id, trigger_id))
            .and_then(|data| data.get(key).cloned())
    }
}

impl HostModule for DataStoreModule {
    fn name(&self) -> &'static str {
        "data_store"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::SideEffects
    }

    fn register(&self, engine: &mut Engine, call: &HostCall<'_>) {
        let scope: DataScope = (call.invocation.rule_id, call.invocation.trigger_id);
        let max_keys = call.limits.max_map_size;

        let scopes = self.scopes.clone();
        engine.register_fn(
            "store_data",
            move |key: &str, value: Dynamic| -> Result<(), Box<EvalAltResult>> {
                if key.is_empty() {
                    return Err("store_data: key 不能为空".into());
                }
                let mut data = scopes.entry(scope).or_default();
                if max_keys > 0 && data.len() >= max_keys && !data.contains_key(key) {
                    return Err(format!("store_data: 键数量超过上限 {}", max_keys).into());
                }
                data.insert(key.to_string(), value.flatten());
                Ok(())
            },
        );

        let scopes = self.scopes.clone();
        engine.register_fn("get_stored_data", move |key: &str| -> Dynamic {
            scopes
                .get(&scope)
                .and_then(|data| data.get(key).cloned())
                .unwrap_or(Dynamic::UNIT)
        });
    }
}
