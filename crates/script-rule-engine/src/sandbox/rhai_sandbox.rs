//! 基于 Rhai 的脚本沙箱实现
//!
//! - 每次调用创建独立的 raw 引擎，仅挂载共享的标准库模块与允许的宿主函数
//! - 无模块解析器、禁用 `eval`，脚本只能访问注入的上下文变量
//! - 通过操作数、数据大小、调用深度限制内存与栈，通过进度回调限制墙钟时间
//! - 已编译的 AST 按脚本文本缓存，超出容量时按最近最少使用淘汰

use super::host::{DataStoreModule, ExecutionLog, HostCall, HostModule, LoggerModule, TimeModule};
use super::{Capabilities, Invocation, ScriptContext, ScriptLimits, ScriptOutput, ScriptSandbox};
use crate::error::ScriptError;
use moka::sync::Cache;
use rhai::packages::{Package, StandardPackage};
use rhai::{AST, Dynamic, Engine, EvalAltResult, ParseError, Scope, Shared};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// 进度回调检查墙钟时间的间隔（操作数）
const PROGRESS_CHECK_INTERVAL: u64 = 64;

const DEFAULT_AST_CACHE_SIZE: usize = 1_024;

/// Rhai 脚本沙箱
pub struct RhaiSandbox {
    stdlib: Shared<rhai::Module>,
    /// 仅用于编译与语法检查的引擎
    compiler: Engine,
    modules: Vec<Arc<dyn HostModule>>,
    /// 容量为 0 时不缓存
    ast_cache: Option<Cache<String, Arc<AST>>>,
}

fn ast_cache(capacity: usize) -> Option<Cache<String, Arc<AST>>> {
    (capacity > 0).then(|| Cache::builder().max_capacity(capacity as u64).build())
}

impl RhaiSandbox {
    /// 创建沙箱，默认挂载时间、日志与数据存储宿主模块
    pub fn new() -> Self {
        let stdlib = StandardPackage::new().as_shared_module();
        let limits = ScriptLimits::default();

        let mut compiler = Engine::new_raw();
        compiler.register_global_module(stdlib.clone());
        compiler.set_max_expr_depths(limits.max_expr_depth, limits.max_expr_depth);
        compiler.disable_symbol("eval");

        Self {
            stdlib,
            compiler,
            modules: vec![
                Arc::new(TimeModule),
                Arc::new(LoggerModule),
                Arc::new(DataStoreModule::new()),
            ],
            ast_cache: ast_cache(DEFAULT_AST_CACHE_SIZE),
        }
    }

    /// 设置 AST 缓存上限（0 表示不缓存）
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.ast_cache = ast_cache(capacity);
        self
    }

    /// 设置编译期表达式深度上限
    pub fn with_expr_depth(mut self, depth: usize) -> Self {
        self.compiler.set_max_expr_depths(depth, depth);
        self
    }

    /// 注册宿主提供的额外函数模块
    pub fn with_module(mut self, module: Arc<dyn HostModule>) -> Self {
        self.modules.push(module);
        self
    }

    pub fn cached_scripts(&self) -> usize {
        self.ast_cache.as_ref().map_or(0, |cache| {
            cache.run_pending_tasks();
            cache.entry_count() as usize
        })
    }

    fn compile(&self, script: &str) -> Result<Arc<AST>, ScriptError> {
        let Some(cache) = &self.ast_cache else {
            return Ok(Arc::new(self.compiler.compile(script).map_err(syntax_error)?));
        };

        if let Some(ast) = cache.get(script) {
            return Ok(ast);
        }

        let ast = Arc::new(self.compiler.compile(script).map_err(syntax_error)?);
        cache.insert(script.to_string(), ast.clone());
        Ok(ast)
    }

    fn build_engine(
        &self,
        limits: &ScriptLimits,
        capabilities: Capabilities,
        invocation: &Invocation,
        log: &ExecutionLog,
    ) -> Engine {
        let mut engine = Engine::new_raw();
        engine.register_global_module(self.stdlib.clone());

        engine.set_max_operations(limits.max_operations);
        engine.set_max_string_size(limits.max_string_size);
        engine.set_max_array_size(limits.max_array_size);
        engine.set_max_map_size(limits.max_map_size);
        engine.set_max_call_levels(limits.max_call_levels);
        engine.set_max_expr_depths(limits.max_expr_depth, limits.max_expr_depth);
        engine.disable_symbol("eval");

        let started = Instant::now();
        let timeout = limits.timeout;
        engine.on_progress(move |ops| {
            if ops % PROGRESS_CHECK_INTERVAL == 0 && started.elapsed() >= timeout {
                Some(Dynamic::from("timeout"))
            } else {
                None
            }
        });

        engine.on_print(|text| debug!(target: "script", "print: {}", text));
        engine.on_debug(|text, _source, pos| debug!(target: "script", ?pos, "debug: {}", text));

        let call = HostCall::new(invocation, log, limits);
        for module in &self.modules {
            if capabilities == Capabilities::SideEffects
                || module.capabilities() == Capabilities::ReadOnly
            {
                module.register(&mut engine, &call);
            }
        }

        engine
    }
}

impl Default for RhaiSandbox {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptSandbox for RhaiSandbox {
    fn check(&self, script: &str) -> Result<(), ScriptError> {
        self.compile(script).map(|_| ())
    }

    fn run(
        &self,
        script: &str,
        context: &ScriptContext,
        limits: &ScriptLimits,
    ) -> Result<ScriptOutput, ScriptError> {
        let ast = self.compile(script)?;

        let mut scope = Scope::new();
        for (name, value) in &context.variables {
            let dynamic = rhai::serde::to_dynamic(value)
                .map_err(|e| ScriptError::Runtime(format!("无法注入变量 {}: {}", name, e)))?;
            scope.push_constant_dynamic(name.as_str(), dynamic);
        }

        let log = ExecutionLog::default();
        let engine = self.build_engine(limits, context.capabilities, &context.invocation, &log);

        let result = engine
            .eval_ast_with_scope::<Dynamic>(&mut scope, &ast)
            .map_err(|e| eval_error(*e, limits))?;

        let value: Value = rhai::serde::from_dynamic(&result).map_err(|e| {
            ScriptError::InvalidResult {
                expected: "JSON 兼容的值".to_string(),
                actual: format!("{} ({})", result.type_name(), e),
            }
        })?;

        Ok(ScriptOutput {
            value,
            logs: log.take(),
        })
    }
}

fn syntax_error(err: ParseError) -> ScriptError {
    ScriptError::Syntax {
        line: err.position().line(),
        message: err.to_string(),
    }
}

/// 将 Rhai 运行时错误映射为沙箱错误分类
fn eval_error(err: EvalAltResult, limits: &ScriptLimits) -> ScriptError {
    match err {
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _)
        | EvalAltResult::ErrorInModule(_, inner, _) => eval_error(*inner, limits),
        EvalAltResult::ErrorTerminated(..) => ScriptError::Timeout {
            limit_ms: limits.timeout.as_millis() as u64,
        },
        EvalAltResult::ErrorTooManyOperations(_) => ScriptError::ResourceExceeded(format!(
            "操作数超过上限 {}",
            limits.max_operations
        )),
        EvalAltResult::ErrorDataTooLarge(what, _) => {
            ScriptError::ResourceExceeded(format!("{} 超过上限", what))
        }
        EvalAltResult::ErrorStackOverflow(_) => {
            ScriptError::ResourceExceeded(format!("调用深度超过上限 {}", limits.max_call_levels))
        }
        EvalAltResult::ErrorParsing(kind, pos) => ScriptError::Syntax {
            message: kind.to_string(),
            line: pos.line(),
        },
        other => ScriptError::Runtime(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ScriptErrorKind;
    use serde_json::json;
    use std::time::Duration;

    fn run(script: &str, event: Value) -> Result<ScriptOutput, ScriptError> {
        RhaiSandbox::new().run(script, &ScriptContext::for_event(&event), &ScriptLimits::default())
    }

    #[test]
    fn test_predicate_returns_bool() {
        let out = run("return event.temperature > 25", json!({"temperature": 30})).unwrap();
        assert_eq!(out.value, json!(true));

        let out = run("return event.temperature > 25", json!({"temperature": 10})).unwrap();
        assert_eq!(out.value, json!(false));
    }

    #[test]
    fn test_string_comparison_and_float() {
        let out = run(
            r#"event.device_id == "sensor_1" && event.humidity > 40"#,
            json!({"device_id": "sensor_1", "humidity": 55.5}),
        )
        .unwrap();
        assert_eq!(out.value, json!(true));
    }

    #[test]
    fn test_no_return_value_is_null() {
        let out = run("let x = 1;", json!({})).unwrap();
        assert_eq!(out.value, Value::Null);
    }

    #[test]
    fn test_syntax_check() {
        let sandbox = RhaiSandbox::new();
        assert!(sandbox.check("return event.temperature > 25").is_ok());

        let err = sandbox.check("return (event.temperature > ").unwrap_err();
        assert_eq!(err.kind(), ScriptErrorKind::Syntax);
    }

    #[test]
    fn test_runtime_error() {
        let err = run(r#"throw "boom""#, json!({})).unwrap_err();
        assert_eq!(err.kind(), ScriptErrorKind::Runtime);
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_event_is_read_only() {
        let err = run("event.temperature = 1; true", json!({"temperature": 30})).unwrap_err();
        assert_eq!(err.kind(), ScriptErrorKind::Runtime);
    }

    #[test]
    fn test_infinite_loop_times_out() {
        let sandbox = RhaiSandbox::new();
        let limits = ScriptLimits {
            max_operations: 0,
            ..ScriptLimits::default().with_timeout(Duration::from_millis(20))
        };

        let started = Instant::now();
        let err = sandbox
            .run("loop { }", &ScriptContext::new(Capabilities::ReadOnly), &limits)
            .unwrap_err();

        assert_eq!(err, ScriptError::Timeout { limit_ms: 20 });
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_operation_limit() {
        let sandbox = RhaiSandbox::new();
        let limits = ScriptLimits {
            max_operations: 500,
            ..ScriptLimits::default().with_timeout(Duration::from_secs(5))
        };

        let err = sandbox
            .run(
                "let x = 0; while true { x += 1; }",
                &ScriptContext::new(Capabilities::ReadOnly),
                &limits,
            )
            .unwrap_err();
        assert_eq!(err.kind(), ScriptErrorKind::ResourceExceeded);
    }

    #[test]
    fn test_string_size_limit() {
        let sandbox = RhaiSandbox::new();
        let limits = ScriptLimits {
            max_string_size: 16,
            ..ScriptLimits::default()
        };

        let err = sandbox
            .run(
                r#"let s = "0123456789"; s += s; s += s; s"#,
                &ScriptContext::new(Capabilities::ReadOnly),
                &limits,
            )
            .unwrap_err();
        assert_eq!(err.kind(), ScriptErrorKind::ResourceExceeded);
    }

    #[test]
    fn test_recursion_limit() {
        let sandbox = RhaiSandbox::new();
        let limits = ScriptLimits {
            max_call_levels: 8,
            ..ScriptLimits::default()
        };

        let err = sandbox
            .run(
                "fn down(n) { down(n + 1) } down(0)",
                &ScriptContext::new(Capabilities::ReadOnly),
                &limits,
            )
            .unwrap_err();
        assert_eq!(err.kind(), ScriptErrorKind::ResourceExceeded);
    }

    #[test]
    fn test_eval_is_disabled() {
        let err = RhaiSandbox::new().check(r#"eval("1 + 1")"#).unwrap_err();
        assert_eq!(err.kind(), ScriptErrorKind::Syntax);
    }

    #[test]
    fn test_side_effect_functions_require_capability() {
        let sandbox = RhaiSandbox::new();
        let script = r#"log_message("info", "fired"); true"#;

        let read_only = ScriptContext::new(Capabilities::ReadOnly);
        let err = sandbox
            .run(script, &read_only, &ScriptLimits::default())
            .unwrap_err();
        assert_eq!(err.kind(), ScriptErrorKind::Runtime);

        let with_effects = read_only.with_capabilities(Capabilities::SideEffects);
        let out = sandbox
            .run(script, &with_effects, &ScriptLimits::default())
            .unwrap();
        assert_eq!(out.logs, vec!["[info] fired"]);
    }

    #[test]
    fn test_read_only_helpers_available() {
        let out = run("now() > 0", json!({})).unwrap();
        assert_eq!(out.value, json!(true));
    }

    #[test]
    fn test_ast_cache_is_bounded() {
        let sandbox = RhaiSandbox::new().with_cache_capacity(2);
        for i in 0..50 {
            sandbox.check(&format!("{} + 1", i)).unwrap();
        }
        assert!(sandbox.cached_scripts() <= 2);

        // 频繁使用的脚本不会因为容量淘汰而失效
        sandbox.check("0 + 1").unwrap();
        let out = sandbox
            .run("0 + 1", &ScriptContext::new(Capabilities::ReadOnly), &ScriptLimits::default())
            .unwrap();
        assert_eq!(out.value, json!(1));
    }

    #[test]
    fn test_cache_disabled() {
        let sandbox = RhaiSandbox::new().with_cache_capacity(0);
        sandbox.check("1 + 1").unwrap();
        assert_eq!(sandbox.cached_scripts(), 0);
        assert!(sandbox.check("1 +").is_err());
    }

    #[test]
    fn test_stored_data_visible_to_later_actions() {
        let sandbox = RhaiSandbox::new();
        let ctx = ScriptContext::new(Capabilities::SideEffects)
            .with_rule(uuid::Uuid::new_v4())
            .with_trigger(uuid::Uuid::new_v4());

        sandbox
            .run(r#"store_data("hits", 1)"#, &ctx, &ScriptLimits::default())
            .unwrap();
        let out = sandbox
            .run(r#"get_stored_data("hits") + 1"#, &ctx, &ScriptLimits::default())
            .unwrap();
        assert_eq!(out.value, json!(2));

        let read_only = ctx.with_capabilities(Capabilities::ReadOnly);
        assert!(sandbox
            .run(r#"get_stored_data("hits")"#, &read_only, &ScriptLimits::default())
            .is_err());
    }

    #[test]
    fn test_invocations_are_isolated() {
        let sandbox = RhaiSandbox::new();
        let ctx = ScriptContext::for_event(&json!({"n": 1}));

        // 上一次调用中定义的变量不会泄漏到下一次调用
        sandbox
            .run("let leaked = 42; true", &ctx, &ScriptLimits::default())
            .unwrap();
        let err = sandbox
            .run("leaked == 42", &ctx, &ScriptLimits::default())
            .unwrap_err();
        assert_eq!(err.kind(), ScriptErrorKind::Runtime);
    }
}
