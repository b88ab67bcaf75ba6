//! 配置管理模块
//!
//! 支持多格式配置文件加载，环境变量覆盖，以及类型安全的配置访问。

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::observability::ObservabilityConfig;

/// 动作失败处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionFailurePolicy {
    /// 单个动作失败不影响同一触发器下的后续动作
    #[default]
    Continue,
    /// 首个失败的动作终止同一触发器下剩余动作
    AbortRemaining,
}

/// 规则引擎配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// 单个脚本的最长执行时间（毫秒）
    pub script_timeout_ms: u64,
    /// 单个脚本允许执行的最大操作数
    pub max_operations: u64,
    pub max_string_size: usize,
    pub max_array_size: usize,
    pub max_map_size: usize,
    pub max_call_levels: usize,
    pub max_expr_depth: usize,
    /// 单个事件完整评估的截止时间（毫秒）
    pub evaluation_deadline_ms: u64,
    /// 动作脚本发起 HTTP 请求的超时上限（毫秒）
    pub http_timeout_ms: u64,
    pub action_failure_policy: ActionFailurePolicy,
    /// 执行记录保留时长（小时）
    pub analytics_retention_hours: u64,
    /// 已编译脚本缓存上限
    pub ast_cache_size: usize,
    /// 同时进行的事件评估数上限
    pub max_concurrent_evaluations: usize,
    /// 启动时加载的规则种子文件（JSON）
    pub rules_file: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            script_timeout_ms: 100,
            max_operations: 100_000,
            max_string_size: 64 * 1024,
            max_array_size: 10_000,
            max_map_size: 10_000,
            max_call_levels: 32,
            max_expr_depth: 64,
            evaluation_deadline_ms: 2_000,
            http_timeout_ms: 5_000,
            action_failure_policy: ActionFailurePolicy::Continue,
            analytics_retention_hours: 24 * 7,
            ast_cache_size: 1_024,
            max_concurrent_evaluations: 64,
            rules_file: None,
        }
    }
}

impl EngineConfig {
    pub fn script_timeout(&self) -> Duration {
        Duration::from_millis(self.script_timeout_ms)
    }

    pub fn evaluation_deadline(&self) -> Duration {
        Duration::from_millis(self.evaluation_deadline_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn analytics_retention(&self) -> Duration {
        Duration::from_secs(self.analytics_retention_hours * 3600)
    }
}

/// 认证配置
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// X-API-Key 期望值，未配置时拒绝所有请求
    pub api_key: Option<String>,
}

/// 应用配置
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub service_name: String,
    pub environment: String,
    pub observability: ObservabilityConfig,
    pub engine: EngineConfig,
    pub auth: AuthConfig,
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序（后加载的会覆盖先加载的同名配置项）：
    /// 1. config/default.toml（默认配置）
    /// 2. config/{environment}.toml（环境特定配置）
    /// 3. config/{service_name}.toml（服务特定配置）
    /// 4. 环境变量（RULE_ENGINE_ 前缀，层级用双下划线，如 RULE_ENGINE_ENGINE__SCRIPT_TIMEOUT_MS -> engine.script_timeout_ms）
    pub fn load(service_name: &str) -> Result<Self, ConfigError> {
        let env = std::env::var("RULE_ENGINE_ENV").unwrap_or_else(|_| "development".to_string());

        let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_string());

        let builder = Config::builder()
            .set_default("service_name", service_name)?
            .set_default("environment", env.clone())?
            .add_source(File::from(Path::new(&config_dir).join("default.toml")).required(false))
            .add_source(
                File::from(Path::new(&config_dir).join(format!("{}.toml", env))).required(false),
            )
            .add_source(
                File::from(Path::new(&config_dir).join(format!("{}.toml", service_name)))
                    .required(false),
            )
            .add_source(
                Environment::with_prefix("RULE_ENGINE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        let mut config: Self = builder.build()?.try_deserialize()?;
        config.observability.service_name = config.service_name.clone();

        // 兼容直接通过 API_KEY 环境变量注入密钥
        if config.auth.api_key.is_none() {
            config.auth.api_key = std::env::var("API_KEY").ok().filter(|k| !k.is_empty());
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.engine.script_timeout_ms, 100);
        assert_eq!(config.engine.action_failure_policy, ActionFailurePolicy::Continue);
        assert!(config.auth.api_key.is_none());
    }

    #[test]
    fn test_engine_durations() {
        let engine = EngineConfig {
            script_timeout_ms: 250,
            evaluation_deadline_ms: 1_500,
            analytics_retention_hours: 24,
            ..Default::default()
        };
        assert_eq!(engine.script_timeout(), Duration::from_millis(250));
        assert_eq!(engine.evaluation_deadline(), Duration::from_millis(1_500));
        assert_eq!(engine.analytics_retention(), Duration::from_secs(86_400));
    }

    #[test]
    fn test_failure_policy_deserialize() {
        let policy: ActionFailurePolicy = serde_json::from_str("\"ABORT_REMAINING\"").unwrap();
        assert_eq!(policy, ActionFailurePolicy::AbortRemaining);
    }

    #[test]
    fn test_partial_engine_section() {
        let engine: EngineConfig =
            serde_json::from_value(serde_json::json!({ "script_timeout_ms": 20 })).unwrap();
        assert_eq!(engine.script_timeout_ms, 20);
        assert_eq!(engine.max_operations, 100_000);
    }
}
