//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `LEGION__*` 覆盖（双下划线表示嵌套，如 `LEGION__DISPATCH__PRIMARY_MODEL=gpt-4o`）。
//! 列表用逗号分隔：`LEGION__DISPATCH__FALLBACK_MODELS=a,b`。

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::llm::RetryPolicy;
use crate::memory::ContextSettings;
use crate::state::DEFAULT_MAX_HISTORY;
use crate::workflow::{DispatchSettings, DEFAULT_FALLBACK_MODEL, DEFAULT_PRIMARY_MODEL};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub dispatch: DispatchSection,
    pub budget: BudgetSection,
    pub store: StoreSection,
    pub models: ModelsSection,
}

/// [dispatch] 段：模型选择、重试退避、并发与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchSection {
    pub primary_model: String,
    pub fallback_models: Vec<String>,
    /// 角色 -> 主模型
    pub role_models: HashMap<String, String>,
    /// 每个模型的最大尝试次数
    pub max_retries: u32,
    pub initial_backoff_secs: f64,
    pub backoff_multiplier: f64,
    /// 抖动比例（0.1 表示 0~10%）
    pub jitter_ratio: f64,
    pub max_parallel_steps: usize,
    /// 单步超时（秒），不设置则不限
    pub step_timeout_secs: Option<u64>,
    /// 整个计划的超时（秒）
    pub plan_timeout_secs: Option<u64>,
}

impl Default for DispatchSection {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            primary_model: DEFAULT_PRIMARY_MODEL.to_string(),
            fallback_models: vec![DEFAULT_FALLBACK_MODEL.to_string()],
            role_models: HashMap::new(),
            max_retries: retry.max_retries,
            initial_backoff_secs: retry.initial_backoff.as_secs_f64(),
            backoff_multiplier: retry.multiplier,
            jitter_ratio: retry.jitter_ratio,
            max_parallel_steps: 1,
            step_timeout_secs: None,
            plan_timeout_secs: None,
        }
    }
}

impl DispatchSection {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_backoff: Duration::try_from_secs_f64(self.initial_backoff_secs)
                .unwrap_or(Duration::ZERO),
            multiplier: self.backoff_multiplier,
            jitter_ratio: self.jitter_ratio.clamp(0.0, 1.0),
        }
    }

    pub fn to_settings(&self) -> DispatchSettings {
        DispatchSettings {
            primary_model: self.primary_model.clone(),
            fallback_models: self.fallback_models.clone(),
            role_models: self.role_models.clone(),
            retry: self.retry_policy(),
            max_parallel_steps: self.max_parallel_steps.max(1),
            step_timeout: self.step_timeout_secs.map(Duration::from_secs),
            plan_timeout: self.plan_timeout_secs.map(Duration::from_secs),
        }
    }
}

/// [budget] 段：上下文预算
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BudgetSection {
    pub reserved_for_system: usize,
    /// 低于该 token 数的剩余预算不再放入可截断段落
    pub min_section_tokens: usize,
    /// 模型目录中找不到模型时使用
    pub default_context_window: usize,
    pub default_max_output: usize,
}

impl Default for BudgetSection {
    fn default() -> Self {
        let settings = ContextSettings::default();
        Self {
            reserved_for_system: settings.reserved_for_system,
            min_section_tokens: settings.min_section_tokens,
            default_context_window: settings.default_context_window,
            default_max_output: settings.default_max_output,
        }
    }
}

impl BudgetSection {
    pub fn to_settings(&self) -> ContextSettings {
        ContextSettings {
            reserved_for_system: self.reserved_for_system,
            min_section_tokens: self.min_section_tokens,
            default_context_window: self.default_context_window,
            default_max_output: self.default_max_output,
        }
    }
}

/// [store] 段：SQLite 状态库
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub db_path: PathBuf,
    /// 每个 Agent 保留的历史行数
    pub max_history: usize,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/state.db"),
            max_history: DEFAULT_MAX_HISTORY,
        }
    }
}

/// [models] 段：模型目录文件（不设置则使用内置目录）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ModelsSection {
    pub path: Option<PathBuf>,
}

/// 从 config 目录加载配置，环境变量 LEGION__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 LEGION__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("LEGION")
            .prefix_separator("__")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("dispatch.fallback_models")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
