//! 模型目录
//!
//! 记录可用模型的窗口大小、最大输出、延迟档位、成本与各项能力评分，供上下文预算与模型选择使用：
//! - 按 ID 查询窗口与输出上限（上下文分配器）
//! - 按单价估算一次调用成本（状态记录）
//! - 按任务类型、复杂度、预算排序候选模型
//!
//! 目录可从 TOML 文件加载（`[[models]]` 数组），解析失败时回落到内置默认值。

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

/// 模型响应延迟档位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LatencyTier {
    /// 典型 < 2s
    Fast,
    /// 典型 2-10s
    Medium,
    /// 典型 > 10s
    Slow,
}

impl Default for LatencyTier {
    fn default() -> Self {
        Self::Medium
    }
}

fn default_context_window() -> u32 {
    8_000
}

fn default_max_output() -> u32 {
    4_000
}

fn default_true() -> bool {
    true
}

/// 单个模型的规格与能力
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub model_id: String,
    pub provider: String,
    #[serde(default)]
    pub display_name: String,
    /// 每 1k 输入 token 的美元成本
    #[serde(default)]
    pub cost_per_1k_input: f64,
    #[serde(default)]
    pub cost_per_1k_output: f64,
    #[serde(default = "default_context_window")]
    pub context_window: u32,
    #[serde(default = "default_max_output")]
    pub max_output: u32,
    #[serde(default)]
    pub latency_tier: LatencyTier,
    /// 能力评分（0.0-1.0），键如 code / creative / reasoning / factual / vision / tool_use / long_context
    #[serde(default)]
    pub capabilities: BTreeMap<String, f64>,
    #[serde(default = "default_true")]
    pub available: bool,
    #[serde(default)]
    pub deprecated: bool,
    #[serde(default)]
    pub notes: String,
}

impl ModelSpec {
    pub fn new(model_id: impl Into<String>, provider: impl Into<String>) -> Self {
        let model_id = model_id.into();
        Self {
            display_name: model_id.clone(),
            model_id,
            provider: provider.into(),
            cost_per_1k_input: 0.0,
            cost_per_1k_output: 0.0,
            context_window: default_context_window(),
            max_output: default_max_output(),
            latency_tier: LatencyTier::Medium,
            capabilities: BTreeMap::new(),
            available: true,
            deprecated: false,
            notes: String::new(),
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn with_cost(mut self, per_1k_input: f64, per_1k_output: f64) -> Self {
        self.cost_per_1k_input = per_1k_input;
        self.cost_per_1k_output = per_1k_output;
        self
    }

    pub fn with_window(mut self, context_window: u32, max_output: u32) -> Self {
        self.context_window = context_window;
        self.max_output = max_output;
        self
    }

    pub fn with_latency(mut self, tier: LatencyTier) -> Self {
        self.latency_tier = tier;
        self
    }

    pub fn with_capability(mut self, name: impl Into<String>, score: f64) -> Self {
        self.capabilities.insert(name.into(), score);
        self
    }

    pub fn with_available(mut self, available: bool) -> Self {
        self.available = available;
        self
    }

    pub fn deprecated(mut self) -> Self {
        self.deprecated = true;
        self
    }

    pub fn capability(&self, name: &str) -> f64 {
        self.capabilities.get(name).copied().unwrap_or(0.0)
    }

    /// 能力评分是否达到阈值
    pub fn supports(&self, capability: &str, min_score: f64) -> bool {
        self.capability(capability) >= min_score
    }

    /// 估算一次请求的美元成本
    pub fn estimated_cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 / 1000.0) * self.cost_per_1k_input
            + (output_tokens as f64 / 1000.0) * self.cost_per_1k_output
    }

    pub fn is_usable(&self) -> bool {
        self.available && !self.deprecated
    }
}

/// 按任务挑选模型的查询条件
#[derive(Debug, Clone, PartialEq)]
pub struct TaskQuery {
    pub task_type: String,
    /// 复杂度 1-10，越高要求的能力评分越高
    pub complexity: u8,
    /// 每 1k 输出 token 的成本上限
    pub max_cost: Option<f64>,
    pub require_tools: bool,
    pub min_context: u32,
    pub prefer_fast: bool,
}

impl TaskQuery {
    pub fn new(task_type: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            complexity: 5,
            max_cost: None,
            require_tools: false,
            min_context: 0,
            prefer_fast: false,
        }
    }

    pub fn with_complexity(mut self, complexity: u8) -> Self {
        self.complexity = complexity;
        self
    }

    pub fn with_max_cost(mut self, max_cost: f64) -> Self {
        self.max_cost = Some(max_cost);
        self
    }

    pub fn require_tools(mut self) -> Self {
        self.require_tools = true;
        self
    }

    pub fn with_min_context(mut self, tokens: u32) -> Self {
        self.min_context = tokens;
        self
    }

    pub fn prefer_fast(mut self) -> Self {
        self.prefer_fast = true;
        self
    }

    /// 复杂度对应的最低能力评分：5 -> 0.75，10 -> 1.0
    pub fn min_score(&self) -> f64 {
        0.5 + f64::from(self.complexity) / 20.0
    }

    /// 排序分：能力分 * 100 + 速度加成 + 成本分（越便宜越高）
    fn rank(&self, model: &ModelSpec) -> f64 {
        let mut score = model.capability(&self.task_type) * 100.0;
        if self.prefer_fast {
            score += match model.latency_tier {
                LatencyTier::Fast => 20.0,
                LatencyTier::Medium => 10.0,
                LatencyTier::Slow => 0.0,
            };
        }
        score + 10.0 / (model.cost_per_1k_output * 100.0 + 1.0)
    }
}

/// 模型目录文件解析错误
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("failed to read model directory {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid model directory: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Deserialize)]
struct DirectoryFile {
    #[serde(default)]
    models: Vec<ModelSpec>,
}

/// 模型目录：model_id -> ModelSpec
#[derive(Debug, Clone, Default)]
pub struct ModelDirectory {
    models: HashMap<String, ModelSpec>,
    source: Option<PathBuf>,
}

impl ModelDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// 内置默认模型
    pub fn builtin() -> Self {
        let mut dir = Self::new();
        for spec in builtin_models() {
            dir.insert(spec);
        }
        dir
    }

    pub fn from_toml_str(content: &str) -> Result<Self, DirectoryError> {
        let file: DirectoryFile = toml::from_str(content)?;
        let mut dir = Self::new();
        for mut spec in file.models {
            if spec.display_name.is_empty() {
                spec.display_name = spec.model_id.clone();
            }
            dir.insert(spec);
        }
        Ok(dir)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, DirectoryError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| DirectoryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut dir = Self::from_toml_str(&content)?;
        dir.source = Some(path.to_path_buf());
        info!(path = %path.display(), models = dir.len(), "Loaded model directory");
        Ok(dir)
    }

    /// 从文件加载；未配置或文件缺失/损坏时使用内置默认值
    pub fn load_or_builtin(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::builtin();
        };
        if !path.exists() {
            warn!(path = %path.display(), "Model directory file not found, using built-in defaults");
            let mut dir = Self::builtin();
            dir.source = Some(path.to_path_buf());
            return dir;
        }
        match Self::load(path) {
            Ok(dir) => dir,
            Err(e) => {
                error!(error = %e, "Failed to parse model directory, using built-in defaults");
                let mut dir = Self::builtin();
                dir.source = Some(path.to_path_buf());
                dir
            }
        }
    }

    /// 重新从来源文件加载；没有来源文件时恢复内置默认值
    pub fn reload(&mut self) {
        let source = self.source.clone();
        *self = Self::load_or_builtin(source.as_deref());
    }

    pub fn insert(&mut self, spec: ModelSpec) {
        self.models.insert(spec.model_id.clone(), spec);
    }

    pub fn get(&self, model_id: &str) -> Option<&ModelSpec> {
        self.models.get(model_id)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// 全部模型（按 model_id 排序）
    pub fn all(&self) -> Vec<&ModelSpec> {
        let mut models: Vec<_> = self.models.values().collect();
        models.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        models
    }

    /// 可用且未弃用的模型
    pub fn available(&self) -> Vec<&ModelSpec> {
        self.all().into_iter().filter(|m| m.is_usable()).collect()
    }

    pub fn by_provider(&self, provider: &str) -> Vec<&ModelSpec> {
        self.all()
            .into_iter()
            .filter(|m| m.provider == provider)
            .collect()
    }

    /// 静态可用标记；未知模型视为不可用
    pub fn check_availability(&self, model_id: &str) -> bool {
        self.get(model_id).map(|m| m.available).unwrap_or(false)
    }

    /// 满足条件的候选模型，按适配度从高到低排序
    pub fn models_for_task(&self, query: &TaskQuery) -> Vec<&ModelSpec> {
        let min_score = query.min_score();
        let mut candidates: Vec<&ModelSpec> = self
            .available()
            .into_iter()
            .filter(|m| m.supports(&query.task_type, min_score))
            .filter(|m| !query.require_tools || m.supports("tool_use", 0.7))
            .filter(|m| m.context_window >= query.min_context)
            .filter(|m| query.max_cost.map_or(true, |max| m.cost_per_1k_output <= max))
            .collect();
        candidates.sort_by(|a, b| query.rank(b).total_cmp(&query.rank(a)));
        candidates
    }
}

fn builtin_models() -> Vec<ModelSpec> {
    vec![
        ModelSpec::new("claude-sonnet-4-20250514", "anthropic")
            .with_display_name("Claude Sonnet 4")
            .with_cost(0.003, 0.015)
            .with_window(200_000, 8_192)
            .with_latency(LatencyTier::Medium)
            .with_capability("code", 0.95)
            .with_capability("creative", 0.90)
            .with_capability("reasoning", 0.90)
            .with_capability("factual", 0.85)
            .with_capability("tool_use", 0.95)
            .with_capability("long_context", 0.90),
        ModelSpec::new("claude-opus-4-20250514", "anthropic")
            .with_display_name("Claude Opus 4")
            .with_cost(0.015, 0.075)
            .with_window(200_000, 8_192)
            .with_latency(LatencyTier::Slow)
            .with_capability("code", 0.98)
            .with_capability("creative", 0.95)
            .with_capability("reasoning", 0.98)
            .with_capability("factual", 0.90)
            .with_capability("tool_use", 0.95)
            .with_capability("long_context", 0.95),
        ModelSpec::new("gemini-2.0-flash", "google")
            .with_display_name("Gemini 2.0 Flash")
            .with_cost(0.00035, 0.0015)
            .with_window(1_000_000, 8_192)
            .with_latency(LatencyTier::Fast)
            .with_capability("code", 0.85)
            .with_capability("creative", 0.80)
            .with_capability("reasoning", 0.80)
            .with_capability("factual", 0.85)
            .with_capability("tool_use", 0.85)
            .with_capability("long_context", 0.95)
            .with_capability("vision", 0.85),
        ModelSpec::new("gpt-4o", "openai")
            .with_display_name("GPT-4o")
            .with_cost(0.005, 0.015)
            .with_window(128_000, 4_096)
            .with_latency(LatencyTier::Medium)
            .with_capability("code", 0.90)
            .with_capability("creative", 0.85)
            .with_capability("reasoning", 0.90)
            .with_capability("factual", 0.90)
            .with_capability("tool_use", 0.90)
            .with_capability("vision", 0.90),
        ModelSpec::new("gpt-4o-mini", "openai")
            .with_display_name("GPT-4o Mini")
            .with_cost(0.00015, 0.0006)
            .with_window(128_000, 4_096)
            .with_latency(LatencyTier::Fast)
            .with_capability("code", 0.75)
            .with_capability("creative", 0.70)
            .with_capability("reasoning", 0.70)
            .with_capability("factual", 0.80)
            .with_capability("tool_use", 0.80)
            .with_capability("vision", 0.75),
    ]
}
