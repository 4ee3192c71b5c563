//! 上下文窗口管理
//!
//! 换模型时窗口大小随之变化，分配器负责把 AgentState 裁剪进目标模型的窗口：
//! 1. 当前目标与待办步骤（必保留）
//! 2. 最近完成的步骤
//! 3. 工作记忆变量、长期记忆召回
//! 4. 上游 Agent 输出
//! 5. 长期用户背景
//!
//! 纯函数式：不修改状态，不做 I/O。

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::llm::ModelDirectory;
use crate::memory::token_budget::{
    truncate_section, CharHeuristic, ContextBudget, ContextSection, SectionKind, TokenCounter,
};
use crate::state::{AgentState, StepStatus};

/// 目录中找不到模型时使用的窗口大小
pub const DEFAULT_CONTEXT_WINDOW: usize = 128_000;
pub const DEFAULT_MAX_OUTPUT: usize = 4_096;
/// 系统提示预留
pub const DEFAULT_SYSTEM_RESERVE: usize = 1_000;
/// 剩余预算不高于该值时不再放入可截断段落
pub const MIN_SECTION_TOKENS: usize = 100;

const MAX_PENDING: usize = 5;
const MAX_COMPLETED: usize = 5;
const MAX_VARIABLES: usize = 10;
const MAX_MEMORIES: usize = 5;
const STEP_OUTPUT_CHARS: usize = 300;
const VALUE_CHARS: usize = 200;
const UPSTREAM_CHARS: usize = 800;

/// 分配参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextSettings {
    pub reserved_for_system: usize,
    pub min_section_tokens: usize,
    pub default_context_window: usize,
    pub default_max_output: usize,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            reserved_for_system: DEFAULT_SYSTEM_RESERVE,
            min_section_tokens: MIN_SECTION_TOKENS,
            default_context_window: DEFAULT_CONTEXT_WINDOW,
            default_max_output: DEFAULT_MAX_OUTPUT,
        }
    }
}

/// 上下文占用概览（调试用）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextSummary {
    pub model_id: String,
    pub context_window: usize,
    pub available: usize,
    pub total_used: usize,
    pub remaining: usize,
    pub utilization_pct: f64,
    pub by_section: BTreeMap<String, usize>,
}

/// 上下文窗口管理器
#[derive(Clone)]
pub struct ContextWindowManager {
    directory: Arc<ModelDirectory>,
    counter: Arc<dyn TokenCounter>,
    settings: ContextSettings,
}

impl std::fmt::Debug for ContextWindowManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextWindowManager")
            .field("models", &self.directory.len())
            .field("settings", &self.settings)
            .finish()
    }
}

/// 按字符截取，超长时追加后缀
fn clip(text: &str, max_chars: usize, suffix: &str) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let mut s: String = text.chars().take(max_chars).collect();
        s.push_str(suffix);
        s
    }
}

fn value_to_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl ContextWindowManager {
    pub fn new(directory: Arc<ModelDirectory>) -> Self {
        Self {
            directory,
            counter: Arc::new(CharHeuristic),
            settings: ContextSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: ContextSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_counter(mut self, counter: Arc<dyn TokenCounter>) -> Self {
        self.counter = counter;
        self
    }

    pub fn directory(&self) -> &ModelDirectory {
        &self.directory
    }

    pub fn counter(&self) -> &dyn TokenCounter {
        self.counter.as_ref()
    }

    /// 目标模型的预算；未知模型使用默认窗口
    pub fn budget_for(&self, model_id: &str) -> ContextBudget {
        let (window, max_output) = match self.directory.get(model_id) {
            Some(spec) => (spec.context_window as usize, spec.max_output as usize),
            None => {
                debug!(model_id, "Model not in directory, using default context window");
                (
                    self.settings.default_context_window,
                    self.settings.default_max_output,
                )
            }
        };
        ContextBudget::new(window, max_output, self.settings.reserved_for_system)
    }

    /// 为目标模型生成裁剪后的上下文文本
    pub fn prepare_context(
        &self,
        state: &AgentState,
        model_id: &str,
        memories: Option<&[String]>,
        long_lived_context: Option<&str>,
    ) -> String {
        let budget = self.budget_for(model_id);
        let sections = self.build_sections(state, memories, long_lived_context);
        let fitted = self.fit_to_budget(sections, &budget);
        self.format_context(fitted)
    }

    /// 从状态构建各段落
    pub fn build_sections(
        &self,
        state: &AgentState,
        memories: Option<&[String]>,
        long_lived_context: Option<&str>,
    ) -> Vec<ContextSection> {
        let counter = self.counter.as_ref();
        let mut sections = Vec::new();

        let mut goal = format!("## Current Goal\n{}\n", state.current_goal);
        if !state.original_prompt.is_empty() {
            goal.push_str(&format!("\n### Original Request\n{}\n", state.original_prompt));
        }
        sections.push(ContextSection::new(SectionKind::Goal, goal, counter));

        if !state.pending_steps.is_empty() {
            let mut pending = String::from("## Next Steps\n");
            for step in state.pending_steps.iter().take(MAX_PENDING) {
                pending.push_str(&format!("- [ ] {}\n", step.description));
            }
            sections.push(ContextSection::new(SectionKind::Pending, pending, counter));
        }

        if !state.completed_steps.is_empty() {
            let mut progress = String::from("## Recent Progress\n");
            let skip = state.completed_steps.len().saturating_sub(MAX_COMPLETED);
            for step in state.completed_steps.iter().skip(skip) {
                let mark = if step.status == StepStatus::Completed {
                    "✓"
                } else {
                    "✗"
                };
                progress.push_str(&format!("- {} {}\n", mark, step.description));
                if let Some(tool) = &step.tool_used {
                    progress.push_str(&format!("  Tool: {}\n", tool));
                }
                if let Some(output) = &step.tool_output {
                    progress.push_str(&format!(
                        "  Result: {}\n",
                        clip(output, STEP_OUTPUT_CHARS, "... [truncated]")
                    ));
                }
                if let Some(error) = &step.error {
                    progress.push_str(&format!("  Error: {}\n", clip(error, VALUE_CHARS, "...")));
                }
            }
            sections.push(ContextSection::new(SectionKind::Completed, progress, counter));
        }

        if !state.variables.is_empty() {
            let mut vars = String::from("## Working Memory\n");
            for (key, value) in state.variables.iter().take(MAX_VARIABLES) {
                vars.push_str(&format!(
                    "- **{}**: {}\n",
                    key,
                    clip(&value_to_text(value), VALUE_CHARS, "")
                ));
            }
            sections.push(ContextSection::new(SectionKind::Variables, vars, counter));
        }

        if let Some(memories) = memories.filter(|m| !m.is_empty()) {
            let mut recalled = String::from("## Relevant Past Experiences\n");
            for memory in memories.iter().take(MAX_MEMORIES) {
                recalled.push_str(&format!("- {}\n", clip(memory, VALUE_CHARS, "")));
            }
            sections.push(ContextSection::new(SectionKind::Memories, recalled, counter));
        }

        if !state.upstream_context.is_empty() {
            let mut upstream = String::from("## Context from Previous Agents\n");
            for (agent, context) in &state.upstream_context {
                upstream.push_str(&format!(
                    "### From {}\n{}\n\n",
                    agent,
                    clip(context, UPSTREAM_CHARS, "...")
                ));
            }
            sections.push(ContextSection::new(SectionKind::Upstream, upstream, counter));
        }

        if let Some(ctx) = long_lived_context.filter(|c| !c.trim().is_empty()) {
            sections.push(ContextSection::new(
                SectionKind::Telos,
                format!("## User Context\n{}\n", ctx),
                counter,
            ));
        }

        sections
    }

    /// 按优先级把段落装入预算
    ///
    /// 先放不可截断段落（超出时截断到剩余预算），再按优先级放可截断段落：整段放得下就整段放，
    /// 剩余预算大于 min_section_tokens 时截断后放入，否则丢弃。
    pub fn fit_to_budget(
        &self,
        mut sections: Vec<ContextSection>,
        budget: &ContextBudget,
    ) -> Vec<ContextSection> {
        let counter = self.counter.as_ref();
        let mut available = budget.available();
        sections.sort_by_key(|s| s.priority());

        let (required, optional): (Vec<_>, Vec<_>) =
            sections.into_iter().partition(|s| !s.truncatable());
        let mut fitted = Vec::with_capacity(required.len() + optional.len());

        for section in required {
            let section = if section.tokens <= available {
                section
            } else {
                debug!(
                    section = section.name(),
                    tokens = section.tokens,
                    available,
                    "Truncating required context section"
                );
                truncate_section(&section, available, counter)
            };
            available = available.saturating_sub(section.tokens);
            fitted.push(section);
        }

        for section in optional {
            if section.tokens <= available {
                available -= section.tokens;
                fitted.push(section);
            } else if available > self.settings.min_section_tokens {
                let truncated = truncate_section(&section, available, counter);
                debug!(
                    section = truncated.name(),
                    from = section.tokens,
                    to = truncated.tokens,
                    "Truncated context section"
                );
                available = available.saturating_sub(truncated.tokens);
                fitted.push(truncated);
            } else {
                debug!(
                    section = section.name(),
                    tokens = section.tokens,
                    available,
                    "Dropped context section"
                );
            }
        }

        fitted
    }

    /// 固定顺序拼接：goal, pending, completed, variables, memories, upstream, telos
    pub fn format_context(&self, mut sections: Vec<ContextSection>) -> String {
        sections.sort_by_key(|s| s.kind.display_rank());
        sections
            .iter()
            .map(|s| s.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// 各段落 token 占用与剩余容量
    pub fn context_summary(&self, state: &AgentState, model_id: &str) -> ContextSummary {
        let budget = self.budget_for(model_id);
        let sections = self.build_sections(state, None, None);
        let total_used: usize = sections.iter().map(|s| s.tokens).sum();
        let by_section = sections
            .iter()
            .map(|s| (s.name().to_string(), s.tokens))
            .collect();
        let utilization_pct = if budget.total_tokens == 0 {
            0.0
        } else {
            total_used as f64 / budget.total_tokens as f64 * 100.0
        };
        ContextSummary {
            model_id: model_id.to_string(),
            context_window: budget.total_tokens,
            available: budget.available(),
            total_used,
            remaining: budget.total_tokens.saturating_sub(total_used),
            utilization_pct,
            by_section,
        }
    }
}
