//! Agent 状态结构
//!
//! 状态与模型解耦：同一个 AgentState 可以在换模型后继续使用，
//! 由上下文分配器按目标模型的窗口重新裁剪。
//!
//! - StepRecord：单步执行记录（工具调用、输出、耗时、token 与成本）
//! - AgentState：某一时刻 Agent 的完整状态，finalize 之后只读

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// 步骤状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

/// 状态操作错误
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("agent state '{0}' is finalized and can no longer change")]
    Finalized(String),

    #[error("step not found: {0}")]
    StepNotFound(String),

    #[error("duplicate step id: {0}")]
    DuplicateStep(String),

    #[error("state serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// 单步执行记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_id: String,
    pub description: String,
    #[serde(default)]
    pub status: StepStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tool_used: Option<String>,
    #[serde(default)]
    pub tool_input: Option<serde_json::Value>,
    #[serde(default)]
    pub tool_output: Option<String>,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub cost_usd: f64,
}

impl StepRecord {
    pub fn new(step_id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            description: description.into(),
            status: StepStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            tool_used: None,
            tool_input: None,
            tool_output: None,
            reasoning: None,
            error: None,
            retry_count: 0,
            tokens_used: 0,
            cost_usd: 0.0,
        }
    }

    /// 开始到结束的毫秒数；未开始或未结束时为 None
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Completed
    }
}

/// 完成一个步骤时附带的结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepCompletion {
    pub tool_used: Option<String>,
    pub tool_input: Option<serde_json::Value>,
    pub output: Option<String>,
    pub reasoning: Option<String>,
    pub tokens_used: u64,
    pub cost_usd: f64,
}

impl StepCompletion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn with_tool(mut self, tool: impl Into<String>, input: Option<serde_json::Value>) -> Self {
        self.tool_used = Some(tool.into());
        self.tool_input = input;
        self
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }

    pub fn with_usage(mut self, tokens_used: u64, cost_usd: f64) -> Self {
        self.tokens_used = tokens_used;
        self.cost_usd = cost_usd;
        self
    }
}

/// 错误历史条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub step_id: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

fn default_max_retries() -> u32 {
    3
}

/// Agent 的完整状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub agent_id: String,
    pub workflow_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub role: String,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(default)]
    pub current_goal: String,
    #[serde(default)]
    pub original_prompt: String,
    #[serde(default)]
    pub completed_steps: Vec<StepRecord>,
    #[serde(default)]
    pub pending_steps: Vec<StepRecord>,

    /// 工作记忆
    #[serde(default)]
    pub variables: BTreeMap<String, serde_json::Value>,
    /// 工具结果缓存，键为调用哈希
    #[serde(default)]
    pub tool_results_cache: BTreeMap<String, String>,
    /// 上游 Agent 名称 -> 其输出
    #[serde(default)]
    pub upstream_context: BTreeMap<String, String>,

    #[serde(default)]
    pub error_history: Vec<ErrorRecord>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default)]
    pub model_used: Option<String>,
    #[serde(default)]
    pub total_tokens_used: u64,
    #[serde(default)]
    pub total_cost_usd: f64,

    #[serde(default)]
    pub final_output: Option<String>,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub finalized_at: Option<DateTime<Utc>>,
}

/// 参与内容哈希的字段（不含时间戳）
#[derive(Serialize)]
struct HashView<'a> {
    agent_id: &'a str,
    current_goal: &'a str,
    original_prompt: &'a str,
    completed_steps: Vec<(&'a str, StepStatus)>,
    pending_steps: Vec<&'a str>,
    variables: &'a BTreeMap<String, serde_json::Value>,
    upstream_context: &'a BTreeMap<String, String>,
    final_output: Option<&'a str>,
    success: bool,
}

impl AgentState {
    pub fn new(agent_id: impl Into<String>, workflow_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            agent_id: agent_id.into(),
            workflow_id: workflow_id.into(),
            name: String::new(),
            role: String::new(),
            created_at: now,
            updated_at: now,
            current_goal: String::new(),
            original_prompt: String::new(),
            completed_steps: Vec::new(),
            pending_steps: Vec::new(),
            variables: BTreeMap::new(),
            tool_results_cache: BTreeMap::new(),
            upstream_context: BTreeMap::new(),
            error_history: Vec::new(),
            retry_count: 0,
            max_retries: default_max_retries(),
            model_used: None,
            total_tokens_used: 0,
            total_cost_usd: 0.0,
            final_output: None,
            success: false,
            finalized_at: None,
        }
    }

    pub fn with_role(mut self, name: impl Into<String>, role: impl Into<String>) -> Self {
        self.name = name.into();
        self.role = role.into();
        self
    }

    pub fn with_goal(mut self, goal: impl Into<String>, original_prompt: impl Into<String>) -> Self {
        self.current_goal = goal.into();
        self.original_prompt = original_prompt.into();
        self
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized_at.is_some()
    }

    fn ensure_mutable(&self) -> Result<(), StateError> {
        if self.is_finalized() {
            return Err(StateError::Finalized(self.agent_id.clone()));
        }
        Ok(())
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn set_goal(&mut self, goal: impl Into<String>) -> Result<(), StateError> {
        self.ensure_mutable()?;
        self.current_goal = goal.into();
        self.touch();
        Ok(())
    }

    pub fn set_model_used(&mut self, model_id: impl Into<String>) -> Result<(), StateError> {
        self.ensure_mutable()?;
        self.model_used = Some(model_id.into());
        self.touch();
        Ok(())
    }

    fn has_step(&self, step_id: &str) -> bool {
        self.pending_steps
            .iter()
            .chain(self.completed_steps.iter())
            .any(|s| s.step_id == step_id)
    }

    /// 追加待办步骤，ID 为 `{agent_id}-step-{n}`
    pub fn add_step(&mut self, description: impl Into<String>) -> Result<String, StateError> {
        let n = self.completed_steps.len() + self.pending_steps.len() + 1;
        let step_id = format!("{}-step-{}", self.agent_id, n);
        self.add_step_with_id(step_id.clone(), description)?;
        Ok(step_id)
    }

    /// 以外部给定的 ID 追加待办步骤（例如计划中的步骤 ID）
    pub fn add_step_with_id(
        &mut self,
        step_id: impl Into<String>,
        description: impl Into<String>,
    ) -> Result<(), StateError> {
        self.ensure_mutable()?;
        let step_id = step_id.into();
        if self.has_step(&step_id) {
            return Err(StateError::DuplicateStep(step_id));
        }
        self.pending_steps.push(StepRecord::new(step_id, description));
        self.touch();
        Ok(())
    }

    fn pending_index(&self, step_id: &str) -> Result<usize, StateError> {
        self.pending_steps
            .iter()
            .position(|s| s.step_id == step_id)
            .ok_or_else(|| StateError::StepNotFound(step_id.to_string()))
    }

    pub fn start_step(&mut self, step_id: &str) -> Result<(), StateError> {
        self.ensure_mutable()?;
        let idx = self.pending_index(step_id)?;
        let step = &mut self.pending_steps[idx];
        step.status = StepStatus::InProgress;
        step.started_at = Some(Utc::now());
        self.touch();
        Ok(())
    }

    /// 完成步骤：移入 completed_steps 并累计 token / 成本
    pub fn complete_step(
        &mut self,
        step_id: &str,
        completion: StepCompletion,
    ) -> Result<&StepRecord, StateError> {
        self.ensure_mutable()?;
        let idx = self.pending_index(step_id)?;
        let mut step = self.pending_steps.remove(idx);
        step.status = StepStatus::Completed;
        step.completed_at = Some(Utc::now());
        step.tool_used = completion.tool_used;
        step.tool_input = completion.tool_input;
        step.tool_output = completion.output;
        step.reasoning = completion.reasoning;
        step.tokens_used = completion.tokens_used;
        step.cost_usd = completion.cost_usd;

        self.total_tokens_used += completion.tokens_used;
        self.total_cost_usd += completion.cost_usd;
        self.completed_steps.push(step);
        self.touch();
        Ok(&self.completed_steps[self.completed_steps.len() - 1])
    }

    /// 步骤失败：标记 Failed 后移入 completed_steps，并记入错误历史
    pub fn fail_step(&mut self, step_id: &str, error: impl Into<String>) -> Result<(), StateError> {
        self.ensure_mutable()?;
        let idx = self.pending_index(step_id)?;
        let error = error.into();
        let now = Utc::now();
        let mut step = self.pending_steps.remove(idx);
        step.status = StepStatus::Failed;
        step.error = Some(error.clone());
        step.completed_at = Some(now);
        self.completed_steps.push(step);
        self.error_history.push(ErrorRecord {
            step_id: step_id.to_string(),
            error,
            timestamp: now,
        });
        self.touch();
        Ok(())
    }

    /// 记录一次重试（计入 Agent 与对应待办步骤）
    pub fn record_retry(&mut self, step_id: &str) -> Result<(), StateError> {
        self.ensure_mutable()?;
        let idx = self.pending_index(step_id)?;
        self.pending_steps[idx].retry_count += 1;
        self.retry_count += 1;
        self.touch();
        Ok(())
    }

    pub fn set_variable(
        &mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Result<(), StateError> {
        self.ensure_mutable()?;
        self.variables.insert(key.into(), value.into());
        self.touch();
        Ok(())
    }

    pub fn get_variable(&self, key: &str) -> Option<&serde_json::Value> {
        self.variables.get(key)
    }

    pub fn cache_tool_result(
        &mut self,
        call_hash: impl Into<String>,
        result: impl Into<String>,
    ) -> Result<(), StateError> {
        self.ensure_mutable()?;
        self.tool_results_cache.insert(call_hash.into(), result.into());
        self.touch();
        Ok(())
    }

    pub fn get_cached_result(&self, call_hash: &str) -> Option<&str> {
        self.tool_results_cache.get(call_hash).map(String::as_str)
    }

    pub fn set_upstream(
        &mut self,
        agent_name: impl Into<String>,
        context: impl Into<String>,
    ) -> Result<(), StateError> {
        self.ensure_mutable()?;
        self.upstream_context.insert(agent_name.into(), context.into());
        self.touch();
        Ok(())
    }

    /// 清空上游上下文，只保留当前步骤的依赖输出
    pub fn clear_upstream(&mut self) -> Result<(), StateError> {
        self.ensure_mutable()?;
        self.upstream_context.clear();
        self.touch();
        Ok(())
    }

    /// 写入最终结果；之后状态只读
    pub fn finalize(&mut self, success: bool, output: Option<String>) -> Result<(), StateError> {
        self.ensure_mutable()?;
        self.success = success;
        self.final_output = output;
        self.finalized_at = Some(Utc::now());
        self.touch();
        Ok(())
    }

    /// 内容哈希（sha256 前 16 位十六进制），只覆盖可变的业务字段，不含时间戳
    pub fn state_hash(&self) -> String {
        let view = HashView {
            agent_id: &self.agent_id,
            current_goal: &self.current_goal,
            original_prompt: &self.original_prompt,
            completed_steps: self
                .completed_steps
                .iter()
                .map(|s| (s.step_id.as_str(), s.status))
                .collect(),
            pending_steps: self.pending_steps.iter().map(|s| s.step_id.as_str()).collect(),
            variables: &self.variables,
            upstream_context: &self.upstream_context,
            final_output: self.final_output.as_deref(),
            success: self.success,
        };
        let bytes = serde_json::to_vec(&view).unwrap_or_default();
        let digest = hex::encode(Sha256::digest(&bytes));
        digest[..16].to_string()
    }

    pub fn to_json(&self) -> Result<String, StateError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(data: &str) -> Result<Self, StateError> {
        Ok(serde_json::from_str(data)?)
    }

    /// 一行摘要
    pub fn summary(&self) -> String {
        let status = if self.success {
            "✓ Complete"
        } else if self.is_finalized() {
            "✗ Failed"
        } else if !self.pending_steps.is_empty() {
            "In Progress"
        } else {
            "Idle"
        };
        format!(
            "[{}] {} | {} done, {} pending | {} tokens | ${:.4}",
            self.agent_id,
            status,
            self.completed_steps.len(),
            self.pending_steps.len(),
            self.total_tokens_used,
            self.total_cost_usd
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> AgentState {
        AgentState::new("researcher", "run-1")
            .with_role("Researcher", "Researcher")
            .with_goal("Summarize the market", "Write me a market report")
    }

    #[test]
    fn test_step_lifecycle() {
        let mut state = sample();
        let id = state.add_step("collect sources").unwrap();
        assert_eq!(id, "researcher-step-1");
        state.start_step(&id).unwrap();
        assert_eq!(state.pending_steps[0].status, StepStatus::InProgress);

        let done = state
            .complete_step(&id, StepCompletion::new().with_output("3 sources").with_usage(120, 0.01))
            .unwrap();
        assert!(done.is_success());
        assert!(done.duration_ms().is_some());
        assert!(state.pending_steps.is_empty());
        assert_eq!(state.total_tokens_used, 120);
        assert_eq!(state.add_step("next").unwrap(), "researcher-step-2");
    }

    #[test]
    fn test_fail_step_moves_and_records_error() {
        let mut state = sample();
        state.add_step_with_id("s1", "fetch").unwrap();
        state.fail_step("s1", "HTTP 500").unwrap();
        assert!(state.pending_steps.is_empty());
        assert_eq!(state.completed_steps[0].status, StepStatus::Failed);
        assert_eq!(state.error_history.len(), 1);
        assert_eq!(state.error_history[0].error, "HTTP 500");
        assert!(matches!(
            state.fail_step("s1", "again"),
            Err(StateError::StepNotFound(_))
        ));
    }

    #[test]
    fn test_duplicate_step_rejected() {
        let mut state = sample();
        state.add_step_with_id("s1", "a").unwrap();
        assert!(matches!(
            state.add_step_with_id("s1", "b"),
            Err(StateError::DuplicateStep(_))
        ));
    }

    #[test]
    fn test_finalized_state_is_read_only() {
        let mut state = sample();
        state.finalize(true, Some("done".into())).unwrap();
        assert!(state.success);
        assert!(matches!(
            state.set_variable("k", "v"),
            Err(StateError::Finalized(_))
        ));
        assert!(state.add_step("late").is_err());
        assert!(state.finalize(false, None).is_err());
        assert!(state.success);
    }

    #[test]
    fn test_hash_tracks_content_not_time() {
        let mut state = sample();
        let h1 = state.state_hash();
        assert_eq!(h1.len(), 16);
        state.touch();
        assert_eq!(state.state_hash(), h1);
        state.set_variable("topic", "EV batteries").unwrap();
        assert_ne!(state.state_hash(), h1);
    }

    #[test]
    fn test_variables_and_cache() {
        let mut state = sample();
        state.set_variable("count", 3).unwrap();
        assert_eq!(state.get_variable("count"), Some(&serde_json::json!(3)));
        assert!(state.get_variable("missing").is_none());
        state.cache_tool_result("abc", "cached").unwrap();
        assert_eq!(state.get_cached_result("abc"), Some("cached"));
    }

    #[test]
    fn test_json_round_trip() {
        let mut state = sample();
        for (id, desc) in [("s1", "outline"), ("s2", "draft"), ("s3", "polish"), ("s4", "publish")] {
            state.add_step_with_id(id, desc).unwrap();
        }
        state.start_step("s2").unwrap();
        state.record_retry("s2").unwrap();
        state
            .complete_step("s2", StepCompletion::new().with_output("draft text").with_usage(900, 0.01))
            .unwrap();
        state.fail_step("s1", "model refused").unwrap();
        state
            .complete_step(
                "s3",
                StepCompletion::new()
                    .with_tool("style_check", Some(serde_json::json!({"strict": true})))
                    .with_reasoning("tighten verbs")
                    .with_output("polished")
                    .with_usage(300, 0.0025),
            )
            .unwrap();
        state.set_upstream("Planner", "outline").unwrap();
        state.set_variable("nested", serde_json::json!({"a": [1, 2]})).unwrap();
        state.cache_tool_result("h1", "cached").unwrap();
        state.set_model_used("m1").unwrap();

        let json = state.to_json().unwrap();
        let back = AgentState::from_json(&json).unwrap();
        assert_eq!(back, state);
        let order: Vec<&str> = back.completed_steps.iter().map(|s| s.step_id.as_str()).collect();
        assert_eq!(order, vec!["s2", "s1", "s3"]);
        assert_eq!(back.error_history.len(), 1);
        assert_eq!(back.error_history[0].step_id, "s1");
        assert_eq!(back.pending_steps[0].step_id, "s4");
        assert_eq!(back.state_hash(), state.state_hash());
    }

    #[test]
    fn test_clear_upstream() {
        let mut state = sample();
        state.set_upstream("Planner", "outline").unwrap();
        state.clear_upstream().unwrap();
        assert!(state.upstream_context.is_empty());
        state.finalize(true, None).unwrap();
        assert!(state.clear_upstream().is_err());
    }

    #[test]
    fn test_from_json_applies_defaults() {
        let now = Utc::now().to_rfc3339();
        let json = format!(
            r#"{{"agent_id":"a","workflow_id":"w","created_at":"{now}","updated_at":"{now}"}}"#
        );
        let state = AgentState::from_json(&json).unwrap();
        assert_eq!(state.max_retries, 3);
        assert!(state.completed_steps.is_empty());
        assert!(!state.is_finalized());
    }

    #[test]
    fn test_summary() {
        let mut state = sample();
        state.add_step("x").unwrap();
        assert!(state.summary().starts_with("[researcher] In Progress | 0 done, 1 pending"));
    }
}
