//! 执行计划类型定义
//!
//! ExecutionPlan 由外部规划器生成，是一个步骤 DAG：每个步骤分配给一个 Agent 角色，
//! depends_on 描述依赖边。计划只由 Dispatcher 修改，步骤状态只能向前推进。

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::workflow::graph::PlanGraph;

pub type StepId = String;

/// 计划状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    /// 刚生成
    #[default]
    Draft,
    /// 已提交给用户审批
    Proposed,
    /// 用户已批准
    Approved,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl PlanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanStatus::Draft => "draft",
            PlanStatus::Proposed => "proposed",
            PlanStatus::Approved => "approved",
            PlanStatus::InProgress => "in_progress",
            PlanStatus::Completed => "completed",
            PlanStatus::Failed => "failed",
            PlanStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PlanStatus::Completed | PlanStatus::Failed | PlanStatus::Cancelled
        )
    }
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 步骤状态（blocked 为派生状态，不存储）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl StepState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepState::Pending => "pending",
            StepState::InProgress => "in_progress",
            StepState::Completed => "completed",
            StepState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StepState::Completed | StepState::Failed)
    }
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 计划错误（配置错误，不计为步骤失败）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("Step not found: {0}")]
    StepNotFound(StepId),

    #[error("Duplicate step id: {0}")]
    DuplicateStep(StepId),

    #[error("Step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: StepId, dependency: StepId },

    #[error("Cyclic dependency detected among steps: {}", .0.join(", "))]
    CyclicDependency(Vec<StepId>),

    #[error("Step '{step}' cannot move from {from} to {to}")]
    InvalidStepTransition {
        step: StepId,
        from: StepState,
        to: StepState,
    },

    #[error("Plan cannot move from {from} to {to}")]
    InvalidPlanTransition { from: PlanStatus, to: PlanStatus },

    #[error("Invalid plan configuration: {0}")]
    InvalidConfiguration(String),
}

/// 计划中的单个步骤
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: StepId,
    /// 仅用于展示与同批就绪步骤的先后
    #[serde(default)]
    pub order: u32,
    pub description: String,
    pub agent_role: String,
    #[serde(default)]
    pub capability_id: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<StepId>,
    #[serde(default)]
    pub status: StepState,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl PlanStep {
    pub fn new(
        id: impl Into<StepId>,
        agent_role: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            order: 0,
            description: description.into(),
            agent_role: agent_role.into(),
            capability_id: None,
            agent_id: None,
            depends_on: Vec::new(),
            status: StepState::Pending,
            output: None,
            error: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_order(mut self, order: u32) -> Self {
        self.order = order;
        self
    }

    pub fn depends_on(mut self, step_id: impl Into<StepId>) -> Self {
        self.depends_on.push(step_id.into());
        self
    }

    pub fn with_capability(mut self, capability_id: impl Into<String>) -> Self {
        self.capability_id = Some(capability_id.into());
        self
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    fn transition(&mut self, from: StepState, to: StepState) -> Result<(), PlanError> {
        if self.status != from {
            return Err(PlanError::InvalidStepTransition {
                step: self.id.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    pub(crate) fn begin(&mut self) -> Result<(), PlanError> {
        self.transition(StepState::Pending, StepState::InProgress)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    pub(crate) fn succeed(&mut self, output: String) -> Result<(), PlanError> {
        self.transition(StepState::InProgress, StepState::Completed)?;
        self.output = Some(output);
        self.error = None;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub(crate) fn fail(&mut self, error: String) -> Result<(), PlanError> {
        self.transition(StepState::InProgress, StepState::Failed)?;
        self.error = Some(error);
        self.output = None;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    fn status_icon(&self) -> &'static str {
        match self.status {
            StepState::Pending => "⏳",
            StepState::InProgress => "🔄",
            StepState::Completed => "✅",
            StepState::Failed => "❌",
        }
    }
}

fn default_true() -> bool {
    true
}

/// 执行计划
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub id: String,
    pub intent_summary: String,
    #[serde(default)]
    pub steps: Vec<PlanStep>,
    #[serde(default)]
    pub status: PlanStatus,
    #[serde(default)]
    pub context_files: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default = "default_true")]
    pub requires_approval: bool,
    #[serde(default)]
    pub approval_notes: Option<String>,
}

impl ExecutionPlan {
    pub fn new(intent_summary: impl Into<String>) -> Self {
        Self {
            id: format!("plan_{}", uuid::Uuid::new_v4()),
            intent_summary: intent_summary.into(),
            steps: Vec::new(),
            status: PlanStatus::Draft,
            context_files: Vec::new(),
            constraints: Vec::new(),
            created_at: Utc::now(),
            approved_at: None,
            completed_at: None,
            requires_approval: true,
            approval_notes: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_step(mut self, step: PlanStep) -> Self {
        self.steps.push(step);
        self
    }

    /// 校验依赖：ID 唯一、依赖存在、无环
    pub fn validate(&self) -> Result<(), PlanError> {
        PlanGraph::new(self).map(|_| ())
    }

    pub fn step(&self, step_id: &str) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub(crate) fn step_mut(&mut self, step_id: &str) -> Result<&mut PlanStep, PlanError> {
        self.steps
            .iter_mut()
            .find(|s| s.id == step_id)
            .ok_or_else(|| PlanError::StepNotFound(step_id.to_string()))
    }

    fn transition(&mut self, allowed: &[PlanStatus], to: PlanStatus) -> Result<(), PlanError> {
        if !allowed.contains(&self.status) {
            return Err(PlanError::InvalidPlanTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// draft -> proposed
    pub fn propose(&mut self) -> Result<(), PlanError> {
        self.validate()?;
        self.transition(&[PlanStatus::Draft], PlanStatus::Proposed)
    }

    /// proposed -> approved（外部审批）
    pub fn approve(&mut self, notes: Option<String>) -> Result<(), PlanError> {
        self.transition(&[PlanStatus::Proposed], PlanStatus::Approved)?;
        self.approved_at = Some(Utc::now());
        self.approval_notes = notes;
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<(), PlanError> {
        self.transition(
            &[
                PlanStatus::Draft,
                PlanStatus::Proposed,
                PlanStatus::Approved,
                PlanStatus::InProgress,
            ],
            PlanStatus::Cancelled,
        )?;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub(crate) fn start(&mut self) -> Result<(), PlanError> {
        self.transition(
            &[PlanStatus::Approved, PlanStatus::InProgress],
            PlanStatus::InProgress,
        )
    }

    pub(crate) fn finish(&mut self, status: PlanStatus) -> Result<(), PlanError> {
        self.transition(&[PlanStatus::InProgress], status)?;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn count_by_state(&self, state: StepState) -> usize {
        self.steps.iter().filter(|s| s.status == state).count()
    }

    /// 便于阅读的计划摘要
    pub fn to_display_string(&self) -> String {
        let mut lines = vec![
            format!("# Execution Plan: {}", self.intent_summary),
            format!("Status: {}", self.status),
            String::new(),
            "## Steps:".to_string(),
        ];

        let mut steps: Vec<&PlanStep> = self.steps.iter().collect();
        steps.sort_by_key(|s| s.order);
        for step in steps {
            let deps = if step.depends_on.is_empty() {
                String::new()
            } else {
                format!(" (after step {})", step.depends_on.join(", "))
            };
            lines.push(format!(
                "{} {}. [{}] {}{}",
                step.status_icon(),
                step.order,
                step.agent_role,
                step.description,
                deps
            ));
        }

        if !self.constraints.is_empty() {
            lines.push(String::new());
            lines.push(format!("Constraints: {}", self.constraints.join(", ")));
        }

        lines.join("\n")
    }
}
