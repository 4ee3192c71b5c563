//! 执行结果：每个步骤一条 StepResult，每次计划运行一条 PlanExecutionResult

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::workflow::types::{PlanStatus, StepId};

/// 单步派发结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchOutcome {
    Success,
    Failure,
    /// 依赖失败或被阻塞，步骤未执行
    Blocked,
    /// 计划超时，步骤未执行或被中断
    Timeout,
    /// 计划被取消，步骤未执行
    Cancelled,
}

impl DispatchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchOutcome::Success => "success",
            DispatchOutcome::Failure => "failure",
            DispatchOutcome::Blocked => "blocked",
            DispatchOutcome::Timeout => "timeout",
            DispatchOutcome::Cancelled => "cancelled",
        }
    }
}

/// 单个步骤的执行记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: StepId,
    pub agent_role: String,
    pub outcome: DispatchOutcome,
    pub output: Option<String>,
    pub error: Option<String>,
    pub duration_seconds: f64,
    /// 跨所有模型的调用次数
    pub attempts: u32,
    /// 最后一次调用使用的模型
    pub model_used: Option<String>,
}

impl StepResult {
    /// 未执行的步骤（blocked / timeout / cancelled）
    pub(crate) fn skipped(
        step_id: impl Into<StepId>,
        agent_role: impl Into<String>,
        outcome: DispatchOutcome,
        error: impl Into<String>,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            agent_role: agent_role.into(),
            outcome,
            output: None,
            error: Some(error.into()),
            duration_seconds: 0.0,
            attempts: 0,
            model_used: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == DispatchOutcome::Success
    }

    pub fn to_flat(&self) -> Value {
        json!({
            "step_id": self.step_id,
            "agent_role": self.agent_role,
            "result": self.outcome.as_str(),
            "output": self.output,
            "error": self.error,
            "duration_seconds": self.duration_seconds,
            "attempts": self.attempts,
            "model_used": self.model_used,
        })
    }
}

/// final_output 的来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalOutputSource {
    /// 来自 DAG 的汇点步骤
    Sink,
    /// 没有汇点完成，退回到执行顺序中最后一个输出
    LastCompleted,
}

/// 一次计划运行的聚合结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanExecutionResult {
    pub plan_id: String,
    /// 本次运行 ID（也是各 AgentState 的 workflow_id）
    pub run_id: String,
    pub status: PlanStatus,
    pub step_results: Vec<StepResult>,
    pub final_output: Option<String>,
    pub final_output_source: Option<FinalOutputSource>,
    pub total_duration_seconds: f64,
}

impl PlanExecutionResult {
    pub(crate) fn new(plan_id: impl Into<String>, run_id: impl Into<String>, status: PlanStatus) -> Self {
        Self {
            plan_id: plan_id.into(),
            run_id: run_id.into(),
            status,
            step_results: Vec::new(),
            final_output: None,
            final_output_source: None,
            total_duration_seconds: 0.0,
        }
    }

    pub fn success(&self) -> bool {
        self.status == PlanStatus::Completed
    }

    pub fn count(&self, outcome: DispatchOutcome) -> usize {
        self.step_results
            .iter()
            .filter(|r| r.outcome == outcome)
            .count()
    }

    pub fn succeeded(&self) -> usize {
        self.count(DispatchOutcome::Success)
    }

    pub fn failed(&self) -> usize {
        self.count(DispatchOutcome::Failure)
    }

    pub fn blocked(&self) -> usize {
        self.count(DispatchOutcome::Blocked)
    }

    /// 计划完成但并非所有步骤都成功
    pub fn is_partial(&self) -> bool {
        self.success() && self.step_results.iter().any(|r| !r.is_success())
    }

    pub fn step(&self, step_id: &str) -> Option<&StepResult> {
        self.step_results.iter().find(|r| r.step_id == step_id)
    }

    /// 扁平 JSON 结构（供外部消费）
    pub fn to_flat(&self) -> Value {
        json!({
            "plan_id": self.plan_id,
            "run_id": self.run_id,
            "status": self.status.as_str(),
            "step_results": self.step_results.iter().map(StepResult::to_flat).collect::<Vec<_>>(),
            "final_output": self.final_output,
            "final_output_source": self.final_output_source,
            "total_duration_seconds": self.total_duration_seconds,
            "success": self.success(),
            "partial": self.is_partial(),
        })
    }
}
