//! 派发事件：通过可选的 mpsc 通道向外部报告计划进度

use serde::Serialize;

use crate::workflow::result::DispatchOutcome;
use crate::workflow::types::{PlanStatus, StepId};

/// 派发过程中的进度事件
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DispatchEvent {
    PlanStarted {
        plan_id: String,
        run_id: String,
        total_steps: usize,
    },
    StepStarted {
        step_id: StepId,
        agent_role: String,
        model: String,
    },
    StepRetry {
        step_id: StepId,
        model: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    ModelFallback {
        step_id: StepId,
        from: String,
        to: String,
    },
    StepFinished {
        step_id: StepId,
        outcome: DispatchOutcome,
        duration_seconds: f64,
    },
    PlanFinished {
        plan_id: String,
        status: PlanStatus,
        total_duration_seconds: f64,
    },
}

impl DispatchEvent {
    pub fn step_id(&self) -> Option<&str> {
        match self {
            DispatchEvent::StepStarted { step_id, .. }
            | DispatchEvent::StepRetry { step_id, .. }
            | DispatchEvent::ModelFallback { step_id, .. }
            | DispatchEvent::StepFinished { step_id, .. } => Some(step_id),
            DispatchEvent::PlanStarted { .. } | DispatchEvent::PlanFinished { .. } => None,
        }
    }
}
