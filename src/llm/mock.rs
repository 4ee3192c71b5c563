//! Mock 单步执行器（用于测试与本地演示，无需 API）
//!
//! 回显角色、模型与任务描述，便于本地跑通整条 Plan。

use async_trait::async_trait;

use crate::core::CallError;
use crate::llm::{StepRequest, StepRunner};

/// Mock 执行器：回显请求内容
#[derive(Debug, Default, Clone, Copy)]
pub struct MockStepRunner;

#[async_trait]
impl StepRunner for MockStepRunner {
    async fn run_step(&self, request: &StepRequest) -> Result<String, CallError> {
        let context_note = match &request.context {
            Some(ctx) => format!(" (with {} chars of context)", ctx.chars().count()),
            None => String::new(),
        };
        Ok(format!(
            "[{} via {}] {}{}",
            request.agent_role, request.model_id, request.goal, context_note
        ))
    }
}
