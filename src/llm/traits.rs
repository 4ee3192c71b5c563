//! 单步执行能力抽象
//!
//! Dispatcher 只依赖 StepRunner：给定角色、目标、上下文、约束与模型 ID，返回文本或分类后的 CallError。
//! 具体后端（各家 LLM、CrewAI 风格的 Agent 封装、Mock）由调用方注入，可按模型 ID 分别替换。

use async_trait::async_trait;
use serde::Serialize;

use crate::core::CallError;

/// 一次单步调用的完整输入
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepRequest {
    pub step_id: String,
    pub agent_role: String,
    /// 步骤描述，即 Agent 的目标
    pub goal: String,
    pub context: Option<String>,
    pub constraints: Vec<String>,
    pub model_id: String,
}

impl StepRequest {
    /// 给 Agent 的背景设定（角色 + 约束）
    pub fn backstory(&self) -> String {
        let mut s = format!(
            "You are the {} in the Legion, a team of AI agents.",
            self.agent_role
        );
        if !self.constraints.is_empty() {
            s.push_str(&format!(
                "\n\nConstraints to follow: {}",
                self.constraints.join(", ")
            ));
        }
        s
    }

    /// 任务描述：有上下文时拼为 Context / Task 两段
    pub fn task_description(&self) -> String {
        match &self.context {
            Some(ctx) => format!("Context:\n{}\n\nTask:\n{}", ctx, self.goal),
            None => self.goal.clone(),
        }
    }
}

/// 单步执行能力：一次调用一个模型，失败时返回分类后的错误
#[async_trait]
pub trait StepRunner: Send + Sync {
    async fn run_step(&self, request: &StepRequest) -> Result<String, CallError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(context: Option<&str>, constraints: &[&str]) -> StepRequest {
        StepRequest {
            step_id: "s1".to_string(),
            agent_role: "Researcher".to_string(),
            goal: "Find sources".to_string(),
            context: context.map(str::to_string),
            constraints: constraints.iter().map(|c| c.to_string()).collect(),
            model_id: "gpt-4o".to_string(),
        }
    }

    #[test]
    fn test_task_description_with_context() {
        let req = request(Some("prior output"), &[]);
        assert_eq!(
            req.task_description(),
            "Context:\nprior output\n\nTask:\nFind sources"
        );
        assert_eq!(request(None, &[]).task_description(), "Find sources");
    }

    #[test]
    fn test_backstory_lists_constraints() {
        let req = request(None, &["no web access", "cite sources"]);
        let backstory = req.backstory();
        assert!(backstory.contains("Researcher"));
        assert!(backstory.contains("no web access, cite sources"));
    }
}
