//! 计划构建器
//!
//! 提供流畅的API来构建执行计划，build 时校验依赖

use crate::workflow::types::*;

/// 计划构建器
pub struct PlanBuilder {
    id: Option<String>,
    intent_summary: String,
    steps: Vec<PlanStep>,
    constraints: Vec<String>,
    context_files: Vec<String>,
    requires_approval: bool,
}

impl PlanBuilder {
    /// 创建新的计划构建器
    pub fn new(intent_summary: impl Into<String>) -> Self {
        Self {
            id: None,
            intent_summary: intent_summary.into(),
            steps: Vec::new(),
            constraints: Vec::new(),
            context_files: Vec::new(),
            requires_approval: true,
        }
    }

    /// 指定计划ID（默认随机生成）
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// 添加步骤，order 默认为声明位置（从 1 开始）
    pub fn step(
        mut self,
        id: impl Into<StepId>,
        agent_role: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        let order = self.steps.len() as u32 + 1;
        self.steps
            .push(PlanStep::new(id, agent_role, description).with_order(order));
        self
    }

    fn update(mut self, step_id: &str, f: impl FnOnce(&mut PlanStep)) -> Self {
        if let Some(step) = self.steps.iter_mut().find(|s| s.id == step_id) {
            f(step);
        }
        self
    }

    /// 设置依赖
    pub fn depends_on(self, step_id: &str, dependency: impl Into<StepId>) -> Self {
        let dependency = dependency.into();
        self.update(step_id, |s| s.depends_on.push(dependency))
    }

    pub fn order(self, step_id: &str, order: u32) -> Self {
        self.update(step_id, |s| s.order = order)
    }

    pub fn capability(self, step_id: &str, capability_id: impl Into<String>) -> Self {
        let capability_id = capability_id.into();
        self.update(step_id, |s| s.capability_id = Some(capability_id))
    }

    pub fn constraint(mut self, constraint: impl Into<String>) -> Self {
        self.constraints.push(constraint.into());
        self
    }

    pub fn context_file(mut self, path: impl Into<String>) -> Self {
        self.context_files.push(path.into());
        self
    }

    pub fn requires_approval(mut self, required: bool) -> Self {
        self.requires_approval = required;
        self
    }

    /// 构建计划（draft 状态）
    pub fn build(self) -> Result<ExecutionPlan, PlanError> {
        if self.steps.is_empty() {
            return Err(PlanError::InvalidConfiguration(
                "plan has no steps".to_string(),
            ));
        }

        let mut plan = ExecutionPlan::new(self.intent_summary);
        if let Some(id) = self.id {
            plan.id = id;
        }
        plan.steps = self.steps;
        plan.constraints = self.constraints;
        plan.context_files = self.context_files;
        plan.requires_approval = self.requires_approval;
        plan.validate()?;
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_simple_plan() {
        let plan = PlanBuilder::new("Write and edit a story")
            .id("p1")
            .step("draft", "Writer", "Write the draft")
            .step("edit", "Editor", "Edit the draft")
            .depends_on("edit", "draft")
            .capability("draft", "write_fiction")
            .constraint("under 2000 words")
            .requires_approval(false)
            .build()
            .expect("Failed to build plan");

        assert_eq!(plan.id, "p1");
        assert_eq!(plan.status, PlanStatus::Draft);
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[1].order, 2);
        assert_eq!(plan.steps[1].depends_on, vec!["draft"]);
        assert_eq!(plan.steps[0].capability_id.as_deref(), Some("write_fiction"));
        assert!(!plan.requires_approval);
    }

    #[test]
    fn test_build_without_steps_fails() {
        let result = PlanBuilder::new("Empty").build();
        assert!(matches!(result, Err(PlanError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_build_with_cycle_fails() {
        let result = PlanBuilder::new("Loop")
            .step("a", "Writer", "a")
            .step("b", "Editor", "b")
            .depends_on("a", "b")
            .depends_on("b", "a")
            .build();
        assert!(matches!(result, Err(PlanError::CyclicDependency(_))));
    }
}
