//! 计划依赖图
//!
//! 使用邻接表和入度表实现 DAG 拓扑排序（Kahn）；同批就绪的步骤按 (order, 声明位置) 排序。

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::workflow::types::{ExecutionPlan, PlanError, StepId};

/// 就绪队列的排序键
pub type SortKey = (u32, usize);

/// 计划依赖图
#[derive(Debug, Clone)]
pub struct PlanGraph {
    /// 邻接表：步骤 ID -> 依赖它的步骤
    pub adjacency: HashMap<StepId, Vec<StepId>>,
    /// 入度表：步骤 ID -> 未完成的依赖数
    pub in_degree: HashMap<StepId, usize>,
    /// 构建时的入度表，拓扑排序只读它
    initial_in_degree: HashMap<StepId, usize>,
    dependencies: HashMap<StepId, Vec<StepId>>,
    sort_keys: HashMap<StepId, SortKey>,
}

impl PlanGraph {
    /// 构建依赖图并校验：ID 唯一、依赖存在、无环
    pub fn new(plan: &ExecutionPlan) -> Result<Self, PlanError> {
        let mut adjacency: HashMap<StepId, Vec<StepId>> = HashMap::new();
        let mut in_degree: HashMap<StepId, usize> = HashMap::new();
        let mut dependencies: HashMap<StepId, Vec<StepId>> = HashMap::new();
        let mut sort_keys: HashMap<StepId, SortKey> = HashMap::new();

        for (idx, step) in plan.steps.iter().enumerate() {
            if sort_keys.insert(step.id.clone(), (step.order, idx)).is_some() {
                return Err(PlanError::DuplicateStep(step.id.clone()));
            }
            adjacency.insert(step.id.clone(), Vec::new());
            in_degree.insert(step.id.clone(), 0);
        }

        for step in &plan.steps {
            let mut seen = HashSet::new();
            let mut deps = Vec::new();
            for dep in &step.depends_on {
                if !sort_keys.contains_key(dep) {
                    return Err(PlanError::UnknownDependency {
                        step: step.id.clone(),
                        dependency: dep.clone(),
                    });
                }
                if seen.insert(dep.clone()) {
                    adjacency.entry(dep.clone()).or_default().push(step.id.clone());
                    *in_degree.entry(step.id.clone()).or_insert(0) += 1;
                    deps.push(dep.clone());
                }
            }
            dependencies.insert(step.id.clone(), deps);
        }

        let graph = Self {
            adjacency,
            initial_in_degree: in_degree.clone(),
            in_degree,
            dependencies,
            sort_keys,
        };
        graph.topological_order()?;
        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.sort_keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sort_keys.is_empty()
    }

    pub fn sort_key(&self, step_id: &str) -> Option<SortKey> {
        self.sort_keys.get(step_id).copied()
    }

    fn keyed(&self, ids: impl IntoIterator<Item = StepId>) -> Vec<StepId> {
        let mut keyed: Vec<(SortKey, StepId)> = ids
            .into_iter()
            .map(|id| (self.sort_keys.get(&id).copied().unwrap_or((u32::MAX, usize::MAX)), id))
            .collect();
        keyed.sort();
        keyed.into_iter().map(|(_, id)| id).collect()
    }

    /// 拓扑序（与派发进度无关）；存在环时返回环上（及被环阻塞）的步骤
    pub fn topological_order(&self) -> Result<Vec<StepId>, PlanError> {
        let mut degree = self.initial_in_degree.clone();
        let mut ready: BTreeSet<(SortKey, StepId)> = degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .filter_map(|(id, _)| self.sort_key(id).map(|k| (k, id.clone())))
            .collect();
        let mut order = Vec::with_capacity(self.len());

        while let Some((_, id)) = ready.pop_first() {
            for dependent in self.dependents(&id) {
                if let Some(d) = degree.get_mut(dependent) {
                    *d = d.saturating_sub(1);
                    if *d == 0 {
                        if let Some(key) = self.sort_key(dependent) {
                            ready.insert((key, dependent.clone()));
                        }
                    }
                }
            }
            order.push(id);
        }

        if order.len() < self.len() {
            let done: HashSet<&StepId> = order.iter().collect();
            let stuck = self
                .sort_keys
                .keys()
                .filter(|id| !done.contains(id))
                .cloned();
            return Err(PlanError::CyclicDependency(self.keyed(stuck)));
        }
        Ok(order)
    }

    /// 当前入度为 0 的步骤（已排序）
    pub fn initial_ready(&self) -> Vec<StepId> {
        self.keyed(
            self.in_degree
                .iter()
                .filter(|(_, d)| **d == 0)
                .map(|(id, _)| id.clone()),
        )
    }

    pub fn dependencies(&self, step_id: &str) -> &[StepId] {
        self.dependencies
            .get(step_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn dependents(&self, step_id: &str) -> &[StepId] {
        self.adjacency
            .get(step_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// 没有下游的步骤（已排序）
    pub fn sinks(&self) -> Vec<StepId> {
        self.keyed(
            self.adjacency
                .iter()
                .filter(|(_, deps)| deps.is_empty())
                .map(|(id, _)| id.clone()),
        )
    }

    /// 步骤成功完成，返回新变为就绪的步骤
    pub fn mark_completed(&mut self, step_id: &str) -> Vec<StepId> {
        let mut newly_ready = Vec::new();
        let dependents = self.adjacency.get(step_id).cloned().unwrap_or_default();
        for dependent in dependents {
            if let Some(degree) = self.in_degree.get_mut(&dependent) {
                *degree = degree.saturating_sub(1);
                if *degree == 0 {
                    newly_ready.push(dependent);
                }
            }
        }
        self.keyed(newly_ready)
    }

    pub fn is_ready(&self, step_id: &str) -> bool {
        self.in_degree.get(step_id) == Some(&0)
    }
}
