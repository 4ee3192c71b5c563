//! 计划派发引擎
//!
//! 按依赖顺序遍历执行计划：就绪队列（Kahn）驱动，最多 max_parallel_steps 个步骤并发；
//! 每个步骤按「主模型 + 有序备用模型」调用 StepRunner，单模型内退避重试；
//! 成功输出传给下游步骤，失败隔离，依赖失败的步骤记为 blocked。
//! 可选地把每个角色的执行过程写入 AgentState 并由 ContextWindowManager 生成步骤上下文。

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::capability::{CapabilityMetrics, NoopMetrics};
use crate::core::{CallError, RecoveryAction, RecoveryEngine};
use crate::llm::{RetryPolicy, StepRequest, StepRunner};
use crate::memory::{ContextWindowManager, LongTermMemory, NoopLongTerm};
use crate::state::{AgentState, StateError, StateStore, StepCompletion};
use crate::workflow::events::DispatchEvent;
use crate::workflow::graph::{PlanGraph, SortKey};
use crate::workflow::result::{DispatchOutcome, FinalOutputSource, PlanExecutionResult, StepResult};
use crate::workflow::types::{ExecutionPlan, PlanError, PlanStatus, StepId, StepState};

pub const DEFAULT_PRIMARY_MODEL: &str = "gemini-2.0-flash";
pub const DEFAULT_FALLBACK_MODEL: &str = "claude-sonnet-4-20250514";

/// 每个步骤召回的长期记忆条数
const MEMORY_RECALL_LIMIT: usize = 5;
/// 写入长期记忆时输出的截断长度
const MEMORY_OUTPUT_CHARS: usize = 500;

/// 派发配置
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchSettings {
    pub primary_model: String,
    /// 主模型重试耗尽后依次尝试
    pub fallback_models: Vec<String>,
    /// 角色 -> 主模型，覆盖 primary_model
    pub role_models: HashMap<String, String>,
    pub retry: RetryPolicy,
    /// 1 表示严格串行
    pub max_parallel_steps: usize,
    pub step_timeout: Option<Duration>,
    pub plan_timeout: Option<Duration>,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            primary_model: DEFAULT_PRIMARY_MODEL.to_string(),
            fallback_models: vec![DEFAULT_FALLBACK_MODEL.to_string()],
            role_models: HashMap::new(),
            retry: RetryPolicy::default(),
            max_parallel_steps: 1,
            step_timeout: None,
            plan_timeout: None,
        }
    }
}

impl DispatchSettings {
    /// 某角色的模型尝试顺序（去重，保持顺序）；角色名不区分大小写
    pub fn models_for(&self, agent_role: &str) -> Vec<String> {
        let primary = self
            .role_models
            .iter()
            .find(|(role, _)| role.eq_ignore_ascii_case(agent_role))
            .map(|(_, model)| model)
            .unwrap_or(&self.primary_model);
        let mut models: Vec<String> = Vec::with_capacity(1 + self.fallback_models.len());
        for model in std::iter::once(primary).chain(self.fallback_models.iter()) {
            if !model.is_empty() && !models.contains(model) {
                models.push(model.clone());
            }
        }
        models
    }
}

/// 把派发过程绑定到 Agent 状态：持久化 + 上下文预算
#[derive(Clone)]
pub struct StateBinding {
    pub store: Arc<dyn StateStore>,
    pub context: Arc<ContextWindowManager>,
    pub memory: Arc<dyn LongTermMemory>,
    /// 长期用户上下文（最低优先级段落）
    pub long_lived_context: Option<String>,
}

impl StateBinding {
    pub fn new(store: Arc<dyn StateStore>, context: Arc<ContextWindowManager>) -> Self {
        Self {
            store,
            context,
            memory: Arc::new(NoopLongTerm),
            long_lived_context: None,
        }
    }

    pub fn with_memory(mut self, memory: Arc<dyn LongTermMemory>) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_long_lived_context(mut self, context: impl Into<String>) -> Self {
        self.long_lived_context = Some(context.into());
        self
    }
}

/// 单个步骤跨所有模型的调用结果
struct StepRun {
    step_id: StepId,
    outcome: Result<String, CallError>,
    attempts: u32,
    model_used: Option<String>,
    duration: Duration,
}

/// 运行被提前终止的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Halt {
    Cancelled,
    TimedOut,
}

/// 一次运行中由调度循环独占的账本
struct RunLedger {
    run_id: String,
    result: PlanExecutionResult,
    /// 已完成步骤的输出
    outputs: HashMap<StepId, String>,
    /// 成功输出的先后顺序（含此前运行已完成的步骤）
    completion_order: Vec<StepId>,
    /// 角色 -> Agent 状态（仅在绑定状态时使用）
    states: HashMap<String, AgentState>,
    /// 步骤开始时间
    step_started: HashMap<StepId, Instant>,
    writer: Option<StateWriter>,
}

impl RunLedger {
    fn new(plan_id: &str) -> Self {
        let run_id = format!("run_{}", uuid::Uuid::new_v4());
        Self {
            result: PlanExecutionResult::new(plan_id, &run_id, PlanStatus::InProgress),
            run_id,
            outputs: HashMap::new(),
            completion_order: Vec::new(),
            states: HashMap::new(),
            step_started: HashMap::new(),
            writer: None,
        }
    }

    fn record_output(&mut self, step_id: &str, output: String) {
        self.outputs.insert(step_id.to_string(), output);
        self.completion_order.push(step_id.to_string());
    }
}

/// 后台状态写入：按提交顺序保存快照，调度循环不等待存储
struct StateWriter {
    tx: mpsc::UnboundedSender<AgentState>,
    handle: tokio::task::JoinHandle<()>,
}

impl StateWriter {
    fn spawn(store: Arc<dyn StateStore>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<AgentState>();
        let handle = tokio::spawn(async move {
            while let Some(mut state) = rx.recv().await {
                if let Err(e) = store.save(&mut state).await {
                    tracing::warn!("Failed to persist state for agent {}: {}", state.agent_id, e);
                }
            }
        });
        Self { tx, handle }
    }

    fn submit(&self, state: &AgentState) {
        if self.tx.send(state.clone()).is_err() {
            tracing::warn!("State writer stopped, dropping snapshot for {}", state.agent_id);
        }
    }

    /// 等待已提交的快照全部写完
    async fn close(self) {
        drop(self.tx);
        if let Err(e) = self.handle.await {
            tracing::warn!("State writer task failed: {}", e);
        }
    }
}

/// 计划派发器
pub struct Dispatcher {
    runner: Arc<dyn StepRunner>,
    model_runners: HashMap<String, Arc<dyn StepRunner>>,
    settings: DispatchSettings,
    recovery: RecoveryEngine,
    metrics: Arc<dyn CapabilityMetrics>,
    binding: Option<StateBinding>,
    events: Option<mpsc::UnboundedSender<DispatchEvent>>,
    cancel: CancellationToken,
}

impl Dispatcher {
    pub fn new(runner: Arc<dyn StepRunner>) -> Self {
        let settings = DispatchSettings::default();
        Self {
            runner,
            model_runners: HashMap::new(),
            recovery: RecoveryEngine::new(settings.retry.clone()),
            settings,
            metrics: Arc::new(NoopMetrics),
            binding: None,
            events: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_settings(mut self, settings: DispatchSettings) -> Self {
        self.recovery = RecoveryEngine::new(settings.retry.clone());
        self.settings = settings;
        self
    }

    /// 为指定模型注入专用 runner（其余模型使用默认 runner）
    pub fn with_model_runner(
        mut self,
        model_id: impl Into<String>,
        runner: Arc<dyn StepRunner>,
    ) -> Self {
        self.model_runners.insert(model_id.into(), runner);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn CapabilityMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_state(mut self, binding: StateBinding) -> Self {
        self.binding = Some(binding);
        self
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<DispatchEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    fn runner_for(&self, model_id: &str) -> &Arc<dyn StepRunner> {
        self.model_runners.get(model_id).unwrap_or(&self.runner)
    }

    fn emit(&self, event: DispatchEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// 执行已批准（或执行中）的计划
    ///
    /// 计划未批准时立即返回当前状态、不含步骤结果；依赖非法（环、悬空依赖）返回 PlanError。
    /// 计划就地修改，不做持久化。
    pub async fn execute(
        &self,
        plan: &mut ExecutionPlan,
        context: Option<&str>,
    ) -> Result<PlanExecutionResult, PlanError> {
        let mut ledger = RunLedger::new(&plan.id);

        if !matches!(plan.status, PlanStatus::Approved | PlanStatus::InProgress) {
            tracing::warn!("Plan {} not approved. Status: {}", plan.id, plan.status);
            ledger.result.status = plan.status;
            return Ok(ledger.result);
        }

        let mut graph = PlanGraph::new(plan)?;
        plan.start()?;
        ledger.writer = self
            .binding
            .as_ref()
            .map(|binding| StateWriter::spawn(binding.store.clone()));

        tracing::info!("Executing plan {}: {}", plan.id, plan.intent_summary);
        self.emit(DispatchEvent::PlanStarted {
            plan_id: plan.id.clone(),
            run_id: ledger.run_id.clone(),
            total_steps: plan.steps.len(),
        });

        let started = Instant::now();
        let deadline = self
            .settings
            .plan_timeout
            .map(|limit| tokio::time::Instant::now() + limit);
        let max_parallel = self.settings.max_parallel_steps.max(1);

        // 续跑：已完成的步骤直接复用输出，上次中断在执行中的步骤记为失败
        for step_id in graph.topological_order()? {
            let step = plan.step_mut(&step_id)?;
            match step.status {
                StepState::Completed => {
                    ledger.record_output(&step_id, step.output.clone().unwrap_or_default());
                    graph.mark_completed(&step_id);
                }
                StepState::InProgress => {
                    let error = "Step was interrupted in a previous run";
                    step.fail(error.to_string())?;
                    tracing::warn!("Step {} was left in progress, marking failed", step_id);
                    ledger.result.step_results.push(StepResult::skipped(
                        &step_id,
                        &step.agent_role,
                        DispatchOutcome::Failure,
                        error,
                    ));
                }
                StepState::Pending | StepState::Failed => {}
            }
        }

        let mut ready: BTreeSet<(SortKey, StepId)> = plan
            .steps
            .iter()
            .filter(|s| s.status == StepState::Pending && graph.is_ready(&s.id))
            .filter_map(|s| graph.sort_key(&s.id).map(|k| (k, s.id.clone())))
            .collect();

        let mut running = FuturesUnordered::new();
        let mut in_flight: HashSet<StepId> = HashSet::new();
        let mut halt: Option<Halt> = None;

        loop {
            while halt.is_none() && running.len() < max_parallel {
                if self.cancel.is_cancelled() {
                    tracing::warn!("Plan {} cancelled, not starting remaining steps", plan.id);
                    halt = Some(Halt::Cancelled);
                    break;
                }
                if deadline.is_some_and(|d| tokio::time::Instant::now() >= d) {
                    halt = Some(Halt::TimedOut);
                    break;
                }
                let Some((_, step_id)) = ready.pop_first() else {
                    break;
                };
                let (request, models) =
                    self.prepare_step(plan, &graph, &mut ledger, &step_id, context)?;
                in_flight.insert(step_id);
                running.push(self.run_with_fallback(request, models));
            }

            if running.is_empty() {
                break;
            }

            let next = match deadline {
                Some(d) => match tokio::time::timeout_at(d, running.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        halt = Some(Halt::TimedOut);
                        break;
                    }
                },
                None => running.next().await,
            };
            let Some(run) = next else {
                break;
            };
            in_flight.remove(&run.step_id);

            let step_id = run.step_id.clone();
            let succeeded = run.outcome.is_ok();
            self.record_run(plan, &mut ledger, run)?;

            if succeeded {
                for dependent in graph.mark_completed(&step_id) {
                    let pending = plan
                        .step(&dependent)
                        .is_some_and(|s| s.status == StepState::Pending);
                    if let Some(key) = graph.sort_key(&dependent).filter(|_| pending) {
                        ready.insert((key, dependent));
                    }
                }
            }
        }
        drop(running);

        // 超时时仍在执行的步骤被中断；其下游按超时处理而不是 blocked
        let mut interrupted: Vec<StepId> = Vec::new();
        if halt == Some(Halt::TimedOut) {
            tracing::warn!("Plan {} timed out", plan.id);
            interrupted = in_flight.into_iter().collect();
            interrupted.sort_by_key(|id| graph.sort_key(id));
            for step_id in &interrupted {
                self.interrupt_step(plan, &mut ledger, step_id)?;
            }
        }

        self.classify_leftovers(plan, &graph, halt, &interrupted, &mut ledger.result)?;

        let status = match halt {
            Some(Halt::Cancelled) => PlanStatus::Cancelled,
            _ if ledger.completion_order.is_empty() => PlanStatus::Failed,
            _ => PlanStatus::Completed,
        };

        let (final_output, source) =
            aggregate_output(&graph, &ledger.outputs, &ledger.completion_order);
        if source == Some(FinalOutputSource::LastCompleted) {
            tracing::warn!(
                "Plan {} has no completed sink step, using last completed output",
                plan.id
            );
        }

        plan.finish(status)?;
        self.finalize_states(&mut ledger.states, ledger.writer.as_ref());
        if let Some(writer) = ledger.writer.take() {
            writer.close().await;
        }

        let mut result = ledger.result;
        result.final_output = final_output;
        result.final_output_source = source;
        result.status = status;
        result.total_duration_seconds = started.elapsed().as_secs_f64();

        tracing::info!(
            "Plan {} {} in {:.1}s ({} succeeded, {} failed, {} blocked)",
            plan.id,
            status,
            result.total_duration_seconds,
            result.succeeded(),
            result.failed(),
            result.blocked()
        );
        self.emit(DispatchEvent::PlanFinished {
            plan_id: plan.id.clone(),
            status,
            total_duration_seconds: result.total_duration_seconds,
        });

        Ok(result)
    }

    /// 标记步骤开始并构建请求；返回请求与模型尝试顺序
    ///
    /// 上下文 = 基础上下文 + 每个依赖的原样输出；绑定状态时再追加预算分配后的 Agent 状态。
    fn prepare_step(
        &self,
        plan: &mut ExecutionPlan,
        graph: &PlanGraph,
        ledger: &mut RunLedger,
        step_id: &str,
        base_context: Option<&str>,
    ) -> Result<(StepRequest, Vec<String>), PlanError> {
        let constraints = plan.constraints.clone();
        let intent = plan.intent_summary.clone();
        let upstream: Vec<(StepId, String, String)> = graph
            .dependencies(step_id)
            .iter()
            .filter_map(|dep| {
                let output = ledger.outputs.get(dep)?;
                let role = plan.step(dep).map(|s| s.agent_role.clone()).unwrap_or_default();
                Some((dep.clone(), role, output.clone()))
            })
            .collect();

        let step = plan.step_mut(step_id)?;
        step.begin()?;
        let role = step.agent_role.clone();
        let description = step.description.clone();

        let models = self.settings.models_for(&role);
        let model_id = models.first().cloned().unwrap_or_default();

        tracing::info!("Executing step {}: {}", step_id, description);
        self.emit(DispatchEvent::StepStarted {
            step_id: step_id.to_string(),
            agent_role: role.clone(),
            model: model_id.clone(),
        });

        ledger.step_started.insert(step_id.to_string(), Instant::now());

        let mut parts: Vec<String> = Vec::new();
        if let Some(base) = base_context.filter(|c| !c.is_empty()) {
            parts.push(base.to_string());
        }
        for (dep, _, output) in &upstream {
            parts.push(format!("Previous step output ({}):\n{}", dep, output));
        }

        if let Some(binding) = &self.binding {
            let state = ledger.states.entry(role.clone()).or_insert_with(|| {
                AgentState::new(role.clone(), ledger.run_id.clone())
                    .with_role(role.clone(), role.clone())
                    .with_goal(description.clone(), intent)
            });
            note(state.set_goal(description.clone()), step_id);
            note(state.add_step_with_id(step_id, description.clone()), step_id);
            note(state.start_step(step_id), step_id);
            note(state.set_model_used(model_id.clone()), step_id);
            note(state.clear_upstream(), step_id);
            for (dep, dep_role, output) in &upstream {
                note(
                    state.set_upstream(format!("{} ({})", dep_role, dep), output.clone()),
                    step_id,
                );
            }

            let memories = if binding.memory.enabled() {
                binding.memory.search(&description, MEMORY_RECALL_LIMIT)
            } else {
                Vec::new()
            };
            // 依赖输出已原样附上，预算只分配给其余段落
            let mut view = state.clone();
            view.upstream_context.clear();
            let allocated = binding.context.prepare_context(
                &view,
                &model_id,
                (!memories.is_empty()).then_some(memories.as_slice()),
                binding.long_lived_context.as_deref(),
            );
            tracing::debug!(
                "Allocated {} chars of context for step {} on {}",
                allocated.len(),
                step_id,
                model_id
            );
            parts.push(allocated);
            if let Some(writer) = &ledger.writer {
                writer.submit(state);
            }
        }

        let request = StepRequest {
            step_id: step_id.to_string(),
            agent_role: role,
            goal: description,
            context: (!parts.is_empty()).then(|| parts.join("\n\n")),
            constraints,
            model_id,
        };
        Ok((request, models))
    }

    /// 依次尝试各模型；单模型内由 RecoveryEngine 决定退避重试、换模型或放弃
    async fn run_with_fallback(&self, request: StepRequest, models: Vec<String>) -> StepRun {
        let started = Instant::now();
        let mut attempts = 0u32;
        let mut model_used = None;
        let mut last_error = CallError::permanent(format!(
            "No model configured for role {}",
            request.agent_role
        ));

        'models: for (idx, model) in models.iter().enumerate() {
            if idx > 0 {
                tracing::warn!(
                    "Step {} exhausted retries with {}, trying fallback model {}",
                    request.step_id,
                    models[idx - 1],
                    model
                );
                self.emit(DispatchEvent::ModelFallback {
                    step_id: request.step_id.clone(),
                    from: models[idx - 1].clone(),
                    to: model.clone(),
                });
            }

            let runner = self.runner_for(model);
            let mut call = request.clone();
            call.model_id = model.clone();
            let has_fallback = idx + 1 < models.len();
            let mut attempt = 0u32;

            loop {
                attempts += 1;
                model_used = Some(model.clone());
                let err = match self.call_once(runner.as_ref(), &call).await {
                    Ok(output) => {
                        return StepRun {
                            step_id: request.step_id,
                            outcome: Ok(output),
                            attempts,
                            model_used,
                            duration: started.elapsed(),
                        };
                    }
                    Err(err) => err,
                };

                match self.recovery.handle(&err, attempt, has_fallback) {
                    RecoveryAction::Retry(delay) => {
                        tracing::warn!(
                            "Step {} call failed (attempt {}/{}): {}. Retrying in {:.1}s with model {}...",
                            request.step_id,
                            attempt + 1,
                            self.settings.retry.attempts_per_model(),
                            err,
                            delay.as_secs_f64(),
                            model
                        );
                        self.emit(DispatchEvent::StepRetry {
                            step_id: request.step_id.clone(),
                            model: model.clone(),
                            attempt: attempt + 1,
                            delay_ms: delay.as_millis() as u64,
                            error: err.to_string(),
                        });
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    RecoveryAction::DowngradeModel => {
                        last_error = err;
                        continue 'models;
                    }
                    RecoveryAction::Abort => {
                        last_error = err;
                        break 'models;
                    }
                }
            }
        }

        StepRun {
            step_id: request.step_id,
            outcome: Err(last_error),
            attempts,
            model_used,
            duration: started.elapsed(),
        }
    }

    /// 单次调用：超时视为暂时性错误，空回复视为 EmptyResponse
    async fn call_once(
        &self,
        runner: &dyn StepRunner,
        request: &StepRequest,
    ) -> Result<String, CallError> {
        let output = match self.settings.step_timeout {
            Some(limit) => tokio::time::timeout(limit, runner.run_step(request))
                .await
                .map_err(|_| CallError::Timeout(limit))??,
            None => runner.run_step(request).await?,
        };
        if output.trim().is_empty() {
            return Err(CallError::EmptyResponse);
        }
        Ok(output)
    }

    /// 把一次步骤调用的结果写回计划、结果集、指标与 Agent 状态
    fn record_run(
        &self,
        plan: &mut ExecutionPlan,
        ledger: &mut RunLedger,
        run: StepRun,
    ) -> Result<(), PlanError> {
        let step = plan.step_mut(&run.step_id)?;
        let duration_seconds = run.duration.as_secs_f64();

        let (outcome, output, error) = match run.outcome {
            Ok(output) => {
                step.succeed(output.clone())?;
                ledger.record_output(&run.step_id, output.clone());
                (DispatchOutcome::Success, Some(output), None)
            }
            Err(err) => {
                let error = err.to_string();
                tracing::error!("Step {} failed: {}", run.step_id, error);
                step.fail(error.clone())?;
                (DispatchOutcome::Failure, None, Some(error))
            }
        };

        if let Some(capability_id) = &step.capability_id {
            self.metrics.update_metrics(
                capability_id,
                outcome == DispatchOutcome::Success,
                run.duration.as_secs(),
            );
        }

        if let Some(state) = ledger.states.get_mut(&step.agent_role) {
            for _ in 1..run.attempts {
                note(state.record_retry(&run.step_id), &run.step_id);
            }
            if let Some(model) = &run.model_used {
                note(state.set_model_used(model.clone()), &run.step_id);
            }
            let update = match (&output, &error) {
                (Some(output), _) => state
                    .complete_step(&run.step_id, StepCompletion::new().with_output(output.clone()))
                    .map(|_| ()),
                (None, error) => state.fail_step(&run.step_id, error.clone().unwrap_or_default()),
            };
            note(update, &run.step_id);
            if let Some(writer) = &ledger.writer {
                writer.submit(state);
            }
        }

        self.emit(DispatchEvent::StepFinished {
            step_id: run.step_id.clone(),
            outcome,
            duration_seconds,
        });
        ledger.result.step_results.push(StepResult {
            step_id: run.step_id,
            agent_role: step.agent_role.clone(),
            outcome,
            output,
            error,
            duration_seconds,
            attempts: run.attempts,
            model_used: run.model_used,
        });
        Ok(())
    }

    /// 计划超时时仍在执行的步骤：标记失败，结果记为 timeout，按失败上报指标
    fn interrupt_step(
        &self,
        plan: &mut ExecutionPlan,
        ledger: &mut RunLedger,
        step_id: &str,
    ) -> Result<(), PlanError> {
        const ERROR: &str = "Plan timed out";
        let elapsed = ledger
            .step_started
            .get(step_id)
            .map(|started| started.elapsed())
            .unwrap_or_default();
        let step = plan.step_mut(step_id)?;
        step.fail(ERROR.to_string())?;

        if let Some(capability_id) = &step.capability_id {
            self.metrics
                .update_metrics(capability_id, false, elapsed.as_secs());
        }

        let mut result =
            StepResult::skipped(step_id, &step.agent_role, DispatchOutcome::Timeout, ERROR);
        result.duration_seconds = elapsed.as_secs_f64();
        ledger.result.step_results.push(result);
        self.emit(DispatchEvent::StepFinished {
            step_id: step_id.to_string(),
            outcome: DispatchOutcome::Timeout,
            duration_seconds: elapsed.as_secs_f64(),
        });

        if let Some(state) = ledger.states.get_mut(&step.agent_role) {
            note(state.fail_step(step_id, ERROR), step_id);
            if let Some(writer) = &ledger.writer {
                writer.submit(state);
            }
        }
        Ok(())
    }

    /// 未运行的步骤：依赖失败的记为 blocked，其余按终止原因记为 cancelled / timeout
    fn classify_leftovers(
        &self,
        plan: &ExecutionPlan,
        graph: &PlanGraph,
        halt: Option<Halt>,
        interrupted: &[StepId],
        result: &mut PlanExecutionResult,
    ) -> Result<(), PlanError> {
        let mut blocked: HashSet<StepId> = HashSet::new();
        for step_id in graph.topological_order()? {
            let Some(step) = plan.step(&step_id) else {
                continue;
            };
            if step.status != StepState::Pending {
                continue;
            }
            let dependency_failed = graph.dependencies(&step_id).iter().any(|dep| {
                blocked.contains(dep)
                    || (!interrupted.contains(dep)
                        && plan.step(dep).is_some_and(|d| d.status == StepState::Failed))
            });

            let (outcome, error) = match halt {
                _ if dependency_failed => (DispatchOutcome::Blocked, "Dependencies not met"),
                Some(Halt::TimedOut) => (DispatchOutcome::Timeout, "Plan timed out"),
                Some(Halt::Cancelled) => (DispatchOutcome::Cancelled, "Plan cancelled"),
                None => (DispatchOutcome::Blocked, "Dependencies not met"),
            };
            if outcome == DispatchOutcome::Blocked {
                tracing::warn!("Step {} blocked by unmet dependencies", step_id);
                blocked.insert(step_id.clone());
            }
            self.emit(DispatchEvent::StepFinished {
                step_id: step_id.clone(),
                outcome,
                duration_seconds: 0.0,
            });
            result
                .step_results
                .push(StepResult::skipped(&step_id, &step.agent_role, outcome, error));
        }
        Ok(())
    }

    /// 运行结束：各角色状态写入最终结果并保存，成功步骤写入长期记忆
    fn finalize_states(
        &self,
        states: &mut HashMap<String, AgentState>,
        writer: Option<&StateWriter>,
    ) {
        let Some(binding) = &self.binding else {
            return;
        };
        let mut roles: Vec<String> = states.keys().cloned().collect();
        roles.sort();

        for role in roles {
            let Some(state) = states.get_mut(&role) else {
                continue;
            };
            let success = !state.completed_steps.is_empty()
                && state.completed_steps.iter().all(|s| s.is_success());
            let output = state
                .completed_steps
                .iter()
                .rev()
                .find_map(|s| s.tool_output.clone());
            note(state.finalize(success, output), &role);
            if let Some(writer) = writer {
                writer.submit(state);
            }

            if binding.memory.enabled() {
                for step in state.completed_steps.iter().filter(|s| s.is_success()) {
                    let output: String = step
                        .tool_output
                        .as_deref()
                        .unwrap_or_default()
                        .chars()
                        .take(MEMORY_OUTPUT_CHARS)
                        .collect();
                    binding
                        .memory
                        .add(&format!("{}: {}\n{}", role, step.description, output));
                }
            }
        }
    }
}

/// final_output：已完成的汇点步骤输出（按 order 拼接）；没有则退回最后一个完成的输出
fn aggregate_output(
    graph: &PlanGraph,
    outputs: &HashMap<StepId, String>,
    completion_order: &[StepId],
) -> (Option<String>, Option<FinalOutputSource>) {
    let sink_outputs: Vec<&str> = graph
        .sinks()
        .iter()
        .filter_map(|id| outputs.get(id).map(String::as_str))
        .collect();
    if !sink_outputs.is_empty() {
        return (Some(sink_outputs.join("\n\n")), Some(FinalOutputSource::Sink));
    }
    match completion_order.last().and_then(|id| outputs.get(id)) {
        Some(output) => (Some(output.clone()), Some(FinalOutputSource::LastCompleted)),
        None => (None, None),
    }
}

fn note(result: Result<(), StateError>, step_id: &str) {
    if let Err(e) = result {
        tracing::warn!("Agent state update for {} skipped: {}", step_id, e);
    }
}
