//! 派发引擎集成测试

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use legion::capability::{Capability, CapabilityRegistry};
use legion::core::CallError;
use legion::llm::{ModelDirectory, RetryPolicy, StepRequest, StepRunner};
use legion::memory::ContextWindowManager;
use legion::state::{SqliteStateStore, StateStore};
use legion::workflow::*;
use tokio_util::sync::CancellationToken;

/// 记录每次调用；按步骤 ID 返回预设结果，未预设的步骤返回 "{id} output"
#[derive(Default)]
struct RecordingRunner {
    script: Mutex<HashMap<String, Vec<Result<String, CallError>>>>,
    always_fail: Mutex<HashMap<String, CallError>>,
    calls: Mutex<Vec<StepRequest>>,
    delay: Option<Duration>,
    active: AtomicUsize,
    peak: AtomicUsize,
    cancel_on_first_call: Option<CancellationToken>,
}

impl RecordingRunner {
    fn new() -> Self {
        Self::default()
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn failing(self, step_id: &str, error: CallError) -> Self {
        self.always_fail
            .lock()
            .unwrap()
            .insert(step_id.to_string(), error);
        self
    }

    fn scripted(self, step_id: &str, replies: Vec<Result<String, CallError>>) -> Self {
        self.script
            .lock()
            .unwrap()
            .insert(step_id.to_string(), replies);
        self
    }

    fn calls(&self) -> Vec<StepRequest> {
        self.calls.lock().unwrap().clone()
    }

    fn called_steps(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.step_id).collect()
    }
}

#[async_trait]
impl StepRunner for RecordingRunner {
    async fn run_step(&self, request: &StepRequest) -> Result<String, CallError> {
        let first = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(request.clone());
            calls.len() == 1
        };
        if first {
            if let Some(token) = &self.cancel_on_first_call {
                token.cancel();
            }
        }

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        if let Some(err) = self.always_fail.lock().unwrap().get(&request.step_id) {
            return Err(err.clone());
        }
        if let Some(replies) = self.script.lock().unwrap().get_mut(&request.step_id) {
            if !replies.is_empty() {
                return replies.remove(0);
            }
        }
        Ok(format!("{} output", request.step_id))
    }
}

fn fast_settings() -> DispatchSettings {
    DispatchSettings {
        retry: RetryPolicy {
            max_retries: 3,
            initial_backoff: Duration::from_millis(1),
            multiplier: 2.0,
            jitter_ratio: 0.0,
        },
        ..DispatchSettings::default()
    }
}

fn approve(mut plan: ExecutionPlan) -> ExecutionPlan {
    plan.propose().unwrap();
    plan.approve(Some("ok".into())).unwrap();
    plan
}

fn step(id: &str, role: &str, order: u32) -> PlanStep {
    PlanStep::new(id, role, format!("do {id}")).with_order(order)
}

#[tokio::test]
async fn test_scrambled_chain_runs_in_dependency_order() {
    // 声明顺序 C, B, A；order 与依赖方向相反
    let mut plan = approve(
        ExecutionPlan::new("chain")
            .with_step(step("c", "Editor", 1).depends_on("b"))
            .with_step(step("b", "Writer", 2).depends_on("a"))
            .with_step(step("a", "Researcher", 3)),
    );
    let runner = Arc::new(RecordingRunner::new());
    let dispatcher = Dispatcher::new(runner.clone()).with_settings(fast_settings());

    let result = dispatcher.execute(&mut plan, None).await.unwrap();

    assert_eq!(runner.called_steps(), vec!["a", "b", "c"]);
    assert!(result.success());
    assert!(!result.is_partial());
    assert_eq!(result.final_output.as_deref(), Some("c output"));
    assert_eq!(result.final_output_source, Some(FinalOutputSource::Sink));
    assert_eq!(plan.status, PlanStatus::Completed);
    assert!(plan.completed_at.is_some());
    assert!(plan.steps.iter().all(|s| s.status == StepState::Completed));
}

#[tokio::test]
async fn test_failure_is_isolated() {
    let mut plan = approve(
        ExecutionPlan::new("isolation")
            .with_step(step("good", "Writer", 1))
            .with_step(step("bad", "Critic", 2)),
    );
    let runner = Arc::new(
        RecordingRunner::new().failing("bad", CallError::permanent("role 'Critic' is not registered")),
    );
    let dispatcher = Dispatcher::new(runner.clone()).with_settings(fast_settings());

    let result = dispatcher.execute(&mut plan, None).await.unwrap();

    assert_eq!(result.status, PlanStatus::Completed);
    assert!(result.is_partial());
    let bad = result.step("bad").unwrap();
    assert_eq!(bad.outcome, DispatchOutcome::Failure);
    assert_eq!(bad.error.as_deref(), Some("role 'Critic' is not registered"));
    assert_eq!(bad.attempts, 1);
    assert!(bad.output.is_none());

    let failed = plan.step("bad").unwrap();
    assert_eq!(failed.status, StepState::Failed);
    assert!(failed.output.is_none());
    assert_eq!(failed.error.as_deref(), Some("role 'Critic' is not registered"));
}

#[tokio::test]
async fn test_dependents_of_failed_step_are_blocked() {
    let mut plan = approve(
        ExecutionPlan::new("blocked")
            .with_step(step("a", "Writer", 1))
            .with_step(step("b", "Editor", 2).depends_on("a"))
            .with_step(step("c", "Publisher", 3).depends_on("b"))
            .with_step(step("d", "Researcher", 4)),
    );
    let runner = Arc::new(RecordingRunner::new().failing("a", CallError::permanent("bad prompt")));
    let dispatcher = Dispatcher::new(runner.clone()).with_settings(fast_settings());

    let result = dispatcher.execute(&mut plan, None).await.unwrap();

    assert_eq!(runner.called_steps(), vec!["a", "d"]);
    assert_eq!(result.step("b").unwrap().outcome, DispatchOutcome::Blocked);
    assert_eq!(result.step("c").unwrap().outcome, DispatchOutcome::Blocked);
    assert_eq!(result.blocked(), 2);
    assert_eq!(result.status, PlanStatus::Completed);
    // 汇点 c 未完成，d 也是汇点
    assert_eq!(result.final_output.as_deref(), Some("d output"));
    // blocked 不写入步骤状态
    assert_eq!(plan.step("b").unwrap().status, StepState::Pending);
}

#[tokio::test]
async fn test_retry_bound_and_fallback_order() {
    let mut plan = approve(ExecutionPlan::new("flaky").with_step(step("a", "Writer", 1)));
    let runner = Arc::new(
        RecordingRunner::new().failing("a", CallError::transient("429 Too Many Requests")),
    );
    let dispatcher = Dispatcher::new(runner.clone()).with_settings(fast_settings());

    let result = dispatcher.execute(&mut plan, None).await.unwrap();

    let models: Vec<String> = runner.calls().into_iter().map(|c| c.model_id).collect();
    assert_eq!(
        models,
        vec![
            DEFAULT_PRIMARY_MODEL,
            DEFAULT_PRIMARY_MODEL,
            DEFAULT_PRIMARY_MODEL,
            DEFAULT_FALLBACK_MODEL,
            DEFAULT_FALLBACK_MODEL,
            DEFAULT_FALLBACK_MODEL,
        ]
    );
    let a = result.step("a").unwrap();
    assert_eq!(a.attempts, 6);
    assert_eq!(a.error.as_deref(), Some("429 Too Many Requests"));
    assert_eq!(a.model_used.as_deref(), Some(DEFAULT_FALLBACK_MODEL));
    assert_eq!(result.status, PlanStatus::Failed);
    assert_eq!(plan.status, PlanStatus::Failed);
    assert!(result.final_output.is_none());
}

#[tokio::test]
async fn test_transient_then_success() {
    let mut plan = approve(ExecutionPlan::new("recover").with_step(step("a", "Writer", 1)));
    let runner = Arc::new(RecordingRunner::new().scripted(
        "a",
        vec![
            Err(CallError::unknown("upstream returned 503")),
            Ok(String::new()),
            Ok("finally".into()),
        ],
    ));
    let dispatcher = Dispatcher::new(runner.clone()).with_settings(fast_settings());

    let result = dispatcher.execute(&mut plan, None).await.unwrap();
    let a = result.step("a").unwrap();
    assert!(a.is_success());
    assert_eq!(a.attempts, 3);
    assert_eq!(a.model_used.as_deref(), Some(DEFAULT_PRIMARY_MODEL));
    assert_eq!(a.output.as_deref(), Some("finally"));
}

#[tokio::test]
async fn test_unclassified_error_without_signature_is_not_retried() {
    let mut plan = approve(ExecutionPlan::new("unknown").with_step(step("a", "Writer", 1)));
    let runner = Arc::new(
        RecordingRunner::new().failing("a", CallError::unknown("tool 'drive' not found")),
    );
    let dispatcher = Dispatcher::new(runner.clone()).with_settings(fast_settings());

    let result = dispatcher.execute(&mut plan, None).await.unwrap();
    assert_eq!(runner.calls().len(), 1);
    assert_eq!(result.status, PlanStatus::Failed);
}

#[tokio::test]
async fn test_parallel_steps_overlap() {
    let build = || {
        approve(
            ExecutionPlan::new("fan-out")
                .with_step(step("a", "Writer", 1))
                .with_step(step("b", "Writer", 2))
                .with_step(step("c", "Writer", 3))
                .with_step(step("join", "Editor", 4).depends_on("a").depends_on("b").depends_on("c")),
        )
    };

    let runner = Arc::new(RecordingRunner::new().with_delay(Duration::from_millis(50)));
    let dispatcher = Dispatcher::new(runner.clone()).with_settings(DispatchSettings {
        max_parallel_steps: 3,
        ..fast_settings()
    });
    let mut plan = build();
    let result = dispatcher.execute(&mut plan, None).await.unwrap();
    assert!(result.success());
    assert!(runner.peak.load(Ordering::SeqCst) >= 2);
    assert_eq!(runner.called_steps().last().map(String::as_str), Some("join"));
    let join_context = runner.calls().last().unwrap().context.clone().unwrap();
    for dep in ["a", "b", "c"] {
        assert!(join_context.contains(&format!("Previous step output ({dep}):\n{dep} output")));
    }

    let sequential = Arc::new(RecordingRunner::new().with_delay(Duration::from_millis(5)));
    let dispatcher = Dispatcher::new(sequential.clone()).with_settings(fast_settings());
    let mut plan = build();
    dispatcher.execute(&mut plan, None).await.unwrap();
    assert_eq!(sequential.peak.load(Ordering::SeqCst), 1);
    assert_eq!(sequential.called_steps(), vec!["a", "b", "c", "join"]);
}

#[tokio::test]
async fn test_cancellation_skips_unstarted_steps() {
    let token = CancellationToken::new();
    let runner = Arc::new(RecordingRunner {
        cancel_on_first_call: Some(token.clone()),
        ..RecordingRunner::default()
    });
    let dispatcher = Dispatcher::new(runner.clone())
        .with_settings(fast_settings())
        .with_cancellation(token);
    let mut plan = approve(
        ExecutionPlan::new("cancel")
            .with_step(step("a", "Writer", 1))
            .with_step(step("b", "Writer", 2))
            .with_step(step("c", "Editor", 3).depends_on("b")),
    );

    let result = dispatcher.execute(&mut plan, None).await.unwrap();

    assert_eq!(runner.called_steps(), vec!["a"]);
    assert_eq!(result.status, PlanStatus::Cancelled);
    assert_eq!(plan.status, PlanStatus::Cancelled);
    assert!(result.step("a").unwrap().is_success());
    assert_eq!(result.step("b").unwrap().outcome, DispatchOutcome::Cancelled);
    assert_eq!(result.step("c").unwrap().outcome, DispatchOutcome::Cancelled);
}

#[tokio::test]
async fn test_plan_timeout_marks_remaining_steps() {
    let runner = Arc::new(RecordingRunner::new().with_delay(Duration::from_secs(2)));
    let dispatcher = Dispatcher::new(runner.clone()).with_settings(DispatchSettings {
        plan_timeout: Some(Duration::from_millis(50)),
        ..fast_settings()
    });
    let mut plan = approve(
        ExecutionPlan::new("slow")
            .with_step(step("a", "Writer", 1))
            .with_step(step("b", "Editor", 2).depends_on("a")),
    );

    let result = dispatcher.execute(&mut plan, None).await.unwrap();

    assert_eq!(result.status, PlanStatus::Failed);
    assert_eq!(result.step("a").unwrap().outcome, DispatchOutcome::Timeout);
    assert_eq!(result.step("b").unwrap().outcome, DispatchOutcome::Timeout);
    assert_eq!(plan.step("a").unwrap().status, StepState::Failed);
    assert_eq!(plan.step("b").unwrap().status, StepState::Pending);
}

#[tokio::test]
async fn test_plan_timeout_reports_interrupted_step_metrics() {
    let registry = Arc::new(CapabilityRegistry::new());
    registry.register(Capability::new("write_fiction", "Write fiction", "Writer"));
    let runner = Arc::new(RecordingRunner::new().with_delay(Duration::from_secs(2)));
    let dispatcher = Dispatcher::new(runner)
        .with_settings(DispatchSettings {
            plan_timeout: Some(Duration::from_millis(50)),
            ..fast_settings()
        })
        .with_metrics(registry.clone());
    let mut plan = approve(
        ExecutionPlan::new("slow").with_step(step("a", "Writer", 1).with_capability("write_fiction")),
    );

    let result = dispatcher.execute(&mut plan, None).await.unwrap();

    let a = result.step("a").unwrap();
    assert_eq!(a.outcome, DispatchOutcome::Timeout);
    assert!(a.duration_seconds >= 0.04);
    let cap = registry.get("write_fiction").unwrap();
    assert_eq!(cap.execution_count, 1);
    assert!(cap.success_rate < 0.8);
}

#[tokio::test]
async fn test_plan_not_approved_returns_immediately() {
    let mut plan = ExecutionPlan::new("draft").with_step(step("a", "Writer", 1));
    let runner = Arc::new(RecordingRunner::new());
    let dispatcher = Dispatcher::new(runner.clone());

    let result = dispatcher.execute(&mut plan, None).await.unwrap();

    assert_eq!(result.status, PlanStatus::Draft);
    assert!(result.step_results.is_empty());
    assert!(!result.success());
    assert!(runner.calls().is_empty());
    assert_eq!(plan.status, PlanStatus::Draft);
}

#[tokio::test]
async fn test_cyclic_plan_is_configuration_error() {
    let mut plan = ExecutionPlan::new("cycle")
        .with_step(step("a", "Writer", 1).depends_on("b"))
        .with_step(step("b", "Editor", 2).depends_on("a"));
    plan.status = PlanStatus::Approved;
    let runner = Arc::new(RecordingRunner::new());
    let dispatcher = Dispatcher::new(runner.clone());

    let err = dispatcher.execute(&mut plan, None).await.unwrap_err();

    assert!(matches!(err, PlanError::CyclicDependency(_)));
    assert!(runner.calls().is_empty());
    assert_eq!(plan.status, PlanStatus::Approved);
}

#[tokio::test]
async fn test_capability_metrics_are_reported() {
    let registry = Arc::new(CapabilityRegistry::new());
    registry.register(Capability::new("write_fiction", "Write fiction", "Writer"));
    registry.register(Capability::new("edit_prose", "Edit prose", "Editor"));

    let mut plan = approve(
        ExecutionPlan::new("metrics")
            .with_step(step("a", "Writer", 1).with_capability("write_fiction"))
            .with_step(step("b", "Editor", 2).with_capability("edit_prose"))
            .with_step(step("c", "Editor", 3)),
    );
    let runner = Arc::new(RecordingRunner::new().failing("b", CallError::permanent("nope")));
    let dispatcher = Dispatcher::new(runner)
        .with_settings(fast_settings())
        .with_metrics(registry.clone());

    dispatcher.execute(&mut plan, None).await.unwrap();

    let write = registry.get("write_fiction").unwrap();
    assert_eq!(write.execution_count, 1);
    assert!(write.success_rate > 0.8);
    let edit = registry.get("edit_prose").unwrap();
    assert_eq!(edit.execution_count, 1);
    assert!(edit.success_rate < 0.8);
}

#[tokio::test]
async fn test_state_binding_records_each_role() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteStateStore::open(dir.path().join("state.db"), 100).unwrap());
    let context = Arc::new(ContextWindowManager::new(Arc::new(ModelDirectory::builtin())));
    let binding = StateBinding::new(store.clone(), context)
        .with_long_lived_context("The user prefers British spelling.");

    let runner = Arc::new(RecordingRunner::new());
    let dispatcher = Dispatcher::new(runner.clone())
        .with_settings(fast_settings())
        .with_state(binding);
    let mut plan = approve(
        ExecutionPlan::new("Write a story")
            .with_step(step("draft", "Writer", 1))
            .with_step(step("edit", "Editor", 2).depends_on("draft")),
    );

    let result = dispatcher.execute(&mut plan, Some("Audience: children")).await.unwrap();
    assert!(result.success());

    let edit_context = runner.calls()[1].context.clone().unwrap();
    assert!(edit_context.starts_with(
        "Audience: children\n\nPrevious step output (draft):\ndraft output\n\n## Current Goal\ndo edit"
    ));
    assert!(!edit_context.contains("### From Writer (draft)"));
    assert!(edit_context.contains("The user prefers British spelling."));

    let states = store.load_by_workflow(&result.run_id).await.unwrap();
    assert_eq!(states.len(), 2);
    for state in &states {
        assert!(state.success);
        assert!(state.is_finalized());
        assert_eq!(state.completed_steps.len(), 1);
        assert!(state.pending_steps.is_empty());
    }

    let editor = store.load("Editor").await.unwrap().unwrap();
    assert_eq!(
        editor.upstream_context.get("Writer (draft)").map(String::as_str),
        Some("draft output")
    );

    let writer = store.load("Writer").await.unwrap().unwrap();
    assert_eq!(writer.final_output.as_deref(), Some("draft output"));
    assert_eq!(writer.model_used.as_deref(), Some(DEFAULT_PRIMARY_MODEL));
    assert_eq!(writer.original_prompt, "Write a story");

    // 每个角色：开始、完成、最终化各保存一次
    let history = store.get_history("Editor", 10, 0).await.unwrap();
    assert_eq!(history.len(), 3);
    assert!(history[0].is_finalized());
    assert!(!history[2].is_finalized());
}

#[tokio::test]
async fn test_bound_steps_receive_only_their_own_dependencies_verbatim() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteStateStore::open(dir.path().join("state.db"), 100).unwrap());
    let context = Arc::new(ContextWindowManager::new(Arc::new(ModelDirectory::builtin())));
    let binding = StateBinding::new(store.clone(), context);

    let alpha = format!("alpha {}", "A".repeat(2_000));
    let beta = format!("beta {}", "B".repeat(2_000));
    let runner = Arc::new(
        RecordingRunner::new()
            .scripted("a", vec![Ok(alpha.clone())])
            .scripted("b", vec![Ok(beta.clone())]),
    );
    let dispatcher = Dispatcher::new(runner.clone())
        .with_settings(fast_settings())
        .with_state(binding);
    let mut plan = approve(
        ExecutionPlan::new("fan")
            .with_step(step("a", "Writer", 1))
            .with_step(step("b", "Writer", 2))
            .with_step(step("c", "Editor", 3).depends_on("a"))
            .with_step(step("d", "Editor", 4).depends_on("b")),
    );

    let result = dispatcher.execute(&mut plan, None).await.unwrap();
    assert!(result.success());
    assert_eq!(runner.called_steps(), vec!["a", "b", "c", "d"]);

    let calls = runner.calls();
    let c_context = calls[2].context.clone().unwrap();
    assert!(c_context.contains(&format!("Previous step output (a):\n{}", alpha)));
    assert!(!c_context.contains("Previous step output (b)"));

    let d_context = calls[3].context.clone().unwrap();
    assert!(d_context.contains(&format!("Previous step output (b):\n{}", beta)));
    assert!(!d_context.contains("Previous step output (a)"));
    assert!(!d_context.contains("AAAA"));

    let editor = store.load("Editor").await.unwrap().unwrap();
    let keys: Vec<&str> = editor.upstream_context.keys().map(String::as_str).collect();
    assert_eq!(keys, vec!["Writer (b)"]);
    assert_eq!(editor.upstream_context["Writer (b)"], beta);
}
