//! Legion - 计划派发演示入口
//!
//! 用法：`legion <plan.json> [config.toml]`
//! 读取执行计划，使用 Mock runner 执行（步骤输出回显角色与目标），状态写入 SQLite，打印扁平 JSON 结果。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use legion::{
    config::load_config,
    llm::{MockStepRunner, ModelDirectory},
    memory::{ContextWindowManager, InMemoryLongTerm},
    observability,
    state::SqliteStateStore,
    workflow::{Dispatcher, ExecutionPlan, PlanStatus, StateBinding},
    CapabilityRegistry,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let mut args = std::env::args().skip(1);
    let plan_path = PathBuf::from(args.next().context("Usage: legion <plan.json> [config.toml]")?);
    let config_path = args.next().map(PathBuf::from);

    let config = load_config(config_path).context("Failed to load config")?;

    let raw = std::fs::read_to_string(&plan_path)
        .with_context(|| format!("Failed to read plan {}", plan_path.display()))?;
    let mut plan: ExecutionPlan = serde_json::from_str(&raw).context("Invalid plan JSON")?;

    // 无需审批的计划直接走完 draft -> proposed -> approved
    if !plan.requires_approval {
        if plan.status == PlanStatus::Draft {
            plan.propose().context("Plan failed validation")?;
        }
        if plan.status == PlanStatus::Proposed {
            plan.approve(Some("auto-approved".to_string()))?;
        }
    }

    let directory = Arc::new(ModelDirectory::load_or_builtin(config.models.path.as_deref()));
    let context = Arc::new(
        ContextWindowManager::new(directory).with_settings(config.budget.to_settings()),
    );
    let store = SqliteStateStore::open(&config.store.db_path, config.store.max_history)
        .context("Failed to open state store")?;
    let binding = StateBinding::new(Arc::new(store), context)
        .with_memory(Arc::new(InMemoryLongTerm::default()));

    // 计划引用到的能力先登记，否则其指标会被忽略
    let registry = Arc::new(CapabilityRegistry::new());
    for step in &plan.steps {
        if let Some(capability_id) = &step.capability_id {
            registry.register_missing(capability_id, &step.agent_role);
        }
    }

    let dispatcher = Dispatcher::new(Arc::new(MockStepRunner))
        .with_settings(config.dispatch.to_settings())
        .with_metrics(registry.clone())
        .with_state(binding);

    let token = dispatcher.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Ctrl-C received, cancelling remaining steps");
            token.cancel();
        }
    });

    let result = dispatcher
        .execute(&mut plan, None)
        .await
        .context("Plan execution failed")?;

    for capability in registry.all() {
        tracing::info!(
            "Capability {}: {} runs, success rate {:.2}",
            capability.id,
            capability.execution_count,
            capability.success_rate
        );
    }

    println!("{}", serde_json::to_string_pretty(&result.to_flat())?);
    Ok(())
}
