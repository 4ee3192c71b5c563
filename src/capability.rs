//! 能力注册表：记录各 Agent 能做什么，以及每项能力的成功率与耗时
//!
//! Dispatcher 每完成一个带 capability_id 的步骤就上报一次指标；上报不会失败，未知能力直接忽略。

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// 指标上报（只写、不返回错误）
pub trait CapabilityMetrics: Send + Sync {
    fn update_metrics(&self, capability_id: &str, success: bool, duration_seconds: u64);
}

/// 不记录任何指标
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl CapabilityMetrics for NoopMetrics {
    fn update_metrics(&self, _capability_id: &str, _success: bool, _duration_seconds: u64) {}
}

fn default_success_rate() -> f64 {
    0.8
}

fn default_avg_duration() -> f64 {
    60.0
}

/// 单项能力
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// 拥有该能力的 Agent 角色
    pub agent_role: String,
    #[serde(default)]
    pub team: Option<String>,
    #[serde(default)]
    pub required_tools: Vec<String>,
    #[serde(default = "default_success_rate")]
    pub success_rate: f64,
    #[serde(default = "default_avg_duration")]
    pub avg_duration_seconds: f64,
    #[serde(default)]
    pub execution_count: u64,
    pub updated_at: DateTime<Utc>,
}

impl Capability {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        agent_role: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            agent_role: agent_role.into(),
            team: None,
            required_tools: Vec::new(),
            success_rate: default_success_rate(),
            avg_duration_seconds: default_avg_duration(),
            execution_count: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_team(mut self, team: impl Into<String>) -> Self {
        self.team = Some(team.into());
        self
    }

    /// 滚动平均：成功率 0.9/0.1，耗时 0.8/0.2
    fn record(&mut self, success: bool, duration_seconds: u64) {
        self.execution_count += 1;
        let hit = if success { 1.0 } else { 0.0 };
        self.success_rate = self.success_rate * 0.9 + hit * 0.1;
        self.avg_duration_seconds = self.avg_duration_seconds * 0.8 + duration_seconds as f64 * 0.2;
        self.updated_at = Utc::now();
    }
}

/// 内存中的能力注册表
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    capabilities: RwLock<HashMap<String, Capability>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, capability: Capability) {
        let Ok(mut caps) = self.capabilities.write() else {
            warn!(capability = %capability.id, "Capability registry lock poisoned");
            return;
        };
        info!(capability = %capability.id, role = %capability.agent_role, "Registered capability");
        caps.insert(capability.id.clone(), capability);
    }

    /// 未登记时以 ID 作为名称登记；已存在则保留原有指标。返回是否新登记
    pub fn register_missing(&self, capability_id: &str, agent_role: &str) -> bool {
        let Ok(mut caps) = self.capabilities.write() else {
            warn!(capability = capability_id, "Capability registry lock poisoned");
            return false;
        };
        if caps.contains_key(capability_id) {
            return false;
        }
        info!(capability = capability_id, role = agent_role, "Registered capability");
        caps.insert(
            capability_id.to_string(),
            Capability::new(capability_id, capability_id, agent_role),
        );
        true
    }

    pub fn get(&self, capability_id: &str) -> Option<Capability> {
        self.capabilities
            .read()
            .ok()
            .and_then(|caps| caps.get(capability_id).cloned())
    }

    /// 全部能力（按 ID 排序）
    pub fn all(&self) -> Vec<Capability> {
        let mut all: Vec<Capability> = self
            .capabilities
            .read()
            .map(|caps| caps.values().cloned().collect())
            .unwrap_or_default();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn by_agent(&self, agent_role: &str) -> Vec<Capability> {
        let role = agent_role.to_lowercase();
        self.all()
            .into_iter()
            .filter(|c| c.agent_role.to_lowercase() == role)
            .collect()
    }
}

impl CapabilityMetrics for CapabilityRegistry {
    fn update_metrics(&self, capability_id: &str, success: bool, duration_seconds: u64) {
        let Ok(mut caps) = self.capabilities.write() else {
            return;
        };
        match caps.get_mut(capability_id) {
            Some(cap) => {
                cap.record(success, duration_seconds);
                debug!(
                    capability = capability_id,
                    success,
                    rate = cap.success_rate,
                    "Updated capability metrics"
                );
            }
            None => debug!(capability = capability_id, "Metrics for unknown capability ignored"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_missing_keeps_existing_metrics() {
        let registry = CapabilityRegistry::new();
        assert!(registry.register_missing("write_fiction", "Writer"));
        registry.update_metrics("write_fiction", true, 10);
        assert!(!registry.register_missing("write_fiction", "Editor"));

        let cap = registry.get("write_fiction").unwrap();
        assert_eq!(cap.execution_count, 1);
        assert_eq!(cap.agent_role, "Writer");
    }

    #[test]
    fn test_rolling_metrics() {
        let registry = CapabilityRegistry::new();
        registry.register(Capability::new("write_fiction", "Write short fiction", "Writer"));

        registry.update_metrics("write_fiction", true, 100);
        let cap = registry.get("write_fiction").unwrap();
        assert_eq!(cap.execution_count, 1);
        assert!((cap.success_rate - 0.82).abs() < 1e-9);
        assert!((cap.avg_duration_seconds - 68.0).abs() < 1e-9);

        registry.update_metrics("write_fiction", false, 0);
        let cap = registry.get("write_fiction").unwrap();
        assert!((cap.success_rate - 0.738).abs() < 1e-9);
        assert_eq!(cap.execution_count, 2);
    }

    #[test]
    fn test_unknown_capability_is_ignored() {
        let registry = CapabilityRegistry::new();
        registry.update_metrics("missing", true, 5);
        assert!(registry.all().is_empty());
    }

    #[test]
    fn test_by_agent_is_case_insensitive() {
        let registry = CapabilityRegistry::new();
        registry.register(Capability::new("a", "Edit", "Editor"));
        registry.register(Capability::new("b", "Draft", "Writer"));
        assert_eq!(registry.by_agent("editor").len(), 1);
    }
}
