//! Agent Registry (C2): the single source of truth for agent profiles,
//! capability matching, performance history, and load. Backed by a
//! [`ResilientStore`] keyed by [`AgentId`]; mutations funnel through a
//! per-agent mutex table so queries never observe a partially-written
//! record.

use crate::config::StoreConfig;
use crate::error::{ArbiterError, Result};
use crate::events::{Event, EventBus, Payload, Severity, Topic};
use crate::models::{Agent, AgentId, Specialization, SpecializationLevel};
use crate::store::durable::DurableStore;
use crate::store::ResilientStore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterMode {
    Strict,
    Idempotent,
}

#[derive(Debug, Clone, Default)]
pub struct CapabilityQuery {
    pub task_type: String,
    pub languages: Vec<String>,
    pub specializations: Vec<String>,
    pub max_utilization: Option<f64>,
    pub min_success_rate: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct ScoredAgent {
    pub agent: Agent,
    pub match_score: f64,
}

#[derive(Debug, Clone, Default)]
pub struct PerformanceSample {
    pub success: bool,
    pub quality: f64,
    pub latency_ms: f64,
}

#[derive(Debug, Clone)]
pub struct RegistryStats {
    pub total_agents: usize,
    pub average_success_rate: f64,
    pub average_utilization: f64,
    pub last_updated: chrono::DateTime<chrono::Utc>,
}

/// Per-agent locks, so a query can read a consistent snapshot while a
/// concurrent mutation on a *different* agent proceeds freely.
pub struct AgentRegistry<S: DurableStore<Agent>> {
    store: Arc<ResilientStore<Agent, S>>,
    locks: Mutex<HashMap<AgentId, Arc<Mutex<()>>>>,
    events: Arc<EventBus>,
}

impl<S: DurableStore<Agent> + 'static> AgentRegistry<S> {
    pub fn new(durable: Arc<S>, config: &StoreConfig, events: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            store: ResilientStore::new("registry", durable, config, events.clone()),
            locks: Mutex::new(HashMap::new()),
            events,
        })
    }

    async fn lock_for(&self, id: &AgentId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(id.clone()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    pub async fn register(&self, agent: Agent, mode: RegisterMode) -> Result<Agent> {
        let guard = self.lock_for(&agent.id).await;
        let _held = guard.lock().await;

        match self.store.read(&agent.id.0).await {
            Ok(existing) => match mode {
                RegisterMode::Idempotent => Ok(existing.value),
                RegisterMode::Strict => Err(ArbiterError::Conflict(format!("agent {} already registered", agent.id))),
            },
            Err(ArbiterError::NotFound(_)) => {
                self.store.write(&agent.id.0, agent.clone(), false).await?;
                self.events.publish(Event::new(
                    Topic::Agent,
                    agent.id.0.clone(),
                    Severity::Info,
                    Payload::AgentRegistered {
                        agent_id: agent.id.0.clone(),
                    },
                ));
                Ok(agent)
            }
            Err(err) => Err(err),
        }
    }

    pub async fn unregister(&self, id: &AgentId) -> Result<bool> {
        let guard = self.lock_for(id).await;
        let _held = guard.lock().await;
        match self.store.delete(&id.0).await {
            Ok(()) => {
                self.events.publish(Event::new(
                    Topic::Agent,
                    id.0.clone(),
                    Severity::Info,
                    Payload::AgentUnregistered { agent_id: id.0.clone() },
                ));
                Ok(true)
            }
            Err(ArbiterError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub async fn get_profile(&self, id: &AgentId) -> Result<Agent> {
        self.store.read(&id.0).await.map(|r| r.value)
    }

    pub async fn all(&self) -> Result<Vec<Agent>> {
        self.all_agents().await
    }

    pub async fn health_check(&self) -> crate::store::HealthCheck {
        self.store.health_check().await
    }

    /// `matchScore` is 0 whenever `taskType` isn't in the agent's
    /// capabilities; otherwise the fixed weighted formula in the module
    /// doc. `maxUtilization`/`minSuccessRate` are exclusion filters, never
    /// downscoring factors.
    pub fn match_score(agent: &Agent, query: &CapabilityQuery) -> Option<f64> {
        if !agent.capabilities.task_types.contains(&query.task_type) {
            return None;
        }
        if let Some(max_util) = query.max_utilization {
            if agent.load.utilization_percent > max_util {
                return None;
            }
        }
        if let Some(min_rate) = query.min_success_rate {
            if agent.performance.success_rate < min_rate {
                return None;
            }
        }

        let lang_overlap = overlap_ratio(&query.languages, &agent.capabilities.languages);
        let spec_overlap = overlap_ratio(
            &query.specializations,
            &agent
                .capabilities
                .specializations
                .iter()
                .map(|s| s.task_type.clone())
                .collect(),
        );
        let utilization_term = 1.0 - agent.load.utilization_percent / 100.0;

        let score = 0.50 * 1.0
            + 0.20 * lang_overlap
            + 0.15 * spec_overlap
            + 0.10 * utilization_term
            + 0.05 * agent.performance.success_rate;
        Some(score.clamp(0.0, 1.0))
    }

    pub async fn query_by_capability(&self, query: &CapabilityQuery) -> Result<Vec<ScoredAgent>> {
        let candidates = self.all_agents().await?;
        let mut scored: Vec<ScoredAgent> = candidates
            .into_iter()
            .filter_map(|agent| Self::match_score(&agent, query).map(|match_score| ScoredAgent { agent, match_score }))
            .collect();
        scored.sort_by(|a, b| {
            b.match_score
                .partial_cmp(&a.match_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    b.agent
                        .performance
                        .success_rate
                        .partial_cmp(&a.agent.performance.success_rate)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.agent.id.0.cmp(&b.agent.id.0))
        });
        Ok(scored)
    }

    /// Queries read through the durable layer directly and don't take
    /// per-agent locks; the shadow has no prefix-scan support.
    async fn all_agents(&self) -> Result<Vec<Agent>> {
        Ok(self.store.scan("").await?.into_iter().map(|(_, agent, _)| agent).collect())
    }

    pub async fn update_performance(&self, id: &AgentId, sample: PerformanceSample) -> Result<Agent> {
        let guard = self.lock_for(id).await;
        let _held = guard.lock().await;

        let result: Result<Agent> = async {
            let mut agent = self.get_profile(id).await?;
            agent.performance.record(sample.success, sample.quality, sample.latency_ms);
            agent.last_active_at = chrono::Utc::now();
            self.store.write(&id.0, agent.clone(), false).await?;
            Ok(agent)
        }
        .await;

        match result {
            Ok(agent) => Ok(agent),
            Err(err) => {
                self.events.publish(Event::new(
                    Topic::Agent,
                    id.0.clone(),
                    Severity::Error,
                    Payload::AgentUpdateFailed {
                        agent_id: id.0.clone(),
                        reason: err.to_string(),
                    },
                ));
                Err(err)
            }
        }
    }

    pub async fn update_load(&self, id: &AgentId, delta_active: i64, delta_queued: i64) -> Result<Agent> {
        let guard = self.lock_for(id).await;
        let _held = guard.lock().await;

        let mut agent = self.get_profile(id).await?;
        agent.load.apply_delta(delta_active, delta_queued, agent.max_concurrent);
        self.store.write(&id.0, agent.clone(), false).await?;
        self.events.publish(Event::new(
            Topic::Agent,
            id.0.clone(),
            Severity::Debug,
            Payload::AgentLoadChanged {
                agent_id: id.0.clone(),
                active_tasks: agent.load.active_tasks,
                queued_tasks: agent.load.queued_tasks,
            },
        ));
        Ok(agent)
    }

    pub async fn update_specialization(&self, id: &AgentId, task_type: &str, sample: PerformanceSample) -> Result<Agent> {
        let guard = self.lock_for(id).await;
        let _held = guard.lock().await;

        let mut agent = self.get_profile(id).await?;
        let spec = match agent
            .capabilities
            .specializations
            .iter_mut()
            .find(|s| s.task_type == task_type)
        {
            Some(spec) => spec,
            None => {
                agent.capabilities.specializations.push(Specialization::novice(task_type));
                agent.capabilities.specializations.last_mut().unwrap()
            }
        };
        apply_specialization_sample(spec, &sample);
        self.store.write(&id.0, agent.clone(), false).await?;
        Ok(agent)
    }

    pub async fn get_stats(&self) -> Result<RegistryStats> {
        let agents = self.all_agents().await?;
        let total_agents = agents.len();
        if total_agents == 0 {
            return Ok(RegistryStats {
                total_agents: 0,
                average_success_rate: 0.0,
                average_utilization: 0.0,
                last_updated: chrono::Utc::now(),
            });
        }
        let average_success_rate = agents.iter().map(|a| a.performance.success_rate).sum::<f64>() / total_agents as f64;
        let average_utilization = agents.iter().map(|a| a.load.utilization_percent).sum::<f64>() / total_agents as f64;
        let last_updated = agents.iter().map(|a| a.last_active_at).max().unwrap_or_else(chrono::Utc::now);
        Ok(RegistryStats {
            total_agents,
            average_success_rate,
            average_utilization,
            last_updated,
        })
    }
}

fn overlap_ratio(required: &[String], available: &std::collections::HashSet<String>) -> f64 {
    if required.is_empty() {
        return 0.0;
    }
    let matched = required.iter().filter(|r| available.contains(*r)).count();
    matched as f64 / required.len().max(1) as f64
}

fn apply_specialization_sample(spec: &mut Specialization, sample: &PerformanceSample) {
    let n = spec.task_count + 1;
    let success_sample = if sample.success { 1.0 } else { 0.0 };
    spec.success_rate += (success_sample - spec.success_rate) / n as f64;
    spec.average_quality += (sample.quality - spec.average_quality) / n as f64;
    spec.task_count = n;
    spec.level = level_for(spec.task_count, spec.success_rate);
}

fn level_for(task_count: u64, success_rate: f64) -> SpecializationLevel {
    match (task_count, success_rate) {
        (n, rate) if n >= 50 && rate >= 0.9 => SpecializationLevel::Master,
        (n, rate) if n >= 20 && rate >= 0.8 => SpecializationLevel::Expert,
        (n, _) if n >= 5 => SpecializationLevel::Intermediate,
        _ => SpecializationLevel::Novice,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::durable::InMemoryDurableStore;
    use std::collections::HashSet;
    use std::time::Duration;

    fn test_registry() -> Arc<AgentRegistry<InMemoryDurableStore<Agent>>> {
        let durable = Arc::new(InMemoryDurableStore::new());
        let events = Arc::new(EventBus::new(64));
        let config = StoreConfig {
            health_probe_interval: Duration::from_secs(3600),
            ..StoreConfig::default()
        };
        AgentRegistry::new(durable, &config, events)
    }

    fn agent_with(id: &str, task_type: &str, utilization: f64, success_rate: f64) -> Agent {
        let mut agent = Agent::new(AgentId::new(id), id, "test-model");
        agent.capabilities.task_types.insert(task_type.to_string());
        agent.load.utilization_percent = utilization;
        agent.performance.success_rate = success_rate;
        agent
    }

    #[tokio::test]
    async fn register_rejects_duplicate_unless_idempotent() {
        let registry = test_registry();
        let agent = agent_with("a1", "file_editing", 0.0, 0.0);
        registry.register(agent.clone(), RegisterMode::Strict).await.unwrap();
        let err = registry.register(agent.clone(), RegisterMode::Strict).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Conflict);
        registry.register(agent, RegisterMode::Idempotent).await.unwrap();
    }

    #[test]
    fn match_score_zero_when_task_type_missing() {
        let agent = agent_with("a1", "code_review", 0.0, 0.0);
        let query = CapabilityQuery {
            task_type: "file_editing".into(),
            ..Default::default()
        };
        assert_eq!(AgentRegistry::<InMemoryDurableStore<Agent>>::match_score(&agent, &query), None);
    }

    #[test]
    fn match_score_matches_documented_formula() {
        let mut agent = agent_with("a1", "file_editing", 50.0, 0.8);
        agent.capabilities.languages = HashSet::from(["rust".to_string()]);
        let query = CapabilityQuery {
            task_type: "file_editing".into(),
            languages: vec!["rust".into()],
            ..Default::default()
        };
        let score = AgentRegistry::<InMemoryDurableStore<Agent>>::match_score(&agent, &query).unwrap();
        let expected = 0.50 + 0.20 * 1.0 + 0.15 * 0.0 + 0.10 * 0.5 + 0.05 * 0.8;
        assert!((score - expected).abs() < 1e-9);
    }

    #[test]
    fn match_score_excludes_over_utilization() {
        let agent = agent_with("a1", "file_editing", 95.0, 0.9);
        let query = CapabilityQuery {
            task_type: "file_editing".into(),
            max_utilization: Some(50.0),
            ..Default::default()
        };
        assert_eq!(AgentRegistry::<InMemoryDurableStore<Agent>>::match_score(&agent, &query), None);
    }

    #[tokio::test]
    async fn query_by_capability_sorts_by_score_then_success_then_id() {
        let registry = test_registry();
        registry
            .register(agent_with("b", "file_editing", 0.0, 0.5), RegisterMode::Strict)
            .await
            .unwrap();
        registry
            .register(agent_with("a", "file_editing", 0.0, 0.5), RegisterMode::Strict)
            .await
            .unwrap();
        let results = registry
            .query_by_capability(&CapabilityQuery {
                task_type: "file_editing".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(results[0].agent.id.0, "a");
        assert_eq!(results[1].agent.id.0, "b");
    }

    #[tokio::test]
    async fn update_load_clamps_at_zero() {
        let registry = test_registry();
        registry
            .register(agent_with("a1", "file_editing", 0.0, 0.0), RegisterMode::Strict)
            .await
            .unwrap();
        let agent = registry.update_load(&AgentId::new("a1"), -5, -5).await.unwrap();
        assert_eq!(agent.load.active_tasks, 0);
        assert_eq!(agent.load.queued_tasks, 0);
    }

    #[tokio::test]
    async fn update_specialization_creates_novice_entry() {
        let registry = test_registry();
        registry
            .register(agent_with("a1", "file_editing", 0.0, 0.0), RegisterMode::Strict)
            .await
            .unwrap();
        let agent = registry
            .update_specialization(
                &AgentId::new("a1"),
                "file_editing",
                PerformanceSample {
                    success: true,
                    quality: 0.9,
                    latency_ms: 10.0,
                },
            )
            .await
            .unwrap();
        assert_eq!(agent.capabilities.specializations.len(), 1);
        assert_eq!(agent.capabilities.specializations[0].task_count, 1);
    }
}
