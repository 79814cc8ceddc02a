//! Six scenarios exercising a full slice of the system end to end: the
//! happy path, reassignment on timeout, degraded reads under an open
//! breaker, rate limiting, tenant isolation, and a risk-tier-1 verdict.
//! Each mirrors one of the literal scenarios the component contracts were
//! designed against.

use crate::config::{OrchestratorConfig, QueueConfig, SecurityConfig, StoreConfig, VerdictConfig};
use crate::error::{ArbiterError, ErrorKind};
use crate::events::{EventBus, Payload, Topic};
use crate::models::{
    AcceptanceCriterion, AcceptanceResult, Agent, AgentId, Artifacts, AssignmentState, Decision,
    NonFunctionalTarget, PerformanceHistory, Priority, RiskTier, Scope, Task, TaskBudget, TimeoutType,
    WorkingSpec,
};
use crate::orchestrator::TaskOrchestrator;
use crate::queue::TaskQueue;
use crate::registry::{AgentRegistry, RegisterMode};
use crate::security::{Identity, SecurityGate, StaticTokenVerifier};
use crate::store::durable::InMemoryDurableStore;
use crate::store::{ResilientStore, SourcedFrom};
use crate::verdict::VerdictGenerator;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

fn store_config_no_probing() -> StoreConfig {
    StoreConfig {
        health_probe_interval: Duration::from_secs(3600),
        ..StoreConfig::default()
    }
}

fn agent_with_capability(id: &str, task_type: &str) -> Agent {
    let mut agent = Agent::new(AgentId::new(id), id, "test-model");
    agent.capabilities.task_types.insert(task_type.to_string());
    agent.max_concurrent = 5;
    agent
}

#[tokio::test]
async fn happy_path_assignment_completes_and_updates_agent_performance() {
    let events = Arc::new(EventBus::new(64));
    let store_config = store_config_no_probing();
    let registry = AgentRegistry::new(Arc::new(InMemoryDurableStore::new()), &store_config, events.clone());

    let mut a1 = agent_with_capability("A1", "file_editing");
    a1.capabilities.languages.insert("TypeScript".into());
    a1.performance = PerformanceHistory {
        success_rate: 0.9,
        average_quality: 0.0,
        average_latency_ms: 0.0,
        task_count: 10,
    };
    registry.register(a1, RegisterMode::Strict).await.unwrap();

    let queue = Arc::new(TaskQueue::new(QueueConfig::default(), events.clone()));
    let assignments = ResilientStore::new("assignments", Arc::new(InMemoryDurableStore::new()), &store_config, events.clone());
    let orchestrator = TaskOrchestrator::new(OrchestratorConfig::default(), queue.clone(), registry.clone(), assignments, events.clone());

    let mut sub = events.subscribe(Topic::Task);

    let mut task = Task::new("edit the file", "file_editing", Priority::Normal);
    task.id = "T1".into();
    task.timeout_ms = 30_000;
    task.max_attempts = 3;
    queue.enqueue(task).await.unwrap();

    let started = std::time::Instant::now();
    let assignment = orchestrator.assign_next().await.unwrap().expect("an eligible agent exists");
    assert!(started.elapsed() < Duration::from_millis(100));
    assert_eq!(assignment.agent_id, AgentId::new("A1"));

    match sub.recv().await.unwrap().payload {
        Payload::TaskAssigned { task_id, agent_id, .. } => {
            assert_eq!(task_id, "T1");
            assert_eq!(agent_id, "A1");
        }
        other => panic!("expected task.assigned, got {other:?}"),
    }

    orchestrator.ack(&assignment.id, &assignment.agent_id, None).await.unwrap();
    assert!(matches!(sub.recv().await.unwrap().payload, Payload::TaskAcknowledged { .. }));

    let verdict_config = VerdictConfig::default();
    let generator = VerdictGenerator::new(&verdict_config);
    let artifacts = Artifacts {
        coverage: Some(0.95),
        ..Artifacts::default()
    };
    let completed = orchestrator.submit(&assignment.id, artifacts, &generator).await.unwrap();
    assert_eq!(completed.state, AssignmentState::Completed);
    assert_eq!(completed.verdict.as_ref().unwrap().decision, Decision::Pass);

    assert!(matches!(sub.recv().await.unwrap().payload, Payload::TaskCompleted { .. }));

    let agent = registry.get_profile(&AgentId::new("A1")).await.unwrap();
    assert_eq!(agent.performance.task_count, 11);
    assert!((agent.performance.success_rate - (0.9 + (1.0 - 0.9) / 11.0)).abs() < 1e-9);
}

#[tokio::test]
async fn ack_timeout_reassigns_to_second_agent_on_next_attempt() {
    let events = Arc::new(EventBus::new(64));
    let store_config = store_config_no_probing();
    let registry = AgentRegistry::new(Arc::new(InMemoryDurableStore::new()), &store_config, events.clone());
    for id in ["A1", "A2"] {
        registry.register(agent_with_capability(id, "file_editing"), RegisterMode::Strict).await.unwrap();
    }

    let queue = Arc::new(TaskQueue::new(QueueConfig::default(), events.clone()));
    let assignments = ResilientStore::new("assignments", Arc::new(InMemoryDurableStore::new()), &store_config, events.clone());
    let orchestrator_config = OrchestratorConfig {
        ack_window: Duration::from_millis(50),
        ..OrchestratorConfig::default()
    };
    let orchestrator = TaskOrchestrator::new(orchestrator_config, queue.clone(), registry.clone(), assignments, events.clone());

    let mut sub = events.subscribe(Topic::Task);
    let mut task = Task::new("edit the file", "file_editing", Priority::Normal);
    task.id = "T2".into();
    queue.enqueue(task).await.unwrap();

    let first = orchestrator.assign_next().await.unwrap().unwrap();
    let first_agent = first.agent_id.clone();
    assert!(matches!(sub.recv().await.unwrap().payload, Payload::TaskAssigned { .. }));

    tokio::time::sleep(Duration::from_millis(70)).await;
    let timed_out = orchestrator.check_timeouts(&first.id).await.unwrap().unwrap();
    assert_eq!(timed_out.state, AssignmentState::Failed);
    assert_eq!(timed_out.timeout_type, Some(TimeoutType::Acknowledgment));
    assert!(matches!(
        sub.recv().await.unwrap().payload,
        Payload::TaskTimeout { timeout_type, .. } if timeout_type == "Acknowledgment"
    ));

    let agent_after = registry.get_profile(&first_agent).await.unwrap();
    assert_eq!(agent_after.load.active_tasks, 0);

    let second = orchestrator.assign_next().await.unwrap().unwrap();
    assert_ne!(second.agent_id, first_agent);
    assert_eq!(second.attempt_number, 2);
    match sub.recv().await.unwrap().payload {
        Payload::TaskReassigned { new_agent_id, attempt_number, .. } => {
            assert_eq!(new_agent_id, second.agent_id.0);
            assert_eq!(attempt_number, 2);
        }
        other => panic!("expected task.reassigned, got {other:?}"),
    }
}

/// Covers the degraded-read path the Agent Registry's `getProfile` and
/// `queryByCapability` are both built on. `queryByCapability` itself goes
/// through `ResilientStore::scan`, which fails fast when the breaker is
/// open rather than falling back to the shadow (the shadow has no prefix
/// index to scan); the single-key read path exercised here is what
/// `getProfile` uses and is where shadow-coherent reads actually apply.
#[tokio::test]
async fn breaker_open_degrades_read_to_shadow_then_recovers() {
    let events = Arc::new(EventBus::new(64));
    let durable = Arc::new(InMemoryDurableStore::<Agent>::new());
    let store_config = StoreConfig {
        failure_threshold: 1,
        cooldown: Duration::from_millis(30),
        health_probe_interval: Duration::from_millis(10),
        ..StoreConfig::default()
    };
    let store = ResilientStore::new("agents", durable.clone(), &store_config, events.clone());

    let agent = Agent::new(AgentId::new("A1"), "A1", "test-model");
    store.write(&agent.id.0, agent.clone(), false).await.unwrap();
    let initial = store.read(&agent.id.0).await.unwrap();
    assert_eq!(initial.sourced_from, SourcedFrom::Durable);

    durable.set_offline(true);
    let _ = store.read(&agent.id.0).await; // trips the breaker open

    let degraded = store.read(&agent.id.0).await.unwrap();
    assert_eq!(degraded.sourced_from, SourcedFrom::Memory);

    durable.set_offline(false);
    tokio::time::sleep(Duration::from_millis(60)).await; // one health-prober cycle
    let recovered = store.read(&agent.id.0).await.unwrap();
    assert_eq!(recovered.sourced_from, SourcedFrom::Durable);
}

#[tokio::test]
async fn task_submit_bucket_rejects_after_ten_in_one_second() {
    let events = Arc::new(EventBus::new(64));
    let identity = Identity {
        identity: "submitter-1".into(),
        tenant: "default".into(),
        roles: vec!["submitter".into()],
    };
    let mut tokens = HashMap::new();
    tokens.insert("tok".to_string(), identity.clone());
    let verifier = Arc::new(StaticTokenVerifier::new(tokens));
    let security_config = SecurityConfig {
        identity_bucket_capacity: 100,
        identity_refill_per_sec: 100,
        operation_bucket_capacity: 10,
        operation_refill_per_sec: 1,
    };
    let gate = SecurityGate::new(security_config, events.clone(), verifier);
    let mut sub = events.subscribe(Topic::Security);

    let mut accepted = 0;
    let mut rejected = 0;
    for _ in 0..12 {
        match gate.authorize(&identity, "task.submit", None).await {
            Ok(()) => accepted += 1,
            Err(ArbiterError::RateLimited { retry_after_ms }) => {
                assert!(retry_after_ms >= 1000);
                rejected += 1;
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(accepted, 10);
    assert_eq!(rejected, 2);

    for _ in 0..2 {
        match sub.recv().await.unwrap().payload {
            Payload::SecurityRateLimitExceeded { operation, .. } => assert_eq!(operation, "task.submit"),
            other => panic!("expected security.rate_limit_exceeded, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn cross_tenant_get_profile_is_forbidden_without_extra_role() {
    let events = Arc::new(EventBus::new(64));
    let identity = Identity {
        identity: "user-a".into(),
        tenant: "T-A".into(),
        roles: vec!["admin".into()],
    };
    let mut tokens = HashMap::new();
    tokens.insert("tok".to_string(), identity.clone());
    let verifier = Arc::new(StaticTokenVerifier::new(tokens));
    let gate = SecurityGate::new(SecurityConfig::default(), events.clone(), verifier);
    let mut sub = events.subscribe(Topic::Security);

    let target = AgentId::new("T-B:alpha");
    let err = gate.authorize(&identity, "agent.query", target.tenant()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);

    match sub.recv().await.unwrap().payload {
        Payload::SecurityAuthzFailed { operation, .. } => assert_eq!(operation, "agent.query"),
        other => panic!("expected security.authz_failed, got {other:?}"),
    }
}

#[test]
fn tier1_coverage_shortfall_fails_while_budget_and_acceptance_pass() {
    let config = VerdictConfig::default();
    let spec = WorkingSpec {
        id: "spec-1".into(),
        risk_tier: RiskTier::Tier1,
        mode: "default".into(),
        blast_radius: "low".into(),
        scope: Scope::default(),
        invariants: vec![],
        acceptance: vec![AcceptanceCriterion {
            id: "ac-1".into(),
            given: "a file needing edits".into(),
            when: "the agent submits its change".into(),
            then: "the change compiles".into(),
        }],
        non_functional: NonFunctionalTarget::default(),
        contracts: vec![],
        waiver: None,
    };
    let budget = TaskBudget {
        max_files: Some(10),
        max_loc: Some(1_000),
        max_tokens: None,
    };
    let artifacts = Artifacts {
        coverage: Some(0.85),
        files_touched: 5,
        loc_touched: 600,
        acceptance_results: vec![AcceptanceResult {
            criterion_id: "ac-1".into(),
            passed: true,
        }],
        ..Artifacts::default()
    };

    let verdict = VerdictGenerator::new(&config).evaluate(&spec, &budget, &artifacts, "verdict-generator");
    assert_eq!(verdict.decision, Decision::Fail);

    let coverage_gate = verdict.gate_results.iter().find(|g| g.gate == "coverage").unwrap();
    assert!(!coverage_gate.pass);
    let budget_gate = verdict.gate_results.iter().find(|g| g.gate == "budget").unwrap();
    assert!(budget_gate.pass);
    let acceptance_gate = verdict.gate_results.iter().find(|g| g.gate == "acceptance").unwrap();
    assert!(acceptance_gate.pass);

    assert!(verdict.reasons.iter().any(|r| r.starts_with("coverage")));
}
