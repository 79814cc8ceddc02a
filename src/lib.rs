//! # Arbiter
//!
//! Arbiter is a multi-agent task orchestrator: a priority queue of work
//! feeds a registry of capability-scored agents through a router, under a
//! resilient store that keeps serving reads and queues writes through
//! durable-layer outages, with a verdict generator gating completion on
//! coverage, budget, acceptance, and non-functional criteria.
//!
//! ## Architecture
//!
//! - **Resilient Store (C1)**: circuit breaker, retry, and shadow cache in
//!   front of any [`store::durable::DurableStore`].
//! - **Agent Registry (C2)**: capability matching and performance history.
//! - **Security Gate (C3)**: authentication, role authorization, rate
//!   limiting, tenant isolation.
//! - **Task Queue (C4)**: bounded priority queue with admission control.
//! - **Task Orchestrator (C5)**: the assignment state machine.
//! - **Router (C6)**: pure scoring function from candidates to an agent.
//! - **Verdict Generator (C7)**: gate evaluation and quality scoring.
//! - **Event Bus (C8)**: typed, topic-partitioned pub/sub for every
//!   component's audit trail, optionally persisted by the event sink.

/// HTTP observer/status API and admin command endpoint
pub mod api;
/// Command-line surface
pub mod cli;
/// Configuration loading and validation
pub mod config;
/// Error types and the stable error taxonomy
pub mod error;
/// Append-only persistence of the event bus to JSON-Lines segments
pub mod event_sink;
/// Typed, topic-partitioned event bus
pub mod events;
/// Core data model: agents, tasks, assignments, working specs, verdicts
pub mod models;
/// Task Orchestrator: the assignment state machine
pub mod orchestrator;
/// Task Queue: bounded priority queue with admission control
pub mod queue;
/// Agent Registry: capability matching and performance history
pub mod registry;
/// Router: pure scoring function from candidates to an agent
pub mod router;
/// Security Gate: authentication, authorization, rate limiting
pub mod security;
/// Resilient Store: circuit breaker, retry, and shadow cache
pub mod store;
/// Verdict Generator: gate evaluation and quality scoring
pub mod verdict;

pub use error::{ArbiterError, Result};

mod tests;

/// Wires every component together over the in-memory durable store and
/// blocks on the API server, the way `spiral_core::main` wires its
/// `AgentOrchestrator` and `ApiServer` behind `tokio::select!`. A real
/// deployment would substitute a [`store::durable::DurableStore`]
/// implementation backed by an actual database for the two
/// `InMemoryDurableStore`s below; this crate ships only the test double.
pub async fn run_server(config: config::Config) -> Result<()> {
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use store::durable::InMemoryDurableStore;

    let events = Arc::new(events::EventBus::new(config.event_bus.subscriber_buffer));

    let sink = Arc::new(event_sink::EventSink::new(config.event_sink.clone(), events.clone()));
    sink.clone().spawn();

    let agent_store = Arc::new(InMemoryDurableStore::<models::Agent>::new());
    let registry = registry::AgentRegistry::new(agent_store, &config.store, events.clone());

    let queue = Arc::new(queue::TaskQueue::new(config.queue.clone(), events.clone()));

    let assignment_store = Arc::new(InMemoryDurableStore::<models::Assignment>::new());
    let assignments = store::ResilientStore::new("assignments", assignment_store, &config.store, events.clone());

    let orchestrator = orchestrator::TaskOrchestrator::new(
        config.orchestrator.clone(),
        queue.clone(),
        registry.clone(),
        assignments,
        events.clone(),
    );

    let mut tokens = std::collections::HashMap::new();
    if let Ok(token) = std::env::var("ARBITER_ADMIN_TOKEN") {
        tokens.insert(
            token,
            security::Identity {
                identity: "admin".into(),
                tenant: "default".into(),
                roles: vec!["admin".into(), "cross_tenant_admin".into()],
            },
        );
    } else {
        tracing::warn!("ARBITER_ADMIN_TOKEN not set, no caller will be able to authenticate");
    }
    let verifier = Arc::new(security::StaticTokenVerifier::new(tokens));
    let security = Arc::new(security::SecurityGate::new(config.security.clone(), events.clone(), verifier));

    let state = api::ApiState::new(orchestrator.clone(), registry.clone(), queue.clone(), security, events.clone(), config.verdict.clone());
    let api_server = api::ApiServer::new(config.api.clone(), state.clone());

    let accepting = state.accepting_flag();
    let dispatch_orchestrator = orchestrator.clone();
    let dispatch_loop = tokio::spawn(async move {
        loop {
            if accepting.load(Ordering::Relaxed) {
                match dispatch_orchestrator.assign_next().await {
                    Ok(Some(_)) => continue,
                    Ok(None) => {}
                    Err(err) => tracing::warn!(%err, "assignment attempt failed"),
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
    });

    let timeout_orchestrator = orchestrator.clone();
    let timeout_loop = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
        loop {
            ticker.tick().await;
            let Ok(assignments) = timeout_orchestrator.list_assignments().await else {
                continue;
            };
            for assignment in assignments {
                if !assignment.state.is_terminal() {
                    if let Err(err) = timeout_orchestrator.check_timeouts(&assignment.id).await {
                        tracing::warn!(%err, assignment_id = %assignment.id, "timeout check failed");
                    }
                }
            }
        }
    });

    tracing::info!(host = %config.api.host, port = config.api.port, "arbiter starting");
    let result = api_server.run().await;

    dispatch_loop.abort();
    timeout_loop.abort();
    sink.shutdown();
    result
}
