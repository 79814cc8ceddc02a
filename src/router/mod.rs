//! Router (C6): a pure function from `(task, candidates, exclusions)` to
//! an agent. Never touches the store or the event bus — `explain()`
//! results are for audit events emitted by the orchestrator, not for
//! routing correctness.

use crate::models::{Agent, AgentId};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone)]
pub struct CandidateScore {
    pub agent_id: AgentId,
    pub match_score: f64,
    pub load_score: f64,
    pub recency_score: f64,
    pub total: f64,
}

const WEIGHT_MATCH: f64 = 0.60;
const WEIGHT_LOAD: f64 = 0.25;
const WEIGHT_RECENCY: f64 = 0.15;

/// `last_assigned_at` is keyed by agent id; agents absent from the map
/// are treated as never assigned (maximal recency bonus).
pub struct Router<'a> {
    pub last_assigned_at: &'a HashMap<AgentId, chrono::DateTime<chrono::Utc>>,
}

impl<'a> Router<'a> {
    pub fn new(last_assigned_at: &'a HashMap<AgentId, chrono::DateTime<chrono::Utc>>) -> Self {
        Self { last_assigned_at }
    }

    fn score(&self, agent: &Agent, match_score: f64, now: chrono::DateTime<chrono::Utc>) -> CandidateScore {
        let load_score = 1.0 - agent.load.utilization_percent / 100.0;
        let recency_score = match self.last_assigned_at.get(&agent.id) {
            Some(last) => {
                let elapsed = (now - *last).num_milliseconds().max(0) as f64;
                // Saturates at 1.0 after five minutes idle.
                (elapsed / 300_000.0).min(1.0)
            }
            None => 1.0,
        };
        let total = WEIGHT_MATCH * match_score + WEIGHT_LOAD * load_score + WEIGHT_RECENCY * recency_score;
        CandidateScore {
            agent_id: agent.id.clone(),
            match_score,
            load_score,
            recency_score,
            total,
        }
    }

    /// `candidates` is `(agent, matchScore)` from the registry's
    /// `queryByCapability`. Excluded agents are dropped entirely before
    /// scoring. Ties break on lexicographically smallest agent id.
    pub fn route(&self, candidates: &[(Agent, f64)], exclusions: &HashSet<AgentId>) -> Option<AgentId> {
        self.rank(candidates, exclusions, 1).into_iter().next().map(|c| c.agent_id)
    }

    /// Top `n` candidates with their component scores, for audit events.
    /// Never consulted by `route` for correctness.
    pub fn explain(&self, candidates: &[(Agent, f64)], exclusions: &HashSet<AgentId>, n: usize) -> Vec<CandidateScore> {
        self.rank(candidates, exclusions, n)
    }

    fn rank(&self, candidates: &[(Agent, f64)], exclusions: &HashSet<AgentId>, n: usize) -> Vec<CandidateScore> {
        let now = chrono::Utc::now();
        let mut scored: Vec<CandidateScore> = candidates
            .iter()
            .filter(|(agent, _)| !exclusions.contains(&agent.id))
            .map(|(agent, match_score)| self.score(agent, *match_score, now))
            .collect();
        scored.sort_by(|a, b| {
            b.total
                .partial_cmp(&a.total)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.agent_id.0.cmp(&b.agent_id.0))
        });
        scored.truncate(n.max(1));
        scored
    }
}
