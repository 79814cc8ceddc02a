//! Core data model: [`Agent`], [`Task`], [`Assignment`], [`WorkingSpec`],
//! [`Verdict`] and their constituent types, per the data model section of
//! the orchestrator design. These types are owned exclusively by the
//! component named in their doc comment; every other component holds
//! snapshots (`Clone`d values), never live references.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Opaque, globally-unique agent identifier. In a multi-tenant deployment
/// this is `<tenant>:<local>`; [`AgentId::tenant`] extracts the prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Tenant prefix, if this id is of the form `tenant:local`.
    pub fn tenant(&self) -> Option<&str> {
        self.0.split_once(':').map(|(tenant, _)| tenant)
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecializationLevel {
    Novice,
    Intermediate,
    Expert,
    Master,
}

/// One entry of `specializations` (V2 shape, per the spec's resolved
/// open question: the legacy shape without `averageQuality` is not
/// implemented).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Specialization {
    pub task_type: String,
    pub level: SpecializationLevel,
    pub success_rate: f64,
    pub task_count: u64,
    pub average_quality: f64,
}

impl Specialization {
    pub fn novice(task_type: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            level: SpecializationLevel::Novice,
            success_rate: 0.0,
            task_count: 0,
            average_quality: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Capabilities {
    pub task_types: HashSet<String>,
    pub languages: HashSet<String>,
    pub specializations: Vec<Specialization>,
}

/// Running-mean performance history, maintained with Welford-style
/// incremental updates (count + mean, never a stored sample list).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceHistory {
    pub success_rate: f64,
    pub average_quality: f64,
    pub average_latency_ms: f64,
    pub task_count: u64,
}

impl Default for PerformanceHistory {
    fn default() -> Self {
        Self {
            success_rate: 0.0,
            average_quality: 0.0,
            average_latency_ms: 0.0,
            task_count: 0,
        }
    }
}

impl PerformanceHistory {
    /// Applies one sample using the incremental mean rule: new_mean =
    /// old_mean + (sample - old_mean) / (task_count + 1), then increments
    /// `task_count`. `success` contributes sample 1.0/0.0 to `success_rate`.
    pub fn record(&mut self, success: bool, quality: f64, latency_ms: f64) {
        let n = self.task_count + 1;
        let success_sample = if success { 1.0 } else { 0.0 };
        self.success_rate += (success_sample - self.success_rate) / n as f64;
        self.average_quality += (quality - self.average_quality) / n as f64;
        self.average_latency_ms += (latency_ms - self.average_latency_ms) / n as f64;
        self.task_count = n;
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentLoad {
    pub active_tasks: u32,
    pub queued_tasks: u32,
    pub utilization_percent: f64,
}

impl AgentLoad {
    /// Recomputes the derived `utilization_percent` field; must be called
    /// after every mutation of `active_tasks` so it never drifts from its
    /// inputs.
    pub fn recompute(&mut self, max_concurrent: u32) {
        let max_concurrent = max_concurrent.max(1);
        let pct = 100.0 * self.active_tasks as f64 / max_concurrent as f64;
        self.utilization_percent = pct.clamp(0.0, 100.0);
    }

    /// Applies a signed delta to active/queued counters, clamping at zero
    /// on underflow rather than erroring, then recomputes utilization.
    pub fn apply_delta(&mut self, delta_active: i64, delta_queued: i64, max_concurrent: u32) {
        self.active_tasks = clamp_add(self.active_tasks, delta_active);
        self.queued_tasks = clamp_add(self.queued_tasks, delta_queued);
        self.recompute(max_concurrent);
    }
}

fn clamp_add(value: u32, delta: i64) -> u32 {
    let result = value as i64 + delta;
    result.max(0) as u32
}

/// Owned exclusively by the Agent Registry. All other components hold
/// `Clone`d snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    pub model_family: String,
    pub description: Option<String>,
    pub capabilities: Capabilities,
    pub performance: PerformanceHistory,
    pub load: AgentLoad,
    pub max_concurrent: u32,
    pub registered_at: chrono::DateTime<chrono::Utc>,
    pub last_active_at: chrono::DateTime<chrono::Utc>,
}

impl Agent {
    pub fn new(id: AgentId, name: impl Into<String>, model_family: impl Into<String>) -> Self {
        let now = chrono::Utc::now();
        Self {
            id,
            name: name.into(),
            model_family: model_family.into(),
            description: None,
            capabilities: Capabilities::default(),
            performance: PerformanceHistory::default(),
            load: AgentLoad::default(),
            max_concurrent: 1,
            registered_at: now,
            last_active_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low = 1,
    Normal = 2,
    High = 3,
    Critical = 4,
}

impl Priority {
    pub fn ordinal(self) -> u8 {
        self as u8
    }

    pub fn bump(self) -> Self {
        match self {
            Priority::Low => Priority::Normal,
            Priority::Normal => Priority::High,
            Priority::High | Priority::Critical => Priority::Critical,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskBudget {
    pub max_files: Option<u32>,
    pub max_loc: Option<u32>,
    pub max_tokens: Option<u32>,
}

/// Owned by the submitter until enqueued; `attempts` is the only field the
/// orchestrator is allowed to mutate afterward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    pub task_type: String,
    pub priority: Priority,
    pub timeout_ms: u64,
    pub budget: TaskBudget,
    pub required_capabilities: Capabilities,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub metadata: HashMap<String, String>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub tenant: Option<String>,
    /// Carried onto the [`Assignment`] at assignment time so the Verdict
    /// Generator (C7) can evaluate the gates that apply to this task
    /// without a separate task lookup. `None` falls back to
    /// [`WorkingSpec::trivial`].
    #[serde(default)]
    pub working_spec: Option<WorkingSpec>,
    /// Identity of the caller who submitted this task, used to authorize
    /// a non-admin's own `cancel` request against the assignment's task
    /// snapshot. `None` for tasks built outside the API (tests, internal
    /// retries).
    #[serde(default)]
    pub submitted_by: Option<String>,
}

impl Task {
    pub fn new(description: impl Into<String>, task_type: impl Into<String>, priority: Priority) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            description: description.into(),
            task_type: task_type.into(),
            priority,
            timeout_ms: 30_000,
            budget: TaskBudget::default(),
            required_capabilities: Capabilities::default(),
            created_at: chrono::Utc::now(),
            metadata: HashMap::new(),
            attempts: 0,
            max_attempts: 3,
            tenant: None,
            working_spec: None,
            submitted_by: None,
        }
    }

    pub fn metadata_size_bytes(&self) -> usize {
        self.metadata
            .iter()
            .map(|(k, v)| k.len() + v.len())
            .sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentState {
    Pending,
    Assigned,
    Running,
    Verifying,
    Completed,
    Failed,
    Cancelled,
}

impl AssignmentState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AssignmentState::Completed | AssignmentState::Failed | AssignmentState::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutType {
    Acknowledgment,
    Progress,
    Execution,
}

/// Owned exclusively by the Task Orchestrator (C5). `task` is a snapshot
/// of the [`Task`] as it stood at assignment time, including the
/// attempt count this assignment represents. The orchestrator treats
/// the assignment as the resolved, durable plan for a task, not a
/// pointer back to a separate task store, which is what lets a timed-out
/// or failed-but-retriable assignment be turned back into a requeueable
/// `Task` without a second lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub id: String,
    pub task_id: String,
    pub agent_id: AgentId,
    pub state: AssignmentState,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub ack_deadline: chrono::DateTime<chrono::Utc>,
    pub exec_deadline: chrono::DateTime<chrono::Utc>,
    pub last_progress_at: chrono::DateTime<chrono::Utc>,
    pub attempt_number: u32,
    pub previous_assignment_ids: Vec<String>,
    pub progress: f64,
    pub acknowledged_at: Option<chrono::DateTime<chrono::Utc>>,
    pub artifacts: Option<Artifacts>,
    pub verdict: Option<Verdict>,
    pub timeout_type: Option<TimeoutType>,
    pub task: Task,
}

impl Assignment {
    pub fn new(task: Task, agent_id: AgentId, attempt_number: u32, ack_window_ms: u64, exec_timeout_ms: u64, previous_assignment_ids: Vec<String>) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            task_id: task.id.clone(),
            agent_id,
            state: AssignmentState::Assigned,
            created_at: now,
            ack_deadline: now + chrono::Duration::milliseconds(ack_window_ms as i64),
            exec_deadline: now + chrono::Duration::milliseconds(exec_timeout_ms as i64),
            last_progress_at: now,
            attempt_number,
            previous_assignment_ids,
            progress: 0.0,
            acknowledged_at: None,
            artifacts: None,
            verdict: None,
            timeout_type: None,
            task,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Artifacts {
    pub coverage: Option<f64>,
    pub mutation_kill_rate: Option<f64>,
    pub lint_pass: Option<bool>,
    pub type_check_pass: Option<bool>,
    pub files_touched: u32,
    pub loc_touched: u32,
    pub acceptance_results: Vec<AcceptanceResult>,
    pub measured_p95_latency_ms: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptanceResult {
    pub criterion_id: String,
    pub passed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    Tier1 = 1,
    Tier2 = 2,
    Tier3 = 3,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptanceCriterion {
    pub id: String,
    pub given: String,
    pub when: String,
    pub then: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NonFunctionalTarget {
    pub p95_latency_ms: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Scope {
    pub r#in: Vec<String>,
    pub out: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkingSpec {
    pub id: String,
    pub risk_tier: RiskTier,
    pub mode: String,
    pub blast_radius: String,
    pub scope: Scope,
    pub invariants: Vec<String>,
    pub acceptance: Vec<AcceptanceCriterion>,
    pub non_functional: NonFunctionalTarget,
    pub contracts: Vec<String>,
    pub waiver: Option<Waiver>,
}

impl WorkingSpec {
    /// The spec used when a submitter doesn't attach one: lowest risk
    /// tier, no acceptance criteria or non-functional target, so every
    /// gate except coverage and budget passes trivially.
    pub fn trivial(task_id: impl Into<String>) -> Self {
        Self {
            id: task_id.into(),
            risk_tier: RiskTier::Tier3,
            mode: "default".into(),
            blast_radius: "low".into(),
            scope: Scope::default(),
            invariants: vec![],
            acceptance: vec![],
            non_functional: NonFunctionalTarget::default(),
            contracts: vec![],
            waiver: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Waiver {
    pub reason: String,
    pub approved_by: String,
    pub expires_at: chrono::DateTime<chrono::Utc>,
    pub signature: String,
}

impl Waiver {
    pub fn is_valid(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        now < self.expires_at && !self.signature.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Pass,
    Fail,
    Waiver,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateResult {
    pub gate: String,
    pub pass: bool,
    pub contribution: f64,
    pub weight: f64,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub decision: Decision,
    pub quality_score: f64,
    pub gate_results: Vec<GateResult>,
    pub reasons: Vec<String>,
    pub produced_by: String,
    pub produced_at: chrono::DateTime<chrono::Utc>,
    pub waiver_reason: Option<String>,
}
