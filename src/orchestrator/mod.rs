//! Task Orchestrator (C5): owns the assignment state machine end to
//! end — assignment, acknowledgment, progress, submission, verdict, the
//! three independent timeout deadlines, reassignment, and cancellation.
//! Each assignment is single-writer: a per-assignment lock serializes
//! timer firings against external callbacks for the same assignment.
//! Lock acquisition order is strictly queue, then registry, then
//! assignment, then store — never the reverse.

use crate::config::OrchestratorConfig;
use crate::events::{Event, EventBus, Payload, Severity, Topic};
use crate::error::{ArbiterError, Result};
use crate::models::{Agent, AgentId, Artifacts, Assignment, AssignmentState, Decision, TimeoutType, Verdict, WorkingSpec};
use crate::queue::TaskQueue;
use crate::registry::{AgentRegistry, CapabilityQuery, PerformanceSample};
use crate::router::Router;
use crate::store::durable::DurableStore;
use crate::store::ResilientStore;
use crate::verdict::VerdictGenerator;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct TaskOrchestrator<AS, SS>
where
    AS: DurableStore<Agent> + 'static,
    SS: DurableStore<Assignment> + 'static,
{
    config: OrchestratorConfig,
    queue: Arc<TaskQueue>,
    registry: Arc<AgentRegistry<AS>>,
    assignments: Arc<ResilientStore<Assignment, SS>>,
    assignment_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    last_assigned_at: Mutex<HashMap<AgentId, chrono::DateTime<chrono::Utc>>>,
    exclusions: Mutex<HashMap<String, HashSet<AgentId>>>,
    /// Assignment ids seen so far for a given task id, oldest first, so a
    /// reassignment can report which assignment it supersedes.
    history: Mutex<HashMap<String, Vec<String>>>,
    events: Arc<EventBus>,
}

impl<AS, SS> TaskOrchestrator<AS, SS>
where
    AS: DurableStore<Agent> + 'static,
    SS: DurableStore<Assignment> + 'static,
{
    pub fn new(
        config: OrchestratorConfig,
        queue: Arc<TaskQueue>,
        registry: Arc<AgentRegistry<AS>>,
        assignments: Arc<ResilientStore<Assignment, SS>>,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            queue,
            registry,
            assignments,
            assignment_locks: Mutex::new(HashMap::new()),
            last_assigned_at: Mutex::new(HashMap::new()),
            exclusions: Mutex::new(HashMap::new()),
            history: Mutex::new(HashMap::new()),
            events,
        })
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn registry(&self) -> &Arc<AgentRegistry<AS>> {
        &self.registry
    }

    pub async fn assignment_store_health(&self) -> crate::store::HealthCheck {
        self.assignments.health_check().await
    }

    pub async fn list_assignments(&self) -> Result<Vec<Assignment>> {
        Ok(self.assignments.scan("").await?.into_iter().map(|(_, a, _)| a).collect())
    }

    async fn lock_for(&self, assignment_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.assignment_locks.lock().await;
        locks
            .entry(assignment_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Dequeues the next task (C4) and assigns it to the best-matching
    /// non-excluded agent (C2 + C6). Re-queues with a small penalty delay
    /// when no eligible agent is found, unless attempts are exhausted.
    pub async fn assign_next(&self) -> Result<Option<Assignment>> {
        let Some(dequeued) = self.queue.dequeue().await else {
            return Ok(None);
        };
        let mut task = dequeued.task;

        let excluded = self.exclusions.lock().await.get(&task.id).cloned().unwrap_or_default();
        let query = CapabilityQuery {
            task_type: task.task_type.clone(),
            ..Default::default()
        };
        let candidates = self.registry.query_by_capability(&query).await?;
        let scored: Vec<(Agent, f64)> = candidates
            .into_iter()
            .map(|c| (c.agent, c.match_score))
            .collect();

        let last_assigned = self.last_assigned_at.lock().await.clone();
        let router = Router::new(&last_assigned);
        let chosen = router.route(&scored, &excluded);

        let Some(agent_id) = chosen else {
            task.attempts += 1;
            if task.attempts >= task.max_attempts {
                return Err(ArbiterError::NoEligibleAgent { task_id: task.id.clone() });
            }
            tokio::time::sleep(self.config.reassignment_penalty_delay).await;
            self.queue.enqueue(task).await?;
            return Ok(None);
        };

        let attempt_number = task.attempts + 1;
        if task.working_spec.is_none() {
            task.working_spec = Some(WorkingSpec::trivial(task.id.clone()));
        }

        let mut history = self.history.lock().await;
        let previous_ids = history.entry(task.id.clone()).or_default();
        let previous_assignment_id = previous_ids.last().cloned();
        let assignment = Assignment::new(
            task.clone(),
            agent_id.clone(),
            attempt_number,
            self.config.ack_window.as_millis() as u64,
            task.timeout_ms,
            previous_ids.clone(),
        );
        previous_ids.push(assignment.id.clone());
        drop(history);

        self.assignments.write(&assignment.id, assignment.clone(), false).await?;
        self.registry.update_load(&agent_id, 1, 0).await?;
        self.last_assigned_at.lock().await.insert(agent_id.clone(), chrono::Utc::now());

        let payload = match previous_assignment_id {
            Some(old_assignment_id) => Payload::TaskReassigned {
                old_assignment_id,
                new_assignment_id: assignment.id.clone(),
                new_agent_id: agent_id.0.clone(),
                attempt_number,
            },
            None => Payload::TaskAssigned {
                task_id: task.id.clone(),
                agent_id: agent_id.0.clone(),
                assignment_id: assignment.id.clone(),
                attempt_number,
            },
        };
        self.events.publish(Event::new(Topic::Task, assignment.id.clone(), Severity::Info, payload));
        Ok(Some(assignment))
    }

    async fn load_assignment(&self, assignment_id: &str) -> Result<Assignment> {
        self.assignments.read(assignment_id).await.map(|r| r.value)
    }

    async fn save_assignment(&self, assignment: &Assignment) -> Result<()> {
        self.assignments.write(&assignment.id, assignment.clone(), false).await.map(|_| ())
    }

    /// The agent id an assignment is currently held by, read straight from
    /// the store with no per-assignment lock: callers use it only to decide
    /// whether to bother starting a locked transaction at all.
    async fn agent_id_for(&self, assignment_id: &str) -> Result<AgentId> {
        Ok(self.load_assignment(assignment_id).await?.agent_id)
    }

    /// An agent that was unregistered mid-assignment (crash, eviction,
    /// operator action) must not keep acking, progressing, or submitting
    /// against work it no longer owns.
    async fn ensure_agent_present(&self, agent_id: &AgentId) -> Result<()> {
        match self.registry.get_profile(agent_id).await {
            Ok(_) => Ok(()),
            Err(ArbiterError::NotFound(_)) => Err(ArbiterError::AgentGone(agent_id.0.clone())),
            Err(err) => Err(err),
        }
    }

    /// Unregisters the agent (C2) and cascade-deletes its finished
    /// assignments, the way `AgentRegistry::unregister` alone cannot: only
    /// the orchestrator holds a handle to both the registry and the
    /// assignment store.
    pub async fn unregister_agent(&self, id: &AgentId) -> Result<bool> {
        let removed = self.registry.unregister(id).await?;
        if removed {
            let assignments = self.list_assignments().await?;
            for assignment in assignments {
                if &assignment.agent_id == id && assignment.state.is_terminal() {
                    self.assignments.delete(&assignment.id).await?;
                }
            }
        }
        Ok(removed)
    }

    pub async fn ack(&self, assignment_id: &str, caller: &AgentId, extension_ms: Option<u64>) -> Result<Assignment> {
        self.ensure_agent_present(caller).await?;

        let guard = self.lock_for(assignment_id).await;
        let _held = guard.lock().await;

        let mut assignment = self.load_assignment(assignment_id).await?;
        if assignment.state != AssignmentState::Assigned {
            return Err(ArbiterError::Conflict(format!("assignment {assignment_id} is not in Assigned state")));
        }
        if &assignment.agent_id != caller {
            return Err(ArbiterError::Forbidden(format!("{caller} is not the assigned agent")));
        }

        let now = chrono::Utc::now();
        assignment.state = AssignmentState::Running;
        assignment.acknowledged_at = Some(now);
        if let Some(extension) = extension_ms {
            let extension = extension.min(self.config.max_extension.as_millis() as u64);
            assignment.exec_deadline += chrono::Duration::milliseconds(extension as i64);
        }
        self.save_assignment(&assignment).await?;

        self.events.publish(Event::new(
            Topic::Task,
            assignment.id.clone(),
            Severity::Debug,
            Payload::TaskAcknowledged {
                assignment_id: assignment.id.clone(),
                acknowledgment_time_ms: (now - assignment.created_at).num_milliseconds(),
            },
        ));
        Ok(assignment)
    }

    pub async fn progress(&self, assignment_id: &str, progress: f64) -> Result<Assignment> {
        self.ensure_agent_present(&self.agent_id_for(assignment_id).await?).await?;

        let guard = self.lock_for(assignment_id).await;
        let _held = guard.lock().await;

        let mut assignment = self.load_assignment(assignment_id).await?;
        if assignment.state != AssignmentState::Running {
            return Err(ArbiterError::Conflict(format!("assignment {assignment_id} is not Running")));
        }
        if progress < assignment.progress {
            return Err(ArbiterError::Validation("progress must be monotonically non-decreasing".into()));
        }
        assignment.progress = progress.clamp(0.0, 1.0);
        assignment.last_progress_at = chrono::Utc::now();
        self.save_assignment(&assignment).await?;

        self.events.publish(Event::new(
            Topic::Task,
            assignment.id.clone(),
            Severity::Debug,
            Payload::TaskProgress {
                assignment_id: assignment.id.clone(),
                progress: assignment.progress,
            },
        ));
        Ok(assignment)
    }

    /// `spec`/`budget`/`max_attempts` come from the assignment's own task
    /// snapshot, not from the caller, so a worker can't misreport its own
    /// gate inputs.
    ///
    /// The assignment lock is held only across the Assignment+Store
    /// transition to `Verifying`; the verdict's registry and queue side
    /// effects run afterward with the lock released, so Registry/Queue are
    /// never acquired while the per-assignment lock is held.
    pub async fn submit(&self, assignment_id: &str, artifacts: Artifacts, verdict_generator: &VerdictGenerator<'_>) -> Result<Assignment> {
        self.ensure_agent_present(&self.agent_id_for(assignment_id).await?).await?;

        let mut assignment = {
            let guard = self.lock_for(assignment_id).await;
            let _held = guard.lock().await;

            let mut assignment = self.load_assignment(assignment_id).await?;
            if assignment.state != AssignmentState::Running {
                return Err(ArbiterError::Conflict(format!("assignment {assignment_id} is not Running")));
            }
            assignment.state = AssignmentState::Verifying;
            assignment.artifacts = Some(artifacts.clone());
            self.save_assignment(&assignment).await?;
            assignment
        };

        let working_spec = assignment.task.working_spec.clone().unwrap_or_else(|| WorkingSpec::trivial(assignment.task_id.clone()));
        let verdict = verdict_generator.evaluate(&working_spec, &assignment.task.budget, &artifacts, "verdict-generator");
        assignment.verdict = Some(verdict.clone());
        self.close_with_verdict(&mut assignment, verdict).await?;
        Ok(assignment)
    }

    /// Applies a verdict's terminal transition. Registry calls happen with
    /// no assignment lock held; the assignment lock is re-taken only for
    /// the final Assignment+Store write, and the queue re-enqueue (on a
    /// retriable failure) happens after that lock is released again.
    async fn close_with_verdict(&self, assignment: &mut Assignment, verdict: Verdict) -> Result<()> {
        let success = matches!(verdict.decision, Decision::Pass | Decision::Waiver);
        let latency_ms = (chrono::Utc::now() - assignment.created_at).num_milliseconds().max(0) as f64;
        let sample = PerformanceSample { success, quality: verdict.quality_score, latency_ms };
        self.registry.update_performance(&assignment.agent_id, sample).await?;
        self.decrement_load_once(assignment).await?;

        let retriable = match verdict.decision {
            Decision::Pass | Decision::Waiver => {
                assignment.state = AssignmentState::Completed;
                false
            }
            Decision::Fail => {
                assignment.state = AssignmentState::Failed;
                assignment.attempt_number < assignment.task.max_attempts
            }
        };

        {
            let guard = self.lock_for(&assignment.id).await;
            let _held = guard.lock().await;
            self.save_assignment(assignment).await?;
        }

        match verdict.decision {
            Decision::Pass | Decision::Waiver => {
                self.events.publish(Event::new(
                    Topic::Task,
                    assignment.id.clone(),
                    Severity::Info,
                    Payload::TaskCompleted {
                        assignment_id: assignment.id.clone(),
                        task_id: assignment.task_id.clone(),
                        quality_score: verdict.quality_score,
                    },
                ));
            }
            Decision::Fail => {
                self.events.publish(Event::new(
                    Topic::Task,
                    assignment.id.clone(),
                    Severity::Warn,
                    Payload::TaskFailed {
                        assignment_id: assignment.id.clone(),
                        task_id: assignment.task_id.clone(),
                        reason: verdict.reasons.join("; "),
                        retriable,
                    },
                ));
                if retriable {
                    self.exclude_and_requeue(assignment).await?;
                }
            }
        }
        Ok(())
    }

    /// Excludes the assignment's agent from the next routing attempt and
    /// puts a fresh [`Task`] attempt back on the queue so `assign_next`
    /// picks it up. Used by both a retriable verdict failure and a
    /// retriable timeout; the task id (and therefore its place in
    /// `exclusions`/`history`) is unchanged across attempts.
    async fn exclude_and_requeue(&self, assignment: &Assignment) -> Result<()> {
        self.exclusions
            .lock()
            .await
            .entry(assignment.task_id.clone())
            .or_default()
            .insert(assignment.agent_id.clone());

        let mut next_task = assignment.task.clone();
        next_task.attempts = assignment.attempt_number;
        self.queue.enqueue(next_task).await
    }

    /// The state-machine guard (caller always holds the assignment lock
    /// and the state has already transitioned to terminal before this is
    /// called) makes this decrement idempotent: it only ever runs once
    /// per terminal transition.
    async fn decrement_load_once(&self, assignment: &Assignment) -> Result<()> {
        self.registry.update_load(&assignment.agent_id, -1, 0).await.map(|_| ())
    }

    /// Applies whichever of the three independent deadlines has elapsed.
    /// No-op if the assignment is already terminal or no deadline fired.
    /// Registry and queue calls happen after the assignment lock that
    /// records the `Failed` transition is released.
    pub async fn check_timeouts(&self, assignment_id: &str) -> Result<Option<Assignment>> {
        if let Ok(agent_id) = self.agent_id_for(assignment_id).await {
            self.ensure_agent_present(&agent_id).await?;
        }

        let assignment = {
            let guard = self.lock_for(assignment_id).await;
            let _held = guard.lock().await;

            let mut assignment = self.load_assignment(assignment_id).await?;
            if assignment.state.is_terminal() {
                return Ok(None);
            }
            let now = chrono::Utc::now();

            let fired = if assignment.state == AssignmentState::Assigned && now >= assignment.ack_deadline {
                Some(TimeoutType::Acknowledgment)
            } else if assignment.state == AssignmentState::Running {
                let progress_idle = now - assignment.last_progress_at
                    > chrono::Duration::from_std(self.config.progress_idle_timeout).unwrap_or(chrono::Duration::MAX);
                if now >= assignment.exec_deadline {
                    Some(TimeoutType::Execution)
                } else if progress_idle {
                    Some(TimeoutType::Progress)
                } else {
                    None
                }
            } else {
                None
            };

            let Some(timeout_type) = fired else {
                return Ok(None);
            };

            assignment.state = AssignmentState::Failed;
            assignment.timeout_type = Some(timeout_type);
            self.save_assignment(&assignment).await?;
            assignment
        };

        self.decrement_load_once(&assignment).await?;

        self.events.publish(Event::new(
            Topic::Task,
            assignment.id.clone(),
            Severity::Warn,
            Payload::TaskTimeout {
                assignment_id: assignment.id.clone(),
                timeout_type: format!("{:?}", assignment.timeout_type.expect("timeout_type set above")),
            },
        ));

        if assignment.attempt_number < assignment.task.max_attempts {
            self.exclude_and_requeue(&assignment).await?;
        }
        Ok(Some(assignment))
    }

    /// `caller_id` must match the task's `submitted_by` snapshot unless
    /// `is_admin`. Registry's load decrement runs after the assignment
    /// lock that records the `Cancelled` transition is released.
    pub async fn cancel(&self, assignment_id: &str, caller_id: &str, is_admin: bool) -> Result<Assignment> {
        let assignment = {
            let guard = self.lock_for(assignment_id).await;
            let _held = guard.lock().await;

            let mut assignment = self.load_assignment(assignment_id).await?;
            if !is_admin && assignment.task.submitted_by.as_deref() != Some(caller_id) {
                return Err(ArbiterError::Forbidden("only the submitter or an admin may cancel".into()));
            }
            if assignment.state.is_terminal() {
                return Err(ArbiterError::Conflict(format!("assignment {assignment_id} is already terminal")));
            }
            assignment.state = AssignmentState::Cancelled;
            self.save_assignment(&assignment).await?;
            assignment
        };

        self.decrement_load_once(&assignment).await?;
        Ok(assignment)
    }
}
