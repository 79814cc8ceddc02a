//! Observer/status read API and admin command endpoint (§6), built the
//! way `spiral-core::api::ApiServer` assembles its router: `axum` routes
//! layered with `tower-http`'s `TraceLayer`/`CorsLayer`, auth as a
//! `tower::Layer`-compatible `middleware::from_fn_with_state`. Unlike the
//! teacher, auth here delegates entirely to [`SecurityGate`] rather than
//! comparing a single static key.
//!
//! Read-only endpoints (`/status`, `/metrics`, `/progress`, `/events`)
//! only require a resolved identity; mutating endpoints additionally run
//! through `SecurityGate::authorize` for the named operation.

use crate::config::{ApiConfig, VerdictConfig};
use crate::error::{ArbiterError, ErrorKind, Result};
use crate::events::{Event, EventBus, Topic};
use crate::models::{Agent, AgentId, Artifacts, Assignment, AssignmentState, Priority, Task, TaskBudget};
use crate::orchestrator::TaskOrchestrator;
use crate::queue::TaskQueue;
use crate::registry::{AgentRegistry, RegisterMode};
use crate::security::{Identity, SecurityGate};
use crate::store::durable::DurableStore;
use crate::verdict::VerdictGenerator;
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

const SERVICE_NAME: &str = "arbiter";
const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

impl IntoResponse for ArbiterError {
    fn into_response(self) -> Response {
        let status = match self.kind() {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::Exhausted => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(ErrorResponse { error: self.code().to_string(), message: self.to_string() })).into_response()
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

/// Shared state behind every route. `accepting` is the `start`/`stop`
/// toggle the command endpoint flips; `assign_next` loops in `main` are
/// expected to check it before dequeuing.
pub struct ApiState<AS, SS>
where
    AS: DurableStore<Agent> + 'static,
    SS: DurableStore<Assignment> + 'static,
{
    pub orchestrator: Arc<TaskOrchestrator<AS, SS>>,
    pub registry: Arc<AgentRegistry<AS>>,
    pub queue: Arc<TaskQueue>,
    pub security: Arc<SecurityGate>,
    pub events: Arc<EventBus>,
    pub verdict: VerdictConfig,
    pub started_at: std::time::Instant,
    pub accepting: Arc<AtomicBool>,
}

impl<AS, SS> ApiState<AS, SS>
where
    AS: DurableStore<Agent> + 'static,
    SS: DurableStore<Assignment> + 'static,
{
    pub fn new(
        orchestrator: Arc<TaskOrchestrator<AS, SS>>,
        registry: Arc<AgentRegistry<AS>>,
        queue: Arc<TaskQueue>,
        security: Arc<SecurityGate>,
        events: Arc<EventBus>,
        verdict: VerdictConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            orchestrator,
            registry,
            queue,
            security,
            events,
            verdict,
            started_at: std::time::Instant::now(),
            accepting: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn accepting_flag(&self) -> Arc<AtomicBool> {
        self.accepting.clone()
    }
}

pub struct ApiServer<AS, SS>
where
    AS: DurableStore<Agent> + 'static,
    SS: DurableStore<Assignment> + 'static,
{
    config: ApiConfig,
    state: Arc<ApiState<AS, SS>>,
}

impl<AS, SS> ApiServer<AS, SS>
where
    AS: DurableStore<Agent> + 'static,
    SS: DurableStore<Assignment> + 'static,
{
    pub fn new(config: ApiConfig, state: Arc<ApiState<AS, SS>>) -> Self {
        Self { config, state }
    }

    pub async fn run(&self) -> Result<()> {
        let app = self.build_router();
        let listener = tokio::net::TcpListener::bind(format!("{}:{}", self.config.host, self.config.port))
            .await
            .map_err(ArbiterError::Io)?;
        info!("API server listening on {}:{}", self.config.host, self.config.port);
        axum::serve(listener, app.into_make_service())
            .await
            .map_err(ArbiterError::Io)?;
        Ok(())
    }

    pub fn build_router(&self) -> Router {
        let cors_layer = CorsLayer::new()
            .allow_origin(
                self.config
                    .allowed_origins
                    .iter()
                    .filter_map(|origin| origin.parse().ok())
                    .collect::<Vec<_>>(),
            )
            .allow_methods([axum::http::Method::GET, axum::http::Method::POST, axum::http::Method::DELETE])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
            .max_age(std::time::Duration::from_secs(3600));

        Router::new()
            .route("/status", get(get_status::<AS, SS>))
            .route("/metrics", get(get_metrics::<AS, SS>))
            .route("/progress", get(get_progress::<AS, SS>))
            .route("/events", get(get_events::<AS, SS>))
            .route("/tasks", post(submit_task::<AS, SS>))
            .route("/tasks/{id}", get(get_task::<AS, SS>))
            .route("/assignments/{id}/ack", post(ack_assignment::<AS, SS>))
            .route("/assignments/{id}/progress", post(progress_assignment::<AS, SS>))
            .route("/assignments/{id}/submit", post(submit_assignment::<AS, SS>))
            .route("/agents", post(register_agent::<AS, SS>))
            .route("/agents/{id}", delete(unregister_agent::<AS, SS>))
            .route("/control/{action}", post(control::<AS, SS>))
            .layer(
                ServiceBuilder::new()
                    .layer(middleware::from_fn_with_state(self.state.clone(), auth_middleware::<AS, SS>))
                    .layer(TraceLayer::new_for_http())
                    .layer(cors_layer),
            )
            .with_state(self.state.clone())
    }
}

async fn auth_middleware<AS, SS>(
    State(state): State<Arc<ApiState<AS, SS>>>,
    mut request: Request,
    next: Next,
) -> Response
where
    AS: DurableStore<Agent> + 'static,
    SS: DurableStore<Assignment> + 'static,
{
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let Some(token) = token else {
        return ArbiterError::Unauthorized.into_response();
    };
    match state.security.authenticate(token).await {
        Ok(identity) => {
            request.extensions_mut().insert(identity);
            next.run(request).await
        }
        Err(err) => err.into_response(),
    }
}

fn identity_of(request_extensions: &axum::http::Extensions) -> Result<Identity> {
    request_extensions.get::<Identity>().cloned().ok_or(ArbiterError::Unauthorized)
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    service: &'static str,
    version: &'static str,
    uptime_seconds: u64,
    accepting: bool,
    queue_depth: usize,
    registry_store: crate::store::HealthCheck,
    assignment_store: crate::store::HealthCheck,
}

async fn get_status<AS, SS>(State(state): State<Arc<ApiState<AS, SS>>>, request: Request) -> std::result::Result<Json<StatusResponse>, Response>
where
    AS: DurableStore<Agent> + 'static,
    SS: DurableStore<Assignment> + 'static,
{
    identity_of(request.extensions()).map_err(IntoResponse::into_response)?;
    Ok(Json(StatusResponse {
        service: SERVICE_NAME,
        version: SERVICE_VERSION,
        uptime_seconds: state.started_at.elapsed().as_secs(),
        accepting: state.accepting.load(Ordering::Relaxed),
        queue_depth: state.queue.size().await,
        registry_store: state.registry.health_check().await,
        assignment_store: state.orchestrator.assignment_store_health().await,
    }))
}

#[derive(Debug, Serialize)]
struct MetricsResponse {
    queue_depth: usize,
    registry_stats: RegistryStatsView,
    assignments_by_state: HashMap<String, usize>,
    dropped_events: HashMap<&'static str, u64>,
}

#[derive(Debug, Serialize)]
struct RegistryStatsView {
    total_agents: usize,
    average_success_rate: f64,
    average_utilization: f64,
}

async fn get_metrics<AS, SS>(State(state): State<Arc<ApiState<AS, SS>>>, request: Request) -> std::result::Result<Json<MetricsResponse>, Response>
where
    AS: DurableStore<Agent> + 'static,
    SS: DurableStore<Assignment> + 'static,
{
    identity_of(request.extensions()).map_err(IntoResponse::into_response)?;
    let stats = state.registry.get_stats().await.map_err(IntoResponse::into_response)?;
    let assignments = state.orchestrator.list_assignments().await.map_err(IntoResponse::into_response)?;

    let mut by_state: HashMap<String, usize> = HashMap::new();
    for assignment in &assignments {
        *by_state.entry(state_label(assignment.state).to_string()).or_insert(0) += 1;
    }

    let dropped_events = HashMap::from([
        (Topic::Task.as_str(), state.events.dropped_count(Topic::Task)),
        (Topic::Agent.as_str(), state.events.dropped_count(Topic::Agent)),
        (Topic::Security.as_str(), state.events.dropped_count(Topic::Security)),
        (Topic::System.as_str(), state.events.dropped_count(Topic::System)),
        (Topic::Caws.as_str(), state.events.dropped_count(Topic::Caws)),
    ]);

    Ok(Json(MetricsResponse {
        queue_depth: state.queue.size().await,
        registry_stats: RegistryStatsView {
            total_agents: stats.total_agents,
            average_success_rate: stats.average_success_rate,
            average_utilization: stats.average_utilization,
        },
        assignments_by_state: by_state,
        dropped_events,
    }))
}

fn state_label(state: AssignmentState) -> &'static str {
    match state {
        AssignmentState::Pending => "pending",
        AssignmentState::Assigned => "assigned",
        AssignmentState::Running => "running",
        AssignmentState::Verifying => "verifying",
        AssignmentState::Completed => "completed",
        AssignmentState::Failed => "failed",
        AssignmentState::Cancelled => "cancelled",
    }
}

#[derive(Debug, Serialize)]
struct ProgressResponse {
    assignments: Vec<Assignment>,
}

async fn get_progress<AS, SS>(State(state): State<Arc<ApiState<AS, SS>>>, request: Request) -> std::result::Result<Json<ProgressResponse>, Response>
where
    AS: DurableStore<Agent> + 'static,
    SS: DurableStore<Assignment> + 'static,
{
    identity_of(request.extensions()).map_err(IntoResponse::into_response)?;
    let assignments = state.orchestrator.list_assignments().await.map_err(IntoResponse::into_response)?;
    Ok(Json(ProgressResponse { assignments }))
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    topic: Option<String>,
}

/// The event bus has no retained log (publishers never block, so there is
/// nothing to replay); this endpoint long-polls for a bounded window and
/// returns whatever arrives. Callers after durable history want the event
/// sink's JSON-Lines files, not this endpoint.
async fn get_events<AS, SS>(
    State(state): State<Arc<ApiState<AS, SS>>>,
    Query(query): Query<EventsQuery>,
    request: Request,
) -> std::result::Result<Json<Vec<Event>>, Response>
where
    AS: DurableStore<Agent> + 'static,
    SS: DurableStore<Assignment> + 'static,
{
    identity_of(request.extensions()).map_err(IntoResponse::into_response)?;
    let topics = match query.topic.as_deref() {
        Some("task") => vec![Topic::Task],
        Some("agent") => vec![Topic::Agent],
        Some("security") => vec![Topic::Security],
        Some("system") => vec![Topic::System],
        Some("caws") => vec![Topic::Caws],
        _ => vec![Topic::Task, Topic::Agent, Topic::Security, Topic::System, Topic::Caws],
    };

    let (tx, mut rx) = tokio::sync::mpsc::channel(256);
    for topic in topics {
        let mut subscription = state.events.subscribe(topic);
        let tx = tx.clone();
        tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });
    }
    drop(tx);

    let mut collected = Vec::new();
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_millis(500);
    while collected.len() < 256 {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(event)) => collected.push(event),
            _ => break,
        }
    }
    Ok(Json(collected))
}

#[derive(Debug, Deserialize)]
struct SubmitTaskRequest {
    description: String,
    task_type: String,
    #[serde(default)]
    priority: Option<Priority>,
    #[serde(default)]
    timeout_ms: Option<u64>,
    #[serde(default)]
    budget: TaskBudget,
    #[serde(default)]
    max_attempts: Option<u32>,
    #[serde(default)]
    tenant: Option<String>,
}

#[derive(Debug, Serialize)]
struct SubmitTaskResponse {
    task_id: String,
}

async fn submit_task<AS, SS>(
    State(state): State<Arc<ApiState<AS, SS>>>,
    request: Request,
) -> std::result::Result<(StatusCode, Json<SubmitTaskResponse>), Response>
where
    AS: DurableStore<Agent> + 'static,
    SS: DurableStore<Assignment> + 'static,
{
    let identity = identity_of(request.extensions()).map_err(IntoResponse::into_response)?;
    let body: SubmitTaskRequest = parse_json(request.into_body()).await.map_err(IntoResponse::into_response)?;

    let tenant = body.tenant.clone().or_else(|| Some(identity.tenant.clone()));
    state
        .security
        .authorize(&identity, "task.submit", tenant.as_deref())
        .await
        .map_err(IntoResponse::into_response)?;

    if !state.accepting.load(Ordering::Relaxed) {
        return Err(ArbiterError::Unavailable("orchestrator is stopped, not accepting new tasks".into()).into_response());
    }

    let mut task = Task::new(body.description, body.task_type, body.priority.unwrap_or(Priority::Normal));
    if let Some(timeout_ms) = body.timeout_ms {
        task.timeout_ms = timeout_ms;
    }
    task.budget = body.budget;
    if let Some(max_attempts) = body.max_attempts {
        task.max_attempts = max_attempts;
    }
    task.tenant = tenant;
    task.submitted_by = Some(identity.identity.clone());

    let task_id = task.id.clone();
    state.queue.enqueue(task).await.map_err(IntoResponse::into_response)?;
    state.security.audit(&identity, "task.submit", &task_id, "n/a");
    Ok((StatusCode::CREATED, Json(SubmitTaskResponse { task_id })))
}

async fn get_task<AS, SS>(
    State(state): State<Arc<ApiState<AS, SS>>>,
    Path(task_id): Path<String>,
    request: Request,
) -> std::result::Result<Json<Assignment>, Response>
where
    AS: DurableStore<Agent> + 'static,
    SS: DurableStore<Assignment> + 'static,
{
    identity_of(request.extensions()).map_err(IntoResponse::into_response)?;
    let assignments = state.orchestrator.list_assignments().await.map_err(IntoResponse::into_response)?;
    assignments
        .into_iter()
        .filter(|a| a.task_id == task_id)
        .max_by_key(|a| a.created_at)
        .map(Json)
        .ok_or_else(|| ArbiterError::NotFound(format!("no assignment found for task {task_id}")).into_response())
}

#[derive(Debug, Deserialize, Default)]
struct AckRequest {
    #[serde(default)]
    extension_ms: Option<u64>,
}

/// Called by the agent named on the assignment to acknowledge receipt
/// before `ack_deadline`. The caller's identity is used as the agent id
/// directly; a worker authenticates as itself, not on an agent's behalf.
async fn ack_assignment<AS, SS>(
    State(state): State<Arc<ApiState<AS, SS>>>,
    Path(assignment_id): Path<String>,
    request: Request,
) -> std::result::Result<Json<Assignment>, Response>
where
    AS: DurableStore<Agent> + 'static,
    SS: DurableStore<Assignment> + 'static,
{
    let identity = identity_of(request.extensions()).map_err(IntoResponse::into_response)?;
    state.security.authorize(&identity, "assignment.ack", None).await.map_err(IntoResponse::into_response)?;
    let body: AckRequest = parse_json(request.into_body()).await.unwrap_or_default();

    let agent_id = AgentId::new(identity.identity.clone());
    let assignment = state
        .orchestrator
        .ack(&assignment_id, &agent_id, body.extension_ms)
        .await
        .map_err(IntoResponse::into_response)?;
    state.security.audit(&identity, "assignment.ack", &assignment_id, "n/a");
    Ok(Json(assignment))
}

#[derive(Debug, Deserialize)]
struct ProgressRequest {
    progress: f64,
}

async fn progress_assignment<AS, SS>(
    State(state): State<Arc<ApiState<AS, SS>>>,
    Path(assignment_id): Path<String>,
    request: Request,
) -> std::result::Result<Json<Assignment>, Response>
where
    AS: DurableStore<Agent> + 'static,
    SS: DurableStore<Assignment> + 'static,
{
    let identity = identity_of(request.extensions()).map_err(IntoResponse::into_response)?;
    state.security.authorize(&identity, "assignment.progress", None).await.map_err(IntoResponse::into_response)?;
    let body: ProgressRequest = parse_json(request.into_body()).await.map_err(IntoResponse::into_response)?;

    let assignment = state
        .orchestrator
        .progress(&assignment_id, body.progress)
        .await
        .map_err(IntoResponse::into_response)?;
    state.security.audit(&identity, "assignment.progress", &assignment_id, "n/a");
    Ok(Json(assignment))
}

#[derive(Debug, Deserialize)]
struct SubmitAssignmentRequest {
    artifacts: Artifacts,
}

/// The gate inputs (`working_spec`/`task_budget`/`task_max_attempts`)
/// come from the assignment record itself, not this request, so a
/// worker can't misreport the spec it's being graded against.
async fn submit_assignment<AS, SS>(
    State(state): State<Arc<ApiState<AS, SS>>>,
    Path(assignment_id): Path<String>,
    request: Request,
) -> std::result::Result<Json<Assignment>, Response>
where
    AS: DurableStore<Agent> + 'static,
    SS: DurableStore<Assignment> + 'static,
{
    let identity = identity_of(request.extensions()).map_err(IntoResponse::into_response)?;
    state.security.authorize(&identity, "assignment.submit", None).await.map_err(IntoResponse::into_response)?;
    let body: SubmitAssignmentRequest = parse_json(request.into_body()).await.map_err(IntoResponse::into_response)?;

    let generator = VerdictGenerator::new(&state.verdict);
    let assignment = state
        .orchestrator
        .submit(&assignment_id, body.artifacts, &generator)
        .await
        .map_err(IntoResponse::into_response)?;
    state.security.audit(&identity, "assignment.submit", &assignment_id, "n/a");
    Ok(Json(assignment))
}

#[derive(Debug, Deserialize)]
struct RegisterAgentRequest {
    id: String,
    name: String,
    model_family: String,
    #[serde(default)]
    task_types: Vec<String>,
    #[serde(default)]
    languages: Vec<String>,
    #[serde(default = "default_max_concurrent")]
    max_concurrent: u32,
}

fn default_max_concurrent() -> u32 {
    1
}

async fn register_agent<AS, SS>(
    State(state): State<Arc<ApiState<AS, SS>>>,
    request: Request,
) -> std::result::Result<(StatusCode, Json<Agent>), Response>
where
    AS: DurableStore<Agent> + 'static,
    SS: DurableStore<Assignment> + 'static,
{
    let identity = identity_of(request.extensions()).map_err(IntoResponse::into_response)?;
    let body: RegisterAgentRequest = parse_json(request.into_body()).await.map_err(IntoResponse::into_response)?;

    let agent_id = AgentId::new(body.id);
    state
        .security
        .authorize(&identity, "agent.register", agent_id.tenant())
        .await
        .map_err(IntoResponse::into_response)?;

    let mut agent = Agent::new(agent_id, body.name, body.model_family);
    agent.capabilities.task_types = body.task_types.into_iter().collect();
    agent.capabilities.languages = body.languages.into_iter().collect();
    agent.max_concurrent = body.max_concurrent;

    let registered = state.registry.register(agent, RegisterMode::Strict).await.map_err(IntoResponse::into_response)?;
    state.security.audit(&identity, "agent.register", &registered.id.0, "n/a");
    Ok((StatusCode::CREATED, Json(registered)))
}

async fn unregister_agent<AS, SS>(
    State(state): State<Arc<ApiState<AS, SS>>>,
    Path(agent_id): Path<String>,
    request: Request,
) -> std::result::Result<StatusCode, Response>
where
    AS: DurableStore<Agent> + 'static,
    SS: DurableStore<Assignment> + 'static,
{
    let identity = identity_of(request.extensions()).map_err(IntoResponse::into_response)?;
    let id = AgentId::new(agent_id);
    state
        .security
        .authorize(&identity, "agent.unregister", id.tenant())
        .await
        .map_err(IntoResponse::into_response)?;
    let removed = state.orchestrator.unregister_agent(&id).await.map_err(IntoResponse::into_response)?;
    state.security.audit(&identity, "agent.unregister", &id.0, "n/a");
    Ok(if removed { StatusCode::NO_CONTENT } else { StatusCode::NOT_FOUND })
}

#[derive(Debug, Deserialize, Default)]
struct ControlRequest {
    #[serde(default)]
    assignment_id: Option<String>,
    #[serde(default)]
    tenant: Option<String>,
}

#[derive(Debug, Serialize)]
struct ControlResponse {
    action: String,
    accepting: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    cleared: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    assignment: Option<Assignment>,
}

async fn control<AS, SS>(
    State(state): State<Arc<ApiState<AS, SS>>>,
    Path(action): Path<String>,
    request: Request,
) -> std::result::Result<Json<ControlResponse>, Response>
where
    AS: DurableStore<Agent> + 'static,
    SS: DurableStore<Assignment> + 'static,
{
    let identity = identity_of(request.extensions()).map_err(IntoResponse::into_response)?;
    let body: ControlRequest = parse_json(request.into_body()).await.unwrap_or_default();

    let response = match action.as_str() {
        "start" => {
            state.security.authorize(&identity, "task.control", None).await.map_err(IntoResponse::into_response)?;
            state.accepting.store(true, Ordering::Relaxed);
            ControlResponse { action, accepting: true, cleared: None, assignment: None }
        }
        "stop" => {
            state.security.authorize(&identity, "task.control", None).await.map_err(IntoResponse::into_response)?;
            state.accepting.store(false, Ordering::Relaxed);
            ControlResponse { action, accepting: false, cleared: None, assignment: None }
        }
        "drain" => {
            state.security.authorize(&identity, "task.control", None).await.map_err(IntoResponse::into_response)?;
            state.accepting.store(false, Ordering::Relaxed);
            let tenant = body.tenant.clone();
            let cleared = state
                .queue
                .clear(move |task| tenant.as_ref().map_or(true, |t| task.tenant.as_deref() == Some(t.as_str())))
                .await;
            ControlResponse { action, accepting: false, cleared: Some(cleared), assignment: None }
        }
        "cancel" => {
            state.security.authorize(&identity, "task.cancel", None).await.map_err(IntoResponse::into_response)?;
            let assignment_id = body.assignment_id.ok_or_else(|| ArbiterError::Validation("cancel requires assignment_id".into())).map_err(IntoResponse::into_response)?;
            let cancelled = state
                .orchestrator
                .cancel(&assignment_id, &identity.identity, identity.has_role("admin"))
                .await
                .map_err(IntoResponse::into_response)?;
            ControlResponse {
                action,
                accepting: state.accepting.load(Ordering::Relaxed),
                cleared: None,
                assignment: Some(cancelled),
            }
        }
        other => return Err(ArbiterError::Validation(format!("unknown control action {other}")).into_response()),
    };
    state.security.audit(&identity, "task.control", &response.action, "n/a");
    Ok(Json(response))
}

async fn parse_json<T: for<'de> Deserialize<'de>>(body: axum::body::Body) -> Result<T> {
    let bytes = axum::body::to_bytes(body, 1024 * 1024)
        .await
        .map_err(|err| ArbiterError::Validation(format!("failed to read request body: {err}")))?;
    serde_json::from_slice(&bytes).map_err(|err| ArbiterError::Validation(format!("invalid request body: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{QueueConfig, SecurityConfig, StoreConfig};
    use crate::events::EventBus;
    use crate::orchestrator::TaskOrchestrator;
    use crate::registry::AgentRegistry;
    use crate::security::StaticTokenVerifier;
    use crate::store::durable::InMemoryDurableStore;
    use crate::store::ResilientStore;
    use std::collections::HashMap as StdHashMap;
    use std::time::Duration;
    use tower::ServiceExt;

    type TestState = ApiState<InMemoryDurableStore<Agent>, InMemoryDurableStore<Assignment>>;

    fn test_state() -> Arc<TestState> {
        let events = Arc::new(EventBus::new(64));
        let store_config = StoreConfig {
            health_probe_interval: Duration::from_secs(3600),
            ..StoreConfig::default()
        };
        let registry = AgentRegistry::new(Arc::new(InMemoryDurableStore::new()), &store_config, events.clone());
        let queue = Arc::new(TaskQueue::new(QueueConfig::default(), events.clone()));
        let assignments = ResilientStore::new("assignments", Arc::new(InMemoryDurableStore::new()), &store_config, events.clone());
        let orchestrator = TaskOrchestrator::new(crate::config::OrchestratorConfig::default(), queue.clone(), registry.clone(), assignments, events.clone());

        let mut tokens = StdHashMap::new();
        tokens.insert(
            "admin-token".to_string(),
            Identity { identity: "admin-1".into(), tenant: "default".into(), roles: vec!["admin".into()] },
        );
        let verifier = Arc::new(StaticTokenVerifier::new(tokens));
        let security = Arc::new(SecurityGate::new(SecurityConfig::default(), events.clone(), verifier));

        ApiState::new(orchestrator, registry, queue, security, events, VerdictConfig::default())
    }

    fn router(state: Arc<TestState>) -> Router {
        ApiServer::new(
            ApiConfig { host: "127.0.0.1".into(), port: 0, allowed_origins: vec!["http://localhost".into()] },
            state,
        )
        .build_router()
    }

    #[tokio::test]
    async fn status_without_token_is_unauthorized() {
        let app = router(test_state());
        let request = axum::http::Request::builder().uri("/status").body(axum::body::Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn status_with_token_succeeds() {
        let app = router(test_state());
        let request = axum::http::Request::builder()
            .uri("/status")
            .header(header::AUTHORIZATION, "Bearer admin-token")
            .body(axum::body::Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn submit_task_then_get_task_roundtrips() {
        let app = router(test_state());
        let submit = axum::http::Request::builder()
            .method("POST")
            .uri("/tasks")
            .header(header::AUTHORIZATION, "Bearer admin-token")
            .header(header::CONTENT_TYPE, "application/json")
            .body(axum::body::Body::from(r#"{"description":"do it","task_type":"file_editing"}"#))
            .unwrap();
        let response = app.clone().oneshot(submit).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn control_requires_admin_role() {
        let state = test_state();
        let events = state.events.clone();
        let mut tokens = StdHashMap::new();
        tokens.insert(
            "submitter-token".to_string(),
            Identity { identity: "sub-1".into(), tenant: "default".into(), roles: vec!["submitter".into()] },
        );
        let verifier = Arc::new(StaticTokenVerifier::new(tokens));
        let security = Arc::new(SecurityGate::new(SecurityConfig::default(), events, verifier));
        let state = Arc::new(TestState {
            orchestrator: state.orchestrator.clone(),
            registry: state.registry.clone(),
            queue: state.queue.clone(),
            security,
            events: state.events.clone(),
            verdict: state.verdict.clone(),
            started_at: state.started_at,
            accepting: Arc::new(AtomicBool::new(true)),
        });
        let app = router(state);
        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/control/stop")
            .header(header::AUTHORIZATION, "Bearer submitter-token")
            .body(axum::body::Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
