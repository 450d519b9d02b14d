//! Router - picks a backend for a request and executes with fallback.
//!
//! `route` is pure decision making over the registry: validate, filter
//! candidates by health, capability, estimated cost, context size and
//! latency, then rank them. `execute` walks the ranked chain, invoking the
//! [`Backend`] capability for each candidate until one succeeds.

pub mod backend;
pub mod health;
pub mod registry;

pub use backend::{Backend, BackendError, BackendRequest, BackendResponse, EchoBackend};
pub use health::{BackendHealthReport, HealthConfig, HealthStatus, HealthTracker};
pub use registry::{BackendProfile, Capability, ModelRegistry};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::time::Instant;

use crate::events::{EmitOptions, EventBus, EventType};
use crate::kernel::recovery::with_recovery_async;
use crate::kernel::types::{ApprovalLevel, TaskPriority};
use crate::types::{BackendId, Error, RequestId, Result, RoutingError};

const EVENT_SOURCE: &str = "router";

/// Caller name whose code-generation requests need human approval.
pub const EXECUTOR_CALLER: &str = "executor";

// =============================================================================
// Request / decision types
// =============================================================================

/// Kind of work, used to look up preferred backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    #[default]
    General,
    CodeGeneration,
    CodeReview,
    Reasoning,
    Planning,
    Summarization,
    SafetyReview,
}

/// Router configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Input-size heuristic for cost estimation.
    pub chars_per_token: usize,
    /// Flat output allowance added to every estimate.
    pub output_token_allowance: u64,
    /// Preferred backends per category, most preferred first.
    pub preferences: BTreeMap<TaskCategory, Vec<BackendId>>,
    pub health: HealthConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            chars_per_token: 4,
            output_token_allowance: 1_000,
            preferences: BTreeMap::new(),
            health: HealthConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingRequest {
    pub id: RequestId,
    pub task: String,
    pub category: TaskCategory,
    pub required_capabilities: Vec<Capability>,
    pub max_cost_cents: Option<f64>,
    pub max_latency_ms: Option<u64>,
    pub preferred_backend: Option<BackendId>,
    pub priority: TaskPriority,
    pub caller: Option<String>,
}

impl RoutingRequest {
    pub fn new(task: impl Into<String>, category: TaskCategory) -> Self {
        Self {
            id: RequestId::new(),
            task: task.into(),
            category,
            required_capabilities: Vec::new(),
            max_cost_cents: None,
            max_latency_ms: None,
            preferred_backend: None,
            priority: TaskPriority::Normal,
            caller: None,
        }
    }

    pub fn require(mut self, capability: Capability) -> Self {
        self.required_capabilities.push(capability);
        self
    }

    pub fn max_cost(mut self, cents: f64) -> Self {
        self.max_cost_cents = Some(cents);
        self
    }

    pub fn max_latency(mut self, ms: u64) -> Self {
        self.max_latency_ms = Some(ms);
        self
    }

    pub fn prefer(mut self, backend: BackendId) -> Self {
        self.preferred_backend = Some(backend);
        self
    }

    pub fn priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn caller(mut self, caller: impl Into<String>) -> Self {
        self.caller = Some(caller.into());
        self
    }
}

/// The router's choice. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub request_id: RequestId,
    pub selected: BackendId,
    /// Remaining candidates in rank order, excluding `selected`.
    pub fallback_chain: Vec<BackendId>,
    pub estimated_tokens: u64,
    pub estimated_cost_cents: f64,
    pub estimated_latency_ms: u64,
    pub reasoning: String,
    pub approval_level: ApprovalLevel,
    pub decided_at: DateTime<Utc>,
}

impl RoutingDecision {
    /// Selected backend followed by the fallbacks.
    pub fn chain(&self) -> impl Iterator<Item = &BackendId> {
        std::iter::once(&self.selected).chain(self.fallback_chain.iter())
    }
}

/// Outcome of executing a decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingResult {
    pub decision: RoutingDecision,
    pub backend_used: BackendId,
    pub response: BackendResponse,
    pub actual_cost_cents: f64,
    pub latency_ms: u64,
    /// Failed attempts before the successful one.
    pub retries: u32,
    /// Every backend invoked, in order; the last is `backend_used`.
    pub attempted: Vec<BackendId>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouterMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub avg_latency_ms: f64,
    pub total_cost_cents: f64,
    pub backend_usage: BTreeMap<BackendId, u64>,
}

// =============================================================================
// Router
// =============================================================================

struct Candidate<'a> {
    profile: &'a BackendProfile,
    cost_cents: f64,
    preference_rank: usize,
    caller_preferred: bool,
}

/// Backend router. Shared behind an `Arc`; all methods take `&self`.
pub struct Router {
    config: RouterConfig,
    registry: RwLock<ModelRegistry>,
    health: Mutex<HealthTracker>,
    metrics: Mutex<RouterMetrics>,
    backend: Arc<dyn Backend>,
    events: Option<EventBus>,
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

impl Router {
    pub fn new(config: RouterConfig, backend: Arc<dyn Backend>) -> Self {
        Self {
            health: Mutex::new(HealthTracker::new(config.health.clone())),
            config,
            registry: RwLock::new(ModelRegistry::new()),
            metrics: Mutex::new(RouterMetrics::default()),
            backend,
            events: None,
        }
    }

    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    // =========================================================================
    // Registry
    // =========================================================================

    pub fn register(&self, profile: BackendProfile) -> bool {
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register(profile)
    }

    pub fn unregister(&self, id: &BackendId) -> bool {
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .unregister(id)
    }

    pub fn set_healthy(&self, id: &BackendId, healthy: bool) -> bool {
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .set_healthy(id, healthy)
    }

    pub fn backends(&self) -> Vec<BackendProfile> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .list_all()
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn health_report(&self, id: &BackendId) -> BackendHealthReport {
        self.lock_health().report(id)
    }

    pub fn metrics(&self) -> RouterMetrics {
        self.lock_metrics().clone()
    }

    // =========================================================================
    // Decision
    // =========================================================================

    /// Estimated tokens for a task: input by heuristic plus the flat
    /// output allowance.
    pub fn estimate_tokens(&self, task: &str) -> u64 {
        let chars = task.chars().count() as u64;
        let per_token = self.config.chars_per_token.max(1) as u64;
        chars.div_ceil(per_token) + self.config.output_token_allowance
    }

    /// Approval level implied by a request.
    pub fn approval_level_for(request: &RoutingRequest) -> ApprovalLevel {
        if request.category == TaskCategory::SafetyReview {
            ApprovalLevel::Approve
        } else if request.priority == TaskPriority::Critical {
            ApprovalLevel::Notify
        } else if request
            .required_capabilities
            .contains(&Capability::CodeGeneration)
            && request.caller.as_deref() == Some(EXECUTOR_CALLER)
        {
            ApprovalLevel::Approve
        } else {
            ApprovalLevel::Auto
        }
    }

    pub fn route(&self, request: &RoutingRequest) -> std::result::Result<RoutingDecision, RoutingError> {
        if request.task.trim().is_empty() {
            return Err(RoutingError::InvalidRequest("task must not be empty".to_string()));
        }
        if let Some(max_cost) = request.max_cost_cents {
            if max_cost.is_nan() || max_cost <= 0.0 {
                return Err(RoutingError::InvalidRequest(format!(
                    "max_cost_cents must be positive, got {max_cost}"
                )));
            }
        }

        let estimated_tokens = self.estimate_tokens(&request.task);
        let input_tokens = estimated_tokens - self.config.output_token_allowance;
        let preferences = self
            .config
            .preferences
            .get(&request.category)
            .map(Vec::as_slice)
            .unwrap_or_default();

        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        let health = self.lock_health();
        let healthy = registry.list_healthy();
        let registered = healthy.len();

        let mut candidates: Vec<Candidate<'_>> = healthy
            .into_iter()
            .filter(|p| !health.is_tripped(&p.id))
            .filter(|p| p.supports(&request.required_capabilities))
            .filter(|p| p.max_context_tokens >= input_tokens)
            .filter(|p| request.max_latency_ms.map_or(true, |max| p.avg_latency_ms <= max))
            .map(|p| Candidate {
                cost_cents: p.estimate_cost_cents(estimated_tokens),
                preference_rank: preferences
                    .iter()
                    .position(|id| id == &p.id)
                    .unwrap_or(usize::MAX),
                caller_preferred: request.preferred_backend.as_ref() == Some(&p.id),
                profile: p,
            })
            .filter(|c| request.max_cost_cents.map_or(true, |max| c.cost_cents <= max))
            .collect();
        drop(health);

        if candidates.is_empty() {
            tracing::warn!(
                request_id = %request.id,
                category = ?request.category,
                healthy = registered,
                "no_available_backend"
            );
            self.emit(
                EventType::RouteFailed,
                &request.id,
                serde_json::json!({ "code": "NO_AVAILABLE_BACKEND" }),
            );
            return Err(RoutingError::NoAvailableBackend(format!(
                "no backend satisfies request {} ({} healthy)",
                request.id, registered
            )));
        }

        candidates.sort_by(|a, b| {
            a.preference_rank
                .cmp(&b.preference_rank)
                .then(b.caller_preferred.cmp(&a.caller_preferred))
                .then(a.cost_cents.total_cmp(&b.cost_cents))
                .then(a.profile.id.cmp(&b.profile.id))
        });

        let top = &candidates[0];
        let reasoning = format!(
            "selected {} for {:?} from {} candidate(s): preference rank {}, caller preferred {}, estimated {:.4}c",
            top.profile.id,
            request.category,
            candidates.len(),
            if top.preference_rank == usize::MAX {
                "none".to_string()
            } else {
                top.preference_rank.to_string()
            },
            top.caller_preferred,
            top.cost_cents,
        );

        let decision = RoutingDecision {
            request_id: request.id.clone(),
            selected: top.profile.id.clone(),
            fallback_chain: candidates[1..].iter().map(|c| c.profile.id.clone()).collect(),
            estimated_tokens,
            estimated_cost_cents: top.cost_cents,
            estimated_latency_ms: top.profile.avg_latency_ms,
            reasoning,
            approval_level: Self::approval_level_for(request),
            decided_at: Utc::now(),
        };
        drop(candidates);
        drop(registry);

        tracing::debug!(
            request_id = %request.id,
            selected = %decision.selected,
            fallbacks = decision.fallback_chain.len(),
            approval = ?decision.approval_level,
            "route_decided"
        );
        self.emit(
            EventType::RouteDecided,
            &request.id,
            serde_json::json!({
                "selected": decision.selected,
                "fallback_chain": decision.fallback_chain,
                "approval_level": decision.approval_level,
            }),
        );
        Ok(decision)
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Walk the decision's chain until a backend succeeds.
    ///
    /// Single backend failures are absorbed; only an exhausted chain is
    /// reported, as `ALL_BACKENDS_FAILED` with the attempt count.
    pub async fn execute(
        &self,
        request: &RoutingRequest,
        decision: &RoutingDecision,
    ) -> Result<RoutingResult> {
        let backend_request = BackendRequest {
            request_id: request.id.clone(),
            task: request.task.clone(),
            category: request.category,
            max_output_tokens: self.config.output_token_allowance,
        };
        let started = Instant::now();
        let mut attempted: Vec<BackendId> = Vec::new();
        let mut last_error = String::from("no backend attempted");

        for backend_id in decision.chain() {
            let profile = self
                .registry
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(backend_id)
                .cloned();
            let Some(profile) = profile else {
                tracing::debug!(backend = %backend_id, "backend_unregistered_skipped");
                continue;
            };

            attempted.push(backend_id.clone());
            let attempts = attempted.len() as u32;
            let call_started = Instant::now();
            let outcome = with_recovery_async(
                async { Ok::<_, Error>(self.backend.invoke(&profile, &backend_request).await) },
                "backend invoke",
            )
            .await;
            let call_ms = call_started.elapsed().as_millis() as u64;

            let (kind, message) = match outcome {
                Ok(Ok(response)) => {
                    self.lock_health().record(backend_id, true, call_ms, None);
                    let result = RoutingResult {
                        decision: decision.clone(),
                        backend_used: backend_id.clone(),
                        actual_cost_cents: profile.estimate_cost_cents(response.total_tokens()),
                        latency_ms: started.elapsed().as_millis() as u64,
                        retries: attempts - 1,
                        attempted,
                        completed_at: Utc::now(),
                        response,
                    };
                    self.record_success(&result);
                    return Ok(result);
                }
                Ok(Err(err)) => (err.kind(), err.to_string()),
                Err(err) => ("panic", err.to_string()),
            };

            tracing::warn!(
                request_id = %request.id,
                backend = %backend_id,
                attempt = attempts,
                error = %message,
                "backend_failed"
            );
            self.lock_health().record(backend_id, false, call_ms, Some(kind));
            self.emit(
                EventType::BackendFailed,
                &request.id,
                serde_json::json!({ "backend": backend_id, "attempt": attempts, "error": message }),
            );
            last_error = message;
        }

        let attempts = attempted.len() as u32;
        {
            let mut metrics = self.lock_metrics();
            metrics.total_requests += 1;
            metrics.failed_requests += 1;
        }
        tracing::error!(
            request_id = %request.id,
            attempts,
            last_error = %last_error,
            "all_backends_failed"
        );
        self.emit(
            EventType::RouteFailed,
            &request.id,
            serde_json::json!({ "code": "ALL_BACKENDS_FAILED", "attempts": attempts }),
        );
        Err(RoutingError::AllBackendsFailed {
            attempts,
            backends: attempted,
            last_error,
        }
        .into())
    }

    /// `route` then `execute`.
    pub async fn route_and_execute(&self, request: &RoutingRequest) -> Result<RoutingResult> {
        let decision = self.route(request).map_err(Error::from)?;
        self.execute(request, &decision).await
    }

    fn record_success(&self, result: &RoutingResult) {
        {
            let mut metrics = self.lock_metrics();
            metrics.total_requests += 1;
            metrics.successful_requests += 1;
            let n = metrics.successful_requests as f64;
            metrics.avg_latency_ms += (result.latency_ms as f64 - metrics.avg_latency_ms) / n;
            metrics.total_cost_cents += result.actual_cost_cents;
            *metrics
                .backend_usage
                .entry(result.backend_used.clone())
                .or_insert(0) += 1;
        }

        tracing::debug!(
            request_id = %result.decision.request_id,
            backend = %result.backend_used,
            retries = result.retries,
            latency_ms = result.latency_ms,
            "route_completed"
        );
        self.emit(
            EventType::RouteCompleted,
            &result.decision.request_id,
            serde_json::json!({
                "backend": result.backend_used,
                "retries": result.retries,
                "cost_cents": result.actual_cost_cents,
                "latency_ms": result.latency_ms,
            }),
        );
    }

    fn lock_health(&self) -> MutexGuard<'_, HealthTracker> {
        self.health.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_metrics(&self) -> MutexGuard<'_, RouterMetrics> {
        self.metrics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event_type: EventType, request_id: &RequestId, payload: serde_json::Value) {
        if let Some(ref events) = self.events {
            events.emit_with(
                event_type,
                EVENT_SOURCE,
                payload,
                EmitOptions::correlated(request_id.as_str()),
            );
        }
    }
}
