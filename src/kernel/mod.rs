//! Kernel - the orchestration façade.
//!
//! The Kernel wires every subsystem over one shared [`EventBus`] and runs the
//! dispatch control flow. Subsystems (scheduler, circuit breaker, approval
//! gate, resource monitor, router) are plain structs or cheap handles owned
//! by the Kernel, not separate actors. There are no process-wide singletons;
//! two kernels in one process share nothing.
//!
//! ```text
//!   RoutingRequest → route → approval gate → breaker context
//!                  → budget + resource admission → scheduler → router.execute
//!                  → usage accounting → breaker success/failure → release
//! ```

pub mod approval;
pub mod circuit_breaker;
pub mod monitor;
pub mod queue;
pub mod recovery;
pub mod scheduler;
pub mod types;

pub use approval::{ApprovalConfig, ApprovalGate, ApprovalParams, ApprovalRequest, ApprovalStatus};
pub use circuit_breaker::{
    BreakerStats, CircuitBreaker, CircuitBreakerConfig, CircuitState, ExecutionContext,
};
pub use monitor::{
    AgentRecord, AgentStatus, MonitorConfig, MonitorService, ResourceDenial, ResourceMonitor,
    ResourceSnapshot, TokenUsageStats,
};
pub use queue::{Prioritized, PriorityQueue};
pub use recovery::with_recovery_async;
pub use scheduler::{
    Scheduler, SchedulerConfig, SchedulerMetrics, TaskCompletion, TaskHandle, TaskWork,
};
pub use types::{ApprovalLevel, Budget, BudgetOverrides, TaskPriority};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::events::EventBus;
use crate::router::{Backend, Router, RoutingDecision, RoutingRequest, RoutingResult};
use crate::types::{
    AgentId, ApprovalError, BackendId, Config, ContextId, Error, Result, RoutingError,
    SchedulerError, TaskId,
};

/// Everything a successful dispatch produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchOutcome {
    pub task_id: TaskId,
    /// The approval record the dispatch passed through (AUTO_APPROVED for
    /// AUTO-level work).
    pub approval: ApprovalRequest,
    pub result: RoutingResult,
}

/// Orchestration kernel.
#[derive(Debug)]
pub struct Kernel {
    config: Config,
    events: EventBus,
    scheduler: Scheduler,
    approvals: ApprovalGate,
    breaker: Arc<Mutex<CircuitBreaker>>,
    monitor: Arc<Mutex<ResourceMonitor>>,
    router: Arc<Router>,
    monitor_service: Option<MonitorService>,
    monitor_task: Option<JoinHandle<()>>,
}

impl Kernel {
    /// Validate `config` and wire every subsystem to one event bus.
    ///
    /// Nothing runs until [`Kernel::start`].
    pub fn new(config: Config, backend: Arc<dyn Backend>) -> Result<Self> {
        config.validate()?;

        let events = EventBus::new(config.events.clone());
        let scheduler = Scheduler::with_event_bus(config.scheduler.clone(), events.clone());
        let approvals = ApprovalGate::with_event_bus(config.approval.clone(), events.clone());
        let breaker = CircuitBreaker::new(config.breaker.clone(), config.budget.clone())
            .with_event_bus(events.clone());
        let monitor = ResourceMonitor::new(config.monitor.clone()).with_event_bus(events.clone());
        let router = Router::new(config.router.clone(), backend).with_event_bus(events.clone());

        Ok(Self {
            config,
            events,
            scheduler,
            approvals,
            breaker: Arc::new(Mutex::new(breaker)),
            monitor: Arc::new(Mutex::new(monitor)),
            router: Arc::new(router),
            monitor_service: None,
            monitor_task: None,
        })
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start admission and background monitor polling.
    pub fn start(&mut self) -> Result<()> {
        self.scheduler.start()?;
        if self.monitor_service.is_none() {
            let mut service =
                MonitorService::new(self.monitor.clone(), self.config.monitor.poll_interval)
                    .with_approval_sweep(self.approvals.clone(), self.config.approval.retention);
            self.monitor_task = Some(service.start());
            self.monitor_service = Some(service);
        }
        tracing::info!("kernel_started");
        Ok(())
    }

    /// Terminal shutdown: queued work fails with `SCHEDULER_STOPPED` and the
    /// monitor service stops.
    pub async fn shutdown(&mut self) {
        self.scheduler.shutdown();
        if let Some(mut service) = self.monitor_service.take() {
            service.stop();
        }
        if let Some(task) = self.monitor_task.take() {
            if let Err(err) = task.await {
                tracing::warn!(error = %err, "monitor_task_join_failed");
            }
        }
        tracing::info!("kernel_shutdown");
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Run one request end to end with the default budget.
    pub async fn dispatch(
        &self,
        request: RoutingRequest,
        agent_id: AgentId,
    ) -> Result<DispatchOutcome> {
        self.dispatch_with_budget(request, agent_id, None).await
    }

    /// Run one request end to end, merging `budget` onto the default budget
    /// for its execution context.
    ///
    /// Non-AUTO approval levels block here until the request is resolved or
    /// expires. The context and any agent slot taken here are released on
    /// every path.
    pub async fn dispatch_with_budget(
        &self,
        request: RoutingRequest,
        agent_id: AgentId,
        budget: Option<BudgetOverrides>,
    ) -> Result<DispatchOutcome> {
        if !self.scheduler.is_running() {
            return Err(SchedulerError::SchedulerStopped.into());
        }

        let decision = self.router.route(&request)?;
        let approval = self.gate(&request, &decision, &agent_id).await?;

        let context_id =
            ContextId::from_string(format!("ctx-{}", request.id)).map_err(Error::validation)?;
        {
            let mut breaker = self.breaker.lock().await;
            breaker.create_context(context_id.clone(), agent_id.clone(), budget)?;
            if let Err(err) = breaker.can_proceed(&context_id) {
                breaker.release_context(&context_id);
                return Err(err.into());
            }
        }

        let started_here = match self.admit_agent(&agent_id).await {
            Ok(started) => started,
            Err(err) => {
                self.release(&context_id, &agent_id, false).await;
                return Err(err);
            }
        };

        let request_id = request.id.clone();
        let outcome = self.execute_scheduled(request, decision).await;
        self.record_backend_calls(&outcome).await;
        match outcome {
            Ok((_, ref result)) => {
                let tokens = result.response.total_tokens();
                let cost = result.actual_cost_cents;
                self.monitor
                    .lock()
                    .await
                    .record_token_usage(Some(&agent_id), tokens, cost);
                let mut breaker = self.breaker.lock().await;
                if let Err(err) = breaker.record_usage(&context_id, tokens, cost) {
                    tracing::warn!(context_id = %context_id, error = %err, "usage_not_recorded");
                }
                breaker.record_success();
            }
            Err(ref err) => {
                tracing::warn!(
                    request_id = %request_id,
                    agent_id = %agent_id,
                    code = err.code(),
                    error = %err,
                    "dispatch_failed"
                );
                self.breaker.lock().await.record_failure();
            }
        }
        self.release(&context_id, &agent_id, started_here).await;

        let (task_id, result) = outcome?;
        tracing::info!(
            request_id = %request_id,
            task_id = %task_id,
            backend = %result.backend_used,
            retries = result.retries,
            "dispatch_completed"
        );
        Ok(DispatchOutcome {
            task_id,
            approval,
            result,
        })
    }

    /// Remove agents past the stuck threshold or turn limit.
    pub async fn kill_stuck_agents(&self) -> Vec<AgentId> {
        self.monitor.lock().await.kill_stuck_agents()
    }

    async fn gate(
        &self,
        request: &RoutingRequest,
        decision: &RoutingDecision,
        agent_id: &AgentId,
    ) -> Result<ApprovalRequest> {
        let params = ApprovalParams::new(
            format!("route:{}", decision.selected),
            request.task.clone(),
            decision.approval_level,
            agent_id.clone(),
        )
        .with_context(serde_json::json!({
            "request_id": request.id,
            "category": request.category,
            "selected": decision.selected,
            "estimated_cost_cents": decision.estimated_cost_cents,
        }));

        let pending = self.approvals.request_approval(params)?;
        if pending.status.is_terminal() {
            return Ok(pending);
        }

        let resolved = self.approvals.wait_for_resolution(&pending.id, None).await?;
        match resolved.status {
            ApprovalStatus::Approved | ApprovalStatus::AutoApproved => Ok(resolved),
            ApprovalStatus::Denied => Err(ApprovalError::Denied {
                id: resolved.id,
                reason: resolved.reason.unwrap_or_else(|| "no reason given".to_string()),
            }
            .into()),
            ApprovalStatus::Timeout | ApprovalStatus::Pending => {
                Err(ApprovalError::Expired(resolved.id).into())
            }
        }
    }

    /// One backend call per attempt, failed fallbacks included.
    async fn record_backend_calls(&self, outcome: &Result<(TaskId, RoutingResult)>) {
        let attempted: &[BackendId] = match outcome {
            Ok((_, result)) => &result.attempted,
            Err(Error::Routing(RoutingError::AllBackendsFailed { backends, .. })) => backends,
            Err(_) => &[],
        };
        if attempted.is_empty() {
            return;
        }
        let mut monitor = self.monitor.lock().await;
        for backend in attempted {
            monitor.record_backend_call(backend);
        }
    }

    /// Resource admission. Returns whether the agent slot was taken here.
    async fn admit_agent(&self, agent_id: &AgentId) -> Result<bool> {
        let mut monitor = self.monitor.lock().await;
        monitor.can_proceed()?;
        if monitor.is_active(agent_id) {
            return Ok(false);
        }
        monitor.can_start_agent()?;
        if !monitor.start_agent(agent_id.clone(), None) {
            return Err(ResourceDenial::AgentLimitReached {
                active: monitor.active_agent_count(),
                limit: monitor.config().max_active_agents,
            }
            .into());
        }
        Ok(true)
    }

    async fn execute_scheduled(
        &self,
        request: RoutingRequest,
        decision: RoutingDecision,
    ) -> Result<(TaskId, RoutingResult)> {
        let priority = request.priority;
        let router = self.router.clone();
        let handle = self.scheduler.schedule(
            async move {
                let result = router.execute(&request, &decision).await?;
                Ok::<_, Error>(serde_json::to_value(result)?)
            },
            priority,
            None,
        )?;
        self.monitor
            .lock()
            .await
            .set_pending_tasks(self.scheduler.queue_depth());

        let completion = self.scheduler.wait_for(&handle.id, None).await?;
        match completion.outcome {
            Ok(ref value) => Ok((handle.id, serde_json::from_value(value.clone())?)),
            Err(ref err) => Err(err.duplicate()),
        }
    }

    async fn release(&self, context_id: &ContextId, agent_id: &AgentId, stop_agent: bool) {
        self.breaker.lock().await.release_context(context_id);
        let mut monitor = self.monitor.lock().await;
        if stop_agent {
            monitor.stop_agent(agent_id);
        }
        monitor.set_pending_tasks(self.scheduler.queue_depth());
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn approvals(&self) -> &ApprovalGate {
        &self.approvals
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn breaker(&self) -> &Arc<Mutex<CircuitBreaker>> {
        &self.breaker
    }

    pub fn monitor(&self) -> &Arc<Mutex<ResourceMonitor>> {
        &self.monitor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventFilter, EventType};
    use crate::router::{BackendProfile, EchoBackend, TaskCategory};
    use std::time::Duration;

    fn kernel(config: Config) -> Kernel {
        let mut kernel = Kernel::new(config, Arc::new(EchoBackend)).unwrap();
        kernel
            .router()
            .register(BackendProfile::new(BackendId::must("local"), 0.5, 10));
        kernel.start().unwrap();
        kernel
    }

    #[tokio::test]
    async fn test_dispatch_runs_full_flow() {
        let mut kernel = kernel(Config::default());
        let outcome = kernel
            .dispatch(
                RoutingRequest::new("say hello", TaskCategory::General),
                AgentId::must("coder"),
            )
            .await
            .unwrap();

        assert_eq!(outcome.approval.status, ApprovalStatus::AutoApproved);
        assert_eq!(outcome.result.backend_used.as_str(), "local");
        assert_eq!(outcome.result.response.content, "[local] say hello");

        // Context and agent slot are released afterwards
        assert_eq!(kernel.breaker().lock().await.active_contexts(), 0);
        let snapshot = kernel.monitor().lock().await.snapshot();
        assert!(snapshot.active_agents.is_empty());
        assert_eq!(
            snapshot.token_usage.total_tokens,
            outcome.result.response.total_tokens()
        );
        assert_eq!(kernel.scheduler().metrics().completed, 1);

        kernel.shutdown().await;
    }

    #[tokio::test]
    async fn test_dispatch_refused_before_start() {
        let kernel = Kernel::new(Config::default(), Arc::new(EchoBackend)).unwrap();
        let err = kernel
            .dispatch(
                RoutingRequest::new("x", TaskCategory::General),
                AgentId::must("a"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SCHEDULER_STOPPED");
    }

    #[tokio::test]
    async fn test_zero_fuel_refuses_dispatch() {
        let kernel = kernel(Config::default());
        let err = kernel
            .dispatch_with_budget(
                RoutingRequest::new("x", TaskCategory::General),
                AgentId::must("a"),
                Some(BudgetOverrides::fuel(0)),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "FUEL_DEPLETED");
        assert_eq!(kernel.breaker().lock().await.active_contexts(), 0);
        assert_eq!(kernel.scheduler().metrics().completed, 0);
    }

    #[tokio::test]
    async fn test_denied_approval_stops_dispatch() {
        let kernel = kernel(Config::default());
        let approvals = kernel.approvals().clone();
        let mut requests = approvals.subscribe_requests();
        let reviewer = tokio::spawn(async move {
            let request = requests.recv().await.unwrap();
            approvals
                .deny(&request.id, "reviewer", Some("not today".to_string()))
                .unwrap();
        });

        let err = kernel
            .dispatch(
                RoutingRequest::new("audit", TaskCategory::SafetyReview),
                AgentId::must("critic"),
            )
            .await
            .unwrap_err();
        reviewer.await.unwrap();
        assert_eq!(err.code(), "APPROVAL_DENIED");
        assert_eq!(kernel.scheduler().metrics().completed, 0);
    }

    #[tokio::test]
    async fn test_approved_request_proceeds() {
        let kernel = kernel(Config::default());
        let approvals = kernel.approvals().clone();
        let mut requests = approvals.subscribe_requests();
        tokio::spawn(async move {
            let request = requests.recv().await.unwrap();
            approvals.approve(&request.id, "reviewer", None).unwrap();
        });

        let outcome = kernel
            .dispatch(
                RoutingRequest::new("audit", TaskCategory::SafetyReview),
                AgentId::must("critic"),
            )
            .await
            .unwrap();
        assert_eq!(outcome.approval.status, ApprovalStatus::Approved);
        assert_eq!(outcome.approval.resolved_by.as_deref(), Some("reviewer"));
    }

    #[tokio::test]
    async fn test_events_share_one_bus() {
        let kernel = kernel(Config::default());
        let mut sub = kernel.events().subscribe(EventFilter::of_types([
            EventType::RouteCompleted,
            EventType::ContextReleased,
        ]));
        kernel
            .dispatch(
                RoutingRequest::new("hi", TaskCategory::General),
                AgentId::must("a"),
            )
            .await
            .unwrap();

        let first = sub.recv().await.unwrap();
        let second = sub.recv().await.unwrap();
        assert_eq!(first.event_type, EventType::RouteCompleted);
        assert_eq!(second.event_type, EventType::ContextReleased);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolved_approvals_are_swept() {
        let mut config = Config::default();
        config.approval.retention = Duration::from_secs(1);
        config.monitor.poll_interval = Duration::from_secs(5);
        let mut kernel = kernel(config);

        for i in 0..50 {
            kernel
                .dispatch(
                    RoutingRequest::new(format!("task {i}"), TaskCategory::General),
                    AgentId::must("coder"),
                )
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_secs(6)).await;

        // The monitor poll already dropped every AUTO_APPROVED record
        assert_eq!(kernel.approvals().cleanup_resolved(Duration::ZERO), 0);
        kernel.shutdown().await;
    }
}
