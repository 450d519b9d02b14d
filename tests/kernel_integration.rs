//! Kernel integration tests: dispatch through router, approval gate, circuit
//! breaker, resource monitor and scheduler, observed through the public API.

use agentos_kernel::events::{EventFilter, EventType};
use agentos_kernel::kernel::{ApprovalLevel, CircuitState, TaskPriority};
use agentos_kernel::router::{
    Backend, BackendError, BackendProfile, BackendRequest, BackendResponse, RoutingRequest,
    TaskCategory,
};
use agentos_kernel::types::{AgentId, BackendId};
use agentos_kernel::{Config, Kernel};
use async_trait::async_trait;
use pretty_assertions::assert_eq;
use std::collections::HashSet;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Backend whose failing ids and latency are set by the test.
#[derive(Debug, Default)]
struct ScriptedBackend {
    failing: Mutex<HashSet<String>>,
    delay: Duration,
    calls: AtomicUsize,
}

impl ScriptedBackend {
    fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    fn fail(&self, id: &str) {
        self.failing.lock().unwrap().insert(id.to_string());
    }

    fn heal(&self, id: &str) {
        self.failing.lock().unwrap().remove(id);
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    async fn invoke(
        &self,
        profile: &BackendProfile,
        request: &BackendRequest,
    ) -> Result<BackendResponse, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing.lock().unwrap().contains(profile.id.as_str()) {
            return Err(BackendError::Unavailable(format!("{} is down", profile.id)));
        }
        Ok(BackendResponse {
            content: format!("{} handled {}", profile.id, request.task),
            input_tokens: 100,
            output_tokens: 900,
            finish_reason: "stop".to_string(),
        })
    }
}

fn id(s: &str) -> BackendId {
    BackendId::must(s)
}

fn agent(s: &str) -> AgentId {
    AgentId::must(s)
}

/// Kernel with a free backend `a` and a 10c/1k backend `b`, started.
fn start_kernel(config: Config, backend: Arc<ScriptedBackend>) -> Kernel {
    let mut kernel = Kernel::new(config, backend).unwrap();
    kernel.router().register(BackendProfile::new(id("a"), 0.0, 100));
    kernel.router().register(BackendProfile::new(id("b"), 10.0, 100));
    kernel.start().unwrap();
    kernel
}

#[tokio::test]
async fn test_dispatch_falls_back_and_accounts_usage() {
    let backend = Arc::new(ScriptedBackend::default());
    backend.fail("a");
    let kernel = start_kernel(Config::default(), backend.clone());

    let outcome = kernel
        .dispatch(RoutingRequest::new("hello", TaskCategory::General), agent("coder"))
        .await
        .unwrap();

    assert_eq!(outcome.result.backend_used, id("b"));
    assert_eq!(outcome.result.retries, 1);
    assert_eq!(outcome.result.actual_cost_cents, 10.0);
    assert_eq!(backend.calls.load(Ordering::SeqCst), 2);

    let snapshot = kernel.monitor().lock().await.snapshot();
    assert_eq!(snapshot.token_usage.total_tokens, 1_000);
    // The failed attempt on `a` counts as a call too
    assert_eq!(snapshot.backend_calls.get(&id("a")), Some(&1));
    assert_eq!(snapshot.backend_calls.get(&id("b")), Some(&1));
    assert!(snapshot.active_agents.is_empty());

    // A single backend failing mid-chain is not a breaker failure
    let stats = kernel.breaker().lock().await.stats();
    assert_eq!(stats.state, CircuitState::Closed);
    assert_eq!(stats.failure_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_open_breaker_refuses_dispatch_until_recovered() {
    let mut config = Config::default();
    config.breaker.failure_threshold = 1;
    config.breaker.success_threshold = 1;
    config.breaker.reset_timeout = Duration::from_secs(5);

    let backend = Arc::new(ScriptedBackend::default());
    backend.fail("a");
    backend.fail("b");
    let kernel = start_kernel(config, backend.clone());
    let request = || RoutingRequest::new("work", TaskCategory::General);

    let err = kernel.dispatch(request(), agent("x")).await.unwrap_err();
    assert_eq!(err.code(), "ALL_BACKENDS_FAILED");
    assert_eq!(kernel.breaker().lock().await.state(), CircuitState::Open);
    let calls = kernel.monitor().lock().await.snapshot().backend_calls;
    assert_eq!(calls.get(&id("a")), Some(&1));
    assert_eq!(calls.get(&id("b")), Some(&1));

    let err = kernel.dispatch(request(), agent("x")).await.unwrap_err();
    assert_eq!(err.code(), "CIRCUIT_OPEN");
    assert!(!err.is_retryable());
    assert_eq!(backend.calls.load(Ordering::SeqCst), 2);

    backend.heal("a");
    tokio::time::advance(Duration::from_secs(6)).await;
    kernel.dispatch(request(), agent("x")).await.unwrap();
    assert_eq!(kernel.breaker().lock().await.state(), CircuitState::Closed);
}

#[tokio::test]
async fn test_fuel_reason_wins_over_token_budget() {
    let kernel = start_kernel(Config::default(), Arc::new(ScriptedBackend::default()));
    let overrides = agentos_kernel::kernel::BudgetOverrides {
        max_tokens: Some(0),
        current_fuel: Some(0),
        ..Default::default()
    };

    let err = kernel
        .dispatch_with_budget(
            RoutingRequest::new("x", TaskCategory::General),
            agent("x"),
            Some(overrides),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "FUEL_DEPLETED");
}

#[tokio::test(start_paused = true)]
async fn test_agent_cap_refuses_second_agent() {
    let mut config = Config::default();
    config.monitor.max_active_agents = 1;
    let backend = Arc::new(ScriptedBackend::with_delay(Duration::from_millis(200)));
    let kernel = start_kernel(config, backend);

    let (first, second) = tokio::join!(
        kernel.dispatch(RoutingRequest::new("one", TaskCategory::General), agent("a1")),
        kernel.dispatch(RoutingRequest::new("two", TaskCategory::General), agent("a2")),
    );

    assert!(first.is_ok());
    let err = second.unwrap_err();
    assert_eq!(err.code(), "BUDGET_EXCEEDED");
    assert!(err.to_string().contains("active_agents"));

    // The slot frees once the first dispatch finishes
    kernel
        .dispatch(RoutingRequest::new("three", TaskCategory::General), agent("a2"))
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_priority_admission_through_kernel() {
    let mut config = Config::default();
    config.scheduler.max_concurrent = 1;
    // CRITICAL work asks for NOTIFY; let it through without a reviewer
    config.approval.auto_approve_threshold = ApprovalLevel::Notify;
    let backend = Arc::new(ScriptedBackend::with_delay(Duration::from_millis(50)));
    let kernel = start_kernel(config, backend);
    let mut completions = kernel.scheduler().subscribe_completions();

    let request = |task: &str, priority| {
        RoutingRequest::new(task, TaskCategory::General).priority(priority)
    };
    // All three are queued before the admission loop first runs
    let (low, critical, high) = tokio::join!(
        kernel.dispatch(request("low", TaskPriority::Low), agent("p")),
        kernel.dispatch(request("critical", TaskPriority::Critical), agent("p")),
        kernel.dispatch(request("high", TaskPriority::High), agent("p")),
    );
    let (low, critical, high) = (low.unwrap(), critical.unwrap(), high.unwrap());

    let mut order = Vec::new();
    for _ in 0..3 {
        order.push(completions.recv().await.unwrap().task_id.clone());
    }
    assert_eq!(order, vec![critical.task_id, high.task_id, low.task_id]);
}

#[tokio::test(start_paused = true)]
async fn test_kill_stuck_agents() {
    let mut config = Config::default();
    config.monitor.stuck_threshold = Duration::from_secs(60);
    let kernel = start_kernel(config, Arc::new(ScriptedBackend::default()));

    assert!(kernel.monitor().lock().await.start_agent(agent("slow"), None));
    tokio::time::advance(Duration::from_secs(61)).await;

    assert_eq!(kernel.kill_stuck_agents().await, vec![agent("slow")]);
    assert_eq!(kernel.monitor().lock().await.active_agent_count(), 0);
}

#[tokio::test]
async fn test_events_are_correlated_by_request() {
    let kernel = start_kernel(Config::default(), Arc::new(ScriptedBackend::default()));
    let request = RoutingRequest::new("trace me", TaskCategory::General);
    let mut sub = kernel
        .events()
        .subscribe(EventFilter::all().with_correlation(request.id.as_str()));

    kernel.dispatch(request, agent("x")).await.unwrap();

    let decided = sub.recv().await.unwrap();
    let completed = sub.recv().await.unwrap();
    assert_eq!(decided.event_type, EventType::RouteDecided);
    assert_eq!(completed.event_type, EventType::RouteCompleted);
    assert_eq!(decided.payload["selected"], "a");
}

#[tokio::test]
async fn test_kernel_from_config_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{
            "scheduler": {{ "max_concurrent": 2, "default_timeout": "2s" }},
            "approval": {{ "auto_approve_threshold": "approve", "retention": "2m" }},
            "router": {{ "preferences": {{ "safety_review": ["b"] }} }}
        }}"#
    )
    .unwrap();
    let config = Config::load(file.path()).unwrap();
    assert_eq!(config.approval.retention, Duration::from_secs(120));
    let kernel = start_kernel(config, Arc::new(ScriptedBackend::default()));

    // APPROVE is at the threshold, so safety review runs without a reviewer
    let outcome = kernel
        .dispatch(
            RoutingRequest::new("review this", TaskCategory::SafetyReview),
            agent("critic"),
        )
        .await
        .unwrap();
    assert_eq!(outcome.result.backend_used, id("b"));
    assert_eq!(outcome.approval.status.as_str(), "auto_approved");
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let mut config = Config::default();
    config.scheduler.max_concurrent = 0;
    let err = Kernel::new(config, Arc::new(ScriptedBackend::default())).unwrap_err();
    assert_eq!(err.code(), "VALIDATION");
}

#[tokio::test]
async fn test_shutdown_refuses_new_dispatch() {
    let mut kernel = start_kernel(Config::default(), Arc::new(ScriptedBackend::default()));
    kernel.shutdown().await;

    let err = kernel
        .dispatch(RoutingRequest::new("late", TaskCategory::General), agent("x"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "SCHEDULER_STOPPED");
}
