//! Resource monitoring and admission control.
//!
//! Keeps a rolling history of token/cost samples and backend calls, trimmed
//! to the history window on every write. One-minute rates are derived from
//! that history whenever the snapshot is recomputed. A background
//! [`MonitorService`] refreshes the snapshot on a fixed interval and runs the
//! light stuck-marking pass; [`ResourceMonitor::kill_stuck_agents`] is the
//! heavy pass that actually removes agents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::time::{interval, Instant, MissedTickBehavior};

use super::approval::ApprovalGate;
use crate::events::{EmitOptions, EventBus, EventType};
use crate::types::{AgentId, BackendId, BudgetError, TaskId};

const RATE_WINDOW: Duration = Duration::from_secs(60);
const EVENT_SOURCE: &str = "resource_monitor";

// =============================================================================
// Configuration
// =============================================================================

/// Monitor thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub max_tokens_per_minute: u64,
    pub max_cost_per_minute_cents: f64,
    /// Total spend allowed over the monitor's lifetime.
    pub total_budget_cents: f64,
    pub max_active_agents: usize,
    /// Runtime after which an agent is killed (half of it marks it stuck).
    #[serde(with = "humantime_serde")]
    pub stuck_threshold: Duration,
    pub max_turns_per_agent: u32,
    /// Snapshot refresh and stuck-marking interval for [`MonitorService`].
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// How much sample history to keep.
    #[serde(with = "humantime_serde")]
    pub history_window: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            max_tokens_per_minute: 100_000,
            max_cost_per_minute_cents: 100.0,
            total_budget_cents: 10_000.0,
            max_active_agents: 5,
            stuck_threshold: Duration::from_secs(300),
            max_turns_per_agent: 50,
            poll_interval: Duration::from_secs(5),
            history_window: Duration::from_secs(300),
        }
    }
}

// =============================================================================
// Snapshot types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Running,
    Stuck,
}

/// One active agent as seen in a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: AgentId,
    pub task_id: Option<TaskId>,
    pub started_at: DateTime<Utc>,
    pub runtime_ms: u64,
    pub turns: u32,
    pub tokens: u64,
    pub cost_cents: f64,
    pub status: AgentStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsageStats {
    pub total_tokens: u64,
    pub total_cost_cents: f64,
    pub tokens_per_minute: u64,
    pub cost_per_minute_cents: f64,
    pub budget_remaining_cents: f64,
}

/// Point-in-time aggregate. Replaced wholesale, never patched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub taken_at: DateTime<Utc>,
    pub token_usage: TokenUsageStats,
    pub active_agents: Vec<AgentRecord>,
    pub pending_tasks: usize,
    pub memory_estimate_bytes: u64,
    pub backend_calls: BTreeMap<BackendId, u64>,
}

/// Why the monitor refused admission.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResourceDenial {
    #[error("token rate {current}/min exceeds {limit}/min")]
    TokenRateExceeded { current: u64, limit: u64 },

    #[error("cost rate {current:.2}c/min exceeds {limit:.2}c/min")]
    CostRateExceeded { current: f64, limit: f64 },

    #[error("total budget exhausted: spent {spent:.2}c of {budget:.2}c")]
    BudgetExhausted { spent: f64, budget: f64 },

    #[error("agent limit reached: {active}/{limit}")]
    AgentLimitReached { active: usize, limit: usize },
}

impl From<ResourceDenial> for BudgetError {
    fn from(denial: ResourceDenial) -> Self {
        let (resource, used, limit) = match denial {
            ResourceDenial::TokenRateExceeded { current, limit } => {
                ("tokens_per_minute", current as f64, limit as f64)
            }
            ResourceDenial::CostRateExceeded { current, limit } => {
                ("cost_per_minute_cents", current, limit)
            }
            ResourceDenial::BudgetExhausted { spent, budget } => ("total_budget_cents", spent, budget),
            ResourceDenial::AgentLimitReached { active, limit } => {
                ("active_agents", active as f64, limit as f64)
            }
        };
        BudgetError::BudgetExceeded {
            resource,
            used,
            limit,
        }
    }
}

impl From<ResourceDenial> for crate::types::Error {
    fn from(denial: ResourceDenial) -> Self {
        BudgetError::from(denial).into()
    }
}

// =============================================================================
// Monitor
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct UsageSample {
    at: Instant,
    tokens: u64,
    cost_cents: f64,
}

#[derive(Debug, Clone)]
struct BackendSample {
    at: Instant,
    backend: BackendId,
}

#[derive(Debug)]
struct ActiveAgent {
    record: AgentRecord,
    started: Instant,
}

/// Sliding-window resource monitor.
///
/// NOT a separate actor - owned by Kernel and called via &mut self.
#[derive(Debug)]
pub struct ResourceMonitor {
    config: MonitorConfig,
    usage_history: VecDeque<UsageSample>,
    backend_history: VecDeque<BackendSample>,
    backend_totals: BTreeMap<BackendId, u64>,
    agents: HashMap<AgentId, ActiveAgent>,
    total_tokens: u64,
    total_cost_cents: f64,
    pending_tasks: usize,
    snapshot: watch::Sender<ResourceSnapshot>,
    events: Option<EventBus>,
}

impl ResourceMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        let (snapshot, _) = watch::channel(ResourceSnapshot {
            taken_at: Utc::now(),
            token_usage: TokenUsageStats {
                budget_remaining_cents: config.total_budget_cents,
                ..TokenUsageStats::default()
            },
            active_agents: Vec::new(),
            pending_tasks: 0,
            memory_estimate_bytes: 0,
            backend_calls: BTreeMap::new(),
        });
        Self {
            config,
            usage_history: VecDeque::new(),
            backend_history: VecDeque::new(),
            backend_totals: BTreeMap::new(),
            agents: HashMap::new(),
            total_tokens: 0,
            total_cost_cents: 0.0,
            pending_tasks: 0,
            snapshot,
            events: None,
        }
    }

    /// Announce agent lifecycle on `events`.
    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    // =========================================================================
    // Agents
    // =========================================================================

    /// Register an active agent. Returns false once the cap is reached.
    pub fn start_agent(&mut self, agent_id: AgentId, task_id: Option<TaskId>) -> bool {
        if self.agents.contains_key(&agent_id) {
            return true;
        }
        if self.agents.len() >= self.config.max_active_agents {
            tracing::warn!(
                agent_id = %agent_id,
                active = self.agents.len(),
                limit = self.config.max_active_agents,
                "agent_start_refused"
            );
            return false;
        }

        tracing::debug!(agent_id = %agent_id, "agent_started");
        self.emit(
            EventType::AgentStarted,
            &agent_id,
            serde_json::json!({ "task_id": task_id }),
        );
        self.agents.insert(
            agent_id.clone(),
            ActiveAgent {
                record: AgentRecord {
                    agent_id,
                    task_id,
                    started_at: Utc::now(),
                    runtime_ms: 0,
                    turns: 0,
                    tokens: 0,
                    cost_cents: 0.0,
                    status: AgentStatus::Running,
                },
                started: Instant::now(),
            },
        );
        self.refresh();
        true
    }

    pub fn stop_agent(&mut self, agent_id: &AgentId) -> Option<AgentRecord> {
        let stopped = self.agents.remove(agent_id).map(|a| Self::record_of(&a));
        if stopped.is_some() {
            tracing::debug!(agent_id = %agent_id, "agent_stopped");
            self.emit(EventType::AgentStopped, agent_id, serde_json::Value::Null);
            self.refresh();
        }
        stopped
    }

    pub fn active_agent_count(&self) -> usize {
        self.agents.len()
    }

    pub fn is_active(&self, agent_id: &AgentId) -> bool {
        self.agents.contains_key(agent_id)
    }

    // =========================================================================
    // Recording
    // =========================================================================

    /// Account tokens and cost globally and, if given, against one agent
    /// (which also counts as one turn for that agent).
    pub fn record_token_usage(&mut self, agent_id: Option<&AgentId>, tokens: u64, cost_cents: f64) {
        let cost_cents = cost_cents.max(0.0);
        self.total_tokens = self.total_tokens.saturating_add(tokens);
        self.total_cost_cents += cost_cents;
        self.usage_history.push_back(UsageSample {
            at: Instant::now(),
            tokens,
            cost_cents,
        });

        if let Some(agent) = agent_id.and_then(|id| self.agents.get_mut(id)) {
            agent.record.tokens = agent.record.tokens.saturating_add(tokens);
            agent.record.cost_cents += cost_cents;
            agent.record.turns = agent.record.turns.saturating_add(1);
        }

        self.trim_history();
        self.refresh();
    }

    pub fn record_backend_call(&mut self, backend: &BackendId) {
        *self.backend_totals.entry(backend.clone()).or_insert(0) += 1;
        self.backend_history.push_back(BackendSample {
            at: Instant::now(),
            backend: backend.clone(),
        });
        self.trim_history();
        self.refresh();
    }

    pub fn set_pending_tasks(&mut self, pending: usize) {
        if self.pending_tasks != pending {
            self.pending_tasks = pending;
            self.refresh();
        }
    }

    // =========================================================================
    // Admission
    // =========================================================================

    /// Rate and budget checks, in order: token rate, cost rate, total budget.
    pub fn can_proceed(&self) -> Result<(), ResourceDenial> {
        let tokens = self.tokens_last_minute();
        if tokens >= self.config.max_tokens_per_minute {
            return self.deny(ResourceDenial::TokenRateExceeded {
                current: tokens,
                limit: self.config.max_tokens_per_minute,
            });
        }
        let cost = self.cost_last_minute();
        if cost >= self.config.max_cost_per_minute_cents {
            return self.deny(ResourceDenial::CostRateExceeded {
                current: cost,
                limit: self.config.max_cost_per_minute_cents,
            });
        }
        if self.total_cost_cents >= self.config.total_budget_cents {
            return self.deny(ResourceDenial::BudgetExhausted {
                spent: self.total_cost_cents,
                budget: self.config.total_budget_cents,
            });
        }
        Ok(())
    }

    /// [`can_proceed`](Self::can_proceed) plus the active-agent cap.
    pub fn can_start_agent(&self) -> Result<(), ResourceDenial> {
        self.can_proceed()?;
        if self.agents.len() >= self.config.max_active_agents {
            return self.deny(ResourceDenial::AgentLimitReached {
                active: self.agents.len(),
                limit: self.config.max_active_agents,
            });
        }
        Ok(())
    }

    fn emit(&self, event_type: EventType, agent_id: &AgentId, payload: serde_json::Value) {
        if let Some(ref events) = self.events {
            events.emit_with(
                event_type,
                EVENT_SOURCE,
                payload,
                EmitOptions::correlated(agent_id.as_str()),
            );
        }
    }

    fn deny(&self, denial: ResourceDenial) -> Result<(), ResourceDenial> {
        tracing::warn!(reason = %denial, "resource_denied");
        Err(denial)
    }

    // =========================================================================
    // Stuck detection
    // =========================================================================

    /// Remove and return every agent past the stuck threshold or turn limit.
    pub fn kill_stuck_agents(&mut self) -> Vec<AgentId> {
        let threshold = self.config.stuck_threshold;
        let max_turns = self.config.max_turns_per_agent;
        let doomed: Vec<AgentId> = self
            .agents
            .iter()
            .filter(|(_, a)| a.started.elapsed() > threshold || a.record.turns > max_turns)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &doomed {
            if let Some(agent) = self.agents.remove(id) {
                tracing::warn!(
                    agent_id = %id,
                    runtime_ms = agent.started.elapsed().as_millis() as u64,
                    turns = agent.record.turns,
                    "agent_killed"
                );
                self.emit(
                    EventType::AgentKilled,
                    id,
                    serde_json::json!({ "turns": agent.record.turns }),
                );
            }
        }
        if !doomed.is_empty() {
            self.refresh();
        }
        doomed
    }

    /// Flag agents past half the stuck threshold. Returns how many were
    /// newly flagged.
    pub fn mark_stuck_agents(&mut self) -> usize {
        let half = self.config.stuck_threshold / 2;
        let mut flagged = Vec::new();
        for (id, agent) in self.agents.iter_mut() {
            if agent.record.status == AgentStatus::Running && agent.started.elapsed() > half {
                agent.record.status = AgentStatus::Stuck;
                tracing::warn!(agent_id = %id, "agent_stuck");
                flagged.push(id.clone());
            }
        }
        for id in &flagged {
            self.emit(EventType::AgentStuck, id, serde_json::Value::Null);
        }
        if !flagged.is_empty() {
            self.refresh();
        }
        flagged.len()
    }

    // =========================================================================
    // Snapshot
    // =========================================================================

    pub fn snapshot(&self) -> ResourceSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Current snapshot, then every recomputation.
    pub fn subscribe(&self) -> watch::Receiver<ResourceSnapshot> {
        self.snapshot.subscribe()
    }

    /// One poll cycle: trim, mark stuck agents, recompute the snapshot.
    pub fn tick(&mut self) -> usize {
        self.trim_history();
        let flagged = self.mark_stuck_agents();
        self.refresh();
        flagged
    }

    pub fn tokens_last_minute(&self) -> u64 {
        self.recent_usage().map(|s| s.tokens).sum()
    }

    pub fn cost_last_minute(&self) -> f64 {
        self.recent_usage().map(|s| s.cost_cents).sum()
    }

    /// Calls routed to `backend` within the last minute.
    pub fn backend_calls_last_minute(&self, backend: &BackendId) -> usize {
        let now = Instant::now();
        self.backend_history
            .iter()
            .filter(|s| &s.backend == backend && now.duration_since(s.at) <= RATE_WINDOW)
            .count()
    }

    fn recent_usage(&self) -> impl Iterator<Item = &UsageSample> {
        let now = Instant::now();
        self.usage_history
            .iter()
            .filter(move |s| now.duration_since(s.at) <= RATE_WINDOW)
    }

    fn trim_history(&mut self) {
        let window = self.config.history_window;
        let now = Instant::now();
        while self
            .usage_history
            .front()
            .is_some_and(|s| now.duration_since(s.at) > window)
        {
            self.usage_history.pop_front();
        }
        while self
            .backend_history
            .front()
            .is_some_and(|s| now.duration_since(s.at) > window)
        {
            self.backend_history.pop_front();
        }
    }

    fn record_of(agent: &ActiveAgent) -> AgentRecord {
        AgentRecord {
            runtime_ms: agent.started.elapsed().as_millis() as u64,
            ..agent.record.clone()
        }
    }

    fn memory_estimate(&self) -> u64 {
        let bytes = self.usage_history.len() * std::mem::size_of::<UsageSample>()
            + self.backend_history.len() * std::mem::size_of::<BackendSample>()
            + self.agents.len() * std::mem::size_of::<ActiveAgent>();
        bytes as u64
    }

    fn refresh(&mut self) {
        let mut active_agents: Vec<AgentRecord> = self.agents.values().map(Self::record_of).collect();
        active_agents.sort_by(|a, b| a.started_at.cmp(&b.started_at));

        let snapshot = ResourceSnapshot {
            taken_at: Utc::now(),
            token_usage: TokenUsageStats {
                total_tokens: self.total_tokens,
                total_cost_cents: self.total_cost_cents,
                tokens_per_minute: self.tokens_last_minute(),
                cost_per_minute_cents: self.cost_last_minute(),
                budget_remaining_cents: (self.config.total_budget_cents - self.total_cost_cents)
                    .max(0.0),
            },
            active_agents,
            pending_tasks: self.pending_tasks,
            memory_estimate_bytes: self.memory_estimate(),
            backend_calls: self.backend_totals.clone(),
        };
        self.snapshot.send_replace(snapshot);
    }
}

// =============================================================================
// Background service
// =============================================================================

/// Periodic snapshot refresh and stuck-agent marking, plus an optional
/// sweep of resolved approval requests.
#[derive(Debug)]
pub struct MonitorService {
    monitor: Arc<Mutex<ResourceMonitor>>,
    poll_interval: Duration,
    approval_sweep: Option<(ApprovalGate, Duration)>,
    stop_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl MonitorService {
    pub fn new(monitor: Arc<Mutex<ResourceMonitor>>, poll_interval: Duration) -> Self {
        Self {
            monitor,
            poll_interval,
            approval_sweep: None,
            stop_tx: None,
        }
    }

    /// Drop resolved requests older than `retention` from `gate` on every poll.
    pub fn with_approval_sweep(mut self, gate: ApprovalGate, retention: Duration) -> Self {
        self.approval_sweep = Some((gate, retention));
        self
    }

    /// Start polling in the background. Returns immediately.
    pub fn start(&mut self) -> tokio::task::JoinHandle<()> {
        let monitor = self.monitor.clone();
        let sweep = self.approval_sweep.clone();
        let period = self.poll_interval.max(Duration::from_millis(1));
        let (stop_tx, mut stop_rx) = tokio::sync::oneshot::channel();
        self.stop_tx = Some(stop_tx);

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let flagged = monitor.lock().await.tick();
                        if flagged > 0 {
                            tracing::debug!(flagged, "monitor_poll_flagged_agents");
                        }
                        if let Some((gate, retention)) = &sweep {
                            gate.cleanup_resolved(*retention);
                        }
                    }
                    _ = &mut stop_rx => {
                        tracing::info!("monitor_service_stopped");
                        break;
                    }
                }
            }
        })
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for MonitorService {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn monitor() -> ResourceMonitor {
        ResourceMonitor::new(MonitorConfig {
            max_active_agents: 2,
            stuck_threshold: Duration::from_secs(60),
            max_turns_per_agent: 3,
            ..MonitorConfig::default()
        })
    }

    fn agent(n: &str) -> AgentId {
        AgentId::must(n)
    }

    #[tokio::test]
    async fn test_agent_cap() {
        let mut m = monitor();
        assert!(m.start_agent(agent("a"), None));
        assert!(m.start_agent(agent("b"), None));
        assert!(!m.start_agent(agent("c"), None));
        assert_eq!(m.active_agent_count(), 2);
        assert_eq!(
            m.can_start_agent().unwrap_err(),
            ResourceDenial::AgentLimitReached { active: 2, limit: 2 }
        );

        m.stop_agent(&agent("a"));
        assert!(m.start_agent(agent("c"), None));
    }

    #[tokio::test(start_paused = true)]
    async fn test_kill_stuck_by_runtime_and_turns() {
        let mut m = monitor();
        m.start_agent(agent("slow"), None);
        tokio::time::advance(Duration::from_secs(30)).await;
        m.start_agent(agent("chatty"), None);
        for _ in 0..4 {
            m.record_token_usage(Some(&agent("chatty")), 10, 0.1);
        }

        tokio::time::advance(Duration::from_secs(31)).await;
        let mut killed = m.kill_stuck_agents();
        killed.sort();
        assert_eq!(killed, vec![agent("chatty"), agent("slow")]);
        assert_eq!(m.active_agent_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mark_stuck_before_kill() {
        let mut m = monitor();
        m.start_agent(agent("a"), None);
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(m.tick(), 1);
        assert_eq!(m.snapshot().active_agents[0].status, AgentStatus::Stuck);
        assert!(m.kill_stuck_agents().is_empty());
        assert_eq!(m.tick(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_rate_window_slides() {
        let mut m = ResourceMonitor::new(MonitorConfig {
            max_tokens_per_minute: 1_000,
            ..MonitorConfig::default()
        });
        m.record_token_usage(None, 1_000, 0.0);
        assert!(matches!(
            m.can_proceed(),
            Err(ResourceDenial::TokenRateExceeded { current: 1_000, .. })
        ));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(m.can_proceed().is_ok());
        assert_eq!(m.snapshot().token_usage.total_tokens, 1_000);
    }

    #[tokio::test]
    async fn test_check_order_cost_then_budget() {
        let mut m = ResourceMonitor::new(MonitorConfig {
            max_cost_per_minute_cents: 10.0,
            total_budget_cents: 5.0,
            ..MonitorConfig::default()
        });
        m.record_token_usage(None, 1, 20.0);
        assert!(matches!(m.can_proceed(), Err(ResourceDenial::CostRateExceeded { .. })));

        let mut m = ResourceMonitor::new(MonitorConfig {
            total_budget_cents: 5.0,
            ..MonitorConfig::default()
        });
        m.record_token_usage(None, 1, 6.0);
        assert!(matches!(m.can_proceed(), Err(ResourceDenial::BudgetExhausted { .. })));
        assert_eq!(m.snapshot().token_usage.budget_remaining_cents, 0.0);
    }

    #[tokio::test]
    async fn test_snapshot_stream_and_backend_counts() {
        let mut m = monitor();
        let mut rx = m.subscribe();
        assert_eq!(rx.borrow_and_update().pending_tasks, 0);

        m.set_pending_tasks(3);
        m.record_backend_call(&BackendId::must("fast"));
        m.record_backend_call(&BackendId::must("fast"));
        assert!(rx.has_changed().unwrap());

        let snap = rx.borrow_and_update().clone();
        assert_eq!(snap.pending_tasks, 3);
        assert_eq!(snap.backend_calls[&BackendId::must("fast")], 2);
        assert_eq!(m.backend_calls_last_minute(&BackendId::must("fast")), 2);
        assert!(snap.memory_estimate_bytes > 0);
    }

    #[tokio::test]
    async fn test_per_agent_accounting() {
        let mut m = monitor();
        m.start_agent(agent("a"), Some(TaskId::must("t1")));
        m.record_token_usage(Some(&agent("a")), 50, 1.5);
        let rec = m.stop_agent(&agent("a")).unwrap();
        assert_eq!(rec.tokens, 50);
        assert_eq!(rec.turns, 1);
        assert_eq!(rec.task_id, Some(TaskId::must("t1")));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_denials_are_logged() {
        let mut m = monitor();
        m.start_agent(agent("a"), None);
        m.start_agent(agent("b"), None);
        let _ = m.can_start_agent();
        assert!(logs_contain("resource_denied"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_agent_lifecycle_events() {
        let bus = EventBus::default();
        let mut m = monitor().with_event_bus(bus.clone());
        m.start_agent(agent("a"), None);
        tokio::time::advance(Duration::from_secs(31)).await;
        m.tick();
        tokio::time::advance(Duration::from_secs(30)).await;
        m.kill_stuck_agents();

        let kinds: Vec<_> = bus.replay_snapshot().iter().map(|e| e.event_type).collect();
        assert_eq!(
            kinds,
            vec![EventType::AgentStarted, EventType::AgentStuck, EventType::AgentKilled]
        );
    }

    #[test]
    fn test_denial_maps_to_budget_error() {
        let err: BudgetError = ResourceDenial::AgentLimitReached { active: 5, limit: 5 }.into();
        assert!(matches!(
            err,
            BudgetError::BudgetExceeded {
                resource: "active_agents",
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mark_stuck_updates_snapshot() {
        let mut m = monitor();
        let mut snapshots = m.subscribe();
        m.start_agent(agent("a"), None);
        snapshots.borrow_and_update();

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(m.mark_stuck_agents(), 1);

        assert!(snapshots.has_changed().unwrap());
        assert_eq!(m.snapshot().active_agents[0].status, AgentStatus::Stuck);
        // Already flagged agents are not counted twice
        assert_eq!(m.mark_stuck_agents(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_service_marks_stuck_agents() {
        let monitor = Arc::new(Mutex::new(monitor()));
        monitor.lock().await.start_agent(agent("a"), None);

        let mut service = MonitorService::new(monitor.clone(), Duration::from_secs(5));
        let handle = service.start();

        tokio::time::sleep(Duration::from_secs(36)).await;
        assert_eq!(
            monitor.lock().await.snapshot().active_agents[0].status,
            AgentStatus::Stuck
        );

        service.stop();
        handle.await.unwrap();
    }
}
