//! Budget accounting and the global circuit breaker.
//!
//! Two responsibilities share one component:
//!
//! - **Per-context budget.** Each unit of agentic work gets an
//!   [`ExecutionContext`] with ceilings on tokens, turns, wall time and cost,
//!   plus a fuel counter that drops by one per recorded usage.
//! - **Global breaker.** Success/failure counters drive a
//!   CLOSED → OPEN → HALF_OPEN → CLOSED state machine. While OPEN, new
//!   contexts are refused until the reset timeout has elapsed since the last
//!   failure; the next creation attempt then probes in HALF_OPEN.
//!
//! Budget checks and breaker state are independent: an OPEN breaker refuses
//! new contexts but does not fail `can_proceed` on existing ones.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

use super::types::{Budget, BudgetOverrides};
use crate::events::{EmitOptions, EventBus, EventType};
use crate::types::{AgentId, BudgetError, ContextId};

const EVENT_SOURCE: &str = "circuit_breaker";

/// Breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures (while CLOSED) that open the breaker.
    pub failure_threshold: u32,
    /// Successes (while HALF_OPEN) that close it again.
    pub success_threshold: u32,
    /// Quiet period after the last failure before a probe is allowed.
    #[serde(with = "humantime_serde")]
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

/// Global breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

/// Accounting for one unit of agentic work.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub id: ContextId,
    pub agent_id: AgentId,
    pub started_at: DateTime<Utc>,
    pub budget: Budget,
    pub tokens_used: u64,
    pub turns_executed: u32,
    pub cost_cents: f64,
    started: Instant,
}

impl ExecutionContext {
    fn new(id: ContextId, agent_id: AgentId, budget: Budget) -> Self {
        Self {
            id,
            agent_id,
            started_at: Utc::now(),
            budget,
            tokens_used: 0,
            turns_executed: 0,
            cost_cents: 0.0,
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Remaining fuel.
    pub fn fuel(&self) -> u32 {
        self.budget.current_fuel
    }

    /// First violated ceiling, checked in a fixed order.
    fn check(&self) -> Result<(), BudgetError> {
        let budget = &self.budget;
        if budget.current_fuel == 0 {
            return Err(BudgetError::FuelDepleted(self.id.clone()));
        }
        if self.tokens_used >= budget.max_tokens {
            return Err(BudgetError::BudgetExceeded {
                resource: "tokens",
                used: self.tokens_used as f64,
                limit: budget.max_tokens as f64,
            });
        }
        if self.turns_executed >= budget.max_turns {
            return Err(BudgetError::MaxTurnsExceeded {
                turns: self.turns_executed,
                limit: budget.max_turns,
            });
        }
        if self.cost_cents >= budget.max_cost_cents {
            return Err(BudgetError::BudgetExceeded {
                resource: "cost_cents",
                used: self.cost_cents,
                limit: budget.max_cost_cents,
            });
        }
        let elapsed = self.elapsed();
        if elapsed >= budget.max_time {
            return Err(BudgetError::Timeout {
                context_id: self.id.clone(),
                elapsed_ms: elapsed.as_millis() as u64,
                limit_ms: budget.max_time.as_millis() as u64,
            });
        }
        Ok(())
    }
}

/// Point-in-time breaker statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerStats {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub active_contexts: usize,
    pub total_failures: u64,
    pub total_successes: u64,
    pub times_opened: u64,
}

/// Budget tracker and global breaker.
///
/// NOT a separate actor - owned by Kernel and called via &mut self.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    default_budget: Budget,
    contexts: HashMap<ContextId, ExecutionContext>,
    state: watch::Sender<CircuitState>,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
    total_failures: u64,
    total_successes: u64,
    times_opened: u64,
    events: Option<EventBus>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig, default_budget: Budget) -> Self {
        let (state, _) = watch::channel(CircuitState::Closed);
        Self {
            config,
            default_budget,
            contexts: HashMap::new(),
            state,
            failure_count: 0,
            success_count: 0,
            last_failure: None,
            total_failures: 0,
            total_successes: 0,
            times_opened: 0,
            events: None,
        }
    }

    /// Announce transitions and refusals on `events`.
    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn state(&self) -> CircuitState {
        *self.state.borrow()
    }

    /// Current state, then every transition.
    pub fn subscribe_state(&self) -> watch::Receiver<CircuitState> {
        self.state.subscribe()
    }

    // =========================================================================
    // Contexts
    // =========================================================================

    /// Register a context with `overrides` merged onto the default budget.
    ///
    /// While OPEN this is the recovery probe: once strictly more than the
    /// reset timeout has passed since the last failure the breaker moves to
    /// HALF_OPEN and the creation proceeds, otherwise it is refused with
    /// `CircuitOpen`.
    /// Creating an id that already exists returns the existing context.
    pub fn create_context(
        &mut self,
        id: ContextId,
        agent_id: AgentId,
        overrides: Option<BudgetOverrides>,
    ) -> Result<&ExecutionContext, BudgetError> {
        if self.state() == CircuitState::Open {
            let elapsed = self.last_failure.map(|at| at.elapsed());
            match elapsed {
                Some(elapsed) if elapsed <= self.config.reset_timeout => {
                    let retry_after_ms = (self.config.reset_timeout - elapsed).as_millis() as u64;
                    tracing::warn!(
                        context_id = %id,
                        agent_id = %agent_id,
                        retry_after_ms,
                        "context_refused"
                    );
                    self.emit(
                        EventType::ContextRefused,
                        id.as_str(),
                        serde_json::json!({
                            "agent_id": agent_id,
                            "retry_after_ms": retry_after_ms,
                        }),
                    );
                    return Err(BudgetError::CircuitOpen { retry_after_ms });
                }
                _ => self.transition(CircuitState::HalfOpen),
            }
        }

        let budget = match overrides {
            Some(ref o) => o.apply(&self.default_budget),
            None => self.default_budget.clone(),
        };

        if !self.contexts.contains_key(&id) {
            tracing::debug!(context_id = %id, agent_id = %agent_id, "context_created");
            self.emit(
                EventType::ContextCreated,
                id.as_str(),
                serde_json::json!({ "agent_id": agent_id, "budget": budget }),
            );
        }
        Ok(self
            .contexts
            .entry(id.clone())
            .or_insert_with(|| ExecutionContext::new(id, agent_id, budget)))
    }

    /// Whether the context may take another turn.
    ///
    /// Exactly one reason is reported: fuel, then tokens, turns, cost and
    /// wall time, in that order.
    pub fn can_proceed(&self, id: &ContextId) -> Result<(), BudgetError> {
        let ctx = self
            .contexts
            .get(id)
            .ok_or_else(|| BudgetError::ContextNotFound(id.clone()))?;
        let verdict = ctx.check();
        if let Err(ref reason) = verdict {
            tracing::warn!(context_id = %id, reason = %reason, "budget_denied");
        }
        verdict
    }

    /// Account one turn. Fuel drops by exactly one regardless of size.
    pub fn record_usage(
        &mut self,
        id: &ContextId,
        tokens: u64,
        cost_cents: f64,
    ) -> Result<(), BudgetError> {
        let ctx = self
            .contexts
            .get_mut(id)
            .ok_or_else(|| BudgetError::ContextNotFound(id.clone()))?;
        ctx.tokens_used = ctx.tokens_used.saturating_add(tokens);
        ctx.cost_cents += cost_cents.max(0.0);
        ctx.turns_executed = ctx.turns_executed.saturating_add(1);
        ctx.budget.current_fuel = ctx.budget.current_fuel.saturating_sub(1);
        tracing::debug!(
            context_id = %id,
            tokens,
            cost_cents,
            fuel = ctx.budget.current_fuel,
            "usage_recorded"
        );
        Ok(())
    }

    /// Drop a context's accounting. Breaker state is unaffected.
    pub fn release_context(&mut self, id: &ContextId) -> Option<ExecutionContext> {
        let released = self.contexts.remove(id);
        if let Some(ref ctx) = released {
            tracing::debug!(
                context_id = %id,
                turns = ctx.turns_executed,
                tokens = ctx.tokens_used,
                "context_released"
            );
            self.emit(
                EventType::ContextReleased,
                id.as_str(),
                serde_json::json!({
                    "turns": ctx.turns_executed,
                    "tokens": ctx.tokens_used,
                    "cost_cents": ctx.cost_cents,
                }),
            );
        }
        released
    }

    pub fn get_context(&self, id: &ContextId) -> Option<&ExecutionContext> {
        self.contexts.get(id)
    }

    pub fn active_contexts(&self) -> usize {
        self.contexts.len()
    }

    // =========================================================================
    // Global breaker
    // =========================================================================

    pub fn record_failure(&mut self) {
        self.failure_count = self.failure_count.saturating_add(1);
        self.total_failures += 1;
        self.last_failure = Some(Instant::now());

        let trip = match self.state() {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => self.failure_count >= self.config.failure_threshold,
            CircuitState::Open => false,
        };
        if trip {
            self.success_count = 0;
            self.transition(CircuitState::Open);
        }
    }

    pub fn record_success(&mut self) {
        self.total_successes += 1;
        if self.state() == CircuitState::HalfOpen {
            self.success_count = self.success_count.saturating_add(1);
            if self.success_count >= self.config.success_threshold {
                self.failure_count = 0;
                self.success_count = 0;
                self.transition(CircuitState::Closed);
            }
        }
    }

    /// Force CLOSED and clear both counters.
    pub fn reset(&mut self) {
        self.failure_count = 0;
        self.success_count = 0;
        self.last_failure = None;
        self.transition(CircuitState::Closed);
    }

    pub fn stats(&self) -> BreakerStats {
        BreakerStats {
            state: self.state(),
            failure_count: self.failure_count,
            success_count: self.success_count,
            active_contexts: self.contexts.len(),
            total_failures: self.total_failures,
            total_successes: self.total_successes,
            times_opened: self.times_opened,
        }
    }

    fn transition(&mut self, to: CircuitState) {
        let from = self.state();
        if from == to {
            return;
        }
        if to == CircuitState::Open {
            self.times_opened += 1;
            tracing::warn!(from = ?from, failures = self.failure_count, "circuit_opened");
        } else {
            tracing::info!(from = ?from, to = ?to, "circuit_state_changed");
        }
        self.state.send_replace(to);
        self.emit(
            EventType::CircuitStateChanged,
            "global",
            serde_json::json!({ "from": from, "to": to }),
        );
    }

    fn emit(&self, event_type: EventType, correlation: &str, payload: serde_json::Value) {
        if let Some(ref events) = self.events {
            events.emit_with(
                event_type,
                EVENT_SOURCE,
                payload,
                EmitOptions::correlated(correlation),
            );
        }
    }
}
