//! Kernel types: TaskPriority, ApprovalLevel, Budget.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Scheduling priority. Lower value = higher urgency.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Critical = 0,
    High = 1,
    #[default]
    Normal = 2,
    Low = 3,
}

impl TaskPriority {
    /// All levels, most urgent first.
    pub const ALL: [TaskPriority; 4] = [
        TaskPriority::Critical,
        TaskPriority::High,
        TaskPriority::Normal,
        TaskPriority::Low,
    ];

    /// Bucket index (lower = higher priority).
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Required human involvement, ordered AUTO < NOTIFY < APPROVE < BLOCK.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalLevel {
    #[default]
    Auto,
    Notify,
    Approve,
    Block,
}

/// Per-context resource ceilings (cgroup-style limits).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Budget {
    pub max_tokens: u64,
    pub max_turns: u32,
    #[serde(with = "humantime_serde")]
    pub max_time: Duration,
    pub max_cost_cents: f64,
    /// Turns left; decremented once per recorded usage.
    pub current_fuel: u32,
}

impl Default for Budget {
    fn default() -> Self {
        Self {
            max_tokens: 100_000,
            max_turns: 50,
            max_time: Duration::from_secs(300),
            max_cost_cents: 500.0,
            current_fuel: 100,
        }
    }
}

/// Partial budget; `Some` fields replace the defaults they are merged onto.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BudgetOverrides {
    pub max_tokens: Option<u64>,
    pub max_turns: Option<u32>,
    #[serde(default, with = "humantime_serde")]
    pub max_time: Option<Duration>,
    pub max_cost_cents: Option<f64>,
    pub current_fuel: Option<u32>,
}

impl BudgetOverrides {
    pub fn fuel(current_fuel: u32) -> Self {
        Self {
            current_fuel: Some(current_fuel),
            ..Self::default()
        }
    }

    /// Merge onto `base`.
    pub fn apply(&self, base: &Budget) -> Budget {
        Budget {
            max_tokens: self.max_tokens.unwrap_or(base.max_tokens),
            max_turns: self.max_turns.unwrap_or(base.max_turns),
            max_time: self.max_time.unwrap_or(base.max_time),
            max_cost_cents: self.max_cost_cents.unwrap_or(base.max_cost_cents),
            current_fuel: self.current_fuel.unwrap_or(base.current_fuel),
        }
    }
}
