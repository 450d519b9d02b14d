//! Core types for the kernel.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (TaskId, ContextId, etc.)
//! - **Errors**: Per-component error families with thiserror derives
//! - **Config**: Configuration tree for every kernel component

mod config;
mod errors;
mod ids;

pub use config::{Config, ObservabilityConfig};
pub use errors::{ApprovalError, BudgetError, Error, Result, RoutingError, SchedulerError};
pub use ids::{AgentId, ApprovalId, BackendId, ContextId, RequestId, TaskId};
