//! # AgentOS Kernel - Agent Orchestration Kernel
//!
//! Rust implementation of the agent orchestration kernel providing:
//! - Priority scheduling of units of work under a concurrency cap
//! - Per-context budget and fuel accounting behind a global circuit breaker
//! - Human-in-the-loop approval with auto-approval policy and expiry
//! - Sliding-window resource monitoring and stuck-agent detection
//! - Backend routing by capability, cost and latency with ordered fallback
//! - A typed event bus with bounded replay that every component reports to
//!
//! ## Architecture
//!
//! The `Kernel` owns every subsystem and wires them over one event bus:
//! ```text
//!                    ┌──────────────────────────────────────┐
//!   RoutingRequest → │               Kernel                 │
//!                    │  ┌────────┐ ┌─────────┐ ┌──────────┐ │
//!                    │  │ Router │ │Approval │ │ Circuit  │ │
//!                    │  │        │ │  Gate   │ │ Breaker  │ │
//!                    │  └────────┘ └─────────┘ └──────────┘ │
//!                    │  ┌─────────┐ ┌─────────┐             │
//!                    │  │Scheduler│ │Resource │             │
//!                    │  │ + Queue │ │ Monitor │             │
//!                    │  └─────────┘ └─────────┘             │
//!                    │         ↓ events ↓                   │
//!                    │  ┌────────────────────────────────┐  │
//!                    │  │           Event Bus            │  │
//!                    │  └────────────────────────────────┘  │
//!                    └──────────────────────────────────────┘
//! ```
//!
//! The only external capability is the [`router::Backend`] trait; the kernel
//! never talks to a model provider itself.

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]

// Re-export public API
pub mod events;
pub mod kernel;
pub mod router;
pub mod types;

// Internal utilities
pub mod observability;

pub use kernel::{DispatchOutcome, Kernel};
pub use types::{Config, Error, Result};
