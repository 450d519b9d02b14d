//! AgentOS kernel demo binary.
//!
//! Loads configuration (`--config` or `AGENTOS_CONFIG`), registers a small
//! demo registry backed by the echo backend and dispatches one task through
//! the full kernel flow, printing the routing result as JSON.

use agentos_kernel::kernel::{ApprovalGate, ApprovalRequest, TaskPriority};
use agentos_kernel::router::{BackendProfile, Capability, EchoBackend, RoutingRequest, TaskCategory};
use agentos_kernel::types::{AgentId, BackendId};
use agentos_kernel::{Config, Kernel};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(
    name = "agentos-kernel",
    about = "Dispatch one task through the AgentOS orchestration kernel"
)]
struct Cli {
    /// Task text. Multiple words are joined with spaces.
    #[arg(required = true)]
    task: Vec<String>,

    /// Task category (general, code_generation, code_review, reasoning,
    /// planning, summarization, safety_review).
    #[arg(long, default_value = "general", value_parser = parse_category)]
    category: TaskCategory,

    /// Priority (critical, high, normal, low).
    #[arg(long, default_value = "normal", value_parser = parse_priority)]
    priority: TaskPriority,

    /// Requesting agent id.
    #[arg(long, default_value = "cli")]
    agent: String,

    /// Cost ceiling in cents.
    #[arg(long)]
    max_cost: Option<f64>,

    /// JSON config file.
    #[arg(long, env = "AGENTOS_CONFIG")]
    config: Option<PathBuf>,

    /// Approve every pending approval request automatically. Without it,
    /// work that needs approval is denied.
    #[arg(long)]
    approve_all: bool,
}

fn parse_category(raw: &str) -> Result<TaskCategory, String> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .map_err(|_| format!("unknown category: {raw}"))
}

fn parse_priority(raw: &str) -> Result<TaskPriority, String> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .map_err(|_| format!("unknown priority: {raw}"))
}

const NO_APPROVER: &str = "no approver attached; rerun with --approve-all";

fn pending_notice(request: &ApprovalRequest) -> String {
    format!(
        "approval {} required: {} ({:?}, agent {}); {}",
        request.id, request.operation, request.level, request.agent_id, NO_APPROVER
    )
}

fn demo_backends() -> Vec<BackendProfile> {
    vec![
        BackendProfile::new(BackendId::must("local"), 0.0, 50),
        BackendProfile::new(BackendId::must("fast"), 0.2, 300)
            .with_capabilities([Capability::CodeGeneration, Capability::FunctionCalling]),
        BackendProfile::new(BackendId::must("deep"), 1.5, 1_200)
            .with_capabilities([
                Capability::Reasoning,
                Capability::LongContext,
                Capability::CodeGeneration,
            ])
            .with_max_context(200_000),
    ]
}

/// A one-shot run has no reviewer: pending requests are approved when
/// `approve_all` is set and denied right away otherwise, instead of waiting
/// out the approval timeout.
fn spawn_approver(approvals: ApprovalGate, approve_all: bool) {
    let mut requests = approvals.subscribe_requests();
    tokio::spawn(async move {
        while let Ok(request) = requests.recv().await {
            let resolved = if approve_all {
                approvals.approve(&request.id, "cli", None)
            } else {
                eprintln!("{}", pending_notice(&request));
                approvals.deny(&request.id, "cli", Some(NO_APPROVER.to_string()))
            };
            if let Err(e) = resolved {
                tracing::warn!(approval_id = %request.id, error = %e, "cli_resolve_failed");
            }
        }
    });
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match cli.config {
        Some(ref path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Config error: {e}");
                return ExitCode::FAILURE;
            }
        },
        None => Config::default(),
    };

    agentos_kernel::observability::init_tracing_with(&config.observability);

    let agent_id = match AgentId::from_string(cli.agent.clone()) {
        Ok(id) => id,
        Err(e) => {
            eprintln!("Invalid agent id: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut kernel = match Kernel::new(config, Arc::new(EchoBackend)) {
        Ok(kernel) => kernel,
        Err(e) => {
            eprintln!("Kernel error: {e}");
            return ExitCode::FAILURE;
        }
    };
    for profile in demo_backends() {
        kernel.router().register(profile);
    }
    if let Err(e) = kernel.start() {
        eprintln!("Kernel error: {e}");
        return ExitCode::FAILURE;
    }

    spawn_approver(kernel.approvals().clone(), cli.approve_all);

    let mut request = RoutingRequest::new(cli.task.join(" "), cli.category).priority(cli.priority);
    if let Some(max_cost) = cli.max_cost {
        request = request.max_cost(max_cost);
    }

    let outcome = kernel.dispatch(request, agent_id).await;
    kernel.shutdown().await;

    match outcome {
        Ok(outcome) => match serde_json::to_string_pretty(&outcome.result) {
            Ok(json) => {
                println!("{json}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Serialization error: {e}");
                ExitCode::FAILURE
            }
        },
        Err(e) => {
            eprintln!("Dispatch failed [{}]: {e}", e.code());
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentos_kernel::kernel::{ApprovalConfig, ApprovalLevel, ApprovalParams};

    #[tokio::test]
    async fn test_pending_notice_names_request() {
        let gate = ApprovalGate::new(ApprovalConfig::default());
        let request = gate
            .request_approval(ApprovalParams::new(
                "route:deep",
                "review this",
                ApprovalLevel::Approve,
                AgentId::must("cli"),
            ))
            .unwrap();

        let notice = pending_notice(&request);
        assert!(notice.starts_with(&format!("approval {} required", request.id)));
        assert!(notice.contains("route:deep"));
        assert!(notice.contains("--approve-all"));
    }

    #[tokio::test]
    async fn test_safety_review_without_approver_is_denied() {
        let mut kernel = Kernel::new(Config::default(), Arc::new(EchoBackend)).unwrap();
        for profile in demo_backends() {
            kernel.router().register(profile);
        }
        kernel.start().unwrap();
        spawn_approver(kernel.approvals().clone(), false);

        let err = kernel
            .dispatch(
                RoutingRequest::new("audit", TaskCategory::SafetyReview),
                AgentId::must("cli"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "APPROVAL_DENIED");
        assert!(err.to_string().contains("--approve-all"));
        kernel.shutdown().await;
    }
}
