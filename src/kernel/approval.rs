//! Human-in-the-loop approval gate.
//!
//! Requests at or below the auto-approve threshold are resolved on the spot.
//! BLOCK is refused outright. Everything else waits as PENDING until a human
//! approves or denies it, or its timeout fires and marks it TIMEOUT.
//!
//! ```text
//! request_approval ──► BLOCK ──────────────► Err(Blocked)
//!                  ├─► level <= threshold ─► AUTO_APPROVED
//!                  └─► otherwise ──────────► PENDING ──► APPROVED
//!                                                    ├─► DENIED
//!                                                    └─► TIMEOUT
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;

use super::types::ApprovalLevel;
use crate::events::{EmitOptions, EventBus, EventType};
use crate::types::{AgentId, ApprovalError, ApprovalId};

const EVENT_SOURCE: &str = "approval_gate";

/// Approval gate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    /// Expiry applied when a request carries no timeout of its own.
    #[serde(with = "humantime_serde")]
    pub default_timeout: Duration,
    /// Levels at or below this are auto-approved.
    pub auto_approve_threshold: ApprovalLevel,
    /// Poll interval for `wait_for_resolution`.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// How long resolved requests are kept before the background sweep
    /// drops them.
    #[serde(with = "humantime_serde")]
    pub retention: Duration,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(300),
            auto_approve_threshold: ApprovalLevel::Auto,
            poll_interval: Duration::from_millis(500),
            retention: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
    Timeout,
    AutoApproved,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Denied => "denied",
            ApprovalStatus::Timeout => "timeout",
            ApprovalStatus::AutoApproved => "auto_approved",
        }
    }

    pub fn is_terminal(&self) -> bool {
        *self != ApprovalStatus::Pending
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An approval request and its resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: ApprovalId,
    pub operation: String,
    pub description: String,
    pub level: ApprovalLevel,
    pub agent_id: AgentId,
    pub context: Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: ApprovalStatus,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub reason: Option<String>,
}

/// Arguments to [`ApprovalGate::request_approval`].
#[derive(Debug, Clone)]
pub struct ApprovalParams {
    pub operation: String,
    pub description: String,
    pub level: ApprovalLevel,
    pub agent_id: AgentId,
    pub context: Value,
    pub timeout: Option<Duration>,
}

impl ApprovalParams {
    pub fn new(
        operation: impl Into<String>,
        description: impl Into<String>,
        level: ApprovalLevel,
        agent_id: AgentId,
    ) -> Self {
        Self {
            operation: operation.into(),
            description: description.into(),
            level,
            agent_id,
            context: Value::Null,
            timeout: None,
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug)]
struct Entry {
    request: ApprovalRequest,
    deadline: Instant,
    resolved: Option<Instant>,
}

impl Entry {
    fn is_overdue(&self) -> bool {
        self.request.status == ApprovalStatus::Pending && Instant::now() >= self.deadline
    }
}

#[derive(Debug)]
struct Inner {
    config: ApprovalConfig,
    requests: Mutex<HashMap<ApprovalId, Entry>>,
    stream: broadcast::Sender<ApprovalRequest>,
    pending: watch::Sender<usize>,
    events: Option<EventBus>,
}

/// Approval gate handle. Clones share one request store.
#[derive(Debug, Clone)]
pub struct ApprovalGate {
    inner: Arc<Inner>,
}

impl ApprovalGate {
    pub fn new(config: ApprovalConfig) -> Self {
        Self::build(config, None)
    }

    pub fn with_event_bus(config: ApprovalConfig, events: EventBus) -> Self {
        Self::build(config, Some(events))
    }

    fn build(config: ApprovalConfig, events: Option<EventBus>) -> Self {
        let (stream, _) = broadcast::channel(256);
        let (pending, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                config,
                requests: Mutex::new(HashMap::new()),
                stream,
                pending,
                events,
            }),
        }
    }

    pub fn config(&self) -> &ApprovalConfig {
        &self.inner.config
    }

    /// Submit an operation for approval.
    ///
    /// A PENDING request gets an expiry timer when called inside a tokio
    /// runtime. Without one, expiry is applied lazily on the next access.
    pub fn request_approval(
        &self,
        params: ApprovalParams,
    ) -> Result<ApprovalRequest, ApprovalError> {
        if params.level == ApprovalLevel::Block {
            tracing::warn!(
                operation = %params.operation,
                agent_id = %params.agent_id,
                "approval_blocked"
            );
            return Err(ApprovalError::Blocked(params.operation));
        }

        let timeout = params.timeout.unwrap_or(self.inner.config.default_timeout);
        let now = Utc::now();
        let expires_at = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let auto = params.level <= self.inner.config.auto_approve_threshold;

        let request = ApprovalRequest {
            id: ApprovalId::new(),
            operation: params.operation,
            description: params.description,
            level: params.level,
            agent_id: params.agent_id,
            context: params.context,
            created_at: now,
            expires_at,
            status: if auto {
                ApprovalStatus::AutoApproved
            } else {
                ApprovalStatus::Pending
            },
            resolved_at: auto.then_some(now),
            resolved_by: auto.then(|| "auto".to_string()),
            reason: None,
        };

        {
            let mut requests = self.inner.lock();
            requests.insert(
                request.id.clone(),
                Entry {
                    request: request.clone(),
                    deadline: deadline_after(timeout),
                    resolved: auto.then(Instant::now),
                },
            );
            self.inner.publish_pending(&requests);
        }

        if auto {
            tracing::debug!(
                approval_id = %request.id,
                operation = %request.operation,
                level = ?request.level,
                "approval_auto_approved"
            );
            self.inner.emit(EventType::ApprovalAutoApproved, &request);
            return Ok(request);
        }

        tracing::info!(
            approval_id = %request.id,
            operation = %request.operation,
            level = ?request.level,
            timeout_ms = timeout.as_millis() as u64,
            "approval_requested"
        );
        self.inner.emit(EventType::ApprovalRequested, &request);
        // No subscribers is fine; pending requests stay listable.
        let _ = self.inner.stream.send(request.clone());

        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(expire_after(
                Arc::downgrade(&self.inner),
                request.id.clone(),
                timeout,
            ));
        }

        Ok(request)
    }

    pub fn approve(
        &self,
        id: &ApprovalId,
        resolver: impl Into<String>,
        reason: Option<String>,
    ) -> Result<ApprovalRequest, ApprovalError> {
        self.inner
            .resolve(id, ApprovalStatus::Approved, resolver.into(), reason)
    }

    pub fn deny(
        &self,
        id: &ApprovalId,
        resolver: impl Into<String>,
        reason: Option<String>,
    ) -> Result<ApprovalRequest, ApprovalError> {
        self.inner
            .resolve(id, ApprovalStatus::Denied, resolver.into(), reason)
    }

    /// Poll until the request leaves PENDING or passes its expiry.
    ///
    /// `poll_interval` defaults to the configured interval.
    pub async fn wait_for_resolution(
        &self,
        id: &ApprovalId,
        poll_interval: Option<Duration>,
    ) -> Result<ApprovalRequest, ApprovalError> {
        let interval = poll_interval.unwrap_or(self.inner.config.poll_interval);
        loop {
            {
                let mut requests = self.inner.lock();
                let entry = requests
                    .get_mut(id)
                    .ok_or_else(|| ApprovalError::RequestNotFound(id.clone()))?;
                if entry.is_overdue() {
                    self.inner.mark_timed_out(entry);
                    let request = entry.request.clone();
                    self.inner.publish_pending(&requests);
                    return Ok(request);
                }
                if entry.request.status.is_terminal() {
                    return Ok(entry.request.clone());
                }
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// True only for APPROVED and AUTO_APPROVED.
    pub fn is_approved(&self, id: &ApprovalId) -> bool {
        self.inner.lock().get(id).is_some_and(|e| {
            matches!(
                e.request.status,
                ApprovalStatus::Approved | ApprovalStatus::AutoApproved
            )
        })
    }

    pub fn get(&self, id: &ApprovalId) -> Option<ApprovalRequest> {
        let mut requests = self.inner.lock();
        self.inner.expire_overdue(&mut requests);
        requests.get(id).map(|e| e.request.clone())
    }

    /// Pending requests, oldest first.
    pub fn list_pending(&self) -> Vec<ApprovalRequest> {
        let mut requests = self.inner.lock();
        self.inner.expire_overdue(&mut requests);
        let mut pending: Vec<_> = requests
            .values()
            .filter(|e| e.request.status == ApprovalStatus::Pending)
            .map(|e| e.request.clone())
            .collect();
        pending.sort_by_key(|r| r.created_at);
        pending
    }

    pub fn pending_count(&self) -> usize {
        *self.inner.pending.borrow()
    }

    /// Current pending count, then every change.
    pub fn subscribe_pending_count(&self) -> watch::Receiver<usize> {
        self.inner.pending.subscribe()
    }

    /// Stream of newly PENDING requests.
    pub fn subscribe_requests(&self) -> broadcast::Receiver<ApprovalRequest> {
        self.inner.stream.subscribe()
    }

    /// Drop resolved requests older than `retention`. Returns the count.
    pub fn cleanup_resolved(&self, retention: Duration) -> usize {
        let mut requests = self.inner.lock();
        self.inner.expire_overdue(&mut requests);
        let before = requests.len();
        requests.retain(|_, e| e.resolved.map_or(true, |at| at.elapsed() < retention));
        let removed = before - requests.len();
        if removed > 0 {
            tracing::debug!(removed, "approvals_cleaned_up");
        }
        removed
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, HashMap<ApprovalId, Entry>> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn resolve(
        &self,
        id: &ApprovalId,
        status: ApprovalStatus,
        resolver: String,
        reason: Option<String>,
    ) -> Result<ApprovalRequest, ApprovalError> {
        let mut requests = self.lock();
        let entry = requests
            .get_mut(id)
            .ok_or_else(|| ApprovalError::RequestNotFound(id.clone()))?;

        if entry.is_overdue() {
            self.mark_timed_out(entry);
            self.publish_pending(&requests);
            return Err(ApprovalError::Expired(id.clone()));
        }
        if entry.request.status.is_terminal() {
            return Err(match entry.request.status {
                ApprovalStatus::Timeout => ApprovalError::Expired(id.clone()),
                other => ApprovalError::AlreadyResolved {
                    id: id.clone(),
                    status: other.to_string(),
                },
            });
        }

        entry.request.status = status;
        entry.request.resolved_at = Some(Utc::now());
        entry.request.resolved_by = Some(resolver);
        entry.request.reason = reason;
        entry.resolved = Some(Instant::now());
        let request = entry.request.clone();
        self.publish_pending(&requests);
        drop(requests);

        tracing::info!(
            approval_id = %id,
            status = %status,
            resolved_by = ?request.resolved_by,
            "approval_resolved"
        );
        self.emit(EventType::ApprovalResolved, &request);
        Ok(request)
    }

    fn mark_timed_out(&self, entry: &mut Entry) {
        entry.request.status = ApprovalStatus::Timeout;
        entry.request.resolved_at = Some(Utc::now());
        entry.resolved = Some(Instant::now());
        tracing::warn!(
            approval_id = %entry.request.id,
            operation = %entry.request.operation,
            "approval_timed_out"
        );
        self.emit(EventType::ApprovalTimedOut, &entry.request);
    }

    fn expire_overdue(&self, requests: &mut HashMap<ApprovalId, Entry>) {
        let mut changed = false;
        for entry in requests.values_mut().filter(|e| e.is_overdue()) {
            self.mark_timed_out(entry);
            changed = true;
        }
        if changed {
            self.publish_pending(requests);
        }
    }

    fn publish_pending(&self, requests: &HashMap<ApprovalId, Entry>) {
        let count = requests
            .values()
            .filter(|e| e.request.status == ApprovalStatus::Pending)
            .count();
        self.pending.send_if_modified(|current| {
            let changed = *current != count;
            *current = count;
            changed
        });
    }

    fn emit(&self, event_type: EventType, request: &ApprovalRequest) {
        if let Some(ref events) = self.events {
            events.emit_with(
                event_type,
                EVENT_SOURCE,
                serde_json::json!({
                    "operation": request.operation,
                    "level": request.level,
                    "agent_id": request.agent_id,
                    "status": request.status,
                    "resolved_by": request.resolved_by,
                    "reason": request.reason,
                }),
                EmitOptions::correlated(request.id.as_str()),
            );
        }
    }
}

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(365 * 24 * 3600))
}

/// Expiry timer for one pending request. Holds only a weak handle so a
/// dropped gate does not linger until every timer fires.
async fn expire_after(inner: Weak<Inner>, id: ApprovalId, timeout: Duration) {
    tokio::time::sleep(timeout).await;
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let mut requests = inner.lock();
    if let Some(entry) = requests.get_mut(&id) {
        if entry.request.status == ApprovalStatus::Pending {
            inner.mark_timed_out(entry);
            inner.publish_pending(&requests);
        }
    }
}
