//! The external backend capability.
//!
//! The kernel never talks to a model provider itself. It hands a
//! [`BackendRequest`] to a [`Backend`] implementation together with the
//! profile of the backend the router picked, and gets content plus token
//! usage back, or a [`BackendError`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::registry::BackendProfile;
use super::TaskCategory;
use crate::types::RequestId;

/// What a backend is asked to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendRequest {
    pub request_id: RequestId,
    pub task: String,
    pub category: TaskCategory,
    pub max_output_tokens: u64,
}

/// Successful backend output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendResponse {
    pub content: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub finish_reason: String,
}

impl BackendResponse {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Backend-side failure. Always recoverable by trying the next candidate.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("backend failed: {0}")]
    Failed(String),
}

impl BackendError {
    /// Short label used for health error patterns.
    pub fn kind(&self) -> &'static str {
        match self {
            BackendError::Unavailable(_) => "unavailable",
            BackendError::RateLimited { .. } => "rate_limited",
            BackendError::InvalidResponse(_) => "invalid_response",
            BackendError::Failed(_) => "failed",
        }
    }
}

/// Invoke backend B with request R.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Backend: Send + Sync {
    async fn invoke(
        &self,
        profile: &BackendProfile,
        request: &BackendRequest,
    ) -> Result<BackendResponse, BackendError>;
}

/// Placeholder backend that echoes the task text back.
///
/// Token counts use the same four-characters-per-token heuristic the router
/// estimates with.
#[derive(Debug, Clone, Default)]
pub struct EchoBackend;

#[async_trait]
impl Backend for EchoBackend {
    async fn invoke(
        &self,
        profile: &BackendProfile,
        request: &BackendRequest,
    ) -> Result<BackendResponse, BackendError> {
        let content = format!("[{}] {}", profile.id, request.task);
        Ok(BackendResponse {
            input_tokens: (request.task.chars().count() as u64).div_ceil(4),
            output_tokens: (content.chars().count() as u64)
                .div_ceil(4)
                .min(request.max_output_tokens),
            content,
            finish_reason: "stop".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BackendId;

    #[tokio::test]
    async fn test_echo_backend_reports_usage() {
        let profile = BackendProfile::new(BackendId::must("local"), 0.0, 5);
        let request = BackendRequest {
            request_id: RequestId::new(),
            task: "abcdefgh".to_string(),
            category: TaskCategory::General,
            max_output_tokens: 1_000,
        };
        let response = EchoBackend.invoke(&profile, &request).await.unwrap();
        assert_eq!(response.content, "[local] abcdefgh");
        assert_eq!(response.input_tokens, 2);
        assert_eq!(response.finish_reason, "stop");
    }
}
