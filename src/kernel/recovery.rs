//! Panic recovery at component boundaries.
//!
//! Units of work and backend invocations are foreign code from the kernel's
//! point of view. A panic inside one of them must surface as a typed
//! `Error::Internal` on the owning component's result, never unwind through
//! a public method.

use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use crate::types::{Error, Result};

/// Await a future with panic recovery.
///
/// Unlike wrapping only the future's construction, this catches panics raised
/// while the future is being polled.
pub async fn with_recovery_async<Fut, T>(future: Fut, operation_name: &str) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(panic_to_error(payload.as_ref(), operation_name)),
    }
}

/// Convert a failed spawned task into a kernel error.
pub(crate) fn join_error_to_error(err: tokio::task::JoinError, operation_name: &str) -> Error {
    if err.is_panic() {
        let payload = err.into_panic();
        panic_to_error(payload.as_ref(), operation_name)
    } else {
        Error::internal(format!("{} was aborted", operation_name))
    }
}

fn panic_to_error(payload: &(dyn Any + Send), operation_name: &str) -> Error {
    let message = panic_message(payload);
    tracing::error!(operation = operation_name, panic = %message, "panic_recovered");
    Error::internal(format!("{operation_name} panicked: {message}"))
}

/// `panic!` payloads are either a literal or a formatted `String`.
fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&'static str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("panic without message")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_recovery_async_passes_through() {
        let ok = with_recovery_async(async { Ok(42) }, "test_operation").await;
        assert_eq!(ok.unwrap(), 42);

        let err = with_recovery_async(
            async { Err::<(), _>(Error::validation("specific validation error")) },
            "test_operation",
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "VALIDATION");
        assert!(err.to_string().contains("specific validation error"));
    }

    #[tokio::test]
    async fn test_panic_becomes_internal_error() {
        let result: Result<()> = with_recovery_async(
            async {
                let fail = true;
                if fail {
                    panic!("test panic");
                }
                Ok(())
            },
            "test_operation",
        )
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.code(), "INTERNAL");
        assert_eq!(
            err.to_string(),
            "internal error: test_operation panicked: test panic"
        );
    }

    #[test]
    fn test_panic_message_payload_kinds() {
        let literal = std::panic::catch_unwind(|| panic!("literal")).unwrap_err();
        assert_eq!(panic_message(literal.as_ref()), "literal");

        let formatted = std::panic::catch_unwind(|| panic!("{} {}", "formatted", 7)).unwrap_err();
        assert_eq!(panic_message(formatted.as_ref()), "formatted 7");

        let opaque = std::panic::catch_unwind(|| std::panic::panic_any(42u8)).unwrap_err();
        assert_eq!(panic_message(opaque.as_ref()), "panic without message");
    }

    #[tokio::test]
    async fn test_with_recovery_async_catches_poll_panic() {
        let result: Result<()> = with_recovery_async(
            async {
                tokio::task::yield_now().await;
                let fail = true;
                if fail {
                    panic!("late panic");
                }
                Ok(())
            },
            "async_test",
        )
        .await;

        let err = result.unwrap_err();
        assert!(err.to_string().contains("late panic"));
    }

    #[tokio::test]
    async fn test_join_error_panic_is_converted() {
        let handle = tokio::spawn(async {
            panic!("worker exploded");
        });
        let err = handle.await.unwrap_err();
        let converted = join_error_to_error(err, "worker");
        assert!(converted.to_string().contains("worker exploded"));
    }
}
