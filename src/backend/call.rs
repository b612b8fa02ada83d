//! Typed outcomes and timeout-bounded scatter/gather for backend calls.

use futures_util::future::join_all;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::StrategyCapability;
use crate::strategy::StrategyId;

/// Result of a single external call.
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome<T> {
    /// The backend answered.
    Ok(T),
    /// The backend did not answer within the timeout.
    Impaired(String),
    /// The backend answered with an error (or the task died).
    Failed(String),
}

impl<T> CallOutcome<T> {
    pub fn is_ok(&self) -> bool {
        matches!(self, CallOutcome::Ok(_))
    }

    /// Value on success.
    pub fn ok(self) -> Option<T> {
        match self {
            CallOutcome::Ok(value) => Some(value),
            _ => None,
        }
    }

    /// Failure reason, if the call did not succeed.
    pub fn reason(&self) -> Option<&str> {
        match self {
            CallOutcome::Ok(_) => None,
            CallOutcome::Impaired(reason) | CallOutcome::Failed(reason) => Some(reason),
        }
    }
}

impl<T> fmt::Display for CallOutcome<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallOutcome::Ok(_) => write!(f, "ok"),
            CallOutcome::Impaired(reason) => write!(f, "impaired: {}", reason),
            CallOutcome::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Await `call` for at most `timeout`.
pub async fn guarded<T, F>(timeout: Duration, call: F) -> CallOutcome<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(value)) => CallOutcome::Ok(value),
        Ok(Err(e)) => CallOutcome::Failed(e.to_string()),
        Err(_) => CallOutcome::Impaired(format!("no response within {:?}", timeout)),
    }
}

/// One backend call to dispatch.
pub struct CallTarget<A> {
    pub id: StrategyId,
    pub backend: Option<Arc<dyn StrategyCapability>>,
    pub arg: A,
}

/// Dispatch one call per target as independent tasks and gather the
/// outcomes in target order.
///
/// Each task is bounded by `timeout`. A target without a resolved backend,
/// or whose task panics, yields [`CallOutcome::Failed`].
pub async fn scatter<A, T, F, Fut>(
    targets: Vec<CallTarget<A>>,
    timeout: Duration,
    op: F,
) -> Vec<(StrategyId, CallOutcome<T>)>
where
    A: Send + 'static,
    T: Send + 'static,
    F: Fn(Arc<dyn StrategyCapability>, A) -> Fut,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    let mut ids = Vec::with_capacity(targets.len());
    let mut handles = Vec::with_capacity(targets.len());

    for target in targets {
        ids.push(target.id.clone());
        let handle = match target.backend {
            Some(backend) => {
                let call = op(backend, target.arg);
                Some(tokio::spawn(guarded(timeout, call)))
            }
            None => None,
        };
        handles.push(handle);
    }

    debug!(calls = ids.len(), ?timeout, "Scattering backend calls");

    let gathered = join_all(handles.into_iter().map(|handle| async move {
        match handle {
            Some(handle) => match handle.await {
                Ok(outcome) => outcome,
                Err(e) => CallOutcome::Failed(format!("task aborted: {}", e)),
            },
            None => CallOutcome::Failed("no adapter registered".to_string()),
        }
    }))
    .await;

    ids.into_iter().zip(gathered).collect()
}
