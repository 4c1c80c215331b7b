//! Billing and call-control backend
//!
//! The HTTP backend that places calls, records accept/reject/cancel/end, and
//! bills connected minutes. Consumed through [`CallBackend`]; the concrete
//! client is out of scope.

use crate::identity::PeerId;
use crate::types::{CallId, CallSummary, CallType, MediaCredentials, TerminationReason};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Backend errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Request did not reach the backend or timed out
    #[error("Network error: {0}")]
    Network(String),

    /// Balance too low for the request
    #[error("Insufficient funds")]
    InsufficientFunds,

    /// Target is offline or cannot take calls
    #[error("Peer unavailable: {0}")]
    PeerUnavailable(String),

    /// Target refused the call up front
    #[error("Declined: {0}")]
    Declined(String),

    /// Unknown call or user
    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed or unexpected response
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl BackendError {
    /// Whether retrying the same request may succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    /// Termination reason for a call the backend refused to place
    #[must_use]
    pub fn initiation_failure(&self) -> TerminationReason {
        match self {
            Self::InsufficientFunds => TerminationReason::InsufficientFunds,
            Self::PeerUnavailable(detail) | Self::NotFound(detail) => {
                TerminationReason::PeerUnavailable(detail.clone())
            }
            Self::Declined(detail) => TerminationReason::PeerDeclined(detail.clone()),
            Self::Network(detail) | Self::Protocol(detail) => {
                TerminationReason::InitiationFailed(detail.clone())
            }
        }
    }
}

/// Backend reply to a successful initiation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitiatedCall {
    /// Backend-assigned call ID
    pub call_id: CallId,
    /// Media channel credentials
    pub credentials: MediaCredentials,
    /// Purchased call budget
    pub max_duration_seconds: u64,
}

/// Backend verdict on a deduction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeductionOutcome {
    /// Minute billed
    Charged,
    /// Balance could not cover the minute
    InsufficientFunds,
}

/// Which call types a candidate currently accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerCapabilities {
    /// Accepts audio calls
    pub audio_enabled: bool,
    /// Accepts video calls
    pub video_enabled: bool,
}

impl PeerCapabilities {
    /// Whether a call of the given type may be placed
    #[must_use]
    pub fn allows(&self, call_type: CallType) -> bool {
        match call_type {
            CallType::Audio => self.audio_enabled,
            CallType::Video => self.video_enabled,
        }
    }
}

/// Call-control and billing backend
#[async_trait]
pub trait CallBackend: Send + Sync {
    /// Place a call and ring the target
    async fn initiate_call(
        &self,
        target: &PeerId,
        call_type: CallType,
    ) -> Result<InitiatedCall, BackendError>;

    /// Record that the receiver accepted
    async fn accept_call(&self, call_id: &CallId) -> Result<(), BackendError>;

    /// Record that the receiver declined
    async fn reject_call(&self, call_id: &CallId, reason: &str) -> Result<(), BackendError>;

    /// Stop ringing the receiver
    async fn cancel_call(&self, call_id: &CallId, reason: &str) -> Result<(), BackendError>;

    /// Close the call and settle billing
    async fn end_call(
        &self,
        call_id: &CallId,
        elapsed_seconds: u64,
    ) -> Result<CallSummary, BackendError>;

    /// Bill connected time up to `elapsed_seconds`
    async fn deduct(
        &self,
        call_id: &CallId,
        elapsed_seconds: u64,
    ) -> Result<DeductionOutcome, BackendError>;

    /// Seconds of the given call type the user can still afford
    async fn get_remaining_budget(
        &self,
        user: &PeerId,
        call_type: CallType,
    ) -> Result<u64, BackendError>;

    /// Current call-type toggles of a matching candidate
    async fn fetch_capabilities(&self, candidate: &PeerId)
        -> Result<PeerCapabilities, BackendError>;
}

/// Retry policy for backend requests issued as side effects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub attempts: u32,
    /// Linear backoff step
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

/// Run `request`, retrying transient failures with linear backoff
///
/// # Errors
///
/// Returns the first non-transient error, or the last error once every
/// attempt has failed
pub async fn with_retry<T, F, Fut>(
    policy: RetryPolicy,
    operation: &'static str,
    mut request: F,
) -> Result<T, BackendError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match request().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < attempts => {
                let backoff = policy.backoff * attempt;
                tracing::warn!(
                    operation,
                    attempt,
                    backoff_ms = backoff.as_millis(),
                    error = %e,
                    "Backend request failed, retrying"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => {
                tracing::warn!(operation, attempt, error = %e, "Backend request failed");
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result = with_retry(RetryPolicy::default(), "accept", || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(BackendError::Network("reset".to_string()))
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<(), _> = with_retry(RetryPolicy::default(), "deduct", || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(BackendError::InsufficientFunds) }
        })
        .await;
        assert_eq!(result.unwrap_err(), BackendError::InsufficientFunds);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_give_up_after_policy_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let policy = RetryPolicy {
            attempts: 2,
            backoff: Duration::from_millis(10),
        };
        let result: Result<(), _> = with_retry(policy, "end", || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(BackendError::Network("down".to_string())) }
        })
        .await;
        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_initiation_failure_mapping() {
        assert_eq!(
            BackendError::InsufficientFunds.initiation_failure(),
            TerminationReason::InsufficientFunds
        );
        assert_eq!(
            BackendError::PeerUnavailable("offline".into()).initiation_failure(),
            TerminationReason::PeerUnavailable("offline".into())
        );
        assert!(matches!(
            BackendError::Network("x".into()).initiation_failure(),
            TerminationReason::InitiationFailed(_)
        ));
    }

    #[test]
    fn test_capabilities_allow() {
        let caps = PeerCapabilities {
            audio_enabled: true,
            video_enabled: false,
        };
        assert!(caps.allows(CallType::Audio));
        assert!(!caps.allows(CallType::Video));
    }
}
