//! Failure classification and the backoff decision.

use std::time::Duration;

use rampart_document::{BackendError, DocumentError};
use rand::Rng;

use crate::RetryConfig;

/// How a failed open should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// The stored record is newer than this server. Never retryable.
    BackwardsCompatibility,
    /// Throttling, timeouts, outages. Retryable.
    BackendService,
    /// A backend failure of unknown kind. Retryable up to the limit.
    Unclassified,
    /// Not a backend failure at all (store closed, open abandoned).
    /// Never retryable.
    Fatal,
}

impl FailureClass {
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::BackendService | Self::Unclassified)
    }
}

/// Maps a store error to its [`FailureClass`].
pub fn classify(error: &DocumentError) -> FailureClass {
    match error {
        DocumentError::Backend(BackendError::BackwardsCompatibility { .. }) => {
            FailureClass::BackwardsCompatibility
        }
        DocumentError::Backend(BackendError::Service(_)) => FailureClass::BackendService,
        DocumentError::Backend(BackendError::Other(_)) => FailureClass::Unclassified,
        DocumentError::StoreClosed
        | DocumentError::OpenAbandoned(_)
        | DocumentError::AlreadyClosed(_) => FailureClass::Fatal,
    }
}

/// Why the policy stopped retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailReason {
    /// The failure class is never retried.
    NotRetryable,
    /// The attempt limit was reached.
    Exhausted,
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    RetryAfter(Duration),
    Fail(FailReason),
}

/// Exponential backoff over a [`RetryConfig`].
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config: config.validated(),
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Decides what follows failed attempt number `attempt` (1-based).
    ///
    /// Pure: same inputs, same answer. Jitter is added by the caller.
    pub fn decide(&self, attempt: u32, class: FailureClass) -> Decision {
        if !class.is_retryable() {
            return Decision::Fail(FailReason::NotRetryable);
        }
        if attempt >= self.config.max_attempts {
            return Decision::Fail(FailReason::Exhausted);
        }
        Decision::RetryAfter(self.backoff(attempt))
    }

    /// `base_delay * 2^(attempt-1)`, capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.config
            .base_delay
            .saturating_mul(factor)
            .min(self.config.max_delay)
    }

    /// A random delay in `0..=max_jitter`.
    pub fn jitter(&self) -> Duration {
        let max_ms = self.config.max_jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=max_ms))
    }
}
