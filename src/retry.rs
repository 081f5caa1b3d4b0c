//! Retry policy and exponential backoff
//!
//! [`RetryConfig`] decides how long to wait and how often to try again;
//! a [`RetryPolicy`] decides whether a given error is worth another attempt.
//! [`Retrier`] combines both with the transfer deadline and cancellation.

use crate::cancel::CancellationToken;
use crate::error::{Result, TransferError, TransportErrorKind};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Service error codes treated as transient by default:
/// timeout, transport, unavailable, concurrent lock conflict, request queue full.
pub const DEFAULT_RETRIABLE_CODES: [i64; 5] = [3, 100, 105, 402, 904];

/// Backoff configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay_ms: u64,
    /// Upper bound for any single delay
    pub max_delay_ms: u64,
    /// Growth factor between consecutive delays
    pub backoff_multiplier: f64,
    /// Add up to 25% random jitter
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 6,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Configuration that never retries
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Short deterministic delays, for tests and local services
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    /// Delay before retry number `attempt` (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay_ms as f64);

        let millis = if self.jitter {
            capped * (1.0 + rand::thread_rng().gen_range(0.0..0.25))
        } else {
            capped
        };
        Duration::from_nanos((millis * 1_000_000.0).round() as u64)
    }

    /// Returns true if more retries are allowed after `attempt` failures
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// Decides whether an error is transient
pub trait RetryPolicy: Send + Sync + std::fmt::Debug {
    /// Whether another attempt may succeed
    fn is_retriable(&self, error: &TransferError) -> bool;
}

/// Transport errors, HTTP 5xx/429 and a set of service codes are transient
#[derive(Debug, Clone)]
pub struct DefaultRetryPolicy {
    retriable_codes: HashSet<i64>,
}

impl DefaultRetryPolicy {
    /// Policy with a custom set of retriable service codes
    pub fn new(codes: impl IntoIterator<Item = i64>) -> Self {
        Self {
            retriable_codes: codes.into_iter().collect(),
        }
    }
}

impl Default for DefaultRetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_RETRIABLE_CODES)
    }
}

impl RetryPolicy for DefaultRetryPolicy {
    fn is_retriable(&self, error: &TransferError) -> bool {
        match error {
            TransferError::Transport { .. } => true,
            TransferError::Service {
                code, http_status, ..
            } => {
                http_status.is_some_and(|s| s >= 500 || s == 429)
                    || self.retriable_codes.contains(code)
            }
            _ => false,
        }
    }
}

/// Point in time after which no new attempt starts
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
    limit: Duration,
}

impl Deadline {
    /// Deadline `limit` from now
    pub fn after(limit: Duration) -> Self {
        Self {
            at: Instant::now() + limit,
            limit,
        }
    }

    /// Fail with `DeadlineExceeded` if sleeping `delay` would cross the deadline
    pub fn check(&self, delay: Duration) -> Result<()> {
        if Instant::now() + delay >= self.at {
            return Err(TransferError::DeadlineExceeded(self.limit));
        }
        Ok(())
    }
}

/// Run `future` with an optional per-attempt timeout
pub async fn with_timeout<T>(
    timeout: Option<Duration>,
    what: &str,
    future: impl Future<Output = Result<T>>,
) -> Result<T> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, future).await.map_err(|_| {
            TransferError::transport(
                TransportErrorKind::Timeout,
                format!("{} timed out after {:?}", what, limit),
            )
        })?,
        None => future.await,
    }
}

/// Sleep unless cancelled first
pub async fn sleep_or_cancel(delay: Duration, cancel: Option<&CancellationToken>) -> Result<()> {
    match cancel {
        Some(token) => tokio::select! {
            _ = token.cancelled() => Err(TransferError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        },
        None => {
            tokio::time::sleep(delay).await;
            Ok(())
        }
    }
}

/// Retry loop shared by the write paths
#[derive(Debug, Clone)]
pub struct Retrier {
    config: RetryConfig,
    policy: Arc<dyn RetryPolicy>,
    attempt_timeout: Option<Duration>,
    deadline: Option<Deadline>,
    cancel: Option<CancellationToken>,
}

impl Retrier {
    /// Create a retrier
    pub fn new(config: RetryConfig, policy: Arc<dyn RetryPolicy>) -> Self {
        Self {
            config,
            policy,
            attempt_timeout: None,
            deadline: None,
            cancel: None,
        }
    }

    /// Bound every attempt
    pub fn with_attempt_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Stop retrying past this deadline
    pub fn with_deadline(mut self, deadline: Option<Deadline>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Abort backoff sleeps on cancellation
    pub fn with_cancel(mut self, cancel: Option<CancellationToken>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Retry configuration in use
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Retry policy in use
    pub fn policy(&self) -> &Arc<dyn RetryPolicy> {
        &self.policy
    }

    /// Run `operation` until it succeeds, fails permanently or runs out of
    /// retries. Returns the value and the number of retries spent.
    pub async fn run<T, F, Fut>(&self, context: &str, mut operation: F) -> Result<(T, u32)>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;

        loop {
            if self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
                return Err(TransferError::Cancelled);
            }

            match with_timeout(self.attempt_timeout, context, operation()).await {
                Ok(value) => return Ok((value, attempt)),
                Err(e) if !self.policy.is_retriable(&e) => return Err(e),
                Err(e) if !self.config.should_retry(attempt) => {
                    return Err(TransferError::exhausted(context, attempt + 1, e));
                }
                Err(e) => {
                    let delay = self.config.delay_for_attempt(attempt);
                    if let Some(deadline) = &self.deadline {
                        deadline.check(delay)?;
                    }
                    attempt += 1;
                    tracing::warn!(
                        "{} failed (attempt {}/{}): {}. Retrying in {:?}",
                        context,
                        attempt,
                        self.config.max_retries,
                        e,
                        delay
                    );
                    sleep_or_cancel(delay, self.cancel.as_ref()).await?;
                }
            }
        }
    }
}
