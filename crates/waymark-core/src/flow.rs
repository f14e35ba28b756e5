//! Flow-control combinators: timeout, retry with backoff, compensating
//! transactions and bounded-concurrency fan-out.
//!
//! The combinators are generic over the error type so the same machinery
//! serves Rust callers (`SandboxError`) and script callers (`ErrorRecord`).

use std::future::Future;
use std::time::Duration;

use futures::future::{FutureExt, LocalBoxFuture};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::sandbox::error::{ErrorKind, SandboxError};

/// Race `fut` against a timer.
///
/// On expiry the future is dropped and `Timeout` is returned. Work the
/// future already handed off elsewhere is not interrupted.
pub async fn with_timeout<T, E, F>(limit: Duration, fut: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: From<SandboxError>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_elapsed) => Err(SandboxError::Timeout {
            limit_ms: limit.as_millis() as u64,
        }
        .into()),
    }
}

/// Exponential backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Upper bound on attempts, including the first one. `0` behaves as `1`.
    pub max_attempts: u32,
    /// Delay after the first failed attempt (milliseconds).
    pub base_delay_ms: u64,
    /// Cap applied to every delay (milliseconds).
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            max_delay_ms,
        }
    }

    /// Delay waited after failed attempt number `attempt` (1-based):
    /// `min(base * 2^(attempt - 1), max)`.
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let exp = attempt.saturating_sub(1);
        let factor = 1u64.checked_shl(exp).unwrap_or(u64::MAX);
        self.base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms)
    }
}

/// Outcome of [`retry_with_backoff`].
#[derive(Debug, Clone, PartialEq)]
pub struct RetryReport<T, E> {
    pub attempts: u32,
    /// Every delay actually waited, in order.
    pub delays_ms: Vec<u64>,
    pub outcome: Result<T, E>,
}

impl<T, E> RetryReport<T, E> {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn last_error(&self) -> Option<&E> {
        self.outcome.as_ref().err()
    }

    pub fn total_delay_ms(&self) -> u64 {
        self.delays_ms.iter().sum()
    }
}

/// Errors that are never worth retrying: the gate said no, the budget is
/// gone, the clock ran out or the script itself is broken.
pub fn default_should_retry(err: &SandboxError) -> bool {
    is_retryable_kind(err.kind())
}

pub fn is_retryable_kind(kind: ErrorKind) -> bool {
    !matches!(
        kind,
        ErrorKind::CapabilityDenied
            | ErrorKind::BudgetExceeded
            | ErrorKind::Timeout
            | ErrorKind::ScriptError
            | ErrorKind::InvalidArgument
            | ErrorKind::InvalidConfig
    )
}

/// Run `op` until it succeeds, `should_retry` rejects the last error, or
/// `policy.max_attempts` is reached. `op` receives the 1-based attempt.
pub async fn retry_with_backoff<T, E, F, Fut, S>(
    policy: &RetryPolicy,
    mut op: F,
    mut should_retry: S,
) -> RetryReport<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    S: FnMut(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut delays_ms = Vec::new();
    let mut attempt = 1;

    loop {
        match op(attempt).await {
            Ok(value) => {
                return RetryReport {
                    attempts: attempt,
                    delays_ms,
                    outcome: Ok(value),
                };
            }
            Err(err) => {
                if attempt >= max_attempts || !should_retry(&err) {
                    return RetryReport {
                        attempts: attempt,
                        delays_ms,
                        outcome: Err(err),
                    };
                }
                let delay = policy.delay_ms(attempt);
                debug!(attempt, delay_ms = delay, "retrying after failure");
                tokio::time::sleep(Duration::from_millis(delay)).await;
                delays_ms.push(delay);
                attempt += 1;
            }
        }
    }
}

type StepFn<'a, T, E> = Box<dyn FnOnce() -> LocalBoxFuture<'a, Result<T, E>> + 'a>;
type RollbackFn<'a, E> = Box<dyn FnOnce() -> LocalBoxFuture<'a, Result<(), E>> + 'a>;

/// One step of a [`transaction`], with an optional compensating action.
pub struct TransactionStep<'a, T, E> {
    name: String,
    execute: StepFn<'a, T, E>,
    rollback: Option<RollbackFn<'a, E>>,
}

impl<'a, T: 'a, E: 'a> TransactionStep<'a, T, E> {
    pub fn new<F, Fut>(name: impl Into<String>, execute: F) -> Self
    where
        F: FnOnce() -> Fut + 'a,
        Fut: Future<Output = Result<T, E>> + 'a,
    {
        Self {
            name: name.into(),
            execute: Box::new(move || execute().boxed_local()),
            rollback: None,
        }
    }

    pub fn with_rollback<F, Fut>(mut self, rollback: F) -> Self
    where
        F: FnOnce() -> Fut + 'a,
        Fut: Future<Output = Result<(), E>> + 'a,
    {
        self.rollback = Some(Box::new(move || rollback().boxed_local()));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// The step that broke a transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedStep<E> {
    pub index: usize,
    pub name: String,
    pub error: E,
}

/// Outcome of [`transaction`].
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionReport<T, E> {
    pub ok: bool,
    /// Values of the committed steps, in execution order.
    pub values: Vec<T>,
    pub committed: Vec<String>,
    pub failed: Option<FailedStep<E>>,
    /// Steps whose rollback ran successfully, in the order they ran.
    pub rolled_back: Vec<String>,
    /// Rollbacks that themselves failed. Recorded, never rethrown.
    pub rollback_errors: Vec<(String, E)>,
}

/// Execute `steps` in order. When step `k` fails, the rollbacks of steps
/// `0..k` run in reverse order and later steps never run.
pub async fn transaction<'a, T, E>(
    steps: Vec<TransactionStep<'a, T, E>>,
) -> TransactionReport<T, E> {
    let mut report = TransactionReport {
        ok: true,
        values: Vec::with_capacity(steps.len()),
        committed: Vec::with_capacity(steps.len()),
        failed: None,
        rolled_back: Vec::new(),
        rollback_errors: Vec::new(),
    };
    let mut compensations: Vec<(String, Option<RollbackFn<'a, E>>)> = Vec::new();

    for (index, step) in steps.into_iter().enumerate() {
        let TransactionStep {
            name,
            execute,
            rollback,
        } = step;
        match execute().await {
            Ok(value) => {
                report.values.push(value);
                report.committed.push(name.clone());
                compensations.push((name, rollback));
            }
            Err(error) => {
                debug!(step = %name, index, "transaction step failed, compensating");
                report.ok = false;
                report.failed = Some(FailedStep { index, name, error });
                break;
            }
        }
    }

    if !report.ok {
        for (name, rollback) in compensations.into_iter().rev() {
            let Some(rollback) = rollback else { continue };
            match rollback().await {
                Ok(()) => report.rolled_back.push(name),
                Err(err) => report.rollback_errors.push((name, err)),
            }
        }
    }

    report
}

/// Run `ops` with at most `concurrency` in flight. Every operation settles
/// on its own; results come back in input order.
pub async fn parallel<T, E, Fut>(
    ops: impl IntoIterator<Item = Fut>,
    concurrency: usize,
) -> Vec<Result<T, E>>
where
    Fut: Future<Output = Result<T, E>>,
{
    stream::iter(ops)
        .buffered(concurrency.max(1))
        .collect()
        .await
}
