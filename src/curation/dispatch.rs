//! Task dispatcher: one model call with fixed-delay retry, per-call
//! timeout, cooperative cancellation and a per-run call budget.
//!
//! Failures never escape. After `max_attempts` failed attempts (or as soon
//! as the batch is cancelled) the caller gets its sentinel back, flagged as
//! degraded in the [`CallOutcome`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::future::join_all;
use thiserror::Error;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;

use super::traits::{Message, StructuredOutput, VisionModel};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(120);

// ── Policy ───────────────────────────────────────────────────────

/// Fixed-interval retry policy. Not exponential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Pause between consecutive attempts.
    pub delay: Duration,
    /// Upper bound on one raw model call; `None` waits forever.
    pub call_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            delay: DEFAULT_RETRY_DELAY,
            call_timeout: Some(DEFAULT_CALL_TIMEOUT),
        }
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            ..Self::default()
        }
    }

    pub fn with_call_timeout(mut self, limit: Option<Duration>) -> Self {
        self.call_timeout = limit;
        self
    }
}

/// Result of a dispatched call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallOutcome<T> {
    pub value: T,
    /// Attempts actually made (0 if cancelled before the first).
    pub attempts: u32,
    /// `true` when `value` is the sentinel.
    pub degraded: bool,
}

impl<T> CallOutcome<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CallOutcome<U> {
        CallOutcome {
            value: f(self.value),
            attempts: self.attempts,
            degraded: self.degraded,
        }
    }
}

#[derive(Debug, Error)]
#[error("model call timed out after {timeout_ms}ms")]
pub struct CallTimeout {
    pub timeout_ms: u128,
}

// ── Combinators ──────────────────────────────────────────────────

/// Run `op` until it succeeds, `policy.max_attempts` is reached, or `cancel`
/// fires; in the latter two cases return `sentinel()` marked degraded.
///
/// `op` receives the 1-based attempt number.
pub async fn retry_or<T, F, Fut, S>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    label: &str,
    mut op: F,
    sentinel: S,
) -> CallOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
    S: FnOnce() -> T,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempts = 0;

    while attempts < max_attempts {
        if cancel.is_cancelled() {
            break;
        }
        attempts += 1;

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = op(attempts) => result,
        };

        match result {
            Ok(value) => {
                return CallOutcome {
                    value,
                    attempts,
                    degraded: false,
                };
            }
            Err(err) => {
                tracing::warn!(
                    call = label,
                    attempt = attempts,
                    max_attempts,
                    error = %format!("{err:#}"),
                    "Model call failed"
                );
                if attempts < max_attempts {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(policy.delay) => {}
                    }
                }
            }
        }
    }

    tracing::warn!(
        call = label,
        attempts,
        cancelled = cancel.is_cancelled(),
        "Model call degraded to sentinel"
    );
    CallOutcome {
        value: sentinel(),
        attempts,
        degraded: true,
    }
}

/// Await `fut`, failing with [`CallTimeout`] after `limit`.
pub async fn with_timeout<T, Fut>(limit: Option<Duration>, fut: Fut) -> anyhow::Result<T>
where
    Fut: Future<Output = anyhow::Result<T>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| CallTimeout {
            timeout_ms: limit.as_millis(),
        })?,
        None => fut.await,
    }
}

/// Fan out `op` over `items` concurrently and collect results in input order.
pub async fn scatter_gather<I, F, Fut>(items: I, op: F) -> Vec<Fut::Output>
where
    I: IntoIterator,
    F: FnMut(I::Item) -> Fut,
    Fut: Future,
{
    join_all(items.into_iter().map(op)).await
}

// ── Dispatcher ───────────────────────────────────────────────────

/// Shared handle every reviewer dispatches through.
#[derive(Clone)]
pub struct Dispatcher {
    model: Arc<dyn VisionModel>,
    policy: RetryPolicy,
    budget: Option<Arc<Semaphore>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("model", &self.model.name())
            .field("policy", &self.policy)
            .field("budget", &self.budget.as_ref().map(|s| s.available_permits()))
            .finish()
    }
}

impl Dispatcher {
    pub fn new(model: Arc<dyn VisionModel>) -> Self {
        Self {
            model,
            policy: RetryPolicy::default(),
            budget: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Handle for one engine run: same model, policy and cancellation, with
    /// simultaneous raw model calls capped at `workers`.
    pub(crate) fn for_run(&self, workers: usize) -> Self {
        Self {
            budget: Some(Arc::new(Semaphore::new(workers.max(1)))),
            ..self.clone()
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    async fn permit(&self) -> anyhow::Result<Option<SemaphorePermit<'_>>> {
        match self.budget {
            Some(ref budget) => Ok(Some(
                budget.acquire().await.context("call budget closed")?,
            )),
            None => Ok(None),
        }
    }

    /// Free-text call. Degrades to an empty report.
    pub async fn report(&self, label: &str, messages: &[Message]) -> CallOutcome<String> {
        let this = self;
        retry_or(
            &self.policy,
            &self.cancel,
            label,
            move |attempt| async move {
                let _permit = this.permit().await?;
                tracing::debug!(call = label, attempt, model = this.model.name(), "Dispatching report call");
                with_timeout(this.policy.call_timeout, this.model.invoke(messages)).await
            },
            String::new,
        )
        .await
    }

    /// Structured call bound to `T`'s schema. A response that does not
    /// deserialize into `T` counts as a failed attempt.
    pub async fn judge<T, S>(&self, label: &str, messages: &[Message], sentinel: S) -> CallOutcome<T>
    where
        T: StructuredOutput,
        S: FnOnce() -> T,
    {
        let schema = T::output_schema();
        let schema = &schema;
        let this = self;
        retry_or(
            &self.policy,
            &self.cancel,
            label,
            move |attempt| async move {
                let raw = {
                    let _permit = this.permit().await?;
                    tracing::debug!(call = label, attempt, model = this.model.name(), schema = schema.name, "Dispatching structured call");
                    with_timeout(
                        this.policy.call_timeout,
                        this.model.invoke_structured(messages, schema),
                    )
                    .await?
                };
                serde_json::from_value::<T>(raw)
                    .with_context(|| format!("response does not match {} schema", T::NAME))
            },
            sentinel,
        )
        .await
    }
}
