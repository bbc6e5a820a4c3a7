//! Rate-limit and circuit-breaker fabric.
//!
//! Every outbound call — model inference, actuator execution, storage —
//! goes through [`Fabric::invoke`]: take a token from the channel's bucket,
//! pass the channel's breaker, run the call under the remaining deadline,
//! and retry transient failures with jittered exponential backoff. The
//! fabric is an explicit value passed into every component; there are no
//! process-wide singletons.

pub mod breaker;
pub mod limiter;
pub mod router;

use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub use breaker::{BreakerConfig, BreakerMetrics, BreakerState, CircuitBreaker};
pub use limiter::{LimiterMetrics, TokenBucket};
pub use router::{backoff_delay, ComplexityEstimate, ModelRouter, ModelTier};

/// Errors surfaced to fabric callers.
#[derive(Debug, thiserror::Error)]
pub enum FabricError {
    #[error("Throttled on channel '{channel}'")]
    Throttled { channel: String },

    #[error("Circuit open on channel '{channel}'")]
    CircuitOpen { channel: String },

    #[error("Deadline exceeded on channel '{channel}' after {elapsed_ms}ms")]
    Timeout { channel: String, elapsed_ms: u64 },

    #[error("Upstream failure on channel '{channel}': {message}")]
    Upstream { channel: String, message: String, retryable: bool },

    #[error("Unknown channel '{0}'")]
    UnknownChannel(String),
}

impl FabricError {
    pub fn class(&self) -> crate::error::ErrorClass {
        use crate::error::ErrorClass;
        match self {
            FabricError::Throttled { .. } | FabricError::Timeout { .. } => {
                ErrorClass::TransientUpstream
            }
            FabricError::CircuitOpen { .. } => ErrorClass::TransientUpstream,
            FabricError::Upstream { retryable: true, .. } => ErrorClass::TransientUpstream,
            FabricError::Upstream { retryable: false, .. } => ErrorClass::PersistentUpstream,
            FabricError::UnknownChannel(_) => ErrorClass::LogicViolation,
        }
    }
}

/// One attempt's context handed to the caller's operation.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub attempt: u32,
    /// Caller-supplied idempotency key, forwarded so the upstream can
    /// deduplicate retries across breaker transitions.
    pub idempotency_key: Option<String>,
}

/// Error type returned by protected operations.
#[derive(Debug)]
pub struct UpstreamError {
    pub message: String,
    pub retryable: bool,
}

impl UpstreamError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self { message: message.into(), retryable: true }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self { message: message.into(), retryable: false }
    }
}

#[derive(Debug)]
struct Channel {
    breaker: CircuitBreaker,
    bucket: TokenBucket,
}

/// Metrics snapshot across all channels.
#[derive(Debug, Clone, Serialize)]
pub struct FabricMetrics {
    pub breakers: Vec<BreakerMetrics>,
    pub limiters: Vec<LimiterMetrics>,
}

/// The combined rate-limit + circuit-breaker layer.
#[derive(Debug)]
pub struct Fabric {
    channels: HashMap<String, Channel>,
    router: ModelRouter,
}

impl Fabric {
    pub fn new(config: &crate::config::FabricConfig) -> Self {
        let breaker_config = BreakerConfig::from_fabric(config);
        let wait_cap = Duration::from_secs(config.queue_wait_cap_secs);

        let mut channels = HashMap::new();
        for (name, limit) in &config.channels {
            channels.insert(
                name.clone(),
                Channel {
                    breaker: CircuitBreaker::new(name.clone(), breaker_config),
                    bucket: TokenBucket::new(
                        name.clone(),
                        limit.rate_per_sec,
                        limit.burst,
                        wait_cap,
                    ),
                },
            );
        }

        Self { channels, router: ModelRouter::from_config(config) }
    }

    pub fn router(&self) -> &ModelRouter {
        &self.router
    }

    /// Invoke a protected operation on a named channel.
    ///
    /// `priority` orders queued waiters (lower first); `deadline` bounds
    /// the whole invocation including queueing, retries, and backoff.
    pub async fn invoke<T, F, Fut>(
        &self,
        channel: &str,
        priority: u8,
        deadline: Duration,
        idempotency_key: Option<String>,
        mut op: F,
    ) -> Result<T, FabricError>
    where
        F: FnMut(CallContext) -> Fut + Send,
        Fut: Future<Output = Result<T, UpstreamError>> + Send,
    {
        let guard = self
            .channels
            .get(channel)
            .ok_or_else(|| FabricError::UnknownChannel(channel.to_string()))?;

        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            let remaining = deadline
                .checked_sub(started.elapsed())
                .ok_or_else(|| FabricError::Timeout {
                    channel: channel.to_string(),
                    elapsed_ms: started.elapsed().as_millis() as u64,
                })?;

            guard.bucket.acquire(priority, remaining).await?;
            guard.breaker.try_acquire()?;

            let remaining = deadline
                .checked_sub(started.elapsed())
                .ok_or_else(|| FabricError::Timeout {
                    channel: channel.to_string(),
                    elapsed_ms: started.elapsed().as_millis() as u64,
                })?;

            let context =
                CallContext { attempt, idempotency_key: idempotency_key.clone() };

            match tokio::time::timeout(remaining, op(context)).await {
                Ok(Ok(value)) => {
                    guard.breaker.on_success();
                    return Ok(value);
                }
                Ok(Err(upstream)) => {
                    guard.breaker.on_failure();
                    if !upstream.retryable {
                        warn!(channel, error = %upstream.message, "permanent upstream failure");
                        return Err(FabricError::Upstream {
                            channel: channel.to_string(),
                            message: upstream.message,
                            retryable: false,
                        });
                    }
                    debug!(channel, attempt, error = %upstream.message, "transient upstream failure, backing off");
                    let delay = backoff_delay(attempt);
                    let left = deadline.saturating_sub(started.elapsed());
                    if left <= delay {
                        return Err(FabricError::Upstream {
                            channel: channel.to_string(),
                            message: upstream.message,
                            retryable: true,
                        });
                    }
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(_) => {
                    guard.breaker.on_failure();
                    return Err(FabricError::Timeout {
                        channel: channel.to_string(),
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    });
                }
            }
        }
    }

    pub fn metrics(&self) -> FabricMetrics {
        let mut breakers: Vec<BreakerMetrics> =
            self.channels.values().map(|c| c.breaker.metrics()).collect();
        breakers.sort_by(|a, b| a.name.cmp(&b.name));
        let mut limiters: Vec<LimiterMetrics> =
            self.channels.values().map(|c| c.bucket.metrics()).collect();
        limiters.sort_by(|a, b| a.name.cmp(&b.name));
        FabricMetrics { breakers, limiters }
    }

    /// Breaker state for one channel, if it exists.
    pub fn breaker_state(&self, channel: &str) -> Option<BreakerState> {
        self.channels.get(channel).map(|c| c.breaker.state())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FabricConfig;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fabric() -> Fabric {
        Fabric::new(&FabricConfig::default())
    }

    #[tokio::test]
    async fn successful_call_passes_through() {
        let fabric = fabric();
        let result: Result<u32, _> = fabric
            .invoke("store", 1, Duration::from_secs(1), None, |_ctx| async { Ok(7u32) })
            .await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn unknown_channel_is_rejected() {
        let fabric = fabric();
        let result: Result<(), _> = fabric
            .invoke("nope", 1, Duration::from_secs(1), None, |_ctx| async { Ok(()) })
            .await;
        assert!(matches!(result, Err(FabricError::UnknownChannel(_))));
    }

    #[tokio::test]
    async fn permanent_failures_do_not_retry() {
        let fabric = fabric();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();
        let result: Result<(), _> = fabric
            .invoke("store", 1, Duration::from_secs(5), None, move |_ctx| {
                let calls = calls_in.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(UpstreamError::permanent("schema mismatch"))
                }
            })
            .await;
        assert!(matches!(result, Err(FabricError::Upstream { retryable: false, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_failures_retry_until_success() {
        let fabric = fabric();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();
        let result: Result<u32, _> = fabric
            .invoke("store", 1, Duration::from_secs(30), None, move |ctx| {
                let calls = calls_in.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if ctx.attempt == 0 {
                        Err(UpstreamError::transient("throttled"))
                    } else {
                        Ok(11u32)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 11);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn breaker_opens_after_repeated_failures() {
        let fabric = fabric();
        for _ in 0..5 {
            let _: Result<(), _> = fabric
                .invoke("actuator", 1, Duration::from_secs(1), None, |_ctx| async {
                    Err::<(), _>(UpstreamError::permanent("down"))
                })
                .await;
        }
        assert_eq!(fabric.breaker_state("actuator"), Some(BreakerState::Open));

        let result: Result<(), _> = fabric
            .invoke("actuator", 1, Duration::from_secs(1), None, |_ctx| async { Ok(()) })
            .await;
        assert!(matches!(result, Err(FabricError::CircuitOpen { .. })));
    }

    #[tokio::test]
    async fn idempotency_key_reaches_every_attempt() {
        let fabric = fabric();
        let result: Result<String, _> = fabric
            .invoke(
                "store",
                1,
                Duration::from_secs(1),
                Some("idem-42".to_string()),
                |ctx| async move { Ok(ctx.idempotency_key.unwrap_or_default()) },
            )
            .await;
        assert_eq!(result.unwrap(), "idem-42");
    }

    #[tokio::test]
    async fn metrics_cover_all_channels() {
        let fabric = fabric();
        let metrics = fabric.metrics();
        assert_eq!(metrics.breakers.len(), 4);
        assert_eq!(metrics.limiters.len(), 4);
    }
}
