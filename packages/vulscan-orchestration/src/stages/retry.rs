//! Retry policy for stage calls
//!
//! Transient failures (unreachable, internal error) are retried with
//! exponential backoff; rejected input is returned immediately. An attempt
//! timeout bounds each attempt on its own, so a hung first attempt still
//! leaves room for the next one.

use crate::stage::{
    Classification, DependencyGraph, EmbeddingImage, NormalizedSource, StageClient, StageFailure,
    StageId, StageParams, StageResult,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    /// Total attempts including the first call
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

/// Default is a single attempt (no retries)
impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            base_backoff_ms: 500,
            max_backoff_ms: 8_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry following `attempt` (0-based): `base * 2^attempt`, capped
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let ms = self
            .base_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }

    /// Run `call` until it succeeds, fails permanently, or attempts run out.
    /// Each attempt is cut off after `attempt_timeout` and counts as
    /// `unreachable`.
    pub async fn run<T, F, Fut>(
        &self,
        stage: StageId,
        params: Option<&StageParams>,
        attempt_timeout: Option<Duration>,
        mut call: F,
    ) -> StageResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StageResult<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            let result = match attempt_timeout {
                Some(limit) => match tokio::time::timeout(limit, call()).await {
                    Ok(result) => result,
                    Err(_) => Err(StageFailure::unreachable(
                        stage,
                        format!("No response within {}ms", limit.as_millis()),
                    )),
                },
                None => call().await,
            };

            match result {
                Ok(value) => return Ok(value),
                Err(failure) if failure.is_retryable() && attempt + 1 < attempts => {
                    let delay = self.backoff(attempt);
                    warn!(
                        scan_id = ?params.map(|p| p.scan_id),
                        file_id = ?params.map(|p| p.file_id),
                        stage = %stage,
                        failure_kind = %failure.kind,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Stage call failed, retrying: {}",
                        failure.message
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(failure) => return Err(failure),
            }
        }
    }
}

/// Applies a `RetryPolicy` to every call of the wrapped client, health
/// health checks included
pub struct RetryingStageClient<C> {
    inner: C,
    policy: RetryPolicy,
    attempt_timeout: Option<Duration>,
}

impl<C: StageClient> RetryingStageClient<C> {
    pub fn new(inner: C, policy: RetryPolicy) -> Self {
        Self {
            inner,
            policy,
            attempt_timeout: None,
        }
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    async fn run<T, F, Fut>(&self, stage: StageId, params: Option<&StageParams>, call: F) -> StageResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StageResult<T>>,
    {
        self.policy
            .run(stage, params, self.attempt_timeout, call)
            .await
    }
}

#[async_trait]
impl<C: StageClient> StageClient for RetryingStageClient<C> {
    async fn normalize(&self, source: &Path, params: &StageParams) -> StageResult<NormalizedSource> {
        self.run(StageId::Normalize, Some(params), || {
            self.inner.normalize(source, params)
        })
        .await
    }

    async fn extract_graph(
        &self,
        normalized: &NormalizedSource,
        params: &StageParams,
    ) -> StageResult<DependencyGraph> {
        self.run(StageId::ExtractGraph, Some(params), || {
            self.inner.extract_graph(normalized, params)
        })
        .await
    }

    async fn build_image(
        &self,
        graph: &DependencyGraph,
        params: &StageParams,
    ) -> StageResult<EmbeddingImage> {
        self.run(StageId::BuildImage, Some(params), || {
            self.inner.build_image(graph, params)
        })
        .await
    }

    async fn classify(
        &self,
        image: &EmbeddingImage,
        params: &StageParams,
    ) -> StageResult<Classification> {
        self.run(StageId::Classify, Some(params), || {
            self.inner.classify(image, params)
        })
        .await
    }

    async fn health(&self, stage: StageId) -> StageResult<()> {
        self.run(stage, None, || self.inner.health(stage)).await
    }
}
