//! Draw provider contracts, retry policy and concurrent range fetching.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lotto_core::{DrawId, RawDrawRow};
use lotto_storage::BackoffPolicy;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

mod extract;
mod providers;

pub use extract::{ExtractError, ExtractionProfile, HtmlSelectors, JsonSelectors, Selectors};
pub use providers::{
    build_provider, FixtureProvider, HttpDrawProvider, ProviderKind, ProviderSpec, RawCapture,
};

pub const CRATE_NAME: &str = "lotto-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderRole {
    Primary,
    Secondary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchTarget {
    Latest,
    Draw(DrawId),
}

impl fmt::Display for FetchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Latest => f.write_str("latest"),
            Self::Draw(id) => write!(f, "draw-{id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
}

impl AdapterContext {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            started_at: Utc::now(),
        }
    }
}

/// One attempt at one target, handed to the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub run_id: Uuid,
    pub target: FetchTarget,
    pub attempt: usize,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    /// Timeouts, 5xx, throttling, slow render. Retried.
    #[error("{provider}: transient failure: {message}")]
    Transient { provider: String, message: String },
    /// The source changed shape. Never retried; needs a profile fix.
    #[error("{provider}: response does not match expected structure: {message}")]
    StructuralMismatch { provider: String, message: String },
    #[error("{provider}: {target} not yet available")]
    NotYetAvailable { provider: String, target: String },
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn transient(provider: &str, message: impl Into<String>) -> Self {
        Self::Transient {
            provider: provider.to_string(),
            message: message.into(),
        }
    }

    pub fn structural(provider: &str, message: impl Into<String>) -> Self {
        Self::StructuralMismatch {
            provider: provider.to_string(),
            message: message.into(),
        }
    }

    pub fn not_yet_available(provider: &str, target: FetchTarget) -> Self {
        Self::NotYetAvailable {
            provider: provider.to_string(),
            target: target.to_string(),
        }
    }
}

/// A source of draw rows. `fetch` performs exactly one attempt; retries are
/// applied by [`fetch_with_retry`].
#[async_trait]
pub trait DrawProvider: Send + Sync {
    fn name(&self) -> &str;
    fn role(&self) -> ProviderRole;
    fn profile_version(&self) -> &str;

    async fn fetch(&self, request: &FetchRequest) -> Result<RawDrawRow, FetchError>;
}

/// Run one target against `provider`, retrying only transient failures.
pub async fn fetch_with_retry(
    provider: &dyn DrawProvider,
    ctx: &AdapterContext,
    target: FetchTarget,
    policy: &BackoffPolicy,
) -> Result<RawDrawRow, FetchError> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0usize;
    loop {
        let span = info_span!(
            "provider_fetch",
            run_id = %ctx.run_id,
            provider = provider.name(),
            %target,
            attempt
        );
        let request = FetchRequest {
            run_id: ctx.run_id,
            target,
            attempt,
        };
        match provider.fetch(&request).instrument(span).await {
            Err(err) if err.is_transient() && attempt + 1 < max_attempts => {
                let delay = policy.sample_delay(attempt);
                warn!(
                    provider = provider.name(),
                    %target,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient fetch failure; backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

pub async fn fetch_latest(
    provider: &dyn DrawProvider,
    ctx: &AdapterContext,
    policy: &BackoffPolicy,
) -> Result<RawDrawRow, FetchError> {
    fetch_with_retry(provider, ctx, FetchTarget::Latest, policy).await
}

/// Rows gathered for an id range. May be partial; the caller decides.
#[derive(Debug, Default)]
pub struct RangeFetch {
    pub rows: Vec<RawDrawRow>,
    pub not_yet_available: Vec<DrawId>,
    pub failures: Vec<(DrawId, FetchError)>,
}

impl RangeFetch {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && self.not_yet_available.is_empty()
    }
}

/// Fetch every id in `from..=to` concurrently, at most `concurrency` at once.
pub async fn fetch_range(
    provider: Arc<dyn DrawProvider>,
    ctx: &AdapterContext,
    from: DrawId,
    to: DrawId,
    policy: BackoffPolicy,
    concurrency: usize,
) -> RangeFetch {
    if from > to {
        return RangeFetch::default();
    }
    fetch_ids(provider, ctx, from..=to, policy, concurrency).await
}

/// Fetch an arbitrary set of ids concurrently, at most `concurrency` at once.
pub async fn fetch_ids(
    provider: Arc<dyn DrawProvider>,
    ctx: &AdapterContext,
    ids: impl IntoIterator<Item = DrawId>,
    policy: BackoffPolicy,
    concurrency: usize,
) -> RangeFetch {
    let mut out = RangeFetch::default();
    let mut pending: BTreeSet<DrawId> = ids.into_iter().collect();
    if pending.is_empty() {
        return out;
    }

    let limit = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut tasks = JoinSet::new();

    for &draw_id in &pending {
        let provider = Arc::clone(&provider);
        let limit = Arc::clone(&limit);
        let ctx = ctx.clone();
        tasks.spawn(async move {
            let Ok(_permit) = limit.acquire_owned().await else {
                return (
                    draw_id,
                    Err(FetchError::transient(provider.name(), "fetch limiter closed")),
                );
            };
            let result =
                fetch_with_retry(provider.as_ref(), &ctx, FetchTarget::Draw(draw_id), &policy).await;
            (draw_id, result)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((draw_id, result)) => {
                pending.remove(&draw_id);
                match result {
                    Ok(row) => out.rows.push(row),
                    Err(FetchError::NotYetAvailable { .. }) => out.not_yet_available.push(draw_id),
                    Err(err) => out.failures.push((draw_id, err)),
                }
            }
            Err(join_err) => warn!(error = %join_err, "range fetch task aborted"),
        }
    }

    for draw_id in pending {
        out.failures.push((
            draw_id,
            FetchError::transient(provider.name(), "fetch task aborted"),
        ));
    }

    out.rows.sort_by_key(|row| row.draw_id);
    out.not_yet_available.sort_unstable();
    out.failures.sort_by_key(|(id, _)| *id);
    out
}
