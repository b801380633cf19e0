//! One ingestion run: fetch, validate, reconcile, merge, track, notify, report.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use lotto_adapters::{
    build_provider, fetch_ids, fetch_latest, AdapterContext, DrawProvider, FetchError, RawCapture,
};
use lotto_core::{
    DispatchRecord, DivergenceReport, DrawId, DrawRecord, EventKind, FailureKind, IngestionRun,
    NotificationEvent, RawDrawRow, RunFailure, RunOutcome,
};
use lotto_storage::{
    AnomalyStateFile, ArtifactStore, BackoffPolicy, DrawStore, HttpClientConfig, HttpFetcher,
    StoreError,
};
use serde_json::json;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::anomaly::{AnomalyTracker, TrackerError};
use crate::config::{DivergencePolicy, NotifyConfig, ProviderRegistry, SyncConfig};
use crate::maintenance::{AlwaysOpen, MaintenanceGate, PauseFile};
use crate::notify::Notifier;
use crate::reconcile::reconcile;
use crate::report::write_report;
use crate::validate::{validate, ValidatedBatch};

/// Knobs for a single run. Taken from [`SyncConfig`] in production.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub backoff: BackoffPolicy,
    pub fetch_concurrency: usize,
    /// Lowest draw id the store should hold; `None` takes only the latest
    /// draw on an empty store.
    pub backfill_from: Option<DrawId>,
    /// Most ids one run may request besides the latest draw.
    pub max_backfill: usize,
    pub reconcile: bool,
    pub divergence_policy: DivergencePolicy,
    pub fallback_to_secondary: bool,
    /// How long a finished run waits for background raw captures.
    pub capture_drain: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            fetch_concurrency: 4,
            backfill_from: None,
            max_backfill: 100,
            reconcile: true,
            divergence_policy: DivergencePolicy::Block,
            fallback_to_secondary: false,
            capture_drain: Duration::from_secs(10),
        }
    }
}

impl From<&SyncConfig> for PipelineSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            backoff: config.backoff(),
            fetch_concurrency: config.fetch_concurrency,
            backfill_from: config.backfill_from,
            max_backfill: config.max_backfill,
            reconcile: config.reconcile,
            divergence_policy: config.divergence_policy,
            fallback_to_secondary: config.fallback_to_secondary,
            capture_drain: config.store_timeout(),
        }
    }
}

/// Accumulates report fields while stages complete; sealed into an
/// [`IngestionRun`] exactly once.
struct RunRecorder {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    rows_fetched: usize,
    rows_inserted: usize,
    rows_updated: usize,
    source_used: Option<String>,
    latest_draw_id: Option<DrawId>,
    consecutive_no_new_draws: Option<u32>,
    divergent_draw_ids: Vec<DrawId>,
    missing_draw_ids: Vec<DrawId>,
    notifications: Vec<DispatchRecord>,
}

impl RunRecorder {
    fn start() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            rows_fetched: 0,
            rows_inserted: 0,
            rows_updated: 0,
            source_used: None,
            latest_draw_id: None,
            consecutive_no_new_draws: None,
            divergent_draw_ids: Vec::new(),
            missing_draw_ids: Vec::new(),
            notifications: Vec::new(),
        }
    }

    fn seal(
        self,
        outcome: RunOutcome,
        failure: Option<RunFailure>,
        skipped: Option<String>,
    ) -> IngestionRun {
        IngestionRun {
            run_id: self.run_id,
            started_at: self.started_at,
            finished_at: Utc::now(),
            outcome,
            rows_fetched: self.rows_fetched,
            rows_inserted: self.rows_inserted,
            rows_updated: self.rows_updated,
            source_used: self.source_used,
            latest_draw_id: self.latest_draw_id,
            consecutive_no_new_draws: self.consecutive_no_new_draws,
            divergent_draw_ids: self.divergent_draw_ids,
            missing_draw_ids: self.missing_draw_ids,
            notifications: self.notifications,
            failure,
            skipped,
        }
    }
}

fn failure(kind: FailureKind, message: impl Into<String>) -> RunFailure {
    RunFailure {
        kind,
        message: message.into(),
    }
}

fn fetch_failure(err: &FetchError) -> RunFailure {
    let kind = match err {
        FetchError::StructuralMismatch { .. } => FailureKind::StructuralMismatch,
        FetchError::Transient { .. } | FetchError::NotYetAvailable { .. } => FailureKind::Transient,
    };
    failure(kind, err.to_string())
}

fn tracker_failure(err: TrackerError) -> RunFailure {
    failure(FailureKind::State, err.to_string())
}

fn store_failure(err: StoreError) -> RunFailure {
    let kind = match err {
        StoreError::Conflict { .. } => FailureKind::Conflict,
        _ => FailureKind::Storage,
    };
    failure(kind, err.to_string())
}

/// Rows a provider produced for this run.
#[derive(Default)]
struct Fetched {
    rows: Vec<RawDrawRow>,
    latest: Option<DrawId>,
    /// Requested ids the provider reported as not available.
    missing: Vec<DrawId>,
}

/// What the store already holds, as seen at the start of the run.
struct StoreView {
    max: Option<DrawId>,
    gaps: Vec<DrawId>,
}

pub struct SyncPipeline {
    store: DrawStore,
    tracker: AnomalyTracker,
    notifier: Notifier,
    primary: Arc<dyn DrawProvider>,
    secondary: Option<Arc<dyn DrawProvider>>,
    gate: Arc<dyn MaintenanceGate>,
    settings: PipelineSettings,
    reports_dir: Option<PathBuf>,
    capture: Option<RawCapture>,
}

impl SyncPipeline {
    pub fn new(
        store: DrawStore,
        tracker: AnomalyTracker,
        notifier: Notifier,
        primary: Arc<dyn DrawProvider>,
    ) -> Self {
        Self {
            store,
            tracker,
            notifier,
            primary,
            secondary: None,
            gate: Arc::new(AlwaysOpen),
            settings: PipelineSettings::default(),
            reports_dir: None,
            capture: None,
        }
    }

    pub fn with_secondary(mut self, secondary: Arc<dyn DrawProvider>) -> Self {
        self.secondary = Some(secondary);
        self
    }

    pub fn with_gate(mut self, gate: Arc<dyn MaintenanceGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_settings(mut self, settings: PipelineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_reports_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.reports_dir = Some(dir.into());
        self
    }

    /// Raw capture shared with the providers; drained at the end of each run.
    pub fn with_capture(mut self, capture: RawCapture) -> Self {
        self.capture = Some(capture);
        self
    }

    /// Wire every collaborator from configuration and `providers.yaml`.
    pub async fn from_config(config: &SyncConfig) -> anyhow::Result<Self> {
        config.check()?;
        let registry = ProviderRegistry::load(&config.providers_file).await?;
        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: config.http_timeout(),
            user_agent: Some(config.user_agent.clone()),
        })?;
        let capture = config
            .capture_raw
            .then(|| RawCapture::new(ArtifactStore::new(config.artifacts_dir.clone())));

        let primary = build_provider(registry.primary()?, &fetcher, capture.as_ref())?;
        let secondary = registry
            .secondary()
            .map(|spec| build_provider(spec, &fetcher, capture.as_ref()))
            .transpose()?;

        let store = DrawStore::connect(&config.database_url, config.store_timeout())
            .await
            .with_context(|| format!("opening draw store {}", config.database_url))?;
        let tracker = AnomalyTracker::new(
            AnomalyStateFile::new(config.anomaly_state_path(), config.store_timeout()),
            config.anomaly_threshold,
        )?;
        let notifier = NotifyConfig::from_env()?.build(config.notify_timeout())?;

        let mut pipeline = Self::new(store, tracker, notifier, primary)
            .with_gate(Arc::new(PauseFile::new(config.pause_file.clone())))
            .with_settings(PipelineSettings::from(config))
            .with_reports_dir(config.reports_dir.clone());
        if let Some(secondary) = secondary {
            pipeline = pipeline.with_secondary(secondary);
        }
        if let Some(capture) = capture {
            pipeline = pipeline.with_capture(capture);
        }
        Ok(pipeline)
    }

    pub fn store(&self) -> &DrawStore {
        &self.store
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Run once. Always returns a report; failures are recorded inside it.
    pub async fn run_once(&self) -> IngestionRun {
        let mut recorder = RunRecorder::start();
        let span = info_span!("sync_run", run_id = %recorder.run_id);

        let run = async move {
            if let Some(reason) = self.gate.paused().await {
                info!(%reason, "ingestion paused; skipping run");
                return recorder.seal(RunOutcome::Success, None, Some(reason));
            }
            match self.execute(&mut recorder).await {
                Ok(outcome) => recorder.seal(outcome, None, None),
                Err(failure) => {
                    error!(kind = ?failure.kind, message = %failure.message, "ingestion run failed");
                    recorder.seal(RunOutcome::Failed, Some(failure), None)
                }
            }
        }
        .instrument(span)
        .await;

        if let Some(capture) = &self.capture {
            let abandoned = capture.drain(self.settings.capture_drain).await;
            if abandoned > 0 {
                warn!(run_id = %run.run_id, abandoned, "raw captures not written");
            }
        }

        if let Some(dir) = &self.reports_dir {
            match write_report(dir, &run).await {
                Ok(path) => info!(run_id = %run.run_id, path = %path.display(), "run report written"),
                Err(err) => error!(run_id = %run.run_id, error = %err, "failed to write run report"),
            }
        }

        info!(
            run_id = %run.run_id,
            outcome = ?run.outcome,
            exit_code = run.exit_code(),
            rows_fetched = run.rows_fetched,
            rows_inserted = run.rows_inserted,
            rows_updated = run.rows_updated,
            source = run.source_used.as_deref().unwrap_or("-"),
            latest_draw_id = ?run.latest_draw_id,
            consecutive_no_new_draws = ?run.consecutive_no_new_draws,
            divergences = run.divergent_draw_ids.len(),
            missing = ?run.missing_draw_ids,
            "ingestion run finished"
        );
        run
    }

    async fn execute(&self, rec: &mut RunRecorder) -> Result<RunOutcome, RunFailure> {
        let state = self.tracker.state().await.map_err(tracker_failure)?;
        rec.consecutive_no_new_draws = Some(state.consecutive_no_new_draws);

        let view = StoreView {
            max: self.store.max_draw_id().await.map_err(store_failure)?,
            gaps: self
                .store
                .missing_ids(self.settings.backfill_from)
                .await
                .map_err(store_failure)?,
        };
        let stored_max = view.max;
        let ctx = AdapterContext::new(rec.run_id);

        let (fetched, source) = self.fetch_with_fallback(&ctx, &view).await?;
        rec.rows_fetched = fetched.rows.len();
        rec.latest_draw_id = fetched.latest.or(stored_max);
        rec.source_used = Some(source.name().to_string());
        rec.missing_draw_ids = fetched.missing.clone();

        let batch = validate(fetched.rows).map_err(|err| {
            failure(FailureKind::Validation, err.to_string())
        })?;

        if let Some(secondary) = self.reconcile_partner(&source) {
            let report = self.cross_check(&ctx, &secondary, &batch).await;
            if !report.is_empty() {
                rec.divergent_draw_ids = report.draw_ids().into_iter().collect();
                let dispatch = self.notify_divergence(&source, secondary.as_ref(), &report).await;
                rec.notifications.push(dispatch);
                if self.settings.divergence_policy == DivergencePolicy::Block {
                    return Err(failure(
                        FailureKind::Divergence,
                        format!(
                            "{} and {} disagree on draws {:?}; nothing merged",
                            source.name(),
                            secondary.name(),
                            rec.divergent_draw_ids
                        ),
                    ));
                }
            }
        }

        let counts = self
            .store
            .merge(batch.records())
            .await
            .map_err(store_failure)?;
        rec.rows_inserted = counts.inserted;
        rec.rows_updated = counts.updated;

        if counts.inserted > 0 {
            let transition = self.tracker.record_new_draws().await.map_err(tracker_failure)?;
            rec.consecutive_no_new_draws = Some(transition.counter);
            return Ok(RunOutcome::Success);
        }

        let transition = self
            .tracker
            .record_no_new_draws()
            .await
            .map_err(tracker_failure)?;
        rec.consecutive_no_new_draws = Some(transition.counter);

        if transition.crossed {
            let event = NotificationEvent {
                kind: EventKind::Anomaly,
                message: format!(
                    "No new draw for {} consecutive runs (threshold {}); latest stored draw is {}",
                    transition.counter,
                    self.tracker.threshold(),
                    stored_max.map_or_else(|| "none".to_string(), |id| id.to_string())
                ),
                context: json!({
                    "run_id": rec.run_id,
                    "consecutive_no_new_draws": transition.counter,
                    "threshold": self.tracker.threshold(),
                    "latest_stored_draw_id": stored_max,
                    "latest_source_draw_id": fetched.latest,
                    "source": source.name(),
                }),
            };
            let result = self.notifier.notify(&event).await;
            rec.notifications.push(DispatchRecord {
                kind: EventKind::Anomaly,
                result,
            });
        }

        Ok(if transition.anomalous {
            RunOutcome::Anomalous
        } else {
            RunOutcome::Success
        })
    }

    /// Primary first; the secondary only when fallback is enabled and the primary failed.
    async fn fetch_with_fallback(
        &self,
        ctx: &AdapterContext,
        view: &StoreView,
    ) -> Result<(Fetched, Arc<dyn DrawProvider>), RunFailure> {
        let primary_err = match self.fetch_new(&self.primary, ctx, view).await {
            Ok(fetched) => return Ok((fetched, Arc::clone(&self.primary))),
            Err(err) => err,
        };

        let fallback = self
            .secondary
            .as_ref()
            .filter(|_| self.settings.fallback_to_secondary);
        let Some(secondary) = fallback else {
            return Err(fetch_failure(&primary_err));
        };

        warn!(
            primary = self.primary.name(),
            secondary = secondary.name(),
            error = %primary_err,
            "primary provider failed; falling back"
        );
        match self.fetch_new(secondary, ctx, view).await {
            Ok(fetched) => Ok((fetched, Arc::clone(secondary))),
            Err(secondary_err) => {
                let mut reported = fetch_failure(&primary_err);
                reported.message =
                    format!("{}; fallback also failed: {secondary_err}", reported.message);
                Err(reported)
            }
        }
    }

    /// Latest draw, every id between the store and it, and any known holes
    /// in the store.
    async fn fetch_new(
        &self,
        provider: &Arc<dyn DrawProvider>,
        ctx: &AdapterContext,
        view: &StoreView,
    ) -> Result<Fetched, FetchError> {
        let latest_row = match fetch_latest(provider.as_ref(), ctx, &self.settings.backoff).await {
            Ok(row) => row,
            Err(FetchError::NotYetAvailable { .. }) => {
                info!(provider = provider.name(), "no draw published yet");
                return Ok(Fetched::default());
            }
            Err(err) => return Err(err),
        };

        // A bad latest row never drives further requests; the validator rejects it.
        let latest = match DrawRecord::try_from(&latest_row) {
            Ok(record) => record.draw_id(),
            Err(defect) => {
                warn!(
                    provider = provider.name(),
                    draw_id = latest_row.draw_id,
                    %defect,
                    "latest row invalid"
                );
                return Ok(Fetched {
                    rows: vec![latest_row],
                    ..Fetched::default()
                });
            }
        };

        let from = view.max.map(|max| max + 1).or(self.settings.backfill_from);
        let ahead: Vec<DrawId> = match from {
            Some(from) if from < latest => (from..latest).collect(),
            _ => Vec::new(),
        };
        if ahead.len() > self.settings.max_backfill {
            return Err(FetchError::structural(
                provider.name(),
                format!(
                    "latest draw {latest} would need {} earlier draws (limit {}); store max is {:?}",
                    ahead.len(),
                    self.settings.max_backfill,
                    view.max
                ),
            ));
        }

        let budget = self.settings.max_backfill - ahead.len();
        let mut holes: Vec<DrawId> = view.gaps.iter().copied().filter(|id| *id != latest).collect();
        if holes.len() > budget {
            warn!(
                provider = provider.name(),
                holes = holes.len(),
                budget,
                "too many holes in the store; retrying the newest only"
            );
            holes = holes.split_off(holes.len() - budget);
        }

        if view.max.is_some_and(|max| latest <= max) {
            // The latest row still goes through merge so a republished draw
            // with different values surfaces as a conflict.
            info!(provider = provider.name(), latest, "source has nothing newer than the store");
        }

        let wanted: Vec<DrawId> = holes.into_iter().chain(ahead).collect();
        let mut fetched = Fetched {
            latest: Some(latest),
            ..Fetched::default()
        };
        if !wanted.is_empty() {
            info!(provider = provider.name(), count = wanted.len(), "fetching missing draws");
            let range = fetch_ids(
                Arc::clone(provider),
                ctx,
                wanted,
                self.settings.backoff,
                self.settings.fetch_concurrency,
            )
            .await;
            if let Some((draw_id, err)) = range.failures.into_iter().next() {
                warn!(provider = provider.name(), draw_id, error = %err, "range fetch failed");
                return Err(err);
            }
            if !range.not_yet_available.is_empty() {
                warn!(
                    provider = provider.name(),
                    missing = ?range.not_yet_available,
                    "source does not serve some draws below its latest; retrying next run"
                );
            }
            fetched.rows = range.rows;
            fetched.missing = range.not_yet_available;
        }
        fetched.rows.push(latest_row);
        Ok(fetched)
    }

    fn reconcile_partner(&self, source: &Arc<dyn DrawProvider>) -> Option<Arc<dyn DrawProvider>> {
        if !self.settings.reconcile {
            return None;
        }
        let secondary = self.secondary.as_ref()?;
        if Arc::ptr_eq(secondary, source) {
            return None;
        }
        Some(Arc::clone(secondary))
    }

    /// Fetch the batch's ids from `secondary` and compare. Secondary trouble
    /// only skips the comparison.
    async fn cross_check(
        &self,
        ctx: &AdapterContext,
        secondary: &Arc<dyn DrawProvider>,
        batch: &ValidatedBatch,
    ) -> DivergenceReport {
        if batch.is_empty() {
            return DivergenceReport::default();
        }

        let range = fetch_ids(
            Arc::clone(secondary),
            ctx,
            batch.ids(),
            self.settings.backoff,
            self.settings.fetch_concurrency,
        )
        .await;

        if !range.failures.is_empty() {
            warn!(
                provider = secondary.name(),
                failures = range.failures.len(),
                "secondary fetch failed; reconciliation skipped"
            );
            return DivergenceReport::default();
        }

        let wanted: BTreeSet<DrawId> = batch.ids().into_iter().collect();
        let mut records = Vec::new();
        for row in range.rows {
            match DrawRecord::try_from(&row) {
                Ok(record) if wanted.contains(&record.draw_id()) => records.push(record),
                Ok(_) => {}
                Err(defect) => warn!(
                    provider = secondary.name(),
                    draw_id = row.draw_id,
                    %defect,
                    "secondary row invalid; not compared"
                ),
            }
        }

        let report = reconcile(batch.records(), &records);
        if !report.only_in_primary.is_empty() {
            info!(
                provider = secondary.name(),
                draws = ?report.only_in_primary,
                "draws not available from secondary"
            );
        }
        report
    }

    async fn notify_divergence(
        &self,
        primary: &Arc<dyn DrawProvider>,
        secondary: &dyn DrawProvider,
        report: &DivergenceReport,
    ) -> DispatchRecord {
        let ids: Vec<DrawId> = report.draw_ids().into_iter().collect();
        warn!(
            primary = primary.name(),
            secondary = secondary.name(),
            draws = ?ids,
            divergences = report.divergences.len(),
            "sources disagree"
        );
        let event = NotificationEvent {
            kind: EventKind::Divergence,
            message: format!(
                "{} and {} disagree on {} field(s) across draws {:?}",
                primary.name(),
                secondary.name(),
                report.divergences.len(),
                ids
            ),
            context: json!({
                "primary": primary.name(),
                "secondary": secondary.name(),
                "policy": self.settings.divergence_policy,
                "divergences": report.divergences,
                "only_in_primary": report.only_in_primary,
                "only_in_secondary": report.only_in_secondary,
            }),
        };
        DispatchRecord {
            kind: EventKind::Divergence,
            result: self.notifier.notify(&event).await,
        }
    }
}

/// Load configuration from the environment and run once.
pub async fn run_sync_once_from_env() -> anyhow::Result<IngestionRun> {
    let config = SyncConfig::from_env()?;
    let pipeline = SyncPipeline::from_config(&config).await?;
    let run = pipeline.run_once().await;
    pipeline.store().close().await;
    Ok(run)
}
