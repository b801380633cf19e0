//! Concrete providers: HTTP endpoints driven by an extraction profile, and
//! directory fixtures for offline runs and tests.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use lotto_core::RawDrawRow;
use lotto_storage::{ArtifactStore, CaptureLabel, HttpError, HttpFetcher, RetryDisposition};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::{
    DrawProvider, ExtractError, ExtractionProfile, FetchError, FetchRequest, FetchTarget,
    ProviderRole,
};

/// One entry of `providers.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSpec {
    pub name: String,
    pub role: ProviderRole,
    #[serde(flatten)]
    pub kind: ProviderKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderKind {
    Http {
        latest_url: String,
        /// Must contain `{id}`.
        draw_url: String,
        profile: ExtractionProfile,
    },
    Fixture {
        dir: PathBuf,
        #[serde(default = "default_fixture_version")]
        version: String,
    },
}

fn default_fixture_version() -> String {
    "fixture-v1".to_string()
}

/// Where raw response bodies are captured, if anywhere. Writes run in the
/// background and are awaited by [`RawCapture::drain`] before the run ends.
#[derive(Debug, Clone)]
pub struct RawCapture {
    store: ArtifactStore,
    tasks: Arc<Mutex<JoinSet<()>>>,
}

impl RawCapture {
    pub fn new(store: ArtifactStore) -> Self {
        Self {
            store,
            tasks: Arc::new(Mutex::new(JoinSet::new())),
        }
    }

    fn tasks(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Persist a body without blocking the fetch; failures are only logged.
    fn spawn(&self, label: CaptureLabel, extension: &'static str, body: Vec<u8>) {
        let store = self.store.clone();
        let mut tasks = self.tasks();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            match store.capture(Utc::now(), &label, extension, &body).await {
                Ok(captured) => debug!(
                    provider = %label.provider,
                    path = %captured.relative_path.display(),
                    fresh = captured.fresh,
                    "raw response captured"
                ),
                Err(err) => warn!(provider = %label.provider, error = %err, "raw capture failed"),
            }
        });
    }

    /// Wait for outstanding captures, giving up after `limit`. Returns how
    /// many were abandoned.
    pub async fn drain(&self, limit: Duration) -> usize {
        let mut tasks = std::mem::take(&mut *self.tasks());
        let finished = tokio::time::timeout(limit, async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(err) = joined {
                    warn!(error = %err, "raw capture task aborted");
                }
            }
        })
        .await;
        if finished.is_err() {
            warn!(pending = tasks.len(), ?limit, "raw captures still pending; abandoning");
        }
        tasks.len()
    }
}

pub struct HttpDrawProvider {
    name: String,
    role: ProviderRole,
    latest_url: String,
    draw_url: String,
    profile: ExtractionProfile,
    fetcher: HttpFetcher,
    capture: Option<RawCapture>,
}

impl HttpDrawProvider {
    pub fn new(
        name: impl Into<String>,
        role: ProviderRole,
        latest_url: impl Into<String>,
        draw_url: impl Into<String>,
        profile: ExtractionProfile,
        fetcher: HttpFetcher,
    ) -> anyhow::Result<Self> {
        let name = name.into();
        let draw_url = draw_url.into();
        if !draw_url.contains("{id}") {
            anyhow::bail!("provider {name}: draw_url must contain an {{id}} placeholder");
        }
        profile
            .check()
            .with_context(|| format!("provider {name}: invalid extraction profile"))?;
        Ok(Self {
            name,
            role,
            latest_url: latest_url.into(),
            draw_url,
            profile,
            fetcher,
            capture: None,
        })
    }

    pub fn with_capture(mut self, capture: RawCapture) -> Self {
        self.capture = Some(capture);
        self
    }

    fn url_for(&self, target: FetchTarget) -> String {
        match target {
            FetchTarget::Latest => self.latest_url.clone(),
            FetchTarget::Draw(id) => self.draw_url.replace("{id}", &id.to_string()),
        }
    }

    fn extension(&self) -> &'static str {
        match self.profile.selectors {
            crate::Selectors::Json(_) => "json",
            crate::Selectors::Html(_) => "html",
        }
    }

    fn capture(&self, request: &FetchRequest, body: &[u8]) {
        if let Some(capture) = &self.capture {
            let label = CaptureLabel {
                provider: self.name.clone(),
                profile_version: self.profile.version.clone(),
                target: request.target.to_string(),
                attempt: request.attempt,
            };
            capture.spawn(label, self.extension(), body.to_vec());
        }
    }
}

/// Map a failed HTTP attempt onto the fetch taxonomy.
pub(crate) fn classify_http_failure(provider: &str, target: FetchTarget, err: &HttpError) -> FetchError {
    if matches!(target, FetchTarget::Draw(_)) && err.status() == Some(404) {
        return FetchError::not_yet_available(provider, target);
    }
    match err.disposition() {
        RetryDisposition::Retryable => FetchError::transient(provider, err.to_string()),
        RetryDisposition::NonRetryable => FetchError::structural(provider, err.to_string()),
    }
}

pub(crate) fn classify_extract_failure(provider: &str, err: &ExtractError) -> FetchError {
    if err.is_transient() {
        FetchError::transient(provider, err.to_string())
    } else {
        FetchError::structural(provider, err.to_string())
    }
}

/// A row for a specific draw must carry that draw's id.
fn check_target(provider: &str, target: FetchTarget, row: RawDrawRow) -> Result<RawDrawRow, FetchError> {
    match target {
        FetchTarget::Draw(id) if row.draw_id != i64::from(id) => Err(FetchError::structural(
            provider,
            format!("requested draw {id} but response carries draw {}", row.draw_id),
        )),
        _ => Ok(row),
    }
}

#[async_trait]
impl DrawProvider for HttpDrawProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> ProviderRole {
        self.role
    }

    fn profile_version(&self) -> &str {
        &self.profile.version
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<RawDrawRow, FetchError> {
        let url = self.url_for(request.target);
        match self.fetcher.get(&url).await {
            Ok(resp) => {
                self.capture(request, &resp.body);
                let row = self
                    .profile
                    .extract(&resp.body)
                    .map_err(|err| classify_extract_failure(&self.name, &err))?;
                check_target(&self.name, request.target, row)
            }
            Err(err) => {
                if let Some(body) = err.body() {
                    self.capture(request, body);
                }
                Err(classify_http_failure(&self.name, request.target, &err))
            }
        }
    }
}

/// Reads `{dir}/{draw_id}.json`, each holding one raw row. The latest draw is
/// the highest id present.
pub struct FixtureProvider {
    name: String,
    role: ProviderRole,
    version: String,
    dir: PathBuf,
}

impl FixtureProvider {
    pub fn new(name: impl Into<String>, role: ProviderRole, dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            role,
            version: default_fixture_version(),
            dir: dir.into(),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    async fn latest_id(&self) -> Result<Option<u32>, FetchError> {
        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(|e| {
            FetchError::structural(&self.name, format!("reading {}: {e}", self.dir.display()))
        })?;
        let mut latest = None;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| FetchError::transient(&self.name, e.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let id = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u32>().ok());
            latest = latest.max(id);
        }
        Ok(latest)
    }

    async fn read_row(&self, id: u32) -> Result<RawDrawRow, FetchError> {
        let path = self.dir.join(format!("{id}.json"));
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(FetchError::not_yet_available(&self.name, FetchTarget::Draw(id)));
            }
            Err(err) => return Err(FetchError::transient(&self.name, err.to_string())),
        };
        serde_json::from_slice(&bytes).map_err(|e| {
            FetchError::structural(&self.name, format!("{}: {e}", path.display()))
        })
    }
}

#[async_trait]
impl DrawProvider for FixtureProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> ProviderRole {
        self.role
    }

    fn profile_version(&self) -> &str {
        &self.version
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<RawDrawRow, FetchError> {
        let row = match request.target {
            FetchTarget::Latest => {
                let Some(id) = self.latest_id().await? else {
                    return Err(FetchError::not_yet_available(&self.name, FetchTarget::Latest));
                };
                self.read_row(id).await?
            }
            FetchTarget::Draw(id) => self.read_row(id).await?,
        };
        check_target(&self.name, request.target, row)
    }
}

/// Build a provider from its configuration entry.
pub fn build_provider(
    spec: &ProviderSpec,
    fetcher: &HttpFetcher,
    capture: Option<&RawCapture>,
) -> anyhow::Result<Arc<dyn DrawProvider>> {
    match &spec.kind {
        ProviderKind::Http {
            latest_url,
            draw_url,
            profile,
        } => {
            let mut provider = HttpDrawProvider::new(
                spec.name.clone(),
                spec.role,
                latest_url.clone(),
                draw_url.clone(),
                profile.clone(),
                fetcher.clone(),
            )?;
            if let Some(capture) = capture {
                provider = provider.with_capture(capture.clone());
            }
            Ok(Arc::new(provider))
        }
        ProviderKind::Fixture { dir, version } => Ok(Arc::new(
            FixtureProvider::new(spec.name.clone(), spec.role, dir.clone())
                .with_version(version.clone()),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{fetch_latest, fetch_with_retry, AdapterContext, JsonSelectors, Selectors};
    use lotto_storage::{BackoffPolicy, HttpClientConfig};
    use tempfile::tempdir;
    use uuid::Uuid;

    fn json_profile() -> ExtractionProfile {
        ExtractionProfile {
            version: "caixa-v1".into(),
            selectors: Selectors::Json(JsonSelectors {
                draw_id: "/numero".into(),
                date: "/dataApuracao".into(),
                numbers: "/listaDezenas".into(),
                specials: "/trevosSorteados".into(),
            }),
        }
    }

    fn status_error(status: u16, disposition: RetryDisposition) -> HttpError {
        HttpError::Status {
            status,
            url: "https://example.test/draw/9".into(),
            disposition,
            body: Vec::new(),
        }
    }

    fn write_fixture(dir: &std::path::Path, id: u32) {
        let row = RawDrawRow {
            draw_id: i64::from(id),
            date: Some("2025-01-15".into()),
            numbers: vec![3, 11, 19, 27, 35, 43],
            specials: vec![2, 5],
        };
        std::fs::write(dir.join(format!("{id}.json")), serde_json::to_vec(&row).unwrap()).unwrap();
    }

    #[test]
    fn missing_draw_is_not_yet_available_but_missing_latest_is_structural() {
        let err = status_error(404, RetryDisposition::NonRetryable);
        assert!(matches!(
            classify_http_failure("p", FetchTarget::Draw(9), &err),
            FetchError::NotYetAvailable { .. }
        ));
        assert!(matches!(
            classify_http_failure("p", FetchTarget::Latest, &err),
            FetchError::StructuralMismatch { .. }
        ));
    }

    #[test]
    fn server_errors_map_to_transient() {
        let err = status_error(503, RetryDisposition::Retryable);
        assert!(classify_http_failure("p", FetchTarget::Latest, &err).is_transient());
    }

    #[test]
    fn unrendered_page_is_transient_and_missing_field_is_structural() {
        let not_rendered = ExtractError::NotRendered {
            selector: "div.resultado".into(),
        };
        assert!(classify_extract_failure("p", &not_rendered).is_transient());
        let missing = ExtractError::Missing { field: "numbers" };
        assert!(matches!(
            classify_extract_failure("p", &missing),
            FetchError::StructuralMismatch { .. }
        ));
    }

    #[test]
    fn http_provider_requires_id_placeholder() {
        let fetcher = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let result = HttpDrawProvider::new(
            "caixa",
            ProviderRole::Primary,
            "https://example.test/latest",
            "https://example.test/draw",
            json_profile(),
            fetcher,
        );
        assert!(result.is_err());
    }

    #[test]
    fn http_provider_builds_draw_urls() {
        let fetcher = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let provider = HttpDrawProvider::new(
            "caixa",
            ProviderRole::Primary,
            "https://example.test/latest",
            "https://example.test/draw/{id}",
            json_profile(),
            fetcher,
        )
        .unwrap();
        assert_eq!(provider.url_for(FetchTarget::Draw(276)), "https://example.test/draw/276");
        assert_eq!(provider.url_for(FetchTarget::Latest), "https://example.test/latest");
    }

    #[tokio::test]
    async fn fixture_provider_serves_latest_and_specific_draws() {
        let dir = tempdir().unwrap();
        write_fixture(dir.path(), 274);
        write_fixture(dir.path(), 276);
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let provider = FixtureProvider::new("fixture", ProviderRole::Secondary, dir.path());
        let ctx = AdapterContext::new(Uuid::new_v4());
        let policy = BackoffPolicy {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        };

        let latest = fetch_latest(&provider, &ctx, &policy).await.unwrap();
        assert_eq!(latest.draw_id, 276);

        let missing = fetch_with_retry(&provider, &ctx, FetchTarget::Draw(275), &policy)
            .await
            .unwrap_err();
        assert!(matches!(missing, FetchError::NotYetAvailable { .. }));
    }

    #[tokio::test]
    async fn fixture_with_wrong_id_is_structural() {
        let dir = tempdir().unwrap();
        write_fixture(dir.path(), 10);
        std::fs::rename(dir.path().join("10.json"), dir.path().join("11.json")).unwrap();

        let provider = FixtureProvider::new("fixture", ProviderRole::Primary, dir.path());
        let request = FetchRequest {
            run_id: Uuid::new_v4(),
            target: FetchTarget::Draw(11),
            attempt: 0,
        };
        assert!(matches!(
            provider.fetch(&request).await,
            Err(FetchError::StructuralMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn empty_fixture_directory_has_nothing_published() {
        let dir = tempdir().unwrap();
        let provider = FixtureProvider::new("fixture", ProviderRole::Primary, dir.path());
        let request = FetchRequest {
            run_id: Uuid::new_v4(),
            target: FetchTarget::Latest,
            attempt: 0,
        };
        assert!(matches!(
            provider.fetch(&request).await,
            Err(FetchError::NotYetAvailable { .. })
        ));
    }

    #[tokio::test]
    async fn drained_captures_are_on_disk() {
        let dir = tempdir().unwrap();
        let capture = RawCapture::new(ArtifactStore::new(dir.path()));
        for attempt in 0..3 {
            capture.spawn(
                CaptureLabel {
                    provider: "caixa".into(),
                    profile_version: "caixa-v1".into(),
                    target: "latest".into(),
                    attempt,
                },
                "json",
                format!("{{\"attempt\":{attempt}}}").into_bytes(),
            );
        }

        assert_eq!(capture.drain(Duration::from_secs(5)).await, 0);
        let files: usize = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|day| std::fs::read_dir(day.unwrap().path().join("caixa")).unwrap().count())
            .sum();
        assert_eq!(files, 3);
        assert_eq!(capture.drain(Duration::from_secs(1)).await, 0);
    }

    #[test]
    fn provider_specs_parse_from_yaml_shaped_json() {
        let spec: ProviderSpec = serde_json::from_value(serde_json::json!({
            "name": "caixa",
            "role": "primary",
            "type": "http",
            "latest_url": "https://example.test/latest",
            "draw_url": "https://example.test/draw/{id}",
            "profile": {
                "version": "caixa-v1",
                "format": "json",
                "draw_id": "/numero",
                "date": "/dataApuracao",
                "numbers": "/listaDezenas",
                "specials": "/trevosSorteados"
            }
        }))
        .unwrap();
        assert_eq!(spec.role, ProviderRole::Primary);
        assert!(matches!(spec.kind, ProviderKind::Http { ref profile, .. } if *profile == json_profile()));
    }
}
