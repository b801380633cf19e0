//! Environment-driven run configuration and the `providers.yaml` registry.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use lotto_adapters::{ProviderRole, ProviderSpec};
use lotto_core::DrawId;
use lotto_storage::BackoffPolicy;
use serde::{Deserialize, Serialize};

use crate::notify::{EmailChannel, LogChannel, NotificationChannel, Notifier, TelegramChannel};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DivergencePolicy {
    /// Fail the run before anything is merged.
    #[default]
    Block,
    /// Notify and keep going with the primary rows.
    Warn,
}

impl FromStr for DivergencePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "block" => Ok(Self::Block),
            "warn" => Ok(Self::Warn),
            other => anyhow::bail!("unknown divergence policy {other:?} (expected block|warn)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub state_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub providers_file: PathBuf,
    pub pause_file: PathBuf,
    pub anomaly_threshold: u32,
    pub fetch_max_attempts: usize,
    pub fetch_concurrency: usize,
    pub http_timeout_secs: u64,
    pub store_timeout_secs: u64,
    pub notify_timeout_secs: u64,
    pub backfill_from: Option<DrawId>,
    /// Most draw ids one run may request below the latest draw.
    pub max_backfill: usize,
    pub reconcile: bool,
    pub divergence_policy: DivergencePolicy,
    pub fallback_to_secondary: bool,
    pub capture_raw: bool,
    pub user_agent: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://data/draws.db".to_string(),
            state_dir: PathBuf::from("./state"),
            artifacts_dir: PathBuf::from("./artifacts"),
            reports_dir: PathBuf::from("./reports"),
            providers_file: PathBuf::from("./providers.yaml"),
            pause_file: PathBuf::from("./state/PAUSED"),
            anomaly_threshold: 5,
            fetch_max_attempts: 4,
            fetch_concurrency: 4,
            http_timeout_secs: 20,
            store_timeout_secs: 10,
            notify_timeout_secs: 15,
            backfill_from: None,
            max_backfill: 100,
            reconcile: true,
            divergence_policy: DivergencePolicy::Block,
            fallback_to_secondary: false,
            capture_raw: true,
            user_agent: "lotto-sync/0.1".to_string(),
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env_string(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{key}={raw:?} is invalid: {e}")),
        None => Ok(default),
    }
}

fn parse_flag(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => anyhow::bail!("{key}={raw:?} is invalid: expected true|false|yes|no|on|off|1|0"),
    }
}

fn env_flag(key: &str, default: bool) -> Result<bool> {
    match env_string(key) {
        Some(raw) => parse_flag(key, &raw),
        None => Ok(default),
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let state_dir = env_string("LOTTO_STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.state_dir);
        let pause_file = env_string("LOTTO_PAUSE_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| state_dir.join("PAUSED"));

        let config = Self {
            database_url: env_string("LOTTO_DATABASE_URL").unwrap_or(defaults.database_url),
            artifacts_dir: env_string("LOTTO_ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.artifacts_dir),
            reports_dir: env_string("LOTTO_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.reports_dir),
            providers_file: env_string("LOTTO_PROVIDERS_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.providers_file),
            pause_file,
            state_dir,
            anomaly_threshold: env_parse("LOTTO_ANOMALY_THRESHOLD", defaults.anomaly_threshold)?,
            fetch_max_attempts: env_parse("LOTTO_FETCH_MAX_ATTEMPTS", defaults.fetch_max_attempts)?,
            fetch_concurrency: env_parse("LOTTO_FETCH_CONCURRENCY", defaults.fetch_concurrency)?,
            http_timeout_secs: env_parse("LOTTO_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs)?,
            store_timeout_secs: env_parse("LOTTO_STORE_TIMEOUT_SECS", defaults.store_timeout_secs)?,
            notify_timeout_secs: env_parse(
                "LOTTO_NOTIFY_TIMEOUT_SECS",
                defaults.notify_timeout_secs,
            )?,
            backfill_from: env_string("LOTTO_BACKFILL_FROM")
                .map(|raw| {
                    raw.trim()
                        .parse::<DrawId>()
                        .with_context(|| format!("LOTTO_BACKFILL_FROM={raw:?} is invalid"))
                })
                .transpose()?,
            max_backfill: env_parse("LOTTO_MAX_BACKFILL", defaults.max_backfill)?,
            reconcile: env_flag("LOTTO_RECONCILE", defaults.reconcile)?,
            divergence_policy: env_parse("LOTTO_DIVERGENCE_POLICY", defaults.divergence_policy)?,
            fallback_to_secondary: env_flag(
                "LOTTO_FALLBACK_TO_SECONDARY",
                defaults.fallback_to_secondary,
            )?,
            capture_raw: env_flag("LOTTO_CAPTURE_RAW", defaults.capture_raw)?,
            user_agent: env_string("LOTTO_USER_AGENT").unwrap_or(defaults.user_agent),
        };
        config.check()?;
        Ok(config)
    }

    pub fn check(&self) -> Result<()> {
        if self.anomaly_threshold == 0 {
            anyhow::bail!("LOTTO_ANOMALY_THRESHOLD must be at least 1");
        }
        if !(1..=10).contains(&self.fetch_max_attempts) {
            anyhow::bail!("LOTTO_FETCH_MAX_ATTEMPTS must be within 1..=10");
        }
        if self.fetch_concurrency == 0 {
            anyhow::bail!("LOTTO_FETCH_CONCURRENCY must be at least 1");
        }
        if self.max_backfill == 0 {
            anyhow::bail!("LOTTO_MAX_BACKFILL must be at least 1");
        }
        if self.backfill_from == Some(0) {
            anyhow::bail!("LOTTO_BACKFILL_FROM must be a positive draw id");
        }
        Ok(())
    }

    pub fn anomaly_state_path(&self) -> PathBuf {
        self.state_dir.join("anomaly_state.json")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.state_dir.join("sync.lock")
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: self.fetch_max_attempts,
            ..BackoffPolicy::default()
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }

    pub fn notify_timeout(&self) -> Duration {
        Duration::from_secs(self.notify_timeout_secs)
    }
}

/// Contents of `providers.yaml`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderRegistry {
    pub providers: Vec<ProviderEntry>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderEntry {
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(flatten)]
    pub spec: ProviderSpec,
}

fn enabled_by_default() -> bool {
    true
}

impl ProviderRegistry {
    pub fn parse(yaml: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(yaml).context("parsing provider registry")?;
        registry.check()?;
        Ok(registry)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("in {}", path.display()))
    }

    fn enabled(&self, role: ProviderRole) -> impl Iterator<Item = &ProviderSpec> {
        self.providers
            .iter()
            .filter(move |p| p.enabled && p.spec.role == role)
            .map(|p| &p.spec)
    }

    fn check(&self) -> Result<()> {
        if self.enabled(ProviderRole::Primary).count() != 1 {
            anyhow::bail!("exactly one enabled primary provider is required");
        }
        if self.enabled(ProviderRole::Secondary).count() > 1 {
            anyhow::bail!("at most one enabled secondary provider is supported");
        }
        Ok(())
    }

    pub fn primary(&self) -> Result<&ProviderSpec> {
        self.enabled(ProviderRole::Primary)
            .next()
            .context("no enabled primary provider")
    }

    pub fn secondary(&self) -> Option<&ProviderSpec> {
        self.enabled(ProviderRole::Secondary).next()
    }
}

/// Channel settings read from `NOTIFY_*` variables.
#[derive(Debug, Clone, Default)]
pub struct NotifyConfig {
    pub telegram: Option<TelegramSettings>,
    pub email: Option<EmailSettings>,
    pub log: bool,
}

#[derive(Debug, Clone)]
pub struct TelegramSettings {
    pub api_base: String,
    pub bot_token: String,
    pub chat_id: String,
}

#[derive(Debug, Clone)]
pub struct EmailSettings {
    pub relay_url: String,
    pub api_token: Option<String>,
    pub from: String,
    pub to: Vec<String>,
}

impl NotifyConfig {
    pub fn from_env() -> Result<Self> {
        let telegram = if env_flag("NOTIFY_TELEGRAM_ENABLED", false)? {
            match (
                env_string("NOTIFY_TELEGRAM_BOT_TOKEN"),
                env_string("NOTIFY_TELEGRAM_CHAT_ID"),
            ) {
                (Some(bot_token), Some(chat_id)) => Some(TelegramSettings {
                    api_base: env_string("NOTIFY_TELEGRAM_API_BASE")
                        .unwrap_or_else(|| "https://api.telegram.org".to_string()),
                    bot_token,
                    chat_id,
                }),
                _ => {
                    tracing::warn!("telegram enabled but token or chat id missing; channel disabled");
                    None
                }
            }
        } else {
            None
        };

        let email = if env_flag("NOTIFY_EMAIL_ENABLED", false)? {
            match (
                env_string("NOTIFY_EMAIL_RELAY_URL"),
                env_string("NOTIFY_EMAIL_FROM"),
                env_string("NOTIFY_EMAIL_TO"),
            ) {
                (Some(relay_url), Some(from), Some(to)) => Some(EmailSettings {
                    relay_url,
                    api_token: env_string("NOTIFY_EMAIL_API_TOKEN"),
                    from,
                    to: to
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect(),
                }),
                _ => {
                    tracing::warn!("email enabled but relay url, sender or recipient missing; channel disabled");
                    None
                }
            }
        } else {
            None
        };

        let log = env_flag(
            "NOTIFY_LOG_ENABLED",
            telegram.is_none() && email.is_none(),
        )?;
        Ok(Self {
            telegram,
            email,
            log,
        })
    }

    pub fn build(&self, timeout: Duration) -> Result<Notifier> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building notification http client")?;

        let mut channels: Vec<Arc<dyn NotificationChannel>> = Vec::new();
        if let Some(t) = &self.telegram {
            channels.push(Arc::new(TelegramChannel::new(
                client.clone(),
                t.api_base.clone(),
                t.bot_token.clone(),
                t.chat_id.clone(),
            )));
        }
        if let Some(e) = &self.email {
            channels.push(Arc::new(EmailChannel::new(
                client.clone(),
                e.relay_url.clone(),
                e.api_token.clone(),
                e.from.clone(),
                e.to.clone(),
            )));
        }
        if self.log {
            channels.push(Arc::new(LogChannel));
        }
        Ok(Notifier::new(channels, timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTRY: &str = r#"
providers:
  - name: caixa
    role: primary
    type: http
    latest_url: https://example.test/api/maismilionaria
    draw_url: https://example.test/api/maismilionaria/{id}
    profile:
      version: caixa-json-v1
      format: json
      draw_id: /numero
      date: /dataApuracao
      numbers: /listaDezenas
      specials: /trevosSorteados
  - name: manual
    role: secondary
    type: fixture
    dir: ./data/manual
  - name: mirror
    role: secondary
    enabled: false
    type: fixture
    dir: ./data/mirror
"#;

    #[test]
    fn registry_parses_roles_and_skips_disabled_entries() {
        let registry = ProviderRegistry::parse(REGISTRY).unwrap();
        assert_eq!(registry.primary().unwrap().name, "caixa");
        assert_eq!(registry.secondary().unwrap().name, "manual");
    }

    #[test]
    fn registry_without_primary_is_rejected() {
        let yaml = r#"
providers:
  - name: manual
    role: secondary
    type: fixture
    dir: ./data/manual
"#;
        assert!(ProviderRegistry::parse(yaml).is_err());
    }

    #[test]
    fn divergence_policy_parses_case_insensitively() {
        assert_eq!("WARN".parse::<DivergencePolicy>().unwrap(), DivergencePolicy::Warn);
        assert_eq!("block".parse::<DivergencePolicy>().unwrap(), DivergencePolicy::Block);
        assert!("ignore".parse::<DivergencePolicy>().is_err());
    }

    #[test]
    fn default_config_is_valid() {
        let config = SyncConfig::default();
        config.check().unwrap();
        assert_eq!(config.anomaly_state_path(), PathBuf::from("./state/anomaly_state.json"));
        assert_eq!(config.backoff().max_attempts, 4);
    }

    #[test]
    fn zero_threshold_is_rejected() {
        let config = SyncConfig {
            anomaly_threshold: 0,
            ..SyncConfig::default()
        };
        assert!(config.check().is_err());
    }

    #[test]
    fn flags_accept_common_spellings_in_any_case() {
        for raw in ["1", "true", "TRUE", "Yes", "on", " ON "] {
            assert!(parse_flag("LOTTO_RECONCILE", raw).unwrap(), "{raw:?}");
        }
        for raw in ["0", "false", "No", "OFF"] {
            assert!(!parse_flag("LOTTO_RECONCILE", raw).unwrap(), "{raw:?}");
        }
    }

    #[test]
    fn unrecognised_flag_is_an_error() {
        let err = parse_flag("LOTTO_CAPTURE_RAW", "enabled").unwrap_err();
        assert!(err.to_string().contains("LOTTO_CAPTURE_RAW"));
    }

    #[test]
    fn zero_backfill_cap_is_rejected() {
        let config = SyncConfig {
            max_backfill: 0,
            ..SyncConfig::default()
        };
        assert!(config.check().is_err());
    }

    #[test]
    fn log_channel_is_the_fallback() {
        let notifier = NotifyConfig {
            telegram: None,
            email: None,
            log: true,
        }
        .build(Duration::from_secs(1))
        .unwrap();
        assert_eq!(notifier.channel_names(), vec!["log".to_string()]);
    }
}
