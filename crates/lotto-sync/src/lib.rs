//! Ingestion pipeline: validation, reconciliation, anomaly tracking,
//! notification and run reports.

pub mod anomaly;
pub mod config;
pub mod maintenance;
pub mod notify;
pub mod pipeline;
pub mod reconcile;
pub mod report;
pub mod validate;

pub use anomaly::{AnomalyTracker, TrackerError, Transition};
pub use config::{DivergencePolicy, NotifyConfig, ProviderRegistry, SyncConfig};
pub use maintenance::{AlwaysOpen, MaintenanceGate, PauseFile};
pub use notify::{
    EmailChannel, LogChannel, NotificationChannel, Notifier, NotifyError, TelegramChannel,
};
pub use pipeline::{run_sync_once_from_env, PipelineSettings, SyncPipeline};
pub use reconcile::reconcile;
pub use report::{load_recent_runs, report_markdown, write_report};
pub use validate::{audit, validate, AuditFinding, ValidatedBatch, ValidationError, ValidationReason};

pub const CRATE_NAME: &str = "lotto-sync";
