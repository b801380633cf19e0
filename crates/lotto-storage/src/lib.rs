//! Durable storage and HTTP plumbing: draw store, anomaly state, raw captures.

mod artifacts;
mod draws;
mod http;
mod state;

pub use artifacts::{ArtifactStore, CaptureLabel, Captured};
pub use draws::{DrawStore, MergeCounts, RestoreOutcome, StoreError};
pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchedResponse, HttpClientConfig,
    HttpError, HttpFetcher, RetryDisposition,
};
pub use state::{AnomalyState, AnomalyStateFile, StateError};

pub const CRATE_NAME: &str = "lotto-storage";
