//! Consecutive "no new draw" counter with a once-per-crossing alert latch.

use chrono::Utc;
use lotto_storage::{AnomalyState, AnomalyStateFile, StateError};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("anomaly threshold must be at least 1")]
    InvalidThreshold,
    #[error(transparent)]
    State(#[from] StateError),
}

/// Result of one counter update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub counter: u32,
    pub anomalous: bool,
    /// True only on the update that first reached the threshold since the last reset.
    pub crossed: bool,
}

#[derive(Debug, Clone)]
pub struct AnomalyTracker {
    file: AnomalyStateFile,
    threshold: u32,
}

impl AnomalyTracker {
    pub fn new(file: AnomalyStateFile, threshold: u32) -> Result<Self, TrackerError> {
        if threshold == 0 {
            return Err(TrackerError::InvalidThreshold);
        }
        Ok(Self { file, threshold })
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub async fn state(&self) -> Result<AnomalyState, TrackerError> {
        Ok(self.file.load().await?)
    }

    pub async fn record_no_new_draws(&self) -> Result<Transition, TrackerError> {
        let mut state = self.file.load().await?;
        state.consecutive_no_new_draws = state.consecutive_no_new_draws.saturating_add(1);
        let anomalous = state.consecutive_no_new_draws >= self.threshold;
        let crossed = anomalous && !state.alert_sent;
        if crossed {
            state.alert_sent = true;
        }
        state.updated_at = Some(Utc::now());
        self.file.save(&state).await?;

        info!(
            counter = state.consecutive_no_new_draws,
            threshold = self.threshold,
            anomalous,
            crossed,
            "no new draws this run"
        );
        Ok(Transition {
            counter: state.consecutive_no_new_draws,
            anomalous,
            crossed,
        })
    }

    pub async fn record_new_draws(&self) -> Result<Transition, TrackerError> {
        let previous = self.file.load().await?;
        let state = AnomalyState {
            consecutive_no_new_draws: 0,
            alert_sent: false,
            updated_at: Some(Utc::now()),
        };
        self.file.save(&state).await?;
        if previous.consecutive_no_new_draws > 0 {
            info!(previous = previous.consecutive_no_new_draws, "anomaly counter reset");
        }
        Ok(Transition {
            counter: 0,
            anomalous: false,
            crossed: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    fn tracker(dir: &std::path::Path, threshold: u32) -> AnomalyTracker {
        let file = AnomalyStateFile::new(dir.join("anomaly_state.json"), Duration::from_secs(1));
        AnomalyTracker::new(file, threshold).unwrap()
    }

    #[test]
    fn zero_threshold_is_rejected() {
        let file = AnomalyStateFile::new("unused.json", Duration::from_secs(1));
        assert!(matches!(
            AnomalyTracker::new(file, 0),
            Err(TrackerError::InvalidThreshold)
        ));
    }

    #[tokio::test]
    async fn crossing_fires_exactly_once_per_streak() {
        let dir = tempdir().unwrap();
        let tracker = tracker(dir.path(), 3);

        let mut crossings = 0;
        for expected in 1..=6u32 {
            let t = tracker.record_no_new_draws().await.unwrap();
            assert_eq!(t.counter, expected);
            assert_eq!(t.anomalous, expected >= 3);
            crossings += usize::from(t.crossed);
        }
        assert_eq!(crossings, 1);
    }

    #[tokio::test]
    async fn reset_rearms_the_alert() {
        let dir = tempdir().unwrap();
        let tracker = tracker(dir.path(), 1);

        assert!(tracker.record_no_new_draws().await.unwrap().crossed);
        assert!(!tracker.record_no_new_draws().await.unwrap().crossed);

        tracker.record_new_draws().await.unwrap();
        let state = tracker.state().await.unwrap();
        assert_eq!(state.consecutive_no_new_draws, 0);
        assert!(!state.alert_sent);

        assert!(tracker.record_no_new_draws().await.unwrap().crossed);
    }

    #[tokio::test]
    async fn counter_survives_a_new_tracker_instance() {
        let dir = tempdir().unwrap();
        tracker(dir.path(), 5).record_no_new_draws().await.unwrap();
        tracker(dir.path(), 5).record_no_new_draws().await.unwrap();
        let state = tracker(dir.path(), 5).state().await.unwrap();
        assert_eq!(state.consecutive_no_new_draws, 2);
    }
}
