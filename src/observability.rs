use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

use crate::error::{ForgeError, ForgeResult};
use crate::security::write_atomic;

#[derive(Debug, Default, Serialize, Clone)]
pub struct MetricsSnapshot {
    pub stages: BTreeMap<String, StageMetrics>,
    pub total_duration_ms: f64,
    pub stages_succeeded: u64,
    pub stages_failed: u64,
    pub stages_skipped: u64,
}

#[derive(Debug, Default, Serialize, Clone)]
pub struct StageMetrics {
    pub calls: u64,
    pub total_duration_ms: f64,
    pub max_duration_ms: f64,
    pub last_outcome: Option<StageOutcome>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Default, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsSnapshot>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsSnapshot::default())),
        }
    }

    /// Time a stage until the returned timer is finished or dropped. A timer
    /// dropped without an outcome counts as a failure.
    pub fn start_stage(&self, stage_name: &str) -> StageTimer {
        StageTimer {
            stage: stage_name.to_string(),
            started_at: Instant::now(),
            collector: self.inner.clone(),
            outcome: None,
            recorded: false,
        }
    }

    pub fn record_skipped(&self, stage_name: &str) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.stages_skipped += 1;
            guard
                .stages
                .entry(stage_name.to_string())
                .or_default()
                .last_outcome = Some(StageOutcome::Skipped);
        }
    }

    pub fn record_total_duration(&self, duration: Duration) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.total_duration_ms = duration.as_secs_f64() * 1_000.0;
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn reset(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            *guard = MetricsSnapshot::default();
        }
    }
}

pub struct StageTimer {
    stage: String,
    started_at: Instant,
    collector: Arc<Mutex<MetricsSnapshot>>,
    outcome: Option<StageOutcome>,
    recorded: bool,
}

impl StageTimer {
    pub fn finish(mut self, outcome: StageOutcome) -> Duration {
        self.outcome = Some(outcome);
        self.record()
    }

    fn record(&mut self) -> Duration {
        let duration = self.started_at.elapsed();
        if self.recorded {
            return duration;
        }
        let outcome = self.outcome.unwrap_or(StageOutcome::Failed);
        if let Ok(mut guard) = self.collector.lock() {
            match outcome {
                StageOutcome::Succeeded => guard.stages_succeeded += 1,
                StageOutcome::Failed => guard.stages_failed += 1,
                StageOutcome::Skipped => guard.stages_skipped += 1,
            }
            let metrics = guard.stages.entry(self.stage.clone()).or_default();
            metrics.calls += 1;
            let duration_ms = duration.as_secs_f64() * 1_000.0;
            metrics.total_duration_ms += duration_ms;
            if duration_ms > metrics.max_duration_ms {
                metrics.max_duration_ms = duration_ms;
            }
            metrics.last_outcome = Some(outcome);
        }
        debug!(
            stage = self.stage.as_str(),
            duration_ms = duration.as_secs_f64() * 1_000.0,
            ?outcome,
            "Stage duration recorded"
        );
        self.recorded = true;
        duration
    }
}

impl Drop for StageTimer {
    fn drop(&mut self) {
        self.record();
    }
}

pub fn log_snapshot(snapshot: &MetricsSnapshot) {
    info!(
        total_duration_ms = snapshot.total_duration_ms,
        succeeded = snapshot.stages_succeeded,
        failed = snapshot.stages_failed,
        skipped = snapshot.stages_skipped,
        "Pipeline metrics summary"
    );
    for (stage, metrics) in &snapshot.stages {
        info!(
            stage = stage.as_str(),
            calls = metrics.calls,
            total_ms = metrics.total_duration_ms,
            outcome = ?metrics.last_outcome,
            "Stage metrics"
        );
    }
}

pub fn write_snapshot(snapshot: &MetricsSnapshot, path: &Path) -> ForgeResult<()> {
    let json = serde_json::to_vec_pretty(snapshot).map_err(|err| ForgeError::Config {
        path: path.to_path_buf(),
        detail: format!("failed to serialise metrics snapshot: {err}"),
    })?;
    write_atomic(path, &json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropped_timer_counts_as_failure() {
        let collector = MetricsCollector::new();
        {
            let _timer = collector.start_stage("pin");
        }
        collector
            .start_stage("build-assets")
            .finish(StageOutcome::Succeeded);
        collector.record_skipped("build-library");

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.stages_failed, 1);
        assert_eq!(snapshot.stages_succeeded, 1);
        assert_eq!(snapshot.stages_skipped, 1);
        assert_eq!(
            snapshot.stages["build-assets"].last_outcome,
            Some(StageOutcome::Succeeded)
        );
        assert_eq!(snapshot.stages["build-library"].calls, 0);
    }

    #[test]
    fn snapshot_file_holds_the_counters() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("metrics").join("build.json");
        let collector = MetricsCollector::new();
        collector.start_stage("pin").finish(StageOutcome::Succeeded);
        collector.record_skipped("validate");

        write_snapshot(&collector.snapshot(), &path).unwrap();

        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(json["stages_succeeded"], 1);
        assert_eq!(json["stages_skipped"], 1);
        assert_eq!(json["stages"]["pin"]["calls"], 1);
    }
}
